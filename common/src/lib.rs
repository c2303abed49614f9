//! Tipos y etapas compartidas de mp_blat: división del fasta, workspace
//! temporal, merge de resultados y el modelo de jobs/tareas.

pub mod error;
pub mod faidx;
pub mod fasta;
pub mod job;
pub mod merge;
pub mod task;
pub mod workspace;

pub use error::{MpBlatError, MpResult};
pub use job::{JobId, JobInfo, JobRequest, JobStatus, OutputKind};
pub use task::{Partition, TaskId, TaskStatus, WorkerTask};
pub use workspace::{Workspace, WorkspaceLayout};
