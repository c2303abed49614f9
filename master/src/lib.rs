pub mod monitor;
pub mod pipeline;
pub mod state;

pub use pipeline::{run_job, run_job_with, JobRun};
pub use state::JobTracker;
