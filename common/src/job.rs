use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::error::{MpBlatError, MpResult};
use crate::task::WorkerTask;

pub type JobId = String;

pub const DEFAULT_NUM_PROC: u32 = 1;
pub const DEFAULT_BLAT_BIN: &str = "blat";
pub const DEFAULT_SAMTOOLS_BIN: &str = "samtools";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// El texto que produce blat, tal cual (PSL, MAF, ...)
    #[default]
    Text,
    /// SAM ordenado y convertido con samtools, más su `.bai`
    Bam,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub reference: PathBuf,
    pub fasta: PathBuf,
    pub output: PathBuf,

    /// Cantidad de partes / procesos de blat en paralelo
    pub num_proc: u32,

    /// Directorio base donde se crea el workspace temporal
    pub tmp_path: PathBuf,

    pub blat_bin: String,
    /// Opciones extra para blat, se pasan tal cual a cada worker
    pub blat_options: String,
    pub samtools_bin: String,

    pub output_kind: OutputKind,
    pub keep_tmp: bool,
}

impl JobRequest {
    pub fn new(reference: impl Into<PathBuf>, fasta: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            reference: reference.into(),
            fasta: fasta.into(),
            output: output.into(),
            num_proc: DEFAULT_NUM_PROC,
            tmp_path: std::env::temp_dir(),
            blat_bin: DEFAULT_BLAT_BIN.to_string(),
            blat_options: String::new(),
            samtools_bin: DEFAULT_SAMTOOLS_BIN.to_string(),
            output_kind: OutputKind::Text,
            keep_tmp: false,
        }
    }

    /// Chequeos baratos antes de crear nada en disco.
    pub fn validate(&self) -> MpResult<()> {
        if self.num_proc == 0 {
            return Err(MpBlatError::input(&self.fasta, "num_proc debe ser >= 1"));
        }
        for path in [&self.reference, &self.fasta] {
            if !path.is_file() {
                return Err(MpBlatError::input(path, "no existe o no es un archivo"));
            }
        }
        if self.output == self.fasta || self.output == self.reference {
            return Err(MpBlatError::input(
                &self.output,
                "la salida sobrescribiría un archivo de entrada",
            ));
        }
        Ok(())
    }
}

/// Estados de una invocación:
/// INIT → SPLITTING → DISPATCHING → (ALL_SUCCEEDED | ANY_FAILED) → MERGING → DONE | FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Init,
    Splitting,
    Dispatching,
    AllSucceeded,
    AnyFailed,
    Merging,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (Done, _) | (Failed, _) => false,
            // cualquier etapa puede abortar
            (_, Failed) => true,
            (Init, Splitting) => true,
            (Splitting, Dispatching) => true,
            (Dispatching, AllSucceeded) | (Dispatching, AnyFailed) => true,
            (AllSucceeded, Merging) => true,
            (Merging, Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub status: JobStatus,

    pub reference: PathBuf,
    pub fasta: PathBuf,
    pub output: PathBuf,
    pub num_proc: u32,
    pub blat_options: String,

    /// Workspace usado; sólo queda en disco con keep_tmp
    pub workspace: Option<PathBuf>,
    /// Archivos publicados (salida y, con BAM, su índice)
    pub published: Vec<PathBuf>,
    pub error: Option<String>,

    /// -------- Métricas del job --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub cancelled_tasks: u32,
    pub tasks: Vec<WorkerTask>,
}

impl JobInfo {
    /// Escribe el reporte del job como JSON legible.
    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = fs::File::create(path)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        Ok(())
    }
}
