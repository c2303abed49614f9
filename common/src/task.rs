use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::error::MpBlatError;

/// Índice 1-based de la partición que procesa la tarea.
pub type TaskId = u32;

/// Representa una partición física (archivo en disco) del fasta de entrada.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: TaskId,
    pub path: PathBuf,
    /// Cantidad de registros fasta dentro del archivo
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    /// No llegó a terminar por sí sola: se canceló por el fallo de otra
    /// tarea o por una señal.
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed { .. })
    }
}

/// Una partición + la ruta donde su worker deja la salida parcial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    pub id: TaskId,
    pub partition: Partition,
    pub output_path: PathBuf,
    pub status: TaskStatus,
    pub elapsed_ms: Option<u64>,
}

impl WorkerTask {
    pub fn new(partition: Partition, output_path: PathBuf) -> Self {
        Self {
            id: partition.id,
            partition,
            output_path,
            status: TaskStatus::Pending,
            elapsed_ms: None,
        }
    }

    pub fn finish(&mut self, status: TaskStatus, elapsed: Duration) {
        self.status = status;
        self.elapsed_ms = Some(elapsed.as_millis() as u64);
    }

    /// Convierte una tarea fallida en el error que se reporta al usuario.
    pub fn to_error(&self, program: &str) -> Option<MpBlatError> {
        match &self.status {
            TaskStatus::Failed { exit_code, stderr } => Some(MpBlatError::ToolExecution {
                task: self.id,
                partition: self.partition.path.clone(),
                program: program.to_string(),
                exit_code: *exit_code,
                stderr: stderr.clone(),
            }),
            _ => None,
        }
    }
}
