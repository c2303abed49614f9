use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
};

use crate::task::TaskId;

pub type MpResult<T> = Result<T, MpBlatError>;

/// Errores de una invocación de mp_blat, uno por etapa del flujo.
#[derive(Debug)]
pub enum MpBlatError {
    /// El fasta (o la referencia) no se puede leer o está mal formado.
    InputRead { path: PathBuf, reason: String },
    /// Un worker terminó con código distinto de cero o no se pudo lanzar.
    ToolExecution {
        task: TaskId,
        partition: PathBuf,
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    /// Falta una salida parcial, no se puede leer, o falló samtools.
    Merge { reason: String },
    /// No se pudo crear o borrar el directorio temporal.
    Workspace { path: PathBuf, source: io::Error },
    /// Llegó una señal de terminación antes de publicar el resultado.
    Interrupted,
}

impl MpBlatError {
    pub fn input(path: &Path, reason: impl Into<String>) -> Self {
        MpBlatError::InputRead {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn merge(reason: impl Into<String>) -> Self {
        MpBlatError::Merge {
            reason: reason.into(),
        }
    }

    pub fn workspace(path: &Path, source: io::Error) -> Self {
        MpBlatError::Workspace {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl fmt::Display for MpBlatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MpBlatError::InputRead { path, reason } => {
                write!(f, "error leyendo la entrada {}: {}", path.display(), reason)
            }
            MpBlatError::ToolExecution {
                task,
                partition,
                program,
                exit_code,
                stderr,
            } => {
                match exit_code {
                    Some(code) => write!(
                        f,
                        "{} falló en la partición {} ({}) con código {}",
                        program,
                        task,
                        partition.display(),
                        code
                    )?,
                    None => write!(
                        f,
                        "{} falló en la partición {} ({}) sin código de salida",
                        program,
                        task,
                        partition.display()
                    )?,
                }
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr)?;
                }
                Ok(())
            }
            MpBlatError::Merge { reason } => write!(f, "error en el merge de resultados: {}", reason),
            MpBlatError::Workspace { path, source } => write!(
                f,
                "error en el directorio temporal {}: {}",
                path.display(),
                source
            ),
            MpBlatError::Interrupted => write!(f, "ejecución interrumpida por una señal"),
        }
    }
}

impl Error for MpBlatError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MpBlatError::Workspace { source, .. } => Some(source),
            _ => None,
        }
    }
}
