use anyhow::Context;
use clap::{Parser, ValueEnum};
use common::{
    job::{DEFAULT_BLAT_BIN, DEFAULT_NUM_PROC, DEFAULT_SAMTOOLS_BIN},
    JobRequest, MpBlatError, OutputKind,
};
use std::{env, path::PathBuf, process::ExitCode};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mp_blat")]
#[command(about = "Corre blat en paralelo partiendo el fasta de consulta")]
pub struct Cli {
    /// Referencia (fasta o 2bit) contra la que alinear
    #[arg(value_name = "REFERENCIA")]
    pub reference: PathBuf,

    /// Fasta de consulta a partir en partes
    #[arg(value_name = "FASTA")]
    pub fasta: PathBuf,

    /// Archivo de salida final
    #[arg(value_name = "SALIDA")]
    pub output: PathBuf,

    /// Cantidad de procesos de blat en paralelo
    #[arg(short = 'p', long = "num_proc", default_value_t = DEFAULT_NUM_PROC,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub num_proc: u32,

    /// Directorio base para los archivos temporales
    #[arg(long = "tmp_path", value_name = "DIR")]
    pub tmp_path: Option<PathBuf>,

    #[arg(long = "blat_bin", env = "BLAT_BIN", default_value = DEFAULT_BLAT_BIN)]
    pub blat_bin: String,

    /// Opciones extra para blat, entre comillas (ej: "-t=dnax -q=prot")
    #[arg(long = "blat_options", default_value = "", allow_hyphen_values = true)]
    pub blat_options: String,

    #[arg(long = "samtools_bin", env = "SAMTOOLS_BIN", default_value = DEFAULT_SAMTOOLS_BIN)]
    pub samtools_bin: String,

    /// Formato final: el texto de blat o BAM (auto: BAM si la salida termina en .bam)
    #[arg(long = "output_format", value_enum, default_value_t = FormatArg::Auto)]
    pub output_format: FormatArg,

    /// No borrar el directorio temporal al terminar
    #[arg(long = "keep_tmp")]
    pub keep_tmp: bool,

    /// Escribe un reporte JSON de la corrida
    #[arg(long = "report", value_name = "JSON")]
    pub report: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Auto,
    #[value(alias = "psl")]
    Text,
    Bam,
}

impl Cli {
    pub fn output_kind(&self) -> OutputKind {
        match self.output_format {
            FormatArg::Text => OutputKind::Text,
            FormatArg::Bam => OutputKind::Bam,
            FormatArg::Auto => {
                let is_bam = self
                    .output
                    .extension()
                    .map(|e| e.eq_ignore_ascii_case("bam"))
                    .unwrap_or(false);
                if is_bam {
                    OutputKind::Bam
                } else {
                    OutputKind::Text
                }
            }
        }
    }

    pub fn into_request(self) -> JobRequest {
        let output_kind = self.output_kind();
        let mut req = JobRequest::new(self.reference, self.fasta, self.output);
        req.num_proc = self.num_proc;
        req.tmp_path = self.tmp_path.unwrap_or_else(env::temp_dir);
        req.blat_bin = self.blat_bin;
        req.blat_options = self.blat_options;
        req.samtools_bin = self.samtools_bin;
        req.output_kind = output_kind;
        req.keep_tmp = self.keep_tmp;
        req
    }
}

pub async fn run(cli: Cli) -> ExitCode {
    let report = cli.report.clone();
    let run = master::run_job(cli.into_request()).await;

    if let Some(path) = &report {
        match run.info.write_json(path).with_context(|| format!("escribiendo {}", path.display())) {
            Ok(()) => info!("reporte escrito en {}", path.display()),
            Err(e) => warn!("no se pudo escribir el reporte: {e:#}"),
        }
    }

    match run.result {
        Ok(published) => {
            println!("Job {} terminado:", run.info.id);
            for path in &published {
                println!("  {}", path.display());
            }
            if let Some(ws) = run.info.workspace.as_ref().filter(|ws| ws.exists()) {
                println!("  temporales: {}", ws.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("mp_blat: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Código de salida según la etapa que falló.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<MpBlatError>() {
        Some(MpBlatError::InputRead { .. }) => 2,
        Some(MpBlatError::ToolExecution { .. }) => 3,
        Some(MpBlatError::Merge { .. }) => 4,
        Some(MpBlatError::Workspace { .. }) => 5,
        Some(MpBlatError::Interrupted) => 130,
        None => 1,
    }
}
