use std::{ffi::OsString, path::Path, process::Stdio};

use common::{MpBlatError, MpResult};
use tokio::process::Command;

/// Cómo invocar blat para una partición:
/// `<bin> <referencia> <partición> <opciones...> <salida>`
#[derive(Debug, Clone)]
pub struct BlatCommand {
    bin: String,
    options: Vec<String>,
}

impl BlatCommand {
    /// `options` se separa en palabras con las reglas de comillas de una
    /// shell POSIX, pero nunca se ejecuta una shell: no hay expansión de
    /// variables ni de globs.
    pub fn new(bin: impl Into<String>, options: &str) -> MpResult<Self> {
        Ok(Self {
            bin: bin.into(),
            options: split_options(options)?,
        })
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn args(&self, reference: &Path, partition: &Path, output: &Path) -> Vec<OsString> {
        let mut args = Vec::with_capacity(self.options.len() + 3);
        args.push(reference.as_os_str().to_owned());
        args.push(partition.as_os_str().to_owned());
        args.extend(self.options.iter().map(OsString::from));
        args.push(output.as_os_str().to_owned());
        args
    }

    /// Comando listo para lanzar: stdout descartado, stderr capturado y el
    /// proceso se mata si se suelta el handle.
    pub fn command(&self, reference: &Path, partition: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(self.args(reference, partition, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

pub fn split_options(options: &str) -> MpResult<Vec<String>> {
    shlex::split(options).ok_or_else(|| {
        MpBlatError::input(
            Path::new("--blat_options"),
            format!("comillas sin cerrar en {:?}", options),
        )
    })
}
