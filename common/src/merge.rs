use std::{
    ffi::OsStr,
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{MpBlatError, MpResult};

/// Líneas de encabezado de un PSL de blat ("psLayout version 3" + columnas).
pub const PSL_HEADER_LINES: usize = 5;

/// Formato de salida de blat (`-out=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Psl,
    Pslx,
    Axt,
    Maf,
    Sim4,
    Wublast,
    Blast,
    Blast8,
    Blast9,
    /// Para binarios compatibles con blat que emiten SAM.
    Sam,
}

impl OutputFormat {
    /// Busca `-out=<fmt>` en las opciones; el último gana. Por defecto PSL.
    pub fn from_blat_options(options: &[String]) -> Self {
        options
            .iter()
            .filter_map(|opt| opt.strip_prefix("-out="))
            .filter_map(Self::parse)
            .last()
            .unwrap_or(OutputFormat::Psl)
    }

    fn parse(s: &str) -> Option<Self> {
        let fmt = match s.to_ascii_lowercase().as_str() {
            "psl" => OutputFormat::Psl,
            "pslx" => OutputFormat::Pslx,
            "axt" => OutputFormat::Axt,
            "maf" => OutputFormat::Maf,
            "sim4" => OutputFormat::Sim4,
            "wublast" => OutputFormat::Wublast,
            "blast" => OutputFormat::Blast,
            "blast8" => OutputFormat::Blast8,
            "blast9" => OutputFormat::Blast9,
            "sam" => OutputFormat::Sam,
            _ => return None,
        };
        Some(fmt)
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Psl => "psl",
            OutputFormat::Pslx => "pslx",
            OutputFormat::Axt => "axt",
            OutputFormat::Maf => "maf",
            OutputFormat::Sim4 => "sim4",
            OutputFormat::Wublast => "wublast",
            OutputFormat::Blast => "blast",
            OutputFormat::Blast8 => "blast8",
            OutputFormat::Blast9 => "blast9",
            OutputFormat::Sam => "sam",
        }
    }
}

/// Qué hacer con el encabezado de cada salida parcial al concatenar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPolicy {
    /// Concatenación directa.
    None,
    /// Las primeras N líneas son encabezado: se escriben una vez.
    FixedLines(usize),
    /// Las líneas iniciales que empiezan con este byte son encabezado.
    Prefixed(u8),
}

impl HeaderPolicy {
    pub fn for_format(format: OutputFormat, options: &[String]) -> Self {
        let no_head = options.iter().any(|o| o == "-noHead");
        match format {
            OutputFormat::Psl | OutputFormat::Pslx if !no_head => {
                HeaderPolicy::FixedLines(PSL_HEADER_LINES)
            }
            OutputFormat::Maf => HeaderPolicy::Prefixed(b'#'),
            OutputFormat::Sam => HeaderPolicy::Prefixed(b'@'),
            _ => HeaderPolicy::None,
        }
    }
}

/// Concatena las salidas parciales en orden de partición dentro de `dest`.
/// Si algo falla, `dest` se borra.
pub fn merge_outputs(outputs: &[PathBuf], policy: HeaderPolicy, dest: &Path) -> MpResult<()> {
    info!("juntando {} salidas parciales en {}", outputs.len(), dest.display());

    // truncar `dest` borraría una de las entradas
    if outputs.iter().any(|o| o == dest) {
        return Err(MpBlatError::merge(format!(
            "la salida parcial {} es también el destino del merge",
            dest.display()
        )));
    }

    let res = merge_outputs_inner(outputs, policy, dest);
    if res.is_err() {
        let _ = fs::remove_file(dest);
    }
    res
}

fn merge_outputs_inner(outputs: &[PathBuf], policy: HeaderPolicy, dest: &Path) -> MpResult<()> {
    let out = File::create(dest)
        .map_err(|e| MpBlatError::merge(format!("no se pudo crear {}: {e}", dest.display())))?;
    let mut writer = BufWriter::new(out);

    for (idx, path) in outputs.iter().enumerate() {
        let file = File::open(path).map_err(|e| {
            MpBlatError::merge(format!("falta la salida parcial {}: {e}", path.display()))
        })?;
        let mut reader = BufReader::new(file);
        let first = idx == 0;

        copy_partial(&mut reader, &mut writer, policy, first).map_err(|e| {
            MpBlatError::merge(format!("no se pudo leer {}: {e}", path.display()))
        })?;
    }

    writer
        .flush()
        .map_err(|e| MpBlatError::merge(format!("error escribiendo {}: {e}", dest.display())))
}

fn copy_partial<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    policy: HeaderPolicy,
    first: bool,
) -> io::Result<()> {
    let mut line = Vec::new();

    match policy {
        HeaderPolicy::None => {}
        HeaderPolicy::FixedLines(n) => {
            for read in 0..n {
                line.clear();
                if reader.read_until(b'\n', &mut line)? == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("encabezado incompleto ({} de {} líneas)", read, n),
                    ));
                }
                if first {
                    writer.write_all(&line)?;
                }
            }
        }
        HeaderPolicy::Prefixed(prefix) => {
            while reader.fill_buf()?.first() == Some(&prefix) {
                line.clear();
                reader.read_until(b'\n', &mut line)?;
                if first {
                    writer.write_all(&line)?;
                }
            }
        }
    }

    io::copy(reader, writer)?;
    Ok(())
}

/// Herramienta externa de conversión (samtools).
#[derive(Debug, Clone)]
pub struct ConversionTool {
    bin: String,
}

impl ConversionTool {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// `samtools sort -o <bam> <sam>`
    pub fn sort_to_bam(&self, sam: &Path, bam: &Path) -> MpResult<()> {
        self.run(&[
            OsStr::new("sort"),
            OsStr::new("-o"),
            bam.as_os_str(),
            sam.as_os_str(),
        ])
    }

    /// `samtools index <bam>`; devuelve la ruta del `.bai`.
    pub fn index(&self, bam: &Path) -> MpResult<PathBuf> {
        self.run(&[OsStr::new("index"), bam.as_os_str()])?;

        let bai = bam_index_path_for(bam);
        if !bai.is_file() {
            return Err(MpBlatError::merge(format!(
                "{} index no generó {}",
                self.bin,
                bai.display()
            )));
        }
        Ok(bai)
    }

    fn run(&self, args: &[&OsStr]) -> MpResult<()> {
        let subcommand = args
            .first()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        debug!("ejecutando {} {}", self.bin, subcommand);

        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| MpBlatError::merge(format!("no se pudo ejecutar {}: {e}", self.bin)))?;

        if !output.status.success() {
            return Err(MpBlatError::merge(format!(
                "{} {} terminó con {}: {}",
                self.bin,
                subcommand,
                output
                    .status
                    .code()
                    .map(|c| format!("código {c}"))
                    .unwrap_or_else(|| "una señal".to_string()),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Todo lo necesario para pasar de salidas parciales al resultado final.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub outputs: Vec<PathBuf>,
    pub header: HeaderPolicy,
    /// Archivo intermedio dentro del workspace
    pub merged: PathBuf,
    /// samtools + ruta del BAM intermedio, si se pidió BAM
    pub conversion: Option<(ConversionTool, PathBuf)>,
    /// Ruta final elegida por el usuario
    pub destination: PathBuf,
}

impl MergePlan {
    /// Junta, convierte si hace falta y publica. Devuelve los archivos
    /// publicados (resultado y, con BAM, su índice).
    pub fn execute(&self) -> MpResult<Vec<PathBuf>> {
        merge_outputs(&self.outputs, self.header, &self.merged)?;

        let Some((tool, bam)) = &self.conversion else {
            publish(&self.merged, &self.destination)?;
            return Ok(vec![self.destination.clone()]);
        };

        info!("convirtiendo a BAM con {}", tool.bin());
        tool.sort_to_bam(&self.merged, bam)?;
        let bai = tool.index(bam)?;
        let _ = fs::remove_file(&self.merged);

        publish(bam, &self.destination)?;
        let index_dest = bam_index_path_for(&self.destination);
        if let Err(e) = publish(&bai, &index_dest) {
            // no dejamos un BAM publicado sin su índice
            let _ = fs::remove_file(&self.destination);
            return Err(e);
        }

        Ok(vec![self.destination.clone(), index_dest])
    }
}

/// `<salida>.bai`
pub fn bam_index_path_for(bam: &Path) -> PathBuf {
    let mut s = bam.as_os_str().to_owned();
    s.push(".bai");
    PathBuf::from(s)
}

/// Mueve `src` a `dest`. Si `rename` no puede (otro filesystem), copia y
/// borra el origen. Un `dest` a medio escribir se elimina.
pub fn publish(src: &Path, dest: &Path) -> MpResult<()> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                MpBlatError::merge(format!("no se pudo crear {}: {e}", parent.display()))
            })?;
        }
    }

    match fs::rename(src, dest) {
        Ok(()) => {}
        Err(e) => {
            debug!("rename falló ({e}), copiando {}", src.display());
            if let Err(e) = fs::copy(src, dest) {
                let _ = fs::remove_file(dest);
                return Err(MpBlatError::merge(format!(
                    "no se pudo publicar {}: {e}",
                    dest.display()
                )));
            }
            if let Err(e) = fs::remove_file(src) {
                warn!("no se pudo borrar {}: {e}", src.display());
            }
        }
    }

    info!("resultado publicado en {}", dest.display());
    Ok(())
}
