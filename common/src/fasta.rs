use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::error::{MpBlatError, MpResult};
use crate::faidx;
use crate::task::Partition;
use crate::workspace::{file_name, WorkspaceLayout};

/// Un registro fasta tal cual aparece en el archivo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    /// Primer token del encabezado, sin el `>`
    pub name: String,
    /// Encabezado + líneas de secuencia, con los saltos de línea originales.
    /// Siempre termina en `\n`.
    pub raw: Vec<u8>,
}

/// Iterador de registros sobre cualquier `BufRead`.
/// Las líneas en blanco se ignoran; el resto se copia byte a byte.
pub struct FastaRecords<R> {
    reader: R,
    path: PathBuf,
    line_no: usize,
    next_header: Option<(Vec<u8>, usize)>,
    done: bool,
}

impl<R: BufRead> FastaRecords<R> {
    pub fn new(reader: R, path: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            path: path.into(),
            line_no: 0,
            next_header: None,
            done: false,
        }
    }

    fn read_line(&mut self, buf: &mut Vec<u8>) -> MpResult<usize> {
        buf.clear();
        let n = self
            .reader
            .read_until(b'\n', buf)
            .map_err(|e| MpBlatError::input(&self.path, format!("error de lectura: {e}")))?;
        if n > 0 {
            self.line_no += 1;
        }
        Ok(n)
    }

    fn next_record(&mut self) -> MpResult<Option<SequenceRecord>> {
        let (mut raw, header_line) = match self.next_header.take() {
            Some(h) => h,
            None => loop {
                let mut line = Vec::new();
                if self.read_line(&mut line)? == 0 {
                    return Ok(None);
                }
                if is_blank(&line) {
                    continue;
                }
                if line[0] == b'>' {
                    break (line, self.line_no);
                }
                return Err(MpBlatError::input(
                    &self.path,
                    format!("línea {}: contenido antes del primer encabezado '>'", self.line_no),
                ));
            },
        };

        ensure_newline(&mut raw);
        let name = header_name(&raw).ok_or_else(|| {
            MpBlatError::input(&self.path, format!("línea {}: encabezado sin nombre", header_line))
        })?;

        let mut seq_lines = 0usize;
        loop {
            let mut line = Vec::new();
            if self.read_line(&mut line)? == 0 {
                break;
            }
            if is_blank(&line) {
                continue;
            }
            if line[0] == b'>' {
                self.next_header = Some((line, self.line_no));
                break;
            }
            ensure_newline(&mut line);
            raw.extend_from_slice(&line);
            seq_lines += 1;
        }

        if seq_lines == 0 {
            return Err(MpBlatError::input(
                &self.path,
                format!("registro '{}' truncado (línea {}): no tiene secuencia", name, header_line),
            ));
        }

        Ok(Some(SequenceRecord { name, raw }))
    }
}

impl<R: BufRead> Iterator for FastaRecords<R> {
    type Item = MpResult<SequenceRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

fn ensure_newline(line: &mut Vec<u8>) {
    if !line.ends_with(b"\n") {
        line.push(b'\n');
    }
}

fn header_name(header: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(&header[1..]);
    text.split_whitespace().next().map(|s| s.to_string())
}

pub fn open_records(path: &Path) -> MpResult<FastaRecords<BufReader<File>>> {
    let file = File::open(path)
        .map_err(|e| MpBlatError::input(path, format!("no se pudo abrir: {e}")))?;
    Ok(FastaRecords::new(BufReader::new(file), path))
}

/// Recorre el archivo completo validándolo. Devuelve la cantidad de registros.
pub fn count_records(path: &Path) -> MpResult<usize> {
    let mut total = 0;
    for rec in open_records(path)? {
        rec?;
        total += 1;
    }
    Ok(total)
}

/// Reparte `total` registros en `parts` bloques contiguos: los primeros
/// `total % parts` bloques llevan un registro extra.
pub fn partition_sizes(total: usize, parts: usize) -> Vec<usize> {
    let parts = parts.max(1);
    let (base, remainder) = (total / parts, total % parts);
    (0..parts)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Divide el fasta en hasta `num_parts` archivos dentro del workspace.
///
/// - Si existe `<fasta>.fai` y es consistente, corta por offsets de bytes.
/// - Si no, parsea los registros (dos pasadas: contar y escribir).
/// - Con una sola parte efectiva devuelve el fasta original sin copiarlo.
pub fn split_fasta(
    input: &Path,
    num_parts: u32,
    layout: &WorkspaceLayout,
) -> MpResult<Vec<Partition>> {
    info!("dividiendo {} en {} partes", input.display(), num_parts);

    let fai = load_usable_index(input)?;
    let total = match &fai {
        Some(entries) => entries.len(),
        None => count_records(input)?,
    };

    if total == 0 {
        return Err(MpBlatError::input(input, "el fasta no contiene registros"));
    }

    let mut parts = num_parts.max(1) as usize;
    if parts > total {
        warn!(
            "se pidieron {} partes pero el fasta sólo tiene {} registros; usando {}",
            parts, total, total
        );
        parts = total;
    }

    if parts == 1 {
        debug!("una sola parte: se usa el fasta original");
        return Ok(vec![Partition {
            id: 1,
            path: input.to_path_buf(),
            records: total,
        }]);
    }

    let sizes = partition_sizes(total, parts);
    let input_name = file_name(input);
    let paths: Vec<PathBuf> = (1..=parts as u32)
        .map(|id| layout.partition_path(&input_name, id))
        .collect();

    match fai {
        Some(entries) => {
            debug!("usando el índice {}", faidx::index_path_for(input).display());
            write_blocks(input, &faidx::block_sizes(&entries, &sizes), &paths)?
        }
        None => write_records(input, &sizes, &paths)?,
    }

    info!("el fasta quedó dividido en {} partes", parts);

    Ok(paths
        .into_iter()
        .zip(sizes)
        .enumerate()
        .map(|(i, (path, records))| Partition {
            id: i as u32 + 1,
            path,
            records,
        })
        .collect())
}

/// Lee `<fasta>.fai` si existe. Un índice que no cuadra con el archivo se
/// descarta con un warning y se parsea el fasta.
fn load_usable_index(input: &Path) -> MpResult<Option<Vec<faidx::FaiEntry>>> {
    let index_path = faidx::index_path_for(input);
    if !index_path.is_file() {
        return Ok(None);
    }

    let entries = match faidx::read_fai(&index_path) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("ignorando índice inválido: {e}");
            return Ok(None);
        }
    };

    if let Err(reason) = faidx::verify_file(&entries, input) {
        warn!("ignorando índice {}: {}", index_path.display(), reason);
        return Ok(None);
    }

    Ok(Some(entries))
}

fn write_blocks(input: &Path, block_sizes: &[u64], paths: &[PathBuf]) -> MpResult<()> {
    let file = File::open(input)
        .map_err(|e| MpBlatError::input(input, format!("no se pudo abrir: {e}")))?;
    let mut reader = BufReader::new(file);

    for (path, &size) in paths.iter().zip(block_sizes) {
        let mut writer = create_partition(path)?;
        let copied = io::copy(&mut (&mut reader).take(size), &mut writer)
            .map_err(|e| MpBlatError::input(input, format!("error copiando bloque: {e}")))?;
        if copied != size {
            return Err(MpBlatError::input(
                input,
                format!("el archivo terminó antes de lo que indica el índice ({} de {} bytes)", copied, size),
            ));
        }
        flush_partition(path, writer)?;
    }

    Ok(())
}

fn write_records(input: &Path, sizes: &[usize], paths: &[PathBuf]) -> MpResult<()> {
    let mut records = open_records(input)?;

    for (path, &count) in paths.iter().zip(sizes) {
        let mut writer = create_partition(path)?;
        for _ in 0..count {
            let rec = match records.next() {
                Some(rec) => rec?,
                None => {
                    return Err(MpBlatError::input(input, "el archivo cambió mientras se dividía"))
                }
            };
            writer
                .write_all(&rec.raw)
                .map_err(|e| workspace_write_error(path, e))?;
        }
        flush_partition(path, writer)?;
    }

    Ok(())
}

fn create_partition(path: &Path) -> MpResult<BufWriter<File>> {
    let file = File::create(path).map_err(|e| workspace_write_error(path, e))?;
    Ok(BufWriter::new(file))
}

fn flush_partition(path: &Path, mut writer: BufWriter<File>) -> MpResult<()> {
    writer.flush().map_err(|e| workspace_write_error(path, e))
}

fn workspace_write_error(path: &Path, e: io::Error) -> MpBlatError {
    MpBlatError::workspace(path, e)
}
