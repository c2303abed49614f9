//! Lectura de índices `.fai` (formato de `samtools faidx`).
//!
//! Si el fasta ya trae su índice, lo usamos para cortar el archivo por
//! offsets de bytes sin parsear las secuencias.

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use crate::error::{MpBlatError, MpResult};

/// Una línea del `.fai`: NAME, LENGTH, OFFSET, LINEBASES, LINEWIDTH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaiEntry {
    pub name: String,
    pub length: u64,
    pub offset: u64,
    pub line_bases: u64,
    pub line_width: u64,
}

impl FaiEntry {
    /// Offset de bytes justo después del último salto de línea del registro.
    pub fn end_pos(&self) -> u64 {
        if self.length == 0 {
            return self.offset;
        }
        let num_lines = self.length.div_ceil(self.line_bases);
        self.offset + self.length + num_lines * (self.line_width - self.line_bases)
    }
}

/// `<fasta>.fai`, al lado del fasta.
pub fn index_path_for(fasta: &Path) -> PathBuf {
    let mut s: OsString = fasta.as_os_str().to_owned();
    s.push(".fai");
    PathBuf::from(s)
}

pub fn read_fai(path: &Path) -> MpResult<Vec<FaiEntry>> {
    let content = fs::read_to_string(path)
        .map_err(|e| MpBlatError::input(path, format!("no se pudo leer el índice: {e}")))?;

    let mut entries = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 5 {
            return Err(MpBlatError::input(
                path,
                format!("línea {}: se esperaban 5 columnas, hay {}", idx + 1, cols.len()),
            ));
        }

        let num = |col: usize| -> MpResult<u64> {
            cols[col].trim().parse::<u64>().map_err(|_| {
                MpBlatError::input(
                    path,
                    format!("línea {}: columna {} no numérica ({:?})", idx + 1, col + 1, cols[col]),
                )
            })
        };

        let entry = FaiEntry {
            name: cols[0].to_string(),
            length: num(1)?,
            offset: num(2)?,
            line_bases: num(3)?,
            line_width: num(4)?,
        };

        if entry.line_bases == 0 || entry.line_width < entry.line_bases {
            return Err(MpBlatError::input(
                path,
                format!("línea {}: LINEBASES/LINEWIDTH inválidos", idx + 1),
            ));
        }
        entries.push(entry);
    }

    Ok(entries)
}

/// Verifica que el índice describe un archivo de `file_len` bytes:
/// registros en orden, sin solaparse, y terminando dentro del archivo.
pub fn check_consistency(entries: &[FaiEntry], file_len: u64) -> Result<(), String> {
    let mut prev_end = 0u64;
    for e in entries {
        if e.offset <= prev_end {
            return Err(format!("el registro {} se solapa con el anterior", e.name));
        }
        let end = e.end_pos();
        if end > file_len {
            return Err(format!(
                "el registro {} termina en el byte {} pero el archivo tiene {}",
                e.name, end, file_len
            ));
        }
        prev_end = end;
    }
    Ok(())
}

/// Más que esto después del último registro indexado ya no es "espacio en
/// blanco al final", son registros que el índice no conoce.
const MAX_TRAILING_BYTES: u64 = 64 * 1024;

/// Contrasta el índice con el archivo real: además de [`check_consistency`],
/// cada registro debe empezar con `>` justo donde termina el anterior, y lo
/// que queda después del último sólo puede ser espacio en blanco.
pub fn verify_file(entries: &[FaiEntry], path: &Path) -> Result<(), String> {
    let io_err = |e: std::io::Error| format!("no se pudo leer {}: {e}", path.display());

    let mut file = File::open(path).map_err(io_err)?;
    let file_len = file.metadata().map_err(io_err)?.len();
    check_consistency(entries, file_len)?;

    let mut start = 0u64;
    let mut byte = [0u8; 1];
    for e in entries {
        file.seek(SeekFrom::Start(start)).map_err(io_err)?;
        file.read_exact(&mut byte).map_err(io_err)?;
        if byte[0] != b'>' {
            return Err(format!(
                "el registro {} no empieza con '>' en el byte {}",
                e.name, start
            ));
        }
        start = e.end_pos();
    }

    let rest = file_len - start;
    if rest > MAX_TRAILING_BYTES {
        return Err(format!(
            "hay {} bytes sin indexar después del último registro",
            rest
        ));
    }

    let mut tail = Vec::with_capacity(rest as usize);
    file.seek(SeekFrom::Start(start)).map_err(io_err)?;
    (&mut file).take(rest).read_to_end(&mut tail).map_err(io_err)?;
    if !tail.iter().all(u8::is_ascii_whitespace) {
        return Err(format!(
            "hay {} bytes sin indexar después del último registro",
            rest
        ));
    }

    Ok(())
}

/// Tamaño en bytes de cada bloque, dado cuántos registros va a cada parte.
/// El primer bloque arranca en el byte 0 y cada bloque termina donde termina
/// su último registro.
pub fn block_sizes(entries: &[FaiEntry], records_per_part: &[usize]) -> Vec<u64> {
    let mut sizes = Vec::with_capacity(records_per_part.len());
    let mut start = 0u64;
    let mut last = 0usize;

    for &count in records_per_part {
        last += count;
        let end = entries[last - 1].end_pos();
        sizes.push(end - start);
        start = end;
    }

    sizes
}
