use std::{
    fs,
    path::{Path, PathBuf},
};

use tempfile::{Builder, TempDir};
use tracing::{debug, info, warn};

use crate::error::{MpBlatError, MpResult};
use crate::task::Partition;

/// Prefijo de los directorios temporales, ej: `/tmp/mp_blat_tmp.Ab12Cd`
pub const WORKSPACE_PREFIX: &str = "mp_blat_tmp.";

/// Subdirectorio del merge. Las salidas de los workers van directo en la
/// raíz, así que ninguna puede pisar el archivo intermedio del merge.
const MERGE_DIR: &str = ".merge";

/// Directorio temporal de una invocación.
///
/// Es el único dueño del directorio: lo crea, reparte rutas (vía
/// [`WorkspaceLayout`]) y lo borra en `close()` o al hacer drop, salvo que
/// se haya pedido conservarlo.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    layout: WorkspaceLayout,
    keep: bool,
}

/// Rutas dentro del workspace. Es `Clone` para poder moverlo a hilos de
/// bloqueo sin compartir el `Workspace`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl Workspace {
    pub fn create(base: &Path, keep: bool) -> MpResult<Self> {
        fs::create_dir_all(base).map_err(|e| MpBlatError::workspace(base, e))?;

        let dir = Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(base)
            .map_err(|e| MpBlatError::workspace(base, e))?;

        let merge_dir = dir.path().join(MERGE_DIR);
        fs::create_dir(&merge_dir).map_err(|e| MpBlatError::workspace(&merge_dir, e))?;

        debug!("workspace creado en {}", dir.path().display());

        Ok(Self {
            layout: WorkspaceLayout {
                root: dir.path().to_path_buf(),
            },
            dir: Some(dir),
            keep,
        })
    }

    pub fn path(&self) -> &Path {
        &self.layout.root
    }

    pub fn layout(&self) -> WorkspaceLayout {
        self.layout.clone()
    }

    /// Cierra el workspace. Devuelve la ruta si se conservó.
    pub fn close(mut self) -> MpResult<Option<PathBuf>> {
        let Some(dir) = self.dir.take() else {
            return Ok(None);
        };

        if self.keep {
            let path = dir.keep();
            info!("conservando archivos temporales en {}", path.display());
            return Ok(Some(path));
        }

        let path = dir.path().to_path_buf();
        dir.close().map_err(|e| MpBlatError::workspace(&path, e))?;
        debug!("workspace {} borrado", path.display());
        Ok(None)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // Sólo llega acá con el directorio vivo si no se llamó a close()
        // (panic o retorno temprano).
        if let Some(dir) = self.dir.take() {
            if self.keep {
                let path = dir.keep();
                warn!("workspace conservado en {}", path.display());
            } else if let Err(e) = dir.close() {
                warn!("no se pudo borrar el workspace: {e}");
            }
        }
    }
}

impl WorkspaceLayout {
    /// `<workspace>/<nombre del fasta>.part_<id>`
    pub fn partition_path(&self, input_name: &str, id: u32) -> PathBuf {
        self.root.join(format!("{}.part_{}", input_name, id))
    }

    /// `<workspace>/<archivo de la partición>.<ext>`
    pub fn output_path(&self, partition: &Partition, ext: &str) -> PathBuf {
        let name = file_name(&partition.path);
        self.root.join(format!("{}.{}", name, ext))
    }

    /// `<workspace>/.merge/merged.<ext>`
    pub fn merged_path(&self, ext: &str) -> PathBuf {
        self.root.join(MERGE_DIR).join(format!("merged.{}", ext))
    }
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "input".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, path::PathBuf};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("workspace_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn close_borra_el_directorio_y_su_contenido() {
        let base = temp_dir("close");
        let ws = Workspace::create(&base, false).unwrap();
        let dir = ws.path().to_path_buf();

        assert!(dir.starts_with(&base));
        assert!(file_name(&dir).starts_with(WORKSPACE_PREFIX));

        fs::write(ws.layout().partition_path("reads.fa", 1), ">a\nACGT\n").unwrap();

        assert_eq!(ws.close().unwrap(), None);
        assert!(!dir.exists());
    }

    #[test]
    fn keep_conserva_el_directorio() {
        let base = temp_dir("keep");
        let ws = Workspace::create(&base, true).unwrap();
        let dir = ws.path().to_path_buf();

        let kept = ws.close().unwrap();
        assert_eq!(kept, Some(dir.clone()));
        assert!(dir.exists());
    }

    #[test]
    fn drop_sin_close_tambien_limpia() {
        let base = temp_dir("drop");
        let dir = {
            let ws = Workspace::create(&base, false).unwrap();
            ws.path().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn create_crea_la_base_si_no_existe() {
        let base = temp_dir("nested").join("a").join("b");
        let ws = Workspace::create(&base, false).unwrap();
        assert!(ws.path().exists());
        ws.close().unwrap();
    }

    #[test]
    fn create_falla_si_la_base_es_un_archivo() {
        let base = temp_dir("file");
        let file = base.join("no_soy_dir");
        fs::write(&file, "x").unwrap();

        let res = Workspace::create(&file, false);
        assert!(matches!(res, Err(MpBlatError::Workspace { .. })));
    }

    #[test]
    fn layout_nombra_particiones_y_salidas() {
        let layout = WorkspaceLayout {
            root: PathBuf::from("/w"),
        };
        let part_path = layout.partition_path("reads.fa", 2);
        assert_eq!(part_path, PathBuf::from("/w/reads.fa.part_2"));

        let part = Partition {
            id: 2,
            path: part_path,
            records: 1,
        };
        assert_eq!(
            layout.output_path(&part, "psl"),
            PathBuf::from("/w/reads.fa.part_2.psl")
        );
        assert_eq!(
            layout.merged_path("sam"),
            PathBuf::from("/w/.merge/merged.sam")
        );
    }

    #[test]
    fn salida_de_un_fasta_llamado_merged_no_pisa_el_merge() {
        let base = temp_dir("merged_name");
        let ws = Workspace::create(&base, false).unwrap();
        let layout = ws.layout();

        // con una sola parte la partición es el fasta original, con su nombre
        let part = Partition {
            id: 1,
            path: base.join("merged"),
            records: 4,
        };
        for ext in ["psl", "sam", "maf"] {
            assert_ne!(layout.output_path(&part, ext), layout.merged_path(ext));
        }
        assert!(layout.merged_path("psl").parent().unwrap().is_dir());
        ws.close().unwrap();
    }
}
