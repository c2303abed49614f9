use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use common::{MpBlatError, TaskStatus, WorkerTask};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::blat::BlatCommand;

/// Cuánto stderr se guarda por tarea (los últimos bytes).
const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// Tiempo máximo para terminar de leer stderr una vez que el proceso salió.
/// Un nieto que heredó el pipe puede mantenerlo abierto indefinidamente.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Motivo por el que se cancelaron los workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    WorkerFailed,
    Signal,
}

/// Señal de cancelación compartida entre el orquestador y los workers.
/// Sólo se registra el primer motivo.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Devuelve `true` si esta llamada fue la que canceló.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Option<CancelReason>> {
        self.tx.subscribe()
    }
}

/// Se resuelve cuando alguien cancela. Si el emisor desaparece, nunca.
async fn cancelled(mut rx: watch::Receiver<Option<CancelReason>>) {
    let closed = rx.wait_for(|r| r.is_some()).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Resultado de correr todas las tareas: cada una en estado terminal, en el
/// mismo orden en que se recibieron.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub tasks: Vec<WorkerTask>,
    /// Primera tarea que falló, en orden de finalización
    pub first_failure: Option<usize>,
    pub elapsed: Duration,
}

impl DispatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Succeeded)
    }

    pub fn count(&self, pred: impl Fn(&TaskStatus) -> bool) -> usize {
        self.tasks.iter().filter(|t| pred(&t.status)).count()
    }

    /// Error de la primera tarea que falló.
    pub fn failure_error(&self, program: &str) -> Option<MpBlatError> {
        self.first_failure
            .and_then(|idx| self.tasks.get(idx))
            .and_then(|t| t.to_error(program))
    }
}

/// Lanza un proceso de blat por tarea, con a lo sumo `max_concurrency`
/// procesos vivos a la vez.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    blat: BlatCommand,
    reference: PathBuf,
    max_concurrency: usize,
}

impl Dispatcher {
    pub fn new(blat: BlatCommand, reference: impl Into<PathBuf>, max_concurrency: usize) -> Self {
        Self {
            blat,
            reference: reference.into(),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Corre todas las tareas y espera a que todas terminen.
    ///
    /// Ante el primer fallo cancela al resto: los procesos vivos se matan y
    /// los que esperaban slot no arrancan.
    pub async fn run(&self, tasks: Vec<WorkerTask>, cancel: &Cancellation) -> DispatchReport {
        let started = Instant::now();
        let sem = Arc::new(Semaphore::new(self.max_concurrency));
        let mut slots: Vec<Option<WorkerTask>> = vec![None; tasks.len()];
        let snapshot = tasks.clone();

        info!(
            "lanzando {} tareas de {} (concurrency={})",
            tasks.len(),
            self.blat.bin(),
            self.max_concurrency
        );

        let mut set = JoinSet::new();
        for (idx, task) in tasks.into_iter().enumerate() {
            let sem = sem.clone();
            let blat = self.blat.clone();
            let reference = self.reference.clone();
            let cancel = cancel.clone();
            set.spawn(async move { (idx, run_task(task, blat, reference, sem, cancel).await) });
        }

        let mut first_failure = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, task)) => {
                    if task.status.is_failure() && first_failure.is_none() {
                        warn!(
                            "la tarea {} falló ({:?}), cancelando el resto",
                            task.id, task.status
                        );
                        first_failure = Some(idx);
                        cancel.cancel(CancelReason::WorkerFailed);
                    }
                    slots[idx] = Some(task);
                }
                Err(e) => {
                    warn!("panic o join error en un worker: {:?}", e);
                    cancel.cancel(CancelReason::WorkerFailed);
                }
            }
        }

        // Una tarea que no volvió (panic) cuenta como fallida.
        let tasks: Vec<WorkerTask> = slots
            .into_iter()
            .zip(snapshot)
            .enumerate()
            .map(|(idx, (slot, original))| {
                slot.unwrap_or_else(|| {
                    let mut t = original;
                    t.status = TaskStatus::Failed {
                        exit_code: None,
                        stderr: "el worker terminó de forma anómala".to_string(),
                    };
                    if first_failure.is_none() {
                        first_failure = Some(idx);
                    }
                    t
                })
            })
            .collect();

        DispatchReport {
            tasks,
            first_failure,
            elapsed: started.elapsed(),
        }
    }
}

async fn run_task(
    mut task: WorkerTask,
    blat: BlatCommand,
    reference: PathBuf,
    sem: Arc<Semaphore>,
    cancel: Cancellation,
) -> WorkerTask {
    let cancel_rx = cancel.subscribe();
    // Esperar un slot libre (o la cancelación, lo que llegue primero)
    let permit = tokio::select! {
        biased;
        _ = cancelled(cancel_rx.clone()) => None,
        permit = sem.acquire_owned() => permit.ok(),
    };
    let Some(permit) = permit else {
        task.status = TaskStatus::Cancelled;
        return task;
    };

    task.status = TaskStatus::Running;
    let started = Instant::now();
    info!(
        "iniciando {} sobre {}",
        blat.bin(),
        task.partition.path.display()
    );

    let mut child = match blat
        .command(&reference, &task.partition.path, &task.output_path)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            task.finish(
                TaskStatus::Failed {
                    exit_code: None,
                    stderr: format!("no se pudo lanzar {}: {e}", blat.bin()),
                },
                started.elapsed(),
            );
            cancel.cancel(CancelReason::WorkerFailed);
            return task;
        }
    };

    let captured = Arc::new(Mutex::new(Vec::new()));
    let stderr_reader = child.stderr.take().map(|stderr| {
        let captured = captured.clone();
        tokio::spawn(read_tail(stderr, captured))
    });

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancelled(cancel_rx) => None,
    };

    if waited.is_none() {
        debug!("matando el worker de la tarea {}", task.id);
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    if let Some(mut handle) = stderr_reader {
        if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            warn!(
                "stderr de la tarea {} sigue abierto tras salir el proceso, se deja de leer",
                task.id
            );
            handle.abort();
        }
    }
    let stderr = captured
        .lock()
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default();
    let status = match waited {
        None => TaskStatus::Cancelled,
        Some(Ok(status)) if status.success() => TaskStatus::Succeeded,
        Some(Ok(status)) => TaskStatus::Failed {
            exit_code: status.code(),
            stderr,
        },
        Some(Err(e)) => TaskStatus::Failed {
            exit_code: None,
            stderr: format!("error esperando al proceso: {e}"),
        },
    };

    // Cancelar antes de liberar el slot: así ninguna tarea en espera arranca.
    if status.is_failure() {
        cancel.cancel(CancelReason::WorkerFailed);
    }
    drop(permit);

    task.finish(status, started.elapsed());
    info!(
        "tarea {} terminó: {:?} ({} ms)",
        task.id,
        task.status,
        task.elapsed_ms.unwrap_or_default()
    );
    task
}

/// Lee hasta EOF quedándose sólo con los últimos [`STDERR_TAIL_BYTES`].
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, captured: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let Ok(mut buf) = captured.lock() else { break };
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > STDERR_TAIL_BYTES {
            let excess = buf.len() - STDERR_TAIL_BYTES;
            buf.drain(..excess);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use common::Partition;
    use std::{env, fs, os::unix::fs::PermissionsExt, path::Path};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("dispatcher_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Crea `n` particiones con el contenido que devuelva `content(i)`.
    fn tasks(dir: &Path, n: u32, content: impl Fn(u32) -> String) -> Vec<WorkerTask> {
        (1..=n)
            .map(|id| {
                let path = dir.join(format!("reads.fa.part_{id}"));
                fs::write(&path, content(id)).unwrap();
                WorkerTask::new(
                    Partition {
                        id,
                        path: path.clone(),
                        records: 1,
                    },
                    dir.join(format!("reads.fa.part_{id}.psl")),
                )
            })
            .collect()
    }

    // blat falso: copia la partición ($2) a la salida (último argumento)
    const ECHO_BLAT: &str = "for last; do :; done\ncp \"$2\" \"$last\"";

    #[tokio::test]
    async fn todas_las_tareas_exitosas() {
        let tmp = temp_dir("ok");
        let blat_bin = write_script(&tmp, "blat", ECHO_BLAT);
        let reference = tmp.join("ref.fa");
        fs::write(&reference, ">chr1\nACGT\n").unwrap();

        let dispatcher = Dispatcher::new(
            BlatCommand::new(blat_bin.to_string_lossy(), "-noHead").unwrap(),
            &reference,
            3,
        );
        let report = dispatcher
            .run(tasks(&tmp, 3, |i| format!(">r{i}\nACGT\n")), &Cancellation::new())
            .await;

        assert!(report.all_succeeded());
        assert!(report.first_failure.is_none());
        for t in &report.tasks {
            assert_eq!(
                fs::read_to_string(&t.output_path).unwrap(),
                format!(">r{}\nACGT\n", t.id)
            );
            assert!(t.elapsed_ms.is_some());
        }
    }

    #[tokio::test]
    async fn un_fallo_cancela_a_los_hermanos() {
        let tmp = temp_dir("fail");
        let blat_bin = write_script(
            &tmp,
            "blat",
            "if grep -q FAIL \"$2\"; then echo 'boom en blat' >&2; exit 3; fi\nexec sleep 5",
        );
        let reference = tmp.join("ref.fa");
        fs::write(&reference, ">chr1\nACGT\n").unwrap();

        let dispatcher = Dispatcher::new(
            BlatCommand::new(blat_bin.to_string_lossy(), "").unwrap(),
            &reference,
            3,
        );
        let cancel = Cancellation::new();
        let started = Instant::now();
        let report = dispatcher
            .run(
                tasks(&tmp, 3, |i| if i == 2 { ">FAIL\nA\n".into() } else { ">ok\nA\n".into() }),
                &cancel,
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!report.all_succeeded());
        assert_eq!(cancel.reason(), Some(CancelReason::WorkerFailed));
        assert_eq!(report.first_failure, Some(1));
        assert_eq!(report.count(|s| *s == TaskStatus::Cancelled), 2);

        match report.failure_error("blat") {
            Some(MpBlatError::ToolExecution {
                task,
                exit_code,
                stderr,
                ..
            }) => {
                assert_eq!(task, 2);
                assert_eq!(exit_code, Some(3));
                assert!(stderr.contains("boom en blat"));
            }
            other => panic!("error inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn binario_inexistente_es_fallo_de_lanzamiento() {
        let tmp = temp_dir("missing_bin");
        let dispatcher = Dispatcher::new(
            BlatCommand::new("/no/existe/blat", "").unwrap(),
            tmp.join("ref.fa"),
            1,
        );
        let report = dispatcher
            .run(tasks(&tmp, 2, |_| ">r\nA\n".into()), &Cancellation::new())
            .await;

        assert_eq!(report.first_failure, Some(0));
        let err = report.failure_error("/no/existe/blat").unwrap();
        assert!(err.to_string().contains("no se pudo lanzar"));
        // con concurrency=1 la segunda ni arranca
        assert_eq!(report.tasks[1].status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn nunca_hay_mas_procesos_que_el_limite() {
        let tmp = temp_dir("bound");
        let probe = tmp.join("probe");
        fs::create_dir_all(&probe).unwrap();
        // registra cuántos procesos "activos" ve al arrancar
        let blat_bin = write_script(
            &tmp,
            "blat",
            "for last; do :; done\n\
             d=\"$3\"\n\
             touch \"$d/active.$$\"\n\
             ls \"$d\" | grep -c '^active\\.' > \"$d/count.$$\"\n\
             sleep 0.3\n\
             rm \"$d/active.$$\"\n\
             cp \"$2\" \"$last\"",
        );
        let reference = tmp.join("ref.fa");
        fs::write(&reference, ">chr1\nACGT\n").unwrap();

        let dispatcher = Dispatcher::new(
            BlatCommand::new(blat_bin.to_string_lossy(), &probe.to_string_lossy()).unwrap(),
            &reference,
            2,
        );
        let report = dispatcher
            .run(tasks(&tmp, 5, |i| format!(">r{i}\nA\n")), &Cancellation::new())
            .await;

        assert!(report.all_succeeded());

        let counts: Vec<usize> = fs::read_dir(&probe)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("count."))
            .map(|p| fs::read_to_string(p).unwrap().trim().parse().unwrap())
            .collect();

        assert_eq!(counts.len(), 5);
        assert!(counts.iter().all(|&c| (1..=2).contains(&c)), "{counts:?}");
    }

    #[tokio::test]
    async fn cancelacion_previa_no_lanza_nada() {
        let tmp = temp_dir("pre_cancel");
        let dispatcher = Dispatcher::new(BlatCommand::new("/no/existe/blat", "").unwrap(), tmp.join("r"), 2);
        let cancel = Cancellation::new();
        assert!(cancel.cancel(CancelReason::Signal));
        // el segundo motivo no pisa al primero
        assert!(!cancel.cancel(CancelReason::WorkerFailed));

        let report = dispatcher
            .run(tasks(&tmp, 2, |_| ">r\nA\n".into()), &cancel)
            .await;

        assert_eq!(report.count(|s| *s == TaskStatus::Cancelled), 2);
        assert!(report.first_failure.is_none());
        assert_eq!(cancel.reason(), Some(CancelReason::Signal));
    }

    #[tokio::test]
    async fn stderr_guarda_solo_el_final() {
        let tmp = temp_dir("stderr_tail");
        let blat_bin = write_script(
            &tmp,
            "blat",
            "head -c 100000 /dev/zero | tr '\\0' x >&2\necho FIN >&2\nexit 1",
        );
        let dispatcher = Dispatcher::new(
            BlatCommand::new(blat_bin.to_string_lossy(), "").unwrap(),
            tmp.join("ref.fa"),
            1,
        );
        let report = dispatcher
            .run(tasks(&tmp, 1, |_| ">r\nA\n".into()), &Cancellation::new())
            .await;

        match &report.tasks[0].status {
            TaskStatus::Failed { exit_code, stderr } => {
                assert_eq!(*exit_code, Some(1));
                assert_eq!(stderr.len(), STDERR_TAIL_BYTES);
                assert!(stderr.ends_with("xFIN\n"));
            }
            other => panic!("estado inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn nieto_con_stderr_abierto_no_bloquea_la_barrera() {
        let tmp = temp_dir("stderr_grandchild");
        // el sleep en background hereda stderr y lo mantiene abierto
        let blat_bin = write_script(
            &tmp,
            "blat",
            "sleep 20 &\necho 'blat: fallo' >&2\nexit 2",
        );
        let dispatcher = Dispatcher::new(
            BlatCommand::new(blat_bin.to_string_lossy(), "").unwrap(),
            tmp.join("ref.fa"),
            1,
        );

        let started = Instant::now();
        let report = dispatcher
            .run(tasks(&tmp, 1, |_| ">r\nA\n".into()), &Cancellation::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(10));
        match &report.tasks[0].status {
            TaskStatus::Failed { exit_code, stderr } => {
                assert_eq!(*exit_code, Some(2));
                assert!(stderr.contains("blat: fallo"));
            }
            other => panic!("estado inesperado: {other:?}"),
        }
    }
}
