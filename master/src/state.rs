// master/src/state.rs

use anyhow::{bail, Result};
use chrono::Utc;
use common::{JobInfo, JobRequest, JobStatus, TaskStatus, WorkerTask};
use std::path::PathBuf;
use tracing::{debug, info};

/// Lleva el estado de una invocación y valida cada transición.
#[derive(Debug, Clone)]
pub struct JobTracker {
    info: JobInfo,
}

impl JobTracker {
    pub fn new(req: &JobRequest) -> Self {
        let info = JobInfo {
            id: uuid::Uuid::new_v4().to_string(),
            status: JobStatus::Init,
            reference: req.reference.clone(),
            fasta: req.fasta.clone(),
            output: req.output.clone(),
            num_proc: req.num_proc,
            blat_options: req.blat_options.clone(),
            workspace: None,
            published: Vec::new(),
            error: None,

            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            cancelled_tasks: 0,
            tasks: Vec::new(),
        };
        Self { info }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn status(&self) -> JobStatus {
        self.info.status
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    pub fn advance(&mut self, next: JobStatus) -> Result<()> {
        let current = self.info.status;
        if !current.can_transition_to(next) {
            bail!("transición inválida {:?} -> {:?}", current, next);
        }

        debug!("job {}: {:?} -> {:?}", self.info.id, current, next);
        if current == JobStatus::Init {
            self.info.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.info.finished_at = Some(Utc::now());
        }
        self.info.status = next;
        Ok(())
    }

    pub fn set_workspace(&mut self, path: PathBuf) {
        self.info.workspace = Some(path);
    }

    /// Registra las tareas (pendientes o terminadas) y recalcula contadores.
    pub fn record_tasks(&mut self, tasks: &[WorkerTask]) {
        self.info.total_tasks = tasks.len() as u32;
        self.info.completed_tasks = count(tasks, |s| *s == TaskStatus::Succeeded);
        self.info.failed_tasks = count(tasks, TaskStatus::is_failure);
        self.info.cancelled_tasks = count(tasks, |s| *s == TaskStatus::Cancelled);
        self.info.tasks = tasks.to_vec();
    }

    pub fn finish(&mut self, published: Vec<PathBuf>) -> Result<()> {
        self.advance(JobStatus::Done)?;
        self.info.published = published;
        info!(
            "job {} DONE: {} tareas en {:?}",
            self.info.id, self.info.total_tasks, self.info.published
        );
        Ok(())
    }

    /// Marca el job como FAILED guardando el error. No falla nunca: si el
    /// job ya estaba terminado sólo se anota el mensaje.
    pub fn fail(&mut self, err: &anyhow::Error) {
        if !self.info.status.is_terminal() {
            self.info.status = JobStatus::Failed;
            self.info.finished_at = Some(Utc::now());
        }
        self.info.error = Some(format!("{err:#}"));
    }

    pub fn into_info(self) -> JobInfo {
        self.info
    }
}

fn count(tasks: &[WorkerTask], pred: impl Fn(&TaskStatus) -> bool) -> u32 {
    tasks.iter().filter(|t| pred(&t.status)).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Partition;
    use std::time::Duration;

    fn tracker() -> JobTracker {
        JobTracker::new(&JobRequest::new("ref.fa", "reads.fa", "out.psl"))
    }

    fn task(id: u32, status: TaskStatus) -> WorkerTask {
        let mut t = WorkerTask::new(
            Partition {
                id,
                path: format!("reads.fa.part_{id}").into(),
                records: 1,
            },
            format!("reads.fa.part_{id}.psl").into(),
        );
        t.finish(status, Duration::from_millis(5));
        t
    }

    #[test]
    fn recorre_el_camino_feliz() {
        let mut t = tracker();
        assert_eq!(t.status(), JobStatus::Init);
        assert!(!t.id().is_empty());

        t.advance(JobStatus::Splitting).unwrap();
        assert!(t.info().started_at.is_some());
        t.advance(JobStatus::Dispatching).unwrap();
        t.advance(JobStatus::AllSucceeded).unwrap();
        t.advance(JobStatus::Merging).unwrap();
        t.finish(vec!["out.psl".into()]).unwrap();

        let info = t.into_info();
        assert_eq!(info.status, JobStatus::Done);
        assert!(info.finished_at.is_some());
        assert_eq!(info.published, vec![PathBuf::from("out.psl")]);
    }

    #[test]
    fn rechaza_saltos_de_estado() {
        let mut t = tracker();
        assert!(t.advance(JobStatus::Merging).is_err());
        assert_eq!(t.status(), JobStatus::Init);

        t.advance(JobStatus::Splitting).unwrap();
        t.advance(JobStatus::Dispatching).unwrap();
        t.advance(JobStatus::AnyFailed).unwrap();
        assert!(t.advance(JobStatus::Merging).is_err());
    }

    #[test]
    fn fail_guarda_el_error_y_termina() {
        let mut t = tracker();
        t.advance(JobStatus::Splitting).unwrap();
        t.fail(&anyhow::anyhow!("se rompió"));

        let info = t.into_info();
        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.error.as_deref(), Some("se rompió"));
        assert!(info.finished_at.is_some());
    }

    #[test]
    fn record_tasks_cuenta_por_estado() {
        let mut t = tracker();
        t.record_tasks(&[
            task(1, TaskStatus::Succeeded),
            task(
                2,
                TaskStatus::Failed {
                    exit_code: Some(1),
                    stderr: String::new(),
                },
            ),
            task(3, TaskStatus::Cancelled),
            task(4, TaskStatus::Succeeded),
        ]);

        let info = t.info();
        assert_eq!(info.total_tasks, 4);
        assert_eq!(info.completed_tasks, 2);
        assert_eq!(info.failed_tasks, 1);
        assert_eq!(info.cancelled_tasks, 1);
        assert_eq!(info.tasks.len(), 4);
    }
}
