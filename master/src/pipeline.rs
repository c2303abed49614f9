// master/src/pipeline.rs

use anyhow::{anyhow, Context, Result};
use common::{
    fasta,
    merge::{ConversionTool, HeaderPolicy, MergePlan, OutputFormat},
    JobInfo, JobRequest, JobStatus, MpBlatError, OutputKind, WorkerTask, Workspace,
};
use std::path::PathBuf;
use tracing::{error, info, warn};
use worker::{BlatCommand, CancelReason, Cancellation, Dispatcher};

use crate::{monitor, state::JobTracker};

/// Resultado de una corrida: el reporte siempre está, haya fallado o no.
#[derive(Debug)]
pub struct JobRun {
    pub info: JobInfo,
    /// Archivos publicados
    pub result: Result<Vec<PathBuf>>,
}

/// Corre el flujo completo escuchando señales de terminación.
pub async fn run_job(req: JobRequest) -> JobRun {
    let cancel = Cancellation::new();
    let watcher = monitor::watch_signals(cancel.clone());
    let run = run_job_with(req, cancel).await;
    watcher.abort();
    run
}

/// Igual que [`run_job`] pero con una cancelación externa.
pub async fn run_job_with(req: JobRequest, cancel: Cancellation) -> JobRun {
    let mut tracker = JobTracker::new(&req);
    info!(
        "job {}: {} contra {} con {} procesos",
        tracker.id(),
        req.fasta.display(),
        req.reference.display(),
        req.num_proc
    );

    let result = execute(&req, &cancel, &mut tracker).await;
    if let Err(e) = &result {
        error!("job {} falló: {:#}", tracker.id(), e);
        tracker.fail(e);
    }

    JobRun {
        info: tracker.into_info(),
        result,
    }
}

async fn execute(
    req: &JobRequest,
    cancel: &Cancellation,
    tracker: &mut JobTracker,
) -> Result<Vec<PathBuf>> {
    req.validate()?;

    let blat = BlatCommand::new(&req.blat_bin, &req.blat_options)?;
    let format = OutputFormat::from_blat_options(blat.options());
    let header = HeaderPolicy::for_format(format, blat.options());

    // samtools sólo sabe ordenar SAM; mejor fallar antes de correr blat
    if req.output_kind == OutputKind::Bam && format != OutputFormat::Sam {
        return Err(MpBlatError::merge(format!(
            "la salida BAM necesita que blat escriba SAM (-out=sam), no {:?}",
            format
        ))
        .into());
    }

    let load = worker::host_load();
    if req.num_proc as usize > load.cpus {
        warn!(
            "num_proc={} supera las {} CPUs disponibles",
            req.num_proc, load.cpus
        );
    }
    info!(
        "host: {} CPUs, {:.1}% en uso, {}/{} MB de memoria",
        load.cpus, load.cpu_percent, load.mem_used_mb, load.mem_total_mb
    );

    let workspace = Workspace::create(&req.tmp_path, req.keep_tmp)?;
    tracker.set_workspace(workspace.path().to_path_buf());

    let outcome = run_in_workspace(req, &blat, format, header, &workspace, cancel, tracker).await;

    // El workspace se cierra pase lo que pase
    let closed = workspace.close();
    match (outcome, closed) {
        (Ok(published), Ok(_)) => Ok(published),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!("además falló la limpieza: {close_err}");
            Err(e)
        }
    }
}

async fn run_in_workspace(
    req: &JobRequest,
    blat: &BlatCommand,
    format: OutputFormat,
    header: HeaderPolicy,
    workspace: &Workspace,
    cancel: &Cancellation,
    tracker: &mut JobTracker,
) -> Result<Vec<PathBuf>> {
    /* ==== SPLITTING ==== */
    tracker.advance(JobStatus::Splitting)?;

    let layout = workspace.layout();
    let partitions = {
        let input = req.fasta.clone();
        let layout = layout.clone();
        let num_proc = req.num_proc;
        tokio::task::spawn_blocking(move || fasta::split_fasta(&input, num_proc, &layout))
            .await
            .context("la división del fasta terminó de forma anómala")??
    };
    check_interrupted(cancel)?;

    /* ==== DISPATCHING ==== */
    let tasks: Vec<WorkerTask> = partitions
        .into_iter()
        .map(|p| {
            let output = layout.output_path(&p, format.extension());
            WorkerTask::new(p, output)
        })
        .collect();
    tracker.record_tasks(&tasks);
    tracker.advance(JobStatus::Dispatching)?;

    let dispatcher = Dispatcher::new(blat.clone(), &req.reference, tasks.len());
    let report = dispatcher.run(tasks, cancel).await;
    tracker.record_tasks(&report.tasks);
    info!(
        "workers terminados en {:?}: {} ok, {} fallidos, {} cancelados",
        report.elapsed,
        tracker.info().completed_tasks,
        tracker.info().failed_tasks,
        tracker.info().cancelled_tasks
    );
    check_interrupted(cancel)?;

    if !report.all_succeeded() {
        tracker.advance(JobStatus::AnyFailed)?;
        return Err(match report.failure_error(blat.bin()) {
            Some(e) => e.into(),
            None => anyhow!("{} tareas no terminaron", report.tasks.len()),
        });
    }
    tracker.advance(JobStatus::AllSucceeded)?;

    /* ==== MERGING ==== */
    tracker.advance(JobStatus::Merging)?;

    let plan = MergePlan {
        outputs: report.tasks.iter().map(|t| t.output_path.clone()).collect(),
        header,
        merged: layout.merged_path(format.extension()),
        conversion: (req.output_kind == OutputKind::Bam)
            .then(|| (ConversionTool::new(&req.samtools_bin), layout.merged_path("bam"))),
        destination: req.output.clone(),
    };
    let published = tokio::task::spawn_blocking(move || plan.execute())
        .await
        .context("el merge terminó de forma anómala")??;

    tracker.finish(published.clone())?;
    Ok(published)
}

fn check_interrupted(cancel: &Cancellation) -> Result<()> {
    if cancel.reason() == Some(CancelReason::Signal) {
        return Err(MpBlatError::Interrupted.into());
    }
    Ok(())
}
