//! Crash recovery
//!
//! Runs at startup before the scheduler admits new work. Jobs persisted as
//! `running` are re-attached when their assistant PID is still alive and
//! failed otherwise; jobs caught inside the pre-run pipeline are
//! conservatively failed (a watcher may have been started and is now gone,
//! so the pipeline is not idempotently resumable).

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::{Job, JobStatus};
use crate::job::JobStore;
use crate::process::{self, registry};

/// Poll interval for re-attached PID monitoring
const REATTACH_POLL: Duration = Duration::from_secs(1);

/// What startup recovery did
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    pub reattached: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Reconcile persisted jobs with the actual process table
pub async fn recover(store: &Arc<JobStore>) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for job in store.list() {
        match job.status {
            JobStatus::Running => match job.assistant_pid {
                Some(pid) if process::is_alive(pid) => {
                    reattach(store, &job, pid);
                    report.reattached += 1;
                }
                _ => {
                    fail_crashed(store, &job)?;
                    report.failed += 1;
                }
            },
            status if status.is_pre_run() => {
                store.mutate(job.id, |j| {
                    salvage_output(store, j);
                    j.fail("server crashed during pre-run preparation");
                })?;
                report.failed += 1;
            }
            JobStatus::Cancelling => {
                // The subprocesses died with the old server; cancellation
                // is now complete.
                store.mutate(job.id, |j| {
                    if j.cancel_reason.is_none() {
                        j.cancel_reason = Some("cancelled by user".to_string());
                    }
                    j.set_status(JobStatus::Cancelled);
                })?;
                report.cancelled += 1;
            }
            // Created and queued jobs are re-admitted as-is.
            _ => {}
        }
    }

    info!(
        reattached = report.reattached,
        failed = report.failed,
        cancelled = report.cancelled,
        "crash recovery finished"
    );
    Ok(report)
}

/// Resume monitoring a PID that outlived the previous server.
///
/// The process is not our child, so there is no exit status to collect;
/// when it goes away we record completion (exit code 0 by assumption) or,
/// if a cancel arrived in the meantime, cancellation.
fn reattach(store: &Arc<JobStore>, job: &Job, pid: u32) {
    info!(job_id = %job.id, pid, "re-attaching to running assistant");
    registry::set_assistant(job.id, pid);

    let store = Arc::clone(store);
    let job_id = job.id;
    tokio::spawn(async move {
        process::wait_pid(pid, REATTACH_POLL).await;
        registry::remove(job_id);

        let result = store.mutate(job_id, |j| match j.status {
            JobStatus::Running => {
                salvage_output(&store, j);
                j.append_output("\n[server] re-attached assistant exited; exit status unavailable\n");
                j.exit_code = Some(0);
                j.set_status(JobStatus::Completed);
            }
            JobStatus::Cancelling => {
                if j.cancel_reason.is_none() {
                    j.cancel_reason = Some("cancelled by user".to_string());
                }
                j.set_status(JobStatus::Cancelled);
            }
            _ => {}
        });
        if let Err(e) = result {
            warn!(job_id = %job_id, "failed to finalize re-attached job: {:#}", e);
        }
    });
}

fn fail_crashed(store: &Arc<JobStore>, job: &Job) -> Result<()> {
    warn!(job_id = %job.id, "assistant died with the previous server");
    store.mutate(job.id, |j| {
        salvage_output(store, j);
        j.fail("server crashed while job was running");
    })?;
    Ok(())
}

/// Pull any partial output captured in the workspace mirror into the record
fn salvage_output(store: &JobStore, job: &mut Job) {
    let log_path = store.job_dir(job.id).join("output.log");
    let Ok(content) = std::fs::read_to_string(&log_path) else {
        return;
    };
    if content.len() > job.output.len() {
        job.output.clear();
        job.append_output(&content);
    }
}
