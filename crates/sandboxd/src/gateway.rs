use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use sandbox_core::{
    ContainerRuntime, ExecSpec, ExecutionJob, JobOutcome, OutputChunk, SandboxState,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ManagerError, ManagerResult};
use crate::registry::Registry;

struct JobEntry {
    job: ExecutionJob,
    /// One-shot: the first stream request takes the receiver.
    output: Option<mpsc::Receiver<OutputChunk>>,
    cancel: CancellationToken,
    /// Distinguishes a caller-requested cancel from the deadline firing
    /// the same token.
    user_cancel: Arc<AtomicBool>,
}

/// Routes execution requests into sandboxes and tracks job lifecycles.
///
/// One job per sandbox at a time: submission flips the sandbox to Running,
/// and the state machine rejects a second submission until the watcher
/// task settles the first job and returns the sandbox to Idle.
pub struct Gateway {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<Registry>,
    // Shared with detached watcher tasks, which outlive the submit call.
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    default_timeout: Duration,
}

impl Gateway {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<Registry>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            registry,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<Uuid, JobEntry>> {
        lock_jobs(&self.jobs)
    }

    /// Start a command in the sandbox and return the accepted job.
    ///
    /// The job resolves asynchronously; callers follow up with
    /// [`stream_output`](Self::stream_output) and [`status`](Self::status).
    pub async fn submit(
        &self,
        sandbox_id: Uuid,
        command: Vec<String>,
        timeout: Option<Duration>,
    ) -> ManagerResult<ExecutionJob> {
        let record = self.registry.find(sandbox_id).ok_or(ManagerError::NotFound)?;
        if !record.state.accepts_jobs() {
            return Err(ManagerError::SandboxNotAvailable(record.state));
        }
        let container = record
            .container_id
            .clone()
            .ok_or(ManagerError::SandboxNotAvailable(record.state))?;

        // Winning this transition claims the sandbox; a concurrent submit
        // loses with InvalidTransition and reports the busy state instead.
        match self
            .registry
            .transition(sandbox_id, SandboxState::Running)
            .await
        {
            Ok(_) => {}
            Err(ManagerError::InvalidTransition { from, .. }) => {
                return Err(ManagerError::SandboxNotAvailable(from));
            }
            Err(e) => return Err(e),
        }

        // A job can never outlive its sandbox's wall-time budget.
        let timeout = timeout
            .unwrap_or(self.default_timeout)
            .min(record.limits.wall_time);
        let spec = ExecSpec {
            command: command.clone(),
            timeout,
        };
        let handle = match self.runtime.exec(&container, spec).await {
            Ok(handle) => handle,
            Err(e) => {
                // Exec never started; give the sandbox back.
                if let Err(t) = self.registry.transition(sandbox_id, SandboxState::Idle).await {
                    warn!(sandbox_id = %sandbox_id, error = %t, "failed to return sandbox to idle");
                }
                return Err(e.into());
            }
        };

        let job = ExecutionJob::new(sandbox_id, command);
        let job_id = job.id;
        let user_cancel = Arc::new(AtomicBool::new(false));
        self.jobs().insert(
            job_id,
            JobEntry {
                job: job.clone(),
                output: Some(handle.output),
                cancel: handle.cancel.clone(),
                user_cancel: Arc::clone(&user_cancel),
            },
        );

        let jobs = Arc::clone(&self.jobs);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(watch(
            jobs,
            registry,
            job_id,
            sandbox_id,
            handle.exit,
            handle.cancel,
            user_cancel,
            timeout,
        ));

        info!(job_id = %job_id, sandbox_id = %sandbox_id, "job submitted");
        Ok(job)
    }

    /// Take the job's output stream. Each job's stream can be consumed
    /// exactly once.
    pub fn stream_output(&self, job_id: Uuid) -> ManagerResult<mpsc::Receiver<OutputChunk>> {
        let mut jobs = self.jobs();
        let entry = jobs.get_mut(&job_id).ok_or(ManagerError::NotFound)?;
        entry.output.take().ok_or(ManagerError::StreamConsumed)
    }

    /// Request cancellation of a running job. Settling still happens on
    /// the watcher task; this only fires the signal.
    pub fn cancel(&self, job_id: Uuid) -> ManagerResult<()> {
        let jobs = self.jobs();
        let entry = jobs.get(&job_id).ok_or(ManagerError::NotFound)?;
        if entry.job.is_terminal() {
            return Err(ManagerError::AlreadyTerminal);
        }
        entry.user_cancel.store(true, Ordering::SeqCst);
        entry.cancel.cancel();
        Ok(())
    }

    pub fn status(&self, job_id: Uuid) -> ManagerResult<ExecutionJob> {
        self.jobs()
            .get(&job_id)
            .map(|entry| entry.job.clone())
            .ok_or(ManagerError::NotFound)
    }

    /// Drop a settled job from the audit map. Running jobs must be
    /// cancelled first.
    pub fn cleanup(&self, job_id: Uuid) -> ManagerResult<()> {
        let mut jobs = self.jobs();
        let entry = jobs.get(&job_id).ok_or(ManagerError::NotFound)?;
        if !entry.job.is_terminal() {
            return Err(ManagerError::NotTerminal);
        }
        jobs.remove(&job_id);
        Ok(())
    }

    /// Jobs bound to one sandbox, newest first.
    pub fn jobs_for_sandbox(&self, sandbox_id: Uuid) -> Vec<ExecutionJob> {
        let mut jobs: Vec<ExecutionJob> = self
            .jobs()
            .values()
            .filter(|entry| entry.job.sandbox_id == sandbox_id)
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs
    }
}

fn lock_jobs(jobs: &Mutex<HashMap<Uuid, JobEntry>>) -> MutexGuard<'_, HashMap<Uuid, JobEntry>> {
    jobs.lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Wait for the execution to settle, record its terminal outcome, and
/// return the sandbox to Idle.
#[allow(clippy::too_many_arguments)]
async fn watch(
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    registry: Arc<Registry>,
    job_id: Uuid,
    sandbox_id: Uuid,
    mut exit: tokio::sync::oneshot::Receiver<sandbox_core::Result<i32>>,
    cancel: CancellationToken,
    user_cancel: Arc<AtomicBool>,
    timeout: Duration,
) {
    let mut timed_out = false;
    let exit_result = tokio::select! {
        res = &mut exit => res,
        () = tokio::time::sleep(timeout) => {
            timed_out = true;
            cancel.cancel();
            // The runtime guarantees exit still resolves after cancel.
            exit.await
        }
    };

    let outcome = if user_cancel.load(Ordering::SeqCst) {
        JobOutcome::Cancelled
    } else if timed_out {
        JobOutcome::TimedOut
    } else {
        match exit_result {
            Ok(Ok(code)) => JobOutcome::Completed(code),
            Ok(Err(e)) => {
                warn!(job_id = %job_id, error = %e, "execution lost");
                JobOutcome::Crashed
            }
            Err(_) => {
                warn!(job_id = %job_id, "runtime dropped the exit channel");
                JobOutcome::Crashed
            }
        }
    };

    {
        let mut jobs = lock_jobs(&jobs);
        if let Some(entry) = jobs.get_mut(&job_id) {
            entry.job.outcome = Some(outcome);
            entry.job.completed_at = Some(Utc::now());
        }
    }
    info!(job_id = %job_id, outcome = ?outcome, "job settled");

    // Return the sandbox to Idle and count the job as activity. The
    // transition loses gracefully if a teardown claimed the sandbox while
    // the job was running.
    if let Err(e) = registry.transition(sandbox_id, SandboxState::Idle).await {
        debug!(sandbox_id = %sandbox_id, error = %e, "sandbox left running state during job");
    } else if let Err(e) = registry.touch(sandbox_id).await {
        debug!(sandbox_id = %sandbox_id, error = %e, "activity touch failed");
    }
}
