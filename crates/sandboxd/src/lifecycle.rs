use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use sandbox_core::{
    ContainerId, ContainerRuntime, ContainerSpec, ResourceLimits, SandboxRecord, SandboxState,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ManagerError, ManagerResult};
use crate::events::{EventKind, EventSink, SandboxEvent};
use crate::governor::{Governor, Grant};
use crate::registry::Registry;

/// Bound on a single runtime call made from the reaper path (liveness
/// probe, kill, remove) so one wedged engine call cannot stall the sweep.
/// Graceful stop gets this on top of its grace period.
const RUNTIME_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub default_image: String,
    pub network: String,
    /// Graceful-stop window before the runtime escalates to SIGKILL.
    pub grace_period: Duration,
    /// Sandboxes idle longer than this are reaped.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long Terminated records remain queryable before purge.
    pub purge_grace: Duration,
}

impl From<&Config> for ControllerConfig {
    fn from(config: &Config) -> Self {
        Self {
            default_image: config.image.clone(),
            network: config.network.clone(),
            grace_period: config.grace_period,
            idle_timeout: config.sandbox_timeout,
            sweep_interval: config.sweep_interval,
            purge_grace: config.purge_grace,
        }
    }
}

/// Drives sandboxes through their state machine: provisioning with
/// rollback, teardown, and the periodic reaper sweep.
///
/// The controller is the only component that releases governor grants, so
/// every admission is paired with exactly one release no matter which path
/// (teardown, failed provision, crash) retires the sandbox.
pub struct Controller {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<Registry>,
    governor: Arc<Governor>,
    events: Arc<dyn EventSink>,
    grants: Mutex<HashMap<Uuid, Grant>>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<Registry>,
        governor: Arc<Governor>,
        events: Arc<dyn EventSink>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            governor,
            events,
            grants: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn grants(&self) -> MutexGuard<'_, HashMap<Uuid, Grant>> {
        self.grants
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Release the grant for a sandbox, if it is still held. Idempotent:
    /// the map hand-off guarantees a single release per admission.
    fn release_grant(&self, id: Uuid) {
        let grant = self.grants().remove(&id);
        if let Some(grant) = grant {
            self.governor.release(grant);
        }
    }

    /// Admit, register, and boot a new sandbox.
    ///
    /// On any failure after admission the partial work is rolled back:
    /// a half-created container is removed, the record is dropped, and
    /// the grant is returned before the error surfaces.
    pub async fn provision(
        &self,
        owner: &str,
        image: Option<String>,
        limits: ResourceLimits,
    ) -> ManagerResult<SandboxRecord> {
        let grant = self.governor.admit(owner, &limits)?;
        let image = image.unwrap_or_else(|| self.config.default_image.clone());
        let record = SandboxRecord::new(owner, &image, limits);
        let id = record.id;

        if let Err(e) = self.registry.register(record).await {
            self.governor.release(grant);
            return Err(e);
        }
        self.grants().insert(id, grant);

        let spec = ContainerSpec {
            sandbox_id: id,
            image,
            limits,
            network: self.config.network.clone(),
            env: Vec::new(),
        };

        if let Err(e) = self.boot_and_activate(id, &spec).await {
            error!(id = %id, error = %e, "provisioning failed, rolling back");
            self.remove_leftover_container(id).await;
            let _ = self.registry.transition(id, SandboxState::Failed).await;
            self.registry.purge(id).await;
            self.release_grant(id);
            self.events
                .publish(SandboxEvent::new(EventKind::Failed, id, owner))
                .await;
            return Err(ManagerError::Provision(e.to_string()));
        }

        self.events
            .publish(SandboxEvent::new(EventKind::Created, id, owner))
            .await;
        info!(id = %id, owner = %owner, "sandbox provisioned");
        self.registry.find(id).ok_or(ManagerError::NotFound)
    }

    async fn boot_and_activate(&self, id: Uuid, spec: &ContainerSpec) -> ManagerResult<()> {
        let container = self.boot(spec).await?;
        self.registry.set_container(id, container).await?;
        self.registry.transition(id, SandboxState::Ready).await?;
        Ok(())
    }

    /// Create and start the container, retrying the whole sequence once on
    /// a transient runtime failure.
    async fn boot(&self, spec: &ContainerSpec) -> ManagerResult<ContainerId> {
        match self.try_boot(spec).await {
            Ok(container) => Ok(container),
            Err(first) => {
                warn!(
                    sandbox_id = %spec.sandbox_id,
                    error = %first,
                    "container boot failed, retrying once"
                );
                Ok(self.try_boot(spec).await?)
            }
        }
    }

    async fn try_boot(&self, spec: &ContainerSpec) -> sandbox_core::Result<ContainerId> {
        let container = self.runtime.create(spec).await?;
        match self.runtime.start(&container).await {
            Ok(()) => Ok(container),
            Err(e) => {
                if let Err(rm) = self.runtime.remove(&container).await {
                    warn!(container = %container, error = %rm, "failed to remove partial container");
                }
                Err(e)
            }
        }
    }

    async fn remove_leftover_container(&self, id: Uuid) {
        let container = self.registry.find(id).and_then(|r| r.container_id);
        if let Some(container) = container {
            if let Err(e) = self.runtime.remove(&container).await {
                warn!(container = %container, error = %e, "rollback container removal failed");
            }
        }
    }

    /// Stop, remove, and retire a sandbox. Idempotent: repeated calls (or a
    /// racing sweep) observe Terminating/Terminated and return success.
    pub async fn teardown(&self, id: Uuid) -> ManagerResult<()> {
        let record = self.registry.find(id).ok_or(ManagerError::NotFound)?;
        if matches!(
            record.state,
            SandboxState::Terminating | SandboxState::Terminated
        ) {
            return Ok(());
        }

        // Only one caller wins this transition; the loser raced a
        // concurrent teardown and can report success.
        match self.registry.transition(id, SandboxState::Terminating).await {
            Ok(_) => {}
            Err(ManagerError::InvalidTransition {
                from: SandboxState::Terminating | SandboxState::Terminated,
                ..
            }) => return Ok(()),
            Err(e) => return Err(e),
        }

        if let Some(container) = record.container_id.clone() {
            // Teardown runs on the sweep path, so every runtime call is
            // deadline-bounded: a hung engine call escalates instead of
            // stalling all reaping.
            let stop_budget = self.config.grace_period + RUNTIME_TIMEOUT;
            match tokio::time::timeout(
                stop_budget,
                self.runtime.stop(&container, self.config.grace_period),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(id = %id, error = %e, "graceful stop failed, killing");
                    self.kill_bounded(id, &container).await;
                }
                Err(_) => {
                    warn!(id = %id, "graceful stop timed out, killing");
                    self.kill_bounded(id, &container).await;
                }
            }
            match tokio::time::timeout(RUNTIME_TIMEOUT, self.runtime.remove(&container)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(id = %id, error = %e, "container removal failed"),
                Err(_) => warn!(id = %id, "container removal timed out"),
            }
        }

        // Timestamp the retirement so the purge grace is measured from
        // termination, not from the last job.
        let _ = self.registry.touch(id).await;
        self.registry.transition(id, SandboxState::Terminated).await?;
        self.release_grant(id);
        self.events
            .publish(SandboxEvent::new(EventKind::Terminated, id, &record.owner))
            .await;
        info!(id = %id, "sandbox terminated");
        Ok(())
    }

    async fn kill_bounded(&self, id: Uuid, container: &ContainerId) {
        match tokio::time::timeout(RUNTIME_TIMEOUT, self.runtime.kill(container)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(id = %id, error = %e, "force kill failed"),
            Err(_) => warn!(id = %id, "force kill timed out"),
        }
    }

    /// Record external activity so the idle reaper leaves the sandbox alone.
    pub async fn heartbeat(&self, id: Uuid) -> ManagerResult<()> {
        let record = self.registry.find(id).ok_or(ManagerError::NotFound)?;
        if !record.state.is_live() {
            return Err(ManagerError::SandboxNotAvailable(record.state));
        }
        self.registry.touch(id).await
    }

    /// Write a file into a live sandbox's filesystem.
    pub async fn write_file(
        &self,
        id: Uuid,
        path: &str,
        content: &[u8],
        mode: Option<u32>,
    ) -> ManagerResult<()> {
        let container = self.live_container(id)?;
        self.runtime.write_file(&container, path, content, mode).await?;
        self.registry.touch(id).await
    }

    /// Read a file out of a live sandbox's filesystem.
    pub async fn read_file(&self, id: Uuid, path: &str) -> ManagerResult<Vec<u8>> {
        let container = self.live_container(id)?;
        let content = self.runtime.read_file(&container, path).await?;
        self.registry.touch(id).await?;
        Ok(content)
    }

    fn live_container(&self, id: Uuid) -> ManagerResult<ContainerId> {
        let record = self.registry.find(id).ok_or(ManagerError::NotFound)?;
        if !record.state.is_live() {
            return Err(ManagerError::SandboxNotAvailable(record.state));
        }
        record
            .container_id
            .ok_or(ManagerError::SandboxNotAvailable(record.state))
    }

    /// One pass of the reaper: expire idle and over-age sandboxes, detect
    /// crashed containers, reap Failed records, purge old Terminated ones.
    ///
    /// A crash observed this pass only marks the sandbox Failed (and frees
    /// its grant); the actual reap happens on the next pass, so the Failed
    /// state stays observable for at least one sweep interval.
    pub async fn sweep_once(&self) {
        let now = Utc::now();

        for record in self.registry.list_active() {
            match record.state {
                // In-flight operations own these records.
                SandboxState::Provisioning | SandboxState::Terminating => {}
                SandboxState::Failed => {
                    if let Err(e) = self.teardown(record.id).await {
                        warn!(id = %record.id, error = %e, "reaping failed sandbox");
                    }
                }
                SandboxState::Ready | SandboxState::Running | SandboxState::Idle => {
                    let idle_limit = secs_i64(self.config.idle_timeout);
                    let wall_limit = secs_i64(record.limits.wall_time);
                    if record.idle_secs(now) >= idle_limit {
                        info!(id = %record.id, "sandbox idle-expired");
                        if let Err(e) = self.teardown(record.id).await {
                            warn!(id = %record.id, error = %e, "idle teardown failed");
                        }
                    } else if record.age_secs(now) >= wall_limit {
                        info!(id = %record.id, "sandbox exceeded wall-time limit");
                        if let Err(e) = self.teardown(record.id).await {
                            warn!(id = %record.id, error = %e, "expiry teardown failed");
                        }
                    } else {
                        self.probe(&record).await;
                    }
                }
                SandboxState::Terminated => {}
            }
        }

        for record in self.registry.list_terminated() {
            if record.idle_secs(now) >= secs_i64(self.config.purge_grace) {
                self.registry.purge(record.id).await;
            }
        }
    }

    /// Check that the backing container is still up; mark the sandbox
    /// Failed if it died underneath us.
    async fn probe(&self, record: &SandboxRecord) {
        let Some(container) = record.container_id.clone() else {
            return;
        };
        match tokio::time::timeout(RUNTIME_TIMEOUT, self.runtime.is_running(&container)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                warn!(id = %record.id, "container exited unexpectedly");
                self.mark_failed(record).await;
            }
            Ok(Err(sandbox_core::SandboxError::ContainerNotFound(_))) => {
                warn!(id = %record.id, "container vanished");
                self.mark_failed(record).await;
            }
            Ok(Err(e)) => {
                warn!(id = %record.id, error = %e, "liveness probe failed");
            }
            Err(_) => {
                warn!(id = %record.id, "liveness probe timed out");
            }
        }
    }

    async fn mark_failed(&self, record: &SandboxRecord) {
        if self
            .registry
            .transition(record.id, SandboxState::Failed)
            .await
            .is_ok()
        {
            self.release_grant(record.id);
            self.events
                .publish(SandboxEvent::new(
                    EventKind::Failed,
                    record.id,
                    &record.owner,
                ))
                .await;
        }
    }

    /// Run the sweep on its configured interval until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a freshly started
        // manager doesn't probe before anything exists.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_once().await,
                () = shutdown.cancelled() => break,
            }
        }
        info!("reaper sweep stopped");
    }

    /// Tear down every non-terminated sandbox. Used on graceful shutdown.
    pub async fn drain(&self) {
        for record in self.registry.list_active() {
            if let Err(e) = self.teardown(record.id).await {
                warn!(id = %record.id, error = %e, "drain teardown failed");
            }
        }
    }
}

fn secs_i64(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
