//! Shared test fixtures: a scripted fake container runtime and a fully
//! wired manager stack.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use sandbox_core::{
    ContainerId, ContainerRuntime, ContainerSpec, ExecHandle, ExecSpec, OutputChunk,
    OutputStreamKind, SandboxError, OUTPUT_CHANNEL_CAPACITY,
};
use sandboxd::config::Config;
use sandboxd::events::LogSink;
use sandboxd::gateway::Gateway;
use sandboxd::governor::{Governor, GovernorConfig};
use sandboxd::http::{router, AppState};
use sandboxd::lifecycle::{Controller, ControllerConfig};
use sandboxd::registry::Registry;
use sandboxd::store::{MemoryStore, StateStore};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// What `exec` should do on the fake runtime.
#[derive(Debug, Clone)]
pub enum ExecScript {
    /// Emit the chunks on stdout, then exit with the code.
    Complete(Vec<&'static str>, i32),
    /// Emit nothing and wait for cancellation.
    Hang,
}

/// In-memory stand-in for the Docker backend, driven by counters and a
/// swappable exec script.
pub struct FakeRuntime {
    pub create_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    /// How many create calls fail before one succeeds.
    pub fail_creates: AtomicUsize,
    /// Report all containers as dead (crash simulation).
    pub crashed: AtomicBool,
    pub script: Mutex<ExecScript>,
    /// Every write_file call: (path, mode).
    pub writes: Mutex<Vec<(String, Option<u32>)>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            create_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            fail_creates: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            script: Mutex::new(ExecScript::Complete(vec!["ok\n"], 0)),
            writes: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRuntime {
    pub fn set_script(&self, script: ExecScript) {
        *self.script.lock().unwrap() = script;
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, spec: &ContainerSpec) -> sandbox_core::Result<ContainerId> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.fail_creates) {
            return Err(SandboxError::CreationFailed("scripted".into()));
        }
        Ok(ContainerId(format!("fake-{}", spec.sandbox_id)))
    }

    async fn start(&self, _id: &ContainerId) -> sandbox_core::Result<()> {
        Ok(())
    }

    async fn stop(&self, _id: &ContainerId, _grace: Duration) -> sandbox_core::Result<()> {
        Ok(())
    }

    async fn kill(&self, _id: &ContainerId) -> sandbox_core::Result<()> {
        Ok(())
    }

    async fn remove(&self, _id: &ContainerId) -> sandbox_core::Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_running(&self, _id: &ContainerId) -> sandbox_core::Result<bool> {
        Ok(!self.crashed.load(Ordering::SeqCst))
    }

    async fn exec(&self, _id: &ContainerId, _spec: ExecSpec) -> sandbox_core::Result<ExecHandle> {
        let script = self.script.lock().unwrap().clone();
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            match script {
                ExecScript::Complete(chunks, code) => {
                    for chunk in chunks {
                        let _ = out_tx
                            .send(OutputChunk {
                                kind: OutputStreamKind::Stdout,
                                data: chunk.as_bytes().to_vec(),
                            })
                            .await;
                    }
                    drop(out_tx);
                    let _ = exit_tx.send(Ok(code));
                }
                ExecScript::Hang => {
                    token.cancelled().await;
                    drop(out_tx);
                    let _ = exit_tx.send(Ok(-1));
                }
            }
        });

        Ok(ExecHandle {
            output: out_rx,
            exit: exit_rx,
            cancel,
        })
    }

    async fn write_file(
        &self,
        _id: &ContainerId,
        path: &str,
        _content: &[u8],
        mode: Option<u32>,
    ) -> sandbox_core::Result<()> {
        self.writes.lock().unwrap().push((path.to_string(), mode));
        Ok(())
    }

    async fn read_file(&self, _id: &ContainerId, path: &str) -> sandbox_core::Result<Vec<u8>> {
        Ok(format!("contents of {path}").into_bytes())
    }
}

/// A fully wired manager over the fake runtime.
pub struct Harness {
    pub config: Arc<Config>,
    pub runtime: Arc<FakeRuntime>,
    pub registry: Arc<Registry>,
    pub governor: Arc<Governor>,
    pub controller: Arc<Controller>,
    pub gateway: Arc<Gateway>,
}

impl Harness {
    pub fn new(vars: &[(&str, &str)]) -> Self {
        let map: std::collections::HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Arc::new(Config::from_vars(|key| map.get(key).cloned()).unwrap());

        let runtime = Arc::new(FakeRuntime::default());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(Registry::new(store, config.purge_grace));
        let governor = Arc::new(Governor::new(GovernorConfig {
            max_sandboxes: config.max_containers,
            cpu_ceiling_milli: config.cpu_ceiling_milli,
            memory_ceiling_mb: config.memory_ceiling_mb,
            owner_max: config.owner_max,
        }));
        let controller = Arc::new(Controller::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::clone(&registry),
            Arc::clone(&governor),
            Arc::new(LogSink),
            ControllerConfig::from(config.as_ref()),
        ));
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::clone(&registry),
            config.job_timeout,
        ));

        Self {
            config,
            runtime,
            registry,
            governor,
            controller,
            gateway,
        }
    }

    pub fn app(&self) -> Router {
        router(AppState {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            governor: Arc::clone(&self.governor),
            controller: Arc::clone(&self.controller),
            gateway: Arc::clone(&self.gateway),
        })
    }
}
