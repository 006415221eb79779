use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use sandbox_core::{ContainerId, SandboxRecord, SandboxState};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ManagerError, ManagerResult};
use crate::store::StateStore;

const KEY_PREFIX: &str = "sandboxd:sandbox:";

/// Single source of truth for sandbox metadata.
///
/// One mutex serializes every mutation, which also serializes transitions
/// per sandbox id. Persistence to the [`StateStore`] happens after the
/// lock is released and is best-effort: a store failure is logged, never
/// surfaced to the lifecycle path.
pub struct Registry {
    records: Mutex<HashMap<Uuid, SandboxRecord>>,
    store: Arc<dyn StateStore>,
    /// TTL applied to persisted Terminated records so the store cleans
    /// itself up even if the purge sweep never runs again.
    terminated_ttl: Duration,
}

fn key(id: Uuid) -> String {
    format!("{KEY_PREFIX}{id}")
}

impl Registry {
    pub fn new(store: Arc<dyn StateStore>, terminated_ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            store,
            terminated_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, SandboxRecord>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add a new record. The id must not already be registered.
    pub async fn register(&self, record: SandboxRecord) -> ManagerResult<()> {
        {
            let mut records = self.lock();
            if records.contains_key(&record.id) {
                return Err(ManagerError::Store(format!(
                    "duplicate sandbox id {}",
                    record.id
                )));
            }
            records.insert(record.id, record.clone());
        }
        self.persist(&record).await;
        Ok(())
    }

    pub fn find(&self, id: Uuid) -> Option<SandboxRecord> {
        self.lock().get(&id).cloned()
    }

    /// All records except Terminated ones.
    pub fn list_active(&self) -> Vec<SandboxRecord> {
        self.lock()
            .values()
            .filter(|r| r.state != SandboxState::Terminated)
            .cloned()
            .collect()
    }

    /// Terminated records, for the purge sweep.
    pub fn list_terminated(&self) -> Vec<SandboxRecord> {
        self.lock()
            .values()
            .filter(|r| r.state == SandboxState::Terminated)
            .cloned()
            .collect()
    }

    /// Count of records in live states (toward the fleet cap).
    pub fn live_count(&self) -> usize {
        self.lock().values().filter(|r| r.state.is_live()).count()
    }

    /// Apply a state transition, enforcing the state machine. Illegal
    /// transitions fail and leave the record unchanged.
    pub async fn transition(&self, id: Uuid, to: SandboxState) -> ManagerResult<SandboxState> {
        let record = {
            let mut records = self.lock();
            let record = records.get_mut(&id).ok_or(ManagerError::NotFound)?;
            if !record.state.can_transition(to) {
                return Err(ManagerError::InvalidTransition {
                    from: record.state,
                    to,
                });
            }
            record.state = to;
            record.clone()
        };
        self.persist(&record).await;
        Ok(to)
    }

    /// Record the backend container for a sandbox.
    pub async fn set_container(&self, id: Uuid, container_id: ContainerId) -> ManagerResult<()> {
        let record = {
            let mut records = self.lock();
            let record = records.get_mut(&id).ok_or(ManagerError::NotFound)?;
            record.container_id = Some(container_id);
            record.clone()
        };
        self.persist(&record).await;
        Ok(())
    }

    /// Bump `last_activity_at`. Fails on unknown or terminated sandboxes.
    pub async fn touch(&self, id: Uuid) -> ManagerResult<()> {
        let record = {
            let mut records = self.lock();
            let record = records.get_mut(&id).ok_or(ManagerError::NotFound)?;
            if record.state == SandboxState::Terminated {
                return Err(ManagerError::NotFound);
            }
            record.last_activity_at = Utc::now();
            record.clone()
        };
        self.persist(&record).await;
        Ok(())
    }

    /// Drop a record entirely (after the terminated grace period, or when
    /// rolling back a failed provision).
    pub async fn purge(&self, id: Uuid) {
        self.lock().remove(&id);
        if let Err(e) = self.store.del(&key(id)).await {
            warn!(id = %id, error = %e, "failed to delete persisted record");
        }
    }

    /// Reload persisted records after a restart.
    ///
    /// Anything that was live (or mid-teardown) when the previous process
    /// died is re-registered as `Failed` so the sweep reaps the orphaned
    /// container. Returns the number of records restored.
    pub async fn restore(&self) -> usize {
        let keys = match self.store.keys(KEY_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "registry restore: listing keys failed");
                return 0;
            }
        };

        let mut restored = 0;
        for k in keys {
            let raw = match self.store.get(&k).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %k, error = %e, "registry restore: get failed");
                    continue;
                }
            };
            let mut record: SandboxRecord = match serde_json::from_str(&raw) {
                Ok(r) => r,
                Err(e) => {
                    warn!(key = %k, error = %e, "registry restore: corrupt record");
                    continue;
                }
            };
            if record.state != SandboxState::Terminated {
                record.state = SandboxState::Failed;
            }
            self.lock().insert(record.id, record);
            restored += 1;
        }
        restored
    }

    async fn persist(&self, record: &SandboxRecord) {
        let value = match serde_json::to_string(record) {
            Ok(v) => v,
            Err(e) => {
                warn!(id = %record.id, error = %e, "failed to serialize record");
                return;
            }
        };
        let result = if record.state == SandboxState::Terminated {
            self.store
                .set_ex(&key(record.id), &value, self.terminated_ttl)
                .await
        } else {
            self.store.set(&key(record.id), &value).await
        };
        if let Err(e) = result {
            warn!(id = %record.id, error = %e, "failed to persist record");
        }
    }
}
