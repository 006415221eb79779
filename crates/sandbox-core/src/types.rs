use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::SandboxState;

/// Backend-assigned container identifier (Docker container id or name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource allocation for one sandbox.
///
/// CPU is expressed in millicores so aggregate accounting stays integral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_milli: u32,
    pub memory_mb: u32,
    /// Maximum wall-clock lifetime of the sandbox.
    #[serde(with = "duration_secs")]
    pub wall_time: Duration,
}

/// Serialize durations as whole seconds to keep persisted records readable.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Registry record for one sandbox. The `id` is assigned at creation and
/// never changes for the lifetime of the manager process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: Uuid,
    pub owner: String,
    pub state: SandboxState,
    pub limits: ResourceLimits,
    pub image: String,
    pub container_id: Option<ContainerId>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl SandboxRecord {
    pub fn new(owner: &str, image: &str, limits: ResourceLimits) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            state: SandboxState::Provisioning,
            limits,
            image: image.to_string(),
            container_id: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Seconds since the last recorded activity.
    pub fn idle_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_activity_at).num_seconds()
    }

    /// Seconds since creation.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }
}

/// What the runtime needs to create a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub sandbox_id: Uuid,
    pub image: String,
    pub limits: ResourceLimits,
    /// Isolated bridge network the container attaches to. Never the host
    /// network.
    pub network: String,
    pub env: Vec<(String, String)>,
}

/// One command execution inside a running container.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub timeout: Duration,
}

/// Which stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStreamKind {
    Stdout,
    Stderr,
}

/// A piece of process output, delivered in arrival order.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub kind: OutputStreamKind,
    pub data: Vec<u8>,
}

/// Terminal outcome of an execution job. Every job resolves to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "exit_code")]
pub enum JobOutcome {
    Completed(i32),
    TimedOut,
    Cancelled,
    Crashed,
}

/// One code-execution request bound to a sandbox, retained for audit until
/// explicit cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub id: Uuid,
    pub sandbox_id: Uuid,
    pub command: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<JobOutcome>,
}

impl ExecutionJob {
    pub fn new(sandbox_id: Uuid, command: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sandbox_id,
            command,
            submitted_at: Utc::now(),
            completed_at: None,
            outcome: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            cpu_milli: 1000,
            memory_mb: 512,
            wall_time: Duration::from_secs(3600),
        }
    }

    #[test]
    fn new_record_starts_provisioning() {
        let rec = SandboxRecord::new("tenant-a", "python:3.11-slim", limits());
        assert_eq!(rec.state, SandboxState::Provisioning);
        assert_eq!(rec.owner, "tenant-a");
        assert!(rec.container_id.is_none());
        assert_eq!(rec.created_at, rec.last_activity_at);
    }

    #[test]
    fn record_ids_are_unique() {
        let a = SandboxRecord::new("t", "img", limits());
        let b = SandboxRecord::new("t", "img", limits());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut rec = SandboxRecord::new("tenant-a", "img", limits());
        rec.container_id = Some(ContainerId("abc123".into()));
        let json = serde_json::to_string(&rec).unwrap();
        let back: SandboxRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, rec.id);
        assert_eq!(back.state, rec.state);
        assert_eq!(back.limits, rec.limits);
        assert_eq!(back.container_id, rec.container_id);
    }

    #[test]
    fn wall_time_serializes_as_seconds() {
        let json = serde_json::to_value(limits()).unwrap();
        assert_eq!(json["wall_time"], 3600);
    }

    #[test]
    fn job_terminal_only_with_outcome() {
        let mut job = ExecutionJob::new(Uuid::new_v4(), vec!["true".into()]);
        assert!(!job.is_terminal());
        job.outcome = Some(JobOutcome::Completed(0));
        assert!(job.is_terminal());
    }

    #[test]
    fn outcome_serializes_tagged() {
        let json = serde_json::to_value(JobOutcome::Completed(2)).unwrap();
        assert_eq!(json["kind"], "completed");
        assert_eq!(json["exit_code"], 2);
        let json = serde_json::to_value(JobOutcome::TimedOut).unwrap();
        assert_eq!(json["kind"], "timed_out");
    }
}
