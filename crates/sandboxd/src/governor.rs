use std::collections::HashMap;
use std::sync::Mutex;

use sandbox_core::ResourceLimits;

use crate::error::{ManagerError, ManagerResult};

/// Ceilings the governor enforces.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub max_sandboxes: usize,
    pub cpu_ceiling_milli: u64,
    pub memory_ceiling_mb: u64,
    pub owner_max: Option<usize>,
}

/// A reservation handed out by [`Governor::admit`].
///
/// Deliberately neither `Clone` nor `Copy`: `release` consumes the grant,
/// so each admission can be released at most once and the compiler keeps
/// the admit/release pairing honest across every exit path.
#[derive(Debug)]
pub struct Grant {
    owner: String,
    cpu_milli: u32,
    memory_mb: u32,
}

#[derive(Debug, Default)]
struct Counters {
    live: usize,
    cpu_milli: u64,
    memory_mb: u64,
    per_owner: HashMap<String, usize>,
}

/// Point-in-time view of the governor's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorSnapshot {
    pub live: usize,
    pub cpu_milli: u64,
    pub memory_mb: u64,
}

/// Fleet-wide admission control.
///
/// All counters live behind one mutex, so a concurrent burst of `admit`
/// calls can never jointly over-commit: each call checks and reserves in
/// a single critical section.
pub struct Governor {
    config: GovernorConfig,
    counters: Mutex<Counters>,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Reserve capacity for one sandbox, or explain the denial.
    pub fn admit(&self, owner: &str, limits: &ResourceLimits) -> ManagerResult<Grant> {
        let mut c = lock(&self.counters);

        if c.live >= self.config.max_sandboxes {
            return Err(ManagerError::ResourceExhausted(format!(
                "sandbox cap reached ({})",
                self.config.max_sandboxes
            )));
        }
        if c.cpu_milli + u64::from(limits.cpu_milli) > self.config.cpu_ceiling_milli {
            return Err(ManagerError::ResourceExhausted(format!(
                "cpu ceiling reached ({} millicores)",
                self.config.cpu_ceiling_milli
            )));
        }
        if c.memory_mb + u64::from(limits.memory_mb) > self.config.memory_ceiling_mb {
            return Err(ManagerError::ResourceExhausted(format!(
                "memory ceiling reached ({} MB)",
                self.config.memory_ceiling_mb
            )));
        }
        if let Some(owner_max) = self.config.owner_max {
            let owned = c.per_owner.get(owner).copied().unwrap_or(0);
            if owned >= owner_max {
                return Err(ManagerError::ResourceExhausted(format!(
                    "owner quota reached ({owner_max})"
                )));
            }
        }

        c.live += 1;
        c.cpu_milli += u64::from(limits.cpu_milli);
        c.memory_mb += u64::from(limits.memory_mb);
        *c.per_owner.entry(owner.to_string()).or_insert(0) += 1;

        Ok(Grant {
            owner: owner.to_string(),
            cpu_milli: limits.cpu_milli,
            memory_mb: limits.memory_mb,
        })
    }

    /// Return a reservation. Consumes the grant.
    pub fn release(&self, grant: Grant) {
        let mut c = lock(&self.counters);
        c.live = c.live.saturating_sub(1);
        c.cpu_milli = c.cpu_milli.saturating_sub(u64::from(grant.cpu_milli));
        c.memory_mb = c.memory_mb.saturating_sub(u64::from(grant.memory_mb));
        if let Some(count) = c.per_owner.get_mut(&grant.owner) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                c.per_owner.remove(&grant.owner);
            }
        }
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        let c = lock(&self.counters);
        GovernorSnapshot {
            live: c.live,
            cpu_milli: c.cpu_milli,
            memory_mb: c.memory_mb,
        }
    }
}

/// A poisoned counter mutex means a panic mid-update; recover the data,
/// the arithmetic below is self-consistent either way.
fn lock(m: &Mutex<Counters>) -> std::sync::MutexGuard<'_, Counters> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn governor(max: usize) -> Governor {
        Governor::new(GovernorConfig {
            max_sandboxes: max,
            cpu_ceiling_milli: max as u64 * 1000,
            memory_ceiling_mb: max as u64 * 512,
            owner_max: None,
        })
    }

    fn limits() -> ResourceLimits {
        ResourceLimits {
            cpu_milli: 1000,
            memory_mb: 512,
            wall_time: Duration::from_secs(3600),
        }
    }

    #[test]
    fn admit_then_release_round_trips_counters() {
        let gov = governor(4);
        let before = gov.snapshot();

        let grant = gov.admit("tenant-a", &limits()).unwrap();
        let during = gov.snapshot();
        assert_eq!(during.live, 1);
        assert_eq!(during.cpu_milli, 1000);
        assert_eq!(during.memory_mb, 512);

        gov.release(grant);
        assert_eq!(gov.snapshot(), before);
    }

    #[test]
    fn eleventh_admission_denied_at_cap_ten() {
        let gov = governor(10);
        let mut grants = Vec::new();
        for i in 0..10 {
            grants.push(gov.admit(&format!("t{i}"), &limits()).unwrap());
        }

        let err = gov.admit("t10", &limits()).unwrap_err();
        assert!(matches!(err, ManagerError::ResourceExhausted(_)));
        assert_eq!(gov.snapshot().live, 10);

        // Releasing one opens the gate again.
        if let Some(grant) = grants.pop() {
            gov.release(grant);
        }
        let grant = gov.admit("t10", &limits()).unwrap();
        gov.release(grant);
    }

    #[test]
    fn cpu_ceiling_enforced_independently_of_count() {
        let gov = Governor::new(GovernorConfig {
            max_sandboxes: 10,
            cpu_ceiling_milli: 1500,
            memory_ceiling_mb: 10_000,
            owner_max: None,
        });
        let _first = gov.admit("a", &limits()).unwrap();
        let err = gov.admit("b", &limits()).unwrap_err();
        assert!(err.to_string().contains("cpu ceiling"), "got: {err}");
    }

    #[test]
    fn owner_quota_enforced_independently_of_fleet_cap() {
        let gov = Governor::new(GovernorConfig {
            max_sandboxes: 10,
            cpu_ceiling_milli: 10_000,
            memory_ceiling_mb: 10_000,
            owner_max: Some(1),
        });
        let _grant = gov.admit("a", &limits()).unwrap();
        let err = gov.admit("a", &limits()).unwrap_err();
        assert!(err.to_string().contains("owner quota"), "got: {err}");
        // A different owner is unaffected.
        let _other = gov.admit("b", &limits()).unwrap();
    }

    #[test]
    fn concurrent_admits_never_over_commit() {
        let gov = Arc::new(governor(10));
        let mut handles = Vec::new();
        for i in 0..64 {
            let gov = Arc::clone(&gov);
            handles.push(std::thread::spawn(move || {
                gov.admit(&format!("t{i}"), &limits()).is_ok()
            }));
        }

        let admitted = handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .filter(|admitted| *admitted)
            .count();

        assert_eq!(admitted, 10);
        let snap = gov.snapshot();
        assert_eq!(snap.live, 10);
        assert!(snap.cpu_milli <= 10_000);
        assert!(snap.memory_mb <= 5120);
    }

    #[test]
    fn owner_entry_cleared_on_last_release() {
        let gov = Governor::new(GovernorConfig {
            max_sandboxes: 4,
            cpu_ceiling_milli: 4000,
            memory_ceiling_mb: 4096,
            owner_max: Some(2),
        });
        let a = gov.admit("x", &limits()).unwrap();
        let b = gov.admit("x", &limits()).unwrap();
        gov.release(a);
        gov.release(b);
        // Quota fully restored.
        let c = gov.admit("x", &limits()).unwrap();
        gov.release(c);
    }
}
