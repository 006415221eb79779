use serde::{Deserialize, Serialize};

/// Lifecycle state of a sandbox.
///
/// Legal transitions:
///
/// ```text
/// Provisioning -> Ready | Terminating | Failed
/// Ready        -> Running | Terminating | Failed
/// Running      -> Idle | Terminating | Failed
/// Idle         -> Running | Terminating | Failed
/// Terminating  -> Terminated | Failed
/// Failed       -> Terminating
/// Terminated   -> (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Provisioning,
    Ready,
    Running,
    Idle,
    Terminating,
    Terminated,
    Failed,
}

impl SandboxState {
    /// Whether a transition from `self` to `to` is legal.
    pub fn can_transition(self, to: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, to),
            (Provisioning, Ready)
                // An operator may retire a sandbox that never finished
                // booting (e.g. a record orphaned by a crashed manager).
                | (Provisioning, Terminating)
                | (Ready, Running)
                | (Ready, Terminating)
                | (Running, Idle)
                | (Running, Terminating)
                | (Idle, Running)
                | (Idle, Terminating)
                | (Terminating, Terminated)
                | (Failed, Terminating)
                // Any non-terminal state may fail on unrecoverable error.
                | (Provisioning, Failed)
                | (Ready, Failed)
                | (Running, Failed)
                | (Idle, Failed)
                | (Terminating, Failed)
        )
    }

    /// States that count against the fleet-wide live-sandbox cap.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SandboxState::Provisioning
                | SandboxState::Ready
                | SandboxState::Running
                | SandboxState::Idle
        )
    }

    /// States from which a job may be submitted.
    pub fn accepts_jobs(self) -> bool {
        matches!(self, SandboxState::Ready | SandboxState::Idle)
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxState::Provisioning => "provisioning",
            SandboxState::Ready => "ready",
            SandboxState::Running => "running",
            SandboxState::Idle => "idle",
            SandboxState::Terminating => "terminating",
            SandboxState::Terminated => "terminated",
            SandboxState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::SandboxState::*;

    #[test]
    fn happy_path_transitions() {
        assert!(Provisioning.can_transition(Ready));
        assert!(Provisioning.can_transition(Terminating));
        assert!(Ready.can_transition(Running));
        assert!(Running.can_transition(Idle));
        assert!(Idle.can_transition(Running));
        assert!(Idle.can_transition(Terminating));
        assert!(Terminating.can_transition(Terminated));
    }

    #[test]
    fn failure_transitions() {
        assert!(Provisioning.can_transition(Failed));
        assert!(Running.can_transition(Failed));
        assert!(Terminating.can_transition(Failed));
        assert!(Failed.can_transition(Terminating));
    }

    #[test]
    fn terminated_is_terminal() {
        for to in [
            Provisioning,
            Ready,
            Running,
            Idle,
            Terminating,
            Terminated,
            Failed,
        ] {
            assert!(!Terminated.can_transition(to), "Terminated -> {to}");
        }
    }

    #[test]
    fn no_resurrection_or_skips() {
        assert!(!Terminated.can_transition(Running));
        assert!(!Provisioning.can_transition(Running));
        assert!(!Ready.can_transition(Idle));
        assert!(!Failed.can_transition(Ready));
        assert!(!Failed.can_transition(Failed));
    }

    #[test]
    fn live_states() {
        assert!(Provisioning.is_live());
        assert!(Ready.is_live());
        assert!(Running.is_live());
        assert!(Idle.is_live());
        assert!(!Terminating.is_live());
        assert!(!Terminated.is_live());
        assert!(!Failed.is_live());
    }

    #[test]
    fn job_accepting_states() {
        assert!(Ready.accepts_jobs());
        assert!(Idle.accepts_jobs());
        assert!(!Running.accepts_jobs());
        assert!(!Provisioning.accepts_jobs());
        assert!(!Failed.accepts_jobs());
    }
}
