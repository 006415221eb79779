//! End-to-end lifecycle tests over the fake runtime: admission under
//! concurrency, idle reaping, crash detection, and job cancellation.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use sandbox_core::{ExecutionJob, SandboxState};
use sandboxd::error::ManagerError;
use sandboxd::gateway::Gateway;
use uuid::Uuid;

mod common;

use common::{ExecScript, Harness};

fn default_limits(h: &Harness) -> sandbox_core::ResourceLimits {
    h.config.resolve_limits(None, None, None)
}

async fn wait_terminal(gateway: &Gateway, job_id: Uuid) -> ExecutionJob {
    for _ in 0..200 {
        let job = gateway.status(job_id).unwrap();
        if job.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never settled");
}

#[tokio::test]
async fn concurrent_provisions_never_exceed_the_cap() {
    let h = Arc::new(Harness::new(&[("MAX_SANDBOX_CONTAINERS", "10")]));

    let mut handles = Vec::new();
    for i in 0..25 {
        let h = Arc::clone(&h);
        handles.push(tokio::spawn(async move {
            let limits = default_limits(&h);
            h.controller
                .provision(&format!("tenant-{i}"), None, limits)
                .await
                .is_ok()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 10);
    assert_eq!(h.governor.snapshot().live, 10);
    // Denied requests never reached the container runtime.
    assert_eq!(h.runtime.create_calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn eleventh_provision_denied_without_touching_the_runtime() {
    let h = Harness::new(&[("MAX_SANDBOX_CONTAINERS", "10")]);

    for i in 0..10 {
        let limits = default_limits(&h);
        h.controller
            .provision(&format!("tenant-{i}"), None, limits)
            .await
            .unwrap();
    }

    let limits = default_limits(&h);
    let err = h
        .controller
        .provision("tenant-10", None, limits)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::ResourceExhausted(_)));
    assert_eq!(h.runtime.create_calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn provision_teardown_round_trips_all_accounting() {
    let h = Harness::new(&[]);
    let before = h.governor.snapshot();

    let limits = default_limits(&h);
    let record = h.controller.provision("tenant-a", None, limits).await.unwrap();
    assert_eq!(h.governor.snapshot().live, 1);

    h.controller.teardown(record.id).await.unwrap();
    assert_eq!(h.governor.snapshot(), before);
    assert_eq!(
        h.registry.find(record.id).map(|r| r.state),
        Some(SandboxState::Terminated)
    );
}

#[tokio::test]
async fn idle_sandbox_reaped_after_timeout_never_before() {
    let h = Harness::new(&[("SANDBOX_TIMEOUT", "1")]);
    let limits = default_limits(&h);
    let record = h.controller.provision("tenant-a", None, limits).await.unwrap();

    // Fresh sandbox survives a sweep.
    h.controller.sweep_once().await;
    assert_eq!(
        h.registry.find(record.id).map(|r| r.state),
        Some(SandboxState::Ready)
    );

    // Once idle past the timeout, the next sweep reaps it.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.controller.sweep_once().await;
    assert_eq!(
        h.registry.find(record.id).map(|r| r.state),
        Some(SandboxState::Terminated)
    );
    assert_eq!(h.governor.snapshot().live, 0);
}

#[tokio::test]
async fn crashed_container_observed_failed_then_reaped() {
    let h = Harness::new(&[]);
    let limits = default_limits(&h);
    let record = h.controller.provision("tenant-a", None, limits).await.unwrap();

    h.runtime.crashed.store(true, Ordering::SeqCst);

    // First sweep: Failed is observable and the grant is already back.
    h.controller.sweep_once().await;
    assert_eq!(
        h.registry.find(record.id).map(|r| r.state),
        Some(SandboxState::Failed)
    );
    assert_eq!(h.governor.snapshot().live, 0);

    // Capacity freed by the crash is immediately usable.
    let limits = default_limits(&h);
    h.controller.provision("tenant-b", None, limits).await.unwrap();

    // Next sweep reaps the failed record.
    h.controller.sweep_once().await;
    assert_eq!(
        h.registry.find(record.id).map(|r| r.state),
        Some(SandboxState::Terminated)
    );
}

#[tokio::test]
async fn double_cancel_reports_already_terminal() {
    let h = Harness::new(&[]);
    h.runtime.set_script(ExecScript::Hang);

    let limits = default_limits(&h);
    let record = h.controller.provision("tenant-a", None, limits).await.unwrap();
    let job = h
        .gateway
        .submit(record.id, vec!["sleep".into(), "60".into()], None)
        .await
        .unwrap();

    h.gateway.cancel(job.id).unwrap();
    let settled = wait_terminal(&h.gateway, job.id).await;
    assert_eq!(settled.outcome, Some(sandbox_core::JobOutcome::Cancelled));

    assert!(matches!(
        h.gateway.cancel(job.id).unwrap_err(),
        ManagerError::AlreadyTerminal
    ));
    // The sandbox settled back to Idle exactly once.
    assert_eq!(
        h.registry.find(record.id).map(|r| r.state),
        Some(SandboxState::Idle)
    );
}

#[tokio::test]
async fn teardown_during_running_job_wins() {
    let h = Harness::new(&[]);
    h.runtime.set_script(ExecScript::Hang);

    let limits = default_limits(&h);
    let record = h.controller.provision("tenant-a", None, limits).await.unwrap();
    let job = h
        .gateway
        .submit(record.id, vec!["sleep".into(), "60".into()], None)
        .await
        .unwrap();

    h.controller.teardown(record.id).await.unwrap();
    assert_eq!(
        h.registry.find(record.id).map(|r| r.state),
        Some(SandboxState::Terminated)
    );

    // The job can still be cancelled and settles without resurrecting the
    // sandbox out of Terminated.
    h.gateway.cancel(job.id).unwrap();
    wait_terminal(&h.gateway, job.id).await;
    assert_eq!(
        h.registry.find(record.id).map(|r| r.state),
        Some(SandboxState::Terminated)
    );
}
