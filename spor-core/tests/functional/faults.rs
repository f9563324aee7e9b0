// vim: tw=80
//! Scenarios that must fail, and fail for the right reason
use pretty_assertions::assert_eq;
use spor_core::{
    gateway::{Gateway, Request, Response},
    process::ProcessControl,
    recorder::Verdict,
    scenario::{Scenario, Settings},
    sim::SimConfig,
    verifier::VerificationOutcome,
    Result,
};
use std::{
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use super::*;

/// Passes requests through, except that every request with a given label
/// fails once its first `allowed` attempts have been used up.
struct Flaky {
    inner:   Arc<SimService>,
    label:   &'static str,
    allowed: AtomicUsize,
}

impl Gateway for Flaky {
    fn call(&self, req: &Request) -> Result<Response> {
        if req.label() == self.label {
            let left = self.allowed.load(Ordering::Relaxed);
            if left == 0 {
                return Ok(Response::with_code(2040, "injected failure"));
            }
            self.allowed.store(left - 1, Ordering::Relaxed);
        }
        self.inner.call(req)
    }
}

/// A service that loses acknowledged writes fails verification, but the
/// scenario itself runs to completion.
#[test_log::test]
fn lost_writes() {
    let rig = RigBuilder::new()
        .config(SimConfig {
            lose_acked_writes: true,
            ..Default::default()
        }).build();
    assert_eq!(t!(rig.harness.run(Scenario::Basic)), Verdict::Fail);
    let report = t!(rig.harness.recorder().read("basic"));
    assert!(report.diagnostics.aborted.is_none());
    assert_eq!(report.outcomes.len(), 1);
    assert!(matches!(report.outcomes[0],
                     VerificationOutcome::Mismatch { observed: None, .. }));
    let contents = t!(fs::read_to_string(rig.tempdir.path()
                                         .join("basic.result")));
    assert!(contents.starts_with("fail (0)\n"), "{contents}");
}

/// Lost writes are caught by every scenario that crashes
#[test]
fn lost_writes_all_scenarios() {
    let rig = RigBuilder::new()
        .config(SimConfig {
            lose_acked_writes: true,
            ..Default::default()
        }).build();
    for (scenario, verdict) in t!(rig.harness.run_all(&Scenario::ALL)) {
        assert_eq!(verdict, Verdict::Fail, "{scenario}");
    }
}

/// A failed reattach is a harness failure, not a verification failure
#[test]
fn reattach_failure() {
    let rig = RigBuilder::new()
        .build_with_gateway(|sim| Arc::new(Flaky {
            inner: sim,
            label: "volume mount",
            // Only the mount during setup succeeds
            allowed: AtomicUsize::new(1),
        }) as Arc<dyn Gateway>);
    assert_eq!(t!(rig.harness.run(Scenario::Basic)), Verdict::Fail);
    let report = t!(rig.harness.recorder().read("basic"));
    assert!(report.outcomes.is_empty());
    let aborted = report.diagnostics.aborted.as_ref().unwrap();
    assert_eq!(aborted.class, "reattach");
    assert!(aborted.message.contains("volume mount"), "{}", aborted.message);
    assert_eq!(report.diagnostics.last_code(), 2040);
    let contents = t!(fs::read_to_string(rig.harness.recorder().path("basic")));
    assert!(contents.starts_with("fail (2040)\n"), "{contents}");
}

/// If the array never starts rebuilding, the wait times out and the scenario
/// fails without ever crashing the service.
#[test]
fn rebuild_timeout() {
    let rig = RigBuilder::new()
        .spares(0)
        .build();
    assert_eq!(t!(rig.harness.run(Scenario::Rebuild)), Verdict::Fail);
    let report = t!(rig.harness.recorder().read("rebuild"));
    let aborted = report.diagnostics.aborted.unwrap();
    assert_eq!(aborted.class, "timeout");
    assert!(aborted.message.contains("REBUILDING"), "{}", aborted.message);
    assert!(report.outcomes.is_empty());
    assert_eq!(rig.clock.elapsed(), Duration::from_secs(30));
}

/// Transient status failures during the rebuild wait are absorbed
#[test]
fn rebuild_failing_polls() {
    let rig = RigBuilder::new()
        .config(SimConfig {
            failing_polls: 5,
            rebuild_after_polls: 3,
            ..Default::default()
        }).build();
    assert_eq!(t!(rig.harness.run(Scenario::Rebuild)), Verdict::Pass);
    let report = t!(rig.harness.recorder().read("rebuild"));
    assert_eq!(report.outcomes.len(), 1);
}

/// A write error aborts the scenario
#[test]
fn write_failure() {
    let rig = RigBuilder::new()
        .settings(Settings {
            quick: true,
            // Beyond the end of the volume
            offsets: vec![1 << 30],
            ..Default::default()
        }).build();
    assert_eq!(t!(rig.harness.run(Scenario::Basic)), Verdict::Fail);
    let report = t!(rig.harness.recorder().read("basic"));
    assert_eq!(report.diagnostics.aborted.unwrap().class, "write");
    // Nothing was acknowledged, so there is nothing to verify
    assert!(report.outcomes.is_empty());
    assert!(rig.harness.registry().records(1).is_empty());
}

/// The service is left stopped even after an aborted scenario, so the next
/// scenario can start cleanly.
#[test]
fn abort_then_pass() {
    let rig = RigBuilder::new()
        .spares(0)
        .build();
    assert_eq!(t!(rig.harness.run(Scenario::Rebuild)), Verdict::Fail);
    assert!(!rig.sim.is_running());
    assert_eq!(t!(rig.harness.run(Scenario::Basic)), Verdict::Pass);
}
