// vim: tw=80
//! The crash/recover/verify protocol, driven one component at a time
use pretty_assertions::assert_eq;
use rstest::rstest;
use spor_core::{
    pattern::{Pattern, PatternId},
    scenario::ScenarioContext,
    sim::SimConfig,
    verifier::VerificationOutcome,
    Region,
};

use super::*;

/// A single 128 KiB write at offset 0 survives a crash
#[test_log::test]
fn single_write() {
    let rig = RigBuilder::new().build();
    let ctx = ScenarioContext::new("single_write");
    rig.bringup(&ctx);
    let region = Region::new(1, 0, 128 << 10);
    let record = t!(rig.harness.writer().write(&ctx, region));
    rig.crash_and_recover(&ctx);
    // The write was acknowledged before the crash
    assert!(record.epoch < ctx.epoch());
    let latest = rig.harness.registry().latest(1);
    assert_eq!(latest, record.pattern);
    let outcome = rig.harness.verifier().verify(region, &latest);
    assert!(outcome.is_consistent(), "{outcome:?}");
}

/// After a rewrite, only the newer pattern is consistent
#[test]
fn rewrite() {
    let rig = RigBuilder::new().build();
    let ctx = ScenarioContext::new("rewrite");
    rig.bringup(&ctx);
    let region = Region::new(1, 0, 128 << 10);
    let verifier = rig.harness.verifier();

    let first = t!(rig.harness.writer().write(&ctx, region));
    rig.crash_and_recover(&ctx);
    assert!(verifier.verify(region, &rig.harness.registry().latest(1))
        .is_consistent());

    let second = t!(rig.harness.writer().write(&ctx, region));
    assert_eq!(second.epoch, 1);
    assert_eq!(rig.harness.registry().completed(region), Some(second.clone()));
    assert!(verifier.verify(region, &rig.harness.registry().latest(1))
        .is_consistent());
    match verifier.verify(region, &first.pattern) {
        VerificationOutcome::Mismatch { observed, expected, .. } => {
            assert_eq!(expected, first.pattern.id());
            assert_eq!(observed, Some(second.pattern.id()));
        }
        o => panic!("Unexpected outcome {o:?}")
    }
}

/// A write that partially overwrites an older one retires the older record
#[test]
fn partial_overwrite() {
    let rig = RigBuilder::new().build();
    let ctx = ScenarioContext::new("partial_overwrite");
    rig.bringup(&ctx);
    t!(rig.harness.writer().write(&ctx, Region::new(1, 0, 8192)));
    let newer = Region::new(1, 4096, 4096);
    let newer = t!(rig.harness.writer().write(&ctx, newer));
    rig.crash_and_recover(&ctx);

    let records = rig.harness.registry().records(1);
    assert_eq!(records, vec![newer]);
    let verifier = rig.harness.verifier();
    for r in records.iter() {
        let outcome = verifier.verify(r.region, &r.pattern);
        assert!(outcome.is_consistent(), "{outcome:?}");
    }
}

/// Each concurrent writer's region verifies against its own pattern, and
/// only its own.
#[rstest]
#[case(2)]
#[case(4)]
#[case(8)]
fn per_writer_isolation(#[case] nwriters: u64) {
    let rig = RigBuilder::new().build();
    let ctx = ScenarioContext::new("per_writer_isolation");
    rig.bringup(&ctx);
    let first = rig.harness.registry().issued(1);
    let requests = (0..nwriters)
        .map(|i| Region::new(1, i << 20, 1 << 20))
        .collect::<Vec<_>>();
    let records = t!(rig.harness.writer().write_concurrently(&ctx, &requests));
    assert!(records.iter().all(|r| r.epoch == 0));
    rig.crash_and_recover(&ctx);

    let registry = rig.harness.registry();
    let verifier = rig.harness.verifier();
    for (i, region) in requests.iter().enumerate() {
        for j in 0..requests.len() {
            let pattern = registry.pattern(1, first + j);
            let outcome = verifier.verify(*region, &pattern);
            assert_eq!(outcome.is_consistent(), i == j,
                       "region {i} pattern {j}: {outcome:?}");
        }
    }
}

/// Disturbing a single byte of the expected pattern's parameters is detected
#[rstest]
#[case(0, 1)]
#[case(3, 0)]
#[case(0x100, 0)]
#[case(0, 1 << 56)]
fn negative_control(#[case] volume_xor: u32, #[case] seq_xor: u64) {
    let rig = RigBuilder::new().build();
    let ctx = ScenarioContext::new("negative_control");
    rig.bringup(&ctx);
    let region = Region::new(1, 0, 128 << 10);
    let record = t!(rig.harness.writer().write(&ctx, region));
    rig.crash_and_recover(&ctx);
    let id = record.pattern.id();
    let wrong = Pattern::new(PatternId {
        volume: id.volume ^ volume_xor,
        seq:    id.seq ^ seq_xor,
    });
    let outcome = rig.harness.verifier().verify(region, &wrong);
    assert!(matches!(outcome, VerificationOutcome::Mismatch { .. }),
            "{outcome:?}");
    // The real pattern is still there
    assert!(rig.harness.verifier().verify_record(&record).is_consistent());
}

/// A single corrupted byte on the device is detected, and located
#[test]
fn corrupted_device() {
    let rig = RigBuilder::new().build();
    let ctx = ScenarioContext::new("corrupted_device");
    rig.bringup(&ctx);
    let region = Region::new(1, 4096, 256 << 10);
    let record = t!(rig.harness.writer().write(&ctx, region));
    rig.crash_and_recover(&ctx);
    t!(rig.sim.corrupt(1, 4096 + 77_777));
    match rig.harness.verifier().verify_record(&record) {
        VerificationOutcome::Mismatch {
            first_difference, differing_bytes, observed, ..
        } => {
            assert_eq!(first_difference, 4096 + 77_777);
            assert_eq!(differing_bytes, 1);
            // The stamp in the first sector is intact
            assert_eq!(observed, Some(record.pattern.id()));
        }
        o => panic!("Unexpected outcome {o:?}")
    }
}

/// A service that forgets acknowledged writes is caught
#[test]
fn lost_writes() {
    let rig = RigBuilder::new()
        .config(SimConfig {
            lose_acked_writes: true,
            ..Default::default()
        }).build();
    let ctx = ScenarioContext::new("lost_writes");
    rig.bringup(&ctx);
    let region = Region::new(1, 0, 128 << 10);
    let record = t!(rig.harness.writer().write(&ctx, region));
    rig.crash_and_recover(&ctx);
    match rig.harness.verifier().verify_record(&record) {
        VerificationOutcome::Mismatch { observed, first_difference, .. } => {
            assert_eq!(observed, None);
            assert_eq!(first_difference, 0);
        }
        o => panic!("Unexpected outcome {o:?}")
    }
}

/// Without a reattach, the volume can't even be read
#[test]
fn unreadable_before_reattach() {
    let rig = RigBuilder::new().build();
    let ctx = ScenarioContext::new("unreadable_before_reattach");
    rig.bringup(&ctx);
    let region = Region::new(1, 0, 4096);
    let record = t!(rig.harness.writer().write(&ctx, region));
    let injector = rig.harness.injector();
    t!(injector.inject_crash(&ctx));
    t!(injector.dirty_bringup(&ctx));
    let outcome = rig.harness.verifier().verify_record(&record);
    assert!(matches!(outcome, VerificationOutcome::Unreadable { .. }),
            "{outcome:?}");
    t!(injector.reattach(&ctx, 1));
    assert!(rig.harness.verifier().verify_record(&record).is_consistent());
}

/// Each volume keeps its own sequence of patterns
#[test]
fn multi_volume() {
    let rig = RigBuilder::new().volumes(3).build();
    let ctx = ScenarioContext::new("multi_volume");
    rig.bringup(&ctx);
    let requests = (1..=3)
        .map(|vol| Region::new(vol, 4096, 128 << 10))
        .collect::<Vec<_>>();
    t!(rig.harness.writer().write_concurrently(&ctx, &requests));
    rig.crash_and_recover(&ctx);
    let registry = rig.harness.registry();
    let verifier = rig.harness.verifier();
    for region in requests.iter() {
        let own = registry.latest(region.volume);
        assert!(verifier.verify(*region, &own).is_consistent());
        let other = registry.latest(region.volume % 3 + 1);
        assert!(!verifier.verify(*region, &other).is_consistent());
    }
}

/// Device removal is observed through the State Waiter before the crash
#[test]
fn crash_while_rebuilding() {
    let rig = RigBuilder::new().build();
    let ctx = ScenarioContext::new("crash_while_rebuilding");
    rig.bringup(&ctx);
    let region = Region::new(1, 0, 128 << 10);
    let record = t!(rig.harness.writer().write(&ctx, region));
    t!(rig.harness.injector().detach_device(&ctx, "unvme-ns-1"));
    let observed = rig.harness.waiter().wait_for_array(
        "POSArray", &spor_core::ArrayCondition::Rebuilding,
        Duration::from_secs(10));
    assert!(observed);
    rig.crash_and_recover(&ctx);
    assert!(rig.harness.verifier().verify_record(&record).is_consistent());
    // The manual clock only moved while polling
    assert!(rig.clock.elapsed() < Duration::from_secs(1));
}
