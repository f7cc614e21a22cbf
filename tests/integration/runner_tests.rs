//! Runner: scheduling, trigger coalescing, expedited retry and the
//! command channel.

use aidloop::app::events::{CycleOutcome, SkipReason};
use aidloop::app::runner::LoopRunner;
use aidloop::app::service::LoopService;
use aidloop::config::LoopConfig;
use aidloop::error::DriverError;
use aidloop::pump::{FaultKind, PumpOp};
use chrono::Duration;

use crate::mock_pump::{Harness, PumpProbe, RecordingSink};

fn runner(h: Harness) -> (LoopRunner<RecordingSink>, aidloop::app::runner::LoopHandle, PumpProbe, std::sync::Arc<aidloop::adapters::time::ManualClock>) {
    let Harness { service, clock, pump, .. } = h;
    let (runner, handle) = LoopRunner::new(service, RecordingSink::new());
    (runner, handle, pump, clock)
}

#[test]
fn first_step_runs_then_waits_for_period() {
    let h = Harness::new(LoopConfig::default());
    h.flat_glucose(120.0);
    let (mut runner, _handle, _pump, clock) = runner(h);

    assert!(runner.step().is_some(), "first cycle is immediate");
    assert!(runner.step().is_none());

    clock.advance(Duration::seconds(299));
    assert!(runner.step().is_none());
    clock.advance(Duration::seconds(1));
    assert_eq!(runner.step().map(|r| r.sequence), Some(1));
}

#[test]
fn triggers_coalesce_into_one_cycle() {
    let h = Harness::new(LoopConfig::default());
    h.flat_glucose(120.0);
    let (mut runner, handle, _pump, clock) = runner(h);
    runner.step();

    clock.advance(Duration::seconds(30));
    for _ in 0..5 {
        assert!(handle.trigger());
    }
    assert!(runner.step().is_some());
    assert!(runner.step().is_none(), "queued triggers must collapse into one cycle");
    assert_eq!(runner.service().next_sequence(), 2);
}

#[test]
fn failed_cycle_is_retried_early() {
    let h = Harness::new(LoopConfig::default());
    h.flat_glucose(250.0);
    for _ in 0..4 {
        h.pump.inject(PumpOp::SetTempBasal, FaultKind::Fail(DriverError::Timeout));
    }
    let (mut runner, _handle, pump, clock) = runner(h);

    let first = runner.step().unwrap();
    assert!(first.outcome.is_failed());
    pump.clear_calls();

    clock.advance(Duration::seconds(59));
    assert!(runner.step().is_none());
    clock.advance(Duration::seconds(1));
    let retry = runner.step().expect("expedited cycle");
    assert!(matches!(retry.outcome, CycleOutcome::Committed { .. }));

    // Back on the normal period after a success.
    clock.advance(Duration::seconds(60));
    assert!(runner.step().is_none());
}

#[test]
fn commands_are_applied_between_cycles() {
    let h = Harness::new(LoopConfig::default());
    h.flat_glucose(120.0);
    let (mut runner, handle, _pump, clock) = runner(h);

    assert!(handle.set_enabled(false));
    let result = runner.step().unwrap();
    assert_eq!(result.outcome, CycleOutcome::Skipped { reason: SkipReason::LoopDisabled });

    let mut faster = LoopConfig::default();
    faster.loop_interval_secs = 120;
    assert!(handle.update_config(faster));
    assert!(handle.set_enabled(true));
    clock.advance(Duration::seconds(300));
    assert!(runner.step().is_some());

    clock.advance(Duration::seconds(120));
    assert!(runner.step().is_some(), "new period applies from the next schedule");
    assert!(runner.service().is_enabled());
}

#[test]
fn cancel_skips_pending_cycle() {
    let h = Harness::new(LoopConfig::default());
    h.flat_glucose(250.0);
    let (mut runner, handle, pump, _clock) = runner(h);

    handle.cancel_cycle();
    let result = runner.step().unwrap();
    assert_eq!(result.outcome, CycleOutcome::Skipped { reason: SkipReason::Cancelled });
    assert!(pump.command_calls().is_empty());
}

#[test]
fn spawned_runner_stops_on_shutdown() {
    let h = Harness::new(LoopConfig::default());
    h.flat_glucose(120.0);
    let (runner, handle, _pump, _clock) = runner(h);

    assert!(handle.shutdown());
    let join = runner.spawn().unwrap();
    let service: LoopService = join.join().unwrap();

    assert_eq!(service.next_sequence(), 1, "one immediate cycle before the shutdown was seen");
    assert_eq!(service.audit().verify_chain(), Ok(1));
    assert!(!handle.trigger(), "handle reports the stopped runner");
}
