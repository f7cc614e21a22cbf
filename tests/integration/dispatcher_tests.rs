//! Dispatcher against the virtual pump: retries, bolus readback and the
//! delta plan.

use std::sync::Arc;
use std::time::Duration;

use aidloop::adapters::delay::SkipDelay;
use aidloop::adapters::time::ManualClock;
use aidloop::app::dispatcher::{DispatchOutcome, DispatchSettings, Dispatcher, PumpCommand, plan};
use aidloop::app::ports::TimePort;
use aidloop::config::LoopConfig;
use aidloop::constraints::Span;
use aidloop::dosing::{BasalDirective, DosingDecision};
use aidloop::error::DriverError;
use aidloop::pump::{ConfirmedCommand, FaultKind, PumpDriver, PumpOp, VirtualPump};

use crate::mock_pump::t0;

fn connected_pump() -> (VirtualPump, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let mut pump = VirtualPump::new(clock.clone());
    pump.connect(Duration::from_secs(1)).unwrap();
    (pump, clock)
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(DispatchSettings::from_config(&LoopConfig::default()))
}

#[test]
fn lost_bolus_confirmation_is_found_on_readback() {
    let (mut pump, clock) = connected_pump();
    pump.inject(PumpOp::Bolus, FaultKind::LostConfirmation);
    let mut delay = SkipDelay::new();

    let outcome = dispatcher().dispatch(&[PumpCommand::Bolus { amount: 1.0 }], &mut pump, &mut delay, clock.now());

    let DispatchOutcome::Committed { commands } = outcome else {
        panic!("expected commit, got {outcome:?}");
    };
    assert!(matches!(commands.as_slice(), [ConfirmedCommand::Bolus { amount, .. }] if (amount - 1.0).abs() < 1e-9));
    assert!((pump.delivered_units() - 1.0).abs() < 1e-9, "bolus must be delivered exactly once");
    // connect, bolus, readback
    assert_eq!(pump.call_count(), 3);
}

#[test]
fn bolus_not_delivered_is_resent_after_readback() {
    let (mut pump, clock) = connected_pump();
    pump.inject(PumpOp::Bolus, FaultKind::Fail(DriverError::Busy));
    let mut delay = SkipDelay::new();

    let outcome = dispatcher().dispatch(&[PumpCommand::Bolus { amount: 0.5 }], &mut pump, &mut delay, clock.now());

    assert!(matches!(outcome, DispatchOutcome::Committed { .. }));
    assert!((pump.delivered_units() - 0.5).abs() < 1e-9);
    // connect, bolus (busy), readback, bolus
    assert_eq!(pump.call_count(), 4);
    assert_eq!(delay.total(), std::time::Duration::from_millis(500));
}

#[test]
fn bolus_is_not_resent_when_readback_fails() {
    let (mut pump, clock) = connected_pump();
    pump.inject(PumpOp::Bolus, FaultKind::LostConfirmation);
    pump.inject(PumpOp::GetStatus, FaultKind::Fail(DriverError::Timeout));
    let mut delay = SkipDelay::new();

    let outcome = dispatcher().dispatch(&[PumpCommand::Bolus { amount: 1.0 }], &mut pump, &mut delay, clock.now());

    let DispatchOutcome::Failed { commands, attempts, readback, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(attempts, 1);
    assert!((pump.delivered_units() - 1.0).abs() < 1e-9, "bolus delivered twice: {}", pump.delivered_units());
    // The final readback shows the bolus went in, so it is reported.
    assert!(readback.is_some());
    assert!(matches!(commands.as_slice(), [ConfirmedCommand::Bolus { amount, .. }] if (amount - 1.0).abs() < 1e-9));
    // connect, bolus, failed readback, final readback
    assert_eq!(pump.call_count(), 4);
}

#[test]
fn undelivered_bolus_with_failed_readback_reports_nothing_delivered() {
    let (mut pump, clock) = connected_pump();
    pump.inject(PumpOp::Bolus, FaultKind::Fail(DriverError::Timeout));
    pump.inject(PumpOp::GetStatus, FaultKind::Fail(DriverError::Timeout));
    let mut delay = SkipDelay::new();

    let outcome = dispatcher().dispatch(&[PumpCommand::Bolus { amount: 1.0 }], &mut pump, &mut delay, clock.now());

    let DispatchOutcome::Failed { commands, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(commands.is_empty());
    assert!(pump.delivered_units().abs() < 1e-9);
}

#[test]
fn stale_bolus_confirmation_does_not_count() {
    let (mut pump, clock) = connected_pump();
    let mut delay = SkipDelay::new();
    // An earlier, identical bolus from a previous cycle.
    dispatcher().dispatch(&[PumpCommand::Bolus { amount: 1.0 }], &mut pump, &mut delay, clock.now());

    clock.advance(chrono::Duration::minutes(5));
    pump.inject(PumpOp::Bolus, FaultKind::Fail(DriverError::Communication));
    let outcome = dispatcher().dispatch(&[PumpCommand::Bolus { amount: 1.0 }], &mut pump, &mut delay, clock.now());

    assert!(matches!(outcome, DispatchOutcome::Committed { .. }));
    assert!((pump.delivered_units() - 2.0).abs() < 1e-9, "second bolus must still be delivered");
}

#[test]
fn rejection_is_not_retried() {
    let (mut pump, clock) = connected_pump();
    let mut delay = SkipDelay::new();

    let outcome = dispatcher().dispatch(
        &[PumpCommand::SetTempBasal { rate: 0.033, duration_min: 30 }],
        &mut pump,
        &mut delay,
        clock.now(),
    );

    let DispatchOutcome::Failed { error, attempts, readback, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(matches!(error, DriverError::Rejected(_)));
    assert_eq!(attempts, 1);
    assert!(readback.is_some_and(|s| s.temp_basal.is_none()));
    assert_eq!(delay.total(), std::time::Duration::ZERO);
}

#[test]
fn failure_keeps_commands_already_confirmed() {
    let (mut pump, clock) = connected_pump();
    let mut delay = SkipDelay::new();

    let outcome = dispatcher().dispatch(
        &[PumpCommand::SetTempBasal { rate: 2.0, duration_min: 30 }, PumpCommand::Bolus { amount: 25.0 }],
        &mut pump,
        &mut delay,
        clock.now(),
    );

    let DispatchOutcome::Failed { commands, command, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(command, PumpCommand::Bolus { amount: 25.0 });
    assert!(matches!(commands.as_slice(), [ConfirmedCommand::TempBasal { .. }]));
    assert_eq!(pump.status().temp_basal.map(|t| t.rate), Some(2.0));
}

#[test]
fn disconnected_pump_fails_after_full_retry_budget() {
    let (mut pump, clock) = connected_pump();
    pump.drop_link();
    let mut delay = SkipDelay::new();

    let outcome = dispatcher().dispatch(&[PumpCommand::CancelTempBasal], &mut pump, &mut delay, clock.now());

    let DispatchOutcome::Failed { error, attempts, readback, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error, DriverError::NotConnected);
    assert_eq!(attempts, 4);
    assert!(readback.is_none());
    assert_eq!(delay.total(), std::time::Duration::from_millis(500 + 1000 + 2000));
}

#[test]
fn replanning_against_confirmed_state_is_empty() {
    let (mut pump, clock) = connected_pump();
    let mut delay = SkipDelay::new();
    let decision = DosingDecision {
        basal: BasalDirective::Temp { rate: 1.65, duration_min: 30 },
        bolus: 0.0,
        scheduled_basal: 1.0,
        requested: None,
        basal_bound: Span { min: 0.0, max: 4.0 },
        bolus_bound: Span { min: 0.0, max: 0.0 },
        rationale: vec![],
    };
    let settings = DispatchSettings::from_config(&LoopConfig::default());

    let first = plan(&decision, &pump.status(), clock.now(), settings.renew_min);
    assert_eq!(first.len(), 1);
    assert!(matches!(dispatcher().dispatch(&first, &mut pump, &mut delay, clock.now()), DispatchOutcome::Committed { .. }));

    clock.advance(chrono::Duration::minutes(5));
    assert!(plan(&decision, &pump.status(), clock.now(), settings.renew_min).is_empty());
}
