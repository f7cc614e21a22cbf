//! Integration tests for the LoopService cycle: preconditions, skip
//! reasons, failure handling, commands and the audit trail.

use aidloop::app::commands::LoopCommand;
use aidloop::app::events::{CycleOutcome, LoopEvent, SkipReason};
use aidloop::app::ports::TimePort;
use aidloop::app::runner::CancelToken;
use aidloop::config::LoopConfig;
use aidloop::constraints::ConstraintRegistry;
use aidloop::constraints::providers::PumpCapabilityLimits;
use aidloop::dosing::{Applied, BasalDirective};
use aidloop::error::DriverError;
use aidloop::fsm::LoopState;
use aidloop::history::{GlucoseReading, HistoryStore, Treatment, TrendDirection};
use aidloop::profile::{ProfileSlice, ProfileSpec};
use aidloop::pump::{ActiveTempBasal, ConfirmedCommand, ConnectionState, FaultKind, PumpOp};
use chrono::Duration;

use crate::mock_pump::{Harness, PumpCall, t0};

// ── Skips ─────────────────────────────────────────────────────

#[test]
fn disabled_loop_skips_without_pump_calls() {
    let mut h = Harness::new(LoopConfig::default());
    h.flat_glucose(250.0);
    h.service.handle_command(LoopCommand::SetLoopEnabled(false), &mut h.sink);
    assert!(!h.service.is_enabled());

    let result = h.cycle();
    assert_eq!(result.outcome, CycleOutcome::Skipped { reason: SkipReason::LoopDisabled });
    assert!(h.pump.calls().is_empty());
    assert!(h.sink.events.contains(&LoopEvent::EnabledChanged { enabled: false }));

    h.service.handle_command(LoopCommand::SetLoopEnabled(true), &mut h.sink);
    assert!(!h.cycle().outcome.is_failed());
}

#[test]
fn no_glucose_skips() {
    let mut h = Harness::new(LoopConfig::default());
    let result = h.cycle();
    assert_eq!(result.outcome, CycleOutcome::Skipped { reason: SkipReason::NoGlucose });
    assert_eq!(h.service.state(), LoopState::Idle);
}

#[test]
fn missing_profile_skips() {
    let mut h = Harness::new(LoopConfig::default());
    h.flat_glucose(120.0);
    h.profiles.clear();
    assert_eq!(h.cycle().outcome, CycleOutcome::Skipped { reason: SkipReason::NoProfile });
}

#[test]
fn missing_required_constraint_skips_every_cycle() {
    let mut registry = ConstraintRegistry::new();
    registry.register(PumpCapabilityLimits);
    let mut h = Harness::with_registry(LoopConfig::default(), registry);
    h.flat_glucose(250.0);

    for _ in 0..2 {
        let result = h.cycle();
        assert!(
            matches!(result.outcome, CycleOutcome::Skipped { reason: SkipReason::Configuration { .. } }),
            "got {:?}",
            result.outcome
        );
    }
    assert!(h.pump.calls().is_empty());
    assert_eq!(h.service.next_sequence(), 2);
}

// ── Pump link ─────────────────────────────────────────────────

#[test]
fn disconnected_pump_is_reconnected_once() {
    let mut h = Harness::new(LoopConfig::default());
    h.flat_glucose(250.0);
    h.pump.set_connection(ConnectionState::Disconnected);

    let result = h.cycle();
    let calls = h.pump.calls();
    assert_eq!(calls.first(), Some(&PumpCall::Connect));
    assert!(matches!(result.outcome, CycleOutcome::Committed { .. }));
}

#[test]
fn failed_reconnect_skips_cycle() {
    let mut h = Harness::new(LoopConfig::default());
    h.flat_glucose(250.0);
    h.pump.set_connection(ConnectionState::Disconnected);
    h.pump.inject(PumpOp::Connect, FaultKind::Fail(DriverError::Communication));

    let result = h.cycle();
    assert!(matches!(result.outcome, CycleOutcome::Skipped { reason: SkipReason::PumpDisconnected { .. } }));
    assert_eq!(h.pump.calls(), vec![PumpCall::Connect], "exactly one reconnection attempt");
}

// ── Dispatch outcomes ─────────────────────────────────────────

#[test]
fn exhausted_retries_fail_and_read_back() {
    let mut h = Harness::new(LoopConfig::default());
    h.flat_glucose(250.0);
    for _ in 0..4 {
        h.pump.inject(PumpOp::SetTempBasal, FaultKind::Fail(DriverError::Timeout));
    }

    let result = h.cycle();
    assert!(result.outcome.is_failed(), "got {:?}", result.outcome);

    let calls = h.pump.calls();
    let sends = calls.iter().filter(|c| matches!(c, PumpCall::SetTempBasal { .. })).count();
    assert_eq!(sends, 4, "first attempt plus three retries");
    assert_eq!(calls.last(), Some(&PumpCall::GetStatus));
    assert!(h.history.read_since(t0() - Duration::hours(1)).treatments.is_empty());
    assert_eq!(h.service.state(), LoopState::Idle);
}

#[test]
fn temp_applied_without_confirmation_is_recorded() {
    let mut h = Harness::new(LoopConfig::default());
    h.flat_glucose(250.0);
    for _ in 0..4 {
        h.pump.inject(PumpOp::SetTempBasal, FaultKind::LostConfirmation);
    }

    let result = h.cycle();
    let CycleOutcome::Failed { commands, .. } = &result.outcome else {
        panic!("expected failure, got {:?}", result.outcome);
    };
    assert!(matches!(commands.as_slice(), [ConfirmedCommand::TempBasal { duration_min: 30, .. }]));

    let treatments = h.history.read_since(t0() - Duration::hours(1)).treatments;
    assert_eq!(treatments.len(), 1, "delivered temp missing from history: {treatments:?}");
    assert!(matches!(treatments[0], Treatment::TempBasalStart { duration_min: 30, .. }));
    assert!(h.pump.status().temp_basal.is_some());
}

#[test]
fn confirmed_commands_become_treatments() {
    let mut h = Harness::new(LoopConfig::default());
    h.flat_glucose(250.0);
    let result = h.cycle();

    let CycleOutcome::Committed { commands } = &result.outcome else {
        panic!("expected commit, got {:?}", result.outcome);
    };
    let treatments = h.history.read_since(t0() - Duration::hours(1)).treatments;
    assert_eq!(treatments.len(), commands.len());
    assert!(matches!(treatments[0], Treatment::TempBasalStart { duration_min: 30, .. }));
}

#[test]
fn active_temp_is_cancelled_when_back_in_range() {
    let mut h = Harness::new(LoopConfig::default());
    h.flat_glucose(120.0);
    h.pump.set_temp(Some(ActiveTempBasal {
        rate: 2.5,
        duration_min: 30,
        started_at: t0() - Duration::minutes(10),
    }));

    let result = h.cycle();
    assert_eq!(h.pump.command_calls(), vec![PumpCall::CancelTempBasal]);
    assert!(matches!(result.outcome, CycleOutcome::Committed { .. }));
}

#[test]
fn same_temp_still_running_is_left_alone() {
    let mut h = Harness::new(LoopConfig::default());
    h.flat_glucose(250.0);
    h.cycle();
    // 250 flat with no IOB wants more than the 4 U/h cap.
    match h.pump.command_calls().as_slice() {
        [PumpCall::SetTempBasal { rate, duration_min: 30 }] => assert!((rate - 4.0).abs() < 1e-9),
        other => panic!("expected one temp basal, got {other:?}"),
    }

    h.pump.clear_calls();
    h.clock.advance(Duration::minutes(5));
    h.history
        .append_glucose(GlucoseReading::new(h.clock.now(), 250.0, TrendDirection::Flat, "test"))
        .unwrap();
    let second = h.cycle();

    assert!((second.decision.unwrap().effective_rate() - 4.0).abs() < 1e-9);
    assert!(h.pump.calls().is_empty(), "unchanged temp re-sent: {:?}", h.pump.calls());
    assert_eq!(second.outcome, CycleOutcome::Committed { commands: vec![] });
}

#[test]
fn reservoir_veto_falls_back_to_baseline() {
    let mut config = LoopConfig::default();
    config.micro_bolus_enabled = true;
    let mut h = Harness::new(config);
    h.flat_glucose(250.0);
    h.pump.set_reservoir(0.2);

    let result = h.cycle();
    let decision = result.decision.unwrap();
    assert_eq!(decision.basal, BasalDirective::Baseline);
    assert_eq!(decision.bolus, 0.0);
    assert!(decision.is_fallback());
    assert!(decision.rationale.iter().any(|r| r.source.as_str() == "reservoir" && matches!(r.applied, Applied::Veto { .. })));
    assert!(h.pump.command_calls().is_empty());
}

// ── Cancellation ──────────────────────────────────────────────

#[test]
fn cancelled_cycle_does_no_pump_io() {
    let mut h = Harness::new(LoopConfig::default());
    h.flat_glucose(250.0);
    h.pump.set_connection(ConnectionState::Disconnected);
    let token = CancelToken::new();
    token.cancel();

    let result = h.service.run_cycle(&token, &mut h.sink);
    assert_eq!(result.outcome, CycleOutcome::Skipped { reason: SkipReason::Cancelled });
    assert!(result.decision.is_none());
    assert!(h.pump.calls().is_empty(), "cancelled cycle reconnected: {:?}", h.pump.calls());
    assert!(!token.is_cancelled(), "token is re-armed after use");

    let next = h.service.run_cycle(&token, &mut h.sink);
    assert_eq!(h.pump.calls().first(), Some(&PumpCall::Connect));
    assert!(matches!(next.outcome, CycleOutcome::Committed { .. }));
}

// ── Commands ──────────────────────────────────────────────────

#[test]
fn invalid_config_is_rejected_and_old_one_kept() {
    let mut h = Harness::new(LoopConfig::default());
    let mut bad = LoopConfig::default();
    bad.max_bolus = -1.0;
    h.service.handle_command(LoopCommand::UpdateConfig(Box::new(bad)), &mut h.sink);

    assert!(matches!(h.sink.events.last(), Some(LoopEvent::CommandRejected { .. })));
    assert_eq!(h.service.config().snapshot().max_bolus, LoopConfig::default().max_bolus);
}

#[test]
fn valid_config_is_swapped_in() {
    let mut h = Harness::new(LoopConfig::default());
    let mut next = LoopConfig::default();
    next.max_basal_rate = 3.0;
    h.service.handle_command(LoopCommand::UpdateConfig(Box::new(next)), &mut h.sink);

    assert_eq!(h.sink.events.last(), Some(&LoopEvent::ConfigUpdated));
    assert_eq!(h.service.config().snapshot().max_basal_rate, 3.0);

    h.flat_glucose(300.0);
    let decision = h.cycle().decision.unwrap();
    assert!(decision.effective_rate() <= 3.0 + 1e-9);
}

fn spec(name: &str, basal_rate: f64) -> ProfileSpec {
    ProfileSpec {
        name: name.to_string(),
        utc_offset_min: 0,
        insulin_action_min: 300,
        insulin_peak_min: 75,
        slices: vec![ProfileSlice {
            start_min: 0,
            end_min: 1440,
            basal_rate,
            isf: 40.0,
            carb_ratio: 12.0,
            target_low: 100.0,
            target_high: 120.0,
        }],
    }
}

#[test]
fn set_profile_validates_before_activating() {
    let mut h = Harness::new(LoopConfig::default());

    h.service.handle_command(LoopCommand::SetProfile(Box::new(spec("broken", -1.0))), &mut h.sink);
    assert!(matches!(h.sink.events.last(), Some(LoopEvent::CommandRejected { .. })));

    h.service.handle_command(LoopCommand::SetProfile(Box::new(spec("night", 0.6))), &mut h.sink);
    assert!(matches!(h.sink.events.last(), Some(LoopEvent::ProfileUpdated { name }) if name.as_str() == "night"));

    h.flat_glucose(110.0);
    let decision = h.cycle().decision.unwrap();
    assert!((decision.scheduled_basal - 0.6).abs() < 1e-9);
}

// ── Audit trail ───────────────────────────────────────────────

#[test]
fn every_cycle_is_audited_and_chained() {
    let mut h = Harness::new(LoopConfig::default());
    h.flat_glucose(250.0);

    let mut results = Vec::new();
    for i in 0..4 {
        results.push(h.cycle());
        h.clock.advance(Duration::minutes(5));
        if i == 1 {
            h.service.handle_command(LoopCommand::SetLoopEnabled(false), &mut h.sink);
        }
    }

    let sequences: Vec<u64> = results.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    assert_eq!(h.service.audit().verify_chain(), Ok(4));
    assert_eq!(h.sink.completed(), 4);

    let stored = h.service.audit().get(results[0].timestamp).unwrap();
    assert_eq!(stored, vec![results[0].clone()]);
    assert_eq!(stored[0].decision, results[0].decision);
}
