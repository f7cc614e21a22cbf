//! Property tests for the pure-logic core: prediction curves, the
//! constraint chain and the dispatcher's delta plan.

use aidloop::app::dispatcher::plan;
use aidloop::config::LoopConfig;
use aidloop::constraints::providers::{
    LowGlucoseBolusBlock, MaxIob, PredictedLow, PumpCapabilityLimits, ReservoirLevel, UserMaxBasal, UserMaxBolus,
};
use aidloop::constraints::{ConstraintContext, ConstraintProvider, ConstraintRegistry};
use aidloop::dosing::{BasalDirective, RawRecommendation};
use aidloop::history::{HistoryWindow, Treatment};
use aidloop::prediction::{PredictionSettings, predict};
use aidloop::profile::Profile;
use aidloop::pump::virtual_pump::VIRTUAL_CAPABILITIES;
use aidloop::pump::{ActiveTempBasal, ConnectionState, PumpStatus};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn profile() -> Profile {
    Profile::flat("prop", 0.8, 45.0, 10.0, (90.0, 140.0), 240, 75).unwrap()
}

fn arb_treatment() -> impl Strategy<Value = Treatment> {
    let at = |mins: i64| now() - Duration::minutes(mins);
    prop_oneof![
        (0.05f64..10.0, 0i64..600).prop_map(move |(amount, m)| Treatment::Bolus { amount, timestamp: at(m) }),
        (1.0f64..120.0, 0i64..600).prop_map(move |(grams, m)| Treatment::CarbEntry { grams, timestamp: at(m) }),
        (0.0f64..6.0, 5u32..120, 0i64..600).prop_map(move |(rate, duration_min, m)| Treatment::TempBasalStart {
            rate,
            duration_min,
            timestamp: at(m),
        }),
        (0i64..600).prop_map(move |m| Treatment::TempBasalCancel { timestamp: at(m) }),
    ]
}

fn status(connection: ConnectionState, reservoir_units: f64, temp_basal: Option<ActiveTempBasal>) -> PumpStatus {
    PumpStatus {
        reservoir_units,
        battery_percent: 80,
        connection,
        temp_basal,
        last_confirmed: None,
        timestamp: now(),
    }
}

// ── Prediction curves ─────────────────────────────────────────

proptest! {
    /// IOB and COB never go negative and, with nothing scheduled in the
    /// future, only ever decay.
    #[test]
    fn iob_and_cob_are_non_negative_and_decay(
        mut treatments in proptest::collection::vec(arb_treatment(), 0..=12),
    ) {
        treatments.sort_by_key(Treatment::timestamp);
        let history = HistoryWindow { glucose: vec![], treatments };
        let settings = PredictionSettings::from_config(&LoopConfig::default());
        let p = predict(&history, &profile(), now(), &settings).unwrap();

        for curve in [&p.iob, &p.cob] {
            let values: Vec<f64> = curve.values().collect();
            prop_assert!(values.iter().all(|v| *v >= 0.0 && v.is_finite()));
            for pair in values.windows(2) {
                prop_assert!(pair[1] <= pair[0] + 1e-9, "curve rose: {} -> {}", pair[0], pair[1]);
            }
        }
        prop_assert_eq!(p.iob.last(), 0.0, "all insulin absorbed by the end of the horizon");
    }
}

// ── Constraint chain ──────────────────────────────────────────

fn providers() -> Vec<Box<dyn ConstraintProvider>> {
    vec![
        Box::new(PumpCapabilityLimits),
        Box::new(ReservoirLevel),
        Box::new(UserMaxBasal),
        Box::new(UserMaxBolus),
        Box::new(MaxIob),
        Box::new(PredictedLow),
        Box::new(LowGlucoseBolusBlock),
    ]
}

#[derive(Debug, Clone)]
struct CtxInput {
    glucose: f64,
    iob: f64,
    predicted_min: f64,
    reservoir: f64,
    micro_bolus: bool,
}

fn arb_ctx() -> impl Strategy<Value = CtxInput> {
    (40.0f64..400.0, 0.0f64..10.0, 40.0f64..400.0, 0.0f64..200.0, any::<bool>()).prop_map(
        |(glucose, iob, predicted_min, reservoir, micro_bolus)| CtxInput {
            glucose,
            iob,
            predicted_min,
            reservoir,
            micro_bolus,
        },
    )
}

fn with_ctx<R>(input: &CtxInput, f: impl FnOnce(&ConstraintContext<'_>) -> R) -> R {
    let config = LoopConfig { micro_bolus_enabled: input.micro_bolus, ..LoopConfig::default() };
    let pump = status(ConnectionState::Connected, input.reservoir, None);
    let ctx = ConstraintContext {
        now: now(),
        scheduled_basal: 1.0,
        glucose_mgdl: input.glucose,
        iob: input.iob,
        predicted_min: input.predicted_min,
        target_low: 90.0,
        pump: &pump,
        capabilities: &VIRTUAL_CAPABILITIES,
        config: &config,
    };
    f(&ctx)
}

proptest! {
    /// Registration order must not change the numeric bound.
    #[test]
    fn bound_is_invariant_under_registration_order(
        input in arb_ctx(),
        order in Just((0..7usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let reference = ConstraintRegistry::standard().build().unwrap();
        let mut shuffled = ConstraintRegistry::new();
        let mut pool: Vec<Option<Box<dyn ConstraintProvider>>> = providers().into_iter().map(Some).collect();
        for i in order {
            if let Some(p) = pool[i].take() {
                shuffled.register_boxed(p);
            }
        }
        let shuffled = shuffled.build().unwrap();

        with_ctx(&input, |ctx| {
            let a = reference.evaluate(ctx);
            let b = shuffled.evaluate(ctx);
            prop_assert_eq!(a.basal.span(), b.basal.span());
            prop_assert_eq!(a.bolus.span(), b.bolus.span());
            prop_assert_eq!(a.veto.is_some(), b.veto.is_some());
            Ok(())
        })?;
    }

    /// Whatever the strategy asks for, a temp basal never leaves the final
    /// bound and a bolus never exceeds its ceiling.
    #[test]
    fn decided_rate_stays_within_bound(
        input in arb_ctx(),
        rate in -5.0f64..40.0,
        bolus in 0.0f64..20.0,
    ) {
        let chain = ConstraintRegistry::standard().build().unwrap();
        let raw = Ok(RawRecommendation { temp_basal_rate: rate, bolus, reason: "prop" });
        let decision = with_ctx(&input, |ctx| chain.decide("prop", raw, ctx));

        if let BasalDirective::Temp { rate, .. } = decision.basal {
            prop_assert!(decision.basal_bound.contains(rate), "{rate} outside {:?}", decision.basal_bound);
        }
        prop_assert!(decision.bolus >= 0.0);
        prop_assert!(decision.bolus <= decision.bolus_bound.max.max(0.0) + 1e-9);
    }
}

// ── Dispatch plan ─────────────────────────────────────────────

proptest! {
    /// Once the decided temp basal is running, planning the same decision
    /// again sends nothing.
    #[test]
    fn plan_is_idempotent_once_applied(
        steps in 0u32..200,
        elapsed in 0i64..20,
    ) {
        let rate = f64::from(steps) * 0.05;
        let chain = ConstraintRegistry::standard().build().unwrap();
        let input = CtxInput { glucose: 150.0, iob: 0.0, predicted_min: 150.0, reservoir: 100.0, micro_bolus: false };
        let raw = Ok(RawRecommendation { temp_basal_rate: rate, bolus: 0.0, reason: "prop" });
        let decision = with_ctx(&input, |ctx| chain.decide("prop", raw, ctx));

        let BasalDirective::Temp { rate, duration_min } = decision.basal else {
            return Err(TestCaseError::fail("expected a temp basal"));
        };
        let running = ActiveTempBasal { rate, duration_min, started_at: now() - Duration::minutes(elapsed) };
        let commands = plan(&decision, &status(ConnectionState::Connected, 100.0, Some(running)), now(), 5);
        prop_assert!(commands.is_empty(), "re-sent {:?}", commands);
    }
}
