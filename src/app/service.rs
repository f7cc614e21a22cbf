//! Loop service: the hexagonal core.
//!
//! [`LoopService`] owns the cycle state machine, the constraint chain, the
//! dispatcher and the audit log.  Everything else reaches it through
//! ports, so the whole loop runs against mocks in tests and against the
//! virtual pump in the simulator.
//!
//! ```text
//!  HistoryStore ─┐                                     ┌──▶ PumpDriver
//!  ProfileProv. ─┼──▶ ┌──────────────────────────┐ ────┤
//!  TimePort ─────┘    │       LoopService        │     └──▶ HistoryStore (treatments)
//!                     │ predict · dose · constrain│ ──▶ AuditLog
//!                     └──────────────────────────┘ ──▶ EventSink
//! ```
//!
//! One call to [`run_cycle`](LoopService::run_cycle) is one pass through
//! `Idle → Running → {Committed, Failed, Skipped} → Idle` and yields
//! exactly one [`LoopResult`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::config::{LoopConfig, SharedConfig};
use crate::constraints::{ConstraintChain, ConstraintContext, ConstraintRegistry};
use crate::dosing::{self, DosingDecision, DosingInput, DosingLimits, ReasonText};
use crate::error::{AuditError, ConfigError, ProfileError};
use crate::fsm::{Fsm, LoopState};
use crate::history::{GlucoseStatus, HistoryStore};
use crate::prediction::{self, PredictionSettings};
use crate::profile::{Profile, ProfileProvider};
use crate::pump::{ConnectionState, PumpDriver};
use crate::sensitivity::{self, AutosensSettings};

use super::commands::LoopCommand;
use super::dispatcher::{DispatchOutcome, DispatchSettings, Dispatcher, plan};
use super::events::{CycleInputs, CycleOutcome, LoopEvent, LoopResult, SkipReason};
use super::ports::{EventSink, StoragePort, TimePort};
use super::runner::CancelToken;

// ───────────────────────────────────────────────────────────────
// Ports bundle
// ───────────────────────────────────────────────────────────────

/// Everything the service talks to.
pub struct LoopPorts {
    pub history: Arc<dyn HistoryStore>,
    pub profiles: Arc<dyn ProfileProvider>,
    pub pump: Box<dyn PumpDriver>,
    /// Retry backoff.
    pub delay: Box<dyn DelayNs + Send>,
    /// Backing store of the audit log.
    pub storage: Box<dyn StoragePort + Send>,
    pub clock: Arc<dyn TimePort>,
}

/// What a cycle computed before any pump I/O.
struct Computed {
    decision: DosingDecision,
    inputs: CycleInputs,
}

/// Shorthand for a free-text reason.
fn reason(text: &str) -> ReasonText {
    crate::truncated(text)
}

// ───────────────────────────────────────────────────────────────
// LoopService
// ───────────────────────────────────────────────────────────────

pub struct LoopService {
    history: Arc<dyn HistoryStore>,
    profiles: Arc<dyn ProfileProvider>,
    pump: Box<dyn PumpDriver>,
    delay: Box<dyn DelayNs + Send>,
    clock: Arc<dyn TimePort>,
    config: SharedConfig,
    /// Built once at startup; a registry error skips every cycle.
    chain: Result<ConstraintChain, ConfigError>,
    fsm: Fsm<LoopState>,
    audit: AuditLog,
    sequence: u64,
    enabled: bool,
}

impl LoopService {
    /// Assemble the service.  Fails only when the audit log cannot be
    /// opened.
    pub fn new(ports: LoopPorts, config: SharedConfig, registry: ConstraintRegistry) -> Result<Self, AuditError> {
        let audit = AuditLog::open(ports.storage)?;
        let chain = registry.build();
        if let Err(e) = &chain {
            error!("LoopService: constraint chain unusable ({e}), every cycle will skip");
        }
        Ok(Self {
            history: ports.history,
            profiles: ports.profiles,
            pump: ports.pump,
            delay: ports.delay,
            clock: ports.clock,
            config,
            chain,
            fsm: Fsm::new("loop", LoopState::Idle),
            sequence: audit.next_sequence(),
            audit,
            enabled: true,
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────

    pub fn start(&mut self, sink: &mut dyn EventSink) {
        info!("LoopService started, next cycle {}", self.sequence);
        sink.emit(&LoopEvent::Started { next_sequence: self.sequence });
    }

    // ── Per-cycle orchestration ───────────────────────────────

    /// Run one cycle to completion and return its record.
    pub fn run_cycle(&mut self, cancel: &CancelToken, sink: &mut dyn EventSink) -> LoopResult {
        let now = self.clock.now();
        let config = self.config.snapshot();
        self.enter(LoopState::Running);

        let (outcome, decision, inputs) = match self.compute(now, &config, cancel) {
            Err(skip) => (CycleOutcome::Skipped { reason: skip }, None, None),
            Ok(Computed { decision, inputs }) => {
                let outcome = if self.take_cancel(cancel) {
                    CycleOutcome::Skipped { reason: SkipReason::Cancelled }
                } else {
                    self.dispatch(&decision, &config, now)
                };
                (outcome, Some(decision), Some(inputs))
            }
        };

        self.enter(match outcome {
            CycleOutcome::Committed { .. } => LoopState::Committed,
            CycleOutcome::Failed { .. } => LoopState::Failed,
            CycleOutcome::Skipped { .. } => LoopState::Skipped,
        });

        let result = LoopResult { sequence: self.sequence, timestamp: now, outcome, decision, inputs };
        if let Err(e) = self.audit.append(&result) {
            error!("LoopService: cycle {} not audited: {e}", result.sequence);
        }
        sink.emit(&LoopEvent::CycleCompleted(Box::new(result.clone())));

        self.sequence += 1;
        self.enter(LoopState::Idle);
        result
    }

    fn enter(&mut self, next: LoopState) {
        if let Err(e) = self.fsm.transition(next) {
            // The cycle drives the machine in table order; this is a bug.
            error!("LoopService: {e}");
        }
    }

    /// Consume a pending cancellation.  Checked before every step that may
    /// talk to the pump.
    fn take_cancel(&self, cancel: &CancelToken) -> bool {
        if !cancel.is_cancelled() {
            return false;
        }
        warn!("LoopService: cycle {} cancelled before pump I/O", self.sequence);
        cancel.reset();
        true
    }

    /// Preconditions, prediction, dosing and constraints.  Pure apart from
    /// the single reconnection attempt.
    fn compute(
        &mut self,
        now: DateTime<Utc>,
        config: &LoopConfig,
        cancel: &CancelToken,
    ) -> Result<Computed, SkipReason> {
        if !self.enabled {
            return Err(skip(SkipReason::LoopDisabled));
        }

        let profile = self.profiles.current_profile(now).map_err(|e| {
            skip(match e {
                ProfileError::Invalid(msg) => SkipReason::InvalidProfile { detail: reason(msg) },
                ProfileError::NotConfigured | ProfileError::ReadOnly => SkipReason::NoProfile,
            })
        })?;

        let chain = match &self.chain {
            Ok(chain) => chain,
            Err(e) => return Err(skip(SkipReason::Configuration { detail: reason(&e.to_string()) })),
        };

        let lookback = Duration::minutes(config.history_lookback_min(profile.insulin_action_min()));
        let window = self.history.read_since(now - lookback);
        let Some(latest) = window.latest_glucose().cloned().or_else(|| self.history.latest_glucose()) else {
            return Err(skip(SkipReason::NoGlucose));
        };
        let age = now - latest.timestamp;
        if age > Duration::seconds(i64::from(config.glucose_staleness_secs)) {
            return Err(skip(SkipReason::StaleGlucose { age_secs: age.num_seconds() }));
        }
        let Some(glucose) = GlucoseStatus::from_readings(&window.glucose, config.smoothing) else {
            return Err(skip(SkipReason::NoGlucose));
        };

        if self.take_cancel(cancel) {
            return Err(SkipReason::Cancelled);
        }
        let mut pump_status = self.pump.status();
        if pump_status.connection == ConnectionState::Disconnected {
            let timeout = DispatchSettings::from_config(config).timeout;
            info!("LoopService: pump disconnected, reconnecting");
            pump_status = self
                .pump
                .connect(timeout)
                .map_err(|e| skip(SkipReason::PumpDisconnected { detail: reason(&e.to_string()) }))?;
        }

        let predictions = prediction::predict(&window, &profile, now, &PredictionSettings::from_config(config))
            .map_err(|e| skip(SkipReason::InvalidProfile { detail: reason(&e.to_string()) }))?;
        let autosens = sensitivity::estimate(&window, &profile, now, &AutosensSettings::from_config(config));

        let slice = profile.slice_at(now);
        let isf = autosens.adjust_isf(slice.isf);
        let forecast = prediction::forecast_glucose(&glucose, &predictions, isf, slice.carb_ratio);

        let strategy = dosing::strategy_for(config.strategy);
        let input = DosingInput {
            glucose: &glucose,
            predictions: &predictions,
            forecast: &forecast,
            slice,
            isf,
            basal: autosens.adjust_basal(slice.basal_rate),
            limits: DosingLimits::from_config(config),
        };
        let raw = dosing::run_guarded(strategy.as_ref(), &input);

        let capabilities = self.pump.capabilities();
        let ctx = ConstraintContext {
            now,
            scheduled_basal: slice.basal_rate,
            glucose_mgdl: glucose.value,
            iob: predictions.iob.now(),
            predicted_min: input.predicted_min(),
            target_low: slice.target_low,
            pump: &pump_status,
            capabilities: &capabilities,
            config,
        };
        let decision = chain.decide(strategy.name(), raw, &ctx);

        let inputs = CycleInputs {
            glucose: glucose.value,
            delta: glucose.delta,
            iob: predictions.iob.now(),
            cob: predictions.cob.now(),
            eventual: forecast.eventual(),
            predicted_min: input.predicted_min(),
            autosens_ratio: autosens.ratio,
            isf,
        };
        debug!(
            "LoopService: bg {:.0} Δ{:+.1} iob {:.2} cob {:.0} eventual {:.0} ratio {:.2}",
            inputs.glucose, inputs.delta, inputs.iob, inputs.cob, inputs.eventual, inputs.autosens_ratio
        );
        Ok(Computed { decision, inputs })
    }

    fn dispatch(&mut self, decision: &DosingDecision, config: &LoopConfig, now: DateTime<Utc>) -> CycleOutcome {
        let settings = DispatchSettings::from_config(config);
        let commands = plan(decision, &self.pump.status(), now, settings.renew_min);
        let outcome = Dispatcher::new(settings).dispatch(&commands, self.pump.as_mut(), self.delay.as_mut(), now);

        let (outcome, confirmed) = match outcome {
            DispatchOutcome::Committed { commands } => {
                (CycleOutcome::Committed { commands: commands.clone() }, commands)
            }
            DispatchOutcome::Failed { commands, command, error, attempts, .. } => {
                let text = format!("{} failed after {attempts} attempt(s): {error}", command.name());
                (CycleOutcome::Failed { reason: reason(&text), commands: commands.clone() }, commands)
            }
        };

        for command in confirmed {
            if let Err(e) = self.history.append_treatment(command.to_treatment()) {
                error!("LoopService: confirmed {command:?} not recorded: {e}");
            }
        }
        outcome
    }

    // ── Command handling ──────────────────────────────────────

    /// Apply an external command.  `TriggerCycle` and `Shutdown` belong to
    /// the runner and are ignored here.
    pub fn handle_command(&mut self, cmd: LoopCommand, sink: &mut dyn EventSink) {
        match cmd {
            LoopCommand::UpdateConfig(config) => match self.config.replace(*config) {
                Ok(()) => {
                    info!("LoopService: configuration updated");
                    sink.emit(&LoopEvent::ConfigUpdated);
                }
                Err(e) => {
                    warn!("LoopService: configuration rejected: {e}");
                    sink.emit(&LoopEvent::CommandRejected { reason: reason(&e.to_string()) });
                }
            },
            LoopCommand::SetProfile(spec) => {
                match Profile::new(*spec).and_then(|p| {
                    let name = reason(p.name());
                    self.profiles.replace(p).map(|()| name)
                }) {
                    Ok(name) => sink.emit(&LoopEvent::ProfileUpdated { name }),
                    Err(e) => {
                        warn!("LoopService: profile rejected: {e}");
                        sink.emit(&LoopEvent::CommandRejected { reason: reason(&e.to_string()) });
                    }
                }
            }
            LoopCommand::SetLoopEnabled(enabled) => {
                if self.enabled != enabled {
                    info!("LoopService: loop {}", if enabled { "enabled" } else { "disabled" });
                }
                self.enabled = enabled;
                sink.emit(&LoopEvent::EnabledChanged { enabled });
            }
            LoopCommand::TriggerCycle | LoopCommand::Shutdown => {}
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn state(&self) -> LoopState {
        self.fsm.current()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Sequence number the next cycle will carry.
    pub fn next_sequence(&self) -> u64 {
        self.sequence
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn pump(&self) -> &dyn PumpDriver {
        self.pump.as_ref()
    }

    pub fn clock(&self) -> &Arc<dyn TimePort> {
        &self.clock
    }
}

fn skip(reason: SkipReason) -> SkipReason {
    warn!("LoopService: skipping cycle: {reason:?}");
    reason
}
