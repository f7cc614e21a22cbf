//! Command dispatcher: turns a [`DosingDecision`] into pump calls.
//!
//! ```text
//!  DosingDecision ──plan()──▶ [PumpCommand…] ──send/confirm/retry──▶ PumpDriver
//!                    ▲                                    │
//!                    └────── cached PumpStatus ◀──────────┘
//! ```
//!
//! Only the delta against the pump's last confirmed state is sent.  Each
//! command is retried on transient errors with exponential backoff; a
//! bolus is never re-sent before the pump has been read back, since the
//! previous attempt may have been delivered with its confirmation lost.
//! A bolus whose readback fails is given up on, not re-sent.
//! After giving up the pump is read back once more; if that shows the
//! failed command applied in this cycle it is reported with the confirmed
//! commands, but the dispatch still reports `Failed`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::LoopConfig;
use crate::dosing::{BasalDirective, DosingDecision};
use crate::error::DriverError;
use crate::pump::{ConfirmedCommand, PumpDriver, PumpStatus};

/// Rates and amounts closer than this are the same command.
const SAME_VALUE_EPSILON: f64 = 1e-6;

fn same(a: f64, b: f64) -> bool {
    (a - b).abs() < SAME_VALUE_EPSILON
}

/// A pump command the dispatcher may send.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpCommand {
    SetTempBasal { rate: f64, duration_min: u32 },
    CancelTempBasal,
    Bolus { amount: f64 },
}

impl PumpCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetTempBasal { .. } => "set_temp_basal",
            Self::CancelTempBasal => "cancel_temp_basal",
            Self::Bolus { .. } => "bolus",
        }
    }

    /// Whether `confirmed` is the pump's acknowledgement of this command.
    pub fn matches(&self, confirmed: &ConfirmedCommand) -> bool {
        match (*self, *confirmed) {
            (Self::SetTempBasal { rate, duration_min }, ConfirmedCommand::TempBasal { rate: r, duration_min: d, .. }) => {
                same(rate, r) && duration_min == d
            }
            (Self::CancelTempBasal, ConfirmedCommand::CancelTempBasal { .. }) => true,
            (Self::Bolus { amount }, ConfirmedCommand::Bolus { amount: a, .. }) => same(amount, a),
            _ => false,
        }
    }

    fn confirmed_at(&self, at: DateTime<Utc>) -> ConfirmedCommand {
        match *self {
            Self::SetTempBasal { rate, duration_min } => ConfirmedCommand::TempBasal { rate, duration_min, at },
            Self::CancelTempBasal => ConfirmedCommand::CancelTempBasal { at },
            Self::Bolus { amount } => ConfirmedCommand::Bolus { amount, at },
        }
    }

    fn send(&self, pump: &mut dyn PumpDriver, timeout: Duration) -> Result<PumpStatus, DriverError> {
        match *self {
            Self::SetTempBasal { rate, duration_min } => pump.set_temp_basal(rate, duration_min, timeout),
            Self::CancelTempBasal => pump.cancel_temp_basal(timeout),
            Self::Bolus { amount } => pump.bolus(amount, timeout),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Planning
// ───────────────────────────────────────────────────────────────

/// Commands needed to move the pump from `status` to `decision`.
///
/// - An active temp basal at the same rate with at least `renew_min`
///   minutes left is left alone.
/// - A rate equal to scheduled basal needs no temp basal: nothing when
///   none runs, a cancel when a different one does.
/// - `Baseline` cancels a running temp basal and is otherwise a no-op.
pub fn plan(decision: &DosingDecision, status: &PumpStatus, now: DateTime<Utc>, renew_min: u32) -> Vec<PumpCommand> {
    let mut commands = Vec::with_capacity(2);
    let active = status.active_temp_at(now);

    match decision.basal {
        BasalDirective::Temp { rate, duration_min } => match active {
            Some(t) if same(t.rate, rate) && t.remaining_min(now) >= f64::from(renew_min) => {
                debug!("dispatch: temp basal {rate:.2} U/h already active");
            }
            None if same(rate, decision.scheduled_basal) => {
                debug!("dispatch: scheduled basal already running");
            }
            Some(_) if same(rate, decision.scheduled_basal) => commands.push(PumpCommand::CancelTempBasal),
            _ => commands.push(PumpCommand::SetTempBasal { rate, duration_min }),
        },
        BasalDirective::Baseline => {
            if active.is_some() {
                commands.push(PumpCommand::CancelTempBasal);
            }
        }
    }

    if decision.bolus > 0.0 {
        commands.push(PumpCommand::Bolus { amount: decision.bolus });
    }
    commands
}

// ───────────────────────────────────────────────────────────────
// Dispatch
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u8,
    pub backoff_ms: u32,
    pub backoff_max_ms: u32,
    pub renew_min: u32,
}

impl DispatchSettings {
    pub fn from_config(config: &LoopConfig) -> Self {
        Self {
            timeout: Duration::from_millis(u64::from(config.command_timeout_ms)),
            max_retries: config.command_max_retries,
            backoff_ms: config.retry_backoff_ms,
            backoff_max_ms: config.retry_backoff_max_ms,
            renew_min: config.temp_basal_renew_min,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> u32 {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_ms.saturating_mul(factor).min(self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Committed {
        commands: Vec<ConfirmedCommand>,
    },
    Failed {
        /// Commands known delivered: those confirmed before the failure,
        /// plus the failed command when the readback shows it applied.
        commands: Vec<ConfirmedCommand>,
        command: PumpCommand,
        error: DriverError,
        attempts: u32,
        /// Pump state read back after giving up, if the read succeeded.
        readback: Option<PumpStatus>,
    },
}

pub struct Dispatcher {
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(settings: DispatchSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Send `commands` in order, stopping at the first one that fails.
    /// `since` is the cycle start; a bolus confirmed at or after it counts
    /// as this cycle's bolus during readback.
    pub fn dispatch(
        &self,
        commands: &[PumpCommand],
        pump: &mut dyn PumpDriver,
        delay: &mut dyn DelayNs,
        since: DateTime<Utc>,
    ) -> DispatchOutcome {
        let mut confirmed = Vec::with_capacity(commands.len());
        for command in commands {
            match self.send_confirmed(command, pump, delay, since) {
                Ok(c) => {
                    info!("dispatch: {} confirmed", command.name());
                    confirmed.push(c);
                }
                Err((error, attempts)) => {
                    error!("dispatch: {} failed after {attempts} attempt(s): {error}", command.name());
                    let readback = match pump.get_status(self.settings.timeout) {
                        Ok(status) => Some(status),
                        Err(e) => {
                            warn!("dispatch: status readback failed: {e}");
                            None
                        }
                    };
                    if let Some(applied) = readback.and_then(|s| delivered_since(command, &s, since)) {
                        warn!("dispatch: {} applied without confirmation", command.name());
                        confirmed.push(applied);
                    }
                    return DispatchOutcome::Failed { commands: confirmed, command: *command, error, attempts, readback };
                }
            }
        }
        DispatchOutcome::Committed { commands: confirmed }
    }

    fn send_confirmed(
        &self,
        command: &PumpCommand,
        pump: &mut dyn PumpDriver,
        delay: &mut dyn DelayNs,
        since: DateTime<Utc>,
    ) -> Result<ConfirmedCommand, (DriverError, u32)> {
        let s = &self.settings;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let error = match command.send(pump, s.timeout) {
                Ok(status) => return Ok(confirmation(command, &status)),
                Err(e) => e,
            };
            if !error.is_transient() || attempt > u32::from(s.max_retries) {
                return Err((error, attempt));
            }

            let wait = s.backoff(attempt);
            warn!("dispatch: {} attempt {attempt} failed ({error}), retrying in {wait} ms", command.name());
            delay.delay_ms(wait);

            if let PumpCommand::Bolus { .. } = command {
                // Never re-send a bolus the pump may already have delivered.
                match pump.get_status(s.timeout) {
                    Ok(status) => {
                        if let Some(last) = delivered_since(command, &status, since) {
                            warn!("dispatch: bolus found delivered on readback");
                            return Ok(last);
                        }
                    }
                    Err(e) => {
                        warn!("dispatch: bolus readback failed ({e}), not re-sending");
                        return Err((error, attempt));
                    }
                }
            }
        }
    }
}

/// `command` as the pump last confirmed it, if that happened at or after
/// `since`.
fn delivered_since(command: &PumpCommand, status: &PumpStatus, since: DateTime<Utc>) -> Option<ConfirmedCommand> {
    status.last_confirmed.filter(|c| command.matches(c) && c.at() >= since)
}

fn confirmation(command: &PumpCommand, status: &PumpStatus) -> ConfirmedCommand {
    status
        .last_confirmed
        .filter(|c| command.matches(c))
        .unwrap_or_else(|| command.confirmed_at(status.timestamp))
}
