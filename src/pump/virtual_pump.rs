//! Simulated pump.
//!
//! Tracks reservoir and battery, delivers scheduled or temp basal between
//! calls, and enforces its own capability limits like a real pump would.
//! Faults can be queued per operation to exercise the dispatcher:
//!
//! - [`FaultKind::Fail`] returns the error without touching pump state.
//! - [`FaultKind::LostConfirmation`] applies the command and then reports
//!   a timeout, the case that makes boluses dangerous to retry blindly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use super::connection::{ConnectionFsm, ConnectionState};
use super::{ActiveTempBasal, ConfirmedCommand, PumpCapabilities, PumpDriver, PumpStatus};
use crate::app::ports::TimePort;
use crate::error::DriverError;

pub const VIRTUAL_CAPABILITIES: PumpCapabilities = PumpCapabilities {
    family: "virtual",
    max_basal_rate: 15.0,
    basal_step: 0.05,
    max_bolus: 10.0,
    bolus_step: 0.05,
    max_temp_duration_min: 720,
};

/// Battery drained per exchange (percent).
const BATTERY_PER_COMMAND: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOp {
    Connect,
    GetStatus,
    SetTempBasal,
    CancelTempBasal,
    Bolus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Fail(DriverError),
    LostConfirmation,
}

pub struct VirtualPump {
    caps: PumpCapabilities,
    link: ConnectionFsm,
    clock: Arc<dyn TimePort>,
    reservoir: f64,
    battery: f64,
    scheduled_basal: f64,
    temp: Option<ActiveTempBasal>,
    last_confirmed: Option<ConfirmedCommand>,
    settled_at: DateTime<Utc>,
    faults: VecDeque<(PumpOp, FaultKind)>,
    delivered: f64,
    calls: u64,
}

impl VirtualPump {
    pub fn new(clock: Arc<dyn TimePort>) -> Self {
        let settled_at = clock.now();
        Self {
            caps: VIRTUAL_CAPABILITIES,
            link: ConnectionFsm::new(),
            clock,
            reservoir: 200.0,
            battery: 100.0,
            scheduled_basal: 0.0,
            temp: None,
            last_confirmed: None,
            settled_at,
            faults: VecDeque::new(),
            delivered: 0.0,
            calls: 0,
        }
    }

    pub fn with_reservoir(mut self, units: f64) -> Self {
        self.reservoir = units;
        self
    }

    /// Rate the pump falls back to when no temp basal runs.
    pub fn set_scheduled_basal(&mut self, rate: f64) {
        self.settle();
        self.scheduled_basal = rate;
    }

    /// Queue a fault for the next call of `op`.
    pub fn inject(&mut self, op: PumpOp, kind: FaultKind) {
        self.faults.push_back((op, kind));
    }

    /// Simulate losing the radio link.
    pub fn drop_link(&mut self) {
        warn!("virtual pump: link dropped");
        self.link.drop_link();
    }

    /// Insulin delivered since construction (U).
    pub fn delivered_units(&self) -> f64 {
        self.delivered
    }

    /// I/O calls made, including failed ones.
    pub fn call_count(&self) -> u64 {
        self.calls
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn take_fault(&mut self, op: PumpOp) -> Option<FaultKind> {
        let idx = self.faults.iter().position(|(o, _)| *o == op)?;
        self.faults.remove(idx).map(|(_, k)| k)
    }

    /// Account basal delivery between the last settle and now.
    fn settle(&mut self) {
        let now = self.clock.now();
        let mut cursor = self.settled_at;
        if now <= cursor {
            return;
        }
        if let Some(temp) = self.temp {
            let temp_end = temp.ends_at().min(now);
            if temp_end > cursor {
                self.deliver(temp.rate, cursor, temp_end);
                cursor = temp_end;
            }
            if temp.ends_at() <= now {
                debug!("virtual pump: temp basal {:.2} U/h expired", temp.rate);
                self.temp = None;
            }
        }
        if now > cursor {
            self.deliver(self.scheduled_basal, cursor, now);
        }
        self.settled_at = now;
    }

    fn deliver(&mut self, rate: f64, from: DateTime<Utc>, to: DateTime<Utc>) {
        let hours = (to - from).num_milliseconds() as f64 / 3_600_000.0;
        let units = (rate * hours).min(self.reservoir).max(0.0);
        self.reservoir -= units;
        self.delivered += units;
    }

    fn snapshot(&self) -> PumpStatus {
        PumpStatus {
            reservoir_units: self.reservoir,
            battery_percent: self.battery.clamp(0.0, 100.0).round() as u8,
            connection: self.link.state(),
            temp_basal: self.temp,
            last_confirmed: self.last_confirmed,
            timestamp: self.settled_at,
        }
    }

    /// Run one command exchange: link checks, fault injection, then `apply`.
    fn exchange(
        &mut self,
        op: PumpOp,
        apply: impl FnOnce(&mut Self, DateTime<Utc>) -> Result<Option<ConfirmedCommand>, DriverError>,
    ) -> Result<PumpStatus, DriverError> {
        self.calls += 1;
        self.link.begin_command()?;
        self.settle();
        self.battery -= BATTERY_PER_COMMAND;

        let fault = self.take_fault(op);
        if let Some(FaultKind::Fail(err)) = fault {
            warn!("virtual pump: injected {err} on {op:?}");
            self.link.end_command()?;
            return Err(err);
        }

        let now = self.settled_at;
        let result = apply(self, now);
        self.link.end_command()?;
        let confirmed = result?;
        if let Some(cmd) = confirmed {
            self.last_confirmed = Some(cmd);
        }
        if fault == Some(FaultKind::LostConfirmation) {
            warn!("virtual pump: {op:?} applied but confirmation lost");
            return Err(DriverError::Timeout);
        }
        Ok(self.snapshot())
    }

    fn on_step(value: f64, step: f64) -> bool {
        let steps = value / step;
        (steps - steps.round()).abs() < 1e-6
    }
}

impl PumpDriver for VirtualPump {
    fn capabilities(&self) -> PumpCapabilities {
        self.caps
    }

    fn status(&self) -> PumpStatus {
        self.snapshot()
    }

    fn connect(&mut self, _timeout: Duration) -> Result<PumpStatus, DriverError> {
        self.calls += 1;
        if self.link.state() != ConnectionState::Disconnected {
            return Ok(self.snapshot());
        }
        self.link.go(ConnectionState::Connecting)?;
        if let Some(kind) = self.take_fault(PumpOp::Connect) {
            self.link.go(ConnectionState::Disconnected)?;
            let err = match kind {
                FaultKind::Fail(e) => e,
                FaultKind::LostConfirmation => DriverError::Timeout,
            };
            warn!("virtual pump: connect failed: {err}");
            return Err(err);
        }
        self.link.go(ConnectionState::Connected)?;
        self.settle();
        info!("virtual pump: connected, reservoir {:.1} U", self.reservoir);
        Ok(self.snapshot())
    }

    fn get_status(&mut self, _timeout: Duration) -> Result<PumpStatus, DriverError> {
        self.exchange(PumpOp::GetStatus, |_, _| Ok(None))
    }

    fn set_temp_basal(&mut self, rate: f64, duration_min: u32, _timeout: Duration) -> Result<PumpStatus, DriverError> {
        self.exchange(PumpOp::SetTempBasal, |pump, now| {
            if !rate.is_finite() || rate < 0.0 || rate > pump.caps.max_basal_rate {
                return Err(DriverError::Rejected("rate outside pump limits"));
            }
            if !Self::on_step(rate, pump.caps.basal_step) {
                return Err(DriverError::Rejected("rate not on basal step"));
            }
            if duration_min == 0 || duration_min > pump.caps.max_temp_duration_min {
                return Err(DriverError::Rejected("duration outside pump limits"));
            }
            pump.temp = Some(ActiveTempBasal { rate, duration_min, started_at: now });
            debug!("virtual pump: temp basal {rate:.2} U/h for {duration_min} min");
            Ok(Some(ConfirmedCommand::TempBasal { rate, duration_min, at: now }))
        })
    }

    fn cancel_temp_basal(&mut self, _timeout: Duration) -> Result<PumpStatus, DriverError> {
        self.exchange(PumpOp::CancelTempBasal, |pump, now| {
            pump.temp = None;
            debug!("virtual pump: temp basal cancelled");
            Ok(Some(ConfirmedCommand::CancelTempBasal { at: now }))
        })
    }

    fn bolus(&mut self, amount: f64, _timeout: Duration) -> Result<PumpStatus, DriverError> {
        self.exchange(PumpOp::Bolus, |pump, now| {
            if !amount.is_finite() || amount <= 0.0 || amount > pump.caps.max_bolus {
                return Err(DriverError::Rejected("bolus outside pump limits"));
            }
            if !Self::on_step(amount, pump.caps.bolus_step) {
                return Err(DriverError::Rejected("bolus not on step"));
            }
            if amount > pump.reservoir {
                return Err(DriverError::Rejected("insufficient reservoir"));
            }
            pump.reservoir -= amount;
            pump.delivered += amount;
            debug!("virtual pump: bolus {amount:.2} U");
            Ok(Some(ConfirmedCommand::Bolus { amount, at: now }))
        })
    }
}
