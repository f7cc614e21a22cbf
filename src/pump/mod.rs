//! Pump driver abstraction.
//!
//! ```text
//!  Dispatcher ──PumpDriver──▶ ┌───────────────┐
//!                             │ VirtualPump   │  (simulation, tests)
//!                             │ <family X>    │  (real radio drivers)
//!                             └───────────────┘
//! ```
//!
//! The core never branches on pump identity: every family implements
//! [`PumpDriver`] and describes its limits through [`PumpCapabilities`].
//! Each command call blocks until the pump confirms or `timeout` elapses,
//! and on success returns the refreshed [`PumpStatus`].  Drivers are
//! selected by name through the static [`registry`].

pub mod connection;
pub mod registry;
pub mod virtual_pump;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::history::Treatment;

pub use connection::ConnectionState;
pub use registry::{PumpFamily, build_driver};
pub use virtual_pump::{FaultKind, PumpOp, VirtualPump};

// ---------------------------------------------------------------------------
// Status types
// ---------------------------------------------------------------------------

/// Static limits of a pump family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpCapabilities {
    pub family: &'static str,
    /// U/h
    pub max_basal_rate: f64,
    /// Smallest programmable basal increment (U/h)
    pub basal_step: f64,
    /// U
    pub max_bolus: f64,
    /// Smallest programmable bolus increment (U)
    pub bolus_step: f64,
    /// Longest temp basal the pump accepts (minutes)
    pub max_temp_duration_min: u32,
}

/// Temp basal running on the pump.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActiveTempBasal {
    pub rate: f64,
    pub duration_min: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
}

impl ActiveTempBasal {
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::minutes(i64::from(self.duration_min))
    }

    pub fn is_running_at(&self, now: DateTime<Utc>) -> bool {
        self.started_at <= now && now < self.ends_at()
    }

    /// Minutes left at `now` (0 when expired).
    pub fn remaining_min(&self, now: DateTime<Utc>) -> f64 {
        ((self.ends_at() - now).num_milliseconds() as f64 / 60_000.0).max(0.0)
    }
}

/// A command the pump has acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmedCommand {
    TempBasal {
        rate: f64,
        duration_min: u32,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        at: DateTime<Utc>,
    },
    CancelTempBasal {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        at: DateTime<Utc>,
    },
    Bolus {
        amount: f64,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        at: DateTime<Utc>,
    },
}

impl ConfirmedCommand {
    pub fn at(&self) -> DateTime<Utc> {
        match *self {
            Self::TempBasal { at, .. } | Self::CancelTempBasal { at } | Self::Bolus { at, .. } => at,
        }
    }

    /// History record for this command.
    pub fn to_treatment(&self) -> Treatment {
        match *self {
            Self::TempBasal { rate, duration_min, at } => Treatment::TempBasalStart { rate, duration_min, timestamp: at },
            Self::CancelTempBasal { at } => Treatment::TempBasalCancel { timestamp: at },
            Self::Bolus { amount, at } => Treatment::Bolus { amount, timestamp: at },
        }
    }
}

/// Last state confirmed by the pump.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PumpStatus {
    /// U
    pub reservoir_units: f64,
    pub battery_percent: u8,
    pub connection: ConnectionState,
    pub temp_basal: Option<ActiveTempBasal>,
    pub last_confirmed: Option<ConfirmedCommand>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl PumpStatus {
    /// The temp basal still running at `now`, if any.
    pub fn active_temp_at(&self, now: DateTime<Utc>) -> Option<ActiveTempBasal> {
        self.temp_basal.filter(|t| t.is_running_at(now))
    }
}

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

/// Uniform interface implemented once per pump family.
///
/// Every I/O method takes the confirmation timeout.  On `Ok` the returned
/// status reflects the pump after the command; on `Err` the caller must
/// not assume anything about pump state and should read it back.
pub trait PumpDriver: Send {
    fn capabilities(&self) -> PumpCapabilities;

    /// Last confirmed status.  No radio traffic.
    fn status(&self) -> PumpStatus;

    fn connect(&mut self, timeout: Duration) -> Result<PumpStatus, DriverError>;

    fn get_status(&mut self, timeout: Duration) -> Result<PumpStatus, DriverError>;

    fn set_temp_basal(&mut self, rate: f64, duration_min: u32, timeout: Duration) -> Result<PumpStatus, DriverError>;

    fn cancel_temp_basal(&mut self, timeout: Duration) -> Result<PumpStatus, DriverError>;

    fn bolus(&mut self, amount: f64, timeout: Duration) -> Result<PumpStatus, DriverError>;
}

impl<T: PumpDriver + ?Sized> PumpDriver for Box<T> {
    fn capabilities(&self) -> PumpCapabilities {
        (**self).capabilities()
    }

    fn status(&self) -> PumpStatus {
        (**self).status()
    }

    fn connect(&mut self, timeout: Duration) -> Result<PumpStatus, DriverError> {
        (**self).connect(timeout)
    }

    fn get_status(&mut self, timeout: Duration) -> Result<PumpStatus, DriverError> {
        (**self).get_status(timeout)
    }

    fn set_temp_basal(&mut self, rate: f64, duration_min: u32, timeout: Duration) -> Result<PumpStatus, DriverError> {
        (**self).set_temp_basal(rate, duration_min, timeout)
    }

    fn cancel_temp_basal(&mut self, timeout: Duration) -> Result<PumpStatus, DriverError> {
        (**self).cancel_temp_basal(timeout)
    }

    fn bolus(&mut self, amount: f64, timeout: Duration) -> Result<PumpStatus, DriverError> {
        (**self).bolus(amount, timeout)
    }
}
