//! Append-only history of glucose readings and treatments.
//!
//! ```text
//!  CGM source ──append_glucose──▶ ┌──────────────────┐ ◀──read_since── Prediction
//!  Dispatcher ─append_treatment─▶ │  InMemoryHistory │ ◀──read_since── Autosens
//!                                 └──────────────────┘ ◀──latest───── Orchestrator
//! ```
//!
//! Each data kind is a vector published through an [`ArcSwap`]: readers
//! grab the current pointer without locking and keep a consistent view for
//! as long as they hold it.  Writers of one kind serialise on a per-kind
//! mutex, copy, append, and publish.  Nothing in the loop ever deletes or
//! rewrites a record; [`InMemoryHistory::prune_before`] is an
//! administrative path for bounding memory in long-running hosts.

pub mod glucose;

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::HistoryError;

pub use glucose::{GlucoseStatus, TrendDirection};

/// Free-form device label, e.g. "dexcom-g7".
pub type SourceDevice = heapless::String<32>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One CGM / fingerstick sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseReading {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// mg/dL
    pub value: f64,
    pub trend: TrendDirection,
    pub source: SourceDevice,
}

impl GlucoseReading {
    pub fn new(timestamp: DateTime<Utc>, value: f64, trend: TrendDirection, source: &str) -> Self {
        Self {
            timestamp,
            value,
            trend,
            source: crate::truncated(source),
        }
    }
}

/// A therapy event.  Rates are U/h, amounts U, durations minutes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Treatment {
    Bolus {
        amount: f64,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    TempBasalStart {
        rate: f64,
        duration_min: u32,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    TempBasalCancel {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    CarbEntry {
        grams: f64,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
}

impl Treatment {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match *self {
            Self::Bolus { timestamp, .. }
            | Self::TempBasalStart { timestamp, .. }
            | Self::TempBasalCancel { timestamp }
            | Self::CarbEntry { timestamp, .. } => timestamp,
        }
    }

    fn is_valid(&self) -> bool {
        match *self {
            Self::Bolus { amount, .. } => amount.is_finite() && amount > 0.0,
            Self::TempBasalStart { rate, duration_min, .. } => {
                rate.is_finite() && rate >= 0.0 && duration_min > 0
            }
            Self::TempBasalCancel { .. } => true,
            Self::CarbEntry { grams, .. } => grams.is_finite() && grams > 0.0,
        }
    }
}

/// Ordered slice of history returned by [`HistoryStore::read_since`].
#[derive(Debug, Clone, Default)]
pub struct HistoryWindow {
    /// Oldest first.
    pub glucose: Vec<GlucoseReading>,
    /// Oldest first.
    pub treatments: Vec<Treatment>,
}

impl HistoryWindow {
    pub fn latest_glucose(&self) -> Option<&GlucoseReading> {
        self.glucose.last()
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Consumed history interface.  The core only ever appends and reads.
pub trait HistoryStore: Send + Sync {
    fn append_glucose(&self, reading: GlucoseReading) -> Result<(), HistoryError>;

    fn append_treatment(&self, treatment: Treatment) -> Result<(), HistoryError>;

    /// All records with `timestamp >= since`, oldest first.
    fn read_since(&self, since: DateTime<Utc>) -> HistoryWindow;

    fn latest_glucose(&self) -> Option<GlucoseReading>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryHistory {
    glucose: ArcSwap<Vec<GlucoseReading>>,
    treatments: ArcSwap<Vec<Treatment>>,
    glucose_writer: Mutex<()>,
    treatment_writer: Mutex<()>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn glucose_count(&self) -> usize {
        self.glucose.load().len()
    }

    pub fn treatment_count(&self) -> usize {
        self.treatments.load().len()
    }

    /// Administrative trim of records older than `cutoff`.  Never called
    /// from the control loop.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) {
        {
            let _guard = self.glucose_writer.lock().unwrap_or_else(PoisonError::into_inner);
            let current = self.glucose.load_full();
            let start = current.partition_point(|g| g.timestamp < cutoff);
            if start > 0 {
                self.glucose.store(Arc::new(current[start..].to_vec()));
            }
        }
        let _guard = self.treatment_writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.treatments.load_full();
        let start = current.partition_point(|t| t.timestamp() < cutoff);
        if start > 0 {
            self.treatments.store(Arc::new(current[start..].to_vec()));
        }
    }
}

impl HistoryStore for InMemoryHistory {
    fn append_glucose(&self, reading: GlucoseReading) -> Result<(), HistoryError> {
        if !reading.value.is_finite() || reading.value <= 0.0 {
            return Err(HistoryError::InvalidValue);
        }
        let _guard = self.glucose_writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.glucose.load_full();
        if let Some(last) = current.last() {
            if reading.timestamp == last.timestamp {
                return Err(HistoryError::DuplicateTimestamp);
            }
            if reading.timestamp < last.timestamp {
                return Err(HistoryError::OutOfOrder);
            }
        }
        debug!("history: glucose {:.0} mg/dL at {}", reading.value, reading.timestamp);
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend_from_slice(&current);
        next.push(reading);
        self.glucose.store(Arc::new(next));
        Ok(())
    }

    fn append_treatment(&self, treatment: Treatment) -> Result<(), HistoryError> {
        if !treatment.is_valid() {
            return Err(HistoryError::InvalidValue);
        }
        let _guard = self.treatment_writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.treatments.load_full();
        if current.last().is_some_and(|last| treatment.timestamp() < last.timestamp()) {
            return Err(HistoryError::OutOfOrder);
        }
        debug!("history: treatment {:?}", treatment);
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend_from_slice(&current);
        next.push(treatment);
        self.treatments.store(Arc::new(next));
        Ok(())
    }

    fn read_since(&self, since: DateTime<Utc>) -> HistoryWindow {
        let glucose = self.glucose.load();
        let treatments = self.treatments.load();
        let g_start = glucose.partition_point(|g| g.timestamp < since);
        let t_start = treatments.partition_point(|t| t.timestamp() < since);
        HistoryWindow {
            glucose: glucose[g_start..].to_vec(),
            treatments: treatments[t_start..].to_vec(),
        }
    }

    fn latest_glucose(&self) -> Option<GlucoseReading> {
        self.glucose.load().last().cloned()
    }
}
