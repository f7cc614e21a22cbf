//! Cycle scheduler.
//!
//! Owns the one timer the loop runs on.  Two trigger sources feed it:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────┐  │
//! │  │ Periodic   │   │ Expedited  │   │ External     │  │
//! │  │ (normal)   │   │ (after     │   │ (fresh CGM,  │  │
//! │  │            │   │  Failed)   │   │  manual)     │  │
//! │  └─────┬──────┘   └─────┬──────┘   └──────┬───────┘  │
//! │        └────────────────┼─────────────────┘          │
//! │                         ▼                            │
//! │                  LoopScheduler::fire()               │
//! │                         │                            │
//! │                         ▼                            │
//! │                LoopService::run_cycle()              │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Any number of external requests made while a cycle runs collapse into a
//! single follow-up cycle.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use crate::config::LoopConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Periodic,
    /// Shortened period after a Failed cycle.
    Expedited,
    External,
}

#[derive(Debug, Clone)]
pub struct LoopScheduler {
    normal: Duration,
    expedited: Duration,
    /// `None` until the first cycle: the first fire is immediate.
    next_due: Option<DateTime<Utc>>,
    expedite_next: bool,
    pending: bool,
}

impl LoopScheduler {
    pub fn new(normal_secs: u32, expedited_secs: u32) -> Self {
        Self {
            normal: Duration::seconds(i64::from(normal_secs)),
            expedited: Duration::seconds(i64::from(expedited_secs)),
            next_due: None,
            expedite_next: false,
            pending: false,
        }
    }

    pub fn from_config(config: &LoopConfig) -> Self {
        Self::new(config.loop_interval_secs, config.expedited_retry_secs)
    }

    /// Pick up new periods; the currently scheduled fire time is kept.
    pub fn update_periods(&mut self, config: &LoopConfig) {
        self.normal = Duration::seconds(i64::from(config.loop_interval_secs));
        self.expedited = Duration::seconds(i64::from(config.expedited_retry_secs));
        info!(
            "Scheduler: period {}s, expedited {}s",
            config.loop_interval_secs, config.expedited_retry_secs
        );
    }

    /// External trigger.  Coalesces with any request not yet served.
    pub fn request(&mut self) {
        if self.pending {
            debug!("Scheduler: trigger coalesced");
        }
        self.pending = true;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// If a cycle should start at `now`, consume the trigger and say why.
    pub fn fire(&mut self, now: DateTime<Utc>) -> Option<TriggerKind> {
        if self.pending {
            self.pending = false;
            return Some(TriggerKind::External);
        }
        match self.next_due {
            Some(due) if due > now => None,
            _ if self.expedite_next => Some(TriggerKind::Expedited),
            _ => Some(TriggerKind::Periodic),
        }
    }

    /// Schedule the next periodic fire after a cycle finished at `now`.
    pub fn record(&mut self, now: DateTime<Utc>, failed: bool) {
        self.expedite_next = failed;
        let period = if failed { self.expedited } else { self.normal };
        self.next_due = Some(now + period);
        if failed {
            info!("Scheduler: expedited retry in {}s", period.num_seconds());
        }
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.next_due
    }

    /// Time to wait before the next fire.  Zero when one is due now.
    pub fn until_next(&self, now: DateTime<Utc>) -> std::time::Duration {
        if self.pending {
            return std::time::Duration::ZERO;
        }
        self.next_due
            .and_then(|due| (due - now).to_std().ok())
            .unwrap_or(std::time::Duration::ZERO)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
