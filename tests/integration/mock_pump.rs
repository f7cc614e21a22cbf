//! Mock adapters for integration tests.
//!
//! Records every pump call so tests can assert on the full command
//! history.  The service owns its boxed driver, so the recorder state sits
//! behind an `Arc<Mutex<_>>` and tests keep a [`PumpProbe`] onto it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use aidloop::adapters::delay::SkipDelay;
use aidloop::adapters::storage::MemoryStorage;
use aidloop::adapters::time::ManualClock;
use aidloop::app::events::LoopEvent;
use aidloop::app::ports::{EventSink, TimePort};
use aidloop::app::service::{LoopPorts, LoopService};
use aidloop::config::{LoopConfig, SharedConfig};
use aidloop::constraints::ConstraintRegistry;
use aidloop::error::DriverError;
use aidloop::history::{GlucoseReading, HistoryStore, InMemoryHistory, TrendDirection};
use aidloop::profile::{Profile, StaticProfileProvider};
use aidloop::pump::virtual_pump::VIRTUAL_CAPABILITIES;
use aidloop::pump::{
    ActiveTempBasal, ConfirmedCommand, ConnectionState, FaultKind, PumpCapabilities, PumpDriver, PumpOp, PumpStatus,
};

// ── Pump call record ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PumpCall {
    Connect,
    GetStatus,
    SetTempBasal { rate: f64, duration_min: u32 },
    CancelTempBasal,
    Bolus { amount: f64 },
}

impl PumpCall {
    /// Calls that change what the pump delivers.
    pub fn is_command(&self) -> bool {
        matches!(self, Self::SetTempBasal { .. } | Self::CancelTempBasal | Self::Bolus { .. })
    }
}

struct MockState {
    status: PumpStatus,
    calls: Vec<PumpCall>,
    script: VecDeque<(PumpOp, FaultKind)>,
}

// ── MockPump ──────────────────────────────────────────────────

pub struct MockPump {
    state: Arc<Mutex<MockState>>,
    clock: Arc<dyn TimePort>,
}

/// Test-side view of a [`MockPump`] the service owns.
#[derive(Clone)]
pub struct PumpProbe {
    state: Arc<Mutex<MockState>>,
}

impl MockPump {
    /// A connected pump with a full reservoir and no temp basal.
    pub fn new(clock: Arc<dyn TimePort>) -> (Self, PumpProbe) {
        let status = PumpStatus {
            reservoir_units: 150.0,
            battery_percent: 90,
            connection: ConnectionState::Connected,
            temp_basal: None,
            last_confirmed: None,
            timestamp: clock.now(),
        };
        let state = Arc::new(Mutex::new(MockState { status, calls: Vec::new(), script: VecDeque::new() }));
        (Self { state: state.clone(), clock }, PumpProbe { state })
    }

    fn exchange(
        &mut self,
        op: PumpOp,
        call: PumpCall,
        apply: impl FnOnce(&mut PumpStatus, DateTime<Utc>) -> Option<ConfirmedCommand>,
    ) -> Result<PumpStatus, DriverError> {
        let now = self.clock.now();
        let mut s = self.state.lock().unwrap();
        s.calls.push(call);
        if s.status.connection != ConnectionState::Connected {
            return Err(DriverError::NotConnected);
        }
        let fault = s.script.iter().position(|(o, _)| *o == op).and_then(|i| s.script.remove(i)).map(|(_, k)| k);
        if let Some(FaultKind::Fail(e)) = fault {
            return Err(e);
        }
        s.status.timestamp = now;
        if let Some(confirmed) = apply(&mut s.status, now) {
            s.status.last_confirmed = Some(confirmed);
        }
        if fault == Some(FaultKind::LostConfirmation) {
            return Err(DriverError::Timeout);
        }
        Ok(s.status)
    }
}

impl PumpDriver for MockPump {
    fn capabilities(&self) -> PumpCapabilities {
        PumpCapabilities { family: "mock", ..VIRTUAL_CAPABILITIES }
    }

    fn status(&self) -> PumpStatus {
        self.state.lock().unwrap().status
    }

    fn connect(&mut self, _timeout: Duration) -> Result<PumpStatus, DriverError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(PumpCall::Connect);
        let fault = s.script.iter().position(|(o, _)| *o == PumpOp::Connect).and_then(|i| s.script.remove(i));
        if let Some((_, kind)) = fault {
            return Err(match kind {
                FaultKind::Fail(e) => e,
                FaultKind::LostConfirmation => DriverError::Timeout,
            });
        }
        s.status.connection = ConnectionState::Connected;
        Ok(s.status)
    }

    fn get_status(&mut self, _timeout: Duration) -> Result<PumpStatus, DriverError> {
        self.exchange(PumpOp::GetStatus, PumpCall::GetStatus, |_, _| None)
    }

    fn set_temp_basal(&mut self, rate: f64, duration_min: u32, _timeout: Duration) -> Result<PumpStatus, DriverError> {
        self.exchange(PumpOp::SetTempBasal, PumpCall::SetTempBasal { rate, duration_min }, |st, now| {
            st.temp_basal = Some(ActiveTempBasal { rate, duration_min, started_at: now });
            Some(ConfirmedCommand::TempBasal { rate, duration_min, at: now })
        })
    }

    fn cancel_temp_basal(&mut self, _timeout: Duration) -> Result<PumpStatus, DriverError> {
        self.exchange(PumpOp::CancelTempBasal, PumpCall::CancelTempBasal, |st, now| {
            st.temp_basal = None;
            Some(ConfirmedCommand::CancelTempBasal { at: now })
        })
    }

    fn bolus(&mut self, amount: f64, _timeout: Duration) -> Result<PumpStatus, DriverError> {
        self.exchange(PumpOp::Bolus, PumpCall::Bolus { amount }, |st, now| {
            st.reservoir_units -= amount;
            Some(ConfirmedCommand::Bolus { amount, at: now })
        })
    }
}

#[allow(dead_code)]
impl PumpProbe {
    pub fn calls(&self) -> Vec<PumpCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn command_calls(&self) -> Vec<PumpCall> {
        self.calls().into_iter().filter(PumpCall::is_command).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Fail the next call of `op` with `kind`.  Queued faults are consumed
    /// in order.
    pub fn inject(&self, op: PumpOp, kind: FaultKind) {
        self.state.lock().unwrap().script.push_back((op, kind));
    }

    pub fn set_connection(&self, connection: ConnectionState) {
        self.state.lock().unwrap().status.connection = connection;
    }

    pub fn set_temp(&self, temp: Option<ActiveTempBasal>) {
        self.state.lock().unwrap().status.temp_basal = temp;
    }

    pub fn set_reservoir(&self, units: f64) {
        self.state.lock().unwrap().status.reservoir_units = units;
    }

    pub fn status(&self) -> PumpStatus {
        self.state.lock().unwrap().status
    }
}

// ── RecordingSink ─────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<LoopEvent>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> usize {
        self.events.iter().filter(|e| matches!(e, LoopEvent::CycleCompleted(_))).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &LoopEvent) {
        self.events.push(event.clone());
    }
}

// ── Harness ───────────────────────────────────────────────────

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// Basal 1.0 U/h, ISF 50, CR 10, target 90–180, 3 h action, peak 75 min.
pub fn test_profile() -> Profile {
    Profile::flat("test", 1.0, 50.0, 10.0, (90.0, 180.0), 180, 75).unwrap()
}

pub struct Harness {
    pub service: LoopService,
    pub clock: Arc<ManualClock>,
    pub history: Arc<InMemoryHistory>,
    pub profiles: Arc<StaticProfileProvider>,
    pub pump: PumpProbe,
    pub delay: SkipDelay,
    pub sink: RecordingSink,
}

#[allow(dead_code)]
impl Harness {
    pub fn new(config: LoopConfig) -> Self {
        Self::with_registry(config, ConstraintRegistry::standard())
    }

    pub fn with_registry(config: LoopConfig, registry: ConstraintRegistry) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let history = Arc::new(InMemoryHistory::new());
        let profiles = Arc::new(StaticProfileProvider::with_profile(test_profile()));
        let (pump, probe) = MockPump::new(clock.clone());
        let delay = SkipDelay::new();
        let ports = LoopPorts {
            history: history.clone(),
            profiles: profiles.clone(),
            pump: Box::new(pump),
            delay: Box::new(delay.clone()),
            storage: Box::new(MemoryStorage::new()),
            clock: clock.clone(),
        };
        let mut service = LoopService::new(ports, SharedConfig::new(config), registry).unwrap();
        let mut sink = RecordingSink::new();
        service.start(&mut sink);
        Self { service, clock, history, profiles, pump: probe, delay, sink }
    }

    /// Readings every 5 minutes for the last `count` samples, the newest at
    /// `now - newest_age_secs`, following `value(i)` oldest first.
    pub fn glucose_series(&self, count: u32, newest_age_secs: i64, value: impl Fn(u32) -> f64) {
        let newest = self.clock.now() - chrono::Duration::seconds(newest_age_secs);
        for i in 0..count {
            let at = newest - chrono::Duration::minutes(i64::from(5 * (count - 1 - i)));
            self.history
                .append_glucose(GlucoseReading::new(at, value(i), TrendDirection::Flat, "test"))
                .unwrap();
        }
    }

    pub fn flat_glucose(&self, value: f64) {
        self.glucose_series(7, 0, |_| value);
    }

    pub fn cycle(&mut self) -> aidloop::app::events::LoopResult {
        self.service.run_cycle(&aidloop::app::runner::CancelToken::new(), &mut self.sink)
    }
}
