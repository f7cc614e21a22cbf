//! aidloop-sim: runs the dosing loop against a simulated patient.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Adapters (outer ring)                      │
//! │                                                              │
//! │  ManualClock   FileStorage   LogEventSink   SkipDelay        │
//! │  (TimePort)    (StoragePort) (EventSink)    (DelayNs)        │
//! │  InMemoryHistory   StaticProfileProvider   VirtualPump       │
//! │                                                              │
//! │  ──────────────── Port Trait Boundary ───────────────────    │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │            LoopService (pure logic)                    │  │
//! │  │  predict · autosens · dose · constrain · dispatch      │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                                                              │
//! │  LoopRunner (scheduler + command channel)                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The patient model integrates the same insulin and carb curves the loop
//! predicts with, scaled by a "true" sensitivity that differs from the
//! profile, so the loop has something to correct.

#![deny(unused_must_use)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use clap::Parser;
use log::{info, warn};

use aidloop::adapters::config_file::JsonConfigFile;
use aidloop::adapters::delay::SkipDelay;
use aidloop::adapters::log_sink::LogEventSink;
use aidloop::adapters::storage::FileStorage;
use aidloop::adapters::time::ManualClock;
use aidloop::app::events::CycleOutcome;
use aidloop::app::ports::TimePort;
use aidloop::app::runner::LoopRunner;
use aidloop::app::service::{LoopPorts, LoopService};
use aidloop::config::{LoopConfig, SharedConfig};
use aidloop::constraints::ConstraintRegistry;
use aidloop::history::{GlucoseReading, HistoryStore, InMemoryHistory, Treatment, TrendDirection};
use aidloop::prediction::carbs::{carb_entries, cob_at};
use aidloop::prediction::insulin::{activity_at, insulin_doses};
use aidloop::prediction::{CarbModel, InsulinCurve};
use aidloop::profile::{Profile, StaticProfileProvider};
use aidloop::pump::build_driver;

// ── CLI ───────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "aidloop-sim", version, about = "Run the dosing loop against a simulated day")]
struct Args {
    /// Loop configuration (JSON).  Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Therapy profile (JSON).  A flat profile is used when omitted.
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Directory the audit log is written to.
    #[arg(long, default_value = "aidloop-audit")]
    audit_dir: PathBuf,

    /// Number of 5-minute CGM intervals to simulate.
    #[arg(long, default_value_t = 288)]
    cycles: u32,

    /// Simulation start (RFC 3339).
    #[arg(long, default_value = "2026-03-01T00:00:00Z")]
    start: DateTime<Utc>,

    /// Glucose at the start (mg/dL).
    #[arg(long, default_value_t = 140.0)]
    initial_glucose: f64,

    /// Meals as `HH:MM=grams`, repeatable.
    #[arg(long = "meal", value_parser = parse_meal, default_values_t = default_meals())]
    meals: Vec<Meal>,

    /// Fraction of each meal covered by a manual pen bolus.
    #[arg(long, default_value_t = 0.7)]
    pen_bolus_fraction: f64,

    /// Patient's actual ISF as a multiple of the profile ISF.
    #[arg(long, default_value_t = 1.15)]
    sensitivity: f64,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy)]
struct Meal {
    at: NaiveTime,
    grams: f64,
}

impl std::fmt::Display for Meal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.at.format("%H:%M"), self.grams)
    }
}

fn parse_meal(s: &str) -> Result<Meal, String> {
    let (time, grams) = s.split_once('=').ok_or("expected HH:MM=grams")?;
    let at = NaiveTime::parse_from_str(time, "%H:%M").map_err(|e| e.to_string())?;
    let grams: f64 = grams.parse().map_err(|e: std::num::ParseFloatError| e.to_string())?;
    if grams.is_nan() || grams <= 0.0 || grams >= 300.0 {
        return Err("grams must be within (0, 300)".into());
    }
    Ok(Meal { at, grams })
}

fn default_meals() -> Vec<Meal> {
    ["07:30=45", "12:30=60", "19:00=70"].iter().filter_map(|s| parse_meal(s).ok()).collect()
}

// ── Patient model ─────────────────────────────────────────────

struct Patient {
    glucose: f64,
    sensitivity: f64,
    carbs: CarbModel,
}

impl Patient {
    /// Advance glucose by one 5-minute step ending at `to`.
    fn step(&mut self, history: &dyn HistoryStore, profile: &Profile, from: DateTime<Utc>, to: DateTime<Utc>) {
        let window = history.read_since(from - Duration::hours(12));
        let Ok(curve) = InsulinCurve::for_profile(profile) else {
            return;
        };
        let doses = insulin_doses(&window.treatments, profile, from);
        let slice = profile.slice_at(from);
        let isf = slice.isf * self.sensitivity;

        let insulin = activity_at(&doses, &curve, from) * 5.0 * isf;
        let meals = carb_entries(&window.treatments, to);
        let absorbed = cob_at(&meals, &self.carbs, from) - cob_at(&meals, &self.carbs, to);
        let carbs = absorbed.max(0.0) * isf / slice.carb_ratio;

        // Slow diurnal drift so the loop never sees a perfectly flat day.
        let hours = (from.timestamp() % 86_400) as f64 / 3600.0;
        let drift = 0.4 * (std::f64::consts::TAU * (hours - 4.0) / 24.0).sin();

        self.glucose = (self.glucose + carbs - insulin + drift).clamp(39.0, 400.0);
    }
}

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if args.verbose {
        "debug"
    } else {
        "info"
    }))
    .init();

    info!("aidloop-sim v{}", env!("CARGO_PKG_VERSION"));

    // ── 1. Configuration and profile ──────────────────────────
    let config = match &args.config {
        Some(path) => JsonConfigFile::new(path)
            .load_or_default()
            .map_err(anyhow::Error::from)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => LoopConfig::default(),
    };
    let profile = match &args.profile {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<Profile>(&text).with_context(|| format!("parsing profile {}", path.display()))?
        }
        None => Profile::flat("default", 0.9, 45.0, 10.0, (90.0, 140.0), 300, 75)
            .map_err(anyhow::Error::from)
            .context("building default profile")?,
    };
    if !(0.3..=3.0).contains(&args.sensitivity) {
        bail!("--sensitivity must be within 0.3..=3.0");
    }

    // ── 2. Adapters ───────────────────────────────────────────
    let clock = Arc::new(ManualClock::new(args.start));
    let history = Arc::new(InMemoryHistory::new());
    let profiles = Arc::new(StaticProfileProvider::with_profile(profile.clone()));
    let pump = build_driver(&config.pump_family, clock.clone())
        .map_err(anyhow::Error::from)
        .context("selecting pump driver")?;
    let storage = FileStorage::open(&args.audit_dir)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("opening audit dir {}", args.audit_dir.display()))?;
    let delay = SkipDelay::new();

    let ports = LoopPorts {
        history: history.clone(),
        profiles,
        pump,
        delay: Box::new(delay.clone()),
        storage: Box::new(storage),
        clock: clock.clone(),
    };
    let service = LoopService::new(ports, SharedConfig::new(config.clone()), ConstraintRegistry::standard())
        .map_err(anyhow::Error::from)
        .context("opening audit log")?;
    let (mut runner, _handle) = LoopRunner::new(service, LogEventSink::new());

    // ── 3. Simulated day ──────────────────────────────────────
    let mut patient = Patient {
        glucose: args.initial_glucose,
        sensitivity: args.sensitivity,
        carbs: CarbModel {
            absorption_min: f64::from(config.carb_absorption_min),
            max_g_per_min: config.max_carb_absorption_g_per_min,
        },
    };
    let step = Duration::minutes(5);
    let mut previous = patient.glucose;
    let mut stats = Stats::default();

    for i in 0..args.cycles {
        let now = clock.now();
        if i > 0 {
            patient.step(history.as_ref(), &profile, now - step, now);
        }

        for meal in args.meals.iter().filter(|m| eats_at(m, now, step)) {
            info!("sim: meal {:.0} g", meal.grams);
            record(history.append_treatment(Treatment::CarbEntry { grams: meal.grams, timestamp: now }));
            let pen = meal.grams / profile.slice_at(now).carb_ratio * args.pen_bolus_fraction;
            if pen > 0.0 {
                record(history.append_treatment(Treatment::Bolus { amount: pen, timestamp: now }));
            }
        }

        let bg = patient.glucose.round();
        record(history.append_glucose(GlucoseReading::new(now, bg, TrendDirection::from_delta(bg - previous), "sim-cgm")));
        previous = bg;
        stats.glucose(bg);

        if let Some(result) = runner.step() {
            stats.outcome(&result.outcome);
        }
        clock.advance(step);
    }

    // ── 4. Report ─────────────────────────────────────────────
    let service = runner.service();
    let verified = service.audit().verify_chain().map_err(anyhow::Error::from).context("verifying audit chain")?;
    let status = service.pump().status();
    info!(
        "sim: {} cycles | committed {} failed {} skipped {}",
        stats.cycles(),
        stats.committed,
        stats.failed,
        stats.skipped
    );
    info!(
        "sim: glucose mean {:.0} min {:.0} max {:.0} | in range {:.0}%",
        stats.mean(),
        stats.min,
        stats.max,
        stats.in_range_pct()
    );
    info!("sim: reservoir {:.1} U, backoff slept {:?}", status.reservoir_units, delay.total());
    info!("sim: audit chain OK ({verified} records in {})", args.audit_dir.display());
    Ok(())
}

fn eats_at(meal: &Meal, now: DateTime<Utc>, step: Duration) -> bool {
    let Some(at) = now.date_naive().and_time(meal.at).and_local_timezone(Utc).single() else {
        return false;
    };
    at <= now && now < at + step
}

fn record(result: Result<(), aidloop::error::HistoryError>) {
    if let Err(e) = result {
        warn!("sim: history rejected record: {e}");
    }
}

#[derive(Default)]
struct Stats {
    committed: u32,
    failed: u32,
    skipped: u32,
    samples: u32,
    in_range: u32,
    sum: f64,
    min: f64,
    max: f64,
}

impl Stats {
    fn glucose(&mut self, bg: f64) {
        if self.samples == 0 {
            self.min = bg;
            self.max = bg;
        }
        self.samples += 1;
        self.sum += bg;
        self.min = self.min.min(bg);
        self.max = self.max.max(bg);
        if (70.0..=180.0).contains(&bg) {
            self.in_range += 1;
        }
    }

    fn outcome(&mut self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Committed { .. } => self.committed += 1,
            CycleOutcome::Failed { .. } => self.failed += 1,
            CycleOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    fn cycles(&self) -> u32 {
        self.committed + self.failed + self.skipped
    }

    fn mean(&self) -> f64 {
        if self.samples == 0 { 0.0 } else { self.sum / f64::from(self.samples) }
    }

    fn in_range_pct(&self) -> f64 {
        if self.samples == 0 { 0.0 } else { f64::from(self.in_range) * 100.0 / f64::from(self.samples) }
    }
}
