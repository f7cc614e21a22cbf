//! Port traits: the hexagonal boundary between the dosing core and the
//! outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ LoopService (domain)
//! ```
//!
//! Driven adapters (clock, event sinks, storage, config files) implement
//! these traits.  [`LoopService`](super::service::LoopService) consumes
//! them as trait objects so hosts, the simulator and the tests can plug in
//! their own.  The history store, profile provider and pump driver ports
//! live next to their domain types in [`crate::history`],
//! [`crate::profile`] and [`crate::pump`].
//!
//! ## Contract notes
//!
//! - **ConfigPort** implementations MUST validate before persisting.
//! - **StoragePort::append** MUST refuse to overwrite; the audit log relies
//!   on it for append-only semantics.
//! - All port errors are typed; callers handle every variant explicitly.

use chrono::{DateTime, Utc};

use crate::config::LoopConfig;
use crate::error::{ConfigError, StorageError};

// ───────────────────────────────────────────────────────────────
// Time port
// ───────────────────────────────────────────────────────────────

/// Source of wall-clock time.  The loop reads it exactly once per cycle.
pub trait TimePort: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

// ───────────────────────────────────────────────────────────────
// Event sink port (domain → logging / UI / telemetry)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`LoopEvent`](super::events::LoopEvent)s
/// through this port.  Adapters decide where they go (log, UI, upload).
pub trait EventSink {
    fn emit(&mut self, event: &super::events::LoopEvent);
}

// ───────────────────────────────────────────────────────────────
// Configuration port (domain ↔ persistent config)
// ───────────────────────────────────────────────────────────────

/// Loads and persists the loop configuration.
///
/// Invalid ranges are rejected with [`ConfigError::ValidationFailed`],
/// never silently clamped, so a bad file or command cannot widen a safety
/// limit.
pub trait ConfigPort {
    /// Load configuration.  Returns [`ConfigError::NotFound`] when none is
    /// stored; callers usually fall back to [`LoopConfig::default()`].
    fn load(&self) -> Result<LoopConfig, ConfigError>;

    /// Validate and persist configuration.
    fn save(&self, config: &LoopConfig) -> Result<(), ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Storage port (domain ↔ disk / memory)
// ───────────────────────────────────────────────────────────────

/// Namespaced key-value storage.
///
/// Writes MUST be atomic: a reader sees either the old value or the new
/// one, never a partial write.
pub trait StoragePort {
    fn read(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Create or replace a value.
    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Create a value; fails with [`StorageError::AlreadyExists`] if the
    /// key is taken.
    fn append(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key.  Returns `Ok(())` even if the key didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;

    fn exists(&self, namespace: &str, key: &str) -> bool;

    /// All keys in `namespace`, sorted ascending.
    fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError>;
}

/// Keys and namespaces are restricted to `[A-Za-z0-9_.-]` so every
/// backend can store them verbatim.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 64
        && key.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
        && key != "."
        && key != ".."
}
