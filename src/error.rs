//! Unified error types for the dosing core.
//!
//! Every layer below the orchestrator returns one of the typed errors in
//! this module instead of aborting.  All variants are `Copy` so they can
//! be threaded through the cycle, logged, and summarised into audit
//! records without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the core funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    History(HistoryError),
    Profile(ProfileError),
    Algorithm(AlgorithmError),
    Driver(DriverError),
    Config(ConfigError),
    Storage(StorageError),
    Audit(AuditError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::History(e) => write!(f, "history: {e}"),
            Self::Profile(e) => write!(f, "profile: {e}"),
            Self::Algorithm(e) => write!(f, "algorithm: {e}"),
            Self::Driver(e) => write!(f, "pump driver: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Audit(e) => write!(f, "audit: {e}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// History store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryError {
    /// A glucose reading already exists at this timestamp.
    DuplicateTimestamp,
    /// The record is older than the newest record of the same kind.
    OutOfOrder,
    /// Value is non-finite, negative, or otherwise implausible.
    InvalidValue,
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateTimestamp => write!(f, "duplicate timestamp"),
            Self::OutOfOrder => write!(f, "record older than history head"),
            Self::InvalidValue => write!(f, "invalid value"),
        }
    }
}

impl std::error::Error for HistoryError {}

impl From<HistoryError> for Error {
    fn from(e: HistoryError) -> Self {
        Self::History(e)
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileError {
    /// No profile has been configured yet.
    NotConfigured,
    /// The profile failed validation.  The message names the offending
    /// field and why.
    Invalid(&'static str),
    /// The provider does not accept profile updates.
    ReadOnly,
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "no profile configured"),
            Self::Invalid(msg) => write!(f, "invalid profile: {msg}"),
            Self::ReadOnly => write!(f, "profile provider is read-only"),
        }
    }
}

impl std::error::Error for ProfileError {}

impl From<ProfileError> for Error {
    fn from(e: ProfileError) -> Self {
        Self::Profile(e)
    }
}

// ---------------------------------------------------------------------------
// Dosing algorithm
// ---------------------------------------------------------------------------

/// Reasons a strategy's output is discarded.  Any of these leads the
/// orchestrator to the baseline path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmError {
    /// A NaN or infinite value was produced.
    NonFinite,
    /// Temp basal rate outside `[0, basal × max multiplier]`.
    RateOutOfRange,
    /// Bolus recommended while the forecast crosses the hard floor.
    BolusBelowFloor,
    /// Negative bolus.
    NegativeBolus,
    /// The strategy panicked.
    Panicked,
    /// The strategy could not work with the given inputs.
    InsufficientInput(&'static str),
}

impl fmt::Display for AlgorithmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonFinite => write!(f, "non-finite output"),
            Self::RateOutOfRange => write!(f, "temp basal rate out of range"),
            Self::BolusBelowFloor => write!(f, "bolus while forecast below hard floor"),
            Self::NegativeBolus => write!(f, "negative bolus"),
            Self::Panicked => write!(f, "strategy panicked"),
            Self::InsufficientInput(msg) => write!(f, "insufficient input: {msg}"),
        }
    }
}

impl std::error::Error for AlgorithmError {}

impl From<AlgorithmError> for Error {
    fn from(e: AlgorithmError) -> Self {
        Self::Algorithm(e)
    }
}

// ---------------------------------------------------------------------------
// Pump driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// No confirmation arrived within the timeout.
    Timeout,
    /// The pump is not connected.
    NotConnected,
    /// The pump is busy with another command.
    Busy,
    /// The pump explicitly refused the command.
    Rejected(&'static str),
    /// Radio / link level failure.
    Communication,
    /// The connection state machine was asked for an illegal move.
    InvalidTransition,
}

impl DriverError {
    /// Whether retrying the same command may succeed.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::Busy | Self::Communication | Self::NotConnected)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "confirmation timeout"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Busy => write!(f, "pump busy"),
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
            Self::Communication => write!(f, "communication failure"),
            Self::InvalidTransition => write!(f, "invalid connection transition"),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<DriverError> for Error {
    fn from(e: DriverError) -> Self {
        Self::Driver(e)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Errors from [`ConfigPort`](crate::app::ports::ConfigPort) operations and
/// from cycle-level configuration checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// No config found in storage (first start).
    NotFound,
    /// Stored config failed deserialization.
    Corrupted,
    /// A config field failed range validation.
    ValidationFailed(&'static str),
    /// A required constraint stage is missing from the registry.
    MissingConstraint(&'static str),
    /// The configured pump family is not in the driver registry.
    UnknownPumpFamily,
    /// Generic I/O error from the storage backend.
    IoError,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "config not found"),
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {msg}"),
            Self::MissingConstraint(which) => write!(f, "missing constraint stage: {which}"),
            Self::UnknownPumpFamily => write!(f, "unknown pump family"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Key already exists and the namespace is append-only.
    AlreadyExists,
    /// Namespace or key contains characters the backend cannot store.
    InvalidKey,
    /// Generic I/O error.
    IoError,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::AlreadyExists => write!(f, "key already exists"),
            Self::InvalidKey => write!(f, "invalid key"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditError {
    /// Underlying storage failed.
    Storage(StorageError),
    /// A record could not be encoded or decoded.
    Codec,
    /// A record's hash or back-link does not match its predecessor.
    ChainBroken { sequence: u64 },
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Codec => write!(f, "record codec failure"),
            Self::ChainBroken { sequence } => write!(f, "hash chain broken at cycle {sequence}"),
        }
    }
}

impl From<StorageError> for AuditError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl std::error::Error for AuditError {}

impl From<AuditError> for Error {
    fn from(e: AuditError) -> Self {
        Self::Audit(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
