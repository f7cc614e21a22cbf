//! Inbound commands to the loop.
//!
//! These represent requests from the outside world (UI, CGM ingest,
//! remote settings) that the [`LoopService`](super::service::LoopService)
//! applies between cycles.

use crate::config::LoopConfig;
use crate::profile::ProfileSpec;

#[derive(Debug, Clone)]
pub enum LoopCommand {
    /// Run a cycle now (e.g. a fresh glucose reading arrived).
    TriggerCycle,

    /// Swap the live configuration.  Rejected unless it validates.
    UpdateConfig(Box<LoopConfig>),

    /// Replace the active profile.  Rejected unless it validates.
    SetProfile(Box<ProfileSpec>),

    /// Enable or disable closed-loop dosing.  A disabled loop skips.
    SetLoopEnabled(bool),

    /// Stop the runner after the current cycle.
    Shutdown,
}
