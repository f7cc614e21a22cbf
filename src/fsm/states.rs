//! Loop lifecycle states.
//!
//! ```text
//!          ┌──────────── Idle ◀─────────────────┐
//!          │               │                    │
//!          │            Running                 │
//!          │       ┌───────┼────────┐           │
//!          │  Committed  Failed  Skipped ───────┘
//!          │       └───────┴────────┴──▶ Idle
//! ```

use serde::{Deserialize, Serialize};

use super::{StateDescriptor, StateSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Running = 1,
    Committed = 2,
    Failed = 3,
    Skipped = 4,
}

impl LoopState {
    /// True for the three outcome states a cycle ends in.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed | Self::Skipped)
    }
}

impl StateSet for LoopState {
    const TABLE: &'static [StateDescriptor<Self>] = &[
        StateDescriptor {
            id: Self::Idle,
            name: "IDLE",
            successors: &[Self::Running],
        },
        StateDescriptor {
            id: Self::Running,
            name: "RUNNING",
            successors: &[Self::Committed, Self::Failed, Self::Skipped],
        },
        StateDescriptor {
            id: Self::Committed,
            name: "COMMITTED",
            successors: &[Self::Idle],
        },
        StateDescriptor {
            id: Self::Failed,
            name: "FAILED",
            successors: &[Self::Idle],
        },
        StateDescriptor {
            id: Self::Skipped,
            name: "SKIPPED",
            successors: &[Self::Idle],
        },
    ];

    fn index(self) -> usize {
        self as usize
    }
}
