//! Table-driven finite state machine engine.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  State table                                         │
//! │  ┌───────────┬──────────┬────────────────────────┐   │
//! │  │ id        │ name     │ successors             │   │
//! │  ├───────────┼──────────┼────────────────────────┤   │
//! │  │ Idle      │ "IDLE"   │ [Running]              │   │
//! │  │ Running   │ "RUN"    │ [Committed, Failed, …] │   │
//! │  │ …         │ …        │ …                      │   │
//! │  └───────────┴──────────┴────────────────────────┘   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! A state set supplies a static table of [`StateDescriptor`]s indexed by
//! the state's discriminant.  [`Fsm::transition`] accepts a move only when
//! the target appears in the current row's successor list, so illegal
//! moves surface as typed errors instead of silently corrupting the
//! lifecycle.  The same engine drives the loop lifecycle
//! ([`states::LoopState`]) and the pump link
//! ([`ConnectionState`](crate::pump::ConnectionState)).

pub mod states;

use core::fmt;

use log::{debug, info};

pub use states::LoopState;

// ---------------------------------------------------------------------------
// State table
// ---------------------------------------------------------------------------

/// Static descriptor for a single state.
pub struct StateDescriptor<S: 'static> {
    pub id: S,
    pub name: &'static str,
    /// States reachable from this one in a single move.
    pub successors: &'static [S],
}

/// A closed set of states with a static transition table.
pub trait StateSet: Copy + Eq + fmt::Debug + 'static {
    /// Row `i` must describe the state whose [`index`](Self::index) is `i`.
    const TABLE: &'static [StateDescriptor<Self>];

    fn index(self) -> usize;

    fn descriptor(self) -> &'static StateDescriptor<Self> {
        &Self::TABLE[self.index()]
    }

    fn name(self) -> &'static str {
        self.descriptor().name
    }
}

/// Rejected move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError<S> {
    pub from: S,
    pub to: S,
}

impl<S: StateSet> fmt::Display for TransitionError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal transition {} -> {}", self.from.name(), self.to.name())
    }
}

// ---------------------------------------------------------------------------
// FSM engine
// ---------------------------------------------------------------------------

pub struct Fsm<S: StateSet> {
    /// Log prefix, e.g. "loop" or "pump".
    label: &'static str,
    current: S,
    /// Accepted transitions since construction.
    transitions: u64,
}

impl<S: StateSet> Fsm<S> {
    pub fn new(label: &'static str, initial: S) -> Self {
        debug_assert!(
            S::TABLE.iter().enumerate().all(|(i, d)| d.id.index() == i),
            "state table out of order"
        );
        Self { label, current: initial, transitions: 0 }
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    pub fn can_transition(&self, next: S) -> bool {
        self.current.descriptor().successors.contains(&next)
    }

    /// Move to `next`, returning the state that was left.
    pub fn transition(&mut self, next: S) -> Result<S, TransitionError<S>> {
        let from = self.current;
        if !self.can_transition(next) {
            debug!("{}: rejected {} -> {}", self.label, from.name(), next.name());
            return Err(TransitionError { from, to: next });
        }
        info!("{} transition: {} -> {}", self.label, from.name(), next.name());
        self.current = next;
        self.transitions += 1;
        Ok(from)
    }
}
