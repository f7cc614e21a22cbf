//! Pump link state machine.
//!
//! ```text
//!  Disconnected ──▶ Connecting ──▶ Connected ◀──▶ Busy
//!        ▲               │             │            │
//!        └───────────────┴─────────────┴────────────┘
//! ```
//!
//! `Busy` covers a single command exchange.  Any state except
//! `Disconnected` may drop back to it when the link is lost.

use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::fsm::{Fsm, StateDescriptor, StateSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Busy = 3,
}

impl StateSet for ConnectionState {
    const TABLE: &'static [StateDescriptor<Self>] = &[
        StateDescriptor {
            id: Self::Disconnected,
            name: "DISCONNECTED",
            successors: &[Self::Connecting],
        },
        StateDescriptor {
            id: Self::Connecting,
            name: "CONNECTING",
            successors: &[Self::Connected, Self::Disconnected],
        },
        StateDescriptor {
            id: Self::Connected,
            name: "CONNECTED",
            successors: &[Self::Busy, Self::Disconnected],
        },
        StateDescriptor {
            id: Self::Busy,
            name: "BUSY",
            successors: &[Self::Connected, Self::Disconnected],
        },
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Link FSM shared by driver implementations.
pub struct ConnectionFsm {
    fsm: Fsm<ConnectionState>,
}

impl Default for ConnectionFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFsm {
    pub fn new() -> Self {
        Self { fsm: Fsm::new("pump link", ConnectionState::Disconnected) }
    }

    pub fn state(&self) -> ConnectionState {
        self.fsm.current()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    pub fn go(&mut self, next: ConnectionState) -> Result<(), DriverError> {
        self.fsm.transition(next).map(|_| ()).map_err(|_| DriverError::InvalidTransition)
    }

    /// Drop the link from whatever state it is in.
    pub fn drop_link(&mut self) {
        if !self.is_disconnected() {
            // Every other state lists Disconnected as a successor.
            let _ = self.fsm.transition(ConnectionState::Disconnected);
        }
    }

    /// Enter `Busy` for one command exchange.  Fails with `NotConnected`
    /// unless the link is idle and connected.
    pub fn begin_command(&mut self) -> Result<(), DriverError> {
        match self.state() {
            ConnectionState::Connected => self.go(ConnectionState::Busy),
            ConnectionState::Busy => Err(DriverError::Busy),
            ConnectionState::Disconnected | ConnectionState::Connecting => Err(DriverError::NotConnected),
        }
    }

    pub fn end_command(&mut self) -> Result<(), DriverError> {
        self.go(ConnectionState::Connected)
    }
}
