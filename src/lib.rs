//! aidloop: closed-loop insulin dosing control core.
//!
//! Exposes the pure-logic modules (history, prediction, dosing,
//! constraints) together with the orchestrator, dispatcher and pump
//! abstraction so they can be driven by a host binary, a simulator or the
//! integration tests.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod audit;
pub mod config;
pub mod constraints;
pub mod dosing;
pub mod fsm;
pub mod history;
pub mod prediction;
pub mod profile;
pub mod pump;
pub mod scheduler;
pub mod sensitivity;

pub mod error;

/// Copy `s` into a fixed-capacity string, cutting at the last char
/// boundary that fits.
pub(crate) fn truncated<const N: usize>(s: &str) -> heapless::String<N> {
    let mut end = s.len().min(N);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = heapless::String::new();
    // Cannot fail: `end <= N` bytes.
    let _ = out.push_str(&s[..end]);
    out
}
