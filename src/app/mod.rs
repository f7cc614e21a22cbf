//! Application core: the control loop and its boundary.
//!
//! This module wires the pure stages (prediction, dosing, constraints)
//! into the periodic loop: the [`service`] runs one cycle, the
//! [`dispatcher`] turns a decision into pump calls, and the [`runner`]
//! owns the timer and the command channel.  All interaction with the
//! outside world happens through **port traits** defined in [`ports`],
//! keeping this layer testable without a real pump.

pub mod commands;
pub mod dispatcher;
pub mod events;
pub mod ports;
pub mod runner;
pub mod service;
