//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises a specific subsystem
//! against mock adapters.  Everything runs on the host with a manual
//! clock, so no test sleeps.

mod dispatcher_tests;
mod loop_service_tests;
mod mock_pump;
mod runner_tests;
mod scenario_tests;
