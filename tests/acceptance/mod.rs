//! Acceptance test modules.
//!
//! The mock device is shared with the fieldbus integration tests.

#[path = "../../crates/pnio-fieldbus/tests/mock_device/mod.rs"]
mod mock_device;

mod config_test;
mod end_to_end_test;
mod scenario_test;
