#![doc = "Common types shared across the PROFINET IO controller workspace."]

pub mod config;
pub mod error;
pub mod mac;
pub mod state;

pub use config::*;
pub use error::*;
pub use mac::*;
pub use state::*;
