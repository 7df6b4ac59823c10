//! Runtime bootstrap: errors and telemetry.

pub mod error;
pub mod telemetry;
