//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod realtime;
pub mod telemetry;
