//! Telemetry bootstrap for the foreman services.

pub mod logging;
