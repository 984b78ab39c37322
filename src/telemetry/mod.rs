// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Telemetry for the Gyre engine: structured logging and metrics.

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{
    init_metrics, record_activation, record_device_wait, record_displacement, record_generation,
    record_pipeline_built, record_resolution_failure,
};
