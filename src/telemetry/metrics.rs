// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Metric names and recording helpers over the `metrics` facade.
//!
//! No exporter is installed here; the embedding process chooses one.

use std::time::Duration;

pub const PIPELINES_BUILT: &str = "gyre_pipelines_built_total";
pub const ACTIVATIONS: &str = "gyre_activations_total";
pub const DISPLACEMENTS: &str = "gyre_displacements_total";
pub const GENERATIONS: &str = "gyre_generations_total";
pub const RESOLUTION_FAILURES: &str = "gyre_resolution_failures_total";
pub const DEVICE_WAIT: &str = "gyre_device_wait_seconds";

/// Register descriptions for every metric this crate emits.
pub fn init_metrics() {
    metrics::describe_counter!(PIPELINES_BUILT, "Pipelines assembled from loaded model sets");
    metrics::describe_counter!(ACTIVATIONS, "Pipeline activations on a device");
    metrics::describe_counter!(DISPLACEMENTS, "Resident pipelines displaced by another engine");
    metrics::describe_counter!(GENERATIONS, "Completed generation calls");
    metrics::describe_counter!(RESOLUTION_FAILURES, "Weight descriptors with no working source");
    metrics::describe_histogram!(DEVICE_WAIT, metrics::Unit::Seconds, "Time spent waiting for a device slot");
}

pub fn record_pipeline_built(engine: &str) {
    metrics::counter!(PIPELINES_BUILT, "engine" => engine.to_string()).increment(1);
}

pub fn record_activation(engine: &str) {
    metrics::counter!(ACTIVATIONS, "engine" => engine.to_string()).increment(1);
}

pub fn record_displacement(engine: &str) {
    metrics::counter!(DISPLACEMENTS, "engine" => engine.to_string()).increment(1);
}

pub fn record_generation(engine: &str) {
    metrics::counter!(GENERATIONS, "engine" => engine.to_string()).increment(1);
}

pub fn record_resolution_failure() {
    metrics::counter!(RESOLUTION_FAILURES).increment(1);
}

pub fn record_device_wait(waited: Duration) {
    metrics::histogram!(DEVICE_WAIT).record(waited.as_secs_f64());
}
