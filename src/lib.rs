// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Gyre Engine
//!
//! Lifecycle manager for GPU image generation pipelines. Turns declarative
//! engine and model records into ready pipelines and hands out exclusive
//! access to them on a pool of compute devices.
//!
//! # Layers
//!
//! - **models**: descriptor records, weight resolution, component loading,
//!   model references and weight mixing
//! - **engine**: pipeline assembly, device pool, residency and memory modes,
//!   generation and batch sizing
//! - **config**: `GYRE_*` environment configuration
//! - **telemetry**: structured logging and metrics

pub mod cli;
pub mod config;
pub mod engine;
pub mod models;
pub mod telemetry;
