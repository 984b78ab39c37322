// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Pipeline engine for the Gyre runtime.
//!
//! Assembles pipelines from loaded model sets, activates them on leased
//! compute devices and runs generations through them. Provides the
//! `EngineManager` facade and the collaborator traits concrete pipelines
//! implement.

pub mod assembler;
pub mod batch;
pub mod device;
pub mod error;
pub mod generate;
pub mod manager;
pub mod mode;
pub mod pipeline;
pub mod wrapper;

pub use assembler::PipelineCatalog;
pub use batch::BatchMode;
pub use device::{ComputeDevice, DeviceKind, DeviceLease, DevicePool, DeviceSlot, PipelinePools};
pub use error::{EngineError, PipelineError};
pub use generate::{GenerateRequest, GenerationOutput, Seed};
pub use manager::{EngineManager, EngineSettings, LoadReport, DEFAULT_TASK};
pub use mode::{DelayPolicy, EngineMode};
pub use pipeline::{
    ComponentSlot, HostTransfer, ModuleTransfer, Pipeline, PipelineCall, PipelineFactory,
    PipelineManifest, ProgressFn, Sampler, SamplerSet, StepMonitor,
};
pub use wrapper::PipelineWrapper;
