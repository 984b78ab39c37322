// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Contracts for the inference pipelines the engine manages.
//!
//! The engine never runs a forward pass itself. Concrete pipelines implement
//! [`Pipeline`], declare what they accept through a [`PipelineManifest`] and
//! are built by a [`PipelineFactory`] from an assembled [`ModelSet`]. Moving
//! modules between host and device goes through [`ModuleTransfer`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use serde_json::Value;

use super::device::ComputeDevice;
use super::error::PipelineError;
use crate::models::{Component, Model, ModelSet, Placement, Tensor};

/// Name of the optional safety checker component.
pub const SAFETY_CHECKER: &str = "safety_checker";

/// A noise scheduler a pipeline can switch to.
pub trait Sampler: Send + Sync {
    fn name(&self) -> &str;
}

/// Samplers keyed by identifier, in the pipeline's preferred order.
pub type SamplerSet = Vec<(String, Arc<dyn Sampler>)>;

/// One constructor component a pipeline declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSlot {
    pub name: String,
    pub required: bool,
}

/// What a pipeline implementation accepts: components at construction,
/// named call arguments, and whether it takes engine options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineManifest {
    components: Vec<ComponentSlot>,
    arguments: BTreeSet<String>,
    accepts_options: bool,
}

impl PipelineManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a component the pipeline can't be built without.
    pub fn component(mut self, name: &str) -> Self {
        self.components.push(ComponentSlot {
            name: name.to_string(),
            required: true,
        });
        self
    }

    /// Declare a component the pipeline can run without.
    pub fn optional(mut self, name: &str) -> Self {
        self.components.push(ComponentSlot {
            name: name.to_string(),
            required: false,
        });
        self
    }

    pub fn arguments<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_options(mut self) -> Self {
        self.accepts_options = true;
        self
    }

    pub fn components(&self) -> &[ComponentSlot] {
        &self.components
    }

    pub fn declares(&self, component: &str) -> bool {
        self.components.iter().any(|c| c.name == component)
    }

    /// Required components other than the safety checker, which is always
    /// allowed to be absent.
    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.components
            .iter()
            .filter(|c| c.required && c.name != SAFETY_CHECKER)
            .map(|c| c.name.as_str())
    }

    pub fn accepts_argument(&self, name: &str) -> bool {
        self.arguments.contains(name)
    }

    pub fn accepts_options(&self) -> bool {
        self.accepts_options
    }
}

/// Progress callback: `(step, total_steps)`.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Per-step hooks handed to a running pipeline.
#[derive(Clone, Default)]
pub struct StepMonitor {
    progress: Option<ProgressFn>,
    stop: Option<Arc<AtomicBool>>,
}

impl fmt::Debug for StepMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepMonitor")
            .field("progress", &self.progress.is_some())
            .field("stop", &self.stop)
            .finish()
    }
}

impl StepMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .map(|s| s.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Call once before each step. Reports progress and returns false when
    /// the loop should end early. Stopping is not an error.
    pub fn tick(&self, step: usize, total: usize) -> bool {
        if self.stop_requested() {
            tracing::debug!(step, total, "Stop requested, ending generation early");
            return false;
        }
        if let Some(progress) = &self.progress {
            progress(step, total);
        }
        true
    }
}

/// Arguments for one pipeline invocation.
#[derive(Debug)]
pub struct PipelineCall {
    pub args: BTreeMap<String, Value>,
    /// One generator per requested seed. Empty means unseeded.
    pub generators: Vec<StdRng>,
    pub monitor: StepMonitor,
}

/// A constructed inference pipeline.
pub trait Pipeline: Send {
    fn manifest(&self) -> &PipelineManifest;

    /// Names of every sub-module the pipeline holds.
    fn module_names(&self) -> Vec<String>;

    fn module(&self, name: &str) -> Option<Component>;

    fn set_module(&mut self, name: &str, module: Component);

    fn samplers(&self) -> SamplerSet {
        Vec::new()
    }

    fn set_sampler(&mut self, _sampler: Arc<dyn Sampler>) {}

    fn prediction_type(&self) -> String {
        "epsilon".to_string()
    }

    fn set_slicing(&mut self, _enabled: bool) {}

    fn set_options(&mut self, _options: &Value) -> Result<(), PipelineError> {
        Ok(())
    }

    fn call(&mut self, call: PipelineCall) -> Result<Tensor, PipelineError>;
}

/// Builds one pipeline class.
pub trait PipelineFactory: Send + Sync {
    fn manifest(&self) -> PipelineManifest;

    /// `components` holds exactly the declared components that were
    /// available, plus a `None` safety checker when one was declared but
    /// not provided.
    fn build(&self, components: ModelSet) -> Result<Box<dyn Pipeline>, PipelineError>;
}

/// Host/device movement of modules.
pub trait ModuleTransfer: Send + Sync {
    /// Device-resident copy of `module`. A deferred copy is materialized
    /// on first use.
    fn to_device(
        &self,
        module: &Component,
        device: &ComputeDevice,
        deferred: bool,
    ) -> Result<Component, String>;

    /// Release cached memory on `device` after modules left it.
    fn reclaim(&self, _device: &ComputeDevice) {}

    /// Cap the share of device memory this process may use.
    fn set_memory_fraction(&self, _device: &ComputeDevice, _fraction: f64) {}
}

/// Transfer for host-only execution: clones are retagged, not moved.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostTransfer;

impl ModuleTransfer for HostTransfer {
    fn to_device(
        &self,
        module: &Component,
        device: &ComputeDevice,
        deferred: bool,
    ) -> Result<Component, String> {
        let placement = if deferred {
            Placement::Deferred(device.clone())
        } else {
            Placement::Device(device.clone())
        };
        Ok(Arc::new(Model::clone(module).with_placement(placement)))
    }
}
