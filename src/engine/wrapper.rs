// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Activation of assembled pipelines on a device.
//!
//! A [`PipelineWrapper`] starts inactive. `activate` swaps every
//! tensor-bearing module for a device copy and remembers the host originals;
//! `deactivate` puts the originals back and asks the transfer to reclaim
//! device memory.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use super::device::ComputeDevice;
use super::error::EngineError;
use super::mode::{DelayPolicy, EngineMode};
use super::pipeline::{ModuleTransfer, Pipeline, PipelineCall, SamplerSet, StepMonitor};
use crate::models::{Component, Tensor};
use crate::telemetry;

/// What a wrapper can be used for.
pub(crate) enum WrapperKind {
    Plain,
    Generate { samplers: SamplerSet },
}

pub struct PipelineWrapper {
    id: String,
    instance: Uuid,
    generation: u64,
    mode: EngineMode,
    pub(crate) kind: WrapperKind,
    pub(crate) pipeline: Box<dyn Pipeline>,
    transfer: Arc<dyn ModuleTransfer>,
    saved: Vec<(String, Component)>,
    device: Option<ComputeDevice>,
}

impl fmt::Debug for PipelineWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineWrapper")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("generation", &self.generation)
            .field("mode", &self.mode)
            .field("can_generate", &self.can_generate())
            .field("device", &self.device)
            .finish()
    }
}

impl PipelineWrapper {
    /// Wrapper for non-generation tasks. Never defers modules.
    pub fn plain(
        id: impl Into<String>,
        mode: EngineMode,
        pipeline: Box<dyn Pipeline>,
        transfer: Arc<dyn ModuleTransfer>,
    ) -> Self {
        Self {
            id: id.into(),
            instance: Uuid::new_v4(),
            generation: 0,
            mode,
            kind: WrapperKind::Plain,
            pipeline,
            transfer,
            saved: Vec::new(),
            device: None,
        }
    }

    /// Wrapper for image generation. Slicing follows the mode and the
    /// pipeline's samplers are captured now.
    pub fn for_generate(
        id: impl Into<String>,
        mode: EngineMode,
        mut pipeline: Box<dyn Pipeline>,
        transfer: Arc<dyn ModuleTransfer>,
    ) -> Self {
        pipeline.set_slicing(mode.attention_slice());
        let samplers = pipeline.samplers();
        let mut wrapper = Self::plain(id, mode, pipeline, transfer);
        wrapper.kind = WrapperKind::Generate { samplers };
        wrapper
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Model-set generation this pipeline was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn can_generate(&self) -> bool {
        matches!(self.kind, WrapperKind::Generate { .. })
    }

    pub fn is_active(&self) -> bool {
        self.device.is_some()
    }

    pub fn device(&self) -> Option<&ComputeDevice> {
        self.device.as_ref()
    }

    pub fn pipeline(&self) -> &dyn Pipeline {
        self.pipeline.as_ref()
    }

    /// Sampler identifiers available to `generate`, in preference order.
    pub fn sampler_names(&self) -> Vec<&str> {
        match &self.kind {
            WrapperKind::Generate { samplers } => samplers.iter().map(|(n, _)| n.as_str()).collect(),
            WrapperKind::Plain => Vec::new(),
        }
    }

    fn delay_policy(&self) -> DelayPolicy {
        match self.kind {
            WrapperKind::Plain => DelayPolicy::None,
            WrapperKind::Generate { .. } => self.mode.delay_policy(),
        }
    }

    /// Move the pipeline's modules onto `device`.
    ///
    /// If any transfer fails the modules already swapped are restored and
    /// the wrapper stays inactive.
    pub fn activate(&mut self, device: &ComputeDevice) -> Result<(), EngineError> {
        if let Some(current) = &self.device {
            return Err(EngineError::Activation(format!(
                "Pipeline {} is already active on {current}",
                self.id
            )));
        }

        let policy = self.delay_policy();
        let mut swapped: Vec<(String, Component)> = Vec::new();

        for name in self.pipeline.module_names() {
            let Some(module) = self.pipeline.module(&name) else {
                continue;
            };
            if !module.is_module() {
                continue;
            }

            let deferred = policy.defers(module.class_name());
            match self.transfer.to_device(&module, device, deferred) {
                Ok(on_device) => {
                    self.pipeline.set_module(&name, on_device);
                    swapped.push((name, module));
                }
                Err(reason) => {
                    for (name, original) in swapped.into_iter().rev() {
                        self.pipeline.set_module(&name, original);
                    }
                    self.transfer.reclaim(device);
                    return Err(EngineError::Transfer(format!(
                        "module {name} of {} to {device}: {reason}",
                        self.id
                    )));
                }
            }
        }

        tracing::debug!(
            engine = %self.id,
            instance = %self.instance,
            %device,
            modules = swapped.len(),
            ?policy,
            "Pipeline activated"
        );
        telemetry::record_activation(&self.id);
        self.saved = swapped;
        self.device = Some(device.clone());
        Ok(())
    }

    /// Restore host modules and release the device.
    pub fn deactivate(&mut self) -> Result<(), EngineError> {
        let Some(device) = self.device.take() else {
            return Err(EngineError::Activation(format!(
                "Pipeline {} is not active",
                self.id
            )));
        };

        for (name, original) in self.saved.drain(..) {
            self.pipeline.set_module(&name, original);
        }
        self.transfer.reclaim(&device);

        tracing::debug!(engine = %self.id, instance = %self.instance, %device, "Pipeline deactivated");
        Ok(())
    }

    /// Invoke a non-generation pipeline with raw arguments.
    pub fn run(
        &mut self,
        args: BTreeMap<String, Value>,
        monitor: StepMonitor,
    ) -> Result<Tensor, EngineError> {
        self.ensure_active()?;
        let call = PipelineCall {
            args,
            generators: Vec::new(),
            monitor,
        };
        Ok(self.pipeline.call(call)?)
    }

    pub(crate) fn ensure_active(&self) -> Result<(), EngineError> {
        if self.device.is_none() {
            return Err(EngineError::Activation(format!(
                "Pipeline {} must be activated before use",
                self.id
            )));
        }
        Ok(())
    }
}
