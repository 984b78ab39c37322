// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Pipeline assembly: turn a loaded model set into a pipeline object.

use std::collections::HashMap;
use std::sync::Arc;

use super::error::EngineError;
use super::pipeline::{Pipeline, PipelineFactory, SAFETY_CHECKER};
use crate::models::{ConfigDescriptor, ModelError, ModelSet};
use crate::telemetry;

/// Pipeline factories keyed by class name.
#[derive(Default, Clone)]
pub struct PipelineCatalog {
    factories: HashMap<String, Arc<dyn PipelineFactory>>,
}

impl PipelineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class_name: &str, factory: Arc<dyn PipelineFactory>) {
        self.factories.insert(class_name.to_string(), factory);
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }

    pub fn get(&self, class_name: &str) -> Result<&Arc<dyn PipelineFactory>, EngineError> {
        self.factories
            .get(class_name)
            .ok_or_else(|| ModelError::UnknownClass(class_name.to_string()).into())
    }

    /// Build the pipeline for `desc` from its loaded `models`.
    ///
    /// Only components the pipeline declares are passed on. A declared
    /// safety checker that was not provided is passed as an empty slot.
    pub fn assemble(
        &self,
        desc: &ConfigDescriptor,
        models: &ModelSet,
    ) -> Result<Box<dyn Pipeline>, EngineError> {
        let class_name = desc
            .class_name()
            .ok_or_else(|| ModelError::Config(format!("{} is not a pipeline", desc.human_id())))?;
        let factory = self.get(&class_name)?;
        let manifest = factory.manifest();

        let mut missing: Vec<&str> = manifest
            .required()
            .filter(|name| models.get(name).is_none())
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(EngineError::Capability(format!(
                "Model definition did not provide model(s) the pipeline requires. Missing: {}",
                missing.join(", ")
            )));
        }

        let mut components: ModelSet = models
            .iter()
            .filter(|(name, _)| manifest.declares(name))
            .map(|(name, component)| (name.to_string(), component.cloned()))
            .collect();
        if manifest.declares(SAFETY_CHECKER) && !components.contains(SAFETY_CHECKER) {
            components.insert(SAFETY_CHECKER, None);
        }

        let unused: Vec<&str> = models.keys().filter(|k| !manifest.declares(k)).collect();
        if !unused.is_empty() {
            tracing::debug!(engine = %desc.human_id(), ?unused, "Pipeline does not take components");
        }

        let mut pipeline = factory.build(components)?;

        if let Some(options) = desc.options() {
            let id = desc.human_id();
            if !manifest.accepts_options() {
                return Err(options_rejected(desc));
            }
            pipeline.set_options(options).map_err(|e| {
                tracing::warn!(engine = %id, error = %e, "Pipeline rejected options");
                options_rejected(desc)
            })?;
        }

        telemetry::record_pipeline_built(&desc.human_id());
        tracing::info!(engine = %desc.human_id(), class = %class_name, "Pipeline assembled");
        Ok(pipeline)
    }
}

fn options_rejected(desc: &ConfigDescriptor) -> EngineError {
    EngineError::Capability(format!(
        "Engine {} has options, but created pipeline rejected them",
        desc.id().unwrap_or_default()
    ))
}
