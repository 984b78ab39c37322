// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Image generation through an active pipeline wrapper.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::EngineError;
use super::pipeline::{PipelineCall, StepMonitor};
use super::wrapper::{PipelineWrapper, WrapperKind};
use crate::models::Tensor;
use crate::telemetry;

/// Arguments the wrapper always sets itself. They are never reported when a
/// pipeline doesn't take them.
const INTERNAL_ARGUMENTS: &[&str] = &["prediction_type", "output_type", "return_dict"];

/// Requested seeds: one per image, or one for the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seed {
    One(i64),
    Each(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateRequest {
    pub prompt: Vec<String>,
    pub negative_prompt: Option<Vec<String>>,
    pub num_images_per_prompt: u32,
    pub seed: Option<Seed>,
    pub height: u32,
    pub width: u32,
    pub guidance_scale: f64,
    pub clip_guidance_scale: Option<f64>,
    pub clip_guidance_base: Option<String>,
    pub sampler: Option<String>,
    pub eta: Option<f64>,
    pub churn: Option<f64>,
    pub churn_tmin: Option<f64>,
    pub churn_tmax: Option<f64>,
    pub sigma_min: Option<f64>,
    pub sigma_max: Option<f64>,
    pub karras_rho: Option<f64>,
    pub scheduler_noise_type: String,
    pub num_inference_steps: u32,
    pub init_image: Option<Value>,
    pub mask_image: Option<Value>,
    pub outmask_image: Option<Value>,
    pub depth_map: Option<Value>,
    pub strength: Option<f64>,
    pub lora: Option<Value>,
    pub hires_fix: Option<bool>,
    pub hires_oos_fraction: Option<f64>,
    pub tiling: bool,
    pub debug_latent_tags: Option<Value>,
    pub debug_latent_prefix: String,
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self {
            prompt: Vec::new(),
            negative_prompt: None,
            num_images_per_prompt: 1,
            seed: None,
            height: 512,
            width: 512,
            guidance_scale: 7.5,
            clip_guidance_scale: None,
            clip_guidance_base: None,
            sampler: None,
            eta: None,
            churn: None,
            churn_tmin: None,
            churn_tmax: None,
            sigma_min: None,
            sigma_max: None,
            karras_rho: None,
            scheduler_noise_type: "normal".to_string(),
            num_inference_steps: 50,
            init_image: None,
            mask_image: None,
            outmask_image: None,
            depth_map: None,
            strength: None,
            lora: None,
            hires_fix: None,
            hires_oos_fraction: None,
            tiling: false,
            debug_latent_tags: None,
            debug_latent_prefix: String::new(),
        }
    }
}

impl GenerateRequest {
    pub fn new<S: Into<String>>(prompts: impl IntoIterator<Item = S>) -> Self {
        Self {
            prompt: prompts.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Number of images the request produces.
    pub fn image_count(&self) -> usize {
        self.prompt.len() * self.num_images_per_prompt as usize
    }

    /// One generator per seed in a sequence, or one for a positive single
    /// seed. A sequence must hold exactly one seed per image.
    pub fn generators(&self) -> Result<Vec<StdRng>, EngineError> {
        match &self.seed {
            Some(Seed::Each(seeds)) => {
                let expected = self.image_count();
                if seeds.len() != expected {
                    return Err(EngineError::InvalidRequest(format!(
                        "expected {expected} seeds ({} prompts x {} images), got {}",
                        self.prompt.len(),
                        self.num_images_per_prompt,
                        seeds.len()
                    )));
                }
                Ok(seeds.iter().map(|s| StdRng::seed_from_u64(*s as u64)).collect())
            }
            Some(Seed::One(seed)) if *seed > 0 => Ok(vec![StdRng::seed_from_u64(*seed as u64)]),
            _ => Ok(Vec::new()),
        }
    }

    /// Every call argument with its default, in call order.
    fn arguments(&self, prediction_type: String) -> Vec<(&'static str, Value, Value)> {
        let d = Self::default();
        let negative = self.negative_prompt.clone().filter(|n| !n.is_empty());
        vec![
            arg("prompt", &self.prompt, &d.prompt),
            arg("negative_prompt", &negative, &d.negative_prompt),
            arg("num_images_per_prompt", self.num_images_per_prompt, d.num_images_per_prompt),
            arg("width", self.width, d.width),
            arg("height", self.height, d.height),
            arg("guidance_scale", self.guidance_scale, d.guidance_scale),
            arg("clip_guidance_scale", self.clip_guidance_scale, d.clip_guidance_scale),
            arg("clip_guidance_base", &self.clip_guidance_base, &d.clip_guidance_base),
            arg("prediction_type", prediction_type, Value::Null),
            arg("eta", self.eta, d.eta),
            arg("churn", self.churn, d.churn),
            arg("churn_tmin", self.churn_tmin, d.churn_tmin),
            arg("churn_tmax", self.churn_tmax, d.churn_tmax),
            arg("sigma_min", self.sigma_min, d.sigma_min),
            arg("sigma_max", self.sigma_max, d.sigma_max),
            arg("karras_rho", self.karras_rho, d.karras_rho),
            arg("scheduler_noise_type", &self.scheduler_noise_type, &d.scheduler_noise_type),
            arg("num_inference_steps", self.num_inference_steps, d.num_inference_steps),
            arg("init_image", &self.init_image, &d.init_image),
            arg("mask_image", &self.mask_image, &d.mask_image),
            arg("outmask_image", &self.outmask_image, &d.outmask_image),
            arg("depth_map", &self.depth_map, &d.depth_map),
            arg("strength", self.strength, d.strength),
            arg("lora", &self.lora, &d.lora),
            arg("hires_fix", self.hires_fix, d.hires_fix),
            arg("hires_oos_fraction", self.hires_oos_fraction, d.hires_oos_fraction),
            arg("tiling", self.tiling, d.tiling),
            arg("debug_latent_tags", &self.debug_latent_tags, &d.debug_latent_tags),
            arg("debug_latent_prefix", &self.debug_latent_prefix, &d.debug_latent_prefix),
            arg("output_type", "tensor", Value::Null),
            arg("return_dict", false, Value::Null),
        ]
    }
}

fn arg<V: Serialize, D: Serialize>(name: &'static str, value: V, default: D) -> (&'static str, Value, Value) {
    (
        name,
        serde_json::to_value(value).unwrap_or(Value::Null),
        serde_json::to_value(default).unwrap_or(Value::Null),
    )
}

/// Result of a generation.
#[derive(Debug)]
pub struct GenerationOutput {
    pub images: Tensor,
    /// Sampler the images were produced with.
    pub sampler: String,
    /// Arguments the pipeline couldn't take, as human readable notes.
    pub warnings: Vec<String>,
}

impl PipelineWrapper {
    /// Run a generation. The wrapper must be active.
    pub fn generate(
        &mut self,
        request: GenerateRequest,
        monitor: StepMonitor,
    ) -> Result<GenerationOutput, EngineError> {
        let WrapperKind::Generate { samplers } = &self.kind else {
            return Err(EngineError::Capability(format!(
                "Engine {} does not support generation",
                self.id()
            )));
        };
        self.ensure_active()?;

        let (sampler_name, sampler) = match &request.sampler {
            None => samplers.first(),
            Some(wanted) => samplers.iter().find(|(name, _)| name == wanted),
        }
        .map(|(name, sampler)| (name.clone(), sampler.clone()))
        .ok_or_else(|| {
            EngineError::UnknownSampler(request.sampler.clone().unwrap_or_else(|| "default".into()))
        })?;

        let mut generators = request.generators()?;
        let manifest = self.pipeline.manifest();

        let mut args = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut reject = |name: &str, value: &Value| {
            let warning = format!("Pipeline doesn't understand argument {name} (set to {value}) - ignoring");
            tracing::warn!(engine = %self.id(), argument = name, %value, "Pipeline doesn't understand argument, ignoring");
            warnings.push(warning);
        };

        for (name, value, default) in request.arguments(self.pipeline.prediction_type()) {
            if manifest.accepts_argument(name) {
                args.insert(name.to_string(), value);
            } else if value != default && !INTERNAL_ARGUMENTS.contains(&name) {
                reject(name, &value);
            }
        }
        if !generators.is_empty() && !manifest.accepts_argument("generator") {
            reject("generator", &serde_json::to_value(&request.seed).unwrap_or(Value::Null));
            generators.clear();
        }

        self.pipeline.set_sampler(sampler);
        tracing::debug!(
            engine = %self.id(),
            sampler = %sampler_name,
            images = request.image_count(),
            steps = request.num_inference_steps,
            "Generating"
        );

        let images = self.pipeline.call(PipelineCall {
            args,
            generators,
            monitor,
        })?;
        telemetry::record_generation(self.id());

        Ok(GenerationOutput {
            images,
            sampler: sampler_name,
            warnings,
        })
    }
}
