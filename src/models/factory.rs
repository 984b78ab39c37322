// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Component implementation registry.
//!
//! Component classes are named by `library.Class` references in manifests and
//! descriptors. The registry maps those names to [`ComponentFactory`]
//! implementations registered at startup.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use super::error::ModelError;
use super::model_set::{Model, ModelSet};

/// Library for bare class names.
pub const DEFAULT_LIBRARIES: &[(&str, &str)] = &[
    ("StableDiffusionPipeline", "stable_diffusion"),
    ("UnifiedPipeline", "gyre.pipeline.unified_pipeline"),
    ("UpscalerPipeline", "gyre.pipeline.upscaler_pipeline"),
    ("DiffusersDepthPipeline", "gyre.pipeline.depth.diffusers_depth_pipeline"),
    ("MidasDepthPipeline", "gyre.pipeline.depth.midas_depth_pipeline"),
    ("MidasModelWrapper", "gyre.pipeline.depth.midas_model_wrapper"),
];

/// Default class for each component kind.
pub const TYPE_CLASSES: &[(&str, &str)] = &[
    ("vae", "diffusers.AutoencoderKL"),
    ("unet", "diffusers.UNet2DConditionModel"),
    ("inpaint_unet", "diffusers.UNet2DConditionModel"),
    ("clip_model", "transformers.CLIPModel"),
    ("feature_extractor", "transformers.CLIPFeatureExtractor"),
    ("tokenizer", "transformers.CLIPTokenizer"),
    ("clip_tokenizer", "transformers.CLIPTokenizer"),
    ("text_encoder", "transformers.CLIPTextModel"),
    ("inpaint_text_encoder", "transformers.CLIPTextModel"),
    (
        "upscaler",
        "gyre.pipeline.upscaler_pipeline.NoiseLevelAndTextConditionedUpscaler",
    ),
    ("depth_estimator", "transformers.DPTForDepthEstimation"),
    ("midas_depth_estimator", "MidasModelWrapper"),
];

/// Pipeline sub-namespaces that resolve before plain libraries.
pub const PIPELINE_NAMESPACES: &[&str] = &["stable_diffusion"];

pub fn default_library(class_name: &str) -> Option<&'static str> {
    DEFAULT_LIBRARIES
        .iter()
        .find(|(class, _)| *class == class_name)
        .map(|(_, lib)| *lib)
}

pub fn default_class(kind: &str) -> Option<&'static str> {
    TYPE_CLASSES
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, class)| *class)
}

/// A `library.Class` reference; the library may be left for the default
/// table to fill in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassRef {
    pub library: Option<String>,
    pub class: String,
}

impl ClassRef {
    pub fn new(library: impl Into<String>, class: impl Into<String>) -> Self {
        let library = library.into();
        Self {
            library: if library.is_empty() { None } else { Some(library) },
            class: class.into(),
        }
    }

    /// Split a dotted name at its last `.`.
    pub fn parse(name: &str) -> Self {
        match name.rsplit_once('.') {
            Some((library, class)) => Self::new(library, class),
            None => Self {
                library: None,
                class: name.to_string(),
            },
        }
    }
}

impl fmt::Display for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.library {
            Some(lib) => write!(f, "{lib}.{}", self.class),
            None => write!(f, "{}", self.class),
        }
    }
}

/// Broad implementation family, which decides the load options that apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentFamily {
    /// Diffusers model (tensor module, supports low-memory loading).
    Diffusers,
    /// Transformers model (tensor module, supports low-memory loading).
    Transformers,
    /// Other tensor module.
    Module,
    /// Tokenizers, schedulers, feature extractors.
    Plain,
}

impl ComponentFamily {
    pub fn is_module(&self) -> bool {
        !matches!(self, ComponentFamily::Plain)
    }

    pub fn supports_low_mem(&self) -> bool {
        matches!(self, ComponentFamily::Diffusers | ComponentFamily::Transformers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMethod {
    FromPretrained,
    FromConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadOptions {
    pub fp16: bool,
    pub low_mem: bool,
}

/// Builds one component class from a weight directory.
pub trait ComponentFactory: Send + Sync {
    fn family(&self) -> ComponentFamily;

    /// Supported load methods. The loader uses the first of
    /// `FromPretrained`, `FromConfig` that appears here.
    fn load_methods(&self) -> &[LoadMethod] {
        &[LoadMethod::FromPretrained]
    }

    fn load(&self, method: LoadMethod, path: &Path, options: LoadOptions) -> Result<Model, ModelError>;
}

/// Which kind of single-file checkpoint was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Safetensors,
    Legacy,
}

#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    /// The `<format>` part of a `ckpt/<format>` type.
    pub config: String,
    pub path: PathBuf,
    pub kind: CheckpointKind,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub fp16: bool,
}

/// Decodes single-file checkpoints into a model set.
pub trait CheckpointDecoder: Send + Sync {
    fn decode(&self, request: &CheckpointRequest) -> Result<ModelSet, ModelError>;
}

/// Loads non-tensor components by reading their JSON config file.
#[derive(Debug, Clone)]
pub struct ConfigOnlyFactory {
    class_name: String,
    config_file: &'static str,
}

impl ConfigOnlyFactory {
    pub fn new(class_name: impl Into<String>, config_file: &'static str) -> Self {
        Self {
            class_name: class_name.into(),
            config_file,
        }
    }
}

impl ComponentFactory for ConfigOnlyFactory {
    fn family(&self) -> ComponentFamily {
        ComponentFamily::Plain
    }

    fn load_methods(&self) -> &[LoadMethod] {
        &[LoadMethod::FromPretrained, LoadMethod::FromConfig]
    }

    fn load(&self, _: LoadMethod, path: &Path, _: LoadOptions) -> Result<Model, ModelError> {
        if !path.is_dir() {
            return Err(ModelError::MissingWeights(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let file = path.join(self.config_file);
        let config = if file.is_file() {
            let raw = std::fs::read_to_string(&file)?;
            serde_json::from_str(&raw).map_err(|e| ModelError::Manifest {
                path: file.clone(),
                reason: e.to_string(),
            })?
        } else {
            Value::Null
        };

        Ok(Model::new(self.class_name.clone()).with_config(config))
    }
}

/// Class reference → factory lookup, populated at startup.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    pipeline_classes: HashMap<(String, String), Arc<dyn ComponentFactory>>,
    classes: HashMap<String, Arc<dyn ComponentFactory>>,
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.classes.keys().collect();
        names.sort();
        f.debug_struct("ComponentRegistry")
            .field("classes", &names)
            .field("pipeline_classes", &self.pipeline_classes.len())
            .finish()
    }
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the config-only tokenizer, scheduler and
    /// feature-extractor classes.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (class, file) in [
            ("transformers.CLIPTokenizer", "tokenizer_config.json"),
            ("transformers.CLIPFeatureExtractor", "preprocessor_config.json"),
            ("diffusers.PNDMScheduler", "scheduler_config.json"),
            ("diffusers.DDIMScheduler", "scheduler_config.json"),
            ("diffusers.LMSDiscreteScheduler", "scheduler_config.json"),
            ("diffusers.EulerDiscreteScheduler", "scheduler_config.json"),
            ("diffusers.DPMSolverMultistepScheduler", "scheduler_config.json"),
        ] {
            let class_ref = ClassRef::parse(class);
            registry.register(class, Arc::new(ConfigOnlyFactory::new(class_ref.class, file)));
        }
        registry
    }

    /// Register a factory under its full `library.Class` name.
    pub fn register(&mut self, name: &str, factory: Arc<dyn ComponentFactory>) {
        self.classes.insert(name.to_string(), factory);
    }

    /// Register a factory inside a pipeline sub-namespace.
    pub fn register_pipeline_class(
        &mut self,
        namespace: &str,
        class: &str,
        factory: Arc<dyn ComponentFactory>,
    ) {
        self.pipeline_classes
            .insert((namespace.to_string(), class.to_string()), factory);
    }

    pub fn resolve(&self, class_ref: &ClassRef) -> Result<Arc<dyn ComponentFactory>, ModelError> {
        let library = match &class_ref.library {
            Some(lib) => lib.as_str(),
            None => default_library(&class_ref.class).ok_or_else(|| {
                ModelError::UnknownClass(format!(
                    "Don't know the library name for class {}",
                    class_ref.class
                ))
            })?,
        };

        if PIPELINE_NAMESPACES.contains(&library) {
            return self
                .pipeline_classes
                .get(&(library.to_string(), class_ref.class.clone()))
                .cloned()
                .ok_or_else(|| {
                    ModelError::UnknownClass(format!(
                        "Pipeline namespace {library} has no class {}",
                        class_ref.class
                    ))
                });
        }

        let full = format!("{library}.{}", class_ref.class);
        if let Some(factory) = self.classes.get(&full) {
            return Ok(factory.clone());
        }

        // Older configs name the feature extractor by its newer class name.
        if library == "transformers" && class_ref.class == "CLIPImageProcessor" {
            if let Some(factory) = self.classes.get("transformers.CLIPFeatureExtractor") {
                return Ok(factory.clone());
            }
        }

        Err(ModelError::UnknownClass(format!(
            "Config attempts to import {full} that doesn't appear to exist"
        )))
    }
}
