// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Turns a resolved weight directory into a model set.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use super::descriptor::{ConfigDescriptor, Fp16Policy};
use super::error::ModelError;
use super::factory::{
    default_class, CheckpointDecoder, CheckpointKind, CheckpointRequest, ClassRef,
    ComponentRegistry, LoadMethod, LoadOptions,
};
use super::model_set::{Component, ModelSet};
use super::patterns::filter_repo_objects;

/// Manifest naming one component per pipeline slot.
pub const MODEL_INDEX: &str = "model_index.json";

/// What to do with a pipeline's `safety_checker` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SafetyPolicy {
    /// Load the declared checker.
    #[default]
    Block,
    /// Load a checker that only flags results.
    Flag,
    /// Leave the slot empty.
    Ignore,
}

impl SafetyPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "block" => Some(Self::Block),
            "flag" => Some(Self::Flag),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }
}

pub struct ModelLoader {
    components: Arc<ComponentRegistry>,
    checkpoints: Option<Arc<dyn CheckpointDecoder>>,
    safety: SafetyPolicy,
    fp16_mode: bool,
}

impl ModelLoader {
    pub fn new(components: Arc<ComponentRegistry>, safety: SafetyPolicy, fp16_mode: bool) -> Self {
        Self {
            components,
            checkpoints: None,
            safety,
            fp16_mode,
        }
    }

    pub fn with_checkpoint_decoder(mut self, decoder: Arc<dyn CheckpointDecoder>) -> Self {
        self.checkpoints = Some(decoder);
        self
    }

    /// Load everything `desc` describes from `weight_path`.
    pub fn load_from_weights(
        &self,
        desc: &ConfigDescriptor,
        weight_path: &Path,
    ) -> Result<ModelSet, ModelError> {
        let fp16 = match desc.fp16()? {
            Fp16Policy::Prevent => Some(false),
            _ => None,
        };
        let kind = desc.kind();

        if kind == "pipeline" {
            return self.load_pipeline_set(weight_path, &desc.whitelist(), &desc.blacklist(), fp16);
        }

        if let Some(config) = desc.checkpoint_format() {
            return self.load_checkpoint_set(weight_path, config, desc, fp16);
        }

        let mut set = ModelSet::new();
        if kind == "clip" {
            // Same weights, two components.
            for name in ["clip_model", "feature_extractor"] {
                let model = self.load_component(weight_path, name, None, fp16)?;
                set.insert(name, Some(model));
            }
        } else {
            let class = desc.get("class").and_then(Value::as_str).map(ClassRef::parse);
            let model = self.load_component(weight_path, &kind, class, fp16)?;
            set.insert(kind, Some(model));
        }
        Ok(set)
    }

    /// Load one component named `name`, descending into `weight_path/name`
    /// when that directory exists.
    pub fn load_component(
        &self,
        weight_path: &Path,
        name: &str,
        class: Option<ClassRef>,
        fp16: Option<bool>,
    ) -> Result<Component, ModelError> {
        let class = match class {
            Some(class) => class,
            None => default_class(name).map(ClassRef::parse).ok_or_else(|| {
                ModelError::UnknownClass(format!(
                    "Type {name} does not specify a class, and there is no default set for it."
                ))
            })?,
        };
        let fp16 = fp16.unwrap_or(self.fp16_mode);

        let factory = self.components.resolve(&class)?;
        let method = [LoadMethod::FromPretrained, LoadMethod::FromConfig]
            .into_iter()
            .find(|m| factory.load_methods().contains(m))
            .ok_or_else(|| {
                ModelError::Capability(format!("{class} supports no load method"))
            })?;

        let family = factory.family();
        let options = LoadOptions {
            fp16: fp16 && family.is_module(),
            low_mem: family.supports_low_mem(),
        };

        let sub_path = weight_path.join(name);
        let path = if sub_path.is_dir() {
            sub_path
        } else {
            weight_path.to_path_buf()
        };

        tracing::debug!(component = name, class = %class, path = %path.display(), "Loading component");
        let model = factory
            .load(method, &path, options)?
            .with_source(path.display().to_string());
        Ok(Arc::new(model))
    }

    /// Load every slot declared in `model_index.json`.
    pub fn load_pipeline_set(
        &self,
        weight_path: &Path,
        whitelist: &[String],
        blacklist: &[String],
        fp16: Option<bool>,
    ) -> Result<ModelSet, ModelError> {
        let index_path = weight_path.join(MODEL_INDEX);
        if !index_path.is_file() {
            return Err(ModelError::MissingWeights(format!(
                "{} not found",
                index_path.display()
            )));
        }

        let raw = std::fs::read_to_string(&index_path)?;
        let index: serde_json::Map<String, Value> =
            serde_json::from_str(&raw).map_err(|e| ModelError::Manifest {
                path: index_path.clone(),
                reason: e.to_string(),
            })?;

        let mut set = ModelSet::new();
        for (name, entry) in &index {
            let Value::Array(parts) = entry else {
                continue;
            };
            if !whitelist.is_empty() && !whitelist.contains(name) {
                continue;
            }
            if blacklist.contains(name) {
                continue;
            }

            let library = parts.first().and_then(Value::as_str).unwrap_or_default();
            let Some(class) = parts.get(1).and_then(Value::as_str) else {
                set.insert(name.clone(), None);
                continue;
            };
            let mut class_ref = ClassRef::new(library, class);

            if name == "safety_checker" {
                match self.safety {
                    SafetyPolicy::Block => {}
                    SafetyPolicy::Flag => {
                        class_ref = ClassRef::parse("gyre.pipeline.safety_checkers.FlagOnlySafetyChecker")
                    }
                    SafetyPolicy::Ignore => {
                        set.insert(name.clone(), None);
                        continue;
                    }
                }
            }

            let model = self.load_component(weight_path, name, Some(class_ref), fp16)?;
            set.insert(name.clone(), Some(model));
        }

        Ok(set)
    }

    /// Load a single-file checkpoint through the checkpoint decoder.
    pub fn load_checkpoint_set(
        &self,
        weight_path: &Path,
        config: String,
        desc: &ConfigDescriptor,
        fp16: Option<bool>,
    ) -> Result<ModelSet, ModelError> {
        let mut safetensors = Vec::new();
        let mut legacy = Vec::new();
        for entry in std::fs::read_dir(weight_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".safetensors") {
                safetensors.push(name);
            } else if name.ends_with(".ckpt") || name.ends_with(".pt") {
                legacy.push(name);
            }
        }
        safetensors.sort();
        legacy.sort();

        let safetensors =
            filter_repo_objects(&safetensors, &desc.allow_patterns(), &desc.ignore_patterns());

        let (file, kind) = if !safetensors.is_empty() {
            if safetensors.len() > 1 {
                return Err(ModelError::Checkpoint(format!(
                    "Folder contained {} .safetensors files, there must be at most one.",
                    safetensors.len()
                )));
            }
            (safetensors[0].clone(), CheckpointKind::Safetensors)
        } else if !legacy.is_empty() {
            if legacy.len() > 1 {
                return Err(ModelError::Checkpoint(format!(
                    "Folder contained {} .ckpt files, there must be at most one.",
                    legacy.len()
                )));
            }
            (legacy[0].clone(), CheckpointKind::Legacy)
        } else {
            return Err(ModelError::Checkpoint(
                "Folder did not contain a .safetensors or .ckpt file.".into(),
            ));
        };

        let decoder = self.checkpoints.as_ref().ok_or_else(|| {
            ModelError::Capability("no checkpoint decoder is registered".into())
        })?;

        let request = CheckpointRequest {
            config,
            path: weight_path.join(&file),
            kind,
            whitelist: desc.whitelist(),
            blacklist: desc.blacklist(),
            fp16: fp16.unwrap_or(self.fp16_mode),
        };
        let decoded = decoder.decode(&request)?;

        let source = format!("Ckpt {file}");
        Ok(decoded
            .iter()
            .map(|(name, model)| {
                let stamped = model.map(|m| Arc::new((**m).clone().with_source(source.clone())));
                (name.to_string(), stamped)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::factory::{ComponentFactory, ComponentFamily};
    use crate::models::model_set::Model;
    use crate::models::tensor::{StateDict, Tensor};
    use parking_lot::Mutex;
    use serde_json::json;

    /// Records the options every load was made with.
    struct Recording {
        family: ComponentFamily,
        calls: Mutex<Vec<(String, LoadOptions)>>,
    }

    impl Recording {
        fn new(family: ComponentFamily) -> Arc<Self> {
            Arc::new(Self {
                family,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl ComponentFactory for Recording {
        fn family(&self) -> ComponentFamily {
            self.family
        }

        fn load(&self, _: LoadMethod, path: &Path, options: LoadOptions) -> Result<Model, ModelError> {
            self.calls
                .lock()
                .push((path.display().to_string(), options));
            let mut weights = StateDict::new();
            weights.insert("w".into(), Tensor::zeros(vec![1, 1]));
            Ok(Model::new("Recorded").with_weights(weights))
        }
    }

    fn write_index(dir: &Path, index: Value) {
        std::fs::write(dir.join(MODEL_INDEX), index.to_string()).unwrap();
    }

    #[test]
    fn test_pipeline_slots_and_safety_policy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("unet")).unwrap();
        write_index(
            dir.path(),
            json!({
                "_class_name": "StableDiffusionPipeline",
                "unet": ["diffusers", "UNet2DConditionModel"],
                "safety_checker": ["stable_diffusion", "StableDiffusionSafetyChecker"],
                "feature_extractor": ["transformers", null]
            }),
        );

        let unet = Recording::new(ComponentFamily::Diffusers);
        let mut registry = ComponentRegistry::with_defaults();
        registry.register("diffusers.UNet2DConditionModel", unet.clone());

        let loader = ModelLoader::new(Arc::new(registry), SafetyPolicy::Ignore, true);
        let set = loader.load_pipeline_set(dir.path(), &[], &[], None).unwrap();

        assert_eq!(set.len(), 3);
        assert!(set.contains("safety_checker") && set.get("safety_checker").is_none());
        assert!(set.contains("feature_extractor") && set.get("feature_extractor").is_none());

        let unet_model = set.get("unet").unwrap();
        assert!(unet_model.source().ends_with("unet"));
        let calls = unet.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, LoadOptions { fp16: true, low_mem: true });
    }

    #[test]
    fn test_prevent_forces_fp32() {
        let dir = tempfile::tempdir().unwrap();
        let vae = Recording::new(ComponentFamily::Module);
        let mut registry = ComponentRegistry::new();
        registry.register("diffusers.AutoencoderKL", vae.clone());

        let loader = ModelLoader::new(Arc::new(registry), SafetyPolicy::Block, true);
        let desc = ConfigDescriptor::from_value(json!({
            "model_id": "v", "type": "vae", "fp16": "prevent"
        }))
        .unwrap();
        let set = loader.load_from_weights(&desc, dir.path()).unwrap();

        assert!(set.get("vae").is_some());
        assert_eq!(vae.calls.lock()[0].1, LoadOptions { fp16: false, low_mem: false });
    }

    #[test]
    fn test_missing_index_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ModelLoader::new(Arc::new(ComponentRegistry::new()), SafetyPolicy::Block, false);
        let err = loader.load_pipeline_set(dir.path(), &[], &[], None).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_checkpoint_requires_single_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ckpt"), b"x").unwrap();
        std::fs::write(dir.path().join("b.pt"), b"x").unwrap();

        let loader = ModelLoader::new(Arc::new(ComponentRegistry::new()), SafetyPolicy::Block, false);
        let desc = ConfigDescriptor::from_value(json!({"model_id": "c", "type": "ckpt/v1"})).unwrap();
        let err = loader.load_from_weights(&desc, dir.path()).unwrap_err();
        assert!(err.to_string().contains("Folder contained 2 .ckpt files"));
    }
}
