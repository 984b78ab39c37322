// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Writing loaded components back to disk, one folder per component.
//!
//! [`SafetensorsWriter`] stores a module's state dict as `model.safetensors`
//! next to its JSON config. [`SafetensorsFactory`] reads such folders back,
//! so saved pipelines load without the original checkpoint code.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use safetensors::tensor::{serialize, TensorView};
use safetensors::{Dtype, SafeTensors};
use serde_json::{json, Value};

use super::error::ModelError;
use super::factory::{
    default_library, ClassRef, ComponentFactory, ComponentFamily, ComponentRegistry, LoadMethod,
    LoadOptions, TYPE_CLASSES,
};
use super::model_set::Model;
use super::tensor::{DType, StateDict, Tensor};

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const CONFIG_FILE: &str = "config.json";

/// Writes one component into a folder.
pub trait ModelWriter: Send + Sync {
    /// Write `model` into `dir`, creating the folder if needed.
    fn write(&self, model: &Model, dir: &Path) -> Result<(), ModelError>;
}

/// Config file a component's settings are stored in, by class name.
pub fn config_file_name(class_name: &str) -> &'static str {
    if class_name.ends_with("Scheduler") {
        "scheduler_config.json"
    } else if class_name.ends_with("Tokenizer") {
        "tokenizer_config.json"
    } else if class_name.ends_with("FeatureExtractor") || class_name.ends_with("ImageProcessor") {
        "preprocessor_config.json"
    } else {
        CONFIG_FILE
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SafetensorsWriter;

impl ModelWriter for SafetensorsWriter {
    fn write(&self, model: &Model, dir: &Path) -> Result<(), ModelError> {
        std::fs::create_dir_all(dir)?;

        if let Some(weights) = model.state_dict() {
            std::fs::write(dir.join(WEIGHTS_FILE), serialize_state_dict(weights)?)?;
        }
        if !model.config().is_null() {
            let raw = serde_json::to_string_pretty(model.config())
                .map_err(|e| ModelError::Checkpoint(format!("config of {}: {e}", model.class_name())))?;
            std::fs::write(dir.join(config_file_name(model.class_name())), raw)?;
        }

        tracing::debug!(class = model.class_name(), path = %dir.display(), "Wrote component");
        Ok(())
    }
}

/// Encode a state dict in safetensors format. Half-precision tensors are
/// stored as F16.
pub fn serialize_state_dict(weights: &StateDict) -> Result<Vec<u8>, ModelError> {
    let buffers: Vec<(&str, &Tensor, Vec<u8>)> = weights
        .iter()
        .map(|(name, tensor)| {
            let bytes = match tensor.dtype() {
                DType::F32 => tensor.data().iter().flat_map(|v| v.to_le_bytes()).collect(),
                DType::F16 => tensor
                    .data()
                    .iter()
                    .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
                    .collect(),
            };
            (name.as_str(), tensor, bytes)
        })
        .collect();

    let mut views = Vec::with_capacity(buffers.len());
    for (name, tensor, bytes) in &buffers {
        let dtype = match tensor.dtype() {
            DType::F32 => Dtype::F32,
            DType::F16 => Dtype::F16,
        };
        let view = TensorView::new(dtype, tensor.shape().to_vec(), bytes)
            .map_err(|e| ModelError::Checkpoint(format!("safetensors view for {name}: {e}")))?;
        views.push((*name, view));
    }

    let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
    serialize(views, &metadata)
        .map_err(|e| ModelError::Checkpoint(format!("safetensors serialize error: {e}")))
}

/// Decode a safetensors buffer into a state dict.
pub fn deserialize_state_dict(buffer: &[u8]) -> Result<StateDict, ModelError> {
    let tensors = SafeTensors::deserialize(buffer)
        .map_err(|e| ModelError::Checkpoint(format!("safetensors parse error: {e}")))?;

    let mut weights = StateDict::new();
    for (name, view) in tensors.tensors() {
        let bytes = view.data();
        let (data, is_half): (Vec<f32>, bool) = match view.dtype() {
            Dtype::F32 => (
                bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
                false,
            ),
            Dtype::F16 => (
                bytes
                    .chunks_exact(2)
                    .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                    .collect(),
                true,
            ),
            Dtype::BF16 => (
                bytes
                    .chunks_exact(2)
                    .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
                    .collect(),
                false,
            ),
            other => {
                return Err(ModelError::Checkpoint(format!(
                    "{name} has unsupported dtype {other:?}"
                )))
            }
        };
        let tensor = Tensor::new(view.shape().to_vec(), data)?;
        weights.insert(name, if is_half { tensor.to_f16() } else { tensor });
    }
    Ok(weights)
}

/// Loads a tensor module from every `*.safetensors` file in its folder plus
/// its `config.json`.
#[derive(Debug, Clone)]
pub struct SafetensorsFactory {
    class_name: String,
    family: ComponentFamily,
}

impl SafetensorsFactory {
    pub fn new(class_name: impl Into<String>, family: ComponentFamily) -> Self {
        Self {
            class_name: class_name.into(),
            family,
        }
    }
}

impl ComponentFactory for SafetensorsFactory {
    fn family(&self) -> ComponentFamily {
        self.family
    }

    fn load(&self, _: LoadMethod, path: &Path, options: LoadOptions) -> Result<Model, ModelError> {
        let mut files = Vec::new();
        if path.is_dir() {
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".safetensors") && entry.file_type()?.is_file() {
                    files.push(entry.path());
                }
            }
        }
        if files.is_empty() {
            return Err(ModelError::MissingWeights(format!(
                "No .safetensors weights in {}",
                path.display()
            )));
        }
        files.sort();

        let mut weights = StateDict::new();
        for file in &files {
            weights.extend(deserialize_state_dict(&std::fs::read(file)?)?);
        }

        let config_path = path.join(CONFIG_FILE);
        let config = if config_path.is_file() {
            let raw = std::fs::read_to_string(&config_path)?;
            serde_json::from_str(&raw).map_err(|e| ModelError::Manifest {
                path: config_path.clone(),
                reason: e.to_string(),
            })?
        } else {
            Value::Null
        };

        let model = Model::new(self.class_name.clone())
            .with_weights(weights)
            .with_config(config);
        Ok(if options.fp16 { model.to_f16() } else { model })
    }
}

/// Default registry plus safetensors loaders for every default module class.
pub fn safetensors_components() -> ComponentRegistry {
    let mut registry = ComponentRegistry::with_defaults();
    for (_, class) in TYPE_CLASSES {
        let class_ref = ClassRef::parse(class);
        if registry.resolve(&class_ref).is_ok() {
            continue;
        }
        let Some(library) = class_ref
            .library
            .as_deref()
            .or_else(|| default_library(&class_ref.class))
        else {
            continue;
        };
        let family = match library {
            "diffusers" => ComponentFamily::Diffusers,
            "transformers" => ComponentFamily::Transformers,
            _ => ComponentFamily::Module,
        };
        registry.register(
            &format!("{library}.{}", class_ref.class),
            Arc::new(SafetensorsFactory::new(class_ref.class.clone(), family)),
        );
    }
    registry
}

/// Config corrections applied to pipeline components before they are saved.
///
/// Schedulers get `steps_offset = 1` and unets a `sample_size` of at least
/// 64. Returns `None` when nothing needs changing.
pub fn fix_component_config(name: &str, model: &Model) -> Option<Model> {
    match name {
        "scheduler" => patch_config(model, "steps_offset", |v| v.as_i64() != Some(1), json!(1)),
        "unet" => patch_config(
            model,
            "sample_size",
            |v| v.as_f64().is_some_and(|size| size < 64.0),
            json!(64),
        ),
        _ => None,
    }
}

fn patch_config<F>(model: &Model, key: &str, needs_fix: F, value: Value) -> Option<Model>
where
    F: Fn(&Value) -> bool,
{
    let config = model.config().as_object()?;
    if !needs_fix(config.get(key)?) {
        return None;
    }

    tracing::info!(source = model.source(), key, %value, "Fixing component config");
    let mut config = config.clone();
    config.insert(key.to_string(), value);
    Some(model.clone().with_config(Value::Object(config)))
}
