// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Parameter blending across models with the same structure.
//!
//! Tensors are mixed key by key. Inputs must share shapes, except that an
//! inpaint-style first input may be wider on dim 1 than the rest; only the
//! overlapping leading slice is blended in that case.

use std::sync::Arc;

use serde_json::Value;

use super::descriptor::ConfigDescriptor;
use super::error::ModelError;
use super::model_set::{Component, LoadedModel, ModelSet};
use super::tensor::{StateDict, Tensor};

pub const DEFAULT_ALPHA: f32 = 0.5;

/// Per-element blend function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixMethod {
    WeightedSum,
    /// Smoothstep-weighted interpolation.
    #[default]
    Sigmoid,
    /// Inverse smoothstep-weighted interpolation.
    InvSigmoid,
    /// Add the difference between the second input and a base to the first.
    Difference,
}

impl MixMethod {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "weighted_sum" => Some(Self::WeightedSum),
            "sigmoid" => Some(Self::Sigmoid),
            "inv_sigmoid" => Some(Self::InvSigmoid),
            "difference" => Some(Self::Difference),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::WeightedSum => "weighted_sum",
            Self::Sigmoid => "sigmoid",
            Self::InvSigmoid => "inv_sigmoid",
            Self::Difference => "difference",
        }
    }

    /// Number of tensors the blend consumes.
    pub fn arity(&self) -> usize {
        match self {
            Self::Difference => 3,
            _ => 2,
        }
    }

    /// The blend for a fixed `alpha`, with the alpha transform hoisted out of
    /// the per-element path.
    pub fn blender(&self, alpha: f32) -> impl Fn(f32, &[f32]) -> f32 {
        let method = *self;
        let k = match method {
            Self::WeightedSum => alpha,
            Self::Sigmoid => alpha * alpha * (3.0 - 2.0 * alpha),
            Self::InvSigmoid => 0.5 - ((1.0 - 2.0 * alpha).asin() / 3.0).sin(),
            Self::Difference => 1.0 - alpha,
        };

        move |a: f32, rest: &[f32]| match method {
            Self::WeightedSum => (1.0 - k) * a + k * rest[0],
            Self::Sigmoid | Self::InvSigmoid => a + (rest[0] - a) * k,
            Self::Difference => a + (rest[0] - rest[1]) * k,
        }
    }
}

/// Parsed `type: mix` descriptor.
#[derive(Debug, Clone)]
pub struct MixSpec {
    pub method: MixMethod,
    pub alpha: f32,
    pub inputs: Vec<ConfigDescriptor>,
    pub base: Option<ConfigDescriptor>,
}

impl MixSpec {
    pub fn from_descriptor(desc: &ConfigDescriptor) -> Result<Self, ModelError> {
        let mix = desc.mix();
        let field = |key: &str| mix.and_then(|m| m.get(key));

        let mut alpha = match field("alpha") {
            Some(v) => parse_alpha(v)?,
            None => DEFAULT_ALPHA,
        };
        if let Some(v) = desc.get("alpha") {
            tracing::warn!(
                name = %desc.human_id(),
                "Deprecation notice: alpha should be part of the mix dictionary"
            );
            alpha = parse_alpha(v)?;
        }

        let method = match field("type") {
            None => MixMethod::default(),
            Some(v) => v.as_str().and_then(MixMethod::parse).ok_or_else(|| {
                ModelError::Config(
                    "mix.type must be one of weighted_sum, sigmoid, inv_sigmoid, difference".into(),
                )
            })?,
        };
        if method == MixMethod::InvSigmoid && !(0.0..=1.0).contains(&alpha) {
            return Err(ModelError::Config(format!(
                "{}: inv_sigmoid mix alpha must be between 0 and 1, got {alpha}",
                desc.human_id()
            )));
        }

        let inputs = match desc.model() {
            Some(Value::Array(items)) => items
                .iter()
                .map(ConfigDescriptor::nested)
                .collect::<Result<Vec<_>, _>>()?,
            _ => {
                return Err(ModelError::Config(format!(
                    "{} is a mix, so model must be a list",
                    desc.human_id()
                )))
            }
        };
        if inputs.len() < 2 {
            return Err(ModelError::Config(format!(
                "{} must mix at least two models",
                desc.human_id()
            )));
        }

        let base = if method == MixMethod::Difference {
            let base = field("base").ok_or_else(|| {
                ModelError::Config("Must provide mix.base for difference mix type".into())
            })?;
            Some(ConfigDescriptor::nested(base)?)
        } else {
            None
        };

        Ok(Self {
            method,
            alpha,
            inputs,
            base,
        })
    }
}

fn parse_alpha(value: &Value) -> Result<f32, ModelError> {
    value
        .as_f64()
        .map(|a| a as f32)
        .ok_or_else(|| ModelError::Config(format!("mix alpha must be a number, got {value}")))
}

/// Blend one parameter across inputs.
pub fn mix_tensors(method: MixMethod, alpha: f32, tensors: &[&Tensor]) -> Result<Tensor, ModelError> {
    if tensors.len() != method.arity() {
        return Err(ModelError::Config(format!(
            "{} mixes {} inputs, got {}",
            method.name(),
            method.arity(),
            tensors.len()
        )));
    }

    let blend = method.blender(alpha);
    let first = tensors[0];
    let rest = &tensors[1..];

    if tensors.iter().all(|t| t.shape() == first.shape()) {
        return Ok(first.zip_map(rest, &blend)?);
    }

    let shape_mismatch = || ModelError::ShapeMismatch {
        shapes: tensors.iter().map(|t| t.shape().to_vec()).collect(),
    };

    let other = rest[0].shape();
    let rest_agree = rest.iter().all(|t| t.shape() == other);
    let only_dim1_differs = first.shape().len() == other.len()
        && other.len() >= 2
        && first
            .shape()
            .iter()
            .zip(other)
            .enumerate()
            .all(|(i, (a, b))| i == 1 || a == b);

    if !(rest_agree && only_dim1_differs && first.shape()[1] > other[1]) {
        return Err(shape_mismatch());
    }

    let head = first.narrow_dim1(other[1])?;
    let blended = head.zip_map(rest, &blend)?;
    Ok(first.splice_dim1(&blended)?)
}

/// Blend every parameter of same-structured modules.
pub fn mix_models(method: MixMethod, alpha: f32, models: &[Component]) -> Result<Component, ModelError> {
    let first = models
        .first()
        .ok_or_else(|| ModelError::Config("nothing to mix".into()))?;

    let dicts = models
        .iter()
        .map(|m| {
            m.state_dict().ok_or_else(|| {
                ModelError::KeysetMismatch(format!("{} has no parameters to mix", m.class_name()))
            })
        })
        .collect::<Result<Vec<&StateDict>, _>>()?;

    let mut result = StateDict::new();
    for key in dicts[0].keys() {
        let tensors = dicts
            .iter()
            .map(|d| {
                d.get(key)
                    .ok_or_else(|| ModelError::KeysetMismatch(format!("parameter {key} missing")))
            })
            .collect::<Result<Vec<&Tensor>, _>>()?;
        result.insert(key.clone(), mix_tensors(method, alpha, &tensors)?);
    }

    let source = format!(
        "Mix {}",
        models.iter().map(|m| m.source()).collect::<Vec<_>>().join(",")
    );
    Ok(Arc::new(first.with_state_dict(result).with_source(source)))
}

/// Blend sets component by component.
///
/// All sets must hold the same tensor-bearing component names. Plain
/// components are taken from the first set.
pub fn mix_sets(method: MixMethod, alpha: f32, sets: &[ModelSet]) -> Result<ModelSet, ModelError> {
    let first = sets
        .first()
        .ok_or_else(|| ModelError::Config("nothing to mix".into()))?;

    let keysets: Vec<_> = sets.iter().map(ModelSet::tensor_keys).collect();
    if keysets.iter().any(|k| *k != keysets[0]) {
        return Err(ModelError::KeysetMismatch(format!(
            "All modelset keys must match, got {keysets:?}"
        )));
    }

    let mut out = ModelSet::new();
    for (name, component) in first.iter() {
        if !keysets[0].contains(name) {
            out.insert(name, component.cloned());
            continue;
        }

        let models = sets
            .iter()
            .filter_map(|s| s.get(name).cloned())
            .collect::<Vec<_>>();
        out.insert(name, Some(mix_models(method, alpha, &models)?));
    }

    Ok(out)
}

/// Blend already-loaded inputs, which must all be sets or all be single
/// components.
pub fn mix_loaded(method: MixMethod, alpha: f32, inputs: Vec<LoadedModel>) -> Result<LoadedModel, ModelError> {
    let kinds: Vec<&str> = inputs.iter().map(LoadedModel::kind_name).collect();
    if kinds.is_empty() {
        return Err(ModelError::Config("nothing to mix".into()));
    }
    if kinds.iter().any(|k| *k != kinds[0]) {
        return Err(ModelError::Config(format!(
            "All model types must match, got {kinds:?}"
        )));
    }

    let mut sets = Vec::new();
    let mut singles = Vec::new();
    for input in inputs {
        match input {
            LoadedModel::Set(set) => sets.push(set),
            LoadedModel::Single(model) => singles.push(model),
        }
    }

    if singles.is_empty() {
        Ok(LoadedModel::Set(mix_sets(method, alpha, &sets)?))
    } else {
        Ok(LoadedModel::Single(mix_models(method, alpha, &singles)?))
    }
}
