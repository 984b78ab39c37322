// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Loaded model components and the named collections that hold them.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::tensor::StateDict;
use crate::engine::ComputeDevice;

/// Where a component's parameters currently live.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Host,
    Device(ComputeDevice),
    /// Installed for a device but materialized on first forward call.
    Deferred(ComputeDevice),
}

/// One loaded component: a neural module, tokenizer, scheduler or similar.
#[derive(Clone)]
pub struct Model {
    class_name: String,
    source: String,
    config: Value,
    weights: Option<Arc<StateDict>>,
    placement: Placement,
}

/// Components are shared between sets, caches and pipelines.
pub type Component = Arc<Model>;

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("class_name", &self.class_name)
            .field("source", &self.source)
            .field("tensors", &self.weights.as_ref().map(|w| w.len()))
            .field("placement", &self.placement)
            .finish()
    }
}

impl Model {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            source: String::new(),
            config: Value::Null,
            weights: None,
            placement: Placement::Host,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_weights(mut self, weights: StateDict) -> Self {
        self.weights = Some(Arc::new(weights));
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Provenance: the path loaded from, or how the component was mixed.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// True for tensor-bearing modules.
    pub fn is_module(&self) -> bool {
        self.weights.is_some()
    }

    pub fn state_dict(&self) -> Option<&StateDict> {
        self.weights.as_deref()
    }

    /// Copy with a replacement state dict, keeping class and config.
    pub fn with_state_dict(&self, weights: StateDict) -> Self {
        Self {
            weights: Some(Arc::new(weights)),
            ..self.clone()
        }
    }

    /// Copy with every parameter rounded to half precision.
    pub fn to_f16(&self) -> Self {
        match &self.weights {
            Some(weights) => self.with_state_dict(
                weights
                    .iter()
                    .map(|(k, t)| (k.clone(), t.to_f16()))
                    .collect(),
            ),
            None => self.clone(),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.weights
            .as_ref()
            .map(|w| w.values().map(|t| t.size_bytes()).sum())
            .unwrap_or(0)
    }
}

/// Ordered mapping of component name to an optional component.
///
/// A `None` entry records a slot that exists but was deliberately left empty
/// (for example an omitted safety checker).
#[derive(Debug, Clone, Default)]
pub struct ModelSet {
    entries: Vec<(String, Option<Component>)>,
}

impl ModelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == name)
    }

    /// The component under `name`, if the slot exists and is filled.
    pub fn get(&self, name: &str) -> Option<&Component> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_ref())
    }

    /// Set a slot, keeping its position when it already exists.
    pub fn insert(&mut self, name: impl Into<String>, component: Option<Component>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = component,
            None => self.entries.push((name, component)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Option<Component>> {
        let idx = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(idx).1)
    }

    /// Merge every slot of `other` into this set.
    pub fn update(&mut self, other: &ModelSet) {
        for (name, component) in &other.entries {
            self.insert(name.clone(), component.clone());
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Component>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Names of the slots holding tensor-bearing modules.
    pub fn tensor_keys(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|(_, v)| v.as_ref().map(|m| m.is_module()).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Shallow copy holding only the slots `keep` accepts.
    pub fn filtered<F>(&self, keep: F) -> ModelSet
    where
        F: Fn(&str) -> bool,
    {
        ModelSet {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| keep(k))
                .cloned()
                .collect(),
        }
    }

    pub fn freeze(self) -> FrozenModelSet {
        FrozenModelSet(Arc::new(self))
    }
}

impl FromIterator<(String, Option<Component>)> for ModelSet {
    fn from_iter<I: IntoIterator<Item = (String, Option<Component>)>>(iter: I) -> Self {
        let mut set = ModelSet::new();
        for (name, component) in iter {
            set.insert(name, component);
        }
        set
    }
}

/// Read-only, shareable model set. Consumers that need to change it take an
/// unfrozen copy with [`FrozenModelSet::to_model_set`].
#[derive(Debug, Clone)]
pub struct FrozenModelSet(Arc<ModelSet>);

impl FrozenModelSet {
    pub fn to_model_set(&self) -> ModelSet {
        (*self.0).clone()
    }

    pub fn ptr_eq(&self, other: &FrozenModelSet) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::ops::Deref for FrozenModelSet {
    type Target = ModelSet;

    fn deref(&self) -> &ModelSet {
        &self.0
    }
}

/// Result of loading one descriptor.
#[derive(Debug, Clone)]
pub enum LoadedModel {
    Set(ModelSet),
    Single(Component),
}

impl LoadedModel {
    pub fn kind_name(&self) -> &'static str {
        match self {
            LoadedModel::Set(_) => "ModelSet",
            LoadedModel::Single(_) => "Model",
        }
    }

    pub fn into_set(self) -> Option<ModelSet> {
        match self {
            LoadedModel::Set(set) => Some(set),
            LoadedModel::Single(_) => None,
        }
    }
}

/// A memoized load result, shared by every referencing descriptor.
#[derive(Debug, Clone)]
pub enum SharedModel {
    Set(FrozenModelSet),
    Single(Component),
}

impl From<LoadedModel> for SharedModel {
    fn from(loaded: LoadedModel) -> Self {
        match loaded {
            LoadedModel::Set(set) => SharedModel::Set(set.freeze()),
            LoadedModel::Single(model) => SharedModel::Single(model),
        }
    }
}
