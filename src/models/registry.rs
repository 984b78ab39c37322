// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Model registry: the full load pipeline for one descriptor.
//!
//! Handles `@model_id[/submodule]` references, mixes and overrides on top of
//! weight resolution. Referenced models are loaded once and shared frozen.
//! Saving walks the same references back to the entries that own weights.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::descriptor::{ConfigDescriptor, ModelReference};
use super::error::ModelError;
use super::loader::{ModelLoader, MODEL_INDEX};
use super::mixer::{mix_loaded, MixSpec};
use super::model_set::{LoadedModel, ModelSet, SharedModel};
use super::patterns::{fnmatch, matches_any};
use super::persist::{fix_component_config, ModelWriter};
use super::resolver::WeightResolver;

/// Chain of model ids currently being loaded, outermost first.
#[derive(Debug, Clone, Default)]
pub struct LoadContext {
    chain: Vec<String>,
}

impl LoadContext {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    /// Context for loading `model_id` from inside this one.
    pub fn enter(&self, model_id: &str) -> Result<LoadContext, ModelError> {
        let mut chain = self.chain.clone();
        chain.push(model_id.to_string());
        if self.chain.iter().any(|id| id == model_id) {
            return Err(ModelError::CyclicReference(chain));
        }
        Ok(LoadContext { chain })
    }
}

type MemoCell = Arc<Mutex<Option<SharedModel>>>;

pub struct ModelRegistry {
    descriptors: Arc<Vec<ConfigDescriptor>>,
    resolver: WeightResolver,
    loader: ModelLoader,
    memo: DashMap<String, MemoCell>,
}

impl ModelRegistry {
    pub fn new(
        descriptors: Arc<Vec<ConfigDescriptor>>,
        resolver: WeightResolver,
        loader: ModelLoader,
    ) -> Self {
        Self {
            descriptors,
            resolver,
            loader,
            memo: DashMap::new(),
        }
    }

    pub fn descriptors(&self) -> &[ConfigDescriptor] {
        &self.descriptors
    }

    pub fn resolver(&self) -> &WeightResolver {
        &self.resolver
    }

    /// Load a top-level descriptor.
    pub fn load(&self, desc: &ConfigDescriptor) -> Result<LoadedModel, ModelError> {
        self.load_with(desc, &LoadContext::root())
    }

    pub fn load_with(
        &self,
        desc: &ConfigDescriptor,
        ctx: &LoadContext,
    ) -> Result<LoadedModel, ModelError> {
        let model = if desc.model_is_empty() {
            LoadedModel::Set(ModelSet::new())
        } else if desc.model_is_reference() {
            self.load_reference(desc, ctx)?
        } else if desc.kind() == "mix" {
            self.load_mixed(desc, ctx)?
        } else {
            let (set, _) = self
                .resolver
                .resolve(desc, |path| self.loader.load_from_weights(desc, path))?;
            LoadedModel::Set(set)
        };

        self.apply_overrides(desc, model, ctx)
    }

    /// Shared result for `model_id`, loading it on first use.
    ///
    /// Concurrent first requests for the same id wait on one load.
    pub fn shared(&self, model_id: &str, ctx: &LoadContext) -> Result<SharedModel, ModelError> {
        let ctx = ctx.enter(model_id)?;
        let cell = self.memo.entry(model_id.to_string()).or_default().value().clone();
        let mut slot = cell.lock();

        if let Some(shared) = slot.as_ref() {
            return Ok(shared.clone());
        }

        let desc = self
            .descriptors
            .iter()
            .find(|d| d.enabled() && d.model_id() == Some(model_id))
            .ok_or_else(|| ModelError::ReferenceNotFound(model_id.to_string()))?;

        tracing::info!(model_id, "Loading referenced model");
        let shared = SharedModel::from(self.load_with(desc, &ctx)?);
        *slot = Some(shared.clone());
        Ok(shared)
    }

    /// Already-loaded shared result, if any.
    pub fn cached(&self, model_id: &str) -> Option<SharedModel> {
        let cell = self.memo.get(model_id)?.value().clone();
        let slot = cell.lock();
        slot.clone()
    }

    fn load_reference(
        &self,
        desc: &ConfigDescriptor,
        ctx: &LoadContext,
    ) -> Result<LoadedModel, ModelError> {
        let reference = desc
            .reference()?
            .ok_or_else(|| ModelError::Config(format!("{} has no reference", desc.human_id())))?;
        let shared = self.shared(&reference.model_id, ctx)?;

        if let Some(sub) = &reference.submodule {
            let missing = || ModelError::SubmoduleNotFound {
                model_id: reference.model_id.clone(),
                submodule: sub.clone(),
            };
            return match &shared {
                SharedModel::Set(set) => set.get(sub).cloned().map(LoadedModel::Single).ok_or_else(missing),
                SharedModel::Single(_) => Err(missing()),
            };
        }

        let whitelist = desc.whitelist();
        let blacklist = desc.blacklist();
        match shared {
            SharedModel::Set(set) if !whitelist.is_empty() || !blacklist.is_empty() => {
                Ok(LoadedModel::Set(set.filtered(|name| {
                    (whitelist.is_empty() || whitelist.iter().any(|w| w == name))
                        && !blacklist.iter().any(|b| b == name)
                })))
            }
            SharedModel::Set(set) => Ok(LoadedModel::Set(set.to_model_set())),
            SharedModel::Single(_) if !whitelist.is_empty() || !blacklist.is_empty() => {
                Err(ModelError::Config(format!(
                    "{} filters model {}, which is not a model set",
                    desc.human_id(),
                    reference.model_id
                )))
            }
            SharedModel::Single(model) => Ok(LoadedModel::Single(model)),
        }
    }

    fn load_mixed(
        &self,
        desc: &ConfigDescriptor,
        ctx: &LoadContext,
    ) -> Result<LoadedModel, ModelError> {
        let spec = MixSpec::from_descriptor(desc)?;

        let mut inputs = spec
            .inputs
            .iter()
            .map(|input| self.load_with(input, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(base) = &spec.base {
            inputs.push(self.load_with(base, ctx)?);
        }

        tracing::info!(
            name = %desc.human_id(),
            method = spec.method.name(),
            alpha = spec.alpha,
            "Mixing models"
        );
        mix_loaded(spec.method, spec.alpha, inputs)
    }

    fn apply_overrides(
        &self,
        desc: &ConfigDescriptor,
        model: LoadedModel,
        ctx: &LoadContext,
    ) -> Result<LoadedModel, ModelError> {
        let overrides = desc.overrides();
        if overrides.is_empty() {
            return Ok(model);
        }

        let LoadedModel::Set(mut set) = model else {
            return Err(ModelError::Config(format!(
                "{} loads a single model, so it can't take overrides",
                desc.human_id()
            )));
        };

        for (name, value) in overrides {
            let nested = ConfigDescriptor::nested(&value)?.with("type", Value::String(name.clone()));
            tracing::debug!(name = %desc.human_id(), component = %name, "Applying override");
            match self.load_with(&nested, ctx)? {
                LoadedModel::Set(patch) => set.update(&patch),
                LoadedModel::Single(component) => set.insert(name, Some(component)),
            }
        }

        Ok(LoadedModel::Set(set))
    }

    /// Save the weights behind every engine whose id matches one of
    /// `patterns`. Referenced models and override inputs are saved in their
    /// place, each once.
    pub fn save_engines(
        &self,
        patterns: &[String],
        writer: &dyn ModelWriter,
    ) -> Result<Vec<PathBuf>, ModelError> {
        let engines: Vec<&ConfigDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| d.id().is_some_and(|id| matches_any(id, patterns)))
            .collect();
        let involved = self.weight_descriptors(engines)?;
        self.save_all(&involved, writer)
    }

    /// Save every model whose `model_id` matches one of `patterns`.
    pub fn save_models(
        &self,
        patterns: &[String],
        writer: &dyn ModelWriter,
    ) -> Result<Vec<PathBuf>, ModelError> {
        let models: Vec<ConfigDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| d.model_id().is_some_and(|id| matches_any(id, patterns)))
            .cloned()
            .collect();
        self.save_all(&models, writer)
    }

    fn save_all(
        &self,
        descs: &[ConfigDescriptor],
        writer: &dyn ModelWriter,
    ) -> Result<Vec<PathBuf>, ModelError> {
        let saved = descs
            .iter()
            .map(|desc| self.save(desc, writer))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!(count = saved.len(), "Saved models");
        Ok(saved)
    }

    /// Entries that own the weights `descs` load, in first-use order and
    /// without repeats. References are followed to the first model whose
    /// id matches, and mix inputs and overrides are descended into.
    pub fn weight_descriptors<'a, I>(&self, descs: I) -> Result<Vec<ConfigDescriptor>, ModelError>
    where
        I: IntoIterator<Item = &'a ConfigDescriptor>,
    {
        let mut out = Vec::new();
        for desc in descs {
            self.collect_weight_descriptors(desc, &LoadContext::root(), &mut out)?;
        }
        Ok(out)
    }

    fn collect_weight_descriptors(
        &self,
        desc: &ConfigDescriptor,
        ctx: &LoadContext,
        out: &mut Vec<ConfigDescriptor>,
    ) -> Result<(), ModelError> {
        if let Some(reference) = desc.reference()? {
            let ctx = ctx.enter(&reference.model_id)?;
            let target = self
                .descriptors
                .iter()
                .find(|d| d.model_id().is_some_and(|id| fnmatch(id, &reference.model_id)))
                .ok_or_else(|| ModelError::ReferenceNotFound(reference.model_id.clone()))?;
            self.collect_weight_descriptors(target, &ctx, out)?;
        } else if desc.kind() == "mix" {
            let mut inputs: Vec<Value> = match desc.model() {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            inputs.extend(desc.mix().and_then(|m| m.get("base")).cloned());
            for input in &inputs {
                self.collect_weight_descriptors(&ConfigDescriptor::nested(input)?, ctx, out)?;
            }
        } else if !desc.model_is_empty() && !out.iter().any(|seen| same_entry(seen, desc)) {
            out.push(desc.clone());
        }

        for (name, value) in desc.overrides() {
            let nested = ConfigDescriptor::nested(&value)?.with("type", Value::String(name));
            self.collect_weight_descriptors(&nested, ctx, out)?;
        }
        Ok(())
    }

    /// Load `desc` straight from its weights and write it to its local
    /// model folder (`local_model_fp16` in fp16 mode).
    ///
    /// Pipelines get one sub-folder per component plus the source's
    /// `model_index.json`; clip models keep their JSON configs; anything
    /// else is written as its single component.
    pub fn save(&self, desc: &ConfigDescriptor, writer: &dyn ModelWriter) -> Result<PathBuf, ModelError> {
        let kind = desc.kind();
        if desc.model_is_reference() || desc.model_is_empty() || kind == "mix" {
            return Err(ModelError::Capability(format!(
                "{} has no weights of its own to save",
                desc.human_id()
            )));
        }
        if desc.checkpoint_format().is_some() {
            return Err(ModelError::Capability(format!(
                "{} is a single-file checkpoint; describe it as a pipeline to save it",
                desc.human_id()
            )));
        }

        let settings = self.resolver.settings();
        let (field, configured) = if settings.fp16 {
            ("local_model_fp16", desc.local_model_fp16())
        } else {
            (
                "local_model",
                desc.local_model().filter(|p| !p.is_empty()).map(str::to_string),
            )
        };
        let configured = configured.ok_or_else(|| {
            ModelError::Config(format!("Can't save {} if {field} not set", desc.human_id()))
        })?;
        let out = settings.weight_root.join(configured);

        tracing::info!(name = %desc.human_id(), %kind, path = %out.display(), "Saving model");
        let (set, source) = self
            .resolver
            .resolve(desc, |path| self.loader.load_from_weights(desc, path))?;

        match kind.as_str() {
            "pipeline" => {
                std::fs::create_dir_all(&out)?;
                for (name, model) in set.iter() {
                    let Some(model) = model else {
                        continue;
                    };
                    let fixed = fix_component_config(name, model);
                    let dir = out.join(name);
                    tracing::info!(component = name, path = %dir.display(), "Saving component");
                    writer.write(fixed.as_ref().unwrap_or(&**model), &dir)?;
                }
                if !same_dir(&source, &out) {
                    std::fs::copy(source.join(MODEL_INDEX), out.join(MODEL_INDEX))?;
                }
            }
            "clip" => {
                let clip = set.get("clip_model").ok_or_else(|| {
                    ModelError::MissingWeights(format!("{} loaded no clip_model", desc.human_id()))
                })?;
                writer.write(clip, &out)?;
                if !same_dir(&source, &out) {
                    copy_json_files(&source, &out)?;
                }
            }
            _ => {
                let model = set.iter().find_map(|(_, model)| model).ok_or_else(|| {
                    ModelError::MissingWeights(format!("{} loaded no model", desc.human_id()))
                })?;
                writer.write(model, &out)?;
            }
        }

        Ok(out)
    }

    /// Check every reference in `descriptors` at configuration time: each
    /// target must be an enabled model and no chain may loop.
    pub fn validate_references(descriptors: &[ConfigDescriptor]) -> Result<(), ModelError> {
        let models: HashMap<&str, &ConfigDescriptor> = descriptors
            .iter()
            .filter(|d| d.enabled())
            .filter_map(|d| d.model_id().map(|id| (id, d)))
            .collect();

        let mut edges: HashMap<&str, Vec<String>> = HashMap::new();
        for desc in descriptors.iter().filter(|d| d.enabled()) {
            let mut refs = Vec::new();
            collect_references(desc, &mut refs)?;
            for reference in &refs {
                if !models.contains_key(reference.model_id.as_str()) {
                    return Err(ModelError::ReferenceNotFound(reference.model_id.clone()));
                }
            }
            if let Some(id) = desc.model_id() {
                edges.insert(id, refs.into_iter().map(|r| r.model_id).collect());
            }
        }

        let mut done: HashSet<&str> = HashSet::new();
        for start in models.keys() {
            let mut path = Vec::new();
            visit(start, &edges, &mut path, &mut done)?;
        }
        Ok(())
    }
}

/// Same engine or model, or the same nested record.
fn same_entry(a: &ConfigDescriptor, b: &ConfigDescriptor) -> bool {
    match (a.identity(), b.identity()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn copy_json_files(from: &Path, to: &Path) -> Result<(), ModelError> {
    for entry in std::fs::read_dir(from)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            if let Some(name) = path.file_name() {
                std::fs::copy(&path, to.join(name))?;
            }
        }
    }
    Ok(())
}

/// Depth-first walk that fails on the first back edge.
fn visit<'a>(
    node: &'a str,
    edges: &'a HashMap<&'a str, Vec<String>>,
    path: &mut Vec<&'a str>,
    done: &mut HashSet<&'a str>,
) -> Result<(), ModelError> {
    if done.contains(node) {
        return Ok(());
    }
    if let Some(pos) = path.iter().position(|n| *n == node) {
        let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
        cycle.push(node.to_string());
        return Err(ModelError::CyclicReference(cycle));
    }

    path.push(node);
    for next in edges.get(node).into_iter().flatten() {
        visit(next, edges, path, done)?;
    }
    path.pop();
    done.insert(node);
    Ok(())
}

/// Every reference a descriptor can load: its own model, mix inputs and
/// base, and overrides, recursively through nested records.
fn collect_references(
    desc: &ConfigDescriptor,
    out: &mut Vec<ModelReference>,
) -> Result<(), ModelError> {
    if let Some(reference) = desc.reference()? {
        out.push(reference);
    }

    let mut nested = Vec::new();
    if let Some(Value::Array(items)) = desc.model() {
        nested.extend(items.iter().cloned());
    }
    if let Some(base) = desc.mix().and_then(|m| m.get("base")) {
        nested.push(base.clone());
    }
    nested.extend(desc.overrides().into_iter().map(|(_, v)| v));

    for value in &nested {
        collect_references(&ConfigDescriptor::nested(value)?, out)?;
    }
    Ok(())
}
