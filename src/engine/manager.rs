// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Engine manager: the facade request handlers use.
//!
//! Loads one frozen model set per enabled engine at startup, then serves
//! [`EngineManager::with_engine`] leases: wait for a device slot, make the
//! requested engine's pipeline resident on it, run the caller, release the
//! slot. Pipelines stay warm on their slot until another engine displaces
//! them into the per-engine pool.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::assembler::PipelineCatalog;
use super::batch::{BatchMode, AUTODETECT_RESMAX, AUTODETECT_RESSTEP};
use super::device::{ComputeDevice, DevicePool, DeviceSlot, PipelinePools};
use super::error::EngineError;
use super::generate::{GenerateRequest, GenerationOutput};
use super::mode::EngineMode;
use super::pipeline::{ModuleTransfer, StepMonitor};
use super::wrapper::PipelineWrapper;
use crate::models::patterns::fnmatch;
use crate::models::{
    ConfigDescriptor, FrozenModelSet, LoadedModel, ModelError, ModelRegistry, ModelWriter,
};
use crate::telemetry;

/// Task used when a caller names none.
pub const DEFAULT_TASK: &str = "generate";

/// Device and batching settings for a manager.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub devices: Vec<ComputeDevice>,
    pub vram_level: u8,
    pub batch: BatchMode,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            devices: vec![ComputeDevice::cpu()],
            vram_level: 2,
            batch: BatchMode::default(),
        }
    }
}

#[derive(Clone)]
struct LoadedEngine {
    models: FrozenModelSet,
    generation: u64,
}

/// Outcome of [`EngineManager::load_engines`].
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, EngineError)>,
}

pub struct EngineManager {
    registry: ModelRegistry,
    catalog: PipelineCatalog,
    transfer: Arc<dyn ModuleTransfer>,
    mode: EngineMode,
    device_list: Vec<ComputeDevice>,
    devices: DevicePool,
    pools: PipelinePools,
    engines: DashMap<String, LoadedEngine>,
    defaults: HashMap<String, String>,
    batch: RwLock<BatchMode>,
    generations: AtomicU64,
}

impl EngineManager {
    /// Create a manager. Fails if any model reference in the registry's
    /// descriptors is dangling or cyclic.
    pub fn new(
        registry: ModelRegistry,
        catalog: PipelineCatalog,
        transfer: Arc<dyn ModuleTransfer>,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        ModelRegistry::validate_references(registry.descriptors())?;

        let device_list = if settings.devices.is_empty() {
            vec![ComputeDevice::cpu()]
        } else {
            settings.devices
        };
        let mode = EngineMode::new(settings.vram_level, device_list[0].kind);

        let mut defaults = HashMap::new();
        for desc in registry.descriptors().iter().filter(|d| d.enabled() && d.is_engine()) {
            if let (true, Some(id), Some(task)) = (desc.is_default(), desc.id(), desc.task()) {
                defaults.insert(task, id.to_string());
            }
        }

        tracing::info!(
            devices = device_list.len(),
            vram_level = mode.vram_level(),
            engines = registry.descriptors().iter().filter(|d| d.is_engine()).count(),
            "Engine manager created"
        );

        Ok(Self {
            registry,
            catalog,
            transfer,
            mode,
            devices: DevicePool::new(device_list.clone()),
            device_list,
            pools: PipelinePools::new(),
            engines: DashMap::new(),
            defaults,
            batch: RwLock::new(settings.batch),
            generations: AtomicU64::new(0),
        })
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn device_pool(&self) -> &DevicePool {
        &self.devices
    }

    pub fn pooled(&self, id: &str) -> usize {
        self.pools.len(id)
    }

    fn engine_descriptors(&self) -> impl Iterator<Item = &ConfigDescriptor> {
        self.registry.descriptors().iter().filter(|d| d.is_engine())
    }

    /// First engine descriptor whose id matches `pattern`, enabled or not.
    fn find_engine(&self, pattern: &str) -> Option<&ConfigDescriptor> {
        self.engine_descriptors()
            .find(|d| d.id().map(|id| fnmatch(id, pattern)).unwrap_or(false))
    }

    /// Load the model set of every enabled engine, then run batch
    /// autodetection if configured.
    pub fn load_engines(&self) -> LoadReport {
        let mut report = LoadReport::default();
        let ids: Vec<String> = self
            .engine_descriptors()
            .filter(|d| d.enabled())
            .filter_map(|d| d.id().map(str::to_string))
            .collect();

        for id in ids {
            match self.load_engine(&id) {
                Ok(()) => report.loaded.push(id),
                Err(e) => {
                    tracing::error!(engine = %id, error = %e, "Engine failed to load");
                    report.failed.push((id, e));
                }
            }
        }

        if self.batch.read().autodetect {
            if let Err(e) = self.run_batch_autodetect() {
                tracing::warn!(error = %e, "Batch autodetection failed");
            }
        }
        report
    }

    /// Load (or load again) the model set for one engine.
    pub fn load_engine(&self, id: &str) -> Result<(), EngineError> {
        let desc = self
            .engine_descriptors()
            .find(|d| d.enabled() && d.id() == Some(id))
            .ok_or_else(|| not_enabled(id))?;

        tracing::info!(engine = %id, "Loading engine");
        let models = match self.registry.load(desc)? {
            LoadedModel::Set(set) => set.freeze(),
            LoadedModel::Single(_) => {
                return Err(ModelError::Config(format!(
                    "Engine {id} must load a model set, not a single model"
                ))
                .into())
            }
        };

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        self.engines.insert(id.to_string(), LoadedEngine { models, generation });
        Ok(())
    }

    /// Rebuild an engine's model set. Pooled pipelines are dropped and
    /// resident ones are replaced on their next lease.
    pub fn reload_engine(&self, id: &str) -> Result<(), EngineError> {
        self.load_engine(id)?;
        let dropped = self.pools.clear(id);
        tracing::info!(engine = %id, dropped, "Engine reloaded");
        Ok(())
    }

    /// Write the weights behind every engine matching `patterns` to their
    /// local model folders. Nothing is made resident.
    pub fn save_engines(
        &self,
        patterns: &[String],
        writer: &dyn ModelWriter,
    ) -> Result<Vec<PathBuf>, EngineError> {
        Ok(self.registry.save_engines(patterns, writer)?)
    }

    pub fn save_models(
        &self,
        patterns: &[String],
        writer: &dyn ModelWriter,
    ) -> Result<Vec<PathBuf>, EngineError> {
        Ok(self.registry.save_models(patterns, writer)?)
    }

    /// Engine id → loaded, for every enabled engine.
    pub fn status(&self) -> BTreeMap<String, bool> {
        self.engine_descriptors()
            .filter(|d| d.enabled())
            .filter_map(|d| d.id())
            .map(|id| (id.to_string(), self.engines.contains_key(id)))
            .collect()
    }

    /// Default engine for `task`.
    pub fn default_engine(&self, task: &str) -> Option<&str> {
        self.defaults.get(task).map(String::as_str)
    }

    /// First enabled engine (for `task`, if given) whose id contains a hint.
    /// Hints are tried in order.
    pub fn find_by_hint(&self, hints: &[&str], task: Option<&str>) -> Option<String> {
        let candidates: Vec<&ConfigDescriptor> = self
            .engine_descriptors()
            .filter(|d| d.enabled())
            .filter(|d| task.is_none() || d.task().as_deref() == task)
            .collect();

        hints.iter().find_map(|hint| {
            candidates
                .iter()
                .filter_map(|d| d.id())
                .find(|id| id.contains(hint))
                .map(str::to_string)
        })
    }

    /// Lease a device with the requested engine active on it and run `f`.
    ///
    /// With no `id` the default engine for `task` (or `generate`) is used.
    /// The device slot is returned however `f` exits.
    pub fn with_engine<R, F>(&self, id: Option<&str>, task: Option<&str>, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&mut PipelineWrapper) -> Result<R, EngineError>,
    {
        let id = match id {
            Some(id) => id,
            None => self.default_engine(task.unwrap_or(DEFAULT_TASK)).ok_or_else(|| {
                EngineError::NotFound("No engine ID provided and no default is set.".to_string())
            })?,
        };

        let desc = self
            .find_engine(id)
            .filter(|d| d.enabled())
            .ok_or_else(|| not_enabled(id))?;
        let engine_id = desc.id().unwrap_or(id);

        let actual = desc.task().unwrap_or_default();
        if let Some(requested) = task {
            if requested != actual {
                return Err(EngineError::WrongTask {
                    id: engine_id.to_string(),
                    actual,
                    requested: requested.to_string(),
                });
            }
        }

        let mut lease = self.devices.acquire();
        let wrapper = self.make_resident(&mut lease, desc, engine_id)?;
        f(wrapper)
    }

    /// Make `id` the active pipeline on `slot`, displacing whatever was there.
    fn make_resident<'s>(
        &self,
        slot: &'s mut DeviceSlot,
        desc: &ConfigDescriptor,
        id: &str,
    ) -> Result<&'s mut PipelineWrapper, EngineError> {
        let generation = self.engines.get(id).map(|e| e.generation);

        let stale = slot
            .resident()
            .map(|r| r.id() != id || Some(r.generation()) != generation)
            .unwrap_or(false);
        if stale {
            self.displace(slot);
        }

        if slot.resident().is_none() {
            let device = slot.device().clone();
            let (mut wrapper, existing) = match self.take_pooled(id, generation) {
                Some(wrapper) => (wrapper, true),
                None => (self.build_wrapper(desc, id)?, false),
            };

            if let Err(e) = wrapper.activate(&device) {
                self.pools.put(wrapper);
                return Err(e);
            }
            tracing::info!(
                engine = %id,
                %device,
                instance = %wrapper.instance(),
                reused = existing,
                "Pipeline activated"
            );
            slot.set_resident(wrapper);
        }

        slot.resident_mut().ok_or_else(|| {
            EngineError::Activation(format!("No pipeline resident for engine {id}"))
        })
    }

    /// Deactivate the slot's resident pipeline and pool it for reuse, unless
    /// it was built from a model set that has since been reloaded.
    fn displace(&self, slot: &mut DeviceSlot) {
        let Some(mut wrapper) = slot.take_resident() else {
            return;
        };
        telemetry::record_displacement(wrapper.id());

        if let Err(e) = wrapper.deactivate() {
            tracing::warn!(engine = %wrapper.id(), error = %e, "Dropping pipeline that failed to deactivate");
            return;
        }

        let current = self.engines.get(wrapper.id()).map(|e| e.generation);
        if current == Some(wrapper.generation()) {
            tracing::info!(engine = %wrapper.id(), device = %slot.device(), "Existing pipeline deactivated");
            self.pools.put(wrapper);
        } else {
            tracing::info!(engine = %wrapper.id(), "Dropping pipeline built from an outdated model set");
        }
    }

    fn take_pooled(&self, id: &str, generation: Option<u64>) -> Option<PipelineWrapper> {
        while let Some(wrapper) = self.pools.try_take(id) {
            if Some(wrapper.generation()) == generation {
                return Some(wrapper);
            }
        }
        None
    }

    fn build_wrapper(&self, desc: &ConfigDescriptor, id: &str) -> Result<PipelineWrapper, EngineError> {
        let loaded = self
            .engines
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::NotReady(id.to_string()))?;

        let pipeline = self.catalog.assemble(desc, &loaded.models)?;
        let wrapper = if desc.task().as_deref() == Some(DEFAULT_TASK) {
            PipelineWrapper::for_generate(id, self.mode, pipeline, self.transfer.clone())
        } else {
            PipelineWrapper::plain(id, self.mode, pipeline, self.transfer.clone())
        };
        Ok(wrapper.with_generation(loaded.generation))
    }

    /// Generate images on `id`, or on the default generation engine.
    pub fn generate(
        &self,
        id: Option<&str>,
        request: GenerateRequest,
        monitor: StepMonitor,
    ) -> Result<GenerationOutput, EngineError> {
        self.with_engine(id, Some(DEFAULT_TASK), |pipeline| pipeline.generate(request, monitor))
    }

    /// [`EngineManager::generate`] on tokio's blocking pool.
    pub async fn generate_async(
        self: Arc<Self>,
        id: Option<String>,
        request: GenerateRequest,
        monitor: StepMonitor,
    ) -> Result<GenerationOutput, EngineError> {
        tokio::task::spawn_blocking(move || self.generate(id.as_deref(), request, monitor))
            .await
            .map_err(|e| EngineError::Async(e.to_string()))?
    }

    /// Advised maximum batch for images of `pixels` pixels.
    pub fn batchmax(&self, pixels: u64) -> u32 {
        self.batch.read().batchmax(pixels)
    }

    pub fn batch_mode(&self) -> BatchMode {
        self.batch.read().clone()
    }

    /// Trial-run the default generation engine for the largest batch each
    /// resolution can take, with device memory capped by the safety margin.
    pub fn run_batch_autodetect(&self) -> Result<Vec<(u64, u32)>, EngineError> {
        if self.default_engine(DEFAULT_TASK).is_none() {
            return Err(EngineError::NotFound(
                "Batch autodetection needs a default generate engine".to_string(),
            ));
        }

        let mut batch = self.batch.read().clone();
        let fraction = 1.0 - batch.safety_margin;
        for device in &self.device_list {
            self.transfer.set_memory_fraction(device, fraction);
        }

        let points = batch
            .run_autodetect(
                |width, height, size| {
                    let mut request = GenerateRequest::new(vec!["A Crocodile"; size as usize]);
                    request.width = width;
                    request.height = height;
                    request.num_inference_steps = 8;
                    request.eta = Some(0.0);
                    request.strength = Some(1.0);
                    match self.generate(None, request, StepMonitor::new()) {
                        Ok(_) => true,
                        Err(e) => {
                            tracing::debug!(width, height, batch = size, error = %e, "Batch trial failed");
                            false
                        }
                    }
                },
                AUTODETECT_RESMAX,
                AUTODETECT_RESSTEP,
            )
            .to_vec();

        for device in &self.device_list {
            self.transfer.set_memory_fraction(device, 1.0);
        }
        *self.batch.write() = batch;
        Ok(points)
    }
}

fn not_enabled(id: &str) -> EngineError {
    EngineError::NotFound(format!("Engine ID {id} doesn't exist or isn't enabled."))
}
