//! Shared fixtures for integration tests: on-disk weight folders, a mock
//! component factory, a mock pipeline and recording collaborators.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use gyre_engine::engine::{
    ComputeDevice, EngineManager, EngineSettings, ModuleTransfer, Pipeline, PipelineCatalog,
    PipelineCall, PipelineError, PipelineFactory, PipelineManifest, Sampler, SamplerSet,
};
use gyre_engine::models::{
    ComponentFactory, ComponentFamily, ComponentRegistry, ConfigDescriptor, HubClient, HubError,
    LoadMethod, LoadOptions, Model, ModelError, ModelLoader, ModelRegistry, ModelSet,
    ModelWriter, OfflineFetcher, OfflineHub, Placement, RepoInfo, ResolverSettings, SafetyPolicy,
    SnapshotRequest, StateDict, Tensor, UrlFetcher, WeightResolver,
};

/// File holding the fill value a [`TensorFactory`] loads.
pub const VALUE_FILE: &str = "value";
/// File holding the tensor shape a [`TensorFactory`] loads, as JSON.
pub const SHAPE_FILE: &str = "shape.json";

// ---------------------------------------------------------------------------
// Weight folders
// ---------------------------------------------------------------------------

/// Write a component folder: `<dir>/value` and optionally `<dir>/shape.json`.
pub fn write_component(dir: &Path, value: f32, shape: Option<&[usize]>) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(VALUE_FILE), value.to_string()).unwrap();
    if let Some(shape) = shape {
        std::fs::write(dir.join(SHAPE_FILE), serde_json::to_string(shape).unwrap()).unwrap();
    }
}

/// Write a pipeline folder with a `model_index.json` naming `components`
/// (`name`, `library.Class`). Every component gets fill value `value`.
pub fn write_pipeline(dir: &Path, components: &[(&str, &str)], value: f32) {
    std::fs::create_dir_all(dir).unwrap();
    let mut index = serde_json::Map::new();
    index.insert("_class_name".into(), json!("StableDiffusionPipeline"));
    for (name, class) in components {
        let (library, class) = class.rsplit_once('.').unwrap();
        index.insert(name.to_string(), json!([library, class]));
        write_component(&dir.join(name), value, None);
    }
    std::fs::write(
        dir.join("model_index.json"),
        serde_json::to_string_pretty(&Value::Object(index)).unwrap(),
    )
    .unwrap();
}

/// The component layout most tests use.
pub const SD_COMPONENTS: &[(&str, &str)] = &[
    ("vae", "diffusers.AutoencoderKL"),
    ("unet", "diffusers.UNet2DConditionModel"),
    ("text_encoder", "transformers.CLIPTextModel"),
    ("tokenizer", "transformers.CLIPTokenizer"),
];

// ---------------------------------------------------------------------------
// Component loading
// ---------------------------------------------------------------------------

/// Loads a single-tensor module whose fill value comes from the folder.
pub struct TensorFactory {
    class_name: String,
    pub loads: AtomicUsize,
}

impl TensorFactory {
    pub fn new(class_name: &str) -> Arc<Self> {
        Arc::new(Self {
            class_name: class_name.to_string(),
            loads: AtomicUsize::new(0),
        })
    }
}

impl ComponentFactory for TensorFactory {
    fn family(&self) -> ComponentFamily {
        ComponentFamily::Diffusers
    }

    fn load(&self, _: LoadMethod, path: &Path, options: LoadOptions) -> Result<Model, ModelError> {
        let value_file = path.join(VALUE_FILE);
        if !value_file.is_file() {
            return Err(ModelError::MissingWeights(format!(
                "{} not found",
                value_file.display()
            )));
        }
        let value: f32 = std::fs::read_to_string(&value_file)?
            .trim()
            .parse()
            .map_err(|_| ModelError::Checkpoint(format!("bad value in {}", value_file.display())))?;
        let shape: Vec<usize> = match std::fs::read_to_string(path.join(SHAPE_FILE)) {
            Ok(raw) => serde_json::from_str(&raw).unwrap(),
            Err(_) => vec![2, 2],
        };

        self.loads.fetch_add(1, Ordering::SeqCst);
        let mut weights = StateDict::new();
        weights.insert("weight".into(), Tensor::full(shape, value));
        let model = Model::new(self.class_name.clone())
            .with_weights(weights)
            .with_config(json!({"fp16": options.fp16}));
        Ok(model)
    }
}

/// Component registry with tensor factories for the usual module classes.
pub fn component_registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::with_defaults();
    for class in [
        "diffusers.AutoencoderKL",
        "diffusers.UNet2DConditionModel",
        "transformers.CLIPTextModel",
        "transformers.CLIPModel",
    ] {
        let short = class.rsplit_once('.').unwrap().1;
        registry.register(class, TensorFactory::new(short));
    }
    registry
}

/// First element of the named component's only tensor.
pub fn fill_value(set: &ModelSet, name: &str) -> f32 {
    set.get(name).unwrap().state_dict().unwrap()["weight"].data()[0]
}

// ---------------------------------------------------------------------------
// Network collaborators
// ---------------------------------------------------------------------------

/// Hub double: repos map to local folders; every call is recorded.
#[derive(Default)]
pub struct RecordingHub {
    pub repos: BTreeMap<String, PathBuf>,
    pub cached: Mutex<Vec<String>>,
    pub calls: Mutex<Vec<String>>,
}

impl RecordingHub {
    pub fn with_repo(mut self, repo: &str, path: PathBuf, cached: bool) -> Self {
        self.repos.insert(repo.to_string(), path);
        if cached {
            self.cached.lock().push(repo.to_string());
        }
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl HubClient for RecordingHub {
    fn model_info(
        &self,
        repo: &str,
        revision: Option<&str>,
        _: Option<&str>,
    ) -> Result<RepoInfo, HubError> {
        self.calls
            .lock()
            .push(format!("info {repo}@{}", revision.unwrap_or("main")));
        if revision.is_some() {
            return Err(HubError::RevisionNotFound(revision.unwrap_or_default().to_string()));
        }
        match self.repos.get(repo) {
            Some(_) => Ok(RepoInfo {
                files: vec!["model_index.json".into(), "unet/model.safetensors".into()],
                safetensors_compatible: true,
            }),
            None => Err(HubError::Other(format!("repo {repo} not found"))),
        }
    }

    fn snapshot_download(&self, request: &SnapshotRequest) -> Result<PathBuf, HubError> {
        let mode = if request.local_only { "cache" } else { "download" };
        self.calls.lock().push(format!("{mode} {}", request.repo));
        let Some(path) = self.repos.get(&request.repo) else {
            return Err(HubError::NotFound(request.repo.clone()));
        };
        if request.local_only && !self.cached.lock().contains(&request.repo) {
            return Err(HubError::NotFound(request.repo.clone()));
        }
        self.cached.lock().push(request.repo.clone());
        Ok(path.clone())
    }

    fn evict_cache(&self, repo: &str) -> Result<(), HubError> {
        self.calls.lock().push(format!("evict {repo}"));
        self.cached.lock().retain(|r| r != repo);
        Ok(())
    }
}

/// URL double serving fixed bodies and counting fetches.
#[derive(Default)]
pub struct MapFetcher {
    pub bodies: BTreeMap<String, Vec<u8>>,
    pub fetches: AtomicUsize,
}

impl UrlFetcher for MapFetcher {
    fn fetch(&self, url: &str, out: &mut dyn Write) -> std::io::Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.bodies.get(url) {
            Some(body) => out.write_all(body),
            None => Err(std::io::Error::new(std::io::ErrorKind::NotFound, url.to_string())),
        }
    }
}

pub fn settings(root: &Path, cache: &Path) -> ResolverSettings {
    ResolverSettings {
        weight_root: root.to_path_buf(),
        cache_dir: cache.to_path_buf(),
        ..ResolverSettings::default()
    }
}

pub fn descriptors(values: Value) -> Vec<ConfigDescriptor> {
    let Value::Array(items) = values else {
        panic!("descriptor fixture must be a list");
    };
    items
        .into_iter()
        .map(|v| ConfigDescriptor::from_value(v).unwrap())
        .collect()
}

/// Offline registry over `values`, loading weights from `root`.
pub fn registry(root: &Path, values: Value) -> ModelRegistry {
    registry_with(root, values, component_registry())
}

pub fn registry_with(root: &Path, values: Value, components: ComponentRegistry) -> ModelRegistry {
    let resolver = WeightResolver::new(
        settings(root, &root.join(".cache")),
        Arc::new(OfflineHub),
        Arc::new(OfflineFetcher),
    );
    let loader = ModelLoader::new(Arc::new(components), SafetyPolicy::Block, false);
    ModelRegistry::new(Arc::new(descriptors(values)), resolver, loader)
}

/// Offline registry in fp16 mode: `<local_model>-fp16` folders are tried
/// first and saves go there.
pub fn fp16_registry(root: &Path, values: Value) -> ModelRegistry {
    let resolver = WeightResolver::new(
        ResolverSettings {
            fp16: true,
            ..settings(root, &root.join(".cache"))
        },
        Arc::new(OfflineHub),
        Arc::new(OfflineFetcher),
    );
    let loader = ModelLoader::new(Arc::new(component_registry()), SafetyPolicy::Block, true);
    ModelRegistry::new(Arc::new(descriptors(values)), resolver, loader)
}

/// One component handed to a [`RecordingWriter`].
#[derive(Debug, Clone)]
pub struct WrittenModel {
    pub dir: PathBuf,
    pub class_name: String,
    pub config: Value,
}

/// Writer double: creates the folder and records what would be written.
#[derive(Default)]
pub struct RecordingWriter {
    pub written: Mutex<Vec<WrittenModel>>,
}

impl RecordingWriter {
    pub fn dirs(&self, root: &Path) -> Vec<String> {
        let mut dirs: Vec<String> = self
            .written
            .lock()
            .iter()
            .map(|w| w.dir.strip_prefix(root).unwrap().display().to_string())
            .collect();
        dirs.sort();
        dirs
    }

    pub fn find(&self, dir: &Path) -> Option<WrittenModel> {
        self.written.lock().iter().find(|w| w.dir == dir).cloned()
    }
}

impl ModelWriter for RecordingWriter {
    fn write(&self, model: &Model, dir: &Path) -> Result<(), ModelError> {
        std::fs::create_dir_all(dir)?;
        self.written.lock().push(WrittenModel {
            dir: dir.to_path_buf(),
            class_name: model.class_name().to_string(),
            config: model.config().clone(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

pub struct NamedSampler(pub &'static str);

impl Sampler for NamedSampler {
    fn name(&self) -> &str {
        self.0
    }
}

/// Everything the mock pipelines observed.
#[derive(Debug, Default)]
pub struct PipelineLog {
    pub built: usize,
    pub calls: usize,
    pub components: Vec<Vec<String>>,
    pub last_args: BTreeMap<String, Value>,
    pub last_generators: usize,
    pub last_sampler: Option<String>,
    pub steps_run: usize,
    pub slicing: Option<bool>,
    pub options: Option<Value>,
    /// Placement of every module at the time of the last call.
    pub placements: BTreeMap<String, Placement>,
}

pub type SharedLog = Arc<Mutex<PipelineLog>>;

/// Factory for [`MockPipeline`]. `max_pixels` fails calls whose total pixel
/// count (images x width x height) exceeds it with an out-of-memory error.
pub struct MockPipelineFactory {
    pub manifest: PipelineManifest,
    pub log: SharedLog,
    pub max_pixels: Option<u64>,
    pub reject_options: bool,
}

impl MockPipelineFactory {
    pub fn generator() -> Self {
        Self {
            manifest: PipelineManifest::new()
                .component("vae")
                .component("unet")
                .component("text_encoder")
                .component("tokenizer")
                .component("safety_checker")
                .arguments([
                    "prompt",
                    "negative_prompt",
                    "num_images_per_prompt",
                    "width",
                    "height",
                    "guidance_scale",
                    "prediction_type",
                    "eta",
                    "num_inference_steps",
                    "strength",
                    "generator",
                    "output_type",
                    "return_dict",
                ]),
            log: SharedLog::default(),
            max_pixels: None,
            reject_options: false,
        }
    }

    pub fn depth() -> Self {
        Self {
            manifest: PipelineManifest::new().component("depth_estimator").arguments(["image"]),
            ..Self::generator()
        }
    }
}

impl PipelineFactory for MockPipelineFactory {
    fn manifest(&self) -> PipelineManifest {
        self.manifest.clone()
    }

    fn build(&self, components: ModelSet) -> Result<Box<dyn Pipeline>, PipelineError> {
        let mut log = self.log.lock();
        log.built += 1;
        log.components.push(components.keys().map(str::to_string).collect());
        drop(log);

        Ok(Box::new(MockPipeline {
            manifest: self.manifest.clone(),
            modules: components
                .iter()
                .filter_map(|(name, c)| c.map(|c| (name.to_string(), c.clone())))
                .collect(),
            log: self.log.clone(),
            max_pixels: self.max_pixels,
            reject_options: self.reject_options,
        }))
    }
}

pub struct MockPipeline {
    manifest: PipelineManifest,
    modules: BTreeMap<String, Arc<Model>>,
    log: SharedLog,
    max_pixels: Option<u64>,
    reject_options: bool,
}

impl Pipeline for MockPipeline {
    fn manifest(&self) -> &PipelineManifest {
        &self.manifest
    }

    fn module_names(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    fn module(&self, name: &str) -> Option<Arc<Model>> {
        self.modules.get(name).cloned()
    }

    fn set_module(&mut self, name: &str, module: Arc<Model>) {
        self.modules.insert(name.to_string(), module);
    }

    fn samplers(&self) -> SamplerSet {
        vec![
            ("plms".to_string(), Arc::new(NamedSampler("plms")) as Arc<dyn Sampler>),
            ("ddim".to_string(), Arc::new(NamedSampler("ddim")) as Arc<dyn Sampler>),
            ("k_euler".to_string(), Arc::new(NamedSampler("k_euler")) as Arc<dyn Sampler>),
        ]
    }

    fn set_sampler(&mut self, sampler: Arc<dyn Sampler>) {
        self.log.lock().last_sampler = Some(sampler.name().to_string());
    }

    fn set_slicing(&mut self, enabled: bool) {
        self.log.lock().slicing = Some(enabled);
    }

    fn set_options(&mut self, options: &Value) -> Result<(), PipelineError> {
        if self.reject_options {
            return Err(PipelineError::Failed("unknown option".into()));
        }
        self.log.lock().options = Some(options.clone());
        Ok(())
    }

    fn call(&mut self, call: PipelineCall) -> Result<Tensor, PipelineError> {
        let arg = |name: &str, default: u64| {
            call.args.get(name).and_then(Value::as_u64).unwrap_or(default)
        };
        let prompts = call
            .args
            .get("prompt")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(1) as u64;
        let images = prompts * arg("num_images_per_prompt", 1);
        let pixels = images * arg("width", 512) * arg("height", 512);

        let mut log = self.log.lock();
        log.calls += 1;
        log.last_args = call.args.clone();
        log.last_generators = call.generators.len();
        log.placements = self
            .modules
            .iter()
            .map(|(name, m)| (name.clone(), m.placement().clone()))
            .collect();

        if let Some(max) = self.max_pixels {
            if pixels > max {
                return Err(PipelineError::OutOfMemory(format!("{pixels} pixels")));
            }
        }

        let total = arg("num_inference_steps", 10) as usize;
        let mut steps = 0;
        for step in 0..total {
            if !call.monitor.tick(step, total) {
                break;
            }
            steps += 1;
        }
        log.steps_run = steps;

        Ok(Tensor::zeros(vec![images as usize, 1]))
    }
}

/// Transfer that records every move and can be told to fail on a class.
#[derive(Default)]
pub struct RecordingTransfer {
    pub moves: Mutex<Vec<(String, bool)>>,
    pub reclaims: AtomicUsize,
    pub fail_class: Mutex<Option<String>>,
    pub fractions: Mutex<Vec<(ComputeDevice, f64)>>,
}

impl ModuleTransfer for RecordingTransfer {
    fn to_device(
        &self,
        module: &Arc<Model>,
        device: &ComputeDevice,
        deferred: bool,
    ) -> Result<Arc<Model>, String> {
        if self.fail_class.lock().as_deref() == Some(module.class_name()) {
            return Err("device unavailable".into());
        }
        self.moves.lock().push((module.class_name().to_string(), deferred));
        let placement = if deferred {
            Placement::Deferred(device.clone())
        } else {
            Placement::Device(device.clone())
        };
        Ok(Arc::new(Model::clone(module).with_placement(placement)))
    }

    fn reclaim(&self, _: &ComputeDevice) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }

    fn set_memory_fraction(&self, device: &ComputeDevice, fraction: f64) {
        self.fractions.lock().push((device.clone(), fraction));
    }
}

/// A manager over pipelines written under `root`, plus its collaborators.
pub struct Harness {
    pub manager: EngineManager,
    pub generator: SharedLog,
    pub depth: SharedLog,
    pub transfer: Arc<RecordingTransfer>,
}

pub struct HarnessOptions {
    pub devices: Vec<ComputeDevice>,
    pub vram_level: u8,
    pub generator: MockPipelineFactory,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            devices: vec![ComputeDevice::cpu()],
            vram_level: 0,
            generator: MockPipelineFactory::generator(),
        }
    }
}

pub fn harness(root: &Path, values: Value, options: HarnessOptions) -> Harness {
    let generator = options.generator;
    let depth = MockPipelineFactory::depth();
    let generator_log = generator.log.clone();
    let depth_log = depth.log.clone();

    let mut catalog = PipelineCatalog::new();
    catalog.register("UnifiedPipeline", Arc::new(generator));
    catalog.register("MidasDepthPipeline", Arc::new(depth));

    let transfer = Arc::new(RecordingTransfer::default());
    let manager = EngineManager::new(
        registry(root, values),
        catalog,
        transfer.clone(),
        EngineSettings {
            devices: options.devices,
            vram_level: options.vram_level,
            ..EngineSettings::default()
        },
    )
    .unwrap();

    Harness {
        manager,
        generator: generator_log,
        depth: depth_log,
        transfer,
    }
}

/// Two generate engines sharing one base model and a depth engine.
pub fn standard_engines(root: &Path) -> Value {
    write_pipeline(&root.join("sd"), SD_COMPONENTS, 1.0);
    write_pipeline(&root.join("sd2"), SD_COMPONENTS, 2.0);
    write_pipeline(&root.join("midas"), &[("depth_estimator", "diffusers.AutoencoderKL")], 3.0);
    json!([
        {"id": "sd-v1", "model": "@base", "default": true},
        {"id": "sd-v2", "model": "org/sd2", "local_model": "sd2"},
        {"id": "depth", "task": "depth", "model": "org/midas", "local_model": "midas", "default": true},
        {"id": "off", "model": "@base", "enabled": false},
        {"model_id": "base", "model": "org/sd", "local_model": "sd"}
    ])
}
