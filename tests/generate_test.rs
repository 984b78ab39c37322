//! Integration tests for generation: argument filtering, samplers, seeds,
//! step monitoring and batch autodetection.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use common::{harness, standard_engines, Harness, HarnessOptions, MockPipelineFactory};
use gyre_engine::engine::{
    ComputeDevice, EngineError, EngineMode, GenerateRequest, HostTransfer, PipelineFactory,
    PipelineWrapper, Seed, StepMonitor,
};
use gyre_engine::models::ModelSet;

fn loaded(root: &std::path::Path, options: HarnessOptions) -> Harness {
    let h = harness(root, standard_engines(root), options);
    let report = h.manager.load_engines();
    assert!(report.failed.is_empty());
    h
}

#[test]
fn test_default_request_passes_without_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let h = loaded(dir.path(), HarnessOptions::default());

    let output = h
        .manager
        .generate(None, GenerateRequest::new(["a lighthouse"]), StepMonitor::new())
        .unwrap();
    assert!(output.warnings.is_empty(), "{:?}", output.warnings);
    assert_eq!(output.images.shape(), &[1, 1]);

    let log = h.generator.lock();
    assert_eq!(log.calls, 1);
    assert_eq!(log.last_args["prompt"], json!(["a lighthouse"]));
    assert_eq!(log.last_args["num_inference_steps"], json!(50));
    assert_eq!(log.last_args["output_type"], json!("tensor"));
    assert!(!log.last_args.contains_key("scheduler_noise_type"));
}

#[test]
fn test_unsupported_arguments_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let h = loaded(dir.path(), HarnessOptions::default());

    let mut request = GenerateRequest::new(["a lighthouse"]);
    request.clip_guidance_scale = Some(1.0);
    request.tiling = true;
    let output = h.manager.generate(None, request, StepMonitor::new()).unwrap();

    assert_eq!(
        output.warnings,
        vec![
            "Pipeline doesn't understand argument clip_guidance_scale (set to 1.0) - ignoring",
            "Pipeline doesn't understand argument tiling (set to true) - ignoring",
        ]
    );
    let log = h.generator.lock();
    assert!(!log.last_args.contains_key("clip_guidance_scale"));
    assert!(!log.last_args.contains_key("tiling"));
}

#[test]
fn test_sampler_selection() {
    let dir = tempfile::tempdir().unwrap();
    let h = loaded(dir.path(), HarnessOptions::default());

    let output = h
        .manager
        .generate(Some("sd-v1"), GenerateRequest::new(["a"]), StepMonitor::new())
        .unwrap();
    assert_eq!(output.sampler, "plms");
    assert_eq!(h.generator.lock().last_sampler.as_deref(), Some("plms"));

    let mut request = GenerateRequest::new(["a"]);
    request.sampler = Some("ddim".into());
    let output = h.manager.generate(Some("sd-v1"), request, StepMonitor::new()).unwrap();
    assert_eq!(output.sampler, "ddim");

    let mut request = GenerateRequest::new(["a"]);
    request.sampler = Some("nope".into());
    let err = h.manager.generate(Some("sd-v1"), request, StepMonitor::new()).unwrap_err();
    assert!(matches!(err, EngineError::UnknownSampler(ref s) if s == "nope"));
    assert_eq!(err.http_status(), 404);
    assert_eq!(h.manager.device_pool().available(), 1);
}

#[test]
fn test_seeds_become_generators() {
    let dir = tempfile::tempdir().unwrap();
    let h = loaded(dir.path(), HarnessOptions::default());

    let mut request = GenerateRequest::new(["a", "b"]);
    request.seed = Some(Seed::Each(vec![7, 8]));
    h.manager.generate(None, request, StepMonitor::new()).unwrap();
    assert_eq!(h.generator.lock().last_generators, 2);

    let mut request = GenerateRequest::new(["a", "b"]);
    request.seed = Some(Seed::One(42));
    h.manager.generate(None, request, StepMonitor::new()).unwrap();
    assert_eq!(h.generator.lock().last_generators, 1);

    let mut request = GenerateRequest::new(["a", "b"]);
    request.seed = Some(Seed::Each(vec![7]));
    let err = h.manager.generate(None, request, StepMonitor::new()).unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
    assert_eq!(err.http_status(), 400);
}

#[test]
fn test_progress_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let h = loaded(dir.path(), HarnessOptions::default());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let monitor = StepMonitor::new().with_progress(Arc::new(move |step: usize, total: usize| {
        sink.lock().push((step, total));
    }));
    let mut request = GenerateRequest::new(["a"]);
    request.num_inference_steps = 4;
    h.manager.generate(None, request, monitor).unwrap();
    assert_eq!(*seen.lock(), vec![(0, 4), (1, 4), (2, 4), (3, 4)]);
    assert_eq!(h.generator.lock().steps_run, 4);

    // A stop request ends the run early but is not an error.
    let stop = Arc::new(AtomicBool::new(true));
    let output = h
        .manager
        .generate(None, GenerateRequest::new(["a"]), StepMonitor::new().with_stop(stop))
        .unwrap();
    assert_eq!(output.images.shape(), &[1, 1]);
    assert_eq!(h.generator.lock().steps_run, 0);
}

#[test]
fn test_out_of_memory_is_typed() {
    let dir = tempfile::tempdir().unwrap();
    let h = loaded(
        dir.path(),
        HarnessOptions {
            generator: MockPipelineFactory {
                max_pixels: Some(512 * 512),
                ..MockPipelineFactory::generator()
            },
            ..HarnessOptions::default()
        },
    );

    let mut request = GenerateRequest::new(["a"]);
    request.num_images_per_prompt = 2;
    let err = h.manager.generate(None, request, StepMonitor::new()).unwrap_err();
    assert!(err.is_out_of_memory(), "{err}");
    assert_eq!(h.manager.device_pool().available(), 1);

    // The same pipeline keeps serving smaller requests.
    h.manager
        .generate(None, GenerateRequest::new(["a"]), StepMonitor::new())
        .unwrap();
    assert_eq!(h.generator.lock().built, 1);
}

#[test]
fn test_generation_requires_a_generate_engine() {
    let dir = tempfile::tempdir().unwrap();
    let h = loaded(dir.path(), HarnessOptions::default());

    let err = h
        .manager
        .generate(Some("depth"), GenerateRequest::new(["a"]), StepMonitor::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::WrongTask { .. }));

    let err = h
        .manager
        .with_engine(Some("depth"), Some("depth"), |p| {
            assert!(!p.can_generate());
            assert!(p.sampler_names().is_empty());
            p.generate(GenerateRequest::new(["a"]), StepMonitor::new())
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::Capability(_)), "{err}");

    // Plain pipelines still run with raw arguments.
    let image = h
        .manager
        .with_engine(Some("depth"), Some("depth"), |p| {
            let args = BTreeMap::from([("image".to_string(), json!("depth-input"))]);
            p.run(args, StepMonitor::new())
        })
        .unwrap();
    assert_eq!(image.shape(), &[1, 1]);
    assert_eq!(h.depth.lock().calls, 1);
}

#[test]
fn test_wrapper_activation_states() {
    let factory = MockPipelineFactory::generator();
    let pipeline = factory.build(ModelSet::new()).unwrap();
    let mut wrapper = PipelineWrapper::for_generate(
        "sd",
        EngineMode::default(),
        pipeline,
        Arc::new(HostTransfer),
    );
    assert_eq!(wrapper.sampler_names(), vec!["plms", "ddim", "k_euler"]);

    let err = wrapper
        .generate(GenerateRequest::new(["a"]), StepMonitor::new())
        .unwrap_err();
    assert!(err.to_string().contains("must be activated"), "{err}");

    let device = ComputeDevice::cpu();
    wrapper.activate(&device).unwrap();
    assert_eq!(wrapper.device(), Some(&device));
    let err = wrapper.activate(&device).unwrap_err();
    assert_eq!(err.to_string(), "Pipeline sd is already active on cpu");

    wrapper.deactivate().unwrap();
    assert!(!wrapper.is_active());
    let err = wrapper.deactivate().unwrap_err();
    assert_eq!(err.to_string(), "Pipeline sd is not active");
}

#[tokio::test]
async fn test_generate_async_runs_off_the_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let h = loaded(dir.path(), HarnessOptions::default());
    let manager = Arc::new(h.manager);

    let first = manager
        .clone()
        .generate_async(None, GenerateRequest::new(["a"]), StepMonitor::new());
    let second = manager.clone().generate_async(
        Some("sd-v2".to_string()),
        GenerateRequest::new(["b"]),
        StepMonitor::new(),
    );
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap().sampler, "plms");
    assert_eq!(second.unwrap().sampler, "plms");
    assert_eq!(h.generator.lock().calls, 2);
    assert_eq!(manager.device_pool().available(), 1);
}

#[test]
fn test_batch_autodetect_uses_default_engine() {
    let dir = tempfile::tempdir().unwrap();
    let h = loaded(
        dir.path(),
        HarnessOptions {
            generator: MockPipelineFactory {
                max_pixels: Some(6 * 512 * 512),
                ..MockPipelineFactory::generator()
            },
            ..HarnessOptions::default()
        },
    );

    let points = h.manager.run_batch_autodetect().unwrap();
    assert_eq!(
        points,
        vec![
            (512 * 512, 6),
            (768 * 512, 4),
            (1024 * 512, 3),
            (1280 * 512, 2),
            (1536 * 512, 1),
        ]
    );
    assert_eq!(h.manager.batch_mode().points, points);
    assert_eq!(h.manager.batchmax(512 * 512), 6);
    assert_eq!(h.manager.batchmax(1280 * 512), 2);

    // Memory is capped during the trials, then released.
    let fractions = h.transfer.fractions.lock().clone();
    assert_eq!(fractions.len(), 2);
    assert!((fractions[0].1 - 0.8).abs() < 1e-9);
    assert_eq!(fractions[1].1, 1.0);

    let log = h.generator.lock();
    assert_eq!(log.last_args["num_inference_steps"], json!(8));
    assert_eq!(log.last_args["width"], json!(1280));
    assert_eq!(log.last_args["height"], json!(512));
}

#[test]
fn test_batch_autodetect_needs_default_engine() {
    let dir = tempfile::tempdir().unwrap();
    common::write_pipeline(&dir.path().join("sd"), common::SD_COMPONENTS, 1.0);
    let h = harness(
        dir.path(),
        json!([{"id": "sd", "model": "org/sd", "local_model": "sd"}]),
        HarnessOptions::default(),
    );
    h.manager.load_engines();
    assert!(matches!(
        h.manager.run_batch_autodetect(),
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(h.manager.batchmax(512 * 512), 1);
}
