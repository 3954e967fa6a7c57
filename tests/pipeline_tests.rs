mod common;

use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ndarray::{ArrayD, IxDyn};
use serde_json::{json, Value};

use common::{detector_config, text_config, Fixture, CONSTRUCTION_CLASSES};
use onnx_deploy::{
    error::Result,
    model::{OnnxModel, Tensor},
    pipeline::{
        repository::FetchError, DeploymentArtifact, ExportedGraph, LocalRepository, ModelRepository,
        SourceModelLoader, REGISTRY_FILE,
    },
    verify_artifact, Error, OptimizationPass, PassResult, Pipeline, PipelineConfig, QuantizationMode, Stage,
    TargetDevice,
};

const DETECTOR: &str = "acme/detector";

fn run_single(config: PipelineConfig) -> DeploymentArtifact {
    let mut results = Pipeline::new(config).run().unwrap();
    assert_eq!(results.len(), 1);
    match results.remove(0) {
        Ok(artifact) => artifact,
        Err(e) => panic!("pipeline failed: {}", e),
    }
}

fn read_info(artifact: &DeploymentArtifact) -> Value {
    serde_json::from_slice(&fs::read(&artifact.paths.metadata).unwrap()).unwrap()
}

/// Fails every run, standing in for a broken rewrite
struct SabotagePass;

impl OptimizationPass for SabotagePass {
    fn name(&self) -> &str {
        "Sabotage"
    }

    fn run(&self, _model: &mut OnnxModel) -> Result<PassResult> {
        Err(Error::OptimizationFailure {
            pass: self.name().to_string(),
            reason: "numeric instability".to_string(),
        })
    }
}

/// Rewrites the detection head bias, a numerically wrong but well formed graph
struct HeadBiasShift;

impl OptimizationPass for HeadBiasShift {
    fn name(&self) -> &str {
        "HeadBiasShift"
    }

    fn run(&self, model: &mut OnnxModel) -> Result<PassResult> {
        for initializer in model.graph.initializers.iter_mut().filter(|t| t.name == "head.bias") {
            let count = initializer.dims.iter().product::<i64>() as usize;
            *initializer = Tensor::from_f32(initializer.name.clone(), initializer.dims.clone(), &vec![5.0; count]);
        }
        Ok(PassResult {
            name: self.name().to_string(),
            optimizations_applied: 1,
            duration: Duration::ZERO,
            changed: true,
        })
    }
}

/// Local mirror whose first `failures` fetches fail with a transient error
struct FlakyRepository {
    inner: LocalRepository,
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyRepository {
    fn new(fixture: &Fixture, failures: usize) -> Self {
        Self {
            inner: LocalRepository::new(fixture.repo.path()),
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

impl ModelRepository for FlakyRepository {
    fn describe(&self) -> String {
        format!("flaky {}", self.inner.describe())
    }

    fn fetch(
        &self,
        model_id: &str,
        revision: &str,
        file: &str,
        dest: &mut dyn Write,
    ) -> std::result::Result<u64, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchError::Transient("connection reset".to_string()));
        }
        self.inner.fetch(model_id, revision, file, dest)
    }
}

fn write_calibration_images(dir: &std::path::Path, shape: &[usize], count: usize) -> anyhow::Result<()> {
    for i in 0..count {
        let len = shape.iter().product::<usize>();
        let values: Vec<f32> = (0..len).map(|j| ((i * 31 + j) % 256) as f32 / 255.0).collect();
        let array = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        ndarray_npy::write_npy(dir.join(format!("image_{:02}.npy", i)), &array)?;
    }
    Ok(())
}

#[test]
fn test_detector_round_trip_packages_validated_bundle() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());

    let artifact = run_single(fixture.config(&[DETECTOR]));

    assert_eq!(artifact.artifact_name, "acme--detector");
    assert!(artifact.paths.graph.is_file());
    assert!(artifact.paths.classes.as_ref().unwrap().is_file());
    assert!(artifact.metadata.validation.passed);
    assert!(artifact.metadata.optimization.applied);
    assert_eq!(artifact.metadata.optimization.outcome, "optimized");
    verify_artifact(&artifact.paths.graph).unwrap();

    let info = read_info(&artifact);
    assert_eq!(info["filename"], "acme--detector.onnx");
    assert_eq!(info["format"], "onnx");
    assert_eq!(info["version"], "1.0.0");
    assert_eq!(info["input_size"], json!([64, 64]));
    assert_eq!(info["num_classes"], 13);
    assert_eq!(info["classes"]["hardhat"], 0);
    assert_eq!(info["classes"]["fire_extinguisher"], 12);
    assert_eq!(info["quantization"], "none");
    assert_eq!(info["inputs"][0]["name"], "images");
    assert_eq!(info["inputs"][0]["shape"], json!([1, 3, 64, 64]));
    assert_eq!(info["outputs"][0]["name"], "output0");
    assert_eq!(info["outputs"][0]["shape"], json!([1, 17, 64]));
    assert_eq!(info["supported_backends"][0], "CPU");
    let mut backends = artifact.metadata.supported_backends.clone();
    backends.sort();
    let estimated: Vec<String> = info["inference_time_ms"].as_object().unwrap().keys().cloned().collect();
    assert_eq!(estimated, backends);
    assert!(info["inference_time_ms"]["CPU"].as_f64().unwrap() > 0.0);
    assert!(info["checksum"].as_str().unwrap().starts_with("sha256:"));
    assert!(info["validation"]["max_abs_diff"]["output0"].as_f64().unwrap() < 1e-3);
}

#[test]
fn test_class_map_file_keeps_index_order() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());

    let artifact = run_single(fixture.config(&[DETECTOR]));

    let text = fs::read_to_string(artifact.paths.classes.unwrap()).unwrap();
    let positions: Vec<usize> = CONSTRUCTION_CLASSES
        .iter()
        .map(|name| text.find(&format!("\"{}\"", name)).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_runs_are_deterministic_in_interface_and_shapes() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());

    let first = run_single(fixture.config(&[DETECTOR]));
    let second_dir = tempfile::tempdir().unwrap();
    let second = run_single(PipelineConfig {
        output_dir: second_dir.path().to_path_buf(),
        ..fixture.config(&[DETECTOR])
    });

    let a = ExportedGraph::from_file(&first.paths.graph).unwrap();
    let b = ExportedGraph::from_file(&second.paths.graph).unwrap();
    assert!(a.same_interface(&b));
    let (a, b) = (a.decode().unwrap(), b.decode().unwrap());
    assert_eq!(a.graph.inputs, b.graph.inputs);
    assert_eq!(a.graph.outputs, b.graph.outputs);
}

#[test]
fn test_quantized_artifacts_shrink_monotonically() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());

    let mut sizes = Vec::new();
    for mode in [QuantizationMode::None, QuantizationMode::Float16, QuantizationMode::Int8] {
        let output = tempfile::tempdir().unwrap();
        let artifact = run_single(PipelineConfig {
            output_dir: output.path().to_path_buf(),
            quantization: mode,
            calibration_samples: 8,
            allow_validation_failure: true,
            ..fixture.config(&[DETECTOR])
        });
        assert_eq!(artifact.metadata.optimization.outcome, "optimized", "{}", mode);
        assert_eq!(artifact.metadata.quantization, mode);
        sizes.push(artifact.metadata.size_bytes);
    }

    assert!(sizes[2] <= sizes[1], "int8 {} > float16 {}", sizes[2], sizes[1]);
    assert!(sizes[1] <= sizes[0], "float16 {} > none {}", sizes[1], sizes[0]);
}

#[test]
fn test_injected_optimizer_failure_falls_back_to_export() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());

    let skipped_dir = tempfile::tempdir().unwrap();
    let skipped = run_single(PipelineConfig {
        output_dir: skipped_dir.path().to_path_buf(),
        skip_optimization: true,
        ..fixture.config(&[DETECTOR])
    });
    assert_eq!(skipped.metadata.optimization.outcome, "skipped");

    let pipeline = Pipeline::new(fixture.config(&[DETECTOR]))
        .with_pass(Arc::new(|| Box::new(SabotagePass) as Box<dyn OptimizationPass>));
    let artifact = pipeline.run().unwrap().remove(0).unwrap();

    assert!(!artifact.metadata.optimization.applied);
    assert_eq!(artifact.metadata.optimization.outcome, "fallback");
    assert!(artifact
        .metadata
        .optimization
        .fallback_reason
        .as_deref()
        .unwrap()
        .contains("numeric instability"));
    assert!(artifact.metadata.validation.passed);
    assert_eq!(
        fs::read(&artifact.paths.graph).unwrap(),
        fs::read(&skipped.paths.graph).unwrap()
    );
}

#[test]
fn test_existing_artifacts_are_not_replaced_without_overwrite() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());
    let first = run_single(fixture.config(&[DETECTOR]));
    let original = fs::read(&first.paths.graph).unwrap();

    let failure = Pipeline::new(fixture.config(&[DETECTOR]))
        .run()
        .unwrap()
        .remove(0)
        .unwrap_err();
    assert_eq!(failure.stage, Stage::Package);
    assert!(matches!(failure.source, Error::ArtifactWrite(..)));
    assert_eq!(fs::read(&first.paths.graph).unwrap(), original);

    let replaced = run_single(PipelineConfig {
        overwrite: true,
        ..fixture.config(&[DETECTOR])
    });
    verify_artifact(&replaced.paths.graph).unwrap();
}

#[test]
fn test_overwrite_refuses_to_renumber_published_classes() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());
    let deploy = fixture.deploy_dir();
    fs::create_dir_all(&deploy).unwrap();
    fs::write(
        deploy.join("acme--detector_classes.json"),
        r#"{"no_hardhat": 0, "hardhat": 1}"#,
    )
    .unwrap();

    let failure = Pipeline::new(PipelineConfig {
        overwrite: true,
        ..fixture.config(&[DETECTOR])
    })
    .run()
    .unwrap()
    .remove(0)
    .unwrap_err();

    assert_eq!(failure.stage, Stage::Package);
    assert!(failure.to_string().contains("published indices must stay stable"));
    assert!(!deploy.join("acme--detector.onnx").exists());
}

#[test]
fn test_tampered_graph_fails_checksum_verification() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());
    let artifact = run_single(fixture.config(&[DETECTOR]));

    let mut bytes = fs::read(&artifact.paths.graph).unwrap();
    bytes.truncate(bytes.len() / 2);
    fs::write(&artifact.paths.graph, bytes).unwrap();

    let err = verify_artifact(&artifact.paths.graph).unwrap_err();
    assert!(err.to_string().contains("checksum mismatch"));

    let leftovers: Vec<String> = fs::read_dir(fixture.deploy_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with("acme--detector") && name != REGISTRY_FILE)
        .collect();
    assert!(leftovers.is_empty(), "staging files left behind: {:?}", leftovers);
}

#[test]
fn test_construction_safety_detector_at_full_resolution() {
    let fixture = Fixture::new();
    fixture.add_model(
        "construction-safety-detector",
        &json!({
            "task": "object-detection",
            "artifact_name": "hazard_detection_model",
            "layers": [
                {"name": "stem", "kind": "conv2d", "out_channels": 8, "kernel": 8, "stride": 8},
                {"name": "stem_act", "kind": "relu"},
                {"name": "pool", "kind": "max_pool", "kernel": 2},
                {"name": "head", "kind": "detection_head"}
            ]
        }),
    );

    let artifact = run_single(PipelineConfig {
        skip_optimization: true,
        ..fixture.config(&["construction-safety-detector"])
    });

    assert_eq!(
        artifact.paths.graph,
        fixture.deploy_dir().join("hazard_detection_model.onnx")
    );
    let info = read_info(&artifact);
    assert_eq!(info["input_size"], json!([640, 640]));
    assert_eq!(info["num_classes"], CONSTRUCTION_CLASSES.len());
    assert_eq!(info["inputs"][0]["shape"], json!([1, 3, 640, 640]));
    assert_eq!(info["optimization"]["outcome"], "skipped");
}

#[test]
fn test_unsupported_operator_fails_export_without_writing() {
    let fixture = Fixture::new();
    let mut config = detector_config();
    config["layers"]
        .as_array_mut()
        .unwrap()
        .insert(3, json!({"name": "dcn", "kind": "custom", "op": "DeformConv"}));
    fixture.add_model(DETECTOR, &config);

    let failure = Pipeline::new(fixture.config(&[DETECTOR]))
        .run()
        .unwrap()
        .remove(0)
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Export);
    assert_eq!(failure.model, DETECTOR);
    assert!(failure.to_string().contains("DeformConv"));
    assert!(!fixture.deploy_dir().exists());
}

#[test]
fn test_text_model_exports_dynamic_sequence() {
    let fixture = Fixture::new();
    fixture.add_model("acme/assistant", &text_config());

    let artifact = run_single(PipelineConfig {
        opset_version: 20,
        ..fixture.config(&["acme/assistant"])
    });

    assert!(artifact.metadata.validation.passed);
    assert_eq!(
        fs::read(artifact.paths.tokenizer.as_ref().unwrap()).unwrap(),
        fs::read(fixture.model_dir("acme/assistant").join("tokenizer.json")).unwrap()
    );

    let info = read_info(&artifact);
    assert_eq!(info["task"], "text-generation");
    assert_eq!(info["input_size"], json!([16]));
    assert_eq!(info["num_classes"], 0);
    assert_eq!(info["inputs"][0]["name"], "input_ids");
    assert_eq!(info["inputs"][1]["name"], "attention_mask");
    assert_eq!(info["inputs"][0]["shape"], json!([-1, -1]));
    assert_eq!(info["inputs"][0]["dynamic_axes"]["1"], "sequence_length");
    assert_eq!(info["outputs"][0]["name"], "logits");
}

#[test]
fn test_gelu_needs_a_recent_opset() {
    let fixture = Fixture::new();
    fixture.add_model("acme/assistant", &text_config());

    let failure = Pipeline::new(fixture.config(&["acme/assistant"]))
        .run()
        .unwrap()
        .remove(0)
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Export);
    assert!(matches!(failure.source, Error::UnsupportedOperator { ref op_type, .. } if op_type == "Gelu"));
}

#[test]
fn test_fixed_shape_variant_for_npu() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());

    let artifact = run_single(PipelineConfig {
        dynamic_batch: true,
        create_ort: true,
        target_device: TargetDevice::Npu,
        ..fixture.config(&[DETECTOR])
    });

    let fixed = ExportedGraph::from_file(artifact.paths.fixed_graph.as_ref().unwrap())
        .unwrap()
        .decode()
        .unwrap();
    assert!(fixed.graph.inputs[0].dynamic_axes().is_empty());
    assert_eq!(artifact.metadata.formats, vec!["onnx", "onnx-fixed"]);
    assert_eq!(artifact.metadata.supported_backends[0], "NPU_NNAPI");
    assert!(artifact.metadata.inference_time_ms["NPU_NNAPI"] <= artifact.metadata.inference_time_ms["CPU"]);

    // The secondary graph is validated and checksummed like the primary one
    let fixed_validation = artifact.metadata.fixed_validation.as_ref().unwrap();
    assert!(fixed_validation.passed);
    assert!(fixed_validation.max_abs_diff["output0"] < 1e-3);
    assert!(artifact.metadata.fixed_checksum.as_deref().unwrap().starts_with("sha256:"));
    verify_artifact(&artifact.paths.graph).unwrap();

    fs::write(artifact.paths.fixed_graph.as_ref().unwrap(), b"stale").unwrap();
    let err = verify_artifact(&artifact.paths.graph).unwrap_err();
    assert!(err.to_string().contains("checksum mismatch"));
}

#[test]
fn test_dynamic_batch_is_declared_on_images() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());

    let artifact = run_single(PipelineConfig {
        dynamic_batch: true,
        ..fixture.config(&[DETECTOR])
    });

    let info = read_info(&artifact);
    assert_eq!(info["inputs"][0]["shape"], json!([-1, 3, 64, 64]));
    assert_eq!(info["inputs"][0]["dynamic_axes"]["0"], "batch_size");
}

#[test]
fn test_variants_fail_independently_on_a_worker_pool() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());
    fixture.add_model("acme/assistant", &text_config());

    let results = Pipeline::new(PipelineConfig {
        jobs: 2,
        ..fixture.config(&[DETECTOR, "acme/assistant", "acme/missing"])
    })
    .run()
    .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    // Gelu at the default opset
    assert_eq!(results[1].as_ref().unwrap_err().stage, Stage::Export);
    let missing = results[2].as_ref().unwrap_err();
    assert_eq!(missing.stage, Stage::Load);
    assert!(missing.to_string().contains("missing remote artifact config.json"));
}

#[test]
fn test_validate_only_smoke_checks_existing_graph() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());
    let artifact = run_single(fixture.config(&[DETECTOR]));

    let pipeline = Pipeline::new(PipelineConfig {
        models: Vec::new(),
        validate_only: Some(artifact.paths.graph.clone()),
        ..fixture.config(&[])
    });
    let report = pipeline.validate_existing(&artifact.paths.graph).unwrap();
    assert!(report.passed);
    assert!(report.smoke);

    let pipeline = Pipeline::new(PipelineConfig {
        validate_only: Some(artifact.paths.graph.clone()),
        ..fixture.config(&[DETECTOR])
    });
    let report = pipeline.validate_existing(&artifact.paths.graph).unwrap();
    assert!(report.passed);
    assert!(!report.smoke);
}

#[test]
fn test_float16_precision_rejected_for_float32_only_weights() {
    let fixture = Fixture::new();
    let mut config = detector_config();
    config["dtype"] = json!("float32-only");
    fixture.add_model(DETECTOR, &config);

    let failure = Pipeline::new(PipelineConfig {
        precision: onnx_deploy::Precision::Float16,
        ..fixture.config(&[DETECTOR])
    })
    .run()
    .unwrap()
    .remove(0)
    .unwrap_err();

    assert_eq!(failure.stage, Stage::Load);
    assert!(failure.to_string().contains("incompatible precision request"));
}

#[test]
fn test_weights_must_match_architecture() {
    let fixture = Fixture::new();
    let dir = fixture.add_model(DETECTOR, &detector_config());
    let mut changed = detector_config();
    changed["layers"][0]["out_channels"] = json!(16);
    fs::write(dir.join("config.json"), serde_json::to_vec(&changed).unwrap()).unwrap();

    let failure = Pipeline::new(fixture.config(&[DETECTOR]))
        .run()
        .unwrap()
        .remove(0)
        .unwrap_err();
    assert_eq!(failure.stage, Stage::Load);
    assert!(failure.to_string().contains("incompatible weights"));
}

#[test]
fn test_cached_files_are_reused_when_repository_disappears() {
    let fixture = Fixture::new();
    let dir = fixture.add_model(DETECTOR, &detector_config());
    run_single(fixture.config(&[DETECTOR]));

    fs::remove_dir_all(dir).unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let artifact = run_single(PipelineConfig {
        output_dir: second_dir.path().to_path_buf(),
        ..fixture.config(&[DETECTOR])
    });
    assert!(artifact.metadata.validation.passed);
}

#[test]
fn test_int8_requires_calibration_before_any_stage() {
    let fixture = Fixture::new();
    let err = Pipeline::new(PipelineConfig {
        quantization: QuantizationMode::Int8,
        calibration_samples: 0,
        ..fixture.config(&[DETECTOR])
    })
    .run()
    .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_failed_overwrite_keeps_published_bundle_consistent() -> anyhow::Result<()> {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());
    let first = run_single(fixture.config(&[DETECTOR]));
    let original = fs::read(&first.paths.graph)?;

    // Something that cannot be replaced sits where the fixed graph goes
    let blocker = fixture.deploy_dir().join("acme--detector.fixed.onnx");
    fs::create_dir(&blocker)?;
    fs::write(blocker.join("keep"), b"x")?;

    let failure = Pipeline::new(PipelineConfig {
        overwrite: true,
        create_ort: true,
        quantization: QuantizationMode::Float16,
        ..fixture.config(&[DETECTOR])
    })
    .run()?
    .remove(0)
    .unwrap_err();
    assert_eq!(failure.stage, Stage::Package);

    assert_eq!(fs::read(&first.paths.graph)?, original);
    verify_artifact(&first.paths.graph)?;
    let info = read_info(&first);
    assert_eq!(info["quantization"], "none");
    Ok(())
}

#[test]
fn test_numeric_divergence_blocks_packaging() -> anyhow::Result<()> {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());

    let failure = Pipeline::new(fixture.config(&[DETECTOR]))
        .with_pass(Arc::new(|| Box::new(HeadBiasShift) as Box<dyn OptimizationPass>))
        .run()?
        .remove(0)
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Validate);
    match &failure.source {
        Error::ValidationMismatch { summary, .. } => {
            assert!(summary.contains("output0"), "{}", summary);
            assert!(summary.contains("elements outside tolerance"), "{}", summary);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!fixture.deploy_dir().exists());
    Ok(())
}

#[test]
fn test_validation_failure_can_be_downgraded() -> anyhow::Result<()> {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());

    let artifact = Pipeline::new(PipelineConfig {
        allow_validation_failure: true,
        ..fixture.config(&[DETECTOR])
    })
    .with_pass(Arc::new(|| Box::new(HeadBiasShift) as Box<dyn OptimizationPass>))
    .run()?
    .remove(0)?;

    assert!(!artifact.metadata.validation.passed);
    assert!(artifact.metadata.validation.downgraded);
    assert!(artifact.metadata.validation.max_abs_diff["output0"] > 1e-3);
    let info = read_info(&artifact);
    assert_eq!(info["validation"]["downgraded"], true);
    Ok(())
}

#[test]
fn test_transient_fetch_failures_are_retried() -> anyhow::Result<()> {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());
    let config = PipelineConfig {
        retries: 2,
        ..fixture.config(&[DETECTOR])
    };

    let repository = FlakyRepository::new(&fixture, 2);
    let model = SourceModelLoader::new(&config, &repository).load(DETECTOR)?;
    assert_eq!(model.num_classes(), CONSTRUCTION_CLASSES.len());
    // config.json took three attempts, the other files one each
    assert_eq!(repository.calls.load(Ordering::SeqCst), 5);
    Ok(())
}

#[test]
fn test_exhausted_retries_surface_as_load_error() {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());
    let config = PipelineConfig {
        retries: 1,
        ..fixture.config(&[DETECTOR])
    };

    let repository = FlakyRepository::new(&fixture, 10);
    let err = SourceModelLoader::new(&config, &repository).load(DETECTOR).unwrap_err();
    assert!(matches!(err, Error::ModelLoad { .. }));
    assert!(err.to_string().contains("connection reset"), "{}", err);
    assert_eq!(repository.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_concurrent_loads_share_the_cache() -> anyhow::Result<()> {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());
    let config = fixture.config(&[DETECTOR]);
    let repository = LocalRepository::new(fixture.repo.path());

    let results: Vec<Result<usize>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    SourceModelLoader::new(&config, &repository)
                        .load(DETECTOR)
                        .map(|model| model.num_classes())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for result in results {
        assert_eq!(result?, CONSTRUCTION_CLASSES.len());
    }

    let cached = SourceModelLoader::new(&config, &repository).cache_path(DETECTOR);
    let mut names: Vec<String> = fs::read_dir(&cached)?
        .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<_>>()?;
    names.sort();
    assert_eq!(names, vec!["classes.json", "config.json", "model.npz"]);
    Ok(())
}

#[test]
fn test_int8_calibrates_from_image_directory() -> anyhow::Result<()> {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());
    let images = tempfile::tempdir()?;
    write_calibration_images(images.path(), &[1, 3, 64, 64], 4)?;

    let artifact = Pipeline::new(PipelineConfig {
        quantization: QuantizationMode::Int8,
        calibration_dir: Some(images.path().to_path_buf()),
        allow_validation_failure: true,
        ..fixture.config(&[DETECTOR])
    })
    .run()?
    .remove(0)?;

    assert_eq!(artifact.metadata.quantization, QuantizationMode::Int8);
    assert_eq!(artifact.metadata.optimization.outcome, "optimized");
    Ok(())
}

#[test]
fn test_calibration_images_must_match_the_input() -> anyhow::Result<()> {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());
    let images = tempfile::tempdir()?;
    write_calibration_images(images.path(), &[1, 3, 32, 32], 2)?;

    let failure = Pipeline::new(PipelineConfig {
        quantization: QuantizationMode::Int8,
        calibration_dir: Some(images.path().to_path_buf()),
        ..fixture.config(&[DETECTOR])
    })
    .run()?
    .remove(0)
    .unwrap_err();

    assert_eq!(failure.stage, Stage::SampleInputs);
    assert!(failure.to_string().contains("expected [1, 3, 64, 64]"), "{}", failure);
    assert!(!fixture.deploy_dir().exists());
    Ok(())
}

#[test]
fn test_text_model_int8_calibration() -> anyhow::Result<()> {
    let fixture = Fixture::new();
    fixture.add_model("acme/assistant", &text_config());

    let artifact = Pipeline::new(PipelineConfig {
        opset_version: 20,
        quantization: QuantizationMode::Int8,
        calibration_samples: 4,
        allow_validation_failure: true,
        ..fixture.config(&["acme/assistant"])
    })
    .run()?
    .remove(0)?;

    assert_eq!(artifact.metadata.quantization, QuantizationMode::Int8);
    assert_eq!(artifact.metadata.optimization.outcome, "optimized");
    assert!(artifact
        .metadata
        .optimization
        .passes
        .iter()
        .any(|p| p == "Int8Quantization"));
    Ok(())
}

#[test]
fn test_registry_collects_every_packaged_variant() -> anyhow::Result<()> {
    let fixture = Fixture::new();
    fixture.add_model(DETECTOR, &detector_config());
    let mut compact = detector_config();
    compact["layers"][0]["out_channels"] = json!(8);
    fixture.add_model("acme/compact", &compact);

    let deploy = fixture.deploy_dir();
    fs::create_dir_all(&deploy)?;
    fs::write(
        deploy.join(REGISTRY_FILE),
        r#"{"app": "site-inspector", "models": {"legacy_model": {"filename": "legacy_model.onnx"}}}"#,
    )?;

    let results = Pipeline::new(PipelineConfig {
        jobs: 2,
        ..fixture.config(&[DETECTOR, "acme/compact", "acme/missing"])
    })
    .run()?;
    assert!(results[2].is_err());

    let registry: Value = serde_json::from_slice(&fs::read(deploy.join(REGISTRY_FILE))?)?;
    let models = registry["models"].as_object().unwrap();
    let mut names: Vec<&str> = models.keys().map(String::as_str).collect();
    names.sort();
    assert_eq!(names, vec!["acme--compact", "acme--detector", "legacy_model"]);
    assert_eq!(registry["app"], "site-inspector");
    assert_eq!(models["acme--detector"]["filename"], "acme--detector.onnx");
    assert_eq!(models["acme--compact"]["num_classes"], 13);
    assert_eq!(
        models["acme--detector"]["checksum"],
        read_info(results[0].as_ref().unwrap())["checksum"]
    );
    Ok(())
}
