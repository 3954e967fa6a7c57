use std::collections::{BTreeMap, HashMap};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;
use rand_distr::{Distribution, Normal};

use onnx_deploy::{
    model::{Attribute, DataType, Dimension, Graph, ModelMetadata, Node, OnnxModel, Tensor, TensorInfo},
    optimization::{DeadNodeElimination, Float16Quantization, OperatorFusion, ShapeInference},
    ComputeTensor, ExecutionEngine, ExecutionOptions, GraphOptimizer,
};

// =====================================================================
// Model construction
// =====================================================================

fn random_values(rng: &mut StdRng, count: usize) -> Vec<f32> {
    let normal = Normal::new(0.0f32, 0.1).unwrap();
    (0..count).map(|_| normal.sample(rng)).collect()
}

/// Conv stem, pooling and a dense classifier over a square image
fn conv_classifier(image_size: usize, channels: usize) -> OnnxModel {
    let mut rng = StdRng::seed_from_u64(42);
    let pooled = image_size / 2 / 2;
    let features = channels * pooled * pooled;

    let nodes = vec![
        Node::new(
            "stem",
            "Conv",
            vec!["images".into(), "stem.weight".into(), "stem.bias".into()],
            vec!["stem_output".into()],
        )
        .with_attribute("kernel_shape", Attribute::Ints(vec![3, 3]))
        .with_attribute("strides", Attribute::Ints(vec![2, 2]))
        .with_attribute("pads", Attribute::Ints(vec![1, 1, 1, 1])),
        Node::new("act", "Relu", vec!["stem_output".into()], vec!["act_output".into()]),
        Node::new("pool", "MaxPool", vec!["act_output".into()], vec!["pool_output".into()])
            .with_attribute("kernel_shape", Attribute::Ints(vec![2, 2]))
            .with_attribute("strides", Attribute::Ints(vec![2, 2])),
        Node::new("flat", "Flatten", vec!["pool_output".into()], vec!["flat_output".into()])
            .with_attribute("axis", Attribute::Int(1)),
        Node::new(
            "fc_matmul",
            "MatMul",
            vec!["flat_output".into(), "fc.weight".into()],
            vec!["fc_matmul_output".into()],
        ),
        Node::new(
            "fc_add",
            "Add",
            vec!["fc_matmul_output".into(), "fc.bias".into()],
            vec!["logits".into()],
        ),
    ];

    let initializers = vec![
        Tensor::from_f32(
            "stem.weight",
            vec![channels as i64, 3, 3, 3],
            &random_values(&mut rng, channels * 27),
        ),
        Tensor::from_f32("stem.bias", vec![channels as i64], &random_values(&mut rng, channels)),
        Tensor::from_f32(
            "fc.weight",
            vec![features as i64, 10],
            &random_values(&mut rng, features * 10),
        ),
        Tensor::from_f32("fc.bias", vec![10], &random_values(&mut rng, 10)),
    ];

    let size = image_size as i64;
    let mut graph = Graph {
        name: "bench".to_string(),
        nodes,
        inputs: vec![TensorInfo::new(
            "images",
            DataType::Float,
            vec![Dimension::Value(1), Dimension::Value(3), Dimension::Value(size), Dimension::Value(size)],
        )],
        outputs: vec![TensorInfo::new(
            "logits",
            DataType::Float,
            vec![Dimension::Value(1), Dimension::Value(10)],
        )],
        initializers,
        value_info: vec![],
        doc_string: String::new(),
    };
    graph.renumber();

    OnnxModel {
        metadata: ModelMetadata {
            producer_name: "bench".to_string(),
            ir_version: 8,
            ..Default::default()
        },
        graph,
        opset_imports: BTreeMap::from([(String::new(), 17)]),
        metadata_props: vec![],
    }
}

fn image_feed(image_size: usize) -> HashMap<String, ComputeTensor> {
    let mut rng = StdRng::seed_from_u64(7);
    let shape = [1, 3, image_size, image_size];
    let pixels = (0..shape.iter().product::<usize>()).map(|_| rng.gen::<f32>()).collect();
    let tensor = ComputeTensor::from_vec(&shape, pixels, DataType::Float).unwrap();
    HashMap::from([("images".to_string(), tensor)])
}

// =====================================================================
// Benchmarks
// =====================================================================

fn bench_engine_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_run");
    group.sample_size(20);

    for &size in &[32usize, 64, 128] {
        let engine = ExecutionEngine::prepared(conv_classifier(size, 16), ExecutionOptions::new()).unwrap();
        let feed = image_feed(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| engine.run(black_box(feed.clone())).unwrap())
        });
    }
    group.finish();
}

fn bench_optimizer(c: &mut Criterion) {
    let model = conv_classifier(64, 16);
    let optimizer = GraphOptimizer::new()
        .with_pass(Box::new(ShapeInference::new()))
        .with_pass(Box::new(OperatorFusion::new()))
        .with_pass(Box::new(DeadNodeElimination::new()))
        .with_pass(Box::new(Float16Quantization::new()));

    c.bench_function("optimize_float16", |b| {
        b.iter(|| {
            let mut candidate = model.clone();
            optimizer.run_passes(black_box(&mut candidate)).unwrap()
        })
    });
}

criterion_group!(benches, bench_engine_run, bench_optimizer);
criterion_main!(benches);
