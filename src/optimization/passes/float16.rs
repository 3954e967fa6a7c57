use std::time::Instant;

use half::f16;

use crate::error::Result;
use crate::model::{Attribute, DataType, Node, OnnxModel, Tensor};
use crate::optimization::graph_optimizer::{OptimizationPass, PassResult};

/// Initializers smaller than this stay in float32
pub const MIN_QUANTIZED_ELEMENTS: usize = 16;

/// Stores float weights as float16 and casts them back to float at load
#[derive(Debug, Default)]
pub struct Float16Quantization;

impl Float16Quantization {
    pub fn new() -> Self {
        Self
    }
}

impl OptimizationPass for Float16Quantization {
    fn name(&self) -> &str {
        "Float16Quantization"
    }

    fn run(&self, model: &mut OnnxModel) -> Result<PassResult> {
        let start_time = Instant::now();
        let graph = &mut model.graph;

        let mut casts = Vec::new();
        for initializer in graph.initializers.iter_mut() {
            if initializer.data_type != DataType::Float
                || initializer.element_count() < MIN_QUANTIZED_ELEMENTS
            {
                continue;
            }

            let values: Vec<f16> = initializer
                .to_f32_vec()?
                .into_iter()
                .map(f16::from_f32)
                .collect();
            let original = initializer.name.clone();
            let stored = format!("{}_fp16", original);
            *initializer = Tensor::from_f16(stored.clone(), initializer.dims.clone(), &values);

            casts.push(
                Node::new(format!("{}_cast", original), "Cast", vec![stored], vec![original])
                    .with_attribute("to", Attribute::Int(DataType::Float.to_proto() as i64)),
            );
        }

        let count = casts.len();
        // Casts read initializers only, so they lead the graph
        casts.append(&mut graph.nodes);
        graph.nodes = casts;
        graph.renumber();

        Ok(PassResult {
            name: self.name().to_string(),
            optimizations_applied: count,
            duration: start_time.elapsed(),
            changed: count > 0,
        })
    }

    fn dependencies(&self) -> Vec<&str> {
        vec!["DeadNodeElimination"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Graph, TensorInfo};
    use std::collections::BTreeMap;

    #[test]
    fn large_weights_shrink_and_keep_their_name() {
        let weights: Vec<f32> = (0..32).map(|v| v as f32 * 0.1).collect();
        let mut model = OnnxModel {
            metadata: Default::default(),
            graph: Graph {
                name: "g".into(),
                nodes: vec![Node::new("mm", "MatMul", vec!["x".into(), "w".into()], vec!["y".into()])],
                inputs: vec![TensorInfo::new("x", DataType::Float, vec![])],
                outputs: vec![TensorInfo::new("y", DataType::Float, vec![])],
                initializers: vec![
                    Tensor::from_f32("w", vec![4, 8], &weights),
                    Tensor::from_f32("b", vec![8], &[0.0; 8]),
                ],
                value_info: vec![],
                doc_string: String::new(),
            },
            opset_imports: BTreeMap::new(),
            metadata_props: vec![],
        };
        let before = model.graph.initializer_bytes();

        let result = Float16Quantization::new().run(&mut model).unwrap();
        assert_eq!(result.optimizations_applied, 1);
        assert!(model.graph.initializer_bytes() < before);
        assert_eq!(model.graph.nodes[0].op_type, "Cast");
        assert_eq!(model.graph.nodes[0].outputs, vec!["w"]);
        assert_eq!(model.graph.initializer("w_fp16").unwrap().data_type, DataType::Float16);
        assert_eq!(model.graph.initializer("b").unwrap().data_type, DataType::Float);
    }
}
