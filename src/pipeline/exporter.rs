//! Lowering of a source model to an ONNX graph.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use log::{debug, info};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::model::{Attribute, DataType, Dimension, Graph, ModelMetadata, Node, OnnxModel, Tensor, TensorInfo};
use crate::optimization::ShapeInference;
use crate::parser::{OnnxModelLoader, OnnxModelWriter, SchemaValidator};
use crate::pipeline::sample::SampleInput;
use crate::pipeline::source::{self, LayerKind, SourceModel};

pub const PRODUCER_NAME: &str = "onnx-deploy";
pub const IR_VERSION: i64 = 8;

/// A serialized graph with the interface it was exported with
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedGraph {
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    pub opset_version: i64,
    pub ir_version: i64,
    pub bytes: Bytes,
}

impl ExportedGraph {
    /// Wrap serialized bytes, reading the interface from the graph itself
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        let model = OnnxModelLoader::load_model_from_bytes(&bytes)?;
        Ok(Self::from_model(&model, bytes))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_bytes(Bytes::from(std::fs::read(path)?))
    }

    /// Serialize a model
    pub fn serialize(model: &OnnxModel) -> Self {
        Self::from_model(model, OnnxModelWriter::write_to_bytes(model))
    }

    fn from_model(model: &OnnxModel, bytes: Bytes) -> Self {
        Self {
            input_names: model.input_names(),
            output_names: model.output_names(),
            opset_version: model.opset_version(),
            ir_version: model.metadata.ir_version,
            bytes,
        }
    }

    pub fn decode(&self) -> Result<OnnxModel> {
        OnnxModelLoader::load_model_from_bytes(&self.bytes)
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// Same ordered input and output names
    pub fn same_interface(&self, other: &ExportedGraph) -> bool {
        self.input_names == other.input_names && self.output_names == other.output_names
    }
}

/// Nodes and initializers produced for a layer sequence
#[derive(Debug, Default)]
struct Lowering {
    nodes: Vec<Node>,
    initializers: Vec<Tensor>,
}

impl Lowering {
    fn weight(&mut self, model: &SourceModel, layer: &str, param: &str) -> Result<String> {
        let array = model.weight(layer, param)?;
        let name = format!("{}.{}", layer, param);
        let dims = array.shape().iter().map(|d| *d as i64).collect();
        let values: Vec<f32> = array.iter().copied().collect();
        self.initializers.push(Tensor::from_f32(name.clone(), dims, &values));
        Ok(name)
    }

    fn ints(&mut self, name: String, values: &[i64]) -> String {
        self.initializers
            .push(Tensor::from_i64(name.clone(), vec![values.len() as i64], values));
        name
    }

    fn node(&mut self, node: Node) -> String {
        let output = node.outputs[0].clone();
        self.nodes.push(node);
        output
    }
}

/// Traces source models into ONNX graphs
pub struct GraphExporter<'a> {
    config: &'a PipelineConfig,
    schemas: SchemaValidator,
}

impl<'a> GraphExporter<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            schemas: SchemaValidator::new(),
        }
    }

    /// Export `model` with the interface of `sample`
    pub fn export(&self, model: &SourceModel, sample: &SampleInput) -> Result<ExportedGraph> {
        let model_id = model.descriptor.model_id.as_str();
        let opset = self.config.opset_version;
        let expected_inputs = source::input_names(model.task());
        if sample.names() != expected_inputs {
            return Err(Error::export(
                model_id,
                format!("sample inputs {:?} do not match {:?}", sample.names(), expected_inputs),
            ));
        }

        let lowering = self.lower(model, sample)?;
        for node in &lowering.nodes {
            self.schemas.check_operator_support(&node.op_type, opset)?;
        }

        let inputs = sample
            .entries()
            .iter()
            .map(|(name, tensor)| {
                let mut shape: Vec<Dimension> = tensor.shape.iter().map(|d| Dimension::Value(*d as i64)).collect();
                for (axis, param) in sample.dynamic_axes_of(name) {
                    if let Some(dim) = shape.get_mut(*axis) {
                        *dim = Dimension::Param(param.clone());
                    }
                }
                TensorInfo::new(name.clone(), tensor.data_type, shape)
            })
            .collect();

        let output_name = source::output_name(model.task());
        let mut onnx = OnnxModel {
            metadata: ModelMetadata {
                producer_name: PRODUCER_NAME.to_string(),
                producer_version: env!("CARGO_PKG_VERSION").to_string(),
                domain: String::new(),
                model_version: 1,
                doc_string: format!("{} exported from {}", model.task(), model_id),
                graph_name: model.artifact_name(),
                ir_version: IR_VERSION,
            },
            graph: Graph {
                name: model.artifact_name(),
                nodes: lowering.nodes,
                inputs,
                outputs: vec![TensorInfo::new(output_name, DataType::Float, vec![])],
                initializers: lowering.initializers,
                value_info: vec![],
                doc_string: String::new(),
            },
            opset_imports: BTreeMap::from([(String::new(), opset)]),
            metadata_props: vec![],
        };
        onnx.graph.renumber();
        onnx.set_metadata_prop("source_model", model_id);
        onnx.set_metadata_prop("revision", model.descriptor.revision.as_str());
        onnx.set_metadata_prop("task", model.task().to_string());

        let inferred = ShapeInference::new()
            .infer(&onnx)
            .map_err(|e| Error::export(model_id, format!("shape mismatch while tracing: {}", e)))?;
        let output = inferred
            .get(output_name)
            .cloned()
            .ok_or_else(|| Error::export(model_id, format!("cannot infer the shape of {}", output_name)))?;
        debug!("Output {} has shape {:?}", output_name, output.shape);
        onnx.graph.outputs = vec![output];

        let exported = ExportedGraph::serialize(&onnx);
        self.check_round_trip(model_id, &exported, &onnx)?;
        info!(
            "Exported {}: {} nodes, opset {}, {} bytes",
            model_id,
            onnx.graph.nodes.len(),
            opset,
            exported.size_bytes()
        );
        Ok(exported)
    }

    /// Decode the written bytes and compare against what was declared
    fn check_round_trip(&self, model_id: &str, exported: &ExportedGraph, declared: &OnnxModel) -> Result<()> {
        let decoded = exported
            .decode()
            .map_err(|e| Error::export(model_id, format!("written graph does not decode: {}", e)))?;
        if decoded.input_names() != declared.input_names() || decoded.output_names() != declared.output_names() {
            return Err(Error::export(
                model_id,
                format!(
                    "interface changed on write: {:?} -> {:?}",
                    declared.output_names(),
                    decoded.output_names()
                ),
            ));
        }
        self.schemas
            .validate_model(&decoded)
            .map_err(|e| Error::export(model_id, e.to_string()))
    }

    fn lower(&self, model: &SourceModel, sample: &SampleInput) -> Result<Lowering> {
        let mut lowering = Lowering::default();
        let mut current = sample.names()[0].to_string();

        for layer in &model.config.layers {
            let name = layer.name.as_str();
            let out = format!("{}_output", name);
            current = match &layer.kind {
                LayerKind::Conv2d { kernel, stride, padding, .. } => {
                    let w = lowering.weight(model, name, "weight")?;
                    let b = lowering.weight(model, name, "bias")?;
                    let (k, s, p) = (*kernel as i64, *stride as i64, *padding as i64);
                    lowering.node(
                        Node::new(name, "Conv", vec![current, w, b], vec![out])
                            .with_attribute("kernel_shape", Attribute::Ints(vec![k, k]))
                            .with_attribute("strides", Attribute::Ints(vec![s, s]))
                            .with_attribute("pads", Attribute::Ints(vec![p, p, p, p])),
                    )
                }
                LayerKind::Relu => lowering.node(Node::new(name, "Relu", vec![current], vec![out])),
                LayerKind::Sigmoid => lowering.node(Node::new(name, "Sigmoid", vec![current], vec![out])),
                LayerKind::Tanh => lowering.node(Node::new(name, "Tanh", vec![current], vec![out])),
                LayerKind::Gelu => lowering.node(Node::new(name, "Gelu", vec![current], vec![out])),
                LayerKind::MaxPool { kernel, stride } => {
                    let k = *kernel as i64;
                    let s = stride.unwrap_or(*kernel) as i64;
                    lowering.node(
                        Node::new(name, "MaxPool", vec![current], vec![out])
                            .with_attribute("kernel_shape", Attribute::Ints(vec![k, k]))
                            .with_attribute("strides", Attribute::Ints(vec![s, s])),
                    )
                }
                LayerKind::GlobalAvgPool => {
                    lowering.node(Node::new(name, "GlobalAveragePool", vec![current], vec![out]))
                }
                LayerKind::Flatten => lowering.node(
                    Node::new(name, "Flatten", vec![current], vec![out]).with_attribute("axis", Attribute::Int(1)),
                ),
                LayerKind::Dense { .. } => {
                    let w = lowering.weight(model, name, "weight")?;
                    let b = lowering.weight(model, name, "bias")?;
                    let product = lowering.node(Node::new(
                        format!("{}_matmul", name),
                        "MatMul",
                        vec![current, w],
                        vec![format!("{}_matmul_output", name)],
                    ));
                    lowering.node(Node::new(format!("{}_add", name), "Add", vec![product, b], vec![out]))
                }
                LayerKind::DetectionHead => {
                    let w = lowering.weight(model, name, "weight")?;
                    let b = lowering.weight(model, name, "bias")?;
                    let rows = model.weight(name, "bias")?.len() as i64;
                    let conv = lowering.node(
                        Node::new(
                            format!("{}_conv", name),
                            "Conv",
                            vec![current, w, b],
                            vec![format!("{}_conv_output", name)],
                        )
                        .with_attribute("kernel_shape", Attribute::Ints(vec![1, 1])),
                    );
                    let shape = lowering.ints(format!("{}_shape", name), &[0, rows, -1]);
                    let flat = lowering.node(Node::new(
                        format!("{}_reshape", name),
                        "Reshape",
                        vec![conv, shape],
                        vec![format!("{}_reshape_output", name)],
                    ));
                    lowering.node(Node::new(format!("{}_sigmoid", name), "Sigmoid", vec![flat], vec![out]))
                }
                LayerKind::Embedding { .. } => {
                    let table = lowering.weight(model, name, "weight")?;
                    lowering.node(
                        Node::new(name, "Gather", vec![table, current], vec![out])
                            .with_attribute("axis", Attribute::Int(0)),
                    )
                }
                LayerKind::AttentionMask => {
                    let cast = lowering.node(
                        Node::new(
                            format!("{}_cast", name),
                            "Cast",
                            vec![source::MASK_INPUT.to_string()],
                            vec![format!("{}_float", name)],
                        )
                        .with_attribute("to", Attribute::Int(DataType::Float.to_proto() as i64)),
                    );
                    let axes = lowering.ints(format!("{}_axes", name), &[-1]);
                    let mask = lowering.node(Node::new(
                        format!("{}_unsqueeze", name),
                        "Unsqueeze",
                        vec![cast, axes],
                        vec![format!("{}_expanded", name)],
                    ));
                    lowering.node(Node::new(format!("{}_mul", name), "Mul", vec![current, mask], vec![out]))
                }
                LayerKind::LayerNorm { epsilon } => {
                    let w = lowering.weight(model, name, "weight")?;
                    let b = lowering.weight(model, name, "bias")?;
                    lowering.node(
                        Node::new(name, "LayerNormalization", vec![current, w, b], vec![out])
                            .with_attribute("axis", Attribute::Int(-1))
                            .with_attribute("epsilon", Attribute::Float(*epsilon)),
                    )
                }
                LayerKind::Custom { op } => {
                    return Err(Error::UnsupportedOperator {
                        op_type: op.clone(),
                        detail: format!("layer '{}' has no ONNX lowering", name),
                    })
                }
            };
        }

        // The last tensor takes the task's output name
        let output_name = source::output_name(model.task());
        match lowering.nodes.last_mut() {
            Some(last) => last.outputs[0] = output_name.to_string(),
            None => {
                return Err(Error::export(
                    &model.descriptor.model_id,
                    "architecture has no layers",
                ))
            }
        }
        Ok(lowering)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_comparison_ignores_bytes() {
        let a = ExportedGraph {
            input_names: vec!["images".into()],
            output_names: vec!["output0".into()],
            opset_version: 17,
            ir_version: IR_VERSION,
            bytes: Bytes::from_static(b"a"),
        };
        let mut b = a.clone();
        b.bytes = Bytes::from_static(b"bb");
        assert!(a.same_interface(&b));
        b.output_names = vec!["logits".into()];
        assert!(!a.same_interface(&b));
    }
}
