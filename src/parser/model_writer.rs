use bytes::Bytes;
use prost::Message;

use crate::model::{Attribute, Dimension, Graph, Node, OnnxModel, Tensor, TensorInfo};
use crate::proto::attribute_proto::AttributeType;
use crate::proto::tensor_shape_proto::{self, dimension};
use crate::proto::{
    type_proto, AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    StringStringEntryProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
};

/// Serializes the internal representation back to ONNX wire format
pub struct OnnxModelWriter;

impl OnnxModelWriter {
    /// Encode a model to protobuf bytes
    pub fn write_to_bytes(model: &OnnxModel) -> Bytes {
        Bytes::from(Self::to_proto(model).encode_to_vec())
    }

    pub fn to_proto(model: &OnnxModel) -> ModelProto {
        ModelProto {
            ir_version: model.metadata.ir_version,
            opset_import: model
                .opset_imports
                .iter()
                .map(|(domain, version)| OperatorSetIdProto {
                    domain: domain.clone(),
                    version: *version,
                })
                .collect(),
            producer_name: model.metadata.producer_name.clone(),
            producer_version: model.metadata.producer_version.clone(),
            domain: model.metadata.domain.clone(),
            model_version: model.metadata.model_version,
            doc_string: model.metadata.doc_string.clone(),
            graph: Some(Self::graph_to_proto(&model.graph)),
            metadata_props: model
                .metadata_props
                .iter()
                .map(|(key, value)| StringStringEntryProto {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    fn graph_to_proto(graph: &Graph) -> GraphProto {
        GraphProto {
            node: graph.nodes.iter().map(Self::node_to_proto).collect(),
            name: graph.name.clone(),
            initializer: graph.initializers.iter().map(Self::tensor_to_proto).collect(),
            doc_string: graph.doc_string.clone(),
            input: graph.inputs.iter().map(Self::value_info_to_proto).collect(),
            output: graph.outputs.iter().map(Self::value_info_to_proto).collect(),
            value_info: graph.value_info.iter().map(Self::value_info_to_proto).collect(),
        }
    }

    fn node_to_proto(node: &Node) -> NodeProto {
        NodeProto {
            input: node.inputs.clone(),
            output: node.outputs.clone(),
            name: node.name.clone(),
            op_type: node.op_type.clone(),
            domain: node.domain.clone(),
            attribute: node
                .attributes
                .iter()
                .map(|(name, value)| Self::attribute_to_proto(name, value))
                .collect(),
            doc_string: node.doc_string.clone(),
        }
    }

    fn attribute_to_proto(name: &str, value: &Attribute) -> AttributeProto {
        let mut proto = AttributeProto {
            name: name.to_string(),
            ..Default::default()
        };
        let attr_type = match value {
            Attribute::Float(f) => {
                proto.f = *f;
                AttributeType::Float
            }
            Attribute::Int(i) => {
                proto.i = *i;
                AttributeType::Int
            }
            Attribute::String(s) => {
                proto.s = s.as_bytes().to_vec();
                AttributeType::String
            }
            Attribute::Tensor(t) => {
                proto.t = Some(Self::tensor_to_proto(t));
                AttributeType::Tensor
            }
            Attribute::Floats(values) => {
                proto.floats = values.clone();
                AttributeType::Floats
            }
            Attribute::Ints(values) => {
                proto.ints = values.clone();
                AttributeType::Ints
            }
            Attribute::Strings(values) => {
                proto.strings = values.iter().map(|s| s.as_bytes().to_vec()).collect();
                AttributeType::Strings
            }
        };
        proto.r#type = attr_type as i32;
        proto
    }

    fn tensor_to_proto(tensor: &Tensor) -> TensorProto {
        TensorProto {
            dims: tensor.dims.clone(),
            data_type: tensor.data_type.to_proto(),
            name: tensor.name.clone(),
            raw_data: tensor.data.clone(),
            doc_string: tensor.doc_string.clone(),
            ..Default::default()
        }
    }

    fn value_info_to_proto(info: &TensorInfo) -> ValueInfoProto {
        let dim = info
            .shape
            .iter()
            .map(|d| tensor_shape_proto::Dimension {
                denotation: String::new(),
                value: Some(match d {
                    Dimension::Value(v) => dimension::Value::DimValue(*v),
                    Dimension::Param(p) => dimension::Value::DimParam(p.clone()),
                }),
            })
            .collect();

        ValueInfoProto {
            name: info.name.clone(),
            r#type: Some(TypeProto {
                denotation: String::new(),
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: info.data_type.to_proto(),
                    shape: Some(TensorShapeProto { dim }),
                })),
            }),
            doc_string: info.doc_string.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, ModelMetadata};
    use crate::parser::OnnxModelLoader;
    use std::collections::BTreeMap;

    fn tiny_model() -> OnnxModel {
        let node = Node::new("act", "Relu", vec!["x".into()], vec!["y".into()])
            .with_attribute("alpha", Attribute::Float(0.5))
            .with_attribute("perm", Attribute::Ints(vec![0, 2, 1]));
        OnnxModel {
            metadata: ModelMetadata {
                producer_name: "test".into(),
                producer_version: "0".into(),
                domain: String::new(),
                model_version: 1,
                doc_string: String::new(),
                graph_name: "g".into(),
                ir_version: 8,
            },
            graph: Graph {
                name: "g".into(),
                nodes: vec![node],
                inputs: vec![TensorInfo::new(
                    "x",
                    DataType::Float,
                    vec![Dimension::Param("batch".into()), Dimension::Value(4)],
                )],
                outputs: vec![TensorInfo::new(
                    "y",
                    DataType::Float,
                    vec![Dimension::Param("batch".into()), Dimension::Value(4)],
                )],
                initializers: vec![Tensor::from_f32("w", vec![2], &[1.0, 2.0])],
                value_info: Vec::new(),
                doc_string: String::new(),
            },
            opset_imports: BTreeMap::from([(String::new(), 17)]),
            metadata_props: vec![("task".into(), "object-detection".into())],
        }
    }

    #[test]
    fn written_model_loads_back_unchanged() {
        let model = tiny_model();
        let bytes = OnnxModelWriter::write_to_bytes(&model);
        let loaded = OnnxModelLoader::load_model_from_bytes(&bytes).unwrap();
        assert_eq!(loaded, model);
    }
}
