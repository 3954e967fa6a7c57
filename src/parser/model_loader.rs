use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use prost::Message;

use crate::error::{Error, Result};
use crate::model::{
    Attribute, DataType, Dimension, Graph, ModelMetadata, Node, OnnxModel, Tensor, TensorInfo,
};
use crate::proto::attribute_proto::AttributeType;
use crate::proto::tensor_shape_proto::dimension;
use crate::proto::{
    type_proto, AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
    ValueInfoProto,
};

/// ONNX model loader responsible for parsing and loading ONNX models
pub struct OnnxModelLoader;

impl OnnxModelLoader {
    /// Load an ONNX model from a file path
    pub fn load_model(path: &Path) -> Result<OnnxModel> {
        let buffer = fs::read(path).map_err(|e| {
            Error::InvalidModel(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::load_model_from_bytes(&buffer)
    }

    /// Load an ONNX model from bytes
    pub fn load_model_from_bytes(data: &[u8]) -> Result<OnnxModel> {
        let model_proto = Self::deserialize_model_proto(data)?;
        Self::convert_proto_to_internal(model_proto)
    }

    /// Deserialize protobuf bytes into a ModelProto
    pub fn deserialize_model_proto(bytes: &[u8]) -> Result<ModelProto> {
        ModelProto::decode(bytes).map_err(Error::ProtobufError)
    }

    /// Convert protobuf model to internal representation
    pub fn convert_proto_to_internal(mut proto: ModelProto) -> Result<OnnxModel> {
        let graph_proto = proto
            .graph
            .take()
            .ok_or_else(|| Error::MissingField("Model is missing graph".to_string()))?;

        let opset_imports = Self::handle_opset_imports(&proto.opset_import);
        let mut metadata = Self::extract_model_metadata(&proto);
        metadata.graph_name = graph_proto.name.clone();
        let graph = Self::convert_graph_proto(graph_proto)?;

        let metadata_props = proto
            .metadata_props
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();

        Ok(OnnxModel {
            metadata,
            graph,
            opset_imports,
            metadata_props,
        })
    }

    /// Extract model metadata from protobuf
    pub fn extract_model_metadata(proto: &ModelProto) -> ModelMetadata {
        ModelMetadata {
            producer_name: proto.producer_name.clone(),
            producer_version: proto.producer_version.clone(),
            domain: proto.domain.clone(),
            model_version: proto.model_version,
            doc_string: proto.doc_string.clone(),
            graph_name: proto
                .graph
                .as_ref()
                .map(|g| g.name.clone())
                .unwrap_or_default(),
            ir_version: proto.ir_version,
        }
    }

    /// Process opset imports
    pub fn handle_opset_imports(imports: &[OperatorSetIdProto]) -> BTreeMap<String, i64> {
        let mut opset_map = BTreeMap::new();

        // Default opset for the empty domain
        opset_map.insert(String::new(), 1);

        for import in imports {
            // "ai.onnx" is an alias of the default domain
            let domain = if import.domain == "ai.onnx" {
                String::new()
            } else {
                import.domain.clone()
            };
            opset_map.insert(domain, import.version);
        }

        opset_map
    }

    /// Convert a GraphProto to internal Graph representation
    fn convert_graph_proto(graph_proto: GraphProto) -> Result<Graph> {
        let initializers = graph_proto
            .initializer
            .iter()
            .map(Self::convert_tensor_proto)
            .collect::<Result<Vec<_>>>()?;

        let inputs = graph_proto
            .input
            .iter()
            .map(Self::convert_value_info_proto)
            .collect::<Result<Vec<_>>>()?;

        let outputs = graph_proto
            .output
            .iter()
            .map(Self::convert_value_info_proto)
            .collect::<Result<Vec<_>>>()?;

        let value_info = graph_proto
            .value_info
            .iter()
            .map(Self::convert_value_info_proto)
            .collect::<Result<Vec<_>>>()?;

        let nodes = graph_proto
            .node
            .iter()
            .enumerate()
            .map(|(id, node)| Self::convert_node_proto(node, id))
            .collect::<Result<Vec<_>>>()?;

        Ok(Graph {
            name: graph_proto.name,
            nodes,
            inputs,
            outputs,
            initializers,
            value_info,
            doc_string: graph_proto.doc_string,
        })
    }

    /// Convert a NodeProto to internal Node representation
    fn convert_node_proto(node_proto: &NodeProto, id: usize) -> Result<Node> {
        let mut attributes = BTreeMap::new();

        for attr in &node_proto.attribute {
            let value = Self::convert_attribute_proto(attr)?;
            attributes.insert(attr.name.clone(), value);
        }

        Ok(Node {
            id,
            name: node_proto.name.clone(),
            op_type: node_proto.op_type.clone(),
            domain: node_proto.domain.clone(),
            inputs: node_proto.input.clone(),
            outputs: node_proto.output.clone(),
            attributes,
            doc_string: node_proto.doc_string.clone(),
        })
    }

    /// Convert a TensorProto to internal Tensor representation
    fn convert_tensor_proto(tensor_proto: &TensorProto) -> Result<Tensor> {
        let data_type = DataType::from_proto(tensor_proto.data_type);

        let data = if !tensor_proto.raw_data.is_empty() {
            tensor_proto.raw_data.clone()
        } else {
            match data_type {
                DataType::Float => tensor_proto
                    .float_data
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
                DataType::Int64 => tensor_proto
                    .int64_data
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
                DataType::Int32 => tensor_proto
                    .int32_data
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
                // int32_data carries the small integer types, one value per entry
                DataType::Int8 | DataType::Uint8 | DataType::Bool => {
                    tensor_proto.int32_data.iter().map(|v| *v as u8).collect()
                }
                DataType::Float16 => tensor_proto
                    .int32_data
                    .iter()
                    .flat_map(|v| (*v as u16).to_le_bytes())
                    .collect(),
                DataType::Double | DataType::Undefined => {
                    return Err(Error::UnsupportedFeature(format!(
                        "Tensor {} uses a typed data field for {:?}",
                        tensor_proto.name, data_type
                    )))
                }
            }
        };

        Ok(Tensor {
            name: tensor_proto.name.clone(),
            data_type,
            dims: tensor_proto.dims.clone(),
            data,
            doc_string: tensor_proto.doc_string.clone(),
        })
    }

    /// Convert a ValueInfoProto to internal TensorInfo representation
    fn convert_value_info_proto(value_info: &ValueInfoProto) -> Result<TensorInfo> {
        let name = value_info.name.clone();

        let type_proto = value_info
            .r#type
            .as_ref()
            .ok_or_else(|| Error::MissingField(format!("Missing type for value info: {}", name)))?;

        let tensor_type = match &type_proto.value {
            Some(type_proto::Value::TensorType(tensor)) => tensor,
            None => {
                return Err(Error::MissingField(format!(
                    "Missing tensor type for value info: {}",
                    name
                )))
            }
        };

        let shape = match &tensor_type.shape {
            Some(shape) => shape
                .dim
                .iter()
                .map(|dim| match &dim.value {
                    Some(dimension::Value::DimValue(v)) => Ok(Dimension::Value(*v)),
                    Some(dimension::Value::DimParam(p)) => Ok(Dimension::Param(p.clone())),
                    None => Err(Error::MissingField(format!(
                        "Missing dimension value in {}",
                        name
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(TensorInfo {
            name,
            shape,
            data_type: DataType::from_proto(tensor_type.elem_type),
            doc_string: value_info.doc_string.clone(),
        })
    }

    /// Convert an AttributeProto to internal Attribute representation
    fn convert_attribute_proto(attr: &AttributeProto) -> Result<Attribute> {
        let attr_type = AttributeType::from_i32(attr.r#type).ok_or_else(|| {
            Error::InvalidModel(format!("Unknown attribute type {} on {}", attr.r#type, attr.name))
        })?;

        match attr_type {
            AttributeType::Float => Ok(Attribute::Float(attr.f)),
            AttributeType::Int => Ok(Attribute::Int(attr.i)),
            AttributeType::String => Ok(Attribute::String(
                String::from_utf8_lossy(&attr.s).into_owned(),
            )),
            AttributeType::Tensor => match &attr.t {
                Some(t) => Ok(Attribute::Tensor(Self::convert_tensor_proto(t)?)),
                None => Err(Error::MissingField(format!(
                    "Missing tensor in attribute {}",
                    attr.name
                ))),
            },
            AttributeType::Floats => Ok(Attribute::Floats(attr.floats.clone())),
            AttributeType::Ints => Ok(Attribute::Ints(attr.ints.clone())),
            AttributeType::Strings => Ok(Attribute::Strings(
                attr.strings
                    .iter()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect(),
            )),
            AttributeType::Undefined => Err(Error::InvalidModel(format!(
                "Undefined attribute type on {}",
                attr.name
            ))),
            other => Err(Error::UnsupportedFeature(format!(
                "Attribute {} has unsupported type {:?}",
                attr.name, other
            ))),
        }
    }
}
