use std::collections::BTreeMap;
use std::fmt;

use half::f16;

use crate::error::{Error, Result};

/// Unique identifier for a node in the graph
pub type NodeId = usize;

/// Metadata about the ONNX model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelMetadata {
    pub producer_name: String,
    pub producer_version: String,
    pub domain: String,
    pub model_version: i64,
    pub doc_string: String,
    pub graph_name: String,
    pub ir_version: i64,
}

/// Dimension information for tensor shapes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    Value(i64),
    Param(String),
}

impl Dimension {
    pub fn value(&self) -> Option<i64> {
        match self {
            Dimension::Value(v) => Some(*v),
            Dimension::Param(_) => None,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Dimension::Param(_))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Value(v) => write!(f, "{}", v),
            Dimension::Param(p) => f.write_str(p),
        }
    }
}

/// Symbolic tensor shape, dynamic axes keep their parameter name
pub type SymbolicShape = Vec<Dimension>;

/// Information about a tensor
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub shape: SymbolicShape,
    pub data_type: DataType,
    pub doc_string: String,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, data_type: DataType, shape: SymbolicShape) -> Self {
        Self {
            name: name.into(),
            shape,
            data_type,
            doc_string: String::new(),
        }
    }

    /// Shape with `-1` in place of every dynamic axis
    pub fn shape_with_wildcards(&self) -> Vec<i64> {
        self.shape.iter().map(|d| d.value().unwrap_or(-1)).collect()
    }

    /// Dynamic axes as (axis index, parameter name)
    pub fn dynamic_axes(&self) -> Vec<(usize, String)> {
        self.shape
            .iter()
            .enumerate()
            .filter_map(|(axis, d)| match d {
                Dimension::Param(p) => Some((axis, p.clone())),
                Dimension::Value(_) => None,
            })
            .collect()
    }
}

/// ONNX data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Undefined,
    Float,
    Uint8,
    Int8,
    Int32,
    Int64,
    Bool,
    Float16,
    Double,
}

impl DataType {
    pub fn from_proto(proto_type: i32) -> Self {
        match proto_type {
            1 => DataType::Float,
            2 => DataType::Uint8,
            3 => DataType::Int8,
            6 => DataType::Int32,
            7 => DataType::Int64,
            9 => DataType::Bool,
            10 => DataType::Float16,
            11 => DataType::Double,
            _ => DataType::Undefined,
        }
    }

    pub fn to_proto(self) -> i32 {
        match self {
            DataType::Undefined => 0,
            DataType::Float => 1,
            DataType::Uint8 => 2,
            DataType::Int8 => 3,
            DataType::Int32 => 6,
            DataType::Int64 => 7,
            DataType::Bool => 9,
            DataType::Float16 => 10,
            DataType::Double => 11,
        }
    }

    /// Size of one element in bytes
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::Undefined => 0,
            DataType::Uint8 | DataType::Int8 | DataType::Bool => 1,
            DataType::Float16 => 2,
            DataType::Float | DataType::Int32 => 4,
            DataType::Int64 | DataType::Double => 8,
        }
    }

    /// Check if the data type is a floating point type
    pub fn is_floating_point(self) -> bool {
        matches!(self, DataType::Float | DataType::Float16 | DataType::Double)
    }
}

/// Initializer tensor, raw little-endian payload
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub data_type: DataType,
    pub dims: Vec<i64>,
    pub data: Vec<u8>,
    pub doc_string: String,
}

impl Tensor {
    fn with_bytes(name: impl Into<String>, data_type: DataType, dims: Vec<i64>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data_type,
            dims,
            data,
            doc_string: String::new(),
        }
    }

    pub fn from_f32(name: impl Into<String>, dims: Vec<i64>, values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::with_bytes(name, DataType::Float, dims, data)
    }

    pub fn from_f16(name: impl Into<String>, dims: Vec<i64>, values: &[f16]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::with_bytes(name, DataType::Float16, dims, data)
    }

    pub fn from_i64(name: impl Into<String>, dims: Vec<i64>, values: &[i64]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::with_bytes(name, DataType::Int64, dims, data)
    }

    pub fn from_i8(name: impl Into<String>, dims: Vec<i64>, values: &[i8]) -> Self {
        let data = values.iter().map(|v| *v as u8).collect();
        Self::with_bytes(name, DataType::Int8, dims, data)
    }

    pub fn from_u8(name: impl Into<String>, dims: Vec<i64>, values: &[u8]) -> Self {
        Self::with_bytes(name, DataType::Uint8, dims, values.to_vec())
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().map(|d| (*d).max(0) as usize).product()
    }

    /// Decode the payload into f32 values, whatever the stored type
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let expected = self.element_count() * self.data_type.size_in_bytes();
        if self.data.len() != expected {
            return Err(Error::InvalidModel(format!(
                "Tensor {} has {} bytes, expected {} for dims {:?}",
                self.name,
                self.data.len(),
                expected,
                self.dims
            )));
        }
        let values = match self.data_type {
            DataType::Float => self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DataType::Float16 => self
                .data
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DataType::Double => self
                .data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect(),
            DataType::Int64 => self
                .data
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect(),
            DataType::Int32 => self
                .data
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
                .collect(),
            DataType::Int8 => self.data.iter().map(|b| *b as i8 as f32).collect(),
            DataType::Uint8 | DataType::Bool => self.data.iter().map(|b| *b as f32).collect(),
            DataType::Undefined => {
                return Err(Error::InvalidModel(format!("Tensor {} has undefined data type", self.name)))
            }
        };
        Ok(values)
    }

    /// Decode an integer payload (shape constants, axes)
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        match self.data_type {
            DataType::Int64 => Ok(self
                .data
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect()),
            DataType::Int32 => Ok(self
                .data
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                .collect()),
            other => Err(Error::InvalidModel(format!(
                "Tensor {} has type {:?}, expected an integer type",
                self.name, other
            ))),
        }
    }
}

/// Node attribute
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    String(String),
    Tensor(Tensor),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
}

/// Node in the computation graph
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, Attribute>,
    pub doc_string: String,
}

impl Node {
    pub fn new(name: impl Into<String>, op_type: &str, inputs: Vec<String>, outputs: Vec<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            op_type: op_type.to_string(),
            domain: String::new(),
            inputs,
            outputs,
            attributes: BTreeMap::new(),
            doc_string: String::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: Attribute) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        match self.attributes.get(name) {
            Some(Attribute::Int(v)) => *v,
            _ => default,
        }
    }

    pub fn get_float(&self, name: &str, default: f32) -> f32 {
        match self.attributes.get(name) {
            Some(Attribute::Float(v)) => *v,
            _ => default,
        }
    }

    pub fn get_ints(&self, name: &str) -> Option<&[i64]> {
        match self.attributes.get(name) {
            Some(Attribute::Ints(v)) => Some(v.as_slice()),
            _ => None,
        }
    }
}

/// Graph structure containing nodes and tensors
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub name: String,
    pub nodes: Vec<Node>,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    pub initializers: Vec<Tensor>,
    pub value_info: Vec<TensorInfo>,
    pub doc_string: String,
}

impl Graph {
    pub fn initializer(&self, name: &str) -> Option<&Tensor> {
        self.initializers.iter().find(|t| t.name == name)
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializer(name).is_some()
    }

    /// Nodes consuming the given tensor
    pub fn consumers(&self, tensor: &str) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.inputs.iter().any(|i| i == tensor))
            .collect()
    }

    /// Renumber node ids after structural edits
    pub fn renumber(&mut self) {
        for (id, node) in self.nodes.iter_mut().enumerate() {
            node.id = id;
        }
    }

    pub fn initializer_bytes(&self) -> usize {
        self.initializers.iter().map(|t| t.data.len()).sum()
    }
}

/// The complete ONNX model
#[derive(Debug, Clone, PartialEq)]
pub struct OnnxModel {
    pub metadata: ModelMetadata,
    pub graph: Graph,
    pub opset_imports: BTreeMap<String, i64>,
    pub metadata_props: Vec<(String, String)>,
}

impl OnnxModel {
    /// Opset of the default ONNX domain
    pub fn opset_version(&self) -> i64 {
        self.opset_imports.get("").copied().unwrap_or(1)
    }

    pub fn input_names(&self) -> Vec<String> {
        self.graph.inputs.iter().map(|i| i.name.clone()).collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.graph.outputs.iter().map(|o| o.name.clone()).collect()
    }

    pub fn metadata_prop(&self, key: &str) -> Option<&str> {
        self.metadata_props
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_metadata_prop(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.metadata_props.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.metadata_props.push((key.to_string(), value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f16_payload_decodes_to_f32() {
        let values = [f16::from_f32(1.5), f16::from_f32(-0.25)];
        let tensor = Tensor::from_f16("w", vec![2], &values);
        assert_eq!(tensor.data.len(), 4);
        assert_eq!(tensor.to_f32_vec().unwrap(), vec![1.5, -0.25]);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut tensor = Tensor::from_f32("w", vec![3], &[1.0, 2.0, 3.0]);
        tensor.data.truncate(8);
        assert!(tensor.to_f32_vec().is_err());
    }

    #[test]
    fn wildcard_shape_marks_dynamic_axes() {
        let info = TensorInfo::new(
            "input_ids",
            DataType::Int64,
            vec![Dimension::Param("batch_size".into()), Dimension::Value(12)],
        );
        assert_eq!(info.shape_with_wildcards(), vec![-1, 12]);
        assert_eq!(info.dynamic_axes(), vec![(0, "batch_size".to_string())]);
    }
}
