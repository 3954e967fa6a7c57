use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::model::{Graph, Node, OnnxModel};

/// Schema of an operator the crate can emit and execute
#[derive(Debug, Clone, PartialEq)]
pub struct OpSchema {
    pub name: &'static str,
    /// First opset of the default domain that carries this signature
    pub since_version: i64,
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub outputs: usize,
    pub required_attributes: &'static [&'static str],
}

const fn schema(
    name: &'static str,
    since_version: i64,
    min_inputs: usize,
    max_inputs: usize,
    required_attributes: &'static [&'static str],
) -> OpSchema {
    OpSchema {
        name,
        since_version,
        min_inputs,
        max_inputs,
        outputs: 1,
        required_attributes,
    }
}

/// Operators supported by the exporter, optimizer and execution engine
const DEFAULT_SCHEMAS: &[OpSchema] = &[
    schema("Conv", 11, 2, 3, &[]),
    schema("MaxPool", 12, 1, 1, &["kernel_shape"]),
    schema("GlobalAveragePool", 1, 1, 1, &[]),
    schema("Relu", 13, 1, 1, &[]),
    schema("Sigmoid", 13, 1, 1, &[]),
    schema("Tanh", 13, 1, 1, &[]),
    schema("Gelu", 20, 1, 1, &[]),
    schema("MatMul", 13, 2, 2, &[]),
    schema("Gemm", 13, 2, 3, &[]),
    schema("Add", 13, 2, 2, &[]),
    schema("Mul", 13, 2, 2, &[]),
    schema("Reshape", 13, 2, 2, &[]),
    schema("Flatten", 13, 1, 1, &[]),
    schema("Unsqueeze", 13, 2, 2, &[]),
    schema("Gather", 13, 2, 2, &[]),
    schema("Cast", 13, 1, 1, &["to"]),
    schema("LayerNormalization", 17, 2, 3, &[]),
    schema("QuantizeLinear", 13, 2, 3, &[]),
    schema("DequantizeLinear", 13, 2, 3, &[]),
    schema("Identity", 13, 1, 1, &[]),
];

/// ONNX schema validator responsible for validating model against operator schemas
pub struct SchemaValidator {
    // Registry of operator schemas, default domain only
    schemas: HashMap<&'static str, OpSchema>,

    // Minimum supported IR version
    min_ir_version: i64,

    // Maximum supported IR version
    max_ir_version: i64,
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaValidator {
    /// Create a new schema validator with defaults
    pub fn new() -> Self {
        let mut validator = Self {
            schemas: HashMap::new(),
            min_ir_version: 7,
            max_ir_version: 9,
        };

        for schema in DEFAULT_SCHEMAS {
            validator.register_schema(schema.clone());
        }
        validator
    }

    /// Register a schema in the registry
    pub fn register_schema(&mut self, schema: OpSchema) {
        self.schemas.insert(schema.name, schema);
    }

    /// Get operator schema for a specific operator type
    pub fn get_operator_schema(&self, op_type: &str) -> Option<&OpSchema> {
        self.schemas.get(op_type)
    }

    /// Check that an operator can be emitted at the given opset
    pub fn check_operator_support(&self, op_type: &str, opset_version: i64) -> Result<()> {
        let schema = self
            .get_operator_schema(op_type)
            .ok_or_else(|| Error::UnsupportedOperator {
                op_type: op_type.to_string(),
                detail: "not in the supported operator set".to_string(),
            })?;

        if schema.since_version > opset_version {
            return Err(Error::UnsupportedOperator {
                op_type: op_type.to_string(),
                detail: format!(
                    "requires opset {}, target opset {}",
                    schema.since_version, opset_version
                ),
            });
        }
        Ok(())
    }

    /// Validate the ONNX model
    pub fn validate_model(&self, model: &OnnxModel) -> Result<()> {
        self.check_version_compatibility(model)?;
        self.validate_graph(model)?;
        self.validate_tensor_shapes(&model.graph)?;
        Ok(())
    }

    /// Check if the model IR version is compatible
    pub fn check_version_compatibility(&self, model: &OnnxModel) -> Result<()> {
        let ir_version = model.metadata.ir_version;

        if ir_version < self.min_ir_version || ir_version > self.max_ir_version {
            return Err(Error::ValidationError(format!(
                "IR version {} is not supported (min: {}, max: {})",
                ir_version, self.min_ir_version, self.max_ir_version
            )));
        }

        Ok(())
    }

    /// Validate the graph structure
    pub fn validate_graph(&self, model: &OnnxModel) -> Result<()> {
        let graph = &model.graph;

        // Check for duplicate node names if names are provided
        let mut node_names = HashSet::new();
        for node in &graph.nodes {
            if !node.name.is_empty() && !node_names.insert(&node.name) {
                return Err(Error::InvalidGraph(format!("Duplicate node name: {}", node.name)));
            }
        }

        // Nodes must appear in topological order, every input already defined
        let mut defined: HashSet<&str> = graph.inputs.iter().map(|i| i.name.as_str()).collect();
        defined.extend(graph.initializers.iter().map(|t| t.name.as_str()));

        for node in &graph.nodes {
            let opset_version = match model.opset_imports.get(&node.domain) {
                Some(version) => *version,
                None => {
                    return Err(Error::InvalidOperator(format!(
                        "Unknown operator domain: {}",
                        node.domain
                    )))
                }
            };

            self.validate_node(node, opset_version)?;

            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                if !defined.contains(input.as_str()) {
                    return Err(Error::InvalidGraph(format!(
                        "Node {} reads {} before it is defined",
                        node.name, input
                    )));
                }
            }
            for output in &node.outputs {
                if !defined.insert(output.as_str()) {
                    return Err(Error::InvalidGraph(format!("Duplicate output name: {}", output)));
                }
            }
        }

        for output in &graph.outputs {
            if !defined.contains(output.name.as_str()) {
                return Err(Error::InvalidGraph(format!(
                    "Graph output {} is never produced",
                    output.name
                )));
            }
        }

        Ok(())
    }

    /// Validate a single node
    pub fn validate_node(&self, node: &Node, opset_version: i64) -> Result<()> {
        if !node.domain.is_empty() {
            return Err(Error::InvalidOperator(format!(
                "Unknown operator: {}:{}",
                node.domain, node.op_type
            )));
        }

        self.check_operator_support(&node.op_type, opset_version)?;
        let schema = self
            .get_operator_schema(&node.op_type)
            .ok_or_else(|| Error::InvalidOperator(format!("Unknown operator: {}", node.op_type)))?;

        self.check_inputs(node, schema)?;

        if node.outputs.len() != schema.outputs {
            return Err(Error::ValidationError(format!(
                "Node {} has {} outputs, expected {}",
                node.name,
                node.outputs.len(),
                schema.outputs
            )));
        }

        for name in schema.required_attributes {
            if !node.attributes.contains_key(*name) {
                return Err(Error::ValidationError(format!(
                    "Node {} is missing required attribute {}",
                    node.name, name
                )));
            }
        }

        Ok(())
    }

    /// Check if node inputs match schema
    pub fn check_inputs(&self, node: &Node, schema: &OpSchema) -> Result<()> {
        let count = node.inputs.len();
        if count < schema.min_inputs {
            return Err(Error::ValidationError(format!(
                "Node {} doesn't have enough inputs. Required: {}, Found: {}",
                node.name, schema.min_inputs, count
            )));
        }
        if count > schema.max_inputs {
            return Err(Error::ValidationError(format!(
                "Node {} has too many inputs",
                node.name
            )));
        }
        if node.inputs[..schema.min_inputs].iter().any(|i| i.is_empty()) {
            return Err(Error::ValidationError(format!(
                "Node {} leaves a required input empty",
                node.name
            )));
        }
        Ok(())
    }

    /// Validate initializer payloads and declared input consistency
    pub fn validate_tensor_shapes(&self, graph: &Graph) -> Result<()> {
        for initializer in &graph.initializers {
            let expected = initializer.element_count() * initializer.data_type.size_in_bytes();
            if initializer.data.len() != expected {
                return Err(Error::ValidationError(format!(
                    "Initializer {} has {} bytes, expected {}",
                    initializer.name,
                    initializer.data.len(),
                    expected
                )));
            }

            if let Some(declared) = graph.inputs.iter().find(|i| i.name == initializer.name) {
                if declared.data_type != initializer.data_type {
                    return Err(Error::ValidationError(format!(
                        "Type mismatch for tensor {}: {:?} vs {:?}",
                        initializer.name, declared.data_type, initializer.data_type
                    )));
                }
                let declared_dims = declared.shape_with_wildcards();
                let consistent = declared_dims.len() == initializer.dims.len()
                    && declared_dims
                        .iter()
                        .zip(&initializer.dims)
                        .all(|(&a, &b)| a == -1 || a == b);
                if !consistent {
                    return Err(Error::ValidationError(format!(
                        "Shape mismatch for tensor {}: {:?} vs {:?}",
                        initializer.name, declared_dims, initializer.dims
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gelu_needs_opset_twenty() {
        let validator = SchemaValidator::new();
        assert!(validator.check_operator_support("Gelu", 20).is_ok());
        match validator.check_operator_support("Gelu", 17) {
            Err(Error::UnsupportedOperator { op_type, detail }) => {
                assert_eq!(op_type, "Gelu");
                assert!(detail.contains("requires opset 20"));
            }
            other => panic!("expected UnsupportedOperator, got {:?}", other),
        }
    }

    #[test]
    fn unknown_operators_are_unsupported() {
        let validator = SchemaValidator::new();
        assert!(matches!(
            validator.check_operator_support("NonMaxSuppression", 21),
            Err(Error::UnsupportedOperator { .. })
        ));
    }

    #[test]
    fn missing_required_attribute_is_reported() {
        let validator = SchemaValidator::new();
        let node = Node::new("cast", "Cast", vec!["x".into()], vec!["y".into()]);
        assert!(validator.validate_node(&node, 17).is_err());
    }
}
