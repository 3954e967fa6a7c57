use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::ops::tensor::Tensor;

/// Options for execution engine
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Keep every intermediate tensor in the context after a run
    pub keep_intermediates: bool,
    /// Check supplied inputs against the declared static dimensions
    pub strict_input_shapes: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionOptions {
    /// Create a new execution options object
    pub fn new() -> Self {
        Self {
            keep_intermediates: false,
            strict_input_shapes: true,
        }
    }

    /// Keep intermediate values, as calibration needs them
    pub fn keep_intermediates(mut self, keep: bool) -> Self {
        self.keep_intermediates = keep;
        self
    }

    pub fn strict_input_shapes(mut self, strict: bool) -> Self {
        self.strict_input_shapes = strict;
        self
    }
}

/// Tensor values of one run, keyed by tensor name
#[derive(Debug, Default)]
pub struct ExecutionContext {
    values: HashMap<String, Tensor>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tensor(&mut self, name: &str, mut tensor: Tensor) {
        tensor.name = Some(name.to_string());
        self.values.insert(name.to_string(), tensor);
    }

    pub fn get_tensor(&self, name: &str) -> Result<&Tensor> {
        self.values
            .get(name)
            .ok_or_else(|| Error::InvalidGraph(format!("Tensor '{}' not found in context", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Drop a value that no later node reads
    pub fn release(&mut self, name: &str) {
        self.values.remove(name);
    }

    pub fn take_tensor(&mut self, name: &str) -> Result<Tensor> {
        self.values
            .remove(name)
            .ok_or_else(|| Error::InvalidGraph(format!("Tensor '{}' not found in context", name)))
    }

    pub fn tensors(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
