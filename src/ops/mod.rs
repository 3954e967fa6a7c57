pub mod activations;
pub mod quantize;
pub mod registry;
pub mod shape;
pub mod tensor;

pub mod prelude {
    pub use super::registry::{Operator, OperatorRegistry, ShapeInput};
    pub use super::tensor::{Shape, Tensor};
}

pub use registry::{Operator, OperatorRegistry, ShapeInput};
pub use tensor::{Shape, Tensor};

// Module files for math subdirectory
pub mod math {
    pub mod elementwise;
    pub mod gemm;
    pub mod matmul;
}

// Module files for nn subdirectory
pub mod nn {
    pub mod conv;
    pub mod normalization;
    pub mod pool;
}
