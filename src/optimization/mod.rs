pub mod graph_optimizer;

pub mod passes {
    pub mod dead_node_elimination;
    pub mod fixed_shape;
    pub mod float16;
    pub mod fusion;
    pub mod int8;
    pub mod shape_inference;
}

pub use graph_optimizer::{GraphOptimizer, OptimizationPass, OptimizationStats, PassResult};
pub use passes::dead_node_elimination::DeadNodeElimination;
pub use passes::fixed_shape::FixedShape;
pub use passes::float16::Float16Quantization;
pub use passes::fusion::OperatorFusion;
pub use passes::int8::Int8Quantization;
pub use passes::shape_inference::ShapeInference;
