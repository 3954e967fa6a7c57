pub mod context;
pub mod engine;

pub use context::{ExecutionContext, ExecutionOptions};
pub use engine::ExecutionEngine;
