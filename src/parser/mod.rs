pub mod model_loader;
pub mod model_writer;
pub mod schema_validator;
pub mod graph_builder;

// Re-export key types from the parser module
pub use model_loader::OnnxModelLoader;
pub use model_writer::OnnxModelWriter;
pub use schema_validator::{OpSchema, SchemaValidator};
pub use graph_builder::{ExecutionGraph, GraphBuilder};
