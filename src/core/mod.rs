// Core domain layer
pub mod graph;
pub mod interfaces;
pub mod models;
pub mod pipeline;
pub mod plugin;
pub mod services;

pub use graph::{GraphBuilder, GraphReport, ModuleGraph};
pub use interfaces::*;
pub use models::*;
pub use pipeline::{TransformOutcome, TransformPipeline, TransformStepKind};
pub use plugin::{StepInput, StepOutput, TransformStep};
pub use services::*;
