pub mod analyzer;
pub mod cache;
pub mod comparison;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod execution;
pub mod llm;
pub mod parsing;
pub mod query;
pub mod router;
pub mod schema;
pub mod strategy;
pub mod text;
pub mod vocabulary;

pub use engine::{AssistantResponse, NlqEngine, PipelineStage};
pub use error::{Failure, FailureKind, NlqError, Result};
