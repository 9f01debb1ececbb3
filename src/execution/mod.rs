//! Execution Layer
//!
//! Guards and runs single-table SELECT statements against the in-memory
//! dataset snapshot.

pub mod executor;
pub mod guard;
pub mod result;

pub use executor::{ExecutionLimits, QueryInput, SafeQueryExecutor};
pub use result::ExecutionResult;
