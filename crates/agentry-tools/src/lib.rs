//! The tool trait, registry, and dependency-ordered bounded-parallel
//! executor (spec §4.7), plus three reference tool bodies (shell, file,
//! web) used as the executor's concrete callables.

pub mod builtins;
pub mod executor;
pub mod registry;

pub use executor::{Executor, ExecutorConfig};
pub use registry::{Tool, ToolRegistry};
