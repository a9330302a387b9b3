//! Workflow types and definitions
//!
//! This module contains all types for defining and parsing workflows:
//! - `definition` - WorkflowDefinition, ActionStatement, dependencies and loops
//! - `context` - ExecutionContext for runtime state
//! - `expressions` - Expression evaluation for `${{ }}` syntax
//! - `loader` - Load workflows from files and directories
//! - `runner_config` - Engine configuration

pub mod context;
pub mod definition;
pub mod expressions;
pub mod loader;
pub mod runner_config;

// Re-export all public types for convenience
pub use context::{ContextError, ExecutionContext, Resolved};
pub use definition::{
    ActionStatement, Dependency, DependencyKind, ForEach, LoopIterable, LoopStrategy,
    WorkflowDefinition,
};
pub use expressions::{evaluate_condition, resolve, resolve_inputs, ExpressionError, Scope};
pub use loader::{LoadError, WorkflowLoader};
pub use runner_config::{RetryConfig, RunnerConfig};
