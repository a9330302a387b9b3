//! # secflow
//!
//! A declarative workflow engine for security-operations pipelines.
//!
//! ## Features
//!
//! - **Declarative YAML workflows** - Actions with typed dependency edges
//! - **Conditional execution** - `run_if` with skip propagation and strong/weak joins
//! - **Fan-out loops** - `for_each` with `map`, `zip` and `arrange` strategies
//! - **Expression syntax** - Use `${{ }}` for dynamic values and `FN.*` functions
//! - **Parallel execution** - Independent actions and loop iterations run concurrently
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use secflow::{ActionRegistry, Scheduler, WorkflowLoader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let definition = WorkflowLoader::from_yaml(r#"
//! title: triage
//! actions:
//!   - ref: severity
//!     action: core.transform.forward
//!     inputs:
//!       value: ${{ TRIGGER.alert.severity }}
//!   - ref: escalate
//!     action: core.transform.forward
//!     depends_on: [severity]
//!     run_if: ${{ ACTIONS.severity.result >= 7 }}
//!     inputs:
//!       value: "escalating ${{ TRIGGER.alert.id }}"
//! "#)?;
//!
//!     let scheduler = Scheduler::new(ActionRegistry::new().with_builtins());
//!     let trigger = serde_json::json!({"alert": {"id": "A-1", "severity": 9}});
//!     let result = scheduler.execute(&definition, trigger).await?;
//!
//!     println!("Run {} finished: {:?}", result.run_id, result.status);
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod workflow;

// Re-export main types
pub use engine::{
    ActionDispatcher, ActionError, ActionGraph, ActionRegistry, ActionResult, ActionStatus,
    DispatchError, DispatchRequest, GraphError, Retrying, RunArgs, RunError, RunResult, RunStatus,
    Scheduler,
};
pub use workflow::{
    ActionStatement, Dependency, DependencyKind, ExecutionContext, ExpressionError, ForEach,
    LoadError, LoopIterable, LoopStrategy, RunnerConfig, WorkflowDefinition, WorkflowLoader,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::{
        resolve_entrypoint, ActionDispatcher, ActionError, ActionRegistry, ActionResult,
        ActionStatus, DispatchError, DispatchRequest, RunArgs, RunError, RunResult, RunStatus,
        Scheduler,
    };
    pub use crate::workflow::{
        ActionStatement, Dependency, ForEach, LoadError, RunnerConfig, WorkflowDefinition,
        WorkflowLoader,
    };
}
