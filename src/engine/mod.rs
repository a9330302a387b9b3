//! Workflow execution engine module
//!
//! This module contains:
//! - `scheduler` - The DAG scheduler that runs a definition to completion
//! - `workflow_dag` - Dependency graph builder and validation
//! - `loops` - `for_each` expansion
//! - `dispatcher` - Action dispatch boundary, in-process registry and retries
//! - `error` - Action and run error types
//! - `result` - Action and run result types

pub mod dispatcher;
pub mod error;
pub mod loops;
pub mod result;
pub mod scheduler;
pub mod workflow_dag;

pub use dispatcher::{ActionDispatcher, ActionRegistry, DispatchError, DispatchRequest, Retrying};
pub use error::{ActionError, RunError};
pub use result::{ActionResult, ActionStatus, RunResult, RunStatus};
pub use scheduler::{derive_run_id, resolve_entrypoint, RunArgs, Scheduler};
pub use workflow_dag::{ActionGraph, ActionNode, GraphError};
