//! Engine error types

use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::Value;

use super::dispatcher::DispatchError;
use super::workflow_dag::GraphError;
use crate::workflow::context::ContextError;
use crate::workflow::expressions::ExpressionError;

/// Why a single action ended up `failed`
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("Resolution error: {0}")]
    Resolution(#[from] ExpressionError),

    #[error("Strong dependency '{source_ref}' was skipped")]
    JoinViolation { source_ref: String },

    #[error("Dependency '{source_ref}' failed")]
    UpstreamFailed { source_ref: String },

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Iteration {index} failed: {source}")]
    Iteration {
        index: usize,
        source: Box<ActionError>,
    },

    #[error("Run cancelled")]
    Cancelled,
}

impl ActionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resolution(_) => "resolution",
            Self::JoinViolation { .. } => "join_violation",
            Self::UpstreamFailed { .. } => "upstream_failed",
            Self::Dispatch(_) => "dispatch",
            Self::Iteration { .. } => "iteration",
            Self::Cancelled => "cancelled",
        }
    }

    /// `{kind, message}` as seen from expressions and reports
    pub fn view(&self) -> Value {
        serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }
}

impl Serialize for ActionError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ActionError", 2)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Errors that abort a run before or outside of per-action progress
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Invalid workflow graph: {0}")]
    Graph(#[from] GraphError),

    #[error("Fatal run error: {0}")]
    Fatal(String),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),
}
