//! Execution result types

use serde::Serialize;
use serde_json::Value;

use super::error::ActionError;
use crate::workflow::ExecutionContext;

/// Lifecycle status of one action (or one loop iteration)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Success,
    Skipped,
    Failed,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an action execution
#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub status: ActionStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,

    /// Per-iteration records for `for_each` actions, ordered by index
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub iterations: Vec<ActionResult>,
}

impl ActionResult {
    fn with_status(status: ActionStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            iterations: Vec::new(),
        }
    }

    pub fn pending() -> Self {
        Self::with_status(ActionStatus::Pending)
    }

    pub fn running() -> Self {
        Self::with_status(ActionStatus::Running)
    }

    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::with_status(ActionStatus::Success)
        }
    }

    pub fn skipped() -> Self {
        Self::with_status(ActionStatus::Skipped)
    }

    pub fn failed(error: ActionError) -> Self {
        Self {
            error: Some(error),
            ..Self::with_status(ActionStatus::Failed)
        }
    }

    pub fn with_iterations(mut self, iterations: Vec<ActionResult>) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }

    /// The `{status, result?, error?}` view exposed to expressions
    pub fn view(&self) -> Value {
        let mut view = serde_json::Map::new();
        view.insert("status".to_string(), Value::from(self.status.as_str()));
        if let Some(result) = &self.result {
            view.insert("result".to_string(), result.clone());
        }
        if let Some(error) = &self.error {
            view.insert("error".to_string(), error.view());
        }
        Value::Object(view)
    }
}

/// Final status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
}

/// Result of a workflow run
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub context: ExecutionContext,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn action(&self, reference: &str) -> Option<&ActionResult> {
        self.context.action(reference)
    }

    pub fn status_of(&self, reference: &str) -> Option<ActionStatus> {
        self.action(reference).map(|r| r.status)
    }

    pub fn result_of(&self, reference: &str) -> Option<&Value> {
        self.action(reference).and_then(|r| r.result.as_ref())
    }

    pub fn actions(&self) -> impl Iterator<Item = (&str, &ActionResult)> {
        self.context
            .actions()
            .iter()
            .map(|(reference, result)| (reference.as_str(), result))
    }
}
