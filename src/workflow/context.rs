//! Execution context for workflow runtime
//!
//! The accumulating state of one run: per-action results, the trigger
//! payload, environment bindings and static workflow inputs. It is owned by
//! a single scheduler loop and read by the expression engine.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use super::expressions::{Namespace, Path, PathSegment};
use crate::engine::{ActionResult, ActionStatus};

/// Outcome of a path lookup. `Absent` is distinct from JSON `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Value(Value),
    Absent,
}

impl Resolved {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Resolved::Value(value) => Some(value),
            Resolved::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Resolved::Absent)
    }

    pub fn field(&self, name: &str) -> Resolved {
        match self {
            Resolved::Value(Value::Object(map)) => map.get(name).into(),
            _ => Resolved::Absent,
        }
    }

    /// Negative indices count from the end
    pub fn index(&self, index: i64) -> Resolved {
        match self {
            Resolved::Value(Value::Array(items)) => normalize_index(index, items.len())
                .and_then(|i| items.get(i))
                .into(),
            _ => Resolved::Absent,
        }
    }
}

impl From<Option<&Value>> for Resolved {
    fn from(value: Option<&Value>) -> Self {
        match value {
            Some(v) => Resolved::Value(v.clone()),
            None => Resolved::Absent,
        }
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    if index < 0 {
        len.checked_sub(index.unsigned_abs() as usize)
    } else {
        Some(index as usize)
    }
}

/// Walk `segments` down from `root`
pub(crate) fn select<'v>(root: &'v Value, segments: &[PathSegment]) -> Option<&'v Value> {
    segments.iter().try_fold(root, |current, segment| match (segment, current) {
        (PathSegment::Field(name), Value::Object(map)) => map.get(name),
        (PathSegment::Index(i), Value::Array(items)) => {
            normalize_index(*i, items.len()).and_then(|i| items.get(i))
        }
        _ => None,
    })
}

/// Like [`select`], rooted at a mapping
pub(crate) fn select_in_map(map: &Map<String, Value>, segments: &[PathSegment]) -> Resolved {
    match segments.split_first() {
        None => Resolved::Value(Value::Object(map.clone())),
        Some((PathSegment::Field(key), rest)) => {
            map.get(key).and_then(|value| select(value, rest)).into()
        }
        Some((PathSegment::Index(_), _)) => Resolved::Absent,
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("Action '{0}' already reached a terminal state")]
    AlreadyTerminal(String),

    #[error("Action '{reference}' cannot move from {from} to {to}")]
    InvalidTransition {
        reference: String,
        from: ActionStatus,
        to: ActionStatus,
    },

    #[error("Action '{0}' has not entered the frontier")]
    Unknown(String),
}

/// Runtime context for expression evaluation
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionContext {
    /// Run ID
    pub run_id: String,

    /// Per-action results, keyed by ref
    #[serde(rename = "ACTIONS")]
    actions: BTreeMap<String, ActionResult>,

    /// Trigger payload
    #[serde(rename = "TRIGGER")]
    pub trigger: Value,

    /// Environment bindings
    #[serde(rename = "ENV")]
    pub env: BTreeMap<String, String>,

    /// Static workflow inputs
    #[serde(rename = "INPUTS")]
    pub inputs: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            trigger: Value::Null,
            ..Default::default()
        }
    }

    pub fn with_trigger(mut self, trigger: Value) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Merge environment variables from another source
    pub fn merge_env<'a>(&mut self, env: impl IntoIterator<Item = (&'a String, &'a String)>) {
        for (key, value) in env {
            self.env.insert(key.clone(), value.clone());
        }
    }

    pub fn actions(&self) -> &BTreeMap<String, ActionResult> {
        &self.actions
    }

    pub fn action(&self, reference: &str) -> Option<&ActionResult> {
        self.actions.get(reference)
    }

    pub fn status(&self, reference: &str) -> Option<ActionStatus> {
        self.actions.get(reference).map(|r| r.status)
    }

    /// Refs that have entered the frontier but are not terminal yet
    pub fn non_terminal(&self) -> Vec<String> {
        self.actions
            .iter()
            .filter(|(_, r)| !r.status.is_terminal())
            .map(|(reference, _)| reference.clone())
            .collect()
    }

    /// Add a ref to the frontier
    pub fn mark_pending(&mut self, reference: &str) -> Result<(), ContextError> {
        match self.actions.get(reference) {
            None => {
                self.actions
                    .insert(reference.to_string(), ActionResult::pending());
                Ok(())
            }
            Some(existing) if existing.status == ActionStatus::Pending => Ok(()),
            Some(existing) => Err(self.transition_error(reference, existing.status, ActionStatus::Pending)),
        }
    }

    pub fn mark_running(&mut self, reference: &str) -> Result<(), ContextError> {
        let existing = self
            .actions
            .get_mut(reference)
            .ok_or_else(|| ContextError::Unknown(reference.to_string()))?;

        if existing.status != ActionStatus::Pending {
            let from = existing.status;
            return Err(self.transition_error(reference, from, ActionStatus::Running));
        }
        existing.status = ActionStatus::Running;
        Ok(())
    }

    /// Record a terminal result. A ref that never entered the frontier is
    /// recorded directly.
    pub fn record(&mut self, reference: &str, result: ActionResult) -> Result<(), ContextError> {
        if !result.status.is_terminal() {
            let from = self.status(reference).unwrap_or(ActionStatus::Pending);
            return Err(self.transition_error(reference, from, result.status));
        }
        if let Some(existing) = self.actions.get(reference) {
            if existing.status.is_terminal() {
                return Err(ContextError::AlreadyTerminal(reference.to_string()));
            }
        }
        self.actions.insert(reference.to_string(), result);
        Ok(())
    }

    fn transition_error(&self, reference: &str, from: ActionStatus, to: ActionStatus) -> ContextError {
        if from.is_terminal() {
            ContextError::AlreadyTerminal(reference.to_string())
        } else {
            ContextError::InvalidTransition {
                reference: reference.to_string(),
                from,
                to,
            }
        }
    }

    /// Resolve a static path against the context
    pub fn resolve_path(&self, path: &Path) -> Resolved {
        let segments = path.segments.as_slice();
        match path.root {
            Namespace::Actions => self.resolve_action(segments),
            Namespace::Trigger => select(&self.trigger, segments).into(),
            Namespace::Env => match segments.split_first() {
                None => Resolved::Value(serde_json::json!(self.env)),
                Some((PathSegment::Field(key), [])) => self
                    .env
                    .get(key)
                    .map_or(Resolved::Absent, |v| Resolved::Value(Value::from(v.as_str()))),
                Some(_) => Resolved::Absent,
            },
            Namespace::Inputs => select_in_map(&self.inputs, segments),
            Namespace::Var => Resolved::Absent,
        }
    }

    fn resolve_action(&self, segments: &[PathSegment]) -> Resolved {
        let Some((first, rest)) = segments.split_first() else {
            let views = self
                .actions
                .iter()
                .map(|(reference, result)| (reference.clone(), result.view()))
                .collect();
            return Resolved::Value(Value::Object(views));
        };

        let PathSegment::Field(reference) = first else {
            return Resolved::Absent;
        };
        let Some(action) = self.actions.get(reference) else {
            return Resolved::Absent;
        };

        match rest.split_first() {
            Some((PathSegment::Field(field), tail)) if field == "result" => action
                .result
                .as_ref()
                .and_then(|result| select(result, tail))
                .into(),
            _ => select(&action.view(), rest).into(),
        }
    }
}
