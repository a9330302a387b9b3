#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secflow::{
    ActionDispatcher, DispatchError, DispatchRequest, Scheduler, WorkflowDefinition,
    WorkflowLoader,
};
use serde_json::{Map, Value};
use tempfile::TempDir;

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

pub fn write_workflow(dir: &Path, filename: &str, content: &str) {
    fs::write(dir.join(filename), content).expect("Failed to write workflow file");
}

pub fn write_runner_config(dir: &Path, content: &str) {
    fs::write(dir.join("runner.yaml"), content).expect("Failed to write runner.yaml");
}

pub fn load(yaml: &str) -> WorkflowDefinition {
    WorkflowLoader::from_yaml(yaml).expect("Failed to load workflow")
}

/// A one-action workflow
pub fn simple_workflow(title: &str) -> String {
    format!(
        r#"
title: {}
actions:
  - ref: start
    action: core.noop
"#,
        title
    )
}

/// One dispatched unit of work
#[derive(Debug, Clone)]
pub struct Call {
    pub action_ref: String,
    pub iteration: Option<usize>,
    pub run_id: String,
    pub inputs: Map<String, Value>,
}

/// Test dispatcher that records every call and start/end event.
///
/// - `test.echo` returns `inputs.value`, or the whole input mapping
/// - `test.fail` fails with `inputs.message`
/// - `test.hang` never completes
///
/// Any action honours `inputs.delay_ms` before completing.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    calls: Mutex<Vec<Call>>,
    events: Mutex<Vec<String>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn refs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.action_ref).collect()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Position of `event` in the event log
    pub fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event {} not recorded in {:?}", event, self.events()))
    }

    fn label(request: &DispatchRequest) -> String {
        match request.iteration {
            Some(i) => format!("{}#{}", request.action_ref, i),
            None => request.action_ref.clone(),
        }
    }
}

#[async_trait]
impl ActionDispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<Value, DispatchError> {
        let label = Self::label(&request);
        self.calls.lock().unwrap().push(Call {
            action_ref: request.action_ref.clone(),
            iteration: request.iteration,
            run_id: request.run_id.clone(),
            inputs: request.inputs.clone(),
        });
        self.events.lock().unwrap().push(format!("start:{}", label));

        if let Some(ms) = request.inputs.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let outcome = match request.action_type.as_str() {
            "test.echo" => Ok(request
                .inputs
                .get("value")
                .cloned()
                .unwrap_or_else(|| Value::Object(request.inputs.clone()))),
            "test.fail" => Err(DispatchError::Failed(
                request
                    .inputs
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("failed")
                    .to_string(),
            )),
            "test.hang" => std::future::pending().await,
            other => Err(DispatchError::UnknownAction(other.to_string())),
        };

        self.events.lock().unwrap().push(format!("end:{}", label));
        outcome
    }
}

pub fn recording_scheduler() -> (Scheduler, Arc<RecordingDispatcher>) {
    let dispatcher = RecordingDispatcher::new();
    (Scheduler::new(dispatcher.clone()), dispatcher)
}
