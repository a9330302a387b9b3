//! DAG scheduler
//!
//! Runs a workflow definition to completion. A single cooperative loop owns
//! the run's [`ExecutionContext`]; ready actions are decided in definition
//! order and either settled immediately (skip, join violation, upstream
//! failure, resolution error) or dispatched. Dispatched work is polled
//! together, and loop actions join all of their iterations before the
//! action's terminal result is recorded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::dispatcher::{ActionDispatcher, ActionRegistry, DispatchRequest, Retrying};
use super::error::{ActionError, RunError};
use super::loops;
use super::result::{ActionResult, ActionStatus, RunResult, RunStatus};
use super::workflow_dag::ActionGraph;
use crate::workflow::expressions::{evaluate_condition, resolve_inputs, Scope};
use crate::workflow::{
    ActionStatement, DependencyKind, ExecutionContext, ForEach, RunnerConfig, WorkflowDefinition,
};

/// Per-run arguments
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub trigger: Value,
    /// Seeds the run id. Defaults to the canonical trigger JSON.
    pub execution_id: Option<String>,
    pub cancellation: CancellationToken,
}

impl RunArgs {
    pub fn new(trigger: Value) -> Self {
        Self {
            trigger,
            ..Default::default()
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Stable run id: `run-` + 32 hex chars of
/// `sha256(title ":" (execution_id | canonical trigger JSON))`
pub fn derive_run_id(title: &str, execution_id: Option<&str>, trigger: &Value) -> String {
    let seed = match execution_id {
        Some(id) => id.to_string(),
        None => trigger.to_string(),
    };
    let digest = Sha256::digest(format!("{}:{}", title, seed).as_bytes());
    format!("run-{}", &hex::encode(digest)[..32])
}

/// The declared entrypoint, or the single root when there is exactly one
pub fn resolve_entrypoint(
    graph: &ActionGraph,
    declared: Option<&str>,
) -> Result<Option<String>, RunError> {
    match declared {
        Some(entrypoint) => match graph.index_of(entrypoint) {
            None => Err(RunError::Fatal(format!(
                "entrypoint '{}' does not exist",
                entrypoint
            ))),
            Some(i) if !graph.node(i).dependencies.is_empty() => Err(RunError::Fatal(format!(
                "entrypoint '{}' has incoming dependencies",
                entrypoint
            ))),
            Some(_) => Ok(Some(entrypoint.to_string())),
        },
        None => match graph.roots().as_slice() {
            [only] => Ok(Some(only.to_string())),
            _ => Ok(None),
        },
    }
}

type ActionFuture = BoxFuture<'static, (usize, ActionResult)>;

/// How a ready action is settled
enum Disposition {
    Settled(ActionResult),
    Dispatch(ActionFuture),
}

/// Mutable state of one run, owned by the control loop
struct RunState<'d> {
    definition: &'d WorkflowDefinition,
    graph: ActionGraph,
    ctx: ExecutionContext,
    /// Unsettled incoming edges per action
    remaining: Vec<usize>,
    ready: BTreeSet<usize>,
}

impl RunState<'_> {
    fn status_of(&self, index: usize) -> Option<ActionStatus> {
        self.ctx.status(&self.graph.node(index).reference)
    }

    /// Record a terminal result and release dependents whose sources are
    /// all terminal
    fn settle(&mut self, index: usize, result: ActionResult) -> Result<(), RunError> {
        let node = self.graph.node(index);

        match result.status {
            ActionStatus::Failed => warn!(
                action = %node.reference,
                "Action failed: {}",
                result.error.as_ref().map(ToString::to_string).unwrap_or_default()
            ),
            status => info!(action = %node.reference, %status, "Action settled"),
        }

        self.ctx.record(&node.reference, result)?;

        for &dependent in &node.dependents {
            self.remaining[dependent] -= 1;
            if self.remaining[dependent] == 0 {
                self.ready.insert(dependent);
            }
        }
        Ok(())
    }
}

/// Executes workflow definitions against an [`ActionDispatcher`]
#[derive(Clone)]
pub struct Scheduler {
    dispatcher: Arc<dyn ActionDispatcher>,
    env: BTreeMap<String, String>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(dispatcher: impl ActionDispatcher + 'static) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            env: BTreeMap::new(),
        }
    }

    /// Bindings for the `ENV` namespace
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Wrap `registry` with the configured admission limit and retry policy
    pub fn from_config(config: &RunnerConfig, registry: ActionRegistry) -> Self {
        let registry = registry.with_parallel(config.parallel);
        Self::new(Retrying::new(registry, config.retry.clone())).with_env(config.env.clone())
    }

    /// Run with only a trigger payload
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        trigger: Value,
    ) -> Result<RunResult, RunError> {
        self.run(definition, RunArgs::new(trigger)).await
    }

    #[instrument(skip_all, fields(workflow = %definition.title, run_id = tracing::field::Empty))]
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        args: RunArgs,
    ) -> Result<RunResult, RunError> {
        if definition.actions.is_empty() {
            return Err(RunError::Fatal("workflow has no actions".to_string()));
        }

        let graph = ActionGraph::build(definition)?;
        let entrypoint = resolve_entrypoint(&graph, definition.entrypoint.as_deref())?;

        let run_id = derive_run_id(
            &definition.title,
            args.execution_id.as_deref(),
            &args.trigger,
        );
        tracing::Span::current().record("run_id", run_id.as_str());
        info!(
            "Starting workflow: {} ({} actions, entrypoint: {:?})",
            definition.title,
            graph.len(),
            entrypoint
        );

        let mut ctx = ExecutionContext::new(run_id.clone())
            .with_trigger(args.trigger)
            .with_inputs(definition.inputs.clone());
        ctx.merge_env(&self.env);

        let remaining: Vec<usize> = graph.nodes().iter().map(|n| n.dependencies.len()).collect();
        let ready = (0..graph.len()).filter(|&i| remaining[i] == 0).collect();

        let mut state = RunState {
            definition,
            graph,
            ctx,
            remaining,
            ready,
        };

        let cancellation = args.cancellation;
        let mut in_flight: FuturesUnordered<ActionFuture> = FuturesUnordered::new();
        let mut cancelled = false;

        loop {
            while !cancellation.is_cancelled() {
                let Some(index) = state.ready.pop_first() else {
                    break;
                };
                let reference = state.graph.node(index).reference.clone();
                state.ctx.mark_pending(&reference)?;

                match self.dispose(&state, index, &run_id, &cancellation) {
                    Disposition::Settled(result) => state.settle(index, result)?,
                    Disposition::Dispatch(future) => {
                        debug!(action = %reference, "Action running");
                        state.ctx.mark_running(&reference)?;
                        in_flight.push(future);
                    }
                }
            }

            if cancellation.is_cancelled() {
                cancelled = true;
                break;
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some((index, result)) = in_flight.next() => {
                    state.settle(index, result)?;
                }
            }
        }

        // In-flight dispatch futures are dropped here
        drop(in_flight);

        let status = if cancelled {
            warn!("Workflow cancelled");
            for reference in state.ctx.non_terminal() {
                state
                    .ctx
                    .record(&reference, ActionResult::failed(ActionError::Cancelled))?;
            }
            RunStatus::Cancelled
        } else if state
            .ctx
            .actions()
            .values()
            .any(|r| r.status == ActionStatus::Failed)
        {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        match status {
            RunStatus::Failed => error!("Workflow {} failed", definition.title),
            _ => info!("Workflow {} finished: {:?}", definition.title, status),
        }

        Ok(RunResult {
            run_id,
            status,
            context: state.ctx,
        })
    }

    /// Decide a ready action's fate from its sources and `run_if`, or build
    /// its dispatch future
    fn dispose(
        &self,
        state: &RunState<'_>,
        index: usize,
        run_id: &str,
        cancellation: &CancellationToken,
    ) -> Disposition {
        let node = state.graph.node(index);
        let statement = &state.definition.actions[index];

        let sources = |kind: DependencyKind, status: ActionStatus| {
            node.dependencies
                .iter()
                .filter(move |(_, k)| *k == kind)
                .map(|(source, _)| *source)
                .find(|&source| state.status_of(source) == Some(status))
                .map(|source| state.graph.node(source).reference.clone())
        };

        if let Some(source_ref) = sources(DependencyKind::Strong, ActionStatus::Failed) {
            return Disposition::Settled(ActionResult::failed(ActionError::UpstreamFailed {
                source_ref,
            }));
        }
        if let Some(source_ref) = sources(DependencyKind::Strong, ActionStatus::Skipped) {
            return Disposition::Settled(ActionResult::failed(ActionError::JoinViolation {
                source_ref,
            }));
        }

        let scope = Scope::new(&state.ctx);

        match &statement.run_if {
            Some(condition) => match evaluate_condition(condition, &scope) {
                Ok(true) => {}
                Ok(false) => {
                    info!("Skipping action {} due to condition", node.reference);
                    return Disposition::Settled(ActionResult::skipped());
                }
                Err(e) => return Disposition::Settled(ActionResult::failed(e.into())),
            },
            None => {
                let all_skipped = !node.dependencies.is_empty()
                    && node
                        .dependencies
                        .iter()
                        .all(|(source, _)| state.status_of(*source) == Some(ActionStatus::Skipped));
                if all_skipped {
                    info!("Skipping action {}: all dependencies skipped", node.reference);
                    return Disposition::Settled(ActionResult::skipped());
                }
            }
        }

        let request = |inputs: Map<String, Value>, iteration: Option<usize>| DispatchRequest {
            run_id: run_id.to_string(),
            action_ref: statement.reference.clone(),
            action_type: statement.action_type.clone(),
            inputs,
            iteration,
            cancellation: cancellation.clone(),
        };

        match &statement.for_each {
            None => match resolve_inputs(&statement.inputs, &scope) {
                Ok(inputs) => Disposition::Dispatch(self.dispatch_one(index, request(inputs, None))),
                Err(e) => Disposition::Settled(ActionResult::failed(e.into())),
            },
            Some(for_each) => self.dispose_loop(index, statement, for_each, &scope, request),
        }
    }

    fn dispose_loop(
        &self,
        index: usize,
        statement: &ActionStatement,
        for_each: &ForEach,
        scope: &Scope<'_>,
        request: impl Fn(Map<String, Value>, Option<usize>) -> DispatchRequest,
    ) -> Disposition {
        let bindings = match loops::expand(for_each, scope) {
            Ok(bindings) => bindings,
            Err(e) => return Disposition::Settled(ActionResult::failed(e.into())),
        };

        if bindings.is_empty() {
            debug!("Action {} has no iterations", statement.reference);
            return Disposition::Settled(ActionResult::success(Value::Array(Vec::new())));
        }

        let mut requests = Vec::with_capacity(bindings.len());
        for (i, binding) in bindings.iter().enumerate() {
            match resolve_inputs(&statement.inputs, &scope.with_locals(binding)) {
                Ok(inputs) => requests.push(request(inputs, Some(i))),
                Err(e) => {
                    return Disposition::Settled(ActionResult::failed(ActionError::Iteration {
                        index: i,
                        source: Box::new(e.into()),
                    }))
                }
            }
        }

        debug!(
            "Fanning out action {} into {} iterations",
            statement.reference,
            requests.len()
        );
        Disposition::Dispatch(self.dispatch_loop(index, requests))
    }

    fn dispatch_one(&self, index: usize, request: DispatchRequest) -> ActionFuture {
        let dispatcher = self.dispatcher.clone();
        async move {
            let result = match dispatcher.dispatch(request).await {
                Ok(value) => ActionResult::success(value),
                Err(e) => ActionResult::failed(e.into()),
            };
            (index, result)
        }
        .boxed()
    }

    fn dispatch_loop(&self, index: usize, requests: Vec<DispatchRequest>) -> ActionFuture {
        let dispatcher = self.dispatcher.clone();
        async move {
            let outcomes = join_all(requests.into_iter().map(|request| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.dispatch(request).await }
            }))
            .await;

            let iterations: Vec<ActionResult> = outcomes
                .into_iter()
                .map(|outcome| match outcome {
                    Ok(value) => ActionResult::success(value),
                    Err(e) => ActionResult::failed(e.into()),
                })
                .collect();

            (index, aggregate(iterations))
        }
        .boxed()
    }
}

/// Fold iteration records into the parent result, ordered by index
fn aggregate(iterations: Vec<ActionResult>) -> ActionResult {
    let first_failure = iterations
        .iter()
        .enumerate()
        .find_map(|(i, r)| r.error.as_ref().map(|e| (i, e.clone())));

    match first_failure {
        Some((index, error)) => ActionResult::failed(ActionError::Iteration {
            index,
            source: Box::new(error),
        })
        .with_iterations(iterations),
        None => {
            let values = iterations
                .iter()
                .map(|r| r.result.clone().unwrap_or(Value::Null))
                .collect();
            ActionResult::success(Value::Array(values)).with_iterations(iterations)
        }
    }
}
