//! Action dispatch boundary
//!
//! The scheduler hands every unit of work (one action, or one loop
//! iteration) to an [`ActionDispatcher`]. [`ActionRegistry`] is the
//! in-process implementation used for local runs and tests, and
//! [`Retrying`] adds a retry policy around any dispatcher.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::workflow::RetryConfig;

/// One unit of work
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub run_id: String,
    pub action_ref: String,
    pub action_type: String,
    pub inputs: Map<String, Value>,
    /// Loop iteration index, if this is one iteration of a `for_each`
    pub iteration: Option<usize>,
    pub cancellation: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown action type: {0}")]
    UnknownAction(String),

    #[error("Action failed: {0}")]
    Failed(String),

    #[error("Action failed after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },

    #[error("Dispatch cancelled")]
    Cancelled,
}

#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<Value, DispatchError>;
}

#[async_trait]
impl<T: ActionDispatcher + ?Sized> ActionDispatcher for Arc<T> {
    async fn dispatch(&self, request: DispatchRequest) -> Result<Value, DispatchError> {
        (**self).dispatch(request).await
    }
}

type Handler = Arc<dyn Fn(DispatchRequest) -> BoxFuture<'static, Result<Value, DispatchError>> + Send + Sync>;

/// Maps action types to async handlers, with an admission limit on
/// concurrent dispatches
#[derive(Clone)]
pub struct ActionRegistry {
    handlers: HashMap<String, Handler>,
    permits: Arc<Semaphore>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("action_types", &self.action_types())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl ActionRegistry {
    /// An empty registry without an admission limit
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            permits: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        }
    }

    /// Limit concurrent dispatches to `parallel`, clamped to the permits a
    /// semaphore can hold
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        let permits = parallel.clamp(1, Semaphore::MAX_PERMITS);
        self.permits = Arc::new(Semaphore::new(permits));
        self
    }

    pub fn register<F, Fut>(&mut self, action_type: impl Into<String>, handler: F)
    where
        F: Fn(DispatchRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, DispatchError>> + Send + 'static,
    {
        self.handlers.insert(
            action_type.into(),
            Arc::new(move |request| handler(request).boxed()),
        );
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_action<F, Fut>(mut self, action_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(DispatchRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, DispatchError>> + Send + 'static,
    {
        self.register(action_type, handler);
        self
    }

    /// Register the `core.*` actions
    pub fn with_builtins(mut self) -> Self {
        self.register("core.transform.forward", |request: DispatchRequest| async move {
            Ok(request.inputs.get("value").cloned().unwrap_or(Value::Null))
        });
        self.register("core.noop", |_request: DispatchRequest| async move { Ok(Value::Null) });
        self.register("core.fail", |request: DispatchRequest| async move {
            let message = request
                .inputs
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("core.fail")
                .to_string();
            Err(DispatchError::Failed(message))
        });
        self
    }

    /// Registered action types, sorted
    pub fn action_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[async_trait]
impl ActionDispatcher for ActionRegistry {
    async fn dispatch(&self, request: DispatchRequest) -> Result<Value, DispatchError> {
        let handler = self
            .handlers
            .get(&request.action_type)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownAction(request.action_type.clone()))?;

        let cancellation = request.cancellation.clone();
        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| DispatchError::Cancelled)?
            }
            _ = cancellation.cancelled() => return Err(DispatchError::Cancelled),
        };

        debug!(
            action = %request.action_ref,
            action_type = %request.action_type,
            iteration = ?request.iteration,
            "Dispatching action"
        );

        tokio::select! {
            result = handler(request) => result,
            _ = cancellation.cancelled() => Err(DispatchError::Cancelled),
        }
    }
}

/// Retries [`DispatchError::Failed`] with exponential backoff
#[derive(Debug, Clone)]
pub struct Retrying<D> {
    inner: D,
    policy: RetryConfig,
}

impl<D: ActionDispatcher> Retrying<D> {
    pub fn new(inner: D, policy: RetryConfig) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<D: ActionDispatcher> ActionDispatcher for Retrying<D> {
    async fn dispatch(&self, request: DispatchRequest) -> Result<Value, DispatchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.inner.dispatch(request.clone()).await {
                Err(DispatchError::Failed(message)) if attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        action = %request.action_ref,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Action failed, retrying: {}",
                        message
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = request.cancellation.cancelled() => return Err(DispatchError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(DispatchError::Failed(message)) if max_attempts > 1 => {
                    return Err(DispatchError::Exhausted {
                        attempts: attempt,
                        message,
                    })
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_parallel_limit_is_clamped() {
        let registry = ActionRegistry::new().with_parallel(usize::MAX);
        assert_eq!(registry.permits.available_permits(), Semaphore::MAX_PERMITS);
        let registry = ActionRegistry::new().with_parallel(0);
        assert_eq!(registry.permits.available_permits(), 1);
    }

    fn request(action_type: &str, inputs: Value) -> DispatchRequest {
        DispatchRequest {
            run_id: "run-test".to_string(),
            action_ref: "a".to_string(),
            action_type: action_type.to_string(),
            inputs: inputs.as_object().cloned().unwrap_or_default(),
            iteration: None,
            cancellation: CancellationToken::new(),
        }
    }

    fn no_delay(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            delay: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_builtins() {
        let registry = ActionRegistry::new().with_builtins();
        assert_eq!(
            registry
                .dispatch(request("core.transform.forward", json!({"value": [1, 2]})))
                .await
                .unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            registry.dispatch(request("core.noop", json!({}))).await.unwrap(),
            Value::Null
        );
        assert_eq!(
            registry
                .dispatch(request("core.fail", json!({"message": "nope"})))
                .await,
            Err(DispatchError::Failed("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let registry = ActionRegistry::new();
        assert_eq!(
            registry.dispatch(request("edr.isolate", json!({}))).await,
            Err(DispatchError::UnknownAction("edr.isolate".to_string()))
        );
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let registry = ActionRegistry::new().with_action("flaky", move |_req| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DispatchError::Failed("transient".into()))
                } else {
                    Ok(json!("ok"))
                }
            }
        });

        let retrying = Retrying::new(registry, no_delay(3));
        assert_eq!(retrying.dispatch(request("flaky", json!({}))).await.unwrap(), json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let retrying = Retrying::new(ActionRegistry::new().with_builtins(), no_delay(2));
        assert_eq!(
            retrying.dispatch(request("core.fail", json!({"message": "down"}))).await,
            Err(DispatchError::Exhausted {
                attempts: 2,
                message: "down".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_retried() {
        let retrying = Retrying::new(ActionRegistry::new(), no_delay(5));
        assert!(matches!(
            retrying.dispatch(request("missing", json!({}))).await,
            Err(DispatchError::UnknownAction(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let registry = ActionRegistry::new().with_action("slow", |_req| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });
        let req = request("slow", json!({}));
        let token = req.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        assert_eq!(registry.dispatch(req).await, Err(DispatchError::Cancelled));
    }

    #[tokio::test]
    async fn test_admission_limit() {
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let registry = Arc::new(ActionRegistry::new().with_parallel(2).with_action(
            "work",
            move |_req| {
                let (a, p) = (a.clone(), p.clone());
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            },
        ));

        let calls = (0..6).map(|_| registry.dispatch(request("work", json!({}))));
        futures::future::join_all(calls).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
