//! Handler registry and dispatcher: maps a `job_type` tag to a typed
//! payload and a handler implementation, validating the stored payload
//! before invoking the handler.
//!
//! Registration is explicit — a registry built at startup and passed
//! into the [`crate::worker::Worker`] — rather than the decorator-driven
//! global map the original implementation used. A global, import-time
//! registry hides initialization order; this crate never reproduces it.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;

use crate::error::DispatchError;
use crate::job::ScheduledJob;

/// A handler for one `job_type`. `Payload` is the typed, deserialized
/// shape of the job's stored payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    type Payload: DeserializeOwned + Send;

    /// Execute the job. Any `Err` is treated as a job failure by the
    /// worker and increments `attempts`.
    async fn handle(&self, payload: Self::Payload) -> Result<(), String>;
}

/// Type-erased adapter so heterogeneous [`JobHandler`] impls can share
/// one registry.
#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn dispatch(&self, payload: serde_json::Value) -> Result<(), DispatchError>;
}

struct Adapter<H: JobHandler> {
    handler: H,
    job_type: String,
}

#[async_trait]
impl<H: JobHandler> ErasedHandler for Adapter<H> {
    async fn dispatch(&self, payload: serde_json::Value) -> Result<(), DispatchError> {
        let typed: H::Payload = serde_json::from_value(payload).map_err(|e| DispatchError::PayloadInvalid {
            job_type: self.job_type.clone(),
            reason: e.to_string(),
        })?;
        self.handler
            .handle(typed)
            .await
            .map_err(DispatchError::HandlerError)
    }
}

/// Process-wide map from `job_type` to handler, populated before the
/// worker starts.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn ErasedHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: JobHandler + 'static>(&self, job_type: impl Into<String>, handler: H) {
        let job_type = job_type.into();
        self.handlers.insert(
            job_type.clone(),
            Arc::new(Adapter { handler, job_type }),
        );
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }
}

/// Resolves a job's handler and invokes it with a validated payload.
pub struct Dispatcher {
    registry: HandlerRegistry,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    pub async fn dispatch(&self, job: &ScheduledJob) -> Result<(), DispatchError> {
        let entry = self
            .registry
            .handlers
            .get(&job.job_type)
            .ok_or_else(|| DispatchError::NoHandler(job.job_type.clone()))?;
        entry.dispatch(job.payload.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Deserialize)]
    struct EchoPayload {
        #[allow(dead_code)]
        correlation_id: String,
    }

    struct EchoHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler for EchoHandler {
        type Payload = EchoPayload;

        async fn handle(&self, _payload: EchoPayload) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        type Payload = serde_json::Value;

        async fn handle(&self, _payload: serde_json::Value) -> Result<(), String> {
            Err("boom".into())
        }
    }

    fn job(job_type: &str, payload: serde_json::Value) -> ScheduledJob {
        let now = Utc::now();
        ScheduledJob::new(job_type, payload, now, now)
    }

    #[tokio::test]
    async fn dispatch_invokes_registered_handler_with_validated_payload() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register("heartbeat_event", EchoHandler(calls.clone()));
        let dispatcher = Dispatcher::new(registry);

        let j = job("heartbeat_event", serde_json::json!({"correlation_id": "abc"}));
        dispatcher.dispatch(&j).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_fails_with_no_handler_for_unknown_job_type() {
        let dispatcher = Dispatcher::new(HandlerRegistry::new());
        let j = job("mystery", serde_json::json!({}));
        let err = dispatcher.dispatch(&j).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoHandler(t) if t == "mystery"));
    }

    #[tokio::test]
    async fn dispatch_fails_with_payload_invalid_on_schema_mismatch() {
        let registry = HandlerRegistry::new();
        registry.register("heartbeat_event", EchoHandler(Arc::new(AtomicUsize::new(0))));
        let dispatcher = Dispatcher::new(registry);

        let j = job("heartbeat_event", serde_json::json!({"wrong_field": 1}));
        let err = dispatcher.dispatch(&j).await.unwrap_err();
        assert!(matches!(err, DispatchError::PayloadInvalid { .. }));
    }

    #[tokio::test]
    async fn dispatch_surfaces_handler_error() {
        let registry = HandlerRegistry::new();
        registry.register("always_fails", FailingHandler);
        let dispatcher = Dispatcher::new(registry);

        let j = job("always_fails", serde_json::json!({}));
        let err = dispatcher.dispatch(&j).await.unwrap_err();
        assert!(matches!(err, DispatchError::HandlerError(_)));
    }
}
