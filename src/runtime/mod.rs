use crate::_typed_codec::{Codec, Json};
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{
    InstanceFilter, InstanceRecord, InstanceStatus, Provider, ProviderError, WorkItem,
};
use crate::{ErrorDetails, HistoryRecord, OrchestrationContext};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod detect;
mod dispatch;
mod execution;
pub mod registry;
pub mod replay;

/// Instance status as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { details: ErrorDetails },
}

impl From<InstanceStatus> for OrchestrationStatus {
    fn from(s: InstanceStatus) -> Self {
        match s {
            InstanceStatus::Running => OrchestrationStatus::Running,
            InstanceStatus::Completed { output } => OrchestrationStatus::Completed { output },
            InstanceStatus::Failed { details } => OrchestrationStatus::Failed { details },
        }
    }
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => f.write_str("timed out waiting for orchestration"),
            WaitError::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for WaitError {}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

pub use crate::runtime::registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder,
};

/// Tuning knobs for the dispatchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Concurrent orchestrator-queue consumers (Advance calls across instances).
    pub orchestration_concurrency: usize,
    /// Concurrent activity executions.
    pub worker_concurrency: usize,
    /// Sleep between polls when a queue is empty.
    pub dispatcher_idle_sleep_ms: u64,
    /// Total attempts per activity before its failure is reported; minimum 1.
    pub activity_max_attempts: u32,
    /// Fixed delay between activity attempts.
    pub activity_retry_delay_ms: u64,
    /// Attempts for a retryable store operation before the work item is abandoned.
    pub infra_retry_max_attempts: u32,
    /// First backoff delay for store retries; doubles per attempt.
    pub infra_retry_base_delay_ms: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            orchestration_concurrency: 2,
            worker_concurrency: 4,
            dispatcher_idle_sleep_ms: 10,
            activity_max_attempts: 1,
            activity_retry_delay_ms: 50,
            infra_retry_max_attempts: 5,
            infra_retry_base_delay_ms: 10,
        }
    }
}

/// In-process runtime: dispatcher pools over the provider's durable queues.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: Arc<ActivityRegistry>,
    replay_engine: Box<dyn replay::ReplayEngine>,
    options: RuntimeOptions,
    instance_locks: dispatch::InstanceLocks,
    // Instances whose last Advance failed mid-way; their pending activities are re-dispatched
    rehydrate: std::sync::Mutex<HashSet<String>>,
}

impl Runtime {
    /// Start a new runtime using the in-memory store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Result<Arc<Self>, String> {
        let store: Arc<dyn Provider> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime over an existing store with default options.
    pub async fn start_with_store(
        store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Result<Arc<Self>, String> {
        Self::start_with_options(store, activity_registry, orchestration_registry, RuntimeOptions::default()).await
    }

    /// Validate registries, recover state left by a previous process, and
    /// spawn the dispatcher pools.
    pub async fn start_with_options(
        store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Result<Arc<Self>, String> {
        crate::logging::init_tracing();

        orchestration_registry.validate_against(&activity_registry)?;
        if options.orchestration_concurrency == 0 || options.worker_concurrency == 0 {
            return Err("dispatcher concurrency must be at least 1".to_string());
        }

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            store,
            orchestration_registry,
            activity_registry,
            replay_engine: Box::new(replay::DefaultReplayEngine::new()),
            options,
            instance_locks: dispatch::InstanceLocks::default(),
            rehydrate: std::sync::Mutex::new(HashSet::new()),
        });

        runtime.recover().await.map_err(|e| e.to_string())?;

        let mut joins = Vec::new();
        for idx in 0..runtime.options.orchestration_concurrency {
            joins.push(runtime.clone().spawn_orchestration_dispatcher(idx));
        }
        for idx in 0..runtime.options.worker_concurrency {
            joins.push(runtime.clone().spawn_work_dispatcher(idx));
        }
        runtime.joins.lock().await.extend(joins);
        info!(
            orchestrations = ?runtime.orchestration_registry.list_orchestration_names(),
            activities = ?runtime.activity_registry.names(),
            "runtime started"
        );
        Ok(runtime)
    }

    /// Put state left behind by a dead process back in motion: release
    /// peek-locks, re-dispatch scheduled but unresolved activities, and
    /// enqueue an Advance for every running instance.
    async fn recover(&self) -> Result<(), ProviderError> {
        let released = self
            .retry_infra("release_all_locks", || self.store.release_all_locks())
            .await?;
        let filter = InstanceFilter::running();
        let running = self
            .retry_infra("list_instances", || self.store.list_instances(&filter))
            .await?;
        let mut redispatched = 0usize;
        for rec in &running {
            let history = self.retry_infra("read", || self.store.read(&rec.id)).await?;
            for (id, name, input) in detect::pending_activities(&history) {
                let item = WorkItem::ActivityExecute {
                    instance: rec.id.clone(),
                    id,
                    name,
                    input,
                    attempt: 1,
                };
                self.retry_infra("enqueue_work", || self.store.enqueue_work(item.queue(), item.clone()))
                    .await?;
                redispatched += 1;
            }
            let start = WorkItem::StartOrchestration {
                instance: rec.id.clone(),
            };
            self.retry_infra("enqueue_work", || self.store.enqueue_work(start.queue(), start.clone()))
                .await?;
        }
        if released > 0 || !running.is_empty() {
            info!(
                released_locks = released,
                running_instances = running.len(),
                redispatched_activities = redispatched,
                "recovered durable state"
            );
        }
        Ok(())
    }

    /// Create an instance with a generated id and enqueue its first Advance.
    /// Returns as soon as the instance is durably recorded.
    pub async fn create_instance(&self, orchestration_name: &str, input: impl Into<String>) -> Result<String, String> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.start_orchestration(&instance, orchestration_name, input).await?;
        Ok(instance)
    }

    /// Typed variant of `create_instance`; the input is serialized as JSON.
    pub async fn create_instance_typed<In: Serialize>(
        &self,
        orchestration_name: &str,
        input: &In,
    ) -> Result<String, String> {
        let payload = Json::encode(input).map_err(|e| format!("encode: {e}"))?;
        self.create_instance(orchestration_name, payload).await
    }

    /// Create an instance under a caller-chosen id and enqueue its first Advance.
    /// Does not wait for completion; use `wait_for_orchestration`.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<(), String> {
        if !self.orchestration_registry.contains(orchestration_name) {
            return Err(format!("unregistered orchestration: {orchestration_name}"));
        }
        let record = InstanceRecord::new_running(instance, orchestration_name, input);
        self.retry_infra("create_instance", || self.store.create_instance(record.clone()))
            .await
            .map_err(|e| e.to_string())?;
        let item = WorkItem::StartOrchestration {
            instance: instance.to_string(),
        };
        self.retry_infra("enqueue_work", || self.store.enqueue_work(item.queue(), item.clone()))
            .await
            .map_err(|e| e.to_string())?;
        info!(instance, orchestration = orchestration_name, "orchestration instance created");
        Ok(())
    }

    /// Typed variant of `start_orchestration`.
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration_name: &str,
        input: &In,
    ) -> Result<(), String> {
        let payload = Json::encode(input).map_err(|e| format!("encode: {e}"))?;
        self.start_orchestration(instance, orchestration_name, payload).await
    }

    pub async fn get_status(&self, instance: &str) -> Result<OrchestrationStatus, ProviderError> {
        let rec = self
            .retry_infra("get_instance", || self.store.get_instance(instance))
            .await?;
        Ok(rec.map_or(OrchestrationStatus::NotFound, |r| r.status.into()))
    }

    pub async fn get_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        self.retry_infra("get_instance", || self.store.get_instance(instance))
            .await
    }

    pub async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceRecord>, ProviderError> {
        self.retry_infra("list_instances", || self.store.list_instances(filter))
            .await
    }

    /// Stored history of an instance, for diagnostics.
    pub async fn read_history(&self, instance: &str) -> Result<Vec<HistoryRecord>, ProviderError> {
        self.retry_infra("read", || self.store.read_records(instance)).await
    }

    /// Abort the dispatcher pools and wait for them to stop. Items they held
    /// stay peek-locked in the store until the next runtime recovers them.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.iter() {
            j.abort();
        }
        for j in joins.drain(..) {
            let _ = j.await;
        }
    }

    /// Wait until the orchestration reaches a terminal state (Completed/Failed) or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            match self.get_status(instance).await {
                Ok(s @ (OrchestrationStatus::Completed { .. } | OrchestrationStatus::Failed { .. })) => return Ok(s),
                Ok(_) => {}
                Err(e) if e.is_retryable() => warn!(instance, error = %e, "status read failed; still waiting"),
                Err(e) => return Err(WaitError::Other(e.to_string())),
            }
            if std::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            delay_ms = delay_ms.saturating_mul(2).min(100);
        }
    }

    /// Typed variant: returns Ok(Ok<T>) on Completed with decoded output, Ok(Err(String)) on Failed.
    pub async fn wait_for_orchestration_typed<Out: serde::de::DeserializeOwned>(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => Json::decode::<Out>(&output)
                .map(Ok)
                .map_err(|e| WaitError::Other(format!("decode failed: {e}"))),
            OrchestrationStatus::Failed { details } => Ok(Err(details.to_string())),
            other => Err(WaitError::Other(format!("unexpected status {other:?}"))),
        }
    }

    /// Run a store operation, retrying retryable failures with exponential backoff.
    pub(crate) async fn retry_infra<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.options.infra_retry_max_attempts.max(1);
        let mut delay_ms = self.options.infra_retry_base_delay_ms;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(operation, attempt, error = %e, "store operation failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    delay_ms = delay_ms.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn mark_rehydrate(&self, instance: &str) {
        self.rehydrate
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(instance.to_string());
    }

    fn take_rehydrate(&self, instance: &str) -> bool {
        self.rehydrate
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(instance)
    }
}
