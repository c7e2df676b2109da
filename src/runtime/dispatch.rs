use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::Runtime;
use crate::Event;
use crate::providers::{QueueKind, WorkItem};

/// Per-instance mutual exclusion for Advance. Non-blocking: a busy instance's
/// item goes back to the queue instead of parking a dispatcher.
#[derive(Default)]
pub(crate) struct InstanceLocks {
    held: Mutex<HashSet<String>>,
}

pub(crate) struct InstanceGuard<'a> {
    locks: &'a InstanceLocks,
    instance: String,
}

impl InstanceLocks {
    pub(crate) fn try_lock(&self, instance: &str) -> Option<InstanceGuard<'_>> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(instance.to_string()) {
            return None;
        }
        Some(InstanceGuard {
            locks: self,
            instance: instance.to_string(),
        })
    }
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.instance);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Runtime {
    async fn idle(&self) {
        tokio::time::sleep(Duration::from_millis(self.options.dispatcher_idle_sleep_ms)).await;
    }

    pub(super) fn spawn_orchestration_dispatcher(self: Arc<Self>, idx: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(dispatcher = idx, "orchestration dispatcher started");
            loop {
                match self.store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                    Ok(Some((item, token))) => self.process_orchestrator_item(item, token).await,
                    Ok(None) => self.idle().await,
                    Err(e) => {
                        warn!(dispatcher = idx, error = %e, "orchestrator dequeue failed");
                        self.idle().await;
                    }
                }
            }
        })
    }

    pub(super) fn spawn_work_dispatcher(self: Arc<Self>, idx: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(dispatcher = idx, "work dispatcher started");
            loop {
                match self.store.dequeue_peek_lock(QueueKind::Worker).await {
                    Ok(Some((item, token))) => self.process_worker_item(item, token).await,
                    Ok(None) => self.idle().await,
                    Err(e) => {
                        warn!(dispatcher = idx, error = %e, "worker dequeue failed");
                        self.idle().await;
                    }
                }
            }
        })
    }

    async fn ack_item(&self, kind: QueueKind, token: &str) {
        if let Err(e) = self.retry_infra("ack", || self.store.ack(kind, token)).await {
            // The item will be redelivered; Advance and history appends are idempotent
            warn!(queue = ?kind, error = %e, "ack failed");
        }
    }

    async fn abandon_item(&self, kind: QueueKind, token: &str) {
        if let Err(e) = self.retry_infra("abandon", || self.store.abandon(kind, token)).await {
            warn!(queue = ?kind, error = %e, "abandon failed; item stays locked until restart");
        }
    }

    async fn process_orchestrator_item(&self, item: WorkItem, token: String) {
        let instance = item.instance().to_string();
        let Some(guard) = self.instance_locks.try_lock(&instance) else {
            debug!(instance, "instance busy; returning item to queue");
            self.abandon_item(QueueKind::Orchestrator, &token).await;
            self.idle().await;
            return;
        };

        let incoming = match item {
            WorkItem::StartOrchestration { .. } => None,
            WorkItem::ActivityCompleted { id, result, .. } => Some(Event::ActivityCompleted { id, result }),
            WorkItem::ActivityFailed { id, error, .. } => Some(Event::ActivityFailed { id, error }),
            other @ WorkItem::ActivityExecute { .. } => {
                error!(?other, "activity work item on orchestrator queue; dropping");
                self.ack_item(QueueKind::Orchestrator, &token).await;
                return;
            }
        };
        debug!(instance, outcome_id = ?incoming.as_ref().and_then(Event::correlation_id), "advancing instance");

        let rehydrate = self.take_rehydrate(&instance);
        match self.advance(&instance, incoming, rehydrate).await {
            Ok(()) => self.ack_item(QueueKind::Orchestrator, &token).await,
            Err(e) if e.is_retryable() => {
                warn!(instance, error = %e, "advance failed; item returned to queue");
                self.mark_rehydrate(&instance);
                drop(guard);
                self.abandon_item(QueueKind::Orchestrator, &token).await;
                self.idle().await;
            }
            Err(e) => {
                error!(instance, error = %e, "advance hit a permanent store error");
                if let Err(fail_err) = self.fail_instance(&instance, e.to_error_details()).await {
                    error!(instance, error = %fail_err, "could not record infrastructure failure");
                }
                self.ack_item(QueueKind::Orchestrator, &token).await;
            }
        }
    }

    async fn process_worker_item(&self, item: WorkItem, token: String) {
        let (instance, id, name, input, attempt) = match item {
            WorkItem::ActivityExecute {
                instance,
                id,
                name,
                input,
                attempt,
            } => (instance, id, name, input, attempt),
            other => {
                error!(?other, "non-activity work item on worker queue; dropping");
                self.ack_item(QueueKind::Worker, &token).await;
                return;
            }
        };

        let completion = match self.execute_activity(&instance, id, &name, &input, attempt).await {
            Ok(result) => WorkItem::ActivityCompleted {
                instance: instance.clone(),
                id,
                result,
            },
            Err(error) => WorkItem::ActivityFailed {
                instance: instance.clone(),
                id,
                error,
            },
        };
        match self
            .retry_infra("enqueue_work", || self.store.enqueue_work(completion.queue(), completion.clone()))
            .await
        {
            Ok(()) => self.ack_item(QueueKind::Worker, &token).await,
            Err(e) => {
                // Activity runs again on redelivery
                warn!(instance, id, name, error = %e, "could not enqueue activity outcome");
                self.abandon_item(QueueKind::Worker, &token).await;
                self.idle().await;
            }
        }
    }

    /// Run an activity with bounded retries, counting from `first_attempt`.
    /// Panics become failures.
    async fn execute_activity(
        &self,
        instance: &str,
        id: u64,
        name: &str,
        input: &str,
        first_attempt: u32,
    ) -> Result<String, String> {
        let Some(handler) = self.activity_registry.get(name) else {
            warn!(instance, id, name, "unregistered activity");
            return Err(format!("unregistered:{name}"));
        };
        let max_attempts = self.options.activity_max_attempts.max(1);
        let mut attempt = first_attempt.max(1);
        loop {
            debug!(instance, id, name, attempt, "executing activity");
            let result = match AssertUnwindSafe(handler.invoke(input.to_string())).catch_unwind().await {
                Ok(r) => r,
                Err(payload) => Err(format!("activity panicked: {}", panic_message(payload.as_ref()))),
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if attempt < max_attempts => {
                    warn!(instance, id, name, attempt, error = %e, "activity failed; retrying");
                    tokio::time::sleep(Duration::from_millis(self.options.activity_retry_delay_ms)).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(instance, id, name, attempt, error = %e, "activity failed");
                    return Err(e);
                }
            }
        }
    }
}
