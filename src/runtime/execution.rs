//! Advance: one replay turn for one instance, plus the terminal transitions.

use tracing::{debug, error, info, warn};

use super::{Runtime, detect};
use crate::logging::flush_turn_logs;
use crate::providers::{InstanceStatus, ProviderError, WorkItem, now_ms};
use crate::{Action, ErrorDetails, Event};

fn terminal_status(ev: &Event) -> Option<InstanceStatus> {
    match ev {
        Event::OrchestratorCompleted { output } => Some(InstanceStatus::Completed { output: output.clone() }),
        Event::OrchestratorFailed { details } => Some(InstanceStatus::Failed {
            details: details.clone(),
        }),
        _ => None,
    }
}

impl Runtime {
    /// Replay `instance` against its history after recording `incoming`, then
    /// persist new schedules, dispatch their activities, and finish the
    /// instance if the orchestration returned.
    ///
    /// Safe to repeat: appends and enqueues are idempotent, so a redelivered
    /// item converges on the same history. With `rehydrate` set, activities
    /// that are scheduled but unresolved are dispatched again as well.
    pub(crate) async fn advance(
        &self,
        instance: &str,
        incoming: Option<Event>,
        rehydrate: bool,
    ) -> Result<(), ProviderError> {
        let Some(record) = self
            .retry_infra("get_instance", || self.store.get_instance(instance))
            .await?
        else {
            warn!(instance, "advance requested for unknown instance; dropping");
            return Ok(());
        };
        if record.status.is_terminal() {
            debug!(instance, "instance already terminal; ignoring late work");
            return Ok(());
        }

        let mut history = self.retry_infra("read", || self.store.read(instance)).await?;

        // A terminal event without a terminal record means set_terminal never landed
        if let Some(status) = history.iter().find_map(terminal_status) {
            warn!(instance, "history is terminal but the record is not; repairing");
            return self
                .retry_infra("set_terminal", || self.store.set_terminal(instance, status.clone(), now_ms()))
                .await;
        }

        let mut delta = Vec::new();
        if history.is_empty() {
            delta.push(Event::OrchestratorStarted {
                name: record.orchestration.clone(),
                input: record.input.clone(),
            });
        }
        if let Some(ev) = incoming {
            if detect::is_duplicate_outcome(&history, &ev) {
                warn!(instance, id = ?ev.correlation_id(), "dropping duplicate activity outcome");
            } else if let Some(msg) = detect::detect_orphan_outcome(&history, &ev) {
                return self.fail_instance(instance, ErrorDetails::Nondeterminism { message: msg }).await;
            } else {
                delta.push(ev);
            }
        }
        if !delta.is_empty() {
            self.retry_infra("append", || self.store.append(instance, delta.clone()))
                .await?;
            history.extend(delta);
        }

        if let Some(msg) = detect::detect_orphan_outcomes(&history) {
            return self.fail_instance(instance, ErrorDetails::Nondeterminism { message: msg }).await;
        }

        let Some(handler) = self.orchestration_registry.get(&record.orchestration) else {
            let message = format!("unregistered:{}", record.orchestration);
            return self.fail_instance(instance, ErrorDetails::Configuration { message }).await;
        };

        let turn_index = history.iter().filter(|e| e.is_activity_outcome()).count() as u64;
        let prior_len = history.len();
        let turn = self
            .replay_engine
            .replay(history, turn_index, handler, record.input.clone());

        let divergence = turn
            .nondeterminism
            .clone()
            .or_else(|| detect::detect_unclaimed_schedules(&turn.history[..prior_len], &turn.claimed_activity_ids));
        if let Some(message) = divergence {
            return self.fail_instance(instance, ErrorDetails::Nondeterminism { message }).await;
        }

        flush_turn_logs(instance, &record.orchestration, turn_index, turn.logs);

        let new_events = turn.history[prior_len..].to_vec();
        if !new_events.is_empty() {
            self.retry_infra("append", || self.store.append(instance, new_events.clone()))
                .await?;
        }

        let mut work: Vec<WorkItem> = turn
            .actions
            .iter()
            .map(|a| match a {
                Action::CallActivity { id, name, input } => WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    id: *id,
                    name: name.clone(),
                    input: input.clone(),
                    attempt: 1,
                },
            })
            .collect();
        if rehydrate {
            for (id, name, input) in detect::pending_activities(&turn.history) {
                let item = WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    id,
                    name,
                    input,
                    attempt: 1,
                };
                if !work.contains(&item) {
                    work.push(item);
                }
            }
        }
        for item in &work {
            self.retry_infra("enqueue_work", || self.store.enqueue_work(item.queue(), item.clone()))
                .await?;
        }
        debug!(instance, turn_index, dispatched = work.len(), "turn applied");

        match turn.output {
            Some(Ok(output)) => self.complete_instance(instance, output).await,
            Some(Err(message)) => {
                self.fail_instance(instance, ErrorDetails::Application { message })
                    .await
            }
            None => Ok(()),
        }
    }

    async fn complete_instance(&self, instance: &str, output: String) -> Result<(), ProviderError> {
        let event = Event::OrchestratorCompleted { output: output.clone() };
        self.finish(instance, event, InstanceStatus::Completed { output })
            .await?;
        info!(instance, "orchestration completed");
        Ok(())
    }

    /// Record a fatal failure. Idempotent like every terminal transition.
    pub(crate) async fn fail_instance(&self, instance: &str, details: ErrorDetails) -> Result<(), ProviderError> {
        error!(instance, details = %details, "orchestration failed");
        let event = Event::OrchestratorFailed {
            details: details.clone(),
        };
        self.finish(instance, event, InstanceStatus::Failed { details })
            .await
    }

    async fn finish(&self, instance: &str, event: Event, status: InstanceStatus) -> Result<(), ProviderError> {
        self.retry_infra("append", || self.store.append(instance, vec![event.clone()]))
            .await?;
        self.retry_infra("set_terminal", || {
            self.store.set_terminal(instance, status.clone(), now_ms())
        })
        .await
    }
}
