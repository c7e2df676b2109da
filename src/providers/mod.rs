use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{ErrorDetails, Event, HistoryRecord};

pub mod error;
pub mod fs;
pub mod in_memory;

pub use error::ProviderError;

/// Durable queues used by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Advance requests: instance starts and activity outcomes.
    Orchestrator,
    /// Activity invocations.
    Worker,
}

/// Provider-backed work item carried by the durable queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
    },
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
        /// Attempt number the worker starts counting from. The worker retries in
        /// place up to `activity_max_attempts`; a redelivered item starts a fresh
        /// budget, so this counts attempts within one delivery only.
        attempt: u32,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. } => instance,
        }
    }

    pub fn queue(&self) -> QueueKind {
        match self {
            WorkItem::ActivityExecute { .. } => QueueKind::Worker,
            _ => QueueKind::Orchestrator,
        }
    }
}

/// Lifecycle state of an instance as kept by the instance store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Completed { output: String },
    Failed { details: ErrorDetails },
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }

    pub fn kind(&self) -> StatusKind {
        match self {
            InstanceStatus::Running => StatusKind::Running,
            InstanceStatus::Completed { .. } => StatusKind::Completed,
            InstanceStatus::Failed { .. } => StatusKind::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusKind {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: String,
    pub orchestration: String,
    pub input: String,
    pub status: InstanceStatus,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

impl InstanceRecord {
    pub fn new_running(id: impl Into<String>, orchestration: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            orchestration: orchestration.into(),
            input: input.into(),
            status: InstanceStatus::Running,
            created_at_ms: now_ms(),
            completed_at_ms: None,
        }
    }
}

/// Query over instance records. Empty filter matches everything; results are
/// ordered newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub created_after_ms: Option<u64>,
    pub created_before_ms: Option<u64>,
    pub status: Option<StatusKind>,
    pub limit: Option<usize>,
}

impl InstanceFilter {
    pub fn running() -> Self {
        Self {
            status: Some(StatusKind::Running),
            ..Default::default()
        }
    }

    pub fn matches(&self, rec: &InstanceRecord) -> bool {
        self.created_after_ms.is_none_or(|t| rec.created_at_ms >= t)
            && self.created_before_ms.is_none_or(|t| rec.created_at_ms < t)
            && self.status.is_none_or(|s| rec.status.kind() == s)
    }

    /// Filter, sort newest first (ties broken by id), then truncate to the limit.
    pub fn apply(&self, records: impl IntoIterator<Item = InstanceRecord>) -> Vec<InstanceRecord> {
        let mut out: Vec<InstanceRecord> = records.into_iter().filter(|r| self.matches(r)).collect();
        out.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Append-only history plus the durable work queues.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Ordered events for replay. Unknown instances yield an empty history.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        Ok(self.read_records(instance).await?.into_iter().map(|r| r.event).collect())
    }

    /// Stored records including sequence numbers and timestamps.
    async fn read_records(&self, instance: &str) -> Result<Vec<HistoryRecord>, ProviderError>;

    /// Atomically and durably append events. Duplicate schedules, outcomes for
    /// an already resolved correlation id, and second terminal events are
    /// dropped so retried appends are harmless.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError>;

    /// Enqueue a work item; an identical item already waiting is not duplicated.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError>;

    /// Hide the next item behind a lock token until `ack` or `abandon`.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Delete a locked item. Unknown tokens are ignored.
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;

    /// Return a locked item to the front of its queue. Unknown tokens are ignored.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;

    /// Return every locked item to its queue. Used when a process restarts
    /// and the previous owner of the locks is gone.
    async fn release_all_locks(&self) -> Result<usize, ProviderError>;

    /// Human-readable dump of every stored history.
    async fn dump_all_pretty(&self) -> String;
}

/// Durable record of instances and their terminal state.
#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    /// Fails permanently if an instance with the same id exists.
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError>;

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError>;

    /// Move a running instance to a terminal status. Repeating the same
    /// terminal status is a no-op; a different one is rejected.
    async fn set_terminal(
        &self,
        instance: &str,
        status: InstanceStatus,
        completed_at_ms: u64,
    ) -> Result<(), ProviderError>;

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceRecord>, ProviderError>;
}

/// Everything the runtime needs from a backend.
pub trait Provider: HistoryStore + InstanceStore {}

impl<T: HistoryStore + InstanceStore + ?Sized> Provider for T {}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Hash, PartialEq, Eq)]
enum Slot {
    Started,
    Scheduled(u64),
    Outcome(u64),
    Terminal,
}

fn slot(ev: &Event) -> Slot {
    match ev {
        Event::OrchestratorStarted { .. } => Slot::Started,
        Event::ActivityScheduled { id, .. } => Slot::Scheduled(*id),
        Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Slot::Outcome(*id),
        Event::OrchestratorCompleted { .. } | Event::OrchestratorFailed { .. } => Slot::Terminal,
    }
}

/// Drop events whose slot is already taken in `existing` (or earlier in
/// `new_events`). Every event kind occupies at most one slot per instance.
pub(crate) fn dedupe_appends(existing: &[Event], new_events: Vec<Event>) -> Vec<Event> {
    let mut seen: HashSet<Slot> = existing.iter().map(slot).collect();
    new_events.into_iter().filter(|ev| seen.insert(slot(ev))).collect()
}

/// Decide whether `set_terminal` should write. `Ok(false)` means the same
/// terminal status is already stored.
pub(crate) fn check_terminal_transition(
    instance: &str,
    current: &InstanceStatus,
    next: &InstanceStatus,
) -> Result<bool, ProviderError> {
    if !next.is_terminal() {
        return Err(ProviderError::permanent(
            "set_terminal",
            format!("{instance}: Running is not a terminal status"),
        ));
    }
    match current {
        InstanceStatus::Running => Ok(true),
        same if same == next => Ok(false),
        other => Err(ProviderError::permanent(
            "set_terminal",
            format!("{instance}: already terminal as {:?}", other.kind()),
        )),
    }
}

/// Stamp events with sequence numbers continuing after `last_seq`.
pub(crate) fn stamp(last_seq: u64, events: Vec<Event>) -> Vec<HistoryRecord> {
    let recorded_at_ms = now_ms();
    events
        .into_iter()
        .enumerate()
        .map(|(i, event)| HistoryRecord {
            seq: last_seq + 1 + i as u64,
            recorded_at_ms,
            event,
        })
        .collect()
}
