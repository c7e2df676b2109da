use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{
    HistoryStore, InstanceFilter, InstanceRecord, InstanceStatus, InstanceStore, ProviderError, QueueKind, WorkItem,
    check_terminal_transition, dedupe_appends, stamp,
};
use crate::{Event, HistoryRecord};

#[derive(Default)]
struct Queue {
    ready: VecDeque<WorkItem>,
    locked: HashMap<String, WorkItem>,
}

#[derive(Default)]
struct State {
    histories: HashMap<String, Vec<HistoryRecord>>,
    instances: HashMap<String, InstanceRecord>,
    orchestrator: Queue,
    worker: Queue,
}

impl State {
    fn queue(&mut self, kind: QueueKind) -> &mut Queue {
        match kind {
            QueueKind::Orchestrator => &mut self.orchestrator,
            QueueKind::Worker => &mut self.worker,
        }
    }
}

/// Process-local store for tests and embedding. Survives runtime restarts
/// within one process when the same `Arc` is handed to the next runtime.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    state: Mutex<State>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of items waiting (not locked) in a queue.
    pub fn queue_len(&self, kind: QueueKind) -> usize {
        self.state().queue(kind).ready.len()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read_records(&self, instance: &str) -> Result<Vec<HistoryRecord>, ProviderError> {
        Ok(self.state().histories.get(instance).cloned().unwrap_or_default())
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError> {
        let mut st = self.state();
        if !st.instances.contains_key(instance) {
            return Err(ProviderError::permanent("append", format!("instance not found: {instance}")));
        }
        let records = st.histories.entry(instance.to_string()).or_default();
        let existing: Vec<Event> = records.iter().map(|r| r.event.clone()).collect();
        let fresh = dedupe_appends(&existing, new_events);
        let last_seq = records.last().map(|r| r.seq).unwrap_or(0);
        records.extend(stamp(last_seq, fresh));
        Ok(())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let mut st = self.state();
        let q = st.queue(kind);
        if !q.ready.contains(&item) {
            q.ready.push_back(item);
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut st = self.state();
        let q = st.queue(kind);
        let Some(item) = q.ready.pop_front() else {
            return Ok(None);
        };
        let token = uuid::Uuid::new_v4().to_string();
        q.locked.insert(token.clone(), item.clone());
        Ok(Some((item, token)))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.state().queue(kind).locked.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let mut st = self.state();
        let q = st.queue(kind);
        if let Some(item) = q.locked.remove(token) {
            q.ready.push_front(item);
        }
        Ok(())
    }

    async fn release_all_locks(&self) -> Result<usize, ProviderError> {
        let mut st = self.state();
        let mut released = 0;
        for kind in [QueueKind::Orchestrator, QueueKind::Worker] {
            let q = st.queue(kind);
            for (_, item) in q.locked.drain() {
                if !q.ready.contains(&item) {
                    q.ready.push_front(item);
                }
                released += 1;
            }
        }
        Ok(released)
    }

    async fn dump_all_pretty(&self) -> String {
        let st = self.state();
        let mut ids: Vec<&String> = st.histories.keys().collect();
        ids.sort();
        let mut out = String::new();
        for id in ids {
            out.push_str(&format!("instance={id}\n"));
            for rec in &st.histories[id] {
                out.push_str(&format!("  #{} {:?}\n", rec.seq, rec.event));
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl InstanceStore for InMemoryHistoryStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError> {
        let mut st = self.state();
        if st.instances.contains_key(&record.id) {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {}", record.id),
            ));
        }
        st.histories.insert(record.id.clone(), Vec::new());
        st.instances.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        Ok(self.state().instances.get(instance).cloned())
    }

    async fn set_terminal(
        &self,
        instance: &str,
        status: InstanceStatus,
        completed_at_ms: u64,
    ) -> Result<(), ProviderError> {
        let mut st = self.state();
        let Some(rec) = st.instances.get_mut(instance) else {
            return Err(ProviderError::permanent("set_terminal", format!("instance not found: {instance}")));
        };
        if check_terminal_transition(instance, &rec.status, &status)? {
            rec.status = status;
            rec.completed_at_ms = Some(completed_at_ms);
        }
        Ok(())
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceRecord>, ProviderError> {
        let records: Vec<InstanceRecord> = self.state().instances.values().cloned().collect();
        Ok(filter.apply(records))
    }
}
