// Not every test binary uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use dtf_fanout::Event;
use dtf_fanout::providers::{
    HistoryStore, InstanceFilter, InstanceRecord, InstanceStatus, InstanceStore, Provider, ProviderError, QueueKind,
    WorkItem,
};
use dtf_fanout::HistoryRecord;
use std::sync::Arc as StdArc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub async fn wait_for_history<F>(store: StdArc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    wait_for_history_event(
        store,
        instance,
        |hist| if predicate(hist) { Some(()) } else { None },
        timeout_ms,
    )
    .await
    .is_some()
}

pub async fn wait_for_history_event<T, F>(
    store: StdArc<dyn Provider>,
    instance: &str,
    selector: F,
    timeout_ms: u64,
) -> Option<T>
where
    T: Clone,
    F: Fn(&Vec<Event>) -> Option<T>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if let Some(e) = selector(&hist) {
            return Some(e);
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// History as it stands before the first turn of `name`.
pub fn started_history(name: &str) -> Vec<Event> {
    vec![Event::OrchestratorStarted {
        name: name.to_string(),
        input: String::new(),
    }]
}

pub fn count_completions(hist: &[Event]) -> usize {
    hist.iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
        .count()
}

/// Activity names scheduled in history, in correlation id order.
pub fn scheduled_names(hist: &[Event]) -> Vec<String> {
    hist.iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

/// Uncompressed 24-bit bottom-up BMP filled with one colour.
pub fn solid_bmp(width: u32, height: u32, rgb: (u8, u8, u8)) -> Vec<u8> {
    let row_len = (width as usize * 3).div_ceil(4) * 4;
    let data_len = row_len * height as usize;
    let mut b = Vec::with_capacity(54 + data_len);
    b.extend_from_slice(b"BM");
    b.extend_from_slice(&((54 + data_len) as u32).to_le_bytes());
    b.extend_from_slice(&[0, 0, 0, 0]);
    b.extend_from_slice(&54u32.to_le_bytes());
    b.extend_from_slice(&40u32.to_le_bytes());
    b.extend_from_slice(&(width as i32).to_le_bytes());
    b.extend_from_slice(&(height as i32).to_le_bytes());
    b.extend_from_slice(&1u16.to_le_bytes());
    b.extend_from_slice(&24u16.to_le_bytes());
    b.extend_from_slice(&0u32.to_le_bytes());
    b.extend_from_slice(&(data_len as u32).to_le_bytes());
    b.extend_from_slice(&[0; 16]);
    for _ in 0..height {
        for _ in 0..width {
            b.extend_from_slice(&[rgb.2, rgb.1, rgb.0]);
        }
        b.resize(b.len() + (row_len - width as usize * 3), 0);
    }
    b
}

/// Provider wrapper that fails the next N appends or worker-queue enqueues
/// with a retryable error before delegating.
pub struct FlakyProvider {
    inner: StdArc<dyn Provider>,
    fail_appends: AtomicU32,
    fail_enqueues: AtomicU32,
    injected: AtomicU32,
}

impl FlakyProvider {
    pub fn new(inner: StdArc<dyn Provider>) -> Self {
        Self {
            inner,
            fail_appends: AtomicU32::new(0),
            fail_enqueues: AtomicU32::new(0),
            injected: AtomicU32::new(0),
        }
    }

    pub fn fail_next_appends(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_worker_enqueues(&self, n: u32) {
        self.fail_enqueues.store(n, Ordering::SeqCst);
    }

    /// Total faults injected so far.
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn take_fault(&self, counter: &AtomicU32, operation: &str) -> Result<(), ProviderError> {
        let hit = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(ProviderError::retryable(operation, "injected fault"));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FlakyProvider {
    async fn read_records(&self, instance: &str) -> Result<Vec<HistoryRecord>, ProviderError> {
        self.inner.read_records(instance).await
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError> {
        self.take_fault(&self.fail_appends, "append")?;
        self.inner.append(instance, new_events).await
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        if kind == QueueKind::Worker {
            self.take_fault(&self.fail_enqueues, "enqueue_work")?;
        }
        self.inner.enqueue_work(kind, item).await
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Result<Option<(WorkItem, String)>, ProviderError> {
        self.inner.dequeue_peek_lock(kind).await
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.inner.ack(kind, token).await
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.inner.abandon(kind, token).await
    }

    async fn release_all_locks(&self) -> Result<usize, ProviderError> {
        self.inner.release_all_locks().await
    }

    async fn dump_all_pretty(&self) -> String {
        self.inner.dump_all_pretty().await
    }
}

#[async_trait]
impl InstanceStore for FlakyProvider {
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError> {
        self.inner.create_instance(record).await
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        self.inner.get_instance(instance).await
    }

    async fn set_terminal(
        &self,
        instance: &str,
        status: InstanceStatus,
        completed_at_ms: u64,
    ) -> Result<(), ProviderError> {
        self.inner.set_terminal(instance, status, completed_at_ms).await
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceRecord>, ProviderError> {
        self.inner.list_instances(filter).await
    }
}
