use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

use super::{
    HistoryStore, InstanceFilter, InstanceRecord, InstanceStatus, InstanceStore, ProviderError, QueueKind, WorkItem,
    check_terminal_transition, dedupe_appends, stamp,
};
use crate::{Event, HistoryRecord};

/// Filesystem-backed store.
///
/// Layout under `root`:
/// - `instances/<id>/instance.json`: the instance record
/// - `instances/<id>/history.jsonl`: one `HistoryRecord` per line
/// - `orch-queue.jsonl`, `work-queue.jsonl`: ready work items
/// - `.locks/{orch,work}/<token>.lock`: peek-locked items
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    // Read-modify-write of each queue file
    orch_io: Arc<Mutex<()>>,
    work_io: Arc<Mutex<()>>,
    // Appends and record writes, per instance
    instance_io: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort create; failures surface on first use
        let _ = std::fs::create_dir_all(path.join("instances"));
        Self {
            orch_queue_file: path.join("orch-queue.jsonl"),
            work_queue_file: path.join("work-queue.jsonl"),
            root: path,
            orch_io: Arc::default(),
            work_io: Arc::default(),
            instance_io: Arc::default(),
        }
    }

    fn inst_root(&self, operation: &str, instance: &str) -> Result<PathBuf, ProviderError> {
        validate_instance_id(operation, instance)?;
        Ok(self.root.join("instances").join(instance))
    }
    fn history_path(&self, operation: &str, instance: &str) -> Result<PathBuf, ProviderError> {
        Ok(self.inst_root(operation, instance)?.join("history.jsonl"))
    }
    fn record_path(&self, operation: &str, instance: &str) -> Result<PathBuf, ProviderError> {
        Ok(self.inst_root(operation, instance)?.join("instance.json"))
    }
    fn queue_lock(&self, kind: QueueKind) -> &Mutex<()> {
        match kind {
            QueueKind::Orchestrator => &self.orch_io,
            QueueKind::Worker => &self.work_io,
        }
    }
    async fn instance_lock(&self, instance: &str) -> Arc<Mutex<()>> {
        self.instance_io
            .lock()
            .await
            .entry(instance.to_string())
            .or_default()
            .clone()
    }
    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
        }
    }
    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }
    fn queue_file(&self, kind: QueueKind) -> &PathBuf {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
        }
    }

    async fn read_queue(&self, kind: QueueKind) -> Result<Vec<WorkItem>, ProviderError> {
        let content = match fs::read_to_string(self.queue_file(kind)).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProviderError::from_io("read_queue", e)),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str::<WorkItem>(l).map_err(|e| ProviderError::from_json("read_queue", e)))
            .collect()
    }

    /// Rewrite a queue file via temp file + rename so readers never see a torn file.
    async fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), ProviderError> {
        let mut buf = String::new();
        for it in items {
            buf.push_str(&serde_json::to_string(it).map_err(|e| ProviderError::from_json("write_queue", e))?);
            buf.push('\n');
        }
        let qf = self.queue_file(kind);
        write_atomic(&qf.with_extension("jsonl.tmp"), qf, buf.as_bytes()).await
    }

    async fn read_record(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        if !is_safe_instance_id(instance) {
            return Ok(None);
        }
        match fs::read_to_string(self.record_path("get_instance", instance)?).await {
            Ok(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| ProviderError::from_json("get_instance", e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::from_io("get_instance", e)),
        }
    }

    async fn write_record(&self, record: &InstanceRecord) -> Result<(), ProviderError> {
        let data = serde_json::to_vec_pretty(record).map_err(|e| ProviderError::from_json("write_instance", e))?;
        let path = self.record_path("write_instance", &record.id)?;
        write_atomic(&path.with_extension("json.tmp"), &path, &data).await
    }

    async fn instance_ids(&self) -> Result<Vec<String>, ProviderError> {
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(self.root.join("instances")).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(ProviderError::from_io("list_instances", e)),
        };
        while let Some(ent) = rd
            .next_entry()
            .await
            .map_err(|e| ProviderError::from_io("list_instances", e))?
        {
            if let Some(name) = ent.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }
}

async fn write_atomic(tmp: &Path, dest: &Path, data: &[u8]) -> Result<(), ProviderError> {
    let mut f = fs::File::create(tmp)
        .await
        .map_err(|e| ProviderError::from_io("write", e))?;
    f.write_all(data).await.map_err(|e| ProviderError::from_io("write", e))?;
    f.sync_all().await.map_err(|e| ProviderError::from_io("write", e))?;
    drop(f);
    fs::rename(tmp, dest)
        .await
        .map_err(|e| ProviderError::from_io("write", e))
}

fn is_safe_instance_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn validate_instance_id(operation: &str, id: &str) -> Result<(), ProviderError> {
    if is_safe_instance_id(id) {
        Ok(())
    } else {
        Err(ProviderError::permanent(
            operation,
            format!("instance id is not filesystem safe: {id:?}"),
        ))
    }
}

/// Parse a history file. Returns the records and the length of the complete
/// prefix: bytes after the last newline are a torn write that was never
/// acknowledged. An unreadable complete line is corruption.
fn parse_history(instance: &str, data: &[u8]) -> Result<(Vec<HistoryRecord>, usize), ProviderError> {
    let complete_len = data.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    if complete_len < data.len() {
        tracing::warn!(instance, torn_bytes = data.len() - complete_len, "ignoring torn history tail");
    }
    let mut out = Vec::new();
    for (idx, line) in data[..complete_len].split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let rec = serde_json::from_slice::<HistoryRecord>(line).map_err(|e| {
            ProviderError::permanent("read", format!("corrupt history for {instance} at line {}: {e}", idx + 1))
        })?;
        out.push(rec);
    }
    Ok((out, complete_len))
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read_records(&self, instance: &str) -> Result<Vec<HistoryRecord>, ProviderError> {
        if !is_safe_instance_id(instance) {
            return Ok(Vec::new());
        }
        let data = match fs::read(self.history_path("read", instance)?).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProviderError::from_io("read", e)),
        };
        parse_history(instance, &data).map(|(records, _)| records)
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError> {
        let path = self.history_path("append", instance)?;
        let lock = self.instance_lock(instance).await;
        let _guard = lock.lock().await;
        let data = match fs::read(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::permanent("append", format!("instance not found: {instance}")));
            }
            Err(e) => return Err(ProviderError::from_io("append", e)),
        };
        let (existing, complete_len) = parse_history(instance, &data)?;
        let last_seq = existing.last().map(|r| r.seq).unwrap_or(0);
        let existing: Vec<Event> = existing.into_iter().map(|r| r.event).collect();
        let fresh = dedupe_appends(&existing, new_events);
        if fresh.is_empty() {
            return Ok(());
        }
        // Whole batch goes out in one write followed by sync_all
        let mut buf = String::new();
        for rec in stamp(last_seq, fresh) {
            buf.push_str(&serde_json::to_string(&rec).map_err(|e| ProviderError::from_json("append", e))?);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| ProviderError::from_io("append", e))?;
        // New records must not be glued onto a torn tail
        if complete_len < data.len() {
            file.set_len(complete_len as u64)
                .await
                .map_err(|e| ProviderError::from_io("append", e))?;
        }
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| ProviderError::from_io("append", e))?;
        file.sync_all().await.map_err(|e| ProviderError::from_io("append", e))?;
        Ok(())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let _guard = self.queue_lock(kind).lock().await;
        let mut items = self.read_queue(kind).await?;
        if items.contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.write_queue(kind, &items).await
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let _guard = self.queue_lock(kind).lock().await;
        let mut items = self.read_queue(kind).await?;
        if items.is_empty() {
            return Ok(None);
        }
        let first = items.remove(0);
        // Persist the lock sidecar before removing the item so a crash never loses it
        let token = uuid::Uuid::new_v4().to_string();
        fs::create_dir_all(self.lock_dir(kind))
            .await
            .map_err(|e| ProviderError::from_io("dequeue_peek_lock", e))?;
        let line = serde_json::to_vec(&first).map_err(|e| ProviderError::from_json("dequeue_peek_lock", e))?;
        let lock_path = self.lock_path(kind, &token);
        write_atomic(&lock_path.with_extension("tmp"), &lock_path, &line).await?;
        self.write_queue(kind, &items).await?;
        Ok(Some((first, token)))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let _guard = self.queue_lock(kind).lock().await;
        match fs::remove_file(self.lock_path(kind, token)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProviderError::from_io("ack", e)),
        }
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let _guard = self.queue_lock(kind).lock().await;
        let path = self.lock_path(kind, token);
        let data = match fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ProviderError::from_io("abandon", e)),
        };
        let item: WorkItem = serde_json::from_str(&data).map_err(|e| ProviderError::from_json("abandon", e))?;
        let mut items = self.read_queue(kind).await?;
        if !items.contains(&item) {
            items.insert(0, item);
        }
        self.write_queue(kind, &items).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| ProviderError::from_io("abandon", e))
    }

    async fn release_all_locks(&self) -> Result<usize, ProviderError> {
        let mut tokens = Vec::new();
        for kind in [QueueKind::Orchestrator, QueueKind::Worker] {
            let mut rd = match fs::read_dir(self.lock_dir(kind)).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(ProviderError::from_io("release_all_locks", e)),
            };
            while let Some(ent) = rd
                .next_entry()
                .await
                .map_err(|e| ProviderError::from_io("release_all_locks", e))?
            {
                if let Some(token) = ent.file_name().to_str().and_then(|n| n.strip_suffix(".lock")) {
                    tokens.push((kind, token.to_string()));
                }
            }
        }
        for (kind, token) in &tokens {
            self.abandon(*kind, token).await?;
        }
        Ok(tokens.len())
    }

    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.instance_ids().await.unwrap_or_default() {
            out.push_str(&format!("instance={inst}\n"));
            for rec in self.read_records(&inst).await.unwrap_or_default() {
                out.push_str(&format!("  #{} {:?}\n", rec.seq, rec.event));
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl InstanceStore for FsHistoryStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError> {
        let inst_dir = self.inst_root("create_instance", &record.id)?;
        let lock = self.instance_lock(&record.id).await;
        let _guard = lock.lock().await;
        if fs::try_exists(&inst_dir)
            .await
            .map_err(|e| ProviderError::from_io("create_instance", e))?
        {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {}", record.id),
            ));
        }
        fs::create_dir_all(&inst_dir)
            .await
            .map_err(|e| ProviderError::from_io("create_instance", e))?;
        fs::File::create(inst_dir.join("history.jsonl"))
            .await
            .map_err(|e| ProviderError::from_io("create_instance", e))?;
        self.write_record(&record).await
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        self.read_record(instance).await
    }

    async fn set_terminal(
        &self,
        instance: &str,
        status: InstanceStatus,
        completed_at_ms: u64,
    ) -> Result<(), ProviderError> {
        validate_instance_id("set_terminal", instance)?;
        let lock = self.instance_lock(instance).await;
        let _guard = lock.lock().await;
        let Some(mut rec) = self.read_record(instance).await? else {
            return Err(ProviderError::permanent("set_terminal", format!("instance not found: {instance}")));
        };
        if check_terminal_transition(instance, &rec.status, &status)? {
            rec.status = status;
            rec.completed_at_ms = Some(completed_at_ms);
            self.write_record(&rec).await?;
        }
        Ok(())
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceRecord>, ProviderError> {
        let mut records = Vec::new();
        for id in self.instance_ids().await? {
            if let Some(rec) = self.read_record(&id).await? {
                records.push(rec);
            }
        }
        Ok(filter.apply(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_and_status_survive_reopen() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), true);
        store
            .create_instance(InstanceRecord::new_running("inst-1", "o", "in"))
            .await
            .unwrap();
        store
            .append(
                "inst-1",
                vec![
                    Event::OrchestratorStarted {
                        name: "o".into(),
                        input: "in".into(),
                    },
                    Event::ActivityScheduled {
                        id: 1,
                        name: "a".into(),
                        input: "x".into(),
                    },
                ],
            )
            .await
            .unwrap();
        store
            .set_terminal("inst-1", InstanceStatus::Completed { output: "done".into() }, 5)
            .await
            .unwrap();

        let reopened = FsHistoryStore::new(td.path(), false);
        let recs = reopened.read_records("inst-1").await.unwrap();
        assert_eq!(recs.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2]);
        let rec = reopened.get_instance("inst-1").await.unwrap().unwrap();
        assert_eq!(rec.status, InstanceStatus::Completed { output: "done".into() });
        assert_eq!(rec.completed_at_ms, Some(5));
    }

    #[tokio::test]
    async fn locked_items_are_released_after_reopen() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), true);
        let item = WorkItem::StartOrchestration { instance: "x".into() };
        store.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();
        let (got, _token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap().unwrap();
        assert_eq!(got, item);
        assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap().is_none());

        let reopened = FsHistoryStore::new(td.path(), false);
        assert_eq!(reopened.release_all_locks().await.unwrap(), 1);
        let (again, token) = reopened.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap().unwrap();
        assert_eq!(again, item);
        reopened.ack(QueueKind::Orchestrator, &token).await.unwrap();
        assert_eq!(reopened.release_all_locks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_unsafe_instance_ids() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), true);
        let err = store
            .create_instance(InstanceRecord::new_running("../escape", "o", ""))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    fn started() -> Event {
        Event::OrchestratorStarted {
            name: "o".into(),
            input: "in".into(),
        }
    }

    fn scheduled(id: u64) -> Event {
        Event::ActivityScheduled {
            id,
            name: "a".into(),
            input: "x".into(),
        }
    }

    fn plant(path: &Path, bytes: &[u8]) {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[tokio::test]
    async fn torn_tail_is_cut_before_the_next_append() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), true);
        store
            .create_instance(InstanceRecord::new_running("inst-torn", "o", "in"))
            .await
            .unwrap();
        store.append("inst-torn", vec![started()]).await.unwrap();
        let path = td.path().join("instances").join("inst-torn").join("history.jsonl");
        plant(&path, br#"{"seq":2,"recorded_at_ms":1,"event":{"ActivitySch"#);
        assert_eq!(store.read_records("inst-torn").await.unwrap().len(), 1);

        store.append("inst-torn", vec![scheduled(1)]).await.unwrap();

        let reopened = FsHistoryStore::new(td.path(), false);
        let recs = reopened.read_records("inst-torn").await.unwrap();
        assert_eq!(recs.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2]);
        let events: Vec<Event> = recs.into_iter().map(|r| r.event).collect();
        assert_eq!(events, vec![started(), scheduled(1)]);
    }

    #[tokio::test]
    async fn corrupt_complete_line_is_a_permanent_error() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), true);
        store
            .create_instance(InstanceRecord::new_running("inst-bad", "o", "in"))
            .await
            .unwrap();
        store.append("inst-bad", vec![started()]).await.unwrap();
        let path = td.path().join("instances").join("inst-bad").join("history.jsonl");
        plant(&path, b"not json\n");

        let err = store.read_records("inst-bad").await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("line 2"), "{err}");
        let err = store.append("inst-bad", vec![scheduled(1)]).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unsafe_ids_never_leave_the_store_root() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path().join("root"), true);
        // A record one level above `instances/` that an unchecked join would reach
        let outside = td.path().join("root").join("secret");
        std::fs::create_dir_all(&outside).unwrap();
        let rec = InstanceRecord::new_running("secret", "o", "");
        std::fs::write(outside.join("instance.json"), serde_json::to_vec(&rec).unwrap()).unwrap();
        std::fs::write(outside.join("history.jsonl"), b"").unwrap();

        assert!(store.get_instance("../secret").await.unwrap().is_none());
        assert!(store.read_records("../secret").await.unwrap().is_empty());
        let done = InstanceStatus::Completed { output: String::new() };
        assert!(store.set_terminal("../secret", done, 1).await.is_err());
        assert!(store.append("../secret", vec![started()]).await.is_err());
    }

    #[tokio::test]
    async fn busy_instance_does_not_block_other_instances_or_queues() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), true);
        for id in ["inst-a", "inst-b"] {
            store
                .create_instance(InstanceRecord::new_running(id, "o", "in"))
                .await
                .unwrap();
        }
        let lock = store.instance_lock("inst-a").await;
        let _held = lock.lock().await;

        let within = std::time::Duration::from_secs(1);
        tokio::time::timeout(within, store.append("inst-b", vec![started()]))
            .await
            .expect("append on another instance waited on inst-a")
            .unwrap();
        let item = WorkItem::StartOrchestration { instance: "inst-b".into() };
        tokio::time::timeout(within, store.enqueue_work(QueueKind::Orchestrator, item))
            .await
            .expect("enqueue waited on inst-a")
            .unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.append("inst-a", vec![started()]),
        )
        .await;
        assert!(blocked.is_err(), "append on inst-a must wait for its lock");
    }
}
