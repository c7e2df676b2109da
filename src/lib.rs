//! Durable fan-out/fan-in orchestration core inspired by Durable Task.
//!
//! Orchestrations are plain `async` functions over an [`OrchestrationContext`].
//! Every decision they make is recorded as an append-only [`Event`]; after a
//! restart the runtime replays that history to rebuild identical state and only
//! schedules work it has never recorded. It provides:
//!
//! - Public data model: `Event`, `HistoryRecord`, `Action`, `ErrorDetails`
//! - Orchestration driver: `run_turn`, `run_turn_with`, `run_turn_detailed`
//!   and `Executor`
//! - An `OrchestrationContext` that schedules activities with correlation IDs
//!   assigned in declaration order
//! - `DurableFuture` and `JoinFuture` for fan-out and declaration-order fan-in
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

pub mod analysis;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use crate::futures::{DurableFuture, JoinFuture};
pub use runtime::{
    OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder, OrchestrationStatus, Runtime,
    RuntimeOptions, WaitError,
};

use crate::_typed_codec::Codec;
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};

// Internal codec utilities for typed I/O (kept private; public API remains ergonomic)
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Plain strings travel unquoted so string and typed APIs interoperate
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }

}

/// Why an orchestration instance ended in `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorDetails {
    /// Orchestration code returned an error (usually a fatal activity failure).
    Application { message: String },
    /// Replay diverged from the recorded history.
    Nondeterminism { message: String },
    /// The instance references something the runtime does not know about.
    Configuration { message: String },
    /// A store rejected an operation with a non-retryable error.
    Infrastructure { operation: String, message: String },
}

impl ErrorDetails {
    pub fn message(&self) -> &str {
        match self {
            ErrorDetails::Application { message }
            | ErrorDetails::Nondeterminism { message }
            | ErrorDetails::Configuration { message }
            | ErrorDetails::Infrastructure { message, .. } => message,
        }
    }

    pub fn is_nondeterminism(&self) -> bool {
        matches!(self, ErrorDetails::Nondeterminism { .. })
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Application { message } => write!(f, "{message}"),
            ErrorDetails::Nondeterminism { message } => write!(f, "nondeterministic: {message}"),
            ErrorDetails::Configuration { message } => write!(f, "configuration: {message}"),
            ErrorDetails::Infrastructure { operation, message } => {
                write!(f, "infrastructure: {operation}: {message}")
            }
        }
    }
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Activity variants carry the correlation id that
/// pairs a schedule with its completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// First event of every instance; records the orchestration name and input.
    OrchestratorStarted { name: String, input: String },
    /// Activity was scheduled at correlation `id` with the given input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed with an error string.
    ActivityFailed { id: u64, error: String },
    /// Orchestration completed with a final output.
    OrchestratorCompleted { output: String },
    /// Orchestration failed; the instance is read-only afterwards.
    OrchestratorFailed { details: ErrorDetails },
}

impl Event {
    /// Correlation id for activity events, `None` for orchestrator events.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. } => Some(*id),
            Event::OrchestratorStarted { .. }
            | Event::OrchestratorCompleted { .. }
            | Event::OrchestratorFailed { .. } => None,
        }
    }

    /// True for `ActivityCompleted` and `ActivityFailed`.
    pub fn is_activity_outcome(&self) -> bool {
        matches!(self, Event::ActivityCompleted { .. } | Event::ActivityFailed { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::OrchestratorCompleted { .. } | Event::OrchestratorFailed { .. })
    }
}

/// An `Event` as stored: stamped with its per-instance sequence number and the
/// wall-clock time it was appended. Sequence numbers start at 1 and strictly increase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRecord {
    pub seq: u64,
    pub recorded_at_ms: u64,
    pub event: Event,
}

/// Declarative decisions produced by an orchestration turn. The runtime is
/// responsible for materializing these into work items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { id: u64, name: String, input: String },
}

#[derive(Debug)]
struct CtxInner {
    history: Vec<Event>,
    actions: Vec<Action>,

    // Correlation ids follow call order, so the same code yields the same ids on every replay
    next_correlation_id: u64,
    claimed_activity_ids: HashSet<u64>,
    nondeterminism: Option<String>,

    // Replay tracking: the turn is replaying until the newest recorded outcome is consumed
    last_outcome_id: Option<u64>,
    replaying: bool,

    turn_index: u64,
    log_buffer: Vec<(LogLevel, String)>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let last_outcome_id = history
            .iter()
            .rev()
            .find(|e| e.is_activity_outcome())
            .and_then(Event::correlation_id);
        Self {
            history,
            actions: Vec::new(),
            next_correlation_id: 1,
            claimed_activity_ids: HashSet::new(),
            nondeterminism: None,
            replaying: last_outcome_id.is_some(),
            last_outcome_id,
            turn_index: 0,
            log_buffer: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        // Orchestration code runs on one task per turn; a poisoned lock still holds consistent data
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }

    /// The turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.lock().turn_index = idx;
    }

    /// True while the orchestration is re-executing steps whose outcomes were
    /// already observed by an earlier turn.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    /// Drain the buffered log messages accumulated during the last turn.
    pub fn take_log_buffer(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.lock().log_buffer)
    }

    /// Buffer a log message for the current turn unless it is a replay of a
    /// message already emitted by an earlier turn.
    pub fn trace(&self, level: LogLevel, message: impl Into<String>) {
        let mut inner = self.lock();
        if !inner.replaying {
            inner.log_buffer.push((level, message.into()));
        }
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace(LogLevel::Info, message);
    }
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace(LogLevel::Warn, message);
    }
    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace(LogLevel::Error, message);
    }
    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace(LogLevel::Debug, message);
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it.
    ///
    /// The correlation id is the position of this call in the orchestration's
    /// control flow. Nothing is recorded until the future is first polled.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let id = self.lock().next_id();
        DurableFuture::activity(self.clone(), id, name.into(), input.into())
    }

    /// Typed helper that serializes input; pair with `into_activity_typed`.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        let id = self.lock().next_id();
        match crate::_typed_codec::Json::encode(input) {
            Ok(payload) => DurableFuture::activity(self.clone(), id, name.into(), payload),
            Err(e) => DurableFuture::rejected(format!("encode input for {}: {e}", name.into())),
        }
    }

    /// Fan-in over N futures. Resolves once every child has an outcome and
    /// yields them in the order they were passed in, independent of the order
    /// in which they completed.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    /// Claim correlation `id` for this turn. Records a new schedule when history
    /// has none, and flags nondeterminism when history recorded something else
    /// at this id. Returns false when the schedule conflicts with history.
    pub(crate) fn claim_activity(&self, id: u64, name: &str, input: &str) -> bool {
        let mut inner = self.lock();
        let recorded = inner.history.iter().find_map(|e| match e {
            Event::ActivityScheduled { id: rid, name: n, input: i } if *rid == id => Some((n.clone(), i.clone())),
            _ => None,
        });
        match recorded {
            Some((n, i)) if n == name && i == input => {}
            Some((n, _)) => {
                if inner.nondeterminism.is_none() {
                    inner.nondeterminism = Some(if n != name {
                        format!("activity id={id} was recorded as '{n}' but replay scheduled '{name}'")
                    } else {
                        format!("activity id={id} '{name}' was replayed with different input")
                    });
                }
                return false;
            }
            None => {
                inner.history.push(Event::ActivityScheduled {
                    id,
                    name: name.to_string(),
                    input: input.to_string(),
                });
                inner.actions.push(Action::CallActivity {
                    id,
                    name: name.to_string(),
                    input: input.to_string(),
                });
            }
        }
        inner.claimed_activity_ids.insert(id);
        true
    }

    /// Outcome recorded for correlation `id`, if any.
    pub(crate) fn activity_outcome(&self, id: u64) -> Option<Result<String, String>> {
        let mut inner = self.lock();
        let outcome = inner.history.iter().find_map(|e| match e {
            Event::ActivityCompleted { id: cid, result } if *cid == id => Some(Ok(result.clone())),
            Event::ActivityFailed { id: cid, error } if *cid == id => Some(Err(error.clone())),
            _ => None,
        })?;
        if inner.last_outcome_id == Some(id) {
            inner.replaying = false;
        }
        Some(outcome)
    }
}

fn poll_once<F: Future>(fut: std::pin::Pin<&mut F>) -> Poll<F::Output> {
    let mut cx = Context::from_waker(::futures::task::noop_waker_ref());
    fut.poll(&mut cx)
}

/// Everything a single replay turn produced.
#[derive(Debug)]
pub struct TurnOutcome<O> {
    /// Input history plus any `ActivityScheduled` events recorded this turn.
    pub history: Vec<Event>,
    pub actions: Vec<Action>,
    pub logs: Vec<(LogLevel, String)>,
    pub output: Option<O>,
    /// Correlation ids the orchestration code reached during this turn.
    pub claimed_activity_ids: HashSet<u64>,
    /// Set when replay scheduled something other than what history recorded.
    pub nondeterminism: Option<String>,
}

/// Tuple returned by `run_turn` and `run_turn_with`: updated history, actions
/// to execute, per-turn logs, and an optional output.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Vec<(LogLevel, String)>, Option<O>);

/// Poll the orchestrator once against `history` and report everything the
/// turn produced, including nondeterminism diagnostics.
pub fn run_turn_detailed<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnOutcome<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    ctx.set_turn_index(turn_index);
    let fut = orchestrator(ctx.clone());
    let mut fut = std::pin::pin!(fut);
    let output = match poll_once(fut.as_mut()) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    let actions = ctx.take_actions();
    let logs = ctx.take_log_buffer();
    let mut inner = ctx.lock();
    let nondeterminism = inner.nondeterminism.take();
    TurnOutcome {
        history: std::mem::take(&mut inner.history),
        actions,
        logs,
        // A turn that diverged from history must not complete the instance
        output: if nondeterminism.is_some() { None } else { output },
        claimed_activity_ids: std::mem::take(&mut inner.claimed_activity_ids),
        nondeterminism,
    }
}

/// Poll the orchestrator once with the provided history, producing updated
/// history, requested `Action`s, buffered logs, and an optional output.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with(history, 0, orchestrator)
}

/// Same as `run_turn` but annotates the context with a caller-supplied
/// turn index for diagnostics and logging.
pub fn run_turn_with<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let t = run_turn_detailed(history, turn_index, orchestrator);
    (t.history, t.actions, t.logs, t.output)
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Drives an orchestrator by alternately replaying one turn and invoking
    /// the provided `execute_actions` to materialize requested actions into
    /// history, until the orchestrator completes.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> (Vec<Event>, O)
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let (hist_after_replay, actions, _logs, output) = run_turn(history, &orchestrator);
            history = hist_after_replay;
            if let Some(out) = output {
                return (history, out);
            }
            execute_actions(actions, &mut history);
        }
    }
}
