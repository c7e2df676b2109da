use std::sync::Arc;

use crate::runtime::OrchestrationHandler;
use crate::{Event, TurnOutcome};

/// Replays one orchestration turn. Pure: no I/O, no clocks, no randomness.
pub trait ReplayEngine: Send + Sync {
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnOutcome<Result<String, String>>;
}

#[derive(Default)]
pub struct DefaultReplayEngine;

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> TurnOutcome<Result<String, String>> {
        let orchestrator = |ctx: crate::OrchestrationContext| {
            let h = handler.clone();
            let inp = input.clone();
            async move { h.invoke(ctx, inp).await }
        };
        crate::run_turn_detailed(history, turn_index, orchestrator)
    }
}
