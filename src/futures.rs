use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::OrchestrationContext;
use crate::_typed_codec::{Codec, Json};

pub(crate) enum Kind {
    Activity {
        id: u64,
        name: String,
        input: String,
        claimed: Cell<bool>,
        ctx: OrchestrationContext,
    },
    // Input failed to encode; resolves to the error without scheduling anything
    Rejected {
        error: String,
    },
}

/// A durable activity future. The first poll records the schedule (or
/// validates it against history); later polls resolve from the recorded
/// completion or failure for the same correlation id.
pub struct DurableFuture(pub(crate) Kind);

impl DurableFuture {
    pub(crate) fn activity(ctx: OrchestrationContext, id: u64, name: String, input: String) -> Self {
        DurableFuture(Kind::Activity {
            id,
            name,
            input,
            claimed: Cell::new(false),
            ctx,
        })
    }

    pub(crate) fn rejected(error: String) -> Self {
        DurableFuture(Kind::Rejected { error })
    }

    /// Correlation id assigned at scheduling time.
    pub fn correlation_id(&self) -> Option<u64> {
        match &self.0 {
            Kind::Activity { id, .. } => Some(*id),
            Kind::Rejected { .. } => None,
        }
    }

    pub fn activity_name(&self) -> Option<&str> {
        match &self.0 {
            Kind::Activity { name, .. } => Some(name),
            Kind::Rejected { .. } => None,
        }
    }

    /// Await the raw string outcome of the activity.
    pub async fn into_activity(self) -> Result<String, String> {
        self.await
    }

    /// Await the activity and decode its success payload.
    pub async fn into_activity_typed<Out: DeserializeOwned>(self) -> Result<Out, String> {
        let raw = self.await?;
        Json::decode::<Out>(&raw)
    }
}

impl Future for DurableFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &self.get_mut().0 {
            Kind::Rejected { error } => Poll::Ready(Err(error.clone())),
            Kind::Activity {
                id,
                name,
                input,
                claimed,
                ctx,
            } => {
                if !claimed.get() {
                    if !ctx.claim_activity(*id, name, input) {
                        // Diverged from history; the turn is failed by the host
                        return Poll::Pending;
                    }
                    claimed.set(true);
                }
                match ctx.activity_outcome(*id) {
                    Some(outcome) => Poll::Ready(outcome),
                    None => Poll::Pending,
                }
            }
        }
    }
}

/// Fan-in over a set of `DurableFuture`s.
///
/// Every child is polled on every poll so the whole fan-out is recorded in the
/// first turn. Outcomes are returned in the order the children were supplied.
pub struct JoinFuture {
    children: Vec<DurableFuture>,
    outcomes: Vec<Option<Result<String, String>>>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        let outcomes = children.iter().map(|_| None).collect();
        Self { children, outcomes }
    }

    /// Correlation ids this join waits on, in declaration order.
    pub fn correlation_ids(&self) -> Vec<u64> {
        self.children.iter().filter_map(DurableFuture::correlation_id).collect()
    }
}

impl Future for JoinFuture {
    type Output = Vec<Result<String, String>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (child, slot) in this.children.iter_mut().zip(this.outcomes.iter_mut()) {
            if slot.is_some() {
                continue;
            }
            if let Poll::Ready(outcome) = Pin::new(child).poll(cx) {
                *slot = Some(outcome);
            }
        }
        if this.outcomes.iter().all(Option::is_some) {
            Poll::Ready(this.outcomes.iter_mut().filter_map(Option::take).collect())
        } else {
            Poll::Pending
        }
    }
}
