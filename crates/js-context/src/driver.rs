//! Adapters for hosts that schedule promises instead of stepping them by hand.
//!
//! [`PromiseFuture`] lets an async runtime await a single [`JsPromise`].
//! [`PromiseSet`] round-robins many promises from one context, sharing each
//! event-loop tick between them.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::config::AdvanceOptions;
use crate::context::Context;
use crate::error::{ContextError, Result};
use crate::promise::JsPromise;

/// Future resolving to a promise's fulfillment value.
///
/// Every poll runs one tick. While the promise is pending the future wakes
/// itself right away, so other tasks on the executor get a turn between ticks.
#[derive(Debug)]
pub struct PromiseFuture<'a> {
    context: &'a mut Context,
    promise: Option<JsPromise>,
}

impl<'a> PromiseFuture<'a> {
    pub(crate) fn new(context: &'a mut Context, promise: JsPromise) -> Self {
        Self {
            context,
            promise: Some(promise),
        }
    }

    /// Stop driving and hand the promise back.
    pub fn into_promise(self) -> Option<JsPromise> {
        self.promise
    }
}

impl Future for PromiseFuture<'_> {
    type Output = Result<JsonValue>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(promise) = this.promise.as_mut() else {
            return Poll::Ready(Err(ContextError::invalid_state(
                "promise future polled after completion",
            )));
        };

        match promise.step(this.context) {
            Ok(true) => {
                let result = promise.result();
                this.promise = None;
                Poll::Ready(result)
            }
            Ok(false) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(err) => {
                this.promise = None;
                Poll::Ready(Err(err))
            }
        }
    }
}

/// Key of a promise inside a [`PromiseSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseKey(u64);

/// A group of promises from the same context, stepped together.
#[derive(Debug, Default)]
pub struct PromiseSet {
    promises: BTreeMap<PromiseKey, JsPromise>,
    next_key: u64,
}

impl PromiseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, promise: JsPromise) -> PromiseKey {
        let key = PromiseKey(self.next_key);
        self.next_key += 1;
        self.promises.insert(key, promise);
        key
    }

    pub fn get(&self, key: PromiseKey) -> Option<&JsPromise> {
        self.promises.get(&key)
    }

    pub fn take(&mut self, key: PromiseKey) -> Option<JsPromise> {
        self.promises.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.promises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.promises.values().filter(|p| !p.is_done()).count()
    }

    /// Run one tick of `ctx` and re-check every pending promise.
    ///
    /// Returns the keys of promises that settled during this round.
    pub fn poll_round(&mut self, ctx: &mut Context) -> Result<Vec<PromiseKey>> {
        for promise in self.promises.values() {
            ctx.check_owner(promise.context_id())?;
        }
        if self.pending() == 0 {
            return Ok(Vec::new());
        }

        let active = ctx.advance(AdvanceOptions::default())?;
        let mut settled = Vec::new();
        for (key, promise) in self.promises.iter_mut().filter(|(_, p)| !p.is_done()) {
            promise.observe(ctx, active)?;
            if promise.is_done() {
                settled.push(*key);
            }
        }
        Ok(settled)
    }

    /// Poll rounds until every promise settles or `max_rounds` run out.
    ///
    /// Returns whether every promise in the set is done.
    pub fn wait_all(&mut self, ctx: &mut Context, max_rounds: usize) -> Result<bool> {
        for _ in 0..max_rounds {
            if self.pending() == 0 {
                break;
            }
            self.poll_round(ctx)?;
        }
        Ok(self.pending() == 0)
    }

    /// Remove every settled promise.
    pub fn drain_done(&mut self) -> Vec<(PromiseKey, JsPromise)> {
        let done: Vec<PromiseKey> = self
            .promises
            .iter()
            .filter(|(_, p)| p.is_done())
            .map(|(key, _)| *key)
            .collect();
        done.into_iter()
            .filter_map(|key| self.promises.remove(&key).map(|p| (key, p)))
            .collect()
    }

    /// Drop every pending promise, releasing it from `ctx`.
    ///
    /// JS work already queued still runs on later ticks; only the host stops
    /// waiting for it. Returns how many promises were cancelled.
    pub fn cancel_all(&mut self, ctx: &mut Context) -> Result<usize> {
        let pending: Vec<PromiseKey> = self
            .promises
            .iter()
            .filter(|(_, p)| !p.is_done())
            .map(|(key, _)| *key)
            .collect();
        for key in &pending {
            if let Some(promise) = self.promises.remove(key) {
                ctx.release(promise)?;
            }
        }
        if !pending.is_empty() {
            debug!(context = %ctx.id(), count = pending.len(), "Cancelled pending promises");
        }
        Ok(pending.len())
    }
}
