use serde_json::Value as JsonValue;
use tracing::trace;

use crate::config::AdvanceOptions;
use crate::context::{Context, ContextId};
use crate::driver::PromiseFuture;
use crate::error::{ContextError, JsException, Result};

/// Observed state of a [`JsPromise`].
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    Pending,
    /// Terminal. Holds the fulfillment value or the rejection reason.
    Done(std::result::Result<JsonValue, JsException>),
}

/// Steppable handle to an asynchronous call running inside a [`Context`].
///
/// The promise only changes state through [`step`](Self::step) (or a driver
/// built on it). Once done it never changes again.
#[derive(Debug)]
pub struct JsPromise {
    context: ContextId,
    id: u64,
    /// Errors recorded by the context up to this sequence number predate the promise.
    errors_seen: u64,
    state: PromiseState,
}

impl JsPromise {
    pub(crate) fn pending(context: ContextId, id: u64, errors_seen: u64) -> Self {
        Self {
            context,
            id,
            errors_seen,
            state: PromiseState::Pending,
        }
    }

    pub(crate) fn settled(
        context: ContextId,
        id: u64,
        outcome: std::result::Result<JsonValue, JsException>,
    ) -> Self {
        Self {
            context,
            id,
            errors_seen: 0,
            state: PromiseState::Done(outcome),
        }
    }

    /// Whether the promise settled as of the last observation. Never touches the engine.
    pub fn is_done(&self) -> bool {
        matches!(self.state, PromiseState::Done(_))
    }

    /// Run one event-loop tick of `ctx` and re-check this promise.
    ///
    /// `ctx` must be the context that created the promise. Stepping a done
    /// promise returns `true` without touching the engine.
    pub fn step(&mut self, ctx: &mut Context) -> Result<bool> {
        ctx.check_owner(self.context)?;
        if self.is_done() {
            return Ok(true);
        }

        let active = ctx.advance(AdvanceOptions::default())?;
        self.observe(ctx, active)?;
        Ok(self.is_done())
    }

    /// The fulfillment value.
    pub fn result(&self) -> Result<JsonValue> {
        match &self.state {
            PromiseState::Pending => Err(ContextError::invalid_state(
                "promise result is not available until it settles",
            )),
            PromiseState::Done(Ok(value)) => Ok(value.clone()),
            PromiseState::Done(Err(exception)) => Err(ContextError::Runtime(exception.clone())),
        }
    }

    /// The rejection reason, or `None` if the promise was fulfilled.
    pub fn exception(&self) -> Result<Option<JsException>> {
        match &self.state {
            PromiseState::Pending => Err(ContextError::invalid_state(
                "promise exception is not available until it settles",
            )),
            PromiseState::Done(Ok(_)) => Ok(None),
            PromiseState::Done(Err(exception)) => Ok(Some(exception.clone())),
        }
    }

    pub fn state(&self) -> &PromiseState {
        &self.state
    }

    /// The context that created this promise.
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// Turn this promise into a future that steps `ctx` on every poll.
    pub fn drive(self, ctx: &mut Context) -> PromiseFuture<'_> {
        PromiseFuture::new(ctx, self)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Re-read the engine-side state without advancing the loop.
    ///
    /// A promise still pending once the loop has nothing left to run can
    /// never settle; it is rejected instead of being left to spin forever.
    pub(crate) fn observe(&mut self, ctx: &mut Context, loop_active: bool) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }
        match ctx.poll_promise(self.id)? {
            Some(outcome) => {
                trace!(promise = self.id, fulfilled = outcome.is_ok(), "Promise settled");
                self.state = PromiseState::Done(outcome);
            }
            None if !loop_active => {
                let reason = ctx.abandon_promise(self.id, self.errors_seen);
                self.state = PromiseState::Done(Err(reason));
            }
            None => {}
        }
        Ok(())
    }
}
