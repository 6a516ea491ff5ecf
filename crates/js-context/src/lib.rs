//! js-context: an embedded JavaScript engine that a host scheduler drives
//! one event-loop tick at a time.
//!
//! Synchronous calls run to completion, microtasks included. Async calls
//! return a [`JsPromise`] that the host steps until it settles, so JS work
//! can be interleaved with the host's own I/O.
//!
//! ## Core Types
//!
//! - [`Context`] - One engine heap with its own event loop
//! - [`JsPromise`] - Steppable handle to a pending async call
//! - [`JsModule`] - Module source at rest
//! - [`JsHandle`] - A module loaded into a specific context
//!
//! ## Configuration
//!
//! - [`ContextConfig`] / [`ContextBuilder`] - Timeout, heap and stack limits, module base directory
//! - [`AdvanceOptions`] - Flags for a single event-loop tick
//!
//! ## Drivers
//!
//! - [`PromiseFuture`] - Await a promise from an async runtime
//! - [`PromiseSet`] - Step many promises of one context together
//!
//! ## Example
//!
//! ```no_run
//! use js_context::Context;
//!
//! # fn main() -> js_context::Result<()> {
//! let mut ctx = Context::builder().build()?;
//! ctx.eval("globalThis.f = async () => { await new Promise(r => setTimeout(r, 0)); return 42; }")?;
//!
//! let mut promise = ctx.call_async("f", &[])?;
//! while !promise.is_done() {
//!     promise.step(&mut ctx)?;
//! }
//! assert_eq!(promise.result()?, 42);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod module;
pub mod promise;
mod timers;
mod value;

pub use config::{AdvanceOptions, ContextBuilder, ContextConfig};
pub use context::{Context, ContextId, HeapUsage};
pub use driver::{PromiseFuture, PromiseKey, PromiseSet};
pub use error::{ContextError, JsException, Result};
pub use module::{JsHandle, JsModule, MODULE_EXTENSIONS};
pub use promise::{JsPromise, PromiseState};
pub use value::MAX_DEPTH;
