use std::path::PathBuf;
use std::time::Duration;

use crate::context::Context;
use crate::error::Result;

/// Configurable options for a [`Context`].
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    /// Wall-clock bound for any single synchronous operation (eval/call/load).
    /// `None` disables the interrupt handler entirely.
    pub timeout: Option<Duration>,

    /// Hard ceiling on engine heap allocations, in bytes.
    pub max_heap_size: Option<usize>,

    /// Maximum native stack the engine may use, in bytes.
    pub max_stack_size: Option<usize>,

    /// Base directory for resolving relative module specifiers.
    /// Defaults to the process working directory.
    pub current_dir: Option<PathBuf>,
}

impl ContextConfig {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }
}

/// Chained builder for [`ContextConfig`] that finishes by creating the context.
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn max_heap_size(mut self, bytes: usize) -> Self {
        self.config.max_heap_size = Some(bytes);
        self
    }

    pub fn max_stack_size(mut self, bytes: usize) -> Self {
        self.config.max_stack_size = Some(bytes);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.current_dir = Some(dir.into());
        self
    }

    /// Return the accumulated configuration without creating a context.
    pub fn config(self) -> ContextConfig {
        self.config
    }

    pub fn build(self) -> Result<Context> {
        Context::new(self.config)
    }
}

/// Flags for a single [`Context::advance`] tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvanceOptions {
    /// Wait for an attached inspector session before finishing the tick.
    ///
    /// QuickJS has no inspector channel, so no session can ever be attached
    /// and the flag never blocks.
    pub wait_for_inspector: bool,

    /// Keep ticking until no ready work remains (due timers or queued jobs).
    /// Never waits for timers that are not yet due.
    pub pump_message_loop: bool,
}

impl AdvanceOptions {
    pub fn pump() -> Self {
        Self {
            pump_message_loop: true,
            ..Self::default()
        }
    }
}
