//! The embedded engine instance and its event-loop pump.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::fmt;
use std::mem::MaybeUninit;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rquickjs::function::{Args, This};
use rquickjs::promise::PromiseState as EngineState;
use rquickjs::{Ctx, Function, Module, Object, Persistent, Promise, Runtime, Value, qjs};
use serde_json::Value as JsonValue;
use tracing::{debug, trace, warn};

use crate::config::{AdvanceOptions, ContextBuilder, ContextConfig};
use crate::error::{ContextError, JsException, Result};
use crate::module::{JsHandle, JsModule, ModuleRegistry, RegistryLoader, RegistryResolver};
use crate::promise::JsPromise;
use crate::timers::{self, TimerQueue};
use crate::value;

/// Uncaught errors kept for [`Context::take_errors`]. Older ones are dropped.
const MAX_RECORDED_ERRORS: usize = 64;

/// Upper bound on ticks run by a single pumped [`Context::advance`].
const MAX_PUMP_ROUNDS: usize = 64;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Engine memory counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapUsage {
    /// Bytes in use by engine objects.
    pub used_bytes: u64,
    /// Bytes currently allocated through the engine allocator.
    pub malloc_bytes: u64,
    /// Configured heap ceiling.
    pub limit: Option<usize>,
}

/// Deadline shared with the engine's interrupt handler.
#[derive(Debug)]
struct Deadline {
    timeout: Option<Duration>,
    expires: Cell<Option<Instant>>,
    fired: Cell<bool>,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            expires: Cell::new(None),
            fired: Cell::new(false),
        }
    }

    fn arm(&self) -> ArmedDeadline<'_> {
        self.expires.set(self.timeout.map(|t| Instant::now() + t));
        self.fired.set(false);
        ArmedDeadline(self)
    }

    /// Polled by the engine; returning true interrupts the running script.
    fn expired(&self) -> bool {
        match self.expires.get() {
            Some(at) if Instant::now() >= at => {
                self.fired.set(true);
                true
            }
            _ => false,
        }
    }
}

struct ArmedDeadline<'a>(&'a Deadline);

impl Drop for ArmedDeadline<'_> {
    fn drop(&mut self) {
        self.0.expires.set(None);
    }
}

/// Where an engine error surfaced; decides whether it is a compile error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Compile,
    Link,
    Run,
}

/// A rejection nobody has handled yet.
struct Rejection {
    promise: Persistent<Value<'static>>,
    exception: JsException,
}

/// Result of starting an async invocation.
enum Started {
    Pending(Persistent<Promise<'static>>),
    Settled(std::result::Result<JsonValue, JsException>),
}

/// One embedded JavaScript engine instance with its own heap and event loop.
///
/// A `Context` is bound to the thread that created it and every operation
/// takes `&mut self`; concurrent or re-entrant use is rejected at compile time.
///
/// After a [`ContextError::Timeout`] or [`ContextError::OutOfMemory`] the
/// context is poisoned and every further operation fails with
/// [`ContextError::Fatal`].
pub struct Context {
    id: ContextId,
    // Engine references: cleared in `Drop` before the runtime goes away.
    modules: HashMap<u64, Persistent<Object<'static>>>,
    promises: HashMap<u64, Persistent<Promise<'static>>>,
    fire_timer: Option<Persistent<Function<'static>>>,
    rejections: Rc<RefCell<Vec<Rejection>>>,
    next_id: u64,
    errors: VecDeque<(u64, JsException)>,
    error_seq: u64,
    timers: Rc<RefCell<TimerQueue>>,
    registry: Rc<RefCell<ModuleRegistry>>,
    deadline: Rc<Deadline>,
    config: ContextConfig,
    poisoned: Option<String>,
    context: rquickjs::Context,
    runtime: Runtime,
}

impl Context {
    /// Create a fresh engine heap configured by `config`.
    pub fn new(config: ContextConfig) -> Result<Self> {
        let current_dir = match &config.current_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        if !current_dir.is_dir() {
            return Err(ContextError::NotADirectory { path: current_dir });
        }

        let runtime = Runtime::new().map_err(|e| ContextError::Init(e.to_string()))?;
        if let Some(limit) = config.max_stack_size {
            runtime.set_max_stack_size(limit);
        }

        let registry = Rc::new(RefCell::new(ModuleRegistry::new(current_dir)));
        runtime.set_loader(
            RegistryResolver::new(Rc::clone(&registry)),
            RegistryLoader::new(Rc::clone(&registry)),
        );

        let deadline = Rc::new(Deadline::new(config.timeout));
        if config.timeout.is_some() {
            let handler = Rc::clone(&deadline);
            runtime.set_interrupt_handler(Some(Box::new(move || handler.expired())));
        }

        let rejections: Rc<RefCell<Vec<Rejection>>> = Rc::new(RefCell::new(Vec::new()));
        runtime.set_host_promise_rejection_tracker(Some(rejection_tracker(Rc::clone(
            &rejections,
        ))));

        let context =
            rquickjs::Context::full(&runtime).map_err(|e| ContextError::Init(e.to_string()))?;
        let timers = Rc::new(RefCell::new(TimerQueue::default()));
        let fire_timer = context
            .with(|ctx| timers::install(&ctx, Rc::clone(&timers)))
            .map_err(|e| ContextError::Init(format!("failed to install timers: {e}")))?;

        // Applied last so that a tiny ceiling cannot break initialization.
        if let Some(limit) = config.max_heap_size {
            runtime.set_memory_limit(limit);
        }

        let id = ContextId::next();
        debug!(
            context = %id,
            timeout = ?config.timeout,
            max_heap_size = ?config.max_heap_size,
            "Created JS context"
        );

        Ok(Self {
            id,
            modules: HashMap::new(),
            promises: HashMap::new(),
            fire_timer: Some(fire_timer),
            rejections,
            next_id: 1,
            errors: VecDeque::new(),
            error_seq: 0,
            timers,
            registry,
            deadline,
            config,
            poisoned: None,
            context,
            runtime,
        })
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The configured per-operation timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    pub fn max_heap_size(&self) -> Option<usize> {
        self.config.max_heap_size
    }

    /// Base directory for resolving relative module specifiers.
    pub fn current_dir(&self) -> PathBuf {
        self.registry.borrow().current_dir().to_path_buf()
    }

    pub fn set_current_dir(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(ContextError::NotADirectory {
                path: path.to_path_buf(),
            });
        }
        let path = path.canonicalize()?;
        debug!(context = %self.id, dir = %path.display(), "Changed module base directory");
        self.registry.borrow_mut().set_current_dir(path);
        Ok(())
    }

    /// Whether a timeout or allocation failure made this context unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Compile and run `code` in the global scope, draining microtasks.
    ///
    /// A promise result that settled during the drain is unwrapped.
    pub fn eval(&mut self, code: &str) -> Result<JsonValue> {
        self.ensure_usable()?;
        let deadline = Rc::clone(&self.deadline);
        let _armed = deadline.arm();

        let context = self.context.clone();
        let result = context.with(|ctx| {
            let script = compile_script(&ctx, code)
                .map_err(|err| self.engine_error(&ctx, err, Phase::Compile))?;
            let value = run_script(&ctx, &script)
                .map_err(|err| self.engine_error(&ctx, err, Phase::Run))?;
            Ok::<_, ContextError>(Persistent::save(&ctx, value))
        })?;
        self.settle(result)
    }

    /// Invoke the global function `name` and drain microtasks.
    pub fn call(&mut self, name: &str, args: &[JsonValue]) -> Result<JsonValue> {
        self.ensure_usable()?;
        let deadline = Rc::clone(&self.deadline);
        let _armed = deadline.arm();

        let context = self.context.clone();
        let result = context.with(|ctx| {
            let function = self.global_function(&ctx, name)?;
            let value = self.invoke(&ctx, &function, args)?;
            Ok::<_, ContextError>(Persistent::save(&ctx, value))
        })?;
        self.settle(result)
    }

    /// Invoke the export `name` of a loaded module and drain microtasks.
    pub fn call_module(
        &mut self,
        handle: &JsHandle,
        name: &str,
        args: &[JsonValue],
    ) -> Result<JsonValue> {
        self.ensure_usable()?;
        let namespace = self.namespace(handle)?;
        let deadline = Rc::clone(&self.deadline);
        let _armed = deadline.arm();

        let context = self.context.clone();
        let result = context.with(|ctx| {
            let function = self.export_function(&ctx, namespace, handle, name)?;
            let value = self.invoke(&ctx, &function, args)?;
            Ok::<_, ContextError>(Persistent::save(&ctx, value))
        })?;
        self.settle(result)
    }

    /// Read a global binding without invoking it.
    pub fn get_value(&mut self, name: &str) -> Result<JsonValue> {
        self.ensure_usable()?;
        let deadline = Rc::clone(&self.deadline);
        let _armed = deadline.arm();

        let context = self.context.clone();
        context.with(|ctx| {
            let value = self.global(&ctx, name)?;
            value::to_host(&value)
        })
    }

    /// Declare and evaluate `module`, returning a handle bound to this context.
    pub fn load_module(&mut self, module: &JsModule) -> Result<JsHandle> {
        self.ensure_usable()?;
        let deadline = Rc::clone(&self.deadline);
        let _armed = deadline.arm();

        let context = self.context.clone();
        let (namespace, evaluation) = context.with(|ctx| {
            let declared = Module::declare(ctx.clone(), module.filename(), module.contents())
                .map_err(|err| self.engine_error(&ctx, err, Phase::Compile))?;
            // Only a module that parsed may shadow a file of the same name.
            self.registry.borrow_mut().register(module);
            let (evaluated, promise) = declared
                .eval()
                .map_err(|err| self.engine_error(&ctx, err, Phase::Link))?;
            mark_handled(&ctx, &promise)?;
            if let Some(Err(exception)) = promise_outcome(&ctx, &promise) {
                return Err(ContextError::Runtime(exception));
            }
            let namespace = evaluated.namespace()?;
            Ok::<_, ContextError>((
                Persistent::save(&ctx, namespace),
                Persistent::save(&ctx, promise),
            ))
        })?;

        self.drain_jobs()?;
        let outcome = context.with(|ctx| {
            let promise = evaluation.restore(&ctx)?;
            Ok::<_, ContextError>(promise_outcome(&ctx, &promise).map(|o| o.map(|_| ())))
        })?;
        self.flush_rejections();

        match outcome {
            Some(Err(exception)) => return Err(ContextError::Runtime(exception)),
            None => debug!(
                module = module.filename(),
                "Module top-level evaluation still pending"
            ),
            Some(Ok(_)) => {}
        }

        let id = self.allocate_id();
        self.modules.insert(id, namespace);
        debug!(context = %self.id, module = module.filename(), handle = id, "Loaded module");
        Ok(JsHandle::new(self.id, id, module.clone()))
    }

    /// Invoke the global function `name` without draining microtasks.
    ///
    /// A synchronous throw does not fail the call; it settles the returned
    /// promise as rejected.
    pub fn call_async(&mut self, name: &str, args: &[JsonValue]) -> Result<JsPromise> {
        self.ensure_usable()?;
        let deadline = Rc::clone(&self.deadline);
        let _armed = deadline.arm();

        let context = self.context.clone();
        let started = context.with(|ctx| {
            let function = self.global_function(&ctx, name)?;
            self.start(&ctx, &function, args)
        })?;
        self.track(started)
    }

    /// Invoke the export `name` of a loaded module without draining microtasks.
    pub fn call_module_async(
        &mut self,
        handle: &JsHandle,
        name: &str,
        args: &[JsonValue],
    ) -> Result<JsPromise> {
        self.ensure_usable()?;
        let namespace = self.namespace(handle)?;
        let deadline = Rc::clone(&self.deadline);
        let _armed = deadline.arm();

        let context = self.context.clone();
        let started = context.with(|ctx| {
            let function = self.export_function(&ctx, namespace, handle, name)?;
            self.start(&ctx, &function, args)
        })?;
        self.track(started)
    }

    /// Run one increment of the event loop.
    ///
    /// A tick drains queued microtasks, then fires every timer already due,
    /// draining microtasks after each callback. Returns whether work remains.
    pub fn advance(&mut self, options: AdvanceOptions) -> Result<bool> {
        self.ensure_usable()?;
        if options.wait_for_inspector {
            trace!(context = %self.id, "No inspector attached; not waiting");
        }

        let mut rounds = 0;
        loop {
            let ran = self.tick()?;
            rounds += 1;
            if !options.pump_message_loop || ran == 0 || rounds >= MAX_PUMP_ROUNDS {
                break;
            }
        }
        self.flush_rejections();

        let pending = self.has_pending_work();
        trace!(context = %self.id, rounds, pending, "Advanced event loop");
        Ok(pending)
    }

    /// Whether queued jobs or live timers remain.
    pub fn has_pending_work(&self) -> bool {
        self.runtime.is_job_pending() || self.timers.borrow().has_live()
    }

    /// Deadline of the earliest live timer, for hosts that want to sleep
    /// instead of spinning on [`advance`](Self::advance).
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.borrow().next_deadline()
    }

    /// The most recent uncaught error that had no promise to carry it.
    pub fn last_error(&self) -> Option<&JsException> {
        self.errors.back().map(|(_, exception)| exception)
    }

    /// Drain every recorded uncaught error, oldest first.
    pub fn take_errors(&mut self) -> Vec<JsException> {
        self.errors.drain(..).map(|(_, exception)| exception).collect()
    }

    pub fn heap_usage(&self) -> HeapUsage {
        let usage = self.runtime.memory_usage();
        HeapUsage {
            used_bytes: u64::try_from(usage.memory_used_size).unwrap_or(0),
            malloc_bytes: u64::try_from(usage.malloc_size).unwrap_or(0),
            limit: self.config.max_heap_size,
        }
    }

    pub fn run_gc(&mut self) {
        self.runtime.run_gc();
    }

    /// Stop tracking a promise, freeing its engine-side reference.
    pub fn release(&mut self, promise: JsPromise) -> Result<()> {
        self.check_owner(promise.context_id())?;
        if self.promises.remove(&promise.id()).is_some() {
            trace!(context = %self.id, promise = promise.id(), "Released promise");
        }
        Ok(())
    }

    pub(crate) fn check_owner(&self, owner: ContextId) -> Result<()> {
        if owner != self.id {
            return Err(ContextError::invalid_handle(format!(
                "object belongs to {owner}, not {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Current state of a tracked promise. A settled promise stops being tracked.
    pub(crate) fn poll_promise(
        &mut self,
        id: u64,
    ) -> Result<Option<std::result::Result<JsonValue, JsException>>> {
        self.ensure_usable()?;
        let Some(persistent) = self.promises.get(&id).cloned() else {
            return Err(ContextError::invalid_handle(format!(
                "promise {id} is no longer tracked by {}",
                self.id
            )));
        };

        let context = self.context.clone();
        let outcome = context.with(|ctx| {
            let promise = persistent.restore(&ctx)?;
            Ok::<_, ContextError>(promise_outcome(&ctx, &promise).map(|outcome| {
                outcome.and_then(|value| {
                    value::to_host(&value)
                        .map_err(|e| JsException::new("ConversionError", e.to_string()))
                })
            }))
        })?;

        if outcome.is_some() {
            self.promises.remove(&id);
        }
        Ok(outcome)
    }

    /// Give up on a promise the event loop can no longer settle.
    ///
    /// The reason is the latest uncaught error recorded after `since`, which
    /// is what most likely broke the chain, or a generic stall error.
    pub(crate) fn abandon_promise(&mut self, id: u64, since: u64) -> JsException {
        self.promises.remove(&id);
        let reason = self
            .errors
            .iter()
            .rev()
            .find(|(seq, _)| *seq > since)
            .map(|(_, exception)| exception.clone())
            .unwrap_or_else(|| {
                JsException::new(
                    "Error",
                    "promise will never settle: the event loop has no pending work",
                )
            });
        debug!(context = %self.id, promise = id, reason = %reason, "Abandoned stalled promise");
        reason
    }

    fn ensure_usable(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(ContextError::fatal(reason.clone())),
            None => Ok(()),
        }
    }

    fn poison(&mut self, err: &ContextError) {
        if self.poisoned.is_none() {
            warn!(context = %self.id, error = %err, "JS context poisoned; discard it");
            self.poisoned = Some(format!("context was poisoned by an earlier failure: {err}"));
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Turn an engine error into a `ContextError`, poisoning on fatal ones.
    fn engine_error(
        &mut self,
        ctx: &Ctx<'_>,
        err: rquickjs::Error,
        phase: Phase,
    ) -> ContextError {
        let mapped = match err {
            rquickjs::Error::Exception => {
                let caught = ctx.catch();
                let exhausted = is_exhaustion(ctx, &caught, self.config.max_heap_size);
                self.classify(value::exception_from_value(&caught), phase, exhausted)
            }
            rquickjs::Error::Allocation => ContextError::OutOfMemory {
                limit: self.config.max_heap_size,
            },
            err @ (rquickjs::Error::Resolving { .. } | rquickjs::Error::Loading { .. }) => {
                ContextError::Compile(JsException::new("ReferenceError", err.to_string()))
            }
            other if self.deadline.fired.get() => {
                trace!(error = %other, "Engine error after interrupt");
                self.timeout_error()
            }
            other => ContextError::Engine(other),
        };
        if mapped.is_fatal() {
            self.poison(&mapped);
        }
        mapped
    }

    fn classify(&self, exception: JsException, phase: Phase, exhausted: bool) -> ContextError {
        if self.deadline.fired.get() {
            return self.timeout_error();
        }
        if (exception.is_out_of_memory() || exhausted) && self.config.max_heap_size.is_some() {
            return ContextError::OutOfMemory {
                limit: self.config.max_heap_size,
            };
        }
        match phase {
            Phase::Compile => ContextError::Compile(exception),
            Phase::Link if is_link_failure(&exception) => ContextError::Compile(exception),
            Phase::Link | Phase::Run => ContextError::Runtime(exception),
        }
    }

    fn timeout_error(&self) -> ContextError {
        ContextError::Timeout(self.config.timeout.unwrap_or_default())
    }

    /// Record an error nobody is waiting on.
    fn record_error(&mut self, exception: JsException) {
        warn!(context = %self.id, error = %exception, "Uncaught error in JS event loop");
        self.error_seq += 1;
        self.errors.push_back((self.error_seq, exception));
        while self.errors.len() > MAX_RECORDED_ERRORS {
            self.errors.pop_front();
        }
    }

    /// Move rejections that stayed unhandled through the last checkpoint
    /// into the error slot.
    fn flush_rejections(&mut self) {
        let unhandled: Vec<JsException> = self
            .rejections
            .borrow_mut()
            .drain(..)
            .map(|rejection| rejection.exception)
            .collect();
        for exception in unhandled {
            self.record_error(exception);
        }
    }

    /// Run queued jobs (microtasks) until none remain.
    fn drain_jobs(&mut self) -> Result<usize> {
        let limit = self.config.max_heap_size;
        let mut count = 0;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => count += 1,
                Ok(false) => return Ok(count),
                Err(job) => {
                    count += 1;
                    let (exception, exhausted) = job.0.with(|ctx| {
                        let caught = ctx.catch();
                        let exhausted = is_exhaustion(&ctx, &caught, limit);
                        (value::exception_from_value(&caught), exhausted)
                    });
                    match self.classify(exception, Phase::Run, exhausted) {
                        ContextError::Runtime(exception) => self.record_error(exception),
                        err => {
                            self.poison(&err);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    fn tick(&mut self) -> Result<usize> {
        let mut ran = self.drain_jobs()?;
        let due = self.timers.borrow_mut().pop_due(Instant::now());
        for id in due {
            self.fire(id)?;
            ran += 1 + self.drain_jobs()?;
        }
        Ok(ran)
    }

    fn fire(&mut self, timer: u32) -> Result<()> {
        let Some(fire) = self.fire_timer.clone() else {
            return Ok(());
        };
        trace!(context = %self.id, timer, "Firing timer");

        let context = self.context.clone();
        let failure = context.with(|ctx| {
            let fire = fire.restore(&ctx)?;
            Ok::<_, ContextError>(
                fire.call::<_, bool>((f64::from(timer),))
                    .err()
                    .map(|err| self.engine_error(&ctx, err, Phase::Run)),
            )
        });
        match failure {
            Ok(None) => Ok(()),
            Ok(Some(ContextError::Runtime(exception))) => {
                self.record_error(exception);
                Ok(())
            }
            Ok(Some(err)) | Err(err) => Err(err),
        }
    }

    /// Drain microtasks, then convert a persisted result.
    fn settle(&mut self, result: Persistent<Value<'static>>) -> Result<JsonValue> {
        self.drain_jobs()?;
        let context = self.context.clone();
        let converted: Result<JsonValue> = context.with(|ctx| {
            let value = result.restore(&ctx)?;
            match value.as_promise() {
                Some(promise) => match promise_outcome(&ctx, promise) {
                    Some(Err(exception)) => {
                        mark_handled(&ctx, promise)?;
                        Err(ContextError::Runtime(exception))
                    }
                    None => Ok(JsonValue::Null),
                    Some(Ok(value)) => value::to_host(&value),
                },
                None => value::to_host(&value),
            }
        });
        self.flush_rejections();
        converted
    }

    fn global<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> Result<Value<'js>> {
        let globals = ctx.globals();
        if globals.contains_key(name)? {
            return Ok(globals.get(name)?);
        }
        // Top-level `let`/`const`/`class` bindings are not properties of `globalThis`.
        if !is_identifier(name) {
            return Err(ContextError::name(format!("`{name}` is not defined")));
        }
        match ctx.eval::<Value, _>(name) {
            Ok(value) => Ok(value),
            Err(err) => match self.engine_error(ctx, err, Phase::Run) {
                ContextError::Runtime(exception) if !exception.is_reference_error() => {
                    Err(ContextError::Runtime(exception))
                }
                err if err.is_fatal() => Err(err),
                _ => Err(ContextError::name(format!("`{name}` is not defined"))),
            },
        }
    }

    fn global_function<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> Result<Function<'js>> {
        self.global(ctx, name)?
            .into_function()
            .ok_or_else(|| ContextError::name(format!("`{name}` is not a function")))
    }

    fn namespace(&self, handle: &JsHandle) -> Result<Persistent<Object<'static>>> {
        self.check_owner(handle.context_id())?;
        self.modules.get(&handle.id()).cloned().ok_or_else(|| {
            ContextError::invalid_handle(format!(
                "module `{}` is not loaded in {}",
                handle.filename(),
                self.id
            ))
        })
    }

    fn export_function<'js>(
        &mut self,
        ctx: &Ctx<'js>,
        namespace: Persistent<Object<'static>>,
        handle: &JsHandle,
        name: &str,
    ) -> Result<Function<'js>> {
        let namespace = namespace.restore(ctx)?;
        if !namespace.contains_key(name)? {
            return Err(ContextError::name(format!(
                "module `{}` has no export `{name}`",
                handle.filename()
            )));
        }
        let export: Value = namespace.get(name)?;
        export.into_function().ok_or_else(|| {
            ContextError::name(format!(
                "export `{name}` of `{}` is not a function",
                handle.filename()
            ))
        })
    }

    fn invoke<'js>(
        &mut self,
        ctx: &Ctx<'js>,
        function: &Function<'js>,
        args: &[JsonValue],
    ) -> Result<Value<'js>> {
        let mut call_args = Args::new(ctx.clone(), args.len());
        for arg in args {
            call_args.push_arg(value::to_js(ctx, arg)?)?;
        }
        function
            .call_arg::<Value>(call_args)
            .map_err(|err| self.engine_error(ctx, err, Phase::Run))
    }

    fn start<'js>(
        &mut self,
        ctx: &Ctx<'js>,
        function: &Function<'js>,
        args: &[JsonValue],
    ) -> Result<Started> {
        let value = match self.invoke(ctx, function, args) {
            Ok(value) => value,
            Err(ContextError::Runtime(exception)) => return Ok(Started::Settled(Err(exception))),
            Err(err) => return Err(err),
        };

        let Some(promise) = value.as_promise() else {
            let outcome = value::to_host(&value)
                .map_err(|e| JsException::new("ConversionError", e.to_string()));
            return Ok(Started::Settled(outcome));
        };

        // A rejection surfaces through the `JsPromise`, not the error slot.
        mark_handled(ctx, promise).map_err(|err| self.engine_error(ctx, err, Phase::Run))?;
        Ok(Started::Pending(Persistent::save(ctx, promise.clone())))
    }

    fn track(&mut self, started: Started) -> Result<JsPromise> {
        self.flush_rejections();
        let id = self.allocate_id();
        let mut promise = match started {
            Started::Settled(outcome) => JsPromise::settled(self.id, id, outcome),
            Started::Pending(persistent) => {
                self.promises.insert(id, persistent);
                JsPromise::pending(self.id, id, self.error_seq)
            }
        };

        // Settled with nothing left to run: report done right away.
        if !promise.is_done() && !self.runtime.is_job_pending() {
            promise.observe(self, true)?;
        }
        trace!(context = %self.id, promise = id, done = promise.is_done(), "Started async call");
        Ok(promise)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("modules", &self.modules.len())
            .field("promises", &self.promises.len())
            .field("poisoned", &self.poisoned.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Persistent references must be released while the runtime is alive.
        self.runtime.set_host_promise_rejection_tracker(None);
        self.rejections.borrow_mut().clear();
        self.promises.clear();
        self.modules.clear();
        self.fire_timer = None;
        trace!(context = %self.id, "Dropped JS context");
    }
}

type RejectionTracker = Box<dyn for<'js> Fn(Ctx<'js>, Value<'js>, Value<'js>, bool)>;

/// Keeps the list of rejected promises that have no handler attached yet.
fn rejection_tracker(tracked: Rc<RefCell<Vec<Rejection>>>) -> RejectionTracker {
    Box::new(move |ctx, promise, reason, is_handled| {
        if is_handled {
            tracked.borrow_mut().retain(|rejection| {
                rejection
                    .promise
                    .clone()
                    .restore(&ctx)
                    .map(|seen| seen != promise)
                    .unwrap_or(false)
            });
        } else {
            let exception = value::exception_from_value(&reason);
            let promise = Persistent::save(&ctx, promise);
            tracked.borrow_mut().push(Rejection { promise, exception });
        }
    })
}

/// Attach a no-op rejection handler so the engine stops reporting `promise`
/// as unhandled.
fn mark_handled<'js>(ctx: &Ctx<'js>, promise: &Promise<'js>) -> rquickjs::Result<()> {
    let catch: Function = promise.get("catch")?;
    let ignore = Function::new(ctx.clone(), || {})?;
    let _: Value = catch.call((This(promise.clone()), ignore))?;
    Ok(())
}

/// Settled outcome of an engine promise, `None` while pending.
fn promise_outcome<'js>(
    ctx: &Ctx<'js>,
    promise: &Promise<'js>,
) -> Option<std::result::Result<Value<'js>, JsException>> {
    match promise.state() {
        EngineState::Pending => None,
        EngineState::Resolved | EngineState::Rejected => match promise.result::<Value>()? {
            Ok(value) => Some(Ok(value)),
            Err(rquickjs::Error::Exception) => {
                Some(Err(value::exception_from_value(&ctx.catch())))
            }
            Err(err) => Some(Err(JsException::new("Error", err.to_string()))),
        },
    }
}

/// An empty throw with the heap nearly full: the engine could not allocate
/// its out-of-memory error.
fn is_exhaustion(ctx: &Ctx<'_>, caught: &Value<'_>, limit: Option<usize>) -> bool {
    let Some(limit) = limit else {
        return false;
    };
    if !(caught.is_null() || caught.is_undefined()) {
        return false;
    }
    let mut usage = MaybeUninit::<qjs::JSMemoryUsage>::uninit();
    // SAFETY: the runtime outlives `ctx` and fills every field of `usage`.
    let usage = unsafe {
        qjs::JS_ComputeMemoryUsage(qjs::JS_GetRuntime(ctx.as_raw().as_ptr()), usage.as_mut_ptr());
        usage.assume_init()
    };
    let used = u64::try_from(usage.malloc_size).unwrap_or(0);
    used.saturating_mul(10) >= (limit as u64).saturating_mul(9)
}

/// Parse `source` as a global script without running it.
fn compile_script<'js>(ctx: &Ctx<'js>, source: &str) -> rquickjs::Result<Value<'js>> {
    let len = source.len();
    let source = CString::new(source)?;
    let flags =
        qjs::JS_EVAL_TYPE_GLOBAL | qjs::JS_EVAL_FLAG_STRICT | qjs::JS_EVAL_FLAG_COMPILE_ONLY;
    // SAFETY: the context pointer is live for 'js and the engine copies the source.
    let raw = unsafe {
        qjs::JS_Eval(
            ctx.as_raw().as_ptr(),
            source.as_ptr(),
            len as _,
            c"eval_script".as_ptr(),
            flags as i32,
        )
    };
    owned_result(ctx, raw)
}

/// Run a script compiled by [`compile_script`].
fn run_script<'js>(ctx: &Ctx<'js>, script: &Value<'js>) -> rquickjs::Result<Value<'js>> {
    let ptr = ctx.as_raw().as_ptr();
    // SAFETY: `JS_EvalFunction` consumes its argument, so it gets its own reference.
    let raw = unsafe { qjs::JS_EvalFunction(ptr, qjs::JS_DupValue(ptr, script.as_raw())) };
    owned_result(ctx, raw)
}

fn owned_result<'js>(ctx: &Ctx<'js>, raw: qjs::JSValue) -> rquickjs::Result<Value<'js>> {
    // SAFETY: `raw` is an owned value just returned by the engine.
    unsafe {
        if qjs::JS_IsException(raw) {
            return Err(rquickjs::Error::Exception);
        }
        Ok(Value::from_raw(ctx.clone(), raw))
    }
}

/// A dependency that failed to load or did not parse.
fn is_link_failure(exception: &JsException) -> bool {
    exception.is_syntax_error()
        || (exception.is_reference_error()
            && (exception.message.contains("resolving module")
                || exception.message.contains("loading module")))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}
