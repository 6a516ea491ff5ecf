//! Host-side macrotask source backing `setTimeout` and friends.
//!
//! QuickJS ships without timers. Callbacks live in a JS-side table; the host
//! only keeps `(deadline, id)` pairs and asks JS to fire an id once its
//! deadline has passed.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rquickjs::{Ctx, Function, Object, Persistent};
use tracing::{debug, error, info, trace, warn};

/// Delays above this are clamped to zero, as browsers do.
const MAX_DELAY_MS: f64 = 2_147_483_647.0;

const PRELUDE: &str = r#"
(function (host) {
    const timers = new Map();
    let nextId = 1;

    const toDelay = (ms) => {
        const n = Number(ms);
        return Number.isFinite(n) && n > 0 && n <= 2147483647 ? n : 0;
    };

    const add = (callback, ms, args, repeat) => {
        if (typeof callback !== 'function') {
            throw new TypeError('timer callback must be a function');
        }
        const id = nextId++;
        const delay = toDelay(ms);
        timers.set(id, { callback, args, delay, repeat });
        host.schedule(id, delay);
        return id;
    };

    const clear = (id) => {
        if (timers.delete(id)) {
            host.cancel(id);
        }
    };

    const format = (args) => args.map((arg) => {
        if (typeof arg === 'string') return arg;
        if (arg instanceof Error) return arg.stack ? `${arg}\n${arg.stack}` : String(arg);
        try {
            const json = JSON.stringify(arg);
            return json === undefined ? String(arg) : json;
        } catch (_) {
            return String(arg);
        }
    }).join(' ');

    const define = (name, value) => Object.defineProperty(globalThis, name, {
        value, writable: true, configurable: true, enumerable: false,
    });

    define('setTimeout', (callback, ms, ...args) => add(callback, ms, args, false));
    define('setInterval', (callback, ms, ...args) => add(callback, ms, args, true));
    define('clearTimeout', clear);
    define('clearInterval', clear);

    if (typeof globalThis.queueMicrotask !== 'function') {
        define('queueMicrotask', (callback) => {
            Promise.resolve().then(callback);
        });
    }

    if (typeof globalThis.console !== 'object' || globalThis.console === null) {
        const console = {};
        for (const level of ['log', 'info', 'warn', 'error', 'debug', 'trace']) {
            console[level] = (...args) => host.log(level, format(args));
        }
        define('console', console);
    }

    return (id) => {
        const timer = timers.get(id);
        if (timer === undefined) {
            return false;
        }
        if (timer.repeat) {
            host.schedule(id, timer.delay);
        } else {
            timers.delete(id);
        }
        timer.callback(...timer.args);
        return true;
    };
})
"#;

/// Stale heap entries tolerated beyond twice the live count before compacting.
const COMPACT_SLACK: usize = 64;

/// Deadline-ordered queue of scheduled timer ids.
///
/// Cancelling only forgets the id; its heap entry goes stale and is dropped
/// lazily. The top of the heap is always a live entry.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, u32)>>,
    // Timer id to the sequence number of its current heap entry.
    live: HashMap<u32, u64>,
    seq: u64,
}

impl TimerQueue {
    pub fn schedule(&mut self, id: u32, delay: Duration) {
        let deadline = Instant::now() + delay;
        self.seq += 1;
        self.heap.push(Reverse((deadline, self.seq, id)));
        self.live.insert(id, self.seq);
        self.prune();
        trace!(timer = id, delay_ms = delay.as_millis() as u64, "Timer scheduled");
    }

    pub fn cancel(&mut self, id: u32) {
        if self.live.remove(&id).is_some() {
            self.prune();
            trace!(timer = id, "Timer cancelled");
        }
    }

    /// Remove and return every live timer due at `now`, earliest first.
    /// Ties keep scheduling order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<u32> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, seq, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if self.is_current(seq, id) {
                self.live.remove(&id);
                due.push(id);
            }
        }
        self.prune();
        due
    }

    pub fn has_live(&self) -> bool {
        !self.live.is_empty()
    }

    /// Earliest deadline among live timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .peek()
            .filter(|Reverse((_, seq, id))| self.is_current(*seq, *id))
            .map(|Reverse((deadline, _, _))| *deadline)
    }

    fn is_current(&self, seq: u64, id: u32) -> bool {
        self.live.get(&id) == Some(&seq)
    }

    /// Drop stale entries from the top, and rebuild once they dominate.
    fn prune(&mut self) {
        while let Some(Reverse((_, seq, id))) = self.heap.peek().copied() {
            if self.is_current(seq, id) {
                break;
            }
            self.heap.pop();
        }
        if self.heap.len() > 2 * self.live.len() + COMPACT_SLACK {
            let live = &self.live;
            self.heap.retain(|Reverse((_, seq, id))| live.get(id) == Some(seq));
            trace!(entries = self.heap.len(), "Compacted timer queue");
        }
    }
}

fn delay_from_millis(ms: f64) -> Duration {
    if !ms.is_finite() || ms <= 0.0 || ms > MAX_DELAY_MS {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(ms / 1000.0)
}

fn console_log(level: &str, message: &str) {
    match level {
        "error" => error!(target: "js_context::console", "{message}"),
        "warn" => warn!(target: "js_context::console", "{message}"),
        "debug" | "trace" => debug!(target: "js_context::console", "{message}"),
        _ => info!(target: "js_context::console", "{message}"),
    }
}

/// Install timer globals and `console` into `ctx`, returning the JS function
/// that fires a timer by id.
pub(crate) fn install(
    ctx: &Ctx<'_>,
    queue: Rc<RefCell<TimerQueue>>,
) -> rquickjs::Result<Persistent<Function<'static>>> {
    let host = Object::new(ctx.clone())?;

    let schedule_queue = Rc::clone(&queue);
    host.set(
        "schedule",
        Function::new(ctx.clone(), move |id: f64, delay: f64| {
            schedule_queue
                .borrow_mut()
                .schedule(id as u32, delay_from_millis(delay));
        })?,
    )?;
    host.set(
        "cancel",
        Function::new(ctx.clone(), move |id: f64| {
            queue.borrow_mut().cancel(id as u32);
        })?,
    )?;
    host.set(
        "log",
        Function::new(ctx.clone(), |level: String, message: String| {
            console_log(&level, &message);
        })?,
    )?;

    let installer: Function = ctx.eval(PRELUDE)?;
    let fire: Function = installer.call((host,))?;
    Ok(Persistent::save(ctx, fire))
}
