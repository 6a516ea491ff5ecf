//! Integration tests for js-context.
//!
//! These tests run a real QuickJS engine and exercise the public surface:
//! synchronous calls, steppable promises, timers, modules and resource limits.

use std::fs;
use std::thread;
use std::time::Duration;

use js_context::{
    AdvanceOptions, Context, ContextError, JsModule, PromiseState,
};
use serde_json::json;

/// Initialize tracing for tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn setup_context() -> Context {
    init_tracing();
    Context::builder()
        .build()
        .expect("Failed to create context")
}

/// Advance until the loop is idle, sleeping briefly between ticks.
fn run_until_idle(ctx: &mut Context) {
    for _ in 0..1_000 {
        if !ctx.advance(AdvanceOptions::pump()).unwrap() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("event loop did not go idle");
}

mod eval_tests {
    use super::*;

    #[test]
    fn test_eval_arithmetic() {
        let mut ctx = setup_context();
        assert_eq!(ctx.eval("1 + 2").unwrap(), json!(3));
        assert_eq!(ctx.eval("'a' + 'b'").unwrap(), json!("ab"));
        assert_eq!(ctx.eval("({ n: 1, list: [true, null] })").unwrap(), json!({ "n": 1, "list": [true, null] }));
    }

    #[test]
    fn test_eval_state_persists() {
        let mut ctx = setup_context();
        ctx.eval("var counter = 1;").unwrap();
        ctx.eval("counter += 41;").unwrap();
        assert_eq!(ctx.eval("counter").unwrap(), json!(42));
    }

    #[test]
    fn test_eval_throw_is_runtime_error() {
        let mut ctx = setup_context();
        match ctx.eval("throw new Error('x')").unwrap_err() {
            ContextError::Runtime(exception) => {
                assert_eq!(exception.name, "Error");
                assert!(exception.message.contains('x'));
            }
            other => panic!("expected runtime error, got {other}"),
        }
        // The context stays usable after an ordinary exception.
        assert_eq!(ctx.eval("2").unwrap(), json!(2));
    }

    #[test]
    fn test_eval_syntax_error_is_compile_error() {
        let mut ctx = setup_context();
        let err = ctx.eval("1 +").unwrap_err();
        assert!(matches!(err, ContextError::Compile(_)), "got {err}");
        // Nothing ran: an earlier statement in the same source has no effect.
        let err = ctx.eval("globalThis.touched = true; 1 +").unwrap_err();
        assert!(matches!(err, ContextError::Compile(_)), "got {err}");
        assert_eq!(ctx.eval("typeof touched").unwrap(), json!("undefined"));
    }

    #[test]
    fn test_eval_syntax_error_at_runtime_is_runtime_error() {
        let mut ctx = setup_context();
        for source in ["JSON.parse('{')", "throw new SyntaxError('thrown at runtime')"] {
            match ctx.eval(source).unwrap_err() {
                ContextError::Runtime(exception) => assert_eq!(exception.name, "SyntaxError"),
                other => panic!("expected runtime error for {source}, got {other}"),
            }
        }

        ctx.eval("function parse(text) { return JSON.parse(text); }").unwrap();
        let err = ctx.call("parse", &[json!("{")]).unwrap_err();
        assert!(matches!(err, ContextError::Runtime(_)), "got {err}");
    }

    #[test]
    fn test_eval_message_mentioning_memory_is_not_fatal() {
        let mut ctx = setup_context();
        let err = ctx
            .eval("throw new Error('out of memory in user code')")
            .unwrap_err();
        assert!(matches!(err, ContextError::Runtime(_)), "got {err}");
        assert!(!ctx.is_poisoned());
        assert_eq!(ctx.eval("1").unwrap(), json!(1));
    }

    #[test]
    fn test_eval_drains_microtasks() {
        let mut ctx = setup_context();
        ctx.eval("globalThis.seen = []; Promise.resolve().then(() => seen.push('then'));")
            .unwrap();
        assert_eq!(ctx.get_value("seen").unwrap(), json!(["then"]));
    }

    #[test]
    fn test_eval_unwraps_settled_promise() {
        let mut ctx = setup_context();
        assert_eq!(ctx.eval("Promise.resolve(5)").unwrap(), json!(5));

        let err = ctx.eval("Promise.reject(new Error('nope'))").unwrap_err();
        assert!(matches!(err, ContextError::Runtime(ref e) if e.message == "nope"));
        assert!(ctx.take_errors().is_empty());
    }

    #[test]
    fn test_queue_microtask() {
        let mut ctx = setup_context();
        let len = ctx
            .eval("globalThis.q = []; queueMicrotask(() => q.push(1)); q.length")
            .unwrap();
        assert_eq!(len, json!(0));
        assert_eq!(ctx.get_value("q").unwrap(), json!([1]));
    }

    #[test]
    fn test_console_is_available() {
        let mut ctx = setup_context();
        let value = ctx
            .eval("console.log('hello', { a: 1 }); console.error(new Error('shown')); 7")
            .unwrap();
        assert_eq!(value, json!(7));
    }
}

mod call_tests {
    use super::*;

    #[test]
    fn test_call_global_function() {
        let mut ctx = setup_context();
        ctx.eval("function add(a, b) { return a + b; }").unwrap();
        assert_eq!(ctx.call("add", &[json!(1), json!(2)]).unwrap(), json!(3));
    }

    #[test]
    fn test_call_passes_structured_arguments() {
        let mut ctx = setup_context();
        ctx.eval("function echo(v) { return v; }").unwrap();
        let input = json!({ "a": [1, "x", { "b": false }], "big": 10_000_000_000_i64 });
        assert_eq!(ctx.call("echo", &[input.clone()]).unwrap(), input);
    }

    #[test]
    fn test_call_missing_function_is_name_error() {
        let mut ctx = setup_context();
        let err = ctx.call("doesNotExist", &[]).unwrap_err();
        assert!(matches!(err, ContextError::Name(_)), "got {err}");

        ctx.eval("globalThis.notCallable = 1;").unwrap();
        let err = ctx.call("notCallable", &[]).unwrap_err();
        assert!(matches!(err, ContextError::Name(_)), "got {err}");
    }

    #[test]
    fn test_call_throw_is_runtime_error() {
        let mut ctx = setup_context();
        ctx.eval("function fail(msg) { throw new RangeError(msg); }").unwrap();
        match ctx.call("fail", &[json!("out of range")]).unwrap_err() {
            ContextError::Runtime(exception) => {
                assert_eq!(exception.name, "RangeError");
                assert_eq!(exception.message, "out of range");
            }
            other => panic!("expected runtime error, got {other}"),
        }
    }

    #[test]
    fn test_get_value() {
        let mut ctx = setup_context();
        ctx.eval("globalThis.config = { retries: 3 }; let answer = 42; const label = 'x';")
            .unwrap();
        assert_eq!(ctx.get_value("config").unwrap(), json!({ "retries": 3 }));
        assert_eq!(ctx.get_value("answer").unwrap(), json!(42));
        assert_eq!(ctx.get_value("label").unwrap(), json!("x"));

        let err = ctx.get_value("missing").unwrap_err();
        assert!(matches!(err, ContextError::Name(_)), "got {err}");
        let err = ctx.get_value("not an identifier").unwrap_err();
        assert!(matches!(err, ContextError::Name(_)), "got {err}");
    }

    #[test]
    fn test_cyclic_result_is_conversion_error() {
        let mut ctx = setup_context();
        let err = ctx.eval("const o = {}; o.o = o; o").unwrap_err();
        assert!(matches!(err, ContextError::Conversion(_)), "got {err}");
    }
}

mod promise_tests {
    use super::*;

    #[test]
    fn test_async_timer_scenario() {
        let mut ctx = setup_context();
        ctx.eval(
            "globalThis.f = async () => { await new Promise(r => setTimeout(r, 0)); return 42; }",
        )
        .unwrap();

        let mut promise = ctx.call_async("f", &[]).unwrap();
        assert!(!promise.is_done());

        let mut steps = 0;
        while !promise.is_done() {
            promise.step(&mut ctx).unwrap();
            steps += 1;
            assert!(steps < 1_000, "promise never settled");
        }
        assert_eq!(promise.result().unwrap(), json!(42));
        assert_eq!(promise.exception().unwrap(), None);
        assert!(promise.step(&mut ctx).unwrap());
    }

    #[test]
    fn test_pending_promise_accessors_fail() {
        let mut ctx = setup_context();
        ctx.eval("globalThis.later = () => new Promise(r => setTimeout(() => r(1), 60000));")
            .unwrap();
        let mut promise = ctx.call_async("later", &[]).unwrap();
        assert!(!promise.step(&mut ctx).unwrap());
        assert_eq!(promise.state(), &PromiseState::Pending);
        assert!(matches!(
            promise.result().unwrap_err(),
            ContextError::InvalidState(_)
        ));
        assert!(matches!(
            promise.exception().unwrap_err(),
            ContextError::InvalidState(_)
        ));
    }

    #[test]
    fn test_rejected_promise() {
        let mut ctx = setup_context();
        ctx.eval("globalThis.bad = async () => { throw new Error('boom'); }")
            .unwrap();

        let mut promise = ctx.call_async("bad", &[]).unwrap();
        while !promise.step(&mut ctx).unwrap() {}

        match promise.result().unwrap_err() {
            ContextError::Runtime(exception) => assert_eq!(exception.message, "boom"),
            other => panic!("expected runtime error, got {other}"),
        }
        let exception = promise.exception().unwrap().unwrap();
        assert_eq!(exception.name, "Error");
        assert_eq!(exception.message, "boom");
        // Handled through the promise, so nothing lands in the error slot.
        assert!(ctx.take_errors().is_empty());
    }

    #[test]
    fn test_synchronous_results_settle_immediately() {
        let mut ctx = setup_context();
        ctx.eval("function add(a, b) { return a + b; } function throws() { throw new TypeError('sync'); }")
            .unwrap();

        let promise = ctx.call_async("add", &[json!(2), json!(3)]).unwrap();
        assert!(promise.is_done());
        assert_eq!(promise.result().unwrap(), json!(5));

        let promise = ctx.call_async("throws", &[]).unwrap();
        assert!(promise.is_done());
        assert_eq!(promise.exception().unwrap().unwrap().name, "TypeError");
    }

    #[test]
    fn test_call_async_missing_function() {
        let mut ctx = setup_context();
        let err = ctx.call_async("nothing", &[]).unwrap_err();
        assert!(matches!(err, ContextError::Name(_)), "got {err}");
    }

    #[test]
    fn test_promise_from_other_context_is_rejected() {
        let mut a = setup_context();
        let mut b = setup_context();
        a.eval("globalThis.f = async () => 1;").unwrap();

        let mut promise = a.call_async("f", &[]).unwrap();
        let err = promise.step(&mut b).unwrap_err();
        assert!(matches!(err, ContextError::InvalidHandle(_)), "got {err}");

        while !promise.step(&mut a).unwrap() {}
        assert_eq!(promise.result().unwrap(), json!(1));

        let err = promise.step(&mut b).unwrap_err();
        assert!(matches!(err, ContextError::InvalidHandle(_)), "got {err}");
    }

    #[test]
    fn test_stalled_promise_is_rejected() {
        let mut ctx = setup_context();
        ctx.eval("globalThis.never = () => new Promise(() => {});").unwrap();

        let mut promise = ctx.call_async("never", &[]).unwrap();
        assert!(promise.step(&mut ctx).unwrap());
        let exception = promise.exception().unwrap().unwrap();
        assert!(exception.message.contains("never settle"), "{exception}");
    }

    #[test]
    fn test_stalled_promise_reports_timer_error() {
        let mut ctx = setup_context();
        ctx.eval(
            "globalThis.broken = () => new Promise(() => setTimeout(() => { throw new Error('lost resolve'); }, 0));",
        )
        .unwrap();

        let mut promise = ctx.call_async("broken", &[]).unwrap();
        let mut steps = 0;
        while !promise.step(&mut ctx).unwrap() {
            steps += 1;
            assert!(steps < 1_000, "promise never settled");
        }
        assert_eq!(promise.exception().unwrap().unwrap().message, "lost resolve");
    }

    #[test]
    fn test_released_promise_is_no_longer_tracked() {
        let mut ctx = setup_context();
        ctx.eval("globalThis.later = () => new Promise(r => setTimeout(r, 60000));")
            .unwrap();
        let promise = ctx.call_async("later", &[]).unwrap();
        ctx.release(promise).unwrap();

        let mut other = ctx.call_async("later", &[]).unwrap();
        assert!(!other.step(&mut ctx).unwrap());
    }
}

mod timer_tests {
    use super::*;

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut ctx = setup_context();
        ctx.eval(
            "globalThis.order = [];
             setTimeout(() => order.push('late'), 20);
             setTimeout(() => order.push('early'), 0);
             Promise.resolve().then(() => order.push('micro'));",
        )
        .unwrap();
        assert_eq!(ctx.get_value("order").unwrap(), json!(["micro"]));

        run_until_idle(&mut ctx);
        assert_eq!(ctx.get_value("order").unwrap(), json!(["micro", "early", "late"]));
    }

    #[test]
    fn test_microtasks_run_between_timers() {
        let mut ctx = setup_context();
        ctx.eval(
            "globalThis.order = [];
             setTimeout(() => { order.push('t1'); Promise.resolve().then(() => order.push('m1')); }, 0);
             setTimeout(() => order.push('t2'), 0);",
        )
        .unwrap();

        ctx.advance(AdvanceOptions::default()).unwrap();
        assert_eq!(ctx.get_value("order").unwrap(), json!(["t1", "m1", "t2"]));
    }

    #[test]
    fn test_clear_timeout() {
        let mut ctx = setup_context();
        ctx.eval("globalThis.fired = false; const id = setTimeout(() => { fired = true; }, 0); clearTimeout(id);")
            .unwrap();
        assert!(!ctx.advance(AdvanceOptions::default()).unwrap());
        assert_eq!(ctx.get_value("fired").unwrap(), json!(false));
    }

    #[test]
    fn test_interval_until_cleared() {
        let mut ctx = setup_context();
        ctx.eval(
            "globalThis.count = 0;
             const handle = setInterval((step) => { count += step; if (count >= 3) clearInterval(handle); }, 0, 1);",
        )
        .unwrap();
        run_until_idle(&mut ctx);
        assert_eq!(ctx.get_value("count").unwrap(), json!(3));
    }

    #[test]
    fn test_advance_reports_pending_timers() {
        let mut ctx = setup_context();
        assert!(!ctx.advance(AdvanceOptions::default()).unwrap());

        ctx.eval("setTimeout(() => {}, 60000);").unwrap();
        assert!(ctx.advance(AdvanceOptions::default()).unwrap());
        assert!(ctx.next_timer_deadline().is_some());

        let options = AdvanceOptions {
            wait_for_inspector: true,
            pump_message_loop: true,
        };
        assert!(ctx.advance(options).unwrap());
    }

    #[test]
    fn test_timer_errors_are_recorded() {
        let mut ctx = setup_context();
        ctx.eval("setTimeout(() => { throw new Error('tick failed'); }, 0);")
            .unwrap();
        ctx.advance(AdvanceOptions::default()).unwrap();

        assert_eq!(ctx.last_error().unwrap().message, "tick failed");
        let errors = ctx.take_errors();
        assert_eq!(errors.len(), 1);
        assert!(ctx.last_error().is_none());
    }

    #[test]
    fn test_unhandled_rejection_in_timer_is_recorded() {
        let mut ctx = setup_context();
        ctx.eval("setTimeout(() => { Promise.reject(new TypeError('dropped')); }, 0);")
            .unwrap();
        ctx.advance(AdvanceOptions::default()).unwrap();

        let errors = ctx.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].name, "TypeError");
    }
}

mod module_tests {
    use super::*;

    #[test]
    fn test_load_module_and_call_export() {
        let mut ctx = setup_context();
        let module = JsModule::new(
            "math.js",
            "export function add(a, b) { return a + b; }\nexport const name = 'math';",
        );
        let handle = ctx.load_module(&module).unwrap();
        assert_eq!(handle.filename(), "math.js");
        assert_eq!(handle.contents(), module.contents());
        assert_eq!(handle.context_id(), ctx.id());

        assert_eq!(
            ctx.call_module(&handle, "add", &[json!(2), json!(3)]).unwrap(),
            json!(5)
        );

        let err = ctx.call_module(&handle, "missing", &[]).unwrap_err();
        assert!(matches!(err, ContextError::Name(_)), "got {err}");
        let err = ctx.call_module(&handle, "name", &[]).unwrap_err();
        assert!(matches!(err, ContextError::Name(_)), "got {err}");
    }

    #[test]
    fn test_modules_import_each_other() {
        let mut ctx = setup_context();
        ctx.load_module(&JsModule::new("lib.js", "export const double = (x) => x * 2;"))
            .unwrap();
        let main = ctx
            .load_module(&JsModule::new(
                "main.js",
                "import { double } from './lib.js';\nexport function run(x) { return double(x) + 1; }",
            ))
            .unwrap();
        assert_eq!(ctx.call_module(&main, "run", &[json!(20)]).unwrap(), json!(41));
    }

    #[test]
    fn test_module_errors() {
        let mut ctx = setup_context();

        let err = ctx
            .load_module(&JsModule::new("broken.js", "export function ("))
            .unwrap_err();
        assert!(matches!(err, ContextError::Compile(_)), "got {err}");

        let err = ctx
            .load_module(&JsModule::new("orphan.js", "import { x } from './nowhere.js';"))
            .unwrap_err();
        assert!(matches!(err, ContextError::Compile(_)), "got {err}");

        let err = ctx
            .load_module(&JsModule::new("throws.js", "throw new Error('init failed');"))
            .unwrap_err();
        assert!(
            matches!(err, ContextError::Runtime(ref e) if e.message == "init failed"),
            "got {err}"
        );

        let err = ctx
            .load_module(&JsModule::new("parses.js", "JSON.parse('{');"))
            .unwrap_err();
        assert!(
            matches!(err, ContextError::Runtime(ref e) if e.name == "SyntaxError"),
            "got {err}"
        );
    }

    #[test]
    fn test_broken_module_does_not_shadow_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dep.js"), "export const base = 7;").unwrap();

        init_tracing();
        let mut ctx = Context::builder().current_dir(dir.path()).build().unwrap();
        let err = ctx
            .load_module(&JsModule::new("dep.js", "export const base = ;"))
            .unwrap_err();
        assert!(matches!(err, ContextError::Compile(_)), "got {err}");

        let handle = ctx
            .load_module(&JsModule::new(
                "main.js",
                "import { base } from './dep.js';\nexport const value = () => base;",
            ))
            .unwrap();
        assert_eq!(ctx.call_module(&handle, "value", &[]).unwrap(), json!(7));
    }

    #[test]
    fn test_call_module_async() {
        let mut ctx = setup_context();
        let handle = ctx
            .load_module(&JsModule::new(
                "job.js",
                "export async function work(n) { await new Promise(r => setTimeout(r, 0)); return n * 10; }",
            ))
            .unwrap();

        let mut promise = ctx.call_module_async(&handle, "work", &[json!(4)]).unwrap();
        while !promise.step(&mut ctx).unwrap() {}
        assert_eq!(promise.result().unwrap(), json!(40));
    }

    #[test]
    fn test_handle_from_other_context_is_rejected() {
        let mut a = setup_context();
        let mut b = setup_context();
        let handle = a
            .load_module(&JsModule::new("m.js", "export const f = () => 1;"))
            .unwrap();

        let err = b.call_module(&handle, "f", &[]).unwrap_err();
        assert!(matches!(err, ContextError::InvalidHandle(_)), "got {err}");
        let err = b.call_module_async(&handle, "f", &[]).unwrap_err();
        assert!(matches!(err, ContextError::InvalidHandle(_)), "got {err}");

        drop(a);
        let err = b.call_module(&handle, "f", &[]).unwrap_err();
        assert!(matches!(err, ContextError::InvalidHandle(_)), "got {err}");
    }

    #[test]
    fn test_modules_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dep.js"), "export const base = 100;").unwrap();
        fs::write(
            dir.path().join("main.js"),
            "import { base } from './dep.js';\nexport function total(n) { return base + n; }",
        )
        .unwrap();

        let mut ctx = setup_context();
        let module = JsModule::load(dir.path().join("main.js")).unwrap();
        let handle = ctx.load_module(&module).unwrap();
        assert_eq!(ctx.call_module(&handle, "total", &[json!(1)]).unwrap(), json!(101));

        let modules = JsModule::load_dir(dir.path()).unwrap();
        assert_eq!(modules.len(), 2);
    }

    #[test]
    fn test_imports_resolve_against_current_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shared.mjs"), "export const greeting = 'hi';").unwrap();

        init_tracing();
        let mut ctx = Context::builder().current_dir(dir.path()).build().unwrap();
        let handle = ctx
            .load_module(&JsModule::new(
                "entry.js",
                "import { greeting } from './shared';\nexport const greet = (n) => `${greeting} ${n}`;",
            ))
            .unwrap();
        assert_eq!(ctx.call_module(&handle, "greet", &[json!("bob")]).unwrap(), json!("hi bob"));

        let file = dir.path().join("shared.mjs");
        let err = ctx.set_current_dir(&file).unwrap_err();
        assert!(matches!(err, ContextError::NotADirectory { .. }), "got {err}");
    }
}

mod limit_tests {
    use super::*;

    #[test]
    fn test_timeout_interrupts_infinite_loop() {
        init_tracing();
        let mut ctx = Context::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        assert_eq!(ctx.timeout(), Some(Duration::from_millis(100)));

        let err = ctx.eval("while (true) {}").unwrap_err();
        assert!(matches!(err, ContextError::Timeout(_)), "got {err}");
        assert!(ctx.is_poisoned());

        let err = ctx.eval("1").unwrap_err();
        assert!(matches!(err, ContextError::Fatal(_)), "got {err}");
        let err = ctx.advance(AdvanceOptions::default()).unwrap_err();
        assert!(matches!(err, ContextError::Fatal(_)), "got {err}");
    }

    #[test]
    fn test_timeout_does_not_fire_for_quick_calls() {
        init_tracing();
        let mut ctx = Context::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        for _ in 0..10 {
            assert_eq!(ctx.eval("1 + 1").unwrap(), json!(2));
        }
        assert!(!ctx.is_poisoned());
    }

    #[test]
    fn test_small_heap_is_out_of_memory() {
        init_tracing();
        let mut ctx = Context::builder()
            .max_heap_size(2 * 1024 * 1024)
            .build()
            .unwrap();

        let err = ctx
            .eval("const keep = []; while (true) { keep.push(new Array(100000).fill(1)); }")
            .unwrap_err();
        assert!(matches!(err, ContextError::OutOfMemory { .. }), "got {err}");

        let err = ctx.eval("1").unwrap_err();
        assert!(matches!(err, ContextError::Fatal(_)), "got {err}");
        let err = ctx.call_async("anything", &[]).unwrap_err();
        assert!(matches!(err, ContextError::Fatal(_)), "got {err}");
    }

    #[test]
    fn test_empty_throw_under_heap_limit_is_not_fatal() {
        init_tracing();
        let mut ctx = Context::builder()
            .max_heap_size(64 * 1024 * 1024)
            .build()
            .unwrap();

        for source in ["throw undefined", "throw null"] {
            let err = ctx.eval(source).unwrap_err();
            assert!(matches!(err, ContextError::Runtime(_)), "got {err}");
        }
        let err = ctx
            .eval("throw new Error('out of memory')")
            .unwrap_err();
        assert!(matches!(err, ContextError::Runtime(_)), "got {err}");
        assert!(!ctx.is_poisoned());
    }

    #[test]
    fn test_heap_usage() {
        let mut ctx = setup_context();
        ctx.eval("globalThis.blob = new Array(10000).fill('x');").unwrap();
        let usage = ctx.heap_usage();
        assert!(usage.used_bytes > 0);
        assert_eq!(usage.limit, None);
        ctx.run_gc();
    }
}
