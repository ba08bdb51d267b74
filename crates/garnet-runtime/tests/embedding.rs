//! Embedder-facing surface: interrupts, the accelerator hand-off, event
//! hooks and the profiler

mod common;

use common::*;
#[allow(unused_imports)]
use common::{assert_eq, assert_ne};
use garnet_runtime::iseq::{EventEntry, EventFlags};
use garnet_runtime::vm::accel::NamedAccelerator;
use garnet_runtime::vm::{AccelOutcome, AccelRequest, Accelerator, CacheKind, Interrupt, TraceEvent};
use garnet_runtime::{Garnet, Iseq, ObjectModel, StackInsn, Value, VmError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// def add1(a) = a + 1; [add1(1), add1(2)]
fn add1_twice() -> Iseq {
    let add1 = method("add1", &["a"], vec![local(0), int(1), StackInsn::OptPlus, StackInsn::Leave]);
    with_method(
        add1,
        vec![
            StackInsn::PutSelf,
            int(1),
            fcall("add1", 1),
            StackInsn::PutSelf,
            int(2),
            fcall("add1", 1),
            StackInsn::NewArray { count: 2 },
            StackInsn::Leave,
        ],
    )
}

mod interrupts {
    use super::*;
    #[allow(unused_imports)]
    use super::{assert_eq, assert_ne};

    #[test]
    fn test_stop_raises_interrupt() {
        let mut garnet = Garnet::capturing();
        garnet.vm().interrupt_token().post(Interrupt::Stop);
        let result = garnet.run(&counting_loop(1_000));
        assert_eq!(outcome(&garnet, result), "error: Interrupt");
    }

    #[test]
    fn test_timer_is_ignored_by_default() {
        let mut garnet = Garnet::capturing();
        let token = garnet.vm().interrupt_token();
        token.post(Interrupt::Timer);
        let result = garnet.run(&counting_loop(10));
        assert_eq!(outcome(&garnet, result), "10");
        assert!(!token.is_pending());
    }

    #[test]
    fn test_custom_handler() {
        let mut garnet = Garnet::capturing();
        garnet.vm().set_interrupt_handler(Arc::new(
            |host: &dyn ObjectModel, interrupt: Interrupt| match interrupt {
                Interrupt::Custom(3) => Some(host.make_exception("RuntimeError", "custom stop")),
                _ => None,
            },
        ));
        let token = garnet.vm().interrupt_token();

        token.post(Interrupt::Custom(1));
        let result = garnet.run(&counting_loop(10));
        assert_eq!(outcome(&garnet, result), "10");

        token.post(Interrupt::Custom(3));
        let result = garnet.run(&counting_loop(10));
        assert_eq!(outcome(&garnet, result), "error: custom stop (RuntimeError)");
    }

    #[test]
    fn test_polling_can_be_disabled() {
        let mut settings = settings(true, false);
        settings.vm.check_interrupts = false;
        let mut garnet = garnet_with(&settings);
        let token = garnet.vm().interrupt_token();
        token.post(Interrupt::Stop);
        let result = garnet.run(&counting_loop(10));
        assert_eq!(outcome(&garnet, result), "10");
        assert!(token.is_pending());
    }

    #[test]
    fn test_post_from_another_thread() {
        let mut garnet = Garnet::capturing();
        let token = garnet.vm().interrupt_token();
        std::thread::spawn(move || token.post(Interrupt::Stop))
            .join()
            .unwrap();
        let result = garnet.run(&counting_loop(1_000));
        assert_eq!(outcome(&garnet, result), "error: Interrupt");
    }
}

mod accelerator {
    use super::*;
    #[allow(unused_imports)]
    use super::{assert_eq, assert_ne};

    fn accelerate<F>(garnet: &mut Garnet, run: F)
    where
        F: Fn(&AccelRequest<'_>) -> AccelOutcome + Send + Sync + 'static,
    {
        garnet
            .vm()
            .set_accelerator(Some(Arc::new(NamedAccelerator::new("add1", run))));
    }

    #[test]
    fn test_handled_call_skips_interpretation() {
        let mut garnet = Garnet::capturing();
        accelerate(&mut garnet, |request| match request.args {
            [Value::Fixnum(n)] => AccelOutcome::Handled(Value::int(n * 100)),
            _ => AccelOutcome::NotHandled,
        });
        let result = garnet.run(&add1_twice());
        assert_eq!(outcome(&garnet, result), "[100, 200]");
    }

    #[test]
    fn test_not_handled_counts_entries() {
        let entries = Arc::new(AtomicU32::new(0));
        let seen = entries.clone();
        let mut garnet = Garnet::capturing();
        accelerate(&mut garnet, move |request| {
            seen.store(request.entries, Ordering::SeqCst);
            AccelOutcome::NotHandled
        });
        let result = garnet.run(&add1_twice());
        assert_eq!(outcome(&garnet, result), "[2, 3]");
        assert_eq!(entries.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_stops_offering_the_routine() {
        let offers = Arc::new(AtomicU32::new(0));
        let counter = offers.clone();
        let mut garnet = Garnet::capturing();
        accelerate(&mut garnet, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            AccelOutcome::Cancel
        });
        let routine = garnet.compile(&add1_twice()).unwrap();
        let value = garnet.run_routine(routine.clone()).unwrap();
        assert_eq!(garnet.inspect(&value), "[2, 3]");
        assert_eq!(offers.load(Ordering::SeqCst), 1);
        assert!(routine.children[0].accel.is_cancelled());
    }

    /// Gives up on `outer` and answers 100 for anything else.
    #[derive(Default)]
    struct CancelOuter {
        offers: Mutex<Vec<String>>,
    }

    impl Accelerator for CancelOuter {
        fn enter(&self, request: &AccelRequest<'_>) -> AccelOutcome {
            self.offers.lock().push(request.routine.name.clone());
            match request.routine.name.as_str() {
                "outer" => AccelOutcome::Cancel,
                _ => AccelOutcome::Handled(Value::int(100)),
            }
        }
    }

    /// def inner(a) = a + 1; def outer(a) = inner(a); [outer(1), inner(1)]
    fn outer_and_inner() -> Iseq {
        let inner = method("inner", &["a"], vec![local(0), int(1), StackInsn::OptPlus, StackInsn::Leave]);
        let outer = method(
            "outer",
            &["a"],
            vec![StackInsn::PutSelf, local(0), fcall("inner", 1), StackInsn::Leave],
        );
        let mut iseq = top(vec![
            StackInsn::DefineMethod {
                name: "inner".into(),
                iseq: 0,
            },
            StackInsn::Pop,
            StackInsn::DefineMethod {
                name: "outer".into(),
                iseq: 1,
            },
            StackInsn::Pop,
            StackInsn::PutSelf,
            int(1),
            fcall("outer", 1),
            StackInsn::PutSelf,
            int(1),
            fcall("inner", 1),
            StackInsn::NewArray { count: 2 },
            StackInsn::Leave,
        ]);
        iseq.children = vec![inner, outer];
        iseq
    }

    #[test]
    fn test_calls_from_cancelled_frame_are_interpreted() {
        let accel = Arc::new(CancelOuter::default());
        let mut garnet = Garnet::capturing();
        garnet
            .vm()
            .set_accelerator(Some(accel.clone() as Arc<dyn Accelerator>));
        let routine = garnet.compile(&outer_and_inner()).unwrap();

        let value = garnet.run_routine(routine.clone()).unwrap();
        assert_eq!(garnet.inspect(&value), "[2, 100]");
        assert_eq!(*accel.offers.lock(), vec!["outer", "inner"]);

        // `outer` is never offered again and its frame stays cancelled
        let value = garnet.run_routine(routine).unwrap();
        assert_eq!(garnet.inspect(&value), "[2, 100]");
        assert_eq!(*accel.offers.lock(), vec!["outer", "inner", "inner"]);
    }

    #[test]
    fn test_failed_call_raises_in_caller() {
        let mut garnet = Garnet::capturing();
        let host = garnet.host().clone();
        accelerate(&mut garnet, move |_| {
            AccelOutcome::Failed(VmError::Raised(
                host.make_exception("RuntimeError", "compiled code failed"),
            ))
        });
        let result = garnet.run(&add1_twice());
        assert_eq!(
            outcome(&garnet, result),
            "error: compiled code failed (RuntimeError)"
        );
    }
}

mod hooks {
    use super::*;
    #[allow(unused_imports)]
    use super::{assert_eq, assert_ne};

    fn two_lines() -> Iseq {
        // line 1: a = 5
        // line 2: a + 1
        let mut iseq = top(vec![
            int(5),
            set_local(0),
            local(0),
            int(1),
            StackInsn::OptPlus,
            StackInsn::Leave,
        ])
        .with_locals(&["a"]);
        iseq.events = vec![
            EventEntry {
                pos: 0,
                line: 1,
                events: EventFlags::LINE,
            },
            EventEntry {
                pos: 2,
                line: 2,
                events: EventFlags::LINE,
            },
        ];
        iseq
    }

    #[test]
    fn test_line_events_reach_the_hook() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let mut garnet = Garnet::capturing();
        garnet.vm().set_event_hook(Some(Box::new(move |event: &TraceEvent<'_>| {
            if event.events.contains(EventFlags::LINE) {
                sink.lock().push((event.routine.to_string(), event.line));
            }
        })));
        let result = garnet.run(&two_lines());
        assert_eq!(outcome(&garnet, result), "6");
        assert_eq!(
            *lines.lock(),
            vec![
                ("<main>".to_string(), Some(1)),
                ("<main>".to_string(), Some(2)),
            ]
        );
    }

    #[test]
    fn test_raise_event() {
        let raised = Arc::new(AtomicU32::new(0));
        let counter = raised.clone();
        let mut garnet = Garnet::capturing();
        garnet.vm().set_event_hook(Some(Box::new(move |event: &TraceEvent<'_>| {
            if event.events.contains(EventFlags::RAISE) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })));
        let iseq = top(vec![
            StackInsn::PutSelf,
            string("boom"),
            fcall("raise", 1),
            StackInsn::Leave,
        ]);
        assert!(garnet.run(&iseq).is_err());
        assert_eq!(raised.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_hook_sees_nothing() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let mut garnet = Garnet::capturing();
        garnet.vm().set_event_hook(Some(Box::new(move |_: &TraceEvent<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        garnet.vm().set_event_hook(None);
        garnet.run(&two_lines()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

mod profiling {
    use super::*;
    #[allow(unused_imports)]
    use super::{assert_eq, assert_ne};

    #[test]
    fn test_profiler_off_by_default() {
        let mut garnet = Garnet::capturing();
        garnet.run(&counting_loop(3)).unwrap();
        assert!(garnet.profiler().is_none());
    }

    #[test]
    fn test_call_cache_hits_on_repeat_calls() {
        let mut garnet = garnet_with(&settings(true, true));
        let routine = garnet.compile(&add1_twice()).unwrap();
        garnet.run_routine(routine.clone()).unwrap();
        garnet.run_routine(routine).unwrap();

        let stats = garnet.profiler().unwrap().cache_stats(CacheKind::Call);
        assert!(stats.misses >= 2, "{:?}", stats);
        assert!(stats.hits >= 2, "{:?}", stats);
    }

    #[test]
    fn test_report_lists_instructions() {
        let mut garnet = garnet_with(&settings(true, true));
        garnet.run(&counting_loop(10)).unwrap();
        let report = garnet.profiler().unwrap().report();
        assert!(report.contains("Total instructions executed:"));
        assert!(report.contains("Instruction counts:"));
        assert!(report.contains("iplusi"));
    }

    #[test]
    fn test_reset() {
        let mut garnet = garnet_with(&settings(true, true));
        garnet.run(&counting_loop(10)).unwrap();
        let profiler = garnet.vm().profiler_mut().unwrap();
        assert!(profiler.total_instructions() > 0);
        profiler.reset();
        assert_eq!(profiler.total_instructions(), 0);
        assert_eq!(profiler.rewrites(), 0);
    }
}
