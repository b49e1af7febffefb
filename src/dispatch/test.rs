use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use futures::future;
use futures::Future;
use parking_lot::Mutex;
use rand::Rng;

use super::*;
use crate::config::RuntimeConfig;
use crate::engine::ModuleDef;
use crate::error::ErrorKind;
use crate::testlib;

struct Fixture {
    odds: Arc<Invocable>,
    even: Arc<Invocable>,
    frame: Arc<CallFrame>,
}

fn foo_fixture(rt: &Runtime, limit: i64) -> Fixture {
    let held = rt.held().unwrap();
    let foo = held.import("foo").unwrap();
    let odds = Invocable::new(held, held.get_attr(&foo, "print_odds").unwrap()).unwrap();
    let even = Invocable::new(held, held.get_attr(&foo, "print_even").unwrap()).unwrap();

    let args = held.make_tuple(1).unwrap();
    held.tuple_set(&args, 0, held.make_int(limit).unwrap()).unwrap();
    let frame = CallFrame::new(held, args, Some(held.make_mapping().unwrap())).unwrap();

    Fixture {
        odds: Arc::new(odds),
        even: Arc::new(even),
        frame: Arc::new(frame),
    }
}

#[test]
fn both_counters_run_and_nothing_leaks() {
    let _serial = testlib::serial();
    let (def, transcript) = testlib::recording_module("foo");
    let mut rt = Runtime::initialize(RuntimeConfig::default()).unwrap();
    rt.interpreter().register_module(def);
    let fx = foo_fixture(&rt, 50);
    let interp = rt.interpreter().clone();

    let barrier = Arc::new(CompletionBarrier::new(2));
    let token = rt.save_and_release().unwrap();
    let a = dispatch(&interp, fx.odds.clone(), fx.frame.clone(), Some(barrier.clone())).unwrap();
    let b = dispatch(&interp, fx.even.clone(), fx.frame.clone(), Some(barrier.clone())).unwrap();
    barrier.wait();
    rt.restore_and_acquire(token).unwrap();
    assert_eq!(barrier.releases(), 1);

    let results = future::join_all(vec![a, b]).wait().unwrap();
    let held = rt.held().unwrap();
    for r in &results {
        assert_eq!(held.type_name(r), Some("NoneType"));
    }
    assert_eq!(transcript.count_prefix("odds:"), 25);
    assert_eq!(transcript.count_prefix("even:"), 25);

    drop(results);
    drop(fx);
    let stats = rt.finalize().unwrap();
    assert!(stats.balanced());
    assert!(stats.stolen > 0);
    assert_eq!(interp.invoke_stats().peak, 1);
    let locks = interp.lock_stats();
    assert_eq!((locks.saves, locks.restores), (1, 1));
}

#[test]
fn dispatch_all_collects_in_order() {
    let _serial = testlib::serial();
    let (def, _) = testlib::recording_module("foo");
    let mut rt = Runtime::initialize(RuntimeConfig::default()).unwrap();
    rt.interpreter().register_module(def);
    rt.interpreter().register_module(ModuleDef::new("echo").function("limit", |held, args| {
        let n = held.int_value(&args.arg(0, "limit").unwrap())?;
        held.make_int(n * 10)
    }));

    let (echo, frames) = {
        let held = rt.held().unwrap();
        let module = held.import("echo").unwrap();
        let echo = Arc::new(Invocable::new(held, held.get_attr(&module, "limit").unwrap()).unwrap());
        let mut frames = Vec::new();
        for i in 0..4 {
            let args = held.make_tuple(1).unwrap();
            held.tuple_set(&args, 0, held.make_int(i).unwrap()).unwrap();
            frames.push(Arc::new(CallFrame::new(held, args, None).unwrap()));
        }
        (echo, frames)
    };

    let jobs: Vec<_> = frames.iter().map(|f| (echo.clone(), f.clone())).collect();
    let results = dispatch_all(&mut rt, &jobs).unwrap();
    assert!(rt.is_holding());

    let held = rt.held().unwrap();
    let values: Vec<i64> = results.iter().map(|r| held.int_value(r).unwrap()).collect();
    assert_eq!(values, vec![0, 10, 20, 30]);

    drop(results);
    drop(jobs);
    drop(frames);
    drop(echo);
    assert!(rt.finalize().unwrap().balanced());
}

#[test]
fn invocations_never_overlap() {
    let _serial = testlib::serial();
    let mut rt = Runtime::initialize(RuntimeConfig::default()).unwrap();
    let inside = Arc::new(Mutex::new((0usize, 0usize)));
    let probe = inside.clone();
    rt.interpreter().register_module(ModuleDef::new("slow").function("work", move |held, _| {
        {
            let mut p = probe.lock();
            p.0 += 1;
            p.1 = p.1.max(p.0);
        }
        thread::sleep(Duration::from_millis(rand::thread_rng().gen_range(0, 3)));
        probe.lock().0 -= 1;
        Ok(held.make_none())
    }));

    let (work, frame) = {
        let held = rt.held().unwrap();
        let module = held.import("slow").unwrap();
        let work = Invocable::new(held, held.get_attr(&module, "work").unwrap()).unwrap();
        let frame = CallFrame::new(held, held.make_tuple(0).unwrap(), None).unwrap();
        (Arc::new(work), Arc::new(frame))
    };

    let jobs: Vec<_> = (0..8).map(|_| (work.clone(), frame.clone())).collect();
    let results = dispatch_all(&mut rt, &jobs).unwrap();
    assert_eq!(results.len(), 8);

    assert_eq!(inside.lock().1, 1);
    let stats = rt.interpreter().invoke_stats();
    assert_eq!((stats.calls, stats.peak), (8, 1));

    drop(results);
    drop(jobs);
    drop(work);
    drop(frame);
    assert!(rt.finalize().unwrap().balanced());
}

#[test]
fn failing_worker_still_signals() {
    let _serial = testlib::serial();
    let reporter = Arc::new(testlib::CollectingReporter::new());
    let (def, transcript) = testlib::recording_module("foo");
    let mut rt = Runtime::initialize_with(RuntimeConfig::default(), reporter.clone()).unwrap();
    rt.interpreter().register_module(def);
    rt.interpreter().register_module(ModuleDef::new("bad").function("fail", |_, _| {
        Err(EngineError::Invocation("worker failed".into()))
    }));
    let fx = foo_fixture(&rt, 4);
    let fail = {
        let held = rt.held().unwrap();
        let bad = held.import("bad").unwrap();
        Arc::new(Invocable::new(held, held.get_attr(&bad, "fail").unwrap()).unwrap())
    };

    let jobs = vec![
        (fx.odds.clone(), fx.frame.clone()),
        (fail.clone(), fx.frame.clone()),
        (fx.even.clone(), fx.frame.clone()),
    ];
    let err = dispatch_all(&mut rt, &jobs).unwrap_err();
    assert_eq!(err, EngineError::Invocation("worker failed".into()));
    assert!(rt.is_holding());
    // The other workers still ran to completion.
    assert_eq!(transcript.lines().len(), 4);

    drop(jobs);
    drop(fail);
    drop(fx);
    assert!(rt.finalize().unwrap().balanced());
    assert!(reporter.messages().is_empty());
}

#[test]
fn panicking_worker_still_signals() {
    let _serial = testlib::serial();
    let mut rt = Runtime::initialize(RuntimeConfig::default()).unwrap();
    rt.interpreter().register_module(ModuleDef::new("bad").function("explode", |_, _| {
        panic!("native exploded")
    }));
    let (explode, frame) = {
        let held = rt.held().unwrap();
        let bad = held.import("bad").unwrap();
        let explode = Invocable::new(held, held.get_attr(&bad, "explode").unwrap()).unwrap();
        (Arc::new(explode), Arc::new(CallFrame::new(held, held.make_tuple(0).unwrap(), None).unwrap()))
    };

    let err = dispatch_all(&mut rt, &[(explode.clone(), frame.clone())]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invocation);
    assert!(rt.is_holding());
    assert_eq!(rt.interpreter().invoke_stats().active, 0);

    drop(explode);
    drop(frame);
    assert!(rt.finalize().unwrap().balanced());
}

#[test]
fn unbound_workers_use_transient_contexts() {
    let _serial = testlib::serial();
    let mut config = RuntimeConfig::default();
    config.bind_worker_context = false;
    let mut rt = Runtime::initialize(config).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    rt.interpreter().register_module(ModuleDef::new("ctx").function("which", move |held, _| {
        record.lock().push(held.context());
        Ok(held.make_none())
    }));

    let (which, frame) = {
        let held = rt.held().unwrap();
        let module = held.import("ctx").unwrap();
        let which = Invocable::new(held, held.get_attr(&module, "which").unwrap()).unwrap();
        (Arc::new(which), Arc::new(CallFrame::new(held, held.make_tuple(0).unwrap(), None).unwrap()))
    };
    let jobs = vec![(which.clone(), frame.clone()), (which.clone(), frame.clone())];
    dispatch_all(&mut rt, &jobs).unwrap();

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|c| c.map_or(false, |c| !c.bound)));

    drop(jobs);
    drop(which);
    drop(frame);
    rt.finalize().unwrap();
}

#[test]
fn bounded_worker_acquire_times_out() {
    let _serial = testlib::serial();
    let mut config = RuntimeConfig::default();
    config.acquire_timeout_ms = Some(10);
    let (def, transcript) = testlib::recording_module("foo");
    let rt = Runtime::initialize(config).unwrap();
    rt.interpreter().register_module(def);
    let fx = foo_fixture(&rt, 3);

    // The coordinator never lets go.
    let inv = dispatch(rt.interpreter(), fx.odds.clone(), fx.frame.clone(), None).unwrap();
    let err = inv.wait().unwrap_err();
    assert_eq!(err, EngineError::LockTimeout(Duration::from_millis(10)));
    assert!(transcript.lines().is_empty());

    drop(fx);
    rt.finalize().unwrap();
}

#[test]
fn call_frames_check_their_parts() {
    let _serial = testlib::serial();
    let rt = Runtime::initialize(RuntimeConfig::default()).unwrap();
    {
        let held = rt.held().unwrap();
        let err = CallFrame::new(held, held.make_int(1).unwrap(), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Construction);
        let err = CallFrame::new(held, held.make_tuple(0).unwrap(), Some(held.make_none())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Construction);
        let err = Invocable::new(held, held.make_str("f").unwrap()).unwrap_err();
        assert_eq!(err, EngineError::Invocation("'str' object is not callable".into()));
    }
    assert!(rt.finalize().unwrap().balanced());
}

#[test]
fn barrier_releases_exactly_once() {
    let barrier = Arc::new(CompletionBarrier::new(3));
    let handles: Vec<_> = (0..3).map(|_| {
        let arrival = barrier.arrival();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(rand::thread_rng().gen_range(0, 5)));
            arrival.arrive();
        })
    }).collect();

    barrier.wait();
    assert_eq!(barrier.arrived(), 3);
    assert_eq!(barrier.releases(), 1);
    for h in handles {
        h.join().unwrap();
    }

    // A stray arrival is logged, never a second release.
    barrier.arrival().arrive();
    assert_eq!(barrier.releases(), 1);
    assert_eq!(barrier.arrived(), 4);
}

#[test]
fn barrier_does_not_release_early() {
    let barrier = Arc::new(CompletionBarrier::new(2));
    barrier.arrival().arrive();
    assert!(!barrier.wait_timeout(Duration::from_millis(20)));
    assert!(!barrier.is_released());
    assert_eq!(barrier.releases(), 0);

    drop(barrier.arrival());
    assert!(barrier.wait_timeout(Duration::from_millis(20)));
}

#[test]
fn arrival_signals_on_panic() {
    let barrier = Arc::new(CompletionBarrier::new(1));
    let arrival = barrier.arrival();
    let r = panic::catch_unwind(AssertUnwindSafe(move || {
        let _arrival = arrival;
        panic!("worker died");
    }));
    assert!(r.is_err());
    assert!(barrier.is_released());
}
