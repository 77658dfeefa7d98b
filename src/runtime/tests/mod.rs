//! Runtime unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::runtime::{Runtime, RuntimeConfig, WorkerCtx};
use crate::scheduler::WorkerId;
use crate::task::TaskOptions;
use crate::{EventKind, RuntimeError};

fn manual_runtime(num_workers: usize) -> Arc<Runtime> {
    Runtime::new(RuntimeConfig {
        num_workers,
        num_controllers: 1,
        start_threads: false,
        ..RuntimeConfig::default()
    })
}

#[test]
fn test_worker_and_controller_ids() {
    let rt = manual_runtime(3);
    assert_eq!(rt.worker_ids().collect::<Vec<_>>(), vec![
        WorkerId(0),
        WorkerId(1),
        WorkerId(2)
    ]);
    assert_eq!(rt.controller_ids().collect::<Vec<_>>(), vec![WorkerId(3)]);
}

#[test]
fn test_tick_controller_rejects_worker_ids() {
    let rt = manual_runtime(2);
    assert!(matches!(
        rt.tick_controller(WorkerId(0)).unwrap_err(),
        RuntimeError::ProtocolViolation(_)
    ));
    assert!(matches!(
        rt.tick_controller(WorkerId(9)).unwrap_err(),
        RuntimeError::ProtocolViolation(_)
    ));
}

#[test]
fn test_external_task_flows_through_controller_to_worker() {
    let rt = manual_runtime(2);
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = ran.clone();
    let tpl = rt.create_template(0, move |_ctx, _params, _deps| {
        ran2.fetch_add(1, Ordering::SeqCst);
        None
    });

    rt.create_task(
        WorkerCtx::external(),
        tpl,
        &[],
        &[],
        TaskOptions::default(),
        None,
    )
    .unwrap();

    // External work lands in the controller work pool; one controller
    // tick assigns it round-robin, starting at worker 0.
    let c = WorkerId(2);
    assert!(rt.tick_controller(c).unwrap());
    assert!(rt.tick_worker(WorkerId(0)).unwrap());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(!rt.tick_controller(c).unwrap());
}

#[test]
fn test_shipped_task_round_trips_through_the_controller() {
    let rt = manual_runtime(2);
    let tpl = rt.create_template(0, |_ctx, _params, _deps| None);

    let w0 = WorkerId(0);
    rt.create_task(WorkerCtx::on(w0), tpl, &[], &[], TaskOptions::default(), None)
        .unwrap();

    // The producing worker cannot run its own gift; it shipped it.
    assert!(!rt.tick_worker(w0).unwrap());

    // The controller services the message, pulls the shipped task into
    // its work pool and assigns it back out.
    let c = WorkerId(2);
    assert!(rt.tick_controller(c).unwrap());
    let executed = rt.worker_ids().try_fold(false, |done, w| {
        Ok::<_, RuntimeError>(done | rt.tick_worker(w)?)
    });
    assert!(executed.unwrap());

    assert_eq!(rt.stats().messages_handled.load(Ordering::SeqCst), 1);
    assert_eq!(rt.stats().tasks_shipped.load(Ordering::SeqCst), 1);
    assert_eq!(rt.stats().tasks_executed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_controller_steal_counters_track_takes() {
    let rt = manual_runtime(2);
    let tpl = rt.create_template(0, |_ctx, _params, _deps| None);
    rt.create_task(
        WorkerCtx::external(),
        tpl,
        &[],
        &[],
        TaskOptions::default(),
        None,
    )
    .unwrap();

    // One tick: the message pool misses, the work-pool take that
    // assigns the task hits.
    assert!(rt.tick_controller(WorkerId(2)).unwrap());
    assert_eq!(rt.stats().steal_successes.load(Ordering::SeqCst), 1);
    assert!(
        rt.stats().steal_attempts.load(Ordering::SeqCst)
            > rt.stats().steal_successes.load(Ordering::SeqCst)
    );
}

#[test]
fn test_drain_runs_a_task_graph_to_quiescence() {
    let rt = manual_runtime(3);
    let ctx = WorkerCtx::external();
    let ran = Arc::new(AtomicUsize::new(0));

    let leaf_ran = ran.clone();
    let leaf_tpl = rt.create_template(0, move |_ctx, _params, _deps| {
        leaf_ran.fetch_add(1, Ordering::SeqCst);
        None
    });
    let fan_ran = ran.clone();
    let fan_tpl = rt.create_template(0, move |ctx, _params, _deps| {
        fan_ran.fetch_add(1, Ordering::SeqCst);
        for _ in 0..4 {
            ctx.create_task(leaf_tpl, &[], &[], TaskOptions::default())
                .unwrap();
        }
        None
    });

    rt.create_task(ctx, fan_tpl, &[], &[], TaskOptions::default(), None)
        .unwrap();
    assert_eq!(rt.drain().unwrap(), 5);
    assert_eq!(ran.load(Ordering::SeqCst), 5);
    assert_eq!(rt.stats().tasks_scheduled.load(Ordering::SeqCst), 5);
}

#[test]
fn test_threaded_runtime_completes_a_finish_scope() {
    let rt = Runtime::new(RuntimeConfig {
        num_workers: 2,
        num_controllers: 1,
        idle_timeout: Duration::from_micros(100),
        ..RuntimeConfig::default()
    });

    let child_tpl = rt.create_template(0, |_ctx, _params, _deps| None);
    let parent_tpl = rt.create_template(0, move |ctx, _params, _deps| {
        for _ in 0..8 {
            ctx.create_task(child_tpl, &[], &[], TaskOptions::default())
                .unwrap();
        }
        None
    });

    let handle = rt
        .create_task(
            WorkerCtx::external(),
            parent_tpl,
            &[],
            &[],
            TaskOptions {
                finish: true,
                output_event: true,
            },
            None,
        )
        .unwrap();

    let out = handle.output_event.unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if rt.event_get(out).unwrap().is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "finish scope did not drain");
        std::thread::sleep(Duration::from_millis(1));
    }
    rt.shutdown();
    assert_eq!(rt.stats().tasks_executed.load(Ordering::SeqCst), 9);
}

#[test]
fn test_shutdown_is_idempotent() {
    let rt = Runtime::new(RuntimeConfig {
        num_workers: 1,
        num_controllers: 1,
        ..RuntimeConfig::default()
    });
    rt.shutdown();
    rt.shutdown();
}

#[test]
fn test_satisfy_unknown_event_is_reported() {
    let rt = manual_runtime(1);
    let ctx = WorkerCtx::external();
    let ev = rt.create_event(EventKind::Once);
    rt.satisfy(ctx, ev, None, 0).unwrap();

    assert_eq!(
        rt.satisfy(ctx, ev, None, 0).unwrap_err(),
        RuntimeError::UnknownIdentifier(ev)
    );
}
