//! End-to-end runs on a threaded runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft::{Guid, Runtime, RuntimeConfig, TaskOptions, WorkerCtx};

fn wait_for_event(rt: &Runtime, event: Guid) -> Option<Guid> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(payload) = rt.event_get(event).unwrap() {
            return payload;
        }
        assert!(Instant::now() < deadline, "event did not fire in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_fan_out_fan_in() {
    let rt = Runtime::new(RuntimeConfig {
        num_workers: 4,
        num_controllers: 1,
        idle_timeout: Duration::from_micros(200),
        ..RuntimeConfig::default()
    });
    let done = Arc::new(AtomicUsize::new(0));

    let done2 = done.clone();
    let leaf_tpl = rt.create_template(0, move |_ctx, _params, _deps| {
        done2.fetch_add(1, Ordering::SeqCst);
        None
    });
    let root_tpl = rt.create_template(0, move |ctx, _params, _deps| {
        for _ in 0..32 {
            ctx.create_task(leaf_tpl, &[], &[], TaskOptions::default())
                .unwrap();
        }
        None
    });

    let root = rt
        .create_task(
            WorkerCtx::external(),
            root_tpl,
            &[],
            &[],
            TaskOptions {
                finish: true,
                output_event: true,
            },
            None,
        )
        .unwrap();

    wait_for_event(&rt, root.output_event.unwrap());
    assert_eq!(done.load(Ordering::SeqCst), 32);
    rt.shutdown();
}

#[test]
fn test_pipeline_over_datablocks() {
    let rt = Runtime::new(RuntimeConfig {
        num_workers: 2,
        num_controllers: 1,
        idle_timeout: Duration::from_micros(200),
        ..RuntimeConfig::default()
    });

    // Each stage increments the value in the block it receives and
    // forwards the block through its output event.
    let stage_tpl = rt.create_template(1, |_ctx, _params, deps| {
        let ptr = deps[0].ptr().unwrap();
        unsafe {
            let cell = ptr.as_ptr() as *mut u64;
            cell.write(cell.read() + 1);
        }
        deps[0].guid()
    });

    let db = rt.create_datablock(8).unwrap();
    let head = rt.create_event(weft::EventKind::Sticky);

    let mut gate = head;
    let mut last = None;
    for _ in 0..5 {
        let stage = rt
            .create_task(
                WorkerCtx::external(),
                stage_tpl,
                &[],
                &[Some(gate)],
                TaskOptions {
                    output_event: true,
                    ..TaskOptions::default()
                },
                None,
            )
            .unwrap();
        gate = stage.output_event.unwrap();
        last = stage.output_event;
    }

    rt.satisfy(WorkerCtx::external(), head, Some(db), 0).unwrap();
    let payload = wait_for_event(&rt, last.unwrap());
    assert_eq!(payload, Some(db));

    let probe = rt.create_event(weft::EventKind::Sticky);
    let ptr = rt.datablock_acquire(db, probe).unwrap();
    assert_eq!(unsafe { (ptr.as_ptr() as *const u64).read() }, 5);
    rt.shutdown();
}

#[test]
fn test_dropping_the_runtime_stops_carriers() {
    let rt = Runtime::new(RuntimeConfig {
        num_workers: 2,
        num_controllers: 1,
        idle_timeout: Duration::from_micros(200),
        ..RuntimeConfig::default()
    });
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
    // Dropping the only strong handle ends the carrier loops.
    drop(rt);
}
