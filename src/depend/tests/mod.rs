//! Dependence dispatch unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::runtime::{Runtime, RuntimeConfig, WorkerCtx};
use crate::task::TaskOptions;
use crate::{EventKind, RuntimeError};

fn test_runtime() -> Arc<Runtime> {
    Runtime::new(RuntimeConfig {
        num_workers: 1,
        num_controllers: 1,
        start_threads: false,
        ..RuntimeConfig::default()
    })
}

#[test]
fn test_event_to_event_dependence() {
    let rt = test_runtime();
    let ctx = WorkerCtx::external();
    let src = rt.create_event(EventKind::Sticky);
    let dst = rt.create_event(EventKind::Sticky);

    rt.add_dependence(ctx, src, dst, 0).unwrap();
    rt.satisfy(ctx, src, None, 0).unwrap();
    assert_eq!(rt.event_get(dst).unwrap(), Some(None));
}

#[test]
fn test_datablock_to_task_signals_immediately() {
    let rt = test_runtime();
    let ctx = WorkerCtx::external();
    let got = Arc::new(AtomicUsize::new(0));
    let got2 = got.clone();
    let tpl = rt.create_template(1, move |_ctx, _params, deps| {
        assert!(deps[0].ptr().is_some());
        got2.fetch_add(1, Ordering::SeqCst);
        None
    });

    let db = rt.create_datablock(16).unwrap();
    rt.create_task(ctx, tpl, &[], &[Some(db)], TaskOptions::default(), None)
        .unwrap();
    assert_eq!(rt.drain().unwrap(), 1);
    assert_eq!(got.load(Ordering::SeqCst), 1);
}

#[test]
fn test_datablock_to_event_satisfies_on_the_spot() {
    let rt = test_runtime();
    let ctx = WorkerCtx::external();
    let db = rt.create_datablock(16).unwrap();
    let ev = rt.create_event(EventKind::Sticky);

    rt.add_dependence(ctx, db, ev, 0).unwrap();
    assert_eq!(rt.event_get(ev).unwrap(), Some(Some(db)));
}

#[test]
fn test_task_source_is_rejected() {
    let rt = test_runtime();
    let ctx = WorkerCtx::external();
    let tpl = rt.create_template(1, |_ctx, _params, _deps| None);
    let blocked = rt
        .create_task(ctx, tpl, &[], &[], TaskOptions::default(), None)
        .unwrap();
    let ev = rt.create_event(EventKind::Sticky);

    // Tasks signal through their output events, never directly.
    assert!(matches!(
        rt.add_dependence(ctx, blocked.task, ev, 0).unwrap_err(),
        RuntimeError::ProtocolViolation(_)
    ));
}

#[test]
fn test_datablock_destination_is_rejected() {
    let rt = test_runtime();
    let ctx = WorkerCtx::external();
    let ev = rt.create_event(EventKind::Sticky);
    let db = rt.create_datablock(16).unwrap();

    assert!(matches!(
        rt.add_dependence(ctx, ev, db, 0).unwrap_err(),
        RuntimeError::ProtocolViolation(_)
    ));
}

#[test]
fn test_unknown_source_is_reported() {
    let rt = test_runtime();
    let ctx = WorkerCtx::external();
    let ev = rt.create_event(EventKind::Once);
    rt.satisfy(ctx, ev, None, 0).unwrap();
    let dst = rt.create_event(EventKind::Sticky);

    // The once event destroyed itself when it fired.
    assert_eq!(
        rt.add_dependence(ctx, ev, dst, 0).unwrap_err(),
        RuntimeError::UnknownIdentifier(ev)
    );
}
