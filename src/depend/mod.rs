//! Dependence registration and signal delivery.
//!
//! The runtime's edges connect events, datablocks and tasks. This module
//! dispatches on the (source kind, destination kind) pair and rejects
//! every combination the model does not define.

use crate::error::{Result, RuntimeError};
use crate::event::{register_waiter_on_event, satisfy};
use crate::registry::{Guid, Object, Payload};
use crate::runtime::{Runtime, WorkerCtx};
use crate::task;

#[cfg(test)]
mod tests;

/// Add the dependence `source -> dest` on the destination's `slot`.
///
/// Event-to-event wiring is plain waiter registration; everything with a
/// task destination goes through signaler bookkeeping so the task knows
/// its arity is complete. An already-available datablock source fires the
/// destination immediately.
pub(crate) fn register_dependence(
    rt: &Runtime,
    ctx: WorkerCtx,
    source: Guid,
    dest: Guid,
    slot: u32,
) -> Result<()> {
    let src = rt.registry().resolve(source)?;
    let dst = rt.registry().resolve(dest)?;
    tracing::trace!(%source, %dest, slot, "dependence registered");
    match (&src, &dst) {
        (Object::Event(src_event), Object::Event(dst_event)) => {
            register_waiter_on_event(rt, ctx, src_event, dst_event.guid(), slot)
        }
        _ => register_signaler(rt, ctx, src, dst, slot),
    }
}

/// Record `source` as the signaler of the destination task's `slot`.
fn register_signaler(
    rt: &Runtime,
    ctx: WorkerCtx,
    src: Object,
    dst: Object,
    slot: u32,
) -> Result<()> {
    match (&src, &dst) {
        (Object::Event(source), Object::Task(dest)) => {
            dest.set_signaler(slot, source.guid())?;
            arrival(rt, ctx, dest)
        }
        (Object::Datablock(source), Object::Task(dest)) => {
            dest.set_signaler(slot, source.guid())?;
            arrival(rt, ctx, dest)
        }
        (Object::Datablock(source), Object::Event(dest)) => {
            // The block already exists, so the event fires on the spot.
            satisfy(rt, ctx, dest, Some(source.guid()), slot)
        }
        _ => Err(RuntimeError::ProtocolViolation(
            "unsupported dependence source/destination pair",
        )),
    }
}

fn arrival(rt: &Runtime, ctx: WorkerCtx, dest: &std::sync::Arc<task::Task>) -> Result<()> {
    let arrived = dest.record_arrival();
    if arrived > dest.depc() {
        return Err(RuntimeError::ProtocolViolation(
            "more dependences than the template arity",
        ));
    }
    if arrived == dest.depc() {
        task::try_schedule(rt, ctx, dest)?;
    }
    Ok(())
}

/// Register `(dest, slot)` to be signaled when `source` becomes
/// available. A datablock source signals immediately.
pub(crate) fn register_waiter(
    rt: &Runtime,
    ctx: WorkerCtx,
    source: Guid,
    dest: Guid,
    slot: u32,
) -> Result<()> {
    match rt.registry().resolve(source)? {
        Object::Event(event) => register_waiter_on_event(rt, ctx, &event, dest, slot),
        Object::Datablock(block) => signal_waiter(rt, ctx, dest, Some(block.guid()), slot),
        _ => Err(RuntimeError::ProtocolViolation(
            "only events and datablocks can be waited on",
        )),
    }
}

/// Deliver a payload to a waiter: a task slot or a chained event.
pub(crate) fn signal_waiter(
    rt: &Runtime,
    ctx: WorkerCtx,
    target: Guid,
    payload: Payload,
    slot: u32,
) -> Result<()> {
    match rt.registry().resolve(target)? {
        Object::Event(event) => satisfy(rt, ctx, &event, payload, slot),
        Object::Task(task) => task::on_signal(rt, ctx, &task, payload, slot),
        _ => Err(RuntimeError::ProtocolViolation(
            "signal delivered to a non-waiter object",
        )),
    }
}
