//! Events: single-assignment, latch and finish-latch synchronization.
//!
//! Every event owns a lock-free [`waiter::WaiterList`]. Firing seals the
//! list in one CAS and drains it; a registration that loses the race
//! against the fire observes the seal and delivers the signal itself, so
//! no registration is ever dropped and none is delivered twice.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::depend::signal_waiter;
use crate::error::{Result, RuntimeError};
use crate::registry::{payload_from_raw, payload_to_raw, Guid, Payload};
use crate::runtime::{Runtime, WorkerCtx};

pub(crate) mod waiter;

use waiter::{Waiter, WaiterList};


/// Slot on which a latch is decremented.
pub const LATCH_DECR_SLOT: u32 = 0;
/// Slot on which a latch is incremented.
pub const LATCH_INCR_SLOT: u32 = 1;

/// "Never written" sentinel for the single-assignment data word. Distinct
/// from the raw encoding of every payload (`None` encodes as 0).
const UNSET_DATA: u64 = u64::MAX;

/// Event kinds exposed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Fires once, then self-destructs.
    Once,
    /// Fires once; later satisfies are ignored.
    Idem,
    /// Fires once; later satisfies are protocol violations.
    Sticky,
    /// Fires when its counter returns to zero.
    Latch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SingleKind {
    Once,
    Idem,
    Sticky,
}

pub(crate) struct FinishLatch {
    count: AtomicI64,
    /// Task whose finish scope this latch closes.
    owner: Guid,
    /// Where the scope's return payload is forwarded on completion.
    output: Option<Waiter>,
    /// Enclosing finish latch to check out of once this one drains.
    parent: Option<Guid>,
    /// Raw-encoded return payload, captured when the owner completes.
    ret: AtomicU64,
}

pub(crate) enum EventCore {
    Single {
        kind: SingleKind,
        data: AtomicU64,
        waiters: WaiterList,
    },
    Latch {
        count: AtomicI64,
        waiters: WaiterList,
    },
    FinishLatch(FinishLatch),
}

/// A registered event object.
pub struct Event {
    guid: Guid,
    core: EventCore,
}

impl Event {
    pub(crate) fn new_single(guid: Guid, kind: SingleKind) -> Self {
        Self {
            guid,
            core: EventCore::Single {
                kind,
                data: AtomicU64::new(UNSET_DATA),
                waiters: WaiterList::new(),
            },
        }
    }

    pub(crate) fn new_latch(guid: Guid) -> Self {
        Self {
            guid,
            core: EventCore::Latch {
                count: AtomicI64::new(0),
                waiters: WaiterList::new(),
            },
        }
    }

    pub(crate) fn new_finish_latch(
        guid: Guid,
        owner: Guid,
        output: Option<Waiter>,
        parent: Option<Guid>,
    ) -> Self {
        Self {
            guid,
            core: EventCore::FinishLatch(FinishLatch {
                count: AtomicI64::new(0),
                owner,
                output,
                parent,
                ret: AtomicU64::new(0),
            }),
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Non-blocking read of the event state: `None` while unfired,
    /// `Some(payload)` once fired. Latches carry no payload.
    pub fn get(&self) -> Option<Payload> {
        match &self.core {
            EventCore::Single { data, .. } => {
                let raw = data.load(Ordering::SeqCst);
                if raw == UNSET_DATA {
                    None
                } else {
                    Some(payload_from_raw(raw))
                }
            }
            EventCore::Latch { waiters, .. } => {
                if waiters.is_sealed() {
                    Some(None)
                } else {
                    None
                }
            }
            // A live finish latch has not drained yet.
            EventCore::FinishLatch(_) => None,
        }
    }

    /// The task owning the finish scope this latch closes, if this is a
    /// finish latch.
    pub(crate) fn finish_latch_owner(&self) -> Option<Guid> {
        match &self.core {
            EventCore::FinishLatch(fl) => Some(fl.owner),
            _ => None,
        }
    }

    /// Capture the scope's return payload before the final checkout.
    pub(crate) fn set_finish_return(&self, payload: Payload) {
        if let EventCore::FinishLatch(fl) = &self.core {
            fl.ret.store(payload_to_raw(payload), Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.core {
            EventCore::Single { kind, .. } => match kind {
                SingleKind::Once => "once",
                SingleKind::Idem => "idem",
                SingleKind::Sticky => "sticky",
            },
            EventCore::Latch { .. } => "latch",
            EventCore::FinishLatch(_) => "finish-latch",
        };
        f.debug_struct("Event")
            .field("guid", &self.guid)
            .field("kind", &kind)
            .finish_non_exhaustive()
    }
}

/// Satisfy an event on the given slot.
///
/// Single events accept slot 0 only; latches and finish latches accept
/// [`LATCH_DECR_SLOT`] and [`LATCH_INCR_SLOT`].
pub(crate) fn satisfy(
    rt: &Runtime,
    ctx: WorkerCtx,
    event: &Event,
    payload: Payload,
    slot: u32,
) -> Result<()> {
    match &event.core {
        EventCore::Single {
            kind,
            data,
            waiters,
        } => {
            if slot != 0 {
                return Err(RuntimeError::ProtocolViolation(
                    "single-assignment events have exactly one slot",
                ));
            }
            satisfy_single(rt, ctx, event.guid, *kind, data, waiters, payload)
        }
        EventCore::Latch { count, waiters } => {
            let delta = latch_delta(slot)?;
            let after = count.fetch_add(delta, Ordering::SeqCst) + delta;
            tracing::trace!(event = %event.guid, after, "latch satisfied");
            // The counter may dip negative while decrements race ahead
            // of their increments. Only a transition that lands on zero
            // may fire, and seal() yields the list to exactly one
            // caller.
            if after == 0 {
                if let Some(drained) = waiters.seal() {
                    tracing::debug!(event = %event.guid, waiters = drained.len(), "latch fired");
                    for w in drained {
                        signal_waiter(rt, ctx, w.target, None, w.slot)?;
                    }
                }
            }
            Ok(())
        }
        EventCore::FinishLatch(fl) => {
            let delta = latch_delta(slot)?;
            if delta > 0 {
                fl.count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            } else {
                finish_latch_checkout(rt, ctx, event.guid, fl)
            }
        }
    }
}

fn latch_delta(slot: u32) -> Result<i64> {
    match slot {
        LATCH_DECR_SLOT => Ok(-1),
        LATCH_INCR_SLOT => Ok(1),
        _ => Err(RuntimeError::ProtocolViolation("unknown latch slot")),
    }
}

fn satisfy_single(
    rt: &Runtime,
    ctx: WorkerCtx,
    guid: Guid,
    kind: SingleKind,
    data: &AtomicU64,
    waiters: &WaiterList,
    payload: Payload,
) -> Result<()> {
    let raw = payload_to_raw(payload);
    match data.compare_exchange(UNSET_DATA, raw, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => {
            // We won the assignment; the seal cannot have happened yet.
            let drained = waiters.seal().unwrap_or_default();
            tracing::debug!(event = %guid, waiters = drained.len(), "event fired");
            for w in drained {
                signal_waiter(rt, ctx, w.target, payload, w.slot)?;
            }
            if kind == SingleKind::Once {
                rt.registry().release(guid)?;
            }
            Ok(())
        }
        Err(_) => match kind {
            SingleKind::Idem => Ok(()),
            SingleKind::Sticky | SingleKind::Once => Err(RuntimeError::ProtocolViolation(
                "event already satisfied",
            )),
        },
    }
}

/// Account one more participant into a finish scope.
pub(crate) fn finish_latch_checkin(event: &Event) -> Result<()> {
    match &event.core {
        EventCore::FinishLatch(fl) => {
            fl.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        _ => Err(RuntimeError::ProtocolViolation(
            "checkin on a non-finish event",
        )),
    }
}

fn finish_latch_checkout(
    rt: &Runtime,
    ctx: WorkerCtx,
    guid: Guid,
    fl: &FinishLatch,
) -> Result<()> {
    let after = fl.count.fetch_sub(1, Ordering::SeqCst) - 1;
    tracing::trace!(event = %guid, after, "finish-latch checkout");
    if after < 0 {
        return Err(RuntimeError::ProtocolViolation(
            "finish-latch checkout without checkin",
        ));
    }
    if after != 0 {
        return Ok(());
    }
    // The scope has drained. Checkins are paired with checkouts and a
    // child checks in while its creator is still checked in, so the
    // counter lands on zero exactly once.
    tracing::debug!(event = %guid, owner = %fl.owner, "finish scope drained");
    if let Ok(owner) = rt.registry().task(fl.owner) {
        owner.clear_finish_scope();
    }
    let ret = payload_from_raw(fl.ret.load(Ordering::SeqCst));
    if let Some(out) = fl.output {
        signal_waiter(rt, ctx, out.target, ret, out.slot)?;
    }
    if let Some(parent) = fl.parent {
        let parent_event = rt.registry().event(parent)?;
        satisfy(rt, ctx, &parent_event, None, LATCH_DECR_SLOT)?;
    }
    rt.registry().release(guid)
}

/// Register `(target, slot)` on an event's waiter list, falling back to
/// immediate delivery when the event already fired.
pub(crate) fn register_waiter_on_event(
    rt: &Runtime,
    ctx: WorkerCtx,
    event: &Event,
    target: Guid,
    slot: u32,
) -> Result<()> {
    match &event.core {
        EventCore::Single { data, waiters, .. } => match waiters.push(target, slot) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Sealed implies the data word was written first.
                let payload = payload_from_raw(data.load(Ordering::SeqCst));
                signal_waiter(rt, ctx, target, payload, slot)
            }
        },
        EventCore::Latch { waiters, .. } => match waiters.push(target, slot) {
            Ok(()) => Ok(()),
            Err(_) => signal_waiter(rt, ctx, target, None, slot),
        },
        EventCore::FinishLatch(_) => Err(RuntimeError::ProtocolViolation(
            "finish latches do not accept late registration",
        )),
    }
}
