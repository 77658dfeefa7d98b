//! Two-tier scheduling policy.
//!
//! Worker-tier workers execute tasks but never steal: each owns an
//! assigned-work pile it pops from and a shipping pile it gives into.
//! Giving a plain task ships it and posts a pick-work-up message to the
//! controller tier. A controller alternates between message mode, where
//! it drains shipping piles on request, and work mode, where it assigns
//! buffered tasks round-robin into worker assigned piles. Pile mappings
//! are pure functions of worker id and tier size.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, RuntimeError};
use crate::registry::Guid;
use crate::runtime::Runtime;
use crate::task::MessageKind;

pub(crate) mod workpile;

use workpile::Workpile;


/// Dense worker identifier; worker-tier ids come first, controller-tier
/// ids follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Scheduling tier a worker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Executes tasks; never steals.
    Worker,
    /// Services messages and distributes work.
    Controller,
}

/// A registered worker object.
pub struct Worker {
    guid: Guid,
    id: WorkerId,
    tier: Tier,
}

impl Worker {
    pub(crate) fn new(guid: Guid, id: WorkerId, tier: Tier) -> Self {
        Self { guid, id, tier }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    #[inline]
    pub fn tier(&self) -> Tier {
        self.tier
    }
}

/// Worker-tier policy: per-worker assigned and shipping piles,
/// interleaved as `[assigned 0, shipping 0, assigned 1, shipping 1, ..]`.
pub(crate) struct WorkerScheduler {
    id_begin: usize,
    n_workers: usize,
    pools: Vec<Arc<Workpile>>,
}

impl WorkerScheduler {
    pub(crate) fn new(id_begin: usize, n_workers: usize) -> Self {
        let pools = (0..2 * n_workers.max(1))
            .map(|_| Arc::new(Workpile::new()))
            .collect();
        Self {
            id_begin,
            n_workers: n_workers.max(1),
            pools,
        }
    }

    #[inline]
    pub(crate) fn contains(&self, w: WorkerId) -> bool {
        w.0 >= self.id_begin && w.0 < self.id_begin + self.n_workers
    }

    #[inline]
    fn assigned_pile(&self, w: WorkerId) -> &Workpile {
        &self.pools[2 * (w.0 % self.n_workers)]
    }

    #[inline]
    fn shipping_pile(&self, w: WorkerId) -> &Workpile {
        &self.pools[1 + 2 * (w.0 % self.n_workers)]
    }

    /// A member pops its own assigned work; an outsider may be racing
    /// the producers, so it steals, and only from the shipping side.
    pub(crate) fn take(&self, w: WorkerId) -> Option<Guid> {
        if self.contains(w) {
            self.assigned_pile(w).pop(w)
        } else {
            self.shipping_pile(w).steal(w)
        }
    }

    /// A member gives work it produced. Plain tasks are buffered in the
    /// shipping pile and announced with a pick-work-up message; message
    /// tasks go straight out to the controller tier.
    pub(crate) fn give(&self, rt: &Runtime, w: WorkerId, task: Guid) -> Result<()> {
        if !self.contains(w) {
            return Err(RuntimeError::ProtocolViolation(
                "give by a worker outside the tier",
            ));
        }
        if rt.registry().task(task)?.is_message() {
            return rt.hand_out(task);
        }
        self.shipping_pile(w).push(task);
        tracing::trace!(worker = %w, %task, "task shipped");
        let message = rt.new_message_task(MessageKind::PickWorkUp, w);
        rt.hand_out(message)
    }

    /// Controller-side delivery into a member's assigned pile.
    pub(crate) fn push_assigned(&self, target: WorkerId, task: Guid) -> Result<()> {
        if !self.contains(target) {
            return Err(RuntimeError::ProtocolViolation(
                "assignment to a worker outside the tier",
            ));
        }
        tracing::trace!(worker = %target, %task, "task assigned");
        self.assigned_pile(target).push(task);
        Ok(())
    }

    /// Controller-side drain of a member's shipping pile.
    pub(crate) fn steal_shipping(&self, from: WorkerId) -> Result<Option<Guid>> {
        if !self.contains(from) {
            return Err(RuntimeError::ProtocolViolation(
                "shipping steal from a worker outside the tier",
            ));
        }
        Ok(self.shipping_pile(from).steal(from))
    }

    /// Worker-tier workers have no steal mapping.
    pub(crate) fn steal(&self, w: WorkerId) -> ! {
        unreachable!("worker {w} belongs to a tier that does not steal")
    }

    pub(crate) fn assigned_len(&self, w: WorkerId) -> usize {
        self.assigned_pile(w).len()
    }

    pub(crate) fn shipping_len(&self, w: WorkerId) -> usize {
        self.shipping_pile(w).len()
    }
}

/// Controller-tier policy: a message pool, a work pool, and a mode flag
/// selecting which one `take` draws from.
pub(crate) struct ControllerScheduler {
    work: Arc<Workpile>,
    messages: Arc<Workpile>,
    message_mode: AtomicBool,
    next_target: AtomicUsize,
}

impl ControllerScheduler {
    pub(crate) fn new() -> Self {
        Self {
            work: Arc::new(Workpile::new()),
            messages: Arc::new(Workpile::new()),
            message_mode: AtomicBool::new(true),
            next_target: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_message_mode(&self, on: bool) {
        self.message_mode.store(on, Ordering::SeqCst);
    }

    /// Route by task kind: messages to the message pool, plain work to
    /// the work pool.
    pub(crate) fn give(&self, rt: &Runtime, task: Guid) -> Result<()> {
        if rt.registry().task(task)?.is_message() {
            self.messages.push(task);
        } else {
            self.work.push(task);
        }
        Ok(())
    }

    pub(crate) fn take(&self, c: WorkerId) -> Option<Guid> {
        if self.message_mode.load(Ordering::SeqCst) {
            self.messages.steal(c)
        } else {
            self.work.steal(c)
        }
    }

    /// Round-robin choice over the worker tier for work-mode assignment.
    pub(crate) fn next_target(&self, id_begin: usize, n_workers: usize) -> WorkerId {
        let n = self.next_target.fetch_add(1, Ordering::SeqCst);
        WorkerId(id_begin + n % n_workers.max(1))
    }

    pub(crate) fn work_len(&self) -> usize {
        self.work.len()
    }

    pub(crate) fn messages_len(&self) -> usize {
        self.messages.len()
    }
}
