//! Tasks and task templates.
//!
//! A task is created against a template (dependence count + body), wired
//! into its finish scope, and then waits for its dependence slots. Slots
//! fire in order: the task registers on its slot-0 signaler only, and
//! each delivered slot registers the next one. The slot array therefore
//! holds signaler guids ahead of the frontier and delivered payloads
//! behind it. When the last slot fires the task is handed to the
//! scheduler; execution consumes the slots, runs the body with the
//! dependence datablocks acquired, and destroys the task.

use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::datablock::Datablock;
use crate::depend::{register_dependence, register_waiter};
use crate::error::{Result, RuntimeError};
use crate::event::{self, Event, LATCH_DECR_SLOT};
use crate::registry::{payload_from_raw, payload_to_raw, Guid, Object, Payload};
use crate::runtime::{Runtime, WorkerCtx};
use crate::scheduler::WorkerId;


/// A task body: receives the execution context, the creation-time
/// parameters and the delivered dependences, and returns the payload
/// forwarded to the task's output event.
pub type TaskBody = dyn Fn(&TaskCtx<'_>, &[u64], &[Dep]) -> Payload + Send + Sync;

/// Reusable task shape: dependence count plus body.
pub struct TaskTemplate {
    guid: Guid,
    depc: u32,
    body: Box<TaskBody>,
}

impl TaskTemplate {
    pub(crate) fn new(guid: Guid, depc: u32, body: Box<TaskBody>) -> Self {
        Self { guid, depc, body }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn depc(&self) -> u32 {
        self.depc
    }
}

/// A dependence as delivered to a task body.
#[derive(Debug, Clone, Copy)]
pub struct Dep {
    guid: Payload,
    ptr: Option<NonNull<u8>>,
    size: usize,
}

impl Dep {
    /// The datablock satisfying this slot, if any.
    #[inline]
    pub fn guid(&self) -> Payload {
        self.guid
    }

    /// Backing storage of the datablock, acquired for the duration of the
    /// body.
    #[inline]
    pub fn ptr(&self) -> Option<NonNull<u8>> {
        self.ptr
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Execution context handed to a task body.
pub struct TaskCtx<'a> {
    rt: &'a Runtime,
    ctx: WorkerCtx,
    task: Guid,
    scope: Option<Guid>,
}

impl TaskCtx<'_> {
    /// The runtime this task runs on.
    #[inline]
    pub fn runtime(&self) -> &Runtime {
        self.rt
    }

    /// The guid of the currently executing task.
    #[inline]
    pub fn guid(&self) -> Guid {
        self.task
    }

    /// The enclosing finish scope, if any.
    #[inline]
    pub fn scope(&self) -> Option<Guid> {
        self.scope
    }

    /// Create a child task inside this task's finish scope.
    pub fn create_task(
        &self,
        template: Guid,
        params: &[u64],
        deps: &[Option<Guid>],
        opts: TaskOptions,
    ) -> Result<TaskHandle> {
        create(self.rt, self.ctx, template, params, deps, opts, self.scope)
    }

    /// Satisfy an event on behalf of this task.
    pub fn satisfy(&self, event: Guid, payload: Payload, slot: u32) -> Result<()> {
        self.rt.satisfy(self.ctx, event, payload, slot)
    }

    /// Add a dependence on behalf of this task.
    pub fn add_dependence(&self, source: Guid, dest: Guid, slot: u32) -> Result<()> {
        self.rt.add_dependence(self.ctx, source, dest, slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    /// A worker buffered work in its shipping pile and wants the
    /// controller to pick it up.
    PickWorkUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Plain,
    Message { request: MessageKind, from: WorkerId },
}

/// Options for task creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOptions {
    /// Open a finish scope owned by this task.
    pub finish: bool,
    /// Create a sticky output event satisfied with the task's return
    /// payload (or the scope's, for finish tasks).
    pub output_event: bool,
}

/// The guids produced by task creation.
#[derive(Debug, Clone, Copy)]
pub struct TaskHandle {
    pub task: Guid,
    pub output_event: Option<Guid>,
}

/// Dependence slot storage. `Pending` slots hold signaler guids ahead of
/// the frontier and raw payloads behind it; `Consumed` marks a task whose
/// slots were taken by execution.
enum SignalerState {
    Pending(Box<[u64]>),
    Consumed,
}

pub struct Task {
    guid: Guid,
    kind: TaskKind,
    template: Option<Guid>,
    params: Vec<u64>,
    output_event: Option<Guid>,
    signalers: Mutex<SignalerState>,
    arrived: AtomicU32,
    depc: u32,
    /// Raw guid of the enclosing finish latch; 0 when outside any scope.
    finish_scope: AtomicU64,
}

impl Task {
    fn new_plain(guid: Guid, template: Guid, depc: u32, params: Vec<u64>, output_event: Option<Guid>) -> Self {
        Self {
            guid,
            kind: TaskKind::Plain,
            template: Some(template),
            params,
            output_event,
            signalers: Mutex::new(SignalerState::Pending(vec![0u64; depc as usize].into())),
            arrived: AtomicU32::new(0),
            depc,
            finish_scope: AtomicU64::new(0),
        }
    }

    pub(crate) fn new_message(guid: Guid, request: MessageKind, from: WorkerId) -> Self {
        Self {
            guid,
            kind: TaskKind::Message { request, from },
            template: None,
            params: Vec::new(),
            output_event: None,
            signalers: Mutex::new(SignalerState::Pending(Box::new([]))),
            arrived: AtomicU32::new(0),
            depc: 0,
            finish_scope: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn depc(&self) -> u32 {
        self.depc
    }

    #[inline]
    pub(crate) fn is_message(&self) -> bool {
        matches!(self.kind, TaskKind::Message { .. })
    }

    pub(crate) fn message(&self) -> Option<(MessageKind, WorkerId)> {
        match self.kind {
            TaskKind::Message { request, from } => Some((request, from)),
            TaskKind::Plain => None,
        }
    }

    pub(crate) fn finish_scope(&self) -> Option<Guid> {
        Guid::from_raw(self.finish_scope.load(Ordering::SeqCst))
    }

    pub(crate) fn set_finish_scope(&self, scope: Guid) {
        self.finish_scope.store(scope.raw(), Ordering::SeqCst);
    }

    pub(crate) fn clear_finish_scope(&self) {
        self.finish_scope.store(0, Ordering::SeqCst);
    }

    /// Bind `signaler` to a dependence slot. Each slot is bound once.
    pub(crate) fn set_signaler(&self, slot: u32, signaler: Guid) -> Result<()> {
        let mut state = self.signalers.lock();
        match &mut *state {
            SignalerState::Pending(slots) => {
                let cell = slots
                    .get_mut(slot as usize)
                    .ok_or(RuntimeError::ProtocolViolation("dependence slot out of range"))?;
                if *cell != 0 {
                    return Err(RuntimeError::ProtocolViolation(
                        "dependence slot already bound",
                    ));
                }
                *cell = signaler.raw();
                Ok(())
            }
            SignalerState::Consumed => Err(RuntimeError::ProtocolViolation(
                "dependence added to an executed task",
            )),
        }
    }

    /// Count one bound slot; returns the new arrival total.
    pub(crate) fn record_arrival(&self) -> u32 {
        self.arrived.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("guid", &self.guid)
            .field("kind", &self.kind)
            .field("depc", &self.depc)
            .finish_non_exhaustive()
    }
}

/// Create a task, wire its finish scope, and register its dependences.
///
/// `deps` is either empty (all dependences added later) or one entry per
/// slot, with `None` marking slots to be bound later via
/// `add_dependence`. Zero-dependence tasks are handed to the scheduler
/// immediately.
pub(crate) fn create(
    rt: &Runtime,
    ctx: WorkerCtx,
    template: Guid,
    params: &[u64],
    deps: &[Option<Guid>],
    opts: TaskOptions,
    scope: Option<Guid>,
) -> Result<TaskHandle> {
    let tpl = rt.registry().template(template)?;
    let depc = tpl.depc();
    if !deps.is_empty() && deps.len() != depc as usize {
        return Err(RuntimeError::ProtocolViolation(
            "dependence list does not match the template arity",
        ));
    }

    let output_event = if opts.output_event {
        let guid = rt.registry().insert_with(|g| {
            Object::Event(Arc::new(Event::new_single(g, event::SingleKind::Sticky)))
        });
        Some(guid)
    } else {
        None
    };

    let task_guid = rt.registry().insert_with(|g| {
        Object::Task(Arc::new(Task::new_plain(
            g,
            template,
            depc,
            params.to_vec(),
            output_event,
        )))
    });
    let task = rt.registry().task(task_guid)?;

    if opts.finish {
        // The scope latch forwards the return payload to the output
        // event and checks out of the enclosing scope when it drains.
        let output = output_event.map(|g| event::waiter::Waiter { target: g, slot: 0 });
        if let Some(parent) = scope {
            let parent_event = rt.registry().event(parent)?;
            event::finish_latch_checkin(&parent_event)?;
        }
        let latch_guid = rt.registry().insert_with(|g| {
            Object::Event(Arc::new(Event::new_finish_latch(g, task_guid, output, scope)))
        });
        let latch_event = rt.registry().event(latch_guid)?;
        event::finish_latch_checkin(&latch_event)?;
        task.set_finish_scope(latch_guid);
    } else if let Some(parent) = scope {
        let parent_event = rt.registry().event(parent)?;
        event::finish_latch_checkin(&parent_event)?;
        task.set_finish_scope(parent);
    }

    tracing::debug!(task = %task_guid, %template, depc, finish = opts.finish, "task created");

    if depc == 0 {
        try_schedule(rt, ctx, &task)?;
    } else {
        for (slot, dep) in deps.iter().enumerate() {
            if let Some(source) = dep {
                register_dependence(rt, ctx, *source, task_guid, slot as u32)?;
            }
        }
    }

    Ok(TaskHandle {
        task: task_guid,
        output_event,
    })
}

/// Bootstrap a fully-wired task: zero-dependence tasks schedule
/// immediately, otherwise the task registers on its slot-0 signaler only
/// and the frontier advances one slot per delivery.
pub(crate) fn try_schedule(rt: &Runtime, ctx: WorkerCtx, task: &Arc<Task>) -> Result<()> {
    if task.depc == 0 {
        return schedule(rt, ctx, task.guid);
    }
    let first = {
        let state = task.signalers.lock();
        match &*state {
            SignalerState::Pending(slots) => Guid::from_raw(slots[0]).ok_or(
                RuntimeError::ProtocolViolation("dependence slot 0 has no signaler"),
            )?,
            SignalerState::Consumed => {
                return Err(RuntimeError::ProtocolViolation(
                    "bootstrap of an executed task",
                ))
            }
        }
    };
    register_waiter(rt, ctx, first, task.guid, 0)
}

/// Deliver a dependence payload to a slot and advance the frontier.
pub(crate) fn on_signal(
    rt: &Runtime,
    ctx: WorkerCtx,
    task: &Arc<Task>,
    payload: Payload,
    slot: u32,
) -> Result<()> {
    let next = {
        let mut state = task.signalers.lock();
        match &mut *state {
            SignalerState::Consumed => {
                return Err(RuntimeError::ProtocolViolation(
                    "signal delivered to an executed task",
                ))
            }
            SignalerState::Pending(slots) => {
                let cell = slots
                    .get_mut(slot as usize)
                    .ok_or(RuntimeError::ProtocolViolation("dependence slot out of range"))?;
                *cell = payload_to_raw(payload);
                if slot + 1 == task.depc {
                    None
                } else {
                    Some(Guid::from_raw(slots[slot as usize + 1]).ok_or(
                        RuntimeError::ProtocolViolation("next dependence slot has no signaler"),
                    )?)
                }
            }
        }
    };
    tracing::trace!(task = %task.guid, slot, "dependence delivered");
    match next {
        None => schedule(rt, ctx, task.guid),
        Some(target) => register_waiter(rt, ctx, target, task.guid, slot + 1),
    }
}

/// Hand a ready task to the scheduler.
pub(crate) fn schedule(rt: &Runtime, ctx: WorkerCtx, task: Guid) -> Result<()> {
    tracing::debug!(%task, "task ready");
    rt.stats().record_scheduled();
    rt.give_ready(ctx, task)
}

/// Run a ready task to completion and destroy it.
pub(crate) fn execute(rt: &Runtime, ctx: WorkerCtx, task_guid: Guid) -> Result<Payload> {
    let task = rt.registry().task(task_guid)?;
    if task.is_message() {
        return Err(RuntimeError::ProtocolViolation(
            "message tasks are serviced by the controller tier",
        ));
    }
    let slots = {
        let mut state = task.signalers.lock();
        match mem::replace(&mut *state, SignalerState::Consumed) {
            SignalerState::Pending(slots) => slots,
            SignalerState::Consumed => {
                return Err(RuntimeError::ProtocolViolation(
                    "task has already been executed",
                ))
            }
        }
    };
    let template_guid = task
        .template
        .ok_or(RuntimeError::ProtocolViolation("task without a template"))?;
    let template = rt.registry().template(template_guid)?;

    // Hold the dependence datablocks for the duration of the body. The
    // Arcs stay live across a free requested from inside the body.
    let mut blocks: Vec<Option<Arc<Datablock>>> = Vec::with_capacity(slots.len());
    let mut deps: Vec<Dep> = Vec::with_capacity(slots.len());
    for &raw in slots.iter() {
        match payload_from_raw(raw) {
            Some(db_guid) => {
                let block = rt.registry().datablock(db_guid)?;
                // A free may already be pending on the block; the body
                // then sees the dependence without backing storage.
                match block.acquire(task_guid, true) {
                    Ok(ptr) => {
                        deps.push(Dep {
                            guid: Some(db_guid),
                            ptr: Some(ptr),
                            size: block.size(),
                        });
                        blocks.push(Some(block));
                    }
                    Err(RuntimeError::AccessDenied) => {
                        deps.push(Dep {
                            guid: Some(db_guid),
                            ptr: None,
                            size: block.size(),
                        });
                        blocks.push(None);
                    }
                    Err(e) => return Err(e),
                }
            }
            None => {
                deps.push(Dep {
                    guid: None,
                    ptr: None,
                    size: 0,
                });
                blocks.push(None);
            }
        }
    }

    let scope = task.finish_scope();
    tracing::debug!(task = %task_guid, "task executing");
    rt.stats().record_executed();
    let body_ctx = TaskCtx {
        rt,
        ctx,
        task: task_guid,
        scope,
    };
    let ret = (template.body)(&body_ctx, &task.params, &deps);

    for block in blocks.into_iter().flatten() {
        block.release(rt.registry(), task_guid, true)?;
    }

    let mut owns_scope = false;
    if let Some(scope_guid) = scope {
        let scope_event = rt.registry().event(scope_guid)?;
        if scope_event.finish_latch_owner() == Some(task_guid) {
            owns_scope = true;
            scope_event.set_finish_return(ret);
        }
        event::satisfy(rt, ctx, &scope_event, None, LATCH_DECR_SLOT)?;
    }

    if !owns_scope {
        if let Some(out) = task.output_event {
            let out_event = rt.registry().event(out)?;
            event::satisfy(rt, ctx, &out_event, ret, 0)?;
        }
    }

    rt.registry().release(task_guid)?;
    Ok(ret)
}
