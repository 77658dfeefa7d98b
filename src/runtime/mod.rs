//! The runtime: registry, allocator, both scheduler tiers and the
//! carrier threads that drive them.
//!
//! Every operation takes an explicit [`WorkerCtx`] naming the worker it
//! runs on (or none, for calls from outside the runtime); the context
//! decides where newly-ready tasks are given. `tick_worker` and
//! `tick_controller` are single scheduling steps: the carrier threads
//! call them in a loop, and tests call them directly for deterministic
//! interleavings.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::datablock::Datablock;
use crate::depend;
use crate::error::{Result, RuntimeError};
use crate::event::{self, Event, EventKind, SingleKind};
use crate::memory::{system_allocator, Allocator};
use crate::registry::{Guid, Object, Payload, Registry};
use crate::scheduler::{ControllerScheduler, Tier, Worker, WorkerId, WorkerScheduler};
use crate::task::{self, Dep, MessageKind, Task, TaskCtx, TaskHandle, TaskOptions, TaskTemplate};

#[cfg(test)]
mod tests;

/// The worker on whose behalf an operation runs. `external()` marks
/// calls arriving from outside the carrier threads; their ready tasks go
/// straight to the controller tier.
#[derive(Debug, Clone, Copy)]
pub struct WorkerCtx {
    worker: Option<WorkerId>,
}

impl WorkerCtx {
    /// A call from outside the runtime's own threads.
    #[inline]
    pub fn external() -> Self {
        Self { worker: None }
    }

    #[inline]
    pub(crate) fn on(worker: WorkerId) -> Self {
        Self {
            worker: Some(worker),
        }
    }

    #[inline]
    pub(crate) fn worker(self) -> Option<WorkerId> {
        self.worker
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker-tier workers.
    pub num_workers: usize,
    /// Number of controller-tier workers.
    pub num_controllers: usize,
    /// Whether to start carrier threads. Disable to drive the runtime
    /// manually with `tick_worker`/`tick_controller`/`drain`.
    pub start_threads: bool,
    /// Sleep between scheduling attempts when a carrier finds no work.
    pub idle_timeout: Duration,
    /// Maximum simultaneous external users per datablock.
    pub datablock_user_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            num_workers: num_cpus,
            num_controllers: 1,
            start_threads: true,
            idle_timeout: Duration::from_millis(1),
            datablock_user_capacity: 64,
        }
    }
}

/// Runtime statistics.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    /// Tasks handed to the scheduler.
    pub tasks_scheduled: AtomicUsize,
    /// Tasks executed to completion.
    pub tasks_executed: AtomicUsize,
    /// Pick-work-up messages serviced by the controller tier.
    pub messages_handled: AtomicUsize,
    /// Tasks moved from shipping piles into the controller work pool.
    pub tasks_shipped: AtomicUsize,
    /// Controller-tier takes from its message and work pools.
    pub steal_attempts: AtomicUsize,
    /// Controller-tier takes that yielded a task.
    pub steal_successes: AtomicUsize,
}

impl RuntimeStats {
    #[inline]
    pub(crate) fn record_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn record_executed(&self) {
        self.tasks_executed.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn record_message(&self) {
        self.messages_handled.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn record_shipped(&self) {
        self.tasks_shipped.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn record_steal(&self, hit: bool) {
        self.steal_attempts.fetch_add(1, Ordering::SeqCst);
        if hit {
            self.steal_successes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct Runtime {
    config: RuntimeConfig,
    registry: Registry,
    allocator: Arc<dyn Allocator>,
    stats: RuntimeStats,
    worker_tier: WorkerScheduler,
    controller_tier: ControllerScheduler,
    running: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Runtime {
    /// Build a runtime and, unless configured otherwise, start its
    /// carrier threads.
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let registry = Registry::new();
        for id in 0..config.num_workers {
            registry.insert_with(|g| {
                Object::Worker(Arc::new(Worker::new(g, WorkerId(id), Tier::Worker)))
            });
        }
        for id in 0..config.num_controllers {
            registry.insert_with(|g| {
                Object::Worker(Arc::new(Worker::new(
                    g,
                    WorkerId(config.num_workers + id),
                    Tier::Controller,
                )))
            });
        }

        let worker_tier = WorkerScheduler::new(0, config.num_workers);
        let controller_tier = ControllerScheduler::new();
        let start_threads = config.start_threads;

        let rt = Arc::new(Self {
            config,
            registry,
            allocator: system_allocator(),
            stats: RuntimeStats::default(),
            worker_tier,
            controller_tier,
            running: AtomicBool::new(true),
            threads: Mutex::new(Vec::new()),
        });

        if start_threads {
            rt.spawn_carriers();
        }
        rt
    }

    fn spawn_carriers(self: &Arc<Self>) {
        let mut threads = self.threads.lock();
        for w in self.worker_ids() {
            let weak = Arc::downgrade(self);
            let handle = thread::Builder::new()
                .name(format!("weft-worker-{}", w.0))
                .spawn(move || carrier_loop(weak, w, Tier::Worker))
                .unwrap_or_else(|e| panic!("failed to spawn worker thread: {e}"));
            threads.push(handle);
        }
        for c in self.controller_ids() {
            let weak = Arc::downgrade(self);
            let handle = thread::Builder::new()
                .name(format!("weft-controller-{}", c.0))
                .spawn(move || carrier_loop(weak, c, Tier::Controller))
                .unwrap_or_else(|e| panic!("failed to spawn controller thread: {e}"));
            threads.push(handle);
        }
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// Worker-tier ids, in assignment order.
    pub fn worker_ids(&self) -> impl Iterator<Item = WorkerId> {
        (0..self.config.num_workers).map(WorkerId)
    }

    /// Controller-tier ids.
    pub fn controller_ids(&self) -> impl Iterator<Item = WorkerId> {
        let begin = self.config.num_workers;
        (begin..begin + self.config.num_controllers).map(WorkerId)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Create an event of the given kind.
    pub fn create_event(&self, kind: EventKind) -> Guid {
        self.registry.insert_with(|g| {
            let event = match kind {
                EventKind::Once => Event::new_single(g, SingleKind::Once),
                EventKind::Idem => Event::new_single(g, SingleKind::Idem),
                EventKind::Sticky => Event::new_single(g, SingleKind::Sticky),
                EventKind::Latch => Event::new_latch(g),
            };
            Object::Event(Arc::new(event))
        })
    }

    /// Satisfy an event on a slot.
    pub fn satisfy(&self, ctx: WorkerCtx, event: Guid, payload: Payload, slot: u32) -> Result<()> {
        let event = self.registry.event(event)?;
        event::satisfy(self, ctx, &event, payload, slot)
    }

    /// Non-blocking event read: `None` while unfired, `Some(payload)`
    /// once fired.
    pub fn event_get(&self, event: Guid) -> Result<Option<Payload>> {
        Ok(self.registry.event(event)?.get())
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Register a task template.
    pub fn create_template<F>(&self, depc: u32, body: F) -> Guid
    where
        F: Fn(&TaskCtx<'_>, &[u64], &[Dep]) -> Payload + Send + Sync + 'static,
    {
        self.registry.insert_with(|g| {
            Object::Template(Arc::new(TaskTemplate::new(g, depc, Box::new(body))))
        })
    }

    /// Create a task from a template. `deps` pre-wires dependence slots
    /// (`None` entries are bound later with [`Runtime::add_dependence`]);
    /// `scope` is the enclosing finish scope, if any.
    pub fn create_task(
        &self,
        ctx: WorkerCtx,
        template: Guid,
        params: &[u64],
        deps: &[Option<Guid>],
        opts: TaskOptions,
        scope: Option<Guid>,
    ) -> Result<TaskHandle> {
        task::create(self, ctx, template, params, deps, opts, scope)
    }

    /// Add the dependence `source -> dest` on `slot`.
    pub fn add_dependence(
        &self,
        ctx: WorkerCtx,
        source: Guid,
        dest: Guid,
        slot: u32,
    ) -> Result<()> {
        depend::register_dependence(self, ctx, source, dest, slot)
    }

    // ------------------------------------------------------------------
    // Datablocks
    // ------------------------------------------------------------------

    /// Allocate a zeroed datablock.
    pub fn create_datablock(&self, size: usize) -> Result<Guid> {
        let ptr = self.allocator.allocate(size)?;
        let allocator = self.allocator.clone();
        let capacity = self.config.datablock_user_capacity;
        Ok(self.registry.insert_with(|g| {
            Object::Datablock(Arc::new(Datablock::new(g, size, ptr, allocator, capacity)))
        }))
    }

    /// Acquire a datablock for `requester`; returns the backing pointer.
    pub fn datablock_acquire(
        &self,
        block: Guid,
        requester: Guid,
    ) -> Result<std::ptr::NonNull<u8>> {
        self.registry.datablock(block)?.acquire(requester, false)
    }

    /// Release `requester`'s hold on a datablock.
    pub fn datablock_release(&self, block: Guid, requester: Guid) -> Result<()> {
        self.registry
            .datablock(block)?
            .release(&self.registry, requester, false)
    }

    /// Request destruction of a datablock once all holds drain.
    pub fn datablock_free(&self, block: Guid, requester: Guid) -> Result<()> {
        self.registry
            .datablock(block)?
            .request_free(&self.registry, requester)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// One worker-tier scheduling step: pop one assigned task and execute
    /// it. Returns whether any work was done.
    pub fn tick_worker(&self, w: WorkerId) -> Result<bool> {
        if !self.worker_tier.contains(w) {
            return Err(RuntimeError::ProtocolViolation(
                "worker tick by a worker outside the tier",
            ));
        }
        match self.worker_tier.take(w) {
            Some(task) => {
                task::execute(self, WorkerCtx::on(w), task)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// One controller-tier scheduling step: service all pending messages,
    /// then assign one buffered task. Returns whether any work was done.
    pub fn tick_controller(&self, c: WorkerId) -> Result<bool> {
        if c.0 < self.config.num_workers
            || c.0 >= self.config.num_workers + self.config.num_controllers
        {
            return Err(RuntimeError::ProtocolViolation(
                "controller tick by a worker outside the tier",
            ));
        }
        let mut progress = false;

        self.controller_tier.set_message_mode(true);
        while let Some(message) = self.steal_tracked(c) {
            let (MessageKind::PickWorkUp, from) = self
                .registry
                .task(message)?
                .message()
                .ok_or(RuntimeError::ProtocolViolation(
                    "plain task in the message pool",
                ))?;
            while let Some(shipped) = self.worker_tier.steal_shipping(from)? {
                self.controller_tier.give(self, shipped)?;
                self.stats.record_shipped();
            }
            self.registry.release(message)?;
            self.stats.record_message();
            progress = true;
        }

        self.controller_tier.set_message_mode(false);
        if let Some(task) = self.steal_tracked(c) {
            let target = self
                .controller_tier
                .next_target(0, self.config.num_workers);
            self.worker_tier.push_assigned(target, task)?;
            progress = true;
        }
        Ok(progress)
    }

    /// Drive all workers and controllers until the runtime is quiescent.
    /// Returns the number of tasks executed. Intended for manually-driven
    /// runtimes (`start_threads: false`).
    pub fn drain(&self) -> Result<usize> {
        let mut executed = 0;
        loop {
            let mut progress = false;
            for c in self.controller_ids() {
                progress |= self.tick_controller(c)?;
            }
            for w in self.worker_ids() {
                if self.tick_worker(w)? {
                    executed += 1;
                    progress = true;
                }
            }
            if !progress {
                return Ok(executed);
            }
        }
    }

    /// Stop and join the carrier threads.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let current = thread::current().id();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            // A carrier must not join itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("carrier thread panicked during shutdown");
            }
        }
    }

    /// Controller-pool take with steal accounting.
    fn steal_tracked(&self, c: WorkerId) -> Option<Guid> {
        let hit = self.controller_tier.take(c);
        self.stats.record_steal(hit.is_some());
        hit
    }

    /// Route a ready task: a worker-tier producer gives through its tier,
    /// everyone else hands straight to the controller tier.
    pub(crate) fn give_ready(&self, ctx: WorkerCtx, task: Guid) -> Result<()> {
        match ctx.worker() {
            Some(w) if self.worker_tier.contains(w) => self.worker_tier.give(self, w, task),
            _ => self.controller_tier.give(self, task),
        }
    }

    /// Deliver a task (usually a message) to the controller tier.
    pub(crate) fn hand_out(&self, task: Guid) -> Result<()> {
        self.controller_tier.give(self, task)
    }

    #[cfg(test)]
    pub(crate) fn worker_tier(&self) -> &WorkerScheduler {
        &self.worker_tier
    }

    #[cfg(test)]
    pub(crate) fn controller_tier(&self) -> &ControllerScheduler {
        &self.controller_tier
    }

    pub(crate) fn new_message_task(&self, request: MessageKind, from: WorkerId) -> Guid {
        self.registry
            .insert_with(|g| Object::Task(Arc::new(Task::new_message(g, request, from))))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let current = thread::current().id();
        for handle in self.threads.get_mut().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

/// Carrier thread body. Holds only a weak handle so dropping the last
/// user-held `Arc<Runtime>` stops the loop.
fn carrier_loop(rt: Weak<Runtime>, id: WorkerId, tier: Tier) {
    tracing::debug!(worker = %id, ?tier, "carrier started");
    loop {
        let Some(rt) = rt.upgrade() else { break };
        if !rt.running.load(Ordering::SeqCst) {
            break;
        }
        let step = match tier {
            Tier::Worker => rt.tick_worker(id),
            Tier::Controller => rt.tick_controller(id),
        };
        match step {
            Ok(true) => {}
            Ok(false) => {
                let idle = rt.config.idle_timeout;
                drop(rt);
                thread::sleep(idle);
            }
            Err(e) => {
                tracing::error!(worker = %id, error = %e, "fatal runtime error");
                panic!("fatal runtime error on {id}: {e}");
            }
        }
    }
    tracing::debug!(worker = %id, "carrier stopped");
}
