//! Object registry: opaque identifiers for runtime objects.
//!
//! Every runtime object (task, event, datablock, worker, template) is
//! reachable only through a [`Guid`], a generation-tagged slot index.
//! Resolving a guid returns a typed [`Object`] handle or fails with
//! `UnknownIdentifier`; a released guid never resolves again, even after
//! its slot is reused, because reuse bumps the slot generation.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::datablock::Datablock;
use crate::error::{Result, RuntimeError};
use crate::event::Event;
use crate::scheduler::Worker;
use crate::task::{Task, TaskTemplate};


/// Opaque handle to a registered runtime object.
///
/// Packs `generation << 32 | (slot_index + 1)`; the raw value is never
/// zero, so `0` is free to encode "no guid" inside atomic words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid(u64);

impl Guid {
    #[inline]
    fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64 + 1))
    }

    /// Raw non-zero encoding, suitable for storage in an atomic word.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Decode a raw word; `0` means "no guid".
    #[inline]
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    #[inline]
    fn index(self) -> usize {
        ((self.0 & 0xFFFF_FFFF) - 1) as usize
    }

    #[inline]
    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

/// The payload carried on a dependency edge: the satisfying datablock,
/// or nothing (latches and pure control events carry no data).
pub type Payload = Option<Guid>;

/// Encode a payload for storage in an atomic word.
#[inline]
pub(crate) fn payload_to_raw(payload: Payload) -> u64 {
    payload.map_or(0, Guid::raw)
}

/// Decode a payload from an atomic word.
#[inline]
pub(crate) fn payload_from_raw(raw: u64) -> Payload {
    Guid::from_raw(raw)
}

/// Kind tag attached to every live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Task,
    Event,
    Datablock,
    Worker,
    Template,
}

/// A typed handle to a live object, cloned out of the registry.
#[derive(Clone)]
pub enum Object {
    Task(Arc<Task>),
    Event(Arc<Event>),
    Datablock(Arc<Datablock>),
    Worker(Arc<Worker>),
    Template(Arc<TaskTemplate>),
}

impl Object {
    /// The kind tag of this object.
    #[inline]
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Task(_) => ObjectKind::Task,
            Object::Event(_) => ObjectKind::Event,
            Object::Datablock(_) => ObjectKind::Datablock,
            Object::Worker(_) => ObjectKind::Worker,
            Object::Template(_) => ObjectKind::Template,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object::{:?}", self.kind())
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    obj: Option<Object>,
}

/// Registry mapping guids to live objects.
#[derive(Debug, Default)]
pub struct Registry {
    slots: RwLock<Vec<Slot>>,
    free: Mutex<Vec<u32>>,
}

impl Registry {
    /// Create an empty registry.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new object. The builder receives the guid that will
    /// name the object so it can be stored inside it.
    pub fn insert_with<F>(&self, build: F) -> Guid
    where
        F: FnOnce(Guid) -> Object,
    {
        let mut slots = self.slots.write();
        let index = match self.free.lock().pop() {
            Some(index) => index as usize,
            None => {
                slots.push(Slot {
                    generation: 0,
                    obj: None,
                });
                slots.len() - 1
            }
        };
        let guid = Guid::new(index as u32, slots[index].generation);
        slots[index].obj = Some(build(guid));
        guid
    }

    /// Resolve a guid to its live object.
    pub fn resolve(&self, guid: Guid) -> Result<Object> {
        let slots = self.slots.read();
        slots
            .get(guid.index())
            .filter(|slot| slot.generation == guid.generation())
            .and_then(|slot| slot.obj.clone())
            .ok_or(RuntimeError::UnknownIdentifier(guid))
    }

    /// Resolve only the kind tag of a guid.
    pub fn kind_of(&self, guid: Guid) -> Result<ObjectKind> {
        let slots = self.slots.read();
        slots
            .get(guid.index())
            .filter(|slot| slot.generation == guid.generation())
            .and_then(|slot| slot.obj.as_ref().map(Object::kind))
            .ok_or(RuntimeError::UnknownIdentifier(guid))
    }

    /// Release a guid. The slot is recycled with a bumped generation, so
    /// stale copies of the guid stop resolving immediately.
    pub fn release(&self, guid: Guid) -> Result<()> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(guid.index())
            .ok_or(RuntimeError::UnknownIdentifier(guid))?;
        if slot.generation != guid.generation() || slot.obj.is_none() {
            return Err(RuntimeError::UnknownIdentifier(guid));
        }
        slot.obj = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.lock().push(guid.index() as u32);
        Ok(())
    }

    /// Number of currently live objects.
    pub fn live_count(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|slot| slot.obj.is_some())
            .count()
    }

    /// Resolve a guid that must name an event.
    pub fn event(&self, guid: Guid) -> Result<Arc<Event>> {
        match self.resolve(guid)? {
            Object::Event(event) => Ok(event),
            _ => Err(RuntimeError::ProtocolViolation("expected an event guid")),
        }
    }

    /// Resolve a guid that must name a task.
    pub fn task(&self, guid: Guid) -> Result<Arc<Task>> {
        match self.resolve(guid)? {
            Object::Task(task) => Ok(task),
            _ => Err(RuntimeError::ProtocolViolation("expected a task guid")),
        }
    }

    /// Resolve a guid that must name a datablock.
    pub fn datablock(&self, guid: Guid) -> Result<Arc<Datablock>> {
        match self.resolve(guid)? {
            Object::Datablock(block) => Ok(block),
            _ => Err(RuntimeError::ProtocolViolation("expected a datablock guid")),
        }
    }

    /// Resolve a guid that must name a task template.
    pub fn template(&self, guid: Guid) -> Result<Arc<TaskTemplate>> {
        match self.resolve(guid)? {
            Object::Template(template) => Ok(template),
            _ => Err(RuntimeError::ProtocolViolation("expected a template guid")),
        }
    }

    /// Resolve a guid that must name a worker.
    pub fn worker(&self, guid: Guid) -> Result<Arc<Worker>> {
        match self.resolve(guid)? {
            Object::Worker(worker) => Ok(worker),
            _ => Err(RuntimeError::ProtocolViolation("expected a worker guid")),
        }
    }
}
