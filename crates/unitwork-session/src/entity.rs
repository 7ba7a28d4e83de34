//! Entity arena.
//!
//! Every in-memory entity instance known to a session lives in one slot of
//! the [`EntityStore`]. An [`EntityHandle`] is the slot index and serves as
//! object identity: two handles are the same instance iff they are equal.
//! Associations between entities are stored as handles, so cyclic graphs need
//! no reference counting and traversals guard themselves with visited sets.

use crate::entry::{CollectionEntry, EntityEntry};
use crate::lazy::LazyAttributeInterceptor;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use unitwork_core::{EntityPersister, EntityShape, LazyState, PropertyKind, Value};

/// Object identity of an entity instance within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle(u32);

impl EntityHandle {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Current value of one property of an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Basic(Value),
    Reference(Option<EntityHandle>),
    Collection(LazyState<Vec<EntityHandle>>),
    /// Lazy basic property that has not been fetched.
    Unfetched,
}

impl StateValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            StateValue::Basic(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<EntityHandle> {
        match self {
            StateValue::Reference(r) => *r,
            _ => None,
        }
    }

    /// Elements of an initialized collection.
    pub fn elements(&self) -> Option<&[EntityHandle]> {
        match self {
            StateValue::Collection(LazyState::Loaded(elements)) => Some(elements),
            _ => None,
        }
    }

    /// Initial value of a property on a freshly instantiated entity.
    pub(crate) fn initial(kind: &PropertyKind) -> Self {
        match kind {
            PropertyKind::Basic => StateValue::Basic(Value::Null),
            PropertyKind::ToOne { .. } => StateValue::Reference(None),
            PropertyKind::Collection { .. } => StateValue::Collection(LazyState::Loaded(Vec::new())),
        }
    }
}

/// One entity instance: its type, identifier, property state and ledger.
pub struct ManagedEntity {
    pub(crate) persister: Arc<dyn EntityPersister>,
    pub(crate) id: Option<Value>,
    pub(crate) state: LazyState<Vec<StateValue>>,
    pub(crate) entry: Option<EntityEntry>,
    pub(crate) collections: BTreeMap<usize, CollectionEntry>,
    pub(crate) interceptor: Option<LazyAttributeInterceptor>,
    /// Was managed by this session once and has since left it.
    pub(crate) detached: bool,
}

impl fmt::Debug for ManagedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedEntity")
            .field("entity", &self.entity_name())
            .field("id", &self.id)
            .field("initialized", &self.is_initialized())
            .field("status", &self.entry.as_ref().map(EntityEntry::status))
            .field("detached", &self.detached)
            .finish_non_exhaustive()
    }
}

impl ManagedEntity {
    /// A transient instance with every property at its initial value.
    pub(crate) fn transient(persister: Arc<dyn EntityPersister>) -> Self {
        let state = persister
            .shape()
            .properties
            .iter()
            .map(|p| StateValue::initial(&p.kind))
            .collect();
        Self {
            persister,
            id: None,
            state: LazyState::Loaded(state),
            entry: None,
            collections: BTreeMap::new(),
            interceptor: None,
            detached: false,
        }
    }

    /// A placeholder whose identifier is known but whose state is not.
    pub(crate) fn placeholder(persister: Arc<dyn EntityPersister>, id: Value) -> Self {
        Self {
            persister,
            id: Some(id.clone()),
            state: LazyState::Unloaded(id),
            entry: None,
            collections: BTreeMap::new(),
            interceptor: None,
            detached: false,
        }
    }

    pub fn entity_name(&self) -> &'static str {
        self.persister.shape().name
    }

    pub fn shape(&self) -> &EntityShape {
        self.persister.shape()
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_loaded()
    }

    /// Property values, if the instance is initialized.
    pub fn values(&self) -> Option<&[StateValue]> {
        self.state.loaded().map(Vec::as_slice)
    }

    pub fn entry(&self) -> Option<&EntityEntry> {
        self.entry.as_ref()
    }

    pub fn collection_entry(&self, property: usize) -> Option<&CollectionEntry> {
        self.collections.get(&property)
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Never registered with a session and not a placeholder.
    pub fn is_transient(&self) -> bool {
        self.entry.is_none() && !self.detached && self.state.is_loaded()
    }

    pub(crate) fn values_mut(&mut self) -> Option<&mut Vec<StateValue>> {
        self.state.loaded_mut()
    }
}

/// Arena of every entity instance a session has seen.
///
/// Slots are never reused within a session, so a handle stays valid (if
/// possibly detached) for the session's whole lifetime.
#[derive(Debug, Default)]
pub(crate) struct EntityStore {
    slots: Vec<ManagedEntity>,
}

impl EntityStore {
    pub(crate) fn insert(&mut self, entity: ManagedEntity) -> EntityHandle {
        let handle = EntityHandle(self.slots.len() as u32);
        self.slots.push(entity);
        handle
    }

    pub(crate) fn get(&self, handle: EntityHandle) -> Option<&ManagedEntity> {
        self.slots.get(handle.index())
    }

    pub(crate) fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut ManagedEntity> {
        self.slots.get_mut(handle.index())
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = EntityHandle> + use<> {
        (0..self.slots.len() as u32).map(EntityHandle)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (EntityHandle, &ManagedEntity)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (EntityHandle(i as u32), slot))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (EntityHandle, &mut ManagedEntity)> {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(i, slot)| (EntityHandle(i as u32), slot))
    }
}
