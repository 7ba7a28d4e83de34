//! Unit of work for unitwork.
//!
//! `unitwork-session` is the **persistence-context layer**. It tracks which
//! in-memory entity instances stand for which stored rows, detects what
//! changed since they were read, and turns those changes into an ordered
//! sequence of writes executed through a [`Connection`].
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per root entity and identifier.
//! - **Entry ledger**: status, snapshot, version and lock mode per managed instance.
//! - **Dirty checking**: per-property comparison against the snapshot.
//! - **Cascades**: lifecycle operations propagate along associations.
//! - **Action queue**: pending writes, ordered by foreign keys at flush time.
//! - **Lazy loading**: placeholders, lazy properties and collections load on access.
//!
//! # Design
//!
//! - **Arena identity**: entity instances live in a per-session arena and are
//!   addressed by [`EntityHandle`]. Associations hold handles, so cyclic
//!   graphs need no shared ownership.
//! - **Explicit metadata**: entity shapes are static property-index tables
//!   (see [`unitwork_core::EntityShape`]); nothing is looked up by reflection.
//! - **Cancel-correct**: every storage call takes a `Cx` and returns an
//!   `Outcome`; no lock is held across an await.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::builder()
//!     .entity(Arc::new(WidgetPersister::new()))
//!     .build()?;
//! let mut session = factory.open_session(connection)?;
//!
//! let widget = session.instantiate("Widget")?;
//! session.set_value(widget, 0, "bolt")?;
//! session.persist(&cx, widget).await;
//!
//! // INSERT runs here, then the transaction commits
//! session.commit(&cx).await;
//! ```

macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            ::asupersync::Outcome::Ok(v) => v,
            ::asupersync::Outcome::Err(e) => return ::asupersync::Outcome::Err(e),
            ::asupersync::Outcome::Cancelled(r) => return ::asupersync::Outcome::Cancelled(r),
            ::asupersync::Outcome::Panicked(p) => return ::asupersync::Outcome::Panicked(p),
        }
    };
}

macro_rules! try_result {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return ::asupersync::Outcome::Err(e),
        }
    };
}

pub mod action_queue;
pub mod cascade;
pub mod change_tracker;
pub mod entity;
pub mod entry;
pub mod events;
pub mod factory;
pub mod flush;
pub mod identity_map;
pub mod lazy;
pub mod natural_id;
pub mod proxy;

#[cfg(test)]
mod test_support;

pub use action_queue::{
    Action, ActionQueue, ActionState, Dependency, DependencyGraph, OrderOptions, PendingCounts,
    PlannedAction, Purpose,
};
pub use change_tracker::{compute_dirty_properties, is_property_dirty, snapshot_state};
pub use entity::{EntityHandle, ManagedEntity, StateValue};
pub use entry::{CollectionEntry, CollectionRole, EntityEntry, Status};
pub use events::{EntityEvent, EntityListener, SessionEvent, SessionEventCallbacks, Veto};
pub use factory::{SessionFactory, SessionFactoryBuilder, SessionFactoryOptions};
pub use flush::FlushSummary;
pub use identity_map::{EntityKey, IdentityMap};
pub use lazy::{LazyAccess, LazyAttributeInterceptor};
pub use natural_id::NaturalIdResolutions;

use crate::cascade::cascade;
use crate::entity::EntityStore;
use crate::proxy::FetchTask;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use unitwork_core::{
    ActionKind, CascadeAction, Connection, EntityShape, Error, IdGeneration, LazyState, LockMode,
    PropertyInfo, PropertyKind, Result, StaleStateError, Value,
};

// ============================================================================
// Configuration
// ============================================================================

/// When the session flushes without being asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Flush before commit and before natural-id lookups that hit storage.
    #[default]
    Auto,
    /// Flush only before commit.
    Commit,
    /// Never flush implicitly.
    Manual,
    /// Flush before every storage read issued by the session.
    Always,
}

/// Per-session settings, initialized from the factory options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub flush_mode: FlushMode,
    /// Begin a transaction implicitly on the first flush.
    pub auto_begin: bool,
    /// Entities loaded by this session start read-only.
    pub default_read_only: bool,
    /// Maximum statements per batch. `0` or `1` disables batching.
    pub jdbc_batch_size: usize,
    pub order: OrderOptions,
}

impl SessionConfig {
    pub fn from_options(options: &SessionFactoryOptions) -> Self {
        Self {
            flush_mode: options.default_flush_mode,
            auto_begin: options.auto_begin,
            default_read_only: options.default_read_only,
            jdbc_batch_size: options.jdbc_batch_size,
            order: OrderOptions {
                order_inserts: options.order_inserts,
                order_updates: options.order_updates,
            },
        }
    }

    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    #[must_use]
    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    #[must_use]
    pub fn default_read_only(mut self, value: bool) -> Self {
        self.default_read_only = value;
        self
    }

    #[must_use]
    pub fn jdbc_batch_size(mut self, size: usize) -> Self {
        self.jdbc_batch_size = size;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_options(&SessionFactoryOptions::default())
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub(crate) flushes: u64,
    pub(crate) loads: u64,
    pub(crate) lazy_loads: u64,
    pub(crate) statements: u64,
    pub(crate) batches: u64,
}

/// Snapshot of a session's bookkeeping, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Instances with an entry that is not deleted.
    pub managed: usize,
    /// Registered, uninitialized placeholders.
    pub placeholders: usize,
    pub collections: usize,
    pub pending: PendingCounts,
    pub flushes: u64,
    pub loads: u64,
    pub lazy_loads: u64,
    pub statements: u64,
    pub batches: u64,
}

// ============================================================================
// Session
// ============================================================================

/// One unit of work.
///
/// A session owns its identity map, entry ledger and action queue outright;
/// nothing in it is shared with other sessions. It is driven by one task at
/// a time through `&mut self`.
pub struct Session<C: Connection> {
    factory: Arc<SessionFactory>,
    connection: C,
    config: SessionConfig,
    store: EntityStore,
    identity_map: IdentityMap,
    queue: ActionQueue,
    natural_ids: NaturalIdResolutions,
    /// Rows inserted by this session in the current transaction.
    inserted_keys: HashSet<EntityKey>,
    callbacks: SessionEventCallbacks,
    in_transaction: bool,
    closed: bool,
    connected: bool,
    flush_failed: bool,
    counters: Counters,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("entities", &self.store.len())
            .field("identity_map", &self.identity_map.len())
            .field("pending", &self.queue.len())
            .field("in_transaction", &self.in_transaction)
            .field("closed", &self.closed)
            .field("flush_failed", &self.flush_failed)
            .finish_non_exhaustive()
    }
}

fn unknown_handle(handle: EntityHandle) -> Error {
    Error::InvalidOperation(format!("unknown entity handle {handle}"))
}

fn not_initialized(entity: &str, handle: EntityHandle) -> Error {
    Error::InvalidOperation(format!(
        "{entity} {handle} is not initialized; resolve it first"
    ))
}

impl<C: Connection> Session<C> {
    pub(crate) fn new(factory: Arc<SessionFactory>, connection: C) -> Self {
        let config = SessionConfig::from_options(factory.options());
        tracing::debug!(flush_mode = ?config.flush_mode, "Opening session");
        Self {
            factory,
            connection,
            config,
            store: EntityStore::default(),
            identity_map: IdentityMap::new(),
            queue: ActionQueue::new(),
            natural_ids: NaturalIdResolutions::new(),
            inserted_keys: HashSet::new(),
            callbacks: SessionEventCallbacks::default(),
            in_transaction: false,
            closed: false,
            connected: true,
            flush_failed: false,
            counters: Counters::default(),
        }
    }

    /// Replace the settings inherited from the factory.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_flush_mode(&mut self, mode: FlushMode) {
        self.config.flush_mode = mode;
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// A flush failed; only [`Session::rollback`] and [`Session::close`] are allowed.
    pub fn is_flush_failed(&self) -> bool {
        self.flush_failed
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn action_queue(&self) -> &ActionQueue {
        &self.queue
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit (after flush).
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.after_commit.push(Box::new(f));
    }

    /// Register a callback to run after rollback.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Guards and internal access
    // ========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.flush_failed {
            return Err(Error::FlushFailed);
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.connected {
            return Err(Error::InvalidOperation(
                "session is disconnected".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn slot(&self, handle: EntityHandle) -> Result<&ManagedEntity> {
        self.store.get(handle).ok_or_else(|| unknown_handle(handle))
    }

    pub(crate) fn slot_mut(&mut self, handle: EntityHandle) -> Result<&mut ManagedEntity> {
        self.store.get_mut(handle).ok_or_else(|| unknown_handle(handle))
    }

    pub(crate) fn property_info(
        &self,
        handle: EntityHandle,
        index: usize,
    ) -> Result<&'static PropertyInfo> {
        let slot = self.slot(handle)?;
        let properties: &'static [PropertyInfo] = slot.shape().properties;
        properties.get(index).ok_or_else(|| {
            Error::InvalidOperation(format!("{} has no property {index}", slot.entity_name()))
        })
    }

    /// Column value of one property: associations become the target's identifier.
    pub(crate) fn column_value(&self, value: &StateValue) -> Value {
        match value {
            StateValue::Basic(v) => v.clone(),
            StateValue::Reference(Some(target)) => self
                .store
                .get(*target)
                .and_then(|slot| slot.id.clone())
                .unwrap_or(Value::Null),
            StateValue::Reference(None) | StateValue::Collection(_) | StateValue::Unfetched => {
                Value::Null
            }
        }
    }

    /// Column values of a whole state, one per property.
    pub(crate) fn flatten(&self, state: &[StateValue]) -> Vec<Value> {
        state.iter().map(|v| self.column_value(v)).collect()
    }

    // ========================================================================
    // Instances and state
    // ========================================================================

    /// Create a transient instance of `entity`.
    pub fn instantiate(&mut self, entity: &str) -> Result<EntityHandle> {
        self.ensure_open()?;
        let persister = Arc::clone(self.factory.persister(entity)?);
        Ok(self.store.insert(ManagedEntity::transient(persister)))
    }

    /// Set the identifier of a transient instance.
    pub fn set_id(&mut self, handle: EntityHandle, id: impl Into<Value>) -> Result<()> {
        self.ensure_open()?;
        let slot = self.slot_mut(handle)?;
        if !slot.is_transient() {
            return Err(Error::InvalidOperation(format!(
                "the identifier of {} {handle} can no longer change",
                slot.entity_name()
            )));
        }
        slot.id = Some(id.into());
        Ok(())
    }

    pub fn id(&self, handle: EntityHandle) -> Option<&Value> {
        self.store.get(handle).and_then(ManagedEntity::id)
    }

    pub fn entity(&self, handle: EntityHandle) -> Option<&ManagedEntity> {
        self.store.get(handle)
    }

    pub fn entry(&self, handle: EntityHandle) -> Option<&EntityEntry> {
        self.store.get(handle).and_then(ManagedEntity::entry)
    }

    pub fn status(&self, handle: EntityHandle) -> Option<Status> {
        self.entry(handle).map(EntityEntry::status)
    }

    /// Whether `handle` is managed by this session and not scheduled for deletion.
    pub fn contains(&self, handle: EntityHandle) -> bool {
        self.store.get(handle).is_some_and(|slot| {
            !slot.detached && slot.entry().is_some_and(|entry| !entry.is_removed())
        })
    }

    /// Instance registered for `entity` with identifier `id`, without loading.
    pub fn lookup(&self, entity: &str, id: impl Into<Value>) -> Option<EntityHandle> {
        let persister = self.factory.persister(entity).ok()?;
        self.identity_map
            .lookup(&EntityKey::of(persister.shape(), &id.into()))
    }

    pub fn property_index(&self, handle: EntityHandle, name: &str) -> Result<usize> {
        let slot = self.slot(handle)?;
        slot.shape().property_index(name).ok_or_else(|| {
            Error::InvalidOperation(format!("{} has no property '{name}'", slot.entity_name()))
        })
    }

    /// Current value of property `index`, without loading anything.
    ///
    /// See [`Session::property`] for the loading variant.
    pub fn value(&self, handle: EntityHandle, index: usize) -> Result<&StateValue> {
        let slot = self.slot(handle)?;
        let values = slot
            .values()
            .ok_or_else(|| not_initialized(slot.entity_name(), handle))?;
        values.get(index).ok_or_else(|| {
            Error::InvalidOperation(format!("{} has no property {index}", slot.entity_name()))
        })
    }

    /// Assign a basic property.
    pub fn set_value(
        &mut self,
        handle: EntityHandle,
        index: usize,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.ensure_open()?;
        let prop = self.property_info(handle, index)?;
        if !prop.is_basic() {
            return Err(Error::InvalidOperation(format!(
                "{} is an association",
                prop.name
            )));
        }
        let slot = self.slot_mut(handle)?;
        let entity = slot.entity_name();
        let values = slot
            .values_mut()
            .ok_or_else(|| not_initialized(entity, handle))?;
        values[index] = StateValue::Basic(value.into());
        if let Some(interceptor) = slot.interceptor.as_mut() {
            interceptor.mark_written(index);
        }
        Ok(())
    }

    fn check_target_type(
        &self,
        target: EntityHandle,
        expected: &'static str,
        property: &str,
    ) -> Result<()> {
        let shape = self.slot(target)?.shape();
        if shape.name == expected || shape.root == Some(expected) {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "{property} holds {expected} instances, not {}",
                shape.name
            )))
        }
    }

    /// Point a to-one association at `target`.
    pub fn set_reference(
        &mut self,
        handle: EntityHandle,
        index: usize,
        target: Option<EntityHandle>,
    ) -> Result<()> {
        self.ensure_open()?;
        let prop = self.property_info(handle, index)?;
        let PropertyKind::ToOne {
            target: expected, ..
        } = prop.kind
        else {
            return Err(Error::InvalidOperation(format!(
                "{} is not a to-one association",
                prop.name
            )));
        };
        if let Some(target) = target {
            self.check_target_type(target, expected, prop.name)?;
        }
        let slot = self.slot_mut(handle)?;
        let entity = slot.entity_name();
        let values = slot
            .values_mut()
            .ok_or_else(|| not_initialized(entity, handle))?;
        values[index] = StateValue::Reference(target);
        Ok(())
    }

    fn collection_property(
        &self,
        owner: EntityHandle,
        index: usize,
    ) -> Result<(&'static PropertyInfo, &'static str)> {
        let prop = self.property_info(owner, index)?;
        match prop.kind {
            PropertyKind::Collection { element, .. } => Ok((prop, element)),
            _ => Err(Error::InvalidOperation(format!(
                "{} is not a collection",
                prop.name
            ))),
        }
    }

    /// Add `element` to an initialized collection. Returns `false` if present.
    pub fn add_element(
        &mut self,
        owner: EntityHandle,
        index: usize,
        element: EntityHandle,
    ) -> Result<bool> {
        self.ensure_open()?;
        let (prop, expected) = self.collection_property(owner, index)?;
        self.check_target_type(element, expected, prop.name)?;
        let slot = self.slot_mut(owner)?;
        let elements = loaded_elements_mut(slot, index, prop.name)?;
        if elements.contains(&element) {
            return Ok(false);
        }
        elements.push(element);
        if let Some(entry) = slot.collections.get_mut(&index) {
            entry.dirty = true;
        }
        Ok(true)
    }

    /// Remove `element` from an initialized collection. Returns `false` if absent.
    pub fn remove_element(
        &mut self,
        owner: EntityHandle,
        index: usize,
        element: EntityHandle,
    ) -> Result<bool> {
        self.ensure_open()?;
        let (prop, _) = self.collection_property(owner, index)?;
        let slot = self.slot_mut(owner)?;
        let elements = loaded_elements_mut(slot, index, prop.name)?;
        let before = elements.len();
        elements.retain(|h| *h != element);
        if elements.len() == before {
            return Ok(false);
        }
        if let Some(entry) = slot.collections.get_mut(&index) {
            entry.dirty = true;
        }
        Ok(true)
    }

    /// Elements of an initialized collection, without loading.
    pub fn elements(&self, owner: EntityHandle, index: usize) -> Result<&[EntityHandle]> {
        let (prop, _) = self.collection_property(owner, index)?;
        self.value(owner, index)?.elements().ok_or_else(|| {
            Error::InvalidOperation(format!("collection {} is not initialized", prop.name))
        })
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Make a transient instance managed, cascading along persist associations.
    ///
    /// The insert is queued, not executed. Sequence identifiers are fetched
    /// here; identity identifiers are assigned when the insert executes.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn persist(&mut self, cx: &Cx, handle: EntityHandle) -> Outcome<(), Error> {
        try_result!(self.ensure_usable());
        let reached = cascade(
            &self.store,
            CascadeAction::Persist,
            handle,
            &mut HashSet::new(),
        );
        for target in reached {
            try_outcome!(self.persist_one(cx, target).await);
        }
        Outcome::Ok(())
    }

    /// Schedule the insert of one instance if it is transient.
    pub(crate) async fn persist_one(&mut self, cx: &Cx, handle: EntityHandle) -> Outcome<(), Error> {
        let slot = try_result!(self.slot(handle));
        if !slot.is_initialized() {
            // Placeholder for an existing row
            return Outcome::Ok(());
        }
        let persister = Arc::clone(&slot.persister);
        let shape = persister.shape();
        let preset_id = slot.id.clone().filter(|id| !id.is_null());

        if let Some(entry) = slot.entry() {
            return match entry.status() {
                Status::Managed | Status::ReadOnly => Outcome::Ok(()),
                Status::Deleted => Outcome::Err(Error::ObjectDeleted {
                    entity: shape.name.to_string(),
                    id: entry.id().cloned().unwrap_or(Value::Null),
                }),
                Status::Gone => Outcome::Err(Error::DetachedEntity {
                    entity: shape.name.to_string(),
                    id: entry.id().cloned(),
                    operation: "persist",
                }),
            };
        }
        if slot.detached {
            return Outcome::Err(Error::DetachedEntity {
                entity: shape.name.to_string(),
                id: preset_id,
                operation: "persist",
            });
        }

        let id = match shape.id_generation {
            IdGeneration::Assigned => match preset_id {
                Some(id) => Some(id),
                None => {
                    return Outcome::Err(Error::IdentifierGeneration {
                        entity: shape.name.to_string(),
                        message: "assigned identifier must be set before persist".to_string(),
                    });
                }
            },
            IdGeneration::Sequence | IdGeneration::Identity if preset_id.is_some() => {
                return Outcome::Err(Error::DetachedEntity {
                    entity: shape.name.to_string(),
                    id: preset_id,
                    operation: "persist",
                });
            }
            IdGeneration::Sequence => {
                let Some(statement) = persister.next_id_statement() else {
                    return Outcome::Err(Error::IdentifierGeneration {
                        entity: shape.name.to_string(),
                        message: "persister provides no sequence statement".to_string(),
                    });
                };
                self.counters.statements += 1;
                let row = try_outcome!(self.connection.query_one(cx, &statement).await);
                match row.map(|r| r.first()).filter(|id| !id.is_null()) {
                    Some(id) => Some(id),
                    None => {
                        return Outcome::Err(Error::IdentifierGeneration {
                            entity: shape.name.to_string(),
                            message: "sequence returned no value".to_string(),
                        });
                    }
                }
            }
            IdGeneration::Identity => None,
        };

        if let Some(id) = &id {
            try_result!(self.identity_map.register(EntityKey::of(shape, id), handle));
        }

        let slot = try_result!(self.slot_mut(handle));
        slot.id.clone_from(&id);
        let version = match (shape.version, slot.values_mut()) {
            (Some(index), Some(values)) => {
                let current = values[index].as_value().cloned().unwrap_or(Value::Null);
                let seeded = if current.is_null() {
                    current.next_version()
                } else {
                    Some(current)
                };
                if let Some(seeded) = &seeded {
                    values[index] = StateValue::Basic(seeded.clone());
                }
                seeded
            }
            _ => None,
        };
        slot.entry = Some(EntityEntry::pending_insert(shape.name, id.clone(), version));
        for (index, prop) in shape.associations() {
            if prop.is_collection() {
                let role = CollectionRole {
                    entity: shape.name,
                    property: prop.name,
                };
                slot.collections
                    .insert(index, CollectionEntry::pending(role, id.clone()));
            }
        }

        self.queue.enqueue(Action::insert(handle, shape.name));
        tracing::debug!(
            entity = shape.name,
            handle = %handle,
            id = ?id,
            "Scheduled insert"
        );
        Outcome::Ok(())
    }

    /// Schedule a managed instance for deletion, cascading along delete associations.
    ///
    /// Placeholders are loaded first. Collections that cascade deletion are
    /// initialized so their elements can be deleted too. Removing an instance
    /// whose insert has not executed yet just drops the insert.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn remove(&mut self, cx: &Cx, handle: EntityHandle) -> Outcome<(), Error> {
        try_result!(self.ensure_usable());
        let slot = try_result!(self.slot(handle));
        if !slot.is_initialized() {
            try_outcome!(self.resolve(cx, handle).await);
        }
        let slot = try_result!(self.slot(handle));
        let gone = slot.entry().is_some_and(|e| e.status() == Status::Gone);
        if slot.detached || gone {
            return Outcome::Err(Error::DetachedEntity {
                entity: slot.entity_name().to_string(),
                id: slot.id.clone(),
                operation: "remove",
            });
        }
        if slot.entry().is_none() {
            tracing::trace!(handle = %handle, "Ignoring remove of a transient instance");
            return Outcome::Ok(());
        }
        self.cascade_delete(cx, handle, false).await
    }

    pub(crate) async fn cascade_delete(
        &mut self,
        cx: &Cx,
        root: EntityHandle,
        orphan: bool,
    ) -> Outcome<(), Error> {
        loop {
            let reached = cascade(
                &self.store,
                CascadeAction::Delete,
                root,
                &mut HashSet::new(),
            );
            let mut loads = Vec::new();
            for &handle in &reached {
                let Some(slot) = self.store.get(handle) else {
                    continue;
                };
                match slot.values() {
                    None if !slot.detached => loads.push(FetchTask::Entity(handle)),
                    None => {}
                    Some(values) => {
                        for (index, prop) in slot.shape().associations() {
                            if prop.is_collection()
                                && prop.cascade_style().includes(CascadeAction::Delete)
                                && matches!(
                                    values.get(index),
                                    Some(StateValue::Collection(LazyState::Unloaded(_)))
                                )
                            {
                                loads.push(FetchTask::Collection(handle, index));
                            }
                        }
                    }
                }
            }

            if loads.is_empty() {
                for handle in reached {
                    try_result!(self.delete_one(handle, orphan));
                }
                return Outcome::Ok(());
            }
            for task in loads {
                match task {
                    FetchTask::Entity(handle) => {
                        try_outcome!(self.resolve(cx, handle).await);
                    }
                    FetchTask::Collection(handle, index) => {
                        try_outcome!(self.initialize_collection(cx, handle, index).await);
                    }
                }
            }
        }
    }

    fn delete_one(&mut self, handle: EntityHandle, orphan: bool) -> Result<()> {
        let Some(slot) = self.store.get_mut(handle) else {
            return Ok(());
        };
        let entity = slot.entity_name();
        let Some(entry) = slot.entry.as_mut() else {
            return Ok(());
        };
        if entry.is_removed() {
            return Ok(());
        }
        if !entry.exists_in_database() {
            tracing::debug!(
                entity,
                handle = %handle,
                "Removed before its insert executed; dropping the insert"
            );
            self.make_transient(handle);
            return Ok(());
        }
        entry.transition(Status::Deleted)?;
        self.queue.unschedule(ActionKind::Update, handle);
        self.queue.enqueue(Action::delete(handle, entity, orphan));
        tracing::debug!(entity, handle = %handle, orphan, "Scheduled delete");
        Ok(())
    }

    /// Forget an instance whose row was never written.
    pub(crate) fn make_transient(&mut self, handle: EntityHandle) {
        self.queue.unschedule_all(handle);
        let Some(slot) = self.store.get_mut(handle) else {
            return;
        };
        if let Some(id) = slot.id.clone() {
            let key = EntityKey::of(slot.shape(), &id);
            if self.identity_map.lookup(&key) == Some(handle) {
                self.identity_map.evict(&key);
            }
        }
        if slot.shape().id_generation != IdGeneration::Assigned {
            slot.id = None;
        }
        slot.entry = None;
        slot.collections.clear();
    }

    /// Copy the state of a transient or detached instance onto its managed
    /// counterpart, loading or creating that counterpart as needed.
    ///
    /// Cascades along merge associations. Returns the managed instance; the
    /// source is left untouched.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn merge(&mut self, cx: &Cx, source: EntityHandle) -> Outcome<EntityHandle, Error> {
        try_result!(self.ensure_usable());
        try_result!(self.ensure_connected());
        let reached = cascade(
            &self.store,
            CascadeAction::Merge,
            source,
            &mut HashSet::new(),
        );

        let mut mapping: HashMap<EntityHandle, EntityHandle> = HashMap::new();
        let mut created = Vec::new();
        for &from in &reached {
            let target = try_outcome!(self.merge_target(cx, from, &mut created).await);
            mapping.insert(from, target);
        }
        for (&from, &to) in &mapping {
            if to != from {
                try_result!(self.check_merge_version(from, to));
            }
        }
        for &from in &reached {
            let to = mapping.get(&from).copied().unwrap_or(from);
            if to != from {
                try_outcome!(self.copy_state(cx, from, to, &mapping).await);
            }
        }
        for handle in created {
            try_outcome!(self.persist_one(cx, handle).await);
        }
        Outcome::Ok(mapping.get(&source).copied().unwrap_or(source))
    }

    async fn merge_target(
        &mut self,
        cx: &Cx,
        from: EntityHandle,
        created: &mut Vec<EntityHandle>,
    ) -> Outcome<EntityHandle, Error> {
        let slot = try_result!(self.slot(from));
        let entity = slot.entity_name();
        let generation = slot.shape().id_generation;
        let id = slot.id.clone().filter(|id| !id.is_null());

        if !slot.is_initialized() {
            return match id {
                Some(id) if slot.detached => Outcome::Ok(try_result!(self.reference(entity, id))),
                _ => Outcome::Ok(from),
            };
        }
        if !slot.detached
            && let Some(entry) = slot.entry()
        {
            return match entry.status() {
                Status::Managed | Status::ReadOnly => Outcome::Ok(from),
                Status::Deleted => Outcome::Err(Error::ObjectDeleted {
                    entity: entity.to_string(),
                    id: id.unwrap_or(Value::Null),
                }),
                Status::Gone => Outcome::Err(Error::DetachedEntity {
                    entity: entity.to_string(),
                    id,
                    operation: "merge",
                }),
            };
        }

        if let Some(id) = id {
            if let Some(target) = try_outcome!(self.get(cx, entity, id.clone()).await) {
                return Outcome::Ok(target);
            }
            let target = try_result!(self.instantiate(entity));
            if generation == IdGeneration::Assigned {
                try_result!(self.slot_mut(target)).id = Some(id);
            }
            created.push(target);
            return Outcome::Ok(target);
        }
        let target = try_result!(self.instantiate(entity));
        created.push(target);
        Outcome::Ok(target)
    }

    /// A detached copy must carry the version its managed counterpart has in
    /// storage; otherwise someone else changed the row since it was read.
    fn check_merge_version(&self, from: EntityHandle, to: EntityHandle) -> Result<()> {
        let target = self.slot(to)?;
        let shape = target.shape();
        let (Some(index), Some(entry)) = (shape.version, target.entry()) else {
            return Ok(());
        };
        if !entry.exists_in_database() {
            return Ok(());
        }
        let Some(StateValue::Basic(detached)) = self.slot(from)?.values().and_then(|v| v.get(index))
        else {
            return Ok(());
        };
        if detached.is_null() {
            return Ok(());
        }
        let current = match target.values().and_then(|v| v.get(index)) {
            Some(StateValue::Basic(v)) => v,
            _ => return Ok(()),
        };
        if shape.properties[index].ty.are_equal(detached, current) {
            return Ok(());
        }
        tracing::debug!(
            entity = shape.name,
            detached = %detached,
            current = %current,
            "Merge of a stale detached instance"
        );
        Err(StaleStateError {
            entity: shape.name.to_string(),
            id: target.id.clone().unwrap_or(Value::Null),
            expected: 1,
            actual: 0,
        }
        .into())
    }

    fn merge_reference(
        &mut self,
        reference: EntityHandle,
        mapping: &HashMap<EntityHandle, EntityHandle>,
    ) -> Result<EntityHandle> {
        if let Some(mapped) = mapping.get(&reference) {
            return Ok(*mapped);
        }
        let slot = self.slot(reference)?;
        match slot.id.clone().filter(|id| !id.is_null()) {
            Some(id) if slot.detached => self.reference(slot.entity_name(), id),
            _ => Ok(reference),
        }
    }

    async fn copy_state(
        &mut self,
        cx: &Cx,
        from: EntityHandle,
        to: EntityHandle,
        mapping: &HashMap<EntityHandle, EntityHandle>,
    ) -> Outcome<(), Error> {
        let Some(source) = try_result!(self.slot(from)).values().map(<[StateValue]>::to_vec) else {
            return Outcome::Ok(());
        };
        if !try_result!(self.slot(to)).is_initialized() {
            try_outcome!(self.resolve(cx, to).await);
        }
        let properties: &'static [PropertyInfo] = try_result!(self.slot(to)).shape().properties;
        let version = try_result!(self.slot(to)).shape().version;

        for (index, value) in source.into_iter().enumerate() {
            if version == Some(index) {
                continue;
            }
            let merged = match value {
                StateValue::Unfetched | StateValue::Collection(LazyState::Unloaded(_) | LazyState::Loading) => continue,
                StateValue::Basic(v) => {
                    let copied = properties.get(index).map_or_else(|| v.clone(), |p| p.ty.deep_copy(&v));
                    StateValue::Basic(copied)
                }
                StateValue::Reference(None) => StateValue::Reference(None),
                StateValue::Reference(Some(r)) => {
                    StateValue::Reference(Some(try_result!(self.merge_reference(r, mapping))))
                }
                StateValue::Collection(LazyState::Loaded(elements)) => {
                    if matches!(
                        try_result!(self.value(to, index)),
                        StateValue::Collection(LazyState::Unloaded(_))
                    ) {
                        try_outcome!(self.initialize_collection(cx, to, index).await);
                    }
                    let mut mapped = Vec::with_capacity(elements.len());
                    for element in elements {
                        let element = try_result!(self.merge_reference(element, mapping));
                        if !mapped.contains(&element) {
                            mapped.push(element);
                        }
                    }
                    StateValue::Collection(LazyState::Loaded(mapped))
                }
            };

            let slot = try_result!(self.slot_mut(to));
            if let Some(values) = slot.values_mut() {
                values[index] = merged;
            }
            if let Some(interceptor) = slot.interceptor.as_mut() {
                interceptor.mark_written(index);
            }
            if let Some(entry) = slot.collections.get_mut(&index) {
                entry.dirty = true;
            }
        }
        Outcome::Ok(())
    }

    /// Detach an instance from the session, cascading along detach associations.
    ///
    /// Pending actions for the detached instances are dropped.
    pub fn evict(&mut self, handle: EntityHandle) -> Result<()> {
        self.ensure_open()?;
        let reached = cascade(
            &self.store,
            CascadeAction::Detach,
            handle,
            &mut HashSet::new(),
        );
        for target in reached {
            self.evict_one(target);
        }
        Ok(())
    }

    fn evict_one(&mut self, handle: EntityHandle) {
        let Some(slot) = self.store.get_mut(handle) else {
            return;
        };
        let key = slot.id.as_ref().map(|id| EntityKey::of(slot.shape(), id));
        let registered = key
            .as_ref()
            .is_some_and(|key| self.identity_map.lookup(key) == Some(handle));
        if slot.entry.is_none() && !registered {
            return;
        }
        if let Some(key) = key.filter(|_| registered) {
            self.identity_map.evict(&key);
            self.natural_ids.remove(&key);
        }
        let dropped = self.queue.unschedule_all(handle);
        if dropped > 0 {
            tracing::warn!(
                entity = slot.entity_name(),
                handle = %handle,
                dropped,
                "Evicted instance had pending actions; they were dropped"
            );
        }
        slot.entry = None;
        slot.collections.clear();
        slot.detached = true;
    }

    fn detach_all(&mut self) {
        for (_, slot) in self.store.iter_mut() {
            let registered_placeholder = !slot.is_initialized() && !slot.detached;
            if slot.entry.is_some() || registered_placeholder {
                slot.entry = None;
                slot.collections.clear();
                slot.detached = true;
            }
        }
        self.identity_map.clear();
        self.queue.clear();
        self.natural_ids.clear();
    }

    /// Detach every instance and drop every pending action.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        tracing::debug!(
            managed = self.identity_map.len(),
            pending = self.queue.len(),
            "Clearing session"
        );
        self.detach_all();
        Ok(())
    }

    /// Switch a managed instance between read-only and modifiable.
    ///
    /// Read-only instances are never dirty-checked. Making one modifiable
    /// again takes a fresh snapshot of its current state, so changes made
    /// while read-only are not written.
    pub fn set_read_only(&mut self, handle: EntityHandle, read_only: bool) -> Result<()> {
        self.ensure_usable()?;
        let slot = self.slot_mut(handle)?;
        let persister = Arc::clone(&slot.persister);
        let shape = persister.shape();
        let Some(entry) = slot.entry.as_mut() else {
            return Err(Error::DetachedEntity {
                entity: shape.name.to_string(),
                id: slot.id.clone(),
                operation: "set_read_only",
            });
        };
        if entry.is_removed() {
            return Err(Error::ObjectDeleted {
                entity: shape.name.to_string(),
                id: entry.id().cloned().unwrap_or(Value::Null),
            });
        }
        if read_only {
            return entry.transition(Status::ReadOnly);
        }
        if !shape.mutable {
            return Err(Error::InvalidOperation(format!(
                "{} is immutable and cannot be made modifiable",
                shape.name
            )));
        }
        let was_read_only = entry.is_read_only();
        entry.transition(Status::Managed)?;
        if was_read_only
            && entry.exists_in_database()
            && let Some(values) = slot.state.loaded()
        {
            entry.loaded_state = Some(snapshot_state(shape, values));
        }
        Ok(())
    }

    pub fn is_read_only(&self, handle: EntityHandle) -> Result<bool> {
        let slot = self.slot(handle)?;
        slot.entry()
            .map(EntityEntry::is_read_only)
            .ok_or_else(|| Error::DetachedEntity {
                entity: slot.entity_name().to_string(),
                id: slot.id.clone(),
                operation: "is_read_only",
            })
    }

    /// Properties of a managed instance that differ from its snapshot.
    pub fn modified_properties(&self, handle: EntityHandle) -> Result<Vec<usize>> {
        let slot = self.slot(handle)?;
        let Some(entry) = slot.entry() else {
            return Err(Error::DetachedEntity {
                entity: slot.entity_name().to_string(),
                id: slot.id.clone(),
                operation: "modified_properties",
            });
        };
        Ok(slot
            .values()
            .map(|values| compute_dirty_properties(slot.shape(), entry, values))
            .unwrap_or_default())
    }

    /// Whether a flush would write anything.
    pub fn is_dirty(&self) -> bool {
        if !self.queue.is_empty() {
            return true;
        }
        self.store.iter().any(|(_, slot)| {
            let (Some(entry), Some(values)) = (slot.entry(), slot.values()) else {
                return false;
            };
            if slot.detached || entry.is_removed() {
                return false;
            }
            entry.force_increment
                || !compute_dirty_properties(slot.shape(), entry, values).is_empty()
                || slot.collections.iter().any(|(index, collection)| {
                    values
                        .get(*index)
                        .and_then(StateValue::elements)
                        .is_some_and(|elements| collection.differs_from(elements))
                })
        })
    }

    /// Whether this session inserted the row `entity#id` in the current transaction.
    pub fn was_inserted_during_transaction(&self, entity: &str, id: impl Into<Value>) -> bool {
        self.factory.persister(entity).is_ok_and(|persister| {
            self.inserted_keys
                .contains(&EntityKey::of(persister.shape(), &id.into()))
        })
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.ensure_usable());
        try_result!(self.ensure_connected());
        if self.in_transaction {
            return Outcome::Err(Error::Transaction(
                "a transaction is already active".to_string(),
            ));
        }
        try_outcome!(self.connection.begin(cx).await);
        self.in_transaction = true;
        tracing::debug!("Transaction started");
        Outcome::Ok(())
    }

    /// Flush (unless the flush mode is manual), verify optimistic locks and commit.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.ensure_usable());
        if self.config.flush_mode != FlushMode::Manual {
            try_outcome!(self.flush(cx).await);
        }
        if !self.in_transaction {
            return Outcome::Err(Error::Transaction(
                "no transaction is active".to_string(),
            ));
        }
        try_outcome!(self.verify_versions(cx).await);

        if let Err(e) = self.callbacks.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }
        try_outcome!(self.connection.commit(cx).await);
        self.in_transaction = false;
        self.end_transaction();
        tracing::debug!("Transaction committed");

        if let Err(e) = self.callbacks.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// Re-read the version of every instance locked with [`LockMode::Optimistic`].
    async fn verify_versions(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let checks: Vec<(Arc<dyn unitwork_core::EntityPersister>, Value, Value)> = self
            .store
            .iter()
            .filter(|(_, slot)| !slot.detached)
            .filter_map(|(_, slot)| {
                let entry = slot.entry()?;
                if !entry.verify_version || entry.is_removed() || !entry.exists_in_database() {
                    return None;
                }
                Some((
                    Arc::clone(&slot.persister),
                    entry.id()?.clone(),
                    entry.version()?.clone(),
                ))
            })
            .collect();

        for (persister, id, expected) in checks {
            let shape = persister.shape();
            let statement = persister.version_statement(&id);
            self.counters.statements += 1;
            let row = try_outcome!(self.connection.query_one(cx, &statement).await);
            let matches = match (row.map(|r| r.first()), shape.version.and_then(|i| shape.property(i))) {
                (Some(current), Some(prop)) => prop.ty.are_equal(&current, &expected),
                _ => false,
            };
            if !matches {
                tracing::debug!(entity = shape.name, id = %id, "Optimistic lock check failed");
                return Outcome::Err(
                    StaleStateError {
                        entity: shape.name.to_string(),
                        id,
                        expected: 1,
                        actual: 0,
                    }
                    .into(),
                );
            }
        }
        Outcome::Ok(())
    }

    fn end_transaction(&mut self) {
        self.inserted_keys.clear();
        for (_, slot) in self.store.iter_mut() {
            if let Some(entry) = slot.entry.as_mut() {
                entry.lock_mode = LockMode::None;
                entry.verify_version = false;
            }
        }
    }

    /// Roll back the transaction and discard all session state.
    ///
    /// Every instance becomes detached. Allowed after a failed flush.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.ensure_open());
        if self.in_transaction {
            try_outcome!(self.connection.rollback(cx).await);
            self.in_transaction = false;
        }
        self.detach_all();
        self.end_transaction();
        self.flush_failed = false;
        tracing::debug!("Transaction rolled back; session state discarded");

        if let Err(e) = self.callbacks.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// Close the session, rolling back an active transaction.
    ///
    /// Lazy loads through instances of a closed session fail with
    /// [`unitwork_core::LazyFailure::SessionClosed`].
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Ok(());
        }
        if self.in_transaction {
            match self.connection.rollback(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => tracing::warn!(error = %e, "Rollback on close failed"),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            self.in_transaction = false;
        }
        self.detach_all();
        self.closed = true;
        tracing::debug!("Session closed");
        Outcome::Ok(())
    }

    /// Stop using the connection. Lazy loads fail until [`Session::reconnect`].
    pub fn disconnect(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.in_transaction {
            return Err(Error::Transaction(
                "cannot disconnect while a transaction is active".to_string(),
            ));
        }
        self.connected = false;
        Ok(())
    }

    pub async fn reconnect(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.ensure_open());
        try_outcome!(self.connection.ping(cx).await);
        self.connected = true;
        Outcome::Ok(())
    }

    // ========================================================================
    // Debug
    // ========================================================================

    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats {
            pending: self.queue.counts(),
            flushes: self.counters.flushes,
            loads: self.counters.loads,
            lazy_loads: self.counters.lazy_loads,
            statements: self.counters.statements,
            batches: self.counters.batches,
            ..SessionStats::default()
        };
        for (_, slot) in self.store.iter() {
            if slot.detached {
                continue;
            }
            match slot.entry() {
                Some(entry) if !entry.is_removed() => {
                    stats.managed += 1;
                    stats.collections += slot.collections.len();
                }
                Some(_) => {}
                None if !slot.is_initialized() => stats.placeholders += 1,
                None => {}
            }
        }
        stats
    }

    /// The entry ledger as JSON.
    pub fn debug_state(&self) -> serde_json::Value {
        let entities: Vec<serde_json::Value> = self
            .store
            .iter()
            .filter_map(|(handle, slot)| {
                let entry = slot.entry()?;
                let collections: Vec<serde_json::Value> = slot
                    .collections
                    .values()
                    .map(|c| {
                        serde_json::json!({
                            "role": c.role().to_string(),
                            "initialized": c.is_initialized(),
                            "dirty": c.is_dirty(),
                        })
                    })
                    .collect();
                Some(serde_json::json!({
                    "handle": handle.to_string(),
                    "entity": slot.entity_name(),
                    "id": entry.id(),
                    "status": entry.status(),
                    "version": entry.version(),
                    "lock_mode": entry.lock_mode(),
                    "exists_in_database": entry.exists_in_database(),
                    "collections": collections,
                }))
            })
            .collect();
        serde_json::json!({
            "in_transaction": self.in_transaction,
            "flush_failed": self.flush_failed,
            "stats": self.stats(),
            "entities": entities,
        })
    }
}

fn loaded_elements_mut<'a>(
    slot: &'a mut ManagedEntity,
    index: usize,
    property: &str,
) -> Result<&'a mut Vec<EntityHandle>> {
    let entity = slot.entity_name();
    match slot.values_mut().and_then(|values| values.get_mut(index)) {
        Some(StateValue::Collection(LazyState::Loaded(elements))) => Ok(elements),
        _ => Err(Error::InvalidOperation(format!(
            "{entity}.{property} is not initialized"
        ))),
    }
}

/// Whether `shape` declares an immutable natural id that `dirty` touches.
pub(crate) fn touches_immutable_natural_id(shape: &EntityShape, dirty: &[usize]) -> bool {
    shape
        .natural_id
        .is_some_and(|info| !info.mutable && dirty.iter().any(|i| info.properties.contains(i)))
}
