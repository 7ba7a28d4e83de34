//! Placeholders, loading and re-reading.
//!
//! A placeholder is an arena slot whose identifier is known but whose state
//! has not been read. [`Session::reference`] hands one out without touching
//! storage; it is registered in the identity map like any loaded instance,
//! so asking for the same row twice yields the same handle. The row is read
//! the first time the placeholder is resolved.

use crate::cascade::cascade;
use crate::entity::{EntityHandle, ManagedEntity, StateValue};
use crate::entry::{CollectionEntry, CollectionRole, EntityEntry, Status};
use crate::events::EntityEvent;
use crate::identity_map::EntityKey;
use crate::lazy::LazyAttributeInterceptor;
use crate::natural_id::natural_id_values;
use crate::{FlushMode, Session, snapshot_state};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use unitwork_core::{
    ActionKind, CascadeAction, Connection, Cx, Error, LazyState, LockMode, Outcome, PropertyKind,
    Result, Row, StaleStateError, Value,
};

/// Follow-up load discovered while hydrating eager associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchTask {
    Entity(EntityHandle),
    Collection(EntityHandle, usize),
}

impl<C: Connection> Session<C> {
    /// Handle for the row `entity#id`, without reading it.
    ///
    /// Returns the registered instance if there is one; otherwise registers
    /// an uninitialized placeholder.
    pub fn reference(&mut self, entity: &str, id: impl Into<Value>) -> Result<EntityHandle> {
        self.ensure_open()?;
        let id = id.into();
        if id.is_null() {
            return Err(Error::InvalidOperation(format!(
                "cannot reference {entity} with a NULL identifier"
            )));
        }
        let persister = Arc::clone(self.factory.persister(entity)?);
        let key = EntityKey::of(persister.shape(), &id);
        if let Some(existing) = self.identity_map.lookup(&key) {
            return Ok(existing);
        }
        let handle = self
            .store
            .insert(ManagedEntity::placeholder(persister, key.id.clone()));
        self.identity_map.register(key, handle)?;
        tracing::trace!(entity, handle = %handle, "Registered placeholder");
        Ok(handle)
    }

    /// Initialize a placeholder. Idempotent: an initialized instance is
    /// returned as is and no statement runs.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn resolve(&mut self, cx: &Cx, handle: EntityHandle) -> Outcome<EntityHandle, Error> {
        let slot = try_result!(self.slot(handle));
        if slot.is_initialized() {
            return Outcome::Ok(handle);
        }
        let id_name = slot.shape().id_name;
        try_result!(self.lazy_guard(handle, id_name));

        match try_outcome!(self.load_into(cx, handle).await) {
            Some(tasks) => {
                try_outcome!(self.fetch_all(cx, tasks).await);
                Outcome::Ok(handle)
            }
            None => {
                let slot = try_result!(self.slot(handle));
                Outcome::Err(Error::EntityNotFound {
                    entity: slot.entity_name().to_string(),
                    id: slot.id.clone().unwrap_or(Value::Null),
                })
            }
        }
    }

    /// Read the row of an uninitialized slot and hydrate it.
    ///
    /// Returns `None` (and leaves the slot unloaded) if the row does not exist.
    async fn load_into(
        &mut self,
        cx: &Cx,
        handle: EntityHandle,
    ) -> Outcome<Option<Vec<FetchTask>>, Error> {
        let slot = try_result!(self.slot_mut(handle));
        let Some(id) = slot.state.pending_key().cloned() else {
            return Outcome::Ok(Some(Vec::new()));
        };
        slot.state = LazyState::Loading;
        let persister = Arc::clone(&slot.persister);
        let shape = persister.shape();

        let event = EntityEvent {
            entity: shape.name,
            id: Some(&id),
            state: &[],
            properties: &[],
        };
        for listener in self.factory.listeners() {
            listener.pre_load(&event);
        }

        tracing::debug!(entity = shape.name, id = %id, "Loading entity");
        let statement = persister.load_statement(&id);
        self.counters.statements += 1;
        let row = match self.connection.query_one(cx, &statement).await {
            Outcome::Ok(row) => row,
            other => {
                self.restore_unloaded(handle, id);
                return match other {
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                    Outcome::Ok(_) => Outcome::Ok(None),
                };
            }
        };
        let Some(row) = row else {
            tracing::debug!(entity = shape.name, id = %id, "No row found");
            self.restore_unloaded(handle, id);
            return Outcome::Ok(None);
        };

        match self.hydrate(handle, id.clone(), &row) {
            Ok(tasks) => {
                self.counters.loads += 1;
                Outcome::Ok(Some(tasks))
            }
            Err(e) => {
                self.restore_unloaded(handle, id);
                Outcome::Err(e)
            }
        }
    }

    fn restore_unloaded(&mut self, handle: EntityHandle, id: Value) {
        if let Some(slot) = self.store.get_mut(handle) {
            slot.state = LazyState::Unloaded(id);
        }
    }

    /// Install `row` as the state of `handle` and create its entry.
    ///
    /// To-one foreign keys become placeholders; collections start unloaded.
    /// Returns the eager associations that still need loading.
    fn hydrate(&mut self, handle: EntityHandle, id: Value, row: &Row) -> Result<Vec<FetchTask>> {
        let persister = Arc::clone(&self.slot(handle)?.persister);
        let shape = persister.shape();

        let mut tasks = Vec::new();
        let mut state = Vec::with_capacity(shape.len());
        for (index, prop) in shape.properties.iter().enumerate() {
            let column = row.get(index).cloned().unwrap_or(Value::Null);
            let value = match prop.kind {
                PropertyKind::Basic if prop.lazy => StateValue::Unfetched,
                PropertyKind::Basic => StateValue::Basic(column),
                PropertyKind::ToOne { target, .. } => {
                    if column.is_null() {
                        StateValue::Reference(None)
                    } else {
                        let target = self.reference(target, column)?;
                        if !prop.lazy {
                            tasks.push(FetchTask::Entity(target));
                        }
                        StateValue::Reference(Some(target))
                    }
                }
                PropertyKind::Collection { .. } => {
                    if !prop.lazy {
                        tasks.push(FetchTask::Collection(handle, index));
                    }
                    StateValue::Collection(LazyState::Unloaded(id.clone()))
                }
            };
            state.push(value);
        }

        let snapshot = snapshot_state(shape, &state);
        let version = shape
            .version
            .and_then(|i| state.get(i))
            .and_then(StateValue::as_value)
            .filter(|v| !v.is_null())
            .cloned();
        let status = if self.config.default_read_only || !shape.mutable {
            Status::ReadOnly
        } else {
            Status::Managed
        };
        let flat = self.flatten(&state);
        let natural = natural_id_values(shape, &state);
        let key = EntityKey::of(shape, &id);

        let collections: BTreeMap<usize, CollectionEntry> = shape
            .associations()
            .filter(|(_, prop)| prop.is_collection())
            .map(|(index, prop)| {
                let role = CollectionRole {
                    entity: shape.name,
                    property: prop.name,
                };
                (index, CollectionEntry::loaded(role, id.clone()))
            })
            .collect();
        let interceptor = shape
            .lazy_properties()
            .next()
            .is_some()
            .then(|| LazyAttributeInterceptor::new(shape.lazy_properties()));

        let slot = self.slot_mut(handle)?;
        slot.id = Some(id.clone());
        slot.entry = Some(EntityEntry::loaded(
            shape.name,
            id.clone(),
            snapshot,
            version,
            status,
        ));
        slot.collections = collections;
        slot.interceptor = interceptor;
        slot.state = LazyState::Loaded(state);
        slot.detached = false;

        if let Some(values) = natural {
            self.natural_ids.cache(&key, values);
        }
        let event = EntityEvent {
            entity: shape.name,
            id: Some(&id),
            state: &flat,
            properties: &[],
        };
        for listener in self.factory.listeners() {
            listener.post_load(&event);
        }
        Ok(tasks)
    }

    /// Managed instance for `entity#id`, reading the row if it is not in the
    /// session yet.
    ///
    /// Returns `None` if no such row exists or the instance is scheduled for
    /// deletion.
    #[tracing::instrument(level = "debug", skip(self, cx, id))]
    pub async fn get(
        &mut self,
        cx: &Cx,
        entity: &str,
        id: impl Into<Value>,
    ) -> Outcome<Option<EntityHandle>, Error> {
        try_result!(self.ensure_usable());
        try_result!(self.ensure_connected());
        let id = id.into();
        if id.is_null() {
            return Outcome::Ok(None);
        }
        if self.config.flush_mode == FlushMode::Always {
            try_outcome!(self.flush(cx).await);
        }

        let persister = Arc::clone(try_result!(self.factory.persister(entity)));
        let key = EntityKey::of(persister.shape(), &id);
        let handle = match self.identity_map.lookup(&key) {
            Some(handle) => {
                let slot = try_result!(self.slot(handle));
                if slot.is_initialized() {
                    let removed = slot.entry().is_none_or(EntityEntry::is_removed);
                    return Outcome::Ok((!removed).then_some(handle));
                }
                handle
            }
            None => {
                let handle = self
                    .store
                    .insert(ManagedEntity::placeholder(persister, key.id.clone()));
                try_result!(self.identity_map.register(key.clone(), handle));
                handle
            }
        };

        match try_outcome!(self.load_into(cx, handle).await) {
            Some(tasks) => {
                try_outcome!(self.fetch_all(cx, tasks).await);
                Outcome::Ok(Some(handle))
            }
            None => {
                self.identity_map.evict(&key);
                if let Some(slot) = self.store.get_mut(handle) {
                    slot.detached = true;
                }
                Outcome::Ok(None)
            }
        }
    }

    /// Run fetch tasks until no eager association is left unloaded.
    pub(crate) async fn fetch_all(&mut self, cx: &Cx, tasks: Vec<FetchTask>) -> Outcome<(), Error> {
        let mut pending: VecDeque<FetchTask> = tasks.into();
        while let Some(task) = pending.pop_front() {
            match task {
                FetchTask::Entity(handle) => {
                    let slot = try_result!(self.slot(handle));
                    if slot.is_initialized() || slot.detached {
                        continue;
                    }
                    match try_outcome!(self.load_into(cx, handle).await) {
                        Some(more) => pending.extend(more),
                        None => {
                            let slot = try_result!(self.slot(handle));
                            return Outcome::Err(Error::EntityNotFound {
                                entity: slot.entity_name().to_string(),
                                id: slot.id.clone().unwrap_or(Value::Null),
                            });
                        }
                    }
                }
                FetchTask::Collection(owner, index) => {
                    let more = try_outcome!(self.initialize_collection(cx, owner, index).await);
                    pending.extend(more);
                }
            }
        }
        Outcome::Ok(())
    }

    /// Re-read the state of a managed instance, discarding unflushed changes.
    ///
    /// Cascades along refresh associations. Read-only status and lock mode
    /// survive the refresh; collections become uninitialized.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn refresh(&mut self, cx: &Cx, handle: EntityHandle) -> Outcome<(), Error> {
        try_result!(self.ensure_usable());
        try_result!(self.ensure_connected());
        let reached = cascade(
            &self.store,
            CascadeAction::Refresh,
            handle,
            &mut HashSet::new(),
        );

        let mut tasks = Vec::new();
        for target in reached {
            let slot = try_result!(self.slot(target));
            let root = target == handle;
            if !slot.is_initialized() {
                if root {
                    tasks.push(FetchTask::Entity(target));
                }
                continue;
            }
            let persister = Arc::clone(&slot.persister);
            let shape = persister.shape();
            let entry = match slot.entry() {
                Some(entry) if !slot.detached => entry,
                _ if root => {
                    return Outcome::Err(Error::DetachedEntity {
                        entity: shape.name.to_string(),
                        id: slot.id.clone(),
                        operation: "refresh",
                    });
                }
                _ => continue,
            };
            if entry.is_removed() || !entry.exists_in_database() {
                if root {
                    return Outcome::Err(Error::InvalidOperation(format!(
                        "{} {target} has no row to refresh from",
                        shape.name
                    )));
                }
                continue;
            }
            let status = entry.status();
            let lock_mode = entry.lock_mode();
            let Some(id) = entry.id().cloned() else {
                continue;
            };

            self.queue.unschedule(ActionKind::Update, target);
            let statement = persister.load_statement(&id);
            self.counters.statements += 1;
            let Some(row) = try_outcome!(self.connection.query_one(cx, &statement).await) else {
                return Outcome::Err(Error::EntityNotFound {
                    entity: shape.name.to_string(),
                    id,
                });
            };
            tasks.extend(try_result!(self.hydrate(target, id, &row)));
            if let Some(entry) = try_result!(self.slot_mut(target)).entry.as_mut() {
                entry.status = status;
                entry.lock_mode = lock_mode;
            }
            self.counters.loads += 1;
            tracing::debug!(entity = shape.name, handle = %target, "Refreshed");
        }
        self.fetch_all(cx, tasks).await
    }

    /// Obtain a lock on a managed instance, cascading along lock associations.
    ///
    /// Pessimistic modes issue a locking read inside the transaction
    /// (beginning one if the session auto-begins). `Optimistic` re-checks
    /// the version at commit. Force-increment modes bump the version at the
    /// next flush even if nothing changed.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn lock(&mut self, cx: &Cx, handle: EntityHandle, mode: LockMode) -> Outcome<(), Error> {
        try_result!(self.ensure_usable());
        try_result!(self.ensure_connected());
        let reached = cascade(&self.store, CascadeAction::Lock, handle, &mut HashSet::new());
        for target in reached {
            try_outcome!(self.lock_one(cx, target, mode, target == handle).await);
        }
        Outcome::Ok(())
    }

    async fn lock_one(
        &mut self,
        cx: &Cx,
        handle: EntityHandle,
        mode: LockMode,
        root: bool,
    ) -> Outcome<(), Error> {
        if !try_result!(self.slot(handle)).is_initialized() {
            if !root {
                return Outcome::Ok(());
            }
            try_outcome!(self.resolve(cx, handle).await);
        }
        let slot = try_result!(self.slot(handle));
        let persister = Arc::clone(&slot.persister);
        let shape = persister.shape();
        let entry = match slot.entry() {
            Some(entry) if !slot.detached => entry,
            _ if root => {
                return Outcome::Err(Error::DetachedEntity {
                    entity: shape.name.to_string(),
                    id: slot.id.clone(),
                    operation: "lock",
                });
            }
            _ => return Outcome::Ok(()),
        };
        if entry.is_removed() {
            return Outcome::Err(Error::ObjectDeleted {
                entity: shape.name.to_string(),
                id: entry.id().cloned().unwrap_or(Value::Null),
            });
        }
        // Unflushed inserts already hold the strongest lock.
        if !entry.exists_in_database() || !mode.greater_than(entry.lock_mode()) {
            return Outcome::Ok(());
        }
        let needs_version = mode.forces_increment()
            || matches!(mode, LockMode::Optimistic | LockMode::OptimisticForceIncrement);
        if needs_version && shape.version.is_none() {
            return Outcome::Err(Error::InvalidOperation(format!(
                "{} is not versioned; {mode:?} needs a version property",
                shape.name
            )));
        }
        let Some(id) = entry.id().cloned() else {
            return Outcome::Ok(());
        };
        let version = entry.version().cloned();

        if mode.is_pessimistic() {
            if !self.in_transaction {
                if !self.config.auto_begin {
                    return Outcome::Err(Error::Transaction(format!(
                        "{mode:?} needs an active transaction"
                    )));
                }
                try_outcome!(self.begin(cx).await);
            }
            let statement = persister.lock_statement(&id, mode);
            self.counters.statements += 1;
            let Some(row) = try_outcome!(self.connection.query_one(cx, &statement).await) else {
                return Outcome::Err(Error::EntityNotFound {
                    entity: shape.name.to_string(),
                    id,
                });
            };
            if let (Some(index), Some(expected)) = (shape.version, &version) {
                let current = row.first();
                let same = shape
                    .property(index)
                    .is_some_and(|p| p.ty.are_equal(&current, expected));
                if !same {
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
        }

        let slot = try_result!(self.slot_mut(handle));
        if let Some(entry) = slot.entry.as_mut() {
            if matches!(mode, LockMode::Optimistic | LockMode::OptimisticForceIncrement) {
                entry.verify_version = true;
            }
            if mode.forces_increment() {
                entry.force_increment = true;
            }
            entry.upgrade_lock(mode);
        }
        tracing::debug!(entity = shape.name, handle = %handle, ?mode, "Locked");
        Outcome::Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)]
mod tests {
    use super::*;
    use crate::test_support::{
        CHILD_PARENT, MemoryConnection, PARENT_CHILDREN, RecordingListener, WIDGET_NAME,
        WIDGET_NOTES, WIDGET_OWNER, WIDGET_VERSION, factory, factory_with_listener, int, run,
        text, unwrap_outcome,
    };

    fn seeded() -> MemoryConnection {
        let conn = MemoryConnection::new();
        conn.seed("person", &[("id", int(7)), ("name", text("ada"))]);
        conn.seed(
            "widget",
            &[
                ("id", int(1)),
                ("name", text("bolt")),
                ("price", int(10)),
                ("version", int(3)),
                ("notes", text("fragile")),
                ("owner", int(7)),
            ],
        );
        conn
    }

    #[test]
    fn test_reference_is_idempotent_and_lazy() {
        let factory = factory();
        let conn = seeded();
        let mut session = factory.open_session(conn.clone()).unwrap();
        run(|cx| async move {
            let a = session.reference("Widget", 1_i64).unwrap();
            let b = session.reference("Widget", 1_i32).unwrap();
            assert_eq!(a, b);
            assert!(!session.entity(a).unwrap().is_initialized());
            assert_eq!(conn.statement_count(), 0);

            let first = unwrap_outcome(session.resolve(&cx, a).await);
            let again = unwrap_outcome(session.resolve(&cx, a).await);
            assert_eq!(first, again);
            assert_eq!(conn.statements_matching("from widget"), 1);
            assert!(session.reference("Widget", Value::Null).is_err());
        });
    }

    #[test]
    fn test_get_hydrates_state_and_entry() {
        let factory = factory();
        let mut session = factory.open_session(seeded()).unwrap();
        run(|cx| async move {
            let widget = unwrap_outcome(session.get(&cx, "Widget", 1_i64).await).unwrap();
            assert_eq!(
                session.value(widget, WIDGET_NAME).unwrap(),
                &StateValue::Basic(text("bolt"))
            );
            // Lazy property is not read with the row
            assert_eq!(session.value(widget, WIDGET_NOTES).unwrap(), &StateValue::Unfetched);
            let entry = session.entry(widget).unwrap();
            assert_eq!(entry.status(), Status::Managed);
            assert_eq!(entry.version(), Some(&int(3)));
            assert_eq!(entry.lock_mode(), LockMode::Read);

            // Owner becomes a registered placeholder
            let owner = session.value(widget, WIDGET_OWNER).unwrap().as_reference().unwrap();
            assert_eq!(session.lookup("Person", 7_i64), Some(owner));
            assert!(!session.entity(owner).unwrap().is_initialized());

            // Same handle on the second lookup
            let again = unwrap_outcome(session.get(&cx, "Widget", 1_i64).await);
            assert_eq!(again, Some(widget));
            assert_eq!(unwrap_outcome(session.get(&cx, "Widget", 99_i64).await), None);
            assert!(session.lookup("Widget", 99_i64).is_none());
        });
    }

    #[test]
    fn test_missing_row_reported_on_resolve() {
        let factory = factory();
        let mut session = factory.open_session(MemoryConnection::new()).unwrap();
        run(|cx| async move {
            let tag = session.reference("Tag", 5_i64).unwrap();
            match session.resolve(&cx, tag).await {
                Outcome::Err(Error::EntityNotFound { entity, id }) => {
                    assert_eq!(entity, "Tag");
                    assert_eq!(id, int(5));
                }
                other => panic!("expected EntityNotFound, got {other:?}"),
            }
            // Still a retryable placeholder
            assert!(!session.entity(tag).unwrap().is_initialized());
        });
    }

    #[test]
    fn test_load_listeners_fire() {
        let listener = Arc::new(RecordingListener::default());
        let factory = factory_with_listener(listener.clone());
        let mut session = factory.open_session(seeded()).unwrap();
        run(|cx| async move {
            unwrap_outcome(session.get(&cx, "Person", 7_i64).await);
        });
        assert_eq!(listener.events(), vec!["pre_load Person#7", "post_load Person#7"]);
    }

    #[test]
    fn test_lazy_property_fetched_on_access() {
        let factory = factory();
        let conn = seeded();
        let mut session = factory.open_session(conn.clone()).unwrap();
        run(|cx| async move {
            let widget = unwrap_outcome(session.get(&cx, "Widget", 1_i64).await).unwrap();
            let notes = unwrap_outcome(session.property(&cx, widget, WIDGET_NOTES).await);
            assert_eq!(notes, StateValue::Basic(text("fragile")));
            unwrap_outcome(session.property(&cx, widget, WIDGET_NOTES).await);
            assert_eq!(conn.statements_matching("select notes"), 1);
            assert_eq!(session.stats().lazy_loads, 1);
            // Fetched value is part of the snapshot, so it is not dirty
            assert!(session.modified_properties(widget).unwrap().is_empty());
        });
    }

    #[test]
    fn test_lazy_access_after_close_fails() {
        let factory = factory();
        let mut session = factory.open_session(seeded()).unwrap();
        run(|cx| async move {
            let widget = unwrap_outcome(session.get(&cx, "Widget", 1_i64).await).unwrap();
            let owner = session.value(widget, WIDGET_OWNER).unwrap().as_reference().unwrap();
            unwrap_outcome(session.close(&cx).await);

            match session.resolve(&cx, owner).await {
                Outcome::Err(Error::LazyInitialization(e)) => {
                    assert_eq!(e.reason, unitwork_core::LazyFailure::SessionClosed);
                }
                other => panic!("expected lazy initialization failure, got {other:?}"),
            }
            match session.property(&cx, widget, WIDGET_NOTES).await {
                Outcome::Err(e) => assert!(e.is_lazy_initialization()),
                other => panic!("expected lazy initialization failure, got {other:?}"),
            }
        });
    }

    #[test]
    fn test_lazy_access_after_evict_fails() {
        let factory = factory();
        let mut session = factory.open_session(seeded()).unwrap();
        run(|cx| async move {
            let widget = unwrap_outcome(session.get(&cx, "Widget", 1_i64).await).unwrap();
            session.evict(widget).unwrap();
            match session.property(&cx, widget, WIDGET_NOTES).await {
                Outcome::Err(Error::LazyInitialization(e)) => {
                    assert_eq!(e.reason, unitwork_core::LazyFailure::Detached);
                    assert_eq!(e.property, "notes");
                }
                other => panic!("expected lazy initialization failure, got {other:?}"),
            }
        });
    }

    #[test]
    fn test_collection_initialization() {
        let factory = factory();
        let conn = MemoryConnection::new();
        conn.seed("parent", &[("id", int(1)), ("name", text("p")), ("version", int(0))]);
        conn.seed("child", &[("id", int(10)), ("name", text("a")), ("parent", int(1))]);
        conn.seed("child", &[("id", int(11)), ("name", text("b")), ("parent", int(1))]);
        let mut session = factory.open_session(conn.clone()).unwrap();
        run(|cx| async move {
            let parent = unwrap_outcome(session.get(&cx, "Parent", 1_i64).await).unwrap();
            assert!(session.elements(parent, PARENT_CHILDREN).is_err());
            assert!(!session.entity(parent).unwrap().collection_entry(PARENT_CHILDREN).unwrap().is_initialized());

            let children = unwrap_outcome(session.collection(&cx, parent, PARENT_CHILDREN).await);
            assert_eq!(children.len(), 2);
            assert_eq!(session.lookup("Child", 10_i64), Some(children[0]));

            // Elements resolve to their own rows, whose parent is the same instance
            let child = unwrap_outcome(session.resolve(&cx, children[0]).await);
            assert_eq!(
                session.value(child, CHILD_PARENT).unwrap().as_reference(),
                Some(parent)
            );
            unwrap_outcome(session.collection(&cx, parent, PARENT_CHILDREN).await);
            assert_eq!(conn.statements_matching("select id from child"), 1);
        });
    }

    #[test]
    fn test_refresh_discards_changes() {
        let factory = factory();
        let conn = seeded();
        let mut session = factory.open_session(conn.clone()).unwrap();
        run(|cx| async move {
            let widget = unwrap_outcome(session.get(&cx, "Widget", 1_i64).await).unwrap();
            session.set_value(widget, WIDGET_NAME, "nut").unwrap();
            conn.set_value("widget", 1, "price", int(12));

            unwrap_outcome(session.refresh(&cx, widget).await);
            assert_eq!(
                session.value(widget, WIDGET_NAME).unwrap(),
                &StateValue::Basic(text("bolt"))
            );
            assert_eq!(session.value(widget, 1).unwrap(), &StateValue::Basic(int(12)));
            assert!(!session.is_dirty());
        });
    }

    #[test]
    fn test_pessimistic_lock_begins_transaction() {
        let factory = factory();
        let conn = seeded();
        let mut session = factory.open_session(conn.clone()).unwrap();
        run(|cx| async move {
            let widget = unwrap_outcome(session.get(&cx, "Widget", 1_i64).await).unwrap();
            unwrap_outcome(session.lock(&cx, widget, LockMode::PessimisticWrite).await);
            assert!(session.in_transaction());
            assert_eq!(session.entry(widget).unwrap().lock_mode(), LockMode::PessimisticWrite);
            assert_eq!(conn.statements_matching("for update"), 1);

            // Weaker modes are no-ops
            unwrap_outcome(session.lock(&cx, widget, LockMode::Optimistic).await);
            assert_eq!(session.entry(widget).unwrap().lock_mode(), LockMode::PessimisticWrite);
        });
    }

    #[test]
    fn test_pessimistic_lock_detects_moved_version() {
        let factory = factory();
        let conn = seeded();
        let mut session = factory.open_session(conn.clone()).unwrap();
        run(|cx| async move {
            let widget = unwrap_outcome(session.get(&cx, "Widget", 1_i64).await).unwrap();
            conn.set_value("widget", 1, "version", int(4));
            match session.lock(&cx, widget, LockMode::PessimisticRead).await {
                Outcome::Err(e) => assert!(e.is_stale_state()),
                other => panic!("expected stale state, got {other:?}"),
            }
        });
    }

    #[test]
    fn test_optimistic_lock_verified_at_commit() {
        let factory = factory();
        let conn = seeded();
        let mut session = factory.open_session(conn.clone()).unwrap();
        run(|cx| async move {
            unwrap_outcome(session.begin(&cx).await);
            let widget = unwrap_outcome(session.get(&cx, "Widget", 1_i64).await).unwrap();
            unwrap_outcome(session.lock(&cx, widget, LockMode::Optimistic).await);
            conn.set_value("widget", 1, "version", int(4));
            match session.commit(&cx).await {
                Outcome::Err(e) => assert!(e.is_stale_state()),
                other => panic!("expected stale state, got {other:?}"),
            }
        });
    }

    #[test]
    fn test_force_increment_bumps_version() {
        let factory = factory();
        let conn = seeded();
        let mut session = factory.open_session(conn.clone()).unwrap();
        run(|cx| async move {
            let widget = unwrap_outcome(session.get(&cx, "Widget", 1_i64).await).unwrap();
            unwrap_outcome(session.lock(&cx, widget, LockMode::OptimisticForceIncrement).await);
            let summary = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(summary.updated, 1);
            assert_eq!(conn.value("widget", 1, "version"), int(4));
            assert_eq!(session.value(widget, WIDGET_VERSION).unwrap(), &StateValue::Basic(int(4)));

            // Unversioned entities cannot be force-incremented
            let tag = session.reference("Tag", 1_i64).unwrap();
            conn.seed("tag", &[("id", int(1)), ("label", text("x"))]);
            assert!(matches!(
                session.lock(&cx, tag, LockMode::OptimisticForceIncrement).await,
                Outcome::Err(Error::InvalidOperation(_))
            ));
        });
    }
}
