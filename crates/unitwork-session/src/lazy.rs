//! Lazy loading of basic properties and collections.
//!
//! Lazy basic properties of an entity form a single fetch group: the first
//! access to any of them loads all that are still unfetched with one
//! statement. Loaded values are written into both the current state and the
//! entry's snapshot, so a lazy load never shows up as a modification.
//!
//! Lazy loads need an open, connected session that still manages the owner;
//! otherwise they fail with [`LazyInitializationError`].

use crate::Session;
use crate::entity::{EntityHandle, StateValue};
use crate::proxy::FetchTask;
use std::collections::BTreeSet;
use unitwork_core::{
    Connection, Cx, Error, LazyFailure, LazyInitializationError, LazyState, Outcome, PropertyKind,
    Result, Value,
};

/// Result of [`LazyAttributeInterceptor::on_access`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LazyAccess {
    /// The property holds its value already.
    Loaded,
    /// Fetch these properties (the unfetched remainder of the fetch group).
    Fetch(Vec<usize>),
    /// Accessed while the fetch group is being loaded; use the raw value.
    Reentrant,
}

/// Tracks which lazy basic properties of one entity are still unfetched.
#[derive(Debug, Clone, Default)]
pub struct LazyAttributeInterceptor {
    uninitialized: BTreeSet<usize>,
    initializing: bool,
}

impl LazyAttributeInterceptor {
    pub fn new(lazy_properties: impl IntoIterator<Item = usize>) -> Self {
        Self {
            uninitialized: lazy_properties.into_iter().collect(),
            initializing: false,
        }
    }

    /// Decide what an access to `property` requires.
    ///
    /// Starting a fetch sets the initializing flag; the caller must end it
    /// with [`Self::finish`] or [`Self::abort`].
    pub fn on_access(&mut self, property: usize) -> LazyAccess {
        if !self.uninitialized.contains(&property) {
            return LazyAccess::Loaded;
        }
        if self.initializing {
            return LazyAccess::Reentrant;
        }
        self.initializing = true;
        LazyAccess::Fetch(self.uninitialized.iter().copied().collect())
    }

    pub fn finish(&mut self, fetched: &[usize]) {
        for property in fetched {
            self.uninitialized.remove(property);
        }
        self.initializing = false;
    }

    pub fn abort(&mut self) {
        self.initializing = false;
    }

    /// The application assigned `property` directly; never fetch it.
    pub fn mark_written(&mut self, property: usize) {
        self.uninitialized.remove(&property);
    }

    pub fn is_uninitialized(&self, property: usize) -> bool {
        self.uninitialized.contains(&property)
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing
    }

    pub fn uninitialized(&self) -> impl Iterator<Item = usize> + '_ {
        self.uninitialized.iter().copied()
    }

    pub fn is_fully_initialized(&self) -> bool {
        self.uninitialized.is_empty()
    }
}

impl<C: Connection> Session<C> {
    /// Fail unless `handle` may lazily load `property` right now.
    pub(crate) fn lazy_guard(&self, handle: EntityHandle, property: &str) -> Result<()> {
        let slot = self.slot(handle)?;
        let reason = if self.closed {
            Some(LazyFailure::SessionClosed)
        } else if !self.connected {
            Some(LazyFailure::Disconnected)
        } else if slot.detached || (slot.entry.is_none() && slot.is_initialized()) {
            Some(LazyFailure::Detached)
        } else {
            None
        };
        match reason {
            Some(reason) => Err(LazyInitializationError {
                entity: slot.entity_name().to_string(),
                property: property.to_string(),
                reason,
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Value of property `index`, loading it first if it is lazy and unfetched.
    ///
    /// An uninitialized placeholder is resolved first. To-one properties are
    /// returned as references without resolving the target; collections are
    /// initialized.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn property(
        &mut self,
        cx: &Cx,
        handle: EntityHandle,
        index: usize,
    ) -> Outcome<StateValue, Error> {
        let slot = try_result!(self.slot(handle));
        if !slot.is_initialized() {
            try_outcome!(self.resolve(cx, handle).await);
        }
        let prop = try_result!(self.property_info(handle, index));

        match prop.kind {
            PropertyKind::Collection { .. } => {
                let elements = try_outcome!(self.collection(cx, handle, index).await);
                Outcome::Ok(StateValue::Collection(LazyState::Loaded(elements)))
            }
            PropertyKind::ToOne { .. } => Outcome::Ok(try_result!(self.value(handle, index)).clone()),
            PropertyKind::Basic => {
                let current = try_result!(self.value(handle, index)).clone();
                if !matches!(current, StateValue::Unfetched) {
                    return Outcome::Ok(current);
                }
                try_result!(self.lazy_guard(handle, prop.name));
                try_outcome!(self.fetch_lazy_group(cx, handle, index).await);
                Outcome::Ok(try_result!(self.value(handle, index)).clone())
            }
        }
    }

    async fn fetch_lazy_group(
        &mut self,
        cx: &Cx,
        handle: EntityHandle,
        index: usize,
    ) -> Outcome<(), Error> {
        let slot = try_result!(self.slot_mut(handle));
        let access = match slot.interceptor.as_mut() {
            Some(interceptor) => interceptor.on_access(index),
            None => LazyAccess::Fetch(slot.shape().lazy_properties().collect()),
        };
        let properties = match access {
            LazyAccess::Loaded | LazyAccess::Reentrant => return Outcome::Ok(()),
            LazyAccess::Fetch(properties) => properties,
        };

        let persister = slot.persister.clone();
        let Some(id) = slot.id.clone() else {
            if let Some(interceptor) = slot.interceptor.as_mut() {
                interceptor.abort();
            }
            return Outcome::Err(Error::InvalidOperation(format!(
                "{} has no identifier to load lazy properties with",
                persister.shape().name
            )));
        };

        tracing::debug!(
            entity = persister.shape().name,
            id = %id,
            properties = ?properties,
            "Fetching lazy property group"
        );
        let statement = persister.lazy_load_statement(&id, &properties);
        self.counters.statements += 1;
        let row = match self.connection.query_one(cx, &statement).await {
            Outcome::Ok(row) => row,
            other => {
                if let Some(interceptor) = self
                    .store
                    .get_mut(handle)
                    .and_then(|s| s.interceptor.as_mut())
                {
                    interceptor.abort();
                }
                return match other {
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                    Outcome::Ok(_) => Outcome::Ok(()),
                };
            }
        };

        let slot = try_result!(self.slot_mut(handle));
        let Some(row) = row else {
            if let Some(interceptor) = slot.interceptor.as_mut() {
                interceptor.abort();
            }
            return Outcome::Err(Error::EntityNotFound {
                entity: persister.shape().name.to_string(),
                id,
            });
        };

        let shape = persister.shape();
        let mut fetched = Vec::with_capacity(properties.len());
        for (column, &property) in properties.iter().enumerate() {
            let value = row.get(column).cloned().unwrap_or(Value::Null);
            let snapshot = shape
                .property(property)
                .map_or_else(|| value.clone(), |p| p.ty.deep_copy(&value));
            if let Some(values) = slot.state.loaded_mut()
                && matches!(values.get(property), Some(StateValue::Unfetched))
            {
                values[property] = StateValue::Basic(value);
            }
            if let Some(loaded) = slot.entry.as_mut().and_then(|e| e.loaded_state.as_mut())
                && let Some(entry_value) = loaded.get_mut(property)
            {
                *entry_value = StateValue::Basic(snapshot);
            }
            fetched.push(property);
        }
        if let Some(interceptor) = slot.interceptor.as_mut() {
            interceptor.finish(&fetched);
        }
        self.counters.lazy_loads += 1;
        Outcome::Ok(())
    }

    /// Elements of collection `index`, initializing it first if needed.
    ///
    /// Elements come back as handles; elements not yet in the session are
    /// uninitialized placeholders.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn collection(
        &mut self,
        cx: &Cx,
        handle: EntityHandle,
        index: usize,
    ) -> Outcome<Vec<EntityHandle>, Error> {
        let slot = try_result!(self.slot(handle));
        if !slot.is_initialized() {
            try_outcome!(self.resolve(cx, handle).await);
        }
        if let Some(elements) = try_result!(self.value(handle, index)).elements() {
            return Outcome::Ok(elements.to_vec());
        }
        let prop = try_result!(self.property_info(handle, index));
        try_result!(self.lazy_guard(handle, prop.name));

        let tasks = try_outcome!(self.initialize_collection(cx, handle, index).await);
        try_outcome!(self.fetch_all(cx, tasks).await);
        let elements = try_result!(self.value(handle, index))
            .elements()
            .map(<[EntityHandle]>::to_vec)
            .unwrap_or_default();
        Outcome::Ok(elements)
    }

    /// Load the elements of collection `index` of `owner`.
    ///
    /// Returns fetch tasks for the elements when the collection is eager.
    pub(crate) async fn initialize_collection(
        &mut self,
        cx: &Cx,
        owner: EntityHandle,
        index: usize,
    ) -> Outcome<Vec<FetchTask>, Error> {
        let prop = try_result!(self.property_info(owner, index));
        let PropertyKind::Collection { element, .. } = prop.kind else {
            return Outcome::Err(Error::InvalidOperation(format!(
                "{} is not a collection",
                prop.name
            )));
        };
        let slot = try_result!(self.slot(owner));
        let entity_name = slot.entity_name();
        let owner_id = match slot.values().and_then(|v| v.get(index)) {
            Some(StateValue::Collection(LazyState::Loaded(_))) => return Outcome::Ok(Vec::new()),
            Some(StateValue::Collection(LazyState::Unloaded(key))) => key.clone(),
            Some(StateValue::Collection(LazyState::Loading)) => {
                return Outcome::Err(Error::InvalidOperation(format!(
                    "{entity_name}.{} is already being initialized",
                    prop.name
                )));
            }
            _ => {
                return Outcome::Err(Error::InvalidOperation(format!(
                    "{entity_name}.{} holds no collection",
                    prop.name
                )));
            }
        };

        let role = format!("{entity_name}.{}", prop.name);
        let Some(persister) = self.factory.collection_persister(&role).cloned() else {
            return Outcome::Err(Error::Mapping(format!(
                "collection '{role}' has no collection persister"
            )));
        };

        if let Some(values) = self.store.get_mut(owner).and_then(|s| s.values_mut()) {
            values[index] = StateValue::Collection(LazyState::Loading);
        }

        tracing::debug!(role = %role, owner = %owner_id, "Initializing collection");
        let statement = persister.load_statement(&owner_id);
        self.counters.statements += 1;
        let rows = match self.connection.query(cx, &statement).await {
            Outcome::Ok(rows) => rows,
            other => {
                if let Some(values) = self.store.get_mut(owner).and_then(|s| s.values_mut()) {
                    values[index] = StateValue::Collection(LazyState::Unloaded(owner_id));
                }
                return match other {
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                    Outcome::Ok(_) => Outcome::Ok(Vec::new()),
                };
            }
        };

        let mut elements = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.first();
            if id.is_null() {
                continue;
            }
            let element_handle = try_result!(self.reference(element, id));
            if !elements.contains(&element_handle) {
                elements.push(element_handle);
            }
        }

        let slot = try_result!(self.slot_mut(owner));
        if let Some(values) = slot.values_mut() {
            values[index] = StateValue::Collection(LazyState::Loaded(elements.clone()));
        }
        if let Some(entry) = slot.collections.get_mut(&index) {
            entry.post_initialize(&elements);
        }
        self.counters.lazy_loads += 1;

        let tasks = if prop.lazy {
            Vec::new()
        } else {
            elements.into_iter().map(FetchTask::Entity).collect()
        };
        Outcome::Ok(tasks)
    }
}
