//! Session factory: the immutable, shared registry of persisters, listeners
//! and options from which units of work are opened.

use crate::events::EntityListener;
use crate::{FlushMode, Session};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use unitwork_core::{
    CollectionPersister, Connection, EntityPersister, Error, PropertyKind, Result,
};

/// Factory-wide options.
///
/// Deserializable so deployments can keep them in a JSON document:
///
/// ```ignore
/// let options = SessionFactoryOptions::from_json(r#"{ "jdbc_batch_size": 50, "order_inserts": true }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFactoryOptions {
    /// Maximum statements per batch. `0` or `1` disables batching.
    pub jdbc_batch_size: usize,
    /// Group inserts of the same entity so they batch.
    pub order_inserts: bool,
    /// Sort updates by entity and identifier.
    pub order_updates: bool,
    pub default_flush_mode: FlushMode,
    /// Entities loaded by new sessions start read-only.
    pub default_read_only: bool,
    /// Begin a transaction implicitly on the first flush.
    pub auto_begin: bool,
}

impl Default for SessionFactoryOptions {
    fn default() -> Self {
        Self {
            jdbc_batch_size: 25,
            order_inserts: false,
            order_updates: false,
            default_flush_mode: FlushMode::Auto,
            default_read_only: false,
            auto_begin: true,
        }
    }
}

impl SessionFactoryOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Shared, immutable configuration for units of work.
///
/// Build one per application with [`SessionFactory::builder`], then open a
/// [`Session`] per unit of work. The factory is `Send + Sync` and may be used
/// from any number of threads.
pub struct SessionFactory {
    entities: HashMap<&'static str, Arc<dyn EntityPersister>>,
    collections: HashMap<String, Arc<dyn CollectionPersister>>,
    listeners: Vec<Arc<dyn EntityListener>>,
    options: SessionFactoryOptions,
    closed: AtomicBool,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entities: Vec<&&str> = self.entities.keys().collect();
        entities.sort();
        f.debug_struct("SessionFactory")
            .field("entities", &entities)
            .field("collections", &self.collections.len())
            .field("listeners", &self.listeners.len())
            .field("options", &self.options)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionFactory {
    pub fn builder() -> SessionFactoryBuilder {
        SessionFactoryBuilder::default()
    }

    /// Open a unit of work on `connection`.
    pub fn open_session<C: Connection>(self: &Arc<Self>, connection: C) -> Result<Session<C>> {
        if self.is_closed() {
            return Err(Error::InvalidOperation(
                "session factory is closed".to_string(),
            ));
        }
        Ok(Session::new(Arc::clone(self), connection))
    }

    /// Refuse to open further sessions. Open sessions are unaffected.
    pub fn close(&self) {
        tracing::info!("Closing session factory");
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn options(&self) -> &SessionFactoryOptions {
        &self.options
    }

    pub fn persister(&self, entity: &str) -> Result<&Arc<dyn EntityPersister>> {
        self.entities
            .get(entity)
            .ok_or_else(|| Error::Mapping(format!("unknown entity '{entity}'")))
    }

    /// Persister for the collection role `Entity.property`.
    pub fn collection_persister(&self, role: &str) -> Option<&Arc<dyn CollectionPersister>> {
        self.collections.get(role)
    }

    pub fn listeners(&self) -> &[Arc<dyn EntityListener>] {
        &self.listeners
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entities.keys().copied()
    }
}

/// Builder for [`SessionFactory`].
#[derive(Default)]
pub struct SessionFactoryBuilder {
    entities: Vec<Arc<dyn EntityPersister>>,
    collections: Vec<Arc<dyn CollectionPersister>>,
    listeners: Vec<Arc<dyn EntityListener>>,
    options: SessionFactoryOptions,
}

impl SessionFactoryBuilder {
    #[must_use]
    pub fn entity(mut self, persister: Arc<dyn EntityPersister>) -> Self {
        self.entities.push(persister);
        self
    }

    #[must_use]
    pub fn collection(mut self, persister: Arc<dyn CollectionPersister>) -> Self {
        self.collections.push(persister);
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn EntityListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    #[must_use]
    pub fn options(mut self, options: SessionFactoryOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the mapping and build the factory.
    ///
    /// Fails with [`Error::Mapping`] if a shape is inconsistent, an entity or
    /// role is registered twice, an association targets an unregistered
    /// entity, a non-inverse collection has no collection persister, or a
    /// subtype's root is not registered.
    #[tracing::instrument(level = "info", skip(self), fields(entities = self.entities.len()))]
    pub fn build(self) -> Result<Arc<SessionFactory>> {
        let mut entities: HashMap<&'static str, Arc<dyn EntityPersister>> = HashMap::new();
        for persister in self.entities {
            let shape = persister.shape();
            shape.validate()?;
            if entities.insert(shape.name, Arc::clone(&persister)).is_some() {
                return Err(Error::Mapping(format!(
                    "entity '{}' registered twice",
                    shape.name
                )));
            }
        }

        let mut collections: HashMap<String, Arc<dyn CollectionPersister>> = HashMap::new();
        for persister in self.collections {
            let role = persister.role();
            if collections.insert(role.to_string(), persister).is_some() {
                return Err(Error::Mapping(format!("collection role '{role}' registered twice")));
            }
        }

        for persister in entities.values() {
            let shape = persister.shape();
            if let Some(root) = shape.root
                && !entities.contains_key(root)
            {
                return Err(Error::Mapping(format!(
                    "{}: root entity '{root}' is not registered",
                    shape.name
                )));
            }
            for (_, prop) in shape.associations() {
                let Some(target) = prop.associated_entity() else {
                    continue;
                };
                if !entities.contains_key(target) {
                    return Err(Error::Mapping(format!(
                        "{}.{} targets unregistered entity '{target}'",
                        shape.name, prop.name
                    )));
                }
                if let PropertyKind::Collection { .. } = prop.kind {
                    let role = format!("{}.{}", shape.name, prop.name);
                    if !collections.contains_key(&role) {
                        return Err(Error::Mapping(format!(
                            "collection '{role}' has no collection persister"
                        )));
                    }
                }
            }
        }

        if let Some(role) = collections.keys().find(|role| {
            role.split_once('.').is_none_or(|(entity, property)| {
                entities
                    .get(entity)
                    .is_none_or(|p| p.shape().property_index(property).is_none())
            })
        }) {
            return Err(Error::Mapping(format!(
                "collection persister '{role}' does not match a mapped collection"
            )));
        }

        tracing::info!(
            entities = entities.len(),
            collections = collections.len(),
            listeners = self.listeners.len(),
            "Session factory built"
        );

        Ok(Arc::new(SessionFactory {
            entities,
            collections,
            listeners: self.listeners,
            options: self.options,
            closed: AtomicBool::new(false),
        }))
    }
}
