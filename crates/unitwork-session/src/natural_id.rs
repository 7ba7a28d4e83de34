//! Natural-id cross references.
//!
//! Maps `(root entity, natural id values)` to identifiers and back, so a
//! natural-id lookup for an entity already in the session needs no query.
//! Natural ids with a NULL component never match anything and are never
//! cached.

use crate::entity::{EntityHandle, StateValue};
use crate::identity_map::{EntityKey, normalize_id};
use crate::{FlushMode, Session};
use std::collections::HashMap;
use unitwork_core::{Connection, Cx, EntityShape, Error, Outcome, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NaturalKey {
    root: &'static str,
    values: Vec<Value>,
}

/// Natural-id resolutions known to one unit of work.
#[derive(Debug, Default)]
pub struct NaturalIdResolutions {
    by_natural: HashMap<NaturalKey, Value>,
    by_id: HashMap<EntityKey, Vec<Value>>,
}

impl NaturalIdResolutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `values` identify the row `key`.
    ///
    /// Replaces any earlier resolution for the same row. Returns `false` (and
    /// records nothing) if a component is NULL.
    pub fn cache(&mut self, key: &EntityKey, values: Vec<Value>) -> bool {
        if values.iter().any(Value::is_null) {
            return false;
        }
        let values: Vec<Value> = values.into_iter().map(normalize_id).collect();
        self.remove(key);
        self.by_natural.insert(
            NaturalKey {
                root: key.root,
                values: values.clone(),
            },
            key.id.clone(),
        );
        self.by_id.insert(key.clone(), values);
        true
    }

    /// Identifier of the row with natural id `values`, if known.
    pub fn find(&self, root: &'static str, values: &[Value]) -> Option<&Value> {
        if values.iter().any(Value::is_null) {
            return None;
        }
        self.by_natural.get(&NaturalKey {
            root,
            values: values.iter().cloned().map(normalize_id).collect(),
        })
    }

    /// Natural id cached for `key`.
    pub fn natural_id_of(&self, key: &EntityKey) -> Option<&[Value]> {
        self.by_id.get(key).map(Vec::as_slice)
    }

    pub fn remove(&mut self, key: &EntityKey) {
        if let Some(values) = self.by_id.remove(key) {
            self.by_natural.remove(&NaturalKey {
                root: key.root,
                values,
            });
        }
    }

    pub fn clear(&mut self) {
        self.by_natural.clear();
        self.by_id.clear();
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl<C: Connection> Session<C> {
    /// Managed instance whose natural id is `values`.
    ///
    /// Resolutions already known to the session answer without a query.
    /// Otherwise pending changes are flushed first in `Auto` and `Always`
    /// mode, so rows inserted by this unit of work are found.
    #[tracing::instrument(level = "debug", skip(self, cx, values))]
    pub async fn find_by_natural_id(
        &mut self,
        cx: &Cx,
        entity: &str,
        values: &[Value],
    ) -> Outcome<Option<EntityHandle>, Error> {
        try_result!(self.ensure_usable());
        let persister = std::sync::Arc::clone(try_result!(self.factory.persister(entity)));
        let shape = persister.shape();
        let Some(info) = shape.natural_id else {
            return Outcome::Err(Error::InvalidOperation(format!(
                "{entity} declares no natural id"
            )));
        };
        if values.len() != info.properties.len() {
            return Outcome::Err(Error::InvalidOperation(format!(
                "{entity} natural id has {} components, got {}",
                info.properties.len(),
                values.len()
            )));
        }
        if values.iter().any(Value::is_null) {
            return Outcome::Ok(None);
        }

        let root = shape.root_name();
        if let Some(id) = self.natural_ids.find(root, values).cloned() {
            return self.get(cx, entity, id).await;
        }
        let flush = match self.config.flush_mode {
            FlushMode::Auto => self.is_dirty(),
            FlushMode::Always => true,
            FlushMode::Commit | FlushMode::Manual => false,
        };
        if flush {
            try_outcome!(self.flush(cx).await);
            if let Some(id) = self.natural_ids.find(root, values).cloned() {
                return self.get(cx, entity, id).await;
            }
        }

        try_result!(self.ensure_connected());
        let Some(statement) = persister.natural_id_statement(values) else {
            return Outcome::Err(Error::InvalidOperation(format!(
                "no natural id lookup is mapped for {entity}"
            )));
        };
        self.counters.statements += 1;
        let row = try_outcome!(self.connection.query_one(cx, &statement).await);
        match row.map(|row| row.first()) {
            Some(id) if !id.is_null() => self.get(cx, entity, id).await,
            _ => {
                tracing::debug!(entity, "No row for natural id");
                Outcome::Ok(None)
            }
        }
    }
}

/// Natural id values of `state`, or `None` if the shape declares none or a
/// component is NULL or unfetched.
pub(crate) fn natural_id_values(shape: &EntityShape, state: &[StateValue]) -> Option<Vec<Value>> {
    let info = shape.natural_id?;
    info.properties
        .iter()
        .map(|&i| match state.get(i)? {
            StateValue::Basic(v) if !v.is_null() => Some(v.clone()),
            _ => None,
        })
        .collect()
}
