//! Persister abstraction.
//!
//! A persister turns entity state into [`Statement`]s for one entity shape
//! (or one collection role). The unit of work never renders SQL itself; it
//! hands persisters flattened property values and executes whatever they
//! produce through a [`crate::Connection`].
//!
//! # Value conventions
//!
//! `values` slices passed to a persister always have one entry per property
//! of the shape, in property-index order:
//!
//! - basic properties carry their current value (`NULL` for an unfetched lazy property);
//! - to-one associations carry the identifier of the referenced entity, or `NULL`;
//! - collections carry `NULL` (collections are written by their own persister).
//!
//! Rows returned for [`EntityPersister::load_statement`] follow the same
//! layout. Rows for [`EntityPersister::lazy_load_statement`] contain the
//! requested properties in the requested order.

use crate::lock::LockMode;
use crate::shape::EntityShape;
use crate::value::Value;

/// What a statement does, as far as the unit of work is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    Select,
    Lock,
}

/// An opaque, fully bound statement produced by a persister.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    /// Entity name or collection role the statement belongs to.
    pub target: &'static str,
    pub sql: String,
    pub params: Vec<Value>,
    /// Row count the statement must report; a mismatch is a stale-state failure.
    pub expected_rows: Option<u64>,
}

impl Statement {
    pub fn new(kind: StatementKind, target: &'static str, sql: impl Into<String>) -> Self {
        Self {
            kind,
            target,
            sql: sql.into(),
            params: Vec::new(),
            expected_rows: None,
        }
    }

    pub fn bind(mut self, value: Value) -> Self {
        self.params.push(value);
        self
    }

    pub fn bind_all(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.params.extend(values);
        self
    }

    pub fn expect_rows(mut self, rows: u64) -> Self {
        self.expected_rows = Some(rows);
        self
    }

    /// Statements with the same kind, target and SQL text can share a batch.
    pub fn same_shape(&self, other: &Statement) -> bool {
        self.kind == other.kind && self.target == other.target && self.sql == other.sql
    }
}

/// Inputs of an UPDATE.
#[derive(Debug, Clone, Copy)]
pub struct UpdateSpec<'a> {
    pub id: &'a Value,
    /// Indices of the properties to write.
    pub changed: &'a [usize],
    /// Full property values (see module docs); only `changed` entries are written.
    pub values: &'a [Value],
    /// Version the row must still have.
    pub expected_version: Option<&'a Value>,
    /// Previous values the row must still have (dirty/all optimistic locking).
    pub lock_state: &'a [(usize, Value)],
}

/// Inputs of a DELETE.
#[derive(Debug, Clone, Copy)]
pub struct DeleteSpec<'a> {
    pub id: &'a Value,
    pub expected_version: Option<&'a Value>,
    pub lock_state: &'a [(usize, Value)],
}

/// Statement factory for one entity shape.
///
/// Persisters are shared, immutable configuration: every unit of work opened
/// from the same factory consults the same instance concurrently.
pub trait EntityPersister: Send + Sync {
    fn shape(&self) -> &EntityShape;

    /// INSERT of a new row. `id` is `None` for identity generation, in which
    /// case the connection's `insert` reports the generated identifier.
    fn insert_statement(&self, id: Option<&Value>, values: &[Value]) -> Statement;

    fn update_statement(&self, update: &UpdateSpec<'_>) -> Statement;

    fn delete_statement(&self, delete: &DeleteSpec<'_>) -> Statement;

    /// SELECT of one row by identifier.
    fn load_statement(&self, id: &Value) -> Statement;

    /// SELECT of the given lazy properties of one row.
    fn lazy_load_statement(&self, id: &Value, properties: &[usize]) -> Statement;

    /// SELECT of the current version of one row. Returns a one-column row.
    fn version_statement(&self, id: &Value) -> Statement;

    /// Statement acquiring a pessimistic lock on one row.
    fn lock_statement(&self, id: &Value, mode: LockMode) -> Statement;

    /// SELECT of the identifier for a natural id. Returns a one-column row.
    fn natural_id_statement(&self, _values: &[Value]) -> Option<Statement> {
        None
    }

    /// Statement returning the next identifier for sequence generation.
    fn next_id_statement(&self) -> Option<Statement> {
        None
    }

    /// Whether same-shape statements of this persister may be batched.
    fn supports_batching(&self) -> bool {
        true
    }
}

/// Statement factory for one collection role (`Entity.property`).
///
/// Collections mapped by the element side (inverse collections) only need
/// [`CollectionPersister::load_statement`]; the write methods default to
/// producing nothing.
pub trait CollectionPersister: Send + Sync {
    /// Role name, `Entity.property`.
    fn role(&self) -> &'static str;

    /// SELECT of the element identifiers owned by `owner_id`, one per row.
    fn load_statement(&self, owner_id: &Value) -> Statement;

    fn recreate_statements(&self, _owner_id: &Value, _elements: &[Value]) -> Vec<Statement> {
        Vec::new()
    }

    fn remove_statements(&self, _owner_id: &Value) -> Vec<Statement> {
        Vec::new()
    }

    fn delete_rows_statements(&self, _owner_id: &Value, _removed: &[Value]) -> Vec<Statement> {
        Vec::new()
    }

    fn insert_rows_statements(&self, _owner_id: &Value, _added: &[Value]) -> Vec<Statement> {
        Vec::new()
    }

    fn supports_batching(&self) -> bool {
        true
    }
}
