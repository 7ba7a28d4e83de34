//! Core types and traits for unitwork.
//!
//! This crate provides the building blocks the unit of work consumes:
//!
//! - [`Value`] for identifiers, property state and statement parameters
//! - [`PropertyType`] for snapshot comparison and copying
//! - [`EntityShape`] / [`PropertyInfo`] property-index tables
//! - [`EntityPersister`] / [`CollectionPersister`] statement factories
//! - [`Connection`] for executing statements inside a transaction
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod action;
pub mod association;
pub mod connection;
pub mod error;
pub mod lock;
pub mod persister;
pub mod row;
pub mod shape;
pub mod types;
pub mod value;

pub use action::{ActionKind, ActionSummary};
pub use association::{CascadeAction, CascadeStyle, LazyState};
pub use connection::Connection;
pub use error::{
    CascadeError, CascadeErrorKind, Error, FlushError, LazyFailure, LazyInitializationError,
    Result, StaleStateError, StorageError, StorageErrorKind, VetoedActionError,
};
pub use lock::LockMode;
pub use persister::{
    CollectionPersister, DeleteSpec, EntityPersister, Statement, StatementKind, UpdateSpec,
};
pub use row::Row;
pub use shape::{
    EntityShape, IdGeneration, NaturalIdInfo, OptimisticLockStyle, PropertyInfo, PropertyKind,
};
pub use types::PropertyType;
pub use value::Value;
