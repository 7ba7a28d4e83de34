//! Error types for unit-of-work operations.

use crate::action::ActionSummary;
use crate::value::Value;
use std::fmt;
use thiserror::Error as ThisError;

/// The primary error type for all unit-of-work operations.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A second, distinct instance was registered under an identity already tracked.
    #[error("{entity}#{id} is already managed by this unit of work as a different instance")]
    AlreadyManaged { entity: String, id: Value },

    /// Lazy load attempted outside an open, connected unit of work.
    #[error(transparent)]
    LazyInitialization(#[from] LazyInitializationError),

    /// Forced resolution of a reference whose row does not exist.
    #[error("no row exists for {entity}#{id}")]
    EntityNotFound { entity: String, id: Value },

    /// Version or row-count mismatch detected while executing a write.
    #[error(transparent)]
    StaleState(#[from] StaleStateError),

    /// Cascade cycle or conflicting orphan-removal decision.
    #[error(transparent)]
    Cascade(#[from] CascadeError),

    /// First failing action of a flush plus what already executed.
    #[error(transparent)]
    Flush(Box<FlushError>),

    /// A listener rejected an action before it executed.
    #[error(transparent)]
    Vetoed(Box<VetoedActionError>),

    /// A managed entity references a transient one through a non-cascading association.
    #[error("{entity}.{property} references an unsaved transient {target} instance")]
    TransientReference {
        entity: String,
        property: String,
        target: String,
    },

    /// A detached instance was passed where a transient or managed one is required.
    #[error("detached entity {entity} passed to {operation}")]
    DetachedEntity {
        entity: String,
        id: Option<Value>,
        operation: &'static str,
    },

    /// An instance scheduled for deletion would be re-saved.
    #[error("{entity}#{id} is scheduled for deletion and would be re-saved")]
    ObjectDeleted { entity: String, id: Value },

    /// An immutable natural id was changed on a managed entity.
    #[error("immutable natural id of {entity}#{id} was altered")]
    ImmutableNaturalId { entity: String, id: Value },

    /// No identifier could be assigned.
    #[error("cannot generate identifier for {entity}: {message}")]
    IdentifierGeneration { entity: String, message: String },

    /// Invalid or inconsistent entity metadata.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure reported by the storage connection.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The unit of work has been closed.
    #[error("session is closed")]
    SessionClosed,

    /// A previous flush failed; only rollback or close are permitted.
    #[error("a previous flush failed; the unit of work must be rolled back")]
    FlushFailed,

    /// Transaction boundary misuse.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Operation not valid for the entity's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Operation was cancelled via asupersync.
    #[error("operation was cancelled")]
    Cancelled,
}

/// Why a lazy load could not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyFailure {
    SessionClosed,
    Disconnected,
    Detached,
}

impl fmt::Display for LazyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LazyFailure::SessionClosed => f.write_str("the session is closed"),
            LazyFailure::Disconnected => f.write_str("the session is disconnected"),
            LazyFailure::Detached => f.write_str("the owning entity is not managed"),
        }
    }
}

#[derive(Debug, Clone, ThisError)]
#[error("could not initialize {entity}.{property}: {reason}")]
pub struct LazyInitializationError {
    pub entity: String,
    pub property: String,
    pub reason: LazyFailure,
}

#[derive(Debug, Clone, ThisError)]
#[error(
    "{entity}#{id} was updated or deleted concurrently (expected {expected} row(s), got {actual})"
)]
pub struct StaleStateError {
    pub entity: String,
    pub id: Value,
    pub expected: u64,
    pub actual: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeErrorKind {
    /// Rows reference each other through non-nullable foreign keys.
    Cycle,
    /// An orphan is still reachable through another cascading association.
    OrphanConflict,
}

#[derive(Debug, Clone, ThisError)]
#[error("cascade error at {entity}{}: {message}", id_suffix(.id))]
pub struct CascadeError {
    pub kind: CascadeErrorKind,
    pub entity: String,
    pub id: Option<Value>,
    pub message: String,
}

fn id_suffix(id: &Option<Value>) -> String {
    id.as_ref().map(|id| format!("#{id}")).unwrap_or_default()
}

#[derive(Debug, ThisError)]
#[error(
    "flush failed{}: {source} ({} action(s) already executed)",
    .failed.as_ref().map(|a| format!(" at {a}")).unwrap_or_default(),
    .executed.len()
)]
pub struct FlushError {
    #[source]
    pub source: Error,
    pub failed: Option<ActionSummary>,
    pub executed: Vec<ActionSummary>,
}

#[derive(Debug, Clone, ThisError)]
#[error("{action} was vetoed: {reason}")]
pub struct VetoedActionError {
    pub action: ActionSummary,
    pub reason: String,
    pub executed: Vec<ActionSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Connection lost or unusable
    Connection,
    /// The driver could not execute a batch as a batch
    Batch,
    /// Other statement failure
    Statement,
}

#[derive(Debug, Clone, ThisError)]
#[error("storage error ({kind:?}): {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
    pub sql: Option<String>,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            sql: None,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}

impl Error {
    /// Wrap a failure that happened while executing a flush.
    pub fn flush(source: Error, failed: Option<ActionSummary>, executed: Vec<ActionSummary>) -> Self {
        Error::Flush(Box::new(FlushError {
            source,
            failed,
            executed,
        }))
    }

    /// The underlying error, looking through [`FlushError`] wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Flush(flush) => flush.source.root_cause(),
            other => other,
        }
    }

    pub fn is_stale_state(&self) -> bool {
        matches!(self.root_cause(), Error::StaleState(_))
    }

    pub fn is_vetoed(&self) -> bool {
        matches!(self.root_cause(), Error::Vetoed(_))
    }

    pub fn is_lazy_initialization(&self) -> bool {
        matches!(self.root_cause(), Error::LazyInitialization(_))
    }

    /// A driver-level batching failure; the statements may be retried one by one.
    pub fn is_batch_failure(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::Storage(StorageError {
                kind: StorageErrorKind::Batch,
                ..
            })
        )
    }

    /// Actions that completed before a flush failed or was vetoed.
    pub fn executed_actions(&self) -> &[ActionSummary] {
        match self {
            Error::Flush(flush) => &flush.executed,
            Error::Vetoed(veto) => &veto.executed,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
