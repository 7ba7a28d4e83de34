//! Descriptors of flush actions.
//!
//! These are the externally visible records of what a flush did (or was about
//! to do). They carry identity and property indices only, never entity state.

use crate::value::Value;
use serde::Serialize;
use std::fmt;

/// Kind of pending work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ActionKind {
    Insert,
    Update,
    Delete,
    CollectionRecreate,
    CollectionUpdate,
    CollectionRemove,
}

impl ActionKind {
    /// Whether this action targets a collection rather than an entity row.
    pub const fn is_collection(self) -> bool {
        matches!(
            self,
            ActionKind::CollectionRecreate
                | ActionKind::CollectionUpdate
                | ActionKind::CollectionRemove
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ActionKind::Insert => "insert",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
            ActionKind::CollectionRecreate => "collection-recreate",
            ActionKind::CollectionUpdate => "collection-update",
            ActionKind::CollectionRemove => "collection-remove",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an executed, failed or vetoed action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSummary {
    pub kind: ActionKind,
    /// Entity name, or collection role (`Entity.property`) for collection actions.
    pub target: String,
    /// Identifier of the entity (or owning entity). `None` before an identity insert.
    pub id: Option<Value>,
    /// Property indices written by an update.
    pub properties: Vec<usize>,
}

impl ActionSummary {
    pub fn new(kind: ActionKind, target: impl Into<String>, id: Option<Value>) -> Self {
        Self {
            kind,
            target: target.into(),
            id,
            properties: Vec::new(),
        }
    }

    pub fn with_properties(mut self, properties: Vec<usize>) -> Self {
        self.properties = properties;
        self
    }
}

impl fmt::Display for ActionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{} {}#{}", self.kind, self.target, id),
            None => write!(f, "{} {}#<unassigned>", self.kind, self.target),
        }
    }
}
