//! Per-instance bookkeeping: entity entries and collection entries.

use crate::entity::{EntityHandle, StateValue};
use serde::Serialize;
use std::fmt;
use unitwork_core::{Error, LockMode, Result, Value};

/// Lifecycle status of a managed entity.
///
/// Transitions are one-directional except `Managed <-> ReadOnly`:
///
/// ```text
/// Managed <-> ReadOnly
///    \          /
///     Deleted --> Gone
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Status {
    Managed,
    ReadOnly,
    /// Scheduled for deletion; the row still exists.
    Deleted,
    /// Delete executed during the current flush.
    Gone,
}

impl Status {
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Managed => "managed",
            Status::ReadOnly => "read_only",
            Status::Deleted => "deleted",
            Status::Gone => "gone",
        }
    }

    pub const fn can_transition_to(self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Managed, Status::ReadOnly)
                | (Status::ReadOnly, Status::Managed)
                | (Status::Managed | Status::ReadOnly, Status::Deleted)
                | (Status::Deleted, Status::Gone)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger record for one managed entity instance.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub(crate) status: Status,
    /// Status before deletion was scheduled.
    pub(crate) previous_status: Option<Status>,
    /// Snapshot taken at load or at the last successful write. `None` until
    /// the row exists.
    pub(crate) loaded_state: Option<Vec<StateValue>>,
    pub(crate) lock_mode: LockMode,
    pub(crate) version: Option<Value>,
    pub(crate) id: Option<Value>,
    pub(crate) entity_name: &'static str,
    pub(crate) exists_in_database: bool,
    /// Increment the version at the next flush even without dirty properties.
    pub(crate) force_increment: bool,
    /// Re-read the version at commit and fail if it moved.
    pub(crate) verify_version: bool,
}

impl EntityEntry {
    /// Entry for a row just read from storage.
    pub(crate) fn loaded(
        entity_name: &'static str,
        id: Value,
        state: Vec<StateValue>,
        version: Option<Value>,
        status: Status,
    ) -> Self {
        Self {
            status,
            previous_status: None,
            loaded_state: Some(state),
            lock_mode: LockMode::Read,
            version,
            id: Some(id),
            entity_name,
            exists_in_database: true,
            force_increment: false,
            verify_version: false,
        }
    }

    /// Entry for an instance scheduled for insertion.
    pub(crate) fn pending_insert(
        entity_name: &'static str,
        id: Option<Value>,
        version: Option<Value>,
    ) -> Self {
        Self {
            status: Status::Managed,
            previous_status: None,
            loaded_state: None,
            lock_mode: LockMode::Write,
            version,
            id,
            entity_name,
            exists_in_database: false,
            force_increment: false,
            verify_version: false,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn loaded_state(&self) -> Option<&[StateValue]> {
        self.loaded_state.as_deref()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn entity_name(&self) -> &'static str {
        self.entity_name
    }

    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    pub fn is_read_only(&self) -> bool {
        self.status == Status::ReadOnly
    }

    /// Deleted or gone: the instance no longer participates in dirty checking.
    pub fn is_removed(&self) -> bool {
        matches!(self.status, Status::Deleted | Status::Gone)
    }

    pub(crate) fn transition(&mut self, next: Status) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidOperation(format!(
                "{} cannot move from {} to {}",
                self.entity_name, self.status, next
            )));
        }
        if next == Status::Deleted {
            self.previous_status = Some(self.status);
        }
        self.status = next;
        Ok(())
    }

    /// Raise the held lock; locks are never downgraded inside a transaction.
    pub(crate) fn upgrade_lock(&mut self, mode: LockMode) {
        if mode.greater_than(self.lock_mode) {
            self.lock_mode = mode;
        }
    }

    pub(crate) fn post_insert(&mut self, id: Value, state: Vec<StateValue>, version: Option<Value>) {
        self.id = Some(id);
        self.loaded_state = Some(state);
        self.version = version;
        self.exists_in_database = true;
    }

    pub(crate) fn post_update(&mut self, written: &[(usize, StateValue)], version: Option<Value>) {
        if let Some(snapshot) = self.loaded_state.as_mut() {
            for (index, value) in written {
                if let Some(slot) = snapshot.get_mut(*index) {
                    *slot = value.clone();
                }
            }
        }
        if version.is_some() {
            self.version = version;
        }
        self.force_increment = false;
    }

    pub(crate) fn post_delete(&mut self) {
        self.status = Status::Gone;
        self.exists_in_database = false;
    }
}

/// Collection role: owning entity plus property name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionRole {
    pub entity: &'static str,
    pub property: &'static str,
}

impl fmt::Display for CollectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.property)
    }
}

/// Ledger record for one collection instance owned by a managed entity.
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    pub(crate) role: CollectionRole,
    pub(crate) owner_id: Option<Value>,
    /// Elements at load or at the last successful flush.
    pub(crate) snapshot: Option<Vec<EntityHandle>>,
    pub(crate) initialized: bool,
    /// Mutated through the session since the last flush.
    pub(crate) dirty: bool,
    /// Rows for this collection may exist in storage.
    pub(crate) exists_in_database: bool,
}

impl CollectionEntry {
    /// Entry for the collection of a row read from storage. Not yet initialized.
    pub(crate) fn loaded(role: CollectionRole, owner_id: Value) -> Self {
        Self {
            role,
            owner_id: Some(owner_id),
            snapshot: None,
            initialized: false,
            dirty: false,
            exists_in_database: true,
        }
    }

    /// Entry for the collection of an instance scheduled for insertion.
    pub(crate) fn pending(role: CollectionRole, owner_id: Option<Value>) -> Self {
        Self {
            role,
            owner_id,
            snapshot: None,
            initialized: true,
            dirty: true,
            exists_in_database: false,
        }
    }

    pub fn role(&self) -> CollectionRole {
        self.role
    }

    pub fn owner_id(&self) -> Option<&Value> {
        self.owner_id.as_ref()
    }

    pub fn snapshot(&self) -> Option<&[EntityHandle]> {
        self.snapshot.as_deref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn post_initialize(&mut self, elements: &[EntityHandle]) {
        self.snapshot = Some(elements.to_vec());
        self.initialized = true;
        self.dirty = false;
    }

    pub(crate) fn post_flush(&mut self, current: &[EntityHandle]) {
        self.snapshot = Some(current.to_vec());
        self.dirty = false;
        self.exists_in_database = true;
    }

    /// Whether `current` differs from the snapshot.
    pub fn differs_from(&self, current: &[EntityHandle]) -> bool {
        if !self.initialized {
            return false;
        }
        match &self.snapshot {
            Some(snapshot) => {
                snapshot.len() != current.len()
                    || snapshot.iter().any(|h| !current.contains(h))
                    || current.iter().any(|h| !snapshot.contains(h))
            }
            None => !current.is_empty(),
        }
    }

    /// Elements added and removed relative to the snapshot.
    pub fn diff(&self, current: &[EntityHandle]) -> (Vec<EntityHandle>, Vec<EntityHandle>) {
        let snapshot = self.snapshot.as_deref().unwrap_or(&[]);
        let added = current
            .iter()
            .filter(|h| !snapshot.contains(h))
            .copied()
            .collect();
        let removed = snapshot
            .iter()
            .filter(|h| !current.contains(h))
            .copied()
            .collect();
        (added, removed)
    }

    /// Elements present in the snapshot but no longer in the collection.
    pub fn orphans(&self, current: &[EntityHandle]) -> Vec<EntityHandle> {
        self.diff(current).1
    }
}
