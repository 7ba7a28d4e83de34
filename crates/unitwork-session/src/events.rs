//! Entity lifecycle listeners and session lifecycle callbacks.
//!
//! Listeners are registered on the [`crate::SessionFactory`] and observe every
//! unit of work it opens. `pre_*` hooks run immediately before the statement
//! for an action is executed and can veto it; `post_*` hooks run after it
//! succeeded. Session callbacks are registered per session and bracket flush,
//! commit and rollback.

use unitwork_core::{Error, Value};

/// A listener's answer to a pre-event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Veto {
    #[default]
    Allow,
    /// Reject the action. The flush fails with [`Error::Vetoed`].
    Reject(String),
}

impl Veto {
    pub fn reject(reason: impl Into<String>) -> Self {
        Veto::Reject(reason.into())
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Veto::Reject(_))
    }
}

/// Read-only view of an entity write handed to listeners.
#[derive(Debug, Clone, Copy)]
pub struct EntityEvent<'a> {
    pub entity: &'static str,
    /// `None` for an insert whose identifier the storage generates.
    pub id: Option<&'a Value>,
    /// Column values, one per property (see [`unitwork_core::persister`]).
    pub state: &'a [Value],
    /// Properties written by an update.
    pub properties: &'a [usize],
}

/// Entity lifecycle hooks. Every method defaults to doing nothing.
///
/// Implementations are shared by all sessions of a factory and must not
/// assume anything about which session calls them.
pub trait EntityListener: Send + Sync {
    fn pre_insert(&self, _event: &EntityEvent<'_>) -> Veto {
        Veto::Allow
    }

    fn post_insert(&self, _event: &EntityEvent<'_>) {}

    fn pre_update(&self, _event: &EntityEvent<'_>) -> Veto {
        Veto::Allow
    }

    fn post_update(&self, _event: &EntityEvent<'_>) {}

    fn pre_delete(&self, _event: &EntityEvent<'_>) -> Veto {
        Veto::Allow
    }

    fn post_delete(&self, _event: &EntityEvent<'_>) {}

    /// Fired before an entity's row is read. `state` is empty.
    fn pre_load(&self, _event: &EntityEvent<'_>) {}

    /// Fired after an entity's state was read from storage.
    fn post_load(&self, _event: &EntityEvent<'_>) {}
}

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` will abort the operation (e.g., prevent commit).
type SessionEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Holds registered session-level event callbacks.
///
/// These are fired at key points in the session lifecycle:
/// before/after flush, commit, and rollback.
#[derive(Default)]
pub struct SessionEventCallbacks {
    pub(crate) before_flush: Vec<SessionEventFn>,
    pub(crate) after_flush: Vec<SessionEventFn>,
    pub(crate) before_commit: Vec<SessionEventFn>,
    pub(crate) after_commit: Vec<SessionEventFn>,
    pub(crate) after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    pub(crate) fn fire(&mut self, event: SessionEvent) -> Result<(), Error> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct NoOp;
    impl EntityListener for NoOp {}

    #[test]
    fn test_default_listener_allows() {
        let event = EntityEvent {
            entity: "Widget",
            id: None,
            state: &[],
            properties: &[],
        };
        assert_eq!(NoOp.pre_insert(&event), Veto::Allow);
        assert_eq!(NoOp.pre_update(&event), Veto::Allow);
        assert_eq!(NoOp.pre_delete(&event), Veto::Allow);
        assert!(Veto::reject("no").is_rejected());
    }

    #[test]
    fn test_callbacks_fire_in_order_and_abort() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut callbacks = SessionEventCallbacks::default();
        let a = Arc::clone(&seen);
        callbacks.before_flush.push(Box::new(move || {
            a.lock().unwrap().push("first");
            Ok(())
        }));
        callbacks
            .before_flush
            .push(Box::new(|| Err(Error::InvalidOperation("stop".into()))));
        let b = Arc::clone(&seen);
        callbacks.before_flush.push(Box::new(move || {
            b.lock().unwrap().push("never");
            Ok(())
        }));

        assert!(callbacks.fire(SessionEvent::BeforeFlush).is_err());
        assert_eq!(*seen.lock().unwrap(), vec!["first"]);
        assert!(callbacks.fire(SessionEvent::AfterCommit).is_ok());
    }
}
