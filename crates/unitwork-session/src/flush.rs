//! Flush: writing the unit of work's changes in a safe order.
//!
//! A flush runs in two halves. Preparation walks the managed instances:
//! - cascade persist from every managed instance
//! - delete orphans of orphan-removal associations
//! - dirty-check every modifiable instance and queue updates
//! - diff owned collections against their snapshots
//!
//! Execution orders the queue (see [`crate::ActionQueue::order`]), builds
//! each statement from the state current at that moment, and batches
//! consecutive statements of the same shape. Results are applied to the
//! entry ledger as each statement succeeds.

use crate::action_queue::{Action, Dependency, DependencyGraph, PlannedAction, Purpose, summarize};
use crate::cascade::{OrphanDecision, cascade, decide_orphan, find_orphans};
use crate::change_tracker::optimistic_lock_state;
use crate::entity::{EntityHandle, EntityStore, ManagedEntity, StateValue};
use crate::entry::{EntityEntry, Status};
use crate::events::{EntityEvent, SessionEvent, Veto};
use crate::identity_map::EntityKey;
use crate::natural_id::natural_id_values;
use crate::{Session, compute_dirty_properties, snapshot_state, touches_immutable_natural_id, unknown_handle};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use unitwork_core::{
    ActionKind, ActionSummary, CascadeAction, Connection, Cx, DeleteSpec, EntityShape, Error,
    IdGeneration, Outcome, PropertyKind, Result, StaleStateError, Statement, StorageError,
    StorageErrorKind, UpdateSpec, Value, VetoedActionError,
};

/// What a flush wrote.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushSummary {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated, fix-ups included.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    pub collections_recreated: usize,
    pub collections_updated: usize,
    pub collections_removed: usize,
    /// Multi-statement batches sent to storage.
    pub batches: usize,
    /// Executed actions, in execution order.
    pub executed: Vec<ActionSummary>,
}

impl FlushSummary {
    /// Create a new empty summary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of actions executed.
    pub fn total(&self) -> usize {
        self.inserted
            + self.updated
            + self.deleted
            + self.collections_recreated
            + self.collections_updated
            + self.collections_removed
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Foreign keys between arena instances, as the action queue sees them.
struct StoreGraph<'a> {
    store: &'a EntityStore,
}

impl DependencyGraph for StoreGraph<'_> {
    fn dependencies(&self, action: &Action) -> Vec<Dependency> {
        let Some(slot) = self.store.get(action.target()) else {
            return Vec::new();
        };
        let state = match action.kind() {
            ActionKind::Insert => slot.values(),
            ActionKind::Delete => slot.entry().and_then(EntityEntry::loaded_state),
            _ => None,
        };
        let Some(state) = state else {
            return Vec::new();
        };
        slot.shape()
            .associations()
            .filter(|(_, prop)| prop.is_to_one())
            .filter_map(|(index, prop)| {
                let target = state.get(index)?.as_reference()?;
                Some(Dependency {
                    target,
                    property: index,
                    nullable: prop.nullable,
                })
            })
            .collect()
    }

    fn identifier(&self, target: EntityHandle) -> Option<Value> {
        self.store.get(target)?.id.clone()
    }
}

/// Ledger changes to apply once a step's statements succeeded.
enum StepOutcome {
    Inserted {
        target: EntityHandle,
        snapshot: Vec<StateValue>,
        version: Option<Value>,
    },
    Updated {
        target: EntityHandle,
        written: Vec<(usize, StateValue)>,
        version: Option<Value>,
        notify: bool,
    },
    Deleted {
        target: EntityHandle,
    },
    Collection {
        target: EntityHandle,
        index: usize,
        kind: ActionKind,
        elements: Vec<EntityHandle>,
    },
}

/// One plan step with its statements built.
struct PreparedStep {
    statements: Vec<Statement>,
    summary: ActionSummary,
    /// Single statement that may share a batch with its neighbours.
    batchable: bool,
    /// Identity insert: storage returns the identifier.
    generated_id: bool,
    outcome: StepOutcome,
}

enum Prepared {
    Skip,
    Ready(PreparedStep),
    Vetoed {
        action: ActionSummary,
        reason: String,
        target: EntityHandle,
        kind: ActionKind,
    },
}

fn is_live(slot: &ManagedEntity) -> bool {
    !slot.detached && slot.entry().is_some_and(|entry| !entry.is_removed())
}

fn nulled(value: &StateValue) -> StateValue {
    match value {
        StateValue::Reference(_) => StateValue::Reference(None),
        _ => StateValue::Basic(Value::Null),
    }
}

fn check_rows(statement: &Statement, rows: u64, action: &ActionSummary) -> Result<()> {
    match statement.expected_rows {
        Some(expected) if expected != rows => Err(StaleStateError {
            entity: action.target.clone(),
            id: action.id.clone().unwrap_or(Value::Null),
            expected,
            actual: rows,
        }
        .into()),
        _ => Ok(()),
    }
}

/// The first instance a managed instance references through a
/// non-persist-cascading association while it is still transient.
fn transient_reference(store: &EntityStore, slot: &ManagedEntity) -> Result<()> {
    let Some(values) = slot.values() else {
        return Ok(());
    };
    for (index, prop) in slot.shape().associations() {
        if prop.cascade_style().includes(CascadeAction::Persist) {
            continue;
        }
        let targets = match (prop.kind, values.get(index)) {
            (PropertyKind::ToOne { .. }, Some(StateValue::Reference(Some(target)))) => vec![*target],
            (PropertyKind::Collection { inverse: false, .. }, Some(value)) => {
                value.elements().map(<[EntityHandle]>::to_vec).unwrap_or_default()
            }
            _ => continue,
        };
        for target in targets {
            if let Some(target) = store.get(target).filter(|t| t.is_transient()) {
                return Err(Error::TransientReference {
                    entity: slot.entity_name().to_string(),
                    property: prop.name.to_string(),
                    target: target.entity_name().to_string(),
                });
            }
        }
    }
    Ok(())
}

impl<C: Connection> Session<C> {
    /// Write every pending change.
    ///
    /// Runs inside the current transaction, beginning one first if the
    /// session auto-begins. On failure the session is marked flush-failed and
    /// only [`Session::rollback`] or [`Session::close`] are accepted; the
    /// error lists the actions that already executed.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushSummary, Error> {
        try_result!(self.ensure_usable());
        try_result!(self.ensure_connected());
        if let Err(e) = self.callbacks.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }
        if self.config.auto_begin && !self.in_transaction {
            try_outcome!(self.begin(cx).await);
        }

        match self.flush_inner(cx).await {
            Outcome::Ok(summary) => {
                tracing::debug!(
                    inserted = summary.inserted,
                    updated = summary.updated,
                    deleted = summary.deleted,
                    batches = summary.batches,
                    "Flush complete"
                );
                if let Err(e) = self.callbacks.fire(SessionEvent::AfterFlush) {
                    return Outcome::Err(e);
                }
                Outcome::Ok(summary)
            }
            failed => {
                self.flush_failed = true;
                if let Outcome::Err(e) = &failed {
                    tracing::warn!(error = %e, "Flush failed; the unit of work must be rolled back");
                }
                failed
            }
        }
    }

    async fn flush_inner(&mut self, cx: &Cx) -> Outcome<FlushSummary, Error> {
        try_outcome!(self.cascade_persist_all(cx).await);
        try_outcome!(self.remove_orphans(cx).await);
        try_result!(self.schedule_updates());
        try_result!(self.schedule_collection_actions());

        let plan = {
            let graph = StoreGraph { store: &self.store };
            try_result!(self.queue.order(self.config.order, &graph))
        };
        let mut summary = FlushSummary::new();
        if !plan.is_empty() {
            tracing::debug!(actions = plan.len(), "Executing flush plan");
            try_outcome!(self.execute_plan(cx, &plan, &mut summary).await);
        }
        self.finish_flush();
        self.counters.flushes += 1;
        Outcome::Ok(summary)
    }

    // ========================================================================
    // Preparation
    // ========================================================================

    async fn cascade_persist_all(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let roots: Vec<EntityHandle> = self
            .store
            .iter()
            .filter(|(_, slot)| is_live(slot))
            .map(|(handle, _)| handle)
            .collect();
        let mut visited = HashSet::new();
        let mut reached = Vec::new();
        for root in roots {
            reached.extend(cascade(
                &self.store,
                CascadeAction::Persist,
                root,
                &mut visited,
            ));
        }
        for handle in reached {
            try_outcome!(self.persist_one(cx, handle).await);
        }
        Outcome::Ok(())
    }

    async fn remove_orphans(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let owners: Vec<EntityHandle> = self
            .store
            .iter()
            .filter(|(_, slot)| is_live(slot))
            .map(|(handle, _)| handle)
            .collect();
        for owner in owners {
            for orphan in find_orphans(&self.store, owner) {
                if !try_result!(self.slot(orphan.orphan)).is_initialized() {
                    match self.resolve(cx, orphan.orphan).await {
                        Outcome::Ok(_) => {}
                        // Already gone from storage
                        Outcome::Err(Error::EntityNotFound { .. }) => continue,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                if try_result!(decide_orphan(&self.store, &orphan)) == OrphanDecision::Delete {
                    tracing::debug!(
                        owner = %orphan.owner,
                        orphan = %orphan.orphan,
                        property = orphan.property,
                        "Deleting orphan"
                    );
                    try_outcome!(self.cascade_delete(cx, orphan.orphan, true).await);
                }
            }
        }
        Outcome::Ok(())
    }

    fn schedule_updates(&mut self) -> Result<()> {
        let mut updates = Vec::new();
        for (handle, slot) in self.store.iter() {
            if !is_live(slot) {
                continue;
            }
            transient_reference(&self.store, slot)?;
            let (Some(entry), Some(values)) = (slot.entry(), slot.values()) else {
                continue;
            };
            if entry.is_read_only() || !entry.exists_in_database() {
                continue;
            }
            let shape = slot.shape();
            let dirty = compute_dirty_properties(shape, entry, values);
            if touches_immutable_natural_id(shape, &dirty) {
                return Err(Error::ImmutableNaturalId {
                    entity: shape.name.to_string(),
                    id: slot.id.clone().unwrap_or(Value::Null),
                });
            }
            let collection_changed = shape.version.is_some()
                && slot.collections.iter().any(|(index, collection)| {
                    let owned = matches!(
                        shape.property(*index).map(|p| p.kind),
                        Some(PropertyKind::Collection { inverse: false, .. })
                    );
                    owned
                        && values
                            .get(*index)
                            .and_then(StateValue::elements)
                            .is_some_and(|elements| collection.differs_from(elements))
                });
            if !dirty.is_empty() || entry.force_increment || collection_changed {
                updates.push((handle, shape.name, dirty));
            }
        }
        for (handle, entity, dirty) in updates {
            tracing::trace!(entity, handle = %handle, dirty = ?dirty, "Scheduling update");
            self.queue.enqueue(Action::update(handle, entity, dirty));
        }
        Ok(())
    }

    fn schedule_collection_actions(&mut self) -> Result<()> {
        let mut actions = Vec::new();
        for (handle, slot) in self.store.iter() {
            if slot.detached {
                continue;
            }
            let Some(entry) = slot.entry() else {
                continue;
            };
            if entry.is_read_only() {
                continue;
            }
            let shape = slot.shape();
            for (&index, collection) in &slot.collections {
                let Some(prop) = shape.property(index) else {
                    continue;
                };
                if matches!(prop.kind, PropertyKind::Collection { inverse: true, .. }) {
                    continue;
                }
                let kind = if entry.is_removed() {
                    collection
                        .exists_in_database
                        .then_some(ActionKind::CollectionRemove)
                } else {
                    let Some(current) = slot
                        .values()
                        .and_then(|values| values.get(index))
                        .and_then(StateValue::elements)
                    else {
                        continue;
                    };
                    if !collection.exists_in_database {
                        (!current.is_empty()).then_some(ActionKind::CollectionRecreate)
                    } else if collection.differs_from(current) {
                        Some(ActionKind::CollectionUpdate)
                    } else {
                        None
                    }
                };
                if let Some(kind) = kind {
                    actions.push(Action::collection(kind, handle, shape.name, index));
                }
            }
        }
        for action in actions {
            self.queue.enqueue(action);
        }
        Ok(())
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn execute_plan(
        &mut self,
        cx: &Cx,
        plan: &[PlannedAction],
        summary: &mut FlushSummary,
    ) -> Outcome<(), Error> {
        let batch_size = self.config.jdbc_batch_size;
        let mut pending: Vec<PreparedStep> = Vec::new();

        for step in plan {
            let prepared = match self.prepare_step(step) {
                Ok(prepared) => prepared,
                Err(e) => {
                    try_outcome!(self.drain(cx, &mut pending, summary).await);
                    let failed = summarize(&step.action, None, self.id(step.action.target()).cloned());
                    return Outcome::Err(Error::flush(e, Some(failed), summary.executed.clone()));
                }
            };
            let prepared = match prepared {
                Prepared::Skip => continue,
                Prepared::Ready(prepared) => prepared,
                Prepared::Vetoed {
                    action,
                    reason,
                    target,
                    kind,
                } => {
                    try_outcome!(self.drain(cx, &mut pending, summary).await);
                    if kind == ActionKind::Insert {
                        self.make_transient(target);
                    }
                    tracing::info!(action = %action, reason = %reason, "Action vetoed by listener");
                    return Outcome::Err(Error::Vetoed(Box::new(VetoedActionError {
                        action,
                        reason,
                        executed: summary.executed.clone(),
                    })));
                }
            };

            let joins = prepared.batchable && batch_size > 1;
            let fits = pending.len() < batch_size
                && pending.first().is_none_or(|first| {
                    first
                        .statements
                        .first()
                        .zip(prepared.statements.first())
                        .is_some_and(|(a, b)| a.same_shape(b))
                });
            if !joins || !fits {
                try_outcome!(self.drain(cx, &mut pending, summary).await);
            }
            if joins {
                pending.push(prepared);
            } else {
                try_outcome!(self.execute_step(cx, prepared, summary).await);
            }
        }
        self.drain(cx, &mut pending, summary).await
    }

    /// Build the statements of one plan step from the current state.
    fn prepare_step(&self, step: &PlannedAction) -> Result<Prepared> {
        let action = &step.action;
        let target = action.target();
        let slot = self.slot(target)?;
        let persister = Arc::clone(&slot.persister);
        let shape = persister.shape();
        let values = slot
            .values()
            .ok_or_else(|| Error::InvalidOperation(format!("{} {target} is not initialized", shape.name)))?;
        let entry = slot.entry().ok_or_else(|| Error::DetachedEntity {
            entity: shape.name.to_string(),
            id: slot.id.clone(),
            operation: "flush",
        })?;

        match action.kind() {
            ActionKind::Insert => {
                let mut state = values.to_vec();
                for &index in &step.write_null {
                    state[index] = nulled(&state[index]);
                }
                let flat = self.flatten(&state);
                let id = slot.id.clone();
                let summary = summarize(action, None, id.clone());
                let event = EntityEvent {
                    entity: shape.name,
                    id: id.as_ref(),
                    state: &flat,
                    properties: &[],
                };
                if let Some(reason) = self.veto(ActionKind::Insert, &event) {
                    return Ok(Prepared::Vetoed {
                        action: summary,
                        reason,
                        target,
                        kind: ActionKind::Insert,
                    });
                }
                let generated_id = shape.id_generation == IdGeneration::Identity;
                Ok(Prepared::Ready(PreparedStep {
                    statements: vec![persister.insert_statement(id.as_ref(), &flat)],
                    summary,
                    batchable: !generated_id && persister.supports_batching(),
                    generated_id,
                    outcome: StepOutcome::Inserted {
                        target,
                        snapshot: snapshot_state(shape, &state),
                        version: entry.version().cloned(),
                    },
                }))
            }
            ActionKind::Update => self.prepare_update(step, slot, shape, entry, values),
            ActionKind::Delete => {
                let id = slot.id.clone().ok_or_else(|| missing_id(shape))?;
                let flat = self.flatten(values);
                let summary = summarize(action, None, Some(id.clone()));
                let event = EntityEvent {
                    entity: shape.name,
                    id: Some(&id),
                    state: &flat,
                    properties: &[],
                };
                if let Some(reason) = self.veto(ActionKind::Delete, &event) {
                    return Ok(Prepared::Vetoed {
                        action: summary,
                        reason,
                        target,
                        kind: ActionKind::Delete,
                    });
                }
                let every: Vec<usize> = (0..shape.len()).collect();
                let lock_state = entry
                    .loaded_state()
                    .map(|loaded| optimistic_lock_state(shape, loaded, &every, |v| self.column_value(v)))
                    .unwrap_or_default();
                let expected_version = if shape.is_version_checked() {
                    entry.version()
                } else {
                    None
                };
                let statement = persister
                    .delete_statement(&DeleteSpec {
                        id: &id,
                        expected_version,
                        lock_state: &lock_state,
                    })
                    .expect_rows(1);
                Ok(Prepared::Ready(PreparedStep {
                    statements: vec![statement],
                    summary,
                    batchable: persister.supports_batching(),
                    generated_id: false,
                    outcome: StepOutcome::Deleted { target },
                }))
            }
            kind @ (ActionKind::CollectionRecreate
            | ActionKind::CollectionUpdate
            | ActionKind::CollectionRemove) => self.prepare_collection(action, kind, slot, shape),
        }
    }

    fn prepare_update(
        &self,
        step: &PlannedAction,
        slot: &ManagedEntity,
        shape: &EntityShape,
        entry: &EntityEntry,
        values: &[StateValue],
    ) -> Result<Prepared> {
        let action = &step.action;
        let target = action.target();
        let id = slot.id.clone().ok_or_else(|| missing_id(shape))?;
        let scheduled = step.purpose == Purpose::Scheduled;
        let dirty: Vec<usize> = action.properties().collect();

        let mut state = values.to_vec();
        for &index in &step.write_null {
            state[index] = nulled(&state[index]);
        }
        let mut changed: BTreeSet<usize> = dirty.iter().copied().collect();
        changed.extend(step.write_null.iter().copied());

        let mut version = None;
        if scheduled && let Some(index) = shape.version {
            let current = entry.version().cloned().unwrap_or(Value::Null);
            let next = current.next_version().ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "{} version {current} cannot be incremented",
                    shape.name
                ))
            })?;
            state[index] = StateValue::Basic(next.clone());
            changed.insert(index);
            version = Some(next);
        }
        if changed.is_empty() {
            return Ok(Prepared::Skip);
        }
        let changed: Vec<usize> = changed.into_iter().collect();
        let flat = self.flatten(&state);
        let summary = summarize(action, None, Some(id.clone()));

        if scheduled {
            let event = EntityEvent {
                entity: shape.name,
                id: Some(&id),
                state: &flat,
                properties: &dirty,
            };
            if let Some(reason) = self.veto(ActionKind::Update, &event) {
                return Ok(Prepared::Vetoed {
                    action: summary,
                    reason,
                    target,
                    kind: ActionKind::Update,
                });
            }
        }

        let lock_state = if scheduled {
            entry
                .loaded_state()
                .map(|loaded| optimistic_lock_state(shape, loaded, &dirty, |v| self.column_value(v)))
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let expected_version = if scheduled && shape.is_version_checked() {
            entry.version()
        } else {
            None
        };
        let statement = slot
            .persister
            .update_statement(&UpdateSpec {
                id: &id,
                changed: &changed,
                values: &flat,
                expected_version,
                lock_state: &lock_state,
            })
            .expect_rows(1);
        let written = changed.iter().map(|&i| (i, state[i].clone())).collect();

        Ok(Prepared::Ready(PreparedStep {
            statements: vec![statement],
            summary,
            batchable: slot.persister.supports_batching(),
            generated_id: false,
            outcome: StepOutcome::Updated {
                target,
                written,
                version,
                notify: scheduled,
            },
        }))
    }

    fn prepare_collection(
        &self,
        action: &Action,
        kind: ActionKind,
        slot: &ManagedEntity,
        shape: &EntityShape,
    ) -> Result<Prepared> {
        let target = action.target();
        let index = action
            .collection
            .ok_or_else(|| Error::InvalidOperation(format!("{kind} without a collection")))?;
        let prop = shape
            .property(index)
            .ok_or_else(|| Error::Mapping(format!("{} has no property {index}", shape.name)))?;
        let role = format!("{}.{}", shape.name, prop.name);
        let persister = self
            .factory
            .collection_persister(&role)
            .ok_or_else(|| Error::Mapping(format!("collection '{role}' has no collection persister")))?;
        let owner_id = slot.id.clone().ok_or_else(|| missing_id(shape))?;
        let current: Vec<EntityHandle> = slot
            .values()
            .and_then(|values| values.get(index))
            .and_then(StateValue::elements)
            .map(<[EntityHandle]>::to_vec)
            .unwrap_or_default();

        let element_ids = |handles: &[EntityHandle]| -> Result<Vec<Value>> {
            handles
                .iter()
                .map(|&element| {
                    let element = self.slot(element)?;
                    element.id.clone().filter(|id| !id.is_null()).ok_or_else(|| {
                        Error::TransientReference {
                            entity: shape.name.to_string(),
                            property: prop.name.to_string(),
                            target: element.entity_name().to_string(),
                        }
                    })
                })
                .collect()
        };

        let statements = match kind {
            ActionKind::CollectionRecreate => {
                persister.recreate_statements(&owner_id, &element_ids(&current)?)
            }
            ActionKind::CollectionUpdate => {
                let (added, removed) = slot
                    .collection_entry(index)
                    .map(|entry| entry.diff(&current))
                    .unwrap_or_default();
                let mut statements =
                    persister.delete_rows_statements(&owner_id, &element_ids(&removed)?);
                statements.extend(persister.insert_rows_statements(&owner_id, &element_ids(&added)?));
                statements
            }
            _ => persister.remove_statements(&owner_id),
        };
        let batchable = statements.len() == 1 && persister.supports_batching();
        Ok(Prepared::Ready(PreparedStep {
            statements,
            summary: summarize(action, Some(role), Some(owner_id)),
            batchable,
            generated_id: false,
            outcome: StepOutcome::Collection {
                target,
                index,
                kind,
                elements: current,
            },
        }))
    }

    fn veto(&self, kind: ActionKind, event: &EntityEvent<'_>) -> Option<String> {
        for listener in self.factory.listeners() {
            let answer = match kind {
                ActionKind::Insert => listener.pre_insert(event),
                ActionKind::Update => listener.pre_update(event),
                ActionKind::Delete => listener.pre_delete(event),
                _ => Veto::Allow,
            };
            if let Veto::Reject(reason) = answer {
                return Some(reason);
            }
        }
        None
    }

    /// Execute one step's statements one at a time.
    async fn execute_step(
        &mut self,
        cx: &Cx,
        step: PreparedStep,
        summary: &mut FlushSummary,
    ) -> Outcome<(), Error> {
        let mut generated = None;
        for statement in &step.statements {
            self.counters.statements += 1;
            if step.generated_id {
                match self.connection.insert(cx, statement).await {
                    Outcome::Ok(id) => generated = Some(id),
                    Outcome::Err(e) => {
                        return Outcome::Err(Error::flush(
                            e,
                            Some(step.summary.clone()),
                            summary.executed.clone(),
                        ));
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                continue;
            }
            let rows = match self.connection.execute(cx, statement).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => {
                    return Outcome::Err(Error::flush(
                        e,
                        Some(step.summary.clone()),
                        summary.executed.clone(),
                    ));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let Err(e) = check_rows(statement, rows, &step.summary) {
                return Outcome::Err(Error::flush(
                    e,
                    Some(step.summary.clone()),
                    summary.executed.clone(),
                ));
            }
        }
        let failed = step.summary.clone();
        if let Err(e) = self.complete_step(step, generated, summary) {
            return Outcome::Err(Error::flush(e, Some(failed), summary.executed.clone()));
        }
        Outcome::Ok(())
    }

    /// Execute the accumulated batchable steps as one batch.
    ///
    /// A batch the driver rejects as a whole is retried one statement at a time.
    async fn drain(
        &mut self,
        cx: &Cx,
        pending: &mut Vec<PreparedStep>,
        summary: &mut FlushSummary,
    ) -> Outcome<(), Error> {
        if pending.len() <= 1 {
            return match pending.pop() {
                Some(step) => self.execute_step(cx, step, summary).await,
                None => Outcome::Ok(()),
            };
        }
        let steps = std::mem::take(pending);
        let statements: Vec<Statement> = steps
            .iter()
            .filter_map(|step| step.statements.first().cloned())
            .collect();

        match self.connection.batch(cx, &statements).await {
            Outcome::Ok(counts) if counts.len() == steps.len() => {
                self.counters.statements += statements.len() as u64;
                self.counters.batches += 1;
                summary.batches += 1;
                tracing::debug!(
                    entity = statements[0].target,
                    statements = statements.len(),
                    "Executed batch"
                );
                for ((step, statement), rows) in steps.into_iter().zip(&statements).zip(counts) {
                    if let Err(e) = check_rows(statement, rows, &step.summary) {
                        return Outcome::Err(Error::flush(
                            e,
                            Some(step.summary.clone()),
                            summary.executed.clone(),
                        ));
                    }
                    let failed = step.summary.clone();
                    if let Err(e) = self.complete_step(step, None, summary) {
                        return Outcome::Err(Error::flush(e, Some(failed), summary.executed.clone()));
                    }
                }
                Outcome::Ok(())
            }
            Outcome::Ok(counts) => Outcome::Err(Error::flush(
                StorageError::new(
                    StorageErrorKind::Statement,
                    format!(
                        "batch of {} statements returned {} row counts",
                        statements.len(),
                        counts.len()
                    ),
                )
                .into(),
                None,
                summary.executed.clone(),
            )),
            Outcome::Err(e) if e.is_batch_failure() => {
                tracing::warn!(
                    error = %e,
                    statements = statements.len(),
                    "Batch rejected; executing statements one at a time"
                );
                for step in steps {
                    try_outcome!(self.execute_step(cx, step, summary).await);
                }
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(Error::flush(e, None, summary.executed.clone())),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    // ========================================================================
    // Post-processing
    // ========================================================================

    /// Apply a step's results to the ledger.
    fn complete_step(
        &mut self,
        step: PreparedStep,
        generated: Option<Value>,
        summary: &mut FlushSummary,
    ) -> Result<()> {
        let mut executed = step.summary;
        match step.outcome {
            StepOutcome::Inserted {
                target,
                snapshot,
                version,
            } => {
                let slot = self.store.get_mut(target).ok_or_else(|| unknown_handle(target))?;
                let persister = Arc::clone(&slot.persister);
                let shape = persister.shape();
                let is_generated = generated.is_some();
                let Some(id) = generated.or_else(|| slot.id.clone()) else {
                    return Err(Error::IdentifierGeneration {
                        entity: shape.name.to_string(),
                        message: "storage returned no identifier".to_string(),
                    });
                };
                let key = EntityKey::of(shape, &id);
                slot.id = Some(id.clone());
                if let Some(entry) = slot.entry.as_mut() {
                    entry.post_insert(id.clone(), snapshot, version);
                    if !shape.mutable {
                        entry.status = Status::ReadOnly;
                    }
                }
                for collection in slot.collections.values_mut() {
                    collection.owner_id = Some(id.clone());
                }
                let natural = slot.values().and_then(|values| natural_id_values(shape, values));
                if is_generated {
                    self.identity_map.register(key.clone(), target)?;
                }
                if let Some(values) = natural {
                    self.natural_ids.cache(&key, values);
                }
                self.inserted_keys.insert(key);
                executed.id = Some(id);
                summary.inserted += 1;
                self.fire_post(ActionKind::Insert, target, &[]);
            }
            StepOutcome::Updated {
                target,
                written,
                version,
                notify,
            } => {
                let slot = self.store.get_mut(target).ok_or_else(|| unknown_handle(target))?;
                let persister = Arc::clone(&slot.persister);
                let shape = persister.shape();
                if let Some(entry) = slot.entry.as_mut() {
                    entry.post_update(&written, version.clone());
                }
                if let (Some(index), Some(version)) = (shape.version, version)
                    && let Some(values) = slot.values_mut()
                {
                    values[index] = StateValue::Basic(version);
                }
                if let Some(id) = slot.id.clone()
                    && shape.natural_id.is_some_and(|info| info.mutable)
                {
                    let key = EntityKey::of(shape, &id);
                    match slot.values().and_then(|values| natural_id_values(shape, values)) {
                        Some(values) => {
                            self.natural_ids.cache(&key, values);
                        }
                        None => self.natural_ids.remove(&key),
                    }
                }
                summary.updated += 1;
                if notify {
                    self.fire_post(ActionKind::Update, target, &executed.properties);
                }
            }
            StepOutcome::Deleted { target } => {
                let slot = self.store.get_mut(target).ok_or_else(|| unknown_handle(target))?;
                if let Some(entry) = slot.entry.as_mut() {
                    entry.post_delete();
                }
                if let Some(id) = slot.id.clone() {
                    let key = EntityKey::of(slot.shape(), &id);
                    if self.identity_map.lookup(&key) == Some(target) {
                        self.identity_map.evict(&key);
                    }
                    self.natural_ids.remove(&key);
                }
                summary.deleted += 1;
                self.fire_post(ActionKind::Delete, target, &[]);
            }
            StepOutcome::Collection {
                target,
                index,
                kind,
                elements,
            } => {
                let slot = self.store.get_mut(target).ok_or_else(|| unknown_handle(target))?;
                if let Some(collection) = slot.collections.get_mut(&index) {
                    collection.post_flush(&elements);
                    if kind == ActionKind::CollectionRemove {
                        collection.exists_in_database = false;
                    }
                }
                match kind {
                    ActionKind::CollectionRecreate => summary.collections_recreated += 1,
                    ActionKind::CollectionUpdate => summary.collections_updated += 1,
                    _ => summary.collections_removed += 1,
                }
            }
        }
        tracing::trace!(action = %executed, "Executed");
        summary.executed.push(executed);
        Ok(())
    }

    fn fire_post(&self, kind: ActionKind, target: EntityHandle, properties: &[usize]) {
        let listeners = self.factory.listeners();
        if listeners.is_empty() {
            return;
        }
        let Some(slot) = self.store.get(target) else {
            return;
        };
        let state = slot.values().map(|values| self.flatten(values)).unwrap_or_default();
        let event = EntityEvent {
            entity: slot.entity_name(),
            id: slot.id.as_ref(),
            state: &state,
            properties,
        };
        for listener in listeners {
            match kind {
                ActionKind::Insert => listener.post_insert(&event),
                ActionKind::Update => listener.post_update(&event),
                ActionKind::Delete => listener.post_delete(&event),
                _ => {}
            }
        }
    }

    /// Detach deleted instances and re-snapshot initialized collections.
    fn finish_flush(&mut self) {
        for (_, slot) in self.store.iter_mut() {
            if slot.detached {
                continue;
            }
            match slot.entry.as_ref().map(EntityEntry::status) {
                Some(Status::Gone) => {
                    slot.entry = None;
                    slot.collections.clear();
                    slot.interceptor = None;
                    slot.detached = true;
                }
                Some(Status::Managed | Status::ReadOnly) => {
                    let Some(values) = slot.state.loaded() else {
                        continue;
                    };
                    for (index, collection) in &mut slot.collections {
                        if let Some(elements) = values.get(*index).and_then(StateValue::elements)
                            && collection.is_initialized()
                            && (collection.dirty || collection.differs_from(elements))
                        {
                            collection.post_flush(elements);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

fn missing_id(shape: &EntityShape) -> Error {
    Error::InvalidOperation(format!("{} has no identifier to write with", shape.name))
}
