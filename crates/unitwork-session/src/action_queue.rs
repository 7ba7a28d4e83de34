//! Action queue: pending writes and their flush order.
//!
//! The queue collects the insert, update, delete and collection actions a
//! unit of work has decided on, merges duplicates, and computes a flush order
//! that respects foreign keys:
//!
//! 1. deletes caused by orphan removal
//! 2. inserts, parents before children
//! 3. updates, then fix-ups for foreign keys an insert had to leave NULL,
//!    then updates nulling foreign keys between rows about to be deleted
//! 4. collection removes, collection updates, collection recreates
//! 5. remaining deletes, children before parents
//!
//! Within a bucket, actions keep enqueue order unless a foreign key forces
//! otherwise.
//!
//! # Example
//!
//! ```ignore
//! let mut queue = ActionQueue::new();
//! queue.enqueue(Action::insert(child, "Child"));
//! queue.enqueue(Action::insert(parent, "Parent"));
//!
//! // Child references Parent, so Parent is inserted first
//! let plan = queue.order(OrderOptions::default(), &graph)?;
//! ```

use crate::entity::EntityHandle;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use unitwork_core::{ActionKind, ActionSummary, CascadeError, CascadeErrorKind, Result, Value};

/// Lifecycle of an action. Actions never outlive the flush that executes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionState {
    Pending,
    Ordered,
    Executing,
    Executed,
    Failed,
}

/// One pending write.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub(crate) seq: u64,
    pub(crate) kind: ActionKind,
    pub(crate) target: EntityHandle,
    pub(crate) entity_name: &'static str,
    /// Collection property for collection actions.
    pub(crate) collection: Option<usize>,
    /// Properties written by an update.
    pub(crate) properties: BTreeSet<usize>,
    /// Delete caused by orphan removal.
    pub(crate) orphan: bool,
    pub(crate) state: ActionState,
}

impl Action {
    fn new(kind: ActionKind, target: EntityHandle, entity_name: &'static str) -> Self {
        Self {
            seq: 0,
            kind,
            target,
            entity_name,
            collection: None,
            properties: BTreeSet::new(),
            orphan: false,
            state: ActionState::Pending,
        }
    }

    pub fn insert(target: EntityHandle, entity_name: &'static str) -> Self {
        Self::new(ActionKind::Insert, target, entity_name)
    }

    pub fn update(
        target: EntityHandle,
        entity_name: &'static str,
        properties: impl IntoIterator<Item = usize>,
    ) -> Self {
        let mut action = Self::new(ActionKind::Update, target, entity_name);
        action.properties.extend(properties);
        action
    }

    pub fn delete(target: EntityHandle, entity_name: &'static str, orphan: bool) -> Self {
        let mut action = Self::new(ActionKind::Delete, target, entity_name);
        action.orphan = orphan;
        action
    }

    /// A collection action on property `collection` of `target`.
    pub fn collection(
        kind: ActionKind,
        target: EntityHandle,
        entity_name: &'static str,
        collection: usize,
    ) -> Self {
        let mut action = Self::new(kind, target, entity_name);
        action.collection = Some(collection);
        action
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn target(&self) -> EntityHandle {
        self.target
    }

    pub fn entity_name(&self) -> &'static str {
        self.entity_name
    }

    pub fn properties(&self) -> impl Iterator<Item = usize> + '_ {
        self.properties.iter().copied()
    }

    pub fn is_orphan_removal(&self) -> bool {
        self.orphan
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    fn same_work(&self, other: &Action) -> bool {
        self.kind == other.kind && self.target == other.target && self.collection == other.collection
    }
}

/// A foreign key from an action's row to another entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub target: EntityHandle,
    pub property: usize,
    pub nullable: bool,
}

/// What the queue needs to know about the entity graph to order actions.
pub trait DependencyGraph {
    /// Foreign keys of the row an action writes: current state for inserts,
    /// last-written state for deletes. Other kinds have none.
    fn dependencies(&self, action: &Action) -> Vec<Dependency>;

    /// Current identifier of an instance, for diagnostics and update sorting.
    fn identifier(&self, target: EntityHandle) -> Option<Value>;
}

/// Why an ordered action is in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Purpose {
    Scheduled,
    /// Writes foreign keys an insert had to leave NULL to break a cycle.
    InsertFixup,
    /// Nulls foreign keys between rows deleted in the same flush.
    DeleteNullify,
}

/// One step of a flush plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub action: Action,
    pub purpose: Purpose,
    /// Properties written as NULL regardless of current state.
    pub write_null: Vec<usize>,
}

impl PlannedAction {
    fn scheduled(action: Action) -> Self {
        Self {
            action,
            purpose: Purpose::Scheduled,
            write_null: Vec::new(),
        }
    }
}

/// Ordering switches, from the session factory options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderOptions {
    /// Emit ready inserts of the same entity together so they can batch.
    pub order_inserts: bool,
    /// Sort updates by entity name and identifier.
    pub order_updates: bool,
}

/// Pending action counts, for statistics and debug output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub collection_actions: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes + self.collection_actions
    }
}

/// Pending actions of one unit of work.
#[derive(Debug, Default)]
pub struct ActionQueue {
    actions: Vec<Action>,
    next_seq: u64,
}

impl ActionQueue {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action.
    ///
    /// An action of the same kind on the same target (and collection) already
    /// queued absorbs the new one: update property sets are unioned, so the
    /// queue holds at most one action per kind and target.
    ///
    /// # Returns
    ///
    /// `true` if the action was added rather than merged.
    pub fn enqueue(&mut self, mut action: Action) -> bool {
        if let Some(existing) = self.actions.iter_mut().find(|a| a.same_work(&action)) {
            existing.properties.append(&mut action.properties);
            existing.orphan |= action.orphan;
            return false;
        }
        action.seq = self.next_seq;
        action.state = ActionState::Pending;
        self.next_seq += 1;
        tracing::trace!(
            kind = %action.kind,
            entity = action.entity_name,
            target = %action.target,
            "Enqueued action"
        );
        self.actions.push(action);
        true
    }

    pub fn contains(&self, kind: ActionKind, target: EntityHandle) -> bool {
        self.actions
            .iter()
            .any(|a| a.kind == kind && a.target == target)
    }

    /// Drop queued actions of `kind` on `target`. Returns how many were dropped.
    pub fn unschedule(&mut self, kind: ActionKind, target: EntityHandle) -> usize {
        let before = self.actions.len();
        self.actions
            .retain(|a| !(a.kind == kind && a.target == target));
        before - self.actions.len()
    }

    /// Drop every queued action on `target`.
    pub fn unschedule_all(&mut self, target: EntityHandle) -> usize {
        let before = self.actions.len();
        self.actions.retain(|a| a.target != target);
        before - self.actions.len()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    pub fn counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for action in &self.actions {
            match action.kind {
                ActionKind::Insert => counts.inserts += 1,
                ActionKind::Update => counts.updates += 1,
                ActionKind::Delete => counts.deletes += 1,
                _ => counts.collection_actions += 1,
            }
        }
        counts
    }

    /// Take every pending action and return them in flush order.
    ///
    /// The queue is empty afterwards. Inserts whose foreign keys form a cycle
    /// are inserted with the nullable keys of the cycle left NULL and fixed up
    /// by a later update; a cycle made only of non-nullable keys cannot be
    /// ordered and fails with [`CascadeErrorKind::Cycle`]. Deletes are
    /// handled the same way in reverse.
    #[tracing::instrument(level = "debug", skip(self, graph), fields(pending = self.actions.len()))]
    pub fn order(
        &mut self,
        options: OrderOptions,
        graph: &dyn DependencyGraph,
    ) -> Result<Vec<PlannedAction>> {
        let mut orphan_deletes = Vec::new();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        let mut collection_removes = Vec::new();
        let mut collection_updates = Vec::new();
        let mut collection_recreates = Vec::new();

        for mut action in std::mem::take(&mut self.actions) {
            action.state = ActionState::Ordered;
            match action.kind {
                ActionKind::Insert => inserts.push(action),
                ActionKind::Update => updates.push(action),
                ActionKind::Delete if action.orphan => orphan_deletes.push(action),
                ActionKind::Delete => deletes.push(action),
                ActionKind::CollectionRemove => collection_removes.push(action),
                ActionKind::CollectionUpdate => collection_updates.push(action),
                ActionKind::CollectionRecreate => collection_recreates.push(action),
            }
        }

        let mut plan = Vec::new();

        let (ordered, nullify) = order_deletes(orphan_deletes, graph)?;
        let mut nullify_updates = nullify;
        let orphan_plan: Vec<PlannedAction> = ordered.into_iter().map(PlannedAction::scheduled).collect();

        let (ordered_inserts, fixups) = order_inserts(inserts, options, graph)?;

        if options.order_updates {
            updates.sort_by(|a, b| {
                a.entity_name.cmp(b.entity_name).then_with(|| {
                    compare_ids(graph.identifier(a.target), graph.identifier(b.target))
                })
            });
        }

        let (ordered_deletes, nullify) = order_deletes(deletes, graph)?;
        nullify_updates.extend(nullify);

        // Orphan nulling updates must precede the orphan deletes themselves.
        let (orphan_nullify, delete_nullify): (Vec<_>, Vec<_>) = nullify_updates
            .into_iter()
            .partition(|p| orphan_plan.iter().any(|o| o.action.target == p.action.target));

        plan.extend(orphan_nullify);
        plan.extend(orphan_plan);
        plan.extend(ordered_inserts);
        plan.extend(updates.into_iter().map(PlannedAction::scheduled));
        plan.extend(fixups);
        plan.extend(delete_nullify);
        plan.extend(collection_removes.into_iter().map(PlannedAction::scheduled));
        plan.extend(collection_updates.into_iter().map(PlannedAction::scheduled));
        plan.extend(collection_recreates.into_iter().map(PlannedAction::scheduled));
        plan.extend(ordered_deletes.into_iter().map(PlannedAction::scheduled));

        tracing::debug!(steps = plan.len(), "Flush plan computed");
        Ok(plan)
    }
}

fn compare_ids(a: Option<Value>, b: Option<Value>) -> std::cmp::Ordering {
    match (a.as_ref().and_then(Value::as_i64), b.as_ref().and_then(Value::as_i64)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => {
            let render = |v: Option<Value>| v.map(|v| v.to_string()).unwrap_or_default();
            render(a).cmp(&render(b))
        }
    }
}

fn cycle_error(action: &Action, graph: &dyn DependencyGraph, message: &str) -> CascadeError {
    CascadeError {
        kind: CascadeErrorKind::Cycle,
        entity: action.entity_name.to_string(),
        id: graph.identifier(action.target),
        message: message.to_string(),
    }
}

/// Topologically order inserts so referenced rows are inserted first.
///
/// Returns the ordered inserts and the fix-up updates for keys left NULL.
fn order_inserts(
    inserts: Vec<Action>,
    options: OrderOptions,
    graph: &dyn DependencyGraph,
) -> Result<(Vec<PlannedAction>, Vec<PlannedAction>)> {
    let position: HashMap<EntityHandle, usize> = inserts
        .iter()
        .enumerate()
        .map(|(i, a)| (a.target, i))
        .collect();

    // waits_on[i]: dependencies of insert i on other pending inserts
    let waits_on: Vec<Vec<(usize, Dependency)>> = inserts
        .iter()
        .map(|action| {
            graph
                .dependencies(action)
                .into_iter()
                .filter_map(|dep| position.get(&dep.target).map(|&j| (j, dep)))
                .collect()
        })
        .collect();

    let order = kahn(&inserts, &waits_on, options.order_inserts, |i, remaining| {
        let nullable: Vec<usize> = remaining.iter().map(|(_, d)| d.property).collect();
        if remaining.iter().all(|(_, d)| d.nullable) {
            Ok(nullable)
        } else {
            Err(cycle_error(
                &inserts[i],
                graph,
                "inserts reference each other through non-nullable foreign keys",
            ))
        }
    })?;

    let mut ordered = Vec::with_capacity(inserts.len());
    let mut fixups = Vec::new();
    let mut slots: Vec<Option<Action>> = inserts.into_iter().map(Some).collect();
    for (index, mut nulled) in order {
        let Some(action) = slots[index].take() else {
            continue;
        };
        nulled.sort_unstable();
        nulled.dedup();
        if !nulled.is_empty() {
            tracing::debug!(
                entity = action.entity_name,
                properties = ?nulled,
                "Breaking insert cycle with a NULL foreign key"
            );
            let mut fixup = Action::update(action.target, action.entity_name, nulled.iter().copied());
            fixup.seq = action.seq;
            fixup.state = ActionState::Ordered;
            fixups.push(PlannedAction {
                action: fixup,
                purpose: Purpose::InsertFixup,
                write_null: Vec::new(),
            });
        }
        ordered.push(PlannedAction {
            action,
            purpose: Purpose::Scheduled,
            write_null: nulled,
        });
    }
    Ok((ordered, fixups))
}

/// Order deletes so rows are deleted before the rows they reference.
///
/// Nullable references between co-deleted rows do not constrain the order;
/// they are nulled by an update executed before any of the deletes.
fn order_deletes(
    deletes: Vec<Action>,
    graph: &dyn DependencyGraph,
) -> Result<(Vec<Action>, Vec<PlannedAction>)> {
    if deletes.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    let position: HashMap<EntityHandle, usize> = deletes
        .iter()
        .enumerate()
        .map(|(i, a)| (a.target, i))
        .collect();

    let mut nullify = Vec::new();
    // waits_on[j] holds i when row i references row j: i must go first.
    let mut waits_on: Vec<Vec<(usize, Dependency)>> = vec![Vec::new(); deletes.len()];
    for (i, action) in deletes.iter().enumerate() {
        let mut nulled = Vec::new();
        for dep in graph.dependencies(action) {
            let Some(&j) = position.get(&dep.target) else {
                continue;
            };
            if dep.nullable {
                if i != j {
                    nulled.push(dep.property);
                }
            } else if i != j {
                waits_on[j].push((i, dep));
            }
        }
        if !nulled.is_empty() {
            nulled.sort_unstable();
            nulled.dedup();
            let mut update = Action::update(action.target, action.entity_name, nulled.iter().copied());
            update.seq = action.seq;
            update.state = ActionState::Ordered;
            nullify.push(PlannedAction {
                action: update,
                purpose: Purpose::DeleteNullify,
                write_null: nulled,
            });
        }
    }

    let order = kahn(&deletes, &waits_on, false, |i, _| {
        Err(cycle_error(
            &deletes[i],
            graph,
            "deletes reference each other through non-nullable foreign keys",
        ))
    })?;

    let mut slots: Vec<Option<Action>> = deletes.into_iter().map(Some).collect();
    let ordered = order
        .into_iter()
        .filter_map(|(i, _)| slots[i].take())
        .collect();
    Ok((ordered, nullify))
}

/// Kahn's algorithm over `waits_on`, preferring the lowest enqueue sequence.
///
/// When nothing is ready, `break_cycle` is asked, for the lowest-sequence
/// blocked node, which of its remaining dependencies to drop. Returns node
/// indices in order with the properties dropped for each.
fn kahn(
    actions: &[Action],
    waits_on: &[Vec<(usize, Dependency)>],
    group_by_entity: bool,
    mut break_cycle: impl FnMut(usize, &[(usize, Dependency)]) -> std::result::Result<Vec<usize>, CascadeError>,
) -> Result<Vec<(usize, Vec<usize>)>> {
    let n = actions.len();
    let mut done = vec![false; n];
    let mut broken: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut order = Vec::with_capacity(n);
    let mut last_entity: Option<&'static str> = None;

    let blocked_by = |i: usize, done: &[bool], broken: &[Vec<usize>]| -> Vec<(usize, Dependency)> {
        waits_on[i]
            .iter()
            .filter(|(j, dep)| *j != i && !done[*j] && !broken[i].contains(&dep.property))
            .copied()
            .chain(
                waits_on[i]
                    .iter()
                    .filter(|(j, dep)| *j == i && !broken[i].contains(&dep.property))
                    .copied(),
            )
            .collect()
    };

    while order.len() < n {
        let ready: Vec<usize> = (0..n)
            .filter(|&i| !done[i] && blocked_by(i, &done, &broken).is_empty())
            .collect();

        let pick = if ready.is_empty() {
            let mut stuck: Vec<usize> = (0..n).filter(|&i| !done[i]).collect();
            stuck.sort_by_key(|&i| actions[i].seq);
            let mut first_error = None;
            let mut unblocked = None;
            for candidate in stuck {
                let remaining = blocked_by(candidate, &done, &broken);
                match break_cycle(candidate, &remaining) {
                    Ok(dropped) => {
                        broken[candidate].extend(dropped);
                        if blocked_by(candidate, &done, &broken).is_empty() {
                            unblocked = Some(candidate);
                            break;
                        }
                    }
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
            }
            match (unblocked, first_error) {
                (Some(candidate), _) => candidate,
                (None, Some(err)) => return Err(err.into()),
                (None, None) => break,
            }
        } else {
            let same_entity = if group_by_entity {
                ready
                    .iter()
                    .copied()
                    .filter(|&i| Some(actions[i].entity_name) == last_entity)
                    .min_by_key(|&i| actions[i].seq)
            } else {
                None
            };
            match same_entity {
                Some(i) => i,
                None => ready
                    .iter()
                    .copied()
                    .min_by_key(|&i| actions[i].seq)
                    .unwrap_or(ready[0]),
            }
        };

        done[pick] = true;
        last_entity = Some(actions[pick].entity_name);
        order.push((pick, std::mem::take(&mut broken[pick])));
    }
    Ok(order)
}

/// Summary used in errors and results.
pub(crate) fn summarize(action: &Action, role: Option<String>, id: Option<Value>) -> ActionSummary {
    let target = role.unwrap_or_else(|| action.entity_name.to_string());
    ActionSummary::new(action.kind, target, id).with_properties(action.properties().collect())
}
