//! Cascade traversal and orphan detection.
//!
//! Cascades walk the entity graph along associations whose cascade style
//! includes the operation being propagated. Graphs may be cyclic, so every
//! traversal carries a visited set keyed by identity when the instance has an
//! identifier and by handle otherwise. Traversal uses an explicit stack and
//! never recurses.
//!
//! Only initialized state is traversed: uninitialized placeholders are
//! reported (the caller decides whether to load them) but their associations
//! are not followed, and uninitialized collections are skipped.

use crate::entity::{EntityHandle, EntityStore, StateValue};
use crate::identity_map::EntityKey;
use std::collections::HashSet;
use unitwork_core::{CascadeAction, CascadeError, CascadeErrorKind, PropertyKind, Result};

/// Entry in a cascade's visited set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VisitKey {
    Row(EntityKey),
    Instance(EntityHandle),
}

pub(crate) fn visit_key(store: &EntityStore, handle: EntityHandle) -> VisitKey {
    match store.get(handle).and_then(|slot| {
        slot.id
            .as_ref()
            .filter(|id| !id.is_null())
            .map(|id| EntityKey::of(slot.shape(), id))
    }) {
        Some(key) => VisitKey::Row(key),
        None => VisitKey::Instance(handle),
    }
}

/// Instances reachable from `root` through associations cascading `action`,
/// `root` included, in pre-order.
///
/// Instances already in `visited` are skipped and newly reached ones are
/// added, so one visited set shared across several calls visits every
/// instance at most once.
pub(crate) fn cascade(
    store: &EntityStore,
    action: CascadeAction,
    root: EntityHandle,
    visited: &mut HashSet<VisitKey>,
) -> Vec<EntityHandle> {
    let mut reached = Vec::new();
    let mut stack = vec![root];

    while let Some(handle) = stack.pop() {
        if !visited.insert(visit_key(store, handle)) {
            continue;
        }
        reached.push(handle);

        let Some(slot) = store.get(handle) else {
            continue;
        };
        let Some(values) = slot.values() else {
            continue;
        };

        let mut children = Vec::new();
        for (index, prop) in slot.shape().associations() {
            if !prop.cascade_style().includes(action) {
                continue;
            }
            match values.get(index) {
                Some(StateValue::Reference(Some(target))) => children.push(*target),
                Some(value @ StateValue::Collection(_)) => {
                    if let Some(elements) = value.elements() {
                        children.extend_from_slice(elements);
                    }
                }
                _ => {}
            }
        }
        stack.extend(children.into_iter().rev());
    }

    tracing::trace!(
        action = %action,
        root = %root,
        reached = reached.len(),
        "Cascade traversal"
    );
    reached
}

/// An instance dropped from an orphan-removal association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Orphan {
    pub owner: EntityHandle,
    pub property: usize,
    pub orphan: EntityHandle,
}

/// Instances `owner` held through orphan-removal associations at the last
/// snapshot but no longer holds.
pub(crate) fn find_orphans(store: &EntityStore, owner: EntityHandle) -> Vec<Orphan> {
    let Some(slot) = store.get(owner) else {
        return Vec::new();
    };
    let (Some(entry), Some(values)) = (slot.entry(), slot.values()) else {
        return Vec::new();
    };
    if entry.is_removed() {
        return Vec::new();
    }

    let mut orphans = Vec::new();
    for (index, prop) in slot.shape().associations() {
        if !prop.cascade_style().has_orphan_removal() {
            continue;
        }
        match prop.kind {
            PropertyKind::ToOne { .. } => {
                let previous = entry
                    .loaded_state()
                    .and_then(|loaded| loaded.get(index))
                    .and_then(StateValue::as_reference);
                let current = values.get(index).and_then(StateValue::as_reference);
                if let Some(previous) = previous
                    && current != Some(previous)
                {
                    orphans.push(Orphan {
                        owner,
                        property: index,
                        orphan: previous,
                    });
                }
            }
            PropertyKind::Collection { .. } => {
                let (Some(collection), Some(current)) = (
                    slot.collection_entry(index),
                    values.get(index).and_then(StateValue::elements),
                ) else {
                    continue;
                };
                if !collection.is_initialized() {
                    continue;
                }
                orphans.extend(collection.orphans(current).into_iter().map(|orphan| Orphan {
                    owner,
                    property: index,
                    orphan,
                }));
            }
            PropertyKind::Basic => {}
        }
    }
    orphans
}

/// What to do with a detected orphan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrphanDecision {
    Delete,
    /// Re-parented through another persist-cascading association, or not managed.
    Keep,
}

/// Decide whether `orphan` may be deleted.
///
/// An orphan still held by some managed instance through an association that
/// cascades persist was moved, and is kept. One still held only through a
/// non-cascading association cannot be deleted without breaking that
/// reference, which is a [`CascadeErrorKind::OrphanConflict`].
pub(crate) fn decide_orphan(store: &EntityStore, orphan: &Orphan) -> Result<OrphanDecision> {
    let Some(target) = store.get(orphan.orphan) else {
        return Ok(OrphanDecision::Keep);
    };
    match target.entry() {
        Some(entry) if !entry.is_removed() && entry.exists_in_database() => {}
        _ => return Ok(OrphanDecision::Keep),
    }

    let mut conflict: Option<(&'static str, &'static str)> = None;
    for (holder, slot) in store.iter() {
        let Some(entry) = slot.entry() else {
            continue;
        };
        if entry.is_removed() || holder == orphan.orphan {
            continue;
        }
        let Some(values) = slot.values() else {
            continue;
        };
        for (index, prop) in slot.shape().associations() {
            let holds = match values.get(index) {
                Some(StateValue::Reference(Some(h))) => *h == orphan.orphan,
                Some(value) => value
                    .elements()
                    .is_some_and(|elements| elements.contains(&orphan.orphan)),
                None => false,
            };
            if !holds {
                continue;
            }
            if prop.cascade_style().includes(CascadeAction::Persist) {
                tracing::debug!(
                    orphan = %orphan.orphan,
                    holder = %holder,
                    property = prop.name,
                    "Orphan was re-parented; keeping it"
                );
                return Ok(OrphanDecision::Keep);
            }
            conflict.get_or_insert((slot.entity_name(), prop.name));
        }
    }

    if let Some((entity, property)) = conflict {
        return Err(CascadeError {
            kind: CascadeErrorKind::OrphanConflict,
            entity: target.entity_name().to_string(),
            id: target.id().cloned(),
            message: format!(
                "orphan is still referenced by {entity}.{property}, which does not cascade persist"
            ),
        }
        .into());
    }
    Ok(OrphanDecision::Delete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ManagedEntity;
    use crate::entry::{CollectionEntry, CollectionRole, EntityEntry, Status};
    use crate::test_support::{child_persister, node_persister, parent_persister};
    use unitwork_core::{LazyState, Value};

    fn node(store: &mut EntityStore, id: Option<i64>) -> EntityHandle {
        let mut slot = ManagedEntity::transient(node_persister());
        slot.id = id.map(Value::BigInt);
        store.insert(slot)
    }

    fn link(store: &mut EntityStore, from: EntityHandle, to: EntityHandle) {
        // Node.next is property 1
        store.get_mut(from).unwrap().values_mut().unwrap()[1] = StateValue::Reference(Some(to));
    }

    #[test]
    fn test_cascade_terminates_on_two_cycle() {
        let mut store = EntityStore::default();
        let a = node(&mut store, None);
        let b = node(&mut store, None);
        link(&mut store, a, b);
        link(&mut store, b, a);

        let mut visited = HashSet::new();
        let reached = cascade(&store, CascadeAction::Persist, a, &mut visited);
        assert_eq!(reached, vec![a, b]);

        // A second traversal with the same visited set reaches nothing new.
        assert!(cascade(&store, CascadeAction::Persist, b, &mut visited).is_empty());
    }

    #[test]
    fn test_cascade_self_reference() {
        let mut store = EntityStore::default();
        let a = node(&mut store, Some(1));
        link(&mut store, a, a);
        let reached = cascade(&store, CascadeAction::Delete, a, &mut HashSet::new());
        assert_eq!(reached, vec![a]);
    }

    #[test]
    fn test_visit_key_uses_identity_when_known() {
        let mut store = EntityStore::default();
        let a = node(&mut store, Some(7));
        let b = node(&mut store, None);
        assert_eq!(
            visit_key(&store, a),
            VisitKey::Row(EntityKey::new("Node", Value::BigInt(7)))
        );
        assert_eq!(visit_key(&store, b), VisitKey::Instance(b));
    }

    #[test]
    fn test_cascade_skips_non_cascading_and_uninitialized() {
        let mut store = EntityStore::default();
        let parent = store.insert(ManagedEntity::transient(parent_persister()));
        let child = store.insert(ManagedEntity::transient(child_persister()));
        // Child.parent does not cascade
        store.get_mut(child).unwrap().values_mut().unwrap()[1] =
            StateValue::Reference(Some(parent));
        assert_eq!(
            cascade(&store, CascadeAction::Persist, child, &mut HashSet::new()),
            vec![child]
        );

        // Parent.children cascades, but only once initialized
        store.get_mut(parent).unwrap().values_mut().unwrap()[2] =
            StateValue::Collection(LazyState::Unloaded(Value::BigInt(1)));
        assert_eq!(
            cascade(&store, CascadeAction::Persist, parent, &mut HashSet::new()),
            vec![parent]
        );
        store.get_mut(parent).unwrap().values_mut().unwrap()[2] =
            StateValue::Collection(LazyState::Loaded(vec![child]));
        assert_eq!(
            cascade(&store, CascadeAction::Persist, parent, &mut HashSet::new()),
            vec![parent, child]
        );
    }

    fn managed_parent_with_children(store: &mut EntityStore, n: usize) -> (EntityHandle, Vec<EntityHandle>) {
        let children: Vec<EntityHandle> = (0..n)
            .map(|i| {
                let mut slot = ManagedEntity::transient(child_persister());
                slot.id = Some(Value::BigInt(10 + i as i64));
                slot.entry = Some(EntityEntry::loaded(
                    "Child",
                    Value::BigInt(10 + i as i64),
                    Vec::new(),
                    None,
                    Status::Managed,
                ));
                store.insert(slot)
            })
            .collect();
        let mut slot = ManagedEntity::transient(parent_persister());
        slot.id = Some(Value::BigInt(1));
        slot.entry = Some(EntityEntry::loaded("Parent", Value::BigInt(1), Vec::new(), None, Status::Managed));
        slot.values_mut().unwrap()[2] = StateValue::Collection(LazyState::Loaded(children.clone()));
        let mut collection = CollectionEntry::loaded(
            CollectionRole {
                entity: "Parent",
                property: "children",
            },
            Value::BigInt(1),
        );
        collection.post_initialize(&children);
        slot.collections.insert(2, collection);
        let parent = store.insert(slot);
        for child in &children {
            store.get_mut(*child).unwrap().values_mut().unwrap()[1] =
                StateValue::Reference(Some(parent));
        }
        (parent, children)
    }

    #[test]
    fn test_find_orphans_in_collection() {
        let mut store = EntityStore::default();
        let (parent, children) = managed_parent_with_children(&mut store, 3);
        assert!(find_orphans(&store, parent).is_empty());

        store.get_mut(parent).unwrap().values_mut().unwrap()[2] =
            StateValue::Collection(LazyState::Loaded(vec![children[0], children[2]]));
        let orphans = find_orphans(&store, parent);
        assert_eq!(
            orphans,
            vec![Orphan {
                owner: parent,
                property: 2,
                orphan: children[1]
            }]
        );
    }

    #[test]
    fn test_orphan_held_through_non_cascading_reference_conflicts() {
        let mut store = EntityStore::default();
        let (parent, children) = managed_parent_with_children(&mut store, 2);
        store.get_mut(parent).unwrap().values_mut().unwrap()[2] =
            StateValue::Collection(LazyState::Loaded(vec![children[0]]));
        let orphans = find_orphans(&store, parent);
        assert_eq!(orphans.len(), 1);

        // Nothing else holds the orphan: delete it
        assert_eq!(decide_orphan(&store, &orphans[0]).unwrap(), OrphanDecision::Delete);

        // A second parent takes it through a persist-cascading collection: keep it
        let (other, _) = managed_parent_with_children(&mut store, 0);
        store.get_mut(other).unwrap().values_mut().unwrap()[2] =
            StateValue::Collection(LazyState::Loaded(vec![children[1]]));
        assert_eq!(decide_orphan(&store, &orphans[0]).unwrap(), OrphanDecision::Keep);
    }

    #[test]
    fn test_orphan_conflict_error() {
        let mut store = EntityStore::default();
        let (parent, children) = managed_parent_with_children(&mut store, 1);
        store.get_mut(parent).unwrap().values_mut().unwrap()[2] =
            StateValue::Collection(LazyState::Loaded(Vec::new()));
        // A managed Node still points at the orphan through Node.watched, which
        // does not cascade.
        let holder = node(&mut store, Some(99));
        store.get_mut(holder).unwrap().entry = Some(EntityEntry::loaded(
            "Node",
            Value::BigInt(99),
            Vec::new(),
            None,
            Status::Managed,
        ));
        store.get_mut(holder).unwrap().values_mut().unwrap()[2] =
            StateValue::Reference(Some(children[0]));
        let orphans = find_orphans(&store, parent);
        let err = decide_orphan(&store, &orphans[0]).unwrap_err();
        assert!(matches!(
            err,
            unitwork_core::Error::Cascade(CascadeError {
                kind: CascadeErrorKind::OrphanConflict,
                ..
            })
        ));
    }
}
