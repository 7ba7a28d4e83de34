//! Change tracking and dirty detection.
//!
//! Snapshots are per-property copies of entity state taken at load time and
//! after every successful write. Dirty checking compares the current state
//! against that snapshot one property at a time, using each property's
//! [`PropertyType`](unitwork_core::PropertyType) for equality.

use crate::entity::StateValue;
use crate::entry::EntityEntry;
use unitwork_core::{EntityShape, OptimisticLockStyle, PropertyInfo, Value};

/// Copy `state` for use as a snapshot.
///
/// Mutable basic values are deep-copied through their property type;
/// associations are copied as handles and collections are not snapshotted
/// here (see [`crate::entry::CollectionEntry`]).
pub fn snapshot_state(shape: &EntityShape, state: &[StateValue]) -> Vec<StateValue> {
    state
        .iter()
        .enumerate()
        .map(|(i, value)| match (value, shape.property(i)) {
            (StateValue::Basic(v), Some(prop)) => StateValue::Basic(prop.ty.deep_copy(v)),
            (StateValue::Collection(_), _) => StateValue::Unfetched,
            (other, _) => other.clone(),
        })
        .collect()
}

/// Whether one property differs between snapshot and current state.
pub fn is_property_dirty(prop: &PropertyInfo, loaded: &StateValue, current: &StateValue) -> bool {
    match (loaded, current) {
        (_, StateValue::Unfetched) => false,
        (_, StateValue::Collection(_)) => false,
        (StateValue::Basic(old), StateValue::Basic(new)) => !prop.ty.are_equal(old, new),
        (StateValue::Reference(old), StateValue::Reference(new)) => old != new,
        // Lazy value written without being fetched first.
        (StateValue::Unfetched, StateValue::Basic(_)) => true,
        _ => true,
    }
}

/// Indices of the properties of `current` that differ from the entry's snapshot.
///
/// Returns nothing for entries that are read-only, scheduled for deletion,
/// gone, not yet inserted, or of an immutable shape. Collections, unfetched
/// lazy properties, non-updatable properties and the version property are
/// never reported.
pub fn compute_dirty_properties(
    shape: &EntityShape,
    entry: &EntityEntry,
    current: &[StateValue],
) -> Vec<usize> {
    if entry.is_read_only() || entry.is_removed() || !shape.mutable {
        return Vec::new();
    }
    let Some(loaded) = entry.loaded_state() else {
        return Vec::new();
    };

    let dirty: Vec<usize> = shape
        .properties
        .iter()
        .enumerate()
        .filter(|(i, prop)| {
            prop.updatable && !prop.is_collection() && shape.version != Some(*i)
        })
        .filter_map(|(i, prop)| {
            let (old, new) = (loaded.get(i)?, current.get(i)?);
            is_property_dirty(prop, old, new).then_some(i)
        })
        .collect();

    if !dirty.is_empty() {
        tracing::trace!(
            entity = shape.name,
            dirty = ?dirty,
            "Dirty check result"
        );
    }
    dirty
}

/// Previous values guarding an update or delete under dirty/all optimistic locking.
///
/// `flatten` maps snapshot values to column values (associations to their
/// identifier). Unfetched lazy properties never participate.
pub fn optimistic_lock_state(
    shape: &EntityShape,
    loaded: &[StateValue],
    dirty: &[usize],
    flatten: impl Fn(&StateValue) -> Value,
) -> Vec<(usize, Value)> {
    let candidates: Vec<usize> = match shape.optimistic_lock {
        OptimisticLockStyle::None | OptimisticLockStyle::Version => return Vec::new(),
        OptimisticLockStyle::Dirty => dirty.to_vec(),
        OptimisticLockStyle::All => (0..shape.len()).collect(),
    };
    candidates
        .into_iter()
        .filter(|i| shape.version != Some(*i))
        .filter(|i| shape.property(*i).is_some_and(|p| !p.is_collection()))
        .filter_map(|i| match loaded.get(i)? {
            StateValue::Unfetched | StateValue::Collection(_) => None,
            value => Some((i, flatten(value))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Status;
    use crate::test_support::WIDGET;
    use unitwork_core::types;

    fn text(s: &str) -> StateValue {
        StateValue::Basic(Value::Text(s.into()))
    }

    fn widget_state(name: &str, price: i64) -> Vec<StateValue> {
        // name, price, version, notes (lazy), owner
        vec![
            text(name),
            StateValue::Basic(Value::BigInt(price)),
            StateValue::Basic(Value::BigInt(0)),
            StateValue::Unfetched,
            StateValue::Reference(None),
        ]
    }

    fn entry_for(state: Vec<StateValue>) -> EntityEntry {
        EntityEntry::loaded(
            "Widget",
            Value::BigInt(1),
            state,
            Some(Value::BigInt(0)),
            Status::Managed,
        )
    }

    #[test]
    fn test_clean_entity_has_no_dirty_properties() {
        let entry = entry_for(widget_state("a", 10));
        let dirty = compute_dirty_properties(&WIDGET, &entry, &widget_state("a", 10));
        assert!(dirty.is_empty());
    }

    #[test]
    fn test_changed_property_reported() {
        let entry = entry_for(widget_state("a", 10));
        let dirty = compute_dirty_properties(&WIDGET, &entry, &widget_state("b", 10));
        assert_eq!(dirty, vec![0]);
    }

    #[test]
    fn test_equal_by_type_is_clean() {
        let entry = entry_for(widget_state("a", 10));
        let mut current = widget_state("a", 10);
        current[1] = StateValue::Basic(Value::Int(10));
        assert!(compute_dirty_properties(&WIDGET, &entry, &current).is_empty());
    }

    #[test]
    fn test_version_and_unfetched_are_ignored() {
        let entry = entry_for(widget_state("a", 10));
        let mut current = widget_state("a", 10);
        current[2] = StateValue::Basic(Value::BigInt(9));
        assert!(compute_dirty_properties(&WIDGET, &entry, &current).is_empty());

        current[3] = text("written blind");
        assert_eq!(compute_dirty_properties(&WIDGET, &entry, &current), vec![3]);
    }

    #[test]
    fn test_read_only_and_deleted_are_never_dirty() {
        let mut entry = entry_for(widget_state("a", 10));
        entry.transition(Status::ReadOnly).unwrap();
        assert!(compute_dirty_properties(&WIDGET, &entry, &widget_state("b", 11)).is_empty());
        entry.transition(Status::Deleted).unwrap();
        assert!(compute_dirty_properties(&WIDGET, &entry, &widget_state("b", 11)).is_empty());
    }

    #[test]
    fn test_pending_insert_has_no_snapshot() {
        let entry = EntityEntry::pending_insert("Widget", None, None);
        assert!(compute_dirty_properties(&WIDGET, &entry, &widget_state("b", 11)).is_empty());
    }

    #[test]
    fn test_non_updatable_property_is_never_dirty() {
        const PROPS: &[PropertyInfo] = &[
            PropertyInfo::basic("code", &types::TEXT).updatable(false),
            PropertyInfo::basic("status", &types::TEXT),
        ];
        let shape = EntityShape::new("Ticket", PROPS);
        let entry = EntityEntry::loaded(
            "Ticket",
            Value::BigInt(1),
            vec![text("A-1"), text("open")],
            None,
            Status::Managed,
        );
        assert!(compute_dirty_properties(&shape, &entry, &[text("B-2"), text("open")]).is_empty());
        assert_eq!(
            compute_dirty_properties(&shape, &entry, &[text("B-2"), text("closed")]),
            vec![1]
        );
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        const PROPS: &[PropertyInfo] = &[PropertyInfo::basic("payload", &types::BINARY)];
        let shape = EntityShape::new("Blob", PROPS);
        let mut state = vec![StateValue::Basic(Value::Bytes(vec![1, 2]))];
        let snapshot = snapshot_state(&shape, &state);
        if let StateValue::Basic(Value::Bytes(bytes)) = &mut state[0] {
            bytes.push(3);
        }
        assert_eq!(snapshot[0], StateValue::Basic(Value::Bytes(vec![1, 2])));
        assert!(is_property_dirty(&PROPS[0], &snapshot[0], &state[0]));
    }

    #[test]
    fn test_optimistic_lock_state_styles() {
        let loaded = widget_state("a", 10);
        let flatten = |v: &StateValue| v.as_value().cloned().unwrap_or(Value::Null);

        assert!(optimistic_lock_state(&WIDGET, &loaded, &[0], flatten).is_empty());

        let dirty_style = WIDGET.optimistic_lock(OptimisticLockStyle::Dirty);
        assert_eq!(
            optimistic_lock_state(&dirty_style, &loaded, &[0], flatten),
            vec![(0, Value::Text("a".into()))]
        );

        let all_style = WIDGET.optimistic_lock(OptimisticLockStyle::All);
        let columns: Vec<usize> = optimistic_lock_state(&all_style, &loaded, &[0], flatten)
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        // version and the unfetched lazy property are excluded
        assert_eq!(columns, vec![0, 1, 4]);
    }
}
