//! Association metadata: cascade styles and lazy state.

use crate::error::{Error, Result};
use crate::value::Value;
use std::fmt;

/// A lifecycle operation that can propagate across associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeAction {
    Persist,
    Merge,
    Delete,
    Refresh,
    Lock,
    Detach,
}

impl CascadeAction {
    const fn bit(self) -> u8 {
        match self {
            CascadeAction::Persist => 1,
            CascadeAction::Merge => 1 << 1,
            CascadeAction::Delete => 1 << 2,
            CascadeAction::Refresh => 1 << 3,
            CascadeAction::Lock => 1 << 4,
            CascadeAction::Detach => 1 << 5,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CascadeAction::Persist => "persist",
            CascadeAction::Merge => "merge",
            CascadeAction::Delete => "delete",
            CascadeAction::Refresh => "refresh",
            CascadeAction::Lock => "lock",
            CascadeAction::Detach => "detach",
        }
    }

    const ALL: [CascadeAction; 6] = [
        CascadeAction::Persist,
        CascadeAction::Merge,
        CascadeAction::Delete,
        CascadeAction::Refresh,
        CascadeAction::Lock,
        CascadeAction::Detach,
    ];
}

impl fmt::Display for CascadeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of cascade actions declared on one association, plus orphan removal.
///
/// Orphan removal implies [`CascadeAction::Delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CascadeStyle {
    actions: u8,
    orphan_removal: bool,
}

impl CascadeStyle {
    pub const NONE: CascadeStyle = CascadeStyle {
        actions: 0,
        orphan_removal: false,
    };

    pub const ALL: CascadeStyle = CascadeStyle {
        actions: 0b11_1111,
        orphan_removal: false,
    };

    pub const ALL_DELETE_ORPHAN: CascadeStyle = CascadeStyle {
        actions: 0b11_1111,
        orphan_removal: true,
    };

    pub const PERSIST: CascadeStyle = CascadeStyle::NONE.with(CascadeAction::Persist);

    /// Add an action to this style.
    pub const fn with(mut self, action: CascadeAction) -> Self {
        self.actions |= action.bit();
        self
    }

    /// Enable orphan removal (and with it, delete cascading).
    pub const fn orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self.actions |= CascadeAction::Delete.bit();
        self
    }

    pub const fn includes(&self, action: CascadeAction) -> bool {
        self.actions & action.bit() != 0
    }

    pub const fn has_orphan_removal(&self) -> bool {
        self.orphan_removal
    }

    pub const fn is_none(&self) -> bool {
        self.actions == 0 && !self.orphan_removal
    }

    /// Parse a comma-separated style such as `"persist, merge, delete-orphan"`.
    ///
    /// Accepted tokens: `all`, `all-delete-orphan`, `none`, `persist`
    /// (alias `save-update`), `merge`, `delete` (alias `remove`), `refresh`,
    /// `lock`, `detach` (alias `evict`), `delete-orphan` (alias `orphan-removal`).
    pub fn parse(spec: &str) -> Result<Self> {
        let mut style = CascadeStyle::NONE;
        for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            style = match token.to_ascii_lowercase().replace('_', "-").as_str() {
                "all" => style.union(CascadeStyle::ALL),
                "all-delete-orphan" => style.union(CascadeStyle::ALL_DELETE_ORPHAN),
                "none" => style,
                "persist" | "save-update" => style.with(CascadeAction::Persist),
                "merge" => style.with(CascadeAction::Merge),
                "delete" | "remove" => style.with(CascadeAction::Delete),
                "refresh" => style.with(CascadeAction::Refresh),
                "lock" => style.with(CascadeAction::Lock),
                "detach" | "evict" => style.with(CascadeAction::Detach),
                "delete-orphan" | "orphan-removal" => style.orphan_removal(),
                other => {
                    return Err(Error::Mapping(format!("unknown cascade style '{other}'")));
                }
            };
        }
        Ok(style)
    }

    pub const fn union(self, other: CascadeStyle) -> Self {
        CascadeStyle {
            actions: self.actions | other.actions,
            orphan_removal: self.orphan_removal || other.orphan_removal,
        }
    }
}

impl fmt::Display for CascadeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        let mut parts: Vec<&str> = CascadeAction::ALL
            .iter()
            .filter(|a| self.includes(**a))
            .map(|a| a.as_str())
            .collect();
        if self.orphan_removal {
            parts.push("delete-orphan");
        }
        f.write_str(&parts.join(", "))
    }
}

/// Load state of a lazily fetched value.
///
/// `Unloaded` carries the key needed to fetch the value: the identifier of a
/// referenced entity, or the owner identifier of a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum LazyState<T> {
    Unloaded(Value),
    Loading,
    Loaded(T),
}

impl<T> LazyState<T> {
    pub const fn is_loaded(&self) -> bool {
        matches!(self, LazyState::Loaded(_))
    }

    pub fn loaded(&self) -> Option<&T> {
        match self {
            LazyState::Loaded(value) => Some(value),
            LazyState::Unloaded(_) | LazyState::Loading => None,
        }
    }

    pub fn loaded_mut(&mut self) -> Option<&mut T> {
        match self {
            LazyState::Loaded(value) => Some(value),
            LazyState::Unloaded(_) | LazyState::Loading => None,
        }
    }

    /// Key of an unloaded value.
    pub fn pending_key(&self) -> Option<&Value> {
        match self {
            LazyState::Unloaded(key) => Some(key),
            LazyState::Loading | LazyState::Loaded(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cascade_style() {
        let style = CascadeStyle::parse("persist, merge, delete-orphan").unwrap();
        assert!(style.includes(CascadeAction::Persist));
        assert!(style.includes(CascadeAction::Merge));
        assert!(style.includes(CascadeAction::Delete));
        assert!(!style.includes(CascadeAction::Refresh));
        assert!(style.has_orphan_removal());
        assert_eq!(style.to_string(), "persist, merge, delete, delete-orphan");
    }

    #[test]
    fn test_parse_all_and_aliases() {
        let style = CascadeStyle::parse("all, delete-orphan").unwrap();
        assert_eq!(style, CascadeStyle::ALL_DELETE_ORPHAN);
        let style = CascadeStyle::parse("save-update, evict").unwrap();
        assert!(style.includes(CascadeAction::Persist));
        assert!(style.includes(CascadeAction::Detach));
        assert_eq!(CascadeStyle::parse("").unwrap(), CascadeStyle::NONE);
        assert_eq!(CascadeStyle::NONE.to_string(), "none");
    }

    #[test]
    fn test_parse_rejects_unknown_token() {
        let err = CascadeStyle::parse("persist, explode").unwrap_err();
        assert!(err.to_string().contains("explode"));
    }

    #[test]
    fn test_lazy_state_accessors() {
        let mut state: LazyState<Vec<i32>> = LazyState::Unloaded(Value::BigInt(3));
        assert_eq!(state.pending_key(), Some(&Value::BigInt(3)));
        assert!(state.loaded().is_none());
        state = LazyState::Loaded(vec![1]);
        state.loaded_mut().unwrap().push(2);
        assert_eq!(state.loaded(), Some(&vec![1, 2]));
        assert!(state.pending_key().is_none());
    }
}
