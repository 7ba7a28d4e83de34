//! Lock modes.

use serde::{Deserialize, Serialize};

/// Lock held (or requested) on an entity within a unit of work.
///
/// Variants are ordered by strength; see [`LockMode::level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// No lock; entity was instantiated without reading the row.
    #[default]
    None,
    /// Row was read from storage in this unit of work.
    Read,
    /// Verify the version at commit.
    Optimistic,
    /// Increment the version at the next flush even if nothing changed.
    OptimisticForceIncrement,
    /// Row was written by this unit of work.
    Write,
    PessimisticRead,
    PessimisticWrite,
    PessimisticForceIncrement,
}

impl LockMode {
    pub const fn level(self) -> u8 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 1,
            LockMode::Optimistic => 2,
            LockMode::OptimisticForceIncrement => 3,
            LockMode::PessimisticRead => 4,
            LockMode::PessimisticWrite => 5,
            LockMode::PessimisticForceIncrement => 6,
            LockMode::Write => 7,
        }
    }

    pub const fn greater_than(self, other: LockMode) -> bool {
        self.level() > other.level()
    }

    /// Whether this mode requires a statement against storage when acquired.
    pub const fn is_pessimistic(self) -> bool {
        matches!(
            self,
            LockMode::PessimisticRead
                | LockMode::PessimisticWrite
                | LockMode::PessimisticForceIncrement
        )
    }

    /// Whether acquiring this mode forces a version increment.
    pub const fn forces_increment(self) -> bool {
        matches!(
            self,
            LockMode::OptimisticForceIncrement | LockMode::PessimisticForceIncrement
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mode_ordering() {
        assert!(LockMode::Write.greater_than(LockMode::PessimisticWrite));
        assert!(LockMode::PessimisticWrite.greater_than(LockMode::Optimistic));
        assert!(!LockMode::Read.greater_than(LockMode::Read));
        assert!(LockMode::PessimisticForceIncrement.is_pessimistic());
        assert!(LockMode::PessimisticForceIncrement.forces_increment());
        assert!(!LockMode::Optimistic.forces_increment());
    }
}
