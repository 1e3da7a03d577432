//! Lock modes for named sections.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a named section is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Concurrent holders allowed; the last writer wins on save.
    Shared,
    /// Single holder; other acquirers wait up to the configured timeout.
    Exclusive,
    /// Concurrent holders allowed; saving is a no-op.
    ReadOnly,
    /// Never waits; a save fails if another holder saved first.
    FirstComeFirstServed,
}

impl LockMode {
    /// Whether sections acquired in this mode are ever persisted.
    pub fn is_writable(&self) -> bool {
        !matches!(self, LockMode::ReadOnly)
    }

    /// Whether acquisition in this mode may wait for other holders.
    pub fn blocks(&self) -> bool {
        matches!(self, LockMode::Shared | LockMode::Exclusive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
            LockMode::ReadOnly => "read_only",
            LockMode::FirstComeFirstServed => "first_come_first_served",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
