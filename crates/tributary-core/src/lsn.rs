use std::fmt;

use serde::{Deserialize, Serialize};

/// Log Sequence Number - the globally monotonic, gap-free identifier of a
/// WAL entry. Assignment starts at 1; `Lsn::ZERO` means "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// Start of the log, before any entry has been assigned.
    pub const ZERO: Self = Self(0);

    /// Create an LSN from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The next LSN in sequence.
    ///
    /// # Panics
    ///
    /// Panics on `u64` overflow. Reaching it would take 18 quintillion
    /// appends, far beyond any realistic log lifetime.
    #[must_use]
    pub fn next(&self) -> Self {
        Self(self.0.checked_add(1).expect("LSN overflow"))
    }

    /// Raw integer value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// True for `Lsn::ZERO`.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}
