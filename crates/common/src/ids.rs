//! Typed identifiers shared across spill components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable query identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(
    /// Raw id value.
    pub String,
);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique spiller identifier, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpillerId(
    /// Raw numeric id value.
    pub u64,
);

static NEXT_SPILLER_ID: AtomicU64 = AtomicU64::new(1);

impl SpillerId {
    /// Allocate the next id.
    pub fn next() -> Self {
        SpillerId(NEXT_SPILLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SpillerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
