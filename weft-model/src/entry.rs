//! Store value entries, expiries, and snapshots

use crate::data::{Data, Span, Timestamp};
use serde::{Deserialize, Serialize};

/// Per-store version counter, bumped on every successful mutating command.
pub type SequenceNum = u64;

/// Expiry state attached to a store entry.
///
/// The deadline is `last_modification + expiry`; bumping the modification
/// time pushes the deadline out. Equality over the whole struct is what the
/// expiry race guard compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationTime {
    pub last_modification: Timestamp,
    pub expiry: Option<Span>,
}

impl ExpirationTime {
    pub fn new(last_modification: Timestamp, expiry: Option<Span>) -> Self {
        ExpirationTime {
            last_modification,
            expiry,
        }
    }

    /// The same expiry window, re-anchored at a new modification time.
    pub fn refreshed(&self, now: Timestamp) -> ExpirationTime {
        ExpirationTime {
            last_modification: now,
            expiry: self.expiry,
        }
    }

    /// Absolute deadline, if an expiry duration is set.
    pub fn deadline(&self) -> Option<Timestamp> {
        self.expiry.map(|span| self.last_modification.saturating_add(span))
    }
}

/// A stored value together with its optional expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub value: Data,
    pub expiry: Option<ExpirationTime>,
}

impl Entry {
    pub fn new(value: Data) -> Self {
        Entry {
            value,
            expiry: None,
        }
    }

    pub fn with_expiry(value: Data, expiry: ExpirationTime) -> Self {
        Entry {
            value,
            expiry: Some(expiry),
        }
    }
}

/// Full materialized store state: all entries plus the sequence number they
/// are valid at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub seq: SequenceNum,
    pub entries: Vec<(Data, Entry)>,
}
