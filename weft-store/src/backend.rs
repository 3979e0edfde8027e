//! Backend - the storage contract behind every data store
//!
//! Concrete engines implement the primitive operations; the container
//! mutations (increment, set ops, vector push/pop) are provided on top of
//! `lookup_expiry` + `insert`, so every engine shares one set of mutation
//! semantics.

use crate::mutate;
use std::path::PathBuf;
use thiserror::Error;
use weft_model::{Data, ExpirationTime, SequenceNum, Snapshot, Timestamp};

/// Errors raised by storage engines.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a container mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modified {
    /// The mutation applied; carries the refreshed expiry, if any.
    Applied { expiry: Option<ExpirationTime> },
    /// The stored value has the wrong shape for this mutation.
    TypeClash,
}

/// Which engine to instantiate for a new master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Memory,
    Persistent,
}

/// Engine construction options.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// On-disk location, required for persistent engines.
    pub path: Option<PathBuf>,
}

/// Instantiate an engine of the requested type.
pub fn open_backend(
    ty: BackendType,
    options: BackendOptions,
) -> Result<Box<dyn Backend>, BackendError> {
    match ty {
        BackendType::Memory => Ok(Box::new(crate::MemoryBackend::new())),
        BackendType::Persistent => {
            let path = options.path.ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "persistent backend requires a path",
                )
            })?;
            Ok(Box::new(crate::PrefixDb::open(path)?))
        }
    }
}

/// The storage operation set every engine fulfills.
///
/// Mutating operations never touch the sequence number themselves; the
/// owning master calls `increase_sequence` after each successful apply.
pub trait Backend: Send {
    /// Replace all state with the snapshot's entries and sequence.
    fn init(&mut self, snapshot: Snapshot) -> Result<(), BackendError>;

    fn sequence(&self) -> SequenceNum;

    fn increase_sequence(&mut self);

    /// Overwrite the mapping for `key`; set or delete its expiry per the
    /// argument.
    fn insert(
        &mut self,
        key: Data,
        value: Data,
        expiry: Option<ExpirationTime>,
    ) -> Result<(), BackendError>;

    /// Remove the mapping and its expiry, if any.
    fn erase(&mut self, key: &Data) -> Result<(), BackendError>;

    fn lookup(&self, key: &Data) -> Result<Option<Data>, BackendError>;

    /// Value and expiry; each may be absent independently.
    fn lookup_expiry(
        &self,
        key: &Data,
    ) -> Result<(Option<Data>, Option<ExpirationTime>), BackendError>;

    fn keys(&self) -> Result<Vec<Data>, BackendError>;

    fn size(&self) -> Result<u64, BackendError>;

    /// All entries plus the current sequence.
    fn snap(&self) -> Result<Snapshot, BackendError>;

    /// All scheduled expiries, for scheduler reloads.
    fn expiries(&self) -> Result<Vec<(Data, ExpirationTime)>, BackendError>;

    /// Destroy all state; equivalent to reopening empty.
    fn clear(&mut self) -> Result<(), BackendError>;

    fn exists(&self, key: &Data) -> Result<bool, BackendError> {
        Ok(self.lookup(key)?.is_some())
    }

    /// Erase `key` only if its stored expiry still equals `expiration`.
    /// Returns whether the entry was erased. The equality check defeats
    /// races with mutations that re-anchored the expiry in the meantime.
    fn expire(
        &mut self,
        key: &Data,
        expiration: &ExpirationTime,
    ) -> Result<bool, BackendError> {
        let (_, stored) = self.lookup_expiry(key)?;
        if stored.as_ref() == Some(expiration) {
            self.erase(key)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Add `by` to an integer or count value, materializing an absent key
    /// from zero.
    fn increment(
        &mut self,
        key: &Data,
        by: i64,
        mod_time: Timestamp,
    ) -> Result<Modified, BackendError> {
        let (value, expiry) = self.lookup_expiry(key)?;
        let Ok(next) = mutate::increment(value, by) else {
            return Ok(Modified::TypeClash);
        };
        self.write_back(key, next, expiry, mod_time)
    }

    fn add_to_set(
        &mut self,
        key: &Data,
        element: Data,
        mod_time: Timestamp,
    ) -> Result<Modified, BackendError> {
        let (value, expiry) = self.lookup_expiry(key)?;
        let Ok(next) = mutate::add_to_set(value, element) else {
            return Ok(Modified::TypeClash);
        };
        self.write_back(key, next, expiry, mod_time)
    }

    fn remove_from_set(
        &mut self,
        key: &Data,
        element: &Data,
        mod_time: Timestamp,
    ) -> Result<Modified, BackendError> {
        let (value, expiry) = self.lookup_expiry(key)?;
        let Ok(next) = mutate::remove_from_set(value, element) else {
            return Ok(Modified::TypeClash);
        };
        self.write_back(key, next, expiry, mod_time)
    }

    fn push_left(
        &mut self,
        key: &Data,
        items: Vec<Data>,
        mod_time: Timestamp,
    ) -> Result<Modified, BackendError> {
        let (value, expiry) = self.lookup_expiry(key)?;
        let Ok(next) = mutate::push_front(value, items) else {
            return Ok(Modified::TypeClash);
        };
        self.write_back(key, next, expiry, mod_time)
    }

    fn push_right(
        &mut self,
        key: &Data,
        items: Vec<Data>,
        mod_time: Timestamp,
    ) -> Result<Modified, BackendError> {
        let (value, expiry) = self.lookup_expiry(key)?;
        let Ok(next) = mutate::push_back(value, items) else {
            return Ok(Modified::TypeClash);
        };
        self.write_back(key, next, expiry, mod_time)
    }

    /// Pop from the front of a vector value. An absent key or empty vector
    /// succeeds without a value and writes nothing.
    fn pop_left(
        &mut self,
        key: &Data,
        mod_time: Timestamp,
    ) -> Result<(Modified, Option<Data>), BackendError> {
        let (value, expiry) = self.lookup_expiry(key)?;
        let Some(value) = value else {
            return Ok((Modified::Applied { expiry: None }, None));
        };
        let Ok((rest, popped)) = mutate::pop_front(value) else {
            return Ok((Modified::TypeClash, None));
        };
        let Some(popped) = popped else {
            return Ok((Modified::Applied { expiry: None }, None));
        };
        let modified = self.write_back(key, rest, expiry, mod_time)?;
        Ok((modified, Some(popped)))
    }

    fn pop_right(
        &mut self,
        key: &Data,
        mod_time: Timestamp,
    ) -> Result<(Modified, Option<Data>), BackendError> {
        let (value, expiry) = self.lookup_expiry(key)?;
        let Some(value) = value else {
            return Ok((Modified::Applied { expiry: None }, None));
        };
        let Ok((rest, popped)) = mutate::pop_back(value) else {
            return Ok((Modified::TypeClash, None));
        };
        let Some(popped) = popped else {
            return Ok((Modified::Applied { expiry: None }, None));
        };
        let modified = self.write_back(key, rest, expiry, mod_time)?;
        Ok((modified, Some(popped)))
    }

    /// Store a mutated value, re-anchoring any existing expiry at
    /// `mod_time`.
    #[doc(hidden)]
    fn write_back(
        &mut self,
        key: &Data,
        value: Data,
        expiry: Option<ExpirationTime>,
        mod_time: Timestamp,
    ) -> Result<Modified, BackendError> {
        let expiry = expiry.map(|e| e.refreshed(mod_time));
        self.insert(key.clone(), value, expiry)?;
        Ok(Modified::Applied { expiry })
    }
}
