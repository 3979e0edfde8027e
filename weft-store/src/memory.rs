//! MemoryBackend - ordered in-memory engine
//!
//! Backs clone replicas and tests. Keeps entries in a `BTreeMap` so scans
//! come out in key order, matching the persistent engine.

use crate::backend::{Backend, BackendError};
use std::collections::BTreeMap;
use weft_model::{Data, Entry, ExpirationTime, SequenceNum, Snapshot};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: BTreeMap<Data, Entry>,
    seq: SequenceNum,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }
}

impl Backend for MemoryBackend {
    fn init(&mut self, snapshot: Snapshot) -> Result<(), BackendError> {
        self.entries = snapshot.entries.into_iter().collect();
        self.seq = snapshot.seq;
        Ok(())
    }

    fn sequence(&self) -> SequenceNum {
        self.seq
    }

    fn increase_sequence(&mut self) {
        self.seq += 1;
    }

    fn insert(
        &mut self,
        key: Data,
        value: Data,
        expiry: Option<ExpirationTime>,
    ) -> Result<(), BackendError> {
        self.entries.insert(key, Entry { value, expiry });
        Ok(())
    }

    fn erase(&mut self, key: &Data) -> Result<(), BackendError> {
        self.entries.remove(key);
        Ok(())
    }

    fn lookup(&self, key: &Data) -> Result<Option<Data>, BackendError> {
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }

    fn lookup_expiry(
        &self,
        key: &Data,
    ) -> Result<(Option<Data>, Option<ExpirationTime>), BackendError> {
        match self.entries.get(key) {
            Some(entry) => Ok((Some(entry.value.clone()), entry.expiry)),
            None => Ok((None, None)),
        }
    }

    fn keys(&self) -> Result<Vec<Data>, BackendError> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn size(&self) -> Result<u64, BackendError> {
        Ok(self.entries.len() as u64)
    }

    fn snap(&self) -> Result<Snapshot, BackendError> {
        Ok(Snapshot {
            seq: self.seq,
            entries: self
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect(),
        })
    }

    fn expiries(&self) -> Result<Vec<(Data, ExpirationTime)>, BackendError> {
        Ok(self
            .entries
            .iter()
            .filter_map(|(k, e)| e.expiry.map(|x| (k.clone(), x)))
            .collect())
    }

    fn clear(&mut self) -> Result<(), BackendError> {
        self.entries.clear();
        Ok(())
    }
}
