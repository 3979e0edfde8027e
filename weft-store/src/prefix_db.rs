//! PrefixDb - persistent engine over an ordered embedded KV store
//!
//! One redb table holds everything; logical keys are serialized and
//! prefixed with a one-byte keyspace tag:
//! - `m` - engine metadata (version string, written at open)
//! - `a` - application data
//! - `e` - expiration values
//!
//! A value-plus-expiry insert is one write transaction. A dangling `e` row
//! without its `a` row (possible after a crash mid-erase on other engines)
//! is treated as absent on every read path.

use crate::backend::{Backend, BackendError};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use weft_model::{Data, Entry, ExpirationTime, SequenceNum, Snapshot};

const KV_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");

const KEYSPACE_META: u8 = b'm';
const KEYSPACE_DATA: u8 = b'a';
const KEYSPACE_EXPIRY: u8 = b'e';

const VERSION_KEY: &str = "weft_version";

fn tagged_key(tag: u8, key: &Data) -> Result<Vec<u8>, BackendError> {
    let mut buf = vec![tag];
    bincode::serialize_into(&mut buf, key)?;
    Ok(buf)
}

/// Persistent prefix-keyed backend.
pub struct PrefixDb {
    db: Database,
    seq: SequenceNum,
}

impl PrefixDb {
    /// Open or create the store at `path` and stamp the engine version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            let mut version_key = vec![KEYSPACE_META];
            version_key.extend_from_slice(VERSION_KEY.as_bytes());
            table.insert(
                version_key.as_slice(),
                env!("CARGO_PKG_VERSION").as_bytes(),
            )?;
        }
        write_txn.commit()?;

        Ok(PrefixDb { db, seq: 0 })
    }

    /// All rows in one keyspace, as raw (key, value) pairs with the tag
    /// stripped from the key.
    fn scan(&self, tag: u8) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BackendError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;
        let lower = [tag];
        let upper = [tag + 1];
        let mut rows = Vec::new();
        for item in table.range::<&[u8]>(&lower[..]..&upper[..])? {
            let (k, v) = item?;
            rows.push((k.value()[1..].to_vec(), v.value().to_vec()));
        }
        Ok(rows)
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;
        Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
    }

    fn remove_keyspaces(
        table: &mut redb::Table<&[u8], &[u8]>,
        tags: &[u8],
    ) -> Result<(), BackendError> {
        for &tag in tags {
            let lower = [tag];
            let upper = [tag + 1];
            let keys: Vec<Vec<u8>> = table
                .range::<&[u8]>(&lower[..]..&upper[..])?
                .map(|item| item.map(|(k, _)| k.value().to_vec()))
                .collect::<Result<_, _>>()?;
            for key in keys {
                table.remove(key.as_slice())?;
            }
        }
        Ok(())
    }
}

impl Backend for PrefixDb {
    fn init(&mut self, snapshot: Snapshot) -> Result<(), BackendError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            Self::remove_keyspaces(&mut table, &[KEYSPACE_DATA, KEYSPACE_EXPIRY])?;
            for (key, entry) in &snapshot.entries {
                let data_key = tagged_key(KEYSPACE_DATA, key)?;
                table.insert(data_key.as_slice(), bincode::serialize(&entry.value)?.as_slice())?;
                if let Some(expiry) = &entry.expiry {
                    let expiry_key = tagged_key(KEYSPACE_EXPIRY, key)?;
                    table.insert(expiry_key.as_slice(), bincode::serialize(expiry)?.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
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
        let data_key = tagged_key(KEYSPACE_DATA, &key)?;
        let expiry_key = tagged_key(KEYSPACE_EXPIRY, &key)?;
        let value_bytes = bincode::serialize(&value)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            table.insert(data_key.as_slice(), value_bytes.as_slice())?;
            match &expiry {
                Some(e) => {
                    table.insert(expiry_key.as_slice(), bincode::serialize(e)?.as_slice())?;
                }
                None => {
                    table.remove(expiry_key.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn erase(&mut self, key: &Data) -> Result<(), BackendError> {
        let data_key = tagged_key(KEYSPACE_DATA, key)?;
        let expiry_key = tagged_key(KEYSPACE_EXPIRY, key)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            table.remove(data_key.as_slice())?;
            table.remove(expiry_key.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn lookup(&self, key: &Data) -> Result<Option<Data>, BackendError> {
        let data_key = tagged_key(KEYSPACE_DATA, key)?;
        match self.get_raw(&data_key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn lookup_expiry(
        &self,
        key: &Data,
    ) -> Result<(Option<Data>, Option<ExpirationTime>), BackendError> {
        let data_key = tagged_key(KEYSPACE_DATA, key)?;
        let Some(value_bytes) = self.get_raw(&data_key)? else {
            // A dangling expiry row without its data row counts as absent.
            return Ok((None, None));
        };
        let value: Data = bincode::deserialize(&value_bytes)?;

        let expiry_key = tagged_key(KEYSPACE_EXPIRY, key)?;
        let expiry = match self.get_raw(&expiry_key)? {
            Some(bytes) => Some(bincode::deserialize(&bytes)?),
            None => None,
        };
        Ok((Some(value), expiry))
    }

    fn keys(&self) -> Result<Vec<Data>, BackendError> {
        self.scan(KEYSPACE_DATA)?
            .into_iter()
            .map(|(k, _)| bincode::deserialize(&k).map_err(BackendError::from))
            .collect()
    }

    fn size(&self) -> Result<u64, BackendError> {
        Ok(self.scan(KEYSPACE_DATA)?.len() as u64)
    }

    fn snap(&self) -> Result<Snapshot, BackendError> {
        let mut expiries = std::collections::BTreeMap::new();
        for (k, v) in self.scan(KEYSPACE_EXPIRY)? {
            let key: Data = bincode::deserialize(&k)?;
            let expiry: ExpirationTime = bincode::deserialize(&v)?;
            expiries.insert(key, expiry);
        }

        let mut entries = Vec::new();
        for (k, v) in self.scan(KEYSPACE_DATA)? {
            let key: Data = bincode::deserialize(&k)?;
            let value: Data = bincode::deserialize(&v)?;
            let expiry = expiries.remove(&key);
            entries.push((key, Entry { value, expiry }));
        }

        Ok(Snapshot {
            seq: self.seq,
            entries,
        })
    }

    fn expiries(&self) -> Result<Vec<(Data, ExpirationTime)>, BackendError> {
        let mut rows = Vec::new();
        for (k, v) in self.scan(KEYSPACE_EXPIRY)? {
            let key: Data = bincode::deserialize(&k)?;
            let data_key = tagged_key(KEYSPACE_DATA, &key)?;
            if self.get_raw(&data_key)?.is_none() {
                tracing::warn!(key = ?key, "skipping dangling expiry row");
                continue;
            }
            rows.push((key, bincode::deserialize(&v)?));
        }
        Ok(rows)
    }

    fn clear(&mut self) -> Result<(), BackendError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            Self::remove_keyspaces(&mut table, &[KEYSPACE_DATA, KEYSPACE_EXPIRY])?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
