use std::collections::HashSet;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::IVec;

use crate::config::{RetentionPolicy, TableOptions};
use crate::encoding::encode;
use crate::lock::KeyLock;
use crate::query::Example;
use crate::record::Record;
use crate::result::{BoxError, DbResult, StoreError};
use crate::serializer::{BincodeSerializer, Serializer};
use crate::table::{decode_row, Table, WriteMode};
use crate::Store;

pub trait RecordType: Serialize + DeserializeOwned {}
impl<T: Serialize + DeserializeOwned> RecordType for T {}

/// Iteration order by sequence id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

/// Outcome of [`RecordStore::shrink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkReport {
    /// Index entries dropped because their row no longer existed.
    pub dangling_ids: usize,
    /// Rows dropped because no index entry pointed at them.
    pub orphan_rows: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Typed records stored under string keys in a single table.
///
/// What a read sees depends on the table's [`RetentionPolicy`]: the latest
/// row per key for [`RetentionPolicy::Default`], every row for
/// [`RetentionPolicy::KeepHistory`] and the single row per key for
/// [`RetentionPolicy::UniqueKeys`]. [`RecordStore::history`] always sees every
/// stored row.
///
/// Handles are cheap to clone and safe to share between threads.
pub struct RecordStore<T, S = BincodeSerializer<T>> {
    store: Store,
    table: Table,
    locks: Arc<KeyLock>,
    serializer: Arc<S>,
    options: TableOptions,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S> Clone for RecordStore<T, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            table: self.table.clone(),
            locks: self.locks.clone(),
            serializer: self.serializer.clone(),
            options: self.options,
            _marker: PhantomData,
        }
    }
}

impl<T, S> RecordStore<T, S>
where
    T: RecordType,
    S: Serializer<T>,
{
    /// Creates a record store over an opened table.
    ///
    /// This method is intended for internal use. Use [`Store::open_table`] or
    /// [`Store::open_table_with`] instead.
    pub(crate) fn new(
        store: Store,
        table: Table,
        locks: Arc<KeyLock>,
        serializer: S,
        options: TableOptions,
    ) -> Self {
        Self {
            store,
            table,
            locks,
            serializer: Arc::new(serializer),
            options,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.table.name()
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.options.policy
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Store `value` under `key`.
    ///
    /// Appends a new row, or overwrites the existing one under
    /// [`RetentionPolicy::UniqueKeys`].
    ///
    /// # Errors
    ///
    /// [`StoreError::Serialization`] if `value` cannot be encoded,
    /// [`StoreError::Storage`] if the transaction fails. Nothing is written in
    /// either case.
    pub fn set(&self, key: &str, value: &T) -> DbResult<()> {
        let payload = self.serializer.encode(value)?;
        self.table.write(&[(key.to_owned(), payload)], self.write_mode())?;

        Ok(())
    }

    /// Store every `(key, value)` pair in one transaction. Either all pairs
    /// become visible or none do.
    ///
    /// # Returns
    ///
    /// The number of pairs written.
    pub fn set_many<K, I>(&self, items: I) -> DbResult<usize>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, T)>,
    {
        let items = items
            .into_iter()
            .map(|(key, value)| Ok((key.into(), self.serializer.encode(&value)?)))
            .collect::<DbResult<Vec<_>>>()?;

        if items.is_empty() {
            return Ok(0);
        }

        let written = self.table.write(&items, self.write_mode())?.len();
        tracing::debug!(table = self.name(), rows = written, "batch written");

        Ok(written)
    }

    /// Every current value, lazily.
    ///
    /// Each call starts a fresh scan, so the sequence reflects the table at the
    /// time it is iterated.
    pub fn get_all(&self, order: Order) -> impl Iterator<Item = DbResult<T>> {
        self.records(order).map(|record| record.map(|record| record.data))
    }

    /// Every current record with its metadata, lazily.
    pub fn records(&self, order: Order) -> Records<T, S> {
        Records::from_scan(self, order)
    }

    /// Current values stored under `key`, oldest first.
    pub fn get(&self, key: &str) -> impl Iterator<Item = DbResult<T>> {
        self.get_details(key).map(|record| record.map(|record| record.data))
    }

    /// Current values stored under any of `keys`. Keys are visited in the
    /// order given, each once.
    pub fn get_many<K, I>(&self, keys: I) -> impl Iterator<Item = DbResult<T>>
    where
        K: Into<String>,
        I: IntoIterator<Item = K>,
    {
        let mut seen = HashSet::new();
        let keys = keys
            .into_iter()
            .map(Into::into)
            .filter(|key: &String| seen.insert(key.clone()))
            .collect();

        Records::from_keys(self, keys, self.latest_only())
            .map(|record| record.map(|record| record.data))
    }

    /// Current records stored under `key` with their sequence id and timestamp.
    pub fn get_details(&self, key: &str) -> Records<T, S> {
        Records::from_keys(self, vec![key.to_owned()], self.latest_only())
    }

    /// Every row ever stored under `key` and not yet deleted, oldest first,
    /// regardless of the retention policy.
    pub fn history(&self, key: &str) -> Records<T, S> {
        Records::from_keys(self, vec![key.to_owned()], false)
    }

    /// Current values matching every field of `example`.
    ///
    /// Evaluated over decoded values, one full scan per call.
    pub fn find(&self, example: Example) -> impl Iterator<Item = DbResult<T>> {
        let predicate = example.into_predicate();

        self.records(Order::Ascending)
            .filter_map(move |record| match record {
                Ok(record) => match predicate.matches(&record.data) {
                    Ok(true) => Some(Ok(record.data)),
                    Ok(false) => None,
                    Err(err) => Some(Err(err)),
                },
                Err(err) => Some(Err(err)),
            })
    }

    /// Number of current records.
    pub fn count(&self) -> usize {
        match self.policy() {
            RetentionPolicy::Default => self.table.key_count(),
            RetentionPolicy::KeepHistory | RetentionPolicy::UniqueKeys => self.table.len(),
        }
    }

    pub fn contains(&self, key: &str) -> DbResult<bool> {
        Ok(self.table.latest_id(key)?.is_some())
    }

    /// Every key with at least one stored row, in byte order.
    pub fn keys(&self) -> impl Iterator<Item = DbResult<String>> {
        self.table.keys()
    }

    /// Apply `mutator` to every current record under `key`.
    ///
    /// Calls on the same key are serialized; a second call does not read until
    /// the first has written. Calls on different keys run concurrently. A
    /// missing key is left missing.
    ///
    /// `mutator` returns whether it changed the value. Unchanged rows are not
    /// written and not returned.
    ///
    /// # Returns
    ///
    /// The values written back.
    pub fn get_and_modify<F>(&self, key: &str, mut mutator: F) -> DbResult<Vec<T>>
    where
        F: FnMut(&mut T) -> bool,
    {
        self.try_get_and_modify(key, |value| Ok::<_, Infallible>(mutator(value)))
    }

    /// Like [`RecordStore::get_and_modify`] with a fallible mutator.
    ///
    /// # Errors
    ///
    /// [`StoreError::Mutator`] if `mutator` fails. The row it failed on is
    /// left unchanged; rows already written before it stay written.
    pub fn try_get_and_modify<F, E>(&self, key: &str, mut mutator: F) -> DbResult<Vec<T>>
    where
        F: FnMut(&mut T) -> Result<bool, E>,
        E: Into<BoxError>,
    {
        let _guard = self.locks.acquire(key);

        let mut ids = self.table.ids_for(key)?;
        if self.latest_only() {
            ids.drain(..ids.len().saturating_sub(1));
        }

        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(value) = self.modify_row(key, id, &mut mutator)? {
                updated.push(value);
            }
        }

        Ok(updated)
    }

    /// Apply `mutator` to every current record in the table.
    ///
    /// Each row is modified under its own key's lock, taken only for that
    /// row's update.
    pub fn get_and_modify_all<F>(&self, mut mutator: F) -> DbResult<Vec<T>>
    where
        F: FnMut(&mut T) -> bool,
    {
        self.try_get_and_modify_all(|value| Ok::<_, Infallible>(mutator(value)))
    }

    /// Like [`RecordStore::get_and_modify_all`] with a fallible mutator.
    pub fn try_get_and_modify_all<F, E>(&self, mut mutator: F) -> DbResult<Vec<T>>
    where
        F: FnMut(&mut T) -> Result<bool, E>,
        E: Into<BoxError>,
    {
        let mut updated = Vec::new();

        for entry in self.table.scan(false) {
            let (id, bytes) = entry?;
            let key = decode_row(&bytes)?.key;

            let _guard = self.locks.acquire(&key);
            // A newer row may have landed while waiting for the lock.
            if self.latest_only() && self.table.latest_id(&key)? != Some(id) {
                continue;
            }

            if let Some(value) = self.modify_row(&key, id, &mut mutator)? {
                updated.push(value);
            }
        }

        Ok(updated)
    }

    /// Remove every row stored under `key`, history included.
    ///
    /// # Returns
    ///
    /// The number of rows removed.
    pub fn delete(&self, key: &str) -> DbResult<usize> {
        let _guard = self.locks.acquire(key);
        let removed = self.table.remove_key(key)?.len();
        tracing::debug!(table = self.name(), key, rows = removed, "deleted key");

        Ok(removed)
    }

    /// Remove every row in the table in one transaction.
    ///
    /// # Returns
    ///
    /// The number of rows removed.
    pub fn clear(&self) -> DbResult<usize> {
        let removed = self.table.clear()?;
        tracing::debug!(table = self.name(), rows = removed, "cleared table");

        Ok(removed)
    }

    /// Maintenance pass: drops dangling index entries and unindexed rows, then
    /// flushes the engine so freed pages can be reclaimed. Logical contents
    /// are unchanged.
    ///
    /// Competes with every other operation on the same store for disk I/O;
    /// not meant for a hot path.
    pub fn shrink(&self) -> DbResult<ShrinkReport> {
        let bytes_before = self.store.size_on_disk()?;
        let dangling_ids = self.table.prune()?;
        let orphan_rows = self.table.drop_orphans()?;
        self.store.flush()?;
        let bytes_after = self.store.size_on_disk()?;

        tracing::debug!(
            table = self.name(),
            dangling_ids,
            orphan_rows,
            bytes_before,
            bytes_after,
            "shrunk table"
        );

        Ok(ShrinkReport {
            dangling_ids,
            orphan_rows,
            bytes_before,
            bytes_after,
        })
    }

    /// Read-modify-write of a single row. The caller holds the row's key lock.
    ///
    /// The write only lands if the row still holds what was read; a concurrent
    /// `set` in between makes the mutator run again on the newer value.
    fn modify_row<F, E>(&self, key: &str, id: u64, mutator: &mut F) -> DbResult<Option<T>>
    where
        F: FnMut(&mut T) -> Result<bool, E>,
        E: Into<BoxError>,
    {
        loop {
            let current = match self.table.row(id)? {
                Some(current) => current,
                None => return Ok(None),
            };

            let mut row = decode_row(&current)?;
            let mut value = self.serializer.decode(&row.payload)?;

            let changed = mutator(&mut value).map_err(|source| StoreError::Mutator {
                key: key.to_owned(),
                source: source.into(),
            })?;
            if !changed {
                return Ok(None);
            }

            row.payload = self.serializer.encode(&value)?;
            row.timestamp = Utc::now();

            if self.table.swap_row(id, &current, encode(&row)?)? {
                tracing::trace!(table = self.name(), key, id, "row modified");
                return Ok(Some(value));
            }

            tracing::warn!(
                table = self.name(),
                key,
                id,
                "row changed during modification, retrying"
            );
        }
    }

    fn write_mode(&self) -> WriteMode {
        match self.policy() {
            RetentionPolicy::UniqueKeys => WriteMode::Overwrite,
            RetentionPolicy::Default | RetentionPolicy::KeepHistory => WriteMode::Append,
        }
    }

    /// Whether reads only see the newest row of each key.
    fn latest_only(&self) -> bool {
        self.policy() == RetentionPolicy::Default
    }
}

enum Source {
    Scan(Box<dyn Iterator<Item = DbResult<(u64, IVec)>>>),
    Keys {
        keys: std::vec::IntoIter<String>,
        ids: std::vec::IntoIter<u64>,
    },
}

/// Lazy sequence of records produced by [`RecordStore`] reads.
///
/// Rows are fetched and decoded one at a time as the sequence is advanced.
pub struct Records<T, S> {
    source: Source,
    table: Table,
    serializer: Arc<S>,
    latest_only: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S> Records<T, S>
where
    T: RecordType,
    S: Serializer<T>,
{
    fn from_scan(store: &RecordStore<T, S>, order: Order) -> Self {
        Self {
            source: Source::Scan(store.table.scan(order == Order::Descending)),
            table: store.table.clone(),
            serializer: store.serializer.clone(),
            latest_only: store.latest_only(),
            _marker: PhantomData,
        }
    }

    fn from_keys(store: &RecordStore<T, S>, keys: Vec<String>, latest_only: bool) -> Self {
        Self {
            source: Source::Keys {
                keys: keys.into_iter(),
                ids: Vec::new().into_iter(),
            },
            table: store.table.clone(),
            serializer: store.serializer.clone(),
            latest_only,
            _marker: PhantomData,
        }
    }

    /// Next raw row from the source. Ids whose row has since been removed are skipped.
    fn next_row(&mut self) -> Option<DbResult<(u64, IVec)>> {
        match &mut self.source {
            Source::Scan(rows) => rows.next(),
            Source::Keys { keys, ids } => loop {
                if let Some(id) = ids.next() {
                    match self.table.row(id) {
                        Ok(Some(bytes)) => return Some(Ok((id, bytes))),
                        Ok(None) => continue,
                        Err(err) => return Some(Err(err)),
                    }
                }

                let key = keys.next()?;
                let mut found = match self.table.ids_for(&key) {
                    Ok(found) => found,
                    Err(err) => return Some(Err(err)),
                };
                if self.latest_only {
                    found.drain(..found.len().saturating_sub(1));
                }
                *ids = found.into_iter();
            },
        }
    }

    fn decode(&self, id: u64, bytes: &[u8]) -> DbResult<Option<Record<T>>> {
        let row = decode_row(bytes)?;

        // Key sources already picked the newest id.
        if self.latest_only
            && matches!(self.source, Source::Scan(_))
            && self.table.latest_id(&row.key)? != Some(id)
        {
            return Ok(None);
        }

        Ok(Some(Record {
            id,
            data: self.serializer.decode(&row.payload)?,
            key: row.key,
            timestamp: row.timestamp,
        }))
    }
}

impl<T, S> Iterator for Records<T, S>
where
    T: RecordType,
    S: Serializer<T>,
{
    type Item = DbResult<Record<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (id, bytes) = match self.next_row()? {
                Ok(row) => row,
                Err(err) => return Some(Err(err)),
            };

            match self.decode(id, &bytes) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
