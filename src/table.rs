use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};
use sled::{Db, IVec, Transactional, Tree};

use crate::encoding::{decode, encode, id_from_key, id_key};
use crate::record::StoredRow;
use crate::result::{DbResult, StoreError};

/// How a write treats rows already stored under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// Add a new row next to the existing ones.
    Append,
    /// Replace the existing row in place, keeping its id.
    Overwrite,
}

/// A named table over the storage engine.
///
/// Rows live in a tree keyed by their big-endian sequence id, so iteration
/// order is insertion order. A second tree maps each record key to the ids of
/// its rows, oldest first. Both trees are only ever changed together inside a
/// transaction.
#[derive(Clone)]
pub(crate) struct Table {
    engine: Db,
    rows: Tree,
    keys: Tree,
    name: String,
}

impl Table {
    /// Open (or create) the trees backing `name`.
    pub fn open(engine: &Db, name: &str) -> DbResult<Self> {
        Ok(Self {
            engine: engine.clone(),
            rows: engine.open_tree(name)?,
            keys: engine.open_tree(format!("{}_idx_key", name))?,
            name: name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write every `(key, payload)` pair in a single transaction.
    ///
    /// # Returns
    ///
    /// The id of the row each pair landed in, in input order.
    pub fn write(&self, items: &[(String, Vec<u8>)], mode: WriteMode) -> DbResult<Vec<u64>> {
        // Ids come from outside the transaction so a conflict retry reuses them.
        let mut prepared = Vec::with_capacity(items.len());
        for (key, payload) in items {
            let row = StoredRow::new(key, payload.clone());
            prepared.push((key.as_str(), self.engine.generate_id()?, encode(&row)?));
        }

        let ids = (&self.rows, &self.keys).transaction(|(rows, keys)| {
            let mut written = Vec::with_capacity(prepared.len());

            for (key, fresh_id, row) in &prepared {
                let mut ids = load_ids(keys, key.as_bytes())?;

                let id = match (mode, ids.last().copied()) {
                    (WriteMode::Overwrite, Some(current)) => {
                        // Leftovers from a table previously opened with history.
                        for stale in ids.drain(..ids.len() - 1) {
                            rows.remove(id_key(stale))?;
                        }
                        current
                    }
                    _ => {
                        // Ids are drawn before commit, so writers can commit out of id order.
                        let at = ids.partition_point(|id| id < fresh_id);
                        ids.insert(at, *fresh_id);
                        *fresh_id
                    }
                };

                rows.insert(id_key(id), row.as_slice())?;
                keys.insert(key.as_bytes(), encode(&ids).map_err(abort)?)?;
                written.push(id);
            }

            Ok::<_, ConflictableTransactionError<StoreError>>(written)
        })?;

        Ok(ids)
    }

    /// Fetch a raw row by id.
    pub fn row(&self, id: u64) -> DbResult<Option<IVec>> {
        Ok(self.rows.get(id_key(id))?)
    }

    /// Ids of every row stored under `key`, oldest first.
    pub fn ids_for(&self, key: &str) -> DbResult<Vec<u64>> {
        match self.keys.get(key.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Id of the newest row stored under `key`.
    pub fn latest_id(&self, key: &str) -> DbResult<Option<u64>> {
        Ok(self.ids_for(key)?.last().copied())
    }

    /// Replace the row `id` with `new` only if it still holds `current`.
    ///
    /// # Returns
    ///
    /// `false` if the row changed or disappeared since `current` was read.
    pub fn swap_row(&self, id: u64, current: &IVec, new: Vec<u8>) -> DbResult<bool> {
        Ok(self
            .rows
            .compare_and_swap(id_key(id), Some(current), Some(new))?
            .is_ok())
    }

    /// Iterate raw rows in id order.
    pub fn scan(&self, reverse: bool) -> Box<dyn Iterator<Item = DbResult<(u64, IVec)>>> {
        let iter = self.rows.iter();
        let iter: Box<dyn Iterator<Item = sled::Result<(IVec, IVec)>>> = if reverse {
            Box::new(iter.rev())
        } else {
            Box::new(iter)
        };

        Box::new(iter.map(|entry| {
            let (key, value) = entry?;
            Ok((id_from_key(&key)?, value))
        }))
    }

    /// Iterate the distinct record keys.
    pub fn keys(&self) -> impl Iterator<Item = DbResult<String>> {
        self.keys.iter().keys().map(|key| {
            let key = key?;
            String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Corrupted("record key is not utf-8".to_owned()))
        })
    }

    /// Remove every row stored under `key`.
    ///
    /// # Returns
    ///
    /// The removed rows, oldest first.
    pub fn remove_key(&self, key: &str) -> DbResult<Vec<(u64, IVec)>> {
        let removed = (&self.rows, &self.keys).transaction(|(rows, keys)| {
            let ids = load_ids(keys, key.as_bytes())?;
            let mut removed = Vec::with_capacity(ids.len());

            for id in ids {
                if let Some(row) = rows.remove(id_key(id))? {
                    removed.push((id, row));
                }
            }
            keys.remove(key.as_bytes())?;

            Ok::<_, ConflictableTransactionError<StoreError>>(removed)
        })?;

        Ok(removed)
    }

    /// Remove every row in one transaction.
    ///
    /// # Returns
    ///
    /// The number of rows removed.
    pub fn clear(&self) -> DbResult<usize> {
        let row_keys = self.rows.iter().keys().collect::<sled::Result<Vec<IVec>>>()?;
        let index_keys = self.keys.iter().keys().collect::<sled::Result<Vec<IVec>>>()?;

        let removed = (&self.rows, &self.keys).transaction(|(rows, keys)| {
            let mut removed = 0;
            for key in &row_keys {
                if rows.remove(key.clone())?.is_some() {
                    removed += 1;
                }
            }
            // Rows appended to a known key after the scan are only reachable
            // through its index entry.
            for key in &index_keys {
                for id in load_ids(keys, key)? {
                    if rows.remove(id_key(id))?.is_some() {
                        removed += 1;
                    }
                }
                keys.remove(key.clone())?;
            }
            Ok::<_, ConflictableTransactionError<StoreError>>(removed)
        })?;

        Ok(removed)
    }

    /// Drop index entries pointing at rows that no longer exist.
    ///
    /// # Returns
    ///
    /// The number of dangling ids removed.
    pub fn prune(&self) -> DbResult<usize> {
        let mut pruned = 0;

        for key in self.keys.iter().keys() {
            let key = key?;

            pruned += (&self.rows, &self.keys).transaction(|(rows, keys)| {
                let ids: Vec<u64> = match keys.get(&key)? {
                    Some(bytes) => decode(&bytes).map_err(abort)?,
                    None => return Ok(0),
                };

                let mut live = Vec::with_capacity(ids.len());
                for id in &ids {
                    if rows.get(id_key(*id))?.is_some() {
                        live.push(*id);
                    }
                }

                if live.is_empty() {
                    keys.remove(key.clone())?;
                } else if live.len() != ids.len() {
                    keys.insert(key.clone(), encode(&live).map_err(abort)?)?;
                }

                Ok::<_, ConflictableTransactionError<StoreError>>(ids.len() - live.len())
            })?;
        }

        Ok(pruned)
    }

    /// Drop rows that no index entry points at.
    ///
    /// # Returns
    ///
    /// The number of rows removed.
    pub fn drop_orphans(&self) -> DbResult<usize> {
        let mut dropped = 0;

        for entry in self.rows.iter() {
            let (row_key, bytes) = entry?;
            let id = id_from_key(&row_key)?;
            let key = decode_row(&bytes)?.key;

            let orphan = (&self.rows, &self.keys).transaction(|(rows, keys)| {
                if load_ids(keys, key.as_bytes())?.contains(&id) {
                    return Ok(false);
                }
                let removed = rows.remove(row_key.clone())?.is_some();
                Ok::<_, ConflictableTransactionError<StoreError>>(removed)
            })?;

            if orphan {
                tracing::warn!(table = %self.name, key = %key, id, "dropped unindexed row");
                dropped += 1;
            }
        }

        Ok(dropped)
    }

    /// Number of stored rows across all keys.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Number of distinct keys with at least one row.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

fn abort(err: StoreError) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(err)
}

fn load_ids(keys: &TransactionalTree, key: &[u8]) -> ConflictableTransactionResult<Vec<u64>, StoreError> {
    match keys.get(key)? {
        Some(bytes) => decode(&bytes).map_err(abort),
        None => Ok(Vec::new()),
    }
}

/// Decode a raw row envelope.
pub(crate) fn decode_row(bytes: &[u8]) -> DbResult<StoredRow> {
    decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn table(store: &Store) -> Table {
        Table::open(store.engine(), "test_table").unwrap()
    }

    fn item(key: &str, payload: &[u8]) -> (String, Vec<u8>) {
        (key.to_owned(), payload.to_vec())
    }

    #[test]
    fn table_append_keeps_every_row() {
        let store = Store::temporary().unwrap();
        let table = table(&store);

        let first = table.write(&[item("a", b"1")], WriteMode::Append).unwrap();
        let second = table.write(&[item("a", b"2")], WriteMode::Append).unwrap();

        assert!(second[0] > first[0]);
        assert_eq!(table.ids_for("a").unwrap(), vec![first[0], second[0]]);
        assert_eq!(table.latest_id("a").unwrap(), Some(second[0]));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn table_overwrite_keeps_id() {
        let store = Store::temporary().unwrap();
        let table = table(&store);

        let first = table.write(&[item("a", b"1")], WriteMode::Overwrite).unwrap();
        let second = table.write(&[item("a", b"2")], WriteMode::Overwrite).unwrap();

        assert_eq!(first, second);
        assert_eq!(table.len(), 1);

        let row = decode_row(&table.row(first[0]).unwrap().unwrap()).unwrap();
        assert_eq!(row.key, "a");
        assert_eq!(row.payload, b"2");
    }

    #[test]
    fn table_overwrite_collapses_history() {
        let store = Store::temporary().unwrap();
        let table = table(&store);

        table
            .write(&[item("a", b"1"), item("a", b"2")], WriteMode::Append)
            .unwrap();
        let ids = table.write(&[item("a", b"3")], WriteMode::Overwrite).unwrap();

        assert_eq!(table.ids_for("a").unwrap(), ids);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn table_swap_row() {
        let store = Store::temporary().unwrap();
        let table = table(&store);

        let id = table.write(&[item("a", b"1")], WriteMode::Append).unwrap()[0];
        let current = table.row(id).unwrap().unwrap();

        assert!(table.swap_row(id, &current, b"new".to_vec()).unwrap());
        // Stale expectation is refused.
        assert!(!table.swap_row(id, &current, b"newer".to_vec()).unwrap());
        assert_eq!(&*table.row(id).unwrap().unwrap(), b"new");
    }

    #[test]
    fn table_scan_order() {
        let store = Store::temporary().unwrap();
        let table = table(&store);

        let ids = table
            .write(&[item("b", b"1"), item("a", b"2"), item("c", b"3")], WriteMode::Append)
            .unwrap();

        let forward: Vec<u64> = table.scan(false).map(|r| r.unwrap().0).collect();
        let mut backward: Vec<u64> = table.scan(true).map(|r| r.unwrap().0).collect();
        backward.reverse();

        assert_eq!(forward, ids);
        assert_eq!(backward, ids);
    }

    #[test]
    fn table_remove_key() {
        let store = Store::temporary().unwrap();
        let table = table(&store);

        table
            .write(&[item("a", b"1"), item("b", b"2"), item("a", b"3")], WriteMode::Append)
            .unwrap();

        let removed = table.remove_key("a").unwrap();
        assert_eq!(removed.len(), 2);
        assert!(table.ids_for("a").unwrap().is_empty());
        assert_eq!(table.len(), 1);
        assert_eq!(table.keys().map(|k| k.unwrap()).collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn table_clear_and_prune() {
        let store = Store::temporary().unwrap();
        let table = table(&store);

        let ids = table
            .write(&[item("a", b"1"), item("b", b"2")], WriteMode::Append)
            .unwrap();

        // Simulate a row lost outside the transactional path.
        table.rows.remove(id_key(ids[0])).unwrap();
        assert_eq!(table.prune().unwrap(), 1);
        assert!(table.ids_for("a").unwrap().is_empty());

        assert_eq!(table.clear().unwrap(), 1);
        assert_eq!(table.clear().unwrap(), 0);
        assert_eq!(table.len(), 0);
        assert_eq!(table.keys().count(), 0);
    }

    #[test]
    fn table_drop_orphans() {
        let store = Store::temporary().unwrap();
        let table = table(&store);

        table
            .write(&[item("a", b"1"), item("b", b"2")], WriteMode::Append)
            .unwrap();

        // Row for "a" is left without an index entry.
        table.keys.remove("a").unwrap();
        assert_eq!(table.drop_orphans().unwrap(), 1);
        assert_eq!(table.drop_orphans().unwrap(), 0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.ids_for("b").unwrap().len(), 1);
    }
}
