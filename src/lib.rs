use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sled::Db;

pub mod config;
pub use config::{RetentionPolicy, StoreConfig, TableOptions};

pub mod lock;
pub use lock::{KeyGuard, KeyLock};

pub mod query;
pub use query::{Example, Predicate};

pub mod record;
pub use record::Record;

pub mod record_store;
pub use record_store::{Order, RecordStore, RecordType, Records, ShrinkReport};

pub mod result;
pub use result::{BoxError, DbResult, StoreError};

pub mod serializer;
pub use serializer::{BincodeSerializer, JsonSerializer, Serializer};

mod encoding;
mod registry;
mod table;

/// A tiny key-value record store based on sled.
///
/// Cloning is cheap and every clone refers to the same engine. Opening the
/// same path twice in a process also returns a handle to the same engine.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    engine: Db,
    /// One lock arena per table name, shared by every `RecordStore` on that table.
    locks: Mutex<HashMap<String, Arc<KeyLock>>>,
}

impl Shared {
    fn open(config: &StoreConfig) -> DbResult<Self> {
        let engine = config.to_sled().open()?;
        tracing::debug!(
            path = ?config.path,
            temporary = config.temporary,
            recovered = engine.was_recovered(),
            "opened store"
        );

        Ok(Self {
            engine,
            locks: Mutex::new(HashMap::new()),
        })
    }
}

impl Store {
    /// Open a store.
    ///
    /// # Arguments
    ///
    /// * `config` - Where and how to open the engine. If a store for the same
    ///   path is already open in this process, its handle is returned and the
    ///   remaining settings are ignored.
    pub fn open(config: &StoreConfig) -> DbResult<Self> {
        Ok(Self {
            shared: registry::open(config)?,
        })
    }

    /// Open a throwaway in-memory store.
    pub fn temporary() -> DbResult<Self> {
        Self::open(&StoreConfig::temporary())
    }

    /// Open a table storing values of type `T` with the default serializer.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the table.
    /// * `options` - Retention policy of the table.
    pub fn open_table<T: RecordType>(
        &self,
        name: &str,
        options: TableOptions,
    ) -> DbResult<RecordStore<T>> {
        self.open_table_with(name, options, BincodeSerializer::default())
    }

    /// Open a table storing values of type `T` with a custom serializer.
    pub fn open_table_with<T, S>(
        &self,
        name: &str,
        options: TableOptions,
        serializer: S,
    ) -> DbResult<RecordStore<T, S>>
    where
        T: RecordType,
        S: Serializer<T>,
    {
        let table = table::Table::open(&self.shared.engine, name)?;
        tracing::debug!(table = name, policy = ?options.policy, "opened table");

        Ok(RecordStore::new(
            self.clone(),
            table,
            self.key_lock(name),
            serializer,
            options,
        ))
    }

    /// Bytes the engine currently occupies on disk.
    pub fn size_on_disk(&self) -> DbResult<u64> {
        Ok(self.shared.engine.size_on_disk()?)
    }

    /// Write every pending change to disk.
    pub fn flush(&self) -> DbResult<usize> {
        Ok(self.shared.engine.flush()?)
    }

    /// Flush and release this handle. The engine itself closes once every
    /// handle and table opened from it is gone.
    pub fn close(self) -> DbResult<()> {
        self.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn engine(&self) -> &Db {
        &self.shared.engine
    }

    fn key_lock(&self, table: &str) -> Arc<KeyLock> {
        self.shared
            .locks
            .lock()
            .entry(table.to_owned())
            .or_insert_with(|| Arc::new(KeyLock::new()))
            .clone()
    }
}
