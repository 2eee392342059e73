use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How the engine behind a [`crate::Store`] is opened.
///
/// Deserializable so it can be embedded in an application's own config file:
///
/// ```toml
/// path = "./data/records"
/// cache_capacity = 67108864
/// flush_every_ms = 500
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory of the database. `None` opens an in-memory database.
    pub path: Option<PathBuf>,
    /// If `true`, the database is deleted when the last handle is dropped.
    pub temporary: bool,
    /// Page cache size in bytes. Engine default when unset.
    pub cache_capacity: Option<u64>,
    /// Background flush interval. Engine default when unset.
    pub flush_every_ms: Option<u64>,
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Self::default()
        }
    }

    /// Whether handles for this config may be shared through the process registry.
    pub(crate) fn is_shared(&self) -> bool {
        self.path.is_some() && !self.temporary
    }

    pub(crate) fn to_sled(&self) -> sled::Config {
        let mut config = sled::Config::new().temporary(self.temporary || self.path.is_none());

        if let Some(path) = &self.path {
            config = config.path(path);
        }
        if let Some(capacity) = self.cache_capacity {
            config = config.cache_capacity(capacity);
        }
        if self.flush_every_ms.is_some() {
            config = config.flush_every_ms(self.flush_every_ms);
        }

        config
    }
}

/// What `set` keeps for a key. Fixed when a table is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Every `set` appends a row. Reads see the latest row per key.
    #[default]
    Default,
    /// Every `set` appends a row. Reads see every row ever written.
    KeepHistory,
    /// `set` overwrites in place. At most one row per key.
    UniqueKeys,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableOptions {
    pub policy: RetentionPolicy,
}

impl TableOptions {
    pub fn keep_history() -> Self {
        Self {
            policy: RetentionPolicy::KeepHistory,
        }
    }

    pub fn unique_keys() -> Self {
        Self {
            policy: RetentionPolicy::UniqueKeys,
        }
    }
}
