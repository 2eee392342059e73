//! Process-wide registry of open stores.
//!
//! The engine holds an exclusive lock on its directory, so a second open of
//! the same path inside one process has to reuse the first handle. Entries are
//! weak so a store is closed once its last handle is dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::result::DbResult;
use crate::Shared;

static OPEN_STORES: Lazy<Mutex<HashMap<PathBuf, Weak<Shared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Open the engine described by `config`, reusing a live handle for the same path.
pub(crate) fn open(config: &StoreConfig) -> DbResult<Arc<Shared>> {
    let path = match (&config.path, config.is_shared()) {
        (Some(path), true) => normalize(path)?,
        _ => return Ok(Arc::new(Shared::open(config)?)),
    };

    let mut stores = OPEN_STORES.lock();
    stores.retain(|_, store| store.strong_count() > 0);

    if let Some(shared) = stores.get(&path).and_then(Weak::upgrade) {
        tracing::debug!(path = %path.display(), "reusing open store");
        return Ok(shared);
    }

    let shared = Arc::new(Shared::open(config)?);
    stores.insert(path, Arc::downgrade(&shared));

    Ok(shared)
}

/// Resolve `path` to the canonical form of the directory the engine will use.
///
/// The directory is created first so spellings such as `db` and `./db` agree
/// before the first open.
fn normalize(path: &Path) -> DbResult<PathBuf> {
    std::fs::create_dir_all(path).map_err(sled::Error::from)?;
    Ok(std::fs::canonicalize(path).map_err(sled::Error::from)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_shares_engine() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::at(dir.path().join("db"));

        let first = open(&config).unwrap();
        let second = open(&config).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let weak = Arc::downgrade(&first);
        drop(first);
        drop(second);

        // Nothing else keeps the engine alive.
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn equivalent_paths_share_engine() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let plain = open(&StoreConfig::at(dir.path().join("db"))).unwrap();
        let dotted = open(&StoreConfig::at(dir.path().join(".").join("db"))).unwrap();
        let parent = open(&StoreConfig::at(dir.path().join("sub").join("..").join("db"))).unwrap();

        assert!(Arc::ptr_eq(&plain, &dotted));
        assert!(Arc::ptr_eq(&plain, &parent));
    }

    #[test]
    fn temporary_stores_are_private() {
        let first = open(&StoreConfig::temporary()).unwrap();
        let second = open(&StoreConfig::temporary()).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
