//! Bounded table of store handles, lifted out of a process-wide static array (per
//! `SPEC_FULL.md` §9's redesign flag) into an explicit owner that holds the table, the
//! monotonic service-id counter, and the `FILE_MAX_STORES` cap as a constructor parameter
//! instead of a compile-time constant.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::FileStore;

/// Default cap on live store handles, mirroring the original `FILE_MAX_STORES`. Unlike
/// `store::format::FILE_DATA_COUNT`, this one really is just a configuration default.
pub const DEFAULT_MAX_STORES: usize = 60;

pub(crate) const DEFAULT_CACHE_SIZE: usize = 16_384;

/// Store creation parameters, `serde`-deserializable so a node can load them from a
/// config file at startup, the way the teacher's `DatastoreFSyncLevel`-carrying config
/// structs are loaded.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreAttrs {
    pub root_path: Option<PathBuf>,
    pub cache_size: usize,
    pub flush_on_write: bool,
}

impl Default for StoreAttrs {
    fn default() -> Self {
        StoreAttrs {
            root_path: None,
            cache_size: DEFAULT_CACHE_SIZE,
            flush_on_write: true,
        }
    }
}

impl StoreAttrs {
    /// Parses a `StoreAttrs` out of a JSON config blob, the way a node loads its other
    /// startup configuration (e.g. the teacher's `tape/encryption_keys.rs::load_keys`).
    /// Missing fields fall back to `Default`, since every field carries `#[serde(default)]`.
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| Error::failed_os(format!("invalid store config: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::failed_os(format!("cannot serialize store config: {e}")))
    }
}

/// An integer naming a store instance within a [`StoreManager`]'s bounded table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreHandle(u32);

impl StoreHandle {
    pub(crate) fn from_index(i: u32) -> Self {
        StoreHandle(i)
    }

    pub(crate) fn index(self) -> u32 {
        self.0
    }
}

pub struct StoreManager {
    stores: Vec<Option<FileStore>>,
    next_service_id: u32,
}

impl StoreManager {
    pub fn new(max_stores: usize) -> Self {
        let mut stores = Vec::with_capacity(max_stores);
        stores.resize_with(max_stores, || None);
        StoreManager {
            stores,
            next_service_id: 0,
        }
    }

    /// Allocates the first unused slot in the table and creates a store there. Fails with
    /// [`Error::InvalidHandle`] if the table is full or the store's root directory cannot
    /// be created.
    pub fn create(&mut self, attrs: StoreAttrs) -> Result<StoreHandle> {
        let slot = self.stores.iter().position(Option::is_none).ok_or_else(|| {
            log::error!(
                "store table full: all {} handles in use",
                self.stores.len()
            );
            Error::InvalidHandle
        })?;

        let handle = StoreHandle::from_index(slot as u32);
        let service_id = self.next_service_id;
        let store = FileStore::create(handle, service_id, &attrs)?;
        self.next_service_id += 1;
        self.stores[slot] = Some(store);
        log::debug!("store handle {slot} created (service id {service_id})");
        Ok(handle)
    }

    /// Drops the store at `handle`, closing its file descriptors and freeing its cache.
    pub fn destroy(&mut self, handle: StoreHandle) -> Result<()> {
        let slot = self
            .stores
            .get_mut(handle.index() as usize)
            .ok_or(Error::InvalidHandle)?;
        if slot.take().is_none() {
            return Err(Error::InvalidHandle);
        }
        log::debug!("store handle {} destroyed", handle.index());
        Ok(())
    }

    pub fn get(&self, handle: StoreHandle) -> Result<&FileStore> {
        self.stores
            .get(handle.index() as usize)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidHandle)
    }
}

impl Default for StoreManager {
    fn default() -> Self {
        StoreManager::new(DEFAULT_MAX_STORES)
    }
}
