//! NVS (Non-Volatile Storage) adapter.
//!
//! Implements [`KvStore`] for the credential-validity flag.
//!
//! - **`target_os = "espidf"`**: raw `nvs_*` calls via `esp_idf_svc::sys`,
//!   with the open/commit/close discipline folded into every operation.
//!   First boot or a partition version mismatch is healed by erasing and
//!   re-initialising the flash partition.
//! - **all other targets**: an in-memory map behind a shared handle, so
//!   cloning the store models the same flash surviving a reboot.

use crate::ports::{KvStore, StorageError};
use log::info;

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;
#[cfg(not(target_os = "espidf"))]
use std::sync::{Arc, Mutex, PoisonError};

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;
#[cfg(target_os = "espidf")]
use log::warn;

/// Key/value store over the NVS flash partition (or an in-memory map on
/// the host).  Cloning shares the underlying storage.
#[derive(Clone)]
pub struct NvsStore {
    #[cfg(not(target_os = "espidf"))]
    mem: Arc<Mutex<HashMap<String, u8>>>,
}

impl NvsStore {
    /// Create the store and initialise NVS flash.
    ///
    /// On ESP-IDF, a partition reporting no free pages or a new version is
    /// erased and re-initialised; any other failure is surfaced as
    /// [`StorageError::IoError`].
    pub fn new() -> Result<Self, StorageError> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: nvs_flash_init / nvs_flash_erase run from the single
            // initialising context before any concurrent NVS access.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
                warn!("NvsStore: partition invalid, erasing");
                if unsafe { nvs_flash_erase() } != ESP_OK {
                    return Err(StorageError::IoError);
                }
                if unsafe { nvs_flash_init() } != ESP_OK {
                    return Err(StorageError::IoError);
                }
            } else if ret != ESP_OK {
                return Err(StorageError::IoError);
            }
            info!("NvsStore: flash initialised");
            Ok(Self {})
        }

        #[cfg(not(target_os = "espidf"))]
        {
            info!("NvsStore: simulation backend");
            Ok(Self {
                mem: Arc::new(Mutex::new(HashMap::new())),
            })
        }
    }

    #[cfg(not(target_os = "espidf"))]
    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{namespace}::{key}")
    }

    /// Open an NVS namespace, run a closure with the handle, then close.
    #[cfg(target_os = "espidf")]
    fn with_nvs_handle<F, T>(namespace: &str, write: bool, f: F) -> Result<T, i32>
    where
        F: FnOnce(nvs_handle_t) -> Result<T, i32>,
    {
        let mut ns_buf = [0u8; 16];
        let ns_bytes = namespace.as_bytes();
        let len = ns_bytes.len().min(15);
        ns_buf[..len].copy_from_slice(&ns_bytes[..len]);

        let mut handle: nvs_handle_t = 0;
        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };

        let ret = unsafe { nvs_open(ns_buf.as_ptr() as *const _, mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }

        let result = f(handle);
        unsafe {
            nvs_close(handle);
        }
        result
    }

    #[cfg(target_os = "espidf")]
    fn key_buf(key: &str) -> [u8; 16] {
        let mut buf = [0u8; 16];
        let kb = key.as_bytes();
        let kl = kb.len().min(15);
        buf[..kl].copy_from_slice(&kb[..kl]);
        buf
    }
}

impl KvStore for NvsStore {
    fn get_u8(&self, namespace: &str, key: &str) -> Result<Option<u8>, StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let map = self.mem.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(map.get(&Self::composite_key(namespace, key)).copied())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, false, |handle| {
                let key_buf = Self::key_buf(key);
                let mut value: u8 = 0;
                let ret = unsafe { nvs_get_u8(handle, key_buf.as_ptr() as *const _, &mut value) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(value)
            });
            match result {
                Ok(value) => Ok(Some(value)),
                // A missing namespace and a missing key both mean "never written".
                Err(e) if e == ESP_ERR_NVS_NOT_FOUND => Ok(None),
                Err(_) => Err(StorageError::IoError),
            }
        }
    }

    fn set_u8(&self, namespace: &str, key: &str, value: u8) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let mut map = self.mem.lock().unwrap_or_else(PoisonError::into_inner);
            map.insert(Self::composite_key(namespace, key), value);
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, true, |handle| {
                let key_buf = Self::key_buf(key);
                let ret = unsafe { nvs_set_u8(handle, key_buf.as_ptr() as *const _, value) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            result.map_err(|e| {
                if e == ESP_ERR_NVS_NOT_ENOUGH_SPACE {
                    StorageError::Full
                } else {
                    StorageError::IoError
                }
            })
        }
    }

    fn erase_all(&self, namespace: &str) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let prefix = format!("{namespace}::");
            let mut map = self.mem.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|k, _| !k.starts_with(&prefix));
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let result = Self::with_nvs_handle(namespace, true, |handle| {
                let ret = unsafe { nvs_erase_all(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                let ret = unsafe { nvs_commit(handle) };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(())
            });
            match result {
                Ok(()) => Ok(()),
                // Erasing a namespace that was never created is a no-op.
                Err(e) if e == ESP_ERR_NVS_NOT_FOUND => Ok(()),
                Err(_) => Err(StorageError::IoError),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u8_round_trip() {
        let nvs = NvsStore::new().unwrap();
        assert_eq!(nvs.get_u8("ns", "valid").unwrap(), None);
        nvs.set_u8("ns", "valid", 1).unwrap();
        assert_eq!(nvs.get_u8("ns", "valid").unwrap(), Some(1));
        nvs.set_u8("ns", "valid", 0).unwrap();
        assert_eq!(nvs.get_u8("ns", "valid").unwrap(), Some(0));
    }

    #[test]
    fn erase_all_clears_only_the_namespace() {
        let nvs = NvsStore::new().unwrap();
        nvs.set_u8("ns_a", "valid", 1).unwrap();
        nvs.set_u8("ns_b", "valid", 1).unwrap();
        nvs.erase_all("ns_a").unwrap();
        assert_eq!(nvs.get_u8("ns_a", "valid").unwrap(), None);
        assert_eq!(nvs.get_u8("ns_b", "valid").unwrap(), Some(1));
    }

    #[test]
    fn erase_of_missing_namespace_is_ok() {
        let nvs = NvsStore::new().unwrap();
        nvs.erase_all("never_written").unwrap();
    }

    #[test]
    fn clones_share_storage() {
        let a = NvsStore::new().unwrap();
        let b = a.clone();
        a.set_u8("ns", "valid", 1).unwrap();
        assert_eq!(b.get_u8("ns", "valid").unwrap(), Some(1));
    }
}
