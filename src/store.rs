//! Credential persistence.
//!
//! The driver owns the credential bytes in its own config store; this
//! module owns the single validity flag, persisted under an NVS namespace
//! so it survives reboots.  The flag is true only while a non-empty SSID is
//! configured and no definite credential failure has been observed since it
//! was last set.
//!
//! Pure I/O: no state of its own beyond the backend handle.  The RAM mirror
//! of the flag lives with the manager's state, under the state mutex.

use log::{info, warn};

use crate::config::ManagerConfig;
use crate::error::Result;
use crate::ports::{Credentials, DriverPort, KvStore, StorageError};

const VALID_KEY: &str = "valid";

/// Persists the validity flag and brokers credential reads/writes between
/// the API and the driver's config store.
pub struct CredentialStore<S: KvStore> {
    kv: S,
    namespace: &'static str,
}

impl<S: KvStore> CredentialStore<S> {
    pub fn new(kv: S, namespace: &'static str) -> Self {
        Self { kv, namespace }
    }

    /// Read the persisted flag.  `None` when it has never been written.
    pub fn load_valid_flag(&self) -> core::result::Result<Option<bool>, StorageError> {
        Ok(self
            .kv
            .get_u8(self.namespace, VALID_KEY)?
            .map(|v| v != 0))
    }

    pub fn save_valid_flag(&self, valid: bool) -> core::result::Result<(), StorageError> {
        self.kv.set_u8(self.namespace, VALID_KEY, u8::from(valid))
    }

    /// Clamp and write credentials into the driver, then persist the flag.
    ///
    /// Returns the resulting flag value: true only for a non-empty SSID.
    pub fn save_credentials(
        &self,
        driver: &impl DriverPort,
        ssid: &str,
        password: &str,
    ) -> Result<bool> {
        let creds = Credentials::clamped(ssid, password);
        let valid = !creds.is_empty();
        driver.set_config(&creds)?;
        self.save_valid_flag(valid)?;
        info!("CredentialStore: credentials applied (SSID '{}')", creds.ssid);
        Ok(valid)
    }

    /// Read the exact credentials the driver currently holds.
    pub fn load_credentials(&self, driver: &impl DriverPort) -> Result<Credentials> {
        Ok(driver.get_config()?)
    }

    /// Wipe SSID and password in the driver and mark the flag false.
    pub fn clear_credentials(&self, driver: &impl DriverPort) -> Result<()> {
        driver.set_config(&Credentials::default())?;
        self.save_valid_flag(false)?;
        info!("CredentialStore: credentials cleared");
        Ok(())
    }

    /// Erase the driver's own persisted config and this namespace.
    /// Idempotent: always leaves the "no credentials" state.
    pub fn factory_reset(&self, driver: &impl DriverPort) -> Result<()> {
        driver.restore()?;
        self.kv.erase_all(self.namespace)?;
        info!("CredentialStore: factory reset complete");
        Ok(())
    }

    /// Apply the compile-time default credentials when the driver has none,
    /// and repair an unset flag when the driver already carries an SSID.
    ///
    /// `flag` is the value loaded from storage (`None` = never written).
    /// Returns the validity value the manager should mirror.
    pub fn ensure_config_fallback(
        &self,
        driver: &impl DriverPort,
        config: &ManagerConfig,
        flag: Option<bool>,
    ) -> Result<bool> {
        let current = driver.get_config()?;

        if current.is_empty() {
            if config.default_ssid.is_empty() {
                return Ok(flag.unwrap_or(false));
            }
            info!(
                "CredentialStore: no SSID in driver, using built-in default '{}'",
                config.default_ssid
            );
            let defaults = Credentials::clamped(config.default_ssid, config.default_password);
            driver.set_config(&defaults)?;
            self.save_valid_flag(true)?;
            return Ok(true);
        }

        if flag.is_none() {
            // Driver already carries an SSID but the flag was never
            // written; respect the driver.
            warn!(
                "CredentialStore: driver has SSID '{}' with no stored flag, assuming valid",
                current.ssid
            );
            self.save_valid_flag(true)?;
            return Ok(true);
        }

        Ok(flag.unwrap_or(false))
    }
}
