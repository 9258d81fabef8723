//! Port traits — the hexagonal boundary between the manager core and the
//! platform.
//!
//! ```text
//!   EspWifiDriver / SimDriver ──▶ DriverPort ──▶ WifiManager (core)
//!   NvsStore (flash / memory)  ──▶ KvStore    ──▶ CredentialStore
//! ```
//!
//! Driven adapters implement these traits; the manager core consumes them
//! via generics, so the connection-lifecycle logic never touches hardware
//! directly and the entire pipeline runs against mocks on the host.

use core::fmt;

use crate::events::EventSender;

/// Maximum SSID length in bytes (802.11 limit).
pub const SSID_MAX_LEN: usize = 32;

/// Maximum passphrase length in bytes (WPA2 limit).
pub const PASSWORD_MAX_LEN: usize = 64;

// ───────────────────────────────────────────────────────────────
// Station credentials
// ───────────────────────────────────────────────────────────────

/// Station credentials as held by the driver's own config store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: heapless::String<SSID_MAX_LEN>,
    pub password: heapless::String<PASSWORD_MAX_LEN>,
}

impl Credentials {
    /// Build from borrowed strings, clamping to the 32/64-byte limits.
    ///
    /// Clamping backs off to a character boundary so the stored value is
    /// always valid UTF-8.
    pub fn clamped(ssid: &str, password: &str) -> Self {
        let mut out = Self::default();
        let _ = out.ssid.push_str(clamp(ssid, SSID_MAX_LEN));
        let _ = out.password.push_str(clamp(password, PASSWORD_MAX_LEN));
        out
    }

    /// True when no SSID is configured.
    pub fn is_empty(&self) -> bool {
        self.ssid.is_empty()
    }
}

fn clamp(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ───────────────────────────────────────────────────────────────
// Driver port (driven adapter: core → radio stack)
// ───────────────────────────────────────────────────────────────

/// Thin synchronous shim over the native radio driver.  No policy: every
/// method maps 1:1 onto a driver control call.
///
/// Implementations register the event callbacks handed over in [`init`]
/// and deliver radio events through them; the callbacks must be safe to
/// invoke from the driver's own event-delivery context.
///
/// [`init`]: DriverPort::init
pub trait DriverPort: Send + Sync {
    /// Bring up the network stack and register the event callbacks.
    fn init(&self, events: EventSender) -> Result<(), DriverError>;

    /// Put the driver in station mode.
    fn set_mode_sta(&self) -> Result<(), DriverError>;

    /// Power the radio up.  Completion is signalled by an event.
    fn start(&self) -> Result<(), DriverError>;

    /// Power the radio down.  Completion is signalled by an event.
    fn stop(&self) -> Result<(), DriverError>;

    /// Begin association with the configured AP.
    fn connect(&self) -> Result<(), DriverError>;

    /// Drop the current association.
    fn disconnect(&self) -> Result<(), DriverError>;

    /// Write the station config (credentials) into the driver.
    fn set_config(&self, config: &Credentials) -> Result<(), DriverError>;

    /// Read the station config back out of the driver.
    fn get_config(&self) -> Result<Credentials, DriverError>;

    /// Erase the driver's own persisted configuration.
    fn restore(&self) -> Result<(), DriverError>;

    /// Tear the stack down and unregister the event callbacks.
    fn deinit(&self) -> Result<(), DriverError>;
}

// ───────────────────────────────────────────────────────────────
// Key/value storage port (driven adapter: core → NVS / flash)
// ───────────────────────────────────────────────────────────────

/// Minimal namespaced key/value persistence.
///
/// Writes MUST be atomic — no partial values on power loss.  The ESP-IDF
/// NVS API guarantees this natively; the in-memory simulation trivially.
pub trait KvStore: Send + Sync {
    /// Read a `u8` value.  `Ok(None)` when the key has never been written.
    fn get_u8(&self, namespace: &str, key: &str) -> Result<Option<u8>, StorageError>;

    /// Write a `u8` value atomically.
    fn set_u8(&self, namespace: &str, key: &str, value: u8) -> Result<(), StorageError>;

    /// Erase every key in the namespace.  Idempotent.
    fn erase_all(&self, namespace: &str) -> Result<(), StorageError>;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`DriverPort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// The driver stack has not been initialized.
    NotInitialized,
    /// Another driver instance already owns the event registration slots.
    AlreadyRegistered,
    /// The supplied station config was rejected.
    InvalidConfig,
    /// Raw error code from the native driver.
    Platform(i32),
}

/// Errors from [`KvStore`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Storage partition is full.
    Full,
    /// Generic I/O error from the storage backend.
    IoError,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "driver not initialized"),
            Self::AlreadyRegistered => write!(f, "driver event slots already registered"),
            Self::InvalidConfig => write!(f, "station config rejected"),
            Self::Platform(code) => write!(f, "platform error {code}"),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_long_ssid_to_32_bytes() {
        let long = "x".repeat(40);
        let c = Credentials::clamped(&long, "pw");
        assert_eq!(c.ssid.len(), 32);
        assert_eq!(c.password.as_str(), "pw");
    }

    #[test]
    fn clamps_long_password_to_64_bytes() {
        let long = "p".repeat(70);
        let c = Credentials::clamped("Net", &long);
        assert_eq!(c.password.len(), 64);
    }

    #[test]
    fn clamp_respects_char_boundaries() {
        // 'é' is two bytes; 17 of them straddle the 32-byte limit.
        let s = "é".repeat(17);
        let c = Credentials::clamped(&s, "");
        assert!(c.ssid.len() <= 32);
        assert_eq!(c.ssid.as_str(), "é".repeat(16).as_str());
    }

    #[test]
    fn short_values_pass_through() {
        let c = Credentials::clamped("HomeNet", "secret123");
        assert_eq!(c.ssid.as_str(), "HomeNet");
        assert_eq!(c.password.as_str(), "secret123");
        assert!(!c.is_empty());
    }

    #[test]
    fn empty_ssid_is_empty() {
        assert!(Credentials::clamped("", "pw").is_empty());
    }
}
