//! Build-time configuration and manager tunables.
//!
//! Default credentials are injected at build time via the `WIFI_SSID` /
//! `WIFI_PASSWORD` environment variables; when both are absent the
//! compile-time fallback is skipped entirely.

/// Compile-time fallback SSID (empty when not provided at build time).
pub const DEFAULT_SSID: &str = match option_env!("WIFI_SSID") {
    Some(v) => v,
    None => "",
};

/// Compile-time fallback password (empty when not provided at build time).
pub const DEFAULT_PASSWORD: &str = match option_env!("WIFI_PASSWORD") {
    Some(v) => v,
    None => "",
};

/// NVS namespace holding the credential-validity flag.
pub const NVS_NAMESPACE: &str = "wifi_manager";

/// Capacity of the command/event queue drained by the worker task.
pub const COMMAND_QUEUE_DEPTH: usize = 10;

/// How long `deinit` waits for a clean radio stop before tearing down.
pub const DEINIT_STOP_TIMEOUT_MS: u64 = 2000;

/// Bounded wait for enqueuing the worker-exit command during `deinit`.
pub const EXIT_POST_TIMEOUT_MS: u64 = 100;

/// Grace period for the worker task to terminate before it is detached.
pub const TASK_EXIT_GRACE_MS: u64 = 1000;

/// Per-instance manager configuration.
///
/// The defaults mirror the compile-time constants above; tests override the
/// fallback credentials to exercise both fallback paths.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Namespace under which the validity flag is persisted.
    pub nvs_namespace: &'static str,
    /// Fallback SSID applied when the driver has no stored config.
    pub default_ssid: &'static str,
    /// Fallback password paired with `default_ssid`.
    pub default_password: &'static str,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            nvs_namespace: NVS_NAMESPACE,
            default_ssid: DEFAULT_SSID,
            default_password: DEFAULT_PASSWORD,
        }
    }
}
