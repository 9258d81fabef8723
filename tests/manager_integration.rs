//! Integration tests: public API → worker task → simulated driver.
//!
//! These drive the real worker thread against [`SimDriver`] and the
//! in-memory NVS backend, covering the end-to-end connection lifecycle:
//! happy path, idempotency, disconnect classification, backoff
//! cancellation, timeout rollback, and credential persistence across a
//! full deinit/init cycle.

#![cfg(not(target_os = "espidf"))]

use std::time::{Duration, Instant};

use wifi_manager::adapters::driver::{ConnectOutcome, SimCall, SimDriver};
use wifi_manager::adapters::nvs::NvsStore;
use wifi_manager::config::ManagerConfig;
use wifi_manager::events::{
    REASON_4WAY_HANDSHAKE_TIMEOUT, REASON_ASSOC_LEAVE, REASON_BEACON_TIMEOUT,
    REASON_CONNECTION_FAIL,
};
use wifi_manager::{Error, EventId, State, WifiManager};

const TIMEOUT: Duration = Duration::from_millis(2000);

fn test_config() -> ManagerConfig {
    ManagerConfig {
        nvs_namespace: "wifi_manager",
        default_ssid: "",
        default_password: "",
    }
}

fn manager(driver: SimDriver, kv: NvsStore) -> WifiManager<SimDriver, NvsStore> {
    WifiManager::new(driver, kv, test_config()).expect("manager init")
}

/// Poll until the manager reports `state`, failing after `deadline`.
fn wait_for_state(mgr: &WifiManager<SimDriver, NvsStore>, state: State, deadline: Duration) {
    let end = Instant::now() + deadline;
    loop {
        let current = mgr.state();
        if current == state {
            return;
        }
        assert!(
            Instant::now() < end,
            "timed out waiting for {state:?}, still {current:?}"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Bring a manager to STARTED with valid credentials.
fn started_with_credentials(driver: &SimDriver) -> WifiManager<SimDriver, NvsStore> {
    let mgr = manager(driver.clone(), NvsStore::new().unwrap());
    mgr.set_credentials("Net", "p").unwrap();
    mgr.start(TIMEOUT).unwrap();
    assert_eq!(mgr.state(), State::Started);
    mgr
}

// ── Lifecycle ─────────────────────────────────────────────────

#[test]
fn init_reaches_initialized() {
    let mgr = manager(SimDriver::new(), NvsStore::new().unwrap());
    assert_eq!(mgr.state(), State::Initialized);
    assert!(!mgr.is_credentials_valid());
}

#[test]
fn happy_path_start_connect() {
    let driver = SimDriver::new();
    let mgr = manager(driver.clone(), NvsStore::new().unwrap());

    mgr.start(Duration::from_millis(5000)).unwrap();
    assert_eq!(mgr.state(), State::Started);

    mgr.set_credentials("Net", "p").unwrap();
    assert!(mgr.is_credentials_valid());

    mgr.connect(Duration::from_millis(15000)).unwrap();
    assert_eq!(mgr.state(), State::ConnectedGotIp);
    assert_eq!(driver.call_count(SimCall::Connect), 1);
}

#[test]
fn stop_returns_to_initialized() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);
    mgr.connect(TIMEOUT).unwrap();

    mgr.stop(TIMEOUT).unwrap();
    assert_eq!(mgr.state(), State::Initialized);
    assert_eq!(mgr.state(), State::STOPPED);
}

#[test]
fn disconnect_returns_to_started() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);
    mgr.connect(TIMEOUT).unwrap();

    mgr.disconnect(TIMEOUT).unwrap();
    assert_eq!(mgr.state(), State::DISCONNECTED);
}

#[test]
fn deinit_is_idempotent_and_final() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);

    mgr.deinit().unwrap();
    assert_eq!(mgr.state(), State::Uninitialized);
    assert_eq!(driver.call_count(SimCall::Deinit), 1);

    // Second deinit is a no-op.
    mgr.deinit().unwrap();
    assert_eq!(driver.call_count(SimCall::Deinit), 1);

    // Every command is now invalid.
    assert_eq!(mgr.start(TIMEOUT), Err(Error::InvalidState));
    assert_eq!(mgr.connect_async(), Err(Error::InvalidState));
}

// ── Idempotency and validation ────────────────────────────────

#[test]
fn repeated_commands_fast_return_without_driver_calls() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);

    let starts = driver.call_count(SimCall::Start);
    mgr.start(TIMEOUT).unwrap();
    mgr.start(TIMEOUT).unwrap();
    assert_eq!(driver.call_count(SimCall::Start), starts);

    // Already disconnected: skip without touching the driver.
    let disconnects = driver.call_count(SimCall::Disconnect);
    mgr.disconnect(TIMEOUT).unwrap();
    assert_eq!(driver.call_count(SimCall::Disconnect), disconnects);

    mgr.connect(TIMEOUT).unwrap();
    let connects = driver.call_count(SimCall::Connect);
    mgr.connect(TIMEOUT).unwrap();
    assert_eq!(driver.call_count(SimCall::Connect), connects);

    mgr.stop(TIMEOUT).unwrap();
    let stops = driver.call_count(SimCall::Stop);
    mgr.stop(TIMEOUT).unwrap();
    assert_eq!(driver.call_count(SimCall::Stop), stops);
}

#[test]
fn connect_before_start_is_invalid_state() {
    let driver = SimDriver::new();
    let mgr = manager(driver.clone(), NvsStore::new().unwrap());

    assert_eq!(mgr.connect(TIMEOUT), Err(Error::InvalidState));
    assert_eq!(mgr.disconnect(TIMEOUT), Err(Error::InvalidState));
    assert_eq!(driver.call_count(SimCall::Connect), 0);
    assert_eq!(driver.call_count(SimCall::Disconnect), 0);
}

// ── Disconnect classification ─────────────────────────────────

#[test]
fn suspect_failures_at_medium_signal_invalidate_after_two() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);
    mgr.connect(TIMEOUT).unwrap();
    assert_eq!(mgr.state(), State::ConnectedGotIp);

    // First suspect failure: backoff, credentials still valid.
    driver.emit_sta_disconnected(REASON_CONNECTION_FAIL, -60);
    wait_for_state(&mgr, State::WaitingReconnect, TIMEOUT);
    assert!(mgr.is_credentials_valid());

    // Second at -60 dBm (MEDIUM, limit 2): invalidated.
    driver.emit_sta_disconnected(REASON_CONNECTION_FAIL, -60);
    wait_for_state(&mgr, State::ErrorCredentials, TIMEOUT);
    assert!(!mgr.is_credentials_valid());
}

#[test]
fn handshake_timeout_at_good_signal_is_one_strike() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);
    mgr.connect(TIMEOUT).unwrap();

    driver.emit_sta_disconnected(REASON_4WAY_HANDSHAKE_TIMEOUT, -50);
    wait_for_state(&mgr, State::ErrorCredentials, TIMEOUT);
    assert!(!mgr.is_credentials_valid());
}

#[test]
fn suspect_failures_at_critical_signal_never_invalidate() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);
    mgr.connect(TIMEOUT).unwrap();

    // Each failure restarts the backoff, so no reconnect fires while the
    // burst is delivered.
    for _ in 0..10 {
        driver.emit_sta_disconnected(REASON_CONNECTION_FAIL, -85);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(mgr.state(), State::WaitingReconnect);
    }
    assert!(mgr.is_credentials_valid());
}

#[test]
fn beacon_timeout_enters_backoff_and_disconnect_cancels() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);
    mgr.connect(TIMEOUT).unwrap();

    driver.emit_sta_disconnected(REASON_BEACON_TIMEOUT, -60);
    wait_for_state(&mgr, State::WaitingReconnect, TIMEOUT);
    assert_eq!(mgr.retry_count(), 1);
    assert!(mgr.is_credentials_valid());

    // Cancellation during backoff goes straight to DISCONNECTED and keeps
    // the credentials valid.
    mgr.disconnect(Duration::from_millis(100)).unwrap();
    assert_eq!(mgr.state(), State::DISCONNECTED);
    assert!(mgr.is_credentials_valid());

    // The cancelled reconnect must never fire.
    let connects = driver.call_count(SimCall::Connect);
    std::thread::sleep(Duration::from_millis(1200));
    assert_eq!(driver.call_count(SimCall::Connect), connects);
    assert_eq!(mgr.state(), State::DISCONNECTED);
}

#[test]
fn backoff_retry_reconnects_automatically() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);
    mgr.connect(TIMEOUT).unwrap();

    // One recoverable drop, then the scripted retry succeeds after ~1 s.
    driver.emit_sta_disconnected(REASON_BEACON_TIMEOUT, -60);
    wait_for_state(&mgr, State::WaitingReconnect, TIMEOUT);
    wait_for_state(&mgr, State::ConnectedGotIp, Duration::from_millis(3000));
    assert_eq!(mgr.retry_count(), 0);
}

#[test]
fn peer_leave_goes_to_disconnected_without_retry() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);
    mgr.connect(TIMEOUT).unwrap();

    driver.emit_sta_disconnected(REASON_ASSOC_LEAVE, -55);
    wait_for_state(&mgr, State::DISCONNECTED, TIMEOUT);
    assert_eq!(mgr.retry_count(), 0);
    assert!(mgr.is_credentials_valid());
}

#[test]
fn recoverable_drop_without_valid_credentials_does_not_retry() {
    let driver = SimDriver::new();
    let mgr = manager(driver.clone(), NvsStore::new().unwrap());
    mgr.set_credentials("Net", "p").unwrap();
    mgr.start(TIMEOUT).unwrap();
    mgr.connect(TIMEOUT).unwrap();

    mgr.clear_credentials().unwrap();
    assert!(!mgr.is_credentials_valid());

    driver.emit_sta_disconnected(REASON_BEACON_TIMEOUT, -60);
    wait_for_state(&mgr, State::DISCONNECTED, TIMEOUT);

    let connects = driver.call_count(SimCall::Connect);
    std::thread::sleep(Duration::from_millis(1200));
    assert_eq!(driver.call_count(SimCall::Connect), connects);
}

#[test]
fn reconnect_from_error_credentials_is_allowed() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);
    mgr.connect(TIMEOUT).unwrap();

    driver.emit_sta_disconnected(REASON_4WAY_HANDSHAKE_TIMEOUT, -50);
    wait_for_state(&mgr, State::ErrorCredentials, TIMEOUT);

    // The user fixed the password; connect is legal again.
    mgr.set_credentials("Net", "corrected").unwrap();
    assert!(mgr.is_credentials_valid());
    mgr.connect(TIMEOUT).unwrap();
    assert_eq!(mgr.state(), State::ConnectedGotIp);
}

// ── Event strictness ──────────────────────────────────────────

#[test]
fn quiescent_states_ignore_stray_events() {
    let driver = SimDriver::new();
    let mgr = manager(driver.clone(), NvsStore::new().unwrap());

    // GOT_IP while only initialized.
    driver.emit_got_ip();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(mgr.state(), State::Initialized);

    // STA_CONNECTED while merely started.
    mgr.set_credentials("Net", "p").unwrap();
    mgr.start(TIMEOUT).unwrap();
    driver.emit_sta_connected();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(mgr.state(), State::Started);
}

// ── Timeout rollback ──────────────────────────────────────────

#[test]
fn connect_timeout_rolls_back_to_disconnected() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);

    // The attempt hangs: no driver event ever arrives.
    driver.queue_connect_outcome(ConnectOutcome::Silent);
    assert_eq!(mgr.connect(Duration::from_millis(1)), Err(Error::Timeout));

    // The rollback disconnect resolves the transient state.
    wait_for_state(&mgr, State::DISCONNECTED, Duration::from_millis(500));
}

#[test]
fn start_timeout_rolls_back_to_stopped() {
    // Manual driver: the start never completes on its own.
    let driver = SimDriver::manual();
    let mgr = manager(driver.clone(), NvsStore::new().unwrap());

    assert_eq!(mgr.start(Duration::from_millis(1)), Err(Error::Timeout));

    // The rollback stop is queued behind the start; once the driver
    // acknowledges it the state resolves to STOPPED, not a transient.
    std::thread::sleep(Duration::from_millis(50));
    driver.emit(EventId::StaStop, 0, 0);
    wait_for_state(&mgr, State::STOPPED, Duration::from_millis(500));
}

#[test]
fn refused_connect_returns_fail() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);

    driver.queue_connect_outcome(ConnectOutcome::Refused {
        reason: REASON_CONNECTION_FAIL,
        rssi: -60,
    });
    assert_eq!(mgr.connect(TIMEOUT), Err(Error::Fail));
    // Never left in CONNECTING once the call returns.
    assert_eq!(mgr.state(), State::WaitingReconnect);
}

#[test]
fn start_failure_event_returns_fail() {
    let driver = SimDriver::manual();
    let mgr = manager(driver.clone(), NvsStore::new().unwrap());

    std::thread::scope(|s| {
        let caller = s.spawn(|| mgr.start(TIMEOUT));
        std::thread::sleep(Duration::from_millis(50));
        // The driver reports that it failed to come up.
        driver.emit(EventId::StaDisconnected, 0, 0);
        assert_eq!(caller.join().unwrap(), Err(Error::Fail));
    });
    assert_eq!(mgr.state(), State::Initialized);
}

#[test]
fn lost_ip_degrades_connection() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);
    mgr.connect(TIMEOUT).unwrap();

    driver.emit_lost_ip();
    wait_for_state(&mgr, State::ConnectedNoIp, TIMEOUT);

    driver.emit_got_ip();
    wait_for_state(&mgr, State::ConnectedGotIp, TIMEOUT);
}

// ── Credentials ───────────────────────────────────────────────

#[test]
fn credentials_persist_across_manager_lifecycles() {
    let driver = SimDriver::new();
    let kv = NvsStore::new().unwrap();

    {
        let mgr = manager(driver.clone(), kv.clone());
        mgr.set_credentials("PersistNet", "persistpw").unwrap();
        assert!(mgr.is_credentials_valid());
        mgr.deinit().unwrap();
    }

    // Same flash, same driver config: the flag and credentials survive.
    let mgr = manager(driver.clone(), kv);
    assert!(mgr.is_credentials_valid());
    let creds = mgr.credentials().unwrap();
    assert_eq!(creds.ssid.as_str(), "PersistNet");
    assert_eq!(creds.password.as_str(), "persistpw");
}

#[test]
fn clear_credentials_clears_flag() {
    let driver = SimDriver::new();
    let kv = NvsStore::new().unwrap();
    let mgr = manager(driver.clone(), kv.clone());

    mgr.set_credentials("Net", "p").unwrap();
    mgr.clear_credentials().unwrap();
    assert!(!mgr.is_credentials_valid());
    assert!(mgr.credentials().unwrap().is_empty());

    // Still false after a reboot.
    mgr.deinit().unwrap();
    drop(mgr);
    let mgr = manager(driver, kv);
    assert!(!mgr.is_credentials_valid());
}

#[test]
fn compile_time_default_applies_on_first_boot() {
    let driver = SimDriver::new();
    let config = ManagerConfig {
        nvs_namespace: "wifi_manager",
        default_ssid: "FactoryNet",
        default_password: "factorypw",
    };
    let mgr = WifiManager::new(driver, NvsStore::new().unwrap(), config).unwrap();
    assert!(mgr.is_credentials_valid());
    assert_eq!(mgr.credentials().unwrap().ssid.as_str(), "FactoryNet");
}

#[test]
fn set_credentials_while_connected_disconnects_but_does_not_reconnect() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);
    mgr.connect(TIMEOUT).unwrap();

    let connects = driver.call_count(SimCall::Connect);
    mgr.set_credentials("OtherNet", "otherpw").unwrap();

    // The disconnect reached the driver.
    assert!(driver.call_count(SimCall::Disconnect) >= 1);
    // No automatic reconnection: that is the caller's decision.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(driver.call_count(SimCall::Connect), connects);
}

#[test]
fn factory_reset_wipes_everything_and_forces_initialized() {
    let driver = SimDriver::new();
    let mgr = started_with_credentials(&driver);
    mgr.connect(TIMEOUT).unwrap();

    mgr.factory_reset().unwrap();
    assert_eq!(mgr.state(), State::Initialized);
    assert!(!mgr.is_credentials_valid());
    assert!(mgr.credentials().unwrap().is_empty());
    assert_eq!(driver.call_count(SimCall::Restore), 1);
}

// ── Async variants ────────────────────────────────────────────

#[test]
fn async_commands_complete_through_the_worker() {
    let driver = SimDriver::new();
    let mgr = manager(driver.clone(), NvsStore::new().unwrap());
    mgr.set_credentials("Net", "p").unwrap();

    mgr.start_async().unwrap();
    wait_for_state(&mgr, State::Started, TIMEOUT);

    mgr.connect_async().unwrap();
    wait_for_state(&mgr, State::ConnectedGotIp, TIMEOUT);

    mgr.disconnect_async().unwrap();
    wait_for_state(&mgr, State::DISCONNECTED, TIMEOUT);

    mgr.stop_async().unwrap();
    wait_for_state(&mgr, State::STOPPED, TIMEOUT);
}
