//! Radio driver adapter.
//!
//! Implements [`DriverPort`] — the thin, policy-free shim over the native
//! WiFi stack.
//!
//! ## cfg gating
//!
//! - **`target_os = "espidf"`**: real ESP-IDF calls via `esp_idf_svc::sys`
//!   (netif, default event loop, wifi driver, event-handler registration).
//! - **all other targets**: [`SimDriver`], a scriptable simulation that
//!   records every control call and can replay driver events, used by the
//!   host test suite.
//!
//! The driver registration slots (event handlers, default STA netif) are
//! process-global on ESP-IDF, so [`EspWifiDriver`] enforces a process-wide
//! singleton; constructing a second one fails instead of silently
//! double-registering.

#[cfg(target_os = "espidf")]
pub use espidf::EspWifiDriver;

#[cfg(not(target_os = "espidf"))]
pub use sim::{ConnectOutcome, SimCall, SimDriver};

// ───────────────────────────────────────────────────────────────
// ESP-IDF backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
mod espidf {
    use core::ffi::c_void;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, PoisonError};

    use esp_idf_svc::sys::*;
    use log::{error, info, warn};

    use crate::events::EventSender;
    use crate::fsm::EventId;
    use crate::ports::{Credentials, DriverError, DriverPort};

    /// Set while an `EspWifiDriver` owns the process-global registration
    /// slots (event handlers + default STA netif).
    static REGISTERED: AtomicBool = AtomicBool::new(false);

    struct EspInner {
        sta_netif: *mut esp_netif_t,
        wifi_event_instance: esp_event_handler_instance_t,
        ip_event_instance: esp_event_handler_instance_t,
        /// Boxed sender handed to the trampolines; freed in `deinit`.
        sender: *mut EventSender,
        wifi_init_done: bool,
    }

    // SAFETY: the raw pointers are only dereferenced by the event loop task
    // (trampolines) and by init/deinit, which serialize through the Mutex.
    unsafe impl Send for EspInner {}

    /// ESP-IDF station driver.
    pub struct EspWifiDriver {
        inner: Mutex<EspInner>,
    }

    fn check(ret: esp_err_t) -> Result<(), DriverError> {
        if ret == ESP_OK as i32 {
            Ok(())
        } else {
            Err(DriverError::Platform(ret))
        }
    }

    unsafe extern "C" fn wifi_event_trampoline(
        arg: *mut c_void,
        _base: esp_event_base_t,
        id: i32,
        data: *mut c_void,
    ) {
        if arg.is_null() {
            return;
        }
        let sender = &*(arg as *const EventSender);

        match id as u32 {
            wifi_event_t_WIFI_EVENT_STA_START => sender.notify_event(EventId::StaStart),
            wifi_event_t_WIFI_EVENT_STA_STOP => sender.notify_event(EventId::StaStop),
            wifi_event_t_WIFI_EVENT_STA_CONNECTED => sender.notify_event(EventId::StaConnected),
            wifi_event_t_WIFI_EVENT_STA_DISCONNECTED => {
                let (reason, rssi) = if data.is_null() {
                    (0, 0)
                } else {
                    let d = &*(data as *const wifi_event_sta_disconnected_t);
                    (d.reason, d.rssi)
                };
                sender.notify(EventId::StaDisconnected, reason, rssi);
            }
            _ => {} // unhandled wifi events are dropped silently
        }
    }

    unsafe extern "C" fn ip_event_trampoline(
        arg: *mut c_void,
        _base: esp_event_base_t,
        id: i32,
        _data: *mut c_void,
    ) {
        if arg.is_null() {
            return;
        }
        let sender = &*(arg as *const EventSender);

        match id as u32 {
            ip_event_t_IP_EVENT_STA_GOT_IP => sender.notify_event(EventId::GotIp),
            ip_event_t_IP_EVENT_STA_LOST_IP => sender.notify_event(EventId::LostIp),
            _ => {}
        }
    }

    impl EspWifiDriver {
        pub fn new() -> Self {
            Self {
                inner: Mutex::new(EspInner {
                    sta_netif: core::ptr::null_mut(),
                    wifi_event_instance: core::ptr::null_mut(),
                    ip_event_instance: core::ptr::null_mut(),
                    sender: core::ptr::null_mut(),
                    wifi_init_done: false,
                }),
            }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, EspInner> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Tear down whatever `init` managed to set up before failing.
        unsafe fn unwind_init(&self, inner: &mut EspInner) {
            if !inner.wifi_event_instance.is_null() {
                esp_event_handler_instance_unregister(
                    WIFI_EVENT,
                    ESP_EVENT_ANY_ID,
                    inner.wifi_event_instance,
                );
                inner.wifi_event_instance = core::ptr::null_mut();
            }
            if !inner.ip_event_instance.is_null() {
                esp_event_handler_instance_unregister(
                    IP_EVENT,
                    ESP_EVENT_ANY_ID,
                    inner.ip_event_instance,
                );
                inner.ip_event_instance = core::ptr::null_mut();
            }
            if !inner.sender.is_null() {
                drop(Box::from_raw(inner.sender));
                inner.sender = core::ptr::null_mut();
            }
            if inner.wifi_init_done {
                esp_wifi_deinit();
                inner.wifi_init_done = false;
            }
            if !inner.sta_netif.is_null() {
                esp_netif_destroy_default_wifi(inner.sta_netif as *mut c_void);
                inner.sta_netif = core::ptr::null_mut();
            }
            REGISTERED.store(false, Ordering::SeqCst);
        }
    }

    impl Default for EspWifiDriver {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DriverPort for EspWifiDriver {
        fn init(&self, events: EventSender) -> Result<(), DriverError> {
            if REGISTERED.swap(true, Ordering::SeqCst) {
                return Err(DriverError::AlreadyRegistered);
            }

            let mut inner = self.lock();
            // SAFETY: single initialising context; the global init calls
            // tolerate components that another subsystem brought up first.
            unsafe {
                let ret = esp_netif_init();
                if ret != ESP_OK as i32 && ret != ESP_ERR_INVALID_STATE as i32 {
                    error!("EspWifiDriver: esp_netif_init failed ({})", ret);
                    self.unwind_init(&mut inner);
                    return Err(DriverError::Platform(ret));
                }
                if ret == ESP_ERR_INVALID_STATE as i32 {
                    warn!("EspWifiDriver: netif already initialized");
                }

                let ret = esp_event_loop_create_default();
                if ret != ESP_OK as i32 && ret != ESP_ERR_INVALID_STATE as i32 {
                    error!("EspWifiDriver: event loop creation failed ({})", ret);
                    self.unwind_init(&mut inner);
                    return Err(DriverError::Platform(ret));
                }
                if ret == ESP_ERR_INVALID_STATE as i32 {
                    warn!("EspWifiDriver: event loop already created");
                }

                // Reuse the default STA netif if some earlier lifecycle left
                // one behind.
                inner.sta_netif =
                    esp_netif_get_handle_from_ifkey(b"WIFI_STA_DEF\0".as_ptr() as *const _);
                if inner.sta_netif.is_null() {
                    inner.sta_netif = esp_netif_create_default_wifi_sta();
                } else {
                    warn!("EspWifiDriver: reusing existing default STA netif");
                }
                if inner.sta_netif.is_null() {
                    error!("EspWifiDriver: failed to create default STA netif");
                    self.unwind_init(&mut inner);
                    return Err(DriverError::NotInitialized);
                }

                let cfg = wifi_init_config_t {
                    ..Default::default()
                };
                let ret = esp_wifi_init(&cfg);
                if ret != ESP_OK as i32 && ret != ESP_ERR_INVALID_STATE as i32 {
                    error!("EspWifiDriver: esp_wifi_init failed ({})", ret);
                    self.unwind_init(&mut inner);
                    return Err(DriverError::Platform(ret));
                }
                if ret == ESP_OK as i32 {
                    inner.wifi_init_done = true;
                } else {
                    warn!("EspWifiDriver: wifi stack already initialized");
                }

                let sender = Box::into_raw(Box::new(events));
                inner.sender = sender;

                let ret = esp_event_handler_instance_register(
                    WIFI_EVENT,
                    ESP_EVENT_ANY_ID,
                    Some(wifi_event_trampoline),
                    sender as *mut c_void,
                    &mut inner.wifi_event_instance,
                );
                if ret != ESP_OK as i32 {
                    error!("EspWifiDriver: wifi handler registration failed ({})", ret);
                    self.unwind_init(&mut inner);
                    return Err(DriverError::Platform(ret));
                }

                let ret = esp_event_handler_instance_register(
                    IP_EVENT,
                    ESP_EVENT_ANY_ID,
                    Some(ip_event_trampoline),
                    sender as *mut c_void,
                    &mut inner.ip_event_instance,
                );
                if ret != ESP_OK as i32 {
                    error!("EspWifiDriver: ip handler registration failed ({})", ret);
                    self.unwind_init(&mut inner);
                    return Err(DriverError::Platform(ret));
                }
            }

            info!("EspWifiDriver: initialized");
            Ok(())
        }

        fn set_mode_sta(&self) -> Result<(), DriverError> {
            // SAFETY: plain driver control call; no pointers outlive it.
            check(unsafe { esp_wifi_set_mode(wifi_mode_t_WIFI_MODE_STA) })
        }

        fn start(&self) -> Result<(), DriverError> {
            check(unsafe { esp_wifi_start() })
        }

        fn stop(&self) -> Result<(), DriverError> {
            check(unsafe { esp_wifi_stop() })
        }

        fn connect(&self) -> Result<(), DriverError> {
            check(unsafe { esp_wifi_connect() })
        }

        fn disconnect(&self) -> Result<(), DriverError> {
            check(unsafe { esp_wifi_disconnect() })
        }

        fn set_config(&self, config: &Credentials) -> Result<(), DriverError> {
            // SAFETY: wifi_config_t is a plain-data union; we fill the sta
            // member and hand a stack pointer to the driver, which copies it.
            unsafe {
                let mut wifi_cfg: wifi_config_t = core::mem::zeroed();
                let sta = &mut wifi_cfg.sta;

                let ssid_bytes = config.ssid.as_bytes();
                let pw_bytes = config.password.as_bytes();
                sta.ssid[..ssid_bytes.len()].copy_from_slice(ssid_bytes);
                sta.password[..pw_bytes.len()].copy_from_slice(pw_bytes);

                sta.scan_method = wifi_scan_method_t_WIFI_ALL_CHANNEL_SCAN;
                sta.failure_retry_cnt = 0;
                sta.pmf_cfg.capable = true;
                sta.pmf_cfg.required = false;
                sta.threshold.authmode = if config.password.is_empty() {
                    wifi_auth_mode_t_WIFI_AUTH_OPEN
                } else {
                    wifi_auth_mode_t_WIFI_AUTH_WPA2_PSK
                };

                let ret = esp_wifi_set_config(wifi_interface_t_WIFI_IF_STA, &mut wifi_cfg);
                if ret == ESP_ERR_WIFI_SSID as i32 {
                    return Err(DriverError::InvalidConfig);
                }
                check(ret)
            }
        }

        fn get_config(&self) -> Result<Credentials, DriverError> {
            // SAFETY: the driver fills the union's sta member in place.
            unsafe {
                let mut wifi_cfg: wifi_config_t = core::mem::zeroed();
                check(esp_wifi_get_config(
                    wifi_interface_t_WIFI_IF_STA,
                    &mut wifi_cfg,
                ))?;
                let sta = &wifi_cfg.sta;

                let ssid_len = sta.ssid.iter().position(|&b| b == 0).unwrap_or(32);
                let pw_len = sta.password.iter().position(|&b| b == 0).unwrap_or(64);
                Ok(Credentials::clamped(
                    core::str::from_utf8(&sta.ssid[..ssid_len]).unwrap_or(""),
                    core::str::from_utf8(&sta.password[..pw_len]).unwrap_or(""),
                ))
            }
        }

        fn restore(&self) -> Result<(), DriverError> {
            check(unsafe { esp_wifi_restore() })
        }

        fn deinit(&self) -> Result<(), DriverError> {
            let mut inner = self.lock();
            // SAFETY: handlers are unregistered before the sender box is
            // freed, so the trampolines can no longer observe the pointer.
            unsafe {
                if !inner.wifi_event_instance.is_null() {
                    esp_event_handler_instance_unregister(
                        WIFI_EVENT,
                        ESP_EVENT_ANY_ID,
                        inner.wifi_event_instance,
                    );
                    inner.wifi_event_instance = core::ptr::null_mut();
                }
                if !inner.ip_event_instance.is_null() {
                    esp_event_handler_instance_unregister(
                        IP_EVENT,
                        ESP_EVENT_ANY_ID,
                        inner.ip_event_instance,
                    );
                    inner.ip_event_instance = core::ptr::null_mut();
                }
                if !inner.sender.is_null() {
                    drop(Box::from_raw(inner.sender));
                    inner.sender = core::ptr::null_mut();
                }

                let ret = esp_wifi_deinit();
                if ret == ESP_OK as i32 || ret == ESP_ERR_WIFI_NOT_INIT as i32 {
                    inner.wifi_init_done = false;
                } else {
                    warn!("EspWifiDriver: esp_wifi_deinit failed ({})", ret);
                }

                if !inner.sta_netif.is_null() {
                    esp_netif_destroy_default_wifi(inner.sta_netif as *mut c_void);
                    inner.sta_netif = core::ptr::null_mut();
                }
            }
            REGISTERED.store(false, Ordering::SeqCst);
            info!("EspWifiDriver: deinitialized");
            Ok(())
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Simulation backend
// ───────────────────────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
mod sim {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    use log::info;

    use crate::events::{EventSender, REASON_ASSOC_LEAVE};
    use crate::fsm::EventId;
    use crate::ports::{Credentials, DriverError, DriverPort};

    /// Control calls recorded by the simulation, in invocation order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SimCall {
        Init,
        SetModeSta,
        Start,
        Stop,
        Connect,
        Disconnect,
        SetConfig,
        GetConfig,
        Restore,
        Deinit,
    }

    /// What the next `connect()` does when auto-events are on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ConnectOutcome {
        /// Association completes and an address is acquired.
        Connected,
        /// The AP refuses the attempt with the given reason at the given
        /// signal level.
        Refused { reason: u8, rssi: i8 },
        /// The attempt hangs: no event is ever delivered.
        Silent,
    }

    struct SimInner {
        events: Option<EventSender>,
        config: Credentials,
        calls: Vec<SimCall>,
        plan: VecDeque<ConnectOutcome>,
        auto_events: bool,
        associated: bool,
    }

    /// Scriptable station-driver simulation.
    ///
    /// In auto mode (the default) it behaves like a well-behaved AP:
    /// `start` raises the start event, `connect` associates and acquires an
    /// address (or follows the scripted outcome plan), `disconnect` leaves.
    /// In manual mode tests inject every event themselves via [`emit`].
    ///
    /// Cloning shares the underlying simulated hardware, so a test can keep
    /// one handle while the manager owns another.
    ///
    /// [`emit`]: SimDriver::emit
    #[derive(Clone)]
    pub struct SimDriver {
        shared: Arc<Mutex<SimInner>>,
    }

    impl SimDriver {
        /// Auto-event simulation: lifecycle events follow control calls.
        pub fn new() -> Self {
            Self::with_auto(true)
        }

        /// Manual simulation: no events unless the test injects them.
        pub fn manual() -> Self {
            Self::with_auto(false)
        }

        fn with_auto(auto_events: bool) -> Self {
            Self {
                shared: Arc::new(Mutex::new(SimInner {
                    events: None,
                    config: Credentials::default(),
                    calls: Vec::new(),
                    plan: VecDeque::new(),
                    auto_events,
                    associated: false,
                })),
            }
        }

        fn lock(&self) -> MutexGuard<'_, SimInner> {
            self.shared.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Script the outcome of an upcoming `connect()` (FIFO).
        pub fn queue_connect_outcome(&self, outcome: ConnectOutcome) {
            self.lock().plan.push_back(outcome);
        }

        /// Every control call recorded so far.
        pub fn calls(&self) -> Vec<SimCall> {
            self.lock().calls.clone()
        }

        /// How many times `call` was invoked.
        pub fn call_count(&self, call: SimCall) -> usize {
            self.lock().calls.iter().filter(|c| **c == call).count()
        }

        /// Inject a raw driver event, as the event translator would.
        pub fn emit(&self, id: EventId, reason: u8, rssi: i8) {
            let sender = self.lock().events.clone();
            if let Some(sender) = sender {
                sender.notify(id, reason, rssi);
            }
        }

        pub fn emit_sta_connected(&self) {
            self.lock().associated = true;
            self.emit(EventId::StaConnected, 0, 0);
        }

        pub fn emit_got_ip(&self) {
            self.emit(EventId::GotIp, 0, 0);
        }

        pub fn emit_lost_ip(&self) {
            self.emit(EventId::LostIp, 0, 0);
        }

        pub fn emit_sta_disconnected(&self, reason: u8, rssi: i8) {
            self.lock().associated = false;
            self.emit(EventId::StaDisconnected, reason, rssi);
        }
    }

    impl Default for SimDriver {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DriverPort for SimDriver {
        fn init(&self, events: EventSender) -> Result<(), DriverError> {
            let mut inner = self.lock();
            inner.calls.push(SimCall::Init);
            inner.events = Some(events);
            info!("SimDriver: initialized");
            Ok(())
        }

        fn set_mode_sta(&self) -> Result<(), DriverError> {
            self.lock().calls.push(SimCall::SetModeSta);
            Ok(())
        }

        fn start(&self) -> Result<(), DriverError> {
            let (sender, auto) = {
                let mut inner = self.lock();
                inner.calls.push(SimCall::Start);
                (inner.events.clone(), inner.auto_events)
            };
            if auto {
                if let Some(sender) = sender {
                    sender.notify_event(EventId::StaStart);
                }
            }
            Ok(())
        }

        fn stop(&self) -> Result<(), DriverError> {
            let (sender, auto, was_associated) = {
                let mut inner = self.lock();
                inner.calls.push(SimCall::Stop);
                let was = inner.associated;
                inner.associated = false;
                (inner.events.clone(), inner.auto_events, was)
            };
            if auto {
                if let Some(sender) = sender {
                    if was_associated {
                        sender.notify(EventId::StaDisconnected, REASON_ASSOC_LEAVE, 0);
                    }
                    sender.notify_event(EventId::StaStop);
                }
            }
            Ok(())
        }

        fn connect(&self) -> Result<(), DriverError> {
            let (sender, auto, outcome) = {
                let mut inner = self.lock();
                inner.calls.push(SimCall::Connect);
                let outcome = inner
                    .plan
                    .pop_front()
                    .unwrap_or(ConnectOutcome::Connected);
                if matches!(outcome, ConnectOutcome::Connected) {
                    inner.associated = true;
                }
                (inner.events.clone(), inner.auto_events, outcome)
            };
            if auto {
                if let Some(sender) = sender {
                    match outcome {
                        ConnectOutcome::Connected => {
                            sender.notify_event(EventId::StaConnected);
                            sender.notify_event(EventId::GotIp);
                        }
                        ConnectOutcome::Refused { reason, rssi } => {
                            sender.notify(EventId::StaDisconnected, reason, rssi);
                        }
                        ConnectOutcome::Silent => {}
                    }
                }
            }
            Ok(())
        }

        fn disconnect(&self) -> Result<(), DriverError> {
            let (sender, auto, was_associated) = {
                let mut inner = self.lock();
                inner.calls.push(SimCall::Disconnect);
                let was = inner.associated;
                inner.associated = false;
                (inner.events.clone(), inner.auto_events, was)
            };
            // A connection that never completed produces no event, exactly
            // like the real driver.
            if auto && was_associated {
                if let Some(sender) = sender {
                    sender.notify(EventId::StaDisconnected, REASON_ASSOC_LEAVE, 0);
                }
            }
            Ok(())
        }

        fn set_config(&self, config: &Credentials) -> Result<(), DriverError> {
            let mut inner = self.lock();
            inner.calls.push(SimCall::SetConfig);
            inner.config = config.clone();
            Ok(())
        }

        fn get_config(&self) -> Result<Credentials, DriverError> {
            let mut inner = self.lock();
            inner.calls.push(SimCall::GetConfig);
            Ok(inner.config.clone())
        }

        fn restore(&self) -> Result<(), DriverError> {
            let mut inner = self.lock();
            inner.calls.push(SimCall::Restore);
            inner.config = Credentials::default();
            Ok(())
        }

        fn deinit(&self) -> Result<(), DriverError> {
            let mut inner = self.lock();
            inner.calls.push(SimCall::Deinit);
            inner.events = None;
            info!("SimDriver: deinitialized");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::events::Message;
        use crate::sync::MessageQueue;
        use core::time::Duration;

        fn wired(driver: &SimDriver) -> Arc<MessageQueue> {
            let queue = Arc::new(MessageQueue::new(10));
            driver.init(EventSender::new(Arc::clone(&queue))).unwrap();
            queue
        }

        #[test]
        fn records_control_calls_in_order() {
            let driver = SimDriver::manual();
            let _ = wired(&driver);
            driver.set_mode_sta().unwrap();
            driver.start().unwrap();
            driver.stop().unwrap();
            assert_eq!(
                driver.calls(),
                vec![
                    SimCall::Init,
                    SimCall::SetModeSta,
                    SimCall::Start,
                    SimCall::Stop
                ]
            );
        }

        #[test]
        fn auto_start_raises_sta_start() {
            let driver = SimDriver::new();
            let queue = wired(&driver);
            driver.start().unwrap();
            assert_eq!(
                queue.recv(Some(Duration::ZERO)),
                Some(Message::event(crate::fsm::EventId::StaStart))
            );
        }

        #[test]
        fn auto_connect_associates_and_gets_ip() {
            let driver = SimDriver::new();
            let queue = wired(&driver);
            driver.connect().unwrap();
            assert_eq!(
                queue.recv(Some(Duration::ZERO)),
                Some(Message::event(crate::fsm::EventId::StaConnected))
            );
            assert_eq!(
                queue.recv(Some(Duration::ZERO)),
                Some(Message::event(crate::fsm::EventId::GotIp))
            );
        }

        #[test]
        fn refused_connect_reports_reason_and_rssi() {
            let driver = SimDriver::new();
            let queue = wired(&driver);
            driver.queue_connect_outcome(ConnectOutcome::Refused {
                reason: crate::events::REASON_AUTH_FAIL,
                rssi: -61,
            });
            driver.connect().unwrap();
            assert_eq!(
                queue.recv(Some(Duration::ZERO)),
                Some(Message::Event {
                    id: crate::fsm::EventId::StaDisconnected,
                    reason: crate::events::REASON_AUTH_FAIL,
                    rssi: -61
                })
            );
        }

        #[test]
        fn disconnect_of_unassociated_link_is_silent() {
            let driver = SimDriver::new();
            let queue = wired(&driver);
            driver.disconnect().unwrap();
            assert_eq!(queue.recv(Some(Duration::ZERO)), None);
        }

        #[test]
        fn config_round_trip_and_restore() {
            let driver = SimDriver::manual();
            driver
                .set_config(&Credentials::clamped("Net", "password"))
                .unwrap();
            assert_eq!(driver.get_config().unwrap().ssid.as_str(), "Net");
            driver.restore().unwrap();
            assert!(driver.get_config().unwrap().is_empty());
        }
    }
}
