//! Manager core.
//!
//! A single long-lived worker task owns the state machine, drains one queue
//! of commands and events, performs every driver control call, and releases
//! sync bits that blocking API callers wait on.  Public API functions run on
//! caller threads: they validate against the state machine (fail fast when
//! invalid, return immediately when idempotent), post a message, and — for
//! the blocking variants — wait on the sync flags with a caller-supplied
//! timeout.
//!
//! ```text
//!  caller ──validate──▶ queue ──▶ worker ──▶ driver
//!    ▲                              │           │
//!    └───── wait on sync bits ◀─────┘◀── events ┘
//! ```
//!
//! Concurrency rules: only the worker writes the state machine; callers
//! read it under the state mutex, so `state()` linearizes with respect to
//! worker transitions.  The driver is called by the worker only, with one
//! exception: `set_credentials` issues its disconnect from the caller
//! thread, mirroring the native driver's own locking model.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::adapters::time::MonotonicClock;
use crate::config::{self, ManagerConfig};
use crate::error::{Error, Result};
use crate::events::{DisconnectReason, EventSender, Message, ReasonClass};
use crate::fsm::{rssi_band, Action, CommandId, EventId, State, StateMachine};
use crate::ports::{Credentials, DriverPort, KvStore};
use crate::store::CredentialStore;
use crate::sync::{
    MessageQueue, SyncFlags, CONNECTED_BIT, CONNECT_FAILED_BIT, DISCONNECTED_BIT,
    INVALID_STATE_BIT, STARTED_BIT, START_FAILED_BIT, STOPPED_BIT, STOP_FAILED_BIT,
};

// ───────────────────────────────────────────────────────────────
// Shared state
// ───────────────────────────────────────────────────────────────

/// Everything guarded by the state mutex.
struct Shared {
    fsm: StateMachine,
    /// RAM mirror of the persisted credential-validity flag.
    creds_valid: bool,
}

struct Inner<D: DriverPort, S: KvStore> {
    driver: D,
    store: CredentialStore<S>,
    config: ManagerConfig,
    shared: Mutex<Shared>,
    queue: Arc<MessageQueue>,
    flags: SyncFlags,
    clock: MonotonicClock,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Station-mode WiFi connection manager.
///
/// Generic over the driver and storage ports so the full pipeline runs
/// against simulation backends on the host.  On ESP-IDF the driver adapter
/// enforces the process-singleton property (the event registration slots
/// are process-global); the manager itself is an owned handle.
pub struct WifiManager<D: DriverPort + 'static, S: KvStore + 'static> {
    inner: Arc<Inner<D, S>>,
}

impl<D: DriverPort + 'static, S: KvStore + 'static> WifiManager<D, S> {
    /// Initialize the manager: bring up the driver, load the credential
    /// validity flag, apply the compile-time fallback, and launch the
    /// worker task.
    pub fn new(driver: D, kv: S, config: ManagerConfig) -> Result<Self> {
        let queue = Arc::new(MessageQueue::new(config::COMMAND_QUEUE_DEPTH));
        let store = CredentialStore::new(kv, config.nvs_namespace);

        let inner = Arc::new(Inner {
            driver,
            store,
            config,
            shared: Mutex::new(Shared {
                fsm: StateMachine::new(),
                creds_valid: false,
            }),
            queue: Arc::clone(&queue),
            flags: SyncFlags::new(),
            clock: MonotonicClock::new(),
            worker: Mutex::new(None),
        });

        inner.lock_shared().fsm.transition_to(State::Initializing);

        let events = EventSender::new(queue);
        if let Err(e) = inner.driver.init(events) {
            error!("WifiManager: driver init failed: {e}");
            return Self::fail_init(&inner, e.into());
        }
        if let Err(e) = inner.driver.set_mode_sta() {
            error!("WifiManager: failed to enter station mode: {e}");
            return Self::fail_init(&inner, e.into());
        }

        // Validity flag from persistent storage, then the compile-time
        // fallback for drivers with no stored SSID.
        let flag = match inner.store.load_valid_flag() {
            Ok(f) => f,
            Err(e) => {
                warn!("WifiManager: validity flag unreadable ({e}), treating as unset");
                None
            }
        };
        let valid = match inner
            .store
            .ensure_config_fallback(&inner.driver, &inner.config, flag)
        {
            Ok(v) => v,
            Err(e) => {
                warn!("WifiManager: config fallback failed ({e})");
                flag.unwrap_or(false)
            }
        };
        inner.lock_shared().creds_valid = valid;

        // The consumer task that executes all driver operations.
        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("wifi".into())
            .spawn(move || worker_inner.worker_loop());
        let handle = match handle {
            Ok(h) => h,
            Err(_) => {
                error!("WifiManager: failed to spawn worker task");
                return Self::fail_init(&inner, Error::NoMem);
            }
        };
        *lock(&inner.worker) = Some(handle);

        inner.lock_shared().fsm.transition_to(State::Initialized);
        info!("WifiManager: initialized (credentials valid: {valid})");
        Ok(Self { inner })
    }

    fn fail_init(inner: &Arc<Inner<D, S>>, err: Error) -> Result<Self> {
        let _ = inner.driver.deinit();
        inner.lock_shared().fsm.transition_to(State::Uninitialized);
        Err(err)
    }

    // ── Observers ─────────────────────────────────────────────

    /// Current lifecycle state, linearized with worker transitions.
    pub fn state(&self) -> State {
        self.inner.lock_shared().fsm.state()
    }

    /// RAM mirror of the persisted credential-validity flag.
    pub fn is_credentials_valid(&self) -> bool {
        self.inner.lock_shared().creds_valid
    }

    /// Consecutive recoverable disconnects since the last success.
    pub fn retry_count(&self) -> u32 {
        self.inner.lock_shared().fsm.retry_count()
    }

    // ── Control (blocking variants) ───────────────────────────

    /// Power the radio up and wait for the driver's confirmation.
    pub fn start(&self, timeout: Duration) -> Result<()> {
        self.inner.sync_command(CommandId::Start, timeout)
    }

    /// Power the radio down and wait for the driver's confirmation.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        self.inner.sync_command(CommandId::Stop, timeout)
    }

    /// Associate and wait until an address is acquired (or the attempt
    /// terminally fails).
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        self.inner.sync_command(CommandId::Connect, timeout)
    }

    /// Drop the association (or cancel a pending reconnect) and wait.
    pub fn disconnect(&self, timeout: Duration) -> Result<()> {
        self.inner.sync_command(CommandId::Disconnect, timeout)
    }

    // ── Control (non-blocking variants) ───────────────────────

    pub fn start_async(&self) -> Result<()> {
        self.inner.async_command(CommandId::Start)
    }

    pub fn stop_async(&self) -> Result<()> {
        self.inner.async_command(CommandId::Stop)
    }

    pub fn connect_async(&self) -> Result<()> {
        self.inner.async_command(CommandId::Connect)
    }

    pub fn disconnect_async(&self) -> Result<()> {
        self.inner.async_command(CommandId::Disconnect)
    }

    // ── Credentials ───────────────────────────────────────────

    /// Apply new credentials (clamped to 32/64 bytes) and persist their
    /// validity.  Does **not** reconnect — the caller decides when to
    /// `connect()` with the new credentials.
    pub fn set_credentials(&self, ssid: &str, password: &str) -> Result<()> {
        let mut sh = self.inner.lock_shared();
        if sh.fsm.state() == State::Uninitialized {
            return Err(Error::InvalidState);
        }

        if sh.fsm.is_active() {
            // A stale in-flight association must not outlive the change;
            // the next connect uses the new credentials.
            info!("WifiManager: disconnecting before applying new credentials");
            let _ = self.inner.driver.disconnect();
        }

        let valid = self
            .inner
            .store
            .save_credentials(&self.inner.driver, ssid, password)?;
        sh.fsm.reset_retries();
        sh.creds_valid = valid;
        Ok(())
    }

    /// The credentials the driver currently holds.
    pub fn credentials(&self) -> Result<Credentials> {
        self.inner.store.load_credentials(&self.inner.driver)
    }

    /// Wipe SSID and password and mark the stored flag invalid.
    pub fn clear_credentials(&self) -> Result<()> {
        let mut sh = self.inner.lock_shared();
        if sh.fsm.state() == State::Uninitialized {
            return Err(Error::InvalidState);
        }
        self.inner.store.clear_credentials(&self.inner.driver)?;
        sh.fsm.reset_retries();
        sh.creds_valid = false;
        Ok(())
    }

    /// Erase the driver's persisted config and this manager's namespace,
    /// then force the lifecycle back to `Initialized`.
    pub fn factory_reset(&self) -> Result<()> {
        let mut sh = self.inner.lock_shared();
        if sh.fsm.state() == State::Uninitialized {
            return Err(Error::InvalidState);
        }
        info!("WifiManager: factory reset");
        self.inner.store.factory_reset(&self.inner.driver)?;
        sh.creds_valid = false;
        sh.fsm.reset_retries();
        sh.fsm.transition_to(State::Initialized);
        Ok(())
    }

    // ── Teardown ──────────────────────────────────────────────

    /// Quiesce the radio, terminate the worker task, and tear the driver
    /// down.  Idempotent.
    pub fn deinit(&self) -> Result<()> {
        let state = self.state();
        if state == State::Uninitialized {
            return Ok(());
        }
        info!("WifiManager: deinitializing");

        if state.is_active() {
            info!("WifiManager: radio running, stopping first");
            let _ = self.stop(Duration::from_millis(config::DEINIT_STOP_TIMEOUT_MS));
        }

        if let Some(handle) = lock(&self.inner.worker).take() {
            let posted = self.inner.queue.post_timeout(
                Message::Command(CommandId::Exit),
                Duration::from_millis(config::EXIT_POST_TIMEOUT_MS),
            );
            if posted {
                let deadline =
                    Instant::now() + Duration::from_millis(config::TASK_EXIT_GRACE_MS);
                while !handle.is_finished() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(10));
                }
            }
            if handle.is_finished() {
                let _ = handle.join();
                info!("WifiManager: worker task terminated");
            } else {
                // A thread cannot be force-deleted; detach it and proceed.
                warn!("WifiManager: worker task did not exit gracefully, detaching");
                drop(handle);
            }
        }

        if let Err(e) = self.inner.driver.deinit() {
            warn!("WifiManager: driver deinit failed: {e}");
        }

        self.inner.lock_shared().fsm.transition_to(State::Uninitialized);
        info!("WifiManager: deinitialized");
        Ok(())
    }
}

impl<D: DriverPort + 'static, S: KvStore + 'static> Drop for WifiManager<D, S> {
    fn drop(&mut self) {
        let _ = self.deinit();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────
// Caller-thread command paths
// ───────────────────────────────────────────────────────────────

impl<D: DriverPort, S: KvStore> Inner<D, S> {
    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Success / failure bits a blocking caller waits on for `cmd`.
    fn bits_for(cmd: CommandId) -> (u32, u32) {
        match cmd {
            CommandId::Start => (STARTED_BIT, START_FAILED_BIT),
            CommandId::Stop => (STOPPED_BIT, STOP_FAILED_BIT),
            CommandId::Connect => (CONNECTED_BIT, CONNECT_FAILED_BIT),
            CommandId::Disconnect => (DISCONNECTED_BIT, CONNECT_FAILED_BIT),
            CommandId::Exit => (0, 0),
        }
    }

    /// Common prologue: fail fast on invalid state, return early when the
    /// requested condition already holds.
    fn precheck(&self, cmd: CommandId) -> Result<Action> {
        match self.lock_shared().fsm.validate(cmd) {
            Action::Reject => Err(Error::InvalidState),
            action => Ok(action),
        }
    }

    fn async_command(&self, cmd: CommandId) -> Result<()> {
        if self.precheck(cmd)? == Action::Skip {
            return Ok(());
        }
        if self.queue.try_post(Message::Command(cmd)) {
            Ok(())
        } else {
            error!("WifiManager: command queue full, dropping {cmd:?}");
            Err(Error::QueueFull)
        }
    }

    fn sync_command(&self, cmd: CommandId, timeout: Duration) -> Result<()> {
        if self.precheck(cmd)? == Action::Skip {
            return Ok(());
        }

        let (success, failure) = Self::bits_for(cmd);
        let mask = success | failure | INVALID_STATE_BIT;

        // One-shot signalling: stale bits from an earlier call must not
        // satisfy this wait.
        self.flags.clear(mask);
        self.queue.post(Message::Command(cmd));

        let bits = self.flags.wait_any(mask, timeout);
        if bits & INVALID_STATE_BIT != 0 {
            return Err(Error::InvalidState);
        }
        if bits & success != 0 {
            return Ok(());
        }
        if bits & failure != 0 {
            return Err(Error::Fail);
        }

        // Timed out: roll back transient driver state where a stuck
        // transition would wedge the next attempt.  Posted straight to the
        // queue — the worker may not have reached our command yet, and a
        // caller-side validate against the stale state would skip the
        // rollback.
        match cmd {
            CommandId::Start => {
                warn!("WifiManager: start timed out, cancelling");
                let _ = self.queue.try_post(Message::Command(CommandId::Stop));
            }
            CommandId::Connect => {
                warn!("WifiManager: connect timed out, cancelling attempt");
                let _ = self.queue.try_post(Message::Command(CommandId::Disconnect));
            }
            _ => {}
        }
        Err(Error::Timeout)
    }
}

// ───────────────────────────────────────────────────────────────
// Worker task
// ───────────────────────────────────────────────────────────────

impl<D: DriverPort, S: KvStore> Inner<D, S> {
    fn worker_loop(&self) {
        loop {
            let wait = self.lock_shared().fsm.wait_duration(self.clock.now_ms());
            match self.queue.recv(wait) {
                Some(Message::Command(CommandId::Exit)) => {
                    info!("WifiManager: worker task exiting");
                    return;
                }
                Some(msg) => {
                    let mut sh = self.lock_shared();
                    self.process(&mut sh, msg);
                }
                None => self.on_backoff_expired(),
            }
        }
    }

    /// The dequeue timed out — the backoff deadline has passed.
    fn on_backoff_expired(&self) {
        let mut sh = self.lock_shared();
        if sh.fsm.state() != State::WaitingReconnect {
            return;
        }
        if sh.creds_valid {
            info!(
                "WifiManager: backoff elapsed, retrying connection (attempt {})",
                sh.fsm.retry_count()
            );
            self.transition(&mut sh, State::Connecting);
            if let Err(e) = self.driver.connect() {
                warn!("WifiManager: reconnect attempt failed to issue: {e}");
            }
        } else {
            warn!("WifiManager: credentials invalid, abandoning reconnect");
            self.transition(&mut sh, State::DISCONNECTED);
        }
    }

    fn process(&self, sh: &mut Shared, msg: Message) {
        match msg {
            Message::Command(cmd) => {
                // Explicit user intent clears the retry history.
                sh.fsm.reset_retries();
                self.process_command(sh, cmd);
            }
            Message::Event { id, reason, rssi } => self.process_event(sh, id, reason, rssi),
        }
    }

    fn transition(&self, sh: &mut Shared, next: State) {
        let from = sh.fsm.state();
        if from != next {
            info!("WifiManager: {from:?} -> {next:?}");
        }
        sh.fsm.transition_to(next);
    }

    // ── Commands ──────────────────────────────────────────────

    fn process_command(&self, sh: &mut Shared, cmd: CommandId) {
        let state = sh.fsm.state();
        match sh.fsm.validate(cmd) {
            Action::Reject => {
                error!("WifiManager: cannot {cmd:?} in state {state:?}");
                self.flags.set(INVALID_STATE_BIT);
            }
            Action::Skip => self.complete_skip(sh, cmd),
            Action::Execute => self.execute(sh, cmd, state),
        }
    }

    /// The requested condition already holds (or is trivially in flight);
    /// wake the caller with the terminal success bit.
    fn complete_skip(&self, sh: &Shared, cmd: CommandId) {
        let bits = match cmd {
            CommandId::Start => STARTED_BIT,
            CommandId::Stop => STOPPED_BIT,
            // While still connecting, the in-flight attempt's outcome
            // decides; only an established connection completes here.
            CommandId::Connect if sh.fsm.is_connected() => CONNECTED_BIT,
            CommandId::Connect => return,
            CommandId::Disconnect => DISCONNECTED_BIT,
            CommandId::Exit => return,
        };
        self.flags.set(bits);
    }

    fn execute(&self, sh: &mut Shared, cmd: CommandId, prior: State) {
        match cmd {
            CommandId::Start => {
                self.transition(sh, State::Starting);
                if let Err(e) = self.driver.start() {
                    error!("WifiManager: failed to start driver: {e}");
                    self.transition(sh, prior);
                    self.flags.set(START_FAILED_BIT);
                }
            }
            CommandId::Stop => {
                self.transition(sh, State::Stopping);
                if let Err(e) = self.driver.stop() {
                    error!("WifiManager: failed to stop driver: {e}");
                    self.transition(sh, prior);
                    self.flags.set(STOP_FAILED_BIT);
                }
            }
            CommandId::Connect => {
                self.transition(sh, State::Connecting);
                if let Err(e) = self.driver.connect() {
                    error!("WifiManager: failed to connect: {e}");
                    self.transition(sh, prior);
                    self.flags.set(CONNECT_FAILED_BIT);
                }
            }
            CommandId::Disconnect => {
                // A connection that never completed, or a reconnect pending
                // in backoff, may produce no disconnect event from the
                // driver; resolve immediately, still telling the driver.
                if prior == State::Connecting || prior == State::WaitingReconnect {
                    self.transition(sh, State::DISCONNECTED);
                    let _ = self.driver.disconnect();
                    self.flags.set(DISCONNECTED_BIT);
                    return;
                }
                self.transition(sh, State::Disconnecting);
                if let Err(e) = self.driver.disconnect() {
                    error!("WifiManager: failed to disconnect: {e}");
                    self.transition(sh, prior);
                    self.flags.set(CONNECT_FAILED_BIT);
                }
            }
            CommandId::Exit => {}
        }
    }

    // ── Events ────────────────────────────────────────────────

    fn process_event(&self, sh: &mut Shared, id: EventId, reason: u8, rssi: i8) {
        if id == EventId::StaDisconnected {
            self.handle_sta_disconnected(sh, reason, rssi);
            return;
        }

        let prior = sh.fsm.state();
        let outcome = sh.fsm.resolve(id);
        if outcome.next == prior && outcome.notify == 0 {
            warn!("WifiManager: {id:?} ignored in state {prior:?}");
            return;
        }
        self.transition(sh, outcome.next);

        if id == EventId::GotIp && outcome.next == State::ConnectedGotIp {
            // The connection proves the current credentials.
            sh.fsm.reset_retries();
            if !sh.creds_valid {
                self.persist_valid(sh, true);
            }
        }

        if outcome.notify != 0 {
            self.flags.set(outcome.notify);
        }
    }

    fn handle_sta_disconnected(&self, sh: &mut Shared, reason_code: u8, rssi: i8) {
        let prior = sh.fsm.state();
        let reason = DisconnectReason::from_code(reason_code);
        info!(
            "WifiManager: disconnected in {prior:?} (reason {reason_code} [{reason:?}], \
             RSSI {rssi} dBm [{}])",
            rssi_band(rssi)
        );

        match prior {
            // The driver failed to come up.
            State::Starting => {
                self.transition(sh, State::Initialized);
                self.flags.set(START_FAILED_BIT);
            }
            // Disconnection was requested through the API.
            State::Disconnecting => {
                self.transition(sh, State::DISCONNECTED);
                self.flags.set(DISCONNECTED_BIT | CONNECT_FAILED_BIT);
            }
            // Stays STOPPING until the driver's stop event lands.
            State::Stopping => {
                self.flags.set(DISCONNECTED_BIT | CONNECT_FAILED_BIT);
            }
            // Association phase, or a retry burst during backoff: classify.
            State::Connecting
            | State::ConnectedNoIp
            | State::ConnectedGotIp
            | State::WaitingReconnect => {
                self.classify_disconnect(sh, reason, rssi);
            }
            State::Uninitialized | State::Initializing | State::Initialized => {
                warn!("WifiManager: disconnect event while radio inactive");
                self.flags.set(DISCONNECTED_BIT | CONNECT_FAILED_BIT);
            }
            State::Started | State::ErrorCredentials => {
                warn!("WifiManager: disconnect event ignored in state {prior:?}");
            }
        }
    }

    fn classify_disconnect(&self, sh: &mut Shared, reason: DisconnectReason, rssi: i8) {
        match reason.class() {
            ReasonClass::PeerLeave => {
                info!("WifiManager: peer-initiated disconnect");
                self.transition(sh, State::DISCONNECTED);
                self.flags.set(DISCONNECTED_BIT | CONNECT_FAILED_BIT);
            }
            ReasonClass::SuspectCredentials => {
                if sh.fsm.handle_suspect_failure(rssi) {
                    error!(
                        "WifiManager: suspect-failure limit reached at {rssi} dBm [{}], \
                         invalidating credentials",
                        rssi_band(rssi)
                    );
                    self.persist_valid(sh, false);
                } else {
                    let delay = sh.fsm.calculate_next_backoff(self.clock.now_ms());
                    warn!(
                        "WifiManager: suspect failure {} at {rssi} dBm [{}], retry in {delay} ms",
                        sh.fsm.suspect_retry_count(),
                        rssi_band(rssi)
                    );
                }
                self.flags.set(CONNECT_FAILED_BIT);
            }
            ReasonClass::Recoverable => {
                if sh.creds_valid {
                    let delay = sh.fsm.calculate_next_backoff(self.clock.now_ms());
                    info!(
                        "WifiManager: reconnection attempt {} in {delay} ms",
                        sh.fsm.retry_count()
                    );
                } else {
                    warn!("WifiManager: credentials invalid, not reconnecting");
                    self.transition(sh, State::DISCONNECTED);
                }
                self.flags.set(CONNECT_FAILED_BIT);
            }
        }
    }

    /// Persist the validity flag and update the RAM mirror.  A storage
    /// failure keeps the mirror authoritative until the next write.
    fn persist_valid(&self, sh: &mut Shared, valid: bool) {
        if let Err(e) = self.store.save_valid_flag(valid) {
            warn!("WifiManager: failed to persist credential validity: {e}");
        }
        sh.creds_valid = valid;
    }
}
