//! Pure connection-lifecycle state machine.
//!
//! Table-driven FSM in the classic embedded style: fixed-size const
//! matrices indexed by enum discriminant.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ COMMAND_MATRIX   [state][command] → Execute | Skip | Reject │
//! │ EVENT_MATRIX     [state][event]   → (next state, sync bits) │
//! │ PROPS            [state]          → active/connected/ready  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Because every table is sized `[_; STATE_COUNT]`, a missing row or cell
//! is a compile error — coverage is total by construction.
//!
//! The [`StateMachine`] adds the reconnection bookkeeping on top: retry
//! counters, the signal-quality-tiered suspect-failure limit, and the
//! exponential-backoff deadline.  It performs no I/O and takes the current
//! monotonic time as a parameter, which keeps it fully host-testable.

use core::time::Duration;

use crate::sync::{CONNECTED_BIT, DISCONNECTED_BIT, STARTED_BIT, START_FAILED_BIT, STOPPED_BIT};

// ---------------------------------------------------------------------------
// State identity
// ---------------------------------------------------------------------------

/// Connection-lifecycle states.
/// Must stay in sync with the tables below (enforced by their fixed sizes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    Uninitialized = 0,
    Initializing = 1,
    Initialized = 2,
    Starting = 3,
    Started = 4,
    Connecting = 5,
    ConnectedNoIp = 6,
    ConnectedGotIp = 7,
    Disconnecting = 8,
    WaitingReconnect = 9,
    ErrorCredentials = 10,
    Stopping = 11,
}

/// Total number of states — sizes every table in this module.
pub const STATE_COUNT: usize = 12;

impl State {
    /// Radio off, resources alive — same underlying state as `Initialized`.
    pub const STOPPED: Self = Self::Initialized;
    /// Radio on, no association — same underlying state as `Started`.
    pub const DISCONNECTED: Self = Self::Started;

    /// Every state, in discriminant order.
    pub const ALL: [Self; STATE_COUNT] = [
        Self::Uninitialized,
        Self::Initializing,
        Self::Initialized,
        Self::Starting,
        Self::Started,
        Self::Connecting,
        Self::ConnectedNoIp,
        Self::ConnectedGotIp,
        Self::Disconnecting,
        Self::WaitingReconnect,
        Self::ErrorCredentials,
        Self::Stopping,
    ];

    /// Radio/worker engaged (a stop is required before deinit).
    pub fn is_active(self) -> bool {
        PROPS[self as usize].is_active
    }

    /// L2 link established (IP may or may not be acquired).
    pub fn is_connected(self) -> bool {
        PROPS[self as usize].is_connected
    }

    /// Driver can accept association commands.
    pub fn is_sta_ready(self) -> bool {
        PROPS[self as usize].is_sta_ready
    }
}

/// Commands accepted by the worker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    Start = 0,
    Stop = 1,
    Connect = 2,
    Disconnect = 3,
    /// Privileged: only `deinit` issues it; terminates the worker task.
    Exit = 4,
}

pub const COMMAND_COUNT: usize = 5;

impl CommandId {
    pub const ALL: [Self; COMMAND_COUNT] = [
        Self::Start,
        Self::Stop,
        Self::Connect,
        Self::Disconnect,
        Self::Exit,
    ];
}

/// Events reported by the radio driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventId {
    StaStart = 0,
    StaStop = 1,
    StaConnected = 2,
    StaDisconnected = 3,
    GotIp = 4,
    LostIp = 5,
}

pub const EVENT_COUNT: usize = 6;

impl EventId {
    pub const ALL: [Self; EVENT_COUNT] = [
        Self::StaStart,
        Self::StaStop,
        Self::StaConnected,
        Self::StaDisconnected,
        Self::GotIp,
        Self::LostIp,
    ];
}

// ---------------------------------------------------------------------------
// Table cell types
// ---------------------------------------------------------------------------

/// What the validator tells the API (and the worker) about a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Perform the transition and the driver call.
    Execute,
    /// Already in (or trivially reaching) the requested condition;
    /// fail-fast success.
    Skip,
    /// Not legal in this state; surfaces as an invalid-state error.
    Reject,
}

/// Result of resolving an event against the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventOutcome {
    pub next: State,
    /// Sync bits the worker releases after writing the new state.
    pub notify: u32,
}

struct StateProps {
    is_active: bool,
    is_connected: bool,
    is_sta_ready: bool,
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

const PROPS: [StateProps; STATE_COUNT] = [
    /* Uninitialized    */ StateProps { is_active: false, is_connected: false, is_sta_ready: false },
    /* Initializing     */ StateProps { is_active: false, is_connected: false, is_sta_ready: false },
    /* Initialized      */ StateProps { is_active: false, is_connected: false, is_sta_ready: false },
    /* Starting         */ StateProps { is_active: true, is_connected: false, is_sta_ready: false },
    /* Started          */ StateProps { is_active: true, is_connected: false, is_sta_ready: true },
    /* Connecting       */ StateProps { is_active: true, is_connected: false, is_sta_ready: true },
    /* ConnectedNoIp    */ StateProps { is_active: true, is_connected: true, is_sta_ready: true },
    /* ConnectedGotIp   */ StateProps { is_active: true, is_connected: true, is_sta_ready: true },
    /* Disconnecting    */ StateProps { is_active: true, is_connected: false, is_sta_ready: true },
    /* WaitingReconnect */ StateProps { is_active: true, is_connected: false, is_sta_ready: true },
    /* ErrorCredentials */ StateProps { is_active: true, is_connected: false, is_sta_ready: true },
    /* Stopping         */ StateProps { is_active: true, is_connected: false, is_sta_ready: false },
];

use Action::{Execute, Reject, Skip};

const COMMAND_MATRIX: [[Action; COMMAND_COUNT]; STATE_COUNT] = [
    // [Start,  Stop,    Connect, Disconnect, Exit]
    /* Uninitialized    */ [Reject, Reject, Reject, Reject, Reject],
    /* Initializing     */ [Reject, Reject, Reject, Reject, Reject],
    /* Initialized      */ [Execute, Skip, Reject, Reject, Reject],
    /* Starting         */ [Skip, Execute, Reject, Reject, Reject],
    /* Started          */ [Skip, Execute, Execute, Skip, Reject],
    /* Connecting       */ [Skip, Execute, Skip, Execute, Reject],
    /* ConnectedNoIp    */ [Skip, Execute, Skip, Execute, Reject],
    /* ConnectedGotIp   */ [Skip, Execute, Skip, Execute, Reject],
    /* Disconnecting    */ [Skip, Execute, Reject, Skip, Reject],
    /* WaitingReconnect */ [Skip, Execute, Execute, Execute, Reject],
    /* ErrorCredentials */ [Skip, Execute, Execute, Execute, Reject],
    /* Stopping         */ [Reject, Skip, Reject, Reject, Reject],
];

const fn stay(state: State) -> EventOutcome {
    EventOutcome { next: state, notify: 0 }
}

const fn go(next: State, notify: u32) -> EventOutcome {
    EventOutcome { next, notify }
}

const EVENT_MATRIX: [[EventOutcome; EVENT_COUNT]; STATE_COUNT] = [
    // [StaStart, StaStop, StaConnected, StaDisconnected, GotIp, LostIp]
    /* Uninitialized    */
    [
        stay(State::Uninitialized),
        stay(State::Uninitialized),
        stay(State::Uninitialized),
        stay(State::Uninitialized),
        stay(State::Uninitialized),
        stay(State::Uninitialized),
    ],
    /* Initializing     */
    [
        stay(State::Initializing),
        stay(State::Initializing),
        stay(State::Initializing),
        stay(State::Initializing),
        stay(State::Initializing),
        stay(State::Initializing),
    ],
    /* Initialized      */
    [
        stay(State::Initialized),
        stay(State::Initialized),
        stay(State::Initialized),
        stay(State::Initialized),
        stay(State::Initialized),
        stay(State::Initialized),
    ],
    /* Starting         */
    [
        go(State::Started, STARTED_BIT),
        stay(State::Starting),
        stay(State::Starting),
        // The driver failed to come up.
        go(State::Initialized, START_FAILED_BIT),
        stay(State::Starting),
        stay(State::Starting),
    ],
    /* Started          */
    [
        stay(State::Started),
        stay(State::Started),
        stay(State::Started),
        stay(State::Started),
        stay(State::Started),
        stay(State::Started),
    ],
    /* Connecting       */
    [
        stay(State::Connecting),
        stay(State::Connecting),
        go(State::ConnectedNoIp, 0),
        // Bits released by the disconnect classification, not the table.
        go(State::WaitingReconnect, 0),
        // Early IP acquisition: the driver can report both in one step.
        go(State::ConnectedGotIp, CONNECTED_BIT),
        stay(State::Connecting),
    ],
    /* ConnectedNoIp    */
    [
        stay(State::ConnectedNoIp),
        stay(State::ConnectedNoIp),
        stay(State::ConnectedNoIp),
        go(State::WaitingReconnect, 0),
        go(State::ConnectedGotIp, CONNECTED_BIT),
        stay(State::ConnectedNoIp),
    ],
    /* ConnectedGotIp   */
    [
        stay(State::ConnectedGotIp),
        stay(State::ConnectedGotIp),
        stay(State::ConnectedGotIp),
        go(State::WaitingReconnect, 0),
        stay(State::ConnectedGotIp),
        go(State::ConnectedNoIp, 0),
    ],
    /* Disconnecting    */
    [
        stay(State::Disconnecting),
        stay(State::Disconnecting),
        stay(State::Disconnecting),
        go(State::DISCONNECTED, DISCONNECTED_BIT),
        stay(State::Disconnecting),
        stay(State::Disconnecting),
    ],
    /* WaitingReconnect */
    [
        stay(State::WaitingReconnect),
        stay(State::WaitingReconnect),
        stay(State::WaitingReconnect),
        stay(State::WaitingReconnect),
        stay(State::WaitingReconnect),
        stay(State::WaitingReconnect),
    ],
    /* ErrorCredentials */
    [
        stay(State::ErrorCredentials),
        stay(State::ErrorCredentials),
        stay(State::ErrorCredentials),
        stay(State::ErrorCredentials),
        stay(State::ErrorCredentials),
        stay(State::ErrorCredentials),
    ],
    /* Stopping         */
    [
        stay(State::Stopping),
        go(State::STOPPED, STOPPED_BIT),
        stay(State::Stopping),
        stay(State::Stopping),
        stay(State::Stopping),
        stay(State::Stopping),
    ],
];

// ---------------------------------------------------------------------------
// Reconnection policy constants
// ---------------------------------------------------------------------------

// RSSI quality bands (dBm): a wrong-password disconnect is indistinguishable
// from a bad-signal disconnect for several reason codes, so the retry limit
// scales with signal strength.
pub const RSSI_THRESHOLD_GOOD: i8 = -55;
pub const RSSI_THRESHOLD_MEDIUM: i8 = -67;
pub const RSSI_THRESHOLD_WEAK: i8 = -80;

pub const RETRY_LIMIT_GOOD: u32 = 1;
pub const RETRY_LIMIT_MEDIUM: u32 = 2;
pub const RETRY_LIMIT_WEAK: u32 = 5;

pub const MAX_BACKOFF_EXPONENT: u32 = 8;
pub const MAX_BACKOFF_MS: u32 = 300_000;

/// Human-readable signal band for log lines.
pub fn rssi_band(rssi: i8) -> &'static str {
    if rssi >= RSSI_THRESHOLD_GOOD {
        "GOOD"
    } else if rssi >= RSSI_THRESHOLD_MEDIUM {
        "MEDIUM"
    } else if rssi >= RSSI_THRESHOLD_WEAK {
        "WEAK"
    } else {
        "CRITICAL"
    }
}

/// Consecutive-suspect-failure limit for the given signal level.
/// `None` below the critical threshold: a signal-starved link must never
/// invalidate credentials.
fn suspect_limit(rssi: i8) -> Option<u32> {
    if rssi >= RSSI_THRESHOLD_GOOD {
        Some(RETRY_LIMIT_GOOD)
    } else if rssi >= RSSI_THRESHOLD_MEDIUM {
        Some(RETRY_LIMIT_MEDIUM)
    } else if rssi >= RSSI_THRESHOLD_WEAK {
        Some(RETRY_LIMIT_WEAK)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// The connection-lifecycle state machine plus reconnection bookkeeping.
///
/// Owned exclusively by the worker task (behind the state mutex); all
/// methods are pure computation over the fields.
#[derive(Debug)]
pub struct StateMachine {
    current: State,
    /// Consecutive recoverable disconnects since the last success.
    retry_count: u32,
    /// Consecutive disconnects whose reason ambiguously suggests a
    /// credential error.
    suspect_retry_count: u32,
    /// Monotonic deadline for the next attempt while waiting to reconnect.
    next_reconnect_ms: u64,
}

impl StateMachine {
    pub const fn new() -> Self {
        Self {
            current: State::Uninitialized,
            retry_count: 0,
            suspect_retry_count: 0,
            next_reconnect_ms: 0,
        }
    }

    pub fn state(&self) -> State {
        self.current
    }

    pub fn transition_to(&mut self, next: State) {
        self.current = next;
    }

    /// Whether `cmd` may run in the current state.
    pub fn validate(&self, cmd: CommandId) -> Action {
        COMMAND_MATRIX[self.current as usize][cmd as usize]
    }

    /// Next state and sync bits for `event` in the current state.
    pub fn resolve(&self, event: EventId) -> EventOutcome {
        EVENT_MATRIX[self.current as usize][event as usize]
    }

    pub fn is_active(&self) -> bool {
        self.current.is_active()
    }

    pub fn is_connected(&self) -> bool {
        self.current.is_connected()
    }

    pub fn is_sta_ready(&self) -> bool {
        self.current.is_sta_ready()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn suspect_retry_count(&self) -> u32 {
        self.suspect_retry_count
    }

    pub fn next_reconnect_ms(&self) -> u64 {
        self.next_reconnect_ms
    }

    /// Zero both counters.  Called on success and on any explicit user
    /// command.
    pub fn reset_retries(&mut self) {
        self.retry_count = 0;
        self.suspect_retry_count = 0;
    }

    /// Record a disconnect whose reason is compatible with both a credential
    /// error and a transient link problem.
    ///
    /// Returns `true` — and moves to `ErrorCredentials` — once the count
    /// reaches the signal-quality-tiered limit.  Strong signal means the
    /// failure is almost certainly the password; at critical signal levels
    /// the limit never triggers.
    pub fn handle_suspect_failure(&mut self, rssi: i8) -> bool {
        self.suspect_retry_count += 1;
        if let Some(limit) = suspect_limit(rssi) {
            if self.suspect_retry_count >= limit {
                self.current = State::ErrorCredentials;
                return true;
            }
        }
        false
    }

    /// Schedule the next reconnect attempt and move to `WaitingReconnect`.
    ///
    /// Delays double from 1 s per consecutive retry, capped at 5 minutes.
    /// Returns the computed delay in milliseconds.
    pub fn calculate_next_backoff(&mut self, now_ms: u64) -> u32 {
        self.retry_count += 1;

        let exponent = (self.retry_count - 1).min(MAX_BACKOFF_EXPONENT);
        let delay_ms = (1_u32 << exponent).saturating_mul(1000).min(MAX_BACKOFF_MS);

        self.next_reconnect_ms = now_ms + u64::from(delay_ms);
        self.current = State::WaitingReconnect;
        delay_ms
    }

    /// How long the worker may sleep on the queue.
    ///
    /// `None` means wait forever; while waiting to reconnect it is the time
    /// remaining until the backoff deadline (zero when already past).
    pub fn wait_duration(&self, now_ms: u64) -> Option<Duration> {
        if self.current != State::WaitingReconnect {
            return None;
        }
        Some(Duration::from_millis(
            self.next_reconnect_ms.saturating_sub(now_ms),
        ))
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_event() -> impl Strategy<Value = EventId> {
        prop::sample::select(EventId::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn events_never_leave_the_defined_state_set(
            events in proptest::collection::vec(arb_event(), 1..200)
        ) {
            let mut fsm = StateMachine::new();
            fsm.transition_to(State::Initialized);
            for event in events {
                let out = fsm.resolve(event);
                prop_assert!(State::ALL.contains(&out.next));
                fsm.transition_to(out.next);
            }
        }

        #[test]
        fn backoff_is_monotonic_until_cap(retries in 1u32..40) {
            let mut fsm = StateMachine::new();
            let mut prev = 0;
            for _ in 0..retries {
                let delay = fsm.calculate_next_backoff(0);
                prop_assert!(delay >= prev);
                prop_assert!(delay <= MAX_BACKOFF_MS);
                prev = delay;
            }
        }

        #[test]
        fn suspect_limit_is_monotonic_in_signal_strength(rssi in -100i8..0) {
            // A weaker signal must never have a lower limit than a stronger one.
            let weaker = suspect_limit(rssi.saturating_sub(1));
            let here = suspect_limit(rssi);
            match (here, weaker) {
                (Some(h), Some(w)) => prop_assert!(w >= h),
                (Some(_), None) => {}
                (None, Some(_)) => prop_assert!(false, "limit reappeared at weaker signal"),
                (None, None) => {}
            }
        }
    }
}
