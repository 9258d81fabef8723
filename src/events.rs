//! Driver-event translation.
//!
//! The driver delivers events on its own context, which must be treated as
//! interrupt-like: the translator only performs a bounded zero-wait enqueue
//! — no allocation, no blocking, and never the state mutex.  Unhandled
//! events are dropped silently; a full queue drops the event with an error
//! log.

use std::sync::Arc;

use log::error;

use crate::fsm::{CommandId, EventId};
use crate::sync::MessageQueue;

// ───────────────────────────────────────────────────────────────
// Queue element
// ───────────────────────────────────────────────────────────────

/// Element of the worker's single queue: an action requested by the API or
/// a signal reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Command(CommandId),
    Event {
        id: EventId,
        /// Disconnect reason code; meaningful only for `StaDisconnected`.
        reason: u8,
        /// Signal level at the time of disconnection; 0 when unknown.
        rssi: i8,
    },
}

impl Message {
    /// An event message without disconnect metadata.
    pub fn event(id: EventId) -> Self {
        Self::Event {
            id,
            reason: 0,
            rssi: 0,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Disconnect reason codes
// ───────────────────────────────────────────────────────────────

// Numeric identities match the 802.11 / ESP-IDF reason codes so the raw
// driver payload maps without translation tables.
pub const REASON_ASSOC_LEAVE: u8 = 8;
pub const REASON_4WAY_HANDSHAKE_TIMEOUT: u8 = 15;
pub const REASON_802_1X_AUTH_FAILED: u8 = 23;
pub const REASON_BEACON_TIMEOUT: u8 = 200;
pub const REASON_NO_AP_FOUND: u8 = 201;
pub const REASON_AUTH_FAIL: u8 = 202;
pub const REASON_HANDSHAKE_TIMEOUT: u8 = 204;
pub const REASON_CONNECTION_FAIL: u8 = 205;

/// Disconnect reasons the manager recognizes by identity; everything else
/// is carried as `Other` and treated as recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    AssocLeave,
    FourWayHandshakeTimeout,
    Dot1xAuthFailed,
    BeaconTimeout,
    NoApFound,
    AuthFail,
    HandshakeTimeout,
    ConnectionFail,
    Other(u8),
}

/// How a disconnect reason is handled by the reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonClass {
    /// The peer (or our own API) ended the association; no retry.
    PeerLeave,
    /// Compatible with both a credential error and a transient link
    /// problem; counted against the signal-tiered limit.
    SuspectCredentials,
    /// Signal loss, congestion, or unspecified; retried with backoff.
    Recoverable,
}

impl DisconnectReason {
    pub fn from_code(code: u8) -> Self {
        match code {
            REASON_ASSOC_LEAVE => Self::AssocLeave,
            REASON_4WAY_HANDSHAKE_TIMEOUT => Self::FourWayHandshakeTimeout,
            REASON_802_1X_AUTH_FAILED => Self::Dot1xAuthFailed,
            REASON_BEACON_TIMEOUT => Self::BeaconTimeout,
            REASON_NO_AP_FOUND => Self::NoApFound,
            REASON_AUTH_FAIL => Self::AuthFail,
            REASON_HANDSHAKE_TIMEOUT => Self::HandshakeTimeout,
            REASON_CONNECTION_FAIL => Self::ConnectionFail,
            other => Self::Other(other),
        }
    }

    pub fn class(self) -> ReasonClass {
        match self {
            Self::AssocLeave => ReasonClass::PeerLeave,
            Self::AuthFail
            | Self::Dot1xAuthFailed
            | Self::FourWayHandshakeTimeout
            | Self::HandshakeTimeout
            | Self::ConnectionFail => ReasonClass::SuspectCredentials,
            Self::BeaconTimeout | Self::NoApFound | Self::Other(_) => ReasonClass::Recoverable,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Translator handle
// ───────────────────────────────────────────────────────────────

/// Cloneable handle the driver adapters use to push translated events into
/// the worker's queue.
#[derive(Clone)]
pub struct EventSender {
    queue: Arc<MessageQueue>,
}

impl EventSender {
    pub(crate) fn new(queue: Arc<MessageQueue>) -> Self {
        Self { queue }
    }

    /// Zero-wait enqueue; drops the event when the queue is full.
    pub fn notify(&self, id: EventId, reason: u8, rssi: i8) {
        if !self.queue.try_post(Message::Event { id, reason, rssi }) {
            error!("EventSender: queue full, dropping {id:?}");
        }
    }

    /// [`notify`](Self::notify) without disconnect metadata.
    pub fn notify_event(&self, id: EventId) {
        self.notify(id, 0, 0);
    }
}
