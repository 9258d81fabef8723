//! Station-mode WiFi connection manager.
//!
//! Mediates between the low-level radio driver (asynchronous events,
//! synchronous control calls) and application code that wants a simple,
//! thread-safe, idempotent API with blocking and non-blocking variants.
//! Adds signal-quality-aware automatic reconnection with exponential
//! backoff, and persists credential validity across reboots.
//!
//! ```text
//!  caller threads                 worker task                 driver
//! ┌──────────────┐   command    ┌─────────────┐   control   ┌────────┐
//! │ start/stop/  │──────────┐   │  drain one  │────────────▶│ radio  │
//! │ connect/     │          ▼   │  queue,     │             │ stack  │
//! │ disconnect   │   ┌──────────┤  apply FSM, │   events    └───┬────┘
//! │ (sync/async) │   │ Message  │  call driver│◀────────────────┘
//! └──────┬───────┘   │ Queue    │             │   (translator,
//!        │           └──────────┤             │    zero-wait)
//!        │  wait on SyncFlags   └──────┬──────┘
//!        └──────────◀── release bits ──┘
//! ```
//!
//! All ESP-IDF-specific code is guarded by `#[cfg(target_os = "espidf")]`
//! inside the adapters; every other target gets simulation backends so the
//! whole stack is testable on the host.

#![deny(unused_must_use)]

pub mod config;
pub mod error;
pub mod events;
pub mod fsm;
pub mod manager;
pub mod ports;
pub mod store;
pub mod sync;

pub mod adapters;

pub use error::{Error, Result};
pub use fsm::{CommandId, EventId, State};
pub use manager::WifiManager;
pub use ports::{Credentials, DriverPort, KvStore};
