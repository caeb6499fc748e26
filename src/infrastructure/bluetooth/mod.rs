//! Bluetooth Module
//!
//! BLE command/notification engine for the THMIC64 peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      RemoteService                        │
//! │  (event loop, public API for the application)             │
//! └──────┬──────────────┬──────────────┬──────────────┬───────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//! ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌─────────────┐
//! │    Link    │ │ WriteGate  │ │   Router   │ │  Transfer   │
//! │            │ │            │ │            │ │             │
//! │ - states   │ │ - single   │ │ - one slot │ │ - 250 byte  │
//! │ - handle   │ │   flight   │ │   per type │ │   blocks    │
//! └────────────┘ └─────┬──────┘ └────────────┘ └─────────────┘
//!                      │
//!                      ▼
//!               ┌──────────────┐      ┌──────────┐
//!               │ BleTransport │      │ Protocol │
//!               │ (WinRT, mock)│      │ - frames │
//!               └──────────────┘      └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, command frames, block frames, notification parsing
//! - [`transport`] - The radio boundary and its events
//! - [`link`] - Connection state machine
//! - [`write_gate`] - Single-flight writes
//! - [`router`] - Notification subscribers
//! - [`transfer`] - Acknowledged bulk upload
//! - [`service`] - Main service coordinator

pub mod error;
pub mod link;
pub mod protocol;
pub mod router;
pub mod service;
pub mod transfer;
pub mod transport;
pub mod write_gate;

#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main service for convenience
pub use service::{RemoteConfig, RemoteService};
