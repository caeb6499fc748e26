//! BLE remote control client for the THMIC64 C64 emulator board
//!
//! The protocol engine lives in [`infrastructure::bluetooth`]; start with
//! [`RemoteService`].

pub mod domain;
pub mod infrastructure;

pub use infrastructure::bluetooth::RemoteService;
