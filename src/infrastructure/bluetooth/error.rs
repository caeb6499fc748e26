//! Error types of the protocol engine

use crate::domain::models::NotificationKind;
use thiserror::Error;

/// Failure reported by the BLE stack behind [`BleTransport`](super::transport::BleTransport)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("bluetooth is not available")]
    Unavailable,
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link is not ready")]
    NotReady,
    #[error("bluetooth is not available")]
    BluetoothUnavailable,
    #[error("could not find {device_name} device")]
    ScanTimeout { device_name: String },
    #[error("scan failed with error code {0}")]
    ScanFailed(i32),
    #[error("service not found")]
    ServiceNotFound,
    #[error("characteristic not found")]
    CharacteristicNotFound,
    #[error("service discovery failed with status {0}")]
    DiscoveryFailed(i32),
    #[error("link lost")]
    LinkLost,
    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for LinkError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Unavailable => Self::BluetoothUnavailable,
            other => Self::Transport(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("link is not ready")]
    NotReady,
    #[error("invalid frame length {len}")]
    InvalidFrame { len: usize },
    #[error("write failed: {0}")]
    Transport(TransportError),
    #[error("link lost during write")]
    LinkLost,
    #[error("write completion not reported in time")]
    CompletionTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("a transfer is already in progress")]
    AlreadyInProgress,
    #[error("no BLE connection")]
    NotReady,
    #[error("nothing to transfer")]
    EmptyBuffer,
    #[error("buffer of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("no acknowledgement for block {block}")]
    AckTimeout { block: usize },
    #[error("acknowledgement subscription was replaced")]
    AckSubscriptionLost,
    #[error("link lost during transfer")]
    LinkLost,
    #[error("block write failed: {0}")]
    Write(WriteError),
    #[error("transfer worker failed: {0}")]
    Worker(String),
}

impl From<WriteError> for TransferError {
    fn from(error: WriteError) -> Self {
        match error {
            WriteError::NotReady | WriteError::LinkLost => Self::LinkLost,
            other => Self::Write(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("{0}")]
    Write(#[from] WriteError),
    #[error("no {0:?} notification received in time")]
    Timeout(NotificationKind),
    #[error("subscription for {0:?} was replaced")]
    Replaced(NotificationKind),
    #[error("link lost while waiting for {0:?}")]
    LinkLost(NotificationKind),
}
