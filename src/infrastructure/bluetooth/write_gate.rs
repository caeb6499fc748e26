//! Single-flight characteristic writes
//!
//! The peripheral firmware only frames correctly when one physical write is
//! outstanding at a time. Blocking sends queue on a one-permit semaphore;
//! holding the permit is the `WriteInFlight` state.

use crate::infrastructure::bluetooth::error::WriteError;
use crate::infrastructure::bluetooth::link::{wait_until_not_ready, LinkHandle};
use crate::infrastructure::bluetooth::protocol::{Frame, MAX_FRAME_LEN};
use crate::infrastructure::bluetooth::transport::{BleTransport, CharacteristicHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{trace, warn};

pub struct WriteGate<T> {
    transport: Arc<T>,
    link: LinkHandle,
    permit: Semaphore,
    in_flight: AtomicBool,
    completion_timeout: Duration,
}

/// Marks the gate busy until dropped
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<T: BleTransport> WriteGate<T> {
    pub fn new(transport: Arc<T>, link: LinkHandle, completion_timeout: Duration) -> Self {
        Self {
            transport,
            link,
            permit: Semaphore::new(1),
            in_flight: AtomicBool::new(false),
            completion_timeout,
        }
    }

    /// `true` while no blocking write is outstanding
    pub fn is_idle(&self) -> bool {
        !self.in_flight.load(Ordering::SeqCst)
    }

    /// Write one frame to the characteristic
    ///
    /// With `blocking` the call waits for every earlier blocking write to
    /// finish before issuing its own. Without it the write is issued right
    /// away even if another one is in flight. Both variants return once the
    /// transport reports low-level completion.
    pub async fn send(&self, frame: Frame, blocking: bool) -> Result<(), WriteError> {
        if frame.is_empty() || frame.len() > MAX_FRAME_LEN {
            return Err(WriteError::InvalidFrame { len: frame.len() });
        }
        let handle = self
            .link
            .current_characteristic_handle()
            .ok_or(WriteError::NotReady)?;

        if !blocking {
            return self.issue(handle, frame).await;
        }

        let _permit = self
            .permit
            .acquire()
            .await
            .map_err(|_| WriteError::NotReady)?;

        // The link may have dropped while this caller was queued
        let handle = self
            .link
            .current_characteristic_handle()
            .ok_or(WriteError::NotReady)?;

        let _in_flight = InFlight::enter(&self.in_flight);
        self.issue(handle, frame).await
    }

    async fn issue(&self, handle: CharacteristicHandle, frame: Frame) -> Result<(), WriteError> {
        let mut status = self.link.watch();
        trace!("Writing {} bytes: {:02X?}", frame.len(), frame.as_bytes());

        let write = tokio::time::timeout(
            self.completion_timeout,
            self.transport.write(handle, frame.into_bytes()),
        );

        tokio::select! {
            result = write => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    warn!("Characteristic write failed: {}", e);
                    Err(WriteError::Transport(e))
                }
                Err(_) => {
                    warn!("Characteristic write not completed within {:?}", self.completion_timeout);
                    Err(WriteError::CompletionTimeout)
                }
            },
            _ = wait_until_not_ready(&mut status) => Err(WriteError::LinkLost),
        }
    }
}
