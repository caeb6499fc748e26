//! Bulk Transfer Session
//!
//! Uploads a buffer in 250-byte blocks. Every block is a blocking write
//! followed by a wait for the peripheral's transfer acknowledgement.
//!
//! ```text
//! NotStarted -> Sending(0) -> WaitingAck(0) -> Sending(1) -> ... -> Completed
//!                    \               \
//!                     +---------------+--> Cancelled | TimedOut | LinkLost | Failed
//! ```

use crate::domain::models::{AckTimeoutPolicy, Notification, TransferProgress, TransferReport};
use crate::infrastructure::bluetooth::error::TransferError;
use crate::infrastructure::bluetooth::link::{wait_until_not_ready, LinkHandle, LinkStatus};
use crate::infrastructure::bluetooth::protocol::{block_count, encode_block, Frame};
use crate::infrastructure::bluetooth::transport::BleTransport;
use crate::infrastructure::bluetooth::write_gate::WriteGate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest upload the peripheral has room for
pub const MAX_TRANSFER_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub ack_timeout: Duration,
    pub ack_timeout_policy: AckTimeoutPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(3000),
            ack_timeout_policy: AckTimeoutPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    NotStarted,
    Sending(usize),
    WaitingAck(usize),
    Completed,
    Cancelled,
    TimedOut,
    LinkLost,
    Failed,
}

impl TransferState {
    fn from_outcome(outcome: &Result<TransferReport, TransferError>) -> Self {
        match outcome {
            Ok(_) => Self::Completed,
            Err(TransferError::Cancelled) => Self::Cancelled,
            Err(TransferError::AckTimeout { .. }) => Self::TimedOut,
            Err(TransferError::LinkLost) => Self::LinkLost,
            Err(_) => Self::Failed,
        }
    }
}

pub struct BulkTransferSession<T> {
    buffer: Vec<u8>,
    total_blocks: usize,
    state: watch::Sender<TransferState>,
    missed_acks: usize,
    gate: Arc<WriteGate<T>>,
    link: LinkHandle,
    acks: mpsc::UnboundedReceiver<Notification>,
    config: TransferConfig,
    cancelled: Arc<AtomicBool>,
    progress: watch::Sender<TransferProgress>,
}

impl<T: BleTransport> BulkTransferSession<T> {
    /// Prepare an upload of `buffer`
    ///
    /// `acks` must be the transfer-ack subscription; the session owns it for
    /// its whole lifetime.
    pub fn new(
        buffer: Vec<u8>,
        gate: Arc<WriteGate<T>>,
        link: LinkHandle,
        acks: mpsc::UnboundedReceiver<Notification>,
        config: TransferConfig,
    ) -> Result<Self, TransferError> {
        if buffer.is_empty() {
            return Err(TransferError::EmptyBuffer);
        }
        if buffer.len() > MAX_TRANSFER_LEN {
            return Err(TransferError::TooLarge {
                len: buffer.len(),
                max: MAX_TRANSFER_LEN,
            });
        }
        if !link.is_ready() {
            return Err(TransferError::NotReady);
        }

        let total_blocks = block_count(buffer.len());
        let (progress, _) = watch::channel(TransferProgress::new(total_blocks));
        let (state, _) = watch::channel(TransferState::NotStarted);
        Ok(Self {
            buffer,
            total_blocks,
            state,
            missed_acks: 0,
            gate,
            link,
            acks,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
            progress,
        })
    }

    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    fn set_state(&self, state: TransferState) {
        self.state.send_replace(state);
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Run on a new task
    pub fn spawn(self) -> TransferHandle {
        self.spawn_holding(())
    }

    /// Run on a new task, dropping `guard` when the session ends
    pub(crate) fn spawn_holding<G: Send + 'static>(self, guard: G) -> TransferHandle {
        let cancelled = self.cancelled.clone();
        let progress = self.progress.subscribe();
        let state = self.state.subscribe();
        let total_blocks = self.total_blocks;
        let task = tokio::spawn(async move {
            let _guard = guard;
            self.run().await
        });

        TransferHandle {
            task,
            cancelled,
            progress,
            state,
            total_blocks,
        }
    }

    pub async fn run(mut self) -> Result<TransferReport, TransferError> {
        info!(
            "Starting transfer of {} bytes in {} blocks",
            self.buffer.len(),
            self.total_blocks
        );
        let mut status = self.link.watch();
        let outcome = self.send_blocks(&mut status).await;
        self.set_state(TransferState::from_outcome(&outcome));

        match &outcome {
            Ok(report) if report.missed_acks > 0 => warn!(
                "Transfer finished, {} of {} blocks unacknowledged",
                report.missed_acks, report.total_blocks
            ),
            Ok(_) => info!("Transfer completed"),
            Err(e) => warn!("Transfer ended in state {:?}: {}", self.state(), e),
        }
        outcome
    }

    async fn send_blocks(
        &mut self,
        status: &mut watch::Receiver<LinkStatus>,
    ) -> Result<TransferReport, TransferError> {
        for index in 0..self.total_blocks {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(TransferError::Cancelled);
            }
            if !self.link.is_ready() {
                return Err(TransferError::LinkLost);
            }
            let frame = encode_block(&self.buffer, index)
                .ok_or_else(|| TransferError::Worker(format!("block {} out of range", index)))?;

            let mut resends_left = match self.config.ack_timeout_policy {
                AckTimeoutPolicy::RetryOnce => 1,
                _ => 0,
            };
            loop {
                self.drain_stale_acks()?;
                self.set_state(TransferState::Sending(index));
                self.send_block(frame.clone(), status).await?;

                self.set_state(TransferState::WaitingAck(index));
                if self.wait_for_ack(status).await? {
                    break;
                }

                match self.config.ack_timeout_policy {
                    AckTimeoutPolicy::Abort => {
                        return Err(TransferError::AckTimeout { block: index });
                    }
                    _ if resends_left > 0 => {
                        resends_left -= 1;
                        warn!("No ack for block {}, sending it again", index);
                    }
                    _ => {
                        warn!("No ack for block {}, continuing", index);
                        self.missed_acks += 1;
                        break;
                    }
                }
            }

            self.progress.send_replace(TransferProgress {
                blocks_completed: index + 1,
                total_blocks: self.total_blocks,
            });
        }

        Ok(TransferReport {
            total_blocks: self.total_blocks,
            bytes: self.buffer.len(),
            missed_acks: self.missed_acks,
        })
    }

    fn drain_stale_acks(&mut self) -> Result<(), TransferError> {
        loop {
            match self.acks.try_recv() {
                Ok(_) => debug!("Discarded stale transfer ack"),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(TransferError::AckSubscriptionLost),
            }
        }
    }

    async fn send_block(
        &self,
        frame: Frame,
        status: &mut watch::Receiver<LinkStatus>,
    ) -> Result<(), TransferError> {
        tokio::select! {
            result = self.gate.send(frame, true) => result.map_err(TransferError::from),
            _ = wait_until_not_ready(status) => Err(TransferError::LinkLost),
        }
    }

    /// `Ok(false)` when the ack timeout expired
    async fn wait_for_ack(
        &mut self,
        status: &mut watch::Receiver<LinkStatus>,
    ) -> Result<bool, TransferError> {
        let ack = tokio::time::timeout(self.config.ack_timeout, self.acks.recv());
        tokio::select! {
            biased;
            _ = wait_until_not_ready(status) => Err(TransferError::LinkLost),
            result = ack => match result {
                Ok(Some(_)) => Ok(true),
                Ok(None) => Err(TransferError::AckSubscriptionLost),
                Err(_) => Ok(false),
            },
        }
    }
}

/// Caller-side view of a running transfer
pub struct TransferHandle {
    task: JoinHandle<Result<TransferReport, TransferError>>,
    cancelled: Arc<AtomicBool>,
    progress: watch::Receiver<TransferProgress>,
    state: watch::Receiver<TransferState>,
    total_blocks: usize,
}

impl TransferHandle {
    /// Stop before the next block is sent
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.clone()
    }

    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    /// Session state, ending in `Completed`, `Cancelled`, `TimedOut`,
    /// `LinkLost` or `Failed`
    pub fn watch_state(&self) -> watch::Receiver<TransferState> {
        self.state.clone()
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<TransferReport, TransferError> {
        self.task
            .await
            .map_err(|e| TransferError::Worker(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::error::LinkError;
    use crate::infrastructure::bluetooth::testing::{ready_link, MockTransport};

    struct Rig {
        transport: Arc<MockTransport>,
        link: LinkHandle,
        gate: Arc<WriteGate<MockTransport>>,
    }

    fn rig() -> Rig {
        let (transport, _events) = MockTransport::new();
        let link = ready_link();
        let gate = Arc::new(WriteGate::new(
            transport.clone(),
            link.clone(),
            Duration::from_secs(5),
        ));
        Rig {
            transport,
            link,
            gate,
        }
    }

    fn session(
        rig: &Rig,
        len: usize,
        config: TransferConfig,
    ) -> (
        BulkTransferSession<MockTransport>,
        mpsc::UnboundedSender<Notification>,
    ) {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let buffer = (0..len).map(|i| i as u8).collect();
        let session =
            BulkTransferSession::new(buffer, rig.gate.clone(), rig.link.clone(), ack_rx, config)
                .unwrap();
        (session, ack_tx)
    }

    /// Acknowledge every block once it has been written
    fn ack_each_block(rig: &Rig, blocks: usize, ack_tx: mpsc::UnboundedSender<Notification>) {
        let transport = rig.transport.clone();
        tokio::spawn(async move {
            for n in 1..=blocks {
                transport.wait_for_writes(n).await;
                let _ = ack_tx.send(Notification::TransferAck);
            }
        });
    }

    #[tokio::test]
    async fn test_thousand_bytes_in_four_blocks() {
        let rig = rig();
        let (session, ack_tx) = session(&rig, 1000, TransferConfig::default());
        assert_eq!(session.total_blocks(), 4);
        ack_each_block(&rig, 4, ack_tx);

        let handle = session.spawn();
        let progress = handle.progress();
        let state = handle.watch_state();
        let report = handle.wait().await.unwrap();
        assert_eq!(*state.borrow(), TransferState::Completed);

        assert_eq!(
            report,
            TransferReport {
                total_blocks: 4,
                bytes: 1000,
                missed_acks: 0
            }
        );
        let written = rig.transport.written();
        assert_eq!(written.len(), 4);
        assert_eq!(&written[0][..3], &[12, 1, 0x80]);
        assert_eq!(&written[1][..3], &[12, 0, 0x80]);
        assert_eq!(&written[3][..4], &[12, 2, 0x80, 250]);
        assert!(written.iter().all(|frame| frame.len() == 254));
        assert!(progress.borrow().is_complete());
    }

    #[tokio::test]
    async fn test_short_last_block() {
        let rig = rig();
        let (session, ack_tx) = session(&rig, 900, TransferConfig::default());
        ack_each_block(&rig, 4, ack_tx);

        session.spawn().wait().await.unwrap();

        let written = rig.transport.written();
        assert_eq!(written.len(), 4);
        assert_eq!(&written[3][..4], &[12, 2, 0x80, 150]);
        // payload continues where block 2 stopped
        assert_eq!(written[3][4], (750 % 256) as u8);
    }

    #[tokio::test]
    async fn test_cancel_after_second_block() {
        let rig = rig();
        let (session, ack_tx) = session(&rig, 1250, TransferConfig::default());
        assert_eq!(session.total_blocks(), 5);

        let handle = session.spawn();
        let state = handle.watch_state();
        let cancel = handle.cancelled.clone();
        let transport = rig.transport.clone();
        tokio::spawn(async move {
            transport.wait_for_writes(1).await;
            let _ = ack_tx.send(Notification::TransferAck);
            transport.wait_for_writes(2).await;
            cancel.store(true, Ordering::SeqCst);
            let _ = ack_tx.send(Notification::TransferAck);
        });

        assert_eq!(handle.wait().await, Err(TransferError::Cancelled));
        assert_eq!(rig.transport.written().len(), 2);
        assert_eq!(*state.borrow(), TransferState::Cancelled);
    }

    #[tokio::test]
    async fn test_link_loss_while_waiting_for_ack() {
        let rig = rig();
        let config = TransferConfig {
            ack_timeout: Duration::from_secs(30),
            ack_timeout_policy: AckTimeoutPolicy::Abort,
        };
        let (session, _ack_tx) = session(&rig, 600, config);
        assert_eq!(session.state(), TransferState::NotStarted);
        let handle = session.spawn();

        let mut state = handle.watch_state();
        state
            .wait_for(|s| *s == TransferState::WaitingAck(0))
            .await
            .unwrap();
        rig.link.fail(LinkError::LinkLost);

        assert_eq!(handle.wait().await, Err(TransferError::LinkLost));
        assert_eq!(*state.borrow(), TransferState::LinkLost);
        assert_eq!(rig.transport.written().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_continues_by_default() {
        let rig = rig();
        let (session, _ack_tx) = session(&rig, 10, TransferConfig::default());

        let report = session.spawn().wait().await.unwrap();
        assert_eq!(report.missed_acks, 1);
        assert_eq!(rig.transport.written().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_retries_once() {
        let rig = rig();
        let config = TransferConfig {
            ack_timeout_policy: AckTimeoutPolicy::RetryOnce,
            ..TransferConfig::default()
        };
        let (session, _ack_tx) = session(&rig, 10, config);

        let report = session.spawn().wait().await.unwrap();
        assert_eq!(report.missed_acks, 1);
        let written = rig.transport.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0], written[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_aborts() {
        let rig = rig();
        let config = TransferConfig {
            ack_timeout_policy: AckTimeoutPolicy::Abort,
            ..TransferConfig::default()
        };
        let (session, _ack_tx) = session(&rig, 300, config);

        let handle = session.spawn();
        let state = handle.watch_state();
        let result = handle.wait().await;
        assert_eq!(result, Err(TransferError::AckTimeout { block: 0 }));
        assert_eq!(rig.transport.written().len(), 1);
        assert_eq!(*state.borrow(), TransferState::TimedOut);
    }

    #[tokio::test]
    async fn test_stale_acks_are_drained() {
        let rig = rig();
        let config = TransferConfig {
            ack_timeout: Duration::from_millis(50),
            ack_timeout_policy: AckTimeoutPolicy::Abort,
        };
        let (session, ack_tx) = session(&rig, 10, config);
        // Left over from an earlier upload
        ack_tx.send(Notification::TransferAck).unwrap();

        let result = session.spawn().wait().await;
        assert_eq!(result, Err(TransferError::AckTimeout { block: 0 }));
    }

    #[tokio::test]
    async fn test_rejects_bad_buffers() {
        let rig = rig();
        let (_tx, rx) = mpsc::unbounded_channel();
        let result = BulkTransferSession::new(
            Vec::new(),
            rig.gate.clone(),
            rig.link.clone(),
            rx,
            TransferConfig::default(),
        );
        assert!(matches!(result, Err(TransferError::EmptyBuffer)));

        let (_tx, rx) = mpsc::unbounded_channel();
        let result = BulkTransferSession::new(
            vec![0; MAX_TRANSFER_LEN + 1],
            rig.gate.clone(),
            rig.link.clone(),
            rx,
            TransferConfig::default(),
        );
        assert!(matches!(result, Err(TransferError::TooLarge { .. })));

        rig.link.fail(LinkError::LinkLost);
        let (_tx, rx) = mpsc::unbounded_channel();
        let result = BulkTransferSession::new(
            vec![1; 10],
            rig.gate.clone(),
            rig.link.clone(),
            rx,
            TransferConfig::default(),
        );
        assert!(matches!(result, Err(TransferError::NotReady)));
    }
}
