//! Link State Machine
//!
//! Tracks the connection lifecycle and the one characteristic handle that is
//! valid while the link is ready.
//!
//! ```text
//! Disconnected --scan--> Scanning --device found--> Connecting
//!     --link up--> ServicesDiscovering --characteristic found--> Ready
//!
//! any state --link lost--> Disconnected
//! ```

use crate::domain::models::LinkState;
use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::transport::CharacteristicHandle;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};

/// Inputs driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInput {
    Scan,
    DeviceFound,
    LinkUp,
    CharacteristicFound(CharacteristicHandle),
    LinkLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Moved { from: LinkState, to: LinkState },
    Ignored,
}

impl Transition {
    pub fn is_moved(&self) -> bool {
        matches!(self, Self::Moved { .. })
    }
}

#[derive(Debug)]
pub struct LinkStateMachine {
    state: LinkState,
    characteristic: Option<CharacteristicHandle>,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStateMachine {
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            characteristic: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    pub fn current_characteristic_handle(&self) -> Option<CharacteristicHandle> {
        self.characteristic
    }

    pub fn apply(&mut self, input: LinkInput) -> Transition {
        let from = self.state;
        let to = match (from, input) {
            (LinkState::Disconnected, LinkInput::Scan) => LinkState::Scanning,
            (LinkState::Scanning, LinkInput::DeviceFound) => LinkState::Connecting,
            (LinkState::Connecting, LinkInput::LinkUp) => LinkState::ServicesDiscovering,
            (LinkState::ServicesDiscovering, LinkInput::CharacteristicFound(handle)) => {
                self.characteristic = Some(handle);
                LinkState::Ready
            }
            (LinkState::Disconnected, LinkInput::LinkLost) => {
                self.characteristic = None;
                return Transition::Ignored;
            }
            (_, LinkInput::LinkLost) => LinkState::Disconnected,
            _ => return Transition::Ignored,
        };

        if to != LinkState::Ready {
            self.characteristic = None;
        }
        self.state = to;
        Transition::Moved { from, to }
    }
}

/// Published view of the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    /// Cause of the most recent drop to `Disconnected`, cleared by the next scan
    pub last_error: Option<LinkError>,
}

struct LinkShared {
    machine: Mutex<LinkStateMachine>,
    status: watch::Sender<LinkStatus>,
}

/// Shared owner of the link state
///
/// One handle is created per connection manager and cloned into the write
/// gate and transfer sessions.
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<LinkShared>,
}

impl Default for LinkHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkHandle {
    pub fn new() -> Self {
        let (status, _) = watch::channel(LinkStatus {
            state: LinkState::Disconnected,
            last_error: None,
        });
        Self {
            shared: Arc::new(LinkShared {
                machine: Mutex::new(LinkStateMachine::new()),
                status,
            }),
        }
    }

    fn machine(&self) -> MutexGuard<'_, LinkStateMachine> {
        self.shared
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LinkState {
        self.machine().state()
    }

    pub fn is_ready(&self) -> bool {
        self.machine().is_ready()
    }

    pub fn current_characteristic_handle(&self) -> Option<CharacteristicHandle> {
        self.machine().current_characteristic_handle()
    }

    pub fn status(&self) -> LinkStatus {
        self.shared.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status.subscribe()
    }

    pub fn apply(&self, input: LinkInput) -> Transition {
        self.transition(input, None)
    }

    /// Drop to `Disconnected` and record why
    pub fn fail(&self, error: LinkError) -> Transition {
        self.transition(LinkInput::LinkLost, Some(error))
    }

    fn transition(&self, input: LinkInput, error: Option<LinkError>) -> Transition {
        // Publish while holding the machine lock so watchers see transitions in order
        let mut machine = self.machine();
        let transition = machine.apply(input);

        match transition {
            Transition::Moved { from, to } => {
                info!("Link state: {} -> {}", from, to);
                self.shared.status.send_modify(|status| {
                    status.state = to;
                    if to == LinkState::Scanning {
                        status.last_error = None;
                    }
                    if error.is_some() {
                        status.last_error = error;
                    }
                });
            }
            Transition::Ignored => {
                debug!("Link input {:?} ignored in state {}", input, machine.state());
            }
        }

        transition
    }
}

/// Resolve once the link is no longer ready
pub async fn wait_until_not_ready(status: &mut watch::Receiver<LinkStatus>) {
    // A closed channel means the link owner is gone, which is as good as lost
    let _ = status.wait_for(|s| s.state != LinkState::Ready).await;
}
