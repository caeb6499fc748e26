use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle of the single paired peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LinkState {
    Disconnected,
    Scanning,
    Connecting,
    ServicesDiscovering,
    Ready,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::ServicesDiscovering => "discovering services",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Type tag of an inbound notification (byte 0 of the frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NotificationKind {
    Settings,
    Registers,
    Memory,
    TransferAck,
    Battery,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 5] = [
        Self::Settings,
        Self::Registers,
        Self::Memory,
        Self::TransferAck,
        Self::Battery,
    ];

    pub fn type_byte(self) -> u8 {
        match self {
            Self::Settings => 1,
            Self::Registers => 2,
            Self::Memory => 3,
            Self::TransferAck => 4,
            Self::Battery => 5,
        }
    }

    pub fn from_type_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Settings),
            2 => Some(Self::Registers),
            3 => Some(Self::Memory),
            4 => Some(Self::TransferAck),
            5 => Some(Self::Battery),
            _ => None,
        }
    }

    /// Minimum frame length, type byte included
    pub fn min_len(self) -> usize {
        match self {
            Self::Settings => 7,
            Self::Registers => 20,
            Self::Memory => 1 + MEMORY_DUMP_LEN,
            Self::TransferAck => 1,
            Self::Battery => 3,
        }
    }
}

/// Number of bytes carried by a memory dump notification
pub const MEMORY_DUMP_LEN: usize = 16;

/// Emulator switches echoed back after GETSTATUS and every toggle command
///
/// The first six fields are present in every firmware version. `volume` and
/// `d64_attached` were added later and are `None` when the peripheral does
/// not send them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsSnapshot {
    pub joystick_mode: u8,
    pub deactivate_temp: bool,
    pub send_raw_key_codes: bool,
    pub debug: bool,
    pub perf: bool,
    pub detect_release_key: bool,
    pub volume: Option<u8>,
    pub d64_attached: Option<bool>,
}

/// Shadow copies of the VIC, CPU port and CIA registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoRegisters {
    pub d011: u8,
    pub d016: u8,
    pub d018: u8,
    pub d019: u8,
    pub d01a: u8,
    /// CPU port at $01
    pub register1: u8,
    pub dc0d: u8,
    pub dc0e: u8,
    pub dc0f: u8,
    pub dd0d: u8,
    pub dd0e: u8,
    pub dd0f: u8,
}

/// CPU state reported in answer to SHOWREG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuSnapshot {
    pub cpu_running: bool,
    pub pc: u16,
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sr: u8,
    pub io: IoRegisters,
}

/// Sixteen bytes read from the address given in the preceding SHOWMEM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryDump {
    pub bytes: [u8; MEMORY_DUMP_LEN],
}

impl fmt::Display for MemoryDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatteryVoltage {
    pub millivolts: u16,
}

/// A fully decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Notification {
    Settings(SettingsSnapshot),
    Registers(CpuSnapshot),
    Memory(MemoryDump),
    TransferAck,
    Battery(BatteryVoltage),
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::Settings(_) => NotificationKind::Settings,
            Self::Registers(_) => NotificationKind::Registers,
            Self::Memory(_) => NotificationKind::Memory,
            Self::TransferAck => NotificationKind::TransferAck,
            Self::Battery(_) => NotificationKind::Battery,
        }
    }
}

/// What a bulk transfer does when the peripheral does not acknowledge a block in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckTimeoutPolicy {
    /// Log a warning and send the next block
    #[default]
    Continue,
    /// Send the same block once more, then continue
    RetryOnce,
    /// Stop the transfer with an error
    Abort,
}

/// Upload progress, published after every block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub blocks_completed: usize,
    pub total_blocks: usize,
}

impl TransferProgress {
    pub fn new(total_blocks: usize) -> Self {
        Self {
            blocks_completed: 0,
            total_blocks,
        }
    }

    pub fn percent(&self) -> u8 {
        if self.total_blocks == 0 {
            return 100;
        }
        (100 * self.blocks_completed / self.total_blocks) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.blocks_completed == self.total_blocks
    }
}

/// Summary of a finished upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub total_blocks: usize,
    pub bytes: usize,
    /// Blocks the peripheral never acknowledged
    pub missed_acks: usize,
}
