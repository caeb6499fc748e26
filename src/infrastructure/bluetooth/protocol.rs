//! THMIC64 Protocol
//!
//! This module contains the wire format used on the single THMIC64
//! characteristic: outbound command frames, bulk-transfer block frames and
//! inbound notification decoding.

use crate::domain::models::{
    BatteryVoltage, CpuSnapshot, IoRegisters, MemoryDump, Notification, NotificationKind,
    SettingsSnapshot, MEMORY_DUMP_LEN,
};
use thiserror::Error;
use tracing::trace;

/// THMIC64 BLE Service UUID
pub const SERVICE_UUID: &str = "695ba701-a48c-43f6-9028-3c885771f19f";

/// Command/notification characteristic UUID - every frame in both directions uses it
pub const CHARACTERISTIC_UUID: &str = "3b05e9bf-086f-4b56-9c37-7b7eeb30b28b";

/// Advertised name of the peripheral
pub const TARGET_DEVICE_NAME: &str = "THMIC64";

/// Largest frame the peripheral accepts
pub const MAX_FRAME_LEN: usize = 254;

/// Payload bytes carried by one bulk-transfer block
pub const BLOCK_PAYLOAD_LEN: usize = 250;

/// Marker at offset 2 of every extended command
pub const EXT_CMD_FLAG: u8 = 0x80;

/// Command codes understood by the emulator firmware
pub mod cmd {
    pub const JOYSTICK_MODE_1: u8 = 1;
    pub const JOYSTICK_MODE_2: u8 = 2;
    pub const KB_JOYSTICK_MODE_1: u8 = 3;
    pub const KB_JOYSTICK_MODE_2: u8 = 4;
    pub const JOYSTICK_MODE_OFF: u8 = 5;
    pub const KB_JOYSTICK_MODE_OFF: u8 = 6;
    pub const LOAD: u8 = 11;
    pub const RECEIVE_DATA: u8 = 12;
    pub const SHOW_REG: u8 = 13;
    pub const SHOW_MEM: u8 = 14;
    pub const RESTORE: u8 = 15;
    pub const RESET: u8 = 20;
    pub const GET_STATUS: u8 = 21;
    pub const SWITCH_FRAME_COLOR_REFRESH: u8 = 22;
    pub const SEND_RAW_KEYS: u8 = 24;
    pub const SWITCH_DEBUG: u8 = 25;
    pub const SWITCH_PERF: u8 = 26;
    pub const SWITCH_DETECT_RELEASE_KEY: u8 = 27;
    pub const GET_BATTERY_VOLTAGE: u8 = 29;
    pub const POWER_OFF: u8 = 30;
    pub const SAVE: u8 = 31;
    pub const LIST: u8 = 32;
    pub const SET_VOLUME: u8 = 33;
    pub const ATTACH_D64: u8 = 37;
    pub const DETACH_D64: u8 = 38;

    /// Sentinel sent when a key is released; never a command code
    pub const KEY_RELEASED: u8 = 0xFF;
}

/// One outbound application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// First byte of the frame, `None` for an empty frame
    pub fn command_byte(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    pub fn payload(&self) -> &[u8] {
        self.bytes.get(1..).unwrap_or(&[])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Build a frame from a command byte and its parameters
pub fn encode_command(command_byte: u8, extra: &[u8]) -> Frame {
    let mut bytes = Vec::with_capacity(1 + extra.len());
    bytes.push(command_byte);
    bytes.extend_from_slice(extra);
    Frame { bytes }
}

/// The "key released" frame
pub fn key_released() -> Frame {
    encode_command(cmd::KEY_RELEASED, &[])
}

/// Joystick port assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoystickMode {
    /// Physical joystick in port 1
    Port1,
    /// Physical joystick in port 2
    Port2,
    /// No physical joystick
    Off,
    /// On-screen joystick in port 1
    KeyboardPort1,
    /// On-screen joystick in port 2
    KeyboardPort2,
    /// No on-screen joystick
    KeyboardOff,
}

impl JoystickMode {
    fn code(self) -> u8 {
        match self {
            Self::Port1 => cmd::JOYSTICK_MODE_1,
            Self::Port2 => cmd::JOYSTICK_MODE_2,
            Self::Off => cmd::JOYSTICK_MODE_OFF,
            Self::KeyboardPort1 => cmd::KB_JOYSTICK_MODE_1,
            Self::KeyboardPort2 => cmd::KB_JOYSTICK_MODE_2,
            Self::KeyboardOff => cmd::KB_JOYSTICK_MODE_OFF,
        }
    }
}

/// Extended commands
///
/// Every extended command is framed as `[code, detail, 0x80, params...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Joystick(JoystickMode),
    Load,
    /// RESTORE key, optionally combined with RUN/STOP
    Restore { run_stop: bool },
    ShowRegisters,
    ShowMemory { address: u16 },
    Reset,
    GetStatus,
    SwitchFrameColorRefresh,
    SendRawKeys,
    SwitchDebug,
    SwitchPerf,
    SwitchDetectReleaseKey,
    GetBatteryVoltage,
    PowerOff,
    Save,
    List,
    SetVolume(u8),
    AttachD64 { file_name: String },
    DetachD64,
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Self::Joystick(mode) => mode.code(),
            Self::Load => cmd::LOAD,
            Self::Restore { .. } => cmd::RESTORE,
            Self::ShowRegisters => cmd::SHOW_REG,
            Self::ShowMemory { .. } => cmd::SHOW_MEM,
            Self::Reset => cmd::RESET,
            Self::GetStatus => cmd::GET_STATUS,
            Self::SwitchFrameColorRefresh => cmd::SWITCH_FRAME_COLOR_REFRESH,
            Self::SendRawKeys => cmd::SEND_RAW_KEYS,
            Self::SwitchDebug => cmd::SWITCH_DEBUG,
            Self::SwitchPerf => cmd::SWITCH_PERF,
            Self::SwitchDetectReleaseKey => cmd::SWITCH_DETECT_RELEASE_KEY,
            Self::GetBatteryVoltage => cmd::GET_BATTERY_VOLTAGE,
            Self::PowerOff => cmd::POWER_OFF,
            Self::Save => cmd::SAVE,
            Self::List => cmd::LIST,
            Self::SetVolume(_) => cmd::SET_VOLUME,
            Self::AttachD64 { .. } => cmd::ATTACH_D64,
            Self::DetachD64 => cmd::DETACH_D64,
        }
    }

    /// Notification the peripheral sends back, if any
    pub fn response_kind(&self) -> Option<NotificationKind> {
        match self {
            Self::ShowRegisters => Some(NotificationKind::Registers),
            Self::ShowMemory { .. } => Some(NotificationKind::Memory),
            Self::GetBatteryVoltage => Some(NotificationKind::Battery),
            Self::Joystick(JoystickMode::Port1 | JoystickMode::Port2 | JoystickMode::Off)
            | Self::GetStatus
            | Self::SwitchFrameColorRefresh
            | Self::SendRawKeys
            | Self::SwitchDebug
            | Self::SwitchPerf
            | Self::SwitchDetectReleaseKey
            | Self::AttachD64 { .. }
            | Self::DetachD64 => Some(NotificationKind::Settings),
            _ => None,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let code = self.code();
        match self {
            Self::Restore { run_stop } => encode_command(code, &[u8::from(*run_stop), EXT_CMD_FLAG]),
            Self::ShowMemory { address } => {
                let [lo, hi] = address.to_le_bytes();
                encode_command(code, &[0x00, EXT_CMD_FLAG, lo, hi])
            }
            Self::SetVolume(volume) => encode_command(code, &[*volume, EXT_CMD_FLAG]),
            Self::AttachD64 { file_name } => {
                let mut extra = vec![0x00, EXT_CMD_FLAG];
                extra.extend_from_slice(file_name.as_bytes());
                encode_command(code, &extra)
            }
            _ => encode_command(code, &[0x00, EXT_CMD_FLAG]),
        }
    }
}

/// Position of a block within an upload, byte 1 of a block frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDetail {
    Next = 0,
    First = 1,
    Last = 2,
}

/// Number of blocks needed for `len` bytes
pub fn block_count(len: usize) -> usize {
    len.div_ceil(BLOCK_PAYLOAD_LEN)
}

/// Build the frame for block `index` of `buffer`
///
/// # Block Frame Structure (always 254 bytes, zero padded)
///
/// ```text
/// first / middle block:
/// [0]     : RECEIVEDATA (12)
/// [1]     : detail (1 = first, 0 = middle)
/// [2]     : 0x80
/// [3-252] : 250 payload bytes
///
/// last block:
/// [0]     : RECEIVEDATA (12)
/// [1]     : detail (2)
/// [2]     : 0x80
/// [3]     : number of valid payload bytes
/// [4-..]  : payload
/// ```
///
/// When the whole buffer fits into one block the first-block framing wins.
/// Returns `None` if `index` is past the last block.
pub fn encode_block(buffer: &[u8], index: usize) -> Option<Frame> {
    let total = block_count(buffer.len());
    if index >= total {
        return None;
    }

    let start = index * BLOCK_PAYLOAD_LEN;
    let end = (start + BLOCK_PAYLOAD_LEN).min(buffer.len());
    let data = &buffer[start..end];

    let detail = if index == 0 {
        BlockDetail::First
    } else if index == total - 1 {
        BlockDetail::Last
    } else {
        BlockDetail::Next
    };

    let mut bytes = Vec::with_capacity(MAX_FRAME_LEN);
    bytes.extend_from_slice(&[cmd::RECEIVE_DATA, detail as u8, EXT_CMD_FLAG]);
    if detail == BlockDetail::Last {
        bytes.push(data.len() as u8);
    }
    bytes.extend_from_slice(data);
    bytes.resize(MAX_FRAME_LEN, 0);

    trace!(index, ?detail, len = data.len(), "encoded block");
    Some(Frame { bytes })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty notification frame")]
    EmptyFrame,
    #[error("unknown notification type {0}")]
    UnknownType(u8),
    #[error("truncated {kind:?} notification: expected at least {expected} bytes, got {actual}")]
    Truncated {
        kind: NotificationKind,
        expected: usize,
        actual: usize,
    },
}

/// Parse an inbound notification frame
///
/// # Notification Structures
///
/// ```text
/// type 1 (settings)  : joymode, deactivate temp, raw keys, debug, perf,
///                      detect release key [, volume, d64 attached]
/// type 2 (registers) : running, PC lo, PC hi, A, X, Y, SR, D011, D016, D018,
///                      D019, D01A, $01, DC0D, DC0E, DC0F, DD0D, DD0E, DD0F
/// type 3 (memory)    : 16 bytes
/// type 4 (ack)       : -
/// type 5 (battery)   : millivolts lo, hi
/// ```
///
/// Nothing is produced unless the whole layout is present.
pub fn decode_notification(bytes: &[u8]) -> Result<Notification, DecodeError> {
    let type_byte = *bytes.first().ok_or(DecodeError::EmptyFrame)?;
    let kind = NotificationKind::from_type_byte(type_byte)
        .ok_or(DecodeError::UnknownType(type_byte))?;

    if bytes.len() < kind.min_len() {
        return Err(DecodeError::Truncated {
            kind,
            expected: kind.min_len(),
            actual: bytes.len(),
        });
    }

    let notification = match kind {
        NotificationKind::Settings => Notification::Settings(SettingsSnapshot {
            joystick_mode: bytes[1],
            deactivate_temp: bytes[2] != 0,
            send_raw_key_codes: bytes[3] != 0,
            debug: bytes[4] != 0,
            perf: bytes[5] != 0,
            detect_release_key: bytes[6] != 0,
            volume: bytes.get(7).copied(),
            d64_attached: bytes.get(8).map(|b| *b != 0),
        }),
        NotificationKind::Registers => Notification::Registers(CpuSnapshot {
            cpu_running: bytes[1] != 0,
            pc: u16::from_le_bytes([bytes[2], bytes[3]]),
            a: bytes[4],
            x: bytes[5],
            y: bytes[6],
            sr: bytes[7],
            io: IoRegisters {
                d011: bytes[8],
                d016: bytes[9],
                d018: bytes[10],
                d019: bytes[11],
                d01a: bytes[12],
                register1: bytes[13],
                dc0d: bytes[14],
                dc0e: bytes[15],
                dc0f: bytes[16],
                dd0d: bytes[17],
                dd0e: bytes[18],
                dd0f: bytes[19],
            },
        }),
        NotificationKind::Memory => {
            let mut dump = [0u8; MEMORY_DUMP_LEN];
            dump.copy_from_slice(&bytes[1..=MEMORY_DUMP_LEN]);
            Notification::Memory(MemoryDump { bytes: dump })
        }
        NotificationKind::TransferAck => Notification::TransferAck,
        NotificationKind::Battery => Notification::Battery(BatteryVoltage {
            millivolts: u16::from_le_bytes([bytes[1], bytes[2]]),
        }),
    };

    Ok(notification)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registers_frame() -> Vec<u8> {
        vec![
            2, 1, 0x34, 0x12, 0xA0, 0xA1, 0xA2, 0x30, 0x1B, 0xC8, 0x15, 0x01, 0x02, 0x37, 0x81,
            0x11, 0x00, 0x7F, 0x08, 0x09,
        ]
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(Command::Reset.to_frame().as_bytes(), &[20, 0x00, 0x80]);
        assert_eq!(Command::GetStatus.to_frame().as_bytes(), &[21, 0x00, 0x80]);
        assert_eq!(Command::PowerOff.to_frame().as_bytes(), &[30, 0x00, 0x80]);
        assert_eq!(Command::ShowRegisters.to_frame().as_bytes(), &[13, 0x00, 0x80]);
        assert_eq!(Command::Load.to_frame().as_bytes(), &[11, 0x00, 0x80]);
        assert_eq!(
            Command::ShowMemory { address: 0xC000 }.to_frame().as_bytes(),
            &[14, 0x00, 0x80, 0x00, 0xC0]
        );
        assert_eq!(
            Command::Restore { run_stop: true }.to_frame().as_bytes(),
            &[15, 0x01, 0x80]
        );
        assert_eq!(Command::SetVolume(200).to_frame().as_bytes(), &[33, 200, 0x80]);
        assert_eq!(
            Command::Joystick(JoystickMode::KeyboardPort2).to_frame().as_bytes(),
            &[4, 0x00, 0x80]
        );
        assert_eq!(
            Command::AttachD64 {
                file_name: "GAME".to_string()
            }
            .to_frame()
            .as_bytes(),
            &[37, 0x00, 0x80, b'G', b'A', b'M', b'E']
        );
    }

    #[test]
    fn test_no_command_uses_key_released_sentinel() {
        let commands = [
            Command::Joystick(JoystickMode::Port1),
            Command::Joystick(JoystickMode::KeyboardOff),
            Command::Load,
            Command::Restore { run_stop: false },
            Command::ShowRegisters,
            Command::ShowMemory { address: 0xFFFF },
            Command::Reset,
            Command::GetStatus,
            Command::SwitchFrameColorRefresh,
            Command::SendRawKeys,
            Command::SwitchDebug,
            Command::SwitchPerf,
            Command::SwitchDetectReleaseKey,
            Command::GetBatteryVoltage,
            Command::PowerOff,
            Command::Save,
            Command::List,
            Command::SetVolume(0xFF),
            Command::DetachD64,
        ];
        for command in commands {
            assert_ne!(command.to_frame().command_byte(), Some(cmd::KEY_RELEASED));
        }
        assert_eq!(key_released().as_bytes(), &[0xFF]);
    }

    #[test]
    fn test_encode_command() {
        let frame = encode_command(cmd::SHOW_MEM, &[0x00, 0x80, 0x01, 0x08]);
        assert_eq!(frame.command_byte(), Some(14));
        assert_eq!(frame.payload(), &[0x00, 0x80, 0x01, 0x08]);
        assert_eq!(frame.len(), 5);
    }

    #[test]
    fn test_block_layout_for_1000_bytes() {
        let buffer: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        assert_eq!(block_count(buffer.len()), 4);

        let first = encode_block(&buffer, 0).unwrap();
        assert_eq!(&first.as_bytes()[..3], &[12, 1, 0x80]);
        assert_eq!(&first.as_bytes()[3..253], &buffer[..250]);
        assert_eq!(first.len(), MAX_FRAME_LEN);

        let middle = encode_block(&buffer, 2).unwrap();
        assert_eq!(&middle.as_bytes()[..3], &[12, 0, 0x80]);
        assert_eq!(&middle.as_bytes()[3..253], &buffer[500..750]);

        let last = encode_block(&buffer, 3).unwrap();
        assert_eq!(&last.as_bytes()[..4], &[12, 2, 0x80, 250]);
        assert_eq!(&last.as_bytes()[4..254], &buffer[750..]);

        assert!(encode_block(&buffer, 4).is_none());
    }

    #[test]
    fn test_short_last_block() {
        let buffer = vec![0xAB; 900];
        assert_eq!(block_count(buffer.len()), 4);

        let last = encode_block(&buffer, 3).unwrap();
        assert_eq!(&last.as_bytes()[..4], &[12, 2, 0x80, 150]);
        assert!(last.as_bytes()[4..154].iter().all(|b| *b == 0xAB));
        assert!(last.as_bytes()[154..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_single_block_uses_first_framing() {
        let buffer = vec![1u8; 40];
        let only = encode_block(&buffer, 0).unwrap();
        assert_eq!(&only.as_bytes()[..3], &[12, 1, 0x80]);
        assert_eq!(&only.as_bytes()[3..43], &buffer[..]);
        assert_eq!(only.len(), MAX_FRAME_LEN);
    }

    #[test]
    fn test_block_encoding_is_deterministic() {
        let buffer: Vec<u8> = (0..777u32).map(|i| (i * 7) as u8).collect();
        for index in 0..block_count(buffer.len()) {
            assert_eq!(encode_block(&buffer, index), encode_block(&buffer, index));
        }
    }

    #[test]
    fn test_decode_battery() {
        assert_eq!(
            decode_notification(&[5, 0x2C, 0x01]),
            Ok(Notification::Battery(BatteryVoltage { millivolts: 300 }))
        );
    }

    #[test]
    fn test_decode_registers() {
        let Ok(Notification::Registers(cpu)) = decode_notification(&registers_frame()) else {
            panic!("expected register snapshot");
        };
        assert!(cpu.cpu_running);
        assert_eq!(cpu.pc, 0x1234);
        assert_eq!((cpu.a, cpu.x, cpu.y, cpu.sr), (0xA0, 0xA1, 0xA2, 0x30));
        assert_eq!(cpu.io.d011, 0x1B);
        assert_eq!(cpu.io.register1, 0x37);
        assert_eq!(cpu.io.dc0d, 0x81);
        assert_eq!(cpu.io.dd0f, 0x09);
    }

    #[test]
    fn test_decode_settings_with_and_without_extensions() {
        let Ok(Notification::Settings(short)) = decode_notification(&[1, 2, 0, 1, 0, 1, 1]) else {
            panic!("expected settings");
        };
        assert_eq!(short.joystick_mode, 2);
        assert!(!short.deactivate_temp);
        assert!(short.send_raw_key_codes);
        assert!(!short.debug);
        assert!(short.perf);
        assert!(short.detect_release_key);
        assert_eq!(short.volume, None);
        assert_eq!(short.d64_attached, None);

        let Ok(Notification::Settings(long)) =
            decode_notification(&[1, 5, 1, 0, 1, 0, 0, 180, 1])
        else {
            panic!("expected settings");
        };
        assert_eq!(long.volume, Some(180));
        assert_eq!(long.d64_attached, Some(true));
    }

    #[test]
    fn test_decode_memory_and_ack() {
        let mut frame = vec![3];
        frame.extend(0..16u8);
        let Ok(Notification::Memory(dump)) = decode_notification(&frame) else {
            panic!("expected memory dump");
        };
        assert_eq!(dump.bytes[0], 0);
        assert_eq!(dump.bytes[15], 15);

        assert_eq!(decode_notification(&[4]), Ok(Notification::TransferAck));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode_notification(&[]), Err(DecodeError::EmptyFrame));
        assert_eq!(decode_notification(&[9, 1, 2]), Err(DecodeError::UnknownType(9)));
        assert_eq!(decode_notification(&[0]), Err(DecodeError::UnknownType(0)));
    }

    #[test]
    fn test_every_short_prefix_is_truncated() {
        let mut memory = vec![3];
        memory.extend([0u8; 16]);
        let frames = [
            vec![1, 1, 0, 0, 0, 0, 0],
            registers_frame(),
            memory,
            vec![5, 0x2C, 0x01],
        ];
        for frame in frames {
            for len in 1..frame.len() {
                match decode_notification(&frame[..len]) {
                    Err(DecodeError::Truncated {
                        expected, actual, ..
                    }) => {
                        assert_eq!(expected, frame.len());
                        assert_eq!(actual, len);
                    }
                    other => panic!("prefix of len {} decoded to {:?}", len, other),
                }
            }
        }
    }
}
