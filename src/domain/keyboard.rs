use crate::infrastructure::bluetooth::protocol::{cmd, encode_command, Command, Frame};
use std::time::Duration;

/// Modifier byte of a key frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Modifier {
    #[default]
    None = 0,
    Shift = 1,
    Ctrl = 2,
    Commodore = 4,
}

/// A key of the C64 matrix: active-low row and column masks plus the
/// modifier the key implies on its own (cursor left is a shifted cursor right)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCode {
    row: u8,
    column: u8,
    modifier: Modifier,
}

impl KeyCode {
    /// `None` for a row mask of 0xFF, which selects no row and would read as
    /// a key-released frame on the wire
    pub fn new(row: u8, column: u8, modifier: Modifier) -> Option<Self> {
        if row == cmd::KEY_RELEASED {
            return None;
        }
        Some(Self {
            row,
            column,
            modifier,
        })
    }

    pub fn row(&self) -> u8 {
        self.row
    }

    pub fn column(&self) -> u8 {
        self.column
    }

    pub fn modifier(&self) -> Modifier {
        self.modifier
    }
}

/// On-screen modifier keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierKey {
    LeftShift,
    RightShift,
    ShiftLock,
    Ctrl,
    Commodore,
}

impl ModifierKey {
    /// Matrix position, used when modifiers are sent as plain keys
    pub fn key_code(self) -> KeyCode {
        let (row, column) = match self {
            Self::LeftShift | Self::ShiftLock => (0xfd, 0x7f),
            Self::RightShift => (0xbf, 0xef),
            Self::Ctrl => (0x7f, 0xfb),
            Self::Commodore => (0x7f, 0xdf),
        };
        KeyCode {
            row,
            column,
            modifier: Modifier::None,
        }
    }
}

/// Latched state of the on-screen modifier keys
///
/// Shift, ctrl and commodore are one-shot: they apply to the next key and
/// are then released. Shift lock stays on until toggled off. In raw key code
/// mode shift, ctrl and commodore are not latched but sent as keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifierLatch {
    shift: bool,
    shift_lock: bool,
    ctrl: bool,
    commodore: bool,
    raw_key_codes: bool,
}

impl ModifierLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow the peripheral's raw key code switch; turning it on drops
    /// latched one-shot modifiers
    pub fn set_raw_key_codes(&mut self, enabled: bool) {
        if enabled {
            self.shift = false;
            self.ctrl = false;
            self.commodore = false;
        }
        self.raw_key_codes = enabled;
    }

    pub fn is_raw_key_codes(&self) -> bool {
        self.raw_key_codes
    }

    /// Handle a modifier key press
    ///
    /// Returns the frame to send when the key goes out as a plain key, `None`
    /// when it only changed the latch. Shift lock always latches.
    pub fn press(&mut self, key: ModifierKey) -> Option<Frame> {
        match key {
            ModifierKey::ShiftLock => {
                self.toggle_shift_lock();
                None
            }
            _ if self.raw_key_codes => Some(self.key_frame(key.key_code())),
            ModifierKey::LeftShift | ModifierKey::RightShift => {
                self.toggle_shift();
                None
            }
            ModifierKey::Ctrl => {
                self.toggle_ctrl();
                None
            }
            ModifierKey::Commodore => {
                self.toggle_commodore();
                None
            }
        }
    }

    /// Toggle one-shot shift; no effect while shift lock is on
    pub fn toggle_shift(&mut self) -> bool {
        if !self.shift_lock {
            self.shift = !self.shift;
        }
        self.shift
    }

    pub fn toggle_shift_lock(&mut self) -> bool {
        self.shift_lock = !self.shift_lock;
        self.shift_lock
    }

    pub fn toggle_ctrl(&mut self) -> bool {
        self.ctrl = !self.ctrl;
        self.ctrl
    }

    pub fn toggle_commodore(&mut self) -> bool {
        self.commodore = !self.commodore;
        self.commodore
    }

    pub fn is_shift(&self) -> bool {
        self.shift
    }

    pub fn is_shift_lock(&self) -> bool {
        self.shift_lock
    }

    pub fn is_ctrl(&self) -> bool {
        self.ctrl
    }

    pub fn is_commodore(&self) -> bool {
        self.commodore
    }

    /// Modifier the next key would carry, shift before ctrl before commodore
    pub fn active(&self) -> Option<Modifier> {
        if self.shift || self.shift_lock {
            Some(Modifier::Shift)
        } else if self.ctrl {
            Some(Modifier::Ctrl)
        } else if self.commodore {
            Some(Modifier::Commodore)
        } else {
            None
        }
    }

    /// Encode `key` as `[row, column, modifier]` and release the one-shot
    /// modifier that was used
    pub fn encode(&mut self, key: KeyCode) -> [u8; 3] {
        let modifier = match self.active() {
            Some(modifier) => {
                match modifier {
                    Modifier::Shift => self.shift = false,
                    Modifier::Ctrl => self.ctrl = false,
                    Modifier::Commodore => self.commodore = false,
                    Modifier::None => {}
                }
                modifier
            }
            None => key.modifier,
        };
        [key.row, key.column, modifier as u8]
    }

    pub fn key_frame(&mut self, key: KeyCode) -> Frame {
        let [row, column, modifier] = self.encode(key);
        encode_command(row, &[column, modifier])
    }

    /// RESTORE, or RESTORE + RUN/STOP when commodore is latched
    pub fn restore(&mut self) -> Command {
        let run_stop = self.commodore;
        self.commodore = false;
        Command::Restore { run_stop }
    }
}

/// Virtual joystick contacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoystickDirection {
    Up = 0,
    Down = 1,
    Left = 2,
    Right = 3,
    Fire = 4,
}

impl JoystickDirection {
    const RELEASED: u8 = 0x80;

    pub fn frame(self, pressed: bool) -> Frame {
        let byte = self as u8;
        if pressed {
            encode_command(byte, &[])
        } else {
            encode_command(byte | Self::RELEASED, &[])
        }
    }
}

pub const DEFAULT_MIN_KEY_PRESSED_MS: u64 = 130;
pub const MIN_KEY_PRESSED_RANGE_MS: (u64, u64) = (120, 300);

/// How long to wait before sending the release so the key is held at least
/// `min_pressed`
pub fn release_delay(held_for: Duration, min_pressed: Duration) -> Duration {
    min_pressed.saturating_sub(held_for)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_a() -> KeyCode {
        KeyCode::new(0xfd, 0xfb, Modifier::None).unwrap()
    }

    fn crsr_left() -> KeyCode {
        KeyCode::new(0xfe, 0xfb, Modifier::Shift).unwrap()
    }

    #[test]
    fn test_plain_key_keeps_own_modifier() {
        let mut latch = ModifierLatch::new();
        assert_eq!(latch.encode(key_a()), [0xfd, 0xfb, 0]);
        assert_eq!(latch.encode(crsr_left()), [0xfe, 0xfb, 1]);
    }

    #[test]
    fn test_modifier_precedence() {
        let mut latch = ModifierLatch::new();
        latch.toggle_commodore();
        latch.toggle_ctrl();
        latch.toggle_shift();
        assert_eq!(latch.active(), Some(Modifier::Shift));

        assert_eq!(latch.encode(key_a())[2], 1);
        assert!(!latch.is_shift());
        assert_eq!(latch.encode(key_a())[2], 2);
        assert!(!latch.is_ctrl());
        assert_eq!(latch.encode(key_a())[2], 4);
        assert!(!latch.is_commodore());
        assert_eq!(latch.encode(key_a())[2], 0);
    }

    #[test]
    fn test_shift_lock_is_sticky() {
        let mut latch = ModifierLatch::new();
        latch.toggle_shift_lock();
        latch.toggle_ctrl();
        // one-shot shift cannot be toggled while locked
        assert!(!latch.toggle_shift());

        assert_eq!(latch.encode(key_a())[2], 1);
        assert_eq!(latch.encode(key_a())[2], 1);
        assert!(latch.is_shift_lock());
        assert!(latch.is_ctrl());

        latch.toggle_shift_lock();
        assert_eq!(latch.encode(key_a())[2], 2);
    }

    #[test]
    fn test_key_frame_layout() {
        let mut latch = ModifierLatch::new();
        latch.toggle_commodore();
        let frame = latch.key_frame(key_a());
        assert_eq!(frame.as_bytes(), &[0xfd, 0xfb, 4]);
    }

    #[test]
    fn test_row_mask_cannot_collide_with_key_released() {
        assert_eq!(KeyCode::new(0xff, 0xfe, Modifier::None), None);
    }

    #[test]
    fn test_commodore_restore_sends_run_stop() {
        let mut latch = ModifierLatch::new();
        assert_eq!(latch.restore(), Command::Restore { run_stop: false });
        latch.toggle_commodore();
        assert_eq!(latch.restore(), Command::Restore { run_stop: true });
        assert!(!latch.is_commodore());
    }

    #[test]
    fn test_modifier_keys_latch_by_default() {
        let mut latch = ModifierLatch::new();
        assert_eq!(latch.press(ModifierKey::Ctrl), None);
        assert_eq!(latch.press(ModifierKey::RightShift), None);
        assert!(latch.is_ctrl());
        assert!(latch.is_shift());
        assert_eq!(latch.encode(key_a())[2], 1);
    }

    #[test]
    fn test_raw_key_codes_send_modifiers_as_keys() {
        let mut latch = ModifierLatch::new();
        latch.toggle_commodore();
        latch.set_raw_key_codes(true);
        assert!(!latch.is_commodore());

        let frame = latch.press(ModifierKey::Commodore).unwrap();
        assert_eq!(frame.as_bytes(), &[0x7f, 0xdf, 0]);
        let frame = latch.press(ModifierKey::LeftShift).unwrap();
        assert_eq!(frame.as_bytes(), &[0xfd, 0x7f, 0]);
        assert!(!latch.is_shift());

        // shift lock still latches and shifts the raw keys
        assert_eq!(latch.press(ModifierKey::ShiftLock), None);
        let frame = latch.press(ModifierKey::Ctrl).unwrap();
        assert_eq!(frame.as_bytes(), &[0x7f, 0xfb, 1]);
        assert!(!latch.is_ctrl());
    }

    #[test]
    fn test_joystick_frames() {
        assert_eq!(JoystickDirection::Up.frame(true).as_bytes(), &[0x00]);
        assert_eq!(JoystickDirection::Fire.frame(true).as_bytes(), &[0x04]);
        assert_eq!(JoystickDirection::Left.frame(false).as_bytes(), &[0x82]);
    }

    #[test]
    fn test_release_delay() {
        let min = Duration::from_millis(130);
        assert_eq!(
            release_delay(Duration::from_millis(50), min),
            Duration::from_millis(80)
        );
        assert_eq!(release_delay(Duration::from_millis(200), min), Duration::ZERO);
    }
}
