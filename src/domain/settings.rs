use crate::domain::keyboard::{DEFAULT_MIN_KEY_PRESSED_MS, MIN_KEY_PRESSED_RANGE_MS};
use crate::domain::models::AckTimeoutPolicy;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "thmic64_remote".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_characteristic_uuid")]
    pub ble_characteristic_uuid: String,
    #[serde(default)]
    pub last_connected_address: Option<u64>,
    #[serde(default = "default_scan_duration_ms")]
    pub scan_duration_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    // Transfer Settings
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default)]
    pub ack_timeout_policy: AckTimeoutPolicy,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    // Keyboard Settings
    #[serde(default = "default_min_key_pressed_duration_ms")]
    pub min_key_pressed_duration_ms: u64,

    // Battery Settings
    #[serde(default = "default_true")]
    pub battery_monitor_enabled: bool,
    #[serde(default = "default_battery_first_check_ms")]
    pub battery_first_check_ms: u64,
    #[serde(default = "default_battery_check_interval_ms")]
    pub battery_check_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),

            device_name: default_device_name(),
            ble_service_uuid: default_service_uuid(),
            ble_characteristic_uuid: default_characteristic_uuid(),
            last_connected_address: None,
            scan_duration_ms: default_scan_duration_ms(),
            write_timeout_ms: default_write_timeout_ms(),

            ack_timeout_ms: default_ack_timeout_ms(),
            ack_timeout_policy: AckTimeoutPolicy::default(),
            query_timeout_ms: default_query_timeout_ms(),

            min_key_pressed_duration_ms: default_min_key_pressed_duration_ms(),

            battery_monitor_enabled: true,
            battery_first_check_ms: default_battery_first_check_ms(),
            battery_check_interval_ms: default_battery_check_interval_ms(),
        }
    }
}

impl Settings {
    /// Pull out-of-range values back into range
    pub fn normalize(&mut self) {
        let (min, max) = MIN_KEY_PRESSED_RANGE_MS;
        let clamped = self.min_key_pressed_duration_ms.clamp(min, max);
        if clamped != self.min_key_pressed_duration_ms {
            warn!(
                "min_key_pressed_duration_ms {} out of range, using {}",
                self.min_key_pressed_duration_ms, clamped
            );
            self.min_key_pressed_duration_ms = clamped;
        }
    }
}

fn default_device_name() -> String {
    protocol::TARGET_DEVICE_NAME.to_string()
}
fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_characteristic_uuid() -> String {
    protocol::CHARACTERISTIC_UUID.to_string()
}
fn default_scan_duration_ms() -> u64 {
    10_000
}
fn default_write_timeout_ms() -> u64 {
    5_000
}
fn default_ack_timeout_ms() -> u64 {
    3_000
}
fn default_query_timeout_ms() -> u64 {
    2_000
}
fn default_min_key_pressed_duration_ms() -> u64 {
    DEFAULT_MIN_KEY_PRESSED_MS
}
fn default_battery_first_check_ms() -> u64 {
    10_000
}
fn default_battery_check_interval_ms() -> u64 {
    5 * 60 * 1000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults if it is missing or unreadable
    pub fn with_path(settings_path: PathBuf) -> Self {
        let mut settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                if settings_path.exists() {
                    warn!("Ignoring {}: {}", settings_path.display(), e);
                }
                Settings::default()
            }
        };
        settings.normalize();

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("THMIC64Remote");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_address(&mut self, address: u64) -> anyhow::Result<()> {
        if self.settings.last_connected_address != Some(address) {
            self.settings.last_connected_address = Some(address);
            self.save()?;
        }
        Ok(())
    }
}
