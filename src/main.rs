//! Console remote for the THMIC64 emulator board
//!
//! Connects, runs one command and disconnects.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use thmic64_remote::domain::models::{Notification, NotificationKind};
use thmic64_remote::domain::settings::SettingsService;
use thmic64_remote::infrastructure::bluetooth::link::wait_until_not_ready;
use thmic64_remote::infrastructure::bluetooth::protocol::{Command, JoystickMode};
use thmic64_remote::infrastructure::bluetooth::transport::BleTransport;
use thmic64_remote::infrastructure::bluetooth::{RemoteConfig, RemoteService};
use thmic64_remote::infrastructure::logging;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "thmic64-remote")]
#[command(about = "BLE remote control for the THMIC64 emulator board")]
struct Cli {
    /// Settings file (default: <config dir>/THMIC64Remote/settings.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level or filter, overrides the settings file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the emulator switches
    Status,
    /// Show CPU and I/O registers
    Regs,
    /// Show 16 bytes of memory
    Mem {
        /// Address in hex, e.g. C000, $C000 or 0xC000
        #[arg(value_parser = parse_address)]
        address: u16,
    },
    /// Show the battery voltage
    Battery,
    /// Reset the C64
    Reset,
    /// Switch the board off
    PowerOff,
    /// Press LOAD
    Load,
    /// Press RESTORE
    Restore {
        /// Hold RUN/STOP as well
        #[arg(long)]
        run_stop: bool,
    },
    /// Assign the joystick port
    Joystick {
        #[arg(value_enum)]
        mode: JoystickArg,
    },
    /// Set the sound volume
    Volume { level: u8 },
    /// Attach a D64 image from the board's SD card
    Attach { file_name: String },
    /// Detach the D64 image
    Detach,
    /// Upload a program into the C64's memory
    Upload { file: PathBuf },
    /// Print every notification until interrupted
    Monitor {
        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum JoystickArg {
    Port1,
    Port2,
    Off,
    KbPort1,
    KbPort2,
    KbOff,
}

impl From<JoystickArg> for JoystickMode {
    fn from(arg: JoystickArg) -> Self {
        match arg {
            JoystickArg::Port1 => JoystickMode::Port1,
            JoystickArg::Port2 => JoystickMode::Port2,
            JoystickArg::Off => JoystickMode::Off,
            JoystickArg::KbPort1 => JoystickMode::KeyboardPort1,
            JoystickArg::KbPort2 => JoystickMode::KeyboardPort2,
            JoystickArg::KbOff => JoystickMode::KeyboardOff,
        }
    }
}

fn parse_address(s: &str) -> Result<u16, String> {
    let digits = s
        .trim_start_matches('$')
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid address '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match cli.config {
        Some(path) => SettingsService::with_path(path),
        None => SettingsService::new()?,
    };
    let _logging_guard =
        logging::init_logger(&settings.get().log_settings, cli.log_level.as_deref())?;
    info!("Using settings from {}", settings.path().display());

    let config = RemoteConfig::from(settings.get());
    run(cli.command, &mut settings, config).await
}

#[cfg(windows)]
async fn run(
    command: Commands,
    settings: &mut SettingsService,
    config: RemoteConfig,
) -> anyhow::Result<()> {
    use thmic64_remote::infrastructure::bluetooth::winrt::WinRtTransport;

    let (transport, events) = WinRtTransport::new(
        &settings.get().ble_service_uuid,
        &settings.get().ble_characteristic_uuid,
    )?;
    let service = RemoteService::start(transport, events, config);
    execute(&service, command, settings).await
}

#[cfg(not(windows))]
async fn run(
    _command: Commands,
    _settings: &mut SettingsService,
    _config: RemoteConfig,
) -> anyhow::Result<()> {
    anyhow::bail!("no Bluetooth LE backend for this platform")
}

fn print_notification(notification: &Notification) -> anyhow::Result<()> {
    match notification {
        Notification::Memory(dump) => println!("{}", dump),
        Notification::Battery(battery) => println!("{} mV", battery.millivolts),
        other => println!("{}", serde_json::to_string_pretty(other)?),
    }
    Ok(())
}

#[cfg_attr(not(windows), allow(dead_code))]
async fn execute<T: BleTransport>(
    service: &RemoteService<T>,
    command: Commands,
    settings: &mut SettingsService,
) -> anyhow::Result<()> {
    service.connect().await?;
    if let Some(address) = service.connected_device() {
        if let Err(e) = settings.remember_address(address) {
            warn!("Could not save settings: {}", e);
        }
    }

    let query = |command: Command, kind: NotificationKind| async move {
        let notification = service.query(&command, kind).await?;
        print_notification(&notification)
    };

    match command {
        Commands::Status => query(Command::GetStatus, NotificationKind::Settings).await?,
        Commands::Regs => query(Command::ShowRegisters, NotificationKind::Registers).await?,
        Commands::Mem { address } => {
            query(Command::ShowMemory { address }, NotificationKind::Memory).await?
        }
        Commands::Battery => query(Command::GetBatteryVoltage, NotificationKind::Battery).await?,
        Commands::Reset => service.send(&Command::Reset, true).await?,
        Commands::PowerOff => service.send(&Command::PowerOff, true).await?,
        Commands::Load => service.send(&Command::Load, true).await?,
        Commands::Restore { run_stop } => {
            service.send(&Command::Restore { run_stop }, true).await?
        }
        Commands::Joystick { mode } => {
            service.send(&Command::Joystick(mode.into()), true).await?
        }
        Commands::Volume { level } => service.send(&Command::SetVolume(level), true).await?,
        Commands::Attach { file_name } => {
            service.send(&Command::AttachD64 { file_name }, true).await?
        }
        Commands::Detach => service.send(&Command::DetachD64, true).await?,
        Commands::Upload { file } => {
            let buffer = std::fs::read(&file)?;
            let handle = service.start_bulk_transfer(buffer)?;

            let mut progress = handle.progress();
            let printer = tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    let p = *progress.borrow();
                    println!("{:>3}% ({}/{})", p.percent(), p.blocks_completed, p.total_blocks);
                }
            });

            let report = handle.wait().await?;
            let _ = printer.await;
            println!(
                "Uploaded {} bytes in {} blocks ({} unacknowledged)",
                report.bytes, report.total_blocks, report.missed_acks
            );
        }
        Commands::Monitor { seconds } => {
            for kind in NotificationKind::ALL {
                service.register(kind, |notification| {
                    if let Err(e) = print_notification(notification) {
                        warn!("Could not print notification: {}", e);
                    }
                });
            }
            service.send(&Command::GetStatus, true).await?;

            let limit = seconds.map(Duration::from_secs).unwrap_or(Duration::MAX);
            let mut link = service.watch_link();
            tokio::select! {
                _ = tokio::time::sleep(limit) => {}
                _ = tokio::signal::ctrl_c() => {}
                _ = wait_until_not_ready(&mut link) => {
                    warn!("Link lost");
                }
            }
            for kind in NotificationKind::ALL {
                service.unregister(kind);
            }
        }
    }

    service.disconnect();
    Ok(())
}
