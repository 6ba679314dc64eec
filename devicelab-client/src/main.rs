//! Device lab CLI client
//!
//! Connects to the controller over the framed channel, issues requests, and
//! can follow the event stream or save mirror frames to disk.

use base64::Engine;
use clap::{Parser, Subcommand};
use devicelab_client::{LabConnection, ReconnectPolicy};
use devicelab_common::{init_logging_with_level, CommandPayload, Event, Request};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devicelab")]
#[command(about = "CLI client for the device lab controller")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:5000")]
    server: String,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices
    Devices,
    /// Force a discovery cycle
    Refresh,
    /// Follow the event stream
    Watch,
    /// Reserve a device
    Reserve {
        device_id: String,
        user_id: String,
        #[arg(long)]
        duration: Option<u64>,
        #[arg(long)]
        purpose: Option<String>,
    },
    /// Release a device
    Release { device_id: String },
    /// Start a session
    StartSession { device_id: String, user_id: String },
    /// End a session
    EndSession { session_id: String },
    /// Send a tap
    Tap { device_id: String, x: u32, y: u32 },
    /// Run a shell command (Android only)
    Shell { device_id: String, command: String },
    /// Reserve, start the driver, and open a session in one call
    AutoStart {
        device_id: String,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Stop the driver and release the device
    StopDriver { device_id: String },
    /// Show driver status
    DriverStatus { device_id: String },
    /// Fetch driver logs
    DriverLogs { device_id: String },
    /// Mirror a device's screen, saving frames to a directory
    Mirror {
        device_id: String,
        #[arg(long)]
        fps: Option<u32>,
        #[arg(long, default_value = "frames")]
        out: PathBuf,
        /// Stop after this many frames
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Health snapshot
    Health,
    /// Aggregate statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging_with_level(if cli.verbose { "debug" } else { "warn" })?;

    let mut conn = LabConnection::connect(&cli.server, ReconnectPolicy::default())
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    match cli.command {
        Commands::Devices => {
            let devices = conn.devices().await.map_err(to_anyhow)?;
            for device in devices {
                println!(
                    "{}  {:<24} {:<9} {:<10} battery {}%  {}",
                    device.id,
                    device.name,
                    device.platform.to_string(),
                    device.status.to_string(),
                    device.battery,
                    device.serial
                );
            }
        }
        Commands::Refresh => {
            print_envelope(conn.request(Request::RefreshDevices).await)?;
        }
        Commands::Watch => {
            println!("Watching events (ctrl-c to stop)");
            while let Some(event) = conn.next_event().await {
                match event {
                    Event::DeviceUpdated { device, timestamp } => {
                        println!("[{}] device {} -> {}", timestamp, device.name, device.status);
                    }
                    Event::DeviceList { devices, timestamp } => {
                        println!("[{}] device list: {} device(s)", timestamp, devices.len());
                    }
                    Event::DeviceLog { entry, .. } => {
                        println!("[log {}] {}: {}", entry.device_id, entry.tag, entry.message);
                    }
                    Event::SystemHealth { health, timestamp } => {
                        println!(
                            "[{}] health: {}/{} online, {} sessions, {} drivers",
                            timestamp,
                            health.online_devices,
                            health.total_devices,
                            health.active_sessions,
                            health.running_drivers
                        );
                    }
                    Event::Error { message, .. } => println!("[error] {}", message),
                    other => println!("{:?}", other),
                }
            }
        }
        Commands::Reserve {
            device_id,
            user_id,
            duration,
            purpose,
        } => {
            print_envelope(
                conn.request(Request::Reserve {
                    device_id,
                    user_id,
                    duration_minutes: duration,
                    purpose,
                })
                .await,
            )?;
        }
        Commands::Release { device_id } => {
            print_envelope(conn.request(Request::Release { device_id }).await)?;
        }
        Commands::StartSession { device_id, user_id } => {
            print_envelope(conn.request(Request::StartSession { device_id, user_id }).await)?;
        }
        Commands::EndSession { session_id } => {
            print_envelope(conn.request(Request::EndSession { session_id }).await)?;
        }
        Commands::Tap { device_id, x, y } => {
            print_envelope(
                conn.request(Request::Command {
                    device_id,
                    payload: CommandPayload::Tap { x, y },
                })
                .await,
            )?;
        }
        Commands::Shell { device_id, command } => {
            print_envelope(
                conn.request(Request::Command {
                    device_id,
                    payload: CommandPayload::Shell { command },
                })
                .await,
            )?;
        }
        Commands::AutoStart {
            device_id,
            user_id,
            duration,
        } => {
            print_envelope(
                conn.request(Request::AutoStart {
                    device_id,
                    user_id,
                    duration_minutes: duration,
                    purpose: None,
                })
                .await,
            )?;
        }
        Commands::StopDriver { device_id } => {
            print_envelope(conn.request(Request::StopDriver { device_id }).await)?;
        }
        Commands::DriverStatus { device_id } => {
            print_envelope(conn.request(Request::DriverStatus { device_id }).await)?;
        }
        Commands::DriverLogs { device_id } => {
            print_envelope(conn.request(Request::DriverLogs { device_id }).await)?;
        }
        Commands::Mirror {
            device_id,
            fps,
            out,
            count,
        } => {
            std::fs::create_dir_all(&out)?;
            print_envelope(
                conn.request(Request::StartMirror {
                    device_id: device_id.clone(),
                    fps,
                })
                .await,
            )?;

            let mut saved = 0usize;
            while saved < count {
                match conn.next_event().await {
                    Some(Event::ScreenUpdate { frame, .. }) => {
                        let bytes =
                            base64::engine::general_purpose::STANDARD.decode(&frame.data)?;
                        let path = out.join(format!("frame-{:04}.png", saved));
                        std::fs::write(&path, bytes)?;
                        println!("saved {}", path.display());
                        saved += 1;
                    }
                    Some(Event::Error { message, .. }) => {
                        eprintln!("mirror error: {}", message);
                        break;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            let _ = conn.request(Request::StopMirror { device_id }).await;
        }
        Commands::Health => {
            print_envelope(conn.request(Request::Health).await)?;
        }
        Commands::Stats => {
            print_envelope(conn.request(Request::Stats).await)?;
        }
    }

    Ok(())
}

fn to_anyhow(e: devicelab_common::LabError) -> anyhow::Error {
    anyhow::anyhow!("{}", e)
}

fn print_envelope(
    result: devicelab_common::Result<devicelab_common::Envelope>,
) -> anyhow::Result<()> {
    let envelope = result.map_err(to_anyhow)?;
    if envelope.success {
        if let Some(data) = envelope.data {
            println!("{}", serde_json::to_string_pretty(&data)?);
        } else if let Some(message) = envelope.message {
            println!("{}", message);
        } else {
            println!("ok");
        }
        Ok(())
    } else {
        anyhow::bail!(envelope.error.unwrap_or_else(|| "request failed".to_string()))
    }
}
