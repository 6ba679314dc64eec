//! Device lab controller server
//!
//! Fuses the Android and iOS device backends into a unified registry,
//! brokers exclusive reservations and sessions, supervises per-device
//! driver servers, pumps screen-mirror frames, and fans every state change
//! out to realtime subscribers.

use clap::Parser;
use devicelab_server::{
    DeviceRegistry, DriverSupervisor, EventHub, MirrorPumps, RequestRouter, SessionManager,
};
use devicelab_common::{
    init_logging_with_level, AndroidAdapter, DeviceAdapter, Event, EventSink, IosAdapter,
    LabConfig, OriginAllowlist,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "devicelab-server")]
#[command(about = "Mobile device lab controller")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "devicelab.toml")]
    config: String,

    /// Port for the realtime channel (overrides config and PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Seed synthetic offline demo devices at startup
    #[arg(long)]
    seed_offline: bool,

    /// Skip the initial discovery pass (devices appear on the first cycle)
    #[arg(long)]
    skip_initial_discovery: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match LabConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    config.apply_env();
    apply_cli_overrides(&mut config, &cli);
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    init_logging_with_level(level)?;
    info!("Starting device lab controller");

    // construction order: hub first (it is the broadcast sink), then the
    // components that publish through it, then the router that fronts them
    let hub = EventHub::new();
    let sink: Arc<dyn EventSink> = hub.clone();

    let supervisor = Arc::new(DriverSupervisor::new(config.driver.clone(), sink.clone()));
    supervisor.cleanup_orphans();

    let command_timeout = Duration::from_secs(config.adapters.command_timeout_secs);
    let screenshot_timeout = Duration::from_secs(config.adapters.screenshot_timeout_secs);
    let adapters: Vec<Arc<dyn DeviceAdapter>> = vec![
        Arc::new(AndroidAdapter::new(
            config.adapters.adb_path.clone(),
            command_timeout,
            screenshot_timeout,
        )),
        Arc::new(IosAdapter::new(command_timeout, screenshot_timeout)),
    ];

    let registry = Arc::new(DeviceRegistry::new(
        adapters.clone(),
        supervisor.clone(),
        sink.clone(),
    ));
    let sessions = Arc::new(SessionManager::new(
        config.sessions.clone(),
        registry.clone(),
        sink.clone(),
    ));
    let pumps = Arc::new(MirrorPumps::new(config.mirror.clone(), registry.clone()));

    if config.discovery.seed_offline_devices {
        registry.seed_offline_devices().await;
    }

    if !cli.skip_initial_discovery {
        let devices = registry.discovery_cycle().await;
        info!("Initial discovery found {} device(s)", devices.len());

        // no devices and no working backend is an unrecoverable start
        if devices.is_empty() {
            let mut any_backend = false;
            for adapter in &adapters {
                if adapter.enumerate().await.is_ok() {
                    any_backend = true;
                    break;
                }
            }
            if !any_backend {
                error!("No device backend is available and no devices are known; exiting");
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = std::fs::create_dir_all(&config.uploads.staging_dir) {
        warn!(
            "Could not create upload staging dir {}: {}",
            config.uploads.staging_dir, e
        );
    }

    let host = if config.server.bind_address == "0.0.0.0" {
        "localhost".to_string()
    } else {
        config.server.bind_address.clone()
    };
    let router = RequestRouter::new(
        hub.clone(),
        registry.clone(),
        sessions.clone(),
        supervisor.clone(),
        pumps,
        host,
    );

    // periodic discovery
    let discovery_registry = registry.clone();
    let discovery_interval = Duration::from_secs(config.discovery.interval_secs);
    let discovery_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // the initial pass already ran
        loop {
            ticker.tick().await;
            discovery_registry.discovery_cycle().await;
        }
    });

    // periodic health broadcast
    let health_router = router.clone();
    let health_sink = sink.clone();
    let health_interval = Duration::from_secs(config.discovery.health_interval_secs);
    let health_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let health = health_router.health().await;
            health_sink.publish(Event::system_health(health)).await;
        }
    });

    let reaper_task = sessions.spawn_reaper();

    let bind = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", bind, e);
            std::process::exit(1);
        }
    };
    let allowlist = OriginAllowlist::from_origins(&config.server.allowed_origins);
    let rate_limit = config.server.rate_limit();
    info!("Device lab ready on {}", bind);

    tokio::select! {
        result = router.serve(listener, allowlist, rate_limit) => {
            if let Err(e) = result {
                error!("Realtime channel failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // staged shutdown: tickers first, then drivers in parallel, then tails
    discovery_task.abort();
    health_task.abort();
    if let Some(task) = reaper_task {
        task.abort();
    }
    supervisor.stop_all().await;
    registry.stop_all_tails().await;
    info!("Device lab shutdown complete");
    Ok(())
}

fn apply_cli_overrides(config: &mut LabConfig, cli: &Cli) {
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(bind) = &cli.bind {
        config.server.bind_address = bind.clone();
    }
    if cli.seed_offline {
        config.discovery.seed_offline_devices = true;
    }
}
