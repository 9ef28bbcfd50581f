//! PROFINET IO controller daemon.
//!
//! `discover` lists the devices answering an identify request.
//! `run` connects every configured device and supervises the
//! connections until SIGINT or SIGTERM.

mod signals;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pnio_common::config::ControllerConfig;
use pnio_common::mac::MacAddress;
use pnio_common::state::ConnectionState;
use pnio_fieldbus::{ConnectionManager, Discoverer, EthernetLink, SimulatedLink};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::signals::{wait_for_shutdown, SignalHandler};

/// Controller address used by `--simulated` when none is configured.
const SIMULATED_MAC: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

/// Daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "pnio-daemon",
    about = "PROFINET IO controller - discover devices and run cyclic exchange",
    version,
    long_about = None
)]
struct Args {
    /// Path to a controller configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info", global = true)]
    log_level: String,

    /// Network interface (overrides config file).
    #[arg(long, short = 'i', value_name = "IFACE", global = true)]
    interface: Option<String>,

    /// Use an in-memory link instead of a network interface.
    #[arg(long, short = 's', global = true)]
    simulated: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send an identify request and print the answering devices as JSON.
    Discover {
        /// Only devices with this station name.
        #[arg(long, short = 'n')]
        name: Option<String>,

        /// How long to collect responses (e.g. "2s").
        #[arg(long, short = 't', value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
    },
    /// Connect all configured devices and supervise them.
    Run {
        /// Interval between periodic status reports.
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        status_interval: Duration,

        /// Delay before a failed device is connected again.
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        retry_interval: Duration,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting PROFINET IO controller");

    // Before any other thread exists, so every thread inherits the mask
    let signal_handler = SignalHandler::install().context("Failed to set up signal handlers")?;

    let mut config = load_config(&args)?;
    if let Some(interface) = &args.interface {
        config.interface = Some(interface.clone());
    }
    config.validate().context("Invalid configuration")?;

    info!(
        interface = ?config.interface,
        devices = config.devices.len(),
        cycle_time = ?config.cyclic.cycle_interval(),
        simulated = args.simulated,
        "Configuration loaded"
    );

    let link = open_link(&config, args.simulated)?;

    match args.command {
        Command::Discover { name, timeout } => {
            let timeout = timeout.unwrap_or(config.discovery.timeout);
            run_discover(&config, link, name.as_deref(), timeout)
        }
        Command::Run {
            status_interval,
            retry_interval,
        } => run_controller(config, link, &signal_handler, status_interval, retry_interval),
    }
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("pnio_daemon={level},pnio_fieldbus={level},pnio_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `PNIO_CONFIG_PATH` environment variable
/// 3. `/etc/pnio/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<ControllerConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return ControllerConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("PNIO_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from PNIO_CONFIG_PATH");
            return ControllerConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from PNIO_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "PNIO_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/pnio/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return ControllerConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(ControllerConfig::default())
}

/// Open the raw Ethernet link the controller talks through.
fn open_link(config: &ControllerConfig, simulated: bool) -> Result<Arc<dyn EthernetLink>> {
    if simulated {
        let mac = config.controller_mac.unwrap_or(SIMULATED_MAC);
        info!(%mac, "Using simulated link");
        return Ok(Arc::new(SimulatedLink::new(mac)));
    }

    let Some(interface) = config.interface.as_deref() else {
        bail!("no network interface configured (use --interface or --simulated)");
    };
    open_interface(interface, config.controller_mac)
}

#[cfg(target_os = "linux")]
fn open_interface(interface: &str, mac: Option<MacAddress>) -> Result<Arc<dyn EthernetLink>> {
    let link = pnio_fieldbus::ethernet::PacketSocketLink::open(interface, mac)
        .with_context(|| format!("Failed to open interface {interface}"))?;
    Ok(Arc::new(link))
}

#[cfg(not(target_os = "linux"))]
fn open_interface(interface: &str, _mac: Option<MacAddress>) -> Result<Arc<dyn EthernetLink>> {
    bail!("raw Ethernet access to {interface} is only supported on Linux (use --simulated)")
}

fn run_discover(
    config: &ControllerConfig,
    link: Arc<dyn EthernetLink>,
    name: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    let discoverer = Discoverer::new(link, config.discovery.response_delay);
    let found = discoverer
        .discover(name, timeout)
        .context("Identify request failed")?;
    info!(count = found.len(), "Discovery complete");

    let json = serde_json::to_string_pretty(&found).context("Failed to encode devices")?;
    println!("{json}");
    Ok(())
}

/// How often the supervision loop checks input watchdogs.
fn supervision_interval(config: &ControllerConfig) -> Duration {
    (config.cyclic.watchdog_timeout() / 2)
        .clamp(Duration::from_millis(5), Duration::from_millis(100))
}

fn run_controller(
    config: ControllerConfig,
    link: Arc<dyn EthernetLink>,
    signal_handler: &SignalHandler,
    status_interval: Duration,
    retry_interval: Duration,
) -> Result<()> {
    let tick = supervision_interval(&config);
    let manager =
        ConnectionManager::new(config, link).context("Failed to start connection manager")?;
    let added = manager
        .add_configured_devices()
        .context("Failed to add configured devices")?;
    info!(devices = added, rpc = ?manager.rpc_addr().ok(), "Controller ready");

    let needs_address = manager.devices().iter().any(|d| !d.identity.is_resolved());
    if needs_address {
        if let Err(e) = manager.discover(None) {
            warn!(error = %e, "Initial discovery failed, devices will be resolved on connect");
        }
    }

    let mut last_attempt: HashMap<String, Instant> = HashMap::new();
    let mut last_status = Instant::now();

    while !signal_handler.shutdown_requested() {
        for snapshot in manager.devices() {
            let name = snapshot.identity.station_name.clone();
            if matches!(snapshot.state, ConnectionState::Offline | ConnectionState::Error) {
                let due = last_attempt
                    .get(&name)
                    .map_or(true, |at| at.elapsed() >= retry_interval);
                if due && !signal_handler.shutdown_requested() {
                    last_attempt.insert(name.clone(), Instant::now());
                    match manager.connect(&name) {
                        Ok(()) => info!(device = %name, "Device running"),
                        Err(e) => warn!(
                            device = %name,
                            error = %e,
                            retry_in = %humantime::format_duration(retry_interval),
                            "Connect failed"
                        ),
                    }
                }
            }
        }

        for name in manager.supervise() {
            warn!(device = %name, "Input watchdog expired");
        }

        if signal_handler.take_status_request() || last_status.elapsed() >= status_interval {
            log_status(&manager);
            last_status = Instant::now();
        }

        wait_for_shutdown(signal_handler, tick);
    }

    info!("Shutting down...");
    manager.shutdown();
    log_status(&manager);
    info!(
        signals = signal_handler.state().signal_count(),
        last_signal = ?signal_handler.state().last_signal(),
        "Daemon shutdown complete"
    );
    Ok(())
}

fn log_status(manager: &ConnectionManager) {
    let status = manager.status();
    info!(
        devices = status.devices,
        running = status.running,
        connecting = ?status.connecting,
        "Periodic status"
    );
    for stats in manager.cyclic_stats() {
        debug!(
            device = %stats.device,
            valid = stats.valid,
            counter = stats.counter,
            sent = stats.frames_sent,
            received = stats.frames_received,
            errors = stats.error_count,
            alarms = stats.alarms_acknowledged,
            "Cyclic exchange"
        );
    }
}
