//! CLI entry point for brewbot
//!
//! Drives the orchestrator against the device backend (or the in-process mock
//! with `--mock`) and prints the resulting store state.
//!
//! # Usage
//!
//! ```bash
//! brewbot ports
//! brewbot init /dev/ttyUSB0 --baudrate 9600 --pins 7,in,d,a0,out,a
//! brewbot heat-plate on
//! brewbot watch
//! ```

use anyhow::{Context, Result};
use brewbot::api::{DeviceApi, HttpDeviceApi, MockDeviceApi};
use brewbot::config::{AppConfig, DEFAULT_CONFIG_PATH};
use brewbot::events::{Actuator, Switch};
use brewbot::orchestrator::{Orchestrator, OrchestratorHandle};
use brewbot::session::{PinConfig, SessionParams};
use brewbot::store::Store;
use brewbot::telemetry::{self, OutputFormat, TracingConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "brewbot")]
#[command(about = "Session orchestration for brewing hardware behind a device backend", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the in-process mock backend instead of HTTP
    #[arg(long, global = true)]
    mock: bool,

    /// Log output format (pretty, compact, json); overrides the config file
    #[arg(long, global = true)]
    log_format: Option<OutputFormat>,

    /// Disable colored log output
    #[arg(long, global = true)]
    no_color: bool,

    /// Log when each backend call starts and ends
    #[arg(long, global = true)]
    trace_calls: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports visible to the backend
    Ports,

    /// Open a remote session on a port
    Init {
        /// Port name as listed by `ports`
        port: String,

        /// Serial speed (defaults to the `[session]` config value)
        #[arg(long)]
        baudrate: Option<u32>,

        /// Pin configuration, `id,mode,kind[,id,mode,kind...]`
        #[arg(long)]
        pins: Option<PinConfig>,
    },

    /// Close the remote session on a port
    Shutdown {
        /// Port name
        port: String,
    },

    /// Switch the heat plate relay (or read it back when no position is given)
    HeatPlate {
        /// on | off
        switch: Option<Switch>,
    },

    /// Switch the motor relay (or read it back when no position is given)
    Motor {
        /// on | off
        switch: Option<Switch>,
    },

    /// Read the temperature probe
    Temp,

    /// List remotes registered on the backend
    Remotes,

    /// Start the pollers and log every state change until Ctrl+C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }
    config.validate()?;
    telemetry::init(
        TracingConfig::from_app_config(&config)?
            .with_ansi(!cli.no_color)
            .with_span_events(cli.trace_calls),
    )?;

    let api: Arc<dyn DeviceApi> = if cli.mock {
        info!("using mock backend");
        Arc::new(MockDeviceApi::with_ports(["/dev/ttyUSB0", "/dev/ttyACM0"]))
    } else {
        let http = HttpDeviceApi::from_config(&config.backend)?;
        info!(base_url = %http.base_url(), "using HTTP backend");
        Arc::new(http)
    };
    let handle = Orchestrator::spawn(api, &config.orchestrator);

    let result = run(&cli.command, &handle, &config).await;
    handle.shutdown().await?;
    result
}

async fn run(command: &Commands, handle: &OrchestratorHandle, config: &AppConfig) -> Result<()> {
    match command {
        Commands::Ports => {
            let store = refresh_ports(handle).await?;
            for port in store.ports.values() {
                println!("{}\t{}", port.name, port.status);
            }
        }
        Commands::Init {
            port,
            baudrate,
            pins,
        } => {
            let mut params = config.session.clone();
            if let Some(baudrate) = baudrate {
                params.baudrate = *baudrate;
            }
            if let Some(pins) = pins {
                params.pins = pins.clone();
            }
            init(handle, port, params).await?;
        }
        Commands::Shutdown { port } => {
            refresh_ports(handle).await?;
            handle.shutdown_port(port.as_str()).await?;
            let store = handle.settle().await?;
            report_port(&store, port)?;
        }
        Commands::HeatPlate { switch } => relay(handle, Actuator::HeatPlate, *switch).await?,
        Commands::Motor { switch } => relay(handle, Actuator::Motor, *switch).await?,
        Commands::Temp => {
            handle.poll_temperature().await?;
            let store = handle.settle().await?;
            if let Some(error) = &store.temperature.last_error {
                anyhow::bail!("temperature read failed: {}", error);
            }
            print_json(&store.temperature.reading)?;
        }
        Commands::Remotes => {
            handle.fetch_remotes().await?;
            let store = handle.settle().await?;
            if let Some(error) = &store.remotes_error {
                anyhow::bail!("listing remotes failed: {}", error);
            }
            print_json(&store.remotes)?;
        }
        Commands::Watch => watch(handle, config).await?,
    }
    Ok(())
}

async fn refresh_ports(handle: &OrchestratorHandle) -> Result<Store> {
    handle.fetch_ports().await?;
    let store = handle.settle().await?;
    if let Some(error) = &store.error {
        anyhow::bail!("listing ports failed: {}", error);
    }
    Ok(store)
}

async fn init(handle: &OrchestratorHandle, port: &str, params: SessionParams) -> Result<()> {
    refresh_ports(handle).await?;
    handle.init_port(port, params).await?;
    let store = handle.settle().await?;
    report_port(&store, port)
}

fn report_port(store: &Store, name: &str) -> Result<()> {
    let port = store
        .port(name)
        .with_context(|| format!("port {} disappeared", name))?;
    if let Some(error) = &port.last_error {
        anyhow::bail!("{}: {}", name, error);
    }
    println!("{}\t{}", port.name, port.status);
    if let Some(remote) = &port.remote {
        print_json(remote)?;
    }
    Ok(())
}

async fn relay(handle: &OrchestratorHandle, actuator: Actuator, switch: Option<Switch>) -> Result<()> {
    match switch {
        Some(switch) => handle.set_relay(actuator, switch).await?,
        None => handle.poll_actuator(actuator).await?,
    }
    let store = handle.settle().await?;
    let resource = store.actuator(actuator);
    if let Some(error) = &resource.last_error {
        anyhow::bail!("{}: {}", actuator, error);
    }
    println!("{}\t{}", actuator, resource.relay_state);
    Ok(())
}

async fn watch(handle: &OrchestratorHandle, config: &AppConfig) -> Result<()> {
    if let Err(err) = refresh_ports(handle).await {
        warn!(error = %err, "initial port listing failed");
    }

    let mut snapshots = handle.subscribe();
    let mut pollers = handle.start_pollers(&config.polling);
    let mut last = snapshots.borrow_and_update().clone();
    info!("watching, press Ctrl+C to stop");

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let store = snapshots.borrow_and_update().clone();
                log_changes(&last, &store);
                last = store;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    pollers.stop_all().await;
    Ok(())
}

fn log_changes(before: &Store, after: &Store) {
    for actuator in Actuator::ALL {
        let (old, new) = (before.actuator(actuator), after.actuator(actuator));
        if old.relay_state != new.relay_state {
            info!(%actuator, state = %new.relay_state, "relay changed");
        }
        if new.last_error.is_some() && old.last_error != new.last_error {
            warn!(%actuator, error = ?new.last_error, "actuator error");
        }
    }
    if before.temperature.reading != after.temperature.reading {
        if let Some(reading) = after.temperature.reading {
            info!(temp_c = ?reading.temp_c, temp_v = ?reading.temp_v, "temperature");
        }
    }
    if after.temperature.last_error.is_some()
        && before.temperature.last_error != after.temperature.last_error
    {
        warn!(error = ?after.temperature.last_error, "temperature read failed");
    }
    for (name, port) in &after.ports {
        let changed = before
            .port(name)
            .map_or(true, |old| old.status != port.status);
        if changed {
            info!(port = %name, status = %port.status, "port status");
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
