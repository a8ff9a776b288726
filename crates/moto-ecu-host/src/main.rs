//! moto-ecu host controller
//!
//! Wires the node links (serial ports, or the simulated bench with `--demo`)
//! into the control loop and ticks it at the configured cycle period.
//! Operator commands (`reset sensor`, `clear-dyno`, `quit`, ...) are read
//! from stdin; Ctrl-C saves the maps and stops.

mod console;
mod operator;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use moto_ecu_core::config::EcuConfig;
use moto_ecu_core::control::{ControlLoop, CycleOutcome, ShutdownReason};
use moto_ecu_core::demo::DemoBench;
use moto_ecu_core::failover::FailoverCoordinator;
use moto_ecu_core::fuel_map::{FuelMapStore, Profile};
use moto_ecu_core::persist::{persistence, PERSIST_QUEUE_DEPTH};
use moto_ecu_core::protocol::{list_ports, open_link};

use console::ConsoleIo;
use operator::{spawn_stdin_reader, OperatorCommand};

/// Battery voltage reported when no supply sensing is wired up
const NOMINAL_BATTERY_VOLTAGE: f64 = 12.6;

const OPERATOR_QUEUE_DEPTH: usize = 8;

/// Adaptive motorcycle ECU host controller.
///
/// Example:
///   moto-ecu --config /etc/moto-ecu.json --profile performance
///   moto-ecu --demo --fail-sensor-after 30
///
/// While running, type `reset sensor` after a failover to hand the role
/// back to the primary node, or `quit` to save and stop.
#[derive(Debug, Parser)]
#[command(name = "moto-ecu", version, about = "Adaptive motorcycle ECU host controller")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the persisted fuel maps (overrides the config file).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Tuning profile at startup: efficiency or performance.
    #[arg(short, long, value_parser = parse_profile)]
    profile: Option<Profile>,

    /// Run against simulated nodes instead of serial ports.
    #[arg(long, default_value_t = false)]
    demo: bool,

    /// Silence the simulated sensor node after this many seconds.
    #[arg(long, requires = "demo")]
    fail_sensor_after: Option<u64>,

    /// Hold the dyno-mode request input (and feed dyno data in demo mode).
    #[arg(long, default_value_t = false)]
    dyno: bool,

    /// Print the available serial ports and exit.
    #[arg(long, default_value_t = false)]
    list_ports: bool,

    /// Write the default configuration to PATH and exit.
    #[arg(long, value_name = "PATH")]
    write_default_config: Option<PathBuf>,
}

fn parse_profile(value: &str) -> Result<Profile, String> {
    match value.to_ascii_lowercase().as_str() {
        "efficiency" => Ok(Profile::Efficiency),
        "performance" => Ok(Profile::Performance),
        other => Err(format!("unknown profile '{other}' (expected efficiency or performance)")),
    }
}

fn write_default_config(path: &Path) -> anyhow::Result<()> {
    EcuConfig::default()
        .save(path)
        .with_context(|| format!("writing default config to {}", path.display()))
}

fn build_config(cli: &Cli) -> anyhow::Result<EcuConfig> {
    let mut config = match &cli.config {
        Some(path) => EcuConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            warn!("No configuration file provided, using defaults");
            EcuConfig::default()
        }
    };

    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(profile) = cli.profile {
        config.profile = profile;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_nodes(config: &EcuConfig, cancel: &CancellationToken) -> anyhow::Result<FailoverCoordinator> {
    let ports = &config.ports;
    let open = |label: &str, port: &str| {
        open_link(label, port, ports.baud_rate, ports.write_timeout(), cancel.child_token())
            .with_context(|| format!("opening {label} node on {port}"))
    };

    Ok(FailoverCoordinator::new(
        Box::new(open("sensor", &ports.sensor)?),
        Box::new(open("actuator", &ports.actuator)?),
        Box::new(open("backup", &ports.backup)?),
        config.sensor_limits.clone(),
        config.failover.miss_threshold,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Level is controlled by RUST_LOG (e.g. RUST_LOG=moto_ecu_core=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Some(path) = &cli.write_default_config {
        write_default_config(path)?;
        info!("Default configuration written to {}", path.display());
        return Ok(());
    }

    if cli.list_ports {
        for port in list_ports() {
            match (port.vid, port.pid) {
                (Some(vid), Some(pid)) => println!(
                    "{}  {:04x}:{:04x}  {}",
                    port.name,
                    vid,
                    pid,
                    port.product.unwrap_or_default()
                ),
                _ => println!("{}", port.name),
            }
        }
        return Ok(());
    }

    let config = build_config(&cli)?;
    info!(
        version = moto_ecu_core::VERSION,
        profile = %config.profile,
        data_dir = %config.data_dir.display(),
        demo = cli.demo,
        "moto-ecu starting"
    );

    let cancel = CancellationToken::new();

    let mut bench = None;
    let failover = if cli.demo {
        let mut demo = DemoBench::new();
        demo.set_dyno(cli.dyno);
        if let Some(secs) = cli.fail_sensor_after {
            demo.silence_sensor_after(Duration::from_secs(secs));
        }
        let failover = demo.coordinator(config.sensor_limits.clone(), config.failover.miss_threshold);
        bench = Some(demo);
        failover
    } else {
        open_nodes(&config, &cancel)?
    };

    let period = config.control.cycle_period();
    let render_every = (1000 / config.control.cycle_period_ms.max(1)).max(1) as u32;
    let mut io = ConsoleIo::new(NOMINAL_BATTERY_VOLTAGE, render_every);
    io.hold_dyno_request(cli.dyno);
    let power = io.power_flag();

    let (persist_handle, persist_worker) =
        persistence(FuelMapStore::new(&config.data_dir), PERSIST_QUEUE_DEPTH);
    let worker_task = tokio::spawn(persist_worker.run(cancel.child_token()));

    let mut ecu = ControlLoop::new(&config, failover, io)
        .context("starting control loop")?
        .with_persistence(persist_handle);

    let interrupt = CancellationToken::new();
    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received");
                    interrupt.cancel();
                }
                Err(e) => warn!("cannot listen for interrupts: {e}"),
            }
        });
    }
    let mut operator = spawn_stdin_reader(OPERATOR_QUEUE_DEPTH);

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();

    let reason = loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = interrupt.cancelled() => break ShutdownReason::Requested,
            Some(command) = operator.recv() => {
                info!(?command, "operator command");
                match command {
                    OperatorCommand::Reset(role) => ecu.reset_role(role),
                    OperatorCommand::ClearDyno => {
                        ecu.io_mut().hold_dyno_request(false);
                        ecu.clear_dyno_mode();
                    }
                    OperatorCommand::Profile(profile) => ecu.set_profile(profile),
                    OperatorCommand::PowerOff => power.store(false, Ordering::SeqCst),
                    OperatorCommand::Quit => break ShutdownReason::Requested,
                }
                continue;
            }
        }

        let now = Instant::now();
        let dt = now - last;
        last = now;

        if let Some(bench) = bench.as_mut() {
            bench.step(dt);
            ecu.io_mut().set_battery_voltage(bench.battery_voltage());
        }

        if let CycleOutcome::Shutdown(reason) = ecu.run_cycle(dt) {
            break reason;
        }
    };

    // no-op when the cycle already shut down; reports the reason it stopped with
    let reason = match ecu.shutdown(reason) {
        CycleOutcome::Shutdown(stopped) => stopped,
        CycleOutcome::Continue => reason,
    };
    if let Some(bench) = &bench {
        info!(
            fired = bench.commands_fired(),
            by_backup = bench.backup_fired(),
            "demo bench totals"
        );
    }

    cancel.cancel();
    if let Err(e) = worker_task.await {
        warn!("persistence worker ended abnormally: {e}");
    }
    info!("moto-ecu stopped: {reason}");
    Ok(())
}
