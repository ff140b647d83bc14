//! Whitebeet EV Node - CLI for a single EV charging session
//!
//! Runs the EV side of a DC charging session: control pilot and SLAC
//! bring-up, V2G session start, then charging until the battery is full or
//! the session is stopped.
//!
//! # Usage
//!
//! ```bash
//! # Charge a half-full battery against the simulated station
//! whitebeet-ev-node --simulate --initial-soc 50
//!
//! # Faster simulated time, JSON event output
//! whitebeet-ev-node --simulate --time-multiplier 5000 --json
//!
//! # Custom EV identity and charging inputs
//! whitebeet-ev-node --simulate --mac 02:00:00:00:00:2a --voltage 400 --current 80
//! ```
//!
//! Ctrl-C stops the session cleanly.

use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use whitebeet_core::{LinkConfig, SimulatedPeer};
use whitebeet_ev::{Ev, EvConfig, EvEvent};

/// EV charging session over a Whitebeet module
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// EVCC id as a colon separated MAC address
    #[arg(long, default_value = "02:00:00:00:00:01")]
    mac: String,

    /// Initial state of charge in percent
    #[arg(long, default_value = "30")]
    initial_soc: f64,

    /// Charging voltage (V)
    #[arg(long, default_value = "200")]
    voltage: f64,

    /// Initial charging current (A)
    #[arg(long, default_value = "50")]
    current: f64,

    /// Battery capacity (Wh)
    #[arg(long, default_value = "50000")]
    capacity: f64,

    /// Session loop period in milliseconds
    #[arg(long, default_value = "50")]
    tick_ms: u64,

    /// Simulated seconds per wall-clock second
    #[arg(long, default_value = "1000")]
    time_multiplier: f64,

    /// Run against the built-in simulated charging station
    #[arg(long)]
    simulate: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if !args.simulate {
        return Err("no hardware transport is bundled; run with --simulate".into());
    }

    let config = EvConfig::default()
        .with_mac(&args.mac)?
        .with_initial_soc(args.initial_soc)
        .with_charging_inputs(args.voltage, args.current)
        .with_battery_capacity(args.capacity)
        .with_tick(Duration::from_millis(args.tick_ms))
        .with_time_multiplier(args.time_multiplier);

    if !args.json {
        println!();
        println!("╔══════════════════════════════════════════════════════════════╗");
        println!("║              Whitebeet EV Node - DC Charging Session         ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║  EVCC ID:  {:<50} ║", config.mac_string());
        println!("║  SOC:      {:<50} ║", format!("{:.1} %", args.initial_soc));
        println!("║  Battery:  {:<50} ║", format!("{:.0} Wh", args.capacity));
        println!("║  Charging: {:<50} ║", format!("{:.0} V / {:.0} A", args.voltage, args.current));
        println!("║  Link:     {:<50} ║", "simulated station");
        println!("╚══════════════════════════════════════════════════════════════╝");
        println!();
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let ev = Ev::from_config(
        Box::new(SimulatedPeer::charging_station()),
        LinkConfig::default(),
        config,
    )?
    .with_events(event_tx);
    let stop = ev.stop_handle();

    info!("Starting EV session...");
    let mut session = tokio::task::spawn_blocking(move || ev.run());

    let json = args.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event, json);
        }
    });

    let outcome = tokio::select! {
        joined = &mut session => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl-C received, stopping session");
            stop.stop();
            session.await
        }
    }?;

    // the sender is dropped with the session, which ends the printer
    let _ = printer.await;

    match outcome {
        Ok(summary) => {
            if json {
                println!("{}", serde_json::to_string(&summary)?);
            } else {
                println!();
                println!(
                    "Session {} at {:.1} % SOC, {:.0} Wh delivered",
                    if summary.cancelled { "cancelled" } else { "complete" },
                    summary.final_soc,
                    summary.energy_wh
                );
            }
            Ok(())
        }
        Err(e) => {
            error!("Session failed: {}", e);
            Err(e.into())
        }
    }
}

fn print_event(event: &EvEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Cannot serialize event: {}", e),
        }
        return;
    }

    match event {
        EvEvent::StateChanged { from, to, at } => {
            println!("[{}] {} -> {}", at.format("%H:%M:%S%.3f"), from, to);
        }
        EvEvent::SessionStarted { evse_id, protocol } => {
            println!("  EVSE {} (protocol {})", evse_id, protocol);
        }
        EvEvent::EvseLimits {
            max_voltage,
            max_current,
            max_power,
        } => {
            println!(
                "  EVSE limits: {:.0} V / {:.0} A / {:.0} W",
                max_voltage, max_current, max_power
            );
        }
        EvEvent::ScheduleUpdated { tuple_id, entries } => {
            println!("  Schedule {} with {} entries", tuple_id, entries);
        }
        EvEvent::EvseNotice { kind, max_delay } => {
            println!("  EVSE notification {:?} (max delay {} s)", kind, max_delay);
        }
        EvEvent::BatteryUpdate {
            soc,
            level_wh,
            target_current,
        } => {
            println!(
                "  SOC {:>3} %  {:>8.0} Wh  {:>6.1} A",
                soc, level_wh, target_current
            );
        }
        EvEvent::Failed { reason } => println!("  Failed: {}", reason),
        EvEvent::Finished { soc } => println!("  Finished at {} %", soc),
    }
}
