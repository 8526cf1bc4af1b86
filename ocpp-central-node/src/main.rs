//! OCPP Central Node - stand-alone central system for bench testing
//!
//! Accepts OCPP 1.6-J charge points, optionally drives the first one through
//! a few triggers, then keeps serving.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port
//! ocpp-central-node
//!
//! # Trigger a boot and a heartbeat once a charge point connects
//! ocpp-central-node --port 9000 --trigger BootNotification --trigger Heartbeat
//!
//! # Dim the light ring of the first charge point
//! ocpp-central-node --light-intensity 20 --log-level debug
//! ```

use std::time::Duration;

use clap::Parser;
use ocpp_central::{CentralSystem, CentralSystemConfig, MessageTrigger};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// OCPP 1.6 central system stand-in
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    addr: String,

    /// Port to listen on
    #[arg(short, long, default_value = "9000")]
    port: u16,

    /// Message to trigger on the first charge point (can be repeated)
    #[arg(short, long)]
    trigger: Vec<String>,

    /// Seconds to wait for each triggered message
    #[arg(long, default_value = "1.0")]
    wait_timeout: f64,

    /// Seconds to wait for a charge point's answer to our requests
    #[arg(long, default_value = "30")]
    response_timeout: u64,

    /// Heartbeat interval handed to booting charge points
    #[arg(long, default_value = "5")]
    heartbeat_interval: i32,

    /// Light intensity (0-100) to set on the first charge point
    #[arg(long)]
    light_intensity: Option<i64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    for name in &args.trigger {
        if name.parse::<MessageTrigger>().is_err() {
            return Err(format!("{} is not triggerable", name).into());
        }
    }
    let wait_timeout = Duration::try_from_secs_f64(args.wait_timeout)?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║           OCPP Central Node - Central System Stand-in        ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:   {:<50} ║", format!("ws://{}:{}/<id>", args.addr, args.port));
    println!("║  Protocol: {:<50} ║", "ocpp1.6");
    println!("║  Triggers: {:<50} ║", truncate(&args.trigger.join(", "), 50));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let config = CentralSystemConfig::default()
        .with_response_timeout(Duration::from_secs(args.response_timeout))
        .with_heartbeat_interval(args.heartbeat_interval);
    let system = CentralSystem::new(config);
    system.serve(&args.addr, args.port)?;

    info!("Waiting for a charge point...");
    let cp = system.wait_for_connection();
    let session = system.find_session(&cp)?;

    if let Some(percent) = args.light_intensity {
        match session.set_light_intensity(percent) {
            Ok(()) => info!("Light intensity of {} set to {}", cp, percent),
            Err(e) => error!("Setting light intensity failed: {}", e),
        }
    }

    for name in &args.trigger {
        session.add_trap(name);
        if let Err(e) = session.trigger_message(name) {
            error!("Trigger {} failed: {}", name, e);
            continue;
        }
        match session.wait_message(Some(name), wait_timeout) {
            Ok(msg) => info!("Received triggered {:?}", msg),
            Err(e) => warn!("{}", e),
        }
    }

    // Keep serving; report later arrivals.
    loop {
        let cp = system.wait_for_connection();
        info!("Charge point {} connected, {} live", cp, system.session_ids().len());
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
