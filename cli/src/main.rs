// bleport: desktop host for BLE serial ports
//
// Scans for BLE peers and exposes all of them as one byte stream: status and
// notification sentences go to stdout, driver commands are read from stdin.
// Logs go to stderr.

mod ble_host;
mod config;

use anyhow::{Context, Result};
use bleport_core::transport::ble::sentence;
use bleport_core::transport::{BleAdapter, BleContext, BleServerPort};
use bleport_core::{EventLoop, Port};
use clap::{Parser, Subcommand};
use colored::*;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bleport")]
#[command(about = "bleport: BLE peers as a serial byte stream", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for peers and bridge them to stdin/stdout
    Scan {
        /// Override the scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
        /// Use this config file instead of the default one
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print a payload as a framed sentence
    Frame { payload: String },
    /// Check a framed sentence and print its payload
    Verify { line: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Show where the config file lives
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { duration, config } => cmd_scan(duration, config).await,
        Commands::Frame { payload } => cmd_frame(&payload),
        Commands::Verify { line } => cmd_verify(&line),
        Commands::Config { action } => cmd_config(action),
    }
}

async fn cmd_scan(duration: Option<u64>, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = match config_path {
        Some(path) => config::Config::load_from(&path)?,
        None => config::Config::load()?,
    };
    if let Some(secs) = duration {
        config.set("scan_duration_ms", &secs.saturating_mul(1000).to_string())?;
    }

    let adapter = ble_host::BtleplugAdapter::open(tokio::runtime::Handle::current(), config.adapter_index)
        .await
        .context("Failed to open Bluetooth adapter")?;
    let event_loop = EventLoop::start("bleport-events").context("Failed to start event loop")?;
    let context = BleContext::new(
        Arc::new(adapter) as Arc<dyn BleAdapter>,
        event_loop.handle(),
        config.core.clone(),
    );

    eprintln!(
        "{} Scanning for {}",
        "●".bright_green(),
        format!("{:?}", config.core.ble.scan_duration()).bright_cyan()
    );

    // The core blocks on the runtime from its own threads, so it must not run
    // on a runtime worker.
    let server = tokio::task::spawn_blocking(move || BleServerPort::open(context))
        .await
        .context("Scan task failed")??;
    let server = Arc::new(server);

    server.set_listener(Some(Arc::new(|data: &[u8]| {
        let mut stdout = std::io::stdout().lock();
        if stdout.write_all(data).and_then(|_| stdout.flush()).is_err() {
            tracing::debug!("stdout closed, dropping {} bytes", data.len());
        }
    })));

    let bridge = {
        let server = server.clone();
        tokio::task::spawn_blocking(move || pump_stdin(server.as_ref()))
    };

    let interrupted = tokio::select! {
        result = bridge => {
            result.context("Bridge task failed")??;
            false
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!();
            true
        }
    };

    let addresses = server.addresses();
    let closing = server.clone();
    tokio::task::spawn_blocking(move || closing.close())
        .await
        .context("Close task failed")?;
    event_loop.shutdown();

    eprintln!("{} Closed {} peer port(s)", "✓".green(), addresses.len());
    for address in addresses {
        eprintln!("  • {}", address.bright_cyan());
    }

    if interrupted {
        // The stdin reader is still blocked and would hold up runtime shutdown
        std::process::exit(0);
    }
    Ok(())
}

/// Write every stdin line to the server port, CRLF-terminated, until end of input
fn pump_stdin(server: &BleServerPort) -> Result<()> {
    for line in std::io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        let data = format!("{}\r\n", line.trim_end());
        server
            .write(data.as_bytes())
            .map_err(|e| anyhow::anyhow!("Port write failed: {}", e))?;
    }

    server.drain();
    // Leave time for the last commands to reach the peers
    std::thread::sleep(Duration::from_millis(100));
    Ok(())
}

fn cmd_frame(payload: &str) -> Result<()> {
    print!("{}", sentence::frame(payload));
    Ok(())
}

fn cmd_verify(line: &str) -> Result<()> {
    match sentence::verify(line) {
        Some(payload) => {
            println!("{} {}", "✓".green(), payload);
            Ok(())
        }
        None => anyhow::bail!("Bad framing or checksum: {}", line.trim_end()),
    }
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
