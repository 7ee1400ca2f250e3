// intrusion-monitor
//
// Command line front end: list ports, watch the sensor live, and query or
// clear the recorded motion history.
//
// Quit monitor mode with Ctrl-C.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::broadcast::error::RecvError;

use intrusion_monitor_lib::commands::{self, ConnectRequest};
use intrusion_monitor_lib::{init, stop_file_logging, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "intrusion-monitor",
    version,
    about = "Motion monitor for a serial PIR sensor"
)]
struct Cli {
    /// Settings file (defaults to the platform config dir)
    #[arg(long, global = true, value_name = "PATH")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available serial ports
    Ports,
    /// Connect and print live notifications as JSON lines until Ctrl-C
    Monitor {
        /// Serial port (defaults to the configured port)
        #[arg(long, value_name = "PORT")]
        port: Option<String>,
        /// Baud rate (defaults to the configured rate)
        #[arg(long, value_name = "BAUD")]
        baud: Option<u32>,
    },
    /// Show the most recent recorded events
    Events {
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    /// Motion totals and the last recorded event
    Stats,
    /// Delete all recorded events
    Clear,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let line = serde_json::to_string(value).map_err(|e| format!("Failed to serialize output: {}", e))?;
    println!("{}", line);
    Ok(())
}

async fn monitor(state: &AppState, port: Option<String>, baud: Option<u32>) -> Result<(), String> {
    let mut rx = state.manager.subscribe();

    let response = commands::connect(
        state,
        ConnectRequest {
            port,
            baud_rate: baud,
        },
    )
    .await;

    if !response.success {
        while let Ok(notification) = rx.try_recv() {
            print_json(&notification)?;
        }
        return Err("Connection failed".to_string());
    }

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(notification) => print_json(&notification)?,
                Err(RecvError::Lagged(missed)) => {
                    eprintln!("[monitor] Output fell behind, {} notifications dropped", missed);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    commands::disconnect(state).await;
    while let Ok(notification) = rx.try_recv() {
        print_json(&notification)?;
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), String> {
    let state = init(cli.settings.as_deref())?;

    match cli.command {
        Command::Ports => {
            for name in commands::list_ports(&state)? {
                println!("{}", name);
            }
        }
        Command::Monitor { port, baud } => monitor(&state, port, baud).await?,
        Command::Events { limit } => {
            for event in commands::recent_events(&state, limit)? {
                print_json(&event)?;
            }
        }
        Command::Stats => print_json(&commands::stats(&state)?)?,
        Command::Clear => {
            let response = commands::clear_events(&state);
            print_json(&response)?;
            if let Some(error) = response.error {
                return Err(error);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = run(cli).await;
    stop_file_logging();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
