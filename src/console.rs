//! Line-oriented console front-end
//!
//! Reads commands from stdin and prints devices and log entries to stdout.
//! Notifications from the coordinator are written through `tracing`.

use std::fmt::Write as _;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, UiEvent};
use crate::store::{LogEntry, OutletRecord};

const HELP: &str = "\
commands:
  list [filter]                 show outlets, optionally filtered
  log [n]                       show the n newest messages (default 20)
  on|off <device> <outlet>      switch an outlet
  set <device> <outlet> <state> send an arbitrary state
  clear                         clear the message log
  status                        show connection status and settings
  reconnect                     reconnect with the stored settings
  disconnect                    drop the broker session
  help                          show this text
  quit                          exit";

/// Default number of log lines for `log`
const DEFAULT_LOG_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List(Option<String>),
    Log(usize),
    Switch {
        device: String,
        outlet: String,
        state: String,
    },
    Clear,
    Status,
    Reconnect,
    Disconnect,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one console line; blank lines yield `None`
pub fn parse_command(line: &str) -> Result<Option<Command>, ParseError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match (verb.to_lowercase().as_str(), args.as_slice()) {
        ("list" | "ls", []) => Command::List(None),
        ("list" | "ls", rest) => Command::List(Some(rest.join(" "))),
        ("log", []) => Command::Log(DEFAULT_LOG_LINES),
        ("log", [n]) => Command::Log(n.parse().map_err(|_| ParseError::Usage("log [n]"))?),
        ("log", _) => return Err(ParseError::Usage("log [n]")),
        (verb @ ("on" | "off"), [device, outlet]) => Command::Switch {
            device: device.to_string(),
            outlet: outlet.to_string(),
            state: verb.to_uppercase(),
        },
        ("on" | "off", _) => return Err(ParseError::Usage("on|off <device> <outlet>")),
        ("set", [device, outlet, state]) => Command::Switch {
            device: device.to_string(),
            outlet: outlet.to_string(),
            state: state.to_string(),
        },
        ("set", _) => return Err(ParseError::Usage("set <device> <outlet> <state>")),
        ("clear", []) => Command::Clear,
        ("status", []) => Command::Status,
        ("reconnect", []) => Command::Reconnect,
        ("disconnect", []) => Command::Disconnect,
        ("help" | "?", _) => Command::Help,
        ("quit" | "exit", []) => Command::Quit,
        _ => return Err(ParseError::Unknown(verb.to_string())),
    };
    Ok(Some(command))
}

/// Render outlets as a table, showing each device name once
pub fn render_devices(records: &[OutletRecord]) -> String {
    if records.is_empty() {
        return "no outlets seen yet".to_string();
    }

    let width = records
        .iter()
        .map(|r| r.identity.device_name.len())
        .max()
        .unwrap_or(0)
        .max("DEVICE".len());

    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  {:<6}  {:<8}  UPDATED", "DEVICE", "OUTLET", "STATE");
    let mut previous: Option<&str> = None;
    for record in records {
        let device = record.identity.device_name.as_str();
        let shown = if previous == Some(device) { "" } else { device };
        previous = Some(device);
        let _ = writeln!(
            out,
            "{:<width$}  {:<6}  {:<8}  {}",
            shown,
            record.identity.outlet_number,
            record.state,
            record.last_update.format("%H:%M:%S")
        );
    }
    out.trim_end().to_string()
}

pub fn render_log(entries: &[LogEntry]) -> String {
    if entries.is_empty() {
        return "log is empty".to_string();
    }

    entries
        .iter()
        .map(|e| {
            format!(
                "{} {} {} {}",
                e.timestamp.format("%H:%M:%S%.3f"),
                e.direction,
                e.topic,
                e.payload
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read and execute commands until `quit`. A closed stdin leaves the
/// application running until it is signalled.
pub async fn run(coordinator: Arc<Coordinator>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed, console disabled");
                std::future::pending::<()>().await;
                return;
            }
            Err(e) => {
                error!("Failed to read console input: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };

        match parse_command(&line) {
            Ok(Some(Command::Quit)) => return,
            Ok(Some(command)) => execute(&coordinator, command).await,
            Ok(None) => {}
            Err(e) => println!("{}", e),
        }
    }
}

async fn execute(coordinator: &Coordinator, command: Command) {
    match command {
        Command::List(filter) => {
            let records = match filter {
                Some(text) => coordinator.search_devices(&text),
                None => coordinator.devices(),
            };
            println!("{}", render_devices(&records));
        }
        Command::Log(n) => println!("{}", render_log(&coordinator.recent_messages(n))),
        Command::Switch {
            device,
            outlet,
            state,
        } => {
            if let Err(e) = coordinator.send_command(&device, &outlet, &state).await {
                println!("command failed: {}", e);
            }
        }
        Command::Clear => coordinator.clear_log(),
        Command::Status => {
            let settings = coordinator.settings_view();
            println!(
                "{} | {}@{}:{} | subscribed to {}",
                if coordinator.connection_status() {
                    "connected"
                } else {
                    "disconnected"
                },
                settings.username,
                settings.mqtt_server,
                settings.server_port,
                settings.subscribe_string
            );
        }
        Command::Reconnect => {
            if let Err(e) = coordinator.reconnect().await {
                println!("reconnect failed: {}", e);
            }
        }
        Command::Disconnect => coordinator.disconnect().await,
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
}

/// Write coordinator notifications to the log until the sender goes away
pub async fn log_events(mut events: mpsc::Receiver<UiEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            UiEvent::LogEntryAdded(entry) => {
                debug!("{} {} {}", entry.direction, entry.topic, entry.payload)
            }
            UiEvent::DeviceUpdated(record) => info!("{} is {}", record.identity, record.state),
            UiEvent::ConnectionStatus(true) => info!("Broker connection up"),
            UiEvent::ConnectionStatus(false) => warn!("Broker connection down"),
            UiEvent::LogCleared => info!("Message log cleared"),
        }
    }
}
