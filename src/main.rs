//! powercontrol - console front-end for MQTT power strips

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use powercontrol::config::{Config, PlaintextCipher, SettingsFile, SettingsUpdate};
use powercontrol::console;
use powercontrol::mqtt::RumqttTransport;
use powercontrol::{Coordinator, CoordinatorOptions, Result};

#[tokio::main]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if std::env::var("DEBUG")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
        {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        error!("Fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    if config.debug {
        info!("Debug mode enabled");
    }
    info!("Settings file: {}", config.settings_path.display());

    let transport = Arc::new(RumqttTransport::new(&config.mqtt));
    let repository = Arc::new(SettingsFile::new(&config.settings_path));
    let (coordinator, events) = Coordinator::new(
        transport,
        repository,
        Arc::new(PlaintextCipher),
        CoordinatorOptions {
            log_capacity: config.log_capacity,
            timeouts: config.mqtt.timeouts(),
            client_id_prefix: config.mqtt.client_id_prefix.clone(),
        },
    );
    let coordinator = Arc::new(coordinator);

    let events_handle = tokio::spawn(console::log_events(events));

    // Connect in the background so the console is usable right away
    let seed = SettingsUpdate::from_env()?;
    let startup = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            match seed {
                Some(update) => {
                    if let Err(e) = coordinator.save_settings(update).await {
                        warn!("Settings from environment not applied: {}", e);
                    }
                }
                None => coordinator.start().await,
            }
        })
    };

    let console_handle = tokio::spawn(console::run(Arc::clone(&coordinator)));

    info!("powercontrol started, type 'help' for commands");

    tokio::select! {
        _ = console_handle => {
            info!("Console closed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // Cleanup
    startup.abort();
    coordinator.shutdown().await;
    events_handle.abort();

    Ok(())
}
