//! Application coordinator
//!
//! Routes broker traffic through the topic codec into the device store and
//! message log, turns user requests into commands, and tells the UI layer
//! what changed.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::config::{
    BrokerSettings, ConfigError, PasswordCipher, SettingsRepository, SettingsUpdate, SettingsView,
};
use crate::error::{PublishError, Result};
use crate::mqtt::{ConnectionManager, Timeouts, Transport};
use crate::store::{DeviceStore, Direction, LogEntry, MessageLog, OutletRecord, DEFAULT_CAPACITY};
use crate::topic::{decode_payload, decode_status_topic, encode_command_topic, encode_payload};

/// Capacity of the UI notification queue
const EVENT_CAPACITY: usize = 256;

/// Notifications for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum UiEvent {
    LogEntryAdded(LogEntry),
    DeviceUpdated(OutletRecord),
    ConnectionStatus(bool),
    LogCleared,
}

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub log_capacity: usize,
    pub timeouts: Timeouts,
    pub client_id_prefix: String,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_CAPACITY,
            timeouts: Timeouts::default(),
            client_id_prefix: "powercontrol".to_string(),
        }
    }
}

/// Non-blocking sender for UI notifications
#[derive(Clone)]
struct Notifier {
    tx: mpsc::Sender<UiEvent>,
}

impl Notifier {
    /// Never waits: runs on the MQTT delivery task
    fn notify(&self, event: UiEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("UI event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("UI event receiver dropped");
            }
        }
    }
}

pub struct Coordinator {
    manager: ConnectionManager,
    devices: Arc<DeviceStore>,
    log: Arc<MessageLog>,
    notifier: Notifier,
    settings: RwLock<BrokerSettings>,
    repository: Arc<dyn SettingsRepository>,
    cipher: Arc<dyn PasswordCipher>,
    client_id_prefix: String,
    /// Serializes connect sequences (start, reconnect, settings change)
    session_lock: tokio::sync::Mutex<()>,
}

impl Coordinator {
    /// Build the coordinator and the receiver for its UI notifications.
    ///
    /// Unreadable persisted settings are logged and replaced by defaults.
    pub fn new(
        transport: Arc<dyn Transport>,
        repository: Arc<dyn SettingsRepository>,
        cipher: Arc<dyn PasswordCipher>,
        options: CoordinatorOptions,
    ) -> (Self, mpsc::Receiver<UiEvent>) {
        let settings = repository.load().unwrap_or_else(|e| {
            warn!("Error loading settings, using defaults: {}", e);
            BrokerSettings::default()
        });

        if cipher.is_plaintext() {
            warn!("Broker password is stored unencrypted in the settings file");
        }

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let notifier = Notifier { tx };
        let devices = Arc::new(DeviceStore::new());
        let log = Arc::new(MessageLog::new(options.log_capacity));
        let manager = ConnectionManager::new(transport, options.timeouts);

        {
            let devices = Arc::clone(&devices);
            let log = Arc::clone(&log);
            let notifier = notifier.clone();
            manager.on_message(move |topic, payload| {
                process_inbound(&devices, &log, &notifier, topic, payload)
            });
        }
        {
            let notifier = notifier.clone();
            manager.on_status(move |connected| {
                notifier.notify(UiEvent::ConnectionStatus(connected))
            });
        }

        let coordinator = Self {
            manager,
            devices,
            log,
            notifier,
            settings: RwLock::new(settings),
            repository,
            cipher,
            client_id_prefix: options.client_id_prefix,
            session_lock: tokio::sync::Mutex::new(()),
        };
        (coordinator, rx)
    }

    /// Connect with the stored settings, if there are any.
    ///
    /// A failed attempt is logged and leaves the session disconnected.
    pub async fn start(&self) {
        if self.is_config_empty() {
            info!("No broker configured, waiting for settings");
            return;
        }

        let _guard = self.session_lock.lock().await;
        if let Err(e) = self.connect_current().await {
            warn!("Auto-connect failed: {}", e);
        }
    }

    /// Drop the current session and connect again with the stored settings
    pub async fn reconnect(&self) -> Result<()> {
        let _guard = self.session_lock.lock().await;
        self.manager.disconnect().await;
        self.connect_current().await
    }

    /// Persist new settings and move the session over to them.
    ///
    /// Devices seen on the previous broker are forgotten; the message log is
    /// kept.
    pub async fn save_settings(&self, update: SettingsUpdate) -> Result<()> {
        let settings = update.into_settings(self.cipher.as_ref())?;
        self.repository.save(&settings)?;
        info!(
            "Saved settings for {}:{}",
            settings.mqtt_server, settings.server_port
        );

        let _guard = self.session_lock.lock().await;
        *self.settings.write() = settings;
        self.manager.disconnect().await;
        self.devices.clear();
        self.connect_current().await
    }

    async fn connect_current(&self) -> Result<()> {
        let settings = self.settings.read().clone();
        if settings.mqtt_server.is_empty() {
            return Err(ConfigError::NoServer.into());
        }
        let port = settings.port()?;
        let password = settings.password(self.cipher.as_ref())?;

        self.manager
            .connect(
                &settings.mqtt_server,
                port,
                &settings.username,
                &password,
                &self.client_id_prefix,
            )
            .await?;
        self.manager.subscribe(&settings.subscribe_string).await?;
        Ok(())
    }

    /// Switch an outlet. Logged only once the client has taken the message.
    pub async fn send_command(
        &self,
        device: &str,
        outlet: &str,
        desired_state: &str,
    ) -> std::result::Result<(), PublishError> {
        let topic = encode_command_topic(device, outlet);
        let payload = encode_payload(desired_state);

        if let Err(e) = self.manager.publish(&topic, &payload).await {
            warn!("Failed to send command to {}: {}", topic, e);
            return Err(e);
        }

        info!("Sent {} to {}", payload, topic);
        let entry = self.log.append(Direction::Sent, &topic, &payload);
        self.notifier.notify(UiEvent::LogEntryAdded(entry));
        Ok(())
    }

    pub async fn disconnect(&self) {
        let _guard = self.session_lock.lock().await;
        self.manager.disconnect().await;
    }

    pub async fn shutdown(&self) {
        self.disconnect().await;
    }

    pub fn devices(&self) -> Vec<OutletRecord> {
        self.devices.all()
    }

    pub fn search_devices(&self, text: &str) -> Vec<OutletRecord> {
        self.devices.filter(text)
    }

    pub fn messages(&self) -> Vec<LogEntry> {
        self.log.all()
    }

    pub fn recent_messages(&self, n: usize) -> Vec<LogEntry> {
        self.log.recent(n)
    }

    pub fn clear_log(&self) {
        self.log.clear();
        self.notifier.notify(UiEvent::LogCleared);
    }

    pub fn connection_status(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn settings_view(&self) -> SettingsView {
        self.settings.read().view()
    }

    pub fn is_config_empty(&self) -> bool {
        self.settings.read().is_empty()
    }
}

/// Handle one inbound message: always logged, applied to the device store
/// only when the topic is a status topic
fn process_inbound(
    devices: &DeviceStore,
    log: &MessageLog,
    notifier: &Notifier,
    topic: &str,
    payload: &str,
) {
    let entry = log.append(Direction::Received, topic, payload);
    notifier.notify(UiEvent::LogEntryAdded(entry));

    let identity = match decode_status_topic(topic) {
        Ok(identity) => identity,
        Err(e) => {
            debug!("Not a status update: {}", e);
            return;
        }
    };

    let record = devices.upsert(identity, decode_payload(payload));
    debug!("{} is now {}", record.identity, record.state);
    notifier.notify(UiEvent::DeviceUpdated(record));
}
