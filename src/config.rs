//! Configuration module for powercontrol
//!
//! Runtime tuning comes from environment variables. Broker settings
//! (server, credentials, subscription) are a JSON record persisted on disk.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DecryptError, EncryptError};
use crate::mqtt::Timeouts;

/// Subscription used when none is configured
pub const DEFAULT_SUBSCRIBE_FILTER: &str = "power/#";
/// Standard MQTT port
pub const DEFAULT_PORT: u32 = 1883;

/// Main configuration struct containing all runtime settings
#[derive(Debug, Clone)]
pub struct Config {
    /// Location of the persisted broker settings
    pub settings_path: PathBuf,
    /// Number of messages kept in the message log
    pub log_capacity: usize,
    /// MQTT session tuning
    pub mqtt: MqttConfig,
    /// Enable verbose logging
    pub debug: bool,
}

/// MQTT session tuning
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Prefix for MQTT client IDs
    pub client_id_prefix: String,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub publish_timeout: Duration,
    /// Keep-alive interval negotiated with the broker
    pub keep_alive: Duration,
    /// Pause between reconnect attempts after the link drops
    pub reconnect_delay: Duration,
    /// TLS configuration
    pub tls: Option<TlsConfig>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "powercontrol".to_string(),
            connect_timeout: Duration::from_secs(20),
            subscribe_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(10),
            tls: None,
        }
    }
}

impl MqttConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: self.connect_timeout,
            subscribe: self.subscribe_timeout,
            publish: self.publish_timeout,
        }
    }
}

/// TLS configuration for MQTT
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA bundle; the webpki roots are used when unset
    pub ca_file: Option<PathBuf>,
    /// Client certificate path
    pub cert_file: Option<PathBuf>,
    /// Private key path
    pub key_file: Option<PathBuf>,
}

/// Configuration error type
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
    #[error("invalid server port: {0}")]
    InvalidPort(u32),
    #[error("MQTT server not configured")]
    NoServer,
    #[error("settings file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let tls = if parse_bool("MQTT_TLS", false) {
            Some(TlsConfig {
                ca_file: env::var("MQTT_CAFILE").ok().map(PathBuf::from),
                cert_file: env::var("MQTT_CERTFILE").ok().map(PathBuf::from),
                key_file: env::var("MQTT_KEYFILE").ok().map(PathBuf::from),
            })
        } else {
            None
        };

        let settings_path = env::var("POWERCONTROL_CONFIG")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_settings_path);

        Ok(Config {
            settings_path,
            log_capacity: parse_num("MESSAGE_LOG_CAPACITY", 1000)?,
            mqtt: MqttConfig {
                client_id_prefix: env::var("MQTT_CLIENT_ID_PREFIX")
                    .unwrap_or_else(|_| "powercontrol".to_string()),
                connect_timeout: Duration::from_secs(parse_num("MQTT_CONNECT_TIMEOUT", 20)?),
                subscribe_timeout: Duration::from_secs(parse_num("MQTT_SUBSCRIBE_TIMEOUT", 10)?),
                publish_timeout: Duration::from_secs(parse_num("MQTT_PUBLISH_TIMEOUT", 10)?),
                keep_alive: Duration::from_secs(parse_num("MQTT_KEEP_ALIVE", 5)?),
                reconnect_delay: Duration::from_secs(parse_num("MQTT_RECONNECT_DELAY", 10)?),
                tls,
            },
            debug: parse_bool("DEBUG", false),
        })
    }
}

/// Generate a unique client ID: `<prefix>-<hostname>-<pid>-<unix seconds>`
pub fn client_id(prefix: &str) -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{}-{}-{}-{}", prefix, hostname, pid, timestamp)
}

fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("powercontrol")
        .join("config.json")
}

fn parse_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn parse_num<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name, v)),
        _ => Ok(default),
    }
}

/// Protects the broker password at rest
pub trait PasswordCipher: Send + Sync {
    fn encrypt(&self, secret: &str) -> Result<String, EncryptError>;
    fn decrypt(&self, blob: &str) -> Result<String, DecryptError>;

    /// True when `encrypt` leaves the password readable on disk
    fn is_plaintext(&self) -> bool {
        false
    }
}

/// Stores the password as given. Stand-in until a real key scheme is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextCipher;

impl PasswordCipher for PlaintextCipher {
    fn encrypt(&self, secret: &str) -> Result<String, EncryptError> {
        Ok(secret.to_string())
    }

    fn decrypt(&self, blob: &str) -> Result<String, DecryptError> {
        Ok(blob.to_string())
    }

    fn is_plaintext(&self) -> bool {
        true
    }
}

/// Persisted broker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    pub username: String,
    /// Output of [`PasswordCipher::encrypt`]
    pub password_hash: String,
    pub mqtt_server: String,
    pub server_port: u32,
    pub subscribe_string: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            username: String::new(),
            password_hash: String::new(),
            mqtt_server: String::new(),
            server_port: DEFAULT_PORT,
            subscribe_string: DEFAULT_SUBSCRIBE_FILTER.to_string(),
        }
    }
}

impl BrokerSettings {
    /// Check the port range and fill in the default subscription
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if !(1..=65535).contains(&self.server_port) {
            return Err(ConfigError::InvalidPort(self.server_port));
        }
        if self.subscribe_string.is_empty() {
            self.subscribe_string = DEFAULT_SUBSCRIBE_FILTER.to_string();
        }
        Ok(())
    }

    /// True when there is not enough to attempt a connection
    pub fn is_empty(&self) -> bool {
        self.mqtt_server.is_empty() || self.username.is_empty()
    }

    pub fn port(&self) -> Result<u16, ConfigError> {
        u16::try_from(self.server_port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(ConfigError::InvalidPort(self.server_port))
    }

    pub fn set_password(
        &mut self,
        cipher: &dyn PasswordCipher,
        plaintext: &str,
    ) -> Result<(), EncryptError> {
        self.password_hash = if plaintext.is_empty() {
            String::new()
        } else {
            cipher.encrypt(plaintext)?
        };
        Ok(())
    }

    /// Recover the plaintext password; an empty blob means no password
    pub fn password(&self, cipher: &dyn PasswordCipher) -> Result<String, DecryptError> {
        if self.password_hash.is_empty() {
            return Ok(String::new());
        }
        cipher.decrypt(&self.password_hash)
    }

    /// Settings as shown to the user, without the password
    pub fn view(&self) -> SettingsView {
        SettingsView {
            username: self.username.clone(),
            mqtt_server: self.mqtt_server.clone(),
            server_port: self.server_port,
            subscribe_string: self.subscribe_string.clone(),
        }
    }
}

/// Broker settings minus the password
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    pub username: String,
    pub mqtt_server: String,
    pub server_port: u32,
    pub subscribe_string: String,
}

/// New settings as entered by the user, password in plaintext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub username: String,
    pub password: String,
    pub server: String,
    pub port: u32,
    pub subscribe: String,
}

impl SettingsUpdate {
    /// Settings supplied through `MQTT_HOST` and friends, if `MQTT_HOST` is set
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let server = match env::var("MQTT_HOST") {
            Ok(host) if !host.is_empty() => host,
            _ => return Ok(None),
        };
        let username = env::var("MQTT_USER")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingRequired("MQTT_USER"))?;

        Ok(Some(Self {
            username,
            password: env::var("MQTT_PASSWORD").unwrap_or_default(),
            server,
            port: parse_num("MQTT_PORT", DEFAULT_PORT)?,
            subscribe: env::var("MQTT_SUBSCRIBE").unwrap_or_default(),
        }))
    }

    /// Build the record to persist, protecting the password with `cipher`
    pub fn into_settings(
        self,
        cipher: &dyn PasswordCipher,
    ) -> Result<BrokerSettings, crate::error::Error> {
        let mut settings = BrokerSettings {
            username: self.username,
            password_hash: String::new(),
            mqtt_server: self.server,
            server_port: self.port,
            subscribe_string: self.subscribe,
        };
        settings.set_password(cipher, &self.password)?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Where broker settings are persisted
pub trait SettingsRepository: Send + Sync {
    fn load(&self) -> Result<BrokerSettings, ConfigError>;
    fn save(&self, settings: &BrokerSettings) -> Result<(), ConfigError>;
}

/// JSON settings file
#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsRepository for SettingsFile {
    /// Missing file yields the defaults
    fn load(&self) -> Result<BrokerSettings, ConfigError> {
        if !self.path.exists() {
            debug!("No settings file at {}, using defaults", self.path.display());
            return Ok(BrokerSettings::default());
        }

        let data = fs::read_to_string(&self.path)?;
        let mut settings: BrokerSettings = serde_json::from_str(&data)?;
        settings.validate()?;
        Ok(settings)
    }

    fn save(&self, settings: &BrokerSettings) -> Result<(), ConfigError> {
        let mut settings = settings.clone();
        settings.validate()?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(&settings)?;
        fs::write(&self.path, data)?;
        restrict_permissions(&self.path)?;

        debug!("Saved settings to {}", self.path.display());
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
