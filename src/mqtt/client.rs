//! rumqttc-backed transport
//!
//! Opens MQTT 3.1.1 sessions with clean-session semantics, optionally over
//! TLS. The event loop is driven by the connection manager's delivery task
//! through [`RumqttEvents`].

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    QoS, SubscribeReasonCode, TlsConfiguration,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ClientConfig;
use tracing::{debug, info, warn};

use crate::config::{MqttConfig, TlsConfig};
use crate::error::{ConnectError, PublishError, SubscribeError};

use super::session::{EventSource, Session, SessionEvent, SessionHandle, SessionOptions, Transport};

/// Capacity of rumqttc's request channel
const REQUEST_CAPACITY: usize = 100;

/// Power strips speak plain QoS 0
const QOS: QoS = QoS::AtMostOnce;

/// Transport that dials a real broker with rumqttc
#[derive(Debug, Clone)]
pub struct RumqttTransport {
    keep_alive: Duration,
    reconnect_delay: Duration,
    tls: Option<TlsConfig>,
}

impl RumqttTransport {
    pub fn new(config: &MqttConfig) -> Self {
        Self {
            keep_alive: config.keep_alive,
            reconnect_delay: config.reconnect_delay,
            tls: config.tls.clone(),
        }
    }
}

impl Transport for RumqttTransport {
    fn open(&self, options: &SessionOptions) -> Result<Session, ConnectError> {
        let mut mqtt = MqttOptions::new(&options.client_id, &options.host, options.port);
        mqtt.set_keep_alive(self.keep_alive);
        // Subscriptions do not survive a reconnect; the manager re-issues them.
        mqtt.set_clean_session(true);

        if !options.username.is_empty() {
            mqtt.set_credentials(&options.username, &options.password);
        }

        if let Some(tls) = &self.tls {
            let config = build_tls_config(tls)?;
            mqtt.set_transport(rumqttc::Transport::tls_with_config(
                TlsConfiguration::Rustls(Arc::new(config)),
            ));
            info!("MQTT TLS enabled");
        }

        let (client, eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);

        Ok(Session {
            handle: Arc::new(RumqttHandle { client }),
            events: Box::new(RumqttEvents {
                eventloop,
                reconnect_delay: self.reconnect_delay,
                backoff: false,
            }),
        })
    }
}

struct RumqttHandle {
    client: AsyncClient,
}

#[async_trait]
impl SessionHandle for RumqttHandle {
    async fn subscribe(&self, filter: &str) -> Result<(), SubscribeError> {
        debug!("Subscribing to {}", filter);
        self.client
            .subscribe(filter, QOS)
            .await
            .map_err(|e| SubscribeError::Transport(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        debug!("Publishing to {}: {}", topic, payload);
        self.client
            .publish(topic, QOS, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
    }
}

/// Polls the rumqttc event loop and translates what matters
struct RumqttEvents {
    eventloop: EventLoop,
    reconnect_delay: Duration,
    /// Set after a failed poll; the next poll re-dials after a pause
    backoff: bool,
}

#[async_trait]
impl EventSource for RumqttEvents {
    async fn next_event(&mut self) -> SessionEvent {
        loop {
            if std::mem::take(&mut self.backoff) {
                tokio::time::sleep(self.reconnect_delay).await;
            }

            match self.eventloop.poll().await {
                Ok(Event::Incoming(incoming)) => match incoming {
                    Incoming::ConnAck(_) => return SessionEvent::Connected,
                    Incoming::Publish(publish) => {
                        return SessionEvent::Message {
                            topic: publish.topic.clone(),
                            payload: String::from_utf8_lossy(&publish.payload).to_string(),
                        }
                    }
                    Incoming::SubAck(ack) => {
                        let granted = !ack
                            .return_codes
                            .iter()
                            .any(|code| matches!(code, SubscribeReasonCode::Failure));
                        return SessionEvent::SubAck { granted };
                    }
                    Incoming::Disconnect => {
                        self.backoff = true;
                        return SessionEvent::LinkLost("broker closed the session".to_string());
                    }
                    _ => {}
                },
                Ok(Event::Outgoing(_)) => {}
                Err(ConnectionError::ConnectionRefused(code)) => {
                    self.backoff = true;
                    return SessionEvent::Refused(refusal(code));
                }
                Err(e) => {
                    warn!("MQTT event loop error: {}", e);
                    self.backoff = true;
                    return SessionEvent::LinkLost(e.to_string());
                }
            }
        }
    }
}

fn refusal(code: ConnectReturnCode) -> ConnectError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            ConnectError::AuthFailed(format!("{:?}", code))
        }
        other => ConnectError::Unreachable(format!("connection refused: {:?}", other)),
    }
}

/// Build the rustls client configuration
fn build_tls_config(config: &TlsConfig) -> Result<ClientConfig, ConnectError> {
    let mut roots = rustls::RootCertStore::empty();
    match &config.ca_file {
        Some(ca_file) => {
            for cert in load_certs(ca_file)? {
                roots
                    .add(cert)
                    .map_err(|e| ConnectError::Setup(format!("bad CA certificate: {}", e)))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    match (&config.cert_file, &config.key_file) {
        (Some(cert_file), Some(key_file)) => builder
            .with_client_auth_cert(load_certs(cert_file)?, load_private_key(key_file)?)
            .map_err(|e| ConnectError::Setup(format!("bad client certificate: {}", e))),
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConnectError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConnectError::Setup(format!("{}: {}", path.display(), e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConnectError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ConnectError::Setup(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| ConnectError::Setup(format!("no private key in {}", path.display())))
}

fn open_pem(path: &Path) -> Result<BufReader<File>, ConnectError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ConnectError::Setup(format!("cannot open {}: {}", path.display(), e)))
}
