//! Scripted transport for tests
//!
//! Every session it opens shares one journal of outbound calls
//! (`subscribe:<filter>`, `subscribe-failed:<filter>`, `publish:<topic>=<payload>`,
//! `close`), and tests inject inbound events with [`MockTransport::emit`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{ConnectError, PublishError, SubscribeError};

use super::session::{EventSource, Session, SessionEvent, SessionHandle, SessionOptions, Transport};

#[derive(Debug, Clone)]
pub(crate) struct Behaviour {
    /// Event queued as soon as a session opens; `None` never answers
    pub on_open: Option<SessionEvent>,
    /// SubAck sent for every accepted subscribe; `None` never answers
    pub suback: Option<bool>,
    /// Number of upcoming subscribe calls that fail locally
    pub subscribe_failures: u32,
    /// Publish never completes
    pub stall_publish: bool,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            on_open: Some(SessionEvent::Connected),
            suback: Some(true),
            subscribe_failures: 0,
            stall_publish: false,
        }
    }
}

#[derive(Default)]
struct MockState {
    behaviour: Mutex<Behaviour>,
    journal: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    opened: Mutex<Option<SessionOptions>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&self, f: impl FnOnce(&mut Behaviour)) {
        f(&mut self.state.behaviour.lock());
    }

    /// Feed an event to the most recently opened session
    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = self.state.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn record(&self, entry: String) {
        self.state.journal.lock().push(entry);
    }

    pub fn journal(&self) -> Vec<String> {
        self.state.journal.lock().clone()
    }

    /// Options of the most recently opened session
    pub fn opened(&self) -> Option<SessionOptions> {
        self.state.opened.lock().clone()
    }
}

impl Transport for MockTransport {
    fn open(&self, options: &SessionOptions) -> Result<Session, ConnectError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(event) = self.state.behaviour.lock().on_open.clone() {
            let _ = tx.send(event);
        }
        *self.state.events.lock() = Some(tx);
        *self.state.opened.lock() = Some(options.clone());

        Ok(Session {
            handle: Arc::new(MockHandle {
                transport: self.clone(),
            }),
            events: Box::new(MockEvents { rx }),
        })
    }
}

struct MockHandle {
    transport: MockTransport,
}

#[async_trait]
impl SessionHandle for MockHandle {
    async fn subscribe(&self, filter: &str) -> Result<(), SubscribeError> {
        let suback = {
            let mut behaviour = self.transport.state.behaviour.lock();
            if behaviour.subscribe_failures > 0 {
                behaviour.subscribe_failures -= 1;
                drop(behaviour);
                self.transport.record(format!("subscribe-failed:{}", filter));
                return Err(SubscribeError::Transport("request queue full".into()));
            }
            behaviour.suback
        };

        self.transport.record(format!("subscribe:{}", filter));
        if let Some(granted) = suback {
            self.transport.emit(SessionEvent::SubAck { granted });
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        let stall = self.transport.state.behaviour.lock().stall_publish;
        if stall {
            std::future::pending::<()>().await;
        }
        self.transport.record(format!("publish:{}={}", topic, payload));
        Ok(())
    }

    async fn close(&self) {
        self.transport.record("close".to_string());
    }
}

struct MockEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

#[async_trait]
impl EventSource for MockEvents {
    async fn next_event(&mut self) -> SessionEvent {
        match self.rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }
}
