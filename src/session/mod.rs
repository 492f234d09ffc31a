// src/session/mod.rs - One flow-controlled session per serial port
pub mod events;
mod task;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use crate::config::SerialConfig;
use crate::session::events::SessionEvent;
use crate::transport::TransportFactory;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("port {0} is not open")]
    NotOpen(String),
    #[error("failed to open {port}: {source}")]
    OpenFailed {
        port: String,
        #[source]
        source: io::Error,
    },
    #[error("session for {0} is shutting down")]
    Unavailable(String),
}

/// Identifies one attached client across every session it joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// Requests sent from the web layer (or tests) into a session task.
#[derive(Debug)]
pub enum SessionRequest {
    Attach {
        client: ClientId,
        tx: mpsc::UnboundedSender<SessionEvent>,
    },
    Detach {
        client: ClientId,
    },
    /// Transmit raw text immediately, bypassing the queue.
    Write {
        client: ClientId,
        text: String,
    },
    /// Same as [`SessionRequest::Write`] with a trailing newline.
    WriteLine {
        client: ClientId,
        text: String,
    },
    /// Append program lines to the queue.
    Enqueue {
        lines: Vec<String>,
    },
    Run {
        looping: bool,
    },
    Pause,
    Stop,
    Clear,
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
    opened_at: DateTime<Utc>,
}

/// Registry of live sessions, one per port. Cheap to clone; every web
/// connection holds one.
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<Mutex<HashMap<String, SessionHandle>>>,
    factory: Arc<dyn TransportFactory>,
    serial: SerialConfig,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, serial: SerialConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            factory,
            serial,
        }
    }

    /// Opens `port` for `client`, or attaches the client to the session
    /// already driving it. The open event arrives on `tx`.
    pub async fn open(
        &self,
        port: &str,
        baudrate: Option<u32>,
        client: ClientId,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(), SessionError> {
        let baudrate = baudrate.unwrap_or(self.serial.baudrate);
        let mut registry = self.registry.lock().await;
        if let Some(handle) = registry.get(port) {
            let session_tx = handle.tx.clone();
            drop(registry);
            return session_tx
                .send(SessionRequest::Attach { client, tx })
                .await
                .map_err(|_| SessionError::Unavailable(port.to_string()));
        }
        let transport =
            self.factory
                .open(port, baudrate)
                .await
                .map_err(|source| SessionError::OpenFailed {
                    port: port.to_string(),
                    source,
                })?;
        let (session_tx, session_rx) = mpsc::channel(16);
        registry.insert(
            port.to_string(),
            SessionHandle {
                tx: session_tx,
                opened_at: Utc::now(),
            },
        );
        drop(registry);
        tracing::info!(port = %port, baudrate, "opened serial session");
        task::spawn_session(
            port.to_string(),
            baudrate,
            transport,
            session_rx,
            self.clone(),
            self.serial.clone(),
            (client, tx),
        );
        Ok(())
    }

    /// Closes the session and waits for its teardown to finish.
    pub async fn close(&self, port: &str) -> Result<(), SessionError> {
        let (respond_to, done) = oneshot::channel();
        self.send(port, SessionRequest::Close { respond_to }).await?;
        let _ = done.await;
        Ok(())
    }

    pub async fn write(
        &self,
        port: &str,
        client: ClientId,
        text: String,
    ) -> Result<(), SessionError> {
        self.send(port, SessionRequest::Write { client, text }).await
    }

    pub async fn write_line(
        &self,
        port: &str,
        client: ClientId,
        text: String,
    ) -> Result<(), SessionError> {
        self.send(port, SessionRequest::WriteLine { client, text })
            .await
    }

    pub async fn enqueue(&self, port: &str, lines: Vec<String>) -> Result<(), SessionError> {
        self.send(port, SessionRequest::Enqueue { lines }).await
    }

    pub async fn run(&self, port: &str, looping: bool) -> Result<(), SessionError> {
        self.send(port, SessionRequest::Run { looping }).await
    }

    pub async fn pause(&self, port: &str) -> Result<(), SessionError> {
        self.send(port, SessionRequest::Pause).await
    }

    pub async fn stop(&self, port: &str) -> Result<(), SessionError> {
        self.send(port, SessionRequest::Stop).await
    }

    pub async fn clear(&self, port: &str) -> Result<(), SessionError> {
        self.send(port, SessionRequest::Clear).await
    }

    /// Detaches a departing client from every session it joined.
    pub async fn detach(&self, client: ClientId) {
        let txs: Vec<_> = {
            let registry = self.registry.lock().await;
            registry.values().map(|handle| handle.tx.clone()).collect()
        };
        for tx in txs {
            let _ = tx.send(SessionRequest::Detach { client }).await;
        }
    }

    pub fn available_ports(&self) -> Vec<String> {
        self.factory.available_ports()
    }

    /// Ports with a live session, and when each was opened.
    pub async fn opened_ports(&self) -> Vec<(String, DateTime<Utc>)> {
        let registry = self.registry.lock().await;
        registry
            .iter()
            .map(|(port, handle)| (port.clone(), handle.opened_at))
            .collect()
    }

    pub(crate) async fn remove(&self, port: &str) {
        self.registry.lock().await.remove(port);
    }

    async fn send(&self, port: &str, request: SessionRequest) -> Result<(), SessionError> {
        let session_tx = {
            let registry = self.registry.lock().await;
            registry
                .get(port)
                .ok_or_else(|| SessionError::NotOpen(port.to_string()))?
                .tx
                .clone()
        };
        session_tx
            .send(request)
            .await
            .map_err(|_| SessionError::Unavailable(port.to_string()))
    }
}
