//! Transport boundary for ha-agent
//!
//! This crate defines the contract the ingestion loop consumes (connect,
//! subscribe, read the next event, call a remote service, close) and a
//! concrete WebSocket implementation of it for the Home Assistant API.

mod ws;

pub use ws::WsClient;

use async_trait::async_trait;
use ha_agent_core::EventMessage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the transport
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection closed by remote")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("timed out waiting for the remote")]
    Timeout,

    #[error("unexpected frame from remote: {0}")]
    UnexpectedFrame(String),

    #[error("failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Connection parameters for the remote service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Remote host name or address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Use a TLS transport (wss://)
    pub tls: bool,

    /// Long-lived access token presented during the auth handshake
    pub token: String,

    /// Attempt one reconnect per read after the connection drops
    pub auto_reconnect: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8123,
            tls: false,
            token: String::new(),
            auto_reconnect: false,
        }
    }
}

/// The transport/protocol client consumed by the ingestion loop
///
/// Implementations own the wire protocol entirely; the loop only sees
/// decoded [`EventMessage`]s.
#[async_trait]
pub trait EventClient: Send + Sync {
    /// Open the connection and authenticate
    ///
    /// `Ok(false)` means the remote refused the credentials, a non-fatal
    /// outcome the caller decides how to handle. Transport failures are
    /// errors.
    async fn connect(&self, config: &ConnectConfig) -> Result<bool, ClientError>;

    /// Subscribe to the remote state-change feed
    async fn subscribe_events(&self) -> Result<(), ClientError>;

    /// Read the next remote event
    ///
    /// `Ok(None)` signals that no event is currently available, not an
    /// error.
    async fn read_event(&self) -> Result<Option<EventMessage>, ClientError>;

    /// Invoke a remote service with the given data payload
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ClientError>;

    /// Close the connection; a no-op when already closed
    async fn close(&self) -> Result<(), ClientError>;
}
