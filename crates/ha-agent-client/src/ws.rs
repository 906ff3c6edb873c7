//! WebSocket implementation of the transport contract

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use ha_agent_core::EventMessage;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::{ClientError, ConnectConfig, EventClient};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Handshake frames must arrive within this window
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a single read waits before reporting "no event available"
const READ_POLL: Duration = Duration::from_secs(1);

/// WebSocket client for the Home Assistant API
///
/// Speaks the `/api/websocket` protocol: the `auth_required`/`auth`/`auth_ok`
/// handshake, `subscribe_events`, `event` frames, and `call_service`.
pub struct WsClient {
    writer: Mutex<Option<WsWriter>>,
    reader: Mutex<Option<WsReader>>,
    /// Remembered from connect for the optional reconnect path
    config: StdMutex<Option<ConnectConfig>>,
    next_id: AtomicU64,
}

impl WsClient {
    /// Create a client with no open connection
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            config: StdMutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn ws_url(config: &ConnectConfig) -> String {
        let scheme = if config.tls { "wss" } else { "ws" };
        format!("{}://{}:{}/api/websocket", scheme, config.host, config.port)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn remembered_config(&self) -> Option<ConnectConfig> {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn send_json(&self, value: &Value) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ClientError::NotConnected)?;
        writer.send(Message::Text(value.to_string())).await?;
        Ok(())
    }

    /// Receive the next text frame as JSON, bounded by the handshake window
    async fn recv_json(&self) -> Result<Value, ClientError> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or(ClientError::NotConnected)?;
        loop {
            let msg = timeout(HANDSHAKE_TIMEOUT, reader.next())
                .await
                .map_err(|_| ClientError::Timeout)?
                .ok_or(ClientError::ConnectionClosed)??;
            match msg {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Close(_) => return Err(ClientError::ConnectionClosed),
                // Control frames during the handshake are legal; skip them.
                _ => continue,
            }
        }
    }

    /// Pull one frame off the socket, or None when the poll window lapses
    async fn poll_frame(&self) -> Result<Option<Value>, ClientError> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or(ClientError::NotConnected)?;
        let msg = match timeout(READ_POLL, reader.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => return Err(ClientError::ConnectionClosed),
            Ok(Some(msg)) => msg?,
        };
        match msg {
            Message::Text(text) => Ok(Some(serde_json::from_str(&text)?)),
            Message::Close(_) => Err(ClientError::ConnectionClosed),
            _ => Ok(None),
        }
    }

    async fn reconnect(&self) -> Result<(), ClientError> {
        let config = self.remembered_config().ok_or(ClientError::NotConnected)?;
        if self.connect(&config).await? {
            self.subscribe_events().await
        } else {
            Err(ClientError::ConnectionClosed)
        }
    }
}

impl Default for WsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventClient for WsClient {
    async fn connect(&self, config: &ConnectConfig) -> Result<bool, ClientError> {
        let url = Self::ws_url(config);
        debug!(url = %url, "Connecting to remote service");

        let (stream, _) = connect_async(&url).await?;
        let (writer, reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = Some(config.clone());

        let greeting = self.recv_json().await?;
        if greeting.get("type").and_then(Value::as_str) != Some("auth_required") {
            return Err(ClientError::UnexpectedFrame(greeting.to_string()));
        }

        self.send_json(&json!({
            "type": "auth",
            "access_token": config.token,
        }))
        .await?;

        let reply = self.recv_json().await?;
        match reply.get("type").and_then(Value::as_str) {
            Some("auth_ok") => {
                info!(host = %config.host, "Authenticated with remote service");
                Ok(true)
            }
            Some("auth_invalid") => {
                warn!(host = %config.host, "Remote service rejected credentials");
                let _ = self.close().await;
                Ok(false)
            }
            _ => Err(ClientError::UnexpectedFrame(reply.to_string())),
        }
    }

    async fn subscribe_events(&self) -> Result<(), ClientError> {
        let id = self.next_id();
        self.send_json(&json!({
            "type": "subscribe_events",
            "id": id,
            "event_type": ha_agent_core::STATE_CHANGED,
        }))
        .await?;

        let ack = self.recv_json().await?;
        let success = ack.get("type").and_then(Value::as_str) == Some("result")
            && ack.get("success").and_then(Value::as_bool) == Some(true);
        if success {
            debug!(id, "Subscribed to state changes");
            Ok(())
        } else {
            Err(ClientError::UnexpectedFrame(ack.to_string()))
        }
    }

    async fn read_event(&self) -> Result<Option<EventMessage>, ClientError> {
        let frame = match self.poll_frame().await {
            Ok(frame) => frame,
            Err(ClientError::ConnectionClosed)
                if self.remembered_config().is_some_and(|c| c.auto_reconnect) =>
            {
                warn!("Connection lost, attempting reconnect");
                self.reconnect().await?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let Some(mut frame) = frame else {
            return Ok(None);
        };
        match frame.get("type").and_then(Value::as_str) {
            Some("event") => {
                let event = serde_json::from_value(frame["event"].take())?;
                Ok(Some(event))
            }
            // Result acks (e.g. for call_service) and pongs carry no events.
            other => {
                trace!(frame_type = ?other, "Ignoring non-event frame");
                Ok(None)
            }
        }
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: serde_json::Map<String, Value>,
    ) -> Result<(), ClientError> {
        let id = self.next_id();
        debug!(id, domain, service, "Calling remote service");
        self.send_json(&json!({
            "type": "call_service",
            "id": id,
            "domain": domain,
            "service": service,
            "service_data": data,
        }))
        .await
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.reader.lock().await.take();
        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };
        debug!("Closing connection");
        writer.close().await?;
        Ok(())
    }
}
