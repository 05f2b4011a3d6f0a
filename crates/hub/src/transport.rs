//! Frame-oriented transport seams.
//!
//! The hub core never sees a raw socket: the handshake and the read loop
//! consume a [`FrameSource`], everything outbound goes through a
//! [`FrameSink`]. Production wires these to the two halves of an upgraded
//! axum WebSocket; tests substitute recording mocks.

use std::time::Duration;

use {
    async_trait::async_trait,
    axum::extract::ws::{self, WebSocket},
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    thiserror::Error,
    tokio::sync::Mutex,
};

use trellis_protocol::{CONTROL_WRITE_TIMEOUT_MS, FRAME_WRITE_TIMEOUT_MS, Message};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("write deadline exceeded")]
    Timeout,

    #[error("transport failure: {0}")]
    Io(String),

    #[error("malformed frame: {0}")]
    Decode(String),
}

/// Outbound half: JSON message frames plus native ping/close control frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Write one message frame; bounded by [`FRAME_WRITE_TIMEOUT_MS`].
    async fn write_message(&self, message: &Message) -> Result<(), TransportError>;

    /// Write a native ping control frame; bounded by
    /// [`CONTROL_WRITE_TIMEOUT_MS`].
    async fn write_ping(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Write a native close frame with the given deadline.
    async fn write_close(&self, deadline: Duration) -> Result<(), TransportError>;
}

/// Inbound half, read by exactly one task.
#[async_trait]
pub trait FrameSource: Send {
    /// The next decoded message frame. `None` means the remote closed.
    async fn next_message(&mut self) -> Option<Result<Message, TransportError>>;
}

// ── WebSocket implementation ─────────────────────────────────────────────────

pub struct WsSink {
    writer: Mutex<SplitSink<WebSocket, ws::Message>>,
}

impl WsSink {
    pub fn new(writer: SplitSink<WebSocket, ws::Message>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    async fn write(&self, frame: ws::Message, deadline: Duration) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(deadline, writer.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn write_message(&self, message: &Message) -> Result<(), TransportError> {
        let json = serde_json::to_string(message)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        self.write(
            ws::Message::Text(json.into()),
            Duration::from_millis(FRAME_WRITE_TIMEOUT_MS),
        )
        .await
    }

    async fn write_ping(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.write(
            ws::Message::Ping(payload.into()),
            Duration::from_millis(CONTROL_WRITE_TIMEOUT_MS),
        )
        .await
    }

    async fn write_close(&self, deadline: Duration) -> Result<(), TransportError> {
        self.write(ws::Message::Close(None), deadline).await
    }
}

pub struct WsSource {
    reader: SplitStream<WebSocket>,
}

impl WsSource {
    pub fn new(reader: SplitStream<WebSocket>) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_message(&mut self) -> Option<Result<Message, TransportError>> {
        loop {
            let frame = match self.reader.next().await {
                Some(Ok(f)) => f,
                Some(Err(e)) => return Some(Err(TransportError::Io(e.to_string()))),
                None => return None,
            };

            match frame {
                ws::Message::Text(text) => {
                    return Some(
                        serde_json::from_str(&text)
                            .map_err(|e| TransportError::Decode(e.to_string())),
                    );
                },
                ws::Message::Close(_) => return None,
                // Pings are answered by the transport layer; pongs and binary
                // frames carry nothing for the dispatcher.
                ws::Message::Ping(_) | ws::Message::Pong(_) | ws::Message::Binary(_) => {},
            }
        }
    }
}
