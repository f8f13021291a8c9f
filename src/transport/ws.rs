use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::connection::{Connection, Connector, Incoming, PacketReader, PacketWriter};
use crate::{config::StreamConfig, error::TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Binary WebSocket messages, one encoded packet per message.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    open_timeout: Duration,
    io_timeout: Duration,
    dead_after: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, heartbeat: Duration, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            open_timeout: timeout,
            io_timeout: timeout,
            dead_after: heartbeat + timeout,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.endpoint.clone(), config.heartbeat(), config.timeout())
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let mut config = WebSocketConfig::default();
        // encoded packets vary widely in size
        config.max_message_size = None;
        config.max_frame_size = None;

        log::debug!("opening websocket to {}", self.url);
        let (stream, _response) = tokio::time::timeout(
            self.open_timeout,
            connect_async_with_config(self.url.as_str(), Some(config), true),
        )
        .await
        .map_err(|_| {
            TransportError::Timeout(format!(
                "opening {} took longer than {:?}",
                self.url, self.open_timeout
            ))
        })?
        .map_err(|e| TransportError::Connect(format!("{}: {}", self.url, e)))?;

        let (sink, stream) = stream.split();
        let writer = WsWriter {
            sink,
            io_timeout: self.io_timeout,
        };
        let reader = WsReader {
            stream,
            last_seen: Instant::now(),
            dead_after: self.dead_after,
        };
        Ok((Box::new(writer), Box::new(reader)))
    }
}

pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
    io_timeout: Duration,
}

impl WsWriter {
    async fn write(&mut self, message: Message) -> Result<(), TransportError> {
        tokio::time::timeout(self.io_timeout, self.sink.send(message))
            .await
            .map_err(|_| TransportError::Timeout("websocket write stalled".to_string()))?
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[async_trait]
impl PacketWriter for WsWriter {
    async fn send(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.write(Message::Binary(payload)).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.write(Message::Ping(Bytes::new())).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        tokio::time::timeout(self.io_timeout, self.sink.close())
            .await
            .map_err(|_| TransportError::Timeout("websocket close stalled".to_string()))?
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

pub struct WsReader {
    stream: SplitStream<WsStream>,
    last_seen: Instant,
    dead_after: Duration,
}

#[async_trait]
impl PacketReader for WsReader {
    async fn recv(&mut self, wait: Duration) -> Result<Incoming, TransportError> {
        match tokio::time::timeout(wait, self.stream.next()).await {
            Err(_) => {
                if self.last_seen.elapsed() > self.dead_after {
                    Err(TransportError::Timeout(format!(
                        "no traffic from peer for {:?}",
                        self.dead_after
                    )))
                } else {
                    Ok(Incoming::Idle)
                }
            }
            Ok(None) => Ok(Incoming::Closed),
            Ok(Some(Err(e))) => Err(TransportError::Io(e.to_string())),
            Ok(Some(Ok(message))) => {
                self.last_seen = Instant::now();
                match message {
                    Message::Binary(data) => Ok(Incoming::Packet(data)),
                    Message::Close(frame) => {
                        log::debug!("peer sent close: {:?}", frame);
                        Ok(Incoming::Closed)
                    }
                    Message::Text(_) => {
                        log::debug!("ignoring text message");
                        Ok(Incoming::Idle)
                    }
                    _ => Ok(Incoming::Idle),
                }
            }
        }
    }
}
