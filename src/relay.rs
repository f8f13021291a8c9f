//! Loopback endpoint for the streaming client.
//!
//! In echo mode every binary message goes straight back to its sender. In gray mode each
//! connection gets its own [`CodecSession`]: units are decoded, re-encoded in grayscale and
//! returned, the way a processing server would answer.

use std::sync::{Arc, Mutex};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use vidlink_codec::{CodecError, CodecSession, EncodedPacket, MediaCodec, PixelFormat};

use crate::transport::{close_codec, with_codec, SharedCodec};

pub const VIDEO_PATH: &str = "/ws/video";

const GRAY_FPS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayMode {
    #[default]
    Echo,
    Gray,
}

pub fn router(mode: RelayMode) -> Router {
    Router::new()
        .route(VIDEO_PATH, get(upgrade))
        .with_state(mode)
}

/// Serves the relay endpoint until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    mode: RelayMode,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    log::info!(
        "{:?} relay listening on ws://{}{}",
        mode,
        listener.local_addr()?,
        VIDEO_PATH
    );
    axum::serve(listener, router(mode))
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down relay");
}

async fn upgrade(State(mode): State<RelayMode>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let ws = ws.max_message_size(usize::MAX).max_frame_size(usize::MAX);
    match mode {
        RelayMode::Echo => ws.on_upgrade(echo),
        RelayMode::Gray => ws.on_upgrade(gray),
    }
}

async fn echo(socket: WebSocket) {
    let (mut tx, mut rx) = socket.split();
    let mut echoed = 0u64;
    while let Some(message) = rx.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                if tx.send(Message::Binary(data)).await.is_err() {
                    break;
                }
                echoed += 1;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("relay socket error: {}", e);
                break;
            }
        }
    }
    let _ = tx.close().await;
    log::debug!("relay client gone after {} messages", echoed);
}

async fn gray(socket: WebSocket) {
    let (mut tx, mut rx) = socket.split();
    let codec: SharedCodec<CodecSession> = Arc::new(Mutex::new(
        CodecSession::default().with_output_format(PixelFormat::Gray8),
    ));
    let ready = with_codec(&codec, |codec| codec.init_decoder()).await;
    if let Err(e) = ready.and_then(|init| Ok(init?)) {
        log::error!("gray relay: {}", e);
        let _ = tx.close().await;
        return;
    }

    let mut returned = 0u64;
    'session: while let Some(message) = rx.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                log::debug!("relay socket error: {}", e);
                break;
            }
        };
        let regrayed = with_codec(&codec, move |codec| regray(codec, &data)).await;
        let packets = match regrayed.and_then(|packets| Ok(packets?)) {
            Ok(packets) => packets,
            Err(e) => {
                log::warn!("gray relay dropping connection: {}", e);
                break;
            }
        };
        for packet in packets {
            if tx.send(Message::Binary(packet.into_data())).await.is_err() {
                break 'session;
            }
            returned += 1;
        }
    }
    let _ = tx.close().await;
    close_codec(&codec).await;
    log::debug!("gray relay client gone after {} packets", returned);
}

/// Decodes one unit and re-encodes whatever pictures it completes. The encoder follows the
/// stream's frame size.
fn regray(codec: &mut CodecSession, data: &[u8]) -> Result<Vec<EncodedPacket>, CodecError> {
    let mut packets = Vec::new();
    for frame in codec.decode(data) {
        if !codec.encoder_initialized() {
            codec.init_encoder(frame.width(), frame.height(), GRAY_FPS)?;
        }
        match codec.encode(&frame) {
            Ok(encoded) => packets.extend(encoded),
            Err(CodecError::DimensionMismatch { .. }) => {
                codec.init_encoder(frame.width(), frame.height(), GRAY_FPS)?;
                packets.extend(codec.encode(&frame)?);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    use super::*;

    #[tokio::test]
    async fn echoes_binary_and_ignores_text() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, RelayMode::Echo, cancel.clone()));

        let url = format!("ws://{}{}", addr, VIDEO_PATH);
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        ws.send(Message::Text("hello".into())).await?;
        ws.send(Message::Binary(vec![0, 0, 0, 1, 0x65].into())).await?;

        let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await?
            .expect("stream ended")?;
        assert_eq!(reply, Message::Binary(vec![0, 0, 0, 1, 0x65].into()));

        ws.close(None).await?;
        cancel.cancel();
        server.await??;
        Ok(())
    }
}
