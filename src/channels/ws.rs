//! WebSocket plumbing shared by the socket-mode adapters

use crate::error::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read half of a platform socket
pub(crate) type WsReader = SplitStream<WsStream>;

/// Write half of a platform socket, shared between the read loop (acks,
/// pongs) and the heartbeat task.
#[derive(Clone)]
pub(crate) struct WsWriter {
    sink: Arc<Mutex<SplitSink<WsStream, Message>>>,
}

impl WsWriter {
    pub(crate) async fn send_text(&self, text: String) -> Result<()> {
        self.sink.lock().await.send(Message::Text(text)).await?;
        Ok(())
    }

    pub(crate) async fn send_json(&self, value: &serde_json::Value) -> Result<()> {
        self.send_text(serde_json::to_string(value)?).await
    }

    async fn pong(&self, payload: Vec<u8>) -> Result<()> {
        self.sink.lock().await.send(Message::Pong(payload)).await?;
        Ok(())
    }
}

/// Open a socket to `url`
pub(crate) async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| Error::Transport(format!("WebSocket connect failed: {}", e)))?;
    let (sink, reader) = stream.split();
    Ok((
        WsWriter {
            sink: Arc::new(Mutex::new(sink)),
        },
        reader,
    ))
}

/// Next text payload, answering pings along the way. `None` once the
/// server closes the socket.
pub(crate) async fn next_text(reader: &mut WsReader, writer: &WsWriter) -> Result<Option<String>> {
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text)),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => return Ok(Some(text)),
                Err(_) => tracing::debug!("Ignoring non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Ping(payload))) => writer.pong(payload).await?,
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(?frame, "WebSocket closed by server");
                return Ok(None);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(None),
        }
    }
}
