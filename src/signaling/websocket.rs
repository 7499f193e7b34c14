//! WebSocket relay transport.

use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::{RelayEvents, RelayTransport};
use crate::error::SessionError;

enum Command {
    Frame(String),
    Close,
}

/// Relay transport over a WebSocket connection to the signaling service.
pub struct WebSocketRelay {
    url: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl WebSocketRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tx: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RelayTransport for WebSocketRelay {
    async fn connect(&self, events: RelayEvents) -> Result<(), SessionError> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SessionError::Relay(e.to_string()))?;
        debug!(url = %self.url, "websocket relay connected");

        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap() = Some(tx);

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Frame(frame) => {
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            warn!(error = %e, "websocket send failed");
                            break;
                        }
                    }
                    Command::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => (events.on_frame)(text),
                    Ok(Message::Close(_)) => {
                        debug!("websocket relay closed by remote");
                        (events.on_closed)();
                        return;
                    }
                    // control frames are handled by tungstenite
                    Ok(_) => {}
                    Err(e) => {
                        (events.on_error)(e.to_string());
                        return;
                    }
                }
            }
            (events.on_closed)();
        });

        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), SessionError> {
        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send(Command::Frame(frame))
                .map_err(|_| SessionError::Relay("websocket writer gone".into())),
            None => Err(SessionError::Relay("websocket not connected".into())),
        }
    }

    async fn close(&self) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(Command::Close);
        }
    }
}
