//! Peer-to-peer screen-share and chat sessions.
//!
//! Two endpoints that cannot address each other directly bootstrap a session
//! through a relay: session descriptions and path candidates travel over a
//! [`RelayTransport`] until a direct data channel opens, at which point the
//! relay is retired and everything flows peer-to-peer.
//!
//! The presentation layer owns one [`PeerSession`] handle per negotiation and
//! drives a full session with four calls — `connect`, `start_as_initiator`,
//! `send`, `stop` — plus the [`SessionEvents`] callbacks. The callee side
//! needs no call at all: an inbound offer on the relay starts the responder
//! flow automatically.

mod config;
mod error;
mod events;
mod peer;
mod signaling;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::peer::engine::EngineInner;
use crate::peer::media::MediaBridge;

pub use crate::config::{IceServer, IceServerKind, SessionConfig};
pub use crate::error::SessionError;
pub use crate::events::SessionEvents;
pub use crate::peer::{CaptureDevice, ChannelState, MediaSource, RemoteSource, Role};
pub use crate::signaling::websocket::WebSocketRelay;
pub use crate::signaling::{
    CandidateInit, RelayEvents, RelayTransport, SignalMessage, SignalingChannel,
};

/// Handle to one negotiation session, owned by the presentation layer and
/// disposed with [`PeerSession::stop`].
pub struct PeerSession {
    inner: Arc<EngineInner>,
}

impl PeerSession {
    /// Connects the relay conduit and stands the engine up behind it.
    ///
    /// Inbound relay frames are dispatched sequentially, preserving the
    /// relay's delivery order.
    pub async fn connect(
        config: SessionConfig,
        transport: Arc<dyn RelayTransport>,
        capture: Arc<dyn CaptureDevice>,
        events: SessionEvents,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let inner = Arc::new(EngineInner::new(
            config,
            SignalingChannel::new(transport),
            MediaBridge::new(capture),
            events,
        ));

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let Some(engine) = weak.upgrade() else { break };
                engine.handle_frame(frame).await;
            }
            debug!("signaling dispatch loop ended");
        });

        let weak_error = Arc::downgrade(&inner);
        let weak_closed = Arc::downgrade(&inner);
        let relay_events = RelayEvents {
            on_frame: Box::new(move |frame| {
                let _ = tx.send(frame);
            }),
            on_error: Box::new(move |reason| {
                if let Some(engine) = weak_error.upgrade() {
                    tokio::spawn(async move {
                        engine.handle_signaling_lost(Some(reason)).await;
                    });
                }
            }),
            on_closed: Box::new(move || {
                if let Some(engine) = weak_closed.upgrade() {
                    tokio::spawn(async move {
                        engine.handle_signaling_lost(None).await;
                    });
                }
            }),
        };
        inner.signaling().connect(relay_events).await?;
        Ok(Self { inner })
    }

    /// Acquires local media, produces an offer, and sends it over the relay.
    /// Valid only while no session is active.
    pub async fn start_as_initiator(&self) -> Result<(), SessionError> {
        self.inner.start_as_initiator().await
    }

    /// Sends a text payload over the direct channel. A logged no-op unless
    /// the channel is open.
    pub async fn send(&self, text: &str) {
        self.inner.send(text).await;
    }

    /// Whether the direct channel is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Tears the session down: releases media, closes the direct channel,
    /// the peer connection, and the relay conduit. Idempotent, safe from any
    /// state; completions that race it become no-ops.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }
}
