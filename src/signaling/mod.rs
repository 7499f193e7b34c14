//! Relay-side signaling: the wire format exchanged between the two peers and
//! the channel that carries it until the direct path is up.
//!
//! The relay is assumed to deliver every frame, in order, to the single other
//! party of a two-party namespace. No peer addressing happens at this layer.

pub mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::error::SessionError;

/// Browser-compatible candidate description, nested under `"ice"` on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl CandidateInit {
    pub(crate) fn to_rtc(&self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate.clone(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
            username_fragment: self.username_fragment.clone(),
        }
    }

    pub(crate) fn from_rtc(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

/// One negotiation frame carried over the relay.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { ice: CandidateInit },
}

/// Callbacks a transport fires as relay traffic arrives.
pub struct RelayEvents {
    pub on_frame: Box<dyn Fn(String) + Send + Sync>,
    pub on_error: Box<dyn Fn(String) + Send + Sync>,
    pub on_closed: Box<dyn Fn() + Send + Sync>,
}

/// The relay conduit itself. Implementations deliver opaque text frames to
/// exactly one remote peer; [`websocket::WebSocketRelay`] is the production
/// transport, tests substitute in-memory pairs.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn connect(&self, events: RelayEvents) -> Result<(), SessionError>;
    async fn send(&self, frame: String) -> Result<(), SessionError>;
    async fn close(&self);
}

/// The signaling conduit for one peer pair.
///
/// Once closed (after the direct channel opens, on `stop`, or when the
/// transport is lost) it never reopens: a fresh session needs a fresh channel.
pub struct SignalingChannel {
    transport: Arc<dyn RelayTransport>,
    active: AtomicBool,
    closed: AtomicBool,
}

impl SignalingChannel {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self {
            transport,
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn connect(&self, events: RelayEvents) -> Result<(), SessionError> {
        self.transport.connect(events).await?;
        self.active.store(true, Ordering::SeqCst);
        debug!("relay conduit established");
        Ok(())
    }

    /// Sends a negotiation frame. Dropped with a log line when the channel is
    /// not (or no longer) connected; never an error to the caller.
    pub async fn send(&self, message: &SignalMessage) {
        if !self.is_active() {
            warn!("signaling channel inactive, dropping outbound frame");
            return;
        }
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "could not encode signaling frame");
                return;
            }
        };
        if let Err(e) = self.transport.send(frame).await {
            warn!(error = %e, "relay send failed");
        }
    }

    /// Releases the relay conduit. Idempotent; the underlying transport is
    /// closed exactly once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.active.store(false, Ordering::SeqCst);
        self.transport.close().await;
        debug!("relay conduit released");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Records that the transport dropped from under us.
    pub(crate) fn mark_lost(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}
