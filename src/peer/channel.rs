use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use webrtc::data_channel::RTCDataChannel;

/// Lifecycle of the direct peer-to-peer conduit.
///
/// Transitions are one-directional: `Connecting → Open`, and either of those
/// to `Closed`. A closed channel never reopens; a fresh negotiation creates a
/// fresh channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// The established peer-to-peer data conduit used for in-session messaging.
pub(crate) struct DirectChannel {
    dc: Arc<RTCDataChannel>,
    state: Mutex<ChannelState>,
}

impl DirectChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        Arc::new(Self {
            dc,
            state: Mutex::new(ChannelState::Connecting),
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    /// Applies a state transition, returning whether it took effect.
    /// Illegal transitions (anything out of `Closed`, `Open → Connecting`)
    /// are dropped.
    pub fn set_state(&self, next: ChannelState) -> bool {
        let mut state = self.state.lock().unwrap();
        let allowed = matches!(
            (*state, next),
            (ChannelState::Connecting, ChannelState::Open)
                | (ChannelState::Connecting, ChannelState::Closed)
                | (ChannelState::Open, ChannelState::Closed)
        );
        if allowed {
            debug!(from = ?*state, to = ?next, "direct channel state change");
            *state = next;
        }
        allowed
    }

    /// Transmits a text payload. A logged no-op unless the channel is open.
    pub async fn send(&self, text: &str) {
        if self.state() != ChannelState::Open {
            warn!(state = ?self.state(), "direct channel not open, dropping payload");
            return;
        }
        if let Err(e) = self.dc.send_text(text.to_owned()).await {
            warn!(error = %e, "direct channel send failed");
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(error = %e, "direct channel close failed");
        }
    }
}
