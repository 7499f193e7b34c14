use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use rand::Rng;
use webrtc::peer_connection::RTCPeerConnection;

use crate::peer::candidates::CandidateBuffer;
use crate::peer::channel::DirectChannel;
use crate::peer::media::MediaSource;
use crate::signaling::CandidateInit;

/// Which side of the offer/answer exchange this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Where the single-shot negotiation currently stands. `Idle` is "no session
/// installed"; `Closed` is "session discarded".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NegotiationPhase {
    /// Initiator: offer sent, answer outstanding.
    LocalOfferPending,
    /// Responder: offer consumed, answer not yet on the wire.
    RemoteOfferReceived,
    /// Responder: answer sent, waiting for the direct channel.
    AnswerSent,
    Negotiated,
}

/// Outbound candidates discovered before our description frame is on the
/// wire; a candidate frame must never precede its description.
///
/// The hold-or-send decision and the flip to pass-through share one value
/// behind one lock: a candidate arriving concurrently with the flip either
/// joins the drain or is released to the caller, never both and never
/// neither.
pub(crate) enum LocalCandidateQueue {
    Holding(Vec<CandidateInit>),
    Sent,
}

impl Default for LocalCandidateQueue {
    fn default() -> Self {
        Self::Holding(Vec::new())
    }
}

impl LocalCandidateQueue {
    /// Queues the candidate while the description is still pending; hands it
    /// back once the queue has flipped, for the caller to put on the wire.
    pub fn push_or_release(&mut self, ice: CandidateInit) -> Option<CandidateInit> {
        match self {
            Self::Holding(held) => {
                held.push(ice);
                None
            }
            Self::Sent => Some(ice),
        }
    }

    /// Flips to pass-through and drains everything held, in arrival order.
    pub fn mark_sent(&mut self) -> Vec<CandidateInit> {
        match std::mem::replace(self, Self::Sent) {
            Self::Holding(held) => held,
            Self::Sent => Vec::new(),
        }
    }
}

/// The negotiation context for one peer pair. Exactly one lives at a time,
/// owned by the engine; every asynchronous completion checks `generation`
/// against the engine's counter before touching it.
pub(crate) struct Session {
    pub id: String,
    pub generation: u64,
    pub role: Role,
    pub pc: Arc<RTCPeerConnection>,
    pub phase: Mutex<NegotiationPhase>,
    pub channel: Mutex<Option<Arc<DirectChannel>>>,
    /// Remote candidates gated on the remote description.
    pub pending_remote: Mutex<CandidateBuffer>,
    pub pending_local: Mutex<LocalCandidateQueue>,
    pub local_source: Mutex<Option<MediaSource>>,
    pub remote_bound: AtomicBool,
}

impl Session {
    pub fn new(generation: u64, role: Role, pc: Arc<RTCPeerConnection>) -> Self {
        let phase = match role {
            Role::Initiator => NegotiationPhase::LocalOfferPending,
            Role::Responder => NegotiationPhase::RemoteOfferReceived,
        };
        Self {
            id: random_id(),
            generation,
            role,
            pc,
            phase: Mutex::new(phase),
            channel: Mutex::new(None),
            pending_remote: Mutex::new(CandidateBuffer::default()),
            pending_local: Mutex::new(LocalCandidateQueue::default()),
            local_source: Mutex::new(None),
            remote_bound: AtomicBool::new(false),
        }
    }
}

pub(crate) fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}
