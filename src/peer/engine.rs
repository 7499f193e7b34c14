//! The negotiation engine: consumes signaling frames, drives the peer
//! connection through offer/answer/candidate exchange, and retires the relay
//! once the direct channel is up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::SessionEvents;
use crate::peer::channel::{ChannelState, DirectChannel};
use crate::peer::media::{MediaBridge, MediaSource, RemoteSource};
use crate::peer::session::{NegotiationPhase, Role, Session};
use crate::signaling::{CandidateInit, SignalMessage, SignalingChannel};

pub(crate) struct EngineInner {
    config: SessionConfig,
    signaling: SignalingChannel,
    media: MediaBridge,
    events: SessionEvents,
    session: Mutex<Option<Arc<Session>>>,
    /// Bumped when a session starts and again on `stop`; completions carrying
    /// an older value are stale and must not touch anything.
    generation: AtomicU64,
}

impl EngineInner {
    pub fn new(
        config: SessionConfig,
        signaling: SignalingChannel,
        media: MediaBridge,
        events: SessionEvents,
    ) -> Self {
        Self {
            config,
            signaling,
            media,
            events,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn signaling(&self) -> &SignalingChannel {
        &self.signaling
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap().clone()
    }

    /// The session for `generation`, provided it is still the live one.
    fn session_for(&self, generation: u64) -> Option<Arc<Session>> {
        if self.generation.load(Ordering::SeqCst) != generation {
            return None;
        }
        self.current().filter(|s| s.generation == generation)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ---- exposed surface ------------------------------------------------

    pub async fn start_as_initiator(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.current().is_some() {
            warn!("start requested while a session is active");
            return Err(SessionError::AlreadyActive);
        }
        let generation = self.next_generation();
        let source = self
            .media
            .acquire(self.config.video, self.config.audio)
            .await?;
        if !self.is_current(generation) {
            debug!("start cancelled while acquiring media");
            return Ok(());
        }
        let Some(session) = self.install_session(generation, Role::Initiator).await? else {
            return Ok(());
        };
        if let Err(e) = self.run_offer(&session, source).await {
            warn!(session = %session.id, error = %e, "offer negotiation failed");
            self.teardown(generation).await;
            self.events.emit_failed(&e);
            return Err(e);
        }
        Ok(())
    }

    pub async fn send(&self, text: &str) {
        let channel = self
            .current()
            .and_then(|s| s.channel.lock().unwrap().clone());
        match channel {
            Some(channel) => channel.send(text).await,
            None => warn!("send called with no direct channel"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current()
            .and_then(|s| s.channel.lock().unwrap().as_ref().map(|c| c.state()))
            == Some(ChannelState::Open)
    }

    /// Discards the session and releases everything it owns. Safe from any
    /// state, including mid-flight negotiation steps, and idempotent.
    pub async fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let session = self.session.lock().unwrap().take();
        match session {
            Some(session) => self.release_session(session).await,
            None => debug!("stop requested with no active session"),
        }
        self.signaling.close().await;
    }

    // ---- inbound signaling ----------------------------------------------

    pub async fn handle_frame(self: &Arc<Self>, frame: String) {
        let message: SignalMessage = match serde_json::from_str(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "discarding malformed signaling frame");
                return;
            }
        };
        match message {
            SignalMessage::Offer { sdp } => self.handle_offer(sdp).await,
            SignalMessage::Answer { sdp } => self.handle_answer(sdp).await,
            SignalMessage::Candidate { ice } => self.handle_candidate(ice).await,
        }
    }

    async fn handle_offer(self: &Arc<Self>, sdp: String) {
        if self.current().is_some() {
            // single-shot sessions: a second offer never overwrites state
            warn!("offer received while a session is active, ignoring");
            return;
        }
        let generation = self.next_generation();
        let source = match self
            .media
            .acquire(self.config.video, self.config.audio)
            .await
        {
            Ok(source) => source,
            Err(e) => {
                warn!(error = %e, "media acquisition failed, dropping inbound offer");
                self.events.emit_failed(&e);
                return;
            }
        };
        if !self.is_current(generation) {
            debug!("inbound offer cancelled before setup");
            return;
        }
        let session = match self.install_session(generation, Role::Responder).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "could not build peer connection for inbound offer");
                self.events.emit_failed(&e);
                return;
            }
        };
        if let Err(e) = self.run_answer(&session, source, sdp).await {
            warn!(session = %session.id, error = %e, "answer negotiation failed");
            self.teardown(generation).await;
            self.events.emit_failed(&e);
        }
    }

    async fn handle_answer(self: &Arc<Self>, sdp: String) {
        let Some(session) = self.current() else {
            warn!("answer received with no active session, ignoring");
            return;
        };
        let phase = *session.phase.lock().unwrap();
        if session.role != Role::Initiator || phase != NegotiationPhase::LocalOfferPending {
            warn!(?phase, "answer received with no pending offer, ignoring");
            return;
        }
        let answer = match RTCSessionDescription::answer(sdp) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "discarding unparseable answer");
                return;
            }
        };
        if let Err(e) = session.pc.set_remote_description(answer).await {
            warn!(session = %session.id, error = %e, "applying answer failed");
            let error = SessionError::from(e);
            self.teardown(session.generation).await;
            self.events.emit_failed(&error);
            return;
        }
        if !self.is_current(session.generation) {
            return;
        }
        self.apply_buffered_candidates(&session).await;
        *session.phase.lock().unwrap() = NegotiationPhase::Negotiated;
        info!(session = %session.id, "answer applied, negotiation complete");
    }

    async fn handle_candidate(&self, ice: CandidateInit) {
        let Some(session) = self.current() else {
            warn!("candidate received with no active session, ignoring");
            return;
        };
        let ready = session.pending_remote.lock().unwrap().is_ready();
        if ready {
            // remote description already set: apply directly
            self.apply_candidate(&session, ice).await;
        } else {
            debug!(session = %session.id, "remote description not set yet, queuing candidate");
            session.pending_remote.lock().unwrap().enqueue(ice);
        }
    }

    // ---- negotiation steps ----------------------------------------------

    /// Builds the connection and publishes the session record, unless the
    /// engine moved on while we were setting up.
    async fn install_session(
        self: &Arc<Self>,
        generation: u64,
        role: Role,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        let pc = self.build_connection(generation).await?;
        let session = Arc::new(Session::new(generation, role, pc));
        {
            let mut slot = self.session.lock().unwrap();
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("session cancelled before install");
                drop(slot);
                let pc = session.pc.clone();
                tokio::spawn(async move {
                    let _ = pc.close().await;
                });
                return Ok(None);
            }
            *slot = Some(session.clone());
        }
        info!(session = %session.id, role = ?role, "session installed");
        Ok(Some(session))
    }

    async fn run_offer(
        self: &Arc<Self>,
        session: &Arc<Session>,
        source: MediaSource,
    ) -> Result<(), SessionError> {
        self.events.emit_local_source(&source);
        self.media.attach(&session.pc, &source).await?;
        *session.local_source.lock().unwrap() = Some(source);

        // the initiator creates the channel; the responder observes it
        let dc = session
            .pc
            .create_data_channel(&self.config.channel_label, Some(RTCDataChannelInit::default()))
            .await?;
        self.adopt_channel(session, dc);

        let offer = session.pc.create_offer(None).await?;
        session.pc.set_local_description(offer).await?;
        let local = session
            .pc
            .local_description()
            .await
            .ok_or_else(|| SessionError::Protocol("local description missing after offer".into()))?;
        if !self.is_current(session.generation) {
            return Ok(());
        }
        self.signaling
            .send(&SignalMessage::Offer { sdp: local.sdp })
            .await;
        info!(session = %session.id, "offer sent");
        self.drain_local_candidates(session).await;
        Ok(())
    }

    async fn run_answer(
        self: &Arc<Self>,
        session: &Arc<Session>,
        source: MediaSource,
        sdp: String,
    ) -> Result<(), SessionError> {
        self.events.emit_local_source(&source);
        self.media.attach(&session.pc, &source).await?;
        *session.local_source.lock().unwrap() = Some(source);

        let weak = Arc::downgrade(self);
        let generation = session.generation;
        session.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(engine) = weak.upgrade() else { return };
                if let Some(session) = engine.session_for(generation) {
                    engine.adopt_channel(&session, dc);
                }
            })
        }));

        let offer = RTCSessionDescription::offer(sdp)?;
        session.pc.set_remote_description(offer).await?;
        if !self.is_current(session.generation) {
            return Ok(());
        }
        self.apply_buffered_candidates(session).await;

        let answer = session.pc.create_answer(None).await?;
        session.pc.set_local_description(answer).await?;
        let local = session
            .pc
            .local_description()
            .await
            .ok_or_else(|| SessionError::Protocol("local description missing after answer".into()))?;
        if !self.is_current(session.generation) {
            return Ok(());
        }
        self.signaling
            .send(&SignalMessage::Answer { sdp: local.sdp })
            .await;
        *session.phase.lock().unwrap() = NegotiationPhase::AnswerSent;
        info!(session = %session.id, "answer sent");
        self.drain_local_candidates(session).await;
        Ok(())
    }

    // ---- candidates ------------------------------------------------------

    /// Flushes the remote-candidate gate; called once, right after the remote
    /// description is applied.
    async fn apply_buffered_candidates(&self, session: &Arc<Session>) {
        let queued = session.pending_remote.lock().unwrap().mark_ready();
        if !queued.is_empty() {
            debug!(session = %session.id, count = queued.len(), "flushing queued candidates");
        }
        for ice in queued {
            self.apply_candidate(session, ice).await;
        }
    }

    async fn apply_candidate(&self, session: &Arc<Session>, ice: CandidateInit) {
        if let Err(e) = session.pc.add_ice_candidate(ice.to_rtc()).await {
            warn!(session = %session.id, error = %e, "failed to apply remote candidate");
        }
    }

    async fn handle_local_candidate(&self, generation: u64, ice: CandidateInit) {
        let Some(session) = self.session_for(generation) else {
            return;
        };
        if !self.signaling.is_active() {
            // direct path already carries the session; nobody needs this
            debug!("signaling retired, dropping local candidate");
            return;
        }
        // hold-or-send is decided under the queue's own lock; a candidate
        // racing the flip joins the drain or comes back released, never both
        let released = session.pending_local.lock().unwrap().push_or_release(ice);
        if let Some(ice) = released {
            self.signaling.send(&SignalMessage::Candidate { ice }).await;
        }
    }

    /// Flips the outbound queue to pass-through and puts everything it held
    /// on the wire, right after the description frame.
    async fn drain_local_candidates(&self, session: &Arc<Session>) {
        let held = session.pending_local.lock().unwrap().mark_sent();
        if !self.signaling.is_active() {
            return;
        }
        for ice in held {
            self.signaling.send(&SignalMessage::Candidate { ice }).await;
        }
    }

    // ---- connection wiring -----------------------------------------------

    async fn build_connection(
        self: &Arc<Self>,
        generation: u64,
    ) -> Result<Arc<RTCPeerConnection>, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(api.new_peer_connection(self.config.rtc_config()).await?);

        let weak = Arc::downgrade(self);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("local candidate gathering complete");
                    return;
                };
                let Some(engine) = weak.upgrade() else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        engine
                            .handle_local_candidate(generation, CandidateInit::from_rtc(init))
                            .await;
                    }
                    Err(e) => warn!(error = %e, "could not serialize local candidate"),
                }
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(engine) = weak.upgrade() {
                    engine.handle_remote_track(generation, track);
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(state = ?state, "peer connection state changed");
            Box::pin(async {})
        }));

        Ok(pc)
    }

    /// Wires the direct channel into the session, whichever side created it.
    fn adopt_channel(self: &Arc<Self>, session: &Arc<Session>, dc: Arc<RTCDataChannel>) {
        let channel = DirectChannel::new(dc.clone());
        {
            let mut slot = session.channel.lock().unwrap();
            if slot.is_some() {
                warn!(session = %session.id, "direct channel already attached, ignoring duplicate");
                return;
            }
            *slot = Some(channel.clone());
        }
        let generation = session.generation;

        let weak = Arc::downgrade(self);
        let ch = channel.clone();
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            let ch = ch.clone();
            Box::pin(async move {
                if ch.set_state(ChannelState::Open) {
                    if let Some(engine) = weak.upgrade() {
                        engine.handle_channel_open(generation).await;
                    }
                }
            })
        }));

        let weak = Arc::downgrade(self);
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(engine) = weak.upgrade() else { return };
                if engine.session_for(generation).is_none() {
                    return;
                }
                match String::from_utf8(message.data.to_vec()) {
                    Ok(text) => engine.events.emit_message(text),
                    Err(_) => warn!("discarding non-utf8 channel payload"),
                }
            })
        }));

        let weak = Arc::downgrade(self);
        let ch = channel.clone();
        dc.on_close(Box::new(move || {
            let weak = weak.clone();
            let ch = ch.clone();
            Box::pin(async move {
                if ch.set_state(ChannelState::Closed) {
                    if let Some(engine) = weak.upgrade() {
                        engine.handle_channel_closed(generation);
                    }
                }
            })
        }));

        dc.on_error(Box::new(move |e| {
            warn!(error = %e, "direct channel error");
            Box::pin(async {})
        }));

        self.events.emit_channel_state(ChannelState::Connecting);
    }

    async fn handle_channel_open(&self, generation: u64) {
        let Some(session) = self.session_for(generation) else {
            debug!("channel opened for a stale session");
            return;
        };
        info!(session = %session.id, "direct channel open, retiring signaling");
        *session.phase.lock().unwrap() = NegotiationPhase::Negotiated;
        self.events.emit_channel_state(ChannelState::Open);
        self.signaling.close().await;
    }

    fn handle_channel_closed(&self, generation: u64) {
        let Some(session) = self.session_for(generation) else {
            return;
        };
        // terminal for messaging; the session record goes away on stop()
        info!(session = %session.id, "direct channel closed");
        self.events.emit_channel_state(ChannelState::Closed);
    }

    fn handle_remote_track(self: &Arc<Self>, generation: u64, track: Arc<TrackRemote>) {
        let Some(session) = self.session_for(generation) else {
            return;
        };
        if session.remote_bound.swap(true, Ordering::SeqCst) {
            // one-shot bind: additional tracks never re-enter negotiation
            debug!(session = %session.id, "remote source already bound, ignoring extra track");
            return;
        }
        let stream_id = track.stream_id();
        info!(session = %session.id, stream = %stream_id, "remote media source available");
        self.events.emit_remote_source(Some(RemoteSource { track, stream_id }));
    }

    // ---- failure & teardown ----------------------------------------------

    /// The relay dropped from under us.
    pub async fn handle_signaling_lost(&self, reason: Option<String>) {
        if !self.signaling.is_active() {
            // we already retired it ourselves
            debug!("relay gone after retirement, ignoring");
            return;
        }
        self.signaling.mark_lost();
        let Some(session) = self.current() else {
            info!("relay lost while idle");
            return;
        };
        let open = session
            .channel
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.state())
            == Some(ChannelState::Open);
        if open {
            info!(session = %session.id, "relay lost after direct channel opened, continuing");
            return;
        }
        warn!(session = %session.id, reason = ?reason, "relay lost before negotiation completed");
        self.teardown(session.generation).await;
        self.events.emit_failed(&SessionError::Relay(
            reason.unwrap_or_else(|| "relay connection lost".into()),
        ));
    }

    /// Discards the session for `generation` if it is still installed.
    /// Retires only the generation it was asked about: when the engine has
    /// already moved past it, nothing happens and any newer session keeps
    /// its claim on the counter.
    async fn teardown(&self, generation: u64) {
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("teardown for a stale generation, ignoring");
            return;
        }
        let session = {
            let mut slot = self.session.lock().unwrap();
            match slot.as_ref() {
                Some(s) if s.generation == generation => slot.take(),
                _ => None,
            }
        };
        if let Some(session) = session {
            self.release_session(session).await;
        }
    }

    async fn release_session(&self, session: Arc<Session>) {
        // the media source is released exactly once, here
        if session.local_source.lock().unwrap().take().is_some() {
            debug!(session = %session.id, "local media source released");
        }
        let channel = session.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            if channel.set_state(ChannelState::Closed) {
                self.events.emit_channel_state(ChannelState::Closed);
            }
            channel.close().await;
        }
        if session.remote_bound.load(Ordering::SeqCst) {
            self.events.emit_remote_source(None);
        }
        if let Err(e) = session.pc.close().await {
            warn!(session = %session.id, error = %e, "peer connection close failed");
        }
        info!(session = %session.id, "session discarded");
    }
}
