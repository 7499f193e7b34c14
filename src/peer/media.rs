use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::SessionError;

/// Collaborator that produces local capture sources. The session never talks
/// to a device directly; hosts supply whatever capture backend they have.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Requests a display/capture source. May fail (permission denied, no
    /// source available); a failure aborts the negotiation step that asked.
    async fn request_display_source(
        &self,
        video: bool,
        audio: bool,
    ) -> Result<MediaSource, SessionError>;
}

/// A local capture source: the set of outbound tracks one acquisition
/// produced. Owned by the session that acquired it and released exactly once.
pub struct MediaSource {
    id: String,
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl MediaSource {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }

    /// Convenience constructor for hosts that push raw VP8 samples: returns
    /// the source plus the sample track to write frames into.
    pub fn video_sample_source(id: impl Into<String>) -> (Self, Arc<TrackLocalStaticSample>) {
        let id = id.into();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            id.clone(),
        ));
        let source = Self::new(id, vec![track.clone() as Arc<dyn TrackLocal + Send + Sync>]);
        (source, track)
    }
}

/// The remote peer's inbound stream, handed to the presentation layer once
/// per session. `None` follows on teardown so displays can detach.
#[derive(Clone)]
pub struct RemoteSource {
    pub track: Arc<TrackRemote>,
    pub stream_id: String,
}

/// Binds capture sources to the outbound side of a peer connection.
pub(crate) struct MediaBridge {
    capture: Arc<dyn CaptureDevice>,
}

impl MediaBridge {
    pub fn new(capture: Arc<dyn CaptureDevice>) -> Self {
        Self { capture }
    }

    pub async fn acquire(&self, video: bool, audio: bool) -> Result<MediaSource, SessionError> {
        let source = self.capture.request_display_source(video, audio).await?;
        info!(source = %source.id(), tracks = source.tracks().len(), "local media source acquired");
        Ok(source)
    }

    /// Adds every track of `source` to the outbound session.
    pub async fn attach(
        &self,
        pc: &RTCPeerConnection,
        source: &MediaSource,
    ) -> Result<(), SessionError> {
        for track in source.tracks() {
            pc.add_track(track.clone()).await?;
            debug!(source = %source.id(), "outbound track attached");
        }
        Ok(())
    }
}
