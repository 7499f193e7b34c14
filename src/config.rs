use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

use crate::error::SessionError;

/// Kind of a path-discovery helper server.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// One configured path-discovery helper server.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IceServer {
    pub kind: IceServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            kind: IceServerKind::Stun,
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            kind: IceServerKind::Turn,
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Prepends the `stun:`/`turn:` scheme when the configured URL lacks one.
    fn normalized_url(&self) -> String {
        if self.url.starts_with("stun:") || self.url.starts_with("turn:") {
            return self.url.clone();
        }
        let scheme = match self.kind {
            IceServerKind::Stun => "stun:",
            IceServerKind::Turn => "turn:",
        };
        format!("{}{}", scheme, self.url)
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.url.is_empty() {
            return Err(SessionError::Config("ICE server URL cannot be empty".into()));
        }
        if self.kind == IceServerKind::Turn
            && (self.username.is_none() || self.credential.is_none())
        {
            return Err(SessionError::Config(
                "TURN servers require username and credential".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for one negotiation session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionConfig {
    /// Path-discovery helper servers handed to the peer connection.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
    /// Label of the direct data channel.
    #[serde(default = "default_channel_label")]
    pub channel_label: String,
    /// Request a video track from the capture device.
    #[serde(default = "default_video")]
    pub video: bool,
    /// Request an audio track from the capture device.
    #[serde(default)]
    pub audio: bool,
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
    ]
}

fn default_channel_label() -> String {
    "chat".to_owned()
}

fn default_video() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            channel_label: default_channel_label(),
            video: true,
            audio: false,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.channel_label.is_empty() {
            return Err(SessionError::Config("channel label cannot be empty".into()));
        }
        for server in &self.ice_servers {
            server.validate()?;
        }
        Ok(())
    }

    pub(crate) fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![server.normalized_url()],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: 10,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}
