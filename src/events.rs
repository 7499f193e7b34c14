use crate::error::SessionError;
use crate::peer::channel::ChannelState;
use crate::peer::media::{MediaSource, RemoteSource};

/// Callbacks the presentation layer registers on a session handle.
///
/// All fields are optional; an unset callback means the host does not care
/// about that event. Handlers run on the tokio runtime and must not block.
#[derive(Default)]
pub struct SessionEvents {
    /// A text payload arrived over the direct channel.
    pub on_incoming_message: Option<Box<dyn Fn(String) + Send + Sync>>,
    /// The local capture source was acquired; bind previews here.
    pub on_local_source: Option<Box<dyn Fn(&MediaSource) + Send + Sync>>,
    /// The remote peer's stream became available (`Some`) or went away
    /// (`None`), so displays can attach and detach.
    pub on_remote_source: Option<Box<dyn Fn(Option<RemoteSource>) + Send + Sync>>,
    /// The direct channel changed state.
    pub on_channel_state: Option<Box<dyn Fn(ChannelState) + Send + Sync>>,
    /// A negotiation attempt was aborted.
    pub on_session_failed: Option<Box<dyn Fn(&SessionError) + Send + Sync>>,
}

impl SessionEvents {
    pub fn with_incoming_message(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_incoming_message = Some(Box::new(f));
        self
    }

    pub fn with_local_source(mut self, f: impl Fn(&MediaSource) + Send + Sync + 'static) -> Self {
        self.on_local_source = Some(Box::new(f));
        self
    }

    pub fn with_remote_source(
        mut self,
        f: impl Fn(Option<RemoteSource>) + Send + Sync + 'static,
    ) -> Self {
        self.on_remote_source = Some(Box::new(f));
        self
    }

    pub fn with_channel_state(
        mut self,
        f: impl Fn(ChannelState) + Send + Sync + 'static,
    ) -> Self {
        self.on_channel_state = Some(Box::new(f));
        self
    }

    pub fn with_session_failed(
        mut self,
        f: impl Fn(&SessionError) + Send + Sync + 'static,
    ) -> Self {
        self.on_session_failed = Some(Box::new(f));
        self
    }

    pub(crate) fn emit_message(&self, text: String) {
        if let Some(f) = &self.on_incoming_message {
            f(text);
        }
    }

    pub(crate) fn emit_local_source(&self, source: &MediaSource) {
        if let Some(f) = &self.on_local_source {
            f(source);
        }
    }

    pub(crate) fn emit_remote_source(&self, source: Option<RemoteSource>) {
        if let Some(f) = &self.on_remote_source {
            f(source);
        }
    }

    pub(crate) fn emit_channel_state(&self, state: ChannelState) {
        if let Some(f) = &self.on_channel_state {
            f(state);
        }
    }

    pub(crate) fn emit_failed(&self, error: &SessionError) {
        if let Some(f) = &self.on_session_failed {
            f(error);
        }
    }
}
