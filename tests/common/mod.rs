//! Shared test doubles: an in-memory relay (scripted and paired variants)
//! and stub capture devices.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use screenlink::{
    CaptureDevice, MediaSource, RelayEvents, RelayTransport, SessionError, SignalMessage,
};
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screenlink=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Relay driven directly by the test: frames go in via [`ScriptedRelay::inject`],
/// everything the engine sends is recorded.
#[derive(Default)]
pub struct ScriptedRelay {
    pub sent: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
    events: Mutex<Option<Arc<RelayEvents>>>,
}

impl ScriptedRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers a frame as if the remote peer had sent it over the relay.
    pub fn inject(&self, frame: impl Into<String>) {
        let events = self.events.lock().unwrap().clone();
        if let Some(events) = events {
            (events.on_frame)(frame.into());
        }
    }

    /// Simulates the relay transport failing underneath the engine.
    pub fn fail(&self, reason: &str) {
        let events = self.events.lock().unwrap().clone();
        if let Some(events) = events {
            (events.on_error)(reason.to_owned());
        }
    }

    pub fn sent_messages(&self) -> Vec<SignalMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|frame| serde_json::from_str(frame).expect("engine sent malformed frame"))
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl RelayTransport for ScriptedRelay {
    async fn connect(&self, events: RelayEvents) -> Result<(), SessionError> {
        *self.events.lock().unwrap() = Some(Arc::new(events));
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), SessionError> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// One endpoint of an in-memory relay pair. Mirrors a real relay service:
/// closing one endpoint stops its own traffic but does not tear down the
/// other side's conduit.
pub struct MemoryRelay {
    to_peer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    from_peer: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    pub sent: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
}

impl MemoryRelay {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            to_peer: Mutex::new(Some(b_tx)),
            from_peer: Mutex::new(Some(a_rx)),
            sent: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        let b = Arc::new(Self {
            to_peer: Mutex::new(Some(a_tx)),
            from_peer: Mutex::new(Some(b_rx)),
            sent: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        (a, b)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn connect(&self, events: RelayEvents) -> Result<(), SessionError> {
        let mut rx = self
            .from_peer
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SessionError::Relay("already connected".into()))?;
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                (events.on_frame)(frame);
            }
        });
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), SessionError> {
        self.sent.lock().unwrap().push(frame.clone());
        let tx = self.to_peer.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| SessionError::Relay("peer gone".into())),
            None => Err(SessionError::Relay("closed".into())),
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.to_peer.lock().unwrap().take();
    }
}

/// Capture device producing an empty (track-less) source immediately.
pub struct NullCapture;

#[async_trait]
impl CaptureDevice for NullCapture {
    async fn request_display_source(
        &self,
        _video: bool,
        _audio: bool,
    ) -> Result<MediaSource, SessionError> {
        Ok(MediaSource::new("null-capture", Vec::new()))
    }
}

/// Capture device that takes a while, for racing against `stop()`.
pub struct SlowCapture(pub Duration);

#[async_trait]
impl CaptureDevice for SlowCapture {
    async fn request_display_source(
        &self,
        _video: bool,
        _audio: bool,
    ) -> Result<MediaSource, SessionError> {
        tokio::time::sleep(self.0).await;
        Ok(MediaSource::new("slow-capture", Vec::new()))
    }
}

/// Capture device that always fails, as if permission were denied.
pub struct DeniedCapture;

#[async_trait]
impl CaptureDevice for DeniedCapture {
    async fn request_display_source(
        &self,
        _video: bool,
        _audio: bool,
    ) -> Result<MediaSource, SessionError> {
        Err(SessionError::Media("permission denied".into()))
    }
}

/// Polls `condition` until it holds or the timeout elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
