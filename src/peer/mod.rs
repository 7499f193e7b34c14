pub mod candidates;
pub mod channel;
pub mod engine;
pub mod media;
pub mod session;

pub use channel::ChannelState;
pub use media::{CaptureDevice, MediaSource, RemoteSource};
pub use session::Role;
