//! Frame plumbing between sources and clients.

pub mod channel;
pub mod encoder;
pub mod producer;
pub mod render;

pub use channel::{FrameChannel, FrameSink, PutOutcome};
pub use encoder::{BridgeState, TranscodeBridge};
pub use producer::{spawn_producer, ProducerHandle, ProducerState};
