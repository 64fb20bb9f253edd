//! # glyph-voice - Voice frame pacing
//!
//! Voice frames arrive over an unreliable channel out of order and with
//! variable delay. [`JitterBuffer`] reorders one stream and releases frames
//! in strict sequence once they have aged past a fixed hold window.
//! [`ChannelRegistry`] keeps one buffer per voice channel.
//!
//! - [`jitter`]: `Frame`, `JitterBuffer`, `SharedJitterBuffer`
//! - [`registry`]: `ChannelRegistry`, per-channel buffers with dedupe

pub mod jitter;
pub mod registry;

pub use jitter::{BufferStats, Frame, JitterBuffer, JitterConfig, PushOutcome, SharedJitterBuffer};
pub use registry::{ChannelId, ChannelRegistry, Received, RegistryConfig};
