//! One jitter buffer per voice channel.
//!
//! ```text
//!  (channel, frame) ──► seen? ──► buffer[channel] ──► drain_ready(now)
//!                        │          (created on first frame)
//!                        └─► Duplicate
//! ```
//!
//! A channel's buffer is created by its first frame and dropped once no
//! frame has arrived for `idle_timeout_ms`. Each channel remembers the
//! sequence numbers it has accepted, up to `seen_capacity`, so a redelivered
//! frame is reported as a duplicate even after it has been played.

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::jitter::{BufferStats, Frame, JitterBuffer, JitterConfig, PushOutcome};

/// Voice channel identifier.
pub type ChannelId = String;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Config for every channel's buffer
    pub jitter: JitterConfig,
    /// Drop a channel after this long without a frame. Default: 30s.
    pub idle_timeout_ms: u64,
    /// Sequence numbers remembered per channel for dedupe. Default: 4096.
    pub seen_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            jitter: JitterConfig::default(),
            idle_timeout_ms: 30_000,
            seen_capacity: 4096,
        }
    }
}

impl RegistryConfig {
    pub fn for_testing() -> Self {
        Self {
            jitter: JitterConfig::for_testing(),
            idle_timeout_ms: 1_000,
            seen_capacity: 8,
        }
    }
}

/// What the registry did with a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Handed to the channel's buffer
    Pushed(PushOutcome),
    /// Same channel and sequence seen before; not pushed
    Duplicate,
}

#[derive(Debug)]
struct Channel {
    buffer: JitterBuffer,
    seen: HashSet<u32>,
    seen_order: VecDeque<u32>,
    last_active_ms: u64,
}

impl Channel {
    fn new(config: &RegistryConfig, now_ms: u64) -> Self {
        Self {
            buffer: JitterBuffer::new(config.jitter.clone()),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            last_active_ms: now_ms,
        }
    }

    /// Returns false if `sequence` was already seen.
    fn remember(&mut self, sequence: u32, capacity: usize) -> bool {
        if !self.seen.insert(sequence) {
            return false;
        }
        self.seen_order.push_back(sequence);
        while self.seen_order.len() > capacity {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Jitter buffers for every active voice channel.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    config: RegistryConfig,
    channels: BTreeMap<ChannelId, Channel>,
    duplicates: u64,
}

impl ChannelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            channels: BTreeMap::new(),
            duplicates: 0,
        }
    }

    /// Route a frame to its channel's buffer, creating the channel if needed.
    pub fn push(&mut self, channel: &str, frame: Frame, now_ms: u64) -> Received {
        if !self.channels.contains_key(channel) {
            log::debug!("Opening voice channel {channel}");
        }
        let config = &self.config;
        let entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| Channel::new(config, now_ms));
        entry.last_active_ms = entry.last_active_ms.max(now_ms);

        if !entry.remember(frame.sequence, self.config.seen_capacity) {
            self.duplicates += 1;
            log::trace!("Duplicate frame {channel}:{}", frame.sequence);
            return Received::Duplicate;
        }
        Received::Pushed(entry.buffer.push(frame))
    }

    /// Next playable frame of one channel.
    pub fn pull(&mut self, channel: &str, now_ms: u64) -> Option<Frame> {
        self.channels.get_mut(channel)?.buffer.pull(now_ms)
    }

    /// Every playable frame, grouped by channel in channel order.
    pub fn drain_ready(&mut self, now_ms: u64) -> Vec<(ChannelId, Vec<Frame>)> {
        self.channels
            .iter_mut()
            .filter_map(|(id, channel)| {
                let frames = channel.buffer.drain_ready(now_ms);
                (!frames.is_empty()).then(|| (id.clone(), frames))
            })
            .collect()
    }

    /// Skip the gap in one channel. See [`JitterBuffer::skip_forward`].
    pub fn skip_forward(&mut self, channel: &str) -> u64 {
        self.channels
            .get_mut(channel)
            .map_or(0, |channel| channel.buffer.skip_forward())
    }

    /// Drop channels idle for longer than the timeout. Returns how many were dropped.
    pub fn evict_idle(&mut self, now_ms: u64) -> usize {
        let timeout = self.config.idle_timeout_ms;
        let before = self.channels.len();
        self.channels.retain(|id, channel| {
            let keep = now_ms.saturating_sub(channel.last_active_ms) <= timeout;
            if !keep {
                log::debug!(
                    "Closing idle voice channel {id} ({} frame(s) discarded)",
                    channel.buffer.len()
                );
            }
            keep
        });
        before - self.channels.len()
    }

    pub fn remove(&mut self, channel: &str) -> bool {
        self.channels.remove(channel).is_some()
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn stats(&self, channel: &str) -> Option<BufferStats> {
        self.channels.get(channel).map(|channel| channel.buffer.stats())
    }

    /// Frames rejected by the seen-set across all channels.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}
