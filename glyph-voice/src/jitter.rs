//! Jitter buffer for a single ordered voice stream.
//!
//! ```text
//!  network ──push──► ┌──────────────────────────────┐
//!   (any order)      │ expected = 41                │
//!                    │ [41] [42] __ [44] [45]       │ ──pull(now)──► playback
//!                    │  ▲ released once             │   (strict order)
//!                    │    now - produced_at >= hold │
//!                    └──────────────────────────────┘
//! ```
//!
//! Frames are held for `hold_window_ms` after production so that anything
//! reordered within that window is emitted in sequence. The first frame
//! pushed anchors playback; until a frame is played or skipped, an earlier
//! sequence that arrives late moves the anchor back to it, as long as it is
//! no more than `max_frames` behind. A missing frame
//! stalls the stream; deciding when to give up on it belongs to the caller,
//! which can call [`JitterBuffer::skip_forward`].
//!
//! Sequence numbers are `u32` and wrap. Ordering uses serial-number
//! arithmetic relative to the next expected frame, so a stream that wraps
//! from `u32::MAX` to 0 keeps playing in order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// One encoded voice frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub sequence: u32,
    /// Producer clock, milliseconds
    pub produced_at_ms: u64,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(sequence: u32, produced_at_ms: u64, data: Vec<u8>) -> Self {
        Self {
            sequence,
            produced_at_ms,
            data,
        }
    }
}

/// Jitter buffer configuration.
#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Minimum age before a frame may be played. Default: 100ms.
    pub hold_window_ms: u64,
    /// Buffered frames kept at most. Default: 1024.
    pub max_frames: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            hold_window_ms: 100,
            max_frames: 1024,
        }
    }
}

impl JitterConfig {
    /// Small window and capacity for tests.
    pub fn for_testing() -> Self {
        Self {
            hold_window_ms: 20,
            max_frames: 16,
        }
    }
}

/// What `push` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored for later playback
    Buffered,
    /// Same sequence was already buffered; the copy overwrote it
    Replaced,
    /// Sequence is behind the playback position; ignored
    AlreadyPlayed,
    /// Too far behind the anchor to reorder before playback starts; ignored
    OutOfWindow,
    /// Buffer was full and this frame was the furthest ahead, so it was not kept
    Dropped,
}

/// Buffer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub pushed: u64,
    pub played: u64,
    pub duplicates: u64,
    /// Frames rejected as `AlreadyPlayed` or `OutOfWindow`
    pub late: u64,
    pub evicted: u64,
    /// Frames given up on by `skip_forward`
    pub skipped: u64,
    pub buffered: usize,
}

/// Reorders frames of one stream and releases them after the hold window.
///
/// Frames are keyed by an unwrapped 64-bit position so the map iterates in
/// playback order even across a `u32` wrap.
#[derive(Debug)]
pub struct JitterBuffer {
    config: JitterConfig,
    /// Unwrapped position of the next frame to play; `None` until the first push
    expected: Option<u64>,
    /// Set once a frame has been played or skipped; the anchor is then fixed
    playing: bool,
    frames: BTreeMap<u64, Frame>,
    stats: BufferStats,
}

/// Start high enough that moving the anchor back never underflows.
const ORIGIN: u64 = 1 << 62;

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            config,
            expected: None,
            playing: false,
            frames: BTreeMap::new(),
            stats: BufferStats::default(),
        }
    }

    /// Insert a frame keyed by its sequence number.
    pub fn push(&mut self, frame: Frame) -> PushOutcome {
        self.stats.pushed += 1;

        let expected = *self.expected.get_or_insert_with(|| ORIGIN + u64::from(frame.sequence));
        let offset = frame.sequence.wrapping_sub(self.wrap(expected)) as i32;
        if offset < 0 && self.playing {
            self.stats.late += 1;
            log::trace!("Frame {} arrived after playback passed it", frame.sequence);
            return PushOutcome::AlreadyPlayed;
        }
        if offset < 0 && offset.unsigned_abs() as usize > self.config.max_frames {
            self.stats.late += 1;
            log::debug!(
                "Frame {} is {} behind the anchor, outside the reorder window",
                frame.sequence,
                offset.unsigned_abs()
            );
            return PushOutcome::OutOfWindow;
        }
        let position = expected.wrapping_add_signed(i64::from(offset));

        if self.frames.insert(position, frame).is_some() {
            self.stats.duplicates += 1;
            return PushOutcome::Replaced;
        }

        if self.frames.len() > self.config.max_frames {
            if let Some((evicted, dropped)) = self.frames.pop_last() {
                self.stats.evicted += 1;
                log::debug!("Jitter buffer full, evicted frame {}", dropped.sequence);
                if evicted == position {
                    return PushOutcome::Dropped;
                }
            }
        }
        if position < expected {
            self.expected = Some(position);
        }
        PushOutcome::Buffered
    }

    /// Next frame in sequence, if it has arrived and has aged past the hold window.
    pub fn pull(&mut self, now_ms: u64) -> Option<Frame> {
        let expected = self.expected?;
        let frame = self.frames.get(&expected)?;
        if now_ms.saturating_sub(frame.produced_at_ms) < self.config.hold_window_ms {
            return None;
        }

        let frame = self.frames.remove(&expected)?;
        self.expected = Some(expected + 1);
        self.playing = true;
        self.stats.played += 1;
        Some(frame)
    }

    /// Every frame playable at `now_ms`, in order.
    pub fn drain_ready(&mut self, now_ms: u64) -> Vec<Frame> {
        std::iter::from_fn(|| self.pull(now_ms)).collect()
    }

    /// Give up on the missing frame(s) and move playback to the lowest
    /// buffered frame. Returns how many sequence numbers were skipped.
    pub fn skip_forward(&mut self) -> u64 {
        let (Some(expected), Some((&lowest, _))) = (self.expected, self.frames.first_key_value()) else {
            return 0;
        };
        let skipped = lowest - expected;
        if skipped > 0 {
            log::debug!("Skipping {skipped} missing frame(s) before {}", self.wrap(lowest));
            self.expected = Some(lowest);
            self.playing = true;
            self.stats.skipped += skipped;
        }
        skipped
    }

    /// Sequence number of the next frame to play.
    pub fn expected_sequence(&self) -> Option<u32> {
        self.expected.map(|e| self.wrap(e))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            buffered: self.frames.len(),
            ..self.stats.clone()
        }
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }

    fn wrap(&self, position: u64) -> u32 {
        position as u32
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new(JitterConfig::default())
    }
}

/// Jitter buffer shared between a network receiver and a playback tick.
///
/// Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedJitterBuffer {
    inner: Arc<Mutex<JitterBuffer>>,
}

impl SharedJitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(JitterBuffer::new(config))),
        }
    }

    pub fn push(&self, frame: Frame) -> PushOutcome {
        self.lock().push(frame)
    }

    pub fn pull(&self, now_ms: u64) -> Option<Frame> {
        self.lock().pull(now_ms)
    }

    pub fn drain_ready(&self, now_ms: u64) -> Vec<Frame> {
        self.lock().drain_ready(now_ms)
    }

    pub fn skip_forward(&self) -> u64 {
        self.lock().skip_forward()
    }

    pub fn stats(&self) -> BufferStats {
        self.lock().stats()
    }

    // A panic mid-push leaves the map consistent, so a poisoned lock is reused.
    fn lock(&self) -> MutexGuard<'_, JitterBuffer> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
