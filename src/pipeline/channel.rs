//! Capacity-1 frame hand-off between a producer thread and its session.
//!
//! The slot always holds the newest undrained frame. A put never waits for
//! the consumer: an unread frame is simply replaced.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use serde::Serialize;

use crate::capture::RawFrame;
use crate::error::SinkError;

/// Anything a producer can hand frames to.
pub trait FrameSink: Send {
    /// Take the next frame. `SinkError::Closed` tells the producer to stop.
    fn accept(&mut self, frame: RawFrame) -> Result<(), SinkError>;

    /// Time since the consumer last asked for a frame, when the sink can tell.
    fn idle_for(&self) -> Option<Duration> {
        None
    }
}

/// Result of [`FrameChannel::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The slot was empty.
    Stored,
    /// An undrained frame was discarded in favour of this one.
    Replaced,
}

/// Latest-value-wins slot for one session.
pub struct FrameChannel {
    slot: ArcSwapOption<RawFrame>,

    /// Millis since `created` of the last consumer `get_nowait`
    last_get: AtomicU64,
    created: Instant,
    closed: AtomicBool,

    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Snapshot of channel counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
}

impl FrameChannel {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            last_get: AtomicU64::new(0),
            created: Instant::now(),
            closed: AtomicBool::new(false),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: store `frame`, discarding any unread predecessor.
    pub fn put(&self, frame: RawFrame) -> PutOutcome {
        let previous = self.slot.swap(Some(Arc::new(frame)));
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);

        if previous.is_some() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_dropped").increment(1);
            PutOutcome::Replaced
        } else {
            PutOutcome::Stored
        }
    }

    /// Consumer: take the latest frame if one is waiting.
    ///
    /// Every call counts as consumer activity, whether or not a frame was
    /// waiting.
    pub fn get_nowait(&self) -> Option<Arc<RawFrame>> {
        self.touch();
        let frame = self.slot.swap(None)?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Mark the consumer as still attached without taking a frame.
    pub fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_get.store(now, Ordering::Relaxed);
    }

    /// Time since the consumer last asked for a frame.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_get.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Refuse further puts; the producer sees `SinkError::Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slot.store(None);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for Arc<FrameChannel> {
    fn accept(&mut self, frame: RawFrame) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        self.put(frame);
        Ok(())
    }

    fn idle_for(&self) -> Option<Duration> {
        Some(FrameChannel::idle_for(self))
    }
}
