//! Pending frame queue between broadcast ticks.

use std::collections::VecDeque;

use bridge_types::SharedFrame;
use tracing::warn;

/// Ordered batch of frames collected since the last broadcast.
///
/// Insertion order is broadcast order. The queue is unbounded unless a capacity
/// is given, in which case the oldest frame makes room for the newest.
#[derive(Debug, Default)]
pub struct FrameAggregator {
    pending: VecDeque<SharedFrame>,
    capacity: Option<usize>,
    dropped: u64,
}

impl FrameAggregator {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity: capacity.map(|c| c.max(1)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, frame: SharedFrame) {
        if let Some(capacity) = self.capacity {
            if self.pending.len() >= capacity {
                self.pending.pop_front();
                self.dropped += 1;
                if self.dropped == 1 || self.dropped % 1000 == 0 {
                    warn!(capacity, dropped = self.dropped, "Pending frame queue full, dropping oldest frame");
                }
            }
        }
        self.pending.push_back(frame);
    }

    /// Takes the whole batch, leaving the queue empty and its storage released.
    pub fn take(&mut self) -> Vec<SharedFrame> {
        let batch = std::mem::take(&mut self.pending);
        batch.into()
    }

    /// Discards every pending frame and releases the storage.
    pub fn clear(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        self.pending.shrink_to_fit();
        discarded
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Frames lost to the capacity limit since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
