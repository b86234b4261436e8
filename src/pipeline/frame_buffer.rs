//! Lock-free latest-frame slot between the driver thread and the tick thread

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::capture::frame::{DepthFrame, DEPTH_SAMPLES};

/// A published frame and the generation it was published under
#[derive(Debug)]
pub struct ReadyFrame {
    pub generation: u64,
    pub frame: DepthFrame,
}

/// Double buffer for depth frames.
///
/// One producer writes into an in-flight buffer and swaps it in whole; any
/// number of consumers poll the ready slot. The ready frame is never written
/// through after publication.
pub struct FrameBuffer {
    ready: ArcSwapOption<ReadyFrame>,

    generation: AtomicU64,

    /// Storage of the last retired frame, reused for the next in-flight one
    spare: Mutex<Option<Vec<f32>>>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    polled: AtomicU64,
    recycled: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameBufferStats {
    pub published: u64,
    pub polled: u64,
    pub recycled: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            ready: ArcSwapOption::const_empty(),
            generation: AtomicU64::new(0),
            spare: Mutex::new(None),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: storage for the next in-flight frame
    pub fn take_spare(&self) -> Vec<f32> {
        self.spare
            .try_lock()
            .ok()
            .and_then(|mut spare| spare.take())
            .unwrap_or_else(|| Vec::with_capacity(DEPTH_SAMPLES))
    }

    /// Producer: install `frame` as the ready frame, returning its generation
    pub fn publish(&self, frame: DepthFrame) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let previous = self
            .ready
            .swap(Some(Arc::new(ReadyFrame { generation, frame })));
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        // Only reclaim storage no reader can still see.
        if let Some(retired) = previous.and_then(|prev| Arc::try_unwrap(prev).ok()) {
            if let Ok(mut spare) = self.spare.try_lock() {
                *spare = Some(retired.frame.samples);
                self.stats.recycled.fetch_add(1, Ordering::Relaxed);
            }
        }

        generation
    }

    /// Consumer: the current ready frame, never blocks
    pub fn poll(&self) -> Option<Arc<ReadyFrame>> {
        let ready = self.ready.load_full();
        if ready.is_some() {
            self.stats.polled.fetch_add(1, Ordering::Relaxed);
        }
        ready
    }

    /// Generation of the most recent publish, 0 before the first
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> FrameBufferStats {
        FrameBufferStats {
            published: self.stats.published.load(Ordering::Relaxed),
            polled: self.stats.polled.load(Ordering::Relaxed),
            recycled: self.stats.recycled.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
