use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::capture::driver::RawFrame;
use crate::error::BridgeError;

/// Depth sensor resolution
pub const DEPTH_WIDTH: u32 = 512;
pub const DEPTH_HEIGHT: u32 = 424;
pub const DEPTH_SAMPLES: usize = (DEPTH_WIDTH * DEPTH_HEIGHT) as usize;

/// Depth frame with owned float samples in meters, row-major
#[derive(Debug, Clone)]
pub struct DepthFrame {
    /// Immutable once published
    pub samples: Vec<f32>,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: DepthFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Sample formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthFormat {
    Float32Depth,
}

impl DepthFormat {
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            DepthFormat::Float32Depth => 4,
        }
    }
}

impl DepthFrame {
    /// Copy a driver frame out into `samples`, reusing its allocation.
    ///
    /// The raw frame must match the fixed 512x424 float32 shape. `samples`
    /// is cleared first, so a recycled buffer never leaks old data.
    pub fn from_raw(
        raw: &RawFrame,
        sequence: u64,
        mut samples: Vec<f32>,
    ) -> Result<Self, BridgeError> {
        let format = DepthFormat::Float32Depth;
        if raw.width != DEPTH_WIDTH
            || raw.height != DEPTH_HEIGHT
            || raw.bytes_per_pixel != format.bytes_per_sample()
        {
            return Err(BridgeError::MalformedFrame {
                width: raw.width,
                height: raw.height,
                bytes_per_pixel: raw.bytes_per_pixel,
            });
        }

        let data = raw.data();
        if data.len() != DEPTH_SAMPLES * format.bytes_per_sample() {
            return Err(BridgeError::MalformedFrame {
                width: raw.width,
                height: raw.height,
                bytes_per_pixel: raw.bytes_per_pixel,
            });
        }

        samples.clear();
        samples.reserve(DEPTH_SAMPLES);
        samples.extend(
            data.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );

        Ok(Self {
            samples,
            meta: FrameMetadata {
                sequence,
                width: raw.width,
                height: raw.height,
                format,
                device_timestamp: raw.device_timestamp,
            },
            timestamp: Instant::now(),
        })
    }

    /// Depth at column `x`, row `y`
    pub fn sample(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.meta.width || y >= self.meta.height {
            return None;
        }
        self.samples
            .get((y * self.meta.width + x) as usize)
            .copied()
    }

    /// Flat row-major copy into a host output plane
    pub fn copy_to(&self, out: &mut [f32]) -> Result<(), BridgeError> {
        if out.len() != self.samples.len() {
            return Err(BridgeError::MatrixShape {
                expected: self.samples.len(),
                actual: out.len(),
            });
        }
        out.copy_from_slice(&self.samples);
        Ok(())
    }
}
