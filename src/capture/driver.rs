//! Sensor driver seam
//!
//! The bridge never talks to USB or decodes packets itself. A driver binding
//! implements these traits; [`crate::capture::SimulatedDriver`] is the one
//! shipped with the crate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use flume::Sender;
use thiserror::Error;

use crate::PipelineBackend;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("pipeline backend {0} is not available")]
    Unsupported(PipelineBackend),

    #[error("failed to start stream: {0}")]
    Start(String),
}

/// Driver entry point, one per process-side bridge
pub trait SensorDriver: Send {
    /// Number of sensors currently attached
    fn enumerate_devices(&mut self) -> usize;

    /// Instantiate the packet pipeline for `backend`
    fn create_pipeline(&mut self, backend: PipelineBackend) -> Result<(), DriverError>;

    /// `None` is the driver's null handle
    fn open_default_device(&mut self, backend: PipelineBackend) -> Option<Box<dyn SensorDevice>>;
}

/// An opened sensor
pub trait SensorDevice: Send {
    fn serial(&self) -> String;

    /// Replace the depth listener; `None` unregisters it
    fn set_depth_listener(&mut self, listener: Option<Arc<dyn FrameListener>>);

    fn start(&mut self) -> Result<(), DriverError>;

    fn stop(&mut self);

    fn close(&mut self);
}

/// Receives depth frames on the driver's own thread
pub trait FrameListener: Send + Sync {
    fn on_new_frame(&self, frame: RawFrame);
}

/// A lease on a driver-owned buffer
///
/// Holding the lease is the acquire. Dropping it hands the buffer back to the
/// driver pool, which stalls while every buffer is leased out.
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: usize,
    pub sequence: u64,
    pub device_timestamp: Option<Duration>,
    data: BytesMut,
    release: Option<Sender<BytesMut>>,
}

impl RawFrame {
    pub fn pooled(
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
        sequence: u64,
        device_timestamp: Option<Duration>,
        data: BytesMut,
        release: Sender<BytesMut>,
    ) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
            sequence,
            device_timestamp,
            data,
            release: Some(release),
        }
    }

    /// A frame that is not backed by a pool
    pub fn detached(
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
        sequence: u64,
        device_timestamp: Option<Duration>,
        data: BytesMut,
    ) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
            sequence,
            device_timestamp,
            data,
            release: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for RawFrame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            let mut data = std::mem::take(&mut self.data);
            data.clear();
            // Pool gone means the driver was torn down; the buffer just frees.
            let _ = release.try_send(data);
        }
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes_per_pixel", &self.bytes_per_pixel)
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_returns_buffer_to_pool() {
        let (tx, rx) = flume::bounded::<BytesMut>(1);
        let mut data = BytesMut::with_capacity(16);
        data.extend_from_slice(&[1, 2, 3, 4]);

        let frame = RawFrame::pooled(1, 1, 4, 1, None, data, tx);
        assert!(rx.is_empty());
        drop(frame);

        let returned = rx.try_recv().unwrap();
        assert!(returned.is_empty());
        assert!(returned.capacity() >= 16);
    }

    #[test]
    fn test_detached_drop_is_silent() {
        let frame = RawFrame::detached(1, 1, 4, 1, None, BytesMut::from(&[0u8; 4][..]));
        assert_eq!(frame.data().len(), 4);
    }
}
