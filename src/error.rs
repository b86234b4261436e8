use std::time::Duration;

use thiserror::Error;

use crate::capture::DriverError;
use crate::PipelineBackend;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no depth sensor connected")]
    NoDeviceFound,

    #[error("pipeline backend {0} is not available")]
    BackendUnavailable(PipelineBackend),

    #[error("driver returned no device handle")]
    DeviceOpenFailed,

    #[error("failed to start depth stream: {0}")]
    StreamStart(#[source] DriverError),

    #[error("session is already open")]
    AlreadyOpen,

    #[error("session is not open")]
    NotOpen,

    #[error("no depth frame received yet")]
    Unavailable,

    #[error("no depth frame for {elapsed:?}")]
    FrameTimeout { elapsed: Duration },

    #[error("pipeline backend can only be changed while closed")]
    BackendLocked,

    #[error("malformed depth frame {width}x{height} at {bytes_per_pixel} bytes per pixel")]
    MalformedFrame {
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
    },

    #[error("output matrix holds {actual} samples, expected {expected}")]
    MatrixShape { expected: usize, actual: usize },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Numeric status handed across the host boundary
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Ok = 0,
    NoDeviceFound = 1,
    BackendUnavailable = 2,
    DeviceOpenFailed = 3,
    AlreadyOpen = 4,
    NotOpen = 5,
    Unavailable = 6,
    FrameTimeout = 7,
    BackendLocked = 8,
    InvalidData = 9,
}

impl BridgeStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<&BridgeError> for BridgeStatus {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::NoDeviceFound => BridgeStatus::NoDeviceFound,
            BridgeError::BackendUnavailable(_) => BridgeStatus::BackendUnavailable,
            BridgeError::DeviceOpenFailed | BridgeError::StreamStart(_) => {
                BridgeStatus::DeviceOpenFailed
            }
            BridgeError::AlreadyOpen => BridgeStatus::AlreadyOpen,
            BridgeError::NotOpen => BridgeStatus::NotOpen,
            BridgeError::Unavailable => BridgeStatus::Unavailable,
            BridgeError::FrameTimeout { .. } => BridgeStatus::FrameTimeout,
            BridgeError::BackendLocked => BridgeStatus::BackendLocked,
            BridgeError::MalformedFrame { .. }
            | BridgeError::MatrixShape { .. }
            | BridgeError::Config(_) => BridgeStatus::InvalidData,
        }
    }
}

impl<T> From<&Result<T, BridgeError>> for BridgeStatus {
    fn from(result: &Result<T, BridgeError>) -> Self {
        match result {
            Ok(_) => BridgeStatus::Ok,
            Err(e) => e.into(),
        }
    }
}
