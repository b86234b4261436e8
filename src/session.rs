//! Sensor session: owns the device handle and feeds the frame buffer

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use tracing::{debug, info, instrument, warn};

use crate::capture::{DepthFrame, FrameListener, RawFrame, SensorDevice, SensorDriver};
use crate::error::BridgeError;
use crate::pipeline::{FrameBuffer, ReadyFrame};
use crate::PipelineBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Streaming,
    Closing,
}

/// Point-in-time view of the stream
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHealth {
    pub state: SessionState,
    pub backend: Option<PipelineBackend>,
    pub generation: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub last_frame_age: Option<Duration>,
    pub stalled: bool,
}

/// Driver-side callback target
struct DepthListener {
    buffer: Arc<FrameBuffer>,
    active: AtomicBool,
    started: Instant,
    /// Nanoseconds after `started` of the last published frame
    last_frame_ns: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl DepthListener {
    fn new(buffer: Arc<FrameBuffer>) -> Self {
        Self {
            buffer,
            active: AtomicBool::new(true),
            started: Instant::now(),
            last_frame_ns: AtomicU64::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn last_frame_age(&self) -> Option<Duration> {
        if self.buffer.generation() == 0 {
            return None;
        }
        let at = Duration::from_nanos(self.last_frame_ns.load(Ordering::Acquire));
        Some(self.started.elapsed().saturating_sub(at))
    }
}

impl FrameListener for DepthListener {
    fn on_new_frame(&self, raw: RawFrame) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }

        self.received.fetch_add(1, Ordering::AcqRel);

        let samples = self.buffer.take_spare();
        let copied = DepthFrame::from_raw(&raw, raw.sequence, samples);
        // Hand the driver buffer back before publishing.
        drop(raw);

        match copied {
            Ok(frame) => {
                // Close may have started while copying.
                if !self.active.load(Ordering::Acquire) {
                    return;
                }
                // Only valid frames count as liveness for the watchdog.
                let now = self.started.elapsed().as_nanos() as u64;
                self.last_frame_ns.store(now, Ordering::Release);
                let sequence = frame.meta.sequence;
                let generation = self.buffer.publish(frame);
                counter!("depthbridge_frames_published").increment(1);
                gauge!("depthbridge_generation").set(generation as f64);
                debug!(generation, sequence, "depth frame published");
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("depthbridge_frames_dropped").increment(1);
                warn!(error = %e, "dropping depth frame");
            }
        }
    }
}

/// One sensor connection from open to close
pub struct AcquisitionSession {
    state: SessionState,
    backend: Option<PipelineBackend>,
    device: Option<Box<dyn SensorDevice>>,
    listener: Option<Arc<DepthListener>>,
    watchdog: Duration,
}

impl AcquisitionSession {
    pub fn new(watchdog: Duration) -> Self {
        Self {
            state: SessionState::Closed,
            backend: None,
            device: None,
            listener: None,
            watchdog,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn backend(&self) -> Option<PipelineBackend> {
        self.backend
    }

    /// Connect to the default sensor and start streaming depth.
    ///
    /// Any failure leaves the session `Closed`.
    #[instrument(skip(self, driver))]
    pub fn open(
        &mut self,
        driver: &mut dyn SensorDriver,
        backend: PipelineBackend,
    ) -> Result<(), BridgeError> {
        if self.state != SessionState::Closed {
            return Err(BridgeError::AlreadyOpen);
        }

        info!("reaching for depth sensor");
        self.state = SessionState::Opening;
        let result = self.try_open(driver, backend);
        if let Err(e) = &result {
            warn!(error = %e, "failed to open depth sensor");
            self.state = SessionState::Closed;
        }
        result
    }

    fn try_open(
        &mut self,
        driver: &mut dyn SensorDriver,
        backend: PipelineBackend,
    ) -> Result<(), BridgeError> {
        let count = driver.enumerate_devices();
        if count == 0 {
            return Err(BridgeError::NoDeviceFound);
        }
        debug!(count, "depth sensors found");

        driver
            .create_pipeline(backend)
            .map_err(|_| BridgeError::BackendUnavailable(backend))?;

        let mut device = driver
            .open_default_device(backend)
            .ok_or(BridgeError::DeviceOpenFailed)?;

        let buffer = Arc::new(FrameBuffer::new());
        let listener = Arc::new(DepthListener::new(buffer));
        device.set_depth_listener(Some(listener.clone()));

        if let Err(e) = device.start() {
            listener.active.store(false, Ordering::Release);
            device.set_depth_listener(None);
            device.close();
            return Err(BridgeError::StreamStart(e));
        }

        info!(serial = %device.serial(), %backend, "depth stream started");
        self.device = Some(device);
        self.listener = Some(listener);
        self.backend = Some(backend);
        self.state = SessionState::Streaming;
        Ok(())
    }

    /// Stop the stream and drop the device and buffer. No-op when closed.
    #[instrument(skip(self))]
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;

        if let Some(listener) = &self.listener {
            listener.active.store(false, Ordering::Release);
        }
        if let Some(mut device) = self.device.take() {
            device.stop();
            device.set_depth_listener(None);
            device.close();
        }
        if let Some(listener) = self.listener.take() {
            info!(
                generation = listener.buffer.generation(),
                received = listener.received.load(Ordering::Relaxed),
                "depth stream closed"
            );
        }

        self.backend = None;
        self.state = SessionState::Closed;
    }

    /// Latest published frame without waiting
    pub fn poll(&self) -> Result<Arc<ReadyFrame>, BridgeError> {
        match (&self.listener, self.state) {
            (Some(listener), SessionState::Streaming) => {
                listener.buffer.poll().ok_or(BridgeError::Unavailable)
            }
            _ => Err(BridgeError::NotOpen),
        }
    }

    pub fn health(&self) -> SessionHealth {
        let Some(listener) = self.listener.as_ref() else {
            return SessionHealth {
                state: self.state,
                backend: self.backend,
                generation: 0,
                frames_received: 0,
                frames_dropped: 0,
                last_frame_age: None,
                stalled: false,
            };
        };

        let last_frame_age = listener.last_frame_age();
        let silence = last_frame_age.unwrap_or_else(|| listener.started.elapsed());
        SessionHealth {
            state: self.state,
            backend: self.backend,
            generation: listener.buffer.generation(),
            frames_received: listener.received.load(Ordering::Relaxed),
            frames_dropped: listener.dropped.load(Ordering::Relaxed),
            last_frame_age,
            stalled: self.state == SessionState::Streaming && silence > self.watchdog,
        }
    }

    /// `FrameTimeout` once the driver has been silent past the watchdog
    pub fn check_watchdog(&self) -> Result<(), BridgeError> {
        if self.state != SessionState::Streaming {
            return Err(BridgeError::NotOpen);
        }
        let health = self.health();
        if health.stalled {
            let elapsed = health
                .last_frame_age
                .or_else(|| self.listener.as_ref().map(|l| l.started.elapsed()))
                .unwrap_or_default();
            return Err(BridgeError::FrameTimeout { elapsed });
        }
        Ok(())
    }
}

impl Drop for AcquisitionSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{SimulatedDriver, SimulatedSensor};
    use crate::SimulatorConfig;
    use std::thread;

    fn manual(devices: usize) -> (SimulatedDriver, SimulatedSensor) {
        SimulatedDriver::new(&SimulatorConfig {
            devices,
            fps: 0,
            pool_size: 2,
            accelerated: false,
        })
    }

    #[test]
    fn test_open_without_device_stays_closed() {
        let (mut driver, _sensor) = manual(0);
        let mut session = AcquisitionSession::new(Duration::from_secs(1));

        let err = session.open(&mut driver, PipelineBackend::Cpu).unwrap_err();
        assert!(matches!(err, BridgeError::NoDeviceFound));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_unavailable_backend_is_reported() {
        let (mut driver, sensor) = manual(1);
        let mut session = AcquisitionSession::new(Duration::from_secs(1));

        let err = session
            .open(&mut driver, PipelineBackend::Accelerated)
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::BackendUnavailable(PipelineBackend::Accelerated)
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!sensor.is_streaming());
    }

    #[test]
    fn test_null_device_handle() {
        let (mut driver, sensor) = manual(1);
        sensor.set_open_fails(true);
        let mut session = AcquisitionSession::new(Duration::from_secs(1));

        let err = session.open(&mut driver, PipelineBackend::Cpu).unwrap_err();
        assert!(matches!(err, BridgeError::DeviceOpenFailed));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_start_failure_unwires_listener() {
        let (mut driver, sensor) = manual(1);
        sensor.set_start_fails(true);
        let mut session = AcquisitionSession::new(Duration::from_secs(1));

        let err = session.open(&mut driver, PipelineBackend::Cpu).unwrap_err();
        assert!(matches!(err, BridgeError::StreamStart(_)));
        assert!(!sensor.has_listener());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_open_twice_is_already_open() {
        let (mut driver, sensor) = manual(1);
        let mut session = AcquisitionSession::new(Duration::from_secs(1));
        session.open(&mut driver, PipelineBackend::Cpu).unwrap();
        assert!(sensor.emit(0.5));

        let err = session.open(&mut driver, PipelineBackend::Cpu).unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyOpen));
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.poll().unwrap().generation, 1);
    }

    #[test]
    fn test_close_releases_everything() {
        let (mut driver, sensor) = manual(1);
        let mut session = AcquisitionSession::new(Duration::from_secs(1));
        session.open(&mut driver, PipelineBackend::Cpu).unwrap();
        assert!(sensor.emit(1.0));

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!sensor.is_streaming());
        assert!(!sensor.has_listener());
        assert_eq!(sensor.free_buffers(), 2);
        assert!(matches!(session.poll(), Err(BridgeError::NotOpen)));

        // Idempotent
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let (mut driver, _sensor) = manual(1);
        let mut session = AcquisitionSession::new(Duration::from_secs(1));
        session.open(&mut driver, PipelineBackend::Cpu).unwrap();

        let listener = session.listener.clone().unwrap();
        listener.on_new_frame(RawFrame::detached(
            16,
            16,
            4,
            1,
            None,
            bytes::BytesMut::zeroed(16 * 16 * 4),
        ));

        let health = session.health();
        assert_eq!(health.frames_received, 1);
        assert_eq!(health.frames_dropped, 1);
        assert_eq!(health.generation, 0);
        assert!(matches!(session.poll(), Err(BridgeError::Unavailable)));
    }

    #[test]
    fn test_malformed_frames_do_not_feed_watchdog() {
        let (mut driver, _sensor) = manual(1);
        let mut session = AcquisitionSession::new(Duration::from_millis(20));
        session.open(&mut driver, PipelineBackend::Cpu).unwrap();
        let listener = session.listener.clone().unwrap();

        thread::sleep(Duration::from_millis(40));
        listener.on_new_frame(RawFrame::detached(
            16,
            16,
            4,
            1,
            None,
            bytes::BytesMut::zeroed(16 * 16 * 4),
        ));

        let health = session.health();
        assert_eq!(health.frames_received, 1);
        assert_eq!(health.last_frame_age, None);
        assert!(health.stalled);
        assert!(matches!(
            session.check_watchdog(),
            Err(BridgeError::FrameTimeout { .. })
        ));
    }

    #[test]
    fn test_frame_after_deactivation_is_not_published() {
        let (mut driver, sensor) = manual(1);
        let mut session = AcquisitionSession::new(Duration::from_secs(1));
        session.open(&mut driver, PipelineBackend::Cpu).unwrap();
        let listener = session.listener.clone().unwrap();

        listener.active.store(false, Ordering::Release);
        assert!(sensor.emit(1.0));

        assert_eq!(listener.buffer.generation(), 0);
        assert!(listener.buffer.poll().is_none());
        assert_eq!(sensor.free_buffers(), 2);
    }

    #[test]
    fn test_watchdog_counts_from_stream_start() {
        let (mut driver, _sensor) = manual(1);
        let mut session = AcquisitionSession::new(Duration::from_millis(10));
        session.open(&mut driver, PipelineBackend::Cpu).unwrap();

        thread::sleep(Duration::from_millis(30));
        let health = session.health();
        assert!(health.stalled);
        assert_eq!(health.last_frame_age, None);
        match session.check_watchdog() {
            Err(BridgeError::FrameTimeout { elapsed }) => {
                assert!(elapsed >= Duration::from_millis(10));
            }
            other => panic!("expected FrameTimeout, got {:?}", other),
        }
    }

    #[test]
    fn test_watchdog_flags_silence() {
        let (mut driver, sensor) = manual(1);
        let mut session = AcquisitionSession::new(Duration::from_millis(20));
        session.open(&mut driver, PipelineBackend::Cpu).unwrap();
        assert!(sensor.emit(1.0));
        assert!(session.check_watchdog().is_ok());

        thread::sleep(Duration::from_millis(60));
        assert!(session.health().stalled);
        assert!(matches!(
            session.check_watchdog(),
            Err(BridgeError::FrameTimeout { .. })
        ));

        assert!(sensor.emit(2.0));
        assert!(session.check_watchdog().is_ok());
        let age = session.health().last_frame_age.unwrap();
        assert!(age < Duration::from_millis(20));
    }
}
