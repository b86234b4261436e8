//! Caller-facing surface: open, close and a per-tick frame request

use std::sync::Arc;

use tracing::{debug, info};

use crate::capture::frame::DEPTH_SAMPLES;
use crate::capture::SensorDriver;
use crate::error::{BridgeError, BridgeStatus};
use crate::pipeline::ReadyFrame;
use crate::session::{AcquisitionSession, SessionHealth, SessionState};
use crate::{BridgeConfig, PipelineBackend};

/// Owns the driver and a single session. Lifecycle calls take `&mut self`,
/// per-tick calls only `&self`.
pub struct Bridge {
    driver: Box<dyn SensorDriver>,
    session: AcquisitionSession,
    backend: PipelineBackend,
}

impl Bridge {
    pub fn new(driver: Box<dyn SensorDriver>, config: &BridgeConfig) -> Self {
        Self {
            driver,
            session: AcquisitionSession::new(config.watchdog()),
            backend: config.backend,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn backend(&self) -> PipelineBackend {
        self.backend
    }

    /// Select the backend for the next open; rejected while a session is live
    pub fn set_backend(&mut self, backend: PipelineBackend) -> Result<(), BridgeError> {
        if self.session.state() != SessionState::Closed {
            return Err(BridgeError::BackendLocked);
        }
        if backend != self.backend {
            info!(from = %self.backend, to = %backend, "pipeline backend changed");
        }
        self.backend = backend;
        Ok(())
    }

    pub fn open(&mut self) -> Result<(), BridgeError> {
        self.session.open(self.driver.as_mut(), self.backend)
    }

    pub fn close(&mut self) -> Result<(), BridgeError> {
        self.session.close();
        Ok(())
    }

    pub fn open_status(&mut self) -> BridgeStatus {
        BridgeStatus::from(&self.open())
    }

    pub fn close_status(&mut self) -> BridgeStatus {
        BridgeStatus::from(&self.close())
    }

    /// The most recent frame, immediately. `NotOpen` before open, `Unavailable`
    /// while streaming with nothing published yet.
    pub fn request_latest_frame(&self) -> Result<Arc<ReadyFrame>, BridgeError> {
        self.session.poll()
    }

    /// Copy the latest frame into a 512x424 float32 output plane and return
    /// its generation.
    pub fn fill_matrix(&self, out: &mut [f32]) -> Result<u64, BridgeError> {
        if out.len() != DEPTH_SAMPLES {
            return Err(BridgeError::MatrixShape {
                expected: DEPTH_SAMPLES,
                actual: out.len(),
            });
        }
        let ready = self.request_latest_frame()?;
        ready.frame.copy_to(out)?;
        debug!(generation = ready.generation, "matrix filled");
        Ok(ready.generation)
    }

    pub fn health(&self) -> SessionHealth {
        self.session.health()
    }

    pub fn check_watchdog(&self) -> Result<(), BridgeError> {
        self.session.check_watchdog()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // The device must be closed while the driver context is still alive.
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{DriverError, FrameListener, SensorDevice, SimulatedDriver};
    use crate::SimulatorConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Driver whose device records whether the context was already gone at close
    struct ContextDriver {
        dropped: Arc<AtomicBool>,
        closed_after_drop: Arc<Mutex<Option<bool>>>,
    }

    struct ContextDevice {
        context_dropped: Arc<AtomicBool>,
        closed_after_drop: Arc<Mutex<Option<bool>>>,
    }

    impl SensorDriver for ContextDriver {
        fn enumerate_devices(&mut self) -> usize {
            1
        }

        fn create_pipeline(&mut self, _backend: PipelineBackend) -> Result<(), DriverError> {
            Ok(())
        }

        fn open_default_device(
            &mut self,
            _backend: PipelineBackend,
        ) -> Option<Box<dyn SensorDevice>> {
            Some(Box::new(ContextDevice {
                context_dropped: self.dropped.clone(),
                closed_after_drop: self.closed_after_drop.clone(),
            }))
        }
    }

    impl Drop for ContextDriver {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::Release);
        }
    }

    impl SensorDevice for ContextDevice {
        fn serial(&self) -> String {
            "CTX".into()
        }

        fn set_depth_listener(&mut self, _listener: Option<Arc<dyn FrameListener>>) {}

        fn start(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        fn stop(&mut self) {}

        fn close(&mut self) {
            let mut closed = self.closed_after_drop.lock().unwrap();
            if closed.is_none() {
                *closed = Some(self.context_dropped.load(Ordering::Acquire));
            }
        }
    }

    fn manual_bridge(devices: usize) -> (Bridge, crate::capture::SimulatedSensor) {
        let (driver, sensor) = SimulatedDriver::new(&SimulatorConfig {
            devices,
            fps: 0,
            pool_size: 2,
            accelerated: false,
        });
        (Bridge::new(Box::new(driver), &BridgeConfig::default()), sensor)
    }

    #[test]
    fn test_request_before_open_is_not_open() {
        let (bridge, _sensor) = manual_bridge(1);
        assert!(matches!(
            bridge.request_latest_frame(),
            Err(BridgeError::NotOpen)
        ));
    }

    #[test]
    fn test_backend_locked_while_streaming() {
        let (mut bridge, sensor) = manual_bridge(1);
        bridge.open().unwrap();
        assert!(matches!(
            bridge.set_backend(PipelineBackend::Accelerated),
            Err(BridgeError::BackendLocked)
        ));

        bridge.close().unwrap();
        sensor.set_accelerated(true);
        bridge.set_backend(PipelineBackend::Accelerated).unwrap();
        bridge.open().unwrap();
        assert_eq!(bridge.health().backend, Some(PipelineBackend::Accelerated));
    }

    #[test]
    fn test_status_codes() {
        let (mut bridge, _sensor) = manual_bridge(0);
        assert_eq!(bridge.open_status(), BridgeStatus::NoDeviceFound);
        assert_eq!(bridge.close_status(), BridgeStatus::Ok);

        let (mut bridge, _sensor) = manual_bridge(1);
        assert_eq!(bridge.open_status(), BridgeStatus::Ok);
        assert_eq!(bridge.open_status(), BridgeStatus::AlreadyOpen);
    }

    #[test]
    fn test_fill_matrix() {
        let (mut bridge, sensor) = manual_bridge(1);
        let mut out = vec![0.0f32; DEPTH_SAMPLES];

        assert!(matches!(
            bridge.fill_matrix(&mut out),
            Err(BridgeError::NotOpen)
        ));
        bridge.open().unwrap();
        assert!(matches!(
            bridge.fill_matrix(&mut out),
            Err(BridgeError::Unavailable)
        ));

        assert!(sensor.emit_with(|x, y| (y * 512 + x) as f32));
        assert_eq!(bridge.fill_matrix(&mut out).unwrap(), 1);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[513], 513.0);

        let mut wrong = vec![0.0f32; 640 * 480];
        assert!(matches!(
            bridge.fill_matrix(&mut wrong),
            Err(BridgeError::MatrixShape { .. })
        ));
    }

    #[test]
    fn test_drop_closes_device_before_driver() {
        let dropped = Arc::new(AtomicBool::new(false));
        let closed_after_drop = Arc::new(Mutex::new(None));
        let driver = ContextDriver {
            dropped: dropped.clone(),
            closed_after_drop: closed_after_drop.clone(),
        };

        let mut bridge = Bridge::new(Box::new(driver), &BridgeConfig::default());
        bridge.open().unwrap();
        drop(bridge);

        assert!(dropped.load(Ordering::Acquire));
        assert_eq!(*closed_after_drop.lock().unwrap(), Some(false));
    }
}
