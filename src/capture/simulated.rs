//! Simulated depth sensor
//!
//! Behaves like a driver with a fixed frame pool: frames are leased to the
//! listener and return to the pool when dropped. While the pool is empty new
//! packets are dropped, the way a real sensor drops packets when its
//! processor falls behind.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, trace, warn};

use crate::capture::driver::{DriverError, FrameListener, RawFrame, SensorDevice, SensorDriver};
use crate::capture::frame::{DEPTH_HEIGHT, DEPTH_SAMPLES, DEPTH_WIDTH};
use crate::{PipelineBackend, SimulatorConfig};

struct Shared {
    attached: AtomicUsize,
    accelerated: AtomicBool,
    open_fails: AtomicBool,
    start_fails: AtomicBool,
    streaming: AtomicBool,
    listener: Mutex<Option<Arc<dyn FrameListener>>>,
    sequence: AtomicU64,
    dropped: AtomicU64,
    pool_tx: Sender<BytesMut>,
    pool_rx: Receiver<BytesMut>,
    epoch: Instant,
}

/// Driver half, handed to the bridge
pub struct SimulatedDriver {
    shared: Arc<Shared>,
    fps: u32,
}

/// Control half, kept by tests and the demo to poke the fake hardware
#[derive(Clone)]
pub struct SimulatedSensor {
    shared: Arc<Shared>,
}

impl SimulatedDriver {
    pub fn new(config: &SimulatorConfig) -> (Self, SimulatedSensor) {
        let pool_size = config.pool_size.max(1);
        let (pool_tx, pool_rx) = flume::bounded(pool_size);
        for _ in 0..pool_size {
            // Capacity is exactly pool_size, so this never fails.
            let _ = pool_tx.try_send(BytesMut::with_capacity(DEPTH_SAMPLES * 4));
        }

        let shared = Arc::new(Shared {
            attached: AtomicUsize::new(config.devices),
            accelerated: AtomicBool::new(config.accelerated),
            open_fails: AtomicBool::new(false),
            start_fails: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            listener: Mutex::new(None),
            sequence: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            pool_tx,
            pool_rx,
            epoch: Instant::now(),
        });

        let sensor = SimulatedSensor {
            shared: shared.clone(),
        };
        (
            Self {
                shared,
                fps: config.fps,
            },
            sensor,
        )
    }
}

impl SensorDriver for SimulatedDriver {
    fn enumerate_devices(&mut self) -> usize {
        self.shared.attached.load(Ordering::Acquire)
    }

    fn create_pipeline(&mut self, backend: PipelineBackend) -> Result<(), DriverError> {
        match backend {
            PipelineBackend::Cpu => Ok(()),
            PipelineBackend::Accelerated if self.shared.accelerated.load(Ordering::Acquire) => {
                Ok(())
            }
            PipelineBackend::Accelerated => Err(DriverError::Unsupported(backend)),
        }
    }

    fn open_default_device(&mut self, backend: PipelineBackend) -> Option<Box<dyn SensorDevice>> {
        if self.shared.attached.load(Ordering::Acquire) == 0
            || self.shared.open_fails.load(Ordering::Acquire)
        {
            return None;
        }
        debug!(%backend, "simulated device opened");
        Some(Box::new(SimulatedDevice {
            shared: self.shared.clone(),
            fps: self.fps,
            producer: None,
        }))
    }
}

impl SimulatedSensor {
    pub fn attach(&self) {
        self.shared.attached.fetch_add(1, Ordering::AcqRel);
    }

    pub fn detach(&self) {
        let _ = self
            .shared
            .attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn set_accelerated(&self, available: bool) {
        self.shared.accelerated.store(available, Ordering::Release);
    }

    /// Make the next opens hand back a null device
    pub fn set_open_fails(&self, fails: bool) {
        self.shared.open_fails.store(fails, Ordering::Release);
    }

    pub fn set_start_fails(&self, fails: bool) {
        self.shared.start_fails.store(fails, Ordering::Release);
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire)
    }

    pub fn has_listener(&self) -> bool {
        self.shared
            .listener
            .lock()
            .map(|l| l.is_some())
            .unwrap_or(false)
    }

    /// Packets lost because every pool buffer was leased out
    pub fn dropped_packets(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn free_buffers(&self) -> usize {
        self.shared.pool_rx.len()
    }

    /// Push one frame with every sample set to `value`
    pub fn emit(&self, value: f32) -> bool {
        self.emit_with(|_, _| value)
    }

    /// Push one frame through the registered listener on the calling thread.
    ///
    /// Returns false when the stream is stopped, the pool is exhausted or no
    /// listener is registered.
    pub fn emit_with(&self, depth: impl Fn(u32, u32) -> f32) -> bool {
        emit_frame(&self.shared, depth)
    }
}

fn emit_frame(shared: &Shared, depth: impl Fn(u32, u32) -> f32) -> bool {
    if !shared.streaming.load(Ordering::Acquire) {
        return false;
    }

    let mut data = match shared.pool_rx.try_recv() {
        Ok(buf) => buf,
        Err(_) => {
            let dropped = shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "frame pool exhausted, dropping packet");
            return false;
        }
    };

    data.clear();
    for y in 0..DEPTH_HEIGHT {
        for x in 0..DEPTH_WIDTH {
            data.put_f32_le(depth(x, y));
        }
    }

    let sequence = shared.sequence.fetch_add(1, Ordering::AcqRel) + 1;
    let frame = RawFrame::pooled(
        DEPTH_WIDTH,
        DEPTH_HEIGHT,
        4,
        sequence,
        Some(shared.epoch.elapsed()),
        data,
        shared.pool_tx.clone(),
    );

    let listener = match shared.listener.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    };
    match listener {
        Some(listener) => {
            trace!(sequence, "delivering simulated frame");
            listener.on_new_frame(frame);
            true
        }
        None => false,
    }
}

/// Synthetic scene: a slanted plane whose distance drifts with time
fn ramp(sequence: u64) -> impl Fn(u32, u32) -> f32 {
    let drift = (sequence % 100) as f32 * 0.01;
    move |x, y| 0.5 + x as f32 / DEPTH_WIDTH as f32 * 4.0 + y as f32 * 0.001 + drift
}

struct Producer {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

struct SimulatedDevice {
    shared: Arc<Shared>,
    fps: u32,
    producer: Option<Producer>,
}

impl SensorDevice for SimulatedDevice {
    fn serial(&self) -> String {
        "SIM000000000".into()
    }

    fn set_depth_listener(&mut self, listener: Option<Arc<dyn FrameListener>>) {
        if let Ok(mut slot) = self.shared.listener.lock() {
            *slot = listener;
        }
    }

    fn start(&mut self) -> Result<(), DriverError> {
        if self.shared.start_fails.load(Ordering::Acquire) {
            return Err(DriverError::Start("simulated start failure".into()));
        }
        self.shared.streaming.store(true, Ordering::Release);

        if self.fps > 0 && self.producer.is_none() {
            let period = Duration::from_secs_f64(1.0 / self.fps as f64);
            let (stop, stop_rx) = flume::bounded::<()>(1);
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name("depth-sim".into())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            let next = shared.sequence.load(Ordering::Acquire) + 1;
                            emit_frame(&shared, ramp(next));
                        }
                        _ => break,
                    }
                })
                .map_err(|e| DriverError::Start(e.to_string()))?;
            self.producer = Some(Producer { stop, handle });
            info!(fps = self.fps, "simulated producer thread started");
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.streaming.store(false, Ordering::Release);
        if let Some(producer) = self.producer.take() {
            let _ = producer.stop.send(());
            if producer.handle.join().is_err() {
                warn!("simulated producer thread panicked");
            }
            debug!("simulated producer thread stopped");
        }
    }

    fn close(&mut self) {
        self.stop();
        self.set_depth_listener(None);
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.close();
    }
}
