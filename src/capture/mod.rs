pub mod driver;
pub mod frame;
pub mod simulated;

pub use driver::{DriverError, FrameListener, RawFrame, SensorDevice, SensorDriver};
pub use frame::{DepthFormat, DepthFrame, FrameMetadata};
pub use simulated::{SimulatedDriver, SimulatedSensor};
