pub mod bridge;
pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use bridge::Bridge;
pub use error::{BridgeError, BridgeStatus};
pub use session::{AcquisitionSession, SessionHealth, SessionState};

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub simulator: SimulatorConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Backend used by `open` unless changed while closed
    pub backend: PipelineBackend,
    /// Silence longer than this marks the session stalled
    pub watchdog_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub devices: usize,
    /// Producer thread rate, 0 means frames are only pushed by hand
    pub fps: u32,
    pub pool_size: usize,
    pub accelerated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoConfig {
    pub tick_hz: u32,
    /// 0 runs until Ctrl-C
    pub max_ticks: u64,
}

/// Compute backend the driver decodes depth packets with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineBackend {
    Cpu,
    Accelerated,
}

impl fmt::Display for PipelineBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineBackend::Cpu => f.write_str("cpu"),
            PipelineBackend::Accelerated => f.write_str("accelerated"),
        }
    }
}

impl BridgeConfig {
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend: PipelineBackend::Cpu,
            watchdog_ms: 1000,
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            fps: 30, // Sensor native rate
            pool_size: 2,
            accelerated: false,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            tick_hz: 60,
            max_ticks: 0,
        }
    }
}

impl Config {
    /// Defaults, then an optional TOML file, then `DEPTHBRIDGE__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, BridgeError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("DEPTHBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
