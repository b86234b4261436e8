//! Depth bridge demo: a simulated sensor polled at a host-like tick rate

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use depthbridge::capture::frame::{DEPTH_SAMPLES, DEPTH_WIDTH};
use depthbridge::capture::SimulatedDriver;
use depthbridge::{Bridge, BridgeError, BridgeStatus, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("Depth bridge launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    info!(?config, "configuration loaded");

    let (driver, _sensor) = SimulatedDriver::new(&config.simulator);
    let mut bridge = Bridge::new(Box::new(driver), &config.bridge);

    let status = bridge.open_status();
    if status != BridgeStatus::Ok {
        return Err(eyre!("open failed with status {}", status.code()));
    }

    let tick_hz = config.demo.tick_hz.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / tick_hz as f64));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut matrix = vec![0.0f32; DEPTH_SAMPLES];
    let mut ticks = 0u64;
    let mut last_generation = 0u64;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Ctrl-C received");
                break;
            }
            _ = ticker.tick() => {
                ticks += 1;
                match bridge.fill_matrix(&mut matrix) {
                    Ok(generation) if generation != last_generation => {
                        last_generation = generation;
                        let center = (212 * DEPTH_WIDTH + 256) as usize;
                        info!(generation, center_m = matrix[center], "new depth frame");
                    }
                    Ok(_) | Err(BridgeError::Unavailable) => {}
                    Err(e) => warn!(error = %e, "tick failed"),
                }

                if ticks % tick_hz as u64 == 0 {
                    if let Err(e) = bridge.check_watchdog() {
                        warn!(error = %e, "depth stream unhealthy");
                    }
                }

                if config.demo.max_ticks != 0 && ticks >= config.demo.max_ticks {
                    break;
                }
            }
        }
    }

    let health = bridge.health();
    info!(
        ticks,
        generation = health.generation,
        received = health.frames_received,
        dropped = health.frames_dropped,
        "Depth bridge shutting down"
    );
    bridge.close_status();
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("depthbridge=info"));
    let fmt = tracing_subscriber::fmt::layer()
        .with_timer(tracing_subscriber::fmt::time::uptime());

    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}
