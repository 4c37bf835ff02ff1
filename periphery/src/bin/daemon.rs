//! periphery daemon.
//!
//! Attaches the configured devices to an I2C bus, or to the simulated board
//! when no bus is configured, samples them, and serves the HTTP API until
//! SIGINT or SIGTERM.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::time::MissedTickBehavior;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use periphery::api::{self, AppState};
use periphery::board::{AuxPorts, DeviceFactory};
use periphery::config::Config;
use periphery::hw_trait::I2c;
use periphery::tracing::{self, prelude::*};
use periphery::transport::sim::SimBoard;

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();
    let config = Config::load().context("Failed to load configuration")?;

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    let state = AppState::new();

    match config.bus.i2c {
        Some(bus) => {
            let i2c = open_bus(bus)?;
            attach(i2c, AuxPorts::default(), &config, &state, &tracker, &running).await;
        }
        None => {
            info!("No I2C bus configured, using the simulated board");
            let board = SimBoard::standard();
            let ports = AuxPorts::from_sim(&board);
            attach(board.i2c.clone(), ports, &config, &state, &tracker, &running).await;
            tracker.spawn(drift(board, config.sampling.interval(), running.clone()));
        }
    }

    let listen = config.api.listen.clone();
    let api_running = running.clone();
    tracker.spawn(async move {
        if let Err(e) = api::serve(&listen, state, api_running.clone()).await {
            error!(error = %e, "API server failed");
            api_running.cancel();
        }
    });
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = running.cancelled() => {},
    }

    trace!("Shutting down.");
    running.cancel();

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_bus(bus: u8) -> Result<periphery::transport::linux_i2c::LinuxI2c> {
    periphery::transport::linux_i2c::LinuxI2c::open(bus)
        .with_context(|| format!("Failed to open I2C bus {bus}"))
}

#[cfg(not(target_os = "linux"))]
fn open_bus(bus: u8) -> Result<periphery::transport::sim::SimI2cBus> {
    anyhow::bail!("I2C bus {bus} requested, but hardware buses are only supported on Linux")
}

async fn attach<I2C: I2c + Clone + 'static>(
    i2c: I2C,
    ports: AuxPorts,
    config: &Config,
    state: &AppState,
    tracker: &TaskTracker,
    running: &CancellationToken,
) {
    let mut factory = DeviceFactory::new(
        i2c,
        ports,
        state.clone(),
        config.sampling.interval(),
        tracker.clone(),
        running.clone(),
    );
    let attached = factory
        .attach_all(&config.devices, config.status_display.as_deref())
        .await;
    info!("{} of {} device(s) attached", attached, config.devices.len());
    if factory.start_status_display() {
        debug!("Status display running");
    }
}

/// Keep the simulated environment moving so readings change.
async fn drift(board: SimBoard, interval: Duration, running: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut step = 0u64;
    loop {
        tokio::select! {
            _ = running.cancelled() => break,
            _ = ticker.tick() => {}
        }
        board.drift(step);
        step += 1;
    }
}
