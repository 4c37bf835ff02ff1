//! BH1750FVI ambient light sensor driver
//!
//! Datasheet: <https://www.mouser.com/datasheet/2/348/bh1750fvi-e-186247.pdf>

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use crate::comms::I2cRegisters;
use crate::hw_trait::I2c;
use crate::registry::{Category, DriverDescriptor, Interface};
use crate::sensor::Sensor;
use crate::units::Illuminance;

/// Address with ADDR pulled low.
pub const DEFAULT_ADDRESS: u8 = 0x23;
/// Address with ADDR pulled high.
pub const ALT_ADDRESS: u8 = 0x5C;

inventory::submit! {
    DriverDescriptor {
        name: "bh1750",
        part: "BH1750FVI",
        category: Category::Sensor,
        interface: Interface::I2c,
        addresses: &[DEFAULT_ADDRESS, ALT_ADDRESS],
        description: "Ambient light sensor, 1 to 65535 lx",
    }
}

/// Instruction opcodes
pub mod opcodes {
    pub const POWER_DOWN: u8 = 0x00;
    pub const POWER_ON: u8 = 0x01;
    pub const RESET: u8 = 0x07;
    pub const MT_HIGH: u8 = 0x40;
    pub const MT_LOW: u8 = 0x60;
}

pub const DEFAULT_MEASUREMENT_TIME: u8 = 69;
pub const MIN_MEASUREMENT_TIME: u8 = 31;
pub const MAX_MEASUREMENT_TIME: u8 = 254;

/// Measurement resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resolution {
    /// 1 lx
    High,
    /// 0.5 lx
    High2,
    /// 4 lx
    Low,
}

/// Measurement mode: a resolution, measured once or continuously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Mode {
    pub resolution: Resolution,
    pub continuous: bool,
}

impl Default for Mode {
    fn default() -> Self {
        Self {
            resolution: Resolution::High,
            continuous: true,
        }
    }
}

impl Mode {
    pub fn opcode(self) -> u8 {
        let base = if self.continuous { 0x10 } else { 0x20 };
        base | match self.resolution {
            Resolution::High => 0x00,
            Resolution::High2 => 0x01,
            Resolution::Low => 0x03,
        }
    }

    /// Worst-case conversion time at the given measurement time register.
    pub fn conversion_time(self, measurement_time: u8) -> Duration {
        let base_ms = match self.resolution {
            Resolution::High | Resolution::High2 => 180,
            Resolution::Low => 24,
        };
        let scaled = base_ms * measurement_time as u64 / DEFAULT_MEASUREMENT_TIME as u64;
        Duration::from_millis(scaled.max(1))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Bh1750Error {
    #[error("Measurement time {0} outside {MIN_MEASUREMENT_TIME}..={MAX_MEASUREMENT_TIME}")]
    InvalidMeasurementTime(u8),
}

/// Convert a raw count to lux.
pub fn raw_to_lux(raw: u16, mode: Mode, measurement_time: u8) -> Illuminance {
    let mut lux = raw as f64 / 1.2 * (DEFAULT_MEASUREMENT_TIME as f64 / measurement_time as f64);
    if mode.resolution == Resolution::High2 {
        lux /= 2.0;
    }
    Illuminance::from_lux(lux)
}

pub struct Bh1750<I2C> {
    regs: I2cRegisters<I2C>,
    mode: Mode,
    measurement_time: u8,
    /// A continuous mode command has been issued since the last power change.
    running: bool,
}

impl<I2C: I2c> Bh1750<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self::with_address(i2c, DEFAULT_ADDRESS)
    }

    pub fn with_address(i2c: I2C, address: u8) -> Self {
        Self {
            regs: I2cRegisters::new(i2c, address),
            mode: Mode::default(),
            measurement_time: DEFAULT_MEASUREMENT_TIME,
            running: false,
        }
    }

    async fn opcode(&mut self, opcode: u8) -> Result<()> {
        trace!("BH1750 opcode 0x{:02X}", opcode);
        self.regs.write_raw(&[opcode]).await
    }

    pub async fn power_on(&mut self) -> Result<()> {
        self.opcode(opcodes::POWER_ON).await
    }

    pub async fn power_down(&mut self) -> Result<()> {
        self.running = false;
        self.opcode(opcodes::POWER_DOWN).await
    }

    /// Clear the data register. Only valid while powered on.
    pub async fn reset(&mut self) -> Result<()> {
        self.opcode(opcodes::POWER_ON).await?;
        self.opcode(opcodes::RESET).await
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub async fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.mode = mode;
        self.running = false;
        if mode.continuous {
            self.start_continuous().await?;
        }
        debug!(?mode, "BH1750 mode set");
        Ok(())
    }

    pub fn measurement_time(&self) -> u8 {
        self.measurement_time
    }

    /// Change sensitivity. Larger values integrate longer.
    pub async fn set_measurement_time(&mut self, value: u8) -> Result<()> {
        if !(MIN_MEASUREMENT_TIME..=MAX_MEASUREMENT_TIME).contains(&value) {
            bail!(Bh1750Error::InvalidMeasurementTime(value));
        }
        self.opcode(opcodes::MT_HIGH | (value >> 5)).await?;
        self.opcode(opcodes::MT_LOW | (value & 0x1F)).await?;
        self.measurement_time = value;
        if self.mode.continuous {
            self.start_continuous().await?;
        }
        Ok(())
    }

    async fn start_continuous(&mut self) -> Result<()> {
        self.opcode(self.mode.opcode()).await?;
        tokio::time::sleep(self.mode.conversion_time(self.measurement_time)).await;
        self.running = true;
        Ok(())
    }

    pub async fn read_lux(&mut self) -> Result<Illuminance> {
        if !self.mode.continuous {
            self.opcode(self.mode.opcode()).await?;
            tokio::time::sleep(self.mode.conversion_time(self.measurement_time)).await;
        } else if !self.running {
            self.start_continuous().await?;
        }

        let mut data = [0u8; 2];
        self.regs.read_raw(&mut data).await?;
        let raw = u16::from_be_bytes(data);
        let lux = raw_to_lux(raw, self.mode, self.measurement_time);
        trace!(raw, %lux, "BH1750 reading");
        Ok(lux)
    }
}

#[async_trait]
impl<I2C: I2c + 'static> Sensor for Bh1750<I2C> {
    type Reading = Illuminance;

    fn name(&self) -> &'static str {
        "bh1750"
    }

    async fn read(&mut self) -> Result<Illuminance> {
        self.read_lux().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{chips::Bh1750Sim, SimI2cBus};
    use test_case::test_case;

    #[test_case(Resolution::High, true => 0x10)]
    #[test_case(Resolution::High2, true => 0x11)]
    #[test_case(Resolution::Low, true => 0x13)]
    #[test_case(Resolution::High, false => 0x20)]
    #[test_case(Resolution::High2, false => 0x21)]
    #[test_case(Resolution::Low, false => 0x23)]
    fn test_mode_opcodes(resolution: Resolution, continuous: bool) -> u8 {
        Mode { resolution, continuous }.opcode()
    }

    #[test]
    fn test_raw_to_lux() {
        let high = Mode::default();
        assert!((raw_to_lux(1200, high, 69).lux() - 1000.0).abs() < 1e-9);
        let high2 = Mode { resolution: Resolution::High2, continuous: true };
        assert!((raw_to_lux(1200, high2, 69).lux() - 500.0).abs() < 1e-9);
        assert!((raw_to_lux(1200, high, 138).lux() - 500.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_read() {
        let bus = SimI2cBus::new();
        bus.attach(DEFAULT_ADDRESS, Bh1750Sim::new(320.0));
        let mut sensor = Bh1750::new(bus);
        sensor.power_on().await.unwrap();

        let lux = sensor.read_lux().await.unwrap();
        assert!((lux.lux() - 320.0).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_time_high2_with_measurement_time() {
        let bus = SimI2cBus::new();
        let sim = bus.attach(DEFAULT_ADDRESS, Bh1750Sim::new(75.0));
        let mut sensor = Bh1750::new(bus);
        sensor.power_on().await.unwrap();
        sensor
            .set_mode(Mode { resolution: Resolution::High2, continuous: false })
            .await
            .unwrap();
        sensor.set_measurement_time(138).await.unwrap();

        let lux = sensor.read_lux().await.unwrap();
        assert!((lux.lux() - 75.0).abs() < 0.5);
        assert_eq!(sim.lock().measurement_time(), 138);
    }

    #[tokio::test]
    async fn test_measurement_time_bounds() {
        let bus = SimI2cBus::new();
        bus.attach(DEFAULT_ADDRESS, Bh1750Sim::new(0.0));
        let mut sensor = Bh1750::new(bus);
        let err = sensor.set_measurement_time(20).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<Bh1750Error>(),
            Some(&Bh1750Error::InvalidMeasurementTime(20))
        );
    }

    #[tokio::test]
    async fn test_powered_down_sensor_refuses_measurement() {
        let bus = SimI2cBus::new();
        bus.attach(DEFAULT_ADDRESS, Bh1750Sim::new(10.0));
        let mut sensor = Bh1750::new(bus);
        sensor.power_down().await.unwrap();
        assert!(sensor.read_lux().await.is_err());
    }
}
