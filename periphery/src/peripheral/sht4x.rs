//! SHT40/41/45 humidity and temperature sensor driver
//!
//! The SHT4x has no register map: every operation is a one-byte command,
//! and results come back as 16-bit words each followed by a CRC-8.
//!
//! Datasheet: <https://sensirion.com/media/documents/33FD6951/6555C40E/Sensirion_Datasheets_Humidity_Sensor_SHT4x.pdf>

use anyhow::{bail, Result};
use async_trait::async_trait;
use crc_all::Crc;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use crate::comms::I2cRegisters;
use crate::hw_trait::I2c;
use crate::registry::{Category, DriverDescriptor, Interface};
use crate::sensor::Sensor;
use crate::units::{RelativeHumidity, Temperature};

pub const DEFAULT_ADDRESS: u8 = 0x44;
pub const ALT_ADDRESS: u8 = 0x45;

inventory::submit! {
    DriverDescriptor {
        name: "sht4x",
        part: "SHT40/SHT41/SHT45",
        category: Category::Sensor,
        interface: Interface::I2c,
        addresses: &[DEFAULT_ADDRESS, ALT_ADDRESS],
        description: "Temperature and relative humidity sensor",
    }
}

/// SHT4x command codes
pub mod commands {
    pub const MEASURE_HIGH: u8 = 0xFD;
    pub const MEASURE_MEDIUM: u8 = 0xF6;
    pub const MEASURE_LOW: u8 = 0xE0;
    pub const READ_SERIAL: u8 = 0x89;
    pub const SOFT_RESET: u8 = 0x94;
}

/// Measurement repeatability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    High,
    Medium,
    Low,
}

impl Precision {
    fn command(self) -> u8 {
        match self {
            Precision::High => commands::MEASURE_HIGH,
            Precision::Medium => commands::MEASURE_MEDIUM,
            Precision::Low => commands::MEASURE_LOW,
        }
    }

    /// Maximum conversion time, rounded up.
    fn duration(self) -> Duration {
        match self {
            Precision::High => Duration::from_millis(9),
            Precision::Medium => Duration::from_millis(5),
            Precision::Low => Duration::from_millis(2),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Sht4xError {
    #[error("CRC mismatch on word {word}: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Crc { word: usize, expected: u8, actual: u8 },
}

/// Sensirion CRC-8: polynomial 0x31, init 0xFF, no reflection.
pub fn crc8(data: &[u8]) -> u8 {
    const POLYNOMIAL: u8 = 0x31;
    const WIDTH: usize = 8;
    const INITIAL: u8 = 0xFF;
    const XOR: u8 = 0;
    const REFLECT: bool = false;
    let mut crc = Crc::<u8>::new(POLYNOMIAL, WIDTH, INITIAL, XOR, REFLECT);

    crc.update(data);
    crc.finish()
}

/// Split a `[msb, lsb, crc] × 2` response into two checked words.
fn checked_words(frame: &[u8; 6]) -> Result<[u16; 2]> {
    let mut words = [0u16; 2];
    for (i, chunk) in frame.chunks_exact(3).enumerate() {
        let expected = crc8(&chunk[..2]);
        if expected != chunk[2] {
            bail!(Sht4xError::Crc {
                word: i,
                expected,
                actual: chunk[2],
            });
        }
        words[i] = u16::from_be_bytes([chunk[0], chunk[1]]);
    }
    Ok(words)
}

/// One temperature and humidity measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sht4xReading {
    pub temperature: Temperature,
    pub humidity: RelativeHumidity,
}

impl Sht4xReading {
    /// Convert raw ticks. Humidity is clamped to 0..=100 %.
    pub fn from_ticks(temperature: u16, humidity: u16) -> Self {
        let t = -45.0 + 175.0 * temperature as f64 / 65535.0;
        let rh = -6.0 + 125.0 * humidity as f64 / 65535.0;
        Self {
            temperature: Temperature::from_celsius(t),
            humidity: RelativeHumidity::from_percent(rh.clamp(0.0, 100.0)),
        }
    }
}

pub struct Sht4x<I2C> {
    regs: I2cRegisters<I2C>,
    precision: Precision,
}

impl<I2C: I2c> Sht4x<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self::with_address(i2c, DEFAULT_ADDRESS)
    }

    pub fn with_address(i2c: I2C, address: u8) -> Self {
        Self {
            regs: I2cRegisters::new(i2c, address),
            precision: Precision::default(),
        }
    }

    pub fn set_precision(&mut self, precision: Precision) {
        self.precision = precision;
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub async fn soft_reset(&mut self) -> Result<()> {
        self.regs.write_raw(&[commands::SOFT_RESET]).await?;
        tokio::time::sleep(Duration::from_millis(1)).await;
        debug!("SHT4x soft reset");
        Ok(())
    }

    async fn command(&mut self, command: u8, wait: Duration) -> Result<[u16; 2]> {
        self.regs.write_raw(&[command]).await?;
        tokio::time::sleep(wait).await;
        let mut frame = [0u8; 6];
        self.regs.read_raw(&mut frame).await?;
        checked_words(&frame)
    }

    pub async fn serial_number(&mut self) -> Result<u32> {
        let [hi, lo] = self
            .command(commands::READ_SERIAL, Duration::from_millis(1))
            .await?;
        let serial = (hi as u32) << 16 | lo as u32;
        debug!("SHT4x serial number: 0x{:08X}", serial);
        Ok(serial)
    }

    pub async fn measure(&mut self) -> Result<Sht4xReading> {
        let precision = self.precision;
        let [t, rh] = self.command(precision.command(), precision.duration()).await?;
        let reading = Sht4xReading::from_ticks(t, rh);
        trace!(?precision, t_ticks = t, rh_ticks = rh, ?reading, "SHT4x measurement");
        Ok(reading)
    }
}

#[async_trait]
impl<I2C: I2c + 'static> Sensor for Sht4x<I2C> {
    type Reading = Sht4xReading;

    fn name(&self) -> &'static str {
        "sht4x"
    }

    async fn read(&mut self) -> Result<Sht4xReading> {
        self.measure().await
    }
}
