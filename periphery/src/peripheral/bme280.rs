//! BME280 pressure, temperature and humidity sensor driver
//!
//! Compensation uses the floating point formulas from the datasheet
//! (section 8.1), fed by the factory trimming parameters read at init.
//!
//! Datasheet: <https://www.bosch-sensortec.com/media/boschsensortec/downloads/datasheets/bst-bme280-ds002.pdf>

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
use crate::units::{Pressure, RelativeHumidity, Temperature};

/// Address with SDO to GND.
pub const DEFAULT_ADDRESS: u8 = 0x76;
/// Address with SDO to VDDIO.
pub const ALT_ADDRESS: u8 = 0x77;

pub const CHIP_ID: u8 = 0x60;
const RESET_WORD: u8 = 0xB6;

inventory::submit! {
    DriverDescriptor {
        name: "bme280",
        part: "BME280",
        category: Category::Sensor,
        interface: Interface::I2c,
        addresses: &[DEFAULT_ADDRESS, ALT_ADDRESS],
        description: "Barometric pressure, temperature and humidity sensor",
    }
}

/// Register addresses
pub mod registers {
    pub const CALIB_00: u8 = 0x88;
    pub const CHIP_ID: u8 = 0xD0;
    pub const RESET: u8 = 0xE0;
    pub const CALIB_26: u8 = 0xE1;
    pub const CTRL_HUM: u8 = 0xF2;
    pub const STATUS: u8 = 0xF3;
    pub const CTRL_MEAS: u8 = 0xF4;
    pub const CONFIG: u8 = 0xF5;
    pub const DATA: u8 = 0xF7;
}

const STATUS_MEASURING: u8 = 0x08;
const STATUS_IM_UPDATE: u8 = 0x01;

/// ADC value reported for a channel whose oversampling is `Skip`.
const SKIPPED_20BIT: u32 = 0x80000;
const SKIPPED_16BIT: u32 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Oversampling {
    Skip = 0,
    #[default]
    X1 = 1,
    X2 = 2,
    X4 = 3,
    X8 = 4,
    X16 = 5,
}

impl Oversampling {
    fn samples(self) -> u32 {
        match self {
            Oversampling::Skip => 0,
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 4,
            Oversampling::X8 => 8,
            Oversampling::X16 => 16,
        }
    }
}

/// IIR filter coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Filter {
    #[default]
    Off = 0,
    X2 = 1,
    X4 = 2,
    X8 = 3,
    X16 = 4,
}

/// Inactive time between conversions in normal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Standby {
    Ms0_5 = 0,
    Ms62_5 = 1,
    Ms125 = 2,
    Ms250 = 3,
    Ms500 = 4,
    #[default]
    Ms1000 = 5,
    Ms10 = 6,
    Ms20 = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PowerMode {
    Sleep = 0,
    /// One conversion per read, then back to sleep.
    #[default]
    Forced = 1,
    Normal = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bme280Config {
    pub temperature: Oversampling,
    pub pressure: Oversampling,
    pub humidity: Oversampling,
    pub filter: Filter,
    pub standby: Standby,
    pub mode: PowerMode,
}

impl Bme280Config {
    fn ctrl_meas(&self) -> u8 {
        (self.temperature as u8) << 5 | (self.pressure as u8) << 2 | self.mode as u8
    }

    fn config(&self) -> u8 {
        (self.standby as u8) << 5 | (self.filter as u8) << 2
    }

    /// Maximum measurement time, datasheet appendix B.
    pub fn max_measurement_time(&self) -> Duration {
        let mut us = 1250;
        if self.temperature != Oversampling::Skip {
            us += 2300 * self.temperature.samples();
        }
        if self.pressure != Oversampling::Skip {
            us += 2300 * self.pressure.samples() + 575;
        }
        if self.humidity != Oversampling::Skip {
            us += 2300 * self.humidity.samples() + 575;
        }
        Duration::from_micros(us as u64)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Bme280Error {
    #[error("Unexpected chip ID 0x{0:02X}")]
    ChipId(u8),
    #[error("Measurement did not complete")]
    MeasurementTimeout,
    #[error("Calibration not loaded")]
    NotCalibrated,
}

/// Factory trimming parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
    pub h1: u8,
    pub h2: i16,
    pub h3: u8,
    pub h4: i16,
    pub h5: i16,
    pub h6: i8,
}

impl Calibration {
    /// Parse the 0x88..=0xA1 block and the 0xE1..=0xE7 block.
    pub fn parse(tp: &[u8; 26], h: &[u8; 7]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([tp[i], tp[i + 1]]);
        let i16_at = |i: usize| i16::from_le_bytes([tp[i], tp[i + 1]]);
        Self {
            t1: u16_at(0),
            t2: i16_at(2),
            t3: i16_at(4),
            p1: u16_at(6),
            p2: i16_at(8),
            p3: i16_at(10),
            p4: i16_at(12),
            p5: i16_at(14),
            p6: i16_at(16),
            p7: i16_at(18),
            p8: i16_at(20),
            p9: i16_at(22),
            h1: tp[25],
            h2: i16::from_le_bytes([h[0], h[1]]),
            h3: h[2],
            // H4 and H5 share the nibbles of 0xE5.
            h4: (h[3] as i8 as i16) << 4 | (h[4] & 0x0F) as i16,
            h5: (h[5] as i8 as i16) << 4 | (h[4] >> 4) as i16,
            h6: h[6] as i8,
        }
    }

    /// Returns (°C, t_fine).
    pub fn compensate_temperature(&self, adc: u32) -> (f64, f64) {
        let adc = adc as f64;
        let t1 = self.t1 as f64;
        let var1 = (adc / 16384.0 - t1 / 1024.0) * self.t2 as f64;
        let var2 = (adc / 131072.0 - t1 / 8192.0).powi(2) * self.t3 as f64;
        let t_fine = var1 + var2;
        (t_fine / 5120.0, t_fine)
    }

    /// Pressure in Pa.
    pub fn compensate_pressure(&self, adc: u32, t_fine: f64) -> f64 {
        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * self.p6 as f64 / 32768.0;
        var2 += var1 * self.p5 as f64 * 2.0;
        var2 = var2 / 4.0 + self.p4 as f64 * 65536.0;
        var1 = (self.p3 as f64 * var1 * var1 / 524288.0 + self.p2 as f64 * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * self.p1 as f64;
        if var1 == 0.0 {
            return 0.0;
        }
        let mut p = 1048576.0 - adc as f64;
        p = (p - var2 / 4096.0) * 6250.0 / var1;
        let var1 = self.p9 as f64 * p * p / 2147483648.0;
        let var2 = p * self.p8 as f64 / 32768.0;
        p + (var1 + var2 + self.p7 as f64) / 16.0
    }

    /// Relative humidity in %, clamped to 0..=100.
    pub fn compensate_humidity(&self, adc: u32, t_fine: f64) -> f64 {
        let h = t_fine - 76800.0;
        let h = (adc as f64 - (self.h4 as f64 * 64.0 + self.h5 as f64 / 16384.0 * h))
            * (self.h2 as f64 / 65536.0
                * (1.0
                    + self.h6 as f64 / 67108864.0
                        * h
                        * (1.0 + self.h3 as f64 / 67108864.0 * h)));
        let h = h * (1.0 - self.h1 as f64 * h / 524288.0);
        h.clamp(0.0, 100.0)
    }
}

/// Raw ADC words from one burst read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub pressure: u32,
    pub temperature: u32,
    pub humidity: u32,
}

impl RawSample {
    pub fn parse(data: &[u8; 8]) -> Self {
        let adc20 = |i: usize| {
            (data[i] as u32) << 12 | (data[i + 1] as u32) << 4 | (data[i + 2] as u32) >> 4
        };
        Self {
            pressure: adc20(0),
            temperature: adc20(3),
            humidity: u16::from_be_bytes([data[6], data[7]]) as u32,
        }
    }
}

/// A compensated measurement. Channels with oversampling `Skip` are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bme280Reading {
    pub temperature: Option<Temperature>,
    pub pressure: Option<Pressure>,
    pub humidity: Option<RelativeHumidity>,
}

pub struct Bme280<I2C> {
    regs: I2cRegisters<I2C>,
    config: Bme280Config,
    calibration: Option<Calibration>,
}

impl<I2C: I2c> Bme280<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self::with_address(i2c, DEFAULT_ADDRESS)
    }

    pub fn with_address(i2c: I2C, address: u8) -> Self {
        Self {
            regs: I2cRegisters::new(i2c, address),
            config: Bme280Config::default(),
            calibration: None,
        }
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    pub fn config(&self) -> Bme280Config {
        self.config
    }

    /// Check the chip ID, reset, load calibration and apply `config`.
    pub async fn init(&mut self, config: Bme280Config) -> Result<()> {
        let id = self.regs.read_u8(registers::CHIP_ID).await?;
        if id != CHIP_ID {
            bail!(Bme280Error::ChipId(id));
        }

        self.soft_reset().await?;
        self.load_calibration().await?;
        self.configure(config).await?;
        debug!(address = self.regs.address(), ?config, "BME280 initialized");
        Ok(())
    }

    pub async fn soft_reset(&mut self) -> Result<()> {
        self.regs.write_u8(registers::RESET, RESET_WORD).await?;
        tokio::time::sleep(Duration::from_millis(2)).await;
        // NVM copy in progress.
        for _ in 0..10 {
            if self.regs.read_u8(registers::STATUS).await? & STATUS_IM_UPDATE == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        bail!(Bme280Error::MeasurementTimeout)
    }

    async fn load_calibration(&mut self) -> Result<()> {
        let mut tp = [0u8; 26];
        self.regs.read_into(registers::CALIB_00, &mut tp).await?;
        let mut h = [0u8; 7];
        self.regs.read_into(registers::CALIB_26, &mut h).await?;
        let calibration = Calibration::parse(&tp, &h);
        trace!(?calibration, "BME280 calibration");
        self.calibration = Some(calibration);
        Ok(())
    }

    /// Write the control registers. CTRL_HUM only latches on a CTRL_MEAS
    /// write, so the order matters.
    pub async fn configure(&mut self, config: Bme280Config) -> Result<()> {
        // Filter and standby are only reliably written in sleep mode.
        self.regs.write_u8(registers::CTRL_MEAS, 0).await?;
        self.regs.write_u8(registers::CONFIG, config.config()).await?;
        self.regs
            .write_u8(registers::CTRL_HUM, config.humidity as u8)
            .await?;
        self.regs
            .write_u8(registers::CTRL_MEAS, config.ctrl_meas())
            .await?;
        self.config = config;
        Ok(())
    }

    async fn wait_for_measurement(&mut self) -> Result<()> {
        let budget = self.config.max_measurement_time();
        tokio::time::sleep(budget).await;
        for _ in 0..10 {
            if self.regs.read_u8(registers::STATUS).await? & STATUS_MEASURING == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        bail!(Bme280Error::MeasurementTimeout)
    }

    pub async fn read_raw(&mut self) -> Result<RawSample> {
        if self.config.mode == PowerMode::Forced {
            self.regs
                .write_u8(registers::CTRL_MEAS, self.config.ctrl_meas())
                .await?;
            self.wait_for_measurement().await?;
        }
        let mut data = [0u8; 8];
        self.regs.read_into(registers::DATA, &mut data).await?;
        Ok(RawSample::parse(&data))
    }

    pub async fn measure(&mut self) -> Result<Bme280Reading> {
        let Some(calibration) = self.calibration else {
            bail!(Bme280Error::NotCalibrated);
        };
        let raw = self.read_raw().await?;
        trace!(?raw, "BME280 raw sample");

        if raw.temperature == SKIPPED_20BIT {
            return Ok(Bme280Reading {
                temperature: None,
                pressure: None,
                humidity: None,
            });
        }

        let (celsius, t_fine) = calibration.compensate_temperature(raw.temperature);
        let pressure = (raw.pressure != SKIPPED_20BIT).then(|| {
            Pressure::from_pascal(calibration.compensate_pressure(raw.pressure, t_fine))
        });
        let humidity = (raw.humidity != SKIPPED_16BIT).then(|| {
            RelativeHumidity::from_percent(calibration.compensate_humidity(raw.humidity, t_fine))
        });

        Ok(Bme280Reading {
            temperature: Some(Temperature::from_celsius(celsius)),
            pressure,
            humidity,
        })
    }
}

#[async_trait]
impl<I2C: I2c + 'static> Sensor for Bme280<I2C> {
    type Reading = Bme280Reading;

    fn name(&self) -> &'static str {
        "bme280"
    }

    async fn read(&mut self) -> Result<Bme280Reading> {
        self.measure().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{chips, SimI2cBus};

    fn setup() -> (SimI2cBus, std::sync::Arc<parking_lot::Mutex<crate::transport::sim::RegisterFileDevice>>)
    {
        let bus = SimI2cBus::new();
        let device = bus.attach(DEFAULT_ADDRESS, chips::bme280_registers());
        (bus, device)
    }

    #[tokio::test(start_paused = true)]
    async fn test_datasheet_compensation() {
        let (bus, _device) = setup();
        let mut bme = Bme280::new(bus);
        bme.init(Bme280Config::default()).await.unwrap();

        let reading = bme.measure().await.unwrap();
        let t = reading.temperature.unwrap().celsius();
        let p = reading.pressure.unwrap().pascal();
        assert!((t - 25.08).abs() < 0.01, "temperature {t}");
        assert!((p - 100653.27).abs() < 1.0, "pressure {p}");
        let rh = reading.humidity.unwrap().percent();
        assert!((0.0..=100.0).contains(&rh));
    }

    #[test]
    fn test_humidity_nibble_packing() {
        let tp = [0u8; 26];
        let h = [0x6A, 0x01, 0x00, 0x13, 0x29, 0x03, 0x1E];
        let cal = Calibration::parse(&tp, &h);
        assert_eq!(cal.h2, 362);
        assert_eq!(cal.h4, 313);
        assert_eq!(cal.h5, 50);
        assert_eq!(cal.h6, 30);

        let negative = Calibration::parse(&tp, &[0, 0, 0, 0xFF, 0x0F, 0xFF, 0]);
        assert_eq!(negative.h4, -1);
        assert_eq!(negative.h5, -16);
    }

    #[tokio::test]
    async fn test_wrong_chip_id() {
        let (bus, device) = setup();
        device.lock().set(registers::CHIP_ID, 0x58);
        let mut bme = Bme280::new(bus);
        let err = bme.init(Bme280Config::default()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<Bme280Error>(), Some(&Bme280Error::ChipId(0x58)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_register_order() {
        let (bus, device) = setup();
        let mut bme = Bme280::new(bus);
        let config = Bme280Config {
            temperature: Oversampling::X2,
            pressure: Oversampling::X16,
            humidity: Oversampling::X1,
            filter: Filter::X16,
            standby: Standby::Ms0_5,
            mode: PowerMode::Normal,
        };
        bme.init(config).await.unwrap();

        let writes: Vec<_> = device
            .lock()
            .writes()
            .iter()
            .copied()
            .filter(|(reg, _)| *reg >= registers::CTRL_HUM)
            .collect();
        assert_eq!(
            writes,
            vec![
                (registers::CTRL_MEAS, 0x00),
                (registers::CONFIG, 0x10),
                (registers::CTRL_HUM, 0x01),
                (registers::CTRL_MEAS, 0x57),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_channels_are_none() {
        let (bus, device) = setup();
        // Humidity ADC reports its skipped value.
        device.lock().load(0xFD, &[0x80, 0x00]);
        let mut bme = Bme280::new(bus);
        bme.init(Bme280Config {
            humidity: Oversampling::Skip,
            ..Default::default()
        })
        .await
        .unwrap();

        let reading = bme.measure().await.unwrap();
        assert!(reading.temperature.is_some());
        assert!(reading.pressure.is_some());
        assert_eq!(reading.humidity, None);
    }

    #[tokio::test]
    async fn test_measure_requires_init() {
        let (bus, _device) = setup();
        let mut bme = Bme280::new(bus);
        let err = bme.measure().await.unwrap_err();
        assert_eq!(err.downcast_ref::<Bme280Error>(), Some(&Bme280Error::NotCalibrated));
    }
}
