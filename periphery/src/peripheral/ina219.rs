//! INA219 high-side current and power monitor driver
//!
//! Datasheet: <https://www.ti.com/lit/ds/symlink/ina219.pdf>

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::comms::I2cRegisters;
use crate::hw_trait::I2c;
use crate::registry::{Category, DriverDescriptor, Interface};
use crate::sensor::Sensor;
use crate::units::{Current, Power, Voltage};

pub const DEFAULT_ADDRESS: u8 = 0x40;

inventory::submit! {
    DriverDescriptor {
        name: "ina219",
        part: "INA219",
        category: Category::Sensor,
        interface: Interface::I2c,
        addresses: &[
            0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47,
            0x48, 0x49, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F,
        ],
        description: "Bus voltage, shunt current and power monitor",
    }
}

/// Register pointers
pub mod registers {
    pub const CONFIG: u8 = 0x00;
    pub const SHUNT_VOLTAGE: u8 = 0x01;
    pub const BUS_VOLTAGE: u8 = 0x02;
    pub const POWER: u8 = 0x03;
    pub const CURRENT: u8 = 0x04;
    pub const CALIBRATION: u8 = 0x05;
}

const CONFIG_RESET: u16 = 0x8000;
/// Power-on value of the configuration register.
pub const CONFIG_DEFAULT: u16 = 0x399F;

const BUS_CNVR: u16 = 0x0002;
const BUS_OVF: u16 = 0x0001;

const SHUNT_LSB_V: f64 = 10e-6;
const BUS_LSB_V: f64 = 4e-3;
/// Fixed scaling constant in the calibration equation.
const CALIBRATION_SCALE: f64 = 0.04096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum BusRange {
    V16 = 0,
    #[default]
    V32 = 1,
}

/// Shunt PGA gain, named by full-scale range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum Gain {
    Mv40 = 0,
    Mv80 = 1,
    Mv160 = 2,
    #[default]
    Mv320 = 3,
}

/// ADC resolution or averaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum AdcSetting {
    Bits9 = 0x0,
    Bits10 = 0x1,
    Bits11 = 0x2,
    #[default]
    Bits12 = 0x3,
    Samples2 = 0x9,
    Samples4 = 0xA,
    Samples8 = 0xB,
    Samples16 = 0xC,
    Samples32 = 0xD,
    Samples64 = 0xE,
    Samples128 = 0xF,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum OperatingMode {
    PowerDown = 0,
    ShuntTriggered = 1,
    BusTriggered = 2,
    BothTriggered = 3,
    AdcOff = 4,
    ShuntContinuous = 5,
    BusContinuous = 6,
    #[default]
    BothContinuous = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ina219Config {
    pub bus_range: BusRange,
    pub gain: Gain,
    pub bus_adc: AdcSetting,
    pub shunt_adc: AdcSetting,
    pub mode: OperatingMode,
}

impl Ina219Config {
    pub fn to_register(self) -> u16 {
        (self.bus_range as u16) << 13
            | (self.gain as u16) << 11
            | (self.bus_adc as u16) << 7
            | (self.shunt_adc as u16) << 3
            | self.mode as u16
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum Ina219Error {
    #[error("Not calibrated")]
    NotCalibrated,
    #[error("Invalid calibration: shunt {shunt_ohms} Ω, max current {max_amps} A")]
    InvalidCalibration { shunt_ohms: f64, max_amps: f64 },
}

/// Flags carried in the bus voltage register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConversionFlags {
    pub conversion_ready: bool,
    pub overflow: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ina219Reading {
    pub bus_voltage: Voltage,
    pub shunt_voltage: Voltage,
    pub current: Current,
    pub power: Power,
}

/// Calibration register value and current LSB for a shunt and expected range.
pub fn calibration(shunt_ohms: f64, max_amps: f64) -> Result<(u16, f64)> {
    if shunt_ohms <= 0.0 || max_amps <= 0.0 {
        bail!(Ina219Error::InvalidCalibration { shunt_ohms, max_amps });
    }
    let current_lsb = max_amps / 32768.0;
    let cal = (CALIBRATION_SCALE / (current_lsb * shunt_ohms)).trunc();
    if !(1.0..=65534.0).contains(&cal) {
        bail!(Ina219Error::InvalidCalibration { shunt_ohms, max_amps });
    }
    // Bit 0 is reserved.
    Ok(((cal as u16) & !1, current_lsb))
}

pub struct Ina219<I2C> {
    regs: I2cRegisters<I2C>,
    config: Ina219Config,
    current_lsb: Option<f64>,
}

impl<I2C: I2c> Ina219<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self::with_address(i2c, DEFAULT_ADDRESS)
    }

    pub fn with_address(i2c: I2C, address: u8) -> Self {
        Self {
            regs: I2cRegisters::new(i2c, address),
            config: Ina219Config::default(),
            current_lsb: None,
        }
    }

    pub async fn reset(&mut self) -> Result<()> {
        self.regs
            .write_u16_be(registers::CONFIG, CONFIG_RESET)
            .await?;
        self.config = Ina219Config::default();
        self.current_lsb = None;
        Ok(())
    }

    pub async fn configure(&mut self, config: Ina219Config) -> Result<()> {
        let value = config.to_register();
        self.regs.write_u16_be(registers::CONFIG, value).await?;
        self.config = config;
        debug!("INA219 config 0x{:04X}", value);
        Ok(())
    }

    pub fn config(&self) -> Ina219Config {
        self.config
    }

    /// Program the calibration register for `shunt_ohms` and a maximum
    /// expected current of `max_amps`.
    pub async fn calibrate(&mut self, shunt_ohms: f64, max_amps: f64) -> Result<()> {
        let (cal, current_lsb) = calibration(shunt_ohms, max_amps)?;
        self.regs
            .write_u16_be(registers::CALIBRATION, cal)
            .await?;
        self.current_lsb = Some(current_lsb);
        debug!(cal, current_lsb, "INA219 calibrated");
        Ok(())
    }

    pub async fn shunt_voltage(&mut self) -> Result<Voltage> {
        let raw = self.regs.read_u16_be(registers::SHUNT_VOLTAGE).await? as i16;
        Ok(Voltage::from_volts(raw as f64 * SHUNT_LSB_V))
    }

    async fn bus_register(&mut self) -> Result<u16> {
        let raw = self.regs.read_u16_be(registers::BUS_VOLTAGE).await?;
        if raw & BUS_OVF != 0 {
            warn!("INA219 math overflow; current and power are invalid");
        }
        Ok(raw)
    }

    pub async fn bus_voltage(&mut self) -> Result<Voltage> {
        let raw = self.bus_register().await?;
        Ok(Voltage::from_volts((raw >> 3) as f64 * BUS_LSB_V))
    }

    pub async fn flags(&mut self) -> Result<ConversionFlags> {
        let raw = self.regs.read_u16_be(registers::BUS_VOLTAGE).await?;
        Ok(ConversionFlags {
            conversion_ready: raw & BUS_CNVR != 0,
            overflow: raw & BUS_OVF != 0,
        })
    }

    fn current_lsb(&self) -> Result<f64> {
        match self.current_lsb {
            Some(lsb) => Ok(lsb),
            None => bail!(Ina219Error::NotCalibrated),
        }
    }

    pub async fn current(&mut self) -> Result<Current> {
        let lsb = self.current_lsb()?;
        let raw = self.regs.read_u16_be(registers::CURRENT).await? as i16;
        Ok(Current::from_amps(raw as f64 * lsb))
    }

    pub async fn power(&mut self) -> Result<Power> {
        let lsb = self.current_lsb()?;
        let raw = self.regs.read_u16_be(registers::POWER).await?;
        Ok(Power::from_watts(raw as f64 * lsb * 20.0))
    }

    pub async fn measure(&mut self) -> Result<Ina219Reading> {
        let reading = Ina219Reading {
            bus_voltage: self.bus_voltage().await?,
            shunt_voltage: self.shunt_voltage().await?,
            current: self.current().await?,
            power: self.power().await?,
        };
        trace!(?reading, "INA219 measurement");
        Ok(reading)
    }
}

#[async_trait]
impl<I2C: I2c + 'static> Sensor for Ina219<I2C> {
    type Reading = Ina219Reading;

    fn name(&self) -> &'static str {
        "ina219"
    }

    async fn read(&mut self) -> Result<Ina219Reading> {
        self.measure().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{chips::Ina219Sim, SimI2cBus};
    use test_case::test_case;

    #[test]
    fn test_default_config_matches_power_on_value() {
        assert_eq!(Ina219Config::default().to_register(), CONFIG_DEFAULT);
    }

    #[test_case(0.1, 3.2 => 4194; "0.1 ohm, 3.2 A")]
    #[test_case(0.1, 1.0 => 13420; "0.1 ohm, 1 A, reserved bit cleared")]
    fn test_calibration_value(shunt: f64, max_amps: f64) -> u16 {
        calibration(shunt, max_amps).unwrap().0
    }

    #[test]
    fn test_calibration_rejects_bad_inputs() {
        assert!(calibration(0.0, 1.0).is_err());
        assert!(calibration(0.1, -1.0).is_err());
    }

    #[tokio::test]
    async fn test_measure_against_model() {
        let bus = SimI2cBus::new();
        let sim = bus.attach(DEFAULT_ADDRESS, Ina219Sim::new(12.0, 0.05));
        let mut ina = Ina219::new(bus);
        ina.reset().await.unwrap();
        ina.configure(Ina219Config::default()).await.unwrap();
        ina.calibrate(0.1, 3.2).await.unwrap();

        let r = ina.measure().await.unwrap();
        assert!((r.bus_voltage.volts() - 12.0).abs() < 0.004);
        assert!((r.shunt_voltage.millivolts() - 50.0).abs() < 0.01);
        assert!((r.current.amps() - 0.5).abs() < 0.01);
        assert!((r.power.watts() - 6.0).abs() < 0.05);
        assert_eq!(sim.lock().calibration(), 4194);

        let flags = ina.flags().await.unwrap();
        assert!(flags.conversion_ready);
        assert!(!flags.overflow);
    }

    #[tokio::test]
    async fn test_negative_shunt_voltage() {
        let bus = SimI2cBus::new();
        bus.attach(DEFAULT_ADDRESS, Ina219Sim::new(5.0, -0.02));
        let mut ina = Ina219::new(bus);
        ina.calibrate(0.1, 3.2).await.unwrap();

        assert!((ina.shunt_voltage().await.unwrap().millivolts() + 20.0).abs() < 0.01);
        assert!(ina.current().await.unwrap().amps() < 0.0);
    }

    #[tokio::test]
    async fn test_current_requires_calibration() {
        let bus = SimI2cBus::new();
        bus.attach(DEFAULT_ADDRESS, Ina219Sim::new(5.0, 0.01));
        let mut ina = Ina219::new(bus);
        let err = ina.current().await.unwrap_err();
        assert_eq!(err.downcast_ref::<Ina219Error>(), Some(&Ina219Error::NotCalibrated));
    }
}
