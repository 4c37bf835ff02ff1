//! TPS546D24A power management controller driver
//!
//! Driver for the Texas Instruments TPS546D24A synchronous buck converter
//! with PMBus interface.
//!
//! Datasheet: <https://www.ti.com/lit/ds/symlink/tps546d24a.pdf>

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::ops::RangeInclusive;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use super::pmbus::{
    commands, flag_names, operation, FaultResponse, Linear11, Linear16, OnOffConfig,
    StatusCml, StatusInput, StatusIout, StatusTemperature, StatusVout, StatusWord,
};
use crate::actuator::Actuator;
use crate::comms::I2cRegisters;
use crate::hw_trait::I2c;
use crate::registry::{Category, DriverDescriptor, Interface};
use crate::sensor::Sensor;
use crate::units::{Current, Power, Temperature, Voltage};

/// Default TPS546 I2C address
pub const DEFAULT_ADDRESS: u8 = 0x24;

/// Accepted IC_DEVICE_ID values (after the length byte).
const DEVICE_IDS: [[u8; 6]; 3] = [
    [0x54, 0x49, 0x54, 0x6B, 0x24, 0x41], // TPS546D24A
    [0x54, 0x49, 0x54, 0x6D, 0x24, 0x41], // TPS546D24A
    [0x54, 0x49, 0x54, 0x6D, 0x24, 0x62], // TPS546D24S
];

inventory::submit! {
    DriverDescriptor {
        name: "tps546",
        part: "TPS546D24A",
        category: Category::Power,
        interface: Interface::I2c,
        addresses: &[0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x24],
        description: "PMBus synchronous buck converter with telemetry",
    }
}

/// TPS546 configuration parameters
#[derive(Debug, Clone)]
pub struct Tps546Config {
    /// Input voltage turn-on threshold (V)
    pub vin_on: f32,
    /// Input voltage turn-off threshold (V)
    pub vin_off: f32,
    /// Input undervoltage warning limit (V); zero leaves the part default
    pub vin_uv_warn_limit: f32,
    /// Input overvoltage fault limit (V)
    pub vin_ov_fault_limit: f32,
    /// Output voltage scale factor
    pub vout_scale_loop: f32,
    /// Minimum output voltage (V)
    pub vout_min: f32,
    /// Maximum output voltage (V)
    pub vout_max: f32,
    /// Initial output voltage command (V)
    pub vout_command: f32,
    /// Output overcurrent warning limit (A)
    pub iout_oc_warn_limit: f32,
    /// Output overcurrent fault limit (A)
    pub iout_oc_fault_limit: f32,
    /// Switching frequency (kHz)
    pub switching_khz: i32,
}

impl Default for Tps546Config {
    /// A 5 V input, 1.0 to 2.0 V output rail.
    fn default() -> Self {
        Self {
            vin_on: 4.8,
            vin_off: 4.5,
            // UV_WARN writes are ignored by early silicon; leave disabled.
            vin_uv_warn_limit: 0.0,
            vin_ov_fault_limit: 6.5,
            vout_scale_loop: 0.25,
            vout_min: 1.0,
            vout_max: 2.0,
            vout_command: 1.15,
            iout_oc_warn_limit: 25.0,
            iout_oc_fault_limit: 30.0,
            switching_khz: 650,
        }
    }
}

/// TPS546 error types
#[derive(Error, Debug)]
pub enum Tps546Error {
    #[error("Device ID mismatch: {0:02X?}")]
    DeviceIdMismatch(Vec<u8>),
    #[error("Voltage out of range: {0:.2}V (min: {1:.2}V, max: {2:.2}V)")]
    VoltageOutOfRange(f32, f32, f32),
    #[error("PMBus fault detected: {0}")]
    FaultDetected(String),
}

/// One configuration write.
enum Setting {
    Byte(u8),
    Word(u16),
    Linear11(f32),
    /// Output-relative value, encoded ULINEAR16 with the VOUT_MODE exponent.
    Vout(f32),
}

/// Output rail telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tps546Telemetry {
    pub vin: Voltage,
    pub vout: Voltage,
    pub iout: Current,
    pub temperature: Temperature,
    pub power: Power,
}

/// Decoded status registers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PowerStatus {
    pub word: u16,
    pub critical: Vec<String>,
    pub warnings: Vec<String>,
}

impl PowerStatus {
    pub fn is_ok(&self) -> bool {
        self.critical.is_empty()
    }
}

/// TPS546D24A driver
pub struct Tps546<I2C> {
    regs: I2cRegisters<I2C>,
    config: Tps546Config,
    vout_mode: Option<u8>,
}

impl<I2C: I2c> Tps546<I2C> {
    pub fn new(i2c: I2C, config: Tps546Config) -> Self {
        Self::with_address(i2c, DEFAULT_ADDRESS, config)
    }

    pub fn with_address(i2c: I2C, address: u8, config: Tps546Config) -> Self {
        Self {
            regs: I2cRegisters::new(i2c, address),
            config,
            vout_mode: None,
        }
    }

    pub fn config(&self) -> &Tps546Config {
        &self.config
    }

    /// Verify the part, turn the output off and write the configuration.
    pub async fn init(&mut self) -> Result<()> {
        debug!("Initializing TPS546D24A power regulator");
        self.verify_device_id().await?;

        self.regs
            .write_u8(commands::OPERATION, operation::OFF_IMMEDIATE)
            .await?;
        debug!("Power output turned off");

        let on_off = OnOffConfig::DELAY
            | OnOffConfig::POLARITY
            | OnOffConfig::CP
            | OnOffConfig::CMD
            | OnOffConfig::PU;
        self.regs
            .write_u8(commands::ON_OFF_CONFIG, on_off.bits())
            .await?;
        debug!("ON_OFF_CONFIG set to 0x{:02X} ({:?})", on_off.bits(), on_off);

        let vout_mode = self.refresh_vout_mode().await?;
        debug!(
            "VOUT_MODE: 0x{:02X} (exponent {})",
            vout_mode,
            Linear16::exponent(vout_mode)
        );

        self.write_config().await?;

        let status = self.status().await?;
        debug!(
            "STATUS_WORD after config: 0x{:04X} {:?}",
            status.word,
            flag_names(StatusWord::from_bits_truncate(status.word))
        );
        Ok(())
    }

    fn config_table(&self) -> Vec<(&'static str, u8, Setting)> {
        let c = &self.config;
        let mut table = vec![
            ("PHASE", commands::PHASE, Setting::Byte(0x00)),
            (
                "FREQUENCY_SWITCH",
                commands::FREQUENCY_SWITCH,
                Setting::Linear11(c.switching_khz as f32),
            ),
        ];
        if c.vin_uv_warn_limit > 0.0 {
            table.push((
                "VIN_UV_WARN_LIMIT",
                commands::VIN_UV_WARN_LIMIT,
                Setting::Linear11(c.vin_uv_warn_limit),
            ));
        }
        table.extend([
            ("VIN_ON", commands::VIN_ON, Setting::Linear11(c.vin_on)),
            ("VIN_OFF", commands::VIN_OFF, Setting::Linear11(c.vin_off)),
            (
                "VIN_OV_FAULT_LIMIT",
                commands::VIN_OV_FAULT_LIMIT,
                Setting::Linear11(c.vin_ov_fault_limit),
            ),
            // Shutdown, retry, 182 ms delay.
            ("VIN_OV_FAULT_RESPONSE", commands::VIN_OV_FAULT_RESPONSE, Setting::Byte(0xB7)),
            (
                "VOUT_SCALE_LOOP",
                commands::VOUT_SCALE_LOOP,
                Setting::Linear11(c.vout_scale_loop),
            ),
            ("VOUT_COMMAND", commands::VOUT_COMMAND, Setting::Vout(c.vout_command)),
            ("VOUT_MAX", commands::VOUT_MAX, Setting::Vout(c.vout_max)),
            ("VOUT_MIN", commands::VOUT_MIN, Setting::Vout(c.vout_min)),
            // Output limits are fractions of VOUT_COMMAND.
            ("VOUT_OV_FAULT_LIMIT", commands::VOUT_OV_FAULT_LIMIT, Setting::Vout(1.25)),
            ("VOUT_OV_WARN_LIMIT", commands::VOUT_OV_WARN_LIMIT, Setting::Vout(1.16)),
            ("VOUT_MARGIN_HIGH", commands::VOUT_MARGIN_HIGH, Setting::Vout(1.10)),
            ("VOUT_MARGIN_LOW", commands::VOUT_MARGIN_LOW, Setting::Vout(0.90)),
            ("VOUT_UV_WARN_LIMIT", commands::VOUT_UV_WARN_LIMIT, Setting::Vout(0.90)),
            ("VOUT_UV_FAULT_LIMIT", commands::VOUT_UV_FAULT_LIMIT, Setting::Vout(0.75)),
            (
                "IOUT_OC_WARN_LIMIT",
                commands::IOUT_OC_WARN_LIMIT,
                Setting::Linear11(c.iout_oc_warn_limit),
            ),
            (
                "IOUT_OC_FAULT_LIMIT",
                commands::IOUT_OC_FAULT_LIMIT,
                Setting::Linear11(c.iout_oc_fault_limit),
            ),
            ("IOUT_OC_FAULT_RESPONSE", commands::IOUT_OC_FAULT_RESPONSE, Setting::Byte(0xC0)),
            ("OT_WARN_LIMIT", commands::OT_WARN_LIMIT, Setting::Linear11(105.0)),
            ("OT_FAULT_LIMIT", commands::OT_FAULT_LIMIT, Setting::Linear11(145.0)),
            ("OT_FAULT_RESPONSE", commands::OT_FAULT_RESPONSE, Setting::Byte(0xFF)),
            ("TON_DELAY", commands::TON_DELAY, Setting::Linear11(0.0)),
            ("TON_RISE", commands::TON_RISE, Setting::Linear11(3.0)),
            ("TON_MAX_FAULT_LIMIT", commands::TON_MAX_FAULT_LIMIT, Setting::Linear11(0.0)),
            ("TON_MAX_FAULT_RESPONSE", commands::TON_MAX_FAULT_RESPONSE, Setting::Byte(0x3B)),
            ("TOFF_DELAY", commands::TOFF_DELAY, Setting::Linear11(0.0)),
            ("TOFF_FALL", commands::TOFF_FALL, Setting::Linear11(0.0)),
            ("PIN_DETECT_OVERRIDE", commands::PIN_DETECT_OVERRIDE, Setting::Word(0xFFFF)),
        ]);
        table
    }

    async fn write_config(&mut self) -> Result<()> {
        trace!("---Writing new config values to TPS546---");
        for (name, command, setting) in self.config_table() {
            match setting {
                Setting::Byte(value) => {
                    let desc = FaultResponse::decode(value);
                    trace!("Setting {}: 0x{:02X} ({})", name, value, desc);
                    self.regs.write_u8(command, value).await?;
                }
                Setting::Word(value) => {
                    trace!("Setting {}: 0x{:04X}", name, value);
                    self.regs.write_u16_le(command, value).await?;
                }
                Setting::Linear11(value) => {
                    trace!("Setting {}: {:.2}", name, value);
                    self.regs
                        .write_u16_le(command, Linear11::from_float(value))
                        .await?;
                }
                Setting::Vout(value) => {
                    trace!("Setting {}: {:.2}", name, value);
                    let encoded = self.encode_vout(value).await?;
                    self.regs.write_u16_le(command, encoded).await?;
                }
            }
        }
        debug!("TPS546 configuration written successfully");
        Ok(())
    }

    async fn verify_device_id(&mut self) -> Result<()> {
        let id = self.regs.smbus_block_read(commands::IC_DEVICE_ID, 6).await?;
        debug!("Device ID: {:02X?}", id);

        if !DEVICE_IDS.iter().any(|known| known[..] == id[..]) {
            error!("Device ID mismatch");
            bail!(Tps546Error::DeviceIdMismatch(id));
        }
        Ok(())
    }

    async fn refresh_vout_mode(&mut self) -> Result<u8> {
        let mode = self.regs.read_u8(commands::VOUT_MODE).await?;
        self.vout_mode = Some(mode);
        Ok(mode)
    }

    async fn vout_mode(&mut self) -> Result<u8> {
        match self.vout_mode {
            Some(mode) => Ok(mode),
            None => self.refresh_vout_mode().await,
        }
    }

    async fn encode_vout(&mut self, volts: f32) -> Result<u16> {
        let mode = self.vout_mode().await?;
        Linear16::from_float(volts, mode).context("ULINEAR16 conversion")
    }

    async fn read_linear11(&mut self, command: u8) -> Result<f32> {
        Ok(Linear11::to_float(self.regs.read_u16_le(command).await?))
    }

    pub async fn clear_faults(&mut self) -> Result<()> {
        self.regs.write_raw(&[commands::CLEAR_FAULTS]).await
    }

    /// Set the output voltage. Zero turns the output off.
    pub async fn set_vout(&mut self, volts: f32) -> Result<()> {
        if volts == 0.0 {
            self.regs
                .write_u8(commands::OPERATION, operation::OFF_IMMEDIATE)
                .await?;
            info!("Output voltage turned off");
            return Ok(());
        }

        if volts < self.config.vout_min || volts > self.config.vout_max {
            bail!(Tps546Error::VoltageOutOfRange(
                volts,
                self.config.vout_min,
                self.config.vout_max
            ));
        }

        let value = self.encode_vout(volts).await?;
        self.regs.write_u16_le(commands::VOUT_COMMAND, value).await?;
        debug!("Output voltage set to {:.2}V", volts);

        self.regs.write_u8(commands::OPERATION, operation::ON).await?;
        let op = self.regs.read_u8(commands::OPERATION).await?;
        if op != operation::ON {
            error!("Failed to turn on output, OPERATION = 0x{:02X}", op);
        }
        Ok(())
    }

    pub async fn vin(&mut self) -> Result<Voltage> {
        let volts = self.read_linear11(commands::READ_VIN).await?;
        Ok(Voltage::from_volts(volts as f64))
    }

    pub async fn vout(&mut self) -> Result<Voltage> {
        let raw = self.regs.read_u16_le(commands::READ_VOUT).await?;
        let mode = self.vout_mode().await?;
        Ok(Voltage::from_volts(Linear16::to_float(raw, mode) as f64))
    }

    /// Output current summed over all phases.
    pub async fn iout(&mut self) -> Result<Current> {
        self.regs.write_u8(commands::PHASE, 0xFF).await?;
        let amps = self.read_linear11(commands::READ_IOUT).await?;
        Ok(Current::from_amps(amps as f64))
    }

    pub async fn temperature(&mut self) -> Result<Temperature> {
        let celsius = self.read_linear11(commands::READ_TEMPERATURE_1).await?;
        Ok(Temperature::from_celsius(celsius as f64))
    }

    pub async fn telemetry(&mut self) -> Result<Tps546Telemetry> {
        let vin = self.vin().await?;
        let vout = self.vout().await?;
        let iout = self.iout().await?;
        let temperature = self.temperature().await?;
        Ok(Tps546Telemetry {
            vin,
            vout,
            iout,
            temperature,
            power: vout * iout,
        })
    }

    /// Read STATUS_WORD and the detail registers it points at.
    pub async fn status(&mut self) -> Result<PowerStatus> {
        let word = self.regs.read_u16_le(commands::STATUS_WORD).await?;
        let flags = StatusWord::from_bits_truncate(word);
        let mut status = PowerStatus {
            word,
            ..Default::default()
        };
        if flags.is_empty() {
            return Ok(status);
        }

        if flags.contains(StatusWord::VOUT) {
            let vout = StatusVout::from_bits_truncate(self.regs.read_u8(commands::STATUS_VOUT).await?);
            let desc = format!("VOUT: {}", flag_names(vout).join(", "));
            if vout.intersects(StatusVout::OV_FAULT | StatusVout::UV_FAULT) {
                status.critical.push(desc);
            } else {
                status.warnings.push(desc);
            }
        }

        if flags.contains(StatusWord::IOUT) {
            let iout = StatusIout::from_bits_truncate(self.regs.read_u8(commands::STATUS_IOUT).await?);
            let desc = format!("IOUT: {}", flag_names(iout).join(", "));
            if iout.contains(StatusIout::OC_FAULT) {
                status.critical.push(desc);
            } else {
                status.warnings.push(desc);
            }
        }

        if flags.contains(StatusWord::INPUT) {
            let input =
                StatusInput::from_bits_truncate(self.regs.read_u8(commands::STATUS_INPUT).await?);
            let desc = format!("INPUT: {}", flag_names(input).join(", "));
            if input.intersects(
                StatusInput::UNIT_OFF_VIN_LOW | StatusInput::VIN_UV_FAULT | StatusInput::VIN_OV_FAULT,
            ) {
                status.critical.push(desc);
            } else {
                status.warnings.push(desc);
            }
        }

        if flags.contains(StatusWord::TEMP) {
            let temp = StatusTemperature::from_bits_truncate(
                self.regs.read_u8(commands::STATUS_TEMPERATURE).await?,
            );
            let desc = format!("TEMPERATURE: {}", flag_names(temp).join(", "));
            if temp.contains(StatusTemperature::OT_FAULT) {
                status.critical.push(desc);
            } else {
                status.warnings.push(desc);
            }
        }

        if flags.contains(StatusWord::CML) {
            let cml = StatusCml::from_bits_truncate(self.regs.read_u8(commands::STATUS_CML).await?);
            status
                .critical
                .push(format!("CML: {}", flag_names(cml).join(", ")));
        }

        if flags.contains(StatusWord::OFF) {
            status.critical.push("Power controller is OFF".to_string());
        }

        Ok(status)
    }

    /// Fail if any critical fault is present; log warnings.
    pub async fn check_status(&mut self) -> Result<()> {
        let status = self.status().await?;
        for warning in &status.warnings {
            warn!("TPS546 {}", warning);
        }
        if !status.is_ok() {
            for fault in &status.critical {
                error!("CRITICAL: TPS546 {}", fault);
            }
            bail!(Tps546Error::FaultDetected(status.critical.join("; ")));
        }
        Ok(())
    }
}

#[async_trait]
impl<I2C: I2c + 'static> Sensor for Tps546<I2C> {
    type Reading = Tps546Telemetry;

    fn name(&self) -> &'static str {
        "tps546"
    }

    async fn read(&mut self) -> Result<Tps546Telemetry> {
        self.telemetry().await
    }
}

#[async_trait]
impl<I2C: I2c> Actuator for Tps546<I2C> {
    fn name(&self) -> &'static str {
        "tps546"
    }

    fn unit(&self) -> &'static str {
        "V"
    }

    fn range(&self) -> RangeInclusive<f32> {
        self.config.vout_min..=self.config.vout_max
    }

    fn off_value(&self) -> Option<f32> {
        Some(0.0)
    }

    async fn apply(&mut self, value: f32) -> Result<f32> {
        self.set_vout(value).await?;
        if value == 0.0 {
            return Ok(0.0);
        }
        Ok(self.vout().await?.volts() as f32)
    }
}
