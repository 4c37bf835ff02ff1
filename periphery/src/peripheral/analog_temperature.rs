//! Linear analog temperature sensors (TMP36, LM35 and similar).
//!
//! These parts output a voltage linear in temperature:
//! `°C = (mV - offset) / slope`.

use anyhow::Result;
use async_trait::async_trait;
use tracing::trace;

use crate::hw_trait::AnalogInput;
use crate::registry::{Category, DriverDescriptor, Interface};
use crate::sensor::Sensor;
use crate::units::{Temperature, Voltage};

inventory::submit! {
    DriverDescriptor {
        name: "analog-temperature",
        part: "TMP36/LM35",
        category: Category::Sensor,
        interface: Interface::Analog,
        addresses: &[],
        description: "Linear voltage-output temperature sensor",
    }
}

/// Transfer function of a linear sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Output at 0 °C.
    pub offset: Voltage,
    /// Millivolts per degree Celsius.
    pub millivolts_per_degree: f64,
}

impl Calibration {
    pub const TMP36: Self = Self {
        offset: Voltage::from_volts(0.5),
        millivolts_per_degree: 10.0,
    };

    pub const LM35: Self = Self {
        offset: Voltage::ZERO,
        millivolts_per_degree: 10.0,
    };

    pub fn temperature(&self, voltage: Voltage) -> Temperature {
        let mv = (voltage - self.offset).millivolts();
        Temperature::from_celsius(mv / self.millivolts_per_degree)
    }
}

pub struct AnalogTemperature<A> {
    input: A,
    calibration: Calibration,
}

impl<A: AnalogInput> AnalogTemperature<A> {
    pub fn new(input: A, calibration: Calibration) -> Self {
        Self { input, calibration }
    }

    pub fn tmp36(input: A) -> Self {
        Self::new(input, Calibration::TMP36)
    }

    pub fn lm35(input: A) -> Self {
        Self::new(input, Calibration::LM35)
    }

    pub async fn temperature(&mut self) -> Result<Temperature> {
        let voltage = self.input.read_voltage().await?;
        let temperature = self.calibration.temperature(voltage);
        trace!(%voltage, %temperature, "Analog temperature sample");
        Ok(temperature)
    }
}

#[async_trait]
impl<A: AnalogInput + 'static> Sensor for AnalogTemperature<A> {
    type Reading = Temperature;

    fn name(&self) -> &'static str {
        "analog-temperature"
    }

    async fn read(&mut self) -> Result<Temperature> {
        self.temperature().await
    }
}
