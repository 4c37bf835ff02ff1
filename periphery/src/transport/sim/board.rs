//! A fully populated simulated board.
//!
//! One I2C bus carrying every I2C part in the catalog at its usual address,
//! plus the SPI, analog, PWM and GPIO ports the remaining drivers need. The
//! daemon and demo run against this when no hardware bus is configured.

use parking_lot::Mutex;
use std::sync::Arc;

use super::chips::{
    self, Bh1750Sim, Ina219Sim, Nrf24Sim, Sht4xSim, Ssd1306Sim, Tps546Sim,
};
use super::{CaptureSpiDevice, RegisterFileDevice, SimAnalog, SimI2cBus, SimPin, SimPwm, SimSpi};
use crate::units::Voltage;

pub const BH1750_ADDRESS: u8 = 0x23;
pub const SHT4X_ADDRESS: u8 = 0x44;
pub const BME280_ADDRESS: u8 = 0x76;
pub const INA219_ADDRESS: u8 = 0x41;
pub const DS3231_ADDRESS: u8 = 0x68;
pub const MCP23008_ADDRESS: u8 = 0x20;
pub const PCA9685_ADDRESS: u8 = 0x40;
pub const SSD1306_ADDRESS: u8 = 0x3C;
pub const TPS546_ADDRESS: u8 = 0x24;

type Shared<T> = Arc<Mutex<T>>;

pub struct SimBoard {
    pub i2c: SimI2cBus,
    pub bh1750: Shared<Bh1750Sim>,
    pub sht4x: Shared<Sht4xSim>,
    pub bme280: Shared<RegisterFileDevice>,
    pub ina219: Shared<Ina219Sim>,
    pub ds3231: Shared<RegisterFileDevice>,
    pub mcp23008: Shared<RegisterFileDevice>,
    pub pca9685: Shared<RegisterFileDevice>,
    pub ssd1306: Shared<Ssd1306Sim>,
    pub tps546: Shared<Tps546Sim>,

    pub radio_spi: SimSpi,
    pub radio: Shared<Nrf24Sim>,
    pub radio_ce: SimPin,
    pub shift_spi: SimSpi,
    pub shift: Shared<CaptureSpiDevice>,

    /// TMP36 output; 0.75 V is 25 °C.
    pub thermometer: SimAnalog,
    pub motor_pwm: SimPwm,
    pub motor_a: SimPin,
    pub motor_b: SimPin,
}

impl SimBoard {
    pub fn standard() -> Self {
        let i2c = SimI2cBus::new();
        let bh1750 = i2c.attach(BH1750_ADDRESS, Bh1750Sim::new(320.0));
        let sht4x = i2c.attach(SHT4X_ADDRESS, Sht4xSim::new(22.5, 45.0));
        let bme280 = i2c.attach(BME280_ADDRESS, chips::bme280_registers());
        let ina219 = i2c.attach(INA219_ADDRESS, Ina219Sim::new(12.0, 0.025));
        let ds3231 = i2c.attach(DS3231_ADDRESS, chips::ds3231_registers());
        let mcp23008 = i2c.attach(MCP23008_ADDRESS, chips::mcp23008_registers());
        let pca9685 = i2c.attach(PCA9685_ADDRESS, chips::pca9685_registers());
        let ssd1306 = i2c.attach(SSD1306_ADDRESS, Ssd1306Sim::new(64));
        let tps546 = i2c.attach(TPS546_ADDRESS, Tps546Sim::new(5.0, 1.15, 8.0, 45.0));

        let (radio_spi, radio) = SimSpi::new(Nrf24Sim::new());
        let (shift_spi, shift) = SimSpi::new(CaptureSpiDevice::default());

        Self {
            i2c,
            bh1750,
            sht4x,
            bme280,
            ina219,
            ds3231,
            mcp23008,
            pca9685,
            ssd1306,
            tps546,
            radio_spi,
            radio,
            radio_ce: SimPin::default(),
            shift_spi,
            shift,
            thermometer: SimAnalog::new(Voltage::from_volts(3.3), Voltage::from_volts(0.75)),
            motor_pwm: SimPwm::new(),
            motor_a: SimPin::default(),
            motor_b: SimPin::default(),
        }
    }

    /// Move the environmental models along a slow daily-ish curve so
    /// sampled readings change. `step` is any monotonically increasing count.
    pub fn drift(&self, step: u64) {
        let phase = step as f64 / 20.0;
        let temperature = 22.5 + 2.0 * phase.sin();
        self.sht4x
            .lock()
            .set_conditions(temperature, 45.0 - 5.0 * phase.sin());
        self.bh1750.lock().set_lux(320.0 + 80.0 * (phase / 2.0).cos());
        self.ina219.lock().set_voltages(12.0, 0.025 + 0.005 * phase.sin());
        self.tps546.lock().set_temperature(45.0 + 3.0 * phase.sin() as f32);
        self.thermometer
            .set(Voltage::from_volts(0.5 + (temperature + 0.5) / 100.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;

    #[test]
    fn test_standard_board_population() {
        let board = SimBoard::standard();
        assert_eq!(
            board.i2c.addresses(),
            vec![0x20, 0x23, 0x24, 0x3C, 0x40, 0x41, 0x44, 0x68, 0x76]
        );
    }

    #[tokio::test]
    async fn test_scan_finds_responding_parts() {
        let mut board = SimBoard::standard();
        let hits = registry::scan(&mut board.i2c).await;
        let addresses: Vec<u8> = hits.iter().map(|h| h.address).collect();
        // SHT4x NACKs reads with no measurement pending.
        assert_eq!(addresses, vec![0x20, 0x23, 0x24, 0x3C, 0x40, 0x41, 0x68, 0x76]);

        let display = hits.iter().find(|h| h.address == 0x3C).unwrap();
        assert_eq!(display.candidates, vec!["ssd1306"]);
        let bme = hits.iter().find(|h| h.address == 0x76).unwrap();
        assert_eq!(bme.candidates, vec!["bme280", "pca9685"]);
    }

    #[test]
    fn test_drift_moves_readings() {
        let board = SimBoard::standard();
        board.drift(0);
        let first = board.sht4x.lock().clone();
        board.drift(30);
        let second = board.sht4x.lock().clone();
        assert_ne!(format!("{first:?}"), format!("{second:?}"));
    }
}
