//! Peripheral chip drivers.
//!
//! Each driver is generic over the bus or port traits in [`crate::hw_trait`]
//! and registers a [`crate::registry::DriverDescriptor`] so the catalog and
//! bus scanner know about it.

pub mod analog_temperature;
pub mod bh1750;
pub mod bme280;
pub mod ds3231;
pub mod hbridge;
pub mod ina219;
pub mod mcp23008;
pub mod nrf24l01;
pub mod pca9685;
pub mod pmbus;
pub mod sht4x;
pub mod ssd1306;
pub mod tps546;
pub mod x74595;

use crate::hw_trait::HwError;

/// Port wrappers over shared drivers report through [`HwError`]. Bus errors
/// pass through unchanged; chip errors become [`HwError::Other`].
pub(crate) fn to_hw_error(e: anyhow::Error) -> HwError {
    e.downcast::<HwError>()
        .unwrap_or_else(|e| HwError::Other(format!("{e:#}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_errors_pass_through() {
        let e = anyhow::Error::from(HwError::Nack { address: 0x20 });
        assert!(matches!(to_hw_error(e), HwError::Nack { address: 0x20 }));

        let e = anyhow::anyhow!("pin 9 out of range");
        assert!(matches!(to_hw_error(e), HwError::Other(msg) if msg == "pin 9 out of range"));
    }
}
