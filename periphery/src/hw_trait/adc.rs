//! Analog input port trait.

use async_trait::async_trait;

use super::Result;
use crate::units::Voltage;

/// A single analog input channel.
#[async_trait]
pub trait AnalogInput: Send {
    /// Sample the channel.
    async fn read_voltage(&mut self) -> Result<Voltage>;

    /// Full-scale voltage of the converter.
    fn reference_voltage(&self) -> Voltage;
}

#[async_trait]
impl<T: AnalogInput + ?Sized> AnalogInput for &mut T {
    async fn read_voltage(&mut self) -> Result<Voltage> {
        (**self).read_voltage().await
    }

    fn reference_voltage(&self) -> Voltage {
        (**self).reference_voltage()
    }
}

#[async_trait]
impl<T: AnalogInput + ?Sized> AnalogInput for Box<T> {
    async fn read_voltage(&mut self) -> Result<Voltage> {
        (**self).read_voltage().await
    }

    fn reference_voltage(&self) -> Voltage {
        (**self).reference_voltage()
    }
}
