//! PWM output port trait.

use async_trait::async_trait;

use super::Result;
use crate::units::Frequency;

/// A pulse-width modulated output.
///
/// Duty cycle is a fraction in `0.0..=1.0`; implementations reject values
/// outside that range with [`super::HwError::InvalidParameter`].
#[async_trait]
pub trait PwmOutput: Send {
    async fn set_frequency(&mut self, frequency: Frequency) -> Result<()>;

    fn frequency(&self) -> Frequency;

    async fn set_duty_cycle(&mut self, duty: f32) -> Result<()>;

    fn duty_cycle(&self) -> f32;

    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;
}

#[async_trait]
impl<T: PwmOutput + ?Sized> PwmOutput for &mut T {
    async fn set_frequency(&mut self, frequency: Frequency) -> Result<()> {
        (**self).set_frequency(frequency).await
    }

    fn frequency(&self) -> Frequency {
        (**self).frequency()
    }

    async fn set_duty_cycle(&mut self, duty: f32) -> Result<()> {
        (**self).set_duty_cycle(duty).await
    }

    fn duty_cycle(&self) -> f32 {
        (**self).duty_cycle()
    }

    async fn start(&mut self) -> Result<()> {
        (**self).start().await
    }

    async fn stop(&mut self) -> Result<()> {
        (**self).stop().await
    }
}

#[async_trait]
impl<T: PwmOutput + ?Sized> PwmOutput for Box<T> {
    async fn set_frequency(&mut self, frequency: Frequency) -> Result<()> {
        (**self).set_frequency(frequency).await
    }

    fn frequency(&self) -> Frequency {
        (**self).frequency()
    }

    async fn set_duty_cycle(&mut self, duty: f32) -> Result<()> {
        (**self).set_duty_cycle(duty).await
    }

    fn duty_cycle(&self) -> f32 {
        (**self).duty_cycle()
    }

    async fn start(&mut self) -> Result<()> {
        (**self).start().await
    }

    async fn stop(&mut self) -> Result<()> {
        (**self).stop().await
    }
}

/// Check a duty cycle is within `0.0..=1.0`.
pub fn validate_duty(duty: f32) -> Result<()> {
    if (0.0..=1.0).contains(&duty) {
        Ok(())
    } else {
        Err(super::HwError::InvalidParameter(format!(
            "duty cycle {duty} outside 0.0..=1.0"
        )))
    }
}
