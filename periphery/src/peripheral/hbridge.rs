//! DC motor on an H-bridge (L298N, TB6612 and similar)
//!
//! Two direction inputs select forward, reverse, coast (both low) or brake
//! (both high); a PWM input sets speed. Any PWM port and output pins work,
//! including PCA9685 channels and expander pins.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::ops::RangeInclusive;
use thiserror::Error;
use tracing::debug;

use crate::actuator::Actuator;
use crate::hw_trait::{OutputPin, PinValue, PwmOutput};
use crate::registry::{Category, DriverDescriptor, Interface};
use crate::units::Frequency;

inventory::submit! {
    DriverDescriptor {
        name: "hbridge",
        part: "L298N/TB6612",
        category: Category::Motor,
        interface: Interface::Gpio,
        addresses: &[],
        description: "Bidirectional DC motor on an H-bridge",
    }
}

pub const DEFAULT_PWM_FREQUENCY: Frequency = Frequency::from_hertz(1600.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MotorState {
    Forward,
    Reverse,
    Coast,
    Brake,
}

#[derive(Error, Debug, PartialEq)]
pub enum HBridgeError {
    #[error("Speed {0} outside -1.0..=1.0")]
    InvalidSpeed(f32),
}

pub struct HBridgeMotor<P, A, B> {
    pwm: P,
    in_a: A,
    in_b: B,
    inverted: bool,
    speed: f32,
    state: MotorState,
}

impl<P, A, B> HBridgeMotor<P, A, B>
where
    P: PwmOutput,
    A: OutputPin,
    B: OutputPin,
{
    /// Take the ports and leave the motor coasting with PWM running at zero.
    pub async fn new(mut pwm: P, in_a: A, in_b: B) -> Result<Self> {
        pwm.set_frequency(DEFAULT_PWM_FREQUENCY).await?;
        pwm.set_duty_cycle(0.0).await?;
        pwm.start().await?;
        let mut motor = Self {
            pwm,
            in_a,
            in_b,
            inverted: false,
            speed: 0.0,
            state: MotorState::Coast,
        };
        motor.coast().await?;
        Ok(motor)
    }

    /// Swap forward and reverse, for motors wired backwards.
    pub fn set_inverted(&mut self, inverted: bool) {
        self.inverted = inverted;
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn state(&self) -> MotorState {
        self.state
    }

    async fn drive_pins(&mut self, a: PinValue, b: PinValue) -> Result<()> {
        self.in_a.set(a).await?;
        self.in_b.set(b).await?;
        Ok(())
    }

    /// Signed speed: positive forward, negative reverse, zero coasts.
    pub async fn set_speed(&mut self, speed: f32) -> Result<()> {
        if !(-1.0..=1.0).contains(&speed) {
            bail!(HBridgeError::InvalidSpeed(speed));
        }
        if speed == 0.0 {
            return self.coast().await;
        }

        let forward = (speed > 0.0) != self.inverted;
        if forward {
            self.drive_pins(PinValue::High, PinValue::Low).await?;
        } else {
            self.drive_pins(PinValue::Low, PinValue::High).await?;
        }
        self.pwm.set_duty_cycle(speed.abs()).await?;
        self.speed = speed;
        self.state = if speed > 0.0 {
            MotorState::Forward
        } else {
            MotorState::Reverse
        };
        debug!(speed, state = ?self.state, "Motor speed set");
        Ok(())
    }

    /// Let the motor spin down freely.
    pub async fn coast(&mut self) -> Result<()> {
        self.pwm.set_duty_cycle(0.0).await?;
        self.drive_pins(PinValue::Low, PinValue::Low).await?;
        self.speed = 0.0;
        self.state = MotorState::Coast;
        Ok(())
    }

    /// Short the windings to stop quickly.
    pub async fn brake(&mut self) -> Result<()> {
        self.drive_pins(PinValue::High, PinValue::High).await?;
        self.pwm.set_duty_cycle(1.0).await?;
        self.speed = 0.0;
        self.state = MotorState::Brake;
        Ok(())
    }
}

#[async_trait]
impl<P, A, B> Actuator for HBridgeMotor<P, A, B>
where
    P: PwmOutput,
    A: OutputPin,
    B: OutputPin,
{
    fn name(&self) -> &'static str {
        "hbridge"
    }

    fn unit(&self) -> &'static str {
        "speed"
    }

    fn range(&self) -> RangeInclusive<f32> {
        -1.0..=1.0
    }

    async fn apply(&mut self, value: f32) -> Result<f32> {
        self.set_speed(value).await?;
        Ok(self.speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{SimPin, SimPwm};

    async fn motor() -> (SimPwm, SimPin, SimPin, HBridgeMotor<SimPwm, SimPin, SimPin>) {
        let (pwm, a, b) = (SimPwm::new(), SimPin::default(), SimPin::default());
        let motor = HBridgeMotor::new(pwm.clone(), a.clone(), b.clone()).await.unwrap();
        (pwm, a, b, motor)
    }

    #[tokio::test]
    async fn test_starts_coasting() {
        let (pwm, a, b, motor) = motor().await;
        assert!(pwm.is_running());
        assert_eq!(pwm.frequency(), DEFAULT_PWM_FREQUENCY);
        assert_eq!((a.value(), b.value()), (PinValue::Low, PinValue::Low));
        assert_eq!(motor.state(), MotorState::Coast);
    }

    #[tokio::test]
    async fn test_forward_reverse() {
        let (pwm, a, b, mut motor) = motor().await;

        motor.set_speed(0.6).await.unwrap();
        assert_eq!((a.value(), b.value()), (PinValue::High, PinValue::Low));
        assert_eq!(pwm.duty_cycle(), 0.6);

        motor.set_speed(-0.25).await.unwrap();
        assert_eq!((a.value(), b.value()), (PinValue::Low, PinValue::High));
        assert_eq!(pwm.duty_cycle(), 0.25);
        assert_eq!(motor.state(), MotorState::Reverse);
    }

    #[tokio::test]
    async fn test_inverted_motor() {
        let (_pwm, a, b, mut motor) = motor().await;
        motor.set_inverted(true);
        motor.set_speed(1.0).await.unwrap();
        assert_eq!((a.value(), b.value()), (PinValue::Low, PinValue::High));
        assert_eq!(motor.state(), MotorState::Forward);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_state() {
        let (pwm, _a, b, mut motor) = motor().await;
        motor.set_speed(0.4).await.unwrap();

        b.set_failing(true);
        assert!(motor.set_speed(-0.8).await.is_err());
        assert!(motor.brake().await.is_err());
        assert_eq!(motor.speed(), 0.4);
        assert_eq!(motor.state(), MotorState::Forward);
        assert_eq!(pwm.duty_cycle(), 0.4);

        b.set_failing(false);
        motor.set_speed(-0.8).await.unwrap();
        assert_eq!(motor.state(), MotorState::Reverse);
    }

    #[tokio::test]
    async fn test_brake_and_bounds() {
        let (pwm, a, b, mut motor) = motor().await;
        motor.brake().await.unwrap();
        assert_eq!((a.value(), b.value()), (PinValue::High, PinValue::High));
        assert_eq!(pwm.duty_cycle(), 1.0);

        let err = motor.apply(1.5).await.unwrap_err();
        assert_eq!(err.downcast_ref::<HBridgeError>(), Some(&HBridgeError::InvalidSpeed(1.5)));
        assert_eq!(motor.apply(0.0).await.unwrap(), 0.0);
        assert_eq!(motor.state(), MotorState::Coast);
    }
}
