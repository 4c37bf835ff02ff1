//! Outputs that application code (or the API) can drive with one number.

use async_trait::async_trait;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::hw_trait::{OutputPin, PinValue};

/// A driver output controlled by a single scalar setpoint.
#[async_trait]
pub trait Actuator: Send {
    /// Short driver name used in logs and the API.
    fn name(&self) -> &'static str;

    /// Unit of the setpoint, e.g. "V" or "duty".
    fn unit(&self) -> &'static str;

    /// Accepted setpoints.
    fn range(&self) -> RangeInclusive<f32>;

    /// A setpoint outside `range` that switches the output off, for outputs
    /// whose working range does not reach zero.
    fn off_value(&self) -> Option<f32> {
        None
    }

    /// Whether `apply` takes `value`.
    fn accepts(&self, value: f32) -> bool {
        value.is_finite() && (self.range().contains(&value) || self.off_value() == Some(value))
    }

    /// Apply `value` and return what the hardware reports back, or the
    /// applied value when there is no readback.
    async fn apply(&mut self, value: f32) -> anyhow::Result<f32>;
}

/// An actuator shared between its owner and the API.
pub type SharedActuator = Arc<Mutex<dyn Actuator>>;

/// Wrap an actuator for sharing.
pub fn shared<A: Actuator + 'static>(actuator: A) -> SharedActuator {
    Arc::new(Mutex::new(actuator))
}

/// A digital output driven as an actuator: setpoints at or above 0.5 drive
/// the pin high.
pub struct OutputActuator<P> {
    name: &'static str,
    pin: P,
}

impl<P: OutputPin> OutputActuator<P> {
    pub fn new(name: &'static str, pin: P) -> Self {
        Self { name, pin }
    }
}

#[async_trait]
impl<P: OutputPin> Actuator for OutputActuator<P> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn unit(&self) -> &'static str {
        "level"
    }

    fn range(&self) -> RangeInclusive<f32> {
        0.0..=1.0
    }

    async fn apply(&mut self, value: f32) -> anyhow::Result<f32> {
        self.pin.set(PinValue::from(value >= 0.5)).await?;
        Ok(if self.pin.state().is_high() { 1.0 } else { 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::SimPin;
    use test_case::test_case;

    #[test_case(0.0, PinValue::Low ; "zero is low")]
    #[test_case(0.49, PinValue::Low ; "below half is low")]
    #[test_case(0.5, PinValue::High ; "half is high")]
    #[test_case(1.0, PinValue::High ; "one is high")]
    #[tokio::test]
    async fn test_output_threshold(value: f32, expected: PinValue) {
        let pin = SimPin::default();
        let mut output = OutputActuator::new("x74595", pin.clone());
        let applied = output.apply(value).await.unwrap();
        assert_eq!(pin.value(), expected);
        assert_eq!(applied, if expected.is_high() { 1.0 } else { 0.0 });
    }

    #[tokio::test]
    async fn test_shared_actuator_through_trait_object() {
        let pin = SimPin::default();
        let output = shared(OutputActuator::new("gpio", pin.clone()));
        let mut guard = output.lock().await;
        assert_eq!(guard.name(), "gpio");
        assert_eq!(guard.unit(), "level");
        assert!(guard.range().contains(&1.0));
        guard.apply(1.0).await.unwrap();
        assert_eq!(pin.value(), PinValue::High);
    }
}
