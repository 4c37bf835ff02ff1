//! Digital port traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Result;

/// Logic level of a digital signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinValue {
    Low,
    High,
}

impl PinValue {
    pub fn is_high(self) -> bool {
        self == PinValue::High
    }

    pub fn is_low(self) -> bool {
        self == PinValue::Low
    }
}

impl From<bool> for PinValue {
    fn from(high: bool) -> Self {
        if high {
            PinValue::High
        } else {
            PinValue::Low
        }
    }
}

impl std::ops::Not for PinValue {
    type Output = PinValue;

    fn not(self) -> PinValue {
        match self {
            PinValue::Low => PinValue::High,
            PinValue::High => PinValue::Low,
        }
    }
}

/// A digital output port.
#[async_trait]
pub trait OutputPin: Send {
    async fn set(&mut self, value: PinValue) -> Result<()>;

    /// Last level written to the port.
    fn state(&self) -> PinValue;

    async fn set_high(&mut self) -> Result<()> {
        self.set(PinValue::High).await
    }

    async fn set_low(&mut self) -> Result<()> {
        self.set(PinValue::Low).await
    }

    async fn toggle(&mut self) -> Result<()> {
        let next = !self.state();
        self.set(next).await
    }
}

/// A digital input port.
#[async_trait]
pub trait InputPin: Send {
    async fn read(&mut self) -> Result<PinValue>;
}

#[async_trait]
impl<T: OutputPin + ?Sized> OutputPin for &mut T {
    async fn set(&mut self, value: PinValue) -> Result<()> {
        (**self).set(value).await
    }

    fn state(&self) -> PinValue {
        (**self).state()
    }
}

#[async_trait]
impl<T: OutputPin + ?Sized> OutputPin for Box<T> {
    async fn set(&mut self, value: PinValue) -> Result<()> {
        (**self).set(value).await
    }

    fn state(&self) -> PinValue {
        (**self).state()
    }
}

#[async_trait]
impl<T: InputPin + ?Sized> InputPin for &mut T {
    async fn read(&mut self) -> Result<PinValue> {
        (**self).read().await
    }
}

#[async_trait]
impl<T: InputPin + ?Sized> InputPin for Box<T> {
    async fn read(&mut self) -> Result<PinValue> {
        (**self).read().await
    }
}
