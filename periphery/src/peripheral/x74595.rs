//! 74HC595 serial-in parallel-out shift register chain over SPI
//!
//! Chip select doubles as the storage register clock (RCLK), so every SPI
//! transfer latches the whole chain at once. Chip 0 is the one wired to the
//! host; its byte is clocked out last.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::trace;

use super::to_hw_error;
use crate::hw_trait::{self, OutputPin, PinValue, Spi};
use crate::registry::{Category, DriverDescriptor, Interface};

inventory::submit! {
    DriverDescriptor {
        name: "x74595",
        part: "74HC595",
        category: Category::IoExpander,
        interface: Interface::Spi,
        addresses: &[],
        description: "Chained 8-bit shift register outputs",
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShiftRegisterError {
    #[error("Pin {pin} out of range for {chips} chip(s)")]
    InvalidPin { pin: usize, chips: usize },
    #[error("Expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("A chain needs at least one chip")]
    EmptyChain,
}

pub struct X74595<SPI> {
    spi: SPI,
    state: Vec<u8>,
}

impl<SPI: Spi> X74595<SPI> {
    pub fn new(spi: SPI, chips: usize) -> Result<Self> {
        if chips == 0 {
            bail!(ShiftRegisterError::EmptyChain);
        }
        Ok(Self {
            spi,
            state: vec![0; chips],
        })
    }

    pub fn chips(&self) -> usize {
        self.state.len()
    }

    pub fn pin_count(&self) -> usize {
        self.state.len() * 8
    }

    fn locate(&self, pin: usize) -> Result<(usize, u8)> {
        if pin >= self.pin_count() {
            bail!(ShiftRegisterError::InvalidPin {
                pin,
                chips: self.chips(),
            });
        }
        Ok((pin / 8, 1 << (pin % 8)))
    }

    /// Shift out `state` and keep it once the transfer succeeded.
    async fn latch(&mut self, state: Vec<u8>) -> Result<()> {
        let frame: Vec<u8> = state.iter().rev().copied().collect();
        trace!(frame = %hex::encode(&frame), "74HC595 latch");
        self.spi.write(&frame).await?;
        self.state = state;
        Ok(())
    }

    pub async fn write_pin(&mut self, pin: usize, value: PinValue) -> Result<()> {
        let (chip, mask) = self.locate(pin)?;
        let mut next = self.state.clone();
        if value.is_high() {
            next[chip] |= mask;
        } else {
            next[chip] &= !mask;
        }
        self.latch(next).await
    }

    pub fn pin_state(&self, pin: usize) -> Result<PinValue> {
        let (chip, mask) = self.locate(pin)?;
        Ok(PinValue::from(self.state[chip] & mask != 0))
    }

    /// Set every output; `values[0]` is chip 0.
    pub async fn write_all(&mut self, values: &[u8]) -> Result<()> {
        if values.len() != self.state.len() {
            bail!(ShiftRegisterError::LengthMismatch {
                expected: self.state.len(),
                actual: values.len(),
            });
        }
        self.latch(values.to_vec()).await
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.latch(vec![0; self.state.len()]).await
    }

    pub fn into_shared(self) -> SharedX74595<SPI> {
        Arc::new(Mutex::new(self))
    }
}

pub type SharedX74595<SPI> = Arc<Mutex<X74595<SPI>>>;

/// One output of a shared chain.
pub struct ShiftPin<SPI> {
    chain: SharedX74595<SPI>,
    pin: usize,
    state: PinValue,
}

impl<SPI: Spi> ShiftPin<SPI> {
    pub async fn new(chain: SharedX74595<SPI>, pin: usize) -> Result<Self> {
        let state = chain.lock().await.pin_state(pin)?;
        Ok(Self { chain, pin, state })
    }
}

#[async_trait]
impl<SPI: Spi + 'static> OutputPin for ShiftPin<SPI> {
    async fn set(&mut self, value: PinValue) -> hw_trait::Result<()> {
        self.chain
            .lock()
            .await
            .write_pin(self.pin, value)
            .await
            .map_err(to_hw_error)?;
        self.state = value;
        Ok(())
    }

    fn state(&self) -> PinValue {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{CaptureSpiDevice, SimSpi};

    #[tokio::test]
    async fn test_chain_order_and_pin_writes() {
        let (spi, capture) = SimSpi::new(CaptureSpiDevice::default());
        let mut chain = X74595::new(spi, 2).unwrap();

        chain.write_pin(1, PinValue::High).await.unwrap();
        chain.write_pin(9, PinValue::High).await.unwrap();
        chain.write_pin(1, PinValue::Low).await.unwrap();

        assert_eq!(
            capture.lock().frames,
            vec![vec![0x00, 0x02], vec![0x02, 0x02], vec![0x02, 0x00]]
        );
        assert_eq!(chain.pin_state(9).unwrap(), PinValue::High);
    }

    #[tokio::test]
    async fn test_failed_latch_keeps_previous_state() {
        let (spi, capture) = SimSpi::new(CaptureSpiDevice::default());
        let mut chain = X74595::new(spi.clone(), 1).unwrap();
        chain.write_pin(1, PinValue::High).await.unwrap();

        spi.set_failing(true);
        assert!(chain.write_pin(2, PinValue::High).await.is_err());
        assert!(chain.clear().await.is_err());
        assert_eq!(chain.pin_state(2).unwrap(), PinValue::Low);
        assert_eq!(chain.pin_state(1).unwrap(), PinValue::High);

        spi.set_failing(false);
        chain.write_pin(3, PinValue::High).await.unwrap();
        assert_eq!(capture.lock().frames, vec![vec![0x02], vec![0x0A]]);
    }

    #[tokio::test]
    async fn test_write_all_and_clear() {
        let (spi, capture) = SimSpi::new(CaptureSpiDevice::default());
        let mut chain = X74595::new(spi, 3).unwrap();

        chain.write_all(&[0x01, 0x02, 0x03]).await.unwrap();
        chain.clear().await.unwrap();
        assert!(chain.write_all(&[0x01]).await.is_err());

        assert_eq!(capture.lock().frames, vec![vec![0x03, 0x02, 0x01], vec![0, 0, 0]]);
    }

    #[tokio::test]
    async fn test_bounds() {
        let (spi, _) = SimSpi::new(CaptureSpiDevice::default());
        assert!(X74595::new(spi.clone(), 0).is_err());
        let mut chain = X74595::new(spi, 1).unwrap();
        let err = chain.write_pin(8, PinValue::High).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ShiftRegisterError>(),
            Some(&ShiftRegisterError::InvalidPin { pin: 8, chips: 1 })
        );
    }

    #[tokio::test]
    async fn test_shift_pins() {
        let (spi, capture) = SimSpi::new(CaptureSpiDevice::default());
        let chain = X74595::new(spi, 1).unwrap().into_shared();
        let mut pin = ShiftPin::new(chain.clone(), 4).await.unwrap();

        pin.set_high().await.unwrap();
        pin.toggle().await.unwrap();
        assert_eq!(capture.lock().frames, vec![vec![0x10], vec![0x00]]);
    }
}
