//! MCP23008 8-bit I2C GPIO expander driver
//!
//! Output writes go through a cached copy of OLAT so a single pin can be
//! changed without reading the port back. [`ExpanderPin`] hands out
//! individual pins that implement the GPIO traits, so other drivers can
//! run through the expander as if it were a native port.
//!
//! Datasheet: <https://ww1.microchip.com/downloads/en/DeviceDoc/MCP23008-MCP23S08-Data-Sheet-20001919F.pdf>

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::to_hw_error;
use crate::comms::I2cRegisters;
use crate::hw_trait::{self, I2c, InputPin, OutputPin, PinValue};
use crate::registry::{Category, DriverDescriptor, Interface};
use crate::sensor::Sensor;

pub const DEFAULT_ADDRESS: u8 = 0x20;
pub const PIN_COUNT: u8 = 8;

inventory::submit! {
    DriverDescriptor {
        name: "mcp23008",
        part: "MCP23008",
        category: Category::IoExpander,
        interface: Interface::I2c,
        addresses: &[0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27],
        description: "8-bit GPIO expander with interrupt on change",
    }
}

/// Register addresses (IOCON.BANK is irrelevant on this 8-bit part)
pub mod registers {
    pub const IODIR: u8 = 0x00;
    pub const IPOL: u8 = 0x01;
    pub const GPINTEN: u8 = 0x02;
    pub const DEFVAL: u8 = 0x03;
    pub const INTCON: u8 = 0x04;
    pub const IOCON: u8 = 0x05;
    pub const GPPU: u8 = 0x06;
    pub const INTF: u8 = 0x07;
    pub const INTCAP: u8 = 0x08;
    pub const GPIO: u8 = 0x09;
    pub const OLAT: u8 = 0x0A;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Input,
    Output,
}

/// Interrupt source for one pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    Disabled,
    /// Fire on any change from the previous value.
    OnChange,
    /// Fire while the pin differs from the given level.
    CompareTo(PinValue),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Mcp23008Error {
    #[error("Pin {0} out of range 0..8")]
    InvalidPin(u8),
}

/// Snapshot of the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortState {
    pub gpio: u8,
    pub olat: u8,
    pub iodir: u8,
}

fn pin_mask(pin: u8) -> Result<u8> {
    if pin >= PIN_COUNT {
        bail!(Mcp23008Error::InvalidPin(pin));
    }
    Ok(1 << pin)
}

pub struct Mcp23008<I2C> {
    regs: I2cRegisters<I2C>,
    olat: u8,
}

impl<I2C: I2c> Mcp23008<I2C> {
    pub fn new(i2c: I2C, address: u8) -> Self {
        Self {
            regs: I2cRegisters::new(i2c, address),
            olat: 0,
        }
    }

    /// Load the output latch cache and disable sequential addressing quirks.
    pub async fn init(&mut self) -> Result<()> {
        self.olat = self.regs.read_u8(registers::OLAT).await?;
        self.regs.write_u8(registers::IOCON, 0x00).await?;
        debug!(address = self.regs.address(), olat = self.olat, "MCP23008 initialized");
        Ok(())
    }

    /// Set all eight directions at once; a 1 bit is an input.
    pub async fn set_port_direction(&mut self, inputs: u8) -> Result<()> {
        self.regs.write_u8(registers::IODIR, inputs).await
    }

    pub async fn set_direction(&mut self, pin: u8, direction: Direction) -> Result<()> {
        let mask = pin_mask(pin)?;
        let value = if direction == Direction::Input { mask } else { 0 };
        self.regs.update_u8(registers::IODIR, mask, value).await?;
        Ok(())
    }

    pub async fn set_pull_up(&mut self, pin: u8, enabled: bool) -> Result<()> {
        let mask = pin_mask(pin)?;
        self.regs
            .update_u8(registers::GPPU, mask, if enabled { mask } else { 0 })
            .await?;
        Ok(())
    }

    /// Invert the level reported for an input pin.
    pub async fn set_input_polarity(&mut self, pin: u8, inverted: bool) -> Result<()> {
        let mask = pin_mask(pin)?;
        self.regs
            .update_u8(registers::IPOL, mask, if inverted { mask } else { 0 })
            .await?;
        Ok(())
    }

    pub async fn write_port(&mut self, value: u8) -> Result<()> {
        self.regs.write_u8(registers::OLAT, value).await?;
        self.olat = value;
        trace!(olat = value, "MCP23008 port written");
        Ok(())
    }

    pub async fn write_pin(&mut self, pin: u8, value: PinValue) -> Result<()> {
        let mask = pin_mask(pin)?;
        let next = if value.is_high() {
            self.olat | mask
        } else {
            self.olat & !mask
        };
        if next != self.olat {
            self.write_port(next).await?;
        }
        Ok(())
    }

    /// Cached output latch level of `pin`.
    pub fn output_state(&self, pin: u8) -> PinValue {
        PinValue::from(self.olat & (1 << (pin % PIN_COUNT)) != 0)
    }

    pub async fn read_port(&mut self) -> Result<u8> {
        self.regs.read_u8(registers::GPIO).await
    }

    pub async fn read_pin(&mut self, pin: u8) -> Result<PinValue> {
        let mask = pin_mask(pin)?;
        Ok(PinValue::from(self.read_port().await? & mask != 0))
    }

    pub async fn set_interrupt(&mut self, pin: u8, mode: InterruptMode) -> Result<()> {
        let mask = pin_mask(pin)?;
        match mode {
            InterruptMode::Disabled => {
                self.regs.update_u8(registers::GPINTEN, mask, 0).await?;
            }
            InterruptMode::OnChange => {
                self.regs.update_u8(registers::INTCON, mask, 0).await?;
                self.regs.update_u8(registers::GPINTEN, mask, mask).await?;
            }
            InterruptMode::CompareTo(level) => {
                let default = if level.is_high() { mask } else { 0 };
                self.regs.update_u8(registers::DEFVAL, mask, default).await?;
                self.regs.update_u8(registers::INTCON, mask, mask).await?;
                self.regs.update_u8(registers::GPINTEN, mask, mask).await?;
            }
        }
        Ok(())
    }

    /// Pins that caused the pending interrupt.
    pub async fn interrupt_flags(&mut self) -> Result<u8> {
        self.regs.read_u8(registers::INTF).await
    }

    /// Port value captured at the interrupt. Reading clears the interrupt.
    pub async fn interrupt_capture(&mut self) -> Result<u8> {
        self.regs.read_u8(registers::INTCAP).await
    }

    pub async fn state(&mut self) -> Result<PortState> {
        Ok(PortState {
            gpio: self.read_port().await?,
            olat: self.olat,
            iodir: self.regs.read_u8(registers::IODIR).await?,
        })
    }

    pub fn into_shared(self) -> SharedMcp23008<I2C> {
        Arc::new(Mutex::new(self))
    }
}

#[async_trait]
impl<I2C: I2c + 'static> Sensor for Mcp23008<I2C> {
    type Reading = PortState;

    fn name(&self) -> &'static str {
        "mcp23008"
    }

    async fn read(&mut self) -> Result<PortState> {
        self.state().await
    }
}

pub type SharedMcp23008<I2C> = Arc<Mutex<Mcp23008<I2C>>>;

/// One expander pin usable wherever a GPIO port is expected.
pub struct ExpanderPin<I2C> {
    expander: SharedMcp23008<I2C>,
    pin: u8,
    state: PinValue,
}

impl<I2C: I2c> ExpanderPin<I2C> {
    /// Configure `pin` as an output and wrap it.
    pub async fn output(expander: SharedMcp23008<I2C>, pin: u8) -> Result<Self> {
        let state = {
            let mut guard = expander.lock().await;
            guard.set_direction(pin, Direction::Output).await?;
            guard.output_state(pin)
        };
        Ok(Self { expander, pin, state })
    }

    /// Configure `pin` as an input, optionally pulled up, and wrap it.
    pub async fn input(expander: SharedMcp23008<I2C>, pin: u8, pull_up: bool) -> Result<Self> {
        {
            let mut guard = expander.lock().await;
            guard.set_direction(pin, Direction::Input).await?;
            guard.set_pull_up(pin, pull_up).await?;
        }
        Ok(Self {
            expander,
            pin,
            state: PinValue::Low,
        })
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }
}

#[async_trait]
impl<I2C: I2c + 'static> OutputPin for ExpanderPin<I2C> {
    async fn set(&mut self, value: PinValue) -> hw_trait::Result<()> {
        self.expander
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

#[async_trait]
impl<I2C: I2c + 'static> InputPin for ExpanderPin<I2C> {
    async fn read(&mut self) -> hw_trait::Result<PinValue> {
        self.expander
            .lock()
            .await
            .read_pin(self.pin)
            .await
            .map_err(to_hw_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{chips, SimI2cBus};

    #[tokio::test]
    async fn test_pin_writes_use_cached_latch() {
        let bus = SimI2cBus::new();
        let device = bus.attach(DEFAULT_ADDRESS, chips::mcp23008_registers());
        let mut io = Mcp23008::new(bus.clone(), DEFAULT_ADDRESS);
        io.init().await.unwrap();
        io.set_port_direction(0x00).await.unwrap();

        io.write_pin(0, PinValue::High).await.unwrap();
        io.write_pin(3, PinValue::High).await.unwrap();
        io.write_pin(0, PinValue::Low).await.unwrap();
        // No change, no write.
        io.write_pin(0, PinValue::Low).await.unwrap();

        let device = device.lock();
        assert_eq!(device.get(registers::OLAT), 0b0000_1000);
        let olat_writes: Vec<_> = device
            .writes()
            .iter()
            .filter(|(reg, _)| *reg == registers::OLAT)
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(olat_writes, vec![0b0000_0001, 0b0000_1001, 0b0000_1000]);
    }

    #[tokio::test]
    async fn test_direction_pull_up_and_polarity() {
        let bus = SimI2cBus::new();
        let device = bus.attach(DEFAULT_ADDRESS, chips::mcp23008_registers());
        let mut io = Mcp23008::new(bus, DEFAULT_ADDRESS);

        io.set_direction(2, Direction::Output).await.unwrap();
        io.set_pull_up(5, true).await.unwrap();
        io.set_input_polarity(5, true).await.unwrap();

        let device = device.lock();
        assert_eq!(device.get(registers::IODIR), 0b1111_1011);
        assert_eq!(device.get(registers::GPPU), 0b0010_0000);
        assert_eq!(device.get(registers::IPOL), 0b0010_0000);
    }

    #[tokio::test]
    async fn test_interrupt_configuration() {
        let bus = SimI2cBus::new();
        let device = bus.attach(DEFAULT_ADDRESS, chips::mcp23008_registers());
        let mut io = Mcp23008::new(bus, DEFAULT_ADDRESS);

        io.set_interrupt(1, InterruptMode::OnChange).await.unwrap();
        io.set_interrupt(4, InterruptMode::CompareTo(PinValue::High)).await.unwrap();
        {
            let device = device.lock();
            assert_eq!(device.get(registers::GPINTEN), 0b0001_0010);
            assert_eq!(device.get(registers::INTCON), 0b0001_0000);
            assert_eq!(device.get(registers::DEFVAL), 0b0001_0000);
        }

        device.lock().load(registers::INTF, &[0b0000_0010, 0b1010_0000]);
        assert_eq!(io.interrupt_flags().await.unwrap(), 0b0000_0010);
        assert_eq!(io.interrupt_capture().await.unwrap(), 0b1010_0000);
    }

    #[tokio::test]
    async fn test_invalid_pin() {
        let bus = SimI2cBus::new();
        bus.attach(DEFAULT_ADDRESS, chips::mcp23008_registers());
        let mut io = Mcp23008::new(bus, DEFAULT_ADDRESS);
        let err = io.write_pin(8, PinValue::High).await.unwrap_err();
        assert_eq!(err.downcast_ref::<Mcp23008Error>(), Some(&Mcp23008Error::InvalidPin(8)));
    }

    #[tokio::test]
    async fn test_expander_pins_share_the_port() {
        let bus = SimI2cBus::new();
        let device = bus.attach(DEFAULT_ADDRESS, chips::mcp23008_registers());
        let shared = Mcp23008::new(bus, DEFAULT_ADDRESS).into_shared();

        let mut led = ExpanderPin::output(shared.clone(), 6).await.unwrap();
        let mut button = ExpanderPin::input(shared.clone(), 7, true).await.unwrap();

        led.toggle().await.unwrap();
        assert_eq!(led.state(), PinValue::High);
        assert_eq!(device.lock().get(registers::OLAT), 0b0100_0000);

        device.lock().set(registers::GPIO, 0b1000_0000);
        assert_eq!(button.read().await.unwrap(), PinValue::High);
    }
}
