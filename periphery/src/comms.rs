//! Register access over I2C.
//!
//! Most I2C peripherals expose a register pointer: write the register
//! address, then read or write bytes. [`I2cRegisters`] binds a device address
//! to a bus and provides the typed accessors drivers build on.

use anyhow::Result;
use tracing::{trace, warn};

use crate::hw_trait::I2c;

/// A single device on an I2C bus, addressed through 8-bit registers.
#[derive(Debug, Clone)]
pub struct I2cRegisters<I2C> {
    i2c: I2C,
    address: u8,
}

impl<I2C: I2c> I2cRegisters<I2C> {
    pub fn new(i2c: I2C, address: u8) -> Self {
        Self { i2c, address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Borrow the underlying bus for chip-specific framing.
    pub fn bus(&mut self) -> &mut I2C {
        &mut self.i2c
    }

    pub fn release(self) -> I2C {
        self.i2c
    }

    /// Write raw bytes with no register prefix.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        trace!(address = self.address, data = %hex::encode(data), "i2c write");
        self.i2c.write(self.address, data).await?;
        Ok(())
    }

    /// Read raw bytes with no register prefix.
    pub async fn read_raw(&mut self, buffer: &mut [u8]) -> Result<()> {
        self.i2c.read(self.address, buffer).await?;
        trace!(address = self.address, data = %hex::encode(&*buffer), "i2c read");
        Ok(())
    }

    pub async fn read_into(&mut self, register: u8, buffer: &mut [u8]) -> Result<()> {
        self.i2c.write_read(self.address, &[register], buffer).await?;
        trace!(
            address = self.address,
            register,
            data = %hex::encode(&*buffer),
            "register read"
        );
        Ok(())
    }

    pub async fn read_u8(&mut self, register: u8) -> Result<u8> {
        let mut data = [0u8; 1];
        self.read_into(register, &mut data).await?;
        Ok(data[0])
    }

    pub async fn write_u8(&mut self, register: u8, value: u8) -> Result<()> {
        self.write_block(register, &[value]).await
    }

    pub async fn read_u16_be(&mut self, register: u8) -> Result<u16> {
        let mut data = [0u8; 2];
        self.read_into(register, &mut data).await?;
        Ok(u16::from_be_bytes(data))
    }

    pub async fn read_u16_le(&mut self, register: u8) -> Result<u16> {
        let mut data = [0u8; 2];
        self.read_into(register, &mut data).await?;
        Ok(u16::from_le_bytes(data))
    }

    pub async fn write_u16_be(&mut self, register: u8, value: u16) -> Result<()> {
        self.write_block(register, &value.to_be_bytes()).await
    }

    pub async fn write_u16_le(&mut self, register: u8, value: u16) -> Result<()> {
        self.write_block(register, &value.to_le_bytes()).await
    }

    pub async fn read_block(&mut self, register: u8, length: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; length];
        self.read_into(register, &mut buffer).await?;
        Ok(buffer)
    }

    pub async fn write_block(&mut self, register: u8, data: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.push(register);
        frame.extend_from_slice(data);
        self.write_raw(&frame).await
    }

    /// Read-modify-write: replace the bits selected by `mask` with `value`.
    pub async fn update_u8(&mut self, register: u8, mask: u8, value: u8) -> Result<u8> {
        let current = self.read_u8(register).await?;
        let next = (current & !mask) | (value & mask);
        if next != current {
            self.write_u8(register, next).await?;
        }
        Ok(next)
    }

    /// SMBus block read: the device sends a length byte, then the data.
    pub async fn smbus_block_read(&mut self, command: u8, length: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; length + 1];
        self.read_into(command, &mut buffer).await?;

        let reported_length = buffer[0] as usize;
        if reported_length != length {
            warn!(
                address = self.address,
                command, "Block read length mismatch: expected {}, got {}", length, reported_length
            );
        }

        Ok(buffer[1..=length].to_vec())
    }
}
