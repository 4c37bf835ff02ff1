//! I2C bus trait.

use async_trait::async_trait;

use super::Result;

/// An I2C bus controller using 7-bit addressing.
///
/// Implementations are expected to be cheap handles onto a shared bus so that
/// several drivers can each own one. A device that does not acknowledge its
/// address is reported as [`super::HwError::Nack`].
#[async_trait]
pub trait I2c: Send {
    /// Write `data` to the device at `address`.
    async fn write(&mut self, address: u8, data: &[u8]) -> Result<()>;

    /// Read `buffer.len()` bytes from the device at `address`.
    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<()>;

    /// Write `data`, then read into `buffer` after a repeated start.
    async fn write_read(&mut self, address: u8, data: &[u8], buffer: &mut [u8]) -> Result<()>;
}

#[async_trait]
impl<T: I2c + ?Sized> I2c for &mut T {
    async fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        (**self).write(address, data).await
    }

    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<()> {
        (**self).read(address, buffer).await
    }

    async fn write_read(&mut self, address: u8, data: &[u8], buffer: &mut [u8]) -> Result<()> {
        (**self).write_read(address, data, buffer).await
    }
}

#[async_trait]
impl<T: I2c + ?Sized> I2c for Box<T> {
    async fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        (**self).write(address, data).await
    }

    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<()> {
        (**self).read(address, buffer).await
    }

    async fn write_read(&mut self, address: u8, data: &[u8], buffer: &mut [u8]) -> Result<()> {
        (**self).write_read(address, data, buffer).await
    }
}
