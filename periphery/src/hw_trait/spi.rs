//! SPI device trait.

use async_trait::async_trait;

use super::Result;

/// A device on an SPI bus with its chip select managed by the implementation.
///
/// Chip select is asserted for the duration of each call, so one call is one
/// bus transaction from the device's point of view.
#[async_trait]
pub trait Spi: Send {
    /// Clock out `data`, discarding whatever the device returns.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Full-duplex transfer. `write` and `read` must be the same length.
    async fn transfer(&mut self, write: &[u8], read: &mut [u8]) -> Result<()>;
}

#[async_trait]
impl<T: Spi + ?Sized> Spi for &mut T {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data).await
    }

    async fn transfer(&mut self, write: &[u8], read: &mut [u8]) -> Result<()> {
        (**self).transfer(write, read).await
    }
}

#[async_trait]
impl<T: Spi + ?Sized> Spi for Box<T> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data).await
    }

    async fn transfer(&mut self, write: &[u8], read: &mut [u8]) -> Result<()> {
        (**self).transfer(write, read).await
    }
}
