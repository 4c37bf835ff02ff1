//! Linux `i2c-dev` bus adapter.
//!
//! Every transaction goes through `linux-embedded-hal`'s `I2cdev` as one
//! combined transfer, so a write followed by a read goes out with a repeated
//! start. The underlying ioctl blocks, so it runs on tokio's blocking pool.

use async_trait::async_trait;
use embedded_hal::i2c::{Error as _, ErrorKind, I2c as _, Operation};
use linux_embedded_hal::i2cdev::linux::LinuxI2CError;
use linux_embedded_hal::{I2CError, I2cdev};
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::hw_trait::{self, HwError, I2c};
use crate::tracing::prelude::*;

/// One `/dev/i2c-N` bus. Clones share the open device.
#[derive(Clone)]
pub struct LinuxI2c {
    device: Arc<Mutex<I2cdev>>,
    path: PathBuf,
}

impl std::fmt::Debug for LinuxI2c {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxI2c").field("path", &self.path).finish()
    }
}

impl LinuxI2c {
    /// Open `/dev/i2c-{bus}`.
    pub fn open(bus: u8) -> hw_trait::Result<Self> {
        Self::open_path(format!("/dev/i2c-{bus}"))
    }

    pub fn open_path(path: impl AsRef<Path>) -> hw_trait::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let device = I2cdev::new(&path).map_err(open_error)?;
        debug!(path = %path.display(), "Opened I2C bus");
        Ok(Self {
            device: Arc::new(Mutex::new(device)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run an optional write then an optional read as one combined transfer.
    async fn transfer(
        &self,
        address: u8,
        write: Vec<u8>,
        read_len: usize,
    ) -> hw_trait::Result<Vec<u8>> {
        if address > 0x7F {
            return Err(HwError::InvalidParameter(format!(
                "0x{address:02X} is not a 7-bit address"
            )));
        }
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || -> hw_trait::Result<Vec<u8>> {
            let mut read = vec![0u8; read_len];
            let mut operations = Vec::with_capacity(2);
            if !write.is_empty() {
                operations.push(Operation::Write(&write));
            }
            if read_len > 0 {
                operations.push(Operation::Read(&mut read));
            }
            if !operations.is_empty() {
                device
                    .lock()
                    .transaction(address, &mut operations)
                    .map_err(|e| transfer_error(address, e))?;
            }
            drop(operations);
            Ok(read)
        })
        .await
        .map_err(|e| HwError::Other(format!("I2C worker failed: {e}")))?
    }
}

fn open_error(err: LinuxI2CError) -> HwError {
    HwError::Io(io::Error::other(err.to_string()))
}

fn transfer_error(address: u8, err: I2CError) -> HwError {
    match err.kind() {
        ErrorKind::NoAcknowledge(_) => HwError::Nack { address },
        _ => HwError::Io(io::Error::other(err.to_string())),
    }
}

#[async_trait]
impl I2c for LinuxI2c {
    async fn write(&mut self, address: u8, data: &[u8]) -> hw_trait::Result<()> {
        self.transfer(address, data.to_vec(), 0).await?;
        Ok(())
    }

    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> hw_trait::Result<()> {
        let data = self.transfer(address, Vec::new(), buffer.len()).await?;
        buffer.copy_from_slice(&data);
        Ok(())
    }

    async fn write_read(&mut self, address: u8, data: &[u8], buffer: &mut [u8]) -> hw_trait::Result<()> {
        let read = self.transfer(address, data.to_vec(), buffer.len()).await?;
        buffer.copy_from_slice(&read);
        Ok(())
    }
}
