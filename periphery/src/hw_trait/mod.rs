//! Hardware abstraction layer traits.
//!
//! This module defines the port and bus interfaces (I2C, SPI, GPIO, analog
//! input, PWM) that drivers are written against. The host supplies the
//! implementations, whether direct Linux hardware access, an MCU HAL
//! bridged in by the application, or the simulated bus in
//! [`crate::transport::sim`].

pub mod adc;
pub mod gpio;
pub mod i2c;
pub mod pwm;
pub mod spi;

// Re-export traits
pub use adc::AnalogInput;
pub use gpio::{InputPin, OutputPin, PinValue};
pub use i2c::I2c;
pub use pwm::PwmOutput;
pub use spi::Spi;

/// Common error type for hardware operations
#[derive(Debug, thiserror::Error)]
pub enum HwError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No device acknowledged the address
    #[error("No acknowledge from address 0x{address:02X}")]
    Nack { address: u8 },

    /// Invalid parameter or argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation not supported by hardware
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Timeout waiting for hardware response
    #[error("Hardware timeout")]
    Timeout,

    /// Other hardware-specific error
    #[error("Hardware error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, HwError>;
