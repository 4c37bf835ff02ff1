//! Host adapters for the bus and port traits.
//!
//! Drivers never depend on these directly; applications pick one and hand
//! the resulting bus handles to drivers.

#[cfg(target_os = "linux")]
pub mod linux_i2c;
pub mod sim;
