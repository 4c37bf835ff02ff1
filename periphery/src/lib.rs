//! Peripheral drivers over host-supplied bus and port traits.
//!
//! The host provides I2C, SPI, GPIO, analog and PWM ports through the traits
//! in [`hw_trait`]. Drivers in [`peripheral`] wrap one chip's register map
//! over those ports, and expose readings through [`sensor::Sensor`] and
//! setpoints through [`actuator::Actuator`]. [`board`] wires configured
//! devices to a bus and [`api`] serves them over HTTP.

pub mod actuator;
pub mod api;
pub mod board;
pub mod comms;
pub mod config;
pub mod error;
pub mod hw_trait;
pub mod peripheral;
pub mod registry;
pub mod sensor;
pub mod tracing;
pub mod transport;
pub mod units;
