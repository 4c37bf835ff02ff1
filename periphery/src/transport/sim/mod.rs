//! Simulated buses and ports.
//!
//! The simulated I2C bus routes transactions to in-memory device models
//! keyed by address and records every transaction. Device models are shared
//! behind `Arc<Mutex<_>>` so a test can attach a model, hand the bus to a
//! driver, and then inspect or adjust the model between driver calls.

pub mod board;
pub mod chips;

pub use board::SimBoard;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::hw_trait::{self, AnalogInput, HwError, I2c, InputPin, OutputPin, PinValue, PwmOutput, Spi};
use crate::units::{Frequency, Voltage};

/// Behaviour of one simulated I2C target.
pub trait SimI2cDevice: Send {
    fn write(&mut self, data: &[u8]) -> hw_trait::Result<()>;

    fn read(&mut self, buffer: &mut [u8]) -> hw_trait::Result<()>;

    fn write_read(&mut self, data: &[u8], buffer: &mut [u8]) -> hw_trait::Result<()> {
        self.write(data)?;
        self.read(buffer)
    }
}

/// A recorded bus transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum I2cTransaction {
    Write { address: u8, data: Vec<u8> },
    Read { address: u8, data: Vec<u8> },
    WriteRead { address: u8, data: Vec<u8>, read: Vec<u8> },
}

impl I2cTransaction {
    pub fn address(&self) -> u8 {
        match self {
            I2cTransaction::Write { address, .. }
            | I2cTransaction::Read { address, .. }
            | I2cTransaction::WriteRead { address, .. } => *address,
        }
    }
}

type SharedDevice = Arc<Mutex<dyn SimI2cDevice>>;

#[derive(Default)]
struct SimBusInner {
    devices: HashMap<u8, SharedDevice>,
    log: Vec<I2cTransaction>,
}

/// A simulated I2C bus. Clones share the same bus.
#[derive(Clone, Default)]
pub struct SimI2cBus {
    inner: Arc<Mutex<SimBusInner>>,
}

impl SimI2cBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device model at `address`, replacing any previous one.
    pub fn attach<D: SimI2cDevice + 'static>(&self, address: u8, device: D) -> Arc<Mutex<D>> {
        let device = Arc::new(Mutex::new(device));
        self.inner.lock().devices.insert(address, device.clone());
        device
    }

    pub fn detach(&self, address: u8) {
        self.inner.lock().devices.remove(&address);
    }

    /// Addresses with an attached device, ascending.
    pub fn addresses(&self) -> Vec<u8> {
        let mut addresses: Vec<u8> = self.inner.lock().devices.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    pub fn transactions(&self) -> Vec<I2cTransaction> {
        self.inner.lock().log.clone()
    }

    /// Transactions addressed to one device.
    pub fn transactions_for(&self, address: u8) -> Vec<I2cTransaction> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|t| t.address() == address)
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.inner.lock().log.clear();
    }

    fn device(&self, address: u8) -> hw_trait::Result<SharedDevice> {
        self.inner
            .lock()
            .devices
            .get(&address)
            .cloned()
            .ok_or(HwError::Nack { address })
    }

    fn record(&self, transaction: I2cTransaction) {
        self.inner.lock().log.push(transaction);
    }
}

/// Models report a refused transfer as a NACK without knowing their address.
fn readdress(e: HwError, address: u8) -> HwError {
    match e {
        HwError::Nack { .. } => HwError::Nack { address },
        other => other,
    }
}

#[async_trait]
impl I2c for SimI2cBus {
    async fn write(&mut self, address: u8, data: &[u8]) -> hw_trait::Result<()> {
        let device = self.device(address)?;
        device.lock().write(data).map_err(|e| readdress(e, address))?;
        self.record(I2cTransaction::Write { address, data: data.to_vec() });
        Ok(())
    }

    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> hw_trait::Result<()> {
        let device = self.device(address)?;
        device.lock().read(buffer).map_err(|e| readdress(e, address))?;
        self.record(I2cTransaction::Read { address, data: buffer.to_vec() });
        Ok(())
    }

    async fn write_read(&mut self, address: u8, data: &[u8], buffer: &mut [u8]) -> hw_trait::Result<()> {
        let device = self.device(address)?;
        device
            .lock()
            .write_read(data, buffer)
            .map_err(|e| readdress(e, address))?;
        self.record(I2cTransaction::WriteRead {
            address,
            data: data.to_vec(),
            read: buffer.to_vec(),
        });
        Ok(())
    }
}

/// A device with 256 byte-wide registers and an auto-incrementing pointer.
///
/// The first byte of a write sets the pointer; remaining bytes are stored
/// starting there. Reads return bytes from the pointer onward.
#[derive(Debug, Clone)]
pub struct RegisterFileDevice {
    registers: [u8; 256],
    pointer: u8,
    writes: Vec<(u8, u8)>,
}

impl Default for RegisterFileDevice {
    fn default() -> Self {
        Self {
            registers: [0; 256],
            pointer: 0,
            writes: Vec::new(),
        }
    }
}

impl RegisterFileDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, register: u8) -> u8 {
        self.registers[register as usize]
    }

    pub fn set(&mut self, register: u8, value: u8) {
        self.registers[register as usize] = value;
    }

    /// Store `bytes` starting at `register`.
    pub fn load(&mut self, register: u8, bytes: &[u8]) {
        for (offset, byte) in bytes.iter().enumerate() {
            self.registers[register.wrapping_add(offset as u8) as usize] = *byte;
        }
    }

    pub fn slice(&self, register: u8, length: usize) -> Vec<u8> {
        (0..length)
            .map(|offset| self.registers[register.wrapping_add(offset as u8) as usize])
            .collect()
    }

    /// Every (register, value) pair written by the bus, in order.
    pub fn writes(&self) -> &[(u8, u8)] {
        &self.writes
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }
}

impl SimI2cDevice for RegisterFileDevice {
    fn write(&mut self, data: &[u8]) -> hw_trait::Result<()> {
        let Some((&pointer, payload)) = data.split_first() else {
            return Ok(());
        };
        self.pointer = pointer;
        for byte in payload {
            self.registers[self.pointer as usize] = *byte;
            self.writes.push((self.pointer, *byte));
            self.pointer = self.pointer.wrapping_add(1);
        }
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> hw_trait::Result<()> {
        for byte in buffer.iter_mut() {
            *byte = self.registers[self.pointer as usize];
            self.pointer = self.pointer.wrapping_add(1);
        }
        Ok(())
    }
}

/// A device addressed by command code, each command holding a payload.
///
/// Writing `[command, payload...]` stores the payload; writing just
/// `[command]` selects it (or issues a send-byte command). Reads return the
/// selected command's payload, zero padded.
#[derive(Debug, Clone, Default)]
pub struct CommandDevice {
    payloads: HashMap<u8, Vec<u8>>,
    selected: Option<u8>,
    sent: Vec<(u8, Vec<u8>)>,
}

impl CommandDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, command: u8, payload: &[u8]) -> Self {
        self.set(command, payload);
        self
    }

    pub fn set(&mut self, command: u8, payload: &[u8]) {
        self.payloads.insert(command, payload.to_vec());
    }

    pub fn set_u16_be(&mut self, command: u8, value: u16) {
        self.set(command, &value.to_be_bytes());
    }

    pub fn set_u16_le(&mut self, command: u8, value: u16) {
        self.set(command, &value.to_le_bytes());
    }

    pub fn get(&self, command: u8) -> Option<&[u8]> {
        self.payloads.get(&command).map(Vec::as_slice)
    }

    /// Every write, as (command, payload); payload empty for send-byte.
    pub fn sent(&self) -> &[(u8, Vec<u8>)] {
        &self.sent
    }

    /// Whether `command` was ever written, with or without payload.
    pub fn was_sent(&self, command: u8) -> bool {
        self.sent.iter().any(|(c, _)| *c == command)
    }
}

impl SimI2cDevice for CommandDevice {
    fn write(&mut self, data: &[u8]) -> hw_trait::Result<()> {
        let Some((&command, payload)) = data.split_first() else {
            return Ok(());
        };
        self.selected = Some(command);
        self.sent.push((command, payload.to_vec()));
        if !payload.is_empty() {
            self.payloads.insert(command, payload.to_vec());
        }
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> hw_trait::Result<()> {
        buffer.fill(0);
        if let Some(payload) = self.selected.and_then(|c| self.payloads.get(&c)) {
            let n = payload.len().min(buffer.len());
            buffer[..n].copy_from_slice(&payload[..n]);
        }
        Ok(())
    }
}

/// Behaviour of one simulated SPI device.
pub trait SimSpiDevice: Send {
    /// Handle one chip-select framed transfer.
    fn transfer(&mut self, write: &[u8], read: &mut [u8]);
}

/// A simulated chip-selected SPI device handle. Clones share the device.
#[derive(Clone)]
pub struct SimSpi {
    device: Arc<Mutex<dyn SimSpiDevice>>,
    log: Arc<Mutex<Vec<Vec<u8>>>>,
    failing: Arc<AtomicBool>,
}

impl SimSpi {
    /// Wrap a device model, returning the bus handle and the shared model.
    pub fn new<D: SimSpiDevice + 'static>(device: D) -> (Self, Arc<Mutex<D>>) {
        let device = Arc::new(Mutex::new(device));
        let spi = Self {
            device: device.clone(),
            log: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(AtomicBool::new(false)),
        };
        (spi, device)
    }

    /// Make every transfer time out until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Every frame clocked out, in order.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl Spi for SimSpi {
    async fn write(&mut self, data: &[u8]) -> hw_trait::Result<()> {
        let mut discard = vec![0u8; data.len()];
        self.transfer(data, &mut discard).await
    }

    async fn transfer(&mut self, write: &[u8], read: &mut [u8]) -> hw_trait::Result<()> {
        if write.len() != read.len() {
            return Err(HwError::InvalidParameter(format!(
                "transfer length mismatch: write {} read {}",
                write.len(),
                read.len()
            )));
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(HwError::Timeout);
        }
        self.device.lock().transfer(write, read);
        self.log.lock().push(write.to_vec());
        Ok(())
    }
}

/// An SPI device that records frames and answers with zeros.
#[derive(Debug, Clone, Default)]
pub struct CaptureSpiDevice {
    pub frames: Vec<Vec<u8>>,
}

impl SimSpiDevice for CaptureSpiDevice {
    fn transfer(&mut self, write: &[u8], read: &mut [u8]) {
        self.frames.push(write.to_vec());
        read.fill(0);
    }
}

#[derive(Debug)]
struct PinState {
    value: PinValue,
    history: Vec<PinValue>,
    failing: bool,
}

/// A simulated digital pin usable as input or output. Clones share state.
#[derive(Debug, Clone)]
pub struct SimPin {
    state: Arc<Mutex<PinState>>,
}

impl Default for SimPin {
    fn default() -> Self {
        Self::new(PinValue::Low)
    }
}

impl SimPin {
    pub fn new(initial: PinValue) -> Self {
        Self {
            state: Arc::new(Mutex::new(PinState {
                value: initial,
                history: Vec::new(),
                failing: false,
            })),
        }
    }

    /// Drive the pin from outside, as a peripheral would drive an input.
    pub fn drive(&self, value: PinValue) {
        self.state.lock().value = value;
    }

    pub fn value(&self) -> PinValue {
        self.state.lock().value
    }

    /// Levels written through [`OutputPin`], in order.
    pub fn history(&self) -> Vec<PinValue> {
        self.state.lock().history.clone()
    }

    /// Make writes through [`OutputPin`] fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }
}

#[async_trait]
impl OutputPin for SimPin {
    async fn set(&mut self, value: PinValue) -> hw_trait::Result<()> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(HwError::Other("simulated pin write failure".into()));
        }
        state.value = value;
        state.history.push(value);
        Ok(())
    }

    fn state(&self) -> PinValue {
        self.value()
    }
}

#[async_trait]
impl InputPin for SimPin {
    async fn read(&mut self) -> hw_trait::Result<PinValue> {
        Ok(self.value())
    }
}

/// A simulated analog channel. Clones share the sampled voltage.
#[derive(Debug, Clone)]
pub struct SimAnalog {
    voltage: Arc<Mutex<VecDeque<Voltage>>>,
    reference: Voltage,
}

impl SimAnalog {
    pub fn new(reference: Voltage, initial: Voltage) -> Self {
        Self {
            voltage: Arc::new(Mutex::new(VecDeque::from([initial]))),
            reference,
        }
    }

    /// Set the voltage returned by every subsequent sample.
    pub fn set(&self, voltage: Voltage) {
        let mut queue = self.voltage.lock();
        queue.clear();
        queue.push_back(voltage);
    }

    /// Queue a sequence of samples; the last one repeats.
    pub fn queue(&self, samples: &[Voltage]) {
        self.voltage.lock().extend(samples.iter().copied());
    }
}

#[async_trait]
impl AnalogInput for SimAnalog {
    async fn read_voltage(&mut self) -> hw_trait::Result<Voltage> {
        let mut queue = self.voltage.lock();
        let sample = if queue.len() > 1 { queue.pop_front() } else { queue.front().copied() };
        sample.ok_or_else(|| HwError::Other("no analog sample".into()))
    }

    fn reference_voltage(&self) -> Voltage {
        self.reference
    }
}

#[derive(Debug, Clone, Copy)]
struct PwmState {
    frequency: Frequency,
    duty: f32,
    running: bool,
}

/// A simulated PWM output. Clones share state.
#[derive(Debug, Clone)]
pub struct SimPwm {
    state: Arc<Mutex<PwmState>>,
}

impl Default for SimPwm {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(PwmState {
                frequency: Frequency::from_hertz(1000.0),
                duty: 0.0,
                running: false,
            })),
        }
    }
}

impl SimPwm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

#[async_trait]
impl PwmOutput for SimPwm {
    async fn set_frequency(&mut self, frequency: Frequency) -> hw_trait::Result<()> {
        if frequency.hertz() <= 0.0 {
            return Err(HwError::InvalidParameter(format!("frequency {frequency}")));
        }
        self.state.lock().frequency = frequency;
        Ok(())
    }

    fn frequency(&self) -> Frequency {
        self.state.lock().frequency
    }

    async fn set_duty_cycle(&mut self, duty: f32) -> hw_trait::Result<()> {
        hw_trait::pwm::validate_duty(duty)?;
        self.state.lock().duty = duty;
        Ok(())
    }

    fn duty_cycle(&self) -> f32 {
        self.state.lock().duty
    }

    async fn start(&mut self) -> hw_trait::Result<()> {
        self.state.lock().running = true;
        Ok(())
    }

    async fn stop(&mut self) -> hw_trait::Result<()> {
        self.state.lock().running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_routes_by_address_and_logs() {
        let mut bus = SimI2cBus::new();
        let device = bus.attach(0x20, RegisterFileDevice::new());

        bus.write(0x20, &[0x0A, 0x55]).await.unwrap();
        let mut buffer = [0u8; 1];
        bus.write_read(0x20, &[0x0A], &mut buffer).await.unwrap();

        assert_eq!(buffer, [0x55]);
        assert_eq!(device.lock().get(0x0A), 0x55);
        assert_eq!(
            bus.transactions(),
            vec![
                I2cTransaction::Write { address: 0x20, data: vec![0x0A, 0x55] },
                I2cTransaction::WriteRead { address: 0x20, data: vec![0x0A], read: vec![0x55] },
            ]
        );
    }

    #[tokio::test]
    async fn test_absent_address_nacks() {
        let mut bus = SimI2cBus::new();
        let err = bus.write(0x33, &[0x00]).await.unwrap_err();
        assert!(matches!(err, HwError::Nack { address: 0x33 }));
        assert!(bus.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_register_file_auto_increments() {
        let mut bus = SimI2cBus::new();
        bus.attach(0x50, RegisterFileDevice::new());
        bus.write(0x50, &[0xFF, 1, 2]).await.unwrap();

        let mut buffer = [0u8; 2];
        bus.write_read(0x50, &[0xFF], &mut buffer).await.unwrap();
        assert_eq!(buffer, [1, 2]);
    }

    #[tokio::test]
    async fn test_command_device_selects_payload() {
        let mut bus = SimI2cBus::new();
        let device = bus.attach(0x24, CommandDevice::new().with(0x20, &[0x17]));

        let mut buffer = [0u8; 2];
        bus.write_read(0x24, &[0x20], &mut buffer).await.unwrap();
        assert_eq!(buffer, [0x17, 0x00]);

        bus.write(0x24, &[0x03]).await.unwrap();
        assert!(device.lock().was_sent(0x03));
    }

    #[tokio::test]
    async fn test_spi_rejects_mismatched_lengths() {
        let (mut spi, _) = SimSpi::new(CaptureSpiDevice::default());
        let mut read = [0u8; 1];
        assert!(spi.transfer(&[1, 2], &mut read).await.is_err());
        spi.write(&[1, 2]).await.unwrap();
        assert_eq!(spi.frames(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn test_pin_toggle_tracks_history() {
        let mut pin = SimPin::default();
        pin.toggle().await.unwrap();
        pin.toggle().await.unwrap();
        assert_eq!(pin.history(), vec![PinValue::High, PinValue::Low]);
    }

    #[tokio::test]
    async fn test_analog_queue_repeats_last_sample() {
        let mut adc = SimAnalog::new(Voltage::from_volts(3.3), Voltage::from_volts(0.5));
        adc.queue(&[Voltage::from_volts(0.6)]);
        assert_eq!(adc.read_voltage().await.unwrap(), Voltage::from_volts(0.5));
        assert_eq!(adc.read_voltage().await.unwrap(), Voltage::from_volts(0.6));
        assert_eq!(adc.read_voltage().await.unwrap(), Voltage::from_volts(0.6));
    }
}
