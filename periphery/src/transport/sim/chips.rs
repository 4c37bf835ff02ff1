//! Behavioural models of the supported chips.
//!
//! Chips with a plain auto-incrementing register map are presets of
//! [`RegisterFileDevice`]; the rest have their own models that compute
//! readings from physical quantities a test sets.

use std::collections::VecDeque;

use crate::hw_trait::{self, HwError};
use crate::peripheral::pmbus::{commands as pmbus, operation, Linear11};
use crate::peripheral::sht4x::{self, crc8};

use super::{CommandDevice, RegisterFileDevice, SimI2cDevice, SimSpiDevice};

fn invalid(what: impl Into<String>) -> HwError {
    HwError::InvalidParameter(what.into())
}

/// SHT4x: one-byte commands, CRC-protected two-word responses.
#[derive(Debug, Clone)]
pub struct Sht4xSim {
    temperature: f64,
    humidity: f64,
    serial: u32,
    corrupt_crc: bool,
    last_command: Option<u8>,
    pending: Option<[u16; 2]>,
}

impl Sht4xSim {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature,
            humidity,
            serial: 0x0F1E_2D3C,
            corrupt_crc: false,
            last_command: None,
            pending: None,
        }
    }

    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn set_conditions(&mut self, temperature: f64, humidity: f64) {
        self.temperature = temperature;
        self.humidity = humidity;
    }

    /// Send a wrong CRC on the first word of every response.
    pub fn corrupt_crc(&mut self, corrupt: bool) {
        self.corrupt_crc = corrupt;
    }

    pub fn last_command(&self) -> Option<u8> {
        self.last_command
    }

    fn ticks(&self) -> [u16; 2] {
        let t = ((self.temperature + 45.0) * 65535.0 / 175.0).round();
        let rh = ((self.humidity + 6.0) * 65535.0 / 125.0).round();
        [t.clamp(0.0, 65535.0) as u16, rh.clamp(0.0, 65535.0) as u16]
    }
}

impl SimI2cDevice for Sht4xSim {
    fn write(&mut self, data: &[u8]) -> hw_trait::Result<()> {
        let Some(&command) = data.first() else {
            return Ok(());
        };
        self.last_command = Some(command);
        self.pending = match command {
            sht4x::commands::MEASURE_HIGH
            | sht4x::commands::MEASURE_MEDIUM
            | sht4x::commands::MEASURE_LOW => Some(self.ticks()),
            sht4x::commands::READ_SERIAL => {
                Some([(self.serial >> 16) as u16, self.serial as u16])
            }
            sht4x::commands::SOFT_RESET => None,
            other => return Err(invalid(format!("SHT4x command 0x{other:02X}"))),
        };
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> hw_trait::Result<()> {
        // Reads with no result pending are not acknowledged.
        let words = self.pending.take().ok_or(HwError::Nack { address: 0 })?;
        let mut frame = Vec::with_capacity(6);
        for word in words {
            let bytes = word.to_be_bytes();
            frame.extend_from_slice(&bytes);
            frame.push(crc8(&bytes));
        }
        if self.corrupt_crc {
            frame[2] ^= 0xFF;
        }
        let n = buffer.len().min(frame.len());
        buffer[..n].copy_from_slice(&frame[..n]);
        Ok(())
    }
}

/// BH1750: opcode-driven, starts powered down, refuses measurements until
/// powered on.
#[derive(Debug, Clone)]
pub struct Bh1750Sim {
    lux: f64,
    powered: bool,
    mode: Option<u8>,
    measurement_time: u8,
}

impl Bh1750Sim {
    pub fn new(lux: f64) -> Self {
        Self {
            lux,
            powered: false,
            mode: None,
            measurement_time: 69,
        }
    }

    pub fn set_lux(&mut self, lux: f64) {
        self.lux = lux;
    }

    pub fn measurement_time(&self) -> u8 {
        self.measurement_time
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }
}

impl SimI2cDevice for Bh1750Sim {
    fn write(&mut self, data: &[u8]) -> hw_trait::Result<()> {
        let Some(&opcode) = data.first() else {
            return Ok(());
        };
        match opcode {
            0x00 => self.powered = false,
            0x01 => self.powered = true,
            0x07 if self.powered => {}
            0x40..=0x47 => {
                self.measurement_time = (self.measurement_time & 0x1F) | ((opcode & 0x07) << 5)
            }
            0x60..=0x7F => {
                self.measurement_time = (self.measurement_time & 0xE0) | (opcode & 0x1F)
            }
            0x10 | 0x11 | 0x13 | 0x20 | 0x21 | 0x23 if self.powered => self.mode = Some(opcode),
            other => return Err(invalid(format!("BH1750 opcode 0x{other:02X}"))),
        }
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> hw_trait::Result<()> {
        let Some(mode) = self.mode else {
            buffer.fill(0);
            return Ok(());
        };
        let mut raw = self.lux * 1.2 * self.measurement_time as f64 / 69.0;
        if mode & 0x03 == 0x01 {
            raw *= 2.0;
        }
        let bytes = (raw.round().clamp(0.0, 65535.0) as u16).to_be_bytes();
        let n = buffer.len().min(2);
        buffer[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }
}

/// INA219: 16-bit big-endian registers behind a pointer, with current and
/// power derived from the calibration register the way the chip does it.
#[derive(Debug, Clone)]
pub struct Ina219Sim {
    bus_voltage: f64,
    shunt_voltage: f64,
    config: u16,
    calibration: u16,
    pointer: u8,
}

impl Ina219Sim {
    pub fn new(bus_voltage: f64, shunt_voltage: f64) -> Self {
        Self {
            bus_voltage,
            shunt_voltage,
            config: 0x399F,
            calibration: 0,
            pointer: 0,
        }
    }

    pub fn set_voltages(&mut self, bus_voltage: f64, shunt_voltage: f64) {
        self.bus_voltage = bus_voltage;
        self.shunt_voltage = shunt_voltage;
    }

    pub fn calibration(&self) -> u16 {
        self.calibration
    }

    pub fn config(&self) -> u16 {
        self.config
    }

    fn shunt_raw(&self) -> i16 {
        (self.shunt_voltage / 10e-6)
            .round()
            .clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }

    fn bus_raw(&self) -> u16 {
        (self.bus_voltage / 4e-3).round().clamp(0.0, 8191.0) as u16
    }

    fn current_raw(&self) -> i16 {
        (self.shunt_raw() as i32 * self.calibration as i32 / 4096)
            .clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }

    fn register(&self, register: u8) -> u16 {
        match register {
            0 => self.config,
            1 => self.shunt_raw() as u16,
            2 => self.bus_raw() << 3 | 0x0002,
            3 => (self.current_raw().unsigned_abs() as u32 * self.bus_raw() as u32 / 5000) as u16,
            4 => self.current_raw() as u16,
            5 => self.calibration,
            _ => 0,
        }
    }
}

impl SimI2cDevice for Ina219Sim {
    fn write(&mut self, data: &[u8]) -> hw_trait::Result<()> {
        match *data {
            [pointer] if pointer <= 5 => self.pointer = pointer,
            [pointer, hi, lo] if pointer <= 5 => {
                self.pointer = pointer;
                let value = u16::from_be_bytes([hi, lo]);
                match pointer {
                    0 if value & 0x8000 != 0 => {
                        self.config = 0x399F;
                        self.calibration = 0;
                    }
                    0 => self.config = value,
                    5 => self.calibration = value,
                    _ => return Err(invalid(format!("INA219 register {pointer} is read-only"))),
                }
            }
            _ => return Err(invalid(format!("INA219 write {}", hex::encode(data)))),
        }
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> hw_trait::Result<()> {
        let bytes = self.register(self.pointer).to_be_bytes();
        let n = buffer.len().min(2);
        buffer[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }
}

/// TPS546 PMBus regulator. Telemetry commands hold fixed readings except
/// READ_VOUT, which follows VOUT_COMMAND while OPERATION is on.
#[derive(Debug, Clone)]
pub struct Tps546Sim {
    registers: CommandDevice,
}

/// VOUT_MODE for ULINEAR16 with exponent −9.
const TPS546_VOUT_MODE: u8 = 0x17;

impl Tps546Sim {
    pub fn new(vin: f32, vout: f32, iout: f32, temperature: f32) -> Self {
        let vout_command = (vout * 512.0).round() as u16;
        let mut registers = CommandDevice::new()
            .with(pmbus::IC_DEVICE_ID, &[6, 0x54, 0x49, 0x54, 0x6B, 0x24, 0x41])
            .with(pmbus::OPERATION, &[operation::ON])
            .with(pmbus::VOUT_MODE, &[TPS546_VOUT_MODE])
            .with(pmbus::STATUS_WORD, &[0, 0]);
        registers.set_u16_le(pmbus::VOUT_COMMAND, vout_command);
        registers.set_u16_le(pmbus::READ_VIN, Linear11::from_float(vin));
        registers.set_u16_le(pmbus::READ_IOUT, Linear11::from_float(iout));
        registers.set_u16_le(pmbus::READ_TEMPERATURE_1, Linear11::from_float(temperature));
        let mut sim = Self { registers };
        sim.update_vout();
        sim
    }

    pub fn registers(&self) -> &CommandDevice {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut CommandDevice {
        &mut self.registers
    }

    pub fn set_iout(&mut self, amps: f32) {
        self.registers
            .set_u16_le(pmbus::READ_IOUT, Linear11::from_float(amps));
    }

    pub fn set_temperature(&mut self, celsius: f32) {
        self.registers
            .set_u16_le(pmbus::READ_TEMPERATURE_1, Linear11::from_float(celsius));
    }

    pub fn output_on(&self) -> bool {
        self.registers
            .get(pmbus::OPERATION)
            .and_then(|op| op.first())
            .is_some_and(|op| op & operation::ON != 0)
    }

    fn update_vout(&mut self) {
        let command = match self.registers.get(pmbus::VOUT_COMMAND) {
            Some(&[lo, hi, ..]) if self.output_on() => u16::from_le_bytes([lo, hi]),
            _ => 0,
        };
        self.registers.set_u16_le(pmbus::READ_VOUT, command);
    }
}

impl SimI2cDevice for Tps546Sim {
    fn write(&mut self, data: &[u8]) -> hw_trait::Result<()> {
        self.registers.write(data)?;
        if data.first() == Some(&pmbus::CLEAR_FAULTS) {
            self.registers.set(pmbus::STATUS_WORD, &[0, 0]);
        }
        self.update_vout();
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> hw_trait::Result<()> {
        self.registers.read(buffer)
    }
}

/// SSD1306 controller: parses the command stream and stores display RAM
/// in horizontal addressing mode.
#[derive(Debug, Clone)]
pub struct Ssd1306Sim {
    ram: Vec<u8>,
    pages: u8,
    display_on: bool,
    inverted: bool,
    contrast: u8,
    multiplex: u8,
    columns: (u8, u8),
    page_window: (u8, u8),
    column: u8,
    page: u8,
    commands: Vec<u8>,
}

const SSD1306_WIDTH: usize = 128;

impl Ssd1306Sim {
    pub fn new(height: u32) -> Self {
        let pages = (height / 8) as u8;
        Self {
            ram: vec![0; SSD1306_WIDTH * pages as usize],
            pages,
            display_on: false,
            inverted: false,
            contrast: 0x7F,
            multiplex: 63,
            columns: (0, 127),
            page_window: (0, pages.saturating_sub(1)),
            column: 0,
            page: 0,
            commands: Vec::new(),
        }
    }

    pub fn pixel(&self, x: usize, y: usize) -> bool {
        self.ram
            .get((y / 8) * SSD1306_WIDTH + x)
            .is_some_and(|byte| byte & (1 << (y % 8)) != 0)
    }

    pub fn lit_pixels(&self) -> u32 {
        self.ram.iter().map(|b| b.count_ones()).sum()
    }

    pub fn display_on(&self) -> bool {
        self.display_on
    }

    pub fn inverted(&self) -> bool {
        self.inverted
    }

    pub fn contrast(&self) -> u8 {
        self.contrast
    }

    pub fn multiplex(&self) -> u8 {
        self.multiplex
    }

    /// Every command byte received, arguments included.
    pub fn commands(&self) -> &[u8] {
        &self.commands
    }

    fn argument_count(command: u8) -> usize {
        match command {
            0x81 | 0x20 | 0xA8 | 0xD3 | 0xD5 | 0xD9 | 0xDA | 0xDB | 0x8D => 1,
            0x21 | 0x22 => 2,
            _ => 0,
        }
    }

    fn run_commands(&mut self, stream: &[u8]) -> hw_trait::Result<()> {
        self.commands.extend_from_slice(stream);
        let mut rest = stream;
        while let Some((&command, tail)) = rest.split_first() {
            let count = Self::argument_count(command);
            if tail.len() < count {
                return Err(invalid(format!("SSD1306 command 0x{command:02X} truncated")));
            }
            let (args, tail) = tail.split_at(count);
            match (command, args) {
                (0x81, &[value]) => self.contrast = value,
                (0xA8, &[value]) => self.multiplex = value,
                (0xA6, _) => self.inverted = false,
                (0xA7, _) => self.inverted = true,
                (0xAE, _) => self.display_on = false,
                (0xAF, _) => self.display_on = true,
                (0x21, &[start, end]) => {
                    self.columns = (start, end);
                    self.column = start;
                }
                (0x22, &[start, end]) => {
                    self.page_window = (start, end.min(self.pages.saturating_sub(1)));
                    self.page = start;
                }
                _ => {}
            }
            rest = tail;
        }
        Ok(())
    }

    fn store(&mut self, data: &[u8]) {
        for &byte in data {
            let index = self.page as usize * SSD1306_WIDTH + self.column as usize;
            if let Some(cell) = self.ram.get_mut(index) {
                *cell = byte;
            }
            if self.column >= self.columns.1 {
                self.column = self.columns.0;
                self.page = if self.page >= self.page_window.1 {
                    self.page_window.0
                } else {
                    self.page + 1
                };
            } else {
                self.column += 1;
            }
        }
    }
}

impl SimI2cDevice for Ssd1306Sim {
    fn write(&mut self, data: &[u8]) -> hw_trait::Result<()> {
        match data.split_first() {
            Some((0x00, stream)) => self.run_commands(stream),
            Some((0x40, pixels)) => {
                self.store(pixels);
                Ok(())
            }
            Some((control, _)) => Err(invalid(format!("SSD1306 control byte 0x{control:02X}"))),
            None => Ok(()),
        }
    }

    fn read(&mut self, buffer: &mut [u8]) -> hw_trait::Result<()> {
        // Status byte: bit 6 set while the display is off.
        buffer.fill(0);
        if let Some(status) = buffer.first_mut() {
            *status = if self.display_on { 0x00 } else { 0x40 };
        }
        Ok(())
    }
}

/// nRF24L01+ register file and FIFOs. A transmission completes as soon as a
/// payload is written while powered up in TX mode; it is acknowledged while
/// the link is up and exhausts its retries otherwise.
#[derive(Debug, Clone)]
pub struct Nrf24Sim {
    registers: [u8; 0x20],
    addresses: [[u8; 5]; 3],
    flags: u8,
    tx_fifo: VecDeque<Vec<u8>>,
    rx_fifo: VecDeque<(u8, Vec<u8>)>,
    sent: Vec<Vec<u8>>,
    link: bool,
}

const NRF_FIFO_DEPTH: usize = 3;

impl Default for Nrf24Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl Nrf24Sim {
    pub fn new() -> Self {
        let mut registers = [0u8; 0x20];
        registers[0x00] = 0x08;
        registers[0x01] = 0x3F;
        registers[0x02] = 0x03;
        registers[0x03] = 0x03;
        registers[0x04] = 0x03;
        registers[0x05] = 0x02;
        registers[0x06] = 0x0E;
        registers[0x0C..=0x0F].copy_from_slice(&[0xC3, 0xC4, 0xC5, 0xC6]);
        Self {
            registers,
            addresses: [[0xE7; 5], [0xC2; 5], [0xE7; 5]],
            flags: 0,
            tx_fifo: VecDeque::new(),
            rx_fifo: VecDeque::new(),
            sent: Vec::new(),
            link: true,
        }
    }

    fn address_slot(register: u8) -> Option<usize> {
        match register {
            0x0A => Some(0),
            0x0B => Some(1),
            0x10 => Some(2),
            _ => None,
        }
    }

    pub fn register(&self, register: u8) -> u8 {
        match register {
            0x07 => self.status(),
            0x17 => self.fifo_status(),
            _ => self.registers[(register & 0x1F) as usize],
        }
    }

    /// Stored address bytes, LSB first as clocked in.
    pub fn address(&self, register: u8) -> Vec<u8> {
        Self::address_slot(register)
            .map(|slot| self.addresses[slot].to_vec())
            .unwrap_or_default()
    }

    /// Whether transmissions get acknowledged.
    pub fn set_link(&mut self, up: bool) {
        self.link = up;
    }

    /// Payloads acknowledged by the far end.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    pub fn tx_fifo_is_empty(&self) -> bool {
        self.tx_fifo.is_empty()
    }

    /// Deliver a payload as if received on `pipe`. A pipe only takes payloads
    /// of its RX_PW width, and a width of 0 leaves it unused. Returns whether
    /// the payload landed in the RX FIFO.
    pub fn inject_rx(&mut self, pipe: u8, payload: &[u8]) -> bool {
        let width = self.registers.get(0x11 + pipe as usize).copied().unwrap_or(0);
        if pipe > 5 || width == 0 || payload.len() != width as usize {
            return false;
        }
        if self.rx_fifo.len() >= NRF_FIFO_DEPTH {
            return false;
        }
        self.rx_fifo.push_back((pipe, payload.to_vec()));
        self.flags |= 0x40;
        true
    }

    fn status(&self) -> u8 {
        let pipe = self.rx_fifo.front().map_or(0x07, |(pipe, _)| *pipe);
        let tx_full = u8::from(self.tx_fifo.len() >= NRF_FIFO_DEPTH);
        self.flags | (pipe << 1) | tx_full
    }

    fn fifo_status(&self) -> u8 {
        let mut value = 0;
        if self.tx_fifo.len() >= NRF_FIFO_DEPTH {
            value |= 0x20;
        }
        if self.tx_fifo.is_empty() {
            value |= 0x10;
        }
        if self.rx_fifo.len() >= NRF_FIFO_DEPTH {
            value |= 0x02;
        }
        if self.rx_fifo.is_empty() {
            value |= 0x01;
        }
        value
    }

    fn write_register(&mut self, register: u8, data: &[u8]) {
        if let Some(slot) = Self::address_slot(register) {
            let n = data.len().min(5);
            self.addresses[slot][..n].copy_from_slice(&data[..n]);
            return;
        }
        let Some(&value) = data.first() else {
            return;
        };
        match register {
            0x07 => self.flags &= !(value & 0x70),
            0x08 | 0x09 | 0x17 => {}
            _ => self.registers[register as usize] = value,
        }
    }

    fn load_tx(&mut self, payload: &[u8]) {
        let config = self.registers[0x00];
        let transmitting = config & 0x02 != 0 && config & 0x01 == 0;
        if !transmitting {
            if self.tx_fifo.len() < NRF_FIFO_DEPTH {
                self.tx_fifo.push_back(payload.to_vec());
            }
            return;
        }
        if self.link {
            self.sent.push(payload.to_vec());
            self.flags |= 0x20;
        } else {
            self.tx_fifo.push_back(payload.to_vec());
            self.registers[0x08] = 0x1F;
            self.flags |= 0x10;
        }
    }
}

impl SimSpiDevice for Nrf24Sim {
    fn transfer(&mut self, write: &[u8], read: &mut [u8]) {
        read.fill(0);
        let Some((&command, data)) = write.split_first() else {
            return;
        };
        read[0] = self.status();
        let out = &mut read[1..];
        match command {
            0x00..=0x1F => {
                let register = command & 0x1F;
                match Self::address_slot(register) {
                    Some(slot) => {
                        let n = out.len().min(5);
                        out[..n].copy_from_slice(&self.addresses[slot][..n]);
                    }
                    None => {
                        if let Some(first) = out.first_mut() {
                            *first = self.register(register);
                        }
                    }
                }
            }
            0x20..=0x3F => self.write_register(command & 0x1F, data),
            0x60 => {
                if let Some(first) = out.first_mut() {
                    *first = self.rx_fifo.front().map_or(0, |(_, p)| p.len() as u8);
                }
            }
            0x61 => {
                if let Some((_, payload)) = self.rx_fifo.pop_front() {
                    let n = out.len().min(payload.len());
                    out[..n].copy_from_slice(&payload[..n]);
                }
            }
            0xA0 => self.load_tx(data),
            0xE1 => self.tx_fifo.clear(),
            0xE2 => self.rx_fifo.clear(),
            _ => {}
        }
    }
}

/// BME280 register map loaded with the datasheet's worked-example
/// calibration and raw sample (25.08 °C, 100653.27 Pa).
pub fn bme280_registers() -> RegisterFileDevice {
    let mut device = RegisterFileDevice::new();
    device.set(0xD0, 0x60);
    let words: [u16; 12] = [
        27504,
        26435,
        -1000i16 as u16,
        36477,
        -10685i16 as u16,
        3024,
        2855,
        140,
        -7i16 as u16,
        15500,
        -14600i16 as u16,
        6000,
    ];
    let calibration: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    device.load(0x88, &calibration);
    device.set(0xA1, 75);
    device.load(0xE1, &[0x6A, 0x01, 0x00, 0x13, 0x29, 0x03, 0x1E]);
    device.load(0xF7, &[0x65, 0x5A, 0xC0, 0x7E, 0xED, 0x00, 0x6A, 0x40]);
    device
}

/// DS3231 after first power-up: 2000-01-01 00:00:00, oscillator-stop flag
/// set, 25.25 °C.
pub fn ds3231_registers() -> RegisterFileDevice {
    let mut device = RegisterFileDevice::new();
    device.load(0x00, &[0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00]);
    device.set(0x0E, 0x1C);
    device.set(0x0F, 0x88);
    device.load(0x11, &[0x19, 0x40]);
    device
}

/// MCP23008 at power-on reset: every pin an input.
pub fn mcp23008_registers() -> RegisterFileDevice {
    let mut device = RegisterFileDevice::new();
    device.set(0x00, 0xFF);
    device
}

/// PCA9685 at power-on reset: asleep, all-call enabled, open outputs full off.
pub fn pca9685_registers() -> RegisterFileDevice {
    let mut device = RegisterFileDevice::new();
    device.set(0x00, 0x11);
    device.set(0x01, 0x04);
    for channel in 0..16u8 {
        device.set(0x06 + channel * 4 + 3, 0x10);
    }
    device.load(0xFA, &[0x00, 0x00, 0x00, 0x10]);
    device.set(0xFE, 0x1E);
    device
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw_trait::I2c;
    use crate::transport::sim::SimI2cBus;

    #[tokio::test]
    async fn test_ssd1306_window_wraps() {
        let mut bus = SimI2cBus::new();
        let sim = bus.attach(0x3C, Ssd1306Sim::new(32));
        bus.write(0x3C, &[0x00, 0x21, 10, 11, 0x22, 1, 2]).await.unwrap();
        bus.write(0x3C, &[0x40, 0x01, 0x02, 0x04, 0x08, 0x10]).await.unwrap();

        let sim = sim.lock();
        assert!(sim.pixel(11, 9));
        assert!(sim.pixel(10, 18));
        assert!(sim.pixel(11, 19));
        // Window wrapped back to page 1 and overwrote the first byte.
        assert!(sim.pixel(10, 12));
        assert!(!sim.pixel(10, 8));
        assert_eq!(sim.lit_pixels(), 4);
    }

    #[tokio::test]
    async fn test_ina219_reset_clears_calibration() {
        let mut bus = SimI2cBus::new();
        let sim = bus.attach(0x40, Ina219Sim::new(5.0, 0.01));
        bus.write(0x40, &[0x05, 0x10, 0x00]).await.unwrap();
        assert_eq!(sim.lock().calibration(), 0x1000);
        bus.write(0x40, &[0x00, 0x80, 0x00]).await.unwrap();
        assert_eq!(sim.lock().calibration(), 0);
        assert!(bus.write(0x40, &[0x02, 0, 0]).await.is_err());
    }

    #[tokio::test]
    async fn test_tps546_vout_follows_operation() {
        let mut bus = SimI2cBus::new();
        let sim = bus.attach(0x24, Tps546Sim::new(12.0, 1.0, 5.0, 40.0));
        assert_eq!(sim.lock().registers().get(pmbus::READ_VOUT), Some(&[0x00, 0x02][..]));
        bus.write(0x24, &[pmbus::OPERATION, 0x00]).await.unwrap();
        assert_eq!(sim.lock().registers().get(pmbus::READ_VOUT), Some(&[0, 0][..]));
    }
}
