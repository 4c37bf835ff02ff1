//! nRF24L01+ 2.4 GHz transceiver driver
//!
//! Every SPI transaction starts with a command byte, and the chip clocks
//! STATUS back while it is received. CE is a separate pin: held high to
//! listen, pulsed to transmit.
//!
//! Datasheet: <https://www.sparkfun.com/datasheets/Components/SMD/nRF24L01Pluss_Preliminary_Product_Specification_v1_0.pdf>

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::hw_trait::{OutputPin, Spi};
use crate::registry::{Category, DriverDescriptor, Interface};
use crate::sensor::Sensor;

inventory::submit! {
    DriverDescriptor {
        name: "nrf24l01",
        part: "nRF24L01+",
        category: Category::Radio,
        interface: Interface::Spi,
        addresses: &[],
        description: "2.4 GHz packet radio with auto-acknowledge",
    }
}

/// Register addresses
pub mod registers {
    pub const CONFIG: u8 = 0x00;
    pub const EN_AA: u8 = 0x01;
    pub const EN_RXADDR: u8 = 0x02;
    pub const SETUP_AW: u8 = 0x03;
    pub const SETUP_RETR: u8 = 0x04;
    pub const RF_CH: u8 = 0x05;
    pub const RF_SETUP: u8 = 0x06;
    pub const STATUS: u8 = 0x07;
    pub const OBSERVE_TX: u8 = 0x08;
    pub const RX_ADDR_P0: u8 = 0x0A;
    pub const RX_ADDR_P1: u8 = 0x0B;
    pub const TX_ADDR: u8 = 0x10;
    pub const RX_PW_P0: u8 = 0x11;
    pub const FIFO_STATUS: u8 = 0x17;
    pub const DYNPD: u8 = 0x1C;
    pub const FEATURE: u8 = 0x1D;
}

/// SPI command bytes
pub mod commands {
    pub const R_REGISTER: u8 = 0x00;
    pub const W_REGISTER: u8 = 0x20;
    pub const R_RX_PL_WID: u8 = 0x60;
    pub const R_RX_PAYLOAD: u8 = 0x61;
    pub const W_TX_PAYLOAD: u8 = 0xA0;
    pub const FLUSH_TX: u8 = 0xE1;
    pub const FLUSH_RX: u8 = 0xE2;
    pub const NOP: u8 = 0xFF;
}

pub mod config {
    pub const MASK_RX_DR: u8 = 0x40;
    pub const MASK_TX_DS: u8 = 0x20;
    pub const MASK_MAX_RT: u8 = 0x10;
    pub const EN_CRC: u8 = 0x08;
    pub const CRCO: u8 = 0x04;
    pub const PWR_UP: u8 = 0x02;
    pub const PRIM_RX: u8 = 0x01;
}

pub mod status {
    pub const RX_DR: u8 = 0x40;
    pub const TX_DS: u8 = 0x20;
    pub const MAX_RT: u8 = 0x10;
    pub const TX_FULL: u8 = 0x01;
}

pub mod fifo {
    pub const TX_FULL: u8 = 0x20;
    pub const TX_EMPTY: u8 = 0x10;
    pub const RX_FULL: u8 = 0x02;
    pub const RX_EMPTY: u8 = 0x01;
}

pub const MAX_CHANNEL: u8 = 125;
pub const MAX_PAYLOAD: usize = 32;
const RF_DR_LOW: u8 = 0x20;
const RF_DR_HIGH: u8 = 0x08;
const RF_PWR_MASK: u8 = 0x06;
/// RX_P_NO value meaning the RX FIFO is empty.
const RX_PIPE_EMPTY: u8 = 0x07;
/// Polls of STATUS while waiting for a transmission to resolve.
const TX_POLLS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DataRate {
    Kbps250,
    #[default]
    Mbps1,
    Mbps2,
}

impl DataRate {
    fn bits(self) -> u8 {
        match self {
            DataRate::Kbps250 => RF_DR_LOW,
            DataRate::Mbps1 => 0,
            DataRate::Mbps2 => RF_DR_HIGH,
        }
    }
}

/// Output power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PowerLevel {
    /// −18 dBm
    Min,
    /// −12 dBm
    Low,
    /// −6 dBm
    High,
    /// 0 dBm
    #[default]
    Max,
}

impl PowerLevel {
    fn bits(self) -> u8 {
        match self {
            PowerLevel::Min => 0b000,
            PowerLevel::Low => 0b010,
            PowerLevel::High => 0b100,
            PowerLevel::Max => 0b110,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Nrf24Error {
    #[error("Channel {0} above {MAX_CHANNEL}")]
    InvalidChannel(u8),
    #[error("Address width {0} outside 3..=5")]
    InvalidAddressWidth(usize),
    #[error("Payload of {0} bytes outside 1..={MAX_PAYLOAD}")]
    InvalidPayload(usize),
    #[error("Pipe {0} outside 0..=5")]
    InvalidPipe(u8),
    #[error("No acknowledgement after maximum retries")]
    MaxRetries,
    #[error("Transmission did not complete")]
    TxTimeout,
    #[error("Chip not responding (SETUP_AW read back 0x{0:02X})")]
    NotResponding(u8),
}

/// Decoded STATUS register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Status {
    pub raw: u8,
    pub rx_ready: bool,
    pub tx_sent: bool,
    pub max_retries: bool,
    /// Pipe of the payload at the head of the RX FIFO.
    pub rx_pipe: Option<u8>,
    pub tx_full: bool,
}

impl Status {
    pub fn decode(raw: u8) -> Self {
        let pipe = (raw >> 1) & 0x07;
        Self {
            raw,
            rx_ready: raw & status::RX_DR != 0,
            tx_sent: raw & status::TX_DS != 0,
            max_retries: raw & status::MAX_RT != 0,
            rx_pipe: (pipe < 6).then_some(pipe),
            tx_full: raw & status::TX_FULL != 0,
        }
    }
}

/// A received payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Packet {
    pub pipe: u8,
    pub data: Vec<u8>,
}

/// What a listening radio has heard so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RadioReading {
    pub received: u64,
    pub last: Option<Packet>,
}

pub struct Nrf24l01<SPI, CE> {
    spi: SPI,
    ce: CE,
    payload_width: usize,
    address_width: usize,
    config: u8,
    heard: RadioReading,
}

impl<SPI: Spi, CE: OutputPin> Nrf24l01<SPI, CE> {
    pub fn new(spi: SPI, ce: CE) -> Self {
        Self {
            spi,
            ce,
            payload_width: MAX_PAYLOAD,
            address_width: 5,
            config: config::EN_CRC,
            heard: RadioReading::default(),
        }
    }

    async fn command(&mut self, command: u8, data: &[u8]) -> Result<(Status, Vec<u8>)> {
        let mut write = Vec::with_capacity(data.len() + 1);
        write.push(command);
        write.extend_from_slice(data);
        let mut read = vec![0u8; write.len()];
        self.spi.transfer(&write, &mut read).await?;
        let status = Status::decode(read[0]);
        Ok((status, read.split_off(1)))
    }

    pub async fn read_register(&mut self, register: u8) -> Result<u8> {
        let (_, data) = self
            .command(commands::R_REGISTER | register, &[commands::NOP])
            .await?;
        Ok(data[0])
    }

    pub async fn write_register(&mut self, register: u8, value: u8) -> Result<()> {
        trace!(register, value, "nRF24 register write");
        self.command(commands::W_REGISTER | register, &[value]).await?;
        Ok(())
    }

    async fn read_address(&mut self, register: u8) -> Result<Vec<u8>> {
        let filler = vec![commands::NOP; self.address_width];
        let (_, data) = self.command(commands::R_REGISTER | register, &filler).await?;
        Ok(data)
    }

    async fn write_address(&mut self, register: u8, address: &[u8]) -> Result<()> {
        if address.len() != self.address_width {
            bail!(Nrf24Error::InvalidAddressWidth(address.len()));
        }
        // Addresses go LSB first.
        let lsb_first: Vec<u8> = address.iter().rev().copied().collect();
        self.command(commands::W_REGISTER | register, &lsb_first).await?;
        Ok(())
    }

    pub async fn status(&mut self) -> Result<Status> {
        Ok(self.command(commands::NOP, &[]).await?.0)
    }

    /// Power up in standby with 2-byte CRC, 1 Mbps, full power, 5-byte
    /// addresses, 32-byte payloads on every pipe, 1500 µs × 15 retries, and
    /// empty FIFOs.
    pub async fn init(&mut self) -> Result<()> {
        self.ce.set_low().await?;
        self.write_register(registers::SETUP_AW, 0b11).await?;
        let readback = self.read_register(registers::SETUP_AW).await?;
        if readback != 0b11 {
            bail!(Nrf24Error::NotResponding(readback));
        }
        self.address_width = 5;
        self.set_retries(5, 15).await?;
        self.write_register(
            registers::RF_SETUP,
            DataRate::default().bits() | PowerLevel::default().bits(),
        )
        .await?;
        self.write_register(registers::DYNPD, 0).await?;
        self.write_register(registers::FEATURE, 0).await?;
        // RX_PW_Pn resets to 0, which leaves the pipe unused.
        self.set_payload_width(MAX_PAYLOAD).await?;
        self.flush_tx().await?;
        self.flush_rx().await?;
        self.clear_interrupts().await?;

        self.config = config::EN_CRC | config::CRCO | config::PWR_UP;
        self.write_register(registers::CONFIG, self.config).await?;
        // Power-up to standby.
        tokio::time::sleep(Duration::from_millis(5)).await;
        debug!("nRF24L01 initialized");
        Ok(())
    }

    pub async fn set_channel(&mut self, channel: u8) -> Result<()> {
        if channel > MAX_CHANNEL {
            bail!(Nrf24Error::InvalidChannel(channel));
        }
        self.write_register(registers::RF_CH, channel).await
    }

    pub async fn channel(&mut self) -> Result<u8> {
        self.read_register(registers::RF_CH).await
    }

    async fn update_rf_setup(&mut self, mask: u8, bits: u8) -> Result<()> {
        let current = self.read_register(registers::RF_SETUP).await?;
        self.write_register(registers::RF_SETUP, (current & !mask) | bits)
            .await
    }

    pub async fn set_data_rate(&mut self, rate: DataRate) -> Result<()> {
        self.update_rf_setup(RF_DR_LOW | RF_DR_HIGH, rate.bits()).await
    }

    pub async fn set_power_level(&mut self, level: PowerLevel) -> Result<()> {
        self.update_rf_setup(RF_PWR_MASK, level.bits()).await
    }

    pub async fn set_address_width(&mut self, width: usize) -> Result<()> {
        if !(3..=5).contains(&width) {
            bail!(Nrf24Error::InvalidAddressWidth(width));
        }
        self.write_register(registers::SETUP_AW, (width - 2) as u8)
            .await?;
        self.address_width = width;
        Ok(())
    }

    /// `delay_steps` × 250 µs + 250 µs between up to `count` retries.
    pub async fn set_retries(&mut self, delay_steps: u8, count: u8) -> Result<()> {
        self.write_register(
            registers::SETUP_RETR,
            (delay_steps.min(15) << 4) | count.min(15),
        )
        .await
    }

    pub async fn set_auto_ack(&mut self, enabled: bool) -> Result<()> {
        self.write_register(registers::EN_AA, if enabled { 0x3F } else { 0x00 })
            .await
    }

    /// Static payload width for every pipe.
    pub async fn set_payload_width(&mut self, width: usize) -> Result<()> {
        if !(1..=MAX_PAYLOAD).contains(&width) {
            bail!(Nrf24Error::InvalidPayload(width));
        }
        for pipe in 0..6 {
            self.write_register(registers::RX_PW_P0 + pipe, width as u8)
                .await?;
        }
        self.payload_width = width;
        Ok(())
    }

    /// Destination address. Pipe 0 receives on it too, for the auto-ack.
    pub async fn set_tx_address(&mut self, address: &[u8]) -> Result<()> {
        self.write_address(registers::TX_ADDR, address).await?;
        self.write_address(registers::RX_ADDR_P0, address).await
    }

    pub async fn tx_address(&mut self) -> Result<Vec<u8>> {
        let mut address = self.read_address(registers::TX_ADDR).await?;
        address.reverse();
        Ok(address)
    }

    /// Receive on `pipe`. Pipes 2 to 5 share the upper bytes of pipe 1 and
    /// only take the last byte of `address`.
    pub async fn open_reading_pipe(&mut self, pipe: u8, address: &[u8]) -> Result<()> {
        match pipe {
            0 | 1 => {
                self.write_address(registers::RX_ADDR_P0 + pipe, address)
                    .await?
            }
            2..=5 => {
                let Some(&last) = address.last() else {
                    bail!(Nrf24Error::InvalidAddressWidth(0));
                };
                self.write_register(registers::RX_ADDR_P0 + pipe, last)
                    .await?
            }
            _ => bail!(Nrf24Error::InvalidPipe(pipe)),
        }
        let enabled = self.read_register(registers::EN_RXADDR).await?;
        self.write_register(registers::EN_RXADDR, enabled | (1 << pipe))
            .await
    }

    pub async fn clear_interrupts(&mut self) -> Result<()> {
        self.write_register(
            registers::STATUS,
            status::RX_DR | status::TX_DS | status::MAX_RT,
        )
        .await
    }

    pub async fn flush_tx(&mut self) -> Result<()> {
        self.command(commands::FLUSH_TX, &[]).await?;
        Ok(())
    }

    pub async fn flush_rx(&mut self) -> Result<()> {
        self.command(commands::FLUSH_RX, &[]).await?;
        Ok(())
    }

    /// Send one payload, padded to the static width, and wait for the
    /// acknowledgement or retry exhaustion.
    pub async fn transmit(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || payload.len() > self.payload_width {
            bail!(Nrf24Error::InvalidPayload(payload.len()));
        }
        self.ce.set_low().await?;
        self.config &= !config::PRIM_RX;
        self.write_register(registers::CONFIG, self.config).await?;
        self.clear_interrupts().await?;

        let mut padded = payload.to_vec();
        padded.resize(self.payload_width, 0);
        self.command(commands::W_TX_PAYLOAD, &padded).await?;

        // CE high for at least 10 µs starts the transmission.
        self.ce.set_high().await?;
        tokio::time::sleep(Duration::from_micros(15)).await;
        self.ce.set_low().await?;

        for _ in 0..TX_POLLS {
            let status = self.status().await?;
            if status.tx_sent {
                self.clear_interrupts().await?;
                trace!(bytes = payload.len(), "nRF24 payload sent");
                return Ok(());
            }
            if status.max_retries {
                let observe = self.read_register(registers::OBSERVE_TX).await?;
                warn!(lost = observe >> 4, retries = observe & 0x0F, "nRF24 transmit failed");
                self.flush_tx().await?;
                self.clear_interrupts().await?;
                bail!(Nrf24Error::MaxRetries);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        self.flush_tx().await?;
        bail!(Nrf24Error::TxTimeout)
    }

    /// Enter RX mode and hold CE high.
    pub async fn start_listening(&mut self) -> Result<()> {
        self.config |= config::PRIM_RX;
        self.write_register(registers::CONFIG, self.config).await?;
        self.clear_interrupts().await?;
        self.ce.set_high().await?;
        // RX settling.
        tokio::time::sleep(Duration::from_micros(130)).await;
        Ok(())
    }

    pub async fn stop_listening(&mut self) -> Result<()> {
        self.ce.set_low().await?;
        self.config &= !config::PRIM_RX;
        self.write_register(registers::CONFIG, self.config).await
    }

    pub fn is_listening(&self) -> bool {
        self.config & config::PRIM_RX != 0
    }

    /// Pipe of the next waiting payload, if any.
    pub async fn available(&mut self) -> Result<Option<u8>> {
        let fifo_status = self.read_register(registers::FIFO_STATUS).await?;
        if fifo_status & fifo::RX_EMPTY != 0 {
            return Ok(None);
        }
        let status = self.status().await?;
        Ok(status.rx_pipe.or(Some(0)))
    }

    /// Pop the next payload from the RX FIFO.
    pub async fn receive(&mut self) -> Result<Option<Packet>> {
        let Some(pipe) = self.available().await? else {
            return Ok(None);
        };
        let filler = vec![commands::NOP; self.payload_width];
        let (_, data) = self.command(commands::R_RX_PAYLOAD, &filler).await?;
        self.write_register(registers::STATUS, status::RX_DR).await?;
        trace!(pipe, bytes = data.len(), "nRF24 payload received");
        Ok(Some(Packet { pipe, data }))
    }

    /// Width of the payload at the head of the RX FIFO, for dynamic payloads.
    pub async fn rx_payload_width(&mut self) -> Result<u8> {
        let (_, data) = self
            .command(commands::R_RX_PL_WID, &[commands::NOP])
            .await?;
        Ok(data[0])
    }

    pub async fn power_down(&mut self) -> Result<()> {
        self.ce.set_low().await?;
        self.config &= !config::PWR_UP;
        self.write_register(registers::CONFIG, self.config).await
    }

    /// Masks the IRQ pin for the given events.
    pub async fn mask_interrupts(&mut self, rx: bool, tx: bool, max_rt: bool) -> Result<()> {
        let mut mask = 0;
        if rx {
            mask |= config::MASK_RX_DR;
        }
        if tx {
            mask |= config::MASK_TX_DS;
        }
        if max_rt {
            mask |= config::MASK_MAX_RT;
        }
        self.config = (self.config & !(config::MASK_RX_DR | config::MASK_TX_DS | config::MASK_MAX_RT)) | mask;
        self.write_register(registers::CONFIG, self.config).await
    }
}

/// Sampling drains the RX FIFO, keeping a count and the newest packet.
#[async_trait]
impl<SPI, CE> Sensor for Nrf24l01<SPI, CE>
where
    SPI: Spi + 'static,
    CE: OutputPin + 'static,
{
    type Reading = RadioReading;

    fn name(&self) -> &'static str {
        "nrf24l01"
    }

    async fn read(&mut self) -> Result<RadioReading> {
        if !self.is_listening() {
            bail!("radio is not listening");
        }
        while let Some(packet) = self.receive().await? {
            self.heard.received += 1;
            self.heard.last = Some(packet);
        }
        Ok(self.heard.clone())
    }
}
