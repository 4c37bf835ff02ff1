//! PCA9685 16-channel 12-bit PWM controller driver
//!
//! All channels share one frequency set by the prescaler. Each channel has
//! an on tick and an off tick within the 4096-tick period, plus full-on and
//! full-off override bits.
//!
//! Datasheet: <https://www.nxp.com/docs/en/data-sheet/PCA9685.pdf>

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::to_hw_error;
use crate::actuator::Actuator;
use crate::comms::I2cRegisters;
use crate::hw_trait::{self, I2c, PwmOutput};
use crate::registry::{Category, DriverDescriptor, Interface};
use crate::units::{Angle, Frequency};

pub const DEFAULT_ADDRESS: u8 = 0x40;
pub const CHANNELS: u8 = 16;
pub const TICKS: u16 = 4096;
/// Internal oscillator frequency.
pub const OSCILLATOR_HZ: f64 = 25_000_000.0;
pub const MIN_FREQUENCY_HZ: f64 = 24.0;
pub const MAX_FREQUENCY_HZ: f64 = 1526.0;

inventory::submit! {
    DriverDescriptor {
        name: "pca9685",
        part: "PCA9685",
        category: Category::Motor,
        interface: Interface::I2c,
        addresses: &[
            0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47,
            0x48, 0x49, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F,
            0x50, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57,
            0x58, 0x59, 0x5A, 0x5B, 0x5C, 0x5D, 0x5E, 0x5F,
            0x60, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67,
            0x68, 0x69, 0x6A, 0x6B, 0x6C, 0x6D, 0x6E, 0x6F,
            0x70, 0x71, 0x72, 0x73, 0x74, 0x75, 0x76, 0x77,
        ],
        description: "16-channel PWM controller for servos, LEDs and motor drivers",
    }
}

/// Register addresses
pub mod registers {
    pub const MODE1: u8 = 0x00;
    pub const MODE2: u8 = 0x01;
    pub const LED0_ON_L: u8 = 0x06;
    pub const ALL_LED_ON_L: u8 = 0xFA;
    pub const PRE_SCALE: u8 = 0xFE;
}

pub mod mode1 {
    pub const RESTART: u8 = 0x80;
    pub const AI: u8 = 0x20;
    pub const SLEEP: u8 = 0x10;
    pub const ALLCALL: u8 = 0x01;
}

pub mod mode2 {
    pub const INVRT: u8 = 0x10;
    pub const OUTDRV: u8 = 0x04;
}

/// Bit 4 of the high byte: full on (ON_H) or full off (OFF_H).
const FULL: u16 = 0x1000;

#[derive(Error, Debug, PartialEq)]
pub enum Pca9685Error {
    #[error("Channel {0} out of range 0..16")]
    InvalidChannel(u8),
    #[error("Frequency {0} Hz outside 24..=1526 Hz")]
    InvalidFrequency(f64),
    #[error("Tick {0:#06x} is neither 0..4096 nor the full bit")]
    InvalidTick(u16),
}

/// Prescaler for `hz`: round(osc / (4096 × hz)) − 1.
pub fn prescale_for(hz: f64) -> Result<u8> {
    if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
        bail!(Pca9685Error::InvalidFrequency(hz));
    }
    let prescale = (OSCILLATOR_HZ / (TICKS as f64 * hz)).round() - 1.0;
    Ok(prescale.clamp(3.0, 255.0) as u8)
}

/// Frequency actually produced by `prescale`.
pub fn frequency_for(prescale: u8) -> Frequency {
    Frequency::from_hertz(OSCILLATOR_HZ / (TICKS as f64 * (prescale as f64 + 1.0)))
}

/// Tick pair for a duty cycle. Duties that round to 0 or to a whole period
/// use the full-off/full-on bits.
pub fn duty_to_ticks(duty: f32) -> (u16, u16) {
    let off = (duty.clamp(0.0, 1.0) * TICKS as f32).round() as u16;
    if off == 0 {
        (0, FULL)
    } else if off >= TICKS {
        (FULL, 0)
    } else {
        (0, off)
    }
}

/// A tick register holds either a 12-bit count or the bare full bit.
fn valid_tick(tick: u16) -> bool {
    tick < TICKS || tick == FULL
}

fn ticks_to_duty(on: u16, off: u16) -> f32 {
    if off & FULL != 0 {
        0.0
    } else if on & FULL != 0 {
        1.0
    } else {
        (off.wrapping_sub(on) % TICKS) as f32 / TICKS as f32
    }
}

fn check_channel(channel: u8) -> Result<()> {
    if channel >= CHANNELS {
        bail!(Pca9685Error::InvalidChannel(channel));
    }
    Ok(())
}

pub struct Pca9685<I2C> {
    regs: I2cRegisters<I2C>,
    prescale: u8,
}

impl<I2C: I2c> Pca9685<I2C> {
    pub fn new(i2c: I2C, address: u8) -> Self {
        Self {
            regs: I2cRegisters::new(i2c, address),
            // Power-on prescale gives ~200 Hz.
            prescale: 0x1E,
        }
    }

    /// Reset MODE registers, enable auto-increment and totem-pole outputs,
    /// turn every channel off and set `frequency`.
    pub async fn init(&mut self, frequency: Frequency) -> Result<()> {
        self.regs
            .write_u8(registers::MODE1, mode1::AI | mode1::ALLCALL)
            .await?;
        self.regs.write_u8(registers::MODE2, mode2::OUTDRV).await?;
        self.all_off().await?;
        self.set_frequency(frequency).await?;
        debug!(address = self.regs.address(), %frequency, "PCA9685 initialized");
        Ok(())
    }

    /// The prescaler can only be written while asleep.
    pub async fn set_frequency(&mut self, frequency: Frequency) -> Result<()> {
        let prescale = prescale_for(frequency.hertz())?;
        let mode = self.regs.read_u8(registers::MODE1).await?;
        self.regs
            .write_u8(registers::MODE1, (mode & !mode1::RESTART) | mode1::SLEEP)
            .await?;
        self.regs.write_u8(registers::PRE_SCALE, prescale).await?;
        self.regs.write_u8(registers::MODE1, mode & !mode1::SLEEP).await?;
        // Oscillator settles within 500 µs.
        tokio::time::sleep(Duration::from_micros(500)).await;
        if mode & mode1::RESTART != 0 {
            self.regs.write_u8(registers::MODE1, mode | mode1::RESTART).await?;
        }
        self.prescale = prescale;
        trace!(prescale, "PCA9685 prescale set");
        Ok(())
    }

    pub fn frequency(&self) -> Frequency {
        frequency_for(self.prescale)
    }

    /// Length of one PWM period.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frequency().hertz())
    }

    pub async fn set_ticks(&mut self, channel: u8, on: u16, off: u16) -> Result<()> {
        check_channel(channel)?;
        for tick in [on, off] {
            if !valid_tick(tick) {
                bail!(Pca9685Error::InvalidTick(tick));
            }
        }
        let [on_l, on_h] = on.to_le_bytes();
        let [off_l, off_h] = off.to_le_bytes();
        self.regs
            .write_block(registers::LED0_ON_L + 4 * channel, &[on_l, on_h, off_l, off_h])
            .await
    }

    pub async fn ticks(&mut self, channel: u8) -> Result<(u16, u16)> {
        check_channel(channel)?;
        let raw = self.regs.read_block(registers::LED0_ON_L + 4 * channel, 4).await?;
        Ok((
            u16::from_le_bytes([raw[0], raw[1]]),
            u16::from_le_bytes([raw[2], raw[3]]),
        ))
    }

    pub async fn set_duty(&mut self, channel: u8, duty: f32) -> Result<()> {
        hw_trait::pwm::validate_duty(duty)?;
        let (on, off) = duty_to_ticks(duty);
        self.set_ticks(channel, on, off).await
    }

    pub async fn duty(&mut self, channel: u8) -> Result<f32> {
        let (on, off) = self.ticks(channel).await?;
        Ok(ticks_to_duty(on, off))
    }

    pub async fn set_full_on(&mut self, channel: u8) -> Result<()> {
        self.set_ticks(channel, FULL, 0).await
    }

    pub async fn set_full_off(&mut self, channel: u8) -> Result<()> {
        self.set_ticks(channel, 0, FULL).await
    }

    /// Pulse width, for servos and ESCs.
    pub async fn set_pulse_width(&mut self, channel: u8, width: Duration) -> Result<()> {
        let ticks = width.as_secs_f64() / self.period().as_secs_f64() * TICKS as f64;
        let off = ticks.round().clamp(0.0, (TICKS - 1) as f64) as u16;
        self.set_ticks(channel, 0, off).await
    }

    pub async fn all_off(&mut self) -> Result<()> {
        self.regs
            .write_block(registers::ALL_LED_ON_L, &[0, 0, 0, (FULL >> 8) as u8])
            .await
    }

    /// Stop the oscillator. Outputs hold off.
    pub async fn sleep(&mut self) -> Result<()> {
        self.regs
            .update_u8(registers::MODE1, mode1::SLEEP, mode1::SLEEP)
            .await?;
        Ok(())
    }

    /// Restart the oscillator and resume the previous outputs.
    pub async fn wake(&mut self) -> Result<()> {
        let mode = self.regs.update_u8(registers::MODE1, mode1::SLEEP, 0).await?;
        tokio::time::sleep(Duration::from_micros(500)).await;
        if mode & mode1::RESTART != 0 {
            self.regs.write_u8(registers::MODE1, mode | mode1::RESTART).await?;
        }
        Ok(())
    }

    pub async fn set_inverted(&mut self, inverted: bool) -> Result<()> {
        let value = if inverted { mode2::INVRT } else { 0 };
        self.regs
            .update_u8(registers::MODE2, mode2::INVRT, value)
            .await?;
        Ok(())
    }

    pub fn into_shared(self) -> SharedPca9685<I2C> {
        Arc::new(Mutex::new(self))
    }
}

pub type SharedPca9685<I2C> = Arc<Mutex<Pca9685<I2C>>>;

/// One channel of a shared controller, usable as a PWM port.
pub struct PwmChannel<I2C> {
    controller: SharedPca9685<I2C>,
    channel: u8,
    duty: f32,
    frequency: Frequency,
    running: bool,
}

impl<I2C: I2c> PwmChannel<I2C> {
    pub async fn new(controller: SharedPca9685<I2C>, channel: u8) -> Result<Self> {
        check_channel(channel)?;
        let frequency = controller.lock().await.frequency();
        Ok(Self {
            controller,
            channel,
            duty: 0.0,
            frequency,
            running: false,
        })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    async fn apply_duty(&mut self) -> Result<()> {
        let duty = if self.running { self.duty } else { 0.0 };
        self.controller.lock().await.set_duty(self.channel, duty).await
    }
}

#[async_trait]
impl<I2C: I2c + 'static> PwmOutput for PwmChannel<I2C> {
    /// Changes the frequency of every channel on the controller.
    async fn set_frequency(&mut self, frequency: Frequency) -> hw_trait::Result<()> {
        let mut controller = self.controller.lock().await;
        controller
            .set_frequency(frequency)
            .await
            .map_err(to_hw_error)?;
        self.frequency = controller.frequency();
        Ok(())
    }

    fn frequency(&self) -> Frequency {
        self.frequency
    }

    async fn set_duty_cycle(&mut self, duty: f32) -> hw_trait::Result<()> {
        hw_trait::pwm::validate_duty(duty)?;
        self.duty = duty;
        if self.running {
            self.apply_duty().await.map_err(to_hw_error)?;
        }
        Ok(())
    }

    fn duty_cycle(&self) -> f32 {
        self.duty
    }

    async fn start(&mut self) -> hw_trait::Result<()> {
        self.running = true;
        self.apply_duty().await.map_err(to_hw_error)
    }

    async fn stop(&mut self) -> hw_trait::Result<()> {
        self.running = false;
        self.apply_duty().await.map_err(to_hw_error)
    }
}

#[async_trait]
impl<I2C: I2c + 'static> Actuator for PwmChannel<I2C> {
    fn name(&self) -> &'static str {
        "pca9685"
    }

    fn unit(&self) -> &'static str {
        "duty"
    }

    fn range(&self) -> RangeInclusive<f32> {
        0.0..=1.0
    }

    async fn apply(&mut self, value: f32) -> Result<f32> {
        self.running = true;
        self.set_duty_cycle(value).await?;
        self.controller.lock().await.duty(self.channel).await
    }
}

/// Pulse limits of a hobby servo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoLimits {
    pub min_pulse: Duration,
    pub max_pulse: Duration,
    pub max_angle: Angle,
}

impl Default for ServoLimits {
    fn default() -> Self {
        Self {
            min_pulse: Duration::from_micros(500),
            max_pulse: Duration::from_micros(2500),
            max_angle: Angle::from_degrees(180.0),
        }
    }
}

impl ServoLimits {
    pub fn pulse_for(&self, angle: Angle) -> Duration {
        let fraction = (angle.degrees() / self.max_angle.degrees()).clamp(0.0, 1.0);
        let span = self.max_pulse.as_secs_f64() - self.min_pulse.as_secs_f64();
        Duration::from_secs_f64(self.min_pulse.as_secs_f64() + span * fraction)
    }
}

/// A servo on one controller channel. The controller should run at 50 Hz.
pub struct Servo<I2C> {
    controller: SharedPca9685<I2C>,
    channel: u8,
    limits: ServoLimits,
    angle: Option<Angle>,
}

impl<I2C: I2c> Servo<I2C> {
    pub fn new(controller: SharedPca9685<I2C>, channel: u8, limits: ServoLimits) -> Result<Self> {
        check_channel(channel)?;
        Ok(Self {
            controller,
            channel,
            limits,
            angle: None,
        })
    }

    pub async fn set_angle(&mut self, angle: Angle) -> Result<()> {
        let pulse = self.limits.pulse_for(angle);
        self.controller
            .lock()
            .await
            .set_pulse_width(self.channel, pulse)
            .await?;
        self.angle = Some(angle);
        trace!(channel = self.channel, %angle, ?pulse, "Servo moved");
        Ok(())
    }

    pub fn angle(&self) -> Option<Angle> {
        self.angle
    }

    /// Stop driving the servo so it can be moved by hand.
    pub async fn release(&mut self) -> Result<()> {
        self.controller.lock().await.set_full_off(self.channel).await?;
        self.angle = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{chips, SimI2cBus};
    use test_case::test_case;

    #[test_case(50.0 => 121)]
    #[test_case(200.0 => 30)]
    #[test_case(1000.0 => 5)]
    #[test_case(1526.0 => 3)]
    #[test_case(24.0 => 253)]
    fn test_prescale(hz: f64) -> u8 {
        prescale_for(hz).unwrap()
    }

    #[test]
    fn test_prescale_range() {
        assert!(prescale_for(10.0).is_err());
        assert!(prescale_for(2000.0).is_err());
    }

    #[test_case(0.0 => (0, FULL); "off")]
    #[test_case(0.0001 => (0, FULL); "rounds to off")]
    #[test_case(0.25 => (0, 1024); "quarter")]
    #[test_case(0.9997 => (0, 4095); "last tick")]
    #[test_case(0.9999 => (FULL, 0); "rounds to full on")]
    #[test_case(1.0 => (FULL, 0); "full on")]
    fn test_duty_ticks(duty: f32) -> (u16, u16) {
        duty_to_ticks(duty)
    }

    #[test]
    fn test_ticks_to_duty() {
        assert_eq!(ticks_to_duty(0, 1024), 0.25);
        assert_eq!(ticks_to_duty(FULL, 0), 1.0);
        assert_eq!(ticks_to_duty(0, FULL), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_full_duty_reads_back_full() {
        let (_bus, _device, mut pca) = controller().await;
        pca.set_duty(2, 0.9999).await.unwrap();
        let (on, off) = pca.ticks(2).await.unwrap();
        assert_eq!(off & FULL, 0);
        assert_eq!(on, FULL);
        assert_eq!(pca.duty(2).await.unwrap(), 1.0);
    }

    async fn controller() -> (SimI2cBus, std::sync::Arc<parking_lot::Mutex<crate::transport::sim::RegisterFileDevice>>, Pca9685<SimI2cBus>)
    {
        let bus = SimI2cBus::new();
        let device = bus.attach(DEFAULT_ADDRESS, chips::pca9685_registers());
        let mut pca = Pca9685::new(bus.clone(), DEFAULT_ADDRESS);
        pca.init(Frequency::from_hertz(50.0)).await.unwrap();
        (bus, device, pca)
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_sequence() {
        let (_bus, device, pca) = controller().await;
        let device = device.lock();
        assert_eq!(device.get(registers::PRE_SCALE), 121);
        assert_eq!(device.get(registers::MODE1), mode1::AI | mode1::ALLCALL);
        assert_eq!(device.get(registers::MODE2), mode2::OUTDRV);
        assert_eq!(device.slice(registers::ALL_LED_ON_L, 4), vec![0, 0, 0, 0x10]);
        assert!((pca.frequency().hertz() - 50.0).abs() < 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_registers() {
        let (_bus, device, mut pca) = controller().await;
        pca.set_ticks(3, 0x0123, 0x0456).await.unwrap();
        assert_eq!(device.lock().slice(0x06 + 12, 4), vec![0x23, 0x01, 0x56, 0x04]);
        assert_eq!(pca.ticks(3).await.unwrap(), (0x0123, 0x0456));

        assert!(pca.set_ticks(16, 0, 0).await.is_err());
        assert!(pca.set_ticks(0, 0, 0x2000).await.is_err());
        assert!(pca.set_ticks(0, 0, FULL | 0x0010).await.is_err());
        assert!(pca.set_ticks(0, FULL | 1, 0).await.is_err());

        pca.set_full_on(15).await.unwrap();
        assert_eq!(pca.duty(15).await.unwrap(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_and_wake() {
        let (_bus, device, mut pca) = controller().await;
        pca.sleep().await.unwrap();
        assert_ne!(device.lock().get(registers::MODE1) & mode1::SLEEP, 0);
        pca.wake().await.unwrap();
        assert_eq!(device.lock().get(registers::MODE1) & mode1::SLEEP, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pwm_channel_start_stop() {
        let (_bus, _device, pca) = controller().await;
        let shared = pca.into_shared();
        let mut channel = PwmChannel::new(shared.clone(), 2).await.unwrap();

        channel.set_duty_cycle(0.5).await.unwrap();
        assert_eq!(shared.lock().await.duty(2).await.unwrap(), 0.0);
        channel.start().await.unwrap();
        assert_eq!(shared.lock().await.duty(2).await.unwrap(), 0.5);
        channel.stop().await.unwrap();
        assert_eq!(shared.lock().await.duty(2).await.unwrap(), 0.0);

        assert!(channel.set_duty_cycle(1.5).await.is_err());
        assert_eq!(channel.apply(0.75).await.unwrap(), 0.75);
    }

    #[tokio::test(start_paused = true)]
    async fn test_servo_pulse_widths() {
        let (_bus, _device, pca) = controller().await;
        let shared = pca.into_shared();
        let mut servo = Servo::new(shared.clone(), 0, ServoLimits::default()).unwrap();

        servo.set_angle(Angle::from_degrees(90.0)).await.unwrap();
        // 1.5 ms of a ~20 ms period.
        let (_, off) = shared.lock().await.ticks(0).await.unwrap();
        assert!((305..=309).contains(&off), "off tick {off}");

        servo.release().await.unwrap();
        assert_eq!(servo.angle(), None);
        assert_eq!(shared.lock().await.duty(0).await.unwrap(), 0.0);
    }
}
