//! DS3231 real-time clock driver
//!
//! Timekeeping registers are BCD. The clock can run in 12 or 24 hour mode;
//! reads accept either, writes always use 24 hour mode. The century bit in
//! the month register extends the two-digit year to 2000..=2199.
//!
//! Datasheet: <https://www.analog.com/media/en/technical-documentation/data-sheets/ds3231.pdf>

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::macros::format_description;
use time::{Date, Month, PrimitiveDateTime, Time};
use tracing::{debug, trace};

use crate::comms::I2cRegisters;
use crate::hw_trait::I2c;
use crate::registry::{Category, DriverDescriptor, Interface};
use crate::sensor::Sensor;
use crate::units::Temperature;

pub const DEFAULT_ADDRESS: u8 = 0x68;

inventory::submit! {
    DriverDescriptor {
        name: "ds3231",
        part: "DS3231",
        category: Category::Rtc,
        interface: Interface::I2c,
        addresses: &[DEFAULT_ADDRESS],
        description: "Temperature-compensated real-time clock with two alarms",
    }
}

/// Register addresses
pub mod registers {
    pub const SECONDS: u8 = 0x00;
    pub const ALARM1: u8 = 0x07;
    pub const ALARM2: u8 = 0x0B;
    pub const CONTROL: u8 = 0x0E;
    pub const STATUS: u8 = 0x0F;
    pub const AGING: u8 = 0x10;
    pub const TEMP_MSB: u8 = 0x11;
}

mod control {
    pub const EOSC: u8 = 0x80;
    pub const INTCN: u8 = 0x04;
    pub const A2IE: u8 = 0x02;
    pub const A1IE: u8 = 0x01;
}

mod status {
    pub const OSF: u8 = 0x80;
    pub const EN32KHZ: u8 = 0x08;
    pub const A2F: u8 = 0x02;
    pub const A1F: u8 = 0x01;
}

const HOUR_12: u8 = 0x40;
const HOUR_PM: u8 = 0x20;
const CENTURY: u8 = 0x80;
const ALARM_MASK: u8 = 0x80;
const ALARM_DAY: u8 = 0x40;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Ds3231Error {
    #[error("Year {0} outside 2000..=2199")]
    YearOutOfRange(i32),
    #[error("Invalid time in clock registers: {0:02X?}")]
    InvalidTime(Vec<u8>),
    #[error("Invalid alarm field: {0}")]
    InvalidAlarm(&'static str),
}

pub fn bcd_to_bin(bcd: u8) -> u8 {
    (bcd >> 4) * 10 + (bcd & 0x0F)
}

pub fn bin_to_bcd(bin: u8) -> u8 {
    ((bin / 10) << 4) | (bin % 10)
}

/// Decode an hours register in either 12 or 24 hour mode.
fn decode_hours(raw: u8) -> u8 {
    if raw & HOUR_12 != 0 {
        let hour = bcd_to_bin(raw & 0x1F) % 12;
        if raw & HOUR_PM != 0 {
            hour + 12
        } else {
            hour
        }
    } else {
        bcd_to_bin(raw & 0x3F)
    }
}

/// Decode the seven timekeeping registers.
pub fn decode_datetime(regs: &[u8; 7]) -> Result<PrimitiveDateTime> {
    let invalid = || Ds3231Error::InvalidTime(regs.to_vec());
    let second = bcd_to_bin(regs[0] & 0x7F);
    let minute = bcd_to_bin(regs[1] & 0x7F);
    let hour = decode_hours(regs[2]);
    let day = bcd_to_bin(regs[4] & 0x3F);
    let month = bcd_to_bin(regs[5] & 0x1F);
    let century = if regs[5] & CENTURY != 0 { 100 } else { 0 };
    let year = 2000 + century + bcd_to_bin(regs[6]) as i32;

    let month = Month::try_from(month).map_err(|_| invalid())?;
    let date = Date::from_calendar_date(year, month, day).map_err(|_| invalid())?;
    let time = Time::from_hms(hour, minute, second).map_err(|_| invalid())?;
    Ok(PrimitiveDateTime::new(date, time))
}

/// Encode a date and time as 24 hour timekeeping registers.
pub fn encode_datetime(datetime: PrimitiveDateTime) -> Result<[u8; 7]> {
    let year = datetime.year();
    if !(2000..=2199).contains(&year) {
        bail!(Ds3231Error::YearOutOfRange(year));
    }
    let offset = (year - 2000) as u8;
    let century = if offset >= 100 { CENTURY } else { 0 };
    Ok([
        bin_to_bcd(datetime.second()),
        bin_to_bcd(datetime.minute()),
        bin_to_bcd(datetime.hour()),
        datetime.weekday().number_from_monday(),
        bin_to_bcd(datetime.day()),
        bin_to_bcd(datetime.month() as u8) | century,
        bin_to_bcd(offset % 100),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Alarm {
    One,
    Two,
}

impl Alarm {
    fn flag(self) -> u8 {
        match self {
            Alarm::One => status::A1F,
            Alarm::Two => status::A2F,
        }
    }

    fn enable_bit(self) -> u8 {
        match self {
            Alarm::One => control::A1IE,
            Alarm::Two => control::A2IE,
        }
    }
}

/// When an alarm fires. Alarm 2 has no seconds register, so the
/// second-resolution rates apply to alarm 1 only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmRate {
    EverySecond,
    EveryMinute,
    MatchSeconds,
    MatchMinutes,
    MatchHours,
    MatchDate,
    MatchWeekday,
}

/// Alarm setpoint. `day` is the day of month for `MatchDate` and the
/// day of week (1..=7) for `MatchWeekday`; ignored otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlarmTime {
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// Encode alarm registers. Returns four bytes for alarm 1, three for alarm 2.
pub fn encode_alarm(alarm: Alarm, at: AlarmTime, rate: AlarmRate) -> Result<Vec<u8>> {
    if at.hour > 23 || at.minute > 59 || at.second > 59 {
        bail!(Ds3231Error::InvalidAlarm("time"));
    }
    // Number of leading fields (seconds, minutes, hours, day) that must match.
    let matched = match (alarm, rate) {
        (Alarm::One, AlarmRate::EverySecond) => 0,
        (Alarm::One, AlarmRate::MatchSeconds) => 1,
        (Alarm::One, AlarmRate::MatchMinutes) => 2,
        (Alarm::Two, AlarmRate::EveryMinute) => 1,
        (Alarm::Two, AlarmRate::MatchMinutes) => 2,
        (_, AlarmRate::MatchHours) => 3,
        (_, AlarmRate::MatchDate) | (_, AlarmRate::MatchWeekday) => 4,
        _ => bail!(Ds3231Error::InvalidAlarm("rate")),
    };

    let day = match rate {
        AlarmRate::MatchDate if !(1..=31).contains(&at.day) => {
            bail!(Ds3231Error::InvalidAlarm("day of month"))
        }
        AlarmRate::MatchWeekday if !(1..=7).contains(&at.day) => {
            bail!(Ds3231Error::InvalidAlarm("day of week"))
        }
        AlarmRate::MatchWeekday => bin_to_bcd(at.day) | ALARM_DAY,
        _ => bin_to_bcd(at.day.max(1)),
    };

    let fields = [
        bin_to_bcd(at.second),
        bin_to_bcd(at.minute),
        bin_to_bcd(at.hour),
        day,
    ];
    let mut encoded: Vec<u8> = fields
        .iter()
        .enumerate()
        .map(|(i, field)| if i < matched { *field } else { field | ALARM_MASK })
        .collect();
    if alarm == Alarm::Two {
        encoded.remove(0);
    }
    Ok(encoded)
}

/// Clock and die temperature.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RtcReading {
    /// ISO 8601 local date and time, no offset.
    pub datetime: String,
    pub temperature: Temperature,
}

pub struct Ds3231<I2C> {
    regs: I2cRegisters<I2C>,
}

impl<I2C: I2c> Ds3231<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self::with_address(i2c, DEFAULT_ADDRESS)
    }

    /// For a clock behind an address translator or mux.
    pub fn with_address(i2c: I2C, address: u8) -> Self {
        Self {
            regs: I2cRegisters::new(i2c, address),
        }
    }

    pub async fn datetime(&mut self) -> Result<PrimitiveDateTime> {
        let mut raw = [0u8; 7];
        self.regs.read_into(registers::SECONDS, &mut raw).await?;
        trace!(raw = %hex::encode(raw), "DS3231 time registers");
        decode_datetime(&raw)
    }

    /// Set the clock and clear the oscillator-stop flag.
    pub async fn set_datetime(&mut self, datetime: PrimitiveDateTime) -> Result<()> {
        let raw = encode_datetime(datetime)?;
        self.regs.write_block(registers::SECONDS, &raw).await?;
        self.regs.update_u8(registers::STATUS, status::OSF, 0).await?;
        debug!(%datetime, "DS3231 clock set");
        Ok(())
    }

    /// Whether the oscillator has stopped since the flag was last cleared,
    /// meaning the time is not trustworthy.
    pub async fn oscillator_stopped(&mut self) -> Result<bool> {
        Ok(self.regs.read_u8(registers::STATUS).await? & status::OSF != 0)
    }

    /// Keep the oscillator running on battery power.
    pub async fn enable_oscillator(&mut self) -> Result<()> {
        self.regs.update_u8(registers::CONTROL, control::EOSC, 0).await?;
        Ok(())
    }

    pub async fn set_alarm(&mut self, alarm: Alarm, at: AlarmTime, rate: AlarmRate) -> Result<()> {
        let encoded = encode_alarm(alarm, at, rate)?;
        let register = match alarm {
            Alarm::One => registers::ALARM1,
            Alarm::Two => registers::ALARM2,
        };
        self.regs.write_block(register, &encoded).await?;
        debug!(?alarm, ?at, ?rate, "DS3231 alarm set");
        Ok(())
    }

    /// Route `alarm` to the INT/SQW pin (enabled) or mask it.
    pub async fn set_alarm_interrupt(&mut self, alarm: Alarm, enabled: bool) -> Result<()> {
        let bit = alarm.enable_bit();
        let value = if enabled { bit | control::INTCN } else { 0 };
        let mask = if enabled { bit | control::INTCN } else { bit };
        self.regs.update_u8(registers::CONTROL, mask, value).await?;
        Ok(())
    }

    pub async fn alarm_fired(&mut self, alarm: Alarm) -> Result<bool> {
        Ok(self.regs.read_u8(registers::STATUS).await? & alarm.flag() != 0)
    }

    pub async fn clear_alarm(&mut self, alarm: Alarm) -> Result<()> {
        self.regs
            .update_u8(registers::STATUS, alarm.flag(), 0)
            .await?;
        Ok(())
    }

    pub async fn set_32khz_output(&mut self, enabled: bool) -> Result<()> {
        let value = if enabled { status::EN32KHZ } else { 0 };
        self.regs
            .update_u8(registers::STATUS, status::EN32KHZ, value)
            .await?;
        Ok(())
    }

    /// Die temperature, 0.25 °C resolution, updated every 64 s.
    pub async fn temperature(&mut self) -> Result<Temperature> {
        let mut raw = [0u8; 2];
        self.regs.read_into(registers::TEMP_MSB, &mut raw).await?;
        let quarters = (i16::from_be_bytes(raw) >> 6) as f64;
        Ok(Temperature::from_celsius(quarters * 0.25))
    }

    /// Crystal aging trim; positive values slow the oscillator.
    pub async fn aging_offset(&mut self) -> Result<i8> {
        Ok(self.regs.read_u8(registers::AGING).await? as i8)
    }

    pub async fn set_aging_offset(&mut self, offset: i8) -> Result<()> {
        self.regs.write_u8(registers::AGING, offset as u8).await
    }
}

#[async_trait]
impl<I2C: I2c + 'static> Sensor for Ds3231<I2C> {
    type Reading = RtcReading;

    fn name(&self) -> &'static str {
        "ds3231"
    }

    async fn read(&mut self) -> Result<RtcReading> {
        let datetime = self
            .datetime()
            .await?
            .format(format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"))?;
        Ok(RtcReading {
            datetime,
            temperature: self.temperature().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{chips, SimI2cBus};
    use test_case::test_case;
    use time::macros::datetime;

    #[test_case(0x59 => 59)]
    #[test_case(0x00 => 0)]
    #[test_case(0x23 => 23)]
    fn test_bcd(bcd: u8) -> u8 {
        assert_eq!(bin_to_bcd(bcd_to_bin(bcd)), bcd);
        bcd_to_bin(bcd)
    }

    #[test_case(0x12 => 12; "24h noon")]
    #[test_case(0x40 | 0x12 => 0; "12h midnight")]
    #[test_case(0x40 | 0x20 | 0x12 => 12; "12h noon")]
    #[test_case(0x40 | 0x20 | 0x03 => 15; "12h 3pm")]
    fn test_hours(raw: u8) -> u8 {
        decode_hours(raw)
    }

    #[tokio::test]
    async fn test_with_address() {
        let bus = SimI2cBus::new();
        bus.attach(0x57, chips::ds3231_registers());
        assert!(Ds3231::new(bus.clone()).temperature().await.is_err());
        let mut rtc = Ds3231::with_address(bus, 0x57);
        assert_eq!(rtc.temperature().await.unwrap().celsius(), 25.25);
    }

    #[test]
    fn test_century_bit() {
        let raw = encode_datetime(datetime!(2105-03-01 08:30:00)).unwrap();
        assert_eq!(raw[5], CENTURY | 0x03);
        assert_eq!(raw[6], 0x05);
        assert_eq!(decode_datetime(&raw).unwrap(), datetime!(2105-03-01 08:30:00));

        assert!(encode_datetime(datetime!(1999-12-31 23:59:59)).is_err());
    }

    #[test]
    fn test_alarm_encoding() {
        let at = AlarmTime { day: 3, hour: 7, minute: 15, second: 30 };
        assert_eq!(
            encode_alarm(Alarm::One, at, AlarmRate::MatchHours).unwrap(),
            vec![0x30, 0x15, 0x07, 0x83]
        );
        assert_eq!(
            encode_alarm(Alarm::One, at, AlarmRate::MatchWeekday).unwrap(),
            vec![0x30, 0x15, 0x07, 0x43]
        );
        assert_eq!(
            encode_alarm(Alarm::Two, at, AlarmRate::EveryMinute).unwrap(),
            vec![0x95, 0x87, 0x83]
        );
        assert!(encode_alarm(Alarm::Two, at, AlarmRate::EverySecond).is_err());
        assert!(encode_alarm(
            Alarm::One,
            AlarmTime { day: 9, ..at },
            AlarmRate::MatchWeekday
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_set_and_read_clock() {
        let bus = SimI2cBus::new();
        let device = bus.attach(DEFAULT_ADDRESS, chips::ds3231_registers());
        let mut rtc = Ds3231::new(bus);
        assert!(rtc.oscillator_stopped().await.unwrap());

        rtc.set_datetime(datetime!(2024-02-29 21:07:45)).await.unwrap();
        assert_eq!(rtc.datetime().await.unwrap(), datetime!(2024-02-29 21:07:45));
        assert!(!rtc.oscillator_stopped().await.unwrap());
        // 2024-02-29 is a Thursday.
        assert_eq!(device.lock().get(0x03), 4);
    }

    #[tokio::test]
    async fn test_reads_12_hour_registers() {
        let bus = SimI2cBus::new();
        let device = bus.attach(DEFAULT_ADDRESS, chips::ds3231_registers());
        device
            .lock()
            .load(registers::SECONDS, &[0x05, 0x45, HOUR_12 | HOUR_PM | 0x11, 1, 0x15, 0x06, 0x25]);
        let mut rtc = Ds3231::new(bus);
        assert_eq!(rtc.datetime().await.unwrap(), datetime!(2025-06-15 23:45:05));
    }

    #[tokio::test]
    async fn test_alarm_flags_and_interrupts() {
        let bus = SimI2cBus::new();
        let device = bus.attach(DEFAULT_ADDRESS, chips::ds3231_registers());
        let mut rtc = Ds3231::new(bus);

        rtc.set_alarm_interrupt(Alarm::Two, true).await.unwrap();
        assert_eq!(device.lock().get(registers::CONTROL) & 0x06, 0x06);

        device.lock().set(registers::STATUS, status::A2F | status::A1F);
        assert!(rtc.alarm_fired(Alarm::Two).await.unwrap());
        rtc.clear_alarm(Alarm::Two).await.unwrap();
        assert!(!rtc.alarm_fired(Alarm::Two).await.unwrap());
        assert!(rtc.alarm_fired(Alarm::One).await.unwrap());
    }

    #[tokio::test]
    async fn test_temperature_and_aging() {
        let bus = SimI2cBus::new();
        let device = bus.attach(DEFAULT_ADDRESS, chips::ds3231_registers());
        device.lock().load(registers::TEMP_MSB, &[0xE6, 0x40]);
        let mut rtc = Ds3231::new(bus);

        assert_eq!(rtc.temperature().await.unwrap().celsius(), -25.75);

        rtc.set_aging_offset(-3).await.unwrap();
        assert_eq!(rtc.aging_offset().await.unwrap(), -3);
    }

    #[tokio::test]
    async fn test_sensor_reading_formats_datetime() {
        let bus = SimI2cBus::new();
        bus.attach(DEFAULT_ADDRESS, chips::ds3231_registers());
        let mut rtc = Ds3231::new(bus);
        rtc.set_datetime(datetime!(2030-01-02 03:04:05)).await.unwrap();
        assert_eq!(rtc.read().await.unwrap().datetime, "2030-01-02T03:04:05");
    }
}
