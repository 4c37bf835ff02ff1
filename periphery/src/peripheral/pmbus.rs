//! PMBus protocol support.
//!
//! Generic PMBus command codes, status register layouts and the two numeric
//! data formats (LINEAR11 and ULINEAR16) shared by PMBus power devices.
//!
//! Specification: <https://pmbus.org/specification-documents/>

use bitflags::bitflags;
use std::fmt;
use thiserror::Error;

/// PMBus standard command codes
pub mod commands {
    pub const OPERATION: u8 = 0x01;
    pub const ON_OFF_CONFIG: u8 = 0x02;
    pub const CLEAR_FAULTS: u8 = 0x03;
    pub const PHASE: u8 = 0x04;
    pub const CAPABILITY: u8 = 0x19;
    pub const VOUT_MODE: u8 = 0x20;
    pub const VOUT_COMMAND: u8 = 0x21;
    pub const VOUT_MAX: u8 = 0x24;
    pub const VOUT_MARGIN_HIGH: u8 = 0x25;
    pub const VOUT_MARGIN_LOW: u8 = 0x26;
    pub const VOUT_SCALE_LOOP: u8 = 0x29;
    pub const VOUT_MIN: u8 = 0x2B;
    pub const FREQUENCY_SWITCH: u8 = 0x33;
    pub const VIN_ON: u8 = 0x35;
    pub const VIN_OFF: u8 = 0x36;
    pub const VOUT_OV_FAULT_LIMIT: u8 = 0x40;
    pub const VOUT_OV_WARN_LIMIT: u8 = 0x42;
    pub const VOUT_UV_WARN_LIMIT: u8 = 0x43;
    pub const VOUT_UV_FAULT_LIMIT: u8 = 0x44;
    pub const IOUT_OC_FAULT_LIMIT: u8 = 0x46;
    pub const IOUT_OC_FAULT_RESPONSE: u8 = 0x47;
    pub const IOUT_OC_WARN_LIMIT: u8 = 0x4A;
    pub const OT_FAULT_LIMIT: u8 = 0x4F;
    pub const OT_FAULT_RESPONSE: u8 = 0x50;
    pub const OT_WARN_LIMIT: u8 = 0x51;
    pub const VIN_OV_FAULT_LIMIT: u8 = 0x55;
    pub const VIN_OV_FAULT_RESPONSE: u8 = 0x56;
    pub const VIN_UV_WARN_LIMIT: u8 = 0x58;
    pub const TON_DELAY: u8 = 0x60;
    pub const TON_RISE: u8 = 0x61;
    pub const TON_MAX_FAULT_LIMIT: u8 = 0x62;
    pub const TON_MAX_FAULT_RESPONSE: u8 = 0x63;
    pub const TOFF_DELAY: u8 = 0x64;
    pub const TOFF_FALL: u8 = 0x65;
    pub const STATUS_WORD: u8 = 0x79;
    pub const STATUS_VOUT: u8 = 0x7A;
    pub const STATUS_IOUT: u8 = 0x7B;
    pub const STATUS_INPUT: u8 = 0x7C;
    pub const STATUS_TEMPERATURE: u8 = 0x7D;
    pub const STATUS_CML: u8 = 0x7E;
    pub const READ_VIN: u8 = 0x88;
    pub const READ_VOUT: u8 = 0x8B;
    pub const READ_IOUT: u8 = 0x8C;
    pub const READ_TEMPERATURE_1: u8 = 0x8D;
    pub const IC_DEVICE_ID: u8 = 0xAD;
    pub const PIN_DETECT_OVERRIDE: u8 = 0xEE;
}

/// OPERATION command values
pub mod operation {
    pub const OFF_IMMEDIATE: u8 = 0x00;
    pub const SOFT_OFF: u8 = 0x40;
    pub const ON: u8 = 0x80;
    pub const ON_MARGIN_LOW: u8 = 0x98;
    pub const ON_MARGIN_HIGH: u8 = 0xA8;
}

bitflags! {
    /// ON_OFF_CONFIG bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OnOffConfig: u8 {
        /// Power-up controlled by CONTROL pin and/or OPERATION
        const PU = 0x10;
        /// Respond to OPERATION command
        const CMD = 0x08;
        /// CONTROL pin present
        const CP = 0x04;
        /// CONTROL pin active high
        const POLARITY = 0x02;
        /// Turn off with programmed delay
        const DELAY = 0x01;
    }
}

bitflags! {
    /// STATUS_WORD bits (PMBus specification section 17.2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusWord: u16 {
        const VOUT = 0x8000;
        const IOUT = 0x4000;
        const INPUT = 0x2000;
        const MFR = 0x1000;
        const PGOOD = 0x0800;
        const FANS = 0x0400;
        const OTHER = 0x0200;
        const UNKNOWN = 0x0100;
        const BUSY = 0x0080;
        const OFF = 0x0040;
        const VOUT_OV = 0x0020;
        const IOUT_OC = 0x0010;
        const VIN_UV = 0x0008;
        const TEMP = 0x0004;
        const CML = 0x0002;
        const NONE_OF_THE_ABOVE = 0x0001;
    }
}

bitflags! {
    /// STATUS_VOUT bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusVout: u8 {
        const OV_FAULT = 0x80;
        const OV_WARN = 0x40;
        const UV_WARN = 0x20;
        const UV_FAULT = 0x10;
        const AT_MAX = 0x08;
        const TON_MAX_FAULT = 0x02;
        const AT_MIN = 0x01;
    }
}

bitflags! {
    /// STATUS_IOUT bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusIout: u8 {
        const OC_FAULT = 0x80;
        const OC_LV_FAULT = 0x40;
        const OC_WARN = 0x20;
        const UC_FAULT = 0x10;
        const CURRENT_SHARE_FAULT = 0x08;
        const POWER_LIMITING = 0x04;
        const OP_FAULT = 0x02;
        const OP_WARN = 0x01;
    }
}

bitflags! {
    /// STATUS_INPUT bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusInput: u8 {
        const VIN_OV_FAULT = 0x80;
        const VIN_OV_WARN = 0x40;
        const VIN_UV_WARN = 0x20;
        const VIN_UV_FAULT = 0x10;
        const UNIT_OFF_VIN_LOW = 0x08;
        const IIN_OC_FAULT = 0x04;
        const IIN_OC_WARN = 0x02;
        const PIN_OP_WARN = 0x01;
    }
}

bitflags! {
    /// STATUS_TEMPERATURE bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusTemperature: u8 {
        const OT_FAULT = 0x80;
        const OT_WARN = 0x40;
        const UT_WARN = 0x20;
        const UT_FAULT = 0x10;
    }
}

bitflags! {
    /// STATUS_CML bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusCml: u8 {
        const INVALID_COMMAND = 0x80;
        const INVALID_DATA = 0x40;
        const PEC_FAILED = 0x20;
        const MEMORY_FAULT = 0x10;
        const PROCESSOR_FAULT = 0x08;
        const OTHER_COMM_FAULT = 0x02;
        const OTHER_MEMORY_LOGIC = 0x01;
    }
}

/// Names of the flags set in a status register, for logs.
pub fn flag_names<F: bitflags::Flags>(flags: F) -> Vec<&'static str> {
    flags.iter_names().map(|(name, _)| name).collect()
}

/// PMBus error types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PmbusError {
    #[error("Value {0} not representable in ULINEAR16 with exponent {1}")]
    ValueOutOfRange(String, i32),
}

// Sign-extend the low five bits of `raw` into an exponent.
fn exponent5(raw: u8) -> i32 {
    (((raw & 0x1F) << 3) as i8 >> 3) as i32
}

/// LINEAR11: 5-bit two's complement exponent over an 11-bit two's complement
/// mantissa. Value = mantissa × 2^exponent.
pub struct Linear11;

impl Linear11 {
    pub fn to_float(value: u16) -> f32 {
        let exponent = exponent5((value >> 11) as u8);
        let mantissa = (((value & 0x7FF) << 5) as i16 >> 5) as i32;
        mantissa as f32 * 2.0_f32.powi(exponent)
    }

    pub fn to_int(value: u16) -> i32 {
        Self::to_float(value) as i32
    }

    /// Encode `value`, choosing the exponent with the smallest rounding error.
    pub fn from_float(value: f32) -> u16 {
        if value == 0.0 {
            return 0;
        }

        let (exponent, mantissa) = (-16i32..=15)
            .filter_map(|exp| {
                let mantissa = (value / 2.0_f32.powi(exp)).round();
                (-1024.0..1024.0)
                    .contains(&mantissa)
                    .then(|| (exp, mantissa as i32, (mantissa * 2.0_f32.powi(exp) - value).abs()))
            })
            .min_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(exp, mantissa, _)| (exp, mantissa))
            .unwrap_or((15, if value > 0.0 { 1023 } else { -1024 }));

        (((exponent as u16) & 0x1F) << 11) | ((mantissa as u16) & 0x7FF)
    }

    pub fn from_int(value: i32) -> u16 {
        Self::from_float(value as f32)
    }
}

/// ULINEAR16: unsigned 16-bit mantissa with the exponent held in VOUT_MODE.
pub struct Linear16;

impl Linear16 {
    pub fn exponent(vout_mode: u8) -> i32 {
        exponent5(vout_mode)
    }

    pub fn to_float(value: u16, vout_mode: u8) -> f32 {
        value as f32 * 2.0_f32.powi(Self::exponent(vout_mode))
    }

    pub fn from_float(value: f32, vout_mode: u8) -> Result<u16, PmbusError> {
        let exponent = Self::exponent(vout_mode);
        let mantissa = (value / 2.0_f32.powi(exponent)).round();
        if !(0.0..=65535.0).contains(&mantissa) {
            return Err(PmbusError::ValueOutOfRange(value.to_string(), exponent));
        }
        Ok(mantissa as u16)
    }
}

/// Action a device takes when a fault trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Ignore,
    ShutdownRetryForever,
    ShutdownNoRetry,
    ShutdownWithRetries,
    ContinueRetryForever,
    ContinueNoRetry,
    ContinueWithRetries,
    ShutdownDelayedWithRetries,
}

/// Decoded fault response byte: `[action:3][retries:2][delay:3]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultResponse {
    pub raw: u8,
    pub action: FaultAction,
    pub retries: u8,
    pub delay_code: u8,
}

impl FaultResponse {
    const DELAYS_MS: [&'static str; 8] =
        ["0ms", "22.7ms", "45.4ms", "91ms", "182ms", "364ms", "728ms", "1456ms"];

    pub fn decode(raw: u8) -> Self {
        let action = match raw >> 5 {
            0b000 => FaultAction::Ignore,
            0b001 => FaultAction::ShutdownRetryForever,
            0b010 => FaultAction::ShutdownNoRetry,
            0b011 => FaultAction::ShutdownWithRetries,
            0b100 => FaultAction::ContinueRetryForever,
            0b101 => FaultAction::ContinueNoRetry,
            0b110 => FaultAction::ContinueWithRetries,
            _ => FaultAction::ShutdownDelayedWithRetries,
        };
        Self {
            raw,
            action,
            retries: (raw >> 3) & 0x03,
            delay_code: raw & 0x07,
        }
    }

    fn retries_forever(&self) -> bool {
        self.retries == 0b11
            && matches!(
                self.action,
                FaultAction::ShutdownRetryForever | FaultAction::ContinueRetryForever
            )
    }
}

impl fmt::Display for FaultResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw {
            0x00 => return write!(f, "ignore fault"),
            0xC0 => return write!(f, "shutdown immediately, no retries"),
            0xFF => return write!(f, "infinite retries, wait for recovery"),
            _ => {}
        }

        let action = match self.action {
            FaultAction::Ignore => "ignore fault",
            FaultAction::ShutdownRetryForever => "shutdown, retry indefinitely",
            FaultAction::ShutdownNoRetry => "shutdown, no retry",
            FaultAction::ShutdownWithRetries => "shutdown with retries",
            FaultAction::ContinueRetryForever => "continue, retry indefinitely",
            FaultAction::ContinueNoRetry => "continue, no retry",
            FaultAction::ContinueWithRetries => "continue with retries",
            FaultAction::ShutdownDelayedWithRetries => "shutdown with delay and retries",
        };

        if self.retries == 0
            || matches!(self.action, FaultAction::ShutdownNoRetry | FaultAction::ContinueNoRetry)
        {
            return write!(f, "{action}");
        }

        let retries = match (self.retries, self.retries_forever()) {
            (_, true) => "infinite retries".to_string(),
            (1, _) => "1 retry".to_string(),
            (n, _) => format!("{n} retries"),
        };
        write!(
            f,
            "{action}, {retries}, {} delay",
            Self::DELAYS_MS[self.delay_code as usize]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_linear11_zero() {
        assert_eq!(Linear11::to_float(0), 0.0);
        assert_eq!(Linear11::from_float(0.0), 0);
    }

    #[test_case(650.0, 1.0 ; "switching frequency")]
    #[test_case(4.8, 0.01 ; "vin on")]
    #[test_case(105.0, 1.0 ; "temperature warn")]
    #[test_case(-40.0, 1.0 ; "negative temperature")]
    #[test_case(25.0, 0.1 ; "current limit")]
    #[test_case(0.125, 0.001 ; "small fraction")]
    fn test_linear11_round_trip(value: f32, tolerance: f32) {
        let decoded = Linear11::to_float(Linear11::from_float(value));
        assert!(
            (decoded - value).abs() <= tolerance,
            "expected {value}, got {decoded}"
        );
    }

    #[test]
    fn test_linear11_known_encodings() {
        // mantissa 650, exponent 0
        assert_eq!(Linear11::to_float(0x028A), 650.0);
        // exponent -2 (0b11110), mantissa 1 -> 0.25
        assert_eq!(Linear11::to_float(0xF001), 0.25);
        // exponent 0, mantissa -1
        assert_eq!(Linear11::to_float(0x07FF), -1.0);
        assert_eq!(Linear11::to_int(Linear11::from_int(145)), 145);
    }

    #[test_case(0x17, 1.15 ; "exponent -9")]
    #[test_case(0x14, 1.15 ; "exponent -12")]
    #[test_case(0x00, 12.0 ; "exponent 0")]
    #[test_case(0x1B, 0.9 ; "exponent -5")]
    fn test_linear16_within_one_lsb(vout_mode: u8, volts: f32) {
        let encoded = Linear16::from_float(volts, vout_mode).unwrap();
        let decoded = Linear16::to_float(encoded, vout_mode);
        let lsb = 2.0_f32.powi(Linear16::exponent(vout_mode));
        assert!((decoded - volts).abs() <= lsb, "{volts} -> {decoded}");
    }

    #[test]
    fn test_linear16_range() {
        assert_eq!(Linear16::to_float(0xFFFF, 0x17), 65535.0 * 2.0_f32.powi(-9));
        assert!(Linear16::from_float(65535.0, 0x00).is_ok());
        assert!(Linear16::from_float(65536.0, 0x00).is_err());
        assert!(Linear16::from_float(-1.0, 0x17).is_err());
    }

    #[test]
    fn test_flag_names() {
        let status = StatusWord::VOUT | StatusWord::TEMP;
        assert_eq!(flag_names(status), vec!["VOUT", "TEMP"]);
        assert!(flag_names(StatusCml::empty()).is_empty());
    }

    #[test_case(0x00, "ignore fault")]
    #[test_case(0xC0, "shutdown immediately, no retries")]
    #[test_case(0xFF, "infinite retries, wait for recovery")]
    #[test_case(0x68, "shutdown with retries, 1 retry, 0ms delay")]
    #[test_case(0x7C, "shutdown with retries, 3 retries, 182ms delay")]
    #[test_case(0x3B, "shutdown, retry indefinitely, infinite retries, 91ms delay")]
    #[test_case(0x58, "shutdown, no retry")]
    #[test_case(0xB7, "continue, no retry")]
    fn test_fault_response_display(raw: u8, expected: &str) {
        assert_eq!(FaultResponse::decode(raw).to_string(), expected);
    }
}
