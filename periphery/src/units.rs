//! Typed physical quantities.
//!
//! Each quantity stores its value in one canonical unit and converts on
//! access, so drivers never hand bare `f32`s with an implied unit to
//! application code. Quantities serialize as their canonical value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

macro_rules! quantity {
    (
        $(#[$meta:meta])*
        $name:ident, base: $base:ident, symbol: $symbol:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(f64);

        impl $name {
            pub const ZERO: Self = Self(0.0);

            #[doc = concat!("Create from the canonical unit (", $symbol, ").")]
            pub const fn $base(value: f64) -> Self {
                Self(value)
            }

            #[doc = concat!("Value in the canonical unit (", $symbol, ").")]
            pub const fn value(&self) -> f64 {
                self.0
            }

            /// Absolute value, used for change thresholds.
            pub fn abs(self) -> Self {
                Self(self.0.abs())
            }
        }

        impl Add for $name {
            type Output = Self;

            fn add(self, rhs: Self) -> Self {
                Self(self.0 + rhs.0)
            }
        }

        impl Sub for $name {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self {
                Self(self.0 - rhs.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let precision = f.precision().unwrap_or(2);
                write!(f, "{:.*} {}", precision, self.0, $symbol)
            }
        }
    };
}

quantity!(
    /// Temperature, canonically in degrees Celsius.
    Temperature, base: from_celsius, symbol: "°C"
);

impl Temperature {
    pub fn from_fahrenheit(value: f64) -> Self {
        Self((value - 32.0) * 5.0 / 9.0)
    }

    pub fn from_kelvin(value: f64) -> Self {
        Self(value - 273.15)
    }

    pub fn celsius(&self) -> f64 {
        self.0
    }

    pub fn fahrenheit(&self) -> f64 {
        self.0 * 9.0 / 5.0 + 32.0
    }

    pub fn kelvin(&self) -> f64 {
        self.0 + 273.15
    }
}

quantity!(
    /// Pressure, canonically in pascals.
    Pressure, base: from_pascal, symbol: "Pa"
);

impl Pressure {
    const PA_PER_INHG: f64 = 3386.389;
    const PA_PER_PSI: f64 = 6894.757;

    pub fn from_hectopascal(value: f64) -> Self {
        Self(value * 100.0)
    }

    pub fn from_inches_of_mercury(value: f64) -> Self {
        Self(value * Self::PA_PER_INHG)
    }

    pub fn pascal(&self) -> f64 {
        self.0
    }

    pub fn hectopascal(&self) -> f64 {
        self.0 / 100.0
    }

    /// Millibar, numerically equal to hectopascal.
    pub fn millibar(&self) -> f64 {
        self.hectopascal()
    }

    pub fn inches_of_mercury(&self) -> f64 {
        self.0 / Self::PA_PER_INHG
    }

    pub fn psi(&self) -> f64 {
        self.0 / Self::PA_PER_PSI
    }
}

quantity!(
    /// Relative humidity in percent.
    RelativeHumidity, base: from_percent, symbol: "%RH"
);

impl RelativeHumidity {
    pub fn percent(&self) -> f64 {
        self.0
    }
}

quantity!(
    /// Illuminance in lux.
    Illuminance, base: from_lux, symbol: "lx"
);

impl Illuminance {
    pub fn lux(&self) -> f64 {
        self.0
    }
}

quantity!(
    /// Electric potential, canonically in volts.
    Voltage, base: from_volts, symbol: "V"
);

impl Voltage {
    pub fn from_millivolts(value: f64) -> Self {
        Self(value / 1000.0)
    }

    pub fn volts(&self) -> f64 {
        self.0
    }

    pub fn millivolts(&self) -> f64 {
        self.0 * 1000.0
    }
}

quantity!(
    /// Electric current, canonically in amperes.
    Current, base: from_amps, symbol: "A"
);

impl Current {
    pub fn from_milliamps(value: f64) -> Self {
        Self(value / 1000.0)
    }

    pub fn amps(&self) -> f64 {
        self.0
    }

    pub fn milliamps(&self) -> f64 {
        self.0 * 1000.0
    }
}

quantity!(
    /// Power, canonically in watts.
    Power, base: from_watts, symbol: "W"
);

impl Power {
    pub fn from_milliwatts(value: f64) -> Self {
        Self(value / 1000.0)
    }

    pub fn watts(&self) -> f64 {
        self.0
    }

    pub fn milliwatts(&self) -> f64 {
        self.0 * 1000.0
    }
}

quantity!(
    /// Frequency, canonically in hertz.
    Frequency, base: from_hertz, symbol: "Hz"
);

impl Frequency {
    pub fn from_kilohertz(value: f64) -> Self {
        Self(value * 1000.0)
    }

    pub fn hertz(&self) -> f64 {
        self.0
    }

    pub fn kilohertz(&self) -> f64 {
        self.0 / 1000.0
    }
}

quantity!(
    /// Angle in degrees.
    Angle, base: from_degrees, symbol: "°"
);

impl Angle {
    pub fn from_radians(value: f64) -> Self {
        Self(value.to_degrees())
    }

    pub fn degrees(&self) -> f64 {
        self.0
    }

    pub fn radians(&self) -> f64 {
        self.0.to_radians()
    }
}

impl std::ops::Mul<Current> for Voltage {
    type Output = Power;

    fn mul(self, rhs: Current) -> Power {
        Power::from_watts(self.0 * rhs.amps())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_temperature_conversions() {
        let t = Temperature::from_celsius(25.0);
        assert!(close(t.fahrenheit(), 77.0));
        assert!(close(t.kelvin(), 298.15));
        assert!(close(Temperature::from_fahrenheit(212.0).celsius(), 100.0));
        assert!(close(Temperature::from_kelvin(0.0).celsius(), -273.15));
    }

    #[test]
    fn test_pressure_conversions() {
        let p = Pressure::from_pascal(101_325.0);
        assert!(close(p.hectopascal(), 1013.25));
        assert!(close(p.millibar(), 1013.25));
        assert!((p.inches_of_mercury() - 29.92).abs() < 0.01);
        assert!((p.psi() - 14.696).abs() < 0.001);
    }

    #[test]
    fn test_electrical_units() {
        let v = Voltage::from_millivolts(3300.0);
        let i = Current::from_milliamps(500.0);
        assert!(close(v.volts(), 3.3));
        assert!(close((v * i).milliwatts(), 1650.0));
    }

    #[test]
    fn test_change_threshold_arithmetic() {
        let old = Temperature::from_celsius(21.0);
        let new = Temperature::from_celsius(20.4);
        assert!((new - old).abs() > Temperature::from_celsius(0.5));
        assert!(new < old);
    }

    #[test]
    fn test_display() {
        assert_eq!(Temperature::from_celsius(21.456).to_string(), "21.46 °C");
        assert_eq!(format!("{:.0}", Illuminance::from_lux(120.4)), "120 lx");
    }

    #[test]
    fn test_serializes_as_canonical_value() {
        let json = serde_json::to_string(&Pressure::from_hectopascal(1000.0)).unwrap();
        assert_eq!(json, "100000.0");
    }
}
