//! Driver catalog and bus discovery.
//!
//! Each driver module submits a [`DriverDescriptor`] with `inventory`, so the
//! catalog is assembled at link time without a central list. The catalog
//! backs the `/drivers` API endpoint, config validation, and [`scan`], which
//! matches responding I2C addresses against the drivers known to use them.

use serde::Serialize;
use strum::{Display, EnumString};

use crate::hw_trait::I2c;
use crate::tracing::prelude::*;

/// Broad class of device a driver controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Category {
    Sensor,
    Display,
    Motor,
    Rtc,
    IoExpander,
    Radio,
    Power,
}

/// The port or bus a driver talks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Interface {
    I2c,
    Spi,
    Analog,
    Gpio,
}

/// Static description of one driver.
#[derive(Debug, Serialize)]
pub struct DriverDescriptor {
    /// Name used in configuration files and the API.
    pub name: &'static str,
    /// Part or part family.
    pub part: &'static str,
    pub category: Category,
    pub interface: Interface,
    /// I2C addresses the part can be strapped to; empty for other buses.
    pub addresses: &'static [u8],
    pub description: &'static str,
}

inventory::collect!(DriverDescriptor);

/// Every registered driver, sorted by name.
pub fn drivers() -> Vec<&'static DriverDescriptor> {
    let mut drivers: Vec<_> = inventory::iter::<DriverDescriptor>().collect();
    drivers.sort_by_key(|d| d.name);
    drivers
}

pub fn find(name: &str) -> Option<&'static DriverDescriptor> {
    inventory::iter::<DriverDescriptor>().find(|d| d.name == name)
}

/// Drivers whose parts can answer at `address`.
pub fn candidates_for(address: u8) -> Vec<&'static DriverDescriptor> {
    drivers()
        .into_iter()
        .filter(|d| d.addresses.contains(&address))
        .collect()
}

/// First and last address probed by [`scan`]; the rest are reserved.
pub const SCAN_FIRST: u8 = 0x08;
pub const SCAN_LAST: u8 = 0x77;

/// One responding address found by [`scan`].
#[derive(Debug, Clone, Serialize)]
pub struct ScanHit {
    pub address: u8,
    /// Names of drivers whose parts use this address.
    pub candidates: Vec<&'static str>,
}

/// Probe every non-reserved 7-bit address with a one-byte read.
pub async fn scan<I2C: I2c>(i2c: &mut I2C) -> Vec<ScanHit> {
    let mut hits = Vec::new();
    for address in SCAN_FIRST..=SCAN_LAST {
        let mut probe = [0u8; 1];
        if i2c.read(address, &mut probe).await.is_err() {
            continue;
        }
        let candidates: Vec<_> = candidates_for(address).iter().map(|d| d.name).collect();
        debug!(address = format!("0x{address:02X}"), ?candidates, "Device responded");
        hits.push(ScanHit { address, candidates });
    }
    info!("Bus scan found {} device(s)", hits.len());
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{RegisterFileDevice, SimI2cBus};
    use std::str::FromStr;

    #[test]
    fn test_catalog_covers_every_category() {
        let drivers = drivers();
        for category in [
            Category::Sensor,
            Category::Display,
            Category::Motor,
            Category::Rtc,
            Category::IoExpander,
            Category::Radio,
            Category::Power,
        ] {
            assert!(
                drivers.iter().any(|d| d.category == category),
                "no driver registered for {category}"
            );
        }
    }

    #[test]
    fn test_names_are_unique_and_sorted() {
        let names: Vec<_> = drivers().iter().map(|d| d.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_find_and_candidates() {
        assert_eq!(find("bme280").unwrap().category, Category::Sensor);
        assert!(find("no-such-driver").is_none());
        let names: Vec<_> = candidates_for(0x40).iter().map(|d| d.name).collect();
        assert!(names.contains(&"ina219"));
        assert!(names.contains(&"pca9685"));
    }

    #[test]
    fn test_category_strings() {
        assert_eq!(Category::IoExpander.to_string(), "io-expander");
        assert_eq!(Category::from_str("rtc").unwrap(), Category::Rtc);
    }

    #[tokio::test]
    async fn test_scan_reports_attached_devices() {
        let mut bus = SimI2cBus::new();
        bus.attach(0x76, RegisterFileDevice::new());
        bus.attach(0x3C, RegisterFileDevice::new());

        let hits = scan(&mut bus).await;
        let addresses: Vec<_> = hits.iter().map(|h| h.address).collect();
        assert_eq!(addresses, vec![0x3C, 0x76]);
        assert!(hits[0].candidates.contains(&"ssd1306"));
        assert!(hits[1].candidates.contains(&"bme280"));
    }
}
