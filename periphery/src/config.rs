//! Configuration for the periphery daemon.
//!
//! Configuration comes from a JSON file named by `PERIPHERY_CONFIG`, or the
//! built-in defaults describing the simulated board when it is unset. A few
//! environment variables then override individual settings, and the result
//! is validated before anything is attached.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::registry::{self, Interface};
use crate::tracing::prelude::*;

pub const CONFIG_ENV: &str = "PERIPHERY_CONFIG";
pub const LISTEN_ENV: &str = "PERIPHERY_API_LISTEN";
pub const INTERVAL_ENV: &str = "PERIPHERY_SAMPLE_INTERVAL_MS";
pub const I2C_BUS_ENV: &str = "PERIPHERY_I2C_BUS";

/// Main configuration structure for the daemon.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub bus: BusConfig,
    pub sampling: SamplingConfig,
    /// Devices to attach, in order.
    pub devices: Vec<DeviceConfig>,
    /// Name of an SSD1306 device to show live readings on. A config file
    /// gets none unless it names one.
    #[serde(default)]
    pub status_display: Option<String>,
}

/// API server configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7785".into(),
        }
    }
}

/// Which I2C bus devices are attached to.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Linux `/dev/i2c-N` bus number. When unset the simulated board is used.
    pub i2c: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl SamplingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// One device to attach.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Unique name used in the API.
    pub name: String,
    /// Driver name from the catalog.
    pub driver: String,
    /// I2C address; the driver's default when omitted.
    #[serde(default)]
    pub address: Option<u8>,
}

impl DeviceConfig {
    pub fn new(name: &str, driver: &str, address: Option<u8>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            address,
        }
    }
}

impl Default for Config {
    /// Every part on the simulated board.
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            bus: BusConfig::default(),
            sampling: SamplingConfig::default(),
            devices: vec![
                DeviceConfig::new("light", "bh1750", Some(0x23)),
                DeviceConfig::new("climate", "sht4x", Some(0x44)),
                DeviceConfig::new("weather", "bme280", Some(0x76)),
                DeviceConfig::new("supply", "ina219", Some(0x41)),
                DeviceConfig::new("clock", "ds3231", Some(0x68)),
                DeviceConfig::new("buttons", "mcp23008", Some(0x20)),
                DeviceConfig::new("servos", "pca9685", Some(0x40)),
                DeviceConfig::new("oled", "ssd1306", Some(0x3C)),
                DeviceConfig::new("core", "tps546", Some(0x24)),
                DeviceConfig::new("probe", "analog-temperature", None),
                DeviceConfig::new("fan", "hbridge", None),
                DeviceConfig::new("radio", "nrf24l01", None),
                DeviceConfig::new("leds", "x74595", None),
            ],
            status_display: Some("oled".into()),
        }
    }
}

impl Config {
    /// Load from `PERIPHERY_CONFIG` (or defaults), apply environment
    /// overrides, and validate.
    pub fn load() -> Result<Self> {
        let mut config = match env::var_os(CONFIG_ENV) {
            Some(path) => Self::load_from(Path::new(&path))?,
            None => {
                debug!("{} not set, using built-in configuration", CONFIG_ENV);
                Self::default()
            }
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration file. Missing sections take defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply environment overrides, looking each variable up with `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(listen) = lookup(LISTEN_ENV) {
            self.api.listen = listen;
        }
        if let Some(interval) = lookup(INTERVAL_ENV) {
            self.sampling.interval_ms = interval
                .parse()
                .map_err(|_| Error::Config(format!("{INTERVAL_ENV}={interval} is not a number")))?;
        }
        if let Some(bus) = lookup(I2C_BUS_ENV) {
            self.bus.i2c = Some(
                bus.parse()
                    .map_err(|_| Error::Config(format!("{I2C_BUS_ENV}={bus} is not a bus number")))?,
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sampling.interval_ms == 0 {
            return Err(Error::Config("sampling interval must be non-zero".into()));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(Error::Config(format!("duplicate device name '{}'", device.name)));
            }
            let Some(driver) = registry::find(&device.driver) else {
                return Err(Error::Config(format!(
                    "device '{}' uses unknown driver '{}'",
                    device.name, device.driver
                )));
            };
            match (driver.interface, device.address) {
                (_, Some(address)) if address > 0x7F => {
                    return Err(Error::Config(format!(
                        "device '{}' address 0x{address:02X} is not a 7-bit address",
                        device.name
                    )));
                }
                (Interface::I2c, Some(address)) if !driver.addresses.contains(&address) => {
                    warn!(
                        device = %device.name,
                        driver = driver.name,
                        "Address 0x{address:02X} is not a usual address for this part"
                    );
                }
                (Interface::I2c, _) => {}
                (_, Some(_)) => {
                    return Err(Error::Config(format!(
                        "device '{}' is not an I2C part and takes no address",
                        device.name
                    )));
                }
                (_, None) => {}
            }
        }

        if let Some(display) = &self.status_display {
            let Some(device) = self.devices.iter().find(|d| &d.name == display) else {
                return Err(Error::Config(format!("status display '{display}' is not a configured device")));
            };
            if device.driver != "ssd1306" {
                return Err(Error::Config(format!("status display '{display}' is not an ssd1306")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn assert_config_error(config: &Config, needle: &str) {
        match config.validate() {
            Err(Error::Config(msg)) => assert!(msg.contains(needle), "unexpected message: {msg}"),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "devices": [ { "name": "lux", "driver": "bh1750" } ] }"#,
        )
        .unwrap();
        assert_eq!(config.api, ApiConfig::default());
        assert_eq!(config.sampling.interval(), Duration::from_secs(1));
        assert_eq!(config.devices, vec![DeviceConfig::new("lux", "bh1750", None)]);
        assert_eq!(config.status_display, None);
        config.validate().unwrap();
    }

    #[test]
    fn test_file_can_name_status_display() {
        let config: Config = serde_json::from_str(
            r#"{
                "devices": [ { "name": "panel", "driver": "ssd1306", "address": 61 } ],
                "status_display": "panel"
            }"#,
        )
        .unwrap();
        assert_eq!(config.status_display.as_deref(), Some("panel"));
        config.validate().unwrap();
        assert_eq!(Config::default().status_display.as_deref(), Some("oled"));
    }

    #[test]
    fn test_load_from_file() {
        let path = env::temp_dir().join(format!("periphery-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "api": { "listen": "0.0.0.0:9000" }, "bus": { "i2c": 1 } }"#).unwrap();
        let config = Config::load_from(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.api.listen, "0.0.0.0:9000");
        assert_eq!(config.bus.i2c, Some(1));

        assert!(matches!(
            Config::load_from(Path::new("/nonexistent/periphery.json")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_environment_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (LISTEN_ENV, "0.0.0.0:8080"),
            (INTERVAL_ENV, "250"),
            (I2C_BUS_ENV, "3"),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.api.listen, "0.0.0.0:8080");
        assert_eq!(config.sampling.interval_ms, 250);
        assert_eq!(config.bus.i2c, Some(3));

        let err = config
            .apply_overrides(|key| (key == INTERVAL_ENV).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_invalid_configs() {
        let mut config = Config::default();
        config.sampling.interval_ms = 0;
        assert_config_error(&config, "non-zero");

        let mut config = Config::default();
        config.devices.push(DeviceConfig::new("light", "sht4x", None));
        assert_config_error(&config, "duplicate");

        let mut config = Config::default();
        config.devices.push(DeviceConfig::new("x", "flux-capacitor", None));
        assert_config_error(&config, "unknown driver");

        let mut config = Config::default();
        config.devices.push(DeviceConfig::new("x", "bh1750", Some(0x80)));
        assert_config_error(&config, "7-bit");

        let mut config = Config::default();
        config.devices.push(DeviceConfig::new("x", "hbridge", Some(0x10)));
        assert_config_error(&config, "takes no address");

        let mut config = Config::default();
        config.status_display = Some("light".into());
        assert_config_error(&config, "not an ssd1306");
    }
}
