//! Device factory and status display.
//!
//! [`DeviceFactory`] turns configured devices into running drivers. Each one
//! is attached to the shared I2C bus or a spare port, initialized, sampled
//! on the configured interval and registered with the API state. A device
//! that fails to come up is recorded as failed and the rest carry on.
//!
//! The status display task renders the latest readings onto an SSD1306.

use anyhow::{anyhow, bail, Result};
use embedded_graphics::{
    mono_font::{ascii::FONT_6X10, MonoTextStyle},
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::actuator::{self, OutputActuator, SharedActuator};
use crate::api::v1::{AppState, DeviceEntry, FailedDeviceStatus};
use crate::config::DeviceConfig;
use crate::hw_trait::{AnalogInput, I2c, OutputPin, PwmOutput, Spi};
use crate::peripheral::{
    analog_temperature::AnalogTemperature,
    bh1750::{self, Bh1750},
    bme280::{self, Bme280, Bme280Config},
    ds3231::{self, Ds3231},
    hbridge::HBridgeMotor,
    ina219::{self, Ina219, Ina219Config},
    mcp23008::{self, Mcp23008},
    nrf24l01::Nrf24l01,
    pca9685::{self, Pca9685, PwmChannel},
    sht4x::{self, Sht4x},
    ssd1306::{self, DisplaySize, Ssd1306},
    tps546::{self, Tps546, Tps546Config},
    x74595::{ShiftPin, X74595},
};
use crate::registry::{self, Interface};
use crate::sensor::{start_updating, ReadingSource, Sensor, SharedSensor};
use crate::tracing::prelude::*;
use crate::transport::sim::SimBoard;
use crate::units::Frequency;

/// Hobby servo frame rate.
const SERVO_FREQUENCY_HZ: f64 = 50.0;
/// INA219 shunt and full-scale current.
const SHUNT_OHMS: f64 = 0.1;
const MAX_AMPS: f64 = 3.2;
/// Pipe 1 listens here; pipe 0 follows the TX address.
const RADIO_ADDRESS: &[u8] = b"PERI1";
const SHIFT_CHIPS: usize = 1;

/// Text rows are one FONT_6X10 glyph high.
const LINE_HEIGHT: u32 = 10;
const LINE_CHARS: usize = 21;

pub struct MotorPorts {
    pub pwm: Box<dyn PwmOutput>,
    pub in_a: Box<dyn OutputPin>,
    pub in_b: Box<dyn OutputPin>,
}

pub struct RadioPorts {
    pub spi: Box<dyn Spi>,
    pub ce: Box<dyn OutputPin>,
}

/// Non-I2C ports available to the factory. Each is handed to the first
/// device that needs it.
#[derive(Default)]
pub struct AuxPorts {
    pub analog: Option<Box<dyn AnalogInput>>,
    pub motor: Option<MotorPorts>,
    pub radio: Option<RadioPorts>,
    pub shift: Option<Box<dyn Spi>>,
}

impl AuxPorts {
    /// The spare ports of a simulated board.
    pub fn from_sim(board: &SimBoard) -> Self {
        Self {
            analog: Some(Box::new(board.thermometer.clone())),
            motor: Some(MotorPorts {
                pwm: Box::new(board.motor_pwm.clone()),
                in_a: Box::new(board.motor_a.clone()),
                in_b: Box::new(board.motor_b.clone()),
            }),
            radio: Some(RadioPorts {
                spi: Box::new(board.radio_spi.clone()),
                ce: Box::new(board.radio_ce.clone()),
            }),
            shift: Some(Box::new(board.shift_spi.clone())),
        }
    }
}

/// The address a driver uses when the configuration leaves it out.
pub fn default_address(driver: &str) -> Option<u8> {
    let address = match driver {
        "bh1750" => bh1750::DEFAULT_ADDRESS,
        "bme280" => bme280::DEFAULT_ADDRESS,
        "ds3231" => ds3231::DEFAULT_ADDRESS,
        "ina219" => ina219::DEFAULT_ADDRESS,
        "mcp23008" => mcp23008::DEFAULT_ADDRESS,
        "pca9685" => pca9685::DEFAULT_ADDRESS,
        "sht4x" => sht4x::DEFAULT_ADDRESS,
        "ssd1306" => ssd1306::DEFAULT_ADDRESS,
        "tps546" => tps546::DEFAULT_ADDRESS,
        _ => return None,
    };
    Some(address)
}

pub struct DeviceFactory<I2C> {
    i2c: I2C,
    ports: AuxPorts,
    state: AppState,
    interval: Duration,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    display: Option<Ssd1306<I2C>>,
}

impl<I2C: I2c + Clone + 'static> DeviceFactory<I2C> {
    pub fn new(
        i2c: I2C,
        ports: AuxPorts,
        state: AppState,
        interval: Duration,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            i2c,
            ports,
            state,
            interval,
            tracker,
            shutdown,
            display: None,
        }
    }

    /// Attach every device, recording failures in the API state. Returns
    /// how many attached.
    pub async fn attach_all(&mut self, devices: &[DeviceConfig], status_display: Option<&str>) -> usize {
        let mut attached = 0;
        for device in devices {
            let is_display = status_display == Some(device.name.as_str());
            match self.attach(device, is_display).await {
                Ok(()) => {
                    info!(device = %device.name, driver = %device.driver, "Device attached");
                    attached += 1;
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    error!(device = %device.name, driver = %device.driver, %error, "Failed to attach device");
                    self.state
                        .register_failed_device(FailedDeviceStatus {
                            name: device.name.clone(),
                            driver: device.driver.clone(),
                            error,
                        })
                        .await;
                }
            }
        }
        attached
    }

    /// Attach one device. With `status_display` set, an SSD1306 is kept
    /// for [`DeviceFactory::start_status_display`].
    pub async fn attach(&mut self, device: &DeviceConfig, status_display: bool) -> Result<()> {
        let descriptor =
            registry::find(&device.driver).ok_or_else(|| anyhow!("unknown driver '{}'", device.driver))?;
        let name = device.name.as_str();
        let address = match descriptor.interface {
            Interface::I2c => device.address.or_else(|| default_address(descriptor.name)),
            _ => None,
        };
        let at = || address.ok_or_else(|| anyhow!("'{name}' needs an I2C address"));
        let mut outputs = Vec::new();

        let source = match descriptor.name {
            "bh1750" => {
                let mut sensor = Bh1750::with_address(self.i2c.clone(), at()?);
                sensor.power_on().await?;
                Some(self.sample(sensor))
            }
            "sht4x" => {
                let mut sensor = Sht4x::with_address(self.i2c.clone(), at()?);
                sensor.soft_reset().await?;
                Some(self.sample(sensor))
            }
            "bme280" => {
                let mut sensor = Bme280::with_address(self.i2c.clone(), at()?);
                sensor.init(Bme280Config::default()).await?;
                Some(self.sample(sensor))
            }
            "ina219" => {
                let mut sensor = Ina219::with_address(self.i2c.clone(), at()?);
                sensor.reset().await?;
                sensor.configure(Ina219Config::default()).await?;
                sensor.calibrate(SHUNT_OHMS, MAX_AMPS).await?;
                Some(self.sample(sensor))
            }
            "ds3231" => {
                let mut rtc = Ds3231::with_address(self.i2c.clone(), at()?);
                if rtc.oscillator_stopped().await? {
                    warn!(device = name, "RTC oscillator had stopped; time needs setting");
                    rtc.enable_oscillator().await?;
                }
                Some(self.sample(rtc))
            }
            "mcp23008" => {
                let mut expander = Mcp23008::new(self.i2c.clone(), at()?);
                expander.init().await?;
                Some(self.sample(expander))
            }
            "pca9685" => {
                let mut controller = Pca9685::new(self.i2c.clone(), at()?);
                controller.init(Frequency::from_hertz(SERVO_FREQUENCY_HZ)).await?;
                let controller = controller.into_shared();
                for channel in 0..pca9685::CHANNELS {
                    let output = PwmChannel::new(controller.clone(), channel).await?;
                    let key = format!("{name}.{channel}");
                    self.output(name, &key, actuator::shared(output)).await;
                    outputs.push(key);
                }
                None
            }
            "ssd1306" => {
                let mut display = Ssd1306::new(self.i2c.clone(), at()?, DisplaySize::default());
                display.init().await?;
                if status_display {
                    self.display = Some(display);
                }
                None
            }
            "tps546" => {
                let mut regulator = Tps546::with_address(self.i2c.clone(), at()?, Tps546Config::default());
                regulator.init().await?;
                let vout = regulator.config().vout_command;
                regulator.set_vout(vout).await?;
                let sensor = SharedSensor::new(regulator);
                let driver: SharedActuator = sensor.driver();
                self.output(name, name, driver).await;
                outputs.push(name.to_string());
                Some(self.sample(sensor))
            }
            "analog-temperature" => {
                let input = self.ports.analog.take().ok_or_else(|| no_port(name, "analog input"))?;
                Some(self.sample(AnalogTemperature::tmp36(input)))
            }
            "hbridge" => {
                let MotorPorts { pwm, in_a, in_b } =
                    self.ports.motor.take().ok_or_else(|| no_port(name, "motor"))?;
                let motor = HBridgeMotor::new(pwm, in_a, in_b).await?;
                self.output(name, name, actuator::shared(motor)).await;
                outputs.push(name.to_string());
                None
            }
            "nrf24l01" => {
                let RadioPorts { spi, ce } = self.ports.radio.take().ok_or_else(|| no_port(name, "radio"))?;
                let mut radio = Nrf24l01::new(spi, ce);
                radio.init().await?;
                radio.open_reading_pipe(1, RADIO_ADDRESS).await?;
                radio.start_listening().await?;
                Some(self.sample(radio))
            }
            "x74595" => {
                let spi = self.ports.shift.take().ok_or_else(|| no_port(name, "shift register SPI"))?;
                let mut chain = X74595::new(spi, SHIFT_CHIPS)?;
                chain.clear().await?;
                let pins = chain.pin_count();
                let chain = chain.into_shared();
                for pin in 0..pins {
                    let output = ShiftPin::new(chain.clone(), pin).await?;
                    let key = format!("{name}.{pin}");
                    self.output(name, &key, actuator::shared(OutputActuator::new("x74595", output)))
                        .await;
                    outputs.push(key);
                }
                None
            }
            other => bail!("no factory for driver '{other}'"),
        };

        self.state
            .register_device(
                name.to_string(),
                DeviceEntry {
                    driver: descriptor.name,
                    address,
                    source,
                    outputs,
                },
            )
            .await;
        Ok(())
    }

    fn sample<S: Sensor>(&self, sensor: S) -> Arc<dyn ReadingSource> {
        Arc::new(start_updating(sensor, self.interval, &self.tracker, &self.shutdown))
    }

    async fn output(&self, device: &str, key: &str, actuator: SharedActuator) {
        self.state.register_output(key.to_string(), device, actuator).await;
    }

    /// Spawn the status display task if a display was attached for it.
    pub fn start_status_display(&mut self) -> bool {
        let Some(display) = self.display.take() else {
            return false;
        };
        self.tracker.spawn(status_display(
            display,
            self.state.clone(),
            self.interval,
            self.shutdown.clone(),
        ));
        true
    }
}

fn no_port(device: &str, port: &str) -> anyhow::Error {
    anyhow!("no {port} port left for '{device}'")
}

/// Redraw the latest readings every `interval` until `shutdown`, then blank
/// the panel.
pub async fn status_display<I2C: I2c>(
    mut display: Ssd1306<I2C>,
    state: AppState,
    interval: Duration,
    shutdown: CancellationToken,
) {
    debug!("Status display started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let lines = status_lines(&state).await;
        render(&mut display, &lines).unwrap_or_else(|never| match never {});
        if let Err(e) = display.flush().await {
            warn!(error = %e, "Status display update failed");
        }
    }

    display.clear_buffer();
    if let Err(e) = display.flush().await {
        debug!(error = %e, "Could not blank status display");
    }
}

/// One line per sampled device: its name and a compact latest reading.
pub async fn status_lines(state: &AppState) -> Vec<String> {
    let devices = state.devices.read().await;
    devices
        .iter()
        .filter_map(|(name, entry)| {
            let source = entry.source.as_ref()?;
            let reading = source.latest_json().map_or_else(|| "...".to_string(), |v| summarize(&v));
            Some(format!("{name}: {reading}").chars().take(LINE_CHARS).collect())
        })
        .collect()
}

/// Compact text for a reading: numbers to one decimal, at most two fields
/// of a struct.
pub fn summarize(value: &Value) -> String {
    let join = |values: Vec<String>| values.join(" ");
    match value {
        Value::Null => "-".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.as_f64().map_or_else(|| n.to_string(), |f| format!("{f:.1}")),
        Value::String(s) => s.clone(),
        Value::Array(items) => join(items.iter().take(2).map(summarize).collect()),
        Value::Object(fields) => join(
            fields
                .values()
                .filter(|v| !v.is_null())
                .take(2)
                .map(summarize)
                .collect(),
        ),
    }
}

/// Draw `lines` top to bottom, dropping any that do not fit.
pub fn render<D>(target: &mut D, lines: &[String]) -> Result<(), D::Error>
where
    D: DrawTarget<Color = BinaryColor>,
{
    target.clear(BinaryColor::Off)?;
    let style = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
    let rows = (target.bounding_box().size.height / LINE_HEIGHT) as usize;
    for (row, line) in lines.iter().take(rows).enumerate() {
        let top = Point::new(0, (row as u32 * LINE_HEIGHT) as i32);
        Text::with_baseline(line, top, style, Baseline::Top).draw(target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::sim::SimI2cBus;
    use serde_json::json;
    use test_case::test_case;

    fn factory(board: &SimBoard, ports: AuxPorts) -> (DeviceFactory<SimI2cBus>, AppState, CancellationToken) {
        let state = AppState::new();
        let shutdown = CancellationToken::new();
        let factory = DeviceFactory::new(
            board.i2c.clone(),
            ports,
            state.clone(),
            Duration::from_millis(500),
            TaskTracker::new(),
            shutdown.clone(),
        );
        (factory, state, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn test_standard_board_attaches_everything() {
        let board = SimBoard::standard();
        let (mut factory, state, shutdown) = factory(&board, AuxPorts::from_sim(&board));
        let config = Config::default();

        let attached = factory
            .attach_all(&config.devices, config.status_display.as_deref())
            .await;
        assert_eq!(attached, config.devices.len());
        assert!(state.failed_devices.read().await.is_empty());

        let outputs = state.outputs.read().await;
        for key in ["servos.0", "servos.15", "core", "fan", "leds.0", "leds.7"] {
            assert!(outputs.contains_key(key), "missing output {key}");
        }
        drop(outputs);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let list = state.device_list().await;
        for device in &list.devices {
            let sampled = !matches!(device.driver.as_str(), "pca9685" | "ssd1306" | "hbridge" | "x74595");
            assert_eq!(device.reading.is_some(), sampled, "{}", device.name);
        }
        let supply = state.device_status("supply").await.unwrap();
        assert_eq!(supply.address.as_deref(), Some("0x41"));

        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_recorded() {
        let board = SimBoard::standard();
        let (mut factory, state, shutdown) = factory(&board, AuxPorts::default());
        let devices = [
            DeviceConfig::new("probe", "analog-temperature", None),
            DeviceConfig::new("ghost", "bh1750", Some(0x5C)),
            DeviceConfig::new("light", "bh1750", None),
            DeviceConfig::new("stray-clock", "ds3231", Some(0x69)),
        ];

        assert_eq!(factory.attach_all(&devices, None).await, 1);
        let failed = state.failed_devices.read().await;
        assert_eq!(failed.len(), 3);
        assert!(failed[0].error.contains("analog input"), "{}", failed[0].error);
        assert_eq!(failed[1].name, "ghost");
        assert_eq!(failed[2].name, "stray-clock");
        assert!(state.device_status("light").await.is_some());

        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_outputs_drive_hardware() {
        let board = SimBoard::standard();
        let (mut factory, state, shutdown) = factory(&board, AuxPorts::from_sim(&board));
        let devices = [
            DeviceConfig::new("leds", "x74595", None),
            DeviceConfig::new("fan", "hbridge", None),
        ];
        assert_eq!(factory.attach_all(&devices, None).await, 2);

        let leds = state.outputs.read().await["leds.3"].actuator.clone();
        leds.lock().await.apply(1.0).await.unwrap();
        assert_eq!(board.shift.lock().frames.last(), Some(&vec![0x08]));

        let fan = state.outputs.read().await["fan"].actuator.clone();
        assert_eq!(fan.lock().await.apply(-0.5).await.unwrap(), -0.5);
        assert_ne!(board.motor_a.value(), board.motor_b.value());

        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_display_draws_readings() {
        let board = SimBoard::standard();
        let (mut factory, state, shutdown) = factory(&board, AuxPorts::default());
        let devices = [
            DeviceConfig::new("light", "bh1750", None),
            DeviceConfig::new("oled", "ssd1306", None),
        ];
        factory.attach_all(&devices, Some("oled")).await;
        assert!(factory.start_status_display());
        assert!(!factory.start_status_display());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let lines = status_lines(&state).await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("light: "), "{}", lines[0]);
        assert!(board.ssd1306.lock().lit_pixels() > 0);

        shutdown.cancel();
        factory.tracker.close();
        factory.tracker.wait().await;
        assert_eq!(board.ssd1306.lock().lit_pixels(), 0);
    }

    #[test_case(json!(21.456), "21.5" ; "number")]
    #[test_case(json!(null), "-" ; "null")]
    #[test_case(json!({"humidity": 45.0, "temperature": 22.5, "x": 1}), "45.0 22.5" ; "first two fields")]
    #[test_case(json!({"last": null, "received": 3}), "3.0" ; "null fields skipped")]
    #[test_case(json!("2000-01-01T00:00:00"), "2000-01-01T00:00:00" ; "string")]
    fn test_summarize(value: Value, expected: &str) {
        assert_eq!(summarize(&value), expected);
    }

    #[test]
    fn test_default_addresses() {
        assert_eq!(default_address("tps546"), Some(0x24));
        assert_eq!(default_address("hbridge"), None);
    }
}
