//! Driver walkthrough on the simulated board.
//!
//! Wires a handful of drivers by hand, the way an application would, and
//! prints what they report: sampled sensors with change observers, a servo
//! sweep, a motor ramp, a shift-register chaser, a radio exchange, the RTC
//! and some text on the OLED.

use anyhow::Result;
use clap::Parser;
use embedded_graphics::{
    mono_font::{ascii::FONT_6X10, MonoTextStyle},
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use std::time::Duration;
use time::macros::datetime;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use periphery::hw_trait::PinValue;
use periphery::peripheral::{
    analog_temperature::AnalogTemperature,
    bh1750::Bh1750,
    ds3231::Ds3231,
    hbridge::HBridgeMotor,
    nrf24l01::Nrf24l01,
    pca9685::{Pca9685, Servo, ServoLimits},
    sht4x::Sht4x,
    ssd1306::{DisplaySize, Ssd1306},
    x74595::X74595,
};
use periphery::sensor::start_updating;
use periphery::tracing::{self, prelude::*};
use periphery::transport::sim::{board, SimBoard};
use periphery::units::{Angle, Frequency};

#[derive(Parser)]
#[command(name = "periphery-demo", version, about = "Exercise the drivers on a simulated board")]
struct Args {
    /// How long to watch sampled sensors
    #[arg(long, default_value_t = 5)]
    seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_stdout_quiet();
    let args = Args::parse();
    let sim = SimBoard::standard();

    watch_sensors(&sim, Duration::from_secs(args.seconds)).await?;
    sweep_servo(&sim).await?;
    ramp_motor(&sim).await?;
    chase_leds(&sim).await?;
    radio_exchange(&sim).await?;
    set_clock(&sim).await?;
    greet_on_display(&sim).await?;
    Ok(())
}

/// Sample three sensors and print changes worth reporting.
async fn watch_sensors(sim: &SimBoard, duration: Duration) -> Result<()> {
    let tracker = TaskTracker::new();
    let running = CancellationToken::new();
    let interval = Duration::from_millis(250);

    let mut climate = Sht4x::with_address(sim.i2c.clone(), board::SHT4X_ADDRESS);
    climate.soft_reset().await?;
    let climate = start_updating(climate, interval, &tracker, &running);
    let mut light = Bh1750::with_address(sim.i2c.clone(), board::BH1750_ADDRESS);
    light.power_on().await?;
    let light = start_updating(light, interval, &tracker, &running);
    let probe = start_updating(AnalogTemperature::tmp36(sim.thermometer.clone()), interval, &tracker, &running);

    let mut climate_changes =
        climate.observe_filtered(|c| c.changed_by(|r| r.temperature.celsius(), 0.1));
    let mut light_changes = light.observe_filtered(|c| c.changed_by(|lux| lux.lux(), 5.0));
    let mut probe_changes = probe.subscribe();

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let mut step = 0;
    let mut drift = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = drift.tick() => {
                sim.drift(step);
                step += 1;
            }
            Some(change) = climate_changes.next() => {
                println!(
                    "climate: {:.2} {:.1} (was {})",
                    change.new.temperature,
                    change.new.humidity,
                    change.old.map_or("-".into(), |o| format!("{:.2}", o.temperature)),
                );
            }
            Some(change) = light_changes.next() => {
                println!("light:   {:.0}", change.new);
            }
            Some(change) = probe_changes.next() => {
                println!("probe:   {:.1}", change.new);
            }
        }
    }

    running.cancel();
    tracker.close();
    tracker.wait().await;
    Ok(())
}

async fn sweep_servo(sim: &SimBoard) -> Result<()> {
    let mut controller = Pca9685::new(sim.i2c.clone(), board::PCA9685_ADDRESS);
    controller.init(Frequency::from_hertz(50.0)).await?;
    let mut servo = Servo::new(controller.into_shared(), 0, ServoLimits::default())?;
    for degrees in [0.0, 45.0, 90.0, 135.0, 180.0] {
        servo.set_angle(Angle::from_degrees(degrees)).await?;
        let off = sim.pca9685.lock().slice(0x08, 2);
        println!("servo:   {degrees:>5.1}° -> OFF tick {}", u16::from_le_bytes([off[0], off[1]]));
    }
    servo.release().await?;
    Ok(())
}

async fn ramp_motor(sim: &SimBoard) -> Result<()> {
    let mut motor = HBridgeMotor::new(sim.motor_pwm.clone(), sim.motor_a.clone(), sim.motor_b.clone()).await?;
    for speed in [0.25, 0.5, 1.0, -0.5] {
        motor.set_speed(speed).await?;
        println!("motor:   {:+.2} {:?}", motor.speed(), motor.state());
    }
    motor.brake().await?;
    println!("motor:   {:?}", motor.state());
    Ok(())
}

async fn chase_leds(sim: &SimBoard) -> Result<()> {
    let mut chain = X74595::new(sim.shift_spi.clone(), 1)?;
    for pin in 0..chain.pin_count() {
        chain.clear().await?;
        chain.write_pin(pin, PinValue::High).await?;
    }
    let frames = sim.shift.lock().frames.len();
    println!("leds:    {frames} latches");
    Ok(())
}

async fn radio_exchange(sim: &SimBoard) -> Result<()> {
    let mut radio = Nrf24l01::new(sim.radio_spi.clone(), sim.radio_ce.clone());
    radio.init().await?;
    radio.set_channel(76).await?;
    radio.set_payload_width(8).await?;
    radio.set_tx_address(b"BASE1").await?;

    radio.transmit(b"hello").await?;
    println!("radio:   sent {} packet(s)", sim.radio.lock().sent().len());

    radio.start_listening().await?;
    sim.radio.lock().inject_rx(0, b"pong\0\0\0\0");
    if let Some(packet) = radio.receive().await? {
        println!("radio:   received {} on pipe {}", hex::encode(&packet.data), packet.pipe);
    }
    radio.stop_listening().await?;
    radio.power_down().await?;
    Ok(())
}

async fn set_clock(sim: &SimBoard) -> Result<()> {
    let mut rtc = Ds3231::new(sim.i2c.clone());
    if rtc.oscillator_stopped().await? {
        warn!("RTC oscillator was stopped");
        rtc.enable_oscillator().await?;
    }
    rtc.set_datetime(datetime!(2024-06-01 12:30:00)).await?;
    println!("rtc:     {} at {:.2}", rtc.datetime().await?, rtc.temperature().await?);
    Ok(())
}

async fn greet_on_display(sim: &SimBoard) -> Result<()> {
    let mut display = Ssd1306::new(sim.i2c.clone(), board::SSD1306_ADDRESS, DisplaySize::Size128x64);
    display.init().await?;
    let style = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
    Text::with_baseline("periphery", Point::zero(), style, Baseline::Top)
        .draw(&mut display)
        .unwrap_or_else(|never| match never {});
    display.flush().await?;
    println!("display: {} pixels lit", sim.ssd1306.lock().lit_pixels());
    Ok(())
}
