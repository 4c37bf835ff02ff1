//! Command-line interface for periphery.
//!
//! Talks to a running daemon over the HTTP API to list drivers and devices
//! and to drive outputs. `scan` probes an I2C bus directly instead.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use periphery::api::v1::{
    DeviceListResponse, DeviceStatus, ErrorResponse, OutputStatus, SetOutputResponse,
};
use periphery::registry;
use periphery::tracing;
use periphery::transport::sim::SimBoard;

#[derive(Parser)]
#[command(name = "periphery-cli", version, about = "Query and drive a periphery daemon")]
struct Cli {
    /// Base URL of the daemon
    #[arg(long, default_value = "http://127.0.0.1:7785")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that the daemon is up
    Health,
    /// List the driver catalog
    Drivers,
    /// List attached devices with their latest readings
    Devices,
    /// Show one device
    Device { name: String },
    /// List settable outputs
    Outputs,
    /// Apply a setpoint to an output
    Set { output: String, value: f32 },
    /// Probe an I2C bus for responding addresses (the simulated board if no bus is given)
    Scan {
        #[arg(long)]
        bus: Option<u8>,
    },
}

struct Api {
    client: Client,
    base: String,
}

impl Api {
    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base.trim_end_matches('/'), path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.client.get(self.url(path)).send().await?;
        decode(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        let response = self.client.post(self.url(path)).json(&body).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    match response.json::<ErrorResponse>().await {
        Ok(body) => bail!("{status}: {}", body.error),
        Err(_) => bail!("{status}"),
    }
}

fn print_device(device: &DeviceStatus) {
    let reading = device
        .reading
        .as_ref()
        .map_or_else(|| "-".to_string(), Value::to_string);
    println!(
        "{:<12} {:<20} {:<6} {}",
        device.name,
        device.driver,
        device.address.as_deref().unwrap_or("-"),
        reading
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_stdout_quiet();
    let cli = Cli::parse();
    let api = Api {
        client: Client::new(),
        base: cli.url,
    };

    match cli.command {
        Command::Health => {
            let response = api.client.get(api.url("/health")).send().await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                bail!("{status}: {body}");
            }
            println!("{body}");
        }
        Command::Drivers => {
            let drivers: Vec<Value> = api.get("/drivers").await?;
            for driver in drivers {
                let addresses: Vec<String> = driver["addresses"]
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_u64).map(|a| format!("0x{a:02X}")).collect())
                    .unwrap_or_default();
                println!(
                    "{:<20} {:<12} {:<12} {:<7} {}",
                    driver["name"].as_str().unwrap_or_default(),
                    driver["part"].as_str().unwrap_or_default(),
                    driver["category"].as_str().unwrap_or_default(),
                    driver["interface"].as_str().unwrap_or_default(),
                    addresses.join(",")
                );
            }
        }
        Command::Devices => {
            let list: DeviceListResponse = api.get("/devices").await?;
            for device in &list.devices {
                print_device(device);
            }
            for failed in &list.failed_devices {
                println!("{:<12} {:<20} FAILED: {}", failed.name, failed.driver, failed.error);
            }
        }
        Command::Device { name } => {
            let device: DeviceStatus = api.get(&format!("/devices/{name}")).await?;
            println!("{}", serde_json::to_string_pretty(&device)?);
        }
        Command::Outputs => {
            let outputs: Vec<OutputStatus> = api.get("/outputs").await?;
            for output in outputs {
                let off = output.off.map(|off| format!(" (off: {off})")).unwrap_or_default();
                println!(
                    "{:<14} {:<12} {:<10} {}..={} {}{off}",
                    output.name, output.device, output.driver, output.min, output.max, output.unit
                );
            }
        }
        Command::Set { output, value } => {
            let set: SetOutputResponse = api
                .post(&format!("/outputs/{output}"), json!({ "value": value }))
                .await?;
            println!("{} = {} {} (requested {})", set.name, set.applied, set.unit, set.requested);
        }
        Command::Scan { bus } => {
            let hits = match bus {
                Some(bus) => scan_bus(bus).await?,
                None => registry::scan(&mut SimBoard::standard().i2c).await,
            };
            for hit in hits {
                println!("0x{:02X} {}", hit.address, hit.candidates.join(" "));
            }
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
async fn scan_bus(bus: u8) -> Result<Vec<registry::ScanHit>> {
    let mut i2c = periphery::transport::linux_i2c::LinuxI2c::open(bus)?;
    Ok(registry::scan(&mut i2c).await)
}

#[cfg(not(target_os = "linux"))]
async fn scan_bus(bus: u8) -> Result<Vec<registry::ScanHit>> {
    bail!("cannot open I2C bus {bus}: hardware buses are only supported on Linux")
}
