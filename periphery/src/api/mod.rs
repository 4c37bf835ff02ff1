//! HTTP API server.
//!
//! This module implements the REST API for monitoring attached devices and
//! driving their outputs. Built on Axum, versioned routes live under
//! `/api/v1`.

pub mod v1;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

pub use v1::AppState;

/// The full router: versioned routes with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", v1::routes(state))
        .layer(TraceLayer::new_for_http())
}

/// Bind `listen` and serve until `shutdown` is cancelled.
pub async fn serve(listen: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| Error::Api(format!("failed to bind {listen}: {e}")))?;
    serve_on(listener, state, shutdown).await
}

/// Serve on an already bound listener until `shutdown` is cancelled.
pub async fn serve_on(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    info!("API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    debug!("API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{self, Actuator, OutputActuator};
    use crate::hw_trait::PinValue;
    use crate::peripheral::pmbus::{commands, operation};
    use crate::peripheral::tps546::{self, Tps546, Tps546Config};
    use crate::sensor::ReadingSource;
    use crate::transport::sim::{chips::Tps546Sim, SimI2cBus, SimPin};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::ops::RangeInclusive;
    use std::sync::Arc;
    use v1::{DeviceEntry, DeviceListResponse, FailedDeviceStatus, OutputStatus, SetOutputResponse};

    struct FixedReading;

    impl ReadingSource for FixedReading {
        fn driver(&self) -> &'static str {
            "bh1750"
        }

        fn latest_json(&self) -> Option<Value> {
            Some(json!(321.5))
        }

        fn is_updating(&self) -> bool {
            true
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl Actuator for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn unit(&self) -> &'static str {
            "V"
        }

        fn range(&self) -> RangeInclusive<f32> {
            0.0..=5.0
        }

        async fn apply(&mut self, _value: f32) -> anyhow::Result<f32> {
            anyhow::bail!("bus stuck")
        }
    }

    async fn spawn_server(state: AppState) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve_on(listener, state, shutdown.clone()));
        (addr, shutdown)
    }

    async fn populated() -> (AppState, SimPin) {
        let state = AppState::new();
        let pin = SimPin::default();
        state
            .register_device(
                "light".into(),
                DeviceEntry {
                    driver: "bh1750",
                    address: Some(0x23),
                    source: Some(Arc::new(FixedReading)),
                    outputs: vec![],
                },
            )
            .await;
        state
            .register_device(
                "leds".into(),
                DeviceEntry {
                    driver: "x74595",
                    address: None,
                    source: None,
                    outputs: vec!["leds.0".into()],
                },
            )
            .await;
        state
            .register_output(
                "leds.0".into(),
                "leds",
                actuator::shared(OutputActuator::new("x74595", pin.clone())),
            )
            .await;
        state
            .register_output("rail".into(), "leds", actuator::shared(Broken))
            .await;
        state
            .register_failed_device(FailedDeviceStatus {
                name: "ghost".into(),
                driver: "sht4x".into(),
                error: "I2C NACK at 0x45".into(),
            })
            .await;
        (state, pin)
    }

    #[tokio::test]
    async fn test_health_and_echo() {
        let (addr, shutdown) = spawn_server(AppState::new()).await;
        let client = reqwest::Client::new();

        let body = client
            .get(format!("http://{addr}/api/v1/health"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "OK");

        let echoed: Value = client
            .post(format!("http://{addr}/api/v1/echo"))
            .json(&json!({ "message": "ping" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(echoed, json!({ "message": "ping" }));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_driver_catalog() {
        let (addr, shutdown) = spawn_server(AppState::new()).await;
        let drivers: Vec<Value> = reqwest::get(format!("http://{addr}/api/v1/drivers"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let sht = drivers.iter().find(|d| d["name"] == "sht4x").unwrap();
        assert_eq!(sht["category"], "sensor");
        assert_eq!(sht["interface"], "i2c");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_devices() {
        let (state, _pin) = populated().await;
        let (addr, shutdown) = spawn_server(state).await;

        let list: DeviceListResponse = reqwest::get(format!("http://{addr}/api/v1/devices"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let names: Vec<_> = list.devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["leds", "light"]);
        assert_eq!(list.failed_devices[0].name, "ghost");

        let light: Value = reqwest::get(format!("http://{addr}/api/v1/devices/light"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(light["address"], "0x23");
        assert_eq!(light["reading"], 321.5);
        assert_eq!(light["updating"], true);

        let missing = reqwest::get(format!("http://{addr}/api/v1/devices/nope"))
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_set_output() {
        let (state, pin) = populated().await;
        let (addr, shutdown) = spawn_server(state).await;
        let client = reqwest::Client::new();
        let url = |name: &str| format!("http://{addr}/api/v1/outputs/{name}");

        let outputs: Vec<OutputStatus> = client
            .get(format!("http://{addr}/api/v1/outputs"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].name, "leds.0");
        assert_eq!(outputs[0].unit, "level");

        let response = client
            .post(url("leds.0"))
            .json(&json!({ "value": 1.0 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let set: SetOutputResponse = response.json().await.unwrap();
        assert_eq!(set.applied, 1.0);
        assert_eq!(pin.value(), PinValue::High);

        let status = |r: reqwest::Response| r.status();
        let out_of_range = client.post(url("leds.0")).json(&json!({ "value": 2.0 })).send().await.unwrap();
        assert_eq!(status(out_of_range), reqwest::StatusCode::BAD_REQUEST);
        let unknown = client.post(url("nope")).json(&json!({ "value": 0.0 })).send().await.unwrap();
        assert_eq!(status(unknown), reqwest::StatusCode::NOT_FOUND);
        let failing = client.post(url("rail")).json(&json!({ "value": 1.0 })).send().await.unwrap();
        assert_eq!(status(failing), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_regulator_turns_off_at_zero() {
        let bus = SimI2cBus::new();
        let sim = bus.attach(tps546::DEFAULT_ADDRESS, Tps546Sim::new(5.0, 1.15, 8.0, 45.0));
        let mut regulator = Tps546::new(bus, Tps546Config::default());
        regulator.init().await.unwrap();
        let state = AppState::new();
        state
            .register_output("core".into(), "core", actuator::shared(regulator))
            .await;
        let (addr, shutdown) = spawn_server(state).await;
        let client = reqwest::Client::new();
        let url = format!("http://{addr}/api/v1/outputs/core");
        let operation_reg = || sim.lock().registers().get(commands::OPERATION).map(<[u8]>::to_vec);

        let outputs: Vec<OutputStatus> = client
            .get(format!("http://{addr}/api/v1/outputs"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(outputs[0].off, Some(0.0));

        let on = client.post(&url).json(&json!({ "value": 1.2 })).send().await.unwrap();
        assert_eq!(on.status(), reqwest::StatusCode::OK);
        assert_eq!(operation_reg(), Some(vec![operation::ON]));

        let off = client.post(&url).json(&json!({ "value": 0.0 })).send().await.unwrap();
        assert_eq!(off.status(), reqwest::StatusCode::OK);
        let set: SetOutputResponse = off.json().await.unwrap();
        assert_eq!(set.applied, 0.0);
        assert_eq!(operation_reg(), Some(vec![operation::OFF_IMMEDIATE]));

        let below = client.post(&url).json(&json!({ "value": 0.5 })).send().await.unwrap();
        assert_eq!(below.status(), reqwest::StatusCode::BAD_REQUEST);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unregister_removes_outputs() {
        let (state, _pin) = populated().await;
        state.unregister_device("leds").await;
        assert!(state.device_status("leds").await.is_none());
        assert!(!state.outputs.read().await.contains_key("leds.0"));
        assert!(state.outputs.read().await.contains_key("rail"));
    }
}
