//! Sampling sensors and change notification.
//!
//! A driver that produces readings implements [`Sensor`]. Handing it to
//! [`start_updating`] moves it onto its own task, which samples on a fixed
//! interval, keeps the latest reading in a `watch` channel, and broadcasts
//! every sample to observers as a [`ChangeResult`] carrying the previous
//! reading alongside the new one.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::tracing::prelude::*;

/// Broadcast capacity per sensor. Slow observers lag rather than block.
const EVENT_CAPACITY: usize = 32;

/// A driver that produces typed readings.
#[async_trait]
pub trait Sensor: Send + 'static {
    type Reading: Clone + Debug + Serialize + Send + Sync + 'static;

    /// Short driver name used in logs and the API.
    fn name(&self) -> &'static str;

    async fn read(&mut self) -> anyhow::Result<Self::Reading>;
}

/// A new reading and the one before it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeResult<T> {
    pub new: T,
    pub old: Option<T>,
}

impl<T> ChangeResult<T> {
    /// True on the first reading, or when `key` moved by more than `threshold`.
    pub fn changed_by(&self, key: impl Fn(&T) -> f64, threshold: f64) -> bool {
        match &self.old {
            None => true,
            Some(old) => (key(&self.new) - key(old)).abs() > threshold,
        }
    }
}

type Filter<R> = Box<dyn Fn(&ChangeResult<R>) -> bool + Send + Sync>;

/// Receives change notifications from one sensor.
pub struct Observer<R> {
    name: &'static str,
    rx: broadcast::Receiver<ChangeResult<R>>,
    filter: Option<Filter<R>>,
    cancel: CancellationToken,
}

impl<R: Clone + Send + 'static> Observer<R> {
    /// Wait for the next change accepted by this observer's filter.
    ///
    /// Returns `None` once the sensor has stopped updating and every
    /// buffered change has been delivered.
    pub async fn next(&mut self) -> Option<ChangeResult<R>> {
        loop {
            let received = tokio::select! {
                biased;
                received = self.rx.recv() => received,
                _ = self.cancel.cancelled() => return None,
            };

            match received {
                Ok(change) => {
                    if self.filter.as_ref().map_or(true, |accept| accept(&change)) {
                        return Some(change);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(sensor = self.name, missed, "Observer lagged, skipping changes");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Handle onto a sensor that is being sampled.
pub struct SensorHandle<R> {
    name: &'static str,
    latest: watch::Receiver<Option<R>>,
    events: broadcast::Sender<ChangeResult<R>>,
    cancel: CancellationToken,
}

impl<R: Clone + Send + Sync + 'static> SensorHandle<R> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Most recent successful reading, if any.
    pub fn latest(&self) -> Option<R> {
        self.latest.borrow().clone()
    }

    /// Wait until a reading newer than the last one seen by this call arrives.
    pub async fn changed(&mut self) -> Option<R> {
        self.latest.changed().await.ok()?;
        self.latest.borrow_and_update().clone()
    }

    /// Observe every change.
    pub fn subscribe(&self) -> Observer<R> {
        Observer {
            name: self.name,
            rx: self.events.subscribe(),
            filter: None,
            cancel: self.cancel.clone(),
        }
    }

    /// Observe only changes accepted by `filter`.
    pub fn observe_filtered<F>(&self, filter: F) -> Observer<R>
    where
        F: Fn(&ChangeResult<R>) -> bool + Send + Sync + 'static,
    {
        Observer {
            filter: Some(Box::new(filter)),
            ..self.subscribe()
        }
    }

    /// Stop sampling this sensor. Other sensors are unaffected.
    pub fn stop_updating(&self) {
        self.cancel.cancel();
    }

    pub fn is_updating(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

/// Start sampling `sensor` every `interval` on a task owned by `tracker`.
///
/// Cancelling `shutdown` stops the task as well as [`SensorHandle::stop_updating`].
/// Failed reads are logged and sampling continues.
pub fn start_updating<S: Sensor>(
    mut sensor: S,
    interval: Duration,
    tracker: &TaskTracker,
    shutdown: &CancellationToken,
) -> SensorHandle<S::Reading> {
    let name = sensor.name();
    let cancel = shutdown.child_token();
    let (latest_tx, latest_rx) = watch::channel(None);
    let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

    let task_cancel = cancel.clone();
    let task_events = events_tx.clone();
    tracker.spawn(async move {
        debug!(sensor = name, ?interval, "Started updating");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous: Option<S::Reading> = None;

        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match sensor.read().await {
                Ok(reading) => {
                    trace!(sensor = name, ?reading, "Sampled");
                    let change = ChangeResult {
                        new: reading.clone(),
                        old: previous.replace(reading.clone()),
                    };
                    latest_tx.send_replace(Some(reading));
                    // No observers is not an error.
                    let _ = task_events.send(change);
                }
                Err(e) => {
                    warn!(sensor = name, error = %e, "Sensor read failed");
                }
            }
        }

        debug!(sensor = name, "Stopped updating");
    });

    SensorHandle {
        name,
        latest: latest_rx,
        events: events_tx,
        cancel,
    }
}

/// A sensor that is also used elsewhere, for example as an actuator.
///
/// Each sample locks the shared driver for the duration of the read.
pub struct SharedSensor<S> {
    name: &'static str,
    inner: Arc<Mutex<S>>,
}

impl<S: Sensor> SharedSensor<S> {
    pub fn new(sensor: S) -> Self {
        Self {
            name: sensor.name(),
            inner: Arc::new(Mutex::new(sensor)),
        }
    }

    /// The shared driver.
    pub fn driver(&self) -> Arc<Mutex<S>> {
        self.inner.clone()
    }
}

#[async_trait]
impl<S: Sensor> Sensor for SharedSensor<S> {
    type Reading = S::Reading;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn read(&mut self) -> anyhow::Result<S::Reading> {
        self.inner.lock().await.read().await
    }
}

/// Type-erased view of a sensor handle, for the API.
pub trait ReadingSource: Send + Sync {
    fn driver(&self) -> &'static str;

    fn latest_json(&self) -> Option<serde_json::Value>;

    fn is_updating(&self) -> bool;
}

impl<R> ReadingSource for SensorHandle<R>
where
    R: Clone + Serialize + Send + Sync + 'static,
{
    fn driver(&self) -> &'static str {
        self.name
    }

    fn latest_json(&self) -> Option<serde_json::Value> {
        let latest = self.latest()?;
        match serde_json::to_value(latest) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(sensor = self.name, error = %e, "Failed to serialize reading");
                None
            }
        }
    }

    fn is_updating(&self) -> bool {
        SensorHandle::is_updating(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    /// Counts up by one each read, failing on multiples of `fail_every`.
    struct Counter {
        value: i32,
        fail_every: Option<i32>,
    }

    #[async_trait]
    impl Sensor for Counter {
        type Reading = i32;

        fn name(&self) -> &'static str {
            "counter"
        }

        async fn read(&mut self) -> anyhow::Result<i32> {
            self.value += 1;
            if let Some(n) = self.fail_every {
                if self.value % n == 0 {
                    bail!("simulated failure");
                }
            }
            Ok(self.value)
        }
    }

    fn counter() -> Counter {
        Counter { value: 0, fail_every: None }
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_old_and_new() {
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let handle = start_updating(counter(), Duration::from_millis(100), &tracker, &shutdown);
        let mut observer = handle.subscribe();

        let first = observer.next().await.unwrap();
        assert_eq!(first, ChangeResult { new: 1, old: None });
        let second = observer.next().await.unwrap();
        assert_eq!(second, ChangeResult { new: 2, old: Some(1) });
        assert_eq!(handle.latest(), Some(2));

        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_filtered_observer_skips_rejected_changes() {
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let handle = start_updating(counter(), Duration::from_millis(10), &tracker, &shutdown);
        let mut evens = handle.observe_filtered(|c| c.new % 2 == 0);

        assert_eq!(evens.next().await.unwrap().new, 2);
        assert_eq!(evens.next().await.unwrap().new, 4);

        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reads_do_not_stop_sampling() {
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let sensor = Counter { value: 0, fail_every: Some(2) };
        let handle = start_updating(sensor, Duration::from_millis(10), &tracker, &shutdown);
        let mut observer = handle.subscribe();

        assert_eq!(observer.next().await.unwrap(), ChangeResult { new: 1, old: None });
        // 2 fails; the previous reading carries over.
        assert_eq!(observer.next().await.unwrap(), ChangeResult { new: 3, old: Some(1) });

        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_updating_ends_observers() {
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let handle = start_updating(counter(), Duration::from_millis(10), &tracker, &shutdown);
        let mut observer = handle.subscribe();
        observer.next().await.unwrap();

        handle.stop_updating();
        assert!(!handle.is_updating());
        while observer.next().await.is_some() {}

        tracker.close();
        tracker.wait().await;
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_json_for_api() {
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let mut handle = start_updating(counter(), Duration::from_millis(10), &tracker, &shutdown);
        assert_eq!(handle.latest_json(), None);

        handle.changed().await.unwrap();
        let source: &dyn ReadingSource = &handle;
        assert_eq!(source.driver(), "counter");
        assert!(source.latest_json().is_some());

        shutdown.cancel();
    }

    #[test]
    fn test_changed_by_threshold() {
        let first = ChangeResult { new: 20.0, old: None };
        assert!(first.changed_by(|t: &f64| *t, 0.5));
        let small = ChangeResult { new: 20.2, old: Some(20.0) };
        assert!(!small.changed_by(|t: &f64| *t, 0.5));
        let large = ChangeResult { new: 21.0, old: Some(20.0) };
        assert!(large.changed_by(|t: &f64| *t, 0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_sensor_reads_through_lock() {
        let shared = SharedSensor::new(counter());
        let driver = shared.driver();
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let mut handle = start_updating(shared, Duration::from_millis(10), &tracker, &shutdown);

        assert_eq!(handle.name(), "counter");
        assert_eq!(handle.changed().await, Some(1));
        // Reads made by another owner advance the same driver.
        driver.lock().await.value += 10;
        assert_eq!(handle.changed().await, Some(12));

        shutdown.cancel();
    }
}
