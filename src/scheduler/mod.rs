//! Scheduler module: owns the device registry and the shared status
//! store, drives periodic and on-demand poll cycles, and bounds the
//! number of simultaneous outbound connections.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::db::{self, Device, DbError, EnergyMetrics, EnergySample, SampleStore, UpsStatus};
use crate::normalize::normalize;
use crate::protocol;

/// Registry error types.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("device capacity {0} reached")]
    CapacityReached(usize),
    #[error("duplicate device id {0}")]
    DuplicateId(i64),
    #[error("unknown device {0}")]
    UnknownDevice(i64),
}

/// Emitted after every completed poll, success or failure. The alerting
/// collaborator diffs consecutive snapshots itself.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub device_id: i64,
    pub status: UpsStatus,
}

/// Terminal state of one poll, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollOutcome {
    Succeeded,
    FailedTimeout,
    FailedProtocol,
}

/// Slack on top of the per-poll timeout before the scheduler gives up on
/// a poll task; covers the start jitter so clients enforce their own
/// tighter bounds first.
const POLL_GRACE: Duration = Duration::from_secs(1);

struct Inner {
    config: EngineConfig,
    store: Arc<SampleStore>,
    devices: RwLock<HashMap<i64, Device>>,
    statuses: RwLock<HashMap<i64, UpsStatus>>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
    cycle_running: AtomicBool,
    in_flight: Mutex<HashSet<i64>>,
    semaphore: Arc<Semaphore>,
    next_id: AtomicI64,
    stop: Mutex<Option<broadcast::Sender<()>>>,
    events: broadcast::Sender<StatusEvent>,
}

/// The polling engine.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a stopped scheduler over the given sample store.
    pub fn new(config: EngineConfig, store: Arc<SampleStore>) -> Self {
        let (events, _) = broadcast::channel(64);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_polls));

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                devices: RwLock::new(HashMap::new()),
                statuses: RwLock::new(HashMap::new()),
                last_refresh: RwLock::new(None),
                cycle_running: AtomicBool::new(false),
                in_flight: Mutex::new(HashSet::new()),
                semaphore,
                next_id: AtomicI64::new(1),
                stop: Mutex::new(None),
                events,
            }),
        }
    }

    // --- Registry ---

    /// Register a device. An id of 0 gets the next free id assigned.
    pub async fn add_device(&self, mut device: Device) -> Result<Device, RegistryError> {
        let mut devices = self.inner.devices.write().await;

        if devices.len() >= self.inner.config.max_devices {
            return Err(RegistryError::CapacityReached(self.inner.config.max_devices));
        }

        if device.id == 0 {
            device.id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        } else {
            if devices.contains_key(&device.id) {
                return Err(RegistryError::DuplicateId(device.id));
            }
            // Keep the counter ahead of explicitly chosen ids.
            self.inner.next_id.fetch_max(device.id + 1, Ordering::SeqCst);
        }

        tracing::info!(device = %device.name, id = device.id, "Scheduler: adding device");
        devices.insert(device.id, device.clone());
        Ok(device)
    }

    /// Replace an existing device's configuration.
    pub async fn update_device(&self, device: Device) -> Result<(), RegistryError> {
        let mut devices = self.inner.devices.write().await;
        match devices.get_mut(&device.id) {
            Some(slot) => {
                *slot = device;
                Ok(())
            }
            None => Err(RegistryError::UnknownDevice(device.id)),
        }
    }

    /// Remove a device, its status entry, and its sample series.
    pub async fn remove_device(&self, id: i64) -> Result<(), RegistryError> {
        let removed = self.inner.devices.write().await.remove(&id);
        if removed.is_none() {
            return Err(RegistryError::UnknownDevice(id));
        }

        self.inner.statuses.write().await.remove(&id);
        if let Err(e) = self.inner.store.delete_samples(id) {
            tracing::error!("Scheduler: failed to delete samples for device {}: {}", id, e);
        }
        tracing::info!("Scheduler: removed device {}", id);
        Ok(())
    }

    /// All registered devices, ordered by id.
    pub async fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.inner.devices.read().await.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        devices
    }

    pub async fn device(&self, id: i64) -> Option<Device> {
        self.inner.devices.read().await.get(&id).cloned()
    }

    // --- Status reads (snapshot-consistent copies) ---

    pub async fn status(&self, id: i64) -> Option<UpsStatus> {
        self.inner.statuses.read().await.get(&id).cloned()
    }

    pub async fn statuses(&self) -> HashMap<i64, UpsStatus> {
        self.inner.statuses.read().await.clone()
    }

    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_refresh.read().await
    }

    pub fn is_cycle_running(&self) -> bool {
        self.inner.cycle_running.load(Ordering::SeqCst)
    }

    /// Subscribe to per-poll status events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    /// Aggregate a device's energy samples over a time range.
    pub fn metrics(
        &self,
        device_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<EnergyMetrics, DbError> {
        db::query_metrics(&self.inner.store, device_id, start, end)
    }

    // --- Lifecycle ---

    /// Start the periodic poll timer. A no-op when already running.
    pub async fn start(&self) {
        let mut stop_guard = self.inner.stop.lock().await;
        if stop_guard.is_some() {
            tracing::debug!("Scheduler: start called while running, ignoring");
            return;
        }

        let (stop_tx, _) = broadcast::channel(1);
        *stop_guard = Some(stop_tx.clone());
        drop(stop_guard);

        tracing::info!(
            interval = ?self.inner.config.poll_interval,
            cap = self.inner.config.max_concurrent_polls,
            "Scheduler: starting"
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut stop_rx = stop_tx.subscribe();
            let mut interval = tokio::time::interval(inner.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        run_cycle(&inner).await;
                    }
                }
            }
            tracing::info!("Scheduler: stopped");
        });
    }

    /// Stop the periodic timer. In-flight polls finish naturally.
    pub async fn stop(&self) {
        let mut stop_guard = self.inner.stop.lock().await;
        if let Some(stop_tx) = stop_guard.take() {
            let _ = stop_tx.send(());
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.stop.lock().await.is_some()
    }

    /// Run one poll cycle immediately and wait for it to complete.
    pub async fn refresh_now(&self) {
        run_cycle(&self.inner).await;
    }
}

/// One poll cycle: fan out one bounded poll task per enabled device and
/// wait for all of them.
async fn run_cycle(inner: &Arc<Inner>) {
    if inner.cycle_running.swap(true, Ordering::SeqCst) {
        tracing::debug!("Scheduler: poll cycle already in progress, skipping");
        return;
    }

    let devices: Vec<Device> = inner
        .devices
        .read()
        .await
        .values()
        .filter(|d| d.enabled)
        .cloned()
        .collect();

    let mut polls = JoinSet::new();
    for device in devices {
        {
            let mut in_flight = inner.in_flight.lock().await;
            if !in_flight.insert(device.id) {
                tracing::warn!(
                    device = %device.name,
                    "Scheduler: previous poll still in flight, skipping"
                );
                continue;
            }
        }

        let inner = inner.clone();
        polls.spawn(async move {
            // The permit is the admission gate; held for the whole poll
            // and released on every exit path.
            let Ok(_permit) = inner.semaphore.clone().acquire_owned().await else {
                inner.in_flight.lock().await.remove(&device.id);
                return;
            };
            poll_one(&inner, &device).await;
            inner.in_flight.lock().await.remove(&device.id);
        });
    }

    while polls.join_next().await.is_some() {}

    *inner.last_refresh.write().await = Some(Utc::now());
    inner.cycle_running.store(false, Ordering::SeqCst);
}

/// Poll a single device and record the outcome.
///
/// Any failure means "offline this cycle": the snapshot keeps the last
/// observed numerics, the reason is recorded, and no sample is appended.
async fn poll_one(inner: &Inner, device: &Device) {
    let timeout = inner.config.poll_timeout;
    let result = tokio::time::timeout(
        timeout + POLL_GRACE,
        protocol::poll_device(device, timeout),
    )
    .await;

    let (status, outcome) = match result {
        Ok(Ok(raw)) => (normalize(device, &raw, Utc::now()), PollOutcome::Succeeded),
        Ok(Err(err)) => {
            let outcome = if err.is_timeout() {
                PollOutcome::FailedTimeout
            } else {
                PollOutcome::FailedProtocol
            };
            let prev = inner.statuses.read().await.get(&device.id).cloned();
            (
                UpsStatus::offline_from(prev.as_ref(), device.id, &err.to_string(), Utc::now()),
                outcome,
            )
        }
        Err(_) => {
            let reason = format!("poll timed out after {:?}", timeout);
            let prev = inner.statuses.read().await.get(&device.id).cloned();
            (
                UpsStatus::offline_from(prev.as_ref(), device.id, &reason, Utc::now()),
                PollOutcome::FailedTimeout,
            )
        }
    };

    match outcome {
        PollOutcome::Succeeded => {
            tracing::debug!(device = %device.name, "poll succeeded");
            if let Some(sample) = EnergySample::from_status(&status) {
                if let Err(e) = inner.store.add_sample(&sample) {
                    tracing::error!("failed to append sample for {}: {}", device.name, e);
                }
            }
        }
        PollOutcome::FailedTimeout | PollOutcome::FailedProtocol => {
            tracing::warn!(
                device = %device.name,
                reason = status.last_failure.as_deref().unwrap_or("unknown"),
                "poll failed"
            );
        }
    }

    inner.statuses.write().await.insert(device.id, status.clone());
    let _ = inner.events.send(StatusEvent {
        device_id: device.id,
        status,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Protocol;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tempfile::NamedTempFile;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    const VAR_BLOCK: &str = concat!(
        "BEGIN LIST VAR u\n",
        "VAR u battery.charge \"87\"\n",
        "VAR u ups.load \"30\"\n",
        "VAR u ups.realpower \"120\"\n",
        "VAR u input.voltage \"230\"\n",
        "VAR u output.voltage \"229\"\n",
        "VAR u ups.status \"OL\"\n",
        "END LIST VAR u\n"
    );

    async fn handle_conn(stream: TcpStream, delay: Duration, gauge: Option<Arc<Gauge>>) {
        if let Some(g) = &gauge {
            g.enter();
        }
        let (read_half, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.starts_with("LIST VAR") {
                tokio::time::sleep(delay).await;
                if writer.write_all(VAR_BLOCK.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
        if let Some(g) = &gauge {
            g.exit();
        }
    }

    /// Concurrency gauge: tracks current and peak overlapping connections.
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// NUT server that keeps accepting connections until dropped.
    async fn spawn_nut_server(delay: Duration, gauge: Option<Arc<Gauge>>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_conn(stream, delay, gauge.clone()));
            }
        });
        addr
    }

    fn nut_device(id: i64, name: &str, addr: SocketAddr) -> Device {
        Device {
            id,
            name: name.to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            protocol: Protocol::Nut,
            ups_name: "u".to_string(),
            ..Default::default()
        }
    }

    fn test_scheduler(max_concurrent_polls: usize) -> (Scheduler, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(SampleStore::new(tmp.path()).unwrap());
        let config = EngineConfig {
            poll_timeout: Duration::from_secs(1),
            max_concurrent_polls,
            ..Default::default()
        };
        (Scheduler::new(config, store), tmp)
    }

    #[tokio::test]
    async fn test_registry_capacity() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(SampleStore::new(tmp.path()).unwrap());
        let config = EngineConfig {
            max_devices: 2,
            ..Default::default()
        };
        let scheduler = Scheduler::new(config, store);

        let device = Device {
            name: "a".to_string(),
            host: "localhost".to_string(),
            ..Default::default()
        };
        scheduler.add_device(device.clone()).await.unwrap();
        scheduler.add_device(device.clone()).await.unwrap();
        let err = scheduler.add_device(device).await.unwrap_err();
        assert!(matches!(err, RegistryError::CapacityReached(2)));
    }

    #[tokio::test]
    async fn test_registry_id_assignment() {
        let (scheduler, _tmp) = test_scheduler(4);

        let a = scheduler
            .add_device(Device {
                name: "a".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(a.id, 1);

        let explicit = scheduler
            .add_device(Device {
                id: 10,
                name: "b".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(explicit.id, 10);

        let err = scheduler
            .add_device(Device {
                id: 10,
                name: "dup".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(10)));

        // The counter stays ahead of explicit ids.
        let c = scheduler
            .add_device(Device {
                name: "c".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(c.id, 11);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_works() {
        let (scheduler, _tmp) = test_scheduler(4);

        assert!(!scheduler.is_running().await);
        scheduler.start().await;
        assert!(scheduler.is_running().await);
        scheduler.start().await; // no-op
        assert!(scheduler.is_running().await);

        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn test_failed_poll_does_not_touch_siblings() {
        let (scheduler, _tmp) = test_scheduler(4);

        let good_addr = spawn_nut_server(Duration::ZERO, None).await;
        scheduler
            .add_device(nut_device(1, "good", good_addr))
            .await
            .unwrap();

        // A listener that is gone before the poll: connect refused.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        scheduler
            .add_device(nut_device(2, "dead", dead_addr))
            .await
            .unwrap();

        scheduler.refresh_now().await;

        let good = scheduler.status(1).await.unwrap();
        assert!(good.is_online);
        assert_eq!(good.battery_charge_pct, Some(87.0));
        assert_eq!(good.last_failure, None);

        let dead = scheduler.status(2).await.unwrap();
        assert!(!dead.is_online);
        assert!(dead.last_failure.is_some());
        assert_eq!(dead.battery_charge_pct, None);

        // Only the successful poll appended a sample.
        assert_eq!(scheduler.inner.store.sample_count(1).unwrap(), 1);
        assert_eq!(scheduler.inner.store.sample_count(2).unwrap(), 0);

        assert!(scheduler.last_refresh().await.is_some());
        assert!(!scheduler.is_cycle_running());
    }

    #[tokio::test]
    async fn test_concurrency_bound_holds() {
        let cap = 2;
        let (scheduler, _tmp) = test_scheduler(cap);

        let gauge = Arc::new(Gauge::new());
        for i in 0..5 {
            let addr = spawn_nut_server(Duration::from_millis(150), Some(gauge.clone())).await;
            scheduler
                .add_device(nut_device(i + 1, &format!("ups-{i}"), addr))
                .await
                .unwrap();
        }

        scheduler.refresh_now().await;

        // Every device polled, never more than `cap` at once.
        for i in 1..=5 {
            assert!(scheduler.status(i).await.unwrap().is_online);
        }
        assert!(gauge.peak.load(Ordering::SeqCst) <= cap);
    }

    #[tokio::test]
    async fn test_repeated_failures_stay_offline_without_growth() {
        let (scheduler, _tmp) = test_scheduler(4);

        // First a successful poll to seed numerics.
        let addr = spawn_nut_server(Duration::ZERO, None).await;
        let mut device = nut_device(1, "flaky", addr);
        scheduler.add_device(device.clone()).await.unwrap();
        scheduler.refresh_now().await;

        let online = scheduler.status(1).await.unwrap();
        assert!(online.is_online);
        let seeded_charge = online.battery_charge_pct;
        assert_eq!(seeded_charge, Some(87.0));

        // Point the device at a dead port and fail five cycles in a row.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        device.host = dead_addr.ip().to_string();
        device.port = dead_addr.port();
        scheduler.update_device(device).await.unwrap();

        for _ in 0..5 {
            scheduler.refresh_now().await;
            let status = scheduler.status(1).await.unwrap();
            assert!(!status.is_online);
            // Last observed numerics carried, never zeroed.
            assert_eq!(status.battery_charge_pct, seeded_charge);
        }

        // Failed polls never append samples.
        assert_eq!(scheduler.inner.store.sample_count(1).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_successful_polls_advance_last_update() {
        let (scheduler, _tmp) = test_scheduler(4);
        let addr = spawn_nut_server(Duration::ZERO, None).await;
        scheduler.add_device(nut_device(1, "ups", addr)).await.unwrap();

        scheduler.refresh_now().await;
        let first = scheduler.status(1).await.unwrap();
        assert!(first.is_online);

        scheduler.refresh_now().await;
        let second = scheduler.status(1).await.unwrap();
        assert!(second.is_online);
        assert!(second.last_update > first.last_update);
    }

    #[tokio::test]
    async fn test_remove_device_drops_status_and_samples() {
        let (scheduler, _tmp) = test_scheduler(4);
        let addr = spawn_nut_server(Duration::ZERO, None).await;
        scheduler.add_device(nut_device(1, "ups", addr)).await.unwrap();

        scheduler.refresh_now().await;
        assert!(scheduler.status(1).await.is_some());
        assert_eq!(scheduler.inner.store.sample_count(1).unwrap(), 1);

        scheduler.remove_device(1).await.unwrap();
        assert!(scheduler.status(1).await.is_none());
        assert!(scheduler.devices().await.is_empty());
        assert_eq!(scheduler.inner.store.sample_count(1).unwrap(), 0);

        let err = scheduler.remove_device(1).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDevice(1)));
    }

    #[tokio::test]
    async fn test_disabled_devices_are_not_polled() {
        let (scheduler, _tmp) = test_scheduler(4);
        let addr = spawn_nut_server(Duration::ZERO, None).await;
        let mut device = nut_device(1, "ups", addr);
        device.enabled = false;
        scheduler.add_device(device).await.unwrap();

        scheduler.refresh_now().await;
        assert!(scheduler.status(1).await.is_none());
    }

    #[tokio::test]
    async fn test_status_events_are_broadcast() {
        let (scheduler, _tmp) = test_scheduler(4);
        let addr = spawn_nut_server(Duration::ZERO, None).await;
        scheduler.add_device(nut_device(1, "ups", addr)).await.unwrap();

        let mut events = scheduler.subscribe();
        scheduler.refresh_now().await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.device_id, 1);
        assert!(event.status.is_online);
    }

    #[tokio::test]
    async fn test_metrics_through_scheduler() {
        let (scheduler, _tmp) = test_scheduler(4);
        let addr = spawn_nut_server(Duration::ZERO, None).await;
        scheduler.add_device(nut_device(1, "ups", addr)).await.unwrap();

        scheduler.refresh_now().await;

        let now = Utc::now();
        let metrics = scheduler
            .metrics(1, now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(metrics.sample_count, 1);
        assert_eq!(metrics.peak_power_w, Some(120.0));
        assert_eq!(metrics.total_energy_wh, 0.0);
    }
}
