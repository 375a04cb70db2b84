//! Position telemetry monitor
//!
//! Polls the execution backend on a fixed interval, keeps the latest snapshot
//! set for synchronous readers and pushes threshold alerts to an [`AlertSink`].
//! Ticks never overlap: the next sleep starts only after the current fetch,
//! evaluation and alert delivery have finished.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::thresholds::ThresholdTracker;
use crate::config::MonitorConfig;
use crate::domain::PositionSnapshot;
use crate::error::{GuardError, Result};
use crate::exchange::ExecutionBackend;
use crate::supervisor::AlertSink;

/// Partial monitor configuration, applied on top of the current one
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfigUpdate {
    pub poll_interval_ms: Option<u64>,
    pub liquidation_warning_pct: Option<Decimal>,
    pub pnl_change_alert_pct: Option<Decimal>,
    pub enable_alerts: Option<bool>,
}

/// Point-in-time monitor status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub position_count: usize,
    pub total_unrealized_pnl: Decimal,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub alert_count: u64,
    pub tick_count: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Default)]
struct Telemetry {
    positions: Vec<PositionSnapshot>,
    last_update: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
    alert_count: u64,
    tick_count: u64,
}

struct Shared {
    backend: Arc<dyn ExecutionBackend>,
    sink: Arc<dyn AlertSink>,
    config: RwLock<MonitorConfig>,
    telemetry: RwLock<Telemetry>,
    /// Held for the whole tick so ticks are serialized
    tracker: Mutex<ThresholdTracker>,
    running: AtomicBool,
    generation: AtomicU64,
    wake: Notify,
}

pub struct PositionTelemetryMonitor {
    shared: Arc<Shared>,
}

impl PositionTelemetryMonitor {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        sink: Arc<dyn AlertSink>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                sink,
                config: RwLock::new(config),
                telemetry: RwLock::new(Telemetry::default()),
                tracker: Mutex::new(ThresholdTracker::new()),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                wake: Notify::new(),
            }),
        }
    }

    // ==================== Lifecycle ====================

    /// Start polling with `config`. A no-op while already running.
    pub async fn start(&self, config: MonitorConfig) -> Result<()> {
        config.validate().map_err(GuardError::InvalidConfig)?;

        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("Position monitor already running");
            return Ok(());
        }

        info!(
            "Starting position monitor (interval: {}ms, liquidation warning: {}%, pnl change: {}%)",
            config.poll_interval_ms, config.liquidation_warning_pct, config.pnl_change_alert_pct
        );
        self.shared.store_config(config);

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = self.shared.clone();
        let chain = tokio::spawn(async move {
            shared.run(generation).await;
        });

        // Watch for a chain that dies without going through stop()
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = chain.await {
                shared.abort_chain(generation, &e.to_string());
            }
        });
        Ok(())
    }

    /// Stop polling. Never waits on an in-flight fetch; its result is dropped.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
        info!("Position monitor stop requested");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Run one tick now, independent of the polling loop.
    ///
    /// Returns the number of positions fetched.
    pub async fn poll_once(&self) -> Result<usize> {
        self.shared.tick(None).await
    }

    // ==================== Configuration ====================

    pub fn config(&self) -> MonitorConfig {
        self.shared.config()
    }

    /// Hot-replace thresholds and poll interval. Thresholds apply from the next
    /// tick; a changed interval also cuts the current sleep short.
    pub fn update_config(&self, update: MonitorConfigUpdate) -> Result<MonitorConfig> {
        let previous = self.shared.config();
        let mut next = previous.clone();
        if let Some(v) = update.poll_interval_ms {
            next.poll_interval_ms = v;
        }
        if let Some(v) = update.liquidation_warning_pct {
            next.liquidation_warning_pct = v;
        }
        if let Some(v) = update.pnl_change_alert_pct {
            next.pnl_change_alert_pct = v;
        }
        if let Some(v) = update.enable_alerts {
            next.enable_alerts = v;
        }
        next.validate().map_err(GuardError::InvalidConfig)?;

        self.shared.store_config(next.clone());
        if next.poll_interval_ms != previous.poll_interval_ms {
            self.shared.wake.notify_waiters();
        }
        info!(
            "Monitor config updated (interval: {}ms, alerts: {})",
            next.poll_interval_ms, next.enable_alerts
        );
        Ok(next)
    }

    // ==================== Queries ====================

    pub fn status(&self) -> MonitorStatus {
        let poll_interval_ms = self.shared.config().poll_interval_ms;
        let running = self.is_running();
        self.shared.read_telemetry(|t| MonitorStatus {
            running,
            position_count: t.positions.len(),
            total_unrealized_pnl: sum_pnl(&t.positions),
            last_update: t.last_update,
            last_error: t.last_error.clone(),
            consecutive_failures: t.consecutive_failures,
            alert_count: t.alert_count,
            tick_count: t.tick_count,
            poll_interval_ms,
        })
    }

    pub fn all_positions(&self) -> Vec<PositionSnapshot> {
        self.shared.read_telemetry(|t| t.positions.clone())
    }

    pub fn total_pnl(&self) -> Decimal {
        self.shared.read_telemetry(|t| sum_pnl(&t.positions))
    }

    /// First cached position for `symbol`, case-insensitive
    pub fn position(&self, symbol: &str) -> Option<PositionSnapshot> {
        self.shared.read_telemetry(|t| {
            t.positions
                .iter()
                .find(|p| p.symbol.eq_ignore_ascii_case(symbol))
                .cloned()
        })
    }
}

impl Drop for PositionTelemetryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sum_pnl(positions: &[PositionSnapshot]) -> Decimal {
    positions
        .iter()
        .fold(Decimal::ZERO, |acc, p| acc.saturating_add(p.unrealized_pnl))
}

impl Shared {
    fn config(&self) -> MonitorConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store_config(&self, config: MonitorConfig) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    fn read_telemetry<T>(&self, f: impl FnOnce(&Telemetry) -> T) -> T {
        match self.telemetry.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write_telemetry<T>(&self, f: impl FnOnce(&mut Telemetry) -> T) -> T {
        match self.telemetry.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Clear the running state left behind by a chain that panicked
    fn abort_chain(&self, generation: u64, cause: &str) {
        error!("Position monitor poll chain {} died: {}", generation, cause);
        self.write_telemetry(|t| t.last_error = Some(format!("poll loop died: {}", cause)));
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    async fn run(&self, generation: u64) {
        debug!("Poll chain {} started", generation);

        while self.is_current(generation) {
            if let Err(e) = self.tick(Some(generation)).await {
                debug!("Tick failed: {}", e);
            }
            if !self.is_current(generation) {
                break;
            }

            let interval = Duration::from_millis(self.config().poll_interval_ms);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => {}
            }
        }

        info!("Position monitor poll chain {} stopped", generation);
    }

    /// One fetch-evaluate-alert cycle. `generation` is `Some` for loop ticks;
    /// their results are discarded when the loop was stopped meanwhile.
    async fn tick(&self, generation: Option<u64>) -> Result<usize> {
        let mut tracker = self.tracker.lock().await;

        let fetched = self.backend.fetch_open_positions().await;

        if let Some(generation) = generation {
            if !self.is_current(generation) {
                debug!("Discarding stale fetch result from poll chain {}", generation);
                return Ok(0);
            }
        }

        let raw = match fetched {
            Ok(raw) => raw,
            Err(e) => {
                let failures = self.write_telemetry(|t| {
                    t.last_error = Some(e.to_string());
                    t.consecutive_failures += 1;
                    t.tick_count += 1;
                    t.consecutive_failures
                });
                warn!("Position fetch failed ({} in a row): {}", failures, e);
                return Err(e);
            }
        };

        let now = Utc::now();
        let snapshots: Vec<PositionSnapshot> = raw
            .iter()
            .filter_map(|p| match PositionSnapshot::from_backend(p, now) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!("Skipping position row: {}", e);
                    None
                }
            })
            .collect();
        let count = snapshots.len();

        let thresholds = self.config().thresholds();
        let alerts = tracker.evaluate(&snapshots, &thresholds, now);

        self.write_telemetry(|t| {
            t.positions = snapshots;
            t.last_update = Some(now);
            t.last_error = None;
            t.consecutive_failures = 0;
            t.tick_count += 1;
        });
        debug!("Polled {} positions, {} alerts", count, alerts.len());

        for alert in &alerts {
            if let Err(e) = self.sink.send(alert).await {
                error!("Alert sink failed for {}: {}", alert.symbol, e);
            }
            self.write_telemetry(|t| t.alert_count += 1);
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackendPosition, PositionSide};
    use crate::exchange::MockExecutionBackend;
    use crate::supervisor::{Alert, AlertManager, AlertMetric};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct CountingBackend {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionBackend for CountingBackend {
        async fn fetch_open_positions(&self) -> Result<Vec<BackendPosition>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    /// Returns scripted price points, repeating the last one
    struct ScriptedBackend {
        prices: std::sync::Mutex<VecDeque<Decimal>>,
    }

    #[async_trait]
    impl ExecutionBackend for ScriptedBackend {
        async fn fetch_open_positions(&self) -> Result<Vec<BackendPosition>> {
            let mut prices = self.prices.lock().unwrap();
            let price = if prices.len() > 1 {
                prices.pop_front().unwrap()
            } else {
                *prices.front().unwrap()
            };
            Ok(vec![btc_long(price)])
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: std::sync::Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertSink for Recorder {
        async fn send(&self, alert: &Alert) -> Result<()> {
            self.seen.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    fn btc_long(current: Decimal) -> BackendPosition {
        BackendPosition {
            symbol: "BTC".to_string(),
            side: PositionSide::Long,
            quantity: dec!(1),
            entry_price: dec!(100),
            current_price: current,
            leverage: dec!(10),
            margin: dec!(10),
            liquidation_price: Some(dec!(90)),
            position_id: None,
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval_ms: 50,
            ..MonitorConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_start_keeps_single_chain() {
        let backend = Arc::new(CountingBackend {
            fetches: AtomicUsize::new(0),
        });
        let monitor = PositionTelemetryMonitor::new(
            backend.clone(),
            Arc::new(AlertManager::with_defaults()),
            fast_config(),
        );

        monitor.start(fast_config()).await.unwrap();
        monitor.start(fast_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        monitor.stop();
        monitor.start(fast_config()).await.unwrap();
        backend.fetches.store(0, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let fetches = backend.fetches.load(Ordering::SeqCst);

        // One chain at 50ms makes ~20 fetches in 1s; two would make ~40
        assert!(fetches >= 15, "too few fetches: {}", fetches);
        assert!(fetches <= 22, "more than one poll chain: {}", fetches);

        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_polling() {
        let backend = Arc::new(CountingBackend {
            fetches: AtomicUsize::new(0),
        });
        let monitor = PositionTelemetryMonitor::new(
            backend.clone(),
            Arc::new(AlertManager::with_defaults()),
            fast_config(),
        );

        monitor.start(fast_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        monitor.stop();
        assert!(!monitor.is_running());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let after_stop = backend.fetches.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(backend.fetches.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let monitor = PositionTelemetryMonitor::new(
            Arc::new(CountingBackend {
                fetches: AtomicUsize::new(0),
            }),
            Arc::new(AlertManager::with_defaults()),
            MonitorConfig::default(),
        );
        let bad = MonitorConfig {
            poll_interval_ms: 0,
            ..MonitorConfig::default()
        };
        assert!(monitor.start(bad).await.is_err());
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_cache() {
        let mut backend = MockExecutionBackend::new();
        let mut calls = 0;
        backend.expect_fetch_open_positions().returning(move || {
            calls += 1;
            if calls == 2 {
                Err(GuardError::Transport("connection refused".to_string()))
            } else {
                Ok(vec![btc_long(dec!(101))])
            }
        });

        let monitor = PositionTelemetryMonitor::new(
            Arc::new(backend),
            Arc::new(AlertManager::with_defaults()),
            MonitorConfig::default(),
        );

        assert_eq!(monitor.poll_once().await.unwrap(), 1);
        assert!(monitor.poll_once().await.is_err());

        let status = monitor.status();
        assert_eq!(status.position_count, 1);
        assert_eq!(status.total_unrealized_pnl, dec!(1));
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.unwrap().contains("connection refused"));
        assert_eq!(status.tick_count, 2);

        monitor.poll_once().await.unwrap();
        let status = monitor.status();
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_liquidation_crossing_alerts_once() {
        let backend = ScriptedBackend {
            prices: std::sync::Mutex::new(VecDeque::from(vec![
                dec!(100),
                dec!(97),
                dec!(94),
                dec!(93.5),
            ])),
        };
        let recorder = Arc::new(Recorder::default());
        let config = MonitorConfig {
            liquidation_warning_pct: dec!(5),
            pnl_change_alert_pct: dec!(1000),
            ..MonitorConfig::default()
        };
        let monitor = PositionTelemetryMonitor::new(Arc::new(backend), recorder.clone(), config);

        monitor.poll_once().await.unwrap();
        monitor.poll_once().await.unwrap();
        assert!(recorder.seen.lock().unwrap().is_empty());

        monitor.poll_once().await.unwrap();
        monitor.poll_once().await.unwrap();
        monitor.poll_once().await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].metric, AlertMetric::LiquidationDistance);
        assert_eq!(seen[0].threshold, dec!(5));
        assert_eq!(monitor.status().alert_count, 1);
    }

    #[tokio::test]
    async fn test_update_config_and_queries() {
        let backend = ScriptedBackend {
            prices: std::sync::Mutex::new(VecDeque::from(vec![dec!(94)])),
        };
        let recorder = Arc::new(Recorder::default());
        let monitor = PositionTelemetryMonitor::new(
            Arc::new(backend),
            recorder.clone(),
            MonitorConfig::default(),
        );

        let updated = monitor
            .update_config(MonitorConfigUpdate {
                poll_interval_ms: Some(250),
                enable_alerts: Some(false),
                ..MonitorConfigUpdate::default()
            })
            .unwrap();
        assert_eq!(updated.poll_interval_ms, 250);
        assert!(!updated.enable_alerts);

        monitor.poll_once().await.unwrap();
        assert!(recorder.seen.lock().unwrap().is_empty());
        assert_eq!(monitor.status().poll_interval_ms, 250);

        let btc = monitor.position("btc").unwrap();
        assert_eq!(btc.unrealized_pnl, dec!(-6));
        assert_eq!(monitor.total_pnl(), dec!(-6));
        assert_eq!(monitor.all_positions().len(), 1);
        assert!(monitor.position("ETH").is_none());

        let rejected = monitor.update_config(MonitorConfigUpdate {
            pnl_change_alert_pct: Some(dec!(0)),
            ..MonitorConfigUpdate::default()
        });
        assert!(rejected.is_err());
        assert_eq!(monitor.config().poll_interval_ms, 250);
    }

    struct SlowBackend {
        fetches: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl ExecutionBackend for SlowBackend {
        async fn fetch_open_positions(&self) -> Result<Vec<BackendPosition>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(vec![btc_long(dec!(101))])
        }
    }

    struct PanickingBackend;

    #[async_trait]
    impl ExecutionBackend for PanickingBackend {
        async fn fetch_open_positions(&self) -> Result<Vec<BackendPosition>> {
            panic!("backend client bug");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_fetch() {
        let backend = Arc::new(SlowBackend {
            fetches: AtomicUsize::new(0),
            delay: Duration::from_millis(500),
        });
        let monitor = PositionTelemetryMonitor::new(
            backend.clone(),
            Arc::new(AlertManager::with_defaults()),
            fast_config(),
        );

        monitor.start(fast_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.stop();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let status = monitor.status();
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(status.position_count, 0);
        assert_eq!(status.tick_count, 0);
        assert!(status.last_update.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_interval_applies_without_waiting() {
        let backend = Arc::new(CountingBackend {
            fetches: AtomicUsize::new(0),
        });
        let hourly = MonitorConfig {
            poll_interval_ms: 3_600_000,
            ..MonitorConfig::default()
        };
        let monitor = PositionTelemetryMonitor::new(
            backend.clone(),
            Arc::new(AlertManager::with_defaults()),
            hourly.clone(),
        );

        monitor.start(hourly).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 1);

        monitor
            .update_config(MonitorConfigUpdate {
                poll_interval_ms: Some(50),
                ..MonitorConfigUpdate::default()
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(backend.fetches.load(Ordering::SeqCst) >= 5);
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_chain_clears_running() {
        let monitor = PositionTelemetryMonitor::new(
            Arc::new(PanickingBackend),
            Arc::new(AlertManager::with_defaults()),
            fast_config(),
        );

        monitor.start(fast_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = monitor.status();
        assert!(!status.running);
        assert!(status.last_error.unwrap().contains("poll loop died"));

        // A fresh start is possible again
        monitor.start(fast_config()).await.unwrap();
        assert!(monitor.is_running());
        monitor.stop();
    }

    #[tokio::test]
    async fn test_overflowing_row_is_skipped() {
        let mut backend = MockExecutionBackend::new();
        backend.expect_fetch_open_positions().returning(|| {
            let broken = BackendPosition {
                symbol: "ETH".to_string(),
                margin: dec!(0.0000000000000000000000000001),
                current_price: dec!(1000000000000),
                ..btc_long(dec!(100))
            };
            Ok(vec![broken, btc_long(dec!(101))])
        });

        let monitor = PositionTelemetryMonitor::new(
            Arc::new(backend),
            Arc::new(AlertManager::with_defaults()),
            MonitorConfig::default(),
        );

        assert_eq!(monitor.poll_once().await.unwrap(), 1);
        assert_eq!(monitor.all_positions()[0].symbol, "BTC");
        assert!(monitor.position("ETH").is_none());
    }
}
