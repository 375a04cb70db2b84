use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tradeguard::{
    AlertManager, AlertMetric, BackendPosition, ExecutionBackend, GuardError, MonitorConfig,
    PositionSide, PositionTelemetryMonitor, Result,
};

/// Backend whose mark price is set by the test
struct MarkBackend {
    price: Mutex<Decimal>,
    fetches: AtomicUsize,
    fail: Mutex<bool>,
}

impl MarkBackend {
    fn new(price: Decimal) -> Self {
        Self {
            price: Mutex::new(price),
            fetches: AtomicUsize::new(0),
            fail: Mutex::new(false),
        }
    }

    fn set_price(&self, price: Decimal) {
        *self.price.lock().unwrap() = price;
    }
}

#[async_trait]
impl ExecutionBackend for MarkBackend {
    async fn fetch_open_positions(&self) -> Result<Vec<BackendPosition>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock().unwrap() {
            return Err(GuardError::Transport("backend unreachable".to_string()));
        }
        Ok(vec![BackendPosition {
            symbol: "ETH".to_string(),
            side: PositionSide::Short,
            quantity: dec!(2),
            entry_price: dec!(2000),
            current_price: *self.price.lock().unwrap(),
            leverage: dec!(5),
            margin: dec!(800),
            liquidation_price: Some(dec!(2300)),
            position_id: None,
        }])
    }
}

fn config(poll_interval_ms: u64) -> MonitorConfig {
    MonitorConfig {
        poll_interval_ms,
        liquidation_warning_pct: dec!(5),
        pnl_change_alert_pct: dec!(1000),
        enable_alerts: true,
    }
}

/// A short crossing into the liquidation zone alerts on the crossing tick only.
#[tokio::test]
async fn short_position_near_liquidation_alerts_once() {
    let backend = Arc::new(MarkBackend::new(dec!(2000)));
    let alerts = AlertManager::with_defaults();
    let mut rx = alerts.subscribe();
    let monitor = PositionTelemetryMonitor::new(backend.clone(), Arc::new(alerts), config(1000));

    monitor.poll_once().await.unwrap();
    assert!(rx.try_recv().is_err());

    // 2200 -> (2300 - 2200) / 2200 = 4.55%
    backend.set_price(dec!(2200));
    monitor.poll_once().await.unwrap();
    monitor.poll_once().await.unwrap();

    let alert = rx.try_recv().expect("liquidation alert");
    assert_eq!(alert.symbol, "ETH");
    assert_eq!(alert.metric, AlertMetric::LiquidationDistance);
    assert!(rx.try_recv().is_err());

    let status = monitor.status();
    assert_eq!(status.alert_count, 1);
    assert_eq!(status.total_unrealized_pnl, dec!(-400));
}

/// Backend failures surface in status while the loop keeps polling.
#[tokio::test(start_paused = true)]
async fn loop_survives_backend_failures() {
    let backend = Arc::new(MarkBackend::new(dec!(2000)));
    let monitor = PositionTelemetryMonitor::new(
        backend.clone(),
        Arc::new(AlertManager::with_defaults()),
        config(100),
    );

    monitor.start(config(100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(monitor.status().position_count, 1);

    *backend.fail.lock().unwrap() = true;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let status = monitor.status();
    assert!(status.running);
    assert!(status.consecutive_failures >= 2);
    assert_eq!(status.last_error.as_deref(), Some("Transport error: backend unreachable"));
    // Cache from the last good poll is kept
    assert_eq!(status.position_count, 1);

    *backend.fail.lock().unwrap() = false;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(monitor.status().consecutive_failures, 0);

    monitor.stop();
    assert!(!monitor.status().running);
}
