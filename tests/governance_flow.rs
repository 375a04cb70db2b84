use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;

use tradeguard::{
    ApprovalError, ApprovalStatus, DenyReason, OperationContext, OperationKind, RiskConfig,
    RiskGovernor, TradeOutcome,
};

fn confirming_config() -> RiskConfig {
    RiskConfig {
        require_confirmation: true,
        approval_ttl_seconds: 60,
        ..RiskConfig::default()
    }
}

fn open_btc(notional: rust_decimal::Decimal) -> OperationContext {
    OperationContext::new("open_position")
        .with_symbol("BTC")
        .with_notional(notional)
}

/// Full round trip: parked behind approval, approved once, outcome fed back.
#[tokio::test]
async fn approved_operation_round_trip() {
    let governor = RiskGovernor::new(confirming_config()).unwrap();
    let ctx = open_btc(dec!(200));

    let verdict = governor.pre_check(&ctx).await;
    assert!(!verdict.allowed);
    assert_eq!(verdict.reason, Some(DenyReason::AwaitingApproval));
    let id = verdict.request_id.expect("pending request id");

    let pending = governor.pending_approvals().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].context.symbol.as_deref(), Some("BTC"));

    let approved = governor.approve_request(&id).await.unwrap();
    assert_eq!(approved.status, ApprovalStatus::Approved);
    assert!(governor.pending_approvals().await.is_empty());

    // Second decision is reported, not applied
    match governor.reject_request(&id).await {
        Err(ApprovalError::AlreadyResolved { status, .. }) => {
            assert_eq!(status, ApprovalStatus::Approved)
        }
        other => panic!("expected already_resolved, got {:?}", other),
    }

    assert!(governor
        .post_check(&ctx, &TradeOutcome::new(dec!(15)).with_symbol("BTC"))
        .await
        .is_none());
}

/// Racing approve and reject calls resolve a request exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolution_is_exactly_once() {
    let governor = Arc::new(RiskGovernor::new(confirming_config()).unwrap());

    for _ in 0..20 {
        let id = governor
            .pre_check(&open_btc(dec!(50)))
            .await
            .request_id
            .expect("pending request id");

        let mut handles = Vec::new();
        for i in 0..8 {
            let governor = governor.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    governor.approve_request(&id).await
                } else {
                    governor.reject_request(&id).await
                }
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(e) => assert_eq!(e.code(), "already_resolved"),
            }
        }
        assert_eq!(successes, 1, "request {} resolved more than once", id);
    }
}

/// Approving after the TTL reports the lazily-expired status.
#[tokio::test]
async fn approval_after_ttl_reports_expired() {
    let governor = RiskGovernor::new(confirming_config()).unwrap();
    let t0 = Utc::now();

    let id = governor
        .pre_check_at(&open_btc(dec!(100)), t0)
        .await
        .request_id
        .unwrap();

    let err = governor
        .approve_request_at(&id, t0 + Duration::seconds(61))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ApprovalError::AlreadyResolved {
            id: id.clone(),
            status: ApprovalStatus::Expired
        }
    );
}

/// Losses of 300 and 250 against a 500 budget block the next high-risk call.
#[tokio::test]
async fn daily_budget_blocks_after_losses() {
    let config = RiskConfig {
        require_confirmation: false,
        max_daily_loss_usd: dec!(500),
        consecutive_loss_threshold: 10,
        ..RiskConfig::default()
    };
    let governor = RiskGovernor::new(config).unwrap();
    let ctx = open_btc(dec!(100));

    governor.post_check(&ctx, &TradeOutcome::new(dec!(-300))).await;
    governor.post_check(&ctx, &TradeOutcome::new(dec!(-250))).await;

    let verdict = governor.pre_check(&open_btc(dec!(10))).await;
    assert!(!verdict.allowed);
    assert!(verdict.is_denied_by(DenyReason::DailyLossLimit));

    // Queries still pass
    let query = OperationContext::new("get_positions").with_symbol("BTC");
    assert_eq!(query.kind, OperationKind::Query);
    assert!(governor.pre_check(&query).await.allowed);

    let metrics = governor.risk_metrics().await;
    assert_eq!(metrics.daily_loss_usd, dec!(550));
    assert!(metrics.breaker.tripped);
}

/// A tripped breaker blocks until the privileged reset.
#[tokio::test]
async fn breaker_trip_and_manual_reset() {
    let config = RiskConfig {
        require_confirmation: false,
        consecutive_loss_threshold: 3,
        ..RiskConfig::default()
    };
    let governor = RiskGovernor::new(config).unwrap();
    let ctx = open_btc(dec!(10));

    for _ in 0..2 {
        assert!(governor
            .post_check(&ctx, &TradeOutcome::new(dec!(-1)))
            .await
            .is_none());
    }
    assert!(governor
        .post_check(&ctx, &TradeOutcome::new(dec!(-1)))
        .await
        .is_some());

    let verdict = governor.pre_check(&ctx).await;
    assert!(verdict.is_denied_by(DenyReason::CircuitBreakerTripped));

    governor.reset_circuit_breaker().await;
    assert!(governor.pre_check(&ctx).await.allowed);
    assert_eq!(governor.breaker_state().await.consecutive_losses, 0);
}

/// With zero retention a duplicate decision still reports the first outcome.
#[tokio::test]
async fn duplicate_decision_without_retention() {
    let governor = RiskGovernor::new(RiskConfig {
        approval_retention_seconds: 0,
        ..confirming_config()
    })
    .unwrap();

    let id = governor
        .pre_check(&open_btc(dec!(100)))
        .await
        .request_id
        .expect("pending request id");

    governor.approve_request(&id).await.unwrap();
    let err = governor.approve_request(&id).await.unwrap_err();
    assert_eq!(err.code(), "already_resolved");
}

/// Durations that overflow calendar arithmetic are refused up front.
#[tokio::test]
async fn out_of_range_durations_are_rejected() {
    let huge_cooldown = RiskConfig {
        cooldown_minutes: u64::MAX,
        ..RiskConfig::default()
    };
    assert!(RiskGovernor::new(huge_cooldown).is_err());

    let governor = RiskGovernor::new(confirming_config()).unwrap();
    let huge_ttl = RiskConfig {
        approval_ttl_seconds: u64::MAX,
        ..confirming_config()
    };
    assert!(governor.update_config(huge_ttl).await.is_err());
    assert_eq!(governor.config().await.approval_ttl_seconds, 60);
}
