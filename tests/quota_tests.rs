//! Quota ledger and settlement queue tests

use async_trait::async_trait;
use relaygate::models::Usage;
use relaygate::services::pricing::{ChargeRate, PriceRatio, PricingConfig, PricingTable};
use relaygate::services::quota::{Settlement, SettlementRecord};
use relaygate::services::settlement::SettlementJob;
use relaygate::services::{
    LedgerError, MemoryLedger, QuotaLedger, ReservationId, ReservationState, RetryConfig,
    SettlementQueue,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn settlement(usage: Usage, rate: ChargeRate) -> Settlement {
    Settlement {
        request_id: "req-quota".to_string(),
        usage,
        rate,
        origin_model: "gpt-4".to_string(),
        actual_model: "gpt-4o".to_string(),
        channel_id: "main".to_string(),
        is_stream: true,
        response_text: Some("第一次世界大战".to_string()),
    }
}

fn unit_rate() -> ChargeRate {
    ChargeRate::new(PriceRatio::ONE, PriceRatio::ONE)
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

#[tokio::test]
async fn test_concurrent_reservations_never_overdraw() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.open_account(1, 1000);

    let mut handles = Vec::new();
    for _ in 0..50 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move { ledger.reserve(1, 30).await }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            granted += 1;
        }
    }

    // 1000 / 30 = 33 reservations fit
    assert_eq!(granted, 33);
    assert_eq!(ledger.balance(1).await.unwrap(), 1000 - 33 * 30);
    assert_eq!(ledger.pending_reservations(), 33);
}

#[tokio::test]
async fn test_refund_and_settle_race_resolves_once() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.open_account(1, 1000);

    for _ in 0..20 {
        let id = ledger.reserve(1, 100).await.unwrap();

        let refund = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.refund(id).await })
        };
        let settle = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.settle(id, settlement(Usage::new(10, 10), unit_rate())).await })
        };

        let refunded = refund.await.unwrap().unwrap();
        let settled = settle.await.unwrap();

        match ledger.reservation_state(&id) {
            Some(ReservationState::Refunded) => {
                assert!(refunded);
                assert_eq!(settled.unwrap_err(), LedgerError::AlreadyResolved(id));
            }
            Some(ReservationState::Settled) => {
                assert!(!refunded);
                assert!(settled.is_ok());
            }
            other => panic!("reservation left {:?}", other),
        }
    }

    let settled_count = ledger.records().len() as i64;
    assert_eq!(ledger.balance(1).await.unwrap(), 1000 - settled_count * 20);
    assert_eq!(ledger.pending_reservations(), 0);
}

#[tokio::test]
async fn test_balance_must_be_positive_to_reserve() {
    let ledger = MemoryLedger::new();
    ledger.open_account(1, 0);
    assert!(matches!(
        ledger.reserve(1, 0).await,
        Err(LedgerError::Insufficient { .. })
    ));

    ledger.top_up(1, 50).unwrap();
    assert!(ledger.reserve(1, 0).await.is_ok());
    assert_eq!(ledger.top_up(9, 1).unwrap_err(), LedgerError::AccountNotFound(9));
}

#[tokio::test]
async fn test_settlement_record_carries_audit_fields() {
    let ledger = MemoryLedger::new();
    ledger.open_account(3, 10_000);

    let id = ledger.reserve(3, 500).await.unwrap();
    let rate = ChargeRate::new(PriceRatio::from_f64(2.0).unwrap(), PriceRatio::from_f64(2.0).unwrap());
    let record: SettlementRecord = ledger.settle(id, settlement(Usage::new(30, 12), rate)).await.unwrap();

    // (30 + 12 * 2) * 2
    assert_eq!(record.charged, 108);
    assert_eq!(record.reserved, 500);
    assert_eq!(record.delta, -392);
    assert_eq!(record.origin_model, "gpt-4");
    assert_eq!(record.actual_model, "gpt-4o");
    assert_eq!(record.response_text.as_deref(), Some("第一次世界大战"));
    assert_eq!(ledger.balance(3).await.unwrap(), 10_000 - 108);

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["usage"]["total_tokens"], 42);
}

#[tokio::test]
async fn test_pricing_reload_changes_new_rates_only() {
    let table = PricingTable::new(PricingConfig::default());
    let before = table.charge_rate("gpt-x", "default");
    assert_eq!(before.ratio, PriceRatio::from_f64(30.0).unwrap());

    let config: PricingConfig = serde_json::from_str(
        r#"{"modelRatio": {"gpt-x": 1.5}, "groupRatio": {"vip": 0.5}}"#,
    )
    .unwrap();
    table.reload(config);

    let after = table.charge_rate("gpt-x", "vip");
    assert_eq!(after.ratio, PriceRatio::from_f64(0.75).unwrap());
    assert_eq!(after.charge(&Usage::new(40, 2)), 32);
    // a rate resolved earlier keeps its price
    assert_eq!(before.charge(&Usage::new(40, 2)), 1260);
}

/// Fails the first `failures` settle calls as if storage were down
struct FlakyLedger {
    inner: MemoryLedger,
    failures: AtomicU32,
    attempts: AtomicU32,
}

#[async_trait]
impl QuotaLedger for FlakyLedger {
    async fn reserve(&self, token_id: u64, amount: i64) -> Result<ReservationId, LedgerError> {
        self.inner.reserve(token_id, amount).await
    }

    async fn refund(&self, id: ReservationId) -> Result<bool, LedgerError> {
        self.inner.refund(id).await
    }

    async fn settle(&self, id: ReservationId, settlement: Settlement) -> Result<SettlementRecord, LedgerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LedgerError::Unavailable("connection refused".to_string()));
        }
        self.inner.settle(id, settlement).await
    }

    async fn balance(&self, token_id: u64) -> Result<i64, LedgerError> {
        self.inner.balance(token_id).await
    }
}

fn flaky(failures: u32) -> Arc<FlakyLedger> {
    let inner = MemoryLedger::new();
    inner.open_account(1, 1000);
    Arc::new(FlakyLedger {
        inner,
        failures: AtomicU32::new(failures),
        attempts: AtomicU32::new(0),
    })
}

fn job(reservation_id: ReservationId) -> SettlementJob {
    SettlementJob {
        reservation_id,
        token_id: 1,
        settlement: settlement(Usage::new(20, 20), unit_rate()),
        transcript: None,
    }
}

#[tokio::test]
async fn test_queue_retries_unavailable_ledger() {
    let ledger = flaky(2);
    let queue = SettlementQueue::spawn(ledger.clone(), 8, fast_retry());

    let id = ledger.reserve(1, 100).await.unwrap();
    queue.enqueue(job(id));
    queue.idle().await;

    assert_eq!(ledger.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(queue.stats().settled, 1);
    assert_eq!(ledger.balance(1).await.unwrap(), 960);
}

#[tokio::test]
async fn test_queue_gives_up_after_max_retries() {
    let ledger = flaky(10);
    let queue = SettlementQueue::spawn(ledger.clone(), 8, fast_retry());

    let id = ledger.reserve(1, 100).await.unwrap();
    queue.enqueue(job(id));
    queue.idle().await;

    // first attempt plus three retries
    assert_eq!(ledger.attempts.load(Ordering::SeqCst), 4);
    let stats = queue.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(ledger.inner.reservation_state(&id), Some(ReservationState::Pending));
}

#[tokio::test]
async fn test_full_queue_still_delivers_every_job() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.open_account(1, 10_000);
    let queue = SettlementQueue::spawn(ledger.clone(), 1, fast_retry());

    for _ in 0..25 {
        let id = ledger.reserve(1, 100).await.unwrap();
        queue.enqueue(job(id));
    }
    queue.idle().await;

    let stats = queue.stats();
    assert_eq!(stats.enqueued, 25);
    assert_eq!(stats.settled, 25);
    assert_eq!(ledger.balance(1).await.unwrap(), 10_000 - 25 * 40);
}
