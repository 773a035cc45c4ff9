//! Asynchronous settlement
//!
//! Settlements are queued after the reply has been fully written and applied by a
//! dedicated worker, so billing never delays the client.

use crate::adaptor::Adaptor;
use crate::services::client::RetryConfig;
use crate::services::quota::{LedgerError, QuotaLedger, ReservationId, Settlement};
use crate::services::reconciler::CapturedBody;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// One queued settlement
#[derive(Debug, Clone)]
pub struct SettlementJob {
    pub reservation_id: ReservationId,
    pub token_id: u64,
    pub settlement: Settlement,
    /// Stream capture whose text the worker reconstructs into `response_text`
    pub transcript: Option<Transcript>,
}

/// Frozen stream capture plus the adaptor that knows where its text lives
#[derive(Clone)]
pub struct Transcript {
    pub captured: CapturedBody,
    pub adaptor: Arc<dyn Adaptor>,
}

impl Transcript {
    pub fn reconstruct(&self) -> String {
        self.captured
            .reconstruct_text(|payload| self.adaptor.stream_fragment(payload))
    }
}

impl fmt::Debug for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transcript")
            .field("captured_bytes", &self.captured.bytes().len())
            .field("adaptor", &self.adaptor.name())
            .finish()
    }
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementStats {
    pub enqueued: u64,
    pub settled: u64,
    pub failed: u64,
    pub pending: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    settled: AtomicU64,
    failed: AtomicU64,
}

/// Handle for submitting settlements to the worker
#[derive(Debug)]
pub struct SettlementQueue {
    tx: mpsc::Sender<SettlementJob>,
    counters: Arc<Counters>,
    completed: Arc<watch::Sender<u64>>,
}

impl SettlementQueue {
    /// Start the worker on the current runtime
    pub fn spawn(ledger: Arc<dyn QuotaLedger>, capacity: usize, retry: RetryConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let (completed, _) = watch::channel(0u64);
        let completed = Arc::new(completed);

        tokio::spawn(run_worker(ledger, rx, retry, counters.clone(), completed.clone()));

        Arc::new(Self {
            tx,
            counters,
            completed,
        })
    }

    /// Queue a settlement; never blocks the caller
    pub fn enqueue(&self, job: SettlementJob) {
        self.counters.enqueued.fetch_add(1, Ordering::SeqCst);

        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!("Settlement queue full, deferring reservation {}", job.reservation_id);
                let tx = self.tx.clone();
                let counters = self.counters.clone();
                let completed = self.completed.clone();
                tokio::spawn(async move {
                    if let Err(mpsc::error::SendError(job)) = tx.send(job).await {
                        error!("Settlement worker gone, reservation {} left pending", job.reservation_id);
                        mark_done(&counters.failed, &completed);
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                error!("Settlement worker gone, reservation {} left pending", job.reservation_id);
                mark_done(&self.counters.failed, &self.completed);
            }
        }
    }

    pub fn stats(&self) -> SettlementStats {
        let enqueued = self.counters.enqueued.load(Ordering::SeqCst);
        let settled = self.counters.settled.load(Ordering::SeqCst);
        let failed = self.counters.failed.load(Ordering::SeqCst);
        SettlementStats {
            enqueued,
            settled,
            failed,
            pending: enqueued.saturating_sub(settled + failed),
        }
    }

    /// Resolve once every job enqueued so far has been processed
    pub async fn idle(&self) {
        let mut rx = self.completed.subscribe();
        loop {
            let target = self.counters.enqueued.load(Ordering::SeqCst);
            if *rx.borrow_and_update() >= target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

fn mark_done(counter: &AtomicU64, completed: &watch::Sender<u64>) {
    counter.fetch_add(1, Ordering::SeqCst);
    completed.send_modify(|done| *done += 1);
}

async fn run_worker(
    ledger: Arc<dyn QuotaLedger>,
    mut rx: mpsc::Receiver<SettlementJob>,
    retry: RetryConfig,
    counters: Arc<Counters>,
    completed: Arc<watch::Sender<u64>>,
) {
    info!("Settlement worker started");
    while let Some(mut job) = rx.recv().await {
        if let Some(transcript) = job.transcript.take() {
            job.settlement.response_text = Some(transcript.reconstruct());
        }
        match settle_with_retry(ledger.as_ref(), &job, &retry).await {
            Ok(()) => mark_done(&counters.settled, &completed),
            Err(e) => {
                error!(
                    "Settlement of reservation {} for account {} failed: {} (usage {:?})",
                    job.reservation_id, job.token_id, e, job.settlement.usage
                );
                mark_done(&counters.failed, &completed);
            }
        }
    }
    info!("Settlement worker stopped");
}

async fn settle_with_retry(
    ledger: &dyn QuotaLedger,
    job: &SettlementJob,
    retry: &RetryConfig,
) -> Result<(), LedgerError> {
    let mut attempt = 0;
    loop {
        match ledger.settle(job.reservation_id, job.settlement.clone()).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.delay_for(attempt);
                warn!(
                    "Settlement failed, retrying after {}ms (attempt {}/{}): {}",
                    delay.as_millis(),
                    attempt + 1,
                    retry.max_retries,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
