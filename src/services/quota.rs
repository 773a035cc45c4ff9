//! Quota ledger
//!
//! Reserve an estimate before the backend call, then either refund it or settle it
//! against actual usage. Every reservation is resolved exactly once.

use crate::config::TokenConfig;
use crate::models::Usage;
use crate::services::pricing::ChargeRate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ReservationId = Uuid;

/// Ledger errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("account {0} not found")]
    AccountNotFound(u64),

    #[error("account {token_id} has {available} quota left, {requested} requested")]
    Insufficient {
        token_id: u64,
        available: i64,
        requested: i64,
    },

    #[error("reservation {0} not found")]
    ReservationNotFound(ReservationId),

    #[error("reservation {0} is already resolved")]
    AlreadyResolved(ReservationId),

    /// Storage could not be reached; the operation may be retried
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Pending,
    Refunded,
    Settled,
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: ReservationId,
    pub token_id: u64,
    pub amount: i64,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
}

/// Everything settlement needs, frozen once the reply is complete
#[derive(Debug, Clone)]
pub struct Settlement {
    pub request_id: String,
    pub usage: Usage,
    pub rate: ChargeRate,
    pub origin_model: String,
    pub actual_model: String,
    pub channel_id: String,
    pub is_stream: bool,
    /// Reply text rebuilt from the captured stream
    pub response_text: Option<String>,
}

/// Audit entry written by a settlement
#[derive(Debug, Clone, Serialize)]
pub struct SettlementRecord {
    pub reservation_id: ReservationId,
    pub token_id: u64,
    pub request_id: String,
    pub origin_model: String,
    pub actual_model: String,
    pub channel_id: String,
    pub usage: Usage,
    pub reserved: i64,
    pub charged: i64,
    /// charged - reserved; negative means part of the estimate went back
    pub delta: i64,
    pub is_stream: bool,
    pub response_text: Option<String>,
    pub settled_at: DateTime<Utc>,
}

/// Account storage seen by the relay pipeline
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Hold `amount` against the account
    async fn reserve(&self, token_id: u64, amount: i64) -> Result<ReservationId, LedgerError>;

    /// Give a pending reservation back; false when it was already resolved
    async fn refund(&self, id: ReservationId) -> Result<bool, LedgerError>;

    /// Charge actual usage against a pending reservation
    async fn settle(&self, id: ReservationId, settlement: Settlement) -> Result<SettlementRecord, LedgerError>;

    async fn balance(&self, token_id: u64) -> Result<i64, LedgerError>;
}

/// In-process ledger
///
/// Lock order is reservations then accounts.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    accounts: DashMap<u64, i64>,
    reservations: DashMap<ReservationId, Reservation>,
    records: Mutex<Vec<SettlementRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed one account per configured token
    pub fn from_tokens(tokens: &HashMap<String, TokenConfig>) -> Self {
        let ledger = Self::new();
        for token in tokens.values() {
            ledger.open_account(token.id, token.quota);
        }
        debug!("Opened {} quota accounts", ledger.accounts.len());
        ledger
    }

    pub fn open_account(&self, token_id: u64, quota: i64) {
        self.accounts.insert(token_id, quota);
    }

    /// Add to (or, when negative, take from) an account
    pub fn top_up(&self, token_id: u64, amount: i64) -> Result<i64, LedgerError> {
        let mut balance = self
            .accounts
            .get_mut(&token_id)
            .ok_or(LedgerError::AccountNotFound(token_id))?;
        *balance = balance.saturating_add(amount);
        Ok(*balance)
    }

    pub fn reservation(&self, id: &ReservationId) -> Option<Reservation> {
        self.reservations.get(id).map(|r| r.clone())
    }

    pub fn reservation_state(&self, id: &ReservationId) -> Option<ReservationState> {
        self.reservations.get(id).map(|r| r.state)
    }

    pub fn pending_reservations(&self) -> usize {
        self.reservations
            .iter()
            .filter(|r| r.state == ReservationState::Pending)
            .count()
    }

    /// Audit log, oldest first
    pub fn records(&self) -> Vec<SettlementRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn push_record(&self, record: SettlementRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

#[async_trait]
impl QuotaLedger for MemoryLedger {
    async fn reserve(&self, token_id: u64, amount: i64) -> Result<ReservationId, LedgerError> {
        let amount = amount.max(0);
        {
            let mut balance = self
                .accounts
                .get_mut(&token_id)
                .ok_or(LedgerError::AccountNotFound(token_id))?;
            if *balance <= 0 || *balance < amount {
                return Err(LedgerError::Insufficient {
                    token_id,
                    available: *balance,
                    requested: amount,
                });
            }
            *balance -= amount;
        }

        let id = Uuid::new_v4();
        self.reservations.insert(
            id,
            Reservation {
                id,
                token_id,
                amount,
                state: ReservationState::Pending,
                created_at: Utc::now(),
            },
        );
        debug!("Reserved {} for account {} ({})", amount, token_id, id);
        Ok(id)
    }

    async fn refund(&self, id: ReservationId) -> Result<bool, LedgerError> {
        let mut reservation = match self.reservations.entry(id) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(_) => return Err(LedgerError::ReservationNotFound(id)),
        };
        if reservation.state != ReservationState::Pending {
            debug!("Reservation {} already {:?}, refund ignored", id, reservation.state);
            return Ok(false);
        }

        if let Some(mut balance) = self.accounts.get_mut(&reservation.token_id) {
            *balance = balance.saturating_add(reservation.amount);
        } else {
            warn!("Refund for reservation {} targets a closed account", id);
        }
        reservation.state = ReservationState::Refunded;
        debug!("Refunded {} to account {} ({})", reservation.amount, reservation.token_id, id);
        Ok(true)
    }

    async fn settle(&self, id: ReservationId, settlement: Settlement) -> Result<SettlementRecord, LedgerError> {
        let mut reservation = match self.reservations.entry(id) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(_) => return Err(LedgerError::ReservationNotFound(id)),
        };
        if reservation.state != ReservationState::Pending {
            return Err(LedgerError::AlreadyResolved(id));
        }

        let charged = settlement.rate.charge(&settlement.usage);
        let delta = charged.saturating_sub(reservation.amount);
        {
            let mut balance = self
                .accounts
                .get_mut(&reservation.token_id)
                .ok_or(LedgerError::AccountNotFound(reservation.token_id))?;
            *balance = balance.saturating_sub(delta);
        }
        reservation.state = ReservationState::Settled;

        let record = SettlementRecord {
            reservation_id: id,
            token_id: reservation.token_id,
            request_id: settlement.request_id,
            origin_model: settlement.origin_model,
            actual_model: settlement.actual_model,
            channel_id: settlement.channel_id,
            usage: settlement.usage,
            reserved: reservation.amount,
            charged,
            delta,
            is_stream: settlement.is_stream,
            response_text: settlement.response_text,
            settled_at: Utc::now(),
        };
        drop(reservation);

        info!(
            "Settled reservation {} for account {}: reserved {}, charged {}, delta {}",
            id, record.token_id, record.reserved, record.charged, record.delta
        );
        self.push_record(record.clone());
        Ok(record)
    }

    async fn balance(&self, token_id: u64) -> Result<i64, LedgerError> {
        self.accounts
            .get(&token_id)
            .map(|b| *b)
            .ok_or(LedgerError::AccountNotFound(token_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::pricing::PriceRatio;

    fn settlement(usage: Usage) -> Settlement {
        Settlement {
            request_id: "req-1".to_string(),
            usage,
            rate: ChargeRate::new(PriceRatio::ONE, PriceRatio::ONE),
            origin_model: "gpt-x".to_string(),
            actual_model: "gpt-x".to_string(),
            channel_id: "main".to_string(),
            is_stream: false,
            response_text: None,
        }
    }

    #[tokio::test]
    async fn test_reserve_and_refund() {
        let ledger = MemoryLedger::new();
        ledger.open_account(1, 1000);

        let id = ledger.reserve(1, 300).await.unwrap();
        assert_eq!(ledger.balance(1).await.unwrap(), 700);

        assert!(ledger.refund(id).await.unwrap());
        assert_eq!(ledger.balance(1).await.unwrap(), 1000);
        assert!(!ledger.refund(id).await.unwrap());
        assert_eq!(ledger.balance(1).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_reserve_insufficient() {
        let ledger = MemoryLedger::new();
        ledger.open_account(1, 100);

        let err = ledger.reserve(1, 101).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::Insufficient { token_id: 1, available: 100, requested: 101 }
        );
        assert_eq!(ledger.balance(1).await.unwrap(), 100);
        assert_eq!(ledger.reserve(2, 1).await.unwrap_err(), LedgerError::AccountNotFound(2));
    }

    #[tokio::test]
    async fn test_settle_charges_difference() {
        let ledger = MemoryLedger::new();
        ledger.open_account(1, 1000);

        let id = ledger.reserve(1, 100).await.unwrap();
        let record = ledger.settle(id, settlement(Usage::new(30, 12))).await.unwrap();

        assert_eq!(record.charged, 42);
        assert_eq!(record.delta, -58);
        assert_eq!(ledger.balance(1).await.unwrap(), 958);
        assert_eq!(ledger.reservation_state(&id), Some(ReservationState::Settled));
        assert!(!ledger.refund(id).await.unwrap());
        assert_eq!(
            ledger.settle(id, settlement(Usage::new(1, 1))).await.unwrap_err(),
            LedgerError::AlreadyResolved(id)
        );
        assert_eq!(ledger.records().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_reservation_still_settles_in_full() {
        let ledger = MemoryLedger::new();
        ledger.open_account(1, 1000);

        let id = ledger.reserve(1, 0).await.unwrap();
        assert_eq!(ledger.balance(1).await.unwrap(), 1000);
        ledger.settle(id, settlement(Usage::new(10, 10))).await.unwrap();
        assert_eq!(ledger.balance(1).await.unwrap(), 980);
    }
}
