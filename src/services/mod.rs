//! Service layer module
//!
//! Relay orchestration, quota accounting, pricing, routing and the shared HTTP clients

pub mod client;
pub mod error_handler;
pub mod meta;
pub mod pricing;
pub mod quota;
pub mod reconciler;
pub mod relay;
pub mod router;
pub mod settlement;
pub mod tokens;

pub use client::{HttpClients, RetryConfig};
pub use meta::{Caller, Meta};
pub use pricing::{ChargeRate, PriceRatio, PricingConfig, PricingTable};
pub use quota::{LedgerError, MemoryLedger, QuotaLedger, ReservationId, ReservationState};
pub use reconciler::{CapturedBody, StreamReconciler};
pub use relay::{RelayOrchestrator, RelayOutcome};
pub use router::ChannelRouter;
pub use settlement::{SettlementQueue, SettlementStats};
