//! Relay orchestration
//!
//! Runs one call through validate, resolve, reserve, dispatch, call, error check,
//! respond and settle. Once a reservation exists every exit path resolves it
//! exactly once, either by refund or by a queued settlement.

use crate::adaptor::{Adaptor, AdaptorRegistry, ApiType, ClientSink, ResponseFailure};
use crate::config::{AppConfig, QuotaPolicy, Settings};
use crate::models::openai::GeneralRequest;
use crate::models::Usage;
use crate::services::client::{HttpClients, RetryConfig};
use crate::services::error_handler::{is_error_happened, relay_error_handler};
use crate::services::meta::{Caller, Meta};
use crate::services::pricing::{ChargeRate, PricingTable};
use crate::services::quota::{LedgerError, QuotaLedger, ReservationId, Settlement};
use crate::services::reconciler::StreamReconciler;
use crate::services::router::ChannelRouter;
use crate::services::settlement::{SettlementJob, SettlementQueue, Transcript};
use crate::services::tokens::count_message_tokens;
use crate::utils::error::{ErrorContext, RelayError, RelayResult};
use crate::utils::logging::create_request_log_summary;
use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const MAX_TOKENS_LIMIT: u32 = (i32::MAX / 2) as u32;

/// Result of a successful relay
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub reservation_id: ReservationId,
    pub usage: Usage,
    pub meta: Meta,
}

/// Sequences one relay call
pub struct RelayOrchestrator {
    router: ChannelRouter,
    pricing: Arc<PricingTable>,
    ledger: Arc<dyn QuotaLedger>,
    settlement: Arc<SettlementQueue>,
    adaptors: AdaptorRegistry,
    policy: QuotaPolicy,
}

impl RelayOrchestrator {
    pub fn new(
        router: ChannelRouter,
        pricing: Arc<PricingTable>,
        ledger: Arc<dyn QuotaLedger>,
        settlement: Arc<SettlementQueue>,
        adaptors: AdaptorRegistry,
        policy: QuotaPolicy,
    ) -> Self {
        Self {
            router,
            pricing,
            ledger,
            settlement,
            adaptors,
            policy,
        }
    }

    /// Wire everything from configuration; starts the settlement worker
    pub fn from_config(config: &AppConfig, settings: &Settings, ledger: Arc<dyn QuotaLedger>) -> Result<Self> {
        let clients = HttpClients::from_settings(settings)?;
        let settlement = SettlementQueue::spawn(
            ledger.clone(),
            settings.settlement.queue_capacity,
            RetryConfig::from_settings(settings),
        );

        Ok(Self::new(
            ChannelRouter::from_config(config),
            Arc::new(PricingTable::new(config.pricing.clone())),
            ledger,
            settlement,
            AdaptorRegistry::new(clients),
            config.quota,
        ))
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.router
    }

    pub fn pricing(&self) -> &Arc<PricingTable> {
        &self.pricing
    }

    pub fn settlement(&self) -> &Arc<SettlementQueue> {
        &self.settlement
    }

    /// Relay one chat completion call; output goes to `sink`
    pub async fn relay_text(
        &self,
        caller: &Caller,
        request_id: &str,
        body: Bytes,
        sink: &mut ClientSink,
    ) -> RelayResult<RelayOutcome> {
        // validate
        let mut request = parse_general_request(&body)?;
        validate_general_request(&request)?;
        debug!("Relay request: {}", create_request_log_summary(&request));

        // resolve
        let (channel_id, channel) = self
            .router
            .select(&request.model, &caller.group)
            .ok_or_else(|| {
                RelayError::ModelUnavailable(format!(
                    "no available channel for model {} under group {}",
                    request.model, caller.group
                ))
            })?;
        let mut meta = Meta::new(
            request_id,
            channel_id,
            channel,
            caller.token_id,
            &caller.group,
            &request.model,
            request.is_stream(),
        );
        let mapped = meta.apply_model_mapping();
        if mapped {
            debug!("Mapped model '{}' to '{}'", meta.origin_model, meta.actual_model);
            request.model = meta.actual_model.clone();
        }
        meta.prompt_tokens = count_message_tokens(&request.messages);
        let rate = self.pricing.charge_rate(&meta.actual_model, &meta.group);

        info!(
            "Relaying {} to channel '{}' ({}) for account {}, stream={}",
            meta.actual_model,
            meta.channel_id,
            meta.channel_type.as_str(),
            meta.token_id,
            meta.is_stream
        );

        // reserve
        let estimate = rate.estimate(
            self.policy.pre_consumed_quota
                + i64::from(meta.prompt_tokens)
                + i64::from(request.max_tokens.unwrap_or(0)),
        );
        let amount = self.reservation_amount(caller.token_id, estimate).await?;
        let reservation_id = self
            .ledger
            .reserve(caller.token_id, amount)
            .await
            .map_err(ledger_error)?;

        // dispatch
        let Some(adaptor) = self.adaptors.get(&meta).map(Arc::<dyn Adaptor>::from) else {
            self.refund(reservation_id).await;
            return Err(RelayError::UnsupportedApiType(format!(
                "channel type {} has no adaptor",
                meta.channel_type.as_str()
            )));
        };

        let mut reconciler = None;
        let result = self
            .call(adaptor.as_ref(), &request, &body, mapped, &meta, sink, &mut reconciler)
            .await;

        // the adaptor has returned and dropped the body, so the capture is complete;
        // its text is rebuilt by the settlement worker
        let transcript = match reconciler {
            Some(reconciler) if meta.is_stream => Some(Transcript {
                captured: reconciler.freeze(),
                adaptor: adaptor.clone(),
            }),
            _ => None,
        };

        match result {
            Ok(usage) => {
                self.enqueue_settlement(reservation_id, &meta, usage, rate, transcript);
                Ok(RelayOutcome {
                    reservation_id,
                    usage,
                    meta,
                })
            }
            Err(ResponseFailure { error, partial_usage }) => {
                match (&error, partial_usage) {
                    (RelayError::ClientDisconnected, Some(usage)) => {
                        warn!(
                            "Client disconnected, billing {} partial tokens for reservation {}",
                            usage.total_tokens, reservation_id
                        );
                        self.enqueue_settlement(reservation_id, &meta, usage, rate, transcript);
                    }
                    _ => self.refund(reservation_id).await,
                }

                if sink.is_committed() && !matches!(error, RelayError::ClientDisconnected) {
                    if let Err(e) = sink.send_error(&error.to_uniform()).await {
                        debug!("Could not deliver error event: {}", e);
                    }
                }
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn call(
        &self,
        adaptor: &dyn Adaptor,
        request: &GeneralRequest,
        body: &Bytes,
        mapped: bool,
        meta: &Meta,
        sink: &mut ClientSink,
        reconciler: &mut Option<StreamReconciler>,
    ) -> Result<Usage, ResponseFailure> {
        let url = adaptor.build_url(meta)?;
        let headers = adaptor.build_headers(meta)?;

        let payload = if meta.api_type == Some(ApiType::OpenAI)
            && !mapped
            && !meta.channel_type.requires_reserialize()
        {
            body.clone()
        } else {
            let converted = adaptor.convert_request(request)?;
            Bytes::from(serde_json::to_vec(&converted).map_err(RelayError::from)?)
        };

        debug!("Sending {} bytes to {} via {}", payload.len(), url, adaptor.name());
        let response = adaptor.do_request(&url, headers, payload).await?;

        if is_error_happened(meta, &response) {
            return Err(relay_error_handler(response).await.into());
        }

        let (response, tee) = StreamReconciler::wrap(response);
        *reconciler = Some(tee);
        adaptor.do_response(response, meta, sink).await
    }

    async fn reservation_amount(&self, token_id: u64, estimate: i64) -> RelayResult<i64> {
        let balance = self.ledger.balance(token_id).await.map_err(ledger_error)?;
        if estimate > 0 && balance > estimate.saturating_mul(self.policy.trust_multiplier) {
            debug!("Account {} holds {} which is trusted, not pre-charging", token_id, balance);
            return Ok(0);
        }
        Ok(estimate)
    }

    async fn refund(&self, reservation_id: ReservationId) {
        match self.ledger.refund(reservation_id).await {
            Ok(true) => debug!("Refunded reservation {}", reservation_id),
            Ok(false) => warn!("Reservation {} was already resolved", reservation_id),
            Err(e) => error!("Failed to refund reservation {}: {}", reservation_id, e),
        }
    }

    fn enqueue_settlement(
        &self,
        reservation_id: ReservationId,
        meta: &Meta,
        usage: Usage,
        rate: ChargeRate,
        transcript: Option<Transcript>,
    ) {
        self.settlement.enqueue(SettlementJob {
            reservation_id,
            token_id: meta.token_id,
            settlement: Settlement {
                request_id: meta.request_id.clone(),
                usage,
                rate,
                origin_model: meta.origin_model.clone(),
                actual_model: meta.actual_model.clone(),
                channel_id: meta.channel_id.clone(),
                is_stream: meta.is_stream,
                response_text: None,
            },
            transcript,
        });
    }
}

/// Parse the inbound body
pub fn parse_general_request(body: &[u8]) -> RelayResult<GeneralRequest> {
    serde_json::from_slice(body).invalid_request_context("Failed to parse request body")
}

/// Reject requests no backend could serve
pub fn validate_general_request(request: &GeneralRequest) -> RelayResult<()> {
    if request.model.trim().is_empty() {
        return Err(RelayError::InvalidRequest("model is required".to_string()));
    }
    if request.messages.is_empty() {
        return Err(RelayError::InvalidRequest("messages must not be empty".to_string()));
    }
    if request.max_tokens.map_or(false, |m| m > MAX_TOKENS_LIMIT) {
        return Err(RelayError::InvalidRequest("max_tokens is invalid".to_string()));
    }
    if request.n == Some(0) {
        return Err(RelayError::InvalidRequest("n must be at least 1".to_string()));
    }
    Ok(())
}

fn ledger_error(error: LedgerError) -> RelayError {
    match error {
        LedgerError::Insufficient { .. } | LedgerError::AccountNotFound(_) => {
            RelayError::QuotaInsufficient(error.to_string())
        }
        other => RelayError::Internal(format!("quota ledger: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_malformed_body() {
        assert!(matches!(
            parse_general_request(b"{not json"),
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_validate_general_request() {
        let request = parse_general_request(br#"{"model":"gpt-x","messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert!(validate_general_request(&request).is_ok());

        let request = parse_general_request(br#"{"model":"","messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert!(validate_general_request(&request).is_err());

        let request = parse_general_request(br#"{"model":"gpt-x","messages":[]}"#).unwrap();
        assert!(validate_general_request(&request).is_err());

        let request = parse_general_request(
            br#"{"model":"gpt-x","messages":[{"role":"user","content":"hi"}],"max_tokens":4000000000}"#,
        )
        .unwrap();
        assert!(validate_general_request(&request).is_err());
    }

    #[test]
    fn test_ledger_error_mapping() {
        let err = ledger_error(LedgerError::Insufficient { token_id: 1, available: 0, requested: 5 });
        assert_eq!(err.code(), "insufficient_user_quota");
        let err = ledger_error(LedgerError::Unavailable("down".to_string()));
        assert_eq!(err.status_code(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
