//! The deferred-payment state machine.
//!
//! Each priced request carries a signed RAV settling the *previous*
//! proposal; the response carries the *next* unsigned proposal covering the
//! current request's cost. Per incoming request the processor:
//!
//! 1. parses the header envelope,
//! 2. classifies it as handshake (`nonce = 0`, amount `0`) or payment,
//! 3. matches a payment against its pending proposal field-by-field,
//! 4. verifies the signature,
//! 5. persists the RAV, reconciles sub-channel state, removes the pending
//!    entry, and notifies the claim scheduler with the unclaimed delta,
//! 6. (the handler computes the current request's cost via billing),
//! 7. emits the next proposal when the cost is non-zero.
//!
//! Steps 1–5 run under a verification timeout. Failures before step 5 mutate
//! nothing; failures after it leave the accepted RAV in place, and `save`
//! being idempotent lets the client retry the same signed record without
//! double-accounting.

use alloy_primitives::U256;
use axum::Json;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::chain::ChainClient;
use crate::claims::ClaimNotifier;
use crate::envelope::{self, RequestEnvelope, ResponseEnvelope};
use crate::error::ErrorCode;
use crate::rav::{ChannelId, SignedSubRav, SubChannelKey, SubRav};
use crate::store::{
    ChannelMetadata, ChannelStateCache, ChannelStatus, PendingProposalStore, RavStore,
    RavStoreError, SubChannelStateUpdate,
};
use crate::verify::{RavVerifier, VerifyError};

/// What the processor learned from the request envelope; input to
/// [`PaymentProcessor::finalize`] after billing.
#[derive(Debug, Clone)]
pub struct PaymentContext {
    pub signed: SignedSubRav,
    pub channel: ChannelMetadata,
    pub handshake: bool,
    /// Nonce of the RAV settled by this request.
    pub prev_nonce: u64,
    /// Accumulated amount of the RAV settled by this request.
    pub prev_accumulated: U256,
}

/// Client- and server-visible failures of the payment state machine.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("request carries no payment channel header")]
    PaymentRequired,
    #[error("invalid payment channel header: {0}")]
    InvalidHeader(String),
    #[error("no pending proposal matches the submitted record")]
    UnknownSubRav,
    #[error("submitted record does not match the pending proposal")]
    TamperedSubRav,
    #[error("signature does not match the canonical encoding")]
    InvalidSignature,
    #[error("channel epoch mismatch: expected {expected}, got {actual}")]
    EpochMismatch { expected: u64, actual: u64 },
    #[error("chain id mismatch: expected {expected}, got {actual}")]
    ChainMismatch { expected: u64, actual: u64 },
    #[error("unknown codec version {0}")]
    UnknownVersion(u8),
    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),
    #[error("channel {0} does not exist on-chain")]
    UnknownChannel(ChannelId),
    #[error("submitted record conflicts with the stored receipt log")]
    Conflict,
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("resolver unavailable: {0}")]
    ResolverUnavailable(String),
    #[error("chain access failure: {0}")]
    ChainAccess(String),
    #[error("payment verification timed out")]
    Timeout,
}

impl ProcessorError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProcessorError::PaymentRequired => ErrorCode::PaymentRequired,
            ProcessorError::InvalidHeader(_) | ProcessorError::UnknownChannel(_) => {
                ErrorCode::InvalidHeader
            }
            ProcessorError::UnknownSubRav => ErrorCode::UnknownSubRav,
            ProcessorError::TamperedSubRav | ProcessorError::Conflict => ErrorCode::TamperedSubRav,
            ProcessorError::InvalidSignature => ErrorCode::InvalidSignature,
            ProcessorError::EpochMismatch { .. } => ErrorCode::EpochMismatch,
            ProcessorError::ChainMismatch { .. } => ErrorCode::ChainMismatch,
            ProcessorError::UnknownVersion(_) => ErrorCode::UnknownVersion,
            ProcessorError::ChannelClosed(_) => ErrorCode::ChannelClosed,
            ProcessorError::Storage(_) | ProcessorError::Timeout => {
                ErrorCode::PaymentProcessingFailed
            }
            ProcessorError::ResolverUnavailable(_) | ProcessorError::ChainAccess(_) => {
                ErrorCode::NetworkError
            }
        }
    }
}

impl From<VerifyError> for ProcessorError {
    fn from(error: VerifyError) -> Self {
        match error {
            VerifyError::UnknownVersion(version) => ProcessorError::UnknownVersion(version),
            VerifyError::ChainMismatch { expected, actual } => {
                ProcessorError::ChainMismatch { expected, actual }
            }
            VerifyError::EpochMismatch { expected, actual } => {
                ProcessorError::EpochMismatch { expected, actual }
            }
            VerifyError::ResolverFailure(source) => {
                ProcessorError::ResolverUnavailable(source.to_string())
            }
            VerifyError::InvalidSignature => ProcessorError::InvalidSignature,
            VerifyError::Codec(source) => ProcessorError::InvalidHeader(source.to_string()),
        }
    }
}

impl IntoResponse for ProcessorError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let status = code.status_code();
        let message = if status.is_server_error() {
            let correlation_id = crate::error::correlation_id();
            tracing::error!(%correlation_id, error = %self, "payment processing failed");
            format!("payment processing failed (correlation id {correlation_id})")
        } else {
            self.to_string()
        };

        let envelope = ResponseEnvelope::failed(code, message.clone());
        let mut response =
            (status, Json(json!({ "error": message, "errorCode": code }))).into_response();
        if let Ok(value) = envelope::to_header_value(&envelope) {
            response
                .headers_mut()
                .insert(envelope::PAYMENT_CHANNEL_HEADER, value);
        }
        response
    }
}

/// Knobs the processor takes from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub service_id: String,
    pub verification_timeout: Duration,
}

/// The payee-side deferred-payment state machine.
pub struct PaymentProcessor {
    verifier: RavVerifier,
    rav_store: Arc<dyn RavStore>,
    pending: Arc<PendingProposalStore>,
    channels: Arc<ChannelStateCache>,
    chain: Arc<dyn ChainClient>,
    claims: Arc<dyn ClaimNotifier>,
    settings: ProcessorSettings,
    /// Per-sub-channel serialization of the accept sequence
    /// (save, state update, pending removal).
    sub_channel_locks: dashmap::DashMap<SubChannelKey, Arc<tokio::sync::Mutex<()>>>,
    tx_ref_prefix: String,
    tx_ref_seq: AtomicU64,
}

impl PaymentProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: RavVerifier,
        rav_store: Arc<dyn RavStore>,
        pending: Arc<PendingProposalStore>,
        channels: Arc<ChannelStateCache>,
        chain: Arc<dyn ChainClient>,
        claims: Arc<dyn ClaimNotifier>,
        settings: ProcessorSettings,
    ) -> Self {
        PaymentProcessor {
            verifier,
            rav_store,
            pending,
            channels,
            chain,
            claims,
            settings,
            sub_channel_locks: dashmap::DashMap::new(),
            tx_ref_prefix: format!("{:08x}", rand::random::<u32>()),
            tx_ref_seq: AtomicU64::new(0),
        }
    }

    pub fn pending(&self) -> &PendingProposalStore {
        &self.pending
    }

    pub fn service_id(&self) -> &str {
        &self.settings.service_id
    }

    pub fn channels(&self) -> &ChannelStateCache {
        &self.channels
    }

    /// Steps 1–5: parse, classify, match, verify, persist. Bounded by the
    /// verification timeout.
    pub async fn pre_process(
        &self,
        header: Option<&str>,
    ) -> Result<PaymentContext, ProcessorError> {
        let header = header.ok_or(ProcessorError::PaymentRequired)?;
        let request: RequestEnvelope = envelope::decode_request(header)
            .map_err(|e| ProcessorError::InvalidHeader(e.to_string()))?;

        tokio::time::timeout(
            self.settings.verification_timeout,
            self.verify_and_persist(request.signed_sub_rav),
        )
        .await
        .map_err(|_| ProcessorError::Timeout)?
    }

    async fn verify_and_persist(
        &self,
        signed: SignedSubRav,
    ) -> Result<PaymentContext, ProcessorError> {
        let rav = signed.sub_rav.clone();
        let channel = self.channel_metadata(&rav.channel_id).await?;
        if channel.status == ChannelStatus::Closed {
            return Err(ProcessorError::ChannelClosed(rav.channel_id.clone()));
        }
        let key = rav.sub_channel_key();
        let lock = self
            .sub_channel_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _serialized = lock.lock().await;

        if rav.is_handshake() {
            self.verifier.verify(&signed, &channel).await?;
            self.channels.update_sub_channel_state(
                &key,
                SubChannelStateUpdate {
                    epoch: Some(rav.channel_epoch),
                    nonce: Some(0),
                    accumulated_amount: Some(U256::ZERO),
                    ..Default::default()
                },
            );
            tracing::debug!(%key, "sub-channel handshake accepted");
            return Ok(PaymentContext {
                signed,
                channel,
                handshake: true,
                prev_nonce: 0,
                prev_accumulated: U256::ZERO,
            });
        }

        // Payment class: the submitted record must match its pending
        // proposal, or be an exact re-submission of the latest accepted one.
        match self.pending.find(&rav.channel_id, rav.nonce) {
            Some(pending) => {
                if pending != rav {
                    return Err(ProcessorError::TamperedSubRav);
                }
            }
            None => {
                let latest = self
                    .rav_store
                    .latest(&rav.channel_id, &rav.vm_id_fragment)
                    .await
                    .map_err(|e| ProcessorError::Storage(e.to_string()))?;
                match latest {
                    Some(latest) if latest == signed => {
                        // Retry after a failed proposal emission: the RAV is
                        // already persisted, fall through and re-accept.
                    }
                    _ => return Err(ProcessorError::UnknownSubRav),
                }
            }
        }

        self.verifier.verify(&signed, &channel).await?;

        self.rav_store.save(signed.clone()).await.map_err(|e| match e {
            RavStoreError::Regression { .. } => ProcessorError::Conflict,
            RavStoreError::Backend(message) => ProcessorError::Storage(message),
        })?;
        let state = self.channels.update_sub_channel_state(
            &key,
            SubChannelStateUpdate {
                epoch: Some(rav.channel_epoch),
                nonce: Some(rav.nonce),
                accumulated_amount: Some(rav.accumulated_amount),
                ..Default::default()
            },
        );
        self.pending.remove(&rav.channel_id, rav.nonce);

        let delta = rav
            .accumulated_amount
            .saturating_sub(state.last_claimed_amount);
        self.claims
            .notify(&rav.channel_id, &rav.vm_id_fragment, delta);

        tracing::debug!(%key, nonce = rav.nonce, %delta, "payment accepted");
        Ok(PaymentContext {
            signed,
            channel,
            handshake: false,
            prev_nonce: rav.nonce,
            prev_accumulated: rav.accumulated_amount,
        })
    }

    /// Step 7: emits the next proposal when the current request cost
    /// anything. Called only after billing succeeds.
    pub fn finalize(
        &self,
        context: &PaymentContext,
        cost: U256,
    ) -> Result<ResponseEnvelope, ProcessorError> {
        let tx_ref = self.next_tx_ref();
        if cost.is_zero() {
            return Ok(ResponseEnvelope::settled(None, U256::ZERO, tx_ref));
        }
        let previous = &context.signed.sub_rav;
        let proposal = SubRav {
            version: previous.version,
            chain_id: previous.chain_id,
            channel_id: previous.channel_id.clone(),
            channel_epoch: previous.channel_epoch,
            vm_id_fragment: previous.vm_id_fragment.clone(),
            accumulated_amount: context.prev_accumulated + cost,
            nonce: context.prev_nonce + 1,
        };
        self.pending.save(proposal.clone());
        tracing::debug!(
            channel_id = %proposal.channel_id,
            nonce = proposal.nonce,
            %cost,
            "proposal issued"
        );
        Ok(ResponseEnvelope::settled(Some(proposal), cost, tx_ref))
    }

    /// Channel metadata from the cache, fetched from the chain on first
    /// touch.
    async fn channel_metadata(
        &self,
        channel_id: &ChannelId,
    ) -> Result<ChannelMetadata, ProcessorError> {
        if let Some(metadata) = self.channels.channel(channel_id) {
            return Ok(metadata);
        }
        let onchain = self
            .chain
            .get_channel(channel_id)
            .await
            .map_err(|e| ProcessorError::ChainAccess(e.to_string()))?
            .ok_or_else(|| ProcessorError::UnknownChannel(channel_id.clone()))?;
        Ok(self.channels.observe_channel(ChannelMetadata {
            channel_id: onchain.channel_id,
            payer_did: onchain.payer_did,
            payee_did: onchain.payee_did,
            asset_id: onchain.asset_id,
            open_epoch: onchain.epoch,
            status: onchain.status,
        }))
    }

    fn next_tx_ref(&self) -> String {
        let seq = self.tx_ref_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.tx_ref_prefix, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainError, ClaimReceipt, OnChainChannel};
    use crate::rav::{CODEC_VERSION, RavSignature, VmIdFragment};
    use crate::verify::{ResolverError, SignatureVerifier};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const CHAIN_ID: u64 = 4;

    /// Accepts exactly the signature byte `[1]`.
    struct ByteResolver;

    #[async_trait]
    impl SignatureVerifier for ByteResolver {
        async fn verify_signature(
            &self,
            _payer_did: &str,
            _fragment: &VmIdFragment,
            _message: &[u8],
            signature: &[u8],
        ) -> Result<bool, ResolverError> {
            Ok(signature == [1u8])
        }
    }

    struct StaticChain;

    #[async_trait]
    impl ChainClient for StaticChain {
        async fn claim(&self, _rav: &SignedSubRav) -> Result<ClaimReceipt, ChainError> {
            Ok(ClaimReceipt {
                tx_hash: "0xabc".to_string(),
            })
        }

        async fn get_channel(
            &self,
            channel_id: &ChannelId,
        ) -> Result<Option<OnChainChannel>, ChainError> {
            if channel_id.as_str() != "CH" {
                return Ok(None);
            }
            Ok(Some(OnChainChannel {
                channel_id: channel_id.clone(),
                payer_did: "did:example:payer".to_string(),
                payee_did: "did:example:payee".to_string(),
                asset_id: "pusd".to_string(),
                epoch: 0,
                status: ChannelStatus::Active,
                hub_balance: U256::from(1_000_000u64),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        deltas: Mutex<Vec<(ChannelId, VmIdFragment, U256)>>,
    }

    impl ClaimNotifier for RecordingNotifier {
        fn notify(&self, channel_id: &ChannelId, vm_id_fragment: &VmIdFragment, delta: U256) {
            self.deltas.lock().unwrap().push((
                channel_id.clone(),
                vm_id_fragment.clone(),
                delta,
            ));
        }
    }

    struct Fixture {
        processor: PaymentProcessor,
        notifier: Arc<RecordingNotifier>,
        rav_store: Arc<crate::store::MemoryRavStore>,
    }

    fn fixture() -> Fixture {
        let rav_store = Arc::new(crate::store::MemoryRavStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let processor = PaymentProcessor::new(
            RavVerifier::new(Arc::new(ByteResolver), CHAIN_ID),
            rav_store.clone(),
            Arc::new(PendingProposalStore::new()),
            Arc::new(ChannelStateCache::new()),
            Arc::new(StaticChain),
            notifier.clone(),
            ProcessorSettings {
                service_id: "gateway".to_string(),
                verification_timeout: Duration::from_secs(5),
            },
        );
        Fixture {
            processor,
            notifier,
            rav_store,
        }
    }

    fn rav(nonce: u64, amount: u64) -> SubRav {
        SubRav {
            version: CODEC_VERSION,
            chain_id: CHAIN_ID,
            channel_id: ChannelId::new("CH"),
            channel_epoch: 0,
            vm_id_fragment: VmIdFragment::new("F"),
            accumulated_amount: U256::from(amount),
            nonce,
        }
    }

    fn signed(sub_rav: SubRav) -> SignedSubRav {
        SignedSubRav {
            sub_rav,
            signature: RavSignature(vec![1]),
        }
    }

    fn header_for(signed_sub_rav: SignedSubRav) -> String {
        envelope::encode_request(&RequestEnvelope { signed_sub_rav }).unwrap()
    }

    #[tokio::test]
    async fn test_missing_header_is_payment_required() {
        let fixture = fixture();
        let error = fixture.processor.pre_process(None).await.unwrap_err();
        assert_eq!(error.error_code(), ErrorCode::PaymentRequired);
    }

    #[tokio::test]
    async fn test_malformed_header_is_invalid() {
        let fixture = fixture();
        let error = fixture
            .processor
            .pre_process(Some("!!!garbage!!!"))
            .await
            .unwrap_err();
        assert_eq!(error.error_code(), ErrorCode::InvalidHeader);
    }

    #[tokio::test]
    async fn test_handshake_then_first_paid_request() {
        let fixture = fixture();
        let handshake = signed(rav(0, 0));

        // S1: handshake, cost 0, no proposal.
        let ctx = fixture
            .processor
            .pre_process(Some(&header_for(handshake.clone())))
            .await
            .unwrap();
        assert!(ctx.handshake);
        let response = fixture.processor.finalize(&ctx, U256::ZERO).unwrap();
        assert_eq!(response.amount_debited, U256::ZERO);
        assert!(response.sub_rav.is_none());
        let state = fixture
            .processor
            .channels()
            .sub_channel_state(&handshake.sub_channel_key());
        assert_eq!(state.nonce, 0);
        assert_eq!(state.accumulated_amount, U256::ZERO);

        // S2: the same handshake record again, now with cost 100.
        let ctx = fixture
            .processor
            .pre_process(Some(&header_for(handshake)))
            .await
            .unwrap();
        let response = fixture.processor.finalize(&ctx, U256::from(100u64)).unwrap();
        assert_eq!(response.amount_debited, U256::from(100u64));
        let proposal = response.sub_rav.unwrap();
        assert_eq!(proposal.nonce, 1);
        assert_eq!(proposal.accumulated_amount, U256::from(100u64));
        assert_eq!(
            fixture.processor.pending().find(&ChannelId::new("CH"), 1),
            Some(proposal)
        );
    }

    #[tokio::test]
    async fn test_settlement_of_previous_proposal() {
        let fixture = fixture();
        // Stage: pending proposal (CH, 1, 100) exists.
        fixture.processor.pending().save(rav(1, 100));

        // S3: client submits the signed copy, new request costs 50.
        let ctx = fixture
            .processor
            .pre_process(Some(&header_for(signed(rav(1, 100)))))
            .await
            .unwrap();
        assert!(!ctx.handshake);
        assert_eq!(fixture.processor.pending().find(&ChannelId::new("CH"), 1), None);
        assert_eq!(
            fixture
                .rav_store
                .latest(&ChannelId::new("CH"), &VmIdFragment::new("F"))
                .await
                .unwrap()
                .unwrap()
                .nonce(),
            1
        );

        let response = fixture.processor.finalize(&ctx, U256::from(50u64)).unwrap();
        let proposal = response.sub_rav.unwrap();
        assert_eq!(proposal.nonce, 2);
        assert_eq!(proposal.accumulated_amount, U256::from(150u64));

        // S5 precondition: the scheduler saw delta 100 (claimed cursor 0).
        let deltas = fixture.notifier.deltas.lock().unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].2, U256::from(100u64));
    }

    #[tokio::test]
    async fn test_tampered_record_rejected_without_mutation() {
        let fixture = fixture();
        fixture.processor.pending().save(rav(1, 100));

        // S4: mismatched amount.
        let error = fixture
            .processor
            .pre_process(Some(&header_for(signed(rav(1, 1)))))
            .await
            .unwrap_err();
        assert_eq!(error.error_code(), ErrorCode::TamperedSubRav);

        // Pending entry remains, nothing stored, nothing notified.
        assert!(fixture.processor.pending().find(&ChannelId::new("CH"), 1).is_some());
        assert!(
            fixture
                .rav_store
                .latest(&ChannelId::new("CH"), &VmIdFragment::new("F"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(fixture.notifier.deltas.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_proposal_is_unknown() {
        let fixture = fixture();
        // No pending entry (TTL removed it).
        let error = fixture
            .processor
            .pre_process(Some(&header_for(signed(rav(1, 100)))))
            .await
            .unwrap_err();
        assert_eq!(error.error_code(), ErrorCode::UnknownSubRav);
    }

    #[tokio::test]
    async fn test_resubmission_after_lost_response_is_idempotent() {
        let fixture = fixture();
        fixture.processor.pending().save(rav(1, 100));
        let first = fixture
            .processor
            .pre_process(Some(&header_for(signed(rav(1, 100)))))
            .await
            .unwrap();
        fixture.processor.finalize(&first, U256::from(50u64)).unwrap();

        // The client never saw the response and retries the same record.
        let retry = fixture
            .processor
            .pre_process(Some(&header_for(signed(rav(1, 100)))))
            .await
            .unwrap();
        assert_eq!(retry.prev_nonce, 1);
        // Exactly one stored record.
        assert_eq!(
            fixture.rav_store.list(&ChannelId::new("CH")).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_invalid_signature_rejected() {
        let fixture = fixture();
        fixture.processor.pending().save(rav(1, 100));
        let mut bad = signed(rav(1, 100));
        bad.signature = RavSignature(vec![9]);
        let error = fixture
            .processor
            .pre_process(Some(&header_for(bad)))
            .await
            .unwrap_err();
        assert_eq!(error.error_code(), ErrorCode::InvalidSignature);
    }

    #[tokio::test]
    async fn test_stale_epoch_rejected() {
        let fixture = fixture();
        let mut stale = rav(0, 0);
        stale.channel_epoch = 7;
        let error = fixture
            .processor
            .pre_process(Some(&header_for(signed(stale))))
            .await
            .unwrap_err();
        assert_eq!(error.error_code(), ErrorCode::EpochMismatch);
    }

    #[tokio::test]
    async fn test_wrong_chain_rejected() {
        let fixture = fixture();
        let mut wrong = rav(0, 0);
        wrong.chain_id = 99;
        let error = fixture
            .processor
            .pre_process(Some(&header_for(signed(wrong))))
            .await
            .unwrap_err();
        assert_eq!(error.error_code(), ErrorCode::ChainMismatch);
    }

    #[tokio::test]
    async fn test_unknown_channel_rejected() {
        let fixture = fixture();
        let mut unknown = rav(0, 0);
        unknown.channel_id = ChannelId::new("missing");
        let error = fixture
            .processor
            .pre_process(Some(&header_for(signed(unknown))))
            .await
            .unwrap_err();
        assert_eq!(error.error_code(), ErrorCode::InvalidHeader);
    }

    #[tokio::test]
    async fn test_tx_refs_are_monotonic() {
        let fixture = fixture();
        let a = fixture.processor.next_tx_ref();
        let b = fixture.processor.next_tx_ref();
        assert_ne!(a, b);
        assert!(a.ends_with("-0"));
        assert!(b.ends_with("-1"));
    }
}
