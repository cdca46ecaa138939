//! Verification of signed RAV records.
//!
//! The verifier re-encodes the record canonically, checks the codec version,
//! chain id, and channel epoch against the expected values, and delegates the
//! raw signature check to an external [`SignatureVerifier`]. DID resolution
//! and the cryptographic scheme live behind that trait; the gateway only
//! cares that the key identified by `(payer_did, vm_id_fragment)` signed the
//! canonical bytes.

use async_trait::async_trait;

use crate::rav::{CODEC_VERSION, RavCodecError, SignedSubRav, VmIdFragment};
use crate::store::ChannelMetadata;

/// External capability resolving `(payer_did, vm_id_fragment)` to a key and
/// checking a detached signature with it.
///
/// `Ok(false)` means the key was resolved but the signature does not match;
/// resolver transport or DID-document failures are `Err`.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify_signature(
        &self,
        payer_did: &str,
        vm_id_fragment: &VmIdFragment,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, ResolverError>;
}

/// Failure inside the external resolver, distinct from a signature mismatch.
#[derive(Debug, thiserror::Error)]
#[error("resolver failure: {0}")]
pub struct ResolverError(pub String);

/// Errors surfaced by [`RavVerifier::verify`].
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("unknown codec version {0}")]
    UnknownVersion(u8),
    #[error("chain id mismatch: expected {expected}, got {actual}")]
    ChainMismatch { expected: u64, actual: u64 },
    #[error("channel epoch mismatch: expected {expected}, got {actual}")]
    EpochMismatch { expected: u64, actual: u64 },
    #[error(transparent)]
    ResolverFailure(#[from] ResolverError),
    #[error("signature does not match the canonical encoding")]
    InvalidSignature,
    #[error(transparent)]
    Codec(#[from] RavCodecError),
}

/// Verifies signed RAVs against a channel's identity and the payer's key.
pub struct RavVerifier {
    resolver: std::sync::Arc<dyn SignatureVerifier>,
    expected_chain_id: u64,
}

impl RavVerifier {
    pub fn new(resolver: std::sync::Arc<dyn SignatureVerifier>, expected_chain_id: u64) -> Self {
        RavVerifier {
            resolver,
            expected_chain_id,
        }
    }

    /// Checks version, chain id, and epoch, then the signature over the
    /// canonical bytes. The epoch is compared against the channel's current
    /// open epoch: records from earlier incarnations are rejected.
    pub async fn verify(
        &self,
        signed: &SignedSubRav,
        channel: &ChannelMetadata,
    ) -> Result<(), VerifyError> {
        let rav = &signed.sub_rav;
        if rav.version != CODEC_VERSION {
            return Err(VerifyError::UnknownVersion(rav.version));
        }
        if rav.chain_id != self.expected_chain_id {
            return Err(VerifyError::ChainMismatch {
                expected: self.expected_chain_id,
                actual: rav.chain_id,
            });
        }
        if rav.channel_epoch != channel.open_epoch {
            return Err(VerifyError::EpochMismatch {
                expected: channel.open_epoch,
                actual: rav.channel_epoch,
            });
        }

        let message = rav.to_canonical_bytes()?;
        let ok = self
            .resolver
            .verify_signature(
                &channel.payer_did,
                &rav.vm_id_fragment,
                &message,
                signed.signature.as_bytes(),
            )
            .await?;
        if ok {
            Ok(())
        } else {
            Err(VerifyError::InvalidSignature)
        }
    }
}

/// [`SignatureVerifier`] backed by a DID verification sidecar spoken to over
/// HTTP. The sidecar resolves the DID document, picks the verification
/// method by fragment, and checks the signature.
#[derive(Clone, Debug)]
pub struct HttpSignatureVerifier {
    verify_url: url::Url,
    client: reqwest::Client,
}

impl HttpSignatureVerifier {
    pub fn try_new(base_url: url::Url) -> Result<Self, url::ParseError> {
        let verify_url = base_url.join("./verify")?;
        Ok(HttpSignatureVerifier {
            verify_url,
            client: reqwest::Client::new(),
        })
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifySignatureRequest<'a> {
    payer_did: &'a str,
    vm_id_fragment: &'a str,
    message: String,
    signature: String,
}

#[derive(serde::Deserialize)]
struct VerifySignatureResponse {
    valid: bool,
}

#[async_trait]
impl SignatureVerifier for HttpSignatureVerifier {
    async fn verify_signature(
        &self,
        payer_did: &str,
        vm_id_fragment: &VmIdFragment,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, ResolverError> {
        let request = VerifySignatureRequest {
            payer_did,
            vm_id_fragment: vm_id_fragment.as_str(),
            message: crate::util::b64::encode_header(message),
            signature: format!("0x{}", hex::encode(signature)),
        };
        let response = self
            .client
            .post(self.verify_url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| ResolverError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ResolverError(format!(
                "verifier returned {}",
                response.status()
            )));
        }
        let body: VerifySignatureResponse = response
            .json()
            .await
            .map_err(|e| ResolverError(e.to_string()))?;
        Ok(body.valid)
    }
}
