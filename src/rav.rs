//! Core data model for the deferred-payment protocol.
//!
//! A **SubRAV** (sub-channel Receipt-And-Value record) describes the
//! monotonically increasing obligation of a payer to the gateway under one
//! sub-channel of a payment channel. A [`SignedSubRav`] adds a detached
//! signature over the record's canonical byte encoding, produced by the key
//! identified by the sub-channel's verification-method fragment.
//!
//! The canonical encoding defined here is the signature domain: fields in
//! fixed order, integers fixed-width big-endian, variable-length fields
//! length-prefixed. The encoding is injective, so two distinct records can
//! never share a byte string.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;

use crate::util::num_str;

/// Codec version accepted by this build. Records carrying any other version
/// are rejected before signature verification.
pub const CODEC_VERSION: u8 = 1;

/// Fixed byte width of the accumulated amount in the canonical encoding.
const AMOUNT_WIDTH: usize = 32;

/// Opaque identifier of a payment channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        ChannelId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        ChannelId(s.to_string())
    }
}

/// The payer's verification-method fragment. Identifies the sub-channel
/// within a channel and selects the key that signs its RAVs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmIdFragment(String);

impl VmIdFragment {
    pub fn new<S: Into<String>>(fragment: S) -> Self {
        VmIdFragment(fragment.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for VmIdFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VmIdFragment {
    fn from(s: &str) -> Self {
        VmIdFragment(s.to_string())
    }
}

/// Composite key of a sub-channel: `(channel, verification-method fragment)`.
///
/// All per-sub-channel serialization in the stores and the claim scheduler is
/// keyed by this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubChannelKey {
    pub channel_id: ChannelId,
    pub vm_id_fragment: VmIdFragment,
}

impl SubChannelKey {
    pub fn new(channel_id: ChannelId, vm_id_fragment: VmIdFragment) -> Self {
        SubChannelKey {
            channel_id,
            vm_id_fragment,
        }
    }
}

impl Display for SubChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.channel_id, self.vm_id_fragment)
    }
}

/// Immutable receipt-and-value record for one sub-channel.
///
/// `accumulated_amount` is cumulative (asset minor units) and non-decreasing
/// across the sub-channel's accepted records; `nonce` is strictly increasing.
/// `(channel_id, channel_epoch)` is the logical channel identity: the epoch
/// increments on channel reset, which invalidates all earlier records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubRav {
    pub version: u8,
    pub chain_id: u64,
    pub channel_id: ChannelId,
    pub channel_epoch: u64,
    pub vm_id_fragment: VmIdFragment,
    #[serde(with = "num_str::u256_dec")]
    pub accumulated_amount: U256,
    #[serde(with = "num_str::u64_dec")]
    pub nonce: u64,
}

impl SubRav {
    pub fn sub_channel_key(&self) -> SubChannelKey {
        SubChannelKey::new(self.channel_id.clone(), self.vm_id_fragment.clone())
    }

    /// A handshake record opens a sub-channel without owing anything yet.
    pub fn is_handshake(&self) -> bool {
        self.nonce == 0 && self.accumulated_amount.is_zero()
    }

    /// Canonical byte encoding used as the signature domain.
    ///
    /// Layout: `version:u8 | chain_id:u64be | len:u16be channel_id |
    /// channel_epoch:u64be | len:u16be vm_id_fragment | amount:32be |
    /// nonce:u64be`.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, RavCodecError> {
        let channel_id = self.channel_id.as_str().as_bytes();
        let fragment = self.vm_id_fragment.as_str().as_bytes();
        if channel_id.len() > u16::MAX as usize {
            return Err(RavCodecError::FieldTooLong("channelId"));
        }
        if fragment.len() > u16::MAX as usize {
            return Err(RavCodecError::FieldTooLong("vmIdFragment"));
        }

        let mut out = Vec::with_capacity(
            1 + 8 + 2 + channel_id.len() + 8 + 2 + fragment.len() + AMOUNT_WIDTH + 8,
        );
        out.push(self.version);
        out.extend_from_slice(&self.chain_id.to_be_bytes());
        out.extend_from_slice(&(channel_id.len() as u16).to_be_bytes());
        out.extend_from_slice(channel_id);
        out.extend_from_slice(&self.channel_epoch.to_be_bytes());
        out.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
        out.extend_from_slice(fragment);
        out.extend_from_slice(&self.accumulated_amount.to_be_bytes::<AMOUNT_WIDTH>());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        Ok(out)
    }

    /// Decodes a canonical byte string produced by [`SubRav::to_canonical_bytes`].
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<SubRav, RavCodecError> {
        let mut reader = CanonicalReader::new(bytes);
        let version = reader.read_u8()?;
        if version != CODEC_VERSION {
            return Err(RavCodecError::UnknownVersion(version));
        }
        let chain_id = reader.read_u64()?;
        let channel_id = reader.read_string()?;
        let channel_epoch = reader.read_u64()?;
        let vm_id_fragment = reader.read_string()?;
        let accumulated_amount = reader.read_u256()?;
        let nonce = reader.read_u64()?;
        reader.finish()?;
        Ok(SubRav {
            version,
            chain_id,
            channel_id: ChannelId::new(channel_id),
            channel_epoch,
            vm_id_fragment: VmIdFragment::new(vm_id_fragment),
            accumulated_amount,
            nonce,
        })
    }
}

/// A detached signature over a [`SubRav`]'s canonical bytes.
///
/// The signature scheme is determined by the payer's verification method and
/// checked by an external resolver; the gateway treats the bytes as opaque.
/// Serialized as 0x-prefixed hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RavSignature(pub Vec<u8>);

impl RavSignature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for RavSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(&self.0)))
    }
}

impl<'de> Deserialize<'de> for RavSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let stripped = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(stripped)
            .map_err(|_| serde::de::Error::custom("signature must be hex-encoded"))?;
        Ok(RavSignature(bytes))
    }
}

/// A [`SubRav`] plus the payer's signature over its canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedSubRav {
    pub sub_rav: SubRav,
    pub signature: RavSignature,
}

impl SignedSubRav {
    pub fn sub_channel_key(&self) -> SubChannelKey {
        self.sub_rav.sub_channel_key()
    }

    pub fn nonce(&self) -> u64 {
        self.sub_rav.nonce
    }

    pub fn accumulated_amount(&self) -> U256 {
        self.sub_rav.accumulated_amount
    }
}

/// Errors produced by the canonical codec.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RavCodecError {
    #[error("unknown codec version {0}")]
    UnknownVersion(u8),
    #[error("canonical encoding truncated")]
    Truncated,
    #[error("trailing bytes after canonical encoding")]
    TrailingBytes,
    #[error("{0} exceeds the maximum encodable length")]
    FieldTooLong(&'static str),
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

struct CanonicalReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> CanonicalReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        CanonicalReader { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], RavCodecError> {
        let end = self.pos.checked_add(len).ok_or(RavCodecError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(RavCodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, RavCodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, RavCodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u64(&mut self) -> Result<u64, RavCodecError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    fn read_u256(&mut self) -> Result<U256, RavCodecError> {
        let bytes = self.take(AMOUNT_WIDTH)?;
        let mut arr = [0u8; AMOUNT_WIDTH];
        arr.copy_from_slice(bytes);
        Ok(U256::from_be_bytes(arr))
    }

    fn read_string(&mut self) -> Result<String, RavCodecError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| RavCodecError::InvalidUtf8("string field"))
    }

    fn finish(&self) -> Result<(), RavCodecError> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(RavCodecError::TrailingBytes)
        }
    }
}
