//! Opaque protocol records.
//!
//! The account never interprets key or session material; it only needs a
//! record's id to enforce allocation order. Records are persisted as CBOR.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::StoreError;

/// Encode any record as CBOR.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(bytes)
}

/// Decode a CBOR record.
///
/// # Errors
///
/// `StoreError::InvalidRecord` if the bytes are not a valid encoding of `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::InvalidRecord(e.to_string()))
}

/// One-time elliptic-curve pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyRecord {
    /// Allocator-assigned id
    pub id: u32,
    /// Serialized key pair
    pub key_pair: Vec<u8>,
}

/// Medium-term signed pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    /// Allocator-assigned id
    pub id: u32,
    /// Creation time, milliseconds since the epoch
    pub timestamp: u64,
    /// Serialized key pair
    pub key_pair: Vec<u8>,
    /// Signature by the role's identity key
    pub signature: Vec<u8>,
}

/// Post-quantum pre-key, one-time or last-resort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KyberPreKeyRecord {
    /// Allocator-assigned id
    pub id: u32,
    /// Creation time, milliseconds since the epoch
    pub timestamp: u64,
    /// Serialized key pair
    pub key_pair: Vec<u8>,
    /// Signature by the role's identity key
    pub signature: Vec<u8>,
}

macro_rules! impl_record_codec {
    ($($ty:ty),+) => {$(
        impl $ty {
            /// CBOR encoding.
            pub fn serialize(&self) -> Result<Vec<u8>, StoreError> {
                to_cbor(self)
            }

            /// Decode from CBOR.
            pub fn deserialize(bytes: &[u8]) -> Result<Self, StoreError> {
                from_cbor(bytes)
            }
        }
    )+};
}

impl_record_codec!(PreKeyRecord, SignedPreKeyRecord, KyberPreKeyRecord);

/// Ratchet state with one remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Serialized session state
    pub data: Vec<u8>,
    /// Session was archived and must be re-established before use
    pub archived: bool,
}

impl SessionRecord {
    /// Fresh, active session.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, archived: false }
    }
}

/// Sender-key state for one (sender, distribution) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    /// Serialized sender key state
    pub data: Vec<u8>,
    /// Creation time, milliseconds since the epoch
    pub created_at: u64,
}

/// Full pre-key set for one role, as agreed with the service during
/// registration or re-registration.
///
/// The base ids are the metadata the role adopts before the records are
/// added; the records must then continue from those ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyCollection {
    /// First id of `one_time_pre_keys`
    pub one_time_pre_key_offset: u32,
    /// Id of `signed_pre_key`
    pub next_signed_pre_key_id: u32,
    /// First id of `one_time_kyber_pre_keys`
    pub one_time_kyber_pre_key_offset: u32,
    /// One-time elliptic-curve pre-keys
    pub one_time_pre_keys: Vec<PreKeyRecord>,
    /// Signed pre-key, if the collection renews it
    pub signed_pre_key: Option<SignedPreKeyRecord>,
    /// One-time post-quantum pre-keys
    pub one_time_kyber_pre_keys: Vec<KyberPreKeyRecord>,
    /// Last-resort post-quantum pre-key, if the collection renews it
    pub last_resort_kyber_pre_key: Option<KyberPreKeyRecord>,
}
