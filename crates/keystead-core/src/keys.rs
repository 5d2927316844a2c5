//! Key material held by the account.
//!
//! Identity keys are Ed25519. The symmetric keys (profile, master, storage)
//! are opaque 32-byte values; the account only stores them and derives a
//! few labelled sub-keys with HMAC-SHA256.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use ed25519_dalek::{SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::KeyError;

/// Size of every key type in this module.
pub const KEY_LEN: usize = 32;

/// Largest registration id the service accepts.
pub const MAX_REGISTRATION_ID: u32 = 16380;

const PASSWORD_BYTES: usize = 18;

const STORAGE_SERVICE_LABEL: &[u8] = b"Storage Service Encryption";
const REGISTRATION_LOCK_LABEL: &[u8] = b"Registration Lock";
const UNIDENTIFIED_ACCESS_LABEL: &[u8] = b"Unidentified Access Key";

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], label: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(label);
    mac.finalize().into_bytes().into()
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], KeyError> {
    bytes.try_into().map_err(|_| KeyError::InvalidLength { expected: N, got: bytes.len() })
}

/// Public half of an identity key pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey([u8; KEY_LEN]);

impl IdentityKey {
    /// Decode and validate a public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw = fixed::<KEY_LEN>(bytes)?;
        VerifyingKey::from_bytes(&raw).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self(raw))
    }

    /// Raw encoding.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", hex::encode(&self.0[..8]))
    }
}

/// Identity key pair of one role.
///
/// The private half is zeroed on drop.
#[derive(Clone)]
pub struct IdentityKeyPair {
    public: IdentityKey,
    private: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh key pair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let private = SigningKey::generate(rng);
        let public = IdentityKey(private.verifying_key().to_bytes());
        Self { public, private }
    }

    /// Rebuild a key pair from its stored halves.
    ///
    /// # Errors
    ///
    /// - `KeyError::InvalidLength` if either half is not 32 bytes
    /// - `KeyError::Mismatch` if the private key does not derive `public`
    pub fn from_parts(public: &[u8], private: &[u8]) -> Result<Self, KeyError> {
        let public = IdentityKey::from_bytes(public)?;
        let mut raw = fixed::<KEY_LEN>(private)?;
        let private = SigningKey::from_bytes(&raw);
        raw.zeroize();
        if private.verifying_key().to_bytes() != public.0 {
            return Err(KeyError::Mismatch);
        }
        Ok(Self { public, private })
    }

    /// Decode the 64-byte `public || private` concatenation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 2 * KEY_LEN {
            return Err(KeyError::InvalidLength { expected: 2 * KEY_LEN, got: bytes.len() });
        }
        let (public, private) = bytes.split_at(KEY_LEN);
        Self::from_parts(public, private)
    }

    /// Encode as `public || private`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * KEY_LEN);
        out.extend_from_slice(self.public.as_bytes());
        out.extend_from_slice(&self.private.to_bytes());
        out
    }

    /// Public half.
    pub fn public_key(&self) -> IdentityKey {
        self.public
    }

    /// Private half, raw. Callers are responsible for not retaining it.
    pub fn private_key_bytes(&self) -> [u8; KEY_LEN] {
        self.private.to_bytes()
    }
}

impl PartialEq for IdentityKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public && self.private.to_bytes() == other.private.to_bytes()
    }
}

impl Eq for IdentityKeyPair {}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Profile encryption key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileKey([u8; KEY_LEN]);

impl ProfileKey {
    /// Generate a random profile key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut raw = [0u8; KEY_LEN];
        rng.fill_bytes(&mut raw);
        Self(raw)
    }

    /// Decode a 32-byte key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        fixed(bytes).map(Self)
    }

    /// Raw encoding.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// 16-byte key used for sealed-sender delivery to this profile.
    pub fn derive_access_key(&self) -> [u8; 16] {
        let full = hmac_sha256(&self.0, UNIDENTIFIED_ACCESS_LABEL);
        let mut out = [0u8; 16];
        out.copy_from_slice(&full[..16]);
        out
    }
}

impl fmt::Debug for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProfileKey(..)")
    }
}

/// PIN-backed master key from which storage and registration-lock keys
/// derive.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Generate a random master key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut raw = [0u8; KEY_LEN];
        rng.fill_bytes(&mut raw);
        Self(raw)
    }

    /// Decode a 32-byte key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        fixed(bytes).map(Self)
    }

    /// Raw encoding.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Key protecting the remote storage service records.
    pub fn derive_storage_service_key(&self) -> StorageKey {
        StorageKey(hmac_sha256(&self.0, STORAGE_SERVICE_LABEL))
    }

    /// Hex token proving knowledge of the PIN at registration.
    pub fn derive_registration_lock(&self) -> String {
        hex::encode(hmac_sha256(&self.0, REGISTRATION_LOCK_LABEL))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Storage service key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StorageKey([u8; KEY_LEN]);

impl StorageKey {
    /// Decode a 32-byte key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        fixed(bytes).map(Self)
    }

    /// Raw encoding.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorageKey(..)")
    }
}

/// Random local registration id in `1..=MAX_REGISTRATION_ID`.
pub fn generate_registration_id<R: Rng>(rng: &mut R) -> u32 {
    rng.gen_range(1..=MAX_REGISTRATION_ID)
}

/// Random shared authentication secret, base64 encoded.
pub fn generate_password<R: RngCore + CryptoRng>(rng: &mut R) -> String {
    let mut raw = [0u8; PASSWORD_BYTES];
    rng.fill_bytes(&mut raw);
    STANDARD.encode(raw)
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::OsRng};
    use rand_chacha::ChaCha8Rng;

    use super::*;

    #[test]
    fn key_pair_round_trips_through_parts() {
        let pair = IdentityKeyPair::generate(&mut OsRng);
        let restored =
            IdentityKeyPair::from_parts(pair.public_key().as_bytes(), &pair.private_key_bytes())
                .unwrap();
        assert_eq!(restored, pair);
        assert_eq!(IdentityKeyPair::from_bytes(&pair.to_bytes()).unwrap(), pair);
    }

    #[test]
    fn mismatched_halves_are_rejected() {
        let a = IdentityKeyPair::generate(&mut OsRng);
        let b = IdentityKeyPair::generate(&mut OsRng);
        let result = IdentityKeyPair::from_parts(a.public_key().as_bytes(), &b.private_key_bytes());
        assert_eq!(result, Err(KeyError::Mismatch));
    }

    #[test]
    fn short_keys_report_length() {
        assert_eq!(
            ProfileKey::from_bytes(&[0u8; 31]),
            Err(KeyError::InvalidLength { expected: 32, got: 31 })
        );
    }

    #[test]
    fn master_key_derivations_are_deterministic_and_distinct() {
        let master = MasterKey::from_bytes(&[7u8; 32]).unwrap();
        assert_eq!(master.derive_storage_service_key(), master.derive_storage_service_key());
        assert_eq!(master.derive_registration_lock().len(), 64);
        assert_ne!(
            master.derive_storage_service_key().as_bytes().as_slice(),
            hex::decode(master.derive_registration_lock()).unwrap().as_slice()
        );
    }

    #[test]
    fn registration_ids_stay_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..1000 {
            let id = generate_registration_id(&mut rng);
            assert!((1..=MAX_REGISTRATION_ID).contains(&id));
        }
    }

    #[test]
    fn password_is_base64_of_fixed_length() {
        let password = generate_password(&mut OsRng);
        assert_eq!(STANDARD.decode(&password).unwrap().len(), PASSWORD_BYTES);
    }
}
