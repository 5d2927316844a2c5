//! Descriptor document codec.
//!
//! The descriptor is a JSON object. Every field is optional on read except
//! `username` (the phone number) and `registered`; absent fields take the
//! defaults a freshly created account would have. Key material is standard
//! base64. Legacy sub-documents (`axolotlStore`, `groupStore`, ...) are not
//! part of [`StoredDescriptor`]; they stay in the parsed tree for the
//! migration pipeline and are dropped by the next save.

use base64::{Engine, engine::general_purpose::STANDARD};
use keystead_core::{
    ConfigurationStore, IdentityKeyPair, IdentityRole, MasterKey, PRIMARY_DEVICE_ID,
    PreKeyMetadata, PreKeyStream, ProfileKey, ServiceEnvironment, StorageKey,
    keys::generate_registration_id,
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AccountError, VersionProblem};

/// Oldest descriptor layout that can still be migrated.
pub const MINIMUM_STORAGE_VERSION: i64 = 1;

/// Layout written by this release.
pub const CURRENT_STORAGE_VERSION: i64 = 7;

/// Wire form of the descriptor.
///
/// Field names are fixed by files already on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDescriptor {
    /// Layout version; absent in the oldest files
    pub version: Option<i64>,
    /// Phone number. The key predates usernames
    pub username: Option<String>,
    /// Service environment the account is registered in
    pub service_environment: Option<ServiceEnvironment>,
    /// Account username
    pub username_identifier: Option<String>,
    /// ACI
    pub uuid: Option<String>,
    /// Phone number identifier
    pub pni: Option<String>,
    /// Registration session id
    pub session_id: Option<String>,
    /// Number the session id was issued for
    pub session_number: Option<String>,
    /// Encrypted device name
    pub device_name: Option<String>,
    /// Device id; 1 on the primary device
    pub device_id: Option<u32>,
    /// Linked devices exist
    pub is_multi_device: Option<bool>,
    /// Timestamp of the last received message
    pub last_receive_timestamp: Option<u64>,
    /// Service password
    pub password: Option<String>,
    /// ACI registration id
    pub registration_id: Option<u32>,
    /// PNI registration id
    pub pni_registration_id: Option<u32>,
    /// Base64 ACI private key
    pub identity_private_key: Option<String>,
    /// Base64 ACI public key
    pub identity_key: Option<String>,
    /// Base64 PNI private key
    pub pni_identity_private_key: Option<String>,
    /// Base64 PNI public key
    pub pni_identity_key: Option<String>,
    /// Registration lock PIN
    pub registration_lock_pin: Option<String>,
    /// Base64 master key
    pub pin_master_key: Option<String>,
    /// Base64 storage service key
    pub storage_key: Option<String>,
    /// Storage service manifest version
    pub storage_manifest_version: Option<i64>,
    /// Next ACI one-time pre-key id
    pub pre_key_id_offset: Option<u32>,
    /// Next ACI signed pre-key id
    pub next_signed_pre_key_id: Option<u32>,
    /// Next PNI one-time pre-key id
    pub pni_pre_key_id_offset: Option<u32>,
    /// Next PNI signed pre-key id
    pub pni_next_signed_pre_key_id: Option<u32>,
    /// Next ACI Kyber pre-key id
    pub kyber_pre_key_id_offset: Option<u32>,
    /// `-1` when unset
    pub active_last_resort_kyber_pre_key_id: Option<i64>,
    /// Next PNI Kyber pre-key id
    pub pni_kyber_pre_key_id_offset: Option<u32>,
    /// PNI last-resort Kyber pre-key id; `-1` when unset
    pub pni_active_last_resort_kyber_pre_key_id: Option<i64>,
    /// Base64 own profile key
    pub profile_key: Option<String>,
    /// Registration completed
    pub registered: Option<bool>,
    /// Account preferences
    pub configuration_store: Option<ConfigurationStore>,
}

/// Key material and allocator state of one identity role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRoleData {
    /// Identity key pair. `None` until generated or provisioned.
    pub identity_key_pair: Option<IdentityKeyPair>,
    /// Local registration id
    pub registration_id: u32,
    /// Pre-key id allocator
    pub pre_key_metadata: PreKeyMetadata,
}

impl IdentityRoleData {
    /// Role data with a fresh registration id and random offsets.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            identity_key_pair: None,
            registration_id: generate_registration_id(rng),
            pre_key_metadata: PreKeyMetadata::random(rng),
        }
    }
}

/// Typed, validated descriptor content.
///
/// # Invariants
///
/// - `device_id == PRIMARY_DEVICE_ID` iff the account is the primary device.
/// - A registered account has an ACI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    /// Phone number, also the account id
    pub number: String,
    /// Service environment the account is registered in
    pub service_environment: Option<ServiceEnvironment>,
    /// Account username
    pub username: Option<String>,
    /// Account identifier, set once registered
    pub aci: Option<Uuid>,
    /// Phone number identifier
    pub pni: Option<Uuid>,
    /// Registration session id
    pub session_id: Option<String>,
    /// Number `session_id` belongs to
    pub session_number: Option<String>,
    /// Encrypted device name
    pub encrypted_device_name: Option<String>,
    /// 1 on the primary device
    pub device_id: u32,
    /// Linked devices exist
    pub multi_device: bool,
    /// Timestamp of the last received message
    pub last_receive_timestamp: u64,
    /// Service password
    pub password: Option<String>,
    /// ACI role data
    pub aci_data: IdentityRoleData,
    /// PNI role data
    pub pni_data: IdentityRoleData,
    /// Registration lock PIN
    pub registration_lock_pin: Option<String>,
    /// Master key backing the registration lock
    pub pin_master_key: Option<MasterKey>,
    /// Storage service key of a linked device
    pub storage_key: Option<StorageKey>,
    /// Storage service manifest version
    pub storage_manifest_version: Option<u64>,
    /// Own profile key
    pub profile_key: Option<ProfileKey>,
    /// Registration completed
    pub registered: bool,
    /// Account preferences
    pub configuration: ConfigurationStore,
}

impl AccountState {
    /// Unregistered state for `number` with fresh role data.
    pub fn new<R: RngCore + CryptoRng>(
        number: impl Into<String>,
        service_environment: ServiceEnvironment,
        rng: &mut R,
    ) -> Self {
        Self {
            number: number.into(),
            service_environment: Some(service_environment),
            username: None,
            aci: None,
            pni: None,
            session_id: None,
            session_number: None,
            encrypted_device_name: None,
            device_id: PRIMARY_DEVICE_ID,
            multi_device: false,
            last_receive_timestamp: 0,
            password: None,
            aci_data: IdentityRoleData::generate(rng),
            pni_data: IdentityRoleData::generate(rng),
            registration_lock_pin: None,
            pin_master_key: None,
            storage_key: None,
            storage_manifest_version: None,
            profile_key: None,
            registered: false,
            configuration: ConfigurationStore::default(),
        }
    }

    /// Role data of `role`.
    pub fn role(&self, role: IdentityRole) -> &IdentityRoleData {
        match role {
            IdentityRole::Aci => &self.aci_data,
            IdentityRole::Pni => &self.pni_data,
        }
    }

    /// Mutable role data of `role`.
    pub fn role_mut(&mut self, role: IdentityRole) -> &mut IdentityRoleData {
        match role {
            IdentityRole::Aci => &mut self.aci_data,
            IdentityRole::Pni => &mut self.pni_data,
        }
    }

    /// Service id uuid of `role`.
    pub fn service_uuid(&self, role: IdentityRole) -> Option<Uuid> {
        match role {
            IdentityRole::Aci => self.aci,
            IdentityRole::Pni => self.pni,
        }
    }

    /// Whether this device registered the account.
    pub fn is_primary_device(&self) -> bool {
        self.device_id == PRIMARY_DEVICE_ID
    }

    /// Encode at [`CURRENT_STORAGE_VERSION`].
    pub fn to_stored(&self) -> StoredDescriptor {
        let pair_halves = |pair: Option<&IdentityKeyPair>| match pair {
            Some(pair) => (
                Some(STANDARD.encode(pair.private_key_bytes())),
                Some(STANDARD.encode(pair.public_key().as_bytes())),
            ),
            None => (None, None),
        };
        let (identity_private_key, identity_key) =
            pair_halves(self.aci_data.identity_key_pair.as_ref());
        let (pni_identity_private_key, pni_identity_key) =
            pair_halves(self.pni_data.identity_key_pair.as_ref());
        let aci_meta = &self.aci_data.pre_key_metadata;
        let pni_meta = &self.pni_data.pre_key_metadata;
        let last_resort =
            |meta: &PreKeyMetadata| Some(meta.active_last_resort_kyber_pre_key_id().map_or(-1, i64::from));

        StoredDescriptor {
            version: Some(CURRENT_STORAGE_VERSION),
            username: Some(self.number.clone()),
            service_environment: self.service_environment,
            username_identifier: self.username.clone(),
            uuid: self.aci.map(|aci| aci.to_string()),
            pni: self.pni.map(|pni| pni.to_string()),
            session_id: self.session_id.clone(),
            session_number: self.session_number.clone(),
            device_name: self.encrypted_device_name.clone(),
            device_id: Some(self.device_id),
            is_multi_device: Some(self.multi_device),
            last_receive_timestamp: Some(self.last_receive_timestamp),
            password: self.password.clone(),
            registration_id: Some(self.aci_data.registration_id),
            pni_registration_id: Some(self.pni_data.registration_id),
            identity_private_key,
            identity_key,
            pni_identity_private_key,
            pni_identity_key,
            registration_lock_pin: self.registration_lock_pin.clone(),
            pin_master_key: self.pin_master_key.as_ref().map(|key| STANDARD.encode(key.as_bytes())),
            storage_key: self.storage_key.map(|key| STANDARD.encode(key.as_bytes())),
            storage_manifest_version: self.storage_manifest_version.map(|v| v as i64),
            pre_key_id_offset: Some(aci_meta.next_id(PreKeyStream::OneTime)),
            next_signed_pre_key_id: Some(aci_meta.next_id(PreKeyStream::Signed)),
            pni_pre_key_id_offset: Some(pni_meta.next_id(PreKeyStream::OneTime)),
            pni_next_signed_pre_key_id: Some(pni_meta.next_id(PreKeyStream::Signed)),
            kyber_pre_key_id_offset: Some(aci_meta.next_id(PreKeyStream::Kyber)),
            active_last_resort_kyber_pre_key_id: last_resort(aci_meta),
            pni_kyber_pre_key_id_offset: Some(pni_meta.next_id(PreKeyStream::Kyber)),
            pni_active_last_resort_kyber_pre_key_id: last_resort(pni_meta),
            profile_key: self.profile_key.map(|key| STANDARD.encode(key.as_bytes())),
            registered: Some(self.registered),
            configuration_store: Some(self.configuration.clone()),
        }
    }

    /// Full descriptor file content.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(&self.to_stored())
    }
}

/// A descriptor as read from disk, before migration.
#[derive(Debug, Clone)]
pub struct DecodedDescriptor {
    /// Storage version the file was written at
    pub previous_version: i64,
    /// Typed content
    pub state: AccountState,
    /// Parsed document, including legacy sub-documents
    pub document: Value,
}

/// Check a stored version against the supported window.
///
/// # Errors
///
/// `AccountError::UnsupportedVersion` outside
/// `[MINIMUM_STORAGE_VERSION, CURRENT_STORAGE_VERSION]`.
pub fn check_version(version: i64) -> Result<(), AccountError> {
    if version > CURRENT_STORAGE_VERSION {
        return Err(AccountError::UnsupportedVersion { version, problem: VersionProblem::TooNew });
    }
    if version < MINIMUM_STORAGE_VERSION {
        return Err(AccountError::UnsupportedVersion { version, problem: VersionProblem::TooOld });
    }
    Ok(())
}

fn decode_b64(field: &'static str, text: &str) -> Result<Vec<u8>, AccountError> {
    STANDARD.decode(text).map_err(|e| AccountError::malformed(field, e))
}

fn decode_uuid(field: &'static str, text: Option<&str>) -> Result<Option<Uuid>, AccountError> {
    text.map(|text| Uuid::parse_str(text).map_err(|e| AccountError::malformed(field, e)))
        .transpose()
}

fn decode_key_pair(
    field: &'static str,
    public: Option<&str>,
    private: Option<&str>,
) -> Result<Option<IdentityKeyPair>, AccountError> {
    let (Some(public), Some(private)) = (public, private) else {
        return Ok(None);
    };
    let public = decode_b64(field, public)?;
    let private = decode_b64(field, private)?;
    IdentityKeyPair::from_parts(&public, &private)
        .map(Some)
        .map_err(|e| AccountError::malformed(field, e))
}

fn decode_metadata<R: RngCore + CryptoRng>(
    one_time: Option<u32>,
    signed: Option<u32>,
    kyber: Option<u32>,
    last_resort: Option<i64>,
    rng: &mut R,
) -> PreKeyMetadata {
    let mut meta = PreKeyMetadata::random(rng);
    if let Some(id) = one_time {
        meta.set_next_id(PreKeyStream::OneTime, id);
    }
    if let Some(id) = signed {
        meta.set_next_id(PreKeyStream::Signed, id);
    }
    if let Some(id) = kyber {
        meta.set_next_id(PreKeyStream::Kyber, id);
    }
    meta.set_active_last_resort_kyber_pre_key_id(
        last_resort.and_then(|id| u32::try_from(id).ok()),
    );
    meta
}

/// Parse and validate descriptor bytes.
///
/// Absent pre-key offsets and an absent PNI registration id are generated
/// from `rng`.
///
/// # Errors
///
/// - `AccountError::Malformed` for undecodable JSON, missing required
///   fields and invalid ids or keys
/// - `AccountError::UnsupportedVersion` for versions outside the window
pub fn decode<R: RngCore + CryptoRng>(
    bytes: &[u8],
    rng: &mut R,
) -> Result<DecodedDescriptor, AccountError> {
    let document: Value =
        serde_json::from_slice(bytes).map_err(|e| AccountError::malformed("descriptor", e))?;
    let stored: StoredDescriptor = serde_json::from_value(document.clone())
        .map_err(|e| AccountError::malformed("descriptor", e))?;

    let previous_version = stored.version.unwrap_or(MINIMUM_STORAGE_VERSION);
    check_version(previous_version)?;

    let number = stored.username.ok_or_else(|| AccountError::malformed("username", "missing"))?;
    let registered =
        stored.registered.ok_or_else(|| AccountError::malformed("registered", "missing"))?;
    let aci = decode_uuid("uuid", stored.uuid.as_deref())?;
    let pni = decode_uuid("pni", stored.pni.as_deref())?;
    if registered && aci.is_none() {
        return Err(AccountError::malformed("uuid", "registered account without an ACI"));
    }

    let aci_data = IdentityRoleData {
        identity_key_pair: decode_key_pair(
            "identityKey",
            stored.identity_key.as_deref(),
            stored.identity_private_key.as_deref(),
        )?,
        registration_id: stored.registration_id.unwrap_or(0),
        pre_key_metadata: decode_metadata(
            stored.pre_key_id_offset,
            stored.next_signed_pre_key_id,
            stored.kyber_pre_key_id_offset,
            stored.active_last_resort_kyber_pre_key_id,
            rng,
        ),
    };
    let pni_data = IdentityRoleData {
        identity_key_pair: decode_key_pair(
            "pniIdentityKey",
            stored.pni_identity_key.as_deref(),
            stored.pni_identity_private_key.as_deref(),
        )?,
        registration_id: match stored.pni_registration_id {
            Some(id) => id,
            None => generate_registration_id(rng),
        },
        pre_key_metadata: decode_metadata(
            stored.pni_pre_key_id_offset,
            stored.pni_next_signed_pre_key_id,
            stored.pni_kyber_pre_key_id_offset,
            stored.pni_active_last_resort_kyber_pre_key_id,
            rng,
        ),
    };

    let pin_master_key = stored
        .pin_master_key
        .as_deref()
        .map(|text| {
            MasterKey::from_bytes(&decode_b64("pinMasterKey", text)?)
                .map_err(|e| AccountError::malformed("pinMasterKey", e))
        })
        .transpose()?;
    let storage_key = stored
        .storage_key
        .as_deref()
        .map(|text| {
            StorageKey::from_bytes(&decode_b64("storageKey", text)?)
                .map_err(|e| AccountError::malformed("storageKey", e))
        })
        .transpose()?;
    let profile_key = stored
        .profile_key
        .as_deref()
        .map(|text| {
            ProfileKey::from_bytes(&decode_b64("profileKey", text)?)
                .map_err(|e| AccountError::malformed("profileKey", e))
        })
        .transpose()?;

    let state = AccountState {
        number,
        service_environment: stored.service_environment,
        username: stored.username_identifier,
        aci,
        pni,
        session_id: stored.session_id,
        session_number: stored.session_number,
        encrypted_device_name: stored.device_name,
        device_id: stored.device_id.unwrap_or(PRIMARY_DEVICE_ID),
        multi_device: stored.is_multi_device.unwrap_or(false),
        last_receive_timestamp: stored.last_receive_timestamp.unwrap_or(0),
        password: stored.password,
        aci_data,
        pni_data,
        registration_lock_pin: stored.registration_lock_pin,
        pin_master_key,
        storage_key,
        storage_manifest_version: stored
            .storage_manifest_version
            .and_then(|v| u64::try_from(v).ok()),
        profile_key,
        registered,
        configuration: stored.configuration_store.unwrap_or_default(),
    };

    Ok(DecodedDescriptor { previous_version, state, document })
}
