//! The monolithic `axolotlStore` document of version 1 descriptors.
//!
//! Its identity key pair and registration id win over whatever the
//! descriptor fields said. Pre-key, signed pre-key, session and identity
//! collections are merged into the ACI stores.

use base64::{Engine, engine::general_purpose::STANDARD};
use keystead_core::{
    IdentityKey, IdentityKeyPair, IdentityRole, PreKeyRecord, RecipientAddress, SessionRecord,
    SignedPreKeyRecord, TrustLevel,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{MigrationContext, array, decode_entry};
use crate::error::AccountError;

const ARTIFACT: &str = "axolotlStore";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyIdentityKeyStore {
    identity_key: Option<String>,
    registration_id: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyTrustedKey {
    name: Option<String>,
    uuid: Option<Uuid>,
    identity_key: String,
    trust_level: Option<i64>,
    #[serde(default)]
    added_timestamp: u64,
}

#[derive(Deserialize)]
struct LegacyKeyEntry {
    id: u32,
    record: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySession {
    name: Option<String>,
    uuid: Option<Uuid>,
    device_id: u32,
    record: String,
}

fn legacy_address(name: Option<String>, uuid: Option<Uuid>) -> Option<RecipientAddress> {
    let address = RecipientAddress { aci: uuid, number: name, ..RecipientAddress::default() };
    (address.aci.is_some() || address.number.is_some()).then_some(address)
}

fn decode_b64(field: &str, text: &str) -> Option<Vec<u8>> {
    match STANDARD.decode(text) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(artifact = ARTIFACT, field, %err, "skipping legacy entry with invalid base64");
            None
        },
    }
}

pub(super) fn migrate(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let Some(document) = ctx.sub_document(ARTIFACT).cloned() else {
        return Ok(false);
    };

    if let Some(key_store) = document.get("identityKeyStore") {
        apply_identity(ctx, key_store)?;
    }

    let role = ctx.stores.role(IdentityRole::Aci)?;
    for value in array(&document, "preKeys") {
        let Some(entry) = decode_entry::<LegacyKeyEntry>(ARTIFACT, value) else { continue };
        let Some(bytes) = decode_b64("preKeys", &entry.record) else { continue };
        match PreKeyRecord::deserialize(&bytes) {
            Ok(record) if record.id == entry.id => role.store_pre_key(&record)?,
            Ok(_) => warn!(id = entry.id, "skipping legacy pre-key with mismatched id"),
            Err(err) => warn!(id = entry.id, %err, "skipping corrupt legacy pre-key"),
        }
    }

    for value in array(&document, "signedPreKeyStore") {
        let Some(entry) = decode_entry::<LegacyKeyEntry>(ARTIFACT, value) else { continue };
        let Some(bytes) = decode_b64("signedPreKeyStore", &entry.record) else { continue };
        match SignedPreKeyRecord::deserialize(&bytes) {
            Ok(record) if record.id == entry.id => role.store_signed_pre_key(&record)?,
            Ok(_) => warn!(id = entry.id, "skipping legacy signed pre-key with mismatched id"),
            Err(err) => warn!(id = entry.id, %err, "skipping corrupt legacy signed pre-key"),
        }
    }

    let shared = ctx.stores.shared()?;
    for value in array(&document, "sessionStore") {
        let Some(entry) = decode_entry::<LegacySession>(ARTIFACT, value) else { continue };
        let Some(address) = legacy_address(entry.name, entry.uuid) else {
            warn!(artifact = ARTIFACT, "skipping legacy session without address");
            continue;
        };
        let Some(bytes) = decode_b64("sessionStore", &entry.record) else { continue };
        let recipient = shared.resolve(&address)?;
        role.store_session(recipient, entry.device_id, &SessionRecord::new(bytes))?;
    }

    debug!("merged legacy protocol store");
    Ok(true)
}

fn apply_identity(ctx: &mut MigrationContext<'_>, key_store: &Value) -> Result<(), AccountError> {
    let Some(legacy) = decode_entry::<LegacyIdentityKeyStore>(ARTIFACT, key_store) else {
        return Ok(());
    };

    if let Some(text) = legacy.identity_key.as_deref() {
        let pair = STANDARD
            .decode(text)
            .map_err(|e| AccountError::malformed("axolotlStore.identityKey", e))
            .and_then(|bytes| {
                IdentityKeyPair::from_bytes(&bytes)
                    .map_err(|e| AccountError::malformed("axolotlStore.identityKey", e))
            })?;
        ctx.state.aci_data.identity_key_pair = Some(pair);
    }
    if let Some(registration_id) = legacy.registration_id {
        ctx.state.aci_data.registration_id = registration_id;
    }

    let shared = ctx.stores.shared()?;
    for value in array(key_store, "trustedKeys") {
        let Some(entry) = decode_entry::<LegacyTrustedKey>(ARTIFACT, value) else { continue };
        let Some(address) = legacy_address(entry.name, entry.uuid) else {
            warn!(artifact = ARTIFACT, "skipping legacy identity without address");
            continue;
        };
        let Some(raw) = decode_b64("trustedKeys", &entry.identity_key) else { continue };
        let key = match IdentityKey::from_bytes(&raw) {
            Ok(key) => key,
            Err(err) => {
                warn!(artifact = ARTIFACT, %err, "skipping legacy identity with invalid key");
                continue;
            },
        };
        let recipient = shared.resolve_trusted(&address)?;
        let Some(service_id) = shared.address(recipient)?.and_then(|a| a.service_id()) else {
            warn!(artifact = ARTIFACT, identifier = %address.identifier(), "skipping legacy identity without service id");
            continue;
        };
        shared.save_identity(service_id, &key, entry.added_timestamp)?;
        if let Some(level) = entry.trust_level {
            shared.set_trust_level(service_id, &key, TrustLevel::from_legacy(level))?;
        }
    }
    Ok(())
}
