//! Migration of older descriptor versions and legacy artifacts.
//!
//! Steps run once per load, in a fixed order: recipient identity must be
//! settled before any step resolves an address, and the legacy protocol
//! document must override key material read earlier. Every step is either
//! gated on the previous storage version or on the presence of a legacy
//! artifact, and applying a step twice is harmless.
//!
//! Steps write through to the current stores. They never delete anything;
//! artifacts they consumed are reported in [`MigrationOutcome::consumed`]
//! so the caller can remove them once the migrated descriptor is saved.

mod directories;
mod documents;
mod protocol_store;
mod recipients;

use std::path::PathBuf;

use keystead_core::{IdentityRole, RecipientAddress, RecipientId, StoreError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    descriptor::{AccountState, CURRENT_STORAGE_VERSION},
    error::AccountError,
    paths::AccountPaths,
    stores::StoreProvider,
};

/// Everything a step may read or update.
pub(crate) struct MigrationContext<'a> {
    pub(crate) paths: &'a AccountPaths,
    pub(crate) previous_version: i64,
    pub(crate) document: &'a Value,
    pub(crate) state: &'a mut AccountState,
    pub(crate) stores: &'a dyn StoreProvider,
    consumed: Vec<PathBuf>,
}

impl MigrationContext<'_> {
    /// Legacy sub-document `name`, if present and not null.
    pub(crate) fn sub_document(&self, name: &str) -> Option<&Value> {
        self.document.get(name).filter(|value| !value.is_null())
    }

    /// Remember an artifact for cleanup after the next save.
    pub(crate) fn consumed(&mut self, path: PathBuf) {
        self.consumed.push(path);
    }

    /// The account's own address.
    pub(crate) fn self_address(&self) -> RecipientAddress {
        RecipientAddress {
            aci: self.state.aci,
            pni: self.state.pni,
            number: Some(self.state.number.clone()),
            username: None,
        }
    }

    /// Resolve a legacy textual identifier to a recipient id.
    ///
    /// `None` (after a warning) if the identifier is unparseable.
    pub(crate) fn resolve_identifier(
        &self,
        identifier: &str,
        artifact: &str,
    ) -> Result<Option<RecipientId>, StoreError> {
        let Some(address) = RecipientAddress::parse_identifier(identifier) else {
            warn!(artifact, identifier, "skipping legacy entry with invalid identifier");
            return Ok(None);
        };
        self.stores.shared()?.resolve(&address).map(Some)
    }
}

/// Result of running the pipeline.
#[derive(Debug, Default)]
pub struct MigrationOutcome {
    /// A step changed state, or the file predates the current version.
    /// The descriptor must be saved.
    pub changed: bool,
    /// Legacy files and directories fully read into the current stores
    pub consumed: Vec<PathBuf>,
}

type Step = fn(&mut MigrationContext<'_>) -> Result<bool, AccountError>;

const STEPS: [(&str, Step); 11] = [
    ("recipients", recipients::migrate),
    ("pre-key directories", directories::migrate_pre_keys),
    ("session directory", directories::migrate_sessions),
    ("identity directory", directories::migrate_identities),
    ("protocol store document", protocol_store::migrate),
    ("sender keys", directories::migrate_sender_keys),
    ("group store", documents::migrate_groups),
    ("sticker store", documents::migrate_stickers),
    ("contact store", documents::migrate_contacts),
    ("profile store", documents::migrate_profiles),
    ("thread store", documents::migrate_threads),
];

/// Bring `state` up to [`CURRENT_STORAGE_VERSION`], folding legacy
/// artifacts into `stores`.
///
/// # Errors
///
/// Store and filesystem errors abort the pipeline. Individual unreadable
/// legacy entries do not; they are logged and skipped.
pub fn run(
    paths: &AccountPaths,
    previous_version: i64,
    document: &Value,
    state: &mut AccountState,
    stores: &dyn StoreProvider,
) -> Result<MigrationOutcome, AccountError> {
    let mut ctx = MigrationContext {
        paths,
        previous_version,
        document,
        state,
        stores,
        consumed: Vec::new(),
    };

    let mut changed = previous_version < CURRENT_STORAGE_VERSION;
    for (name, step) in STEPS {
        if step(&mut ctx)? {
            debug!(step = name, "migration step applied");
            changed = true;
        }
    }

    Ok(MigrationOutcome { changed, consumed: ctx.consumed })
}

/// Decode a legacy JSON value, logging and discarding it on failure.
pub(crate) fn decode_entry<T: DeserializeOwned>(artifact: &str, value: &Value) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(entry) => Some(entry),
        Err(err) => {
            warn!(artifact, %err, "skipping unreadable legacy entry");
            None
        },
    }
}

/// Entries of the array `field` of a legacy document. Missing or non-array
/// fields read as empty.
pub(crate) fn array<'a>(document: &'a Value, field: &str) -> &'a [Value] {
    document.get(field).and_then(Value::as_array).map_or(&[], Vec::as_slice)
}

/// Both roles, ACI first.
pub(crate) const ROLES: [IdentityRole; 2] = IdentityRole::ALL;

#[cfg(test)]
mod tests {
    use keystead_core::{
        ContactStore, GroupStore, IdentityKeyPair, IdentityStore, MemoryStore, PreKeyRecord,
        PreKeyStore, ProfileStore, RecipientStore, ServiceEnvironment, ServiceId, SessionStore,
        StickerStore, TrustLevel,
    };
    use rand::rngs::OsRng;
    use serde_json::json;
    use tempfile::tempdir;
    use uuid::Uuid;

    use super::*;
    use crate::descriptor::MINIMUM_STORAGE_VERSION;

    fn state() -> AccountState {
        let mut state = AccountState::new("+15550001", ServiceEnvironment::Live, &mut OsRng);
        state.aci = Some(Uuid::new_v4());
        state.registered = true;
        state
    }

    #[test]
    fn current_file_without_artifacts_is_unchanged() {
        let dir = tempdir().unwrap();
        let paths = AccountPaths::new(dir.path(), "+15550001");
        let mut state = state();
        let before = state.clone();
        let store = MemoryStore::new();

        let outcome =
            run(&paths, CURRENT_STORAGE_VERSION, &json!({}), &mut state, &store).unwrap();

        assert!(!outcome.changed);
        assert!(outcome.consumed.is_empty());
        assert_eq!(state, before);
        assert!(store.recipients().unwrap().is_empty());
    }

    #[test]
    fn version_one_document_is_folded_in() {
        use base64::{Engine, engine::general_purpose::STANDARD};

        let dir = tempdir().unwrap();
        let paths = AccountPaths::new(dir.path(), "+15550001");
        let mut state = state();
        let store = MemoryStore::new();

        let pair = IdentityKeyPair::generate(&mut OsRng);
        let contact_key = IdentityKeyPair::generate(&mut OsRng).public_key();
        let peer = Uuid::new_v4();
        let pre_key = PreKeyRecord { id: 17, key_pair: vec![9; 8] };
        let document = json!({
            "axolotlStore": {
                "identityKeyStore": {
                    "identityKey": STANDARD.encode(pair.to_bytes()),
                    "registrationId": 4242,
                    "trustedKeys": [{
                        "uuid": peer.to_string(),
                        "identityKey": STANDARD.encode(contact_key.as_bytes()),
                        "trustLevel": 2,
                        "addedTimestamp": 5,
                    }],
                },
                "preKeys": [{ "id": 17, "record": STANDARD.encode(pre_key.serialize().unwrap()) }],
                "sessionStore": [{ "uuid": peer.to_string(), "deviceId": 2, "record": STANDARD.encode(b"ratchet") }],
            },
            "contactStore": {
                "contacts": [{ "uuid": peer.to_string(), "name": "Peer", "messageExpirationTime": 30 }],
            },
            "stickerStore": { "stickers": [{ "packId": "0a0b", "packKey": "0c0d", "installed": true }] },
        });

        let outcome =
            run(&paths, MINIMUM_STORAGE_VERSION, &document, &mut state, &store).unwrap();

        assert!(outcome.changed);
        assert_eq!(state.aci_data.identity_key_pair, Some(pair));
        assert_eq!(state.aci_data.registration_id, 4242);

        let peer_id = store.find(&RecipientAddress::from_aci(peer)).unwrap().unwrap();
        let identity = store.identity(ServiceId::Aci(peer)).unwrap().unwrap();
        assert_eq!(identity.identity_key, contact_key);
        assert_eq!(identity.trust_level, TrustLevel::TrustedVerified);
        assert_eq!(store.role(IdentityRole::Aci).load_pre_key(17).unwrap(), Some(pre_key));
        assert_eq!(
            store.role(IdentityRole::Aci).load_session(peer_id, 2).unwrap().unwrap().data,
            b"ratchet".to_vec()
        );
        assert_eq!(store.contact(peer_id).unwrap().unwrap().message_expiration_time, 30);
        assert_eq!(store.sticker_packs().unwrap().len(), 1);
        assert!(store.find(&RecipientAddress::from_number("+15550001")).unwrap().is_some());
    }

    #[test]
    fn unreadable_entries_are_skipped() {
        let dir = tempdir().unwrap();
        let paths = AccountPaths::new(dir.path(), "+15550001");
        let mut state = state();
        let store = MemoryStore::new();
        let document = json!({
            "contactStore": { "contacts": [
                { "number": 42 },
                { "number": "+15550002", "name": "Ok" },
            ]},
            "profileStore": { "profiles": [
                { "number": "+15550003", "profileKey": "not base64!" },
            ]},
            "groupStore": { "groups": [ { "groupId": "%%%" } ] },
        });

        run(&paths, CURRENT_STORAGE_VERSION, &document, &mut state, &store).unwrap();

        assert_eq!(store.contacts().unwrap().len(), 1);
        assert!(store.groups().unwrap().is_empty());
        let third = store.find(&RecipientAddress::from_number("+15550003")).unwrap();
        if let Some(id) = third {
            assert!(store.profile_key(id).unwrap().is_none());
        }
    }

    #[test]
    fn second_run_is_harmless() {
        let dir = tempdir().unwrap();
        let paths = AccountPaths::new(dir.path(), "+15550001");
        let mut state = state();
        let store = MemoryStore::new();
        let document = json!({
            "contactStore": { "contacts": [{ "number": "+15550002", "name": "Ok" }] },
            "threadStore": { "threads": [{ "id": "+15550002", "messageExpirationTime": 60 }] },
        });

        run(&paths, 3, &document, &mut state, &store).unwrap();
        let recipients = store.recipients().unwrap();
        run(&paths, 3, &document, &mut state, &store).unwrap();

        assert_eq!(store.recipients().unwrap(), recipients);
        let id = store.find(&RecipientAddress::from_number("+15550002")).unwrap().unwrap();
        assert_eq!(store.contact(id).unwrap().unwrap().message_expiration_time, 60);
    }
}
