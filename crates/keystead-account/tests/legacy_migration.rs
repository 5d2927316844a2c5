//! End-to-end migration of legacy descriptors through `Account::load`.

use std::fs;

use base64::{Engine, engine::general_purpose::STANDARD};
use keystead_account::{Account, AccountPaths, CURRENT_STORAGE_VERSION, MINIMUM_STORAGE_VERSION};
use keystead_core::{
    IdentityKeyPair, IdentityRole, PreKeyRecord, RecipientAddress, ServiceId, Settings,
    SignedPreKeyRecord, TrustLevel,
};
use rand::rngs::OsRng;
use serde_json::{Value, json};
use tempfile::tempdir;
use uuid::Uuid;

const NUMBER: &str = "+15550999";

struct Fixture {
    aci: Uuid,
    peer: Uuid,
    identity: IdentityKeyPair,
    peer_key: IdentityKeyPair,
    pre_key: PreKeyRecord,
}

fn version_one_descriptor() -> (Value, Fixture) {
    let fixture = Fixture {
        aci: Uuid::new_v4(),
        peer: Uuid::new_v4(),
        identity: IdentityKeyPair::generate(&mut OsRng),
        peer_key: IdentityKeyPair::generate(&mut OsRng),
        pre_key: PreKeyRecord { id: 17, key_pair: vec![0xAA; 16] },
    };
    let document = json!({
        "username": NUMBER,
        "uuid": fixture.aci.to_string(),
        "deviceId": 1,
        "registered": true,
        "password": "legacy-secret",
        "axolotlStore": {
            "identityKeyStore": {
                "identityKey": STANDARD.encode(fixture.identity.to_bytes()),
                "registrationId": 4242,
                "trustedKeys": [{
                    "uuid": fixture.peer.to_string(),
                    "identityKey": STANDARD.encode(fixture.peer_key.public_key().as_bytes()),
                    "trustLevel": 2,
                    "addedTimestamp": 1_600_000_000_000u64,
                }],
            },
            "preKeys": [
                { "id": 17, "record": STANDARD.encode(fixture.pre_key.serialize().unwrap()) },
                { "id": 18, "record": "!!! not base64" },
            ],
            "sessionStore": [{
                "uuid": fixture.peer.to_string(),
                "deviceId": 1,
                "record": STANDARD.encode(b"legacy session"),
            }],
        },
    });
    (document, fixture)
}

#[test]
fn test_version_one_protocol_store_is_migrated() {
    let dir = tempdir().unwrap();
    let paths = AccountPaths::new(dir.path(), NUMBER);
    let (document, fixture) = version_one_descriptor();
    fs::write(paths.descriptor_file(), serde_json::to_vec(&document).unwrap()).unwrap();

    let account = Account::load(dir.path(), NUMBER, false, Settings::default()).unwrap();

    assert_eq!(account.previous_storage_version(), MINIMUM_STORAGE_VERSION);
    assert_eq!(account.identity_key_pair(IdentityRole::Aci), Some(fixture.identity.clone()));
    assert_eq!(account.registration_id(IdentityRole::Aci), 4242);
    assert_eq!(account.password().as_deref(), Some("legacy-secret"));
    assert!(account.identity_key_pair(IdentityRole::Pni).is_some());

    let aci = account.protocol_store(IdentityRole::Aci).unwrap();
    assert_eq!(aci.protocol.load_pre_key(17).unwrap(), Some(fixture.pre_key.clone()));
    assert_eq!(aci.protocol.load_pre_key(18).unwrap(), None);

    let peer = aci.shared.find(&RecipientAddress::from_aci(fixture.peer)).unwrap().unwrap();
    let session = aci.protocol.load_session(peer, 1).unwrap().unwrap();
    assert_eq!(session.data, b"legacy session".to_vec());

    let identity = aci.shared.identity(ServiceId::Aci(fixture.peer)).unwrap().unwrap();
    assert_eq!(identity.identity_key, fixture.peer_key.public_key());
    assert_eq!(identity.trust_level, TrustLevel::TrustedVerified);

    let own = aci.shared.find(&RecipientAddress::from_aci(fixture.aci)).unwrap();
    assert_eq!(own, Some(account.self_recipient_id().unwrap()));
    drop(aci);
    drop(account);

    let saved: Value = serde_json::from_slice(&fs::read(paths.descriptor_file()).unwrap()).unwrap();
    assert_eq!(saved["version"], Value::from(CURRENT_STORAGE_VERSION));
    assert!(saved.get("axolotlStore").is_none());
}

#[test]
fn test_migration_runs_once() {
    let dir = tempdir().unwrap();
    let paths = AccountPaths::new(dir.path(), NUMBER);
    let (document, _) = version_one_descriptor();
    fs::write(paths.descriptor_file(), serde_json::to_vec(&document).unwrap()).unwrap();

    drop(Account::load(dir.path(), NUMBER, false, Settings::default()).unwrap());
    let migrated = fs::read(paths.descriptor_file()).unwrap();

    let account = Account::load(dir.path(), NUMBER, false, Settings::default()).unwrap();
    assert_eq!(account.previous_storage_version(), CURRENT_STORAGE_VERSION);
    drop(account);
    assert_eq!(fs::read(paths.descriptor_file()).unwrap(), migrated);
}

#[test]
fn test_consumed_legacy_directories_are_removed() {
    let dir = tempdir().unwrap();
    let paths = AccountPaths::new(dir.path(), NUMBER);
    let aci = Uuid::new_v4();
    let descriptor = json!({
        "version": 2,
        "username": NUMBER,
        "uuid": aci.to_string(),
        "registered": true,
    });
    fs::write(paths.descriptor_file(), serde_json::to_vec(&descriptor).unwrap()).unwrap();

    let signed_dir = paths.signed_pre_keys_dir(IdentityRole::Aci);
    fs::create_dir_all(&signed_dir).unwrap();
    let signed = SignedPreKeyRecord { id: 3, timestamp: 9, key_pair: vec![1], signature: vec![2] };
    fs::write(signed_dir.join("3"), signed.serialize().unwrap()).unwrap();
    fs::write(signed_dir.join("not-an-id"), b"junk").unwrap();

    let account = Account::load(dir.path(), NUMBER, false, Settings::default()).unwrap();

    let store = account.protocol_store(IdentityRole::Aci).unwrap();
    assert_eq!(store.protocol.load_signed_pre_key(3).unwrap(), Some(signed));
    assert!(!signed_dir.exists());
    assert!(paths.database_file().exists());
}

#[test]
fn test_thread_expirations_only_update_known_contacts() {
    let dir = tempdir().unwrap();
    let paths = AccountPaths::new(dir.path(), NUMBER);
    let descriptor = json!({
        "version": 3,
        "username": NUMBER,
        "uuid": Uuid::new_v4().to_string(),
        "registered": true,
        "contactStore": { "contacts": [{ "number": "+15550112", "messageExpirationTime": 60 }] },
        "threadStore": { "threads": [
            { "id": "+15550111", "messageExpirationTime": 30 },
            { "id": "+15550112", "messageExpirationTime": 0 },
        ]},
    });
    fs::write(paths.descriptor_file(), serde_json::to_vec(&descriptor).unwrap()).unwrap();

    let account = Account::load(dir.path(), NUMBER, false, Settings::default()).unwrap();

    let shared = account.shared_store().unwrap();
    let known = shared.find(&RecipientAddress::from_number("+15550112")).unwrap().unwrap();
    let contacts = shared.contacts().unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].0, known);
    assert_eq!(contacts[0].1.message_expiration_time, 0);
}
