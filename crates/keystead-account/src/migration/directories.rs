//! One-file-per-record legacy directories.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use keystead_core::{
    IdentityKey, IdentityRole, PreKeyRecord, RecipientAddress, SenderKeyRecord, SessionRecord,
    SignedPreKeyRecord, TrustLevel,
};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{MigrationContext, ROLES, array, decode_entry};
use crate::error::AccountError;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyIdentity {
    identity_key: String,
    trust_level: i64,
    #[serde(default)]
    added_timestamp: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySharedSenderKey {
    distribution_id: Uuid,
    identifier: String,
    device_id: u32,
}

/// Files of `dir` as (name, path), sorted by name. `None` if the directory
/// does not exist.
fn list_files(dir: &Path) -> io::Result<Option<Vec<(String, PathBuf)>>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()).map(str::to_owned) else {
            warn!(path = %path.display(), "skipping legacy file with non UTF-8 name");
            continue;
        };
        files.push((name, path));
    }
    files.sort();
    Ok(Some(files))
}

fn read_or_warn(path: &Path) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(path = %path.display(), %err, "skipping unreadable legacy file");
            None
        },
    }
}

fn parse_id(name: &str, path: &Path) -> Option<u32> {
    let id = name.parse().ok();
    if id.is_none() {
        warn!(path = %path.display(), "skipping legacy key file with non-numeric name");
    }
    id
}

pub(super) fn migrate_pre_keys(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let mut changed = false;
    for role in ROLES {
        let store = ctx.stores.role(role)?;

        let dir = ctx.paths.pre_keys_dir(role);
        if let Some(files) = list_files(&dir)? {
            let mut count = 0usize;
            for (name, path) in files {
                let Some(id) = parse_id(&name, &path) else { continue };
                let Some(bytes) = read_or_warn(&path) else { continue };
                match PreKeyRecord::deserialize(&bytes) {
                    Ok(record) if record.id == id => {
                        store.store_pre_key(&record)?;
                        count += 1;
                    },
                    Ok(record) => {
                        warn!(%role, file_id = id, record_id = record.id, "skipping misfiled legacy pre-key");
                    },
                    Err(err) => warn!(%role, id, %err, "skipping corrupt legacy pre-key"),
                }
            }
            debug!(%role, count, "migrated legacy pre-keys");
            ctx.consumed(dir);
            changed = true;
        }

        let dir = ctx.paths.signed_pre_keys_dir(role);
        if let Some(files) = list_files(&dir)? {
            let mut count = 0usize;
            for (name, path) in files {
                let Some(id) = parse_id(&name, &path) else { continue };
                let Some(bytes) = read_or_warn(&path) else { continue };
                match SignedPreKeyRecord::deserialize(&bytes) {
                    Ok(record) if record.id == id => {
                        store.store_signed_pre_key(&record)?;
                        count += 1;
                    },
                    Ok(record) => {
                        warn!(%role, file_id = id, record_id = record.id, "skipping misfiled legacy signed pre-key");
                    },
                    Err(err) => warn!(%role, id, %err, "skipping corrupt legacy signed pre-key"),
                }
            }
            debug!(%role, count, "migrated legacy signed pre-keys");
            ctx.consumed(dir);
            changed = true;
        }
    }
    Ok(changed)
}

/// Split `<identifier>_<device>`.
fn split_device(name: &str) -> Option<(&str, u32)> {
    let (identifier, device) = name.rsplit_once('_')?;
    Some((identifier, device.parse().ok()?))
}

pub(super) fn migrate_sessions(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let dir = ctx.paths.sessions_dir();
    let Some(files) = list_files(&dir)? else { return Ok(false) };

    let store = ctx.stores.role(IdentityRole::Aci)?;
    let mut count = 0usize;
    for (name, path) in files {
        let Some((identifier, device_id)) = split_device(&name) else {
            warn!(path = %path.display(), "skipping legacy session with malformed name");
            continue;
        };
        let Some(recipient) = ctx.resolve_identifier(identifier, "sessions")? else { continue };
        let Some(bytes) = read_or_warn(&path) else { continue };
        store.store_session(recipient, device_id, &SessionRecord::new(bytes))?;
        count += 1;
    }
    debug!(count, "migrated legacy sessions");
    ctx.consumed(dir);
    Ok(true)
}

pub(super) fn migrate_identities(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let dir = ctx.paths.identities_dir();
    let Some(files) = list_files(&dir)? else { return Ok(false) };

    let shared = ctx.stores.shared()?;
    let mut count = 0usize;
    for (identifier, path) in files {
        let Some(bytes) = read_or_warn(&path) else { continue };
        let legacy: LegacyIdentity = match serde_json::from_slice(&bytes) {
            Ok(legacy) => legacy,
            Err(err) => {
                warn!(%identifier, %err, "skipping corrupt legacy identity");
                continue;
            },
        };
        let key = match STANDARD
            .decode(&legacy.identity_key)
            .map_err(|e| e.to_string())
            .and_then(|raw| IdentityKey::from_bytes(&raw).map_err(|e| e.to_string()))
        {
            Ok(key) => key,
            Err(err) => {
                warn!(%identifier, %err, "skipping legacy identity with invalid key");
                continue;
            },
        };
        let Some(address) = RecipientAddress::parse_identifier(&identifier) else {
            warn!(%identifier, "skipping legacy identity with invalid identifier");
            continue;
        };
        let recipient = shared.resolve(&address)?;
        let Some(service_id) = shared.address(recipient)?.and_then(|a| a.service_id()) else {
            warn!(%identifier, "skipping legacy identity without service id");
            continue;
        };

        shared.save_identity(service_id, &key, legacy.added_timestamp)?;
        shared.set_trust_level(service_id, &key, TrustLevel::from_legacy(legacy.trust_level))?;
        count += 1;
    }
    debug!(count, "migrated legacy identities");
    ctx.consumed(dir);
    Ok(true)
}

fn modified_millis(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

pub(super) fn migrate_sender_keys(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let mut changed = false;
    let shared = ctx.stores.shared()?;

    let dir = ctx.paths.sender_keys_dir();
    if let Some(files) = list_files(&dir)? {
        let mut count = 0usize;
        for (name, path) in files {
            let parsed = name.rsplit_once('_').and_then(|(rest, distribution)| {
                let distribution = Uuid::parse_str(distribution).ok()?;
                let (identifier, device_id) = split_device(rest)?;
                Some((identifier.to_owned(), device_id, distribution))
            });
            let Some((identifier, device_id, distribution_id)) = parsed else {
                warn!(path = %path.display(), "skipping legacy sender key with malformed name");
                continue;
            };
            let Some(sender) = ctx.resolve_identifier(&identifier, "sender-keys")? else {
                continue;
            };
            let Some(data) = read_or_warn(&path) else { continue };
            let record = SenderKeyRecord { data, created_at: modified_millis(&path) };
            shared.store_sender_key(sender, device_id, distribution_id, &record)?;
            count += 1;
        }
        debug!(count, "migrated legacy sender keys");
        ctx.consumed(dir);
        changed = true;
    }

    let file = ctx.paths.shared_sender_keys_file();
    if file.is_file() {
        let document = read_or_warn(&file).and_then(|bytes| {
            serde_json::from_slice::<serde_json::Value>(&bytes)
                .map_err(|err| warn!(%err, "skipping unreadable legacy shared sender keys"))
                .ok()
        });
        if let Some(document) = document {
            for value in array(&document, "entries") {
                let Some(entry) = decode_entry::<LegacySharedSenderKey>("shared-sender-keys", value)
                else {
                    continue;
                };
                let Some(recipient) =
                    ctx.resolve_identifier(&entry.identifier, "shared-sender-keys")?
                else {
                    continue;
                };
                shared.mark_shared(entry.distribution_id, &[(recipient, entry.device_id)])?;
            }
        }
        ctx.consumed(file);
        changed = true;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use keystead_core::{
        IdentityKeyPair, IdentityStore, MemoryStore, PreKeyStore, RecipientStore,
        SenderKeyStore, ServiceEnvironment, ServiceId, SessionStore, SignedPreKeyStore,
    };
    use rand::rngs::OsRng;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        descriptor::{AccountState, CURRENT_STORAGE_VERSION},
        migration::run,
        paths::{AccountPaths, create_private_dir},
    };

    fn setup() -> (tempfile::TempDir, AccountPaths, AccountState, MemoryStore) {
        let dir = tempdir().unwrap();
        let paths = AccountPaths::new(dir.path(), "+1");
        paths.ensure_account_dir().unwrap();
        let state = AccountState::new("+1", ServiceEnvironment::Live, &mut OsRng);
        (dir, paths, state, MemoryStore::new())
    }

    #[test]
    fn pre_key_directories_per_role() {
        let (_dir, paths, mut state, store) = setup();
        let pni_dir = paths.pre_keys_dir(IdentityRole::Pni);
        create_private_dir(&pni_dir).unwrap();
        let record = PreKeyRecord { id: 8, key_pair: vec![1, 2] };
        fs::write(pni_dir.join("8"), record.serialize().unwrap()).unwrap();
        fs::write(pni_dir.join("9"), b"garbage").unwrap();
        fs::write(pni_dir.join("notes"), b"x").unwrap();

        let signed_dir = paths.signed_pre_keys_dir(IdentityRole::Aci);
        create_private_dir(&signed_dir).unwrap();
        let signed = SignedPreKeyRecord { id: 2, timestamp: 1, key_pair: vec![3], signature: vec![4] };
        fs::write(signed_dir.join("2"), signed.serialize().unwrap()).unwrap();

        let outcome = run(&paths, CURRENT_STORAGE_VERSION, &json!({}), &mut state, &store).unwrap();

        assert!(outcome.changed);
        assert_eq!(store.role(IdentityRole::Pni).pre_key_ids().unwrap(), vec![8]);
        assert!(store.role(IdentityRole::Aci).pre_key_ids().unwrap().is_empty());
        assert_eq!(store.role(IdentityRole::Aci).load_signed_pre_key(2).unwrap(), Some(signed));
        assert!(outcome.consumed.contains(&pni_dir));
    }

    #[test]
    fn sessions_and_identities_resolve_through_recipients() {
        let (_dir, paths, mut state, store) = setup();
        let peer = Uuid::new_v4();
        create_private_dir(&paths.sessions_dir()).unwrap();
        fs::write(paths.sessions_dir().join(format!("{peer}_3")), b"state").unwrap();
        fs::write(paths.sessions_dir().join("bogus"), b"state").unwrap();

        let key = IdentityKeyPair::generate(&mut OsRng).public_key();
        create_private_dir(&paths.identities_dir()).unwrap();
        let identity = json!({
            "identityKey": STANDARD.encode(key.as_bytes()),
            "trustLevel": 1,
            "addedTimestamp": 77,
        });
        fs::write(paths.identities_dir().join(peer.to_string()), identity.to_string()).unwrap();

        run(&paths, CURRENT_STORAGE_VERSION, &json!({}), &mut state, &store).unwrap();

        let id = store.find(&RecipientAddress::from_aci(peer)).unwrap().unwrap();
        assert_eq!(store.role(IdentityRole::Aci).session_device_ids(id).unwrap(), vec![3]);
        let info = store.identity(ServiceId::Aci(peer)).unwrap().unwrap();
        assert_eq!(info.identity_key, key);
        assert_eq!(info.trust_level, TrustLevel::TrustedUnverified);
        assert_eq!(info.added_timestamp, 77);
    }

    #[test]
    fn sender_keys_and_share_marks() {
        let (_dir, paths, mut state, store) = setup();
        let peer = Uuid::new_v4();
        let distribution = Uuid::new_v4();
        create_private_dir(&paths.sender_keys_dir()).unwrap();
        fs::write(paths.sender_keys_dir().join(format!("{peer}_1_{distribution}")), b"sk").unwrap();
        let shared = json!({
            "entries": [
                { "distributionId": distribution.to_string(), "identifier": "+5", "deviceId": 2 },
                { "distributionId": "nope", "identifier": "+6", "deviceId": 1 },
            ],
        });
        fs::write(paths.shared_sender_keys_file(), shared.to_string()).unwrap();

        let outcome = run(&paths, CURRENT_STORAGE_VERSION, &json!({}), &mut state, &store).unwrap();

        let sender = store.find(&RecipientAddress::from_aci(peer)).unwrap().unwrap();
        assert_eq!(store.load_sender_key(sender, 1, distribution).unwrap().unwrap().data, b"sk".to_vec());
        let target = store.find(&RecipientAddress::from_number("+5")).unwrap().unwrap();
        assert_eq!(store.shared_with(distribution).unwrap(), vec![(target, 2)]);
        assert!(outcome.consumed.contains(&paths.shared_sender_keys_file()));
    }
}
