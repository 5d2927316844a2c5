//! Legacy sub-documents for groups, stickers, contacts, profiles and
//! threads.

use std::{collections::BTreeSet, fs};

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE},
};
use keystead_core::{
    Capability, Contact, GroupId, GroupInfo, GroupInfoV1, GroupInfoV2, Profile, ProfileKey,
    RecipientAddress, StickerPack, UnidentifiedAccessMode,
};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{MigrationContext, array, decode_entry};
use crate::error::AccountError;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyGroup {
    group_id: String,
    master_key: Option<String>,
    expected_v2_id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    members: Vec<String>,
    color: Option<String>,
    #[serde(default)]
    message_expiration_time: u32,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    permission_denied: bool,
    distribution_id: Option<Uuid>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySticker {
    pack_id: String,
    pack_key: String,
    #[serde(default)]
    installed: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyContact {
    number: Option<String>,
    uuid: Option<Uuid>,
    name: Option<String>,
    color: Option<String>,
    #[serde(default)]
    message_expiration_time: u32,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    archived: bool,
    profile_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyCapabilities {
    #[serde(default)]
    gv1_migration: bool,
    #[serde(default)]
    storage: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyProfileBody {
    given_name: Option<String>,
    family_name: Option<String>,
    about: Option<String>,
    about_emoji: Option<String>,
    unidentified_access: Option<String>,
    #[serde(default)]
    unrestricted_unidentified_access: bool,
    capabilities: Option<LegacyCapabilities>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyProfile {
    number: Option<String>,
    uuid: Option<Uuid>,
    profile_key: Option<String>,
    #[serde(default)]
    last_update_timestamp: u64,
    profile: Option<LegacyProfileBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyThread {
    id: String,
    #[serde(default)]
    message_expiration_time: u32,
}

fn legacy_address(number: Option<String>, uuid: Option<Uuid>) -> Option<RecipientAddress> {
    let address = RecipientAddress { aci: uuid, number, ..RecipientAddress::default() };
    (address.aci.is_some() || address.number.is_some()).then_some(address)
}

fn decode_profile_key(text: &str) -> Option<ProfileKey> {
    let decoded = STANDARD
        .decode(text)
        .map_err(|e| e.to_string())
        .and_then(|raw| ProfileKey::from_bytes(&raw).map_err(|e| e.to_string()));
    match decoded {
        Ok(key) => Some(key),
        Err(err) => {
            warn!(%err, "skipping legacy entry with invalid profile key");
            None
        },
    }
}

pub(super) fn migrate_groups(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let Some(document) = ctx.sub_document("groupStore").cloned() else {
        return Ok(false);
    };
    let shared = ctx.stores.shared()?;
    let cache_dir = ctx.paths.group_cache_dir();

    let mut count = 0usize;
    for value in array(&document, "groups") {
        let Some(legacy) = decode_entry::<LegacyGroup>("groupStore", value) else { continue };
        let group_id = match GroupId::from_base64(&legacy.group_id) {
            Ok(id) => id,
            Err(err) => {
                warn!(%err, "skipping legacy group with invalid id");
                continue;
            },
        };

        let group = if let Some(master_key) = legacy.master_key.as_deref() {
            let Ok(master_key) = STANDARD.decode(master_key) else {
                warn!(group = %group_id, "skipping legacy group with invalid master key");
                continue;
            };
            let group_data = fs::read(cache_dir.join(URL_SAFE.encode(group_id.as_bytes()))).ok();
            GroupInfo::V2(GroupInfoV2 {
                group_id,
                master_key,
                group_data,
                blocked: legacy.blocked,
                permission_denied: legacy.permission_denied,
                distribution_id: legacy.distribution_id.unwrap_or_else(Uuid::new_v4),
            })
        } else {
            let mut members = BTreeSet::new();
            for member in &legacy.members {
                if let Some(id) = ctx.resolve_identifier(member, "groupStore")? {
                    members.insert(id);
                }
            }
            let expected_v2_id =
                legacy.expected_v2_id.as_deref().and_then(|text| GroupId::from_base64(text).ok());
            GroupInfo::V1(GroupInfoV1 {
                group_id,
                expected_v2_id,
                name: legacy.name,
                members,
                color: legacy.color,
                message_expiration_time: legacy.message_expiration_time,
                blocked: legacy.blocked,
                archived: legacy.archived,
            })
        };
        shared.store_group(&group)?;
        count += 1;
    }
    debug!(count, "migrated legacy groups");

    if cache_dir.is_dir() {
        ctx.consumed(cache_dir);
    }
    Ok(true)
}

pub(super) fn migrate_stickers(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let Some(document) = ctx.sub_document("stickerStore") else {
        return Ok(false);
    };
    let shared = ctx.stores.shared()?;
    for value in array(document, "stickers") {
        let Some(legacy) = decode_entry::<LegacySticker>("stickerStore", value) else { continue };
        let (Ok(pack_id), Ok(pack_key)) = (hex::decode(&legacy.pack_id), hex::decode(&legacy.pack_key))
        else {
            warn!(pack = %legacy.pack_id, "skipping legacy sticker pack with invalid hex");
            continue;
        };
        shared.store_sticker_pack(&StickerPack { pack_id, pack_key, installed: legacy.installed })?;
    }
    Ok(true)
}

pub(super) fn migrate_contacts(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let Some(document) = ctx.sub_document("contactStore") else {
        return Ok(false);
    };
    let shared = ctx.stores.shared()?;
    for value in array(document, "contacts") {
        let Some(legacy) = decode_entry::<LegacyContact>("contactStore", value) else { continue };
        let Some(address) = legacy_address(legacy.number, legacy.uuid) else {
            warn!("skipping legacy contact without address");
            continue;
        };
        let recipient = shared.resolve_trusted(&address)?;
        let contact = Contact {
            given_name: legacy.name,
            color: legacy.color,
            message_expiration_time: legacy.message_expiration_time,
            blocked: legacy.blocked,
            archived: legacy.archived,
            ..shared.contact(recipient)?.unwrap_or_default()
        };
        shared.store_contact(recipient, &contact)?;
        if let Some(key) = legacy.profile_key.as_deref().and_then(decode_profile_key) {
            shared.store_profile_key(recipient, key)?;
        }
    }
    Ok(true)
}

fn unidentified_access_mode(body: &LegacyProfileBody) -> UnidentifiedAccessMode {
    if body.unrestricted_unidentified_access {
        UnidentifiedAccessMode::Unrestricted
    } else if body.unidentified_access.is_some() {
        UnidentifiedAccessMode::Enabled
    } else {
        UnidentifiedAccessMode::Disabled
    }
}

pub(super) fn migrate_profiles(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let Some(document) = ctx.sub_document("profileStore") else {
        return Ok(false);
    };
    let shared = ctx.stores.shared()?;
    for value in array(document, "profiles") {
        let Some(legacy) = decode_entry::<LegacyProfile>("profileStore", value) else { continue };
        let key = match legacy.profile_key.as_deref() {
            Some(text) => match decode_profile_key(text) {
                Some(key) => Some(key),
                None => continue,
            },
            None => None,
        };
        let Some(address) = legacy_address(legacy.number, legacy.uuid) else {
            warn!("skipping legacy profile without address");
            continue;
        };
        let recipient = shared.resolve(&address)?;
        if let Some(key) = key {
            shared.store_profile_key(recipient, key)?;
        }
        let Some(body) = legacy.profile else { continue };

        let mut capabilities = BTreeSet::new();
        if let Some(flags) = &body.capabilities {
            if flags.gv1_migration {
                capabilities.insert(Capability::Gv1Migration);
            }
            if flags.storage {
                capabilities.insert(Capability::Storage);
            }
        }
        let profile = Profile {
            last_update_timestamp: legacy.last_update_timestamp,
            unidentified_access_mode: unidentified_access_mode(&body),
            given_name: body.given_name,
            family_name: body.family_name,
            about: body.about,
            about_emoji: body.about_emoji,
            capabilities,
            ..Profile::default()
        };
        shared.store_profile(recipient, &profile)?;
    }
    Ok(true)
}

fn is_contact_thread(id: &str) -> bool {
    id.starts_with('+') || Uuid::parse_str(id).is_ok()
}

pub(super) fn migrate_threads(ctx: &mut MigrationContext<'_>) -> Result<bool, AccountError> {
    let Some(document) = ctx.sub_document("threadStore").cloned() else {
        return Ok(false);
    };
    let shared = ctx.stores.shared()?;
    for value in array(&document, "threads") {
        let Some(thread) = decode_entry::<LegacyThread>("threadStore", value) else { continue };
        if thread.id.is_empty() {
            continue;
        }

        if is_contact_thread(&thread.id) {
            let Some(recipient) = ctx.resolve_identifier(&thread.id, "threadStore")? else {
                continue;
            };
            let Some(contact) = shared.contact(recipient)? else { continue };
            if contact.message_expiration_time != thread.message_expiration_time {
                let contact = contact.with_message_expiration_time(thread.message_expiration_time);
                shared.store_contact(recipient, &contact)?;
            }
            continue;
        }

        let Ok(group_id) = GroupId::from_base64(&thread.id) else {
            warn!(thread = %thread.id, "skipping legacy thread with invalid id");
            continue;
        };
        if let Some(GroupInfo::V1(mut group)) = shared.group(&group_id)?
            && group.message_expiration_time != thread.message_expiration_time
        {
            group.message_expiration_time = thread.message_expiration_time;
            shared.store_group(&GroupInfo::V1(group))?;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use keystead_core::{
        ContactStore, GroupStore, MemoryStore, ProfileStore, RecipientStore, ServiceEnvironment,
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

    #[test]
    fn groups_of_both_generations_with_cached_state() {
        let dir = tempdir().unwrap();
        let paths = AccountPaths::new(dir.path(), "+1");
        let v1_id = GroupId(vec![1; 16]);
        let v2_id = GroupId(vec![2; 32]);
        create_private_dir(&paths.group_cache_dir()).unwrap();
        fs::write(paths.group_cache_dir().join(URL_SAFE.encode(v2_id.as_bytes())), b"cached")
            .unwrap();
        let document = json!({
            "groupStore": { "groups": [
                { "groupId": v1_id.to_base64(), "name": "old", "members": ["+2", "junk"], "messageExpirationTime": 5 },
                { "groupId": v2_id.to_base64(), "masterKey": STANDARD.encode([7u8; 32]), "blocked": true },
            ]},
            "threadStore": { "threads": [{ "id": v1_id.to_base64(), "messageExpirationTime": 90 }] },
        });
        let mut state = AccountState::new("+1", ServiceEnvironment::Live, &mut OsRng);
        let store = MemoryStore::new();

        let outcome = run(&paths, CURRENT_STORAGE_VERSION, &document, &mut state, &store).unwrap();

        let Some(GroupInfo::V1(v1)) = store.group(&v1_id).unwrap() else { panic!("missing v1") };
        assert_eq!(v1.members.len(), 1);
        assert_eq!(v1.message_expiration_time, 90);
        let Some(GroupInfo::V2(v2)) = store.group(&v2_id).unwrap() else { panic!("missing v2") };
        assert_eq!(v2.group_data.as_deref(), Some(b"cached".as_slice()));
        assert!(v2.blocked);
        assert!(outcome.consumed.contains(&paths.group_cache_dir()));
    }

    #[test]
    fn profiles_translate_access_and_capabilities() {
        let dir = tempdir().unwrap();
        let paths = AccountPaths::new(dir.path(), "+1");
        let key = ProfileKey::from_bytes(&[4; 32]).unwrap();
        let document = json!({
            "profileStore": { "profiles": [{
                "number": "+2",
                "profileKey": STANDARD.encode(key.as_bytes()),
                "lastUpdateTimestamp": 99,
                "profile": {
                    "givenName": "Grace",
                    "unidentifiedAccess": "abc",
                    "capabilities": { "gv1Migration": true, "storage": false },
                },
            }]},
        });
        let mut state = AccountState::new("+1", ServiceEnvironment::Live, &mut OsRng);
        let store = MemoryStore::new();

        run(&paths, CURRENT_STORAGE_VERSION, &document, &mut state, &store).unwrap();

        let id = store.find(&RecipientAddress::from_number("+2")).unwrap().unwrap();
        let profile = store.profile(id).unwrap().unwrap();
        assert_eq!(store.profile_key(id).unwrap(), Some(key));
        assert_eq!(profile.given_name.as_deref(), Some("Grace"));
        assert_eq!(profile.unidentified_access_mode, UnidentifiedAccessMode::Enabled);
        assert_eq!(profile.capabilities, BTreeSet::from([Capability::Gv1Migration]));
        assert_eq!(profile.last_update_timestamp, 99);
    }

    #[test]
    fn contact_profile_key_lands_in_profile_store() {
        let dir = tempdir().unwrap();
        let paths = AccountPaths::new(dir.path(), "+1");
        let key = ProfileKey::from_bytes(&[6; 32]).unwrap();
        let document = json!({
            "contactStore": { "contacts": [{
                "number": "+3",
                "name": "Linus",
                "blocked": true,
                "profileKey": STANDARD.encode(key.as_bytes()),
            }]},
        });
        let mut state = AccountState::new("+1", ServiceEnvironment::Live, &mut OsRng);
        let store = MemoryStore::new();

        run(&paths, CURRENT_STORAGE_VERSION, &document, &mut state, &store).unwrap();

        let id = store.find(&RecipientAddress::from_number("+3")).unwrap().unwrap();
        let contact = store.contact(id).unwrap().unwrap();
        assert!(contact.blocked);
        assert_eq!(contact.given_name.as_deref(), Some("Linus"));
        assert_eq!(store.profile_key(id).unwrap(), Some(key));
    }

    #[test]
    fn contact_threads_only_touch_existing_contacts() {
        let dir = tempdir().unwrap();
        let paths = AccountPaths::new(dir.path(), "+1");
        let document = json!({
            "threadStore": { "threads": [{ "id": "+15550111", "messageExpirationTime": 60 }] },
        });
        let mut state = AccountState::new("+1", ServiceEnvironment::Live, &mut OsRng);
        let store = MemoryStore::new();

        run(&paths, 3, &document, &mut state, &store).unwrap();

        assert!(store.contacts().unwrap().is_empty());
    }

    #[test]
    fn zero_thread_expiration_resets_contact() {
        let dir = tempdir().unwrap();
        let paths = AccountPaths::new(dir.path(), "+1");
        let store = MemoryStore::new();
        let id = store.resolve(&RecipientAddress::from_number("+3")).unwrap();
        store.store_contact(id, &Contact::default().with_message_expiration_time(60)).unwrap();
        let document = json!({
            "threadStore": { "threads": [
                { "id": "+3", "messageExpirationTime": 0 },
                { "id": "" },
            ]},
        });
        let mut state = AccountState::new("+1", ServiceEnvironment::Live, &mut OsRng);

        run(&paths, CURRENT_STORAGE_VERSION, &document, &mut state, &store).unwrap();

        assert_eq!(store.contact(id).unwrap().unwrap().message_expiration_time, 0);
    }
}
