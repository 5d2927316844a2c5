use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
};

use uuid::Uuid;

use super::{
    ContactStore, GroupStore, IdentityStore, KyberPreKeyStore, PreKeyStore, ProfileStore,
    RecipientEntry, RecipientStore, SenderKeyStore, SessionStore, SignedPreKeyStore, StickerStore,
    best_match, require_resolvable,
};
use crate::{
    error::StoreError,
    identifiers::{IdentityRole, RecipientAddress, RecipientId, ServiceId},
    keys::{IdentityKey, ProfileKey},
    model::{Contact, GroupId, GroupInfo, IdentityInfo, Profile, StickerPack, TrustLevel},
    records::{KyberPreKeyRecord, PreKeyRecord, SenderKeyRecord, SessionRecord, SignedPreKeyRecord},
    settings::TrustNewIdentity,
};

type SenderKeyId = (RecipientId, u32, Uuid);

/// In-memory implementation of every store trait, for tests and
/// simulation.
///
/// Clones share state. Role-scoped traits are implemented by the handle
/// returned from [`MemoryStore::role`]. Uses `lock().expect()`, which
/// panics if the mutex is poisoned; acceptable for test code.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    trust_policy: TrustNewIdentity,
    pre_keys: BTreeMap<(IdentityRole, u32), PreKeyRecord>,
    signed_pre_keys: BTreeMap<(IdentityRole, u32), SignedPreKeyRecord>,
    /// Record plus last-resort flag
    kyber_pre_keys: BTreeMap<(IdentityRole, u32), (KyberPreKeyRecord, bool)>,
    sessions: BTreeMap<(IdentityRole, RecipientId, u32), SessionRecord>,
    identities: BTreeMap<ServiceId, IdentityInfo>,
    sender_keys: BTreeMap<SenderKeyId, SenderKeyRecord>,
    shared_sender_keys: BTreeMap<Uuid, BTreeSet<(RecipientId, u32)>>,
    recipients: BTreeMap<RecipientId, RecipientEntry>,
    next_recipient_id: u64,
    groups: BTreeMap<GroupId, GroupInfo>,
    sticker_packs: BTreeMap<Vec<u8>, StickerPack>,
}

impl MemoryStore {
    /// Empty store with the default trust policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store applying `policy` to new identity keys.
    pub fn with_trust_policy(policy: TrustNewIdentity) -> Self {
        let store = Self::new();
        store.lock().trust_policy = policy;
        store
    }

    /// Handle implementing the role-scoped store traits for `role`.
    pub fn role(&self, role: IdentityRole) -> MemoryRoleStore {
        MemoryRoleStore { store: self.clone(), role }
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for
    /// test code.
    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("Mutex poisoned")
    }

    fn resolve_with(
        &self,
        address: &RecipientAddress,
        merge: bool,
    ) -> Result<RecipientId, StoreError> {
        require_resolvable(address)?;
        let mut inner = self.lock();
        let found = best_match(inner.recipients.iter().map(|(id, e)| (*id, &e.address)), address);
        if let Some(id) = found {
            if merge && let Some(entry) = inner.recipients.get_mut(&id) {
                entry.address.merge_from(address);
            }
            return Ok(id);
        }

        inner.next_recipient_id += 1;
        let id = RecipientId(inner.next_recipient_id);
        inner
            .recipients
            .insert(id, RecipientEntry { address: address.clone(), ..RecipientEntry::default() });
        Ok(id)
    }

    fn with_entry<T>(&self, id: RecipientId, f: impl FnOnce(&RecipientEntry) -> Option<T>) -> Option<T> {
        self.lock().recipients.get(&id).and_then(f)
    }

    fn update_entry(
        &self,
        id: RecipientId,
        f: impl FnOnce(&mut RecipientEntry),
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let entry = inner
            .recipients
            .get_mut(&id)
            .ok_or_else(|| StoreError::InvalidRecord(format!("unknown recipient {id}")))?;
        f(entry);
        Ok(())
    }
}

/// Role-scoped view of a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryRoleStore {
    store: MemoryStore,
    role: IdentityRole,
}

impl MemoryRoleStore {
    fn ids<V>(&self, map: &BTreeMap<(IdentityRole, u32), V>) -> Vec<u32> {
        map.keys().filter(|(role, _)| *role == self.role).map(|(_, id)| *id).collect()
    }
}

impl PreKeyStore for MemoryRoleStore {
    fn load_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, StoreError> {
        Ok(self.store.lock().pre_keys.get(&(self.role, id)).cloned())
    }

    fn store_pre_key(&self, record: &PreKeyRecord) -> Result<(), StoreError> {
        self.store.lock().pre_keys.insert((self.role, record.id), record.clone());
        Ok(())
    }

    fn remove_pre_key(&self, id: u32) -> Result<(), StoreError> {
        self.store.lock().pre_keys.remove(&(self.role, id));
        Ok(())
    }

    fn remove_all_pre_keys(&self) -> Result<(), StoreError> {
        self.store.lock().pre_keys.retain(|(role, _), _| *role != self.role);
        Ok(())
    }

    fn pre_key_ids(&self) -> Result<Vec<u32>, StoreError> {
        Ok(self.ids(&self.store.lock().pre_keys))
    }
}

impl SignedPreKeyStore for MemoryRoleStore {
    fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        Ok(self.store.lock().signed_pre_keys.get(&(self.role, id)).cloned())
    }

    fn store_signed_pre_key(&self, record: &SignedPreKeyRecord) -> Result<(), StoreError> {
        self.store.lock().signed_pre_keys.insert((self.role, record.id), record.clone());
        Ok(())
    }

    fn remove_signed_pre_key(&self, id: u32) -> Result<(), StoreError> {
        self.store.lock().signed_pre_keys.remove(&(self.role, id));
        Ok(())
    }

    fn remove_all_signed_pre_keys(&self) -> Result<(), StoreError> {
        self.store.lock().signed_pre_keys.retain(|(role, _), _| *role != self.role);
        Ok(())
    }

    fn signed_pre_key_ids(&self) -> Result<Vec<u32>, StoreError> {
        Ok(self.ids(&self.store.lock().signed_pre_keys))
    }
}

impl KyberPreKeyStore for MemoryRoleStore {
    fn load_kyber_pre_key(&self, id: u32) -> Result<Option<KyberPreKeyRecord>, StoreError> {
        Ok(self.store.lock().kyber_pre_keys.get(&(self.role, id)).map(|(r, _)| r.clone()))
    }

    fn store_kyber_pre_key(
        &self,
        record: &KyberPreKeyRecord,
        last_resort: bool,
    ) -> Result<(), StoreError> {
        self.store
            .lock()
            .kyber_pre_keys
            .insert((self.role, record.id), (record.clone(), last_resort));
        Ok(())
    }

    fn mark_kyber_pre_key_used(&self, id: u32) -> Result<(), StoreError> {
        let mut inner = self.store.lock();
        if matches!(inner.kyber_pre_keys.get(&(self.role, id)), Some((_, false))) {
            inner.kyber_pre_keys.remove(&(self.role, id));
        }
        Ok(())
    }

    fn remove_all_kyber_pre_keys(&self) -> Result<(), StoreError> {
        self.store.lock().kyber_pre_keys.retain(|(role, _), _| *role != self.role);
        Ok(())
    }

    fn kyber_pre_key_ids(&self) -> Result<Vec<u32>, StoreError> {
        Ok(self.ids(&self.store.lock().kyber_pre_keys))
    }
}

impl SessionStore for MemoryRoleStore {
    fn load_session(
        &self,
        recipient: RecipientId,
        device_id: u32,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.store.lock().sessions.get(&(self.role, recipient, device_id)).cloned())
    }

    fn store_session(
        &self,
        recipient: RecipientId,
        device_id: u32,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        self.store.lock().sessions.insert((self.role, recipient, device_id), record.clone());
        Ok(())
    }

    fn session_device_ids(&self, recipient: RecipientId) -> Result<Vec<u32>, StoreError> {
        Ok(self
            .store
            .lock()
            .sessions
            .keys()
            .filter(|(role, r, _)| *role == self.role && *r == recipient)
            .map(|(_, _, device)| *device)
            .collect())
    }

    fn delete_session(&self, recipient: RecipientId, device_id: u32) -> Result<(), StoreError> {
        self.store.lock().sessions.remove(&(self.role, recipient, device_id));
        Ok(())
    }

    fn delete_all_sessions(&self, recipient: RecipientId) -> Result<(), StoreError> {
        self.store.lock().sessions.retain(|(role, r, _), _| !(*role == self.role && *r == recipient));
        Ok(())
    }

    fn archive_all_sessions(&self) -> Result<(), StoreError> {
        for ((role, _, _), record) in &mut self.store.lock().sessions {
            if *role == self.role {
                record.archived = true;
            }
        }
        Ok(())
    }
}

impl IdentityStore for MemoryStore {
    fn save_identity(
        &self,
        service_id: ServiceId,
        key: &IdentityKey,
        added_timestamp: u64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let policy = inner.trust_policy;
        let (replaced, first_seen) = match inner.identities.get(&service_id) {
            Some(existing) if existing.identity_key == *key => return Ok(false),
            Some(_) => (true, false),
            None => (false, true),
        };
        inner.identities.insert(
            service_id,
            IdentityInfo {
                identity_key: *key,
                trust_level: policy.initial_trust(first_seen),
                added_timestamp,
            },
        );
        Ok(replaced)
    }

    fn identity(&self, service_id: ServiceId) -> Result<Option<IdentityInfo>, StoreError> {
        Ok(self.lock().identities.get(&service_id).cloned())
    }

    fn set_trust_level(
        &self,
        service_id: ServiceId,
        key: &IdentityKey,
        trust_level: TrustLevel,
    ) -> Result<bool, StoreError> {
        match self.lock().identities.get_mut(&service_id) {
            Some(info) if info.identity_key == *key => {
                info.trust_level = trust_level;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    fn delete_identity(&self, service_id: ServiceId) -> Result<(), StoreError> {
        self.lock().identities.remove(&service_id);
        Ok(())
    }

    fn identities(&self) -> Result<Vec<(ServiceId, IdentityInfo)>, StoreError> {
        Ok(self.lock().identities.iter().map(|(id, info)| (*id, info.clone())).collect())
    }
}

impl SenderKeyStore for MemoryStore {
    fn store_sender_key(
        &self,
        sender: RecipientId,
        device_id: u32,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), StoreError> {
        self.lock().sender_keys.insert((sender, device_id, distribution_id), record.clone());
        Ok(())
    }

    fn load_sender_key(
        &self,
        sender: RecipientId,
        device_id: u32,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, StoreError> {
        Ok(self.lock().sender_keys.get(&(sender, device_id, distribution_id)).cloned())
    }

    fn mark_shared(
        &self,
        distribution_id: Uuid,
        devices: &[(RecipientId, u32)],
    ) -> Result<(), StoreError> {
        self.lock()
            .shared_sender_keys
            .entry(distribution_id)
            .or_default()
            .extend(devices.iter().copied());
        Ok(())
    }

    fn shared_with(&self, distribution_id: Uuid) -> Result<Vec<(RecipientId, u32)>, StoreError> {
        Ok(self
            .lock()
            .shared_sender_keys
            .get(&distribution_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    fn delete_sender_keys(&self, recipient: RecipientId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.sender_keys.retain(|(sender, _, _), _| *sender != recipient);
        for set in inner.shared_sender_keys.values_mut() {
            set.retain(|(r, _)| *r != recipient);
        }
        Ok(())
    }

    fn delete_all_sender_keys(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.sender_keys.clear();
        inner.shared_sender_keys.clear();
        Ok(())
    }
}

impl RecipientStore for MemoryStore {
    fn resolve(&self, address: &RecipientAddress) -> Result<RecipientId, StoreError> {
        self.resolve_with(address, false)
    }

    fn resolve_trusted(&self, address: &RecipientAddress) -> Result<RecipientId, StoreError> {
        self.resolve_with(address, true)
    }

    fn import(&self, id: RecipientId, address: &RecipientAddress) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.recipients.entry(id).or_default().address.merge_from(address);
        inner.next_recipient_id = inner.next_recipient_id.max(id.0);
        Ok(())
    }

    fn find(&self, address: &RecipientAddress) -> Result<Option<RecipientId>, StoreError> {
        let inner = self.lock();
        Ok(best_match(inner.recipients.iter().map(|(id, e)| (*id, &e.address)), address))
    }

    fn address(&self, id: RecipientId) -> Result<Option<RecipientAddress>, StoreError> {
        Ok(self.with_entry(id, |e| Some(e.address.clone())))
    }

    fn remove(&self, id: RecipientId) -> Result<(), StoreError> {
        self.lock().recipients.remove(&id);
        Ok(())
    }

    fn recipients(&self) -> Result<Vec<(RecipientId, RecipientAddress)>, StoreError> {
        Ok(self.lock().recipients.iter().map(|(id, e)| (*id, e.address.clone())).collect())
    }
}

impl ContactStore for MemoryStore {
    fn contact(&self, id: RecipientId) -> Result<Option<Contact>, StoreError> {
        Ok(self.with_entry(id, |e| e.contact.clone()))
    }

    fn store_contact(&self, id: RecipientId, contact: &Contact) -> Result<(), StoreError> {
        self.update_entry(id, |e| e.contact = Some(contact.clone()))
    }

    fn contacts(&self) -> Result<Vec<(RecipientId, Contact)>, StoreError> {
        Ok(self
            .lock()
            .recipients
            .iter()
            .filter_map(|(id, e)| e.contact.clone().map(|c| (*id, c)))
            .collect())
    }
}

impl ProfileStore for MemoryStore {
    fn profile(&self, id: RecipientId) -> Result<Option<Profile>, StoreError> {
        Ok(self.with_entry(id, |e| e.profile.clone()))
    }

    fn store_profile(&self, id: RecipientId, profile: &Profile) -> Result<(), StoreError> {
        self.update_entry(id, |e| e.profile = Some(profile.clone()))
    }

    fn profile_key(&self, id: RecipientId) -> Result<Option<ProfileKey>, StoreError> {
        Ok(self.with_entry(id, |e| e.profile_key))
    }

    fn store_profile_key(&self, id: RecipientId, key: ProfileKey) -> Result<(), StoreError> {
        self.update_entry(id, |e| e.set_profile_key(key))
    }
}

impl GroupStore for MemoryStore {
    fn group(&self, id: &GroupId) -> Result<Option<GroupInfo>, StoreError> {
        Ok(self.lock().groups.get(id).cloned())
    }

    fn store_group(&self, group: &GroupInfo) -> Result<(), StoreError> {
        self.lock().groups.insert(group.group_id().clone(), group.clone());
        Ok(())
    }

    fn delete_group(&self, id: &GroupId) -> Result<(), StoreError> {
        self.lock().groups.remove(id);
        Ok(())
    }

    fn groups(&self) -> Result<Vec<GroupInfo>, StoreError> {
        Ok(self.lock().groups.values().cloned().collect())
    }
}

impl StickerStore for MemoryStore {
    fn sticker_pack(&self, pack_id: &[u8]) -> Result<Option<StickerPack>, StoreError> {
        Ok(self.lock().sticker_packs.get(pack_id).cloned())
    }

    fn store_sticker_pack(&self, pack: &StickerPack) -> Result<(), StoreError> {
        self.lock().sticker_packs.insert(pack.pack_id.clone(), pack.clone());
        Ok(())
    }

    fn sticker_packs(&self) -> Result<Vec<StickerPack>, StoreError> {
        Ok(self.lock().sticker_packs.values().cloned().collect())
    }
}
