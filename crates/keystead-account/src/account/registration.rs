//! Registration, linking and the key material tied to them.

use std::{fs, io};

use keystead_core::{
    IdentityKeyPair, IdentityRole, KyberPreKeyRecord, MasterKey, PRIMARY_DEVICE_ID,
    PreKeyCollection, PreKeyStream, ProfileKey, ServiceEnvironment, ServiceId,
    SignedPreKeyRecord, StorageKey, TrustLevel,
};
use rand::rngs::OsRng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Account;
use crate::{
    descriptor::AccountState,
    error::AccountError,
    paths::{remove_path, write_atomic},
    stores::StoreProvider,
};

/// Identity material of a primary account about to register.
#[derive(Debug, Clone)]
pub struct NewAccount {
    /// Phone number
    pub number: String,
    /// Environment to register in
    pub service_environment: ServiceEnvironment,
    /// ACI identity key pair
    pub aci_identity_key_pair: IdentityKeyPair,
    /// PNI identity key pair
    pub pni_identity_key_pair: IdentityKeyPair,
    /// ACI registration id
    pub registration_id: u32,
    /// PNI registration id
    pub pni_registration_id: u32,
    /// Own profile key
    pub profile_key: ProfileKey,
}

/// What a primary device hands to a newly linked device.
#[derive(Debug, Clone)]
pub struct ProvisioningData {
    /// Phone number
    pub number: String,
    /// Account identifier
    pub aci: Uuid,
    /// Phone number identifier
    pub pni: Option<Uuid>,
    /// Service password of the new device
    pub password: String,
    /// Encrypted name of the new device
    pub encrypted_device_name: Option<String>,
    /// Device id assigned by the service
    pub device_id: u32,
    /// ACI identity key pair
    pub aci_identity_key_pair: IdentityKeyPair,
    /// PNI identity key pair
    pub pni_identity_key_pair: Option<IdentityKeyPair>,
    /// Own profile key
    pub profile_key: ProfileKey,
}

/// A linked device's provisioning plus its local registration ids.
#[derive(Debug, Clone)]
pub struct LinkedDevice {
    /// Environment the primary is registered in
    pub service_environment: ServiceEnvironment,
    /// ACI registration id of this device
    pub registration_id: u32,
    /// PNI registration id of this device
    pub pni_registration_id: u32,
    /// Provisioning message content
    pub provisioning: ProvisioningData,
}

impl Account {
    /// Adopt the identity of a primary device after linking.
    ///
    /// Storage-service state from a previous link is discarded.
    ///
    /// # Errors
    ///
    /// Store errors while recording the own profile key and identities.
    pub fn set_provisioning_data(&self, data: ProvisioningData) -> Result<(), AccountError> {
        let has_pni_identity = data.pni_identity_key_pair.is_some();
        self.update(|state| {
            state.number = data.number;
            state.aci = Some(data.aci);
            state.pni = data.pni;
            state.password = Some(data.password);
            state.profile_key = Some(data.profile_key);
            state.encrypted_device_name = data.encrypted_device_name;
            state.device_id = data.device_id;
            state.aci_data.identity_key_pair = Some(data.aci_identity_key_pair);
            state.pni_data.identity_key_pair = data.pni_identity_key_pair;
            state.registered = true;
            state.multi_device = true;
            state.last_receive_timestamp = 0;
            state.pin_master_key = None;
            state.storage_manifest_version = None;
            state.storage_key = None;
        });
        self.set_storage_manifest(None);
        self.store_self_profile_key()?;

        self.trust_self_identity(IdentityRole::Aci)?;
        if has_pni_identity {
            self.trust_self_identity(IdentityRole::Pni)?;
        }
        Ok(())
    }

    /// Complete a primary registration.
    ///
    /// Replaces the pre-keys of both roles with the ones uploaded during
    /// registration, archives every session and drops all sender keys.
    ///
    /// # Errors
    ///
    /// Pre-key id desync and store errors.
    pub fn finish_registration(
        &self,
        aci: Uuid,
        pni: Uuid,
        master_key: Option<MasterKey>,
        pin: Option<String>,
        aci_pre_keys: &PreKeyCollection,
        pni_pre_keys: &PreKeyCollection,
    ) -> Result<(), AccountError> {
        self.update(|state| {
            state.pin_master_key = master_key;
            state.storage_manifest_version = None;
            state.storage_key = None;
            state.encrypted_device_name = None;
            state.device_id = PRIMARY_DEVICE_ID;
            state.multi_device = false;
            state.registered = true;
            state.aci = Some(aci);
            state.pni = Some(pni);
            state.registration_lock_pin = pin;
            state.last_receive_timestamp = 0;
        });
        self.set_storage_manifest(None);

        {
            let mut state = self.lock_state();
            self.set_pre_keys_locked(&mut state, IdentityRole::Aci, aci_pre_keys)?;
            self.set_pre_keys_locked(&mut state, IdentityRole::Pni, pni_pre_keys)?;
            self.persist(&state);
        }
        for role in IdentityRole::ALL {
            self.stores.role(role)?.archive_all_sessions()?;
        }
        self.stores.shared()?.delete_all_sender_keys()?;
        self.resolve_self_trusted()?;
        for role in IdentityRole::ALL {
            self.trust_self_identity(role)?;
        }
        info!(account = %self.paths.descriptor_file().display(), %aci, "finished registration");
        Ok(())
    }

    /// Record the own identity key of `role` as verified.
    ///
    /// # Errors
    ///
    /// `AccountError::MissingIdentity` if the role has no service id or
    /// key pair yet.
    pub fn trust_self_identity(&self, role: IdentityRole) -> Result<(), AccountError> {
        let (service_id, key) = {
            let state = self.lock_state();
            match (state.service_uuid(role), &state.role(role).identity_key_pair) {
                (Some(uuid), Some(pair)) => (ServiceId::new(role, uuid), pair.public_key()),
                _ => return Err(AccountError::MissingIdentity(role)),
            }
        };
        let shared = self.stores.shared()?;
        shared.save_identity(service_id, &key, now_millis())?;
        shared.set_trust_level(service_id, &key, TrustLevel::TrustedVerified)?;
        Ok(())
    }

    /// Set the phone number identifier.
    ///
    /// A changed PNI invalidates the old one's identity entry and all of
    /// its pre-keys.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub fn set_pni(&self, pni: Uuid) -> Result<(), AccountError> {
        let mut state = self.lock_state();
        if let Some(old) = state.pni
            && old != pni
        {
            debug!(%old, new = %pni, "pni changed, dropping old pni state");
            self.stores.shared()?.delete_identity(ServiceId::Pni(old))?;
            self.clear_all_pre_keys_locked(&mut state, IdentityRole::Pni)?;
        }
        state.pni = Some(pni);
        self.persist(&state);
        Ok(())
    }

    /// Adopt a new PNI identity after a number change.
    ///
    /// # Errors
    ///
    /// Pre-key id desync and store errors.
    pub fn set_new_pni_identity(
        &self,
        key_pair: IdentityKeyPair,
        signed_pre_key: &SignedPreKeyRecord,
        last_resort_kyber_pre_key: Option<&KyberPreKeyRecord>,
        registration_id: u32,
    ) -> Result<(), AccountError> {
        let mut state = self.lock_state();
        let role = IdentityRole::Pni;
        {
            let data = state.role_mut(role);
            data.identity_key_pair = Some(key_pair);
            data.registration_id = registration_id;
            data.pre_key_metadata.set_next_id(PreKeyStream::Signed, signed_pre_key.id);
        }
        self.add_signed_pre_key_locked(&mut state, role, signed_pre_key)?;
        if let Some(record) = last_resort_kyber_pre_key {
            state.role_mut(role).pre_key_metadata.set_next_id(PreKeyStream::Kyber, record.id);
            self.add_last_resort_kyber_pre_key_locked(&mut state, role, record)?;
        }
        self.persist(&state);
        Ok(())
    }

    /// Registration lock token, when a pin is set.
    pub fn registration_lock(&self) -> Option<String> {
        let state = self.lock_state();
        pin_backed_master_key(&state).map(MasterKey::derive_registration_lock)
    }

    /// Master key backed by the registration lock pin.
    pub fn pin_backed_master_key(&self) -> Option<MasterKey> {
        pin_backed_master_key(&self.lock_state()).cloned()
    }

    /// Master key, generated and persisted on first use.
    pub fn get_or_create_pin_master_key(&self) -> MasterKey {
        let mut state = self.lock_state();
        if let Some(key) = &state.pin_master_key {
            return key.clone();
        }
        let key = MasterKey::generate(&mut OsRng);
        state.pin_master_key = Some(key.clone());
        self.persist(&state);
        debug!("generated pin master key");
        key
    }

    /// Key for the storage service, if one is available.
    ///
    /// Derived from the master key when there is one, otherwise the key
    /// provisioned by the primary device.
    pub fn storage_key(&self) -> Option<StorageKey> {
        let state = self.lock_state();
        match &state.pin_master_key {
            Some(master_key) => Some(master_key.derive_storage_service_key()),
            None => state.storage_key,
        }
    }

    /// Key for the storage service.
    ///
    /// The primary device derives it from its master key, creating that
    /// on first use. Linked devices only have the provisioned key.
    pub fn get_or_create_storage_key(&self) -> Option<StorageKey> {
        if self.is_primary_device() {
            return Some(self.get_or_create_pin_master_key().derive_storage_service_key());
        }
        self.lock_state().storage_key
    }

    /// Store the storage key sent by the primary device.
    pub fn set_storage_key(&self, key: StorageKey) {
        let mut state = self.lock_state();
        if state.storage_key == Some(key) {
            return;
        }
        state.storage_key = Some(key);
        self.persist(&state);
    }

    /// Version of the last storage manifest read.
    pub fn storage_manifest_version(&self) -> Option<u64> {
        self.lock_state().storage_manifest_version
    }

    /// Record the version of the last storage manifest read.
    pub fn set_storage_manifest_version(&self, version: Option<u64>) {
        let mut state = self.lock_state();
        if state.storage_manifest_version == version {
            return;
        }
        state.storage_manifest_version = version;
        self.persist(&state);
    }

    /// Last storage manifest read, if cached.
    pub fn storage_manifest(&self) -> Option<Vec<u8>> {
        let path = self.paths.storage_manifest_file();
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to read local storage manifest");
                None
            },
        }
    }

    /// Cache a storage manifest, or delete the cached one with `None`.
    pub fn set_storage_manifest(&self, manifest: Option<&[u8]>) {
        let path = self.paths.storage_manifest_file();
        let result = match manifest {
            Some(bytes) => self.paths.ensure_account_dir().and_then(|_| write_atomic(&path, bytes)),
            None => remove_path(&path),
        };
        if let Err(err) = result {
            warn!(path = %path.display(), %err, "failed to store local storage manifest");
        }
    }
}

fn pin_backed_master_key(state: &AccountState) -> Option<&MasterKey> {
    state.registration_lock_pin.as_ref().and(state.pin_master_key.as_ref())
}

pub(super) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use keystead_core::{
        PREKEY_MAXIMUM_ID, PreKeyRecord, RecipientAddress, SenderKeyRecord, SessionRecord,
        Settings, keys::generate_registration_id,
    };
    use tempfile::tempdir;

    use super::*;
    use crate::account::tests::new_account;

    fn provisioning(number: &str) -> ProvisioningData {
        ProvisioningData {
            number: number.to_owned(),
            aci: Uuid::new_v4(),
            pni: Some(Uuid::new_v4()),
            password: "secret".to_owned(),
            encrypted_device_name: Some("bmFtZQ==".to_owned()),
            device_id: 3,
            aci_identity_key_pair: IdentityKeyPair::generate(&mut OsRng),
            pni_identity_key_pair: Some(IdentityKeyPair::generate(&mut OsRng)),
            profile_key: ProfileKey::generate(&mut OsRng),
        }
    }

    fn linked(number: &str) -> LinkedDevice {
        LinkedDevice {
            service_environment: ServiceEnvironment::Staging,
            registration_id: generate_registration_id(&mut OsRng),
            pni_registration_id: generate_registration_id(&mut OsRng),
            provisioning: provisioning(number),
        }
    }

    fn collection(base: u32) -> PreKeyCollection {
        PreKeyCollection {
            one_time_pre_key_offset: base,
            next_signed_pre_key_id: base,
            one_time_kyber_pre_key_offset: base,
            one_time_pre_keys: vec![PreKeyRecord { id: base, key_pair: vec![1] }],
            signed_pre_key: Some(SignedPreKeyRecord {
                id: base,
                timestamp: 1,
                key_pair: vec![2],
                signature: vec![3],
            }),
            one_time_kyber_pre_keys: Vec::new(),
            last_resort_kyber_pre_key: Some(KyberPreKeyRecord {
                id: base,
                timestamp: 1,
                key_pair: vec![4],
                signature: vec![5],
            }),
        }
    }

    #[test]
    fn linked_account_adopts_provisioning() {
        let dir = tempdir().unwrap();
        let device = linked("+1");
        let aci = device.provisioning.aci;
        let registration_id = device.registration_id;

        let account =
            Account::create_or_update_linked_account(dir.path(), "+1", device, Settings::default())
                .unwrap();

        assert!(account.is_registered());
        assert!(account.is_multi_device());
        assert!(!account.is_primary_device());
        assert_eq!(account.device_id(), 3);
        assert_eq!(account.aci(), Some(aci));
        assert_eq!(account.registration_id(IdentityRole::Aci), registration_id);
        assert_eq!(account.service_environment(), Some(ServiceEnvironment::Staging));
        let identity = account.shared_store().unwrap().identity(ServiceId::Aci(aci)).unwrap().unwrap();
        assert_eq!(identity.trust_level, TrustLevel::TrustedVerified);
    }

    #[test]
    fn relinking_invalidates_protocol_state() {
        let dir = tempdir().unwrap();
        let mut account =
            Account::create_or_update_linked_account(dir.path(), "+1", linked("+1"), Settings::default())
                .unwrap();
        let peer = account
            .shared_store()
            .unwrap()
            .resolve(&RecipientAddress::from_aci(Uuid::new_v4()))
            .unwrap();
        let aci = account.protocol_store(IdentityRole::Aci).unwrap();
        aci.protocol.store_session(peer, 1, &SessionRecord::new(vec![1])).unwrap();
        let distribution = Uuid::new_v4();
        aci.shared
            .store_sender_key(peer, 1, distribution, &SenderKeyRecord { data: vec![1], created_at: 1 })
            .unwrap();
        account.set_storage_manifest(Some(b"manifest"));
        drop(aci);
        account.close();

        let device = linked("+1");
        let new_aci = device.provisioning.aci;
        let account =
            Account::create_or_update_linked_account(dir.path(), "+1", device, Settings::default())
                .unwrap();

        assert_eq!(account.aci(), Some(new_aci));
        let aci = account.protocol_store(IdentityRole::Aci).unwrap();
        assert!(aci.protocol.load_session(peer, 1).unwrap().unwrap().archived);
        assert!(aci.shared.load_sender_key(peer, 1, distribution).unwrap().is_none());
        assert!(account.storage_manifest().is_none());
    }

    #[test]
    fn finish_registration_installs_pre_keys_for_both_roles() {
        let dir = tempdir().unwrap();
        let account = Account::create(dir.path(), "+1", new_account("+1"), Settings::default()).unwrap();
        let (aci, pni) = (Uuid::new_v4(), Uuid::new_v4());

        let master_key = Some(MasterKey::generate(&mut OsRng));
        account
            .finish_registration(aci, pni, master_key, Some("1234".into()), &collection(10), &collection(50))
            .unwrap();

        assert!(account.is_registered());
        assert!(account.is_primary_device());
        assert!(account.registration_lock().is_some());
        let pni_store = account.protocol_store(IdentityRole::Pni).unwrap();
        assert_eq!(pni_store.protocol.pre_key_ids().unwrap(), vec![50]);
        assert_eq!(pni_store.protocol.signed_pre_key_ids().unwrap(), vec![50]);
        let meta = account.pre_key_metadata(IdentityRole::Aci);
        assert_eq!(meta.active_last_resort_kyber_pre_key_id(), Some(10));
        let identity = pni_store.shared.identity(ServiceId::Pni(pni)).unwrap().unwrap();
        assert_eq!(identity.trust_level, TrustLevel::TrustedVerified);
        assert!(pni_store.shared.find(&RecipientAddress::from_aci(aci)).unwrap().is_some());
    }

    #[test]
    fn changing_pni_drops_old_pni_state() {
        let dir = tempdir().unwrap();
        let account = Account::create(dir.path(), "+1", new_account("+1"), Settings::default()).unwrap();
        let old = Uuid::new_v4();
        account.set_aci(Uuid::new_v4());
        account.set_pni(old).unwrap();
        account.trust_self_identity(IdentityRole::Pni).unwrap();
        let next = account.pre_key_metadata(IdentityRole::Pni).next_id(PreKeyStream::OneTime);
        account.add_pre_keys(IdentityRole::Pni, &[PreKeyRecord { id: next, key_pair: vec![1] }]).unwrap();

        account.set_pni(Uuid::new_v4()).unwrap();

        let store = account.protocol_store(IdentityRole::Pni).unwrap();
        assert!(store.protocol.pre_key_ids().unwrap().is_empty());
        assert!(store.shared.identity(ServiceId::Pni(old)).unwrap().is_none());
    }

    #[test]
    fn new_pni_identity_rebases_streams() {
        let dir = tempdir().unwrap();
        let account = Account::create(dir.path(), "+1", new_account("+1"), Settings::default()).unwrap();
        let pair = IdentityKeyPair::generate(&mut OsRng);
        let signed = SignedPreKeyRecord { id: 77, timestamp: 1, key_pair: vec![1], signature: vec![2] };
        let last_resort = KyberPreKeyRecord {
            id: PREKEY_MAXIMUM_ID - 1,
            timestamp: 1,
            key_pair: vec![3],
            signature: vec![4],
        };

        account.set_new_pni_identity(pair.clone(), &signed, Some(&last_resort), 999).unwrap();

        assert_eq!(account.identity_key_pair(IdentityRole::Pni), Some(pair));
        assert_eq!(account.registration_id(IdentityRole::Pni), 999);
        let meta = account.pre_key_metadata(IdentityRole::Pni);
        assert_eq!(meta.next_id(PreKeyStream::Signed), 78);
        assert_eq!(meta.next_id(PreKeyStream::Kyber), 0);
        assert_eq!(meta.active_last_resort_kyber_pre_key_id(), Some(PREKEY_MAXIMUM_ID - 1));
    }

    #[test]
    fn storage_key_follows_device_kind() {
        let dir = tempdir().unwrap();
        let primary = Account::create(dir.path(), "+1", new_account("+1"), Settings::default()).unwrap();
        assert!(primary.storage_key().is_none());
        let created = primary.get_or_create_storage_key().unwrap();
        assert_eq!(primary.storage_key(), Some(created));
        assert_eq!(primary.get_or_create_storage_key(), Some(created));

        let linked =
            Account::create_or_update_linked_account(dir.path(), "+2", linked("+2"), Settings::default())
                .unwrap();
        assert!(linked.get_or_create_storage_key().is_none());
        let provisioned = StorageKey::from_bytes(&[9; 32]).unwrap();
        linked.set_storage_key(provisioned);
        assert_eq!(linked.get_or_create_storage_key(), Some(provisioned));
    }

    #[test]
    fn storage_manifest_file_round_trip() {
        let dir = tempdir().unwrap();
        let account = Account::create(dir.path(), "+1", new_account("+1"), Settings::default()).unwrap();
        assert!(account.storage_manifest().is_none());

        account.set_storage_manifest(Some(b"manifest"));
        assert_eq!(account.storage_manifest().as_deref(), Some(b"manifest".as_slice()));

        account.set_storage_manifest(None);
        assert!(account.storage_manifest().is_none());
    }

    #[test]
    fn trust_self_identity_requires_service_id() {
        let dir = tempdir().unwrap();
        let account = Account::create(dir.path(), "+1", new_account("+1"), Settings::default()).unwrap();

        let err = account.trust_self_identity(IdentityRole::Aci).unwrap_err();
        assert!(matches!(err, AccountError::MissingIdentity(IdentityRole::Aci)));
    }
}
