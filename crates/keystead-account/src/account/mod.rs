//! The loaded account.
//!
//! An [`Account`] owns the locked descriptor file for as long as it lives,
//! holds the decoded descriptor in memory and reaches every other piece of
//! state through its [`StoreRegistry`]. Every mutator persists the
//! descriptor before returning.
//!
//! # Locking
//!
//! Two in-process mutexes guard an account: one around the descriptor
//! state, one around the file handle. When both are held, the state mutex
//! is taken first. The cross-process file lock is held from `load` or
//! `create` until `close`.

mod attributes;
mod prekeys;
mod registration;

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use keystead_core::{
    ConfigurationStore, IdentityKeyPair, IdentityRole, PreKeyMetadata, ProfileKey,
    RecipientAddress, RecipientId, ServiceEnvironment, ServiceId, Settings, StoreError,
    keys::generate_password,
};
use rand::rngs::OsRng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use self::{
    attributes::{AccountAttributes, Credentials, CredentialsProvider},
    registration::{LinkedDevice, NewAccount, ProvisioningData},
};
use crate::{
    descriptor::{self, AccountState, CURRENT_STORAGE_VERSION},
    error::AccountError,
    lock::DescriptorFile,
    message_cache::MessageCache,
    migration::{self, MigrationOutcome},
    paths::{AccountPaths, create_private_dir, remove_path},
    send_log::SendLog,
    stores::{RoleStore, SharedStore, StoreProvider, StoreRegistry},
};

/// Per-role view of the account's protocol state.
///
/// A snapshot of the role's identity plus shared handles on its stores.
#[derive(Clone)]
pub struct RoleStores {
    /// Role this view belongs to
    pub role: IdentityRole,
    /// Own service id in this role, if known
    pub service_id: Option<ServiceId>,
    /// Own identity key pair in this role
    pub identity_key_pair: Option<IdentityKeyPair>,
    /// Local registration id of this role
    pub registration_id: u32,
    /// Whether other devices of the account exist
    pub multi_device: bool,
    /// Pre-key, signed pre-key, kyber pre-key and session stores
    pub protocol: Arc<dyn RoleStore>,
    /// Stores shared by both roles
    pub shared: Arc<dyn SharedStore>,
}

impl std::fmt::Debug for RoleStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleStores")
            .field("role", &self.role)
            .field("service_id", &self.service_id)
            .field("registration_id", &self.registration_id)
            .field("multi_device", &self.multi_device)
            .finish_non_exhaustive()
    }
}

/// A loaded, exclusively locked account.
#[derive(Debug)]
pub struct Account {
    paths: AccountPaths,
    settings: Settings,
    previous_storage_version: i64,
    file: Mutex<DescriptorFile>,
    state: Mutex<AccountState>,
    stores: StoreRegistry,
}

impl Account {
    fn new(
        paths: AccountPaths,
        settings: Settings,
        previous_storage_version: i64,
        file: DescriptorFile,
        state: AccountState,
    ) -> Self {
        let stores = StoreRegistry::new(paths.clone(), settings);
        Self {
            paths,
            settings,
            previous_storage_version,
            file: Mutex::new(file),
            state: Mutex::new(state),
            stores,
        }
    }

    /// Whether a descriptor exists for `account_id` under `data_dir`.
    pub fn exists(data_dir: impl AsRef<Path>, account_id: &str) -> bool {
        AccountPaths::new(data_dir, account_id).descriptor_file().is_file()
    }

    /// Open, lock, decode and migrate the account `account_id`.
    ///
    /// With `wait_for_lock` the call blocks while another instance holds
    /// the account; without it contention fails immediately. Nothing is
    /// written unless migration changed something. A failed save of the
    /// migrated descriptor is logged and the account still loads.
    ///
    /// # Errors
    ///
    /// - `AccountError::NotFound` if no descriptor exists
    /// - `AccountError::Locked` on contention without `wait_for_lock`
    /// - `AccountError::UnsupportedVersion` and `AccountError::Malformed`
    ///   if the descriptor cannot be read
    ///
    /// On any error the file lock is released before returning.
    pub fn load(
        data_dir: impl AsRef<Path>,
        account_id: &str,
        wait_for_lock: bool,
        settings: Settings,
    ) -> Result<Self, AccountError> {
        let paths = AccountPaths::new(data_dir, account_id);
        let mut file = DescriptorFile::open(&paths.descriptor_file(), wait_for_lock)?;
        let bytes = file.read_all()?;
        let decoded = descriptor::decode(&bytes, &mut OsRng)?;
        let previous_version = decoded.previous_version;

        let mut state = decoded.state;
        let stores = StoreRegistry::new(paths.clone(), settings);
        let outcome =
            migration::run(&paths, previous_version, &decoded.document, &mut state, &stores)?;

        let account = Self {
            paths,
            settings,
            previous_storage_version: previous_version,
            file: Mutex::new(file),
            state: Mutex::new(state),
            stores,
        };

        if outcome.changed {
            account.commit_migration(&outcome);
        }

        account.apply_config_fixups()?;
        info!(account = %account.paths.descriptor_file().display(), "loaded account");
        Ok(account)
    }

    /// Create a primary account that is about to register.
    ///
    /// An existing descriptor for `account_id` is taken over (waiting for
    /// its lock) and overwritten.
    ///
    /// # Errors
    ///
    /// Filesystem and store errors.
    pub fn create(
        data_dir: impl AsRef<Path>,
        account_id: &str,
        account: NewAccount,
        settings: Settings,
    ) -> Result<Self, AccountError> {
        let paths = AccountPaths::new(data_dir, account_id);
        create_private_dir(paths.data_dir())?;
        let descriptor_file = paths.descriptor_file();
        let file = match DescriptorFile::create(&descriptor_file) {
            Err(AccountError::AlreadyExists { .. }) => DescriptorFile::open(&descriptor_file, true)?,
            other => other?,
        };

        let mut state = AccountState::new(account.number, account.service_environment, &mut OsRng);
        state.profile_key = Some(account.profile_key);
        state.aci_data.identity_key_pair = Some(account.aci_identity_key_pair);
        state.pni_data.identity_key_pair = Some(account.pni_identity_key_pair);
        state.aci_data.registration_id = account.registration_id;
        state.pni_data.registration_id = account.pni_registration_id;

        let account = Self::new(paths, settings, CURRENT_STORAGE_VERSION, file, state);
        account.apply_config_fixups()?;
        account.save();
        info!(account = %account.paths.descriptor_file().display(), "created account");
        Ok(account)
    }

    /// Create a fresh linked-device account, or re-link an existing one.
    ///
    /// Re-linking keeps the stores but invalidates all session, sender-key
    /// and pre-key state, since the provisioning primary may have rotated
    /// identities.
    ///
    /// # Errors
    ///
    /// Filesystem and store errors.
    pub fn create_or_update_linked_account(
        data_dir: impl AsRef<Path>,
        account_id: &str,
        device: LinkedDevice,
        settings: Settings,
    ) -> Result<Self, AccountError> {
        let data_dir = data_dir.as_ref();
        if !Self::exists(data_dir, account_id) {
            return Self::create_linked_account(data_dir, account_id, device, settings);
        }

        let account = Self::load(data_dir, account_id, true, settings)?;
        account.set_provisioning_data(device.provisioning)?;
        account.resolve_self_trusted()?;
        for role in IdentityRole::ALL {
            account.stores.role(role)?.archive_all_sessions()?;
        }
        account.stores.shared()?.delete_all_sender_keys()?;
        for role in IdentityRole::ALL {
            account.clear_all_pre_keys(role)?;
        }
        info!(account = %account.paths.descriptor_file().display(), "relinked account");
        Ok(account)
    }

    fn create_linked_account(
        data_dir: &Path,
        account_id: &str,
        device: LinkedDevice,
        settings: Settings,
    ) -> Result<Self, AccountError> {
        let paths = AccountPaths::new(data_dir, account_id);
        create_private_dir(paths.data_dir())?;
        let file = DescriptorFile::create(&paths.descriptor_file())?;

        let mut state = AccountState::new(
            device.provisioning.number.clone(),
            device.service_environment,
            &mut OsRng,
        );
        state.aci_data.registration_id = device.registration_id;
        state.pni_data.registration_id = device.pni_registration_id;

        let account = Self::new(paths, settings, CURRENT_STORAGE_VERSION, file, state);
        account.set_provisioning_data(device.provisioning)?;
        account.resolve_self_trusted()?;
        account.apply_config_fixups()?;
        for role in IdentityRole::ALL {
            account.clear_all_pre_keys(role)?;
        }
        info!(account = %account.paths.descriptor_file().display(), "created linked account");
        Ok(account)
    }

    /// Save a migrated descriptor, then remove the legacy artifacts it
    /// absorbed. Artifacts stay on disk if the save fails, so the next load
    /// migrates them again.
    fn commit_migration(&self, outcome: &MigrationOutcome) {
        let saved = self.persist(&self.lock_state());
        if !saved {
            warn!(
                account = %self.paths.descriptor_file().display(),
                "keeping legacy artifacts until the migrated account is saved"
            );
            return;
        }
        for path in &outcome.consumed {
            if let Err(err) = remove_path(path) {
                warn!(path = %path.display(), %err, "failed to remove migrated legacy artifact");
            }
        }
        info!(
            account = %self.paths.descriptor_file().display(),
            from = self.previous_storage_version,
            to = CURRENT_STORAGE_VERSION,
            "migrated account"
        );
    }

    /// Fill in configuration an older release may have left out.
    fn apply_config_fixups(&self) -> Result<(), AccountError> {
        {
            let mut state = self.lock_state();
            let mut changed = false;
            if state.password.is_none() {
                debug!("generating missing account password");
                state.password = Some(generate_password(&mut OsRng));
                changed = true;
            }
            if state.profile_key.is_none() {
                debug!("generating missing profile key");
                state.profile_key = Some(ProfileKey::generate(&mut OsRng));
                changed = true;
            }
            if state.is_primary_device() && state.pni_data.identity_key_pair.is_none() {
                debug!("generating missing pni identity");
                state.pni_data.identity_key_pair = Some(IdentityKeyPair::generate(&mut OsRng));
                changed = true;
            }
            if changed {
                self.persist(&state);
            }
        }
        self.store_self_profile_key()
    }

    /// Release the file lock and every open store. Idempotent.
    pub fn close(&mut self) {
        self.stores.close();
        let file = self.file.get_mut().unwrap_or_else(PoisonError::into_inner);
        if file.is_open() {
            file.close();
            info!(account = %self.paths.descriptor_file().display(), "closed account");
        }
    }

    /// Close the account and remove every file belonging to it.
    ///
    /// # Errors
    ///
    /// Filesystem errors. The account is closed either way.
    pub fn delete_account_data(mut self) -> Result<(), AccountError> {
        self.close();
        remove_path(&self.paths.account_dir())?;
        remove_path(&self.paths.descriptor_file())?;
        info!(account = %self.paths.descriptor_file().display(), "deleted account data");
        Ok(())
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, AccountState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encode `state` and overwrite the descriptor file with it.
    fn write_descriptor(&self, state: &AccountState) -> Result<(), AccountError> {
        let bytes = state.encode().map_err(std::io::Error::other)?;
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.overwrite(&bytes)?;
        Ok(())
    }

    /// Persist `state`, logging instead of propagating failures. The file
    /// keeps its previous content when encoding fails. Returns whether the
    /// write went through.
    pub(crate) fn persist(&self, state: &AccountState) -> bool {
        match self.write_descriptor(state) {
            Ok(()) => true,
            Err(err) => {
                error!(account = %self.paths.descriptor_file().display(), %err, "failed to save account");
                false
            },
        }
    }

    /// Persist the current descriptor.
    pub fn save(&self) {
        let state = self.lock_state();
        self.persist(&state);
    }

    /// Apply `f` to the descriptor and persist it.
    fn update(&self, f: impl FnOnce(&mut AccountState)) {
        let mut state = self.lock_state();
        f(&mut state);
        self.persist(&state);
    }

    /// Paths of this account's files.
    pub fn paths(&self) -> &AccountPaths {
        &self.paths
    }

    /// Settings the account was opened with.
    pub fn settings(&self) -> Settings {
        self.settings
    }

    /// Storage version the descriptor had before this load.
    pub fn previous_storage_version(&self) -> i64 {
        self.previous_storage_version
    }

    /// Copy of the whole decoded descriptor.
    pub fn snapshot(&self) -> AccountState {
        self.lock_state().clone()
    }

    /// Phone number.
    pub fn number(&self) -> String {
        self.lock_state().number.clone()
    }

    /// Service environment the account is registered in.
    pub fn service_environment(&self) -> Option<ServiceEnvironment> {
        self.lock_state().service_environment
    }

    /// Account identifier.
    pub fn aci(&self) -> Option<Uuid> {
        self.lock_state().aci
    }

    /// Phone number identifier.
    pub fn pni(&self) -> Option<Uuid> {
        self.lock_state().pni
    }

    /// Own service id in `role`.
    pub fn service_id(&self, role: IdentityRole) -> Option<ServiceId> {
        self.lock_state().service_uuid(role).map(|uuid| ServiceId::new(role, uuid))
    }

    /// Role that `service_id` belongs to.
    ///
    /// # Errors
    ///
    /// `AccountError::NoMatchingRole` if it is neither the ACI nor the PNI.
    pub fn role_of(&self, service_id: ServiceId) -> Result<IdentityRole, AccountError> {
        let state = self.lock_state();
        IdentityRole::ALL
            .into_iter()
            .find(|&role| {
                state.service_uuid(role).map(|uuid| ServiceId::new(role, uuid)) == Some(service_id)
            })
            .ok_or(AccountError::NoMatchingRole(service_id))
    }

    /// Username, if one is reserved.
    pub fn username(&self) -> Option<String> {
        self.lock_state().username.clone()
    }

    /// Device id of this installation.
    pub fn device_id(&self) -> u32 {
        self.lock_state().device_id
    }

    /// Whether this installation is the primary device.
    pub fn is_primary_device(&self) -> bool {
        self.lock_state().is_primary_device()
    }

    /// Whether registration or linking completed.
    pub fn is_registered(&self) -> bool {
        self.lock_state().registered
    }

    /// Whether other devices of the account exist.
    pub fn is_multi_device(&self) -> bool {
        self.lock_state().multi_device
    }

    /// Time of the last received message.
    pub fn last_receive_timestamp(&self) -> u64 {
        self.lock_state().last_receive_timestamp
    }

    /// Service password.
    pub fn password(&self) -> Option<String> {
        self.lock_state().password.clone()
    }

    /// Own profile key.
    pub fn profile_key(&self) -> Option<ProfileKey> {
        self.lock_state().profile_key
    }

    /// Encrypted device name.
    pub fn encrypted_device_name(&self) -> Option<String> {
        self.lock_state().encrypted_device_name.clone()
    }

    /// Registration lock pin.
    pub fn registration_lock_pin(&self) -> Option<String> {
        self.lock_state().registration_lock_pin.clone()
    }

    /// Identity key pair of `role`.
    pub fn identity_key_pair(&self, role: IdentityRole) -> Option<IdentityKeyPair> {
        self.lock_state().role(role).identity_key_pair.clone()
    }

    /// Registration id of `role`.
    pub fn registration_id(&self, role: IdentityRole) -> u32 {
        self.lock_state().role(role).registration_id
    }

    /// Pre-key allocator state of `role`.
    pub fn pre_key_metadata(&self, role: IdentityRole) -> PreKeyMetadata {
        self.lock_state().role(role).pre_key_metadata
    }

    /// Registration session, if it was started for `number`.
    pub fn session_id(&self, number: &str) -> Option<String> {
        let state = self.lock_state();
        state.session_id.clone().filter(|_| state.session_number.as_deref() == Some(number))
    }

    /// Account configuration.
    pub fn configuration(&self) -> ConfigurationStore {
        self.lock_state().configuration.clone()
    }

    /// Change the phone number.
    pub fn set_number(&self, number: impl Into<String>) {
        let number = number.into();
        self.update(|state| state.number = number);
    }

    /// Change the service environment.
    pub fn set_service_environment(&self, environment: ServiceEnvironment) {
        self.update(|state| state.service_environment = Some(environment));
    }

    /// Set the account identifier.
    pub fn set_aci(&self, aci: Uuid) {
        self.update(|state| state.aci = Some(aci));
    }

    /// Set or clear the username.
    pub fn set_username(&self, username: Option<String>) {
        self.update(|state| state.username = username);
    }

    /// Mark registration as completed or lost.
    ///
    /// # Errors
    ///
    /// `AccountError::MissingIdentity` when marking an account registered
    /// that has no ACI. Nothing is written in that case.
    pub fn set_registered(&self, registered: bool) -> Result<(), AccountError> {
        let mut state = self.lock_state();
        if registered && state.aci.is_none() {
            return Err(AccountError::MissingIdentity(IdentityRole::Aci));
        }
        state.registered = registered;
        self.persist(&state);
        Ok(())
    }

    /// Record whether other devices of the account exist.
    pub fn set_multi_device(&self, multi_device: bool) {
        let mut state = self.lock_state();
        if state.multi_device == multi_device {
            return;
        }
        state.multi_device = multi_device;
        self.persist(&state);
    }

    /// Record the time of the last received message.
    pub fn set_last_receive_timestamp(&self, timestamp: u64) {
        self.update(|state| state.last_receive_timestamp = timestamp);
    }

    /// Set or clear the encrypted device name.
    pub fn set_encrypted_device_name(&self, name: Option<String>) {
        self.update(|state| state.encrypted_device_name = name);
    }

    /// Remember the registration session for `number`.
    pub fn set_session(&self, number: impl Into<String>, session_id: impl Into<String>) {
        let (number, session_id) = (number.into(), session_id.into());
        self.update(|state| {
            state.session_number = Some(number);
            state.session_id = Some(session_id);
        });
    }

    /// Set or clear the registration lock pin.
    pub fn set_registration_lock(&self, pin: Option<String>) {
        self.update(|state| state.registration_lock_pin = pin);
    }

    /// Set the registration id of `role`.
    pub fn set_registration_id(&self, role: IdentityRole, registration_id: u32) {
        self.update(|state| state.role_mut(role).registration_id = registration_id);
    }

    /// Set the identity key pair of `role`.
    pub fn set_identity_key_pair(&self, role: IdentityRole, key_pair: IdentityKeyPair) {
        self.update(|state| state.role_mut(role).identity_key_pair = Some(key_pair));
    }

    /// Modify the account configuration.
    pub fn update_configuration(&self, f: impl FnOnce(&mut ConfigurationStore)) {
        self.update(|state| f(&mut state.configuration));
    }

    /// Replace the own profile key and publish it to the profile store.
    ///
    /// # Errors
    ///
    /// Store errors while recording the key for the own recipient.
    pub fn set_profile_key(&self, key: ProfileKey) -> Result<(), AccountError> {
        {
            let mut state = self.lock_state();
            if state.profile_key == Some(key) {
                return Ok(());
            }
            state.profile_key = Some(key);
            self.persist(&state);
        }
        self.store_self_profile_key()
    }

    /// Own address with every known identifier.
    pub fn self_address(&self) -> RecipientAddress {
        let state = self.lock_state();
        RecipientAddress {
            aci: state.aci,
            pni: state.pni,
            number: Some(state.number.clone()),
            username: state.username.clone(),
        }
    }

    /// Recipient id of the account itself.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub fn self_recipient_id(&self) -> Result<RecipientId, AccountError> {
        Ok(self.stores.shared()?.resolve(&self.self_address())?)
    }

    fn resolve_self_trusted(&self) -> Result<RecipientId, AccountError> {
        Ok(self.stores.shared()?.resolve_trusted(&self.self_address())?)
    }

    fn store_self_profile_key(&self) -> Result<(), AccountError> {
        let Some(key) = self.profile_key() else { return Ok(()) };
        let id = self.self_recipient_id()?;
        let shared = self.stores.shared()?;
        if shared.profile_key(id)? != Some(key) {
            shared.store_profile_key(id, key)?;
        }
        Ok(())
    }

    /// Forget a recipient and everything stored about it.
    ///
    /// # Errors
    ///
    /// Store and filesystem errors.
    pub fn remove_recipient(&self, recipient: RecipientId) -> Result<(), AccountError> {
        let shared = self.stores.shared()?;
        let address = shared.address(recipient)?;
        shared.remove(recipient)?;
        self.stores.message_cache().delete_messages(recipient)?;
        self.stores.send_log()?.delete_all_for(recipient)?;

        if let Some(service_id) = address.and_then(|address| address.service_id()) {
            for role in IdentityRole::ALL {
                self.stores.role(role)?.delete_all_sessions(recipient)?;
            }
            shared.delete_identity(service_id)?;
            shared.delete_sender_keys(recipient)?;
        }
        debug!(recipient = recipient.0, "removed recipient");
        Ok(())
    }

    /// Stores shared by both roles.
    ///
    /// # Errors
    ///
    /// `StoreError` if the database cannot be opened.
    pub fn shared_store(&self) -> Result<Arc<dyn SharedStore>, StoreError> {
        self.stores.shared()
    }

    /// Identity and protocol stores of `role`.
    ///
    /// # Errors
    ///
    /// `StoreError` if the database cannot be opened.
    pub fn protocol_store(&self, role: IdentityRole) -> Result<RoleStores, StoreError> {
        let protocol = self.stores.role(role)?;
        let shared = self.stores.shared()?;
        let state = self.lock_state();
        let data = state.role(role);
        Ok(RoleStores {
            role,
            service_id: state.service_uuid(role).map(|uuid| ServiceId::new(role, uuid)),
            identity_key_pair: data.identity_key_pair.clone(),
            registration_id: data.registration_id,
            multi_device: state.multi_device,
            protocol,
            shared,
        })
    }

    /// Cache of envelopes that could not be processed yet.
    pub fn message_cache(&self) -> &MessageCache {
        self.stores.message_cache()
    }

    /// Log of sent content for resend requests.
    ///
    /// # Errors
    ///
    /// `StoreError` if the database cannot be opened.
    pub fn send_log(&self) -> Result<&SendLog, StoreError> {
        self.stores.send_log()
    }
}

impl Drop for Account {
    fn drop(&mut self) {
        self.close();
    }
}
