//! Lazily opened sub-stores of one account.
//!
//! Nothing is opened until first use. The database handle is shared by
//! every durable sub-store; role handles, the message cache and the send
//! log are each built once on top of it.

use std::sync::Arc;

use keystead_core::{
    ContactStore, GroupStore, IdentityRole, IdentityStore, KyberPreKeyStore, MemoryStore,
    PreKeyStore, ProfileStore, RecipientStore, SenderKeyStore, SessionStore, Settings,
    SignedPreKeyStore, StickerStore, StoreError,
};
use tracing::debug;

use crate::{
    database::{AccountDatabase, RoleDatabase},
    lazy::LazyCell,
    message_cache::MessageCache,
    paths::AccountPaths,
    send_log::SendLog,
};

/// Every role-scoped capability of one identity role.
pub trait RoleStore: PreKeyStore + SignedPreKeyStore + KyberPreKeyStore + SessionStore {}

impl<T> RoleStore for T where T: PreKeyStore + SignedPreKeyStore + KyberPreKeyStore + SessionStore {}

/// Every capability shared by both roles.
pub trait SharedStore:
    RecipientStore
    + ContactStore
    + ProfileStore
    + IdentityStore
    + SenderKeyStore
    + GroupStore
    + StickerStore
{
}

impl<T> SharedStore for T where
    T: RecipientStore
        + ContactStore
        + ProfileStore
        + IdentityStore
        + SenderKeyStore
        + GroupStore
        + StickerStore
{
}

/// Source of sub-store handles.
///
/// The account and the migration pipeline only reach stores through this
/// trait, so tests can run either against [`MemoryStore`].
pub trait StoreProvider: Send + Sync {
    /// Stores shared by both roles.
    fn shared(&self) -> Result<Arc<dyn SharedStore>, StoreError>;

    /// Stores scoped to `role`.
    fn role(&self, role: IdentityRole) -> Result<Arc<dyn RoleStore>, StoreError>;
}

impl StoreProvider for MemoryStore {
    fn shared(&self) -> Result<Arc<dyn SharedStore>, StoreError> {
        Ok(Arc::new(self.clone()))
    }

    fn role(&self, role: IdentityRole) -> Result<Arc<dyn RoleStore>, StoreError> {
        Ok(Arc::new(MemoryStore::role(self, role)))
    }
}

/// Lazily constructed sub-stores of one account.
///
/// Each handle has its own cell, so constructing one handle may construct
/// another (a role store opening the database) without deadlocking.
#[derive(Debug)]
pub struct StoreRegistry {
    paths: AccountPaths,
    settings: Settings,
    database: LazyCell<Arc<AccountDatabase>>,
    aci: LazyCell<Arc<RoleDatabase>>,
    pni: LazyCell<Arc<RoleDatabase>>,
    message_cache: LazyCell<MessageCache>,
    send_log: LazyCell<SendLog>,
}

impl StoreRegistry {
    /// Registry for the account at `paths`. Opens nothing.
    pub fn new(paths: AccountPaths, settings: Settings) -> Self {
        Self {
            paths,
            settings,
            database: LazyCell::new(),
            aci: LazyCell::new(),
            pni: LazyCell::new(),
            message_cache: LazyCell::new(),
            send_log: LazyCell::new(),
        }
    }

    /// The account database, opened on first use.
    ///
    /// # Errors
    ///
    /// `StoreError::Io` if the account directory or the database cannot be
    /// created.
    pub fn database(&self) -> Result<&Arc<AccountDatabase>, StoreError> {
        self.database.get_or_try_init(|| {
            self.paths.ensure_account_dir().map_err(|e| StoreError::Io(e.to_string()))?;
            let path = self.paths.database_file();
            debug!(path = %path.display(), "opening account database");
            AccountDatabase::open(&path, self.settings.trust_new_identity).map(Arc::new)
        })
    }

    /// Role-scoped handle on the database.
    pub fn role_database(&self, role: IdentityRole) -> Result<&Arc<RoleDatabase>, StoreError> {
        let cell = match role {
            IdentityRole::Aci => &self.aci,
            IdentityRole::Pni => &self.pni,
        };
        cell.get_or_try_init(|| {
            let db = self.database()?;
            debug!(%role, "creating role store");
            Ok(Arc::new(db.role(role)))
        })
    }

    /// Cache of undecrypted envelopes.
    pub fn message_cache(&self) -> &MessageCache {
        self.message_cache.get_or_init(|| {
            debug!("creating message cache");
            MessageCache::new(self.paths.message_cache_dir())
        })
    }

    /// Send log, disabled when the settings say so.
    pub fn send_log(&self) -> Result<&SendLog, StoreError> {
        self.send_log.get_or_try_init(|| {
            if self.settings.disable_message_send_log {
                debug!("send log disabled");
                return Ok(SendLog::disabled());
            }
            debug!("creating send log");
            Ok(SendLog::new(AccountDatabase::clone(self.database()?)))
        })
    }

    /// Close the database file and drop every handle. Handles handed out
    /// earlier fail with `StoreError::Closed` from now on.
    pub fn close(&mut self) {
        let had_database = self.database.take().is_some_and(|db| db.close());
        self.aci.take();
        self.pni.take();
        self.message_cache.take();
        self.send_log.take();
        if had_database {
            debug!("closed account database");
        }
    }
}

impl StoreProvider for StoreRegistry {
    fn shared(&self) -> Result<Arc<dyn SharedStore>, StoreError> {
        let db: Arc<dyn SharedStore> = Arc::clone(self.database()?) as Arc<dyn SharedStore>;
        Ok(db)
    }

    fn role(&self, role: IdentityRole) -> Result<Arc<dyn RoleStore>, StoreError> {
        let store: Arc<dyn RoleStore> = Arc::clone(self.role_database(role)?) as Arc<dyn RoleStore>;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use keystead_core::{PreKeyRecord, RecipientAddress};
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn nothing_is_opened_until_first_use() {
        let dir = tempdir().unwrap();
        let paths = AccountPaths::new(dir.path(), "+1");
        let registry = StoreRegistry::new(paths.clone(), Settings::default());

        assert!(!paths.account_dir().exists());
        registry.role(IdentityRole::Pni).unwrap();
        assert!(paths.database_file().exists());
    }

    #[test]
    fn role_handles_share_one_database() {
        let dir = tempdir().unwrap();
        let registry = StoreRegistry::new(AccountPaths::new(dir.path(), "+1"), Settings::default());
        let record = PreKeyRecord { id: 3, key_pair: vec![1] };

        registry.role(IdentityRole::Aci).unwrap().store_pre_key(&record).unwrap();
        let id = registry.shared().unwrap().resolve(&RecipientAddress::from_number("+2")).unwrap();

        assert_eq!(registry.role(IdentityRole::Aci).unwrap().pre_key_ids().unwrap(), vec![3]);
        assert!(registry.role(IdentityRole::Pni).unwrap().pre_key_ids().unwrap().is_empty());
        assert_eq!(registry.shared().unwrap().find(&RecipientAddress::from_number("+2")).unwrap(), Some(id));
    }

    #[test]
    fn send_log_follows_settings() {
        let dir = tempdir().unwrap();
        let settings = Settings { disable_message_send_log: true, ..Settings::default() };
        let registry = StoreRegistry::new(AccountPaths::new(dir.path(), "+1"), settings);

        assert!(!registry.send_log().unwrap().is_enabled());
        assert!(registry.database.get().is_none());
    }

    #[test]
    fn close_drops_handles() {
        let dir = tempdir().unwrap();
        let mut registry =
            StoreRegistry::new(AccountPaths::new(dir.path(), "+1"), Settings::default());
        registry.send_log().unwrap();
        registry.close();

        assert!(registry.database.get().is_none());
        assert!(registry.send_log.get().is_none());
    }

    #[test]
    fn close_invalidates_handles_taken_earlier() {
        let dir = tempdir().unwrap();
        let paths = AccountPaths::new(dir.path(), "+1");
        let mut registry = StoreRegistry::new(paths.clone(), Settings::default());
        let shared = registry.shared().unwrap();
        let role = registry.role(IdentityRole::Aci).unwrap();

        registry.close();

        assert_eq!(shared.find(&RecipientAddress::from_number("+2")), Err(StoreError::Closed));
        assert_eq!(role.pre_key_ids(), Err(StoreError::Closed));
        let reopened = StoreRegistry::new(paths, Settings::default());
        assert!(reopened.role(IdentityRole::Aci).unwrap().pre_key_ids().unwrap().is_empty());
    }
}
