//! Redb-backed sub-stores.
//!
//! One database file per account holds every durable sub-store. Redb gives
//! ACID transactions with copy-on-write, so a crash never leaves a torn
//! record. All tables map byte keys to byte values; keys are big-endian
//! encodings so that prefix scans follow numeric order, values are CBOR.

mod groups;
mod identities;
mod protocol;
mod recipients;
mod sender_keys;

use std::{
    fmt,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};

use keystead_core::{IdentityRole, StoreError, settings::TrustNewIdentity};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};

type RawTable = TableDefinition<'static, &'static [u8], &'static [u8]>;

/// Table: pre_keys
/// Key: role tag (1) + pre-key id (4 BE)
/// Value: CBOR `PreKeyRecord`
const PRE_KEYS: RawTable = TableDefinition::new("pre_keys");

/// Table: signed_pre_keys
/// Key: role tag (1) + signed pre-key id (4 BE)
/// Value: CBOR `SignedPreKeyRecord`
const SIGNED_PRE_KEYS: RawTable = TableDefinition::new("signed_pre_keys");

/// Table: kyber_pre_keys
/// Key: role tag (1) + kyber pre-key id (4 BE)
/// Value: CBOR record plus last-resort flag
const KYBER_PRE_KEYS: RawTable = TableDefinition::new("kyber_pre_keys");

/// Table: sessions
/// Key: role tag (1) + recipient id (8 BE) + device id (4 BE)
/// Value: CBOR `SessionRecord`
const SESSIONS: RawTable = TableDefinition::new("sessions");

/// Table: identities
/// Key: service id (17, see `ServiceId::to_key_bytes`)
/// Value: CBOR `IdentityInfo`
const IDENTITIES: RawTable = TableDefinition::new("identities");

/// Table: sender_keys
/// Key: recipient id (8 BE) + device id (4 BE) + distribution id (16)
/// Value: CBOR `SenderKeyRecord`
const SENDER_KEYS: RawTable = TableDefinition::new("sender_keys");

/// Table: sender_keys_shared
/// Key: distribution id (16) + recipient id (8 BE) + device id (4 BE)
/// Value: empty
const SENDER_KEYS_SHARED: RawTable = TableDefinition::new("sender_keys_shared");

/// Table: recipients
/// Key: recipient id (8 BE)
/// Value: CBOR `RecipientEntry` (address, contact, profile, profile key)
const RECIPIENTS: RawTable = TableDefinition::new("recipients");

/// Table: meta
/// Key: ASCII name
/// Value: name-specific
const META: RawTable = TableDefinition::new("meta");

/// Table: groups
/// Key: raw group id
/// Value: CBOR `GroupInfo`
const GROUPS: RawTable = TableDefinition::new("groups");

/// Table: sticker_packs
/// Key: raw pack id
/// Value: CBOR `StickerPack`
const STICKER_PACKS: RawTable = TableDefinition::new("sticker_packs");

/// Table: send_log
/// Key: timestamp (8 BE) + recipient id (8 BE) + device id (4 BE)
/// Value: raw message content
pub(crate) const SEND_LOG: RawTable = TableDefinition::new("send_log");

const ALL_TABLES: [RawTable; 12] = [
    PRE_KEYS,
    SIGNED_PRE_KEYS,
    KYBER_PRE_KEYS,
    SESSIONS,
    IDENTITIES,
    SENDER_KEYS,
    SENDER_KEYS_SHARED,
    RECIPIENTS,
    META,
    GROUPS,
    STICKER_PACKS,
    SEND_LOG,
];

pub(crate) fn io_err(err: impl fmt::Display) -> StoreError {
    StoreError::Io(err.to_string())
}

/// Durable account database.
///
/// Implements every shared sub-store trait directly; role-scoped traits
/// are implemented by [`RoleDatabase`]. Thread-safe through redb's internal
/// locking. Clone is cheap (Arc).
///
/// Every clone shares one file handle. [`Self::close`] releases it for all
/// of them; later calls on any clone fail with `StoreError::Closed`.
#[derive(Clone)]
pub struct AccountDatabase {
    db: Arc<RwLock<Option<Database>>>,
    trust_policy: TrustNewIdentity,
}

impl fmt::Debug for AccountDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountDatabase").field("trust_policy", &self.trust_policy).finish()
    }
}

impl AccountDatabase {
    /// Open or create the database at `path`, creating every table.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>, trust_policy: TrustNewIdentity) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;

        let txn = db.begin_write().map_err(io_err)?;
        for table in ALL_TABLES {
            let _ = txn.open_table(table).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;

        Ok(Self { db: Arc::new(RwLock::new(Some(db))), trust_policy })
    }

    /// Release the database file. Idempotent.
    ///
    /// Transactions already begun run to completion; nothing new starts.
    pub fn close(&self) -> bool {
        self.db.write().unwrap_or_else(PoisonError::into_inner).take().is_some()
    }

    /// Whether [`Self::close`] has run on any clone.
    pub fn is_closed(&self) -> bool {
        self.db.read().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    fn begin_read(&self) -> Result<ReadTransaction, StoreError> {
        let guard = self.db.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().ok_or(StoreError::Closed)?.begin_read().map_err(io_err)
    }

    fn begin_write(&self) -> Result<WriteTransaction, StoreError> {
        let guard = self.db.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().ok_or(StoreError::Closed)?.begin_write().map_err(io_err)
    }

    /// Handle implementing the role-scoped store traits for `role`.
    pub fn role(&self, role: IdentityRole) -> RoleDatabase {
        RoleDatabase { db: self.clone(), role }
    }

    /// Run `f` in one write transaction, committing if it succeeds.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let txn = self.begin_write()?;
        let out = f(&txn)?;
        txn.commit().map_err(io_err)?;
        Ok(out)
    }

    pub(crate) fn put(&self, table: RawTable, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write(|txn| {
            let mut table = txn.open_table(table).map_err(io_err)?;
            table.insert(key, value).map_err(io_err)?;
            Ok(())
        })
    }

    pub(crate) fn get(&self, table: RawTable, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.begin_read()?;
        let table = txn.open_table(table).map_err(io_err)?;
        Ok(table.get(key).map_err(io_err)?.map(|value| value.value().to_vec()))
    }

    pub(crate) fn delete(&self, table: RawTable, key: &[u8]) -> Result<(), StoreError> {
        self.write(|txn| {
            let mut table = txn.open_table(table).map_err(io_err)?;
            table.remove(key).map_err(io_err)?;
            Ok(())
        })
    }

    /// Every entry whose key starts with `prefix`, in key order.
    pub(crate) fn scan(
        &self,
        table: RawTable,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let txn = self.begin_read()?;
        let table = txn.open_table(table).map_err(io_err)?;
        scan_prefix(&table, prefix)
    }

    /// Delete every entry whose key starts with `prefix`.
    pub(crate) fn delete_prefix(&self, table: RawTable, prefix: &[u8]) -> Result<usize, StoreError> {
        self.write(|txn| {
            let mut table = txn.open_table(table).map_err(io_err)?;
            delete_prefix_in(&mut table, prefix)
        })
    }
}

/// Collect every entry whose key starts with `prefix`.
pub(crate) fn scan_prefix<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    prefix: &[u8],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
    let mut out = Vec::new();
    for result in table.range(prefix..).map_err(io_err)? {
        let (key, value) = result.map_err(io_err)?;
        if !key.value().starts_with(prefix) {
            break;
        }
        out.push((key.value().to_vec(), value.value().to_vec()));
    }
    Ok(out)
}

pub(crate) fn delete_prefix_in(
    table: &mut redb::Table<'_, &'static [u8], &'static [u8]>,
    prefix: &[u8],
) -> Result<usize, StoreError> {
    let keys: Vec<Vec<u8>> = scan_prefix(&*table, prefix)?.into_iter().map(|(k, _)| k).collect();
    for key in &keys {
        table.remove(key.as_slice()).map_err(io_err)?;
    }
    Ok(keys.len())
}

/// Role-scoped view of an [`AccountDatabase`].
#[derive(Debug, Clone)]
pub struct RoleDatabase {
    db: AccountDatabase,
    role: IdentityRole,
}

/// Encode (role, id) as a 5-byte key.
fn encode_role_id_key(role: IdentityRole, id: u32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = role.tag();
    key[1..].copy_from_slice(&id.to_be_bytes());
    key
}

/// Read a big-endian integer at `offset`. `None` if the key is too short.
fn be_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    bytes.get(offset..offset + 4)?.try_into().ok().map(u32::from_be_bytes)
}

fn be_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    bytes.get(offset..offset + 8)?.try_into().ok().map(u64::from_be_bytes)
}

fn corrupt_key(table: &str) -> StoreError {
    StoreError::InvalidRecord(format!("malformed key in {table}"))
}
