//! Role-scoped pre-key and session tables.

use keystead_core::{
    KyberPreKeyRecord, KyberPreKeyStore, PreKeyRecord, PreKeyStore, RecipientId, SessionRecord,
    SessionStore, SignedPreKeyRecord, SignedPreKeyStore, StoreError,
    records::{from_cbor, to_cbor},
};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use super::{
    KYBER_PRE_KEYS, PRE_KEYS, RawTable, RoleDatabase, SESSIONS, SIGNED_PRE_KEYS, be_u32,
    corrupt_key, encode_role_id_key, io_err, scan_prefix,
};

#[derive(Serialize, Deserialize)]
struct StoredKyberPreKey {
    record: KyberPreKeyRecord,
    last_resort: bool,
}

impl RoleDatabase {
    fn ids(&self, table: RawTable, name: &str) -> Result<Vec<u32>, StoreError> {
        self.db
            .scan(table, &[self.role.tag()])?
            .into_iter()
            .map(|(key, _)| be_u32(&key, 1).ok_or_else(|| corrupt_key(name)))
            .collect()
    }

    fn load<T: serde::de::DeserializeOwned>(
        &self,
        table: RawTable,
        id: u32,
    ) -> Result<Option<T>, StoreError> {
        self.db
            .get(table, &encode_role_id_key(self.role, id))?
            .map(|bytes| from_cbor(&bytes))
            .transpose()
    }

    fn session_prefix(&self, recipient: RecipientId) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[0] = self.role.tag();
        key[1..].copy_from_slice(&recipient.0.to_be_bytes());
        key
    }

    fn session_key(&self, recipient: RecipientId, device_id: u32) -> [u8; 13] {
        let mut key = [0u8; 13];
        key[..9].copy_from_slice(&self.session_prefix(recipient));
        key[9..].copy_from_slice(&device_id.to_be_bytes());
        key
    }
}

impl PreKeyStore for RoleDatabase {
    fn load_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, StoreError> {
        self.load(PRE_KEYS, id)
    }

    fn store_pre_key(&self, record: &PreKeyRecord) -> Result<(), StoreError> {
        self.db.put(PRE_KEYS, &encode_role_id_key(self.role, record.id), &record.serialize()?)
    }

    fn remove_pre_key(&self, id: u32) -> Result<(), StoreError> {
        self.db.delete(PRE_KEYS, &encode_role_id_key(self.role, id))
    }

    fn remove_all_pre_keys(&self) -> Result<(), StoreError> {
        self.db.delete_prefix(PRE_KEYS, &[self.role.tag()]).map(drop)
    }

    fn pre_key_ids(&self) -> Result<Vec<u32>, StoreError> {
        self.ids(PRE_KEYS, "pre_keys")
    }
}

impl SignedPreKeyStore for RoleDatabase {
    fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        self.load(SIGNED_PRE_KEYS, id)
    }

    fn store_signed_pre_key(&self, record: &SignedPreKeyRecord) -> Result<(), StoreError> {
        self.db.put(
            SIGNED_PRE_KEYS,
            &encode_role_id_key(self.role, record.id),
            &record.serialize()?,
        )
    }

    fn remove_signed_pre_key(&self, id: u32) -> Result<(), StoreError> {
        self.db.delete(SIGNED_PRE_KEYS, &encode_role_id_key(self.role, id))
    }

    fn remove_all_signed_pre_keys(&self) -> Result<(), StoreError> {
        self.db.delete_prefix(SIGNED_PRE_KEYS, &[self.role.tag()]).map(drop)
    }

    fn signed_pre_key_ids(&self) -> Result<Vec<u32>, StoreError> {
        self.ids(SIGNED_PRE_KEYS, "signed_pre_keys")
    }
}

impl KyberPreKeyStore for RoleDatabase {
    fn load_kyber_pre_key(&self, id: u32) -> Result<Option<KyberPreKeyRecord>, StoreError> {
        Ok(self.load::<StoredKyberPreKey>(KYBER_PRE_KEYS, id)?.map(|stored| stored.record))
    }

    fn store_kyber_pre_key(
        &self,
        record: &KyberPreKeyRecord,
        last_resort: bool,
    ) -> Result<(), StoreError> {
        let stored = StoredKyberPreKey { record: record.clone(), last_resort };
        self.db.put(KYBER_PRE_KEYS, &encode_role_id_key(self.role, record.id), &to_cbor(&stored)?)
    }

    fn mark_kyber_pre_key_used(&self, id: u32) -> Result<(), StoreError> {
        let key = encode_role_id_key(self.role, id);
        self.db.write(|txn| {
            let mut table = txn.open_table(KYBER_PRE_KEYS).map_err(io_err)?;
            let last_resort = match table.get(key.as_slice()).map_err(io_err)? {
                Some(value) => from_cbor::<StoredKyberPreKey>(value.value())?.last_resort,
                None => return Ok(()),
            };
            if !last_resort {
                table.remove(key.as_slice()).map_err(io_err)?;
            }
            Ok(())
        })
    }

    fn remove_all_kyber_pre_keys(&self) -> Result<(), StoreError> {
        self.db.delete_prefix(KYBER_PRE_KEYS, &[self.role.tag()]).map(drop)
    }

    fn kyber_pre_key_ids(&self) -> Result<Vec<u32>, StoreError> {
        self.ids(KYBER_PRE_KEYS, "kyber_pre_keys")
    }
}

impl SessionStore for RoleDatabase {
    fn load_session(
        &self,
        recipient: RecipientId,
        device_id: u32,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.db
            .get(SESSIONS, &self.session_key(recipient, device_id))?
            .map(|bytes| from_cbor(&bytes))
            .transpose()
    }

    fn store_session(
        &self,
        recipient: RecipientId,
        device_id: u32,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        self.db.put(SESSIONS, &self.session_key(recipient, device_id), &to_cbor(record)?)
    }

    fn session_device_ids(&self, recipient: RecipientId) -> Result<Vec<u32>, StoreError> {
        self.db
            .scan(SESSIONS, &self.session_prefix(recipient))?
            .into_iter()
            .map(|(key, _)| be_u32(&key, 9).ok_or_else(|| corrupt_key("sessions")))
            .collect()
    }

    fn delete_session(&self, recipient: RecipientId, device_id: u32) -> Result<(), StoreError> {
        self.db.delete(SESSIONS, &self.session_key(recipient, device_id))
    }

    fn delete_all_sessions(&self, recipient: RecipientId) -> Result<(), StoreError> {
        self.db.delete_prefix(SESSIONS, &self.session_prefix(recipient)).map(drop)
    }

    fn archive_all_sessions(&self) -> Result<(), StoreError> {
        let prefix = [self.role.tag()];
        self.db.write(|txn| {
            let mut table = txn.open_table(SESSIONS).map_err(io_err)?;
            for (key, value) in scan_prefix(&table, &prefix)? {
                let mut record: SessionRecord = from_cbor(&value)?;
                if record.archived {
                    continue;
                }
                record.archived = true;
                table.insert(key.as_slice(), to_cbor(&record)?.as_slice()).map_err(io_err)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use keystead_core::{IdentityRole, settings::TrustNewIdentity};
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::database::AccountDatabase;

    fn open() -> (TempDir, AccountDatabase) {
        let dir = tempdir().unwrap();
        let db =
            AccountDatabase::open(dir.path().join("account.db"), TrustNewIdentity::default()).unwrap();
        (dir, db)
    }

    fn kyber(id: u32) -> KyberPreKeyRecord {
        KyberPreKeyRecord { id, timestamp: 0, key_pair: vec![id as u8; 8], signature: vec![1; 4] }
    }

    #[test]
    fn test_roles_do_not_see_each_other() {
        let (_dir, db) = open();
        let aci = db.role(IdentityRole::Aci);
        let pni = db.role(IdentityRole::Pni);

        aci.store_pre_key(&PreKeyRecord { id: 7, key_pair: vec![1] }).unwrap();
        pni.store_pre_key(&PreKeyRecord { id: 7, key_pair: vec![2] }).unwrap();
        aci.remove_all_pre_keys().unwrap();

        assert!(aci.load_pre_key(7).unwrap().is_none());
        assert_eq!(pni.load_pre_key(7).unwrap().unwrap().key_pair, vec![2]);
        assert_eq!(pni.pre_key_ids().unwrap(), vec![7]);
    }

    #[test]
    fn test_last_resort_kyber_survives_use() {
        let (_dir, db) = open();
        let aci = db.role(IdentityRole::Aci);
        aci.store_kyber_pre_key(&kyber(1), false).unwrap();
        aci.store_kyber_pre_key(&kyber(2), true).unwrap();

        aci.mark_kyber_pre_key_used(1).unwrap();
        aci.mark_kyber_pre_key_used(2).unwrap();
        aci.mark_kyber_pre_key_used(99).unwrap();

        assert_eq!(aci.kyber_pre_key_ids().unwrap(), vec![2]);
        assert_eq!(aci.load_kyber_pre_key(2).unwrap(), Some(kyber(2)));
    }

    #[test]
    fn test_archive_marks_only_own_role() {
        let (_dir, db) = open();
        let aci = db.role(IdentityRole::Aci);
        let pni = db.role(IdentityRole::Pni);
        let bob = RecipientId(3);
        aci.store_session(bob, 1, &SessionRecord::new(vec![1])).unwrap();
        aci.store_session(bob, 2, &SessionRecord::new(vec![2])).unwrap();
        pni.store_session(bob, 1, &SessionRecord::new(vec![3])).unwrap();

        aci.archive_all_sessions().unwrap();

        assert!(aci.load_session(bob, 1).unwrap().unwrap().archived);
        assert!(aci.load_session(bob, 2).unwrap().unwrap().archived);
        assert!(!pni.load_session(bob, 1).unwrap().unwrap().archived);
        assert_eq!(aci.session_device_ids(bob).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_delete_sessions_of_one_recipient() {
        let (_dir, db) = open();
        let aci = db.role(IdentityRole::Aci);
        aci.store_session(RecipientId(1), 1, &SessionRecord::new(vec![1])).unwrap();
        aci.store_session(RecipientId(2), 1, &SessionRecord::new(vec![2])).unwrap();

        aci.delete_all_sessions(RecipientId(1)).unwrap();

        assert!(aci.session_device_ids(RecipientId(1)).unwrap().is_empty());
        assert_eq!(aci.session_device_ids(RecipientId(2)).unwrap(), vec![1]);
    }
}
