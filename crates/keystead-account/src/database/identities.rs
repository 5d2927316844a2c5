use keystead_core::{
    IdentityInfo, IdentityKey, IdentityStore, ServiceId, StoreError, TrustLevel,
    records::{from_cbor, to_cbor},
};
use redb::ReadableTable;

use super::{AccountDatabase, IDENTITIES, corrupt_key, io_err};

impl IdentityStore for AccountDatabase {
    fn save_identity(
        &self,
        service_id: ServiceId,
        key: &IdentityKey,
        added_timestamp: u64,
    ) -> Result<bool, StoreError> {
        let db_key = service_id.to_key_bytes();
        let policy = self.trust_policy;
        self.write(|txn| {
            let mut table = txn.open_table(IDENTITIES).map_err(io_err)?;
            let existing = match table.get(db_key.as_slice()).map_err(io_err)? {
                Some(value) => Some(from_cbor::<IdentityInfo>(value.value())?),
                None => None,
            };
            let (replaced, first_seen) = match existing {
                Some(existing) if existing.identity_key == *key => return Ok(false),
                Some(_) => (true, false),
                None => (false, true),
            };
            let info = IdentityInfo {
                identity_key: *key,
                trust_level: policy.initial_trust(first_seen),
                added_timestamp,
            };
            table.insert(db_key.as_slice(), to_cbor(&info)?.as_slice()).map_err(io_err)?;
            Ok(replaced)
        })
    }

    fn identity(&self, service_id: ServiceId) -> Result<Option<IdentityInfo>, StoreError> {
        self.get(IDENTITIES, &service_id.to_key_bytes())?.map(|bytes| from_cbor(&bytes)).transpose()
    }

    fn set_trust_level(
        &self,
        service_id: ServiceId,
        key: &IdentityKey,
        trust_level: TrustLevel,
    ) -> Result<bool, StoreError> {
        let db_key = service_id.to_key_bytes();
        self.write(|txn| {
            let mut table = txn.open_table(IDENTITIES).map_err(io_err)?;
            let mut info = match table.get(db_key.as_slice()).map_err(io_err)? {
                Some(value) => from_cbor::<IdentityInfo>(value.value())?,
                None => return Ok(false),
            };
            if info.identity_key != *key {
                return Ok(false);
            }
            info.trust_level = trust_level;
            table.insert(db_key.as_slice(), to_cbor(&info)?.as_slice()).map_err(io_err)?;
            Ok(true)
        })
    }

    fn delete_identity(&self, service_id: ServiceId) -> Result<(), StoreError> {
        self.delete(IDENTITIES, &service_id.to_key_bytes())
    }

    fn identities(&self) -> Result<Vec<(ServiceId, IdentityInfo)>, StoreError> {
        self.scan(IDENTITIES, &[])?
            .into_iter()
            .map(|(key, value)| {
                let service_id =
                    ServiceId::from_key_bytes(&key).ok_or_else(|| corrupt_key("identities"))?;
                Ok((service_id, from_cbor(&value)?))
            })
            .collect()
    }
}
