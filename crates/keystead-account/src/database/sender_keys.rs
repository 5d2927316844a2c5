use keystead_core::{
    RecipientId, SenderKeyRecord, SenderKeyStore, StoreError,
    records::{from_cbor, to_cbor},
};
use uuid::Uuid;

use super::{
    AccountDatabase, SENDER_KEYS, SENDER_KEYS_SHARED, be_u32, be_u64, corrupt_key,
    delete_prefix_in, io_err, scan_prefix,
};

/// Encode (sender, device, distribution) as a 28-byte key.
fn encode_sender_key(sender: RecipientId, device_id: u32, distribution_id: Uuid) -> [u8; 28] {
    let mut key = [0u8; 28];
    key[..8].copy_from_slice(&sender.0.to_be_bytes());
    key[8..12].copy_from_slice(&device_id.to_be_bytes());
    key[12..].copy_from_slice(distribution_id.as_bytes());
    key
}

/// Encode (distribution, recipient, device) as a 28-byte key.
fn encode_shared_key(distribution_id: Uuid, recipient: RecipientId, device_id: u32) -> [u8; 28] {
    let mut key = [0u8; 28];
    key[..16].copy_from_slice(distribution_id.as_bytes());
    key[16..24].copy_from_slice(&recipient.0.to_be_bytes());
    key[24..].copy_from_slice(&device_id.to_be_bytes());
    key
}

fn decode_shared_key(key: &[u8]) -> Option<(RecipientId, u32)> {
    Some((RecipientId(be_u64(key, 16)?), be_u32(key, 24)?))
}

impl SenderKeyStore for AccountDatabase {
    fn store_sender_key(
        &self,
        sender: RecipientId,
        device_id: u32,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), StoreError> {
        self.put(
            SENDER_KEYS,
            &encode_sender_key(sender, device_id, distribution_id),
            &to_cbor(record)?,
        )
    }

    fn load_sender_key(
        &self,
        sender: RecipientId,
        device_id: u32,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, StoreError> {
        self.get(SENDER_KEYS, &encode_sender_key(sender, device_id, distribution_id))?
            .map(|bytes| from_cbor(&bytes))
            .transpose()
    }

    fn mark_shared(
        &self,
        distribution_id: Uuid,
        devices: &[(RecipientId, u32)],
    ) -> Result<(), StoreError> {
        self.write(|txn| {
            let mut table = txn.open_table(SENDER_KEYS_SHARED).map_err(io_err)?;
            let empty: &[u8] = &[];
            for &(recipient, device_id) in devices {
                let key = encode_shared_key(distribution_id, recipient, device_id);
                table.insert(key.as_slice(), empty).map_err(io_err)?;
            }
            Ok(())
        })
    }

    fn shared_with(&self, distribution_id: Uuid) -> Result<Vec<(RecipientId, u32)>, StoreError> {
        self.scan(SENDER_KEYS_SHARED, distribution_id.as_bytes())?
            .into_iter()
            .map(|(key, _)| decode_shared_key(&key).ok_or_else(|| corrupt_key("sender_keys_shared")))
            .collect()
    }

    fn delete_sender_keys(&self, recipient: RecipientId) -> Result<(), StoreError> {
        self.write(|txn| {
            let mut keys = txn.open_table(SENDER_KEYS).map_err(io_err)?;
            delete_prefix_in(&mut keys, &recipient.0.to_be_bytes())?;

            let mut shared = txn.open_table(SENDER_KEYS_SHARED).map_err(io_err)?;
            let stale: Vec<Vec<u8>> = scan_prefix(&shared, &[])?
                .into_iter()
                .filter(|(key, _)| decode_shared_key(key).is_some_and(|(r, _)| r == recipient))
                .map(|(key, _)| key)
                .collect();
            for key in stale {
                shared.remove(key.as_slice()).map_err(io_err)?;
            }
            Ok(())
        })
    }

    fn delete_all_sender_keys(&self) -> Result<(), StoreError> {
        self.write(|txn| {
            let mut keys = txn.open_table(SENDER_KEYS).map_err(io_err)?;
            delete_prefix_in(&mut keys, &[])?;
            let mut shared = txn.open_table(SENDER_KEYS_SHARED).map_err(io_err)?;
            delete_prefix_in(&mut shared, &[])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use keystead_core::settings::TrustNewIdentity;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_delete_for_recipient_clears_keys_and_marks() {
        let dir = tempdir().unwrap();
        let db = AccountDatabase::open(dir.path().join("account.db"), TrustNewIdentity::default())
            .unwrap();
        let dist = Uuid::new_v4();
        let record = SenderKeyRecord { data: vec![9; 4], created_at: 5 };
        db.store_sender_key(RecipientId(1), 1, dist, &record).unwrap();
        db.store_sender_key(RecipientId(2), 1, dist, &record).unwrap();
        db.mark_shared(dist, &[(RecipientId(1), 1), (RecipientId(2), 3)]).unwrap();

        db.delete_sender_keys(RecipientId(1)).unwrap();

        assert!(db.load_sender_key(RecipientId(1), 1, dist).unwrap().is_none());
        assert_eq!(db.load_sender_key(RecipientId(2), 1, dist).unwrap(), Some(record));
        assert_eq!(db.shared_with(dist).unwrap(), vec![(RecipientId(2), 3)]);

        db.delete_all_sender_keys().unwrap();
        assert!(db.shared_with(dist).unwrap().is_empty());
        assert!(db.load_sender_key(RecipientId(2), 1, dist).unwrap().is_none());
    }
}
