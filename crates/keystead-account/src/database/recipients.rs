//! Recipients with their contact and profile data.
//!
//! Each recipient is one `RecipientEntry` so that merging or deleting a
//! recipient touches a single row. Resolution runs inside one write
//! transaction: matching, id allocation and the merge commit together.

use keystead_core::{
    Contact, ContactStore, Profile, ProfileKey, ProfileStore, RecipientAddress, RecipientId,
    RecipientStore, StoreError,
    records::{from_cbor, to_cbor},
    store::{RecipientEntry, best_match, require_resolvable},
};
use redb::{ReadableTable, WriteTransaction};

use super::{AccountDatabase, META, RECIPIENTS, be_u64, corrupt_key, io_err, scan_prefix};

const NEXT_RECIPIENT_ID: &[u8] = b"next_recipient_id";

fn decode_entries(
    rows: Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<Vec<(RecipientId, RecipientEntry)>, StoreError> {
    rows.into_iter()
        .map(|(key, value)| {
            let id = be_u64(&key, 0).ok_or_else(|| corrupt_key("recipients"))?;
            Ok((RecipientId(id), from_cbor(&value)?))
        })
        .collect()
}

fn last_recipient_id(txn: &WriteTransaction) -> Result<u64, StoreError> {
    let meta = txn.open_table(META).map_err(io_err)?;
    let last = meta.get(NEXT_RECIPIENT_ID).map_err(io_err)?;
    Ok(last.and_then(|value| be_u64(value.value(), 0)).unwrap_or(0))
}

fn set_last_recipient_id(txn: &WriteTransaction, id: u64) -> Result<(), StoreError> {
    let mut meta = txn.open_table(META).map_err(io_err)?;
    meta.insert(NEXT_RECIPIENT_ID, id.to_be_bytes().as_slice()).map_err(io_err)?;
    Ok(())
}

fn put_entry(
    txn: &WriteTransaction,
    id: RecipientId,
    entry: &RecipientEntry,
) -> Result<(), StoreError> {
    let mut table = txn.open_table(RECIPIENTS).map_err(io_err)?;
    table.insert(id.0.to_be_bytes().as_slice(), to_cbor(entry)?.as_slice()).map_err(io_err)?;
    Ok(())
}

impl AccountDatabase {
    fn resolve_with(
        &self,
        address: &RecipientAddress,
        merge: bool,
    ) -> Result<RecipientId, StoreError> {
        require_resolvable(address)?;
        self.write(|txn| {
            let entries = {
                let table = txn.open_table(RECIPIENTS).map_err(io_err)?;
                decode_entries(scan_prefix(&table, &[])?)?
            };

            let found = best_match(entries.iter().map(|(id, e)| (*id, &e.address)), address);
            if let Some(id) = found {
                if merge
                    && let Some((_, entry)) = entries.iter().find(|(candidate, _)| *candidate == id)
                {
                    let mut entry = entry.clone();
                    if entry.address.merge_from(address) {
                        put_entry(txn, id, &entry)?;
                    }
                }
                return Ok(id);
            }

            let id = RecipientId(last_recipient_id(txn)? + 1);
            set_last_recipient_id(txn, id.0)?;
            put_entry(txn, id, &RecipientEntry { address: address.clone(), ..Default::default() })?;
            Ok(id)
        })
    }

    fn entry(&self, id: RecipientId) -> Result<Option<RecipientEntry>, StoreError> {
        self.get(RECIPIENTS, &id.0.to_be_bytes())?.map(|bytes| from_cbor(&bytes)).transpose()
    }

    fn update_entry(
        &self,
        id: RecipientId,
        f: impl FnOnce(&mut RecipientEntry),
    ) -> Result<(), StoreError> {
        self.write(|txn| {
            let mut entry: RecipientEntry = {
                let table = txn.open_table(RECIPIENTS).map_err(io_err)?;
                let value = table.get(id.0.to_be_bytes().as_slice()).map_err(io_err)?;
                match value {
                    Some(value) => from_cbor(value.value())?,
                    None => {
                        return Err(StoreError::InvalidRecord(format!("unknown recipient {id}")));
                    },
                }
            };
            f(&mut entry);
            put_entry(txn, id, &entry)
        })
    }

    fn entries(&self) -> Result<Vec<(RecipientId, RecipientEntry)>, StoreError> {
        decode_entries(self.scan(RECIPIENTS, &[])?)
    }
}

impl RecipientStore for AccountDatabase {
    fn resolve(&self, address: &RecipientAddress) -> Result<RecipientId, StoreError> {
        self.resolve_with(address, false)
    }

    fn resolve_trusted(&self, address: &RecipientAddress) -> Result<RecipientId, StoreError> {
        self.resolve_with(address, true)
    }

    fn import(&self, id: RecipientId, address: &RecipientAddress) -> Result<(), StoreError> {
        self.write(|txn| {
            let existing = {
                let table = txn.open_table(RECIPIENTS).map_err(io_err)?;
                let value = table.get(id.0.to_be_bytes().as_slice()).map_err(io_err)?;
                value.map(|v| from_cbor::<RecipientEntry>(v.value())).transpose()?
            };
            let mut entry = existing.unwrap_or_default();
            entry.address.merge_from(address);
            put_entry(txn, id, &entry)?;

            let last = last_recipient_id(txn)?;
            if id.0 > last {
                set_last_recipient_id(txn, id.0)?;
            }
            Ok(())
        })
    }

    fn find(&self, address: &RecipientAddress) -> Result<Option<RecipientId>, StoreError> {
        let entries = self.entries()?;
        Ok(best_match(entries.iter().map(|(id, e)| (*id, &e.address)), address))
    }

    fn address(&self, id: RecipientId) -> Result<Option<RecipientAddress>, StoreError> {
        Ok(self.entry(id)?.map(|entry| entry.address))
    }

    fn remove(&self, id: RecipientId) -> Result<(), StoreError> {
        self.delete(RECIPIENTS, &id.0.to_be_bytes())
    }

    fn recipients(&self) -> Result<Vec<(RecipientId, RecipientAddress)>, StoreError> {
        Ok(self.entries()?.into_iter().map(|(id, entry)| (id, entry.address)).collect())
    }
}

impl ContactStore for AccountDatabase {
    fn contact(&self, id: RecipientId) -> Result<Option<Contact>, StoreError> {
        Ok(self.entry(id)?.and_then(|entry| entry.contact))
    }

    fn store_contact(&self, id: RecipientId, contact: &Contact) -> Result<(), StoreError> {
        self.update_entry(id, |entry| entry.contact = Some(contact.clone()))
    }

    fn contacts(&self) -> Result<Vec<(RecipientId, Contact)>, StoreError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|(id, entry)| entry.contact.map(|contact| (id, contact)))
            .collect())
    }
}

impl ProfileStore for AccountDatabase {
    fn profile(&self, id: RecipientId) -> Result<Option<Profile>, StoreError> {
        Ok(self.entry(id)?.and_then(|entry| entry.profile))
    }

    fn store_profile(&self, id: RecipientId, profile: &Profile) -> Result<(), StoreError> {
        self.update_entry(id, |entry| entry.profile = Some(profile.clone()))
    }

    fn profile_key(&self, id: RecipientId) -> Result<Option<ProfileKey>, StoreError> {
        Ok(self.entry(id)?.and_then(|entry| entry.profile_key))
    }

    fn store_profile_key(&self, id: RecipientId, key: ProfileKey) -> Result<(), StoreError> {
        self.update_entry(id, |entry| entry.set_profile_key(key))
    }
}
