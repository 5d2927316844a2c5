//! Pre-key id allocation.
//!
//! Every batch is checked against the role's allocator before the first
//! record is stored. A rejected batch leaves the stores and the allocator
//! untouched.

use keystead_core::{
    AllocError, IdDesync, IdentityRole, KyberPreKeyRecord, PreKeyCollection, PreKeyMetadata,
    PreKeyRecord, PreKeyStream, SignedPreKeyRecord,
};
use rand::rngs::OsRng;
use tracing::{debug, error};

use super::Account;
use crate::{descriptor::AccountState, error::AccountError, stores::StoreProvider};

impl Account {
    /// Reseed the one-time and signed pre-key streams of `role`.
    pub fn reset_pre_key_offsets(&self, role: IdentityRole) {
        self.update(|state| state.role_mut(role).pre_key_metadata.reset_offsets(&mut OsRng));
    }

    /// Reseed the kyber stream of `role` and forget its last-resort key.
    pub fn reset_kyber_pre_key_offsets(&self, role: IdentityRole) {
        self.update(|state| state.role_mut(role).pre_key_metadata.reset_kyber_offsets(&mut OsRng));
    }

    /// Store one-time pre-keys continuing the role's one-time stream.
    ///
    /// # Errors
    ///
    /// - `AccountError::PreKeyIdDesync` if the ids do not continue the
    ///   stream exactly
    /// - `AccountError::Store` if a record cannot be written
    pub fn add_pre_keys(
        &self,
        role: IdentityRole,
        records: &[PreKeyRecord],
    ) -> Result<(), AccountError> {
        let mut state = self.lock_state();
        self.add_pre_keys_locked(&mut state, role, records)?;
        self.persist(&state);
        Ok(())
    }

    /// Store a signed pre-key continuing the role's signed stream.
    ///
    /// # Errors
    ///
    /// As [`Self::add_pre_keys`].
    pub fn add_signed_pre_key(
        &self,
        role: IdentityRole,
        record: &SignedPreKeyRecord,
    ) -> Result<(), AccountError> {
        let mut state = self.lock_state();
        self.add_signed_pre_key_locked(&mut state, role, record)?;
        self.persist(&state);
        Ok(())
    }

    /// Store one-time kyber pre-keys continuing the role's kyber stream.
    ///
    /// # Errors
    ///
    /// As [`Self::add_pre_keys`].
    pub fn add_kyber_pre_keys(
        &self,
        role: IdentityRole,
        records: &[KyberPreKeyRecord],
    ) -> Result<(), AccountError> {
        let mut state = self.lock_state();
        self.add_kyber_pre_keys_locked(&mut state, role, records)?;
        self.persist(&state);
        Ok(())
    }

    /// Store a last-resort kyber pre-key continuing the role's kyber
    /// stream and make it the active one.
    ///
    /// # Errors
    ///
    /// As [`Self::add_pre_keys`].
    pub fn add_last_resort_kyber_pre_key(
        &self,
        role: IdentityRole,
        record: &KyberPreKeyRecord,
    ) -> Result<(), AccountError> {
        let mut state = self.lock_state();
        self.add_last_resort_kyber_pre_key_locked(&mut state, role, record)?;
        self.persist(&state);
        Ok(())
    }

    /// Reseed every stream of `role` and delete all of its pre-keys.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub fn clear_all_pre_keys(&self, role: IdentityRole) -> Result<(), AccountError> {
        let mut state = self.lock_state();
        self.clear_all_pre_keys_locked(&mut state, role)?;
        self.persist(&state);
        Ok(())
    }

    /// Replace all pre-keys of `role` with a collection agreed with the
    /// service.
    ///
    /// The allocator is set to the collection's base ids, every stored
    /// pre-key of the role is removed, and the records are added through
    /// the ordinary sequence checks.
    ///
    /// # Errors
    ///
    /// As [`Self::add_pre_keys`].
    pub fn set_pre_keys(
        &self,
        role: IdentityRole,
        collection: &PreKeyCollection,
    ) -> Result<(), AccountError> {
        let mut state = self.lock_state();
        self.set_pre_keys_locked(&mut state, role, collection)?;
        self.persist(&state);
        Ok(())
    }

    pub(super) fn set_pre_keys_locked(
        &self,
        state: &mut AccountState,
        role: IdentityRole,
        collection: &PreKeyCollection,
    ) -> Result<(), AccountError> {
        let before = state.role(role).pre_key_metadata;
        let mut target = before;
        target.set_next_id(PreKeyStream::OneTime, collection.one_time_pre_key_offset);
        target.set_next_id(PreKeyStream::Signed, collection.next_signed_pre_key_id);
        target.set_next_id(PreKeyStream::Kyber, collection.one_time_kyber_pre_key_offset);
        target.set_active_last_resort_kyber_pre_key_id(
            collection.last_resort_kyber_pre_key.as_ref().map(|record| record.id),
        );
        check_collection(role, target, collection)?;

        state.role_mut(role).pre_key_metadata = target;
        let result = self.replace_pre_keys(state, role, collection);
        if result.is_err() {
            state.role_mut(role).pre_key_metadata = before;
        }
        result
    }

    fn replace_pre_keys(
        &self,
        state: &mut AccountState,
        role: IdentityRole,
        collection: &PreKeyCollection,
    ) -> Result<(), AccountError> {
        self.remove_all_pre_keys(role)?;
        self.add_pre_keys_locked(state, role, &collection.one_time_pre_keys)?;
        if let Some(record) = &collection.signed_pre_key {
            self.add_signed_pre_key_locked(state, role, record)?;
        }
        self.add_kyber_pre_keys_locked(state, role, &collection.one_time_kyber_pre_keys)?;
        if let Some(record) = &collection.last_resort_kyber_pre_key {
            self.add_last_resort_kyber_pre_key_locked(state, role, record)?;
        }
        debug!(%role, "replaced pre-keys");
        Ok(())
    }

    pub(super) fn clear_all_pre_keys_locked(
        &self,
        state: &mut AccountState,
        role: IdentityRole,
    ) -> Result<(), AccountError> {
        let meta = &mut state.role_mut(role).pre_key_metadata;
        meta.reset_offsets(&mut OsRng);
        meta.reset_kyber_offsets(&mut OsRng);
        self.remove_all_pre_keys(role)?;
        debug!(%role, "cleared all pre-keys");
        Ok(())
    }

    fn remove_all_pre_keys(&self, role: IdentityRole) -> Result<(), AccountError> {
        let store = self.stores.role(role)?;
        store.remove_all_pre_keys()?;
        store.remove_all_signed_pre_keys()?;
        store.remove_all_kyber_pre_keys()?;
        Ok(())
    }

    fn add_pre_keys_locked(
        &self,
        state: &mut AccountState,
        role: IdentityRole,
        records: &[PreKeyRecord],
    ) -> Result<(), AccountError> {
        let store = self.stores.role(role)?;
        let meta = &mut state.role_mut(role).pre_key_metadata;
        let ids = records.iter().map(|record| record.id);
        let count = check(role, meta.check_batch(PreKeyStream::OneTime, ids))?;
        for record in records {
            store.store_pre_key(record)?;
        }
        meta.advance(PreKeyStream::OneTime, count);
        debug!(%role, count, "added pre-keys");
        Ok(())
    }

    pub(super) fn add_signed_pre_key_locked(
        &self,
        state: &mut AccountState,
        role: IdentityRole,
        record: &SignedPreKeyRecord,
    ) -> Result<(), AccountError> {
        let store = self.stores.role(role)?;
        let meta = &mut state.role_mut(role).pre_key_metadata;
        let count = check(role, meta.check_batch(PreKeyStream::Signed, [record.id]))?;
        store.store_signed_pre_key(record)?;
        meta.advance(PreKeyStream::Signed, count);
        debug!(%role, id = record.id, "added signed pre-key");
        Ok(())
    }

    fn add_kyber_pre_keys_locked(
        &self,
        state: &mut AccountState,
        role: IdentityRole,
        records: &[KyberPreKeyRecord],
    ) -> Result<(), AccountError> {
        let store = self.stores.role(role)?;
        let meta = &mut state.role_mut(role).pre_key_metadata;
        let ids = records.iter().map(|record| record.id);
        let count = check(role, meta.check_batch(PreKeyStream::Kyber, ids))?;
        for record in records {
            store.store_kyber_pre_key(record, false)?;
        }
        meta.advance(PreKeyStream::Kyber, count);
        debug!(%role, count, "added kyber pre-keys");
        Ok(())
    }

    pub(super) fn add_last_resort_kyber_pre_key_locked(
        &self,
        state: &mut AccountState,
        role: IdentityRole,
        record: &KyberPreKeyRecord,
    ) -> Result<(), AccountError> {
        let store = self.stores.role(role)?;
        let meta = &mut state.role_mut(role).pre_key_metadata;
        let count = check(role, meta.check_batch(PreKeyStream::Kyber, [record.id]))?;
        store.store_kyber_pre_key(record, true)?;
        meta.set_active_last_resort_kyber_pre_key_id(Some(record.id));
        meta.advance(PreKeyStream::Kyber, count);
        debug!(%role, id = record.id, "added last-resort kyber pre-key");
        Ok(())
    }
}

/// Run every batch of `collection` through a scratch copy of `meta`, in
/// the order they are stored.
fn check_collection(
    role: IdentityRole,
    mut meta: PreKeyMetadata,
    collection: &PreKeyCollection,
) -> Result<(), AccountError> {
    let ids = collection.one_time_pre_keys.iter().map(|record| record.id);
    let count = check(role, meta.check_batch(PreKeyStream::OneTime, ids))?;
    meta.advance(PreKeyStream::OneTime, count);
    if let Some(record) = &collection.signed_pre_key {
        check(role, meta.check_batch(PreKeyStream::Signed, [record.id]))?;
    }
    let ids = collection.one_time_kyber_pre_keys.iter().map(|record| record.id);
    let count = check(role, meta.check_batch(PreKeyStream::Kyber, ids))?;
    meta.advance(PreKeyStream::Kyber, count);
    if let Some(record) = &collection.last_resort_kyber_pre_key {
        check(role, meta.check_batch(PreKeyStream::Kyber, [record.id]))?;
    }
    Ok(())
}

fn check(role: IdentityRole, result: Result<u32, IdDesync>) -> Result<u32, AccountError> {
    result.map_err(|source| {
        error!(%role, %source, "pre-key id desync");
        AllocError::Desync { role, source }.into()
    })
}
