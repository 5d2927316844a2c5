//! Sub-store capabilities.
//!
//! The account reaches every piece of protocol state through these traits.
//! They are synchronous and object-safe; the account holds them as
//! `Arc<dyn Trait>` so that durable and in-memory backends are
//! interchangeable.
//!
//! Pre-key, signed pre-key, kyber pre-key and session stores are scoped to
//! one [`IdentityRole`](crate::IdentityRole): a handle only ever sees its
//! own role's records. The remaining stores are shared by both roles.
//!
//! # Panics
//!
//! Implementations may panic if internal synchronization primitives are
//! poisoned. [`MemoryStore`] does; durable backends map every failure to
//! [`StoreError`].

mod memory;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use self::memory::{MemoryRoleStore, MemoryStore};
use crate::{
    error::StoreError,
    identifiers::{RecipientAddress, RecipientId, ServiceId},
    keys::{IdentityKey, ProfileKey},
    model::{Contact, GroupId, GroupInfo, IdentityInfo, Profile, StickerPack, TrustLevel},
    records::{KyberPreKeyRecord, PreKeyRecord, SenderKeyRecord, SessionRecord, SignedPreKeyRecord},
};

/// One-time pre-keys of a role.
pub trait PreKeyStore: Send + Sync {
    /// Load a pre-key. `None` if absent.
    fn load_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, StoreError>;

    /// Store a pre-key under its own id, replacing any previous record.
    fn store_pre_key(&self, record: &PreKeyRecord) -> Result<(), StoreError>;

    /// Remove a pre-key. Removing an absent id is not an error.
    fn remove_pre_key(&self, id: u32) -> Result<(), StoreError>;

    /// Remove every pre-key of the role.
    fn remove_all_pre_keys(&self) -> Result<(), StoreError>;

    /// Ids of all stored pre-keys, ascending.
    fn pre_key_ids(&self) -> Result<Vec<u32>, StoreError>;
}

/// Signed pre-keys of a role.
pub trait SignedPreKeyStore: Send + Sync {
    /// Load a signed pre-key. `None` if absent.
    fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, StoreError>;

    /// Store a signed pre-key under its own id.
    fn store_signed_pre_key(&self, record: &SignedPreKeyRecord) -> Result<(), StoreError>;

    /// Remove a signed pre-key.
    fn remove_signed_pre_key(&self, id: u32) -> Result<(), StoreError>;

    /// Remove every signed pre-key of the role.
    fn remove_all_signed_pre_keys(&self) -> Result<(), StoreError>;

    /// Ids of all stored signed pre-keys, ascending.
    fn signed_pre_key_ids(&self) -> Result<Vec<u32>, StoreError>;
}

/// Post-quantum pre-keys of a role.
pub trait KyberPreKeyStore: Send + Sync {
    /// Load a kyber pre-key. `None` if absent.
    fn load_kyber_pre_key(&self, id: u32) -> Result<Option<KyberPreKeyRecord>, StoreError>;

    /// Store a kyber pre-key. `last_resort` keys survive
    /// [`Self::mark_kyber_pre_key_used`].
    fn store_kyber_pre_key(
        &self,
        record: &KyberPreKeyRecord,
        last_resort: bool,
    ) -> Result<(), StoreError>;

    /// Consume a key after a successful key agreement. One-time keys are
    /// removed; last-resort keys stay.
    fn mark_kyber_pre_key_used(&self, id: u32) -> Result<(), StoreError>;

    /// Remove every kyber pre-key of the role, last-resort included.
    fn remove_all_kyber_pre_keys(&self) -> Result<(), StoreError>;

    /// Ids of all stored kyber pre-keys, ascending.
    fn kyber_pre_key_ids(&self) -> Result<Vec<u32>, StoreError>;
}

/// Sessions of a role, keyed by remote recipient and device.
pub trait SessionStore: Send + Sync {
    /// Load a session. `None` if absent.
    fn load_session(
        &self,
        recipient: RecipientId,
        device_id: u32,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Store a session, replacing any previous state.
    fn store_session(
        &self,
        recipient: RecipientId,
        device_id: u32,
        record: &SessionRecord,
    ) -> Result<(), StoreError>;

    /// Device ids with a stored session for `recipient`, ascending.
    fn session_device_ids(&self, recipient: RecipientId) -> Result<Vec<u32>, StoreError>;

    /// Remove one session.
    fn delete_session(&self, recipient: RecipientId, device_id: u32) -> Result<(), StoreError>;

    /// Remove every session with `recipient`.
    fn delete_all_sessions(&self, recipient: RecipientId) -> Result<(), StoreError>;

    /// Mark every session of the role archived. Records are kept so that
    /// late messages can still be decrypted.
    fn archive_all_sessions(&self) -> Result<(), StoreError>;
}

/// Remote identity keys and their trust, shared by both roles.
pub trait IdentityStore: Send + Sync {
    /// Record `key` for `service_id`.
    ///
    /// A new or changed key gets the trust level the store's policy assigns.
    /// Returns true if a different key was replaced.
    fn save_identity(
        &self,
        service_id: ServiceId,
        key: &IdentityKey,
        added_timestamp: u64,
    ) -> Result<bool, StoreError>;

    /// Stored identity. `None` if never seen.
    fn identity(&self, service_id: ServiceId) -> Result<Option<IdentityInfo>, StoreError>;

    /// Set the trust level, only if the stored key equals `key`. Returns
    /// whether anything was updated.
    fn set_trust_level(
        &self,
        service_id: ServiceId,
        key: &IdentityKey,
        trust_level: TrustLevel,
    ) -> Result<bool, StoreError>;

    /// Forget a service id's identity.
    fn delete_identity(&self, service_id: ServiceId) -> Result<(), StoreError>;

    /// All stored identities.
    fn identities(&self) -> Result<Vec<(ServiceId, IdentityInfo)>, StoreError>;
}

/// Sender-key state and distribution bookkeeping.
pub trait SenderKeyStore: Send + Sync {
    /// Store the sender key of `sender`'s device for a distribution.
    fn store_sender_key(
        &self,
        sender: RecipientId,
        device_id: u32,
        distribution_id: Uuid,
        record: &SenderKeyRecord,
    ) -> Result<(), StoreError>;

    /// Load a sender key. `None` if absent.
    fn load_sender_key(
        &self,
        sender: RecipientId,
        device_id: u32,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>, StoreError>;

    /// Record that the own sender key for `distribution_id` was sent to
    /// `devices`.
    fn mark_shared(
        &self,
        distribution_id: Uuid,
        devices: &[(RecipientId, u32)],
    ) -> Result<(), StoreError>;

    /// Devices the own sender key for `distribution_id` was sent to.
    fn shared_with(&self, distribution_id: Uuid) -> Result<Vec<(RecipientId, u32)>, StoreError>;

    /// Remove every record and share mark involving `recipient`.
    fn delete_sender_keys(&self, recipient: RecipientId) -> Result<(), StoreError>;

    /// Remove all sender keys and share marks.
    fn delete_all_sender_keys(&self) -> Result<(), StoreError>;
}

/// Maps addresses to stable recipient ids.
///
/// An address resolves to the stored recipient sharing its ACI; failing
/// that, its PNI or phone number, provided the stored recipient does not
/// carry a different ACI. Unmatched addresses get a fresh id.
pub trait RecipientStore: Send + Sync {
    /// Resolve without learning anything new about the recipient.
    fn resolve(&self, address: &RecipientAddress) -> Result<RecipientId, StoreError>;

    /// Resolve an address from a trusted source, merging its fields into
    /// the stored address.
    fn resolve_trusted(&self, address: &RecipientAddress) -> Result<RecipientId, StoreError>;

    /// Insert a recipient under a caller-chosen id, used to carry ids over
    /// from legacy stores. Later fresh ids are allocated above it.
    fn import(&self, id: RecipientId, address: &RecipientAddress) -> Result<(), StoreError>;

    /// Look up without creating.
    fn find(&self, address: &RecipientAddress) -> Result<Option<RecipientId>, StoreError>;

    /// Stored address of a recipient.
    fn address(&self, id: RecipientId) -> Result<Option<RecipientAddress>, StoreError>;

    /// Delete a recipient together with its contact and profile data.
    fn remove(&self, id: RecipientId) -> Result<(), StoreError>;

    /// All recipients, ascending by id.
    fn recipients(&self) -> Result<Vec<(RecipientId, RecipientAddress)>, StoreError>;
}

/// Local contact details per recipient.
pub trait ContactStore: Send + Sync {
    /// Contact of a recipient. `None` if not a contact.
    fn contact(&self, id: RecipientId) -> Result<Option<Contact>, StoreError>;

    /// Store or replace a contact.
    fn store_contact(&self, id: RecipientId, contact: &Contact) -> Result<(), StoreError>;

    /// All contacts.
    fn contacts(&self) -> Result<Vec<(RecipientId, Contact)>, StoreError>;
}

/// Profiles and profile keys per recipient.
pub trait ProfileStore: Send + Sync {
    /// Cached profile.
    fn profile(&self, id: RecipientId) -> Result<Option<Profile>, StoreError>;

    /// Store or replace a cached profile.
    fn store_profile(&self, id: RecipientId, profile: &Profile) -> Result<(), StoreError>;

    /// Known profile key.
    fn profile_key(&self, id: RecipientId) -> Result<Option<ProfileKey>, StoreError>;

    /// Store a profile key. A changed key invalidates the cached profile.
    fn store_profile_key(&self, id: RecipientId, key: ProfileKey) -> Result<(), StoreError>;
}

/// Groups of both generations.
pub trait GroupStore: Send + Sync {
    /// Load a group.
    fn group(&self, id: &GroupId) -> Result<Option<GroupInfo>, StoreError>;

    /// Store or replace a group.
    fn store_group(&self, group: &GroupInfo) -> Result<(), StoreError>;

    /// Delete a group.
    fn delete_group(&self, id: &GroupId) -> Result<(), StoreError>;

    /// All groups.
    fn groups(&self) -> Result<Vec<GroupInfo>, StoreError>;
}

/// Sticker packs.
pub trait StickerStore: Send + Sync {
    /// Load a pack.
    fn sticker_pack(&self, pack_id: &[u8]) -> Result<Option<StickerPack>, StoreError>;

    /// Store or replace a pack.
    fn store_sticker_pack(&self, pack: &StickerPack) -> Result<(), StoreError>;

    /// All packs.
    fn sticker_packs(&self) -> Result<Vec<StickerPack>, StoreError>;
}

/// Everything stored for one recipient. Backends persist this as a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientEntry {
    /// Known address fields
    pub address: RecipientAddress,
    /// Contact details, if a contact
    pub contact: Option<Contact>,
    /// Cached profile
    pub profile: Option<Profile>,
    /// Profile key
    pub profile_key: Option<ProfileKey>,
}

impl RecipientEntry {
    /// Apply a profile key, dropping the cached profile if the key changed.
    pub fn set_profile_key(&mut self, key: ProfileKey) {
        if self.profile_key != Some(key) {
            self.profile_key = Some(key);
            self.profile = None;
        }
    }
}

/// Id of the stored recipient `address` resolves to, following the
/// matching rules of [`RecipientStore`].
pub fn best_match<'a, I>(entries: I, address: &RecipientAddress) -> Option<RecipientId>
where
    I: IntoIterator<Item = (RecipientId, &'a RecipientAddress)>,
{
    let compatible = |stored: &RecipientAddress| {
        stored.aci.is_none() || address.aci.is_none() || stored.aci == address.aci
    };

    let mut by_pni = None;
    let mut by_number = None;
    for (id, stored) in entries {
        if address.aci.is_some() && stored.aci == address.aci {
            return Some(id);
        }
        if by_pni.is_none() && address.pni.is_some() && stored.pni == address.pni && compatible(stored)
        {
            by_pni = Some(id);
        }
        if by_number.is_none()
            && address.number.is_some()
            && stored.number == address.number
            && compatible(stored)
        {
            by_number = Some(id);
        }
    }
    by_pni.or(by_number)
}

/// Reject addresses with nothing to match on.
pub fn require_resolvable(address: &RecipientAddress) -> Result<(), StoreError> {
    if address.aci.is_none() && address.pni.is_none() && address.number.is_none() {
        return Err(StoreError::InvalidRecord(
            "recipient address has no service id or number".to_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aci_match_wins_over_number() {
        let aci = Uuid::new_v4();
        let by_number = RecipientAddress::from_number("+1");
        let by_aci = RecipientAddress::from_aci(aci);
        let entries = [(RecipientId(1), &by_number), (RecipientId(2), &by_aci)];
        let query = RecipientAddress { aci: Some(aci), ..RecipientAddress::from_number("+1") };

        assert_eq!(best_match(entries, &query), Some(RecipientId(2)));
    }

    #[test]
    fn number_of_other_aci_does_not_match() {
        let stored = RecipientAddress {
            aci: Some(Uuid::new_v4()),
            ..RecipientAddress::from_number("+1")
        };
        let query = RecipientAddress {
            aci: Some(Uuid::new_v4()),
            ..RecipientAddress::from_number("+1")
        };

        assert_eq!(best_match([(RecipientId(1), &stored)], &query), None);
    }

    #[test]
    fn empty_address_is_rejected() {
        let err = require_resolvable(&RecipientAddress::default()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }
}
