//! Keystead core
//!
//! Domain types for a messaging account's persistent key state: identifiers
//! for the two identity roles (ACI and PNI), key material, opaque protocol
//! records, the pre-key id allocator, and the capability traits that the
//! account uses to reach its sub-stores.
//!
//! Nothing in this crate touches the filesystem. Durable implementations of
//! the store traits live in `keystead-account`; [`MemoryStore`] backs tests
//! and simulations.

#![forbid(unsafe_code)]

pub mod error;
pub mod identifiers;
pub mod keys;
pub mod model;
pub mod prekeys;
pub mod records;
pub mod settings;
pub mod store;

pub use error::{AllocError, IdDesync, KeyError, StoreError};
pub use identifiers::{
    IdentityRole, PRIMARY_DEVICE_ID, RecipientAddress, RecipientId, ServiceId,
};
pub use keys::{IdentityKey, IdentityKeyPair, MasterKey, ProfileKey, StorageKey};
pub use model::{
    Capability, Contact, GroupId, GroupInfo, GroupInfoV1, GroupInfoV2, IdentityInfo, Profile,
    ServiceEnvironment, StickerPack, TrustLevel, UnidentifiedAccessMode,
};
pub use prekeys::{PREKEY_MAXIMUM_ID, PreKeyMetadata, PreKeyStream};
pub use records::{
    KyberPreKeyRecord, PreKeyCollection, PreKeyRecord, SenderKeyRecord, SessionRecord,
    SignedPreKeyRecord,
};
pub use settings::{ConfigurationStore, PhoneNumberSharingMode, Settings, TrustNewIdentity};
pub use store::{
    ContactStore, GroupStore, IdentityStore, KyberPreKeyStore, MemoryStore, PreKeyStore,
    ProfileStore, RecipientStore, SenderKeyStore, SessionStore, SignedPreKeyStore, StickerStore,
};
