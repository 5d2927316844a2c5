//! Keystead account storage.
//!
//! On-disk state of one messaging account: a JSON descriptor holding the
//! account's identity, key material and pre-key allocators, plus a private
//! directory with a redb database for protocol stores, a message cache and
//! a storage manifest.
//!
//! # Architecture
//!
//! [`Account`] is the only entry point. Loading an account takes an
//! exclusive lock on its descriptor file, decodes it, runs the
//! [`migration`] pipeline over older layouts and legacy artifacts, and
//! keeps the lock until [`Account::close`]. Sub-stores are opened lazily
//! through a [`StoreRegistry`] and reached through the capability traits of
//! [`keystead_core::store`].
//!
//! # Components
//!
//! - [`Account`]: lifecycle, setters, pre-key allocation, registration
//! - [`descriptor`]: descriptor codec and storage versions
//! - [`DescriptorFile`]: the locked descriptor file
//! - [`AccountDatabase`]: redb-backed sub-stores
//! - [`MessageCache`] and [`SendLog`]: envelope cache and resend log
//! - [`migration`]: upgrades from older descriptor versions

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod account;
pub mod database;
pub mod descriptor;
mod error;
mod lazy;
mod lock;
pub mod message_cache;
pub mod migration;
mod paths;
pub mod send_log;
mod stores;

pub use account::{
    Account, AccountAttributes, Credentials, CredentialsProvider, LinkedDevice, NewAccount,
    ProvisioningData, RoleStores,
};
pub use database::{AccountDatabase, RoleDatabase};
pub use descriptor::{AccountState, CURRENT_STORAGE_VERSION, MINIMUM_STORAGE_VERSION};
pub use error::{AccountError, VersionProblem};
pub use lazy::LazyCell;
pub use lock::DescriptorFile;
pub use message_cache::{CachedMessage, MessageCache};
pub use paths::AccountPaths;
pub use send_log::{SendLog, SendLogEntry};
pub use stores::{RoleStore, SharedStore, StoreProvider, StoreRegistry};
