//! Account error types.

use std::{fmt, io, path::PathBuf};

use keystead_core::{AllocError, IdDesync, IdentityRole, ServiceId, StoreError};
use thiserror::Error;

/// Why a descriptor's storage version was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionProblem {
    /// Written by a newer release
    TooNew,
    /// Older than the oldest layout this release can migrate
    TooOld,
}

impl fmt::Display for VersionProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooNew => f.write_str("from a more recent version"),
            Self::TooOld => f.write_str("from a no longer supported older version"),
        }
    }
}

/// Errors that can occur while opening or operating on an account.
#[derive(Error, Debug)]
pub enum AccountError {
    /// Another instance holds the account's file lock.
    ///
    /// Expected under normal operation; retry later or wait for the lock.
    #[error("account file {} is in use by another instance", path.display())]
    Locked {
        /// Descriptor file
        path: PathBuf,
    },

    /// No descriptor exists at the path.
    #[error("account file {} does not exist", path.display())]
    NotFound {
        /// Descriptor file
        path: PathBuf,
    },

    /// A descriptor already exists where a new one was to be created.
    #[error("account file {} already exists", path.display())]
    AlreadyExists {
        /// Descriptor file
        path: PathBuf,
    },

    /// The descriptor's storage version cannot be loaded. Fatal.
    #[error("account file was created {problem}: {version}")]
    UnsupportedVersion {
        /// Version found in the file
        version: i64,
        /// Direction of the mismatch
        problem: VersionProblem,
    },

    /// The descriptor could not be decoded. Fatal at load.
    #[error("malformed account file: {field}: {reason}")]
    Malformed {
        /// Offending field, or `descriptor` for structural errors
        field: &'static str,
        /// Decoder message
        reason: String,
    },

    /// A pre-key batch broke the sequential id contract.
    ///
    /// Indicates a caller bug or corrupted state. Never retried and never
    /// silently resynchronized.
    #[error("{role}: {source}")]
    PreKeyIdDesync {
        /// Role whose stream is affected
        role: IdentityRole,
        /// Mismatch details
        #[source]
        source: IdDesync,
    },

    /// The operation is reserved for the primary device.
    #[error("operation requires the primary device")]
    NotPrimaryDevice,

    /// A service id is neither the account's ACI nor its PNI.
    #[error("no identity role matches {0}")]
    NoMatchingRole(ServiceId),

    /// A role has no service id or identity key pair yet.
    #[error("{0} identity is not set")]
    MissingIdentity(IdentityRole),

    /// A sub-store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AccountError {
    /// Whether the same call may succeed later without intervention.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Locked { .. } => true,
            Self::Store(err) => err.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn malformed(field: &'static str, reason: impl fmt::Display) -> Self {
        Self::Malformed { field, reason: reason.to_string() }
    }
}

impl From<AllocError> for AccountError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::Desync { role, source } => Self::PreKeyIdDesync { role, source },
            AllocError::Store(err) => Self::Store(err),
        }
    }
}
