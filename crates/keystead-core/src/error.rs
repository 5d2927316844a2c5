//! Error types shared by the store traits and the pre-key allocator.

use thiserror::Error;

use crate::{identifiers::IdentityRole, prekeys::PreKeyStream};

/// Errors returned by sub-store implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend I/O failure (database, filesystem)
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Encoding or decoding a stored value failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A record's bytes could not be interpreted
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The backing store was closed; handles taken before the close are
    /// dead
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Whether retrying the same operation could succeed.
    ///
    /// Serialization and record errors are deterministic; only backend I/O
    /// is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// A record id did not match the stream's next expected id.
///
/// The stream is desynchronized from the ids the server has been told
/// about. This is an integrity fault in the caller, never retried.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{stream} pre-key id desync: expected {expected}, got {got}")]
pub struct IdDesync {
    /// Stream the batch targeted
    pub stream: PreKeyStream,
    /// Next id the allocator would have handed out
    pub expected: u32,
    /// Id the offending record carried
    pub got: u32,
}

/// Errors from role-scoped pre-key batch operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// A record in the batch broke the sequential id contract
    #[error("{role}: {source}")]
    Desync {
        /// Role whose stream is affected
        role: IdentityRole,
        /// Mismatch details
        #[source]
        source: IdDesync,
    },

    /// Writing an accepted record to its store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from decoding key material.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    /// Encoded key has the wrong size
    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// Required size
        expected: usize,
        /// Supplied size
        got: usize,
    },

    /// Bytes are not a valid curve point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Private key does not produce the supplied public key
    #[error("public key does not match private key")]
    Mismatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_io_is_transient() {
        assert!(StoreError::Io("disk".into()).is_transient());
        assert!(!StoreError::Serialization("cbor".into()).is_transient());
        assert!(!StoreError::InvalidRecord("short".into()).is_transient());
    }

    #[test]
    fn desync_display_names_role_and_stream() {
        let err = AllocError::Desync {
            role: IdentityRole::Pni,
            source: IdDesync { stream: PreKeyStream::Kyber, expected: 7, got: 9 },
        };
        assert_eq!(err.to_string(), "pni: kyber pre-key id desync: expected 7, got 9");
    }
}
