//! Pre-key id allocation.
//!
//! Each role owns three independent id streams (one-time, signed, kyber).
//! The service is told the next id of every stream when keys are uploaded,
//! so ids are handed out strictly sequentially modulo [`PREKEY_MAXIMUM_ID`]
//! and a record that does not carry the expected id is refused outright.
//!
//! [`PreKeyMetadata`] is the complete allocator state for one role. It
//! does no I/O; the account persists it with the descriptor and writes the
//! accepted records to the role's stores.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::IdDesync;

/// Size of the id space. Ids live in `[0, PREKEY_MAXIMUM_ID)`.
pub const PREKEY_MAXIMUM_ID: u32 = 0x00FF_FFFF;

/// One of the three id streams of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PreKeyStream {
    /// One-time elliptic-curve pre-keys
    OneTime,
    /// Signed pre-keys
    Signed,
    /// Post-quantum pre-keys, one-time and last-resort alike
    Kyber,
}

impl fmt::Display for PreKeyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneTime => f.write_str("one-time"),
            Self::Signed => f.write_str("signed"),
            Self::Kyber => f.write_str("kyber"),
        }
    }
}

/// Allocator state for one role.
///
/// # Invariants
///
/// - Every next-id is `< PREKEY_MAXIMUM_ID`.
/// - Accepting a record advances its stream by exactly one, wrapping.
/// - The active last-resort id, when set, names a kyber id that was handed
///   out by this allocator since its last kyber reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMetadata {
    next_pre_key_id: u32,
    next_signed_pre_key_id: u32,
    next_kyber_pre_key_id: u32,
    active_last_resort_kyber_pre_key_id: Option<u32>,
}

impl Default for PreKeyMetadata {
    fn default() -> Self {
        Self {
            next_pre_key_id: 1,
            next_signed_pre_key_id: 1,
            next_kyber_pre_key_id: 1,
            active_last_resort_kyber_pre_key_id: None,
        }
    }
}

fn random_offset<R: Rng>(rng: &mut R) -> u32 {
    rng.gen_range(0..PREKEY_MAXIMUM_ID)
}

/// Random offset guaranteed to differ from `previous`.
fn fresh_offset<R: Rng>(rng: &mut R, previous: u32) -> u32 {
    loop {
        let offset = random_offset(rng);
        if offset != previous {
            return offset;
        }
    }
}

impl PreKeyMetadata {
    /// Metadata with every stream at a random offset and no last-resort
    /// key. Used for roles that have never uploaded keys.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Self {
            next_pre_key_id: random_offset(rng),
            next_signed_pre_key_id: random_offset(rng),
            next_kyber_pre_key_id: random_offset(rng),
            active_last_resort_kyber_pre_key_id: None,
        }
    }

    /// Next id `stream` will accept.
    pub fn next_id(&self, stream: PreKeyStream) -> u32 {
        match stream {
            PreKeyStream::OneTime => self.next_pre_key_id,
            PreKeyStream::Signed => self.next_signed_pre_key_id,
            PreKeyStream::Kyber => self.next_kyber_pre_key_id,
        }
    }

    /// Id of the kyber pre-key currently published as last resort.
    pub fn active_last_resort_kyber_pre_key_id(&self) -> Option<u32> {
        self.active_last_resort_kyber_pre_key_id
    }

    /// Overwrite a stream's next id, reducing it into the id space.
    ///
    /// Used when adopting ids agreed with the service and when restoring
    /// persisted state.
    pub fn set_next_id(&mut self, stream: PreKeyStream, id: u32) {
        let id = id % PREKEY_MAXIMUM_ID;
        match stream {
            PreKeyStream::OneTime => self.next_pre_key_id = id,
            PreKeyStream::Signed => self.next_signed_pre_key_id = id,
            PreKeyStream::Kyber => self.next_kyber_pre_key_id = id,
        }
    }

    /// Overwrite the active last-resort id.
    pub fn set_active_last_resort_kyber_pre_key_id(&mut self, id: Option<u32>) {
        self.active_last_resort_kyber_pre_key_id = id;
    }

    /// Reseed the one-time and signed streams.
    ///
    /// Each new offset differs from the stream's previous next-id, so the
    /// very next allocation never lands on the id the old window would
    /// have used.
    pub fn reset_offsets<R: Rng>(&mut self, rng: &mut R) {
        self.next_pre_key_id = fresh_offset(rng, self.next_pre_key_id);
        self.next_signed_pre_key_id = fresh_offset(rng, self.next_signed_pre_key_id);
    }

    /// Reseed the kyber stream and forget the active last-resort key.
    pub fn reset_kyber_offsets<R: Rng>(&mut self, rng: &mut R) {
        self.next_kyber_pre_key_id = fresh_offset(rng, self.next_kyber_pre_key_id);
        self.active_last_resort_kyber_pre_key_id = None;
    }

    /// Check that `ids` continue `stream` exactly, in order.
    ///
    /// Does not modify the allocator. On success returns the number of ids
    /// checked; pass it to [`Self::advance`] once the records are stored.
    ///
    /// # Errors
    ///
    /// `IdDesync` naming the first id that breaks the sequence.
    pub fn check_batch<I>(&self, stream: PreKeyStream, ids: I) -> Result<u32, IdDesync>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut expected = self.next_id(stream);
        let mut count = 0u32;
        for got in ids {
            if got != expected {
                return Err(IdDesync { stream, expected, got });
            }
            expected = (expected + 1) % PREKEY_MAXIMUM_ID;
            count += 1;
        }
        Ok(count)
    }

    /// Advance `stream` past `count` accepted ids.
    pub fn advance(&mut self, stream: PreKeyStream, count: u32) {
        let next = ((u64::from(self.next_id(stream)) + u64::from(count))
            % u64::from(PREKEY_MAXIMUM_ID)) as u32;
        self.set_next_id(stream, next);
    }
}
