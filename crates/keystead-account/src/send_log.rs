//! Log of sent message content, kept to answer resend requests.

use keystead_core::{RecipientId, StoreError};
use tracing::debug;

use crate::database::{AccountDatabase, SEND_LOG, io_err, scan_prefix};

/// One logged send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendLogEntry {
    /// Sent timestamp, milliseconds since the epoch
    pub timestamp: u64,
    /// Recipient the content was sent to
    pub recipient: RecipientId,
    /// Recipient device
    pub device_id: u32,
    /// Serialized message content
    pub content: Vec<u8>,
}

fn encode_key(timestamp: u64, recipient: RecipientId, device_id: u32) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[..8].copy_from_slice(&timestamp.to_be_bytes());
    key[8..16].copy_from_slice(&recipient.0.to_be_bytes());
    key[16..].copy_from_slice(&device_id.to_be_bytes());
    key
}

fn decode_key(key: &[u8]) -> Option<(u64, RecipientId, u32)> {
    let timestamp = u64::from_be_bytes(key.get(..8)?.try_into().ok()?);
    let recipient = u64::from_be_bytes(key.get(8..16)?.try_into().ok()?);
    let device_id = u32::from_be_bytes(key.get(16..20)?.try_into().ok()?);
    Some((timestamp, RecipientId(recipient), device_id))
}

/// Send log stored in the account database.
///
/// When disabled the log records nothing and every lookup is empty.
#[derive(Debug, Clone)]
pub struct SendLog {
    db: Option<AccountDatabase>,
}

impl SendLog {
    /// Log writing to `db`.
    pub fn new(db: AccountDatabase) -> Self {
        Self { db: Some(db) }
    }

    /// Log that records nothing.
    pub fn disabled() -> Self {
        Self { db: None }
    }

    /// Whether sends are being recorded.
    pub fn is_enabled(&self) -> bool {
        self.db.is_some()
    }

    /// Record content sent to one device.
    pub fn insert(&self, entry: &SendLogEntry) -> Result<(), StoreError> {
        let Some(db) = &self.db else { return Ok(()) };
        db.put(SEND_LOG, &encode_key(entry.timestamp, entry.recipient, entry.device_id), &entry.content)
    }

    /// Content sent to `recipient`'s device at `timestamp`.
    pub fn get(
        &self,
        recipient: RecipientId,
        device_id: u32,
        timestamp: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(db) = &self.db else { return Ok(None) };
        db.get(SEND_LOG, &encode_key(timestamp, recipient, device_id))
    }

    /// Every logged entry, oldest first.
    pub fn entries(&self) -> Result<Vec<SendLogEntry>, StoreError> {
        let Some(db) = &self.db else { return Ok(Vec::new()) };
        db.scan(SEND_LOG, &[])?
            .into_iter()
            .map(|(key, content)| {
                let (timestamp, recipient, device_id) = decode_key(&key)
                    .ok_or_else(|| StoreError::InvalidRecord("malformed key in send_log".into()))?;
                Ok(SendLogEntry { timestamp, recipient, device_id, content })
            })
            .collect()
    }

    /// Forget everything sent to `recipient`.
    pub fn delete_all_for(&self, recipient: RecipientId) -> Result<usize, StoreError> {
        self.delete_where(|_, r| r == recipient)
    }

    /// Forget entries sent before `cutoff`.
    pub fn prune_older_than(&self, cutoff: u64) -> Result<usize, StoreError> {
        let removed = self.delete_where(|timestamp, _| timestamp < cutoff)?;
        debug!(cutoff, count = removed, "pruned send log");
        Ok(removed)
    }

    fn delete_where(&self, pred: impl Fn(u64, RecipientId) -> bool) -> Result<usize, StoreError> {
        let Some(db) = &self.db else { return Ok(0) };
        db.write(|txn| {
            let mut table = txn.open_table(SEND_LOG).map_err(io_err)?;
            let doomed: Vec<Vec<u8>> = scan_prefix(&table, &[])?
                .into_iter()
                .map(|(key, _)| key)
                .filter(|key| decode_key(key).is_some_and(|(ts, r, _)| pred(ts, r)))
                .collect();
            for key in &doomed {
                table.remove(key.as_slice()).map_err(io_err)?;
            }
            Ok(doomed.len())
        })
    }
}
