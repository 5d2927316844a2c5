//! On-disk cache of envelopes that could not be processed yet.
//!
//! Layout: `msg-cache/<recipient id>/<timestamp>_<n>`, with envelopes whose
//! sender is not yet known under `msg-cache/unknown/`. Each file holds the
//! raw envelope bytes and is written under a temporary name first, so a
//! crash never leaves a partial envelope behind.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use keystead_core::RecipientId;
use tracing::{debug, warn};

use crate::paths::{create_private_dir, remove_path, write_atomic};

const UNKNOWN_SENDER_DIRNAME: &str = "unknown";

/// An envelope stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    path: PathBuf,
    envelope: Vec<u8>,
}

impl CachedMessage {
    /// Raw envelope bytes.
    pub fn envelope(&self) -> &[u8] {
        &self.envelope
    }

    /// File holding the envelope.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Envelope cache rooted at one account's `msg-cache` directory.
#[derive(Debug, Clone)]
pub struct MessageCache {
    dir: PathBuf,
}

impl MessageCache {
    /// Cache rooted at `dir`. Nothing is created until the first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn recipient_dir(&self, recipient: Option<RecipientId>) -> PathBuf {
        match recipient {
            Some(id) => self.dir.join(id.0.to_string()),
            None => self.dir.join(UNKNOWN_SENDER_DIRNAME),
        }
    }

    /// Store an envelope received at `timestamp` from `sender`, if known.
    pub fn cache(
        &self,
        sender: Option<RecipientId>,
        timestamp: u64,
        envelope: &[u8],
    ) -> io::Result<CachedMessage> {
        let dir = self.recipient_dir(sender);
        create_private_dir(&dir)?;

        let mut n = 0u32;
        let path = loop {
            let candidate = dir.join(format!("{timestamp}_{n}"));
            if !candidate.exists() {
                break candidate;
            }
            n += 1;
        };
        write_atomic(&path, envelope)?;
        Ok(CachedMessage { path, envelope: envelope.to_vec() })
    }

    /// Every cached envelope, oldest file name first within each sender.
    ///
    /// Unreadable files are logged and skipped.
    pub fn all(&self) -> io::Result<Vec<CachedMessage>> {
        let mut messages = Vec::new();
        for dir in sorted_entries(&self.dir)? {
            if !dir.is_dir() {
                continue;
            }
            for path in sorted_entries(&dir)? {
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    continue;
                }
                match fs::read(&path) {
                    Ok(envelope) => messages.push(CachedMessage { path, envelope }),
                    Err(err) => {
                        warn!(path = %path.display(), %err, "skipping unreadable cached message");
                    },
                }
            }
        }
        Ok(messages)
    }

    /// Remove one envelope after it was processed.
    pub fn remove(&self, message: &CachedMessage) -> io::Result<()> {
        remove_path(&message.path)
    }

    /// Re-file every envelope of `from` under `to`, used when two
    /// recipients turn out to be the same party.
    pub fn move_to_recipient(&self, from: RecipientId, to: RecipientId) -> io::Result<()> {
        let source = self.recipient_dir(Some(from));
        if !source.is_dir() {
            return Ok(());
        }
        let target = self.recipient_dir(Some(to));
        create_private_dir(&target)?;

        for path in sorted_entries(&source)? {
            let Some(name) = path.file_name() else { continue };
            let mut dest = target.join(name);
            let mut n = 0u32;
            while dest.exists() {
                dest = target.join(format!("{}_{n}", name.to_string_lossy()));
                n += 1;
            }
            fs::rename(&path, &dest)?;
        }
        debug!(%from, %to, "moved cached messages");
        remove_path(&source)
    }

    /// Drop every envelope of one sender.
    pub fn delete_messages(&self, recipient: RecipientId) -> io::Result<()> {
        remove_path(&self.recipient_dir(Some(recipient)))
    }

    /// Drop the whole cache.
    pub fn delete_all(&self) -> io::Result<()> {
        remove_path(&self.dir)
    }
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut paths = entries.map(|entry| entry.map(|e| e.path())).collect::<io::Result<Vec<_>>>()?;
    paths.sort();
    Ok(paths)
}
