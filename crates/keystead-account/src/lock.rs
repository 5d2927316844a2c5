//! Exclusive, locked handle on the descriptor file.
//!
//! The lock is an advisory exclusive file lock (`flock` on Unix,
//! `LockFileEx` on Windows) held for as long as the account is open. Two
//! handles on the same file conflict even within one process, so a second
//! `open` of a loaded account fails fast or waits.

use std::{
    fs::{File, OpenOptions, TryLockError},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::error::AccountError;

/// An open, exclusively locked descriptor file.
///
/// # Invariants
///
/// While `file` is `Some`, this handle owns the file's exclusive lock.
#[derive(Debug)]
pub struct DescriptorFile {
    path: PathBuf,
    file: Option<File>,
}

impl DescriptorFile {
    /// Open an existing descriptor and take its lock.
    ///
    /// With `wait_for_lock` the call blocks until the current holder
    /// releases the lock; without it contention fails immediately.
    ///
    /// # Errors
    ///
    /// - `AccountError::NotFound` if the file does not exist
    /// - `AccountError::Locked` if another handle holds the lock and
    ///   `wait_for_lock` is false
    pub fn open(path: &Path, wait_for_lock: bool) -> Result<Self, AccountError> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(AccountError::NotFound { path: path.to_path_buf() });
            },
            Err(err) => return Err(err.into()),
        };
        Self::lock(path, file, wait_for_lock)
    }

    /// Create a new, empty descriptor readable only by the owner, and take
    /// its lock.
    ///
    /// # Errors
    ///
    /// `AccountError::AlreadyExists` if a file is already present.
    pub fn create(path: &Path) -> Result<Self, AccountError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = match options.open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(AccountError::AlreadyExists { path: path.to_path_buf() });
            },
            Err(err) => return Err(err.into()),
        };
        Self::lock(path, file, true)
    }

    fn lock(path: &Path, file: File, wait_for_lock: bool) -> Result<Self, AccountError> {
        match file.try_lock() {
            Ok(()) => {},
            Err(TryLockError::WouldBlock) if !wait_for_lock => {
                debug!(path = %path.display(), "account file is in use by another instance");
                return Err(AccountError::Locked { path: path.to_path_buf() });
            },
            Err(TryLockError::WouldBlock) => {
                info!(path = %path.display(), "account file is in use by another instance, waiting");
                file.lock()?;
                info!(path = %path.display(), "account file lock acquired");
            },
            Err(TryLockError::Error(err)) => return Err(err.into()),
        }
        Ok(Self { path: path.to_path_buf(), file: Some(file) })
    }

    /// Path of the descriptor.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the handle still holds the file.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "account file is closed"))
    }

    /// Read the whole file from offset 0.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Replace the file's content with `bytes` and flush it to stable
    /// storage.
    ///
    /// The caller must have fully produced `bytes` before calling; the
    /// file is not touched until then.
    pub fn overwrite(&mut self, bytes: &[u8]) -> io::Result<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(bytes)?;
        file.set_len(bytes.len() as u64)?;
        file.sync_data()
    }

    /// Release the lock and close the file. Idempotent.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = file.unlock() {
                warn!(path = %self.path.display(), %err, "failed to release account file lock");
            }
        }
    }
}

impl Drop for DescriptorFile {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::mpsc, thread, time::Duration};

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn second_open_fails_fast_while_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acct");
        let _held = DescriptorFile::create(&path).unwrap();

        let err = DescriptorFile::open(&path, false).unwrap_err();
        assert!(matches!(err, AccountError::Locked { .. }));
    }

    #[test]
    fn close_releases_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acct");
        let mut held = DescriptorFile::create(&path).unwrap();
        held.close();
        held.close();

        assert!(!held.is_open());
        assert!(DescriptorFile::open(&path, false).is_ok());
    }

    #[test]
    fn waiting_open_acquires_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acct");
        let held = DescriptorFile::create(&path).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let file = DescriptorFile::open(&waiter_path, true).unwrap();
            tx.send(()).unwrap();
            drop(file);
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn overwrite_truncates_previous_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acct");
        let mut file = DescriptorFile::create(&path).unwrap();

        file.overwrite(b"a much longer first version").unwrap();
        file.overwrite(b"short").unwrap();

        assert_eq!(file.read_all().unwrap(), b"short");
        assert_eq!(fs::read(&path).unwrap(), b"short");
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acct");
        fs::write(&path, b"{}").unwrap();

        assert!(matches!(DescriptorFile::create(&path), Err(AccountError::AlreadyExists { .. })));
        assert!(matches!(
            DescriptorFile::open(&dir.path().join("missing"), false),
            Err(AccountError::NotFound { .. })
        ));
    }
}
