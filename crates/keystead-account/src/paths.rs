//! Account path helpers.
//!
//! An account `<id>` under a data directory consists of the descriptor
//! file `<data>/<id>` and a private directory `<data>/<id>.d/` holding the
//! database, the message cache and any legacy artifacts.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use keystead_core::IdentityRole;

const ACCOUNT_DIR_SUFFIX: &str = ".d";
const DATABASE_FILENAME: &str = "account.db";
const MESSAGE_CACHE_DIRNAME: &str = "msg-cache";
const STORAGE_MANIFEST_FILENAME: &str = "storage-manifest";

const LEGACY_GROUP_CACHE_DIRNAME: &str = "group-cache";
const LEGACY_ACI_PRE_KEYS_DIRNAME: &str = "pre-keys";
const LEGACY_ACI_SIGNED_PRE_KEYS_DIRNAME: &str = "signed-pre-keys";
const LEGACY_PNI_PRE_KEYS_DIRNAME: &str = "pre-keys-pni";
const LEGACY_PNI_SIGNED_PRE_KEYS_DIRNAME: &str = "signed-pre-keys-pni";
const LEGACY_IDENTITIES_DIRNAME: &str = "identities";
const LEGACY_SESSIONS_DIRNAME: &str = "sessions";
const LEGACY_SENDER_KEYS_DIRNAME: &str = "sender-keys";
const LEGACY_SHARED_SENDER_KEYS_FILENAME: &str = "shared-sender-keys-store";
const LEGACY_RECIPIENTS_STORE_FILENAME: &str = "recipients-store";

/// Paths of one account's on-disk artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPaths {
    data_dir: PathBuf,
    account_id: String,
}

impl AccountPaths {
    /// Paths for `account_id` under `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl AsRef<Path>, account_id: impl Into<String>) -> Self {
        Self { data_dir: data_dir.as_ref().to_path_buf(), account_id: account_id.into() }
    }

    /// Data directory shared by all accounts.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Account id, the descriptor's file name.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// The descriptor file.
    #[must_use]
    pub fn descriptor_file(&self) -> PathBuf {
        self.data_dir.join(&self.account_id)
    }

    /// The account's private directory.
    #[must_use]
    pub fn account_dir(&self) -> PathBuf {
        self.data_dir.join(format!("{}{ACCOUNT_DIR_SUFFIX}", self.account_id))
    }

    /// The sub-store database.
    #[must_use]
    pub fn database_file(&self) -> PathBuf {
        self.account_dir().join(DATABASE_FILENAME)
    }

    /// Cached undecrypted messages.
    #[must_use]
    pub fn message_cache_dir(&self) -> PathBuf {
        self.account_dir().join(MESSAGE_CACHE_DIRNAME)
    }

    /// Last storage-service manifest.
    #[must_use]
    pub fn storage_manifest_file(&self) -> PathBuf {
        self.account_dir().join(STORAGE_MANIFEST_FILENAME)
    }

    /// Legacy cached V2 group states.
    #[must_use]
    pub fn group_cache_dir(&self) -> PathBuf {
        self.account_dir().join(LEGACY_GROUP_CACHE_DIRNAME)
    }

    /// Legacy one-time pre-key directory of a role.
    #[must_use]
    pub fn pre_keys_dir(&self, role: IdentityRole) -> PathBuf {
        self.account_dir().join(match role {
            IdentityRole::Aci => LEGACY_ACI_PRE_KEYS_DIRNAME,
            IdentityRole::Pni => LEGACY_PNI_PRE_KEYS_DIRNAME,
        })
    }

    /// Legacy signed pre-key directory of a role.
    #[must_use]
    pub fn signed_pre_keys_dir(&self, role: IdentityRole) -> PathBuf {
        self.account_dir().join(match role {
            IdentityRole::Aci => LEGACY_ACI_SIGNED_PRE_KEYS_DIRNAME,
            IdentityRole::Pni => LEGACY_PNI_SIGNED_PRE_KEYS_DIRNAME,
        })
    }

    /// Legacy identity directory.
    #[must_use]
    pub fn identities_dir(&self) -> PathBuf {
        self.account_dir().join(LEGACY_IDENTITIES_DIRNAME)
    }

    /// Legacy session directory.
    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.account_dir().join(LEGACY_SESSIONS_DIRNAME)
    }

    /// Legacy sender-key directory.
    #[must_use]
    pub fn sender_keys_dir(&self) -> PathBuf {
        self.account_dir().join(LEGACY_SENDER_KEYS_DIRNAME)
    }

    /// Legacy shared sender-key file.
    #[must_use]
    pub fn shared_sender_keys_file(&self) -> PathBuf {
        self.account_dir().join(LEGACY_SHARED_SENDER_KEYS_FILENAME)
    }

    /// Legacy recipient store file.
    #[must_use]
    pub fn recipients_store_file(&self) -> PathBuf {
        self.account_dir().join(LEGACY_RECIPIENTS_STORE_FILENAME)
    }

    /// Create the private account directory if missing.
    pub fn ensure_account_dir(&self) -> io::Result<PathBuf> {
        let dir = self.account_dir();
        create_private_dir(&dir)?;
        Ok(dir)
    }
}

/// Create `dir` and its parents, readable only by the owner on unix.
pub(crate) fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// Write `bytes` to a sibling temporary file, then rename it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = PathBuf::from(format!("{}.tmp", path.to_string_lossy()));
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)
}

/// Remove a file or directory tree, tolerating its absence.
pub(crate) fn remove_path(path: &Path) -> io::Result<()> {
    let result = if path.is_dir() { fs::remove_dir_all(path) } else { fs::remove_file(path) };
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_at_account_dir() {
        let paths = AccountPaths::new("/data", "+15550001");

        assert_eq!(paths.descriptor_file(), PathBuf::from("/data/+15550001"));
        assert_eq!(paths.account_dir(), PathBuf::from("/data/+15550001.d"));
        assert_eq!(paths.database_file(), PathBuf::from("/data/+15550001.d/account.db"));
        assert_eq!(
            paths.pre_keys_dir(IdentityRole::Pni),
            PathBuf::from("/data/+15550001.d/pre-keys-pni")
        );
        assert_eq!(
            paths.signed_pre_keys_dir(IdentityRole::Aci),
            PathBuf::from("/data/+15550001.d/signed-pre-keys")
        );
    }

    #[test]
    fn remove_tolerates_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        remove_path(&dir.path().join("nothing-here")).unwrap();

        let nested = dir.path().join("a/b");
        create_private_dir(&nested).unwrap();
        remove_path(&dir.path().join("a")).unwrap();
        assert!(!dir.path().join("a").exists());
    }
}
