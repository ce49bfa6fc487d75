//! Local identity persisted as a bincode blob in the data directory.

use std::path::{Path, PathBuf};

use nearby_core::{IdentityError, IdentityStore, LocalIdentity};

/// Fixed file name under the data directory.
pub const IDENTITY_FILE: &str = "identity.bin";

pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(IDENTITY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for FileIdentityStore {
    fn load_local_identity(&self) -> Result<Option<LocalIdentity>, IdentityError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => LocalIdentity::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IdentityError::Store(format!("{}: {e}", self.path.display()))),
        }
    }

    fn save_local_identity(&mut self, identity: &LocalIdentity) -> Result<(), IdentityError> {
        let store_err = |e: std::io::Error| IdentityError::Store(format!("{}: {e}", self.path.display()));
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(store_err)?;
        }
        let bytes = identity.to_bytes()?;
        // Write then rename so a crash never leaves a truncated identity.
        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, bytes).map_err(store_err)?;
        std::fs::rename(&tmp, &self.path).map_err(store_err)?;
        Ok(())
    }
}
