//! Filesystem artifact store.
//!
//! Objects live at `<root>/objects/<hex[..2]>/<hex[2..]>`. A blob is written
//! to a temp file in its shard and renamed into place, so a reader sees either
//! nothing or the whole object. Existing objects are never rewritten: two
//! sibling instances storing the same context package race harmlessly.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::trace;

use super::{ArtifactError, ArtifactStore, Digest, Result};

#[derive(Debug)]
pub struct FsArtifactStore {
    objects: PathBuf,
}

impl FsArtifactStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let objects = root.as_ref().join("objects");
        fs::create_dir_all(&objects)?;
        Ok(Self { objects })
    }

    /// Shard directory and object path for `digest`.
    fn locate(&self, digest: &Digest) -> (PathBuf, PathBuf) {
        let hex = digest.to_hex();
        let (shard, rest) = hex.split_at(2);
        let dir = self.objects.join(shard);
        let file = dir.join(rest);
        (dir, file)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::compute(data);
        let (dir, file) = self.locate(&digest);
        if file.exists() {
            trace!(digest = %digest, "artifact already stored");
            return Ok(digest);
        }

        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_data()?;
        tmp.persist(&file).map_err(|e| ArtifactError::Io(e.error))?;
        trace!(digest = %digest, bytes = data.len(), "artifact stored");
        Ok(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let (_, file) = self.locate(digest);
        match fs::read(&file) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ArtifactError::NotFound(*digest)),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.locate(digest).1.is_file())
    }
}
