use std::collections::HashMap;

use parking_lot::RwLock;

use super::{ArtifactError, ArtifactStore, Digest, Result};

/// In-process artifact store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    blobs: RwLock<HashMap<Digest, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::compute(data);
        self.blobs.write().entry(digest).or_insert_with(|| data.to_vec());
        Ok(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(digest)
            .cloned()
            .ok_or(ArtifactError::NotFound(*digest))
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blobs.read().contains_key(digest))
    }
}
