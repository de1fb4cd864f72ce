use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::TryStreamExt;
use ociclient::{BlobStream, ClientError, OciDigest};

use super::{Registry, Result};

#[derive(Default)]
struct State {
    manifests: HashMap<(String, String), Bytes>,
    blobs: HashMap<(String, OciDigest), Bytes>,
    pulls: HashMap<(String, OciDigest), usize>,
    pushes: HashMap<(String, OciDigest), usize>,
    existence_checks: usize,
}

/// A registry living in process memory.
///
/// Blobs are scoped per repository like on a real registry, pushed blobs are
/// checked against their digest, and every pull and push is counted so a
/// caller can see exactly which transfers happened.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a blob and return its sha256 digest.
    pub fn insert_blob(&self, repository: &str, content: impl Into<Bytes>) -> OciDigest {
        let content = content.into();
        let digest = OciDigest::sha256(&content);
        self.state()
            .blobs
            .insert((repository.to_string(), digest.clone()), content);
        digest
    }

    pub fn insert_manifest(&self, repository: &str, tag: &str, content: impl Into<Bytes>) {
        self.state()
            .manifests
            .insert((repository.to_string(), tag.to_string()), content.into());
    }

    pub fn manifest(&self, repository: &str, tag: &str) -> Option<Bytes> {
        self.state()
            .manifests
            .get(&(repository.to_string(), tag.to_string()))
            .cloned()
    }

    pub fn blob(&self, repository: &str, digest: &OciDigest) -> Option<Bytes> {
        self.state()
            .blobs
            .get(&(repository.to_string(), digest.clone()))
            .cloned()
    }

    /// Number of (repository, digest) pairs stored.
    pub fn blob_count(&self) -> usize {
        self.state().blobs.len()
    }

    pub fn pull_count(&self, repository: &str, digest: &OciDigest) -> usize {
        self.state()
            .pulls
            .get(&(repository.to_string(), digest.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn push_count(&self, repository: &str, digest: &OciDigest) -> usize {
        self.state()
            .pushes
            .get(&(repository.to_string(), digest.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_pulls(&self) -> usize {
        self.state().pulls.values().sum()
    }

    pub fn total_pushes(&self) -> usize {
        self.state().pushes.values().sum()
    }

    pub fn existence_checks(&self) -> usize {
        self.state().existence_checks
    }
}

#[async_trait(?Send)]
impl Registry for MemoryRegistry {
    async fn get_manifest(&self, repository: &str, tag: &str) -> Result<Bytes> {
        self.manifest(repository, tag)
            .ok_or_else(|| ClientError::NotFound(format!("manifest {repository}:{tag}")))
    }

    async fn set_manifest(&self, repository: &str, tag: &str, content: Bytes) -> Result<()> {
        self.insert_manifest(repository, tag, content);
        Ok(())
    }

    async fn blob_exists(&self, repository: &str, digest: &OciDigest) -> Result<bool> {
        let mut state = self.state();
        state.existence_checks += 1;
        Ok(state
            .blobs
            .contains_key(&(repository.to_string(), digest.clone())))
    }

    async fn pull_blob(&self, repository: &str, digest: &OciDigest) -> Result<BlobStream<'static>> {
        let key = (repository.to_string(), digest.clone());
        let mut state = self.state();
        let content = state
            .blobs
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("blob {digest} in {repository}")))?;
        *state.pulls.entry(key).or_default() += 1;
        Ok(BlobStream::from_bytes(content))
    }

    async fn push_blob(
        &self,
        repository: &str,
        digest: &OciDigest,
        data: BlobStream<'_>,
    ) -> Result<()> {
        let content = data
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?
            .freeze();

        if !digest.verify(&content) {
            return Err(ClientError::DigestMismatch {
                expected: digest.to_string(),
                actual: OciDigest::sha256(&content).to_string(),
            });
        }

        let key = (repository.to_string(), digest.clone());
        let mut state = self.state();
        state.blobs.insert(key.clone(), content);
        *state.pushes.entry(key).or_default() += 1;
        Ok(())
    }
}
