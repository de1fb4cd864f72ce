//! The registry seam the planner, encoder and replicator talk through.

mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use ociclient::{BlobStream, Client, ClientError, OciDigest};

pub use memory::MemoryRegistry;

type Result<T> = std::result::Result<T, ClientError>;

/// Access to one registry, addressed by repository name.
///
/// A missing manifest or blob is reported as [`ClientError::NotFound`] so that
/// callers can tell it apart from transport failures. Runs are sequential, so
/// implementations need not be `Send`.
#[async_trait(?Send)]
pub trait Registry {
    async fn get_manifest(&self, repository: &str, tag: &str) -> Result<Bytes>;

    async fn set_manifest(&self, repository: &str, tag: &str, content: Bytes) -> Result<()>;

    async fn blob_exists(&self, repository: &str, digest: &OciDigest) -> Result<bool>;

    async fn pull_blob(&self, repository: &str, digest: &OciDigest) -> Result<BlobStream<'static>>;

    async fn push_blob(
        &self,
        repository: &str,
        digest: &OciDigest,
        data: BlobStream<'_>,
    ) -> Result<()>;
}

#[async_trait(?Send)]
impl Registry for Client {
    async fn get_manifest(&self, repository: &str, tag: &str) -> Result<Bytes> {
        self.new_session(repository).get_manifest(tag).await
    }

    async fn set_manifest(&self, repository: &str, tag: &str, content: Bytes) -> Result<()> {
        self.new_session(repository).put_manifest(tag, content).await
    }

    async fn blob_exists(&self, repository: &str, digest: &OciDigest) -> Result<bool> {
        self.new_session(repository).blob_exists(digest).await
    }

    async fn pull_blob(&self, repository: &str, digest: &OciDigest) -> Result<BlobStream<'static>> {
        self.new_session(repository).pull_blob(digest).await
    }

    async fn push_blob(
        &self,
        repository: &str,
        digest: &OciDigest,
        data: BlobStream<'_>,
    ) -> Result<()> {
        self.new_session(repository).push_blob(digest, data).await
    }
}
