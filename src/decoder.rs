use std::collections::HashSet;
use std::io::{Read, Seek};

use bytes::Bytes;
use ociclient::{ImageReference, OciDigest};
use tracing::{debug, info, warn};

use crate::archive::PayloadReader;
use crate::descriptor::{BlobLocation, PayloadDescriptor};
use crate::error::{Error, Result};
use crate::manifest::{self, Blob};
use crate::registry::Registry;

/// Replay a payload into `registry`.
///
/// Images are handled in descriptor order. A transferred image gets all of its
/// blobs pushed before its manifest is committed. A skipped image is only
/// checked for presence: when it is missing, `strict` turns the warning into
/// [`Error::ManifestNotFound`]. Without `strict` the image is still reported.
///
/// Returns the image references now available at the destination.
pub async fn replicate<R, P>(registry: &R, input: P, strict: bool) -> Result<Vec<ImageReference>>
where
    R: Registry + ?Sized,
    P: Read + Seek,
{
    let mut payload = PayloadReader::new(input)?;
    let descriptor = payload.descriptor()?;
    info!(
        "Payload holds {} manifests and {} blobs",
        payload.manifest_entries().len(),
        payload.blob_entries().len()
    );
    let mut replicator = Replicator {
        registry,
        payload: &mut payload,
        descriptor: &descriptor,
        pushed: HashSet::new(),
    };

    let mut replicated = Vec::new();
    for (reference, path) in descriptor.manifests() {
        match path {
            None => replicator.verify_present(reference, strict).await?,
            Some(path) => replicator.push_image(reference, path).await?,
        }
        replicated.push(reference.clone());
    }
    Ok(replicated)
}

struct Replicator<'a, R: ?Sized, P: Read + Seek> {
    registry: &'a R,
    payload: &'a mut PayloadReader<P>,
    descriptor: &'a PayloadDescriptor,
    // blobs this run has already put in place
    pushed: HashSet<Blob>,
}

impl<R, P> Replicator<'_, R, P>
where
    R: Registry + ?Sized,
    P: Read + Seek,
{
    async fn verify_present(&self, reference: &ImageReference, strict: bool) -> Result<()> {
        match self
            .registry
            .get_manifest(&reference.name, &reference.tag)
            .await
        {
            Ok(_) => {
                info!("Skipping {reference}, already transferred");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                if strict {
                    Err(Error::ManifestNotFound(reference.clone()))
                } else {
                    warn!(
                        "The docker image {reference} was not found in the registry, it was \
                         expected to be there already"
                    );
                    Ok(())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn push_image(&mut self, reference: &ImageReference, path: &str) -> Result<()> {
        let content = self
            .payload
            .read_entry(path)?
            .ok_or_else(|| Error::MissingEntry(path.to_string()))?;
        let blobs = manifest::blobs_of(&reference.name, &content)?;

        let total = blobs.len();
        for (i, blob) in blobs.into_iter().enumerate() {
            if self.pushed.contains(&blob) {
                debug!(%blob, "Blob already pushed during this run");
                continue;
            }
            info!("[{}/{total}] Pushing blob {blob}", i + 1);
            self.put_blob(&blob).await?;
            self.pushed.insert(blob);
        }

        // every blob is in place, the manifest can be committed
        self.registry
            .set_manifest(&reference.name, &reference.tag, Bytes::from(content))
            .await?;
        info!("Pushed manifest of {reference}");
        Ok(())
    }

    async fn put_blob(&mut self, blob: &Blob) -> Result<()> {
        match self.descriptor.blob_location(&blob.digest) {
            BlobLocation::InArchive { path } => {
                match self.payload.open_blob(&path)? {
                    Some(data) => {
                        self.registry
                            .push_blob(&blob.repository, &blob.digest, data)
                            .await?
                    }
                    None => debug!(%blob, %path, "Blob not in payload, assuming it was pushed"),
                }
            }
            BlobLocation::InRepository { repository } => {
                self.copy_from(&repository, &blob.repository, &blob.digest)
                    .await?
            }
        }
        Ok(())
    }

    /// Copy a blob between two repositories of the destination registry,
    /// unless the target already has it.
    async fn copy_from(&self, source: &str, target: &str, digest: &OciDigest) -> Result<()> {
        if self.registry.blob_exists(target, digest).await? {
            debug!(%digest, target, "Blob already in target repository");
            return Ok(());
        }
        info!("Copying blob {digest} from {source} to {target}");
        let data = self.registry.pull_blob(source, digest).await?;
        self.registry.push_blob(target, digest, data).await?;
        Ok(())
    }
}
