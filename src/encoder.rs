use std::io::{Seek, Write};

use ociclient::ImageReference;
use tracing::info;

use crate::archive::{self, PayloadWriter};
use crate::descriptor::{BlobLocation, PayloadDescriptor};
use crate::error::Result;
use crate::planner::{self, Plan, PlannedImage};
use crate::pump;
use crate::registry::Registry;

/// Write the payload for `plan` into `out` and hand `out` back.
///
/// Blobs are streamed from the source registry one at a time. Any failure
/// aborts the whole payload.
pub async fn encode<R, W>(registry: &R, plan: &Plan, out: W) -> Result<W>
where
    R: Registry + ?Sized,
    W: Write + Seek,
{
    let mut writer = PayloadWriter::new(out);
    let mut descriptor = PayloadDescriptor::new();
    info!(
        "Packing {} images, skipping {} already transferred",
        plan.transferred().count(),
        plan.skipped().count()
    );

    let total = plan.blobs_to_write.len();
    for (i, blob) in plan.blobs_to_write.iter().enumerate() {
        let message = format!("[{}/{total}] Pulling blob {blob}", i + 1);
        info!("{message}");
        let data = registry.pull_blob(&blob.repository, &blob.digest).await?;
        let progress = pump::progress_bar(message);
        writer.add_blob(&blob.digest, data, &progress).await?;
        progress.finish_and_clear();
        descriptor.add_blob(
            blob.digest.clone(),
            BlobLocation::InArchive {
                path: archive::blob_path(&blob.digest),
            },
        );
    }

    for blob in &plan.reused_blobs {
        info!("Skipping blob {}, already in {}", blob.digest, blob.repository);
        descriptor.add_blob(
            blob.digest.clone(),
            BlobLocation::InRepository {
                repository: blob.repository.clone(),
            },
        );
    }

    for image in &plan.images {
        match image {
            PlannedImage::Transfer {
                reference,
                manifest,
                ..
            } => {
                let path = writer.add_manifest(reference, manifest)?;
                info!("Added manifest of {reference} as {path}");
                descriptor.add_manifest(reference.clone(), Some(path));
            }
            PlannedImage::Skip(reference) => {
                descriptor.add_manifest(reference.clone(), None);
            }
        }
    }

    writer.finish(&descriptor)
}

/// Plan and encode in one go.
pub async fn make_payload<R, W>(
    registry: &R,
    to_transfer: &[ImageReference],
    already_transferred: &[ImageReference],
    out: W,
) -> Result<W>
where
    R: Registry + ?Sized,
    W: Write + Seek,
{
    let plan = planner::plan(registry, to_transfer, already_transferred).await?;
    encode(registry, &plan, out).await
}
