//! Decides which images and blobs a payload has to carry.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use ociclient::{ImageReference, OciDigest};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::manifest::{self, Blob};
use crate::registry::Registry;

/// One requested image and what happens to it.
#[derive(Debug, Clone)]
pub enum PlannedImage {
    /// The manifest and its missing blobs go into the payload.
    Transfer {
        reference: ImageReference,
        manifest: Bytes,
        blobs: Vec<OciDigest>,
    },
    /// The destination already has the image.
    Skip(ImageReference),
}

impl PlannedImage {
    pub fn reference(&self) -> &ImageReference {
        match self {
            PlannedImage::Transfer { reference, .. } | PlannedImage::Skip(reference) => reference,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Requested images, in request order, each listed once.
    pub images: Vec<PlannedImage>,
    /// Distinct blobs to copy into the payload, in first-seen order. The
    /// repository is the source repository to pull from.
    pub blobs_to_write: Vec<Blob>,
    /// Blobs needed by transferred images that the destination already holds.
    /// The repository is the destination repository known to have it.
    pub reused_blobs: Vec<Blob>,
}

impl Plan {
    pub fn transferred(&self) -> impl Iterator<Item = &ImageReference> {
        self.images.iter().filter_map(|image| match image {
            PlannedImage::Transfer { reference, .. } => Some(reference),
            PlannedImage::Skip(_) => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = &ImageReference> {
        self.images.iter().filter_map(|image| match image {
            PlannedImage::Skip(reference) => Some(reference),
            PlannedImage::Transfer { .. } => None,
        })
    }
}

/// Parse a comma separated list of image references. Blank items are ignored.
pub fn parse_image_list(list: &str) -> Result<Vec<ImageReference>> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.parse::<ImageReference>().map_err(Error::from))
        .collect()
}

// source registry failures, not found included, surface as transport errors
async fn fetch_manifest<R>(registry: &R, reference: &ImageReference) -> Result<Bytes>
where
    R: Registry + ?Sized,
{
    Ok(registry
        .get_manifest(&reference.name, &reference.tag)
        .await?)
}

/// Plan a payload.
///
/// Images in both lists are skipped. Manifests of already transferred images
/// are fetched only to learn which blobs the destination holds; those blobs
/// are never written to the payload.
pub async fn plan<R>(
    registry: &R,
    to_transfer: &[ImageReference],
    already_transferred: &[ImageReference],
) -> Result<Plan>
where
    R: Registry + ?Sized,
{
    let mut present: HashMap<OciDigest, String> = HashMap::new();
    for reference in already_transferred {
        let content = fetch_manifest(registry, reference).await?;
        for digest in manifest::parse_blobs(&content)? {
            present
                .entry(digest)
                .or_insert_with(|| reference.name.clone());
        }
    }
    let skip: HashSet<&ImageReference> = already_transferred.iter().collect();

    let mut plan = Plan::default();
    let mut requested = HashSet::new();
    let mut seen_blobs = HashSet::new();

    for reference in to_transfer {
        if !requested.insert(reference) {
            debug!(%reference, "Image requested twice");
            continue;
        }
        if skip.contains(reference) {
            info!("Skipping {reference}, already transferred");
            plan.images.push(PlannedImage::Skip(reference.clone()));
            continue;
        }

        let content = fetch_manifest(registry, reference).await?;
        let blobs = manifest::parse_blobs(&content)?;
        for digest in &blobs {
            if !seen_blobs.insert(digest.clone()) {
                continue;
            }
            match present.get(digest) {
                Some(repository) => plan
                    .reused_blobs
                    .push(Blob::new(digest.clone(), repository.as_str())),
                None => plan
                    .blobs_to_write
                    .push(Blob::new(digest.clone(), reference.name.as_str())),
            }
        }
        plan.images.push(PlannedImage::Transfer {
            reference: reference.clone(),
            manifest: content,
            blobs,
        });
    }

    debug!(
        images = plan.images.len(),
        to_write = plan.blobs_to_write.len(),
        reused = plan.reused_blobs.len(),
        "Payload planned"
    );
    Ok(plan)
}
