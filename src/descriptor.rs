//! The payload's table of contents, stored as `payload_descriptor.json`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use ociclient::{ImageReference, OciDigest};
use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::archive;
use crate::error::{Error, Result};

/// Where the replicator finds the bytes of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlobLocation {
    /// Stored in the payload under `path`.
    InArchive { path: String },
    /// Already present at the destination, in `repository`.
    InRepository { repository: String },
}

/// Image references mapped to the archive path of their manifest, `None`
/// marking an image that was skipped because the destination already has it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadDescriptor {
    manifests: Vec<(ImageReference, Option<String>)>,
    blobs: BTreeMap<OciDigest, BlobLocation>,
}

impl PayloadDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an image. Returns `false`, leaving the descriptor untouched,
    /// when the image is already declared.
    pub fn add_manifest(&mut self, reference: ImageReference, path: Option<String>) -> bool {
        if self.manifests.iter().any(|(known, _)| *known == reference) {
            return false;
        }
        self.manifests.push((reference, path));
        true
    }

    /// Record where a blob lives. The first location recorded for a digest wins.
    pub fn add_blob(&mut self, digest: OciDigest, location: BlobLocation) -> bool {
        if self.blobs.contains_key(&digest) {
            return false;
        }
        self.blobs.insert(digest, location);
        true
    }

    /// Declared images in declaration order.
    pub fn manifests(&self) -> impl Iterator<Item = (&ImageReference, Option<&str>)> {
        self.manifests
            .iter()
            .map(|(reference, path)| (reference, path.as_deref()))
    }

    pub fn blob_locations(&self) -> &BTreeMap<OciDigest, BlobLocation> {
        &self.blobs
    }

    /// Location of a blob. A digest without an explicit entry is looked up in
    /// the archive under its conventional path, which is how descriptors
    /// without a `blobs` section are read.
    pub fn blob_location(&self, digest: &OciDigest) -> BlobLocation {
        self.blobs
            .get(digest)
            .cloned()
            .unwrap_or_else(|| BlobLocation::InArchive {
                path: archive::blob_path(digest),
            })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let document = CurrentFormatRef {
            manifests: ManifestsRef(&self.manifests),
            blobs: &self.blobs,
        };
        serde_json::to_vec_pretty(&document).map_err(|e| Error::Descriptor(e.to_string()))
    }

    /// Parse a descriptor, accepting both the current layout and the older
    /// one that is a bare `manifests` object.
    pub fn from_json(content: &[u8]) -> Result<Self> {
        let sniff: FormatSniff =
            serde_json::from_slice(content).map_err(|e| Error::Descriptor(e.to_string()))?;

        if sniff.manifests.is_some() {
            let current: CurrentFormat =
                serde_json::from_slice(content).map_err(|e| Error::Descriptor(e.to_string()))?;
            Ok(Self {
                manifests: current.manifests.0,
                blobs: current.blobs,
            })
        } else {
            let legacy: OrderedManifests =
                serde_json::from_slice(content).map_err(|e| Error::Descriptor(e.to_string()))?;
            Ok(Self {
                manifests: legacy.0,
                blobs: BTreeMap::new(),
            })
        }
    }
}

#[derive(Deserialize)]
struct FormatSniff {
    #[serde(default)]
    manifests: Option<IgnoredAny>,
}

#[derive(Deserialize)]
struct CurrentFormat {
    manifests: OrderedManifests,
    #[serde(default)]
    blobs: BTreeMap<OciDigest, BlobLocation>,
}

#[derive(Serialize)]
struct CurrentFormatRef<'a> {
    manifests: ManifestsRef<'a>,
    blobs: &'a BTreeMap<OciDigest, BlobLocation>,
}

struct ManifestsRef<'a>(&'a [(ImageReference, Option<String>)]);

impl Serialize for ManifestsRef<'_> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (reference, path) in self.0 {
            map.serialize_entry(reference, path)?;
        }
        map.end()
    }
}

// JSON object that keeps the order its keys appear in
struct OrderedManifests(Vec<(ImageReference, Option<String>)>);

impl<'de> Deserialize<'de> for OrderedManifests {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ManifestsVisitor;

        impl<'de> Visitor<'de> for ManifestsVisitor {
            type Value = OrderedManifests;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of image references to manifest paths or null")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut seen = HashSet::new();
                let mut entries = Vec::new();
                while let Some((reference, path)) =
                    access.next_entry::<ImageReference, Option<String>>()?
                {
                    if !seen.insert(reference.clone()) {
                        return Err(de::Error::custom(format!(
                            "image {reference} is declared twice"
                        )));
                    }
                    entries.push((reference, path));
                }
                Ok(OrderedManifests(entries))
            }
        }

        deserializer.deserialize_map(ManifestsVisitor)
    }
}
