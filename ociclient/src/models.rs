use serde::{Deserialize, Serialize};

use crate::digest::OciDigest;

/// Media type of a Docker image manifest, schema 2
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Media type of an OCI image manifest
pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";

/// Represents a descriptor for a content blob in an OCI registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Digest of the referenced content
    pub digest: OciDigest,
    /// Size of the referenced content in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Represents an OCI or Docker v2 image manifest
///
/// Only the fields needed to walk the blob graph are required; anything else
/// in the document is ignored, so the raw bytes stay the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version of the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<i32>,
    /// Media type of the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Descriptor for the config blob
    pub config: Descriptor,
    /// Descriptors for the layer blobs
    pub layers: Vec<Descriptor>,
}

/// Just enough of a manifest to pick its `Content-Type` when uploading it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MediaTypeSniff {
    #[serde(default)]
    pub media_type: Option<String>,
}

impl MediaTypeSniff {
    /// Media type declared by a raw manifest, Docker v2 when it says nothing.
    pub(crate) fn of(content: &[u8]) -> String {
        serde_json::from_slice::<MediaTypeSniff>(content)
            .ok()
            .and_then(|sniff| sniff.media_type)
            .unwrap_or_else(|| DOCKER_MANIFEST_V2.to_string())
    }
}
