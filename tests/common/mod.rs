#![allow(dead_code)]

use std::io::Cursor;

use bytes::Bytes;
use docker_charon::MemoryRegistry;
use docker_charon::archive::PayloadReader;
use ociclient::{ImageReference, OciDigest};

pub fn reference(s: &str) -> ImageReference {
    s.parse().unwrap()
}

pub fn references(list: &[&str]) -> Vec<ImageReference> {
    list.iter().map(|s| reference(s)).collect()
}

/// Docker v2 manifest text for a config blob and its layers.
pub fn manifest_json(config: &OciDigest, layers: &[OciDigest]) -> String {
    let layers: Vec<String> = layers
        .iter()
        .map(|digest| {
            format!(
                r#"{{"mediaType":"application/vnd.docker.image.rootfs.diff.tar.gzip","size":0,"digest":"{digest}"}}"#
            )
        })
        .collect();
    format!(
        r#"{{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json","config":{{"mediaType":"application/vnd.docker.container.image.v1+json","size":0,"digest":"{config}"}},"layers":[{}]}}"#,
        layers.join(",")
    )
}

/// Store an image made of `config` and `layers` and return its manifest and
/// the digests it references, config first.
pub fn add_image(
    registry: &MemoryRegistry,
    image: &str,
    config: &[u8],
    layers: &[&[u8]],
) -> (Bytes, Vec<OciDigest>) {
    let image = reference(image);
    let config = registry.insert_blob(&image.name, Bytes::copy_from_slice(config));
    let layers: Vec<OciDigest> = layers
        .iter()
        .map(|layer| registry.insert_blob(&image.name, Bytes::copy_from_slice(layer)))
        .collect();
    let manifest = Bytes::from(manifest_json(&config, &layers));
    registry.insert_manifest(&image.name, &image.tag, manifest.clone());

    let mut digests = vec![config];
    digests.extend(layers);
    (manifest, digests)
}

pub fn open(payload: &[u8]) -> PayloadReader<Cursor<Vec<u8>>> {
    PayloadReader::new(Cursor::new(payload.to_vec())).unwrap()
}
