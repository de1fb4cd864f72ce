use std::fmt;

use ociclient::{ImageManifest, OciDigest};

use crate::error::{Error, Result};

/// A blob as seen from one repository.
///
/// Two blobs hold the same content when their digests match, but a registry
/// stores blobs per repository, so the repository is part of what gets moved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Blob {
    pub digest: OciDigest,
    pub repository: String,
}

impl Blob {
    pub fn new(digest: OciDigest, repository: impl Into<String>) -> Self {
        Self {
            digest,
            repository: repository.into(),
        }
    }
}

impl fmt::Display for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repository, self.digest)
    }
}

/// List the blobs a manifest references: the config first, then every layer
/// in manifest order. Repeated digests are kept.
pub fn parse_blobs(content: &[u8]) -> Result<Vec<OciDigest>> {
    let manifest: ImageManifest = serde_json::from_slice(content)
        .map_err(|e| Error::MalformedManifest(e.to_string()))?;

    let mut blobs = Vec::with_capacity(manifest.layers.len() + 1);
    blobs.push(manifest.config.digest);
    blobs.extend(manifest.layers.into_iter().map(|layer| layer.digest));
    Ok(blobs)
}

/// [`parse_blobs`], scoped to the repository the manifest belongs to.
pub fn blobs_of(repository: &str, content: &[u8]) -> Result<Vec<Blob>> {
    Ok(parse_blobs(content)?
        .into_iter()
        .map(|digest| Blob::new(digest, repository))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(seed: &str) -> OciDigest {
        OciDigest::sha256(seed.as_bytes())
    }

    fn manifest(config: &OciDigest, layers: &[&OciDigest]) -> String {
        let layers: Vec<String> = layers
            .iter()
            .map(|d| format!(r#"{{"mediaType":"application/vnd.docker.image.rootfs.diff.tar.gzip","size":1,"digest":"{d}"}}"#))
            .collect();
        format!(
            r#"{{"schemaVersion":2,"config":{{"size":1,"digest":"{config}"}},"layers":[{}]}}"#,
            layers.join(",")
        )
    }

    #[test]
    fn config_comes_first_then_layers_in_order() {
        let (config, l1, l2) = (digest("config"), digest("l1"), digest("l2"));
        let blobs = parse_blobs(manifest(&config, &[&l1, &l2]).as_bytes()).unwrap();
        assert_eq!(blobs, vec![config, l1, l2]);
    }

    #[test]
    fn repeated_layers_are_preserved() {
        let (config, empty) = (digest("config"), digest(""));
        let blobs = parse_blobs(manifest(&config, &[&empty, &empty]).as_bytes()).unwrap();
        assert_eq!(blobs.len(), 3);
        assert_eq!(blobs[1], blobs[2]);
    }

    #[test]
    fn blobs_of_scopes_to_repository() {
        let config = digest("config");
        let blobs = blobs_of("team/app", manifest(&config, &[]).as_bytes()).unwrap();
        assert_eq!(blobs, vec![Blob::new(config.clone(), "team/app")]);
        assert_eq!(blobs[0].to_string(), format!("team/app/{config}"));
    }

    #[test]
    fn malformed_manifests_are_rejected() {
        let config = digest("config");
        let cases = [
            "not json".to_string(),
            r#"{"layers":[]}"#.to_string(),
            format!(r#"{{"config":{{"digest":"{config}"}}}}"#),
            format!(r#"{{"config":{{"digest":"{config}"}},"layers":[{{"size":3}}]}}"#),
            r#"{"config":{"digest":"sha256:nothex"},"layers":[]}"#.to_string(),
        ];
        for case in cases {
            assert!(
                matches!(parse_blobs(case.as_bytes()), Err(Error::MalformedManifest(_))),
                "{case} should be malformed"
            );
        }
    }
}
