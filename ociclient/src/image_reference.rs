use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for image reference parsing
#[derive(Debug, Error)]
pub enum ImageReferenceError {
    #[error("Invalid image reference format: {0}")]
    InvalidFormat(String),
}

/// Represents an OCI image reference within a single registry.
///
/// The registry host is never part of the reference: every reference handled
/// by one client points at the same registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference {
    /// Repository name, possibly with `/` separated namespaces
    pub name: String,
    /// Tag
    pub tag: String,
}

impl ImageReference {
    /// Create a new ImageReference
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.contains("//")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/'))
}

impl FromStr for ImageReference {
    type Err = ImageReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Parse image reference in the format: name[:tag]
        let s = s.trim();
        if s.contains('@') {
            return Err(ImageReferenceError::InvalidFormat(format!(
                "{s} (digest references are not supported, use a tag)"
            )));
        }

        // A ':' only separates the tag when nothing after it is a path segment
        let (name, tag) = match s.rfind(':') {
            Some(idx) if !s[idx..].contains('/') => (&s[..idx], &s[idx + 1..]),
            _ => (s, "latest"),
        };

        if !valid_name(name) || !valid_tag(tag) {
            return Err(ImageReferenceError::InvalidFormat(s.to_string()));
        }

        Ok(ImageReference::new(name, tag))
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl serde::Serialize for ImageReference {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ImageReference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ImageReference::from_str(&s).map_err(serde::de::Error::custom)
    }
}
