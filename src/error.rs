use config::ConfigError;
use ociclient::image_reference::ImageReferenceError;
use ociclient::{ClientError, ImageReference};
use thiserror::Error;
use zip::result::ZipError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("Docker image {0} was expected in the registry but could not be found")]
    ManifestNotFound(ImageReference),

    #[error("Registry error: {0}")]
    Transport(#[from] ClientError),

    #[error("Archive error: {0}")]
    Archive(#[from] ZipError),

    #[error("Invalid payload descriptor: {0}")]
    Descriptor(String),

    #[error("Payload has no entry named {0}")]
    MissingEntry(String),

    #[error(transparent)]
    InvalidReference(#[from] ImageReferenceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
