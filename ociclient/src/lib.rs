pub mod blob;
pub mod client;
pub mod digest;
pub mod error;
pub mod image_reference;
pub mod models;

// Re-export main client types for convenience
pub use blob::BlobStream;
pub use client::{Client, ClientSession};
pub use digest::OciDigest;
pub use error::{ClientError, Result};
pub use image_reference::ImageReference;
pub use models::{Descriptor, ImageManifest};
