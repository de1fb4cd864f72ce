//! Zip container holding a payload: blobs, manifests and the descriptor.

use std::collections::HashSet;
use std::io::{Read, Seek, Write};

use indicatif::ProgressBar;
use ociclient::{BlobStream, ImageReference, OciDigest};
use tracing::debug;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::descriptor::PayloadDescriptor;
use crate::error::{Error, Result};
use crate::pump;

pub const DESCRIPTOR_PATH: &str = "payload_descriptor.json";
const BLOBS_DIR: &str = "blobs";
const MANIFESTS_DIR: &str = "manifests";
/// Upper bound on the buffer reserved up front for a small entry. The size
/// in the entry header is not trusted beyond this.
const MAX_PREALLOC: u64 = 64 * 1024;

pub fn blob_path(digest: &OciDigest) -> String {
    format!("{BLOBS_DIR}/{digest}")
}

/// Archive path of an image's manifest. Every character that is not an ASCII
/// letter, digit, `.` or `-` becomes `_`, so `team/app:1.0` is stored as
/// `manifests/team_app_1.0`.
pub fn manifest_path(reference: &ImageReference) -> String {
    let flat: String = reference
        .to_string()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{MANIFESTS_DIR}/{flat}")
}

/// Writes a payload. Each entry name is written at most once.
pub struct PayloadWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    names: HashSet<String>,
}

impl<W: Write + Seek> PayloadWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            zip: ZipWriter::new(out),
            names: HashSet::new(),
        }
    }

    /// Stream a blob into `blobs/<digest>`. Blobs are already compressed
    /// layers, so they are stored as-is, with zip64 headers for large entries.
    /// Returns `false` if the blob was already in the payload.
    pub async fn add_blob(
        &mut self,
        digest: &OciDigest,
        data: BlobStream<'_>,
        progress: &ProgressBar,
    ) -> Result<bool> {
        let path = blob_path(digest);
        if !self.names.insert(path.clone()) {
            debug!(%digest, "Blob already in payload");
            return Ok(false);
        }
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(true);
        self.zip.start_file(path.as_str(), options)?;
        let written = pump::copy_to_writer(data, &mut self.zip, progress).await?;
        debug!(%digest, written, "Blob written to payload");
        Ok(true)
    }

    /// Store a manifest and return the path it was stored under. Two
    /// references flattening to the same name get a numeric suffix.
    pub fn add_manifest(&mut self, reference: &ImageReference, content: &[u8]) -> Result<String> {
        let base = manifest_path(reference);
        let mut path = base.clone();
        let mut suffix = 1;
        while self.names.contains(&path) {
            path = format!("{base}_{suffix}");
            suffix += 1;
        }
        self.write_small(&path, content)?;
        Ok(path)
    }

    /// Write the descriptor and close the archive.
    pub fn finish(mut self, descriptor: &PayloadDescriptor) -> Result<W> {
        let json = descriptor.to_json()?;
        self.write_small(DESCRIPTOR_PATH, &json)?;
        Ok(self.zip.finish()?)
    }

    fn write_small(&mut self, path: &str, content: &[u8]) -> Result<()> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        self.zip.start_file(path, options)?;
        self.zip.write_all(content)?;
        self.names.insert(path.to_string());
        Ok(())
    }
}

/// Reads a payload by entry name.
pub struct PayloadReader<R: Read + Seek> {
    zip: ZipArchive<R>,
}

impl<R: Read + Seek> PayloadReader<R> {
    pub fn new(input: R) -> Result<Self> {
        Ok(Self {
            zip: ZipArchive::new(input)?,
        })
    }

    pub fn descriptor(&mut self) -> Result<PayloadDescriptor> {
        let content = self
            .read_entry(DESCRIPTOR_PATH)?
            .ok_or_else(|| Error::MissingEntry(DESCRIPTOR_PATH.to_string()))?;
        PayloadDescriptor::from_json(&content)
    }

    /// Whole content of a small entry, or `None` when there is no such entry.
    pub fn read_entry(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.zip.by_name(name) {
            Ok(mut entry) => {
                let mut content = Vec::with_capacity(initial_capacity(entry.size()));
                entry.read_to_end(&mut content)?;
                Ok(Some(content))
            }
            Err(ZipError::FileNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stream an entry in bounded chunks, or `None` when there is no such entry.
    pub fn open_blob(&mut self, name: &str) -> Result<Option<BlobStream<'_>>> {
        match self.zip.by_name(name) {
            Ok(entry) => {
                let size = entry.size();
                Ok(Some(pump::read_chunks(entry, Some(size))))
            }
            Err(ZipError::FileNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of the blob entries in the payload.
    pub fn blob_entries(&self) -> Vec<String> {
        self.zip
            .file_names()
            .filter(|name| name.starts_with("blobs/"))
            .map(str::to_string)
            .collect()
    }

    /// Names of the manifest entries in the payload.
    pub fn manifest_entries(&self) -> Vec<String> {
        self.zip
            .file_names()
            .filter(|name| name.starts_with("manifests/"))
            .map(str::to_string)
            .collect()
    }
}

fn initial_capacity(declared: u64) -> usize {
    declared.min(MAX_PREALLOC) as usize
}
