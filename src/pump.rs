//! Bounded-buffer copies between blob streams and synchronous readers/writers.

use std::io::{self, Read, Write};

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ociclient::BlobStream;
use tracing::trace;

pub const CHUNK_SIZE: usize = 32 * 1024;

/// Expose a reader as a [`BlobStream`] of at most [`CHUNK_SIZE`] byte chunks.
pub fn read_chunks<'a, R>(reader: R, size: Option<u64>) -> BlobStream<'a>
where
    R: Read + 'a,
{
    let chunks = stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        let mut buf = BytesMut::zeroed(CHUNK_SIZE);
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => {
                    buf.truncate(n);
                    return Some((Ok(buf.freeze()), Some(reader)));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // stop after yielding the error
                Err(e) => return Some((Err(e), None)),
            }
        }
    });
    BlobStream::new(size, chunks)
}

/// Drain a blob stream into `writer`, returning the number of bytes copied.
pub async fn copy_to_writer<W>(
    mut data: BlobStream<'_>,
    writer: &mut W,
    progress: &ProgressBar,
) -> io::Result<u64>
where
    W: Write + ?Sized,
{
    if let Some(size) = data.size() {
        progress.set_length(size);
    }
    let mut copied = 0u64;
    while let Some(chunk) = data.next().await {
        let chunk: Bytes = chunk?;
        writer.write_all(&chunk)?;
        copied += chunk.len() as u64;
        progress.inc(chunk.len() as u64);
        trace!(bytes = chunk.len(), total = copied, "Copied chunk");
    }
    writer.flush()?;
    Ok(copied)
}

/// A byte progress bar on stderr, hidden when stderr is not a terminal.
pub fn progress_bar(message: String) -> ProgressBar {
    let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    ) {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar.set_message(message);
    bar
}
