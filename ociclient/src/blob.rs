use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{self, LocalBoxStream, Stream, StreamExt};

/// A blob body flowing between a registry and some other byte sink or source.
///
/// The stream yields the blob in chunks so that no caller ever needs the whole
/// blob in memory. `size` is the advertised length when the producer knows it.
pub struct BlobStream<'a> {
    size: Option<u64>,
    inner: LocalBoxStream<'a, io::Result<Bytes>>,
}

impl<'a> BlobStream<'a> {
    pub fn new(size: Option<u64>, stream: impl Stream<Item = io::Result<Bytes>> + 'a) -> Self {
        Self {
            size,
            inner: stream.boxed_local(),
        }
    }

    /// A stream over content that is already in memory.
    pub fn from_bytes(content: Bytes) -> BlobStream<'static> {
        let size = content.len() as u64;
        let chunks = if content.is_empty() {
            Vec::new()
        } else {
            vec![Ok(content)]
        };
        BlobStream::new(Some(size), stream::iter(chunks))
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }
}

impl Stream for BlobStream<'_> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}
