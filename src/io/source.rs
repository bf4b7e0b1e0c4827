//! Source side of the streaming I/O bridge.
//!
//! A [`SourceInput`] names where bytes come from (local path, in-memory
//! buffer, byte-range-fetchable URL, live stream); a [`SourceBridge`]
//! normalizes all of them into one capability: given a byte offset, produce
//! successive chunks and expose an end-of-data flag. Seeking re-creates the
//! underlying reader at the new offset; live streams cannot seek once data
//! has been pulled.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use url::Url;

use crate::foundation::error::{ClipflowError, ClipflowResult};
use crate::graph::node::SourceId;

/// Upper bound on the size of one pulled chunk.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// A fallible stream of byte chunks.
pub type ByteStream = futures_util::stream::BoxStream<'static, ClipflowResult<Bytes>>;

/// Platform capability for byte-range access to remote sources.
///
/// Clipflow treats HTTP itself as an external collaborator; callers plug in
/// whatever fetch stack they use.
#[async_trait]
pub trait RangeFetch: Send + Sync {
    /// Total size in bytes, when the server reports one.
    async fn size(&self, url: &Url) -> ClipflowResult<Option<u64>>;

    /// Stream the resource starting at `offset`.
    async fn fetch(&self, url: &Url, offset: u64) -> ClipflowResult<ByteStream>;
}

/// Where a source's bytes come from.
pub enum SourceInput {
    /// Local file, read with random access.
    Path(PathBuf),
    /// In-memory buffer, sliced in place.
    Bytes(Bytes),
    /// Remote resource fetched in byte ranges.
    Remote {
        /// Resource location.
        url: Url,
        /// Fetch capability to use.
        fetch: Arc<dyn RangeFetch>,
    },
    /// Sequential-only live stream.
    Live(ByteStream),
    /// Stream of discrete pre-framed elements; each item is one complete
    /// encoded frame, delivered unsplit.
    Frames(ByteStream),
}

impl std::fmt::Debug for SourceInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Remote { url, .. } => f.debug_tuple("Remote").field(&url.as_str()).finish(),
            Self::Live(_) => f.write_str("Live"),
            Self::Frames(_) => f.write_str("Frames"),
        }
    }
}

impl SourceInput {
    /// Display/probing hint passed to the engine's format detection.
    pub fn url_hint(&self) -> String {
        match self {
            Self::Path(p) => p.display().to_string(),
            Self::Bytes(_) | Self::Live(_) | Self::Frames(_) => String::new(),
            Self::Remote { url, .. } => url.to_string(),
        }
    }
}

enum BridgeState {
    File {
        path: PathBuf,
        file: Option<File>,
    },
    Memory {
        data: Bytes,
    },
    Remote {
        url: Url,
        fetch: Arc<dyn RangeFetch>,
        stream: Option<ByteStream>,
    },
    Live {
        stream: ByteStream,
        pulled: bool,
    },
}

/// Pull-based chunked reader over one [`SourceInput`].
///
/// Owned by the orchestrating context, one per source id; answers the
/// executing context's `read` and `seek` requests.
pub struct SourceBridge {
    state: BridgeState,
    size: Option<u64>,
    pos: u64,
    lookahead: Option<Bytes>,
    ended: bool,
}

impl SourceBridge {
    /// Open a bridge, resolving the source's total size where possible.
    pub async fn open(input: SourceInput) -> ClipflowResult<Self> {
        let (state, size) = match input {
            SourceInput::Path(path) => {
                let meta = tokio::fs::metadata(&path).await.map_err(|e| {
                    ClipflowError::source(format!("cannot stat '{}': {e}", path.display()))
                })?;
                (BridgeState::File { path, file: None }, Some(meta.len()))
            }
            SourceInput::Bytes(data) => {
                let size = data.len() as u64;
                (BridgeState::Memory { data }, Some(size))
            }
            SourceInput::Remote { url, fetch } => {
                let size = fetch.size(&url).await?;
                (
                    BridgeState::Remote {
                        url,
                        fetch,
                        stream: None,
                    },
                    size,
                )
            }
            // frame streams share the live path: items pass through unsplit,
            // no repositioning once pulled
            SourceInput::Live(stream) | SourceInput::Frames(stream) => (
                BridgeState::Live {
                    stream,
                    pulled: false,
                },
                None,
            ),
        };
        Ok(Self {
            state,
            size,
            pos: 0,
            lookahead: None,
            ended: false,
        })
    }

    /// Total size in bytes, when known. Live streams report `None`.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Whether this source supports repositioning.
    pub fn seekable(&self) -> bool {
        !matches!(self.state, BridgeState::Live { .. })
    }

    /// Whether all data has been pulled and handed out.
    pub fn ended(&self) -> bool {
        self.ended && self.lookahead.is_none()
    }

    /// Pull the next chunk, or `None` at end of data.
    pub async fn next_chunk(&mut self) -> ClipflowResult<Option<Bytes>> {
        if let Some(chunk) = self.lookahead.take() {
            return Ok(Some(chunk));
        }
        if self.ended {
            return Ok(None);
        }
        self.pull().await
    }

    /// Reposition to an absolute offset, discarding the current reader.
    ///
    /// Live streams accept a seek only before the first pull (the request is
    /// then a no-op, data necessarily starts at the stream head).
    pub async fn seek(&mut self, pos: u64) -> ClipflowResult<()> {
        match &mut self.state {
            BridgeState::Live { pulled, .. } => {
                if *pulled {
                    return Err(ClipflowError::source(
                        "live stream cannot seek after the first pull",
                    ));
                }
                Ok(())
            }
            BridgeState::File { file, .. } => {
                *file = None;
                self.lookahead = None;
                self.ended = false;
                self.pos = pos;
                Ok(())
            }
            BridgeState::Memory { .. } => {
                self.lookahead = None;
                self.ended = false;
                self.pos = pos;
                Ok(())
            }
            BridgeState::Remote { stream, .. } => {
                *stream = None;
                self.lookahead = None;
                self.ended = false;
                self.pos = pos;
                Ok(())
            }
        }
    }

    /// Pull one chunk ahead without handing it out, so an interrupted export
    /// can retain already-read-but-unconsumed data. Returns whether data is
    /// available.
    pub async fn probe(&mut self) -> ClipflowResult<bool> {
        if self.lookahead.is_some() {
            return Ok(true);
        }
        if self.ended {
            return Ok(false);
        }
        self.lookahead = self.pull().await?;
        Ok(self.lookahead.is_some())
    }

    /// Hand back the probed chunk, if any, without consuming new data.
    pub fn take_lookahead(&mut self) -> Option<Bytes> {
        self.lookahead.take()
    }

    /// Seed the reader with a chunk retained from an earlier export.
    pub fn seed(&mut self, chunk: Bytes) {
        debug_assert!(self.lookahead.is_none());
        self.lookahead = Some(chunk);
    }

    async fn pull(&mut self) -> ClipflowResult<Option<Bytes>> {
        match &mut self.state {
            BridgeState::File { path, file } => {
                if file.is_none() {
                    let mut f = File::open(&*path).await.map_err(|e| {
                        ClipflowError::source(format!("cannot open '{}': {e}", path.display()))
                    })?;
                    f.seek(std::io::SeekFrom::Start(self.pos)).await.map_err(|e| {
                        ClipflowError::source(format!("cannot seek '{}': {e}", path.display()))
                    })?;
                    *file = Some(f);
                }
                let f = file.as_mut().expect("file opened above");
                let mut buf = vec![0u8; CHUNK_SIZE];
                let n = f.read(&mut buf).await.map_err(|e| {
                    ClipflowError::source(format!("cannot read '{}': {e}", path.display()))
                })?;
                if n == 0 {
                    self.ended = true;
                    return Ok(None);
                }
                buf.truncate(n);
                self.pos += n as u64;
                Ok(Some(Bytes::from(buf)))
            }
            BridgeState::Memory { data } => {
                let len = data.len() as u64;
                if self.pos >= len {
                    self.ended = true;
                    return Ok(None);
                }
                let start = self.pos as usize;
                let end = (start + CHUNK_SIZE).min(data.len());
                self.pos = end as u64;
                Ok(Some(data.slice(start..end)))
            }
            BridgeState::Remote { url, fetch, stream } => {
                if stream.is_none() {
                    *stream = Some(fetch.fetch(url, self.pos).await?);
                }
                let s = stream.as_mut().expect("stream fetched above");
                match s.next().await {
                    Some(Ok(chunk)) => {
                        self.pos += chunk.len() as u64;
                        Ok(Some(chunk))
                    }
                    Some(Err(e)) => Err(e),
                    None => {
                        self.ended = true;
                        Ok(None)
                    }
                }
            }
            BridgeState::Live { stream, pulled } => {
                *pulled = true;
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        self.pos += chunk.len() as u64;
                        Ok(Some(chunk))
                    }
                    Some(Err(e)) => Err(e),
                    None => {
                        self.ended = true;
                        Ok(None)
                    }
                }
            }
        }
    }
}

/// Explicit cross-export cache of unread source chunks.
///
/// When an export is torn down, each source's probed-but-unconsumed chunk is
/// stashed here keyed by its stable [`SourceId`]; the next export of the
/// same node takes it back and resumes instead of re-fetching. Entries are
/// removed when taken and can be evicted explicitly; correctness never
/// depends on drop timing.
#[derive(Debug, Default)]
pub struct ChunkCache {
    slots: HashMap<SourceId, Bytes>,
}

impl ChunkCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain `chunk` for a future export of `id`.
    pub fn put(&mut self, id: SourceId, chunk: Bytes) {
        self.slots.insert(id, chunk);
    }

    /// Take the retained chunk for `id`, removing it.
    pub fn take(&mut self, id: SourceId) -> Option<Bytes> {
        self.slots.remove(&id)
    }

    /// Drop whatever is retained for `id`.
    pub fn evict(&mut self, id: SourceId) {
        self.slots.remove(&id);
    }

    /// Number of retained chunks.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn live(chunks: Vec<&'static [u8]>) -> SourceInput {
        SourceInput::Live(Box::pin(stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
        )))
    }

    #[tokio::test]
    async fn memory_source_chunks_and_seeks() {
        let data = Bytes::from(vec![7u8; CHUNK_SIZE + 10]);
        let mut bridge = SourceBridge::open(SourceInput::Bytes(data)).await.unwrap();
        assert_eq!(bridge.size(), Some((CHUNK_SIZE + 10) as u64));

        let first = bridge.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), CHUNK_SIZE);
        let second = bridge.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.len(), 10);
        assert!(bridge.next_chunk().await.unwrap().is_none());
        assert!(bridge.ended());

        bridge.seek(CHUNK_SIZE as u64).await.unwrap();
        assert!(!bridge.ended());
        let again = bridge.next_chunk().await.unwrap().unwrap();
        assert_eq!(again.len(), 10);
    }

    #[tokio::test]
    async fn live_source_rejects_seek_after_first_pull() {
        let mut bridge = SourceBridge::open(live(vec![b"abc", b"def"])).await.unwrap();
        assert!(!bridge.seekable());
        bridge.seek(0).await.unwrap(); // before the first pull: accepted

        assert_eq!(bridge.next_chunk().await.unwrap().unwrap().as_ref(), b"abc");
        let err = bridge.seek(0).await.unwrap_err();
        assert!(matches!(err, ClipflowError::Source(_)));
    }

    #[tokio::test]
    async fn probe_retains_a_chunk_without_consuming_it() {
        let mut bridge = SourceBridge::open(live(vec![b"abc", b"def"])).await.unwrap();
        assert!(bridge.probe().await.unwrap());
        // probing twice pulls nothing further
        assert!(bridge.probe().await.unwrap());

        let retained = bridge.take_lookahead().unwrap();
        assert_eq!(retained.as_ref(), b"abc");

        let mut resumed = SourceBridge::open(live(vec![b"def"])).await.unwrap();
        resumed.seed(retained);
        assert_eq!(resumed.next_chunk().await.unwrap().unwrap().as_ref(), b"abc");
        assert_eq!(resumed.next_chunk().await.unwrap().unwrap().as_ref(), b"def");
    }

    #[tokio::test]
    async fn chunk_cache_is_take_once() {
        let mut cache = ChunkCache::new();
        cache.put(SourceId(1), Bytes::from_static(b"tail"));
        assert_eq!(cache.take(SourceId(1)).unwrap().as_ref(), b"tail");
        assert!(cache.take(SourceId(1)).is_none());
        assert!(cache.is_empty());
    }
}
