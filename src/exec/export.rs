//! Orchestrator-side session and per-step export coordinator.
//!
//! A [`Session`] owns the user-authored node arena, the source bridges, the
//! cross-export chunk cache, and the executing context it spawned. Sources
//! are registered against the session; [`Session::export`] compiles the
//! graph rooted at a new target, instantiates it in the executing context,
//! and returns an [`Exporter`] the caller drives one step at a time.
//!
//! Each [`Exporter::next`] call delivers fresh chunks for every source the
//! previous step reported starved, runs one step, and hands back whatever
//! output chunks the target produced. The export ends when the executing
//! context reports that every source is exhausted and a step produced no
//! frames; the same step carries the finalized container trailer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::engine_api::{MediaEngine, OutputChunk};
use crate::exec::message::{Envelope, Reply, Request, WorkerLink};
use crate::exec::worker;
use crate::foundation::error::{ClipflowError, ClipflowResult};
use crate::graph::build::{GraphInstance, InstanceId, InstanceNode, build_graph, complete_formats};
use crate::graph::metadata::{FormatMetadata, StreamMetadata};
use crate::graph::node::{
    ContainerSpec, NodeArena, NodeId, SourceId, SourceNode, SourceShape, StreamRef, TargetNode,
    UserNode,
};
use crate::io::source::{ChunkCache, SourceBridge, SourceInput};

type SharedBridges = Arc<Mutex<HashMap<SourceId, SourceBridge>>>;
type SharedCache = Arc<Mutex<ChunkCache>>;

/// A registered source: its node plus convenience handles on its streams.
#[derive(Clone, Debug)]
pub struct SourceHandle {
    /// The source's node in the session arena.
    pub node: NodeId,
    /// One ref per declared output stream, in container order.
    pub streams: Vec<StreamRef>,
    /// Container metadata reported at probe time (or declared, for live
    /// sources).
    pub container: FormatMetadata,
}

/// One orchestrating context: node arena, source bridges, chunk cache, and
/// the executing context it owns.
///
/// Dropping the session signals the worker thread to shut down after
/// finishing its current request.
pub struct Session {
    arena: NodeArena,
    link: WorkerLink,
    bridges: SharedBridges,
    cache: SharedCache,
    next_source: u32,
    _worker: std::thread::JoinHandle<()>,
}

impl Session {
    /// Spawn the executing context around `engine` and start the reply
    /// dispatcher. Must be called inside a tokio runtime.
    pub fn new(engine: Box<dyn MediaEngine>) -> Self {
        let (link, from_worker, worker) = worker::spawn(engine);
        let bridges: SharedBridges = Arc::new(Mutex::new(HashMap::new()));
        let cache: SharedCache = Arc::new(Mutex::new(ChunkCache::new()));
        tokio::spawn(dispatch(
            from_worker,
            link.clone(),
            Arc::clone(&bridges),
        ));
        Self {
            arena: NodeArena::new(),
            link,
            bridges,
            cache,
            next_source: 0,
            _worker: worker,
        }
    }

    /// The node arena, for applying filters to registered sources.
    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    /// Mutable access to the node arena.
    pub fn arena_mut(&mut self) -> &mut NodeArena {
        &mut self.arena
    }

    /// Register a seekable source and probe its metadata in the executing
    /// context.
    ///
    /// Live inputs are rejected here: a metadata probe consumes stream bytes
    /// irrecoverably, so live sources declare their metadata up front via
    /// [`Session::add_live_source`].
    #[tracing::instrument(skip(self, input), fields(input = ?input))]
    pub async fn add_source(&mut self, input: SourceInput) -> ClipflowResult<SourceHandle> {
        if matches!(input, SourceInput::Live(_) | SourceInput::Frames(_)) {
            return Err(ClipflowError::build(
                "live and frame-stream sources declare their metadata, \
                 use add_live_source or add_frame_source",
            ));
        }
        let id = SourceId(self.next_source);
        self.next_source += 1;
        let url = input.url_hint();
        let bridge = SourceBridge::open(input).await?;
        let shape = SourceShape::Seekable {
            url,
            size: bridge.size().unwrap_or(0),
        };
        self.bridges.lock().await.insert(id, bridge);

        let reply = self
            .link
            .send(Request::GetMetadata {
                source: id,
                shape: shape.clone(),
            })
            .await?;
        let (container, streams) = match reply {
            Reply::Metadata { container, streams } => (container, streams),
            other => {
                return Err(ClipflowError::protocol(format!(
                    "unexpected reply to get_metadata: {other:?}"
                )));
            }
        };
        // the probe consumed bytes; rewind so the export starts at the head
        if let Some(bridge) = self.bridges.lock().await.get_mut(&id) {
            bridge.seek(0).await?;
        }
        self.register(id, shape, container, streams)
    }

    /// Register a live source with caller-declared metadata, without a
    /// probe.
    pub async fn add_live_source(
        &mut self,
        stream: SourceInput,
        container: FormatMetadata,
        streams: Vec<StreamMetadata>,
    ) -> ClipflowResult<SourceHandle> {
        if !matches!(stream, SourceInput::Live(_)) {
            return Err(ClipflowError::build(
                "add_live_source takes a live input, use add_source",
            ));
        }
        let id = SourceId(self.next_source);
        self.next_source += 1;
        let bridge = SourceBridge::open(stream).await?;
        self.bridges.lock().await.insert(id, bridge);
        self.register(id, SourceShape::Live, container, streams)
    }

    /// Register a frame-stream source: a sequence of discrete pre-framed
    /// elements, each delivered item one complete encoded frame.
    ///
    /// No container is involved, so the executing context feeds elements to
    /// the stream's decoder directly, without a demuxer. The single carried
    /// stream's metadata is declared by the caller.
    pub async fn add_frame_source(
        &mut self,
        stream: SourceInput,
        container: FormatMetadata,
        streams: Vec<StreamMetadata>,
    ) -> ClipflowResult<SourceHandle> {
        if !matches!(stream, SourceInput::Frames(_)) {
            return Err(ClipflowError::build(
                "add_frame_source takes a frame-stream input, use add_source",
            ));
        }
        if streams.len() != 1 {
            return Err(ClipflowError::build(
                "a frame-stream source carries exactly one stream",
            ));
        }
        let id = SourceId(self.next_source);
        self.next_source += 1;
        let bridge = SourceBridge::open(stream).await?;
        self.bridges.lock().await.insert(id, bridge);
        self.register(id, SourceShape::FrameStream, container, streams)
    }

    fn register(
        &mut self,
        id: SourceId,
        shape: SourceShape,
        container: FormatMetadata,
        streams: Vec<StreamMetadata>,
    ) -> ClipflowResult<SourceHandle> {
        let node = self.arena.insert(UserNode::Source(SourceNode {
            source: id,
            shape,
            container: container.clone(),
            out_streams: streams.clone(),
        }))?;
        let stream_refs = (0..streams.len())
            .map(|index| StreamRef { node, index })
            .collect();
        Ok(SourceHandle {
            node,
            streams: stream_refs,
            container,
        })
    }

    /// Drop whatever chunk the cache retains for a source node.
    pub async fn evict_cached(&mut self, handle: &SourceHandle) {
        if let Some(UserNode::Source(s)) = self.arena.get(handle.node) {
            self.cache.lock().await.evict(s.source);
        }
    }

    /// Compile and instantiate an export of `in_refs` into `container`,
    /// declaring `out_streams` as the muxed stream layout.
    ///
    /// Format completion runs first: wherever a ref's metadata disagrees
    /// with its declared output stream, an implicit format filter is
    /// spliced in. The returned [`Exporter`] then drives the instantiated
    /// graph step by step.
    #[tracing::instrument(skip_all)]
    pub async fn export(
        &mut self,
        in_refs: &[StreamRef],
        out_streams: Vec<StreamMetadata>,
        container: ContainerSpec,
    ) -> ClipflowResult<Exporter> {
        let completed = complete_formats(&mut self.arena, in_refs, &out_streams)?;
        let target = self.arena.insert(UserNode::Target(TargetNode {
            in_refs: completed,
            out_streams,
            container,
        }))?;
        let graph = build_graph(&self.arena, target)?;

        let source_ids = graph_source_ids(&graph);
        let target_id = *graph
            .targets
            .first()
            .ok_or_else(|| ClipflowError::build("compiled graph has no target"))?;

        // rewind seekable bridges; resume live ones from retained chunks
        {
            let mut bridges = self.bridges.lock().await;
            let mut cache = self.cache.lock().await;
            for &sid in &source_ids {
                let Some(bridge) = bridges.get_mut(&sid) else {
                    return Err(ClipflowError::protocol(format!(
                        "graph references unregistered source {sid:?}"
                    )));
                };
                if bridge.seekable() {
                    bridge.seek(0).await?;
                } else if let Some(chunk) = cache.take(sid) {
                    bridge.seed(chunk);
                }
            }
        }

        let reply = self.link.send(Request::BuildGraph { graph }).await?;
        if !matches!(reply, Reply::GraphBuilt) {
            return Err(ClipflowError::protocol(format!(
                "unexpected reply to build_graph: {reply:?}"
            )));
        }

        let needs_input = source_ids.iter().copied().collect();
        Ok(Exporter {
            link: self.link.clone(),
            bridges: Arc::clone(&self.bridges),
            cache: Arc::clone(&self.cache),
            sources: source_ids,
            target: target_id,
            needs_input,
            input_ended: HashSet::new(),
            ended: false,
            torn_down: false,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // explicit signal: the dispatcher also holds a sender half, so
        // channel closure alone would never reach the worker
        self.link.shutdown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("nodes", &self.arena.len())
            .field("next_source", &self.next_source)
            .finish_non_exhaustive()
    }
}

fn graph_source_ids(graph: &GraphInstance) -> Vec<SourceId> {
    graph
        .sources
        .iter()
        .filter_map(|&id| match graph.node(id) {
            InstanceNode::Source { source, .. } => Some(*source),
            _ => None,
        })
        .collect()
}

/// Serve the worker's envelopes: route replies to their pending listeners
/// and answer the worker's own `read`/`seek` requests from the bridges.
async fn dispatch(
    mut from_worker: UnboundedReceiver<Envelope>,
    link: WorkerLink,
    bridges: SharedBridges,
) {
    while let Some(envelope) = from_worker.recv().await {
        match envelope {
            Envelope::Reply { key, reply } => link.complete(key, reply),
            Envelope::Request(request) => {
                let key = request.key();
                let reply = serve(&bridges, request).await;
                link.post_reply(key, reply);
            }
            // shutdown only flows toward the worker
            Envelope::Shutdown => {}
        }
    }
    tracing::debug!("worker envelope stream closed");
}

async fn serve(bridges: &SharedBridges, request: Request) -> Reply {
    match request {
        Request::Read { source } => match bridges.lock().await.get_mut(&source) {
            Some(bridge) => match bridge.next_chunk().await {
                Ok(chunk) => Reply::Chunk(chunk),
                Err(err) => failed(err),
            },
            None => failed(ClipflowError::protocol(format!(
                "read for unknown source {source:?}"
            ))),
        },
        Request::Seek { source, pos } => match bridges.lock().await.get_mut(&source) {
            Some(bridge) => match bridge.seek(pos).await {
                Ok(()) => Reply::SeekDone,
                Err(err) => failed(err),
            },
            None => failed(ClipflowError::protocol(format!(
                "seek for unknown source {source:?}"
            ))),
        },
        other => {
            tracing::warn!(?other, "unexpected worker-issued request");
            failed(ClipflowError::protocol(
                "only read and seek may originate in the executing context",
            ))
        }
    }
}

fn failed(err: ClipflowError) -> Reply {
    Reply::Failed {
        kind: err.kind(),
        message: err.to_string(),
    }
}

/// Output of one export step.
#[derive(Clone, Debug, Default)]
pub struct ExportStep {
    /// Offset-tagged output chunks produced this step, in write order.
    pub chunks: Vec<OutputChunk>,
    /// Whether this step carried the finalized trailer; further
    /// [`Exporter::next`] calls fail.
    pub done: bool,
}

/// Drives one instantiated graph step by step.
///
/// Obtained from [`Session::export`]. Call [`Exporter::next`] until a step
/// reports `done`, then [`Exporter::close`]; closing early cancels the
/// export and retains pulled-but-unconsumed live data for a later export of
/// the same sources.
pub struct Exporter {
    link: WorkerLink,
    bridges: SharedBridges,
    cache: SharedCache,
    sources: Vec<SourceId>,
    target: InstanceId,
    /// Sources the last step reported starved; fed before the next step.
    needs_input: HashSet<SourceId>,
    /// Sources whose bridge reported end of data.
    input_ended: HashSet<SourceId>,
    ended: bool,
    torn_down: bool,
}

impl Exporter {
    /// Whether the export has reached its end (normally or fatally).
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Run one step: feed starved sources, advance the graph, collect
    /// output.
    ///
    /// After the end of the export (a step with `done`, or a fatal error)
    /// further calls fail with a protocol error.
    #[tracing::instrument(skip(self))]
    pub async fn next(&mut self) -> ClipflowResult<ExportStep> {
        if self.ended {
            return Err(ClipflowError::protocol("export already ended"));
        }

        let mut inputs: HashMap<SourceId, Vec<Bytes>> = HashMap::new();
        {
            let mut bridges = self.bridges.lock().await;
            for &sid in &self.sources {
                if self.input_ended.contains(&sid) || !self.needs_input.contains(&sid) {
                    continue;
                }
                let Some(bridge) = bridges.get_mut(&sid) else {
                    self.ended = true;
                    return Err(ClipflowError::protocol(format!(
                        "export references unregistered source {sid:?}"
                    )));
                };
                match bridge.next_chunk().await {
                    Ok(Some(chunk)) => {
                        inputs.insert(sid, vec![chunk]);
                        // keep live sources one chunk ahead so a cancelled
                        // export can retain in-flight data
                        if !bridge.seekable() {
                            bridge.probe().await?;
                        }
                    }
                    Ok(None) => {
                        self.input_ended.insert(sid);
                    }
                    Err(err) => {
                        self.ended = true;
                        return Err(err);
                    }
                }
            }
        }

        let reply = match self
            .link
            .send(Request::NextFrame {
                inputs,
                ended: self.input_ended.clone(),
            })
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                if err.is_export_fatal() {
                    self.ended = true;
                }
                return Err(err);
            }
        };
        let mut report = match reply {
            Reply::Step(report) => report,
            other => {
                self.ended = true;
                return Err(ClipflowError::protocol(format!(
                    "unexpected reply to next_frame: {other:?}"
                )));
            }
        };

        self.needs_input = report.starved.iter().copied().collect();
        let chunks = report.outputs.remove(&self.target).unwrap_or_default();
        if report.end {
            self.ended = true;
        }
        Ok(ExportStep {
            chunks,
            done: report.end,
        })
    }

    /// Tear down the executing side of the export. Idempotent.
    ///
    /// Live bridges hand their probed-but-unconsumed chunk to the session
    /// cache, so a later export of the same sources resumes where this one
    /// stopped.
    #[tracing::instrument(skip(self))]
    pub async fn close(&mut self) -> ClipflowResult<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        self.ended = true;

        {
            let mut bridges = self.bridges.lock().await;
            let mut cache = self.cache.lock().await;
            for &sid in &self.sources {
                if let Some(bridge) = bridges.get_mut(&sid) {
                    if let Some(chunk) = bridge.take_lookahead() {
                        cache.put(sid, chunk);
                    }
                }
            }
        }

        let reply = self.link.send(Request::DeleteGraph).await?;
        match reply {
            Reply::GraphDeleted => Ok(()),
            other => Err(ClipflowError::protocol(format!(
                "unexpected reply to delete_graph: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("target", &self.target)
            .field("sources", &self.sources)
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}
