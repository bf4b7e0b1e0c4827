//! Worker-side runtime for one instantiated graph.
//!
//! [`GraphRuntime::build`] turns a [`GraphInstance`] into live engine
//! objects: a demuxer plus per-stream decoders for every source, at most one
//! filterer, and per-target encoders plus a muxer. [`GraphRuntime::step`]
//! then advances the whole graph by one round: pull packets, decode, filter,
//! encode, mux, and report what came out.
//!
//! Source bytes live in the orchestrating context. During setup (metadata
//! probe, graph build) the demuxer needs bytes synchronously, so its input
//! pumps them over the channel on demand. In steady state pumping stops:
//! reads drain whatever the last `next_frame` delivered and report
//! [`BytePoll::Pending`] when that runs dry, which the step surfaces as
//! starvation instead of blocking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::engine_api::{
    ByteInput, BytePoll, Decoder, Demuxer, Encoder, Filterer, Frame, MediaEngine, Muxer,
    OutputChunk, Packet, PacketPoll,
};
use crate::exec::message::{HostLink, Reply, Request, StepReport};
use crate::foundation::error::{ClipflowError, ClipflowResult};
use crate::graph::build::{GraphInstance, InstanceId, InstanceNode, filter_graph_spec, stream_tag};
use crate::graph::node::{SourceId, SourceShape};

/// Chunks delivered for one source, ahead of the demuxer consuming them.
#[derive(Debug, Default)]
pub(crate) struct InputBuffer {
    chunks: VecDeque<Bytes>,
    ended: bool,
}

type SharedBuffer = Arc<Mutex<InputBuffer>>;

/// [`ByteInput`] fed from the orchestrating context.
struct WorkerInput {
    source: SourceId,
    size: Option<u64>,
    buf: SharedBuffer,
    link: HostLink,
    /// When set, an empty buffer pulls a chunk over the channel instead of
    /// reporting `Pending`. Only set during setup.
    pump: Arc<AtomicBool>,
}

impl ByteInput for WorkerInput {
    fn read(&mut self, out: &mut [u8]) -> ClipflowResult<BytePoll> {
        loop {
            {
                let mut buf = self.buf.lock().expect("input buffer lock poisoned");
                if let Some(chunk) = buf.chunks.pop_front() {
                    let n = chunk.len().min(out.len());
                    out[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        buf.chunks.push_front(chunk.slice(n..));
                    }
                    return Ok(BytePoll::Data(n));
                }
                if buf.ended {
                    return Ok(BytePoll::End);
                }
            }
            if !self.pump.load(Ordering::Acquire) {
                return Ok(BytePoll::Pending);
            }
            match self.link.call(Request::Read {
                source: self.source,
            })? {
                Reply::Chunk(Some(chunk)) => {
                    self.buf
                        .lock()
                        .expect("input buffer lock poisoned")
                        .chunks
                        .push_back(chunk);
                }
                Reply::Chunk(None) => {
                    self.buf.lock().expect("input buffer lock poisoned").ended = true;
                }
                other => {
                    return Err(ClipflowError::protocol(format!(
                        "unexpected reply to read: {other:?}"
                    )));
                }
            }
        }
    }

    fn seek(&mut self, pos: u64) -> ClipflowResult<()> {
        {
            let mut buf = self.buf.lock().expect("input buffer lock poisoned");
            buf.chunks.clear();
            buf.ended = false;
        }
        match self.link.call(Request::Seek {
            source: self.source,
            pos,
        })? {
            Reply::SeekDone => Ok(()),
            other => Err(ClipflowError::protocol(format!(
                "unexpected reply to seek: {other:?}"
            ))),
        }
    }

    fn size(&self) -> Option<u64> {
        self.size
    }
}

/// An input for the metadata probe, before any runtime exists. Pumps bytes
/// over the channel for its whole lifetime.
pub(crate) fn probe_input(
    source: SourceId,
    size: Option<u64>,
    link: HostLink,
) -> impl ByteInput + 'static {
    WorkerInput {
        source,
        size,
        buf: Arc::new(Mutex::new(InputBuffer::default())),
        link,
        pump: Arc::new(AtomicBool::new(true)),
    }
}

/// Where a source's packets come from.
enum PacketFeed {
    /// A demuxer parsing the container byte stream.
    Demuxed(Box<dyn Demuxer>),
    /// Discrete pre-framed elements: each delivered chunk becomes one packet
    /// as-is, with a running element count as pts.
    Framed { stream_index: usize, next_pts: i64 },
}

/// One source instance: packet feed plus the decoders for its selected
/// streams.
struct SourceReader {
    source: SourceId,
    feed: PacketFeed,
    /// Keyed by container stream index.
    decoders: HashMap<usize, Box<dyn Decoder>>,
    buf: SharedBuffer,
    pump: Arc<AtomicBool>,
    /// Feed reached end and decoders were flushed.
    exhausted: bool,
}

impl SourceReader {
    fn push_input(&self, chunks: Vec<Bytes>) {
        self.buf
            .lock()
            .expect("input buffer lock poisoned")
            .chunks
            .extend(chunks);
    }

    fn mark_input_end(&self) {
        self.buf.lock().expect("input buffer lock poisoned").ended = true;
    }

    fn starved(&self) -> bool {
        let buf = self.buf.lock().expect("input buffer lock poisoned");
        buf.chunks.is_empty() && !buf.ended
    }

    /// Pull one packet round and decode it. Per-frame failures are logged
    /// and skipped; everything else aborts the step.
    fn read_frames(&mut self) -> ClipflowResult<Vec<Frame>> {
        if self.exhausted {
            return Ok(vec![]);
        }
        let poll = match &mut self.feed {
            PacketFeed::Demuxed(demuxer) => demuxer.next_packet()?,
            PacketFeed::Framed {
                stream_index,
                next_pts,
            } => {
                let mut buf = self.buf.lock().expect("input buffer lock poisoned");
                match buf.chunks.pop_front() {
                    Some(data) => {
                        let packet = Packet {
                            stream_index: *stream_index,
                            pts: *next_pts,
                            data,
                        };
                        *next_pts += 1;
                        PacketPoll::Packet(packet)
                    }
                    None if buf.ended => PacketPoll::End,
                    None => PacketPoll::Pending,
                }
            }
        };
        match poll {
            PacketPoll::Packet(packet) => {
                let Some(decoder) = self.decoders.get_mut(&packet.stream_index) else {
                    tracing::trace!(
                        source = ?self.source,
                        stream = packet.stream_index,
                        "packet for unselected stream dropped"
                    );
                    return Ok(vec![]);
                };
                match decoder.decode(packet) {
                    Ok(frames) => Ok(frames),
                    Err(err) if !err.is_export_fatal() => {
                        tracing::warn!(source = ?self.source, error = %err, "frame skipped");
                        Ok(vec![])
                    }
                    Err(err) => Err(err),
                }
            }
            PacketPoll::Pending => Ok(vec![]),
            PacketPoll::End => {
                self.exhausted = true;
                let mut frames = Vec::new();
                for decoder in self.decoders.values_mut() {
                    match decoder.flush() {
                        Ok(flushed) => frames.extend(flushed),
                        Err(err) if !err.is_export_fatal() => {
                            tracing::warn!(source = ?self.source, error = %err, "flush frame skipped");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(frames)
            }
        }
    }
}

struct Lane {
    /// Tag of the frames this lane consumes.
    tag: String,
    /// Output stream index packets are remapped to.
    out_index: usize,
    encoder: Box<dyn Encoder>,
}

/// One target instance: per-stream encoders feeding a muxer.
struct TargetWriter {
    id: InstanceId,
    lanes: Vec<Lane>,
    muxer: Box<dyn Muxer>,
    chunks: Vec<OutputChunk>,
    started: bool,
    finished: bool,
}

impl TargetWriter {
    /// Encode and mux the frames addressed to this target. The header is
    /// written lazily, on the first addressed frame.
    fn write_frames(&mut self, frames: &[Frame]) -> ClipflowResult<()> {
        if self.finished {
            return Ok(());
        }
        let addressed = frames
            .iter()
            .any(|f| self.lanes.iter().any(|l| l.tag == f.tag));
        if !addressed {
            return Ok(());
        }
        if !self.started {
            self.chunks.extend(self.muxer.write_header()?);
            self.started = true;
        }
        let Self {
            lanes,
            muxer,
            chunks,
            ..
        } = self;
        for lane in lanes.iter_mut() {
            for frame in frames.iter().filter(|f| f.tag == lane.tag) {
                let packets = match lane.encoder.encode(frame.clone()) {
                    Ok(packets) => packets,
                    Err(err) if !err.is_export_fatal() => {
                        tracing::warn!(tag = %lane.tag, error = %err, "frame skipped");
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                for mut packet in packets {
                    packet.stream_index = lane.out_index;
                    chunks.extend(muxer.write_packet(packet)?);
                }
            }
        }
        Ok(())
    }

    /// Flush the encoders and finalize the container. Idempotent.
    fn finish(&mut self) -> ClipflowResult<()> {
        if self.finished {
            return Ok(());
        }
        if !self.started {
            self.chunks.extend(self.muxer.write_header()?);
            self.started = true;
        }
        let Self {
            lanes,
            muxer,
            chunks,
            ..
        } = self;
        for lane in lanes.iter_mut() {
            let packets = match lane.encoder.flush() {
                Ok(packets) => packets,
                Err(err) if !err.is_export_fatal() => {
                    tracing::warn!(tag = %lane.tag, error = %err, "flush frame skipped");
                    Vec::new()
                }
                Err(err) => return Err(err),
            };
            for mut packet in packets {
                packet.stream_index = lane.out_index;
                chunks.extend(muxer.write_packet(packet)?);
            }
        }
        self.chunks.extend(self.muxer.write_trailer()?);
        self.finished = true;
        Ok(())
    }

    fn take_chunks(&mut self) -> Vec<OutputChunk> {
        std::mem::take(&mut self.chunks)
    }
}

/// Live engine objects for one export.
pub(crate) struct GraphRuntime {
    sources: Vec<SourceReader>,
    filterer: Option<Box<dyn Filterer>>,
    targets: Vec<TargetWriter>,
}

impl GraphRuntime {
    /// Instantiate every node of `graph` against `engine`.
    ///
    /// Demuxer construction probes container headers, so source inputs pump
    /// bytes over `link` synchronously here; pumping is switched off before
    /// returning.
    #[tracing::instrument(skip_all)]
    pub(crate) fn build(
        engine: &dyn MediaEngine,
        graph: &GraphInstance,
        link: &HostLink,
    ) -> ClipflowResult<Self> {
        let mut sources = Vec::with_capacity(graph.sources.len());
        for &id in &graph.sources {
            let InstanceNode::Source {
                source,
                shape,
                out_streams,
            } = graph.node(id)
            else {
                return Err(ClipflowError::protocol(format!(
                    "instance {id:?} listed as source but is not one"
                )));
            };
            let buf: SharedBuffer = Arc::new(Mutex::new(InputBuffer::default()));
            let pump = Arc::new(AtomicBool::new(true));
            let feed = match shape {
                SourceShape::Seekable { .. } | SourceShape::Live => {
                    let size = match shape {
                        SourceShape::Seekable { size, .. } => Some(*size),
                        _ => None,
                    };
                    let input = WorkerInput {
                        source: *source,
                        size,
                        buf: Arc::clone(&buf),
                        link: link.clone(),
                        pump: Arc::clone(&pump),
                    };
                    PacketFeed::Demuxed(engine.open_demuxer(Box::new(input))?)
                }
                SourceShape::FrameStream => {
                    let [stream] = out_streams.as_slice() else {
                        return Err(ClipflowError::protocol(format!(
                            "frame-stream instance {id:?} must declare exactly one stream"
                        )));
                    };
                    PacketFeed::Framed {
                        stream_index: stream.common().index,
                        next_pts: 0,
                    }
                }
            };
            let mut decoders = HashMap::new();
            for (pos, stream) in out_streams.iter().enumerate() {
                let decoder = engine.new_decoder(stream, &stream_tag(id, pos))?;
                decoders.insert(stream.common().index, decoder);
            }
            sources.push(SourceReader {
                source: *source,
                feed,
                decoders,
                buf,
                pump,
                exhausted: false,
            });
        }

        let filterer = match filter_graph_spec(graph) {
            Some(spec) => Some(engine.new_filterer(&spec)?),
            None => None,
        };

        let mut targets = Vec::with_capacity(graph.targets.len());
        for &id in &graph.targets {
            let InstanceNode::Target {
                in_refs,
                out_streams,
                container,
            } = graph.node(id)
            else {
                return Err(ClipflowError::protocol(format!(
                    "instance {id:?} listed as target but is not one"
                )));
            };
            let muxer = engine.new_muxer(container, out_streams)?;
            let mut lanes = Vec::with_capacity(in_refs.len());
            for (out_index, (r, stream)) in in_refs.iter().zip(out_streams).enumerate() {
                lanes.push(Lane {
                    tag: stream_tag(r.from, r.index),
                    out_index,
                    encoder: engine.new_encoder(stream)?,
                });
            }
            targets.push(TargetWriter {
                id,
                lanes,
                muxer,
                chunks: Vec::new(),
                started: false,
                finished: false,
            });
        }

        // setup is done; from here input arrives with each step
        for reader in &sources {
            reader.pump.store(false, Ordering::Release);
        }
        tracing::debug!(
            sources = sources.len(),
            targets = targets.len(),
            filtered = filterer.is_some(),
            "graph runtime built"
        );
        Ok(Self {
            sources,
            filterer,
            targets,
        })
    }

    /// Hand freshly delivered chunks to their source buffers.
    pub(crate) fn push_inputs(
        &mut self,
        mut inputs: HashMap<SourceId, Vec<Bytes>>,
        ended: &HashSet<SourceId>,
    ) {
        for reader in &self.sources {
            if let Some(chunks) = inputs.remove(&reader.source) {
                reader.push_input(chunks);
            }
            if ended.contains(&reader.source) {
                reader.mark_input_end();
            }
        }
        for id in inputs.keys() {
            tracing::warn!(source = ?id, "input for unknown source dropped");
        }
    }

    /// Advance the graph by one round.
    ///
    /// The end condition requires both that every source is exhausted
    /// (demuxed to the end and decoder-flushed) and that the round produced
    /// no frames; only then are targets finalized. A step that produces no
    /// frames while a source still has data pending merely reports
    /// starvation.
    pub(crate) fn step(&mut self) -> ClipflowResult<StepReport> {
        let mut frames = Vec::new();
        let mut starved = Vec::new();
        for reader in &mut self.sources {
            frames.extend(reader.read_frames()?);
            if !reader.exhausted && reader.starved() {
                starved.push(reader.source);
            }
        }
        let produced = !frames.is_empty();
        if produced {
            if let Some(filterer) = &mut self.filterer {
                frames = filterer.filter(frames)?;
            }
        }
        let end = !produced && self.sources.iter().all(|r| r.exhausted);

        let mut outputs = HashMap::new();
        for target in &mut self.targets {
            if end {
                target.finish()?;
            } else {
                target.write_frames(&frames)?;
            }
            outputs.insert(target.id, target.take_chunks());
        }
        Ok(StepReport {
            outputs,
            starved,
            end,
        })
    }
}
