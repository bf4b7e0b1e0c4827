//! The media-engine capability contract.
//!
//! Clipflow does not implement decoding, encoding, filtering or muxing; it
//! coordinates an engine the caller supplies. The traits here are the fixed
//! operation set that engine must expose: demux (packets + container
//! metadata), decode (packet → frames), filter (flat spec + frame batch →
//! frame batch), encode (frame → packets) and mux (packets → offset-tagged
//! byte chunks + finalize).
//!
//! Every trait is object safe and `Send`: the executing context owns the
//! engine objects on its own thread for the lifetime of one export.

use bytes::Bytes;

use crate::foundation::error::ClipflowResult;
use crate::graph::metadata::{FormatMetadata, MediaType, StreamMetadata};
use crate::graph::node::ContainerSpec;

/// A chunk of encoded output together with its absolute byte offset in the
/// output. Offsets let a muxer rewrite earlier header bytes once trailer
/// information is known, without anyone buffering the whole output.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputChunk {
    /// Absolute byte offset of this chunk in the output.
    pub offset: u64,
    /// Chunk payload.
    pub data: Bytes,
}

/// A demuxed or encoded packet.
#[derive(Clone, Debug)]
pub struct Packet {
    /// Stream index this packet belongs to (demux: container stream index;
    /// mux: output stream index).
    pub stream_index: usize,
    /// Presentation timestamp in the stream's time base.
    pub pts: i64,
    /// Encoded payload.
    pub data: Bytes,
}

/// A decoded or filtered frame, tagged with the output stream it belongs to
/// (see [`crate::stream_tag`]).
#[derive(Clone, Debug)]
pub struct Frame {
    /// Stream tag, `"<instance id>:<output index>"`.
    pub tag: String,
    /// Presentation timestamp in the stream's time base.
    pub pts: i64,
    /// Raw frame payload.
    pub data: Bytes,
}

/// Result of one non-blocking byte pull.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BytePoll {
    /// `n` bytes were copied into the buffer.
    Data(usize),
    /// No data buffered right now; more may arrive later.
    Pending,
    /// End of data.
    End,
}

/// Byte-level input a demuxer pulls from.
///
/// Reads are non-blocking with respect to the export: when no data is
/// buffered the input reports [`BytePoll::Pending`] and the coordinator
/// surfaces starvation instead of stalling the step.
pub trait ByteInput: Send {
    /// Copy up to `buf.len()` bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> ClipflowResult<BytePoll>;

    /// Reposition to an absolute byte offset, discarding buffered data.
    fn seek(&mut self, pos: u64) -> ClipflowResult<()>;

    /// Total size in bytes, when known.
    fn size(&self) -> Option<u64>;
}

/// Result of one demux pull.
#[derive(Debug)]
pub enum PacketPoll {
    /// A packet was produced.
    Packet(Packet),
    /// Input is momentarily unavailable.
    Pending,
    /// The container is fully consumed.
    End,
}

/// Demultiplexer over one [`ByteInput`].
pub trait Demuxer: Send {
    /// Container metadata and per-stream metadata.
    fn metadata(&mut self) -> ClipflowResult<(FormatMetadata, Vec<StreamMetadata>)>;

    /// Pull the next packet.
    fn next_packet(&mut self) -> ClipflowResult<PacketPoll>;
}

/// Decoder for one stream.
pub trait Decoder: Send {
    /// Decode one packet into zero or more frames.
    fn decode(&mut self, packet: Packet) -> ClipflowResult<Vec<Frame>>;

    /// Drain internal state at end of input.
    fn flush(&mut self) -> ClipflowResult<Vec<Frame>>;
}

/// One pad of a filter graph: a named buffer source or sink.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterPad {
    /// Stream tag of the pad.
    pub tag: String,
    /// Media type flowing through the pad.
    pub media_type: MediaType,
    /// Buffer-source argument string; empty for sinks.
    pub args: String,
}

/// Flat description of a chained filter graph, built by
/// [`crate::filter_graph_spec`].
#[derive(Clone, Debug, PartialEq)]
pub struct FilterGraphSpec {
    /// One `[in]name=args[out]` clause per filter, `;`-chained,
    /// producer-first.
    pub spec: String,
    /// Buffer-source pads.
    pub inputs: Vec<FilterPad>,
    /// Buffer-sink pads.
    pub outputs: Vec<FilterPad>,
}

/// An instantiated filter graph.
pub trait Filterer: Send {
    /// Feed one batch of frames through the graph and collect its outputs.
    fn filter(&mut self, frames: Vec<Frame>) -> ClipflowResult<Vec<Frame>>;
}

/// Encoder for one output stream.
pub trait Encoder: Send {
    /// Encode one frame into zero or more packets.
    fn encode(&mut self, frame: Frame) -> ClipflowResult<Vec<Packet>>;

    /// Drain pending encoder state at end of writing.
    fn flush(&mut self) -> ClipflowResult<Vec<Packet>>;
}

/// Multiplexer producing the output container.
///
/// Each write returns the chunks it made available; the caller drains them
/// in order and is responsible for applying their offsets.
pub trait Muxer: Send {
    /// Open the output and write the container header.
    fn write_header(&mut self) -> ClipflowResult<Vec<OutputChunk>>;

    /// Mux one encoded packet.
    fn write_packet(&mut self, packet: Packet) -> ClipflowResult<Vec<OutputChunk>>;

    /// Finalize the container (trailer, and possibly rewritten header bytes).
    fn write_trailer(&mut self) -> ClipflowResult<Vec<OutputChunk>>;
}

/// Factory for the engine's capabilities.
pub trait MediaEngine: Send {
    /// Open a demuxer over a byte input.
    fn open_demuxer(&self, input: Box<dyn ByteInput>) -> ClipflowResult<Box<dyn Demuxer>>;

    /// Create a decoder for one stream; frames it produces carry `tag`.
    fn new_decoder(
        &self,
        stream: &StreamMetadata,
        tag: &str,
    ) -> ClipflowResult<Box<dyn Decoder>>;

    /// Instantiate a filter graph from its flat description.
    fn new_filterer(&self, spec: &FilterGraphSpec) -> ClipflowResult<Box<dyn Filterer>>;

    /// Create an encoder producing packets conforming to `stream`.
    fn new_encoder(&self, stream: &StreamMetadata) -> ClipflowResult<Box<dyn Encoder>>;

    /// Create a muxer for `container` with the given output streams.
    fn new_muxer(
        &self,
        container: &ContainerSpec,
        streams: &[StreamMetadata],
    ) -> ClipflowResult<Box<dyn Muxer>>;
}
