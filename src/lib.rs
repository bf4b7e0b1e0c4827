//! Clipflow describes media transformations (trim, loop, volume, merge,
//! concat, format conversion) as a graph of logical operations over one or
//! more input streams, then executes that graph incrementally: bytes are
//! pulled from arbitrary sources (files, in-memory buffers, live streams,
//! range-fetchable URLs, pre-framed element streams) and encoded output is
//! pushed back in bounded, offset-tagged chunks.
//!
//! # Pipeline overview
//!
//! 1. **Describe**: probe sources and apply filters, building an immutable
//!    node graph inside a [`NodeArena`] (no data flows yet).
//! 2. **Compile**: [`build_graph`] flattens the reachable subgraph into an
//!    id-addressed [`GraphInstance`], deduplicating shared nodes and splicing
//!    in implicit format-conversion filters.
//! 3. **Execute**: the instance graph crosses to a dedicated worker thread
//!    that owns the media engine; each [`Exporter::next`] call performs one
//!    bounded decode→filter→encode step and reports backpressure and
//!    end-of-stream.
//!
//! The decode/filter/encode/mux engine itself is an external capability: the
//! caller supplies an implementation of the [`MediaEngine`] trait family and
//! clipflow coordinates it. No codec or container logic lives in this crate.
//!
//! Key design constraints:
//!
//! - **No unsafe**: `unsafe` is forbidden in this crate.
//! - **No shared mutable state** between the orchestrating and executing
//!   contexts: they exchange ownership of buffers over a typed
//!   request/reply protocol, at most one pending reply per request key.
//! - **Externally clocked**: the executing context never blocks waiting for
//!   input mid-export; it reports starvation and returns, and the caller's
//!   loop decides when to supply more.
#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod engine_api;
mod exec;
mod foundation;
mod graph;
mod io;

pub use engine_api::{
    ByteInput, BytePoll, Decoder, Demuxer, Encoder, FilterGraphSpec, FilterPad, Filterer, Frame,
    MediaEngine, Muxer, OutputChunk, Packet, PacketPoll,
};
pub use exec::export::{ExportStep, Exporter, Session, SourceHandle};
pub use exec::message::{CorrelationKey, Reply, Request, RequestKind, StepReport};
pub use foundation::error::{ClipflowError, ClipflowResult, ErrorKind};
pub use foundation::rational::Rational;
pub use graph::build::{
    FilterLayout, GraphInstance, InstanceId, InstanceNode, InstanceRef, build_graph,
    complete_formats, filter_graph_spec, stream_tag,
};
pub use graph::filters::{
    TrimArgs, apply_concat, apply_format, apply_loop, apply_merge, apply_trim, apply_volume,
};
pub use graph::metadata::{
    AudioStream, FormatMetadata, MediaType, StreamCommon, StreamMetadata, VideoStream,
};
pub use graph::node::{
    ContainerSpec, FilterNode, FilterOp, NodeArena, NodeId, SourceId, SourceNode, SourceShape,
    StreamRef, TargetNode, UserNode,
};
pub use io::sink::ChunkAssembler;
pub use io::source::{ByteStream, ChunkCache, RangeFetch, SourceBridge, SourceInput};
