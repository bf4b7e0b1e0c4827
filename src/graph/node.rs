//! The user-authored node model.
//!
//! Nodes live in a [`NodeArena`] that owns every record; all references
//! between nodes are plain indices ([`NodeId`], [`StreamRef`]), which keeps
//! the graph acyclic by construction: a filter can only reference nodes that
//! already exist, and nodes are never mutated after insertion.

use serde::{Deserialize, Serialize};

use crate::foundation::error::{ClipflowError, ClipflowResult};
use crate::graph::metadata::{FormatMetadata, StreamMetadata};

/// Index of a node inside its [`NodeArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// Stable identifier of an external input source, assigned by the
/// orchestrating context at probe time. Keys request routing and the
/// cross-export chunk cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub u32);

/// Locates one declared output of a node. Never owns the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamRef {
    /// Owning node.
    pub node: NodeId,
    /// Output index within that node's declared output streams.
    pub index: usize,
}

/// What the executing context needs to know about a source's byte interface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SourceShape {
    /// Random access with a known total size. `url` is a display/probing hint
    /// (file path or remote URL), empty for in-memory buffers.
    Seekable {
        /// Path or URL hint for the engine's format detection.
        url: String,
        /// Total size in bytes.
        size: u64,
    },
    /// Sequential-only stream of unknown length; seeking past the first pull
    /// fails.
    Live,
    /// Sequence of discrete pre-framed elements. Each delivered chunk is one
    /// complete encoded frame; no container parsing, no seeking.
    FrameStream,
}

/// One external input. Created once per probed source.
#[derive(Clone, Debug)]
pub struct SourceNode {
    /// Routing id shared with the executing context.
    pub source: SourceId,
    /// Byte-interface shape.
    pub shape: SourceShape,
    /// Container metadata reported at probe time.
    pub container: FormatMetadata,
    /// Declared output streams.
    pub out_streams: Vec<StreamMetadata>,
}

/// A named engine filter with ordered `key=value` arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterOp {
    /// Engine filter name (`atrim`, `amerge`, `format`, ...).
    pub name: String,
    /// Ordered argument pairs; order is preserved in the flat spec string.
    pub args: Vec<(String, String)>,
}

impl FilterOp {
    /// A filter op with no arguments.
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }
}

/// One filter application. Immutable after creation.
#[derive(Clone, Debug)]
pub struct FilterNode {
    /// Input stream references.
    pub in_refs: Vec<StreamRef>,
    /// Derived output metadata, one record per output stream.
    pub out_streams: Vec<StreamMetadata>,
    /// The operation to perform.
    pub op: FilterOp,
}

/// Output container description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container format name, e.g. `mp4`.
    pub format_name: String,
}

/// The export destination. Exactly one per export call.
#[derive(Clone, Debug)]
pub struct TargetNode {
    /// Input stream references (after implicit format completion).
    pub in_refs: Vec<StreamRef>,
    /// Declared output metadata, one record per muxed stream.
    pub out_streams: Vec<StreamMetadata>,
    /// Output container.
    pub container: ContainerSpec,
}

/// A declarative unit in the user-authored graph.
#[derive(Clone, Debug)]
pub enum UserNode {
    /// External input.
    Source(SourceNode),
    /// Filter application.
    Filter(FilterNode),
    /// Export destination.
    Target(TargetNode),
}

impl UserNode {
    /// Declared output streams of this node.
    pub fn out_streams(&self) -> &[StreamMetadata] {
        match self {
            Self::Source(s) => &s.out_streams,
            Self::Filter(f) => &f.out_streams,
            Self::Target(t) => &t.out_streams,
        }
    }

    /// Input references of this node; empty for sources.
    pub fn in_refs(&self) -> &[StreamRef] {
        match self {
            Self::Source(_) => &[],
            Self::Filter(f) => &f.in_refs,
            Self::Target(t) => &t.in_refs,
        }
    }
}

/// Registry that owns every node of a user graph.
///
/// The arena, not the nodes, owns lifetime; downstream references are plain
/// indices, so shared subexpressions (one source feeding two filter chains)
/// need no reference counting and cannot form cycles.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<UserNode>,
}

impl NodeArena {
    /// An empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, validating that every input reference points at an
    /// existing node and a declared output index.
    pub fn insert(&mut self, node: UserNode) -> ClipflowResult<NodeId> {
        for r in node.in_refs() {
            let Some(referenced) = self.nodes.get(r.node.0) else {
                return Err(ClipflowError::build(format!(
                    "input ref points at unknown node {:?}",
                    r.node
                )));
            };
            if r.index >= referenced.out_streams().len() {
                return Err(ClipflowError::build(format!(
                    "input ref index {} out of range for node {:?}",
                    r.index, r.node
                )));
            }
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        Ok(id)
    }

    /// The node behind `id`, if it exists.
    pub fn get(&self, id: NodeId) -> Option<&UserNode> {
        self.nodes.get(id.0)
    }

    /// The node behind `id`. Ids handed out by [`NodeArena::insert`] are
    /// always valid, so this only panics on a cross-arena mixup.
    pub(crate) fn node(&self, id: NodeId) -> &UserNode {
        &self.nodes[id.0]
    }

    /// The metadata a stream reference denotes.
    pub fn stream(&self, r: StreamRef) -> &StreamMetadata {
        &self.node(r.node).out_streams()[r.index]
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::rational::Rational;
    use crate::graph::metadata::{AudioStream, StreamCommon};

    fn source_node() -> UserNode {
        UserNode::Source(SourceNode {
            source: SourceId(0),
            shape: SourceShape::Seekable {
                url: String::new(),
                size: 16,
            },
            container: FormatMetadata {
                format_name: "wav".into(),
                duration: 1.0,
                bit_rate: 0,
            },
            out_streams: vec![StreamMetadata::Audio(AudioStream {
                common: StreamCommon {
                    index: 0,
                    time_base: Rational::new(1, 48000),
                    start_time: 0.0,
                    duration: 1.0,
                    bit_rate: 0,
                    codec_name: "pcm_s16le".into(),
                    extra_data: vec![],
                },
                volume: 1.0,
                sample_format: "s16".into(),
                sample_rate: 48000,
                channels: 2,
                channel_layout: "stereo".into(),
            })],
        })
    }

    #[test]
    fn insert_rejects_dangling_refs() {
        let mut arena = NodeArena::new();
        let bad = UserNode::Filter(FilterNode {
            in_refs: vec![StreamRef {
                node: NodeId(7),
                index: 0,
            }],
            out_streams: vec![],
            op: FilterOp::bare("volume"),
        });
        assert!(arena.insert(bad).is_err());
    }

    #[test]
    fn insert_rejects_out_of_range_output_index() {
        let mut arena = NodeArena::new();
        let src = arena.insert(source_node()).unwrap();
        let bad = UserNode::Filter(FilterNode {
            in_refs: vec![StreamRef {
                node: src,
                index: 3,
            }],
            out_streams: vec![],
            op: FilterOp::bare("volume"),
        });
        assert!(arena.insert(bad).is_err());
    }
}
