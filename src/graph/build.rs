//! The graph builder/compiler.
//!
//! [`build_graph`] walks a user graph backward from its target and emits a
//! flattened [`GraphInstance`]: an id-addressed registry of the reachable
//! subgraph with every [`StreamRef`] rewritten to an [`InstanceRef`]. Two
//! paths reaching the same [`NodeId`] compile to the same [`InstanceId`]
//! (referential deduplication), so shared subexpressions execute once.
//!
//! Traversal is backward (consumer to producer) but nodes are emitted in
//! postorder, so every producer receives its id and list position before
//! any of its consumers; the executing context walks the filter list
//! forward without reordering.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::engine_api::{FilterGraphSpec, FilterPad};
use crate::foundation::error::{ClipflowError, ClipflowResult};
use crate::graph::filters::insert_format;
use crate::graph::metadata::{MediaType, StreamMetadata};
use crate::graph::node::{
    ContainerSpec, FilterOp, NodeArena, NodeId, SourceId, SourceShape, StreamRef, UserNode,
};

/// Id of a compiled node inside a [`GraphInstance`]. Dense: instance ids
/// index directly into [`GraphInstance::nodes`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct InstanceId(pub u32);

/// A [`StreamRef`] rewritten to instance addressing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    /// Producing instance.
    pub from: InstanceId,
    /// Output index within that instance's declared output streams.
    pub index: usize,
}

/// Compiled form of one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum InstanceNode {
    /// External input.
    Source {
        /// Routing id of the underlying source.
        source: SourceId,
        /// Byte-interface shape.
        shape: SourceShape,
        /// Declared output streams.
        out_streams: Vec<StreamMetadata>,
    },
    /// Filter application.
    Filter {
        /// Rewritten input references.
        in_refs: Vec<InstanceRef>,
        /// Derived output metadata.
        out_streams: Vec<StreamMetadata>,
        /// The operation.
        op: FilterOp,
    },
    /// Export destination.
    Target {
        /// Rewritten input references.
        in_refs: Vec<InstanceRef>,
        /// Declared output metadata.
        out_streams: Vec<StreamMetadata>,
        /// Output container.
        container: ContainerSpec,
    },
}

impl InstanceNode {
    /// Declared output streams of this instance.
    pub fn out_streams(&self) -> &[StreamMetadata] {
        match self {
            Self::Source { out_streams, .. }
            | Self::Filter { out_streams, .. }
            | Self::Target { out_streams, .. } => out_streams,
        }
    }
}

/// Engine-facing description of the filter subgraph, present only when at
/// least one filter node is reachable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterLayout {
    /// Refs that feed the filter graph from source instances.
    pub inputs: Vec<InstanceRef>,
    /// Refs consumed by targets whose producer is a filter instance.
    pub outputs: Vec<InstanceRef>,
    /// Filter instances in producer-first order.
    pub filters: Vec<InstanceId>,
}

/// The flattened, id-keyed form of the reachable subgraph. Serialized and
/// sent once to the executing context, where it backs a graph runtime for
/// the lifetime of one export.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphInstance {
    /// Instance records, indexed by [`InstanceId`].
    pub nodes: Vec<InstanceNode>,
    /// Source instances.
    pub sources: Vec<InstanceId>,
    /// Filter instances, producers before consumers.
    pub filters: Vec<InstanceId>,
    /// Target instances.
    pub targets: Vec<InstanceId>,
    /// Filter subgraph description; `None` when no filter is reachable.
    pub filter_layout: Option<FilterLayout>,
}

impl GraphInstance {
    /// The instance behind `id`.
    pub fn node(&self, id: InstanceId) -> &InstanceNode {
        &self.nodes[id.0 as usize]
    }

    /// The metadata an instance ref denotes.
    pub fn stream(&self, r: InstanceRef) -> &StreamMetadata {
        &self.node(r.from).out_streams()[r.index]
    }
}

/// Stable name of one output stream of an instance, used to tag frames and
/// filter-graph pads: `"<instance id>:<output index>"`.
pub fn stream_tag(id: InstanceId, index: usize) -> String {
    format!("{}:{}", id.0, index)
}

/// Completion pass run before compiling: for each (input ref, declared
/// output metadata) pair, splice in an implicit format filter when the
/// relevant format fields disagree, and redirect the ref to the new node.
///
/// Guarantees the executing context never receives stream pairs with
/// incompatible formats. Media types of each pair must match.
pub fn complete_formats(
    arena: &mut NodeArena,
    in_refs: &[StreamRef],
    out_streams: &[StreamMetadata],
) -> ClipflowResult<Vec<StreamRef>> {
    if in_refs.len() != out_streams.len() {
        return Err(ClipflowError::build(format!(
            "target declares {} output streams for {} input refs",
            out_streams.len(),
            in_refs.len()
        )));
    }
    let mut completed = Vec::with_capacity(in_refs.len());
    for (&r, want) in in_refs.iter().zip(out_streams) {
        let have = arena.stream(r);
        let mismatch = match (have, want) {
            (StreamMetadata::Video(h), StreamMetadata::Video(w)) => {
                h.pixel_format != w.pixel_format
            }
            (StreamMetadata::Audio(h), StreamMetadata::Audio(w)) => {
                h.sample_format != w.sample_format
                    || h.sample_rate != w.sample_rate
                    || h.channel_layout != w.channel_layout
            }
            _ => {
                return Err(ClipflowError::build(
                    "target media type disagrees with its input ref",
                ));
            }
        };
        completed.push(if mismatch {
            insert_format(arena, r, want)?
        } else {
            r
        });
    }
    Ok(completed)
}

/// Compile the subgraph reachable backward from `target`.
#[tracing::instrument(skip(arena))]
pub fn build_graph(arena: &NodeArena, target: NodeId) -> ClipflowResult<GraphInstance> {
    if !matches!(arena.get(target), Some(UserNode::Target(_))) {
        return Err(ClipflowError::build("build_graph: root must be a target node"));
    }

    // Phase 1: depth-first backward discovery, emitted in postorder so a
    // node appears after all of its inputs. A visited node is never emitted
    // again; that is the deduplication.
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut order: Vec<NodeId> = Vec::new();
    visit(arena, target, &mut visited, &mut order);
    let ids: HashMap<NodeId, InstanceId> = order
        .iter()
        .enumerate()
        .map(|(position, &node)| (node, InstanceId(position as u32)))
        .collect();

    // Phase 2: convert each node, rewriting refs to instance addressing.
    let rewrite = |refs: &[StreamRef]| -> Vec<InstanceRef> {
        refs.iter()
            .map(|r| InstanceRef {
                from: ids[&r.node],
                index: r.index,
            })
            .collect()
    };

    let mut nodes = Vec::with_capacity(order.len());
    let mut sources = Vec::new();
    let mut filters = Vec::new();
    let mut targets = Vec::new();
    for &node_id in &order {
        let id = ids[&node_id];
        let instance = match arena.node(node_id) {
            UserNode::Source(s) => {
                sources.push(id);
                InstanceNode::Source {
                    source: s.source,
                    shape: s.shape.clone(),
                    out_streams: s.out_streams.clone(),
                }
            }
            UserNode::Filter(f) => {
                filters.push(id);
                InstanceNode::Filter {
                    in_refs: rewrite(&f.in_refs),
                    out_streams: f.out_streams.clone(),
                    op: f.op.clone(),
                }
            }
            UserNode::Target(t) => {
                targets.push(id);
                InstanceNode::Target {
                    in_refs: rewrite(&t.in_refs),
                    out_streams: t.out_streams.clone(),
                    container: t.container.clone(),
                }
            }
        };
        nodes.push(instance);
    }

    let filter_layout = if filters.is_empty() {
        None
    } else {
        let is_source = |id: InstanceId| matches!(nodes[id.0 as usize], InstanceNode::Source { .. });
        let is_filter = |id: InstanceId| matches!(nodes[id.0 as usize], InstanceNode::Filter { .. });

        // Every ref a filter pulls straight from a source feeds the filter
        // graph; every target ref produced by a filter drains it.
        let mut inputs: Vec<InstanceRef> = Vec::new();
        for &id in &filters {
            let InstanceNode::Filter { in_refs, .. } = &nodes[id.0 as usize] else {
                unreachable!("filters list only holds filter instances");
            };
            for &r in in_refs {
                if is_source(r.from) && !inputs.contains(&r) {
                    inputs.push(r);
                }
            }
        }
        let mut outputs: Vec<InstanceRef> = Vec::new();
        for &id in &targets {
            let InstanceNode::Target { in_refs, .. } = &nodes[id.0 as usize] else {
                unreachable!("targets list only holds target instances");
            };
            for &r in in_refs {
                if is_filter(r.from) && !outputs.contains(&r) {
                    outputs.push(r);
                }
            }
        }
        // Postorder emission already places producers first.
        Some(FilterLayout {
            inputs,
            outputs,
            filters: filters.clone(),
        })
    };

    tracing::debug!(
        nodes = nodes.len(),
        sources = sources.len(),
        filters = filters.len(),
        "graph compiled"
    );
    Ok(GraphInstance {
        nodes,
        sources,
        filters,
        targets,
        filter_layout,
    })
}

fn visit(
    arena: &NodeArena,
    node: NodeId,
    visited: &mut HashSet<NodeId>,
    order: &mut Vec<NodeId>,
) {
    if !visited.insert(node) {
        return;
    }
    for r in arena.node(node).in_refs() {
        visit(arena, r.node, visited, order);
    }
    order.push(node);
}

/// Build the engine-facing flat filter description for a compiled graph, or
/// `None` when the graph has no filter subgraph.
///
/// The spec string chains one `[in_refs]name=key=val:key=val[out_refs]`
/// clause per filter node with `;`, in the producer-first order established
/// by [`build_graph`].
pub fn filter_graph_spec(graph: &GraphInstance) -> Option<FilterGraphSpec> {
    let layout = graph.filter_layout.as_ref()?;

    let clauses: Vec<String> = layout
        .filters
        .iter()
        .map(|&id| {
            let InstanceNode::Filter {
                in_refs,
                out_streams,
                op,
            } = graph.node(id)
            else {
                unreachable!("filter layout only holds filter instances");
            };
            let ins: String = in_refs
                .iter()
                .map(|r| format!("[{}]", stream_tag(r.from, r.index)))
                .collect();
            let outs: String = (0..out_streams.len())
                .map(|i| format!("[{}]", stream_tag(id, i)))
                .collect();
            let args = if op.args.is_empty() {
                String::new()
            } else {
                let pairs: Vec<String> = op
                    .args
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                format!("={}", pairs.join(":"))
            };
            format!("{ins}{}{args}{outs}", op.name)
        })
        .collect();

    let inputs = layout
        .inputs
        .iter()
        .map(|&r| {
            let s = graph.stream(r);
            FilterPad {
                tag: stream_tag(r.from, r.index),
                media_type: s.media_type(),
                args: buffersrc_args(s),
            }
        })
        .collect();
    let outputs = layout
        .outputs
        .iter()
        .map(|&r| FilterPad {
            tag: stream_tag(r.from, r.index),
            media_type: graph.stream(r).media_type(),
            args: String::new(),
        })
        .collect();

    Some(FilterGraphSpec {
        spec: clauses.join(";"),
        inputs,
        outputs,
    })
}

fn buffersrc_args(s: &StreamMetadata) -> String {
    match s {
        StreamMetadata::Video(v) => format!(
            "width={}:height={}:pix_fmt={}:time_base={}:pixel_aspect={}",
            v.width,
            v.height,
            v.pixel_format,
            v.common.time_base.as_arg(),
            v.sample_aspect_ratio.as_arg(),
        ),
        StreamMetadata::Audio(a) => format!(
            "time_base={}:sample_rate={}:sample_fmt={}:channel_layout={}",
            a.common.time_base.as_arg(),
            a.sample_rate,
            a.sample_format,
            a.channel_layout,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::rational::Rational;
    use crate::graph::filters::{TrimArgs, apply_merge, apply_trim, apply_volume};
    use crate::graph::metadata::{AudioStream, FormatMetadata, StreamCommon, VideoStream};
    use crate::graph::node::{SourceNode, TargetNode};

    fn common(duration: f64) -> StreamCommon {
        StreamCommon {
            index: 0,
            time_base: Rational::new(1, 48000),
            start_time: 0.0,
            duration,
            bit_rate: 0,
            codec_name: "test".into(),
            extra_data: vec![],
        }
    }

    fn audio(duration: f64) -> StreamMetadata {
        StreamMetadata::Audio(AudioStream {
            common: common(duration),
            volume: 1.0,
            sample_format: "fltp".into(),
            sample_rate: 48000,
            channels: 2,
            channel_layout: "stereo".into(),
        })
    }

    fn video(pixel_format: &str) -> StreamMetadata {
        StreamMetadata::Video(VideoStream {
            common: common(10.0),
            width: 64,
            height: 64,
            pixel_format: pixel_format.into(),
            frame_rate: Rational::new(30, 1),
            sample_aspect_ratio: Rational::new(1, 1),
        })
    }

    fn add_source(arena: &mut NodeArena, streams: Vec<StreamMetadata>) -> Vec<StreamRef> {
        let count = streams.len();
        let node = arena
            .insert(UserNode::Source(SourceNode {
                source: SourceId(arena.len() as u32),
                shape: SourceShape::Seekable {
                    url: String::new(),
                    size: 0,
                },
                container: FormatMetadata {
                    format_name: "test".into(),
                    duration: 0.0,
                    bit_rate: 0,
                },
                out_streams: streams,
            }))
            .unwrap();
        (0..count).map(|index| StreamRef { node, index }).collect()
    }

    fn add_target(arena: &mut NodeArena, in_refs: Vec<StreamRef>) -> NodeId {
        let out_streams = in_refs.iter().map(|&r| arena.stream(r).clone()).collect();
        arena
            .insert(UserNode::Target(TargetNode {
                in_refs,
                out_streams,
                container: ContainerSpec {
                    format_name: "mp4".into(),
                },
            }))
            .unwrap()
    }

    #[test]
    fn shared_node_compiles_to_one_instance() {
        let mut arena = NodeArena::new();
        let src = add_source(&mut arena, vec![audio(5.0)]);
        // Two distinct filter chains over the same source.
        let left = apply_volume(&mut arena, &src, 0.5).unwrap();
        let right = apply_trim(
            &mut arena,
            &src,
            TrimArgs {
                start: 0.0,
                duration: 2.0,
            },
        )
        .unwrap();
        let merged = apply_merge(&mut arena, &[left, right]).unwrap();
        let target = add_target(&mut arena, merged);

        let graph = build_graph(&arena, target).unwrap();
        assert_eq!(graph.sources.len(), 1, "source deduplicated across paths");
        // target + merge + volume + trim + source
        assert_eq!(graph.nodes.len(), 5);
    }

    #[test]
    fn graph_without_filters_has_no_layout() {
        let mut arena = NodeArena::new();
        let src = add_source(&mut arena, vec![audio(5.0)]);
        let target = add_target(&mut arena, src);
        let graph = build_graph(&arena, target).unwrap();
        assert!(graph.filter_layout.is_none());
        assert!(filter_graph_spec(&graph).is_none());
    }

    #[test]
    fn filter_list_is_producer_first() {
        let mut arena = NodeArena::new();
        let src = add_source(&mut arena, vec![audio(5.0)]);
        let trimmed = apply_trim(
            &mut arena,
            &src,
            TrimArgs {
                start: 0.0,
                duration: 2.0,
            },
        )
        .unwrap();
        let quiet = apply_volume(&mut arena, &trimmed, 0.5).unwrap();
        let target = add_target(&mut arena, quiet);

        let graph = build_graph(&arena, target).unwrap();
        let layout = graph.filter_layout.as_ref().unwrap();
        assert_eq!(layout.filters.len(), 2);
        let names: Vec<_> = layout
            .filters
            .iter()
            .map(|&id| match graph.node(id) {
                InstanceNode::Filter { op, .. } => op.name.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["atrim".to_string(), "volume".to_string()]);
        assert_eq!(layout.inputs.len(), 1);
        assert_eq!(layout.outputs.len(), 1);
    }

    #[test]
    fn shared_filter_producer_precedes_both_consumers() {
        let mut arena = NodeArena::new();
        let src = add_source(&mut arena, vec![audio(5.0)]);
        // Diamond: one trim feeding two volume branches that merge again.
        let trimmed = apply_trim(
            &mut arena,
            &src,
            TrimArgs {
                start: 0.0,
                duration: 4.0,
            },
        )
        .unwrap();
        let left = apply_volume(&mut arena, &trimmed, 0.5).unwrap();
        let right = apply_volume(&mut arena, &trimmed, 0.25).unwrap();
        let merged = apply_merge(&mut arena, &[left, right]).unwrap();
        let target = add_target(&mut arena, merged);

        let graph = build_graph(&arena, target).unwrap();
        let layout = graph.filter_layout.as_ref().unwrap();
        assert_eq!(layout.filters.len(), 4);
        let position: HashMap<InstanceId, usize> = layout
            .filters
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();
        for &id in &layout.filters {
            let InstanceNode::Filter { in_refs, .. } = graph.node(id) else {
                unreachable!();
            };
            for r in in_refs {
                if let Some(&producer) = position.get(&r.from) {
                    assert!(
                        producer < position[&id],
                        "filter {id:?} listed before its producer {:?}",
                        r.from
                    );
                }
            }
        }
    }

    #[test]
    fn mismatched_pixel_format_inserts_exactly_one_format_filter() {
        let mut arena = NodeArena::new();
        let src = add_source(&mut arena, vec![video("yuv422p")]);
        let declared = vec![video("yuv420p")];
        let completed = complete_formats(&mut arena, &src, &declared).unwrap();
        let target = arena
            .insert(UserNode::Target(TargetNode {
                in_refs: completed,
                out_streams: declared,
                container: ContainerSpec {
                    format_name: "mp4".into(),
                },
            }))
            .unwrap();

        let graph = build_graph(&arena, target).unwrap();
        assert_eq!(graph.filters.len(), 1);
        let InstanceNode::Filter { op, out_streams, .. } = graph.node(graph.filters[0]) else {
            panic!("expected filter instance");
        };
        assert_eq!(op.name, "format");
        assert_eq!(out_streams[0].as_video().unwrap().pixel_format, "yuv420p");
    }

    #[test]
    fn matching_formats_insert_nothing() {
        let mut arena = NodeArena::new();
        let src = add_source(&mut arena, vec![video("yuv420p")]);
        let declared = vec![video("yuv420p")];
        let completed = complete_formats(&mut arena, &src, &declared).unwrap();
        assert_eq!(completed, src);
    }

    #[test]
    fn compiled_graph_survives_wire_serialization() {
        let mut arena = NodeArena::new();
        let src = add_source(&mut arena, vec![audio(5.0)]);
        let quiet = apply_volume(&mut arena, &src, 0.5).unwrap();
        let target = add_target(&mut arena, quiet);
        let graph = build_graph(&arena, target).unwrap();

        let wire = serde_json::to_string(&graph).unwrap();
        let back: GraphInstance = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.nodes.len(), graph.nodes.len());
        assert_eq!(back.filters, graph.filters);
        let InstanceNode::Filter { op, .. } = back.node(back.filters[0]) else {
            panic!("expected filter instance");
        };
        assert_eq!(op.name, "volume");
    }

    #[test]
    fn spec_string_chains_clauses_producer_first() {
        let mut arena = NodeArena::new();
        let src = add_source(&mut arena, vec![audio(5.0)]);
        let trimmed = apply_trim(
            &mut arena,
            &src,
            TrimArgs {
                start: 1.0,
                duration: 2.0,
            },
        )
        .unwrap();
        let quiet = apply_volume(&mut arena, &trimmed, 0.5).unwrap();
        let target = add_target(&mut arena, quiet);
        let graph = build_graph(&arena, target).unwrap();

        let spec = filter_graph_spec(&graph).unwrap();
        let clauses: Vec<&str> = spec.spec.split(';').collect();
        assert_eq!(clauses.len(), 2);
        assert!(clauses[0].contains("atrim=start=1:duration=2"));
        assert!(clauses[1].contains("volume=volume=0.5"));
        // producer's output pad is consumer's input pad
        let out_pad = &clauses[0][clauses[0].rfind('[').unwrap()..];
        assert!(clauses[1].starts_with(out_pad));
        assert_eq!(spec.inputs.len(), 1);
        assert!(spec.inputs[0].args.contains("sample_rate=48000"));
        assert!(spec.outputs[0].args.is_empty());
    }
}
