//! The filter application layer.
//!
//! Each operation validates its arguments against the metadata its input
//! references denote, then inserts a new [`FilterNode`] with derived output
//! metadata and returns references to that node's outputs. Violations fail
//! synchronously at build time; nothing flows downstream.
//!
//! Single-input operations apply per stream: `apply_trim` over three stream
//! refs creates three filter nodes. A single-input application that changes
//! nothing for any input (e.g. `apply_volume` over video-only refs) is
//! itself a build error, so a silent no-op can never look like a successful
//! build.

use serde::{Deserialize, Serialize};

use crate::foundation::error::{ClipflowError, ClipflowResult};
use crate::graph::metadata::{MediaType, StreamMetadata};
use crate::graph::node::{FilterNode, FilterOp, NodeArena, StreamRef, UserNode};

/// Arguments for [`apply_trim`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrimArgs {
    /// Requested start, in seconds.
    pub start: f64,
    /// Requested duration, in seconds.
    pub duration: f64,
}

fn typed_name(media: MediaType, video_name: &str, audio_name: &str) -> String {
    match media {
        MediaType::Video => video_name.to_string(),
        MediaType::Audio => audio_name.to_string(),
    }
}

fn push_filter(
    arena: &mut NodeArena,
    in_refs: Vec<StreamRef>,
    out_streams: Vec<StreamMetadata>,
    op: FilterOp,
) -> ClipflowResult<Vec<StreamRef>> {
    let count = out_streams.len();
    let node = arena.insert(UserNode::Filter(FilterNode {
        in_refs,
        out_streams,
        op,
    }))?;
    Ok((0..count).map(|index| StreamRef { node, index }).collect())
}

/// Keep `[start, start + duration]` of each referenced stream.
///
/// The requested range must lie within the stream's own
/// `[start_time, start_time + duration]`; anything outside fails the build.
pub fn apply_trim(
    arena: &mut NodeArena,
    refs: &[StreamRef],
    args: TrimArgs,
) -> ClipflowResult<Vec<StreamRef>> {
    if refs.is_empty() {
        return Err(ClipflowError::build("trim: requires at least one input stream"));
    }
    let mut out = Vec::with_capacity(refs.len());
    for &r in refs {
        let s = arena.stream(r).clone();
        let end = args.start + args.duration;
        let source_end = s.start_time() + s.duration();
        if args.start < s.start_time() || end > source_end {
            return Err(ClipflowError::build(format!(
                "trim: requested [{}, {}] outside source range [{}, {}]",
                args.start,
                end,
                s.start_time(),
                source_end
            )));
        }
        let op = FilterOp {
            name: typed_name(s.media_type(), "trim", "atrim"),
            args: vec![
                ("start".into(), args.start.to_string()),
                ("duration".into(), args.duration.to_string()),
            ],
        };
        let metadata = s.with_range(args.start, args.duration);
        out.extend(push_filter(arena, vec![r], vec![metadata], op)?);
    }
    Ok(out)
}

/// Repeat each referenced stream `factor` times.
pub fn apply_loop(
    arena: &mut NodeArena,
    refs: &[StreamRef],
    factor: u32,
) -> ClipflowResult<Vec<StreamRef>> {
    if factor == 0 {
        return Err(ClipflowError::build("loop: factor must be > 0"));
    }
    if refs.is_empty() {
        return Err(ClipflowError::build("loop: requires at least one input stream"));
    }
    let mut out = Vec::with_capacity(refs.len());
    for &r in refs {
        let s = arena.stream(r).clone();
        let op = FilterOp {
            name: typed_name(s.media_type(), "loop", "aloop"),
            args: vec![("loop".into(), factor.to_string())],
        };
        let metadata = s.with_duration(s.duration() * f64::from(factor));
        out.extend(push_filter(arena, vec![r], vec![metadata], op)?);
    }
    Ok(out)
}

/// Scale the volume of each referenced audio stream.
///
/// Video streams pass through untouched (the same ref is returned). Applying
/// this to refs that contain no audio stream at all is a build error.
pub fn apply_volume(
    arena: &mut NodeArena,
    refs: &[StreamRef],
    volume: f64,
) -> ClipflowResult<Vec<StreamRef>> {
    let mut out = Vec::with_capacity(refs.len());
    let mut changed = 0usize;
    for &r in refs {
        let s = arena.stream(r).clone();
        let StreamMetadata::Audio(audio) = s else {
            out.push(r);
            continue;
        };
        let op = FilterOp {
            name: "volume".into(),
            args: vec![("volume".into(), volume.to_string())],
        };
        let mut derived = audio;
        derived.volume = volume;
        out.extend(push_filter(
            arena,
            vec![r],
            vec![StreamMetadata::Audio(derived)],
            op,
        )?);
        changed += 1;
    }
    if changed == 0 {
        return Err(ClipflowError::build(
            "volume: applies no change to any input stream",
        ));
    }
    Ok(out)
}

/// Mix N audio streams into one.
///
/// All audio inputs must share sample rate and sample format. Output duration
/// is the minimum over the inputs; the remaining fields are copied from the
/// first input. Non-audio refs pass through unchanged, ahead of the merged
/// output.
pub fn apply_merge(
    arena: &mut NodeArena,
    groups: &[Vec<StreamRef>],
) -> ClipflowResult<Vec<StreamRef>> {
    let refs: Vec<StreamRef> = groups.iter().flatten().copied().collect();
    let (audio_refs, other_refs): (Vec<_>, Vec<_>) = refs
        .into_iter()
        .partition(|&r| arena.stream(r).media_type() == MediaType::Audio);
    if audio_refs.is_empty() {
        return Err(ClipflowError::build("merge: requires at least one audio input"));
    }

    let streams: Vec<_> = audio_refs
        .iter()
        .map(|&r| arena.stream(r).as_audio().cloned().expect("partitioned audio"))
        .collect();
    let first = &streams[0];
    if streams.iter().any(|s| s.sample_rate != first.sample_rate) {
        return Err(ClipflowError::build("merge: all inputs must share sample rate"));
    }
    if streams.iter().any(|s| s.sample_format != first.sample_format) {
        return Err(ClipflowError::build(
            "merge: all inputs must share sample format",
        ));
    }

    let duration = streams
        .iter()
        .map(|s| s.common.duration)
        .fold(f64::INFINITY, f64::min);
    let merged = StreamMetadata::Audio(streams[0].clone()).with_duration(duration);
    let op = FilterOp {
        name: "amerge".into(),
        args: vec![("inputs".into(), audio_refs.len().to_string())],
    };
    let merged_refs = push_filter(arena, audio_refs, vec![merged], op)?;

    let mut out = other_refs;
    out.extend(merged_refs);
    Ok(out)
}

/// Join N equally shaped segments end to end.
///
/// Every segment must expose the same track count and per-position media
/// types as the first. Output duration is the sum over segments; the track
/// shape is preserved.
pub fn apply_concat(
    arena: &mut NodeArena,
    segments: &[Vec<StreamRef>],
) -> ClipflowResult<Vec<StreamRef>> {
    let Some(first) = segments.first() else {
        return Err(ClipflowError::build("concat: requires at least one segment"));
    };
    if first.is_empty() {
        return Err(ClipflowError::build("concat: segments must not be empty"));
    }
    let shape: Vec<MediaType> = first.iter().map(|&r| arena.stream(r).media_type()).collect();
    for segment in segments {
        if segment.len() != shape.len() {
            return Err(ClipflowError::build(
                "concat: all segments must have the same number of tracks",
            ));
        }
        for (&r, &media) in segment.iter().zip(&shape) {
            if arena.stream(r).media_type() != media {
                return Err(ClipflowError::build(
                    "concat: all segments must have the same audio/video track shape",
                ));
            }
        }
    }

    let duration: f64 = segments
        .iter()
        .map(|segment| arena.stream(segment[0]).duration())
        .sum();
    let out_streams: Vec<_> = first
        .iter()
        .map(|&r| arena.stream(r).with_duration(duration))
        .collect();
    let video = shape.iter().filter(|m| **m == MediaType::Video).count();
    let audio = shape.len() - video;
    let op = FilterOp {
        name: "concat".into(),
        args: vec![
            ("n".into(), segments.len().to_string()),
            ("v".into(), video.to_string()),
            ("a".into(), audio.to_string()),
        ],
    };
    let in_refs: Vec<StreamRef> = segments.iter().flatten().copied().collect();
    push_filter(arena, in_refs, out_streams, op)
}

/// Convert each referenced stream to the format fields of `want`.
///
/// Video refs take `want`'s pixel format; audio refs take its sample format,
/// sample rate and channel layout. Every ref's media type must match
/// `want`'s. A ref that already matches passes through unchanged; if all of
/// them do, the application is a no-op and fails the build.
pub fn apply_format(
    arena: &mut NodeArena,
    refs: &[StreamRef],
    want: &StreamMetadata,
) -> ClipflowResult<Vec<StreamRef>> {
    let mut out = Vec::with_capacity(refs.len());
    let mut changed = 0usize;
    for &r in refs {
        let matches_already = match (arena.stream(r), want) {
            (StreamMetadata::Video(have), StreamMetadata::Video(target)) => {
                have.pixel_format == target.pixel_format
            }
            (StreamMetadata::Audio(have), StreamMetadata::Audio(target)) => {
                have.sample_format == target.sample_format
                    && have.sample_rate == target.sample_rate
                    && have.channel_layout == target.channel_layout
            }
            _ => {
                return Err(ClipflowError::build(
                    "format: media types of stream and target disagree",
                ));
            }
        };
        if matches_already {
            out.push(r);
        } else {
            out.push(insert_format(arena, r, want)?);
            changed += 1;
        }
    }
    if changed == 0 {
        return Err(ClipflowError::build(
            "format: applies no change to any input stream",
        ));
    }
    Ok(out)
}

/// Insert an explicit format-conversion filter rewriting only the fields
/// where `want` disagrees with the stream behind `r`.
///
/// Used by the graph builder's completion pass and [`apply_format`]; the
/// media types of both sides must already match.
pub(crate) fn insert_format(
    arena: &mut NodeArena,
    r: StreamRef,
    want: &StreamMetadata,
) -> ClipflowResult<StreamRef> {
    let s = arena.stream(r).clone();
    let (op, metadata) = match (&s, want) {
        (StreamMetadata::Video(have), StreamMetadata::Video(target)) => {
            let mut derived = have.clone();
            derived.pixel_format = target.pixel_format.clone();
            let op = FilterOp {
                name: "format".into(),
                args: vec![("pix_fmts".into(), target.pixel_format.clone())],
            };
            (op, StreamMetadata::Video(derived))
        }
        (StreamMetadata::Audio(have), StreamMetadata::Audio(target)) => {
            let mut derived = have.clone();
            derived.sample_format = target.sample_format.clone();
            derived.sample_rate = target.sample_rate;
            derived.channel_layout = target.channel_layout.clone();
            let op = FilterOp {
                name: "aformat".into(),
                args: vec![
                    ("sample_fmts".into(), target.sample_format.clone()),
                    ("sample_rates".into(), target.sample_rate.to_string()),
                    ("channel_layouts".into(), target.channel_layout.clone()),
                ],
            };
            (op, StreamMetadata::Audio(derived))
        }
        _ => {
            return Err(ClipflowError::build(
                "format: media types of stream and target disagree",
            ));
        }
    };
    let refs = push_filter(arena, vec![r], vec![metadata], op)?;
    Ok(refs[0])
}
