//! The streaming I/O bridge: heterogeneous source descriptors normalized
//! into one pull/seek capability, and ordered reassembly of offset-tagged
//! output chunks.

pub mod sink;
pub mod source;
