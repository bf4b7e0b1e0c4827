//! The declarative graph layer: stream metadata, the user node model, filter
//! application, and the compiler that flattens a node graph into an
//! id-addressed instance graph.

pub mod build;
pub mod filters;
pub mod metadata;
pub mod node;
