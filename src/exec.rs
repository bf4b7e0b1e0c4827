//! The execution layer: the request/reply protocol between the orchestrating
//! and executing contexts, the worker that owns the engine, the per-step
//! graph runtime, and the orchestrator-side export surface.

pub mod export;
pub mod message;
pub(crate) mod runtime;
pub(crate) mod worker;
