//! Shared foundation types: the crate error taxonomy and exact rationals.

pub mod error;
pub mod rational;
