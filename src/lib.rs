//! Repackaging engine for Android application archives.
//!
//! Unpacks an input archive so an external dex optimizer can rewrite its
//! executable units, then reassembles a deterministic, valid archive. Dex
//! files are treated as opaque byte blobs; the hard part is detecting and
//! inverting the historically-accumulated on-disk layouts for secondary
//! dexes and feature modules while preserving archive-level invariants.

pub mod core;
pub mod pack;

pub use crate::core::config::{RepackOptions, RunContext};
pub use crate::pack::orchestrator::{UnpackOrchestrator, UnpackSession};
