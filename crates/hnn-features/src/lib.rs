//! # hnn-features
//!
//! Observation and label readers for RustHNN.
//!
//! This crate handles:
//! - HTK parameter files (uncompressed, big-endian)
//! - HTK label files converted to per-frame targets
//! - Feature labels read from a parallel set of parameter files
//! - In-memory readers for tests and embedding

pub mod htk;
pub mod labels;
pub mod memory;

pub use htk::{HtkHeader, HtkObservationReader, read_htk_params, write_htk_params};
pub use labels::{FeatureLabelSource, HtkLabelSource, TargetList, read_label_segments};
pub use memory::{MemoryLabelSource, MemoryObservationReader};
