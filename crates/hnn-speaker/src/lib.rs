//! # hnn-speaker
//!
//! Speaker-dependent parameter replacement for RustHNN.
//!
//! This crate handles:
//! - Speaker extraction from utterance names with HTK-style masks
//! - Per-speaker parameter files (safetensors)
//! - Installing and restoring replaceable bundles in a feature graph

pub mod mask;
pub mod store;
pub mod swap;

pub use mask::MaskMatcher;
pub use store::DirectoryStore;
pub use swap::{SpeakerOverride, SpeakerParameterSwap};
