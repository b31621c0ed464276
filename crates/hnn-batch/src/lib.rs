//! # hnn-batch
//!
//! Batch assembly for RustHNN.
//!
//! This crate handles:
//! - Context-expanded input matrices built from cache-resident frames
//! - Mixture matrices, aliased or concatenated
//! - One-hot and feature label targets
//! - Error accumulation along the mirror error graph

pub mod assembler;
pub mod gradient;

pub use assembler::BatchAssembler;
pub use gradient::accumulate_errors;
