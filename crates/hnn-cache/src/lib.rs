//! # hnn-cache
//!
//! Streaming utterance cache for RustHNN.
//!
//! This crate handles:
//! - Reading the utterance manifest
//! - Loading observations and labels up to a resident-frame ceiling
//! - Visiting orders (sequential, shuffled, frame-random, parallel streams)
//! - Releasing utterances once all their frames were consumed

pub mod cache;
pub mod manifest;
pub mod shuffle;
pub mod utterance;

pub use cache::{CacheBatch, CacheStats, StreamingCache};
pub use manifest::Manifest;
pub use shuffle::{LFSR_MAX_LEN, lfsr_permute, random_exchange};
pub use utterance::UttElem;
