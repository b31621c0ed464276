//! # hnn-graph
//!
//! Computation-graph layer for RustHNN.
//!
//! This crate handles:
//! - Tensor bundles and the reference-counted arena that owns them
//! - Feature elements, mixtures, layers and networks
//! - Derivation-context propagation and the mirror error graph

pub mod arena;
pub mod builder;
pub mod bundle;
pub mod context;
pub mod graph;

pub use arena::{Arena, ArenaId, BufferId, BundleId, ElemId, LayerId, MixId};
pub use builder::build_graph;
pub use bundle::{Companion, TensorBundle};
pub use context::{
    cache_fed_mixes, consumer_first_order, expand_context, merge_contexts, propagate_context,
    shift_context,
};
pub use graph::{
    ElemSource, ErrorElem, ErrorMix, FeaElem, FeaMix, FeatureGraph, GradientBuffer, LayerElem,
    Network,
};
