//! Reply-chain clustering.
//!
//! Virtual topics are connected components of a channel's reply graph,
//! recomputed in full from stored messages on every query.

pub mod union_find;
pub mod builder;

pub use union_find::UnionFind;
pub use builder::{ReplyGraph, ReplyGraphBuilder};
