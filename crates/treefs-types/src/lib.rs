//! Shared node types for treefs.
//!
//! This crate is the leaf of the workspace: typed node IDs and the node
//! row/listing types. It has **no internal treefs dependencies**.
//!
//! # Key Types
//!
//! |-----------------|---------------------------------------------|
//! | Type            | Purpose                                     |
//! |-----------------|---------------------------------------------|
//! | [`NodeId`]      | Immutable node identity (UUIDv7)            |
//! | [`NodeKind`]    | Folder or file                              |
//! | [`Node`]        | Full row (name, parent, content, times)     |
//! | [`NodeSummary`] | Listing entry (id + name + kind)            |
//! | [`NodeStat`]    | Metadata with computed subtree size         |
//! |-----------------|---------------------------------------------|

pub mod ids;
pub mod node;

pub use ids::NodeId;
pub use node::{Node, NodeKind, NodeStat, NodeSummary};

/// Current time as Unix milliseconds. Used by constructors throughout the crate.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
