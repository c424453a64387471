//! Manifests for Coldstream
//!
//! The partition manifest is the authoritative description of a
//! partition's uploaded segments; the topic manifest is a topic-level
//! configuration snapshot written by partition zero's worker.

pub mod codec;
pub mod partition;
pub mod topic;

pub use partition::{AddResult, PartitionManifest, SegmentMeta};
pub use topic::TopicManifest;
