//! Remote object store access for Coldstream
//!
//! The `ObjectStoreClient` trait is the seam between the archiver and a
//! concrete store (S3, GCS, a local fake). `Remote` wraps a client with
//! the retry policy and lazy-abort semantics every archiver operation
//! uses. `paths` defines the stable remote key scheme.

pub mod client;
pub mod paths;
pub mod retry;

pub use client::{MemoryObjectStore, ObjectStoreClient};
pub use retry::{LazyAbort, Remote, RetryChain, RetryPolicy};
