//! Log, blob and git capabilities for loom.
//!
//! The aggregation layer only ever talks to the traits in this crate. An
//! in-memory implementation backs the binary and the tests.
//!
//! ## Features
//!
//! - **Capabilities**: `LogStore`, `BlobStore` and `GitRepo` traits
//! - **Messages**: typed content with derived links
//! - **Memory store**: append-only log with a live broadcast tail
//! - **Fixtures**: JSON files that populate a memory store

mod error;
pub mod fixture;
pub mod git;
pub mod memory;
mod records;
mod store;
mod types;

pub use error::StoreError;
pub use fixture::Fixture;
pub use git::{Commit, MemoryGitRepo, ObjectId, Signature, TreeEntry};
pub use memory::MemoryStore;
pub use records::*;
pub use store::{BlobStore, GitRepo, LogStore, MessageStream, RepoStore};
pub use types::*;
