//! HTML pages over loom's read models.
//!
//! This crate provides the router for:
//! - The global activity feed and per-user feeds
//! - Repository pages, file trees, commit logs and commit diffs
//! - Push activity, forks, issues and pull requests
//! - Comparing branches across a repository and its forks
//! - Dig (upvote) listings for users and repositories
//! - Raw files and blobs

mod error;
mod html;
mod issues;
mod routes;

pub use error::WebError;
pub use routes::{AppState, create_router};
