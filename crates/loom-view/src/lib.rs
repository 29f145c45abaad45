//! Memoized read models over loom's message log.
//!
//! This crate provides:
//! - A single-flight async memo shared by every derived view
//! - Display names and avatars kept current from a live tail
//! - Live vote tallies
//! - Lookahead pagination for feeds and commit logs
//! - Tree diffs with lazily fetched line diffs
//! - Issues and pull requests, forks and cross-repo comparisons
//! - Locale catalogs with a fallback chain

pub mod about;
pub mod compare;
mod error;
pub mod diff;
pub mod i18n;
pub mod issues;
pub mod live;
pub mod memo;
pub mod paginate;
pub mod repos;
pub mod votes;

pub use about::{About, AboutKey, AboutResolver, fallback_name};
pub use compare::{COMPARE_COMMIT_LIMIT, Comparison, compare};
pub use diff::{ChangeKind, DiffEntry, DiffLine, DiffSides, FileContent, FileDiff, Hunk, LineTag, Side};
pub use error::{ErrorKind, ViewError};
pub use i18n::{Catalogs, Translator};
pub use issues::{Issue, IssueKind, PullTarget, StateFilter, ThreadEntry, ThreadEvent};
pub use memo::AsyncMemo;
pub use paginate::{CommitPage, Cursor, FeedPage, FeedQuery, Paged, SortKey};
pub use repos::{DugRepo, Fork, RefUpdate, RepoUpdate, UserRepo};
pub use votes::{VoteAggregator, VoteTally};

/// Concurrent author and repo name lookups per page.
pub const NAME_LOOKUP_CONCURRENCY: usize = 8;

/// Concurrent message fetches when listing the repos a user dug.
pub const DUG_REPO_CONCURRENCY: usize = 12;

/// Concurrent blob pairs fetched for one diff.
pub const DIFF_FETCH_CONCURRENCY: usize = 4;

/// Concurrent commit reads per commit log page.
pub const COMMIT_FETCH_CONCURRENCY: usize = 8;

/// Concurrent state lookups when listing issues.
pub const ISSUE_STATE_CONCURRENCY: usize = 8;
