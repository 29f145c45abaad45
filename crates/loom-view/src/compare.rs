//! Comparing a revision of one repository with a revision of another.
//!
//! Used for the compare page and for pull requests from forks. Commits are
//! followed along first parents from the head until the base commit shows
//! up, so a fork that merged upstream changes lists only its own work up to
//! the merge.

use std::future;

use futures_util::{StreamExt, TryStreamExt, stream};
use loom_store::{Commit, GitRepo, ObjectId};
use tracing::debug;

use crate::diff::{DiffSides, FileDiff};
use crate::paginate::{Window, take_window};
use crate::{COMMIT_FETCH_CONCURRENCY, ViewError};

/// Most commits listed for one comparison.
pub const COMPARE_COMMIT_LIMIT: usize = 250;

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub base: ObjectId,
    pub head: ObjectId,
    /// Commits on the head side missing from the base, oldest first.
    pub commits: Vec<Commit>,
    /// More commits than [`COMPARE_COMMIT_LIMIT`] were found.
    pub truncated: bool,
    pub files: Vec<FileDiff>,
}

impl Comparison {
    pub fn is_empty(&self) -> bool {
        self.base == self.head
    }
}

/// Compare `head_rev` of `head` against `base_rev` of `base`.
pub async fn compare(
    base: &dyn GitRepo,
    base_rev: &str,
    head: &dyn GitRepo,
    head_rev: &str,
) -> Result<Comparison, ViewError> {
    if base_rev.is_empty() || head_rev.is_empty() {
        return Err(ViewError::validation("compare needs a base and a head revision"));
    }
    let (base_id, head_id) = futures_util::try_join!(base.resolve_ref(base_rev), head.resolve_ref(head_rev))?;

    let log = head
        .read_log(&head_id)
        .try_take_while(|id| future::ready(Ok(*id != base_id)));
    let Window { items, lookahead } = take_window(log, COMPARE_COMMIT_LIMIT).await?;
    let mut commits: Vec<Commit> = stream::iter(items)
        .map(|id| async move { head.get_commit(&id).await })
        .buffered(COMMIT_FETCH_CONCURRENCY)
        .try_collect()
        .await?;
    commits.reverse();

    let sides = DiffSides {
        before: base,
        after: head,
    };
    let entries = sides.diff(Some(&base_id), &head_id).await?;
    let files = sides.file_diffs(entries).await;
    debug!(
        base = %base.id(),
        head = %head.id(),
        commits = commits.len(),
        files = files.len(),
        "compare: done"
    );
    Ok(Comparison {
        base: base_id,
        head: head_id,
        commits,
        truncated: lookahead.is_some(),
        files,
    })
}
