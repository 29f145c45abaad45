//! Cursor pagination over time-ordered streams.
//!
//! A page reads one item past its limit. The extra item is never shown; it
//! only tells whether an "older" link is needed, so no count query is run.
//! Cursors are inclusive bounds on the stream's sort key placed one unit
//! past the edge of the current page, so adjacent pages neither overlap
//! nor leave a gap.

use std::future;
use std::pin::pin;

use futures_util::stream::{self, Stream};
use futures_util::{StreamExt, TryStreamExt};
use loom_store::{Commit, FeedId, FeedOptions, GitRepo, LogStore, Message, ObjectId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{COMMIT_FETCH_CONCURRENCY, ViewError};

/// What a feed is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortKey {
    /// Claimed timestamp in milliseconds. Used by the global feed.
    Timestamp,
    /// Position in the author's feed. Used by per-author feeds.
    Sequence,
}

impl SortKey {
    pub fn of(self, message: &Message) -> i64 {
        match self {
            SortKey::Timestamp => message.value.timestamp,
            SortKey::Sequence => message.value.sequence as i64,
        }
    }
}

/// Inclusive bounds of a page request, as carried in query strings.
///
/// Only `gte` set means the reader is walking towards newer items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<i64>,
}

impl Cursor {
    /// Everything strictly older than `key`, or `None` when `key` is the
    /// smallest representable sort key.
    pub fn older_than(key: i64) -> Option<Self> {
        Some(Self {
            lte: Some(key.checked_sub(1)?),
            gte: None,
        })
    }

    /// Everything strictly newer than `key`, or `None` at the largest key.
    pub fn newer_than(key: i64) -> Option<Self> {
        Some(Self {
            lte: None,
            gte: Some(key.checked_add(1)?),
        })
    }

    pub fn is_first_page(&self) -> bool {
        self.lte.is_none() && self.gte.is_none()
    }

    pub fn is_forwards(&self) -> bool {
        self.gte.is_some() && self.lte.is_none()
    }

    /// Query string for this cursor, without the leading `?`.
    pub fn to_query(&self) -> String {
        match (self.lte, self.gte) {
            (Some(lte), Some(gte)) => format!("lte={}&gte={}", lte, gte),
            (Some(lte), None) => format!("lte={}", lte),
            (None, Some(gte)) => format!("gte={}", gte),
            (None, None) => String::new(),
        }
    }
}

/// Up to `limit` items plus the one that followed them, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Window<T> {
    pub items: Vec<T>,
    pub lookahead: Option<T>,
}

/// Read up to `limit` items and peek at one more.
pub async fn take_window<S, T, E>(stream: S, limit: usize) -> Result<Window<T>, E>
where
    S: Stream<Item = Result<T, E>>,
{
    let mut stream = pin!(stream);
    let mut items = Vec::with_capacity(limit);
    while items.len() < limit {
        match stream.try_next().await? {
            Some(item) => items.push(item),
            None => {
                return Ok(Window {
                    items,
                    lookahead: None,
                });
            }
        }
    }
    let lookahead = stream.try_next().await?;
    Ok(Window { items, lookahead })
}

/// A page of feed items, newest first, with navigation cursors.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedPage<T> {
    pub items: Vec<T>,
    pub newer: Option<Cursor>,
    pub older: Option<Cursor>,
}

/// Result of a page request.
#[derive(Debug, Clone, PartialEq)]
pub enum Paged<T> {
    Page(FeedPage<T>),
    /// Nothing at all matched the request.
    Empty,
}

impl<T> Paged<T> {
    pub fn page(self) -> Option<FeedPage<T>> {
        match self {
            Paged::Page(page) => Some(page),
            Paged::Empty => None,
        }
    }
}

/// A request for one page of the global or a per-author feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedQuery {
    pub author: Option<FeedId>,
    pub cursor: Cursor,
    pub limit: usize,
}

impl FeedQuery {
    pub fn global(limit: usize) -> Self {
        Self {
            author: None,
            cursor: Cursor::default(),
            limit,
        }
    }

    pub fn author(author: impl Into<FeedId>, limit: usize) -> Self {
        Self {
            author: Some(author.into()),
            cursor: Cursor::default(),
            limit,
        }
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn sort_key(&self) -> SortKey {
        if self.author.is_some() {
            SortKey::Sequence
        } else {
            SortKey::Timestamp
        }
    }
}

/// Read one page of the feed, keeping only messages that pass `filter`.
pub async fn feed_page<F>(
    store: &dyn LogStore,
    query: &FeedQuery,
    filter: F,
) -> Result<Paged<Message>, ViewError>
where
    F: Fn(&Message) -> bool,
{
    if query.limit == 0 {
        return Err(ViewError::validation("page size must be positive"));
    }

    let forwards = query.cursor.is_forwards();
    let options = FeedOptions {
        author: query.author.clone(),
        reverse: !forwards,
        lte: query.cursor.lte,
        gte: query.cursor.gte,
        limit: None,
    };
    let stream = store
        .feed_stream(options)
        .try_filter(|message| future::ready(filter(message)));
    let Window {
        mut items,
        lookahead,
    } = take_window(stream, query.limit).await?;

    let (Some(first), Some(last)) = (items.first(), items.last()) else {
        debug!(author = ?query.author, cursor = ?query.cursor, "feed: empty page");
        return Ok(Paged::Empty);
    };

    let key = query.sort_key();
    let (newer, older) = if forwards {
        // Read oldest first: the lookahead is newer than the page.
        let newer = lookahead.and_then(|_| Cursor::newer_than(key.of(last)));
        let older = Cursor::older_than(key.of(first));
        (newer, older)
    } else {
        let newer = if query.cursor.is_first_page() {
            None
        } else {
            Cursor::newer_than(key.of(first))
        };
        let older = lookahead.and_then(|_| Cursor::older_than(key.of(last)));
        (newer, older)
    };
    if forwards {
        items.reverse();
    }

    Ok(Paged::Page(FeedPage {
        items,
        newer,
        older,
    }))
}

/// One page of a repository's commit log.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitPage {
    pub commits: Vec<Commit>,
    /// Where the next page starts.
    pub older: Option<ObjectId>,
    /// Whether the page starts at the tip of the branch.
    pub is_first: bool,
}

/// Read `limit` commits along first parents from `start` (or `rev`).
pub async fn commit_page(
    repo: &dyn GitRepo,
    rev: &str,
    start: Option<&str>,
    limit: usize,
) -> Result<CommitPage, ViewError> {
    if limit == 0 {
        return Err(ViewError::validation("page size must be positive"));
    }
    let Window { items, lookahead } = take_window(repo.read_log(start.unwrap_or(rev)), limit).await?;
    let commits: Vec<Commit> = stream::iter(items)
        .map(|id| async move { repo.get_commit(&id).await })
        .buffered(COMMIT_FETCH_CONCURRENCY)
        .try_collect()
        .await?;
    Ok(CommitPage {
        commits,
        older: lookahead,
        is_first: start.is_none(),
    })
}
