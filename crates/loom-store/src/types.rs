//! Core types for log messages and the queries run against them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::records::{
    ABOUT_TYPE, GIT_REPO_TYPE, GIT_UPDATE_TYPE, ISSUE_EDIT_TYPE, ISSUE_TYPE, POST_TYPE,
    PULL_REQUEST_TYPE, VOTE_TYPE,
};

/// Content-addressed message id (`%...`).
pub type MsgId = String;

/// Feed (author) id (`@...`).
pub type FeedId = String;

/// Content-addressed blob id (`&...`).
pub type BlobId = String;

/// A message as delivered by the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub key: MsgId,
    /// Local receive order. Strictly increasing across the whole store.
    pub seq: u64,
    pub value: MessageValue,
}

/// The signed part of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageValue {
    pub author: FeedId,
    /// Position in the author's own feed, starting at 1.
    pub sequence: u64,
    /// Claimed creation time in milliseconds since the epoch.
    pub timestamp: i64,
    pub content: Content,
}

impl Message {
    pub fn author(&self) -> &str {
        &self.value.author
    }

    pub fn timestamp(&self) -> i64 {
        self.value.timestamp
    }

    /// Creation time as a UTC datetime, if representable.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.value.timestamp)
    }

    pub fn content(&self) -> &Content {
        &self.value.content
    }
}

/// Typed message content, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Content {
    #[serde(rename = "git-repo")]
    GitRepo(GitRepoContent),
    #[serde(rename = "git-update")]
    GitUpdate(GitUpdateContent),
    #[serde(rename = "about")]
    About(AboutContent),
    #[serde(rename = "vote")]
    Vote(VoteContent),
    #[serde(rename = "issue")]
    Issue(IssueContent),
    #[serde(rename = "pull-request")]
    PullRequest(PullRequestContent),
    #[serde(rename = "issue-edit")]
    IssueEdit(IssueEditContent),
    #[serde(rename = "post")]
    Post(PostContent),
    /// Anything else, including content this node cannot read.
    #[serde(other)]
    Unknown,
}

impl Content {
    /// The `type` tag of this content.
    pub fn type_name(&self) -> &'static str {
        match self {
            Content::GitRepo(_) => GIT_REPO_TYPE,
            Content::GitUpdate(_) => GIT_UPDATE_TYPE,
            Content::About(_) => ABOUT_TYPE,
            Content::Vote(_) => VOTE_TYPE,
            Content::Issue(_) => ISSUE_TYPE,
            Content::PullRequest(_) => PULL_REQUEST_TYPE,
            Content::IssueEdit(_) => ISSUE_EDIT_TYPE,
            Content::Post(_) => POST_TYPE,
            Content::Unknown => "unknown",
        }
    }

    /// Outgoing links of this content as `(relation, destination)` pairs.
    pub fn links(&self) -> Vec<(Rel, String)> {
        let mut links = Vec::new();
        match self {
            Content::GitRepo(repo) => {
                if let Some(upstream) = &repo.upstream {
                    links.push((Rel::Upstream, upstream.clone()));
                }
            }
            Content::GitUpdate(update) => links.push((Rel::Repo, update.repo.clone())),
            Content::About(about) => {
                links.push((Rel::About, about.about.clone()));
                if let Some(image) = &about.image {
                    links.push((Rel::Image, image.id().to_string()));
                }
            }
            Content::Vote(vote) => {
                if let Some(link) = vote.vote.as_ref().and_then(|v| v.link.clone()) {
                    links.push((Rel::Vote, link));
                }
            }
            Content::Issue(issue) => links.push((Rel::Project, issue.project.clone())),
            Content::PullRequest(pr) => {
                links.push((Rel::Repo, pr.repo.clone()));
                if let Some(head) = &pr.head_repo {
                    links.push((Rel::HeadRepo, head.clone()));
                }
            }
            Content::IssueEdit(edit) => links.push((Rel::Issue, edit.issue.clone())),
            Content::Post(post) => {
                if let Some(root) = &post.root {
                    links.push((Rel::Root, root.clone()));
                }
            }
            Content::Unknown => {}
        }
        links
    }
}

/// Relation carried by a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rel {
    About,
    Image,
    Vote,
    Repo,
    HeadRepo,
    Project,
    Upstream,
    Root,
    Issue,
}

impl Rel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rel::About => "about",
            Rel::Image => "image",
            Rel::Vote => "vote",
            Rel::Repo => "repo",
            Rel::HeadRepo => "head-repo",
            Rel::Project => "project",
            Rel::Upstream => "upstream",
            Rel::Root => "root",
            Rel::Issue => "issue",
        }
    }
}

/// A reference to a blob, either `{ "link": id }` or a bare id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlobRef {
    Link { link: BlobId },
    Id(BlobId),
}

impl BlobRef {
    pub fn id(&self) -> &str {
        match self {
            BlobRef::Link { link } => link,
            BlobRef::Id(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GitRepoContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Repository this one was forked from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<MsgId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitUpdateContent {
    pub repo: MsgId,
    /// Ref name to new commit id; `None` deletes the ref.
    #[serde(default)]
    pub refs: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AboutContent {
    /// Target the assertion is about.
    pub about: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<BlobRef>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VoteContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<Vote>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Vote {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueContent {
    pub project: MsgId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestContent {
    pub repo: MsgId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_repo: Option<MsgId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Closes, reopens or renames an issue or pull request. Only the issue
/// author and the repository owner may do so.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueEditContent {
    pub issue: MsgId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostContent {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<MsgId>,
}

/// Query over link messages.
///
/// All filters are conjunctive. Historical queries yield matching messages
/// in receive order (newest first when `reverse`); live queries yield only
/// messages appended after the query was opened.
#[derive(Debug, Clone, Default)]
pub struct LinkQuery {
    pub source: Option<FeedId>,
    pub dest: Option<String>,
    pub rel: Option<Rel>,
    pub reverse: bool,
    pub limit: Option<usize>,
    /// Only messages with `timestamp >= gte`.
    pub gte: Option<i64>,
    pub live: bool,
}

impl LinkQuery {
    /// Links of a relation pointing at `dest`.
    pub fn to(dest: impl Into<String>, rel: Rel) -> Self {
        Self {
            dest: Some(dest.into()),
            rel: Some(rel),
            ..Default::default()
        }
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    pub fn since(mut self, timestamp: i64) -> Self {
        self.gte = Some(timestamp);
        self
    }

    /// Whether `message` passes the source/dest/rel/gte filters.
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(source) = &self.source
            && message.value.author != *source
        {
            return false;
        }
        if let Some(gte) = self.gte
            && message.value.timestamp < gte
        {
            return false;
        }
        if self.dest.is_none() && self.rel.is_none() {
            return !message.value.content.links().is_empty();
        }
        message.value.content.links().iter().any(|(rel, dest)| {
            self.rel.is_none_or(|r| r == *rel) && self.dest.as_ref().is_none_or(|d| d == dest)
        })
    }
}

/// Options for a time-ordered feed stream.
///
/// The sort key is the message timestamp for the global feed and the
/// author sequence number when `author` is set. Bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct FeedOptions {
    pub author: Option<FeedId>,
    pub reverse: bool,
    pub lte: Option<i64>,
    pub gte: Option<i64>,
    pub limit: Option<usize>,
}

impl FeedOptions {
    /// Sort key of `message` under these options.
    pub fn sort_key(&self, message: &Message) -> i64 {
        if self.author.is_some() {
            message.value.sequence as i64
        } else {
            message.value.timestamp
        }
    }
}

/// Query over messages of one content type, in receive order.
#[derive(Debug, Clone, Default)]
pub struct TypeQuery {
    pub type_name: String,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl TypeQuery {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// A message to append, before the store assigns its key and sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    /// Explicit key; derived from the message when absent.
    #[serde(default)]
    pub key: Option<MsgId>,
    pub author: FeedId,
    pub timestamp: i64,
    pub content: Content,
}
