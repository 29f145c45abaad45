//! Issues and pull requests.
//!
//! An issue is open until its author or the owner of its repository
//! closes it with an `issue-edit` message. Edits by anyone else are
//! ignored. Pull requests are issues against a repository that also name
//! a head repository and branch to merge from.

use std::collections::HashSet;
use std::future;

use futures_util::{StreamExt, TryStreamExt, stream};
use loom_store::{Content, FeedId, LinkQuery, LogStore, Message, MsgId, ObjectId, Rel};
use tracing::debug;

use crate::repos::parse_ref_name;
use crate::{ISSUE_STATE_CONCURRENCY, ViewError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    Issue,
    PullRequest,
}

/// Which issues a listing shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StateFilter {
    #[default]
    Open,
    Closed,
    All,
}

impl StateFilter {
    /// Parse the `state` query parameter. Absent means open.
    pub fn parse(state: Option<&str>) -> Result<Self, ViewError> {
        match state {
            None | Some("open") => Ok(StateFilter::Open),
            Some("closed") => Ok(StateFilter::Closed),
            Some("all") => Ok(StateFilter::All),
            Some(other) => Err(ViewError::validation(format!("unknown issue state: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StateFilter::Open => "open",
            StateFilter::Closed => "closed",
            StateFilter::All => "all",
        }
    }

    pub fn accepts(&self, open: bool) -> bool {
        match self {
            StateFilter::Open => open,
            StateFilter::Closed => !open,
            StateFilter::All => true,
        }
    }
}

/// Where a pull request wants to merge from and into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullTarget {
    /// Branch of the base repository; the default branch when absent.
    pub base_branch: Option<String>,
    /// The base repository itself for a pull request between branches.
    pub head_repo: MsgId,
    pub head_branch: Option<String>,
}

/// An issue or pull request with its edits applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub id: MsgId,
    pub repo: MsgId,
    /// Author of the repository announcement, when it has been replicated.
    pub repo_owner: Option<FeedId>,
    pub author: FeedId,
    pub created: i64,
    pub title: String,
    pub text: String,
    pub open: bool,
    pub pull: Option<PullTarget>,
}

impl Issue {
    /// The issue a message opens, before any edits.
    pub fn from_message(message: &Message) -> Option<Self> {
        let (repo, title, text, pull) = match message.content() {
            Content::Issue(issue) => (issue.project.clone(), &issue.title, &issue.text, None),
            Content::PullRequest(pr) => (
                pr.repo.clone(),
                &pr.title,
                &pr.text,
                Some(PullTarget {
                    base_branch: pr.branch.clone(),
                    head_repo: pr.head_repo.clone().unwrap_or_else(|| pr.repo.clone()),
                    head_branch: pr.head_branch.clone(),
                }),
            ),
            _ => return None,
        };
        Some(Self {
            id: message.key.clone(),
            repo,
            repo_owner: None,
            author: message.author().to_string(),
            created: message.timestamp(),
            title: title.clone().unwrap_or_default(),
            text: text.clone().unwrap_or_default(),
            open: true,
            pull,
        })
    }

    pub fn kind(&self) -> IssueKind {
        if self.pull.is_some() {
            IssueKind::PullRequest
        } else {
            IssueKind::Issue
        }
    }

    /// Whether `feed` may close, reopen or rename this issue.
    pub fn may_edit(&self, feed: &str) -> bool {
        feed == self.author || self.repo_owner.as_deref() == Some(feed)
    }

    /// Apply one edit message if its author may make it.
    fn apply(&mut self, message: &Message) -> bool {
        let Content::IssueEdit(edit) = message.content() else {
            return false;
        };
        if edit.issue != self.id || !self.may_edit(message.author()) {
            return false;
        }
        if let Some(open) = edit.open {
            self.open = open;
        }
        if let Some(title) = edit.title.as_ref().filter(|t| !t.is_empty()) {
            self.title = title.clone();
        }
        true
    }
}

/// Author of a repository, or `None` if it has not been replicated.
async fn repo_owner(store: &dyn LogStore, repo: &str) -> Result<Option<FeedId>, ViewError> {
    match store.get(repo).await {
        Ok(message) => Ok(Some(message.author().to_string())),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replay every edit of `issue` in receive order.
async fn apply_edits(store: &dyn LogStore, mut issue: Issue) -> Result<Issue, ViewError> {
    let mut edits = store.links(LinkQuery::to(issue.id.clone(), Rel::Issue));
    while let Some(message) = edits.try_next().await? {
        issue.apply(&message);
    }
    Ok(issue)
}

/// An issue or pull request by id, with its current state and title.
pub async fn get_issue(store: &dyn LogStore, id: &str) -> Result<Issue, ViewError> {
    if id.is_empty() {
        return Err(ViewError::validation("issue id is empty"));
    }
    let message = store.get(id).await?;
    let mut issue = Issue::from_message(&message)
        .ok_or_else(|| ViewError::not_found(format!("{} is not an issue or pull request", id)))?;
    issue.repo_owner = repo_owner(store, &issue.repo).await?;
    apply_edits(store, issue).await
}

/// Issues or pull requests of `repo` passing `filter`, newest first.
pub async fn list_issues(
    store: &dyn LogStore,
    repo: &str,
    kind: IssueKind,
    filter: StateFilter,
) -> Result<Vec<Issue>, ViewError> {
    if repo.is_empty() {
        return Err(ViewError::validation("repo id is empty"));
    }
    let owner = repo_owner(store, repo).await?;
    let rel = match kind {
        IssueKind::Issue => Rel::Project,
        IssueKind::PullRequest => Rel::Repo,
    };
    let opened: Vec<Issue> = store
        .links(LinkQuery::to(repo, rel).reversed())
        .try_filter_map(|message| {
            let issue = Issue::from_message(&message)
                .filter(|issue| issue.kind() == kind && issue.repo == repo)
                .map(|issue| Issue {
                    repo_owner: owner.clone(),
                    ..issue
                });
            future::ready(Ok(issue))
        })
        .try_collect()
        .await?;

    let issues: Vec<Issue> = stream::iter(opened)
        .map(|issue| apply_edits(store, issue))
        .buffered(ISSUE_STATE_CONCURRENCY)
        .try_filter(|issue| future::ready(filter.accepts(issue.open)))
        .try_collect()
        .await?;
    debug!(repo = %repo, kind = ?kind, state = filter.as_str(), issues = issues.len(), "issues: listed");
    Ok(issues)
}

/// What happened in one entry of a discussion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadEvent {
    Comment(String),
    Edited {
        open: Option<bool>,
        title: Option<String>,
    },
    /// The head branch of a pull request moved, or was deleted.
    BranchUpdated(Option<ObjectId>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadEntry {
    pub id: MsgId,
    pub author: FeedId,
    pub timestamp: i64,
    pub event: ThreadEvent,
}

/// Comments and edits of `issue`, plus pushes to the head branch of a
/// pull request made after it was opened, oldest first.
pub async fn thread(store: &dyn LogStore, issue: &Issue) -> Result<Vec<ThreadEntry>, ViewError> {
    let query = LinkQuery {
        dest: Some(issue.id.clone()),
        ..Default::default()
    };
    let mut messages: Vec<Message> = store.links(query).try_collect().await?;
    messages.extend(branch_updates(store, issue).await?);

    let mut seen = HashSet::new();
    messages.retain(|m| seen.insert(m.key.clone()));
    messages.sort_by_key(|m| (m.timestamp(), m.seq));

    let entries = messages
        .into_iter()
        .filter_map(|message| {
            let event = match message.content() {
                Content::Post(post) if post.root.as_deref() == Some(issue.id.as_str()) => {
                    ThreadEvent::Comment(post.text.clone())
                }
                Content::IssueEdit(edit) if issue.may_edit(message.author()) => ThreadEvent::Edited {
                    open: edit.open,
                    title: edit.title.clone().filter(|t| !t.is_empty()),
                },
                Content::GitUpdate(update) => {
                    let branch = issue.pull.as_ref()?.head_branch.as_deref()?;
                    let rev = update.refs.iter().find_map(|(name, rev)| {
                        (parse_ref_name(name) == (branch.to_string(), false)).then(|| rev.clone())
                    })?;
                    ThreadEvent::BranchUpdated(rev)
                }
                _ => return None,
            };
            Some(ThreadEntry {
                id: message.key.clone(),
                author: message.author().to_string(),
                timestamp: message.timestamp(),
                event,
            })
        })
        .collect();
    Ok(entries)
}

/// Pushes by the head repository's owner since the pull request opened.
async fn branch_updates(store: &dyn LogStore, issue: &Issue) -> Result<Vec<Message>, ViewError> {
    let Some(pull) = &issue.pull else {
        return Ok(Vec::new());
    };
    if pull.head_branch.is_none() {
        return Ok(Vec::new());
    }
    let Some(head_owner) = repo_owner(store, &pull.head_repo).await? else {
        return Ok(Vec::new());
    };
    let query = LinkQuery::to(pull.head_repo.clone(), Rel::Repo)
        .from_source(head_owner)
        .reversed();
    let created = issue.created;
    let updates = store
        .links(query)
        .try_take_while(|m| future::ready(Ok(m.timestamp() > created)))
        .try_filter(|m| future::ready(matches!(m.content(), Content::GitUpdate(_))))
        .try_collect()
        .await?;
    Ok(updates)
}
