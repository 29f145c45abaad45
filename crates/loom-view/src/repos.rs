//! Repository listings: a user's repos and digs, forks, push activity.

use std::collections::HashSet;

use futures_util::{StreamExt, TryStreamExt, stream};
use loom_store::{
    Content, FeedId, FeedOptions, GitRepo, LinkQuery, LogStore, Message, MsgId, ObjectId, Rel,
};
use tracing::{debug, warn};

use crate::about::AboutResolver;
use crate::votes::VoteAggregator;
use crate::{DUG_REPO_CONCURRENCY, NAME_LOOKUP_CONCURRENCY, ViewError};

/// Repositories shown on a user's repo list.
pub const USER_REPO_LIMIT: usize = 20;

/// A repository the user created or pushed to.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRepo {
    pub id: MsgId,
    pub owner: FeedId,
    /// Timestamp of the user's newest message about the repo.
    pub updated: i64,
    pub name: Result<String, ViewError>,
    pub digs: Result<usize, ViewError>,
}

/// A repository the user currently upvotes.
#[derive(Debug, Clone, PartialEq)]
pub struct DugRepo {
    pub id: MsgId,
    pub owner: FeedId,
    pub name: Result<String, ViewError>,
}

/// A repository announced as a fork of another.
#[derive(Debug, Clone, PartialEq)]
pub struct Fork {
    pub id: MsgId,
    pub owner: FeedId,
    pub created: i64,
    pub name: Result<String, ViewError>,
}

/// One ref change in a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    /// Branch or tag name without its `heads/` or `tags/` prefix.
    pub name: String,
    pub is_tag: bool,
    /// New commit, or `None` when the ref was deleted.
    pub rev: Option<ObjectId>,
}

/// A push to a repository by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUpdate {
    pub id: MsgId,
    pub timestamp: i64,
    pub refs: Vec<RefUpdate>,
}

/// Split a pushed ref name into its short name and whether it is a tag.
/// Accepts `refs/heads/x`, `heads/x` and bare names.
pub fn parse_ref_name(name: &str) -> (String, bool) {
    let name = name.strip_prefix("refs/").unwrap_or(name);
    if let Some(tag) = name.strip_prefix("tags/") {
        (tag.to_string(), true)
    } else {
        (name.strip_prefix("heads/").unwrap_or(name).to_string(), false)
    }
}

/// The branch a repository is browsed at: `master`, then `main`, then the
/// first branch. `None` for a repository without branches.
pub async fn default_branch(repo: &dyn GitRepo) -> Result<Option<String>, ViewError> {
    let refs = repo.ref_names().await?;
    let heads = refs.get("heads").cloned().unwrap_or_default();
    for preferred in ["master", "main"] {
        if heads.iter().any(|h| h == preferred) {
            return Ok(Some(preferred.to_string()));
        }
    }
    Ok(heads.into_iter().next())
}

/// Forks of `repo`, oldest first, with their names.
pub async fn forks(
    store: &dyn LogStore,
    about: &AboutResolver,
    repo: &str,
) -> Result<Vec<Fork>, ViewError> {
    if repo.is_empty() {
        return Err(ViewError::validation("repo id is empty"));
    }
    let found: Vec<Message> = store
        .links(LinkQuery::to(repo, Rel::Upstream))
        .try_filter(|m| std::future::ready(matches!(m.content(), Content::GitRepo(_))))
        .try_collect()
        .await?;
    debug!(repo = %repo, forks = found.len(), "repos: forks listed");

    let forks = stream::iter(found)
        .map(|message| async move {
            let owner = message.author().to_string();
            let name = about.get_repo_name(&owner, &message.key).await;
            Fork {
                id: message.key.clone(),
                created: message.timestamp(),
                owner,
                name,
            }
        })
        .buffered(NAME_LOOKUP_CONCURRENCY)
        .collect()
        .await;
    Ok(forks)
}

/// Pushes `owner` made to `repo`, newest first.
pub async fn repo_activity(
    store: &dyn LogStore,
    repo: &str,
    owner: &str,
) -> Result<Vec<RepoUpdate>, ViewError> {
    if repo.is_empty() || owner.is_empty() {
        return Err(ViewError::validation("repo or owner id is empty"));
    }
    let query = LinkQuery::to(repo, Rel::Repo).from_source(owner).reversed();
    let updates: Vec<RepoUpdate> = store
        .links(query)
        .try_filter_map(|message| async move {
            let Content::GitUpdate(update) = message.content() else {
                return Ok(None);
            };
            let refs = update
                .refs
                .iter()
                .map(|(name, rev)| {
                    let (name, is_tag) = parse_ref_name(name);
                    RefUpdate {
                        name,
                        is_tag,
                        rev: rev.clone(),
                    }
                })
                .collect();
            Ok(Some(RepoUpdate {
                id: message.key.clone(),
                timestamp: message.timestamp(),
                refs,
            }))
        })
        .try_collect()
        .await?;
    Ok(updates)
}

/// Repo a git message refers to: the update's repo, or the repo itself.
fn repo_of(message: &Message) -> Option<MsgId> {
    match message.content() {
        Content::GitRepo(_) => Some(message.key.clone()),
        Content::GitUpdate(update) => Some(update.repo.clone()),
        _ => None,
    }
}

/// The newest repos `user` created or pushed to, with names and dig counts.
///
/// A failed name or tally lookup is reported on its own item.
pub async fn user_repos(
    store: &dyn LogStore,
    about: &AboutResolver,
    votes: &VoteAggregator,
    user: &str,
) -> Result<Vec<UserRepo>, ViewError> {
    if user.is_empty() {
        return Err(ViewError::validation("user id is empty"));
    }

    let mut seen = HashSet::new();
    let mut found = Vec::new();
    let mut feed = store.feed_stream(FeedOptions {
        author: Some(user.to_string()),
        reverse: true,
        ..Default::default()
    });
    while let Some(message) = feed.try_next().await? {
        let Some(repo) = repo_of(&message) else {
            continue;
        };
        if seen.insert(repo.clone()) {
            found.push((repo, message.timestamp()));
            if found.len() == USER_REPO_LIMIT {
                break;
            }
        }
    }
    debug!(user = %user, repos = found.len(), "repos: user repos listed");

    let repos = stream::iter(found)
        .map(|(id, updated)| async move {
            let (name, tally) = tokio::join!(about.get_repo_name(user, &id), votes.get_votes(&id));
            if let Err(e) = &name {
                warn!(repo = %id, error = %e, "repos: name lookup failed");
            }
            UserRepo {
                owner: user.to_string(),
                updated,
                name,
                digs: tally.map(|t| t.upvotes),
                id,
            }
        })
        .buffered(NAME_LOOKUP_CONCURRENCY)
        .collect()
        .await;
    Ok(repos)
}

/// Repos `user` currently upvotes, newest vote first.
///
/// Only the user's latest vote per target counts. Targets that are not
/// `git-repo` messages, or that have not been replicated, are skipped.
pub async fn dug_repos(
    store: &dyn LogStore,
    about: &AboutResolver,
    user: &str,
) -> Result<Vec<DugRepo>, ViewError> {
    if user.is_empty() {
        return Err(ViewError::validation("user id is empty"));
    }

    let query = LinkQuery {
        source: Some(user.to_string()),
        rel: Some(Rel::Vote),
        reverse: true,
        ..Default::default()
    };
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    let mut links = store.links(query);
    while let Some(message) = links.try_next().await? {
        let Content::Vote(content) = message.content() else {
            continue;
        };
        let Some(vote) = &content.vote else {
            continue;
        };
        let Some(target) = &vote.link else {
            continue;
        };
        if seen.insert(target.clone()) && vote.value.is_some_and(|v| v > 0) {
            targets.push(target.clone());
        }
    }

    let repos: Vec<Message> = stream::iter(targets)
        .map(|target| async move {
            match store.get(&target).await {
                Ok(message) => Ok(Some(message)),
                Err(e) if e.is_not_found() => {
                    debug!(target = %target, "repos: dug target not replicated");
                    Ok(None)
                }
                Err(e) => Err(ViewError::from(e)),
            }
        })
        .buffered(DUG_REPO_CONCURRENCY)
        .try_filter_map(|message| async move {
            Ok(message.filter(|m| matches!(m.content(), Content::GitRepo(_))))
        })
        .try_collect()
        .await?;

    let dug = stream::iter(repos)
        .map(|message| async move {
            let owner = message.author().to_string();
            let name = about.get_repo_name(&owner, &message.key).await;
            DugRepo {
                id: message.key,
                owner,
                name,
            }
        })
        .buffered(NAME_LOOKUP_CONCURRENCY)
        .collect()
        .await;
    Ok(dug)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_store::{
        GitRepoContent, GitUpdateContent, MemoryStore, NewMessage, Vote, VoteContent,
    };
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn new_repo(store: &MemoryStore, author: &str, ts: i64) -> MsgId {
        store
            .append(NewMessage {
                key: None,
                author: author.to_string(),
                timestamp: ts,
                content: Content::GitRepo(GitRepoContent::default()),
            })
            .key
    }

    fn push(store: &MemoryStore, author: &str, repo: &str, ts: i64) {
        store.append(NewMessage {
            key: None,
            author: author.to_string(),
            timestamp: ts,
            content: Content::GitUpdate(GitUpdateContent {
                repo: repo.to_string(),
                refs: BTreeMap::new(),
            }),
        });
    }

    fn vote(store: &MemoryStore, voter: &str, target: &str, value: i64) {
        store.append(NewMessage {
            key: None,
            author: voter.to_string(),
            timestamp: 0,
            content: Content::Vote(VoteContent {
                vote: Some(Vote {
                    link: Some(target.to_string()),
                    value: Some(value),
                }),
            }),
        });
    }

    #[tokio::test]
    async fn test_user_repos_unique_newest_first() {
        let store = MemoryStore::new("@me");
        let a = new_repo(&store, "@alice", 1);
        let b = new_repo(&store, "@alice", 2);
        new_repo(&store, "@bob", 3);
        push(&store, "@alice", &a, 4);
        vote(&store, "@bob", &a, 1);
        vote(&store, "@carol", &a, 1);

        let log: Arc<dyn LogStore> = store.clone();
        let about = AboutResolver::new(Arc::clone(&log), "@me");
        let votes = VoteAggregator::new(Arc::clone(&log));
        let repos = user_repos(&*log, &about, &votes, "@alice").await.unwrap();

        let ids: Vec<_> = repos.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![a.clone(), b]);
        assert_eq!(repos[0].updated, 4);
        assert_eq!(repos[0].digs, Ok(2));
        assert_eq!(repos[1].digs, Ok(0));
    }

    #[tokio::test]
    async fn test_dug_repos_latest_positive_votes_only() {
        let store = MemoryStore::new("@me");
        let kept = new_repo(&store, "@alice", 1);
        let undone = new_repo(&store, "@alice", 2);
        let post = store
            .append(NewMessage {
                key: None,
                author: "@alice".to_string(),
                timestamp: 3,
                content: Content::Post(loom_store::PostContent {
                    text: "hi".to_string(),
                    root: None,
                }),
            })
            .key;

        vote(&store, "@bob", &kept, 1);
        vote(&store, "@bob", &undone, 1);
        vote(&store, "@bob", &undone, 0);
        vote(&store, "@bob", &post, 1);
        vote(&store, "@bob", "%missing", 1);

        let log: Arc<dyn LogStore> = store.clone();
        let about = AboutResolver::new(Arc::clone(&log), "@me");
        let dug = dug_repos(&*log, &about, "@bob").await.unwrap();

        assert_eq!(dug.len(), 1);
        assert_eq!(dug[0].id, kept);
        assert_eq!(dug[0].owner, "@alice");
        assert!(dug[0].name.is_ok());
    }

    #[tokio::test]
    async fn test_forks_follow_upstream_links() {
        let store = MemoryStore::new("@me");
        let upstream = new_repo(&store, "@alice", 1);
        let fork = store
            .append(NewMessage {
                key: None,
                author: "@bob".to_string(),
                timestamp: 2,
                content: Content::GitRepo(GitRepoContent {
                    name: None,
                    upstream: Some(upstream.clone()),
                }),
            })
            .key;
        new_repo(&store, "@carol", 3);

        let log: Arc<dyn LogStore> = store.clone();
        let about = AboutResolver::new(Arc::clone(&log), "@me");
        let found = forks(&*log, &about, &upstream).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, fork);
        assert_eq!(found[0].owner, "@bob");
        assert_eq!(found[0].created, 2);
        assert!(forks(&*log, &about, &fork).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activity_lists_owner_pushes() {
        let store = MemoryStore::new("@me");
        let repo = new_repo(&store, "@alice", 1);
        store.append(NewMessage {
            key: None,
            author: "@alice".to_string(),
            timestamp: 2,
            content: Content::GitUpdate(GitUpdateContent {
                repo: repo.clone(),
                refs: [
                    ("refs/heads/master".to_string(), Some("c1".to_string())),
                    ("refs/tags/v1".to_string(), Some("c1".to_string())),
                    ("heads/old".to_string(), None),
                ]
                .into_iter()
                .collect(),
            }),
        });
        push(&store, "@mallory", &repo, 3);
        push(&store, "@alice", &repo, 4);

        let updates = repo_activity(&*store, &repo, "@alice").await.unwrap();
        let stamps: Vec<_> = updates.iter().map(|u| u.timestamp).collect();
        assert_eq!(stamps, vec![4, 2]);
        assert_eq!(
            updates[1].refs,
            vec![
                RefUpdate {
                    name: "old".to_string(),
                    is_tag: false,
                    rev: None
                },
                RefUpdate {
                    name: "master".to_string(),
                    is_tag: false,
                    rev: Some("c1".to_string())
                },
                RefUpdate {
                    name: "v1".to_string(),
                    is_tag: true,
                    rev: Some("c1".to_string())
                },
            ]
        );
    }

    #[test]
    fn test_parse_ref_name() {
        assert_eq!(parse_ref_name("refs/heads/main"), ("main".to_string(), false));
        assert_eq!(parse_ref_name("heads/feature/x"), ("feature/x".to_string(), false));
        assert_eq!(parse_ref_name("tags/v1.0"), ("v1.0".to_string(), true));
        assert_eq!(parse_ref_name("master"), ("master".to_string(), false));
    }

    #[tokio::test]
    async fn test_empty_user_rejected() {
        let store = MemoryStore::new("@me");
        let log: Arc<dyn LogStore> = store;
        let about = AboutResolver::new(Arc::clone(&log), "@me");
        let err = dug_repos(&*log, &about, "").await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Validation);
    }
}
