//! Capability interfaces consumed by the read-model layer.
//!
//! The log, blob and git stores live outside this workspace; these traits
//! are the whole surface the aggregation core is allowed to touch.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};

use crate::StoreError;
use crate::git::{Commit, MODE_TREE, ObjectId, TreeEntry};
use crate::types::{FeedId, FeedOptions, LinkQuery, Message, TypeQuery};

/// Stream of messages produced by a log query.
pub type MessageStream = BoxStream<'static, Result<Message, StoreError>>;

/// Read access to the replicated message log.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Feed id of the local identity.
    async fn whoami(&self) -> Result<FeedId, StoreError>;

    /// Point lookup by message id.
    async fn get(&self, id: &str) -> Result<Message, StoreError>;

    /// Messages linking to something, historical or live.
    fn links(&self, query: LinkQuery) -> MessageStream;

    /// Global (timestamp-ordered) or per-author (sequence-ordered) feed.
    fn feed_stream(&self, options: FeedOptions) -> MessageStream;

    /// Messages of one content type in receive order.
    fn messages_by_type(&self, query: TypeQuery) -> MessageStream;

    /// Receive sequence of the newest message, 0 when empty.
    fn latest_seq(&self) -> u64;
}

/// Content-addressed blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Whether the blob is available locally.
    async fn want(&self, id: &str) -> Result<bool, StoreError>;

    async fn get_blob(&self, id: &str) -> Result<Vec<u8>, StoreError>;
}

/// Lookup of git repositories by the id of the message that announced them.
#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn get_repo(&self, id: &str) -> Result<Arc<dyn GitRepo>, StoreError>;
}

/// A git repository backed by the log.
#[async_trait]
pub trait GitRepo: Send + Sync {
    /// Id of the message that announced the repository.
    fn id(&self) -> &str;

    /// Resolve a ref name (`master`, `heads/master`) or commit id.
    async fn resolve_ref(&self, rev: &str) -> Result<ObjectId, StoreError>;

    /// Ref names grouped by kind (`heads`, `tags`).
    async fn ref_names(&self) -> Result<BTreeMap<String, Vec<String>>, StoreError>;

    async fn get_commit(&self, rev: &str) -> Result<Commit, StoreError>;

    async fn read_tree(&self, tree_id: &str) -> Result<Vec<TreeEntry>, StoreError>;

    async fn read_blob(&self, blob_id: &str) -> Result<Vec<u8>, StoreError>;

    /// Whether the repository holds an object with this id.
    async fn has_object(&self, id: &str) -> bool;

    /// Entries of the directory at `path` in the tree of `rev`.
    async fn read_dir(&self, rev: &str, path: &[String]) -> Result<Vec<TreeEntry>, StoreError> {
        let commit = self.get_commit(rev).await?;
        let mut entries = self.read_tree(&commit.tree).await?;
        for segment in path {
            let dir = entries
                .iter()
                .find(|e| e.name == *segment && e.mode == MODE_TREE)
                .ok_or_else(|| StoreError::not_found(path.join("/")))?;
            entries = self.read_tree(&dir.id).await?;
        }
        Ok(entries)
    }

    /// Commit ids reachable from `rev` along first parents, newest first.
    fn read_log<'a>(&'a self, rev: &str) -> BoxStream<'a, Result<ObjectId, StoreError>> {
        stream::unfold(Some(rev.to_string()), move |next| async move {
            let rev = next?;
            match self.get_commit(&rev).await {
                Ok(commit) => {
                    let parent = commit.parents.first().cloned();
                    Some((Ok(commit.id), parent))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}
