//! In-memory log store.
//!
//! Thread-safe reference implementation of [`LogStore`] and [`BlobStore`]
//! with a live tail delivered over a broadcast channel.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, trace};

use crate::git::MemoryGitRepo;
use crate::store::{BlobStore, LogStore, MessageStream, RepoStore};
use crate::types::{
    FeedId, FeedOptions, LinkQuery, Message, MessageValue, NewMessage, TypeQuery,
};
use crate::{GitRepo, StoreError};

/// Broadcast channel capacity for the live tail.
/// Receivers that fall further behind see [`StoreError::Lagged`].
const BROADCAST_CHANNEL_CAPACITY: usize = 4096;

/// In-memory message log.
pub struct MemoryStore {
    /// Local identity.
    whoami: FeedId,
    /// All messages in receive order; index `i` holds seq `i + 1`.
    log: RwLock<Vec<Message>>,
    /// Message key to seq.
    keys: DashMap<String, u64>,
    /// Latest sequence per author.
    sequences: DashMap<FeedId, u64>,
    blobs: DashMap<String, Vec<u8>>,
    repos: DashMap<String, Arc<MemoryGitRepo>>,
    /// Live tail.
    updates_tx: broadcast::Sender<Message>,
    /// Set while the store simulates a lost connection.
    closed_tx: watch::Sender<bool>,
}

impl MemoryStore {
    /// Create an empty store for identity `whoami`.
    pub fn new(whoami: impl Into<FeedId>) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            whoami: whoami.into(),
            log: RwLock::new(Vec::new()),
            keys: DashMap::new(),
            sequences: DashMap::new(),
            blobs: DashMap::new(),
            repos: DashMap::new(),
            updates_tx,
            closed_tx,
        })
    }

    /// Append a message, assigning its receive seq and author sequence.
    ///
    /// The message is published to live subscribers while the log lock is
    /// held, so a subscriber that opened its tail before snapshotting the
    /// log sees every message exactly once across both.
    pub fn append(&self, new: NewMessage) -> Message {
        let mut log = self.log.write().unwrap_or_else(PoisonError::into_inner);
        let seq = log.len() as u64 + 1;
        let sequence = {
            let mut entry = self.sequences.entry(new.author.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let key = new.key.unwrap_or_else(|| derive_key(&new.author, sequence, new.timestamp));
        let message = Message {
            key: key.clone(),
            seq,
            value: MessageValue {
                author: new.author,
                sequence,
                timestamp: new.timestamp,
                content: new.content,
            },
        };
        log.push(message.clone());
        self.keys.insert(key.clone(), seq);
        if self.updates_tx.send(message.clone()).is_err() {
            trace!("no live subscribers for appended message");
        }
        trace!(key = %key, seq, kind = message.value.content.type_name(), "store: message appended");
        message
    }

    /// Store a blob and return its id.
    pub fn add_blob(&self, id: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.blobs.insert(id.into(), data.into());
    }

    /// Register the git repository announced by message `repo.id()`.
    pub fn add_repo(&self, repo: MemoryGitRepo) -> Arc<MemoryGitRepo> {
        let repo = Arc::new(repo);
        self.repos.insert(repo.id().to_string(), Arc::clone(&repo));
        repo
    }

    /// Look up a registered repository.
    pub fn repo(&self, id: &str) -> Result<Arc<MemoryGitRepo>, StoreError> {
        self.ensure_open()?;
        self.repos
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| StoreError::not_found(id))
    }

    /// Number of registered repositories.
    pub fn repo_count(&self) -> usize {
        self.repos.len()
    }

    /// Number of messages in the log.
    pub fn len(&self) -> usize {
        self.log.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate losing the connection: live tails end with
    /// [`StoreError::Disconnected`] and every read fails until [`reopen`].
    ///
    /// [`reopen`]: MemoryStore::reopen
    pub fn close(&self) {
        debug!("store: closing connection");
        self.closed_tx.send_replace(true);
    }

    /// Undo [`MemoryStore::close`].
    pub fn reopen(&self) {
        debug!("store: connection reopened");
        self.closed_tx.send_replace(false);
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if *self.closed_tx.borrow() {
            return Err(StoreError::Disconnected("log store is closed".to_string()));
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Message> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A live tail of messages passing `filter`, ending with a
    /// disconnect error when the store closes.
    fn live_tail(&self, filter: impl Fn(&Message) -> bool + Send + 'static) -> MessageStream {
        let rx = self.updates_tx.subscribe();
        let mut closed_rx = self.closed_tx.subscribe();
        let closed = async move {
            let _ = closed_rx.wait_for(|closed| *closed).await;
        };

        BroadcastStream::new(rx)
            .take_until(closed)
            .filter_map(move |item| {
                let out = match item {
                    Ok(message) if filter(&message) => Some(Ok(message)),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(StoreError::Lagged(n))),
                };
                std::future::ready(out)
            })
            .chain(stream::once(async {
                Err(StoreError::Disconnected("live tail ended".to_string()))
            }))
            .boxed()
    }
}

fn derive_key(author: &str, sequence: u64, timestamp: i64) -> String {
    let mut hasher = DefaultHasher::new();
    (author, sequence, timestamp).hash(&mut hasher);
    format!("%{:016x}.sha256", hasher.finish())
}

fn finish(mut messages: Vec<Message>, reverse: bool, limit: Option<usize>) -> MessageStream {
    if reverse {
        messages.reverse();
    }
    if let Some(limit) = limit {
        messages.truncate(limit);
    }
    stream::iter(messages.into_iter().map(Ok)).boxed()
}

fn fail(e: StoreError) -> MessageStream {
    stream::once(async move { Err(e) }).boxed()
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn whoami(&self) -> Result<FeedId, StoreError> {
        self.ensure_open()?;
        Ok(self.whoami.clone())
    }

    async fn get(&self, id: &str) -> Result<Message, StoreError> {
        self.ensure_open()?;
        let seq = *self.keys.get(id).ok_or_else(|| StoreError::not_found(id))?;
        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);
        log.get(seq as usize - 1)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id))
    }

    fn links(&self, query: LinkQuery) -> MessageStream {
        if let Err(e) = self.ensure_open() {
            return fail(e);
        }
        if query.live {
            return self.live_tail(move |m| query.matches(m));
        }
        let matching = self.snapshot().into_iter().filter(|m| query.matches(m)).collect();
        finish(matching, query.reverse, query.limit)
    }

    fn feed_stream(&self, options: FeedOptions) -> MessageStream {
        if let Err(e) = self.ensure_open() {
            return fail(e);
        }
        let mut messages: Vec<Message> = self
            .snapshot()
            .into_iter()
            .filter(|m| options.author.as_ref().is_none_or(|a| m.value.author == *a))
            .filter(|m| {
                let key = options.sort_key(m);
                options.lte.is_none_or(|lte| key <= lte) && options.gte.is_none_or(|gte| key >= gte)
            })
            .collect();
        messages.sort_by_key(|m| (options.sort_key(m), m.seq));
        finish(messages, options.reverse, options.limit)
    }

    fn messages_by_type(&self, query: TypeQuery) -> MessageStream {
        if let Err(e) = self.ensure_open() {
            return fail(e);
        }
        let matching = self
            .snapshot()
            .into_iter()
            .filter(|m| m.value.content.type_name() == query.type_name)
            .collect();
        finish(matching, query.reverse, query.limit)
    }

    fn latest_seq(&self) -> u64 {
        self.len() as u64
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn want(&self, id: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.blobs.contains_key(id))
    }

    async fn get_blob(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.ensure_open()?;
        self.blobs
            .get(id)
            .map(|b| b.value().clone())
            .ok_or_else(|| StoreError::not_found(id))
    }
}

#[async_trait]
impl RepoStore for MemoryStore {
    async fn get_repo(&self, id: &str) -> Result<Arc<dyn GitRepo>, StoreError> {
        let repo: Arc<dyn GitRepo> = self.repo(id)?;
        Ok(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AboutContent, Content, Rel, Vote, VoteContent};
    use futures_util::TryStreamExt;

    fn vote(author: &str, target: &str, value: i64, timestamp: i64) -> NewMessage {
        NewMessage {
            key: None,
            author: author.to_string(),
            timestamp,
            content: Content::Vote(VoteContent {
                vote: Some(Vote {
                    link: Some(target.to_string()),
                    value: Some(value),
                }),
            }),
        }
    }

    #[test]
    fn test_append_assigns_sequences() {
        let store = MemoryStore::new("@me");
        let a1 = store.append(vote("@a", "%r", 1, 10));
        let b1 = store.append(vote("@b", "%r", 1, 11));
        let a2 = store.append(vote("@a", "%r", -1, 12));

        assert_eq!((a1.seq, a1.value.sequence), (1, 1));
        assert_eq!((b1.seq, b1.value.sequence), (2, 1));
        assert_eq!((a2.seq, a2.value.sequence), (3, 2));
        assert_eq!(store.latest_seq(), 3);
        assert_ne!(a1.key, a2.key);
    }

    #[tokio::test]
    async fn test_get_by_key() {
        let store = MemoryStore::new("@me");
        let msg = store.append(vote("@a", "%r", 1, 10));
        assert_eq!(store.get(&msg.key).await.unwrap(), msg);
        assert!(matches!(
            store.get("%missing").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_links_filters_and_order() {
        let store = MemoryStore::new("@me");
        store.append(vote("@a", "%r", 1, 10));
        store.append(vote("@b", "%other", 1, 11));
        store.append(NewMessage {
            key: None,
            author: "@a".to_string(),
            timestamp: 12,
            content: Content::About(AboutContent {
                about: "%r".to_string(),
                name: Some("repo".to_string()),
                image: None,
            }),
        });
        store.append(vote("@c", "%r", -1, 13));

        let votes: Vec<_> = store
            .links(LinkQuery::to("%r", Rel::Vote))
            .try_collect()
            .await
            .unwrap();
        let authors: Vec<_> = votes.iter().map(|m| m.author()).collect();
        assert_eq!(authors, vec!["@a", "@c"]);

        let reversed: Vec<_> = store
            .links(LinkQuery::to("%r", Rel::Vote).reversed())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(reversed[0].author(), "@c");
    }

    #[tokio::test]
    async fn test_feed_stream_bounds() {
        let store = MemoryStore::new("@me");
        for ts in 1..=10 {
            store.append(vote("@a", "%r", 1, ts * 100));
        }

        let global: Vec<_> = store
            .feed_stream(FeedOptions {
                reverse: true,
                lte: Some(500),
                limit: Some(2),
                ..Default::default()
            })
            .try_collect()
            .await
            .unwrap();
        let stamps: Vec<_> = global.iter().map(|m| m.timestamp()).collect();
        assert_eq!(stamps, vec![500, 400]);

        let per_author: Vec<_> = store
            .feed_stream(FeedOptions {
                author: Some("@a".to_string()),
                gte: Some(9),
                ..Default::default()
            })
            .try_collect()
            .await
            .unwrap();
        let sequences: Vec<_> = per_author.iter().map(|m| m.value.sequence).collect();
        assert_eq!(sequences, vec![9, 10]);
    }

    #[tokio::test]
    async fn test_live_tail_sees_only_new_messages() {
        let store = MemoryStore::new("@me");
        store.append(vote("@a", "%r", 1, 10));

        let mut live = store.links(LinkQuery::to("%r", Rel::Vote).live());
        store.append(vote("@b", "%other", 1, 11));
        store.append(vote("@c", "%r", 1, 12));

        let next = live.next().await.unwrap().unwrap();
        assert_eq!(next.author(), "@c");
    }

    #[tokio::test]
    async fn test_close_ends_live_tail() {
        let store = MemoryStore::new("@me");
        let mut live = store.links(LinkQuery::to("%r", Rel::Vote).live());
        store.close();

        let err = live.next().await.unwrap().unwrap_err();
        assert!(err.is_disconnect());
        assert!(store.whoami().await.unwrap_err().is_disconnect());

        store.reopen();
        assert_eq!(store.whoami().await.unwrap(), "@me");
    }
}
