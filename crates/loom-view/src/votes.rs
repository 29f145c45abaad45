//! Vote ("dig") tallies.
//!
//! A tally is seeded from the full vote history of its target and then
//! kept current from a live tail. Each voter counts once: a new vote first
//! removes the voter's previous one and then adds itself unless its value
//! is zero or missing.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use loom_store::{Content, FeedId, LinkQuery, LogStore, Message, MessageStream, MsgId, Rel};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::ViewError;
use crate::live::{LiveModel, Subscription};
use crate::memo::AsyncMemo;

/// Running vote counts for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteTally {
    pub upvoters: BTreeMap<FeedId, i64>,
    pub downvoters: BTreeMap<FeedId, i64>,
    pub upvotes: usize,
    pub downvotes: usize,
    /// Receive seq of the newest vote applied, 0 before any.
    pub last_seq: u64,
}

impl VoteTally {
    /// Replace `voter`'s vote with `value`.
    pub fn apply_vote(&mut self, voter: &str, value: Option<i64>) {
        if self.upvoters.remove(voter).is_some() {
            self.upvotes -= 1;
        } else if self.downvoters.remove(voter).is_some() {
            self.downvotes -= 1;
        }

        match value {
            Some(v) if v > 0 => {
                self.upvoters.insert(voter.to_string(), v);
                self.upvotes += 1;
            }
            Some(v) if v < 0 => {
                self.downvoters.insert(voter.to_string(), v);
                self.downvotes += 1;
            }
            _ => {}
        }
    }

    /// Apply a vote message. Messages at or before `last_seq` were already
    /// counted and are skipped. Returns whether the tally changed.
    pub fn apply(&mut self, message: &Message) -> bool {
        if message.seq <= self.last_seq {
            trace!(key = %message.key, seq = message.seq, "votes: already counted");
            return false;
        }
        self.last_seq = message.seq;
        let value = match message.content() {
            Content::Vote(vote) => vote.vote.as_ref().and_then(|v| v.value),
            _ => None,
        };
        self.apply_vote(message.author(), value);
        true
    }

    /// Whether `voter` currently upvotes the target.
    pub fn has_upvoted(&self, voter: &str) -> bool {
        self.upvoters.contains_key(voter)
    }
}

/// Fold every historical vote on `target` into a fresh tally.
pub async fn tally_from_history(store: &dyn LogStore, target: &str) -> Result<VoteTally, ViewError> {
    let mut tally = VoteTally::default();
    let mut stream = store.links(LinkQuery::to(target, Rel::Vote));
    while let Some(message) = stream.try_next().await? {
        tally.apply(&message);
    }
    Ok(tally)
}

#[derive(Clone)]
struct LiveTally {
    tally: watch::Receiver<VoteTally>,
    _subscription: Arc<Subscription>,
}

struct TallyModel {
    store: Arc<dyn LogStore>,
    target: MsgId,
    tally: watch::Sender<VoteTally>,
}

#[async_trait]
impl LiveModel for TallyModel {
    fn subscribe(&self) -> MessageStream {
        self.store
            .links(LinkQuery::to(self.target.clone(), Rel::Vote).live())
    }

    async fn resync(&self) -> Result<(), ViewError> {
        let fresh = tally_from_history(&*self.store, &self.target).await?;
        debug!(target = %self.target, upvotes = fresh.upvotes, downvotes = fresh.downvotes, "votes: resynced");
        self.tally.send_replace(fresh);
        Ok(())
    }

    fn apply(&self, message: Message) {
        let changed = self.tally.send_if_modified(|tally| tally.apply(&message));
        if changed {
            trace!(target = %self.target, voter = %message.author(), "votes: tally updated");
        }
    }
}

/// Memoized live tallies, one per target.
///
/// A target's live subscription lives exactly as long as its cache entry.
pub struct VoteAggregator {
    memo: AsyncMemo<MsgId, LiveTally>,
}

impl VoteAggregator {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        let memo = AsyncMemo::new("votes", move |target: MsgId| {
            let store = Arc::clone(&store);
            async move { attach(store, target).await }
        });
        Self { memo }
    }

    /// Current tally for `target`.
    pub async fn get_votes(&self, target: &str) -> Result<VoteTally, ViewError> {
        Ok(self.watch(target).await?.borrow().clone())
    }

    /// Receiver that observes every later change to `target`'s tally.
    pub async fn watch(&self, target: &str) -> Result<watch::Receiver<VoteTally>, ViewError> {
        if target.is_empty() {
            return Err(ViewError::validation("vote target id is empty"));
        }
        Ok(self.memo.get(target.to_string()).await?.tally)
    }

    /// Drop the cached tally for `target` and stop its live subscription.
    pub fn forget(&self, target: &str) -> bool {
        self.memo.invalidate(&target.to_string()).is_some()
    }

    /// Number of targets with a live tally.
    pub fn cached(&self) -> usize {
        self.memo.len()
    }
}

async fn attach(store: Arc<dyn LogStore>, target: MsgId) -> Result<LiveTally, ViewError> {
    // Subscribe before reading history so nothing falls in between.
    let live = store.links(LinkQuery::to(target.clone(), Rel::Vote).live());
    let tally = tally_from_history(&*store, &target).await?;
    debug!(
        target = %target,
        upvotes = tally.upvotes,
        downvotes = tally.downvotes,
        "votes: history drained"
    );

    let (tx, rx) = watch::channel(tally);
    let model = Arc::new(TallyModel {
        store,
        target: target.clone(),
        tally: tx,
    });
    let subscription = Subscription::spawn(format!("votes {}", target), model, live);
    Ok(LiveTally {
        tally: rx,
        _subscription: Arc::new(subscription),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_store::{MemoryStore, NewMessage, Vote, VoteContent};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn vote(voter: &str, target: &str, value: Option<i64>) -> NewMessage {
        NewMessage {
            key: None,
            author: voter.to_string(),
            timestamp: 0,
            content: Content::Vote(VoteContent {
                vote: Some(Vote {
                    link: Some(target.to_string()),
                    value,
                }),
            }),
        }
    }

    #[test]
    fn test_revote_replaces_previous() {
        let mut tally = VoteTally::default();
        tally.apply_vote("@a", Some(1));
        tally.apply_vote("@b", Some(1));
        tally.apply_vote("@a", Some(-1));

        assert_eq!(tally.upvotes, 1);
        assert_eq!(tally.downvotes, 1);
        assert!(tally.has_upvoted("@b"));
        assert_eq!(tally.downvoters.get("@a"), Some(&-1));
    }

    #[test]
    fn test_zero_or_missing_value_only_removes() {
        let mut tally = VoteTally::default();
        tally.apply_vote("@a", Some(1));
        tally.apply_vote("@b", Some(-1));
        tally.apply_vote("@a", Some(0));
        tally.apply_vote("@b", None);
        tally.apply_vote("@c", None);

        assert_eq!(tally, VoteTally::default());
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let store = MemoryStore::new("@me");
        store.append(vote("@a", "%repo", Some(1)));
        store.append(vote("@b", "%repo", Some(1)));
        store.append(vote("@c", "%other", Some(1)));

        let votes = VoteAggregator::new(Arc::clone(&store) as Arc<dyn LogStore>);
        let tally = votes.get_votes("%repo").await.unwrap();
        assert_eq!(tally.upvotes, 2);

        let mut rx = votes.watch("%repo").await.unwrap();
        store.append(vote("@a", "%repo", Some(0)));
        store.append(vote("@d", "%repo", Some(-1)));
        let tally = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|t| t.downvotes == 1),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();

        assert_eq!(tally.upvotes, 1);
        assert!(tally.has_upvoted("@b"));
        assert_eq!(votes.cached(), 1);
    }

    #[tokio::test]
    async fn test_empty_target_rejected() {
        let store = MemoryStore::new("@me");
        let votes = VoteAggregator::new(store);
        let err = votes.get_votes("").await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Validation);
        assert_eq!(votes.cached(), 0);
    }

    #[tokio::test]
    async fn test_forget_drops_tally() {
        let store = MemoryStore::new("@me");
        let votes = VoteAggregator::new(store);
        votes.get_votes("%repo").await.unwrap();
        assert!(votes.forget("%repo"));
        assert!(!votes.forget("%repo"));
        assert_eq!(votes.cached(), 0);
    }

    #[tokio::test]
    async fn test_resync_after_disconnect() {
        let store = MemoryStore::new("@me");
        store.append(vote("@a", "%repo", Some(1)));
        let votes = VoteAggregator::new(Arc::clone(&store) as Arc<dyn LogStore>);
        let mut rx = votes.watch("%repo").await.unwrap();

        store.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.reopen();
        // Appended while the tail may still be down; resync must pick it up.
        store.append(vote("@b", "%repo", Some(1)));

        let tally = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|t| t.upvotes == 2))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert!(tally.has_upvoted("@a") && tally.has_upvoted("@b"));
    }
}
