//! Display names and avatars.
//!
//! The name of a feed is whatever the viewer called it, falling back to
//! what the feed called itself. Repositories are named the same way, with
//! the repo owner in place of the feed: the key is the `(owner, repo)`
//! pair. Resolved records are memoized and kept current by one live
//! listener per resolver.

use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::TryStreamExt;
use loom_store::{BlobId, Content, FeedId, LinkQuery, LogStore, Message, MessageStream, Rel};
use tracing::{debug, trace};

use crate::ViewError;
use crate::live::{LiveModel, Subscription};
use crate::memo::AsyncMemo;

/// Names at least this long are cut down for display.
const FALLBACK_NAME_LEN: usize = 20;

/// Identity whose display name is being resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AboutKey {
    /// Second source of about records, after the viewer.
    pub owner: FeedId,
    /// Id the records are about.
    pub target: String,
}

impl AboutKey {
    /// A feed, which describes itself.
    pub fn feed(id: impl Into<FeedId>) -> Self {
        let id = id.into();
        Self {
            owner: id.clone(),
            target: id,
        }
    }

    /// A repository, described by its owner.
    pub fn repo(owner: impl Into<FeedId>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            target: repo.into(),
        }
    }
}

impl fmt::Display for AboutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.owner == self.target {
            f.write_str(&self.target)
        } else {
            write!(f, "{}/{}", self.owner, self.target)
        }
    }
}

/// Resolved name and avatar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct About {
    pub name: String,
    pub image: Option<BlobId>,
}

#[derive(Debug, Default)]
struct AboutFields {
    name: Option<String>,
    image: Option<BlobId>,
}

type SharedFields = Arc<RwLock<AboutFields>>;

/// Shortened id used when nobody named the target.
pub fn fallback_name(target: &str) -> String {
    if target.chars().count() < FALLBACK_NAME_LEN {
        return target.to_string();
    }
    let mut name: String = target.chars().take(FALLBACK_NAME_LEN - 1).collect();
    name.push('…');
    name
}

/// Memoized, live-updated name resolver for one viewer.
pub struct AboutResolver {
    memo: AsyncMemo<AboutKey, SharedFields>,
    listener: Arc<AboutListener>,
    _subscription: Subscription,
}

impl AboutResolver {
    /// Create a resolver for `viewer` and start its live listener.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn LogStore>, viewer: impl Into<FeedId>) -> Self {
        let listener = Arc::new(AboutListener {
            store: Arc::clone(&store),
            viewer: viewer.into(),
            records: DashMap::new(),
            memo: OnceLock::new(),
        });

        let weak: Weak<AboutListener> = Arc::downgrade(&listener);
        let memo = AsyncMemo::new("about", move |key: AboutKey| {
            let listener = weak.upgrade();
            async move {
                match listener {
                    Some(listener) => listener.scan(key).await,
                    None => Err(ViewError::disconnected("about resolver dropped")),
                }
            }
        });
        // Set exactly once, right here.
        let _ = listener.memo.set(memo.clone());

        let subscription = Subscription::spawn("about", Arc::clone(&listener), listener.subscribe());
        Self {
            memo,
            listener,
            _subscription: subscription,
        }
    }

    pub fn viewer(&self) -> &str {
        &self.listener.viewer
    }

    /// Name and avatar for `key`.
    pub async fn resolve(&self, key: AboutKey) -> Result<About, ViewError> {
        if key.target.is_empty() {
            return Err(ViewError::validation("about target id is empty"));
        }
        if key.owner.is_empty() {
            return Err(ViewError::validation(format!("owner of {} is empty", key.target)));
        }
        let target = key.target.clone();
        let fields = self.memo.get(key).await?;
        let fields = fields.read().unwrap_or_else(PoisonError::into_inner);
        Ok(About {
            name: fields
                .name
                .clone()
                .unwrap_or_else(|| fallback_name(&target)),
            image: fields.image.clone(),
        })
    }

    /// Display name of a feed.
    pub async fn get_name(&self, feed: &str) -> Result<String, ViewError> {
        Ok(self.resolve(AboutKey::feed(feed)).await?.name)
    }

    /// Avatar blob of a feed, if it has one.
    pub async fn get_image(&self, feed: &str) -> Result<Option<BlobId>, ViewError> {
        Ok(self.resolve(AboutKey::feed(feed)).await?.image)
    }

    /// Display name of a repository owned by `owner`.
    pub async fn get_repo_name(&self, owner: &str, repo: &str) -> Result<String, ViewError> {
        Ok(self.resolve(AboutKey::repo(owner, repo)).await?.name)
    }

    /// Number of memoized records.
    pub fn cached(&self) -> usize {
        self.memo.len()
    }
}

/// Scans history for records and patches them from the live tail.
///
/// Every record is registered before its history scan starts, so a live
/// update that lands mid-scan is never lost: the listener writes it into
/// the record and the scan only fills fields that are still empty.
struct AboutListener {
    store: Arc<dyn LogStore>,
    viewer: FeedId,
    records: DashMap<AboutKey, SharedFields>,
    memo: OnceLock<AsyncMemo<AboutKey, SharedFields>>,
}

impl AboutListener {
    async fn scan(&self, key: AboutKey) -> Result<SharedFields, ViewError> {
        let record = Arc::clone(self.records.entry(key.clone()).or_default().value());
        debug!(key = %key, "about: scanning history");

        let sources = if key.owner == self.viewer {
            vec![&self.viewer]
        } else {
            vec![&self.viewer, &key.owner]
        };
        for source in sources {
            if is_complete(&record) {
                break;
            }
            let query = LinkQuery::to(key.target.clone(), Rel::About)
                .from_source(source.clone())
                .reversed();
            let mut stream = self.store.links(query);
            while let Some(message) = stream.try_next().await? {
                let mut fields = record.write().unwrap_or_else(PoisonError::into_inner);
                if let Content::About(about) = message.content() {
                    if fields.name.is_none() {
                        fields.name = about.name.clone().filter(|n| !n.is_empty());
                    }
                    if fields.image.is_none() {
                        fields.image = about.image.as_ref().map(|i| i.id().to_string());
                    }
                }
                if fields.name.is_some() && fields.image.is_some() {
                    break;
                }
            }
        }
        Ok(record)
    }
}

fn is_complete(record: &SharedFields) -> bool {
    let fields = record.read().unwrap_or_else(PoisonError::into_inner);
    fields.name.is_some() && fields.image.is_some()
}

#[async_trait]
impl LiveModel for AboutListener {
    fn subscribe(&self) -> MessageStream {
        self.store.links(LinkQuery {
            rel: Some(Rel::About),
            live: true,
            ..Default::default()
        })
    }

    async fn resync(&self) -> Result<(), ViewError> {
        // Updates may have been missed; resolve everything from history again.
        // Records go first: a scan that registers after this point is
        // detached by the memo clear and never cached.
        self.records.clear();
        if let Some(memo) = self.memo.get() {
            memo.clear();
        }
        Ok(())
    }

    fn apply(&self, message: Message) {
        let Content::About(about) = message.content() else {
            return;
        };
        let author = message.author();
        for record in self.records.iter() {
            let key = record.key();
            if key.target != about.about || (author != self.viewer && author != key.owner) {
                continue;
            }
            let mut fields = record.value().write().unwrap_or_else(PoisonError::into_inner);
            if let Some(name) = about.name.as_ref().filter(|n| !n.is_empty()) {
                fields.name = Some(name.clone());
            }
            if let Some(image) = &about.image {
                fields.image = Some(image.id().to_string());
            }
            trace!(key = %key, author = %author, "about: record updated");
        }
    }
}
