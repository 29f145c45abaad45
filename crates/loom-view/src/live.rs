//! Supervised live subscriptions.
//!
//! A live read model applies each message from a live tail of the log to
//! its state. When the tail breaks (the log disconnects or the tail lags)
//! the supervisor waits with exponential backoff, resubscribes, lets the
//! model resync from history and carries on. It stops when its
//! [`Subscription`] is cancelled or dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::StreamExt;
use loom_store::{Message, MessageStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ViewError;

/// State kept current from a live tail.
#[async_trait]
pub trait LiveModel: Send + Sync + 'static {
    /// Open a new live tail.
    fn subscribe(&self) -> MessageStream;

    /// Rebuild state after a gap. Called after every resubscription,
    /// before any message from the new tail is applied.
    async fn resync(&self) -> Result<(), ViewError>;

    /// Apply one message from the tail.
    fn apply(&self, message: Message);
}

/// Handle to a supervised live task. Dropping it stops the task.
pub struct Subscription {
    label: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Start supervising `model`, beginning with the already opened tail
    /// `initial`. Opening the first tail before reading history lets the
    /// caller seed state without missing anything in between.
    pub fn spawn<M: LiveModel>(label: impl Into<String>, model: Arc<M>, initial: MessageStream) -> Self {
        let label = label.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task_label = label.clone();
        let handle = tokio::spawn(async move {
            run(&task_label, model, initial, shutdown_rx).await;
        });
        info!(subscription = %label, "live subscription attached");
        Self {
            label,
            shutdown_tx,
            handle,
        }
    }

    /// Ask the task to stop after the message it is applying.
    pub fn cancel(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        self.handle.abort();
        debug!(subscription = %self.label, "live subscription dropped");
    }
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None, // Retry forever
        ..Default::default()
    }
}

async fn run<M: LiveModel>(
    label: &str,
    model: Arc<M>,
    initial: MessageStream,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = reconnect_backoff();
    let mut tail = Some(initial);

    loop {
        if *shutdown_rx.borrow() {
            debug!(subscription = %label, "live subscription shutting down");
            return;
        }

        let stream = match tail.take() {
            Some(stream) => stream,
            None => {
                let stream = model.subscribe();
                if let Err(e) = model.resync().await {
                    warn!(subscription = %label, error = %e, "resync failed");
                    if !e.is_disconnect() {
                        error!(subscription = %label, error = %e, "live subscription giving up");
                        return;
                    }
                    if !wait(&mut shutdown_rx, &mut backoff).await {
                        return;
                    }
                    continue;
                }
                info!(subscription = %label, "live subscription resynced");
                stream
            }
        };

        match follow(label, &*model, stream, &mut shutdown_rx, &mut backoff).await {
            Ok(()) => return,
            Err(e) if e.is_disconnect() => {
                warn!(subscription = %label, error = %e, "live tail interrupted, resubscribing");
                if !wait(&mut shutdown_rx, &mut backoff).await {
                    return;
                }
            }
            Err(e) => {
                error!(subscription = %label, error = %e, "live subscription failed");
                return;
            }
        }
    }
}

/// Apply messages until shutdown (`Ok`) or the tail breaks (`Err`).
async fn follow<M: LiveModel>(
    label: &str,
    model: &M,
    mut stream: MessageStream,
    shutdown_rx: &mut watch::Receiver<bool>,
    backoff: &mut ExponentialBackoff,
) -> Result<(), ViewError> {
    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
            }

            item = stream.next() => match item {
                Some(Ok(message)) => {
                    backoff.reset();
                    model.apply(message);
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    debug!(subscription = %label, "live tail ended");
                    return Err(ViewError::disconnected("live tail ended"));
                }
            }
        }
    }
}

/// Sleep for the next backoff interval. Returns false on shutdown.
async fn wait(shutdown_rx: &mut watch::Receiver<bool>, backoff: &mut ExponentialBackoff) -> bool {
    // Always Some since max_elapsed_time is None
    let wait_duration = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
    tokio::select! {
        changed = shutdown_rx.changed() => {
            changed.is_ok() && !*shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(wait_duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_store::{Content, LinkQuery, LogStore, MemoryStore, NewMessage, PostContent, Rel};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        store: Arc<MemoryStore>,
        seen: Mutex<Vec<String>>,
        resyncs: AtomicUsize,
    }

    #[async_trait]
    impl LiveModel for Recorder {
        fn subscribe(&self) -> MessageStream {
            self.store.links(LinkQuery::to("%root", Rel::Root).live())
        }

        async fn resync(&self) -> Result<(), ViewError> {
            self.store.whoami().await?;
            self.resyncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn apply(&self, message: Message) {
            self.seen.lock().unwrap().push(message.key);
        }
    }

    fn reply(key: &str) -> NewMessage {
        NewMessage {
            key: Some(key.to_string()),
            author: "@a".to_string(),
            timestamp: 1,
            content: Content::Post(PostContent {
                text: "hi".to_string(),
                root: Some("%root".to_string()),
            }),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_resubscribes_after_disconnect() {
        let store = MemoryStore::new("@me");
        let model = Arc::new(Recorder {
            store: Arc::clone(&store),
            seen: Mutex::new(Vec::new()),
            resyncs: AtomicUsize::new(0),
        });
        let sub = Subscription::spawn("test", Arc::clone(&model), model.subscribe());

        store.append(reply("%one"));
        wait_until(|| model.seen.lock().unwrap().len() == 1).await;

        store.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.reopen();
        wait_until(|| model.resyncs.load(Ordering::SeqCst) >= 1).await;

        store.append(reply("%two"));
        wait_until(|| model.seen.lock().unwrap().len() == 2).await;
        assert_eq!(*model.seen.lock().unwrap(), vec!["%one", "%two"]);
        assert!(!sub.is_finished());
    }

    #[tokio::test]
    async fn test_drop_stops_task() {
        let store = MemoryStore::new("@me");
        let model = Arc::new(Recorder {
            store: Arc::clone(&store),
            seen: Mutex::new(Vec::new()),
            resyncs: AtomicUsize::new(0),
        });
        let sub = Subscription::spawn("test", Arc::clone(&model), model.subscribe());
        sub.cancel();
        wait_until(|| sub.is_finished()).await;
        drop(sub);

        store.append(reply("%late"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(model.seen.lock().unwrap().is_empty());
    }
}
