//! Live queries over change notifications
//!
//! Adapters that can observe their own mutations publish a [`ChangeNotice`] through a
//! [`ChangeNotifier`] after each committed write. [`spawn_watch`] turns those notices into
//! a [`ChangeStream`]: the query runs once on subscribe, then again after every notice
//! that falls inside the stream's [`WatchScope`], and each run is emitted as a complete
//! snapshot.
//!
//! Streams keep only the latest snapshot. A consumer that falls behind sees the newest
//! result, never the intermediate ones. Cancelling a stream stops emissions immediately;
//! a query already running when `cancel` is called finishes, and its result is dropped.

use super::error::Result;
use futures_util::Stream;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

/// Default capacity of a notifier's broadcast channel
pub const DEFAULT_NOTIFY_CAPACITY: usize = 256;

/// Collection name of a notice that may concern any collection
///
/// Published when an adapter cannot tell which collection a write touched. Every
/// [`WatchScope`] covers it.
pub const ANY_COLLECTION: &str = "*";

/// What happened to a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Committed data in the collection changed
    Changed,
    /// The adapter was closed; streams end
    Closed,
}

/// A committed mutation on one collection (table, object type or box)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    /// Monotonic sequence number per notifier
    pub sequence: u64,
    /// Collection that changed
    pub collection: String,
    /// Kind of notice
    pub kind: NoticeKind,
}

/// Publishes change notices to every live subscriber
///
/// Cheap to clone; clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeNotice>,
    sequence: Arc<AtomicU64>,
}

impl ChangeNotifier {
    /// Create a notifier with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sequence: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Publish a change on `collection`; dropped silently when nobody listens
    pub fn publish(&self, collection: &str) -> u64 {
        self.send(collection, NoticeKind::Changed)
    }

    /// Publish a change that may concern any collection
    pub fn publish_any(&self) -> u64 {
        self.send(ANY_COLLECTION, NoticeKind::Changed)
    }

    /// Tell every stream that the adapter is gone
    pub fn publish_closed(&self) -> u64 {
        self.send("", NoticeKind::Closed)
    }

    fn send(&self, collection: &str, kind: NoticeKind) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(ChangeNotice {
            sequence,
            collection: collection.to_string(),
            kind,
        });
        sequence
    }

    /// Subscribe to future notices
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_CAPACITY)
    }
}

/// Which notices re-trigger a stream's query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchScope {
    /// Only changes to one collection
    Collection(String),
    /// Changes to any of several collections
    Collections(Vec<String>),
    /// Every change on the adapter; may re-emit for unrelated writes
    All,
}

impl WatchScope {
    /// Whether a notice should re-run the query
    pub fn covers(&self, notice: &ChangeNotice) -> bool {
        if notice.collection == ANY_COLLECTION {
            return true;
        }
        match self {
            WatchScope::Collection(name) => notice.collection == *name,
            WatchScope::Collections(names) => names.iter().any(|n| *n == notice.collection),
            WatchScope::All => true,
        }
    }
}

struct Shared<T> {
    slot: Mutex<Option<Result<T>>>,
    notify: Notify,
    cancelled: AtomicBool,
    finished: AtomicBool,
}

impl<T> Shared<T> {
    fn emit(&self, snapshot: Result<T>) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        *self.slot.lock() = Some(snapshot);
        self.notify.notify_one();
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// A live sequence of full result snapshots
///
/// Every item replaces the previous one; items are never deltas. Query failures are
/// emitted as `Err` items and the stream stays subscribed.
pub struct ChangeStream<T> {
    shared: Arc<Shared<T>>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> ChangeStream<T> {
    /// Wait for the next snapshot
    ///
    /// Returns `None` once the stream is cancelled or its adapter closed.
    pub async fn next(&mut self) -> Option<Result<T>> {
        loop {
            if self.shared.cancelled.load(Ordering::Acquire) {
                return None;
            }
            if let Some(snapshot) = self.shared.slot.lock().take() {
                return Some(snapshot);
            }
            if self.shared.finished.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the pending snapshot without waiting
    pub fn try_next(&mut self) -> Option<Result<T>> {
        if self.shared.cancelled.load(Ordering::Acquire) {
            return None;
        }
        self.shared.slot.lock().take()
    }

    /// Stop the stream; no further snapshots are delivered
    pub fn cancel(&mut self) {
        if !self.shared.cancelled.swap(true, Ordering::AcqRel) {
            self.task.abort();
            self.shared.slot.lock().take();
            self.shared.notify.notify_one();
            tracing::debug!("change stream cancelled");
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Adapt into a `futures` stream of snapshots
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send {
        futures_util::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|snapshot| (snapshot, stream))
        })
    }
}

impl<T> Drop for ChangeStream<T> {
    fn drop(&mut self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.task.abort();
    }
}

/// Start a live query
///
/// `notices` must be subscribed before this call so that no mutation between the
/// subscription and the first query is missed. `query` runs once immediately and again
/// after each covered notice; notices that queue up while a query runs are coalesced
/// into a single re-run.
pub fn spawn_watch<T, Q, Fut>(
    mut notices: broadcast::Receiver<ChangeNotice>,
    scope: WatchScope,
    query: Q,
) -> ChangeStream<T>
where
    T: Send + 'static,
    Q: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let shared = Arc::new(Shared {
        slot: Mutex::new(None),
        notify: Notify::new(),
        cancelled: AtomicBool::new(false),
        finished: AtomicBool::new(false),
    });

    let task_shared = Arc::clone(&shared);
    let task = tokio::spawn(async move {
        tracing::debug!(?scope, "change stream active");
        task_shared.emit(query().await);

        'watch: loop {
            match notices.recv().await {
                Ok(notice) if notice.kind == NoticeKind::Closed => break,
                Ok(notice) if scope.covers(&notice) => {}
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "change stream lagged behind notifications");
                }
                Err(RecvError::Closed) => break,
            }

            loop {
                match notices.try_recv() {
                    Ok(notice) if notice.kind == NoticeKind::Closed => break 'watch,
                    Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Closed) => break 'watch,
                }
            }

            if task_shared.cancelled.load(Ordering::Acquire) {
                break;
            }
            task_shared.emit(query().await);
        }

        task_shared.finish();
        tracing::debug!("change stream finished");
    });

    ChangeStream { shared, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BridgeError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_query(
        counter: Arc<AtomicUsize>,
    ) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = Result<usize>> + Send>> {
        move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move { Ok(counter.load(Ordering::SeqCst)) })
        }
    }

    #[tokio::test]
    async fn test_initial_snapshot_then_refresh() {
        let notifier = ChangeNotifier::default();
        let state = Arc::new(AtomicUsize::new(1));
        let mut stream = spawn_watch(
            notifier.subscribe(),
            WatchScope::Collection("users".into()),
            counting_query(Arc::clone(&state)),
        );

        assert_eq!(stream.next().await.unwrap().unwrap(), 1);

        state.store(2, Ordering::SeqCst);
        notifier.publish("users");
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_out_of_scope_notice_is_ignored() {
        let notifier = ChangeNotifier::default();
        let state = Arc::new(AtomicUsize::new(1));
        let mut stream = spawn_watch(
            notifier.subscribe(),
            WatchScope::Collection("users".into()),
            counting_query(Arc::clone(&state)),
        );
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);

        notifier.publish("orders");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn test_any_collection_notice_is_covered_by_every_scope() {
        let notice = ChangeNotice {
            sequence: 1,
            collection: ANY_COLLECTION.to_string(),
            kind: NoticeKind::Changed,
        };
        assert!(WatchScope::Collection("users".into()).covers(&notice));
        assert!(WatchScope::Collections(vec!["a".into(), "b".into()]).covers(&notice));
        assert!(WatchScope::All.covers(&notice));
    }

    #[tokio::test]
    async fn test_no_emission_after_cancel() {
        let notifier = ChangeNotifier::default();
        let state = Arc::new(AtomicUsize::new(1));
        let mut stream = spawn_watch(
            notifier.subscribe(),
            WatchScope::All,
            counting_query(Arc::clone(&state)),
        );
        assert!(stream.next().await.is_some());

        stream.cancel();
        notifier.publish("users");
        assert!(stream.is_cancelled());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_notice_ends_stream() {
        let notifier = ChangeNotifier::default();
        let state = Arc::new(AtomicUsize::new(7));
        let mut stream = spawn_watch(
            notifier.subscribe(),
            WatchScope::All,
            counting_query(state),
        );
        assert_eq!(stream.next().await.unwrap().unwrap(), 7);

        notifier.publish_closed();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_query_errors_are_emitted_not_fatal() {
        let notifier = ChangeNotifier::default();
        let fail = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&fail);
        let mut stream = spawn_watch(notifier.subscribe(), WatchScope::All, move || {
            let flag = Arc::clone(&flag);
            async move {
                if flag.load(Ordering::SeqCst) {
                    Err(BridgeError::validation("boom"))
                } else {
                    Ok(1u8)
                }
            }
        });

        assert!(stream.next().await.unwrap().is_err());
        fail.store(false, Ordering::SeqCst);
        notifier.publish("anything");
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
    }

    #[test]
    fn test_watch_scope_covers() {
        let notice = ChangeNotice {
            sequence: 1,
            collection: "users".into(),
            kind: NoticeKind::Changed,
        };
        assert!(WatchScope::All.covers(&notice));
        assert!(WatchScope::Collection("users".into()).covers(&notice));
        assert!(!WatchScope::Collection("orders".into()).covers(&notice));
        assert!(WatchScope::Collections(vec!["a".into(), "users".into()]).covers(&notice));
    }
}
