//! Per-connection FIFO of filesystem operations deferred by network failures.
//!
//! Queues are bounded: a full queue drops its oldest operation, and an
//! operation that keeps failing with network errors during replay is dropped
//! after `max_replay_failures` tries. Operations that fail replay with any other
//! kind of error are dropped at once, since retrying cannot fix them.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
    Delete,
    Mkdir,
    Rmdir,
    Rename,
    Stat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsOperation {
    Read { path: String },
    Write { path: String, data: Vec<u8> },
    Delete { path: String },
    Mkdir { path: String },
    Rmdir { path: String },
    Rename { from: String, to: String },
    Stat { path: String },
}

impl FsOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            FsOperation::Read { .. } => OperationKind::Read,
            FsOperation::Write { .. } => OperationKind::Write,
            FsOperation::Delete { .. } => OperationKind::Delete,
            FsOperation::Mkdir { .. } => OperationKind::Mkdir,
            FsOperation::Rmdir { .. } => OperationKind::Rmdir,
            FsOperation::Rename { .. } => OperationKind::Rename,
            FsOperation::Stat { .. } => OperationKind::Stat,
        }
    }

    /// Target path; the source path for renames.
    pub fn path(&self) -> &str {
        match self {
            FsOperation::Read { path }
            | FsOperation::Write { path, .. }
            | FsOperation::Delete { path }
            | FsOperation::Mkdir { path }
            | FsOperation::Rmdir { path }
            | FsOperation::Stat { path } => path,
            FsOperation::Rename { from, .. } => from,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            FsOperation::Write { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, FsOperation::Read { .. } | FsOperation::Stat { .. })
    }

    /// Paths whose cached state becomes stale once this operation succeeds.
    pub fn affected_paths(&self) -> Vec<&str> {
        match self {
            FsOperation::Read { .. } | FsOperation::Stat { .. } => Vec::new(),
            FsOperation::Rename { from, to } => vec![from.as_str(), to.as_str()],
            other => vec![other.path()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedOperation {
    pub operation: FsOperation,
    /// Assigned on enqueue; identifies the operation while it is replayed.
    pub seq: u64,
    pub enqueued_at: SystemTime,
    pub replay_failures: u32,
}

impl QueuedOperation {
    pub fn new(operation: FsOperation) -> Self {
        Self {
            operation,
            seq: 0,
            enqueued_at: SystemTime::now(),
            replay_failures: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_pending_per_connection: usize,
    pub max_replay_failures: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending_per_connection: 1000,
            max_replay_failures: 3,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub dropped: usize,
    pub requeued: usize,
}

/// Re-issues a queued operation against a live connection.
#[async_trait]
pub trait OperationReplayer: Send + Sync {
    async fn replay(&self, operation: &FsOperation) -> Result<()>;
}

pub struct OperationQueue {
    config: QueueConfig,
    queues: Mutex<HashMap<String, VecDeque<QueuedOperation>>>,
    replaying: Mutex<HashSet<String>>,
    next_seq: AtomicU64,
}

impl OperationQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queues: Mutex::new(HashMap::new()),
            replaying: Mutex::new(HashSet::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Appends an operation; returns the connection's queue length afterwards.
    pub fn enqueue(&self, connection_id: &str, operation: FsOperation) -> usize {
        if self.config.max_pending_per_connection == 0 {
            tracing::warn!(
                "operation queue disabled, dropping {:?} on {}",
                operation.kind(),
                operation.path()
            );
            return 0;
        }

        let mut queues = self.queues.lock();
        let queue = queues.entry(connection_id.to_string()).or_default();
        tracing::debug!(
            "queueing {:?} {} for connection {}",
            operation.kind(),
            operation.path(),
            connection_id
        );
        let mut queued = QueuedOperation::new(operation);
        queued.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        queue.push_back(queued);
        trim_to(queue, self.config.max_pending_per_connection, connection_id);
        queue.len()
    }

    pub fn pending(&self, connection_id: &str) -> Vec<QueuedOperation> {
        self.queues
            .lock()
            .get(connection_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, connection_id: &str) -> usize {
        self.queues.lock().get(connection_id).map_or(0, |q| q.len())
    }

    pub fn has_pending(&self, connection_id: &str) -> bool {
        self.queues.lock().contains_key(connection_id)
    }

    pub fn total_pending(&self) -> usize {
        self.queues.lock().values().map(|q| q.len()).sum()
    }

    /// Discards a connection's queue, returning what was pending.
    pub fn remove(&self, connection_id: &str) -> Vec<QueuedOperation> {
        self.queues
            .lock()
            .remove(connection_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Replays the connection's queue in FIFO order.
    ///
    /// Each operation stays queued while it is in flight and is popped only
    /// once it succeeds or is dropped, so a cancelled replay loses nothing.
    /// On a network failure the failing operation (unless it ran out of tries)
    /// stays at the front and the error is returned. A replay already running
    /// for the same connection makes this call a no-op.
    pub async fn replay(
        &self,
        connection_id: &str,
        replayer: &dyn OperationReplayer,
    ) -> Result<ReplaySummary> {
        let Some(_running) = ReplayGuard::acquire(self, connection_id) else {
            tracing::debug!("replay for {} already in progress", connection_id);
            return Ok(ReplaySummary::default());
        };

        let mut summary = ReplaySummary::default();
        let pending = self.len(connection_id);
        if pending > 0 {
            tracing::info!(
                "replaying {} queued operations for connection {}",
                pending,
                connection_id
            );
        }

        while let Some(queued) = self.front(connection_id) {
            match replayer.replay(&queued.operation).await {
                Ok(()) => {
                    self.settle(connection_id, queued.seq, false);
                    summary.replayed += 1;
                }
                Err(err) if err.is_network() => {
                    let failures = queued.replay_failures + 1;
                    if failures >= self.config.max_replay_failures {
                        tracing::warn!(
                            "dropping {:?} {} after {} failed replays: {}",
                            queued.operation.kind(),
                            queued.operation.path(),
                            failures,
                            err
                        );
                        self.settle(connection_id, queued.seq, false);
                        summary.dropped += 1;
                    } else {
                        self.settle(connection_id, queued.seq, true);
                    }
                    summary.requeued = self.len(connection_id);
                    tracing::warn!(
                        "replay for {} interrupted ({} replayed, {} requeued, {} dropped)",
                        connection_id,
                        summary.replayed,
                        summary.requeued,
                        summary.dropped
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        "dropping {:?} {}: {}",
                        queued.operation.kind(),
                        queued.operation.path(),
                        err
                    );
                    self.settle(connection_id, queued.seq, false);
                    summary.dropped += 1;
                }
            }
        }

        Ok(summary)
    }

    fn front(&self, connection_id: &str) -> Option<QueuedOperation> {
        self.queues
            .lock()
            .get(connection_id)
            .and_then(|q| q.front().cloned())
    }

    /// Finishes an in-flight operation: either counts a failed try or removes
    /// it. The operation may have been trimmed or discarded meanwhile.
    fn settle(&self, connection_id: &str, seq: u64, failed: bool) {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(connection_id) else {
            return;
        };
        if let Some(index) = queue.iter().position(|q| q.seq == seq) {
            if failed {
                queue[index].replay_failures += 1;
            } else {
                queue.remove(index);
            }
        }
        if queue.is_empty() {
            queues.remove(connection_id);
        }
    }
}

/// Marks a connection's queue as being replayed until dropped.
struct ReplayGuard<'a> {
    queue: &'a OperationQueue,
    connection_id: String,
}

impl<'a> ReplayGuard<'a> {
    fn acquire(queue: &'a OperationQueue, connection_id: &str) -> Option<Self> {
        if !queue.replaying.lock().insert(connection_id.to_string()) {
            return None;
        }
        Some(Self {
            queue,
            connection_id: connection_id.to_string(),
        })
    }
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.queue.replaying.lock().remove(&self.connection_id);
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

fn trim_to(queue: &mut VecDeque<QueuedOperation>, max: usize, connection_id: &str) {
    while queue.len() > max {
        if let Some(dropped) = queue.pop_front() {
            tracing::warn!(
                "operation queue for {} is full, dropping oldest {:?} {}",
                connection_id,
                dropped.operation.kind(),
                dropped.operation.path()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorRecord;
    use crate::error::SessionError;
    use crate::transport::RawError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn write(path: &str) -> FsOperation {
        FsOperation::Write {
            path: path.to_string(),
            data: b"x".to_vec(),
        }
    }

    fn network_error() -> SessionError {
        SessionError::Remote(ErrorRecord::classify(
            &RawError::with_code("socket closed", "ECONNRESET"),
            Some("c1"),
        ))
    }

    fn not_found() -> SessionError {
        SessionError::Remote(ErrorRecord::classify(
            &RawError::with_code("no such file", "ENOENT"),
            Some("c1"),
        ))
    }

    /// Records replayed paths; fails the paths listed in `fail_network`/`fail_other`.
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_network: Vec<&'static str>,
        fail_other: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn new(fail_network: Vec<&'static str>, fail_other: Vec<&'static str>) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_network,
                fail_other,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OperationReplayer for Recorder {
        async fn replay(&self, operation: &FsOperation) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let path = operation.path();
            if self.fail_network.iter().any(|p| *p == path) {
                return Err(network_error());
            }
            if self.fail_other.iter().any(|p| *p == path) {
                return Err(not_found());
            }
            self.seen.lock().push(path.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_enqueue_is_fifo() {
        let queue = OperationQueue::default();
        queue.enqueue("c1", write("/a"));
        queue.enqueue("c1", write("/b"));
        let paths: Vec<String> = queue
            .pending("c1")
            .iter()
            .map(|q| q.operation.path().to_string())
            .collect();
        assert_eq!(paths, vec!["/a", "/b"]);
        assert!(queue.has_pending("c1"));
        assert!(!queue.has_pending("c2"));
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = OperationQueue::new(QueueConfig {
            max_pending_per_connection: 2,
            max_replay_failures: 3,
        });
        queue.enqueue("c1", write("/a"));
        queue.enqueue("c1", write("/b"));
        assert_eq!(queue.enqueue("c1", write("/c")), 2);
        let first = queue.pending("c1")[0].operation.path().to_string();
        assert_eq!(first, "/b");
    }

    #[test]
    fn test_operation_accessors() {
        let rename = FsOperation::Rename {
            from: "/a".to_string(),
            to: "/b".to_string(),
        };
        assert_eq!(rename.kind(), OperationKind::Rename);
        assert_eq!(rename.affected_paths(), vec!["/a", "/b"]);
        assert!(rename.is_mutation());
        assert_eq!(write("/w").payload(), Some(&b"x"[..]));
        let stat = FsOperation::Stat {
            path: "/s".to_string(),
        };
        assert!(!stat.is_mutation());
        assert!(stat.affected_paths().is_empty());
    }

    #[tokio::test]
    async fn test_replay_success_removes_queue() {
        let queue = OperationQueue::default();
        queue.enqueue("c1", write("/a"));
        queue.enqueue("c1", write("/b"));
        let recorder = Recorder::new(vec![], vec![]);

        let summary = queue.replay("c1", &recorder).await.unwrap();
        assert_eq!(summary.replayed, 2);
        assert!(!queue.has_pending("c1"));
        assert_eq!(*recorder.seen.lock(), vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn test_replay_empty_queue_is_noop() {
        let queue = OperationQueue::default();
        let recorder = Recorder::new(vec![], vec![]);
        assert_eq!(
            queue.replay("c1", &recorder).await.unwrap(),
            ReplaySummary::default()
        );
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_network_failure_requeues_remaining_in_order() {
        let queue = OperationQueue::default();
        for p in ["/a", "/b", "/c"] {
            queue.enqueue("c1", write(p));
        }
        let recorder = Recorder::new(vec!["/b"], vec![]);

        let err = queue.replay("c1", &recorder).await.unwrap_err();
        assert!(err.is_network());
        let pending = queue.pending("c1");
        let paths: Vec<&str> = pending.iter().map(|q| q.operation.path()).collect();
        assert_eq!(paths, vec!["/b", "/c"]);
        assert_eq!(pending[0].replay_failures, 1);
        assert_eq!(pending[1].replay_failures, 0);
    }

    #[tokio::test]
    async fn test_requeued_ops_stay_ahead_of_new_ones() {
        let queue = OperationQueue::default();
        queue.enqueue("c1", write("/a"));
        let recorder = Recorder::new(vec!["/a"], vec![]);
        let _ = queue.replay("c1", &recorder).await;
        queue.enqueue("c1", write("/late"));

        let paths: Vec<String> = queue
            .pending("c1")
            .iter()
            .map(|q| q.operation.path().to_string())
            .collect();
        assert_eq!(paths, vec!["/a", "/late"]);
    }

    #[tokio::test]
    async fn test_operation_dropped_after_max_replay_failures() {
        let queue = OperationQueue::new(QueueConfig {
            max_pending_per_connection: 10,
            max_replay_failures: 2,
        });
        queue.enqueue("c1", write("/flaky"));
        let recorder = Recorder::new(vec!["/flaky"], vec![]);

        assert!(queue.replay("c1", &recorder).await.is_err());
        assert_eq!(queue.len("c1"), 1);
        assert!(queue.replay("c1", &recorder).await.is_err());
        assert_eq!(queue.len("c1"), 0);
        assert!(!queue.has_pending("c1"));
    }

    #[tokio::test]
    async fn test_non_network_failure_is_dropped_and_replay_continues() {
        let queue = OperationQueue::default();
        for p in ["/gone", "/ok"] {
            queue.enqueue("c1", write(p));
        }
        let recorder = Recorder::new(vec![], vec!["/gone"]);

        let summary = queue.replay("c1", &recorder).await.unwrap();
        assert_eq!(summary.replayed, 1);
        assert_eq!(summary.dropped, 1);
        assert!(!queue.has_pending("c1"));
    }

    /// Replays everything except `stall_on`, which never completes.
    struct Stalling {
        stall_on: &'static str,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OperationReplayer for Stalling {
        async fn replay(&self, operation: &FsOperation) -> Result<()> {
            if operation.path() == self.stall_on {
                std::future::pending::<()>().await;
            }
            self.seen.lock().push(operation.path().to_string());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_replay_keeps_unreplayed_operations() {
        let queue = OperationQueue::default();
        for p in ["/a", "/b", "/c"] {
            queue.enqueue("c1", write(p));
        }
        let stalling = Stalling {
            stall_on: "/b",
            seen: Mutex::new(Vec::new()),
        };

        let result =
            tokio::time::timeout(Duration::from_secs(1), queue.replay("c1", &stalling)).await;
        assert!(result.is_err());
        assert_eq!(*stalling.seen.lock(), vec!["/a"]);

        let pending = queue.pending("c1");
        let paths: Vec<&str> = pending.iter().map(|q| q.operation.path()).collect();
        assert_eq!(paths, vec!["/b", "/c"]);
        assert_eq!(pending[0].replay_failures, 0);

        let recorder = Recorder::new(vec![], vec![]);
        let summary = queue.replay("c1", &recorder).await.unwrap();
        assert_eq!(summary.replayed, 2);
        assert!(!queue.has_pending("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_stays_pending_during_replay() {
        let queue = OperationQueue::default();
        queue.enqueue("c1", write("/a"));
        queue.enqueue("c1", write("/b"));
        let stalling = Stalling {
            stall_on: "/b",
            seen: Mutex::new(Vec::new()),
        };
        let recorder = Recorder::new(vec![], vec![]);

        let first = queue.replay("c1", &stalling);
        tokio::pin!(first);
        tokio::select! {
            _ = &mut first => panic!("replay should stall on /b"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        assert!(queue.has_pending("c1"));
        assert_eq!(queue.len("c1"), 1);

        // A second replay while the first is in flight does nothing.
        let summary = queue.replay("c1", &recorder).await.unwrap();
        assert_eq!(summary, ReplaySummary::default());
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_discard_during_replay_stops_it() {
        struct Discarding<'a> {
            queue: &'a OperationQueue,
        }

        #[async_trait]
        impl OperationReplayer for Discarding<'_> {
            async fn replay(&self, _operation: &FsOperation) -> Result<()> {
                self.queue.remove("c1");
                Ok(())
            }
        }

        let queue = OperationQueue::default();
        queue.enqueue("c1", write("/a"));
        queue.enqueue("c1", write("/b"));
        let summary = queue
            .replay("c1", &Discarding { queue: &queue })
            .await
            .unwrap();
        assert_eq!(summary.replayed, 1);
        assert!(!queue.has_pending("c1"));
    }

    #[test]
    fn test_remove_discards_queue() {
        let queue = OperationQueue::default();
        queue.enqueue("c1", write("/a"));
        queue.enqueue("c2", write("/b"));
        assert_eq!(queue.remove("c1").len(), 1);
        assert_eq!(queue.total_pending(), 1);
    }
}
