//! Deduplication of in-flight background tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Key identifying one background operation: the operation name plus a
/// stable rendering of its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub operation: &'static str,
    pub args: String,
}

impl TaskKey {
    #[must_use]
    pub fn new(operation: &'static str, args: impl Into<String>) -> Self {
        Self {
            operation,
            args: args.into(),
        }
    }
}

/// Tracks background tasks and guarantees at most one per key is in flight.
///
/// Scheduling a key that is already running joins the existing task instead
/// of spawning a duplicate.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    inner: Arc<Mutex<HashMap<TaskKey, watch::Receiver<bool>>>>,
}

impl TaskTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` unless one with the same key is in flight.
    ///
    /// Returns a completion handle plus whether a new task was started
    /// (`false` means the caller joined an existing one).
    pub fn spawn<F>(&self, key: TaskKey, task: F) -> (CompletionHandle, bool)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut map = self.inner.lock().expect("task tracker mutex poisoned");
        if let Some(receiver) = map.get(&key) {
            return (
                CompletionHandle {
                    receiver: receiver.clone(),
                },
                false,
            );
        }

        let (sender, receiver) = watch::channel(false);
        map.insert(key.clone(), receiver.clone());
        drop(map);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            task.await;
            // Remove the key before signalling so a waiter can immediately
            // schedule a fresh task for it.
            inner
                .lock()
                .expect("task tracker mutex poisoned")
                .remove(&key);
            let _ = sender.send(true);
        });

        (CompletionHandle { receiver }, true)
    }

    /// Number of tasks currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().expect("task tracker mutex poisoned").len()
    }
}

/// Resolves when the tracked task completes.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    receiver: watch::Receiver<bool>,
}

impl CompletionHandle {
    /// Wait for the tracked task to finish.
    pub async fn wait(mut self) {
        if *self.receiver.borrow() {
            return;
        }
        // An Err means the sender is gone, which also implies completion.
        let _ = self.receiver.changed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test(flavor = "multi_thread")]
    async fn same_key_joins_instead_of_duplicating() {
        let tracker = TaskTracker::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let key = TaskKey::new("reconcile", "app/board/b1");
        let first_runs = Arc::clone(&runs);
        let (first, started_first) = tracker.spawn(key.clone(), async move {
            sleep(Duration::from_millis(50)).await;
            first_runs.fetch_add(1, Ordering::SeqCst);
        });
        let second_runs = Arc::clone(&runs);
        let (second, started_second) = tracker.spawn(key, async move {
            second_runs.fetch_add(1, Ordering::SeqCst);
        });

        assert!(started_first);
        assert!(!started_second);

        first.wait().await;
        second.wait().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn different_keys_run_independently() {
        let tracker = TaskTracker::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for args in ["a", "b"] {
            let task_runs = Arc::clone(&runs);
            let (handle, started) = tracker.spawn(TaskKey::new("reconcile", args), async move {
                task_runs.fetch_add(1, Ordering::SeqCst);
            });
            assert!(started);
            handle.wait().await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn key_is_reusable_after_completion() {
        let tracker = TaskTracker::new();
        let key = TaskKey::new("reconcile", "same");

        let (first, _) = tracker.spawn(key.clone(), async {});
        first.wait().await;

        let (second, started) = tracker.spawn(key, async {});
        assert!(started);
        second.wait().await;
    }
}
