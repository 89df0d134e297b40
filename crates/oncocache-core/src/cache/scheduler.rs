//! Named, delayed, cancellable background tasks.
//!
//! Scheduling a name that already has a pending task aborts the earlier one,
//! so a newer search or revalidation always supersedes an older one instead
//! of racing it. Dropping the scheduler cancels everything still pending.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

struct Slot {
    id: u64,
    handle: JoinHandle<()>,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

#[derive(Default)]
pub struct TaskScheduler {
    slots: Slots,
    next_id: AtomicU64,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay` under `name`, superseding any pending task of that name.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, name: impl Into<String>, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slots = Arc::clone(&self.slots);
        let task_name = name.clone();

        // Hold the lock across spawn so a zero-delay task cannot finish and
        // try to deregister before it is registered.
        let Ok(mut guard) = self.slots.lock() else {
            return;
        };

        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
            if let Ok(mut slots) = slots.lock() {
                if slots.get(&task_name).is_some_and(|slot| slot.id == id) {
                    slots.remove(&task_name);
                }
            }
        });

        if let Some(previous) = guard.insert(name.clone(), Slot { id, handle }) {
            debug!(task = %name, "Superseding pending task");
            previous.handle.abort();
        }
    }

    /// Abort the pending task registered under `name`.
    pub fn cancel(&self, name: &str) -> bool {
        let slot = match self.slots.lock() {
            Ok(mut slots) => slots.remove(name),
            Err(_) => None,
        };
        match slot {
            Some(slot) => {
                slot.handle.abort();
                debug!(task = %name, "Cancelled task");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.slots
            .lock()
            .map(|slots| slots.get(name).is_some_and(|slot| !slot.handle.is_finished()))
            .unwrap_or(false)
    }

    pub fn pending(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.values().filter(|s| !s.handle.is_finished()).count())
            .unwrap_or(0)
    }

    pub fn cancel_all(&self) {
        if let Ok(mut slots) = self.slots.lock() {
            for (_, slot) in slots.drain() {
                slot.handle.abort();
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>, amount: usize) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(amount, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_after_delay() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule("search", Duration::from_millis(300), counter_task(&counter, 1));
        assert!(scheduler.is_pending("search"));

        tokio::time::sleep(Duration::from_millis(299)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending("search"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_task_supersedes_older() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule("search", Duration::from_millis(300), counter_task(&counter, 1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.schedule("search", Duration::from_millis(300), counter_task(&counter, 10));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_independent_names() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule("a", Duration::from_millis(50), counter_task(&counter, 1));
        scheduler.schedule("b", Duration::from_millis(50), counter_task(&counter, 100));
        assert_eq!(scheduler.pending(), 2);
        assert!(scheduler.cancel("a"));
        assert!(!scheduler.cancel("a"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = TaskScheduler::new();
            scheduler.schedule("a", Duration::from_millis(50), counter_task(&counter, 1));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
