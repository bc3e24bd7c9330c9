//! Delayed task execution for the home-screen debounce.
//!
//! Tasks are fire-and-forget. Cancellation is not tracked here: callers
//! capture a generation number and re-check it when the task runs, so a
//! superseded task simply does nothing.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: ScheduledTask);
}

/// Runs each task on a short-lived named thread after sleeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        let spawned = thread::Builder::new()
            .name("applock-delayed".to_string())
            .spawn(move || {
                thread::sleep(delay);
                task();
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "Failed to spawn delayed task; dropping it");
        }
    }
}

struct PendingTask {
    due: Duration,
    seq: u64,
    task: ScheduledTask,
}

#[derive(Default)]
struct ManualQueue {
    elapsed: Duration,
    next_seq: u64,
    pending: Vec<PendingTask>,
}

/// Virtual-time scheduler. Tasks run only when [`ManualScheduler::advance`]
/// moves time past their due point.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<ManualQueue>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    /// Moves virtual time forward and runs every task that became due, in
    /// due order. Returns how many tasks ran.
    pub fn advance(&self, by: Duration) -> usize {
        {
            let mut queue = self.lock();
            queue.elapsed += by;
        }

        let mut ran = 0;
        // Tasks run outside the lock so they may schedule follow-ups.
        while let Some(task) = self.pop_due() {
            task();
            ran += 1;
        }
        ran
    }

    fn pop_due(&self) -> Option<ScheduledTask> {
        let mut queue = self.lock();
        let elapsed = queue.elapsed;
        let index = queue
            .pending
            .iter()
            .enumerate()
            .filter(|(_, pending)| pending.due <= elapsed)
            .min_by_key(|(_, pending)| (pending.due, pending.seq))
            .map(|(index, _)| index)?;
        Some(queue.pending.swap_remove(index).task)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualQueue> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        let mut queue = self.lock();
        let due = queue.elapsed + delay;
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.pending.push(PendingTask { due, seq, task });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn manual_scheduler_runs_tasks_only_once_due() {
        let scheduler = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        scheduler.schedule(
            Duration::from_millis(3000),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(scheduler.advance(Duration::from_millis(2999)), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_count(), 1);

        assert_eq!(scheduler.advance(Duration::from_millis(1)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn manual_scheduler_runs_in_due_order() {
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("late", 200u64), ("early", 100u64)] {
            let order = Arc::clone(&order);
            scheduler.schedule(
                Duration::from_millis(delay),
                Box::new(move || order.lock().unwrap().push(label)),
            );
        }

        scheduler.advance(Duration::from_millis(500));
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
    }

    #[test]
    fn thread_scheduler_eventually_runs_task() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        ThreadScheduler.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }
}
