//! Holding area for rate-limited tasks.
//!
//! A min-heap keyed on the instant a task may run again. One timer thread
//! moves ready tasks back onto the runner's FIFO, so deferred work never
//! occupies a queue slot or a worker while it waits.

use super::{Job, Task};
use crate::queue::TaskQueue;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

struct Deferred {
    ready_at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    // Reversed so the BinaryHeap pops the earliest instant first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct HeapState {
    heap: BinaryHeap<Deferred>,
    next_seq: u64,
    shutdown: bool,
}

pub(crate) struct DeferredTasks {
    state: Mutex<HeapState>,
    changed: Condvar,
}

impl DeferredTasks {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(HeapState::default()),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn defer(&self, task: Task, ready_at: Instant) {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        debug!(
            "[TaskRunner] Deferring '{}' for {:?}",
            task.name,
            ready_at.saturating_duration_since(Instant::now())
        );
        state.heap.push(Deferred {
            ready_at,
            seq,
            task,
        });
        self.changed.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().heap.len()
    }

    /// Removes every waiting task, in ready order.
    pub(crate) fn drain(&self) -> Vec<Task> {
        let mut state = self.lock();
        let mut tasks = Vec::with_capacity(state.heap.len());
        while let Some(d) = state.heap.pop() {
            tasks.push(d.task);
        }
        tasks
    }

    pub(crate) fn spawn_timer(
        self: &Arc<Self>,
        queue: Arc<TaskQueue<Job>>,
    ) -> std::io::Result<JoinHandle<()>> {
        self.lock().shutdown = false;
        let this = self.clone();
        thread::Builder::new()
            .name("task-runner-timer".to_string())
            .spawn(move || this.timer_loop(&queue))
    }

    pub(crate) fn shutdown(&self) {
        self.lock().shutdown = true;
        self.changed.notify_all();
    }

    fn timer_loop(&self, queue: &TaskQueue<Job>) {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            while state.heap.peek().map_or(false, |d| d.ready_at <= now) {
                if let Some(d) = state.heap.pop() {
                    queue.push(Job::Run(d.task));
                }
            }
            let wait = state
                .heap
                .peek()
                .map(|d| d.ready_at.saturating_duration_since(now))
                .unwrap_or(Duration::from_secs(3600));
            state = self
                .changed
                .wait_timeout(state, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}
