//! Thread-safe FIFO of byte-range tasks.
//!
//! Workers block in `pop` on a condition variable; `close` broadcasts so
//! every idle worker wakes, drains what is left, and exits. The idle count
//! feeds end-game detection; `drain_remaining` feeds pause persistence.

use std::sync::{Condvar, Mutex};

use crate::task::Task;

#[derive(Debug, Default)]
struct Inner {
    items: Vec<Task>,
    head: usize,
    idle: usize,
    /// Tasks handed out by `pop` and not yet returned via `task_done`.
    outstanding: usize,
    done: bool,
}

impl Inner {
    fn len(&self) -> usize {
        self.items.len() - self.head
    }

    /// Reclaim the consumed prefix once more than half the backing storage
    /// is stale.
    fn maybe_compact(&mut self) {
        if self.head > self.items.len() / 2 {
            self.items.drain(..self.head);
            self.head = 0;
        }
    }

    fn pop_front(&mut self) -> Option<Task> {
        if self.head >= self.items.len() {
            return None;
        }
        let task = self.items[self.head];
        self.head += 1;
        self.maybe_compact();
        Some(task)
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one task and wake one waiter.
    pub fn push(&self, task: Task) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.push(task);
        drop(inner);
        self.cond.notify_one();
    }

    /// Append a burst of tasks and wake every waiter.
    pub fn push_multiple(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.extend(tasks);
        drop(inner);
        self.cond.notify_all();
    }

    /// Block until a task is available or the queue is closed.
    ///
    /// After close, remaining entries still drain in FIFO order; `None` is
    /// returned only once the queue is both closed and empty. The caller is
    /// counted idle for the duration of the wait.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        inner.idle += 1;
        loop {
            if let Some(task) = inner.pop_front() {
                inner.idle -= 1;
                // Checked out under the same lock, so "in queue or
                // outstanding" holds at every instant.
                inner.outstanding += 1;
                return Some(task);
            }
            if inner.done {
                inner.idle -= 1;
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Return a popped task: it finished, was re-pushed, or was dropped.
    pub fn task_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.outstanding = inner.outstanding.saturating_sub(1);
    }

    /// Tasks currently checked out by workers.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().outstanding
    }

    /// No tasks queued and none checked out: the byte space is covered.
    pub fn is_drained(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.len() == 0 && inner.outstanding == 0
    }

    /// Mark the queue done and wake all waiters.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.done = true;
        drop(inner);
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of workers currently blocked inside `pop`.
    pub fn idle_workers(&self) -> usize {
        self.inner.lock().unwrap().idle
    }

    /// Atomically remove and return all pending tasks (pause persistence).
    pub fn drain_remaining(&self) -> Vec<Task> {
        let mut inner = self.inner.lock().unwrap();
        let head = inner.head;
        inner.head = 0;
        inner.items.drain(..head).for_each(drop);
        std::mem::take(&mut inner.items)
    }
}
