//! In-memory FIFO of pending task identifiers.
//!
//! The queue carries ids only, never entities; workers hydrate tasks through
//! the repository under a fresh unit of work. That keeps the in-memory
//! footprint bounded and the queue orthogonal to storage.

use crate::ids::TaskId;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<VecDeque<TaskId>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, id: TaskId) {
        self.lock().push_back(id);
    }

    pub fn enqueue_all(&self, ids: impl IntoIterator<Item = TaskId>) {
        let mut queue = self.lock();
        queue.extend(ids);
    }

    /// Non-blocking pop; `None` means the queue is currently empty.
    pub fn dequeue(&self) -> Option<TaskId> {
        self.lock().pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.lock().len()
    }

    pub fn drain(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TaskId>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequeue_is_fifo() {
        let queue = TaskQueue::new();
        let a = TaskId::generate();
        let b = TaskId::generate();
        let c = TaskId::generate();
        queue.enqueue_all([a.clone(), b.clone()]);
        queue.enqueue(c.clone());
        assert_eq!(queue.remaining(), 3);
        assert_eq!(queue.dequeue(), Some(a));
        assert_eq!(queue.dequeue(), Some(b));
        assert_eq!(queue.dequeue(), Some(c));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn requeued_ids_go_to_the_back() {
        let queue = TaskQueue::new();
        let a = TaskId::generate();
        let b = TaskId::generate();
        queue.enqueue_all([a.clone(), b.clone()]);
        let retried = queue.dequeue().unwrap();
        queue.enqueue(retried.clone());
        assert_eq!(queue.dequeue(), Some(b));
        assert_eq!(queue.dequeue(), Some(retried));
    }

    #[test]
    fn drain_empties_the_queue() {
        let queue = TaskQueue::new();
        queue.enqueue_all([TaskId::generate(), TaskId::generate()]);
        queue.drain();
        assert_eq!(queue.remaining(), 0);
        assert_eq!(queue.dequeue(), None);
    }
}
