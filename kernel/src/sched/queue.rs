//! The run queue.
//!
//! One FIFO shared by every hart, holding process-table indices. Capacity
//! is `NPROC`: every process can be runnable at once, so enqueue can never
//! legitimately fail.

use crate::process::NPROC;
use crate::sync::SpinLock;

pub struct RunQueue {
    slots: [usize; NPROC],
    head: usize,
    tail: usize,
    count: usize,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            slots: [0; NPROC],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn push(&mut self, index: usize) {
        assert!(self.count < NPROC, "run queue overflow");
        self.slots[self.tail] = index;
        self.tail = (self.tail + 1) % NPROC;
        self.count += 1;
    }

    pub fn pop(&mut self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let index = self.slots[self.head];
        self.head = (self.head + 1) % NPROC;
        self.count -= 1;
        Some(index)
    }
}

static RUN_QUEUE: SpinLock<RunQueue> = SpinLock::new("runqueue", RunQueue::new());

/// Append a runnable process. The caller has already set its state.
pub fn add_task(index: usize) {
    RUN_QUEUE.lock().push(index);
}

/// Take the oldest runnable process, if any.
pub fn pop_task() -> Option<usize> {
    RUN_QUEUE.lock().pop()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = RunQueue::new();
        assert!(q.is_empty());
        q.push(3);
        q.push(1);
        q.push(4);
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(4));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn wraps_around() {
        let mut q = RunQueue::new();
        for round in 0..3 {
            for i in 0..NPROC {
                q.push(i + round);
            }
            for i in 0..NPROC {
                assert_eq!(q.pop(), Some(i + round));
            }
        }
    }
}
