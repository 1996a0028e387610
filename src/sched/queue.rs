//! Fiber table and intrusive scheduler queues.
//!
//! Every fiber record lives in one arena and is linked on at most one of
//! four doubly-linked queues through its own `next`/`prev` fields. All
//! queue operations are O(1) and never allocate; only [`allocate`]
//! may grow the arena when the pool is empty.
//!
//! [`allocate`]: FiberTable::allocate

extern crate alloc;

use crate::arch::RegisterContext;
use crate::fiber::{Fiber, FiberId};
use alloc::boxed::Box;
use alloc::vec::Vec;

/// The queues a fiber can be linked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// Runnable fibers, including the one currently running
    Run,
    /// Fibers waiting for their wake tick
    Sleep,
    /// Fibers waiting for an event
    Wait,
    /// Released records kept for reuse
    Pool,
}

impl QueueId {
    pub const ALL: [QueueId; 4] = [QueueId::Run, QueueId::Sleep, QueueId::Wait, QueueId::Pool];

    const fn index(self) -> usize {
        match self {
            QueueId::Run => 0,
            QueueId::Sleep => 1,
            QueueId::Wait => 2,
            QueueId::Pool => 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QueueHead {
    head: Option<FiberId>,
    len: usize,
}

impl QueueHead {
    const EMPTY: Self = Self { head: None, len: 0 };
}

/// Arena of fiber records plus the heads of the scheduler queues.
pub struct FiberTable<C> {
    /// Boxed so records keep their address while the arena grows
    fibers: Vec<Box<Fiber<C>>>,
    queues: [QueueHead; 4],
}

impl<C: RegisterContext> FiberTable<C> {
    pub const fn new() -> Self {
        Self {
            fibers: Vec::new(),
            queues: [QueueHead::EMPTY; 4],
        }
    }

    /// Number of records ever allocated.
    pub fn records(&self) -> usize {
        self.fibers.len()
    }

    pub fn get(&self, id: FiberId) -> Option<&Fiber<C>> {
        self.fibers.get(id.index()).map(|fiber| &**fiber)
    }

    /// Record of a live id. Ids are only handed out by this table, so an
    /// unknown id is a logic error.
    pub(crate) fn fiber(&self, id: FiberId) -> &Fiber<C> {
        &self.fibers[id.index()]
    }

    pub(crate) fn fiber_mut(&mut self, id: FiberId) -> &mut Fiber<C> {
        &mut self.fibers[id.index()]
    }

    /// Raw pointer to a record, stable for the lifetime of the table.
    pub(crate) fn fiber_ptr(&mut self, id: FiberId) -> *mut Fiber<C> {
        &mut *self.fibers[id.index()]
    }

    pub fn head(&self, queue: QueueId) -> Option<FiberId> {
        self.queues[queue.index()].head
    }

    pub fn len(&self, queue: QueueId) -> usize {
        self.queues[queue.index()].len
    }

    pub fn is_empty(&self, queue: QueueId) -> bool {
        self.len(queue) == 0
    }

    /// Iterate over the fibers on `queue`, head first.
    pub fn iter(&self, queue: QueueId) -> QueueIter<'_, C> {
        QueueIter {
            table: self,
            cursor: self.head(queue),
        }
    }

    /// Link `id` at the head of `queue`, unlinking it from any queue it is
    /// currently on.
    pub fn queue_fiber(&mut self, id: FiberId, queue: QueueId) {
        self.dequeue_fiber(id);

        let old_head = self.queues[queue.index()].head;
        if let Some(head) = old_head {
            self.fiber_mut(head).prev = Some(id);
        }

        let fiber = self.fiber_mut(id);
        fiber.queue = Some(queue);
        fiber.prev = None;
        fiber.next = old_head;

        let slot = &mut self.queues[queue.index()];
        slot.head = Some(id);
        slot.len += 1;
    }

    /// Unlink `id` from its queue. No-op for an unqueued fiber.
    pub fn dequeue_fiber(&mut self, id: FiberId) {
        let fiber = self.fiber_mut(id);
        let Some(queue) = fiber.queue.take() else {
            return;
        };
        let next = fiber.next.take();
        let prev = fiber.prev.take();

        match prev {
            Some(prev) => self.fiber_mut(prev).next = next,
            None => self.queues[queue.index()].head = next,
        }
        if let Some(next) = next {
            self.fiber_mut(next).prev = prev;
        }
        self.queues[queue.index()].len -= 1;
    }

    /// Take a record from the pool, or grow the arena when the pool is
    /// empty. The returned fiber is unqueued with its state reset; a
    /// recycled record keeps its stack buffer.
    pub fn allocate(&mut self) -> FiberId {
        if let Some(id) = self.head(QueueId::Pool) {
            self.dequeue_fiber(id);
            self.fiber_mut(id).reset();
            return id;
        }

        let id = FiberId::from_index(self.fibers.len());
        self.fibers.push(Box::new(Fiber::new()));
        id
    }

    /// Reset `id` and return it to the pool.
    pub fn recycle(&mut self, id: FiberId) {
        self.fiber_mut(id).reset();
        self.queue_fiber(id, QueueId::Pool);
    }

    /// The fiber after `id` on its queue, wrapping to the head.
    pub fn successor(&self, id: FiberId) -> Option<FiberId> {
        let fiber = self.fiber(id);
        let queue = fiber.queue?;
        fiber.next.or_else(|| self.head(queue))
    }

    /// Move every fiber on `from` that satisfies `pred` to `to`.
    ///
    /// Returns the number of fibers moved.
    pub fn migrate(
        &mut self,
        from: QueueId,
        to: QueueId,
        mut pred: impl FnMut(&Fiber<C>) -> bool,
    ) -> usize {
        let mut moved = 0;
        let mut cursor = self.head(from);
        while let Some(id) = cursor {
            let fiber = self.fiber(id);
            cursor = fiber.next;
            if pred(fiber) {
                self.queue_fiber(id, to);
                moved += 1;
            }
        }
        moved
    }

    /// Audit the linkage: every queue is a well-formed list of the declared
    /// length whose members name it as their queue, and every record that
    /// claims a queue is reachable from it.
    pub fn is_consistent(&self) -> bool {
        let mut linked = 0;
        for queue in QueueId::ALL {
            let mut prev = None;
            let mut count = 0;
            let mut cursor = self.head(queue);
            while let Some(id) = cursor {
                let Some(fiber) = self.get(id) else {
                    return false;
                };
                if fiber.queue != Some(queue) || fiber.prev != prev || count > self.fibers.len() {
                    return false;
                }
                count += 1;
                prev = Some(id);
                cursor = fiber.next;
            }
            if count != self.len(queue) {
                return false;
            }
            linked += count;
        }
        linked == self.fibers.iter().filter(|fiber| fiber.queue.is_some()).count()
    }
}

impl<C: RegisterContext> Default for FiberTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the ids linked on one queue.
pub struct QueueIter<'a, C> {
    table: &'a FiberTable<C>,
    cursor: Option<FiberId>,
}

impl<'a, C: RegisterContext> Iterator for QueueIter<'a, C> {
    type Item = FiberId;

    fn next(&mut self) -> Option<FiberId> {
        let id = self.cursor?;
        self.cursor = self.table.fiber(id).next;
        Some(id)
    }
}
