use crate::control::Control;
use crate::error::UploadError;
use crate::model::{DataChunk, MetaChunk};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

pub const DEFAULT_DATA_CAPACITY: usize = 20;
pub const DEFAULT_META_CAPACITY: usize = 25;

/// Items ordered by ascending sort key; equal keys keep insertion order.
pub trait QueueItem: Send {
    fn sort_key(&self) -> u32;
}

impl QueueItem for DataChunk {
    fn sort_key(&self) -> u32 {
        self.servers_tried
    }
}

impl QueueItem for MetaChunk {
    fn sort_key(&self) -> u32 {
        self.record.servers_tried
    }
}

struct Slot<T> {
    key: u32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl<T> Eq for Slot<T> {}

impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Slot<T> {
    // BinaryHeap is a max-heap: invert so the smallest (key, seq) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    heap: BinaryHeap<Slot<T>>,
    next_seq: u64,
}

/// Bounded blocking priority queue between producers and uploaders.
/// A full queue blocks `push`; this is the only thing bounding memory.
pub struct ChunkQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T: QueueItem> ChunkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State { heap: BinaryHeap::new(), next_seq: 0 }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue, blocking while full. Re-checks the halt flags every poll interval.
    pub fn push(&self, item: T, control: &Control) -> Result<(), UploadError> {
        let mut st = self.state.lock();
        while st.heap.len() >= self.capacity {
            if control.should_halt() {
                return Err(UploadError::Halted);
            }
            self.not_full.wait_for(&mut st, control.poll());
        }
        let seq = st.next_seq;
        st.next_seq += 1;
        st.heap.push(Slot { key: item.sort_key(), seq, item });
        drop(st);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue, waiting at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut st = self.state.lock();
        if st.heap.is_empty() {
            self.not_empty.wait_for(&mut st, timeout);
        }
        let item = st.heap.pop().map(|s| s.item);
        drop(st);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    pub fn try_pop(&self) -> Option<T> {
        self.pop_timeout(Duration::ZERO)
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-slot holder for the data-set manifest record. The metadata uploaders
/// only look here once the ordinary queue is drained and every data uploader is done.
#[derive(Default)]
pub struct ManifestSlot {
    slot: Mutex<Option<MetaChunk>>,
}

impl ManifestSlot {
    pub fn put(&self, chunk: MetaChunk) {
        *self.slot.lock() = Some(chunk);
    }

    pub fn take(&self) -> Option<MetaChunk> {
        self.slot.lock().take()
    }
}
