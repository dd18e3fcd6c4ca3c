use std::cmp::Ordering;
use std::time::Instant;

use crate::cpu::Task;

/// One armed timer: a deadline plus the task to enqueue when it is due.
/// Ordered inverted on (deadline, seq) so that `BinaryHeap::peek` yields
/// the earliest entry; `seq` keeps same-deadline entries FIFO.
pub(crate) struct Entry {
    pub(crate) deadline: Instant,
    pub(crate) seq: u64,
    pub(crate) task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}
