//! Per-socket transmit path
//!
//! All writes go through a FIFO queue of transfer tasks; at most one task
//! is active and everything flushes in enqueue order. Plain `write_*`
//! calls only enqueue — bytes hit the wire when a flush (or an earlier
//! queued task) drives them. A flush on an empty queue takes the
//! synchronous fast path and never touches selector interest.

use std::collections::VecDeque;
use std::fs::File;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::cpu::Cpu;
use crate::error::Failure;
use crate::future::Future;

use super::transfer::{Progress, TransferTask};
use super::{ChannelCore, Wants};

pub(crate) struct TxState {
    queue: VecDeque<TransferTask>,
}

impl TxState {
    pub(crate) fn new() -> TxState {
        TxState {
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<TransferTask> {
        self.queue.drain(..).collect()
    }
}

/// Write half of a [`Channel`](super::Channel).
#[derive(Clone)]
pub struct OutputStream {
    core: Arc<ChannelCore>,
}

impl OutputStream {
    pub(crate) fn new(core: Arc<ChannelCore>) -> OutputStream {
        OutputStream { core }
    }

    pub fn cpu(&self) -> &Cpu {
        self.core.cpu()
    }

    pub fn write_i16(&self, v: i16) -> &Self {
        let mut buf = Buffer::with_capacity(2);
        buf.write_i16(v);
        self.enqueue(buf);
        self
    }

    pub fn write_i32(&self, v: i32) -> &Self {
        let mut buf = Buffer::with_capacity(4);
        buf.write_i32(v);
        self.enqueue(buf);
        self
    }

    pub fn write_i64(&self, v: i64) -> &Self {
        let mut buf = Buffer::with_capacity(8);
        buf.write_i64(v);
        self.enqueue(buf);
        self
    }

    pub fn write_f32(&self, v: f32) -> &Self {
        let mut buf = Buffer::with_capacity(4);
        buf.write_f32(v);
        self.enqueue(buf);
        self
    }

    pub fn write_f64(&self, v: f64) -> &Self {
        let mut buf = Buffer::with_capacity(8);
        buf.write_f64(v);
        self.enqueue(buf);
        self
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> &Self {
        self.enqueue(Buffer::from(bytes));
        self
    }

    pub fn write_buffer(&self, buf: Buffer) -> &Self {
        self.enqueue(buf);
        self
    }

    /// Completes when every previously enqueued write has hit the wire.
    pub fn flush(&self) -> Future<()> {
        self.write_and_flush(Buffer::new()).map(|_| ())
    }

    /// Enqueues `buf` and drives the queue. The future resolves with the
    /// number of bytes drained from the buffer.
    pub fn write_and_flush(&self, buf: Buffer) -> Future<u64> {
        let fut = Future::pending(self.core.cpu());
        self.dispatch(TransferTask::bytes(buf, Some(fut.clone())));
        fut
    }

    /// Enqueues a file-to-socket transfer of `length` bytes starting at
    /// `offset`, using sendfile(2) where available. The future resolves
    /// with the bytes actually transferred.
    pub fn transfer_from(&self, file: File, offset: u64, length: u64) -> Future<u64> {
        let fut = Future::pending(self.core.cpu());
        self.dispatch(TransferTask::file(file, offset, length, fut.clone()));
        fut
    }

    fn enqueue(&self, buf: Buffer) {
        if self.core.is_closed() {
            return;
        }
        self.core
            .tx
            .lock()
            .unwrap()
            .queue
            .push_back(TransferTask::bytes(buf, None));
    }

    /// Queue discipline for tasks carrying a future: compute immediately
    /// when the queue is empty (fast path, no interest toggle on
    /// synchronous completion), otherwise enqueue behind earlier tasks
    /// and arm write interest.
    fn dispatch(&self, mut task: TransferTask) {
        if self.core.is_closed() {
            task.close(Failure::ChannelClosed);
            return;
        }
        let finished = {
            let mut state = self.core.tx.lock().unwrap();
            let mut socket = self.core.socket();
            if state.queue.is_empty() {
                match task.compute(&mut socket) {
                    Progress::Done => Some(task),
                    Progress::Blocked => {
                        self.core.set_interest(&mut socket, Wants::Write);
                        state.queue.push_back(task);
                        None
                    }
                }
            } else {
                self.core.set_interest(&mut socket, Wants::Write);
                state.queue.push_back(task);
                None
            }
        };
        if let Some(task) = finished {
            if task.complete() {
                self.core.close(|| Failure::ChannelClosed);
            }
        }
    }
}

/// Drives the head of the queue while it finishes, popping completed
/// tasks; a partial write leaves the head in place with write interest
/// armed. An emptied queue flips interest back to read only.
pub(crate) fn on_writable(core: &ChannelCore) -> Vec<TransferTask> {
    let mut finished = Vec::new();
    let mut state = core.tx.lock().unwrap();
    let mut socket = core.socket();
    loop {
        let done = match state.queue.front_mut() {
            None => break,
            Some(task) => matches!(task.compute(&mut socket), Progress::Done),
        };
        if !done {
            break;
        }
        if let Some(task) = state.queue.pop_front() {
            finished.push(task);
        }
    }
    if state.queue.is_empty() {
        core.set_interest(&mut socket, Wants::Read);
    }
    finished
}
