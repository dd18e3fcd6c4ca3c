//! Per-socket receive path
//!
//! Bytes accumulate in a growable read buffer carried across readiness
//! events; a pending reader (exact length or framing consumer) is
//! re-evaluated after every successful read and satisfied at most once.
//! One pending reader is permitted at a time.

use std::io::Read;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::config;
use crate::cpu::{Cpu, Status};
use crate::error::Failure;
use crate::future::Future;

use super::{ChannelCore, Thunk};

pub(crate) struct RxState {
    buf: Buffer,
    reader: Option<PendingReader>,
}

impl RxState {
    pub(crate) fn new() -> RxState {
        RxState {
            buf: Buffer::new(),
            reader: None,
        }
    }

    pub(crate) fn take_reader(&mut self) -> Option<PendingReader> {
        self.reader.take()
    }
}

/// One in-flight read request. `satisfy` inspects the buffer and, when
/// the request can complete, consumes its bytes and returns the deferred
/// resolution; `fail` delivers EOF/close/shutdown to the request's
/// future.
pub(crate) struct PendingReader {
    satisfy: Box<dyn FnMut(&mut Buffer) -> Option<Thunk> + Send>,
    on_fail: Box<dyn FnOnce(Failure) + Send>,
}

impl PendingReader {
    pub(crate) fn fail(self, failure: Failure) {
        (self.on_fail)(failure);
    }
}

/// Read half of a [`Channel`](super::Channel).
#[derive(Clone)]
pub struct InputStream {
    core: Arc<ChannelCore>,
}

impl InputStream {
    pub(crate) fn new(core: Arc<ChannelCore>) -> InputStream {
        InputStream { core }
    }

    pub fn cpu(&self) -> &Cpu {
        self.core.cpu()
    }

    /// Requests exactly `n` bytes. The future resolves with a buffer
    /// holding them once enough bytes have arrived; bytes beyond `n` stay
    /// in the stream for the next reader.
    pub fn read(&self, n: usize) -> Future<Buffer> {
        let fut = Future::pending(self.core.cpu());
        if self.core.is_closed() {
            fut.abandon(Failure::ChannelClosed);
            return fut;
        }
        let done = fut.clone();
        let failed = fut.clone();
        self.install(PendingReader {
            satisfy: Box::new(move |buf| {
                if buf.readable_bytes() < n {
                    return None;
                }
                let frame = buf.read_bytes(n);
                let done = done.clone();
                Some(Box::new(move || done.resolve(frame)) as Thunk)
            }),
            on_fail: Box::new(move |failure| failed.abandon(failure)),
        });
        fut
    }

    /// Requests bytes through a framing consumer.
    ///
    /// The consumer inspects the buffer and returns [`Status::Continue`]
    /// when it needs more bytes — having reset the read cursor to where it
    /// started — or [`Status::StopWith`] once it has advanced the cursor
    /// past everything it retains. A plain [`Status::Stop`] is an
    /// invariant failure.
    pub fn read_with<R, F>(&self, consumer: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnMut(&mut Buffer) -> Status<R> + Send + 'static,
    {
        let fut = Future::pending(self.core.cpu());
        if self.core.is_closed() {
            fut.abandon(Failure::ChannelClosed);
            return fut;
        }
        let done = fut.clone();
        let failed = fut.clone();
        let mut consumer = consumer;
        self.install(PendingReader {
            satisfy: Box::new(move |buf| match consumer(buf) {
                Status::Continue => None,
                Status::StopWith(value) => {
                    buf.discard_read_bytes();
                    let done = done.clone();
                    Some(Box::new(move || done.resolve(value)) as Thunk)
                }
                Status::Stop => {
                    let done = done.clone();
                    Some(Box::new(move || {
                        done.abandon(Failure::Invariant("consumer stopped without a value"))
                    }) as Thunk)
                }
            }),
            on_fail: Box::new(move |failure| failed.abandon(failure)),
        });
        fut
    }

    pub fn read_i16(&self) -> Future<i16> {
        self.read(2).map(|mut buf| buf.read_i16())
    }

    pub fn read_i32(&self) -> Future<i32> {
        self.read(4).map(|mut buf| buf.read_i32())
    }

    pub fn read_i64(&self) -> Future<i64> {
        self.read(8).map(|mut buf| buf.read_i64())
    }

    pub fn read_f32(&self) -> Future<f32> {
        self.read(4).map(|mut buf| buf.read_f32())
    }

    pub fn read_f64(&self) -> Future<f64> {
        self.read(8).map(|mut buf| buf.read_f64())
    }

    /// Installs the pending reader and immediately re-evaluates it
    /// against already-buffered bytes. A second concurrent reader fails
    /// with a typed invariant error.
    fn install(&self, reader: PendingReader) {
        let thunk = {
            let mut state = self.core.rx.lock().unwrap();
            if state.reader.is_some() {
                drop(state);
                reader.fail(Failure::Invariant("pending reader already installed"));
                return;
            }
            state.reader = Some(reader);
            try_satisfy(&mut state)
        };
        if let Some(thunk) = thunk {
            thunk();
        }
    }
}

fn try_satisfy(state: &mut RxState) -> Option<Thunk> {
    let mut reader = state.reader.take()?;
    match (reader.satisfy)(&mut state.buf) {
        Some(thunk) => Some(thunk),
        None => {
            state.reader = Some(reader);
            None
        }
    }
}

/// Drains the socket until it would block, feeding the pending reader.
/// Returns the continuations to run lock-free plus whether the channel
/// must close (EOF or a fatal read error).
pub(crate) fn on_readable(core: &ChannelCore) -> (Vec<Thunk>, bool) {
    let mut thunks: Vec<Thunk> = Vec::new();
    let mut close = false;
    {
        let mut state = core.rx.lock().unwrap();
        let mut socket = core.socket();
        let mut chunk = [0u8; config::READ_CHUNK_SIZE];
        loop {
            match socket.read(&mut chunk) {
                Ok(0) => {
                    close = true;
                    if let Some(reader) = state.reader.take() {
                        thunks.push(Box::new(move || reader.fail(Failure::EndOfStream)));
                    }
                    break;
                }
                Ok(n) => {
                    state.buf.write_bytes(&chunk[..n]);
                    if let Some(thunk) = try_satisfy(&mut state) {
                        thunks.push(thunk);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    close = true;
                    match state.reader.take() {
                        Some(reader) => {
                            thunks.push(Box::new(move || reader.fail(Failure::Io(e))))
                        }
                        None => tracing::warn!("read failed with no pending reader: {e}"),
                    }
                    break;
                }
            }
        }
    }
    (thunks, close)
}
