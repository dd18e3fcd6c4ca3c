//! Non-blocking TCP channels
//!
//! A [`Channel`] pairs an [`InputStream`] and an [`OutputStream`] on a
//! single selection key, owned by exactly one CPU for its whole lifetime.
//! Channels are constructed on their owning CPU (via `Pack::register`),
//! so selector registration and all stream state stay single-owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::cpu::{self, Cpu};
use crate::error::Failure;
use crate::future::Future;

mod input;
mod output;
mod transfer;

pub use input::InputStream;
pub use output::OutputStream;

/// Deferred continuation invocation: stream triggers collect these under
/// their locks and run them after every lock is released.
pub(crate) type Thunk = Box<dyn FnOnce() + Send>;

/// Cached selector interest. The runtime is either waiting to read or
/// draining its transmit queue; interest flips only on transitions of
/// the queue between empty and non-empty.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wants {
    Read,
    Write,
}

pub(crate) struct ChannelCore {
    cpu: Cpu,
    token: Token,
    registry: Registry,
    socket: Mutex<TcpStream>,
    interest: Mutex<Wants>,
    closed: AtomicBool,
    pub(crate) rx: Mutex<input::RxState>,
    pub(crate) tx: Mutex<output::TxState>,
}

impl ChannelCore {
    pub(crate) fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn socket(&self) -> MutexGuard<'_, TcpStream> {
        self.socket.lock().unwrap()
    }

    pub(crate) fn set_interest(&self, socket: &mut TcpStream, want: Wants) {
        let mut current = self.interest.lock().unwrap();
        if *current == want {
            return;
        }
        let interest = match want {
            Wants::Read => Interest::READABLE,
            Wants::Write => Interest::WRITABLE,
        };
        match self.registry.reregister(socket, self.token, interest) {
            Ok(()) => *current = want,
            Err(e) => tracing::warn!("interest update failed on cpu {}: {e}", self.cpu.id()),
        }
    }

    /// Tears the channel down: fails the pending reader and every queued
    /// transmit future with a failure from `mk`, shuts the socket down
    /// and drops the selection key. Idempotent.
    pub(crate) fn close(&self, mk: impl Fn() -> Failure) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("closing channel on cpu {}", self.cpu.id());
        let reader = self.rx.lock().unwrap().take_reader();
        if let Some(reader) = reader {
            reader.fail(mk());
        }
        let tasks = self.tx.lock().unwrap().drain();
        for task in tasks {
            task.close(mk());
        }
        let mut socket = self.socket.lock().unwrap();
        let _ = socket.shutdown(std::net::Shutdown::Both);
        if let Err(e) = self.registry.deregister(&mut *socket) {
            tracing::debug!("deregister failed: {e}");
        }
        drop(socket);
        if let Some(local) = cpu::current() {
            local.channels.borrow_mut().remove(&self.token);
        }
    }
}

/// A connected socket bound to one CPU: one input stream, one output
/// stream, one selection key. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl Channel {
    /// Builds a channel around `socket` on the calling CPU, registering
    /// it with that CPU's selector. Must run on a loop thread.
    pub(crate) fn open(mut socket: TcpStream) -> crate::error::Result<Channel> {
        let local = cpu::current()
            .ok_or(Failure::Invariant("channel opened off a runtime thread"))?;
        let registry = local.registry.try_clone().map_err(Failure::Io)?;
        let token = local.next_token();
        local
            .registry
            .register(&mut socket, token, Interest::READABLE)
            .map_err(Failure::Io)?;
        let channel = Channel {
            core: Arc::new(ChannelCore {
                cpu: local.cpu.clone(),
                token,
                registry,
                socket: Mutex::new(socket),
                interest: Mutex::new(Wants::Read),
                closed: AtomicBool::new(false),
                rx: Mutex::new(input::RxState::new()),
                tx: Mutex::new(output::TxState::new()),
            }),
        };
        local.channels.borrow_mut().insert(token, channel.clone());
        Ok(channel)
    }

    pub fn cpu(&self) -> &Cpu {
        self.core.cpu()
    }

    pub fn input(&self) -> InputStream {
        InputStream::new(self.core.clone())
    }

    pub fn output(&self) -> OutputStream {
        OutputStream::new(self.core.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Runs `step` as this channel's connection loop: re-invoked every
    /// time its future resolves, ended by the first failure (EOF and
    /// closed-channel failures included), which closes the channel.
    pub fn serve<T, F>(&self, mut step: F)
    where
        T: Send + 'static,
        F: FnMut(&Channel) -> Future<T> + Send + 'static,
    {
        let channel = self.clone();
        let closer = self.clone();
        self.core.cpu().run_loop(
            move || step(&channel),
            move |failure| {
                tracing::debug!("connection loop ended: {failure}");
                closer.close();
            },
        );
    }

    /// Closes the channel, failing all pending work with
    /// [`Failure::ChannelClosed`]. Safe to call from any thread and more
    /// than once.
    pub fn close(&self) {
        let core = self.core.clone();
        self.core
            .cpu()
            .run_on(move || core.close(|| Failure::ChannelClosed));
    }

    pub(crate) fn close_with(&self, mk: impl Fn() -> Failure) {
        self.core.close(mk);
    }

    /// Readable readiness: drain the socket into the read buffer and
    /// satisfy the pending reader. Continuations run with no stream lock
    /// held.
    pub(crate) fn trigger_rx(&self) {
        if self.core.is_closed() {
            return;
        }
        let (thunks, close) = input::on_readable(&self.core);
        for thunk in thunks {
            thunk();
        }
        if close {
            self.core.close(|| Failure::ChannelClosed);
        }
    }

    /// Writable readiness: drive the transmit queue until it drains or
    /// would block, then complete popped tasks in order.
    pub(crate) fn trigger_tx(&self) {
        if self.core.is_closed() {
            return;
        }
        let finished = output::on_writable(&self.core);
        let mut fatal = false;
        for task in finished {
            fatal |= task.complete();
        }
        if fatal {
            self.core.close(|| Failure::ChannelClosed);
        }
    }
}
