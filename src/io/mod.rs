//! Readiness selector owned by one CPU
//!
//! A thin wrapper over `mio::Poll` for single-threaded use by the event
//! loop. mio's epoll backend is edge-triggered; the stream triggers drain
//! reads and writes until `WouldBlock`, which restores the level-triggered
//! behavior the rest of the runtime assumes. Cross-CPU submitters end a
//! blocked poll early through the associated `mio::Waker`.

use std::io;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token};

use crate::config;

/// Token reserved for the cross-CPU submission waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// First token handed out to channels and listeners.
pub(crate) const FIRST_SOURCE_TOKEN: usize = 1;

pub(crate) struct Selector {
    poll: Poll,
    events: Events,
}

/// Snapshot of one ready selection key.
pub(crate) struct Readiness {
    pub(crate) token: Token,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        Ok(Selector {
            poll: Poll::new()?,
            events: Events::with_capacity(config::EVENTS_CAPACITY),
        })
    }

    /// A waker bound to this selector, for ending waits from other
    /// threads.
    pub(crate) fn waker(&self) -> io::Result<mio::Waker> {
        mio::Waker::new(self.poll.registry(), WAKER_TOKEN)
    }

    /// A registry handle usable off the polling path (channel interest
    /// updates keep their own clone).
    pub(crate) fn registry(&self) -> io::Result<Registry> {
        self.poll.registry().try_clone()
    }

    /// Waits for readiness up to `timeout` and snapshots the ready keys.
    ///
    /// Peer-close hints are folded into the readable/writable flags so the
    /// stream triggers observe them as ordinary readiness and run into the
    /// EOF / error on the socket itself.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(self
            .events
            .iter()
            .map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
            })
            .collect())
    }
}
