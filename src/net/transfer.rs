//! Queued transmit units
//!
//! A transfer task drives bytes from a buffer or a file into a socket in
//! non-blocking steps. `compute` reports `Done` both on success and on
//! I/O failure (the failure rides inside the task until `complete`), so
//! the queue pop discipline stays uniform; `Blocked` leaves the task at
//! the head for the next writable event.

use std::fs::File;
use std::io;

use mio::net::TcpStream;

use crate::buffer::Buffer;
use crate::error::Failure;
use crate::future::Future;

pub(crate) enum Progress {
    Done,
    Blocked,
}

pub(crate) enum TransferTask {
    Bytes {
        buf: Buffer,
        written: u64,
        done: Option<Future<u64>>,
        error: Option<Failure>,
    },
    File(FileTx),
}

pub(crate) struct FileTx {
    file: File,
    offset: u64,
    remaining: u64,
    transferred: u64,
    #[cfg(not(target_os = "linux"))]
    staged: Buffer,
    done: Future<u64>,
    error: Option<Failure>,
}

impl TransferTask {
    pub(crate) fn bytes(buf: Buffer, done: Option<Future<u64>>) -> TransferTask {
        TransferTask::Bytes {
            buf,
            written: 0,
            done,
            error: None,
        }
    }

    pub(crate) fn file(file: File, offset: u64, length: u64, done: Future<u64>) -> TransferTask {
        TransferTask::File(FileTx {
            file,
            offset,
            remaining: length,
            transferred: 0,
            #[cfg(not(target_os = "linux"))]
            staged: Buffer::new(),
            done,
            error: None,
        })
    }

    /// Pushes bytes into the socket until finished or it would block.
    pub(crate) fn compute(&mut self, socket: &mut TcpStream) -> Progress {
        match self {
            TransferTask::Bytes {
                buf,
                written,
                error,
                ..
            } => loop {
                if buf.is_empty() {
                    return Progress::Done;
                }
                match buf.write_to(socket) {
                    Ok(0) => {
                        *error = Some(Failure::Io(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "socket accepted no bytes",
                        )));
                        return Progress::Done;
                    }
                    Ok(n) => *written += n as u64,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Progress::Blocked,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        *error = Some(Failure::Io(e));
                        return Progress::Done;
                    }
                }
            },
            TransferTask::File(tx) => tx.compute(socket),
        }
    }

    /// Resolves or fails the task's future with its recorded outcome.
    /// Returns true when the task ended in an I/O failure, in which case
    /// the channel should come down.
    pub(crate) fn complete(self) -> bool {
        match self {
            TransferTask::Bytes {
                written,
                done,
                error,
                ..
            } => match (done, error) {
                (Some(fut), Some(failure)) => {
                    fut.abandon(failure);
                    true
                }
                (Some(fut), None) => {
                    fut.resolve(written);
                    false
                }
                (None, Some(failure)) => {
                    tracing::warn!("fire-and-forget transmit failed: {failure}");
                    true
                }
                (None, None) => false,
            },
            TransferTask::File(tx) => match tx.error {
                Some(failure) => {
                    tx.done.abandon(failure);
                    true
                }
                None => {
                    tx.done.resolve(tx.transferred);
                    false
                }
            },
        }
    }

    /// Cancels the task without running it: releases the buffer and fails
    /// the attached future.
    pub(crate) fn close(self, failure: Failure) {
        match self {
            TransferTask::Bytes {
                done: Some(fut), ..
            } => fut.abandon(failure),
            TransferTask::Bytes { done: None, .. } => {}
            TransferTask::File(tx) => tx.done.abandon(failure),
        }
    }
}

#[cfg(target_os = "linux")]
impl FileTx {
    /// Zero-copy path: sendfile(2) straight from the page cache. A short
    /// file ends the task with whatever was transferred, matching the
    /// buffer variant's partial-content behavior.
    fn compute(&mut self, socket: &mut TcpStream) -> Progress {
        use std::os::unix::io::AsRawFd;

        loop {
            if self.remaining == 0 {
                return Progress::Done;
            }
            let mut off = self.offset as libc::off_t;
            let count = self.remaining.min(0x7fff_f000) as usize;
            let sent =
                unsafe { libc::sendfile(socket.as_raw_fd(), self.file.as_raw_fd(), &mut off, count) };
            if sent < 0 {
                let e = io::Error::last_os_error();
                match e.kind() {
                    io::ErrorKind::WouldBlock => return Progress::Blocked,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        self.error = Some(Failure::Io(e));
                        return Progress::Done;
                    }
                }
            }
            if sent == 0 {
                return Progress::Done;
            }
            let sent = sent as u64;
            self.offset += sent;
            self.remaining -= sent;
            self.transferred += sent;
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl FileTx {
    /// Portable path: positional reads staged through a buffer.
    fn compute(&mut self, socket: &mut TcpStream) -> Progress {
        use std::os::unix::fs::FileExt;

        loop {
            if self.staged.is_empty() {
                if self.remaining == 0 {
                    return Progress::Done;
                }
                let want = self.remaining.min(crate::config::FILE_CHUNK_SIZE as u64) as usize;
                let mut chunk = vec![0u8; want];
                match self.file.read_at(&mut chunk, self.offset) {
                    Ok(0) => return Progress::Done,
                    Ok(n) => {
                        self.offset += n as u64;
                        self.remaining -= n as u64;
                        self.staged.write_bytes(&chunk[..n]);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.error = Some(Failure::Io(e));
                        return Progress::Done;
                    }
                }
            }
            match self.staged.write_to(socket) {
                Ok(0) => {
                    self.error = Some(Failure::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    )));
                    return Progress::Done;
                }
                Ok(n) => self.transferred += n as u64,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Progress::Blocked,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.error = Some(Failure::Io(e));
                    return Progress::Done;
                }
            }
        }
    }
}
