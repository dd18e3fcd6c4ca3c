//! gale: a shared-nothing thread-per-core runtime with integrated
//! non-blocking network I/O
//!
//! This crate provides a cooperative execution runtime in the
//! thread-per-core style:
//! - Shared-nothing architecture: each logical CPU owns one OS thread,
//!   one task queue, one timer heap and one readiness selector
//! - Explicit continuation-cell futures, always resumed on the CPU that
//!   owns them
//! - Cross-CPU concurrency expressed exclusively through message passing
//! - Non-blocking TCP accept/read/write/file-transfer driven by the same
//!   per-CPU loop
//!
//! # Topology
//!
//! An application declares its topology up front: CPUs are grouped into
//! packs (CPUs presumed to share a NUMA node), and new connections are
//! spread across the pack that accepted them.
//!
//! ```rust,no_run
//! use gale::CpuSet;
//!
//! let cpus = CpuSet::builder()
//!     .add_pack(&[0, 1])
//!     .add_pack(&[2, 3])
//!     .build()
//!     .unwrap();
//! cpus.start().unwrap();
//!
//! let cpu = cpus.get(0).unwrap();
//! let doubled = cpu.schedule(|| 21).map(|n| n * 2);
//! doubled.and_then(|n| println!("computed {n}"));
//!
//! cpus.halt();
//! ```
//!
//! # Futures
//!
//! A [`Future`] is a single-use cell carrying a value or a failure, bound
//! to its owning CPU. Composition (`map`, `flat_map`, `sequence`) stays on
//! the owning CPU; when a chain crosses CPUs, the result is routed back by
//! cross-CPU submission, never by shared mutation. A task suspends only by
//! returning an unresolved future; there is no preemption, and long
//! synchronous work inside a task stalls its CPU.
//!
//! # Networking
//!
//! [`Cpu::listen`] accepts connections and places each resulting
//! [`Channel`] on a CPU of the listening pack. Reads go through an
//! accumulating buffer with either exact-length requests or framing
//! consumers; writes go through a FIFO transmit queue with a synchronous
//! fast path, write-interest hysteresis and zero-copy file transfer.
//!
//! ```rust,no_run
//! use gale::{Buffer, CpuSet, Status};
//!
//! let cpus = CpuSet::builder().add_pack(&[0]).build().unwrap();
//! cpus.start().unwrap();
//!
//! cpus.get(0).unwrap().listen(
//!     "127.0.0.1:0".parse().unwrap(),
//!     |channel| {
//!         channel.serve(|ch| {
//!             let output = ch.output();
//!             ch.input()
//!                 .read_i32()
//!                 .flat_map(move |n| {
//!                     output.write_i32(n).flush()
//!                 })
//!         });
//!     },
//!     |failure| eprintln!("listener failed: {failure}"),
//! );
//! ```

pub mod buffer;
pub mod config;
pub mod cpu;
pub mod future;
pub mod net;
pub mod topology;

mod io;
mod timer;

pub use buffer::Buffer;
pub use cpu::{Cpu, Status};
pub use error::{Failure, Result};
pub use future::Future;
pub use net::{Channel, InputStream, OutputStream};
pub use topology::{CpuSet, Pack};

/// Failure taxonomy for the runtime
pub mod error {
    use thiserror::Error;

    /// A terminal failure delivered through a future chain or to a CPU's
    /// failure sink.
    #[derive(Debug, Error)]
    pub enum Failure {
        /// A socket or file operation returned an error.
        #[error("i/o failure: {0}")]
        Io(#[from] std::io::Error),

        /// The peer closed the connection while a reader was pending.
        #[error("end of stream")]
        EndOfStream,

        /// The channel was torn down under pending work.
        #[error("channel closed")]
        ChannelClosed,

        /// `halt()` failed this future before it could resolve.
        #[error("runtime is shutting down")]
        Shutdown,

        /// A programming error: double resolution, double continuation
        /// install, a second pending reader, or resolution off the owning
        /// CPU.
        #[error("invariant violated: {0}")]
        Invariant(&'static str),

        /// A task, continuation or mapping function panicked.
        #[error("task panicked: {0}")]
        Panicked(String),
    }

    impl Failure {
        /// Converts a caught panic payload into a `Failure`.
        pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Failure {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            Failure::Panicked(message)
        }
    }

    pub type Result<T> = std::result::Result<T, Failure>;
}
