//! Tunable constants for the runtime
//!
//! This module contains the parameters that affect event-loop behavior,
//! particularly around fairness and back-pressure.

/// Channel capacity for cross-CPU submission
///
/// This controls the bounded channel size used for submitting work between
/// CPUs. A larger value provides more buffering but uses more memory, while
/// a smaller value provides more back-pressure but may cause blocking under
/// high load.
pub const CROSS_CPU_CHANNEL_CAPACITY: usize = 1024;

/// Maximum number of tasks executed per loop tick
///
/// Bounding the batch keeps a chatty compute loop from starving timer
/// expiration and I/O readiness: after this many tasks the loop returns to
/// the selector even when the local queue is non-empty.
pub const TASK_BATCH: usize = 128;

/// Upper bound on a single selector wait (in milliseconds)
///
/// The loop blocks in the selector for at most this long when it has no
/// local work and no nearer timer deadline. Cross-CPU submissions end the
/// wait early through the selector waker.
pub const MAX_POLL_WAIT_MS: u64 = 100;

/// Bytes read from a socket per `read(2)` call
///
/// The receive path drains a readable socket in chunks of this size until
/// it would block, accumulating into the stream's read buffer.
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Capacity of the selector's event buffer
pub const EVENTS_CAPACITY: usize = 1024;

/// Bytes staged per file read on the portable (non-sendfile) transfer path
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;
