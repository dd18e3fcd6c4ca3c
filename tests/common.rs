//! Shared helpers for the integration suite.

use std::sync::mpsc;
use std::time::Duration;

use gale::{CpuSet, Failure, Future};

/// Blocks the test thread until `fut` resolves. Continuations run on the
/// owning CPU and relay the outcome through an mpsc channel, the same way
/// application code would observe a result from outside the runtime.
#[allow(dead_code)]
pub fn await_future<T: Send + 'static>(
    fut: &Future<T>,
    timeout: Duration,
) -> Result<T, Failure> {
    let (tx, rx) = mpsc::channel();
    let tx_err = tx.clone();
    fut.on_success(move |v| {
        let _ = tx.send(Ok(v));
    })
    .expect("success slot taken");
    fut.on_failure(move |e| {
        let _ = tx_err.send(Err(e));
    })
    .expect("failure slot taken");
    rx.recv_timeout(timeout).expect("future did not resolve in time")
}

/// Builds and starts a topology with one pack per slice.
#[allow(dead_code)]
pub fn start_topology(packs: &[&[usize]]) -> CpuSet {
    let mut builder = CpuSet::builder();
    for pack in packs {
        builder = builder.add_pack(pack);
    }
    let cpus = builder.build().expect("topology builds");
    cpus.start().expect("topology starts");
    cpus
}
