//! Single-use continuation cells bound to an owning CPU
//!
//! A [`Future`] carries exactly one value or one failure. Resolution and
//! continuation invocation always happen on the owning CPU; installation
//! is permitted from any thread, which is how futures owned by other CPUs
//! are composed (`Cpu::sequence`, cross-CPU `flat_map`). The cell itself
//! is internally synchronized, but that synchronization is not a license
//! for cross-CPU mutation: resolving off the owning CPU is an invariant
//! failure.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::cpu::Cpu;
use crate::error::Failure;

enum State<T> {
    Pending,
    Value(T),
    Failed(Failure),
    /// Terminal outcome already handed to a continuation.
    Consumed,
}

struct Inner<T> {
    state: State<T>,
    on_value: Option<Box<dyn FnOnce(T) + Send>>,
    on_error: Option<Box<dyn FnOnce(Failure) + Send>>,
    value_installed: bool,
    error_installed: bool,
}

/// A single-use cell carrying a value or failure, bound to an owning CPU.
///
/// Handles are cheap to clone and may travel between threads; all clones
/// refer to the same cell. At most one success and one failure
/// continuation can ever be installed, and each runs on the owning CPU.
pub struct Future<T> {
    cpu: Cpu,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            cpu: self.cpu.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Future<T> {
    /// Creates an unresolved future owned by `cpu`.
    pub fn pending(cpu: &Cpu) -> Future<T> {
        Future {
            cpu: cpu.clone(),
            inner: Arc::new(Mutex::new(Inner {
                state: State::Pending,
                on_value: None,
                on_error: None,
                value_installed: false,
                error_installed: false,
            })),
        }
    }

    /// Creates a future already resolved with `value`.
    pub fn ready(cpu: &Cpu, value: T) -> Future<T> {
        let fut = Future::pending(cpu);
        fut.inner.lock().unwrap().state = State::Value(value);
        fut
    }

    /// Creates a future already resolved with `failure`.
    pub fn failed(cpu: &Cpu, failure: Failure) -> Future<T> {
        let fut = Future::pending(cpu);
        fut.inner.lock().unwrap().state = State::Failed(failure);
        fut
    }

    /// The CPU this future is bound to.
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// Whether the future has reached a terminal state.
    pub fn is_resolved(&self) -> bool {
        !matches!(self.inner.lock().unwrap().state, State::Pending)
    }

    /// Resolves the future with `value`.
    ///
    /// Must be invoked on the owning CPU. Fails with
    /// [`Failure::Invariant`] when the future is already terminal. If a
    /// success continuation is installed it runs synchronously.
    pub fn set_value(&self, value: T) -> Result<(), Failure> {
        if !self.cpu.is_current() {
            return Err(Failure::Invariant("future resolved off its owning cpu"));
        }
        let continuation = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.state, State::Pending) {
                return Err(Failure::Invariant("future already resolved"));
            }
            match inner.on_value.take() {
                Some(k) => {
                    inner.state = State::Consumed;
                    Some(k)
                }
                None => {
                    inner.state = State::Value(value);
                    return Ok(());
                }
            }
        };
        if let Some(k) = continuation {
            k(value);
        }
        Ok(())
    }

    /// Resolves the future with `failure`.
    ///
    /// Same contract as [`set_value`](Future::set_value), for the failure
    /// side.
    pub fn set_failure(&self, failure: Failure) -> Result<(), Failure> {
        if !self.cpu.is_current() {
            return Err(Failure::Invariant("future resolved off its owning cpu"));
        }
        let continuation = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.state, State::Pending) {
                return Err(Failure::Invariant("future already resolved"));
            }
            match inner.on_error.take() {
                Some(k) => {
                    inner.state = State::Consumed;
                    Some(k)
                }
                None => {
                    inner.state = State::Failed(failure);
                    return Ok(());
                }
            }
        };
        if let Some(k) = continuation {
            k(failure);
        }
        Ok(())
    }

    /// Installs the success continuation.
    ///
    /// At most one may ever be installed. If the future already holds a
    /// value the continuation is scheduled on the owning CPU's task queue
    /// rather than invoked inline.
    pub fn on_success<K>(&self, k: K) -> Result<(), Failure>
    where
        K: FnOnce(T) + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.value_installed {
            return Err(Failure::Invariant("success continuation already installed"));
        }
        inner.value_installed = true;
        match std::mem::replace(&mut inner.state, State::Consumed) {
            State::Value(value) => {
                drop(inner);
                // A halted CPU has no loop left to re-enter, so the
                // scheduling detour would drop the continuation.
                if self.cpu.is_running() {
                    self.cpu.enqueue(Box::new(move || k(value)));
                } else {
                    k(value);
                }
            }
            State::Pending => {
                inner.state = State::Pending;
                inner.on_value = Some(Box::new(k));
            }
            State::Failed(e) => {
                inner.state = State::Failed(e);
            }
            State::Consumed => {}
        }
        Ok(())
    }

    /// Installs the failure continuation.
    ///
    /// Same contract as [`on_success`](Future::on_success), for the
    /// failure side.
    pub fn on_failure<K>(&self, k: K) -> Result<(), Failure>
    where
        K: FnOnce(Failure) + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.error_installed {
            return Err(Failure::Invariant("failure continuation already installed"));
        }
        inner.error_installed = true;
        match std::mem::replace(&mut inner.state, State::Consumed) {
            State::Failed(failure) => {
                drop(inner);
                if self.cpu.is_running() {
                    self.cpu.enqueue(Box::new(move || k(failure)));
                } else {
                    k(failure);
                }
            }
            State::Pending => {
                inner.state = State::Pending;
                inner.on_error = Some(Box::new(k));
            }
            State::Value(v) => {
                inner.state = State::Value(v);
            }
            State::Consumed => {}
        }
        Ok(())
    }

    /// Returns a future on the same CPU resolved with `f` applied to this
    /// future's value. Failures propagate without invoking `f`; a panic in
    /// `f` fails the result with [`Failure::Panicked`].
    pub fn map<U, F>(&self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let out = Future::pending(&self.cpu);
        let ok = out.clone();
        let err = out.clone();
        if let Err(e) = self.on_success(move |v| {
            match catch_unwind(AssertUnwindSafe(move || f(v))) {
                Ok(u) => ok.resolve(u),
                Err(payload) => ok.abandon(Failure::from_panic(payload)),
            }
        }) {
            out.abandon(e);
            return out;
        }
        if let Err(e) = self.on_failure(move |failure| err.abandon(failure)) {
            out.abandon(e);
        }
        out
    }

    /// Returns a future on the same CPU chained through `f`.
    ///
    /// When `f` returns a future owned by a different CPU, its outcome is
    /// delivered back to this CPU by cross-CPU submission, so the result
    /// keeps this future's affinity.
    pub fn flat_map<U, F>(&self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        let out = Future::pending(&self.cpu);
        let origin = self.cpu.clone();
        let ok = out.clone();
        let err = out.clone();
        if let Err(e) = self.on_success(move |v| {
            let inner = match catch_unwind(AssertUnwindSafe(move || f(v))) {
                Ok(inner) => inner,
                Err(payload) => {
                    ok.abandon(Failure::from_panic(payload));
                    return;
                }
            };
            let ok_route = origin.clone();
            let err_route = origin;
            let ok_out = ok.clone();
            let err_out = ok;
            if let Err(e) = inner.on_success(move |u| {
                ok_route.run_on(move || ok_out.resolve(u));
            }) {
                err_out.abandon(e);
                return;
            }
            if let Err(e) = inner.on_failure(move |failure| {
                err_route.run_on(move || err_out.abandon(failure));
            }) {
                tracing::warn!("failure continuation slot taken on chained future: {e}");
            }
        }) {
            out.abandon(e);
            return out;
        }
        if let Err(e) = self.on_failure(move |failure| err.abandon(failure)) {
            out.abandon(e);
        }
        out
    }

    /// Convenience over [`on_success`](Future::on_success): installs an
    /// observer that consumes the value and returns this future for
    /// fluent call chains.
    pub fn and_then<K>(&self, k: K) -> Future<T>
    where
        K: FnOnce(T) + Send + 'static,
    {
        if let Err(e) = self.on_success(k) {
            tracing::warn!("and_then ignored: {e}");
        }
        self.clone()
    }

    /// Convenience over [`on_failure`](Future::on_failure): installs a
    /// failure observer and returns this future for fluent call chains.
    pub fn check<K>(&self, k: K) -> Future<T>
    where
        K: FnOnce(Failure) + Send + 'static,
    {
        if let Err(e) = self.on_failure(k) {
            tracing::warn!("check ignored: {e}");
        }
        self.clone()
    }

    /// Resolves with `value`, logging instead of surfacing the invariant
    /// error. Used where the caller has no better failure channel.
    pub(crate) fn resolve(&self, value: T) {
        if let Err(e) = self.set_value(value) {
            tracing::warn!("discarded resolution: {e}");
        }
    }

    /// Fails the future if it is still pending; terminal futures are left
    /// untouched. Unlike [`set_failure`](Future::set_failure) this is
    /// usable from teardown paths that race normal completion.
    pub(crate) fn abandon(&self, failure: Failure) {
        let continuation = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.state, State::Pending) {
                return;
            }
            match inner.on_error.take() {
                Some(k) => {
                    inner.state = State::Consumed;
                    Some(k)
                }
                None => {
                    inner.state = State::Failed(failure);
                    return;
                }
            }
        };
        if let Some(k) = continuation {
            k(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::CpuSet;
    use std::sync::mpsc;
    use std::time::Duration;

    fn single_cpu() -> CpuSet {
        let cpus = CpuSet::builder().add_pack(&[0]).build().unwrap();
        cpus.start().unwrap();
        cpus
    }

    #[test]
    fn test_resolve_exactly_once() {
        let cpus = single_cpu();
        let cpu = cpus.get(0).unwrap().clone();
        let (tx, rx) = mpsc::channel();

        cpu.schedule(move || {
            let fut = Future::pending(&crate::cpu::current_cpu().unwrap());
            let first = fut.set_value(1).is_ok();
            let second = fut.set_value(2);
            (first, matches!(second, Err(Failure::Invariant(_))))
        })
        .and_then(move |outcome| tx.send(outcome).unwrap());

        let (first, second_rejected) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(first);
        assert!(second_rejected);
        cpus.halt();
    }

    #[test]
    fn test_resolution_requires_owning_cpu() {
        let cpus = single_cpu();
        let fut: Future<i32> = Future::pending(cpus.get(0).unwrap());
        assert!(matches!(
            fut.set_value(42),
            Err(Failure::Invariant("future resolved off its owning cpu"))
        ));
        cpus.halt();
    }

    #[test]
    fn test_continuation_after_resolution_is_scheduled() {
        let cpus = single_cpu();
        let cpu = cpus.get(0).unwrap();
        let fut = Future::ready(cpu, 7);
        let (tx, rx) = mpsc::channel();

        // Installed from the test thread after the terminal state: must run
        // on the owning CPU, not here.
        let test_thread = std::thread::current().id();
        fut.on_success(move |v| {
            tx.send((v, std::thread::current().id())).unwrap();
        })
        .unwrap();

        let (v, thread) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(v, 7);
        assert_ne!(thread, test_thread);
        cpus.halt();
    }

    #[test]
    fn test_second_install_is_rejected() {
        let cpus = single_cpu();
        let fut: Future<i32> = Future::pending(cpus.get(0).unwrap());
        fut.on_success(|_| {}).unwrap();
        assert!(matches!(
            fut.on_success(|_| {}),
            Err(Failure::Invariant(_))
        ));
        cpus.halt();
    }

    #[test]
    fn test_map_chain_runs_in_installation_order() {
        let cpus = single_cpu();
        let cpu = cpus.get(0).unwrap().clone();
        let (tx, rx) = mpsc::channel();

        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        cpu.schedule(|| 1)
            .map(move |v| {
                o1.lock().unwrap().push("first");
                v + 1
            })
            .map(move |v| {
                o2.lock().unwrap().push("second");
                v + 1
            })
            .and_then(move |v| tx.send(v).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        cpus.halt();
    }

    #[test]
    fn test_map_propagates_failure_without_invoking() {
        let cpus = single_cpu();
        let cpu = cpus.get(0).unwrap();
        let (tx, rx) = mpsc::channel();

        let fut: Future<i32> = Future::failed(cpu, Failure::EndOfStream);
        fut.map(|_| -> i32 { unreachable!("map function must not run on failure") })
            .check(move |e| tx.send(e).unwrap());

        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Failure::EndOfStream
        ));
        cpus.halt();
    }

    #[test]
    fn test_panic_in_map_becomes_failure() {
        let cpus = single_cpu();
        let cpu = cpus.get(0).unwrap().clone();
        let (tx, rx) = mpsc::channel();

        cpu.schedule(|| 1)
            .map(|_: i32| -> i32 { panic!("boom") })
            .check(move |e| tx.send(e).unwrap());

        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Failure::Panicked(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected failure: {other}"),
        }
        cpus.halt();
    }

    #[test]
    fn test_flat_map_across_cpus_keeps_affinity() {
        let cpus = CpuSet::builder().add_pack(&[0, 1]).build().unwrap();
        cpus.start().unwrap();
        let cpu0 = cpus.get(0).unwrap().clone();
        let cpu1 = cpus.get(1).unwrap().clone();
        let (tx, rx) = mpsc::channel();

        let chained = cpu0
            .schedule(|| 10)
            .flat_map(move |v| cpu1.schedule(move || v * 2));
        assert_eq!(chained.cpu().id(), 0);

        let cpu0_check = cpu0.clone();
        chained.and_then(move |v| {
            tx.send((v, cpu0_check.is_current())).unwrap();
        });

        let (v, on_origin) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(v, 20);
        assert!(on_origin);
        cpus.halt();
    }
}
