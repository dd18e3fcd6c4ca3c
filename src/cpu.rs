//! Per-CPU handle and event loop
//!
//! Each CPU owns one OS thread running a cooperative loop over a local
//! task queue, a timer heap and a readiness selector. All state owned by
//! a CPU is touched only by its thread; the single cross-thread entry
//! point is the submission inbox, a bounded channel paired with a
//! selector waker.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, SendError, Sender};
use mio::{Interest, Registry, Token};
use once_cell::sync::OnceCell;

use crate::config;
use crate::error::Failure;
use crate::future::Future;
use crate::io::{Selector, FIRST_SOURCE_TOKEN, WAKER_TOKEN};
use crate::net::Channel;
use crate::timer::TimerHeap;
use crate::topology::Pack;

/// Outcome of one `repeat` step.
pub enum Status<T> {
    /// Run the step again.
    Continue,
    /// Finish without a value.
    Stop,
    /// Finish with a value.
    StopWith(T),
}

/// Handler for failures with no future to land on (a panicked
/// fire-and-forget task). Installed on the topology builder.
pub(crate) type FailureSink = Arc<dyn Fn(Failure) + Send + Sync>;

pub(crate) fn default_failure_sink() -> FailureSink {
    Arc::new(|failure| tracing::error!("unhandled task failure: {failure}"))
}

/// A unit of queued work plus the hook that fails its future when the
/// work cannot run (shutdown) or panics.
pub(crate) struct Task {
    work: Box<dyn FnOnce() + Send>,
    on_abort: Option<Box<dyn FnOnce(Failure) + Send>>,
}

impl Task {
    pub(crate) fn new(work: impl FnOnce() + Send + 'static) -> Task {
        Task {
            work: Box::new(work),
            on_abort: None,
        }
    }

    pub(crate) fn with_abort(
        work: impl FnOnce() + Send + 'static,
        on_abort: impl FnOnce(Failure) + Send + 'static,
    ) -> Task {
        Task {
            work: Box::new(work),
            on_abort: Some(Box::new(on_abort)),
        }
    }

    fn from_boxed(work: Box<dyn FnOnce() + Send>) -> Task {
        Task {
            work,
            on_abort: None,
        }
    }

    /// Runs the task, converting a panic into a failure on the task's
    /// future (or the CPU's failure sink when it has none).
    pub(crate) fn run(self, sink: &dyn Fn(Failure)) {
        let Task { work, on_abort } = self;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
            let failure = Failure::from_panic(payload);
            match on_abort {
                Some(hook) => hook(failure),
                None => sink(failure),
            }
        }
    }

    /// Fails the task without running it.
    pub(crate) fn abort(self, failure: Failure) {
        match self.on_abort {
            Some(hook) => hook(failure),
            None => tracing::debug!("dropped fire-and-forget task: {failure}"),
        }
    }
}

pub(crate) enum Message {
    Submit(Task),
    Halt,
}

struct Shared {
    id: usize,
    sender: Sender<Message>,
    waker: mio::Waker,
    running: AtomicBool,
    pack: OnceCell<Pack>,
    sink: FailureSink,
}

/// Handle to one logical CPU.
///
/// Cheap to clone and freely shareable across threads; every operation
/// that touches CPU-owned state routes through the owning thread.
#[derive(Clone)]
pub struct Cpu {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu").field("id", &self.shared.id).finish()
    }
}

impl Cpu {
    pub(crate) fn new(
        id: usize,
        sender: Sender<Message>,
        waker: mio::Waker,
        sink: FailureSink,
    ) -> Cpu {
        Cpu {
            shared: Arc::new(Shared {
                id,
                sender,
                waker,
                running: AtomicBool::new(true),
                pack: OnceCell::new(),
                sink,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// The pack this CPU belongs to.
    pub fn pack(&self) -> &Pack {
        self.shared
            .pack
            .get()
            .expect("cpu not attached to a pack")
    }

    pub(crate) fn attach_pack(&self, pack: Pack) {
        if self.shared.pack.set(pack).is_err() {
            tracing::warn!("cpu {} already attached to a pack", self.shared.id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Whether the calling thread is this CPU's loop thread.
    pub(crate) fn is_current(&self) -> bool {
        current_cpu_id() == Some(self.shared.id)
    }

    pub(crate) fn sink(&self) -> &FailureSink {
        &self.shared.sink
    }

    /// Enqueues a task: locally when called from the owning thread,
    /// through the inbox (plus a selector wakeup) otherwise. After
    /// `halt()` the task is failed with `Shutdown` instead.
    pub(crate) fn submit(&self, task: Task) {
        if !self.is_running() {
            task.abort(Failure::Shutdown);
            return;
        }
        if self.is_current() {
            with_local(|local| local.queue.borrow_mut().push_back(task));
            return;
        }
        match self.shared.sender.send(Message::Submit(task)) {
            Ok(()) => {
                if let Err(e) = self.shared.waker.wake() {
                    tracing::warn!("cpu {} waker failed: {e}", self.shared.id);
                }
            }
            Err(SendError(Message::Submit(task))) => task.abort(Failure::Shutdown),
            Err(_) => {}
        }
    }

    pub(crate) fn enqueue(&self, work: Box<dyn FnOnce() + Send>) {
        self.submit(Task::from_boxed(work));
    }

    /// Runs `f` inline when already on this CPU, otherwise submits it.
    /// Value-routing primitive for cross-CPU future composition.
    pub(crate) fn run_on(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_current() {
            f();
        } else {
            self.submit(Task::new(f));
        }
    }

    /// Enqueues a thunk and returns a future, owned by this CPU, resolved
    /// with the thunk's return value. A panic in the thunk fails the
    /// future with [`Failure::Panicked`].
    pub fn schedule<R, F>(&self, f: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let fut = Future::pending(self);
        let done = fut.clone();
        let aborted = fut.clone();
        self.submit(Task::with_abort(
            move || done.resolve(f()),
            move |failure| aborted.abandon(failure),
        ));
        fut
    }

    /// Runs `step` repeatedly until it yields [`Status::Stop`] or
    /// [`Status::StopWith`]. Each round trips through the task queue, so
    /// an always-ready step cannot starve I/O or grow the stack.
    pub fn repeat<T, F>(&self, step: F) -> Future<Option<T>>
    where
        T: Send + 'static,
        F: FnMut(&Cpu) -> Future<Status<T>> + Send + 'static,
    {
        let done = Future::pending(self);
        drive_repeat(self.clone(), step, done.clone());
        done
    }

    /// `repeat` variant for connection loops: `step` is re-invoked every
    /// time its future resolves and the loop ends when one fails, with
    /// the failure handed to `on_failure`.
    pub fn run_loop<T, F, E>(&self, step: F, on_failure: E)
    where
        T: Send + 'static,
        F: FnMut() -> Future<T> + Send + 'static,
        E: Fn(Failure) + Send + Sync + 'static,
    {
        drive_loop(self.clone(), step, Arc::new(on_failure));
    }

    /// Arms a timer: `f` runs on this CPU at or after `now + delay`, and
    /// the returned future resolves with its result.
    pub fn sleep<R, F>(&self, delay: Duration, f: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let fut = Future::pending(self);
        let deadline = Instant::now() + delay;
        let done = fut.clone();
        let aborted = fut.clone();
        let timer_task = Task::with_abort(
            move || done.resolve(f()),
            move |failure| aborted.abandon(failure),
        );
        if self.is_current() {
            with_local(|local| local.timers.borrow_mut().push(deadline, timer_task));
        } else {
            let never_armed = fut.clone();
            self.submit(Task::with_abort(
                move || with_local(|local| local.timers.borrow_mut().push(deadline, timer_task)),
                move |failure| never_armed.abandon(failure),
            ));
        }
        fut
    }

    /// Collects `futures` into one future on this CPU, values in input
    /// order. The first failure in input order (not completion order)
    /// fails the aggregate; later results are observed and discarded.
    pub fn sequence<T>(&self, futures: Vec<Future<T>>) -> Future<Vec<T>>
    where
        T: Send + 'static,
    {
        if futures.is_empty() {
            return Future::ready(self, Vec::new());
        }
        let out = Future::pending(self);
        let collector = Arc::new(Mutex::new(Collector {
            slots: futures.iter().map(|_| None).collect(),
            next: 0,
            terminated: false,
        }));
        for (index, fut) in futures.into_iter().enumerate() {
            let origin = self.clone();
            let c = collector.clone();
            let o = out.clone();
            let installed = fut.on_success(move |value| {
                let c = c.clone();
                let o = o.clone();
                origin.run_on(move || deliver(&c, &o, index, Ok(value)));
            });
            if let Err(e) = installed {
                let c = collector.clone();
                let o = out.clone();
                self.run_on(move || deliver(&c, &o, index, Err(e)));
                continue;
            }
            let origin = self.clone();
            let c = collector.clone();
            let o = out.clone();
            let installed = fut.on_failure(move |failure| {
                let c = c.clone();
                let o = o.clone();
                origin.run_on(move || deliver(&c, &o, index, Err(failure)));
            });
            if let Err(e) = installed {
                tracing::warn!("sequence input {index} failure slot taken: {e}");
            }
        }
        out
    }

    /// Binds a listener at `addr` on this CPU. Accepted sockets are placed
    /// on a CPU of this pack. The returned future resolves with the bound
    /// address once the listener is registered.
    pub fn listen<C, E>(&self, addr: SocketAddr, on_connect: C, on_failure: E) -> Future<SocketAddr>
    where
        C: Fn(Channel) + Send + Sync + 'static,
        E: Fn(Failure) + Send + Sync + 'static,
    {
        let fut = Future::pending(self);
        let done = fut.clone();
        let aborted = fut.clone();
        let on_connect: Arc<dyn Fn(Channel) + Send + Sync> = Arc::new(on_connect);
        let on_failure: Arc<dyn Fn(Failure) + Send + Sync> = Arc::new(on_failure);
        self.submit(Task::with_abort(
            move || match bind_listener(addr) {
                Ok((listener, local_addr)) => with_local(|local| {
                    let mut listener = listener;
                    let token = local.next_token();
                    match local
                        .registry
                        .register(&mut listener, token, Interest::READABLE)
                    {
                        Ok(()) => {
                            local.listeners.borrow_mut().insert(
                                token,
                                Rc::new(ListenerEntry {
                                    socket: RefCell::new(listener),
                                    on_connect,
                                    on_failure,
                                }),
                            );
                            tracing::info!(
                                "cpu {} listening on {local_addr}",
                                local.cpu.id()
                            );
                            done.resolve(local_addr);
                        }
                        Err(e) => done.abandon(Failure::Io(e)),
                    }
                }),
                Err(e) => done.abandon(Failure::Io(e)),
            },
            move |failure| aborted.abandon(failure),
        ));
        fut
    }

    /// Stops this CPU: no further external submissions are accepted and
    /// the loop exits after its current iteration, failing every pending
    /// future it owns with [`Failure::Shutdown`].
    pub fn halt(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            tracing::info!("cpu {} halting", self.shared.id);
            let _ = self.shared.sender.send(Message::Halt);
            let _ = self.shared.waker.wake();
        }
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<(mio::net::TcpListener, SocketAddr)> {
    let listener = mio::net::TcpListener::bind(addr)?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

fn drive_repeat<T, F>(cpu: Cpu, mut step: F, done: Future<Option<T>>)
where
    T: Send + 'static,
    F: FnMut(&Cpu) -> Future<Status<T>> + Send + 'static,
{
    let aborted = done.clone();
    let stepper = cpu.clone();
    cpu.submit(Task::with_abort(
        move || {
            let fut = step(&stepper);
            let next_cpu = stepper.clone();
            let on_stop = done.clone();
            let on_fail = done.clone();
            let installed = fut.on_success(move |status| match status {
                Status::Continue => drive_repeat(next_cpu, step, on_stop),
                Status::Stop => on_stop.resolve(None),
                Status::StopWith(value) => on_stop.resolve(Some(value)),
            });
            if let Err(e) = installed {
                done.abandon(e);
                return;
            }
            if let Err(e) = fut.on_failure(move |failure| on_fail.abandon(failure)) {
                tracing::warn!("repeat step failure slot taken: {e}");
            }
        },
        move |failure| aborted.abandon(failure),
    ));
}

fn drive_loop<T, F>(cpu: Cpu, mut step: F, on_failure: Arc<dyn Fn(Failure) + Send + Sync>)
where
    T: Send + 'static,
    F: FnMut() -> Future<T> + Send + 'static,
{
    let aborted = on_failure.clone();
    let stepper = cpu.clone();
    cpu.submit(Task::with_abort(
        move || {
            let fut = step();
            let next_handler = on_failure.clone();
            let fail_handler = on_failure.clone();
            let installed =
                fut.on_success(move |_| drive_loop(stepper, step, next_handler));
            if let Err(e) = installed {
                (*on_failure)(e);
                return;
            }
            if let Err(e) = fut.on_failure(move |failure| (*fail_handler)(failure)) {
                tracing::warn!("loop step failure slot taken: {e}");
            }
        },
        move |failure| (*aborted)(failure),
    ));
}

struct Collector<T> {
    slots: Vec<Option<Result<T, Failure>>>,
    next: usize,
    terminated: bool,
}

/// Records one input's outcome and resolves the aggregate once the
/// outcome at the front of the input order is known. Runs only on the
/// aggregate's owning CPU.
fn deliver<T: Send + 'static>(
    collector: &Mutex<Collector<T>>,
    out: &Future<Vec<T>>,
    index: usize,
    result: Result<T, Failure>,
) {
    let mut c = collector.lock().unwrap();
    if c.terminated {
        return;
    }
    c.slots[index] = Some(result);
    while c.next < c.slots.len() {
        match &c.slots[c.next] {
            None => return,
            Some(Err(_)) => {
                c.terminated = true;
                let next = c.next;
                let failure = match c.slots[next].take() {
                    Some(Err(e)) => e,
                    _ => unreachable!(),
                };
                drop(c);
                out.abandon(failure);
                return;
            }
            Some(Ok(_)) => c.next += 1,
        }
    }
    c.terminated = true;
    let values = c
        .slots
        .drain(..)
        .map(|slot| match slot {
            Some(Ok(v)) => v,
            _ => unreachable!(),
        })
        .collect();
    drop(c);
    out.resolve(values);
}

/// Loop-thread state published to the thread so that handle methods
/// invoked on the owning thread can take the local fast path.
pub(crate) struct LocalState {
    pub(crate) cpu: Cpu,
    pub(crate) queue: RefCell<VecDeque<Task>>,
    pub(crate) timers: RefCell<TimerHeap>,
    pub(crate) registry: Registry,
    pub(crate) channels: RefCell<HashMap<Token, Channel>>,
    pub(crate) listeners: RefCell<HashMap<Token, Rc<ListenerEntry>>>,
    next_token: Cell<usize>,
}

impl LocalState {
    pub(crate) fn next_token(&self) -> Token {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        Token(token)
    }
}

pub(crate) struct ListenerEntry {
    socket: RefCell<mio::net::TcpListener>,
    on_connect: Arc<dyn Fn(Channel) + Send + Sync>,
    on_failure: Arc<dyn Fn(Failure) + Send + Sync>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<LocalState>>> = const { RefCell::new(None) };
}

pub(crate) fn current() -> Option<Rc<LocalState>> {
    CURRENT.with(|c| c.borrow().clone())
}

pub(crate) fn current_cpu() -> Option<Cpu> {
    CURRENT.with(|c| c.borrow().as_ref().map(|local| local.cpu.clone()))
}

pub(crate) fn current_cpu_id() -> Option<usize> {
    CURRENT.with(|c| c.borrow().as_ref().map(|local| local.cpu.id()))
}

pub(crate) fn with_local<R>(f: impl FnOnce(&LocalState) -> R) -> R {
    CURRENT.with(|c| {
        let borrowed = c.borrow();
        let local = borrowed
            .as_ref()
            .expect("not on a runtime loop thread");
        f(local)
    })
}

pub(crate) struct EventLoop {
    state: Rc<LocalState>,
    inbox: Receiver<Message>,
    selector: Selector,
}

impl EventLoop {
    pub(crate) fn new(
        cpu: Cpu,
        inbox: Receiver<Message>,
        selector: Selector,
        registry: Registry,
    ) -> EventLoop {
        EventLoop {
            state: Rc::new(LocalState {
                cpu,
                queue: RefCell::new(VecDeque::new()),
                timers: RefCell::new(TimerHeap::new()),
                registry,
                channels: RefCell::new(HashMap::new()),
                listeners: RefCell::new(HashMap::new()),
                next_token: Cell::new(FIRST_SOURCE_TOKEN),
            }),
            inbox,
            selector,
        }
    }

    pub(crate) fn run(mut self) {
        CURRENT.with(|c| *c.borrow_mut() = Some(self.state.clone()));
        set_affinity(self.state.cpu.id());
        tracing::info!("cpu {} event loop started", self.state.cpu.id());

        while self.state.cpu.is_running() {
            self.drain_inbox();
            self.run_tasks();
            self.expire_timers();
            let timeout = self.poll_timeout();
            self.poll_and_dispatch(timeout);
        }

        self.drain_on_halt();
        CURRENT.with(|c| *c.borrow_mut() = None);
        tracing::info!("cpu {} event loop stopped", self.state.cpu.id());
    }

    fn drain_inbox(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                Message::Submit(task) => self.state.queue.borrow_mut().push_back(task),
                Message::Halt => {
                    tracing::debug!("cpu {} received halt", self.state.cpu.id());
                }
            }
        }
    }

    fn run_tasks(&mut self) {
        let sink = self.state.cpu.sink().clone();
        for _ in 0..config::TASK_BATCH {
            let task = self.state.queue.borrow_mut().pop_front();
            match task {
                Some(task) => task.run(&*sink),
                None => break,
            }
        }
    }

    fn expire_timers(&mut self) {
        let now = Instant::now();
        loop {
            let due = self.state.timers.borrow_mut().pop_due(now);
            match due {
                Some(task) => self.state.queue.borrow_mut().push_back(task),
                None => break,
            }
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.state.queue.borrow().is_empty() {
            return Some(Duration::ZERO);
        }
        let max = Duration::from_millis(config::MAX_POLL_WAIT_MS);
        match self.state.timers.borrow().next_deadline() {
            Some(deadline) => Some(deadline.saturating_duration_since(Instant::now()).min(max)),
            None => Some(max),
        }
    }

    fn poll_and_dispatch(&mut self, timeout: Option<Duration>) {
        let ready = match self.selector.poll(timeout) {
            Ok(ready) => ready,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return,
            Err(e) => {
                tracing::error!("cpu {} selector failed: {e}", self.state.cpu.id());
                return;
            }
        };
        for readiness in ready {
            if readiness.token == WAKER_TOKEN {
                continue;
            }
            let channel = self.state.channels.borrow().get(&readiness.token).cloned();
            if let Some(channel) = channel {
                let sink = self.state.cpu.sink().clone();
                if readiness.readable {
                    if let Err(payload) =
                        catch_unwind(AssertUnwindSafe(|| channel.trigger_rx()))
                    {
                        (*sink)(Failure::from_panic(payload));
                    }
                }
                if readiness.writable {
                    if let Err(payload) =
                        catch_unwind(AssertUnwindSafe(|| channel.trigger_tx()))
                    {
                        (*sink)(Failure::from_panic(payload));
                    }
                }
                continue;
            }
            let listener = self.state.listeners.borrow().get(&readiness.token).cloned();
            if let Some(listener) = listener {
                if readiness.readable {
                    self.accept_ready(&listener);
                }
            }
        }
    }

    fn accept_ready(&self, listener: &ListenerEntry) {
        let mut socket = listener.socket.borrow_mut();
        loop {
            match socket.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(
                        "cpu {} accepted connection from {peer}",
                        self.state.cpu.id()
                    );
                    let on_connect = listener.on_connect.clone();
                    let on_failure = listener.on_failure.clone();
                    self.state.cpu.pack().register(
                        stream,
                        move |channel| (*on_connect)(channel),
                        move |failure| (*on_failure)(failure),
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    (*listener.on_failure)(Failure::Io(e));
                    break;
                }
            }
        }
    }

    /// Fails everything still pending on this CPU with `Shutdown` and
    /// tears down its sockets. Runs once, after the loop exits.
    fn drain_on_halt(&mut self) {
        loop {
            let task = self.state.queue.borrow_mut().pop_front();
            match task {
                Some(task) => task.abort(Failure::Shutdown),
                None => break,
            }
        }
        while let Ok(message) = self.inbox.try_recv() {
            if let Message::Submit(task) = message {
                task.abort(Failure::Shutdown);
            }
        }
        for task in self.state.timers.borrow_mut().drain() {
            task.abort(Failure::Shutdown);
        }
        let channels: Vec<Channel> = self
            .state
            .channels
            .borrow_mut()
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in channels {
            channel.close_with(|| Failure::Shutdown);
        }
        self.state.listeners.borrow_mut().clear();
    }
}

#[cfg(target_os = "linux")]
fn set_affinity(id: usize) {
    use nix::sched::{sched_setaffinity, CpuSet as AffinityMask};
    use nix::unistd::Pid;

    let mut mask = AffinityMask::new();
    if mask.set(id).is_err() {
        return;
    }
    match sched_setaffinity(Pid::from_raw(0), &mask) {
        Ok(()) => tracing::debug!("pinned loop thread to core {id}"),
        Err(e) => tracing::warn!("failed to pin loop thread to core {id}: {e}"),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_affinity(_id: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::CpuSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_schedule_runs_on_owning_thread() {
        let cpus = CpuSet::builder().add_pack(&[0]).build().unwrap();
        cpus.start().unwrap();
        let cpu = cpus.get(0).unwrap().clone();
        let (tx, rx) = mpsc::channel();

        let probe = cpu.clone();
        cpu.schedule(move || probe.is_current())
            .and_then(move |on_owner| tx.send(on_owner).unwrap());

        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        cpus.halt();
    }

    #[test]
    fn test_single_submitter_tasks_run_in_order() {
        let cpus = CpuSet::builder().add_pack(&[0]).build().unwrap();
        cpus.start().unwrap();
        let cpu = cpus.get(0).unwrap();
        let (tx, rx) = mpsc::channel();

        for i in 0..100 {
            let tx = tx.clone();
            cpu.schedule(move || tx.send(i).unwrap());
        }
        let received: Vec<i32> = (0..100)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
        cpus.halt();
    }

    #[test]
    fn test_schedule_after_halt_fails_with_shutdown() {
        let cpus = CpuSet::builder().add_pack(&[0]).build().unwrap();
        cpus.start().unwrap();
        let cpu = cpus.get(0).unwrap().clone();
        cpus.halt();

        let (tx, rx) = mpsc::channel();
        cpu.schedule(|| 1).check(move |e| tx.send(e).unwrap());
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Failure::Shutdown
        ));
    }

    #[test]
    fn test_repeat_reschedules_through_the_queue() {
        let cpus = CpuSet::builder().add_pack(&[0]).build().unwrap();
        cpus.start().unwrap();
        let cpu = cpus.get(0).unwrap().clone();
        let (tx, rx) = mpsc::channel();

        let rounds = Arc::new(AtomicUsize::new(0));
        let seen = rounds.clone();
        let outcome = cpu.repeat(move |cpu| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            Future::ready(
                cpu,
                if n == 4 { Status::StopWith(n) } else { Status::Continue },
            )
        });
        outcome.and_then(move |v| tx.send(v).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(4));
        assert_eq!(rounds.load(Ordering::SeqCst), 5);
        cpus.halt();
    }
}
