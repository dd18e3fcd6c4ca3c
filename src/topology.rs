//! Static CPU topology
//!
//! A [`CpuSet`] is an immutable mapping of pack id to [`Pack`] (a group
//! of CPUs presumed to share a NUMA node) plus the flat list of all CPUs.
//! Packs place new connections: a socket registered with a pack gets its
//! channel built on a randomly chosen member CPU, so the channel's
//! selector registration happens on the thread that will own it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use mio::Registry;
use rand::Rng;

use crate::config;
use crate::cpu::{default_failure_sink, Cpu, EventLoop, FailureSink, Message, Task};
use crate::error::Failure;
use crate::io::Selector;
use crate::net::Channel;

/// A group of CPUs presumed co-located on one NUMA node.
#[derive(Clone)]
pub struct Pack {
    inner: Arc<PackInner>,
}

struct PackInner {
    id: usize,
    cpus: Vec<Cpu>,
}

impl Pack {
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn cpus(&self) -> &[Cpu] {
        &self.inner.cpus
    }

    pub fn len(&self) -> usize {
        self.inner.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cpus.is_empty()
    }

    /// CPU at position `idx` within this pack.
    pub fn get(&self, idx: usize) -> Option<&Cpu> {
        self.inner.cpus.get(idx)
    }

    /// Uniform random placement across every CPU of the pack.
    pub fn get_cpu(&self) -> &Cpu {
        let idx = rand::thread_rng().gen_range(0..self.inner.cpus.len());
        &self.inner.cpus[idx]
    }

    /// Places `socket` on a CPU of this pack: channel construction and
    /// selector registration are scheduled onto the chosen CPU, and
    /// `on_success` runs there with the new channel.
    pub fn register<S, E>(&self, socket: mio::net::TcpStream, on_success: S, on_failure: E)
    where
        S: FnOnce(Channel) + Send + 'static,
        E: FnOnce(Failure) + Send + 'static,
    {
        let cpu = self.get_cpu().clone();
        cpu.submit(Task::new(move || match Channel::open(socket) {
            Ok(channel) => on_success(channel),
            Err(failure) => on_failure(failure),
        }));
    }

    /// [`register`](Pack::register) for a blocking-mode std socket, e.g.
    /// an outbound connection; the socket is switched to non-blocking
    /// first.
    pub fn register_std<S, E>(&self, socket: std::net::TcpStream, on_success: S, on_failure: E)
    where
        S: FnOnce(Channel) + Send + 'static,
        E: FnOnce(Failure) + Send + 'static,
    {
        if let Err(e) = socket.set_nonblocking(true) {
            on_failure(Failure::Io(e));
            return;
        }
        self.register(mio::net::TcpStream::from_std(socket), on_success, on_failure);
    }
}

struct Seed {
    cpu: Cpu,
    inbox: Receiver<Message>,
    selector: Selector,
    registry: Registry,
}

/// Immutable topology of packs and CPUs.
///
/// Built once, started once, halted once; dropping a started set halts
/// it. There is no restart.
pub struct CpuSet {
    packs: Vec<Pack>,
    cpus: Vec<Cpu>,
    seeds: Mutex<Vec<Seed>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CpuSet {
    pub fn builder() -> Builder {
        Builder {
            packs: Vec::new(),
            sink: default_failure_sink(),
        }
    }

    /// Looks a CPU up by id across all packs.
    pub fn get(&self, cpu_id: usize) -> Option<&Cpu> {
        self.cpus.iter().find(|cpu| cpu.id() == cpu_id)
    }

    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    pub fn pack(&self, pack_id: usize) -> Option<&Pack> {
        self.packs.get(pack_id)
    }

    pub fn packs(&self) -> &[Pack] {
        &self.packs
    }

    /// Spawns one named loop thread per CPU.
    pub fn start(&self) -> crate::error::Result<()> {
        let seeds: Vec<Seed> = self.seeds.lock().unwrap().drain(..).collect();
        let mut threads = self.threads.lock().unwrap();
        for seed in seeds {
            let Seed {
                cpu,
                inbox,
                selector,
                registry,
            } = seed;
            let id = cpu.id();
            let handle = std::thread::Builder::new()
                .name(format!("gale-cpu-{id}"))
                .spawn(move || EventLoop::new(cpu, inbox, selector, registry).run())
                .map_err(Failure::Io)?;
            threads.push(handle);
        }
        Ok(())
    }

    /// Halts every CPU and joins its thread. After this returns, every
    /// pending future has been failed with `Shutdown` and no callback
    /// will run again.
    pub fn halt(&self) {
        for cpu in &self.cpus {
            cpu.halt();
        }
        let threads: Vec<JoinHandle<()>> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            if let Err(e) = handle.join() {
                tracing::error!("cpu thread panicked: {e:?}");
            }
        }
    }
}

impl Drop for CpuSet {
    fn drop(&mut self) {
        self.halt();
    }
}

pub struct Builder {
    packs: Vec<Vec<usize>>,
    sink: FailureSink,
}

impl Builder {
    /// Adds a pack holding the given CPU ids.
    pub fn add_pack(mut self, cpu_ids: &[usize]) -> Builder {
        self.packs.push(cpu_ids.to_vec());
        self
    }

    /// Adds one pack spanning every available logical core.
    pub fn add_default_pack(self) -> Builder {
        let ids: Vec<usize> = (0..num_cpus::get()).collect();
        self.add_pack(&ids)
    }

    /// Replaces the default failure sink (a `tracing` logger) that
    /// receives failures with no future to land on.
    pub fn failure_sink(mut self, sink: impl Fn(Failure) + Send + Sync + 'static) -> Builder {
        self.sink = Arc::new(sink);
        self
    }

    pub fn build(self) -> crate::error::Result<CpuSet> {
        if self.packs.is_empty() {
            return Err(Failure::Invariant("topology needs at least one pack"));
        }
        let mut seen = HashSet::new();
        let mut packs = Vec::new();
        let mut cpus = Vec::new();
        let mut seeds = Vec::new();
        for (pack_id, ids) in self.packs.iter().enumerate() {
            if ids.is_empty() {
                return Err(Failure::Invariant("pack needs at least one cpu"));
            }
            let mut members = Vec::new();
            for &id in ids {
                if !seen.insert(id) {
                    return Err(Failure::Invariant("duplicate cpu id in topology"));
                }
                let (sender, inbox) =
                    crossbeam_channel::bounded(config::CROSS_CPU_CHANNEL_CAPACITY);
                let selector = Selector::new().map_err(Failure::Io)?;
                let waker = selector.waker().map_err(Failure::Io)?;
                let registry = selector.registry().map_err(Failure::Io)?;
                let cpu = Cpu::new(id, sender, waker, self.sink.clone());
                members.push(cpu.clone());
                cpus.push(cpu.clone());
                seeds.push(Seed {
                    cpu,
                    inbox,
                    selector,
                    registry,
                });
            }
            let pack = Pack {
                inner: Arc::new(PackInner {
                    id: pack_id,
                    cpus: members,
                }),
            };
            for cpu in pack.cpus() {
                cpu.attach_pack(pack.clone());
            }
            packs.push(pack);
        }
        tracing::info!(
            "built topology: {} packs, {} cpus",
            packs.len(),
            cpus.len()
        );
        Ok(CpuSet {
            packs,
            cpus,
            seeds: Mutex::new(seeds),
            threads: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_empty_topology() {
        assert!(CpuSet::builder().build().is_err());
        assert!(CpuSet::builder().add_pack(&[]).build().is_err());
        assert!(CpuSet::builder()
            .add_pack(&[0])
            .add_pack(&[0])
            .build()
            .is_err());
    }

    #[test]
    fn test_lookup_by_id_spans_packs() {
        let cpus = CpuSet::builder()
            .add_pack(&[0, 1])
            .add_pack(&[4, 5])
            .build()
            .unwrap();
        assert_eq!(cpus.cpus().len(), 4);
        assert_eq!(cpus.get(4).unwrap().id(), 4);
        assert_eq!(cpus.get(4).unwrap().pack().id(), 1);
        assert!(cpus.get(2).is_none());
    }

    #[test]
    fn test_random_placement_reaches_every_cpu() {
        let cpus = CpuSet::builder().add_pack(&[0, 1, 2]).build().unwrap();
        let pack = cpus.pack(0).unwrap();
        let mut hit = [false; 3];
        for _ in 0..200 {
            let idx = pack
                .cpus()
                .iter()
                .position(|c| c.id() == pack.get_cpu().id())
                .unwrap();
            hit[idx] = true;
        }
        assert_eq!(hit, [true, true, true]);
    }

    #[test]
    fn test_default_pack_uses_available_cores() {
        let cpus = CpuSet::builder().add_default_pack().build().unwrap();
        assert_eq!(cpus.cpus().len(), num_cpus::get());
    }
}
