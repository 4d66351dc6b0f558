//! In-memory fakes for every collaborator the session talks to, shared by
//! the integration tests. The fakes hand out `Arc` handles so tests can
//! inspect kernel-map state after the session took ownership.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use flamespy::bpf::bindings::{pid_config_t, sample_key_t, STACK_BYTES};
use flamespy::bpf::{BpfLoader, CountsBatch, KprobeHook, ObjectsError, ProfileObjects};
use flamespy::events::{EventRing, RingCloser, RingError, RingRecord};
use flamespy::metrics::Metrics;
use flamespy::python::PythonUnwinder;
use flamespy::session::{ProcInfo, ProfileSample};
use flamespy::symbols::{
    CacheOptions, CacheStats, ProcTable, Symbol, SymbolCache, SymbolResolver,
};
use flamespy::targets::{Target, TargetFinder, TargetsOptions};

/// Poll until `cond` holds; panics after two seconds.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Kernel objects

#[derive(Default)]
pub struct FakeBpf {
    pub pids: Mutex<HashMap<u32, pid_config_t>>,
    pub counts: Mutex<Vec<(sample_key_t, u64)>>,
    pub stacks: Mutex<HashMap<u32, Vec<u8>>>,
    pub ring: Mutex<Option<Sender<RingRecord>>>,
    pub perf_events: Mutex<Vec<u32>>,
    pub kprobes: Mutex<Vec<String>>,
}

impl FakeBpf {
    pub fn push_count(&self, pid: u32, user_stack: i64, kern_stack: i64, value: u64) {
        self.counts.lock().push((
            sample_key_t {
                pid,
                padding: 0,
                kern_stack,
                user_stack,
            },
            value,
        ));
    }

    pub fn push_stack(&self, stack_id: u32, ips: &[u64]) {
        let mut bytes = vec![0u8; STACK_BYTES];
        for (i, ip) in ips.iter().enumerate() {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&ip.to_le_bytes());
        }
        self.stacks.lock().insert(stack_id, bytes);
    }

    /// Injects one wire-format record into the events ring.
    pub fn send_event(&self, op: u32, pid: u32) {
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&op.to_le_bytes());
        data.extend_from_slice(&pid.to_le_bytes());
        let ring = self.ring.lock();
        ring.as_ref()
            .expect("events ring not open")
            .send(RingRecord { data, lost: 0 })
            .expect("events ring send");
    }
}

pub struct FakeLoader(pub Arc<FakeBpf>);

impl BpfLoader for FakeLoader {
    fn remove_memlock(&self) -> Result<(), ObjectsError> {
        Ok(())
    }

    fn load(&self) -> Result<Box<dyn ProfileObjects>, ObjectsError> {
        Ok(Box::new(FakeObjects(Arc::clone(&self.0))))
    }
}

pub struct FakeObjects(pub Arc<FakeBpf>);

impl ProfileObjects for FakeObjects {
    fn attach_perf_event(&mut self, cpu: u32, _sample_rate: u32) -> Result<(), ObjectsError> {
        self.0.perf_events.lock().push(cpu);
        Ok(())
    }

    fn attach_kprobe(&mut self, _hook: KprobeHook, symbol: &str) -> Result<(), ObjectsError> {
        self.0.kprobes.lock().push(symbol.to_string());
        Ok(())
    }

    fn detach_perf_events(&mut self) {
        self.0.perf_events.lock().clear();
    }

    fn detach_kprobes(&mut self) {
        self.0.kprobes.lock().clear();
    }

    fn open_events_ring(
        &mut self,
        _bytes: usize,
    ) -> Result<(Box<dyn EventRing>, RingCloser), ObjectsError> {
        let (tx, rx) = bounded(1024);
        *self.0.ring.lock() = Some(tx);
        let closer = RingCloser::new();
        Ok((
            Box::new(FakeRing {
                records: rx,
                closer: closer.clone(),
            }),
            closer,
        ))
    }

    fn update_pid_config(&self, pid: u32, config: pid_config_t) -> Result<(), ObjectsError> {
        self.0.pids.lock().insert(pid, config);
        Ok(())
    }

    fn delete_pid_config(&self, pid: u32) -> Result<(), ObjectsError> {
        match self.0.pids.lock().remove(&pid) {
            Some(_) => Ok(()),
            None => Err(ObjectsError::KeyNotFound),
        }
    }

    fn pid_configs(&self) -> Result<Vec<(u32, pid_config_t)>, ObjectsError> {
        Ok(self
            .0
            .pids
            .lock()
            .iter()
            .map(|(pid, config)| (*pid, *config))
            .collect())
    }

    fn drain_counts(&self) -> Result<CountsBatch, ObjectsError> {
        let counts = self.0.counts.lock();
        let mut batch = CountsBatch::default();
        for (key, value) in counts.iter() {
            batch.keys.push(*key);
            batch.values.push(*value);
        }
        Ok(batch)
    }

    fn clear_counts(&self, batch: &CountsBatch) -> Result<(), ObjectsError> {
        let drained: HashSet<sample_key_t> = batch.keys.iter().copied().collect();
        self.0
            .counts
            .lock()
            .retain(|(key, _)| !drained.contains(key));
        Ok(())
    }

    fn lookup_stack(&self, stack_id: i64) -> Option<Vec<u8>> {
        if stack_id < 0 {
            return None;
        }
        self.0.stacks.lock().get(&(stack_id as u32)).cloned()
    }

    fn stack_ids(&self) -> Result<Vec<u32>, ObjectsError> {
        Ok(self.0.stacks.lock().keys().copied().collect())
    }

    fn delete_stack(&self, stack_id: u32) -> Result<(), ObjectsError> {
        match self.0.stacks.lock().remove(&stack_id) {
            Some(_) => Ok(()),
            None => Err(ObjectsError::KeyNotFound),
        }
    }
}

pub struct FakeRing {
    records: Receiver<RingRecord>,
    closer: RingCloser,
}

impl EventRing for FakeRing {
    fn read(&mut self) -> Result<RingRecord, RingError> {
        loop {
            if self.closer.is_closed() {
                return Err(RingError::Closed);
            }
            match self.records.recv_timeout(Duration::from_millis(10)) {
                Ok(record) => return Ok(record),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(RingError::Closed),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Target finder

#[derive(Default)]
pub struct FakeTargetFinder {
    pub targets: Mutex<HashMap<u32, Arc<Target>>>,
    pub removed: Mutex<Vec<u32>>,
}

impl FakeTargetFinder {
    pub fn set_target(&self, pid: u32, service_name: &str) {
        self.targets
            .lock()
            .insert(pid, Arc::new(Target::service(service_name)));
    }
}

impl TargetFinder for FakeTargetFinder {
    fn find_target(&self, pid: u32) -> Option<Arc<Target>> {
        self.targets.lock().get(&pid).cloned()
    }

    fn update(&self, _options: &TargetsOptions) {}

    fn remove_dead_pid(&self, pid: u32) {
        self.targets.lock().remove(&pid);
        self.removed.lock().push(pid);
    }
}

// ---------------------------------------------------------------------------
// Symbol cache

#[derive(Default)]
pub struct SymbolCacheShared {
    pub symbols: Mutex<HashMap<u64, Symbol>>,
    pub kernel_symbols: Mutex<HashMap<u64, Symbol>>,
    pub error_pids: Mutex<HashSet<u32>>,
    pub removed: Mutex<Vec<u32>>,
    pub rounds: AtomicU64,
    pub cleanups: AtomicU64,
}

impl SymbolCacheShared {
    pub fn name_address(&self, address: u64, name: &str) {
        self.symbols.lock().insert(
            address,
            Symbol {
                name: name.to_string(),
                module: "app".to_string(),
                start: address,
            },
        );
    }
}

pub struct FakeSymbolCache {
    shared: Arc<SymbolCacheShared>,
    proc_scratch: FakeProcTable,
    kernel: SharedKernelResolver,
}

impl FakeSymbolCache {
    pub fn new(shared: Arc<SymbolCacheShared>) -> Self {
        Self {
            proc_scratch: FakeProcTable {
                pid: 0,
                error: None,
                shared: Arc::clone(&shared),
            },
            kernel: SharedKernelResolver(Arc::clone(&shared)),
            shared,
        }
    }
}

impl SymbolCache for FakeSymbolCache {
    fn next_round(&mut self) {
        self.shared.rounds.fetch_add(1, Ordering::Relaxed);
    }

    fn proc_table(&mut self, pid: u32) -> &dyn ProcTable {
        self.proc_scratch.pid = pid;
        self.proc_scratch.error = if self.shared.error_pids.lock().contains(&pid) {
            Some(anyhow!("no symbol tables for pid {pid}"))
        } else {
            None
        };
        &self.proc_scratch
    }

    fn kallsyms(&mut self) -> &dyn SymbolResolver {
        &self.kernel
    }

    fn remove_dead_pid(&mut self, pid: u32) {
        self.shared.removed.lock().push(pid);
    }

    fn cleanup(&mut self) {
        self.shared.cleanups.fetch_add(1, Ordering::Relaxed);
    }

    fn update_options(&mut self, _options: &CacheOptions) {}

    fn stats(&self) -> CacheStats {
        CacheStats {
            proc_tables: self.shared.symbols.lock().len(),
            kernel_symbols: self.shared.kernel_symbols.lock().len(),
            round: self.shared.rounds.load(Ordering::Relaxed),
        }
    }
}

pub struct FakeProcTable {
    pid: u32,
    error: Option<anyhow::Error>,
    shared: Arc<SymbolCacheShared>,
}

impl SymbolResolver for FakeProcTable {
    fn resolve(&self, address: u64) -> Symbol {
        self.shared
            .symbols
            .lock()
            .get(&address)
            .cloned()
            .unwrap_or_default()
    }
}

impl ProcTable for FakeProcTable {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }
}

pub struct SharedKernelResolver(Arc<SymbolCacheShared>);

impl SymbolResolver for SharedKernelResolver {
    fn resolve(&self, address: u64) -> Symbol {
        self.0
            .kernel_symbols
            .lock()
            .get(&address)
            .cloned()
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Python unwinder

#[derive(Default)]
pub struct FakePython {
    pub fail_collect: bool,
    pub started: Mutex<Vec<u32>>,
    pub removed: Mutex<Vec<u32>>,
    pub closed: AtomicBool,
}

impl PythonUnwinder for FakePython {
    fn start(&self, pid: u32, _target: &Target, _info: &ProcInfo) -> anyhow::Result<()> {
        self.started.lock().push(pid);
        Ok(())
    }

    fn collect(&self, _sink: &mut dyn FnMut(ProfileSample<'_>)) -> anyhow::Result<()> {
        if self.fail_collect {
            return Err(anyhow!("python unwinder wedged"));
        }
        Ok(())
    }

    fn remove_dead_pid(&self, pid: u32) {
        self.removed.lock().push(pid);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Metrics

#[derive(Default)]
pub struct CountingMetrics {
    pub known: AtomicU64,
    pub unknown_symbols: AtomicU64,
    pub unknown_modules: AtomicU64,
    pub unknown_stacks: AtomicU64,
}

impl Metrics for CountingMetrics {
    fn known_symbols(&self, _service_name: &str, count: u64) {
        self.known.fetch_add(count, Ordering::Relaxed);
    }

    fn unknown_symbols(&self, _service_name: &str, count: u64) {
        self.unknown_symbols.fetch_add(count, Ordering::Relaxed);
    }

    fn unknown_modules(&self, _service_name: &str, count: u64) {
        self.unknown_modules.fetch_add(count, Ordering::Relaxed);
    }

    fn unknown_stack(&self, _service_name: &str) {
        self.unknown_stacks.fetch_add(1, Ordering::Relaxed);
    }
}
