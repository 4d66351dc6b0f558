//! The profiling session: owns the loaded kernel objects, reacts to process
//! lifecycle events, classifies pids, and harvests stack counts into the
//! caller's sink.
//!
//! One session exists per host agent; there is a single kernel sampling
//! surface to own. A [`Session`] is a cheap cloneable handle, shared between
//! the embedder and the background workers.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use procfs::process::Process;
use procfs::ProcError;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::bpf::bindings::pid_config_t;
use crate::bpf::{BpfLoader, KprobeHook, ObjectsError, ProfileObjects, ProfilingType};
use crate::events::{run_reader, EventQueues, RingCloser};
use crate::metrics::Metrics;
use crate::python::PythonUnwinder;
use crate::stack::{walk_stack, FrameFormat, StackBuilder, StackResolveStats};
use crate::symbols::{CacheOptions, CacheStats, SymbolCache};
use crate::targets::{Target, TargetFinder, TargetsOptions};
use crate::util::{get_online_cpus, syscall_prefix};

/// Capacity of each pid event queue; overflow is dropped and logged.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// The stale-pid reaper runs every this many harvest rounds.
const STALE_PID_CHECK_ROUNDS: u64 = 10;

#[derive(Clone)]
pub struct SessionOptions {
    /// Walk and emit user stacks.
    pub collect_user: bool,
    /// Walk and emit kernel stacks.
    pub collect_kernel: bool,
    /// Render unknown symbols as `module+hex(start)` instead of the module.
    pub unknown_symbol_module_offset: bool,
    /// Render unresolved addresses as `hex(ip)` instead of `[unknown]`.
    pub unknown_symbol_address: bool,
    /// Route python-looking processes to the python unwinder.
    pub python_enabled: bool,
    /// Per-CPU sampling frequency in Hz; applied when the session starts.
    pub sample_rate: u32,
    /// Forwarded to the symbol cache on every `update`.
    pub cache_options: CacheOptions,
    pub metrics: Option<Arc<dyn Metrics>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            collect_user: true,
            collect_kernel: true,
            unknown_symbol_module_offset: false,
            unknown_symbol_address: false,
            python_enabled: false,
            sample_rate: 97,
            cache_options: CacheOptions::default(),
            metrics: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleAggregation {
    /// The kernel accumulated the count; the value carries the multiplicity.
    Aggregated,
    /// Streamed to user space one event at a time with a value of one.
    NotAggregated,
}

/// One harvested sample handed to the `collect_profiles` sink. Frames are
/// ordered leaf first; the final entry is the process comm.
pub struct ProfileSample<'a> {
    pub target: &'a Target,
    pub stack: &'a [String],
    pub value: u64,
    pub pid: u32,
    pub aggregation: SampleAggregation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: u32,
    pub comm: String,
    /// Basename of the exe symlink.
    pub exe: String,
    pub classification: ProfilingType,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already started")]
    AlreadyStarted,
    #[error("session not started")]
    NotStarted,
    #[error("remove memlock rlimit: {0}")]
    Rlimit(#[source] ObjectsError),
    #[error("load bpf objects: {0}")]
    LoadObjects(#[source] ObjectsError),
    #[error("open events ring: {0}")]
    OpenEventsRing(#[source] ObjectsError),
    #[error("enumerate online cpus: {0}")]
    OnlineCpus(#[source] anyhow::Error),
    #[error("attach perf event on cpu {cpu}: {source}")]
    AttachPerfEvent { cpu: u32, source: ObjectsError },
    #[error("attach kprobe {symbol}: {source}")]
    AttachKprobe {
        symbol: String,
        source: ObjectsError,
    },
    #[error("drain counts map: {0}")]
    DrainCounts(#[source] ObjectsError),
    #[error("clear counts map: {0}")]
    ClearCounts(#[source] ObjectsError),
    #[error("clear stacks map: {0}")]
    ClearStacks(#[source] ObjectsError),
    #[error("collect python profile: {0}")]
    Python(#[source] anyhow::Error),
}

#[derive(Debug, Default)]
struct PidTable {
    /// Every pid the kernel told us about that is profiling or waiting for
    /// a target. Superset of `unknown`.
    all: HashMap<u32, ProcInfo>,
    /// Pids the target finder does not currently claim; rechecked on
    /// `update_targets` and during cleanup.
    unknown: HashSet<u32>,
    /// Pids reported dead since the last cleanup. A dead pid outranks every
    /// other state at harvest time.
    dead: HashSet<u32>,
}

struct SessionState {
    options: SessionOptions,
    loader: Box<dyn BpfLoader>,
    objects: Option<Box<dyn ProfileObjects>>,
    sym_cache: Box<dyn SymbolCache>,
    ring_closer: Option<RingCloser>,
    info_queue: Option<Sender<u32>>,
    exec_queue: Option<Sender<u32>>,
    dead_queue: Option<Sender<u32>>,
    pids: PidTable,
    round_number: u64,
    started: bool,
}

/// Continuous CPU profiling session.
///
/// `start` attaches the sampling program to every online CPU and spawns the
/// background workers; `collect_profiles` is the blocking foreground harvest
/// the embedder invokes on its own cadence; `stop` tears kernel resources
/// down in a fixed order and joins the workers.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    target_finder: Arc<dyn TargetFinder>,
    python: Option<Arc<dyn PythonUnwinder>>,
    /// Guards every field of [`SessionState`]. Never held across a queue
    /// send, a blocking ring read, or the python unwinder's start routine.
    state: Mutex<SessionState>,
    /// Joined by `stop` with the state lock released.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDebugInfo {
    pub started: bool,
    pub round_number: u64,
    pub cache: CacheStats,
    pub pids: PidsDebugInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct PidsDebugInfo {
    pub all: Vec<u32>,
    pub unknown: Vec<u32>,
    pub dead: Vec<u32>,
}

impl Session {
    /// Builds a stopped session. `python` enables the interpreter pass; the
    /// unwinder owns its own kernel objects and pid configuration.
    pub fn new(
        target_finder: Arc<dyn TargetFinder>,
        symbol_cache: Box<dyn SymbolCache>,
        loader: Box<dyn BpfLoader>,
        python: Option<Arc<dyn PythonUnwinder>>,
        options: SessionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                target_finder,
                python,
                state: Mutex::new(SessionState {
                    options,
                    loader,
                    objects: None,
                    sym_cache: symbol_cache,
                    ring_closer: None,
                    info_queue: None,
                    exec_queue: None,
                    dead_queue: None,
                    pids: PidTable::default(),
                    round_number: 0,
                    started: false,
                }),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn start(&self) -> Result<(), SessionError> {
        SessionInner::start(&self.inner)
    }

    /// Safe to call any number of times; a stopped session is a no-op.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Merges in new options. Sample-rate changes take effect on the next
    /// `stop`/`start` cycle; everything else applies immediately.
    pub fn update(&self, options: SessionOptions) -> Result<(), SessionError> {
        self.inner.update(options)
    }

    /// Refreshes service discovery, then retries every pid currently parked
    /// as unknown.
    pub fn update_targets(&self, options: &TargetsOptions) {
        SessionInner::update_targets(&self.inner, options);
    }

    /// Blocking harvest of one round; see the module docs for the protocol.
    pub fn collect_profiles(
        &self,
        sink: &mut dyn FnMut(ProfileSample<'_>),
    ) -> Result<(), SessionError> {
        self.inner.collect_profiles(sink)
    }

    pub fn debug_info(&self) -> SessionDebugInfo {
        self.inner.debug_info()
    }
}

impl SessionInner {
    fn start(this: &Arc<Self>) -> Result<(), SessionError> {
        let mut state = this.state.lock();
        if state.started {
            return Err(SessionError::AlreadyStarted);
        }
        if let Err(err) = Self::start_locked(this, &mut state) {
            Self::stop_locked(&mut state, this.python.as_deref());
            return Err(err);
        }
        Ok(())
    }

    fn start_locked(this: &Arc<Self>, state: &mut SessionState) -> Result<(), SessionError> {
        state.loader.remove_memlock().map_err(SessionError::Rlimit)?;
        let mut objects = state.loader.load().map_err(SessionError::LoadObjects)?;

        let (ring, ring_closer) = objects
            .open_events_ring(4 * page_size::get())
            .map_err(SessionError::OpenEventsRing)?;

        let sample_rate = state.options.sample_rate;
        for cpu in get_online_cpus().map_err(SessionError::OnlineCpus)? {
            objects
                .attach_perf_event(cpu, sample_rate)
                .map_err(|source| SessionError::AttachPerfEvent { cpu, source })?;
        }

        for (hook, symbol, required) in kprobe_hooks() {
            match objects.attach_kprobe(hook, &symbol) {
                Ok(()) => {}
                Err(source) if required => {
                    return Err(SessionError::AttachKprobe { symbol, source });
                }
                Err(err) => error!("attaching kprobe {symbol}: {err}"),
            }
        }

        let (info_tx, info_rx) = bounded(EVENT_QUEUE_CAPACITY);
        let (exec_tx, exec_rx) = bounded(EVENT_QUEUE_CAPACITY);
        let (dead_tx, dead_rx) = bounded(EVENT_QUEUE_CAPACITY);

        state.objects = Some(objects);
        state.ring_closer = Some(ring_closer);
        state.info_queue = Some(info_tx.clone());
        state.exec_queue = Some(exec_tx.clone());
        state.dead_queue = Some(dead_tx.clone());
        state.started = true;

        let queues = EventQueues {
            info: info_tx,
            exec: exec_tx,
            dead: dead_tx,
        };
        let mut workers = this.workers.lock();
        workers.push(thread::spawn(move || run_reader(ring, queues)));
        let session = Arc::clone(this);
        workers.push(thread::spawn(move || {
            session.process_info_requests(info_rx, "info")
        }));
        let session = Arc::clone(this);
        workers.push(thread::spawn(move || {
            session.process_info_requests(exec_rx, "exec")
        }));
        let session = Arc::clone(this);
        workers.push(thread::spawn(move || session.process_dead_pids(dead_rx)));
        Ok(())
    }

    fn stop(&self) {
        {
            let mut state = self.state.lock();
            Self::stop_locked(&mut state, self.python.as_deref());
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("profiling worker panicked");
            }
        }
    }

    /// Teardown in a fixed order: perf events, kprobes, objects, python,
    /// events ring, queues. Shared between `stop` and a failed `start`.
    fn stop_locked(state: &mut SessionState, python: Option<&dyn PythonUnwinder>) {
        if let Some(objects) = state.objects.as_mut() {
            objects.detach_perf_events();
            objects.detach_kprobes();
        }
        state.objects = None;
        if let Some(python) = python {
            python.close();
        }
        if let Some(closer) = state.ring_closer.take() {
            closer.close();
        }
        // Dropping the senders closes the queues once the reader exits and
        // releases its clones.
        state.info_queue = None;
        state.exec_queue = None;
        state.dead_queue = None;
        state.started = false;
    }

    fn update(&self, options: SessionOptions) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        state.sym_cache.update_options(&options.cache_options);
        state.options = options;
        Ok(())
    }

    fn update_targets(this: &Arc<Self>, options: &TargetsOptions) {
        // The finder synchronizes itself; keep the state lock out of it.
        this.target_finder.update(options);

        let mut state = this.state.lock();
        let unknown: Vec<u32> = state.pids.unknown.iter().copied().collect();
        for pid in unknown {
            let Some(target) = this.target_finder.find_target(pid) else {
                continue;
            };
            Self::start_profiling(this, &mut state, pid, &target);
            state.pids.unknown.remove(&pid);
        }
    }

    fn collect_profiles(
        &self,
        sink: &mut dyn FnMut(ProfileSample<'_>),
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if !state.started {
            return Err(SessionError::NotStarted);
        }

        state.sym_cache.next_round();
        state.round_number += 1;

        if let Some(python) = self.python.as_deref() {
            python.collect(sink).map_err(SessionError::Python)?;
        }
        self.collect_regular_profile(&mut state, sink)?;
        self.cleanup(&mut state);
        Ok(())
    }

    fn collect_regular_profile(
        &self,
        state: &mut SessionState,
        sink: &mut dyn FnMut(ProfileSample<'_>),
    ) -> Result<(), SessionError> {
        let SessionState {
            objects,
            sym_cache,
            pids,
            options,
            ..
        } = state;
        let Some(objects) = objects.as_deref() else {
            return Err(SessionError::NotStarted);
        };

        let batch = objects.drain_counts().map_err(SessionError::DrainCounts)?;
        let mut known_stacks: HashSet<u32> = HashSet::new();
        let mut builder = StackBuilder::default();
        let format = FrameFormat {
            module_offset: options.unknown_symbol_module_offset,
            raw_address: options.unknown_symbol_address,
        };

        for (key, value) in batch.entries() {
            if key.user_stack >= 0 {
                known_stacks.insert(key.user_stack as u32);
            }
            if key.kern_stack >= 0 {
                known_stacks.insert(key.kern_stack as u32);
            }

            let Some(target) = self.target_finder.find_target(key.pid) else {
                continue;
            };
            if pids.dead.contains(&key.pid) {
                continue;
            }

            let table = sym_cache.proc_table(key.pid);
            if let Some(err) = table.error() {
                // Resolution would fail for every frame; drop the process
                // now and let cleanup reap it this same round.
                debug!("proc table for pid {}: {err}", table.pid());
                let errored = table.pid();
                pids.dead.insert(errored);
                continue;
            }

            builder.reset();
            builder.push(comm(pids, key.pid));
            let mut stats = StackResolveStats::default();
            if options.collect_user {
                let user_stack = objects.lookup_stack(key.user_stack);
                walk_stack(
                    &mut builder,
                    user_stack.as_deref().unwrap_or_default(),
                    table,
                    format,
                    &mut stats,
                );
            }
            if options.collect_kernel {
                let kern_stack = objects.lookup_stack(key.kern_stack);
                walk_stack(
                    &mut builder,
                    kern_stack.as_deref().unwrap_or_default(),
                    sym_cache.kallsyms(),
                    format,
                    &mut stats,
                );
            }
            if builder.len() == 1 {
                // Nothing beyond the comm.
                continue;
            }
            builder.reverse();
            sink(ProfileSample {
                target: &target,
                stack: builder.frames(),
                value,
                pid: key.pid,
                aggregation: SampleAggregation::Aggregated,
            });
            record_metrics(options, &target, &stats, &builder);
        }

        objects
            .clear_counts(&batch)
            .map_err(SessionError::ClearCounts)?;

        for stack_id in objects.stack_ids().map_err(SessionError::ClearStacks)? {
            if known_stacks.contains(&stack_id) {
                continue;
            }
            match objects.delete_stack(stack_id) {
                Ok(()) | Err(ObjectsError::KeyNotFound) => {}
                Err(err) => return Err(SessionError::ClearStacks(err)),
            }
        }
        Ok(())
    }

    fn cleanup(&self, state: &mut SessionState) {
        let SessionState {
            objects,
            sym_cache,
            pids,
            round_number,
            ..
        } = state;
        let objects = objects.as_deref();

        sym_cache.cleanup();

        let dead: Vec<u32> = pids.dead.drain().collect();
        for pid in dead {
            debug!("cleaning up dead pid {pid}");
            pids.unknown.remove(&pid);
            pids.all.remove(&pid);
            sym_cache.remove_dead_pid(pid);
            if let Some(python) = self.python.as_deref() {
                python.remove_dead_pid(pid);
            }
            if let Some(objects) = objects {
                delete_pid_config(objects, pid);
            }
            self.target_finder.remove_dead_pid(pid);
        }

        let unknown: Vec<u32> = pids.unknown.iter().copied().collect();
        for pid in unknown {
            match Process::new(pid as i32) {
                Ok(_) => {}
                Err(err) => {
                    if !matches!(err, ProcError::NotFound(_)) {
                        error!("checking /proc for pid {pid}: {err}");
                    }
                    pids.unknown.remove(&pid);
                    pids.all.remove(&pid);
                    if let Some(objects) = objects {
                        delete_pid_config(objects, pid);
                    }
                }
            }
        }

        if *round_number % STALE_PID_CHECK_ROUNDS == 0 {
            if let Some(objects) = objects {
                check_stale_pids(objects);
            }
        }
    }

    fn debug_info(&self) -> SessionDebugInfo {
        let state = self.state.lock();
        let mut all: Vec<u32> = state.pids.all.keys().copied().collect();
        let mut unknown: Vec<u32> = state.pids.unknown.iter().copied().collect();
        let mut dead: Vec<u32> = state.pids.dead.iter().copied().collect();
        all.sort_unstable();
        unknown.sort_unstable();
        dead.sort_unstable();
        SessionDebugInfo {
            started: state.started,
            round_number: state.round_number,
            cache: state.sym_cache.stats(),
            pids: PidsDebugInfo { all, unknown, dead },
        }
    }

    /// Shared body of the info and exec processors; `kind` only changes the
    /// log lines.
    fn process_info_requests(self: Arc<Self>, requests: Receiver<u32>, kind: &'static str) {
        for pid in requests.iter() {
            // Look the target up before taking the lock; the finder has its
            // own synchronization.
            let target = self.target_finder.find_target(pid);
            debug!("pid {kind} request for pid {pid}");

            let mut state = self.state.lock();
            if state.pids.dead.contains(&pid) {
                debug!("pid {kind} request for dead pid {pid}");
                continue;
            }
            match target {
                None => save_unknown_pid(&mut state, pid),
                Some(target) => Self::start_profiling(&self, &mut state, pid, &target),
            }
        }
    }

    fn process_dead_pids(self: Arc<Self>, dead: Receiver<u32>) {
        for pid in dead.iter() {
            debug!("pid {pid} is dead");
            let mut state = self.state.lock();
            // Keep the pid flagged until the next cleanup so a harvest in
            // between still ignores its in-flight samples.
            state.pids.dead.insert(pid);
        }
    }

    fn start_profiling(this: &Arc<Self>, state: &mut SessionState, pid: u32, target: &Arc<Target>) {
        if !state.started {
            return;
        }
        let python_active = state.options.python_enabled && this.python.is_some();
        let info = classify_process(pid, python_active);
        if info.classification == ProfilingType::Python {
            // Interpreter discovery reads remote process memory; keep it off
            // the event-processing path. The python unwinder writes the
            // kernel pid config for its own pids.
            let session = Arc::clone(this);
            let target = Arc::clone(target);
            thread::spawn(move || session.start_python_profiling(pid, target, info));
            return;
        }
        set_pid_config(state, pid, info);
    }

    fn start_python_profiling(self: Arc<Self>, pid: u32, target: Arc<Target>, info: ProcInfo) {
        let Some(python) = self.python.as_deref() else {
            return;
        };
        {
            let state = self.state.lock();
            if !state.started || state.pids.dead.contains(&pid) {
                return;
            }
        }
        if let Err(err) = python.start(pid, &target, &info) {
            warn!("starting python unwinding for pid {pid}: {err}");
            let mut state = self.state.lock();
            state.pids.dead.insert(pid);
            return;
        }
        let mut state = self.state.lock();
        if !state.started {
            return;
        }
        state.pids.all.insert(pid, info);
    }
}

/// The kprobes the session needs: process death is mandatory, the exec
/// hooks are best effort.
fn kprobe_hooks() -> Vec<(KprobeHook, String, bool)> {
    let prefix = syscall_prefix();
    vec![
        (
            KprobeHook::DisassociateCtty,
            "disassociate_ctty".to_string(),
            true,
        ),
        (KprobeHook::Exec, format!("{prefix}sys_execve"), false),
        (KprobeHook::Exec, format!("{prefix}sys_execveat"), false),
    ]
}

fn comm(pids: &PidTable, pid: u32) -> String {
    match pids.all.get(&pid) {
        Some(info) if !info.comm.is_empty() => info.comm.clone(),
        _ => "pid_unknown".to_string(),
    }
}

fn save_unknown_pid(state: &mut SessionState, pid: u32) {
    state.pids.unknown.insert(pid);
    // The placeholder keeps the pid visible in `all` until discovery claims
    // it or cleanup notices the process is gone.
    state.pids.all.entry(pid).or_insert_with(|| ProcInfo {
        pid,
        comm: String::new(),
        exe: String::new(),
        classification: ProfilingType::Unknown,
    });
}

fn set_pid_config(state: &mut SessionState, pid: u32, info: ProcInfo) {
    let config = pid_config_t {
        profiling_type: info.classification as u8,
        collect_user: u8::from(state.options.collect_user),
        collect_kernel: u8::from(state.options.collect_kernel),
        padding: 0,
    };
    state.pids.all.insert(pid, info);
    if let Some(objects) = state.objects.as_deref() {
        if let Err(err) = objects.update_pid_config(pid, config) {
            // The kernel will ask about this pid again; retry then.
            error!("updating pid config for pid {pid}: {err}");
        }
    }
}

fn classify_process(pid: u32, python_active: bool) -> ProcInfo {
    match read_process_identity(pid) {
        Ok((exe, comm)) => ProcInfo {
            pid,
            classification: classification_for(&exe, python_active),
            comm,
            exe,
        },
        Err(err) => {
            if matches!(err, ProcError::NotFound(_)) {
                debug!("classifying pid {pid}: {err}");
            } else {
                error!("classifying pid {pid}: {err}");
            }
            ProcInfo {
                pid,
                comm: String::new(),
                exe: String::new(),
                classification: ProfilingType::Error,
            }
        }
    }
}

fn classification_for(exe: &str, python_active: bool) -> ProfilingType {
    if python_active && (exe.starts_with("python") || exe == "uwsgi") {
        ProfilingType::Python
    } else {
        ProfilingType::FramePointers
    }
}

fn read_process_identity(pid: u32) -> Result<(String, String), ProcError> {
    let process = Process::new(pid as i32)?;
    let exe = process.exe()?;
    let comm = process.stat()?.comm;
    let exe = exe
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok((exe, comm.trim_end().to_string()))
}

fn delete_pid_config(objects: &dyn ProfileObjects, pid: u32) {
    match objects.delete_pid_config(pid) {
        Ok(()) | Err(ObjectsError::KeyNotFound) => {}
        Err(err) => error!("deleting pid config for pid {pid}: {err}"),
    }
}

/// Defensive sweep for processes whose death never produced a ring event,
/// e.g. when the ctty hook missed them.
fn check_stale_pids(objects: &dyn ProfileObjects) {
    let configs = match objects.pid_configs() {
        Ok(configs) => configs,
        Err(err) => {
            error!("iterating pid configs: {err}");
            return;
        }
    };
    debug!("checking {} pids for staleness", configs.len());
    for (pid, _) in configs {
        match fs::metadata(format!("/proc/{pid}/status")) {
            Ok(_) => {}
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    error!("checking /proc/{pid}/status: {err}");
                }
                delete_pid_config(objects, pid);
                debug!("stale pid {pid} removed");
            }
        }
    }
}

fn record_metrics(
    options: &SessionOptions,
    target: &Target,
    stats: &StackResolveStats,
    builder: &StackBuilder,
) {
    let Some(metrics) = options.metrics.as_deref() else {
        return;
    };
    let service_name = target.service_name();
    metrics.known_symbols(service_name, stats.known.into());
    metrics.unknown_symbols(service_name, stats.unknown_symbols.into());
    metrics.unknown_modules(service_name, stats.unknown_modules.into());
    if builder.len() > 2 && stats.unknown_symbols + stats.unknown_modules > stats.known {
        metrics.unknown_stack(service_name);
    }
}
