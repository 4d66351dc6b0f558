//! The seam between the session and the loaded eBPF profiler objects.
//!
//! The session drives the kernel side exclusively through [`BpfLoader`] and
//! [`ProfileObjects`]; the production implementation in [`system`] loads a
//! compiled object file with libbpf, while tests substitute in-memory fakes.

pub mod bindings;
pub mod system;

use thiserror::Error;

use crate::events::{EventRing, RingCloser};
use bindings::{pid_config_t, sample_key_t};

/// How the profiler walks a process, stored per pid in the kernel pids map.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilingType {
    /// The kernel told us about the pid but no target claims it yet.
    Unknown = 0,
    /// Native frame-pointer walk.
    FramePointers = 1,
    /// Interpreter walk owned by the python unwinder.
    Python = 2,
    /// Classification failed; the pid is parked until it dies.
    Error = 3,
}

/// Which kernel program a kprobe attachment points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KprobeHook {
    Exec,
    DisassociateCtty,
}

/// One drained snapshot of the kernel counts map.
///
/// The retained keys double as the deletion cursor: [`ProfileObjects::clear_counts`]
/// removes exactly these entries, leaving anything the kernel inserted after
/// the drain for the next round.
#[derive(Debug, Default)]
pub struct CountsBatch {
    pub keys: Vec<sample_key_t>,
    pub values: Vec<u64>,
}

impl CountsBatch {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&sample_key_t, u64)> {
        self.keys.iter().zip(self.values.iter().copied())
    }
}

#[derive(Debug, Error)]
pub enum ObjectsError {
    #[error("key not found")]
    KeyNotFound,
    #[error("program {0} missing from the loaded object")]
    MissingProgram(&'static str),
    #[error("map {0} missing from the loaded object")]
    MissingMap(&'static str),
    #[error("perf event open: {0}")]
    PerfEventOpen(#[source] std::io::Error),
    #[error(transparent)]
    Bpf(#[from] libbpf_rs::Error),
    #[error(transparent)]
    Os(#[from] std::io::Error),
}

/// Produces loaded profiler objects when the session starts.
///
/// Loading happens per start so a stopped session holds no kernel resources.
pub trait BpfLoader: Send {
    /// Raise `RLIMIT_MEMLOCK` so map creation does not fail on kernels
    /// without memcg-based accounting.
    fn remove_memlock(&self) -> Result<(), ObjectsError>;

    fn load(&self) -> Result<Box<dyn ProfileObjects>, ObjectsError>;
}

/// Loaded profiler programs plus the maps the session drives.
///
/// Map semantics: `pids` is written by user space and read by the kernel;
/// `counts` and `stacks` are written by the kernel and drained/cleared by
/// user space once per round; `events` is a kernel-to-user ring of
/// [`bindings::pid_event_t`] records.
pub trait ProfileObjects: Send {
    /// Attach the sampling program to `cpu` at `sample_rate` Hz.
    fn attach_perf_event(&mut self, cpu: u32, sample_rate: u32) -> Result<(), ObjectsError>;

    /// Attach the program selected by `hook` to the kernel symbol `symbol`.
    fn attach_kprobe(&mut self, hook: KprobeHook, symbol: &str) -> Result<(), ObjectsError>;

    fn detach_perf_events(&mut self);

    fn detach_kprobes(&mut self);

    /// Open the events ring sized to roughly `bytes`. The returned closer is
    /// the shutdown signal: closing it makes pending and future reads return
    /// [`crate::events::RingError::Closed`].
    fn open_events_ring(
        &mut self,
        bytes: usize,
    ) -> Result<(Box<dyn EventRing>, RingCloser), ObjectsError>;

    fn update_pid_config(&self, pid: u32, config: pid_config_t) -> Result<(), ObjectsError>;

    /// Deleting an absent pid reports [`ObjectsError::KeyNotFound`].
    fn delete_pid_config(&self, pid: u32) -> Result<(), ObjectsError>;

    fn pid_configs(&self) -> Result<Vec<(u32, pid_config_t)>, ObjectsError>;

    fn drain_counts(&self) -> Result<CountsBatch, ObjectsError>;

    /// Delete exactly the entries captured in `batch`.
    fn clear_counts(&self, batch: &CountsBatch) -> Result<(), ObjectsError>;

    /// Stack bytes for a non-negative stack id, [`bindings::STACK_BYTES`] long.
    fn lookup_stack(&self, stack_id: i64) -> Option<Vec<u8>>;

    fn stack_ids(&self) -> Result<Vec<u32>, ObjectsError>;

    fn delete_stack(&self, stack_id: u32) -> Result<(), ObjectsError>;
}
