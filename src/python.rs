//! Interpreter-unwinding seam for python workloads.

use crate::session::{ProcInfo, ProfileSample};
use crate::targets::Target;

/// A user-space unwinder for python interpreter stacks.
///
/// Implementations own their eBPF objects and the kernel pid configuration
/// for the pids they unwind; the session only routes lifecycle and harvest
/// calls. All methods must tolerate concurrent callers, and `close` must be
/// idempotent.
pub trait PythonUnwinder: Send + Sync {
    /// Begin unwinding `pid`. May block while discovering interpreter
    /// offsets in remote process memory; the session calls this from a
    /// detached thread with no locks held.
    fn start(&self, pid: u32, target: &Target, info: &ProcInfo) -> anyhow::Result<()>;

    /// Emit the interpreter samples gathered since the previous round, each
    /// with a value of one.
    fn collect(&self, sink: &mut dyn FnMut(ProfileSample<'_>)) -> anyhow::Result<()>;

    fn remove_dead_pid(&self, pid: u32);

    fn close(&self);
}
