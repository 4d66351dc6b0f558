mod cpu;

pub use cpu::get_online_cpus;

/// Symbol prefix for architecture-specific syscall entry points, used when
/// attaching the exec kprobes.
#[cfg(target_arch = "x86_64")]
pub fn syscall_prefix() -> &'static str {
    "__x64_"
}

#[cfg(not(target_arch = "x86_64"))]
pub fn syscall_prefix() -> &'static str {
    "__arm64_"
}
