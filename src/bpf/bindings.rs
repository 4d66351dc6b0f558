#![allow(non_camel_case_types)]

//! Raw types shared with the kernel-side profiler programs. Layouts mirror
//! the structs in the BPF C sources; padding is spelled out so the Rust and
//! C sides agree byte for byte.

use plain::Plain;

/// Maximum call-chain depth the kernel captures per stack.
pub const MAX_STACK_DEPTH: usize = 127;

/// Size in bytes of one entry of the stacks map.
pub const STACK_BYTES: usize = MAX_STACK_DEPTH * 8;

/// Ops carried by [`pid_event_t`] records on the events ring.
pub const PID_OP_REQUEST_UNKNOWN_PROCESS_INFO: u32 = 1;
pub const PID_OP_DEAD: u32 = 2;
pub const PID_OP_REQUEST_EXEC_PROCESS_INFO: u32 = 3;

/// Per-pid profiling configuration, keyed by pid in the pids map. User space
/// is the only writer.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct pid_config_t {
    pub profiling_type: u8,
    pub collect_user: u8,
    pub collect_kernel: u8,
    pub padding: u8,
}

/// Key of the counts map. Negative stack ids mean the kernel could not
/// capture that side of the stack.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct sample_key_t {
    pub pid: u32,
    pub padding: u32,
    pub kern_stack: i64,
    pub user_stack: i64,
}

/// One lifecycle notification pushed over the events ring, little-endian on
/// the wire.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct pid_event_t {
    pub op: u32,
    pub pid: u32,
}

unsafe impl Plain for pid_config_t {}
unsafe impl Plain for sample_key_t {}
unsafe impl Plain for pid_event_t {}
