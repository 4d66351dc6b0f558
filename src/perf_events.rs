use std::io;
use std::os::raw::{c_int, c_ulong};

use errno::errno;
use perf_event_open_sys as sys;
use perf_event_open_sys::bindings::perf_event_attr;

/// Opens a CPU-clock sampling event on `cpu` firing `sample_rate` times per
/// second. The event starts disabled; attaching the BPF program enables it.
/// The returned fd is owned by the perf-event link that consumes it.
pub fn open_sampling_event(cpu: i32, sample_rate: u32) -> io::Result<c_int> {
    let mut attrs = perf_event_attr {
        size: std::mem::size_of::<perf_event_attr>() as u32,
        type_: sys::bindings::PERF_TYPE_SOFTWARE,
        config: sys::bindings::PERF_COUNT_SW_CPU_CLOCK as u64,
        ..Default::default()
    };
    attrs.__bindgen_anon_1.sample_freq = sample_rate as u64;
    attrs.set_freq(1);
    attrs.set_disabled(1);

    // SAFETY: `attrs` is fully initialized and carries its own size.
    let fd = unsafe {
        sys::perf_event_open(
            &mut attrs,
            -1, // every pid
            cpu,
            -1, // no group
            sys::bindings::PERF_FLAG_FD_CLOEXEC as c_ulong,
        )
    } as c_int;

    if fd < 0 {
        return Err(io::Error::from_raw_os_error(errno().0));
    }
    Ok(fd)
}
