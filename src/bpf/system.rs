//! Production [`ProfileObjects`] backed by libbpf. The profiler BPF object
//! is compiled out of band and loaded from disk at start time; maps and
//! programs are looked up by name so the Rust side carries no generated
//! skeleton.

use std::io;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use libbpf_rs::{Link, Map, MapCore, MapFlags, MapHandle, Object, ObjectBuilder, PerfBufferBuilder, ProgramMut};
use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};
use tracing::{debug, error, warn};

use super::bindings::{pid_config_t, sample_key_t};
use super::{BpfLoader, CountsBatch, KprobeHook, ObjectsError, ProfileObjects};
use crate::events::{EventRing, RingCloser, RingError, RingRecord};
use crate::perf_events::open_sampling_event;

const PIDS_MAP: &str = "pids";
const COUNTS_MAP: &str = "counts";
const STACKS_MAP: &str = "stacks";
const EVENTS_MAP: &str = "events";

const PERF_EVENT_PROG: &str = "do_perf_event";
const EXEC_PROG: &str = "exec";
const DISASSOCIATE_CTTY_PROG: &str = "disassociate_ctty";

const RING_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RING_QUEUE_CAPACITY: usize = 512;

/// Loads the compiled profiler object file.
pub struct SystemLoader {
    object_path: PathBuf,
}

impl SystemLoader {
    pub fn new(object_path: impl Into<PathBuf>) -> Self {
        Self {
            object_path: object_path.into(),
        }
    }
}

impl BpfLoader for SystemLoader {
    fn remove_memlock(&self) -> Result<(), ObjectsError> {
        setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)
            .map_err(|err| ObjectsError::Os(err.into()))
    }

    fn load(&self) -> Result<Box<dyn ProfileObjects>, ObjectsError> {
        let object = ObjectBuilder::default()
            .open_file(&self.object_path)?
            .load()?;
        debug!("profiler BPF object loaded from {}", self.object_path.display());
        Ok(Box::new(SystemObjects {
            object,
            perf_links: Vec::new(),
            kprobe_links: Vec::new(),
        }))
    }
}

pub struct SystemObjects {
    object: Object,
    perf_links: Vec<Link>,
    kprobe_links: Vec<Link>,
}

// SAFETY: `Object` wraps a `NonNull<bpf_object>` and is not `Send` by
// default, but libbpf does not tie the underlying object to any particular
// thread; `SystemObjects` is only ever accessed through `&mut self`, so
// there is no concurrent access to guard against.
unsafe impl Send for SystemObjects {}

impl SystemObjects {
    fn map(&self, name: &'static str) -> Result<Map<'_>, ObjectsError> {
        self.object
            .maps()
            .find(|map| map.name() == name)
            .ok_or(ObjectsError::MissingMap(name))
    }

    fn prog(&mut self, name: &'static str) -> Result<ProgramMut<'_>, ObjectsError> {
        self.object
            .progs_mut()
            .find(|prog| prog.name() == name)
            .ok_or(ObjectsError::MissingProgram(name))
    }
}

impl ProfileObjects for SystemObjects {
    fn attach_perf_event(&mut self, cpu: u32, sample_rate: u32) -> Result<(), ObjectsError> {
        let fd = open_sampling_event(cpu as i32, sample_rate).map_err(ObjectsError::PerfEventOpen)?;
        let prog = self.prog(PERF_EVENT_PROG)?;
        let link = prog.attach_perf_event(fd)?;
        self.perf_links.push(link);
        Ok(())
    }

    fn attach_kprobe(&mut self, hook: KprobeHook, symbol: &str) -> Result<(), ObjectsError> {
        let name = match hook {
            KprobeHook::Exec => EXEC_PROG,
            KprobeHook::DisassociateCtty => DISASSOCIATE_CTTY_PROG,
        };
        let prog = self.prog(name)?;
        let link = prog.attach_kprobe(false, symbol)?;
        self.kprobe_links.push(link);
        Ok(())
    }

    fn detach_perf_events(&mut self) {
        self.perf_links.clear();
    }

    fn detach_kprobes(&mut self) {
        self.kprobe_links.clear();
    }

    fn open_events_ring(
        &mut self,
        bytes: usize,
    ) -> Result<(Box<dyn EventRing>, RingCloser), ObjectsError> {
        let map = self.map(EVENTS_MAP)?;
        let handle = MapHandle::try_from(&map)?;
        let pages = (bytes / page_size::get()).max(1);
        let closer = RingCloser::new();
        let ring = PerfEventRing::open(handle, pages, closer.clone())?;
        Ok((Box::new(ring), closer))
    }

    fn update_pid_config(&self, pid: u32, config: pid_config_t) -> Result<(), ObjectsError> {
        let map = self.map(PIDS_MAP)?;
        // SAFETY: pid_config_t is plain old data.
        let value = unsafe { plain::as_bytes(&config) };
        map.update(&pid.to_ne_bytes(), value, MapFlags::ANY)?;
        Ok(())
    }

    fn delete_pid_config(&self, pid: u32) -> Result<(), ObjectsError> {
        let map = self.map(PIDS_MAP)?;
        delete_key(&map, &pid.to_ne_bytes())
    }

    fn pid_configs(&self) -> Result<Vec<(u32, pid_config_t)>, ObjectsError> {
        let map = self.map(PIDS_MAP)?;
        let mut configs = Vec::new();
        for key in map.keys() {
            // Entries can vanish between iteration and lookup.
            let Ok(Some(value)) = map.lookup(&key, MapFlags::ANY) else {
                continue;
            };
            let Ok(raw_pid) = <[u8; 4]>::try_from(key.as_slice()) else {
                continue;
            };
            let mut config = pid_config_t::default();
            if plain::copy_from_bytes(&mut config, &value).is_err() {
                warn!("undersized pids map value, {} bytes", value.len());
                continue;
            }
            configs.push((u32::from_ne_bytes(raw_pid), config));
        }
        Ok(configs)
    }

    fn drain_counts(&self) -> Result<CountsBatch, ObjectsError> {
        let map = self.map(COUNTS_MAP)?;
        let mut batch = CountsBatch::default();
        for key in map.keys() {
            let value = match map.lookup(&key, MapFlags::ANY) {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(err) => return Err(err.into()),
            };
            let mut sample_key = sample_key_t::default();
            if plain::copy_from_bytes(&mut sample_key, &key).is_err() {
                warn!("undersized counts map key, {} bytes", key.len());
                continue;
            }
            let mut count = 0u64;
            if plain::copy_from_bytes(&mut count, &value).is_err() {
                continue;
            }
            batch.keys.push(sample_key);
            batch.values.push(count);
        }
        Ok(batch)
    }

    fn clear_counts(&self, batch: &CountsBatch) -> Result<(), ObjectsError> {
        let map = self.map(COUNTS_MAP)?;
        for key in &batch.keys {
            // SAFETY: sample_key_t is plain old data.
            let raw = unsafe { plain::as_bytes(key) };
            match delete_key(&map, raw) {
                Ok(()) | Err(ObjectsError::KeyNotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn lookup_stack(&self, stack_id: i64) -> Option<Vec<u8>> {
        if stack_id < 0 {
            return None;
        }
        let map = self.map(STACKS_MAP).ok()?;
        map.lookup(&(stack_id as u32).to_ne_bytes(), MapFlags::ANY)
            .ok()
            .flatten()
    }

    fn stack_ids(&self) -> Result<Vec<u32>, ObjectsError> {
        let map = self.map(STACKS_MAP)?;
        let mut ids = Vec::new();
        for key in map.keys() {
            let Ok(raw) = <[u8; 4]>::try_from(key.as_slice()) else {
                continue;
            };
            ids.push(u32::from_ne_bytes(raw));
        }
        Ok(ids)
    }

    fn delete_stack(&self, stack_id: u32) -> Result<(), ObjectsError> {
        let map = self.map(STACKS_MAP)?;
        delete_key(&map, &stack_id.to_ne_bytes())
    }
}

fn delete_key(map: &Map<'_>, key: &[u8]) -> Result<(), ObjectsError> {
    match map.delete(key) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == libbpf_rs::ErrorKind::NotFound => Err(ObjectsError::KeyNotFound),
        Err(err) => Err(err.into()),
    }
}

/// Events ring on top of a libbpf perf buffer. A dedicated thread polls the
/// buffer and feeds a bounded queue; `read` drains the queue. The thread
/// exits when the closer fires, and fires the closer itself if polling hits
/// a fatal error so readers do not block forever.
struct PerfEventRing {
    records: Receiver<RingRecord>,
    closer: RingCloser,
    poll_thread: Option<JoinHandle<()>>,
}

impl PerfEventRing {
    fn open(map: MapHandle, pages: usize, closer: RingCloser) -> Result<Self, ObjectsError> {
        let (record_tx, record_rx) = bounded(RING_QUEUE_CAPACITY);
        let (ready_tx, ready_rx) = bounded(1);
        let thread_closer = closer.clone();

        let poll_thread = thread::Builder::new()
            .name("events-ring".to_string())
            .spawn(move || poll_loop(map, pages, record_tx, ready_tx, thread_closer))
            .map_err(ObjectsError::Os)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(ObjectsError::Os(io::Error::other(
                    "events ring poll thread exited during setup",
                )))
            }
        }

        Ok(Self {
            records: record_rx,
            closer,
            poll_thread: Some(poll_thread),
        })
    }
}

fn poll_loop(
    map: MapHandle,
    pages: usize,
    records: Sender<RingRecord>,
    ready: Sender<Result<(), libbpf_rs::Error>>,
    closer: RingCloser,
) {
    let lost_records = records.clone();
    let buffer = PerfBufferBuilder::new(&map)
        .pages(pages)
        .sample_cb(move |_cpu: i32, data: &[u8]| {
            if records
                .try_send(RingRecord {
                    data: data.to_vec(),
                    lost: 0,
                })
                .is_err()
            {
                // The reader is behind; the kernel will surface the loss
                // through its own lost-sample accounting as well.
                debug!("events ring queue full, dropping record");
            }
        })
        .lost_cb(move |_cpu: i32, count: u64| {
            let _ = lost_records.try_send(RingRecord {
                data: Vec::new(),
                lost: count,
            });
        })
        .build();

    let buffer = match buffer {
        Ok(buffer) => {
            let _ = ready.send(Ok(()));
            buffer
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    while !closer.is_closed() {
        match buffer.poll(RING_POLL_INTERVAL) {
            Ok(()) => {}
            Err(err) if err.kind() == libbpf_rs::ErrorKind::Interrupted => {}
            Err(err) => {
                error!("polling events ring: {err}");
                closer.close();
            }
        }
    }
}

impl EventRing for PerfEventRing {
    fn read(&mut self) -> Result<RingRecord, RingError> {
        loop {
            if self.closer.is_closed() {
                return Err(RingError::Closed);
            }
            match self.records.recv_timeout(RING_POLL_INTERVAL) {
                Ok(record) => return Ok(record),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(RingError::Closed),
            }
        }
    }
}

impl Drop for PerfEventRing {
    fn drop(&mut self) {
        self.closer.close();
        if let Some(poll_thread) = self.poll_thread.take() {
            let _ = poll_thread.join();
        }
    }
}
