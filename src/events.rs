//! Ring-event plumbing: the kernel pushes one [`PidEvent`] per process
//! lifecycle change, a single reader task demultiplexes them into three
//! bounded queues, and the queue consumers do the actual work.
//!
//! The reader never touches session state and holds no locks; back-pressure
//! shows up as dropped enqueues, never as a stalled ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error};

use crate::bpf::bindings::{
    PID_OP_DEAD, PID_OP_REQUEST_EXEC_PROCESS_INFO, PID_OP_REQUEST_UNKNOWN_PROCESS_INFO,
};

/// One record read off the events ring. `lost` carries the kernel's count of
/// records that overflowed the ring since the previous read; such records
/// may have no payload.
#[derive(Debug, Default, Clone)]
pub struct RingRecord {
    pub data: Vec<u8>,
    pub lost: u64,
}

#[derive(Debug, Error)]
pub enum RingError {
    #[error("events ring closed")]
    Closed,
    #[error("events ring read: {0}")]
    Read(#[source] anyhow::Error),
}

/// Blocking source of [`RingRecord`]s. `read` returns [`RingError::Closed`]
/// once the paired [`RingCloser`] fires; that is the reader's shutdown
/// signal.
pub trait EventRing: Send {
    fn read(&mut self) -> Result<RingRecord, RingError>;
}

/// Shared close flag for an [`EventRing`]. Cloning hands out another handle
/// to the same flag.
#[derive(Debug, Clone, Default)]
pub struct RingCloser(Arc<AtomicBool>);

impl RingCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidEvent {
    pub op: u32,
    pub pid: u32,
}

/// Decodes the 8-byte little-endian wire format; anything shorter is
/// dropped by the caller.
pub fn parse_pid_event(raw: &[u8]) -> Option<PidEvent> {
    if raw.len() < 8 {
        return None;
    }
    let op = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let pid = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    Some(PidEvent { op, pid })
}

/// The three pid queues fed by the reader task.
pub(crate) struct EventQueues {
    pub info: Sender<u32>,
    pub exec: Sender<u32>,
    pub dead: Sender<u32>,
}

pub(crate) fn dispatch_event(queues: &EventQueues, event: PidEvent) {
    match event.op {
        PID_OP_REQUEST_UNKNOWN_PROCESS_INFO => forward(&queues.info, event.pid, "pid info request"),
        PID_OP_DEAD => forward(&queues.dead, event.pid, "dead pid event"),
        PID_OP_REQUEST_EXEC_PROCESS_INFO => forward(&queues.exec, event.pid, "pid exec request"),
        op => error!("unknown perf event record: op {op}, pid {}", event.pid),
    }
}

fn forward(queue: &Sender<u32>, pid: u32, what: &str) {
    match queue.try_send(pid) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            error!("{what} queue full, dropping event for pid {pid}");
        }
        Err(TrySendError::Disconnected(_)) => {
            // Shutdown race: the session closed the queues while the ring
            // still had records in flight.
            debug!("{what} queue closed, dropping event for pid {pid}");
        }
    }
}

/// Body of the reader task. Exits when the ring is closed; any other read
/// error is logged and reading continues.
pub(crate) fn run_reader(mut ring: Box<dyn EventRing>, queues: EventQueues) {
    loop {
        let record = match ring.read() {
            Ok(record) => record,
            Err(RingError::Closed) => return,
            Err(err) => {
                error!("reading from events ring: {err}");
                continue;
            }
        };
        if record.lost != 0 {
            error!("events ring full, lost {} records", record.lost);
        }
        if record.data.is_empty() {
            continue;
        }
        match parse_pid_event(&record.data) {
            Some(event) => dispatch_event(&queues, event),
            None => error!("events ring record too short: {} bytes", record.data.len()),
        }
    }
}
