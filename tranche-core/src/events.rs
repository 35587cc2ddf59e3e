//! Typed pipeline notifications.
//!
//! Every event is folded into the session report synchronously, then handed to
//! a dispatcher thread that delivers it to external listeners. Only that
//! thread blocks while the session is paused; once stopped, pending events are
//! dropped instead of delivered. Closing the bus flushes whatever is still queued,
//! paused or not, so the caller always gets its report back.

use crate::control::Control;
use crate::hash::ContentHash;
use crate::report::Report;
use crate::topology::HostId;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EventKind {
    SessionStarted,
    FileStarted,
    ArchiveExpanded,
    ChunkUploaded,
    HostFailed,
    MetaUploaded,
    FileFinished,
    FileFailed,
    SessionFailed,
    SessionFinished,
}

#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub hash: Option<ContentHash>,
    pub file: Option<String>,
    pub host: Option<HostId>,
    pub bytes: u64,
    /// Set for the manifest and license files.
    pub synthetic: bool,
    pub message: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self { kind, hash: None, file: None, host: None, bytes: 0, synthetic: false, message: None }
    }

    pub fn hash(mut self, h: ContentHash) -> Self {
        self.hash = Some(h);
        self
    }

    pub fn file(mut self, f: &str) -> Self {
        self.file = Some(f.to_string());
        self
    }

    pub fn host(mut self, h: &str) -> Self {
        self.host = Some(h.to_string());
        self
    }

    pub fn bytes(mut self, n: u64) -> Self {
        self.bytes = n;
        self
    }

    pub fn synthetic(mut self, on: bool) -> Self {
        self.synthetic = on;
        self
    }

    pub fn message(mut self, m: impl Into<String>) -> Self {
        self.message = Some(m.into());
        self
    }
}

pub trait Listener: Send + Sync {
    fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

impl<F> Listener for F
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self(event)
    }
}

pub type ListenerSet = Arc<RwLock<Vec<Arc<dyn Listener>>>>;

pub(crate) struct EventBus {
    control: Arc<Control>,
    report: Arc<Mutex<Report>>,
    tx: Mutex<Option<Sender<Event>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn start(report: Report, listeners: ListenerSet, control: Arc<Control>) -> Self {
        let (tx, rx) = unbounded::<Event>();
        let ctl = control.clone();
        let handle = thread::Builder::new()
            .name("tranche-events".into())
            .spawn(move || {
                for event in rx {
                    ctl.wait_while_paused();
                    if ctl.is_stopped() {
                        continue;
                    }
                    let current: Vec<_> = listeners.read().clone();
                    for l in current {
                        deliver(l.as_ref(), &event);
                    }
                }
            })
            .ok();
        if handle.is_none() {
            warn!("event dispatcher thread could not start; external listeners disabled");
        }
        Self {
            control,
            report: Arc::new(Mutex::new(report)),
            tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(handle),
        }
    }

    pub fn publish(&self, event: Event) {
        self.report.lock().apply(&event);
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn with_report<R>(&self, f: impl FnOnce(&mut Report) -> R) -> R {
        f(&mut self.report.lock())
    }

    /// Stop accepting events, wait for the dispatcher to drain, and return the report.
    pub fn close(&self) -> Report {
        self.tx.lock().take();
        self.control.drain();
        if let Some(h) = self.dispatcher.lock().take() {
            let _ = h.join();
        }
        self.report.lock().clone()
    }
}

fn deliver(listener: &dyn Listener, event: &Event) {
    match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(kind = ?event.kind, error = %e, "listener failed"),
        Err(_) => warn!(kind = ?event.kind, "listener panicked"),
    }
}
