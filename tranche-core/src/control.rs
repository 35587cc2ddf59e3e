use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Cooperative cancellation and phase flags shared by every worker of one session.
///
/// `stopped` is set by the caller, `halted` by any worker that hits an unrecoverable
/// error. Every blocking wait in the pipeline is bounded by `poll` and re-checks both.
pub struct Control {
    poll_us: AtomicU64,
    stopped: AtomicBool,
    halted: AtomicBool,
    paused: AtomicBool,
    draining: AtomicBool,
    pause_lock: Mutex<()>,
    pause_cv: Condvar,
    producers_done: AtomicBool,
    data_uploaders_left: AtomicUsize,
}

impl Control {
    pub fn new(poll: Duration) -> Self {
        Self {
            poll_us: AtomicU64::new(poll.as_micros() as u64),
            stopped: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            pause_lock: Mutex::new(()),
            pause_cv: Condvar::new(),
            producers_done: AtomicBool::new(false),
            data_uploaders_left: AtomicUsize::new(0),
        }
    }

    pub fn poll(&self) -> Duration {
        Duration::from_micros(self.poll_us.load(Ordering::Relaxed))
    }

    pub(crate) fn set_poll(&self, poll: Duration) {
        self.poll_us.store(poll.as_micros().max(1) as u64, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.pause_cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Ask every worker in every pool to wind down.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn should_halt(&self) -> bool {
        self.is_stopped() || self.is_halted()
    }

    pub fn set_paused(&self, on: bool) {
        self.paused.store(on, Ordering::SeqCst);
        if !on {
            self.pause_cv.notify_all();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block while paused. Returns early once stopped or draining.
    pub fn wait_while_paused(&self) {
        let mut guard = self.pause_lock.lock();
        while self.is_paused() && !self.is_stopped() && !self.is_draining() {
            self.pause_cv.wait_for(&mut guard, self.poll());
        }
    }

    /// The run is over: pause no longer holds back what is left to deliver.
    pub(crate) fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.pause_cv.notify_all();
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub(crate) fn set_producers_done(&self) {
        self.producers_done.store(true, Ordering::SeqCst);
    }

    pub fn producers_done(&self) -> bool {
        self.producers_done.load(Ordering::SeqCst)
    }

    pub(crate) fn register_data_uploaders(&self, n: usize) {
        self.data_uploaders_left.store(n, Ordering::SeqCst);
    }

    pub(crate) fn data_uploader_finished(&self) {
        self.data_uploaders_left.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn data_uploaders_done(&self) -> bool {
        self.data_uploaders_left.load(Ordering::SeqCst) == 0
    }

    /// Sleep one poll interval unless halting. Returns `false` when the caller should stop.
    pub fn nap(&self) -> bool {
        if self.should_halt() {
            return false;
        }
        std::thread::sleep(self.poll());
        !self.should_halt()
    }
}
