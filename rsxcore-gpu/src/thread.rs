// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The GPU thread contract.
//!
//! Subsystems never own the GPU thread. They receive a [`GpuThread`] and use
//! it to pause command processing, to identify the calling thread, to track
//! outstanding asynchronous work and to forward flush hints.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Reason a flush was requested from the GPU thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncHint {
    /// A pending ZCULL query is old enough that its result will be needed soon.
    FlushRequest,
    /// A reader is about to block on a ZCULL result.
    FlushEarly,
}

pub trait GpuThread: Send + Sync {
    /// Stop command processing at the next safe point and wait until the GPU
    /// thread acknowledges. Calls nest.
    fn pause(&self);

    /// Release one `pause`.
    fn unpause(&self);

    /// True if the caller is the GPU thread itself.
    fn is_current_thread(&self) -> bool;

    /// Outstanding asynchronous operations the GPU must retire before idling.
    fn async_tasks_pending(&self) -> &AtomicU32;

    fn sync_hint(&self, hint: SyncHint);

    /// Called while the GPU thread spins on another subsystem so that pending
    /// pauses and exits are still serviced.
    fn on_semaphore_acquire_wait(&self);

    /// Nanosecond timestamp written into reports.
    fn timestamp(&self) -> u64;
}

// ── RsxThread ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Control {
    pause_requests: u32,
    paused: bool,
    running: bool,
    exit: bool,
}

type HintHandler = Box<dyn Fn(SyncHint) + Send + Sync>;

/// Concrete GPU thread state shared between the GPU loop and its clients.
pub struct RsxThread {
    control: Mutex<Control>,
    changed: Condvar,
    /// Fast-path copy of `pause_requests > 0 || exit`.
    attention: AtomicBool,
    owner: Mutex<Option<ThreadId>>,
    async_tasks: AtomicU32,
    flush_requests: AtomicU64,
    early_flushes: AtomicU64,
    hint_handler: OnceLock<HintHandler>,
    origin: Instant,
}

impl RsxThread {
    pub fn new() -> Self {
        Self {
            control: Mutex::new(Control::default()),
            changed: Condvar::new(),
            attention: AtomicBool::new(false),
            owner: Mutex::new(None),
            async_tasks: AtomicU32::new(0),
            flush_requests: AtomicU64::new(0),
            early_flushes: AtomicU64::new(0),
            hint_handler: OnceLock::new(),
            origin: Instant::now(),
        }
    }

    /// Mark the calling thread as the GPU thread and start servicing pauses.
    pub fn bind_current(&self) {
        *self.owner.lock() = Some(std::thread::current().id());
        self.control.lock().running = true;
        log::debug!("RsxThread: bound to {:?}", std::thread::current().id());
    }

    /// Called by the GPU thread on its way out. Pending pausers are released.
    pub fn unbind(&self) {
        let mut control = self.control.lock();
        control.running = false;
        control.paused = false;
        *self.owner.lock() = None;
        self.changed.notify_all();
    }

    /// Install the callback run for every sync hint. Only the first call wins.
    pub fn set_hint_handler(&self, handler: impl Fn(SyncHint) + Send + Sync + 'static) -> bool {
        self.hint_handler.set(Box::new(handler)).is_ok()
    }

    pub fn request_exit(&self) {
        let mut control = self.control.lock();
        control.exit = true;
        self.attention.store(true, Ordering::Release);
        self.changed.notify_all();
    }

    pub fn exit_requested(&self) -> bool {
        self.control.lock().exit
    }

    pub fn is_paused(&self) -> bool {
        self.control.lock().paused
    }

    /// Service pending pause requests. Must be called on the GPU thread.
    /// Returns `false` once exit has been requested.
    pub fn check_state(&self) -> bool {
        if !self.attention.load(Ordering::Acquire) {
            return true;
        }

        let mut control = self.control.lock();
        while control.pause_requests > 0 && !control.exit {
            if !control.paused {
                control.paused = true;
                log::trace!("RsxThread: paused");
                self.changed.notify_all();
            }
            self.changed.wait(&mut control);
        }
        if control.paused {
            control.paused = false;
            log::trace!("RsxThread: resumed");
            self.changed.notify_all();
        }
        !control.exit
    }

    /// Sleep until new work may be available or `timeout` elapses.
    pub fn idle_wait(&self, timeout: Duration) {
        let mut control = self.control.lock();
        if control.pause_requests == 0 && !control.exit {
            self.changed.wait_for(&mut control, timeout);
        }
    }

    /// Wake the GPU thread from `idle_wait`.
    pub fn wake(&self) {
        let _control = self.control.lock();
        self.changed.notify_all();
    }

    pub fn flush_requests(&self) -> u64 {
        self.flush_requests.load(Ordering::Relaxed)
    }

    pub fn early_flushes(&self) -> u64 {
        self.early_flushes.load(Ordering::Relaxed)
    }
}

impl Default for RsxThread {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuThread for RsxThread {
    fn pause(&self) {
        let mut control = self.control.lock();
        control.pause_requests += 1;
        self.attention.store(true, Ordering::Release);
        self.changed.notify_all();
        while control.running && !control.paused && !control.exit {
            self.changed.wait(&mut control);
        }
    }

    fn unpause(&self) {
        let mut control = self.control.lock();
        if control.pause_requests == 0 {
            log::warn!("RsxThread: unpause without matching pause");
            return;
        }
        control.pause_requests -= 1;
        if control.pause_requests == 0 {
            self.attention.store(control.exit, Ordering::Release);
            self.changed.notify_all();
        }
    }

    fn is_current_thread(&self) -> bool {
        *self.owner.lock() == Some(std::thread::current().id())
    }

    fn async_tasks_pending(&self) -> &AtomicU32 {
        &self.async_tasks
    }

    fn sync_hint(&self, hint: SyncHint) {
        match hint {
            SyncHint::FlushRequest => self.flush_requests.fetch_add(1, Ordering::Relaxed),
            SyncHint::FlushEarly => self.early_flushes.fetch_add(1, Ordering::Relaxed),
        };
        if let Some(handler) = self.hint_handler.get() {
            handler(hint);
        }
    }

    fn on_semaphore_acquire_wait(&self) {
        if self.is_current_thread() {
            self.check_state();
        }
    }

    fn timestamp(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

impl std::fmt::Debug for RsxThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsxThread")
            .field("control", &*self.control.lock())
            .field("async_tasks", &self.async_tasks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn spawn_gpu(gpu: Arc<RsxThread>, stop: Arc<AtomicBool>) -> thread::JoinHandle<u64> {
        thread::spawn(move || {
            gpu.bind_current();
            let mut iterations = 0u64;
            while !stop.load(Ordering::SeqCst) && gpu.check_state() {
                iterations += 1;
                thread::yield_now();
            }
            gpu.unbind();
            iterations
        })
    }

    #[test]
    fn test_pause_blocks_until_acknowledged() {
        let gpu = Arc::new(RsxThread::new());
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_gpu(gpu.clone(), stop.clone());
        while !gpu.control.lock().running {
            thread::yield_now();
        }

        gpu.pause();
        assert!(gpu.is_paused());
        gpu.pause();
        gpu.unpause();
        assert!(gpu.is_paused());
        gpu.unpause();

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(!gpu.is_paused());
    }

    #[test]
    fn test_pause_without_running_thread_returns() {
        let gpu = RsxThread::new();
        gpu.pause();
        assert!(!gpu.is_paused());
        gpu.unpause();
    }

    #[test]
    fn test_exit_releases_check_state() {
        let gpu = Arc::new(RsxThread::new());
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_gpu(gpu.clone(), stop);
        gpu.request_exit();
        handle.join().unwrap();
        assert!(gpu.exit_requested());
    }

    #[test]
    fn test_is_current_thread() {
        let gpu = Arc::new(RsxThread::new());
        assert!(!gpu.is_current_thread());
        gpu.bind_current();
        assert!(gpu.is_current_thread());
        let other = {
            let gpu = gpu.clone();
            thread::spawn(move || gpu.is_current_thread())
        };
        assert!(!other.join().unwrap());
        gpu.unbind();
        assert!(!gpu.is_current_thread());
    }

    #[test]
    fn test_sync_hint_counts_and_forwards() {
        let gpu = RsxThread::new();
        let seen = Arc::new(AtomicU32::new(0));
        {
            let seen = seen.clone();
            assert!(gpu.set_hint_handler(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(!gpu.set_hint_handler(|_| {}));

        gpu.sync_hint(SyncHint::FlushRequest);
        gpu.sync_hint(SyncHint::FlushEarly);
        gpu.sync_hint(SyncHint::FlushEarly);
        assert_eq!(gpu.flush_requests(), 1);
        assert_eq!(gpu.early_flushes(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_timestamp_monotonic() {
        let gpu = RsxThread::new();
        let a = gpu.timestamp();
        thread::sleep(Duration::from_millis(1));
        assert!(gpu.timestamp() > a);
    }
}
