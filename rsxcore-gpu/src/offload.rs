// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! DMA offload manager.
//!
//! Memory transfers, index emulation and backend requests can be handed to a
//! dedicated worker thread. Small transfers, and every transfer when
//! multithreaded RSX is off, run inline on the caller. Completion is tracked
//! with two monotonic counters; [`DmaManager::sync`] waits until the worker
//! has processed everything enqueued so far.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use parking_lot::Mutex;

use rsxcore_common::{AddressRange, GuestAddr, Settings};
use rsxcore_lockfree::LfQueue;
use rsxcore_memory::{GuestMemory, LockOwner, MemoryResult, ReservationTable};

use crate::backend::{BackendRequest, RenderControl};
use crate::index_utils::{get_index_buffer_size, get_index_count, write_index_array, PrimitiveType};
use crate::reservation_lock::ExclusiveReservation;
use crate::thread::GpuThread;

/// Raw host pointer carried by a queued job.
#[derive(Clone, Copy)]
struct HostPtr(*mut u8);

// SAFETY: the enqueuer guarantees the pointee outlives the job.
unsafe impl Send for HostPtr {}

enum Transport {
    RawCopy {
        dst: HostPtr,
        src: HostPtr,
        length: u32,
    },
    VectorCopy {
        dst: HostPtr,
        data: Vec<u8>,
    },
    IndexEmulate {
        dst: HostPtr,
        primitive: PrimitiveType,
        count: u32,
    },
    Callback(BackendRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    RawCopy,
    VectorCopy,
    IndexEmulate,
    Callback,
}

/// What the worker is touching right now, kept for fault resolution.
#[derive(Debug, Clone, Copy)]
struct JobView {
    kind: JobKind,
    dst: usize,
    src: usize,
    length: usize,
}

impl JobView {
    fn of(job: &Transport) -> Self {
        match job {
            Transport::RawCopy { dst, src, length } => Self {
                kind: JobKind::RawCopy,
                dst: dst.0 as usize,
                src: src.0 as usize,
                length: *length as usize,
            },
            Transport::VectorCopy { dst, data } => Self {
                kind: JobKind::VectorCopy,
                dst: dst.0 as usize,
                src: 0,
                length: data.len(),
            },
            Transport::IndexEmulate {
                dst,
                primitive,
                count,
            } => Self {
                kind: JobKind::IndexEmulate,
                dst: dst.0 as usize,
                src: 0,
                length: get_index_buffer_size(*primitive, *count),
            },
            Transport::Callback(_) => Self {
                kind: JobKind::Callback,
                dst: 0,
                src: 0,
                length: 0,
            },
        }
    }

    /// Guest range a fault in this job can belong to.
    fn fault_range(&self, memory: &GuestMemory, writing: bool) -> Option<AddressRange> {
        let ptr = match self.kind {
            JobKind::RawCopy if !writing => self.src,
            JobKind::RawCopy | JobKind::VectorCopy | JobKind::IndexEmulate => self.dst,
            JobKind::Callback => return None,
        };
        let addr = memory.try_get_addr(ptr as *const u8)?;
        Some(AddressRange::start_length(addr, self.length as u32))
    }
}

/// Gives up on a contended reservation after a few attempts. Used for inline
/// copies, whose caller may already hold the stripe.
struct BoundedRetry {
    remaining: Cell<u32>,
    gave_up: Cell<bool>,
}

impl BoundedRetry {
    fn new(attempts: u32) -> Self {
        Self {
            remaining: Cell::new(attempts),
            gave_up: Cell::new(false),
        }
    }
}

impl LockOwner for BoundedRetry {
    fn on_contention(&self) -> bool {
        let left = self.remaining.get();
        self.remaining.set(left.saturating_sub(1));
        if left == 0 {
            self.gave_up.set(true);
        }
        left > 0
    }
}

/// How a copy reserves its guest source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceLock {
    /// Block until the source stripes are free.
    Blocking,
    /// Give up after this many contended attempts.
    Bounded(u32),
    /// The caller already holds an exclusive reservation over the source.
    Held,
}

/// Copy `length` bytes under a reservation on the guest source, if any.
/// Returns `false` if a bounded attempt gave up and the copy ran unreserved.
///
/// # Safety
/// Both pointers must be valid for `length` bytes. They may overlap.
unsafe fn raw_copy(
    memory: &GuestMemory,
    iomap: &ReservationTable,
    dst: *mut u8,
    src: *const u8,
    length: u32,
    mode: SourceLock,
) -> bool {
    let mut reserved = true;
    let _lock = match (mode, memory.try_get_addr(src)) {
        (SourceLock::Held, _) | (_, None) => None,
        (SourceLock::Blocking, Some(addr)) => Some(ExclusiveReservation::new(iomap, addr, length)),
        (SourceLock::Bounded(n), Some(addr)) => {
            let owner = BoundedRetry::new(n);
            let lock = ExclusiveReservation::with_owner(iomap, addr, length, &owner);
            if owner.gave_up.get() {
                log::trace!("DmaManager: inline copy from 0x{:08X} proceeds unreserved", addr);
                reserved = false;
            }
            Some(lock)
        }
    };
    ptr::copy(src, dst, length as usize);
    reserved
}

/// # Safety
/// `dst` must be valid and aligned for the full emulated index buffer.
unsafe fn emulate_indices(dst: *mut u16, primitive: PrimitiveType, count: u32) {
    let len = get_index_count(primitive, count) as usize;
    let out = std::slice::from_raw_parts_mut(dst, len);
    write_index_array(out, primitive, count);
}

// ── Worker state ───────────────────────────────────────────────────────────

struct DmaShared {
    queue: LfQueue<Transport>,
    enqueued_count: AtomicU64,
    processed_count: AtomicU64,
    aborting: AtomicBool,
    mem_fault: AtomicBool,
    unreserved_copies: AtomicU64,
    current_job: Mutex<Option<JobView>>,
    worker_id: Mutex<Option<ThreadId>>,
    memory: Arc<GuestMemory>,
    iomap: Arc<ReservationTable>,
    control: Arc<dyn RenderControl>,
}

impl DmaShared {
    fn execute(&self, job: Transport) {
        match job {
            Transport::RawCopy { dst, src, length } => {
                // SAFETY: the enqueuer vouched for both pointers until the next sync.
                unsafe { raw_copy(&self.memory, &self.iomap, dst.0, src.0, length, SourceLock::Blocking) };
            }
            Transport::VectorCopy { dst, data } => {
                // SAFETY: as above; `data` is owned by the job.
                unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst.0, data.len()) }
            }
            Transport::IndexEmulate {
                dst,
                primitive,
                count,
            } => {
                // SAFETY: as above; alignment was checked at enqueue time.
                unsafe { emulate_indices(dst.0 as *mut u16, primitive, count) }
            }
            Transport::Callback(request) => self.control.renderctl(request),
        }
    }

    fn run(&self) {
        log::debug!("DmaManager: worker started");
        while !self.aborting.load(Ordering::Acquire) {
            for job in self.queue.pop_all() {
                *self.current_job.lock() = Some(JobView::of(&job));
                self.execute(job);
                *self.current_job.lock() = None;
                self.processed_count.fetch_add(1, Ordering::AcqRel);
            }

            if self.processed_count.load(Ordering::Acquire)
                != self.enqueued_count.load(Ordering::Acquire)
            {
                // An enqueuer bumped the counter but has not pushed yet.
                std::hint::spin_loop();
                continue;
            }
            self.queue.wait_with(|| self.aborting.load(Ordering::Acquire));
        }
        self.processed_count.store(u64::MAX, Ordering::Release);
        log::debug!("DmaManager: worker stopped");
    }
}

#[cfg(target_os = "linux")]
fn set_thread_affinity(mask: u64) -> bool {
    // SAFETY: plain libc calls on a zeroed cpu_set_t owned by this frame.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in 0..64 {
            if mask & (1u64 << cpu) != 0 {
                libc::CPU_SET(cpu, &mut set);
            }
        }
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
fn set_thread_affinity(_mask: u64) -> bool {
    false
}

// ── DmaManager ─────────────────────────────────────────────────────────────

pub struct DmaManager {
    shared: Arc<DmaShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    gpu: Arc<dyn GpuThread>,
    multithreaded: bool,
    max_immediate_transfer_size: u32,
    sync_spin_count: u32,
}

impl DmaManager {
    pub fn new(
        settings: &Settings,
        memory: Arc<GuestMemory>,
        iomap: Arc<ReservationTable>,
        gpu: Arc<dyn GpuThread>,
        control: Arc<dyn RenderControl>,
    ) -> Self {
        let shared = Arc::new(DmaShared {
            queue: LfQueue::new(),
            enqueued_count: AtomicU64::new(0),
            processed_count: AtomicU64::new(0),
            aborting: AtomicBool::new(false),
            mem_fault: AtomicBool::new(false),
            unreserved_copies: AtomicU64::new(0),
            current_job: Mutex::new(None),
            worker_id: Mutex::new(None),
            memory,
            iomap,
            control,
        });

        let worker = if settings.multithreaded_rsx {
            let affinity = settings
                .pin_offload_thread()
                .then_some(settings.rsx_affinity_mask);
            let worker_shared = shared.clone();
            let spawned = std::thread::Builder::new()
                .name("RSX Offloader".into())
                .spawn(move || {
                    *worker_shared.worker_id.lock() = Some(std::thread::current().id());
                    if let Some(mask) = affinity {
                        if !set_thread_affinity(mask) {
                            log::warn!("DmaManager: could not pin worker to mask 0x{:X}", mask);
                        }
                    }
                    worker_shared.run();
                });
            match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!("DmaManager: failed to spawn worker, running inline: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let multithreaded = worker.is_some();
        log::debug!(
            "DmaManager: multithreaded={} immediate<{} bytes",
            multithreaded,
            settings.max_immediate_transfer_size
        );

        Self {
            shared,
            worker: Mutex::new(worker),
            gpu,
            multithreaded,
            max_immediate_transfer_size: settings.max_immediate_transfer_size,
            sync_spin_count: settings.sync_spin_count,
        }
    }

    pub fn is_multithreaded(&self) -> bool {
        self.multithreaded
    }

    /// False before a worker exists and again once it has been joined.
    fn worker_running(&self) -> bool {
        self.multithreaded && !self.shared.aborting.load(Ordering::Acquire)
    }

    fn run_inline(&self, length: usize) -> bool {
        !self.worker_running() || length < self.max_immediate_transfer_size as usize
    }

    fn enqueue(&self, job: Transport) {
        if !self.worker_running() {
            log::warn!("DmaManager: worker gone, running {:?} job inline", JobView::of(&job).kind);
            self.shared.execute(job);
            return;
        }
        self.shared.enqueued_count.fetch_add(1, Ordering::AcqRel);
        self.shared.queue.push(job);
    }

    /// Copy `length` bytes from `src` to `dst`.
    ///
    /// # Safety
    /// Both pointers must be valid for `length` bytes and must stay valid
    /// until the next [`DmaManager::sync`]. Overlapping ranges are allowed.
    pub unsafe fn copy(&self, dst: *mut u8, src: *const u8, length: u32) {
        self.copy_with(dst, src, length, SourceLock::Bounded(self.sync_spin_count));
    }

    unsafe fn copy_with(&self, dst: *mut u8, src: *const u8, length: u32, mode: SourceLock) {
        if length == 0 {
            return;
        }
        if self.run_inline(length as usize) {
            let shared = &self.shared;
            if !raw_copy(&shared.memory, &shared.iomap, dst, src, length, mode) {
                shared.unreserved_copies.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.enqueue(Transport::RawCopy {
                dst: HostPtr(dst),
                src: HostPtr(src as *mut u8),
                length,
            });
        }
    }

    /// Copy an owned buffer to `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for `data.len()` bytes until the next `sync`.
    pub unsafe fn copy_owned(&self, dst: *mut u8, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        if self.run_inline(data.len()) {
            ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        } else {
            self.enqueue(Transport::VectorCopy {
                dst: HostPtr(dst),
                data,
            });
        }
    }

    /// Guest-to-guest copy. Overlapping ranges are handled when the copy
    /// runs, so earlier queued writes to the source are observed.
    pub fn copy_guest(&self, dst: GuestAddr, src: GuestAddr, length: u32) -> MemoryResult<()> {
        self.copy_guest_with(dst, src, length, SourceLock::Bounded(self.sync_spin_count))
    }

    /// Guest-to-guest copy for a caller that already holds an exclusive
    /// reservation over the source. Inline copies skip locking; queued ones
    /// still reserve the source once the caller has released it.
    pub fn copy_guest_reserved(&self, dst: GuestAddr, src: GuestAddr, length: u32) -> MemoryResult<()> {
        self.copy_guest_with(dst, src, length, SourceLock::Held)
    }

    fn copy_guest_with(&self, dst: GuestAddr, src: GuestAddr, length: u32, mode: SourceLock) -> MemoryResult<()> {
        let memory = &self.shared.memory;
        let dst_ptr = memory.super_ptr(dst, length)?;
        let src_ptr = memory.super_ptr(src, length)?;
        // SAFETY: guest memory outlives the worker, which holds an Arc to it.
        unsafe { self.copy_with(dst_ptr, src_ptr, length, mode) };
        Ok(())
    }

    /// Write an owned buffer into guest memory.
    pub fn write_guest(&self, dst: GuestAddr, data: Vec<u8>) -> MemoryResult<()> {
        let dst_ptr = self.shared.memory.super_ptr(dst, data.len() as u32)?;
        // SAFETY: guest memory outlives the worker.
        unsafe { self.copy_owned(dst_ptr, data) };
        Ok(())
    }

    /// Fill `dst` with a u16 index list drawing `count` vertices of a
    /// non-native `primitive`.
    ///
    /// A misaligned `dst` is logged and ignored.
    ///
    /// # Safety
    /// `dst` must be valid for `get_index_count(primitive, count)` entries
    /// until the next `sync`.
    pub unsafe fn emulate_as_indexed(&self, dst: *mut u16, primitive: PrimitiveType, count: u32) {
        if !dst.is_aligned() {
            log::error!("DmaManager: index buffer at {:p} is not u16 aligned", dst);
            return;
        }
        if self.run_inline(get_index_buffer_size(primitive, count)) {
            emulate_indices(dst, primitive, count);
        } else {
            self.enqueue(Transport::IndexEmulate {
                dst: HostPtr(dst as *mut u8),
                primitive,
                count,
            });
        }
    }

    /// Forward a request to the backend. Always queued when a worker exists.
    pub fn backend_ctrl(&self, request: BackendRequest) {
        if self.worker_running() {
            self.enqueue(Transport::Callback(request));
        } else {
            self.shared.control.renderctl(request);
        }
    }

    /// Wait until every enqueued job has been processed.
    ///
    /// On the GPU thread this keeps servicing pause requests while waiting and
    /// returns `false` if the worker is recovering from a memory fault.
    pub fn sync(&self) -> bool {
        let shared = &self.shared;
        let pending = || {
            shared.enqueued_count.load(Ordering::Acquire)
                > shared.processed_count.load(Ordering::Acquire)
        };
        if !pending() {
            return true;
        }

        let on_gpu = self.gpu.is_current_thread();
        let mut spins = 0u32;
        while pending() {
            if on_gpu {
                if shared.mem_fault.load(Ordering::Acquire) {
                    log::debug!("DmaManager: sync abandoned during fault recovery");
                    return false;
                }
                self.gpu.on_semaphore_acquire_wait();
            }
            if spins < self.sync_spin_count {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        true
    }

    /// Drain outstanding work and stop the worker.
    pub fn join(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        self.sync();
        self.shared.aborting.store(true, Ordering::Release);
        self.shared.queue.notify();
        if handle.join().is_err() {
            log::error!("DmaManager: worker panicked");
        }
    }

    /// True if the caller is the offload worker.
    pub fn is_current_thread(&self) -> bool {
        *self.shared.worker_id.lock() == Some(std::thread::current().id())
    }

    pub fn set_mem_fault_flag(&self) {
        assert!(
            self.is_current_thread(),
            "set_mem_fault_flag called outside the offload thread"
        );
        self.shared.mem_fault.store(true, Ordering::Release);
    }

    pub fn clear_mem_fault_flag(&self) {
        assert!(
            self.is_current_thread(),
            "clear_mem_fault_flag called outside the offload thread"
        );
        self.shared.mem_fault.store(false, Ordering::Release);
    }

    pub fn mem_fault_active(&self) -> bool {
        self.shared.mem_fault.load(Ordering::Acquire)
    }

    /// Guest range touched by the job in progress, for fault attribution.
    pub fn get_fault_range(&self, writing: bool) -> Option<AddressRange> {
        let job = (*self.shared.current_job.lock())?;
        job.fault_range(&self.shared.memory, writing)
    }

    /// Kind of the job the worker is executing, if any.
    pub fn current_job_kind(&self) -> Option<JobKind> {
        self.shared.current_job.lock().map(|job| job.kind)
    }

    pub fn enqueued_count(&self) -> u64 {
        self.shared.enqueued_count.load(Ordering::Acquire)
    }

    pub fn processed_count(&self) -> u64 {
        self.shared.processed_count.load(Ordering::Acquire)
    }

    /// Inline copies whose source reservation was contended and skipped.
    pub fn unreserved_copy_count(&self) -> u64 {
        self.shared.unreserved_copies.load(Ordering::Relaxed)
    }
}

impl Drop for DmaManager {
    fn drop(&mut self) {
        self.join();
    }
}

impl std::fmt::Debug for DmaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaManager")
            .field("multithreaded", &self.multithreaded)
            .field("enqueued", &self.enqueued_count())
            .field("processed", &self.processed_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null_backend::NullBackendHandle;
    use crate::thread::RsxThread;
    use std::sync::{OnceLock, Weak};
    use std::thread;
    use std::time::Duration;

    const MIB: u32 = 0x10_0000;

    struct Harness {
        memory: Arc<GuestMemory>,
        gpu: Arc<RsxThread>,
        dma: Arc<DmaManager>,
    }

    fn harness_with(settings: Settings, control: Arc<dyn RenderControl>) -> Harness {
        let memory = Arc::new(GuestMemory::new(MIB, MIB).unwrap());
        let iomap = Arc::new(ReservationTable::new(settings.rsx_accurate_res_access));
        let gpu = Arc::new(RsxThread::new());
        let dma = Arc::new(DmaManager::new(
            &settings,
            memory.clone(),
            iomap,
            gpu.clone(),
            control,
        ));
        Harness { memory, gpu, dma }
    }

    fn harness(multithreaded: bool) -> (Harness, NullBackendHandle) {
        let settings = Settings {
            multithreaded_rsx: multithreaded,
            ..Settings::default()
        };
        let handle = NullBackendHandle::new();
        (harness_with(settings, Arc::new(handle.clone())), handle)
    }

    #[test]
    fn test_small_copy_runs_inline() {
        let (h, _) = harness(true);
        let src = [0xAAu8; 16];
        let mut dst = [0u8; 16];
        unsafe { h.dma.copy(dst.as_mut_ptr(), src.as_ptr(), 16) };
        assert_eq!(dst, src);
        assert_eq!(h.dma.enqueued_count(), 0);
    }

    #[test]
    fn test_large_copy_visible_after_sync() {
        let (h, _) = harness(true);
        let src = vec![0x5Au8; 64 * 1024];
        let mut dst = vec![0u8; 64 * 1024];
        unsafe { h.dma.copy(dst.as_mut_ptr(), src.as_ptr(), src.len() as u32) };
        assert_eq!(h.dma.enqueued_count(), 1);
        assert!(h.dma.sync());
        assert_eq!(h.dma.processed_count(), 1);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_single_threaded_runs_everything_inline() {
        let (h, handle) = harness(false);
        assert!(!h.dma.is_multithreaded());
        let src = vec![7u8; 64 * 1024];
        let mut dst = vec![0u8; 64 * 1024];
        unsafe { h.dma.copy(dst.as_mut_ptr(), src.as_ptr(), src.len() as u32) };
        assert_eq!(dst, src);
        h.dma.backend_ctrl(BackendRequest::RunGc);
        assert_eq!(handle.requests(), vec![BackendRequest::RunGc]);
        assert_eq!(h.dma.enqueued_count(), 0);
    }

    #[test]
    fn test_guest_copies() {
        let (h, _) = harness(true);
        let pattern: Vec<u8> = (0..0x2000u32).map(|i| i as u8).collect();
        h.memory.super_write(0x1000, &pattern).unwrap();

        h.dma.copy_guest(0x8000, 0x1000, 0x2000).unwrap();
        // Overlapping forward move.
        h.dma.copy_guest(0x1800, 0x1000, 0x2000).unwrap();
        h.dma.write_guest(0x20000, vec![0xEE; 0x1000]).unwrap();
        assert!(h.dma.sync());

        let mut out = vec![0u8; 0x2000];
        h.memory.super_read(0x8000, &mut out).unwrap();
        assert_eq!(out, pattern);
        h.memory.super_read(0x1800, &mut out).unwrap();
        assert_eq!(out, pattern);
        let mut tail = vec![0u8; 0x1000];
        h.memory.super_read(0x20000, &mut tail).unwrap();
        assert!(tail.iter().all(|&b| b == 0xEE));

        assert!(h.dma.copy_guest(MIB - 4, 0, 8).is_err());
    }

    #[test]
    fn test_index_emulation_queued_and_inline() {
        let (h, _) = harness(true);
        let mut small = vec![0u16; 6];
        unsafe { h.dma.emulate_as_indexed(small.as_mut_ptr(), PrimitiveType::Quads, 4) };
        assert_eq!(small, vec![0, 1, 2, 2, 3, 0]);
        assert_eq!(h.dma.enqueued_count(), 0);

        let count = 4000;
        let mut large = vec![0u16; get_index_count(PrimitiveType::Quads, count) as usize];
        unsafe { h.dma.emulate_as_indexed(large.as_mut_ptr(), PrimitiveType::Quads, count) };
        assert_eq!(h.dma.enqueued_count(), 1);
        assert!(h.dma.sync());
        assert_eq!(&large[large.len() - 6..], &[3996, 3997, 3998, 3998, 3999, 3996]);
    }

    #[test]
    fn test_backend_ctrl_is_queued_in_order() {
        let (h, handle) = harness(true);
        h.dma.backend_ctrl(BackendRequest::QueueSubmit);
        h.dma.backend_ctrl(BackendRequest::Custom { code: 1, arg: 2 });
        assert!(h.dma.sync());
        assert_eq!(
            handle.requests(),
            vec![
                BackendRequest::QueueSubmit,
                BackendRequest::Custom { code: 1, arg: 2 }
            ]
        );
    }

    #[test]
    fn test_join_publishes_sentinel() {
        let (h, _) = harness(true);
        let src = vec![1u8; 8192];
        let mut dst = vec![0u8; 8192];
        unsafe { h.dma.copy(dst.as_mut_ptr(), src.as_ptr(), 8192) };
        h.dma.join();
        assert_eq!(dst, src);
        assert_eq!(h.dma.processed_count(), u64::MAX);
        assert!(h.dma.sync());
        // A second join is harmless.
        h.dma.join();
    }

    #[test]
    fn test_many_producers_quiesce() {
        let (h, handle) = harness(true);
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let dma = h.dma.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        dma.backend_ctrl(BackendRequest::RunGc);
                    }
                    dma.sync()
                })
            })
            .collect();
        for producer in producers {
            assert!(producer.join().unwrap());
        }
        assert!(h.dma.sync());
        assert_eq!(handle.requests().len(), 400);
        assert_eq!(h.dma.processed_count(), 400);
    }

    /// Enters fault recovery from inside a backend request.
    #[derive(Default)]
    struct FaultingControl {
        dma: OnceLock<Weak<DmaManager>>,
        entered: AtomicBool,
        release: AtomicBool,
        range_seen: Mutex<Option<Option<AddressRange>>>,
    }

    impl RenderControl for FaultingControl {
        fn renderctl(&self, _request: BackendRequest) {
            let Some(dma) = self.dma.get().and_then(Weak::upgrade) else {
                return;
            };
            *self.range_seen.lock() = Some(dma.get_fault_range(true));
            dma.set_mem_fault_flag();
            self.entered.store(true, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            dma.clear_mem_fault_flag();
        }
    }

    #[test]
    fn test_sync_on_gpu_thread_aborts_during_fault_recovery() {
        let control = Arc::new(FaultingControl::default());
        let h = harness_with(Settings::default(), control.clone());
        assert!(control.dma.set(Arc::downgrade(&h.dma)).is_ok());
        h.gpu.bind_current();

        h.dma.backend_ctrl(BackendRequest::QueueSubmit);
        while !control.entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        assert!(h.dma.mem_fault_active());
        assert_eq!(h.dma.current_job_kind(), Some(JobKind::Callback));
        assert!(!h.dma.sync());

        control.release.store(true, Ordering::SeqCst);
        assert!(h.dma.sync());
        assert!(!h.dma.mem_fault_active());
        assert_eq!(*control.range_seen.lock(), Some(None));
        h.gpu.unbind();
    }

    #[test]
    #[should_panic(expected = "outside the offload thread")]
    fn test_fault_flag_asserts_thread() {
        let (h, _) = harness(true);
        h.dma.set_mem_fault_flag();
    }

    #[test]
    fn test_fault_range_by_job_kind() {
        let memory = GuestMemory::new(MIB, MIB).unwrap();
        let src = memory.super_ptr(0x1000, 0x100).unwrap() as usize;
        let dst = memory.super_ptr(0x4000, 0x100).unwrap() as usize;

        let raw = JobView {
            kind: JobKind::RawCopy,
            dst,
            src,
            length: 0x100,
        };
        assert_eq!(
            raw.fault_range(&memory, false),
            Some(AddressRange::start_length(0x1000, 0x100))
        );
        assert_eq!(
            raw.fault_range(&memory, true),
            Some(AddressRange::start_length(0x4000, 0x100))
        );

        let index = JobView::of(&Transport::IndexEmulate {
            dst: HostPtr(dst as *mut u8),
            primitive: PrimitiveType::Quads,
            count: 8,
        });
        assert_eq!(
            index.fault_range(&memory, true),
            Some(AddressRange::start_length(0x4000, 24))
        );

        let host = vec![0u8; 4];
        let vector = JobView {
            kind: JobKind::VectorCopy,
            dst: host.as_ptr() as usize,
            src: 0,
            length: 4,
        };
        assert_eq!(vector.fault_range(&memory, true), None);
    }

    #[test]
    fn test_inline_copy_under_held_reservation_does_not_deadlock() {
        let (h, _) = harness(true);
        let iomap = h.dma.shared.iomap.clone();
        let _held = ExclusiveReservation::new(&iomap, 0x1000, 0x100);
        h.memory.super_write(0x1000, &[9u8; 16]).unwrap();
        let mut dst = [0u8; 16];
        let src = h.memory.super_ptr(0x1000, 16).unwrap();
        unsafe { h.dma.copy(dst.as_mut_ptr(), src, 16) };
        assert_eq!(dst, [9u8; 16]);
    }

    #[test]
    fn test_overlapping_copy_sees_earlier_queued_write() {
        let (h, _) = harness(true);
        let fill: Vec<u8> = (0..0x2000u32).map(|i| (i % 251) as u8).collect();
        h.dma.write_guest(0x1000, fill.clone()).unwrap();
        h.dma.copy_guest(0x1800, 0x1000, 0x2000).unwrap();
        assert_eq!(h.dma.enqueued_count(), 2);
        assert!(h.dma.sync());

        let mut out = vec![0u8; 0x2000];
        h.memory.super_read(0x1800, &mut out).unwrap();
        assert_eq!(out, fill);
    }

    #[test]
    fn test_reserved_copy_skips_relocking_held_source() {
        let (h, _) = harness(true);
        let iomap = h.dma.shared.iomap.clone();
        h.memory.super_write(0x1000, &[3u8; 0x100]).unwrap();
        let held = ExclusiveReservation::new_dual(&iomap, 0x4000, 0x100, 0x1000, 0x100);
        assert!(held.is_locked());

        h.dma.copy_guest_reserved(0x4000, 0x1000, 0x100).unwrap();
        assert_eq!(h.dma.unreserved_copy_count(), 0);

        // A plain inline copy cannot take the held stripe and says so.
        h.dma.copy_guest(0x4100, 0x1000, 0x100).unwrap();
        assert_eq!(h.dma.unreserved_copy_count(), 1);
        drop(held);

        let mut out = [0u8; 0x200];
        h.memory.super_read(0x4000, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 3));
    }

    #[test]
    fn test_work_after_join_runs_inline() {
        let (h, handle) = harness(true);
        h.dma.join();
        let before = h.dma.enqueued_count();

        let src = vec![0x42u8; 64 * 1024];
        let mut dst = vec![0u8; 64 * 1024];
        unsafe { h.dma.copy(dst.as_mut_ptr(), src.as_ptr(), src.len() as u32) };
        assert_eq!(dst, src);

        h.dma.write_guest(0x10000, vec![0x24; 0x2000]).unwrap();
        let mut out = vec![0u8; 0x2000];
        h.memory.super_read(0x10000, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0x24));

        h.dma.backend_ctrl(BackendRequest::RunGc);
        assert_eq!(handle.requests(), vec![BackendRequest::RunGc]);
        assert_eq!(h.dma.enqueued_count(), before);
        assert!(h.dma.sync());
    }

    #[test]
    fn test_misaligned_index_buffer_is_ignored() {
        let (h, _) = harness(true);
        let mut buf = vec![0xFFFFu16; 16];
        let misaligned = unsafe { (buf.as_mut_ptr() as *mut u8).add(1) as *mut u16 };
        unsafe { h.dma.emulate_as_indexed(misaligned, PrimitiveType::Quads, 4) };
        assert!(h.dma.sync());
        assert_eq!(h.dma.enqueued_count(), 0);
        assert!(buf.iter().all(|&v| v == 0xFFFF));
    }
}
