// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest page protection over pending report sinks.
//!
//! While a report is queued its page is made inaccessible to the guest. The
//! first guest touch of a page that still has live reports turns the
//! optimization off for that whole memory location: every page is unlocked
//! and the reports still in flight are counted as critical, which makes the
//! next ZCULL sync drain them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use rsxcore_common::{page_start, GuestAddr, MemoryLocation, PAGE_SIZE};
use rsxcore_memory::{AccessViolationHandler, GuestMemory, MemoryPermission};

use crate::engine_lock::EngineLock;
use crate::thread::GpuThread;

#[derive(Debug, Clone, Copy)]
struct LockedPage {
    refs: u32,
    prot: MemoryPermission,
}

impl Default for LockedPage {
    fn default() -> Self {
        Self {
            refs: 0,
            prot: MemoryPermission::READ_WRITE,
        }
    }
}

type PageMap = HashMap<GuestAddr, LockedPage>;

pub struct ReportPageGuard {
    memory: Weak<GuestMemory>,
    thread: Arc<dyn GpuThread>,
    pages: RwLock<[PageMap; MemoryLocation::COUNT]>,
    accessed: [AtomicBool; MemoryLocation::COUNT],
    critical_reports: AtomicU32,
}

impl ReportPageGuard {
    pub fn new(memory: &Arc<GuestMemory>, thread: Arc<dyn GpuThread>) -> Self {
        Self {
            memory: Arc::downgrade(memory),
            thread,
            pages: RwLock::new([PageMap::new(), PageMap::new()]),
            accessed: [AtomicBool::new(false), AtomicBool::new(false)],
            critical_reports: AtomicU32::new(0),
        }
    }

    /// Reports whose sink the guest has already looked at.
    pub fn critical_reports_in_flight(&self) -> u32 {
        self.critical_reports.load(Ordering::Acquire)
    }

    pub fn optimizations_disabled(&self, location: MemoryLocation) -> bool {
        self.accessed[location.index()].load(Ordering::Acquire)
    }

    pub fn is_page_locked(&self, addr: GuestAddr) -> bool {
        let location = MemoryLocation::classify(addr);
        self.pages.read()[location.index()]
            .get(&page_start(addr))
            .is_some_and(|page| page.prot != MemoryPermission::READ_WRITE)
    }

    fn set_protection(&self, page: GuestAddr, prot: MemoryPermission) {
        let Some(memory) = self.memory.upgrade() else {
            return;
        };
        if let Err(e) = memory.protect(page, PAGE_SIZE, prot) {
            log::error!("ZCULL: failed to protect report page 0x{:08X}: {}", page, e);
        }
    }

    pub fn on_report_enqueued(&self, sink: GuestAddr) {
        let location = MemoryLocation::classify(sink);
        let mut pages = self.pages.write();

        if self.optimizations_disabled(location) {
            self.critical_reports.fetch_add(1, Ordering::AcqRel);
            return;
        }

        let page_address = page_start(sink);
        let page = pages[location.index()].entry(page_address).or_default();
        page.refs += 1;
        if page.prot == MemoryPermission::READ_WRITE {
            page.prot = MemoryPermission::NONE;
            self.set_protection(page_address, MemoryPermission::NONE);
        }
    }

    pub fn on_report_completed(&self, sink: GuestAddr) {
        let location = MemoryLocation::classify(sink);
        let mut pages = self.pages.write();

        if self.optimizations_disabled(location) {
            let _ = self
                .critical_reports
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            return;
        }

        if let Some(page) = pages[location.index()].get_mut(&page_start(sink)) {
            assert!(page.refs > 0, "report page 0x{:08X} released too often", page_start(sink));
            page.refs -= 1;
        }
    }

    fn disable_optimizations_locked(&self, pages: &mut [PageMap; MemoryLocation::COUNT], location: MemoryLocation) {
        if !self.accessed[location.index()].swap(true, Ordering::AcqRel) {
            log::warn!(
                "ZCULL: reports area in {} memory was accessed, optimizations disabled",
                location
            );
        }

        for (&address, page) in pages[location.index()].iter_mut() {
            if page.prot != MemoryPermission::READ_WRITE {
                self.set_protection(address, MemoryPermission::READ_WRITE);
                page.prot = MemoryPermission::READ_WRITE;
            }
            self.critical_reports.fetch_add(page.refs, Ordering::AcqRel);
            page.refs = 0;
        }
        pages[location.index()].clear();
    }

    /// Unlock every report page in `location` and treat its live reports as
    /// critical from now on.
    pub fn disable_optimizations(&self, location: MemoryLocation) {
        let mut pages = self.pages.write();
        self.disable_optimizations_locked(&mut pages, location);
    }

    /// Unlock pages that no longer carry pending reports.
    pub fn cleanup_unreferenced(&self) {
        let mut pages = self.pages.write();
        for map in pages.iter_mut() {
            map.retain(|&address, page| {
                if page.refs > 0 {
                    return true;
                }
                if page.prot != MemoryPermission::READ_WRITE {
                    self.set_protection(address, MemoryPermission::READ_WRITE);
                }
                false
            });
        }
    }
}

impl AccessViolationHandler for ReportPageGuard {
    fn on_access_violation(&self, addr: GuestAddr, _writing: bool) -> bool {
        let location = MemoryLocation::classify(addr);
        if self.optimizations_disabled(location) {
            return false;
        }

        let page_address = page_start(addr);
        let live = {
            let mut pages = self.pages.write();
            let Some(page) = pages[location.index()].get(&page_address).copied() else {
                return false;
            };
            if page.prot == MemoryPermission::READ_WRITE {
                return false;
            }
            if page.refs == 0 {
                // Stale lock, nothing left to protect.
                self.set_protection(page_address, MemoryPermission::READ_WRITE);
                pages[location.index()].remove(&page_address);
                return true;
            }
            true
        };

        if live {
            // The pages lock must not be held while the GPU thread is paused.
            let _eng = EngineLock::new(self.thread.as_ref());
            let mut pages = self.pages.write();
            self.disable_optimizations_locked(&mut pages, location);
        }
        live
    }
}

impl std::fmt::Debug for ReportPageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportPageGuard")
            .field("critical_reports", &self.critical_reports_in_flight())
            .finish_non_exhaustive()
    }
}
