// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest memory as seen by the RSX.
//!
//! Two pools are mapped: main memory at guest address 0 and local memory at
//! [`LOCAL_MEM_BASE`]. Both live in one anonymous mmap; main pages come first
//! in the backing store, local pages follow.
//!
//! Every page carries a protection byte. Guest-side accessors (`read`,
//! `write`, ...) honour it and route faults through the registered
//! [`AccessViolationHandler`]s. GPU-side accessors (`super_*`) bypass
//! protection entirely, which is how report writes reach pages the renderer
//! has protected against the guest.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use memmap2::MmapMut;
use thiserror::Error;

use rsxcore_common::{
    is_page_aligned, page_start, GuestAddr, MemoryLocation, Settings, LOCAL_MEM_BASE,
    PAGE_MASK, PAGE_SHIFT, PAGE_SIZE,
};
use rsxcore_lockfree::LfBunch;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors returned by [`GuestMemory`] operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("range at 0x{addr:08X} (+0x{len:X}) is not mapped")]
    NotMapped { addr: GuestAddr, len: u64 },

    #[error("size 0x{0:X} is not page-aligned")]
    MisalignedSize(u32),

    #[error("size must be non-zero")]
    ZeroSize,

    #[error("main memory of 0x{0:X} bytes overlaps the local memory window")]
    MainTooLarge(u32),

    #[error("access violation at 0x{addr:08X} ({})", access_kind(.writing))]
    AccessViolation { addr: GuestAddr, writing: bool },

    #[error("failed to create backing mmap: {0}")]
    MmapFailed(#[from] std::io::Error),
}

fn access_kind(writing: &bool) -> &'static str {
    if *writing {
        "write"
    } else {
        "read"
    }
}

/// Result alias for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

// ---------------------------------------------------------------------------
// Permission flags
// ---------------------------------------------------------------------------

bitflags! {
    /// Guest-visible page protection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPermission: u8 {
        const READ  = 1;
        const WRITE = 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const NONE       = 0;
    }
}

impl std::fmt::Display for MemoryPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = if self.contains(Self::READ) { 'R' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'W' } else { '-' };
        write!(f, "{r}{w}")
    }
}

// ---------------------------------------------------------------------------
// Access violation hook
// ---------------------------------------------------------------------------

/// Receives guest faults on protected pages.
pub trait AccessViolationHandler: Send + Sync {
    /// Return `true` if the fault was resolved and the access should retry.
    fn on_access_violation(&self, addr: GuestAddr, writing: bool) -> bool;
}

// ---------------------------------------------------------------------------
// GuestMemory
// ---------------------------------------------------------------------------

pub struct GuestMemory {
    /// Keeps the mapping alive; all access goes through `base`.
    _backing: MmapMut,
    base: *mut u8,
    main_size: u32,
    local_size: u32,
    /// One byte per page: main pages first, then local pages.
    protection: Box<[AtomicU8]>,
    handlers: LfBunch<Arc<dyn AccessViolationHandler>>,
}

// SAFETY: the backing store is plain bytes shared with the emulated hardware.
// Overlapping accesses are serialized by the reservation lock, not by Rust.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Map `main_size` bytes of main memory and `local_size` bytes of local
    /// memory, all pages read/write.
    pub fn new(main_size: u32, local_size: u32) -> MemoryResult<Self> {
        for size in [main_size, local_size] {
            if size == 0 {
                return Err(MemoryError::ZeroSize);
            }
            if !is_page_aligned(size) {
                return Err(MemoryError::MisalignedSize(size));
            }
        }
        if main_size > LOCAL_MEM_BASE {
            return Err(MemoryError::MainTooLarge(main_size));
        }

        let total = main_size as usize + local_size as usize;
        let mut backing = MmapMut::map_anon(total)?;
        let base = backing.as_mut_ptr();
        let page_count = total >> PAGE_SHIFT;
        let protection = (0..page_count)
            .map(|_| AtomicU8::new(MemoryPermission::READ_WRITE.bits()))
            .collect();

        log::debug!(
            "GuestMemory: main=0x{:X} local=0x{:X} ({} pages)",
            main_size,
            local_size,
            page_count
        );

        Ok(Self {
            _backing: backing,
            base,
            main_size,
            local_size,
            protection,
            handlers: LfBunch::new(),
        })
    }

    pub fn from_settings(settings: &Settings) -> MemoryResult<Self> {
        Self::new(settings.main_memory_size, settings.local_memory_size)
    }

    pub fn main_size(&self) -> u32 {
        self.main_size
    }

    pub fn local_size(&self) -> u32 {
        self.local_size
    }

    // -- Translation --------------------------------------------------------

    /// Byte offset into the backing store for `[addr, addr + len)`.
    fn offset_of(&self, addr: GuestAddr, len: usize) -> MemoryResult<usize> {
        let len64 = len as u64;
        let not_mapped = MemoryError::NotMapped { addr, len: len64 };
        match MemoryLocation::classify(addr) {
            MemoryLocation::Main => {
                if addr as u64 + len64 <= self.main_size as u64 {
                    Ok(addr as usize)
                } else {
                    Err(not_mapped)
                }
            }
            MemoryLocation::Local => {
                let rel = (addr - LOCAL_MEM_BASE) as u64;
                if rel + len64 <= self.local_size as u64 {
                    Ok(self.main_size as usize + rel as usize)
                } else {
                    Err(not_mapped)
                }
            }
        }
    }

    pub fn is_mapped(&self, addr: GuestAddr, len: u32) -> bool {
        self.offset_of(addr, len as usize).is_ok()
    }

    /// Host pointer to guest memory, bypassing page protection.
    pub fn super_ptr(&self, addr: GuestAddr, len: u32) -> MemoryResult<*mut u8> {
        let off = self.offset_of(addr, len as usize)?;
        // SAFETY: `off + len` is inside the mapping.
        Ok(unsafe { self.base.add(off) })
    }

    /// Reverse-translate a host pointer into a guest address.
    pub fn try_get_addr(&self, ptr: *const u8) -> Option<GuestAddr> {
        let base = self.base as usize;
        let ptr = ptr as usize;
        if ptr < base {
            return None;
        }
        let off = ptr - base;
        if off < self.main_size as usize {
            Some(off as GuestAddr)
        } else if off < self.main_size as usize + self.local_size as usize {
            Some(LOCAL_MEM_BASE + (off - self.main_size as usize) as GuestAddr)
        } else {
            None
        }
    }

    // -- GPU-side access ----------------------------------------------------

    /// Copy guest bytes out without protection checks.
    pub fn super_read(&self, addr: GuestAddr, buf: &mut [u8]) -> MemoryResult<()> {
        let off = self.offset_of(addr, buf.len())?;
        // SAFETY: range checked above; `buf` cannot alias the mapping.
        unsafe { std::ptr::copy_nonoverlapping(self.base.add(off), buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copy bytes into guest memory without protection checks.
    pub fn super_write(&self, addr: GuestAddr, data: &[u8]) -> MemoryResult<()> {
        let off = self.offset_of(addr, data.len())?;
        // SAFETY: range checked above; `data` cannot alias the mapping.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(off), data.len()) };
        Ok(())
    }

    /// Guest-to-guest move without protection checks; ranges may overlap.
    pub fn super_copy(&self, dst: GuestAddr, src: GuestAddr, len: u32) -> MemoryResult<()> {
        let src_off = self.offset_of(src, len as usize)?;
        let dst_off = self.offset_of(dst, len as usize)?;
        // SAFETY: both ranges checked above; `copy` handles overlap.
        unsafe { std::ptr::copy(self.base.add(src_off), self.base.add(dst_off), len as usize) };
        Ok(())
    }

    pub fn super_read_u32(&self, addr: GuestAddr) -> MemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.super_read(addr, &mut buf)?;
        Ok(BigEndian::read_u32(&buf))
    }

    pub fn super_write_u32(&self, addr: GuestAddr, value: u32) -> MemoryResult<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.super_write(addr, &buf)
    }

    // -- Page protection ----------------------------------------------------

    fn page_index(&self, addr: GuestAddr) -> MemoryResult<usize> {
        Ok(self.offset_of(page_start(addr), PAGE_SIZE as usize)? >> PAGE_SHIFT)
    }

    /// Change guest protection for every page touched by `[addr, addr + len)`.
    pub fn protect(&self, addr: GuestAddr, len: u32, permission: MemoryPermission) -> MemoryResult<()> {
        if len == 0 {
            return Ok(());
        }
        self.offset_of(addr, len as usize)?;
        let first = page_start(addr);
        let last = page_start((addr as u64 + len as u64 - 1) as GuestAddr);
        let mut page = first;
        loop {
            let idx = self.page_index(page)?;
            self.protection[idx].store(permission.bits(), Ordering::Release);
            if page == last {
                break;
            }
            page += PAGE_SIZE;
        }
        log::trace!(
            "GuestMemory::protect [0x{:08X}..0x{:08X}] {}",
            first,
            last + PAGE_MASK,
            permission
        );
        Ok(())
    }

    pub fn permission(&self, addr: GuestAddr) -> MemoryResult<MemoryPermission> {
        let idx = self.page_index(addr)?;
        Ok(MemoryPermission::from_bits_truncate(
            self.protection[idx].load(Ordering::Acquire),
        ))
    }

    // -- Fault routing ------------------------------------------------------

    /// Register a fault handler. Returns `false` if it was already registered.
    pub fn add_violation_handler(&self, handler: Arc<dyn AccessViolationHandler>) -> bool {
        self.handlers
            .push_if(handler, |new, existing| !Arc::ptr_eq(new, existing))
            .is_ok()
    }

    fn raise_violation(&self, addr: GuestAddr, writing: bool) -> bool {
        self.handlers
            .iter()
            .any(|handler| handler.on_access_violation(addr, writing))
    }

    /// Check guest access to every page of the range, giving handlers one
    /// chance per page to resolve a fault.
    fn check_access(&self, addr: GuestAddr, len: usize, writing: bool) -> MemoryResult<()> {
        if len == 0 {
            return Ok(());
        }
        self.offset_of(addr, len)?;
        let required = if writing {
            MemoryPermission::WRITE
        } else {
            MemoryPermission::READ
        };

        let last = page_start((addr as u64 + len as u64 - 1) as GuestAddr);
        let mut page = page_start(addr);
        loop {
            let at = page.max(addr);
            if !self.permission(at)?.contains(required) {
                let resolved = self.raise_violation(at, writing)
                    && self.permission(at)?.contains(required);
                if !resolved {
                    return Err(MemoryError::AccessViolation {
                        addr: at,
                        writing,
                    });
                }
            }
            if page == last {
                break;
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    // -- Guest-side access --------------------------------------------------

    pub fn read(&self, addr: GuestAddr, buf: &mut [u8]) -> MemoryResult<()> {
        self.check_access(addr, buf.len(), false)?;
        self.super_read(addr, buf)
    }

    pub fn write(&self, addr: GuestAddr, data: &[u8]) -> MemoryResult<()> {
        self.check_access(addr, data.len(), true)?;
        self.super_write(addr, data)
    }

    /// Read a big-endian `u32` as the guest would.
    pub fn read_u32(&self, addr: GuestAddr) -> MemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(BigEndian::read_u32(&buf))
    }

    /// Write a big-endian `u32` as the guest would.
    pub fn write_u32(&self, addr: GuestAddr, value: u32) -> MemoryResult<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.write(addr, &buf)
    }
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("main_size", &self.main_size)
            .field("local_size", &self.local_size)
            .finish_non_exhaustive()
    }
}
