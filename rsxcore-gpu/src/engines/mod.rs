// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! RSX engine classes and subchannel definitions.
//!
//! Each engine decodes the register writes for one object class. Engines do
//! not own memory, the offload manager or ZCULL; those are lent to every
//! register write through [`EngineContext`].

pub mod nv0039;
pub mod nv3062;
pub mod nv3089;
pub mod nv308a;
pub mod nv4097;

use rsxcore_common::{GuestAddr, MemoryLocation, LOCAL_MEM_BASE};
use rsxcore_memory::{GuestMemory, ReservationTable};

use crate::offload::DmaManager;
use crate::thread::GpuThread;
use crate::zcull::ZcullControl;

use nv3062::Surface2d;

/// RSX object class numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClassId {
    /// Curie 3D.
    Nv4097 = 0x4097,
    /// Memory-to-memory buffer transfer.
    Nv0039 = 0x0039,
    /// 2D surface (blit destination).
    Nv3062 = 0x3062,
    /// Image from CPU.
    Nv308a = 0x308A,
    /// Scaled image.
    Nv3089 = 0x3089,
}

/// Subchannel assignment used by the command processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubChannel {
    Nv4097 = 0,
    Nv0039 = 1,
    Nv3062 = 2,
    Nv308a = 3,
    Nv3089 = 4,
}

impl SubChannel {
    pub const COUNT: usize = 5;

    pub fn from_raw(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Nv4097),
            1 => Some(Self::Nv0039),
            2 => Some(Self::Nv3062),
            3 => Some(Self::Nv308a),
            4 => Some(Self::Nv3089),
            _ => None,
        }
    }
}

/// Registers per engine; methods are byte offsets, so the index is `method >> 2`.
pub const ENGINE_REG_COUNT: usize = 0x800;

// Context DMA handles selecting a memory location.
pub const CONTEXT_DMA_MEMORY_FRAME_BUFFER: u32 = 0xFEED_0000;
pub const CONTEXT_DMA_MEMORY_HOST_BUFFER: u32 = 0xFEED_0001;
pub const CONTEXT_DMA_REPORT_LOCATION_LOCAL: u32 = 0x6662_6660;
pub const CONTEXT_DMA_REPORT_LOCATION_MAIN: u32 = 0xBAD6_8000;

/// Memory location named by a context DMA handle.
pub fn dma_location(handle: u32) -> Option<MemoryLocation> {
    match handle {
        CONTEXT_DMA_MEMORY_FRAME_BUFFER | CONTEXT_DMA_REPORT_LOCATION_LOCAL => {
            Some(MemoryLocation::Local)
        }
        CONTEXT_DMA_MEMORY_HOST_BUFFER | CONTEXT_DMA_REPORT_LOCATION_MAIN => {
            Some(MemoryLocation::Main)
        }
        _ => None,
    }
}

/// Guest address of `offset` inside `location`.
pub fn resolve_address(location: MemoryLocation, offset: u32) -> GuestAddr {
    match location {
        MemoryLocation::Local => LOCAL_MEM_BASE.wrapping_add(offset),
        MemoryLocation::Main => offset,
    }
}

/// Everything an engine may touch while handling a register write.
pub struct EngineContext<'a> {
    pub memory: &'a GuestMemory,
    pub iomap: &'a ReservationTable,
    pub dma: &'a DmaManager,
    pub thread: &'a dyn GpuThread,
    pub zcull: &'a mut ZcullControl,
    /// Blit destination shared by the 2D classes.
    pub surface: &'a mut Surface2d,
}

/// An engine that accepts register writes.
pub trait Engine: Send {
    fn class_id(&self) -> ClassId;

    /// Write `value` to the method at byte offset `method`.
    fn write_reg(&mut self, method: u32, value: u32, ctx: &mut EngineContext<'_>);

    /// Write a run of values starting at `method`.
    fn write_burst(&mut self, method: u32, values: &[u32], increment: bool, ctx: &mut EngineContext<'_>) {
        for (i, &value) in values.iter().enumerate() {
            let target = if increment { method + 4 * i as u32 } else { method };
            self.write_reg(target, value, ctx);
        }
    }
}

/// Plain register file shared by the engines.
pub(crate) struct RegisterFile {
    regs: Box<[u32; ENGINE_REG_COUNT]>,
}

impl RegisterFile {
    pub(crate) fn new() -> Self {
        Self {
            regs: Box::new([0u32; ENGINE_REG_COUNT]),
        }
    }

    pub(crate) fn get(&self, method: u32) -> u32 {
        self.regs
            .get((method >> 2) as usize)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn set(&mut self, method: u32, value: u32) {
        if let Some(slot) = self.regs.get_mut((method >> 2) as usize) {
            *slot = value;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A self-contained engine environment over small guest memory.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, OnceLock, Weak};

    use rsxcore_common::Settings;
    use rsxcore_memory::{GuestMemory, ReservationTable};

    use super::nv3062::Surface2d;
    use super::EngineContext;
    use crate::backend::null_backend::{NullBackend, NullBackendHandle};
    use crate::backend::{BackendRequest, RenderControl};
    use crate::clock::ManualClock;
    use crate::offload::DmaManager;
    use crate::thread::RsxThread;
    use crate::zcull::ZcullControl;

    /// Backend control that parks the offload worker in fault recovery on
    /// request until released.
    #[derive(Default)]
    pub struct StallControl {
        dma: OnceLock<Weak<DmaManager>>,
        entered: AtomicBool,
        released: AtomicBool,
    }

    impl StallControl {
        /// Queue a request that leaves the worker faulted, and wait for it.
        pub fn enter(&self, dma: &DmaManager) {
            self.released.store(false, Ordering::SeqCst);
            self.entered.store(false, Ordering::SeqCst);
            dma.backend_ctrl(BackendRequest::Custom { code: 0xFA, arg: 0 });
            while !self.entered.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
        }

        pub fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    impl RenderControl for StallControl {
        fn renderctl(&self, _request: BackendRequest) {
            let Some(dma) = self.dma.get().and_then(Weak::upgrade) else {
                return;
            };
            dma.set_mem_fault_flag();
            self.entered.store(true, Ordering::SeqCst);
            while !self.released.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            dma.clear_mem_fault_flag();
        }
    }

    pub struct TestEnv {
        pub memory: Arc<GuestMemory>,
        pub iomap: Arc<ReservationTable>,
        pub thread: Arc<RsxThread>,
        pub handle: NullBackendHandle,
        pub stall: Arc<StallControl>,
        pub clock: Arc<ManualClock>,
        pub dma: Arc<DmaManager>,
        pub zcull: ZcullControl,
        pub surface: Surface2d,
    }

    impl TestEnv {
        pub fn new(multithreaded: bool) -> Self {
            Self::build(multithreaded, false)
        }

        /// Backend requests go to a [`StallControl`] instead of the null
        /// backend handle.
        pub fn stalling(multithreaded: bool) -> Self {
            Self::build(multithreaded, true)
        }

        fn build(multithreaded: bool, stalling: bool) -> Self {
            let mut settings = Settings::default();
            settings.multithreaded_rsx = multithreaded;
            settings.occlusion_query_count = 8;
            settings.max_stat_registers = 8;

            let memory = Arc::new(GuestMemory::new(0x40_0000, 0x40_0000).unwrap());
            let iomap = Arc::new(ReservationTable::new(true));
            let thread = Arc::new(RsxThread::new());
            let backend = NullBackend::new();
            let handle = backend.handle();
            let stall = Arc::new(StallControl::default());
            let clock = Arc::new(ManualClock::new(1_000));
            let control: Arc<dyn RenderControl> = if stalling {
                stall.clone()
            } else {
                Arc::new(handle.clone())
            };
            let dma = Arc::new(DmaManager::new(
                &settings,
                memory.clone(),
                iomap.clone(),
                thread.clone(),
                control,
            ));
            assert!(stall.dma.set(Arc::downgrade(&dma)).is_ok());
            let zcull = ZcullControl::new(
                &settings,
                memory.clone(),
                iomap.clone(),
                thread.clone(),
                Box::new(backend),
                clock.clone(),
            );
            Self {
                memory,
                iomap,
                thread,
                handle,
                stall,
                clock,
                dma,
                zcull,
                surface: Surface2d::default(),
            }
        }

        pub fn ctx(&mut self) -> EngineContext<'_> {
            EngineContext {
                memory: &self.memory,
                iomap: &self.iomap,
                dma: &self.dma,
                thread: self.thread.as_ref(),
                zcull: &mut self.zcull,
                surface: &mut self.surface,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subchannel_from_raw() {
        assert_eq!(SubChannel::from_raw(0), Some(SubChannel::Nv4097));
        assert_eq!(SubChannel::from_raw(4), Some(SubChannel::Nv3089));
        assert_eq!(SubChannel::from_raw(5), None);
    }

    #[test]
    fn test_class_ids() {
        assert_eq!(ClassId::Nv4097 as u32, 0x4097);
        assert_eq!(ClassId::Nv308a as u32, 0x308A);
        assert_eq!(ClassId::Nv3089 as u32, 0x3089);
    }

    #[test]
    fn test_dma_locations() {
        assert_eq!(
            dma_location(CONTEXT_DMA_MEMORY_FRAME_BUFFER),
            Some(MemoryLocation::Local)
        );
        assert_eq!(
            dma_location(CONTEXT_DMA_REPORT_LOCATION_MAIN),
            Some(MemoryLocation::Main)
        );
        assert_eq!(dma_location(0x1234), None);
        assert_eq!(resolve_address(MemoryLocation::Local, 0x10), LOCAL_MEM_BASE + 0x10);
        assert_eq!(resolve_address(MemoryLocation::Main, 0x10), 0x10);
    }

    #[test]
    fn test_register_file_bounds() {
        let mut regs = RegisterFile::new();
        regs.set(0x1D88, 7);
        assert_eq!(regs.get(0x1D88), 7);
        regs.set(0x10_0000, 1);
        assert_eq!(regs.get(0x10_0000), 0);
    }
}
