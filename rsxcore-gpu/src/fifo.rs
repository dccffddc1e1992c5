// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Multi-producer command ring feeding the GPU thread.
//!
//! Producers reserve slots with [`LfFifo::push_begin`] and publish each
//! packed method write with a release store. The GPU thread consumes slots
//! in order and stops at the first one whose producer has not published yet.

use std::sync::atomic::{AtomicU64, Ordering};

use rsxcore_lockfree::LfFifo;

/// Slots per ring block.
const RING_BLOCK: usize = 256;

/// Set on every published slot; a zero slot is still being written.
const SLOT_VALID: u64 = 1 << 63;

/// One register write pulled from the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingEntry {
    pub subchannel: u32,
    pub method: u32,
    pub value: u32,
}

impl RingEntry {
    fn pack(&self) -> u64 {
        SLOT_VALID
            | (u64::from(self.subchannel & 0x7) << 48)
            | (u64::from(self.method & 0xFFFF) << 32)
            | u64::from(self.value)
    }

    fn unpack(raw: u64) -> Self {
        Self {
            subchannel: ((raw >> 48) & 0x7) as u32,
            method: ((raw >> 32) & 0xFFFF) as u32,
            value: raw as u32,
        }
    }
}

pub struct CommandRing {
    fifo: LfFifo<AtomicU64, RING_BLOCK>,
}

impl CommandRing {
    pub fn new() -> Self {
        Self { fifo: LfFifo::new() }
    }

    /// Queue one register write. Callable from any thread.
    pub fn push(&self, subchannel: u32, method: u32, value: u32) {
        let pos = self.fifo.push_begin(1);
        let entry = RingEntry {
            subchannel,
            method,
            value,
        };
        self.fifo.get(pos).store(entry.pack(), Ordering::Release);
    }

    /// Queue a run of incrementing register writes that stay contiguous in the
    /// ring.
    pub fn push_burst(&self, subchannel: u32, method: u32, values: &[u32]) {
        if values.is_empty() {
            return;
        }
        let pos = self.fifo.push_begin(values.len() as u32);
        for (i, &value) in values.iter().enumerate() {
            let entry = RingEntry {
                subchannel,
                method: method + 4 * i as u32,
                value,
            };
            self.fifo.get(pos + i as u32).store(entry.pack(), Ordering::Release);
        }
    }

    /// Slots reserved but not consumed yet.
    pub fn len(&self) -> u32 {
        self.fifo.size()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    /// Take up to `max` published entries in submission order. Only the GPU
    /// thread may call this.
    pub fn drain(&self, max: usize) -> Vec<RingEntry> {
        let available = self.fifo.size() as usize;
        let start = self.fifo.peek();
        let mut entries = Vec::with_capacity(available.min(max));

        for i in 0..available.min(max) {
            let slot = self.fifo.get(start + i as u32);
            let raw = slot.load(Ordering::Acquire);
            if raw & SLOT_VALID == 0 {
                // Reserved but not yet published.
                break;
            }
            slot.store(0, Ordering::Relaxed);
            entries.push(RingEntry::unpack(raw));
        }

        if !entries.is_empty() {
            self.fifo.pop_end(entries.len() as u32);
            log::trace!("CommandRing: drained {} entries", entries.len());
        }
        entries
    }
}

impl Default for CommandRing {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommandRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRing").field("pending", &self.len()).finish()
    }
}
