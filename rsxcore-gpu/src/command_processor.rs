// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! RSX command buffer processor.
//!
//! Decodes method headers from command buffers in guest memory (or single
//! writes pulled from the [`CommandRing`](crate::fifo::CommandRing)) and
//! dispatches register writes to the engine bound to each subchannel.
//!
//! ## Method Header (32 bits)
//!
//! | Bits    | Field                    |
//! |---------|--------------------------|
//! | 12:2    | Method offset (bytes)    |
//! | 15:13   | Subchannel               |
//! | 28:18   | Argument count           |
//! | 30      | Non-incrementing         |
//!
//! Jumps, calls and returns are recognised and skipped; the processor works
//! on linear buffers only.

use rsxcore_common::GuestAddr;
use rsxcore_memory::{GuestMemory, MemoryResult};

use crate::engines::{Engine, EngineContext, SubChannel};
use crate::fifo::RingEntry;

const METHOD_MASK: u32 = 0x0000_1FFC;
const NON_INCREMENT: u32 = 0x4000_0000;
const OLD_JUMP_MASK: u32 = 0xE000_0003;
const OLD_JUMP: u32 = 0x2000_0000;
const NEW_JUMP_MASK: u32 = 0x0000_0003;
const NEW_JUMP: u32 = 0x0000_0001;
const CALL: u32 = 0x0000_0002;
const RETURN_MASK: u32 = 0xFFFF_0003;
const RETURN: u32 = 0x0002_0000;

/// A parsed method header.
#[derive(Debug, Clone, Copy)]
pub struct MethodHeader(u32);

impl MethodHeader {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn method(&self) -> u32 {
        self.0 & METHOD_MASK
    }

    pub fn subchannel(&self) -> u32 {
        (self.0 >> 13) & 0x7
    }

    pub fn count(&self) -> u32 {
        (self.0 >> 18) & 0x7FF
    }

    pub fn is_increment(&self) -> bool {
        self.0 & NON_INCREMENT == 0
    }

    /// Flow-control word rather than a method header.
    pub fn is_flow_control(&self) -> bool {
        self.0 & OLD_JUMP_MASK == OLD_JUMP
            || self.0 & NEW_JUMP_MASK == NEW_JUMP
            || self.0 & NEW_JUMP_MASK == CALL
            || self.0 & RETURN_MASK == RETURN
    }
}

/// Counters kept by the processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub headers: u64,
    pub writes: u64,
    pub unbound: u64,
    pub flow_control: u64,
}

/// Dispatches register writes to the engines bound to each subchannel.
pub struct CommandProcessor {
    engines: Vec<Option<Box<dyn Engine>>>,
    stats: ProcessorStats,
}

impl CommandProcessor {
    pub fn new(engines: Vec<Option<Box<dyn Engine>>>) -> Self {
        assert!(engines.len() <= SubChannel::COUNT);
        let mut e = engines;
        e.resize_with(SubChannel::COUNT, || None);
        Self {
            engines: e,
            stats: ProcessorStats::default(),
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
    }

    pub fn engine(&self, subchannel: SubChannel) -> Option<&dyn Engine> {
        self.engines[subchannel as usize].as_deref()
    }

    /// Process `words` big-endian words of command buffer at `addr`.
    pub fn process_buffer(
        &mut self,
        memory: &GuestMemory,
        addr: GuestAddr,
        words: u32,
        ctx: &mut EngineContext<'_>,
    ) -> MemoryResult<()> {
        let mut buf = vec![0u8; words as usize * 4];
        memory.super_read(addr, &mut buf)?;

        let data: Vec<u32> = buf
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        self.process_words(&data, ctx);
        Ok(())
    }

    /// Process decoded command words.
    pub fn process_words(&mut self, data: &[u32], ctx: &mut EngineContext<'_>) {
        let mut pos = 0;

        while pos < data.len() {
            let header = MethodHeader::new(data[pos]);
            pos += 1;

            if header.is_flow_control() {
                log::debug!(
                    "CommandProcessor: flow control 0x{:08X} at word {} skipped",
                    data[pos - 1],
                    pos - 1
                );
                self.stats.flow_control += 1;
                continue;
            }
            self.stats.headers += 1;

            let count = header.count() as usize;
            if count == 0 {
                continue;
            }
            let end = (pos + count).min(data.len());
            if end - pos < count {
                log::warn!(
                    "CommandProcessor: header wants {} args, only {} left",
                    count,
                    end - pos
                );
            }

            self.dispatch_burst(
                header.subchannel(),
                header.method(),
                &data[pos..end],
                header.is_increment(),
                ctx,
            );
            pos = end;
        }
    }

    /// Dispatch writes pulled from the command ring. Adjacent writes to
    /// consecutive methods of one subchannel are merged into a burst.
    pub fn process_ring(&mut self, entries: &[RingEntry], ctx: &mut EngineContext<'_>) {
        let mut start = 0;
        while start < entries.len() {
            let first = entries[start];
            let mut end = start + 1;
            while end < entries.len()
                && entries[end].subchannel == first.subchannel
                && entries[end].method == first.method + 4 * (end - start) as u32
            {
                end += 1;
            }
            let values: Vec<u32> = entries[start..end].iter().map(|e| e.value).collect();
            self.dispatch_burst(first.subchannel, first.method, &values, true, ctx);
            start = end;
        }
    }

    /// Dispatch a single register write to the appropriate engine.
    pub fn dispatch(&mut self, subchannel: u32, method: u32, value: u32, ctx: &mut EngineContext<'_>) {
        self.dispatch_burst(subchannel, method, &[value], true, ctx);
    }

    fn dispatch_burst(
        &mut self,
        subchannel: u32,
        method: u32,
        values: &[u32],
        increment: bool,
        ctx: &mut EngineContext<'_>,
    ) {
        let engine = SubChannel::from_raw(subchannel)
            .and_then(|sc| self.engines[sc as usize].as_mut());
        match engine {
            Some(engine) => {
                engine.write_burst(method, values, increment, ctx);
                self.stats.writes += values.len() as u64;
            }
            None => {
                log::trace!(
                    "CommandProcessor: no engine on subchannel {} (method=0x{:X}, {} args)",
                    subchannel,
                    method,
                    values.len()
                );
                self.stats.unbound += values.len() as u64;
            }
        }
    }
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bound: Vec<_> = self
            .engines
            .iter()
            .map(|e| e.as_ref().map(|e| e.class_id()))
            .collect();
        f.debug_struct("CommandProcessor")
            .field("engines", &bound)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::engines::test_support::TestEnv;
    use crate::engines::ClassId;

    type Log = Arc<Mutex<Vec<(u32, u32)>>>;

    /// Test engine that records register writes.
    struct RecordingEngine {
        writes: Log,
    }

    impl Engine for RecordingEngine {
        fn class_id(&self) -> ClassId {
            ClassId::Nv4097
        }
        fn write_reg(&mut self, method: u32, value: u32, _ctx: &mut EngineContext<'_>) {
            self.writes.lock().push((method, value));
        }
    }

    fn recording() -> (CommandProcessor, Log) {
        let writes = Log::default();
        let engine = RecordingEngine {
            writes: writes.clone(),
        };
        (CommandProcessor::new(vec![Some(Box::new(engine))]), writes)
    }

    fn header(subchannel: u32, method: u32, count: u32) -> u32 {
        (count << 18) | (subchannel << 13) | method
    }

    #[test]
    fn test_header_fields() {
        let hdr = MethodHeader::new(NON_INCREMENT | header(3, 0x400, 5));
        assert_eq!(hdr.method(), 0x400);
        assert_eq!(hdr.subchannel(), 3);
        assert_eq!(hdr.count(), 5);
        assert!(!hdr.is_increment());
        assert!(!hdr.is_flow_control());

        assert!(MethodHeader::new(0x2000_1000).is_flow_control());
        assert!(MethodHeader::new(0x0000_1001).is_flow_control());
        assert!(MethodHeader::new(0x0000_1002).is_flow_control());
        assert!(MethodHeader::new(RETURN).is_flow_control());
    }

    #[test]
    fn test_process_inc_method() {
        let mut env = TestEnv::new(false);
        let (mut proc, writes) = recording();

        let data = vec![header(0, 0x10, 2), 0xAAAA, 0xBBBB];
        proc.process_words(&data, &mut env.ctx());

        assert_eq!(*writes.lock(), vec![(0x10, 0xAAAA), (0x14, 0xBBBB)]);
        assert_eq!(proc.stats().writes, 2);
    }

    #[test]
    fn test_process_non_inc_method() {
        let mut env = TestEnv::new(false);
        let (mut proc, writes) = recording();

        let data = vec![NON_INCREMENT | header(0, 0x20, 3), 0x11, 0x22, 0x33];
        proc.process_words(&data, &mut env.ctx());

        // All writes go to the same method.
        assert_eq!(*writes.lock(), vec![(0x20, 0x11), (0x20, 0x22), (0x20, 0x33)]);
    }

    #[test]
    fn test_flow_control_and_truncation() {
        let mut env = TestEnv::new(false);
        let (mut proc, writes) = recording();

        let data = vec![0x2000_0100, header(0, 0x30, 1), 0x42, RETURN, header(0, 0x40, 4), 1];
        proc.process_words(&data, &mut env.ctx());

        assert_eq!(*writes.lock(), vec![(0x30, 0x42), (0x40, 1)]);
        assert_eq!(proc.stats().flow_control, 2);
    }

    #[test]
    fn test_unbound_subchannel() {
        let mut env = TestEnv::new(false);
        let (mut proc, writes) = recording();

        proc.dispatch(4, 0x100, 1, &mut env.ctx());
        proc.dispatch(7, 0x100, 1, &mut env.ctx());
        assert!(writes.lock().is_empty());
        assert_eq!(proc.stats().unbound, 2);
    }

    #[test]
    fn test_process_buffer_from_guest_memory() {
        let mut env = TestEnv::new(false);
        let (mut proc, writes) = recording();

        let words = [header(0, 0x10, 1), 0xDEAD_BEEF];
        for (i, w) in words.iter().enumerate() {
            env.memory.super_write_u32(0x8000 + 4 * i as u32, *w).unwrap();
        }
        let memory = env.memory.clone();
        proc.process_buffer(&memory, 0x8000, 2, &mut env.ctx()).unwrap();
        assert_eq!(*writes.lock(), vec![(0x10, 0xDEAD_BEEF)]);
    }

    #[test]
    fn test_ring_entries_merge_into_bursts() {
        let mut env = TestEnv::new(false);
        let (mut proc, writes) = recording();

        let entries = [
            RingEntry { subchannel: 0, method: 0x400, value: 1 },
            RingEntry { subchannel: 0, method: 0x404, value: 2 },
            RingEntry { subchannel: 0, method: 0x100, value: 3 },
        ];
        proc.process_ring(&entries, &mut env.ctx());
        assert_eq!(*writes.lock(), vec![(0x400, 1), (0x404, 2), (0x100, 3)]);
    }
}
