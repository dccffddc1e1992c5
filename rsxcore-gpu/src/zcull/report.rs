// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Report records, query slots and the guest report layout.

use byteorder::{BigEndian, ByteOrder};

use rsxcore_common::GuestAddr;

use crate::backend::QueryId;

// Report types as passed to GET_REPORT / CLEAR_REPORT_VALUE.
pub const ZPASS_PIXEL_CNT: u32 = 1;
pub const ZCULL_STATS: u32 = 2;
pub const ZCULL_STATS1: u32 = 3;
pub const ZCULL_STATS2: u32 = 4;
pub const ZCULL_STATS3: u32 = 5;

/// Bytes occupied by one report in guest memory.
pub const REPORT_SIZE: u32 = 16;

/// Offset of the value word inside a report.
pub const REPORT_VALUE_OFFSET: u32 = 8;

pub fn is_known_report_type(ty: u32) -> bool {
    (ZPASS_PIXEL_CNT..=ZCULL_STATS3).contains(&ty)
}

/// Report types whose value is backed by a host query.
pub fn is_query_backed(ty: u32) -> bool {
    ty == ZPASS_PIXEL_CNT || ty == ZCULL_STATS3
}

/// Guest report record, stored big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportData {
    pub timer: u64,
    pub value: u32,
    pub padding: u32,
}

impl ReportData {
    pub fn to_bytes(&self) -> [u8; REPORT_SIZE as usize] {
        let mut out = [0u8; REPORT_SIZE as usize];
        BigEndian::write_u64(&mut out[0..8], self.timer);
        BigEndian::write_u32(&mut out[8..12], self.value);
        BigEndian::write_u32(&mut out[12..16], self.padding);
        out
    }

    pub fn from_bytes(raw: &[u8; REPORT_SIZE as usize]) -> Self {
        Self {
            timer: BigEndian::read_u64(&raw[0..8]),
            value: BigEndian::read_u32(&raw[8..12]),
            padding: BigEndian::read_u32(&raw[12..16]),
        }
    }
}

/// Unit state consulted when a counter is turned into a report value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportValueContext {
    pub precise_zpass_count: bool,
    pub write_enabled: bool,
    pub stats_enabled: bool,
}

/// Map an accumulated sample count to the value the guest observes.
pub fn map_report_value(ty: u32, value: u32, ctx: ReportValueContext) -> u32 {
    match ty {
        ZPASS_PIXEL_CNT => {
            if value == 0 || ctx.precise_zpass_count {
                value
            } else {
                u16::MAX as u32
            }
        }
        ZCULL_STATS3 => {
            if value != 0 || !ctx.write_enabled || !ctx.stats_enabled {
                0
            } else {
                u16::MAX as u32
            }
        }
        _ => {
            if !is_known_report_type(ty) {
                log::warn!("ZCULL: unknown report type {}", ty);
            }
            if ctx.write_enabled && ctx.stats_enabled {
                u32::MAX
            } else {
                0
            }
        }
    }
}

bitflags::bitflags! {
    /// Payload kinds a query or statistics slot carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueryDataType: u32 {
        const ZPASS = 1;
        const STATS = 2;
        /// Set on a statistics slot once a report has been queued against it.
        const REPORT_QUEUED = 0x8000_0000;
    }
}

/// One host occlusion query slot.
#[derive(Debug, Clone, Default)]
pub struct OcclusionQueryInfo {
    pub data_type: QueryDataType,
    pub num_draws: u32,
    pub result: u32,
    /// Currently collecting samples.
    pub active: bool,
    /// Claimed by a report write.
    pub owned: bool,
    /// Ended and waiting for retirement.
    pub pending: bool,
    /// Command-stream position of the last work recorded into the query.
    pub sync_tag: u64,
    /// Microsecond time the query ended.
    pub timestamp: u64,
}

/// A report write waiting for its query to resolve.
#[derive(Debug, Clone, Default)]
pub struct QueuedReportWrite {
    pub id: u64,
    pub ty: u32,
    pub counter_tag: u32,
    pub query: Option<QueryId>,
    /// Id of the later write that performs the guest write for this one.
    pub forwarder: Option<u64>,
    /// Guest address, `None` until a GET_REPORT claims the entry.
    pub sink: Option<GuestAddr>,
    /// Extra destinations picked up by transfers that copied the sink.
    pub sink_alias: Vec<GuestAddr>,
}

impl QueuedReportWrite {
    pub fn is_claimed(&self) -> bool {
        self.sink.is_some()
    }

    pub fn writes_to(&self, addr: GuestAddr) -> bool {
        self.sink == Some(addr)
    }
}

/// Accumulator shared by every report in one statistics epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryStatCounter {
    pub flags: QueryDataType,
    pub result: u32,
}

/// Outcome of a read barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportResult {
    None,
    /// Pending reports overlap the range and were left in place.
    ZcullInterrupted,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReadBarrierFlags: u32 {
        /// Leave overlapping reports queued; the caller will alias them.
        const SYNC_DEFER_COPY = 1;
        /// Do not hint the GPU thread to flush before waiting.
        const SYNC_NO_NOTIFY = 2;
    }
}

/// Queries feeding a sink, as found by `find_query`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySearchResult {
    pub found: bool,
    /// Accumulated result when no query is left to wait on.
    pub raw_zpass_result: u32,
    pub queries: Vec<QueryId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(precise: bool, write: bool, stats: bool) -> ReportValueContext {
        ReportValueContext {
            precise_zpass_count: precise,
            write_enabled: write,
            stats_enabled: stats,
        }
    }

    #[test]
    fn test_report_layout_is_big_endian() {
        let report = ReportData {
            timer: 0x0102_0304_0506_0708,
            value: 0xAABB_CCDD,
            padding: 0,
        };
        let raw = report.to_bytes();
        assert_eq!(&raw[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&raw[8..12], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(ReportData::from_bytes(&raw), report);
    }

    #[test]
    fn test_zpass_mapping() {
        assert_eq!(map_report_value(ZPASS_PIXEL_CNT, 0, ctx(false, true, true)), 0);
        assert_eq!(map_report_value(ZPASS_PIXEL_CNT, 123, ctx(false, true, true)), 0xFFFF);
        assert_eq!(map_report_value(ZPASS_PIXEL_CNT, 123, ctx(true, false, false)), 123);
    }

    #[test]
    fn test_stats3_mapping() {
        assert_eq!(map_report_value(ZCULL_STATS3, 0, ctx(false, true, true)), 0xFFFF);
        assert_eq!(map_report_value(ZCULL_STATS3, 5, ctx(false, true, true)), 0);
        assert_eq!(map_report_value(ZCULL_STATS3, 0, ctx(false, false, true)), 0);
        assert_eq!(map_report_value(ZCULL_STATS3, 0, ctx(false, true, false)), 0);
    }

    #[test]
    fn test_other_stats_mapping() {
        assert_eq!(map_report_value(ZCULL_STATS, 0, ctx(false, true, true)), u32::MAX);
        assert_eq!(map_report_value(ZCULL_STATS2, 9, ctx(false, true, false)), 0);
        assert_eq!(map_report_value(42, 9, ctx(false, true, true)), u32::MAX);
    }

    #[test]
    fn test_query_backed_types() {
        assert!(is_query_backed(ZPASS_PIXEL_CNT));
        assert!(is_query_backed(ZCULL_STATS3));
        assert!(!is_query_backed(ZCULL_STATS1));
        assert!(is_known_report_type(ZCULL_STATS2));
        assert!(!is_known_report_type(0));
    }
}
