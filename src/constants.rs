/// Sentinel segment identifier. Written into head segment headers in
/// place of a cleaning-pass head id, and never issued to a real segment.
pub const INVALID_SEGMENT_ID: u64 = u64::max_value();

/// Number of segments held back from normal head allocation so that the
/// log can always open an (immutable) emergency head when memory is
/// exhausted. Two are required so one may be allocated while the
/// previous one is still being retired.
pub const EMERGENCY_HEAD_RESERVE: usize = 2;

/// Bytes of framing prepended to every segment entry:
/// 1 kind byte, 4 length bytes, 4 crc32 bytes.
pub const ENTRY_HEADER_LEN: usize = 9;
