//! Capture container parsing: classic pcap and pcapng.
//!
//! Everything here is pure, bounds-checked reading of the memory-mapped
//! capture. Byte order is decided once from the file magic: fields are read
//! native-endian and conditionally swapped, so captures written on either
//! endianness parse on either host.

use crate::receiver::PacketTimestamp;

/// Classic pcap global header size.
pub(crate) const LEGACY_HEADER_LEN: usize = 24;
/// Classic pcap per-record header size.
pub(crate) const LEGACY_RECORD_LEN: usize = 16;

// Classic pcap magics, as read native-endian: a match on the swapped value
// means the file was written on the other endianness.
const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_MICROS_SWAPPED: u32 = 0xd4c3_b2a1;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const MAGIC_NANOS_SWAPPED: u32 = 0x4d3c_2b1a;

// Pcapng section header block type, and the byte-order magic at offset 8.
const PCAPNG_SHB: u32 = 0x0a0d_0d0a;
const PCAPNG_BOM: u32 = 0x1a2b_3c4d;
const PCAPNG_BOM_SWAPPED: u32 = 0x4d3c_2b1a;

/// Interface Description Block.
pub(crate) const BLOCK_IDB: u32 = 1;
/// Enhanced Packet Block.
pub(crate) const BLOCK_EPB: u32 = 6;

/// `if_tsresol` option code inside an IDB.
const OPT_IF_TSRESOL: u16 = 9;
/// End-of-options option code.
const OPT_END: u16 = 0;

/// Timestamp divisor when an interface declares no `if_tsresol`:
/// microseconds.
pub(crate) const DEFAULT_TS_DIVISOR: u64 = 1_000_000;

#[inline]
pub(crate) fn read_u16(data: &[u8], offset: usize, swap: bool) -> u16 {
    let value = u16::from_ne_bytes([data[offset], data[offset + 1]]);
    if swap {
        value.swap_bytes()
    } else {
        value
    }
}

#[inline]
pub(crate) fn read_u32(data: &[u8], offset: usize, swap: bool) -> u32 {
    let value = u32::from_ne_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]);
    if swap {
        value.swap_bytes()
    } else {
        value
    }
}

/// Which container the capture uses, plus everything decided at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaptureKind {
    Legacy {
        swap: bool,
        nanosecond: bool,
        link_type: u32,
    },
    PcapNg {
        swap: bool,
    },
}

impl CaptureKind {
    /// Decide the container from the first bytes of the mapping. The caller
    /// guarantees at least [`LEGACY_HEADER_LEN`] bytes.
    pub fn detect(data: &[u8]) -> Option<Self> {
        let magic = read_u32(data, 0, false);
        match magic {
            MAGIC_MICROS | MAGIC_MICROS_SWAPPED | MAGIC_NANOS | MAGIC_NANOS_SWAPPED => {
                let swap = magic == MAGIC_MICROS_SWAPPED || magic == MAGIC_NANOS_SWAPPED;
                let nanosecond = magic == MAGIC_NANOS || magic == MAGIC_NANOS_SWAPPED;
                let link_type = read_u32(data, 20, swap);
                Some(CaptureKind::Legacy {
                    swap,
                    nanosecond,
                    link_type,
                })
            }
            PCAPNG_SHB => match read_u32(data, 8, false) {
                PCAPNG_BOM => Some(CaptureKind::PcapNg { swap: false }),
                PCAPNG_BOM_SWAPPED => Some(CaptureKind::PcapNg { swap: true }),
                _ => None,
            },
            _ => None,
        }
    }

    /// Where replay starts: after the global header for legacy captures, at
    /// the section header for pcapng (interfaces are discovered in-stream).
    pub fn data_start(&self) -> usize {
        match self {
            CaptureKind::Legacy { .. } => LEGACY_HEADER_LEN,
            CaptureKind::PcapNg { .. } => 0,
        }
    }
}

/// One classic pcap record header, byte-swapped as needed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordHeader {
    pub ts_sec: u32,
    pub ts_frac: u32,
    pub caplen: usize,
    pub origlen: usize,
}

/// Parse the 16-byte record header at `cursor`. `None` on EOF or when the
/// record data would run past the mapping.
pub(crate) fn parse_record(data: &[u8], cursor: usize, swap: bool) -> Option<RecordHeader> {
    if cursor + LEGACY_RECORD_LEN > data.len() {
        return None;
    }
    let header = RecordHeader {
        ts_sec: read_u32(data, cursor, swap),
        ts_frac: read_u32(data, cursor + 4, swap),
        caplen: read_u32(data, cursor + 8, swap) as usize,
        origlen: read_u32(data, cursor + 12, swap) as usize,
    };
    if cursor + LEGACY_RECORD_LEN + header.caplen > data.len() {
        return None;
    }
    Some(header)
}

/// Build the record timestamp: the fraction field is microseconds unless the
/// nanosecond magic was seen.
pub(crate) fn record_timestamp(header: &RecordHeader, nanosecond: bool) -> PacketTimestamp {
    PacketTimestamp {
        sec: header.ts_sec as i64,
        nsec: if nanosecond {
            header.ts_frac as i64
        } else {
            header.ts_frac as i64 * 1000
        },
    }
}

/// One pcapng interface, keyed by order of IDB appearance.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Interface {
    pub link_type: u32,
    pub ts_divisor: u64,
}

/// One pcapng block, bounds-validated.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawBlock {
    pub block_type: u32,
    pub total_len: usize,
    pub body_start: usize,
    pub body_end: usize,
}

/// Parse the block at `cursor`. `None` terminates iteration: EOF, a length
/// too small to hold the mandatory fields, misalignment, an overrun, or a
/// trailing length that disagrees with the header's.
pub(crate) fn parse_block(data: &[u8], cursor: usize, swap: bool) -> Option<RawBlock> {
    if cursor + 8 > data.len() {
        return None;
    }
    let block_type = read_u32(data, cursor, swap);
    let total_len = read_u32(data, cursor + 4, swap) as usize;

    // 12 = type + length + trailing length; blocks are 32-bit aligned, and
    // the length is repeated at the end and must match.
    if total_len < 12 || total_len % 4 != 0 || cursor + total_len > data.len() {
        return None;
    }
    if read_u32(data, cursor + total_len - 4, swap) as usize != total_len {
        return None;
    }

    Some(RawBlock {
        block_type,
        total_len,
        body_start: cursor + 8,
        body_end: cursor + total_len - 4,
    })
}

/// `if_tsresol` decoding: high bit set means a binary resolution (divisor
/// 2^(v & 0x7F)), clear means decimal (10^v). Saturates rather than wraps on
/// absurd exponents.
pub(crate) fn tsresol_divisor(value: u8) -> u64 {
    if value & 0x80 != 0 {
        2u64.checked_pow((value & 0x7f) as u32).unwrap_or(u64::MAX)
    } else {
        10u64.checked_pow(value as u32).unwrap_or(u64::MAX)
    }
}

/// Parse an Interface Description Block body into an [`Interface`], walking
/// the options for `if_tsresol`.
pub(crate) fn parse_idb(data: &[u8], block: &RawBlock, swap: bool) -> Option<Interface> {
    // link type u16, reserved u16, snaplen u32, then options.
    if block.body_start + 8 > block.body_end {
        return None;
    }
    let link_type = read_u16(data, block.body_start, swap) as u32;
    let mut ts_divisor = DEFAULT_TS_DIVISOR;

    let mut offset = block.body_start + 8;
    while offset + 4 <= block.body_end {
        let code = read_u16(data, offset, swap);
        let length = read_u16(data, offset + 2, swap) as usize;
        if code == OPT_END {
            break;
        }
        if offset + 4 + length > block.body_end {
            break;
        }
        if code == OPT_IF_TSRESOL && length == 1 {
            ts_divisor = tsresol_divisor(data[offset + 4]);
        }
        // Option values are padded to 32 bits.
        offset += 4 + ((length + 3) & !3);
    }

    Some(Interface {
        link_type,
        ts_divisor,
    })
}

/// The fixed part of an Enhanced Packet Block, with the frame located.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EpbHeader {
    pub interface_id: u32,
    pub raw_ts: u64,
    pub caplen: usize,
    pub origlen: usize,
    pub frame_start: usize,
}

/// Parse an Enhanced Packet Block body. `None` when the declared capture
/// length does not fit the block.
pub(crate) fn parse_epb(data: &[u8], block: &RawBlock, swap: bool) -> Option<EpbHeader> {
    // interface id, ts high, ts low, caplen, origlen = 20 bytes.
    if block.body_start + 20 > block.body_end {
        return None;
    }
    let interface_id = read_u32(data, block.body_start, swap);
    let ts_high = read_u32(data, block.body_start + 4, swap) as u64;
    let ts_low = read_u32(data, block.body_start + 8, swap) as u64;
    let caplen = read_u32(data, block.body_start + 12, swap) as usize;
    let origlen = read_u32(data, block.body_start + 16, swap) as usize;

    let frame_start = block.body_start + 20;
    if frame_start + caplen > block.body_end {
        return None;
    }

    Some(EpbHeader {
        interface_id,
        raw_ts: (ts_high << 32) | ts_low,
        caplen,
        origlen,
        frame_start,
    })
}

/// Convert a raw interface-resolution timestamp into seconds/nanoseconds.
pub(crate) fn epb_timestamp(raw: u64, divisor: u64) -> PacketTimestamp {
    let divisor = divisor.max(1);
    let sec = (raw / divisor) as i64;
    // Widen: the remainder times 1e9 can overflow u64 for coarse divisors.
    let nsec = ((raw % divisor) as u128 * 1_000_000_000u128 / divisor as u128) as i64;
    PacketTimestamp { sec, nsec }
}
