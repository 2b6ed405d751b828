//! Codec for the fixed-layout ROB analysis token.
//!
//! Every token is one 64-byte record describing one cycle of reorder-buffer
//! activity: a packed state word (cycle counter, ROB status bitset, head and
//! tail positions) followed by four parallel per-slot instruction
//! descriptors. The layout is part of the wire contract with the bridge;
//! mismatched token sizes are rejected at session construction.

use thiserror::Error;

/// Wire size of one token in bytes.
pub const TOKEN_BYTES: usize = 64;

/// Width of the packed cycle counter in the first token word.
const TSC_CYCLE_BITS: u32 = 44;

// ROB status bitset.
pub const ROB_COMMITTING: u8 = 1 << 0;
pub const ROB_POPULATED: u8 = 1 << 1;
pub const ROB_DISPATCHING: u8 = 1 << 2;
pub const ROB_EXCEPTION: u8 = 1 << 3;

// Per-slot instruction flags.
pub const INSTR_COMMITS: u16 = 1 << 0;
pub const INSTR_VALID: u16 = 1 << 1;
pub const INSTR_ICACHE_MISS: u16 = 1 << 2;
pub const INSTR_ITLB_SMISS: u16 = 1 << 3;
pub const INSTR_ITLB_PMISS: u16 = 1 << 4;
pub const INSTR_DCACHE_MISS: u16 = 1 << 5;
pub const INSTR_DTLB_SMISS: u16 = 1 << 6;
pub const INSTR_DTLB_PMISS: u16 = 1 << 7;
pub const INSTR_LSU_FULL: u16 = 1 << 8;
pub const INSTR_REFETCHED: u16 = 1 << 9;
pub const INSTR_BR_MISS: u16 = 1 << 10;
pub const INSTR_FLUSHS: u16 = 1 << 11;
pub const INSTR_EXCPT: u16 = 1 << 12;

/// Offending-in-retirement events: their cost is realised only after the
/// following ROB refill.
pub const INSTR_OIR: u16 = INSTR_BR_MISS | INSTR_FLUSHS | INSTR_EXCPT;

/// Every miss/flush/offending bit of the flag word.
pub const INSTR_MISS: u16 = INSTR_ICACHE_MISS
    | INSTR_ITLB_SMISS
    | INSTR_ITLB_PMISS
    | INSTR_DCACHE_MISS
    | INSTR_DTLB_SMISS
    | INSTR_DTLB_PMISS
    | INSTR_LSU_FULL
    | INSTR_REFETCHED
    | INSTR_BR_MISS
    | INSTR_FLUSHS
    | INSTR_EXCPT;

/// Errors that can occur when interpreting raw token bytes.
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("token record too short: {size} bytes, need {TOKEN_BYTES}")]
    Truncated { size: usize },

    #[error("bridge token size {size} unsupported, this decoder requires {TOKEN_BYTES}-byte tokens")]
    SizeMismatch { size: usize },
}

/// One instruction slot of a token: flags, fetch address and latencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotRecord {
    pub flags: u16,
    pub address: u64,
    pub memlat: u16,
    pub isslat: u16,
}

impl SlotRecord {
    #[inline]
    pub fn commits(&self) -> bool {
        self.flags & INSTR_COMMITS != 0
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.flags & INSTR_VALID != 0
    }
}

/// A decoded ROB analysis token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RobToken {
    /// Monotonically nondecreasing cycle counter (44 bits on the wire).
    pub tsc_cycle: u64,
    /// ROB status bitset (`ROB_*`).
    pub rob: u8,
    /// Head position in the circular ROB.
    pub rob_head: u8,
    /// Tail position in the circular ROB.
    pub rob_tail: u8,
    /// The four parallel instruction descriptors.
    pub slots: [SlotRecord; 4],
}

impl RobToken {
    /// Decodes a token from exactly one wire record.
    pub fn decode(data: &[u8; TOKEN_BYTES]) -> Self {
        let state = read_u64_le(data, 0);

        let mut slots = [SlotRecord::default(); 4];
        for (i, slot) in slots.iter_mut().enumerate() {
            slot.flags = read_u16_le(data, 8 + i * 2);
            slot.address = read_u64_le(data, 16 + i * 8);
            slot.memlat = read_u16_le(data, 48 + i * 2);
            slot.isslat = read_u16_le(data, 56 + i * 2);
        }

        Self {
            tsc_cycle: state & ((1 << TSC_CYCLE_BITS) - 1),
            rob: ((state >> TSC_CYCLE_BITS) & 0xF) as u8,
            rob_head: ((state >> 48) & 0xFF) as u8,
            rob_tail: (state >> 56) as u8,
            slots,
        }
    }

    /// Decodes a token from the front of a byte slice.
    pub fn parse(data: &[u8]) -> Result<Self, TokenError> {
        let record: &[u8; TOKEN_BYTES] = data
            .get(..TOKEN_BYTES)
            .and_then(|d| d.try_into().ok())
            .ok_or(TokenError::Truncated { size: data.len() })?;
        Ok(Self::decode(record))
    }

    /// Encodes the token back into its wire representation. Used by the
    /// replay tooling and by tests that synthesise trace streams.
    pub fn encode(&self) -> [u8; TOKEN_BYTES] {
        let state = (self.tsc_cycle & ((1 << TSC_CYCLE_BITS) - 1))
            | (u64::from(self.rob & 0xF) << TSC_CYCLE_BITS)
            | (u64::from(self.rob_head) << 48)
            | (u64::from(self.rob_tail) << 56);

        let mut out = [0u8; TOKEN_BYTES];
        out[0..8].copy_from_slice(&state.to_le_bytes());
        for (i, slot) in self.slots.iter().enumerate() {
            out[8 + i * 2..8 + i * 2 + 2].copy_from_slice(&slot.flags.to_le_bytes());
            out[16 + i * 8..16 + i * 8 + 8].copy_from_slice(&slot.address.to_le_bytes());
            out[48 + i * 2..48 + i * 2 + 2].copy_from_slice(&slot.memlat.to_le_bytes());
            out[56 + i * 2..56 + i * 2 + 2].copy_from_slice(&slot.isslat.to_le_bytes());
        }
        out
    }

    /// First slot carrying `INSTR_VALID`, falling back to the last slot the
    /// way the hardware encodes degenerate tokens.
    #[inline]
    pub fn first_valid(&self) -> &SlotRecord {
        self.slots
            .iter()
            .find(|s| s.valid())
            .unwrap_or(&self.slots[3])
    }

    /// First slot carrying `INSTR_COMMITS`, falling back to the last slot.
    #[inline]
    pub fn first_committing(&self) -> &SlotRecord {
        self.slots
            .iter()
            .find(|s| s.commits())
            .unwrap_or(&self.slots[3])
    }

    /// Last slot carrying `INSTR_COMMITS`, falling back to slot 0.
    #[inline]
    pub fn last_committing(&self) -> &SlotRecord {
        self.slots
            .iter()
            .rev()
            .find(|s| s.commits())
            .unwrap_or(&self.slots[0])
    }

    /// Number of slots committing in this token (0..=4).
    #[inline]
    pub fn committing_count(&self) -> usize {
        self.slots.iter().filter(|s| s.commits()).count()
    }

    /// Whether any slot carries `INSTR_VALID`.
    #[inline]
    pub fn any_valid(&self) -> bool {
        self.slots.iter().any(|s| s.valid())
    }
}

/// Iterator over the tokens of a filled buffer.
///
/// The dispatcher guarantees published buffers hold `count` whole records,
/// so iteration clamps to whatever actually fits.
pub struct TokenStream<'a> {
    data: &'a [u8],
    remaining: usize,
}

impl<'a> TokenStream<'a> {
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self {
            data,
            remaining: count.min(data.len() / TOKEN_BYTES),
        }
    }
}

impl Iterator for TokenStream<'_> {
    type Item = RobToken;

    fn next(&mut self) -> Option<RobToken> {
        if self.remaining == 0 {
            return None;
        }
        let (record, rest) = self.data.split_at(TOKEN_BYTES);
        self.data = rest;
        self.remaining -= 1;
        // Length is guaranteed by the remaining-count clamp above.
        Some(RobToken::decode(record.try_into().expect("whole record")))
    }
}

#[inline(always)]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(read_fixed::<2>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: all callers read within the fixed 64-byte record.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}
