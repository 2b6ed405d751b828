//! Shared base of the profiling worker family.
//!
//! Owns the sampling-period arithmetic, the flush cadence, the first-token
//! trigger and the instruction signature computation. Concrete workers embed
//! a [`BaseProfiler`] and drive it from their tick loop:
//!
//! ```text
//! if base.flush_due(cycle) { flush_result(); }
//! if base.take_first_token() { reset timing baselines; continue; }
//! ```

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::bridge::TraceInfo;
use crate::token::{INSTR_DCACHE_MISS, INSTR_MISS, INSTR_OIR, TOKEN_BYTES};
use crate::worker::{parse_number, split_arg, FileRegister};

/// Per-slot commit weight by number of co-committing instructions:
/// `24/n` fractional cycles kept in integer arithmetic (24 = lcm{1,2,3,4}).
pub const ILP_WEIGHTS: [u64; 4] = [24, 12, 8, 6];

/// Denominator of the ILP weights.
pub const ILP_UNIT: u64 = 24;

/// Compact encoding of an instruction's miss profile combined with the
/// previous instruction's offending-in-retirement context. Pure function of
/// its arguments.
#[inline]
pub fn gen_signature(last_flags: u16, flags: u16, memlat: u16, l2_latency: u16, l3_latency: u16) -> u16 {
    let dcache = flags & INSTR_DCACHE_MISS != 0;
    (flags & INSTR_MISS)
        | u16::from(dcache && memlat >= l2_latency)
        | (u16::from(dcache && memlat >= l3_latency) << 1)
        | ((last_flags & INSTR_OIR) << 3)
}

// Flag byte of emitted sample rows.
pub const TEA_FLAG_VALID_0: u16 = 1 << 0;
pub const TEA_FLAG_VALID_1: u16 = 1 << 1;
pub const TEA_FLAG_VALID_2: u16 = 1 << 2;
pub const TEA_FLAG_VALID_3: u16 = 1 << 3;
pub const TEA_FLAG_STALLED: u16 = 1 << 4;
pub const TEA_FLAG_DEFERRED: u16 = 1 << 5;
pub const TEA_FLAG_OIR: u16 = 1 << 6;

/// Column header shared by all sample-row emitting workers.
pub const SAMPLE_HEADER: &str = "cycle;stallLatency;teaflags;\
address0;isslat0;memlat0;signature0;\
address1;isslat1;memlat1;signature1;\
address2;isslat2;memlat2;signature2;\
address3;isslat3;memlat3;signature3";

/// One emitted sample: up to four (address, isslat, memlat, signature)
/// tuples. Unused slots print as `0x0;0;0;0`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleRow {
    pub cycle: u64,
    pub stall_latency: u64,
    pub teaflags: u16,
    pub addresses: [u64; 4],
    pub isslats: [u16; 4],
    pub memlats: [u16; 4],
    pub signatures: [u16; 4],
}

impl SampleRow {
    pub fn emit(&self, files: &mut FileRegister, index: usize) {
        files.emit(
            index,
            format_args!(
                "{};{};{};0x{:x};{};{};{};0x{:x};{};{};{};0x{:x};{};{};{};0x{:x};{};{};{}\n",
                self.cycle,
                self.stall_latency,
                self.teaflags,
                self.addresses[0],
                self.isslats[0],
                self.memlats[0],
                self.signatures[0],
                self.addresses[1],
                self.isslats[1],
                self.memlats[1],
                self.signatures[1],
                self.addresses[2],
                self.isslats[2],
                self.memlats[2],
                self.signatures[2],
                self.addresses[3],
                self.isslats[3],
                self.memlats[3],
                self.signatures[3],
            ),
        );
    }
}

/// Sampling, flush and signature state shared by all profiling workers.
pub struct BaseProfiler {
    name: &'static str,
    pub files: FileRegister,

    sampling_period: u64,
    random_start_offset: u64,
    random_offset: u64,
    last_period: u64,
    next_period_start: u64,
    next_period: u64,

    last_flush_period: u64,
    flush_threshold: u64,

    pub l2_miss_latency: u16,
    pub l3_miss_latency: u16,

    first_token: bool,
    rng: StdRng,
}

impl std::fmt::Debug for BaseProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseProfiler").field("name", &self.name).finish_non_exhaustive()
    }
}

impl BaseProfiler {
    /// Parses the common `key:value` arguments and opens the output files.
    pub fn new(
        name: &'static str,
        args: &[String],
        info: &TraceInfo,
        required_files: usize,
        seed: Option<u64>,
    ) -> Result<Self> {
        let files = FileRegister::from_args(name, args, info, required_files)?;
        Self::with_register(name, args, info, seed, files)
    }

    fn with_register(
        name: &'static str,
        args: &[String],
        info: &TraceInfo,
        seed: Option<u64>,
        files: FileRegister,
    ) -> Result<Self> {
        if info.token_bytes != TOKEN_BYTES {
            bail!(
                "profiling workers require {TOKEN_BYTES}-byte stream tokens, bridge reports {}",
                info.token_bytes
            );
        }

        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut sampling_period = 0;
        let mut random_start_offset = 0;
        let mut random_offset = 0;
        let mut flush_threshold = 0;
        let mut l2_miss_latency = 32u16;
        let mut l3_miss_latency = 84u16;

        for arg in args {
            let (key, value) = split_arg(arg);
            match key {
                "flushAfter" => flush_threshold = parse_number(value)?,
                "samplingPeriod" => sampling_period = parse_number(value)?,
                "randomStartOffset" => random_start_offset = parse_number(value)?,
                "randomOffset" => random_offset = parse_number(value)?,
                "l2MissLatency" => l2_miss_latency = parse_number(value)? as u16,
                "l3MissLatency" => l3_miss_latency = parse_number(value)? as u16,
                // Unknown keys are left to the concrete worker.
                _ => {}
            }
        }

        if random_start_offset > 0 {
            random_start_offset = rng.gen_range(0..=random_start_offset);
        }

        if sampling_period > 0 && random_offset >= sampling_period {
            warn!(
                worker = name,
                clamped = sampling_period - 1,
                "random offset cannot reach the sampling period, reducing",
            );
            random_offset = sampling_period - 1;
        }

        info!(
            worker = name,
            files = ?files.labels(),
            sampling_period,
            random_start = random_start_offset,
            random_offset,
            flush_threshold,
            "profiler configured",
        );

        let mut base = Self {
            name,
            files,
            sampling_period,
            random_start_offset,
            random_offset,
            last_period: 0,
            next_period_start: 0,
            next_period: 0,
            last_flush_period: 0,
            flush_threshold,
            l2_miss_latency,
            l3_miss_latency,
            first_token: true,
            rng,
        };
        base.restart_sampling(0);
        Ok(base)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn sampling_period(&self) -> u64 {
        self.sampling_period
    }

    /// The cycle the next sample is due at.
    pub fn next_period(&self) -> u64 {
        self.next_period
    }

    /// Re-bases the sampling windows at `count` (plus the drawn start
    /// offset).
    pub fn restart_sampling(&mut self, count: u64) {
        self.last_period = count + self.random_start_offset;
        self.next_period_start = count + self.sampling_period + self.random_start_offset;
        self.next_period = self.next_period_start;
    }

    /// Whether the sample point has been reached at `count`.
    pub fn reached_sampling_period(&self, count: u64) -> bool {
        self.next_period <= count
    }

    /// Advances past `count`, catching up any number of missed periods.
    ///
    /// Whole periods that elapsed while no token arrived (long ROB-empty
    /// gaps) are skipped in one step so they count as passed but produce no
    /// samples; the remaining periods advance one at a time with the random
    /// dither re-drawn per period, preserving unbiased offsets. Returns the
    /// passed cycle count.
    pub fn advance_sampling_period(&mut self, count: u64) -> u64 {
        let passed_period_cycles = count.saturating_sub(self.next_period_start);
        let mut passed = 0;

        if passed_period_cycles >= self.sampling_period {
            let missed_periods = passed_period_cycles / self.sampling_period;
            self.next_period_start += missed_periods * self.sampling_period;
            self.next_period = self.next_period_start - self.draw_offset();
        }

        loop {
            passed += self.next_period - self.last_period;
            self.last_period = self.next_period;

            self.next_period_start += self.sampling_period;
            self.next_period = self.next_period_start - self.draw_offset();

            if self.next_period > count {
                break;
            }
        }

        passed
    }

    fn draw_offset(&mut self) -> u64 {
        if self.random_offset == 0 {
            0
        } else {
            self.rng.gen_range(0..=self.random_offset)
        }
    }

    /// Periodic result-flush check against the token cycle counter. Updates
    /// the flush baseline when due; the caller then flushes its results.
    pub fn flush_due(&mut self, cycle: u64) -> bool {
        if self.flush_threshold != 0 && cycle.wrapping_sub(self.last_flush_period) >= self.flush_threshold
        {
            self.last_flush_period = cycle;
            true
        } else {
            false
        }
    }

    /// True exactly once, on the very first token since start: timing
    /// baselines must be reset and the token itself is not accounted.
    pub fn take_first_token(&mut self) -> bool {
        if self.first_token {
            self.first_token = false;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
impl BaseProfiler {
    /// Builds a base over in-memory sinks for worker unit tests.
    pub(crate) fn for_test(
        name: &'static str,
        args: &[&str],
        required_files: usize,
        seed: u64,
    ) -> (Self, Vec<crate::worker::test_support::MemorySink>) {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let info = TraceInfo {
            tracer_id: 0,
            token_bytes: TOKEN_BYTES,
            output_dir: std::env::temp_dir(),
        };
        let (files, sinks) = FileRegister::memory(required_files);
        let base = Self::with_register(name, &args, &info, Some(seed), files)
            .expect("test profiler construction");
        (base, sinks)
    }
}
