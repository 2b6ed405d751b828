//! Tag-and-wait sampling.
//!
//! At every sampling point the worker waits for the next DISPATCHING token
//! and tags the ROB tail position. It then follows the tagged entry until it
//! either retires inside the head row (sampled) or is squashed by the tail
//! rewinding past it (evicted), mirroring instruction-based sampling
//! hardware where a tagged uop may never retire.

use anyhow::{bail, Result};

use crate::bridge::TraceInfo;
use crate::token::{
    TokenStream, INSTR_EXCPT, INSTR_OIR, INSTR_VALID, ROB_COMMITTING, ROB_DISPATCHING,
    ROB_EXCEPTION, ROB_POPULATED,
};
use crate::worker::profiler::{
    gen_signature, BaseProfiler, SampleRow, SAMPLE_HEADER, TEA_FLAG_VALID_0,
};
use crate::worker::{parse_number, split_arg, TraceWorker};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Tagging,
    Armed,
}

pub struct IbsSampler {
    base: BaseProfiler,
    core_width: u32,
    last_flags: u16,
    last_progress_cycle: u64,
    sampling_cycle: u64,
    tag: u8,
    state: State,
    evicted: u64,
}

impl IbsSampler {
    pub fn new(args: &[String], info: &TraceInfo, seed: Option<u64>) -> Result<Self> {
        Self::with_base(BaseProfiler::new("ibs_sampler", args, info, 1, seed)?, args)
    }

    fn with_base(mut base: BaseProfiler, args: &[String]) -> Result<Self> {
        if base.sampling_period() == 0 {
            bail!("ibs_sampler: sampling period missing or too low");
        }

        let mut core_width = 4u32;
        for arg in args {
            let (key, value) = split_arg(arg);
            if key == "coreWidth" {
                core_width = parse_number(value)? as u32;
            }
        }
        if core_width == 0 {
            bail!("ibs_sampler: coreWidth must be positive");
        }

        info!(worker = "ibs_sampler", core_width, "tag-and-wait sampling");
        base.files.emit(0, format_args!("{SAMPLE_HEADER}\n"));

        Ok(Self {
            base,
            core_width,
            last_flags: 0,
            last_progress_cycle: 0,
            sampling_cycle: 0,
            tag: 0,
            state: State::Idle,
            evicted: 0,
        })
    }

    /// Samples dropped because the tagged entry was squashed.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl TraceWorker for IbsSampler {
    fn name(&self) -> &str {
        "ibs_sampler"
    }

    fn tick(&mut self, data: &[u8], tokens: usize) {
        for token in TokenStream::new(data, tokens) {
            if self.base.flush_due(token.tsc_cycle) {
                self.base.files.flush();
            }
            if self.base.take_first_token() {
                self.last_flags = 0;
                self.last_progress_cycle = token.tsc_cycle;
                self.base.restart_sampling(token.tsc_cycle);
                continue;
            }

            if token.rob & ROB_POPULATED != 0 && self.last_flags & INSTR_OIR != 0 {
                self.last_progress_cycle = token.tsc_cycle.saturating_sub(1);
            }

            // One period evaluation per token: advancing always moves the
            // next point past this cycle, so re-checking after the armed
            // stage could never fire again.
            if self.base.reached_sampling_period(token.tsc_cycle) {
                self.sampling_cycle = self.base.next_period();
                self.base.advance_sampling_period(token.tsc_cycle);
                self.state = State::Tagging;
            }

            if self.state == State::Armed {
                let tail = u32::from(token.rob_tail);
                // Align the head to the ROB row; its low bits are inaccurate.
                let head = u32::from(token.rob_head) - u32::from(token.rob_head) % self.core_width;
                let tag = u32::from(self.tag);

                // Four disjoint eviction tests over the circular positions:
                // tail behind the tag, tail wrapped back around, tail and
                // tag both behind an advanced head, or an emptied ROB.
                let evict_1 = tail > head && tag >= tail;
                let evict_2 = tail > head && tag < head;
                let evict_3 = tail < head && tag >= tail && tag < head;
                let evict_4 = tail == head && !token.any_valid();

                if evict_1 || evict_2 || evict_3 || evict_4 {
                    self.evicted += 1;
                    self.state = State::Idle;
                } else if token.rob & ROB_COMMITTING != 0
                    && tag >= head
                    && tag < head + self.core_width
                {
                    let slot = token.first_committing();
                    let mut row = SampleRow {
                        cycle: self.sampling_cycle,
                        stall_latency: (token.tsc_cycle - self.last_progress_cycle)
                            .saturating_sub(1),
                        teaflags: TEA_FLAG_VALID_0,
                        ..SampleRow::default()
                    };
                    row.addresses[0] = slot.address;
                    row.isslats[0] = slot.isslat;
                    row.memlats[0] = slot.memlat;
                    row.signatures[0] = gen_signature(
                        self.last_flags,
                        slot.flags,
                        slot.memlat,
                        self.base.l2_miss_latency,
                        self.base.l3_miss_latency,
                    );
                    row.emit(&mut self.base.files, 0);

                    self.state = State::Idle;
                }
            }

            if self.state == State::Tagging && token.rob & ROB_DISPATCHING != 0 {
                self.tag = token.rob_tail;
                self.state = State::Armed;
            }

            if token.rob & (ROB_EXCEPTION | ROB_COMMITTING) != 0 {
                if token.rob & ROB_EXCEPTION != 0 {
                    self.last_flags = INSTR_VALID | INSTR_EXCPT;
                } else {
                    self.last_flags = token.last_committing().flags;
                }
                self.last_progress_cycle = token.tsc_cycle;
            }
        }
    }

    fn finish(&mut self) {
        self.base.files.flush();
        info!(worker = "ibs_sampler", evicted = self.evicted, "drained");
    }
}

pub(crate) fn build(
    args: &[String],
    info: &TraceInfo,
    seed: Option<u64>,
) -> Result<Box<dyn TraceWorker>> {
    Ok(Box::new(IbsSampler::new(args, info, seed)?))
}
