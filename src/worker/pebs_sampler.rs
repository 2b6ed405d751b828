//! Next-commit sampling.
//!
//! Arms at every sampling point and emits the first committing slot of the
//! next COMMITTING token, mirroring precise-event-based sampling hardware.

use anyhow::{bail, Result};

use crate::bridge::TraceInfo;
use crate::token::{
    TokenStream, INSTR_EXCPT, INSTR_OIR, INSTR_VALID, ROB_COMMITTING, ROB_EXCEPTION, ROB_POPULATED,
};
use crate::worker::profiler::{
    gen_signature, BaseProfiler, SampleRow, SAMPLE_HEADER, TEA_FLAG_VALID_0,
};
use crate::worker::TraceWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Armed,
}

pub struct PebsSampler {
    base: BaseProfiler,
    last_flags: u16,
    last_progress_cycle: u64,
    sampling_cycle: u64,
    state: State,
}

impl PebsSampler {
    pub fn new(args: &[String], info: &TraceInfo, seed: Option<u64>) -> Result<Self> {
        Self::with_base(BaseProfiler::new("pebs_sampler", args, info, 1, seed)?)
    }

    fn with_base(mut base: BaseProfiler) -> Result<Self> {
        if base.sampling_period() == 0 {
            bail!("pebs_sampler: sampling period missing or too low");
        }
        base.files.emit(0, format_args!("{SAMPLE_HEADER}\n"));
        Ok(Self {
            base,
            last_flags: 0,
            last_progress_cycle: 0,
            sampling_cycle: 0,
            state: State::Idle,
        })
    }
}

impl TraceWorker for PebsSampler {
    fn name(&self) -> &str {
        "pebs_sampler"
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
                // The refill gap belongs to the offending instruction.
                self.last_progress_cycle = token.tsc_cycle.saturating_sub(1);
            }

            if self.base.reached_sampling_period(token.tsc_cycle) {
                self.sampling_cycle = self.base.next_period();
                self.base.advance_sampling_period(token.tsc_cycle);
                self.state = State::Armed;
            }

            if self.state == State::Armed && token.rob & ROB_COMMITTING != 0 {
                let slot = token.first_committing();
                let mut row = SampleRow {
                    cycle: self.sampling_cycle,
                    stall_latency: (token.tsc_cycle - self.last_progress_cycle).saturating_sub(1),
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
    }
}

pub(crate) fn build(
    args: &[String],
    info: &TraceInfo,
    seed: Option<u64>,
) -> Result<Box<dyn TraceWorker>> {
    Ok(Box::new(PebsSampler::new(args, info, seed)?))
}
