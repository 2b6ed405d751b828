//! Sampled top-down execution analysis.
//!
//! At every sampling point the worker classifies how the sample landed:
//! exactly on a commit/exception (armed, sampled immediately), during a
//! ROB-empty gap whose previous instruction was offending (emitted at once
//! as an OIR sample), after a missed point with the ROB refilled (deferred
//! to the next commit) or while stalled (stalled flag on the next commit).

use anyhow::{bail, Result};

use crate::bridge::TraceInfo;
use crate::token::{
    TokenStream, INSTR_EXCPT, INSTR_OIR, INSTR_VALID, ROB_COMMITTING, ROB_EXCEPTION, ROB_POPULATED,
};
use crate::worker::profiler::{
    gen_signature, BaseProfiler, SampleRow, SAMPLE_HEADER, TEA_FLAG_DEFERRED, TEA_FLAG_OIR,
    TEA_FLAG_STALLED, TEA_FLAG_VALID_0,
};
use crate::worker::TraceWorker;

/// The most recently retired instruction, kept for OIR-aware sampling.
#[derive(Debug, Default, Clone, Copy)]
struct InstrRegister {
    address: u64,
    flags: u16,
    isslat: u16,
    memlat: u16,
    prev_flags: u16,
    stall_latency: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Off,
    Deferred,
    Stalled,
    Armed,
}

pub struct TeaSampler {
    base: BaseProfiler,
    last_instr: InstrRegister,
    last_progress_cycle: u64,
    sampling_cycle: u64,
    state: State,
}

impl std::fmt::Debug for TeaSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeaSampler").field("state", &self.state).finish_non_exhaustive()
    }
}

impl TeaSampler {
    pub fn new(args: &[String], info: &TraceInfo, seed: Option<u64>) -> Result<Self> {
        Self::with_base(BaseProfiler::new("tea_sampler", args, info, 1, seed)?)
    }

    fn with_base(mut base: BaseProfiler) -> Result<Self> {
        if base.sampling_period() == 0 {
            bail!("tea_sampler: sampling period missing or too low");
        }
        base.files.emit(0, format_args!("{SAMPLE_HEADER}\n"));
        Ok(Self {
            base,
            last_instr: InstrRegister::default(),
            last_progress_cycle: 0,
            sampling_cycle: 0,
            state: State::Off,
        })
    }
}

impl TraceWorker for TeaSampler {
    fn name(&self) -> &str {
        "tea_sampler"
    }

    fn tick(&mut self, data: &[u8], tokens: usize) {
        for token in TokenStream::new(data, tokens) {
            if self.base.flush_due(token.tsc_cycle) {
                self.base.files.flush();
            }
            if self.base.take_first_token() {
                self.last_instr = InstrRegister::default();
                self.last_progress_cycle = token.tsc_cycle;
                self.base.restart_sampling(token.tsc_cycle);
                continue;
            }

            // The algorithm only advances on commits, exceptions and
            // populations.
            if token.rob & (ROB_COMMITTING | ROB_EXCEPTION | ROB_POPULATED) == 0 {
                continue;
            }

            if token.rob & ROB_POPULATED != 0 && self.last_instr.flags & INSTR_OIR != 0 {
                // The refill gap belongs to the offending instruction.
                self.last_progress_cycle = token.tsc_cycle.saturating_sub(1);
            }

            if self.base.reached_sampling_period(token.tsc_cycle) {
                let exact_hit = self.base.next_period() == token.tsc_cycle;
                let this_populated = token.rob & ROB_POPULATED != 0;
                let this_only_populated =
                    this_populated && token.rob & (ROB_COMMITTING | ROB_EXCEPTION) == 0;

                self.sampling_cycle = self.base.next_period();
                self.base.advance_sampling_period(token.tsc_cycle);

                self.state = State::Armed;

                if !exact_hit && this_populated {
                    // The sample point fell into a ROB-empty gap.
                    if self.last_instr.flags & INSTR_OIR != 0 {
                        // The previous instruction offended: it is the
                        // sample, done for this period.
                        let signature = gen_signature(
                            self.last_instr.prev_flags,
                            self.last_instr.flags,
                            self.last_instr.memlat,
                            self.base.l2_miss_latency,
                            self.base.l3_miss_latency,
                        );
                        let mut row = SampleRow {
                            cycle: self.sampling_cycle,
                            stall_latency: self.last_instr.stall_latency,
                            teaflags: TEA_FLAG_VALID_0 | TEA_FLAG_OIR,
                            ..SampleRow::default()
                        };
                        row.addresses[0] = self.last_instr.address;
                        row.isslats[0] = self.last_instr.isslat;
                        row.memlats[0] = self.last_instr.memlat;
                        row.signatures[0] = signature;
                        row.emit(&mut self.base.files, 0);

                        self.state = State::Off;
                    } else {
                        self.state = State::Deferred;
                    }
                } else if !exact_hit || this_only_populated {
                    self.state = State::Stalled;
                }
            }

            if self.state != State::Off && token.rob & (ROB_COMMITTING | ROB_EXCEPTION) != 0 {
                let stall_latency =
                    (token.tsc_cycle - self.last_progress_cycle).saturating_sub(1);
                let mut row = SampleRow {
                    cycle: self.sampling_cycle,
                    stall_latency,
                    teaflags: match self.state {
                        State::Stalled => TEA_FLAG_STALLED,
                        State::Deferred => TEA_FLAG_DEFERRED,
                        _ => 0,
                    },
                    ..SampleRow::default()
                };

                if token.rob & ROB_EXCEPTION != 0 {
                    // Only the excepting instruction is sampled.
                    row.addresses[0] = token.first_valid().address;
                    row.signatures[0] = gen_signature(
                        self.last_instr.flags,
                        INSTR_EXCPT,
                        0,
                        self.base.l2_miss_latency,
                        self.base.l3_miss_latency,
                    );
                    row.teaflags = TEA_FLAG_VALID_0;
                } else {
                    let mut flags = self.last_instr.flags;
                    let mut index = 0;
                    for slot in token.slots.iter().filter(|s| s.commits()) {
                        row.addresses[index] = slot.address;
                        row.isslats[index] = slot.isslat;
                        row.memlats[index] = slot.memlat;
                        row.signatures[index] = gen_signature(
                            flags,
                            slot.flags,
                            slot.memlat,
                            self.base.l2_miss_latency,
                            self.base.l3_miss_latency,
                        );
                        row.teaflags |= 1 << index;
                        flags = slot.flags;
                        index += 1;
                    }
                }

                row.emit(&mut self.base.files, 0);
                self.state = State::Off;
            }

            if token.rob & (ROB_EXCEPTION | ROB_COMMITTING) != 0 {
                let mut stall_latency =
                    (token.tsc_cycle - self.last_progress_cycle).saturating_sub(1);

                if token.rob & ROB_EXCEPTION != 0 {
                    self.last_instr.prev_flags = self.last_instr.flags;
                    self.last_instr.address = token.first_valid().address;
                    self.last_instr.flags = INSTR_VALID | INSTR_EXCPT;
                    self.last_instr.isslat = 0;
                    self.last_instr.memlat = 0;
                    self.last_instr.stall_latency = stall_latency;
                } else {
                    for slot in token.slots.iter().filter(|s| s.commits()) {
                        self.last_instr.prev_flags = self.last_instr.flags;
                        self.last_instr.address = slot.address;
                        self.last_instr.flags = slot.flags;
                        self.last_instr.isslat = slot.isslat;
                        self.last_instr.memlat = slot.memlat;
                        self.last_instr.stall_latency = stall_latency;
                        stall_latency = 0;
                    }
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
    Ok(Box::new(TeaSampler::new(args, info, seed)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{RobToken, SlotRecord, INSTR_BR_MISS, INSTR_COMMITS, TOKEN_BYTES};
    use crate::worker::test_support::MemorySink;

    fn sampler(period: u64) -> (TeaSampler, MemorySink) {
        let args = format!("samplingPeriod:{period}");
        let (base, mut sinks) = BaseProfiler::for_test("tea_sampler", &[args.as_str()], 1, 1);
        (TeaSampler::with_base(base).unwrap(), sinks.remove(0))
    }

    fn feed(worker: &mut TeaSampler, tokens: &[RobToken]) {
        let mut data = Vec::with_capacity(tokens.len() * TOKEN_BYTES);
        for token in tokens {
            data.extend_from_slice(&token.encode());
        }
        worker.tick(&data, tokens.len());
    }

    fn commit_token(cycle: u64, address: u64, extra_flags: u16) -> RobToken {
        let mut token = RobToken {
            tsc_cycle: cycle,
            rob: ROB_COMMITTING,
            ..RobToken::default()
        };
        token.slots[0] = SlotRecord {
            flags: INSTR_COMMITS | INSTR_VALID | extra_flags,
            address,
            isslat: 2,
            memlat: 3,
        };
        token
    }

    fn baseline(cycle: u64) -> RobToken {
        RobToken {
            tsc_cycle: cycle,
            ..RobToken::default()
        }
    }

    fn populated(cycle: u64) -> RobToken {
        RobToken {
            tsc_cycle: cycle,
            rob: ROB_POPULATED,
            ..RobToken::default()
        }
    }

    /// Data rows (header skipped), split on ';'.
    fn rows(sink: &MemorySink) -> Vec<Vec<String>> {
        sink.lines()
            .into_iter()
            .skip(1)
            .map(|l| l.split(';').map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn missing_sampling_period_is_fatal() {
        let (base, _) = BaseProfiler::for_test("tea_sampler", &[], 1, 1);
        let err = TeaSampler::with_base(base).unwrap_err();
        assert!(err.to_string().contains("sampling period"));
    }

    #[test]
    fn exact_hit_samples_the_committing_token() {
        let (mut worker, sink) = sampler(100);
        feed(
            &mut worker,
            &[baseline(0), commit_token(50, 0x10, 0), commit_token(100, 0x20, 0)],
        );

        let rows = rows(&sink);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], "100"); // sampling cycle
        assert_eq!(rows[0][2], TEA_FLAG_VALID_0.to_string()); // armed, slot 0
        assert_eq!(rows[0][3], "0x20");
        assert_eq!(rows[0][1], "49"); // stall since the commit at 50
    }

    #[test]
    fn missed_point_in_stall_flags_the_next_commit_stalled() {
        let (mut worker, sink) = sampler(100);
        feed(
            &mut worker,
            &[baseline(0), commit_token(50, 0x10, 0), commit_token(130, 0x30, 0)],
        );

        let rows = rows(&sink);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], "100");
        assert_eq!(rows[0][3], "0x30");
        let teaflags: u16 = rows[0][2].parse().unwrap();
        assert_eq!(teaflags, TEA_FLAG_VALID_0 | TEA_FLAG_STALLED);
    }

    #[test]
    fn missed_point_in_rob_gap_defers_to_the_refill_commit() {
        let (mut worker, sink) = sampler(100);
        feed(
            &mut worker,
            &[
                baseline(0),
                commit_token(50, 0x10, 0),
                populated(120),
                commit_token(125, 0x40, 0),
            ],
        );

        let rows = rows(&sink);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][3], "0x40");
        let teaflags: u16 = rows[0][2].parse().unwrap();
        assert_eq!(teaflags, TEA_FLAG_VALID_0 | TEA_FLAG_DEFERRED);
    }

    #[test]
    fn missed_point_after_offender_emits_the_offender() {
        let (mut worker, sink) = sampler(100);
        feed(
            &mut worker,
            &[
                baseline(0),
                commit_token(50, 0x200, INSTR_BR_MISS),
                populated(120),
                commit_token(125, 0x40, 0),
            ],
        );

        let rows = rows(&sink);
        assert_eq!(rows.len(), 1);
        // The offending instruction itself is the sample.
        assert_eq!(rows[0][0], "100");
        assert_eq!(rows[0][3], "0x200");
        let teaflags: u16 = rows[0][2].parse().unwrap();
        assert_eq!(teaflags, TEA_FLAG_VALID_0 | TEA_FLAG_OIR);
    }

    #[test]
    fn superscalar_sample_fills_all_slots() {
        let (mut worker, sink) = sampler(100);

        let mut wide = RobToken {
            tsc_cycle: 100,
            rob: ROB_COMMITTING,
            ..RobToken::default()
        };
        for (i, address) in [0xA1u64, 0xA2, 0xA3].iter().enumerate() {
            wide.slots[i] = SlotRecord {
                flags: INSTR_COMMITS | INSTR_VALID,
                address: *address,
                ..SlotRecord::default()
            };
        }

        feed(&mut worker, &[baseline(0), wide]);

        let rows = rows(&sink);
        assert_eq!(rows.len(), 1);
        let teaflags: u16 = rows[0][2].parse().unwrap();
        assert_eq!(teaflags, 0b111); // three valid slots
        assert_eq!(rows[0][3], "0xa1");
        assert_eq!(rows[0][7], "0xa2");
        assert_eq!(rows[0][11], "0xa3");
        assert_eq!(rows[0][15], "0x0"); // slot 3 empty
    }

    #[test]
    fn sample_count_tracks_period_coverage() {
        let (mut worker, sink) = sampler(1000);

        let mut tokens = vec![baseline(0)];
        for cycle in (10..=10_000).step_by(10) {
            tokens.push(commit_token(cycle, 0x10, 0));
        }
        feed(&mut worker, &tokens);

        let samples = rows(&sink).len() as i64;
        assert!((samples - 10).abs() <= 1, "got {samples} samples");
    }
}
