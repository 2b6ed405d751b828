//! Exhaustive per-instruction attribution.
//!
//! Every simulated cycle between two tokens is attributed to exactly one
//! instruction address and one category: commit, stall, deferred, branch
//! miss, flush or exception. Commit cycles carry the fractional ILP weight
//! `24/n` so the accounting stays in integer arithmetic until the final
//! divide at flush time.

use std::collections::HashMap;

use anyhow::Result;

use crate::bridge::TraceInfo;
use crate::token::{
    RobToken, TokenStream, INSTR_BR_MISS, INSTR_FLUSHS, ROB_COMMITTING, ROB_EXCEPTION,
    ROB_POPULATED,
};
use crate::worker::profiler::{BaseProfiler, ILP_UNIT, ILP_WEIGHTS};
use crate::worker::TraceWorker;

/// Per-address commit and stall accounting.
#[derive(Debug, Default, Clone, Copy)]
struct FlatSample {
    t_commit: u64,
    t_stall: u64,
    t_deferred: u64,
    t_br_miss: u64,
    t_flush: u64,
    t_excpt: u64,
    t_issue_latency: u64,
    t_memory_latency: u64,
    c_commit: u64,
    c_stall: u64,
    c_deferred: u64,
    c_br_miss: u64,
    c_flush: u64,
    c_excpt: u64,
}

pub struct Oracle {
    base: BaseProfiler,
    result: HashMap<u64, FlatSample>,
    last_token: RobToken,
}

impl Oracle {
    pub fn new(args: &[String], info: &TraceInfo, seed: Option<u64>) -> Result<Self> {
        Ok(Self::with_base(BaseProfiler::new("oracle", args, info, 1, seed)?))
    }

    fn with_base(mut base: BaseProfiler) -> Self {
        base.files.emit(
            0,
            format_args!(
                "pc;tCycles;tCommit;tStall;tDeferred;tBrMiss;tFlush;tExcpt;\
                 tIssueLatency;tMemoryLatency;cCommit;cStall;cDeferred;cBrMiss;cFlush;cExcpt\n"
            ),
        );
        Self {
            base,
            result: HashMap::new(),
            last_token: RobToken::default(),
        }
    }

    fn flush_result(&mut self) {
        let mut addresses: Vec<u64> = self.result.keys().copied().collect();
        addresses.sort_unstable();

        for address in addresses {
            let s = self.result[&address];
            let t_commit = s.t_commit as f64 / ILP_UNIT as f64;
            let t_cycles = t_commit
                + (s.t_stall + s.t_deferred + s.t_br_miss + s.t_flush + s.t_excpt) as f64;

            self.base.files.emit(
                0,
                format_args!(
                    "0x{address:x};{t_cycles:.6};{t_commit:.6};{};{};{};{};{};{};{};{};{};{};{};{};{}\n",
                    s.t_stall,
                    s.t_deferred,
                    s.t_br_miss,
                    s.t_flush,
                    s.t_excpt,
                    s.t_issue_latency,
                    s.t_memory_latency,
                    s.c_commit,
                    s.c_stall,
                    s.c_deferred,
                    s.c_br_miss,
                    s.c_flush,
                    s.c_excpt,
                ),
            );
        }
        self.result.clear();
    }
}

impl TraceWorker for Oracle {
    fn name(&self) -> &str {
        "oracle"
    }

    fn tick(&mut self, data: &[u8], tokens: usize) {
        for token in TokenStream::new(data, tokens) {
            if self.base.flush_due(token.tsc_cycle) {
                self.flush_result();
            }
            if self.base.take_first_token() {
                self.last_token = token;
                continue;
            }

            // Attribution only advances on committing, populated and
            // exception tokens.
            if token.rob & (ROB_POPULATED | ROB_COMMITTING | ROB_EXCEPTION) == 0 {
                continue;
            }

            let mut remaining = token.tsc_cycle - self.last_token.tsc_cycle;

            if token.rob & ROB_POPULATED != 0 {
                let deferred_cycles = remaining.saturating_sub(1);

                if self.last_token.rob & ROB_EXCEPTION != 0 {
                    let address = self.last_token.first_valid().address;
                    self.result.entry(address).or_default().t_excpt += deferred_cycles;
                } else {
                    let last = *self.last_token.last_committing();
                    if last.flags & (INSTR_BR_MISS | INSTR_FLUSHS) != 0 {
                        let target = self.result.entry(last.address).or_default();
                        if last.flags & INSTR_BR_MISS != 0 {
                            target.t_br_miss += deferred_cycles;
                            target.c_br_miss += 1;
                        }
                        if last.flags & INSTR_FLUSHS != 0 {
                            target.t_flush += deferred_cycles;
                            target.c_flush += 1;
                        }
                    } else {
                        // Pure stall bridge: the refilling instruction waited.
                        let address = token.first_valid().address;
                        self.result.entry(address).or_default().t_deferred += deferred_cycles;
                    }
                }
                remaining = 1;
            }

            let attributes = token.rob & (ROB_COMMITTING | ROB_EXCEPTION) != 0;

            if !attributes || remaining > 1 {
                let address = token.first_valid().address;
                self.result.entry(address).or_default().t_stall +=
                    remaining - u64::from(attributes);
            }

            if attributes {
                if token.rob & ROB_COMMITTING != 0 {
                    let this_populated = token.rob & ROB_POPULATED != 0;
                    let last_only_populated = self.last_token.rob & ROB_POPULATED != 0
                        && self.last_token.rob & (ROB_COMMITTING | ROB_EXCEPTION) == 0;
                    // Charged to the first committing slot only.
                    let mut stalled = !this_populated && last_only_populated;
                    let mut deferred = this_populated || last_only_populated;

                    let ilp_cycles = ILP_WEIGHTS[token.committing_count() - 1];
                    for slot in token.slots.iter().filter(|s| s.commits()) {
                        let target = self.result.entry(slot.address).or_default();
                        target.t_commit += ilp_cycles;
                        target.t_issue_latency += u64::from(slot.isslat);
                        target.t_memory_latency += u64::from(slot.memlat);
                        target.c_commit += 1;
                        target.c_stall += u64::from(stalled);
                        target.c_deferred += u64::from(deferred);
                        stalled = false;
                        deferred = false;
                    }
                } else {
                    let address = token.first_valid().address;
                    let target = self.result.entry(address).or_default();
                    target.t_excpt += 1;
                    target.c_excpt += 1;
                }
            }

            self.last_token = token;
        }
    }

    fn finish(&mut self) {
        self.flush_result();
        self.base.files.flush();
    }
}

pub(crate) fn build(
    args: &[String],
    info: &TraceInfo,
    seed: Option<u64>,
) -> Result<Box<dyn TraceWorker>> {
    Ok(Box::new(Oracle::new(args, info, seed)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{SlotRecord, INSTR_COMMITS, INSTR_VALID, TOKEN_BYTES};
    use crate::worker::test_support::MemorySink;

    fn oracle() -> (Oracle, MemorySink) {
        let (base, mut sinks) = BaseProfiler::for_test("oracle", &[], 1, 1);
        (Oracle::with_base(base), sinks.remove(0))
    }

    fn feed(worker: &mut Oracle, tokens: &[RobToken]) {
        let mut data = Vec::with_capacity(tokens.len() * TOKEN_BYTES);
        for token in tokens {
            data.extend_from_slice(&token.encode());
        }
        worker.tick(&data, tokens.len());
    }

    fn committing_slot(address: u64, flags: u16, memlat: u16, isslat: u16) -> SlotRecord {
        SlotRecord {
            flags: INSTR_COMMITS | INSTR_VALID | flags,
            address,
            memlat,
            isslat,
        }
    }

    fn commit_token(cycle: u64, slots: &[SlotRecord]) -> RobToken {
        let mut token = RobToken {
            tsc_cycle: cycle,
            rob: ROB_COMMITTING,
            ..RobToken::default()
        };
        token.slots[..slots.len()].copy_from_slice(slots);
        token
    }

    fn baseline(cycle: u64) -> RobToken {
        RobToken {
            tsc_cycle: cycle,
            ..RobToken::default()
        }
    }

    fn populated(cycle: u64, address: u64) -> RobToken {
        let mut token = RobToken {
            tsc_cycle: cycle,
            rob: ROB_POPULATED,
            ..RobToken::default()
        };
        token.slots[0] = SlotRecord {
            flags: INSTR_VALID,
            address,
            ..SlotRecord::default()
        };
        token
    }

    /// Output row for an address, split into fields.
    fn row(sink: &MemorySink, address: u64) -> Vec<String> {
        let prefix = format!("0x{address:x};");
        sink.lines()
            .iter()
            .find(|l| l.starts_with(&prefix))
            .unwrap_or_else(|| panic!("no row for 0x{address:x}"))
            .split(';')
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn single_commit_attributes_one_ilp_unit() {
        let (mut worker, sink) = oracle();
        feed(
            &mut worker,
            &[
                baseline(999),
                commit_token(1000, &[committing_slot(0x80, 0, 0, 0)]),
            ],
        );
        worker.finish();

        let fields = row(&sink, 0x80);
        assert_eq!(fields[1], "1.000000"); // tCycles
        assert_eq!(fields[2], "24.000000"); // tCommit
        assert!(fields[3..10].iter().all(|f| f == "0"));
        assert_eq!(fields[10], "1"); // cCommit
        assert!(fields[11..].iter().all(|f| f == "0"));
    }

    #[test]
    fn commit_latencies_accumulate() {
        let (mut worker, sink) = oracle();
        feed(
            &mut worker,
            &[
                baseline(999),
                commit_token(1000, &[committing_slot(0x80, 0, 10, 4)]),
                commit_token(1001, &[committing_slot(0x80, 0, 30, 6)]),
            ],
        );
        worker.finish();

        let fields = row(&sink, 0x80);
        assert_eq!(fields[8], "10"); // tIssueLatency
        assert_eq!(fields[9], "40"); // tMemoryLatency
        assert_eq!(fields[10], "2"); // cCommit
    }

    #[test]
    fn stall_bridge_charges_the_committing_instruction() {
        let (mut worker, sink) = oracle();
        feed(
            &mut worker,
            &[
                populated(100, 0xA0),
                commit_token(110, &[committing_slot(0xA0, 0, 0, 0)]),
            ],
        );
        worker.finish();

        let fields = row(&sink, 0xa0);
        assert_eq!(fields[1], "10.000000"); // tCycles = 1 + 9
        assert_eq!(fields[2], "24.000000");
        assert_eq!(fields[3], "9"); // tStall
        assert_eq!(fields[10], "1"); // cCommit
        assert_eq!(fields[11], "1"); // cStall
        assert_eq!(fields[12], "1"); // cDeferred
    }

    #[test]
    fn br_miss_refill_gap_charges_the_offender() {
        let (mut worker, sink) = oracle();
        feed(
            &mut worker,
            &[
                baseline(40),
                commit_token(50, &[committing_slot(0x200, INSTR_BR_MISS, 0, 0)]),
                populated(80, 0x300),
                commit_token(81, &[committing_slot(0x300, 0, 0, 0)]),
            ],
        );
        worker.finish();

        let offender = row(&sink, 0x200);
        assert_eq!(offender[5], "29"); // tBrMiss = 80 - 50 - 1
        assert_eq!(offender[13], "1"); // cBrMiss

        let refill = row(&sink, 0x300);
        assert_eq!(refill[2], "24.000000");
        assert_eq!(refill[3], "1"); // the populated token's own cycle stalls
    }

    #[test]
    fn exception_gap_and_cycle_charge_first_valid() {
        let (mut worker, sink) = oracle();

        let mut exception = RobToken {
            tsc_cycle: 60,
            rob: ROB_EXCEPTION,
            ..RobToken::default()
        };
        exception.slots[0] = SlotRecord {
            flags: INSTR_VALID,
            address: 0x900,
            ..SlotRecord::default()
        };

        feed(
            &mut worker,
            &[
                baseline(59),
                exception,
                populated(70, 0x900),
                commit_token(71, &[committing_slot(0x900, 0, 0, 0)]),
            ],
        );
        worker.finish();

        let fields = row(&sink, 0x900);
        // 1 cycle for the excepting token itself, 9 for the refill gap.
        assert_eq!(fields[7], "10"); // tExcpt
        assert_eq!(fields[15], "1"); // cExcpt
    }

    #[test]
    fn superscalar_commit_splits_ilp_weight() {
        let (mut worker, sink) = oracle();
        feed(
            &mut worker,
            &[
                baseline(9),
                commit_token(
                    10,
                    &[
                        committing_slot(0xA, 0, 0, 0),
                        committing_slot(0xB, 0, 0, 0),
                        committing_slot(0xC, 0, 0, 0),
                        committing_slot(0xD, 0, 0, 0),
                    ],
                ),
            ],
        );
        worker.finish();

        for address in [0xA, 0xB, 0xC, 0xD] {
            let fields = row(&sink, address);
            assert_eq!(fields[2], "6.000000"); // 24/4
            assert_eq!(fields[1], "0.250000");
        }
    }

    #[test]
    fn attribution_is_complete_over_the_window() {
        // Property: for a sequence starting and ending with COMMITTING,
        // summed categories equal the last minus the first accounted cycle.
        let (mut worker, _sink) = oracle();
        feed(
            &mut worker,
            &[
                baseline(100),
                commit_token(101, &[committing_slot(0x1, 0, 0, 0)]),
                commit_token(105, &[committing_slot(0x2, INSTR_BR_MISS, 0, 0)]),
                populated(120, 0x3),
                commit_token(130, &[committing_slot(0x3, 0, 0, 0)]),
                commit_token(131, &[committing_slot(0x4, 0, 0, 0), committing_slot(0x5, 0, 0, 0)]),
            ],
        );

        let total: f64 = worker
            .result
            .values()
            .map(|s| {
                s.t_commit as f64 / ILP_UNIT as f64
                    + (s.t_stall + s.t_deferred + s.t_br_miss + s.t_flush + s.t_excpt) as f64
            })
            .sum();
        assert_eq!(total, (131 - 101) as f64);
    }

    #[test]
    fn periodic_flush_empties_the_result_window() {
        let (base, mut sinks) = BaseProfiler::for_test("oracle", &["flushAfter:1000"], 1, 1);
        let mut worker = Oracle::with_base(base);
        let sink = sinks.remove(0);

        feed(
            &mut worker,
            &[
                baseline(10),
                commit_token(11, &[committing_slot(0xAA, 0, 0, 0)]),
            ],
        );
        // Crossing the flush threshold dumps and clears the window.
        feed(
            &mut worker,
            &[commit_token(2000, &[committing_slot(0xBB, 0, 0, 0)])],
        );

        let lines = sink.lines();
        assert!(lines.iter().any(|l| l.starts_with("0xaa;")));
        assert!(worker.result.contains_key(&0xBB));
        assert!(!worker.result.contains_key(&0xAA));
    }
}
