//! Severity-weighted signature histograms with deferred OIR attribution.
//!
//! Each retiring instruction is charged a severity (the stall cycles that
//! preceded its retirement) and an ILP latency (its `24/n` commit weight)
//! under its signature. Offending-in-retirement instructions incur their
//! cost on the *next* populated event, so their attribution is parked in a
//! one-entry register until the refill gap is known.

use std::collections::HashMap;

use anyhow::Result;
use tracing::info;

use crate::bridge::TraceInfo;
use crate::histogram::Histogram;
use crate::token::{TokenStream, INSTR_EXCPT, INSTR_OIR, ROB_COMMITTING, ROB_EXCEPTION, ROB_POPULATED};
use crate::worker::profiler::{gen_signature, BaseProfiler, ILP_UNIT, ILP_WEIGHTS};
use crate::worker::TraceWorker;

/// Pending attribution state for the most recent instruction.
#[derive(Debug, Default, Clone, Copy)]
struct InstrRegister {
    address: u64,
    flags: u16,
    signature: u16,
    severity: u64,
    ilp_latency: u64,
    oir: bool,
}

pub struct TeaGold {
    base: BaseProfiler,
    last_instr: InstrRegister,
    /// Severity histograms per signature: signature → address → severity.
    severity_hists: HashMap<u16, Histogram>,
    /// Signature mix per address, in ILP units; cumulative over the run.
    result: Histogram,
    last_progress_cycle: u64,
}

impl TeaGold {
    pub fn new(args: &[String], info: &TraceInfo, seed: Option<u64>) -> Result<Self> {
        Ok(Self::with_base(BaseProfiler::new("tea_gold", args, info, 2, seed)?))
    }

    fn with_base(mut base: BaseProfiler) -> Self {
        info!(
            worker = "tea_gold",
            l2_miss_latency = base.l2_miss_latency,
            l3_miss_latency = base.l3_miss_latency,
            "severity attribution configured",
        );
        base.files.emit(0, format_args!("signature;address;latencies\n"));
        base.files.emit(1, format_args!("address;signatures\n"));
        Self {
            base,
            last_instr: InstrRegister::default(),
            severity_hists: HashMap::new(),
            result: Histogram::new(),
            last_progress_cycle: 0,
        }
    }

    /// Finalises a parked OIR attribution, folding in any severity gathered
    /// after the commit (the ROB-empty refill gap).
    fn attribute_oir(&mut self, additional_severity: u64) {
        if !self.last_instr.oir {
            return;
        }
        let severity = self.last_instr.severity + additional_severity;
        self.severity_hists
            .entry(self.last_instr.signature)
            .or_default()
            .record(self.last_instr.address, severity);
        self.result.record_by(
            self.last_instr.address,
            u64::from(self.last_instr.signature),
            self.last_instr.ilp_latency + severity * ILP_UNIT,
        );
        self.last_instr.oir = false;
    }

    fn attribute(&mut self, address: u64, flags: u16, memlat: u16, severity: u64, ilp_latency: u64) {
        let signature = gen_signature(
            self.last_instr.flags,
            flags,
            memlat,
            self.base.l2_miss_latency,
            self.base.l3_miss_latency,
        );

        if flags & INSTR_OIR == 0 {
            self.severity_hists
                .entry(signature)
                .or_default()
                .record(address, severity);
            self.result
                .record_by(address, u64::from(signature), ilp_latency + severity * ILP_UNIT);
        } else {
            // Defer to learn the full severity at the next populated event.
            self.last_instr.address = address;
            self.last_instr.signature = signature;
            self.last_instr.severity = severity;
            self.last_instr.ilp_latency = ilp_latency;
            self.last_instr.oir = true;
        }

        self.last_instr.flags = flags;
    }

    fn flush_result(&mut self) {
        let mut signatures: Vec<u16> = self.severity_hists.keys().copied().collect();
        signatures.sort_unstable();
        for signature in signatures {
            let hist = &self.severity_hists[&signature];
            self.base
                .files
                .with_writer(0, |w| hist.write_csv(w, &format!("{signature};")));
        }
        self.severity_hists.clear();

        // The signature mix is cumulative and re-emitted in full.
        let result = &self.result;
        self.base
            .files
            .with_writer(1, |w| result.write_csv_normalized(w, "", ILP_UNIT));
    }
}

impl TraceWorker for TeaGold {
    fn name(&self) -> &str {
        "tea_gold"
    }

    fn tick(&mut self, data: &[u8], tokens: usize) {
        for token in TokenStream::new(data, tokens) {
            if self.base.flush_due(token.tsc_cycle) {
                self.flush_result();
            }
            if self.base.take_first_token() {
                self.last_instr = InstrRegister::default();
                self.last_progress_cycle = token.tsc_cycle;
                continue;
            }

            if token.rob & ROB_POPULATED != 0 && self.last_instr.oir {
                // Charge the whole refill gap but this cycle to the parked
                // offender.
                let gap = (token.tsc_cycle - self.last_progress_cycle).saturating_sub(1);
                self.attribute_oir(gap);
                self.last_progress_cycle = token.tsc_cycle.saturating_sub(1);
            }

            if token.rob & (ROB_COMMITTING | ROB_EXCEPTION) != 0 {
                let mut severity = (token.tsc_cycle - self.last_progress_cycle).saturating_sub(1);

                // Any still-pending OIR attribution ends here.
                self.attribute_oir(0);

                if token.rob & ROB_COMMITTING != 0 {
                    let ilp_latency = ILP_WEIGHTS[token.committing_count() - 1];
                    for slot in token.slots.iter().filter(|s| s.commits()) {
                        self.attribute(slot.address, slot.flags, slot.memlat, severity, ilp_latency);
                        severity = 0;
                    }
                } else {
                    let address = token.first_valid().address;
                    self.attribute(address, INSTR_EXCPT, 0, severity, ILP_WEIGHTS[0]);
                }

                self.last_progress_cycle = token.tsc_cycle;
            }
        }
    }

    fn finish(&mut self) {
        self.attribute_oir(0);
        self.flush_result();
        self.base.files.flush();
    }
}

pub(crate) fn build(
    args: &[String],
    info: &TraceInfo,
    seed: Option<u64>,
) -> Result<Box<dyn TraceWorker>> {
    Ok(Box::new(TeaGold::new(args, info, seed)?))
}
