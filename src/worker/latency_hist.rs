//! Per-address memory-latency histograms.
//!
//! Records the memory latency of every committing slot under the slot's
//! address. Results accumulate over the whole session and are dumped once
//! at teardown.

use anyhow::Result;

use crate::bridge::TraceInfo;
use crate::histogram::Histogram;
use crate::token::{TokenStream, ROB_COMMITTING};
use crate::worker::profiler::BaseProfiler;
use crate::worker::TraceWorker;

pub struct LatencyHist {
    base: BaseProfiler,
    memory_latency: Histogram,
}

impl LatencyHist {
    pub fn new(args: &[String], info: &TraceInfo, seed: Option<u64>) -> Result<Self> {
        Ok(Self::with_base(BaseProfiler::new(
            "latency_hist",
            args,
            info,
            1,
            seed,
        )?))
    }

    fn with_base(mut base: BaseProfiler) -> Self {
        base.files.emit(0, format_args!("address;latencies\n"));
        Self {
            base,
            memory_latency: Histogram::new(),
        }
    }

    fn flush_result(&mut self) {
        let hist = &self.memory_latency;
        self.base.files.with_writer(0, |w| hist.write_csv(w, ""));
    }
}

impl TraceWorker for LatencyHist {
    fn name(&self) -> &str {
        "latency_hist"
    }

    fn tick(&mut self, data: &[u8], tokens: usize) {
        for token in TokenStream::new(data, tokens) {
            if token.rob & ROB_COMMITTING == 0 {
                continue;
            }
            for slot in token.slots.iter().filter(|s| s.commits()) {
                self.memory_latency
                    .record(slot.address, u64::from(slot.memlat));
            }
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
    Ok(Box::new(LatencyHist::new(args, info, seed)?))
}
