//! Trace-analysis worker framework.
//!
//! Workers are the consumers of published token buffers: each one keeps its
//! own analysis state and output files, and never talks to other workers.
//! A static name → builder registry maps configuration entries to concrete
//! implementations.

pub mod basic;
pub mod ibs_sampler;
pub mod latency_hist;
pub mod oracle;
pub mod pebs_sampler;
pub mod profiler;
pub mod tea_gold;
pub mod tea_sampler;

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use tracing::error;

use crate::bridge::TraceInfo;

/// A consumer of published token buffers.
///
/// `tick` runs on the worker's own thread, entirely outside the dispatch
/// lock, over a read-only buffer of `tokens` whole records.
pub trait TraceWorker: Send {
    /// Registry name, used in logs.
    fn name(&self) -> &str;

    /// Processes one published buffer.
    fn tick(&mut self, data: &[u8], tokens: usize);

    /// Final result flush when the session drains.
    fn finish(&mut self) {}
}

impl fmt::Debug for dyn TraceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceWorker").field("name", &self.name()).finish()
    }
}

type BuildFn = fn(&[String], &TraceInfo, Option<u64>) -> Result<Box<dyn TraceWorker>>;

/// The worker register. Add entries here to register new workers.
const REGISTRY: &[(&str, BuildFn)] = &[
    ("dummy", basic::build_dummy),
    ("filer", basic::build_filer),
    ("oracle", oracle::build),
    ("latency_hist", latency_hist::build),
    ("tea_gold", tea_gold::build),
    ("tea_sampler", tea_sampler::build),
    ("ibs_sampler", ibs_sampler::build),
    ("pebs_sampler", pebs_sampler::build),
];

/// Whether `name` maps to a registered worker.
pub fn is_registered(name: &str) -> bool {
    REGISTRY.iter().any(|(n, _)| *n == name)
}

/// Builds a registered worker from its `key:value` arguments.
pub fn build(
    name: &str,
    args: &[String],
    info: &TraceInfo,
    seed: Option<u64>,
) -> Result<Box<dyn TraceWorker>> {
    let (_, builder) = REGISTRY
        .iter()
        .find(|(n, _)| *n == name)
        .ok_or_else(|| anyhow!("unknown worker name: {name}"))?;
    builder(args, info, seed)
}

/// All registered worker names, in registration order.
pub fn registered_names() -> Vec<&'static str> {
    REGISTRY.iter().map(|(n, _)| *n).collect()
}

// ---------------------------------------------------------------------------
// key:value argument parsing
// ---------------------------------------------------------------------------

/// Splits a `key:value` worker argument. Arguments without a colon yield an
/// empty value.
pub(crate) fn split_arg(arg: &str) -> (&str, &str) {
    match arg.split_once(':') {
        Some((key, value)) => (key, value),
        None => (arg, ""),
    }
}

/// Parses a numeric worker argument; `0x`-prefixed values are hex.
pub(crate) fn parse_number(value: &str) -> Result<u64> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| anyhow!("invalid numeric value: {value:?}"))
}

// ---------------------------------------------------------------------------
// Output file register
// ---------------------------------------------------------------------------

enum SinkKind {
    File(BufWriter<File>),
    #[cfg(test)]
    Memory(test_support::MemorySink),
}

struct RegisteredSink {
    label: String,
    sink: SinkKind,
}

impl RegisteredSink {
    fn writer(&mut self) -> &mut dyn Write {
        match &mut self.sink {
            SinkKind::File(w) => w,
            #[cfg(test)]
            SinkKind::Memory(w) => w,
        }
    }
}

/// The output files of one worker.
///
/// Write failures are reported and swallowed: the data of that flush window
/// is lost but processing continues, and no other worker is affected.
pub struct FileRegister {
    sinks: Vec<RegisteredSink>,
}

impl FileRegister {
    /// Opens `required` output files. Paths come from repeated `file:` worker
    /// arguments (relative paths join the session output directory); missing
    /// entries default to `<worker><tracerId>_<index>.csv`.
    pub fn from_args(
        worker: &str,
        args: &[String],
        info: &TraceInfo,
        required: usize,
    ) -> Result<Self> {
        let mut paths: Vec<PathBuf> = args
            .iter()
            .filter_map(|a| {
                let (key, value) = split_arg(a);
                (key == "file" && !value.is_empty()).then(|| PathBuf::from(value))
            })
            .collect();
        paths.truncate(required);
        while paths.len() < required {
            paths.push(PathBuf::from(format!(
                "{worker}{}_{}.csv",
                info.tracer_id,
                paths.len()
            )));
        }

        let mut sinks = Vec::with_capacity(required);
        for path in paths {
            let path = if path.is_absolute() {
                path
            } else {
                info.output_dir.join(path)
            };
            let file = File::create(&path)
                .with_context(|| format!("creating output file {}", path.display()))?;
            sinks.push(RegisteredSink {
                label: path.display().to_string(),
                sink: SinkKind::File(BufWriter::new(file)),
            });
        }

        Ok(Self { sinks })
    }

    /// Labels of the registered files, for startup banners.
    pub fn labels(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.label.as_str()).collect()
    }

    /// Writes formatted output to file `index`.
    pub fn emit(&mut self, index: usize, args: fmt::Arguments<'_>) {
        let sink = &mut self.sinks[index];
        if let Err(e) = sink.writer().write_fmt(args) {
            error!(file = %sink.label, error = %e, "output write failed, data lost");
        }
    }

    /// Runs a writer callback against file `index` (histogram dumps, raw
    /// captures), reporting and swallowing I/O errors.
    pub fn with_writer(&mut self, index: usize, f: impl FnOnce(&mut dyn Write) -> io::Result<()>) {
        let sink = &mut self.sinks[index];
        if let Err(e) = f(sink.writer()) {
            error!(file = %sink.label, error = %e, "output write failed, data lost");
        }
    }

    /// Flushes all buffered output.
    pub fn flush(&mut self) {
        for sink in &mut self.sinks {
            if let Err(e) = sink.writer().flush() {
                error!(file = %sink.label, error = %e, "output flush failed");
            }
        }
    }
}
