//! Minimal workers: a no-op token counter and a raw trace capture.

use anyhow::Result;
use tracing::debug;

use crate::bridge::TraceInfo;
use crate::token::TOKEN_BYTES;
use crate::worker::{FileRegister, TraceWorker};

/// Consumes and counts tokens without analysing them. Useful for pipeline
/// load testing and as the minimal worker example.
pub struct Dummy {
    tokens: u64,
}

impl Dummy {
    pub fn new() -> Self {
        Self { tokens: 0 }
    }
}

impl Default for Dummy {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceWorker for Dummy {
    fn name(&self) -> &str {
        "dummy"
    }

    fn tick(&mut self, _data: &[u8], tokens: usize) {
        self.tokens += tokens as u64;
    }

    fn finish(&mut self) {
        debug!(tokens = self.tokens, "dummy worker drained");
    }
}

pub(crate) fn build_dummy(
    _args: &[String],
    _info: &TraceInfo,
    _seed: Option<u64>,
) -> Result<Box<dyn TraceWorker>> {
    Ok(Box::new(Dummy::new()))
}

/// Captures the raw token bytes of every buffer to its output file, producing
/// a stream the replay bridge can feed back in.
pub struct Filer {
    files: FileRegister,
    tokens: u64,
}

impl Filer {
    pub fn new(args: &[String], info: &TraceInfo) -> Result<Self> {
        Ok(Self {
            files: FileRegister::from_args("filer", args, info, 1)?,
            tokens: 0,
        })
    }
}

impl TraceWorker for Filer {
    fn name(&self) -> &str {
        "filer"
    }

    fn tick(&mut self, data: &[u8], tokens: usize) {
        self.tokens += tokens as u64;
        self.files
            .with_writer(0, |w| w.write_all(&data[..tokens * TOKEN_BYTES]));
    }

    fn finish(&mut self) {
        self.files.flush();
        debug!(tokens = self.tokens, "filer worker drained");
    }
}

pub(crate) fn build_filer(
    args: &[String],
    info: &TraceInfo,
    _seed: Option<u64>,
) -> Result<Box<dyn TraceWorker>> {
    Ok(Box::new(Filer::new(args, info)?))
}
