//! Bridge-facing contract.
//!
//! The simulation-framework harness (MMIO plumbing, stream engine, clock
//! metadata) lives outside this crate. The core only assumes it can read and
//! write a three-register MMIO block and pull whole tokens from a stream.

pub mod replay;

use std::path::PathBuf;

use anyhow::Result;

/// Addresses of the bridge's MMIO register block.
#[derive(Debug, Clone, Copy)]
pub struct MmioRegs {
    /// Written with 1 once the host side is ready to drain.
    pub init_done: u32,
    /// Read; non-zero gates data flow.
    pub trace_enable: u32,
    /// Read; opaque trigger-source id.
    pub trigger_selector: u32,
}

/// Static facts about the trace source, handed to every worker at
/// construction.
#[derive(Debug, Clone)]
pub struct TraceInfo {
    /// Identifies this trace source in output file names and logs.
    pub tracer_id: usize,
    /// Wire size of one token in bytes.
    pub token_bytes: usize,
    /// Directory worker output files are created in.
    pub output_dir: PathBuf,
}

/// A source of ROB analysis tokens.
///
/// `pull` must hand out whole tokens only; there are no ordering promises
/// beyond monotonic cycle counts within the stream.
pub trait TraceBridge: Send {
    /// Reads one MMIO word.
    fn mmio_read(&mut self, addr: u32) -> Result<u64>;

    /// Writes one MMIO word.
    fn mmio_write(&mut self, addr: u32, value: u64) -> Result<()>;

    /// Pulls up to `max_tokens` tokens into `buf`, returning the number of
    /// tokens read. A short (or zero) return is a transient underrun, not an
    /// error.
    fn pull(&mut self, buf: &mut [u8], max_tokens: usize) -> Result<usize>;

    /// Whether the stream can never produce tokens again. Live bridges stay
    /// open forever; replay sources report end-of-file here.
    fn stream_ended(&self) -> bool {
        false
    }
}
