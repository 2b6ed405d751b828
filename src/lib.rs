//! Host-side consumer for a hardware trace bridge.
//!
//! A simulated out-of-order core streams fixed-width reorder-buffer analysis
//! tokens over a DMA-like interface. This crate drains that stream at line
//! rate, fans the raw buffers out to a configurable set of analysis workers,
//! and has each worker produce a post-silicon-style performance profile
//! (stall attribution, sampled profiling, latency histograms) as CSV.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod histogram;
pub mod pool;
pub mod token;
pub mod worker;
