//! Grow-on-demand value histograms and their CSV run encoding.
//!
//! Workers histogram small non-negative values (latencies, severities,
//! signatures) per 64-bit key. Counters are kept as a dense vector per key
//! and grown on first touch. The text encoding is `v1:c1/v2:c2/…/vmax:cmax`
//! with zero-count entries skipped, except the max-value sentinel which is
//! always printed so the value range survives a round trip.

use std::collections::HashMap;
use std::io::{self, Write};

/// Histogram of observed values per key.
#[derive(Debug, Default, Clone)]
pub struct Histogram {
    inner: HashMap<u64, Vec<u64>>,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one observation of `value` under `key`.
    #[inline]
    pub fn record(&mut self, key: u64, value: u64) {
        self.record_by(key, value, 1);
    }

    /// Records `increment` observations of `value` under `key`.
    pub fn record_by(&mut self, key: u64, value: u64, increment: u64) {
        let counters = self.inner.entry(key).or_default();
        let index = usize::try_from(value).unwrap_or(usize::MAX - 1);
        if counters.len() <= index {
            counters.resize(index + 1, 0);
        }
        counters[index] += increment;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Counter vector for a key, if any value was recorded under it.
    pub fn counters(&self, key: u64) -> Option<&[u64]> {
        self.inner.get(&key).map(Vec::as_slice)
    }

    /// Writes one `prefix0x<key>;<runs>` line per key, keys ascending.
    pub fn write_csv<W: Write + ?Sized>(&self, out: &mut W, prefix: &str) -> io::Result<()> {
        self.write_lines(out, prefix, |c| c.to_string())
    }

    /// Like [`write_csv`](Self::write_csv) but with counters divided by
    /// `norm` and printed as 6-decimal fixed floats.
    pub fn write_csv_normalized<W: Write + ?Sized>(
        &self,
        out: &mut W,
        prefix: &str,
        norm: u64,
    ) -> io::Result<()> {
        self.write_lines(out, prefix, |c| format!("{:.6}", c as f64 / norm as f64))
    }

    fn write_lines<W: Write + ?Sized>(
        &self,
        out: &mut W,
        prefix: &str,
        format_count: impl Fn(u64) -> String,
    ) -> io::Result<()> {
        let mut keys: Vec<u64> = self.inner.keys().copied().collect();
        keys.sort_unstable();

        for key in keys {
            let counters = &self.inner[&key];
            let max = counters.len() - 1;

            write!(out, "{prefix}0x{key:x};")?;
            for (value, &count) in counters.iter().enumerate().take(max) {
                if count == 0 {
                    continue;
                }
                write!(out, "{value}:{}/", format_count(count))?;
            }
            writeln!(out, "{max}:{}", format_count(counters[max]))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(hist: &Histogram) -> String {
        let mut buf = Vec::new();
        hist.write_csv(&mut buf, "").unwrap();
        String::from_utf8(buf).unwrap()
    }

    /// Parses one `0x<key>;v:c/…` line back into key + dense counters.
    fn parse_line(line: &str) -> (u64, Vec<u64>) {
        let (key, runs) = line.split_once(';').unwrap();
        let key = u64::from_str_radix(key.strip_prefix("0x").unwrap(), 16).unwrap();

        let mut counters = Vec::new();
        for run in runs.split('/') {
            let (value, count) = run.split_once(':').unwrap();
            let value: usize = value.parse().unwrap();
            if counters.len() <= value {
                counters.resize(value + 1, 0);
            }
            counters[value] = count.parse().unwrap();
        }
        (key, counters)
    }

    #[test]
    fn record_grows_on_demand() {
        let mut hist = Histogram::new();
        hist.record(0xA0, 5);
        hist.record(0xA0, 5);
        hist.record(0xA0, 2);
        assert_eq!(hist.counters(0xA0), Some(&[0, 0, 1, 0, 0, 2][..]));
    }

    #[test]
    fn record_by_accumulates_increment() {
        let mut hist = Histogram::new();
        hist.record_by(1, 3, 30);
        hist.record_by(1, 3, 12);
        assert_eq!(hist.counters(1), Some(&[0, 0, 0, 42][..]));
    }

    #[test]
    fn encoding_skips_zero_entries_but_keeps_max() {
        let mut hist = Histogram::new();
        hist.record(0x80, 0);
        hist.record(0x80, 4);
        hist.record_by(0x80, 9, 0); // extend the range with a zero sentinel
        assert_eq!(render(&hist), "0x80;0:1/4:1/9:0\n");
    }

    #[test]
    fn encoding_single_value() {
        let mut hist = Histogram::new();
        hist.record(0xD, 0);
        assert_eq!(render(&hist), "0xd;0:1\n");
    }

    #[test]
    fn keys_render_in_ascending_order_with_prefix() {
        let mut hist = Histogram::new();
        hist.record(0x200, 1);
        hist.record(0x10, 2);

        let mut buf = Vec::new();
        hist.write_csv(&mut buf, "7;").unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "7;0x10;2:1\n7;0x200;1:1\n");
    }

    #[test]
    fn normalized_encoding_divides_counters() {
        let mut hist = Histogram::new();
        hist.record_by(0xA, 2, 36);
        let mut buf = Vec::new();
        hist.write_csv_normalized(&mut buf, "", 24).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "0xa;2:1.500000\n");
    }

    #[test]
    fn serialised_form_round_trips_byte_identically() {
        let mut hist = Histogram::new();
        hist.record(0x1F, 0);
        hist.record_by(0x1F, 7, 3);
        hist.record(0x400, 12);
        hist.record(0x400, 12);
        hist.record(0x400, 1);

        let first = render(&hist);

        let mut reparsed = Histogram::new();
        for line in first.lines() {
            let (key, counters) = parse_line(line);
            for (value, &count) in counters.iter().enumerate() {
                reparsed.record_by(key, value as u64, count);
            }
        }

        assert_eq!(render(&reparsed), first);
    }
}
