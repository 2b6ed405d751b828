use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for a profiling session.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory worker output files are created in. Default: ".".
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Trace bridge configuration.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Token buffer pool configuration.
    #[serde(default)]
    pub buffers: BufferConfig,

    /// Number of worker threads. 0 means one thread per worker; lower values
    /// multiplex several workers onto each thread round-robin.
    #[serde(default)]
    pub trace_threads: usize,

    /// Seed for the sampling-dither RNG. Unset means seeded from the OS.
    #[serde(default)]
    pub rng_seed: Option<u64>,

    /// Analysis workers to attach to the stream.
    #[serde(default)]
    pub workers: Vec<WorkerEntry>,
}

/// Trace bridge configuration.
#[derive(Debug, Deserialize)]
pub struct BridgeConfig {
    /// Captured token stream to replay (raw 64-byte records).
    #[serde(default)]
    pub stream_path: PathBuf,

    /// How long the ingest loop sleeps after a short pull. Default: 100us.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maximum tokens pulled from the bridge per tick. Default: 512.
    #[serde(default = "default_pull_tokens")]
    pub pull_tokens: usize,
}

/// Token buffer pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Number of pre-allocated buffers. Default: 64.
    #[serde(default = "default_buffer_depth")]
    pub depth: usize,

    /// Token capacity of each buffer. Default: 4096.
    #[serde(default = "default_token_capacity")]
    pub token_capacity: usize,

    /// Fill level at which a buffer is published to the workers.
    /// Default: 75% of `token_capacity`.
    #[serde(default)]
    pub token_threshold: Option<usize>,
}

/// One worker attached to the stream.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerEntry {
    /// Registry name (`oracle`, `tea_gold`, `pebs_sampler`, ...).
    pub name: String,

    /// `key:value` worker arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_poll_interval() -> Duration {
    Duration::from_micros(100)
}

fn default_pull_tokens() -> usize {
    512
}

fn default_buffer_depth() -> usize {
    64
}

fn default_token_capacity() -> usize {
    4096
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            output_dir: default_output_dir(),
            bridge: BridgeConfig::default(),
            buffers: BufferConfig::default(),
            trace_threads: 0,
            rng_seed: None,
            workers: Vec::new(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stream_path: PathBuf::new(),
            poll_interval: default_poll_interval(),
            pull_tokens: default_pull_tokens(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            depth: default_buffer_depth(),
            token_capacity: default_token_capacity(),
            token_threshold: None,
        }
    }
}

impl BufferConfig {
    /// Publication watermark: explicit value, or 75% of capacity.
    pub fn threshold(&self) -> usize {
        self.token_threshold
            .unwrap_or(self.token_capacity * 3 / 4)
            .max(1)
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            bail!("at least one worker is required");
        }

        for worker in &self.workers {
            if !crate::worker::is_registered(&worker.name) {
                bail!("unknown worker name: {}", worker.name);
            }
        }

        if self.buffers.depth < 2 {
            bail!("buffers.depth must be at least 2 (fill and drain overlap)");
        }

        if self.buffers.token_capacity == 0 {
            bail!("buffers.token_capacity must be positive");
        }

        if let Some(threshold) = self.buffers.token_threshold {
            if threshold == 0 || threshold > self.buffers.token_capacity {
                bail!(
                    "buffers.token_threshold must be in 1..={}",
                    self.buffers.token_capacity
                );
            }
        }

        if self.bridge.pull_tokens == 0 {
            bail!("bridge.pull_tokens must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            workers: vec![WorkerEntry {
                name: "dummy".to_string(),
                args: Vec::new(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.buffers.depth, 64);
        assert_eq!(cfg.buffers.token_capacity, 4096);
        assert_eq!(cfg.buffers.threshold(), 3072);
        assert_eq!(cfg.bridge.pull_tokens, 512);
        assert_eq!(cfg.bridge.poll_interval, Duration::from_micros(100));
        assert_eq!(cfg.trace_threads, 0);
    }

    #[test]
    fn test_validation_requires_workers() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("at least one worker"));
    }

    #[test]
    fn test_validation_unknown_worker() {
        let mut cfg = minimal();
        cfg.workers.push(WorkerEntry {
            name: "telepathy".to_string(),
            args: Vec::new(),
        });
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown worker name"));
    }

    #[test]
    fn test_validation_threshold_bounds() {
        let mut cfg = minimal();
        cfg.buffers.token_threshold = Some(cfg.buffers.token_capacity + 1);
        assert!(cfg.validate().is_err());

        cfg.buffers.token_threshold = Some(cfg.buffers.token_capacity);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_depth() {
        let mut cfg = minimal();
        cfg.buffers.depth = 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("buffers.depth"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
output_dir: profiles
bridge:
  stream_path: rob-trace.bin
  poll_interval: 250us
  pull_tokens: 128
buffers:
  depth: 8
  token_capacity: 1024
trace_threads: 2
workers:
  - name: oracle
    args: ["flushAfter:1000000"]
  - name: pebs_sampler
    args: ["samplingPeriod:100000", "randomOffset:1000"]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.bridge.poll_interval, Duration::from_micros(250));
        assert_eq!(cfg.buffers.threshold(), 768);
        assert_eq!(cfg.workers.len(), 2);
        assert_eq!(cfg.workers[1].args.len(), 2);
    }
}
