use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use super::error::{EngineError, Result};

/// Hard cap on parallel probes regardless of what the user requests.
pub const MAX_THREADS: usize = 10;

/// Per-scan configuration, threaded through the call graph. No process-wide
/// singletons; every component receives an `Arc<ScanConfig>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Per-request timeout in seconds.
    pub timeout: f64,
    /// Lower bound of the inter-request sleep; jitter U(0, 0.7) is added.
    pub delay: f64,
    /// Time-based oracle threshold in seconds.
    pub timesec: f64,
    /// Per-position extraction retries.
    pub retry: u32,
    /// Requested parallelism; coerced to [`MAX_THREADS`].
    pub threads: usize,
    /// Never prompt; take defaults.
    pub batch: bool,
    /// Ignore persisted partial extractions and confirmed vectors.
    pub fresh_queries: bool,
    /// CSV of HTTP codes treated as non-fatal; `*` means `{401}`.
    pub ignore_code: String,
    /// Force an inference strategy: binary, between, in or equal.
    pub fetch_using: Option<String>,
    /// CSV of tamper names, or `all`.
    pub tamper: Option<String>,
    /// Force text-only oracle comparison.
    pub text_only: bool,
    /// User-specified oracle match criteria.
    pub string: Option<String>,
    pub not_string: Option<String>,
    pub code: Option<u16>,
    /// Do not percent-encode payloads in GET/POST/COOKIE.
    pub skip_urlencoding: bool,
    /// Bias technique order toward error-based when the heuristic fires.
    pub prioritize: bool,
    /// Restrict probing to a technique subset, letters of "EBT".
    pub test_filter: Option<String>,
    pub follow_redirects: bool,
    pub continue_on_http_error: bool,
    pub proxy: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout: 30.0,
            delay: 0.0,
            timesec: 5.0,
            retry: 3,
            threads: 1,
            batch: false,
            fresh_queries: false,
            ignore_code: String::new(),
            fetch_using: None,
            tamper: None,
            text_only: false,
            string: None,
            not_string: None,
            code: None,
            skip_urlencoding: false,
            prioritize: false,
            test_filter: None,
            follow_redirects: true,
            continue_on_http_error: false,
            proxy: None,
        }
    }
}

/// Techniques enabled for the detection pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TechniqueSet {
    pub error: bool,
    pub boolean: bool,
    pub time: bool,
}

impl Default for TechniqueSet {
    fn default() -> Self {
        Self { error: true, boolean: true, time: true }
    }
}

impl ScanConfig {
    /// Load config from a TOML file, or use defaults if it doesn't exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ScanConfig =
            toml::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Validate user-supplied values; called once at startup so that bad
    /// input is a [`EngineError::Config`] instead of a mid-scan surprise.
    pub fn validate(&mut self) -> Result<()> {
        self.parsed_ignore_codes()?;
        if let Some(name) = &self.fetch_using {
            let known = ["binary", "between", "in", "equal"];
            if !known.contains(&name.to_lowercase().as_str()) {
                return Err(EngineError::Config(format!(
                    "unknown fetch_using value '{}', expected one of binary/between/in/equal",
                    name
                )));
            }
        }
        if let Some(filter) = &self.test_filter {
            if !filter.to_uppercase().chars().all(|c| "EBT".contains(c)) {
                return Err(EngineError::Config(format!(
                    "invalid test_filter '{}', expected letters from EBT",
                    filter
                )));
            }
        }
        if self.threads > MAX_THREADS {
            tracing::warn!("threads capped at {} (requested: {})", MAX_THREADS, self.threads);
            self.threads = MAX_THREADS;
        }
        if self.threads == 0 {
            self.threads = 1;
        }
        Ok(())
    }

    /// Parsed `ignore_code` values; `*` is shorthand for `{401}`.
    pub fn parsed_ignore_codes(&self) -> Result<HashSet<u16>> {
        if self.ignore_code.is_empty() {
            return Ok(HashSet::new());
        }
        if self.ignore_code == "*" {
            return Ok(HashSet::from([401]));
        }
        self.ignore_code
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim().parse::<u16>().map_err(|_| {
                    EngineError::Config(format!(
                        "invalid ignore_code value '{}', expected comma-separated integers or '*'",
                        self.ignore_code
                    ))
                })
            })
            .collect()
    }

    pub fn effective_timeout(&self) -> f64 {
        if self.timeout > 0.0 {
            self.timeout
        } else {
            30.0
        }
    }

    /// Techniques selected via `test_filter`, defaulting to all three.
    pub fn techniques(&self) -> TechniqueSet {
        match &self.test_filter {
            None => TechniqueSet::default(),
            Some(filter) => {
                let upper = filter.to_uppercase();
                TechniqueSet {
                    error: upper.contains('E'),
                    boolean: upper.contains('B'),
                    time: upper.contains('T'),
                }
            }
        }
    }

    /// Tamper names in user-declared order, if any were selected.
    pub fn tamper_names(&self) -> Option<Vec<String>> {
        self.tamper.as_ref().map(|csv| {
            csv.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub retries: u64,
    pub read_timeouts: u64,
}

/// Per-scan counters. Shared across probe tasks via `Arc`, so the inner
/// record sits behind a mutex.
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<MetricsSnapshot>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next request sequence number, starting at 1.
    pub fn next_request(&self) -> u64 {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.requests += 1;
        inner.requests
    }

    pub fn note_retry(&self) {
        self.inner.lock().expect("metrics lock poisoned").retries += 1;
    }

    pub fn note_read_timeout(&self) {
        self.inner.lock().expect("metrics lock poisoned").read_timeouts += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        *self.inner.lock().expect("metrics lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_code_wildcard_means_401() {
        let config = ScanConfig { ignore_code: "*".into(), ..Default::default() };
        assert_eq!(config.parsed_ignore_codes().unwrap(), HashSet::from([401]));
    }

    #[test]
    fn ignore_code_csv_parses() {
        let config = ScanConfig { ignore_code: "401, 403,500".into(), ..Default::default() };
        assert_eq!(config.parsed_ignore_codes().unwrap(), HashSet::from([401, 403, 500]));
    }

    #[test]
    fn invalid_ignore_code_is_config_error() {
        let mut config = ScanConfig { ignore_code: "4xx".into(), ..Default::default() };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn unknown_fetch_using_rejected() {
        let mut config = ScanConfig { fetch_using: Some("bisect".into()), ..Default::default() };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn threads_coerced_to_cap() {
        let mut config = ScanConfig { threads: 64, ..Default::default() };
        config.validate().unwrap();
        assert_eq!(config.threads, MAX_THREADS);
    }

    #[test]
    fn test_filter_limits_techniques() {
        let config = ScanConfig { test_filter: Some("bt".into()), ..Default::default() };
        let set = config.techniques();
        assert!(!set.error);
        assert!(set.boolean);
        assert!(set.time);
    }

    #[test]
    fn metrics_sequence_is_monotonic() {
        let metrics = Metrics::new();
        assert_eq!(metrics.next_request(), 1);
        assert_eq!(metrics.next_request(), 2);
        metrics.note_retry();
        assert_eq!(metrics.snapshot().retries, 1);
    }
}
