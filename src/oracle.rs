use serde::{Deserialize, Serialize};

use crate::http::Response;

/// Which comparison rule decided the verdict. Lower rank = stronger signal;
/// confirmation weights its checks by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Case {
    UserCode,
    MatchString,
    StatusCode,
    ContentLength,
    TextRatio,
}

impl Case {
    pub fn rank(&self) -> u8 {
        match self {
            Case::UserCode => 0,
            Case::MatchString => 1,
            Case::StatusCode => 2,
            Case::ContentLength => 3,
            Case::TextRatio => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleOutcome {
    Vulnerable(Case),
    NotVulnerable,
    Indeterminate,
}

impl OracleOutcome {
    pub fn is_vulnerable(&self) -> bool {
        matches!(self, OracleOutcome::Vulnerable(_))
    }

    pub fn case(&self) -> Option<Case> {
        match self {
            OracleOutcome::Vulnerable(c) => Some(*c),
            _ => None,
        }
    }
}

/// Comparison criteria for one parameter's lifecycle. User-supplied match
/// rules are authoritative; the automatic ladder runs only when absent.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    pub code: Option<u16>,
    pub match_string: Option<String>,
    pub not_match_string: Option<String>,
    /// Dynamic endpoint: only textual comparison is trustworthy.
    pub text_only: bool,
}

const RATIO_TRUE_MIN: f64 = 0.98;
const RATIO_FALSE_MAX: f64 = 0.95;
const RATIO_LINE_CAP: usize = 400;

/// Decide whether the parameter behaves as a boolean oracle, given the
/// baseline `base` and the expected-true / expected-false attack responses.
///
/// Rule ladder, first hit wins: user code, user match string, status
/// divergence, content-length (disabled under text-only), text similarity.
pub fn compare(base: &Response, truthy: &Response, falsy: &Response, criteria: &Criteria) -> OracleOutcome {
    if let Some(code) = criteria.code {
        if truthy.status == code && falsy.status != code {
            return OracleOutcome::Vulnerable(Case::UserCode);
        }
        return OracleOutcome::NotVulnerable;
    }

    if let Some(needle) = &criteria.match_string {
        if truthy.body.contains(needle.as_str()) && !falsy.body.contains(needle.as_str()) {
            return OracleOutcome::Vulnerable(Case::MatchString);
        }
        return OracleOutcome::NotVulnerable;
    }
    if let Some(needle) = &criteria.not_match_string {
        if !truthy.body.contains(needle.as_str()) && falsy.body.contains(needle.as_str()) {
            return OracleOutcome::Vulnerable(Case::MatchString);
        }
        return OracleOutcome::NotVulnerable;
    }

    if truthy.status == falsy.status && truthy.body == falsy.body {
        return OracleOutcome::Indeterminate;
    }

    if truthy.status == base.status && falsy.status != base.status {
        return OracleOutcome::Vulnerable(Case::StatusCode);
    }

    if !criteria.text_only {
        let true_drift = truthy.content_length.abs_diff(base.content_length);
        let false_drift = falsy.content_length.abs_diff(base.content_length);
        if true_drift == 0 && false_drift > 0 {
            return OracleOutcome::Vulnerable(Case::ContentLength);
        }
    }

    let true_equal = base.filtered_lines() == truthy.filtered_lines();
    let false_equal = base.filtered_lines() == falsy.filtered_lines();
    if true_equal && !false_equal {
        return OracleOutcome::Vulnerable(Case::TextRatio);
    }
    let sim_true = similarity(&base.filtered_body, &truthy.filtered_body);
    let sim_false = similarity(&base.filtered_body, &falsy.filtered_body);
    if sim_true >= RATIO_TRUE_MIN && sim_false < RATIO_FALSE_MAX {
        return OracleOutcome::Vulnerable(Case::TextRatio);
    }

    OracleOutcome::NotVulnerable
}

/// Time oracle: a response is "slow" when it took at least the threshold
/// minus a tolerance of max(0.5s, 10% of the threshold).
pub fn is_slow(response: &Response, threshold: f64) -> bool {
    let tolerance = (threshold * 0.1).max(0.5);
    response.response_time >= threshold - tolerance
}

/// Similarity between two filtered bodies: longest common subsequence over
/// lines divided by the larger line count. 1.0 for two empty bodies.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a_lines: Vec<&str> = a.lines().take(RATIO_LINE_CAP).collect();
    let b_lines: Vec<&str> = b.lines().take(RATIO_LINE_CAP).collect();
    let max_len = a_lines.len().max(b_lines.len());
    if max_len == 0 {
        return 1.0;
    }
    lcs_len(&a_lines, &b_lines) as f64 / max_len as f64
}

fn lcs_len(a: &[&str], b: &[&str]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for line_a in a {
        for (j, line_b) in b.iter().enumerate() {
            curr[j + 1] = if line_a == line_b {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Two consecutive unmodified-parameter responses captured at detection
/// start; characterizes the endpoint's natural variance.
#[derive(Debug, Clone)]
pub struct BaselineBundle {
    pub first: Response,
    pub second: Response,
    pub is_dynamic: bool,
}

impl BaselineBundle {
    pub fn capture(first: Response, second: Response) -> Self {
        let is_dynamic = first.content_length != second.content_length
            || first.filtered_lines() != second.filtered_lines();
        Self { first, second, is_dynamic }
    }
}

/// The truth signal used by the inference engine once a vector is confirmed:
/// either a boolean page-diff oracle anchored to the recorded false-attack
/// sample, or a latency oracle.
#[derive(Debug, Clone)]
pub enum ProbeOracle {
    Boolean { base: Response, false_sample: Response, criteria: Criteria },
    Time { threshold: f64 },
}

impl ProbeOracle {
    pub fn truth(&self, attack: &Response) -> bool {
        match self {
            ProbeOracle::Boolean { base, false_sample, criteria } => {
                compare(base, attack, false_sample, criteria).is_vulnerable()
            }
            ProbeOracle::Time { threshold } => is_slow(attack, *threshold),
        }
    }

    pub fn is_time_based(&self) -> bool {
        matches!(self, ProbeOracle::Time { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(status: u16, body: &str) -> Response {
        Response::new(status, "OK", vec![], body, 0.1, false)
    }

    #[test]
    fn status_divergence_wins() {
        let base = resp(200, "welcome");
        let truthy = resp(200, "welcome");
        let falsy = resp(500, "error");
        assert_eq!(
            compare(&base, &truthy, &falsy, &Criteria::default()),
            OracleOutcome::Vulnerable(Case::StatusCode)
        );
    }

    #[test]
    fn antisymmetric_on_swap() {
        let base = resp(200, "welcome");
        let truthy = resp(200, "welcome");
        let falsy = resp(500, "error");
        let criteria = Criteria::default();
        assert!(compare(&base, &truthy, &falsy, &criteria).is_vulnerable());
        assert!(!compare(&base, &falsy, &truthy, &criteria).is_vulnerable());
    }

    #[test]
    fn content_length_case() {
        let base = resp(200, "row row row");
        let truthy = resp(200, "row row row");
        let falsy = resp(200, "n/a");
        assert_eq!(
            compare(&base, &truthy, &falsy, &Criteria::default()),
            OracleOutcome::Vulnerable(Case::ContentLength)
        );
    }

    #[test]
    fn text_only_disables_content_length() {
        // raw lengths differ only inside a volatile token, so the filtered
        // text is identical on all sides
        let base = resp(200, "alpha\n2024-01-01");
        let truthy = resp(200, "alpha\n2024-01-01");
        let falsy = resp(200, "alpha\n2024-01-01 10:00:00");
        assert_eq!(
            compare(&base, &truthy, &falsy, &Criteria::default()),
            OracleOutcome::Vulnerable(Case::ContentLength)
        );
        let criteria = Criteria { text_only: true, ..Default::default() };
        assert_eq!(compare(&base, &truthy, &falsy, &criteria), OracleOutcome::NotVulnerable);
    }

    #[test]
    fn user_match_string_is_authoritative() {
        let base = resp(200, "hello");
        let truthy = resp(200, "hello admin");
        let falsy = resp(200, "hello guest");
        let criteria = Criteria { match_string: Some("admin".into()), ..Default::default() };
        assert_eq!(
            compare(&base, &truthy, &falsy, &criteria),
            OracleOutcome::Vulnerable(Case::MatchString)
        );
        // present in both sides: decided, not vulnerable, no fall-through
        let falsy2 = resp(500, "hello admin");
        assert_eq!(compare(&base, &truthy, &falsy2, &criteria), OracleOutcome::NotVulnerable);
    }

    #[test]
    fn identical_attack_responses_are_indeterminate() {
        let base = resp(200, "page");
        let truthy = resp(200, "page");
        let falsy = resp(200, "page");
        assert_eq!(compare(&base, &truthy, &falsy, &Criteria::default()), OracleOutcome::Indeterminate);
    }

    #[test]
    fn slow_threshold_has_tolerance() {
        let fast = Response::new(200, "OK", vec![], "", 0.4, false);
        let nearly = Response::new(200, "OK", vec![], "", 4.6, false);
        let slow = Response::new(200, "OK", vec![], "", 5.2, false);
        assert!(!is_slow(&fast, 5.0));
        assert!(is_slow(&nearly, 5.0)); // within max(0.5, 10%) tolerance
        assert!(is_slow(&slow, 5.0));
    }

    #[test]
    fn similarity_is_line_based() {
        let a = "one\ntwo\nthree\nfour";
        let b = "one\ntwo\nthree\nchanged";
        assert!((similarity(a, b) - 0.75).abs() < 1e-9);
        assert!((similarity(a, a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn baseline_bundle_flags_dynamic_content() {
        let first = resp(200, "fixed\nsession 7f3a9b2c4d5e6f1a");
        let second = resp(200, "fixed\nsession 99aa7b2c4d5e6f1b");
        // volatile hex ids are filtered, lengths match: stable
        assert!(!BaselineBundle::capture(first, second).is_dynamic);

        let first = resp(200, "countdown 3\nfixed");
        let second = resp(200, "countdown 2 now\nfixed");
        assert!(BaselineBundle::capture(first, second).is_dynamic);
    }
}
