use once_cell::sync::Lazy;
use regex::Regex;

use super::{Tamper, TamperContext, TamperOutput};

const KEYWORDS: &[&str] = &[
    "SELECT", "UNION", "ALL", "FROM", "WHERE", "AND", "OR", "SLEEP", "BENCHMARK", "WAITFOR",
    "DELAY", "IF", "CASE", "BETWEEN", "NOT", "IN",
];

static WORDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z]+").expect("word pattern"));

/// Mixes the case of SQL keywords. The mixing is positional (alternating),
/// so re-rendering the same payload produces the same bytes.
pub struct RandomCase;

impl Tamper for RandomCase {
    fn name(&self) -> &'static str {
        "randomcase"
    }

    fn description(&self) -> &'static str {
        "Alternates the case of SQL keywords"
    }

    fn priority(&self) -> u8 {
        20
    }

    fn apply(&self, payload: &str, _ctx: &TamperContext) -> Option<TamperOutput> {
        let modified = WORDS
            .replace_all(payload, |caps: &regex::Captures<'_>| {
                let word = &caps[0];
                if KEYWORDS.contains(&word.to_uppercase().as_str()) {
                    mix_case(word)
                } else {
                    word.to_string()
                }
            })
            .into_owned();
        if modified == payload {
            return None;
        }
        Some(TamperOutput { payload: modified, confidence: 0.75 })
    }
}

fn mix_case(word: &str) -> String {
    word.chars()
        .enumerate()
        .map(|(i, c)| {
            if i % 2 == 0 {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_get_mixed_case() {
        let out = RandomCase.apply("' AND SLEEP(5)", &TamperContext::default()).unwrap();
        assert_eq!(out.payload, "' AnD SlEeP(5)");
    }

    #[test]
    fn non_keywords_untouched() {
        assert!(RandomCase.apply("id=admin", &TamperContext::default()).is_none());
    }

    #[test]
    fn deterministic_across_calls() {
        let a = RandomCase.apply("' OR 1=1", &TamperContext::default()).unwrap();
        let b = RandomCase.apply("' OR 1=1", &TamperContext::default()).unwrap();
        assert_eq!(a.payload, b.payload);
    }
}
