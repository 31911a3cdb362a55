use once_cell::sync::Lazy;
use regex::Regex;

use super::{Tamper, TamperContext, TamperOutput};

static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("space pattern"));

/// Replaces runs of whitespace with `/**/`, the classic keyword-splitting
/// filter bypass.
pub struct Space2Comment;

impl Tamper for Space2Comment {
    fn name(&self) -> &'static str {
        "space2comment"
    }

    fn description(&self) -> &'static str {
        "Replaces whitespace with /**/"
    }

    fn priority(&self) -> u8 {
        15
    }

    fn apply(&self, payload: &str, _ctx: &TamperContext) -> Option<TamperOutput> {
        let modified = SPACES.replace_all(payload, "/**/").into_owned();
        if modified == payload {
            return None;
        }
        Some(TamperOutput { payload: modified, confidence: 0.92 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_spaces() {
        let out = Space2Comment.apply("' AND 1=1", &TamperContext::default()).unwrap();
        assert_eq!(out.payload, "'/**/AND/**/1=1");
    }

    #[test]
    fn refuses_spaceless_payload() {
        assert!(Space2Comment.apply("1=1", &TamperContext::default()).is_none());
    }
}
