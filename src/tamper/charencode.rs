use super::{Tamper, TamperContext, TamperOutput};

/// URL-encodes every character of the payload.
pub struct CharEncode;

impl Tamper for CharEncode {
    fn name(&self) -> &'static str {
        "charencode"
    }

    fn description(&self) -> &'static str {
        "URL-encodes every character in the payload"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn apply(&self, payload: &str, _ctx: &TamperContext) -> Option<TamperOutput> {
        if payload.trim().is_empty() {
            return None;
        }
        let encoded: String = payload
            .bytes()
            .map(|b| format!("%{:02X}", b))
            .collect();
        Some(TamperOutput { payload: encoded, confidence: 0.88 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_every_byte() {
        let out = CharEncode.apply("A=1", &TamperContext::default()).unwrap();
        assert_eq!(out.payload, "%41%3D%31");
    }

    #[test]
    fn refuses_blank_payload() {
        assert!(CharEncode.apply("   ", &TamperContext::default()).is_none());
    }
}
