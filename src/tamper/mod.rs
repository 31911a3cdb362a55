mod charencode;
mod randomcase;
mod space2comment;

pub use charencode::CharEncode;
pub use randomcase::RandomCase;
pub use space2comment::Space2Comment;

use crate::core::error::{EngineError, Result};
use crate::payloads::{Dbms, Technique};

/// Where in the pipeline a tamper participates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TamperStage {
    Detection,
    Injection,
    Extraction,
}

#[derive(Debug, Clone, Default)]
pub struct TamperContext {
    pub dbms: Option<Dbms>,
    pub technique: Option<Technique>,
}

#[derive(Debug, Clone)]
pub struct TamperOutput {
    pub payload: String,
    pub confidence: f64,
}

/// A payload transformer for evasion. Pure and composable; returning `None`
/// refuses the payload and passes it through unchanged.
pub trait Tamper: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn stage(&self) -> TamperStage {
        TamperStage::Injection
    }
    /// Lower runs earlier.
    fn priority(&self) -> u8 {
        50
    }
    fn applies_to(&self) -> &'static [Technique] {
        &[Technique::Error, Technique::Boolean, Technique::Time]
    }
    fn apply(&self, payload: &str, ctx: &TamperContext) -> Option<TamperOutput>;
}

/// Every shipped tamper, unordered.
pub fn all_tampers() -> Vec<Box<dyn Tamper>> {
    vec![
        Box::new(CharEncode),
        Box::new(Space2Comment),
        Box::new(RandomCase),
    ]
}

/// Chain as driven by the `tamper` option: no selection means the identity
/// chain; names (or `all`) opt in, in declared order.
pub fn chain_from_config(
    names: Option<&[String]>,
    stage: TamperStage,
    technique: Option<Technique>,
) -> Result<TamperChain> {
    match names {
        None => Ok(TamperChain::empty()),
        Some(list) => TamperChain::build(stage, technique, Some(list)),
    }
}

#[derive(Debug, Clone)]
pub struct ChainResult {
    pub payload: String,
    pub applied: Vec<String>,
    pub confidence: f64,
}

/// Ordered tamper pipeline for one stage. Output of tamper i feeds tamper
/// i+1; the chain never short-circuits on refusal.
pub struct TamperChain {
    tampers: Vec<Box<dyn Tamper>>,
}

impl TamperChain {
    /// The identity chain.
    pub fn empty() -> Self {
        Self { tampers: Vec::new() }
    }

    /// Build the chain for a stage. With a user selection only those names
    /// are used, in declared order; otherwise tampers matching the technique
    /// are auto-selected and sorted by priority.
    pub fn build(
        stage: TamperStage,
        technique: Option<Technique>,
        user_selected: Option<&[String]>,
    ) -> Result<Self> {
        let available = all_tampers();
        let mut tampers: Vec<Box<dyn Tamper>> = Vec::new();

        match user_selected {
            Some(names) => {
                for name in names {
                    if name.as_str() == "all" {
                        let mut rest: Vec<Box<dyn Tamper>> = all_tampers()
                            .into_iter()
                            .filter(|t| t.stage() == stage)
                            .collect();
                        rest.sort_by_key(|t| t.priority());
                        tampers.extend(rest);
                        break;
                    }
                    let Some(found) = available.iter().find(|t| t.name() == name.as_str()) else {
                        return Err(EngineError::Config(format!("unknown tamper '{}'", name)));
                    };
                    if found.stage() == stage {
                        tampers
                            .extend(all_tampers().into_iter().filter(|t| t.name() == name.as_str()));
                    }
                }
            }
            None => {
                tampers = available
                    .into_iter()
                    .filter(|t| t.stage() == stage)
                    .filter(|t| match technique {
                        Some(tech) => t.applies_to().contains(&tech),
                        None => true,
                    })
                    .collect();
                tampers.sort_by_key(|t| t.priority());
            }
        }

        Ok(Self { tampers })
    }

    pub fn len(&self) -> usize {
        self.tampers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tampers.is_empty()
    }

    pub fn apply(&self, payload: &str, ctx: &TamperContext) -> ChainResult {
        let mut current = payload.to_string();
        let mut applied = Vec::new();
        let mut confidence = 1.0;
        for tamper in &self.tampers {
            if let Some(output) = tamper.apply(&current, ctx) {
                current = output.payload;
                confidence *= output.confidence;
                applied.push(tamper.name().to_string());
            }
        }
        ChainResult { payload: current, applied, confidence }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chain_is_identity() {
        let chain = TamperChain::empty();
        let result = chain.apply("' AND 1=1-- -", &TamperContext::default());
        assert_eq!(result.payload, "' AND 1=1-- -");
        assert!(result.applied.is_empty());
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn auto_chain_orders_by_priority() {
        let chain = TamperChain::build(TamperStage::Injection, Some(Technique::Boolean), None).unwrap();
        let names: Vec<&str> = chain.tampers.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["charencode", "space2comment", "randomcase"]);
    }

    #[test]
    fn user_selection_keeps_declared_order() {
        let picks = vec!["randomcase".to_string(), "space2comment".to_string()];
        let chain = TamperChain::build(TamperStage::Injection, None, Some(picks.as_slice())).unwrap();
        let names: Vec<&str> = chain.tampers.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["randomcase", "space2comment"]);
    }

    #[test]
    fn unknown_tamper_name_is_config_error() {
        let picks = vec!["nosuch".to_string()];
        assert!(matches!(
            TamperChain::build(TamperStage::Injection, None, Some(picks.as_slice())),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn confidence_is_product_and_applied_in_chain_order() {
        let picks = vec!["space2comment".to_string(), "randomcase".to_string()];
        let chain = TamperChain::build(TamperStage::Injection, None, Some(picks.as_slice())).unwrap();
        let result = chain.apply("AND 1=1", &TamperContext::default());
        assert_eq!(result.applied, vec!["space2comment", "randomcase"]);
        assert!((result.confidence - 0.92 * 0.75).abs() < 1e-9);
        assert!(result.payload.contains("/**/"));
    }

    #[test]
    fn detection_stage_has_no_default_tampers() {
        let chain = TamperChain::build(TamperStage::Detection, Some(Technique::Boolean), None).unwrap();
        assert!(chain.is_empty());
    }
}
