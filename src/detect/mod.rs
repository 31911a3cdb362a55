mod boolean;
mod confirm;
mod error_based;
mod heuristic;
mod time_based;

pub use boolean::BooleanFinding;
pub use error_based::ErrorFinding;
pub use time_based::TimeFinding;

use confirm::confirm_boolean;
use heuristic::heuristic_check;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::ScanConfig;
use crate::core::error::{EngineError, Result};
use crate::http::{Requester, Response, ResponseEnvelope, Target};
use crate::oracle::{BaselineBundle, Case, Criteria, ProbeOracle};
use crate::payloads::{scoped_randnum, Dbms, Technique, Vector};
use crate::session::{InjectionRecord, SessionStore};
use crate::tamper::{chain_from_config, TamperContext, TamperStage};

/// One confirmed payload skeleton plus the metadata that goes into the
/// session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedVector {
    pub vector: Vector,
    pub title: String,
    pub payload: String,
    pub backend: Option<Dbms>,
    pub case: Option<Case>,
}

/// Everything detection learned about one (endpoint, parameter).
#[derive(Debug, Clone)]
pub struct Detection {
    /// Confirmed vectors sorted by technique priority (error first).
    pub vectors: Vec<ConfirmedVector>,
    pub backend: Option<Dbms>,
    pub criteria: Criteria,
    pub baseline: Response,
    /// Sample false-attack response anchoring the boolean oracle.
    pub false_attack: Option<Response>,
}

impl Detection {
    pub fn best_vector(&self) -> &ConfirmedVector {
        self.vectors
            .iter()
            .min_by_key(|v| v.vector.kind.priority())
            .expect("detection holds at least one vector")
    }

    /// Vector of a specific technique, if one confirmed.
    pub fn vector_of(&self, kind: Technique) -> Option<&ConfirmedVector> {
        self.vectors.iter().find(|v| v.vector.kind == kind)
    }

    /// The truth signal to drive inference with: boolean when possible,
    /// otherwise the latency oracle.
    pub fn oracle(&self, timesec: f64) -> Option<ProbeOracle> {
        if let (Some(false_attack), Some(_)) = (&self.false_attack, self.vector_of(Technique::Boolean)) {
            return Some(ProbeOracle::Boolean {
                base: self.baseline.clone(),
                false_sample: false_attack.clone(),
                criteria: self.criteria.clone(),
            });
        }
        self.vector_of(Technique::Time)
            .map(|_| ProbeOracle::Time { threshold: timesec })
    }

    /// The vector matching the chosen oracle.
    pub fn inference_vector(&self) -> Option<&ConfirmedVector> {
        if self.false_attack.is_some() {
            if let Some(v) = self.vector_of(Technique::Boolean) {
                return Some(v);
            }
        }
        self.vector_of(Technique::Time)
            .or_else(|| self.vectors.first())
    }
}

/// Technique selection state for one parameter, spec'd as a tagged variant
/// instead of booleans-per-technique.
#[derive(Debug, Clone)]
pub enum DetectionOutcome {
    NotInjectable,
    Error(Detection),
    Boolean(Detection),
    Time(Detection),
    Multiple(Detection),
}

impl DetectionOutcome {
    pub fn detection(&self) -> Option<&Detection> {
        match self {
            DetectionOutcome::NotInjectable => None,
            DetectionOutcome::Error(d)
            | DetectionOutcome::Boolean(d)
            | DetectionOutcome::Time(d)
            | DetectionOutcome::Multiple(d) => Some(d),
        }
    }

    fn from_detection(detection: Detection) -> Self {
        match detection.vectors.len() {
            0 => DetectionOutcome::NotInjectable,
            1 => match detection.vectors[0].vector.kind {
                Technique::Error => DetectionOutcome::Error(detection),
                Technique::Boolean => DetectionOutcome::Boolean(detection),
                _ => DetectionOutcome::Time(detection),
            },
            _ => DetectionOutcome::Multiple(detection),
        }
    }
}

/// Probe plumbing shared by the technique modules: renders, tampers and
/// sends one payload.
pub(crate) struct ProbeCtx<'a> {
    pub requester: &'a Requester,
    pub target: &'a Target,
    pub config: &'a ScanConfig,
    pub randnum: u32,
}

impl<'a> ProbeCtx<'a> {
    pub async fn send_payload(
        &self,
        payload: &str,
        technique: Technique,
        stage: TamperStage,
        dbms: Option<Dbms>,
    ) -> Result<Response> {
        let names = self.config.tamper_names();
        let ctx = TamperContext { dbms, technique: Some(technique) };
        let staged = chain_from_config(names.as_deref(), stage, Some(technique))?
            .apply(payload, &ctx);
        let wired = chain_from_config(names.as_deref(), TamperStage::Injection, Some(technique))?
            .apply(&staged.payload, &ctx);
        if !wired.applied.is_empty() {
            tracing::debug!(tampers = ?wired.applied, "tamper chain applied");
        }
        self.requester.send(self.target, Some(&wired.payload)).await
    }
}

/// Per-parameter detection state machine:
/// connect, stability, heuristic, technique probes, confirmation, persist.
pub struct DetectionPipeline {
    requester: Arc<Requester>,
    store: Arc<dyn SessionStore>,
    config: Arc<ScanConfig>,
}

impl DetectionPipeline {
    pub fn new(requester: Arc<Requester>, store: Arc<dyn SessionStore>, config: Arc<ScanConfig>) -> Self {
        Self { requester, store, config }
    }

    pub async fn run(&self, target: &Target) -> Result<DetectionOutcome> {
        let param_name = target.parameter.display_name();
        let endpoint = target.endpoint_path();

        // CONNECT
        tracing::info!("testing connection to the target URL");
        let baseline = self.requester.send(target, None).await?;

        // RESUME
        if !self.config.fresh_queries {
            let records = self.store.injections_for_endpoint(&endpoint).await?;
            if let Some(record) = records
                .iter()
                .find(|r| parameter_key_of(&r.parameter).as_deref() == Some(&target.parameter.key))
            {
                tracing::debug!("parameter '{}' already tested, resuming", param_name);
                return Ok(DetectionOutcome::from_detection(self.detection_from_record(
                    record,
                    baseline.clone(),
                )?));
            }
        }

        // STABILITY
        tracing::info!("testing if target URL content is stable");
        let jitter: f64 = rand::thread_rng().gen_range(0.0..0.3);
        tokio::time::sleep(Duration::from_secs_f64(0.5 + jitter)).await;
        let second = self.requester.send(target, None).await?;
        self.requester.check_http_break(&baseline, &second)?;
        let bundle = BaselineBundle::capture(baseline.clone(), second);

        let mut criteria = Criteria {
            code: self.config.code,
            match_string: self.config.string.clone(),
            not_match_string: self.config.not_string.clone(),
            text_only: self.config.text_only,
        };
        if bundle.is_dynamic {
            tracing::warn!("target content is dynamic, switching to text-only comparison");
            criteria.text_only = true;
        } else {
            tracing::info!("target URL content is stable");
        }

        let randnum = scoped_randnum(&format!("{}|{}", endpoint, target.parameter.key));
        let ctx = ProbeCtx {
            requester: &self.requester,
            target,
            config: &self.config,
            randnum,
        };

        // HEURISTIC
        let possible_dbms = heuristic_check(&ctx, &bundle.first).await?;
        match possible_dbms {
            Some(dbms) => tracing::info!(
                "heuristic test shows {} parameter '{}' might be injectable (possible DBMS: '{}')",
                target.parameter.location.label(),
                param_name,
                dbms
            ),
            None => tracing::info!(
                "heuristic test shows {} parameter '{}' might not be injectable",
                target.parameter.location.label(),
                param_name
            ),
        }

        // Technique probes, error > boolean > time
        let techniques = self.config.techniques();
        let mut vectors: Vec<ConfirmedVector> = Vec::new();
        let mut backend = possible_dbms;
        let mut false_attack: Option<Response> = None;

        if techniques.error {
            if let Some(found) = error_based::probe(&ctx, possible_dbms).await? {
                backend = Some(found.dbms);
                vectors.push(ConfirmedVector {
                    vector: found.vector,
                    title: found.title,
                    payload: found.payload,
                    backend: Some(found.dbms),
                    case: None,
                });
            }
        }

        let mut boolean_finding: Option<BooleanFinding> = None;
        if techniques.boolean {
            boolean_finding = boolean::probe(&ctx, &bundle.first, &criteria).await?;
        }

        let mut time_finding: Option<TimeFinding> = None;
        if techniques.time {
            time_finding = time_based::probe(&ctx, backend).await?;
        }

        let has_error = !vectors.is_empty();

        // CONFIRM: error and time self-confirm, boolean needs the
        // algebraic-identity pass unless error already proved the point.
        if let Some(finding) = boolean_finding {
            let confirmed = if has_error {
                true
            } else {
                tracing::info!(
                    "checking if injection point on {} parameter '{}' is a false positive",
                    target.parameter.location.label(),
                    param_name
                );
                confirm_boolean(&ctx, &bundle.first, &criteria, &finding).await?
            };
            if confirmed {
                false_attack = Some(finding.attack_false.clone());
                vectors.push(ConfirmedVector {
                    vector: finding.vector.clone(),
                    title: finding.title.clone(),
                    payload: finding.payload.clone(),
                    backend,
                    case: Some(finding.case),
                });
            } else {
                tracing::warn!("false positive detected, skipping boolean payload");
            }
        }

        if let Some(finding) = time_finding {
            backend = backend.or(Some(finding.dbms));
            vectors.push(ConfirmedVector {
                vector: finding.vector,
                title: finding.title,
                payload: finding.payload,
                backend: Some(finding.dbms),
                case: None,
            });
        }

        if vectors.is_empty() {
            tracing::info!(
                "{} parameter '{}' does not seem injectable",
                target.parameter.location.label(),
                param_name
            );
            return Ok(DetectionOutcome::NotInjectable);
        }

        vectors.sort_by_key(|v| v.vector.kind.priority());
        let detection = Detection {
            vectors,
            backend,
            criteria,
            baseline: bundle.first.clone(),
            false_attack,
        };

        // PERSIST
        self.persist(target, &detection).await?;
        tracing::info!(
            "{} parameter '{}' is vulnerable ({})",
            target.parameter.location.label(),
            param_name,
            detection
                .vectors
                .iter()
                .map(|v| v.vector.kind.label())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(DetectionOutcome::from_detection(detection))
    }

    async fn persist(&self, target: &Target, detection: &Detection) -> Result<()> {
        let best = detection.best_vector();
        let attack01 = detection
            .false_attack
            .as_ref()
            .map(|r| serde_json::to_string(&ResponseEnvelope::from(r)))
            .transpose()?
            .unwrap_or_default();
        let record = InjectionRecord {
            title: best.title.clone(),
            attempts: self.requester.metrics().snapshot().requests as i64,
            payload: best.payload.clone(),
            vector: serde_json::to_string(&detection.vectors)?,
            backend: detection.backend.map(|d| d.name().to_string()).unwrap_or_default(),
            parameter: target.parameter.serialized(),
            injection_type: target.parameter.location.label().to_string(),
            payload_type: best.vector.kind.label().to_string(),
            endpoint: target.endpoint_path(),
            param_type: target.parameter.location.label().to_string(),
            string: detection.criteria.match_string.clone().unwrap_or_default(),
            not_string: detection.criteria.not_match_string.clone().unwrap_or_default(),
            attack01,
            cases: best
                .case
                .map(|c| format!("{:?}", c))
                .unwrap_or_default(),
            timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        self.store.upsert_injection(&record).await
    }

    /// Rebuild a [`Detection`] from a persisted record, skipping every probe.
    fn detection_from_record(&self, record: &InjectionRecord, baseline: Response) -> Result<Detection> {
        let vectors: Vec<ConfirmedVector> = serde_json::from_str(&record.vector)?;
        if vectors.is_empty() {
            return Err(EngineError::OracleAmbiguous(
                "persisted record holds no vectors".into(),
            ));
        }
        let false_attack = if record.attack01.is_empty() {
            None
        } else {
            let envelope: ResponseEnvelope = serde_json::from_str(&record.attack01)?;
            Some(Response::from(envelope))
        };
        let criteria = Criteria {
            code: self.config.code,
            match_string: non_empty(&record.string).or_else(|| self.config.string.clone()),
            not_match_string: non_empty(&record.not_string)
                .or_else(|| self.config.not_string.clone()),
            text_only: self.config.text_only,
        };
        Ok(Detection {
            backend: Dbms::from_name(&record.backend),
            vectors,
            criteria,
            baseline,
            false_attack,
        })
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parameter_key_of(serialized: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(serialized)
        .ok()?
        .get("key")?
        .as_str()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ParamLocation;

    fn confirmed(kind: Technique) -> ConfirmedVector {
        ConfirmedVector {
            vector: Vector::new("'", " AND [INFERENCE]", "-- -", kind),
            title: kind.label().to_string(),
            payload: "x".into(),
            backend: Some(Dbms::MySql),
            case: None,
        }
    }

    fn detection(kinds: &[Technique]) -> Detection {
        Detection {
            vectors: kinds.iter().map(|k| confirmed(*k)).collect(),
            backend: Some(Dbms::MySql),
            criteria: Criteria::default(),
            baseline: Response::new(200, "OK", vec![], "page", 0.1, false),
            false_attack: Some(Response::new(200, "OK", vec![], "other", 0.1, false)),
        }
    }

    #[test]
    fn outcome_variant_tracks_vector_kinds() {
        assert!(matches!(
            DetectionOutcome::from_detection(detection(&[Technique::Boolean])),
            DetectionOutcome::Boolean(_)
        ));
        assert!(matches!(
            DetectionOutcome::from_detection(detection(&[Technique::Error, Technique::Boolean])),
            DetectionOutcome::Multiple(_)
        ));
        assert!(matches!(
            DetectionOutcome::from_detection(detection(&[])),
            DetectionOutcome::NotInjectable
        ));
    }

    #[test]
    fn best_vector_prefers_error() {
        let d = detection(&[Technique::Time, Technique::Error, Technique::Boolean]);
        assert_eq!(d.best_vector().vector.kind, Technique::Error);
    }

    #[test]
    fn oracle_prefers_boolean_over_time() {
        let d = detection(&[Technique::Time, Technique::Boolean]);
        assert!(matches!(d.oracle(5.0), Some(ProbeOracle::Boolean { .. })));
        let mut time_only = detection(&[Technique::Time]);
        time_only.false_attack = None;
        assert!(matches!(time_only.oracle(5.0), Some(ProbeOracle::Time { .. })));
    }

    #[test]
    fn parameter_key_parses_from_serialized_form() {
        let param =
            crate::http::Parameter::new("id", "1", ParamLocation::Get).unwrap();
        assert_eq!(parameter_key_of(&param.serialized()).as_deref(), Some("id"));
    }
}
