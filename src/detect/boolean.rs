use crate::core::error::Result;
use crate::http::Response;
use crate::oracle::{compare, Case, Criteria};
use crate::payloads::{Technique, Vector, BOOLEAN_TEMPLATES, BOUNDARIES};
use crate::tamper::TamperStage;

use super::ProbeCtx;

#[derive(Debug, Clone)]
pub struct BooleanFinding {
    /// Skeleton still carrying the `[RANDNUM]=[RANDNUM]` condition marker.
    pub vector: Vector,
    pub title: String,
    pub payload: String,
    pub case: Case,
    pub attack_true: Response,
    pub attack_false: Response,
}

/// Inject a true/false pair per (boundary, template) and let the response
/// oracle judge. Within one boundary every template is tried and the
/// strongest case wins: status > length > similarity.
pub(crate) async fn probe(
    ctx: &ProbeCtx<'_>,
    base: &Response,
    criteria: &Criteria,
) -> Result<Option<BooleanFinding>> {
    let sleeptime = ctx.config.timesec as u64;
    let n = ctx.randnum;
    let true_cond = format!("{}={}", n, n);
    let false_cond = format!("{}={}", n, n + 1);

    for boundary in BOUNDARIES {
        let mut hits: Vec<BooleanFinding> = Vec::new();
        for template in BOOLEAN_TEMPLATES {
            let vector = Vector::new(boundary.prefix, *template, boundary.suffix, Technique::Boolean);
            let prepared = vector.prepared();
            let true_payload = prepared.render(&true_cond, sleeptime, n);
            let false_payload = prepared.render(&false_cond, sleeptime, n);

            let attack_true = ctx
                .send_payload(&true_payload, Technique::Boolean, TamperStage::Detection, None)
                .await?;
            let attack_false = ctx
                .send_payload(&false_payload, Technique::Boolean, TamperStage::Detection, None)
                .await?;

            let outcome = compare(base, &attack_true, &attack_false, criteria);
            if let Some(case) = outcome.case() {
                let title = if template.trim_start().starts_with("OR") {
                    "OR boolean-based blind - WHERE or HAVING clause"
                } else {
                    "AND boolean-based blind - WHERE or HAVING clause"
                };
                hits.push(BooleanFinding {
                    vector: vector.clone(),
                    title: title.to_string(),
                    payload: true_payload.clone(),
                    case,
                    attack_true,
                    attack_false,
                });
            }
        }
        if let Some(best) = hits.into_iter().min_by_key(|f| f.case.rank()) {
            tracing::info!(
                "boolean-based injection found (boundary '{}'/'{}', case {:?})",
                boundary.prefix,
                boundary.suffix,
                best.case
            );
            return Ok(Some(best));
        }
    }
    Ok(None)
}
