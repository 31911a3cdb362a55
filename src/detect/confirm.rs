use crate::core::error::Result;
use crate::http::Response;
use crate::oracle::{compare, Case, Criteria};
use crate::payloads::Technique;
use crate::tamper::TamperStage;

use super::{BooleanFinding, ProbeCtx};

/// Algebraic identity pairs: left evaluates true, right false, on every SQL
/// dialect. Immune to cached pages and sticky WAF rules because no pair
/// repeats the detection probe.
const IDENTITY_PAIRS: &[(&str, &str)] = &[
    ("2*3*8=6*8", "2*3*8=6*9"),
    ("3*2>(1*5)", "3*3<(2*4)"),
    ("3*2*0>=0", "3*3*9<(2*4)"),
    ("5*4=20", "5*4=21"),
    ("3*2*1=6", "3*2*0=6"),
];

/// Re-test a boolean finding with identity probes. Requires at least 80%
/// agreement with the expected truth values; on a slow endpoint (> 8s base
/// latency) three pairs and 70% suffice.
pub(crate) async fn confirm_boolean(
    ctx: &ProbeCtx<'_>,
    base: &Response,
    criteria: &Criteria,
    finding: &BooleanFinding,
) -> Result<bool> {
    let slow_endpoint = base.response_time > 8.0;
    let pairs: &[(&str, &str)] = if slow_endpoint { &IDENTITY_PAIRS[..3] } else { IDENTITY_PAIRS };
    let threshold = if slow_endpoint { 0.7 } else { 0.8 };

    let expected_true_len = finding.attack_true.content_length;
    let expected_false_len = finding.attack_false.content_length;

    let sleeptime = ctx.config.timesec as u64;
    let prepared = finding.vector.prepared();
    let mut agreements = 0usize;

    for (true_expr, false_expr) in pairs {
        let true_payload = prepared.render(true_expr, sleeptime, ctx.randnum);
        let false_payload = prepared.render(false_expr, sleeptime, ctx.randnum);

        let attack_true = ctx
            .send_payload(&true_payload, Technique::Boolean, TamperStage::Detection, None)
            .await?;
        let attack_false = ctx
            .send_payload(&false_payload, Technique::Boolean, TamperStage::Detection, None)
            .await?;

        let outcome = compare(base, &attack_true, &attack_false, criteria);
        if outcome.is_vulnerable() {
            agreements += 2;
        }

        // a content-length-only signal must reproduce the exact observed
        // lengths, otherwise the original hit was page noise
        if finding.case == Case::ContentLength && outcome.case() == Some(Case::ContentLength) {
            if attack_true.content_length != expected_true_len
                || attack_false.content_length != expected_false_len
            {
                tracing::warn!("content-length confirmation drifted, invalidating finding");
                return Ok(false);
            }
        }
    }

    let rate = agreements as f64 / (pairs.len() * 2) as f64;
    tracing::debug!("boolean confirmation agreement: {:.0}%", rate * 100.0);
    Ok(rate >= threshold)
}
