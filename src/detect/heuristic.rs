use crate::core::error::Result;
use crate::http::Response;
use crate::payloads::{match_dbms_error, Dbms, Technique, HEURISTIC_BREAKERS};
use crate::tamper::TamperStage;

use super::ProbeCtx;

/// Inject syntactic breakers and scan the responses for DBMS error
/// signatures. A match biases technique order toward error-based; absence
/// proves nothing, boolean or time probing may still succeed.
pub(crate) async fn heuristic_check(
    ctx: &ProbeCtx<'_>,
    _baseline: &Response,
) -> Result<Option<Dbms>> {
    for breaker in HEURISTIC_BREAKERS {
        let response = ctx
            .send_payload(breaker, Technique::Error, TamperStage::Detection, None)
            .await?;
        if let Some(dbms) = match_dbms_error(&response.body) {
            return Ok(Some(dbms));
        }
        // only parse-rejecting endpoints warrant further breakers
        if response.status != 400 {
            break;
        }
    }
    Ok(None)
}
