use crate::core::error::Result;
use crate::payloads::{error_templates, extract_error_value, Dbms, Technique, Vector, BOUNDARIES};
use crate::tamper::TamperStage;

use super::ProbeCtx;

#[derive(Debug, Clone)]
pub struct ErrorFinding {
    /// Prepared skeleton; its template carries the `[INFERENCE]` hole.
    pub vector: Vector,
    pub title: String,
    pub payload: String,
    pub dbms: Dbms,
}

/// For each boundary and error template, inject a numeric sentinel and look
/// for it inside a database error message. Success requires the captured
/// value to be stable across two repeats.
pub(crate) async fn probe(ctx: &ProbeCtx<'_>, possible: Option<Dbms>) -> Result<Option<ErrorFinding>> {
    let candidates: Vec<Dbms> = match possible {
        Some(dbms) => vec![dbms],
        None => Dbms::ALL.to_vec(),
    };
    let sleeptime = ctx.config.timesec as u64;
    let marker = ctx.randnum.to_string();

    for dbms in candidates {
        for boundary in BOUNDARIES {
            for template in error_templates(dbms) {
                let vector =
                    Vector::new(boundary.prefix, template.template, boundary.suffix, Technique::Error);
                let payload = vector.render(&marker, sleeptime, ctx.randnum);
                let response = ctx
                    .send_payload(&payload, Technique::Error, TamperStage::Detection, Some(dbms))
                    .await?;
                if extract_error_value(&response.body).as_deref() != Some(marker.as_str()) {
                    continue;
                }
                // repeat once: the captured group must be stable
                let repeat = ctx
                    .send_payload(&payload, Technique::Error, TamperStage::Detection, Some(dbms))
                    .await?;
                if extract_error_value(&repeat.body).as_deref() == Some(marker.as_str()) {
                    tracing::info!("error-based injection confirmed via {}", template.title);
                    return Ok(Some(ErrorFinding {
                        vector,
                        title: template.title.to_string(),
                        payload,
                        dbms,
                    }));
                }
            }
        }
    }
    Ok(None)
}
