use anyhow::{Context, Result};
use chrono::Local;
use std::fs;
use std::path::PathBuf;

/// Per-host artifact layout: `~/.blindsight/<host>/` holds the session
/// database, a plain-text scan log and the recorded target line. Multi-target
/// runs collect results into `~/.blindsight/output/results-<stamp>.csv`.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub base_dir: PathBuf,
    pub session: PathBuf,
    pub log: PathBuf,
    pub target: PathBuf,
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl SessionPaths {
    /// Resolve and create the artifact directory for a target URL.
    pub fn for_target(url: &str, flush: bool) -> Result<Self> {
        let host = host_of(url);
        let base_dir = home_dir().join(".blindsight").join(host);

        if flush && base_dir.is_dir() {
            tracing::info!("flushing existing session files in {}", base_dir.display());
            fs::remove_dir_all(&base_dir)
                .with_context(|| format!("Failed to flush {}", base_dir.display()))?;
        }
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create {}", base_dir.display()))?;

        let paths = Self {
            session: base_dir.join("session.sqlite"),
            log: base_dir.join("log.txt"),
            target: base_dir.join("target.txt"),
            base_dir,
        };
        if !paths.log.exists() {
            fs::write(&paths.log, "")?;
        }
        Ok(paths)
    }

    /// Record the invocation for later `target.txt` inspection.
    pub fn write_target_line(&self, url: &str, method: &str) -> Result<()> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let line = format!("{} ({}) # blindsight {}\n", url, method, args.join(" "));
        fs::write(&self.target, line)
            .with_context(|| format!("Failed to write {}", self.target.display()))?;
        Ok(())
    }

    /// Append a line to the per-host scan log.
    pub fn log_line(&self, line: &str) -> Result<()> {
        use std::io::Write;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.log)?;
        writeln!(file, "[{}] {}", Local::now().format("%H:%M:%S"), line)?;
        Ok(())
    }
}

/// CSV destination for multi-target runs, stamped like `results-02141540pm.csv`.
pub fn multitarget_csv_path() -> Result<PathBuf> {
    let out_dir = home_dir().join(".blindsight").join("output");
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let stamp = Local::now().format("%m%d%Y_%I%M%P").to_string();
    Ok(out_dir.join(format!("results-{}.csv", stamp)))
}

fn host_of(url: &str) -> String {
    let stripped = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host_port = stripped.split(['/', '?']).next().unwrap_or("unknown");
    let host = host_port.split(':').next().unwrap_or("unknown");
    if host.is_empty() {
        "unknown".to_string()
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("http://example.com/vuln.php?id=1"), "example.com");
        assert_eq!(host_of("https://example.com:8443/a"), "example.com");
        assert_eq!(host_of("http://10.0.0.5"), "10.0.0.5");
    }

    #[test]
    fn csv_path_lands_under_output_with_stamp() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("HOME", dir.path());
        let path = multitarget_csv_path().unwrap();
        assert!(path.parent().unwrap().ends_with(".blindsight/output"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("results-") && name.ends_with(".csv"));
    }
}
