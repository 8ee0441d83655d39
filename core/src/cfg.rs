use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::history::DEFAULT_HISTORY_SIZE;
use crate::job::JobOptions;
use crate::logx::LogFormat;
use crate::process::ProcessConfig;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"overseer"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    pub log_level: String,
    /// Log line format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Executions retained per job.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Seconds between status log lines; 0 disables them.
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    /// Scheduled jobs.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// One `[[jobs]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Unique job name.
    pub name: String,
    /// 5-field cron expression.
    pub schedule: String,
    /// IANA timezone; empty means UTC.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Executable followed by its arguments.
    pub command: Vec<String>,
    /// Working directory for the process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Job-level timeout (ms).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Process-level timeout (ms).
    #[serde(default)]
    pub process_timeout_ms: Option<u64>,
    /// Stored and reported; executions never overlap.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Captured log lines kept in memory.
    #[serde(default)]
    pub log_capacity: Option<usize>,
    /// Regex patterns masked in captured output.
    #[serde(default)]
    pub redact: Vec<String>,
}

fn default_history_size() -> usize { DEFAULT_HISTORY_SIZE }
fn default_status_interval() -> u64 { 60 }
fn default_timezone() -> String { "UTC".to_string() }
fn default_max_concurrent() -> usize { 1 }

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            history_size: default_history_size(),
            status_interval_secs: default_status_interval(),
            jobs: Vec::new(),
        }
    }
}

impl Config {
    /// Reject configs the scheduler could never run.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                bail!("job with schedule {:?} has an empty name", job.schedule);
            }
            if job.command.is_empty() || job.command[0].trim().is_empty() {
                bail!("job {:?} has an empty command", job.name);
            }
            if !seen.insert(job.name.as_str()) {
                bail!("job {:?} is defined more than once", job.name);
            }
        }
        Ok(())
    }
}

impl JobConfig {
    /// Process settings for the executor.
    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            timeout: self.process_timeout_ms.map(Duration::from_millis),
            log_capacity: self.log_capacity,
            redact: self.redact.clone(),
        }
    }

    /// Scheduler options; the executor is left to the scheduler default.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            timeout: self.timeout_ms.map(Duration::from_millis),
            max_concurrent: self.max_concurrent,
            executor: None,
        }
    }
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let pd = ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))?;
    let dir = pd.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let path = config_dir(app)?.join("config.toml");
    if path.exists() {
        load(&path)
    } else {
        let cfg = Config::default();
        save_config(&path, &cfg)?;
        Ok(cfg)
    }
}

/// Load and validate a config file.
pub fn load(path: &Path) -> Result<Config> {
    let txt = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config = toml::from_str(&txt).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate().with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log_level = "debug"
history_size = 20

[[jobs]]
name = "backup"
schedule = "*/5 * * * *"
command = ["/bin/echo", "hi"]
timeout_ms = 1500
process_timeout_ms = 1000
redact = ["secret=\\S+"]

[jobs.env]
MODE = "nightly"
"#;

    #[test]
    fn parses_jobs_with_defaults() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.history_size, 20);
        assert_eq!(cfg.status_interval_secs, 60);
        assert_eq!(cfg.log_format, LogFormat::Text);

        let job = &cfg.jobs[0];
        assert_eq!(job.timezone, "UTC");
        assert_eq!(job.max_concurrent, 1);

        let process = job.process_config();
        assert_eq!(process.command, vec!["/bin/echo", "hi"]);
        assert_eq!(process.timeout, Some(Duration::from_millis(1000)));
        assert_eq!(process.env.get("MODE").map(String::as_str), Some("nightly"));
        assert_eq!(job.job_options().timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn rejects_empty_commands_and_duplicates() {
        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.jobs[0].command.clear();
        assert!(cfg.validate().is_err());

        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.jobs.push(cfg.jobs[0].clone());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_file_and_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        save_config(&path, &Config::default()).unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.jobs.is_empty());

        fs::write(&path, SAMPLE).unwrap();
        assert_eq!(load(&path).unwrap().jobs.len(), 1);
    }
}
