#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use crate::ledger::LedgerStore;
use crate::retry::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};
use crate::ytdlp::{DEFAULT_YT_DLP, YtDlp};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATA_ROOT: &str = "data";
pub const DEFAULT_LEDGER_FILE: &str = "state.json";
pub const DEFAULT_COOKIES_FILE: &str = "cookies.txt";
pub const DEFAULT_PORT: u16 = 8501;
pub const DEFAULT_HOST: &str = "127.0.0.1";

const KEY_DATA_ROOT: &str = "TUBETASK_DATA_ROOT";
const KEY_LEDGER: &str = "TUBETASK_LEDGER";
const KEY_COOKIES: &str = "TUBETASK_COOKIES";
const KEY_YT_DLP: &str = "TUBETASK_YT_DLP";
const KEY_TRANSCRIPT_RETRIES: &str = "TUBETASK_TRANSCRIPT_RETRIES";
const KEY_PORT: &str = "TUBETASK_PORT";
const KEY_HOST: &str = "TUBETASK_HOST";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub data_root: PathBuf,
    pub ledger_path: PathBuf,
    pub cookies_path: PathBuf,
    pub yt_dlp: PathBuf,
    pub transcript_retries: u32,
    pub port: u16,
    pub host: String,
}

impl RuntimeConfig {
    pub fn thumbnails_dir(&self) -> PathBuf {
        self.data_root.join("thumbnails")
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.data_root.join("videos")
    }

    pub fn ledger_store(&self) -> LedgerStore {
        LedgerStore::new(&self.ledger_path)
    }

    /// yt-dlp wrapper carrying the configured cookie jar. Whether the jar is
    /// actually used is decided per download.
    pub fn ytdlp(&self) -> YtDlp {
        YtDlp::new(&self.yt_dlp).with_cookies(&self.cookies_path)
    }

    pub fn transcript_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_attempts(self.transcript_retries)
    }
}

/// Values given on the command line; they win over every other source.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub ledger_path: Option<PathBuf>,
    pub cookies_path: Option<PathBuf>,
    pub yt_dlp: Option<PathBuf>,
    pub transcript_retries: Option<u32>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

/// Overrides, then the process environment, then the `.env` file, then
/// defaults.
pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_config(&file_vars, env_var_string, overrides))
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeConfig {
    let lookup = |key: &str| env_lookup(key).or_else(|| non_blank(file_vars.get(key).cloned()));
    let path_setting = |over: Option<PathBuf>, key: &str| {
        over.filter(|path| !path.as_os_str().is_empty())
            .or_else(|| lookup(key).map(PathBuf::from))
    };

    let data_root = path_setting(overrides.data_root, KEY_DATA_ROOT)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));
    let ledger_path = path_setting(overrides.ledger_path, KEY_LEDGER)
        .unwrap_or_else(|| data_root.join(DEFAULT_LEDGER_FILE));
    let cookies_path = path_setting(overrides.cookies_path, KEY_COOKIES)
        .unwrap_or_else(|| data_root.join(DEFAULT_COOKIES_FILE));
    let yt_dlp = path_setting(overrides.yt_dlp, KEY_YT_DLP)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP));

    let transcript_retries = overrides
        .transcript_retries
        .or_else(|| lookup(KEY_TRANSCRIPT_RETRIES).and_then(|value| value.parse().ok()))
        .filter(|attempts| *attempts > 0)
        .unwrap_or(DEFAULT_MAX_ATTEMPTS);
    let port = overrides
        .port
        .or_else(|| lookup(KEY_PORT).and_then(|value| value.parse().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = non_blank(overrides.host)
        .or_else(|| lookup(KEY_HOST))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    RuntimeConfig {
        data_root,
        ledger_path,
        cookies_path,
        yt_dlp,
        transcript_retries,
        port,
        host,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

/// Parses `KEY=value` lines. `export` prefixes, comments and matching
/// single/double quotes are handled; anything else is skipped. A missing
/// file yields no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    Ok(parse_env(&content))
}

fn parse_env(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, raw) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(raw.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> RuntimeConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None, RuntimeOverrides::default())
    }

    #[test]
    fn defaults_hang_off_data_root() {
        let config = config_from("");
        assert_eq!(config.data_root, PathBuf::from("data"));
        assert_eq!(config.ledger_path, PathBuf::from("data/state.json"));
        assert_eq!(config.cookies_path, PathBuf::from("data/cookies.txt"));
        assert_eq!(config.yt_dlp, PathBuf::from("yt-dlp"));
        assert_eq!(config.transcript_retries, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.thumbnails_dir(), PathBuf::from("data/thumbnails"));
    }

    #[test]
    fn file_values_are_read() {
        let config = config_from(
            "TUBETASK_DATA_ROOT=\"/srv/tube\"\nTUBETASK_PORT=\"4242\"\nTUBETASK_TRANSCRIPT_RETRIES=2\n",
        );
        assert_eq!(config.data_root, PathBuf::from("/srv/tube"));
        assert_eq!(config.ledger_path, PathBuf::from("/srv/tube/state.json"));
        assert_eq!(config.port, 4242);
        assert_eq!(config.transcript_retries, 2);
        assert_eq!(config.transcript_policy().max_attempts, 2);
    }

    #[test]
    fn explicit_ledger_path_is_not_derived() {
        let config = config_from("TUBETASK_DATA_ROOT=/a\nTUBETASK_LEDGER=/b/ledger.json\n");
        assert_eq!(config.ledger_path, PathBuf::from("/b/ledger.json"));
        assert_eq!(config.ledger_store().path(), Path::new("/b/ledger.json"));
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = config_from("TUBETASK_PORT=nope\nTUBETASK_TRANSCRIPT_RETRIES=0\n");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.transcript_retries, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn env_beats_file() {
        let vars = read_env_file(make_config("TUBETASK_DATA_ROOT=\"/file\"\n").path()).unwrap();
        let config = build_runtime_config(
            &vars,
            |key| (key == KEY_DATA_ROOT).then(|| "/env".to_string()),
            RuntimeOverrides::default(),
        );
        assert_eq!(config.data_root, PathBuf::from("/env"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export TUBETASK_DATA_ROOT="/media"
            TUBETASK_YT_DLP='/opt/yt-dlp'
            TUBETASK_HOST =  "0.0.0.0"
            TUBETASK_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("TUBETASK_DATA_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("TUBETASK_YT_DLP").unwrap(), "/opt/yt-dlp");
        assert_eq!(vars.get("TUBETASK_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("TUBETASK_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert(KEY_DATA_ROOT.to_string(), "/file-data".to_string());
        vars.insert(KEY_HOST.to_string(), "file-host".to_string());
        vars.insert(KEY_PORT.to_string(), "7000".to_string());

        let overrides = RuntimeOverrides {
            data_root: Some(PathBuf::from("/override-data")),
            port: Some(9000),
            host: Some("override-host".into()),
            ..RuntimeOverrides::default()
        };

        let config = build_runtime_config(
            &vars,
            |key| match key {
                KEY_YT_DLP => Some("/env/yt-dlp".to_string()),
                KEY_PORT => Some("8000".to_string()),
                _ => None,
            },
            overrides,
        );

        assert_eq!(config.data_root, PathBuf::from("/override-data"));
        assert_eq!(config.yt_dlp, PathBuf::from("/env/yt-dlp"));
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "override-host");
    }

    #[test]
    fn blank_values_are_ignored() {
        let vars = read_env_file(make_config("TUBETASK_HOST=\"  \"\n").path()).unwrap();
        let config = build_runtime_config(
            &vars,
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(config.host, DEFAULT_HOST);
    }
}
