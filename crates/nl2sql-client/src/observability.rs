use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "nl2sql.logs.jsonl";

/// Where and how much the client logs, read from `NL2SQL_*` variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    pub enabled: bool,
    /// Filter directive; `None` defers to `RUST_LOG`, then `info`.
    pub level: Option<String>,
    /// JSON-lines file; `None` logs compactly to stderr.
    pub json_path: Option<PathBuf>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            enabled: non_empty("NL2SQL_OBSERVABILITY")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(true),
            level: non_empty("NL2SQL_LOG_LEVEL"),
            json_path: non_empty("NL2SQL_JSON_LOG_PATH").map(PathBuf::from),
        }
    }

    fn filter(&self) -> EnvFilter {
        self.level
            .as_deref()
            .and_then(|level| EnvFilter::try_new(level).ok())
            .or_else(|| EnvFilter::try_from_default_env().ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn split_log_path(path: &Path) -> (&Path, &str) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    (dir, file_name)
}

/// Installs the process-wide subscriber from [`LogSettings::from_env`].
///
/// Only the first call in a process has any effect. Console output goes to
/// stderr so command output on stdout stays clean.
pub fn init_observability() {
    INIT.get_or_init(|| install(&LogSettings::from_env()));
}

fn install(settings: &LogSettings) {
    if !settings.enabled {
        return;
    }
    let registry = tracing_subscriber::registry().with(settings.filter());
    match settings.json_path.as_deref() {
        Some(path) => {
            let (dir, file_name) = split_log_path(path);
            let _ = std::fs::create_dir_all(dir);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(tracing_appender::rolling::never(dir, file_name));
            let _ = registry.with(layer).try_init();
        }
        None => {
            let layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = registry.with(layer).try_init();
        }
    }
}
