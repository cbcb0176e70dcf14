use std::{
    collections::BTreeMap,
    env,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::allproxy_core::{FilterRule, MessageView};
use crate::allproxy_logs::LineLogImporter;
use crate::allproxy_queue::DEFAULT_QUEUE_LIMIT;
use crate::allproxy_snapshots::SNAPSHOT_EXTENSION;
use crate::allproxy_storage::DirStore;
use crate::session::{IngestOutcome, Session, SessionConfig};
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_NAME: &str = "allproxy.json";
const DEFAULT_DATA_DIR: &str = ".allproxy";

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "allproxy", version, about = "Capture, filter and snapshot traffic and log streams")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    queue_limit: Option<usize>,
    #[arg(long)]
    filter: Option<String>,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    match_case: bool,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    regex: bool,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    logical: bool,
    /// Snapshot file (`.allproxy` JSON or plain log text) to import.
    #[arg(long)]
    import: Option<PathBuf>,
    /// Read log lines from stdin into the live queue until EOF or Ctrl-C.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    follow: bool,
    /// Write the selected snapshot to this file.
    #[arg(long)]
    export: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct Config {
    data_dir: Option<PathBuf>,
    queue_limit: usize,
    match_case: bool,
    regex: bool,
    logical: bool,
    filter: Option<String>,
}

/// One configuration layer. `allproxy.json` deserializes straight into it;
/// environment variables and flags are mapped onto it.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PartialConfig {
    #[serde(alias = "data_dir")]
    data_dir: Option<PathBuf>,
    #[serde(alias = "queue_limit", alias = "messageQueueLimit")]
    queue_limit: Option<usize>,
    #[serde(alias = "match_case")]
    match_case: Option<bool>,
    regex: Option<bool>,
    logical: Option<bool>,
    filter: Option<String>,
}

impl PartialConfig {
    /// Layer `over` on top of `self`; set values in `over` win.
    fn merge(self, over: PartialConfig) -> PartialConfig {
        PartialConfig {
            data_dir: over.data_dir.or(self.data_dir),
            queue_limit: over.queue_limit.or(self.queue_limit),
            match_case: over.match_case.or(self.match_case),
            regex: over.regex.or(self.regex),
            logical: over.logical.or(self.logical),
            filter: over.filter.or(self.filter),
        }
    }
}

impl Config {
    fn from_partial(partial: PartialConfig) -> Self {
        Self {
            data_dir: partial.data_dir,
            queue_limit: partial.queue_limit.unwrap_or(DEFAULT_QUEUE_LIMIT),
            match_case: partial.match_case.unwrap_or(false),
            regex: partial.regex.unwrap_or(false),
            logical: partial.logical.unwrap_or(false),
            filter: partial.filter,
        }
    }

    fn session_config(&self) -> SessionConfig {
        let expression = self.filter.clone().unwrap_or_default();
        SessionConfig {
            queue_limit: self.queue_limit,
            search: FilterRule::with_flags(expression, self.match_case, self.regex, self.logical),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile { path: PathBuf, source: serde_json::Error },
    #[error("config file not found: {path}")]
    MissingConfig { path: PathBuf },
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

fn cli_overrides(cli: &Cli) -> PartialConfig {
    PartialConfig {
        data_dir: cli.data_dir.clone(),
        queue_limit: cli.queue_limit,
        match_case: cli.match_case.then_some(true),
        regex: cli.regex.then_some(true),
        logical: cli.logical.then_some(true),
        filter: cli.filter.clone(),
    }
}

/// Parse `ALLPROXY_<name>` when it is set; a value `parse` rejects is an error.
fn env_value<T>(
    env: &BTreeMap<String, String>,
    name: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    let key = format!("ALLPROXY_{name}");
    env.get(&key)
        .map(|value| {
            parse(value.trim()).ok_or_else(|| ConfigError::InvalidEnv { name: key.clone(), value: value.clone() })
        })
        .transpose()
}

fn env_overrides(env: &BTreeMap<String, String>) -> Result<PartialConfig, ConfigError> {
    Ok(PartialConfig {
        data_dir: env_value(env, "DATA_DIR", |value| Some(PathBuf::from(value)))?
            .filter(|dir| !dir.as_os_str().is_empty()),
        queue_limit: env_value(env, "QUEUE_LIMIT", parse_limit)?,
        match_case: env_value(env, "MATCH_CASE", parse_bool)?,
        regex: env_value(env, "REGEX", parse_bool)?,
        logical: env_value(env, "LOGICAL", parse_bool)?,
        filter: env.get("ALLPROXY_FILTER").cloned(),
    })
}

fn parse_limit(value: &str) -> Option<usize> {
    value.parse::<usize>().ok().filter(|limit| *limit > 0)
}

fn parse_bool(value: &str) -> Option<bool> {
    const TRUE: [&str; 4] = ["1", "true", "yes", "on"];
    const FALSE: [&str; 4] = ["0", "false", "no", "off"];
    if TRUE.iter().any(|word| value.eq_ignore_ascii_case(word)) {
        Some(true)
    } else if FALSE.iter().any(|word| value.eq_ignore_ascii_case(word)) {
        Some(false)
    } else {
        None
    }
}

fn load_config_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    serde_json::from_str(&contents)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

/// Nearest `allproxy.json` in `start` or one of its ancestors.
fn find_config_path(start: &Path) -> Option<PathBuf> {
    start.ancestors().map(|dir| dir.join(CONFIG_FILE_NAME)).find(|candidate| candidate.is_file())
}

/// Config file, then `ALLPROXY_*` environment, then flags.
fn resolve_config(
    cli: &Cli,
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> Result<(Config, Option<PathBuf>), ConfigError> {
    let config_path = match &cli.config {
        Some(path) if !path.is_file() => {
            return Err(ConfigError::MissingConfig { path: path.clone() });
        }
        Some(path) => Some(path.clone()),
        None => find_config_path(cwd),
    };

    let file = config_path.as_deref().map(load_config_file).transpose()?.unwrap_or_default();
    let layers = [file, env_overrides(env)?, cli_overrides(cli)];
    let partial = layers.into_iter().fold(PartialConfig::default(), PartialConfig::merge);
    Ok((Config::from_partial(partial), config_path))
}

fn data_dir(config: &Config, cwd: &Path, config_path: Option<&PathBuf>) -> PathBuf {
    let root = config_path.and_then(|path| path.parent()).unwrap_or(cwd);
    match &config.data_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => root.join(dir),
        None => root.join(DEFAULT_DATA_DIR),
    }
}

fn import_file(session: &Session, path: &Path) -> Result<String, DynError> {
    let bytes = std::fs::read(path)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let name = session.import_snapshot(&bytes, &file_name)?;
    info!(path = %path.display(), snapshot = %name, "imported snapshot");
    Ok(name)
}

fn export_file(session: &Session, name: &str, path: &Path) -> Result<(), DynError> {
    let bytes = session.export_snapshot(name)?;
    let path = if path.extension().is_none() {
        path.with_file_name(format!(
            "{}{SNAPSHOT_EXTENSION}",
            path.file_name().map(|name| name.to_string_lossy()).unwrap_or_default()
        ))
    } else {
        path.to_path_buf()
    };
    std::fs::write(&path, bytes)?;
    info!(path = %path.display(), snapshot = name, "exported snapshot");
    Ok(())
}

fn format_row(view: &MessageView) -> String {
    match view.log_entry() {
        Some(entry) if !entry.is_empty() => format!(
            "{:>6} {:<8} {:<5} {:<16} {}",
            view.sequence_number(),
            entry.date,
            entry.level,
            entry.category,
            if entry.message.is_empty() { view.title() } else { entry.message.as_str() }
        ),
        _ => format!("{:>6} {:<8} {}", view.sequence_number(), view.protocol().as_str(), view.title()),
    }
}

fn print_rows(out: &mut impl Write, views: &[MessageView]) -> std::io::Result<()> {
    for view in views {
        writeln!(out, "{}", format_row(view))?;
    }
    Ok(())
}

async fn follow_stdin(session: &Session) -> Result<usize, DynError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut sequence_number = 0u64;
    let mut captured = 0usize;
    loop {
        let line = tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted, stopping capture");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = LineLogImporter::parse_line(sequence_number, &line);
        match session.ingest(message)? {
            IngestOutcome::Captured => captured += 1,
            IngestOutcome::Held { breakpoint } => {
                warn!(sequence_number, breakpoint, "breakpoint hit, message held");
            }
            IngestOutcome::Dropped { .. } | IngestOutcome::Paused => {}
        }
        sequence_number += 1;
    }
    Ok(captured)
}

pub async fn run() -> Result<(), DynError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cwd = env::current_dir()?;
    let env_map: BTreeMap<String, String> = env::vars().collect();
    let (config, config_path) = resolve_config(&cli, &cwd, &env_map)?;

    if let Some(path) = &config_path {
        info!(path = %path.display(), "loaded config file");
    }
    let data_dir = data_dir(&config, &cwd, config_path.as_ref());
    info!(
        data_dir = %data_dir.display(),
        queue_limit = config.queue_limit,
        match_case = config.match_case,
        regex = config.regex,
        logical = config.logical,
        filter = ?config.filter,
        "resolved config"
    );

    let store = Arc::new(DirStore::new(&data_dir)?);
    let session = Session::new(config.session_config(), store);
    session.init()?;

    let search = session.search()?;
    if search.is_invalid() {
        warn!(error = ?search.error(), expression = search.expression(), "filter is invalid and matches nothing");
    }

    if let Some(path) = &cli.import {
        import_file(&session, path)?;
    }

    if cli.follow {
        let captured = follow_stdin(&session).await?;
        let name = session.take_snapshot()?;
        info!(captured, snapshot = %name, "follow finished");
    }

    let selected = session.selected_snapshot()?;
    let visible = session.visible(&selected)?;
    let stdout = std::io::stdout();
    print_rows(&mut stdout.lock(), &visible)?;

    if let Some(path) = &cli.export {
        export_file(&session, &selected, path)?;
    }

    Ok(())
}
