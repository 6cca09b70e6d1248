use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use eyre::{Context, Result, eyre};
use remote_chat_backup::{
    ChangeStreamMonitor, Credential, ExportLayout, MonitorConfig, MonitorEvent, PlatformMount,
    PollOptions, SkypeDb, StreamKind,
};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Back up a chat database living on a remote network share to local CSV files.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Remote computer name (without leading backslashes).
    #[arg(value_name = "HOST")]
    host: Option<String>,

    /// Share-relative directory holding the database, e.g. `Users/alice/AppData/Roaming/Skype/alice`.
    #[arg(value_name = "SOURCE_PATH")]
    source_path: Option<String>,

    /// Directory to append CSV exports to.
    /// Defaults to ./chat-backup if not set in config.
    #[arg(long, value_name = "DIR")]
    target_dir: Option<PathBuf>,

    /// Database file name inside SOURCE_PATH. Defaults to main.db.
    #[arg(long, value_name = "NAME")]
    file_name: Option<String>,

    /// Base name for export files. Defaults to the database file name.
    #[arg(long, value_name = "NAME")]
    base_name: Option<String>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/remote-chat-backup/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Account used to mount the share, `user` or `domain\user`.
    /// Without one the platform may prompt for credentials.
    #[arg(long, value_name = "USER")]
    user: Option<String>,

    /// Domain or computer name qualifying --user.
    #[arg(long, value_name = "DOMAIN")]
    domain: Option<String>,

    /// Password for --user.
    #[arg(long, env = "REMOTE_CHAT_BACKUP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Append conversations and messages to a single `.conversations` file.
    #[arg(long)]
    combined: bool,

    /// How often to poll the remote database for new rows.
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Export rows that already exist, not only ones created while running.
    #[arg(long)]
    from_beginning: bool,

    /// Log every lifecycle step.
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors, and skip the summary.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    host: Option<String>,
    source_path: Option<String>,
    file_name: Option<String>,
    target_dir: Option<PathBuf>,
    base_name: Option<String>,
    user: Option<String>,
    domain: Option<String>,
    password: Option<String>,
    layout: Option<ExportLayout>,
    poll_interval_ms: Option<u64>,
    from_beginning: Option<bool>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("remote-chat-backup/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let default_level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn credential(
    user: Option<String>,
    domain: Option<String>,
    password: Option<String>,
) -> Result<Option<Credential>> {
    match (user, password) {
        (None, None) => Ok(None),
        (Some(user), Some(password)) => Ok(Some(match domain {
            Some(domain) => Credential::qualified(&domain, &user, password),
            None => Credential::new(user, password),
        })),
        (Some(_), None) => Err(eyre!("--user requires a password")),
        (None, Some(_)) => Err(eyre!("A password was given without --user")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve the remote source (CLI > Config)
    let host = cli
        .host
        .or(file_cfg.host)
        .ok_or_else(|| eyre!("No remote host given. Pass HOST or set host in config.toml."))?;
    let source_path = cli.source_path.or(file_cfg.source_path).ok_or_else(|| {
        eyre!("No source path given. Pass SOURCE_PATH or set source_path in config.toml.")
    })?;
    let file_name = cli
        .file_name
        .or(file_cfg.file_name)
        .unwrap_or_else(|| "main.db".to_string());

    // 3. Resolve export placement (CLI > Config > Default)
    let target_dir = cli
        .target_dir
        .or(file_cfg.target_dir)
        .unwrap_or_else(|| PathBuf::from("chat-backup"));
    let layout = if cli.combined {
        ExportLayout::Combined
    } else {
        file_cfg.layout.unwrap_or_default()
    };

    // 4. Resolve credentials and polling
    let credential = credential(
        cli.user.or(file_cfg.user),
        cli.domain.or(file_cfg.domain),
        cli.password.or(file_cfg.password),
    )?;
    let poll = PollOptions {
        interval: Duration::from_millis(
            cli.poll_interval_ms
                .or(file_cfg.poll_interval_ms)
                .unwrap_or(2000),
        ),
        from_beginning: cli.from_beginning || file_cfg.from_beginning.unwrap_or(false),
    };

    let mut config = MonitorConfig::new(host, source_path, file_name, target_dir).with_layout(layout);
    if let Some(base_name) = cli.base_name.or(file_cfg.base_name) {
        config = config.with_base_name(base_name);
    }
    if let Some(credential) = credential {
        config = config.with_credential(credential);
    }

    // 5. Run until interrupted or a stream gives out
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .wrap_err("Failed to install signal handler")?;
    }

    let mut monitor = ChangeStreamMonitor::new(config, SkypeDb::new(poll), PlatformMount::default())
        .wrap_err("Invalid monitor configuration")?;
    monitor.start().wrap_err("Failed to start monitor")?;

    let outcome = watch(&monitor.events(), &shutdown);
    monitor.stop().wrap_err("Failed to release remote share")?;

    if !cli.quiet {
        for kind in [StreamKind::Conversations, StreamKind::Messages] {
            let stats = monitor.stats(kind);
            eprintln!(
                "Done ({kind}). {} appended, {} skipped. Errors: {}",
                stats.appended(),
                stats.skipped(),
                stats.failed(),
            );
        }
    }

    outcome
}

fn watch(
    events: &crossbeam_channel::Receiver<MonitorEvent>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut completed = 0;
    while !shutdown.load(Ordering::Relaxed) {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(MonitorEvent::StreamFailed { stream, error }) => {
                return Err(eyre::Report::new(error).wrap_err(format!("The {stream} stream failed")));
            }
            Ok(MonitorEvent::StreamCompleted { .. }) => {
                completed += 1;
                if completed == 2 {
                    return Ok(());
                }
            }
            // Already logged by the monitor; keep going.
            Ok(MonitorEvent::ExportFailed { .. }) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
    Ok(())
}
