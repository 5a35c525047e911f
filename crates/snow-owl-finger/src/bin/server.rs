//! Finger Server Binary
//!
//! NIST 800-53: AC-6 (Least Privilege), AU-2 (Audit Events), AU-12 (Audit Generation)
//! STIG: V-222648 (Audit Records)
//!
//! Start as root to bind port 79; the daemon drops to `run_as_user` and
//! re-executes itself before serving anything.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use snow_owl_finger::audit::AuditLogger;
use snow_owl_finger::config::{DEFAULT_CONFIG_PATH, load_config, validate_config, write_config};
use snow_owl_finger::privdrop::hand_over_file;
use snow_owl_finger::{
    AliasStore, DropTarget, FATAL_EXIT_DELAY, FingerConfig, FingerContext, FingerServer,
    ListenSocket, LogFormat, LoggingConfig, PrivilegeSeparation, ReexecHandoff, alias_watcher,
    bind_all, reaper,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "snow-owl-fingerd", version, about = "Finger protocol server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Address to listen on (both families when unset)
    #[arg(long)]
    listen_addr: Option<IpAddr>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Alias file (alias:target per line)
    #[arg(long)]
    alias_file: Option<PathBuf>,

    /// Directory containing one home directory per user
    #[arg(long)]
    homes_dir: Option<PathBuf>,

    /// Identity to run as when started as root (uid:gid or account name)
    #[arg(long)]
    run_as_user: Option<String>,

    /// Write the daemon pid here while running
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Largest file that will be served, in bytes
    #[arg(long)]
    file_size_limit_bytes: Option<u64>,

    /// Time allowed for the client to send its request
    #[arg(long)]
    request_read_timeout_secs: Option<u64>,

    /// Time allowed for each response line or served file
    #[arg(long)]
    request_write_timeout_secs: Option<u64>,

    /// Consult the system account database for accounts at or above this uid
    #[arg(long)]
    min_account_uid: Option<u32>,

    /// Log level filter (e.g. info, debug)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (json or text)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Log file path (stderr when unset)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut FingerConfig) {
        if let Some(addr) = self.listen_addr {
            config.listen_addr = Some(addr);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ref alias_file) = self.alias_file {
            config.alias_file = Some(alias_file.clone());
        }
        if let Some(ref homes_dir) = self.homes_dir {
            config.homes_dir = Some(homes_dir.clone());
        }
        if let Some(ref run_as_user) = self.run_as_user {
            config.run_as_user = Some(run_as_user.clone());
        }
        if let Some(ref pid_file) = self.pid_file {
            config.pid_file = Some(pid_file.clone());
        }
        if let Some(limit) = self.file_size_limit_bytes {
            config.file_size_limit_bytes = limit;
        }
        if let Some(secs) = self.request_read_timeout_secs {
            config.request_read_timeout_secs = secs;
        }
        if let Some(secs) = self.request_write_timeout_secs {
            config.request_write_timeout_secs = secs;
        }
        if let Some(uid) = self.min_account_uid {
            config.min_account_uid = uid;
        }
        if let Some(ref level) = self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        if let Some(ref log_file) = self.log_file {
            config.logging.file = Some(log_file.clone());
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        FingerConfig::default()
    };
    cli.apply_overrides(&mut config);

    if cli.init_config {
        write_config(&cli.config, &config)?;
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.check_config {
        validate_config(&config)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    if let Err(e) = validate_config(&config) {
        eprintln!("{}", e);
        std::thread::sleep(FATAL_EXIT_DELAY);
        return Err(e.into());
    }

    // NIST 800-53 AU-9: Protection of Audit Information
    // NIST 800-53 AU-12: Audit Generation
    let _log_guard = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{:#}", e);
            std::thread::sleep(FATAL_EXIT_DELAY);
            return Err(e);
        }
    };

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        uid = nix::unistd::getuid().as_raw(),
        gid = nix::unistd::getgid().as_raw(),
        pid = std::process::id(),
        "Starting Snow Owl finger server"
    );

    let sockets = startup(&config).map_err(fatal_after_delay)?;

    // Everything from here on runs unprivileged.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building async runtime")?;
    runtime.block_on(serve(config, sockets))
}

/// Obtain listening sockets and, when running as root, hand them to an
/// unprivileged re-exec of ourselves. Only returns when no drop is needed.
///
/// Runs on the main thread before the async runtime exists.
fn startup(config: &FingerConfig) -> Result<Vec<ListenSocket>> {
    let handoff = ReexecHandoff;
    let sockets = match handoff.recover_inherited_sockets()? {
        Some(sockets) => sockets,
        None => bind_all(config)?,
    };

    if nix::unistd::geteuid().is_root() {
        info!("running as root, need to drop privileges");
        let run_as = config
            .run_as_user
            .as_deref()
            .ok_or_else(|| anyhow!("running as root requires run_as_user to drop privileges to"))?;
        let target = DropTarget::parse(run_as)?;
        // The next generation reopens the log file without root.
        if let Some(ref log_file) = config.logging.file {
            hand_over_file(log_file, &target)?;
        }
        // Success replaces the process image.
        let Err(e) = handoff.drop_privileges(&sockets, &target);
        return Err(anyhow::Error::from(e).context("we must drop privileges when running as root"));
    }

    Ok(sockets)
}

fn fatal_after_delay(err: anyhow::Error) -> anyhow::Error {
    error!(event = "fatal_startup_error", error = %format!("{:#}", err), "fatal; sleeping before exit");
    AuditLogger::configuration_error(&format!("{:#}", err));
    std::thread::sleep(FATAL_EXIT_DELAY);
    err
}

async fn serve(config: FingerConfig, sockets: Vec<ListenSocket>) -> Result<()> {
    // Aliases load after the drop and before accepting, so the first
    // connection already sees them. A missing file is fine.
    let aliases = Arc::new(AliasStore::new(config.alias_file.clone()));
    let _alias_watcher = if aliases.path().is_some() {
        aliases.reload();
        alias_watcher::watch(Arc::clone(&aliases))
    } else {
        None
    };

    let pid_file = config.pid_file.as_deref().filter(|path| write_pid_file(path));

    if reaper::is_namespace_init() {
        tokio::spawn(reaper::run());
    }

    let context = FingerContext::from_config(&config, aliases);
    let server = FingerServer::new(context, sockets);
    let result = server.run_until(shutdown_signal()).await;

    if let Some(path) = pid_file
        && let Err(e) = std::fs::remove_file(path)
    {
        warn!(pidfile = %path.display(), "unable to remove pidfile: {}", e);
    }

    result?;
    info!(event = "server_shutdown", "exiting cleanly");
    Ok(())
}

fn write_pid_file(path: &Path) -> bool {
    match std::fs::write(path, format!("{}\n", std::process::id())) {
        Ok(()) => true,
        Err(e) => {
            info!(pidfile = %path.display(), "unable to create pidfile: {}", e);
            false
        }
    }
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> String {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("unable to watch SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("unable to watch SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = terminate => "SIGTERM".to_string(),
        _ = interrupt => "SIGINT".to_string(),
    }
}

fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::new(logging.level.clone());

    let Some(ref log_file) = logging.file else {
        match logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter())
                .with_current_span(true)
                .with_span_list(true)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter()).init(),
        }
        return Ok(None);
    };

    let dir = log_file.parent().unwrap_or_else(|| Path::new("."));
    let file_name = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("logging.file must include a file name"))?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
        .with_context(|| format!("opening log file {}", log_file.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(non_blocking)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(non_blocking)
            .with_ansi(false)
            .init(),
    }
    Ok(Some(guard))
}
