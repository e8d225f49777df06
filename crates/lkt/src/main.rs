//! lkt: LKtunnel command-line shell
//!
//! Loads a profile, drives the tunnel session manager and prints its log
//! until interrupted or the tunnel drops. SIGINT, SIGTERM and SIGHUP all
//! lead to an orderly disconnect that clears the system proxy.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Password;
use directories::ProjectDirs;
use lkt_tunnel::{
    ConfigCodec, LogStream, Protocol, ProtocolConfig, SETTINGS_FILE, Settings, StatusProbe,
    TunnelSessionManager,
};
use logfile::{LogFile, LogWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod logfile;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Session log lines are printed directly; their tracing copies are muted
const DEFAULT_FILTER: &str = "info,lkt_tunnel::log=off";

#[derive(Parser)]
#[command(name = "lkt", version, about = "Tunnel session manager")]
struct Cli {
    /// Settings file (default: lktunnel.toml in the config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Session log file (default: log.txt in the local data directory)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect with a profile and stay up until interrupted
    Connect { profile: PathBuf },
    /// Write a passphrase-locked copy of a profile
    Lock { input: PathBuf, output: PathBuf },
    /// Write a plain copy of a profile
    Unlock { input: PathBuf, output: PathBuf },
    /// Print a profile (password redacted)
    Show { profile: PathBuf },
    /// Run a backend's disconnect cleanup (clears a leftover system proxy)
    Disconnect { protocol: Protocol },
    /// Show public and local address and whether a VPN looks active
    Status,
    /// Print the session log file
    Logs {
        /// Empty the log file instead
        #[arg(long)]
        clear: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_deref())?;
    let log_file = cli.log_file.map(LogFile::new).or_else(LogFile::default_location);

    match cli.command {
        Command::Connect { profile } => {
            let config = read_profile(&profile)?;
            runtime()?.block_on(run_connect(settings, config, log_file))
        }
        Command::Lock { input, output } => relock(&input, &output, true),
        Command::Unlock { input, output } => relock(&input, &output, false),
        Command::Show { profile } => {
            let config = read_profile(&profile)?;
            println!("{:#?}", config);
            Ok(())
        }
        Command::Disconnect { protocol } => {
            runtime()?.block_on(run_disconnect(settings, protocol, log_file))
        }
        Command::Status => runtime()?.block_on(run_status(settings)),
        Command::Logs { clear } => show_logs(log_file, clear),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start async runtime")
}

fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    if let Some(path) = explicit {
        return Settings::from_toml_file(path)
            .with_context(|| format!("cannot load settings from {}", path.display()));
    }

    if let Some(dirs) = ProjectDirs::from("", "", "lktunnel") {
        let path = dirs.config_dir().join(SETTINGS_FILE);
        if path.is_file() {
            info!("Using settings from {}", path.display());
            return Settings::from_toml_file(&path)
                .with_context(|| format!("cannot load settings from {}", path.display()));
        }
    }

    debug!("No settings file, using defaults");
    Ok(Settings::default())
}

fn ask_passphrase() -> Option<String> {
    Password::new()
        .with_prompt("Profile passphrase")
        .interact()
        .ok()
}

fn ask_new_passphrase() -> Result<String> {
    Password::new()
        .with_prompt("New passphrase")
        .with_confirmation("Repeat passphrase", "Passphrases do not match")
        .interact()
        .context("passphrase entry failed")
}

fn read_profile(path: &Path) -> Result<ProtocolConfig> {
    ConfigCodec::import_file(path, ask_passphrase)
        .with_context(|| format!("cannot load profile {}", path.display()))
}

fn relock(input: &Path, output: &Path, lock: bool) -> Result<()> {
    let config = read_profile(input)?;
    let passphrase = if lock { Some(ask_new_passphrase()?) } else { None };

    ConfigCodec::export_file(output, &config, passphrase.as_deref())
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!(
        "Wrote {} ({})",
        output.display(),
        if lock { "locked" } else { "plain" }
    );
    Ok(())
}

/// Resolves with the name of the first termination signal received
///
/// Handlers are installed before this returns, so a signal arriving while
/// the tunnel is still coming up is not lost.
#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).context("cannot listen for SIGINT")?;
    let mut terminate = signal(SignalKind::terminate()).context("cannot listen for SIGTERM")?;
    let mut hangup = signal(SignalKind::hangup()).context("cannot listen for SIGHUP")?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        "Ctrl-C"
    })
}

fn open_log(log_file: Option<&LogFile>) -> Option<LogWriter> {
    let log_file = log_file?;
    match log_file.writer() {
        Ok(writer) => Some(writer),
        Err(e) => {
            warn!("Cannot write log file {}: {}", log_file.path().display(), e);
            None
        }
    }
}

/// Print each entry and append it to the log file
async fn print_logs(mut logs: LogStream, mut writer: Option<LogWriter>) {
    while let Some(entry) = logs.recv().await {
        println!("{}", entry);
        let failed = match writer.as_mut() {
            Some(w) => w.append(&entry).err(),
            None => None,
        };
        if let Some(e) = failed {
            warn!("Log file write failed, no longer persisting: {}", e);
            writer = None;
        }
    }
}

async fn run_connect(settings: Settings, config: ProtocolConfig, log_file: Option<LogFile>) -> Result<()> {
    let protocol = config.require_protocol()?;
    let signal = shutdown_signal()?;
    tokio::pin!(signal);

    let (manager, logs) = TunnelSessionManager::system(settings);
    let printer = tokio::spawn(print_logs(logs, open_log(log_file.as_ref())));

    manager.apply_config(&config).await?;
    let mut connected = manager.subscribe_connected();

    if let Err(e) = manager.connect(protocol).await {
        manager.shutdown().await;
        drain(manager, printer).await;
        return Err(e).with_context(|| format!("{} connect failed", protocol));
    }
    info!("{} connected, press Ctrl-C to disconnect", protocol);

    loop {
        tokio::select! {
            name = &mut signal => {
                info!("{} received, disconnecting", name);
                break;
            }
            changed = connected.changed() => {
                if changed.is_err() {
                    break;
                }
                if !*connected.borrow_and_update() {
                    warn!("{} connection lost", protocol);
                    break;
                }
            }
        }
    }

    manager.shutdown().await;
    drain(manager, printer).await;
    Ok(())
}

async fn run_disconnect(settings: Settings, protocol: Protocol, log_file: Option<LogFile>) -> Result<()> {
    let (manager, logs) = TunnelSessionManager::system(settings);
    let printer = tokio::spawn(print_logs(logs, open_log(log_file.as_ref())));
    manager.disconnect(protocol).await;
    drain(manager, printer).await;
    Ok(())
}

async fn run_status(settings: Settings) -> Result<()> {
    let probe = StatusProbe::new(&settings)?;
    println!("{}", probe.check().await);
    Ok(())
}

fn show_logs(log_file: Option<LogFile>, clear: bool) -> Result<()> {
    let log_file = log_file.context("no data directory for the log file; pass --log-file")?;
    if clear {
        log_file
            .clear()
            .with_context(|| format!("cannot clear {}", log_file.path().display()))?;
        println!("Cleared {}", log_file.path().display());
    } else {
        let text = log_file
            .read()
            .with_context(|| format!("cannot read {}", log_file.path().display()))?;
        print!("{}", text);
    }
    Ok(())
}

/// Let the printer flush what is queued once the manager is gone
async fn drain(manager: TunnelSessionManager, printer: tokio::task::JoinHandle<()>) {
    drop(manager);
    if tokio::time::timeout(Duration::from_millis(500), printer)
        .await
        .is_err()
    {
        debug!("Log printer still busy at exit");
    }
}
