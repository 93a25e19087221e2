//! Command-line interface and run orchestration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gmail-imap-transfer")]
#[command(version = "0.1.0")]
#[command(about = "Resumable Gmail-to-IMAP mail migration", long_about = None)]
pub struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full transfer
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Don't append anything, just report what would happen
        #[arg(long)]
        dry_run: bool,
    },

    /// Run (or re-run) the OAuth installed-app flow and cache the token
    Auth {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Force re-authentication even if a cached token exists
        #[arg(long)]
        force: bool,
    },

    /// Print label -> folder mapping coverage and exit without transferring
    VerifyLabels {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Print the current progress record without transferring
    Status {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Write an example configuration file
    InitConfig {
        /// Path to create the config file at
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap()
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap()
            .progress_chars("##-");

        Self {
            multi: MultiProgress::new(),
            spinner_style,
            bar_style,
        }
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        println!("  ✓ {}", msg);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

use crate::auth;
use crate::config::Config;
use crate::error::{Result, TransferError};
use crate::folder_mapper::build_folder_mappings;
use crate::gmail_source::{GmailSource, MailSource};
use crate::imap_sink::{ImapConnectionSettings, ImapSink};
use crate::progress_store::ProgressStore;
use crate::transfer_engine::{CancellationHandle, TransferEngine};
use std::path::Path;
use std::sync::Arc;

async fn build_gmail_source(config: &Config) -> Result<GmailSource> {
    let hub = auth::initialize_gmail_hub(
        Path::new(&config.gmail.credentials_file),
        Path::new(&config.gmail.token_cache_file),
    )
    .await?;
    Ok(GmailSource::new(hub))
}

fn imap_settings(config: &Config) -> ImapConnectionSettings {
    ImapConnectionSettings {
        host: config.imap.server.clone(),
        port: config.imap.port,
        use_tls: config.imap.use_ssl,
        username: config.imap.username.clone(),
        password: config.imap.password.clone(),
    }
}

/// Run the full transfer: authenticate, build the label -> folder mapping,
/// and drive the transfer engine over every non-system label.
pub async fn run_transfer(config_path: &Path, dry_run: bool) -> Result<()> {
    let reporter = ProgressReporter::new();

    let config_spinner = reporter.add_spinner("Loading configuration...");
    let config = Config::load(config_path).await?;
    config.validate()?;
    reporter.finish_spinner(&config_spinner, &format!("Configuration loaded from {:?}", config_path));

    let auth_spinner = reporter.add_spinner("Authenticating with Gmail...");
    let gmail: Arc<dyn MailSource> = Arc::new(build_gmail_source(&config).await?);
    reporter.finish_spinner(&auth_spinner, "Gmail authenticated");

    let labels_spinner = reporter.add_spinner("Listing Gmail labels...");
    let labels = gmail.list_labels().await?;
    let mappings = build_folder_mappings(&labels, &config.settings.label_mappings);
    reporter.finish_spinner(
        &labels_spinner,
        &format!("{} labels mapped to {} folders", labels.len(), mappings.len()),
    );

    if dry_run {
        println!("\nDry run: the following folders would be created/used:");
        for mapping in &mappings {
            println!("  {} -> {}", mapping.label_name, mapping.folder_name);
        }
        println!("\nNo messages were transferred (--dry-run).");
        return Ok(());
    }

    let progress_spinner = reporter.add_spinner("Loading progress state...");
    let progress = ProgressStore::load(Path::new(&config.settings.progress_file)).await?;
    reporter.finish_spinner(&progress_spinner, "Progress state loaded");

    let imap_spinner = reporter.add_spinner("Connecting to IMAP server...");
    let mut imap = ImapSink::new(imap_settings(&config));
    imap.connect().await?;
    reporter.finish_spinner(&imap_spinner, "IMAP connected");

    let cancellation = CancellationHandle::new();
    install_signal_handler(cancellation.clone());

    let mut engine = TransferEngine::new(
        Arc::clone(&gmail),
        Box::new(imap),
        progress,
        config.settings.batch_size,
        config.settings.progress_save_interval,
        cancellation,
    );

    let transfer_spinner = reporter.add_spinner(&format!("Transferring {} labels...", mappings.len()));
    engine.run(&mappings).await?;
    reporter.finish_spinner(&transfer_spinner, "Transfer complete");

    let stats = engine.cache_stats();
    println!(
        "\nCache hit rate: {:.1}% ({} hits, {} misses, ~{} API calls saved)",
        stats.hit_rate() * 100.0,
        stats.cache_hits,
        stats.cache_misses,
        stats.api_calls_saved(config.settings.gmail_batch_size as u64)
    );

    Ok(())
}

/// Run (or re-run) the OAuth installed-app flow, caching the resulting token.
pub async fn run_auth(config_path: &Path, force: bool) -> Result<()> {
    let config = Config::load(config_path).await?;
    let token_cache = Path::new(&config.gmail.token_cache_file);

    if force && token_cache.exists() {
        tokio::fs::remove_file(token_cache).await?;
    }

    let _hub = auth::initialize_gmail_hub(Path::new(&config.gmail.credentials_file), token_cache).await?;
    auth::secure_token_file(token_cache).await?;
    println!("Authenticated. Token cached at {:?}", token_cache);
    Ok(())
}

/// Print label -> folder mapping coverage without transferring.
pub async fn run_verify_labels(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path).await?;
    let gmail = build_gmail_source(&config).await?;

    let labels = gmail.list_labels().await?;
    let mappings = build_folder_mappings(&labels, &config.settings.label_mappings);

    println!("{} labels discovered, {} will be transferred:", labels.len(), mappings.len());
    for mapping in &mappings {
        println!("  {} -> {}", mapping.label_name, mapping.folder_name);
    }

    let skipped = labels.len() - mappings.len();
    if skipped > 0 {
        println!("\n{} system label(s) skipped.", skipped);
    }

    Ok(())
}

/// Print the current ProgressRecord without transferring.
pub async fn run_status(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path).await?;
    let progress = ProgressStore::load(Path::new(&config.settings.progress_file)).await?;
    let record = progress.record();

    println!("Session: {}", record.session_id);
    println!("Completed labels: {}/{}", record.completed_labels, record.total_labels);
    if let Some(current) = &record.current_label {
        println!("Currently transferring: {}", current);
    }

    let total_transferred: usize = record.transferred_messages.values().map(|v| v.len()).sum();
    println!("Messages transferred so far: {}", total_transferred);

    Ok(())
}

/// Write an example configuration file.
pub async fn run_init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(TransferError::ConfigError(format!(
            "{:?} already exists (use --force to overwrite)",
            output
        )));
    }

    Config::create_example(output).await?;
    println!("Example configuration written to {:?}", output);
    println!("Edit it with your IMAP credentials before running `run`.");
    Ok(())
}

/// Bind SIGINT/SIGTERM to the engine's cancellation handle. The engine
/// itself never installs process-level signal handlers.
fn install_signal_handler(cancellation: CancellationHandle) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                    tracing::info!("Received interrupt signal, requesting graceful shutdown");
                    cancellation.request_shutdown();
                    return;
                }
            };

            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("Received interrupt signal, requesting graceful shutdown");
        cancellation.request_shutdown();
    });
}
