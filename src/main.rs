use clap::Parser;
use gmail_imap_transfer::cli::{self, Cli, Commands};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Multiple dependencies (async-imap's TLS stack and google-gmail1's) pull in
    // rustls with different default crypto providers; install one explicitly
    // before either gets a chance to.
    #[cfg(not(windows))]
    let crypto_install = rustls::crypto::aws_lc_rs::default_provider().install_default();
    #[cfg(windows)]
    let crypto_install = rustls::crypto::ring::default_provider().install_default();

    if crypto_install.is_err() {
        eprintln!("Error: failed to install default rustls crypto provider");
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("gmail_imap_transfer=debug,info"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("gmail_imap_transfer=info,warn,error"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let result = match cli.command {
        Commands::Run { config, dry_run } => cli::run_transfer(&config, dry_run).await,
        Commands::Auth { config, force } => cli::run_auth(&config, force).await,
        Commands::VerifyLabels { config } => cli::run_verify_labels(&config).await,
        Commands::Status { config } => cli::run_status(&config).await,
        Commands::InitConfig { output, force } => cli::run_init_config(&output, force).await,
    };

    // A graceful shutdown triggered by SIGINT/SIGTERM unwinds back through
    // run_transfer as Ok(()) -- the cancellation handle only stops the
    // pipeline early, it never turns into an error. Exit code 0 either way.
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
