//! Gmail-to-IMAP Transfer Engine
//!
//! A resumable, two-stage migration system that moves mail out of Gmail
//! and into an arbitrary IMAP server, preserving folder structure (derived
//! from Gmail labels), read/starred flags, and original message dates.
//!
//! # Overview
//!
//! - **Authentication**: OAuth2 (read-only) against Gmail, plain login against the IMAP server.
//! - **Gmail Source**: label and message enumeration, rate-limited batch fetch of raw messages.
//! - **Folder Mapper**: deterministic Gmail label -> IMAP folder name mapping.
//! - **IMAP Sink**: connection lifecycle, idempotent folder creation, APPEND with session recycling.
//! - **Progress Store**: durable, atomically-written JSON resume state.
//! - **Transfer Engine**: the fetcher/uploader pipeline that ties the above together, one label at a time.
//!
//! # Example Usage
//!
//! ```no_run
//! use gmail_imap_transfer::{auth, config::Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!
//!     let hub = auth::initialize_gmail_hub(
//!         config.gmail.credentials_file.as_ref(),
//!         config.gmail.token_cache_file.as_ref(),
//!     ).await?;
//!
//!     // Build a GmailSource, ImapSink, ProgressStore and TransferEngine
//!     // from here -- see the `run` subcommand in `cli` for the full wiring.
//!
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - OAuth2 authentication and Gmail API initialization
//! - [`cli`] - Command-line interface and run orchestration
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases
//! - [`folder_mapper`] - Gmail label -> IMAP folder name mapping
//! - [`gmail_source`] - Gmail label/message enumeration and batch fetch
//! - [`imap_sink`] - IMAP connection, folder creation, and APPEND
//! - [`models`] - Core data structures
//! - [`progress_store`] - Durable, resumable progress tracking
//! - [`transfer_engine`] - The fetcher/uploader pipeline

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod folder_mapper;
pub mod gmail_source;
pub mod imap_sink;
pub mod models;
pub mod progress_store;
pub mod transfer_engine;

// Re-export commonly used types for convenience
pub use error::{Result, TransferError};

// Core data models
pub use models::{CachedMessage, FolderMapping, Label, MessageRef, ProgressRecord};

// Config types
pub use config::Config;

// Component types
pub use folder_mapper::build_folder_mappings;
pub use gmail_source::{GmailSource, MailSource};
pub use imap_sink::{ImapConnectionSettings, ImapSink, MailSink};
pub use progress_store::ProgressStore;
pub use transfer_engine::{CacheStats, CancellationHandle, TransferEngine};

// CLI types (for binary usage)
pub use cli::{Cli, Commands};
