//! Sentinel Mail
//!
//! A tiered spam-classification and disposition engine that runs against any
//! IMAPv4rev1 mailbox: it scans configured folders, runs messages through a
//! three-tier classifier cascade, and either records a verdict (preview) or
//! acts on it (delete/preserve), all tracked in an embedded SQLite store so
//! every run is idempotent and auditable.
//!
//! # Overview
//!
//! - **Identity**: header parsing into a stable, cross-folder `message_id`
//! - **Classification**: a three-tier cascade (instant rules + ensemble,
//!   geographic signal, bounded-timeout strategic scorer) with a shadow
//!   `taxonomy_v2` rollout
//! - **Flags**: operator PROTECT/DELETE/RESEARCH overrides, evaluated ahead
//!   of the classifier
//! - **Persistence**: migrated SQLite schema for accounts, sessions,
//!   processed messages, flags, caches, feedback, and model versions
//! - **Scheduling**: a bounded-concurrency batch runner with a per-account
//!   circuit breaker and a PID-file mutual exclusion lock
//! - **Feedback**: operator corrections retrain and promote new model
//!   versions without a live regression
//!
//! # Example Usage
//!
//! ```no_run
//! use sentinel_mail::{config::Config, persistence::Store, scheduler::Scheduler};
//! use sentinel_mail::controller::CancelSignal;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("sentinel.toml".as_ref()).await?;
//!     let store = std::sync::Arc::new(tokio::sync::Mutex::new(
//!         Store::open(config.persistence.db_path.as_ref())?,
//!     ));
//!     let scheduler = Scheduler::new(config, store);
//!     scheduler.run_forever(&CancelSignal::new()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`identity`] - RFC 5322 header parsing into a stable message identity
//! - [`classifier`] - three-tier classification cascade
//! - [`flags`] - operator override flag precedence
//! - [`controller`] - per-account, per-session processing orchestration
//! - [`imap_adapter`] - IMAP wire protocol adapter
//! - [`circuit_breaker`] - per-account transient-failure circuit breaker
//! - [`scheduler`] - batch scheduling across accounts
//! - [`persistence`] - embedded SQLite store and migrations
//! - [`feedback`] - feedback ingestion, retraining, and model promotion
//! - [`analytics`] - reporting aggregation
//! - [`config`] - configuration loading, validation, and provider profiles
//! - [`error`] - error taxonomy and result alias
//! - [`models`] - core data structures
//! - [`cli`] - command-line interface

pub mod analytics;
pub mod circuit_breaker;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod feedback;
pub mod flags;
pub mod identity;
pub mod imap_adapter;
pub mod models;
pub mod persistence;
pub mod scheduler;

// Re-export commonly used types for convenience
pub use error::{Result, SentinelError};

// Core data models
pub use models::{Account, Action, FlagType, ProcessedMessage, ProcessingStatus, Session, SessionMode};

// Classifier types
pub use classifier::{ClassifierInput, ThreeTierClassifier, Verdict};

// Config types
pub use config::{AccountConfig, ClassifierConfig, Config, ProviderProfile};

// Persistence
pub use persistence::Store;

// Processing controller
pub use controller::{CancelSignal, ProcessingController};

// Scheduling
pub use scheduler::Scheduler;

// CLI types (for binary usage)
pub use cli::{Cli, Commands};
