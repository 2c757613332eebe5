//! Command-line glue: parses subcommands and calls straight into the core
//! library. No business logic lives here — every subcommand is a thin
//! collaborator over `config`, `persistence`, `controller`, `scheduler`, and
//! `feedback`, matching the separation the rest of the crate keeps between
//! orchestration and wire/storage logic.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::controller::{CancelSignal, ProcessingController};
use crate::error::{Result, SentinelError};
use crate::feedback::{default_subcategory_patterns, SubcategoryTagger};
use crate::imap_adapter::{ImapAdapter, SharedImapAdapter, TlsImapAdapter};
use crate::models::{FlagType, ModelKind, Session, SessionMode};
use crate::persistence::Store;
use crate::scheduler::{resolve_credential, Scheduler};

#[derive(Parser, Debug)]
#[command(name = "sentinel-mail", version, about = "Tiered spam classification and disposition over IMAP")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "sentinel.toml")]
    pub config: PathBuf,

    /// Enable debug-level logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Verify IMAP credentials for a configured account without processing any mail.
    Login {
        /// Account email as it appears in the configuration file.
        account: String,
    },

    /// Run one session against a configured account, or every account when none is named.
    Run {
        /// Account email to run against; all configured accounts if omitted.
        account: Option<String>,
        /// Record verdicts without instructing the server to delete anything.
        #[arg(long, conflicts_with = "process")]
        preview: bool,
        /// Act on verdicts: delete, preserve, and persist processed rows.
        #[arg(long, conflicts_with = "preview")]
        process: bool,
    },

    /// List recent sessions for an account.
    Sessions {
        account: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// List processed messages from one session.
    Messages {
        session_id: i64,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Manage operator override flags on a message.
    Flag {
        #[command(subcommand)]
        action: FlagAction,
    },

    /// Submit or manage classifier feedback.
    Feedback {
        #[command(subcommand)]
        action: FeedbackAction,
    },

    /// Retrain or promote classifier model versions.
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },

    /// Print aggregated disposition analytics.
    Analytics {
        /// Only include sessions closed on or after this RFC 3339 timestamp.
        #[arg(long)]
        since: Option<String>,
        /// Only include sessions closed on or before this RFC 3339 timestamp.
        #[arg(long)]
        until: Option<String>,
    },

    /// Run the batch scheduler in the foreground: one `process` session per
    /// configured account every `scheduler.interval_minutes`, guarded by a
    /// pid file, until interrupted.
    Serve,
}

#[derive(Subcommand, Debug)]
pub enum FlagAction {
    Set {
        message_id: String,
        #[arg(value_enum)]
        flag_type: FlagTypeArg,
        reason: String,
        account: String,
    },
    Clear {
        message_id: String,
        #[arg(value_enum)]
        flag_type: FlagTypeArg,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum FlagTypeArg {
    Protect,
    Delete,
    Research,
}

impl From<FlagTypeArg> for FlagType {
    fn from(value: FlagTypeArg) -> Self {
        match value {
            FlagTypeArg::Protect => FlagType::Protect,
            FlagTypeArg::Delete => FlagType::Delete,
            FlagTypeArg::Research => FlagType::Research,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum FeedbackAction {
    Submit {
        message_id: String,
        corrected_category: String,
        #[arg(long)]
        confidence: Option<f64>,
        #[arg(long)]
        comment: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ModelAction {
    Retrain {
        #[arg(value_enum)]
        kind: ModelKindArg,
    },
    Promote {
        #[arg(value_enum)]
        kind: ModelKindArg,
        version_id: i64,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum ModelKindArg {
    NaiveBayes,
    RandomForest,
    Keyword,
    Ensemble,
    TaxonomyV2,
}

impl From<ModelKindArg> for ModelKind {
    fn from(value: ModelKindArg) -> Self {
        match value {
            ModelKindArg::NaiveBayes => ModelKind::NaiveBayes,
            ModelKindArg::RandomForest => ModelKind::RandomForest,
            ModelKindArg::Keyword => ModelKind::Keyword,
            ModelKindArg::Ensemble => ModelKind::Ensemble,
            ModelKindArg::TaxonomyV2 => ModelKind::TaxonomyV2,
        }
    }
}

async fn open_store(config: &Config) -> Result<Arc<Mutex<Store>>> {
    Ok(Arc::new(Mutex::new(Store::open(std::path::Path::new(
        &config.persistence.db_path,
    ))?)))
}

fn find_account<'a>(config: &'a Config, email: &str) -> Result<&'a crate::config::AccountConfig> {
    config
        .accounts
        .iter()
        .find(|a| a.email == email)
        .ok_or_else(|| SentinelError::ConfigError(format!("no configured account named {}", email)))
}

/// Dispatch one parsed subcommand against the loaded configuration.
pub async fn execute(cli: &Cli) -> Result<()> {
    let config = Config::load(&cli.config).await?;
    config.validate()?;

    match &cli.command {
        Commands::Login { account } => login(&config, account).await,
        Commands::Run { account, preview, process } => {
            let mode = if *process { SessionMode::Process } else if *preview { SessionMode::Preview } else { SessionMode::Preview };
            run(&config, account.as_deref(), mode).await
        }
        Commands::Sessions { account, limit } => sessions(&config, account, *limit).await,
        Commands::Messages { session_id, limit, offset } => messages(&config, *session_id, *limit, *offset).await,
        Commands::Flag { action } => flag(&config, action).await,
        Commands::Feedback { action } => feedback(&config, action).await,
        Commands::Model { action } => model(&config, action).await,
        Commands::Analytics { since, until } => analytics(&config, since.as_deref(), until.as_deref()).await,
        Commands::Serve => run_scheduler(config, &ctrl_c_cancel_signal()).await,
    }
}

/// A `CancelSignal` wired to SIGINT/ctrl-c, so `serve` closes its current
/// session gracefully instead of dying mid-batch.
fn ctrl_c_cancel_signal() -> CancelSignal {
    let cancel = CancelSignal::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, signalling graceful shutdown");
            handle.cancel();
        }
    });
    cancel
}

async fn login(config: &Config, account_email: &str) -> Result<()> {
    let account = find_account(config, account_email)?;
    let password = resolve_credential(&account.credential_handle)?;
    let mut adapter = TlsImapAdapter::new(account.clone(), password);
    adapter.connect().await?;
    let folders = adapter.list_folders().await?;
    adapter.close().await?;
    println!("Authenticated to {} as {}", account.host, account.username);
    println!("Visible folders ({}):", folders.len());
    for folder in folders {
        println!("  - {}", folder);
    }
    Ok(())
}

async fn run(config: &Config, account_email: Option<&str>, mode: SessionMode) -> Result<()> {
    let store = open_store(config).await?;

    let accounts: Vec<crate::config::AccountConfig> = match account_email {
        Some(email) => vec![find_account(config, email)?.clone()],
        None => config.accounts.clone(),
    };

    let session_timeout = std::time::Duration::from_secs(config.scheduler.per_session_timeout_secs);
    let cancel = CancelSignal::new();

    for account in accounts {
        let account_id = {
            let guard = store.lock().await;
            guard.upsert_account(&crate::models::Account {
                id: 0,
                email: account.email.clone(),
                provider_tag: account.provider_tag.clone(),
                host: account.host.clone(),
                port: account.port,
                tls: account.tls,
                username: account.username.clone(),
                credential_handle: account.credential_handle.clone(),
                target_folders: account.target_folders.clone(),
                batch_size_override: account.batch_size_override,
                confidence_threshold_override: account.confidence_threshold_override,
            })?
        };

        let password = resolve_credential(&account.credential_handle)?;
        let profile = config.providers.profile_for(&account.provider_tag).clone();
        let classifier = crate::classifier::ThreeTierClassifier::new(
            config.classifier.tier1_confidence_threshold,
            config.classifier.tier3_confidence_threshold,
            config.classifier.tier3_timeout_secs,
            config.classifier.taxonomy_v2_rollout_pct,
            account.trusted_domains.clone(),
        );
        let tagger = {
            let guard = store.lock().await;
            guard.seed_subcategory_patterns(&default_subcategory_patterns())?;
            SubcategoryTagger::compile(&guard.list_subcategory_patterns()?)
        };
        let controller = ProcessingController::with_subcategory_tagger(
            classifier,
            store.clone(),
            tagger,
            config.classifier.subcategory_confidence_floor,
        );

        let mut raw_adapter = TlsImapAdapter::new(account.clone(), password);
        raw_adapter.connect().await?;
        let adapter: SharedImapAdapter = Arc::new(Mutex::new(raw_adapter));

        let session = controller
            .run(account_id, &account, mode, adapter, &profile, session_timeout, &cancel)
            .await?;

        print_session(&session, mode);
    }
    Ok(())
}

fn print_session(session: &Session, mode: SessionMode) {
    println!("========================================");
    println!("Session {} ({:?})", session.id, mode);
    println!("========================================");
    println!("Examined:  {}", session.examined);
    println!("Deleted:   {}", session.deleted);
    println!("Preserved: {}", session.preserved);
    println!("Skipped:   {}", session.skipped);
    println!("Errored:   {}", session.errored);
    println!("========================================");
}

async fn sessions(config: &Config, account_email: &str, limit: u32) -> Result<()> {
    let store = open_store(config).await?;
    let account = find_account(config, account_email)?;
    let guard = store.lock().await;
    let account_id = guard
        .find_account_by_email(&account.email)?
        .ok_or_else(|| SentinelError::ConfigError(format!("account {} has no sessions yet", account_email)))?;
    let rows = guard.list_sessions(Some(account_id), limit)?;
    for session in rows {
        println!(
            "session {} mode={:?} examined={} deleted={} preserved={} skipped={} errored={}",
            session.id, session.mode, session.examined, session.deleted, session.preserved, session.skipped, session.errored
        );
    }
    Ok(())
}

async fn messages(config: &Config, session_id: i64, limit: u32, offset: u32) -> Result<()> {
    let store = open_store(config).await?;
    let guard = store.lock().await;
    let rows = guard.get_session_messages(session_id, limit, offset)?;
    for row in rows {
        println!(
            "{} | {} | {:?} | {} / {:?} | confidence={:.2} tier={:?}",
            row.message_id, row.sender, row.action, row.category, row.subcategory, row.confidence, row.tier
        );
    }
    Ok(())
}

async fn flag(config: &Config, action: &FlagAction) -> Result<()> {
    let store = open_store(config).await?;
    let guard = store.lock().await;
    match action {
        FlagAction::Set { message_id, flag_type, reason, account } => {
            let account_id = guard
                .find_account_by_email(account)?
                .ok_or_else(|| SentinelError::ConfigError(format!("no account named {}", account)))?;
            guard.set_flag(message_id, flag_type.clone().into(), reason, account_id)?;
            println!("flag set on {}", message_id);
        }
        FlagAction::Clear { message_id, flag_type } => {
            guard.clear_flag(message_id, flag_type.clone().into())?;
            println!("flag cleared on {}", message_id);
        }
    }
    Ok(())
}

async fn feedback(config: &Config, action: &FeedbackAction) -> Result<()> {
    let store = open_store(config).await?;
    let guard = store.lock().await;
    match action {
        FeedbackAction::Submit { message_id, corrected_category, confidence, comment } => {
            let id = crate::feedback::submit_feedback(&guard, message_id, corrected_category, *confidence, comment.clone())?;
            println!("recorded feedback #{} for {}", id, message_id);
        }
    }
    Ok(())
}

async fn model(config: &Config, action: &ModelAction) -> Result<()> {
    let store = open_store(config).await?;
    let mut guard = store.lock().await;
    match action {
        ModelAction::Retrain { kind } => {
            let version = crate::feedback::trigger_retrain(&mut guard, kind.clone().into(), &config.classifier.model_dir)?;
            println!("trained model version {} ({:.4} offline accuracy, {} samples)", version.id, version.offline_accuracy, version.training_set_size);
        }
        ModelAction::Promote { kind, version_id } => {
            let candidate = find_model_version(&guard, kind.clone().into(), *version_id)?;
            crate::feedback::promote_model(&mut guard, kind.clone().into(), &candidate)?;
            println!("promoted model version {} to live", version_id);
        }
    }
    Ok(())
}

fn find_model_version(store: &Store, kind: ModelKind, version_id: i64) -> Result<crate::models::ModelVersion> {
    store
        .find_model_version(kind, version_id)?
        .ok_or_else(|| SentinelError::ClassifierError(format!("no model version {} for {:?}", version_id, kind)))
}

async fn analytics(config: &Config, since: Option<&str>, until: Option<&str>) -> Result<()> {
    let store = open_store(config).await?;
    let guard = store.lock().await;
    let range = match (since, until) {
        (Some(s), Some(u)) => Some((parse_timestamp(s)?, parse_timestamp(u)?)),
        (None, None) => None,
        _ => {
            return Err(SentinelError::ConfigError(
                "--since and --until must be given together".to_string(),
            ))
        }
    };
    let snapshot = crate::analytics::get_analytics(&guard, range)?;
    println!("total={} deleted={} preserved={} skipped={}", snapshot.total, snapshot.deleted, snapshot.preserved, snapshot.skipped);
    println!("tier3_share={:.4} taxonomy_v2_divergences={}", snapshot.tier3_share, snapshot.taxonomy_v2_divergences);
    for (category, count) in &snapshot.by_category {
        println!("  category {}: {}", category, count);
    }
    for (tier, count) in &snapshot.by_tier {
        println!("  tier {}: {}", tier, count);
    }
    Ok(())
}

fn parse_timestamp(raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| SentinelError::ConfigError(format!("invalid RFC 3339 timestamp {}: {}", raw, e)))
}

/// Run the scheduler's periodic loop until cancelled, used by `main` for a
/// daemon-mode invocation outside the one-shot subcommands above.
pub async fn run_scheduler(config: Config, cancel: &CancelSignal) -> Result<()> {
    let store = open_store(&config).await?;
    let scheduler = Scheduler::new(config, store);
    scheduler.run_forever(cancel).await
}
