//! Batch scheduler: wakes on a configured interval, runs one `process` session
//! per configured account under a bounded concurrency cap, and keeps a
//! PID file so two scheduler instances never run against the same database
//! at once. Each account gets its own circuit breaker so one flaky mailbox
//! can't starve the others' retry budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::ThreeTierClassifier;
use crate::config::Config;
use crate::controller::{CancelSignal, ProcessingController};
use crate::error::{Result, SentinelError};
use crate::feedback::{default_subcategory_patterns, SubcategoryTagger};
use crate::imap_adapter::{ImapAdapter, SharedImapAdapter, TlsImapAdapter};
use crate::models::{Session, SessionMode};
use crate::persistence::Store;

/// Resolve an account's credential handle to the password it names, read
/// from the environment rather than stored anywhere at rest.
pub fn resolve_credential(handle: &str) -> Result<String> {
    std::env::var(handle).map_err(|_| SentinelError::AuthFailure(format!("credential env var {} is not set", handle)))
}

/// A held PID file; removed on drop so a crashed scheduler doesn't wedge the
/// next run forever.
pub struct PidLock {
    path: String,
}

impl PidLock {
    /// Acquire `path`, failing if a live process already holds it. A PID file
    /// referencing a process that no longer exists is treated as stale and
    /// reclaimed.
    pub fn acquire(path: &str) -> Result<Self> {
        if let Ok(existing) = std::fs::read_to_string(path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if process_is_alive(pid) {
                    return Err(SentinelError::ConfigError(format!(
                        "scheduler already running as pid {} (pid file {})",
                        pid, path
                    )));
                }
                warn!(pid, path, "reclaiming stale pid file");
            }
        }
        std::fs::write(path, std::process::id().to_string())?;
        Ok(Self { path: path.to_string() })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    // No portable liveness check off Linux; assume alive and let the operator
    // remove a stuck pid file manually.
    true
}

pub struct Scheduler {
    config: Config,
    store: Arc<Mutex<Store>>,
    breakers: HashMap<String, CircuitBreaker>,
}

impl Scheduler {
    pub fn new(config: Config, store: Arc<Mutex<Store>>) -> Self {
        let breakers = config
            .accounts
            .iter()
            .map(|a| (a.email.clone(), CircuitBreaker::new(config.circuit_breaker.clone())))
            .collect();
        Self { config, store, breakers }
    }

    /// Loop forever at `config.scheduler.interval_minutes`, holding the pid
    /// file for the process lifetime. Returns only on cancellation or a pid
    /// acquisition failure.
    pub async fn run_forever(&self, cancel: &CancelSignal) -> Result<()> {
        let _pid_lock = PidLock::acquire(&self.config.scheduler.pid_file)?;
        let interval = Duration::from_secs(self.config.scheduler.interval_minutes * 60);

        loop {
            if cancel.is_cancelled() {
                info!("scheduler cancelled, exiting run loop");
                return Ok(());
            }
            match self.tick(cancel).await {
                Ok(sessions) => info!(account_count = sessions.len(), "scheduler tick complete"),
                Err(e) => error!(error = %e, "scheduler tick failed"),
            }
            if cancel.is_cancelled() {
                return Ok(());
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Run one `process` session per account, bounded by
    /// `max_concurrent_accounts`. A single account's failure never aborts the
    /// others; it's logged and folded into that account's circuit breaker.
    pub async fn tick(&self, cancel: &CancelSignal) -> Result<Vec<Session>> {
        let semaphore = Arc::new(Semaphore::new(self.config.scheduler.max_concurrent_accounts));
        let session_timeout = Duration::from_secs(self.config.scheduler.per_session_timeout_secs);
        let mut handles = Vec::with_capacity(self.config.accounts.len());

        for account in &self.config.accounts {
            let permit = semaphore.clone();
            let breaker = self
                .breakers
                .get(&account.email)
                .cloned()
                .unwrap_or_else(|| CircuitBreaker::new(self.config.circuit_breaker.clone()));
            let account = account.clone();
            let providers = self.config.providers.clone();
            let classifier_cfg = self.config.classifier.clone();
            let store = self.store.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore never closed");
                run_one_account(account, providers, classifier_cfg, store, breaker, session_timeout, cancel).await
            }));
        }

        let mut sessions = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Ok(session)) => sessions.push(session),
                Ok(Err(e)) => error!(error = %e, "account session failed"),
                Err(join_err) => error!(error = %join_err, "account session task panicked"),
            }
        }
        Ok(sessions)
    }
}

async fn run_one_account(
    account: crate::config::AccountConfig,
    providers: crate::config::ProvidersConfig,
    classifier_cfg: crate::config::ClassifierConfig,
    store: Arc<Mutex<Store>>,
    breaker: CircuitBreaker,
    session_timeout: Duration,
    cancel: CancelSignal,
) -> Result<Session> {
    breaker.check_request().await?;

    let account_id = {
        let store = store.lock().await;
        store.upsert_account(&crate::models::Account {
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
    let profile = providers.profile_for(&account.provider_tag).clone();
    let classifier = ThreeTierClassifier::new(
        classifier_cfg.tier1_confidence_threshold,
        classifier_cfg.tier3_confidence_threshold,
        classifier_cfg.tier3_timeout_secs,
        classifier_cfg.taxonomy_v2_rollout_pct,
        account.trusted_domains.clone(),
    );
    let tagger = {
        let guard = store.lock().await;
        guard.seed_subcategory_patterns(&default_subcategory_patterns())?;
        SubcategoryTagger::compile(&guard.list_subcategory_patterns()?)
    };
    let controller = ProcessingController::with_subcategory_tagger(
        classifier,
        store,
        tagger,
        classifier_cfg.subcategory_confidence_floor,
    );

    let mut adapter = TlsImapAdapter::new(account.clone(), password);
    let result = adapter.connect().await;
    let adapter: SharedImapAdapter = Arc::new(Mutex::new(adapter));
    if let Err(e) = result {
        breaker.record_failure(&e).await;
        return Err(e);
    }

    let outcome = controller
        .run(account_id, &account, SessionMode::Process, adapter, &profile, session_timeout, &cancel)
        .await;

    match &outcome {
        Ok(session) => {
            info!(
                email = %account.email,
                examined = session.examined,
                deleted = session.deleted,
                errored = session.errored,
                "account session complete"
            );
            breaker.record_success().await;
        }
        Err(e) => {
            warn!(email = %account.email, error = %e, "account session failed");
            breaker.record_failure(e).await;
        }
    }
    outcome
}
