//! Processing controller: orchestrates one end-to-end session against one
//! account — select folder, fetch headers in batches, parse identity,
//! idempotency-check against storage, resolve flags, classify, execute (or
//! merely record, in preview mode), and keep session counters in lockstep
//! with every row write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::classifier::{ClassifierInput, ThreeTierClassifier};
use crate::config::{AccountConfig, ProviderProfile};
use crate::error::{Result, SentinelError};
use crate::feedback::SubcategoryTagger;
use crate::flags;
use crate::identity;
use crate::imap_adapter::{delete_with_retry, fetch_batch_with_retry, SharedImapAdapter};
use crate::models::{
    Action, ClassifierTier, GeoRecord, ProcessedMessage, ProcessingStatus, Session, SessionMode,
};
use crate::persistence::Store;

/// Cooperative cancellation flag, checked between batches. Cloning shares
/// the same underlying flag; `cancel()` is safe to call from another task.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ProcessingController {
    classifier: ThreeTierClassifier,
    store: Arc<Mutex<Store>>,
    subcategory_tagger: SubcategoryTagger,
    subcategory_confidence_floor: f64,
}

impl ProcessingController {
    pub fn new(classifier: ThreeTierClassifier, store: Arc<Mutex<Store>>) -> Self {
        Self::with_subcategory_tagger(classifier, store, SubcategoryTagger::compile(&[]), 0.5)
    }

    /// Construct with a pre-compiled subcategory tagger (patterns loaded
    /// from `subcategory_patterns` at startup) and the floor below which a
    /// subcategory is withheld rather than guessed.
    pub fn with_subcategory_tagger(
        classifier: ThreeTierClassifier,
        store: Arc<Mutex<Store>>,
        subcategory_tagger: SubcategoryTagger,
        subcategory_confidence_floor: f64,
    ) -> Self {
        Self {
            classifier,
            store,
            subcategory_tagger,
            subcategory_confidence_floor,
        }
    }

    /// Run one session end-to-end against `account` in `mode`, over the
    /// folders named in `account.target_folders` (mapped through `profile`'s
    /// folder aliases). Returns the closed `Session` row.
    pub async fn run(
        &self,
        account_id: i64,
        account: &AccountConfig,
        mode: SessionMode,
        adapter: SharedImapAdapter,
        profile: &ProviderProfile,
        session_timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<Session> {
        let mut session = Session::new(account_id, mode);
        {
            let store = self.store.lock().await;
            session.id = store.open_session(&session)?;
        }

        let batch_size = account.batch_size_override.unwrap_or(profile.batch_size);
        let threshold = account
            .confidence_threshold_override
            .unwrap_or(profile.default_confidence_threshold);

        let deadline = Instant::now() + session_timeout;

        'folders: for canonical_folder in &account.target_folders {
            let wire_folder = profile
                .folder_aliases
                .iter()
                .find(|a| &a.canonical == canonical_folder)
                .map(|a| a.provider_name.clone())
                .unwrap_or_else(|| canonical_folder.clone());

            let mut start_uid: u32 = 1;
            loop {
                if cancel.is_cancelled() {
                    info!(account_id, folder = %wire_folder, "cancellation observed between batches");
                    break 'folders;
                }
                if Instant::now() >= deadline {
                    warn!(account_id, "session wall-clock budget exceeded, closing early");
                    break 'folders;
                }

                let fetched = fetch_batch_with_retry(&adapter, &wire_folder, start_uid, batch_size, profile.mark_seen).await;
                let fetched = match fetched {
                    Ok(messages) => messages,
                    Err(SentinelError::UidValidityChanged { folder, old, new }) => {
                        warn!(
                            account_id,
                            folder = %folder,
                            old_uidvalidity = old,
                            new_uidvalidity = new,
                            "UIDVALIDITY changed mid-session, discarding in-flight batch and re-enumerating folder from UID 1"
                        );
                        start_uid = 1;
                        continue;
                    }
                    Err(e) if e.is_transient() => {
                        warn!(account_id, folder = %wire_folder, error = %e, "batch fetch failed, abandoning folder");
                        break;
                    }
                    Err(e) => return Err(e),
                };

                if fetched.is_empty() {
                    break;
                }

                let mut max_uid = start_uid;
                for fetched_message in &fetched {
                    max_uid = max_uid.max(fetched_message.uid);
                    self.process_one(
                        &mut session,
                        account_id,
                        canonical_folder,
                        mode,
                        fetched_message,
                        &adapter,
                        &wire_folder,
                        threshold,
                        profile.expunge_strategy,
                    )
                    .await;
                }

                if (fetched.len() as u32) < batch_size {
                    break;
                }
                start_uid = max_uid + 1;
            }
        }

        session.close();
        let store = self.store.lock().await;
        store.close_session(&session)?;
        Ok(session)
    }

    /// Handle one fetched message: identity, idempotency, flags, classify,
    /// execute, and commit. Failures are recorded on the session rather than
    /// propagated, matching the controller's "never abort a session over one
    /// bad message" posture.
    #[allow(clippy::too_many_arguments)]
    async fn process_one(
        &self,
        session: &mut Session,
        account_id: i64,
        folder: &str,
        mode: SessionMode,
        fetched: &crate::imap_adapter::FetchedMessage,
        adapter: &SharedImapAdapter,
        wire_folder: &str,
        threshold: f64,
        expunge_strategy: crate::config::ExpungeStrategy,
    ) {
        let identity = identity::parse_headers(&fetched.raw_headers);
        let message_id = identity.message_id.clone();

        let existing = {
            let store = self.store.lock().await;
            store.find_by_message_id(&message_id)
        };
        let existing = match existing {
            Ok(e) => e,
            Err(e) => {
                warn!(account_id, message_id = %message_id, error = %e, "lookup failed");
                session.record_error();
                return;
            }
        };

        if let Some(row) = &existing {
            if row.processing_status == ProcessingStatus::Processed && row.action == Action::Deleted {
                debug!(message_id = %message_id, "already deleted, skipping re-delete");
                session.record(Action::Skipped);
                return;
            }
            if row.processing_status == ProcessingStatus::Error && row.retry_count >= 3 {
                debug!(message_id = %message_id, "retry budget exhausted, skipping");
                session.record(Action::Skipped);
                return;
            }
        }

        let flags = match self.store.lock().await.flags_for(&message_id) {
            Ok(f) => f,
            Err(_) => Vec::new(),
        };
        if flags::has_conflict(&flags) {
            warn!(message_id = %message_id, "PROTECT and DELETE both present, PROTECT wins");
        }
        let evaluation = flags::evaluate(&flags);

        if let Some(row) = &existing {
            if row.processing_status == ProcessingStatus::Flagged {
                let (action, reason) = flag_implied_action(evaluation);
                let mut updated = row.clone();
                updated.action = action;
                updated.reason = reason;
                updated.completed_at = Some(chrono::Utc::now());
                session.record(action);
                if let Err(e) = self.store.lock().await.commit_processed_message(&updated, session, 0.0) {
                    warn!(message_id = %message_id, error = %e, "failed to persist flagged short-circuit");
                    session.record_error();
                }
                return;
            }
        }

        let mut input = ClassifierInput::from(&identity);
        input.prior_preserved_count = self
            .store
            .lock()
            .await
            .count_preserved_by_domain(&identity.sender_domain)
            .unwrap_or(0) as u32;

        let classify_start = Instant::now();
        let mut verdict = self.classifier.classify(&message_id, &input).await;
        let tier_elapsed_ms = classify_start.elapsed().as_secs_f64() * 1000.0;

        if let Some(tagged) = self.subcategory_tagger.tag(
            &verdict.category,
            &identity.subject,
            &identity.sender_domain,
            verdict.confidence,
            self.subcategory_confidence_floor,
        ) {
            verdict.subcategory = Some(tagged);
        }

        // The live delete/preserve action is driven by the legacy taxonomy
        // only; `taxonomy_v2_category` is recorded for A/B analytics and must
        // never affect what actually happens to a message.
        let is_spam = crate::classifier::category_is_spam(&verdict.category);
        let (mut action, mut reason) = if is_spam && verdict.confidence >= threshold {
            (Action::Deleted, verdict.reason.clone())
        } else {
            (Action::Preserved, verdict.reason.clone())
        };

        match evaluation {
            crate::models::FlagEvaluation::VetoDelete => {
                action = Action::Preserved;
                reason = "PROTECT flag overrides classifier verdict".to_string();
            }
            crate::models::FlagEvaluation::ForceDelete => {
                action = Action::Deleted;
                reason = "DELETE flag forces disposition".to_string();
            }
            crate::models::FlagEvaluation::AdvisoryResearch | crate::models::FlagEvaluation::None => {}
        }

        let processing_status = if mode == SessionMode::Preview {
            ProcessingStatus::Preview
        } else if matches!(evaluation, crate::models::FlagEvaluation::AdvisoryResearch) {
            ProcessingStatus::Flagged
        } else {
            ProcessingStatus::Processed
        };

        let mut row = ProcessedMessage {
            id: 0,
            message_id: message_id.clone(),
            uid: fetched.uid,
            folder: folder.to_string(),
            sender: identity.sender,
            sender_domain: identity.sender_domain,
            subject: identity.subject,
            action,
            reason,
            category: verdict.category,
            subcategory: verdict.subcategory,
            confidence: verdict.confidence,
            tier: verdict.tier,
            geo: GeoRecord {
                ip: identity.received_ips.first().cloned(),
                country_code: verdict.geo_country_code,
                country_name: None,
                risk_score: verdict.geo_risk_score,
                detection_method: if verdict.tier == ClassifierTier::Tier2 {
                    Some("received-header-ip".to_string())
                } else {
                    None
                },
            },
            processing_status,
            retry_count: existing.as_ref().map(|r| r.retry_count).unwrap_or(0),
            started_at: chrono::Utc::now(),
            completed_at: None,
            raw_headers: String::from_utf8_lossy(&fetched.raw_headers).to_string(),
            session_id: session.id,
            taxonomy_v2_category: verdict.taxonomy_v2_category,
            primary_taxonomy: verdict.primary_taxonomy,
            tier3_fallback: verdict.tier3_fallback,
        };

        if mode == SessionMode::Preview {
            row.completed_at = Some(chrono::Utc::now());
            session.record(row.action);
            if let Err(e) = self.store.lock().await.commit_processed_message(&row, session, tier_elapsed_ms) {
                warn!(message_id = %message_id, error = %e, "failed to persist preview row");
                session.record_error();
            }
            return;
        }

        if processing_status == ProcessingStatus::Flagged {
            row.completed_at = Some(chrono::Utc::now());
            session.record(row.action);
            if let Err(e) = self.store.lock().await.commit_processed_message(&row, session, tier_elapsed_ms) {
                warn!(message_id = %message_id, error = %e, "failed to persist flagged row");
                session.record_error();
            }
            return;
        }

        let wire_result: Result<()> = match row.action {
            Action::Deleted => delete_with_retry(adapter, wire_folder, fetched.uid, expunge_strategy).await,
            // Preserving leaves the message untouched; a provider that wants
            // messages marked seen gets that via the `mark_seen` item in the
            // batch's FETCH, not a separate round trip here.
            Action::Preserved | Action::Skipped => Ok(()),
        };

        match wire_result {
            Ok(()) => {
                row.completed_at = Some(chrono::Utc::now());
                session.record(row.action);
                if let Err(e) = self.store.lock().await.commit_processed_message(&row, session, tier_elapsed_ms) {
                    warn!(message_id = %message_id, error = %e, "failed to persist processed row");
                    session.record_error();
                }
            }
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "disposition failed on the wire");
                row.processing_status = ProcessingStatus::Error;
                row.retry_count += 1;
                row.completed_at = Some(chrono::Utc::now());
                session.record_error();
                let _ = self.store.lock().await.commit_processed_message(&row, session, tier_elapsed_ms);
            }
        }
    }
}

fn flag_implied_action(evaluation: crate::models::FlagEvaluation) -> (Action, String) {
    use crate::models::FlagEvaluation::*;
    match evaluation {
        VetoDelete => (Action::Preserved, "PROTECT flag overrides classifier verdict".to_string()),
        ForceDelete => (Action::Deleted, "DELETE flag forces disposition".to_string()),
        AdvisoryResearch | None => (Action::Preserved, "RESEARCH flag, no destructive action taken".to_string()),
    }
}
