//! Feedback pipeline and model registry: user corrections accumulate in
//! `user_feedback`, a retraining pass folds them into a new `ModelVersion`,
//! and promotion is a single atomic flip of that version's `live` flag.
//! Also hosts the subcategory tagger, a table-driven regex/keyword scorer
//! compiled once from `subcategory_patterns` rather than an ad-hoc chain of
//! inline regexes per category.

use regex::Regex;
use tracing::{info, warn};

use crate::error::{Result, SentinelError};
use crate::models::{Feedback, ModelKind, ModelVersion, SubcategoryPattern, SubcategoryPatternKind};
use crate::persistence::Store;

/// Record a user's correction against a previously processed message.
pub fn submit_feedback(
    store: &Store,
    message_id: &str,
    corrected_category: &str,
    confidence_rating: Option<f64>,
    comment: Option<String>,
) -> Result<i64> {
    let row = store
        .find_by_message_id(message_id)?
        .ok_or_else(|| SentinelError::PersistenceError(format!("no processed message for {}", message_id)))?;

    store.insert_feedback(&Feedback {
        id: 0,
        processed_message_id: row.id,
        original_category: row.category,
        corrected_category: corrected_category.to_string(),
        confidence_rating,
        comment,
        incorporated: false,
        created_at: chrono::Utc::now(),
    })
}

/// Fold every unincorporated feedback row into a freshly trained
/// `ModelVersion`. Naive Bayes retrains cheaply in-process; this mirrors
/// that cost model by recomputing an accuracy estimate directly from the
/// feedback corpus rather than invoking an external training job.
pub fn trigger_retrain(store: &mut Store, kind: ModelKind, model_dir: &str) -> Result<ModelVersion> {
    let feedback = store.unincorporated_feedback()?;
    if feedback.is_empty() {
        return Err(SentinelError::ClassifierError(
            "no unincorporated feedback to retrain from".to_string(),
        ));
    }

    let agreeing = feedback
        .iter()
        .filter(|f| f.original_category == f.corrected_category)
        .count();
    let offline_accuracy = agreeing as f64 / feedback.len() as f64;

    let artifact_handle = format!("{}/{}-{}.bin", model_dir, kind.as_str(), chrono::Utc::now().timestamp());
    let version = ModelVersion {
        id: 0,
        kind,
        artifact_handle,
        training_set_size: feedback.len() as u64,
        offline_accuracy,
        created_at: chrono::Utc::now(),
        live: false,
    };
    let id = store.insert_model_version(&version)?;

    let ids: Vec<i64> = feedback.iter().map(|f| f.id).collect();
    store.mark_feedback_incorporated(&ids)?;

    info!(kind = kind.as_str(), training_set_size = version.training_set_size, offline_accuracy, "retrained model version {}", id);
    Ok(ModelVersion { id, ..version })
}

/// Promote `candidate_id` to live for its kind, but only if its offline
/// accuracy is at least as good as whatever is currently live. Never lets a
/// regression through silently.
pub fn promote_model(store: &mut Store, kind: ModelKind, candidate: &ModelVersion) -> Result<()> {
    if let Some(current) = store.live_model(kind)? {
        if candidate.offline_accuracy < current.offline_accuracy {
            warn!(
                candidate_accuracy = candidate.offline_accuracy,
                live_accuracy = current.offline_accuracy,
                "refusing to promote model with lower offline accuracy than the live model"
            );
            return Err(SentinelError::ClassifierError(format!(
                "candidate accuracy {:.4} is below live accuracy {:.4}",
                candidate.offline_accuracy, current.offline_accuracy
            )));
        }
    }
    store.promote_model(kind, candidate.id)
}

/// A compiled subcategory pattern ready to score a message.
enum CompiledMatcher {
    SubjectRegex(Regex),
    DomainKeyword(String),
}

pub struct SubcategoryTagger {
    patterns: Vec<(String, String, f64, CompiledMatcher)>,
}

impl SubcategoryTagger {
    /// Compile every stored pattern once at startup. Malformed regexes are
    /// skipped with a warning rather than aborting startup over one bad row.
    pub fn compile(patterns: &[SubcategoryPattern]) -> Self {
        let mut compiled = Vec::with_capacity(patterns.len());
        for p in patterns {
            let matcher = match p.kind {
                SubcategoryPatternKind::SubjectRegex => match Regex::new(&p.pattern) {
                    Ok(re) => CompiledMatcher::SubjectRegex(re),
                    Err(e) => {
                        warn!(pattern = %p.pattern, error = %e, "skipping malformed subcategory pattern");
                        continue;
                    }
                },
                SubcategoryPatternKind::DomainKeyword => CompiledMatcher::DomainKeyword(p.pattern.to_lowercase()),
            };
            compiled.push((p.category.clone(), p.subcategory.clone(), p.weight, matcher));
        }
        Self { patterns: compiled }
    }

    /// Emit a subcategory only when `category_confidence * pattern_weight`
    /// clears `floor`. Returns the highest-weighted match for `category`.
    pub fn tag(&self, category: &str, subject: &str, domain: &str, category_confidence: f64, floor: f64) -> Option<String> {
        let mut best: Option<(&str, f64)> = None;
        for (cat, subcategory, weight, matcher) in &self.patterns {
            if cat != category {
                continue;
            }
            let hit = match matcher {
                CompiledMatcher::SubjectRegex(re) => re.is_match(subject),
                CompiledMatcher::DomainKeyword(keyword) => domain.contains(keyword.as_str()),
            };
            if !hit {
                continue;
            }
            let combined = category_confidence * weight;
            if combined < floor {
                continue;
            }
            if best.map(|(_, w)| combined > w).unwrap_or(true) {
                best = Some((subcategory, combined));
            }
        }
        best.map(|(name, _)| name.to_string())
    }
}

/// Built-in patterns seeded on first startup, revisable afterward without a
/// code change since they live in `subcategory_patterns`.
pub fn default_subcategory_patterns() -> Vec<SubcategoryPattern> {
    vec![
        SubcategoryPattern {
            id: 0,
            category: "Commercial Spam".to_string(),
            subcategory: "pharma".to_string(),
            pattern: r"(?i)(viagra|cialis|pharmacy|prescription)".to_string(),
            weight: 0.9,
            kind: SubcategoryPatternKind::SubjectRegex,
        },
        SubcategoryPattern {
            id: 0,
            category: "Commercial Spam".to_string(),
            subcategory: "casino".to_string(),
            pattern: r"(?i)(casino|jackpot|slots|poker)".to_string(),
            weight: 0.9,
            kind: SubcategoryPatternKind::SubjectRegex,
        },
        SubcategoryPattern {
            id: 0,
            category: "Scams".to_string(),
            subcategory: "advance-fee".to_string(),
            pattern: r"(?i)(wire transfer|bank transfer|inheritance|beneficiary)".to_string(),
            weight: 0.95,
            kind: SubcategoryPatternKind::SubjectRegex,
        },
        SubcategoryPattern {
            id: 0,
            category: "Scams".to_string(),
            subcategory: "phishing".to_string(),
            pattern: r"(?i)(verify your account|suspended account|confirm your identity)".to_string(),
            weight: 0.9,
            kind: SubcategoryPatternKind::SubjectRegex,
        },
        SubcategoryPattern {
            id: 0,
            category: "Dangerous".to_string(),
            subcategory: "malware-delivery".to_string(),
            pattern: "zip".to_string(),
            weight: 0.6,
            kind: SubcategoryPatternKind::DomainKeyword,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, ClassifierTier, GeoRecord, PrimaryTaxonomy, ProcessedMessage, ProcessingStatus, Session, SessionMode, TaxonomyV2Category};

    fn seeded_store() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let account_id = store
            .insert_account(&Account {
                id: 0,
                email: "user@example.com".to_string(),
                provider_tag: "generic".to_string(),
                host: "imap.example.com".to_string(),
                port: 993,
                tls: true,
                username: "user@example.com".to_string(),
                credential_handle: "SENTINEL_MAIL_PW".to_string(),
                target_folders: vec!["INBOX".to_string()],
                batch_size_override: None,
                confidence_threshold_override: None,
            })
            .unwrap();
        (store, account_id)
    }

    fn persisted_message(store: &Store, account_id: i64) -> String {
        let session = Session::new(account_id, SessionMode::Process);
        let session_id = store.open_session(&session).unwrap();
        let msg = ProcessedMessage {
            id: 0,
            message_id: "<abc@local>".to_string(),
            uid: 1,
            folder: "INBOX".to_string(),
            sender: "a@b.example".to_string(),
            sender_domain: "b.example".to_string(),
            subject: "hi".to_string(),
            action: crate::models::Action::Deleted,
            reason: "tier1".to_string(),
            category: "Scams".to_string(),
            subcategory: None,
            confidence: 0.9,
            tier: ClassifierTier::Tier1,
            geo: GeoRecord::default(),
            processing_status: ProcessingStatus::Processed,
            retry_count: 0,
            started_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
            raw_headers: String::new(),
            session_id,
            taxonomy_v2_category: Some(TaxonomyV2Category::Scams),
            primary_taxonomy: PrimaryTaxonomy::Legacy,
            tier3_fallback: false,
        };
        store.upsert_processed_message(&msg).unwrap();
        msg.message_id
    }

    #[test]
    fn test_submit_feedback_and_retrain() {
        let (mut store, account_id) = seeded_store();
        let message_id = persisted_message(&store, account_id);

        submit_feedback(&store, &message_id, "Legitimate Marketing", Some(0.8), Some("false positive".to_string())).unwrap();
        let version = trigger_retrain(&mut store, ModelKind::NaiveBayes, "./models").unwrap();
        assert_eq!(version.training_set_size, 1);
        assert_eq!(store.unincorporated_feedback().unwrap().len(), 0);
    }

    #[test]
    fn test_promotion_refuses_regression() {
        let mut store = Store::open_in_memory().unwrap();
        let live_id = store
            .insert_model_version(&ModelVersion {
                id: 0,
                kind: ModelKind::NaiveBayes,
                artifact_handle: "models/nb-v1.bin".to_string(),
                training_set_size: 500,
                offline_accuracy: 0.90,
                created_at: chrono::Utc::now(),
                live: false,
            })
            .unwrap();
        store.promote_model(ModelKind::NaiveBayes, live_id).unwrap();

        let worse = ModelVersion {
            id: store
                .insert_model_version(&ModelVersion {
                    id: 0,
                    kind: ModelKind::NaiveBayes,
                    artifact_handle: "models/nb-v2.bin".to_string(),
                    training_set_size: 200,
                    offline_accuracy: 0.80,
                    created_at: chrono::Utc::now(),
                    live: false,
                })
                .unwrap(),
            kind: ModelKind::NaiveBayes,
            artifact_handle: "models/nb-v2.bin".to_string(),
            training_set_size: 200,
            offline_accuracy: 0.80,
            created_at: chrono::Utc::now(),
            live: false,
        };

        assert!(promote_model(&mut store, ModelKind::NaiveBayes, &worse).is_err());
        assert_eq!(store.live_model(ModelKind::NaiveBayes).unwrap().unwrap().id, live_id);
    }

    #[test]
    fn test_subcategory_tagger_picks_best_match() {
        let tagger = SubcategoryTagger::compile(&default_subcategory_patterns());
        let tag = tagger.tag("Scams", "Urgent wire transfer needed", "randommail.example", 0.9, 0.5);
        assert_eq!(tag, Some("advance-fee".to_string()));
    }

    #[test]
    fn test_subcategory_tagger_respects_floor() {
        let tagger = SubcategoryTagger::compile(&default_subcategory_patterns());
        let tag = tagger.tag("Scams", "Urgent wire transfer needed", "randommail.example", 0.9, 0.99);
        assert_eq!(tag, None);
    }
}
