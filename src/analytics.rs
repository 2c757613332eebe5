//! Analytics aggregation: folds the reporting view (`processed`/`flagged`
//! rows only, per the persistence layer's contract) into the counters an
//! operator or dashboard actually wants, without re-deriving them from raw
//! SQL at every call site.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Action, ClassifierTier, TaxonomyV2Category};
use crate::persistence::Store;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalyticsSnapshot {
    pub total: u64,
    pub deleted: u64,
    pub preserved: u64,
    pub skipped: u64,
    pub by_category: HashMap<String, u64>,
    pub by_tier: HashMap<String, u64>,
    /// Messages where the live ensemble's disposition and the shadow
    /// `taxonomy_v2` disposition disagreed on spam/not-spam.
    pub taxonomy_v2_divergences: u64,
    /// Share of rows whose verdict came from Tier 3 (`tier3_fallback` or
    /// `tier == Tier3`), tracked against the configured budget.
    pub tier3_share: f64,
}

/// Aggregate every reporting-visible row in `range` (inclusive, `None` means
/// unbounded) into one snapshot.
pub fn get_analytics(store: &Store, range: Option<(DateTime<Utc>, DateTime<Utc>)>) -> Result<AnalyticsSnapshot> {
    let rows = store.report_rows(range)?;
    let mut snapshot = AnalyticsSnapshot::default();
    let mut tier3_count: u64 = 0;

    for row in &rows {
        snapshot.total += 1;
        match row.action {
            Action::Deleted => snapshot.deleted += 1,
            Action::Preserved => snapshot.preserved += 1,
            Action::Skipped => snapshot.skipped += 1,
        }
        *snapshot.by_category.entry(row.category.clone()).or_insert(0) += 1;
        let tier_key = match row.tier {
            ClassifierTier::Tier1 => "tier1",
            ClassifierTier::Tier2 => "tier2",
            ClassifierTier::Tier3 => "tier3",
        };
        *snapshot.by_tier.entry(tier_key.to_string()).or_insert(0) += 1;
        if row.tier == ClassifierTier::Tier3 || row.tier3_fallback {
            tier3_count += 1;
        }
        if let Some(v2) = row.taxonomy_v2_category {
            let legacy_is_spam = row.action == Action::Deleted;
            let v2_is_spam = v2 != TaxonomyV2Category::LegitimateMarketing;
            if legacy_is_spam != v2_is_spam {
                snapshot.taxonomy_v2_divergences += 1;
            }
        }
    }

    snapshot.tier3_share = if snapshot.total > 0 {
        tier3_count as f64 / snapshot.total as f64
    } else {
        0.0
    };

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, GeoRecord, PrimaryTaxonomy, ProcessedMessage, ProcessingStatus, Session, SessionMode};

    fn row(
        store: &Store,
        session_id: i64,
        message_id: &str,
        status: ProcessingStatus,
        action: Action,
        tier: ClassifierTier,
        v2: Option<TaxonomyV2Category>,
    ) {
        store
            .upsert_processed_message(&ProcessedMessage {
                id: 0,
                message_id: message_id.to_string(),
                uid: 1,
                folder: "INBOX".to_string(),
                sender: "a@b.example".to_string(),
                sender_domain: "b.example".to_string(),
                subject: "hi".to_string(),
                action,
                reason: "test".to_string(),
                category: "Scams".to_string(),
                subcategory: None,
                confidence: 0.9,
                tier,
                geo: GeoRecord::default(),
                processing_status: status,
                retry_count: 0,
                started_at: chrono::Utc::now(),
                completed_at: Some(chrono::Utc::now()),
                raw_headers: String::new(),
                session_id,
                taxonomy_v2_category: v2,
                primary_taxonomy: PrimaryTaxonomy::Legacy,
                tier3_fallback: false,
            })
            .unwrap();
    }

    #[test]
    fn test_analytics_excludes_preview_rows() {
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
        let session_id = store.open_session(&Session::new(account_id, SessionMode::Process)).unwrap();

        row(&store, session_id, "<a@local>", ProcessingStatus::Processed, Action::Deleted, ClassifierTier::Tier1, Some(TaxonomyV2Category::Scams));
        row(&store, session_id, "<b@local>", ProcessingStatus::Preview, Action::Preserved, ClassifierTier::Tier1, None);

        let snapshot = get_analytics(&store, None).unwrap();
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.deleted, 1);
    }

    #[test]
    fn test_analytics_counts_taxonomy_divergence() {
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
        let session_id = store.open_session(&Session::new(account_id, SessionMode::Process)).unwrap();

        row(&store, session_id, "<a@local>", ProcessingStatus::Processed, Action::Preserved, ClassifierTier::Tier1, Some(TaxonomyV2Category::Scams));

        let snapshot = get_analytics(&store, None).unwrap();
        assert_eq!(snapshot.taxonomy_v2_divergences, 1);
    }
}
