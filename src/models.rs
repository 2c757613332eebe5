//! Core data model: accounts, sessions, processed messages, override flags,
//! caches, feedback, and model versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a session was run: classify-and-record only, or classify-and-act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Preview,
    Process,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Preview => "preview",
            SessionMode::Process => "process",
        }
    }
}

/// Lifecycle state of a `ProcessedMessage` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Preview,
    Processed,
    Flagged,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Preview => "preview",
            ProcessingStatus::Processed => "processed",
            ProcessingStatus::Flagged => "flagged",
            ProcessingStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "preview" => Some(ProcessingStatus::Preview),
            "processed" => Some(ProcessingStatus::Processed),
            "flagged" => Some(ProcessingStatus::Flagged),
            "error" => Some(ProcessingStatus::Error),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (*self, next),
            (Preview, Processed)
                | (Preview, Flagged)
                | (Preview, Error)
                | (Processed, Error)
                | (Flagged, Error)
                | (Error, Preview)
                | (Error, Processed)
                | (Flagged, Preview) // explicit operator unflag
        )
    }
}

/// The disposition applied (or planned) for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Deleted,
    Preserved,
    Skipped,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Deleted => "DELETED",
            Action::Preserved => "PRESERVED",
            Action::Skipped => "SKIPPED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DELETED" => Some(Action::Deleted),
            "PRESERVED" => Some(Action::Preserved),
            "SKIPPED" => Some(Action::Skipped),
            _ => None,
        }
    }
}

/// Override flag kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    Protect,
    Delete,
    Research,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::Protect => "PROTECT",
            FlagType::Delete => "DELETE",
            FlagType::Research => "RESEARCH",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PROTECT" => Some(FlagType::Protect),
            "DELETE" => Some(FlagType::Delete),
            "RESEARCH" => Some(FlagType::Research),
            _ => None,
        }
    }
}

/// Result of evaluating all flags for a `message_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagEvaluation {
    VetoDelete,
    ForceDelete,
    AdvisoryResearch,
    None,
}

/// Which classification layer ultimately produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierTier {
    Tier1,
    Tier2,
    Tier3,
}

impl ClassifierTier {
    pub fn as_u8(&self) -> u8 {
        match self {
            ClassifierTier::Tier1 => 1,
            ClassifierTier::Tier2 => 2,
            ClassifierTier::Tier3 => 3,
        }
    }
}

/// Legacy (13+ category) taxonomy. Kept as an open string-backed category name
/// rather than a closed enum: the legacy taxonomy is explicitly being phased
/// out in favor of `TaxonomyV2Category`, and freezing it into an enum would
/// fight the routing design rather than support it. `subcategory_patterns`
/// rows reference category names the same way.
pub type LegacyCategory = String;

/// The four-category `taxonomy_v2` scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxonomyV2Category {
    Dangerous,
    CommercialSpam,
    Scams,
    LegitimateMarketing,
}

impl TaxonomyV2Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxonomyV2Category::Dangerous => "Dangerous",
            TaxonomyV2Category::CommercialSpam => "Commercial Spam",
            TaxonomyV2Category::Scams => "Scams",
            TaxonomyV2Category::LegitimateMarketing => "Legitimate Marketing",
        }
    }
}

/// Which taxonomy path actually drove the disposition for a message.
/// Both verdicts are recorded regardless of which one is primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryTaxonomy {
    Legacy,
    TaxonomyV2,
}

/// A configured mail account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub email: String,
    pub provider_tag: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: String,
    /// Opaque handle into the credential store; never the raw secret.
    pub credential_handle: String,
    pub target_folders: Vec<String>,
    pub batch_size_override: Option<u32>,
    pub confidence_threshold_override: Option<f64>,
}

/// One bounded execution of the processing controller against one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub account_id: i64,
    pub mode: SessionMode,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub examined: u64,
    pub deleted: u64,
    pub preserved: u64,
    pub skipped: u64,
    pub errored: u64,
    /// category name -> count
    pub categories: std::collections::HashMap<String, u64>,
}

impl Session {
    pub fn new(account_id: i64, mode: SessionMode) -> Self {
        Self {
            id: 0,
            account_id,
            mode,
            started_at: Utc::now(),
            ended_at: None,
            examined: 0,
            deleted: 0,
            preserved: 0,
            skipped: 0,
            errored: 0,
            categories: std::collections::HashMap::new(),
        }
    }

    /// Testable property: `deleted + preserved + skipped + errored = examined`.
    pub fn counters_consistent(&self) -> bool {
        self.deleted + self.preserved + self.skipped + self.errored == self.examined
    }

    pub fn record(&mut self, action: Action) {
        self.examined += 1;
        match action {
            Action::Deleted => self.deleted += 1,
            Action::Preserved => self.preserved += 1,
            Action::Skipped => self.skipped += 1,
        }
    }

    pub fn record_error(&mut self) {
        self.examined += 1;
        self.errored += 1;
    }

    pub fn close(&mut self) {
        self.ended_at = Some(Utc::now());
    }
}

/// Geographic metadata attached to a processed message (Tier 2 output).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoRecord {
    pub ip: Option<String>,
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub risk_score: Option<f64>,
    pub detection_method: Option<String>,
}

/// The single source of truth for a processed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub id: i64,
    pub message_id: String,
    pub uid: u32,
    pub folder: String,
    pub sender: String,
    pub sender_domain: String,
    pub subject: String,
    pub action: Action,
    pub reason: String,
    pub category: LegacyCategory,
    pub subcategory: Option<String>,
    pub confidence: f64,
    pub tier: ClassifierTier,
    pub geo: GeoRecord,
    pub processing_status: ProcessingStatus,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Raw header blob, kept for audit/debugging; never the message body.
    pub raw_headers: String,
    pub session_id: i64,
    /// Shadow `taxonomy_v2` verdict, recorded alongside the legacy verdict
    /// regardless of which one is primary.
    pub taxonomy_v2_category: Option<TaxonomyV2Category>,
    pub primary_taxonomy: PrimaryTaxonomy,
    /// Set when Tier 3 timed out and the row was committed with the Tier 1 verdict.
    pub tier3_fallback: bool,
}

/// An operator-set marker on a `message_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideFlag {
    pub id: i64,
    pub message_id: String,
    pub flag_type: FlagType,
    pub reason: String,
    pub account_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Reputation/geo metadata cached per domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainCacheEntry {
    pub domain: String,
    pub reputation: String,
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub risk_score: f64,
    pub registrar: Option<String>,
    pub last_analyzed: DateTime<Utc>,
}

/// Offline GeoIP table entry, distinct from `DomainCacheEntry` (IP/range-keyed, not domain-keyed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoCacheEntry {
    pub ip_or_range: String,
    pub country_code: String,
    pub risk_score: f64,
    pub source: String,
    pub cached_at: DateTime<Utc>,
}

/// A user correction to a classifier verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: i64,
    pub processed_message_id: i64,
    pub original_category: LegacyCategory,
    pub corrected_category: LegacyCategory,
    pub confidence_rating: Option<f64>,
    pub comment: Option<String>,
    pub incorporated: bool,
    pub created_at: DateTime<Utc>,
}

/// The kind of model a `ModelVersion` row holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    NaiveBayes,
    RandomForest,
    Keyword,
    Ensemble,
    TaxonomyV2,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::NaiveBayes => "naive_bayes",
            ModelKind::RandomForest => "random_forest",
            ModelKind::Keyword => "keyword",
            ModelKind::Ensemble => "ensemble",
            ModelKind::TaxonomyV2 => "taxonomy_v2",
        }
    }
}

/// A trained (or promoted) model artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: i64,
    pub kind: ModelKind,
    /// Opaque handle to the artifact (file path, blob id); never re-read partially.
    pub artifact_handle: String,
    pub training_set_size: u64,
    pub offline_accuracy: f64,
    pub created_at: DateTime<Utc>,
    pub live: bool,
}

/// A `{pattern, weight, kind}` row backing the subcategory tagger, loaded from
/// the database so patterns can be revised without a code change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubcategoryPattern {
    pub id: i64,
    pub category: String,
    pub subcategory: String,
    pub pattern: String,
    pub weight: f64,
    pub kind: SubcategoryPatternKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubcategoryPatternKind {
    SubjectRegex,
    DomainKeyword,
}

/// Per-session timing/throughput sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub id: i64,
    pub session_id: i64,
    pub examined_per_sec: f64,
    pub tier1_avg_ms: f64,
    pub tier2_avg_ms: f64,
    pub tier3_avg_ms: f64,
    pub tier3_share: f64,
    pub recorded_at: DateTime<Utc>,
}
