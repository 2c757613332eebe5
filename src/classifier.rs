//! Three-tier spam/ham classifier: a cheap Tier 1 rule+ensemble pass handles
//! the bulk of traffic, Tier 2 adds geographic risk scoring for messages
//! Tier 1 couldn't resolve confidently, and Tier 3 runs a bounded strategic
//! scorer for what's left. A taxonomy router then tags every verdict with
//! both the legacy category and the `taxonomy_v2` shadow category.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Result, SentinelError};
use crate::identity::ParsedIdentity;
use crate::models::{ClassifierTier, PrimaryTaxonomy, TaxonomyV2Category};

/// Everything the classifier needs about one message, independent of how it
/// was fetched.
#[derive(Debug, Clone)]
pub struct ClassifierInput {
    pub sender: String,
    pub sender_domain: String,
    pub subject: String,
    pub has_unsubscribe: bool,
    pub received_ips: Vec<String>,
    /// `true` when `Authentication-Results` reports a pass for SPF, DKIM,
    /// and DMARC. Tier 1's allow-list bypass requires this in addition to
    /// the domain being on the account's trusted list.
    pub auth_passed: bool,
    /// Count of the sender domain's prior `PRESERVED` messages, looked up by
    /// the caller before classifying. Backs Tier 1's vendor-relationship
    /// heuristic; defaults to 0 when the caller doesn't set it.
    pub prior_preserved_count: u32,
}

impl From<&ParsedIdentity> for ClassifierInput {
    fn from(identity: &ParsedIdentity) -> Self {
        Self {
            sender: identity.sender.clone(),
            sender_domain: identity.sender_domain.clone(),
            subject: identity.subject.clone(),
            has_unsubscribe: identity.has_list_unsubscribe,
            received_ips: identity.received_ips.clone(),
            auth_passed: identity.auth_passed,
            prior_preserved_count: 0,
        }
    }
}

/// The classifier's final word on a message.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub category: String,
    pub subcategory: Option<String>,
    pub confidence: f64,
    pub tier: ClassifierTier,
    pub reason: String,
    pub taxonomy_v2_category: Option<TaxonomyV2Category>,
    pub primary_taxonomy: PrimaryTaxonomy,
    pub tier3_fallback: bool,
    pub geo_country_code: Option<String>,
    pub geo_risk_score: Option<f64>,
}

/// Categories that `route_primary_taxonomy` and the controller treat as
/// "legitimate" under the legacy taxonomy. Everything else drives a real
/// `DELETE`; `taxonomy_v2_category` is recorded for analytics only and must
/// never influence this list.
static LEGITIMATE_CATEGORIES: &[&str] =
    &["Legitimate Marketing", "Newsletter", "Notification", "Personal", "Transactional"];

/// Whether the legacy (live) taxonomy considers `category` spam. This is the
/// only function allowed to drive the real delete/preserve action — the
/// `taxonomy_v2` shadow category must stay write-only for A/B analytics.
pub fn category_is_spam(category: &str) -> bool {
    !LEGITIMATE_CATEGORIES.contains(&category)
}

// ---------------------------------------------------------------------------
// Static lookup tables
// ---------------------------------------------------------------------------

static AUTOMATED_PATTERNS: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert("noreply", vec!["noreply@", "no-reply@", "donotreply@", "do-not-reply@"]);
    map.insert("notifications", vec!["notifications@", "notify@", "alerts@"]);
    map.insert("marketing", vec!["marketing@", "promo@", "promotions@", "deals@"]);
    map.insert("newsletter", vec!["newsletter@", "news@", "updates@"]);
    map.insert("automated", vec!["automated@", "auto@", "bot@", "system@"]);
    map
});

/// TLDs with disproportionate spam/abuse rates in abuse-desk telemetry. This
/// is a standalone Tier 1 short-circuit: a hit here is sufficient on its own,
/// it isn't diluted into the ensemble's weighted vote.
static TLD_BLACKLIST: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "cn", "ru", "tk", "ml", "ga", "cf", "cc", "pw", "top", "click", "bid", "win", "download",
        "party",
    ]
});

static DANGEROUS_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "wire transfer",
        "gift card",
        "verify your account immediately",
        "suspended account",
        "claim your prize",
        "bitcoin wallet",
        "urgent payment required",
        "social security number",
    ]
});

static ADULT_ABUSE_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec!["viagra", "casino", "xxx", "adult content", "hot singles", "enlarge"]
});

/// Subject phrases tied to a small set of named commercial-spam
/// subcategories specific enough to short-circuit Tier 1 without waiting on
/// the ensemble vote.
static COMMERCIAL_SPAM_PHRASES: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("vehicle warranty", "Auto warranty & insurance"),
        ("extended warranty", "Auto warranty & insurance"),
        ("auto warranty", "Auto warranty & insurance"),
        ("car warranty", "Auto warranty & insurance"),
        ("your vehicle's warranty", "Auto warranty & insurance"),
        ("auto insurance quote", "Auto warranty & insurance"),
        ("car insurance quote", "Auto warranty & insurance"),
    ]
});

/// Domain infixes associated with brand-impersonation registrations (a
/// generic service word wedged into a hyphenated domain). Feeds Tier 3's
/// business-legitimacy dimension.
static BUSINESS_IMPERSONATION_INFIXES: &[&str] =
    &["-protect", "-security", "-verify", "-support", "-alert", "-billing", "-account"];

/// A coarse network-reputation table distinct from Tier 2's country mapping,
/// keyed on prefixes associated with spam-sending infrastructure. Feeds Tier
/// 3's network dimension.
static NETWORK_RISK_TABLE: Lazy<Vec<(&'static str, f64)>> =
    Lazy::new(|| vec![("185.220.", 0.9), ("45.142.", 0.7), ("194.165.", 0.6), ("103.", 0.4)]);

struct SubjectPatterns {
    marketing: Regex,
    newsletter: Regex,
    notification: Regex,
    scam: Regex,
    urgency: Regex,
}

static SUBJECT_PATTERNS: Lazy<SubjectPatterns> = Lazy::new(|| SubjectPatterns {
    marketing: Regex::new(r"(?i)(sale|discount|offer|deal|promo|coupon|limited time|exclusive|save|% off)").unwrap(),
    newsletter: Regex::new(r"(?i)(newsletter|digest|weekly|monthly|roundup|bulletin)").unwrap(),
    notification: Regex::new(r"(?i)(notification|alert|reminder|security)").unwrap(),
    scam: Regex::new(r"(?i)(you.?ve won|congratulations you|claim now|act now|free money|no cost to you)").unwrap(),
    urgency: Regex::new(r"(?i)(expires? (soon|today)|act now|limited time|renew now|urgent action required|verify immediately)").unwrap(),
});

/// Known compound TLDs whose second-level label is part of the effective TLD
/// (`amazon.com.au`, not `com.au`, is the registrable domain).
static COMPOUND_TLDS: &[&str] = &[
    "com.au", "net.au", "org.au", "co.uk", "org.uk", "co.nz", "co.jp", "co.kr", "com.br",
    "co.in", "co.za", "com.cn", "com.hk", "com.sg", "com.tw", "co.id", "com.my", "co.th",
];

pub fn extract_main_domain(domain: &str) -> String {
    let parts: Vec<&str> = domain.split('.').collect();
    if parts.len() < 2 {
        return domain.to_string();
    }
    let tld_parts_count = if parts.len() >= 3 {
        let last_two = format!("{}.{}", parts[parts.len() - 2], parts[parts.len() - 1]);
        if COMPOUND_TLDS.contains(&last_two.as_str()) { 3 } else { 2 }
    } else {
        2
    };
    parts[parts.len().saturating_sub(tld_parts_count)..].join(".")
}

fn tld_of(domain: &str) -> Option<&str> {
    domain.rsplit('.').next()
}

/// Shannon entropy over the label preceding the main domain's TLD. High
/// entropy (random-looking strings like `xkqp7z2f.xyz`) correlates with
/// disposable/algorithmically generated spam domains.
fn shannon_entropy(label: &str) -> f64 {
    if label.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<char, u32> = HashMap::new();
    for c in label.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    let len = label.len() as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// A domain label is "gibberish" if it's reasonably long and its entropy
/// exceeds what ordinary pronounceable words/brand names produce.
fn is_gibberish_domain(domain: &str) -> bool {
    let main = extract_main_domain(domain);
    let label = main.split('.').next().unwrap_or("");
    label.len() >= 8 && shannon_entropy(label) > 3.6
}

// ---------------------------------------------------------------------------
// Tier 1: whitelist bypass, keyword/TLD rules, and a weighted model ensemble
// ---------------------------------------------------------------------------

/// A component vote in the Tier 1 ensemble. Real deployments back these with
/// trained artifacts loaded from `classifier.model_dir`; the scoring here is
/// a deterministic stand-in with the same weighted-vote shape so the
/// ensemble's aggregation and confidence semantics can be tested end to end.
pub trait EnsembleModel: Send + Sync {
    fn score(&self, input: &ClassifierInput) -> f64;
    fn weight(&self) -> f64;
    fn name(&self) -> &'static str;
}

pub struct NaiveBayesModel;
impl EnsembleModel for NaiveBayesModel {
    fn score(&self, input: &ClassifierInput) -> f64 {
        let subject = input.subject.to_lowercase();
        let hits = DANGEROUS_KEYWORDS.iter().filter(|k| subject.contains(*k)).count()
            + ADULT_ABUSE_KEYWORDS.iter().filter(|k| subject.contains(*k)).count();
        (hits as f64 * 0.35).min(1.0)
    }
    fn weight(&self) -> f64 {
        0.30
    }
    fn name(&self) -> &'static str {
        "naive_bayes"
    }
}

/// By the time the ensemble runs, the TLD-blacklist and gibberish-domain
/// checks have already been handled as standalone Tier 1 short-circuits, so
/// this model scores on structural mail features instead of re-deriving
/// them: presence of unsubscribe tooling and subject punctuation commonly
/// associated with scripted bulk sends.
pub struct RandomForestModel;
impl EnsembleModel for RandomForestModel {
    fn score(&self, input: &ClassifierInput) -> f64 {
        let mut score = 0.0;
        if input.has_unsubscribe {
            score += 0.15;
        }
        if input.subject.matches('!').count() >= 2 {
            score += 0.3;
        }
        if input.subject.chars().filter(|c| c.is_uppercase()).count() > input.subject.len() / 2
            && input.subject.len() > 6
        {
            score += 0.2;
        }
        score.min(1.0)
    }
    fn weight(&self) -> f64 {
        0.40
    }
    fn name(&self) -> &'static str {
        "random_forest"
    }
}

pub struct KeywordProcessorModel;
impl EnsembleModel for KeywordProcessorModel {
    fn score(&self, input: &ClassifierInput) -> f64 {
        let subject = input.subject.to_lowercase();
        if SUBJECT_PATTERNS.scam.is_match(&subject) {
            0.9
        } else if SUBJECT_PATTERNS.marketing.is_match(&subject) {
            0.4
        } else {
            0.05
        }
    }
    fn weight(&self) -> f64 {
        0.30
    }
    fn name(&self) -> &'static str {
        "keyword"
    }
}

pub struct Ensemble {
    models: Vec<Box<dyn EnsembleModel>>,
}

impl Default for Ensemble {
    fn default() -> Self {
        Self {
            models: vec![
                Box::new(NaiveBayesModel),
                Box::new(RandomForestModel),
                Box::new(KeywordProcessorModel),
            ],
        }
    }
}

impl Ensemble {
    /// Weighted vote across all component models, tightened by an agreement
    /// multiplier: when all three sub-classifiers land on the same side of
    /// 0.5, the result is pushed further from the midpoint; when only two
    /// agree the raw weighted average stands; when the panel is split down
    /// the middle (the plain average is exactly 0.5, so nobody "agrees")
    /// confidence is pulled back toward uncertain. Returns the combined
    /// spam-likelihood score in `[0.0, 1.0]`.
    pub fn vote(&self, input: &ClassifierInput) -> f64 {
        let scores: Vec<(f64, f64)> = self.models.iter().map(|m| (m.score(input), m.weight())).collect();
        let total_weight: f64 = scores.iter().map(|(_, w)| w).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        let base = scores.iter().map(|(s, w)| s * w).sum::<f64>() / total_weight;
        let spam_side = base >= 0.5;
        let agreeing = scores.iter().filter(|(s, _)| (*s >= 0.5) == spam_side).count();
        let multiplier = match agreeing {
            3 => 1.15,
            2 => 1.0,
            _ => 0.85,
        };
        let distance = (base - 0.5).abs() * multiplier;
        let signed = if spam_side { distance } else { -distance };
        (0.5 + signed).clamp(0.0, 1.0)
    }
}

pub struct Tier1Classifier {
    ensemble: Ensemble,
    pub confidence_threshold: f64,
    /// Per-account domains that bypass classification once their mail
    /// authenticates (SPF+DKIM+DMARC all pass), configured via
    /// `AccountConfig.trusted_domains` rather than a fixed brand-name table.
    trusted_domains: Vec<String>,
}

impl Tier1Classifier {
    pub fn new(confidence_threshold: f64, trusted_domains: Vec<String>) -> Self {
        Self {
            ensemble: Ensemble::default(),
            confidence_threshold,
            trusted_domains,
        }
    }

    /// Attempt a Tier 1 verdict. `None` means Tier 1 couldn't reach the
    /// confidence threshold and the message should escalate to Tier 2.
    pub fn classify(&self, input: &ClassifierInput) -> Option<Verdict> {
        let main_domain = extract_main_domain(&input.sender_domain);

        // 1. Authenticated mail from a domain this account explicitly trusts.
        if input.auth_passed && self.trusted_domains.iter().any(|d| d == &main_domain) {
            return Some(Verdict {
                category: "Legitimate Marketing".to_string(),
                subcategory: None,
                confidence: 0.99,
                tier: ClassifierTier::Tier1,
                reason: format!(
                    "sender domain {} passed SPF/DKIM/DMARC and is on the account's trusted domain list",
                    main_domain
                ),
                taxonomy_v2_category: Some(TaxonomyV2Category::LegitimateMarketing),
                primary_taxonomy: PrimaryTaxonomy::Legacy,
                tier3_fallback: false,
                geo_country_code: None,
                geo_risk_score: None,
            });
        }

        // 2. Dangerous/adult-abuse keyword lists.
        let subject_lower = input.subject.to_lowercase();
        if let Some(keyword) = DANGEROUS_KEYWORDS.iter().find(|k| subject_lower.contains(*k)) {
            return Some(Verdict {
                category: "Scams".to_string(),
                subcategory: Some("dangerous_keyword".to_string()),
                confidence: 0.97,
                tier: ClassifierTier::Tier1,
                reason: format!("subject contains dangerous keyword '{}'", keyword),
                taxonomy_v2_category: Some(TaxonomyV2Category::Dangerous),
                primary_taxonomy: PrimaryTaxonomy::Legacy,
                tier3_fallback: false,
                geo_country_code: None,
                geo_risk_score: None,
            });
        }
        if ADULT_ABUSE_KEYWORDS.iter().any(|k| subject_lower.contains(k)) {
            return Some(Verdict {
                category: "Dangerous".to_string(),
                subcategory: Some("adult_abuse".to_string()),
                confidence: 0.95,
                tier: ClassifierTier::Tier1,
                reason: "subject matches adult/abuse keyword list".to_string(),
                taxonomy_v2_category: Some(TaxonomyV2Category::Dangerous),
                primary_taxonomy: PrimaryTaxonomy::Legacy,
                tier3_fallback: false,
                geo_country_code: None,
                geo_risk_score: None,
            });
        }

        // Named commercial-spam categories: specific enough to short-circuit
        // ahead of the TLD/gibberish checks and the ensemble vote.
        if !self.trusted_domains.iter().any(|d| d == &main_domain) {
            if let Some((_, subcategory)) =
                COMMERCIAL_SPAM_PHRASES.iter().find(|(phrase, _)| subject_lower.contains(phrase))
            {
                return Some(Verdict {
                    category: "Commercial Spam".to_string(),
                    subcategory: Some(subcategory.to_string()),
                    confidence: 0.93,
                    tier: ClassifierTier::Tier1,
                    reason: format!("subject and sender domain match known commercial-spam category '{}'", subcategory),
                    taxonomy_v2_category: Some(TaxonomyV2Category::CommercialSpam),
                    primary_taxonomy: PrimaryTaxonomy::Legacy,
                    tier3_fallback: false,
                    geo_country_code: None,
                    geo_risk_score: None,
                });
            }
        }

        // 3. TLD blacklist: a standalone short-circuit, not an ensemble input.
        if let Some(tld) = tld_of(&main_domain) {
            if TLD_BLACKLIST.contains(&tld) {
                let scam_match = SUBJECT_PATTERNS.scam.is_match(&subject_lower);
                let (subcategory, confidence) =
                    if scam_match { ("Prize fraud", 0.97) } else { ("tld_blacklist", 0.90) };
                return Some(Verdict {
                    category: "Scams".to_string(),
                    subcategory: Some(subcategory.to_string()),
                    confidence,
                    tier: ClassifierTier::Tier1,
                    reason: format!(
                        "sender domain tld '.{}' is blacklisted{}",
                        tld,
                        if scam_match { " and subject matches known prize-fraud language" } else { "" }
                    ),
                    taxonomy_v2_category: Some(TaxonomyV2Category::Scams),
                    primary_taxonomy: PrimaryTaxonomy::Legacy,
                    tier3_fallback: false,
                    geo_country_code: None,
                    geo_risk_score: None,
                });
            }
        }

        // 4. Gibberish domain: a standalone short-circuit, not an ensemble input.
        if is_gibberish_domain(&input.sender_domain) {
            return Some(Verdict {
                category: "Commercial Spam".to_string(),
                subcategory: Some("gibberish_domain".to_string()),
                confidence: 0.90,
                tier: ClassifierTier::Tier1,
                reason: format!("sender domain '{}' has a high-entropy label typical of disposable spam domains", main_domain),
                taxonomy_v2_category: Some(TaxonomyV2Category::CommercialSpam),
                primary_taxonomy: PrimaryTaxonomy::Legacy,
                tier3_fallback: false,
                geo_country_code: None,
                geo_risk_score: None,
            });
        }

        // 5. Weighted model ensemble.
        let ensemble_score = self.ensemble.vote(input);
        if ensemble_score >= self.confidence_threshold {
            return Some(Verdict {
                category: "Commercial Spam".to_string(),
                subcategory: Some("ensemble".to_string()),
                confidence: ensemble_score,
                tier: ClassifierTier::Tier1,
                reason: format!("ensemble score {:.2} over threshold {:.2}", ensemble_score, self.confidence_threshold),
                taxonomy_v2_category: Some(TaxonomyV2Category::CommercialSpam),
                primary_taxonomy: PrimaryTaxonomy::Legacy,
                tier3_fallback: false,
                geo_country_code: None,
                geo_risk_score: None,
            });
        }

        // 6. Vendor-relationship: a sender domain with an established history
        // of preserved mail sending what reads like a routine digest.
        if input.prior_preserved_count >= 3
            && (SUBJECT_PATTERNS.newsletter.is_match(&subject_lower) || SUBJECT_PATTERNS.notification.is_match(&subject_lower))
        {
            return Some(Verdict {
                category: "Transactional".to_string(),
                subcategory: Some("digest".to_string()),
                confidence: 0.90,
                tier: ClassifierTier::Tier1,
                reason: format!(
                    "{} prior preserved messages from domain '{}' and subject matches a known digest/notification pattern",
                    input.prior_preserved_count, main_domain
                ),
                taxonomy_v2_category: Some(TaxonomyV2Category::LegitimateMarketing),
                primary_taxonomy: PrimaryTaxonomy::Legacy,
                tier3_fallback: false,
                geo_country_code: None,
                geo_risk_score: None,
            });
        }

        None
    }
}

// ---------------------------------------------------------------------------
// Tier 2: geographic risk scoring
// ---------------------------------------------------------------------------

/// Offline IP/country risk table, a static lookup rather than a MaxMind-style
/// GeoIP database or crate dependency.
static GEO_RISK_TABLE: Lazy<Vec<(&'static str, &'static str, f64)>> = Lazy::new(|| {
    vec![
        ("185.220.", "XX", 0.9), // known Tor exit-node range prefix
        ("45.142.", "RU", 0.75),
        ("103.", "CN", 0.5),
        ("185.", "NL", 0.3),
    ]
});

pub struct Tier2Classifier {
    pub confidence_threshold: f64,
}

impl Tier2Classifier {
    pub fn new(confidence_threshold: f64) -> Self {
        Self { confidence_threshold }
    }

    fn lookup_ip(ip: &str) -> Option<(&'static str, f64)> {
        GEO_RISK_TABLE
            .iter()
            .find(|(prefix, _, _)| ip.starts_with(prefix))
            .map(|(_, country, risk)| (*country, *risk))
    }

    /// Raw geographic assessment regardless of Tier 2's own confidence bar.
    /// Tier 3's geographic dimension reuses this even for messages that
    /// didn't clear Tier 2's threshold and fell through to Tier 3.
    pub fn assess(&self, input: &ClassifierInput) -> Option<(String, f64)> {
        input.received_ips.iter().find_map(|ip| Self::lookup_ip(ip)).map(|(c, r)| (c.to_string(), r))
    }

    pub fn classify(&self, input: &ClassifierInput) -> Option<Verdict> {
        let (country, risk) = self.assess(input)?;

        if risk >= self.confidence_threshold {
            Some(Verdict {
                category: "Scams".to_string(),
                subcategory: Some("geo_risk".to_string()),
                confidence: risk,
                tier: ClassifierTier::Tier2,
                reason: format!("relaying IP geolocated to high-risk region {} (risk {:.2})", country, risk),
                taxonomy_v2_category: Some(TaxonomyV2Category::Scams),
                primary_taxonomy: PrimaryTaxonomy::Legacy,
                tier3_fallback: false,
                geo_country_code: Some(country),
                geo_risk_score: Some(risk),
            })
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tier 3: bounded multi-dimensional strategic scorer
// ---------------------------------------------------------------------------

pub struct Tier3Classifier {
    pub confidence_threshold: f64,
    pub timeout: Duration,
    /// Simulated latency on the network-reputation lookup backing the
    /// "Network" dimension. Zero in production; a real deployment would
    /// replace this with an actual async reputation-service call whose
    /// latency this field stands in for during tests.
    network_lookup_delay: Duration,
}

impl Tier3Classifier {
    pub fn new(confidence_threshold: f64, timeout_secs: u64) -> Self {
        Self {
            confidence_threshold,
            timeout: Duration::from_secs(timeout_secs),
            network_lookup_delay: Duration::ZERO,
        }
    }

    /// Used in tests to exercise the Tier 3 timeout-fallback path by
    /// simulating a slow dimension lookup.
    pub fn with_simulated_network_latency(mut self, delay: Duration) -> Self {
        self.network_lookup_delay = delay;
        self
    }

    /// Runs the strategic scorer under a timeout. On timeout, the caller
    /// should commit the message with `tier3_fallback = true` and the best
    /// prior-tier verdict rather than block the session. `geo` carries Tier
    /// 2's raw assessment (country, risk) so the geographic dimension below
    /// doesn't re-derive it.
    pub async fn classify(&self, input: &ClassifierInput, geo: Option<(String, f64)>) -> Result<Verdict> {
        let scoring = self.score_strategic(input, geo);
        match tokio::time::timeout(self.timeout, scoring).await {
            Ok(verdict) => Ok(verdict),
            Err(_) => Err(SentinelError::ClassifierError(
                "tier3 strategic scorer exceeded timeout".to_string(),
            )),
        }
    }

    /// Five weighted dimensions: authentication, business legitimacy,
    /// content sophistication, geographic (reusing Tier 2's output), and
    /// network reputation.
    async fn score_strategic(&self, input: &ClassifierInput, geo: Option<(String, f64)>) -> Verdict {
        let subject_lower = input.subject.to_lowercase();
        let main_domain = extract_main_domain(&input.sender_domain);

        let authentication_risk = if input.auth_passed { 0.1 } else { 0.5 };

        let business_risk = if BUSINESS_IMPERSONATION_INFIXES.iter().any(|infix| main_domain.contains(infix)) {
            0.8
        } else {
            0.25
        };

        let content_risk = if SUBJECT_PATTERNS.urgency.is_match(&subject_lower) {
            0.8
        } else if SUBJECT_PATTERNS.scam.is_match(&subject_lower) {
            0.7
        } else {
            0.2
        };

        let geographic_risk = geo.as_ref().map(|(_, risk)| *risk).unwrap_or(0.15);

        if !self.network_lookup_delay.is_zero() {
            tokio::time::sleep(self.network_lookup_delay).await;
        }
        let network_risk = input
            .received_ips
            .iter()
            .find_map(|ip| NETWORK_RISK_TABLE.iter().find(|(prefix, _)| ip.starts_with(prefix)).map(|(_, risk)| *risk))
            .unwrap_or(0.2);

        let weighted = [
            (authentication_risk, 0.15),
            (business_risk, 0.30),
            (content_risk, 0.25),
            (geographic_risk, 0.15),
            (network_risk, 0.15),
        ];
        let total_weight: f64 = weighted.iter().map(|(_, w)| w).sum();
        let combined: f64 = weighted.iter().map(|(score, w)| score * w).sum::<f64>() / total_weight;

        let (category, subcategory, taxonomy) = if combined >= self.confidence_threshold {
            ("Commercial Spam", Some("tier3_strategic".to_string()), TaxonomyV2Category::CommercialSpam)
        } else if SUBJECT_PATTERNS.newsletter.is_match(&subject_lower) {
            ("Legitimate Marketing", Some("Newsletter".to_string()), TaxonomyV2Category::LegitimateMarketing)
        } else if SUBJECT_PATTERNS.notification.is_match(&subject_lower) {
            ("Legitimate Marketing", Some("Notification".to_string()), TaxonomyV2Category::LegitimateMarketing)
        } else {
            ("Personal", None, TaxonomyV2Category::LegitimateMarketing)
        };

        Verdict {
            category: category.to_string(),
            subcategory,
            confidence: combined,
            tier: ClassifierTier::Tier3,
            reason: format!(
                "strategic score {:.2} across 5 weighted dimensions (auth {:.2}, business {:.2}, content {:.2}, geo {:.2}, network {:.2})",
                combined, authentication_risk, business_risk, content_risk, geographic_risk, network_risk
            ),
            taxonomy_v2_category: Some(taxonomy),
            primary_taxonomy: PrimaryTaxonomy::Legacy,
            tier3_fallback: false,
            geo_country_code: geo.map(|(country, _)| country),
            geo_risk_score: Some(geographic_risk),
        }
    }
}

// ---------------------------------------------------------------------------
// Taxonomy router
// ---------------------------------------------------------------------------

/// Routes a verdict through the legacy/taxonomy_v2 split. `rollout_pct`
/// (0.0-1.0) deterministically assigns a fraction of messages, keyed by
/// message identity, to have `taxonomy_v2` as primary while both verdicts
/// are always recorded.
pub fn route_primary_taxonomy(message_id: &str, rollout_pct: f64) -> PrimaryTaxonomy {
    if rollout_pct <= 0.0 {
        return PrimaryTaxonomy::Legacy;
    }
    if rollout_pct >= 1.0 {
        return PrimaryTaxonomy::TaxonomyV2;
    }
    let digest = md5::compute(message_id.as_bytes());
    let bucket = (digest.0[0] as f64) / 255.0;
    if bucket < rollout_pct {
        PrimaryTaxonomy::TaxonomyV2
    } else {
        PrimaryTaxonomy::Legacy
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct ThreeTierClassifier {
    pub tier1: Tier1Classifier,
    pub tier2: Tier2Classifier,
    pub tier3: Tier3Classifier,
    pub taxonomy_v2_rollout_pct: f64,
}

impl ThreeTierClassifier {
    pub fn new(
        tier1_threshold: f64,
        tier3_threshold: f64,
        tier3_timeout_secs: u64,
        taxonomy_v2_rollout_pct: f64,
        trusted_domains: Vec<String>,
    ) -> Self {
        Self {
            tier1: Tier1Classifier::new(tier1_threshold, trusted_domains),
            tier2: Tier2Classifier::new(0.6),
            tier3: Tier3Classifier::new(tier3_threshold, tier3_timeout_secs),
            taxonomy_v2_rollout_pct,
        }
    }

    /// Full three-tier cascade for one message, finishing with taxonomy
    /// routing. `message_id` seeds the deterministic `taxonomy_v2` rollout.
    pub async fn classify(&self, message_id: &str, input: &ClassifierInput) -> Verdict {
        let verdict = if let Some(v) = self.tier1.classify(input) {
            v
        } else if let Some(v) = self.tier2.classify(input) {
            v
        } else {
            let geo = self.tier2.assess(input);
            match self.tier3.classify(input, geo).await {
                Ok(v) => v,
                Err(_) => {
                    // Timed out: fall back to the best Tier 1 guess rather than block.
                    let mut fallback = self.tier1.classify(input).unwrap_or(Verdict {
                        category: "Other".to_string(),
                        subcategory: None,
                        confidence: 0.0,
                        tier: ClassifierTier::Tier1,
                        reason: "tier3 timed out, no tier1 verdict available".to_string(),
                        taxonomy_v2_category: None,
                        primary_taxonomy: PrimaryTaxonomy::Legacy,
                        tier3_fallback: true,
                        geo_country_code: None,
                        geo_risk_score: None,
                    });
                    fallback.tier3_fallback = true;
                    fallback
                }
            }
        };

        let primary_taxonomy = route_primary_taxonomy(message_id, self.taxonomy_v2_rollout_pct);
        Verdict {
            primary_taxonomy,
            ..verdict
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(sender: &str, subject: &str) -> ClassifierInput {
        let domain = sender.split('@').nth(1).unwrap_or("").to_string();
        ClassifierInput {
            sender: sender.to_string(),
            sender_domain: domain,
            subject: subject.to_string(),
            has_unsubscribe: false,
            received_ips: vec![],
            auth_passed: false,
            prior_preserved_count: 0,
        }
    }

    fn trusted(domains: &[&str]) -> Vec<String> {
        domains.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn test_trusted_domain_bypass_requires_auth_pass() {
        let tier1 = Tier1Classifier::new(0.75, trusted(&["paypal.com"]));
        let mut msg = input("billing@paypal.com", "Your invoice is ready");
        msg.auth_passed = true;
        let verdict = tier1.classify(&msg).unwrap();
        assert_eq!(verdict.category, "Legitimate Marketing");
        assert!(verdict.confidence > 0.9);
    }

    #[test]
    fn test_trusted_domain_without_auth_pass_does_not_bypass() {
        let tier1 = Tier1Classifier::new(0.75, trusted(&["paypal.com"]));
        let msg = input("billing@paypal.com", "Your invoice is ready");
        let verdict = tier1.classify(&msg);
        assert!(verdict.is_none() || verdict.unwrap().category != "Legitimate Marketing");
    }

    #[test]
    fn test_domain_not_on_trusted_list_does_not_bypass() {
        let tier1 = Tier1Classifier::new(0.75, trusted(&["paypal.com"]));
        let mut msg = input("billing@stripe.com", "Your invoice is ready");
        msg.auth_passed = true;
        let verdict = tier1.classify(&msg);
        assert!(verdict.is_none() || verdict.unwrap().category != "Legitimate Marketing");
    }

    #[test]
    fn test_dangerous_keyword_forces_scam_verdict() {
        let tier1 = Tier1Classifier::new(0.75, Vec::new());
        let verdict = tier1
            .classify(&input("prince@randommail.example", "Urgent wire transfer needed"))
            .unwrap();
        assert_eq!(verdict.category, "Scams");
        assert_eq!(verdict.taxonomy_v2_category, Some(TaxonomyV2Category::Dangerous));
    }

    #[test]
    fn test_commercial_spam_phrase_short_circuits_at_tier1() {
        let tier1 = Tier1Classifier::new(0.75, Vec::new());
        let verdict = tier1
            .classify(&input("offers@dealmailer.example", "Your vehicle warranty is about to expire"))
            .unwrap();
        assert_eq!(verdict.category, "Commercial Spam");
        assert_eq!(verdict.subcategory.as_deref(), Some("Auto warranty & insurance"));
        assert!(verdict.confidence >= 0.92);
    }

    #[test]
    fn test_tld_blacklist_with_scam_keyword_yields_prize_fraud() {
        let tier1 = Tier1Classifier::new(0.75, Vec::new());
        let verdict = tier1
            .classify(&input("prince@zxqvbnmkpl.tk", "Congratulations! You've won the lottery"))
            .unwrap();
        assert_eq!(verdict.category, "Scams");
        assert_eq!(verdict.subcategory.as_deref(), Some("Prize fraud"));
        assert!(verdict.confidence >= 0.95);
    }

    #[test]
    fn test_gibberish_domain_short_circuits_standalone() {
        let tier1 = Tier1Classifier::new(0.75, Vec::new());
        let verdict = tier1.classify(&input("a@xqkz7bhpq2f.example", "quick update")).unwrap();
        assert_eq!(verdict.category, "Commercial Spam");
        assert_eq!(verdict.subcategory.as_deref(), Some("gibberish_domain"));
    }

    #[test]
    fn test_gibberish_domain_detected() {
        assert!(is_gibberish_domain("xqkz7bhpq2f.xyz"));
        assert!(!is_gibberish_domain("amazon.com"));
    }

    #[test]
    fn test_extract_main_domain_compound_tld() {
        assert_eq!(extract_main_domain("shop.amazon.com.au"), "amazon.com.au");
        assert_eq!(extract_main_domain("mail.google.com"), "google.com");
    }

    #[test]
    fn test_vendor_relationship_resolves_repeat_digest_as_transactional() {
        let tier1 = Tier1Classifier::new(0.75, Vec::new());
        let mut msg = input("digest@nextdoor.example", "Your weekly neighborhood digest");
        msg.prior_preserved_count = 5;
        let verdict = tier1.classify(&msg).unwrap();
        assert_eq!(verdict.category, "Transactional");
        assert_eq!(verdict.subcategory.as_deref(), Some("digest"));
    }

    #[test]
    fn test_vendor_relationship_requires_three_prior_preserved() {
        let tier1 = Tier1Classifier::new(0.75, Vec::new());
        let mut msg = input("digest@nextdoor.example", "Your weekly neighborhood digest");
        msg.prior_preserved_count = 2;
        assert!(tier1.classify(&msg).is_none());
    }

    #[test]
    fn test_ensemble_agreement_multiplier_tightens_when_all_models_concur() {
        let ensemble = Ensemble::default();
        let scam = input("prince@randommail.example", "claim now, act now, free money no cost to you!!");
        let score = ensemble.vote(&scam);
        assert!(score > 0.75, "expected a tightened high score, got {score}");
    }

    #[test]
    fn test_tier2_escalates_on_high_risk_ip() {
        let tier2 = Tier2Classifier::new(0.6);
        let mut msg = input("seller@random-shop.example", "Check out this deal");
        msg.received_ips = vec!["185.220.101.5".to_string()];
        let verdict = tier2.classify(&msg).unwrap();
        assert_eq!(verdict.tier, ClassifierTier::Tier2);
        assert!(verdict.geo_risk_score.unwrap() >= 0.6);
    }

    #[test]
    fn test_tier2_assess_returns_score_below_threshold_too() {
        let tier2 = Tier2Classifier::new(0.95);
        let mut msg = input("seller@random-shop.example", "Check out this deal");
        msg.received_ips = vec!["185.220.101.5".to_string()];
        assert!(tier2.classify(&msg).is_none());
        let (_, risk) = tier2.assess(&msg).unwrap();
        assert!(risk >= 0.6);
    }

    #[tokio::test]
    async fn test_tier3_completes_within_timeout() {
        let tier3 = Tier3Classifier::new(0.5, 5);
        let verdict = tier3.classify(&input("a@b.example", "hello"), None).await.unwrap();
        assert_eq!(verdict.tier, ClassifierTier::Tier3);
    }

    #[tokio::test]
    async fn test_tier3_reuses_tier2_geographic_output() {
        let tier3 = Tier3Classifier::new(0.5, 5);
        let verdict = tier3
            .classify(&input("a@b.example", "hello"), Some(("RU".to_string(), 0.75)))
            .await
            .unwrap();
        assert_eq!(verdict.geo_country_code.as_deref(), Some("RU"));
        assert_eq!(verdict.geo_risk_score, Some(0.75));
    }

    #[test]
    fn test_taxonomy_routing_is_deterministic() {
        let first = route_primary_taxonomy("<abc@local>", 0.5);
        let second = route_primary_taxonomy("<abc@local>", 0.5);
        assert_eq!(first, second);
    }

    #[test]
    fn test_taxonomy_routing_boundaries() {
        assert_eq!(route_primary_taxonomy("<x@y>", 0.0), PrimaryTaxonomy::Legacy);
        assert_eq!(route_primary_taxonomy("<x@y>", 1.0), PrimaryTaxonomy::TaxonomyV2);
    }

    #[test]
    fn test_category_is_spam_uses_legacy_taxonomy() {
        assert!(!category_is_spam("Legitimate Marketing"));
        assert!(!category_is_spam("Transactional"));
        assert!(category_is_spam("Scams"));
        assert!(category_is_spam("Commercial Spam"));
    }

    #[tokio::test]
    async fn test_full_cascade_scam_short_circuits_at_tier1() {
        let classifier = ThreeTierClassifier::new(0.75, 0.6, 5, 0.0, Vec::new());
        let verdict = classifier
            .classify("<scam@local>", &input("prince@randommail.example", "claim your prize now"))
            .await;
        assert_eq!(verdict.tier, ClassifierTier::Tier1);
        assert!(!verdict.tier3_fallback);
    }

    #[tokio::test]
    async fn test_full_cascade_tld_and_scam_keyword_is_immediate_prize_fraud_delete() {
        let classifier = ThreeTierClassifier::new(0.75, 0.6, 5, 0.0, Vec::new());
        let verdict = classifier
            .classify(
                "<tld-scam@local>",
                &input("prince@zxqvbnmkpl.tk", "Congratulations! You've won $1,000,000 - claim now"),
            )
            .await;
        assert_eq!(verdict.tier, ClassifierTier::Tier1);
        assert_eq!(verdict.category, "Scams");
        assert_eq!(verdict.subcategory.as_deref(), Some("Prize fraud"));
        assert!(verdict.confidence >= 0.95);
        assert!(!verdict.tier3_fallback);
    }
}
