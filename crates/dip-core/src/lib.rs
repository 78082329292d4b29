//! Core domain model for Domain Intelligence Profiles (DIP).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dip-core";

/// Schema version written into every profile this workspace produces.
pub const PROFILE_SCHEMA_VERSION: &str = "1.0";

pub const STRATEGY_STANDARD: &str = "standard";
pub const STRATEGY_ADAPTIVE: &str = "adaptive";
pub const STRATEGY_STEALTH: &str = "stealth";
pub const STRATEGY_BROWSER: &str = "browser";

const BASE_EXTRACTION_COST: f64 = 0.0001;
const STEALTH_SURCHARGE: f64 = 0.0004;
const JAVASCRIPT_SURCHARGE: f64 = 0.0002;

/// Estimated cost of one extraction with the given strategy.
///
/// Unknown strategies are priced at the base rate.
pub fn estimate_strategy_cost(strategy: &str) -> f64 {
    match strategy {
        STRATEGY_STEALTH => BASE_EXTRACTION_COST + STEALTH_SURCHARGE,
        STRATEGY_BROWSER => BASE_EXTRACTION_COST + JAVASCRIPT_SURCHARGE,
        _ => BASE_EXTRACTION_COST,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("url has no host: {0}")]
    MissingHost(String),
    #[error("invalid domain: {0:?}")]
    InvalidDomain(String),
}

/// Derive the profile key for a url: lowercase host, plus `:port` when the
/// port is not the scheme default. Bare hosts (`example.com/path`) are
/// accepted as https urls.
pub fn domain_from_url(raw: &str) -> Result<String, DomainError> {
    let trimmed = raw.trim();
    let parsed = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("https://{trimmed}"))
            .map_err(|err| DomainError::InvalidUrl {
                url: raw.to_string(),
                reason: err.to_string(),
            })?,
        Err(err) => {
            return Err(DomainError::InvalidUrl {
                url: raw.to_string(),
                reason: err.to_string(),
            })
        }
    };

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| DomainError::MissingHost(raw.to_string()))?
        .to_ascii_lowercase();
    let domain = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    };
    validate_domain(&domain)?;
    Ok(domain)
}

/// Check that `domain` is a plain host name with an optional `:port`.
pub fn validate_domain(domain: &str) -> Result<(), DomainError> {
    let invalid = || DomainError::InvalidDomain(domain.to_string());
    if domain.is_empty() || domain.len() > 253 {
        return Err(invalid());
    }

    let host = match domain.rsplit_once(':') {
        Some((host, port)) => {
            port.parse::<u16>().map_err(|_| invalid())?;
            host
        }
        None => domain,
    };

    let labels_ok = host.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if labels_ok {
        Ok(())
    } else {
        Err(invalid())
    }
}

/// The canonical profile key for a caller-supplied domain: trimmed and
/// lowercased, then validated. `Example.COM` and `example.com` share a key.
pub fn normalize_domain(domain: &str) -> Result<String, DomainError> {
    let key = domain.trim().to_ascii_lowercase();
    validate_domain(&key).map_err(|_| DomainError::InvalidDomain(domain.to_string()))?;
    Ok(key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderingType {
    Static,
    ServerRendered,
    ClientRendered,
    Hybrid,
    #[default]
    Unknown,
}

impl RenderingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::ServerRendered => "server_rendered",
            Self::ClientRendered => "client_rendered",
            Self::Hybrid => "hybrid",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scalability {
    High,
    Medium,
    Low,
    #[default]
    Unknown,
}

/// A selector that replaced an original selector which stopped matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveSelector {
    pub original: String,
    pub adapted: String,
    pub confidence: f64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SelectorHints {
    pub fields: BTreeMap<String, String>,
    pub adaptive: BTreeMap<String, AdaptiveSelector>,
}

impl SelectorHints {
    /// Effective selector per field; adapted selectors win over originals.
    pub fn effective(&self) -> BTreeMap<String, String> {
        let mut out = self.fields.clone();
        for (field, adaptive) in &self.adaptive {
            out.insert(field.clone(), adaptive.adapted.clone());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SiteStructure {
    pub rendering_type: RenderingType,
    pub framework: Option<String>,
    pub selector_hints: SelectorHints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub delay_ms: u64,
    pub max_requests_per_minute: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AccessConstraints {
    pub rate_limit: Option<RateLimit>,
    pub requires_auth: bool,
    pub disallowed_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyAttempt {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub quality_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimalStrategy {
    pub preferred: String,
    pub fallback: Option<String>,
    pub confidence: f64,
}

impl Default for OptimalStrategy {
    fn default() -> Self {
        Self {
            preferred: STRATEGY_STANDARD.to_string(),
            fallback: None,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PerformanceMetrics {
    pub avg_extraction_time_ms: f64,
    pub success_rate: f64,
    pub quality_score: f64,
    pub reliability_score: f64,
    pub scalability: Scalability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CostProfile {
    pub estimated_cost_per_extraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastExtraction {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: u64,
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshError {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProfileMetadata {
    pub confidence_score: f64,
    pub warnings: Vec<String>,
    pub extraction_count: u64,
    pub last_extraction: Option<LastExtraction>,
    pub update_count: u64,
    pub total_analysis_time_ms: u64,
    pub last_refresh_error: Option<RefreshError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Created,
    Refresh,
    Import,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangedField {
    Framework,
    RenderingType,
    OptimalStrategy,
    RateLimit,
}

/// One detected difference between two generations of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileChange {
    pub field: ChangedField,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub at: DateTime<Utc>,
    pub kind: UpdateKind,
    pub duration_ms: u64,
    #[serde(default)]
    pub changes: Vec<ProfileChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementInfo {
    pub created_by: String,
    pub usage_count: u64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub update_history: Vec<UpdateRecord>,
}

impl Default for ManagementInfo {
    fn default() -> Self {
        Self {
            created_by: "analyzer".to_string(),
            usage_count: 0,
            last_accessed: None,
            update_history: Vec::new(),
        }
    }
}

/// The per-domain record of extraction strategy, constraints, and history.
///
/// `revision` is the write counter stores compare-and-swap on; it is `0` for a
/// profile that has never been persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainProfile {
    pub domain: String,
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub version: String,
    #[serde(default)]
    pub revision: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub site_structure: SiteStructure,
    #[serde(default)]
    pub constraints: AccessConstraints,
    #[serde(default)]
    pub extraction_strategies: Vec<StrategyAttempt>,
    #[serde(default)]
    pub optimal_strategy: OptimalStrategy,
    #[serde(default)]
    pub performance_metrics: PerformanceMetrics,
    #[serde(default)]
    pub cost_profile: CostProfile,
    #[serde(default)]
    pub metadata: ProfileMetadata,
    #[serde(default)]
    pub management: ManagementInfo,
}

impl DomainProfile {
    pub fn new(domain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            domain: domain.into(),
            id: Uuid::new_v4(),
            version: PROFILE_SCHEMA_VERSION.to_string(),
            revision: 0,
            created_at: now,
            last_updated: now,
            site_structure: SiteStructure::default(),
            constraints: AccessConstraints::default(),
            extraction_strategies: Vec::new(),
            optimal_strategy: OptimalStrategy::default(),
            performance_metrics: PerformanceMetrics::default(),
            cost_profile: CostProfile::default(),
            metadata: ProfileMetadata::default(),
            management: ManagementInfo::default(),
        }
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }

    pub fn has_rate_limit(&self) -> bool {
        self.constraints.rate_limit.is_some()
    }

    pub fn framework_label(&self) -> &str {
        self.site_structure.framework.as_deref().unwrap_or("unknown")
    }

    /// Clamp every score that must live in [0,1].
    pub fn clamp_scores(&mut self) {
        self.metadata.confidence_score = clamp_unit(self.metadata.confidence_score);
        self.optimal_strategy.confidence = clamp_unit(self.optimal_strategy.confidence);
        self.performance_metrics.success_rate = clamp_unit(self.performance_metrics.success_rate);
    }
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Result of one extraction, reported back by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub success: bool,
    #[serde(alias = "duration")]
    pub duration_ms: u64,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
}

impl ExtractionOutcome {
    pub fn new(success: bool, duration_ms: u64) -> Self {
        Self {
            success,
            duration_ms,
            strategy: None,
            cost: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionStrategy {
    pub preferred: String,
    pub fallback: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionConstraints {
    pub rate_limit: Option<RateLimit>,
    pub requires_auth: bool,
    pub disallowed_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSite {
    pub framework: String,
    pub rendering_type: RenderingType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEstimates {
    pub avg_extraction_time_ms: f64,
    pub success_rate: f64,
    pub quality_score: f64,
    pub cost_per_extraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionMetadata {
    pub profile_id: Option<Uuid>,
    pub confidence: f64,
    pub age_ms: i64,
    pub is_fallback: bool,
    pub error: Option<String>,
}

/// Flattened, pipeline-facing view of a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionDecision {
    pub domain: Option<String>,
    pub strategy: DecisionStrategy,
    pub constraints: DecisionConstraints,
    pub selectors: BTreeMap<String, String>,
    pub site: DecisionSite,
    pub estimates: DecisionEstimates,
    pub metadata: DecisionMetadata,
}

impl ExtractionDecision {
    pub fn from_profile(profile: &DomainProfile, now: DateTime<Utc>) -> Self {
        Self {
            domain: Some(profile.domain.clone()),
            strategy: DecisionStrategy {
                preferred: profile.optimal_strategy.preferred.clone(),
                fallback: profile.optimal_strategy.fallback.clone(),
                confidence: profile.optimal_strategy.confidence,
            },
            constraints: DecisionConstraints {
                rate_limit: profile.constraints.rate_limit,
                requires_auth: profile.constraints.requires_auth,
                disallowed_paths: profile.constraints.disallowed_paths.clone(),
            },
            selectors: profile.site_structure.selector_hints.effective(),
            site: DecisionSite {
                framework: profile.framework_label().to_string(),
                rendering_type: profile.site_structure.rendering_type,
            },
            estimates: DecisionEstimates {
                avg_extraction_time_ms: profile.performance_metrics.avg_extraction_time_ms,
                success_rate: profile.performance_metrics.success_rate,
                quality_score: profile.performance_metrics.quality_score,
                cost_per_extraction: profile.cost_profile.estimated_cost_per_extraction,
            },
            metadata: DecisionMetadata {
                profile_id: Some(profile.id),
                confidence: profile.metadata.confidence_score,
                age_ms: profile.age_at(now).num_milliseconds(),
                is_fallback: false,
                error: None,
            },
        }
    }
}

/// Flat summary used by reporting tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedProfile {
    pub domain: String,
    pub id: Uuid,
    pub confidence: f64,
    pub optimal_strategy: String,
    pub framework: String,
    pub rendering_type: RenderingType,
    pub has_rate_limit: bool,
    pub estimated_cost: f64,
    pub avg_extraction_time_ms: f64,
    pub success_rate: f64,
}

impl From<&DomainProfile> for ExportedProfile {
    fn from(profile: &DomainProfile) -> Self {
        Self {
            domain: profile.domain.clone(),
            id: profile.id,
            confidence: profile.metadata.confidence_score,
            optimal_strategy: profile.optimal_strategy.preferred.clone(),
            framework: profile.framework_label().to_string(),
            rendering_type: profile.site_structure.rendering_type,
            has_rate_limit: profile.has_rate_limit(),
            estimated_cost: profile.cost_profile.estimated_cost_per_extraction,
            avg_extraction_time_ms: profile.performance_metrics.avg_extraction_time_ms,
            success_rate: profile.performance_metrics.success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn domain_is_lowercased_host_with_non_default_port() {
        assert_eq!(domain_from_url("https://Example.COM/a?b=1").unwrap(), "example.com");
        assert_eq!(domain_from_url("http://example.com:80/x").unwrap(), "example.com");
        assert_eq!(domain_from_url("http://localhost:8080/").unwrap(), "localhost:8080");
        assert_eq!(domain_from_url("shop.example.com/items").unwrap(), "shop.example.com");
    }

    #[test]
    fn urls_without_host_are_rejected() {
        assert!(domain_from_url("").is_err());
        assert!(matches!(
            domain_from_url("mailto:someone@example.com"),
            Err(DomainError::MissingHost(_))
        ));
    }

    #[test]
    fn domain_validation_rules() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("a-b.example.com:8443").is_ok());
        assert!(validate_domain("").is_err());
        assert!(validate_domain("-bad.com").is_err());
        assert!(validate_domain("bad..com").is_err());
        assert!(validate_domain("spaces are.com").is_err());
        assert!(validate_domain("example.com:notaport").is_err());
    }

    #[test]
    fn normalized_domain_matches_url_derived_key() {
        let from_url = domain_from_url("https://Shop.Example.COM:8443/cart").unwrap();
        assert_eq!(normalize_domain(" Shop.Example.COM:8443 ").unwrap(), from_url);
        assert_eq!(normalize_domain("example.com").unwrap(), "example.com");
        assert!(matches!(
            normalize_domain("Bad Domain"),
            Err(DomainError::InvalidDomain(d)) if d == "Bad Domain"
        ));
    }

    #[test]
    fn minimal_payload_deserializes_with_defaults() {
        let profile: DomainProfile =
            serde_json::from_str(r#"{"domain":"example.com","version":"1.0"}"#).unwrap();
        assert_eq!(profile.domain, "example.com");
        assert_eq!(profile.revision, 0);
        assert_eq!(profile.optimal_strategy.preferred, STRATEGY_STANDARD);
        assert_eq!(profile.site_structure.rendering_type, RenderingType::Unknown);
        assert_eq!(profile.management.usage_count, 0);
        assert!(profile.extraction_strategies.is_empty());
    }

    #[test]
    fn outcome_accepts_duration_alias() {
        let outcome: ExtractionOutcome =
            serde_json::from_str(r#"{"success":true,"duration":1000}"#).unwrap();
        assert_eq!(outcome, ExtractionOutcome::new(true, 1000));
    }

    #[test]
    fn decision_flattens_profile() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let mut profile = DomainProfile::new("example.com");
        profile.created_at = created;
        profile.site_structure.framework = Some("nextjs".into());
        profile.site_structure.rendering_type = RenderingType::Hybrid;
        profile
            .site_structure
            .selector_hints
            .fields
            .insert("title".into(), "h1".into());
        profile.site_structure.selector_hints.adaptive.insert(
            "title".into(),
            AdaptiveSelector {
                original: "h1".into(),
                adapted: "h1.product-title".into(),
                confidence: 0.95,
                last_updated: created,
            },
        );
        profile.constraints.rate_limit = Some(RateLimit {
            delay_ms: 1000,
            max_requests_per_minute: 30,
        });
        profile.metadata.confidence_score = 0.8;

        let decision = ExtractionDecision::from_profile(&profile, created + chrono::Duration::seconds(2));
        assert_eq!(decision.metadata.age_ms, 2000);
        assert_eq!(decision.metadata.profile_id, Some(profile.id));
        assert!(!decision.metadata.is_fallback);
        assert_eq!(decision.site.framework, "nextjs");
        assert_eq!(decision.selectors.get("title").map(String::as_str), Some("h1.product-title"));
        assert_eq!(decision.constraints.rate_limit.map(|r| r.delay_ms), Some(1000));
    }

    #[test]
    fn export_summary_reports_rate_limit_presence() {
        let mut profile = DomainProfile::new("example.com");
        let exported = ExportedProfile::from(&profile);
        assert!(!exported.has_rate_limit);
        assert_eq!(exported.framework, "unknown");

        profile.constraints.rate_limit = Some(RateLimit {
            delay_ms: 500,
            max_requests_per_minute: 60,
        });
        assert!(ExportedProfile::from(&profile).has_rate_limit);
    }

    #[test]
    fn strategy_cost_table() {
        assert!((estimate_strategy_cost(STRATEGY_STANDARD) - 0.0001).abs() < 1e-12);
        assert!((estimate_strategy_cost(STRATEGY_STEALTH) - 0.0005).abs() < 1e-12);
        assert!((estimate_strategy_cost(STRATEGY_BROWSER) - 0.0003).abs() < 1e-12);
        assert!((estimate_strategy_cost("mystery") - 0.0001).abs() < 1e-12);
    }

    #[test]
    fn clamp_scores_keeps_unit_interval() {
        let mut profile = DomainProfile::new("example.com");
        profile.metadata.confidence_score = 1.7;
        profile.optimal_strategy.confidence = -0.2;
        profile.performance_metrics.success_rate = f64::NAN;
        profile.clamp_scores();
        assert_eq!(profile.metadata.confidence_score, 1.0);
        assert_eq!(profile.optimal_strategy.confidence, 0.0);
        assert_eq!(profile.performance_metrics.success_rate, 0.0);
    }
}
