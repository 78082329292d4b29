//! Profile cache + lifecycle management for DIP.
//!
//! `ProfileManager::get_profile` resolves a domain in three steps: the bounded
//! in-memory cache, then the durable store (refreshing stale profiles through
//! the analyzer), then a brand-new analysis that is persisted immediately.
//!
//! Writes for one domain are serialized in-process through a per-domain lock,
//! and every store write carries the next `revision` so concurrent writers in
//! other processes surface as conflicts instead of silent overwrites.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dip_adapters::{validate_analyzer_profile, AnalyzerError, PageAnalyzer};
use dip_core::{
    clamp_unit, normalize_domain, ChangedField, DomainError, DomainProfile, OptimalStrategy,
    PerformanceMetrics, ProfileChange, RefreshError, Scalability, SelectorHints,
    StrategyAttempt, UpdateKind, UpdateRecord,
};
use dip_storage::{ProfileStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "dip-manager";

const MAX_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict the entry whose last read (or insertion) is oldest.
    #[default]
    LeastRecentlyUsed,
    /// Evict the earliest-inserted entry regardless of reads.
    InsertionOrder,
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" | "least_recently_used" => Ok(Self::LeastRecentlyUsed),
            "fifo" | "insertion" | "insertion_order" => Ok(Self::InsertionOrder),
            other => Err(format!("unknown eviction policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_dip_age: Duration,
    pub min_confidence_threshold: f64,
    pub cache_enabled: bool,
    pub max_cache_size: usize,
    pub eviction_policy: EvictionPolicy,
    pub merge_fresh_weight: f64,
    pub high_usage_threshold: u64,
    pub high_usage_update_window: Duration,
    pub refresh_error_backoff: Duration,
    pub optimization_usage_threshold: u64,
    pub slow_extraction_ms: f64,
    pub expensive_cost_per_extraction: f64,
    pub preload_top: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_dip_age: Duration::from_secs(7 * 24 * 3600),
            min_confidence_threshold: 0.6,
            cache_enabled: true,
            max_cache_size: 100,
            eviction_policy: EvictionPolicy::default(),
            merge_fresh_weight: 0.7,
            high_usage_threshold: 10,
            high_usage_update_window: Duration::from_secs(24 * 3600),
            refresh_error_backoff: Duration::from_secs(3600),
            optimization_usage_threshold: 50,
            slow_extraction_ms: 5000.0,
            expensive_cost_per_extraction: 0.20,
            preload_top: 20,
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

#[derive(Debug, Clone, Default)]
pub struct ProfileOptions {
    pub initial_url: Option<String>,
    pub force_refresh: bool,
    pub max_age: Option<Duration>,
}

impl ProfileOptions {
    pub fn forced() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    InvalidDomain(#[from] DomainError),
    #[error("analysis failed for {domain}: {source}")]
    Analyzer {
        domain: String,
        #[source]
        source: AnalyzerError,
    },
    #[error("profile store failed for {domain}: {source}")]
    Store {
        domain: String,
        #[source]
        source: StoreError,
    },
}

impl ManagerError {
    fn store(domain: &str, source: StoreError) -> Self {
        Self::Store {
            domain: domain.to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    Forced,
    Expired,
    LowConfidence,
    HighUsageStale,
    RefreshErrorExpired,
}

/// Why `profile` should be re-analyzed now, if at all.
///
/// A refresh error younger than `refresh_error_backoff` suppresses every
/// reason except an explicit force.
pub fn refresh_reason(
    profile: &DomainProfile,
    options: &ProfileOptions,
    config: &ManagerConfig,
    now: DateTime<Utc>,
) -> Option<RefreshReason> {
    if options.force_refresh {
        return Some(RefreshReason::Forced);
    }
    if let Some(error) = &profile.metadata.last_refresh_error {
        if now.signed_duration_since(error.at) < to_chrono(config.refresh_error_backoff) {
            return None;
        }
        return Some(RefreshReason::RefreshErrorExpired);
    }

    let since_update = now.signed_duration_since(profile.last_updated);
    let max_age = to_chrono(options.max_age.unwrap_or(config.max_dip_age));
    if since_update > max_age {
        return Some(RefreshReason::Expired);
    }
    if profile.metadata.confidence_score < config.min_confidence_threshold {
        return Some(RefreshReason::LowConfidence);
    }
    if profile.management.usage_count > config.high_usage_threshold
        && since_update > to_chrono(config.high_usage_update_window)
    {
        return Some(RefreshReason::HighUsageStale);
    }
    None
}

pub fn should_refresh(
    profile: &DomainProfile,
    options: &ProfileOptions,
    config: &ManagerConfig,
    now: DateTime<Utc>,
) -> bool {
    refresh_reason(profile, options, config, now).is_some()
}

/// Differences between two generations of a profile, as recorded in the
/// update history.
pub fn detect_changes(old: &DomainProfile, new: &DomainProfile) -> Vec<ProfileChange> {
    let mut changes = Vec::new();

    if old.site_structure.framework != new.site_structure.framework {
        changes.push(ProfileChange {
            field: ChangedField::Framework,
            from: old.site_structure.framework.clone(),
            to: new.site_structure.framework.clone(),
        });
    }
    if old.site_structure.rendering_type != new.site_structure.rendering_type {
        changes.push(ProfileChange {
            field: ChangedField::RenderingType,
            from: Some(old.site_structure.rendering_type.as_str().to_string()),
            to: Some(new.site_structure.rendering_type.as_str().to_string()),
        });
    }
    if old.optimal_strategy.preferred != new.optimal_strategy.preferred {
        changes.push(ProfileChange {
            field: ChangedField::OptimalStrategy,
            from: Some(old.optimal_strategy.preferred.clone()),
            to: Some(new.optimal_strategy.preferred.clone()),
        });
    }
    if old.has_rate_limit() != new.has_rate_limit() {
        let label = |present: bool| Some(if present { "present" } else { "absent" }.to_string());
        changes.push(ProfileChange {
            field: ChangedField::RateLimit,
            from: label(old.has_rate_limit()),
            to: label(new.has_rate_limit()),
        });
    }
    changes
}

/// Successful attempts only, one per strategy id, best quality first.
pub fn merge_strategies(existing: &[StrategyAttempt], fresh: &[StrategyAttempt]) -> Vec<StrategyAttempt> {
    let mut by_id: BTreeMap<String, StrategyAttempt> = BTreeMap::new();
    for attempt in existing.iter().chain(fresh.iter()).filter(|a| a.success) {
        match by_id.get(&attempt.id) {
            Some(kept) if kept.quality_score >= attempt.quality_score => {}
            _ => {
                by_id.insert(attempt.id.clone(), attempt.clone());
            }
        }
    }
    let mut merged: Vec<StrategyAttempt> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        b.quality_score
            .partial_cmp(&a.quality_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    merged
}

fn merge_optimal(existing: &OptimalStrategy, fresh: &OptimalStrategy) -> OptimalStrategy {
    if fresh.confidence > existing.confidence {
        fresh.clone()
    } else {
        existing.clone()
    }
}

fn blend_metrics(existing: &PerformanceMetrics, fresh: &PerformanceMetrics, fresh_weight: f64) -> PerformanceMetrics {
    let w = clamp_unit(fresh_weight);
    let ewma = |old: f64, new: f64| w * new + (1.0 - w) * old;
    PerformanceMetrics {
        avg_extraction_time_ms: ewma(existing.avg_extraction_time_ms, fresh.avg_extraction_time_ms),
        success_rate: clamp_unit(ewma(existing.success_rate, fresh.success_rate)),
        quality_score: ewma(existing.quality_score, fresh.quality_score),
        reliability_score: ewma(existing.reliability_score, fresh.reliability_score),
        scalability: if fresh.scalability == Scalability::Unknown {
            existing.scalability
        } else {
            fresh.scalability
        },
    }
}

fn merge_selector_hints(existing: &SelectorHints, fresh: &SelectorHints) -> SelectorHints {
    let mut merged = existing.clone();
    merged.fields.extend(fresh.fields.clone());
    for (field, adaptive) in &fresh.adaptive {
        let keep_existing = merged
            .adaptive
            .get(field)
            .is_some_and(|kept| kept.confidence > adaptive.confidence);
        if !keep_existing {
            merged.adaptive.insert(field.clone(), adaptive.clone());
        }
    }
    merged
}

/// Fold a fresh analysis into an existing profile.
///
/// Identity (`id`, `created_at`, `domain`, `revision`) and feedback-loop data
/// come from `existing`; everything else defaults to `fresh`, except that the
/// optimal strategy only moves to a strictly more confident candidate and the
/// performance metrics are an exponentially weighted blend.
pub fn merge_profiles(
    existing: &DomainProfile,
    fresh: &DomainProfile,
    fresh_weight: f64,
    now: DateTime<Utc>,
) -> DomainProfile {
    let mut merged = fresh.clone();
    merged.domain = existing.domain.clone();
    merged.id = existing.id;
    merged.created_at = existing.created_at;
    merged.revision = existing.revision;
    merged.last_updated = now;

    merged.extraction_strategies =
        merge_strategies(&existing.extraction_strategies, &fresh.extraction_strategies);
    merged.optimal_strategy = merge_optimal(&existing.optimal_strategy, &fresh.optimal_strategy);
    merged.performance_metrics =
        blend_metrics(&existing.performance_metrics, &fresh.performance_metrics, fresh_weight);
    merged.site_structure.selector_hints = merge_selector_hints(
        &existing.site_structure.selector_hints,
        &fresh.site_structure.selector_hints,
    );

    merged.metadata.confidence_score = clamp_unit(fresh.metadata.confidence_score);
    merged.metadata.extraction_count = existing.metadata.extraction_count;
    merged.metadata.last_extraction = existing.metadata.last_extraction.clone();
    merged.metadata.update_count = existing.metadata.update_count + 1;
    merged.metadata.total_analysis_time_ms = existing
        .metadata
        .total_analysis_time_ms
        .saturating_add(fresh.metadata.total_analysis_time_ms);
    merged.metadata.last_refresh_error = None;

    let changes = detect_changes(existing, &merged);
    merged.management = existing.management.clone();
    merged.management.update_history.push(UpdateRecord {
        at: now,
        kind: UpdateKind::Refresh,
        duration_ms: fresh.metadata.total_analysis_time_ms,
        changes,
    });
    merged
}

#[derive(Debug, Clone)]
struct CacheEntry {
    profile: DomainProfile,
    inserted_at: DateTime<Utc>,
    inserted_seq: u64,
    accessed_seq: u64,
    hits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub policy: EvictionPolicy,
}

/// Bounded domain → profile map with hit/miss/eviction accounting.
///
/// Ordering uses a logical clock, so two operations in the same instant
/// still have a well-defined order.
#[derive(Debug)]
pub struct ProfileCache {
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
    policy: EvictionPolicy,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl ProfileCache {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            policy,
            clock: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up a profile inserted less than `max_age` ago. Expired entries
    /// are dropped and count as misses.
    pub fn get(
        &mut self,
        domain: &str,
        max_age: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Option<DomainProfile> {
        let seq = self.tick();
        let expired = match self.entries.get(domain) {
            Some(entry) => now.signed_duration_since(entry.inserted_at) >= max_age,
            None => {
                self.misses += 1;
                return None;
            }
        };
        if expired {
            self.entries.remove(domain);
            self.misses += 1;
            return None;
        }

        let entry = self.entries.get_mut(domain)?;
        entry.hits += 1;
        entry.accessed_seq = seq;
        self.hits += 1;
        Some(entry.profile.clone())
    }

    /// Insert or re-insert a profile. Returns the evicted domain, if any.
    pub fn insert(&mut self, profile: DomainProfile, now: DateTime<Utc>) -> Option<String> {
        if self.capacity == 0 {
            return None;
        }
        let seq = self.tick();
        if let Some(entry) = self.entries.get_mut(&profile.domain) {
            entry.profile = profile;
            entry.inserted_at = now;
            entry.inserted_seq = seq;
            entry.accessed_seq = seq;
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_one()
        } else {
            None
        };
        self.entries.insert(
            profile.domain.clone(),
            CacheEntry {
                profile,
                inserted_at: now,
                inserted_seq: seq,
                accessed_seq: seq,
                hits: 0,
            },
        );
        evicted
    }

    /// Swap the cached profile without touching its age or order.
    pub fn replace(&mut self, profile: DomainProfile) -> bool {
        match self.entries.get_mut(&profile.domain) {
            Some(entry) => {
                entry.profile = profile;
                true
            }
            None => false,
        }
    }

    fn evict_one(&mut self) -> Option<String> {
        let victim = match self.policy {
            EvictionPolicy::LeastRecentlyUsed => {
                self.entries.iter().min_by_key(|(_, e)| e.accessed_seq)
            }
            EvictionPolicy::InsertionOrder => self.entries.iter().min_by_key(|(_, e)| e.inserted_seq),
        }
        .map(|(domain, _)| domain.clone())?;

        self.entries.remove(&victim);
        self.evictions += 1;
        Some(victim)
    }

    pub fn remove(&mut self, domain: &str) -> bool {
        self.entries.remove(domain).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.entries.contains_key(domain)
    }

    pub fn hits_for(&self, domain: &str) -> Option<u64> {
        self.entries.get(domain).map(|e| e.hits)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        CacheStats {
            size: self.entries.len(),
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
            evictions: self.evictions,
            policy: self.policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    CacheHit,
    DatabaseHit,
    Created,
}

/// Ephemeral per-domain access statistics; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub domain: String,
    pub access_count: u64,
    pub cache_hits: u64,
    pub database_hits: u64,
    pub created: u64,
    pub first_access: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

impl UsageRecord {
    fn new(domain: &str, now: DateTime<Utc>) -> Self {
        Self {
            domain: domain.to_string(),
            access_count: 0,
            cache_hits: 0,
            database_hits: 0,
            created: 0,
            first_access: now,
            last_access: now,
        }
    }

    fn record(&mut self, kind: AccessKind, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_access = now;
        match kind {
            AccessKind::CacheHit => self.cache_hits += 1,
            AccessKind::DatabaseHit => self.database_hits += 1,
            AccessKind::Created => self.created += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationReason {
    SlowExtraction,
    HighCost,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationCandidate {
    pub domain: String,
    pub usage_count: u64,
    pub avg_extraction_time_ms: f64,
    pub estimated_cost: f64,
    pub reasons: Vec<OptimizationReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainFailure {
    pub domain: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub examined: usize,
    pub candidates: Vec<OptimizationCandidate>,
    pub preloaded: Vec<String>,
    pub errors: Vec<DomainFailure>,
}

type DomainLocks = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Exclusive access to one domain. Dropping it releases the lock and forgets
/// the domain's entry once no other task holds or awaits it.
struct DomainGuard<'a> {
    locks: &'a DomainLocks,
    domain: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DomainGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let current = matches!(locks.get(&self.domain), Some(lock) if Arc::ptr_eq(lock, &self.lock));
        // Remaining owners: the map and this guard.
        if current && Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.domain);
        }
    }
}

fn cache_key(domain: &str) -> String {
    domain.trim().to_ascii_lowercase()
}

pub struct ProfileManager {
    config: ManagerConfig,
    analyzer: Arc<dyn PageAnalyzer>,
    store: Arc<dyn ProfileStore>,
    cache: Mutex<ProfileCache>,
    usage: Mutex<HashMap<String, UsageRecord>>,
    domain_locks: DomainLocks,
}

impl ProfileManager {
    pub fn new(
        config: ManagerConfig,
        analyzer: Arc<dyn PageAnalyzer>,
        store: Arc<dyn ProfileStore>,
    ) -> Self {
        let cache = ProfileCache::new(config.max_cache_size, config.eviction_policy);
        Self {
            config,
            analyzer,
            store,
            cache: Mutex::new(cache),
            usage: Mutex::new(HashMap::new()),
            domain_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    async fn lock_domain(&self, domain: &str) -> DomainGuard<'_> {
        let lock = {
            let mut locks = self.domain_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(domain.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        DomainGuard {
            locks: &self.domain_locks,
            domain: domain.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn tracked_domain_locks(&self) -> usize {
        self.domain_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Resolve the live profile for `domain`: cache, then store (with
    /// refresh when stale), then a new analysis.
    ///
    /// A cached profile is served only while [`refresh_reason`] finds
    /// nothing wrong with it; otherwise the stored copy is refreshed.
    pub async fn get_profile(
        &self,
        domain: &str,
        options: &ProfileOptions,
    ) -> Result<DomainProfile, ManagerError> {
        let key = normalize_domain(domain)?;
        let domain = key.as_str();
        let _guard = self.lock_domain(domain).await;
        let now = Utc::now();

        if self.config.cache_enabled && !options.force_refresh {
            let max_age = to_chrono(options.max_age.unwrap_or(self.config.max_dip_age));
            let cached = self.cache.lock().await.get(domain, max_age, now);
            if let Some(profile) = cached {
                match refresh_reason(&profile, options, &self.config, now) {
                    None => {
                        self.record_usage(domain, AccessKind::CacheHit, now).await;
                        debug!(domain, "profile cache hit");
                        return Ok(profile);
                    }
                    Some(reason) => debug!(domain, ?reason, "cached profile is stale"),
                }
            }
        }

        let stored = self
            .store
            .get_profile(domain)
            .await
            .map_err(|source| ManagerError::store(domain, source))?;

        let (profile, kind) = match stored {
            Some(existing) => {
                let profile = match refresh_reason(&existing, options, &self.config, now) {
                    Some(reason) => {
                        info!(domain, ?reason, "refreshing profile");
                        self.refresh_locked(existing, options).await
                    }
                    None => existing,
                };
                (profile, AccessKind::DatabaseHit)
            }
            None => (self.create_locked(domain, options).await?, AccessKind::Created),
        };

        self.record_usage(domain, kind, now).await;
        self.cache_insert(profile.clone(), Utc::now()).await;
        Ok(profile)
    }

    pub fn should_refresh(&self, profile: &DomainProfile, options: &ProfileOptions) -> bool {
        should_refresh(profile, options, &self.config, Utc::now())
    }

    /// Re-analyze and merge. Never fails: analyzer errors are recorded on the
    /// returned profile as `last_refresh_error`.
    pub async fn refresh_profile(&self, existing: DomainProfile, options: &ProfileOptions) -> DomainProfile {
        let _guard = self.lock_domain(&existing.domain).await;
        let refreshed = self.refresh_locked(existing, options).await;
        self.cache_insert(refreshed.clone(), Utc::now()).await;
        refreshed
    }

    async fn analyze(
        &self,
        domain: &str,
        initial_url: Option<&str>,
    ) -> Result<DomainProfile, AnalyzerError> {
        let span = info_span!("analyze", domain);
        let profile = self
            .analyzer
            .create_profile(domain, initial_url)
            .instrument(span)
            .await?;
        validate_analyzer_profile(domain, &profile)?;
        Ok(profile)
    }

    async fn persist(&self, mut profile: DomainProfile) -> Result<DomainProfile, StoreError> {
        profile.revision += 1;
        self.store.save_profile(&profile).await?;
        Ok(profile)
    }

    async fn create_locked(
        &self,
        domain: &str,
        options: &ProfileOptions,
    ) -> Result<DomainProfile, ManagerError> {
        let started = Instant::now();
        let mut profile = self
            .analyze(domain, options.initial_url.as_deref())
            .await
            .map_err(|source| ManagerError::Analyzer {
                domain: domain.to_string(),
                source,
            })?;

        let now = Utc::now();
        profile.revision = 0;
        profile.extraction_strategies = merge_strategies(&[], &profile.extraction_strategies);
        profile.management.usage_count = 0;
        profile.management.last_accessed = None;
        if profile.metadata.total_analysis_time_ms == 0 {
            profile.metadata.total_analysis_time_ms = started.elapsed().as_millis() as u64;
        }
        profile.management.update_history.push(UpdateRecord {
            at: now,
            kind: UpdateKind::Created,
            duration_ms: profile.metadata.total_analysis_time_ms,
            changes: Vec::new(),
        });
        profile.clamp_scores();

        match self.persist(profile).await {
            Ok(saved) => {
                info!(
                    domain,
                    confidence = saved.metadata.confidence_score,
                    strategy = %saved.optimal_strategy.preferred,
                    "created profile"
                );
                Ok(saved)
            }
            Err(err) if err.is_conflict() => {
                warn!(domain, "profile created concurrently elsewhere; using stored copy");
                self.store
                    .get_profile(domain)
                    .await
                    .map_err(|source| ManagerError::store(domain, source))?
                    .ok_or_else(|| ManagerError::store(domain, err))
            }
            Err(source) => Err(ManagerError::store(domain, source)),
        }
    }

    async fn refresh_locked(&self, existing: DomainProfile, options: &ProfileOptions) -> DomainProfile {
        let domain = existing.domain.clone();
        let started = Instant::now();
        let analysis = self.analyze(&domain, options.initial_url.as_deref()).await;
        let now = Utc::now();

        let candidate = match analysis {
            Ok(mut fresh) => {
                if fresh.metadata.total_analysis_time_ms == 0 {
                    fresh.metadata.total_analysis_time_ms = started.elapsed().as_millis() as u64;
                }
                let merged = merge_profiles(&existing, &fresh, self.config.merge_fresh_weight, now);
                if let Some(update) = merged.management.update_history.last() {
                    debug!(domain, changes = update.changes.len(), "merged refreshed profile");
                }
                merged
            }
            Err(err) => {
                warn!(domain, error = %err, "profile refresh failed; serving existing profile");
                let mut annotated = existing;
                annotated.metadata.last_refresh_error = Some(RefreshError {
                    at: now,
                    message: err.to_string(),
                });
                annotated
            }
        };

        match self.persist(candidate.clone()).await {
            Ok(saved) => saved,
            Err(err) if err.is_conflict() => {
                warn!(domain, "concurrent profile write detected; serving stored profile");
                match self.store.get_profile(&domain).await {
                    Ok(Some(stored)) => stored,
                    _ => candidate,
                }
            }
            Err(err) => {
                warn!(domain, error = %err, "failed to persist refreshed profile");
                candidate
            }
        }
    }

    /// Read-modify-write of a persisted profile under the domain lock,
    /// re-reading and re-applying `update` on revision conflicts. Returns
    /// `None` when the domain has no profile.
    pub async fn apply_update<F>(
        &self,
        domain: &str,
        mut update: F,
    ) -> Result<Option<DomainProfile>, ManagerError>
    where
        F: FnMut(&mut DomainProfile) + Send,
    {
        let key = normalize_domain(domain)?;
        let domain = key.as_str();
        let _guard = self.lock_domain(domain).await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(mut profile) = self
                .store
                .get_profile(domain)
                .await
                .map_err(|source| ManagerError::store(domain, source))?
            else {
                return Ok(None);
            };

            update(&mut profile);
            match self.persist(profile).await {
                Ok(saved) => {
                    self.cache.lock().await.replace(saved.clone());
                    return Ok(Some(saved));
                }
                Err(err) if err.is_conflict() && attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(domain, attempt, "revision conflict; re-applying update");
                }
                Err(source) => return Err(ManagerError::store(domain, source)),
            }
        }
    }

    /// Upsert an externally supplied profile, continuing the stored revision
    /// sequence. The cache entry for the domain is dropped.
    pub async fn import_profile(&self, mut profile: DomainProfile) -> Result<DomainProfile, ManagerError> {
        let domain = normalize_domain(&profile.domain)?;
        profile.domain = domain.clone();
        profile.extraction_strategies = merge_strategies(&[], &profile.extraction_strategies);
        let _guard = self.lock_domain(&domain).await;

        let mut attempt = 0;
        let saved = loop {
            attempt += 1;
            let stored_revision = self
                .store
                .get_profile(&domain)
                .await
                .map_err(|source| ManagerError::store(&domain, source))?
                .map(|p| p.revision)
                .unwrap_or(0);

            let mut incoming = profile.clone();
            incoming.revision = stored_revision;
            incoming.clamp_scores();
            incoming.management.update_history.push(UpdateRecord {
                at: Utc::now(),
                kind: UpdateKind::Import,
                duration_ms: 0,
                changes: Vec::new(),
            });

            match self.persist(incoming).await {
                Ok(saved) => break saved,
                Err(err) if err.is_conflict() && attempt < MAX_WRITE_ATTEMPTS => continue,
                Err(source) => return Err(ManagerError::store(&domain, source)),
            }
        };

        self.cache.lock().await.remove(&domain);
        info!(domain = %domain, revision = saved.revision, "imported profile");
        Ok(saved)
    }

    /// Persisted profile for `domain`, bypassing cache and usage tracking.
    pub async fn load_profile(&self, domain: &str) -> Result<Option<DomainProfile>, ManagerError> {
        let domain = normalize_domain(domain)?;
        self.store
            .get_profile(&domain)
            .await
            .map_err(|source| ManagerError::store(&domain, source))
    }

    pub async fn list_domains(&self) -> Result<Vec<String>, StoreError> {
        self.store.list_domains().await
    }

    async fn cache_insert(&self, profile: DomainProfile, now: DateTime<Utc>) {
        if !self.config.cache_enabled {
            return;
        }
        if let Some(evicted) = self.cache.lock().await.insert(profile, now) {
            debug!(evicted = %evicted, "evicted profile from cache");
        }
    }

    async fn record_usage(&self, domain: &str, kind: AccessKind, now: DateTime<Utc>) {
        let mut usage = self.usage.lock().await;
        usage
            .entry(domain.to_string())
            .or_insert_with(|| UsageRecord::new(domain, now))
            .record(kind, now);
    }

    pub async fn usage_record(&self, domain: &str) -> Option<UsageRecord> {
        self.usage.lock().await.get(&cache_key(domain)).cloned()
    }

    /// Usage records, most accessed first (ties by domain).
    pub async fn usage_ranking(&self, limit: usize) -> Vec<UsageRecord> {
        let mut records: Vec<UsageRecord> = self.usage.lock().await.values().cloned().collect();
        records.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| a.domain.cmp(&b.domain))
        });
        records.truncate(limit);
        records
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }

    pub async fn is_cached(&self, domain: &str) -> bool {
        self.cache.lock().await.contains(&cache_key(domain))
    }

    pub async fn invalidate(&self, domain: &str) -> bool {
        self.cache.lock().await.remove(&cache_key(domain))
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    /// Maintenance pass: flag heavily used domains that are slow or costly,
    /// and warm the cache with the most used domains.
    pub async fn optimize_profiles(&self) -> OptimizationReport {
        let started_at = Utc::now();
        let ranking = self.usage_ranking(usize::MAX).await;
        let mut candidates = Vec::new();
        let mut errors = Vec::new();
        let mut examined = 0;

        for record in ranking
            .iter()
            .filter(|r| r.access_count > self.config.optimization_usage_threshold)
        {
            examined += 1;
            match self.store.get_profile(&record.domain).await {
                Ok(Some(profile)) => {
                    let avg_time = profile.performance_metrics.avg_extraction_time_ms;
                    let cost = profile.cost_profile.estimated_cost_per_extraction;
                    let mut reasons = Vec::new();
                    if avg_time > self.config.slow_extraction_ms {
                        reasons.push(OptimizationReason::SlowExtraction);
                    }
                    if cost > self.config.expensive_cost_per_extraction {
                        reasons.push(OptimizationReason::HighCost);
                    }
                    if !reasons.is_empty() {
                        candidates.push(OptimizationCandidate {
                            domain: record.domain.clone(),
                            usage_count: record.access_count,
                            avg_extraction_time_ms: avg_time,
                            estimated_cost: cost,
                            reasons,
                        });
                    }
                }
                Ok(None) => {}
                Err(err) => errors.push(DomainFailure {
                    domain: record.domain.clone(),
                    error: err.to_string(),
                }),
            }
        }

        let mut preloaded = Vec::new();
        if self.config.cache_enabled {
            for record in ranking.iter().take(self.config.preload_top) {
                if self.is_cached(&record.domain).await {
                    continue;
                }
                match self.store.get_profile(&record.domain).await {
                    Ok(Some(profile)) => {
                        self.cache_insert(profile, Utc::now()).await;
                        preloaded.push(record.domain.clone());
                    }
                    Ok(None) => {}
                    Err(err) => errors.push(DomainFailure {
                        domain: record.domain.clone(),
                        error: err.to_string(),
                    }),
                }
            }
        }

        let report = OptimizationReport {
            started_at,
            finished_at: Utc::now(),
            examined,
            candidates,
            preloaded,
            errors,
        };
        info!(
            examined = report.examined,
            candidates = report.candidates.len(),
            preloaded = report.preloaded.len(),
            errors = report.errors.len(),
            "profile optimization pass finished"
        );
        report
    }
}
