//! Quota Engine (C8) — multi-layer rate limiting and quota degradation
//! (spec §4.8). Owns rate-limit state exclusively; no other component
//! mutates it (spec §3).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::error;
use uuid::Uuid;

use crate::session::TierName;
use crate::tier::{policy_for, QuotaLimits, QuotaResource};

const TIER_CACHE_TTL: ChronoDuration = ChronoDuration::minutes(5);
const BURST_WINDOW_SECONDS: i64 = 60;
const CONCURRENCY_RETRY_AFTER_SECS: u64 = 5;
const PRIORITY_BOOST_COOLDOWN: ChronoDuration = ChronoDuration::hours(1);

/// Resolves a user's current tier. Implemented over whatever owns the
/// billing/account relationship; the quota engine only ever reads it.
#[async_trait::async_trait]
pub trait TierResolver: Send + Sync + 'static {
    async fn tier_for(&self, user_id: Uuid) -> TierName;
}

/// Fixed-tier resolver used by tests and single-tenant deployments.
pub struct StaticTierResolver(pub TierName);

#[async_trait::async_trait]
impl TierResolver for StaticTierResolver {
    async fn tier_for(&self, _user_id: Uuid) -> TierName {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub reset: DateTime<Utc>,
    pub retry_after_secs: Option<u64>,
    pub tier: TierName,
    pub burst_remaining: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub used: u64,
    pub remaining: u64,
    pub limit: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub reset: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub enum DegradationKind {
    SmallerContext,
    SkipDeepScans,
    SuppressOptionalSections,
}

#[derive(Debug, Clone)]
pub struct DegradationPlan {
    pub kind: DegradationKind,
    pub note: String,
}

fn degradation_for(resource: QuotaResource) -> DegradationPlan {
    match resource {
        QuotaResource::CodeGeneration => DegradationPlan {
            kind: DegradationKind::SmallerContext,
            note: "reduced context window".to_owned(),
        },
        QuotaResource::QualityAnalysis => DegradationPlan {
            kind: DegradationKind::SkipDeepScans,
            note: "skipping deep scans".to_owned(),
        },
        QuotaResource::SessionCreate => DegradationPlan {
            kind: DegradationKind::SuppressOptionalSections,
            note: "suppressing optional response sections".to_owned(),
        },
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct KeyState {
    window: VecDeque<DateTime<Utc>>,
    burst: VecDeque<DateTime<Utc>>,
    bucket: Option<TokenBucket>,
    in_flight: HashSet<Uuid>,
    last_priority_boost: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct CachedTier {
    tier: TierName,
    resolved_at: DateTime<Utc>,
}

/// Per-request input to [`QuotaEngine::check`].
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub user_id: Uuid,
    pub resource: QuotaResource,
    pub weight: u64,
    pub request_id: Uuid,
    pub graceful_degradation: bool,
}

pub enum CheckOutcome {
    Allowed(QuotaDecision),
    Denied { decision: QuotaDecision, degradation: Option<DegradationPlan> },
}

pub struct QuotaEngine {
    resolver: Arc<dyn TierResolver>,
    tier_cache: RwLock<HashMap<Uuid, CachedTier>>,
    state: RwLock<HashMap<(Uuid, &'static str), KeyState>>,
}

impl QuotaEngine {
    #[must_use]
    pub fn new(resolver: Arc<dyn TierResolver>) -> Self {
        Self {
            resolver,
            tier_cache: RwLock::new(HashMap::new()),
            state: RwLock::new(HashMap::new()),
        }
    }

    async fn resolve_tier(&self, user_id: Uuid) -> TierName {
        let now = Utc::now();
        if let Some(cached) = self.tier_cache.read().await.get(&user_id) {
            if now - cached.resolved_at < TIER_CACHE_TTL {
                return cached.tier;
            }
        }
        let tier = self.resolver.tier_for(user_id).await;
        self.tier_cache.write().await.insert(user_id, CachedTier { tier, resolved_at: now });
        tier
    }

    /// Runs the full check algorithm (spec §4.8 steps 1-7) and returns the
    /// caller's resolved tier alongside the decision.
    pub async fn check(&self, request: &CheckRequest) -> CheckOutcome {
        let tier_name = self.resolve_tier(request.user_id).await;
        let tier = policy_for(tier_name);

        let Some(limits) = tier.quota_for(request.resource) else {
            return CheckOutcome::Allowed(unlimited_decision(tier_name));
        };

        if is_unlimited(&limits) {
            return CheckOutcome::Allowed(unlimited_decision(tier_name));
        }

        let key = (request.user_id, request.resource.as_str());
        let mut states = self.state.write().await;
        let state = states.entry(key).or_default();
        let now = Utc::now();

        if let Some(concurrent) = limits.concurrent {
            if state.in_flight.len() as u64 >= concurrent {
                let decision = QuotaDecision {
                    allowed: false,
                    remaining: 0,
                    limit: concurrent,
                    reset: now + ChronoDuration::seconds(CONCURRENCY_RETRY_AFTER_SECS as i64),
                    retry_after_secs: Some(CONCURRENCY_RETRY_AFTER_SECS),
                    tier: tier_name,
                    burst_remaining: None,
                };
                return CheckOutcome::Denied {
                    degradation: request.graceful_degradation.then(|| degradation_for(request.resource)),
                    decision,
                };
            }
        }

        let window = ChronoDuration::seconds(limits.window_seconds as i64);
        while state.window.front().is_some_and(|t| now - *t > window) {
            state.window.pop_front();
        }
        let window_count = state.window.len() as u64;
        let sliding_window_denies = window_count >= limits.requests_per_window;

        while state.burst.front().is_some_and(|t| now - *t > ChronoDuration::seconds(BURST_WINDOW_SECONDS)) {
            state.burst.pop_front();
        }
        let burst_count = state.burst.len() as u64;
        let burst_denies = limits.burst.is_some_and(|b| burst_count >= b);

        let mut token_denies = false;
        if let Some(tokens_max) = limits.tokens {
            let bucket = state.bucket.get_or_insert_with(|| TokenBucket {
                tokens: tokens_max as f64,
                last_refill: now,
            });
            let elapsed = (now - bucket.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
            let refill_rate = tokens_max as f64 / limits.window_seconds as f64;
            bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(tokens_max as f64);
            bucket.last_refill = now;
            if bucket.tokens < request.weight as f64 {
                token_denies = true;
            }
        }

        let mut denied = sliding_window_denies || burst_denies || token_denies;

        if denied
            && sliding_window_denies
            && !burst_denies
            && !token_denies
            && matches!(tier_name, TierName::Pro | TierName::Enterprise)
        {
            let boost_available = state
                .last_priority_boost
                .is_none_or(|last| now - last >= PRIORITY_BOOST_COOLDOWN);
            if boost_available {
                state.last_priority_boost = Some(now);
                denied = false;
            }
        }

        let reset = state
            .window
            .front()
            .copied()
            .map_or(now + window, |earliest| earliest + window);

        if denied {
            let retry_after = (reset - now).num_seconds().max(0) as u64;
            let decision = QuotaDecision {
                allowed: false,
                remaining: 0,
                limit: limits.requests_per_window,
                reset,
                retry_after_secs: Some(retry_after),
                tier: tier_name,
                burst_remaining: limits.burst.map(|b| b.saturating_sub(burst_count)),
            };
            return CheckOutcome::Denied {
                degradation: request.graceful_degradation.then(|| degradation_for(request.resource)),
                decision,
            };
        }

        state.window.push_back(now);
        state.burst.push_back(now);
        state.in_flight.insert(request.request_id);
        if let Some(bucket) = state.bucket.as_mut() {
            bucket.tokens -= request.weight as f64;
        }

        let remaining = limits.requests_per_window.saturating_sub(state.window.len() as u64);
        CheckOutcome::Allowed(QuotaDecision {
            allowed: true,
            remaining,
            limit: limits.requests_per_window,
            reset,
            retry_after_secs: None,
            tier: tier_name,
            burst_remaining: limits.burst.map(|b| b.saturating_sub(state.burst.len() as u64)),
        })
    }

    /// Releases a request's slot from the concurrency set.
    pub async fn release(&self, user_id: Uuid, resource: QuotaResource, request_id: Uuid) {
        let key = (user_id, resource.as_str());
        if let Some(state) = self.state.write().await.get_mut(&key) {
            state.in_flight.remove(&request_id);
        }
    }

    pub async fn get_user_stats(&self, user_id: Uuid) -> HashMap<&'static str, ResourceStats> {
        let tier_name = self.resolve_tier(user_id).await;
        let tier = policy_for(tier_name);
        let now = Utc::now();
        let states = self.state.read().await;

        let mut out = HashMap::new();
        for (resource, limits) in &tier.quotas {
            let key = (user_id, resource.as_str());
            let used = states.get(&key).map_or(0, |s| s.window.len() as u64);
            let reset = states
                .get(&key)
                .and_then(|s| s.window.front())
                .map_or(now, |t| *t + ChronoDuration::seconds(limits.window_seconds as i64));
            out.insert(
                resource.as_str(),
                ResourceStats {
                    used,
                    remaining: limits.requests_per_window.saturating_sub(used),
                    limit: limits.requests_per_window,
                    reset,
                },
            );
        }
        out
    }
}

fn is_unlimited(limits: &QuotaLimits) -> bool {
    limits.requests_per_window == u64::MAX
}

fn unlimited_decision(tier: TierName) -> QuotaDecision {
    QuotaDecision {
        allowed: true,
        remaining: u64::MAX,
        limit: u64::MAX,
        reset: Utc::now(),
        retry_after_secs: None,
        tier,
        burst_remaining: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(tier: TierName) -> QuotaEngine {
        QuotaEngine::new(Arc::new(StaticTierResolver(tier)))
    }

    fn request(user_id: Uuid) -> CheckRequest {
        CheckRequest {
            user_id,
            resource: QuotaResource::CodeGeneration,
            weight: 1,
            request_id: Uuid::new_v4(),
            graceful_degradation: false,
        }
    }

    #[tokio::test]
    async fn enterprise_is_unlimited() {
        let engine = engine(TierName::Enterprise);
        let user_id = Uuid::new_v4();
        for _ in 0..10_000 {
            let outcome = engine.check(&request(user_id)).await;
            assert!(matches!(outcome, CheckOutcome::Allowed(_)));
        }
    }

    #[tokio::test]
    async fn sliding_window_denies_at_limit() {
        let engine = engine(TierName::Free);
        let user_id = Uuid::new_v4();
        let tier = policy_for(TierName::Free);
        let limit = tier.quota_for(QuotaResource::CodeGeneration).unwrap().requests_per_window;

        let mut last_allowed = true;
        for _ in 0..=limit {
            let outcome = engine.check(&request(user_id)).await;
            last_allowed = matches!(outcome, CheckOutcome::Allowed(_));
        }
        assert!(!last_allowed, "the request past the limit must be denied");
    }

    #[tokio::test]
    async fn release_clears_concurrency_slot() {
        let engine = engine(TierName::Free);
        let user_id = Uuid::new_v4();
        let req = request(user_id);
        engine.check(&req).await;
        engine.release(user_id, req.resource, req.request_id).await;
        let stats = engine.get_user_stats(user_id).await;
        assert!(stats.contains_key("code_generation"));
    }

    #[tokio::test]
    async fn denied_with_graceful_degradation_returns_plan() {
        let engine = engine(TierName::Free);
        let user_id = Uuid::new_v4();
        let tier = policy_for(TierName::Free);
        let limit = tier.quota_for(QuotaResource::CodeGeneration).unwrap().requests_per_window;
        for _ in 0..limit {
            engine.check(&request(user_id)).await;
        }
        let mut req = request(user_id);
        req.graceful_degradation = true;
        let outcome = engine.check(&req).await;
        match outcome {
            CheckOutcome::Denied { degradation, .. } => assert!(degradation.is_some()),
            CheckOutcome::Allowed(_) => panic!("expected denial past the limit"),
        }
    }

    #[tokio::test]
    async fn get_user_stats_reports_every_tier_resource() {
        let engine = engine(TierName::Pro);
        let user_id = Uuid::new_v4();
        let stats = engine.get_user_stats(user_id).await;
        assert!(stats.contains_key("code_generation"));
        assert!(stats.contains_key("quality_analysis"));
        assert!(stats.contains_key("session_create"));
    }
}
