//! End-to-end engine tests against an in-memory SQLite store and the
//! in-memory counter cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use rstest::rstest;
use sqlx::sqlite::SqlitePoolOptions;
use tollgate::cache::build_cache;
use tollgate::config::EngineConfig;
use tollgate::db::SqliteKeyStore;
use tollgate::engine::{
    AccountRegistry, AllowAllOwners, MeteringEngine, OwnerGate, RegistryError, ValidationOutcome,
};
use tollgate::events::BillingEvent;
use tollgate::models::{
    AccountKind, AccountProfile, CostLimits, CreateKey, CreatedKey, ExpirationPolicy, ExpiryUnit,
    KeyScope, RateWindowSpec, ResolvedAccount, TokenUsage,
};
use tollgate::pricing::{CostBreakdown, PricingError, PricingLookup};
use uuid::Uuid;

/// Pricing collaborator that charges a fixed total per request.
struct FixedPricing {
    total_microcents: i64,
}

#[async_trait]
impl PricingLookup for FixedPricing {
    async fn cost(&self, _usage: &TokenUsage, _model: &str) -> Result<CostBreakdown, PricingError> {
        Ok(CostBreakdown {
            input_microcents: self.total_microcents,
            output_microcents: 0,
            cache_create_microcents: 0,
            cache_read_microcents: 0,
            total_microcents: self.total_microcents,
        })
    }
}

/// Pricing collaborator that always fails, forcing the built-in fallback.
struct BrokenPricing;

#[async_trait]
impl PricingLookup for BrokenPricing {
    async fn cost(&self, _usage: &TokenUsage, _model: &str) -> Result<CostBreakdown, PricingError> {
        Err(PricingError::Lookup("upstream unavailable".to_string()))
    }
}

struct DenyAllOwners;

#[async_trait]
impl OwnerGate for DenyAllOwners {
    async fn is_owner_active(&self, _user_id: Uuid) -> Result<bool, RegistryError> {
        Ok(false)
    }
}

struct StubRegistry {
    accounts: HashMap<String, AccountProfile>,
}

#[async_trait]
impl AccountRegistry for StubRegistry {
    async fn get_account(&self, account_id: &str) -> Result<Option<AccountProfile>, RegistryError> {
        Ok(self.accounts.get(account_id).cloned())
    }
}

struct EngineBuilder {
    pricing: Arc<dyn PricingLookup>,
    owner_gate: Arc<dyn OwnerGate>,
    registries: HashMap<AccountKind, Arc<dyn AccountRegistry>>,
    config: EngineConfig,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            pricing: Arc::new(FixedPricing {
                total_microcents: 1_000,
            }),
            owner_gate: Arc::new(AllowAllOwners),
            registries: HashMap::new(),
            config: EngineConfig::default(),
        }
    }

    fn pricing(mut self, pricing: impl PricingLookup + 'static) -> Self {
        self.pricing = Arc::new(pricing);
        self
    }

    fn owner_gate(mut self, gate: impl OwnerGate + 'static) -> Self {
        self.owner_gate = Arc::new(gate);
        self
    }

    fn registry(mut self, kind: AccountKind, accounts: &[(&str, &str)]) -> Self {
        self.registries.insert(
            kind,
            Arc::new(StubRegistry {
                accounts: accounts
                    .iter()
                    .map(|(id, name)| {
                        (
                            id.to_string(),
                            AccountProfile {
                                id: id.to_string(),
                                name: Some(name.to_string()),
                                ..Default::default()
                            },
                        )
                    })
                    .collect(),
            }),
        );
        self
    }

    async fn build(self) -> MeteringEngine {
        // A single connection keeps every task on the same in-memory
        // database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteKeyStore::new(pool);
        store.migrate().await.unwrap();

        let cache = build_cache(&self.config.cache).unwrap();
        MeteringEngine::new(
            Arc::new(store),
            cache,
            self.pricing,
            self.owner_gate,
            self.registries,
            self.config,
        )
        .unwrap()
    }
}

fn create_input(expiration: ExpirationPolicy) -> CreateKey {
    CreateKey {
        name: "integration".to_string(),
        user_id: None,
        bindings: BTreeMap::new(),
        scope: KeyScope::Relay,
        allowed_models: None,
        allowed_clients: None,
        tags: vec![],
        limits: CostLimits::default(),
        rate_window: None,
        expiration,
    }
}

async fn create_key(engine: &MeteringEngine, expiration: ExpirationPolicy) -> CreatedKey {
    engine.create_key(create_input(expiration)).await.unwrap()
}

fn usage(input_tokens: i64, output_tokens: i64) -> TokenUsage {
    TokenUsage {
        input_tokens,
        output_tokens,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_validate_happy_path_and_auth_failures() {
    let engine = EngineBuilder::new().build().await;
    let created = create_key(&engine, ExpirationPolicy::Fixed { expires_at: None }).await;

    let outcome = engine.validate(&created.secret).await.unwrap();
    match outcome {
        ValidationOutcome::Valid(snapshot) => {
            assert_eq!(snapshot.key.id, created.key.id);
            assert_eq!(snapshot.costs.daily_microcents, 0);
            assert!(snapshot.rate_window.is_none());
        }
        other => panic!("expected Valid, got {other:?}"),
    }

    // Right prefix but no matching key
    let outcome = engine.validate("tg_live_does_not_exist").await.unwrap();
    assert!(matches!(outcome, ValidationOutcome::NotFound));
}

#[rstest]
#[case::empty("")]
#[case::foreign_prefix("sk-proj-abc123")]
#[case::truncated_prefix("tg_live")]
#[case::case_mismatch("TG_LIVE_abc123")]
#[case::multibyte_straddles_prefix("tg_liv\u{20AC}xxxx")]
#[tokio::test]
async fn test_malformed_secrets_never_reach_lookup(#[case] secret: &str) {
    let engine = EngineBuilder::new().build().await;
    let outcome = engine.validate(secret).await.unwrap();
    assert!(matches!(outcome, ValidationOutcome::Malformed));
}

#[tokio::test]
async fn test_expired_fixed_key_reports_expired() {
    let engine = EngineBuilder::new().build().await;
    let created = create_key(
        &engine,
        ExpirationPolicy::Fixed {
            expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
        },
    )
    .await;

    let outcome = engine.validate(&created.secret).await.unwrap();
    assert!(matches!(outcome, ValidationOutcome::Expired));
}

#[tokio::test]
async fn test_deleted_and_disabled_keys_are_rejected() {
    let engine = EngineBuilder::new().build().await;
    let created = create_key(&engine, ExpirationPolicy::Fixed { expires_at: None }).await;

    engine
        .soft_delete_key(created.key.id, "admin")
        .await
        .unwrap();
    let outcome = engine.validate(&created.secret).await.unwrap();
    assert!(matches!(outcome, ValidationOutcome::Deleted));

    engine.restore_key(created.key.id).await.unwrap();
    let outcome = engine.validate(&created.secret).await.unwrap();
    assert!(outcome.is_valid());

    let update = tollgate::models::KeyUpdate {
        active: Some(false),
        ..Default::default()
    };
    engine.update_key(created.key.id, &update).await.unwrap();
    let outcome = engine.validate(&created.secret).await.unwrap();
    assert!(matches!(outcome, ValidationOutcome::Disabled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_first_use_activates_exactly_once() {
    let engine = Arc::new(EngineBuilder::new().build().await);
    let mut events = engine.events().subscribe();
    let created = create_key(
        &engine,
        ExpirationPolicy::OnFirstUse {
            period: 30,
            unit: ExpiryUnit::Days,
            activated: false,
            activated_at: None,
            expires_at: None,
        },
    )
    .await;

    let calls = (0..50).map(|_| {
        let engine = Arc::clone(&engine);
        let secret = created.secret.clone();
        tokio::spawn(async move { engine.validate(&secret).await.unwrap() })
    });
    let outcomes: Vec<ValidationOutcome> = join_all(calls)
        .await
        .into_iter()
        .map(|handle| handle.unwrap())
        .collect();

    // Every caller succeeds and observes the same expiry
    let mut expiries = Vec::new();
    for outcome in outcomes {
        match outcome {
            ValidationOutcome::Valid(snapshot) => {
                expiries.push(snapshot.key.expiration.effective_expires_at().unwrap());
            }
            other => panic!("expected Valid, got {other:?}"),
        }
    }
    assert_eq!(expiries.len(), 50);
    assert!(expiries.iter().all(|e| *e == expiries[0]));

    // Exactly one activation event was published
    let mut activations = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, BillingEvent::KeyActivated { .. }) {
            activations += 1;
        }
    }
    assert_eq!(activations, 1);
}

#[tokio::test]
async fn test_validate_for_stats_never_activates() {
    let engine = EngineBuilder::new().build().await;
    let created = create_key(
        &engine,
        ExpirationPolicy::OnFirstUse {
            period: 7,
            unit: ExpiryUnit::Days,
            activated: false,
            activated_at: None,
            expires_at: None,
        },
    )
    .await;

    for _ in 0..5 {
        let outcome = engine.validate_for_stats(&created.secret).await.unwrap();
        assert!(outcome.is_valid());
    }

    // The key is still dormant in both stores
    let outcome = engine.validate_for_stats(&created.secret).await.unwrap();
    match outcome {
        ValidationOutcome::Valid(snapshot) => {
            assert!(snapshot.key.expiration.is_dormant());
            assert_eq!(snapshot.key.expiration.effective_expires_at(), None);
        }
        other => panic!("expected Valid, got {other:?}"),
    }

    // A real validation then starts the countdown
    let outcome = engine.validate(&created.secret).await.unwrap();
    match outcome {
        ValidationOutcome::Valid(snapshot) => {
            assert!(!snapshot.key.expiration.is_dormant());
            assert!(snapshot.key.expiration.effective_expires_at().is_some());
        }
        other => panic!("expected Valid, got {other:?}"),
    }
}

#[tokio::test]
async fn test_record_accumulates_cost_buckets_exactly() {
    let engine = EngineBuilder::new()
        .pricing(FixedPricing {
            total_microcents: 250,
        })
        .build()
        .await;
    let created = create_key(&engine, ExpirationPolicy::Fixed { expires_at: None }).await;

    for _ in 0..4 {
        engine
            .record(created.key.id, usage(100, 50), "claude-sonnet-4", None, None)
            .await;
    }

    let costs = engine.cost_snapshot(created.key.id).await.unwrap();
    assert_eq!(costs.daily_microcents, 1_000);
    assert_eq!(costs.weekly_microcents, 1_000);
    assert_eq!(costs.monthly_microcents, 1_000);
    assert_eq!(costs.lifetime_microcents, 1_000);
    // Sonnet traffic never touches the class bucket
    assert_eq!(costs.opus_weekly_microcents, 0);

    // Recording also bumped the durable last-used timestamp
    let stored = engine
        .get_key(created.key.id)
        .await
        .unwrap()
        .expect("key still present");
    assert!(stored.last_used_at.is_some());
}

#[tokio::test]
async fn test_class_bucket_requires_model_and_account_kind() {
    let engine = EngineBuilder::new()
        .pricing(FixedPricing {
            total_microcents: 100,
        })
        .build()
        .await;
    let created = create_key(&engine, ExpirationPolicy::Fixed { expires_at: None }).await;
    let id = created.key.id;

    // Matching model, allowed kind: counts
    engine
        .record(
            id,
            usage(10, 10),
            "claude-opus-4",
            Some("a1".to_string()),
            Some(AccountKind::Claude),
        )
        .await;
    // Matching model, disallowed kind: skipped
    engine
        .record(
            id,
            usage(10, 10),
            "claude-opus-4",
            Some("a2".to_string()),
            Some(AccountKind::Bedrock),
        )
        .await;
    // Matching model, unknown kind: skipped
    engine
        .record(id, usage(10, 10), "claude-opus-4", None, None)
        .await;
    // Non-matching model, allowed kind: skipped
    engine
        .record(
            id,
            usage(10, 10),
            "claude-haiku-4",
            Some("a1".to_string()),
            Some(AccountKind::Claude),
        )
        .await;

    let costs = engine.cost_snapshot(id).await.unwrap();
    assert_eq!(costs.opus_weekly_microcents, 100);
    assert_eq!(costs.weekly_microcents, 400);
}

#[tokio::test]
async fn test_rate_window_scenario() {
    let engine = EngineBuilder::new()
        .pricing(FixedPricing {
            total_microcents: 2,
        })
        .build()
        .await;

    let mut input = create_input(ExpirationPolicy::Fixed { expires_at: None });
    input.limits = CostLimits {
        daily_microcents: Some(10),
        ..Default::default()
    };
    input.rate_window = Some(RateWindowSpec {
        duration_minutes: 300,
        max_requests: None,
        max_tokens: None,
        max_cost_microcents: Some(5),
    });
    let created = engine.create_key(input).await.unwrap();
    let id = created.key.id;

    for _ in 0..3 {
        engine
            .record(id, usage(40, 20), "claude-sonnet-4", None, None)
            .await;
    }

    let costs = engine.cost_snapshot(id).await.unwrap();
    assert_eq!(costs.daily_microcents, 6);

    let window = engine
        .rate_window_state(id)
        .await
        .unwrap()
        .expect("window should be live");
    assert_eq!(window.requests, 3);
    assert_eq!(window.tokens, 180);
    assert_eq!(window.cost_microcents, 6);
    assert!(window.remaining_seconds > 0);
    assert!(window.remaining_seconds <= 300 * 60);

    // Remaining time moves monotonically toward zero
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let later = engine
        .rate_window_state(id)
        .await
        .unwrap()
        .expect("window still live");
    assert!(later.remaining_seconds < window.remaining_seconds);
    assert!(later.remaining_seconds > 0);
}

#[tokio::test]
async fn test_pricing_failure_degrades_without_losing_tokens() {
    let engine = EngineBuilder::new().pricing(BrokenPricing).build().await;
    let created = create_key(&engine, ExpirationPolicy::Fixed { expires_at: None }).await;
    let id = created.key.id;

    // Known model family: the built-in table prices it
    engine
        .record(id, usage(1_000, 0), "claude-sonnet-4", None, None)
        .await;
    let costs = engine.cost_snapshot(id).await.unwrap();
    assert_eq!(costs.daily_microcents, 3_000);

    // Unknown everywhere: zero cost, but the request still lands in the
    // rate window and usage log
    let engine = EngineBuilder::new().pricing(BrokenPricing).build().await;
    let mut input = create_input(ExpirationPolicy::Fixed { expires_at: None });
    input.rate_window = Some(RateWindowSpec {
        duration_minutes: 60,
        max_requests: Some(100),
        max_tokens: None,
        max_cost_microcents: None,
    });
    let created = engine.create_key(input).await.unwrap();

    engine
        .record(created.key.id, usage(500, 100), "mystery-model", None, None)
        .await;

    let costs = engine.cost_snapshot(created.key.id).await.unwrap();
    assert_eq!(costs.daily_microcents, 0);

    let window = engine
        .rate_window_state(created.key.id)
        .await
        .unwrap()
        .expect("window should be live");
    assert_eq!(window.requests, 1);
    assert_eq!(window.tokens, 600);
    assert_eq!(window.cost_microcents, 0);
}

#[tokio::test]
async fn test_owner_gate_can_reject() {
    let engine = EngineBuilder::new().owner_gate(DenyAllOwners).build().await;

    let mut input = create_input(ExpirationPolicy::Fixed { expires_at: None });
    input.user_id = Some(Uuid::new_v4());
    let created = engine.create_key(input).await.unwrap();

    let outcome = engine.validate(&created.secret).await.unwrap();
    assert!(matches!(outcome, ValidationOutcome::OwnerDisabled));

    // Keys without an owner skip the gate
    let ownerless = create_key(&engine, ExpirationPolicy::Fixed { expires_at: None }).await;
    let outcome = engine.validate(&ownerless.secret).await.unwrap();
    assert!(outcome.is_valid());
}

#[tokio::test]
async fn test_last_used_account_resolution() {
    let engine = EngineBuilder::new()
        .registry(AccountKind::Claude, &[("acct-7", "primary pool")])
        .build()
        .await;
    let created = create_key(&engine, ExpirationPolicy::Fixed { expires_at: None }).await;
    let id = created.key.id;

    assert!(engine.last_used_account(id).await.unwrap().is_none());

    engine
        .record(
            id,
            usage(10, 10),
            "claude-opus-4",
            Some("acct-7".to_string()),
            Some(AccountKind::Claude),
        )
        .await;

    match engine.last_used_account(id).await.unwrap() {
        Some(ResolvedAccount::Found(info)) => {
            assert_eq!(info.display_name, "primary pool");
            assert_eq!(info.account_kind, AccountKind::Claude);
        }
        other => panic!("expected Found, got {other:?}"),
    }

    // A reference no registry knows resolves to the deleted sentinel
    engine
        .record(
            id,
            usage(10, 10),
            "claude-opus-4",
            Some("gone".to_string()),
            Some(AccountKind::Claude),
        )
        .await;
    assert_eq!(
        engine.last_used_account(id).await.unwrap(),
        Some(ResolvedAccount::Deleted)
    );
}

#[tokio::test]
async fn test_usage_recorded_event_is_published() {
    let engine = EngineBuilder::new()
        .pricing(FixedPricing {
            total_microcents: 42,
        })
        .build()
        .await;
    let mut events = engine.events().subscribe();
    let created = create_key(&engine, ExpirationPolicy::Fixed { expires_at: None }).await;

    engine
        .record(
            created.key.id,
            usage(100, 50),
            "claude-sonnet-4",
            None,
            None,
        )
        .await;

    match events.try_recv().unwrap() {
        BillingEvent::UsageRecorded {
            key_id,
            model,
            input_tokens,
            output_tokens,
            cost,
            ..
        } => {
            assert_eq!(key_id, created.key.id);
            assert_eq!(model, "claude-sonnet-4");
            assert_eq!(input_tokens, 100);
            assert_eq!(output_tokens, 50);
            assert_eq!(cost.total_microcents, 42);
        }
        other => panic!("expected UsageRecorded, got {other:?}"),
    }
}

#[tokio::test]
async fn test_hard_delete_purges_everything() {
    let engine = EngineBuilder::new().build().await;
    let mut input = create_input(ExpirationPolicy::Fixed { expires_at: None });
    input.rate_window = Some(RateWindowSpec {
        duration_minutes: 60,
        max_requests: Some(10),
        max_tokens: None,
        max_cost_microcents: None,
    });
    let created = engine.create_key(input).await.unwrap();
    let id = created.key.id;

    engine
        .record(id, usage(10, 10), "claude-sonnet-4", None, None)
        .await;
    assert!(engine.cost_snapshot(id).await.unwrap().daily_microcents > 0);

    engine.hard_delete_key(id).await.unwrap();

    let outcome = engine.validate(&created.secret).await.unwrap();
    assert!(matches!(outcome, ValidationOutcome::NotFound));

    let costs = engine.cost_snapshot(id).await.unwrap();
    assert_eq!(costs.daily_microcents, 0);
    assert_eq!(costs.lifetime_microcents, 0);
    assert!(engine.rate_window_state(id).await.unwrap().is_none());
    assert!(engine.last_used_account(id).await.unwrap().is_none());
}
