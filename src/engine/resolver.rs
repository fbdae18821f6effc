//! Best-effort account resolution.
//!
//! Maps the raw account reference in a usage record to a human-readable
//! label by probing the per-provider account registries. Resolution is
//! observability-only; a miss everywhere yields the `Deleted` sentinel so
//! callers can render "account removed" distinctly from "unknown".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::models::{
    AccountKind, AccountProfile, ResolvedAccount, ResolvedAccountInfo, UsageRecord,
};

#[derive(Debug, Error)]
#[error("Registry error: {0}")]
pub struct RegistryError(pub String);

/// One provider family's account registry.
#[async_trait]
pub trait AccountRegistry: Send + Sync {
    /// Look up an account by its raw (unprefixed) id.
    async fn get_account(&self, account_id: &str) -> Result<Option<AccountProfile>, RegistryError>;
}

/// Resolves raw account references against the registries, with a small
/// in-memory memo so repeated resolution cycles do not re-probe.
pub struct AccountResolver {
    registries: HashMap<AccountKind, Arc<dyn AccountRegistry>>,
    lookup_cache: DashMap<(AccountKind, String), Option<ResolvedAccountInfo>>,
    timeout: Duration,
}

impl AccountResolver {
    pub fn new(
        registries: HashMap<AccountKind, Arc<dyn AccountRegistry>>,
        timeout: Duration,
    ) -> Self {
        Self {
            registries,
            lookup_cache: DashMap::new(),
            timeout,
        }
    }

    /// Resolve the account a usage record was served from.
    ///
    /// Candidates are probed in order: the record's own declared kind,
    /// any kind implied by a prefix on the raw id, kinds inferred from the
    /// model name, then the fixed priority order over all kinds.
    pub async fn resolve(&self, record: &UsageRecord) -> ResolvedAccount {
        let Some(raw_id) = record.account_id.as_deref().filter(|id| !id.is_empty()) else {
            return ResolvedAccount::Deleted;
        };
        let (prefix_kind, account_id) = strip_kind_prefix(raw_id);

        let mut candidates: Vec<AccountKind> = Vec::new();
        let mut push = |kind: AccountKind, candidates: &mut Vec<AccountKind>| {
            if !candidates.contains(&kind) {
                candidates.push(kind);
            }
        };

        if let Some(kind) = record.account_kind {
            push(kind, &mut candidates);
        }
        if let Some(kind) = prefix_kind {
            push(kind, &mut candidates);
        }
        for kind in AccountKind::infer_from_model(&record.model) {
            push(*kind, &mut candidates);
        }
        for kind in AccountKind::PRIORITY {
            push(kind, &mut candidates);
        }

        for kind in candidates {
            if let Some(info) = self.lookup(kind, account_id).await {
                return ResolvedAccount::Found(info);
            }
        }

        ResolvedAccount::Deleted
    }

    /// Memoized registry probe. Errors and timeouts count as misses.
    async fn lookup(&self, kind: AccountKind, account_id: &str) -> Option<ResolvedAccountInfo> {
        let memo_key = (kind, account_id.to_string());
        if let Some(cached) = self.lookup_cache.get(&memo_key) {
            return cached.clone();
        }

        let registry = self.registries.get(&kind)?;
        let result = tokio::time::timeout(self.timeout, registry.get_account(account_id)).await;
        let profile = match result {
            Ok(Ok(profile)) => profile,
            Ok(Err(err)) => {
                tracing::warn!(%kind, %account_id, error = %err, "Account registry lookup failed");
                None
            }
            Err(_) => {
                tracing::warn!(%kind, %account_id, "Account registry lookup timed out");
                None
            }
        };

        let info = profile.map(|profile| ResolvedAccountInfo {
            account_id: account_id.to_string(),
            account_kind: kind,
            account_category: profile.category.clone(),
            display_name: profile.label().to_string(),
        });

        self.lookup_cache.insert(memo_key, info.clone());
        info
    }
}

impl crate::engine::MeteringEngine {
    /// Resolve the account that served a key's most recent request.
    ///
    /// Returns `None` when the key has no usage log yet.
    pub async fn last_used_account(
        &self,
        key_id: uuid::Uuid,
    ) -> crate::engine::EngineResult<Option<ResolvedAccount>> {
        let entries = self
            .cache()
            .list_recent(&crate::cache::CacheKeys::usage_log(key_id), 1)
            .await?;
        let Some(bytes) = entries.first() else {
            return Ok(None);
        };

        let record: UsageRecord = match serde_json::from_slice(bytes) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(%key_id, error = %err, "Discarding undecodable usage log entry");
                return Ok(None);
            }
        };

        Ok(Some(self.resolver().resolve(&record).await))
    }
}

/// Strip a known kind-specific prefix from a raw account id.
///
/// `"claude-console:abc"` resolves to `(Some(ClaudeConsole), "abc")`. The
/// longest prefix wins so `claude-console:` is never mistaken for
/// `claude:` plus a dashed id.
fn strip_kind_prefix(raw_id: &str) -> (Option<AccountKind>, &str) {
    let mut kinds = AccountKind::PRIORITY;
    kinds.sort_by_key(|kind| std::cmp::Reverse(kind.as_str().len()));

    for kind in kinds {
        if let Some(stripped) = raw_id.strip_prefix(&kind.id_prefix()) {
            return (Some(kind), stripped);
        }
    }
    (None, raw_id)
}
