//! Per-user daily limit on AI generation calls.
//!
//! The generator itself is opaque; [`QuotaGuard`] counts successful calls
//! per user per UTC day and refuses once the limit is reached.

use crate::error::{SyncError, SyncResult};
use crate::model::UserContext;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Item whose content is passed along as context.
    #[serde(default)]
    pub item_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, user: &UserContext, request: &GenerationRequest) -> Result<GenerationResponse>;
}

fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

/// Fixed-window counter keyed by user, one window per UTC day.
pub struct DailyQuota {
    limit: u32,
    usage: Mutex<HashMap<String, (NaiveDate, u32)>>,
}

impl DailyQuota {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn used(&self, user_id: &str, now: DateTime<Utc>) -> u32 {
        match self.usage.lock().get(user_id) {
            Some((day, count)) if *day == now.date_naive() => *count,
            _ => 0,
        }
    }

    pub fn remaining(&self, user_id: &str, now: DateTime<Utc>) -> u32 {
        self.limit.saturating_sub(self.used(user_id, now))
    }

    /// Take one call from today's allowance.
    pub fn try_acquire(&self, user_id: &str, now: DateTime<Utc>) -> SyncResult<u32> {
        let today = now.date_naive();
        let mut usage = self.usage.lock();
        let entry = usage.entry(user_id.to_string()).or_insert((today, 0));
        if entry.0 != today {
            *entry = (today, 0);
        }
        if entry.1 >= self.limit {
            return Err(SyncError::RateLimited {
                limit: self.limit,
                resets_at: next_midnight(now),
            });
        }
        entry.1 += 1;
        Ok(self.limit - entry.1)
    }

    /// Give back a call taken on `now`'s day.
    pub fn release(&self, user_id: &str, now: DateTime<Utc>) {
        if let Some((day, count)) = self.usage.lock().get_mut(user_id) {
            if *day == now.date_naive() {
                *count = count.saturating_sub(1);
            }
        }
    }
}

pub struct QuotaGuard<G> {
    service: G,
    quota: DailyQuota,
}

impl<G: GenerationService> QuotaGuard<G> {
    pub fn new(service: G, daily_limit: u32) -> Self {
        Self {
            service,
            quota: DailyQuota::new(daily_limit),
        }
    }

    pub fn quota(&self) -> &DailyQuota {
        &self.quota
    }

    /// Failed generations do not count against the limit.
    pub async fn generate(
        &self,
        user: &UserContext,
        request: &GenerationRequest,
    ) -> SyncResult<GenerationResponse> {
        let now = Utc::now();
        let remaining = match self.quota.try_acquire(&user.id, now) {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!(user = %user.id, limit = self.quota.limit(), "generation limit reached");
                return Err(e);
            }
        };
        debug!(user = %user.id, remaining, "generation allowed");
        match self.service.generate(user, request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.quota.release(&user.id, now);
                Err(SyncError::Backend(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl GenerationService for Echo {
        async fn generate(&self, _user: &UserContext, request: &GenerationRequest) -> Result<GenerationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("model unavailable");
            }
            Ok(GenerationResponse {
                text: request.prompt.to_uppercase(),
            })
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "summarise".into(),
            item_id: None,
        }
    }

    #[test]
    fn quota_resets_at_utc_midnight() {
        let quota = DailyQuota::new(2);
        let late = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 0).unwrap();

        assert_eq!(quota.try_acquire("alice", late).unwrap(), 1);
        assert_eq!(quota.try_acquire("alice", late).unwrap(), 0);
        match quota.try_acquire("alice", late) {
            Err(SyncError::RateLimited { limit, resets_at }) => {
                assert_eq!(limit, 2);
                assert_eq!(resets_at, Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap());
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert_eq!(quota.remaining("bob", late), 2);

        let next_day = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 1).unwrap();
        assert_eq!(quota.used("alice", next_day), 0);
        assert_eq!(quota.try_acquire("alice", next_day).unwrap(), 1);
    }

    #[tokio::test]
    async fn guard_stops_calling_once_limit_is_reached() {
        let guard = QuotaGuard::new(Echo::default(), 3);
        let alice = UserContext::new("alice", "alice@example.com");

        for _ in 0..3 {
            assert_eq!(guard.generate(&alice, &request()).await.unwrap().text, "SUMMARISE");
        }
        let err = guard.generate(&alice, &request()).await.unwrap_err();
        assert!(matches!(err, SyncError::RateLimited { limit: 3, .. }));
        assert!(!err.is_recoverable());
        assert_eq!(guard.service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_generation_is_not_counted() {
        let guard = QuotaGuard::new(Echo::default(), 1);
        let alice = UserContext::new("alice", "alice@example.com");

        guard.service.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            guard.generate(&alice, &request()).await,
            Err(SyncError::Backend(_))
        ));
        assert_eq!(guard.quota().used("alice", Utc::now()), 0);

        guard.service.fail.store(false, Ordering::SeqCst);
        assert!(guard.generate(&alice, &request()).await.is_ok());
    }
}
