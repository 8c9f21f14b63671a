//! Daily query/token/cost metering per user.
//!
//! Days are keyed by the calendar date in a fixed reference timezone offset,
//! not the server's local time, so the reset boundary is stable across
//! deployments. The check-then-act window between `check_allowed` and
//! `record_usage` is an accepted soft bound, not a hard security boundary.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::UsageConfig;
use crate::storage::{Store, StoreError, UsageRecord};

#[derive(Error, Debug)]
pub enum UsageError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

pub type Result<T> = std::result::Result<T, UsageError>;

/// Result of a rate-limit check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allowance {
    pub allowed: bool,
    pub query_count: i64,
    pub daily_limit: i64,
    pub reset_time: DateTime<Utc>,
}

pub struct UsageMeter {
    store: Arc<Mutex<Store>>,
    config: UsageConfig,
}

impl UsageMeter {
    pub fn new(store: Arc<Mutex<Store>>, config: UsageConfig) -> Self {
        Self { store, config }
    }

    fn offset(&self) -> FixedOffset {
        // Offsets outside +/-24h are rejected by the config's own docs; fall
        // back to UTC rather than panic on a bad value.
        FixedOffset::east_opt(self.config.timezone_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
    }

    /// Calendar-day key for an instant, in the reference timezone.
    fn day_key(&self, now: DateTime<Utc>) -> String {
        now.with_timezone(&self.offset())
            .date_naive()
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Next midnight in the reference timezone, as a UTC instant.
    fn reset_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let offset = self.offset();
        let local = now.with_timezone(&offset);
        let next_midnight = local
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight + Duration::days(1))
            .unwrap_or_else(|| local.naive_local());
        match next_midnight.and_local_timezone(offset) {
            chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
            // Fixed offsets have no DST gaps; this arm is unreachable.
            _ => now,
        }
    }

    /// Check whether the user may run another query today.
    pub fn check_allowed(&self, user_id: Uuid) -> Result<Allowance> {
        self.check_allowed_at(user_id, Utc::now())
    }

    fn check_allowed_at(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Allowance> {
        let day = self.day_key(now);
        let store = self
            .store
            .lock()
            .map_err(|e| UsageError::LockPoisoned(e.to_string()))?;

        let query_count = store
            .get_usage(user_id, &day)?
            .map(|r| r.query_count)
            .unwrap_or(0);
        let mut allowed = query_count < self.config.daily_query_limit;

        // Optional global cost ceiling, summed across all users for the day.
        if allowed {
            if let Some(cost_limit) = self.config.daily_cost_limit {
                let total = store.total_cost_for_day(&day)?;
                if total >= cost_limit {
                    log::warn!("Global daily cost ceiling reached ({total:.4} USD)");
                    allowed = false;
                }
            }
        }

        Ok(Allowance {
            allowed,
            query_count,
            daily_limit: self.config.daily_query_limit,
            reset_time: self.reset_time(now),
        })
    }

    /// Record one completed generation call. Increments are atomic upserts;
    /// concurrent requests from one user on one day do not lose counts.
    pub fn record_usage(&self, user_id: Uuid, input_tokens: i64, output_tokens: i64) -> Result<()> {
        self.record_usage_at(user_id, input_tokens, output_tokens, Utc::now())
    }

    fn record_usage_at(
        &self,
        user_id: Uuid,
        input_tokens: i64,
        output_tokens: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let day = self.day_key(now);
        let cost = self.cost(input_tokens, output_tokens);
        let store = self
            .store
            .lock()
            .map_err(|e| UsageError::LockPoisoned(e.to_string()))?;
        store.record_usage(user_id, &day, input_tokens, output_tokens, cost)?;
        Ok(())
    }

    /// Today's usage snapshot for the user, zeroed if absent.
    pub fn today(&self, user_id: Uuid) -> Result<UsageRecord> {
        let now = Utc::now();
        let day = self.day_key(now);
        let store = self
            .store
            .lock()
            .map_err(|e| UsageError::LockPoisoned(e.to_string()))?;
        Ok(store.get_usage(user_id, &day)?.unwrap_or(UsageRecord {
            user_id,
            day,
            query_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
        }))
    }

    /// Estimated cost in USD for a token pair.
    fn cost(&self, input_tokens: i64, output_tokens: i64) -> f64 {
        (input_tokens as f64 * self.config.cost_per_million_input
            + output_tokens as f64 * self.config.cost_per_million_output)
            / 1_000_000.0
    }
}
