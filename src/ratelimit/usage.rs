//! Usage log abstraction and the in-memory implementation.
//!
//! The rate limit service only relies on the contract of [`UsageLog`]:
//! `count_in_window` and `earliest_since` must reflect every `append` for the
//! same user that happened before them. No ordering is required across users.
//! Window anchors are recovered from the log, so several service instances
//! (or a restarted one) sharing a log reach the same verdicts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

/// Errors reported by a usage log.
#[derive(Debug, Error)]
pub enum UsageLogError {
    #[error("Usage log unavailable: {0}")]
    Unavailable(String),
    #[error("Usage log operation failed: {0}")]
    Operation(String),
}

/// One accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub user_id: String,
    pub endpoint_key: String,
    pub timestamp: DateTime<Utc>,
}

/// Trait for usage log implementations.
#[async_trait]
pub trait UsageLog: Send + Sync {
    /// Count records for a user and endpoint at or after `window_start`.
    async fn count_in_window(
        &self,
        user_id: &str,
        endpoint_key: &str,
        window_start: DateTime<Utc>,
    ) -> Result<u64, UsageLogError>;

    /// Timestamp of the oldest record for a user and endpoint at or after
    /// `since`, if any.
    async fn earliest_since(
        &self,
        user_id: &str,
        endpoint_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, UsageLogError>;

    /// Distinct endpoint keys with records for a user at or after `since`,
    /// sorted.
    async fn endpoint_keys(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, UsageLogError>;

    /// Append one record.
    async fn append(
        &self,
        user_id: &str,
        endpoint_key: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), UsageLogError>;

    /// Remove every record older than `cutoff`, returning how many were removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, UsageLogError>;

    /// Remove every record of a user, returning how many were removed.
    async fn delete_all_for(&self, user_id: &str) -> Result<usize, UsageLogError>;
}

/// Usage log kept in process memory, sharded per user.
///
/// Requests of different users touch different shards and never contend.
#[derive(Debug, Default)]
pub struct InMemoryUsageLog {
    records: DashMap<String, Vec<UsageRecord>>,
}

impl InMemoryUsageLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored records.
    pub fn record_count(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }

    /// Number of users with at least one record.
    pub fn user_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl UsageLog for InMemoryUsageLog {
    async fn count_in_window(
        &self,
        user_id: &str,
        endpoint_key: &str,
        window_start: DateTime<Utc>,
    ) -> Result<u64, UsageLogError> {
        let count = self
            .records
            .get(user_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.endpoint_key == endpoint_key && r.timestamp >= window_start)
                    .count() as u64
            })
            .unwrap_or(0);
        Ok(count)
    }

    async fn earliest_since(
        &self,
        user_id: &str,
        endpoint_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, UsageLogError> {
        Ok(self.records.get(user_id).and_then(|records| {
            records
                .iter()
                .filter(|r| r.endpoint_key == endpoint_key && r.timestamp >= since)
                .map(|r| r.timestamp)
                .min()
        }))
    }

    async fn endpoint_keys(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, UsageLogError> {
        let keys: BTreeSet<String> = self
            .records
            .get(user_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.timestamp >= since)
                    .map(|r| r.endpoint_key.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(keys.into_iter().collect())
    }

    async fn append(
        &self,
        user_id: &str,
        endpoint_key: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), UsageLogError> {
        self.records
            .entry(user_id.to_string())
            .or_default()
            .push(UsageRecord {
                user_id: user_id.to_string(),
                endpoint_key: endpoint_key.to_string(),
                timestamp,
            });
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, UsageLogError> {
        let mut removed = 0;
        for mut entry in self.records.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|r| r.timestamp >= cutoff);
            removed += before - entry.value().len();
        }
        self.records.retain(|_, records| !records.is_empty());

        debug!(removed, cutoff = %cutoff, "Pruned usage records");
        Ok(removed)
    }

    async fn delete_all_for(&self, user_id: &str) -> Result<usize, UsageLogError> {
        Ok(self
            .records
            .remove(user_id)
            .map(|(_, records)| records.len())
            .unwrap_or(0))
    }
}
