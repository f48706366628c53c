//! # Query Service Module
//!
//! Historical reads for the history endpoint. Runs SQLite work on the
//! blocking pool so it never stalls the live path.

use crate::error::StoreError;
use crate::sample::{now_ms, AggregateBucket, Granularity, Sample};
use crate::store::SampleStore;
use serde::{Deserialize, Serialize};

/// Resolution of a history request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryGranularity {
    #[default]
    Raw,
    Minute,
    Hour,
    Day,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub granularity: HistoryGranularity,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "granularity", content = "data", rename_all = "lowercase")]
pub enum History {
    Raw(Vec<Sample>),
    Buckets(Vec<AggregateBucket>),
}

impl History {
    pub fn len(&self) -> usize {
        match self {
            History::Raw(samples) => samples.len(),
            History::Buckets(buckets) => buckets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct QueryService {
    store: SampleStore,
    max_raw_rows: usize,
    default_limit: Option<usize>,
}

impl QueryService {
    pub fn new(store: SampleStore, max_raw_rows: usize) -> Self {
        Self {
            store,
            max_raw_rows,
            default_limit: None,
        }
    }

    /// Limit applied to requests that do not carry one; 0 disables it
    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = (limit > 0).then_some(limit);
        self
    }

    /// Answer a history request. Open bounds default to everything up to now.
    pub async fn history(&self, query: HistoryQuery) -> Result<History, StoreError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.history_blocking(&query))
            .await
            .map_err(|e| StoreError::QueryFailed(format!("query task failed: {}", e)))?
    }

    fn history_blocking(&self, query: &HistoryQuery) -> Result<History, StoreError> {
        let from = query.from.unwrap_or(0);
        let to = query.to.unwrap_or_else(|| now_ms() + 1);
        let limit = query.limit.or(self.default_limit);

        let granularity = match query.granularity {
            HistoryGranularity::Raw => return self.raw(from, to, limit).map(History::Raw),
            HistoryGranularity::Minute => Granularity::Minute,
            HistoryGranularity::Hour => Granularity::Hour,
            HistoryGranularity::Day => Granularity::Day,
        };

        let mut buckets = self.store.query_aggregate(from, to, granularity)?;
        if let Some(limit) = limit {
            let skip = buckets.len().saturating_sub(limit);
            buckets.drain(..skip);
        }
        Ok(History::Buckets(buckets))
    }

    fn raw(&self, from: i64, to: i64, limit: Option<usize>) -> Result<Vec<Sample>, StoreError> {
        match limit {
            Some(limit) => self.store.query_raw_tail(from, to, limit.min(self.max_raw_rows)),
            None => {
                let samples = self
                    .store
                    .query_raw(from, to)
                    .take(self.max_raw_rows)
                    .collect::<Result<Vec<_>, _>>()?;
                if samples.len() == self.max_raw_rows {
                    log::warn!("Raw history truncated at {} rows", self.max_raw_rows);
                }
                Ok(samples)
            }
        }
    }
}
