//! Tool contracts exposed to the calling agent.
//!
//! Framing is left to the outer protocol layer; [`ToolService::call`] takes a
//! tool name and JSON arguments and returns a JSON result.

use std::time::Duration;

use convo_core::ConversationRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::shaper::ResponseShaper;
use crate::sync::dispatcher::{Freshness, QueryDispatcher};
use crate::sync::engine::EngineStatus;
use crate::sync::job::JobId;
use crate::sync::range::TimeRange;
use crate::sync::store::SearchFilters;
use crate::sync::{CONVERSATIONS, SyncError, now_unix};

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;
const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("sync did not finish within {0:?}")]
    SyncTimeout(Duration),
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "not_found",
            ToolError::InvalidInterval(_) => "invalid_interval",
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::SyncTimeout(_) => "sync_timeout",
            ToolError::FetchFailed(_) => "fetch_failed",
            ToolError::Internal(_) => "internal",
        }
    }
}

impl From<SyncError> for ToolError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::InvalidInterval(message) => ToolError::InvalidInterval(message),
            SyncError::SyncTimeout(waited) => ToolError::SyncTimeout(waited),
            SyncError::UnknownStream(stream) => ToolError::NotFound(stream),
            SyncError::TransientFetch { .. } | SyncError::PermanentFetch(_) => {
                ToolError::FetchFailed(err.to_string())
            }
            SyncError::Store(_) | SyncError::ShuttingDown => ToolError::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        ToolError::Internal(err.to_string())
    }
}

/// A point in time: unix seconds or an RFC 3339 string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TimeValue {
    Unix(i64),
    Text(String),
}

impl TimeValue {
    fn to_unix(&self) -> Result<i64, ToolError> {
        match self {
            TimeValue::Unix(seconds) => Ok(*seconds),
            TimeValue::Text(text) => {
                let text = text.trim();
                if let Ok(seconds) = text.parse::<i64>() {
                    return Ok(seconds);
                }
                OffsetDateTime::parse(text, &Rfc3339)
                    .map(OffsetDateTime::unix_timestamp)
                    .map_err(|err| ToolError::InvalidInterval(format!("{text}: {err}")))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Timeframe {
    LastDays { last_days: u32 },
    Range { start: TimeValue, end: TimeValue },
}

impl Timeframe {
    /// `None` for an empty (inverted) range.
    pub fn resolve(&self, now: i64) -> Result<Option<TimeRange>, ToolError> {
        let (start, end) = match self {
            Timeframe::LastDays { last_days } => {
                (now.saturating_sub(i64::from(*last_days) * SECS_PER_DAY), now)
            }
            Timeframe::Range { start, end } => (start.to_unix()?, end.to_unix()?),
        };
        Ok(TimeRange::request(start, end)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub filters: SearchFilters,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FreshnessView {
    pub as_of: Option<String>,
    pub syncing: bool,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<Freshness> for FreshnessView {
    fn from(freshness: Freshness) -> Self {
        Self {
            as_of: freshness.as_of.and_then(format_unix),
            syncing: freshness.syncing,
            stale: freshness.stale,
            last_error: freshness.last_error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub records: Vec<ConversationRecord>,
    pub freshness: FreshnessView,
    pub truncated: bool,
    pub omitted: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetByIdRequest {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerSyncRequest {
    pub timeframe: Timeframe,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerSyncResponse {
    pub gaps: Vec<TimeRange>,
    pub job_ids: Vec<JobId>,
}

#[derive(Clone)]
pub struct ToolService {
    dispatcher: QueryDispatcher,
    shaper: ResponseShaper,
}

impl ToolService {
    pub fn new(dispatcher: QueryDispatcher) -> Self {
        let shaper = ResponseShaper::new(dispatcher.engine().config().max_response_bytes);
        Self { dispatcher, shaper }
    }

    pub async fn call(&self, tool: &str, arguments: Value) -> Result<Value, ToolError> {
        match tool {
            "search" => {
                let request = parse_arguments(arguments)?;
                Ok(serde_json::to_value(self.search(request).await?)?)
            }
            "get_by_id" => {
                let request: GetByIdRequest = parse_arguments(arguments)?;
                Ok(serde_json::to_value(self.get_by_id(&request.id).await?)?)
            }
            "sync_status" => Ok(serde_json::to_value(self.sync_status().await)?),
            "trigger_sync" => {
                let request = parse_arguments(arguments)?;
                Ok(serde_json::to_value(self.trigger_sync(request).await?)?)
            }
            other => Err(ToolError::NotFound(format!("tool {other}"))),
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, ToolError> {
        let limit = request.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let Some(range) = request.timeframe.resolve(now_unix())? else {
            return Ok(SearchResponse {
                records: Vec::new(),
                freshness: Freshness::default().into(),
                truncated: false,
                omitted: 0,
            });
        };
        let result = self
            .dispatcher
            .query(CONVERSATIONS, range, &request.filters, limit)
            .await?;

        let freshness = FreshnessView::from(result.freshness);
        let overhead = serde_json::to_vec(&SearchResponse {
            records: Vec::new(),
            freshness: freshness.clone(),
            truncated: true,
            omitted: usize::MAX,
        })?
        .len();
        let shaped = self.shaper.fit(result.records, overhead)?;
        Ok(SearchResponse {
            records: shaped.records,
            freshness,
            truncated: shaped.truncated,
            omitted: shaped.omitted,
        })
    }

    pub async fn get_by_id(&self, id: &str) -> Result<ConversationRecord, ToolError> {
        self.dispatcher
            .get_by_id(id)
            .await?
            .ok_or_else(|| ToolError::NotFound(format!("conversation {id}")))
    }

    pub async fn sync_status(&self) -> EngineStatus {
        self.dispatcher.engine().status().await
    }

    pub async fn trigger_sync(
        &self,
        request: TriggerSyncRequest,
    ) -> Result<TriggerSyncResponse, ToolError> {
        let Some(range) = request.timeframe.resolve(now_unix())? else {
            return Ok(TriggerSyncResponse {
                gaps: Vec::new(),
                job_ids: Vec::new(),
            });
        };
        let ticket = self
            .dispatcher
            .engine()
            .request_sync(CONVERSATIONS, range, request.force)
            .await?;
        Ok(TriggerSyncResponse {
            job_ids: ticket.job_ids(),
            gaps: ticket.gaps,
        })
    }
}

fn parse_arguments<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|err| ToolError::InvalidArguments(err.to_string()))
}

fn format_unix(seconds: i64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(seconds)
        .ok()?
        .format(&Rfc3339)
        .ok()
}
