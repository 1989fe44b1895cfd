use std::time::{Duration, SystemTime};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::record::{ConversationRecord, RemoteConversation};

const DEFAULT_BASE_URL: &str = "https://api.intercom.io";
const API_VERSION: &str = "2.11";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConvoError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("invalid conversation record: {0}")]
    InvalidRecord(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Inclusive `updated_at` bounds, in unix seconds, for a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatedWindow {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationPage {
    pub records: Vec<ConversationRecord>,
    /// Opaque; hand back unchanged to fetch the following page.
    pub next_cursor: Option<String>,
    pub total_count: Option<u64>,
}

#[derive(Clone)]
pub struct ConvoClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl ConvoClient {
    pub fn new(token: impl Into<String>) -> Result<Self, ConvoError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, ConvoError> {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ConvoError> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Fetches one page of conversations updated inside `window`, oldest first.
    pub async fn search_conversations(
        &self,
        window: UpdatedWindow,
        cursor: Option<&str>,
        per_page: u32,
    ) -> Result<ConversationPage, ConvoError> {
        let url = self.endpoint("/conversations/search")?;
        // The search API only offers strict comparisons.
        let body = SearchRequest {
            query: SearchQuery {
                operator: "AND",
                value: vec![
                    SearchClause {
                        field: "updated_at",
                        operator: ">",
                        value: window.start.saturating_sub(1),
                    },
                    SearchClause {
                        field: "updated_at",
                        operator: "<",
                        value: window.end.saturating_add(1),
                    },
                ],
            },
            pagination: Pagination {
                per_page: per_page.clamp(1, 150),
                starting_after: cursor,
            },
            sort: Sort {
                field: "updated_at",
                order: "ascending",
            },
        };
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header("Intercom-Version", API_VERSION)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;
        let payload: SearchResponse = Self::handle_response(response).await?;

        let records = payload
            .conversations
            .into_iter()
            .map(ConversationRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let next_cursor = payload
            .pages
            .and_then(|pages| pages.next)
            .and_then(|next| next.starting_after)
            .filter(|cursor| !cursor.is_empty());

        Ok(ConversationPage {
            records,
            next_cursor,
            total_count: payload.total_count,
        })
    }

    /// Returns `Ok(None)` when the remote has no conversation with `id`.
    pub async fn get_conversation(
        &self,
        id: &str,
    ) -> Result<Option<ConversationRecord>, ConvoError> {
        let mut url = self.endpoint("/conversations/")?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push(id);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header("Intercom-Version", API_VERSION)
            .header("Accept", "application/json")
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let remote: RemoteConversation = Self::handle_response(response).await?;
        Ok(Some(ConversationRecord::try_from(remote)?))
    }

    fn endpoint(&self, path: &str) -> Result<Url, ConvoError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ConvoError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let retry_after = parse_retry_after(response.headers(), SystemTime::now());
            let body = response.text().await.unwrap_or_default();
            Err(ConvoError::Api {
                status,
                body,
                retry_after,
            })
        }
    }
}

impl ConvoError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ConvoError::Api { status, .. } => Some(classify_api_status(*status)),
            // A body that arrived but does not parse will not parse on retry either.
            ConvoError::Request(err) if err.is_decode() => None,
            ConvoError::Request(_) => Some(ApiErrorClass::Transient),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ConvoError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(raw).ok()?;
    Some(at.duration_since(now).unwrap_or(Duration::ZERO))
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: SearchQuery,
    pagination: Pagination<'a>,
    sort: Sort,
}

#[derive(Debug, Serialize)]
struct SearchQuery {
    operator: &'static str,
    value: Vec<SearchClause>,
}

#[derive(Debug, Serialize)]
struct SearchClause {
    field: &'static str,
    operator: &'static str,
    value: i64,
}

#[derive(Debug, Serialize)]
struct Pagination<'a> {
    per_page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    starting_after: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Sort {
    field: &'static str,
    order: &'static str,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    conversations: Vec<RemoteConversation>,
    #[serde(default)]
    total_count: Option<u64>,
    #[serde(default)]
    pages: Option<Pages>,
}

#[derive(Debug, Deserialize)]
struct Pages {
    #[serde(default)]
    next: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
struct NextPage {
    #[serde(default)]
    starting_after: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::UNPROCESSABLE_ENTITY),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn auth_and_permanent_errors_are_not_retryable() {
        let err = ConvoError::Api {
            status: StatusCode::FORBIDDEN,
            body: String::new(),
            retry_after: None,
        };
        assert!(!err.is_retryable());
        let err = ConvoError::Api {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
            retry_after: None,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn retry_after_accepts_seconds_and_http_dates() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_445_412_480);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(
            parse_retry_after(&headers, now),
            Some(Duration::from_secs(7))
        );

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:10 GMT"),
        );
        assert_eq!(
            parse_retry_after(&headers, now),
            Some(Duration::from_secs(10))
        );

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers, now), None);
    }
}
