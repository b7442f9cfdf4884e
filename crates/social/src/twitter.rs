use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::normalize::{newer_id, next_token, normalize_search};
use crate::rate_gate::{RateGate, resume_time};
use crate::{Delivery, EventSource, MentionPage, ReplyChannel, SocialError, SourceError};

/// Longest reply the platform accepts, in characters.
pub const MAX_REPLY_CHARS: usize = 280;

const SEARCH_FIELDS: &[(&str, &str)] = &[
    ("tweet.fields", "id,text,author_id,created_at"),
    ("user.fields", "id,username,name"),
    ("expansions", "author_id"),
    ("max_results", "100"),
];

#[derive(Debug, Clone)]
pub struct XClientConfig {
    pub api_base: String,
    /// App-only token used for search.
    pub bearer_token: Option<String>,
    /// User-context token used to post as the bot.
    pub user_token: Option<String>,
    pub request_timeout: Duration,
}

/// X API v2 client serving as both [`EventSource`] and [`ReplyChannel`].
///
/// Search and posting are limited independently, so each has its own gate.
pub struct XClient {
    http: reqwest::Client,
    api_base: String,
    bearer_token: Option<String>,
    user_token: Option<String>,
    search_gate: RateGate,
    post_gate: RateGate,
}

#[derive(Debug, Deserialize)]
struct PostedTweet {
    data: PostedTweetData,
}

#[derive(Debug, Deserialize)]
struct PostedTweetData {
    id: String,
}

/// Cut `text` to at most [`MAX_REPLY_CHARS`] characters.
pub fn truncate_reply(text: &str) -> String {
    text.chars().take(MAX_REPLY_CHARS).collect()
}

impl XClient {
    pub fn new(config: XClientConfig) -> Result<Self, SocialError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("quasar-tipbot"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        let token = |t: Option<String>| {
            t.map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        };
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bearer_token: token(config.bearer_token),
            user_token: token(config.user_token),
            search_gate: RateGate::new(),
            post_gate: RateGate::new(),
        })
    }
}

impl XClient {
    async fn fetch_search_page(
        &self,
        token: &str,
        query: &str,
        since_id: Option<&str>,
        pagination_token: Option<&str>,
    ) -> Result<Value, SourceError> {
        let now = Utc::now();
        if let Some(resume_at) = self.search_gate.blocked_until(now) {
            debug!(%resume_at, "Search skipped, rate limit still active");
            return Err(SourceError::RateLimited {
                resume_at: Some(resume_at),
            });
        }

        let mut request = self
            .http
            .get(format!("{}/2/tweets/search/recent", self.api_base))
            .bearer_auth(token)
            .query(&[("query", query)])
            .query(SEARCH_FIELDS);
        if let Some(since_id) = since_id {
            request = request.query(&[("since_id", since_id)]);
        }
        if let Some(pagination_token) = pagination_token {
            request = request.query(&[("pagination_token", pagination_token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Upstream(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let resume_at = resume_time(response.headers(), now);
            self.search_gate.block_until(resume_at);
            warn!(%resume_at, "Search rate limited");
            return Err(SourceError::RateLimited {
                resume_at: Some(resume_at),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Upstream(format!("search returned {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| SourceError::UnexpectedShape(e.to_string()))
    }
}

#[async_trait]
impl EventSource for XClient {
    /// Every page newer than `since_id`. Results arrive newest first, so
    /// stopping early would leave older mentions behind the next cursor.
    /// A failure on any page fails the whole search.
    #[tracing::instrument(skip(self))]
    async fn search(&self, query: &str, since_id: Option<&str>) -> Result<MentionPage, SourceError> {
        let Some(token) = &self.bearer_token else {
            return Err(SourceError::Upstream("search token is not configured".into()));
        };

        let mut merged = MentionPage::default();
        let mut pagination: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let body = self
                .fetch_search_page(token, query, since_id, pagination.as_deref())
                .await?;
            let page = normalize_search(&body)?;
            pages += 1;

            merged.newest_id = match (merged.newest_id.take(), page.newest_id) {
                (Some(a), Some(b)) => Some(newer_id(&a, &b).to_string()),
                (a, b) => a.or(b),
            };
            merged.mentions.extend(page.mentions);

            match next_token(&body) {
                Some(next) if pagination.as_deref() != Some(next.as_str()) => {
                    pagination = Some(next);
                }
                _ => break,
            }
        }

        debug!(pages, count = merged.mentions.len(), newest_id = ?merged.newest_id, "Search complete");
        Ok(merged)
    }
}

#[async_trait]
impl ReplyChannel for XClient {
    fn name(&self) -> &str {
        "x"
    }

    #[tracing::instrument(skip(self, text))]
    async fn post_reply(&self, text: &str, in_reply_to: &str) -> Delivery {
        // Retryable so queued replies go out once a token is configured.
        let Some(token) = &self.user_token else {
            return Delivery::Retryable {
                error: "posting token is not configured".into(),
                resume_at: None,
            };
        };
        let now = Utc::now();
        if let Some(resume_at) = self.post_gate.blocked_until(now) {
            return Delivery::Retryable {
                error: "post rate limit still active".into(),
                resume_at: Some(resume_at),
            };
        }

        let payload = json!({
            "text": truncate_reply(text),
            "reply": {"in_reply_to_tweet_id": in_reply_to},
        });
        let response = match self
            .http
            .post(format!("{}/2/tweets", self.api_base))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Delivery::Retryable {
                    error: e.to_string(),
                    resume_at: None,
                };
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let resume_at = resume_time(response.headers(), now);
            self.post_gate.block_until(resume_at);
            warn!(%resume_at, "Reply rate limited");
            return Delivery::Retryable {
                error: "rate limited".into(),
                resume_at: Some(resume_at),
            };
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = format!("post returned {status}: {body}");
            return match status {
                StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                    Delivery::Fatal { error }
                }
                _ => Delivery::Retryable {
                    error,
                    resume_at: None,
                },
            };
        }

        // The reply is live at this point; a malformed body must not cause a repost.
        match response.json::<PostedTweet>().await {
            Ok(posted) => {
                info!(reply_id = %posted.data.id, "Reply posted");
                Delivery::Sent {
                    reply_id: posted.data.id,
                }
            }
            Err(e) => {
                warn!(error = %e, "Reply posted but response body was unreadable");
                Delivery::Sent {
                    reply_id: String::new(),
                }
            }
        }
    }
}
