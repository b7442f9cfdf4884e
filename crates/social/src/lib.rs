//! Collaborators on the social side of the bot: where mentions come from,
//! where replies go, and who hears about replies that could not be posted.

pub mod normalize;
pub mod rate_gate;
pub mod telegram;
pub mod twitter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quasar_core::Handle;
use thiserror::Error;

pub use rate_gate::RateGate;
pub use telegram::TelegramNotifier;
pub use twitter::{XClient, XClientConfig};

/// A mention in canonical shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub id: String,
    pub text: String,
    pub author: Handle,
    pub created_at: Option<DateTime<Utc>>,
}

/// One search result page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MentionPage {
    pub mentions: Vec<Mention>,
    /// Newest id the source reported, usable as the next `since` cursor.
    pub newest_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("event source rate limited until {resume_at:?}")]
    RateLimited { resume_at: Option<DateTime<Utc>> },

    #[error("event source unavailable: {0}")]
    Upstream(String),

    /// The response matched none of the known payload shapes.
    #[error("unexpected search response shape: {0}")]
    UnexpectedShape(String),
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn search(&self, query: &str, since_id: Option<&str>) -> Result<MentionPage, SourceError>;
}

/// Outcome of one reply attempt on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent {
        reply_id: String,
    },
    /// Worth trying again, at `resume_at` if the channel said when.
    Retryable {
        error: String,
        resume_at: Option<DateTime<Utc>>,
    },
    /// This channel will never accept the reply.
    Fatal {
        error: String,
    },
}

#[async_trait]
pub trait ReplyChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn post_reply(&self, text: &str, in_reply_to: &str) -> Delivery;
}

/// What the operator needs to post a reply by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorContext {
    pub event_id: String,
    pub settlement_ref: Option<String>,
}

#[derive(Debug, Error)]
pub enum SocialError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn notify_operator(&self, text: &str, context: &OperatorContext)
    -> Result<(), SocialError>;
}
