//! The single place where X search payloads turn into [`Mention`]s.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use quasar_core::Handle;
use serde::Deserialize;
use serde_json::Value;

use crate::{Mention, MentionPage, SourceError};

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    data: Vec<RawTweet>,
    #[serde(default)]
    includes: Option<Includes>,
    #[serde(default)]
    meta: Option<Meta>,
}

/// Ids are strings in v2 payloads but some proxies emit numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(u64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTweet {
    id: RawId,
    text: String,
    #[serde(default)]
    author_id: Option<RawId>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: RawId,
    username: String,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    newest_id: Option<String>,
    #[serde(default)]
    next_token: Option<String>,
}

/// Pagination token for the page after `body`, if the source reported one.
pub fn next_token(body: &Value) -> Option<String> {
    body.get("meta")
        .and_then(|meta| Meta::deserialize(meta).ok())
        .and_then(|meta| meta.next_token)
        .filter(|token| !token.is_empty())
}

/// Orders numeric ids without parsing them: longer is larger, then lexical.
pub fn newer_id<'a>(a: &'a str, b: &'a str) -> &'a str {
    if (b.len(), b) > (a.len(), a) { b } else { a }
}

fn placeholder_handle(author_id: Option<&str>) -> Option<Handle> {
    match author_id {
        Some(id) => Handle::parse(&format!("unknown_{id}")),
        None => Handle::parse("unknown"),
    }
}

/// Normalize a recent-search response body.
///
/// Authors are resolved through `includes.users`; an author missing from
/// the expansion becomes `@unknown_<author id>`.
pub fn normalize_search(body: &Value) -> Result<MentionPage, SourceError> {
    let Some(object) = body.as_object() else {
        return Err(SourceError::UnexpectedShape("body is not an object".into()));
    };
    if !["data", "meta", "includes"].iter().any(|k| object.contains_key(*k)) {
        let keys: Vec<_> = object.keys().map(String::as_str).collect();
        return Err(SourceError::UnexpectedShape(format!(
            "no data, meta or includes field (got [{}])",
            keys.join(", ")
        )));
    }

    let envelope = SearchEnvelope::deserialize(body)
        .map_err(|e| SourceError::UnexpectedShape(e.to_string()))?;

    let users: HashMap<String, String> = envelope
        .includes
        .unwrap_or_default()
        .users
        .into_iter()
        .map(|u| (u.id.into_string(), u.username))
        .collect();

    let mut newest = envelope.meta.unwrap_or_default().newest_id;
    let mut mentions = Vec::with_capacity(envelope.data.len());
    for tweet in envelope.data {
        let id = tweet.id.into_string();
        let author_id = tweet.author_id.map(RawId::into_string);
        let author = author_id
            .as_deref()
            .and_then(|aid| users.get(aid))
            .and_then(|username| Handle::parse(username))
            .or_else(|| placeholder_handle(author_id.as_deref()));
        let Some(author) = author else {
            return Err(SourceError::UnexpectedShape(format!(
                "tweet {id} has an unusable author id"
            )));
        };

        newest = Some(match newest {
            Some(current) => newer_id(&current, &id).to_string(),
            None => id.clone(),
        });
        mentions.push(Mention {
            id,
            text: tweet.text,
            author,
            created_at: tweet.created_at,
        });
    }

    Ok(MentionPage {
        mentions,
        newest_id: newest,
    })
}
