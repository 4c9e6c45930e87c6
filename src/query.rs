//! Search query rendering and feed window construction.

use crate::config::{Filters, SortOrder};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Built-in detection tags accepted by the search endpoint.
pub const SUPPORTED_TAGS: &[&str] = &[
    "SQLI",
    "XSS",
    "CMDEXE",
    "TRAVERSAL",
    "USERAGENT",
    "BACKDOOR",
    "SCANNER",
    "RESPONSESPLIT",
    "CODEINJECTION",
    "HTTP4XX",
    "HTTP404",
    "HTTP500",
    "SANS",
    "DATACENTER",
    "TORNODE",
    "NOUA",
    "NOTUTF8",
    "BLOCKED",
    "PRIVATEFILES",
    "FORCEFULBROWSING",
    "WEAKTLS",
];

pub const DEFAULT_FROM: &str = "-1h";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Invalid tag in tag list: {0}")]
    InvalidTag(String),
}

/// Fails on the first tag that is not in [`SUPPORTED_TAGS`] (case-insensitive).
pub fn validate_tags(tags: &[String]) -> Result<(), QueryError> {
    match tags
        .iter()
        .find(|tag| !SUPPORTED_TAGS.iter().any(|s| s.eq_ignore_ascii_case(tag)))
    {
        Some(bad) => Err(QueryError::InvalidTag(bad.clone())),
        None => Ok(()),
    }
}

/// Filter and paging parameters for the `requests` search endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySpec {
    pub from_time: Option<String>,
    pub until_time: Option<String>,
    pub server: Option<String>,
    pub sort: Option<SortOrder>,
    pub tags: Option<Vec<String>>,
    pub ctags: Option<Vec<String>>,
    pub limit: u32,
}

impl QuerySpec {
    /// Builds the search query, falling back to `from:-1h` when no start time is set.
    pub fn for_search(filters: &Filters) -> Self {
        Self {
            from_time: Some(
                filters
                    .from_time
                    .clone()
                    .unwrap_or_else(|| DEFAULT_FROM.to_string()),
            ),
            until_time: filters.until_time.clone(),
            server: filters.server.clone(),
            sort: filters.sort,
            tags: filters.tags.clone(),
            ctags: filters.ctags.clone(),
            limit: filters.limit,
        }
    }

    /// Renders the `q` parameter. Token order is fixed:
    /// `from until server sort tag... ctag...`.
    ///
    /// Every token but the last custom tag carries a trailing space; callers
    /// trim before sending.
    pub fn render(&self) -> String {
        let mut query = String::new();

        if let Some(from) = &self.from_time {
            query.push_str(&format!("from:{from} "));
        }
        if let Some(until) = &self.until_time {
            query.push_str(&format!("until:{until} "));
        }
        if let Some(server) = &self.server {
            query.push_str(&format!("server:{server} "));
        }
        if let Some(sort) = self.sort {
            query.push_str(&format!("sort:time-{} ", sort.as_str()));
        }
        if let Some(tags) = self.tags.as_ref().filter(|t| !t.is_empty()) {
            query.push_str("tag:");
            query.push_str(&tags.join(" tag:"));
            query.push(' ');
        }
        if let Some(ctags) = self.ctags.as_ref().filter(|t| !t.is_empty()) {
            query.push_str("tag:");
            query.push_str(&ctags.join(" tag:"));
        }

        query
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("q", self.render().trim().to_string()),
            ("limit", self.limit.to_string()),
        ]
    }
}

/// Time window and tag filter for the `feed/requests` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedWindow {
    pub from: String,
    pub until: String,
    pub tags: Vec<String>,
}

impl FeedWindow {
    /// Unset bounds default to `now - 65m` and `now - 5m`, truncated to the minute.
    pub fn from_filters(filters: &Filters, now: DateTime<Utc>) -> Self {
        let from = filters
            .from_time
            .clone()
            .unwrap_or_else(|| minute_floor(now - Duration::minutes(65)).to_string());
        let until = filters
            .until_time
            .clone()
            .unwrap_or_else(|| minute_floor(now - Duration::minutes(5)).to_string());

        let tags = filters
            .tags
            .iter()
            .chain(filters.ctags.iter())
            .flatten()
            .cloned()
            .collect();

        Self { from, until, tags }
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("from", self.from.clone()), ("until", self.until.clone())];
        if !self.tags.is_empty() {
            params.push(("tags", self.tags.join(",")));
        }
        params
    }
}

fn minute_floor(at: DateTime<Utc>) -> i64 {
    let ts = at.timestamp();
    ts - ts.rem_euclid(60)
}
