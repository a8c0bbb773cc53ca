//! Chat-history queries and the import/export document.

use crate::error::ApiClientError;
use crate::llm::LlmProviderKind;
use crate::session::Session;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const EXPORT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    CreatedAt,
    #[default]
    UpdatedAt,
    Title,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default = "HistoryQuery::default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<LlmProviderKind>,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub sort_order: SortOrder,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
            query: None,
            provider: None,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl HistoryQuery {
    fn default_limit() -> u32 {
        DEFAULT_PAGE_SIZE
    }

    pub fn search(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ApiClientError> {
        if !(1..=MAX_PAGE_SIZE).contains(&self.limit) {
            return Err(ApiClientError::validation(format!(
                "Limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(())
    }

    /// Query-string form used by `GET /api/chat-history`.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("limit".to_string(), self.limit.to_string()),
            ("offset".to_string(), self.offset.to_string()),
        ];
        if let Some(query) = self.needle() {
            pairs.push(("query".to_string(), query.to_string()));
        }
        if let Some(provider) = self.provider {
            pairs.push(("provider".to_string(), provider.to_string()));
        }
        let sort_by = match self.sort_by {
            SortBy::CreatedAt => "createdAt",
            SortBy::UpdatedAt => "updatedAt",
            SortBy::Title => "title",
        };
        let sort_order = match self.sort_order {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        };
        pairs.push(("sortBy".to_string(), sort_by.to_string()));
        pairs.push(("sortOrder".to_string(), sort_order.to_string()));
        pairs
    }

    fn needle(&self) -> Option<&str> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|query| !query.is_empty())
    }

    /// Filters, sorts and paginates a local collection.
    pub fn apply(&self, sessions: &[Session]) -> Result<HistoryPage, ApiClientError> {
        self.validate()?;
        let needle = self.needle().map(str::to_lowercase);
        let mut matched: Vec<&Session> = sessions
            .iter()
            .filter(|session| needle.as_deref().map_or(true, |needle| session.matches(needle)))
            .filter(|session| self.provider.map_or(true, |provider| session.provider == provider))
            .collect();

        matched.sort_by(|a, b| {
            let ordering = match self.sort_by {
                SortBy::CreatedAt => a.created_at.cmp(&b.created_at),
                SortBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                SortBy::Title => compare_titles(&a.title, &b.title),
            };
            match self.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = matched.len();
        let start = (self.offset as usize).min(total);
        let end = start.saturating_add(self.limit as usize).min(total);
        let sessions = matched[start..end]
            .iter()
            .map(|session| SessionSummary::from(*session))
            .collect();

        Ok(HistoryPage {
            sessions,
            total,
            has_more: end < total,
        })
    }
}

fn compare_titles(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b))
}

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: uuid::Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provider: LlmProviderKind,
    pub model: String,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            title: session.title.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            provider: session.provider,
            model: session.model.clone(),
            message_count: session.messages.len(),
            last_message: session
                .messages
                .last()
                .map(|message| message.content.chars().take(PREVIEW_CHARS).collect()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub total_sessions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

/// Portable snapshot of the whole history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryExport {
    pub version: String,
    pub export_date: DateTime<Utc>,
    pub sessions: Vec<Session>,
    pub metadata: ExportMetadata,
}

impl HistoryExport {
    pub fn new(sessions: Vec<Session>) -> Self {
        let earliest = sessions.iter().map(|session| session.created_at).min();
        let latest = sessions.iter().map(|session| session.updated_at).max();
        let date_range = earliest
            .zip(latest)
            .map(|(earliest, latest)| DateRange { earliest, latest });
        Self {
            version: EXPORT_VERSION.to_string(),
            export_date: Utc::now(),
            metadata: ExportMetadata {
                total_sessions: sessions.len(),
                date_range,
            },
            sessions,
        }
    }
}
