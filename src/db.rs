//! SQLite persistence for sources and the three queue item collections.

use serde::{Deserialize, Serialize};

use crate::message::MessageState;

pub mod archive;
pub mod error_record;
pub mod pending;
pub mod source;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 1000;

/// Paging and filtering for listing a collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub offset: i64,
    pub limit: Option<i64>,
    /// Ignored for error records, which have no state.
    pub state: Option<MessageState>,
    /// Matched against the payload and the correlation key.
    pub query: Option<String>,
}

impl ListQuery {
    pub fn offset(&self) -> i64 {
        self.offset.max(0)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    fn pattern(&self) -> Option<String> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(|q| format!("%{q}%"))
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}
