//! Common types and utilities shared across models.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LIST_LIMIT: i64 = 16;
pub const MAX_LIST_LIMIT: i64 = 100;

/// Current time in the format every `created_at`/`updated_at` column uses.
///
/// Nanosecond precision keeps rows created in the same request ordered.
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a stored timestamp, falling back to the epoch for malformed values
pub fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Unix seconds of a stored timestamp, used to free unique names on delete
pub fn created_unix(value: &str) -> i64 {
    parse_timestamp(value).timestamp()
}

/// Unix nanoseconds of a stored timestamp
pub fn created_nanos(value: &str) -> i64 {
    parse_timestamp(value)
        .timestamp_nanos_opt()
        .unwrap_or_default()
}

pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Query parameters shared by every list endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    /// Column name, prefixed with `-` for descending order
    pub order: Option<String>,
    /// Substring filter on the resource name
    pub q: Option<String>,
}

impl ListQuery {
    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    pub fn limit(&self) -> i64 {
        match self.limit {
            Some(limit) if limit > 0 => limit.min(MAX_LIST_LIMIT),
            _ => DEFAULT_LIST_LIMIT,
        }
    }

    /// `LIKE` pattern for `q`, if one was given
    pub fn pattern(&self) -> Option<String> {
        self.q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(|q| format!("%{}%", q))
    }

    /// Build an `ORDER BY` clause from `order`.
    ///
    /// Only columns in `allowed` are accepted; anything else falls back to
    /// `default` so user input never reaches the SQL text.
    pub fn order_by(&self, allowed: &[&str], default: &str) -> String {
        let requested = self.order.as_deref().map(str::trim).unwrap_or("");
        order_clause(requested, allowed)
            .or_else(|| order_clause(default, allowed))
            .unwrap_or_else(|| "id ASC".to_string())
    }
}

fn order_clause(order: &str, allowed: &[&str]) -> Option<String> {
    let (column, direction) = match order.strip_prefix('-') {
        Some(column) => (column, "DESC"),
        None => (order, "ASC"),
    };
    allowed
        .contains(&column)
        .then(|| format!("{} {}", column, direction))
}

/// Paginated list envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
    pub items: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(total: i64, query: &ListQuery, items: Vec<T>) -> Self {
        Self {
            total,
            offset: query.offset(),
            limit: query.limit(),
            items,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> ListResponse<U> {
        ListResponse {
            total: self.total,
            offset: self.offset,
            limit: self.limit,
            items: self.items.into_iter().map(f).collect(),
        }
    }
}

/// Body returned by delete endpoints, pointing at the collection to reload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectResponse {
    pub redirect: String,
}

impl RedirectResponse {
    pub fn to(path: impl Into<String>) -> Self {
        Self {
            redirect: path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_query_defaults() {
        let query = ListQuery::default();
        assert_eq!(query.offset(), 0);
        assert_eq!(query.limit(), DEFAULT_LIST_LIMIT);
        assert!(query.pattern().is_none());
    }

    #[test]
    fn test_list_query_clamps() {
        let query = ListQuery {
            offset: Some(-4),
            limit: Some(1000),
            ..Default::default()
        };
        assert_eq!(query.offset(), 0);
        assert_eq!(query.limit(), MAX_LIST_LIMIT);

        let zero = ListQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(zero.limit(), DEFAULT_LIST_LIMIT);
    }

    #[test]
    fn test_order_by() {
        let allowed = ["created_at", "name"];
        let query = ListQuery {
            order: Some("-name".to_string()),
            ..Default::default()
        };
        assert_eq!(query.order_by(&allowed, "-created_at"), "name DESC");

        let query = ListQuery {
            order: Some("name".to_string()),
            ..Default::default()
        };
        assert_eq!(query.order_by(&allowed, "-created_at"), "name ASC");

        let query = ListQuery::default();
        assert_eq!(query.order_by(&allowed, "-created_at"), "created_at DESC");
    }

    #[test]
    fn test_order_by_rejects_unknown_columns() {
        let query = ListQuery {
            order: Some("name; DROP TABLE users".to_string()),
            ..Default::default()
        };
        assert_eq!(
            query.order_by(&["created_at", "name"], "-created_at"),
            "created_at DESC"
        );
    }

    #[test]
    fn test_pattern() {
        let query = ListQuery {
            q: Some("  web ".to_string()),
            ..Default::default()
        };
        assert_eq!(query.pattern().as_deref(), Some("%web%"));
    }

    #[test]
    fn test_timestamps() {
        let ts = "2024-03-01T10:00:00.000000123Z";
        assert_eq!(created_unix(ts), 1709287200);
        assert_eq!(created_nanos(ts), 1709287200_000_000_123);
        assert_eq!(created_unix("garbage"), 0);
        assert!(parse_timestamp(&now()).timestamp() > 0);
    }
}
