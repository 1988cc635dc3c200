//! Shared pagination and search types for API query parameters.
//!
//! Every admin list endpoint uses offset-based pagination with `skip` and `limit`, plus an
//! optional case-insensitive `q` search on the entity's search field.

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use utoipa::{IntoParams, ToSchema};

use crate::db::handlers::repository::ListQuery;

/// Default number of items to return per page.
pub const DEFAULT_LIMIT: i64 = 10;

/// Maximum number of items that can be requested per page.
pub const MAX_LIMIT: i64 = 100;

/// Standard pagination parameters for admin API list endpoints.
///
/// The `limit` is clamped to ensure it's always between 1 and 100,
/// preventing both zero-result queries and excessive data fetching.
#[serde_as]
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct Pagination {
    /// Number of items to skip (default: 0)
    #[param(default = 0, minimum = 0)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub skip: Option<i64>,

    /// Maximum number of items to return (default: 10, max: 100)
    #[param(default = 10, minimum = 1, maximum = 100)]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub limit: Option<i64>,
}

impl Pagination {
    /// Get the skip value, defaulting to 0 if not specified.
    #[inline]
    pub fn skip(&self) -> i64 {
        self.skip.unwrap_or(0).max(0)
    }

    /// Get the limit value, clamped between 1 and MAX_LIMIT.
    /// Defaults to DEFAULT_LIMIT if not specified.
    #[inline]
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    /// Get both skip and limit as a tuple, useful for destructuring.
    #[inline]
    pub fn params(&self) -> (i64, i64) {
        (self.skip(), self.limit())
    }
}

/// Query string shared by list endpoints: pagination and a free-text search.
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ListParams {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,

    /// Case-insensitive substring search on the entity's search field
    pub q: Option<String>,
}

impl ListParams {
    pub fn to_list_query(&self) -> ListQuery {
        let (skip, limit) = self.pagination.params();
        ListQuery::new(self.q.clone(), skip, limit)
    }
}

/// Generic paginated response wrapper for list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaginatedResponse<T: ToSchema> {
    /// The items for the current page
    pub data: Vec<T>,
    /// Total number of items matching the query (before pagination)
    pub total_count: i64,
    /// Number of items skipped
    pub skip: i64,
    /// Maximum items returned per page
    pub limit: i64,
}

impl<T: ToSchema> PaginatedResponse<T> {
    /// Create a new paginated response
    pub fn new(data: Vec<T>, total_count: i64, skip: i64, limit: i64) -> Self {
        Self {
            data,
            total_count,
            skip,
            limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let p = Pagination::default();
        assert_eq!(p.skip(), 0);
        assert_eq!(p.limit(), DEFAULT_LIMIT);
    }

    #[test]
    fn test_limit_clamping() {
        let p = Pagination {
            skip: None,
            limit: Some(0),
        };
        assert_eq!(p.limit(), 1);

        let p = Pagination {
            skip: None,
            limit: Some(1000),
        };
        assert_eq!(p.limit(), MAX_LIMIT);

        let p = Pagination {
            skip: Some(-10),
            limit: Some(50),
        };
        assert_eq!(p.params(), (0, 50));
    }

    #[test]
    fn test_list_params_from_query_string() {
        let params: ListParams = serde_json::from_value(serde_json::json!({
            "skip": "20",
            "limit": "500",
            "q": "Roger"
        }))
        .unwrap();

        let query = params.to_list_query();
        assert_eq!(query.skip, 20);
        assert_eq!(query.limit, MAX_LIMIT);
        assert_eq!(query.search_pattern().as_deref(), Some("%roger%"));
    }

    #[test]
    fn test_blank_search_is_ignored() {
        let params = ListParams {
            pagination: Pagination::default(),
            q: Some("   ".to_string()),
        };
        assert_eq!(params.to_list_query().search_pattern(), None);
    }
}
