//! Response envelopes
//!
//! Single resources are wrapped as `{ "data": ... }`; lists as
//! `{ "data": [...], "meta": { page, count, limit, filter } }`.

use std::fmt::Debug;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Wrapper for single resource responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// List metadata
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListMeta {
    /// 1-based page number
    pub page: usize,
    /// Matching items across all pages
    pub count: usize,
    pub limit: usize,
    /// Filters the list was computed with
    pub filter: serde_json::Value,
}

/// Wrapper for list responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiListResponse<T> {
    pub data: Vec<T>,
    pub meta: ListMeta,
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize + Debug,
{
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

impl<T> IntoResponse for ApiListResponse<T>
where
    T: Serialize + Debug,
{
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }

    /// Same body with `201 Created`
    pub fn created(data: T) -> (StatusCode, Self) {
        (StatusCode::CREATED, Self { data })
    }
}

impl<T> ApiListResponse<T> {
    /// A complete, unpaged list
    pub fn all(data: Vec<T>, filter: serde_json::Value) -> Self {
        let count = data.len();
        Self {
            data,
            meta: ListMeta {
                page: 1,
                count,
                limit: count,
                filter,
            },
        }
    }

    /// One page of a larger list
    pub fn page(data: Vec<T>, page: usize, limit: usize, count: usize, filter: serde_json::Value) -> Self {
        Self {
            data,
            meta: ListMeta {
                page,
                count,
                limit,
                filter,
            },
        }
    }
}

/// `page`/`limit` query parameters
#[derive(Debug, Clone, Copy, Deserialize, ToSchema)]
pub struct Paging {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

pub const MAX_LIMIT: usize = 500;

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    50
}

impl Paging {
    /// Page at least 1, limit within 1..=MAX_LIMIT
    pub fn clamped(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, MAX_LIMIT),
        }
    }
}

/// Paginate an already sorted list
pub fn paginate<T>(items: Vec<T>, paging: Paging) -> (Vec<T>, usize) {
    let paging = paging.clamped();
    let total = items.len();
    let page = items
        .into_iter()
        .skip(paging.page.saturating_sub(1).saturating_mul(paging.limit))
        .take(paging.limit)
        .collect();
    (page, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_clamped() {
        let (page, total) = paginate((1..=10).collect(), Paging { page: 0, limit: 4 });
        assert_eq!(page, vec![1, 2, 3, 4]);
        assert_eq!(total, 10);

        let (page, _) = paginate((1..=10).collect::<Vec<_>>(), Paging { page: 3, limit: 4 });
        assert_eq!(page, vec![9, 10]);

        let paging = Paging { page: 2, limit: 10_000 }.clamped();
        assert_eq!(paging.limit, MAX_LIMIT);

        let (page, total) = paginate((1..=10).collect::<Vec<_>>(), Paging { page: usize::MAX, limit: 50 });
        assert!(page.is_empty());
        assert_eq!(total, 10);
    }

    #[test]
    fn list_meta_shape() {
        let body = serde_json::to_value(ApiListResponse::page(
            vec!["a"],
            2,
            1,
            5,
            serde_json::json!({ "market": "btcusdt" }),
        ))
        .unwrap();
        assert_eq!(body["meta"]["page"], 2);
        assert_eq!(body["meta"]["count"], 5);
        assert_eq!(body["meta"]["limit"], 1);
        assert_eq!(body["meta"]["filter"]["market"], "btcusdt");
    }
}
