//! Metadata catalog proxy (TMDB-compatible API, bearer token auth).

use serde_json::Value;

use super::{agent, blocking, json_response};
use crate::error::{GatewayError, GatewayResult};

pub const DEFAULT_CATALOG_BASE: &str = "https://api.themoviedb.org/3";

#[derive(Clone)]
pub struct CatalogClient {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
}

impl CatalogClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            agent: agent(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|token| !token.is_empty()),
        }
    }

    pub async fn trending(&self) -> GatewayResult<Value> {
        self.get(
            "/trending/movie/day",
            vec![("language", "en-US".into())],
            "Could not load trending movies",
        )
        .await
    }

    pub async fn search_movies(&self, query: &str) -> GatewayResult<Value> {
        self.get(
            "/search/movie",
            search_params(query),
            "Movie search failed",
        )
        .await
    }

    pub async fn search_multi(&self, query: &str) -> GatewayResult<Value> {
        self.get("/search/multi", search_params(query), "Multi search failed")
            .await
    }

    async fn get(
        &self,
        path: &'static str,
        params: Vec<(&'static str, String)>,
        failure: &'static str,
    ) -> GatewayResult<Value> {
        let token = self
            .token
            .clone()
            .ok_or_else(|| GatewayError::internal("catalog token not configured"))?;
        let agent = self.agent.clone();
        let url = format!("{}{path}", self.base_url);
        blocking(move || {
            let mut request = agent
                .get(&url)
                .set("Accept", "application/json")
                .set("Authorization", &format!("Bearer {token}"));
            for (key, value) in &params {
                request = request.query(key, value);
            }
            json_response("catalog", request.call(), failure)
        })
        .await
    }
}

fn search_params(query: &str) -> Vec<(&'static str, String)> {
    vec![
        ("query", query.to_string()),
        ("language", "en-US".into()),
        ("page", "1".into()),
    ]
}
