use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::model::Card;

/// Outcome of one paged cards request, classified by HTTP status.
/// Transport-level failures (timeouts, connection errors) surface as `Err`
/// on the trait method instead.
#[derive(Debug, Clone)]
pub enum PageReply {
    /// 200. An empty page means the set has no further pages.
    Page(Vec<Card>),
    /// 429 or a 5xx worth another attempt after backoff.
    Throttled(u16),
    /// 404 on the listing call; ambiguous, needs existence resolution.
    NotFound,
    /// Anything else.
    Unexpected(u16),
}

/// Outcome of a direct set lookup (`GET /sets/{id}`).
#[derive(Debug, Clone, Copy)]
pub enum LookupReply {
    Found,
    Missing,
    Other(u16),
}

/// Outcome of the secondary search-by-id (`GET /sets?q=id:{id}`).
#[derive(Debug, Clone, Copy)]
pub enum SearchReply {
    /// 200; true when at least one set matched the id.
    Matches(bool),
    /// Non-200 status.
    Failed(u16),
}

/// Upstream card provider.
#[async_trait]
pub trait CardSource: Send + Sync {
    async fn cards_page(&self, set_id: &str, page: u32, page_size: u32) -> Result<PageReply>;
    async fn set_by_id(&self, set_id: &str) -> Result<LookupReply>;
    async fn search_set(&self, set_id: &str) -> Result<SearchReply>;
}

#[derive(Debug, Deserialize)]
struct CardsEnvelope {
    #[serde(default)]
    data: Vec<Card>,
}

#[derive(Debug, Deserialize)]
struct IdsEnvelope {
    #[serde(default)]
    data: Vec<Value>,
}

/// Pokémon TCG API v2 client.
#[derive(Debug, Clone)]
pub struct TcgClient {
    base_url: String,
    http: Client,
    api_key: Option<String>,
}

impl TcgClient {
    pub fn new(base_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let base_url = base_url
            .unwrap_or("https://api.pokemontcg.io/v2")
            .trim_end_matches('/')
            .to_string();
        let http = Client::builder()
            .user_agent("CardPriceTracker/1.0 (+github-actions)")
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            base_url,
            http,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|s| !s.trim().is_empty());
        self
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key.as_deref() {
            Some(key) => req.header("X-Api-Key", key),
            None => req,
        }
    }
}

#[async_trait]
impl CardSource for TcgClient {
    async fn cards_page(&self, set_id: &str, page: u32, page_size: u32) -> Result<PageReply> {
        let url = format!("{}/cards", self.base_url);
        let req = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .query(&[
                ("q", format!("set.id:{set_id}")),
                ("page", page.to_string()),
                ("pageSize", page_size.to_string()),
                ("orderBy", "id".to_string()),
                ("select", "id,tcgplayer".to_string()),
            ]);
        let resp = self.add_auth(req).send().await?;
        let status = resp.status();
        if status == StatusCode::OK {
            let body: CardsEnvelope = resp.json().await.context("decoding cards page")?;
            return Ok(PageReply::Page(body.data));
        }
        Ok(match status.as_u16() {
            429 | 500 | 502 | 503 | 504 => PageReply::Throttled(status.as_u16()),
            404 => PageReply::NotFound,
            other => PageReply::Unexpected(other),
        })
    }

    async fn set_by_id(&self, set_id: &str) -> Result<LookupReply> {
        let url = format!("{}/sets/{}", self.base_url, set_id);
        let req = self.http.get(&url).header("Accept", "application/json");
        let resp = self.add_auth(req).send().await?;
        Ok(match resp.status().as_u16() {
            200 => LookupReply::Found,
            404 => LookupReply::Missing,
            other => LookupReply::Other(other),
        })
    }

    async fn search_set(&self, set_id: &str) -> Result<SearchReply> {
        let url = format!("{}/sets", self.base_url);
        let req = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .query(&[
                ("q", format!("id:{set_id}")),
                ("select", "id".to_string()),
                ("pageSize", "1".to_string()),
            ]);
        let resp = self.add_auth(req).send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Ok(SearchReply::Failed(status.as_u16()));
        }
        let body: IdsEnvelope = resp.json().await.context("decoding set search")?;
        Ok(SearchReply::Matches(!body.data.is_empty()))
    }
}
