use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::ratelimit::RateLimiter;

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "skillsync/0.1.0";

/// Fields requested for every repository in a GraphQL batch
const REPO_FRAGMENT: &str = "nameWithOwner url stargazerCount diskUsage pushedAt description defaultBranchRef { name }";

/// Repository facts used by the sync
#[derive(Debug, Clone, PartialEq)]
pub struct RepoMetadata {
    pub full_name: String,
    pub url: String,
    pub stars: i64,
    pub pushed_at: Option<DateTime<Utc>>,
    pub size_kb: Option<u64>,
    pub default_branch: Option<String>,
    pub description: Option<String>,
}

/// Outcome of a metadata lookup that distinguishes gone from forbidden
#[derive(Debug, Clone, PartialEq)]
pub enum RepoLookup {
    Found(RepoMetadata),
    NotFound,
    Unauthorized,
}

#[derive(Debug, Clone)]
pub struct SearchPage {
    pub total_count: u64,
    pub items: Vec<RepoMetadata>,
}

/// REST repository payload (search items and `/repos/{name}`)
#[derive(Debug, Deserialize)]
struct RestRepo {
    full_name: String,
    html_url: String,
    #[serde(default)]
    stargazers_count: i64,
    pushed_at: Option<DateTime<Utc>>,
    size: Option<u64>,
    default_branch: Option<String>,
    description: Option<String>,
}

impl From<RestRepo> for RepoMetadata {
    fn from(r: RestRepo) -> Self {
        Self {
            full_name: r.full_name,
            url: r.html_url,
            stars: r.stargazers_count,
            pushed_at: r.pushed_at,
            size_kb: r.size,
            default_branch: r.default_branch,
            description: r.description,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    total_count: u64,
    #[serde(default)]
    items: Vec<RestRepo>,
}

#[derive(Debug, Deserialize)]
struct GraphQLError {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    path: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GraphQLResponse {
    data: Option<serde_json::Value>,
    #[serde(default)]
    errors: Vec<GraphQLError>,
}

/// Classify a non-success HTTP status into the pipeline's error kinds.
///
/// 403 counts as a rate limit only when the headers or body say so; otherwise
/// it is an authorization failure.
pub fn classify_status(
    status: reqwest::StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: &str,
    now: DateTime<Utc>,
) -> SyncError {
    let header = |name: &str| headers.get(name).and_then(|h| h.to_str().ok()).map(str::trim);
    let reset_at = header("retry-after")
        .and_then(|s| s.parse::<i64>().ok())
        .map(|secs| now + chrono::Duration::seconds(secs))
        .or_else(|| {
            header("x-ratelimit-reset")
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        })
        .unwrap_or_else(|| now + chrono::Duration::seconds(60));

    let snippet: String = body.chars().take(200).collect();
    match status.as_u16() {
        429 => SyncError::RateLimited { reset_at },
        403 if header("x-ratelimit-remaining") == Some("0")
            || header("retry-after").is_some()
            || body.to_lowercase().contains("rate limit") =>
        {
            SyncError::RateLimited { reset_at }
        }
        401 | 403 => SyncError::Unauthorized(format!("{}: {}", status, snippet)),
        // Deleted, renamed away, or taken down (DMCA)
        404 | 410 | 451 => SyncError::NotFound(format!("{}", status)),
        500..=599 => SyncError::Transient(format!("{}: {}", status, snippet)),
        _ => SyncError::Fatal(format!("{}: {}", status, snippet)),
    }
}

/// GitHub API client. Every request goes through the shared limiter.
#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    token: Option<String>,
    limiter: Arc<RateLimiter>,
}

impl GitHubClient {
    pub fn new(token: Option<String>, limiter: Arc<RateLimiter>) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SyncError::Fatal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, token, limiter })
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Build REST request with auth header if token available
    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req.header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send_json<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> SyncResult<T> {
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body, Utc::now()));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Fatal(format!("malformed GitHub response: {}", e)))
    }

    /// One page of `/search/repositories`, sorted by last push.
    pub async fn search_repositories(&self, query: &str, page: u32, per_page: u32) -> SyncResult<SearchPage> {
        let url = format!("{}/search/repositories", API_BASE);
        let page_str = page.to_string();
        let per_page_str = per_page.to_string();
        let label = format!("search page {}", page);

        let response: SearchResponse = self
            .limiter
            .call(&label, || {
                let req = self.get(&url).query(&[
                    ("q", query),
                    ("sort", "updated"),
                    ("order", "desc"),
                    ("page", page_str.as_str()),
                    ("per_page", per_page_str.as_str()),
                ]);
                self.send_json(req)
            })
            .await?;

        Ok(SearchPage {
            total_count: response.total_count,
            items: response.items.into_iter().map(RepoMetadata::from).collect(),
        })
    }

    /// Repository metadata over REST.
    pub async fn fetch_repo(&self, full_name: &str) -> SyncResult<RepoLookup> {
        let url = format!("{}/repos/{}", API_BASE, full_name);
        let result: SyncResult<RestRepo> = self
            .limiter
            .call(full_name, || self.send_json(self.get(&url)))
            .await;

        match result {
            Ok(repo) => Ok(RepoLookup::Found(repo.into())),
            Err(SyncError::NotFound(_)) => Ok(RepoLookup::NotFound),
            Err(SyncError::Unauthorized(_)) => Ok(RepoLookup::Unauthorized),
            Err(e) => Err(e),
        }
    }

    /// Build an aliased repository query with variables:
    /// `query($o0: String!, $n0: String!) { rateLimit {...} r0: repository(owner: $o0, name: $n0) {...} }`
    fn build_batch_query(names: &[String]) -> (String, serde_json::Map<String, serde_json::Value>) {
        let mut params = Vec::new();
        let mut fields = Vec::new();
        let mut variables = serde_json::Map::new();

        for (i, name) in names.iter().enumerate() {
            let Some((owner, repo)) = name.split_once('/') else { continue };
            params.push(format!("$o{i}: String!, $n{i}: String!"));
            fields.push(format!("r{i}: repository(owner: $o{i}, name: $n{i}) {{ {REPO_FRAGMENT} }}"));
            variables.insert(format!("o{}", i), serde_json::Value::String(owner.to_string()));
            variables.insert(format!("n{}", i), serde_json::Value::String(repo.to_string()));
        }

        let query = format!(
            "query({}) {{ rateLimit {{ cost remaining resetAt }} {} }}",
            params.join(", "),
            fields.join("\n")
        );
        (query, variables)
    }

    fn parse_graphql_repo(value: &serde_json::Value) -> Option<RepoMetadata> {
        let full_name = value.get("nameWithOwner")?.as_str()?.to_string();
        let url = value
            .get("url")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("https://github.com/{}", full_name));
        Some(RepoMetadata {
            url,
            stars: value.get("stargazerCount").and_then(|v| v.as_i64()).unwrap_or(0),
            pushed_at: value
                .get("pushedAt")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            size_kb: value.get("diskUsage").and_then(|v| v.as_u64()),
            default_branch: value
                .get("defaultBranchRef")
                .and_then(|v| v.get("name"))
                .and_then(|v| v.as_str())
                .map(String::from),
            description: value.get("description").and_then(|v| v.as_str()).map(String::from),
            full_name,
        })
    }

    /// Map one GraphQL response onto lookups keyed by the requested names (lowercase).
    /// Names with no usable answer are left out so the caller can fall back to REST.
    fn parse_batch_response(names: &[String], response: &GraphQLResponse) -> HashMap<String, RepoLookup> {
        let mut lookups = HashMap::new();
        let data = response.data.as_ref();

        for (i, name) in names.iter().enumerate() {
            let alias = format!("r{}", i);
            let error_kind = response
                .errors
                .iter()
                .find(|e| e.path.first().and_then(|p| p.as_str()) == Some(alias.as_str()))
                .and_then(|e| e.kind.as_deref());

            match data.and_then(|d| d.get(&alias)) {
                Some(value) if !value.is_null() => {
                    if let Some(repo) = Self::parse_graphql_repo(value) {
                        lookups.insert(name.to_lowercase(), RepoLookup::Found(repo));
                    }
                }
                _ => match error_kind {
                    Some("NOT_FOUND") => {
                        lookups.insert(name.to_lowercase(), RepoLookup::NotFound);
                    }
                    Some("FORBIDDEN") => {
                        lookups.insert(name.to_lowercase(), RepoLookup::Unauthorized);
                    }
                    _ => {}
                },
            }
        }
        lookups
    }

    /// Metadata for many repositories, `batch_size` per GraphQL query.
    ///
    /// Requires a token. Repositories missing from the result should be looked
    /// up individually with [`fetch_repo`](Self::fetch_repo).
    pub async fn fetch_repos_batch(&self, names: &[String], batch_size: usize) -> SyncResult<HashMap<String, RepoLookup>> {
        let Some(token) = self.token.as_deref() else {
            return Ok(HashMap::new());
        };
        let url = format!("{}/graphql", API_BASE);
        let mut lookups = HashMap::new();
        let chunks: Vec<&[String]> = names.chunks(batch_size.max(1)).collect();
        let total = chunks.len();

        for (idx, chunk) in chunks.into_iter().enumerate() {
            let (query, variables) = Self::build_batch_query(chunk);
            let body = serde_json::json!({ "query": query, "variables": variables });
            let label = format!("graphql chunk {}/{}", idx + 1, total);

            let response: GraphQLResponse = self
                .limiter
                .call(&label, || {
                    let req = self
                        .client
                        .post(&url)
                        .header("Authorization", format!("Bearer {}", token))
                        .json(&body);
                    async move {
                        let response: GraphQLResponse = self.send_json(req).await?;
                        if response.errors.iter().any(|e| {
                            e.kind.as_deref() == Some("RATE_LIMITED") || e.message.to_lowercase().contains("rate limit")
                        }) {
                            return Err(SyncError::RateLimited {
                                reset_at: Utc::now() + chrono::Duration::seconds(60),
                            });
                        }
                        Ok(response)
                    }
                })
                .await?;

            if let Some(rate) = response.data.as_ref().and_then(|d| d.get("rateLimit")) {
                let remaining = rate.get("remaining").and_then(|v| v.as_u64()).unwrap_or(0);
                let cost = rate.get("cost").and_then(|v| v.as_u64()).unwrap_or(0);
                tracing::debug!(chunk = idx + 1, total, cost, remaining, "graphql chunk done");
                if remaining < 500 {
                    tracing::warn!(remaining, "GraphQL quota low");
                }
            }

            lookups.extend(Self::parse_batch_response(chunk, &response));
        }

        Ok(lookups)
    }
}
