//! Repository discovery over the capped search endpoint
//!
//! The search API answers at most `cap` results per query, so a pushed-date
//! window with more matches is split in half until every piece fits.

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use std::collections::BTreeMap;

use crate::error::{SyncError, SyncResult};
use crate::github::{GitHubClient, RepoMetadata, SearchPage};

/// Discovered repositories keyed by lowercase `owner/name`
pub type DiscoveredRepos = BTreeMap<String, RepoMetadata>;

#[async_trait]
pub trait RepoSearch: Send + Sync {
    async fn search_page(&self, query: &str, page: u32, per_page: u32) -> SyncResult<SearchPage>;
}

#[async_trait]
impl RepoSearch for GitHubClient {
    async fn search_page(&self, query: &str, page: u32, per_page: u32) -> SyncResult<SearchPage> {
        self.search_repositories(query, page, per_page).await
    }
}

/// Keyword filter applied to `name + description` on word boundaries.
#[derive(Debug, Clone)]
pub struct Denylist {
    pattern: Option<Regex>,
}

impl Denylist {
    pub fn new(keywords: &[String]) -> SyncResult<Self> {
        let alternatives: Vec<String> = keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();
        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }
        let pattern = Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
            .map_err(|e| SyncError::Fatal(format!("invalid denylist: {}", e)))?;
        Ok(Self { pattern: Some(pattern) })
    }

    pub fn matches(&self, repo: &RepoMetadata) -> bool {
        let Some(pattern) = &self.pattern else { return false };
        let text = format!("{} {}", repo.full_name, repo.description.as_deref().unwrap_or(""));
        pattern.is_match(&text)
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Maximum results the backend returns for one query
    pub cap: u32,
    pub per_page: u32,
    pub denylist: Denylist,
}

impl DiscoveryOptions {
    pub fn new(cap: u32, denylist: Denylist) -> Self {
        Self { cap, per_page: 100, denylist }
    }
}

fn window_query(query: &str, start: NaiveDate, end: NaiveDate) -> String {
    format!("{} pushed:{}..{}", query, start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
}

fn insert_allowed(found: &mut DiscoveredRepos, items: Vec<RepoMetadata>, denylist: &Denylist) -> usize {
    let mut filtered = 0;
    for repo in items {
        if denylist.matches(&repo) {
            filtered += 1;
            continue;
        }
        found.entry(repo.full_name.to_lowercase()).or_insert(repo);
    }
    filtered
}

/// Page through one window that fits under the cap (or cannot be split further).
async fn collect_window(
    search: &dyn RepoSearch,
    query: &str,
    first: SearchPage,
    options: &DiscoveryOptions,
) -> SyncResult<DiscoveredRepos> {
    let mut found = DiscoveredRepos::new();
    let limit = first.total_count.min(options.cap as u64);
    let mut seen = first.items.len() as u64;
    let mut short = (first.items.len() as u32) < options.per_page;
    insert_allowed(&mut found, first.items, &options.denylist);

    let mut page = 2;
    while !short && seen < limit {
        let next = search.search_page(query, page, options.per_page).await?;
        seen += next.items.len() as u64;
        short = (next.items.len() as u32) < options.per_page;
        insert_allowed(&mut found, next.items, &options.denylist);
        page += 1;
    }
    Ok(found)
}

/// Every repository matching `query` pushed within `[start, end]`.
///
/// Windows whose count exceeds the cap are bisected at the midpoint; a
/// single day over the cap is paged up to the cap and the rest is lost.
pub fn discover_window<'a>(
    search: &'a dyn RepoSearch,
    query: &'a str,
    start: NaiveDate,
    end: NaiveDate,
    options: &'a DiscoveryOptions,
) -> BoxFuture<'a, SyncResult<DiscoveredRepos>> {
    async move {
        let q = window_query(query, start, end);
        let first = search.search_page(&q, 1, options.per_page).await?;

        if first.total_count <= options.cap as u64 {
            return collect_window(search, &q, first, options).await;
        }

        if start >= end {
            tracing::warn!(
                window = %start,
                total = first.total_count,
                cap = options.cap,
                "single-day window over search cap, results truncated"
            );
            return collect_window(search, &q, first, options).await;
        }

        let mid = start + chrono::Duration::days((end - start).num_days() / 2);
        tracing::debug!(%start, %mid, %end, total = first.total_count, "bisecting window");
        let mut left = discover_window(search, query, start, mid, options).await?;
        let right = match mid.succ_opt() {
            Some(next) => discover_window(search, query, next, end, options).await?,
            None => DiscoveredRepos::new(),
        };
        for (key, repo) in right {
            left.entry(key).or_insert(repo);
        }
        Ok(left)
    }
    .boxed()
}

/// Union of every query over `[start, end]`. A query whose window fails is
/// logged and contributes nothing.
pub async fn discover_all(
    search: &dyn RepoSearch,
    queries: &[String],
    start: NaiveDate,
    end: NaiveDate,
    options: &DiscoveryOptions,
) -> DiscoveredRepos {
    let mut all = DiscoveredRepos::new();
    for query in queries {
        match discover_window(search, query, start, end, options).await {
            Ok(found) => {
                let before = all.len();
                let count = found.len();
                for (key, repo) in found {
                    all.entry(key).or_insert(repo);
                }
                tracing::info!(query = %query, found = count, new = all.len() - before, "discovery query done");
            }
            Err(e) => {
                tracing::warn!(query = %query, kind = e.kind(), error = %e, "discovery query failed");
            }
        }
    }
    all
}
