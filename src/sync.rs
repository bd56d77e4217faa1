//! One sync run over the registry
//!
//! Known repositories are refreshed first (stars, removals, pushes since the
//! watermark), then the search window since the watermark is scanned for new
//! ones. Every queued repository is cloned once, compared against what is
//! stored and applied. Changed and new skills are enriched afterwards, and the
//! repair passes close the run. The watermark moves only when all of that
//! has returned.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;

use crate::changes::{outcome_counts, plan_repo_changes, RepoContext};
use crate::config::Config;
use crate::db::{Database, ExistingSkill};
use crate::discovery::{discover_all, Denylist, DiscoveryOptions, RepoSearch};
use crate::enrich::{run_enrichment, EnrichOptions, Enricher, EnrichmentTask, SKILL_MD_TOO_LARGE_NOTICE};
use crate::extract::{extract_snapshot, ExtractOptions, ExtractOutcome, RepoProvider};
use crate::github::{GitHubClient, RepoLookup, RepoMetadata};
use crate::llm::TextGenerator;
use crate::progress::{Outcome, StageCounts, StageProgress};
use crate::repair::{skill_path_backfill, validation_backfill, PathRepairReport};
use crate::writer::{spawn_writer, SkillField, WriterHandle, WriterOptions, WriterSender};

/// Batched repository metadata
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Lookups keyed by lowercase `owner/name`. Names that could not be
    /// looked up at all are absent from the map.
    async fn lookup_repos(&self, names: &[String]) -> HashMap<String, RepoLookup>;
}

/// GraphQL batches first, REST for whatever a batch could not answer.
pub struct GitHubMetadata<'a> {
    pub client: &'a GitHubClient,
    pub batch_size: usize,
}

#[async_trait]
impl<'a> MetadataSource for GitHubMetadata<'a> {
    async fn lookup_repos(&self, names: &[String]) -> HashMap<String, RepoLookup> {
        let mut found = match self.client.fetch_repos_batch(names, self.batch_size).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(kind = e.kind(), error = %e, "batched metadata failed, using REST");
                HashMap::new()
            }
        };

        let missing: Vec<String> = names
            .iter()
            .filter(|name| !found.contains_key(&name.to_lowercase()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            tracing::debug!(repos = missing.len(), "REST metadata fallback");
        }
        let fetched: Vec<_> = stream::iter(missing)
            .map(|name| async move {
                let result = self.client.fetch_repo(&name).await;
                (name, result)
            })
            .buffer_unordered(4)
            .collect()
            .await;
        for (name, result) in fetched {
            match result {
                Ok(lookup) => {
                    found.insert(name.to_lowercase(), lookup);
                }
                Err(e) => tracing::warn!(repo = %name, kind = e.kind(), error = %e, "metadata lookup failed"),
            }
        }
        found
    }
}

/// Which passes a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    /// Validation backfill and skill-path backfill only
    RepairOnly,
}

/// Per-repository change counts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoChanges {
    pub inserted: usize,
    pub changed: usize,
    pub deleted: usize,
    pub checked: usize,
    pub too_many: usize,
}

impl RepoChanges {
    fn absorb(&mut self, other: &RepoChanges) {
        self.inserted += other.inserted;
        self.changed += other.changed;
        self.deleted += other.deleted;
        self.checked += other.checked;
        self.too_many += other.too_many;
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub maintained: usize,
    pub removed_repos: usize,
    pub discovered: usize,
    pub repos: StageCounts,
    pub changes: RepoChanges,
    pub enrichment: StageCounts,
    pub validation: StageCounts,
    pub paths: PathRepairReport,
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct RepoJob {
    key: String,
    meta: RepoMetadata,
    is_new: bool,
}

/// Extraction knobs from the config; the descriptor ceiling is added per repository.
pub fn extract_options(config: &Config) -> ExtractOptions {
    ExtractOptions {
        entry_workers: config.entry_workers,
        max_bytes: config.skill_md_max_bytes,
        substep_timeout: config.substep_timeout,
        max_descriptors: None,
    }
}

/// Everything a run talks to
pub struct Pipeline<'a> {
    pub config: &'a Config,
    pub db: &'a Database,
    pub metadata: &'a dyn MetadataSource,
    pub search: &'a dyn RepoSearch,
    pub provider: &'a dyn RepoProvider,
    pub llm: Arc<dyn TextGenerator>,
}

impl Pipeline<'_> {
    pub async fn run(&self, mode: SyncMode) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if mode == SyncMode::RepairOnly {
            self.repair_passes(&mut report).await?;
            return Ok(report);
        }

        let started_at = Utc::now();
        let cutoff = match self.db.get_watermark()? {
            Some(at) => at,
            None => self.config.start_pushed_date.and_time(NaiveTime::MIN).and_utc(),
        };
        tracing::info!(cutoff = %cutoff, "sync started");

        let existing = self.db.load_existing_skills().context("Failed to load stored skills")?;
        let mut jobs = self.maintained_jobs(&existing, cutoff, &mut report).await?;

        let denylist = Denylist::new(&self.config.denylist).context("Invalid denylist")?;
        let options = DiscoveryOptions::new(self.config.search_cap, denylist);
        let discovered = discover_all(
            self.search,
            &self.config.search_queries,
            cutoff.date_naive(),
            started_at.date_naive(),
            &options,
        )
        .await;
        let new_jobs: Vec<RepoJob> = discovered
            .into_iter()
            .filter(|(key, _)| !existing.contains_key(key))
            .map(|(key, meta)| RepoJob { key, meta, is_new: true })
            .collect();
        report.discovered = new_jobs.len();
        eprintln!(
            "\x1b[36m..\x1b[0m {} known repos pushed since {}, {} new repos",
            jobs.len(),
            cutoff.format("%Y-%m-%d"),
            new_jobs.len()
        );
        jobs.extend(new_jobs);

        let base = self.spawn_writer("base")?;
        let (counts, changes, tasks) = self.process_repos(jobs, &existing, &base.sender()).await;
        report.repos = counts;
        report.changes = changes;
        close_writer(base).await;

        report.enrichment = self.enrich_tasks(tasks).await?;
        self.repair_passes(&mut report).await?;

        self.db.set_watermark(started_at)?;
        report.watermark = Some(started_at);
        Ok(report)
    }

    fn spawn_writer(&self, name: &str) -> Result<WriterHandle> {
        let conn = Database::connect(self.db.path())
            .with_context(|| format!("Failed to open connection for writer `{}`", name))?;
        Ok(spawn_writer(
            name,
            conn,
            WriterOptions {
                commit_every: self.config.commit_every,
                verify: self.config.verify_writes,
            },
        ))
    }

    /// Refresh known repositories; queue the ones pushed after `cutoff`.
    async fn maintained_jobs(
        &self,
        existing: &HashMap<String, Vec<ExistingSkill>>,
        cutoff: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<Vec<RepoJob>> {
        let mut names: Vec<String> = existing.keys().filter(|k| !k.is_empty()).cloned().collect();
        names.sort();
        if names.is_empty() {
            return Ok(Vec::new());
        }
        report.maintained = names.len();
        tracing::info!(repos = names.len(), "refreshing known repositories");

        let lookups = self.metadata.lookup_repos(&names).await;
        let mut jobs = Vec::new();
        for key in names {
            match lookups.get(&key) {
                None => tracing::warn!(repo = %key, "no metadata, repository left as is"),
                Some(RepoLookup::Unauthorized) => {
                    tracing::warn!(repo = %key, "repository not accessible, skipped");
                }
                Some(RepoLookup::NotFound) => {
                    let repo = key.clone();
                    let removed = self.db.run_blocking(move |db| db.delete_repo_skills(&repo)).await?;
                    tracing::info!(repo = %key, removed, "repository gone, skills removed");
                    report.removed_repos += 1;
                }
                Some(RepoLookup::Found(meta)) => {
                    let (repo, stars) = (key.clone(), meta.stars);
                    self.db.run_blocking(move |db| db.update_repo_stars(&repo, stars)).await?;
                    match meta.pushed_at {
                        Some(pushed) if pushed <= cutoff => {
                            tracing::debug!(repo = %key, "no push since last run");
                        }
                        _ => jobs.push(RepoJob { key, meta: meta.clone(), is_new: false }),
                    }
                }
            }
        }
        Ok(jobs)
    }

    /// Clone, compare and apply every job with at most `repo_concurrency` in flight.
    async fn process_repos(
        &self,
        jobs: Vec<RepoJob>,
        existing: &HashMap<String, Vec<ExistingSkill>>,
        base: &WriterSender,
    ) -> (StageCounts, RepoChanges, Vec<EnrichmentTask>) {
        let progress = StageProgress::new("repos", jobs.len());
        let checked_at = Utc::now().to_rfc3339();
        let results: Vec<Option<(RepoChanges, Vec<EnrichmentTask>)>> = stream::iter(jobs)
            .map(|job| {
                let stored = existing.get(&job.key).map(Vec::as_slice).unwrap_or(&[]);
                let progress = &progress;
                let checked_at = checked_at.as_str();
                async move {
                    let name = job.meta.full_name.clone();
                    let work = self.process_repo(&job, stored, base, checked_at);
                    match tokio::time::timeout(self.config.repo_task_timeout, work).await {
                        Ok(Ok((changes, tasks))) => {
                            let outcome = if changes.too_many > 0 { Outcome::Skipped } else { Outcome::Completed };
                            progress.tick(outcome, &name);
                            Some((changes, tasks))
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(repo = %name, error = %format!("{:#}", e), "repository failed");
                            progress.tick(Outcome::Failed, &name);
                            None
                        }
                        Err(_) => {
                            tracing::warn!(repo = %name, timeout = ?self.config.repo_task_timeout, "repository timed out");
                            progress.tick(Outcome::Failed, &name);
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.config.repo_concurrency.max(1))
            .collect()
            .await;

        let mut total = RepoChanges::default();
        let mut tasks = Vec::new();
        for (changes, repo_tasks) in results.into_iter().flatten() {
            total.absorb(&changes);
            tasks.extend(repo_tasks);
        }
        eprintln!(
            "\x1b[32mok\x1b[0m {}: {} new, {} changed, {} removed, {} unchanged",
            progress.summary_line(),
            total.inserted,
            total.changed,
            total.deleted,
            total.checked
        );
        (progress.counts(), total, tasks)
    }

    async fn process_repo(
        &self,
        job: &RepoJob,
        stored: &[ExistingSkill],
        base: &WriterSender,
        checked_at: &str,
    ) -> Result<(RepoChanges, Vec<EnrichmentTask>)> {
        let meta = &job.meta;
        let source = self
            .provider
            .open(&meta.full_name, Some(&meta.url), meta.default_branch.as_deref(), meta.size_kb)
            .await
            .context("clone failed")?;

        let options = ExtractOptions {
            max_descriptors: job.is_new.then_some(self.config.max_descriptors),
            ..extract_options(self.config)
        };
        let outcome = extract_snapshot(source.as_ref(), &meta.full_name, &options).await;
        drop(source);
        let snapshot = match outcome.context("extraction failed")? {
            ExtractOutcome::Snapshot(snapshot) => snapshot,
            ExtractOutcome::TooManyDescriptors { found } => {
                tracing::warn!(
                    repo = %meta.full_name,
                    found,
                    limit = self.config.max_descriptors,
                    "too many skills, repository skipped"
                );
                return Ok((RepoChanges { too_many: 1, ..Default::default() }, Vec::new()));
            }
        };
        tracing::debug!(repo = %meta.full_name, outcomes = ?outcome_counts(&snapshot), "snapshot taken");

        let context = RepoContext {
            repo_name: meta.full_name.clone(),
            url: meta.url.clone(),
            branch: meta.default_branch.clone(),
            stars: meta.stars,
        };
        let plan = plan_repo_changes(&context, stored, &snapshot, checked_at);
        if plan.is_noop() {
            tracing::debug!(repo = %meta.full_name, "no skill changes");
        }

        let mut changes = RepoChanges::default();
        let mut tasks = Vec::new();
        for update in plan.checked {
            base.send(update)?;
            changes.checked += 1;
        }
        for changed in plan.changed {
            // The old translation no longer matches; backfill redoes it if enrichment fails
            base.send(changed.update.clear(SkillField::Translation))?;
            tasks.push(EnrichmentTask::fresh(changed.id, &changed.skill_name, &changed.content));
            changes.changed += 1;
        }

        let repo = meta.full_name.clone();
        let (deletions, new_skills) = (plan.deletions, plan.new_skills);
        let (deleted, inserted) = self
            .db
            .run_blocking(move |db| {
                let mut deleted = 0;
                for id in deletions {
                    if db.delete_skill(id)? {
                        tracing::info!(skill_id = id, repo = %repo, "skill removed upstream");
                        deleted += 1;
                    }
                }
                let mut inserted = Vec::with_capacity(new_skills.len());
                for skill in new_skills {
                    let translation = (!skill.readable).then_some(SKILL_MD_TOO_LARGE_NOTICE);
                    let (id, name) = db.insert_skill(&skill, translation)?;
                    tracing::info!(skill_id = id, skill = %name, readable = skill.readable, "skill added");
                    inserted.push((id, name, skill.content));
                }
                Ok((deleted, inserted))
            })
            .await?;

        changes.deleted = deleted;
        changes.inserted = inserted.len();
        for (id, name, content) in inserted {
            if let Some(content) = content {
                tasks.push(EnrichmentTask::fresh(id, &name, &content));
            }
        }
        Ok((changes, tasks))
    }

    fn enricher(&self, writer: WriterSender) -> Enricher {
        Enricher::new(self.llm.clone(), writer, EnrichOptions::from_config(self.config))
    }

    async fn enrich_tasks(&self, tasks: Vec<EnrichmentTask>) -> Result<StageCounts> {
        if tasks.is_empty() {
            return Ok(StageCounts::default());
        }
        let writer = self.spawn_writer("enrichment")?;
        let progress = StageProgress::new("enrichment", 0);
        let counts = run_enrichment(
            &self.enricher(writer.sender()),
            tasks,
            self.config.llm_concurrency,
            &progress,
        )
        .await;
        close_writer(writer).await;
        eprintln!("\x1b[32mok\x1b[0m {}", progress.summary_line());
        Ok(counts)
    }

    async fn repair_passes(&self, report: &mut SyncReport) -> Result<()> {
        let writer = self.spawn_writer("validation")?;
        let validation = validation_backfill(
            self.db,
            &self.enricher(writer.sender()),
            self.config.translation_max_chars,
            self.config.llm_concurrency,
        )
        .await;
        close_writer(writer).await;
        report.validation = validation?;

        report.paths = skill_path_backfill(
            self.db,
            self.provider,
            &extract_options(self.config),
            self.config.skillpath_concurrency,
        )
        .await?;
        Ok(())
    }
}

/// Close a writer, logging rather than failing the run when it halted.
async fn close_writer(writer: WriterHandle) {
    match writer.close().await {
        Ok(writes) => tracing::info!(
            applied = writes.applied,
            missing = writes.missing,
            failed = writes.failed,
            commits = writes.commits,
            "writer closed"
        ),
        Err(e) => tracing::error!(kind = e.kind(), error = %e, "writer halted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::NewSkill;
    use crate::error::{SyncError, SyncResult};
    use crate::extract::tests::FakeProvider;
    use crate::github::SearchPage;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_github_metadata_lookup_is_send() {
        let limiter = Arc::new(crate::ratelimit::RateLimiter::new(
            "github",
            1,
            std::time::Duration::ZERO,
            crate::ratelimit::RetryPolicy::default(),
        ));
        let client = GitHubClient::new(None, limiter).unwrap();
        let metadata = GitHubMetadata { client: &client, batch_size: 50 };
        let names = vec!["acme/kit".to_string()];
        // Never polled; only the future's type is checked
        let lookup = metadata.lookup_repos(&names);
        assert_send(&lookup);
    }

    #[derive(Default)]
    struct FakeMetadata {
        lookups: HashMap<String, RepoLookup>,
        asked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MetadataSource for FakeMetadata {
        async fn lookup_repos(&self, names: &[String]) -> HashMap<String, RepoLookup> {
            self.asked.lock().unwrap().extend(names.iter().cloned());
            names
                .iter()
                .filter_map(|n| self.lookups.get(n).map(|l| (n.clone(), l.clone())))
                .collect()
        }
    }

    /// Same items for every query and window
    #[derive(Default)]
    struct FakeSearch {
        items: Vec<RepoMetadata>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl RepoSearch for FakeSearch {
        async fn search_page(&self, _query: &str, page: u32, _per_page: u32) -> SyncResult<SearchPage> {
            *self.calls.lock().unwrap() += 1;
            let items = if page == 1 { self.items.clone() } else { Vec::new() };
            Ok(SearchPage { total_count: self.items.len() as u64, items })
        }
    }

    struct DeadLlm;

    #[async_trait]
    impl TextGenerator for DeadLlm {
        async fn generate(&self, _prompt: &str) -> SyncResult<String> {
            Err(SyncError::Fatal("offline".into()))
        }
    }

    fn meta(name: &str, pushed_at: DateTime<Utc>) -> RepoMetadata {
        RepoMetadata {
            full_name: name.to_string(),
            url: format!("https://github.com/{}", name),
            stars: 7,
            pushed_at: Some(pushed_at),
            size_kb: Some(10),
            default_branch: Some("main".to_string()),
            description: None,
        }
    }

    fn temp_db() -> (TempDir, Config, Database) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("skills.db");
        let db = Database::open(&path).unwrap();
        (dir, Config::for_tests(path), db)
    }

    async fn run(
        config: &Config,
        db: &Database,
        metadata: &FakeMetadata,
        search: &FakeSearch,
        provider: &FakeProvider,
        mode: SyncMode,
    ) -> SyncReport {
        let pipeline = Pipeline {
            config,
            db,
            metadata,
            search,
            provider,
            llm: Arc::new(DeadLlm),
        };
        pipeline.run(mode).await.unwrap()
    }

    fn stored(db: &Database, repo: &str) -> Vec<ExistingSkill> {
        db.load_existing_skills().unwrap().remove(repo).unwrap_or_default()
    }

    const KIT: &[(&str, &str)] = &[
        ("a/SKILL.md", "---\nname: alpha\n---\n# Alpha"),
        ("b/SKILL.md", "---\nname: beta\n---\n# Beta"),
        ("c/SKILL.md", "---\nname: gamma\n---\n# Gamma"),
    ];

    #[tokio::test]
    async fn test_sync_inserts_new_repo_then_is_idempotent() {
        let (_dir, config, db) = temp_db();
        let later = Utc::now() + chrono::Duration::days(1);
        let search = FakeSearch { items: vec![meta("acme/kit", later)], ..Default::default() };
        let provider = FakeProvider::default().with_repo("acme/kit", KIT);

        let first = run(&config, &db, &FakeMetadata::default(), &search, &provider, SyncMode::Full).await;
        assert_eq!(first.discovered, 1);
        assert_eq!(first.changes.inserted, 3);
        assert!(first.watermark.is_some());
        assert_eq!(db.get_watermark().unwrap(), first.watermark);
        let ids: Vec<i64> = stored(&db, "acme/kit").iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 3);

        // Pushed after the new watermark, so it is compared again
        let metadata = FakeMetadata {
            lookups: HashMap::from([("acme/kit".to_string(), RepoLookup::Found(meta("acme/kit", later)))]),
            ..Default::default()
        };
        let second = run(&config, &db, &metadata, &search, &provider, SyncMode::Full).await;
        assert_eq!(second.discovered, 0);
        assert_eq!(
            second.changes,
            RepoChanges { checked: 3, ..Default::default() }
        );
        let after: Vec<i64> = stored(&db, "acme/kit").iter().map(|s| s.id).collect();
        assert_eq!(after, ids);
        assert_eq!(metadata.asked.lock().unwrap().as_slice(), ["acme/kit".to_string()]);
    }

    #[tokio::test]
    async fn test_sync_applies_upstream_changes() {
        let (_dir, config, db) = temp_db();
        let later = Utc::now() + chrono::Duration::days(1);
        let search = FakeSearch { items: vec![meta("acme/kit", later)], ..Default::default() };
        let provider = FakeProvider::default().with_repo("acme/kit", KIT);
        run(&config, &db, &FakeMetadata::default(), &search, &provider, SyncMode::Full).await;
        let before = stored(&db, "acme/kit");

        let provider = FakeProvider::default().with_repo(
            "acme/kit",
            &[
                ("a/SKILL.md", "---\nname: alpha\n---\n# Alpha"),
                ("b/SKILL.md", "---\nname: beta\n---\n# Beta, rewritten"),
                ("d/SKILL.md", "---\nname: delta\n---\n# Delta"),
            ],
        );
        let metadata = FakeMetadata {
            lookups: HashMap::from([("acme/kit".to_string(), RepoLookup::Found(meta("acme/kit", later)))]),
            ..Default::default()
        };
        let report = run(&config, &db, &metadata, &FakeSearch::default(), &provider, SyncMode::Full).await;
        assert_eq!(
            report.changes,
            RepoChanges { inserted: 1, changed: 1, deleted: 1, checked: 1, too_many: 0 }
        );

        let after = stored(&db, "acme/kit");
        let paths: Vec<_> = after.iter().filter_map(|s| s.skill_path.clone()).collect();
        assert_eq!(paths, ["a", "b", "d"]);
        let beta_id = before.iter().find(|s| s.skill_path.as_deref() == Some("b")).unwrap().id;
        let beta = db.get_skill(beta_id).unwrap().unwrap();
        assert_eq!(beta.skill_md_content.as_deref(), Some("---\nname: beta\n---\n# Beta, rewritten"));
    }

    #[tokio::test]
    async fn test_sync_maintenance_removes_gone_and_keeps_forbidden() {
        let (_dir, config, db) = temp_db();
        for (repo, short) in [("acme/gone", "x"), ("acme/locked", "y"), ("acme/quiet", "z")] {
            let skill = NewSkill {
                repo_name: repo.to_string(),
                from_repo: format!("https://github.com/{}", repo),
                stars: 1,
                short_name: short.to_string(),
                skill_path: String::new(),
                content: Some("# body".to_string()),
                content_hash: None,
                file_tree: String::new(),
                download_url: String::new(),
                how_to_install: String::new(),
                readable: true,
            };
            db.insert_skill(&skill, None).unwrap();
        }
        db.set_watermark(Utc::now()).unwrap();

        let old = Utc::now() - chrono::Duration::days(30);
        let metadata = FakeMetadata {
            lookups: HashMap::from([
                ("acme/gone".to_string(), RepoLookup::NotFound),
                ("acme/locked".to_string(), RepoLookup::Unauthorized),
                ("acme/quiet".to_string(), RepoLookup::Found(meta("acme/quiet", old))),
            ]),
            ..Default::default()
        };
        let provider = FakeProvider::default();
        let report = run(&config, &db, &metadata, &FakeSearch::default(), &provider, SyncMode::Full).await;

        assert_eq!(report.maintained, 3);
        assert_eq!(report.removed_repos, 1);
        assert_eq!(report.repos.total, 0);
        assert!(stored(&db, "acme/gone").is_empty());
        assert_eq!(stored(&db, "acme/locked").len(), 1);
        let quiet = stored(&db, "acme/quiet");
        assert_eq!(quiet.len(), 1);
        // Stars are refreshed even without a push
        let stars: i64 = db
            .with_conn(|c| c.query_row("SELECT repo_stars FROM skills WHERE id = ?1", [quiet[0].id], |r| r.get(0)))
            .unwrap();
        assert_eq!(stars, 7);
        assert!(provider.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_skips_new_repo_over_descriptor_ceiling() {
        let (_dir, mut config, db) = temp_db();
        config.max_descriptors = 2;
        let later = Utc::now() + chrono::Duration::days(1);
        let search = FakeSearch { items: vec![meta("acme/kit", later)], ..Default::default() };
        let provider = FakeProvider::default().with_repo("acme/kit", KIT);

        let report = run(&config, &db, &FakeMetadata::default(), &search, &provider, SyncMode::Full).await;
        assert_eq!(report.changes.too_many, 1);
        assert_eq!(report.changes.inserted, 0);
        assert_eq!(report.repos.skipped, 1);
        assert!(stored(&db, "acme/kit").is_empty());
    }

    #[tokio::test]
    async fn test_sync_unreadable_skill_gets_placeholder() {
        let (_dir, mut config, db) = temp_db();
        config.skill_md_max_bytes = 20;
        let later = Utc::now() + chrono::Duration::days(1);
        let search = FakeSearch { items: vec![meta("acme/big", later)], ..Default::default() };
        let provider = FakeProvider::default().with_repo(
            "acme/big",
            &[("SKILL.md", "# A descriptor that is well over twenty bytes long")],
        );

        let report = run(&config, &db, &FakeMetadata::default(), &search, &provider, SyncMode::Full).await;
        assert_eq!(report.changes.inserted, 1);
        let skills = stored(&db, "acme/big");
        let row = db.get_skill(skills[0].id).unwrap().unwrap();
        assert_eq!(row.skill_md_content, None);
        assert_eq!(row.skill_md_content_translation.as_deref(), Some(SKILL_MD_TOO_LARGE_NOTICE));
        assert_eq!(report.enrichment, StageCounts::default());
    }

    #[tokio::test]
    async fn test_repair_only_leaves_watermark_and_search_alone() {
        let (_dir, config, db) = temp_db();
        let search = FakeSearch::default();
        let metadata = FakeMetadata::default();
        let report = run(&config, &db, &metadata, &search, &FakeProvider::default(), SyncMode::RepairOnly).await;
        assert_eq!(report.watermark, None);
        assert_eq!(db.get_watermark().unwrap(), None);
        assert_eq!(*search.calls.lock().unwrap(), 0);
        assert!(metadata.asked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_clone_fails_only_that_repo() {
        let (_dir, config, db) = temp_db();
        let later = Utc::now() + chrono::Duration::days(1);
        let search = FakeSearch {
            items: vec![meta("acme/kit", later), meta("acme/missing", later)],
            ..Default::default()
        };
        let provider = FakeProvider::default().with_repo("acme/kit", KIT);

        let report = run(&config, &db, &FakeMetadata::default(), &search, &provider, SyncMode::Full).await;
        assert_eq!(report.repos.failed, 1);
        assert_eq!(report.repos.completed, 1);
        assert_eq!(report.changes.inserted, 3);
        assert!(report.watermark.is_some());
    }
}
