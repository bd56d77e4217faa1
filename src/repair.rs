//! Repair passes over stored skills
//!
//! Validation backfill re-enriches records with missing or stale fields.
//! Skill-path backfill clones each repository holding path-less records and
//! lets the disambiguator pick the directory each one came from.

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;

use crate::db::{repo_name_of, Database, PathlessSkill};
use crate::disambiguate::{candidates_from_snapshot, select_skill_path, skill_identifier};
use crate::enrich::{run_enrichment, Enricher, EnrichmentTask, SKILL_MD_TOO_LARGE_NOTICE};
use crate::error::SyncResult;
use crate::extract::{extract_snapshot, ExtractOptions, ExtractOutcome, RepoProvider, RepoSnapshot};
use crate::progress::{Outcome, StageCounts, StageProgress};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PathRepairReport {
    pub repos: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub failed_repos: usize,
}

/// Re-enrich every skill with a missing field or a translation placeholder
/// that no longer applies.
pub async fn validation_backfill(
    db: &Database,
    enricher: &Enricher,
    translation_max_chars: usize,
    concurrency: usize,
) -> Result<StageCounts> {
    let rows = db
        .skills_needing_enrichment(SKILL_MD_TOO_LARGE_NOTICE, translation_max_chars, None)
        .context("Failed to load skills needing enrichment")?;
    if rows.is_empty() {
        tracing::info!("validation backfill: nothing to do");
        return Ok(StageCounts::default());
    }
    tracing::info!(skills = rows.len(), "validation backfill");

    let tasks = rows.into_iter().map(EnrichmentTask::from_row).collect();
    let progress = StageProgress::new("validation", 0);
    let counts = run_enrichment(enricher, tasks, concurrency, &progress).await;
    eprintln!("\x1b[32mok\x1b[0m {}", progress.summary_line());
    Ok(counts)
}

/// Snapshot of a repository's default branch with every descriptor read.
pub async fn snapshot_default_branch(
    provider: &dyn RepoProvider,
    repo_name: &str,
    repo_url: Option<&str>,
    options: &ExtractOptions,
) -> SyncResult<RepoSnapshot> {
    let source = provider.open(repo_name, repo_url, None, None).await?;
    let unbounded = ExtractOptions { max_descriptors: None, ..options.clone() };
    match extract_snapshot(source.as_ref(), repo_name, &unbounded).await? {
        ExtractOutcome::Snapshot(snapshot) => Ok(snapshot),
        ExtractOutcome::TooManyDescriptors { .. } => Ok(RepoSnapshot::default()),
    }
}

/// Resolve each record against one repository. `None` means ambiguous or absent.
async fn resolve_repo(
    provider: &dyn RepoProvider,
    repo_name: &str,
    records: &[PathlessSkill],
    options: &ExtractOptions,
) -> SyncResult<Vec<(i64, Option<String>)>> {
    let repo_url = records.first().map(|r| r.from_repo.as_str());
    let snapshot = snapshot_default_branch(provider, repo_name, repo_url, options).await?;
    let candidates = candidates_from_snapshot(repo_name, &snapshot);
    if candidates.is_empty() {
        tracing::warn!(repo = repo_name, "no SKILL.md in repository");
    }
    Ok(records
        .iter()
        .map(|record| {
            let identifier = skill_identifier(&record.skill_name);
            (record.id, select_skill_path(identifier, &candidates).map(String::from))
        })
        .collect())
}

/// Fill in NULL skill paths, one clone per repository.
pub async fn skill_path_backfill(
    db: &Database,
    provider: &dyn RepoProvider,
    options: &ExtractOptions,
    concurrency: usize,
) -> Result<PathRepairReport> {
    let rows = db.skills_missing_path().context("Failed to load path-less skills")?;
    let mut by_repo: BTreeMap<String, Vec<PathlessSkill>> = BTreeMap::new();
    for row in rows {
        let repo = repo_name_of(&row.skill_name, &row.from_repo);
        if repo.is_empty() {
            tracing::warn!(skill_id = row.id, skill = %row.skill_name, "cannot tell repository of skill");
            continue;
        }
        by_repo.entry(repo).or_default().push(row);
    }

    let mut report = PathRepairReport { repos: by_repo.len(), ..Default::default() };
    if by_repo.is_empty() {
        tracing::info!("skill path backfill: nothing to do");
        return Ok(report);
    }
    tracing::info!(repos = by_repo.len(), "skill path backfill");

    let progress = StageProgress::new("skill_path", by_repo.len());
    let results: Vec<_> = stream::iter(by_repo.iter())
        .map(|(repo, records)| {
            let progress = &progress;
            async move {
                let result = resolve_repo(provider, repo, records, options).await;
                let outcome = if result.is_ok() { Outcome::Completed } else { Outcome::Failed };
                progress.tick(outcome, repo);
                (repo, result)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    for (repo, result) in results {
        match result {
            Ok(resolutions) => {
                for (id, path) in resolutions {
                    match path {
                        Some(path) => {
                            if db.set_skill_path(id, &path)? {
                                report.resolved += 1;
                            }
                        }
                        None => {
                            tracing::info!(skill_id = id, repo = %repo, "skill path left unresolved");
                            report.unresolved += 1;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(repo = %repo, kind = e.kind(), error = %e, "clone or read failed");
                report.failed_repos += 1;
            }
        }
    }

    eprintln!(
        "\x1b[32mok\x1b[0m skill paths: {} resolved, {} unresolved, {} repos failed",
        report.resolved, report.unresolved, report.failed_repos
    );
    Ok(report)
}
