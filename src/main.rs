mod changes;
mod config;
mod db;
mod descriptor;
mod disambiguate;
mod discovery;
mod enrich;
mod error;
mod extract;
mod github;
mod lang;
mod llm;
mod progress;
mod prompts;
mod ratelimit;
mod repair;
mod sync;
mod writer;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use config::Config;
use db::{repo_name_of, Database};
use disambiguate::{candidates_from_snapshot, select_skill_path, skill_identifier};
use extract::GitProvider;
use github::GitHubClient;
use llm::ChatClient;
use ratelimit::{RateLimiter, RetryPolicy};
use sync::{extract_options, GitHubMetadata, Pipeline, SyncMode, SyncReport};

/// Parallel GitHub API calls (search and metadata)
const GITHUB_CONCURRENCY: usize = 4;

#[derive(Parser)]
#[command(name = "skillsync")]
#[command(about = "Keep a skill registry in sync with GitHub and enrich new skills")]
#[command(after_help = "\x1b[36mExamples:\x1b[0m
  skillsync sync                 # Full incremental sync
  skillsync sync --only-repair   # Backfill missing fields and paths only
  skillsync stats                # Registry statistics
  skillsync resolve acme/kit:pdf # Show which directory a skill came from")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Maintain known repositories, discover new ones, enrich what changed
    Sync {
        /// Run only the repair passes (validation and skill-path backfill)
        #[arg(long, env = "ONLY_VALIDATION")]
        only_repair: bool,
    },

    /// Run the repair passes only
    Repair,

    /// Show registry statistics
    Stats,

    /// Resolve the skill path of one stored skill against a fresh clone
    Resolve {
        /// Stored skill name, e.g. "owner/repo:short-name"
        skill_name: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skillsync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let db = Database::open(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;

    match cli.command {
        Commands::Sync { only_repair } => {
            let mode = if only_repair { SyncMode::RepairOnly } else { SyncMode::Full };
            run_sync(&config, &db, mode).await
        }
        Commands::Repair => run_sync(&config, &db, SyncMode::RepairOnly).await,
        Commands::Stats => show_stats(&db),
        Commands::Resolve { skill_name } => resolve(&config, &db, &skill_name).await,
    }
}

fn limiters(config: &Config) -> (Arc<RateLimiter>, Arc<RateLimiter>) {
    let policy = RetryPolicy {
        max_retries: config.max_retries,
        base_delay: config.retry_delay,
        rate_limit_margin: config.rate_limit_margin,
        max_rate_limit_waits: config.max_rate_limit_waits,
    };
    let github = RateLimiter::new("github", GITHUB_CONCURRENCY, config.github_request_interval, policy.clone());
    let llm = RateLimiter::new(
        "llm",
        config.llm_concurrency,
        config.llm_request_interval,
        RetryPolicy { max_retries: config.llm_max_retries, ..policy },
    );
    (Arc::new(github), Arc::new(llm))
}

async fn run_sync(config: &Config, db: &Database, mode: SyncMode) -> Result<()> {
    let (github_limiter, llm_limiter) = limiters(config);
    let client = GitHubClient::new(config.github_token.clone(), github_limiter)?;
    if !client.has_token() {
        eprintln!("\x1b[33m..\x1b[0m No GitHub token found. Search is limited and batched metadata is off");
        eprintln!("  Set GITHUB_TOKEN or run: gh auth login");
    }
    if config.llm.api_key.is_empty() {
        eprintln!("\x1b[33m..\x1b[0m No API key for model {}; enrichment will fail", config.llm.model_id);
    }
    let chat = ChatClient::new(config.llm.clone(), llm_limiter)?;
    let metadata = GitHubMetadata { client: &client, batch_size: config.graphql_batch_size };
    let provider = GitProvider {
        full_clone_max_kb: config.full_clone_max_kb,
        timeout: config.substep_timeout,
    };

    let pipeline = Pipeline {
        config,
        db,
        metadata: &metadata,
        search: &client,
        provider: &provider,
        llm: Arc::new(chat),
    };
    let report = pipeline.run(mode).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SyncReport) {
    eprintln!("\n\x1b[36mSync Summary\x1b[0m\n");
    if report.watermark.is_some() {
        eprintln!("  \x1b[90mKnown repos checked:\x1b[0m  {}", report.maintained);
        eprintln!("  \x1b[90mRepos gone:\x1b[0m           {}", report.removed_repos);
        eprintln!("  \x1b[90mNew repos:\x1b[0m            {}", report.discovered);
        eprintln!(
            "  \x1b[90mRepos processed:\x1b[0m      {} ok, {} failed, {} skipped",
            report.repos.completed, report.repos.failed, report.repos.skipped
        );
        eprintln!(
            "  \x1b[90mSkills:\x1b[0m               {} new, {} changed, {} removed, {} unchanged",
            report.changes.inserted, report.changes.changed, report.changes.deleted, report.changes.checked
        );
        eprintln!(
            "  \x1b[90mEnriched:\x1b[0m             {} ok, {} failed",
            report.enrichment.completed, report.enrichment.failed
        );
    }
    eprintln!(
        "  \x1b[90mBackfilled:\x1b[0m           {} ok, {} failed, {} skipped",
        report.validation.completed, report.validation.failed, report.validation.skipped
    );
    eprintln!(
        "  \x1b[90mSkill paths:\x1b[0m          {} resolved, {} unresolved",
        report.paths.resolved, report.paths.unresolved
    );
    if let Some(at) = report.watermark {
        eprintln!("\n\x1b[32mok\x1b[0m Watermark set to {}", at.to_rfc3339());
    }
}

fn show_stats(db: &Database) -> Result<()> {
    let stats = db.stats()?;

    eprintln!("\x1b[36mRegistry Statistics\x1b[0m\n");
    eprintln!("  \x1b[90mSkills:\x1b[0m              {}", stats.skills);
    eprintln!("  \x1b[90mRepositories:\x1b[0m        {}", stats.repos);
    eprintln!("  \x1b[90mLast run:\x1b[0m            {}", stats.last_run.as_deref().unwrap_or("never"));
    eprintln!();
    eprintln!("  \x1b[90mMissing path:\x1b[0m        {}", stats.missing_path);
    eprintln!("  \x1b[90mMissing tagline:\x1b[0m     {}", stats.missing_tagline);
    eprintln!("  \x1b[90mMissing tags:\x1b[0m        {}", stats.missing_tags);
    eprintln!("  \x1b[90mMissing description:\x1b[0m {}", stats.missing_description);
    eprintln!("  \x1b[90mMissing use case:\x1b[0m    {}", stats.missing_use_case);
    eprintln!("  \x1b[90mMissing translation:\x1b[0m {}", stats.missing_translation);

    let missing_fields = stats.missing_tagline
        + stats.missing_tags
        + stats.missing_description
        + stats.missing_use_case
        + stats.missing_translation;
    if stats.missing_path > 0 || missing_fields > 0 {
        eprintln!("\n  \x1b[33mTip:\x1b[0m Run: skillsync repair");
    }

    Ok(())
}

async fn resolve(config: &Config, db: &Database, skill_name: &str) -> Result<()> {
    let skill = db
        .find_skill_by_name(skill_name)?
        .with_context(|| format!("No stored skill named {}", skill_name))?;
    let repo = repo_name_of(&skill.skill_name, &skill.from_repo);
    if repo.is_empty() {
        anyhow::bail!("Cannot tell which repository {} belongs to", skill.skill_name);
    }

    eprintln!("\x1b[36m..\x1b[0m Cloning {}", repo);
    let provider = GitProvider {
        full_clone_max_kb: config.full_clone_max_kb,
        timeout: config.substep_timeout,
    };
    let snapshot =
        repair::snapshot_default_branch(&provider, &repo, Some(&skill.from_repo), &extract_options(config))
            .await
            .with_context(|| format!("Failed to read {}", repo))?;
    let candidates = candidates_from_snapshot(&repo, &snapshot);

    eprintln!("\n\x1b[36m{}\x1b[0m", skill.skill_name);
    eprintln!("  \x1b[90mStored path:\x1b[0m {}", skill.skill_path.as_deref().unwrap_or("(none)"));
    eprintln!("  \x1b[90mCandidates:\x1b[0m  {}", candidates.len());
    for candidate in &candidates {
        let shown = if candidate.is_root { "(root)" } else { candidate.skill_path.as_str() };
        eprintln!("    {}", shown);
    }

    match select_skill_path(skill_identifier(&skill.skill_name), &candidates) {
        Some(path) => {
            let shown = if path.is_empty() { "(root)" } else { path };
            eprintln!("\n\x1b[32mok\x1b[0m Resolved to {}", shown);
        }
        None => eprintln!("\n\x1b[33m⚠\x1b[0m Ambiguous or absent; left unresolved"),
    }
    Ok(())
}
