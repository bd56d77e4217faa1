//! Snapshot extraction: find every SKILL.md in a repository and read it
//!
//! Repository access goes through [`RepoSource`] so the pool logic can be driven
//! by an in-memory fake in tests; [`GitCheckout`] is the real implementation
//! over a temporary `--no-checkout` clone.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::Instant;

use crate::descriptor::{content_hash_bytes, parent_dir};
use crate::error::{SyncError, SyncResult};

const DESCRIPTOR_FILE: &str = "SKILL.md";
pub const ENTRY_TIMEOUT: &str = "entry timeout";

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Content { text: String, hash: String },
    TooLarge { size: u64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    /// Directory holding the descriptor ("" for the repository root)
    pub skill_path: String,
    pub file_path: String,
    pub outcome: EntryOutcome,
}

/// Every descriptor found in one repository, keyed by skill path, plus the full file list
#[derive(Debug, Clone, Default)]
pub struct RepoSnapshot {
    pub entries: BTreeMap<String, SnapshotEntry>,
    pub files: Vec<String>,
}

#[derive(Debug)]
pub enum ExtractOutcome {
    Snapshot(RepoSnapshot),
    /// More descriptors than the configured ceiling; the repository is skipped
    TooManyDescriptors { found: usize },
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub entry_workers: usize,
    pub max_bytes: u64,
    pub substep_timeout: Duration,
    pub max_descriptors: Option<usize>,
}

#[async_trait]
pub trait RepoSource: Send + Sync {
    async fn list_files(&self) -> SyncResult<Vec<String>>;
    async fn file_size(&self, path: &str) -> SyncResult<u64>;
    /// Raw file bytes; decoding is left to the caller.
    async fn read_file(&self, path: &str) -> SyncResult<Vec<u8>>;
}

/// Descriptor file per skill directory. The canonical `SKILL.md` spelling wins
/// over other casings in the same directory.
pub fn find_candidates(files: &[String]) -> BTreeMap<String, String> {
    let mut candidates: BTreeMap<String, String> = BTreeMap::new();
    for path in files {
        let name = path.rsplit('/').next().unwrap_or(path);
        if !name.eq_ignore_ascii_case(DESCRIPTOR_FILE) {
            continue;
        }
        let dir = parent_dir(path).to_string();
        let preferred = name == DESCRIPTOR_FILE;
        match candidates.get(&dir) {
            Some(existing) if existing.ends_with(DESCRIPTOR_FILE) && !preferred => {}
            _ => {
                candidates.insert(dir, path.clone());
            }
        }
    }
    candidates
}

async fn read_entry(source: &dyn RepoSource, file_path: &str, options: &ExtractOptions) -> EntryOutcome {
    let deadline = Instant::now() + options.substep_timeout;
    let work = async {
        let size = source.file_size(file_path).await?;
        if size > options.max_bytes {
            return Ok::<_, SyncError>(EntryOutcome::TooLarge { size });
        }
        let raw = source.read_file(file_path).await?;
        let hash = content_hash_bytes(&raw);
        let text = String::from_utf8_lossy(&raw).into_owned();
        Ok(EntryOutcome::Content { text, hash })
    };

    match tokio::time::timeout_at(deadline, work).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => EntryOutcome::Failed { error: e.to_string() },
        Err(_) => EntryOutcome::Failed { error: ENTRY_TIMEOUT.to_string() },
    }
}

/// List, select and read every descriptor in `source`.
///
/// Every candidate ends up in the snapshot with exactly one outcome; entries
/// still pending when the pool deadline passes are recorded as timed out.
pub async fn extract_snapshot(
    source: &dyn RepoSource,
    repo_name: &str,
    options: &ExtractOptions,
) -> SyncResult<ExtractOutcome> {
    let files = source.list_files().await?;
    let candidates = find_candidates(&files);
    let total = candidates.len();

    if let Some(max) = options.max_descriptors {
        if total > max {
            tracing::warn!(repo = repo_name, found = total, max, "too many SKILL.md files, skipping repository");
            return Ok(ExtractOutcome::TooManyDescriptors { found: total });
        }
    }
    if total > 0 {
        tracing::debug!(repo = repo_name, found = total, "found SKILL.md files");
    }

    let workers = options.entry_workers.max(1).min(total.max(1));
    let mut reads = stream::iter(candidates.iter())
        .map(|(skill_path, file_path)| async move {
            let outcome = read_entry(source, file_path, options).await;
            (skill_path.clone(), file_path.clone(), outcome)
        })
        .buffer_unordered(workers);

    let mut entries = BTreeMap::new();
    let pool_deadline = Instant::now() + options.substep_timeout;
    loop {
        match tokio::time::timeout_at(pool_deadline, reads.next()).await {
            Ok(Some((skill_path, file_path, outcome))) => {
                match &outcome {
                    EntryOutcome::TooLarge { size } => {
                        tracing::warn!(repo = repo_name, path = %file_path, size, "SKILL.md too large, not read")
                    }
                    EntryOutcome::Failed { error } => {
                        tracing::warn!(repo = repo_name, path = %file_path, error = %error, "SKILL.md read failed")
                    }
                    EntryOutcome::Content { .. } => {}
                }
                entries.insert(
                    skill_path.clone(),
                    SnapshotEntry { skill_path, file_path, outcome },
                );
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(repo = repo_name, done = entries.len(), total, "SKILL.md reads timed out");
                break;
            }
        }
    }
    drop(reads);

    for (skill_path, file_path) in &candidates {
        entries.entry(skill_path.clone()).or_insert_with(|| SnapshotEntry {
            skill_path: skill_path.clone(),
            file_path: file_path.clone(),
            outcome: EntryOutcome::Failed { error: ENTRY_TIMEOUT.to_string() },
        });
    }

    Ok(ExtractOutcome::Snapshot(RepoSnapshot { entries, files }))
}

/// `.git` clone URL for a repository
pub fn clone_url(repo_name: &str, repo_url: Option<&str>) -> String {
    match repo_url.map(|u| u.trim_end_matches('/')).filter(|u| !u.is_empty()) {
        Some(url) if url.ends_with(".git") => url.to_string(),
        Some(url) => format!("{}.git", url),
        None => format!("https://github.com/{}.git", repo_name),
    }
}

/// Large or unknown-size repositories get a shallow, blobless clone.
pub fn should_shallow_clone(size_kb: Option<u64>, full_clone_max_kb: u64) -> bool {
    size_kb.map_or(true, |kb| kb > full_clone_max_kb)
}

async fn run_git(cwd: Option<&Path>, args: Vec<OsString>, timeout: Duration) -> SyncResult<Vec<u8>> {
    let mut cmd = Command::new("git");
    if let Some(dir) = cwd {
        cmd.arg("-C").arg(dir);
    }
    let label = args
        .iter()
        .take(2)
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    cmd.args(&args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result?,
        Err(_) => return Err(SyncError::Timeout(format!("git {}", label))),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() { format!("git {} failed", label) } else { stderr };
        return Err(SyncError::Fatal(message));
    }
    Ok(output.stdout)
}

/// Temporary bare-ish clone. The directory is removed when this is dropped.
pub struct GitCheckout {
    dir: TempDir,
    timeout: Duration,
}

impl GitCheckout {
    /// Clone without checking out a working tree.
    pub async fn clone(url: &str, branch: Option<&str>, shallow: bool, timeout: Duration) -> SyncResult<Self> {
        let dir = tempfile::Builder::new().prefix("skillsync-").tempdir()?;

        let mut args: Vec<OsString> = vec!["clone".into(), "--no-checkout".into()];
        if let Some(branch) = branch.filter(|b| !b.is_empty()) {
            args.push("--branch".into());
            args.push(branch.into());
        }
        args.push("--single-branch".into());
        if shallow {
            args.extend(["--depth".into(), "1".into(), "--filter=blob:none".into()]);
        }
        args.push(url.into());
        args.push(dir.path().as_os_str().to_owned());

        run_git(None, args, timeout).await?;
        Ok(Self { dir, timeout })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    async fn git(&self, args: &[&str]) -> SyncResult<Vec<u8>> {
        let args = args.iter().map(OsString::from).collect();
        run_git(Some(self.dir.path()), args, self.timeout).await
    }
}

#[async_trait]
impl RepoSource for GitCheckout {
    async fn list_files(&self) -> SyncResult<Vec<String>> {
        let out = self
            .git(&["-c", "core.quotepath=off", "ls-tree", "-r", "--name-only", "HEAD"])
            .await?;
        Ok(String::from_utf8_lossy(&out)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn file_size(&self, path: &str) -> SyncResult<u64> {
        let out = self.git(&["cat-file", "-s", &format!("HEAD:{}", path)]).await?;
        let text = String::from_utf8_lossy(&out);
        text.trim()
            .parse()
            .map_err(|_| SyncError::Fatal(format!("unexpected blob size output: {}", text.trim())))
    }

    async fn read_file(&self, path: &str) -> SyncResult<Vec<u8>> {
        self.git(&["show", &format!("HEAD:{}", path)]).await
    }
}

/// Where repository contents come from
#[async_trait]
pub trait RepoProvider: Send + Sync {
    /// Open `repo_name` at `branch` (default branch when `None`). `size_kb`
    /// is the last known repository size, if any.
    async fn open(
        &self,
        repo_name: &str,
        repo_url: Option<&str>,
        branch: Option<&str>,
        size_kb: Option<u64>,
    ) -> SyncResult<Box<dyn RepoSource>>;
}

/// Clones into a temporary directory that lives as long as the returned source.
pub struct GitProvider {
    pub full_clone_max_kb: u64,
    pub timeout: Duration,
}

#[async_trait]
impl RepoProvider for GitProvider {
    async fn open(
        &self,
        repo_name: &str,
        repo_url: Option<&str>,
        branch: Option<&str>,
        size_kb: Option<u64>,
    ) -> SyncResult<Box<dyn RepoSource>> {
        let shallow = should_shallow_clone(size_kb, self.full_clone_max_kb);
        let url = clone_url(repo_name, repo_url);
        tracing::debug!(repo = repo_name, shallow, "cloning");
        let checkout = GitCheckout::clone(&url, branch, shallow, self.timeout).await?;
        Ok(Box::new(checkout))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory repository with per-file delays and failures
    #[derive(Default)]
    pub(crate) struct FakeRepo {
        pub files: HashMap<String, Vec<u8>>,
        pub delays: HashMap<String, Duration>,
        pub failing: HashSet<String>,
        pub in_flight: Arc<AtomicUsize>,
        pub peak: Arc<AtomicUsize>,
    }

    impl FakeRepo {
        pub(crate) fn with_files(files: &[(&str, &str)]) -> Self {
            Self {
                files: files.iter().map(|(p, c)| (p.to_string(), c.as_bytes().to_vec())).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RepoSource for FakeRepo {
        async fn list_files(&self) -> SyncResult<Vec<String>> {
            let mut files: Vec<String> = self.files.keys().cloned().collect();
            files.sort();
            Ok(files)
        }

        async fn file_size(&self, path: &str) -> SyncResult<u64> {
            self.files
                .get(path)
                .map(|c| c.len() as u64)
                .ok_or_else(|| SyncError::NotFound(path.to_string()))
        }

        async fn read_file(&self, path: &str) -> SyncResult<Vec<u8>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delays.get(path) {
                tokio::time::sleep(*delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.failing.contains(path) {
                return Err(SyncError::Fatal("bad object".to_string()));
            }
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(path.to_string()))
        }
    }

    /// Provider over fixed file sets, keyed by lowercase repository name
    #[derive(Default)]
    pub(crate) struct FakeProvider {
        pub repos: HashMap<String, Vec<(String, String)>>,
        pub opened: std::sync::Mutex<Vec<String>>,
    }

    impl FakeProvider {
        pub(crate) fn with_repo(mut self, repo_name: &str, files: &[(&str, &str)]) -> Self {
            self.repos.insert(
                repo_name.to_lowercase(),
                files.iter().map(|(p, c)| (p.to_string(), c.to_string())).collect(),
            );
            self
        }
    }

    #[async_trait]
    impl RepoProvider for FakeProvider {
        async fn open(
            &self,
            repo_name: &str,
            _repo_url: Option<&str>,
            _branch: Option<&str>,
            _size_kb: Option<u64>,
        ) -> SyncResult<Box<dyn RepoSource>> {
            self.opened.lock().unwrap().push(repo_name.to_string());
            let files = self
                .repos
                .get(&repo_name.to_lowercase())
                .ok_or_else(|| SyncError::Fatal(format!("clone of {} failed", repo_name)))?;
            Ok(Box::new(FakeRepo {
                files: files.iter().map(|(p, c)| (p.clone(), c.clone().into_bytes())).collect(),
                ..Default::default()
            }))
        }
    }

    fn options(max_descriptors: Option<usize>) -> ExtractOptions {
        ExtractOptions {
            entry_workers: 2,
            max_bytes: 100,
            substep_timeout: Duration::from_secs(1),
            max_descriptors,
        }
    }

    fn snapshot_of(outcome: ExtractOutcome) -> RepoSnapshot {
        match outcome {
            ExtractOutcome::Snapshot(s) => s,
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_find_candidates_prefers_canonical_case() {
        let files: Vec<String> = ["a/skill.md", "a/SKILL.md", "b/Skill.md", "README.md", "c/myskill.md", "SKILL.md"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let candidates = find_candidates(&files);
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates["a"], "a/SKILL.md");
        assert_eq!(candidates["b"], "b/Skill.md");
        assert_eq!(candidates[""], "SKILL.md");

        // Order does not matter
        let reversed: Vec<String> = files.iter().rev().cloned().collect();
        assert_eq!(find_candidates(&reversed)["a"], "a/SKILL.md");
    }

    #[tokio::test]
    async fn test_every_candidate_gets_an_outcome() {
        let big = "x".repeat(500);
        let mut repo = FakeRepo::with_files(&[
            ("ok/SKILL.md", "---\nname: ok\n---\n"),
            ("big/SKILL.md", big.as_str()),
            ("bad/SKILL.md", "unreadable"),
            ("src/main.rs", "fn main() {}"),
        ]);
        repo.failing.insert("bad/SKILL.md".to_string());

        let snapshot = snapshot_of(extract_snapshot(&repo, "acme/skills", &options(None)).await.unwrap());
        assert_eq!(snapshot.entries.len(), 3);
        assert_eq!(snapshot.files.len(), 4);
        assert!(matches!(snapshot.entries["ok"].outcome, EntryOutcome::Content { .. }));
        assert_eq!(snapshot.entries["big"].outcome, EntryOutcome::TooLarge { size: 500 });
        assert!(matches!(snapshot.entries["bad"].outcome, EntryOutcome::Failed { .. }));

        if let EntryOutcome::Content { text, hash } = &snapshot.entries["ok"].outcome {
            assert_eq!(hash, &crate::descriptor::content_hash(text));
        }
    }

    #[tokio::test]
    async fn test_hash_covers_bytes_lost_in_decoding() {
        let mut first = FakeRepo::default();
        first.files.insert("a/SKILL.md".to_string(), b"name: a\n\xff".to_vec());
        let mut second = FakeRepo::default();
        second.files.insert("a/SKILL.md".to_string(), b"name: a\n\xfe".to_vec());

        let one = snapshot_of(extract_snapshot(&first, "acme/skills", &options(None)).await.unwrap());
        let two = snapshot_of(extract_snapshot(&second, "acme/skills", &options(None)).await.unwrap());
        match (&one.entries["a"].outcome, &two.entries["a"].outcome) {
            (EntryOutcome::Content { text: t1, hash: h1 }, EntryOutcome::Content { text: t2, hash: h2 }) => {
                assert_eq!(t1, t2);
                assert_ne!(h1, h2);
            }
            other => panic!("expected readable entries, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_entry_times_out_without_losing_others() {
        let mut repo = FakeRepo::with_files(&[("fast/SKILL.md", "fast"), ("slow/SKILL.md", "slow")]);
        repo.delays.insert("slow/SKILL.md".to_string(), Duration::from_secs(600));

        let snapshot = snapshot_of(extract_snapshot(&repo, "acme/skills", &options(None)).await.unwrap());
        assert!(matches!(snapshot.entries["fast"].outcome, EntryOutcome::Content { .. }));
        assert_eq!(
            snapshot.entries["slow"].outcome,
            EntryOutcome::Failed { error: ENTRY_TIMEOUT.to_string() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_pool_is_bounded() {
        let files: Vec<(String, String)> = (0..8).map(|i| (format!("s{}/SKILL.md", i), format!("skill {}", i))).collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
        let mut repo = FakeRepo::with_files(&refs);
        for (path, _) in &files {
            repo.delays.insert(path.clone(), Duration::from_millis(50));
        }

        let snapshot = snapshot_of(extract_snapshot(&repo, "acme/many", &options(None)).await.unwrap());
        assert_eq!(snapshot.entries.len(), 8);
        assert!(repo.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_descriptor_ceiling() {
        let repo = FakeRepo::with_files(&[("a/SKILL.md", "a"), ("b/SKILL.md", "b"), ("c/SKILL.md", "c")]);

        let outcome = extract_snapshot(&repo, "acme/wide", &options(Some(2))).await.unwrap();
        assert!(matches!(outcome, ExtractOutcome::TooManyDescriptors { found: 3 }));

        let outcome = extract_snapshot(&repo, "acme/wide", &options(None)).await.unwrap();
        assert_eq!(snapshot_of(outcome).entries.len(), 3);
    }

    #[tokio::test]
    async fn test_no_descriptors_is_empty_snapshot() {
        let repo = FakeRepo::with_files(&[("README.md", "hi")]);
        let snapshot = snapshot_of(extract_snapshot(&repo, "acme/none", &options(Some(2))).await.unwrap());
        assert!(snapshot.entries.is_empty());
    }

    #[test]
    fn test_clone_url_and_shallow_policy() {
        assert_eq!(clone_url("a/b", None), "https://github.com/a/b.git");
        assert_eq!(clone_url("a/b", Some("https://github.com/a/b/")), "https://github.com/a/b.git");
        assert_eq!(clone_url("a/b", Some("https://x/a/b.git")), "https://x/a/b.git");
        assert!(should_shallow_clone(None, 80_000));
        assert!(should_shallow_clone(Some(90_000), 80_000));
        assert!(!should_shallow_clone(Some(1_000), 80_000));
    }
}
