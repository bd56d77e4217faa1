//! Change detection between stored skills and a fresh repository snapshot
//!
//! Pure planning: no I/O happens here. The caller applies the plan (deletes and
//! inserts directly, field updates through the base writer, enrichment through
//! the orchestrator).

use std::collections::{BTreeMap, HashMap};

use crate::db::ExistingSkill;
use crate::descriptor::{
    basename, build_download_url, build_file_tree, build_install_instructions, front_matter_name,
};
use crate::extract::{EntryOutcome, RepoSnapshot};
use crate::writer::{SkillField, SkillUpdate};

/// Repository facts the plan needs to derive per-skill fields
#[derive(Debug, Clone)]
pub struct RepoContext {
    pub repo_name: String,
    pub url: String,
    pub branch: Option<String>,
    pub stars: i64,
}

/// A skill to insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewSkill {
    pub repo_name: String,
    pub from_repo: String,
    pub stars: i64,
    pub short_name: String,
    pub skill_path: String,
    pub content: Option<String>,
    pub content_hash: Option<String>,
    pub file_tree: String,
    pub download_url: String,
    pub how_to_install: String,
    /// False when the descriptor was too large or could not be read
    pub readable: bool,
}

/// A stored skill whose descriptor content changed
#[derive(Debug, Clone)]
pub struct ChangedSkill {
    pub id: i64,
    pub skill_name: String,
    pub content: String,
    pub update: SkillUpdate,
}

#[derive(Debug, Default)]
pub struct ChangePlan {
    pub deletions: Vec<i64>,
    pub checked: Vec<SkillUpdate>,
    pub changed: Vec<ChangedSkill>,
    pub new_skills: Vec<NewSkill>,
}

impl ChangePlan {
    pub fn is_noop(&self) -> bool {
        self.deletions.is_empty() && self.changed.is_empty() && self.new_skills.is_empty()
    }
}

/// Short skill name: front matter `name`, else the directory name, else the repo name.
pub fn derive_short_name(repo_name: &str, skill_path: &str, content: Option<&str>) -> String {
    if let Some(name) = content.and_then(front_matter_name) {
        return name;
    }
    if !skill_path.is_empty() {
        return basename(skill_path).to_string();
    }
    repo_name.rsplit('/').next().unwrap_or(repo_name).to_string()
}

/// Pick the first free name among `base`, a path-qualified variant, then `base-2`, `base-3`, ...
pub fn ensure_unique_name(
    base: &str,
    repo_name: &str,
    short_name: &str,
    skill_path: &str,
    mut exists: impl FnMut(&str) -> bool,
) -> String {
    if !exists(base) {
        return base.to_string();
    }

    let qualified = if skill_path.is_empty() {
        format!("{}:{}-root", repo_name, short_name)
    } else {
        format!("{}:{}", repo_name, skill_path.replace('/', "_"))
    };
    if !exists(&qualified) {
        return qualified;
    }

    (2u32..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !exists(candidate))
        .unwrap_or_else(|| format!("{}-{}", base, u32::MAX))
}

fn derived_fields(repo: &RepoContext, snapshot: &RepoSnapshot, skill_path: &str) -> (String, String, String) {
    let file_tree = build_file_tree(&snapshot.files, skill_path);
    let download_url = build_download_url(&repo.url, repo.branch.as_deref(), skill_path);
    let how_to_install = build_install_instructions(&repo.url, skill_path, &download_url);
    (file_tree, download_url, how_to_install)
}

/// Compare stored skills for one repository against its snapshot.
///
/// Stored skills without a path are left alone; path repair owns them.
pub fn plan_repo_changes(
    repo: &RepoContext,
    existing: &[ExistingSkill],
    snapshot: &RepoSnapshot,
    checked_at: &str,
) -> ChangePlan {
    let mut plan = ChangePlan::default();

    let mut by_path: HashMap<&str, Vec<&ExistingSkill>> = HashMap::new();
    for skill in existing {
        if let Some(path) = skill.skill_path.as_deref() {
            by_path.entry(path).or_default().push(skill);
        }
    }

    for skill in existing {
        if let Some(path) = skill.skill_path.as_deref() {
            if !snapshot.entries.contains_key(path) {
                plan.deletions.push(skill.id);
            }
        }
    }

    for (path, entry) in &snapshot.entries {
        let Some(records) = by_path.get(path.as_str()) else {
            plan.new_skills.push(new_skill(repo, snapshot, path, &entry.outcome));
            continue;
        };

        // Duplicate records at one path are each kept in step with upstream
        for stored in records {
            let checked = SkillUpdate::new(stored.id).text(SkillField::LastCheckedAt, checked_at);
            match &entry.outcome {
                EntryOutcome::Content { text, hash } => {
                    let stored_hash = stored.skill_md_sha.as_deref().unwrap_or("");
                    if stored_hash == hash {
                        plan.checked.push(checked);
                    } else if stored_hash.is_empty() && stored.skill_md_content.as_deref() == Some(text.as_str()) {
                        plan.checked.push(checked.text(SkillField::SkillMdSha, hash.clone()));
                    } else {
                        let (file_tree, download_url, how_to_install) = derived_fields(repo, snapshot, path);
                        let update = checked
                            .text(SkillField::SkillMdContent, text.clone())
                            .text(SkillField::SkillMdSha, hash.clone())
                            .text(SkillField::FileTree, file_tree)
                            .text(SkillField::DownloadUrl, download_url)
                            .text(SkillField::HowToInstall, how_to_install)
                            .integer(SkillField::RepoStars, repo.stars);
                        plan.changed.push(ChangedSkill {
                            id: stored.id,
                            skill_name: stored.skill_name.clone(),
                            content: text.clone(),
                            update,
                        });
                    }
                }
                EntryOutcome::TooLarge { .. } | EntryOutcome::Failed { .. } => {
                    plan.checked.push(checked);
                }
            }
        }
    }

    plan
}

fn new_skill(repo: &RepoContext, snapshot: &RepoSnapshot, path: &str, outcome: &EntryOutcome) -> NewSkill {
    let (content, content_hash) = match outcome {
        EntryOutcome::Content { text, hash } => (Some(text.clone()), Some(hash.clone())),
        _ => (None, None),
    };
    let (file_tree, download_url, how_to_install) = derived_fields(repo, snapshot, path);
    NewSkill {
        repo_name: repo.repo_name.clone(),
        from_repo: repo.url.clone(),
        stars: repo.stars,
        short_name: derive_short_name(&repo.repo_name, path, content.as_deref()),
        skill_path: path.to_string(),
        readable: content.is_some(),
        content,
        content_hash,
        file_tree,
        download_url,
        how_to_install,
    }
}

/// Count of each outcome kind, for log lines
pub fn outcome_counts(snapshot: &RepoSnapshot) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for entry in snapshot.entries.values() {
        let key = match entry.outcome {
            EntryOutcome::Content { .. } => "read",
            EntryOutcome::TooLarge { .. } => "too_large",
            EntryOutcome::Failed { .. } => "failed",
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::content_hash;
    use crate::extract::SnapshotEntry;

    fn repo() -> RepoContext {
        RepoContext {
            repo_name: "acme/skills".to_string(),
            url: "https://github.com/acme/skills".to_string(),
            branch: Some("main".to_string()),
            stars: 42,
        }
    }

    fn content_entry(path: &str, text: &str) -> (String, SnapshotEntry) {
        (
            path.to_string(),
            SnapshotEntry {
                skill_path: path.to_string(),
                file_path: if path.is_empty() { "SKILL.md".to_string() } else { format!("{}/SKILL.md", path) },
                outcome: EntryOutcome::Content { text: text.to_string(), hash: content_hash(text) },
            },
        )
    }

    fn stored(id: i64, path: Option<&str>, text: &str) -> ExistingSkill {
        ExistingSkill {
            id,
            skill_name: format!("acme/skills:{}", path.unwrap_or("x")),
            skill_path: path.map(String::from),
            skill_md_sha: Some(content_hash(text)),
            skill_md_content: Some(text.to_string()),
        }
    }

    fn snapshot(entries: Vec<(String, SnapshotEntry)>) -> RepoSnapshot {
        let files = entries.iter().map(|(_, e)| e.file_path.clone()).collect();
        RepoSnapshot { entries: entries.into_iter().collect(), files }
    }

    #[test]
    fn test_incremental_change_scenario() {
        // Stored {a, b, c}; snapshot has a unchanged, b modified, d new, c gone
        let existing = vec![
            stored(1, Some("a"), "alpha"),
            stored(2, Some("b"), "beta"),
            stored(3, Some("c"), "gamma"),
        ];
        let snap = snapshot(vec![
            content_entry("a", "alpha"),
            content_entry("b", "beta v2"),
            content_entry("d", "---\nname: delta-tool\n---\n"),
        ]);

        let plan = plan_repo_changes(&repo(), &existing, &snap, "2026-03-01T00:00:00Z");

        assert_eq!(plan.deletions, vec![3]);
        assert_eq!(plan.checked.len(), 1);
        assert_eq!(plan.checked[0].id, 1);
        assert_eq!(plan.checked[0].fields().len(), 1);

        assert_eq!(plan.changed.len(), 1);
        let changed = &plan.changed[0];
        assert_eq!(changed.id, 2);
        assert_eq!(changed.content, "beta v2");
        assert_eq!(
            changed.update.fields()[&SkillField::SkillMdSha],
            crate::writer::FieldValue::Text(content_hash("beta v2"))
        );
        assert!(changed.update.fields().contains_key(&SkillField::FileTree));

        assert_eq!(plan.new_skills.len(), 1);
        assert_eq!(plan.new_skills[0].short_name, "delta-tool");
        assert_eq!(plan.new_skills[0].skill_path, "d");
        assert!(plan.new_skills[0].readable);
    }

    #[test]
    fn test_replanning_after_apply_is_noop() {
        let snap = snapshot(vec![content_entry("a", "alpha"), content_entry("b", "beta v2")]);
        let existing = vec![stored(1, Some("a"), "alpha"), stored(2, Some("b"), "beta v2")];

        let plan = plan_repo_changes(&repo(), &existing, &snap, "t");
        assert!(plan.is_noop());
        assert_eq!(plan.checked.len(), 2);
    }

    #[test]
    fn test_missing_hash_with_same_content_backfills() {
        let mut skill = stored(1, Some("a"), "alpha");
        skill.skill_md_sha = None;
        let snap = snapshot(vec![content_entry("a", "alpha")]);

        let plan = plan_repo_changes(&repo(), &[skill], &snap, "t");
        assert!(plan.changed.is_empty());
        assert_eq!(
            plan.checked[0].fields()[&SkillField::SkillMdSha],
            crate::writer::FieldValue::Text(content_hash("alpha"))
        );
    }

    #[test]
    fn test_unreadable_entries_only_mark_checked() {
        let existing = vec![stored(1, Some("big"), "old"), stored(2, Some("broken"), "old")];
        let snap = snapshot(vec![
            (
                "big".to_string(),
                SnapshotEntry {
                    skill_path: "big".into(),
                    file_path: "big/SKILL.md".into(),
                    outcome: EntryOutcome::TooLarge { size: 200_000 },
                },
            ),
            (
                "broken".to_string(),
                SnapshotEntry {
                    skill_path: "broken".into(),
                    file_path: "broken/SKILL.md".into(),
                    outcome: EntryOutcome::Failed { error: "entry timeout".into() },
                },
            ),
        ]);

        let plan = plan_repo_changes(&repo(), &existing, &snap, "t");
        assert!(plan.is_noop());
        assert_eq!(plan.checked.len(), 2);
    }

    #[test]
    fn test_records_sharing_a_path_are_all_planned() {
        let existing = vec![stored(1, Some("a"), "old"), stored(2, Some("a"), "old"), stored(3, Some("b"), "beta")];
        let snap = snapshot(vec![content_entry("a", "new"), content_entry("b", "beta")]);

        let plan = plan_repo_changes(&repo(), &existing, &snap, "t");
        let changed: Vec<i64> = plan.changed.iter().map(|c| c.id).collect();
        assert_eq!(changed, vec![1, 2]);
        assert!(plan.changed.iter().all(|c| c.content == "new"));
        assert_eq!(plan.checked.len(), 1);
        assert_eq!(plan.checked[0].id, 3);
        assert!(plan.new_skills.is_empty());

        // Both duplicates go when the path disappears upstream
        let gone = plan_repo_changes(&repo(), &existing, &snapshot(vec![content_entry("b", "beta")]), "t");
        assert_eq!(gone.deletions, vec![1, 2]);
    }

    #[test]
    fn test_pathless_records_are_not_deleted() {
        let existing = vec![stored(7, None, "legacy")];
        let snap = snapshot(vec![content_entry("a", "alpha")]);
        let plan = plan_repo_changes(&repo(), &existing, &snap, "t");
        assert!(plan.deletions.is_empty());
        assert_eq!(plan.new_skills.len(), 1);
    }

    #[test]
    fn test_new_unreadable_skill_has_no_hash() {
        let snap = snapshot(vec![(
            String::new(),
            SnapshotEntry {
                skill_path: String::new(),
                file_path: "SKILL.md".into(),
                outcome: EntryOutcome::TooLarge { size: 1 << 20 },
            },
        )]);
        let plan = plan_repo_changes(&repo(), &[], &snap, "t");
        let skill = &plan.new_skills[0];
        assert!(!skill.readable);
        assert_eq!(skill.content_hash, None);
        assert_eq!(skill.short_name, "skills");
        assert!(skill.download_url.ends_with("/archive/refs/heads/main.zip"));
    }

    #[test]
    fn test_derive_short_name() {
        assert_eq!(derive_short_name("a/b", "x/pdf", Some("---\nname: pdf-pro\n---")), "pdf-pro");
        assert_eq!(derive_short_name("a/b", "x/pdf", Some("# no front matter")), "pdf");
        assert_eq!(derive_short_name("a/b", "", None), "b");
    }

    #[test]
    fn test_ensure_unique_name_sequence() {
        let taken = ["a/b:pdf", "a/b:x_pdf", "a/b:pdf-2"];
        let name = ensure_unique_name("a/b:pdf", "a/b", "pdf", "x/pdf", |c| taken.contains(&c));
        assert_eq!(name, "a/b:pdf-3");

        let name = ensure_unique_name("a/b:b", "a/b", "b", "", |c| c == "a/b:b");
        assert_eq!(name, "a/b:b-root");

        let name = ensure_unique_name("a/b:new", "a/b", "new", "new", |_| false);
        assert_eq!(name, "a/b:new");
    }
}
