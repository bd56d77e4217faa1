//! Resolve which directory a stored skill came from when its path was never recorded.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::changes::derive_short_name;
use crate::descriptor::basename;
use crate::extract::{EntryOutcome, RepoSnapshot};

static NUMERIC_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"-\d+$").unwrap());

/// Lowercase and keep only ASCII letters and digits.
pub fn normalize_token(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkillPathCandidate {
    pub skill_path: String,
    pub short_norm: String,
    pub basename_norm: String,
    pub alias_norm: String,
    pub is_root: bool,
}

impl SkillPathCandidate {
    pub fn new(repo_name: &str, skill_path: &str, content: Option<&str>) -> Self {
        let short = derive_short_name(repo_name, skill_path, content);
        Self {
            skill_path: skill_path.to_string(),
            short_norm: normalize_token(&short),
            basename_norm: normalize_token(basename(skill_path)),
            alias_norm: normalize_token(&skill_path.replace('/', "_")),
            is_root: skill_path.is_empty(),
        }
    }

    fn key(&self, key: MatchKey) -> &str {
        match key {
            MatchKey::Short => &self.short_norm,
            MatchKey::Basename => &self.basename_norm,
            MatchKey::Alias => &self.alias_norm,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum MatchKey {
    Short,
    Basename,
    Alias,
}

const KEY_ORDER: [MatchKey; 3] = [MatchKey::Short, MatchKey::Basename, MatchKey::Alias];

/// Candidates for every descriptor in a snapshot, in path order.
pub fn candidates_from_snapshot(repo_name: &str, snapshot: &RepoSnapshot) -> Vec<SkillPathCandidate> {
    snapshot
        .entries
        .values()
        .map(|entry| {
            let content = match &entry.outcome {
                EntryOutcome::Content { text, .. } => Some(text.as_str()),
                _ => None,
            };
            SkillPathCandidate::new(repo_name, &entry.skill_path, content)
        })
        .collect()
}

/// The short part of a stored skill name (`owner/repo:short` -> `short`).
pub fn skill_identifier(skill_name: &str) -> &str {
    skill_name.split_once(':').map(|(_, short)| short).unwrap_or(skill_name)
}

fn unique_match<'a>(candidates: &'a [SkillPathCandidate], key: MatchKey, token: &str) -> Option<&'a str> {
    if token.is_empty() {
        return None;
    }
    let mut matches = candidates.iter().filter(|c| c.key(key) == token);
    let first = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    Some(first.skill_path.as_str())
}

/// Pick the path a skill identifier refers to, or `None` when it is ambiguous.
///
/// The identifier is tried as-is and then without a trailing `-N`, each against
/// short name, directory name and path alias in that order. Only a single
/// match counts. Identifiers ending in `-root`, or empty ones, fall back to the
/// root candidate.
pub fn select_skill_path<'a>(identifier: &str, candidates: &'a [SkillPathCandidate]) -> Option<&'a str> {
    match candidates {
        [] => return None,
        [only] => return Some(only.skill_path.as_str()),
        _ => {}
    }

    let full = normalize_token(identifier);
    let stripped = normalize_token(&NUMERIC_SUFFIX.replace(identifier, ""));

    for token in [&full, &stripped] {
        for key in KEY_ORDER {
            if let Some(path) = unique_match(candidates, key, token) {
                return Some(path);
            }
        }
    }

    if identifier.ends_with("-root") || full.is_empty() {
        let mut roots = candidates.iter().filter(|c| c.is_root);
        if let (Some(root), None) = (roots.next(), roots.next()) {
            return Some(root.skill_path.as_str());
        }
    }
    None
}
