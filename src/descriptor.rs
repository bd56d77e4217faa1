//! SKILL.md helpers: front matter, chunking, hashing, and the derived
//! per-skill strings (file tree, download link, install steps).

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

const DEFAULT_BRANCH: &str = "main";

/// Content hash stored in `skill_md_sha` (lowercase hex SHA-256).
pub fn content_hash(content: &str) -> String {
    content_hash_bytes(content.as_bytes())
}

/// Hash of the file as read, before any lossy decoding.
pub fn content_hash_bytes(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

fn front_matter_end(lines: &[&str]) -> Option<usize> {
    let delimiter = lines.first()?.trim();
    if delimiter != "---" && delimiter != "+++" {
        return None;
    }
    lines
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, line)| line.trim() == delimiter)
        .map(|(idx, _)| idx)
}

/// Parse simple `key: value` front matter. Returns the fields and the body.
///
/// Only a block opened on the first line by `---` or `+++` and closed by the
/// same delimiter counts; otherwise the whole text is the body.
pub fn parse_front_matter(content: &str) -> (BTreeMap<String, String>, String) {
    let lines: Vec<&str> = content.lines().collect();
    let Some(end) = front_matter_end(&lines) else {
        return (BTreeMap::new(), content.to_string());
    };

    let mut fields = BTreeMap::new();
    for line in &lines[1..end] {
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
            fields.insert(key.trim().to_string(), value.to_string());
        }
    }
    (fields, lines[end + 1..].join("\n"))
}

/// The `name` declared in front matter, if any.
pub fn front_matter_name(content: &str) -> Option<String> {
    let (fields, _) = parse_front_matter(content);
    fields
        .get("name")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Split markdown into chunks of at most `max_chars` characters on line boundaries.
///
/// A chunk never ends inside a fenced code block or inside the front matter, so
/// a single chunk can exceed `max_chars` when one of those is longer than that.
pub fn split_markdown_chunks(content: &str, max_chars: usize) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let stripped: Vec<&str> = lines.iter().map(|l| l.trim_end_matches(['\n', '\r'])).collect();
    let fm_end = front_matter_end(&stripped);

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    let mut fence: Option<&str> = None;

    for (idx, line) in lines.iter().enumerate() {
        // Split decision uses the fence state before this line, so a closing
        // fence stays with its block and an opening fence may start a chunk.
        let line_len = line.chars().count();
        let in_front_matter = fm_end.is_some_and(|end| idx <= end);
        if !current.is_empty()
            && fence.is_none()
            && !in_front_matter
            && current_len + line_len > max_chars
        {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(line);
        current_len += line_len;

        let trimmed = line.trim();
        for marker in ["```", "~~~"] {
            if trimmed.starts_with(marker) {
                match fence {
                    Some(open) if open == marker => fence = None,
                    None => fence = Some(marker),
                    _ => {}
                }
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Parent directory of a repo-relative file path ("" for the root).
pub fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Last path segment ("" for the root).
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Sorted, de-duplicated file list relative to `skill_path`, one per line.
pub fn build_file_tree(file_paths: &[String], skill_path: &str) -> String {
    let prefix = skill_path.trim_matches('/');
    let prefix = if prefix.is_empty() { String::new() } else { format!("{}/", prefix) };

    let entries: BTreeSet<&str> = file_paths
        .iter()
        .filter_map(|path| path.strip_prefix(prefix.as_str()))
        .filter(|rel| !rel.is_empty())
        .collect();
    entries.into_iter().collect::<Vec<_>>().join("\n")
}

fn percent_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Zip archive for a root skill, directory-download link for nested ones.
pub fn build_download_url(repo_url: &str, branch: Option<&str>, skill_path: &str) -> String {
    let branch = branch.filter(|b| !b.is_empty()).unwrap_or(DEFAULT_BRANCH);
    let repo_url = repo_url.trim_end_matches('/');
    if skill_path.is_empty() {
        return format!("{}/archive/refs/heads/{}.zip", repo_url, branch);
    }
    let target = format!("{}/tree/{}/{}", repo_url, branch, skill_path);
    format!("https://download-directory.github.io/?url={}", percent_encode(&target))
}

pub fn build_install_instructions(repo_url: &str, skill_path: &str, download_url: &str) -> String {
    let skill_url = if skill_path.is_empty() {
        repo_url.to_string()
    } else {
        format!("{}/{}", repo_url.trim_end_matches('/'), skill_path)
    };
    [
        "Claude Code:".to_string(),
        format!("1. 下载并解压: {}", download_url),
        "2. 将 skill 目录放入 ~/.claude/skills/ (或 Claude Code 配置的 skills 目录)".to_string(),
        "3. 重新打开 Claude Code，确认 skill 已生效".to_string(),
        String::new(),
        "Codex CLI:".to_string(),
        format!("1. 运行: skill-installer {}", skill_url),
        "2. 或将 skill 目录复制到 ~/.codex/skills/ 后重启 CLI".to_string(),
    ]
    .join("\n")
}
