//! Text rules for generated fields
//!
//! Everything that decides whether a model answer is usable lives here: script
//! checks, length clamps, tagline shape, category matching, tag and use-case
//! list handling. All functions are pure.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{CATEGORY_TAG_HINTS, DEFAULT_CATEGORY};

pub const TAGLINE_ZH_MAX_CHARS: usize = 25;
pub const TAGLINE_EN_MAX_WORDS: usize = 16;
pub const DESCRIPTION_ZH_MAX_CHARS: usize = 150;
pub const DESCRIPTION_EN_MAX_WORDS: usize = 100;
pub const MAX_TAGS: usize = 5;
pub const USE_CASE_SEPARATOR: &str = "；";

static HAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[一-鿿]").unwrap());
static LATIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z]").unwrap());
static TAG_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,\n;/|，；、]+").unwrap());
static USE_CASE_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[；;\n]+").unwrap());
static SLASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*/\s*").unwrap());
static OPEN_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```(?:json|text|markdown|md)?").unwrap());

pub fn contains_han(text: &str) -> bool {
    HAN.is_match(text)
}

pub fn contains_latin(text: &str) -> bool {
    LATIN.is_match(text)
}

/// Strip a surrounding code fence from a model answer.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let inner = OPEN_FENCE.replace(trimmed, "");
    let inner = inner.trim();
    inner.strip_suffix("```").unwrap_or(inner).trim().to_string()
}

/// Collapse a model answer onto one line.
pub fn single_line(text: &str) -> String {
    strip_code_fence(text)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// One-line Chinese text, or `None` when the answer has no Han characters.
pub fn enforce_zh(text: &str) -> Option<String> {
    let cleaned = single_line(text);
    contains_han(&cleaned).then_some(cleaned)
}

/// One-line English text: must have Latin letters and no Han characters.
pub fn enforce_en(text: &str) -> Option<String> {
    let cleaned = single_line(text);
    (!contains_han(&cleaned) && contains_latin(&cleaned)).then_some(cleaned)
}

pub fn clamp_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        text.trim().to_string()
    } else {
        words[..max_words].join(" ")
    }
}

pub fn clamp_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect::<String>().trim().to_string()
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Normalise a `中文/English` tagline, clamping each half.
///
/// Returns `None` if either half is missing or in the wrong script.
pub fn normalize_tagline(text: &str) -> Option<String> {
    let line = single_line(text);
    let line = SLASH.replace_all(&line, "/");
    let (zh, en) = line.split_once('/')?;
    compose_tagline(zh, en)
}

/// Join two halves into a tagline, applying the same rules as [`normalize_tagline`].
pub fn compose_tagline(zh: &str, en: &str) -> Option<String> {
    let zh = clamp_chars(zh.trim(), TAGLINE_ZH_MAX_CHARS);
    let en = clamp_words(en.trim(), TAGLINE_EN_MAX_WORDS);
    if zh.is_empty() || en.is_empty() {
        return None;
    }
    if !contains_han(&zh) || contains_han(&en) || !contains_latin(&en) {
        return None;
    }
    Some(format!("{}/{}", zh, en))
}

/// Map free text onto one of the known category names.
///
/// Parenthetical hints are dropped first, then an exact match is tried, then
/// containment in either direction.
pub fn normalize_category(value: &str) -> Option<&'static str> {
    let mut text = value.trim();
    if let Some((head, _)) = text.split_once('（') {
        text = head.trim();
    }
    if let Some((head, _)) = text.split_once(" (") {
        text = head.trim();
    }
    if text.is_empty() {
        return None;
    }
    let names = CATEGORY_TAG_HINTS.iter().map(|(name, _)| *name);
    if let Some(exact) = names.clone().find(|name| *name == text) {
        return Some(exact);
    }
    names.into_iter().find(|name| name.contains(text) || text.contains(name))
}

/// First recognisable category in a JSON value (string or array), else the fallback.
pub fn sanitize_category(value: &serde_json::Value) -> &'static str {
    coerce_list(value)
        .iter()
        .find_map(|item| normalize_category(item))
        .unwrap_or(DEFAULT_CATEGORY)
}

/// Turn a JSON value into a list of strings, splitting plain strings on list separators.
pub fn coerce_list(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        serde_json::Value::String(s) => split_tags(s),
        other => vec![other.to_string()],
    }
}

pub fn split_tags(text: &str) -> Vec<String> {
    TAG_SPLIT
        .split(text.trim())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// De-duplicated tags, first `MAX_TAGS` kept in order.
pub fn sanitize_tags(value: &serde_json::Value) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in coerce_list(value) {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags.truncate(MAX_TAGS);
    tags
}

/// Parse a stored tag column: JSON array, or a separator-delimited string.
pub fn parse_stored_tags(value: &str) -> Vec<String> {
    match serde_json::from_str::<serde_json::Value>(value.trim()) {
        Ok(parsed @ serde_json::Value::Array(_)) => coerce_list(&parsed),
        _ => split_tags(value),
    }
}

pub fn split_use_cases(text: &str) -> Vec<String> {
    USE_CASE_SPLIT
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub fn join_use_cases(items: &[String]) -> String {
    items.join(USE_CASE_SEPARATOR)
}

/// The outermost `{...}` object in a model answer, fences removed.
pub fn extract_json_payload(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

pub fn parse_json_object(text: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let payload = extract_json_payload(text)?;
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Truncate to `max_chars` characters with a marker, for prompt excerpts.
pub fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}\n...[truncated]", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_script_checks() {
        assert!(contains_han("自动化工具"));
        assert!(!contains_han("automation"));
        assert!(contains_latin("CLI 工具"));
        assert_eq!(enforce_zh("Only English"), None);
        assert_eq!(enforce_en("混合 mixed"), None);
        assert_eq!(enforce_en("```text\nSummarize logs\n```"), Some("Summarize logs".to_string()));
    }

    #[test]
    fn test_normalize_tagline_spacing_and_clamp() {
        let long_en = "one two three four five six seven eight nine ten eleven twelve thirteen fourteen fifteen sixteen seventeen";
        let raw = format!("自动汇总日志并告警 / {}", long_en);
        let tagline = normalize_tagline(&raw).unwrap();
        let (zh, en) = tagline.split_once('/').unwrap();
        assert_eq!(zh, "自动汇总日志并告警");
        assert_eq!(word_count(en), TAGLINE_EN_MAX_WORDS);
    }

    #[test]
    fn test_normalize_tagline_rejects_wrong_script() {
        assert_eq!(normalize_tagline("Summarize logs/Auto-summarize logs"), None);
        assert_eq!(normalize_tagline("汇总日志/汇总日志"), None);
        assert_eq!(normalize_tagline("no separator here"), None);
        assert_eq!(normalize_tagline("汇总日志/"), None);
    }

    #[test]
    fn test_tagline_zh_clamped_to_limit() {
        let zh: String = std::iter::repeat('字').take(40).collect();
        let tagline = compose_tagline(&zh, "Long Chinese half").unwrap();
        let (zh_out, _) = tagline.split_once('/').unwrap();
        assert_eq!(zh_out.chars().count(), TAGLINE_ZH_MAX_CHARS);
    }

    #[test]
    fn test_normalize_category() {
        assert_eq!(normalize_category("代码与工程化"), Some("代码与工程化"));
        assert_eq!(normalize_category("代码与工程化（重构、测试）"), Some("代码与工程化"));
        assert_eq!(normalize_category("监控与运维 (alerts)"), Some("监控与运维"));
        assert_eq!(normalize_category("安全"), Some("安全与合规"));
        assert_eq!(normalize_category("cooking"), None);
        assert_eq!(sanitize_category(&json!(["cooking", "数据处理与分析"])), "数据处理与分析");
        assert_eq!(sanitize_category(&json!("cooking")), DEFAULT_CATEGORY);
    }

    #[test]
    fn test_sanitize_tags_dedup_and_cap() {
        let tags = sanitize_tags(&json!(["a", "b", "a", "c", "d", "e", "f"]));
        assert_eq!(tags, vec!["a", "b", "c", "d", "e"]);
        let tags = sanitize_tags(&json!("搜索，爬虫、RAG/search"));
        assert_eq!(tags, vec!["搜索", "爬虫", "RAG", "search"]);
    }

    #[test]
    fn test_parse_stored_tags() {
        assert_eq!(parse_stored_tags(r#"["x","y"]"#), vec!["x", "y"]);
        assert_eq!(parse_stored_tags("x, y"), vec!["x", "y"]);
        assert!(parse_stored_tags("").is_empty());
    }

    #[test]
    fn test_use_case_split_join() {
        let items = split_use_cases("在A时，用B；在C时，用D;\n在E时");
        assert_eq!(items.len(), 3);
        assert_eq!(join_use_cases(&items[..2]), "在A时，用B；在C时，用D");
    }

    #[test]
    fn test_extract_json_payload() {
        let answer = "```json\n{\"tags\": [\"a\"], \"category\": \"其他\"}\n```";
        let map = parse_json_object(answer).unwrap();
        assert_eq!(map["category"], json!("其他"));
        assert_eq!(extract_json_payload("no json"), None);
        assert_eq!(extract_json_payload("} backwards {"), None);
    }

    #[test]
    fn test_clamp_words_keeps_short_text() {
        assert_eq!(clamp_words("  two words ", 5), "two words");
        assert_eq!(clamp_words("a b c d", 2), "a b");
    }

    #[test]
    fn test_truncate_for_prompt() {
        assert_eq!(truncate_for_prompt("short", 10), "short");
        assert_eq!(truncate_for_prompt("abcdef", 3), "abc\n...[truncated]");
    }
}
