//! Prompt text for every enrichment request
//!
//! Generated Chinese fields use Chinese instructions, English fields English
//! ones; the model follows the instruction language noticeably better.

use crate::config::CATEGORY_TAG_HINTS;
use crate::lang::{
    DESCRIPTION_EN_MAX_WORDS, DESCRIPTION_ZH_MAX_CHARS, MAX_TAGS, TAGLINE_EN_MAX_WORDS, TAGLINE_ZH_MAX_CHARS,
};

fn or_none_zh(text: &str) -> &str {
    if text.trim().is_empty() { "（无）" } else { text }
}

fn or_none_en(text: &str) -> &str {
    if text.trim().is_empty() { "(none)" } else { text }
}

pub fn tag_category(skill_name: &str, description: &str, excerpt: &str) -> String {
    let categories = CATEGORY_TAG_HINTS
        .iter()
        .map(|(name, hints)| format!("- {}（标签参考: {}）", name, hints))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "请分析以下 Skill 内容，只输出 JSON，不要输出任何多余文本或Markdown标记。\n\n\
         JSON 规则：\n\
         1. tags 最多 {max_tags} 个，必须是 JSON 数组\n\
         2. category 必须从下面列表中选择，只输出分类名称（不要带括号内容）\n\n\
         分类列表（括号内容是标签参考，可用于 tags，但不要放进 category）：\n\
         {categories}\n\n\
         Skill ID: {skill_name}\n\
         description: {description}\n\n\
         SKILL.md 内容:\n{excerpt}\n\n\
         JSON 输出字段：\n\
         {{\n  \"tags\": [\"标签1\", \"标签2\"],\n  \"category\": \"信息获取与检索\"\n}}\n",
        max_tags = MAX_TAGS,
        description = or_none_zh(description),
    )
}

/// Tag translation keeps item count and order; use cases ride along when present.
pub fn list_translation(tags: &[String], use_cases: &[String]) -> String {
    format!(
        "Translate the following Chinese content to English.\n\
         Rules:\n\
         - Keep the number of items and order.\n\
         - Do not add or remove items.\n\
         - If an input list is empty, output an empty list.\n\
         - Output JSON only, no extra text.\n\n\
         tags: {}\n\
         use_cases: {}\n\n\
         Output JSON format: {{\"tags_en\":[\"...\"],\"use_case_en\":[\"...\"]}}",
        serde_json::Value::from(tags.to_vec()),
        serde_json::Value::from(use_cases.to_vec()),
    )
}

pub fn tagline(skill_name: &str, description: &str, excerpt: &str) -> String {
    format!(
        "请基于以下信息生成一句话双语标语，仅输出这一行文本。\n\
         输出格式必须为：中文一句话描述/English tagline\n\
         要求：\n\
         - 必须只输出一行，不要 JSON/列表/多行\n\
         - 中文必须是中文，且不超过 {zh} 个字\n\
         - 英文必须是英文，且不超过 {en} 个词\n\
         - 使用“/”作为唯一分隔符，不要带额外空格\n\n\
         正确示例：\n自动汇总日志并告警/Auto-summarize logs and alert\n\n\
         Skill ID: {skill_name}\n\
         description: {description}\n\n\
         SKILL.md 内容:\n{excerpt}\n",
        zh = TAGLINE_ZH_MAX_CHARS,
        en = TAGLINE_EN_MAX_WORDS,
        description = or_none_zh(description),
    )
}

pub fn tagline_zh(skill_name: &str, description: &str, excerpt: &str) -> String {
    format!(
        "请基于以下信息生成一句中文标语，仅输出中文一句话。\n\
         要求：\n\
         - 不超过 {zh} 个字\n\
         - 只输出中文一句话，不要任何说明\n\n\
         Skill ID: {skill_name}\n\
         description: {description}\n\n\
         SKILL.md 内容:\n{excerpt}\n",
        zh = TAGLINE_ZH_MAX_CHARS,
        description = or_none_zh(description),
    )
}

pub fn tagline_en(skill_name: &str, description: &str, excerpt: &str) -> String {
    format!(
        "Generate one concise English tagline based on the info below.\n\
         Requirements:\n\
         - English only\n\
         - No more than {en} words\n\
         - Output only one line, no extra text\n\n\
         Skill ID: {skill_name}\n\
         description: {description}\n\n\
         SKILL.md:\n{excerpt}\n",
        en = TAGLINE_EN_MAX_WORDS,
        description = or_none_en(description),
    )
}

pub fn tagline_en_from_zh(tagline_zh: &str) -> String {
    format!(
        "Translate the following Chinese tagline into concise English.\n\
         Requirements:\n\
         - English only\n\
         - No more than {TAGLINE_EN_MAX_WORDS} words\n\
         - Output only one line, no extra text\n\n\
         中文标语:\n{tagline_zh}\n"
    )
}

pub fn tagline_zh_from_en(tagline_en: &str) -> String {
    format!(
        "将以下英文标语翻译为中文一句话。\n\
         要求：\n\
         - 不超过 {TAGLINE_ZH_MAX_CHARS} 个字\n\
         - 只输出中文一句话，不要任何说明\n\n\
         英文标语:\n{tagline_en}\n"
    )
}

pub fn description_zh(excerpt: &str) -> String {
    format!(
        "请基于以下 SKILL.md 内容生成一句中文简介。\n\
         要求：\n\
         - 只输出中文一句话\n\
         - 必须包含中文字符\n\
         - 不超过{DESCRIPTION_ZH_MAX_CHARS}字\n\
         - 不要输出列表、JSON、Markdown或解释\n\
         正确示例：用于将日志自动归纳并生成摘要的技能。\n\n\
         SKILL.md:\n{excerpt}"
    )
}

pub fn description_en(excerpt: &str) -> String {
    format!(
        "Generate one concise English description based on the SKILL.md content.\n\
         Requirements:\n\
         - English only, no Chinese\n\
         - <= {DESCRIPTION_EN_MAX_WORDS} words\n\
         - Output a single sentence, plain text only\n\
         Example: A skill that summarizes logs and highlights key issues.\n\n\
         SKILL.md:\n{excerpt}"
    )
}

pub fn description_to_zh(text: &str) -> String {
    format!(
        "把下面内容翻译成中文。\n\
         要求：\n\
         - 只输出中文一句话\n\
         - 必须包含中文字符\n\
         - 不超过{DESCRIPTION_ZH_MAX_CHARS}字\n\
         - 不要输出列表、JSON、Markdown或解释\n\n\
         Text:\n{text}"
    )
}

pub fn description_to_en(text: &str) -> String {
    format!(
        "Translate the following text to English.\n\
         Requirements:\n\
         - English only, no Chinese\n\
         - <= {DESCRIPTION_EN_MAX_WORDS} words\n\
         - Output a single sentence, plain text only\n\n\
         Text:\n{text}"
    )
}

pub fn use_case(excerpt: &str) -> String {
    format!(
        "请基于以下 SKILL.md 内容输出 1-3 条使用场景，使用中文。\n\
         要求：\n\
         - 每条使用场景格式示例：在...情况下，用...实现...\n\
         - 仅使用“；”分隔多条，不要编号\n\
         - 只输出中文文本，不要 Markdown/JSON/解释\n\
         正确示例：在需要批量清洗数据时，用该技能自动化处理；在生成报告时，用该技能汇总要点\n\n\
         SKILL.md:\n{excerpt}"
    )
}

pub fn use_case_to_en(text: &str) -> String {
    format!(
        "Translate the following Chinese use cases to English.\n\
         Requirements:\n\
         - Keep the number and order of items\n\
         - Use '；' as separator (no numbering)\n\
         - Output plain text only, no extra text\n\n\
         Use cases:\n{text}"
    )
}

pub fn use_case_to_zh(text: &str) -> String {
    format!(
        "将下面英文使用场景翻译成中文。\n\
         要求：\n\
         - 保持条目数量和顺序\n\
         - 使用“；”分隔（不要编号）\n\
         - 只输出中文文本，不要解释\n\n\
         Use cases:\n{text}"
    )
}

pub fn skill_md_translation(chunk: &str) -> String {
    format!(
        "Translate the following SKILL.md chunk into Chinese. \
         Preserve YAML frontmatter, code blocks, links, and commands. \
         Output only the translated chunk, no extra text.\n\n{chunk}"
    )
}
