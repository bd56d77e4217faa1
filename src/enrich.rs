//! Staged enrichment of stored skills
//!
//! Each stage looks at one group of fields, skips when they are already set,
//! and sends its own envelope to the enrichment writer as soon as it succeeds.
//! A failed stage leaves its fields unset for the next repair pass.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db::SkillRow;
use crate::descriptor::split_markdown_chunks;
use crate::error::{SyncError, SyncResult};
use crate::lang::{
    clamp_chars, clamp_words, coerce_list, compose_tagline, contains_han, contains_latin, enforce_en, enforce_zh,
    join_use_cases, normalize_tagline, parse_json_object, parse_stored_tags, sanitize_category, sanitize_tags,
    split_use_cases, strip_code_fence, truncate_for_prompt, DESCRIPTION_EN_MAX_WORDS,
    DESCRIPTION_ZH_MAX_CHARS, TAGLINE_EN_MAX_WORDS, TAGLINE_ZH_MAX_CHARS,
};
use crate::llm::TextGenerator;
use crate::progress::{truncate_str, Outcome, StageCounts, StageProgress};
use crate::prompts;
use crate::writer::{SkillField, SkillUpdate, WriterSender};

pub const SKILL_MD_TOO_LARGE_NOTICE: &str = "本skill内容体过大，请阅读原文";
pub const DESC_EN_TOO_LARGE: &str = "This skill.md too large, please read SKILL.md.";
pub const DESC_ZH_TOO_LARGE: &str = "本SKILL.md过大分析失败，请自行阅读SKILL.md了解详情";
pub const USE_CASE_ZH_TOO_LARGE: &str = "本SKILL.md过大分析失败，请自行阅读SKILL.md了解使用场景";
pub const USE_CASE_EN_TOO_LARGE: &str = "SKILL.md too large to analyze; please read it for use cases.";

const PLACEHOLDERS: [&str; 5] = [
    SKILL_MD_TOO_LARGE_NOTICE,
    DESC_EN_TOO_LARGE,
    DESC_ZH_TOO_LARGE,
    USE_CASE_ZH_TOO_LARGE,
    USE_CASE_EN_TOO_LARGE,
];

/// Tries per generation prompt before a field is given up
const GENERATION_ATTEMPTS: usize = 2;

pub fn is_placeholder(text: &str) -> bool {
    PLACEHOLDERS.contains(&text.trim())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Classification,
    TagTranslation,
    Tagline,
    Descriptions,
    UseCases,
    Translation,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Classification,
        Stage::TagTranslation,
        Stage::Tagline,
        Stage::Descriptions,
        Stage::UseCases,
        Stage::Translation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Classification => "classification",
            Stage::TagTranslation => "tag_translation",
            Stage::Tagline => "tagline",
            Stage::Descriptions => "descriptions",
            Stage::UseCases => "use_cases",
            Stage::Translation => "translation",
        }
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Working copy of the fields enrichment reads and fills in.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentTask {
    pub id: i64,
    pub skill_name: String,
    pub content: String,
    pub tagline: Option<String>,
    pub tags: Vec<String>,
    pub tags_en: Vec<String>,
    pub category: Option<String>,
    pub description_en: Option<String>,
    pub description_zh: Option<String>,
    pub use_case: Option<String>,
    pub use_case_en: Option<String>,
    pub translation: Option<String>,
}

impl EnrichmentTask {
    /// Stored values, with descriptions in the wrong script treated as missing.
    pub fn from_row(row: SkillRow) -> Self {
        let description_en = present(row.description_en).filter(|d| !contains_han(d));
        let description_zh = present(row.description_zh).filter(|d| contains_han(d));
        Self {
            id: row.id,
            skill_name: row.skill_name,
            content: row.skill_md_content.unwrap_or_default(),
            tagline: present(row.tagline),
            tags: row.tags.as_deref().map(parse_stored_tags).unwrap_or_default(),
            tags_en: row.tags_en.as_deref().map(parse_stored_tags).unwrap_or_default(),
            category: present(row.categories),
            description_en,
            description_zh,
            use_case: present(row.use_case),
            use_case_en: present(row.use_case_en),
            translation: present(row.skill_md_content_translation),
        }
    }

    /// Content changed: every field is derived again.
    pub fn fresh(id: i64, skill_name: &str, content: &str) -> Self {
        Self {
            id,
            skill_name: skill_name.to_string(),
            content: content.to_string(),
            ..Self::default()
        }
    }

    /// Existing description to steer generation: Chinese first.
    fn description_for_prompt(&self) -> String {
        self.description_zh
            .iter()
            .chain(self.description_en.iter())
            .find(|d| !is_placeholder(d))
            .cloned()
            .unwrap_or_default()
    }
}

/// A field needs work when it is missing, or holds a placeholder that the
/// content no longer warrants.
fn needs(value: &Option<String>, analyzable: bool) -> bool {
    match value {
        None => true,
        Some(v) => is_placeholder(v) && analyzable,
    }
}

fn unusable(what: &str, raw: &str) -> SyncError {
    SyncError::Fatal(format!("unusable {} output: {}", what, truncate_str(&raw.replace('\n', "\\n"), 120)))
}

#[derive(Debug, Clone)]
pub struct EnrichOptions {
    pub analysis_max_chars: usize,
    /// Content above this many bytes is not analyzed
    pub skill_md_max_bytes: u64,
    pub translation_max_chars: usize,
    pub translation_chunk_chars: usize,
    pub task_timeout: Duration,
}

impl EnrichOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            analysis_max_chars: config.analysis_max_chars,
            skill_md_max_bytes: config.skill_md_max_bytes,
            translation_max_chars: config.translation_max_chars,
            translation_chunk_chars: config.translation_chunk_chars,
            task_timeout: config.enrich_task_timeout,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichReport {
    pub written: Vec<Stage>,
    pub failed: Vec<Stage>,
}

impl EnrichReport {
    pub fn outcome(&self) -> Outcome {
        if !self.failed.is_empty() {
            Outcome::Failed
        } else if self.written.is_empty() {
            Outcome::Skipped
        } else {
            Outcome::Completed
        }
    }
}

/// Per-task view of the content
struct Excerpt {
    analyzable: bool,
    text: String,
}

#[derive(Clone)]
pub struct Enricher {
    llm: Arc<dyn TextGenerator>,
    writer: WriterSender,
    options: EnrichOptions,
}

impl Enricher {
    pub fn new(llm: Arc<dyn TextGenerator>, writer: WriterSender, options: EnrichOptions) -> Self {
        Self { llm, writer, options }
    }

    fn excerpt(&self, content: &str) -> Excerpt {
        let analyzable = !content.trim().is_empty() && content.len() as u64 <= self.options.skill_md_max_bytes;
        let text = if analyzable {
            truncate_for_prompt(content, self.options.analysis_max_chars)
        } else {
            String::new()
        };
        Excerpt { analyzable, text }
    }

    /// Run every stage in order. Only a closed writer aborts the task.
    pub async fn enrich(&self, mut task: EnrichmentTask) -> SyncResult<EnrichReport> {
        let excerpt = self.excerpt(&task.content);
        let mut report = EnrichReport::default();

        for stage in Stage::ALL {
            let result = match stage {
                Stage::Classification => self.classify(&mut task, &excerpt).await,
                Stage::TagTranslation => self.translate_tags(&mut task).await,
                Stage::Tagline => self.tagline(&mut task, &excerpt).await,
                Stage::Descriptions => self.descriptions(&mut task, &excerpt).await,
                Stage::UseCases => self.use_cases(&mut task, &excerpt).await,
                Stage::Translation => self.translation(&mut task).await,
            };
            match result {
                Ok(Some(update)) if !update.is_empty() => {
                    self.writer.send(update)?;
                    report.written.push(stage);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        skill_id = task.id,
                        stage = stage.name(),
                        kind = e.kind(),
                        error = %e,
                        "enrichment stage failed"
                    );
                    report.failed.push(stage);
                }
            }
        }
        Ok(report)
    }

    /// [`enrich`](Self::enrich) under the per-task deadline. On expiry the task
    /// is dropped; envelopes it already queued stay queued.
    pub async fn enrich_with_deadline(&self, task: EnrichmentTask) -> SyncResult<EnrichReport> {
        let id = task.id;
        match tokio::time::timeout(self.options.task_timeout, self.enrich(task)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(format!(
                "enrichment of skill {} exceeded {:?}",
                id, self.options.task_timeout
            ))),
        }
    }

    /// First answer out of `GENERATION_ATTEMPTS` that passes `check`.
    async fn generate_checked(
        &self,
        prompt: &str,
        what: &str,
        check: impl Fn(&str) -> Option<String>,
    ) -> SyncResult<Option<String>> {
        for attempt in 1..=GENERATION_ATTEMPTS {
            let raw = self.llm.generate(prompt).await?;
            if let Some(value) = check(&raw) {
                return Ok(Some(value));
            }
            tracing::debug!(field = what, attempt, output = %truncate_str(&raw, 120), "discarded generation");
        }
        Ok(None)
    }

    async fn classify(&self, task: &mut EnrichmentTask, excerpt: &Excerpt) -> SyncResult<Option<SkillUpdate>> {
        if !task.tags.is_empty() && task.category.is_some() {
            return Ok(None);
        }
        let description = task.description_for_prompt();
        if excerpt.text.is_empty() && description.is_empty() {
            return Ok(None);
        }

        let raw = self
            .llm
            .generate(&prompts::tag_category(&task.skill_name, &description, &excerpt.text))
            .await?;
        let parsed = parse_json_object(&raw).ok_or_else(|| unusable("classification", &raw))?;
        let null = serde_json::Value::Null;

        let mut update = SkillUpdate::new(task.id);
        if task.tags.is_empty() {
            let tags = sanitize_tags(parsed.get("tags").unwrap_or(&null));
            if !tags.is_empty() {
                update = update.text(SkillField::Tags, serde_json::Value::from(tags.clone()).to_string());
                task.tags = tags;
            }
        }
        if task.category.is_none() {
            let category = sanitize_category(parsed.get("category").or_else(|| parsed.get("categories")).unwrap_or(&null));
            update = update.text(SkillField::Categories, category);
            task.category = Some(category.to_string());
        }
        Ok(Some(update))
    }

    async fn translate_tags(&self, task: &mut EnrichmentTask) -> SyncResult<Option<SkillUpdate>> {
        if task.tags.is_empty() || !task.tags_en.is_empty() {
            return Ok(None);
        }
        let raw = self.llm.generate(&prompts::list_translation(&task.tags, &[])).await?;
        let parsed = parse_json_object(&raw).ok_or_else(|| unusable("tag translation", &raw))?;
        let tags_en = parsed.get("tags_en").map(coerce_list).unwrap_or_default();
        if tags_en.len() != task.tags.len() || tags_en.iter().any(|t| contains_han(t)) {
            return Err(unusable("tag translation", &raw));
        }
        let update = SkillUpdate::new(task.id).text(SkillField::TagsEn, serde_json::Value::from(tags_en.clone()).to_string());
        task.tags_en = tags_en;
        Ok(Some(update))
    }

    async fn tagline(&self, task: &mut EnrichmentTask, excerpt: &Excerpt) -> SyncResult<Option<SkillUpdate>> {
        if task.tagline.is_some() {
            return Ok(None);
        }
        let description = task.description_for_prompt();
        if description.is_empty() && excerpt.text.is_empty() {
            return Ok(None);
        }
        // With a description at hand the body excerpt is left out of the prompt
        let context = if description.is_empty() { excerpt.text.as_str() } else { "" };

        let combined = self
            .generate_checked(&prompts::tagline(&task.skill_name, &description, context), "tagline", normalize_tagline)
            .await?;
        let tagline = match combined {
            Some(t) => Some(t),
            None => self.tagline_by_halves(task, &description, &excerpt.text).await?,
        };

        match tagline {
            Some(tagline) => {
                task.tagline = Some(tagline.clone());
                Ok(Some(SkillUpdate::new(task.id).text(SkillField::Tagline, tagline)))
            }
            None => Err(unusable("tagline", "no valid zh/en pair")),
        }
    }

    /// Fallback: one language first (the description's), then translate it.
    async fn tagline_by_halves(
        &self,
        task: &EnrichmentTask,
        description: &str,
        excerpt: &str,
    ) -> SyncResult<Option<String>> {
        let english_first = !description.is_empty() && !contains_han(description) && contains_latin(description);

        let (zh, en) = if english_first {
            let raw = self.llm.generate(&prompts::tagline_en(&task.skill_name, description, excerpt)).await?;
            let Some(en) = enforce_en(&raw).map(|t| clamp_words(&t, TAGLINE_EN_MAX_WORDS)) else {
                return Ok(None);
            };
            let raw = self.llm.generate(&prompts::tagline_zh_from_en(&en)).await?;
            (enforce_zh(&raw).map(|t| clamp_chars(&t, TAGLINE_ZH_MAX_CHARS)), Some(en))
        } else {
            let raw = self.llm.generate(&prompts::tagline_zh(&task.skill_name, description, excerpt)).await?;
            let Some(zh) = enforce_zh(&raw).map(|t| clamp_chars(&t, TAGLINE_ZH_MAX_CHARS)) else {
                return Ok(None);
            };
            let raw = self.llm.generate(&prompts::tagline_en_from_zh(&zh)).await?;
            (Some(zh), enforce_en(&raw).map(|t| clamp_words(&t, TAGLINE_EN_MAX_WORDS)))
        };

        Ok(match (zh, en) {
            (Some(zh), Some(en)) => compose_tagline(&zh, &en),
            _ => None,
        })
    }

    async fn description_zh_from(&self, prompt: String) -> SyncResult<Option<String>> {
        self.generate_checked(&prompt, "description_zh", |raw| {
            enforce_zh(raw).map(|d| clamp_chars(&d, DESCRIPTION_ZH_MAX_CHARS))
        })
        .await
    }

    async fn description_en_from(&self, prompt: String) -> SyncResult<Option<String>> {
        self.generate_checked(&prompt, "description_en", |raw| {
            enforce_en(raw).map(|d| clamp_words(&d, DESCRIPTION_EN_MAX_WORDS))
        })
        .await
    }

    async fn descriptions(&self, task: &mut EnrichmentTask, excerpt: &Excerpt) -> SyncResult<Option<SkillUpdate>> {
        let need_en = needs(&task.description_en, excerpt.analyzable);
        let need_zh = needs(&task.description_zh, excerpt.analyzable);
        if !need_en && !need_zh {
            return Ok(None);
        }

        let (zh, en) = if need_en && need_zh {
            if !excerpt.analyzable {
                (Some(DESC_ZH_TOO_LARGE.to_string()), Some(DESC_EN_TOO_LARGE.to_string()))
            } else {
                let zh = self.description_zh_from(prompts::description_zh(&excerpt.text)).await?;
                let en = self.description_en_from(prompts::description_en(&excerpt.text)).await?;
                (zh, en)
            }
        } else if need_en {
            match task.description_zh.as_deref() {
                Some(source) if is_placeholder(source) => (None, Some(DESC_EN_TOO_LARGE.to_string())),
                Some(source) => (None, self.description_en_from(prompts::description_to_en(source)).await?),
                None => (None, None),
            }
        } else {
            match task.description_en.as_deref() {
                Some(source) if is_placeholder(source) => (Some(DESC_ZH_TOO_LARGE.to_string()), None),
                Some(source) => (self.description_zh_from(prompts::description_to_zh(source)).await?, None),
                None => (None, None),
            }
        };

        if zh.is_none() && en.is_none() {
            return Err(unusable("description", "no valid text after retries"));
        }
        let update = SkillUpdate::new(task.id)
            .maybe_text(SkillField::DescriptionZh, zh.clone())
            .maybe_text(SkillField::DescriptionEn, en.clone());
        if zh.is_some() {
            task.description_zh = zh;
        }
        if en.is_some() {
            task.description_en = en;
        }
        Ok(Some(update))
    }

    /// Translate a use-case list, keeping its item count.
    async fn translate_use_cases(&self, source: &str, to_english: bool) -> SyncResult<Option<String>> {
        let expected = split_use_cases(source).len();
        let (prompt, check): (String, fn(&str) -> Option<String>) = if to_english {
            (prompts::use_case_to_en(source), enforce_en)
        } else {
            (prompts::use_case_to_zh(source), enforce_zh)
        };
        let raw = self.llm.generate(&prompt).await?;
        let Some(text) = check(&raw) else { return Ok(None) };
        let items = split_use_cases(&text);
        if items.len() == expected || expected == 1 {
            Ok(Some(join_use_cases(&items)))
        } else {
            tracing::debug!(expected, got = items.len(), "use case translation changed item count");
            Ok(None)
        }
    }

    async fn use_cases(&self, task: &mut EnrichmentTask, excerpt: &Excerpt) -> SyncResult<Option<SkillUpdate>> {
        let need_zh = needs(&task.use_case, excerpt.analyzable);
        let need_en = needs(&task.use_case_en, excerpt.analyzable);
        if !need_zh && !need_en {
            return Ok(None);
        }

        let (zh, en) = if need_zh && need_en {
            if !excerpt.analyzable {
                (Some(USE_CASE_ZH_TOO_LARGE.to_string()), Some(USE_CASE_EN_TOO_LARGE.to_string()))
            } else {
                let raw = self.llm.generate(&prompts::use_case(&excerpt.text)).await?;
                match enforce_zh(&raw).map(|t| join_use_cases(&split_use_cases(&t))) {
                    Some(zh) => {
                        let en = self.translate_use_cases(&zh, true).await?;
                        (Some(zh), en)
                    }
                    None => (None, None),
                }
            }
        } else if need_en {
            match task.use_case.as_deref() {
                Some(source) if is_placeholder(source) => (None, Some(USE_CASE_EN_TOO_LARGE.to_string())),
                Some(source) => (None, self.translate_use_cases(source, true).await?),
                None => (None, None),
            }
        } else {
            match task.use_case_en.as_deref() {
                Some(source) if is_placeholder(source) => (Some(USE_CASE_ZH_TOO_LARGE.to_string()), None),
                Some(source) => (self.translate_use_cases(source, false).await?, None),
                None => (None, None),
            }
        };

        if zh.is_none() && en.is_none() {
            return Err(unusable("use case", "no valid text"));
        }
        let update = SkillUpdate::new(task.id)
            .maybe_text(SkillField::UseCase, zh.clone())
            .maybe_text(SkillField::UseCaseEn, en.clone());
        if zh.is_some() {
            task.use_case = zh;
        }
        if en.is_some() {
            task.use_case_en = en;
        }
        Ok(Some(update))
    }

    async fn translation(&self, task: &mut EnrichmentTask) -> SyncResult<Option<SkillUpdate>> {
        if task.content.trim().is_empty() {
            return Ok(None);
        }
        let too_large = task.content.chars().count() > self.options.translation_max_chars;
        let needed = match task.translation.as_deref() {
            None => true,
            Some(existing) => existing == SKILL_MD_TOO_LARGE_NOTICE && !too_large,
        };
        if !needed {
            return Ok(None);
        }

        let translated = if too_large {
            tracing::info!(skill_id = task.id, chars = task.content.chars().count(), "content too large to translate");
            SKILL_MD_TOO_LARGE_NOTICE.to_string()
        } else {
            let chunks = split_markdown_chunks(&task.content, self.options.translation_chunk_chars);
            let mut parts = Vec::with_capacity(chunks.len());
            for chunk in &chunks {
                let raw = self.llm.generate(&prompts::skill_md_translation(chunk)).await?;
                let part = strip_code_fence(&raw);
                if part.is_empty() {
                    return Err(unusable("translation chunk", &raw));
                }
                parts.push(part);
            }
            parts.join("\n\n")
        };

        task.translation = Some(translated.clone());
        Ok(Some(SkillUpdate::new(task.id).text(SkillField::Translation, translated)))
    }
}

/// Enrich `tasks` with at most `concurrency` in flight.
pub async fn run_enrichment(
    enricher: &Enricher,
    tasks: Vec<EnrichmentTask>,
    concurrency: usize,
    progress: &StageProgress,
) -> StageCounts {
    progress.add_total(tasks.len());
    stream::iter(tasks)
        .map(|task| async move {
            let label = format!("{} {}", task.id, task.skill_name);
            let outcome = match enricher.enrich_with_deadline(task).await {
                Ok(report) => report.outcome(),
                Err(e) => {
                    tracing::warn!(skill = %label, kind = e.kind(), error = %e, "enrichment abandoned");
                    Outcome::Failed
                }
            };
            progress.tick(outcome, &label);
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<()>>()
        .await;
    progress.counts()
}
