use anyhow::{Context, Result};
use chrono::NaiveDate;
use directories::ProjectDirs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Category names offered to the classifier, with the tag hints shown next to each.
/// The last entry is the fallback for anything that does not match.
pub const CATEGORY_TAG_HINTS: &[(&str, &str)] = &[
    ("信息获取与检索", "搜索、抓取、爬虫、文档解析、网页解析、数据库查询、知识库检索、RAG、问答、研究调查、事实核验"),
    ("规划与推理", "任务拆解、路线选择、决策支持、优先级排序、资源评估、风险预案、约束求解、策略优化"),
    ("工具与系统操作", "CLI/脚本、文件管理、API 调用、系统配置、环境搭建、自动化执行、任务调度、权限操作"),
    ("代码与工程化", "生成/改造代码、重构、测试、构建与发布、CI/CD、依赖管理、性能优化、代码审查"),
    ("内容与沟通", "写作、总结、翻译、会议纪要、简报、提案、邮件/消息、FAQ/客服话术"),
    ("数据处理与分析", "清洗、统计、可视化、报表、ETL、特征工程、异常检测、预测分析"),
    ("业务流程与自动化", "RPA、工单、审批、流程编排、SOP 执行、跨系统协同、任务分派"),
    ("监控与运维", "告警处理、巡检、故障排查、日志分析、容量规划、回滚与恢复"),
    ("评估与质量", "校验、审查、风险评估、数据质量、内容质量、指标验收、合规检查"),
    ("多模态/媒体处理", "图片、音视频、OCR、ASR、TTS、字幕、图像增强、视频剪辑"),
    ("安全与合规", "权限、脱敏、风控、审计、密钥管理、漏洞扫描、合规报告"),
    ("集成与连接器", "第三方 SaaS、Webhook、数据同步、消息队列、SDK/插件、单点登录"),
    ("评测与基准", "A/B、benchmark、质量度量、回归测试、标注与验收"),
    ("领域专用", "法务/医疗/金融等、教育、人力、供应链、营销"),
    ("其他", "未分类/探索中"),
];

pub const DEFAULT_CATEGORY: &str = "其他";

const BASE_FILTERS: &str = "fork:false archived:false stars:>=1";

const SEARCH_TOPICS: &[&str] = &[
    "claude",
    "codex",
    "agent",
    "\"skill-installer\"",
    "anthropic",
    "mcp",
    "gemini",
];

const DENYLIST: &[&str] = &["rpg", "game", "skillswap"];

/// Which text-generation backend to talk to, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFormat {
    /// OpenAI-compatible `/chat/completions`
    ChatCompletions,
    /// Anthropic `/messages`
    Messages,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model_id: String,
    pub url: String,
    pub api_key: String,
    pub format: ApiFormat,
}

impl LlmConfig {
    fn from_env() -> Self {
        let current = env_str("CURRENT_MODEL").unwrap_or_else(|| "deepseek".to_string());
        match current.as_str() {
            "claude" => Self {
                model_id: env_str("CLAUDE_MODEL_ID")
                    .unwrap_or_else(|| "claude-sonnet-4-5-20250929".to_string()),
                url: env_str("CLAUDE_API_URL")
                    .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string()),
                api_key: env_str("CLAUDE_API_KEY").unwrap_or_default(),
                format: ApiFormat::Messages,
            },
            "openai" => Self {
                model_id: env_str("OPENAI_MODEL_ID").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                url: env_str("OPENAI_API_URL")
                    .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
                api_key: env_str("OPENAI_API_KEY").unwrap_or_default(),
                format: ApiFormat::ChatCompletions,
            },
            _ => Self {
                model_id: env_str("DEEPSEEK_MODEL_ID").unwrap_or_else(|| "deepseek-chat".to_string()),
                url: env_str("DEEPSEEK_API_URL")
                    .unwrap_or_else(|| "https://api.deepseek.com/v1/chat/completions".to_string()),
                api_key: env_str("DEEPSEEK_API_KEY").unwrap_or_default(),
                format: ApiFormat::ChatCompletions,
            },
        }
    }
}

/// Runtime knobs for a sync run. Every field can be overridden from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub github_token: Option<String>,
    pub llm: LlmConfig,

    pub max_retries: u32,
    pub retry_delay: Duration,
    pub llm_max_retries: u32,
    pub rate_limit_margin: Duration,
    pub max_rate_limit_waits: u32,

    pub github_request_interval: Duration,
    pub llm_request_interval: Duration,
    pub llm_concurrency: usize,
    pub repo_concurrency: usize,
    pub entry_workers: usize,
    pub skillpath_concurrency: usize,

    pub max_descriptors: usize,
    pub skill_md_max_bytes: u64,
    pub full_clone_max_kb: u64,
    pub substep_timeout: Duration,
    pub repo_task_timeout: Duration,
    pub enrich_task_timeout: Duration,

    pub analysis_max_chars: usize,
    pub translation_max_chars: usize,
    pub translation_chunk_chars: usize,

    pub commit_every: usize,
    pub verify_writes: bool,

    pub start_pushed_date: NaiveDate,
    pub search_cap: u32,
    pub graphql_batch_size: usize,
    pub search_queries: Vec<String>,
    pub denylist: Vec<String>,
}

impl Config {
    /// Get the data directory path
    fn data_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "skillsync", "skillsync")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .context("Could not determine data directory")
    }

    /// Get the database file path (`SKILLSYNC_DB` wins over the platform data dir)
    pub fn default_db_path() -> Result<PathBuf> {
        if let Some(path) = env_str("SKILLSYNC_DB") {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::data_dir()?.join("skills.db"))
    }

    pub fn from_env() -> Result<Self> {
        let max_retries = env_parse("MAX_RETRIES", 3u32)?;
        let start_raw = env_str("START_PUSHED_DATE").unwrap_or_else(|| "2026-01-06".to_string());
        let start_pushed_date = NaiveDate::parse_from_str(&start_raw, "%Y-%m-%d")
            .with_context(|| format!("START_PUSHED_DATE is not a YYYY-MM-DD date: {}", start_raw))?;

        Ok(Self {
            db_path: Self::default_db_path()?,
            github_token: Self::github_token(),
            llm: LlmConfig::from_env(),

            max_retries,
            retry_delay: env_secs("RETRY_DELAY", 5.0)?,
            llm_max_retries: env_parse("LLM_MAX_RETRIES", max_retries.min(3))?,
            rate_limit_margin: env_secs("RATE_LIMIT_MARGIN", 2.0)?,
            max_rate_limit_waits: env_parse("MAX_RATE_LIMIT_WAITS", 5u32)?,

            github_request_interval: env_secs("GITHUB_REQUEST_INTERVAL", 0.2)?,
            llm_request_interval: env_secs("LLM_REQUEST_INTERVAL", 0.2)?,
            llm_concurrency: env_parse("LLM_MAX_CONCURRENT", 60usize)?.max(1),
            repo_concurrency: env_parse("REPO_CONCURRENT", 3usize)?.max(1),
            entry_workers: env_parse("SKILL_ENTRY_WORKERS", 6usize)?.max(1),
            skillpath_concurrency: env_parse("SKILLPATH_FIX_CONCURRENT", 2usize)?.max(1),

            max_descriptors: env_parse("MAX_SKILLS_PER_REPO", 100usize)?,
            skill_md_max_bytes: env_parse("SKILL_MD_MAX_BYTES", 90_000u64)?,
            full_clone_max_kb: env_parse("REPO_SIZE_FULL_CLONE_MAX_KB", 80_000u64)?,
            substep_timeout: env_secs("SUBSTEP_TIMEOUT", 300.0)?,
            repo_task_timeout: env_secs("REPO_TASK_TIMEOUT", 1800.0)?,
            enrich_task_timeout: env_secs("ANALYSIS_TASK_TIMEOUT", 300.0)?,

            analysis_max_chars: env_parse("ANALYSIS_MAX_CHARS", 8000usize)?,
            translation_max_chars: env_parse("SKILL_MD_TRANSLATION_MAX_CHARS", 90_000usize)?,
            translation_chunk_chars: env_parse("SKILL_MD_TRANSLATION_CHUNK_CHARS", 8000usize)?.max(1),

            commit_every: env_parse("COMMIT_EVERY", 200usize)?.max(1),
            verify_writes: env_str("VERIFY_DB_WRITE").as_deref() == Some("1"),

            start_pushed_date,
            search_cap: 1000,
            graphql_batch_size: 50,
            search_queries: SEARCH_TOPICS
                .iter()
                .map(|topic| format!("\"SKILL.md\" in:readme {} {}", topic, BASE_FILTERS))
                .collect(),
            denylist: DENYLIST.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Small, fast settings for tests
    #[cfg(test)]
    pub fn for_tests(db_path: PathBuf) -> Self {
        Self {
            db_path,
            github_token: None,
            llm: LlmConfig {
                model_id: "test".into(),
                url: "http://localhost".into(),
                api_key: String::new(),
                format: ApiFormat::ChatCompletions,
            },
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
            llm_max_retries: 1,
            rate_limit_margin: Duration::ZERO,
            max_rate_limit_waits: 1,
            github_request_interval: Duration::ZERO,
            llm_request_interval: Duration::ZERO,
            llm_concurrency: 4,
            repo_concurrency: 2,
            entry_workers: 2,
            skillpath_concurrency: 2,
            max_descriptors: 100,
            skill_md_max_bytes: 90_000,
            full_clone_max_kb: 80_000,
            substep_timeout: Duration::from_secs(30),
            repo_task_timeout: Duration::from_secs(60),
            enrich_task_timeout: Duration::from_secs(60),
            analysis_max_chars: 8000,
            translation_max_chars: 90_000,
            translation_chunk_chars: 8000,
            commit_every: 10,
            verify_writes: true,
            start_pushed_date: NaiveDate::from_ymd_opt(2026, 1, 6).unwrap_or_default(),
            search_cap: 1000,
            graphql_batch_size: 50,
            search_queries: vec!["\"SKILL.md\" in:readme".to_string()],
            denylist: DENYLIST.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Get GitHub token from environment or gh CLI config
    pub fn github_token() -> Option<String> {
        for key in ["GITHUB_TOKEN", "GH_TOKEN"] {
            if let Some(token) = env_str(key) {
                return Some(token);
            }
        }

        if let Ok(output) = std::process::Command::new("gh")
            .args(["auth", "token"])
            .output()
        {
            if output.status.success() {
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !token.is_empty() {
                    return Some(token);
                }
            }
        }

        None
    }
}

/// Non-empty environment variable
fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_str(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value {:?}: {}", key, raw, e)),
    }
}

fn env_secs(key: &str, default: f64) -> Result<Duration> {
    let secs: f64 = env_parse(key, default)?;
    if !secs.is_finite() || secs < 0.0 {
        anyhow::bail!("{} must be a non-negative number of seconds", key);
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_default_when_unset() {
        let value: u32 = env_parse("SKILLSYNC_TEST_UNSET_KNOB", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("SKILLSYNC_TEST_BAD_KNOB", "many");
        let value: Result<u32> = env_parse("SKILLSYNC_TEST_BAD_KNOB", 1);
        assert!(value.is_err());
        std::env::remove_var("SKILLSYNC_TEST_BAD_KNOB");
    }

    #[test]
    fn test_env_secs_fractional() {
        std::env::set_var("SKILLSYNC_TEST_INTERVAL", "0.25");
        let value = env_secs("SKILLSYNC_TEST_INTERVAL", 1.0).unwrap();
        assert_eq!(value, Duration::from_millis(250));
        std::env::remove_var("SKILLSYNC_TEST_INTERVAL");
    }

    #[test]
    fn test_category_fallback_is_listed() {
        assert_eq!(CATEGORY_TAG_HINTS.len(), 15);
        assert_eq!(CATEGORY_TAG_HINTS.last().map(|(name, _)| *name), Some(DEFAULT_CATEGORY));
    }
}
