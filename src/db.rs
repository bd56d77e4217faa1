use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::changes::{ensure_unique_name, NewSkill};

const WATERMARK_KEY: &str = "last_run";

/// Stored skill as seen by change detection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExistingSkill {
    pub id: i64,
    pub skill_name: String,
    pub skill_path: Option<String>,
    pub skill_md_sha: Option<String>,
    pub skill_md_content: Option<String>,
}

/// Stored skill with the fields enrichment reads and writes
#[derive(Debug, Clone, Default)]
pub struct SkillRow {
    pub id: i64,
    pub skill_name: String,
    pub from_repo: String,
    pub skill_path: Option<String>,
    pub skill_md_content: Option<String>,
    pub tagline: Option<String>,
    pub tags: Option<String>,
    pub tags_en: Option<String>,
    pub categories: Option<String>,
    pub description_en: Option<String>,
    pub description_zh: Option<String>,
    pub use_case: Option<String>,
    pub use_case_en: Option<String>,
    pub skill_md_content_translation: Option<String>,
}

/// Skill waiting for its path to be resolved
#[derive(Debug, Clone)]
pub struct PathlessSkill {
    pub id: i64,
    pub skill_name: String,
    pub from_repo: String,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub skills: usize,
    pub repos: usize,
    pub missing_path: usize,
    pub missing_tagline: usize,
    pub missing_tags: usize,
    pub missing_description: usize,
    pub missing_use_case: usize,
    pub missing_translation: usize,
    pub last_run: Option<String>,
}

/// `owner/name` for a stored skill, from its name prefix or its repo URL.
pub fn repo_name_of(skill_name: &str, from_repo: &str) -> String {
    if let Some((repo, _)) = skill_name.split_once(':') {
        return repo.to_string();
    }
    from_repo
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit_once("github.com/")
        .map(|(_, tail)| tail.to_string())
        .unwrap_or_else(|| from_repo.to_string())
}

const SKILL_ROW_COLUMNS: &str = "id, skill_name, from_repo, skill_path, skill_md_content, tagline, tags, \
     tags_en, categories, description_en, description_zh, use_case, use_case_en, \
     skill_md_content_translation";

fn skill_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SkillRow> {
    Ok(SkillRow {
        id: row.get(0)?,
        skill_name: row.get(1)?,
        from_repo: row.get(2)?,
        skill_path: row.get(3)?,
        skill_md_content: row.get(4)?,
        tagline: row.get(5)?,
        tags: row.get(6)?,
        tags_en: row.get(7)?,
        categories: row.get(8)?,
        description_en: row.get(9)?,
        description_zh: row.get(10)?,
        use_case: row.get(11)?,
        use_case_en: row.get(12)?,
        skill_md_content_translation: row.get(13)?,
    })
}

/// Shared handle for direct reads and structural writes (insert, delete, stars).
/// Field updates go through the writer, which owns a separate connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory: {}", parent.display())
                })?;
            }
        }

        let conn = Self::connect(db_path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_path_buf(),
        };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database for testing
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    /// A fresh connection with the same settings, for a dedicated writer thread.
    pub fn connect(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        // Writers and the main handle share the file; wait instead of failing with SQLITE_BUSY
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database mutex poisoned"))
    }

    fn init(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS skills (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                skill_name TEXT UNIQUE NOT NULL,
                from_repo TEXT NOT NULL,
                skill_path TEXT,
                repo_stars INTEGER DEFAULT 0,
                download_url TEXT,
                skill_md_content TEXT,
                skill_md_sha TEXT,
                file_tree TEXT,
                how_to_install TEXT,
                tagline TEXT,
                tags TEXT,
                tags_en TEXT,
                categories TEXT,
                description_en TEXT,
                description_zh TEXT,
                use_case TEXT,
                use_case_en TEXT,
                skill_md_content_translation TEXT,
                skill_md_last_checked_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_skills_from_repo ON skills(from_repo);
            CREATE INDEX IF NOT EXISTS idx_skills_missing_path ON skills(id) WHERE skill_path IS NULL;

            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // === Watermark ===

    pub fn get_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .lock()?
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![WATERMARK_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            None => Ok(None),
            Some(value) => DateTime::parse_from_rfc3339(&value)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .with_context(|| format!("Stored watermark is not RFC 3339: {}", value)),
        }
    }

    pub fn set_watermark(&self, at: DateTime<Utc>) -> Result<()> {
        self.lock()?.execute(
            "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![WATERMARK_KEY, at.to_rfc3339()],
        )?;
        Ok(())
    }

    // === Change detection reads ===

    /// All stored skills grouped by lowercase `owner/name`.
    pub fn load_existing_skills(&self) -> Result<HashMap<String, Vec<ExistingSkill>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, skill_name, from_repo, skill_path, skill_md_sha, skill_md_content
             FROM skills ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let skill_name: String = row.get(1)?;
            let from_repo: String = row.get(2)?;
            Ok((
                repo_name_of(&skill_name, &from_repo).to_lowercase(),
                ExistingSkill {
                    id: row.get(0)?,
                    skill_name,
                    skill_path: row.get(3)?,
                    skill_md_sha: row.get(4)?,
                    skill_md_content: row.get(5)?,
                },
            ))
        })?;

        let mut grouped: HashMap<String, Vec<ExistingSkill>> = HashMap::new();
        for row in rows {
            let (repo, skill) = row?;
            grouped.entry(repo).or_default().push(skill);
        }
        Ok(grouped)
    }

    #[cfg(test)]
    pub fn name_exists(&self, skill_name: &str) -> Result<bool> {
        let found: Option<i64> = self
            .lock()?
            .query_row(
                "SELECT 1 FROM skills WHERE skill_name = ?1 LIMIT 1",
                params![skill_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_skill(&self, id: i64) -> Result<Option<SkillRow>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM skills WHERE id = ?1", SKILL_ROW_COLUMNS);
        Ok(conn.query_row(&sql, params![id], skill_row).optional()?)
    }

    pub fn find_skill_by_name(&self, skill_name: &str) -> Result<Option<SkillRow>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM skills WHERE skill_name = ?1", SKILL_ROW_COLUMNS);
        Ok(conn.query_row(&sql, params![skill_name], skill_row).optional()?)
    }

    // === Structural writes ===

    /// Insert a new skill, choosing a unique name. Returns `(id, skill_name)`.
    pub fn insert_skill(&self, skill: &NewSkill, translation: Option<&str>) -> Result<(i64, String)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let base = format!("{}:{}", skill.repo_name, skill.short_name);
        let mut lookup_error = None;
        let name = ensure_unique_name(&base, &skill.repo_name, &skill.short_name, &skill.skill_path, |candidate| {
            match tx
                .query_row(
                    "SELECT 1 FROM skills WHERE skill_name = ?1 LIMIT 1",
                    params![candidate],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
            {
                Ok(found) => found.is_some(),
                Err(e) => {
                    lookup_error = Some(e);
                    true
                }
            }
        });
        if let Some(e) = lookup_error {
            return Err(e.into());
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO skills (
                skill_name, from_repo, skill_path, repo_stars, download_url,
                skill_md_content, skill_md_sha, file_tree, how_to_install,
                skill_md_content_translation, skill_md_last_checked_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, ?11)",
            params![
                name,
                skill.from_repo,
                skill.skill_path,
                skill.stars,
                skill.download_url,
                skill.content,
                skill.content_hash,
                skill.file_tree,
                skill.how_to_install,
                translation,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok((id, name))
    }

    pub fn delete_skill(&self, id: i64) -> Result<bool> {
        let n = self.lock()?.execute("DELETE FROM skills WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Delete every skill that belongs to `repo_name` (case-insensitive).
    pub fn delete_repo_skills(&self, repo_name: &str) -> Result<usize> {
        let prefix = format!("{}:", repo_name.to_lowercase());
        let url = format!("https://github.com/{}", repo_name.to_lowercase());
        let n = self.lock()?.execute(
            "DELETE FROM skills
             WHERE substr(lower(skill_name), 1, length(?1)) = ?1
                OR lower(rtrim(from_repo, '/')) = ?2",
            params![prefix, url],
        )?;
        Ok(n)
    }

    /// Set the star count on every skill of `repo_name`, matched the same way
    /// as [`delete_repo_skills`](Self::delete_repo_skills).
    pub fn update_repo_stars(&self, repo_name: &str, stars: i64) -> Result<usize> {
        let prefix = format!("{}:", repo_name.to_lowercase());
        let url = format!("https://github.com/{}", repo_name.to_lowercase());
        let n = self.lock()?.execute(
            "UPDATE skills SET repo_stars = ?2
             WHERE (substr(lower(skill_name), 1, length(?1)) = ?1
                    OR lower(rtrim(from_repo, '/')) = ?3)
               AND repo_stars IS NOT ?2",
            params![prefix, stars, url],
        )?;
        Ok(n)
    }

    /// Record a resolved path. Only fills paths that are still NULL.
    pub fn set_skill_path(&self, id: i64, skill_path: &str) -> Result<bool> {
        let n = self.lock()?.execute(
            "UPDATE skills SET skill_path = ?2, updated_at = ?3 WHERE id = ?1 AND skill_path IS NULL",
            params![id, skill_path, Utc::now().to_rfc3339()],
        )?;
        Ok(n > 0)
    }

    // === Repair reads ===

    /// Skills whose path was never recorded, oldest first.
    pub fn skills_missing_path(&self) -> Result<Vec<PathlessSkill>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, skill_name, from_repo FROM skills WHERE skill_path IS NULL ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PathlessSkill {
                id: row.get(0)?,
                skill_name: row.get(1)?,
                from_repo: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Skills with at least one enrichment field missing, or a translation
    /// placeholder whose content now fits under `translation_max_chars`.
    pub fn skills_needing_enrichment(
        &self,
        placeholder: &str,
        translation_max_chars: usize,
        limit: Option<usize>,
    ) -> Result<Vec<SkillRow>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM skills
             WHERE coalesce(tagline, '') = ''
                OR coalesce(tags, '') IN ('', '[]')
                OR coalesce(tags_en, '') IN ('', '[]')
                OR coalesce(categories, '') = ''
                OR coalesce(description_en, '') = ''
                OR coalesce(description_zh, '') = ''
                OR coalesce(use_case, '') = ''
                OR coalesce(use_case_en, '') = ''
                OR coalesce(skill_md_content_translation, '') = ''
                OR (skill_md_content_translation = ?1 AND length(skill_md_content) <= ?2)
             ORDER BY id
             LIMIT ?3",
            SKILL_ROW_COLUMNS
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![placeholder, translation_max_chars as i64, limit],
            skill_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn stats(&self) -> Result<Stats> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<usize> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as usize)
        };

        let last_run: Option<String> = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![WATERMARK_KEY],
                |row| row.get(0),
            )
            .optional()?;

        Ok(Stats {
            skills: count("SELECT COUNT(*) FROM skills")?,
            repos: count("SELECT COUNT(DISTINCT lower(from_repo)) FROM skills")?,
            missing_path: count("SELECT COUNT(*) FROM skills WHERE skill_path IS NULL")?,
            missing_tagline: count("SELECT COUNT(*) FROM skills WHERE coalesce(tagline, '') = ''")?,
            missing_tags: count("SELECT COUNT(*) FROM skills WHERE coalesce(tags, '') IN ('', '[]')")?,
            missing_description: count(
                "SELECT COUNT(*) FROM skills WHERE coalesce(description_en, '') = '' OR coalesce(description_zh, '') = ''",
            )?,
            missing_use_case: count(
                "SELECT COUNT(*) FROM skills WHERE coalesce(use_case, '') = '' OR coalesce(use_case_en, '') = ''",
            )?,
            missing_translation: count(
                "SELECT COUNT(*) FROM skills WHERE coalesce(skill_md_content_translation, '') = ''",
            )?,
            last_run,
        })
    }

    /// Run `f` on the blocking pool so SQLite never stalls a runtime worker.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("database task panicked")?
    }

    /// Raw connection access for tests that seed rows directly
    #[cfg(test)]
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        Ok(f(&*self.lock()?)?)
    }
}
