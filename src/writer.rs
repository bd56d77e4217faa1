//! Batched, verified field writer
//!
//! Each write stream gets one consumer on a blocking thread with its own SQLite
//! connection. Producers push sparse [`SkillUpdate`] envelopes into an unbounded
//! queue; the consumer drains whatever is ready (up to `commit_every`), merges
//! envelopes for the same skill, applies each inside a savepoint and commits
//! the group. With verification on, every envelope is read back before commit
//! and a mismatch undoes that envelope. What verified before it is committed
//! and the writer stops.

use rusqlite::types::Value;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{SyncError, SyncResult};

const VERIFY_LOG_MAX_LEN: usize = 200;

/// Columns a writer may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SkillField {
    SkillPath,
    RepoStars,
    DownloadUrl,
    SkillMdContent,
    SkillMdSha,
    FileTree,
    HowToInstall,
    LastCheckedAt,
    Tagline,
    Tags,
    TagsEn,
    Categories,
    DescriptionEn,
    DescriptionZh,
    UseCase,
    UseCaseEn,
    Translation,
}

impl SkillField {
    pub fn column(self) -> &'static str {
        match self {
            SkillField::SkillPath => "skill_path",
            SkillField::RepoStars => "repo_stars",
            SkillField::DownloadUrl => "download_url",
            SkillField::SkillMdContent => "skill_md_content",
            SkillField::SkillMdSha => "skill_md_sha",
            SkillField::FileTree => "file_tree",
            SkillField::HowToInstall => "how_to_install",
            SkillField::LastCheckedAt => "skill_md_last_checked_at",
            SkillField::Tagline => "tagline",
            SkillField::Tags => "tags",
            SkillField::TagsEn => "tags_en",
            SkillField::Categories => "categories",
            SkillField::DescriptionEn => "description_en",
            SkillField::DescriptionZh => "description_zh",
            SkillField::UseCase => "use_case",
            SkillField::UseCaseEn => "use_case_en",
            SkillField::Translation => "skill_md_content_translation",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    /// Explicitly clear the column
    Null,
}

impl From<&FieldValue> for Value {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Text(s) => Value::Text(s.clone()),
            FieldValue::Integer(n) => Value::Integer(*n),
            FieldValue::Null => Value::Null,
        }
    }
}

/// Sparse update for one skill. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillUpdate {
    pub id: i64,
    fields: BTreeMap<SkillField, FieldValue>,
}

impl SkillUpdate {
    pub fn new(id: i64) -> Self {
        Self { id, fields: BTreeMap::new() }
    }

    /// Set a text field. Blank strings are dropped, never written.
    pub fn text(mut self, field: SkillField, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.trim().is_empty() {
            self.fields.insert(field, FieldValue::Text(value));
        }
        self
    }

    pub fn maybe_text(self, field: SkillField, value: Option<String>) -> Self {
        match value {
            Some(v) => self.text(field, v),
            None => self,
        }
    }

    pub fn integer(mut self, field: SkillField, value: i64) -> Self {
        self.fields.insert(field, FieldValue::Integer(value));
        self
    }

    pub fn clear(mut self, field: SkillField) -> Self {
        self.fields.insert(field, FieldValue::Null);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &BTreeMap<SkillField, FieldValue> {
        &self.fields
    }

    pub fn text_value(&self, field: SkillField) -> Option<&str> {
        match self.fields.get(&field) {
            Some(FieldValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Fold a later envelope for the same skill into this one; later values win.
    fn absorb(&mut self, later: SkillUpdate) {
        self.fields.extend(later.fields);
    }
}

#[derive(Debug)]
pub enum WriteMessage {
    Update(SkillUpdate),
    /// Flush what is queued and stop
    Close,
}

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub commit_every: usize,
    pub verify: bool,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct WriterReport {
    pub applied: usize,
    pub missing: usize,
    pub failed: usize,
    pub commits: usize,
}

/// Cheap cloneable producer side of a writer
#[derive(Clone)]
pub struct WriterSender {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<WriteMessage>,
}

impl WriterSender {
    /// Queue an envelope. Empty envelopes are dropped here.
    pub fn send(&self, update: SkillUpdate) -> SyncResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        self.tx
            .send(WriteMessage::Update(update))
            .map_err(|_| SyncError::WriterClosed(self.name.to_string()))
    }
}

pub struct WriterHandle {
    sender: WriterSender,
    join: JoinHandle<SyncResult<WriterReport>>,
}

impl WriterHandle {
    pub fn sender(&self) -> WriterSender {
        self.sender.clone()
    }

    /// Send the close sentinel and wait for everything queued before it.
    pub async fn close(self) -> SyncResult<WriterReport> {
        // A halted writer has already dropped its receiver; the join result says why
        let _ = self.sender.tx.send(WriteMessage::Close);
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::Fatal(format!(
                "writer `{}` thread failed: {}",
                self.sender.name, e
            ))),
        }
    }
}

/// Sender wired to a bare receiver, for exercising producers without a database.
#[cfg(test)]
pub(crate) fn test_channel(name: &str) -> (WriterSender, mpsc::UnboundedReceiver<WriteMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WriterSender { name: Arc::from(name), tx }, rx)
}

pub fn spawn_writer(name: &str, conn: Connection, options: WriterOptions) -> WriterHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let name: Arc<str> = Arc::from(name);
    let thread_name = name.clone();
    let join = tokio::task::spawn_blocking(move || run_writer(&thread_name, conn, rx, options));
    WriterHandle {
        sender: WriterSender { name, tx },
        join,
    }
}

/// Consumer loop. Returns when the close sentinel arrives, every sender is
/// gone, or a verification mismatch halts the stream.
pub fn run_writer(
    name: &str,
    mut conn: Connection,
    mut rx: mpsc::UnboundedReceiver<WriteMessage>,
    options: WriterOptions,
) -> SyncResult<WriterReport> {
    let mut report = WriterReport::default();
    let limit = options.commit_every.max(1);

    while let Some(first) = rx.blocking_recv() {
        let mut batch = Vec::new();
        let mut closing = false;
        match first {
            WriteMessage::Update(update) => batch.push(update),
            WriteMessage::Close => closing = true,
        }
        while !closing && batch.len() < limit {
            match rx.try_recv() {
                Ok(WriteMessage::Update(update)) => batch.push(update),
                Ok(WriteMessage::Close) => closing = true,
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            if let Err(e) = apply_batch(name, &mut conn, batch, options.verify, &mut report) {
                tracing::error!(writer = name, kind = e.kind(), error = %e, "writer halted, mismatched update rolled back");
                return Err(e);
            }
        }
        if closing {
            break;
        }
    }

    tracing::info!(
        writer = name,
        applied = report.applied,
        missing = report.missing,
        failed = report.failed,
        commits = report.commits,
        "writer closed"
    );
    Ok(report)
}

/// Merge envelopes for the same skill, keeping first-seen order.
fn coalesce(batch: Vec<SkillUpdate>) -> Vec<SkillUpdate> {
    let mut merged: Vec<SkillUpdate> = Vec::with_capacity(batch.len());
    let mut index: BTreeMap<i64, usize> = BTreeMap::new();
    for update in batch {
        match index.get(&update.id) {
            Some(&pos) => merged[pos].absorb(update),
            None => {
                index.insert(update.id, merged.len());
                merged.push(update);
            }
        }
    }
    merged
}

fn apply_batch(
    name: &str,
    conn: &mut Connection,
    batch: Vec<SkillUpdate>,
    verify: bool,
    report: &mut WriterReport,
) -> SyncResult<()> {
    let mut tx = conn.transaction()?;
    let mut applied = 0usize;
    let mut missing = 0usize;
    let mut failed = 0usize;

    for update in coalesce(batch) {
        let sp = tx.savepoint()?;
        match apply_update(&sp, &update, verify) {
            Ok(true) => {
                sp.commit()?;
                applied += 1;
            }
            Ok(false) => {
                sp.commit()?;
                missing += 1;
                tracing::warn!(writer = name, skill_id = update.id, "skill no longer exists, update skipped");
            }
            Err(e @ SyncError::Verification { .. }) => {
                // Only the mismatched envelope is undone; what already verified is kept
                drop(sp);
                tx.commit()?;
                report.applied += applied;
                report.missing += missing;
                report.failed += failed;
                report.commits += 1;
                return Err(e);
            }
            Err(e) => {
                drop(sp);
                failed += 1;
                tracing::warn!(writer = name, skill_id = update.id, kind = e.kind(), error = %e, "update rolled back");
            }
        }
    }

    tx.commit()?;
    report.applied += applied;
    report.missing += missing;
    report.failed += failed;
    report.commits += 1;
    Ok(())
}

/// Returns `false` when the row does not exist.
fn apply_update(conn: &Connection, update: &SkillUpdate, verify: bool) -> SyncResult<bool> {
    let fields = update.fields();
    let assignments: Vec<String> = fields
        .keys()
        .enumerate()
        .map(|(i, field)| format!("{} = ?{}", field.column(), i + 1))
        .collect();
    let n = fields.len();
    let sql = format!(
        "UPDATE skills SET {}, updated_at = ?{} WHERE id = ?{}",
        assignments.join(", "),
        n + 1,
        n + 2
    );

    let mut values: Vec<Value> = fields.values().map(Value::from).collect();
    values.push(Value::Text(chrono::Utc::now().to_rfc3339()));
    values.push(Value::Integer(update.id));

    let changed = conn.execute(&sql, rusqlite::params_from_iter(values))?;
    if changed == 0 {
        return Ok(false);
    }
    if verify {
        verify_update(conn, update)?;
    }
    Ok(true)
}

fn verify_update(conn: &Connection, update: &SkillUpdate) -> SyncResult<()> {
    let fields = update.fields();
    let columns: Vec<&str> = fields.keys().map(|f| f.column()).collect();
    let sql = format!("SELECT {} FROM skills WHERE id = ?1", columns.join(", "));

    let actual: Vec<Value> = conn.query_row(&sql, [update.id], |row| {
        (0..columns.len()).map(|i| row.get::<_, Value>(i)).collect()
    })?;

    let mismatches: Vec<String> = fields
        .iter()
        .zip(actual.iter())
        .filter(|((_, expected), actual)| Value::from(*expected) != **actual)
        .map(|((field, expected), actual)| {
            format!(
                "{} expected={} actual={}",
                field.column(),
                clip(&format!("{:?}", expected)),
                clip(&format!("{:?}", actual))
            )
        })
        .collect();

    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(SyncError::Verification {
            skill_id: update.id,
            detail: mismatches.join("; "),
        })
    }
}

fn clip(text: &str) -> String {
    if text.chars().count() <= VERIFY_LOG_MAX_LEN {
        text.to_string()
    } else {
        let head: String = text.chars().take(VERIFY_LOG_MAX_LEN).collect();
        format!("{}...(truncated)", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use rusqlite::params;

    struct Fixture {
        _dir: tempfile::TempDir,
        path: std::path::PathBuf,
        ids: Vec<i64>,
    }

    fn fixture(rows: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skills.db");
        let db = Database::open(&path).unwrap();
        let mut ids = Vec::new();
        for i in 0..rows {
            let conn = Database::connect(&path).unwrap();
            conn.execute(
                "INSERT INTO skills (skill_name, from_repo, skill_path, created_at, updated_at)
                 VALUES (?1, 'https://github.com/a/b', ?2, 'x', 'x')",
                params![format!("a/b:s{}", i), format!("s{}", i)],
            )
            .unwrap();
            ids.push(conn.last_insert_rowid());
        }
        drop(db);
        Fixture { _dir: dir, path, ids }
    }

    fn column(path: &std::path::Path, id: i64, column: &str) -> Option<String> {
        let conn = Database::connect(path).unwrap();
        conn.query_row(&format!("SELECT {} FROM skills WHERE id = ?1", column), [id], |r| r.get(0))
            .unwrap()
    }

    fn options(verify: bool) -> WriterOptions {
        WriterOptions { commit_every: 200, verify }
    }

    /// Run the consumer on this thread over a pre-filled queue
    fn run_queued(path: &std::path::Path, messages: Vec<WriteMessage>, verify: bool) -> SyncResult<WriterReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        for message in messages {
            tx.send(message).unwrap();
        }
        run_writer("test", Database::connect(path).unwrap(), rx, options(verify))
    }

    #[test]
    fn test_blank_text_is_skipped_and_null_clears() {
        let update = SkillUpdate::new(1)
            .text(SkillField::Tagline, "   ")
            .maybe_text(SkillField::Tags, None)
            .clear(SkillField::Translation);
        assert_eq!(update.fields().len(), 1);
        assert_eq!(update.fields()[&SkillField::Translation], FieldValue::Null);
    }

    #[test]
    fn test_coalesce_keeps_later_values() {
        let merged = coalesce(vec![
            SkillUpdate::new(1).text(SkillField::Tagline, "a/A"),
            SkillUpdate::new(2).text(SkillField::Tagline, "b/B"),
            SkillUpdate::new(1).text(SkillField::Tagline, "c/C").text(SkillField::Tags, "[]x"),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, 1);
        assert_eq!(merged[0].fields()[&SkillField::Tagline], FieldValue::Text("c/C".into()));
        assert_eq!(merged[0].fields().len(), 2);
    }

    #[test]
    fn test_verified_batch_applies_and_commits() {
        let fx = fixture(2);
        let report = run_queued(
            &fx.path,
            vec![
                WriteMessage::Update(SkillUpdate::new(fx.ids[0]).text(SkillField::Tagline, "标语/Tagline")),
                WriteMessage::Update(SkillUpdate::new(fx.ids[1]).integer(SkillField::RepoStars, 5)),
                WriteMessage::Update(SkillUpdate::new(fx.ids[0]).text(SkillField::Categories, "其他")),
                WriteMessage::Close,
            ],
            true,
        )
        .unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.commits, 1);
        assert_eq!(column(&fx.path, fx.ids[0], "tagline").as_deref(), Some("标语/Tagline"));
        assert_eq!(column(&fx.path, fx.ids[0], "categories").as_deref(), Some("其他"));
    }

    #[test]
    fn test_explicit_null_clears_column() {
        let fx = fixture(1);
        run_queued(
            &fx.path,
            vec![
                WriteMessage::Update(SkillUpdate::new(fx.ids[0]).text(SkillField::UseCase, "场景")),
                WriteMessage::Close,
            ],
            true,
        )
        .unwrap();
        run_queued(
            &fx.path,
            vec![
                WriteMessage::Update(SkillUpdate::new(fx.ids[0]).clear(SkillField::UseCase)),
                WriteMessage::Close,
            ],
            true,
        )
        .unwrap();
        assert_eq!(column(&fx.path, fx.ids[0], "use_case"), None);
    }

    #[test]
    fn test_missing_row_is_skipped() {
        let fx = fixture(1);
        let report = run_queued(
            &fx.path,
            vec![
                WriteMessage::Update(SkillUpdate::new(9999).text(SkillField::Tagline, "x/X")),
                WriteMessage::Update(SkillUpdate::new(fx.ids[0]).text(SkillField::Tagline, "好/Good")),
                WriteMessage::Close,
            ],
            true,
        )
        .unwrap();
        assert_eq!(report.missing, 1);
        assert_eq!(report.applied, 1);
    }

    #[test]
    fn test_failed_envelope_rolls_back_alone() {
        let fx = fixture(2);
        Database::connect(&fx.path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_boom BEFORE UPDATE OF tagline ON skills
                 WHEN NEW.tagline = 'boom/Boom'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let report = run_queued(
            &fx.path,
            vec![
                WriteMessage::Update(SkillUpdate::new(fx.ids[0]).text(SkillField::Tagline, "boom/Boom")),
                WriteMessage::Update(SkillUpdate::new(fx.ids[1]).text(SkillField::Tagline, "好/Fine")),
                WriteMessage::Close,
            ],
            true,
        )
        .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(column(&fx.path, fx.ids[0], "tagline"), None);
        assert_eq!(column(&fx.path, fx.ids[1], "tagline").as_deref(), Some("好/Fine"));
    }

    #[test]
    fn test_verification_mismatch_keeps_verified_prefix_and_halts() {
        let fx = fixture(2);
        Database::connect(&fx.path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER corrupt_tagline AFTER UPDATE OF tagline ON skills
                 WHEN NEW.tagline = 'bad/Bad'
                 BEGIN UPDATE skills SET tagline = 'corrupted' WHERE id = NEW.id; END;",
            )
            .unwrap();

        let result = run_queued(
            &fx.path,
            vec![
                WriteMessage::Update(SkillUpdate::new(fx.ids[0]).text(SkillField::Tagline, "好/Good")),
                WriteMessage::Update(SkillUpdate::new(fx.ids[1]).text(SkillField::Tagline, "bad/Bad")),
                WriteMessage::Close,
            ],
            true,
        );

        match result {
            Err(SyncError::Verification { skill_id, detail }) => {
                assert_eq!(skill_id, fx.ids[1]);
                assert!(detail.contains("tagline"));
                assert!(detail.contains("corrupted"));
            }
            other => panic!("expected verification failure, got {:?}", other),
        }
        // Same batch: the envelope that verified before the mismatch is committed
        assert_eq!(column(&fx.path, fx.ids[0], "tagline").as_deref(), Some("好/Good"));
        assert_eq!(column(&fx.path, fx.ids[1], "tagline"), None);
    }

    #[test]
    fn test_without_verification_corruption_goes_unnoticed() {
        let fx = fixture(1);
        Database::connect(&fx.path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER corrupt_tagline AFTER UPDATE OF tagline ON skills
                 BEGIN UPDATE skills SET tagline = 'corrupted' WHERE id = NEW.id; END;",
            )
            .unwrap();

        let report = run_queued(
            &fx.path,
            vec![
                WriteMessage::Update(SkillUpdate::new(fx.ids[0]).text(SkillField::Tagline, "好/Good")),
                WriteMessage::Close,
            ],
            false,
        )
        .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(column(&fx.path, fx.ids[0], "tagline").as_deref(), Some("corrupted"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_halted_writer_rejects_new_envelopes() {
        let fx = fixture(1);
        Database::connect(&fx.path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER corrupt_tagline AFTER UPDATE OF tagline ON skills
                 BEGIN UPDATE skills SET tagline = 'corrupted' WHERE id = NEW.id; END;",
            )
            .unwrap();

        let handle = spawn_writer("enrichment", Database::connect(&fx.path).unwrap(), options(true));
        let sender = handle.sender();
        sender
            .send(SkillUpdate::new(fx.ids[0]).text(SkillField::Tagline, "好/Good"))
            .unwrap();

        let result = handle.close().await;
        assert!(matches!(result, Err(SyncError::Verification { .. })));

        let late = sender.send(SkillUpdate::new(fx.ids[0]).text(SkillField::Tags, "[\"x\"]"));
        assert!(matches!(late, Err(SyncError::WriterClosed(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_flushes_everything_queued() {
        let fx = fixture(3);
        let handle = spawn_writer(
            "base",
            Database::connect(&fx.path).unwrap(),
            WriterOptions { commit_every: 2, verify: true },
        );
        let sender = handle.sender();
        for id in &fx.ids {
            sender
                .send(SkillUpdate::new(*id).text(SkillField::SkillMdSha, format!("sha-{}", id)))
                .unwrap();
        }
        let report = handle.close().await.unwrap();
        assert_eq!(report.applied, 3);
        assert!(report.commits >= 2);
        for id in &fx.ids {
            assert_eq!(column(&fx.path, *id, "skill_md_sha"), Some(format!("sha-{}", id)));
        }
    }
}
