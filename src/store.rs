//! Working store: two logical branches of record files per workbook.
//!
//! `main` holds the last confirmed remote state. `dirty` is an overlay of
//! pending local edits: reading a path on the dirty branch falls through to
//! main when no overlay row exists, and a NULL overlay row is a tombstone
//! marking the file deleted locally. Commits are path-keyed upserts, so
//! concurrent jobs touching different folder paths cannot corrupt each other.

use crate::db::Pool;
use crate::model::{DiffEntry, DiffStatus};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::Row;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Main,
    Dirty,
}

#[derive(Debug, Clone)]
pub struct CommitFile {
    pub path: String,
    pub content: String,
}

impl CommitFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait WorkingStore: Send + Sync {
    /// Changed files between dirty and main, scoped to one folder path,
    /// ordered by path so publish batching is deterministic.
    async fn get_folder_diff(&self, workbook_id: &str, folder_path: &str)
        -> Result<Vec<DiffEntry>>;

    async fn get_file(
        &self,
        workbook_id: &str,
        branch: Branch,
        path: &str,
    ) -> Result<Option<String>>;

    async fn commit_files(
        &self,
        workbook_id: &str,
        branch: Branch,
        files: &[CommitFile],
        message: &str,
    ) -> Result<()>;

    async fn delete_files(
        &self,
        workbook_id: &str,
        branch: Branch,
        paths: &[String],
        message: &str,
    ) -> Result<()>;

    async fn list_files(
        &self,
        workbook_id: &str,
        branch: Branch,
        folder_path: &str,
    ) -> Result<Vec<String>>;

    /// Drop overlay rows made redundant by new main contents. Run after a
    /// pull so in-progress edits survive but already-synced ones disappear.
    async fn rebase_dirty(&self, workbook_id: &str) -> Result<()>;

    /// Fold the dirty overlay under a folder path into main. Run after a
    /// fully successful publish; this is what advances the last-synced state.
    async fn merge_dirty(&self, workbook_id: &str, folder_path: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteWorkingStore {
    pool: Pool,
}

impl SqliteWorkingStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn folder_pattern(folder_path: &str) -> String {
    let trimmed = folder_path.trim_end_matches('/');
    format!("{trimmed}/%")
}

#[async_trait]
impl WorkingStore for SqliteWorkingStore {
    async fn get_folder_diff(
        &self,
        workbook_id: &str,
        folder_path: &str,
    ) -> Result<Vec<DiffEntry>> {
        let pattern = folder_pattern(folder_path);
        let mut entries = Vec::new();

        let added = sqlx::query(
            "SELECT d.path, d.content FROM files_dirty d \
             LEFT JOIN files_main m ON m.workbook_id = d.workbook_id AND m.path = d.path \
             WHERE d.workbook_id = ? AND d.path LIKE ? \
               AND d.content IS NOT NULL AND m.path IS NULL \
             ORDER BY d.path",
        )
        .bind(workbook_id)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        for row in added {
            entries.push(DiffEntry {
                path: row.get("path"),
                status: DiffStatus::Added,
                content: row.get("content"),
            });
        }

        let modified = sqlx::query(
            "SELECT d.path, d.content FROM files_dirty d \
             JOIN files_main m ON m.workbook_id = d.workbook_id AND m.path = d.path \
             WHERE d.workbook_id = ? AND d.path LIKE ? \
               AND d.content IS NOT NULL AND d.content <> m.content \
             ORDER BY d.path",
        )
        .bind(workbook_id)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        for row in modified {
            entries.push(DiffEntry {
                path: row.get("path"),
                status: DiffStatus::Modified,
                content: row.get("content"),
            });
        }

        // Deleted entries carry the main-branch copy; the dirty one is gone.
        let deleted = sqlx::query(
            "SELECT d.path, m.content FROM files_dirty d \
             JOIN files_main m ON m.workbook_id = d.workbook_id AND m.path = d.path \
             WHERE d.workbook_id = ? AND d.path LIKE ? AND d.content IS NULL \
             ORDER BY d.path",
        )
        .bind(workbook_id)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        for row in deleted {
            entries.push(DiffEntry {
                path: row.get("path"),
                status: DiffStatus::Deleted,
                content: row.get("content"),
            });
        }

        Ok(entries)
    }

    async fn get_file(
        &self,
        workbook_id: &str,
        branch: Branch,
        path: &str,
    ) -> Result<Option<String>> {
        match branch {
            Branch::Main => {
                let content: Option<String> = sqlx::query_scalar(
                    "SELECT content FROM files_main WHERE workbook_id = ? AND path = ?",
                )
                .bind(workbook_id)
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
                Ok(content)
            }
            Branch::Dirty => {
                let overlay = sqlx::query(
                    "SELECT content FROM files_dirty WHERE workbook_id = ? AND path = ?",
                )
                .bind(workbook_id)
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
                if let Some(row) = overlay {
                    // NULL content means deleted on dirty.
                    return Ok(row.get::<Option<String>, _>("content"));
                }
                self.get_file(workbook_id, Branch::Main, path).await
            }
        }
    }

    async fn commit_files(
        &self,
        workbook_id: &str,
        branch: Branch,
        files: &[CommitFile],
        message: &str,
    ) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let table = match branch {
            Branch::Main => "files_main",
            Branch::Dirty => "files_dirty",
        };
        let mut tx = self.pool.begin().await?;
        for file in files {
            sqlx::query(&format!(
                "INSERT INTO {table} (workbook_id, path, content) VALUES (?, ?, ?) \
                 ON CONFLICT (workbook_id, path) DO UPDATE SET content = excluded.content"
            ))
            .bind(workbook_id)
            .bind(&file.path)
            .bind(&file.content)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = files.len(), ?branch, message, "committed files");
        Ok(())
    }

    async fn delete_files(
        &self,
        workbook_id: &str,
        branch: Branch,
        paths: &[String],
        message: &str,
    ) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for path in paths {
            match branch {
                Branch::Main => {
                    sqlx::query("DELETE FROM files_main WHERE workbook_id = ? AND path = ?")
                        .bind(workbook_id)
                        .bind(path)
                        .execute(&mut *tx)
                        .await?;
                }
                Branch::Dirty => {
                    let in_main: Option<i64> = sqlx::query_scalar(
                        "SELECT 1 FROM files_main WHERE workbook_id = ? AND path = ?",
                    )
                    .bind(workbook_id)
                    .bind(path)
                    .fetch_optional(&mut *tx)
                    .await?;
                    if in_main.is_some() {
                        // Tombstone: the delete must survive until published.
                        sqlx::query(
                            "INSERT INTO files_dirty (workbook_id, path, content) \
                             VALUES (?, ?, NULL) \
                             ON CONFLICT (workbook_id, path) DO UPDATE SET content = NULL",
                        )
                        .bind(workbook_id)
                        .bind(path)
                        .execute(&mut *tx)
                        .await?;
                    } else {
                        // Never published; dropping the overlay row is enough.
                        sqlx::query("DELETE FROM files_dirty WHERE workbook_id = ? AND path = ?")
                            .bind(workbook_id)
                            .bind(path)
                            .execute(&mut *tx)
                            .await?;
                    }
                }
            }
        }
        tx.commit().await?;
        debug!(count = paths.len(), ?branch, message, "deleted files");
        Ok(())
    }

    async fn list_files(
        &self,
        workbook_id: &str,
        branch: Branch,
        folder_path: &str,
    ) -> Result<Vec<String>> {
        let pattern = folder_pattern(folder_path);
        let paths: Vec<String> = match branch {
            Branch::Main => {
                sqlx::query_scalar(
                    "SELECT path FROM files_main WHERE workbook_id = ? AND path LIKE ? \
                     ORDER BY path",
                )
                .bind(workbook_id)
                .bind(&pattern)
                .fetch_all(&self.pool)
                .await?
            }
            Branch::Dirty => {
                sqlx::query_scalar(
                    "SELECT m.path FROM files_main m \
                     WHERE m.workbook_id = ?1 AND m.path LIKE ?2 \
                       AND NOT EXISTS (SELECT 1 FROM files_dirty d \
                                       WHERE d.workbook_id = m.workbook_id \
                                         AND d.path = m.path AND d.content IS NULL) \
                     UNION \
                     SELECT d.path FROM files_dirty d \
                     WHERE d.workbook_id = ?1 AND d.path LIKE ?2 AND d.content IS NOT NULL \
                     ORDER BY 1",
                )
                .bind(workbook_id)
                .bind(&pattern)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(paths)
    }

    async fn rebase_dirty(&self, workbook_id: &str) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM files_dirty WHERE workbook_id = ? AND ( \
               (content IS NOT NULL AND EXISTS ( \
                  SELECT 1 FROM files_main m \
                  WHERE m.workbook_id = files_dirty.workbook_id \
                    AND m.path = files_dirty.path AND m.content = files_dirty.content)) \
               OR \
               (content IS NULL AND NOT EXISTS ( \
                  SELECT 1 FROM files_main m \
                  WHERE m.workbook_id = files_dirty.workbook_id \
                    AND m.path = files_dirty.path)) \
             )",
        )
        .bind(workbook_id)
        .execute(&self.pool)
        .await?;
        debug!(
            dropped = result.rows_affected(),
            workbook_id, "rebased dirty overlay"
        );
        Ok(())
    }

    async fn merge_dirty(&self, workbook_id: &str, folder_path: &str) -> Result<()> {
        let pattern = folder_pattern(folder_path);
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM files_main WHERE workbook_id = ?1 AND path IN ( \
               SELECT path FROM files_dirty \
               WHERE workbook_id = ?1 AND path LIKE ?2 AND content IS NULL)",
        )
        .bind(workbook_id)
        .bind(&pattern)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO files_main (workbook_id, path, content) \
             SELECT workbook_id, path, content FROM files_dirty \
             WHERE workbook_id = ?1 AND path LIKE ?2 AND content IS NOT NULL \
             ON CONFLICT (workbook_id, path) DO UPDATE SET content = excluded.content",
        )
        .bind(workbook_id)
        .bind(&pattern)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM files_dirty WHERE workbook_id = ? AND path LIKE ?")
            .bind(workbook_id)
            .bind(&pattern)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(workbook_id, folder_path, "merged dirty overlay into main");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    const WB: &str = "wb-1";

    async fn setup_store() -> SqliteWorkingStore {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        SqliteWorkingStore::new(pool)
    }

    async fn seed(store: &SqliteWorkingStore, branch: Branch, path: &str, content: &str) {
        store
            .commit_files(WB, branch, &[CommitFile::new(path, content)], "seed")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn diff_classifies_added_modified_deleted() {
        let store = setup_store().await;
        seed(&store, Branch::Main, "/blog/keep.json", "{\"id\":\"a\"}").await;
        seed(&store, Branch::Main, "/blog/edit.json", "{\"id\":\"b\"}").await;
        seed(&store, Branch::Main, "/blog/gone.json", "{\"id\":\"c\"}").await;

        seed(&store, Branch::Dirty, "/blog/new.json", "{}").await;
        seed(&store, Branch::Dirty, "/blog/edit.json", "{\"id\":\"b\",\"x\":1}").await;
        store
            .delete_files(WB, Branch::Dirty, &["/blog/gone.json".into()], "rm")
            .await
            .unwrap();

        let diff = store.get_folder_diff(WB, "/blog").await.unwrap();
        let by_status = |s: DiffStatus| {
            diff.iter()
                .filter(|e| e.status == s)
                .map(|e| e.path.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(by_status(DiffStatus::Added), vec!["/blog/new.json"]);
        assert_eq!(by_status(DiffStatus::Modified), vec!["/blog/edit.json"]);
        assert_eq!(by_status(DiffStatus::Deleted), vec!["/blog/gone.json"]);

        // The deleted entry carries the last-synced content.
        let gone = diff.iter().find(|e| e.status == DiffStatus::Deleted).unwrap();
        assert_eq!(gone.content, "{\"id\":\"c\"}");
    }

    #[tokio::test]
    async fn diff_ignores_other_folders_and_identical_content() {
        let store = setup_store().await;
        seed(&store, Branch::Main, "/blog/a.json", "{}").await;
        seed(&store, Branch::Dirty, "/blog/a.json", "{}").await;
        seed(&store, Branch::Dirty, "/other/b.json", "{}").await;

        let diff = store.get_folder_diff(WB, "/blog").await.unwrap();
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn dirty_reads_fall_through_to_main() {
        let store = setup_store().await;
        seed(&store, Branch::Main, "/blog/a.json", "main").await;
        assert_eq!(
            store.get_file(WB, Branch::Dirty, "/blog/a.json").await.unwrap(),
            Some("main".to_string())
        );

        seed(&store, Branch::Dirty, "/blog/a.json", "edited").await;
        assert_eq!(
            store.get_file(WB, Branch::Dirty, "/blog/a.json").await.unwrap(),
            Some("edited".to_string())
        );
        assert_eq!(
            store.get_file(WB, Branch::Main, "/blog/a.json").await.unwrap(),
            Some("main".to_string())
        );

        store
            .delete_files(WB, Branch::Dirty, &["/blog/a.json".into()], "rm")
            .await
            .unwrap();
        assert_eq!(
            store.get_file(WB, Branch::Dirty, "/blog/a.json").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn deleting_unpublished_file_leaves_no_tombstone() {
        let store = setup_store().await;
        seed(&store, Branch::Dirty, "/blog/draft.json", "{}").await;
        store
            .delete_files(WB, Branch::Dirty, &["/blog/draft.json".into()], "rm")
            .await
            .unwrap();
        assert!(store.get_folder_diff(WB, "/blog").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn merge_dirty_advances_main() {
        let store = setup_store().await;
        seed(&store, Branch::Main, "/blog/old.json", "{}").await;
        seed(&store, Branch::Dirty, "/blog/new.json", "fresh").await;
        store
            .delete_files(WB, Branch::Dirty, &["/blog/old.json".into()], "rm")
            .await
            .unwrap();

        store.merge_dirty(WB, "/blog").await.unwrap();

        assert_eq!(
            store.list_files(WB, Branch::Main, "/blog").await.unwrap(),
            vec!["/blog/new.json"]
        );
        assert!(store.get_folder_diff(WB, "/blog").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rebase_drops_redundant_overlay_rows() {
        let store = setup_store().await;
        // Pulled content now matches the local edit.
        seed(&store, Branch::Main, "/blog/same.json", "v2").await;
        seed(&store, Branch::Dirty, "/blog/same.json", "v2").await;
        // A genuine in-progress edit must survive.
        seed(&store, Branch::Main, "/blog/edit.json", "remote").await;
        seed(&store, Branch::Dirty, "/blog/edit.json", "local").await;
        // Tombstone for a file the remote already deleted.
        seed(&store, Branch::Dirty, "/blog/gone.json", "x").await;
        store
            .delete_files(WB, Branch::Dirty, &["/blog/gone.json".into()], "rm")
            .await
            .unwrap();

        store.rebase_dirty(WB).await.unwrap();

        let diff = store.get_folder_diff(WB, "/blog").await.unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, "/blog/edit.json");
        assert_eq!(diff[0].status, DiffStatus::Modified);
    }

    #[tokio::test]
    async fn list_dirty_reflects_overlay() {
        let store = setup_store().await;
        seed(&store, Branch::Main, "/blog/a.json", "{}").await;
        seed(&store, Branch::Main, "/blog/b.json", "{}").await;
        seed(&store, Branch::Dirty, "/blog/c.json", "{}").await;
        store
            .delete_files(WB, Branch::Dirty, &["/blog/b.json".into()], "rm")
            .await
            .unwrap();

        let dirty = store.list_files(WB, Branch::Dirty, "/blog").await.unwrap();
        assert_eq!(dirty, vec!["/blog/a.json", "/blog/c.json"]);
        let main = store.list_files(WB, Branch::Main, "/blog").await.unwrap();
        assert_eq!(main, vec!["/blog/a.json", "/blog/b.json"]);
    }
}
