use std::{path::Path, str::FromStr, time::Duration};

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions},
    Sqlite, SqlitePool,
};

#[cfg(test)]
use mockall::automock;
use tracing::info;

use super::models::{DirScope, FileModel, MIRROR_ROOT_ID};
use crate::data_layer_error::*;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mirror_timestamp (
  timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS increment_timestamps (
  timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mirror_directories (
  id INTEGER PRIMARY KEY,
  parent_id INTEGER NOT NULL,
  name TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS mirror_directories_parent_name ON mirror_directories(parent_id, name);

CREATE TABLE IF NOT EXISTS mirror_files (
  id INTEGER NOT NULL,
  name TEXT NOT NULL,
  type TEXT NOT NULL,
  size INTEGER NOT NULL,
  mod_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS mirror_files_id ON mirror_files(id);

CREATE TABLE IF NOT EXISTS increment_directories (
  id INTEGER PRIMARY KEY,
  timestamp INTEGER NOT NULL,
  parent_id INTEGER NOT NULL,
  name TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS increment_directories_timestamp ON increment_directories(timestamp);
CREATE INDEX IF NOT EXISTS increment_directories_parent_name
  ON increment_directories(timestamp, parent_id, name);

CREATE TABLE IF NOT EXISTS increment_files (
  id INTEGER NOT NULL,
  name TEXT NOT NULL,
  type TEXT NOT NULL,
  size INTEGER NOT NULL,
  mod_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS increment_files_id ON increment_files(id);
"#;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataLayer : Send + Sync {
    ///
    /// Gets the epoch seconds of the mirror currently indexed, if any
    ///
    async fn get_mirror_timestamp(&self) -> Result<Option<i64>>;
    ///
    /// Gets the epoch seconds of every indexed increment
    ///
    async fn get_increment_timestamps(&self) -> Result<Vec<i64>>;
    async fn insert_mirror_timestamp(&self, ts: i64) -> Result<()>;
    async fn insert_increment_timestamp(&self, ts: i64) -> Result<()>;
    ///
    /// Removes the mirror's files, directories and timestamp.
    /// Returns the number of rows deleted.
    ///
    async fn delete_mirror(&self) -> Result<u64>;
    ///
    /// Removes the increment taken at `ts`: files first, then the
    /// directories they reference, then its timestamp.
    /// Returns the number of rows deleted.
    ///
    async fn delete_increment(&self, ts: i64) -> Result<u64>;
    ///
    /// Creates the root directory row of `scope` and returns its ID
    ///
    async fn create_root_dir(&self, scope: DirScope) -> Result<i64>;
    async fn get_root_dir(&self, scope: DirScope) -> Result<Option<i64>>;
    ///
    /// Retrieves the ID of the directory `name` under `parent_id`
    ///
    async fn get_dir(&self, scope: DirScope, parent_id: i64, name: &str) -> Result<Option<i64>>;
    ///
    /// Creates a directory with the provided `name` under `parent_id`
    ///
    async fn create_dir(&self, scope: DirScope, parent_id: i64, name: &str) -> Result<i64>;
    ///
    /// Inserts a file row owned by the directory `dir_id`. Returns the
    /// number of rows affected.
    ///
    async fn insert_file(&self, scope: DirScope, dir_id: i64, file: &FileModel) -> Result<u64>;
    ///
    /// Gets all file rows owned by the directory `dir_id`
    ///
    async fn get_dir_files(&self, scope: DirScope, dir_id: i64) -> Result<Vec<FileModel>>;
    async fn begin_batch(&self) -> Result<()>;
    async fn commit_batch(&self) -> Result<()>;
    async fn rollback_batch(&self) -> Result<()>;
    ///
    /// Reclaims the space freed by deletions
    ///
    async fn compact(&self) -> Result<()>;
}

///
/// SQLite-backed `DataLayer`. The pool holds exactly one connection for its
/// whole lifetime, which keeps the exclusive file lock and lets raw
/// `BEGIN`/`COMMIT` statements span several calls.
///
pub struct DbDataLayer {
    db: SqlitePool,
}

impl DbDataLayer {
    ///
    /// Opens (creating if missing) the store at `path` and takes an exclusive
    /// lock on it. Fails with `StoreLocked` if another process holds it.
    ///
    pub async fn open(path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .locking_mode(SqliteLockingMode::Exclusive)
            .busy_timeout(Duration::ZERO);

        let data_layer = Self::connect(opts, path).await?;
        info!(?path, "opened index store");
        Ok(data_layer)
    }

    pub async fn in_memory() -> Result<Self> {
        let path = Path::new(":memory:");
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DataLayerError::from_open(path.to_path_buf(), e))?;
        Self::connect(opts, path).await
    }

    async fn connect(opts: SqliteConnectOptions, path: &Path) -> Result<Self> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| DataLayerError::from_open(path.to_path_buf(), e))?;

        sqlx::query("BEGIN EXCLUSIVE").execute(&db).await
            .map_err(|e| DataLayerError::from_open(path.to_path_buf(), e))?;
        sqlx::query(SCHEMA).execute(&db).await?;
        sqlx::query("COMMIT").execute(&db).await?;

        Ok(Self { db })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.db
    }
}

#[async_trait]
impl DataLayer for DbDataLayer {
    async fn get_mirror_timestamp(&self) -> Result<Option<i64>> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT timestamp FROM mirror_timestamp LIMIT 1")
            .fetch_optional(&self.db).await?)
    }
    async fn get_increment_timestamps(&self) -> Result<Vec<i64>> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT timestamp FROM increment_timestamps ORDER BY timestamp DESC",
        )
        .fetch_all(&self.db)
        .await?)
    }
    async fn insert_mirror_timestamp(&self, ts: i64) -> Result<()> {
        sqlx::query("DELETE FROM mirror_timestamp").execute(&self.db).await?;
        sqlx::query("INSERT INTO mirror_timestamp (timestamp) VALUES (?)")
            .bind(ts).execute(&self.db).await?;
        Ok(())
    }
    async fn insert_increment_timestamp(&self, ts: i64) -> Result<()> {
        sqlx::query("INSERT INTO increment_timestamps (timestamp) VALUES (?)")
            .bind(ts).execute(&self.db).await?;
        Ok(())
    }
    async fn delete_mirror(&self) -> Result<u64> {
        let mut deleted = 0;
        for stmt in [
            "DELETE FROM mirror_files",
            "DELETE FROM mirror_directories",
            "DELETE FROM mirror_timestamp",
        ] {
            deleted += sqlx::query(stmt).execute(&self.db).await?.rows_affected();
        }
        Ok(deleted)
    }
    async fn delete_increment(&self, ts: i64) -> Result<u64> {
        let mut deleted = sqlx::query(
            "DELETE FROM increment_files \
             WHERE id IN (SELECT id FROM increment_directories WHERE timestamp = ?)",
        )
        .bind(ts)
        .execute(&self.db)
        .await?
        .rows_affected();
        deleted += sqlx::query("DELETE FROM increment_directories WHERE timestamp = ?")
            .bind(ts).execute(&self.db).await?.rows_affected();
        deleted += sqlx::query("DELETE FROM increment_timestamps WHERE timestamp = ?")
            .bind(ts).execute(&self.db).await?.rows_affected();
        Ok(deleted)
    }
    async fn create_root_dir(&self, scope: DirScope) -> Result<i64> {
        Ok(match scope {
            DirScope::Mirror => {
                sqlx::query(
                    "INSERT INTO mirror_directories (id, parent_id, name) VALUES (?, 0, '')",
                )
                .bind(MIRROR_ROOT_ID)
                .execute(&self.db)
                .await?;
                MIRROR_ROOT_ID
            }
            DirScope::Increment(ts) => {
                sqlx::query(
                    "INSERT INTO increment_directories (timestamp, parent_id, name) \
                     VALUES (?, 0, '')",
                )
                .bind(ts)
                .execute(&self.db)
                .await?
                .last_insert_rowid()
            }
        })
    }
    async fn get_root_dir(&self, scope: DirScope) -> Result<Option<i64>> {
        self.get_dir(scope, 0, "").await
    }
    async fn get_dir(&self, scope: DirScope, parent_id: i64, name: &str) -> Result<Option<i64>> {
        let query = match scope {
            DirScope::Mirror => sqlx::query_scalar::<Sqlite, i64>(
                "SELECT id FROM mirror_directories WHERE parent_id = ? AND name = ?"
            ),
            DirScope::Increment(ts) => sqlx::query_scalar::<Sqlite, i64>(
                "SELECT id FROM increment_directories \
                 WHERE timestamp = ? AND parent_id = ? AND name = ?"
            ).bind(ts),
        };
        Ok(query.bind(parent_id).bind(name).fetch_optional(&self.db).await?)
    }
    async fn create_dir(&self, scope: DirScope, parent_id: i64, name: &str) -> Result<i64> {
        let query = match scope {
            DirScope::Mirror => sqlx::query::<Sqlite>(
                "INSERT INTO mirror_directories (parent_id, name) VALUES (?, ?)"
            ),
            DirScope::Increment(ts) => sqlx::query::<Sqlite>(
                "INSERT INTO increment_directories (timestamp, parent_id, name) VALUES (?, ?, ?)"
            ).bind(ts),
        };
        Ok(query.bind(parent_id).bind(name).execute(&self.db).await?.last_insert_rowid())
    }
    async fn insert_file(&self, scope: DirScope, dir_id: i64, file: &FileModel) -> Result<u64> {
        let stmt = match scope {
            DirScope::Mirror =>
                "INSERT INTO mirror_files (id, name, type, size, mod_time) VALUES (?, ?, ?, ?, ?)",
            DirScope::Increment(_) =>
                "INSERT INTO increment_files (id, name, type, size, mod_time) \
                 VALUES (?, ?, ?, ?, ?)",
        };
        Ok(sqlx::query(stmt)
            .bind(dir_id)
            .bind(&file.name)
            .bind(&file.file_type)
            .bind(file.size)
            .bind(file.mod_time)
            .execute(&self.db).await?.rows_affected())
    }
    async fn get_dir_files(&self, scope: DirScope, dir_id: i64) -> Result<Vec<FileModel>> {
        let stmt = match scope {
            DirScope::Mirror =>
                "SELECT name, type AS file_type, size, mod_time FROM mirror_files WHERE id = ?",
            DirScope::Increment(_) =>
                "SELECT name, type AS file_type, size, mod_time FROM increment_files WHERE id = ?",
        };
        Ok(sqlx::query_as::<_, FileModel>(stmt).bind(dir_id).fetch_all(&self.db).await?)
    }
    async fn begin_batch(&self) -> Result<()> {
        sqlx::query("BEGIN").execute(&self.db).await?;
        Ok(())
    }
    async fn commit_batch(&self) -> Result<()> {
        sqlx::query("COMMIT").execute(&self.db).await?;
        Ok(())
    }
    async fn rollback_batch(&self) -> Result<()> {
        sqlx::query("ROLLBACK").execute(&self.db).await?;
        Ok(())
    }
    async fn compact(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, file_type: &str, size: i64) -> FileModel {
        FileModel { name: name.into(), file_type: file_type.into(), size, mod_time: 7 }
    }

    #[tokio::test]
    async fn test_mirror_root_has_conventional_id() {
        let dl = DbDataLayer::in_memory().await.unwrap();
        assert_eq!(dl.create_root_dir(DirScope::Mirror).await.unwrap(), MIRROR_ROOT_ID);
        assert_eq!(dl.get_root_dir(DirScope::Mirror).await.unwrap(), Some(MIRROR_ROOT_ID));
        assert_eq!(dl.get_root_dir(DirScope::Increment(5)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_directories_are_scoped_per_increment() {
        let dl = DbDataLayer::in_memory().await.unwrap();
        let root_a = dl.create_root_dir(DirScope::Increment(100)).await.unwrap();
        let root_b = dl.create_root_dir(DirScope::Increment(200)).await.unwrap();
        let a = dl.create_dir(DirScope::Increment(100), root_a, "docs").await.unwrap();

        assert_eq!(dl.get_dir(DirScope::Increment(100), root_a, "docs").await.unwrap(), Some(a));
        assert_eq!(dl.get_dir(DirScope::Increment(200), root_b, "docs").await.unwrap(), None);
        assert_eq!(dl.get_dir(DirScope::Mirror, root_a, "docs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_rows_round_trip_type_column() {
        let dl = DbDataLayer::in_memory().await.unwrap();
        let root = dl.create_root_dir(DirScope::Mirror).await.unwrap();
        assert_eq!(dl.insert_file(DirScope::Mirror, root, &file("x", "reg", 10)).await.unwrap(), 1);
        assert_eq!(dl.get_dir_files(DirScope::Mirror, root).await.unwrap(), vec![file("x", "reg", 10)]);
        assert!(dl.get_dir_files(DirScope::Increment(1), root).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_increment_leaves_no_dangling_files() {
        let dl = DbDataLayer::in_memory().await.unwrap();
        for ts in [100, 200] {
            dl.insert_increment_timestamp(ts).await.unwrap();
            let root = dl.create_root_dir(DirScope::Increment(ts)).await.unwrap();
            let sub = dl.create_dir(DirScope::Increment(ts), root, "a").await.unwrap();
            dl.insert_file(DirScope::Increment(ts), root, &file("a", "dir", 0)).await.unwrap();
            dl.insert_file(DirScope::Increment(ts), sub, &file("x", "None", 0)).await.unwrap();
        }

        assert_eq!(dl.delete_increment(100).await.unwrap(), 2 + 2 + 1);
        assert_eq!(dl.get_increment_timestamps().await.unwrap(), vec![200]);

        let dangling: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM increment_files WHERE id NOT IN (SELECT id FROM increment_directories)"
        ).fetch_one(dl.pool()).await.unwrap();
        assert_eq!(dangling, 0);
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM increment_files")
            .fetch_one(dl.pool()).await.unwrap();
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn test_rollback_discards_batch() {
        let dl = DbDataLayer::in_memory().await.unwrap();
        dl.begin_batch().await.unwrap();
        dl.insert_mirror_timestamp(42).await.unwrap();
        dl.rollback_batch().await.unwrap();
        assert_eq!(dl.get_mirror_timestamp().await.unwrap(), None);

        dl.begin_batch().await.unwrap();
        dl.insert_mirror_timestamp(43).await.unwrap();
        dl.commit_batch().await.unwrap();
        dl.compact().await.unwrap();
        assert_eq!(dl.get_mirror_timestamp().await.unwrap(), Some(43));
    }

    #[tokio::test]
    async fn test_second_open_reports_locked_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let _held = DbDataLayer::open(&path).await.unwrap();

        match DbDataLayer::open(&path).await {
            Err(DataLayerError::StoreLocked(p)) => assert_eq!(p, path),
            Err(other) => panic!("expected StoreLocked, got {other:?}"),
            Ok(_) => panic!("expected StoreLocked, got an open store"),
        }
    }
}
