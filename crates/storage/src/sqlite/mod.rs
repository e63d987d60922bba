use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use snafu::{ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, SqliteConnection};

use super::backend::KeyValueBackend;
use super::error::{
    CreateDirectorySnafu, InvariantViolationSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu,
    StorageResult,
};

/// Key/value backend on a single sqlite table. Each write is one UPSERT statement.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    connect_options: SqliteConnectOptions,
    database_url: String,
}

impl SqliteBackend {
    pub fn open(database_location: &str) -> StorageResult<Self> {
        // Every call opens its own connection, so a private in-memory database would vanish.
        ensure!(
            database_location != ":memory:" && !database_location.contains(":memory:"),
            InvariantViolationSnafu {
                stage: "sqlite-open-validate-location",
                details: "in-memory sqlite is not supported; use the memory backend".to_string(),
            }
        );
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let backend = Self {
            connect_options,
            database_url,
        };

        let options = backend.connect_options.clone();
        let database_url = backend.database_url.clone();
        backend.run_db_call("sqlite-open-migrate", async move {
            let mut connection = connect(&options, &database_url, "sqlite-open-connect").await?;
            sqlx::migrate!("./migrations")
                .run_direct(&mut connection)
                .await
                .context(SqliteMigrateSnafu {
                    stage: "sqlite-open-migrate",
                })
        })?;

        tracing::debug!(database_url = %backend.database_url, "sqlite key/value backend ready");
        Ok(backend)
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // The backend trait is sync, so each call runs on a dedicated thread with its own
        // current-thread runtime; blocking inside the caller's runtime would panic.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-kv-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-kv-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-kv-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite key/value worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl KeyValueBackend for SqliteBackend {
    fn read(&self, key: &str) -> StorageResult<Option<String>> {
        let options = self.connect_options.clone();
        let database_url = self.database_url.clone();
        let key = key.to_string();

        self.run_db_call("sqlite-kv-read", async move {
            let mut connection = connect(&options, &database_url, "sqlite-kv-read-connect").await?;
            sqlx::query_scalar::<_, String>("SELECT value FROM kv_entries WHERE key = ?1")
                .bind(key)
                .fetch_optional(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-kv-read",
                })
        })
    }

    fn write(&self, key: &str, value: &str) -> StorageResult<()> {
        let options = self.connect_options.clone();
        let database_url = self.database_url.clone();
        let key = key.to_string();
        let value = value.to_string();

        self.run_db_call("sqlite-kv-write", async move {
            let mut connection =
                connect(&options, &database_url, "sqlite-kv-write-connect").await?;
            sqlx::query(
                "INSERT INTO kv_entries (key, value, updated_at_unix_seconds) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET \
                 value = excluded.value, updated_at_unix_seconds = excluded.updated_at_unix_seconds",
            )
            .bind(key)
            .bind(value)
            .bind(unix_timestamp_seconds())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "sqlite-kv-write",
            })?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let options = self.connect_options.clone();
        let database_url = self.database_url.clone();
        let key = key.to_string();

        self.run_db_call("sqlite-kv-remove", async move {
            let mut connection =
                connect(&options, &database_url, "sqlite-kv-remove-connect").await?;
            sqlx::query("DELETE FROM kv_entries WHERE key = ?1")
                .bind(key)
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sqlite-kv-remove",
                })?;
            Ok(())
        })
    }
}

async fn connect(
    options: &SqliteConnectOptions,
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    options.connect().await.context(SqliteConnectSnafu {
        stage,
        database_url: database_url.to_string(),
    })
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as i64)
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[test]
    fn upsert_replaces_previous_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let location = dir.path().join("store/hearth.db");
        let backend = SqliteBackend::open(&location.display().to_string()).expect("open");

        assert_eq!(backend.read("hearth.history").expect("read"), None);
        backend.write("hearth.history", "{\"first\":true}").expect("write");
        backend.write("hearth.history", "{}").expect("overwrite");
        assert_eq!(
            backend.read("hearth.history").expect("read").as_deref(),
            Some("{}")
        );

        backend.remove("hearth.history").expect("remove");
        assert_eq!(backend.read("hearth.history").expect("read"), None);
    }

    #[test]
    fn reopening_keeps_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let location = dir.path().join("hearth.db").display().to_string();

        SqliteBackend::open(&location)
            .expect("open")
            .write("k", "v")
            .expect("write");
        let reopened = SqliteBackend::open(&location).expect("reopen");
        assert_eq!(reopened.read("k").expect("read").as_deref(), Some("v"));
    }

    #[test]
    fn in_memory_location_is_rejected() {
        let error = SqliteBackend::open(":memory:").unwrap_err();
        assert!(matches!(error, StorageError::InvariantViolation { .. }));
    }

    #[test]
    fn plain_paths_become_sqlite_urls() {
        assert_eq!(normalize_database_url("a/b.db"), "sqlite://a/b.db");
        assert_eq!(normalize_database_url("sqlite://c.db"), "sqlite://c.db");
    }
}
