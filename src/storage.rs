use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Durable home for the single signed-in session. Reads and writes go
/// through one connection; `save_session` replaces all three fields in a
/// single statement so a concurrent reader never observes a torn session.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", &"WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", &5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn save_session(&self, session: &StoredSession) -> Result<()> {
        if session.access_token.is_empty() {
            anyhow::bail!("storage: access token required");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO session (id, access_token, refresh_token, expires_at)
VALUES (1, ?1, ?2, ?3)
ON CONFLICT(id) DO UPDATE SET
  access_token = excluded.access_token,
  refresh_token = excluded.refresh_token,
  expires_at = excluded.expires_at
"#,
            params![
                session.access_token,
                session.refresh_token,
                session.expires_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn load_session(&self) -> Result<Option<StoredSession>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT access_token, refresh_token, expires_at
FROM session
WHERE id = 1
"#,
            [],
            session_from_row,
        )
        .optional()
        .context("storage: query session")
    }

    pub fn clear_session(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM session WHERE id = 1", [])?;
        Ok(())
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<StoredSession> {
    let expires: i64 = row.get(2)?;
    Ok(StoredSession {
        access_token: row.get(0)?,
        refresh_token: row.get(1)?,
        expires_at: Utc
            .timestamp_millis_opt(expires)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS session (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  access_token TEXT NOT NULL,
  refresh_token TEXT,
  expires_at INTEGER NOT NULL
);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("orangered").join("state.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> Store {
        Store::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap()
    }

    #[test]
    fn open_creates_database() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        assert!(dir.path().join("state.db").exists());
        store.close().unwrap();
    }

    #[test]
    fn session_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        assert!(store.load_session().unwrap().is_none());

        let session = StoredSession {
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
            expires_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        };
        store.save_session(&session).unwrap();
        assert_eq!(store.load_session().unwrap(), Some(session));
    }

    #[test]
    fn save_replaces_all_fields() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store
            .save_session(&StoredSession {
                access_token: "first".into(),
                refresh_token: Some("stale".into()),
                expires_at: Utc.timestamp_millis_opt(1_000).unwrap(),
            })
            .unwrap();
        store
            .save_session(&StoredSession {
                access_token: "second".into(),
                refresh_token: None,
                expires_at: Utc.timestamp_millis_opt(2_000).unwrap(),
            })
            .unwrap();

        let loaded = store.load_session().unwrap().unwrap();
        assert_eq!(loaded.access_token, "second");
        assert_eq!(loaded.refresh_token, None);
        assert_eq!(loaded.expires_at.timestamp_millis(), 2_000);
    }

    #[test]
    fn clear_removes_session() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store
            .save_session(&StoredSession {
                access_token: "access".into(),
                refresh_token: None,
                expires_at: Utc::now(),
            })
            .unwrap();
        store.clear_session().unwrap();
        assert!(store.load_session().unwrap().is_none());
    }
}
