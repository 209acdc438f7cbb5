//! Sqlite persistence layer.
//!
//! A [`Db`] is a cheap-to-clone handle around one database file. Each call
//! opens a fresh auto-committing connection; writes are serialized behind a
//! process-wide mutex owned by the handle, and every statement retries a
//! bounded number of times when the file is locked by another process.
//! Schema management is forward-only migrations keyed on `PRAGMA
//! user_version`, run once per handle on first use.

use std::sync::Arc;

use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{ConnectOptions, Connection, Row};
use tokio::sync::{Mutex, OnceCell};

use crate::error::{Error, Result};

/// Oldest runtime the scheduler works with: `json_set`/`json_extract` need
/// the JSON1 functions shipped since 3.24.
const MIN_SQLITE_VERSION: (u32, u32) = (3, 24);
/// `UPDATE … RETURNING` landed in 3.35; older runtimes use the `_tx` marker
/// fallback in the pool.
const RETURNING_SINCE: (u32, u32) = (3, 35);

const LOCK_RETRIES: u32 = 5;

/// A single bind value. SQL text is owned by call sites; values always go
/// through binds.
#[derive(Clone, Debug)]
pub enum SqlArg {
    Text(String),
    Int(i64),
    Bool(bool),
    Null,
}

impl From<&str> for SqlArg {
    fn from(v: &str) -> Self {
        SqlArg::Text(v.to_string())
    }
}

impl From<String> for SqlArg {
    fn from(v: String) -> Self {
        SqlArg::Text(v)
    }
}

impl From<&String> for SqlArg {
    fn from(v: &String) -> Self {
        SqlArg::Text(v.clone())
    }
}

impl From<i64> for SqlArg {
    fn from(v: i64) -> Self {
        SqlArg::Int(v)
    }
}

impl From<bool> for SqlArg {
    fn from(v: bool) -> Self {
        SqlArg::Bool(v)
    }
}

impl<T> From<Option<T>> for SqlArg
where
    T: Into<SqlArg>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(x) => x.into(),
            None => SqlArg::Null,
        }
    }
}

/// Builds a `Vec<SqlArg>` from mixed value types.
#[macro_export]
macro_rules! params {
    () => { Vec::<$crate::db::SqlArg>::new() };
    ($($x:expr),+ $(,)?) => { vec![$($crate::db::SqlArg::from($x)),+] };
}

fn bind_args<'q>(
    sql: &'q str,
    args: &'q [SqlArg],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    let mut q = sqlx::query(sql);
    for arg in args {
        q = match arg {
            SqlArg::Text(v) => q.bind(v.as_str()),
            SqlArg::Int(v) => q.bind(*v),
            SqlArg::Bool(v) => q.bind(*v),
            SqlArg::Null => q.bind(Option::<String>::None),
        };
    }
    q
}

fn is_locked(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(d) if d.message().contains("database is locked"))
}

fn is_duplicate_column(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(d) if d.message().contains("duplicate column name"))
}

struct DbInner {
    path: String,
    write_lock: Mutex<()>,
    init: OnceCell<bool>, // holds "supports RETURNING" once migrated
}

#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DbInner {
                path: path.into(),
                write_lock: Mutex::new(()),
                init: OnceCell::new(),
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    async fn connect(&self) -> Result<SqliteConnection> {
        let opts = SqliteConnectOptions::new()
            .filename(&self.inner.path)
            .create_if_missing(true)
            .disable_statement_logging();
        Ok(opts.connect().await?)
    }

    /// Runtime version gate + one-shot migrations. Returns whether the
    /// runtime supports `UPDATE … RETURNING`.
    async fn init(&self) -> Result<bool> {
        let res = self
            .inner
            .init
            .get_or_try_init(|| async move {
                let mut conn = self.connect().await?;
                let version = sqlite_version(&mut conn).await?;
                if version < MIN_SQLITE_VERSION {
                    return Err(Error::SqliteTooOld(format!(
                        "{}.{}",
                        version.0, version.1
                    )));
                }
                migrate(&mut conn).await?;
                conn.close().await.map_err(Error::Database)?;
                Ok(version >= RETURNING_SINCE)
            })
            .await?;
        Ok(*res)
    }

    /// Whether the atomic lease can use a returning clause (see
    /// [`crate::AccountsPool`]).
    pub async fn supports_returning(&self) -> Result<bool> {
        self.init().await
    }

    async fn retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(Error::Database(e)) if is_locked(&e) && attempt + 1 < LOCK_RETRIES => {
                    attempt += 1;
                    let delay = rand::thread_rng().gen_range(0.5..1.0);
                    log::debug!(
                        "database is locked, retrying in {delay:.2}s ({attempt}/{LOCK_RETRIES})"
                    );
                    tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                }
                other => return other,
            }
        }
    }

    /// Runs one statement, returns affected rows.
    pub async fn execute(&self, sql: &str, args: Vec<SqlArg>) -> Result<u64> {
        self.init().await?;
        let _guard = self.inner.write_lock.lock().await;
        let args = &args;
        self.retry(|| async move {
            let mut conn = self.connect().await?;
            let done = bind_args(sql, args).execute(&mut conn).await?;
            conn.close().await?;
            Ok(done.rows_affected())
        })
        .await
    }

    /// Runs one statement per args row inside a single connection.
    pub async fn execute_many(&self, sql: &str, args_list: Vec<Vec<SqlArg>>) -> Result<()> {
        self.init().await?;
        let _guard = self.inner.write_lock.lock().await;
        let args_list = &args_list;
        self.retry(|| async move {
            let mut conn = self.connect().await?;
            for args in args_list {
                bind_args(sql, args).execute(&mut conn).await?;
            }
            conn.close().await?;
            Ok(())
        })
        .await
    }

    /// Runs a mutating statement that hands back a row (`UPDATE … RETURNING`).
    /// Write-guarded like [`Self::execute`].
    pub async fn execute_returning(
        &self,
        sql: &str,
        args: Vec<SqlArg>,
    ) -> Result<Option<SqliteRow>> {
        self.init().await?;
        let _guard = self.inner.write_lock.lock().await;
        let args = &args;
        self.retry(|| async move {
            let mut conn = self.connect().await?;
            let row = bind_args(sql, args).fetch_optional(&mut conn).await?;
            conn.close().await?;
            Ok(row)
        })
        .await
    }

    pub async fn fetch_one(&self, sql: &str, args: Vec<SqlArg>) -> Result<Option<SqliteRow>> {
        self.init().await?;
        let args = &args;
        self.retry(|| async move {
            let mut conn = self.connect().await?;
            let row = bind_args(sql, args).fetch_optional(&mut conn).await?;
            conn.close().await?;
            Ok(row)
        })
        .await
    }

    pub async fn fetch_all(&self, sql: &str, args: Vec<SqlArg>) -> Result<Vec<SqliteRow>> {
        self.init().await?;
        let args = &args;
        self.retry(|| async move {
            let mut conn = self.connect().await?;
            let rows = bind_args(sql, args).fetch_all(&mut conn).await?;
            conn.close().await?;
            Ok(rows)
        })
        .await
    }

    /// Reported runtime version, e.g. `3.45.1`.
    pub async fn sqlite_version(&self) -> Result<String> {
        let mut conn = self.connect().await?;
        let v: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&mut conn)
            .await?;
        conn.close().await?;
        Ok(v)
    }
}

async fn sqlite_version(conn: &mut SqliteConnection) -> Result<(u32, u32)> {
    let v: String = sqlx::query_scalar("SELECT sqlite_version()")
        .fetch_one(&mut *conn)
        .await?;
    let mut parts = v.split('.');
    let major = parts.next().and_then(|x| x.parse().ok()).unwrap_or(3);
    let minor = parts.next().and_then(|x| x.parse().ok()).unwrap_or(0);
    Ok((major, minor))
}

/// Forward-only migrations. Each entry is either a table creation or an
/// additive column; re-running an additive step on an existing column is
/// harmless.
const MIGRATIONS: &[&[&str]] = &[
    // v1
    &["CREATE TABLE IF NOT EXISTS accounts (
        username TEXT PRIMARY KEY NOT NULL COLLATE NOCASE,
        password TEXT NOT NULL,
        email TEXT NOT NULL COLLATE NOCASE,
        email_password TEXT NOT NULL,
        user_agent TEXT NOT NULL,
        active BOOLEAN DEFAULT FALSE NOT NULL,
        locks TEXT DEFAULT '{}' NOT NULL,
        headers TEXT DEFAULT '{}' NOT NULL,
        cookies TEXT DEFAULT '{}' NOT NULL,
        proxy TEXT DEFAULT NULL,
        error_msg TEXT DEFAULT NULL
    )"],
    // v2
    &[
        "ALTER TABLE accounts ADD COLUMN stats TEXT DEFAULT '{}' NOT NULL",
        "ALTER TABLE accounts ADD COLUMN last_used TEXT DEFAULT NULL",
    ],
    // v3
    &["ALTER TABLE accounts ADD COLUMN _tx TEXT DEFAULT NULL"],
    // v4
    &["ALTER TABLE accounts ADD COLUMN mfa_code TEXT DEFAULT NULL"],
];

async fn migrate(conn: &mut SqliteConnection) -> Result<()> {
    let row = sqlx::query("PRAGMA user_version").fetch_one(&mut *conn).await?;
    let current: i64 = row.try_get(0)?;

    for (idx, stmts) in MIGRATIONS.iter().enumerate() {
        let target = (idx + 1) as i64;
        if target <= current {
            continue;
        }

        log::info!("running migration to v{target}");
        for sql in *stmts {
            if let Err(e) = sqlx::query(sql).execute(&mut *conn).await {
                if !is_duplicate_column(&e) {
                    return Err(e.into());
                }
            }
        }
        sqlx::query(&format!("PRAGMA user_version = {target}"))
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) fn temp_db_path(name: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir()
        .join(format!("tws_test_{name}_{ts}.db"))
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let path = temp_db_path("migrate");
        let db = Db::new(&path);
        db.execute("SELECT 1", params![]).await.unwrap();

        let row = db.fetch_one("PRAGMA user_version", params![]).await.unwrap().unwrap();
        let v1: i64 = row.try_get(0).unwrap();
        assert_eq!(v1 as usize, MIGRATIONS.len());

        // a fresh handle over the same file re-runs the ladder without effect
        let db2 = Db::new(&path);
        db2.execute("SELECT 1", params![]).await.unwrap();
        let row = db2.fetch_one("PRAGMA user_version", params![]).await.unwrap().unwrap();
        let v2: i64 = row.try_get(0).unwrap();
        assert_eq!(v1, v2);

        let cols = db2
            .fetch_all("SELECT name FROM pragma_table_info('accounts')", params![])
            .await
            .unwrap();
        let names: Vec<String> = cols.iter().map(|r| r.get::<String, _>(0)).collect();
        for expect in ["username", "stats", "last_used", "_tx", "mfa_code"] {
            assert!(names.iter().any(|n| n == expect), "missing column {expect}");
        }

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn binds_and_rows_round_trip() {
        let path = temp_db_path("binds");
        let db = Db::new(&path);

        db.execute(
            "INSERT INTO accounts (username, password, email, email_password, user_agent) \
             VALUES (?, ?, ?, ?, ?)",
            params!["u1", "p1", "e1", "ep1", "ua"],
        )
        .await
        .unwrap();

        let row = db
            .fetch_one("SELECT email, active FROM accounts WHERE username = ?", params!["u1"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get::<String, _>(0), "e1");
        assert!(!row.get::<bool, _>(1));

        db.execute_many(
            "UPDATE accounts SET proxy = ? WHERE username = ?",
            vec![params![Some("socks5://x"), "u1"], params![Option::<String>::None, "u1"]],
        )
        .await
        .unwrap();

        let rows = db.fetch_all("SELECT username FROM accounts", params![]).await.unwrap();
        assert_eq!(rows.len(), 1);

        let _ = std::fs::remove_file(&path);
    }
}
