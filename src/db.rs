//! The persistent database: historical rusage, success timestamps,
//! throttle info, and batch/log records (§1 external collaborator, §6
//! database schema, §9 SUPPLEMENT). Modeled on the teacher's
//! `bin/server/db` module — one file's worth of queries behind a trait,
//! with `sqlx`/SQLite behind the `database` feature and a no-op fallback
//! when it's compiled out or unconfigured.

use std::collections::HashMap;

use color_eyre::eyre::Result;
use time::OffsetDateTime;

use crate::{Pkgbase, Rusage};

#[async_trait::async_trait]
pub trait Database: Send + Sync {
    async fn get_pkgs_last_rusage(&self, pkgs: &[Pkgbase]) -> Result<HashMap<Pkgbase, Rusage>>;
    async fn get_pkgs_last_success_times(&self, pkgs: &[Pkgbase]) -> Result<HashMap<Pkgbase, OffsetDateTime>>;
    async fn get_update_on_build_vers(&self, items: &[Pkgbase]) -> Result<Vec<(String, String)>>;
    async fn is_last_build_failed(&self, pkgbase: &Pkgbase) -> Result<bool>;

    async fn record_pkgcurrent(&self, rows: &[PkgCurrentRow]) -> Result<()>;
    async fn append_pkglog(&self, row: &PkgLogRow) -> Result<()>;
    async fn record_batch_event(&self, event: BatchEvent, logdir: Option<&str>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    Start,
    Stop,
}

/// One row of `pkgcurrent`, rewritten every batch.
#[derive(Debug, Clone)]
pub struct PkgCurrentRow {
    pub pkgbase: Pkgbase,
    pub index: i64,
    pub status: PkgStatus,
    pub build_reasons: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PkgStatus {
    Pending,
    Building,
    Done,
}

/// One row appended to `pkglog` per build attempt.
#[derive(Debug, Clone)]
pub struct PkgLogRow {
    pub pkgbase: Pkgbase,
    pub nv_version: Option<String>,
    pub pkg_version: Option<String>,
    pub elapsed_secs: f64,
    pub result: String,
    pub cputime_secs: Option<f64>,
    pub memory: Option<i64>,
    pub msg: String,
    pub build_reasons: String,
    pub maintainers: String,
}

/// No-op implementation used when the `database` feature is disabled or
/// the batch was run without a configured `dburl`.
pub struct NullDatabase;

#[async_trait::async_trait]
impl Database for NullDatabase {
    async fn get_pkgs_last_rusage(&self, _pkgs: &[Pkgbase]) -> Result<HashMap<Pkgbase, Rusage>> {
        Ok(HashMap::new())
    }

    async fn get_pkgs_last_success_times(&self, _pkgs: &[Pkgbase]) -> Result<HashMap<Pkgbase, OffsetDateTime>> {
        Ok(HashMap::new())
    }

    async fn get_update_on_build_vers(&self, _items: &[Pkgbase]) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    async fn is_last_build_failed(&self, _pkgbase: &Pkgbase) -> Result<bool> {
        Ok(false)
    }

    async fn record_pkgcurrent(&self, _rows: &[PkgCurrentRow]) -> Result<()> {
        Ok(())
    }

    async fn append_pkglog(&self, _row: &PkgLogRow) -> Result<()> {
        Ok(())
    }

    async fn record_batch_event(&self, _event: BatchEvent, _logdir: Option<&str>) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "database")]
pub mod sqlite {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
    use sqlx::Row;
    use std::str::FromStr;

    static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

    pub struct SqliteDatabase {
        pool: SqlitePool,
    }

    impl SqliteDatabase {
        pub async fn connect(url: &str) -> Result<Self> {
            let opts = SqliteConnectOptions::from_str(url)?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
            let pool = SqlitePoolOptions::new().connect_with(opts).await?;
            MIGRATOR.run(&pool).await?;
            Ok(Self { pool })
        }
    }

    #[async_trait::async_trait]
    impl Database for SqliteDatabase {
        async fn get_pkgs_last_rusage(&self, pkgs: &[Pkgbase]) -> Result<HashMap<Pkgbase, Rusage>> {
            let mut out = HashMap::new();
            for pkg in pkgs {
                let row = sqlx::query(
                    "SELECT cputime, memory, elapsed FROM pkglog \
                     WHERE pkgbase = ? ORDER BY rowid DESC LIMIT 1",
                )
                .bind(pkg.as_ref())
                .fetch_optional(&self.pool)
                .await?;
                if let Some(row) = row {
                    let cputime: f64 = row.try_get("cputime").unwrap_or(0.0);
                    let memory: i64 = row.try_get("memory").unwrap_or(0);
                    let elapsed: f64 = row.try_get("elapsed").unwrap_or(0.0);
                    out.insert(
                        pkg.clone(),
                        Rusage {
                            cputime: std::time::Duration::from_secs_f64(cputime.max(0.0)),
                            elapsed: std::time::Duration::from_secs_f64(elapsed.max(0.0)),
                            memory: memory.max(0) as u64,
                        },
                    );
                }
            }
            Ok(out)
        }

        async fn get_pkgs_last_success_times(&self, pkgs: &[Pkgbase]) -> Result<HashMap<Pkgbase, OffsetDateTime>> {
            let mut out = HashMap::new();
            for pkg in pkgs {
                let row = sqlx::query(
                    "SELECT ts FROM pkglog WHERE pkgbase = ? AND result = 'successful' \
                     ORDER BY rowid DESC LIMIT 1",
                )
                .bind(pkg.as_ref())
                .fetch_optional(&self.pool)
                .await?;
                if let Some(row) = row {
                    let ts: i64 = row.try_get("ts").unwrap_or(0);
                    if let Ok(ts) = OffsetDateTime::from_unix_timestamp(ts) {
                        out.insert(pkg.clone(), ts);
                    }
                }
            }
            Ok(out)
        }

        async fn get_update_on_build_vers(&self, items: &[Pkgbase]) -> Result<Vec<(String, String)>> {
            let mut out = Vec::new();
            for item in items {
                let row = sqlx::query(
                    "SELECT pkg_version FROM pkglog WHERE pkgbase = ? \
                     ORDER BY rowid DESC LIMIT 1",
                )
                .bind(item.as_ref())
                .fetch_optional(&self.pool)
                .await?;
                let version: String = row
                    .and_then(|r| r.try_get("pkg_version").ok())
                    .unwrap_or_default();
                out.push((version.clone(), version));
            }
            Ok(out)
        }

        async fn is_last_build_failed(&self, pkgbase: &Pkgbase) -> Result<bool> {
            let row = sqlx::query(
                "SELECT result FROM pkglog WHERE pkgbase = ? ORDER BY rowid DESC LIMIT 1",
            )
            .bind(pkgbase.as_ref())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row
                .map(|r| r.try_get::<String, _>("result").unwrap_or_default() == "failed")
                .unwrap_or(false))
        }

        async fn record_pkgcurrent(&self, rows: &[PkgCurrentRow]) -> Result<()> {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM pkgcurrent").execute(&mut *tx).await?;
            for row in rows {
                sqlx::query(
                    "INSERT INTO pkgcurrent (pkgbase, idx, status, build_reasons) VALUES (?, ?, ?, ?)",
                )
                .bind(row.pkgbase.as_ref())
                .bind(row.index)
                .bind(row.status.to_string())
                .bind(&row.build_reasons)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        }

        async fn append_pkglog(&self, row: &PkgLogRow) -> Result<()> {
            sqlx::query(
                "INSERT INTO pkglog \
                 (pkgbase, nv_version, pkg_version, elapsed, result, cputime, memory, msg, build_reasons, maintainers, ts) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, unixepoch())",
            )
            .bind(row.pkgbase.as_ref())
            .bind(&row.nv_version)
            .bind(&row.pkg_version)
            .bind(row.elapsed_secs)
            .bind(&row.result)
            .bind(row.cputime_secs)
            .bind(row.memory)
            .bind(&row.msg)
            .bind(&row.build_reasons)
            .bind(&row.maintainers)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn record_batch_event(&self, event: BatchEvent, logdir: Option<&str>) -> Result<()> {
            let event_name = match event {
                BatchEvent::Start => "start",
                BatchEvent::Stop => "stop",
            };
            sqlx::query("INSERT INTO batch (event, logdir) VALUES (?, ?)")
                .bind(event_name)
                .bind(logdir)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }
}

#[cfg(feature = "database")]
pub use sqlite::SqliteDatabase;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_database_is_always_empty() {
        let db = NullDatabase;
        assert!(db.get_pkgs_last_rusage(&["a".into()]).await.unwrap().is_empty());
        assert!(!db.is_last_build_failed(&"a".into()).await.unwrap());
    }
}
