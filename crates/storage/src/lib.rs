use std::{borrow::Cow, str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;

use hostmap_core::{Domain, DomainId, DomainStage, SiteId};

const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

const DOMAIN_COLUMNS: &str =
    "id, domain, site_id, is_primary, primary_rank, stage, is_secure, created_at, updated_at";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the domain mapping table.
    pub fn domains(&self) -> DomainRepository {
        DomainRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the persisted key/value options.
    pub fn options(&self) -> OptionsRepository {
        OptionsRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every connection; later queries fail with `PoolClosed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `domains` table.
#[derive(Clone)]
pub struct DomainRepository {
    pool: SqlitePool,
}

impl DomainRepository {
    /// Inserts a non-primary domain in stage `pending`.
    ///
    /// When the name is already taken the existing row is returned instead, so
    /// the caller can decide whether that is a duplicate or a repeat request.
    pub async fn insert(&self, record: &NewDomain<'_>) -> Result<DomainInsertOutcome, DomainStoreError> {
        // A second attempt covers the row being deleted between the conflict and the lookup.
        for _ in 0..2 {
            let timestamp = to_rfc3339(record.created_at);
            let result = sqlx::query_as::<_, DomainRow>(&format!(
                "INSERT INTO domains (domain, site_id, is_primary, stage, is_secure, created_at, updated_at) \
                 VALUES (?, ?, 0, ?, 0, ?, ?) \
                 RETURNING {DOMAIN_COLUMNS}"
            ))
            .bind(record.domain.as_ref())
            .bind(record.site_id.0)
            .bind(DomainStage::Pending.as_str())
            .bind(&timestamp)
            .bind(&timestamp)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => return Ok(DomainInsertOutcome::Inserted(row.try_into()?)),
                Err(sqlx::Error::Database(db_err))
                    if db_err.code() == Some(Cow::Borrowed(SQLITE_CONSTRAINT_UNIQUE)) =>
                {
                    if let Some(existing) = self.find_by_domain(&record.domain).await? {
                        return Ok(DomainInsertOutcome::Existing(existing));
                    }
                }
                Err(err) => return Err(DomainStoreError::Database(err)),
            }
        }

        Err(DomainStoreError::Contended)
    }

    /// Loads a domain by id.
    pub async fn find_by_id(&self, id: DomainId) -> Result<Option<Domain>, DomainStoreError> {
        let row = sqlx::query_as::<_, DomainRow>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Domain::try_from).transpose()
    }

    /// Exact lookup on the normalized domain name, served by the unique index.
    pub async fn find_by_domain(&self, domain: &str) -> Result<Option<Domain>, DomainStoreError> {
        let row = sqlx::query_as::<_, DomainRow>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE domain = ?"
        ))
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Domain::try_from).transpose()
    }

    /// Lists the domains of a site, oldest first.
    pub async fn list_for_site(&self, site_id: SiteId) -> Result<Vec<Domain>, DomainStoreError> {
        let rows = sqlx::query_as::<_, DomainRow>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE site_id = ? ORDER BY id"
        ))
        .bind(site_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Domain::try_from).collect()
    }

    /// Returns the most recently promoted primary domain of a site.
    pub async fn primary_for_site(&self, site_id: SiteId) -> Result<Option<Domain>, DomainStoreError> {
        let row = sqlx::query_as::<_, DomainRow>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains \
             WHERE site_id = ? AND is_primary = 1 \
             ORDER BY primary_rank DESC, id DESC LIMIT 1"
        ))
        .bind(site_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Domain::try_from).transpose()
    }

    /// Marks the domain primary with a fresh rank and captures the ids of the
    /// site's other primary rows in the same transaction.
    pub async fn promote(
        &self,
        id: DomainId,
        now: DateTime<Utc>,
    ) -> Result<Option<Promotion>, DomainStoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, DomainRow>(&format!(
            "UPDATE domains \
             SET is_primary = 1, \
                 primary_rank = (SELECT COALESCE(MAX(primary_rank), 0) + 1 FROM domains), \
                 updated_at = ? \
             WHERE id = ? \
             RETURNING {DOMAIN_COLUMNS}"
        ))
        .bind(to_rfc3339(now))
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let domain = Domain::try_from(row)?;

        let siblings = sqlx::query(
            "SELECT id FROM domains WHERE site_id = ? AND is_primary = 1 AND id != ? ORDER BY id",
        )
        .bind(domain.site_id.0)
        .bind(domain.id.0)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| DomainId(row.get::<i64, _>("id")))
        .collect();

        tx.commit().await?;
        Ok(Some(Promotion { domain, siblings }))
    }

    /// Clears the primary flag unless the row is its site's highest ranked
    /// primary. Returns `true` when a row changed.
    pub async fn demote_if_superseded(
        &self,
        id: DomainId,
        now: DateTime<Utc>,
    ) -> Result<bool, DomainStoreError> {
        let result = sqlx::query(
            "UPDATE domains \
             SET is_primary = 0, updated_at = ? \
             WHERE id = ? \
               AND is_primary = 1 \
               AND primary_rank < ( \
                   SELECT MAX(other.primary_rank) FROM domains AS other \
                   WHERE other.site_id = domains.site_id AND other.is_primary = 1 \
               )",
        )
        .bind(to_rfc3339(now))
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Moves the domain from `from` to `to`; a no-op returning `false` when the
    /// row is no longer in `from`. `is_secure` is left untouched when `None`.
    pub async fn transition_stage(
        &self,
        id: DomainId,
        from: DomainStage,
        to: DomainStage,
        is_secure: Option<bool>,
        now: DateTime<Utc>,
    ) -> Result<bool, DomainStoreError> {
        let result = sqlx::query(
            "UPDATE domains \
             SET stage = ?, is_secure = COALESCE(?, is_secure), updated_at = ? \
             WHERE id = ? AND stage = ?",
        )
        .bind(to.as_str())
        .bind(is_secure)
        .bind(to_rfc3339(now))
        .bind(id.0)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Primary rows that are not their site's highest ranked primary.
    pub async fn superseded_primaries(&self) -> Result<Vec<DomainId>, DomainStoreError> {
        let rows = sqlx::query(
            "SELECT id FROM domains \
             WHERE is_primary = 1 \
               AND primary_rank < ( \
                   SELECT MAX(other.primary_rank) FROM domains AS other \
                   WHERE other.site_id = domains.site_id AND other.is_primary = 1 \
               ) \
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DomainId(row.get::<i64, _>("id")))
            .collect())
    }

    /// Ids of domains still waiting for a verification verdict.
    pub async fn unsettled(&self) -> Result<Vec<DomainId>, DomainStoreError> {
        let rows = sqlx::query("SELECT id FROM domains WHERE stage IN (?, ?) ORDER BY id")
            .bind(DomainStage::Pending.as_str())
            .bind(DomainStage::Checking.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| DomainId(row.get::<i64, _>("id")))
            .collect())
    }

    /// Deletes a domain, returning `false` when it did not exist.
    pub async fn delete(&self, id: DomainId) -> Result<bool, DomainStoreError> {
        let result = sqlx::query("DELETE FROM domains WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes every domain of a site.
    pub async fn delete_for_site(&self, site_id: SiteId) -> Result<u64, DomainStoreError> {
        let result = sqlx::query("DELETE FROM domains WHERE site_id = ?")
            .bind(site_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Data required to insert a domain.
pub struct NewDomain<'a> {
    pub domain: Cow<'a, str>,
    pub site_id: SiteId,
    pub created_at: DateTime<Utc>,
}

/// Result of attempting to insert into `domains`.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainInsertOutcome {
    Inserted(Domain),
    Existing(Domain),
}

/// A promoted row and the other primary rows of its site at promotion time.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub domain: Domain,
    pub siblings: Vec<DomainId>,
}

/// Errors raised by the domain repository.
#[derive(Debug, Error)]
pub enum DomainStoreError {
    #[error("stored stage '{0}' is not recognised")]
    UnknownStage(String),
    #[error("domain insert kept conflicting with concurrent writers")]
    Contended,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct DomainRow {
    id: i64,
    domain: String,
    site_id: i64,
    is_primary: bool,
    primary_rank: Option<i64>,
    stage: String,
    is_secure: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DomainRow> for Domain {
    type Error = DomainStoreError;

    fn try_from(row: DomainRow) -> Result<Self, Self::Error> {
        let stage =
            DomainStage::parse(&row.stage).ok_or(DomainStoreError::UnknownStage(row.stage))?;
        Ok(Domain {
            id: DomainId(row.id),
            domain: row.domain,
            site_id: SiteId(row.site_id),
            is_primary: row.is_primary,
            primary_rank: row.primary_rank,
            stage,
            is_secure: row.is_secure,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Repository for JSON values in the `options` table.
#[derive(Clone)]
pub struct OptionsRepository {
    pool: SqlitePool,
}

impl OptionsRepository {
    /// Begins a SQLite transaction for read-modify-write sequences.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, OptionsError> {
        Ok(self.pool.begin().await?)
    }

    /// Reads and decodes an option; `None` when it was never written.
    pub async fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, OptionsError> {
        let row = sqlx::query("SELECT value_json FROM options WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        decode_option(row)
    }

    /// Writes an option, replacing any previous value.
    pub async fn put<T: Serialize>(
        &self,
        name: &str,
        value: &T,
        now: DateTime<Utc>,
    ) -> Result<(), OptionsError> {
        let json = serde_json::to_string(value)?;
        sqlx::query(UPSERT_OPTION)
            .bind(name)
            .bind(json)
            .bind(to_rfc3339(now))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transactional variant of [`OptionsRepository::get`].
    pub async fn get_in<T: DeserializeOwned>(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        name: &str,
    ) -> Result<Option<T>, OptionsError> {
        let row = sqlx::query("SELECT value_json FROM options WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;
        decode_option(row)
    }

    /// Transactional variant of [`OptionsRepository::put`].
    pub async fn put_in<T: Serialize>(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        name: &str,
        value: &T,
        now: DateTime<Utc>,
    ) -> Result<(), OptionsError> {
        let json = serde_json::to_string(value)?;
        sqlx::query(UPSERT_OPTION)
            .bind(name)
            .bind(json)
            .bind(to_rfc3339(now))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

const UPSERT_OPTION: &str = "INSERT INTO options (name, value_json, updated_at) VALUES (?, ?, ?) \
     ON CONFLICT(name) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at";

fn decode_option<T: DeserializeOwned>(
    row: Option<sqlx::sqlite::SqliteRow>,
) -> Result<Option<T>, OptionsError> {
    let Some(row) = row else {
        return Ok(None);
    };
    let json: String = row.get("value_json");
    Ok(Some(serde_json::from_str(&json)?))
}

/// Errors that can occur while reading or writing options.
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("failed to encode or decode option json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
