use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use pricefeed_core::PriceRow;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Executor};
use tracing::{debug, info};

use crate::{PriceStore, StoreError};

/// Table + snapshot index. Every statement is `IF NOT EXISTS`.
pub const PRICE_ITEMS_DDL: &str = include_str!("../../../migrations/001_create_price_items.sql");

const UPSERT_SQL: &str = r#"
    INSERT INTO public.price_items
        (provider, branch, doc_type, ts, product, unit, price, src_key, etag)
    VALUES ($1, $2, $3, $4, $5, $6, CAST($7 AS numeric), $8, $9)
    ON CONFLICT (provider, branch, doc_type, ts, product)
    DO UPDATE SET
        unit       = EXCLUDED.unit,
        price      = EXCLUDED.price,
        src_key    = EXCLUDED.src_key,
        etag       = EXCLUDED.etag,
        updated_at = NOW()
"#;

/// Serializes concurrent schema-ensure calls across workers.
const SCHEMA_LOCK_KEY: i64 = 0x7072_6963_655f_6974;

#[derive(Clone, PartialEq, Eq)]
pub enum PgTarget {
    Url(String),
    Parts {
        host: String,
        port: u16,
        database: String,
        user: String,
        password: String,
        require_tls: bool,
    },
}

impl fmt::Debug for PgTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgTarget::Url(_) => f.write_str("Url(<redacted>)"),
            PgTarget::Parts {
                host,
                port,
                database,
                user,
                require_tls,
                ..
            } => f
                .debug_struct("Parts")
                .field("host", host)
                .field("port", port)
                .field("database", database)
                .field("user", user)
                .field("require_tls", require_tls)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgStoreConfig {
    pub target: PgTarget,
    /// Server-side bound on each statement; the store itself never times out calls.
    pub statement_timeout: Option<Duration>,
}

impl PgStoreConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions, StoreError> {
        let options = match &self.target {
            PgTarget::Url(url) => PgConnectOptions::from_str(url).map_err(StoreError::Connect)?,
            PgTarget::Parts {
                host,
                port,
                database,
                user,
                password,
                require_tls,
            } => PgConnectOptions::new()
                .host(host)
                .port(*port)
                .database(database)
                .username(user)
                .password(password)
                .ssl_mode(if *require_tls {
                    PgSslMode::Require
                } else {
                    PgSslMode::Prefer
                }),
        };

        Ok(match self.statement_timeout {
            Some(timeout) => {
                options.options([("statement_timeout", format!("{}ms", timeout.as_millis()))])
            }
            None => options,
        })
    }
}

/// Postgres-backed store. A connection is opened for every call and dropped on
/// every exit path; pooling belongs to whoever embeds the store.
#[derive(Debug, Clone)]
pub struct PgPriceStore {
    options: PgConnectOptions,
}

async fn close(conn: PgConnection) {
    if let Err(err) = conn.close().await {
        debug!(error = %err, "closing postgres connection failed");
    }
}

fn query_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Query { context, source }
}

impl PgPriceStore {
    pub fn new(config: &PgStoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            options: config.connect_options()?,
        })
    }

    async fn connect(&self) -> Result<PgConnection, StoreError> {
        PgConnection::connect_with(&self.options)
            .await
            .map_err(StoreError::Connect)
    }

    /// Executes a SQL script file inside a single transaction.
    pub async fn apply_migration_file(&self, path: &Path) -> Result<(), StoreError> {
        let sql = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| StoreError::Migration {
                path: path.to_path_buf(),
                source,
            })?;

        let mut conn = self.connect().await?;
        let mut tx = conn
            .begin()
            .await
            .map_err(query_err("beginning migration transaction"))?;
        (&mut *tx)
            .execute(sqlx::raw_sql(&sql))
            .await
            .map_err(query_err("executing migration script"))?;
        tx.commit()
            .await
            .map_err(query_err("committing migration"))?;
        close(conn).await;

        info!(path = %path.display(), "migration applied");
        Ok(())
    }
}

#[async_trait]
impl PriceStore for PgPriceStore {
    async fn upsert(&self, rows: &[PriceRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connect().await?;
        let mut tx = conn
            .begin()
            .await
            .map_err(query_err("beginning upsert transaction"))?;

        // One statement per row: a multi-row VALUES list cannot touch the same key twice.
        for row in rows {
            sqlx::query(UPSERT_SQL)
                .bind(&row.provider)
                .bind(&row.branch)
                .bind(row.doc_type.as_str())
                .bind(row.ts)
                .bind(&row.product)
                .bind(&row.unit)
                .bind(row.price)
                .bind(row.src_key.as_deref())
                .bind(row.etag.as_deref())
                .execute(&mut *tx)
                .await
                .map_err(query_err("upserting price row"))?;
        }

        tx.commit()
            .await
            .map_err(query_err("committing upsert"))?;
        close(conn).await;

        debug!(rows = rows.len(), "price rows upserted");
        Ok(rows.len() as u64)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.connect().await?;
        let mut tx = conn
            .begin()
            .await
            .map_err(query_err("beginning schema transaction"))?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(query_err("acquiring schema lock"))?;
        (&mut *tx)
            .execute(sqlx::raw_sql(PRICE_ITEMS_DDL))
            .await
            .map_err(query_err("creating price_items"))?;
        tx.commit()
            .await
            .map_err(query_err("committing schema"))?;
        close(conn).await;

        info!("price_items ensured");
        Ok(())
    }

    async fn probe(&self) -> Result<(), StoreError> {
        let mut conn = self.connect().await?;
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&mut conn)
            .await
            .map_err(query_err("probing postgres"))?;
        close(conn).await;
        Ok(())
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let mut conn = self.connect().await?;
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM public.price_items")
            .fetch_one(&mut conn)
            .await
            .map_err(query_err("counting price_items"))?;
        close(conn).await;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_declares_natural_key_and_snapshot_index() {
        assert!(PRICE_ITEMS_DDL.contains("PRIMARY KEY (provider, branch, doc_type, ts, product)"));
        assert!(PRICE_ITEMS_DDL.contains("(provider, branch, doc_type, ts DESC)"));
        assert!(PRICE_ITEMS_DDL.contains("CREATE TABLE IF NOT EXISTS"));
        assert!(PRICE_ITEMS_DDL.contains("CREATE INDEX IF NOT EXISTS"));
    }

    #[test]
    fn upsert_never_rewrites_key_columns() {
        let update_clause = UPSERT_SQL
            .split("DO UPDATE SET")
            .nth(1)
            .expect("update clause");
        for key_column in ["provider", "branch", "doc_type", "ts", "product"] {
            assert!(
                !update_clause.contains(&format!("{key_column} =")),
                "{key_column} must stay immutable"
            );
        }
        assert!(update_clause.contains("updated_at = NOW()"));
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let config = PgStoreConfig {
            target: PgTarget::Parts {
                host: "db.internal".into(),
                port: 5432,
                database: "prices".into(),
                user: "ingest".into(),
                password: "hunter2".into(),
                require_tls: true,
            },
            statement_timeout: None,
        };
        let rendered = format!("{config:?}");
        assert!(rendered.contains("db.internal"));
        assert!(!rendered.contains("hunter2"));

        let url = PgTarget::Url("postgres://u:secret@h/db".into());
        assert!(!format!("{url:?}").contains("secret"));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn schema_and_migration_futures_are_send() {
        let store = PgPriceStore::new(&PgStoreConfig {
            target: PgTarget::Url("postgres://ingest:pw@localhost:5433/prices".into()),
            statement_timeout: None,
        })
        .expect("store");
        let ensure = store.ensure_schema();
        assert_send(&ensure);
        let migrate = store.apply_migration_file(Path::new("migrations/001_create_price_items.sql"));
        assert_send(&migrate);
    }

    #[test]
    fn connect_options_accept_urls_and_parts() {
        let from_url = PgStoreConfig {
            target: PgTarget::Url("postgres://ingest:pw@localhost:5433/prices".into()),
            statement_timeout: Some(Duration::from_secs(5)),
        };
        let options = from_url.connect_options().expect("url options");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_database(), Some("prices"));

        let bad = PgStoreConfig {
            target: PgTarget::Url("not a url".into()),
            statement_timeout: None,
        };
        assert!(bad.connect_options().is_err());
    }
}
