//! PostgreSQL store over a deadpool-postgres pool.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio::sync::mpsc;
use tokio_postgres::types::ToSql;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use super::dialect::PostgresDialect;
use super::{classify, classify_pool};
use crate::config::StoreConfig;
use crate::core::traits::{Lookup, Store, WriteSession};
use crate::core::value::{Batch, Row, SqlValue};
use crate::core::{ColumnType, TableMigrationSpec};
use crate::drivers::common::{tls, Dialect};
use crate::error::{MigrateError, Result, StoreRole};

type Param = Box<dyn ToSql + Sync + Send>;

/// A PostgreSQL database playing `role` in the migration.
pub struct PostgresStore {
    pool: Pool,
    role: StoreRole,
    dialect: PostgresDialect,
}

impl PostgresStore {
    /// Build the pool. Connections are opened lazily, so an unreachable
    /// server surfaces on first use rather than here.
    pub fn connect(config: &StoreConfig, role: StoreRole) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port());
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("budget-migrate");

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match tls::postgres_connector(config.ssl_mode) {
            Some(connector) => Manager::from_config(pg_config, connector, mgr_config),
            None => Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config),
        };

        let pool = Pool::builder(mgr)
            .max_size(config.max_connections)
            .build()
            .map_err(|e| MigrateError::Config(format!("building {} pool: {}", role, e)))?;

        info!(
            store = %role,
            endpoint = %config.endpoint(),
            "configured PostgreSQL store"
        );

        Ok(Self {
            pool,
            role,
            dialect: PostgresDialect::new(),
        })
    }

    async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| classify_pool(e, self.role))
    }
}

/// Encode a value as a parameter for a `ty` column.
///
/// The placeholder carries an explicit cast, so NULLs are typed by column
/// and non-NULL values must match the cast exactly.
fn to_param(spec: &TableMigrationSpec, ty: ColumnType, value: &SqlValue) -> Result<Param> {
    let param: Param = match (ty, value) {
        (ColumnType::Text | ColumnType::Enum, SqlValue::Null) => Box::new(None::<String>),
        (ColumnType::Text | ColumnType::Enum, SqlValue::Text(s)) => Box::new(s.clone()),
        (ColumnType::Integer | ColumnType::ForeignKey(_), SqlValue::Null) => Box::new(None::<i64>),
        (ColumnType::Integer | ColumnType::ForeignKey(_), SqlValue::Int(i)) => Box::new(*i),
        (ColumnType::Float, SqlValue::Null) => Box::new(None::<f64>),
        (ColumnType::Float, SqlValue::Float(f)) => Box::new(*f),
        (ColumnType::Float, SqlValue::Int(i)) => Box::new(*i as f64),
        (ColumnType::Boolean, SqlValue::Null) => Box::new(None::<bool>),
        (ColumnType::Boolean, SqlValue::Bool(b)) => Box::new(*b),
        (ColumnType::Boolean, SqlValue::Int(i)) => Box::new(*i != 0),
        (ColumnType::Date, SqlValue::Null) => Box::new(None::<chrono::NaiveDate>),
        (ColumnType::Date, SqlValue::Date(d)) => Box::new(*d),
        (ColumnType::Timestamp, SqlValue::Null) => Box::new(None::<chrono::NaiveDateTime>),
        (ColumnType::Timestamp, SqlValue::Timestamp(ts)) => Box::new(*ts),
        (ty, value) => {
            return Err(MigrateError::unexpected(
                spec.name,
                format!("cannot bind {:?} to a {:?} column", value, ty),
            ))
        }
    };
    Ok(param)
}

/// Decode a row selected with [`Dialect::select_list`].
fn decode_row(spec: &TableMigrationSpec, row: &tokio_postgres::Row) -> Result<Row> {
    let err = |e: tokio_postgres::Error| MigrateError::unexpected(spec.name, e);

    let id: i64 = row.try_get(0).map_err(err)?;
    let mut values = Vec::with_capacity(spec.columns.len());
    for (i, column) in spec.columns.iter().enumerate() {
        let idx = i + 1;
        let value = match column.ty {
            ColumnType::Text | ColumnType::Enum => {
                SqlValue::from(row.try_get::<_, Option<String>>(idx).map_err(err)?)
            }
            ColumnType::Integer | ColumnType::ForeignKey(_) => {
                SqlValue::from(row.try_get::<_, Option<i64>>(idx).map_err(err)?)
            }
            ColumnType::Float => SqlValue::from(row.try_get::<_, Option<f64>>(idx).map_err(err)?),
            ColumnType::Boolean => {
                SqlValue::from(row.try_get::<_, Option<bool>>(idx).map_err(err)?)
            }
            ColumnType::Date => {
                SqlValue::from(row.try_get::<_, Option<chrono::NaiveDate>>(idx).map_err(err)?)
            }
            ColumnType::Timestamp => SqlValue::from(
                row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)
                    .map_err(err)?,
            ),
        };
        values.push(value);
    }
    Ok(Row::with_id(id, values))
}

fn as_refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Stream a table through a portal; portals only live inside a transaction.
async fn stream_table(
    pool: Pool,
    role: StoreRole,
    spec: &'static TableMigrationSpec,
    batch_size: usize,
    tx: &mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    let sql = PostgresDialect::new().select_all(spec);
    let classify_err = |e| classify(e, role, spec.name);

    let mut client = pool.get().await.map_err(|e| classify_pool(e, role))?;
    let transaction = client.transaction().await.map_err(classify_err)?;
    let statement = transaction.prepare(&sql).await.map_err(classify_err)?;
    let portal = transaction
        .bind(&statement, &[])
        .await
        .map_err(classify_err)?;

    let fetch = i32::try_from(batch_size.max(1)).unwrap_or(i32::MAX);
    let mut total = 0usize;
    loop {
        let rows = transaction
            .query_portal(&portal, fetch)
            .await
            .map_err(classify_err)?;
        if rows.is_empty() {
            break;
        }
        let exhausted = rows.len() < batch_size;
        let batch = rows
            .iter()
            .map(|r| decode_row(spec, r))
            .collect::<Result<Batch>>()?;
        total += batch.len();
        if tx.send(Ok(batch)).await.is_err() {
            debug!(table = spec.name, "reader dropped, closing cursor");
            break;
        }
        if exhausted {
            break;
        }
    }

    transaction.commit().await.map_err(classify_err)?;
    debug!(table = spec.name, rows = total, "cursor exhausted");
    Ok(())
}

#[async_trait]
impl Store for PostgresStore {
    fn db_type(&self) -> &str {
        "postgres"
    }

    fn role(&self) -> StoreRole {
        self.role
    }

    async fn test_connection(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| classify(e, self.role, "-"))?;
        Ok(())
    }

    fn read_table(
        &self,
        spec: &'static TableMigrationSpec,
        batch_size: usize,
    ) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(4);
        let pool = self.pool.clone();
        let role = self.role;

        tokio::spawn(async move {
            if let Err(e) = stream_table(pool, role, spec, batch_size, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn find_row(
        &self,
        spec: &TableMigrationSpec,
        lookup: Lookup<'_>,
    ) -> Result<Option<Row>> {
        let (sql, params): (String, Vec<Param>) = match lookup {
            Lookup::Id(id) => (self.dialect.select_by_id(spec), vec![Box::new(id) as Param]),
            Lookup::NaturalKey(key) => {
                let params = spec
                    .natural_key_indices()
                    .into_iter()
                    .zip(key)
                    .map(|(idx, value)| to_param(spec, spec.columns[idx].ty, value))
                    .collect::<Result<Vec<_>>>()?;
                (self.dialect.select_by_natural_key(spec), params)
            }
        };

        let client = self.client().await?;
        let statement = client
            .prepare_cached(&sql)
            .await
            .map_err(|e| classify(e, self.role, spec.name))?;
        let row = client
            .query_opt(&statement, &as_refs(&params))
            .await
            .map_err(|e| classify(e, self.role, spec.name))?;
        row.as_ref().map(|r| decode_row(spec, r)).transpose()
    }

    async fn session(&self) -> Result<Box<dyn WriteSession>> {
        let client = self.client().await?;
        Ok(Box::new(PostgresSession {
            client: Some(client),
            role: self.role,
            dialect: self.dialect,
        }))
    }

    async fn ensure_table(&self, spec: &TableMigrationSpec) -> Result<()> {
        let client = self.client().await?;
        for statement in self.dialect.create_table_statements(spec) {
            client
                .batch_execute(&statement)
                .await
                .map_err(|e| classify(e, self.role, spec.name))?;
        }
        debug!(table = spec.name, "ensured PostgreSQL table");
        Ok(())
    }

    async fn row_count(&self, spec: &TableMigrationSpec) -> Result<u64> {
        let client = self.client().await?;
        let row = client
            .query_one(&self.dialect.count(spec), &[])
            .await
            .map_err(|e| classify(e, self.role, spec.name))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| MigrateError::unexpected(spec.name, e))?;
        Ok(count.max(0) as u64)
    }

    async fn count_orphans(&self, spec: &TableMigrationSpec) -> Result<u64> {
        let Some(sql) = self.dialect.count_orphans(spec) else {
            return Ok(0);
        };
        let client = self.client().await?;
        let row = client
            .query_one(&sql, &[])
            .await
            .map_err(|e| classify(e, self.role, spec.name))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| MigrateError::unexpected(spec.name, e))?;
        Ok(count.max(0) as u64)
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// A pooled PostgreSQL connection used for inserts.
struct PostgresSession {
    client: Option<Object>,
    role: StoreRole,
    dialect: PostgresDialect,
}

impl PostgresSession {
    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| MigrateError::connectivity(self.role, "session already released"))
    }
}

#[async_trait]
impl WriteSession for PostgresSession {
    async fn insert_row(&mut self, spec: &TableMigrationSpec, row: &Row) -> Result<i64> {
        let params = spec
            .columns
            .iter()
            .zip(&row.values)
            .map(|(column, value)| to_param(spec, column.ty, value))
            .collect::<Result<Vec<_>>>()?;

        let sql = self.dialect.insert(spec);
        let client = self.client()?;
        let statement = client
            .prepare_cached(&sql)
            .await
            .map_err(|e| classify(e, self.role, spec.name))?;
        let inserted = client
            .query_one(&statement, &as_refs(&params))
            .await
            .map_err(|e| classify(e, self.role, spec.name))?;
        inserted
            .try_get::<_, i64>(0)
            .map_err(|e| MigrateError::unexpected(spec.name, e))
    }

    async fn update_row(&mut self, spec: &TableMigrationSpec, id: i64, row: &Row) -> Result<()> {
        let mut params = spec
            .columns
            .iter()
            .zip(&row.values)
            .map(|(column, value)| to_param(spec, column.ty, value))
            .collect::<Result<Vec<_>>>()?;
        params.push(Box::new(id));

        let sql = self.dialect.update_by_id(spec);
        let client = self.client()?;
        let statement = client
            .prepare_cached(&sql)
            .await
            .map_err(|e| classify(e, self.role, spec.name))?;
        client
            .execute(&statement, &as_refs(&params))
            .await
            .map_err(|e| classify(e, self.role, spec.name))?;
        Ok(())
    }

    async fn set_foreign_key_checks(&mut self, enabled: bool) -> Result<()> {
        let client = self.client()?;
        client
            .batch_execute(PostgresDialect::set_foreign_key_checks(enabled))
            .await
            .map_err(|e| classify(e, self.role, "-"))
    }

    fn restore_foreign_key_checks_detached(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client
                        .batch_execute(PostgresDialect::set_foreign_key_checks(true))
                        .await
                    {
                        warn!("failed to restore session_replication_role: {}", e);
                        // Keep the connection out of the pool.
                        let _ = Object::take(client);
                    }
                });
            }
            Err(_) => {
                warn!("no runtime to restore session_replication_role, discarding connection");
                let _ = Object::take(client);
            }
        }
    }
}
