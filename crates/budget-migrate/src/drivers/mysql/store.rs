//! MySQL store over a mysql_async pool.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::classify;
use super::dialect::MysqlDialect;
use crate::config::StoreConfig;
use crate::core::traits::{Lookup, Store, WriteSession};
use crate::core::value::{Batch, Row, SqlValue};
use crate::core::{ColumnType, TableMigrationSpec};
use crate::drivers::common::{natural_key_index_name, tls, Dialect};
use crate::error::{MigrateError, Result, StoreRole};

/// A MySQL database playing `role` in the migration.
pub struct MysqlStore {
    pool: Pool,
    role: StoreRole,
    dialect: MysqlDialect,
}

impl MysqlStore {
    /// Build the pool. Like the PostgreSQL store, nothing is dialed until the
    /// first query.
    pub fn connect(config: &StoreConfig, role: StoreRole) -> Result<Self> {
        let constraints = PoolConstraints::new(1, config.max_connections).ok_or_else(|| {
            MigrateError::Config(format!(
                "{} store: max_connections must be at least 1",
                role
            ))
        })?;

        let builder = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port())
            .db_name(Some(config.database.clone()))
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .init(vec!["SET NAMES utf8mb4"])
            .ssl_opts(tls::mysql_ssl_opts(config.ssl_mode))
            .pool_opts(PoolOpts::new().with_constraints(constraints));

        let opts: Opts = builder.into();
        let pool = Pool::new(opts);

        info!(
            store = %role,
            endpoint = %config.endpoint(),
            "configured MySQL store"
        );

        Ok(Self {
            pool,
            role,
            dialect: MysqlDialect::new(),
        })
    }

    async fn conn(&self, table: &str) -> Result<Conn> {
        self.pool
            .get_conn()
            .await
            .map_err(|e| classify(e, self.role, table))
    }
}

fn to_value(spec: &TableMigrationSpec, ty: ColumnType, value: &SqlValue) -> Result<Value> {
    let value = match (ty, value) {
        (_, SqlValue::Null) => Value::NULL,
        (ColumnType::Text | ColumnType::Enum, SqlValue::Text(s)) => Value::Bytes(s.clone().into_bytes()),
        (ColumnType::Integer | ColumnType::ForeignKey(_), SqlValue::Int(i)) => Value::Int(*i),
        (ColumnType::Float, SqlValue::Float(f)) => Value::Double(*f),
        (ColumnType::Float, SqlValue::Int(i)) => Value::Double(*i as f64),
        (ColumnType::Boolean, SqlValue::Bool(b)) => Value::Int(i64::from(*b)),
        (ColumnType::Boolean, SqlValue::Int(i)) => Value::Int(i64::from(*i != 0)),
        (ColumnType::Date, SqlValue::Date(d)) => date_value(*d),
        (ColumnType::Timestamp, SqlValue::Timestamp(ts)) => datetime_value(*ts),
        (ty, value) => {
            return Err(MigrateError::unexpected(
                spec.name,
                format!("cannot bind {:?} to a {:?} column", value, ty),
            ))
        }
    };
    Ok(value)
}

fn date_value(d: NaiveDate) -> Value {
    Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
}

fn datetime_value(ts: NaiveDateTime) -> Value {
    Value::Date(
        ts.year() as u16,
        ts.month() as u8,
        ts.day() as u8,
        ts.hour() as u8,
        ts.minute() as u8,
        ts.second() as u8,
        ts.nanosecond() / 1_000,
    )
}

/// Decode one column. The binary protocol returns DATE/DATETIME as
/// `Value::Date` and DECIMAL as text, so both shapes are accepted.
fn from_value(spec: &TableMigrationSpec, ty: ColumnType, value: Value) -> Result<SqlValue> {
    let bad = |value: &Value| {
        MigrateError::unexpected(
            spec.name,
            format!("cannot decode {:?} as a {:?} column", value, ty),
        )
    };

    let decoded = match (ty, value) {
        (_, Value::NULL) => SqlValue::Null,
        (ColumnType::Text | ColumnType::Enum, Value::Bytes(bytes)) => {
            SqlValue::Text(String::from_utf8(bytes).map_err(|e| MigrateError::unexpected(spec.name, e))?)
        }
        (ColumnType::Integer | ColumnType::ForeignKey(_), Value::Int(i)) => SqlValue::Int(i),
        (ColumnType::Integer | ColumnType::ForeignKey(_), value @ Value::UInt(u)) => {
            SqlValue::Int(i64::try_from(u).map_err(|_| bad(&value))?)
        }
        (ColumnType::Float, Value::Double(f)) => SqlValue::Float(f),
        (ColumnType::Float, Value::Float(f)) => SqlValue::Float(f64::from(f)),
        (ColumnType::Float, Value::Int(i)) => SqlValue::Float(i as f64),
        (ColumnType::Boolean, Value::Int(i)) => SqlValue::Bool(i != 0),
        (ColumnType::Boolean, Value::UInt(u)) => SqlValue::Bool(u != 0),
        (ColumnType::Date, value @ Value::Date(y, m, d, ..)) => SqlValue::Date(
            NaiveDate::from_ymd_opt(i32::from(y), u32::from(m), u32::from(d)).ok_or_else(|| bad(&value))?,
        ),
        (ColumnType::Timestamp, value @ Value::Date(y, m, d, h, mi, s, us)) => SqlValue::Timestamp(
            NaiveDate::from_ymd_opt(i32::from(y), u32::from(m), u32::from(d))
                .and_then(|date| date.and_hms_micro_opt(u32::from(h), u32::from(mi), u32::from(s), us))
                .ok_or_else(|| bad(&value))?,
        ),
        (ty, value @ Value::Bytes(_)) => parse_text(ty, &value).ok_or_else(|| bad(&value))?,
        (_, value) => return Err(bad(&value)),
    };
    Ok(decoded)
}

fn parse_text(ty: ColumnType, value: &Value) -> Option<SqlValue> {
    let Value::Bytes(bytes) = value else {
        return None;
    };
    let text = std::str::from_utf8(bytes).ok()?.trim();
    match ty {
        ColumnType::Text | ColumnType::Enum => Some(SqlValue::Text(text.to_string())),
        ColumnType::Integer | ColumnType::ForeignKey(_) => text.parse().ok().map(SqlValue::Int),
        ColumnType::Float => text.parse().ok().map(SqlValue::Float),
        ColumnType::Boolean => match text {
            "1" | "true" => Some(SqlValue::Bool(true)),
            "0" | "false" => Some(SqlValue::Bool(false)),
            _ => None,
        },
        ColumnType::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .map(SqlValue::Date),
        ColumnType::Timestamp => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(SqlValue::Timestamp),
    }
}

/// Decode a row selected with [`Dialect::select_list`].
fn decode_row(spec: &TableMigrationSpec, mut row: mysql_async::Row) -> Result<Row> {
    let expected = spec.columns.len() + 1;
    if row.len() != expected {
        return Err(MigrateError::unexpected(
            spec.name,
            format!("expected {} columns, got {}", expected, row.len()),
        ));
    }
    let mut values: Vec<Value> = (0..expected)
        .map(|i| row.take::<Value, _>(i).unwrap_or(Value::NULL))
        .collect();

    let columns = values.split_off(1);
    let id = match from_value(spec, ColumnType::Integer, values.remove(0))? {
        SqlValue::Int(id) => id,
        other => {
            return Err(MigrateError::unexpected(
                spec.name,
                format!("row without an id: {:?}", other),
            ))
        }
    };

    let decoded = spec
        .columns
        .iter()
        .zip(columns)
        .map(|(column, value)| from_value(spec, column.ty, value))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::with_id(id, decoded))
}

/// Stream a table with an unbuffered result set; rows are pulled off the
/// socket as the channel drains.
async fn stream_table(
    pool: Pool,
    role: StoreRole,
    spec: &'static TableMigrationSpec,
    batch_size: usize,
    tx: &mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    let sql = MysqlDialect::new().select_all(spec);
    let classify_err = |e| classify(e, role, spec.name);

    let mut conn = pool.get_conn().await.map_err(classify_err)?;
    let mut result = conn.exec_iter(sql, ()).await.map_err(classify_err)?;

    let batch_size = batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut total = 0usize;
    while let Some(row) = result.next().await.map_err(classify_err)? {
        batch.push(decode_row(spec, row)?);
        if batch.len() == batch_size {
            total += batch.len();
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if tx.send(Ok(full)).await.is_err() {
                debug!(table = spec.name, "reader dropped, abandoning result set");
                return Ok(());
            }
        }
    }
    if !batch.is_empty() {
        total += batch.len();
        let _ = tx.send(Ok(batch)).await;
    }

    debug!(table = spec.name, rows = total, "result set exhausted");
    Ok(())
}

async fn query_count(conn: &mut Conn, sql: String, role: StoreRole, table: &str) -> Result<u64> {
    let count: Option<i64> = conn
        .exec_first(sql, ())
        .await
        .map_err(|e| classify(e, role, table))?;
    Ok(count.unwrap_or(0).max(0) as u64)
}

#[async_trait]
impl Store for MysqlStore {
    fn db_type(&self) -> &str {
        "mysql"
    }

    fn role(&self) -> StoreRole {
        self.role
    }

    async fn test_connection(&self) -> Result<()> {
        let mut conn = self.conn("-").await?;
        conn.query_drop("SELECT 1")
            .await
            .map_err(|e| classify(e, self.role, "-"))
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
        let (sql, params) = match lookup {
            Lookup::Id(id) => (self.dialect.select_by_id(spec), vec![Value::Int(id)]),
            Lookup::NaturalKey(key) => {
                let params = spec
                    .natural_key_indices()
                    .into_iter()
                    .zip(key)
                    .map(|(idx, value)| to_value(spec, spec.columns[idx].ty, value))
                    .collect::<Result<Vec<_>>>()?;
                (self.dialect.select_by_natural_key(spec), params)
            }
        };

        let mut conn = self.conn(spec.name).await?;
        let row: Option<mysql_async::Row> = conn
            .exec_first(sql, Params::Positional(params))
            .await
            .map_err(|e| classify(e, self.role, spec.name))?;
        row.map(|r| decode_row(spec, r)).transpose()
    }

    async fn session(&self) -> Result<Box<dyn WriteSession>> {
        let conn = self.conn("-").await?;
        Ok(Box::new(MysqlSession {
            conn: Some(conn),
            role: self.role,
            dialect: self.dialect,
        }))
    }

    async fn ensure_table(&self, spec: &TableMigrationSpec) -> Result<()> {
        let mut conn = self.conn(spec.name).await?;
        for statement in self.dialect.create_table_statements(spec) {
            conn.query_drop(statement)
                .await
                .map_err(|e| classify(e, self.role, spec.name))?;
        }

        // CREATE TABLE IF NOT EXISTS leaves an existing table untouched.
        let index = natural_key_index_name(spec);
        let found: Option<i64> = conn
            .exec_first(MysqlDialect::index_exists(), (spec.name, index.as_str()))
            .await
            .map_err(|e| classify(e, self.role, spec.name))?;
        if found.unwrap_or(0) == 0 {
            info!(table = spec.name, index = %index, "adding natural key index to existing table");
            conn.query_drop(self.dialect.add_natural_key(spec))
                .await
                .map_err(|e| classify(e, self.role, spec.name))?;
        }
        debug!(table = spec.name, "ensured MySQL table");
        Ok(())
    }

    async fn row_count(&self, spec: &TableMigrationSpec) -> Result<u64> {
        let mut conn = self.conn(spec.name).await?;
        query_count(&mut conn, self.dialect.count(spec), self.role, spec.name).await
    }

    async fn count_orphans(&self, spec: &TableMigrationSpec) -> Result<u64> {
        let Some(sql) = self.dialect.count_orphans(spec) else {
            return Ok(0);
        };
        let mut conn = self.conn(spec.name).await?;
        query_count(&mut conn, sql, self.role, spec.name).await
    }

    async fn close(&self) {
        if let Err(e) = self.pool.clone().disconnect().await {
            warn!(store = %self.role, "error closing MySQL pool: {}", e);
        }
    }
}

/// A pooled MySQL connection used for inserts.
struct MysqlSession {
    conn: Option<Conn>,
    role: StoreRole,
    dialect: MysqlDialect,
}

impl MysqlSession {
    fn conn(&mut self) -> Result<&mut Conn> {
        let role = self.role;
        self.conn
            .as_mut()
            .ok_or_else(|| MigrateError::connectivity(role, "session already released"))
    }
}

#[async_trait]
impl WriteSession for MysqlSession {
    async fn insert_row(&mut self, spec: &TableMigrationSpec, row: &Row) -> Result<i64> {
        let params = spec
            .columns
            .iter()
            .zip(&row.values)
            .map(|(column, value)| to_value(spec, column.ty, value))
            .collect::<Result<Vec<_>>>()?;

        let sql = self.dialect.insert(spec);
        let role = self.role;
        let conn = self.conn()?;
        conn.exec_drop(sql, Params::Positional(params))
            .await
            .map_err(|e| classify(e, role, spec.name))?;

        let id = conn.last_insert_id().ok_or_else(|| {
            MigrateError::unexpected(spec.name, "insert did not report an auto-increment id")
        })?;
        i64::try_from(id).map_err(|e| MigrateError::unexpected(spec.name, e))
    }

    async fn update_row(&mut self, spec: &TableMigrationSpec, id: i64, row: &Row) -> Result<()> {
        let mut params = spec
            .columns
            .iter()
            .zip(&row.values)
            .map(|(column, value)| to_value(spec, column.ty, value))
            .collect::<Result<Vec<_>>>()?;
        params.push(Value::Int(id));

        let sql = self.dialect.update_by_id(spec);
        let role = self.role;
        self.conn()?
            .exec_drop(sql, Params::Positional(params))
            .await
            .map_err(|e| classify(e, role, spec.name))
    }

    async fn set_foreign_key_checks(&mut self, enabled: bool) -> Result<()> {
        let role = self.role;
        self.conn()?
            .query_drop(MysqlDialect::set_foreign_key_checks(enabled))
            .await
            .map_err(|e| classify(e, role, "-"))
    }

    fn restore_foreign_key_checks_detached(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn
                        .query_drop(MysqlDialect::set_foreign_key_checks(true))
                        .await
                    {
                        warn!("failed to restore FOREIGN_KEY_CHECKS: {}", e);
                        let _ = conn.disconnect().await;
                    }
                });
            }
            Err(_) => {
                // The pool resets session state when the connection returns.
                warn!("no runtime to restore FOREIGN_KEY_CHECKS, relying on connection reset");
            }
        }
    }
}
