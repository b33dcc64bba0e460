//! Embedded SQLite backend
//!
//! Same table semantics as the hosted database, with every successful write
//! published on an in-process broadcast channel so that subscriptions behave
//! like the realtime feed (including echoes of the caller's own writes).

use crate::sync::backend::{Backend, Subscription};
use crate::sync::db::create_sqlite_pool_with_migration;
use crate::sync::reconcile::ChangeEvent;
use crate::sync::types::{Filter, Query, Row, Table};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Pool, Row as _, Sqlite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const CHANGE_FEED_CAPACITY: usize = 1024;

/// SQLite-backed [`Backend`] (sqlx)
#[derive(Clone)]
pub struct SqliteBackend {
    db: Pool<Sqlite>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SqliteBackend {
    /// Connects (creating the file if needed) and applies migrations
    pub async fn connect(db_url: &str) -> Result<Self> {
        info!("[SqliteBackend] opening {}", db_url);
        let db = create_sqlite_pool_with_migration(db_url).await?;
        Ok(Self::with_pool(db))
    }

    /// Private in-memory database, mainly for tests and demos
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Uses an already migrated pool
    pub fn with_pool(db: Pool<Sqlite>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { db, changes }
    }

    fn publish(&self, event: ChangeEvent) {
        // no receivers is fine: nobody is subscribed yet
        let _ = self.changes.send(event);
    }

    fn check_row(table: Table, row: &Row) -> Result<()> {
        for column in row.keys() {
            if !table.has_column(column) {
                bail!("column {} does not exist on {}", column, table);
            }
        }
        Ok(())
    }

    fn select_sql(table: Table, query: &Query) -> (String, Vec<Value>) {
        let fields = table
            .columns()
            .iter()
            .map(|c| format!("'{c}', {c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("SELECT json_object({}) AS json_row FROM {}", fields, table);

        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        for filter in &query.filters {
            match filter {
                Filter::Eq(column, value) => {
                    clauses.push(format!("{} = ?", column));
                    binds.push(value.clone());
                }
                Filter::In(column, values) => {
                    let placeholders = vec!["?"; values.len()].join(", ");
                    clauses.push(format!("{} IN ({})", column, placeholders));
                    binds.extend(values.iter().cloned());
                }
            }
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        if let Some(order) = query.order {
            let keyword = order.keyword().to_uppercase();
            sql.push_str(&format!(" ORDER BY created_at {0}, id {0}", keyword));
        }
        (sql, binds)
    }

    async fn fetch_by_id(&self, table: Table, id: &str) -> Result<Option<Row>> {
        let rows = self.select(table, &Query::new().eq("id", id)).await?;
        Ok(rows.into_iter().next())
    }
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>> {
        query.check_columns(table)?;
        if query.is_empty_match() {
            return Ok(Vec::new());
        }

        let (sql, binds) = Self::select_sql(table, query);
        let mut q = sqlx::query(&sql);
        for value in &binds {
            q = bind_value(q, value);
        }
        let rows = q
            .fetch_all(&self.db)
            .await
            .with_context(|| format!("select from {} failed", table))?;

        let records = rows
            .into_iter()
            .map(|r| -> Result<Row> {
                let json: String = r.try_get("json_row")?;
                let value: Value = serde_json::from_str(&json)?;
                match value {
                    Value::Object(map) => Ok(map),
                    other => Err(anyhow!("unexpected row shape: {}", other)),
                }
            })
            .collect::<Result<Vec<Row>>>()?;

        debug!("[SqliteBackend] select {} -> {} rows", table, records.len());
        Ok(records)
    }

    async fn insert(&self, table: Table, mut row: Row) -> Result<Row> {
        Self::check_row(table, &row)?;
        if !row.contains_key("id") {
            row.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
        }
        if !row.contains_key("created_at") {
            row.insert("created_at".to_string(), Value::String(now_timestamp()));
        }
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("id of {} row must be a string", table))?
            .to_string();

        let columns: Vec<&String> = row.keys().collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            vec!["?"; columns.len()].join(", ")
        );
        let mut q = sqlx::query(&sql);
        for value in row.values() {
            q = bind_value(q, value);
        }
        q.execute(&self.db)
            .await
            .with_context(|| format!("insert into {} failed", table))?;

        let stored = self
            .fetch_by_id(table, &id)
            .await?
            .ok_or_else(|| anyhow!("inserted {} row {} not readable", table, id))?;
        debug!("[SqliteBackend] insert {} {}", table, id);
        self.publish(ChangeEvent::insert(table, stored.clone()));
        Ok(stored)
    }

    async fn update(&self, table: Table, id: &str, mut patch: Row) -> Result<()> {
        Self::check_row(table, &patch)?;
        patch.remove("id");
        if patch.is_empty() {
            return Ok(());
        }

        let assignments = patch
            .keys()
            .map(|c| format!("{} = ?", c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE {} SET {} WHERE id = ?", table, assignments);
        let mut q = sqlx::query(&sql);
        for value in patch.values() {
            q = bind_value(q, value);
        }
        let result = q
            .bind(id.to_string())
            .execute(&self.db)
            .await
            .with_context(|| format!("update of {} {} failed", table, id))?;

        if result.rows_affected() == 0 {
            debug!("[SqliteBackend] update {} {}: no such row", table, id);
            return Ok(());
        }
        if let Some(stored) = self.fetch_by_id(table, id).await? {
            debug!("[SqliteBackend] update {} {}", table, id);
            self.publish(ChangeEvent::update(table, stored));
        }
        Ok(())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?", table);
        let result = sqlx::query(&sql)
            .bind(id.to_string())
            .execute(&self.db)
            .await
            .with_context(|| format!("delete of {} {} failed", table, id))?;

        if result.rows_affected() > 0 {
            debug!("[SqliteBackend] delete {} {}", table, id);
            self.publish(ChangeEvent::delete(table, id));
        }
        Ok(())
    }

    async fn subscribe(&self, table: Table) -> Result<Subscription> {
        let mut feed = self.changes.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => break,
                    received = feed.recv() => match received {
                        Ok(event) if event.table == table => {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(
                                "[SqliteBackend] subscription on {} lagged, {} events dropped",
                                table, skipped
                            );
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("[SqliteBackend] subscription on {} closed", table);
        });

        info!("[SqliteBackend] subscribed to {}", table);
        Ok(Subscription::new(table, rx, close_tx))
    }
}
