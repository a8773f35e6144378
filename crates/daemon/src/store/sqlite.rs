// SQLite-backed document store.
//
// One table holds every collection. Bodies are JSON text; filters and ordering
// go through `json_extract`. Calls run on the blocking pool.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;

use super::{merge_fields, valid_field, Document, DocumentStore, Query, StoreError, TxnWrite};

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE documents (
    collection  TEXT NOT NULL,
    id          TEXT NOT NULL,
    body        TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store parent directory `{}`", parent.display())
            })?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open store at `{}`", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite pragmas for store")?;
        apply_pending_migrations(&mut conn)?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        apply_pending_migrations(&mut conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        current_schema_version(&conn)
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    ensure_migration_table(conn)?;
    let current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }
        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply store migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
    }
    Ok(())
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn read_body(conn: &Connection, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()
        .map_err(unavailable)?;
    raw.map(|text| serde_json::from_str(&text).map_err(|e| StoreError::corrupt(collection, id, e)))
        .transpose()
}

fn write_body(
    conn: &Connection,
    collection: &str,
    id: &str,
    body: &Value,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO documents (collection, id, body, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT (collection, id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        params![collection, id, body.to_string()],
    )
    .map_err(unavailable)?;
    Ok(())
}

fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn build_query_sql(collection: &str, query: &Query) -> Result<(String, Vec<SqlValue>), StoreError> {
    let mut sql = String::from("SELECT id, body FROM documents WHERE collection = ?");
    let mut args = vec![SqlValue::Text(collection.to_string())];

    for filter in &query.filters {
        if !valid_field(&filter.field) {
            return Err(StoreError::InvalidQuery(format!("invalid filter field `{}`", filter.field)));
        }
        sql.push_str(&format!(" AND json_extract(body, ?) {} ?", filter.op.sql()));
        args.push(SqlValue::Text(format!("$.{}", filter.field)));
        args.push(sql_value(&filter.value));
    }
    if let Some(field) = &query.order_by {
        if !valid_field(field) {
            return Err(StoreError::InvalidQuery(format!("invalid order field `{field}`")));
        }
        sql.push_str(" ORDER BY json_extract(body, ?) IS NULL, json_extract(body, ?), id");
        args.push(SqlValue::Text(format!("$.{field}")));
        args.push(SqlValue::Text(format!("$.{field}")));
    } else {
        sql.push_str(" ORDER BY id");
    }
    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        args.push(SqlValue::Integer(limit as i64));
    }
    Ok((sql, args))
}

impl DocumentStore for SqliteStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.run(move |conn| read_body(conn, &collection, &id)).await
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.run(move |conn| write_body(conn, &collection, &id, &data)).await
    }

    async fn merge(&self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError> {
        self.transact(collection, id, {
            let (collection, id) = (collection.to_string(), id.to_string());
            move |current| match current {
                Some(mut body) => {
                    merge_fields(&mut body, fields);
                    Ok((TxnWrite::Put(body), ()))
                }
                None => Err(StoreError::not_found(&collection, &id)),
            }
        })
        .await
    }

    async fn create(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.run(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO documents (collection, id, body, updated_at)
                     VALUES (?1, ?2, ?3, datetime('now'))",
                    params![collection, id, data.to_string()],
                )
                .map_err(unavailable)?;
            if inserted == 0 {
                return Err(StoreError::already_exists(&collection, &id));
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )
            .map(|n| n > 0)
            .map_err(unavailable)
        })
        .await
    }

    async fn transact<T, F>(&self, collection: &str, id: &str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Option<Value>) -> Result<(TxnWrite, T), StoreError> + Send + 'static,
    {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.run(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(unavailable)?;
            let current = read_body(&tx, &collection, &id)?;
            // Dropping `tx` on the error path rolls back.
            let (write, out) = f(current)?;
            match write {
                TxnWrite::Keep => {}
                TxnWrite::Put(body) => write_body(&tx, &collection, &id, &body)?,
                TxnWrite::Delete => {
                    tx.execute(
                        "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                        params![collection, id],
                    )
                    .map_err(unavailable)?;
                }
            }
            tx.commit().map_err(unavailable)?;
            Ok(out)
        })
        .await
    }

    async fn query(&self, collection: &str, query: Query) -> Result<Vec<Document>, StoreError> {
        let collection = collection.to_string();
        self.run(move |conn| {
            let (sql, args) = build_query_sql(&collection, &query)?;
            let mut stmt = conn.prepare(&sql).map_err(unavailable)?;
            let rows = stmt
                .query_map(params_from_iter(args), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(unavailable)?;

            let mut docs = Vec::new();
            for row in rows {
                let (id, body) = row.map_err(unavailable)?;
                let data = serde_json::from_str(&body)
                    .map_err(|e| StoreError::corrupt(&collection, &id, e))?;
                docs.push(Document { id, data });
            }
            Ok(docs)
        })
        .await
    }
}
