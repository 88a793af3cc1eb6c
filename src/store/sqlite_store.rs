//! SQLite implementation of the DocumentStore trait
//!
//! Every document is a JSON body in one `documents` table keyed by
//! (database, collection, id). The autoincrement `seq` column is the natural
//! order, so "first match" means the earliest inserted matching document.
//!
//! One equality term of the filter is pushed into SQL so lookups by `_id` or
//! by an indexed field only read the rows they can match; the full filter is
//! then evaluated in Rust on those rows. `create_index` builds a real SQLite
//! expression index over `json_extract` of the key fields. The `arrays`
//! column lists the top-level fields holding arrays, which keeps array
//! containment (`{tags: "x"}` matching `tags: ["x"]`) correct under pushdown.

use async_trait::async_trait;
use log::{debug, info, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::StoreError;
use crate::store::document::{self, Document, FindOptions, Update, ID_FIELD};
use crate::store::{ensure_id, Collection, CollectionStats, DatabaseStats, DeleteResult, DocumentStore, UpdateResult};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        database TEXT NOT NULL,
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        body TEXT NOT NULL,
        arrays TEXT,
        UNIQUE(database, collection, id)
    );
    CREATE TABLE IF NOT EXISTS collections (
        database TEXT NOT NULL,
        collection TEXT NOT NULL,
        PRIMARY KEY (database, collection)
    );
    CREATE TABLE IF NOT EXISTS indexes (
        database TEXT NOT NULL,
        collection TEXT NOT NULL,
        name TEXT NOT NULL,
        keys TEXT NOT NULL,
        PRIMARY KEY (database, collection, name)
    );
";

const SCHEMA_INDEXES: &str = "
    CREATE INDEX IF NOT EXISTS documents_namespace ON documents (database, collection, seq);
    CREATE INDEX IF NOT EXISTS documents_arrays ON documents (database, collection, arrays) WHERE arrays IS NOT NULL;
";

type SharedConnection = Arc<Mutex<Option<Connection>>>;

/// SQLite-backed document store
pub struct SqliteStore {
    conn: SharedConnection,
}

impl SqliteStore {
    /// Open (or create) the store file and make sure the schema exists
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Connection(format!("cannot create {}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        migrate_arrays_column(&conn)?;
        conn.execute_batch(SCHEMA_INDEXES)?;
        info!("SQLite document store ready at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }
}

/// Run blocking SQLite work off the async executor
async fn with_conn<T, F>(conn: &SharedConnection, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| StoreError::Connection("sqlite connection is closed".to_string()))?;
        f(conn)
    })
    .await
    .map_err(|e| StoreError::Backend(format!("sqlite task failed: {}", e)))?
}

/// Files created before the `arrays` column existed get it added
fn migrate_arrays_column(conn: &Connection) -> Result<(), StoreError> {
    let present: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('documents') WHERE name = 'arrays'",
        [],
        |row| row.get(0),
    )?;
    if present == 0 {
        conn.execute_batch(
            "ALTER TABLE documents ADD COLUMN arrays TEXT;
             UPDATE documents SET arrays = (
                 SELECT json_group_array(key) FROM json_each(documents.body) WHERE type = 'array'
             );
             UPDATE documents SET arrays = NULL WHERE arrays = '[]';",
        )?;
        info!("Added arrays column to existing documents table");
    }
    Ok(())
}

/// SQL string literal for the JSON path of a dotted field, e.g. `'$."a"."b"'`
fn json_path_literal(field: &str) -> Option<String> {
    let mut path = String::from("'$");
    for part in field.split('.') {
        if part.is_empty() || part.contains(['"', '\'', '\\']) {
            return None;
        }
        path.push_str(&format!(".\"{}\"", part));
    }
    path.push('\'');
    Some(path)
}

/// SQL value json_extract yields for a JSON scalar, when it compares exactly
fn sql_scalar(value: &Value) -> Option<SqlValue> {
    match value {
        Value::String(text) => Some(SqlValue::Text(text.clone())),
        Value::Bool(flag) => Some(SqlValue::Integer(i64::from(*flag))),
        Value::Number(n) if n.is_f64() => n.as_f64().map(SqlValue::Real),
        Value::Number(n) => n.as_i64().map(SqlValue::Integer),
        _ => None,
    }
}

/// Top-level fields of `doc` holding arrays, as a JSON list
fn array_fields(doc: &Document) -> Result<Option<String>, StoreError> {
    let fields: Vec<&String> = doc
        .iter()
        .filter(|(_, value)| value.is_array())
        .map(|(field, _)| field)
        .collect();
    if fields.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(&fields)?))
}

/// Candidate-row query for `filter`: the namespace, narrowed by one equality
/// term, preferring a field that leads one of `indexed`. Rows still go
/// through the full filter.
fn candidate_query(database: &str, collection: &str, filter: &Document, indexed: &[String]) -> (String, Vec<SqlValue>) {
    let mut values = vec![SqlValue::Text(database.to_string()), SqlValue::Text(collection.to_string())];

    if let Some(Value::String(id)) = filter.get(ID_FIELD) {
        values.push(SqlValue::Text(id.clone()));
        let sql = "SELECT seq, body FROM documents WHERE database = ?1 AND collection = ?2 AND id = ?3 ORDER BY seq";
        return (sql.to_string(), values);
    }

    let candidates: Vec<_> = filter
        .iter()
        .filter_map(|(field, expected)| {
            if field.contains('.') || field.starts_with('$') {
                return None;
            }
            Some((field, json_path_literal(field)?, sql_scalar(expected)?))
        })
        .collect();
    let position = candidates
        .iter()
        .position(|(field, _, _)| indexed.contains(*field))
        .unwrap_or(0);
    let driving = candidates.into_iter().nth(position);
    match driving {
        Some((field, path, expected)) => {
            values.push(expected);
            values.push(SqlValue::Text(field.clone()));
            let sql = format!(
                "SELECT seq, body FROM documents WHERE seq IN ( \
                     SELECT seq FROM documents WHERE database = ?1 AND collection = ?2 AND json_extract(body, {path}) = ?3 \
                     UNION ALL \
                     SELECT seq FROM documents WHERE database = ?1 AND collection = ?2 AND arrays IS NOT NULL \
                         AND EXISTS (SELECT 1 FROM json_each(arrays) WHERE value = ?4) \
                 ) ORDER BY seq"
            );
            (sql, values)
        }
        None => (
            "SELECT seq, body FROM documents WHERE database = ?1 AND collection = ?2 ORDER BY seq".to_string(),
            values,
        ),
    }
}

/// Visit matching documents in natural order until `visit` returns false
fn scan<F>(conn: &Connection, database: &str, collection: &str, filter: &Document, mut visit: F) -> Result<(), StoreError>
where
    F: FnMut(i64, Document) -> bool,
{
    let indexed = leading_index_fields(conn, database, collection)?;
    let (sql, values) = candidate_query(database, collection, filter, &indexed);
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(params_from_iter(values))?;
    while let Some(row) = rows.next()? {
        let seq: i64 = row.get(0)?;
        let body: String = row.get(1)?;
        let doc = match serde_json::from_str::<Value>(&body)? {
            Value::Object(doc) => doc,
            _ => {
                warn!("Skipping non-object document {} in {}.{}", seq, database, collection);
                continue;
            }
        };
        if document::matches(&doc, filter)? && !visit(seq, doc) {
            break;
        }
    }
    Ok(())
}

/// First matching document with its sequence number
fn first_match(conn: &Connection, database: &str, collection: &str, filter: &Document) -> Result<Option<(i64, Document)>, StoreError> {
    let mut found = None;
    scan(conn, database, collection, filter, |seq, doc| {
        found = Some((seq, doc));
        false
    })?;
    Ok(found)
}

/// Name of the SQLite index backing a collection index
fn sql_index_name(database: &str, collection: &str, index: &str) -> String {
    format!("documents_{:x}", md5::compute(format!("{}\0{}\0{}", database, collection, index)))
}

/// Expression columns for an index key, None when a field cannot be expressed
fn index_columns(keys: &[(String, i32)]) -> Option<String> {
    let columns = keys
        .iter()
        .map(|(field, direction)| {
            let path = json_path_literal(field)?;
            let order = if *direction < 0 { " DESC" } else { "" };
            Some(format!("json_extract(body, {}){}", path, order))
        })
        .collect::<Option<Vec<_>>>()?;
    Some(columns.join(", "))
}

/// First key field of every index on the collection
fn leading_index_fields(conn: &Connection, database: &str, collection: &str) -> Result<Vec<String>, StoreError> {
    Ok(load_index_keys(conn, database, collection)?
        .into_iter()
        .filter_map(|keys| keys.into_iter().next().map(|(field, _)| field))
        .collect())
}

fn load_index_keys(conn: &Connection, database: &str, collection: &str) -> Result<Vec<Vec<(String, i32)>>, StoreError> {
    let mut stmt = conn.prepare("SELECT keys FROM indexes WHERE database = ?1 AND collection = ?2 ORDER BY name")?;
    let rows = stmt.query_map(params![database, collection], |row| row.get::<_, String>(0))?;
    let mut keys = Vec::new();
    for row in rows {
        keys.push(serde_json::from_str(&row?)?);
    }
    Ok(keys)
}

fn register_collection(conn: &Connection, database: &str, collection: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO collections (database, collection) VALUES (?1, ?2)",
        params![database, collection],
    )?;
    Ok(())
}

fn insert_document(conn: &Connection, database: &str, collection: &str, mut doc: Document) -> Result<String, StoreError> {
    let id = ensure_id(&mut doc);
    let body = serde_json::to_string(&doc)?;
    let result = conn.execute(
        "INSERT INTO documents (database, collection, id, body, arrays) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![database, collection, id, body, array_fields(&doc)?],
    );
    match result {
        Ok(_) => Ok(id),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            Err(StoreError::DuplicateKey(id))
        }
        Err(e) => Err(e.into()),
    }
}

fn collection_stats(conn: &Connection, database: &str, collection: &str) -> Result<CollectionStats, StoreError> {
    let mut docs = Vec::new();
    scan(conn, database, collection, &Document::new(), |_, doc| {
        docs.push(doc);
        true
    })?;
    let keys = load_index_keys(conn, database, collection)?;
    Ok(CollectionStats::estimate(&docs, &keys))
}

fn list_collections(conn: &Connection, database: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare("SELECT collection FROM collections WHERE database = ?1 ORDER BY collection")?;
    let rows = stmt.query_map(params![database], |row| row.get::<_, String>(0))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }
    Ok(names)
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        with_conn(&self.conn, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        with_conn(&self.conn, |conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT database FROM collections ORDER BY database")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut names = Vec::new();
            for row in rows {
                names.push(row?);
            }
            Ok(names)
        })
        .await
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        let database = database.to_string();
        with_conn(&self.conn, move |conn| list_collections(conn, &database)).await
    }

    fn collection(&self, database: &str, collection: &str) -> Arc<dyn Collection> {
        Arc::new(SqliteCollection {
            conn: self.conn.clone(),
            database: database.to_string(),
            collection: collection.to_string(),
        })
    }

    async fn database_stats(&self, database: &str) -> Result<DatabaseStats, StoreError> {
        let database = database.to_string();
        with_conn(&self.conn, move |conn| {
            let mut stats = Vec::new();
            for name in list_collections(conn, &database)? {
                stats.push(collection_stats(conn, &database, &name)?);
            }
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            let free_pages: i64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
            Ok(DatabaseStats::aggregate(&stats, (page_size * free_pages).max(0) as u64))
        })
        .await
    }

    async fn collection_stats(&self, database: &str, collection: &str) -> Result<CollectionStats, StoreError> {
        let (database, collection) = (database.to_string(), collection.to_string());
        with_conn(&self.conn, move |conn| collection_stats(conn, &database, &collection)).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))?
            .take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            debug!("SQLite document store closed");
        }
        Ok(())
    }
}

/// Collection handle into a SqliteStore
struct SqliteCollection {
    conn: SharedConnection,
    database: String,
    collection: String,
}

impl SqliteCollection {
    fn namespace(&self) -> (String, String) {
        (self.database.clone(), self.collection.clone())
    }
}

#[async_trait]
impl Collection for SqliteCollection {
    fn database_name(&self) -> &str {
        &self.database
    }

    fn collection_name(&self) -> &str {
        &self.collection
    }

    async fn insert_one(&self, doc: Document) -> Result<String, StoreError> {
        let (database, collection) = self.namespace();
        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            register_collection(&tx, &database, &collection)?;
            let id = insert_document(&tx, &database, &collection, doc)?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<String>, StoreError> {
        let (database, collection) = self.namespace();
        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            register_collection(&tx, &database, &collection)?;
            let mut ids = Vec::with_capacity(docs.len());
            for doc in docs {
                ids.push(insert_document(&tx, &database, &collection, doc)?);
            }
            tx.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn find(&self, filter: &Document, options: FindOptions) -> Result<Vec<Document>, StoreError> {
        let (database, collection) = self.namespace();
        let filter = filter.clone();
        with_conn(&self.conn, move |conn| {
            if options.limit == Some(0) {
                return Ok(Vec::new());
            }
            // Without a sort the natural order is final, so stop at the limit
            let stop_at = if options.sort.is_none() { options.limit } else { None };
            let mut docs = Vec::new();
            scan(conn, &database, &collection, &filter, |_, doc| {
                docs.push(doc);
                stop_at.map_or(true, |limit| docs.len() < limit)
            })?;
            document::select(docs, &Document::new(), &options)
        })
        .await
    }

    async fn find_one(&self, filter: &Document) -> Result<Option<Document>, StoreError> {
        let (database, collection) = self.namespace();
        let filter = filter.clone();
        with_conn(&self.conn, move |conn| {
            Ok(first_match(conn, &database, &collection, &filter)?.map(|(_, doc)| doc))
        })
        .await
    }

    async fn update_one(&self, filter: &Document, update: &Update) -> Result<UpdateResult, StoreError> {
        let (database, collection) = self.namespace();
        let (filter, update) = (filter.clone(), update.clone());
        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let mut result = UpdateResult {
                acknowledged: true,
                ..Default::default()
            };
            if let Some((seq, mut doc)) = first_match(&tx, &database, &collection, &filter)? {
                result.matched_count = 1;
                if document::apply_update(&mut doc, &update)? {
                    tx.execute(
                        "UPDATE documents SET body = ?1, arrays = ?2 WHERE seq = ?3",
                        params![serde_json::to_string(&doc)?, array_fields(&doc)?, seq],
                    )?;
                    result.modified_count = 1;
                }
            }
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    async fn delete_one(&self, filter: &Document) -> Result<DeleteResult, StoreError> {
        let (database, collection) = self.namespace();
        let filter = filter.clone();
        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let deleted_count = match first_match(&tx, &database, &collection, &filter)? {
                Some((seq, _)) => tx.execute("DELETE FROM documents WHERE seq = ?1", params![seq])? as u64,
                None => 0,
            };
            tx.commit()?;
            Ok(DeleteResult {
                acknowledged: true,
                deleted_count,
            })
        })
        .await
    }

    async fn delete_many(&self, filter: &Document) -> Result<DeleteResult, StoreError> {
        let (database, collection) = self.namespace();
        let filter = filter.clone();
        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let mut doomed = Vec::new();
            scan(&tx, &database, &collection, &filter, |seq, _| {
                doomed.push(seq);
                true
            })?;
            let mut deleted_count = 0;
            for seq in doomed {
                deleted_count += tx.execute("DELETE FROM documents WHERE seq = ?1", params![seq])? as u64;
            }
            tx.commit()?;
            Ok(DeleteResult {
                acknowledged: true,
                deleted_count,
            })
        })
        .await
    }

    async fn count_documents(&self, filter: &Document, limit: Option<u64>) -> Result<u64, StoreError> {
        let (database, collection) = self.namespace();
        let filter = filter.clone();
        with_conn(&self.conn, move |conn| {
            if limit == Some(0) {
                return Ok(0);
            }
            let mut count = 0u64;
            scan(conn, &database, &collection, &filter, |_, _| {
                count += 1;
                limit.map_or(true, |limit| count < limit)
            })?;
            Ok(count)
        })
        .await
    }

    async fn create_index(&self, keys: &[(String, i32)]) -> Result<String, StoreError> {
        let (database, collection) = self.namespace();
        let name = document::index_name(keys);
        let encoded = serde_json::to_string(keys)?;
        // `_id` lookups already use the unique (database, collection, id) key
        let columns = if keys.iter().any(|(field, _)| field == ID_FIELD) {
            None
        } else {
            index_columns(keys)
        };
        let index = name.clone();
        with_conn(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            register_collection(&tx, &database, &collection)?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT name FROM indexes WHERE database = ?1 AND collection = ?2 AND name = ?3",
                    params![database, collection, index],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_none() {
                tx.execute(
                    "INSERT INTO indexes (database, collection, name, keys) VALUES (?1, ?2, ?3, ?4)",
                    params![database, collection, index, encoded],
                )?;
            }
            match &columns {
                Some(columns) => {
                    tx.execute_batch(&format!(
                        "CREATE INDEX IF NOT EXISTS \"{}\" ON documents (database, collection, {})",
                        sql_index_name(&database, &collection, &index),
                        columns
                    ))?;
                    debug!("Created index {} on {}.{}", index, database, collection);
                }
                None => debug!("Recorded index {} on {}.{} without a SQL index", index, database, collection),
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        Ok(name)
    }
}
