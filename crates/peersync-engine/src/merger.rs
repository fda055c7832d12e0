use std::collections::HashMap;
use std::path::Path;

use peersync_core::{Operation, OperationKind, SyncError};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, warn};

/// Primary key column the merger re-keys on. Tables synced through peersync
/// carry an integer `id` primary key.
const PK_COLUMN: &str = "id";

/// Applies a logged operation batch onto a target snapshot.
///
/// The whole batch runs in one immediate transaction: any unexpected error
/// rolls everything back and the caller keeps the operations pending.
/// Replay rules:
/// - inserts drop the origin's primary key so the target assigns a fresh one
/// - updates against a row deleted remotely are skipped silently
/// - deletes of rows still referenced in the target are skipped to protect
///   referential integrity
#[derive(Debug, Clone)]
pub struct DatabaseMerger {
    expected_tables: Vec<String>,
    schema_sql: Option<String>,
}

impl DatabaseMerger {
    pub fn new(expected_tables: Vec<String>, schema_sql: Option<String>) -> Self {
        Self {
            expected_tables,
            schema_sql,
        }
    }

    /// Verify the target contains the expected tables, creating missing
    /// structure from the configured DDL.
    pub fn ensure_schema(&self, target: &Path) -> Result<(), SyncError> {
        if self.expected_tables.is_empty() {
            return Ok(());
        }
        let conn = Connection::open(target)
            .map_err(|e| SyncError::Schema(format!("Failed to open snapshot: {}", e)))?;

        if self.missing_tables(&conn)?.is_empty() {
            return Ok(());
        }

        let sql = self.schema_sql.as_ref().ok_or_else(|| {
            SyncError::Schema("Snapshot lacks expected tables and no schema DDL is configured".into())
        })?;
        conn.execute_batch(sql)
            .map_err(|e| SyncError::Schema(format!("Failed to create schema: {}", e)))?;

        let still_missing = self.missing_tables(&conn)?;
        if !still_missing.is_empty() {
            return Err(SyncError::Schema(format!(
                "Tables still missing after schema creation: {}",
                still_missing.join(", ")
            )));
        }
        debug!("Recovered missing schema in {}", target.display());
        Ok(())
    }

    /// Replay `operations` onto `target` inside a single transaction.
    pub fn merge_operations(
        &self,
        target: &Path,
        operations: &[Operation],
    ) -> Result<(), SyncError> {
        if operations.is_empty() {
            return Ok(());
        }
        let mut conn = Connection::open(target)
            .map_err(|e| SyncError::Merge(format!("Failed to open snapshot: {}", e)))?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| SyncError::Merge(format!("Failed to begin transaction: {}", e)))?;

        let references = inbound_references(&tx)
            .map_err(|e| SyncError::Merge(format!("Failed to read schema references: {}", e)))?;

        for op in operations {
            apply_operation(&tx, op, &references)
                .map_err(|e| SyncError::Merge(format!("Operation {} failed: {}", op.sequence_id, e)))?;
        }

        tx.commit()
            .map_err(|e| SyncError::Merge(format!("Failed to commit merge: {}", e)))?;
        debug!(
            "Merged {} operations into {}",
            operations.len(),
            target.display()
        );
        Ok(())
    }

    fn missing_tables(&self, conn: &Connection) -> Result<Vec<String>, SyncError> {
        let mut missing = Vec::new();
        for table in &self.expected_tables {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    [table],
                    |row| row.get(0),
                )
                .map_err(|e| SyncError::Schema(format!("Failed to inspect schema: {}", e)))?;
            if !exists {
                missing.push(table.clone());
            }
        }
        Ok(missing)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn value_to_sql(value: &serde_json::Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        serde_json::Value::Null => Sql::Null,
        serde_json::Value::Bool(b) => Sql::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Sql::Text(s.clone()),
        // Nested structures are stored as their JSON text.
        other => Sql::Text(other.to_string()),
    }
}

/// Map of table name -> (referencing table, referencing column) pairs,
/// built from `foreign_key_list` across all user tables.
fn inbound_references(
    conn: &Connection,
) -> rusqlite::Result<HashMap<String, Vec<(String, String)>>> {
    let mut tables = Vec::new();
    {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for table in rows {
            tables.push(table?);
        }
    }

    let mut references: HashMap<String, Vec<(String, String)>> = HashMap::new();
    for table in &tables {
        let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(table)))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>("table")?, row.get::<_, String>("from")?))
        })?;
        for row in rows {
            let (referenced, from_column) = row?;
            references
                .entry(referenced)
                .or_default()
                .push((table.clone(), from_column));
        }
    }
    Ok(references)
}

fn apply_operation(
    conn: &Connection,
    op: &Operation,
    references: &HashMap<String, Vec<(String, String)>>,
) -> rusqlite::Result<()> {
    match op.kind {
        OperationKind::Insert => apply_insert(conn, op),
        OperationKind::Update => apply_update(conn, op),
        OperationKind::Delete => apply_delete(conn, op, references),
    }
}

fn apply_insert(conn: &Connection, op: &Operation) -> rusqlite::Result<()> {
    // Strip the origin's primary key; the target assigns a fresh one.
    let columns: Vec<(&String, &serde_json::Value)> = op
        .payload
        .iter()
        .filter(|(name, _)| name.as_str() != PK_COLUMN)
        .collect();

    if columns.is_empty() {
        conn.execute(
            &format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&op.table)),
            [],
        )?;
        return Ok(());
    }

    let names: Vec<String> = columns.iter().map(|(n, _)| quote_ident(n)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&op.table),
        names.join(", "),
        placeholders.join(", ")
    );
    let params: Vec<rusqlite::types::Value> =
        columns.iter().map(|(_, v)| value_to_sql(v)).collect();
    conn.execute(&sql, rusqlite::params_from_iter(params))?;
    Ok(())
}

fn apply_update(conn: &Connection, op: &Operation) -> rusqlite::Result<()> {
    let columns: Vec<(&String, &serde_json::Value)> = op
        .payload
        .iter()
        .filter(|(name, _)| name.as_str() != PK_COLUMN)
        .collect();
    if columns.is_empty() {
        return Ok(());
    }

    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, (n, _))| format!("{} = ?{}", quote_ident(n), i + 1))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?{}",
        quote_ident(&op.table),
        assignments.join(", "),
        quote_ident(PK_COLUMN),
        columns.len() + 1
    );
    let mut params: Vec<rusqlite::types::Value> =
        columns.iter().map(|(_, v)| value_to_sql(v)).collect();
    params.push(rusqlite::types::Value::Integer(op.local_id));

    let affected = conn.execute(&sql, rusqlite::params_from_iter(params))?;
    if affected == 0 {
        // The row was deleted remotely; the update loses by arrival order.
        debug!(
            "Skipping update of {}.{} (row absent in target)",
            op.table, op.local_id
        );
    }
    Ok(())
}

fn apply_delete(
    conn: &Connection,
    op: &Operation,
    references: &HashMap<String, Vec<(String, String)>>,
) -> rusqlite::Result<()> {
    if let Some(inbound) = references.get(&op.table) {
        for (ref_table, ref_column) in inbound {
            let referenced: bool = conn.query_row(
                &format!(
                    "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?1)",
                    quote_ident(ref_table),
                    quote_ident(ref_column)
                ),
                [op.local_id],
                |row| row.get(0),
            )?;
            if referenced {
                warn!(
                    "Skipping delete of {}.{}: still referenced by {}.{}",
                    op.table, op.local_id, ref_table, ref_column
                );
                return Ok(());
            }
        }
    }

    conn.execute(
        &format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(&op.table),
            quote_ident(PK_COLUMN)
        ),
        [op.local_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{Map, Value};
    use tempfile::TempDir;

    const SCHEMA: &str = "
        CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
        CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            customer_id INTEGER REFERENCES customers(id),
            item TEXT NOT NULL
        );
    ";

    fn setup() -> (DatabaseMerger, TempDir, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("snapshot.db");
        let conn = Connection::open(&db).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        let merger = DatabaseMerger::new(
            vec!["customers".to_string(), "orders".to_string()],
            Some(SCHEMA.to_string()),
        );
        (merger, dir, db)
    }

    fn op(kind: OperationKind, table: &str, local_id: i64, pairs: &[(&str, Value)]) -> Operation {
        let payload: Map<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Operation {
            sequence_id: 0,
            kind,
            table: table.to_string(),
            local_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    fn count(db: &Path, table: &str) -> i64 {
        let conn = Connection::open(db).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn insert_assigns_a_fresh_primary_key() {
        let (merger, _dir, db) = setup();
        {
            let conn = Connection::open(&db).unwrap();
            conn.execute("INSERT INTO customers (id, name) VALUES (10, 'existing')", [])
                .unwrap();
        }

        // The origin's key (and any id smuggled in the payload) is dropped.
        let insert = op(
            OperationKind::Insert,
            "customers",
            3,
            &[("id", Value::from(999)), ("name", Value::from("fresh"))],
        );
        merger.merge_operations(&db, &[insert]).unwrap();

        let conn = Connection::open(&db).unwrap();
        let id: i64 = conn
            .query_row("SELECT id FROM customers WHERE name = 'fresh'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(id, 11);
    }

    #[test]
    fn update_of_absent_row_is_skipped_silently() {
        let (merger, _dir, db) = setup();
        let update = op(
            OperationKind::Update,
            "customers",
            42,
            &[("name", Value::from("renamed"))],
        );
        merger.merge_operations(&db, &[update]).unwrap();
        assert_eq!(count(&db, "customers"), 0);
    }

    #[test]
    fn update_of_present_row_applies() {
        let (merger, _dir, db) = setup();
        {
            let conn = Connection::open(&db).unwrap();
            conn.execute("INSERT INTO customers (id, name) VALUES (1, 'old')", [])
                .unwrap();
        }
        let update = op(
            OperationKind::Update,
            "customers",
            1,
            &[("name", Value::from("new"))],
        );
        merger.merge_operations(&db, &[update]).unwrap();

        let conn = Connection::open(&db).unwrap();
        let name: String = conn
            .query_row("SELECT name FROM customers WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "new");
    }

    #[test]
    fn delete_of_referenced_row_is_skipped() {
        let (merger, _dir, db) = setup();
        {
            let conn = Connection::open(&db).unwrap();
            conn.execute("INSERT INTO customers (id, name) VALUES (1, 'kept')", [])
                .unwrap();
            conn.execute(
                "INSERT INTO orders (id, customer_id, item) VALUES (1, 1, 'widget')",
                [],
            )
            .unwrap();
        }

        let delete = op(OperationKind::Delete, "customers", 1, &[]);
        merger.merge_operations(&db, &[delete]).unwrap();
        assert_eq!(count(&db, "customers"), 1);
    }

    #[test]
    fn delete_of_unreferenced_row_applies() {
        let (merger, _dir, db) = setup();
        {
            let conn = Connection::open(&db).unwrap();
            conn.execute("INSERT INTO customers (id, name) VALUES (1, 'gone')", [])
                .unwrap();
        }
        let delete = op(OperationKind::Delete, "customers", 1, &[]);
        merger.merge_operations(&db, &[delete]).unwrap();
        assert_eq!(count(&db, "customers"), 0);
    }

    #[test]
    fn failed_merge_rolls_back_the_whole_batch() {
        let (merger, _dir, db) = setup();
        let good = op(
            OperationKind::Insert,
            "customers",
            1,
            &[("name", Value::from("casualty"))],
        );
        let bad = op(
            OperationKind::Insert,
            "no_such_table",
            1,
            &[("name", Value::from("boom"))],
        );

        let result = merger.merge_operations(&db, &[good, bad]);
        assert!(matches!(result, Err(SyncError::Merge(_))));
        // The successful first insert was rolled back too.
        assert_eq!(count(&db, "customers"), 0);
    }

    #[test]
    fn ensure_schema_creates_missing_structure() {
        let (merger, dir, _db) = setup();
        let fresh = dir.path().join("fresh.db");
        Connection::open(&fresh).unwrap();

        merger.ensure_schema(&fresh).unwrap();
        assert_eq!(count(&fresh, "customers"), 0);
    }

    #[test]
    fn ensure_schema_without_ddl_reports_schema_error() {
        let (_, dir, _db) = setup();
        let merger = DatabaseMerger::new(vec!["customers".to_string()], None);
        let fresh = dir.path().join("fresh.db");
        Connection::open(&fresh).unwrap();

        assert!(matches!(
            merger.ensure_schema(&fresh),
            Err(SyncError::Schema(_))
        ));
    }
}
