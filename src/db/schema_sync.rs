//! Automatic schema synchronization
//!
//! Compares the table definitions below to the current database schema:
//! - Creates missing tables and indexes
//! - Adds missing columns to tables written by older versions
//! - Does NOT handle column renames or type changes

use std::collections::HashSet;

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

/// A column that may be missing from a table created by an older version,
/// with the declaration used to add it
#[derive(Debug, Clone, Copy)]
pub struct ColumnPatch {
    pub column: &'static str,
    /// Type and constraints; NOT NULL columns must carry a DEFAULT
    pub decl: &'static str,
}

/// A table the store owns
#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub table: &'static str,
    pub create_sql: &'static str,
    pub patches: &'static [ColumnPatch],
}

const fn patch(column: &'static str, decl: &'static str) -> ColumnPatch {
    ColumnPatch { column, decl }
}

pub const MEDIA_STATE: TableDef = TableDef {
    table: "media_state",
    create_sql: r#"
        CREATE TABLE IF NOT EXISTS media_state (
            rating_key TEXT PRIMARY KEY,
            library TEXT,
            title TEXT,
            updated_at TEXT,
            state TEXT,
            note TEXT,
            last_scan TEXT
        )
    "#,
    patches: &[
        patch("library", "TEXT"),
        patch("title", "TEXT"),
        patch("updated_at", "TEXT"),
        patch("state", "TEXT"),
        patch("note", "TEXT"),
        patch("last_scan", "TEXT"),
    ],
};

pub const SCAN_RUNS: TableDef = TableDef {
    table: "scan_runs",
    create_sql: r#"
        CREATE TABLE IF NOT EXISTS scan_runs (
            job_id TEXT PRIMARY KEY,
            source TEXT NOT NULL DEFAULT 'manual',
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            log_path TEXT,
            stats_json TEXT,
            error TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0
        )
    "#,
    patches: &[
        patch("source", "TEXT NOT NULL DEFAULT 'manual'"),
        patch("finished_at", "TEXT"),
        patch("log_path", "TEXT"),
        patch("stats_json", "TEXT"),
        patch("error", "TEXT"),
        patch("cancel_requested", "INTEGER NOT NULL DEFAULT 0"),
    ],
};

pub const APP_SETTINGS: TableDef = TableDef {
    table: "app_settings",
    create_sql: r#"
        CREATE TABLE IF NOT EXISTS app_settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT ''
        )
    "#,
    patches: &[patch("updated_at", "TEXT NOT NULL DEFAULT ''")],
};

const TABLES: &[TableDef] = &[MEDIA_STATE, SCAN_RUNS, APP_SETTINGS];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_media_state_state_last_scan ON media_state(state, last_scan)",
    "CREATE INDEX IF NOT EXISTS idx_scan_runs_status ON scan_runs(status)",
    "CREATE INDEX IF NOT EXISTS idx_scan_runs_started_at ON scan_runs(started_at)",
];

/// What a sync changed, and what it could not
#[derive(Debug, Default)]
pub struct SchemaSyncResult {
    pub tables_created: Vec<&'static str>,
    /// (table, column)
    pub columns_added: Vec<(&'static str, &'static str)>,
    pub errors: Vec<String>,
}

impl SchemaSyncResult {
    fn changed(&self) -> bool {
        !self.tables_created.is_empty() || !self.columns_added.is_empty()
    }

    fn fail(&mut self, msg: String) {
        warn!(service = "database", "{}", msg);
        self.errors.push(msg);
    }
}

/// Column names of `table`, or `None` if the table does not exist
async fn existing_columns(pool: &SqlitePool, table: &str) -> Result<Option<HashSet<String>>, sqlx::Error> {
    let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info(?1)")
        .bind(table)
        .fetch_all(pool)
        .await?;

    Ok((!names.is_empty()).then(|| names.into_iter().map(|(name,)| name).collect()))
}

fn add_column_sql(table: &str, patch: &ColumnPatch) -> String {
    format!("ALTER TABLE {} ADD COLUMN {} {}", table, patch.column, patch.decl)
}

async fn sync_table(pool: &SqlitePool, def: &TableDef, result: &mut SchemaSyncResult) -> Result<(), sqlx::Error> {
    let Some(present) = existing_columns(pool, def.table).await? else {
        debug!(table = def.table, "Creating table");
        match sqlx::query(def.create_sql.trim()).execute(pool).await {
            Ok(_) => result.tables_created.push(def.table),
            Err(e) => result.fail(format!("Failed to create table {}: {}", def.table, e)),
        }
        return Ok(());
    };

    for patch in def.patches.iter().filter(|p| !present.contains(p.column)) {
        match sqlx::query(&add_column_sql(def.table, patch)).execute(pool).await {
            Ok(_) => {
                info!(service = "database", table = def.table, column = patch.column, "Added missing column");
                result.columns_added.push((def.table, patch.column));
            }
            Err(e) => result.fail(format!("Failed to add column {}.{}: {}", def.table, patch.column, e)),
        }
    }
    Ok(())
}

/// Bring every table and index up to date.
///
/// Per-statement failures are collected in the result; only failing to
/// inspect the schema at all is an `Err`.
pub async fn sync_schema(pool: &SqlitePool) -> Result<SchemaSyncResult, sqlx::Error> {
    let mut result = SchemaSyncResult::default();

    for def in TABLES {
        sync_table(pool, def, &mut result).await?;
    }
    for index_sql in INDEXES {
        if let Err(e) = sqlx::query(index_sql).execute(pool).await {
            result.fail(format!("Failed to create index: {}", e));
        }
    }

    if result.changed() {
        info!(
            service = "database",
            tables_created = ?result.tables_created,
            columns_added = result.columns_added.len(),
            "Schema updated"
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_creates_all_tables() {
        let pool = memory_pool().await;
        let result = sync_schema(&pool).await.unwrap();
        assert_eq!(result.tables_created.len(), 3);
        assert!(result.errors.is_empty());

        // Second run is a no-op
        let again = sync_schema(&pool).await.unwrap();
        assert!(again.tables_created.is_empty());
        assert!(again.columns_added.is_empty());
    }

    #[tokio::test]
    async fn test_adds_columns_missing_from_older_databases() {
        let pool = memory_pool().await;
        sqlx::query(
            "CREATE TABLE scan_runs (job_id TEXT PRIMARY KEY, status TEXT NOT NULL, \
             started_at TEXT NOT NULL, finished_at TEXT, log_path TEXT, stats_json TEXT, error TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let result = sync_schema(&pool).await.unwrap();
        assert_eq!(
            result.columns_added,
            vec![("scan_runs", "source"), ("scan_runs", "cancel_requested")]
        );

        let columns = existing_columns(&pool, "scan_runs").await.unwrap().unwrap();
        assert!(columns.contains("cancel_requested"));
        assert!(existing_columns(&pool, "nope").await.unwrap().is_none());
    }

    #[test]
    fn test_add_column_sql() {
        let sql = add_column_sql("scan_runs", &patch("cancel_requested", "INTEGER NOT NULL DEFAULT 0"));
        assert_eq!(sql, "ALTER TABLE scan_runs ADD COLUMN cancel_requested INTEGER NOT NULL DEFAULT 0");
    }
}
