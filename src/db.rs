use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub struct DatabaseBootstrap {
    pub context: DatabaseContext,
    /// True when the database file did not exist before this bootstrap.
    pub created: bool,
}

/// Shared handle to the SQLite connection.
///
/// Statements lock the connection for their own duration only, so a long
/// ingestion never starves the query endpoints.
#[derive(Clone)]
pub struct Store {
    connection: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Store {
    pub fn new(context: DatabaseContext) -> Self {
        Self {
            connection: Arc::new(Mutex::new(context.connection)),
            path: context.path,
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> AppResult<Self> {
        let connection = Connection::open_in_memory()?;
        configure(&connection)?;
        run_migrations(&connection)?;
        Ok(Self::new(DatabaseContext {
            connection,
            path: PathBuf::from(":memory:"),
        }))
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseBootstrap> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);
    let created = !db_path.exists();

    let context = establish_context(&db_path)?;
    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        created,
        "SQLite context established"
    );
    Ok(DatabaseBootstrap { context, created })
}

fn establish_context(db_path: &Path) -> AppResult<DatabaseContext> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;

    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS police_data (
            id INTEGER PRIMARY KEY,
            aos_number TEXT,
            city TEXT,
            county TEXT,
            state TEXT,
            agency TEXT,
            type_of_lea TEXT,
            summary TEXT,
            type_of_juris TEXT,
            technology TEXT,
            vendor TEXT,
            link1 TEXT,
            link1_snapshot TEXT,
            link1_source TEXT,
            link1_type TEXT,
            link1_date TEXT,
            link2 TEXT,
            link2_snapshot TEXT,
            link2_source TEXT,
            link2_type TEXT,
            link2_date TEXT,
            link3 TEXT,
            link3_snapshot TEXT,
            link3_source TEXT,
            link3_type TEXT,
            link3_date TEXT,
            other_links TEXT,
            latitude REAL,
            longitude REAL,
            CHECK ((latitude IS NULL) = (longitude IS NULL)),
            CHECK (latitude IS NULL OR latitude BETWEEN -90.0 AND 90.0),
            CHECK (longitude IS NULL OR longitude BETWEEN -180.0 AND 180.0)
        );

        CREATE TABLE IF NOT EXISTS geocode_cache (
            city TEXT NOT NULL,
            state TEXT NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            source TEXT NOT NULL CHECK (source IN ('live', 'fallback')),
            created_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            PRIMARY KEY (city, state),
            CHECK (latitude BETWEEN -90.0 AND 90.0),
            CHECK (longitude BETWEEN -180.0 AND 180.0)
        );

        CREATE TABLE IF NOT EXISTS ingestion_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_name TEXT NOT NULL,
            source_digest TEXT NOT NULL,
            dataset TEXT NOT NULL,
            total_rows INTEGER NOT NULL,
            stored_rows INTEGER NOT NULL,
            skipped_rows INTEGER NOT NULL,
            completed_at TEXT NOT NULL
        );
        "#,
    )?;

    ensure_column(connection, "police_data", "dataset TEXT NOT NULL DEFAULT 'atlas'")?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_police_data_lat_lng ON police_data(latitude, longitude)",
        [],
    )?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_police_data_city_state ON police_data(city, state)",
        [],
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}
