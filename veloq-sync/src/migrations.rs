use std::time::Instant;

use log::info;
use rusqlite::Connection;
use rusqlite_migration::{M, Migrations};

use crate::{Result, elapsed_ms};

/// Schema steps, applied in order and tracked through `user_version`.
const STEPS: &[&str] = &[
    // v1: per-activity bounds and the single-row synced range
    "CREATE TABLE activity_bounds (
        activity_id TEXT PRIMARY KEY,
        min_lat REAL NOT NULL,
        max_lat REAL NOT NULL,
        min_lng REAL NOT NULL,
        max_lng REAL NOT NULL,
        sport_type TEXT NOT NULL,
        distance_meters REAL NOT NULL DEFAULT 0,
        start_date TEXT NOT NULL
    );
    CREATE TABLE sync_range (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        oldest_synced_date TEXT,
        newest_synced_date TEXT,
        last_synced_at TEXT,
        CHECK ((oldest_synced_date IS NULL) = (newest_synced_date IS NULL))
    );
    INSERT INTO sync_range (id) VALUES (1);",
    // v2: timeline queries walk activities by date
    "CREATE INDEX idx_activity_bounds_start_date ON activity_bounds(start_date);",
    // v3: engine metadata (always loaded) and GPS tracks (loaded on demand)
    "CREATE TABLE activities (
        id TEXT PRIMARY KEY,
        sport_type TEXT NOT NULL,
        min_lat REAL NOT NULL,
        max_lat REAL NOT NULL,
        min_lng REAL NOT NULL,
        max_lng REAL NOT NULL,
        distance_meters REAL NOT NULL DEFAULT 0,
        created_at INTEGER DEFAULT (strftime('%s', 'now'))
    );
    CREATE TABLE gps_tracks (
        activity_id TEXT PRIMARY KEY,
        track_data BLOB NOT NULL,
        point_count INTEGER NOT NULL,
        FOREIGN KEY (activity_id) REFERENCES activities(id) ON DELETE CASCADE
    );
    CREATE INDEX idx_activities_created_at ON activities(created_at);",
];

/// The engine store and the bounds cache open their own connections to the
/// same file, so both run this one list.
fn migrations() -> Migrations<'static> {
    Migrations::new(STEPS.iter().map(|sql| M::up(sql)).collect())
}

/// Bring the database schema up to date. Safe to call from every
/// connection; applied versions are skipped.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let start = Instant::now();
    migrations().to_latest(conn)?;
    info!("[Schema] Up to date ({} ms)", elapsed_ms(start));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table_count(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
             AND name IN ('activity_bounds', 'sync_range', 'activities', 'gps_tracks')",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_range", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(table_count(&conn), 4);
    }

    #[test]
    fn test_second_connection_sees_one_schema_version() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("veloq.db");

        let mut engine_conn = Connection::open(&path).unwrap();
        migrate(&mut engine_conn).unwrap();
        let mut cache_conn = Connection::open(&path).unwrap();
        migrate(&mut cache_conn).unwrap();

        let version: i64 = cache_conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, STEPS.len() as i64);
        assert_eq!(table_count(&cache_conn), 4);
    }

    #[test]
    fn test_cache_only_file_gains_engine_tables() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("veloq.db");

        // A file written before the engine tables joined the list
        let mut conn = Connection::open(&path).unwrap();
        Migrations::new(STEPS[..2].iter().map(|sql| M::up(sql)).collect())
            .to_latest(&mut conn)
            .unwrap();
        conn.execute(
            "UPDATE sync_range SET oldest_synced_date = '2024-01-01',
             newest_synced_date = '2024-03-01' WHERE id = 1",
            [],
        )
        .unwrap();

        migrate(&mut conn).unwrap();
        assert_eq!(table_count(&conn), 4);
        let oldest: String = conn
            .query_row("SELECT oldest_synced_date FROM sync_range", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(oldest, "2024-01-01");
    }
}
