use jpnative_core::build::BuildCache;
use jpnative_core::db::migrations::latest_version;
use jpnative_core::db::{open_db, open_db_in_memory, DbError};
use jpnative_core::{ArtifactHandle, BuildDriver, BuildError, LoaderConfig, Platform};
use rusqlite::Connection;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    assert_table_exists(&conn, "build_cache");
}

#[test]
fn opening_same_index_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("build-cache.db");

    let conn_first = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_first), latest_version());
    drop(conn_first);

    let conn_second = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn_second), latest_version());
    assert_table_exists(&conn_second, "build_cache");
}

#[test]
fn opening_index_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn driver_refuses_index_written_by_newer_binary() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoaderConfig::new(dir.path(), Platform::Linux);

    let conn = Connection::open(config.cache_index_path()).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = BuildDriver::new(config).unwrap_err();
    assert!(matches!(
        err,
        BuildError::Cache(DbError::UnsupportedSchemaVersion { .. })
    ));
}

#[test]
fn index_rows_survive_reopen_and_drop_when_artifact_vanishes() {
    let dir = tempfile::tempdir().unwrap();
    let index_path = dir.path().join("build-cache.db");
    let library = dir.path().join("libmath.so");
    std::fs::write(&library, b"lib").unwrap();
    let handle = ArtifactHandle::compiled(
        "math",
        Platform::Linux,
        "a".repeat(64),
        library.clone(),
        Some("gnu:g++".to_string()),
    );

    let cache = BuildCache::open(&index_path).unwrap();
    cache.insert(&handle).unwrap();
    drop(cache);

    let reopened = BuildCache::open(&index_path).unwrap();
    assert_eq!(reopened.memory_len(), 0);
    let found = reopened.get(&handle.cache_key).unwrap().unwrap();
    assert_eq!(found.module_name, "math");
    assert_eq!(found.toolchain.as_deref(), Some("gnu:g++"));
    assert_eq!(found.files(), vec![library.as_path()]);

    std::fs::remove_file(&library).unwrap();
    assert!(reopened.get(&handle.cache_key).unwrap().is_none());
    assert_eq!(row_count(&index_path), 0);
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn row_count(path: &std::path::Path) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row("SELECT COUNT(*) FROM build_cache;", [], |row| row.get(0))
        .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}
