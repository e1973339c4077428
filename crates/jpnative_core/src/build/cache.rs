//! Content-addressed cache of compiled artifacts.
//!
//! # Responsibility
//! - Map cache keys to previously compiled libraries.
//! - Optionally persist the mapping in a SQLite index so later processes reuse builds.
//!
//! # Invariants
//! - `get` never returns a handle whose library file is gone; such entries are evicted.
//! - Only compiled artifacts are stored. Bundled artifacts are re-verified on every build.

use crate::build::artifact::{ArtifactHandle, ArtifactKind};
use crate::db::{open_db, open_db_in_memory, DbResult};
use crate::platform::parse_platform;
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const CACHE_SELECT_SQL: &str = "SELECT
    artifact_id,
    module_name,
    platform,
    library_path,
    toolchain
FROM build_cache";

/// Two-level artifact cache: process memory first, then the optional index.
#[derive(Debug)]
pub struct BuildCache {
    entries: Mutex<HashMap<String, ArtifactHandle>>,
    index: Option<Mutex<Connection>>,
}

impl BuildCache {
    /// Cache that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            index: None,
        }
    }

    /// Cache persisted to the index file at `path`.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        open_db(path).map(Self::with_connection)
    }

    /// Cache persisted to a throwaway in-memory index.
    pub fn open_in_memory_index() -> DbResult<Self> {
        open_db_in_memory().map(Self::with_connection)
    }

    /// Wraps an already bootstrapped connection.
    pub fn with_connection(conn: Connection) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            index: Some(Mutex::new(conn)),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.index.is_some()
    }

    /// Looks up a compiled artifact for `key`.
    ///
    /// # Errors
    /// - `DbError` when the index cannot be queried.
    pub fn get(&self, key: &str) -> DbResult<Option<ArtifactHandle>> {
        let cached = self.entries().get(key).cloned();
        if let Some(handle) = cached {
            if handle.files_exist() {
                return Ok(Some(handle));
            }
            warn!("event=cache_evict module=build status=ok layer=memory reason=missing_file key={key}");
            self.entries().remove(key);
        }

        let Some(index) = &self.index else {
            return Ok(None);
        };
        let conn = lock(index);
        let row = conn
            .query_row(
                &format!("{CACHE_SELECT_SQL} WHERE cache_key = ?1"),
                params![key],
                |row| parse_row(key, row),
            )
            .optional()?;

        match row {
            Some(Some(handle)) if handle.files_exist() => {
                debug!("event=cache_hit module=build status=ok layer=index key={key}");
                self.entries().insert(key.to_string(), handle.clone());
                Ok(Some(handle))
            }
            Some(_) => {
                warn!("event=cache_evict module=build status=ok layer=index reason=stale_row key={key}");
                conn.execute("DELETE FROM build_cache WHERE cache_key = ?1", params![key])?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Records a compiled artifact under its cache key. Bundled handles are ignored.
    pub fn insert(&self, handle: &ArtifactHandle) -> DbResult<()> {
        let ArtifactKind::Compiled { library } = &handle.kind else {
            return Ok(());
        };

        if let Some(index) = &self.index {
            lock(index).execute(
                "INSERT INTO build_cache (
                    cache_key,
                    artifact_id,
                    module_name,
                    platform,
                    library_path,
                    toolchain,
                    created_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(cache_key) DO UPDATE SET
                    artifact_id = excluded.artifact_id,
                    module_name = excluded.module_name,
                    platform = excluded.platform,
                    library_path = excluded.library_path,
                    toolchain = excluded.toolchain,
                    created_at_ms = excluded.created_at_ms",
                params![
                    handle.cache_key,
                    handle.id.to_string(),
                    handle.module_name,
                    handle.platform.as_str(),
                    library.to_string_lossy().into_owned(),
                    handle.toolchain,
                    now_ms(),
                ],
            )?;
        }
        self.entries()
            .insert(handle.cache_key.clone(), handle.clone());
        Ok(())
    }

    /// Forgets `key` in both layers. Files on disk are left alone.
    pub fn remove(&self, key: &str) -> DbResult<()> {
        self.entries().remove(key);
        if let Some(index) = &self.index {
            lock(index).execute("DELETE FROM build_cache WHERE cache_key = ?1", params![key])?;
        }
        Ok(())
    }

    /// Number of entries held in process memory.
    pub fn memory_len(&self) -> usize {
        self.entries().len()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, ArtifactHandle>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock(index: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    index.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns `None` for rows that no longer describe a usable artifact.
fn parse_row(key: &str, row: &Row<'_>) -> rusqlite::Result<Option<ArtifactHandle>> {
    let artifact_id: String = row.get(0)?;
    let module_name: String = row.get(1)?;
    let platform: String = row.get(2)?;
    let library_path: String = row.get(3)?;
    let toolchain: Option<String> = row.get(4)?;

    let (Ok(id), Ok(platform)) = (Uuid::parse_str(&artifact_id), parse_platform(&platform))
    else {
        return Ok(None);
    };
    Ok(Some(ArtifactHandle {
        id,
        module_name,
        platform,
        cache_key: key.to_string(),
        kind: ArtifactKind::Compiled {
            library: PathBuf::from(library_path),
        },
        toolchain,
    }))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::BuildCache;
    use crate::build::artifact::ArtifactHandle;
    use crate::platform::Platform;

    fn compiled_in(dir: &std::path::Path, key: &str) -> ArtifactHandle {
        let library = dir.join("libmath.so");
        std::fs::write(&library, b"\x7fELF").unwrap();
        ArtifactHandle::compiled("math", Platform::Linux, key, library, Some("gnu:g++".into()))
    }

    #[test]
    fn memory_cache_round_trips_and_evicts_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BuildCache::in_memory();
        let handle = compiled_in(dir.path(), "k1");

        cache.insert(&handle).unwrap();
        assert_eq!(cache.get("k1").unwrap(), Some(handle.clone()));

        std::fs::remove_file(handle.files()[0]).unwrap();
        assert_eq!(cache.get("k1").unwrap(), None);
        assert_eq!(cache.memory_len(), 0);
    }

    #[test]
    fn index_survives_a_fresh_cache_instance() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("cache.sqlite3");
        let handle = compiled_in(dir.path(), "k2");

        BuildCache::open(&index_path).unwrap().insert(&handle).unwrap();

        let reopened = BuildCache::open(&index_path).unwrap();
        assert!(reopened.is_persistent());
        let found = reopened.get("k2").unwrap().unwrap();
        assert_eq!(found.id, handle.id);
        assert_eq!(found.toolchain.as_deref(), Some("gnu:g++"));
    }

    #[test]
    fn stale_index_rows_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("cache.sqlite3");
        let handle = compiled_in(dir.path(), "k3");
        BuildCache::open(&index_path).unwrap().insert(&handle).unwrap();
        std::fs::remove_file(handle.files()[0]).unwrap();

        let reopened = BuildCache::open(&index_path).unwrap();
        assert_eq!(reopened.get("k3").unwrap(), None);

        let conn = crate::db::open_db(&index_path).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM build_cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn bundled_handles_are_not_cached() {
        let cache = BuildCache::open_in_memory_index().unwrap();
        let handle = ArtifactHandle::bundled("sdl", Platform::Linux, "k4", vec![], vec![]);
        cache.insert(&handle).unwrap();
        assert_eq!(cache.get("k4").unwrap(), None);
    }

    #[test]
    fn remove_forgets_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BuildCache::open_in_memory_index().unwrap();
        let handle = compiled_in(dir.path(), "k5");
        cache.insert(&handle).unwrap();
        cache.remove("k5").unwrap();
        assert_eq!(cache.get("k5").unwrap(), None);
    }
}
