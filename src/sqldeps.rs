//! SQLite persistence for the dependency table.
//!
//! Edges are offloaded as one row per key: `KEY_VERTEX` is the 31-bit
//! node, `VALUE_VERTEX` the concatenation of its successors as
//! little-endian 32-bit words. A `HEADER` row carries a magic constant
//! and the build info of the writer, checked again on load.
//!
//! The master saves and loads; workers only ever query, over a lazily
//! opened read-only connection whose path they learn from the filename
//! page of the shared region.

use std::path::{Path, PathBuf};
use std::time::Instant;

use log::info;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::Result;
use crate::shm::layout::PAGE_SIZE;
use crate::shm::SharedMem;

/// Sanity marker of a dependency database.
const MAGIC_CONSTANT: i64 = 0xFACE_FACE_FACE_B000u64 as i64;

/// Environment variable naming the companion file-info database consumed
/// by a higher layer.
pub const FILE_INFO_ON_DISK_PATH: &str = "FILE_INFO_ON_DISK_PATH";

/// Path of the file-info database, when one is configured and non-empty.
pub fn file_info_path() -> Option<PathBuf> {
    std::env::var_os(FILE_INFO_ON_DISK_PATH)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub fn set_file_info_path(path: &Path) {
    std::env::set_var(FILE_INFO_ON_DISK_PATH, path);
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS HEADER (MAGIC_CONSTANT INTEGER, BUILDINFO TEXT);
         CREATE TABLE IF NOT EXISTS DEPTABLE (KEY_VERTEX INTEGER PRIMARY KEY, VALUE_VERTEX BLOB);",
    )?;
    Ok(())
}

fn write_header(conn: &Connection, build_info: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO HEADER (MAGIC_CONSTANT, BUILDINFO) VALUES (?, ?)",
        params![MAGIC_CONSTANT, build_info],
    )?;
    Ok(())
}

fn verify_header(conn: &Connection, build_info: &str, ignore_version: bool) -> Result<()> {
    let row: Option<(i64, String)> = conn
        .query_row("SELECT MAGIC_CONSTANT, BUILDINFO FROM HEADER", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()?;
    if let Some((magic, stored_build)) = row {
        assert!(magic == MAGIC_CONSTANT, "not a dependency database");
        assert!(
            ignore_version || stored_build == build_info,
            "dependency database was written by build {stored_build:?}"
        );
    }
    Ok(())
}

fn decode_blob(blob: &[u8]) -> Vec<u32> {
    assert!(blob.len() % 4 == 0, "malformed adjacency blob");
    blob.chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

impl SharedMem {
    /// Write every in-memory edge to a fresh database at `path`. Returns
    /// the number of edges written. With `replace`, the new database
    /// becomes the attached one: the connection is kept, the in-memory
    /// tables are cleared, and the path is published to the workers.
    pub fn save_dep_table(&self, path: &Path, build_info: &str, replace: bool) -> Result<usize> {
        self.assert_master();
        let conn = Connection::open(path)?;
        self.save_deps_into(conn, path, build_info, replace, false)
    }

    /// Like [`save_dep_table`](SharedMem::save_dep_table), but merges each
    /// key's new edges in front of the blob already stored for it. Edges
    /// the filter has not seen this run are *not* deduplicated against
    /// rows persisted by earlier runs; the blob is a multiset.
    pub fn update_dep_table(&self, path: &Path, build_info: &str, replace: bool) -> Result<usize> {
        self.assert_master();
        let conn = Connection::open(path)?;
        self.save_deps_into(conn, path, build_info, replace, true)
    }

    fn save_deps_into(
        &self,
        mut conn: Connection,
        path: &Path,
        build_info: &str,
        replace: bool,
        is_update: bool,
    ) -> Result<usize> {
        let start = Instant::now();
        create_tables(&conn)?;
        write_header(&conn, build_info)?;
        // Hand writes to the OS and keep the journal off disk; a torn
        // save is rebuilt from scratch anyway.
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.pragma_update(None, "journal_mode", "MEMORY")?;

        let mut edges_added = 0usize;
        let mut new_rows = 0usize;
        let mut updated_rows = 0usize;

        let tx = conn.transaction()?;
        {
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO DEPTABLE (KEY_VERTEX, VALUE_VERTEX) VALUES (?, ?)",
            )?;
            let mut select = if is_update {
                Some(tx.prepare("SELECT VALUE_VERTEX FROM DEPTABLE WHERE KEY_VERTEX = ?")?)
            } else {
                None
            };

            self.deps().for_each_head(|key, values| {
                let existing: Option<Vec<u8>> = match select.as_mut() {
                    Some(stmt) => stmt
                        .query_row(params![key], |row| row.get(0))
                        .optional()?,
                    None => None,
                };

                let mut blob = Vec::with_capacity(
                    values.len() * 4 + existing.as_ref().map_or(0, Vec::len),
                );
                for v in values {
                    blob.extend_from_slice(&v.to_le_bytes());
                }
                match existing {
                    Some(old) => {
                        blob.extend_from_slice(&old);
                        updated_rows += 1;
                    }
                    None => new_rows += 1,
                }

                insert.execute(params![key, blob])?;
                edges_added += values.len();
                Ok(())
            })?;
        }
        tx.commit()?;

        info!(
            "saved the dependency table to {}: {} new rows, {} updated, {} edges in {:?}",
            path.display(),
            new_rows,
            updated_rows,
            edges_added,
            start.elapsed()
        );

        if replace {
            *self.dep_db.lock() = Some(conn);
            self.deps().clear();
            self.set_db_path(path);
        }
        Ok(edges_added)
    }

    /// Attach an existing dependency database. Master-only; verifies the
    /// header and publishes the path so workers can connect lazily.
    pub fn load_dep_table(&self, path: &Path, build_info: &str, ignore_version: bool) -> Result<()> {
        self.assert_master();
        let start = Instant::now();
        self.set_db_path(path);

        // Read-only so a missing file errors here instead of materializing
        // an empty database.
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        verify_header(&conn, build_info, ignore_version)?;
        *self.dep_db.lock() = Some(conn);

        info!(
            "attached dependency database {} in {:?}",
            path.display(),
            start.elapsed()
        );
        Ok(())
    }

    /// Successors of `key` according to the attached database. Empty when
    /// no database is attached. Workers connect on first use.
    pub fn get_edges_persistent(&self, key: u32) -> Result<Vec<u32>> {
        assert!(key < 1 << 31, "dependency nodes must be 31-bit integers");
        let Some(path) = self.attached_db_path() else {
            return Ok(Vec::new());
        };

        let mut guard = self.dep_db.lock();
        if guard.is_none() {
            // The master acquires its connection at load/save time; a lazy
            // open here means we are a worker that has not read from the
            // database yet.
            self.assert_not_master();
            *guard = Some(Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY,
            )?);
        }
        let conn = guard.as_ref().expect("connection was just opened");

        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT VALUE_VERTEX FROM DEPTABLE WHERE KEY_VERTEX = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.as_deref().map(decode_blob).unwrap_or_default())
    }

    /// Path of the attached dependency database, from the filename page.
    pub fn attached_db_path(&self) -> Option<PathBuf> {
        use std::os::unix::ffi::OsStrExt;

        let page = self.filename_page();
        let bytes = unsafe {
            let len = (0..PAGE_SIZE)
                .find(|&i| *page.add(i) == 0)
                .expect("filename page is not NUL-terminated");
            std::slice::from_raw_parts(page, len)
        };
        if bytes.is_empty() {
            None
        } else {
            Some(PathBuf::from(std::ffi::OsStr::from_bytes(bytes)))
        }
    }

    /// Forget the attached database, e.g. when falling back from a saved
    /// state to a fresh run. Master-only.
    pub fn clear_db_path(&self) {
        self.assert_master();
        unsafe {
            *self.filename_page() = 0;
        }
    }

    fn set_db_path(&self, path: &Path) {
        use std::os::unix::ffi::OsStrExt;

        let bytes = path.as_os_str().as_bytes();
        assert!(
            bytes.len() < PAGE_SIZE,
            "dependency database path does not fit the filename page"
        );
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.filename_page(), bytes.len());
            *self.filename_page().add(bytes.len()) = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn save_writes_header_and_decodable_rows() {
        let r = test_util::small_region();
        let deps = r.mem.deps();
        deps.add_edge(1, 2).unwrap();
        deps.add_edge(1, 3).unwrap();
        deps.add_edge(200, 4).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.sql");
        let edges = r.mem.save_dep_table(&path, "build-abc", false).unwrap();
        assert_eq!(edges, 3);

        // Inspect the file with a plain connection.
        let conn = Connection::open(&path).unwrap();
        let (magic, build): (i64, String) = conn
            .query_row("SELECT MAGIC_CONSTANT, BUILDINFO FROM HEADER", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(magic, MAGIC_CONSTANT);
        assert_eq!(build, "build-abc");

        let blob: Vec<u8> = conn
            .query_row(
                "SELECT VALUE_VERTEX FROM DEPTABLE WHERE KEY_VERTEX = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let mut values = decode_blob(&blob);
        values.sort_unstable();
        assert_eq!(values, vec![2, 3]);
    }

    #[test]
    fn replace_hands_the_table_off_to_the_database() {
        let r = test_util::small_region();
        let deps = r.mem.deps();
        deps.add_edge(7, 42).unwrap();
        deps.add_edge(7, 43).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.sql");
        r.mem.save_dep_table(&path, "build-abc", true).unwrap();

        // The in-memory table was handed off...
        assert_eq!(deps.edge_count(), 0);
        assert_eq!(deps.get_edges(7).unwrap(), Vec::<u32>::new());
        assert_eq!(r.mem.attached_db_path().unwrap(), path);

        // ...and the edges now come from the database.
        let mut values = r.mem.get_edges_persistent(7).unwrap();
        values.sort_unstable();
        assert_eq!(values, vec![42, 43]);
        assert_eq!(r.mem.get_edges_persistent(8).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn update_merges_new_edges_in_front_of_stored_ones() {
        let r = test_util::small_region();
        let deps = r.mem.deps();
        deps.add_edge(1, 2).unwrap();
        deps.add_edge(1, 3).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.sql");
        r.mem.save_dep_table(&path, "build-abc", true).unwrap();

        // A later phase records one more edge and merges it in.
        deps.add_edge(1, 4).unwrap();
        let edges = r.mem.update_dep_table(&path, "build-abc", false).unwrap();
        assert_eq!(edges, 1);

        let values = r.mem.get_edges_persistent(1).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], 4); // new edges lead the blob
        let mut sorted = values.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![2, 3, 4]);
    }

    #[test]
    fn load_accepts_a_matching_header() {
        let r = test_util::small_region();
        r.mem.deps().add_edge(5, 6).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.sql");
        r.mem.save_dep_table(&path, "build-abc", false).unwrap();
        assert!(r.mem.attached_db_path().is_none());

        r.mem.load_dep_table(&path, "build-abc", false).unwrap();
        assert_eq!(r.mem.attached_db_path().unwrap(), path);
        assert_eq!(r.mem.get_edges_persistent(5).unwrap(), vec![6]);

        r.mem.clear_db_path();
        assert!(r.mem.attached_db_path().is_none());
    }

    #[test]
    #[should_panic(expected = "written by build")]
    fn load_rejects_a_foreign_build() {
        let r = test_util::small_region();
        r.mem.deps().add_edge(5, 6).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.sql");
        r.mem.save_dep_table(&path, "build-abc", false).unwrap();
        let _ = r.mem.load_dep_table(&path, "build-xyz", false);
    }

    #[test]
    fn load_ignoring_version_accepts_any_build() {
        let r = test_util::small_region();
        r.mem.deps().add_edge(5, 6).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deps.sql");
        r.mem.save_dep_table(&path, "build-abc", false).unwrap();
        r.mem.load_dep_table(&path, "build-xyz", true).unwrap();
        assert_eq!(r.mem.get_edges_persistent(5).unwrap(), vec![6]);
    }

    #[test]
    fn missing_database_reads_as_empty() {
        let r = test_util::small_region();
        assert_eq!(r.mem.get_edges_persistent(1).unwrap(), Vec::<u32>::new());
    }
}
