//! Persistent index of mirrored paths and their content fingerprints.
//!
//! Three tables: `roots` holds the monitored directories, `files` holds one
//! row per known path keyed by (parent, name), `fingerprints` holds the
//! deduplicated (crc, ed2k) pairs. A directory row is encoded as `mtime = 0`;
//! a file row carries its last observed mtime and either a fingerprint id or
//! `0` for "not hashed yet".
//!
//! Every public operation is atomic. Several connections to the same index
//! file may be open at once (the coordinator and the hasher each own one);
//! a busy timeout makes concurrent writers wait instead of failing.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::Duration,
};

use rusqlite::{params, Connection, OptionalExtension};

use crate::{Error, Result};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS roots (
        path TEXT NOT NULL PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS fingerprints (
        id INTEGER PRIMARY KEY,
        crc TEXT NOT NULL,
        ed2k TEXT NOT NULL,
        UNIQUE (crc, ed2k)
    );
    CREATE TABLE IF NOT EXISTS files (
        parent TEXT NOT NULL,
        name TEXT NOT NULL,
        mtime INTEGER NOT NULL,
        fingerprint_id INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (parent, name)
    );
";

/// One connection to the index store.
pub struct Database {
    conn: Connection,
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn split_path(path: &Path) -> (String, String) {
    let parent = path.parent().map(path_str).unwrap_or_default();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (parent, name)
}

fn subtree_pattern(path: &str) -> String {
    format!("{}/%", path)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Database {
    /// Open (creating if needed) the index at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::setup(Connection::open(path)?)
    }

    /// Open a throwaway in-memory index.
    pub fn open_in_memory() -> Result<Self> {
        Self::setup(Connection::open_in_memory()?)
    }

    fn setup(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Register a new root. An already registered root is an error.
    pub fn add_root(&self, path: &Path) -> Result<()> {
        match self.conn.execute(
            "INSERT INTO roots (path) VALUES (?1)",
            params![path_str(path)],
        ) {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(Error::DuplicateRoot(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// List every registered root.
    pub fn list_roots(&self) -> Result<Vec<PathBuf>> {
        let mut stmt = self.conn.prepare("SELECT path FROM roots")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut roots = Vec::new();
        for row in rows {
            roots.push(PathBuf::from(row?));
        }
        Ok(roots)
    }

    /// Test whether `path` is a registered root.
    pub fn is_root(&self, path: &Path) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT path FROM roots WHERE path = ?1",
                params![path_str(path)],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Fetch the stored mtime of `path` (`0` means it is a directory).
    pub fn get(&self, path: &Path) -> Result<Option<i64>> {
        let (parent, name) = split_path(path);
        Ok(self
            .conn
            .query_row(
                "SELECT mtime FROM files WHERE parent = ?1 AND name = ?2",
                params![parent, name],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// List the direct children of `parent`: files with their mtimes, and the
    /// set of directory names.
    pub fn list_children(&self, parent: &Path) -> Result<(HashMap<String, i64>, HashSet<String>)> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, mtime FROM files WHERE parent = ?1")?;
        let rows = stmt.query_map(params![path_str(parent)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut files = HashMap::new();
        let mut dirs = HashSet::new();
        for row in rows {
            let (name, mtime) = row?;
            if mtime == 0 {
                dirs.insert(name);
            } else {
                files.insert(name, mtime);
            }
        }
        Ok((files, dirs))
    }

    /// Insert a new file row.
    pub fn insert_file(&self, path: &Path, mtime: i64) -> Result<()> {
        let (parent, name) = split_path(path);
        self.conn.execute(
            "INSERT INTO files (parent, name, mtime, fingerprint_id) VALUES (?1, ?2, ?3, 0)",
            params![parent, name, mtime],
        )?;
        Ok(())
    }

    /// Insert a new directory row.
    pub fn insert_dir(&self, path: &Path) -> Result<()> {
        self.insert_file(path, 0)
    }

    /// Insert a batch of files under one parent.
    pub fn insert_files(&self, parent: &Path, files: &[(String, i64)]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let parent = path_str(parent);
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO files (parent, name, mtime, fingerprint_id) VALUES (?1, ?2, ?3, 0)",
            )?;
            for (name, mtime) in files {
                stmt.execute(params![parent, name, mtime])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert a batch of directories under one parent.
    pub fn insert_dirs(&self, parent: &Path, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let parent = path_str(parent);
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO files (parent, name, mtime, fingerprint_id) VALUES (?1, ?2, 0, 0)",
            )?;
            for name in names {
                stmt.execute(params![parent, name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Update the mtime of a file. Any fingerprint link is reset: a modified
    /// file must be hashed again.
    pub fn update_file(&self, path: &Path, mtime: i64) -> Result<()> {
        let (parent, name) = split_path(path);
        self.conn.execute(
            "UPDATE files SET mtime = ?1, fingerprint_id = 0 WHERE parent = ?2 AND name = ?3",
            params![mtime, parent, name],
        )?;
        Ok(())
    }

    /// Update a batch of file mtimes under one parent, resetting their
    /// fingerprint links.
    pub fn update_files(&self, parent: &Path, files: &[(String, i64)]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let parent = path_str(parent);
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE files SET mtime = ?1, fingerprint_id = 0 WHERE parent = ?2 AND name = ?3",
            )?;
            for (name, mtime) in files {
                stmt.execute(params![mtime, parent, name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete the row for `path` alone.
    pub fn delete_single(&self, path: &Path) -> Result<()> {
        let (parent, name) = split_path(path);
        self.conn.execute(
            "DELETE FROM files WHERE parent = ?1 AND name = ?2",
            params![parent, name],
        )?;
        Ok(())
    }

    /// Delete a batch of rows under one parent.
    pub fn delete_singles(&self, parent: &Path, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let parent = path_str(parent);
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM files WHERE parent = ?1 AND name = ?2")?;
            for name in names {
                stmt.execute(params![parent, name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete the row for `path` and every row below it.
    pub fn delete_subtree(&self, path: &Path) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        delete_subtree_on(&tx, path)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a batch of subtrees rooted under one parent.
    pub fn delete_subtrees(&self, parent: &Path, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        for name in names {
            delete_subtree_on(&tx, &parent.join(name))?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Rename a single row.
    pub fn move_single(&self, old: &Path, new: &Path) -> Result<()> {
        let (old_parent, old_name) = split_path(old);
        let (new_parent, new_name) = split_path(new);
        self.conn.execute(
            "UPDATE files SET parent = ?1, name = ?2 WHERE parent = ?3 AND name = ?4",
            params![new_parent, new_name, old_parent, old_name],
        )?;
        Ok(())
    }

    /// Rename a subtree: the row for `old` itself plus the parent prefix of
    /// every descendant row.
    pub fn move_subtree(&self, old: &Path, new: &Path) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let (old_parent, old_name) = split_path(old);
        let (new_parent, new_name) = split_path(new);
        tx.execute(
            "UPDATE files SET parent = ?1, name = ?2 WHERE parent = ?3 AND name = ?4",
            params![new_parent, new_name, old_parent, old_name],
        )?;
        let old = path_str(old);
        let new = path_str(new);
        tx.execute(
            "UPDATE files SET parent = ?1 || substr(parent, length(?2) + 1)
             WHERE parent = ?2 OR parent LIKE ?3",
            params![new, old, subtree_pattern(&old)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Insert a fingerprint, returning its id. If the (crc, ed2k) pair is
    /// already stored (possibly inserted concurrently), the existing id is
    /// returned instead.
    pub fn upsert_fingerprint(&self, crc: &str, ed2k: &str) -> Result<i64> {
        match self.conn.execute(
            "INSERT INTO fingerprints (crc, ed2k) VALUES (?1, ?2)",
            params![crc, ed2k],
        ) {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Ok(self.conn.query_row(
                "SELECT id FROM fingerprints WHERE crc = ?1 AND ed2k = ?2",
                params![crc, ed2k],
                |row| row.get(0),
            )?),
            Err(e) => Err(e.into()),
        }
    }

    /// Link a path to a fingerprint row. Returns the number of rows affected:
    /// zero means the row vanished in the meantime, which is not an error.
    pub fn link(&self, path: &Path, fingerprint_id: i64) -> Result<usize> {
        let (parent, name) = split_path(path);
        Ok(self.conn.execute(
            "UPDATE files SET fingerprint_id = ?1 WHERE parent = ?2 AND name = ?3",
            params![fingerprint_id, parent, name],
        )?)
    }

    /// Return up to `limit` file paths that have no fingerprint yet.
    pub fn pending_hash_batch(&self, limit: usize) -> Result<Vec<PathBuf>> {
        let mut stmt = self.conn.prepare(
            "SELECT parent, name FROM files
             WHERE fingerprint_id = 0 AND mtime != 0 LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut paths = Vec::new();
        for row in rows {
            let (parent, name) = row?;
            paths.push(PathBuf::from(parent).join(name));
        }
        Ok(paths)
    }

    /// Fetch the fingerprint linked to a file, if it has been hashed.
    pub fn fingerprint_for(&self, path: &Path) -> Result<Option<(String, String)>> {
        let (parent, name) = split_path(path);
        Ok(self
            .conn
            .query_row(
                "SELECT h.crc, h.ed2k FROM files f
                 JOIN fingerprints h ON f.fingerprint_id = h.id
                 WHERE f.parent = ?1 AND f.name = ?2",
                params![parent, name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// Full path→mtime view of the files table.
    #[cfg(test)]
    pub(crate) fn dump(&self) -> Result<HashMap<String, i64>> {
        let mut stmt = self.conn.prepare("SELECT parent, name, mtime FROM files")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut content = HashMap::new();
        for row in rows {
            let (parent, name, mtime) = row?;
            content.insert(path_str(&PathBuf::from(parent).join(name)), mtime);
        }
        Ok(content)
    }
}

fn delete_subtree_on(conn: &Connection, path: &Path) -> rusqlite::Result<()> {
    let p = path_str(path);
    conn.execute(
        "DELETE FROM files WHERE parent = ?1 OR parent LIKE ?2",
        params![p, subtree_pattern(&p)],
    )?;
    let (parent, name) = split_path(path);
    conn.execute(
        "DELETE FROM files WHERE parent = ?1 AND name = ?2",
        params![parent, name],
    )?;
    Ok(())
}
