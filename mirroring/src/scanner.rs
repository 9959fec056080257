//! Stat-based reconciliation of a filesystem subtree against the index.
//!
//! The scanner is used to bootstrap the index when a root is registered and
//! to repair drift after bursts of watch events. It must be the only writer
//! of path rows while it runs; the coordinator guarantees that by invoking it
//! under its serializing lock.

use std::{
    collections::HashSet,
    fs, io,
    path::Path,
    time::UNIX_EPOCH,
};

use tracing::warn;

use crate::{db::Database, Result};

/// Mtime in whole seconds, as stored in the index.
fn mtime_secs(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Reconciles paths with the index.
pub struct Scanner<'db> {
    db: &'db Database,
}

impl<'db> Scanner<'db> {
    pub fn new(db: &'db Database) -> Self {
        Self { db }
    }

    /// Reconcile `path`, whatever it currently is: a missing path purges its
    /// subtree from the index, a directory is walked and differenced against
    /// the stored rows, a file is stat'd and inserted or refreshed.
    pub fn scan(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            self.db.delete_subtree(path)?;
            return Ok(());
        }
        if path.is_dir() {
            self.scan_tree(path)
        } else {
            self.scan_file(path)
        }
    }

    /// Reconcile a path known to be file-level (from a "modified" event).
    /// Bails out early if the path turns out to be a directory.
    pub fn scan_file_only(&self, path: &Path) -> Result<()> {
        if path.is_dir() {
            return Ok(());
        }
        self.scan_file(path)
    }

    fn scan_file(&self, path: &Path) -> Result<()> {
        let mut row = self.db.get(path)?;
        if row == Some(0) {
            // Known as a directory before, clean the whole subtree out.
            self.db.delete_subtree(path)?;
            row = None;
        }
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.db.delete_single(path)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mtime = mtime_secs(&meta);
        match row {
            None => self.db.insert_file(path, mtime)?,
            Some(stored) if stored < mtime => self.db.update_file(path, mtime)?,
            Some(_) => (),
        }
        Ok(())
    }

    fn scan_tree(&self, path: &Path) -> Result<()> {
        match self.db.get(path)? {
            None => self.db.insert_dir(path)?,
            Some(0) => (),
            Some(_) => {
                // Known as a file before.
                self.db.delete_single(path)?;
                self.db.insert_dir(path)?;
            }
        }

        // Walk with an explicit stack. Entries are classified by what they
        // point at, so a symlink to a directory is recorded as a directory
        // like the top-level scan would record it; only real directories are
        // descended into.
        let mut stack = vec![path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "directory disappeared during scan");
                    continue;
                }
            };
            let mut new_dirs = HashSet::new();
            let mut new_files = HashSet::new();
            let mut descend = Vec::new();
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "unreadable directory entry");
                        continue;
                    }
                };
                let name = entry.file_name().to_string_lossy().into_owned();
                let is_dir = fs::metadata(dir.join(&name))
                    .map(|m| m.is_dir())
                    .unwrap_or(false);
                if is_dir {
                    if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                        descend.push(dir.join(&name));
                    }
                    new_dirs.insert(name);
                } else {
                    new_files.insert(name);
                }
            }

            let (old_files, old_dirs) = self.db.list_children(&dir)?;

            let gone_dirs: Vec<String> = old_dirs.difference(&new_dirs).cloned().collect();
            self.db.delete_subtrees(&dir, &gone_dirs)?;

            let gone_files: Vec<String> = old_files
                .keys()
                .filter(|name| !new_files.contains(*name))
                .cloned()
                .collect();
            self.db.delete_singles(&dir, &gone_files)?;

            let added_dirs: Vec<String> = new_dirs.difference(&old_dirs).cloned().collect();
            self.db.insert_dirs(&dir, &added_dirs)?;

            let mut inserts = Vec::new();
            let mut updates = Vec::new();
            for name in &new_files {
                let meta = match fs::metadata(dir.join(name)) {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(path = %dir.join(name).display(), error = %e, "file disappeared during scan");
                        continue;
                    }
                };
                let mtime = mtime_secs(&meta);
                match old_files.get(name) {
                    None => inserts.push((name.clone(), mtime)),
                    Some(&stored) if stored < mtime => updates.push((name.clone(), mtime)),
                    Some(_) => (),
                }
            }
            self.db.insert_files(&dir, &inserts)?;
            self.db.update_files(&dir, &updates)?;

            stack.extend(descend);
        }
        Ok(())
    }
}
