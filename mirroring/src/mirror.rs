//! Central coordinator.
//!
//! Owns the main loop: watch events and scanner passes are serialized under
//! one lock, so the index only ever has a single path-row writer at a time
//! (the hasher runs in parallel but only touches fingerprint links, which
//! tolerate losing the race). The tricky part is a subtree appearing while
//! the scanner is still walking it; scans therefore drain the event channel
//! afterwards and scan again whatever mutated under their feet.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use tracing::{error, instrument, warn};

use crate::{
    db::Database,
    hasher::{Hasher, DEFAULT_BATCH},
    scanner::Scanner,
    watch::{FsEvent, InotifyWatcher},
    Error, Result,
};

/// How long a "moved from" event waits for its matching "moved to".
pub const DEFAULT_MOVE_WINDOW: Duration = Duration::from_secs(2);

/// Keeps a persistent index in sync with a set of watched root directories.
///
/// `Mirror::start` spawns the coordinator thread; roots are registered with
/// [`Mirror::add_root`] and survive restarts in the index itself. The
/// instance must be stopped with [`Mirror::stop`].
pub struct Mirror {
    shared: Arc<MirrorShared>,
    events: Sender<FsEvent>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

struct MirrorShared {
    db_path: PathBuf,
    lock: Mutex<()>,
    end: AtomicBool,
    watcher: InotifyWatcher,
    hasher: Hasher,
}

impl Mirror {
    /// Start mirroring with the default move-resolution window and hash
    /// batch size.
    pub fn start<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        Self::start_with(db_path, DEFAULT_MOVE_WINDOW, DEFAULT_BATCH)
    }

    /// Start mirroring against the index at `db_path`.
    pub fn start_with<P: Into<PathBuf>>(
        db_path: P,
        move_window: Duration,
        hash_batch: usize,
    ) -> Result<Self> {
        let db_path = db_path.into();
        // Open before spawning so a broken index path fails loudly here.
        let db = Database::open(&db_path)?;
        let (tx, rx) = mpsc::channel();
        let watcher = InotifyWatcher::new(tx.clone(), move_window)?;
        let hasher = Hasher::new(&db_path, hash_batch);
        let shared = Arc::new(MirrorShared {
            db_path,
            lock: Mutex::new(()),
            end: AtomicBool::new(false),
            watcher,
            hasher,
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || run(&shared, &db, &rx))
        };
        Ok(Self {
            shared,
            events: tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Register a new root: persist it, watch it if the watcher is already
    /// up, and scan it into the index.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn add_root<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let _guard = self.shared.lock.lock().unwrap();
        if !path.is_dir() {
            return Err(Error::NotADirectory(path.display().to_string()));
        }
        let db = Database::open(&self.shared.db_path)?;
        db.add_root(path)?;
        if self.shared.watcher.started() {
            self.shared.watcher.add(path)?;
        }
        Scanner::new(&db).scan(path)?;
        self.shared.hasher.notify();
        Ok(())
    }

    /// The index this mirror writes to.
    pub fn db_path(&self) -> &Path {
        &self.shared.db_path
    }

    /// Stop every worker and join the coordinator thread. Idempotent.
    pub fn stop(&self) {
        self.shared.end.store(true, Ordering::SeqCst);
        let _ = self.events.send(FsEvent::Shutdown);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: &MirrorShared, db: &Database, rx: &Receiver<FsEvent>) {
    {
        let _guard = shared.lock.lock().unwrap();
        shared.watcher.start();
        match db.list_roots() {
            Ok(roots) => {
                for root in &roots {
                    if !root.is_dir() {
                        warn!(root = %root.display(), "monitored root is missing");
                        continue;
                    }
                    if let Err(e) = shared.watcher.add(root) {
                        warn!(root = %root.display(), error = %e, "could not watch root");
                    }
                }
                // Scan every root, then drain whatever the watcher already
                // produced while the scans ran. The hasher drains everything
                // pending before its first wait, so the bootstrap scans need
                // no explicit wake.
                rescan(shared, db, rx, roots.into_iter().collect(), false);
                shared.hasher.start();
            }
            Err(e) => {
                error!(error = %e, "could not list monitored roots");
                shared.end.store(true, Ordering::SeqCst);
            }
        }
    }

    while !shared.end.load(Ordering::SeqCst) {
        let event = match rx.recv() {
            Ok(event) => event,
            Err(_) => break,
        };
        if shared.end.load(Ordering::SeqCst) {
            break;
        }
        let _guard = shared.lock.lock().unwrap();
        apply(shared, db, rx, event, true, None);
    }

    shared.watcher.stop();
    shared.hasher.stop();
}

/// Apply one normalized event to the index.
///
/// During a rescan, `rescan_into` collects the paths of nested `NewDir`
/// events instead of recursing immediately.
fn apply(
    shared: &MirrorShared,
    db: &Database,
    rx: &Receiver<FsEvent>,
    event: FsEvent,
    notify: bool,
    rescan_into: Option<&mut HashSet<PathBuf>>,
) {
    match event {
        FsEvent::Modified(path) => {
            if let Err(e) = Scanner::new(db).scan_file_only(&path) {
                warn!(path = %path.display(), error = %e, "file scan failed");
            }
            if notify {
                shared.hasher.notify();
            }
        }
        FsEvent::MoveDir { src, dst } => {
            if let Err(e) = db.move_subtree(&src, &dst) {
                warn!(src = %src.display(), dst = %dst.display(), error = %e, "subtree move failed");
            }
        }
        FsEvent::MoveFile { src, dst } => {
            if let Err(e) = db.move_single(&src, &dst) {
                warn!(src = %src.display(), dst = %dst.display(), error = %e, "file move failed");
            }
        }
        FsEvent::RemoveDir(path) => {
            if let Err(e) = db.delete_subtree(&path) {
                warn!(path = %path.display(), error = %e, "subtree removal failed");
            }
        }
        FsEvent::RemoveFile(path) => {
            if let Err(e) = db.delete_single(&path) {
                warn!(path = %path.display(), error = %e, "file removal failed");
            }
        }
        FsEvent::NewDir(path) => match rescan_into {
            Some(pending) => {
                pending.insert(path);
            }
            None => {
                let mut paths = HashSet::new();
                paths.insert(path);
                rescan(shared, db, rx, paths, notify);
            }
        },
        FsEvent::Die(reason) => {
            error!(reason = ?reason, "watcher died, shutting down");
            shared.end.store(true, Ordering::SeqCst);
        }
        FsEvent::Shutdown => {
            shared.end.store(true, Ordering::SeqCst);
        }
    }
}

/// Scan a set of paths, then drain the event channel: events touching a path
/// we just scanned are not replayed (the scan already saw their outcome) but
/// mark it for another pass, because the scan may equally have missed them.
/// Repeats until a pass completes with no concurrent mutations.
fn rescan(
    shared: &MirrorShared,
    db: &Database,
    rx: &Receiver<FsEvent>,
    mut paths: HashSet<PathBuf>,
    notify: bool,
) {
    let scanner = Scanner::new(db);
    loop {
        if shared.end.load(Ordering::SeqCst) {
            return;
        }
        for path in &paths {
            if let Err(e) = scanner.scan(path) {
                warn!(path = %path.display(), error = %e, "scan failed");
            }
        }
        let mut concurrent: HashSet<PathBuf> = HashSet::new();
        while let Ok(event) = rx.try_recv() {
            let touches_scanned = event
                .paths()
                .iter()
                .any(|p| paths.iter().any(|scanned| p.starts_with(scanned)));
            if touches_scanned {
                concurrent.extend(event.paths().into_iter().cloned());
            } else {
                apply(shared, db, rx, event, notify, Some(&mut concurrent));
            }
        }
        if concurrent.is_empty() {
            if notify {
                shared.hasher.notify();
            }
            return;
        }
        paths = concurrent;
    }
}
