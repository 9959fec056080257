//! Inotify event demultiplexer.
//!
//! Translates raw inotify events into the normalized [`FsEvent`] stream the
//! coordinator consumes. Watches are added non-recursively by the kernel, so
//! the demultiplexer walks new subtrees itself; auto-add stays off because
//! `mkdir -p a/b/c` races the watch installation and the scanner is the one
//! that reconciles whatever was missed.
//!
//! Renames need a heuristic: the kernel tags both ends of a move with a
//! cookie, but a move out of the watched area only ever produces the "moved
//! from" half. Each "moved from" therefore parks in a pending-move table and
//! schedules its own deletion; a matching "moved to" within the resolution
//! window upgrades the pair to a move, otherwise the timeout concludes the
//! path is gone.

use std::{
    collections::HashMap,
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use inotify::{Event, EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use tracing::{error, warn};
use walkdir::WalkDir;

use crate::{scheduler::Scheduler, Error, Result};

/// Normalized filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    /// A file was written and closed.
    Modified(PathBuf),
    /// A directory appeared and is now watched; its content is unknown.
    NewDir(PathBuf),
    /// A file is gone.
    RemoveFile(PathBuf),
    /// A directory and everything below it is gone.
    RemoveDir(PathBuf),
    /// A file moved between two watched places.
    MoveFile { src: PathBuf, dst: PathBuf },
    /// A directory moved between two watched places.
    MoveDir { src: PathBuf, dst: PathBuf },
    /// The watcher hit a fatal condition and stopped.
    Die(DieReason),
    /// Control sentinel used to wake the coordinator loop on shutdown.
    Shutdown,
}

impl FsEvent {
    /// Path fields carried by the event.
    pub(crate) fn paths(&self) -> Vec<&PathBuf> {
        match self {
            FsEvent::Modified(p)
            | FsEvent::NewDir(p)
            | FsEvent::RemoveFile(p)
            | FsEvent::RemoveDir(p) => vec![p],
            FsEvent::MoveFile { src, dst } | FsEvent::MoveDir { src, dst } => vec![src, dst],
            FsEvent::Die(_) | FsEvent::Shutdown => vec![],
        }
    }
}

/// Why the watcher stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DieReason {
    /// The kernel event queue overflowed; events were lost.
    QueueOverflow,
    /// The filesystem holding a watched tree was unmounted.
    Unmount,
    /// A watched root was deleted.
    RootDeleted(PathBuf),
    /// A watched root was moved away.
    RootMoved(PathBuf),
}

fn dir_mask() -> WatchMask {
    WatchMask::CLOSE_WRITE
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
}

fn root_mask() -> WatchMask {
    dir_mask() | WatchMask::DELETE_SELF | WatchMask::MOVE_SELF
}

/// Watches a set of root directories and emits [`FsEvent`]s on a channel.
///
/// The kernel delivery thread and the deferred-deletion scheduler run inside;
/// both stop on [`InotifyWatcher::stop`] or when a fatal event turns into
/// [`FsEvent::Die`].
pub struct InotifyWatcher {
    shared: Arc<WatchShared>,
    inotify: Mutex<Option<Inotify>>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
    started: AtomicBool,
}

struct WatchShared {
    watches: Mutex<Watches>,
    wd_map: Mutex<WdMap>,
    moves: Mutex<HashMap<u32, PendingMove>>,
    scheduler: Scheduler<u32>,
    events: Mutex<Sender<FsEvent>>,
    delay: Duration,
    stopped: AtomicBool,
}

/// Both directions of the path/descriptor association, kept consistent.
#[derive(Default)]
struct WdMap {
    by_path: HashMap<PathBuf, WatchDescriptor>,
    by_wd: HashMap<WatchDescriptor, PathBuf>,
}

struct PendingMove {
    path: PathBuf,
    is_dir: bool,
}

impl WdMap {
    fn insert(&mut self, path: PathBuf, wd: WatchDescriptor) {
        self.by_wd.insert(wd.clone(), path.clone());
        self.by_path.insert(path, wd);
    }

    fn path_for(&self, wd: &WatchDescriptor) -> Option<PathBuf> {
        self.by_wd.get(wd).cloned()
    }

    fn remove_wd(&mut self, wd: &WatchDescriptor) -> Option<PathBuf> {
        let path = self.by_wd.remove(wd)?;
        self.by_path.remove(&path);
        Some(path)
    }

    fn detach_prefix(&mut self, prefix: &Path) -> Vec<(PathBuf, WatchDescriptor)> {
        let paths: Vec<PathBuf> = self
            .by_path
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        paths
            .into_iter()
            .filter_map(|p| {
                let wd = self.by_path.remove(&p)?;
                self.by_wd.remove(&wd);
                Some((p, wd))
            })
            .collect()
    }
}

impl InotifyWatcher {
    /// Create a watcher emitting on `events`. `delay` is the move-resolution
    /// window: how long a "moved from" may wait for its matching "moved to"
    /// before the source is declared deleted.
    pub fn new(events: Sender<FsEvent>, delay: Duration) -> Result<Self> {
        let inotify = Inotify::init()?;
        let watches = inotify.watches();
        Ok(Self {
            shared: Arc::new(WatchShared {
                watches: Mutex::new(watches),
                wd_map: Mutex::new(WdMap::default()),
                moves: Mutex::new(HashMap::new()),
                scheduler: Scheduler::new(),
                events: Mutex::new(events),
                delay,
                stopped: AtomicBool::new(false),
            }),
            inotify: Mutex::new(Some(inotify)),
            reader: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Start the scheduler and the kernel delivery thread. Must not race
    /// [`InotifyWatcher::add`]; starting twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.scheduler.start();
        let inotify = self.inotify.lock().unwrap().take();
        if let Some(inotify) = inotify {
            let shared = Arc::clone(&self.shared);
            *self.reader.lock().unwrap() = Some(thread::spawn(move || read_loop(inotify, shared)));
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Watch `root` and its whole subtree. The root itself gets the extended
    /// mask so that losing it is reported as fatal.
    pub fn add(&self, root: &Path) -> Result<()> {
        if !root.is_dir() {
            return Err(Error::NotADirectory(root.display().to_string()));
        }
        self.shared.watch_tree(root, true)
    }

    /// Stop both internal threads and join them. Events already queued stay
    /// in the channel; later kernel events are dropped. Idempotent.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.scheduler.stop();
        // Nudge the delivery thread out of its blocking read: adding and
        // removing a watch makes the kernel queue an IGNORED event.
        {
            let mut watches = self.shared.watches.lock().unwrap();
            if let Ok(wd) = watches.add("/", WatchMask::DELETE_SELF) {
                let _ = watches.remove(wd);
            }
        }
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl WatchShared {
    fn emit(&self, event: FsEvent) {
        let _ = self.events.lock().unwrap().send(event);
    }

    fn die(&self, reason: DieReason) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(reason = ?reason, "fatal watch event, stopping watcher");
        self.emit(FsEvent::Die(reason));
        self.scheduler.stop();
    }

    /// Add watches for `top` and every directory below it. Any failure is
    /// reported as an error; watches already added stay and are reclaimed via
    /// IGNORED notifications once their directories go away.
    fn watch_tree(&self, top: &Path, root: bool) -> Result<()> {
        let mut map = self.wd_map.lock().unwrap();
        let mask = if root { root_mask() } else { dir_mask() };
        let wd = self.watches.lock().unwrap().add(top, mask)?;
        map.insert(top.to_path_buf(), wd);
        for entry in WalkDir::new(top).follow_links(false).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let e = e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk failed"));
                    return Err(e.into());
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let wd = self.watches.lock().unwrap().add(entry.path(), dir_mask())?;
            map.insert(entry.into_path(), wd);
        }
        Ok(())
    }
}

fn read_loop(mut inotify: Inotify, shared: Arc<WatchShared>) {
    let mut buffer = [0u8; 4096];
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        let events = match inotify.read_events_blocking(&mut buffer) {
            Ok(events) => events,
            Err(e) => {
                if !shared.stopped.load(Ordering::SeqCst) {
                    error!(error = %e, "reading inotify events failed");
                }
                break;
            }
        };
        for event in events {
            if shared.stopped.load(Ordering::SeqCst) {
                return;
            }
            handle_event(&shared, event);
        }
    }
}

fn handle_event(shared: &Arc<WatchShared>, event: Event<&OsStr>) {
    let mask = event.mask;
    if mask.contains(EventMask::Q_OVERFLOW) {
        shared.die(DieReason::QueueOverflow);
        return;
    }
    if mask.contains(EventMask::UNMOUNT) {
        shared.die(DieReason::Unmount);
        return;
    }
    if mask.contains(EventMask::IGNORED) {
        // The kernel dropped this watch (the directory is gone, or we
        // removed it); forget the bookkeeping entry.
        let removed = shared.wd_map.lock().unwrap().remove_wd(&event.wd);
        if removed.is_none() {
            warn!("ignored notification for an unknown watch descriptor");
        }
        return;
    }

    let base = match shared.wd_map.lock().unwrap().path_for(&event.wd) {
        Some(base) => base,
        None => {
            warn!(mask = ?mask, "event for an unknown watch descriptor");
            return;
        }
    };
    let path = match event.name {
        Some(name) => base.join(name),
        None => base,
    };
    let is_dir = mask.contains(EventMask::ISDIR);

    if mask.contains(EventMask::DELETE_SELF) {
        // Only roots subscribe to self events.
        shared.die(DieReason::RootDeleted(path));
    } else if mask.contains(EventMask::MOVE_SELF) {
        shared.die(DieReason::RootMoved(path));
    } else if mask.contains(EventMask::CLOSE_WRITE) {
        shared.emit(FsEvent::Modified(path));
    } else if mask.contains(EventMask::CREATE) {
        // A created file surfaces through its close-after-write; a created
        // directory must be watched right away.
        if is_dir {
            add_watched_dir(shared, path);
        }
    } else if mask.contains(EventMask::DELETE) {
        if is_dir {
            shared.emit(FsEvent::RemoveDir(path));
        } else {
            shared.emit(FsEvent::RemoveFile(path));
        }
    } else if mask.contains(EventMask::MOVED_FROM) {
        let cookie = event.cookie;
        let mut moves = shared.moves.lock().unwrap();
        moves.insert(cookie, PendingMove { path, is_dir });
        let weak = Arc::downgrade(shared);
        let scheduled = shared.scheduler.add(shared.delay, cookie, move || {
            if let Some(shared) = weak.upgrade() {
                deferred_delete(&shared, cookie);
            }
        });
        if let Err(e) = scheduled {
            warn!(cookie, error = %e, "could not schedule deferred deletion");
        }
    } else if mask.contains(EventMask::MOVED_TO) {
        shared.scheduler.cancel(&event.cookie);
        let pending = shared.moves.lock().unwrap().remove(&event.cookie);
        match pending {
            Some(pending) => {
                // Both ends seen: a rename within the watched area.
                if is_dir {
                    shared.emit(FsEvent::MoveDir {
                        src: pending.path,
                        dst: path,
                    });
                } else {
                    shared.emit(FsEvent::MoveFile {
                        src: pending.path,
                        dst: path,
                    });
                }
            }
            None => {
                // Moved in from outside: plain new content.
                if is_dir {
                    add_watched_dir(shared, path);
                } else {
                    shared.emit(FsEvent::Modified(path));
                }
            }
        }
    } else {
        warn!(path = %path.display(), mask = ?mask, "unexpected inotify event");
    }
}

/// Watch a freshly appeared directory tree, then announce it. If the tree
/// vanished before the watches could be added, only a warning remains; the
/// corresponding delete events tell the rest of the story.
fn add_watched_dir(shared: &Arc<WatchShared>, path: PathBuf) {
    match shared.watch_tree(&path, false) {
        Ok(()) => shared.emit(FsEvent::NewDir(path)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "transient path, could not watch");
        }
    }
}

/// Scheduler callback: the move-resolution window for `cookie` elapsed with
/// no matching "moved to", so the source path left the watched area.
fn deferred_delete(shared: &Arc<WatchShared>, cookie: u32) {
    let mut moves = shared.moves.lock().unwrap();
    let pending = match moves.remove(&cookie) {
        Some(pending) => pending,
        None => return,
    };
    if pending.is_dir {
        let detached = shared.wd_map.lock().unwrap().detach_prefix(&pending.path);
        for (path, wd) in detached {
            if let Err(e) = shared.watches.lock().unwrap().remove(wd) {
                // The IGNORED for this watch may already be queued.
                warn!(path = %path.display(), error = %e, "failed to detach watch");
            }
        }
        shared.emit(FsEvent::RemoveDir(pending.path));
    } else {
        shared.emit(FsEvent::RemoveFile(pending.path));
    }
}
