//! Scenarios for the normalized event stream, driven against real
//! directories through real inotify watches.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver},
    thread,
    time::Duration,
};

use mirroring::{DieReason, FsEvent, InotifyWatcher};
use tempfile::TempDir;

/// Time given to the kernel and the delivery thread to settle.
const SETTLE: Duration = Duration::from_millis(500);

/// Short move-resolution window so the deferred-delete tests stay fast.
const MOVE_WINDOW: Duration = Duration::from_millis(500);

struct Watch {
    watcher: InotifyWatcher,
    events: Receiver<FsEvent>,
    tree: TempDir,
}

impl Watch {
    fn new() -> Self {
        let (tx, events) = mpsc::channel();
        let watcher = InotifyWatcher::new(tx, MOVE_WINDOW).unwrap();
        watcher.start();
        Self {
            watcher,
            events,
            tree: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.tree.path().join(name)
    }

    fn next(&self) -> FsEvent {
        self.events
            .recv_timeout(Duration::from_secs(5))
            .expect("expected an event")
    }

    fn assert_quiet(&self) {
        if let Ok(event) = self.events.recv_timeout(Duration::from_millis(300)) {
            panic!("unexpected event: {:?}", event);
        }
    }
}

fn mkdir(path: &Path) {
    fs::create_dir(path).unwrap();
}

#[test]
fn file_creation_surfaces_as_modified() {
    let watch = Watch::new();
    watch.watcher.add(watch.tree.path()).unwrap();

    let file = watch.path("create_file");
    fs::write(&file, "test").unwrap();

    assert_eq!(watch.next(), FsEvent::Modified(file));
    watch.assert_quiet();
    watch.watcher.stop();
}

#[test]
fn create_then_remove_file() {
    let watch = Watch::new();
    watch.watcher.add(watch.tree.path()).unwrap();

    let file = watch.path("createremove_file");
    fs::write(&file, "test").unwrap();
    fs::remove_file(&file).unwrap();

    assert_eq!(watch.next(), FsEvent::Modified(file.clone()));
    assert_eq!(watch.next(), FsEvent::RemoveFile(file));
    watch.assert_quiet();
    watch.watcher.stop();
}

#[test]
fn new_dir_is_watched_immediately() {
    let watch = Watch::new();
    watch.watcher.add(watch.tree.path()).unwrap();

    let dir = watch.path("d");
    mkdir(&dir);
    assert_eq!(watch.next(), FsEvent::NewDir(dir.clone()));

    // Give the recursive watch time to land before touching the inside.
    thread::sleep(SETTLE);
    let file = dir.join("file");
    fs::write(&file, "test").unwrap();
    assert_eq!(watch.next(), FsEvent::Modified(file));
    watch.assert_quiet();
    watch.watcher.stop();
}

#[test]
fn create_then_remove_dir() {
    let watch = Watch::new();
    watch.watcher.add(watch.tree.path()).unwrap();

    let dir = watch.path("createremove_dir");
    mkdir(&dir);
    thread::sleep(SETTLE);
    fs::remove_dir(&dir).unwrap();

    assert_eq!(watch.next(), FsEvent::NewDir(dir.clone()));
    assert_eq!(watch.next(), FsEvent::RemoveDir(dir));
    watch.assert_quiet();
    watch.watcher.stop();
}

#[test]
fn file_move_between_watched_roots() {
    let watch = Watch::new();
    let root_1 = watch.path("root_1");
    let root_2 = watch.path("root_2");
    mkdir(&root_1);
    mkdir(&root_2);
    let src = root_1.join("file");
    let dst = root_2.join("file");
    fs::write(&src, "test").unwrap();

    watch.watcher.add(&root_1).unwrap();
    watch.watcher.add(&root_2).unwrap();
    fs::rename(&src, &dst).unwrap();

    assert_eq!(watch.next(), FsEvent::MoveFile { src, dst });
    watch.assert_quiet();
    watch.watcher.stop();
}

#[test]
fn dir_move_between_watched_roots() {
    let watch = Watch::new();
    let root_1 = watch.path("root_1");
    let root_2 = watch.path("root_2");
    mkdir(&root_1);
    mkdir(&root_2);
    let src = root_1.join("dir");
    mkdir(&src);
    fs::write(src.join("file"), "test").unwrap();
    let dst = root_2.join("dir");

    watch.watcher.add(&root_1).unwrap();
    watch.watcher.add(&root_2).unwrap();
    fs::rename(&src, &dst).unwrap();

    assert_eq!(watch.next(), FsEvent::MoveDir { src, dst });
    watch.assert_quiet();
    watch.watcher.stop();
}

#[test]
fn dir_moved_in_from_outside_is_new() {
    let watch = Watch::new();
    let outside = watch.path("outside");
    let root = watch.path("root");
    mkdir(&outside);
    mkdir(&root);
    let src = outside.join("dir");
    mkdir(&src);
    fs::write(src.join("file"), "test").unwrap();
    let dst = root.join("dir");

    watch.watcher.add(&root).unwrap();
    fs::rename(&src, &dst).unwrap();

    assert_eq!(watch.next(), FsEvent::NewDir(dst));
    watch.assert_quiet();
    watch.watcher.stop();
}

#[test]
fn dir_moved_out_becomes_remove_after_window() {
    let watch = Watch::new();
    let root = watch.path("root");
    let outside = watch.path("outside");
    mkdir(&root);
    mkdir(&outside);
    let src = root.join("dir");
    mkdir(&src);
    fs::write(src.join("file"), "test").unwrap();

    watch.watcher.add(&root).unwrap();
    fs::rename(&src, outside.join("dir")).unwrap();

    // Nothing may surface before the move-resolution window elapses.
    watch.assert_quiet();
    assert_eq!(watch.next(), FsEvent::RemoveDir(src));
    watch.assert_quiet();
    watch.watcher.stop();
}

#[test]
fn file_moved_out_becomes_remove_after_window() {
    let watch = Watch::new();
    let root = watch.path("root");
    let outside = watch.path("outside");
    mkdir(&root);
    mkdir(&outside);
    let src = root.join("file");
    fs::write(&src, "test").unwrap();

    watch.watcher.add(&root).unwrap();
    fs::rename(&src, outside.join("file")).unwrap();

    watch.assert_quiet();
    assert_eq!(watch.next(), FsEvent::RemoveFile(src));
    watch.watcher.stop();
}

#[test]
fn deleting_a_root_is_fatal() {
    let watch = Watch::new();
    let root = watch.path("root");
    mkdir(&root);
    watch.watcher.add(&root).unwrap();

    fs::remove_dir(&root).unwrap();

    assert_eq!(watch.next(), FsEvent::Die(DieReason::RootDeleted(root)));
    // The watcher is stopped: later kernel events no longer surface.
    watch.assert_quiet();
    watch.watcher.stop();
}

#[test]
fn moving_a_root_away_is_fatal() {
    let watch = Watch::new();
    let root = watch.path("root");
    mkdir(&root);
    watch.watcher.add(&root).unwrap();

    fs::rename(&root, watch.path("elsewhere")).unwrap();

    assert_eq!(watch.next(), FsEvent::Die(DieReason::RootMoved(root)));
    watch.assert_quiet();
    watch.watcher.stop();
}

#[test]
fn stop_is_idempotent() {
    let watch = Watch::new();
    watch.watcher.add(watch.tree.path()).unwrap();
    watch.watcher.stop();
    watch.watcher.stop();
}
