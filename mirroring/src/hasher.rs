//! Background worker that fingerprints files recorded in the index.
//!
//! The worker drains batches of not-yet-hashed rows, streams each file
//! through [`crate::fingerprint::crc_and_ed2k`] and links the resulting
//! fingerprint row back. It owns its own store connection and runs in
//! parallel with the coordinator; a row that is modified or removed while it
//! is being hashed simply makes the final link affect zero rows, and the file
//! is picked up again in a later batch.

use std::{
    path::PathBuf,
    sync::{Arc, Condvar, Mutex},
    thread,
};

use tracing::{error, trace, warn};

use crate::{db::Database, fingerprint};

/// How many un-fingerprinted rows are pulled per request.
pub const DEFAULT_BATCH: usize = 10;

/// Fingerprinting worker thread handle.
pub struct Hasher {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Shared {
    db_path: PathBuf,
    batch_size: usize,
    state: Mutex<State>,
    wakeup: Condvar,
}

struct State {
    end: bool,
    // Latched by notify so a wake that races the empty-batch check is kept.
    pending: bool,
}

impl Hasher {
    pub fn new<P: Into<PathBuf>>(db_path: P, batch_size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                db_path: db_path.into(),
                batch_size,
                state: Mutex::new(State {
                    end: false,
                    pending: false,
                }),
                wakeup: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Start the worker thread. Starting twice is a no-op.
    pub fn start(&self) {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *thread = Some(thread::spawn(move || shared.run()));
    }

    /// Wake the worker: new rows may be waiting. Edge-triggered, spurious
    /// calls are harmless.
    pub fn notify(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.pending = true;
        self.shared.wakeup.notify_all();
    }

    /// Stop the worker and join it. Safe to call more than once.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.end = true;
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Shared {
    fn ended(&self) -> bool {
        self.state.lock().unwrap().end
    }

    fn run(&self) {
        let db = match Database::open(&self.db_path) {
            Ok(db) => db,
            Err(e) => {
                error!(error = %e, "hasher could not open the index");
                return;
            }
        };
        loop {
            if self.ended() {
                break;
            }
            let batch = match db.pending_hash_batch(self.batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "failed to fetch files to hash");
                    break;
                }
            };
            for path in &batch {
                if self.ended() {
                    return;
                }
                match fingerprint::crc_and_ed2k(path) {
                    Ok((crc, ed2k)) => {
                        let linked = db
                            .upsert_fingerprint(&crc, &ed2k)
                            .and_then(|id| db.link(path, id));
                        match linked {
                            Ok(0) => {
                                trace!(path = %path.display(), "row vanished while hashing")
                            }
                            Ok(_) => trace!(path = %path.display(), %crc, %ed2k, "hashed"),
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "failed to store fingerprint")
                            }
                        }
                    }
                    Err(e) => {
                        // The next scan re-inserts the row if the file is
                        // actually still there.
                        warn!(path = %path.display(), error = %e, "unreadable file, dropping from index");
                        if let Err(e) = db.delete_subtree(path) {
                            warn!(path = %path.display(), error = %e, "failed to drop row");
                        }
                    }
                }
            }
            if batch.is_empty() {
                let mut state = self.state.lock().unwrap();
                while !state.pending && !state.end {
                    state = self.wakeup.wait(state).unwrap();
                }
                state.pending = false;
            }
        }
    }
}
